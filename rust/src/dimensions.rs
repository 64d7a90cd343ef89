use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::AspectRatioError;

/// Side lengths are snapped down to this multiple.
pub const DIMENSION_STEP: u32 = 16;

/// Widest accepted skew either way, so `64/1` and `1/64` are the extremes.
pub const MAX_RATIO_SKEW: u32 = 64;

const MAX_SNAPPED_SIDE: u32 = u32::MAX & !(DIMENSION_STEP - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// A parsed `W/H` ratio. Keeps the text it came from for display.
#[derive(Debug, Clone, PartialEq)]
pub struct AspectRatio {
    width: f64,
    height: f64,
    raw: String,
}

impl AspectRatio {
    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Output size whose area is roughly `base_size²`, proportional to the ratio.
    pub fn dimensions(&self, base_size: u32) -> Dimensions {
        // sqrt(w/h) keeps w*h out of the computation, which can overflow or vanish.
        let skew = (self.width / self.height).sqrt();
        let base = f64::from(base_size);
        Dimensions {
            width: snap_down(base * skew),
            height: snap_down(base / skew),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = AspectRatioError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let Some((w, h)) = trimmed.split_once('/') else {
            return Err(AspectRatioError::Format(raw.to_string()));
        };

        let width = parse_component(w, raw)?;
        let height = parse_component(h, raw)?;

        let quotient = width / height;
        let max = f64::from(MAX_RATIO_SKEW);
        if !quotient.is_finite() || quotient > max || quotient < 1.0 / max {
            return Err(AspectRatioError::Range {
                raw: raw.to_string(),
                max: MAX_RATIO_SKEW,
            });
        }

        Ok(Self {
            width,
            height,
            raw: format!("{}/{}", w.trim(), h.trim()),
        })
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parses `aspect_ratio` and derives its output size in one step.
pub fn image_dimensions(aspect_ratio: &str, base_size: u32) -> Result<Dimensions, AspectRatioError> {
    Ok(aspect_ratio.parse::<AspectRatio>()?.dimensions(base_size))
}

fn parse_component(part: &str, raw: &str) -> Result<f64, AspectRatioError> {
    part.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| AspectRatioError::Component(raw.to_string()))
}

fn snap_down(value: f64) -> u32 {
    let steps = (value / f64::from(DIMENSION_STEP)).floor();
    if steps.is_nan() || steps <= 0.0 {
        return 0;
    }
    let max_steps = f64::from(MAX_SNAPPED_SIDE / DIMENSION_STEP);
    (steps.min(max_steps) as u32) * DIMENSION_STEP
}
