use thiserror::Error;

/// Why a single slot failed to produce an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no image payload at index {0}")]
    MissingPayload(usize),
}

impl GenerationError {
    /// Network or status failure, as opposed to a bad response body.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status { .. })
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AspectRatioError {
    #[error("aspect ratio must look like W/H: {0:?}")]
    Format(String),

    #[error("aspect ratio parts must be positive numbers: {0:?}")]
    Component(String),

    #[error("aspect ratio must lie between 1/{max} and {max}/1: {raw:?}")]
    Range { raw: String, max: u32 },
}

/// Why a gallery slot cannot serve an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageLookupError {
    #[error("batch {0} is no longer shown")]
    StaleBatch(u64),

    #[error("slot {0} not found")]
    MissingSlot(usize),

    #[error("slot {0} has no image")]
    NotReady(usize),

    #[error("slot {index} holds invalid image data: {reason}")]
    InvalidData { index: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("prompt is required")]
    EmptyPrompt,

    #[error("image count must be between 1 and {max}, got {count}")]
    Count { count: usize, max: usize },
}
