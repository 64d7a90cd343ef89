use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::Serialize;

use crate::error::ImageLookupError;
use crate::orchestrator::GenerationOutcome;

pub const FAILED_STATUS_TEXT: &str = "Generation failed!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Loading,
    Ready { image_data: String, file_name: String },
    Failed { reason: String },
}

impl SlotState {
    fn is_settled(&self) -> bool {
        !matches!(self, Self::Loading)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub index: usize,
    pub state: &'static str,
    pub status_text: String,
    pub file_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GallerySnapshot {
    pub batch_id: u64,
    pub revision: u64,
    pub busy: bool,
    pub prompt: String,
    pub aspect_ratio: String,
    pub slots: Vec<SlotView>,
}

/// Tiles of the most recent batch, as the page should show them.
#[derive(Debug, Default)]
pub struct Gallery {
    batch_id: u64,
    revision: u64,
    busy: bool,
    prompt: String,
    aspect_ratio: String,
    started_millis: i64,
    slots: Vec<SlotState>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn slot(&self, index: usize) -> Option<&SlotState> {
        self.slots.get(index)
    }

    /// Replaces the previous tiles with `count` loading slots and returns the new batch id.
    pub fn begin_batch(&mut self, count: usize, prompt: &str, aspect_ratio: &str) -> Result<u64> {
        if self.busy {
            return Err(anyhow!("a batch is already generating"));
        }
        if count == 0 {
            return Err(anyhow!("batch needs at least one slot"));
        }

        self.batch_id += 1;
        self.busy = true;
        self.prompt = prompt.trim().to_string();
        self.aspect_ratio = aspect_ratio.trim().to_string();
        self.started_millis = Utc::now().timestamp_millis();
        self.slots = vec![SlotState::Loading; count];
        self.revision += 1;
        Ok(self.batch_id)
    }

    /// Writes one slot. Outcomes for another batch, an unknown slot or an
    /// already settled slot are dropped.
    pub fn apply_outcome(&mut self, batch_id: u64, index: usize, outcome: GenerationOutcome) -> bool {
        if batch_id != self.batch_id {
            return false;
        }
        let started_millis = self.started_millis;
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.is_settled() {
            return false;
        }

        *slot = match outcome {
            GenerationOutcome::Success { image_data } => SlotState::Ready {
                image_data,
                file_name: download_file_name(started_millis, index),
            },
            GenerationOutcome::Failure { reason } => SlotState::Failed { reason },
        };
        self.revision += 1;
        true
    }

    /// Re-enables submission. True only for the first call on the current batch.
    pub fn finish(&mut self, batch_id: u64) -> bool {
        if batch_id != self.batch_id || !self.busy {
            return false;
        }
        self.busy = false;
        self.revision += 1;
        true
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                SlotState::Loading => SlotView {
                    index,
                    state: "loading",
                    status_text: "Generating...".to_string(),
                    file_name: None,
                    error: None,
                },
                SlotState::Ready { file_name, .. } => SlotView {
                    index,
                    state: "ready",
                    status_text: String::new(),
                    file_name: Some(file_name.clone()),
                    error: None,
                },
                SlotState::Failed { reason } => SlotView {
                    index,
                    state: "error",
                    status_text: FAILED_STATUS_TEXT.to_string(),
                    file_name: None,
                    error: Some(reason.clone()),
                },
            })
            .collect();

        GallerySnapshot {
            batch_id: self.batch_id,
            revision: self.revision,
            busy: self.busy,
            prompt: self.prompt.clone(),
            aspect_ratio: self.aspect_ratio.clone(),
            slots,
        }
    }

    /// Decoded bytes and download name of a ready slot.
    pub fn image(&self, batch_id: u64, index: usize) -> Result<(Vec<u8>, String), ImageLookupError> {
        if batch_id != self.batch_id {
            return Err(ImageLookupError::StaleBatch(batch_id));
        }
        match self.slots.get(index) {
            Some(SlotState::Ready {
                image_data,
                file_name,
            }) => {
                let bytes = decode_image_data(image_data).map_err(|err| {
                    ImageLookupError::InvalidData {
                        index,
                        reason: format!("{err:#}"),
                    }
                })?;
                Ok((bytes, file_name.clone()))
            }
            Some(_) => Err(ImageLookupError::NotReady(index)),
            None => Err(ImageLookupError::MissingSlot(index)),
        }
    }
}

/// Decodes a base64 payload, with or without a `data:...;base64,` prefix.
pub fn decode_image_data(image_data: &str) -> Result<Vec<u8>> {
    let trimmed = image_data.trim();
    let encoded = match trimmed.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => trimmed,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .context("failed to decode base64 image")
}

/// Content type sniffed from the leading bytes.
pub fn image_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

fn download_file_name(started_millis: i64, index: usize) -> String {
    format!("{started_millis}-{index}.png")
}

#[cfg(test)]
mod tests {
    use super::{decode_image_data, image_content_type, Gallery, SlotState, FAILED_STATUS_TEXT};
    use crate::error::ImageLookupError;
    use crate::orchestrator::GenerationOutcome;

    // "\x89PNG" followed by a few bytes.
    const PNG_B64: &str = "iVBORw0KGgo=";

    fn success() -> GenerationOutcome {
        GenerationOutcome::Success {
            image_data: PNG_B64.to_string(),
        }
    }

    fn failure() -> GenerationOutcome {
        GenerationOutcome::Failure {
            reason: "HTTP 500: boom".to_string(),
        }
    }

    #[test]
    fn begin_batch_creates_loading_slots() {
        let mut gallery = Gallery::new();
        let batch_id = gallery.begin_batch(3, " cat ", "16/9").expect("begin");

        let snapshot = gallery.snapshot();
        assert_eq!(snapshot.batch_id, batch_id);
        assert!(snapshot.busy);
        assert_eq!(snapshot.prompt, "cat");
        assert_eq!(snapshot.aspect_ratio, "16/9");
        assert_eq!(snapshot.slots.len(), 3);
        assert!(snapshot.slots.iter().all(|s| s.state == "loading"));
    }

    #[test]
    fn rejects_a_second_batch_while_busy() {
        let mut gallery = Gallery::new();
        let batch_id = gallery.begin_batch(2, "cat", "1/1").expect("begin");
        assert!(gallery.begin_batch(2, "dog", "1/1").is_err());

        assert!(gallery.finish(batch_id));
        assert!(gallery.begin_batch(2, "dog", "1/1").is_ok());
    }

    #[test]
    fn mixed_outcomes_are_shown_per_slot() {
        let mut gallery = Gallery::new();
        let batch_id = gallery.begin_batch(3, "cat", "1/1").expect("begin");

        assert!(gallery.apply_outcome(batch_id, 2, success()));
        assert!(gallery.apply_outcome(batch_id, 1, failure()));
        assert!(gallery.apply_outcome(batch_id, 0, success()));
        assert!(gallery.finish(batch_id));

        let snapshot = gallery.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.slots[0].state, "ready");
        assert_eq!(snapshot.slots[1].state, "error");
        assert_eq!(snapshot.slots[1].status_text, FAILED_STATUS_TEXT);
        assert_eq!(snapshot.slots[1].error.as_deref(), Some("HTTP 500: boom"));
        assert_eq!(snapshot.slots[2].state, "ready");
        assert_ne!(snapshot.slots[0].file_name, snapshot.slots[2].file_name);
    }

    #[test]
    fn each_slot_settles_once() {
        let mut gallery = Gallery::new();
        let batch_id = gallery.begin_batch(1, "cat", "1/1").expect("begin");

        assert!(gallery.apply_outcome(batch_id, 0, failure()));
        assert!(!gallery.apply_outcome(batch_id, 0, success()));
        assert!(!gallery.apply_outcome(batch_id, 7, success()));
        assert!(matches!(gallery.slot(0), Some(SlotState::Failed { .. })));
    }

    #[test]
    fn finish_runs_once_per_batch() {
        let mut gallery = Gallery::new();
        let batch_id = gallery.begin_batch(1, "cat", "1/1").expect("begin");
        assert!(gallery.finish(batch_id));
        assert!(!gallery.finish(batch_id));
    }

    #[test]
    fn stale_batch_outcomes_are_ignored() {
        let mut gallery = Gallery::new();
        let first = gallery.begin_batch(2, "cat", "1/1").expect("first");
        gallery.finish(first);
        let second = gallery.begin_batch(4, "dog", "1/1").expect("second");
        let revision = gallery.revision();

        assert!(!gallery.apply_outcome(first, 0, success()));
        assert!(!gallery.finish(first));
        assert_eq!(gallery.revision(), revision);

        let snapshot = gallery.snapshot();
        assert_eq!(snapshot.batch_id, second);
        assert_eq!(snapshot.slots.len(), 4);
        assert!(snapshot.slots.iter().all(|s| s.state == "loading"));
        let indices: Vec<usize> = snapshot.slots.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn image_decodes_ready_slots_only() {
        let mut gallery = Gallery::new();
        let batch_id = gallery.begin_batch(2, "cat", "1/1").expect("begin");
        gallery.apply_outcome(batch_id, 0, success());

        let (bytes, file_name) = gallery.image(batch_id, 0).expect("image");
        assert_eq!(image_content_type(&bytes), "image/png");
        assert!(file_name.ends_with("-0.png"));

        assert_eq!(
            gallery.image(batch_id, 1),
            Err(ImageLookupError::NotReady(1))
        );
        assert_eq!(
            gallery.image(batch_id, 2),
            Err(ImageLookupError::MissingSlot(2))
        );
        assert_eq!(
            gallery.image(batch_id + 1, 0),
            Err(ImageLookupError::StaleBatch(batch_id + 1))
        );
    }

    #[test]
    fn image_reports_undecodable_payloads() {
        let mut gallery = Gallery::new();
        let batch_id = gallery.begin_batch(1, "cat", "1/1").expect("begin");
        gallery.apply_outcome(
            batch_id,
            0,
            GenerationOutcome::Success {
                image_data: "not base64!!".to_string(),
            },
        );

        assert!(matches!(
            gallery.image(batch_id, 0),
            Err(ImageLookupError::InvalidData { index: 0, .. })
        ));
    }

    #[test]
    fn decodes_data_urls_and_wrapped_base64() {
        let plain = decode_image_data(PNG_B64).expect("plain");
        let data_url =
            decode_image_data(&format!("data:image/png;base64,{PNG_B64}")).expect("data url");
        let wrapped = decode_image_data("iVBORw0K\nGgo=").expect("wrapped");
        assert_eq!(plain, data_url);
        assert_eq!(plain, wrapped);
        assert!(decode_image_data("not base64!!").is_err());
    }
}
