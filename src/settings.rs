//! Engine Settings - host-tunable knobs, loaded from JSON

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::resolver::DEFAULT_MAX_PASSES;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Cannot read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Vision model asked for rectangles by `askZoom` and `maskAsk`.
    pub ask_model: String,
    pub settle_delay_ms: u64,
    pub moodboard_settle_delay_ms: u64,
    pub bounding_box_settle_delay_ms: u64,
    /// `None` repeats macro substitution until stable, however long it takes.
    pub max_resolution_passes: Option<usize>,
    pub wildcard_seed: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ask_model: "blip2_eva_vit_q8p.ckpt".to_string(),
            settle_delay_ms: 100,
            moodboard_settle_delay_ms: 200,
            bounding_box_settle_delay_ms: 200,
            max_resolution_passes: Some(DEFAULT_MAX_PASSES),
            wildcard_seed: None,
        }
    }
}

impl EngineSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn moodboard_settle_delay(&self) -> Duration {
        Duration::from_millis(self.moodboard_settle_delay_ms)
    }

    pub fn bounding_box_settle_delay(&self) -> Duration {
        Duration::from_millis(self.bounding_box_settle_delay_ms)
    }
}
