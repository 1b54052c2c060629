//! Backend Capability Surface
//!
//! The canvas/model host the interpreter drives. Implemented outside the
//! core; `DryRunBackend` is the in-process implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::configuration::Configuration;
use crate::geometry::{Rect, Size};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend operation {operation} failed: {message}")]
    Operation { operation: String, message: String },

    #[error("Directory not readable: {0}")]
    Directory(String),
}

impl BackendError {
    pub fn operation(operation: &str, message: impl Into<String>) -> Self {
        BackendError::Operation {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Opaque image source (data URL, file URL, backend blob id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageSrc(pub String);

impl ImageSrc {
    pub fn file_url(path: &Path) -> Self {
        ImageSrc(format!("file://{}", path.display()))
    }
}

/// Opaque selection mask handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskHandle {
    pub id: String,
    pub src: ImageSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BodyPart {
    UpperBody,
    LowerBody,
    Clothing,
    Neck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
}

/// One render call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub configuration: Configuration,
    pub prompt: String,
    pub negative_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<MaskHandle>,
}

pub type BackendResult<T> = Result<T, BackendError>;

pub trait CanvasBackend {
    // --- pipeline state ---
    /// Configuration the host holds when the run starts.
    fn configuration(&self) -> BackendResult<Configuration>;
    fn negative_prompt(&self) -> BackendResult<String>;
    /// Canvas size the backend is currently working at.
    fn canvas_size(&self) -> BackendResult<Size>;
    fn render(&mut self, request: &RenderRequest) -> BackendResult<()>;
    fn models_downloaded(&self, models: &[String]) -> BackendResult<Vec<bool>>;

    // --- canvas ---
    fn update_canvas_size(&mut self, configuration: &Configuration) -> BackendResult<()>;
    fn clear_canvas(&mut self) -> BackendResult<()>;
    fn save_image(&mut self, path: &Path, visible_region_only: bool) -> BackendResult<()>;
    fn load_image(&mut self, path: &Path) -> BackendResult<()>;
    fn save_image_src(&mut self, visible_region_only: bool) -> BackendResult<ImageSrc>;
    fn load_image_src(&mut self, src: &ImageSrc) -> BackendResult<()>;
    fn canvas_zoom(&self) -> BackendResult<f64>;
    fn set_canvas_zoom(&mut self, zoom: f64) -> BackendResult<()>;
    fn move_canvas(&mut self, x: f64, y: f64) -> BackendResult<()>;
    fn bounding_box(&self) -> BackendResult<Rect>;
    fn detect_faces(&mut self) -> BackendResult<Vec<Rect>>;
    /// Free-text question to a vision model about the canvas.
    fn answer(&mut self, model: &str, question: &str) -> BackendResult<String>;

    // --- masks ---
    fn background_mask(&mut self) -> BackendResult<MaskHandle>;
    fn foreground_mask(&mut self) -> BackendResult<MaskHandle>;
    fn body_mask(&mut self, parts: &[BodyPart], extra: Option<f64>) -> BackendResult<MaskHandle>;
    fn create_mask(&mut self, width: f64, height: f64, value: f64) -> BackendResult<MaskHandle>;
    fn fill_mask_rectangle(&mut self, mask: &MaskHandle, rect: &Rect, value: f64) -> BackendResult<()>;
    fn load_mask_from_src(&mut self, src: &ImageSrc) -> BackendResult<()>;

    // --- moodboard ---
    fn clear_moodboard(&mut self) -> BackendResult<()>;
    fn add_to_moodboard(&mut self, sources: &[ImageSrc]) -> BackendResult<()>;
    fn remove_from_moodboard(&mut self, index: usize) -> BackendResult<()>;
    fn set_moodboard_weight(&mut self, index: usize, weight: f64) -> BackendResult<()>;

    // --- depth & pose ---
    fn extract_depth_map(&mut self, src: &ImageSrc) -> BackendResult<()>;
    fn load_depth_map(&mut self, src: &ImageSrc) -> BackendResult<()>;
    fn save_depth_map_src(&mut self) -> BackendResult<ImageSrc>;
    fn load_pose_from_src(&mut self, src: &ImageSrc) -> BackendResult<()>;
    fn load_pose_json(&mut self, pose: &Value) -> BackendResult<()>;
    fn clear_pose(&mut self) -> BackendResult<()>;

    // --- filesystem ---
    /// Root every relative save/load path is joined onto.
    fn pictures_dir(&self) -> PathBuf;
    fn read_entries(&self, relative_dir: &str) -> BackendResult<Vec<DirEntry>>;

    /// Let the host settle after a state-changing call.
    fn settle(&mut self, delay: Duration);
}
