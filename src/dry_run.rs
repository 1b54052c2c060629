//! Dry-Run Backend - records every call instead of drawing
//!
//! Answers come from fields the caller sets up front. Directory listings
//! come from registered fixtures first, then from the real filesystem under
//! the pictures root.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{
    BackendError, BackendResult, BodyPart, CanvasBackend, DirEntry, ImageSrc, MaskHandle, RenderRequest,
};
use crate::configuration::Configuration;
use crate::geometry::{Rect, Size};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BackendCall {
    Render { request: RenderRequest },
    UpdateCanvasSize { width: f64, height: f64 },
    ClearCanvas,
    SaveImage { path: PathBuf, visible_region_only: bool },
    LoadImage { path: PathBuf },
    SaveImageSrc { src: ImageSrc },
    LoadImageSrc { src: ImageSrc },
    SetCanvasZoom { zoom: f64 },
    MoveCanvas { x: f64, y: f64 },
    DetectFaces,
    Answer { model: String, question: String },
    BackgroundMask { mask: MaskHandle },
    ForegroundMask { mask: MaskHandle },
    BodyMask { parts: Vec<BodyPart>, extra: Option<f64>, mask: MaskHandle },
    CreateMask { width: f64, height: f64, value: f64, mask: MaskHandle },
    FillMaskRectangle { mask: String, rect: Rect, value: f64 },
    LoadMaskFromSrc { src: ImageSrc },
    ClearMoodboard,
    AddToMoodboard { sources: Vec<ImageSrc> },
    RemoveFromMoodboard { index: usize },
    SetMoodboardWeight { index: usize, weight: f64 },
    ExtractDepthMap { src: ImageSrc },
    LoadDepthMap { src: ImageSrc },
    SaveDepthMapSrc { src: ImageSrc },
    LoadPoseFromSrc { src: ImageSrc },
    LoadPoseJson { pose: Value },
    ClearPose,
    Settle { millis: u64 },
}

impl BackendCall {
    /// Snake-case operation name, matching the `call` tag.
    pub fn name(&self) -> &'static str {
        match self {
            BackendCall::Render { .. } => "render",
            BackendCall::UpdateCanvasSize { .. } => "update_canvas_size",
            BackendCall::ClearCanvas => "clear_canvas",
            BackendCall::SaveImage { .. } => "save_image",
            BackendCall::LoadImage { .. } => "load_image",
            BackendCall::SaveImageSrc { .. } => "save_image_src",
            BackendCall::LoadImageSrc { .. } => "load_image_src",
            BackendCall::SetCanvasZoom { .. } => "set_canvas_zoom",
            BackendCall::MoveCanvas { .. } => "move_canvas",
            BackendCall::DetectFaces => "detect_faces",
            BackendCall::Answer { .. } => "answer",
            BackendCall::BackgroundMask { .. } => "background_mask",
            BackendCall::ForegroundMask { .. } => "foreground_mask",
            BackendCall::BodyMask { .. } => "body_mask",
            BackendCall::CreateMask { .. } => "create_mask",
            BackendCall::FillMaskRectangle { .. } => "fill_mask_rectangle",
            BackendCall::LoadMaskFromSrc { .. } => "load_mask_from_src",
            BackendCall::ClearMoodboard => "clear_moodboard",
            BackendCall::AddToMoodboard { .. } => "add_to_moodboard",
            BackendCall::RemoveFromMoodboard { .. } => "remove_from_moodboard",
            BackendCall::SetMoodboardWeight { .. } => "set_moodboard_weight",
            BackendCall::ExtractDepthMap { .. } => "extract_depth_map",
            BackendCall::LoadDepthMap { .. } => "load_depth_map",
            BackendCall::SaveDepthMapSrc { .. } => "save_depth_map_src",
            BackendCall::LoadPoseFromSrc { .. } => "load_pose_from_src",
            BackendCall::LoadPoseJson { .. } => "load_pose_json",
            BackendCall::ClearPose => "clear_pose",
            BackendCall::Settle { .. } => "settle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DryRunBackend {
    configuration: Configuration,
    negative_prompt: String,
    canvas: Size,
    zoom: f64,
    bounding_box: Option<Rect>,
    faces: Result<Vec<Rect>, String>,
    answer: String,
    pictures: PathBuf,
    directories: BTreeMap<String, Vec<String>>,
    downloaded: BTreeSet<String>,
    failing: Option<String>,
    calls: Vec<BackendCall>,
    next_id: usize,
}

impl DryRunBackend {
    pub fn new(pictures: impl Into<PathBuf>) -> Self {
        let mut configuration = Configuration::new();
        configuration.set_size(1024.0, 1024.0);

        Self {
            canvas: configuration.size(),
            configuration,
            negative_prompt: String::new(),
            zoom: 1.0,
            bounding_box: None,
            faces: Ok(vec![]),
            answer: String::new(),
            pictures: pictures.into(),
            directories: BTreeMap::new(),
            downloaded: BTreeSet::new(),
            failing: None,
            calls: vec![],
            next_id: 0,
        }
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.canvas = configuration.size();
        self.configuration = configuration;
        self
    }

    pub fn with_negative_prompt(mut self, text: impl Into<String>) -> Self {
        self.negative_prompt = text.into();
        self
    }

    pub fn with_canvas(mut self, canvas: Size, zoom: f64) -> Self {
        self.canvas = canvas;
        self.zoom = zoom;
        self
    }

    /// Content bounds reported to `adaptSize`. Defaults to the whole canvas.
    pub fn with_bounding_box(mut self, rect: Rect) -> Self {
        self.bounding_box = Some(rect);
        self
    }

    pub fn with_faces(mut self, faces: Vec<Rect>) -> Self {
        self.faces = Ok(faces);
        self
    }

    /// Make face detection fail with `message`.
    pub fn with_face_error(mut self, message: impl Into<String>) -> Self {
        self.faces = Err(message.into());
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = answer.into();
        self
    }

    /// Register a fixture listing for `dir`, relative to the pictures root.
    pub fn with_directory<I, S>(mut self, dir: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.directories
            .insert(normalize_dir(dir), names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_downloaded<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.downloaded.extend(models.into_iter().map(Into::into));
        self
    }

    /// Make every call of `operation` (see [`BackendCall::name`]) fail.
    pub fn failing(mut self, operation: &str) -> Self {
        self.failing = Some(operation.to_string());
        self
    }

    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn into_calls(self) -> Vec<BackendCall> {
        self.calls
    }

    pub fn renders(&self) -> Vec<&RenderRequest> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Render { request } => Some(request),
                _ => None,
            })
            .collect()
    }

    fn guard(&self, operation: &str) -> BackendResult<()> {
        match &self.failing {
            Some(failing) if failing == operation => Err(BackendError::operation(operation, "injected failure")),
            _ => Ok(()),
        }
    }

    fn record(&mut self, call: BackendCall) -> BackendResult<()> {
        self.guard(call.name())?;
        self.calls.push(call);
        Ok(())
    }

    fn next_src(&mut self, prefix: &str) -> ImageSrc {
        self.next_id += 1;
        ImageSrc(format!("dryrun://{}/{}", prefix, self.next_id))
    }

    fn next_mask(&mut self) -> MaskHandle {
        let src = self.next_src("mask");
        MaskHandle {
            id: format!("mask-{}", self.next_id),
            src,
        }
    }

    fn list_dir(&self, dir: &str) -> BackendResult<Vec<DirEntry>> {
        let root = self.pictures.join(dir);
        if let Some(names) = self.directories.get(&normalize_dir(dir)) {
            return Ok(names
                .iter()
                .map(|name| DirEntry {
                    name: name.clone(),
                    path: root.join(name),
                })
                .collect());
        }
        read_files(&root)
    }
}

fn normalize_dir(dir: &str) -> String {
    dir.trim_matches('/').to_string()
}

/// Plain files in `root`. A missing directory lists as empty.
fn read_files(root: &Path) -> BackendResult<Vec<DirEntry>> {
    let listing = match fs::read_dir(root) {
        Ok(listing) => listing,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(BackendError::Directory(format!("{}: {}", root.display(), e))),
    };

    let mut entries = vec![];
    for item in listing {
        let item = item.map_err(|e| BackendError::Directory(format!("{}: {}", root.display(), e)))?;
        if item.path().is_file() {
            entries.push(DirEntry {
                name: item.file_name().to_string_lossy().into_owned(),
                path: item.path(),
            });
        }
    }
    Ok(entries)
}

impl CanvasBackend for DryRunBackend {
    fn configuration(&self) -> BackendResult<Configuration> {
        self.guard("configuration")?;
        Ok(self.configuration.clone())
    }

    fn negative_prompt(&self) -> BackendResult<String> {
        self.guard("negative_prompt")?;
        Ok(self.negative_prompt.clone())
    }

    fn canvas_size(&self) -> BackendResult<Size> {
        self.guard("canvas_size")?;
        Ok(self.canvas)
    }

    fn render(&mut self, request: &RenderRequest) -> BackendResult<()> {
        self.record(BackendCall::Render { request: request.clone() })
    }

    fn models_downloaded(&self, models: &[String]) -> BackendResult<Vec<bool>> {
        self.guard("models_downloaded")?;
        Ok(models.iter().map(|m| self.downloaded.contains(m)).collect())
    }

    fn update_canvas_size(&mut self, configuration: &Configuration) -> BackendResult<()> {
        let size = configuration.size();
        self.record(BackendCall::UpdateCanvasSize {
            width: size.width,
            height: size.height,
        })?;
        if !size.is_empty() {
            self.canvas = size;
        }
        Ok(())
    }

    fn clear_canvas(&mut self) -> BackendResult<()> {
        self.record(BackendCall::ClearCanvas)
    }

    fn save_image(&mut self, path: &Path, visible_region_only: bool) -> BackendResult<()> {
        self.record(BackendCall::SaveImage {
            path: path.to_path_buf(),
            visible_region_only,
        })
    }

    fn load_image(&mut self, path: &Path) -> BackendResult<()> {
        self.record(BackendCall::LoadImage { path: path.to_path_buf() })
    }

    fn save_image_src(&mut self, _visible_region_only: bool) -> BackendResult<ImageSrc> {
        self.guard("save_image_src")?;
        let src = self.next_src("canvas");
        self.record(BackendCall::SaveImageSrc { src: src.clone() })?;
        Ok(src)
    }

    fn load_image_src(&mut self, src: &ImageSrc) -> BackendResult<()> {
        self.record(BackendCall::LoadImageSrc { src: src.clone() })
    }

    fn canvas_zoom(&self) -> BackendResult<f64> {
        self.guard("canvas_zoom")?;
        Ok(self.zoom)
    }

    fn set_canvas_zoom(&mut self, zoom: f64) -> BackendResult<()> {
        self.record(BackendCall::SetCanvasZoom { zoom })?;
        self.zoom = zoom;
        Ok(())
    }

    fn move_canvas(&mut self, x: f64, y: f64) -> BackendResult<()> {
        self.record(BackendCall::MoveCanvas { x, y })
    }

    fn bounding_box(&self) -> BackendResult<Rect> {
        self.guard("bounding_box")?;
        Ok(self
            .bounding_box
            .unwrap_or_else(|| Rect::new(0.0, 0.0, self.canvas.width, self.canvas.height)))
    }

    fn detect_faces(&mut self) -> BackendResult<Vec<Rect>> {
        self.record(BackendCall::DetectFaces)?;
        self.faces
            .clone()
            .map_err(|message| BackendError::operation("detect_faces", message))
    }

    fn answer(&mut self, model: &str, question: &str) -> BackendResult<String> {
        self.record(BackendCall::Answer {
            model: model.to_string(),
            question: question.to_string(),
        })?;
        Ok(self.answer.clone())
    }

    fn background_mask(&mut self) -> BackendResult<MaskHandle> {
        let mask = self.next_mask();
        self.record(BackendCall::BackgroundMask { mask: mask.clone() })?;
        Ok(mask)
    }

    fn foreground_mask(&mut self) -> BackendResult<MaskHandle> {
        let mask = self.next_mask();
        self.record(BackendCall::ForegroundMask { mask: mask.clone() })?;
        Ok(mask)
    }

    fn body_mask(&mut self, parts: &[BodyPart], extra: Option<f64>) -> BackendResult<MaskHandle> {
        let mask = self.next_mask();
        self.record(BackendCall::BodyMask {
            parts: parts.to_vec(),
            extra,
            mask: mask.clone(),
        })?;
        Ok(mask)
    }

    fn create_mask(&mut self, width: f64, height: f64, value: f64) -> BackendResult<MaskHandle> {
        let mask = self.next_mask();
        self.record(BackendCall::CreateMask {
            width,
            height,
            value,
            mask: mask.clone(),
        })?;
        Ok(mask)
    }

    fn fill_mask_rectangle(&mut self, mask: &MaskHandle, rect: &Rect, value: f64) -> BackendResult<()> {
        self.record(BackendCall::FillMaskRectangle {
            mask: mask.id.clone(),
            rect: *rect,
            value,
        })
    }

    fn load_mask_from_src(&mut self, src: &ImageSrc) -> BackendResult<()> {
        self.record(BackendCall::LoadMaskFromSrc { src: src.clone() })
    }

    fn clear_moodboard(&mut self) -> BackendResult<()> {
        self.record(BackendCall::ClearMoodboard)
    }

    fn add_to_moodboard(&mut self, sources: &[ImageSrc]) -> BackendResult<()> {
        self.record(BackendCall::AddToMoodboard { sources: sources.to_vec() })
    }

    fn remove_from_moodboard(&mut self, index: usize) -> BackendResult<()> {
        self.record(BackendCall::RemoveFromMoodboard { index })
    }

    fn set_moodboard_weight(&mut self, index: usize, weight: f64) -> BackendResult<()> {
        self.record(BackendCall::SetMoodboardWeight { index, weight })
    }

    fn extract_depth_map(&mut self, src: &ImageSrc) -> BackendResult<()> {
        self.record(BackendCall::ExtractDepthMap { src: src.clone() })
    }

    fn load_depth_map(&mut self, src: &ImageSrc) -> BackendResult<()> {
        self.record(BackendCall::LoadDepthMap { src: src.clone() })
    }

    fn save_depth_map_src(&mut self) -> BackendResult<ImageSrc> {
        self.guard("save_depth_map_src")?;
        let src = self.next_src("depth");
        self.record(BackendCall::SaveDepthMapSrc { src: src.clone() })?;
        Ok(src)
    }

    fn load_pose_from_src(&mut self, src: &ImageSrc) -> BackendResult<()> {
        self.record(BackendCall::LoadPoseFromSrc { src: src.clone() })
    }

    fn load_pose_json(&mut self, pose: &Value) -> BackendResult<()> {
        self.record(BackendCall::LoadPoseJson { pose: pose.clone() })
    }

    fn clear_pose(&mut self) -> BackendResult<()> {
        self.record(BackendCall::ClearPose)
    }

    fn pictures_dir(&self) -> PathBuf {
        self.pictures.clone()
    }

    fn read_entries(&self, relative_dir: &str) -> BackendResult<Vec<DirEntry>> {
        self.guard("read_entries")?;
        self.list_dir(relative_dir)
    }

    fn settle(&mut self, delay: Duration) {
        // nothing to wait for
        self.calls.push(BackendCall::Settle {
            millis: delay.as_millis() as u64,
        });
    }
}
