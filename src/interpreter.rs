//! Instruction Interpreter - walks a decoded program against a backend
//!
//! One `PipelineRun` owns the configuration, negative prompt, mask slot and
//! loop frame for a single run. Nothing is shared between runs except the
//! read-only macro tables and settings.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, CanvasBackend, DirEntry, ImageSrc, MaskHandle, RenderRequest};
use crate::configuration::Configuration;
use crate::geometry::{center_on_region, fallback_placement, rect_from_answer, Rect, ZoomPlacement};
use crate::instruction::{AdaptSize, Instruction, LoopSpec, Program, Step};
use crate::resolver::{MacroTables, ResolveError, Resolver};
use crate::schema::InstructionKind;
use crate::settings::EngineSettings;

/// Failure of a single instruction.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Invalid or zero-sized bounding box, nothing to adapt")]
    EmptyBoundingBox,

    #[error("Directory not found or is empty: {0}")]
    EmptyDirectory(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Fatal error that ended a run.
#[derive(Debug, Error)]
#[error("Item {index}: \"{kind}\" failed: {source}")]
pub struct RunError {
    pub index: usize,
    pub kind: InstructionKind,
    #[source]
    pub source: EngineError,
}

/// The one active bounded repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopFrame {
    pub marker_index: usize,
    pub counter: i64,
    pub max_loops: i64,
    pub start_offset: i64,
}

/// Fallback applied in place of a failed best-effort operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Zoom 1.2, pan 6% of the viewport.
    ResetZoom,
    /// All-zero mask the size of the canvas.
    EmptyMask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub index: usize,
    pub kind: InstructionKind,
    pub recovery: Recovery,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub configuration: Configuration,
    pub negative_prompt: String,
    pub mask: Option<MaskHandle>,
    /// `None` while no loop is active.
    pub loop_frame: Option<LoopFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Ran past the last instruction.
    Completed,
    /// Stopped at an `end` instruction.
    Ended { index: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub instructions_executed: usize,
    pub renders: usize,
    pub recoveries: Vec<RecoveryEvent>,
    pub state: RunState,
}

enum Flow {
    Next,
    Jump(usize),
    Stop,
}

pub struct PipelineRun<'a, B: CanvasBackend + ?Sized> {
    backend: &'a mut B,
    resolver: Resolver<'a>,
    settings: &'a EngineSettings,
    rng: &'a mut dyn RngCore,
    state: RunState,
    recoveries: Vec<RecoveryEvent>,
    renders: usize,
    executed: usize,
}

impl<'a, B: CanvasBackend + ?Sized> PipelineRun<'a, B> {
    /// Seed the run from the backend's current configuration and negative prompt.
    pub fn new(
        backend: &'a mut B,
        tables: &'a MacroTables,
        settings: &'a EngineSettings,
        rng: &'a mut dyn RngCore,
    ) -> Result<Self, BackendError> {
        let state = RunState {
            configuration: backend.configuration()?,
            negative_prompt: backend.negative_prompt()?,
            mask: None,
            loop_frame: None,
        };

        Ok(Self {
            backend,
            resolver: Resolver::new(tables).with_max_passes(settings.max_resolution_passes),
            settings,
            rng,
            state,
            recoveries: vec![],
            renders: 0,
            executed: 0,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn execute(mut self, program: &Program) -> Result<RunSummary, RunError> {
        let steps = program.steps();
        let mut pointer = 0;
        let mut outcome = RunOutcome::Completed;

        while pointer < steps.len() {
            let instruction = match &steps[pointer] {
                Step::Run(instruction) => instruction,
                Step::Skip { key } => {
                    warn!(index = pointer, key = %key, "Unknown instruction type, skipped");
                    pointer += 1;
                    continue;
                }
            };

            let kind = instruction.kind();
            debug!(index = pointer, kind = %kind, "dispatch");
            self.executed += 1;

            let flow = self
                .dispatch(pointer, instruction)
                .map_err(|source| RunError { index: pointer, kind, source })?;

            match flow {
                Flow::Next => pointer += 1,
                Flow::Jump(target) => pointer = target,
                Flow::Stop => {
                    info!(index = pointer, "Ending pipeline");
                    outcome = RunOutcome::Ended { index: pointer };
                    break;
                }
            }
        }

        Ok(RunSummary {
            outcome,
            instructions_executed: self.executed,
            renders: self.renders,
            recoveries: self.recoveries,
            state: self.state,
        })
    }

    fn dispatch(&mut self, index: usize, instruction: &Instruction) -> Result<Flow, EngineError> {
        use Instruction as I;

        match instruction {
            I::Note => {}
            I::Prompt(text) => self.render(text)?,
            I::NegPrompt(text) => {
                self.state.negative_prompt = self.resolver.prompt(text, &mut *self.rng)?;
            }
            I::Config(patch) | I::InpaintTools(patch) => {
                let resolved = self.resolver.config_fields(patch)?;
                self.state.configuration.merge(&resolved);
            }
            I::Frames(frames) => self.state.configuration.set_frames(frames.clone()),

            // --- view ---
            I::FaceZoom => self.face_zoom(index)?,
            I::AskZoom(query) => self.ask_zoom(index, query)?,
            I::MoveScale(ms) => {
                self.backend.move_canvas(ms.x, ms.y)?;
                self.backend.set_canvas_zoom(ms.scale)?;
            }
            I::AdaptSize(limits) => {
                self.adapt_size(limits)?;
                self.settle();
            }
            I::Crop => self.crop()?,

            // --- canvas ---
            I::RemoveBkgd => {
                let background = self.backend.background_mask()?;
                self.backend.load_mask_from_src(&background.src)?;
                self.settle();
            }
            I::CanvasClear => {
                self.backend.clear_canvas()?;
                self.settle();
            }
            I::CanvasSave(path) => {
                let target = self.backend.pictures_dir().join(path);
                self.backend.save_image(&target, false)?;
                self.settle();
            }
            I::CanvasLoad(path) => {
                self.backend.update_canvas_size(&self.state.configuration)?;
                let source = self.backend.pictures_dir().join(path);
                self.backend.load_image(&source)?;
                self.settle();
            }

            // --- moodboard ---
            I::MoodboardClear => {
                self.backend.clear_moodboard()?;
                self.settle();
            }
            I::MoodboardCanvas => {
                let src = self.backend.save_image_src(true)?;
                self.backend.add_to_moodboard(&[src])?;
                self.settle();
            }
            I::MoodboardLoad => {
                let src = self.backend.save_image_src(true)?;
                self.backend.add_to_moodboard(&[src])?;
                self.backend.clear_canvas()?;
            }
            I::MoodboardAdd(path) => {
                let src = ImageSrc::file_url(&self.backend.pictures_dir().join(path));
                self.backend.add_to_moodboard(&[src])?;
                self.backend.settle(self.settings.moodboard_settle_delay());
            }
            I::LoopAddMb(dir) => {
                let entry = self.cycled_entry(dir)?;
                self.backend.add_to_moodboard(&[ImageSrc::file_url(&entry.path)])?;
                self.backend.settle(self.settings.moodboard_settle_delay());
            }
            I::MoodboardRemove(slot) => {
                self.backend.remove_from_moodboard(*slot)?;
                self.settle();
            }
            I::MoodboardWeights(weights) => {
                for (slot, weight) in weights {
                    self.backend.set_moodboard_weight(*slot, *weight)?;
                }
            }

            // --- mask slot ---
            I::MaskClear => self.state.mask = None,
            I::MaskLoad(path) => {
                let src = ImageSrc::file_url(&self.backend.pictures_dir().join(path));
                self.backend.load_mask_from_src(&src)?;
                self.backend.settle(self.settings.moodboard_settle_delay());
                self.state.mask = None;
            }
            I::MaskGet => {
                if let Some(mask) = &self.state.mask {
                    self.backend.load_image_src(&mask.src)?;
                }
            }
            I::MaskBkgd => self.state.mask = Some(self.backend.background_mask()?),
            I::MaskFg => self.state.mask = Some(self.backend.foreground_mask()?),
            I::MaskBody(spec) => {
                self.state.mask = Some(self.backend.body_mask(&spec.parts(), spec.extra)?);
            }
            I::MaskAsk(query) => self.state.mask = Some(self.mask_from_query(index, query)?),

            // --- depth & pose ---
            I::DepthExtract => {
                let src = self.backend.save_image_src(true)?;
                self.backend.extract_depth_map(&src)?;
                self.settle();
            }
            I::DepthCanvas => {
                let src = self.backend.save_image_src(true)?;
                self.backend.load_depth_map(&src)?;
            }
            I::DepthToCanvas => {
                let src = self.backend.save_depth_map_src()?;
                self.backend.load_image_src(&src)?;
            }
            I::XlMagic(tiers) => self.state.configuration.apply_xl_magic(tiers),
            I::PoseExtract => {
                let src = self.backend.save_image_src(true)?;
                self.backend.load_pose_from_src(&src)?;
                self.settle();
            }
            I::PoseJson(pose) => {
                let resolved = self.resolver.pose_fields(pose)?;
                self.backend.load_pose_json(&resolved)?;
            }
            I::PoseClear => self.backend.clear_pose()?,

            // --- looping ---
            I::Loop(spec) => self.enter_loop(index, spec),
            I::LoopLoad(dir) => {
                let entry = self.cycled_entry(dir)?;
                self.backend.load_image(&entry.path)?;
                self.settle();
            }
            I::LoopSave(path) => {
                let (counter, start) = self.loop_position();
                let numbered = numbered_path(path, counter + start);
                let target = self.backend.pictures_dir().join(numbered);
                self.backend.save_image(&target, false)?;
                self.settle();
            }
            I::LoopEnd => return Ok(self.end_loop()),
            I::End => return Ok(Flow::Stop),
        }

        Ok(Flow::Next)
    }

    fn settle(&mut self) {
        self.backend.settle(self.settings.settle_delay());
    }

    fn render(&mut self, text: &str) -> Result<(), EngineError> {
        let prompt = self.resolver.prompt(text, &mut *self.rng)?;
        self.backend.update_canvas_size(&self.state.configuration)?;

        let request = RenderRequest {
            configuration: self.state.configuration.clone(),
            prompt,
            negative_prompt: self.state.negative_prompt.clone(),
            mask: self.state.mask.clone(),
        };
        self.backend.render(&request)?;
        self.renders += 1;
        Ok(())
    }

    fn crop(&mut self) -> Result<(), EngineError> {
        self.backend.update_canvas_size(&self.state.configuration)?;
        let visible = self.backend.save_image_src(true)?;
        self.backend.clear_canvas()?;
        self.backend.load_image_src(&visible)?;
        Ok(())
    }

    fn adapt_size(&mut self, limits: &AdaptSize) -> Result<(), EngineError> {
        // bounding box lags behind a fresh load
        self.backend.settle(self.settings.bounding_box_settle_delay());
        let bounds = self.backend.bounding_box()?;
        if bounds.size.is_empty() {
            error!(width = bounds.size.width, height = bounds.size.height, "Invalid or zero-sized bounding box");
            return Err(EngineError::EmptyBoundingBox);
        }

        let width = bounds.size.width.min(limits.max_width);
        let height = bounds.size.height.min(limits.max_height);
        self.state.configuration.set_size(width, height);

        self.backend.update_canvas_size(&self.state.configuration)?;
        self.backend.set_canvas_zoom(1.0)?;
        self.backend.move_canvas(0.0, 0.0)?;
        Ok(())
    }

    // --- best-effort view operations ---

    fn recover(&mut self, index: usize, kind: InstructionKind, recovery: Recovery, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(index, kind = %kind, ?recovery, reason = %reason, "Falling back");
        self.recoveries.push(RecoveryEvent { index, kind, recovery, reason });
    }

    fn apply_placement(&mut self, placement: ZoomPlacement) -> Result<(), EngineError> {
        if placement.centered {
            self.backend.move_canvas(placement.pan.x, placement.pan.y)?;
            self.backend.set_canvas_zoom(placement.zoom)?;
        } else {
            self.backend.set_canvas_zoom(placement.zoom)?;
            self.backend.move_canvas(placement.pan.x, placement.pan.y)?;
        }
        Ok(())
    }

    fn reset_zoom(&mut self, index: usize, kind: InstructionKind, reason: impl Into<String>) -> Result<(), EngineError> {
        self.recover(index, kind, Recovery::ResetZoom, reason);
        self.apply_placement(fallback_placement(self.state.configuration.size()))
    }

    fn zoom_to(&mut self, index: usize, kind: InstructionKind, region: Option<&Rect>, missing: &str) -> Result<(), EngineError> {
        let viewport = self.state.configuration.size();
        let canvas = self.backend.canvas_size()?;
        let current_zoom = self.backend.canvas_zoom()?;

        let placement = center_on_region(region, viewport, canvas, current_zoom);
        if placement.centered {
            self.apply_placement(placement)
        } else if region.is_none() {
            self.reset_zoom(index, kind, missing)
        } else {
            self.reset_zoom(index, kind, "region too tall to zoom to")
        }
    }

    /// Face detection never aborts the run.
    fn face_zoom(&mut self, index: usize) -> Result<(), EngineError> {
        let attempt = self
            .backend
            .detect_faces()
            .map_err(EngineError::from)
            .and_then(|faces| self.zoom_to(index, InstructionKind::FaceZoom, faces.first(), "no face detected"));

        match attempt {
            Ok(()) => Ok(()),
            Err(e) => self.reset_zoom(index, InstructionKind::FaceZoom, e.to_string()),
        }
    }

    fn query_rect(&mut self, query: &str) -> Result<Option<Rect>, EngineError> {
        let question = format!("get rectangle around {}", query);
        let answer = self.backend.answer(&self.settings.ask_model, &question)?;
        let canvas = self.backend.canvas_size()?;
        let rect = rect_from_answer(&answer, canvas);
        if rect.is_none() {
            debug!(answer = %answer, "Failed to parse valid coordinates from answer");
        }
        Ok(rect)
    }

    fn ask_zoom(&mut self, index: usize, query: &str) -> Result<(), EngineError> {
        let rect = self.query_rect(query)?;
        self.zoom_to(index, InstructionKind::AskZoom, rect.as_ref(), "no rectangle in answer")
    }

    fn mask_from_query(&mut self, index: usize, query: &str) -> Result<MaskHandle, EngineError> {
        let rect = self.query_rect(query)?;
        let canvas = self.backend.canvas_size()?;
        let mask = self.backend.create_mask(canvas.width, canvas.height, 0.0)?;

        match rect {
            Some(rect) => self.backend.fill_mask_rectangle(&mask, &rect, 1.0)?,
            None => self.recover(index, InstructionKind::MaskAsk, Recovery::EmptyMask, "no rectangle in answer"),
        }
        Ok(mask)
    }

    // --- looping ---

    /// Counter and start offset of the active loop, zero outside one.
    fn loop_position(&self) -> (i64, i64) {
        self.state
            .loop_frame
            .map_or((0, 0), |frame| (frame.counter, frame.start_offset))
    }

    fn enter_loop(&mut self, index: usize, spec: &LoopSpec) {
        match self.state.loop_frame {
            None => {
                let frame = LoopFrame {
                    marker_index: index,
                    counter: 0,
                    max_loops: spec.max_loops(),
                    start_offset: spec.start_offset(),
                };
                info!(index, max_loops = frame.max_loops, "Loop started");
                self.state.loop_frame = Some(frame);
            }
            // rewound onto our own marker
            Some(frame) if frame.marker_index == index => {}
            Some(frame) => {
                warn!(index, active = frame.marker_index, "Nested loop ignored, one loop may be active");
            }
        }
    }

    fn end_loop(&mut self) -> Flow {
        let Some(frame) = self.state.loop_frame.as_mut() else {
            warn!("loopEnd without an active loop");
            return Flow::Next;
        };

        frame.counter += 1;
        if frame.counter < frame.max_loops {
            return Flow::Jump(frame.marker_index);
        }

        info!(passes = frame.counter, "Loop finished");
        self.state.loop_frame = None;
        Flow::Next
    }

    fn cycled_entry(&self, dir: &str) -> Result<DirEntry, EngineError> {
        let mut entries = self.backend.read_entries(dir)?;
        if entries.is_empty() {
            warn!(directory = %dir, "Directory not found or is empty");
            return Err(EngineError::EmptyDirectory(dir.to_string()));
        }

        sort_entries(&mut entries);
        let (counter, _) = self.loop_position();
        let index = cycle_index(counter, entries.len());
        Ok(entries.swap_remove(index))
    }
}

/// Case-insensitive name order.
pub fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by_cached_key(|e| e.name.to_lowercase());
}

/// `counter mod count`, wrapped into `0..count` for negative counters too.
pub fn cycle_index(counter: i64, count: usize) -> usize {
    counter.rem_euclid(count as i64) as usize
}

/// `dir/name.ext` -> `dir/name_007.ext`. The number is left-padded with
/// zeros to three characters.
pub fn numbered_path(path: &str, n: i64) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(slash) => path.split_at(slash + 1),
        None => ("", path),
    };
    let padded = format!("{:0>3}", n.to_string());

    match file.rfind('.') {
        Some(dot) => format!("{}{}_{}.{}", dir, &file[..dot], padded, &file[dot + 1..]),
        None => format!("{}{}_{}", dir, file, padded),
    }
}
