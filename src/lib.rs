//! Storyflow Core - instruction engine for image-generation workflows
//!
//! A Storyflow sequence is a JSON array of single-key instructions. The
//! engine checks it, resolves macros in its text, and drives a canvas
//! backend through it one instruction at a time.
//!
//! # Ground Rules
//! 1. Validation reports, it never rejects midway
//! 2. Nothing reaches the backend without a preflight
//! 3. One run owns its state; macro tables are read-only
//! 4. Best-effort view operations fall back, everything else stops the run
//! 5. One loop at a time

pub mod schema;
pub mod instruction;
pub mod validation;
pub mod preflight;
pub mod resolver;
pub mod geometry;
pub mod configuration;
pub mod backend;
pub mod dry_run;
pub mod interpreter;
pub mod pipeline;
pub mod settings;
pub mod hashing;

pub use schema::{InstructionKind, ValueShape};
pub use instruction::{Instruction, PayloadError, Program, Step};
pub use validation::{SchemaViolation, ValidationResult, Validator};
pub use preflight::PreflightReport;
pub use resolver::{MacroTable, MacroTables, ResolveError, Resolver};
pub use configuration::Configuration;
pub use backend::{BackendError, CanvasBackend};
pub use dry_run::{BackendCall, DryRunBackend};
pub use interpreter::{EngineError, PipelineRun, Recovery, RecoveryEvent, RunError, RunOutcome, RunSummary};
pub use pipeline::{PipelineError, RunReport, StoryflowPipeline};
pub use settings::EngineSettings;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
