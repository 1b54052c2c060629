//! Storyflow Pipeline - Single Entry Point
//!
//! CRITICAL: run MUST preflight internally. An invalid sequence never
//! reaches the backend.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::backend::{BackendError, CanvasBackend};
use crate::hashing::sequence_digest;
use crate::instruction::{parse_sequence, PayloadError, Program};
use crate::interpreter::{PipelineRun, RunError, RunSummary};
use crate::preflight::PreflightReport;
use crate::resolver::{MacroTables, ResolveError, Resolver};
use crate::settings::EngineSettings;
use crate::validation::Validator;
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static PREFLIGHT_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_preflight_call_count() -> u32 {
    PREFLIGHT_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_preflight_call_count() {
    PREFLIGHT_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub engine_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sequence_digest: String,
    pub preflight: PreflightReport,
    pub summary: RunSummary,
}

/// The pipeline - single entry point for checking and running sequences
pub struct StoryflowPipeline {
    validator: Validator,
    tables: MacroTables,
    settings: EngineSettings,
}

impl StoryflowPipeline {
    pub fn new(tables: MacroTables, settings: EngineSettings) -> Self {
        for key in tables.prompt_triggers.self_referential_keys() {
            warn!(key = %key, "Prompt trigger expands to text containing itself");
        }

        Self {
            validator: Validator::new(),
            tables,
            settings,
        }
    }

    pub fn tables(&self) -> &MacroTables {
        &self.tables
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Check a sequence without running it.
    ///
    /// This is the ONLY validation entry point.
    pub fn preflight(&self, text: &str) -> PreflightReport {
        #[cfg(feature = "test-hooks")]
        PREFLIGHT_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        PreflightReport::from_text(&self.validator, text)
    }

    /// Resolve prompt text the way a `prompt` instruction would.
    pub fn resolve_prompt(&self, text: &str) -> Result<String, ResolveError> {
        let mut rng = self.rng();
        Resolver::new(&self.tables)
            .with_max_passes(self.settings.max_resolution_passes)
            .prompt(text, &mut rng)
    }

    /// Run a sequence against `backend`.
    ///
    /// CRITICAL: This ALWAYS calls preflight internally. No bypass possible.
    pub fn run<B: CanvasBackend + ?Sized>(&self, text: &str, backend: &mut B) -> Result<RunReport, PipelineError> {
        // MANDATORY: preflight is always called.
        let mut preflight = self.preflight(text);

        if !preflight.valid {
            return Err(PipelineError::ValidationFailed(preflight.warnings.join("; ")));
        }

        let entries = parse_sequence(text)?;
        let program = Program::decode(&entries)?;
        let digest = sequence_digest(&entries)?;

        match preflight.check_models(&*backend) {
            Ok(()) => {
                for model in preflight.missing_models() {
                    warn!(model = %model, "Model not downloaded");
                }
            }
            Err(e) => warn!(error = %e, "Could not check model availability"),
        }

        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline_run", run_id = %run_id);
        let _enter = span.enter();

        let started_at = Utc::now();
        info!(instructions = program.len(), digest = %digest, "Pipeline started");

        let mut rng = self.rng();
        let summary = PipelineRun::new(backend, &self.tables, &self.settings, &mut rng)?.execute(&program)?;

        info!(
            renders = summary.renders,
            executed = summary.instructions_executed,
            recoveries = summary.recoveries.len(),
            "Pipeline finished"
        );

        Ok(RunReport {
            run_id,
            engine_version: ENGINE_VERSION.to_string(),
            started_at,
            finished_at: Utc::now(),
            sequence_digest: digest,
            preflight,
            summary,
        })
    }

    fn rng(&self) -> StdRng {
        match self.settings.wildcard_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

impl Default for StoryflowPipeline {
    fn default() -> Self {
        Self::new(MacroTables::default(), EngineSettings::default())
    }
}
