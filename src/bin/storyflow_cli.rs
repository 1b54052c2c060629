//! Storyflow CLI - check, resolve and dry-run instruction sequences
//!
//! Commands: check, resolve, run
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on validation failure

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use storyflow_core::{DryRunBackend, EngineSettings, MacroTables, PipelineError, StoryflowPipeline};

#[derive(Parser)]
#[command(name = "storyflow-cli")]
#[command(about = "Storyflow CLI - instruction engine for image-generation workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine settings file (JSON)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an instruction file and print the preflight report
    Check {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Resolve prompt text against macro tables
    Resolve {
        #[arg(short, long)]
        macros: Option<PathBuf>,

        #[arg(short, long)]
        text: String,
    },

    /// Execute an instruction file against the dry-run backend
    Run {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        macros: Option<PathBuf>,

        /// Root for relative save/load paths
        #[arg(short, long, default_value = ".")]
        pictures: PathBuf,
    },
}

fn init_tracing(level: &str) {
    let fallback = match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "error" => "error",
        _ => "warn",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => fail(format!("Cannot serialize output: {}", e)),
    }
}

fn fail(error: impl ToString) -> ExitCode {
    let output = serde_json::json!({
        "success": false,
        "error": error.to_string(),
    });
    println!("{}", output);
    ExitCode::FAILURE
}

fn load_macros(path: Option<&Path>) -> Result<MacroTables, String> {
    let Some(path) = path else {
        return Ok(MacroTables::default());
    };
    let content = fs::read_to_string(path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("Invalid macro tables: {}", e))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let settings = match &cli.settings {
        Some(path) => match EngineSettings::load(path) {
            Ok(s) => s,
            Err(e) => return fail(e),
        },
        None => EngineSettings::default(),
    };

    match cli.command {
        Commands::Check { file } => {
            let text = match fs::read_to_string(&file) {
                Ok(t) => t,
                Err(e) => return fail(format!("Cannot read {}: {}", file.display(), e)),
            };

            let pipeline = StoryflowPipeline::new(MacroTables::default(), settings);
            let report = pipeline.preflight(&text);
            let code = print_json(&report);
            if report.valid {
                code
            } else {
                ExitCode::from(2) // Validation failure
            }
        }

        Commands::Resolve { macros, text } => {
            let tables = match load_macros(macros.as_deref()) {
                Ok(t) => t,
                Err(e) => return fail(e),
            };

            let pipeline = StoryflowPipeline::new(tables, settings);
            match pipeline.resolve_prompt(&text) {
                Ok(resolved) => print_json(&serde_json::json!({ "success": true, "text": resolved })),
                Err(e) => fail(e),
            }
        }

        Commands::Run { file, macros, pictures } => {
            let text = match fs::read_to_string(&file) {
                Ok(t) => t,
                Err(e) => return fail(format!("Cannot read {}: {}", file.display(), e)),
            };
            let tables = match load_macros(macros.as_deref()) {
                Ok(t) => t,
                Err(e) => return fail(e),
            };

            let pipeline = StoryflowPipeline::new(tables, settings);
            let mut backend = DryRunBackend::new(pictures);

            match pipeline.run(&text, &mut backend) {
                Ok(report) => print_json(&serde_json::json!({
                    "success": true,
                    "report": report,
                    "calls": backend.calls(),
                })),
                Err(e @ PipelineError::ValidationFailed(_)) => {
                    let _ = fail(e);
                    ExitCode::from(2) // Validation failure
                }
                Err(e) => fail(e),
            }
        }
    }
}
