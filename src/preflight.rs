//! Preflight Report - what a sequence will touch, before it runs

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{BackendError, CanvasBackend};
use crate::instruction::split_entry;
use crate::schema::InstructionKind;
use crate::validation::{SchemaViolation, ValidationResult, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDirection {
    Save,
    Load,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperation {
    pub index: usize,
    pub kind: InstructionKind,
    pub path: String,
    pub direction: FileDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub name: String,
    /// `None` until checked against a backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub valid: bool,
    pub instruction_count: usize,
    pub warnings: Vec<String>,
    pub violations: Vec<SchemaViolation>,
    pub models: Vec<ModelStatus>,
    pub files: Vec<FileOperation>,
    /// Number of `prompt` entries.
    pub render_count: usize,
}

impl PreflightReport {
    pub fn from_entries(validator: &Validator, entries: &[Value]) -> Self {
        let validation = validator.validate(entries);
        let mut report = Self::from_validation(validation);

        for (index, entry) in entries.iter().enumerate() {
            let Ok((key, value)) = split_entry(entry) else { continue };
            let Some(kind) = InstructionKind::from_key(key) else { continue };

            if kind == InstructionKind::Prompt {
                report.render_count += 1;
            }

            let direction = if kind.saves_file() {
                FileDirection::Save
            } else if kind.loads_file() {
                FileDirection::Load
            } else {
                continue;
            };
            if let Some(path) = value.as_str() {
                report.files.push(FileOperation {
                    index,
                    kind,
                    path: path.to_string(),
                    direction,
                });
            }
        }

        report
    }

    /// Broken JSON yields a report with one warning and nothing else.
    pub fn from_text(validator: &Validator, text: &str) -> Self {
        match crate::instruction::parse_sequence(text) {
            Ok(entries) => Self::from_entries(validator, &entries),
            Err(_) => Self::from_validation(validator.validate_text(text)),
        }
    }

    fn from_validation(validation: ValidationResult) -> Self {
        Self {
            valid: validation.valid,
            instruction_count: validation.instruction_count,
            warnings: validation.warnings(),
            models: validation
                .model_names
                .iter()
                .map(|name| ModelStatus {
                    name: name.clone(),
                    downloaded: None,
                })
                .collect(),
            violations: validation.violations,
            files: vec![],
            render_count: 0,
        }
    }

    /// Ask the backend which referenced models are present.
    pub fn check_models<B: CanvasBackend + ?Sized>(&mut self, backend: &B) -> Result<(), BackendError> {
        if self.models.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = self.models.iter().map(|m| m.name.clone()).collect();
        let present = backend.models_downloaded(&names)?;

        for (status, downloaded) in self.models.iter_mut().zip(present) {
            status.downloaded = Some(downloaded);
        }
        Ok(())
    }

    pub fn missing_models(&self) -> Vec<&str> {
        self.models
            .iter()
            .filter(|m| m.downloaded == Some(false))
            .map(|m| m.name.as_str())
            .collect()
    }
}
