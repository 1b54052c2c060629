//! Validation System - schema checks over a raw instruction sequence
//!
//! Rules produce structured violations. The validator runs every entry
//! through the rules and keeps going, so one report carries every problem.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use crate::instruction::{json_type_name, split_entry, EntryShape, Instruction};
use crate::schema::{InstructionKind, ValueShape};

static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(png|jpg|webp)$").expect("static pattern"));

/// Config fields naming a resource the host must have available.
pub const MODEL_FIELDS: &[&str] = &["model", "refinerModel", "file", "upscaler"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum SchemaViolation {
    /// The text was not a JSON array at all.
    MalformedJson { message: String },
    MalformedInstruction { index: usize, shape: EntryShape },
    UnknownKey { index: usize, kind: String },
    TypeMismatch {
        index: usize,
        kind: InstructionKind,
        expected: String,
        actual: String,
    },
    PathExtension {
        index: usize,
        kind: InstructionKind,
        allowed: Vec<String>,
        actual: String,
    },
    /// Right JSON type, but the engine cannot use the value.
    InvalidPayload {
        index: usize,
        kind: InstructionKind,
        message: String,
    },
}

impl SchemaViolation {
    pub fn index(&self) -> Option<usize> {
        match self {
            SchemaViolation::MalformedJson { .. } => None,
            SchemaViolation::MalformedInstruction { index, .. }
            | SchemaViolation::UnknownKey { index, .. }
            | SchemaViolation::TypeMismatch { index, .. }
            | SchemaViolation::PathExtension { index, .. }
            | SchemaViolation::InvalidPayload { index, .. } => Some(*index),
        }
    }

    /// User-facing warning line.
    pub fn message(&self) -> String {
        match self {
            SchemaViolation::MalformedJson { .. } => {
                "Invalid JSON - please see the Troubleshoot suggestions".to_string()
            }
            SchemaViolation::MalformedInstruction { index, shape } => {
                format!("Item {}: {}", index, shape.describe())
            }
            SchemaViolation::UnknownKey { index, kind } => {
                format!("Item {}: Invalid key \"{}\"", index, kind)
            }
            SchemaViolation::TypeMismatch { index, kind, expected, actual } => {
                format!("Item {}: \"{}\" - Expected {} but got {}", index, kind, expected, actual)
            }
            SchemaViolation::PathExtension { index, kind, allowed, actual } => {
                let allowed: Vec<_> = allowed.iter().map(|e| format!(".{}", e)).collect();
                format!(
                    "Item {}: \"{}\" - Invalid file path or extension. Expected {} but got \"{}\"",
                    index,
                    kind,
                    allowed.join(", "),
                    actual
                )
            }
            SchemaViolation::InvalidPayload { index, kind, message } => {
                format!("Item {}: \"{}\" - {}", index, kind, message)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub instruction_count: usize,
    pub violations: Vec<SchemaViolation>,
    /// Resource names found in `config` payloads, in order of appearance.
    pub model_names: Vec<String>,
}

impl ValidationResult {
    pub fn warnings(&self) -> Vec<String> {
        self.violations.iter().map(SchemaViolation::message).collect()
    }
}

/// Per-entry rule. A rule sees the key, the resolved kind (if any) and the
/// value; the first rule to object decides the entry's violation.
pub trait InstructionRule {
    fn name(&self) -> &'static str;
    fn check(&self, index: usize, key: &str, kind: Option<InstructionKind>, value: &Value) -> Option<SchemaViolation>;
}

// --- Concrete Rules ---

pub struct KnownKeyRule;

impl InstructionRule for KnownKeyRule {
    fn name(&self) -> &'static str { "known_key" }

    fn check(&self, index: usize, key: &str, kind: Option<InstructionKind>, _value: &Value) -> Option<SchemaViolation> {
        match kind {
            Some(_) => None,
            None => Some(SchemaViolation::UnknownKey {
                index,
                kind: key.to_string(),
            }),
        }
    }
}

pub struct ValueTypeRule;

impl InstructionRule for ValueTypeRule {
    fn name(&self) -> &'static str { "value_type" }

    fn check(&self, index: usize, _key: &str, kind: Option<InstructionKind>, value: &Value) -> Option<SchemaViolation> {
        let kind = kind?;
        let shape = kind.shape();
        let matches = match shape {
            ValueShape::Flag => true,
            ValueShape::String | ValueShape::Path(_) => value.is_string(),
            ValueShape::Number => value.is_number(),
            // null is not an object here, unlike `typeof null`
            ValueShape::Object => value.is_object(),
        };

        if matches {
            None
        } else {
            Some(SchemaViolation::TypeMismatch {
                index,
                kind,
                expected: shape.type_name().to_string(),
                actual: json_type_name(value).to_string(),
            })
        }
    }
}

pub struct PathExtensionRule;

impl InstructionRule for PathExtensionRule {
    fn name(&self) -> &'static str { "path_extension" }

    fn check(&self, index: usize, _key: &str, kind: Option<InstructionKind>, value: &Value) -> Option<SchemaViolation> {
        let kind = kind?;
        let allowed = kind.shape().allowed_extensions()?;
        let path = value.as_str()?;

        let extension = EXTENSION_RE
            .captures(path)
            .map(|c| c[1].to_ascii_lowercase());

        match extension {
            Some(ext) if allowed.contains(&ext.as_str()) => None,
            _ => Some(SchemaViolation::PathExtension {
                index,
                kind,
                allowed: allowed.iter().map(|e| e.to_string()).collect(),
                actual: path.to_string(),
            }),
        }
    }
}

/// Decodes the value the way execution will, so a sequence that passes
/// never fails later on its payload.
pub struct PayloadRule;

impl InstructionRule for PayloadRule {
    fn name(&self) -> &'static str { "payload" }

    fn check(&self, index: usize, _key: &str, kind: Option<InstructionKind>, value: &Value) -> Option<SchemaViolation> {
        let kind = kind?;
        Instruction::decode(index, kind, value)
            .err()
            .map(|e| SchemaViolation::InvalidPayload {
                index,
                kind,
                message: e.message,
            })
    }
}

/// Validator orchestrates rules over every entry
pub struct Validator {
    rules: Vec<Box<dyn InstructionRule + Send + Sync>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(KnownKeyRule),
                Box::new(ValueTypeRule),
                Box::new(PathExtensionRule),
                Box::new(PayloadRule),
            ],
        }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Validate raw JSON text. Broken JSON is one violation and zero entries.
    pub fn validate_text(&self, text: &str) -> ValidationResult {
        match crate::instruction::parse_sequence(text) {
            Ok(entries) => self.validate(&entries),
            Err(e) => ValidationResult {
                valid: false,
                instruction_count: 0,
                violations: vec![SchemaViolation::MalformedJson { message: e.to_string() }],
                model_names: vec![],
            },
        }
    }

    pub fn validate(&self, entries: &[Value]) -> ValidationResult {
        let mut violations = vec![];

        for (index, entry) in entries.iter().enumerate() {
            let (key, value) = match split_entry(entry) {
                Ok(pair) => pair,
                Err(shape) => {
                    violations.push(SchemaViolation::MalformedInstruction { index, shape });
                    continue;
                }
            };
            let kind = InstructionKind::from_key(key);

            if let Some(v) = self.rules.iter().find_map(|rule| rule.check(index, key, kind, value)) {
                violations.push(v);
            }
        }

        ValidationResult {
            valid: violations.is_empty(),
            instruction_count: entries.len(),
            violations,
            model_names: collect_model_names(entries),
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// String fields named like a model, found anywhere inside `config` payloads.
/// Entries are visited in sequence order, object fields in key order.
pub fn collect_model_names(entries: &[Value]) -> Vec<String> {
    let mut names = vec![];
    for entry in entries {
        if let Ok((key, value)) = split_entry(entry) {
            if key == InstructionKind::Config.as_str() {
                search_models(value, &mut names);
            }
        }
    }
    names
}

fn search_models(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if MODEL_FIELDS.contains(&key.as_str()) {
                    if let Value::String(name) = child {
                        names.push(name.clone());
                    }
                } else {
                    search_models(child, names);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                search_models(item, names);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(entries: Value) -> ValidationResult {
        Validator::new().validate(entries.as_array().unwrap())
    }

    #[test]
    fn test_clean_sequence_is_valid() {
        let result = validate(json!([
            {"config": {"model": "flux.ckpt", "width": 1024}},
            {"prompt": "a castle"},
            {"canvasSave": "proj/out.PNG"},
            {"maskBody": {"upper": true}},
            {"end": true}
        ]));
        assert!(result.valid);
        assert!(result.violations.is_empty());
        assert_eq!(result.instruction_count, 5);
    }

    #[test]
    fn test_reports_every_violation() {
        let result = validate(json!([
            {"sparkle": true},
            {"prompt": 42},
            {"frames": "17"},
            {"canvasSave": "out.jpg"},
            {"canvasLoad": "in.gif"},
            {"config": null},
            {"moodboardAdd": "ref.webp"}
        ]));

        assert!(!result.valid);
        let indices: Vec<_> = result.violations.iter().filter_map(|v| v.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(
            result.violations[1],
            SchemaViolation::TypeMismatch {
                index: 1,
                kind: InstructionKind::Prompt,
                expected: "string".into(),
                actual: "number".into(),
            }
        );
        assert!(matches!(result.violations[3], SchemaViolation::PathExtension { index: 3, .. }));
    }

    #[test]
    fn test_flags_accept_any_value() {
        let result = validate(json!([
            {"faceZoom": true},
            {"crop": null},
            {"loopEnd": "yes"},
            {"maskBody": 3}
        ]));
        assert!(result.valid);
    }

    #[test]
    fn test_loop_load_takes_any_string() {
        let result = validate(json!([
            {"loopLoad": "batch/folder/"},
            {"loopAddMB": "refs"},
            {"loopSave": "batch/out.png"}
        ]));
        assert!(result.valid);
    }

    #[test]
    fn test_unusable_payloads_are_reported() {
        let result = validate(json!([
            {"xlMagic": {"original": 3}},
            {"moodboardWeights": {"index_1": "heavy"}},
            {"moodboardRemove": 2.0},
            {"adaptSize": {"maxWidth": 800, "maxHeight": 600}}
        ]));
        let indices: Vec<_> = result.violations.iter().filter_map(|v| v.index()).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(result.warnings()[1], "Item 1: \"moodboardWeights\" - index_1 is not a number");
    }

    #[test]
    fn test_malformed_entries() {
        let result = validate(json!([{}, "prompt", {"prompt": "a", "config": {}}]));
        assert_eq!(result.violations.len(), 3);
        assert_eq!(
            result.violations[0],
            SchemaViolation::MalformedInstruction { index: 0, shape: EntryShape::Empty }
        );
    }

    #[test]
    fn test_broken_json_is_one_violation() {
        let result = Validator::new().validate_text("[{\"prompt\": \"a\"}, ");
        assert!(!result.valid);
        assert_eq!(result.instruction_count, 0);
        assert_eq!(result.violations.len(), 1);
        assert!(matches!(result.violations[0], SchemaViolation::MalformedJson { .. }));
    }

    #[test]
    fn test_warning_messages() {
        let result = validate(json!([{"bogus": 1}, {"canvasSave": "x.webp"}]));
        let warnings = result.warnings();
        assert_eq!(warnings[0], "Item 0: Invalid key \"bogus\"");
        assert_eq!(
            warnings[1],
            "Item 1: \"canvasSave\" - Invalid file path or extension. Expected .png but got \"x.webp\""
        );
    }

    #[test]
    fn test_collects_model_names_recursively() {
        let entries = json!([
            {"config": {
                "model": "sdxl.ckpt",
                "refinerModel": "refiner.ckpt",
                "loras": [{"file": "detail.safetensors", "weight": 0.6}],
                "controls": {"inner": {"upscaler": "esrgan.ckpt"}},
                "seed": 7
            }},
            {"prompt": "the model is a cat"},
            {"config": {"model": 12}}
        ]);
        let names = collect_model_names(entries.as_array().unwrap());
        // object fields are visited in key order
        assert_eq!(names, vec!["esrgan.ckpt", "detail.safetensors", "sdxl.ckpt", "refiner.ckpt"]);
    }
}
