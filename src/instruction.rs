//! Instructions - raw JSON entries and their typed form
//!
//! A sequence is a JSON array of single-key objects: `[{"prompt": "..."}, ...]`.
//! Validation looks at the raw entries; execution uses the decoded `Program`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::backend::BodyPart;
use crate::configuration::XlTiers;
use crate::schema::InstructionKind;

/// Highest moodboard slot addressed by `moodboardWeights`.
pub const MOODBOARD_SLOTS: usize = 12;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("Item {index}: \"{kind}\" has an unusable value: {message}")]
pub struct PayloadError {
    pub index: usize,
    pub kind: InstructionKind,
    pub message: String,
}

/// Why an entry is not a single-key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryShape {
    NotAnObject,
    Empty,
    MultipleKeys,
}

impl EntryShape {
    pub fn describe(&self) -> &'static str {
        match self {
            EntryShape::NotAnObject => "entry is not an object",
            EntryShape::Empty => "entry has no key",
            EntryShape::MultipleKeys => "entry has more than one key",
        }
    }
}

/// Parse the outer array. Anything but a JSON array is a structural error.
pub fn parse_sequence(text: &str) -> Result<Vec<Value>, serde_json::Error> {
    serde_json::from_str::<Vec<Value>>(text)
}

/// The single key and its value.
pub fn split_entry(entry: &Value) -> Result<(&str, &Value), EntryShape> {
    let obj = entry.as_object().ok_or(EntryShape::NotAnObject)?;
    let mut iter = obj.iter();
    let (key, value) = iter.next().ok_or(EntryShape::Empty)?;
    if iter.next().is_some() {
        return Err(EntryShape::MultipleKeys);
    }
    Ok((key.as_str(), value))
}

/// `JSON type` name as a JavaScript-minded author would read it.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveScale {
    #[serde(rename = "position_X")]
    pub x: f64,
    #[serde(rename = "position_Y")]
    pub y: f64,
    #[serde(rename = "canvas_scale")]
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptSize {
    pub max_width: f64,
    pub max_height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyMaskSpec {
    #[serde(default)]
    pub upper: bool,
    #[serde(default)]
    pub lower: bool,
    #[serde(default)]
    pub clothes: bool,
    #[serde(default)]
    pub neck: bool,
    #[serde(default)]
    pub extra: Option<f64>,
}

impl BodyMaskSpec {
    pub fn parts(&self) -> Vec<BodyPart> {
        let mut parts = Vec::new();
        if self.upper {
            parts.push(BodyPart::UpperBody);
        }
        if self.lower {
            parts.push(BodyPart::LowerBody);
        }
        if self.clothes {
            parts.push(BodyPart::Clothing);
        }
        if self.neck {
            parts.push(BodyPart::Neck);
        }
        parts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoopSpec {
    #[serde(rename = "loop", default)]
    pub count: Option<f64>,
    #[serde(default)]
    pub start: Option<f64>,
}

impl LoopSpec {
    /// Missing or zero count runs the body once. A fractional count runs
    /// while the counter is below it, so `2.5` runs three times.
    pub fn max_loops(&self) -> i64 {
        match self.count {
            Some(n) if n > 0.0 && n.is_finite() => n.ceil() as i64,
            Some(n) if n != 0.0 && n.is_finite() => n.trunc() as i64,
            _ => 1,
        }
    }

    pub fn start_offset(&self) -> i64 {
        self.start.filter(|s| s.is_finite()).map_or(0, |s| s.trunc() as i64)
    }
}

/// A decoded instruction. One variant per `InstructionKind`.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Note,
    Prompt(String),
    NegPrompt(String),
    Config(Map<String, Value>),
    Frames(Value),
    FaceZoom,
    AskZoom(String),
    RemoveBkgd,
    CanvasClear,
    CanvasSave(String),
    CanvasLoad(String),
    MoveScale(MoveScale),
    AdaptSize(AdaptSize),
    Crop,
    MoodboardClear,
    MoodboardCanvas,
    MoodboardLoad,
    MoodboardAdd(String),
    LoopAddMb(String),
    MoodboardRemove(usize),
    MoodboardWeights(Vec<(usize, f64)>),
    MaskClear,
    MaskLoad(String),
    MaskGet,
    MaskBkgd,
    MaskFg,
    MaskBody(BodyMaskSpec),
    MaskAsk(String),
    DepthExtract,
    DepthCanvas,
    DepthToCanvas,
    InpaintTools(Map<String, Value>),
    XlMagic(XlTiers),
    PoseExtract,
    PoseJson(Value),
    PoseClear,
    Loop(LoopSpec),
    LoopLoad(String),
    LoopSave(String),
    LoopEnd,
    End,
}

struct Decoder<'a> {
    index: usize,
    kind: InstructionKind,
    value: &'a Value,
}

impl<'a> Decoder<'a> {
    fn fail(&self, message: impl Into<String>) -> PayloadError {
        PayloadError {
            index: self.index,
            kind: self.kind,
            message: message.into(),
        }
    }

    fn text(&self) -> Result<String, PayloadError> {
        self.value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.fail(format!("expected string, got {}", json_type_name(self.value))))
    }

    fn object(&self) -> Result<Map<String, Value>, PayloadError> {
        self.value
            .as_object()
            .cloned()
            .ok_or_else(|| self.fail(format!("expected object, got {}", json_type_name(self.value))))
    }

    fn record<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.value.clone()).map_err(|e| self.fail(e.to_string()))
    }

    fn number(&self) -> Result<Value, PayloadError> {
        match self.value {
            Value::Number(_) => Ok(self.value.clone()),
            other => Err(self.fail(format!("expected number, got {}", json_type_name(other)))),
        }
    }

    /// Integral floats (`1.0`) count; JSON has no separate integer type.
    fn slot(&self) -> Result<usize, PayloadError> {
        self.value
            .as_u64()
            .or_else(|| {
                self.value
                    .as_f64()
                    .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n <= u32::MAX as f64)
                    .map(|n| n as u64)
            })
            .map(|n| n as usize)
            .ok_or_else(|| self.fail("expected a non-negative moodboard index"))
    }

    fn weights(&self) -> Result<Vec<(usize, f64)>, PayloadError> {
        let obj = self.object()?;
        let mut weights = Vec::new();
        for slot in 0..MOODBOARD_SLOTS {
            if let Some(weight) = obj.get(&format!("index_{}", slot)) {
                let weight = weight
                    .as_f64()
                    .ok_or_else(|| self.fail(format!("index_{} is not a number", slot)))?;
                weights.push((slot, weight));
            }
        }
        Ok(weights)
    }

    /// `maskBody` is a flag kind; a non-object value selects no parts.
    fn body_mask(&self) -> Result<BodyMaskSpec, PayloadError> {
        if self.value.is_object() {
            self.record()
        } else {
            Ok(BodyMaskSpec::default())
        }
    }
}

impl Instruction {
    /// Decode the value of an entry at `index` for a known `kind`.
    pub fn decode(index: usize, kind: InstructionKind, value: &Value) -> Result<Self, PayloadError> {
        use InstructionKind as K;
        let d = Decoder { index, kind, value };

        let instruction = match kind {
            K::Note => Instruction::Note,
            K::Prompt => Instruction::Prompt(d.text()?),
            K::NegPrompt => Instruction::NegPrompt(d.text()?),
            K::Config => Instruction::Config(d.object()?),
            K::Frames => Instruction::Frames(d.number()?),
            K::FaceZoom => Instruction::FaceZoom,
            K::AskZoom => Instruction::AskZoom(d.text()?),
            K::RemoveBkgd => Instruction::RemoveBkgd,
            K::CanvasClear => Instruction::CanvasClear,
            K::CanvasSave => Instruction::CanvasSave(d.text()?),
            K::CanvasLoad => Instruction::CanvasLoad(d.text()?),
            K::MoveScale => Instruction::MoveScale(d.record()?),
            K::AdaptSize => Instruction::AdaptSize(d.record()?),
            K::Crop => Instruction::Crop,
            K::MoodboardClear => Instruction::MoodboardClear,
            K::MoodboardCanvas => Instruction::MoodboardCanvas,
            K::MoodboardLoad => Instruction::MoodboardLoad,
            K::MoodboardAdd => Instruction::MoodboardAdd(d.text()?),
            K::LoopAddMb => Instruction::LoopAddMb(d.text()?),
            K::MoodboardRemove => Instruction::MoodboardRemove(d.slot()?),
            K::MoodboardWeights => Instruction::MoodboardWeights(d.weights()?),
            K::MaskClear => Instruction::MaskClear,
            K::MaskLoad => Instruction::MaskLoad(d.text()?),
            K::MaskGet => Instruction::MaskGet,
            K::MaskBkgd => Instruction::MaskBkgd,
            K::MaskFg => Instruction::MaskFg,
            K::MaskBody => Instruction::MaskBody(d.body_mask()?),
            K::MaskAsk => Instruction::MaskAsk(d.text()?),
            K::DepthExtract => Instruction::DepthExtract,
            K::DepthCanvas => Instruction::DepthCanvas,
            K::DepthToCanvas => Instruction::DepthToCanvas,
            K::InpaintTools => Instruction::InpaintTools(d.object()?),
            K::XlMagic => Instruction::XlMagic(d.record()?),
            K::PoseExtract => Instruction::PoseExtract,
            K::PoseJson => Instruction::PoseJson(Value::Object(d.object()?)),
            K::PoseClear => Instruction::PoseClear,
            K::Loop => Instruction::Loop(d.record()?),
            K::LoopLoad => Instruction::LoopLoad(d.text()?),
            K::LoopSave => Instruction::LoopSave(d.text()?),
            K::LoopEnd => Instruction::LoopEnd,
            K::End => Instruction::End,
        };

        Ok(instruction)
    }

    pub fn kind(&self) -> InstructionKind {
        use InstructionKind as K;
        match self {
            Instruction::Note => K::Note,
            Instruction::Prompt(_) => K::Prompt,
            Instruction::NegPrompt(_) => K::NegPrompt,
            Instruction::Config(_) => K::Config,
            Instruction::Frames(_) => K::Frames,
            Instruction::FaceZoom => K::FaceZoom,
            Instruction::AskZoom(_) => K::AskZoom,
            Instruction::RemoveBkgd => K::RemoveBkgd,
            Instruction::CanvasClear => K::CanvasClear,
            Instruction::CanvasSave(_) => K::CanvasSave,
            Instruction::CanvasLoad(_) => K::CanvasLoad,
            Instruction::MoveScale(_) => K::MoveScale,
            Instruction::AdaptSize(_) => K::AdaptSize,
            Instruction::Crop => K::Crop,
            Instruction::MoodboardClear => K::MoodboardClear,
            Instruction::MoodboardCanvas => K::MoodboardCanvas,
            Instruction::MoodboardLoad => K::MoodboardLoad,
            Instruction::MoodboardAdd(_) => K::MoodboardAdd,
            Instruction::LoopAddMb(_) => K::LoopAddMb,
            Instruction::MoodboardRemove(_) => K::MoodboardRemove,
            Instruction::MoodboardWeights(_) => K::MoodboardWeights,
            Instruction::MaskClear => K::MaskClear,
            Instruction::MaskLoad(_) => K::MaskLoad,
            Instruction::MaskGet => K::MaskGet,
            Instruction::MaskBkgd => K::MaskBkgd,
            Instruction::MaskFg => K::MaskFg,
            Instruction::MaskBody(_) => K::MaskBody,
            Instruction::MaskAsk(_) => K::MaskAsk,
            Instruction::DepthExtract => K::DepthExtract,
            Instruction::DepthCanvas => K::DepthCanvas,
            Instruction::DepthToCanvas => K::DepthToCanvas,
            Instruction::InpaintTools(_) => K::InpaintTools,
            Instruction::XlMagic(_) => K::XlMagic,
            Instruction::PoseExtract => K::PoseExtract,
            Instruction::PoseJson(_) => K::PoseJson,
            Instruction::PoseClear => K::PoseClear,
            Instruction::Loop(_) => K::Loop,
            Instruction::LoopLoad(_) => K::LoopLoad,
            Instruction::LoopSave(_) => K::LoopSave,
            Instruction::LoopEnd => K::LoopEnd,
            Instruction::End => K::End,
        }
    }
}

/// One slot of a decoded program.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Run(Instruction),
    /// Unknown key or malformed entry; logged and skipped at execution.
    Skip { key: String },
}

/// A decoded sequence, positions preserved so loop markers index into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    steps: Vec<Step>,
}

impl Program {
    pub fn decode(entries: &[Value]) -> Result<Self, PayloadError> {
        let mut steps = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            let step = match split_entry(entry) {
                Ok((key, value)) => match InstructionKind::from_key(key) {
                    Some(kind) => Step::Run(Instruction::decode(index, kind, value)?),
                    None => Step::Skip { key: key.to_string() },
                },
                Err(shape) => Step::Skip {
                    key: shape.describe().to_string(),
                },
            };
            steps.push(step);
        }

        Ok(Self { steps })
    }

    pub fn from_instructions(instructions: impl IntoIterator<Item = Instruction>) -> Self {
        Self {
            steps: instructions.into_iter().map(Step::Run).collect(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
