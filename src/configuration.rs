//! Pipeline Configuration - generation parameters owned by one run

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::Size;

/// XL latent size tiers, indexed 1..=8.
pub const XL_SIZE_TIERS: [(u32, u32); 8] = [
    (256, 192),
    (512, 384),
    (768, 576),
    (1024, 768),
    (1280, 960),
    (1536, 1152),
    (1792, 1344),
    (2048, 1536),
];

/// Three 1-based tier indices. Out-of-range values are clamped into 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XlTiers {
    pub original: f64,
    pub target: f64,
    pub negative: f64,
}

/// Size for a 1-based tier, clamped.
pub fn xl_tier(tier: f64) -> (u32, u32) {
    let index = (tier.trunc() as i64).clamp(1, XL_SIZE_TIERS.len() as i64) - 1;
    XL_SIZE_TIERS[index as usize]
}

/// Generation parameters as a JSON object. Fields the engine does not know
/// about pass through untouched to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(Map<String, Value>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Shallow merge, last write wins per top-level field.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (k, v) in patch {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn width(&self) -> f64 {
        self.number("width")
    }

    pub fn height(&self) -> f64 {
        self.number("height")
    }

    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    pub fn set_size(&mut self, width: f64, height: f64) {
        self.set("width", number_value(width));
        self.set("height", number_value(height));
    }

    pub fn set_frames(&mut self, frames: Value) {
        self.0.insert("numFrames".to_string(), frames);
    }

    /// Writes original, target and negative-original width/height.
    pub fn apply_xl_magic(&mut self, tiers: &XlTiers) {
        let (ow, oh) = xl_tier(tiers.original);
        let (tw, th) = xl_tier(tiers.target);
        let (nw, nh) = xl_tier(tiers.negative);

        self.set("originalImageWidth", ow);
        self.set("originalImageHeight", oh);
        self.set("targetImageWidth", tw);
        self.set("targetImageHeight", th);
        self.set("negativeOriginalImageWidth", nw);
        self.set("negativeOriginalImageHeight", nh);
    }

    fn number(&self, field: &str) -> f64 {
        self.0.get(field).and_then(Value::as_f64).unwrap_or(0.0)
    }
}

/// Whole numbers stay integers in the JSON the backend sees.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}
