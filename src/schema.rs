//! Instruction Schema - the static key/shape table
//!
//! Every instruction key the engine understands lives here, bound to the
//! value shape the validator checks it against.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Extensions accepted by the path check, case-insensitive.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "webp"];
const PNG_ONLY: &[&str] = &["png"];

/// Expected runtime shape of an instruction value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// Any value, including `true`, `null` or an object.
    Flag,
    String,
    Number,
    Object,
    /// A string ending in one of the allowed image extensions.
    Path(&'static [&'static str]),
}

impl ValueShape {
    /// Name of the JSON type this shape expects, as reported in violations.
    pub fn type_name(&self) -> &'static str {
        match self {
            ValueShape::Flag => "flag",
            ValueShape::String | ValueShape::Path(_) => "string",
            ValueShape::Number => "number",
            ValueShape::Object => "object",
        }
    }

    pub fn allowed_extensions(&self) -> Option<&'static [&'static str]> {
        match self {
            ValueShape::Path(exts) => Some(*exts),
            _ => None,
        }
    }
}

macro_rules! instruction_kinds {
    ($($variant:ident => $key:literal : $shape:expr),+ $(,)?) => {
        /// Closed set of instruction keys.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum InstructionKind {
            $(
                #[serde(rename = $key)]
                $variant,
            )+
        }

        impl InstructionKind {
            pub const ALL: &'static [InstructionKind] = &[$(InstructionKind::$variant),+];

            /// The JSON key for this kind.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(InstructionKind::$variant => $key,)+
                }
            }

            pub fn from_key(key: &str) -> Option<Self> {
                match key {
                    $($key => Some(InstructionKind::$variant),)+
                    _ => None,
                }
            }

            pub fn shape(&self) -> ValueShape {
                match self {
                    $(InstructionKind::$variant => $shape,)+
                }
            }
        }
    };
}

instruction_kinds! {
    Note => "note": ValueShape::String,
    Prompt => "prompt": ValueShape::String,
    NegPrompt => "negPrompt": ValueShape::String,
    Config => "config": ValueShape::Object,
    Frames => "frames": ValueShape::Number,
    FaceZoom => "faceZoom": ValueShape::Flag,
    AskZoom => "askZoom": ValueShape::String,
    RemoveBkgd => "removeBkgd": ValueShape::Flag,
    CanvasClear => "canvasClear": ValueShape::Flag,
    CanvasSave => "canvasSave": ValueShape::Path(PNG_ONLY),
    CanvasLoad => "canvasLoad": ValueShape::Path(IMAGE_EXTENSIONS),
    MoveScale => "moveScale": ValueShape::Object,
    AdaptSize => "adaptSize": ValueShape::Object,
    Crop => "crop": ValueShape::Flag,
    MoodboardClear => "moodboardClear": ValueShape::Flag,
    MoodboardCanvas => "moodboardCanvas": ValueShape::Flag,
    MoodboardLoad => "moodboardLoad": ValueShape::Flag,
    MoodboardAdd => "moodboardAdd": ValueShape::Path(IMAGE_EXTENSIONS),
    LoopAddMb => "loopAddMB": ValueShape::String,
    MoodboardRemove => "moodboardRemove": ValueShape::Number,
    MoodboardWeights => "moodboardWeights": ValueShape::Object,
    MaskClear => "maskClear": ValueShape::Flag,
    MaskLoad => "maskLoad": ValueShape::Path(IMAGE_EXTENSIONS),
    MaskGet => "maskGet": ValueShape::Flag,
    MaskBkgd => "maskBkgd": ValueShape::Flag,
    MaskFg => "maskFG": ValueShape::Flag,
    MaskBody => "maskBody": ValueShape::Flag,
    MaskAsk => "maskAsk": ValueShape::String,
    DepthExtract => "depthExtract": ValueShape::Flag,
    DepthCanvas => "depthCanvas": ValueShape::Flag,
    DepthToCanvas => "depthToCanvas": ValueShape::Flag,
    InpaintTools => "inpaintTools": ValueShape::Object,
    XlMagic => "xlMagic": ValueShape::Object,
    PoseExtract => "poseExtract": ValueShape::Flag,
    PoseJson => "poseJSON": ValueShape::Object,
    PoseClear => "poseClear": ValueShape::Flag,
    Loop => "loop": ValueShape::Object,
    LoopLoad => "loopLoad": ValueShape::String,
    LoopSave => "loopSave": ValueShape::Path(PNG_ONLY),
    LoopEnd => "loopEnd": ValueShape::Flag,
    End => "end": ValueShape::Flag,
}

impl InstructionKind {
    /// Kinds whose string value names a file written by the run.
    pub fn saves_file(&self) -> bool {
        matches!(self, InstructionKind::CanvasSave | InstructionKind::LoopSave)
    }

    /// Kinds whose string value names a file or folder read by the run.
    pub fn loads_file(&self) -> bool {
        matches!(
            self,
            InstructionKind::CanvasLoad
                | InstructionKind::MoodboardAdd
                | InstructionKind::MaskLoad
                | InstructionKind::LoopLoad
                | InstructionKind::LoopAddMb
        )
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_map_back_to_kinds() {
        for kind in InstructionKind::ALL {
            assert_eq!(InstructionKind::from_key(kind.as_str()), Some(*kind));
        }
        assert_eq!(InstructionKind::ALL.len(), 41);
    }

    #[test]
    fn test_unknown_and_case_sensitive_keys() {
        assert_eq!(InstructionKind::from_key("pipeline"), None);
        assert_eq!(InstructionKind::from_key("Prompt"), None);
        assert_eq!(InstructionKind::from_key("maskFG"), Some(InstructionKind::MaskFg));
    }

    #[test]
    fn test_path_shapes() {
        assert_eq!(InstructionKind::CanvasSave.shape().allowed_extensions(), Some(PNG_ONLY));
        assert_eq!(InstructionKind::LoopLoad.shape(), ValueShape::String);
        assert_eq!(InstructionKind::LoopAddMb.shape(), ValueShape::String);
        assert_eq!(InstructionKind::CanvasLoad.shape().type_name(), "string");
        assert!(InstructionKind::MaskBody.shape() == ValueShape::Flag);
    }

    #[test]
    fn test_serde_uses_json_keys() {
        let json = serde_json::to_string(&InstructionKind::LoopAddMb).unwrap();
        assert_eq!(json, "\"loopAddMB\"");
    }
}
