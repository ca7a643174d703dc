use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

/// Image batch in host layout: `[batch, height, width, channels]`, values in `[0, 1]`.
///
/// Channels are 3 (RGB) or 4 (RGBA).
pub type ImageBatch = Array4<f32>;

/// Mask batch in host layout: `[batch, height, width]`, values in `[0, 1]`.
pub type MaskBatch = Array3<f32>;

/// Port type identifier for connection validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Image,
    Mask,
    Int,
    Str,
    Bool,
}

impl PortType {
    pub fn is_compatible(&self, other: &PortType) -> bool {
        self == other
    }
}

impl std::fmt::Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "Image"),
            Self::Mask => write!(f, "Mask"),
            Self::Int => write!(f, "Int"),
            Self::Str => write!(f, "Str"),
            Self::Bool => write!(f, "Bool"),
        }
    }
}

/// Data types that can flow between node ports.
#[derive(Debug, Clone)]
pub enum PortData {
    Image(ImageBatch),
    Mask(MaskBatch),
    Int(i64),
    Str(String),
    Bool(bool),
}

impl PortData {
    pub fn port_type(&self) -> PortType {
        match self {
            Self::Image(_) => PortType::Image,
            Self::Mask(_) => PortType::Mask,
            Self::Int(_) => PortType::Int,
            Self::Str(_) => PortType::Str,
            Self::Bool(_) => PortType::Bool,
        }
    }
}
