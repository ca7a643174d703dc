//! Node descriptors: static metadata for all registered node types.
//!
//! These descriptors provide display names, categories and full port
//! definitions (image streams and params) for the host's node editor. They
//! are a separate data path from the runtime `Node::input_ports()` /
//! `output_ports()`.

use anyhow::Result;
use serde::Serialize;

use crate::model_dir::ModelDirectory;
use crate::nodes::aura_model::InferenceMode;
use crate::nodes::aura_sr::{
    DEFAULT_TILE_BATCH_SIZE, MAX_TILE_BATCH_SIZE, MIN_TILE_BATCH_SIZE, NODE_TYPE,
};
use crate::nodes::backend::DeviceRequest;

#[derive(Debug, Clone, Serialize)]
pub struct NodeDescriptor {
    pub node_type: String,
    pub display_name: String,
    pub category: String,
    pub inputs: Vec<PortDescriptor>,
    pub outputs: Vec<PortDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortDescriptor {
    pub name: String,
    /// "Image", "Mask", "Int", "Str", "Bool"
    pub port_type: String,
    /// "stream" or "param"
    pub direction: String,
    pub required: bool,
    pub default_value: Option<serde_json::Value>,
    /// "model_selector", "enum", etc.
    pub ui_hint: Option<String>,
    pub enum_options: Option<Vec<String>>,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

/// Helper to build a stream port descriptor.
fn stream(name: &str, port_type: &str) -> PortDescriptor {
    PortDescriptor {
        name: name.to_string(),
        port_type: port_type.to_string(),
        direction: "stream".to_string(),
        required: true,
        default_value: None,
        ui_hint: None,
        enum_options: None,
        min: None,
        max: None,
    }
}

/// Helper to build a required param port descriptor.
fn param_required(name: &str, port_type: &str) -> PortDescriptor {
    PortDescriptor {
        direction: "param".to_string(),
        ..stream(name, port_type)
    }
}

/// Helper to build an optional param port descriptor with a default value.
fn param_opt(name: &str, port_type: &str, default: serde_json::Value) -> PortDescriptor {
    PortDescriptor {
        required: false,
        default_value: Some(default),
        ..param_required(name, port_type)
    }
}

fn options(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
}

/// Descriptor for the upscaler, with `model_name` offering `model_names`.
pub fn aura_sr_descriptor(model_names: Vec<String>) -> NodeDescriptor {
    NodeDescriptor {
        node_type: NODE_TYPE.to_string(),
        display_name: "AuraSR Upscaler".to_string(),
        category: "AuraSR".to_string(),
        inputs: vec![
            PortDescriptor {
                ui_hint: Some("model_selector".to_string()),
                enum_options: Some(model_names),
                ..param_required("model_name", "Str")
            },
            stream("image", "Image"),
            PortDescriptor {
                ui_hint: Some("enum".to_string()),
                enum_options: options(&InferenceMode::OPTIONS),
                ..param_opt("mode", "Str", serde_json::json!("4x"))
            },
            param_opt("reapply_transparency", "Bool", serde_json::json!(true)),
            PortDescriptor {
                min: Some(MIN_TILE_BATCH_SIZE),
                max: Some(MAX_TILE_BATCH_SIZE),
                ..param_opt(
                    "tile_batch_size",
                    "Int",
                    serde_json::json!(DEFAULT_TILE_BATCH_SIZE),
                )
            },
            PortDescriptor {
                ui_hint: Some("enum".to_string()),
                enum_options: options(&DeviceRequest::OPTIONS),
                ..param_opt("device", "Str", serde_json::json!("default"))
            },
            param_opt("offload_to_cpu", "Bool", serde_json::json!(false)),
            PortDescriptor {
                required: false,
                ..stream("transparency_mask", "Mask")
            },
        ],
        outputs: vec![stream("image", "Image")],
    }
}

/// Returns descriptors for all registered node types.
pub fn all_node_descriptors(models: &ModelDirectory) -> Result<Vec<NodeDescriptor>> {
    Ok(vec![aura_sr_descriptor(models.list_models()?)])
}
