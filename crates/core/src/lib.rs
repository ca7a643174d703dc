//! Core crate for the AuraSR upscaler node.

pub mod config;
pub mod descriptor;
pub mod logging;
pub mod model_config;
pub mod model_dir;
pub mod model_registry;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod runtime;
pub mod types;
