use std::collections::HashMap;

use anyhow::Result;

use crate::nodes::backend::ComputeEnvironment;
use crate::types::{PortData, PortType};

#[derive(Debug, Clone, PartialEq)]
pub struct PortDefinition {
    pub name: String,
    pub port_type: PortType,
    pub required: bool,
    pub default_value: Option<serde_json::Value>,
}

/// Per-invocation state the host hands to a node.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub compute: ComputeEnvironment,
}

impl ExecutionContext {
    pub fn with_compute(compute: ComputeEnvironment) -> Self {
        Self { compute }
    }
}

/// Core node trait that all nodes implement.
pub trait Node: Send + Sync {
    fn node_type(&self) -> &str;
    fn input_ports(&self) -> Vec<PortDefinition>;
    fn output_ports(&self) -> Vec<PortDefinition>;
    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>>;
}
