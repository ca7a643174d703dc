use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::model_dir::ModelDirectory;
use crate::model_registry::{ModelRegistry, SharedModelRegistry};
use crate::node::Node;
use crate::nodes::aura_model::{ModelLoader, OrtModelLoader};

type NodeFactory =
    dyn Fn(HashMap<String, serde_json::Value>) -> Result<Box<dyn Node>> + Send + Sync;

pub struct NodeRegistry {
    factories: HashMap<String, Box<NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(HashMap<String, serde_json::Value>) -> Result<Box<dyn Node>> + Send + Sync + 'static,
    {
        self.factories
            .insert(node_type.to_string(), Box::new(factory));
    }

    pub fn create(
        &self,
        node_type: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<Box<dyn Node>> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| anyhow!("unknown node type: {node_type}"))?;

        factory(params)
    }

    pub fn list_node_types(&self) -> Vec<&str> {
        let mut node_types: Vec<&str> = self.factories.keys().map(|v| v.as_str()).collect();
        node_types.sort_unstable();
        node_types
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state handed to every node the factories create.
#[derive(Clone)]
pub struct NodeDependencies {
    pub models: SharedModelRegistry,
    pub model_dir: ModelDirectory,
    pub loader: Arc<dyn ModelLoader>,
}

impl NodeDependencies {
    /// Fresh model registry and the ONNX loader.
    pub fn new(model_dir: ModelDirectory) -> Self {
        Self {
            models: ModelRegistry::shared(),
            model_dir,
            loader: Arc::new(OrtModelLoader),
        }
    }
}

/// Register all node types from the `aurasr-core` crate.
///
/// Every upscaler node created here shares `deps.models`, so a model loaded
/// by one node is borrowed by the others.
pub fn register_all_nodes(registry: &mut NodeRegistry, deps: &NodeDependencies) {
    use crate::nodes::aura_sr::{AuraSrUpscalerNode, NODE_TYPE};

    let deps = deps.clone();
    registry.register(NODE_TYPE, move |_params| {
        Ok(Box::new(AuraSrUpscalerNode::new(
            Arc::clone(&deps.models),
            deps.model_dir.clone(),
            Arc::clone(&deps.loader),
        )))
    });
}
