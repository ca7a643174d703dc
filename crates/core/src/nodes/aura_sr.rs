//! `AuraSR.AuraSRUpscaler`: upscales an image batch with an AuraSR checkpoint.
//!
//! Models are shared between node instances through the [`ModelRegistry`].
//! The first node to ask for a model loads and owns it; later nodes borrow it
//! by name. Alpha is stripped before inference and re-applied afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::{stack, Array3, ArrayView2, ArrayView3, Axis};
use tracing::{debug, info, warn};

use crate::model_config::{AuraSrConfig, DEFAULT_UPSCALING_FACTOR};
use crate::model_dir::ModelDirectory;
use crate::model_registry::{
    lock_registry, LoadedModel, ModelRegistry, OwnerId, SharedModelRegistry,
};
use crate::node::{ExecutionContext, Node, PortDefinition};
use crate::nodes::aura_model::{InferenceMode, LoadRequest, ModelLoader};
use crate::nodes::backend::{resolve_device, Device, DeviceRequest};
use crate::nodes::transparency::{
    apply_alpha, derive_alpha, mask_matches, resize_alpha, strip_alpha, AlphaPlane,
};
use crate::types::{ImageBatch, MaskBatch, PortData, PortType};

pub const NODE_TYPE: &str = "AuraSR.AuraSRUpscaler";

pub const DEFAULT_TILE_BATCH_SIZE: i64 = 8;
pub const MIN_TILE_BATCH_SIZE: i64 = 1;
pub const MAX_TILE_BATCH_SIZE: i64 = 32;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
enum ModelState {
    Unloaded,
    Loaded { model_name: String },
}

/// Parsed node inputs for one call.
struct UpscaleRequest<'a> {
    image: &'a ImageBatch,
    model_name: &'a str,
    mode: InferenceMode,
    reapply_transparency: bool,
    tile_batch_size: usize,
    device: DeviceRequest,
    offload_to_cpu: bool,
    mask: Option<&'a MaskBatch>,
}

pub struct AuraSrUpscalerNode {
    id: OwnerId,
    registry: SharedModelRegistry,
    models: ModelDirectory,
    loader: Arc<dyn ModelLoader>,
    state: ModelState,
    upscaling_factor: u32,
    device_warned: bool,
}

impl AuraSrUpscalerNode {
    pub fn new(
        registry: SharedModelRegistry,
        models: ModelDirectory,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            models,
            loader,
            state: ModelState::Unloaded,
            upscaling_factor: DEFAULT_UPSCALING_FACTOR,
            device_warned: false,
        }
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, ModelState::Loaded { .. })
    }

    /// Name of the model this node currently uses, owned or borrowed.
    pub fn model_name(&self) -> Option<&str> {
        match &self.state {
            ModelState::Loaded { model_name } => Some(model_name.as_str()),
            ModelState::Unloaded => None,
        }
    }

    pub fn upscaling_factor(&self) -> u32 {
        self.upscaling_factor
    }

    /// Drop this node's model; an owned registry entry is marked unloaded.
    fn unload(&mut self, registry: &mut ModelRegistry) {
        if let ModelState::Loaded { model_name } = &self.state {
            if registry.mark_unloaded(model_name, self.id) {
                info!(model = %model_name, node = self.id, "Unloaded AuraSR model");
            }
        }
        self.state = ModelState::Unloaded;
        self.upscaling_factor = DEFAULT_UPSCALING_FACTOR;
    }

    /// Load `model_name` from disk and register it as owned by this node.
    ///
    /// Returns `Ok(false)` when no config JSON can be found.
    fn load(
        &mut self,
        registry: &mut ModelRegistry,
        model_name: &str,
        device: Device,
    ) -> Result<bool> {
        let checkpoint = self
            .models
            .full_path(model_name)
            .with_context(|| format!("unknown AuraSR model: {model_name}"))?;
        let Some(resolved) = self.models.resolve_config(model_name) else {
            return Ok(false);
        };

        let config = AuraSrConfig::load(&resolved.path)?;
        let factor = config.upscaling_factor_or_default(model_name);

        debug!(
            model = %model_name,
            config = %resolved.path.display(),
            source = ?resolved.source,
            %device,
            factor,
            "Loading AuraSR model"
        );

        let handle = self.loader.load(&LoadRequest {
            model_name,
            config: &config,
            upscaling_factor: factor,
            checkpoint: &checkpoint,
            device,
        })?;

        registry.register(LoadedModel::new(model_name, self.id, config, factor, handle));
        self.state = ModelState::Loaded {
            model_name: model_name.to_string(),
        };
        self.upscaling_factor = factor;
        Ok(true)
    }

    /// Start using another node's entry for `model_name`, moving it to `device`.
    fn borrow(
        &mut self,
        registry: &mut ModelRegistry,
        model_name: &str,
        factor: u32,
        device: Device,
    ) -> Result<()> {
        registry.move_device(model_name, device)?;
        debug!(model = %model_name, node = self.id, %device, "Borrowed AuraSR model");
        self.state = ModelState::Loaded {
            model_name: model_name.to_string(),
        };
        self.upscaling_factor = factor;
        Ok(())
    }

    /// Bring the node to `Loaded(model_name)` on `device`.
    ///
    /// Returns `Ok(false)` if the model has no config and cannot be used.
    fn ensure_model(
        &mut self,
        registry: &mut ModelRegistry,
        model_name: &str,
        device: Device,
    ) -> Result<bool> {
        let in_memory = registry
            .lookup(model_name)
            .map(|entry| entry.upscaling_factor());
        let current = self.model_name() == Some(model_name);

        match in_memory {
            Some(factor) if current => {
                self.upscaling_factor = factor;
                registry.move_device(model_name, device)?;
                Ok(true)
            }
            Some(factor) => {
                self.unload(registry);
                self.borrow(registry, model_name, factor, device)?;
                Ok(true)
            }
            None => {
                self.unload(registry);
                self.load(registry, model_name, device)
            }
        }
    }

    /// Upscale every item of the batch.
    ///
    /// Returns `None` if any item fails inference.
    fn upscale_batch(
        &self,
        registry: &mut ModelRegistry,
        request: &UpscaleRequest<'_>,
    ) -> Option<ImageBatch> {
        let batch = request.image.shape()[0];
        let reapply = request.reapply_transparency && batch == 1;
        if request.reapply_transparency && batch > 1 {
            debug!(batch, "Transparency is only re-applied for single images");
        }

        let mask = request.mask.filter(|m| mask_matches(request.image, m));
        if request.mask.is_some() && mask.is_none() {
            debug!("Transparency mask does not match image, ignoring it");
        }

        let mut upscaled = Vec::with_capacity(batch);
        for (index, item) in request.image.axis_iter(Axis(0)).enumerate() {
            let alpha = if reapply {
                let item_mask = mask.map(|m| m.index_axis(Axis(0), index));
                self.resized_alpha(item, item_mask)
            } else {
                None
            };

            let rgb = strip_alpha(item);
            let output = match registry.upscale(
                request.model_name,
                rgb.view(),
                request.mode,
                request.tile_batch_size,
            ) {
                Ok(output) => output,
                Err(e) => {
                    warn!(
                        model = %request.model_name,
                        index,
                        "Failed to upscale with AuraSR. Returning original image: {e:#}"
                    );
                    return None;
                }
            };

            upscaled.push(match alpha {
                Some(alpha) => reapply_alpha(output, &alpha),
                None => output,
            });
        }

        let views: Vec<ArrayView3<f32>> = upscaled.iter().map(|a| a.view()).collect();
        match stack(Axis(0), &views) {
            Ok(batch) => Some(batch),
            Err(e) => {
                warn!("Failed to assemble upscaled batch: {e}");
                None
            }
        }
    }

    fn resized_alpha(
        &self,
        item: ArrayView3<'_, f32>,
        mask: Option<ArrayView2<'_, f32>>,
    ) -> Option<AlphaPlane> {
        match derive_alpha(item, mask) {
            Ok(alpha) => alpha.map(|a| resize_alpha(&a, self.upscaling_factor)),
            Err(e) => {
                warn!("Failed to derive alpha layer: {e:#}");
                None
            }
        }
    }
}

fn reapply_alpha(rgb: Array3<f32>, alpha: &AlphaPlane) -> Array3<f32> {
    match apply_alpha(rgb.view(), alpha) {
        Ok(rgba) => rgba,
        Err(e) => {
            warn!("Failed to apply alpha layer: {e:#}");
            rgb
        }
    }
}

fn clamp_tile_batch_size(requested: i64) -> usize {
    let clamped = requested.clamp(MIN_TILE_BATCH_SIZE, MAX_TILE_BATCH_SIZE);
    if clamped != requested {
        warn!(requested, clamped, "tile_batch_size out of range, clamping");
    }
    clamped as usize
}

fn parse_request(inputs: &HashMap<String, PortData>) -> Result<UpscaleRequest<'_>> {
    let image = match inputs.get("image") {
        Some(PortData::Image(image)) => image,
        Some(_) => bail!("image must be an Image"),
        None => bail!("image is required"),
    };
    let model_name = match inputs.get("model_name") {
        Some(PortData::Str(name)) => name.as_str(),
        Some(_) => bail!("model_name must be a Str"),
        None => bail!("model_name is required"),
    };

    let mode = match inputs.get("mode") {
        Some(PortData::Str(m)) => InferenceMode::from_str_lossy(m),
        _ => InferenceMode::default(),
    };
    let reapply_transparency = match inputs.get("reapply_transparency") {
        Some(PortData::Bool(b)) => *b,
        _ => true,
    };
    let tile_batch_size = match inputs.get("tile_batch_size") {
        Some(PortData::Int(n)) => clamp_tile_batch_size(*n),
        _ => DEFAULT_TILE_BATCH_SIZE as usize,
    };
    let device = match inputs.get("device") {
        Some(PortData::Str(d)) => DeviceRequest::from_str_lossy(d),
        _ => DeviceRequest::Default,
    };
    let offload_to_cpu = match inputs.get("offload_to_cpu") {
        Some(PortData::Bool(b)) => *b,
        _ => false,
    };
    let mask = match inputs.get("transparency_mask") {
        Some(PortData::Mask(m)) => Some(m),
        Some(_) => bail!("transparency_mask must be a Mask"),
        None => None,
    };

    Ok(UpscaleRequest {
        image,
        model_name,
        mode,
        reapply_transparency,
        tile_batch_size,
        device,
        offload_to_cpu,
        mask,
    })
}

fn image_output(image: ImageBatch) -> HashMap<String, PortData> {
    let mut outputs = HashMap::new();
    outputs.insert("image".to_string(), PortData::Image(image));
    outputs
}

impl Node for AuraSrUpscalerNode {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition {
                name: "model_name".to_string(),
                port_type: PortType::Str,
                required: true,
                default_value: None,
            },
            PortDefinition {
                name: "image".to_string(),
                port_type: PortType::Image,
                required: true,
                default_value: None,
            },
            PortDefinition {
                name: "mode".to_string(),
                port_type: PortType::Str,
                required: false,
                default_value: Some(serde_json::json!("4x")),
            },
            PortDefinition {
                name: "reapply_transparency".to_string(),
                port_type: PortType::Bool,
                required: false,
                default_value: Some(serde_json::json!(true)),
            },
            PortDefinition {
                name: "tile_batch_size".to_string(),
                port_type: PortType::Int,
                required: false,
                default_value: Some(serde_json::json!(DEFAULT_TILE_BATCH_SIZE)),
            },
            PortDefinition {
                name: "device".to_string(),
                port_type: PortType::Str,
                required: false,
                default_value: Some(serde_json::json!("default")),
            },
            PortDefinition {
                name: "offload_to_cpu".to_string(),
                port_type: PortType::Bool,
                required: false,
                default_value: Some(serde_json::json!(false)),
            },
            PortDefinition {
                name: "transparency_mask".to_string(),
                port_type: PortType::Mask,
                required: false,
                default_value: None,
            },
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition {
            name: "image".to_string(),
            port_type: PortType::Image,
            required: true,
            default_value: None,
        }]
    }

    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>> {
        let request = parse_request(inputs)?;
        let device = resolve_device(request.device, &ctx.compute, &mut self.device_warned);

        let shared = Arc::clone(&self.registry);
        let mut registry = lock_registry(&shared)?;

        if !self.ensure_model(&mut registry, request.model_name, device)? {
            warn!(
                model = %request.model_name,
                root = %self.models.root().display(),
                "Could not find a config/ModelName .json file! Please download it from the model's HF page and place it inside the AuraSR model folder. Returning original image."
            );
            return Ok(image_output(request.image.clone()));
        }

        if request.image.shape()[0] == 0 {
            return Ok(image_output(request.image.clone()));
        }

        debug!(
            model = %request.model_name,
            node = self.id,
            %device,
            mode = %request.mode,
            tile_batch_size = request.tile_batch_size,
            shape = ?request.image.shape(),
            "Running AuraSR upscale"
        );

        let Some(upscaled) = self.upscale_batch(&mut registry, &request) else {
            registry.evict(request.model_name);
            self.unload(&mut registry);
            return Ok(image_output(request.image.clone()));
        };

        if request.offload_to_cpu {
            if let Err(e) = registry.move_device(request.model_name, Device::Cpu) {
                warn!(model = %request.model_name, "Failed to offload AuraSR model to CPU: {e:#}");
            }
        }

        Ok(image_output(upscaled))
    }
}
