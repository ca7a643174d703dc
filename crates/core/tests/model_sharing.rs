use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use ndarray::{Array3, Array4, ArrayView3};
use tempfile::TempDir;

use aurasr_core::model_dir::ModelDirectory;
use aurasr_core::model_registry::{lock_registry, ModelRegistry, SharedModelRegistry};
use aurasr_core::node::{ExecutionContext, Node};
use aurasr_core::nodes::aura_model::{InferenceMode, LoadRequest, ModelLoader, SuperResModel};
use aurasr_core::nodes::aura_sr::AuraSrUpscalerNode;
use aurasr_core::nodes::backend::{ComputeEnvironment, Device};
use aurasr_core::registry::{register_all_nodes, NodeDependencies, NodeRegistry};
use aurasr_core::types::{ImageBatch, PortData};

/// Nearest-neighbour stand-in for a real checkpoint.
struct NearestModel {
    factor: usize,
    device: Device,
    fail: Arc<AtomicBool>,
    drops: Arc<AtomicUsize>,
}

impl Drop for NearestModel {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl SuperResModel for NearestModel {
    fn device(&self) -> Device {
        self.device
    }

    fn move_to(&mut self, device: Device) -> Result<()> {
        self.device = device;
        Ok(())
    }

    fn upscale(
        &mut self,
        rgb: ArrayView3<'_, f32>,
        _mode: InferenceMode,
        _max_batch_size: usize,
    ) -> Result<Array3<f32>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("CUDA out of memory");
        }
        let (h, w, c) = rgb.dim();
        let f = self.factor;
        Ok(Array3::from_shape_fn((h * f, w * f, c), |(y, x, ch)| {
            rgb[[y / f, x / f, ch]]
        }))
    }
}

#[derive(Default)]
struct CountingLoader {
    loads: AtomicUsize,
    loaded_names: Mutex<Vec<String>>,
    fail: Arc<AtomicBool>,
    drops: Arc<AtomicUsize>,
}

impl ModelLoader for CountingLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn SuperResModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.loaded_names
            .lock()
            .unwrap()
            .push(request.model_name.to_string());
        Ok(Box::new(NearestModel {
            factor: request.upscaling_factor as usize,
            device: request.device,
            fail: Arc::clone(&self.fail),
            drops: Arc::clone(&self.drops),
        }))
    }
}

struct Fixture {
    _dir: TempDir,
    models: ModelDirectory,
    registry: SharedModelRegistry,
    loader: Arc<CountingLoader>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Aura-SR");
        fs::create_dir_all(root.join("v2")).unwrap();

        fs::write(root.join("model.onnx"), b"onnx").unwrap();
        fs::write(
            root.join("config.json"),
            r#"{"image_size": 256, "input_image_size": 64}"#,
        )
        .unwrap();
        fs::write(root.join("other.onnx"), b"onnx").unwrap();
        fs::write(
            root.join("other.json"),
            r#"{"image_size": 128, "input_image_size": 64}"#,
        )
        .unwrap();
        // Only the root config.json is available for this one.
        fs::write(root.join("v2").join("fallback.onnx"), b"onnx").unwrap();

        let models = ModelDirectory::locate(dir.path()).unwrap();
        Self {
            _dir: dir,
            models,
            registry: ModelRegistry::shared(),
            loader: Arc::new(CountingLoader::default()),
        }
    }

    fn node(&self) -> AuraSrUpscalerNode {
        AuraSrUpscalerNode::new(
            Arc::clone(&self.registry),
            self.models.clone(),
            self.loader.clone(),
        )
    }

    fn loads(&self) -> usize {
        self.loader.loads.load(Ordering::SeqCst)
    }

    fn drops(&self) -> usize {
        self.loader.drops.load(Ordering::SeqCst)
    }

    fn device_of(&self, name: &str) -> Option<Device> {
        lock_registry(&self.registry).unwrap().device_of(name)
    }
}

fn inputs(model_name: &str, image: ImageBatch) -> HashMap<String, PortData> {
    let mut inputs = HashMap::new();
    inputs.insert("image".to_string(), PortData::Image(image));
    inputs.insert(
        "model_name".to_string(),
        PortData::Str(model_name.to_string()),
    );
    inputs
}

fn run(node: &mut dyn Node, inputs: &HashMap<String, PortData>, ctx: &ExecutionContext) -> ImageBatch {
    let outputs = node.execute(inputs, ctx).expect("execute should succeed");
    match outputs.get("image") {
        Some(PortData::Image(image)) => image.clone(),
        other => panic!("expected image output, got {other:?}"),
    }
}

fn cuda_ctx() -> ExecutionContext {
    ExecutionContext::with_compute(ComputeEnvironment {
        preferred: Device::Cuda(0),
        accelerator_supported: true,
    })
}

#[test]
fn second_node_borrows_loaded_model() {
    let fx = Fixture::new();
    let ctx = ExecutionContext::default();
    let mut a = fx.node();
    let mut b = fx.node();
    let image = Array4::<f32>::from_elem((1, 8, 8, 3), 0.5);

    run(&mut a, &inputs("model.onnx", image.clone()), &ctx);
    let out = run(&mut b, &inputs("model.onnx", image), &ctx);

    assert_eq!(out.shape(), &[1, 32, 32, 3]);
    assert_eq!(fx.loads(), 1);
    assert_eq!(b.upscaling_factor(), 4);
    assert_eq!(lock_registry(&fx.registry).unwrap().len(), 1);
    assert_eq!(
        lock_registry(&fx.registry)
            .unwrap()
            .lookup("model.onnx")
            .unwrap()
            .owner(),
        a.id()
    );
}

#[test]
fn borrower_device_move_is_seen_by_owner() {
    let fx = Fixture::new();
    let mut owner = fx.node();
    let mut borrower = fx.node();
    let image = Array4::<f32>::zeros((1, 4, 4, 3));

    run(&mut owner, &inputs("model.onnx", image.clone()), &cuda_ctx());
    assert_eq!(fx.device_of("model.onnx"), Some(Device::Cuda(0)));

    let mut cpu_inputs = inputs("model.onnx", image.clone());
    cpu_inputs.insert("device".to_string(), PortData::Str("cpu".to_string()));
    run(&mut borrower, &cpu_inputs, &cuda_ctx());
    assert_eq!(fx.device_of("model.onnx"), Some(Device::Cpu));

    // The owner moves it back, and the borrower observes that.
    run(&mut owner, &inputs("model.onnx", image), &cuda_ctx());
    assert_eq!(fx.device_of("model.onnx"), Some(Device::Cuda(0)));
    assert_eq!(fx.loads(), 1);
}

#[test]
fn offload_propagates_to_registry() {
    let fx = Fixture::new();
    let mut owner = fx.node();
    let mut borrower = fx.node();
    let image = Array4::<f32>::zeros((1, 4, 4, 3));

    run(&mut owner, &inputs("model.onnx", image.clone()), &cuda_ctx());

    let mut offload = inputs("model.onnx", image);
    offload.insert("offload_to_cpu".to_string(), PortData::Bool(true));
    run(&mut borrower, &offload, &cuda_ctx());

    assert_eq!(fx.device_of("model.onnx"), Some(Device::Cpu));
}

#[test]
fn registry_names_stay_unique_across_switches() {
    let fx = Fixture::new();
    let ctx = ExecutionContext::default();
    let mut a = fx.node();
    let mut b = fx.node();
    let image = Array4::<f32>::zeros((1, 4, 4, 3));

    run(&mut a, &inputs("model.onnx", image.clone()), &ctx);
    run(&mut b, &inputs("model.onnx", image.clone()), &ctx);

    // The owner switches away; its entry is marked unloaded.
    let out = run(&mut a, &inputs("other.onnx", image.clone()), &ctx);
    assert_eq!(out.shape(), &[1, 8, 8, 3]);
    assert_eq!(a.upscaling_factor(), 2);

    // The borrower notices and loads its own copy.
    run(&mut b, &inputs("model.onnx", image.clone()), &ctx);
    run(&mut a, &inputs("model.onnx", image), &ctx);

    let mut registry = lock_registry(&fx.registry).unwrap();
    let mut names = registry.names();
    names.sort_unstable();
    assert_eq!(names, vec!["model.onnx", "other.onnx"]);
    assert_eq!(registry.lookup("model.onnx").unwrap().owner(), b.id());
    assert_eq!(fx.loads(), 3);
}

#[test]
fn inference_failure_returns_input_and_forces_reload() {
    let fx = Fixture::new();
    let ctx = ExecutionContext::default();
    let mut node = fx.node();
    let image = Array4::<f32>::from_elem((1, 4, 4, 3), 0.25);

    fx.loader.fail.store(true, Ordering::SeqCst);
    let out = run(&mut node, &inputs("model.onnx", image.clone()), &ctx);
    assert_eq!(out, image);
    assert!(!node.is_loaded());

    fx.loader.fail.store(false, Ordering::SeqCst);
    let out = run(&mut node, &inputs("model.onnx", image), &ctx);
    assert_eq!(out.shape(), &[1, 16, 16, 3]);
    assert!(node.is_loaded());
    assert_eq!(fx.loads(), 2);
}

#[test]
fn switching_models_releases_previous_handle() {
    let fx = Fixture::new();
    let ctx = ExecutionContext::default();
    let mut node = fx.node();
    let image = Array4::<f32>::zeros((1, 4, 4, 3));

    run(&mut node, &inputs("model.onnx", image.clone()), &ctx);
    assert_eq!(fx.drops(), 0);

    run(&mut node, &inputs("other.onnx", image), &ctx);
    // Released at unload time, before anything looks model.onnx up again.
    assert_eq!(fx.drops(), 1);
    assert_eq!(fx.device_of("model.onnx"), None);
    assert_eq!(fx.device_of("other.onnx"), Some(Device::Cpu));
}

#[test]
fn borrower_failure_evicts_shared_model() {
    let fx = Fixture::new();
    let ctx = ExecutionContext::default();
    let mut owner = fx.node();
    let mut borrower = fx.node();
    let image = Array4::<f32>::from_elem((1, 4, 4, 3), 0.25);

    run(&mut owner, &inputs("model.onnx", image.clone()), &ctx);
    run(&mut borrower, &inputs("model.onnx", image.clone()), &ctx);
    assert_eq!(fx.loads(), 1);

    fx.loader.fail.store(true, Ordering::SeqCst);
    let out = run(&mut borrower, &inputs("model.onnx", image.clone()), &ctx);
    assert_eq!(out, image);
    assert!(!borrower.is_loaded());
    assert_eq!(fx.drops(), 1);
    assert!(lock_registry(&fx.registry)
        .unwrap()
        .lookup("model.onnx")
        .is_none());

    // The owner must not keep using the evicted handle.
    fx.loader.fail.store(false, Ordering::SeqCst);
    let out = run(&mut owner, &inputs("model.onnx", image), &ctx);
    assert_eq!(out.shape(), &[1, 16, 16, 3]);
    assert_eq!(fx.loads(), 2);
    assert_eq!(
        lock_registry(&fx.registry)
            .unwrap()
            .lookup("model.onnx")
            .unwrap()
            .owner(),
        owner.id()
    );
}

#[test]
fn batch_never_reapplies_transparency() {
    let fx = Fixture::new();
    let mut node = fx.node();
    let image = Array4::<f32>::from_elem((2, 4, 4, 4), 0.5);

    let out = run(
        &mut node,
        &inputs("model.onnx", image),
        &ExecutionContext::default(),
    );
    assert_eq!(out.shape(), &[2, 16, 16, 3]);
}

#[test]
fn single_image_mask_becomes_alpha() {
    let fx = Fixture::new();
    let mut node = fx.node();

    let mut mask = Array3::<f32>::zeros((1, 4, 4));
    mask[[0, 3, 3]] = 1.0;
    let mut inputs = inputs("model.onnx", Array4::from_elem((1, 4, 4, 3), 0.5));
    inputs.insert("transparency_mask".to_string(), PortData::Mask(mask));

    let out = run(&mut node, &inputs, &ExecutionContext::default());
    assert_eq!(out.shape(), &[1, 16, 16, 4]);
    assert_eq!(out[[0, 0, 0, 3]], 1.0);
    assert_eq!(out[[0, 15, 15, 3]], 0.0);
}

#[test]
fn mismatched_mask_falls_back_to_image_alpha() {
    let fx = Fixture::new();
    let mut node = fx.node();

    let mut inputs = inputs("model.onnx", Array4::from_elem((1, 4, 4, 3), 0.5));
    inputs.insert(
        "transparency_mask".to_string(),
        PortData::Mask(Array3::zeros((1, 2, 2))),
    );

    let out = run(&mut node, &inputs, &ExecutionContext::default());
    assert_eq!(out.shape(), &[1, 16, 16, 3]);
}

#[test]
fn root_config_is_used_for_subfolder_checkpoint() {
    let fx = Fixture::new();
    let mut node = fx.node();

    let out = run(
        &mut node,
        &inputs("v2/fallback.onnx", Array4::zeros((1, 2, 2, 3))),
        &ExecutionContext::default(),
    );
    assert_eq!(out.shape(), &[1, 8, 8, 3]);
    assert_eq!(
        *fx.loader.loaded_names.lock().unwrap(),
        vec!["v2/fallback.onnx".to_string()]
    );
}

#[test]
fn nodes_from_factory_share_models() {
    let fx = Fixture::new();
    let deps = NodeDependencies {
        models: Arc::clone(&fx.registry),
        model_dir: fx.models.clone(),
        loader: fx.loader.clone(),
    };
    let mut registry = NodeRegistry::new();
    register_all_nodes(&mut registry, &deps);

    let mut a = registry
        .create("AuraSR.AuraSRUpscaler", HashMap::new())
        .unwrap();
    let mut b = registry
        .create("AuraSR.AuraSRUpscaler", HashMap::new())
        .unwrap();

    let image = Array4::<f32>::zeros((1, 4, 4, 3));
    let ctx = ExecutionContext::default();
    run(a.as_mut(), &inputs("model.onnx", image.clone()), &ctx);
    run(b.as_mut(), &inputs("model.onnx", image), &ctx);

    assert_eq!(fx.loads(), 1);
}
