//! Process-wide cache of loaded AuraSR models.
//!
//! Entries are unique by model file name. The node that loaded a model owns
//! its entry; other nodes asking for the same name borrow it by name and go
//! through the registry for every access, so a device move made by any of
//! them is seen by all.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use ndarray::{Array3, ArrayView3};
use tracing::{debug, info};

use crate::model_config::AuraSrConfig;
use crate::nodes::aura_model::{InferenceMode, SuperResModel};
use crate::nodes::backend::Device;

/// Identifies the node instance that loaded an entry.
pub type OwnerId = u64;

pub type SharedModelRegistry = Arc<Mutex<ModelRegistry>>;

pub struct LoadedModel {
    name: String,
    owner: OwnerId,
    config: AuraSrConfig,
    upscaling_factor: u32,
    /// `None` once unloaded; the slot itself is pruned on the next lookup.
    handle: Option<Box<dyn SuperResModel>>,
}

impl LoadedModel {
    pub fn new(
        name: impl Into<String>,
        owner: OwnerId,
        config: AuraSrConfig,
        upscaling_factor: u32,
        handle: Box<dyn SuperResModel>,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            config,
            upscaling_factor,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn config(&self) -> &AuraSrConfig {
        &self.config
    }

    pub fn upscaling_factor(&self) -> u32 {
        self.upscaling_factor
    }

    /// Current device of the handle, `None` once unloaded.
    pub fn device(&self) -> Option<Device> {
        self.handle.as_ref().map(|h| h.device())
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("upscaling_factor", &self.upscaling_factor)
            .field("device", &self.device())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    entries: Vec<LoadedModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedModelRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Find the loaded entry for `name`.
    ///
    /// Slots of that name that were marked unloaded are dropped first.
    pub fn lookup(&mut self, name: &str) -> Option<&LoadedModel> {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name || e.is_loaded());
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(model = %name, pruned, "Pruned unloaded AuraSR models");
        }
        self.entries.iter().find(|e| e.name == name)
    }

    /// Add `model`, replacing any entry that already uses its name.
    pub fn register(&mut self, model: LoadedModel) {
        self.entries.retain(|e| e.name != model.name);
        info!(
            model = %model.name,
            owner = model.owner,
            device = ?model.device(),
            factor = model.upscaling_factor,
            "Registered AuraSR model"
        );
        self.entries.push(model);
    }

    /// Release `owner`'s handle for `name`; the empty slot is pruned on the
    /// next lookup.
    ///
    /// Returns `false` if `owner` does not own a loaded entry of that name.
    pub fn mark_unloaded(&mut self, name: &str, owner: OwnerId) -> bool {
        let released = self
            .entries
            .iter_mut()
            .find(|e| e.name == name && e.owner == owner)
            .and_then(|e| e.handle.take());
        match released {
            Some(handle) => {
                drop(handle);
                debug!(model = %name, owner, "Released AuraSR model");
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `name` whoever owns it, dropping its handle.
    ///
    /// Used after an inference failure: the shared handle may be in a bad
    /// state, so borrowers must not keep using it either.
    pub fn evict(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        let evicted = before != self.entries.len();
        if evicted {
            info!(model = %name, "Evicted AuraSR model");
        }
        evicted
    }

    /// Move the shared handle for `name` to `device`.
    pub fn move_device(&mut self, name: &str, device: Device) -> Result<()> {
        let handle = self.handle_mut(name)?;
        let from = handle.device();
        if from == device {
            return Ok(());
        }
        handle
            .move_to(device)
            .with_context(|| format!("failed to move {name} from {from} to {device}"))?;
        info!(model = %name, %from, to = %device, "Moved AuraSR model");
        Ok(())
    }

    /// Upscale one RGB image with the shared handle for `name`.
    pub fn upscale(
        &mut self,
        name: &str,
        rgb: ArrayView3<'_, f32>,
        mode: InferenceMode,
        max_batch_size: usize,
    ) -> Result<Array3<f32>> {
        self.handle_mut(name)?.upscale(rgb, mode, max_batch_size)
    }

    pub fn device_of(&self, name: &str) -> Option<Device> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .and_then(LoadedModel::device)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn handle_mut(&mut self, name: &str) -> Result<&mut Box<dyn SuperResModel>> {
        self.entries
            .iter_mut()
            .find(|e| e.name == name)
            .and_then(|e| e.handle.as_mut())
            .ok_or_else(|| anyhow!("AuraSR model {name} is not loaded"))
    }
}

/// Lock the shared registry, turning a poisoned lock into an error.
pub fn lock_registry(shared: &SharedModelRegistry) -> Result<MutexGuard<'_, ModelRegistry>> {
    shared
        .lock()
        .map_err(|_| anyhow!("AuraSR model registry lock poisoned"))
}
