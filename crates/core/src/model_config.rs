//! AuraSR JSON model configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Factor used whenever the config does not yield a usable one.
pub const DEFAULT_UPSCALING_FACTOR: u32 = 4;

/// Model configuration as shipped next to the checkpoint.
///
/// All keys are kept so the loader sees the full object; only `image_size`
/// and `input_image_size` are interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuraSrConfig {
    raw: Map<String, Value>,
}

impl AuraSrConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse AuraSR config JSON")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read AuraSR config: {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid AuraSR config: {}", path.display()))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Output tile edge in pixels.
    pub fn image_size(&self) -> Option<f64> {
        self.get("image_size").and_then(Value::as_f64)
    }

    /// Input tile edge in pixels.
    pub fn input_image_size(&self) -> Option<f64> {
        self.get("input_image_size").and_then(Value::as_f64)
    }

    /// Integer quotient `image_size / input_image_size`, `None` when it cannot be computed.
    ///
    /// A quotient below 1 is rejected rather than truncated to 0, so such
    /// configs fall back to [`DEFAULT_UPSCALING_FACTOR`] as well.
    pub fn upscaling_factor(&self) -> Option<u32> {
        self.factor_or_reason().ok()
    }

    /// [`upscaling_factor`](Self::upscaling_factor), falling back to
    /// [`DEFAULT_UPSCALING_FACTOR`] with a warning naming the reason.
    pub fn upscaling_factor_or_default(&self, model_name: &str) -> u32 {
        self.factor_or_reason().unwrap_or_else(|reason| {
            warn!(
                model = %model_name,
                default = DEFAULT_UPSCALING_FACTOR,
                %reason,
                "Unusable upscaling factor in config, using default"
            );
            DEFAULT_UPSCALING_FACTOR
        })
    }

    fn factor_or_reason(&self) -> Result<u32, &'static str> {
        let image_size = self.image_size().ok_or("image_size missing or not a number")?;
        let input_size = self
            .input_image_size()
            .ok_or("input_image_size missing or not a number")?;
        if input_size <= 0.0 || image_size <= 0.0 {
            return Err("sizes must be positive");
        }

        let factor = (image_size / input_size).trunc();
        if !factor.is_finite() || factor > u32::MAX as f64 {
            return Err("quotient out of range");
        }
        if factor < 1.0 {
            return Err("image_size is smaller than input_image_size (factor < 1)");
        }
        Ok(factor as u32)
    }
}
