//! Compute device selection and `ort::Session` construction.
//!
//! Provides [`Device`], the host-facing [`DeviceRequest`], the device
//! policy in [`resolve_device`] and [`build_session`] to create a session
//! with the execution provider that matches a device.

use std::path::Path;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A concrete compute device a model handle can live on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(i32),
}

impl Device {
    /// Parse `cpu`, `cuda` or `cuda:N` (case-insensitive). Unknown values map to `Cpu`.
    pub fn from_str_lossy(s: &str) -> Self {
        let lower = s.trim().to_ascii_lowercase();
        match lower.split_once(':') {
            Some(("cuda", id)) => Self::Cuda(id.trim().parse().unwrap_or(0)),
            _ if lower == "cuda" => Self::Cuda(0),
            _ => Self::Cpu,
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// Device choice as exposed on the node: `"default"` or `"cpu"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceRequest {
    #[default]
    Default,
    Cpu,
}

impl DeviceRequest {
    pub const OPTIONS: [&'static str; 2] = ["default", "cpu"];

    /// Parse from string (case-insensitive). Returns `Default` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            _ => Self::Default,
        }
    }
}

impl std::fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Accelerator the host process is configured for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    #[default]
    Cuda,
    /// Host runs on DirectML; AuraSR cannot run there.
    Directml,
    Cpu,
}

/// What the host reports about compute devices for this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeEnvironment {
    pub preferred: Device,
    /// `false` when the host accelerator is known not to work with the model.
    pub accelerator_supported: bool,
}

impl Default for ComputeEnvironment {
    fn default() -> Self {
        Self {
            preferred: Device::Cpu,
            accelerator_supported: true,
        }
    }
}

impl ComputeEnvironment {
    /// Build the environment for an accelerator, asking ORT whether CUDA is usable.
    pub fn probe(accelerator: Accelerator, device_id: i32) -> Self {
        match accelerator {
            Accelerator::Cpu => Self::default(),
            Accelerator::Directml => Self {
                preferred: Device::Cpu,
                accelerator_supported: false,
            },
            Accelerator::Cuda => {
                let cuda = CUDAExecutionProvider::default();
                if cuda.is_available().unwrap_or(false) {
                    Self {
                        preferred: Device::Cuda(device_id),
                        accelerator_supported: true,
                    }
                } else {
                    warn!("CUDA EP is not available, AuraSR will default to CPU");
                    Self::default()
                }
            }
        }
    }
}

/// Pick the device for one invocation.
///
/// `Cpu` always wins. `Default` follows the host preference unless the host
/// accelerator is unsupported, in which case CPU is forced and a warning is
/// logged once per `warned` flag.
pub fn resolve_device(
    request: DeviceRequest,
    env: &ComputeEnvironment,
    warned: &mut bool,
) -> Device {
    if !env.accelerator_supported {
        if request == DeviceRequest::Default && !*warned {
            warn!("Cannot run AuraSR on DirectML device. Using CPU instead (this will be VERY SLOW!)");
            *warned = true;
        }
        return Device::Cpu;
    }

    match request {
        DeviceRequest::Cpu => Device::Cpu,
        DeviceRequest::Default => env.preferred,
    }
}

/// Build an `ort::Session` for `checkpoint` on `device`.
///
/// `Cuda(id)` registers the CUDA EP with `error_on_failure`, so a missing CUDA
/// runtime surfaces as an error instead of a silent CPU fallback.
pub fn build_session(checkpoint: &Path, device: Device) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match device {
        Device::Cpu => {
            debug!(device = %device, "Building session with CPU EP");
            builder.commit_from_file(checkpoint).with_context(|| {
                format!("Failed to load ONNX checkpoint: {}", checkpoint.display())
            })?
        }
        Device::Cuda(device_id) => {
            debug!(device = %device, "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure()])?
                .commit_from_file(checkpoint)
                .with_context(|| {
                    format!("Failed to load ONNX checkpoint: {}", checkpoint.display())
                })?
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cuda_env() -> ComputeEnvironment {
        ComputeEnvironment {
            preferred: Device::Cuda(0),
            accelerator_supported: true,
        }
    }

    fn directml_env() -> ComputeEnvironment {
        ComputeEnvironment {
            preferred: Device::Cpu,
            accelerator_supported: false,
        }
    }

    #[test]
    fn test_device_from_str_lossy() {
        assert_eq!(Device::from_str_lossy("cpu"), Device::Cpu);
        assert_eq!(Device::from_str_lossy("CPU"), Device::Cpu);
        assert_eq!(Device::from_str_lossy("cuda"), Device::Cuda(0));
        assert_eq!(Device::from_str_lossy("cuda:1"), Device::Cuda(1));
        assert_eq!(Device::from_str_lossy("CUDA:3"), Device::Cuda(3));
        assert_eq!(Device::from_str_lossy("cuda:x"), Device::Cuda(0));
        assert_eq!(Device::from_str_lossy("mps"), Device::Cpu);
        assert_eq!(Device::from_str_lossy(""), Device::Cpu);
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(0).to_string(), "cuda:0");
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn test_device_request_from_str_lossy() {
        assert_eq!(DeviceRequest::from_str_lossy("default"), DeviceRequest::Default);
        assert_eq!(DeviceRequest::from_str_lossy("cpu"), DeviceRequest::Cpu);
        assert_eq!(DeviceRequest::from_str_lossy(" CPU "), DeviceRequest::Cpu);
        assert_eq!(DeviceRequest::from_str_lossy("cuda"), DeviceRequest::Default);
        assert_eq!(DeviceRequest::from_str_lossy(""), DeviceRequest::Default);
    }

    #[test]
    fn test_cpu_request_forces_cpu() {
        let mut warned = false;
        let device = resolve_device(DeviceRequest::Cpu, &cuda_env(), &mut warned);
        assert_eq!(device, Device::Cpu);
        assert!(!warned);
    }

    #[test]
    fn test_default_request_follows_host() {
        let mut warned = false;
        let device = resolve_device(DeviceRequest::Default, &cuda_env(), &mut warned);
        assert_eq!(device, Device::Cuda(0));
        assert!(!warned);
    }

    #[test]
    fn test_unsupported_accelerator_forces_cpu_and_warns_once() {
        let mut warned = false;
        let env = directml_env();

        assert_eq!(
            resolve_device(DeviceRequest::Default, &env, &mut warned),
            Device::Cpu
        );
        assert!(warned);

        assert_eq!(
            resolve_device(DeviceRequest::Default, &env, &mut warned),
            Device::Cpu
        );
        assert!(warned);
    }

    #[test]
    fn test_unsupported_accelerator_cpu_request_does_not_warn() {
        let mut warned = false;
        let device = resolve_device(DeviceRequest::Cpu, &directml_env(), &mut warned);
        assert_eq!(device, Device::Cpu);
        assert!(!warned);
    }

    #[test]
    fn test_probe_cpu_and_directml() {
        assert_eq!(
            ComputeEnvironment::probe(Accelerator::Cpu, 0),
            ComputeEnvironment::default()
        );
        let directml = ComputeEnvironment::probe(Accelerator::Directml, 0);
        assert!(!directml.accelerator_supported);
        assert_eq!(directml.preferred, Device::Cpu);
    }

    #[test]
    fn test_accelerator_serde_lowercase() {
        let json = serde_json::to_string(&Accelerator::Directml).unwrap();
        assert_eq!(json, "\"directml\"");
        let parsed: Accelerator = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(parsed, Accelerator::Cuda);
    }
}
