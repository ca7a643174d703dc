//! AuraSR model handle: the inference seam used by the upscaler node.
//!
//! [`SuperResModel`] and [`ModelLoader`] are what the node and the model
//! registry talk to. [`OrtModelLoader`] backs them with an ONNX checkpoint run
//! through `ort`, splitting the image into fixed-size tiles that are batched
//! `max_batch_size` at a time.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array2, Array3, Array4, ArrayView3, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::model_config::AuraSrConfig;
use crate::nodes::backend::{build_session, Device};

/// Tiling strategy used for one upscale call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceMode {
    /// Non-overlapping tile grid.
    #[default]
    FourX,
    /// Two grids, the second shifted by half a tile, blended towards tile centres.
    CheckerboardOverlap,
    /// One grid with a stride of three quarters of a tile, blended towards tile centres.
    ConstantOverlap,
}

impl InferenceMode {
    pub const OPTIONS: [&'static str; 3] = ["4x", "checkerboard-overlap", "constant-overlap"];

    /// Parse from string (case-insensitive). Returns `FourX` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "checkerboard-overlap" | "checkerboard" => Self::CheckerboardOverlap,
            "constant-overlap" | "overlap" => Self::ConstantOverlap,
            _ => Self::FourX,
        }
    }

    /// `(offset, stride)` in input pixels for every tile grid of this mode.
    fn grids(&self, tile: usize) -> Vec<(usize, usize)> {
        match self {
            Self::FourX => vec![(0, tile)],
            Self::CheckerboardOverlap => vec![(0, tile), (tile / 2, tile)],
            Self::ConstantOverlap => vec![(0, (tile * 3 / 4).max(1))],
        }
    }

    fn blends(&self) -> bool {
        !matches!(self, Self::FourX)
    }
}

impl std::fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FourX => write!(f, "4x"),
            Self::CheckerboardOverlap => write!(f, "checkerboard-overlap"),
            Self::ConstantOverlap => write!(f, "constant-overlap"),
        }
    }
}

/// A loaded super-resolution model living on one device.
pub trait SuperResModel: Send {
    fn device(&self) -> Device;

    /// Move the model to `device`; a no-op when it is already there.
    fn move_to(&mut self, device: Device) -> Result<()>;

    /// Upscale one `[height, width, 3]` RGB image with values in `[0, 1]`.
    fn upscale(
        &mut self,
        rgb: ArrayView3<'_, f32>,
        mode: InferenceMode,
        max_batch_size: usize,
    ) -> Result<Array3<f32>>;
}

/// Everything needed to construct a model handle.
pub struct LoadRequest<'a> {
    pub model_name: &'a str,
    pub config: &'a AuraSrConfig,
    pub upscaling_factor: u32,
    pub checkpoint: &'a Path,
    pub device: Device,
}

/// Builds model handles from a config and checkpoint, loading weights strictly.
pub trait ModelLoader: Send + Sync {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn SuperResModel>>;
}

/// [`ModelLoader`] for ONNX checkpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtModelLoader;

impl ModelLoader for OrtModelLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn SuperResModel>> {
        Ok(Box::new(OrtAuraSr::load(request)?))
    }
}

pub struct OrtAuraSr {
    session: Session,
    checkpoint: PathBuf,
    device: Device,
    tile_size: usize,
    scale: usize,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OrtAuraSr {
    pub fn load(request: &LoadRequest<'_>) -> Result<Self> {
        let session = build_session(request.checkpoint, request.device)?;

        let input = session
            .inputs()
            .first()
            .context("AuraSR checkpoint has no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("AuraSR checkpoint has no outputs")?;

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let input_dims = tensor_dims(input.dtype());
        let output_dims = tensor_dims(output.dtype());
        let is_fp16 = matches!(
            input.dtype(),
            ort::value::ValueType::Tensor { ty, .. } if *ty == ort::tensor::TensorElementType::Float16
        );

        let tile_size = match request.config.input_image_size() {
            Some(size) if size >= 1.0 => size as usize,
            _ => match static_spatial(&input_dims) {
                Some(size) => size,
                None => bail!(
                    "cannot determine tile size for {}: config has no input_image_size and the checkpoint input is dynamic",
                    request.model_name
                ),
            },
        };
        let scale = request.upscaling_factor as usize;

        check_spatial("input", &input_dims, tile_size, request.model_name)?;
        check_spatial("output", &output_dims, tile_size * scale, request.model_name)?;

        debug!(
            model = %request.model_name,
            device = %request.device,
            %input_name, %output_name, tile_size, scale, is_fp16,
            "Loaded AuraSR checkpoint"
        );

        Ok(Self {
            session,
            checkpoint: request.checkpoint.to_path_buf(),
            device: request.device,
            tile_size,
            scale,
            input_name,
            output_name,
            is_fp16,
        })
    }

    fn run_batch(&mut self, batch: Array4<f32>) -> Result<Array4<f32>> {
        let expected = [
            batch.shape()[0],
            3,
            self.tile_size * self.scale,
            self.tile_size * self.scale,
        ];

        let output = if self.is_fp16 {
            let shape = batch.shape().to_vec();
            let contiguous = batch.as_standard_layout();
            let f32_slice = contiguous
                .as_slice()
                .context("tile batch must be contiguous")?;
            let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
            fp16_data.convert_from_f32_slice(f32_slice);
            let fp16_array = ndarray::ArrayD::from_shape_vec(shape, fp16_data)?;

            let input_tensor = Tensor::from_array(fp16_array)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            output_view.mapv(f16::to_f32).into_dimensionality::<Ix4>()?
        } else {
            let input_tensor = Tensor::from_array(batch)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            output_view.to_owned().into_dimensionality::<Ix4>()?
        };

        if output.shape() != expected {
            bail!(
                "AuraSR output shape mismatch: expected {:?}, got {:?}",
                expected,
                output.shape()
            );
        }
        Ok(output)
    }
}

impl SuperResModel for OrtAuraSr {
    fn device(&self) -> Device {
        self.device
    }

    fn move_to(&mut self, device: Device) -> Result<()> {
        if device == self.device {
            return Ok(());
        }
        debug!(from = %self.device, to = %device, "Moving AuraSR session");
        self.session = build_session(&self.checkpoint, device)?;
        self.device = device;
        Ok(())
    }

    fn upscale(
        &mut self,
        rgb: ArrayView3<'_, f32>,
        mode: InferenceMode,
        max_batch_size: usize,
    ) -> Result<Array3<f32>> {
        let tile = self.tile_size;
        let scale = self.scale;
        upscale_tiled(rgb, mode, tile, scale, max_batch_size, |batch| {
            self.run_batch(batch)
        })
    }
}

/// Run `infer` over the tile grids of `mode` and stitch the results.
///
/// `infer` maps `[n, 3, tile, tile]` to `[n, 3, tile * scale, tile * scale]`.
/// Returns `[height * scale, width * scale, 3]`, clamped to `[0, 1]`.
pub(crate) fn upscale_tiled<F>(
    rgb: ArrayView3<'_, f32>,
    mode: InferenceMode,
    tile: usize,
    scale: usize,
    max_batch_size: usize,
    mut infer: F,
) -> Result<Array3<f32>>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>>,
{
    let (h, w, channels) = rgb.dim();
    if channels != 3 {
        bail!("AuraSR expects 3-channel RGB input, got {channels} channels");
    }
    if h == 0 || w == 0 {
        bail!("cannot upscale an empty {h}x{w} image");
    }
    if tile == 0 || scale == 0 {
        bail!("invalid tiling: tile={tile}, scale={scale}");
    }

    let out_h = h * scale;
    let out_w = w * scale;
    let chw = rgb.permuted_axes([2, 0, 1]);
    let weights = tile_weights(tile * scale, mode.blends());
    let mut acc = Array3::<f32>::zeros((3, out_h, out_w));
    let mut weight_sum = Array2::<f32>::zeros((out_h, out_w));
    let batch_size = max_batch_size.max(1);

    for (offset, stride) in mode.grids(tile) {
        let origins = grid_origins(h, w, tile, offset, stride);

        debug!(
            %mode, tile, offset, stride,
            tiles = origins.len(),
            batch_size,
            "Running AuraSR tile grid"
        );

        for chunk in origins.chunks(batch_size) {
            let mut batch = Array4::<f32>::zeros((chunk.len(), 3, tile, tile));
            for (i, &(oy, ox)) in chunk.iter().enumerate() {
                for c in 0..3 {
                    for ty in 0..tile {
                        let sy = clamp_source(oy + ty, offset, h);
                        for tx in 0..tile {
                            let sx = clamp_source(ox + tx, offset, w);
                            batch[[i, c, ty, tx]] = chw[[c, sy, sx]];
                        }
                    }
                }
            }

            let upscaled = infer(batch)?;
            let out_tile = tile * scale;
            if upscaled.shape() != [chunk.len(), 3, out_tile, out_tile] {
                bail!(
                    "tile batch shape mismatch: expected {:?}, got {:?}",
                    [chunk.len(), 3, out_tile, out_tile],
                    upscaled.shape()
                );
            }

            for (i, &(oy, ox)) in chunk.iter().enumerate() {
                for ty in 0..out_tile {
                    let Some(y) = (oy * scale + ty).checked_sub(offset * scale) else {
                        continue;
                    };
                    if y >= out_h {
                        continue;
                    }
                    for tx in 0..out_tile {
                        let Some(x) = (ox * scale + tx).checked_sub(offset * scale) else {
                            continue;
                        };
                        if x >= out_w {
                            continue;
                        }
                        let wgt = weights[[ty, tx]];
                        for c in 0..3 {
                            acc[[c, y, x]] += upscaled[[i, c, ty, tx]] * wgt;
                        }
                        weight_sum[[y, x]] += wgt;
                    }
                }
            }
        }
    }

    let mut out = Array3::<f32>::zeros((out_h, out_w, 3));
    for y in 0..out_h {
        for x in 0..out_w {
            let total = weight_sum[[y, x]].max(f32::EPSILON);
            for c in 0..3 {
                out[[y, x, c]] = (acc[[c, y, x]] / total).clamp(0.0, 1.0);
            }
        }
    }
    Ok(out)
}

/// Top-left corners (canvas coordinates) covering an `h x w` image shifted by `offset`.
fn grid_origins(
    h: usize,
    w: usize,
    tile: usize,
    offset: usize,
    stride: usize,
) -> Vec<(usize, usize)> {
    let axis = |len: usize| -> Vec<usize> {
        let end = offset + len;
        let mut starts = Vec::new();
        let mut pos = 0usize;
        loop {
            starts.push(pos);
            if pos + tile >= end {
                break;
            }
            pos += stride;
        }
        starts
    };

    let ys = axis(h);
    let xs = axis(w);
    ys.iter()
        .flat_map(|&y| xs.iter().map(move |&x| (y, x)))
        .collect()
}

/// Map a canvas coordinate back into the image, replicating edge pixels.
fn clamp_source(canvas: usize, offset: usize, len: usize) -> usize {
    canvas.saturating_sub(offset).min(len - 1)
}

/// Per-pixel blend weights for one output tile: flat, or a tent peaking at the centre.
fn tile_weights(size: usize, centred: bool) -> Array2<f32> {
    if !centred {
        return Array2::ones((size, size));
    }
    let ramp: Vec<f32> = (0..size)
        .map(|i| (i + 1).min(size - i) as f32)
        .collect();
    Array2::from_shape_fn((size, size), |(y, x)| ramp[y] * ramp[x])
}

fn tensor_dims(value_type: &ort::value::ValueType) -> Vec<i64> {
    match value_type {
        ort::value::ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
        _ => Vec::new(),
    }
}

fn static_spatial(dims: &[i64]) -> Option<usize> {
    match dims {
        [_, _, h, w] if *h > 0 && *h == *w => Some(*h as usize),
        _ => None,
    }
}

/// Strict weight check: a static spatial size must match what the config promises.
fn check_spatial(which: &str, dims: &[i64], expected: usize, model_name: &str) -> Result<()> {
    if dims.len() != 4 {
        bail!(
            "{model_name}: expected a 4-D {which} tensor, checkpoint declares {:?}",
            dims
        );
    }
    for &dim in &dims[2..] {
        if dim > 0 && dim as usize != expected {
            bail!(
                "{model_name}: checkpoint {which} size {dim} does not match config ({expected})"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Nearest-neighbour "model": every input pixel becomes a `scale x scale` block.
    fn nearest_model(scale: usize) -> impl FnMut(Array4<f32>) -> Result<Array4<f32>> {
        move |batch: Array4<f32>| {
            let (n, c, h, w) = batch.dim();
            Ok(Array4::from_shape_fn((n, c, h * scale, w * scale), |(i, ch, y, x)| {
                batch[[i, ch, y / scale, x / scale]]
            }))
        }
    }

    fn gradient(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            ((y * w + x) as f32 / (h * w) as f32 + c as f32 * 0.1).min(1.0)
        })
    }

    #[test]
    fn test_inference_mode_from_str_lossy() {
        assert_eq!(InferenceMode::from_str_lossy("4x"), InferenceMode::FourX);
        assert_eq!(
            InferenceMode::from_str_lossy("Checkerboard-Overlap"),
            InferenceMode::CheckerboardOverlap
        );
        assert_eq!(
            InferenceMode::from_str_lossy("constant-overlap"),
            InferenceMode::ConstantOverlap
        );
        assert_eq!(InferenceMode::from_str_lossy("bogus"), InferenceMode::FourX);
    }

    #[test]
    fn test_inference_mode_display_matches_options() {
        let shown: Vec<String> = [
            InferenceMode::FourX,
            InferenceMode::CheckerboardOverlap,
            InferenceMode::ConstantOverlap,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(shown, InferenceMode::OPTIONS);
    }

    #[test]
    fn test_grid_origins_cover_image() {
        assert_eq!(grid_origins(8, 8, 4, 0, 4), vec![(0, 0), (0, 4), (4, 0), (4, 4)]);
        assert_eq!(grid_origins(3, 3, 4, 0, 4), vec![(0, 0)]);
        assert_eq!(grid_origins(5, 4, 4, 0, 4), vec![(0, 0), (4, 0)]);
        // Shifted grid needs one extra row/column to reach the far edge.
        assert_eq!(grid_origins(8, 4, 4, 2, 4).len(), 3 * 2);
    }

    #[test]
    fn test_tile_weights() {
        let flat = tile_weights(4, false);
        assert!(flat.iter().all(|&v| v == 1.0));

        let tent = tile_weights(4, true);
        assert_eq!(tent[[0, 0]], 1.0);
        assert_eq!(tent[[1, 1]], 4.0);
        assert!(tent.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_four_x_output_dimensions() {
        let img = Array3::<f32>::from_elem((128, 128, 3), 0.5);
        let out = upscale_tiled(img.view(), InferenceMode::FourX, 64, 4, 8, nearest_model(4))
            .unwrap();
        assert_eq!(out.dim(), (512, 512, 3));
        assert!(out.iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_all_modes_reproduce_nearest_upscale() {
        let img = gradient(10, 7);
        for mode in [
            InferenceMode::FourX,
            InferenceMode::CheckerboardOverlap,
            InferenceMode::ConstantOverlap,
        ] {
            let out = upscale_tiled(img.view(), mode, 4, 2, 3, nearest_model(2)).unwrap();
            assert_eq!(out.dim(), (20, 14, 3), "mode {mode}");
            for y in 0..20 {
                for x in 0..14 {
                    for c in 0..3 {
                        let expected = img[[y / 2, x / 2, c]];
                        assert!(
                            (out[[y, x, c]] - expected).abs() < 1e-5,
                            "mode {mode} pixel ({y},{x},{c}): {} vs {expected}",
                            out[[y, x, c]]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_batches_respect_max_batch_size() {
        let img = Array3::<f32>::zeros((8, 8, 3));
        let mut seen = Vec::new();
        upscale_tiled(img.view(), InferenceMode::FourX, 2, 1, 3, |batch| {
            seen.push(batch.shape()[0]);
            Ok(batch)
        })
        .unwrap();
        assert_eq!(seen, vec![3, 3, 3, 3, 3, 1]);
    }

    #[test]
    fn test_output_is_clamped() {
        let img = Array3::<f32>::from_elem((4, 4, 3), 0.5);
        let out = upscale_tiled(img.view(), InferenceMode::FourX, 4, 1, 1, |batch| {
            Ok(batch.mapv(|v| v * 4.0))
        })
        .unwrap();
        assert!(out.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_rejects_rgba_and_empty() {
        let rgba = Array3::<f32>::zeros((4, 4, 4));
        let err = upscale_tiled(rgba.view(), InferenceMode::FourX, 4, 2, 1, nearest_model(2))
            .unwrap_err();
        assert!(err.to_string().contains("3-channel"));

        let empty = Array3::<f32>::zeros((0, 4, 3));
        assert!(
            upscale_tiled(empty.view(), InferenceMode::FourX, 4, 2, 1, nearest_model(2)).is_err()
        );
    }

    #[test]
    fn test_wrong_model_output_shape_is_an_error() {
        let img = Array3::<f32>::zeros((4, 4, 3));
        let err = upscale_tiled(img.view(), InferenceMode::FourX, 4, 2, 1, |batch| Ok(batch))
            .unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_inference_error_propagates() {
        let img = Array3::<f32>::zeros((4, 4, 3));
        let err = upscale_tiled(img.view(), InferenceMode::FourX, 4, 2, 1, |_| {
            bail!("out of memory")
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "out of memory");
    }

    #[test]
    fn test_static_spatial_and_check() {
        assert_eq!(static_spatial(&[-1, 3, 64, 64]), Some(64));
        assert_eq!(static_spatial(&[-1, 3, -1, -1]), None);
        assert!(check_spatial("input", &[-1, 3, 64, 64], 64, "m").is_ok());
        assert!(check_spatial("input", &[-1, 3, -1, -1], 64, "m").is_ok());
        assert!(check_spatial("input", &[1, 3, 32, 32], 64, "m").is_err());
        assert!(check_spatial("input", &[3, 64, 64], 64, "m").is_err());
    }

    /// Requires an AuraSR ONNX export. Run: `cargo test -p aurasr-core -- --ignored`
    #[test]
    #[ignore]
    fn test_ort_checkpoint_upscale() {
        let config =
            AuraSrConfig::from_json(r#"{"image_size": 256, "input_image_size": 64}"#).unwrap();
        let checkpoint = PathBuf::from("models/Aura-SR/model.onnx");
        let mut model = OrtModelLoader
            .load(&LoadRequest {
                model_name: "model.onnx",
                config: &config,
                upscaling_factor: 4,
                checkpoint: &checkpoint,
                device: Device::Cpu,
            })
            .expect("checkpoint should load");

        let img = Array3::<f32>::from_elem((64, 96, 3), 0.5);
        let out = model.upscale(img.view(), InferenceMode::FourX, 4).unwrap();
        assert_eq!(out.dim(), (256, 384, 3));
    }
}
