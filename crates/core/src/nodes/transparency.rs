//! Alpha-channel handling around the RGB-only upscaler.
//!
//! The model only sees RGB. Transparency is taken from an explicit mask or
//! the image's own alpha channel, scaled by the upscaling factor and
//! composited back onto the upscaled RGB.

use anyhow::{bail, Result};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::types::{ImageBatch, MaskBatch};

/// Quantised alpha plane `[height, width]`, 255 = opaque.
pub type AlphaPlane = Array2<u8>;

/// `true` when `mask` lines up with `image` on `[batch, height, width]`.
pub fn mask_matches(image: &ImageBatch, mask: &MaskBatch) -> bool {
    image.shape()[..3] == *mask.shape()
}

/// Derive the alpha plane for one image.
///
/// A mask wins over the image's own alpha channel; mask values mark the
/// transparent area, so they are inverted. Returns `Ok(None)` when the image
/// has no transparency or the derived alpha is entirely zero.
pub fn derive_alpha(
    image: ArrayView3<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
) -> Result<Option<AlphaPlane>> {
    let (h, w, channels) = image.dim();

    let alpha = match mask {
        Some(mask) => {
            if mask.dim() != (h, w) {
                bail!(
                    "transparency mask is {:?}, image is {}x{}",
                    mask.dim(),
                    h,
                    w
                );
            }
            mask.mapv(|m| quantise(1.0 - m))
        }
        None => match channels {
            4 => image.index_axis(Axis(2), 3).mapv(quantise),
            1..=3 => return Ok(None),
            _ => bail!("unsupported channel count {channels} for alpha extraction"),
        },
    };

    // A fully transparent alpha is treated as a spurious empty mask.
    if alpha.iter().all(|&a| a == 0) {
        return Ok(None);
    }
    Ok(Some(alpha))
}

/// Scale `plane` by `factor` on both axes with bilinear filtering.
pub fn resize_alpha(plane: &AlphaPlane, factor: u32) -> AlphaPlane {
    let (src_h, src_w) = plane.dim();
    let factor = factor.max(1) as usize;
    let (dst_h, dst_w) = (src_h * factor, src_w * factor);
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((dst_h, dst_w));
    }

    let mut dst = Array2::<u8>::zeros((dst_h, dst_w));
    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let p00 = plane[[src_y0, src_x0]] as f64;
            let p10 = plane[[src_y0, src_x1]] as f64;
            let p01 = plane[[src_y1, src_x0]] as f64;
            let p11 = plane[[src_y1, src_x1]] as f64;

            let top = p00 * (1.0 - fx) + p10 * fx;
            let bot = p01 * (1.0 - fx) + p11 * fx;
            let val = top * (1.0 - fy) + bot * fy;

            dst[[dst_y, dst_x]] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    dst
}

/// Attach `alpha` to an RGB image, producing RGBA.
pub fn apply_alpha(rgb: ArrayView3<'_, f32>, alpha: &AlphaPlane) -> Result<Array3<f32>> {
    let (h, w, channels) = rgb.dim();
    if channels != 3 {
        bail!("expected RGB image, got {channels} channels");
    }
    if alpha.dim() != (h, w) {
        bail!(
            "alpha plane is {:?}, upscaled image is {}x{}",
            alpha.dim(),
            h,
            w
        );
    }

    let mut rgba = Array3::<f32>::zeros((h, w, 4));
    rgba.slice_mut(s![.., .., ..3]).assign(&rgb);
    rgba.index_axis_mut(Axis(2), 3)
        .assign(&alpha.mapv(|a| f32::from(a) / 255.0));
    Ok(rgba)
}

/// Drop any alpha channel; greyscale inputs are expanded to RGB.
pub fn strip_alpha(image: ArrayView3<'_, f32>) -> Array3<f32> {
    let (h, w, channels) = image.dim();
    match channels {
        0 => Array3::zeros((h, w, 3)),
        1 | 2 => Array3::from_shape_fn((h, w, 3), |(y, x, _)| image[[y, x, 0]]),
        _ => image.slice(s![.., .., ..3]).to_owned(),
    }
}

fn quantise(v: f32) -> u8 {
    (v * 255.0).clamp(0.0, 255.0) as u8
}
