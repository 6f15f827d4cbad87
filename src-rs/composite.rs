use crate::error::{PipelineError, PipelineResult};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundSource {
    Enhanced,
    Raw,
}

/// The two published layers: plain background, and background with the label tint.
#[derive(Debug, Clone)]
pub struct CompositeLayers {
    pub background: RgbImage,
    pub overlay: RgbImage,
}

pub fn blend_channel(bg: u8, color: u8, alpha: f32) -> u8 {
    let a = f64::from(alpha.clamp(0.0, 1.0));
    (f64::from(bg) * (1.0 - a) + f64::from(color) * a)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Tint every labelled pixel with its LUT colour. Label 0 and labels past the end of
/// the LUT leave the background pixel untouched.
pub fn composite(
    background: &RgbImage,
    labels: &GrayImage,
    lut: &[Option<Rgb<u8>>],
    alpha: f32,
) -> PipelineResult<CompositeLayers> {
    if background.dimensions() != labels.dimensions() {
        let (bw, bh) = background.dimensions();
        let (lw, lh) = labels.dimensions();
        return Err(PipelineError::InvalidParameter {
            parameter: "background".to_string(),
            value: format!("{bw}x{bh} does not match the {lw}x{lh} label image"),
        });
    }
    let mut overlay = background.clone();
    for (x, y, px) in overlay.enumerate_pixels_mut() {
        let label = labels.get_pixel(x, y).0[0];
        if label == 0 {
            continue;
        }
        let Some(Some(color)) = lut.get(usize::from(label)) else {
            continue;
        };
        for c in 0..3 {
            px.0[c] = blend_channel(px.0[c], color.0[c], alpha);
        }
    }
    Ok(CompositeLayers {
        background: background.clone(),
        overlay,
    })
}

/// Bin holding the `p`-th percentile of `total` samples.
pub fn percentile_bin(hist: &[u64; 256], p: f64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let target = ((p / 100.0) * (total - 1) as f64).round() as u64;
    let mut cum = 0u64;
    for (bin, count) in hist.iter().enumerate() {
        cum += count;
        if cum > target {
            return bin as u8;
        }
    }
    255
}

/// Normalise by the plane maximum to 8 bits, then stretch linearly between the
/// `p_low` and `p_high` percentiles.
pub fn percentile_stretch(plane: &[f32], p_low: f64, p_high: f64) -> Vec<u8> {
    let max = plane.iter().copied().filter(|v| v.is_finite()).fold(0f32, f32::max);
    if max <= 0.0 {
        return vec![0; plane.len()];
    }
    let mut hist = [0u64; 256];
    let src: Vec<u8> = plane
        .iter()
        .map(|v| {
            let v = if v.is_finite() { *v } else { 0.0 };
            let b = (f64::from(v / max) * 255.0).round().clamp(0.0, 255.0) as u8;
            hist[usize::from(b)] += 1;
            b
        })
        .collect();

    let total = src.len() as u64;
    let lo = i32::from(percentile_bin(&hist, p_low, total));
    let mut hi = i32::from(percentile_bin(&hist, p_high, total));
    if hi <= lo {
        hi = lo + 1;
    }
    src.into_iter()
        .map(|v| {
            let v = i32::from(v);
            if v <= lo {
                0
            } else if v >= hi {
                255
            } else {
                (f64::from(v - lo) * 255.0 / f64::from(hi - lo))
                    .round()
                    .clamp(0.0, 255.0) as u8
            }
        })
        .collect()
}

pub fn stretch_image(img: &DynamicImage, p_low: f64, p_high: f64) -> GrayImage {
    let plane = img.to_luma32f();
    let (w, h) = plane.dimensions();
    let data = percentile_stretch(plane.as_raw(), p_low, p_high);
    GrayImage::from_raw(w, h, data).unwrap_or_else(|| GrayImage::new(w, h))
}

/// Class indices must survive decoding as-is; 16-bit label images are not rescaled.
pub fn labels_from_image(img: DynamicImage) -> GrayImage {
    match img {
        DynamicImage::ImageLuma8(gray) => gray,
        DynamicImage::ImageLuma16(wide) => {
            let (w, h) = wide.dimensions();
            GrayImage::from_fn(w, h, |x, y| Luma([wide.get_pixel(x, y).0[0].min(255) as u8]))
        }
        other => other.to_luma8(),
    }
}

/// Decode by content rather than extension; external tools are loose about suffixes.
pub fn open_image(path: &Path) -> PipelineResult<DynamicImage> {
    let reader = image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| PipelineError::io(format!("failed to open {}", path.display()), e))?;
    reader.decode().map_err(|err| PipelineError::image(path, err))
}

pub fn load_labels(path: &Path) -> PipelineResult<GrayImage> {
    open_image(path).map(labels_from_image)
}

pub fn load_rgb(path: &Path) -> PipelineResult<RgbImage> {
    open_image(path).map(|img| img.to_rgb8())
}

pub fn save_image(img: &DynamicImage, path: &Path) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| PipelineError::io(format!("failed to create {}", parent.display()), e))?;
    }
    img.save(path).map_err(|err| PipelineError::image(path, err))
}
