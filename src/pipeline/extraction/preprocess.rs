//! Pixel-level preprocessing for rendered contract pages.
//!
//! Each operation is a pure function over an `RgbImage`. `ImagePreprocessor`
//! composes them according to a validated `PreprocessOptions`, and never
//! fails: on any internal error the original bitmap is returned unchanged.
//!
//! Order of operations: fit to width → grayscale → contrast/brightness →
//! denoise → sharpen → binarize. Denoising runs before sharpening so the
//! kernel does not amplify speckle.

use std::borrow::Cow;
use std::io::Cursor;
use std::str::FromStr;

use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::PageImage;
use super::ExtractionError;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Default binarization threshold (mid-gray).
pub const DEFAULT_THRESHOLD: u8 = 128;

/// Midpoint of the contrast slope transform.
const CONTRAST_PIVOT: f32 = 128.0;

/// Luminance variance that maps to a quality score of 1.0.
/// A clean page with ~10% ink coverage lands near 5800.
const QUALITY_VARIANCE_REFERENCE: f32 = 4000.0;

/// Upper bound on pixels we are willing to transform (≈ A3 at 400 DPI).
const MAX_PIXELS: u64 = 40_000_000;

/// Minimum bytes for a plausible encoded image.
const MIN_IMAGE_BYTES: usize = 67;

/// Maximum encoded image size we decode.
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

/// Pages scoring below this are treated as washed out.
pub const LOW_QUALITY_SCORE: f32 = 0.25;

/// Sharpen kernel: center weighted against its 4-neighborhood.
const SHARPEN_KERNEL: [[i32; 3]; 3] = [[0, -1, 0], [-1, 5, -1], [0, -1, 0]];

// ═══════════════════════════════════════════════════════════
// Presets & options
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreprocessPreset {
    #[default]
    ContractDefault,
    LowQuality,
    ScriptOptimized,
}

impl PreprocessPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContractDefault => "contract-default",
            Self::LowQuality => "low-quality",
            Self::ScriptOptimized => "script-optimized",
        }
    }

    pub fn options(&self) -> PreprocessOptions {
        match self {
            Self::ContractDefault => PreprocessOptions {
                grayscale: true,
                contrast: 20.0,
                brightness: 1.05,
                sharpen: true,
                denoise: false,
                binarize: false,
                threshold: DEFAULT_THRESHOLD,
                max_width: 2000,
            },
            Self::LowQuality => PreprocessOptions {
                grayscale: true,
                contrast: 50.0,
                brightness: 1.15,
                sharpen: true,
                denoise: true,
                binarize: true,
                threshold: 140,
                max_width: 2000,
            },
            // Dense right-to-left glyphs lose dots and ligatures when downscaled,
            // so keep more width and skip binarization.
            Self::ScriptOptimized => PreprocessOptions {
                grayscale: true,
                contrast: 30.0,
                brightness: 1.0,
                sharpen: true,
                denoise: false,
                binarize: false,
                threshold: DEFAULT_THRESHOLD,
                max_width: 3000,
            },
        }
    }
}

impl std::fmt::Display for PreprocessPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreprocessPreset {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contract-default" | "default" => Ok(Self::ContractDefault),
            "low-quality" => Ok(Self::LowQuality),
            "script-optimized" | "arabic" => Ok(Self::ScriptOptimized),
            other => Err(ExtractionError::InvalidOptions(format!(
                "unknown preset '{other}'"
            ))),
        }
    }
}

/// Typed preprocessing parameters. Build through a preset or validate with
/// `ImagePreprocessor::with_options`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessOptions {
    pub grayscale: bool,
    /// Slope strength in (-255, 255). 0 leaves contrast unchanged.
    pub contrast: f32,
    /// Pre-multiplier applied before the contrast slope. Must be > 0.
    pub brightness: f32,
    pub sharpen: bool,
    /// 3×3 median filter. Expensive.
    pub denoise: bool,
    pub binarize: bool,
    pub threshold: u8,
    /// Resolution ceiling in pixels. Wider images are downscaled.
    pub max_width: u32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        PreprocessPreset::default().options()
    }
}

impl PreprocessOptions {
    pub fn validate(&self) -> Result<(), ExtractionError> {
        if !self.contrast.is_finite() || self.contrast <= -255.0 || self.contrast >= 255.0 {
            return Err(ExtractionError::InvalidOptions(format!(
                "contrast must be within (-255, 255), got {}",
                self.contrast
            )));
        }
        if !self.brightness.is_finite() || self.brightness <= 0.0 {
            return Err(ExtractionError::InvalidOptions(format!(
                "brightness must be > 0, got {}",
                self.brightness
            )));
        }
        if self.max_width == 0 {
            return Err(ExtractionError::InvalidOptions(
                "max_width must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Preprocessor
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    options: PreprocessOptions,
}

impl ImagePreprocessor {
    pub fn new(preset: PreprocessPreset) -> Self {
        Self {
            options: preset.options(),
        }
    }

    pub fn with_options(options: PreprocessOptions) -> Result<Self, ExtractionError> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &PreprocessOptions {
        &self.options
    }

    /// Transform a page. Returns the input unchanged if any step fails.
    pub fn preprocess(&self, page: &PageImage) -> PageImage {
        match self.try_preprocess(&page.image) {
            Ok(image) => PageImage::new(page.page_index, image),
            Err(e) => {
                warn!(
                    page = page.page_index,
                    error = %e,
                    "Preprocessing failed, using original bitmap"
                );
                page.clone()
            }
        }
    }

    pub fn try_preprocess(&self, image: &RgbImage) -> Result<RgbImage, ExtractionError> {
        check_dimensions(image)?;
        let opts = &self.options;

        let mut working = fit_to_width(image, opts.max_width).into_owned();

        if opts.grayscale {
            working = to_grayscale(&working);
        }
        if opts.contrast != 0.0 || (opts.brightness - 1.0).abs() > f32::EPSILON {
            working = adjust_contrast_brightness(&working, opts.contrast, opts.brightness);
        }
        if opts.denoise {
            working = median_denoise(&working);
        }
        if opts.sharpen {
            working = sharpen(&working);
        }
        if opts.binarize {
            working = binarize(&working, opts.threshold);
        }

        debug!(
            from = format!("{}x{}", image.width(), image.height()),
            to = format!("{}x{}", working.width(), working.height()),
            denoise = opts.denoise,
            binarize = opts.binarize,
            "Page preprocessed"
        );

        Ok(working)
    }
}

fn check_dimensions(image: &RgbImage) -> Result<(), ExtractionError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(ExtractionError::ImageProcessing(format!(
            "empty bitmap ({w}x{h})"
        )));
    }
    if u64::from(w) * u64::from(h) > MAX_PIXELS {
        return Err(ExtractionError::ImageProcessing(format!(
            "bitmap too large ({w}x{h})"
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════

/// Broadcast luminance weights (ITU-R BT.601).
pub fn luminance(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Luminance-weighted channel reduction. Output stays RGB with equal channels.
pub fn to_grayscale(image: &RgbImage) -> RgbImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let y = to_channel(luminance(pixel));
        *pixel = Rgb([y, y, y]);
    }
    out
}

/// Slope factor of the classic contrast transform for a strength in (-255, 255).
pub fn contrast_factor(contrast: f32) -> f32 {
    (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast))
}

/// Per-channel linear remap: `factor * (v * brightness - 128) + 128`.
pub fn adjust_contrast_brightness(image: &RgbImage, contrast: f32, brightness: f32) -> RgbImage {
    let factor = contrast_factor(contrast);
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        let lifted = v as f32 * brightness;
        *slot = to_channel(factor * (lifted - CONTRAST_PIVOT) + CONTRAST_PIVOT);
    }

    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for c in 0..3 {
            pixel[c] = lut[pixel[c] as usize];
        }
    }
    out
}

/// 3×3 sharpen. Border pixels are copied unchanged.
pub fn sharpen(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = image.clone();
    if w < 3 || h < 3 {
        return out;
    }

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut acc = [0i32; 3];
            for (ky, row) in SHARPEN_KERNEL.iter().enumerate() {
                for (kx, &k) in row.iter().enumerate() {
                    if k == 0 {
                        continue;
                    }
                    let p = image.get_pixel(x + kx as u32 - 1, y + ky as u32 - 1);
                    for c in 0..3 {
                        acc[c] += k * p[c] as i32;
                    }
                }
            }
            out.put_pixel(
                x,
                y,
                Rgb([
                    acc[0].clamp(0, 255) as u8,
                    acc[1].clamp(0, 255) as u8,
                    acc[2].clamp(0, 255) as u8,
                ]),
            );
        }
    }
    out
}

/// 3×3 median filter per channel. Border pixels are copied unchanged.
pub fn median_denoise(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = image.clone();
    if w < 3 || h < 3 {
        return out;
    }

    let mut window = [[0u8; 9]; 3];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut i = 0;
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    let p = image.get_pixel(nx, ny);
                    for c in 0..3 {
                        window[c][i] = p[c];
                    }
                    i += 1;
                }
            }
            for channel in window.iter_mut() {
                channel.sort_unstable();
            }
            out.put_pixel(x, y, Rgb([window[0][4], window[1][4], window[2][4]]));
        }
    }
    out
}

/// Pure black/white by luminance. Pixels above `threshold` become white.
pub fn binarize(image: &RgbImage, threshold: u8) -> RgbImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let v = if luminance(pixel) > threshold as f32 { 255 } else { 0 };
        *pixel = Rgb([v, v, v]);
    }
    out
}

/// 0-1 score from normalized luminance variance. Blank or washed-out
/// scans have little variance and score near zero.
pub fn quality_score(image: &RgbImage) -> f32 {
    let n = u64::from(image.width()) * u64::from(image.height());
    if n == 0 {
        return 0.0;
    }

    let (mut sum, mut sum_sq) = (0.0f64, 0.0f64);
    for pixel in image.pixels() {
        let y = luminance(pixel) as f64;
        sum += y;
        sum_sq += y * y;
    }
    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);

    ((variance as f32) / QUALITY_VARIANCE_REFERENCE).clamp(0.0, 1.0)
}

/// Downscale to `max_width`, preserving aspect ratio. Borrowed when no resize is needed.
fn fit_to_width(image: &RgbImage, max_width: u32) -> Cow<'_, RgbImage> {
    let (w, h) = image.dimensions();
    if w <= max_width {
        return Cow::Borrowed(image);
    }

    let scale = max_width as f32 / w as f32;
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    debug!(
        from = format!("{w}x{h}"),
        to = format!("{max_width}x{new_h}"),
        "Downscaling page to preset width"
    );
    Cow::Owned(image::imageops::resize(image, max_width, new_h, FilterType::Triangle))
}

// ═══════════════════════════════════════════════════════════
// Codec helpers
// ═══════════════════════════════════════════════════════════

/// Decode an encoded raster (PNG/JPEG/TIFF) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ExtractionError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ExtractionError::ImageProcessing(format!(
            "Image data too small ({} bytes)",
            bytes.len()
        )));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ExtractionError::ImageProcessing(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::ImageProcessing(format!("Failed to decode image: {e}")))?;
    Ok(img.to_rgb8())
}

/// Encode an RGB image as PNG bytes.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, ExtractionError> {
    let dynamic = DynamicImage::ImageRgb8(img.clone());
    let mut cursor = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
