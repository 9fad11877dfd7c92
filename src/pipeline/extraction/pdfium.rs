//! Page rendering via Google PDFium, plus raster documents.
//!
//! `PdfiumRenderer` is stateless (`Send + Sync`). Each operation creates
//! a fresh `Pdfium` instance because the upstream type is `!Send`.
//! The OS caches `dlopen`/`LoadLibrary` calls, so repeat loads are near-free.

use std::io::Cursor;

use image::{DynamicImage, Rgb, RgbImage};
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::preprocess::decode_image;
use super::types::{Document, DocumentKind, PageImage, PageRenderer};
use super::ExtractionError;

/// Maximum dimension (width or height) for rendered page images.
/// Prevents OOM on extremely large pages or absurd DPI settings.
const MAX_DIMENSION_PX: u32 = 4096;

/// Default rendering DPI. Enough for Arabic diacritics without
/// blowing up recognition time.
pub const DEFAULT_RENDER_DPI: u32 = 200;

/// PDF points per inch (standard PDF unit).
const POINTS_PER_INCH: f32 = 72.0;

/// Load the PDFium dynamic library.
///
/// Discovery order:
/// 1. `PDFIUM_DYNAMIC_LIB_PATH` env var (explicit path)
/// 2. Alongside the running executable, or its `pdfium/lib` subdirectory
/// 3. System library search paths
pub(crate) fn load_pdfium() -> Result<Pdfium, ExtractionError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| {
            ExtractionError::PdfRendering {
                page: 0,
                reason: format!("Failed to load PDFium from {path}: {e}"),
            }
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let candidates = [
                exe_dir.to_path_buf(),
                exe_dir.join("pdfium").join("lib"),
                exe_dir.join("..").join("lib"),
            ];

            for dir in &candidates {
                let lib_path = Pdfium::pdfium_platform_library_name_at_path(
                    dir.to_string_lossy().as_ref(),
                );
                if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                    debug!(dir = %dir.display(), "Loaded PDFium from candidate directory");
                    return Ok(Pdfium::new(bindings));
                }
            }
        }
    }

    let bindings =
        Pdfium::bind_to_system_library().map_err(|e| ExtractionError::PdfRendering {
            page: 0,
            reason: format!(
                "PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
            ),
        })?;
    Ok(Pdfium::new(bindings))
}

/// Map PDF load errors, detecting password-protected files.
pub(crate) fn map_load_error(e: PdfiumError) -> ExtractionError {
    let msg = format!("{e}");
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        ExtractionError::PdfEncrypted
    } else {
        ExtractionError::PdfParsing(format!("Failed to load PDF: {e}"))
    }
}

/// Compute pixel dimensions for rendering, applying the dimension guard.
///
/// Returns (width_px, height_px), both clamped to [1, MAX_DIMENSION_PX].
/// Preserves aspect ratio when capping.
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let max_dim = raw_w.max(raw_h);
    if max_dim > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / max_dim;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

// ── PdfiumRenderer ────────────────────────────────────────

pub struct PdfiumRenderer;

impl PdfiumRenderer {
    /// Create a new renderer, verifying the PDFium library is loadable.
    pub fn new() -> Result<Self, ExtractionError> {
        let _ = load_pdfium()?;
        Ok(Self)
    }
}

impl PageRenderer for PdfiumRenderer {
    fn page_count(&self, document: &Document) -> Result<usize, ExtractionError> {
        let pdfium = load_pdfium()?;
        let pdf = pdfium
            .load_pdf_from_byte_slice(document.bytes(), None)
            .map_err(map_load_error)?;
        Ok(pdf.pages().len() as usize)
    }

    fn render_page(
        &self,
        document: &Document,
        page_index: usize,
        dpi: u32,
    ) -> Result<PageImage, ExtractionError> {
        let pdfium = load_pdfium()?;
        let pdf = pdfium
            .load_pdf_from_byte_slice(document.bytes(), None)
            .map_err(map_load_error)?;

        let pages = pdf.pages();

        let index = u16::try_from(page_index).map_err(|_| ExtractionError::PdfRendering {
            page: page_index,
            reason: format!("Page index {page_index} exceeds u16 maximum"),
        })?;

        let page = pages.get(index).map_err(|_| ExtractionError::PdfRendering {
            page: page_index,
            reason: format!(
                "Page {page_index} out of range (document has {} pages)",
                pages.len()
            ),
        })?;

        let (target_w, target_h) =
            compute_render_dimensions(page.width().value, page.height().value, dpi);

        let config = PdfRenderConfig::new()
            .set_target_width(target_w as i32)
            .set_maximum_height(target_h as i32);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| ExtractionError::PdfRendering {
                page: page_index,
                reason: format!("Rendering failed: {e}"),
            })?;

        let image = bitmap.as_image().to_rgb8();

        debug!(
            page = page_index,
            width = image.width(),
            height = image.height(),
            dpi,
            "Rendered PDF page"
        );

        Ok(PageImage::new(page_index, image))
    }
}

// ── Raster documents ──────────────────────────────────────

/// Photos and scans delivered as PNG/JPEG/TIFF: exactly one page,
/// EXIF orientation applied so phone photos come out upright.
pub struct ImageDocumentRenderer;

impl PageRenderer for ImageDocumentRenderer {
    fn page_count(&self, document: &Document) -> Result<usize, ExtractionError> {
        if document.kind().is_raster() {
            Ok(1)
        } else {
            Err(ExtractionError::UnsupportedFormat)
        }
    }

    fn render_page(
        &self,
        document: &Document,
        page_index: usize,
        _dpi: u32,
    ) -> Result<PageImage, ExtractionError> {
        if page_index != 0 {
            return Err(ExtractionError::PdfRendering {
                page: page_index,
                reason: "raster documents have a single page".into(),
            });
        }
        let rgb = decode_image(document.bytes())?;
        let orientation = read_exif_orientation(document.bytes());
        let upright = apply_orientation(DynamicImage::ImageRgb8(rgb), orientation).to_rgb8();
        Ok(PageImage::new(0, upright))
    }
}

/// Read EXIF orientation tag from raw image bytes.
/// Returns 1 (normal) if no EXIF data or tag not present.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply EXIF orientation transform to a `DynamicImage`.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

// ── Dispatch ──────────────────────────────────────────────

/// Routes PDFs to PDFium and raster documents to the image decoder.
pub struct DocumentRenderer {
    pdf: Option<PdfiumRenderer>,
    raster: ImageDocumentRenderer,
}

impl DocumentRenderer {
    /// Probe for PDFium. Without it, PDFs cannot be rendered but raster
    /// documents still work.
    pub fn detect() -> Self {
        let pdf = match PdfiumRenderer::new() {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "PDFium unavailable, PDF pages cannot be rendered");
                None
            }
        };
        Self {
            pdf,
            raster: ImageDocumentRenderer,
        }
    }

    fn pdf(&self) -> Result<&PdfiumRenderer, ExtractionError> {
        self.pdf.as_ref().ok_or_else(|| ExtractionError::PdfRendering {
            page: 0,
            reason: "PDFium library not loaded".into(),
        })
    }
}

impl PageRenderer for DocumentRenderer {
    fn page_count(&self, document: &Document) -> Result<usize, ExtractionError> {
        match document.kind() {
            DocumentKind::Pdf => self.pdf()?.page_count(document),
            kind if kind.is_raster() => self.raster.page_count(document),
            _ => Err(ExtractionError::UnsupportedFormat),
        }
    }

    fn render_page(
        &self,
        document: &Document,
        page_index: usize,
        dpi: u32,
    ) -> Result<PageImage, ExtractionError> {
        match document.kind() {
            DocumentKind::Pdf => self.pdf()?.render_page(document, page_index, dpi),
            kind if kind.is_raster() => self.raster.render_page(document, page_index, dpi),
            _ => Err(ExtractionError::UnsupportedFormat),
        }
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Mock renderer producing a synthetic text-like page for each valid index.
/// Pages listed in `failing` return a rendering error.
pub struct MockPageRenderer {
    page_count: usize,
    failing: Vec<usize>,
}

impl MockPageRenderer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            failing: Vec::new(),
        }
    }

    pub fn with_failing_pages(mut self, pages: Vec<usize>) -> Self {
        self.failing = pages;
        self
    }
}

impl PageRenderer for MockPageRenderer {
    fn page_count(&self, _document: &Document) -> Result<usize, ExtractionError> {
        Ok(self.page_count)
    }

    fn render_page(
        &self,
        _document: &Document,
        page_index: usize,
        _dpi: u32,
    ) -> Result<PageImage, ExtractionError> {
        if page_index >= self.page_count || self.failing.contains(&page_index) {
            return Err(ExtractionError::PdfRendering {
                page: page_index,
                reason: format!(
                    "Page {page_index} unavailable (mock has {} pages)",
                    self.page_count
                ),
            });
        }
        let image = RgbImage::from_fn(48, 64, |x, y| {
            if y % 8 < 2 && x % 6 != 0 {
                Rgb([20, 20, 20])
            } else {
                Rgb([245, 245, 245])
            }
        });
        Ok(PageImage::new(page_index, image))
    }
}
