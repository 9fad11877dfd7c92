//! Tier 1: read the embedded text layer without rendering pixels.

use pdfium_render::prelude::*;

use super::confidence::{char_len, direct_confidence};
use super::pdfium::{load_pdfium, map_load_error};
use super::types::{DirectTextExtractor, Document, DocumentKind, PageText};
use super::ExtractionError;

/// Separator between pages in combined text.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Text layer reader backed by PDFium.
pub struct PdfiumTextExtractor;

impl PdfiumTextExtractor {
    pub fn new() -> Result<Self, ExtractionError> {
        let _ = load_pdfium()?;
        Ok(Self)
    }
}

impl DirectTextExtractor for PdfiumTextExtractor {
    fn extract_pages(&self, document: &Document) -> Result<Vec<PageText>, ExtractionError> {
        match document.kind() {
            DocumentKind::Pdf => {}
            // A photo has no text layer.
            kind if kind.is_raster() => return Ok(Vec::new()),
            _ => return Err(ExtractionError::UnsupportedFormat),
        }

        let pdfium = load_pdfium()?;
        let pdf = pdfium
            .load_pdf_from_byte_slice(document.bytes(), None)
            .map_err(map_load_error)?;

        let mut pages = Vec::new();
        for (page_index, page) in pdf.pages().iter().enumerate() {
            let text = page
                .text()
                .map_err(|e| ExtractionError::PdfParsing(format!("page {page_index}: {e}")))?
                .all();
            pages.push(PageText { page_index, text });
        }
        Ok(pages)
    }
}

/// Outcome of tier 1. Never an error: failures read as zero confidence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectExtraction {
    pub pages: Vec<PageText>,
    pub text: String,
    pub confidence: f32,
}

impl DirectExtraction {
    pub fn char_len(&self) -> usize {
        char_len(&self.text)
    }
}

/// Run a direct extractor, failing closed.
pub fn extract_direct(extractor: &dyn DirectTextExtractor, document: &Document) -> DirectExtraction {
    let pages = match extractor.extract_pages(document) {
        Ok(pages) => pages,
        Err(e) => {
            tracing::debug!(error = %e, "No usable text layer");
            return DirectExtraction::default();
        }
    };

    let text = pages
        .iter()
        .map(|p| p.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR);
    let confidence = direct_confidence(&pages);

    DirectExtraction {
        pages,
        text,
        confidence,
    }
}

/// Mock text layer for unit tests.
pub struct MockDirectExtractor {
    pages: Result<Vec<String>, String>,
}

impl MockDirectExtractor {
    pub fn new(pages: Vec<&str>) -> Self {
        Self {
            pages: Ok(pages.into_iter().map(str::to_string).collect()),
        }
    }

    /// No text layer at all (scanned document).
    pub fn empty(page_count: usize) -> Self {
        Self {
            pages: Ok(vec![String::new(); page_count]),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            pages: Err(reason.to_string()),
        }
    }
}

impl DirectTextExtractor for MockDirectExtractor {
    fn extract_pages(&self, _document: &Document) -> Result<Vec<PageText>, ExtractionError> {
        match &self.pages {
            Ok(pages) => Ok(pages
                .iter()
                .enumerate()
                .map(|(page_index, text)| PageText {
                    page_index,
                    text: text.clone(),
                })
                .collect()),
            Err(reason) => Err(ExtractionError::PdfParsing(reason.clone())),
        }
    }
}
