use std::fmt;
use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// How the final text was obtained. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    Direct,
    LocalOcr,
    CloudOcr,
    Failed,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::LocalOcr => "local-ocr",
            Self::CloudOcr => "cloud-ocr",
            Self::Failed => "failed",
        }
    }

    /// Tier that produces this method. `Failed` belongs to no tier.
    pub fn tier(&self) -> Option<u8> {
        match self {
            Self::Direct => Some(1),
            Self::LocalOcr => Some(2),
            Self::CloudOcr => Some(3),
            Self::Failed => None,
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtractionMethod {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "local-ocr" => Ok(Self::LocalOcr),
            "cloud-ocr" => Ok(Self::CloudOcr),
            "failed" => Ok(Self::Failed),
            other => Err(ExtractionError::InvalidConfig(format!(
                "unknown extraction method: {other}"
            ))),
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub text: String,
    pub confidence: f32,
    pub method: ExtractionMethod,
    /// Highest tier reached (1-3).
    pub tier: u8,
    pub elapsed_ms: u64,
    pub pages_processed: usize,
}

impl ExtractionResult {
    /// Successful result. Confidence is clamped to [0, 1].
    pub fn succeeded(
        method: ExtractionMethod,
        text: String,
        confidence: f32,
        pages_processed: usize,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            success: true,
            text,
            confidence: clamp_unit(confidence),
            tier: method.tier().unwrap_or(1),
            method,
            elapsed_ms,
            pages_processed,
        }
    }

    /// Total exhaustion: no text, zero confidence.
    pub fn failed(tier_reached: u8, pages_processed: usize, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            text: String::new(),
            confidence: 0.0,
            method: ExtractionMethod::Failed,
            tier: tier_reached.clamp(1, 3),
            elapsed_ms,
            pages_processed,
        }
    }
}

/// Clamp to [0, 1], mapping NaN to 0.
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Container format detected from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Png,
    Jpeg,
    Tiff,
    Unknown,
}

impl DocumentKind {
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(b"%PDF") {
            Self::Pdf
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            Self::Png
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Self::Jpeg
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Self::Tiff
        } else {
            Self::Unknown
        }
    }

    pub fn is_raster(&self) -> bool {
        matches!(self, Self::Png | Self::Jpeg | Self::Tiff)
    }
}

/// Input document. Read-only and cheap to clone across blocking tasks.
#[derive(Debug, Clone)]
pub struct Document {
    bytes: Arc<[u8]>,
    kind: DocumentKind,
}

impl Document {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let kind = DocumentKind::sniff(&bytes);
        Self {
            bytes: Arc::from(bytes),
            kind,
        }
    }

    pub fn open(path: &Path) -> Result<Self, ExtractionError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One rendered page bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub page_index: usize,
    pub image: RgbImage,
}

impl PageImage {
    pub fn new(page_index: usize, image: RgbImage) -> Self {
        Self { page_index, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Embedded text of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub page_index: usize,
    pub text: String,
}

/// Raw OCR result from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct OcrPageResult {
    pub text: String,
    pub confidence: f32,
    pub word_confidences: Vec<OcrWordResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrWordResult {
    pub text: String,
    pub confidence: f32,
}

/// Embedded text layer reader (tier 1).
pub trait DirectTextExtractor: Send + Sync {
    fn extract_pages(&self, document: &Document) -> Result<Vec<PageText>, ExtractionError>;
}

/// Page-to-bitmap rendering (feeds tiers 2 and 3).
pub trait PageRenderer: Send + Sync {
    fn page_count(&self, document: &Document) -> Result<usize, ExtractionError>;

    fn render_page(
        &self,
        document: &Document,
        page_index: usize,
        dpi: u32,
    ) -> Result<PageImage, ExtractionError>;
}

/// One recognition context. Not shared across simultaneous recognitions;
/// the pool hands each out to one caller at a time.
pub trait OcrEngine: Send {
    fn ocr_image(&self, png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError>;
}

/// Remote recognition provider (tier 3).
pub trait CloudOcrProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Raw recognized text for the given pages. Content inspection happens in the client.
    fn recognize(&self, pages: &[PageImage]) -> Result<String, ExtractionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tiers() {
        assert_eq!(ExtractionMethod::Direct.tier(), Some(1));
        assert_eq!(ExtractionMethod::LocalOcr.tier(), Some(2));
        assert_eq!(ExtractionMethod::CloudOcr.tier(), Some(3));
        assert_eq!(ExtractionMethod::Failed.tier(), None);
    }

    #[test]
    fn method_serializes_kebab_case() {
        let json = serde_json::to_string(&ExtractionMethod::LocalOcr).unwrap();
        assert_eq!(json, "\"local-ocr\"");
        let parsed: ExtractionMethod = "cloud-ocr".parse().unwrap();
        assert_eq!(parsed, ExtractionMethod::CloudOcr);
        assert!("tesseract".parse::<ExtractionMethod>().is_err());
    }

    #[test]
    fn failed_result_is_empty_and_zero() {
        let r = ExtractionResult::failed(3, 2, 120);
        assert!(!r.success);
        assert!(r.text.is_empty());
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.method, ExtractionMethod::Failed);
        assert_eq!(r.tier, 3);
    }

    #[test]
    fn succeeded_clamps_confidence() {
        let r = ExtractionResult::succeeded(ExtractionMethod::CloudOcr, "x".into(), 1.7, 1, 5);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.tier, 3);
        let r = ExtractionResult::succeeded(ExtractionMethod::Direct, "x".into(), f32::NAN, 1, 5);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn sniff_document_kinds() {
        assert_eq!(DocumentKind::sniff(b"%PDF-1.7\n"), DocumentKind::Pdf);
        assert_eq!(
            DocumentKind::sniff(&[0x89, b'P', b'N', b'G', 0x0D]),
            DocumentKind::Png
        );
        assert_eq!(DocumentKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), DocumentKind::Jpeg);
        assert_eq!(DocumentKind::sniff(b"II*\0rest"), DocumentKind::Tiff);
        assert_eq!(DocumentKind::sniff(b"garbage"), DocumentKind::Unknown);
        assert_eq!(DocumentKind::sniff(b""), DocumentKind::Unknown);
    }

    #[test]
    fn document_clone_shares_bytes() {
        let doc = Document::from_bytes(b"%PDF-1.4 body".to_vec());
        let copy = doc.clone();
        assert_eq!(copy.bytes(), doc.bytes());
        assert_eq!(copy.kind(), DocumentKind::Pdf);
        assert_eq!(doc.len(), 13);
    }
}
