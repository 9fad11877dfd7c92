pub mod types;
pub mod confidence;
pub mod progress;
pub mod task;
pub mod preprocess;
pub mod direct;
pub mod pdfium;
pub mod ocr;
pub mod cloud_ocr;
pub mod orchestrator;

pub use types::*;
pub use confidence::*;
pub use progress::*;
pub use preprocess::*;
pub use direct::*;
pub use ocr::*;
pub use cloud_ocr::*;
pub use orchestrator::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR engine initialization failed: {0}")]
    OcrInit(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("PDF rendering failed on page {page}: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("PDF is password protected")]
    PdfEncrypted,

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Invalid preprocessing options: {0}")]
    InvalidOptions(String),

    #[error("Unsupported document format")]
    UnsupportedFormat,

    #[error("Cloud provider {provider} request failed: {reason}")]
    ProviderRequest { provider: String, reason: String },

    #[error("Cloud provider {provider} timed out after {timeout_secs}s")]
    ProviderTimeout { provider: String, timeout_secs: u64 },

    #[error("Cloud provider {provider} returned a degenerate response: {reason}")]
    ProviderDegenerate { provider: String, reason: String },

    #[error("All cloud OCR providers exhausted ({attempted} attempted)")]
    ProvidersExhausted { attempted: usize },

    #[error("No cloud OCR provider configured")]
    NoProviders,

    #[error("Pipeline deadline exceeded during {stage}")]
    DeadlineExceeded { stage: &'static str },

    #[error("Background task failed: {0}")]
    TaskJoin(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
