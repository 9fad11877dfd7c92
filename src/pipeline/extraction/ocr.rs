//! Tier 2: in-process OCR over preprocessed page bitmaps.
//!
//! Recognition contexts are expensive to create and unsafe to share across
//! simultaneous recognitions. `OcrEnginePool` holds a bounded set of them;
//! a run checks one out per page and it returns to the pool on drop.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::confidence::{char_len, ocr_confidence};
use super::direct::PAGE_SEPARATOR;
use super::preprocess::encode_png;
use super::task::{run_blocking, within};
use super::types::{OcrEngine, OcrPageResult, OcrWordResult, PageImage};
use super::ExtractionError;

// ═══════════════════════════════════════════════════════════
// Tesseract (command line)
// ═══════════════════════════════════════════════════════════

/// Default recognition languages: Arabic contracts with English fragments.
pub const DEFAULT_OCR_LANGUAGE: &str = "ara+eng";

/// Tesseract via its command-line binary, reading TSV for word confidences.
///
/// Construction probes the binary once; the probed configuration is the
/// reusable context handed out by the pool.
#[derive(Debug, Clone)]
pub struct TesseractCliEngine {
    binary: PathBuf,
    language: String,
}

impl TesseractCliEngine {
    pub fn new(language: &str) -> Result<Self, ExtractionError> {
        Self::with_binary(Path::new("tesseract"), language)
    }

    pub fn with_binary(binary: &Path, language: &str) -> Result<Self, ExtractionError> {
        let output = Command::new(binary).arg("--version").output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExtractionError::OcrInit(format!(
                    "{} not found (install tesseract-ocr)",
                    binary.display()
                ))
            } else {
                ExtractionError::Io(e)
            }
        })?;
        if !output.status.success() {
            return Err(ExtractionError::OcrInit(format!(
                "{} --version exited with {}",
                binary.display(),
                output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!(
            version = version.lines().next().unwrap_or("unknown"),
            language,
            "Tesseract available"
        );

        Ok(Self {
            binary: binary.to_path_buf(),
            language: language.to_string(),
        })
    }
}

impl OcrEngine for TesseractCliEngine {
    fn ocr_image(&self, png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let file = tempfile::Builder::new()
            .prefix("contract-page-")
            .suffix(".png")
            .tempfile()?;
        std::fs::write(file.path(), png_bytes)?;

        let output = Command::new(&self.binary)
            .arg(file.path())
            .arg("stdout")
            .args(["-l", &self.language, "tsv"])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::OcrProcessing(format!(
                "tesseract failed: {}",
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv(&tsv))
    }
}

/// Parse Tesseract TSV into text and word confidences.
///
/// TSV columns: level page_num block_num par_num line_num word_num left top width height conf text.
/// Level 5 rows are words. Words are joined by spaces within a line and lines
/// by newlines. Page confidence is the mean of words with a known score.
fn parse_tsv(tsv: &str) -> OcrPageResult {
    let mut words = Vec::new();
    let mut text = String::new();
    let mut current_line: Option<(u32, u32, u32)> = None;
    let (mut conf_sum, mut conf_count) = (0.0f32, 0usize);

    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }
        if fields[0].parse::<i32>().ok() != Some(5) {
            continue;
        }
        let conf: f32 = match fields[10].trim().parse() {
            Ok(c) => c,
            Err(_) => continue,
        };
        let word = fields[11].trim();
        if word.is_empty() {
            continue;
        }

        let key = (
            fields[2].parse().unwrap_or(0),
            fields[3].parse().unwrap_or(0),
            fields[4].parse().unwrap_or(0),
        );
        match current_line {
            Some(prev) if prev == key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(key);
        text.push_str(word);

        // Tesseract reports -1 for words it cannot score
        let confidence = if conf < 0.0 { 0.0 } else { (conf / 100.0).min(1.0) };
        if conf >= 0.0 {
            conf_sum += confidence;
            conf_count += 1;
        }
        words.push(OcrWordResult {
            text: word.to_string(),
            confidence,
        });
    }

    let confidence = if conf_count == 0 {
        0.0
    } else {
        conf_sum / conf_count as f32
    };

    OcrPageResult {
        text,
        confidence,
        word_confidences: words,
    }
}

// ═══════════════════════════════════════════════════════════
// Mock engine
// ═══════════════════════════════════════════════════════════

/// Mock OCR engine for unit testing without Tesseract.
///
/// Returns scripted results in call order, repeating the last one.
pub struct MockOcrEngine {
    script: Vec<Result<(String, f32), String>>,
    calls: AtomicUsize,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self::sequence(vec![(text, confidence)])
    }

    pub fn sequence(pages: Vec<(&str, f32)>) -> Self {
        Self {
            script: pages
                .into_iter()
                .map(|(t, c)| Ok((t.to_string(), c)))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            script: vec![Err(reason.to_string())],
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for MockOcrEngine {
    fn ocr_image(&self, _png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .script
            .get(n)
            .or_else(|| self.script.last())
            .ok_or_else(|| ExtractionError::OcrProcessing("empty mock script".into()))?;

        match entry {
            Ok((text, confidence)) => Ok(OcrPageResult {
                text: text.clone(),
                confidence: *confidence,
                word_confidences: text
                    .split_whitespace()
                    .map(|w| OcrWordResult {
                        text: w.to_string(),
                        confidence: *confidence,
                    })
                    .collect(),
            }),
            Err(reason) => Err(ExtractionError::OcrProcessing(reason.clone())),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Engine pool
// ═══════════════════════════════════════════════════════════

type EngineFactory = dyn Fn() -> Result<Box<dyn OcrEngine>, ExtractionError> + Send + Sync;

/// Bounded pool of recognition contexts.
///
/// At most `size` contexts exist and each serves one recognition at a time.
/// Contexts are created lazily by the factory on first checkout and reused
/// afterwards. A context whose creation fails is not counted, so the next
/// checkout retries.
pub struct OcrEnginePool {
    idle: Mutex<Vec<Box<dyn OcrEngine>>>,
    permits: Arc<Semaphore>,
    factory: Box<EngineFactory>,
    size: usize,
    created: AtomicUsize,
}

impl OcrEnginePool {
    pub fn new<F>(size: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<Box<dyn OcrEngine>, ExtractionError> + Send + Sync + 'static,
    {
        let size = size.max(1);
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            factory: Box::new(factory),
            size,
            created: AtomicUsize::new(0),
        })
    }

    /// Pool of already-initialized engines. Never creates more.
    pub fn from_engines(engines: Vec<Box<dyn OcrEngine>>) -> Arc<Self> {
        let size = engines.len().max(1);
        let created = engines.len();
        Arc::new(Self {
            idle: Mutex::new(engines),
            permits: Arc::new(Semaphore::new(size)),
            factory: Box::new(|| {
                Err(ExtractionError::OcrInit(
                    "pool was built from fixed engines".into(),
                ))
            }),
            size,
            created: AtomicUsize::new(created),
        })
    }

    /// Pool of Tesseract contexts for the given languages.
    pub fn tesseract(size: usize, language: &str) -> Arc<Self> {
        let language = language.to_string();
        Self::new(size, move || {
            TesseractCliEngine::new(&language).map(|e| Box::new(e) as Box<dyn OcrEngine>)
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait for a free slot. The engine itself is materialized by `PooledEngine::engine`,
    /// which belongs on a blocking thread.
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledEngine, ExtractionError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExtractionError::OcrInit("OCR engine pool closed".into()))?;

        let engine = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        Ok(PooledEngine {
            engine,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }
}

/// Scoped checkout. Returns its engine to the pool on drop, then frees the slot.
pub struct PooledEngine {
    engine: Option<Box<dyn OcrEngine>>,
    pool: Arc<OcrEnginePool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledEngine {
    pub fn engine(&mut self) -> Result<&dyn OcrEngine, ExtractionError> {
        if self.engine.is_none() {
            let engine = (self.pool.factory)()?;
            let n = self.pool.created.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(created = n, size = self.pool.size, "OCR context initialized");
            self.engine = Some(engine);
        }
        self.engine
            .as_deref()
            .ok_or_else(|| ExtractionError::OcrInit("OCR context missing".into()))
    }
}

impl Drop for PooledEngine {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(engine);
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Local OCR engine
// ═══════════════════════════════════════════════════════════

/// Stop recognizing once enough good text has accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyExitRule {
    #[serde(default = "default_min_pages")]
    pub min_pages: usize,
    #[serde(default = "default_early_exit_chars")]
    pub min_chars: usize,
    #[serde(default = "default_early_exit_confidence")]
    pub min_confidence: f32,
}

fn default_min_pages() -> usize {
    2
}

fn default_early_exit_chars() -> usize {
    1500
}

fn default_early_exit_confidence() -> f32 {
    0.75
}

impl Default for EarlyExitRule {
    fn default() -> Self {
        Self {
            min_pages: default_min_pages(),
            min_chars: default_early_exit_chars(),
            min_confidence: default_early_exit_confidence(),
        }
    }
}

impl EarlyExitRule {
    pub fn should_stop(&self, pages_done: usize, chars: usize, confidence: f32) -> bool {
        pages_done >= self.min_pages.max(2)
            && chars > self.min_chars
            && confidence > self.min_confidence
    }
}

/// Combined tier-2 result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalOcrOutcome {
    pub text: String,
    pub confidence: f32,
    pub pages_processed: usize,
    /// Indices of pages that yielded text.
    pub pages_used: Vec<usize>,
    pub exited_early: bool,
    pub timed_out: bool,
}

impl LocalOcrOutcome {
    pub fn char_len(&self) -> usize {
        char_len(&self.text)
    }
}

pub struct LocalOcrEngine {
    pool: Arc<OcrEnginePool>,
    early_exit: EarlyExitRule,
}

impl LocalOcrEngine {
    pub fn new(pool: Arc<OcrEnginePool>) -> Self {
        Self {
            pool,
            early_exit: EarlyExitRule::default(),
        }
    }

    pub fn with_early_exit(mut self, rule: EarlyExitRule) -> Self {
        self.early_exit = rule;
        self
    }

    pub fn pool(&self) -> &Arc<OcrEnginePool> {
        &self.pool
    }

    /// Recognize up to `budget` pages in order, one at a time.
    ///
    /// Page failures are logged and skipped. Hitting the deadline stops
    /// recognition and returns what was gathered with `timed_out` set.
    pub async fn recognize(
        &self,
        pages: &[PageImage],
        budget: usize,
        deadline: Instant,
    ) -> LocalOcrOutcome {
        self.recognize_with(pages, budget, deadline, |_, _| {}).await
    }

    /// As `recognize`, calling `on_page(done, total)` after each page.
    pub async fn recognize_with<P>(
        &self,
        pages: &[PageImage],
        budget: usize,
        deadline: Instant,
        mut on_page: P,
    ) -> LocalOcrOutcome
    where
        P: FnMut(usize, usize),
    {
        let total = pages.len().min(budget);
        let mut results: Vec<(usize, OcrPageResult)> = Vec::with_capacity(total);
        let mut outcome = LocalOcrOutcome::default();

        for page in pages.iter().take(total) {
            match self.recognize_page(page, deadline).await {
                Ok(result) => {
                    debug!(
                        page = page.page_index,
                        chars = char_len(&result.text),
                        confidence = result.confidence,
                        "Page recognized"
                    );
                    results.push((page.page_index, result));
                }
                Err(ExtractionError::DeadlineExceeded { .. }) => {
                    warn!(page = page.page_index, "Deadline reached during local OCR");
                    outcome.timed_out = true;
                    break;
                }
                Err(e) => {
                    warn!(page = page.page_index, error = %e, "Page recognition failed, skipping");
                }
            }
            outcome.pages_processed += 1;
            on_page(outcome.pages_processed, total);

            let (chars, confidence) = summarize(&results);
            if outcome.pages_processed < total
                && self
                    .early_exit
                    .should_stop(outcome.pages_processed, chars, confidence)
            {
                info!(
                    pages = outcome.pages_processed,
                    chars, confidence, "Early exit: enough text recognized"
                );
                outcome.exited_early = true;
                break;
            }
        }

        let page_results: Vec<OcrPageResult> = results.iter().map(|(_, r)| r.clone()).collect();
        outcome.confidence = ocr_confidence(&page_results);
        outcome.pages_used = results
            .iter()
            .filter(|(_, r)| char_len(&r.text) > 0)
            .map(|(i, _)| *i)
            .collect();
        outcome.text = results
            .iter()
            .map(|(_, r)| r.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR);
        outcome
    }

    async fn recognize_page(
        &self,
        page: &PageImage,
        deadline: Instant,
    ) -> Result<OcrPageResult, ExtractionError> {
        let mut checkout = within(deadline, "local-ocr", self.pool.checkout()).await??;
        let image = page.image.clone();
        run_blocking(deadline, "local-ocr", move || {
            let png = encode_png(&image)?;
            checkout.engine()?.ocr_image(&png)
        })
        .await
    }
}

fn summarize(results: &[(usize, OcrPageResult)]) -> (usize, f32) {
    let chars = results.iter().map(|(_, r)| char_len(&r.text)).sum();
    let pages: Vec<OcrPageResult> = results.iter().map(|(_, r)| r.clone()).collect();
    (chars, ocr_confidence(&pages))
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
