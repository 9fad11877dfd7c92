//! Tier cascade: direct text layer, then local OCR, then cloud OCR, then the
//! best partial result seen along the way.
//!
//! A run is an explicit state machine. Everything a later state needs from an
//! earlier one (rendered pages, the fallback candidate, whether the deadline
//! fired) travels in `RunState`, never in shared globals.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::cloud_ocr::CloudOcrClient;
use super::confidence::char_len;
use super::direct::{extract_direct, DirectExtraction, PdfiumTextExtractor};
use super::ocr::{LocalOcrEngine, OcrEnginePool};
use super::pdfium::DocumentRenderer;
use super::preprocess::{quality_score, ImagePreprocessor, PreprocessPreset, LOW_QUALITY_SCORE};
use super::progress::{ProgressReporter, ProgressStage, ProgressTracker};
use super::task::run_blocking;
use super::types::{
    DirectTextExtractor, Document, ExtractionMethod, ExtractionResult, PageImage, PageRenderer,
};
use super::ExtractionError;
use crate::pipeline::learning::{FileMetadata, FoundField, TemplateStore};
use crate::pipeline_config::ExtractionConfig;

// ═══════════════════════════════════════════════════════════
// Field finder hook
// ═══════════════════════════════════════════════════════════

/// Locates known field values in accepted text so the learning store can
/// keep the text around them. Supplied by the downstream field parser.
pub trait FieldFinder: Send + Sync {
    fn find_fields(&self, text: &str) -> Vec<FoundField>;
}

impl<F> FieldFinder for F
where
    F: Fn(&str) -> Vec<FoundField> + Send + Sync,
{
    fn find_fields(&self, text: &str) -> Vec<FoundField> {
        self(text)
    }
}

// ═══════════════════════════════════════════════════════════
// Run state
// ═══════════════════════════════════════════════════════════

enum PipelineState {
    Tier1Direct,
    Tier2LocalOcr,
    Tier3Cloud,
    Fallback,
    Complete(ExtractionResult),
    Failed,
}

/// Best non-empty partial result so far.
#[derive(Debug, Clone)]
struct Candidate {
    method: ExtractionMethod,
    text: String,
    confidence: f32,
    pages_processed: usize,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        self.confidence > other.confidence
            || (self.confidence == other.confidence && char_len(&self.text) > char_len(&other.text))
    }
}

/// Longest run a deadline can ask for. Larger values are capped.
const MAX_RUN_DEADLINE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

struct RunState {
    started: Instant,
    deadline: Instant,
    tier_reached: u8,
    /// From the renderer, resolved on first need.
    page_count: Option<usize>,
    /// Pages with a text layer, for metadata when nothing was rendered.
    text_pages: usize,
    /// Raw renders, reused by later tiers.
    rendered: BTreeMap<usize, PageImage>,
    render_failed: BTreeSet<usize>,
    fallback_candidate: Option<Candidate>,
    deadline_hit: bool,
}

impl RunState {
    fn new(deadline: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started
                .checked_add(deadline.min(MAX_RUN_DEADLINE))
                .unwrap_or(started + MAX_RUN_DEADLINE),
            tier_reached: 1,
            page_count: None,
            text_pages: 0,
            rendered: BTreeMap::new(),
            render_failed: BTreeSet::new(),
            fallback_candidate: None,
            deadline_hit: false,
        }
    }

    fn reach(&mut self, tier: u8) {
        self.tier_reached = self.tier_reached.max(tier);
    }

    fn offer(&mut self, candidate: Candidate) {
        if char_len(&candidate.text) == 0 {
            return;
        }
        let replace = match &self.fallback_candidate {
            Some(current) => candidate.beats(current),
            None => true,
        };
        if replace {
            self.fallback_candidate = Some(candidate);
        }
    }

    fn pages_in(&self, order: &[usize]) -> Vec<PageImage> {
        order
            .iter()
            .filter_map(|i| self.rendered.get(i).cloned())
            .collect()
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Recommended pages first, then the rest in document order, capped at `budget`.
pub(crate) fn preferred_order(total_pages: usize, recommended: &[usize], budget: usize) -> Vec<usize> {
    let mut order: Vec<usize> = Vec::with_capacity(budget.min(total_pages));
    for &page in recommended {
        if page < total_pages && !order.contains(&page) {
            order.push(page);
        }
    }
    for page in 0..total_pages {
        if order.len() >= budget {
            break;
        }
        if !order.contains(&page) {
            order.push(page);
        }
    }
    order.truncate(budget);
    order
}

/// Washed-out pages get the low-quality preset when adaptation is on.
pub(crate) fn select_preset(base: PreprocessPreset, adaptive: bool, page: &PageImage) -> PreprocessPreset {
    if adaptive && base != PreprocessPreset::LowQuality && quality_score(&page.image) < LOW_QUALITY_SCORE {
        PreprocessPreset::LowQuality
    } else {
        base
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════

pub struct ExtractionPipeline {
    direct: Arc<dyn DirectTextExtractor>,
    renderer: Arc<dyn PageRenderer>,
    preprocessor: Arc<ImagePreprocessor>,
    local: Arc<LocalOcrEngine>,
    cloud: Option<Arc<CloudOcrClient>>,
    store: Option<Arc<TemplateStore>>,
    field_finder: Option<Arc<dyn FieldFinder>>,
    config: ExtractionConfig,
    deadline: Duration,
}

impl ExtractionPipeline {
    pub fn builder() -> ExtractionPipelineBuilder {
        ExtractionPipelineBuilder::default()
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn template_store(&self) -> Option<&Arc<TemplateStore>> {
        self.store.as_ref()
    }

    fn cloud_available(&self) -> bool {
        self.config.cloud_fallback_enabled && self.cloud.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Run the cascade on one document. Never fails: total exhaustion comes
    /// back as an unsuccessful result with empty text.
    pub async fn extract(
        &self,
        document: Document,
        reporter: Option<&dyn ProgressReporter>,
    ) -> ExtractionResult {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "extraction",
            run_id = %run_id,
            bytes = document.len(),
            kind = ?document.kind()
        );
        self.run(document, reporter).instrument(span).await
    }

    async fn run(&self, document: Document, reporter: Option<&dyn ProgressReporter>) -> ExtractionResult {
        let mut run = RunState::new(self.deadline);
        let mut progress = ProgressTracker::new(reporter);
        progress.emit(ProgressStage::Starting, 0, 1, "Starting extraction");

        let mut state = PipelineState::Tier1Direct;
        let mut result = loop {
            state = match state {
                PipelineState::Tier1Direct => {
                    self.tier1(&document, &mut run, &mut progress)
                        .instrument(info_span!("tier", tier = 1))
                        .await
                }
                PipelineState::Tier2LocalOcr => {
                    self.tier2(&document, &mut run, &mut progress)
                        .instrument(info_span!("tier", tier = 2))
                        .await
                }
                PipelineState::Tier3Cloud => {
                    self.tier3(&document, &mut run, &mut progress)
                        .instrument(info_span!("tier", tier = 3))
                        .await
                }
                PipelineState::Fallback => self.fallback(&document, &mut run, &mut progress).await,
                PipelineState::Complete(result) => break result,
                PipelineState::Failed => {
                    break ExtractionResult::failed(run.tier_reached, run.rendered.len(), 0);
                }
            };
        };
        result.elapsed_ms = run.elapsed_ms();
        result.tier = result.tier.max(run.tier_reached).clamp(1, 3);

        if result.success {
            info!(
                method = %result.method,
                tier = result.tier,
                confidence = result.confidence,
                chars = char_len(&result.text),
                pages = result.pages_processed,
                elapsed_ms = result.elapsed_ms,
                "Extraction complete"
            );
            progress.emit(
                ProgressStage::Complete,
                100,
                result.tier,
                format!("Extracted with {}", result.method),
            );
        } else {
            warn!(tier = result.tier, elapsed_ms = result.elapsed_ms, "Extraction exhausted every tier");
            progress.emit(ProgressStage::Failed, 100, result.tier, "No text could be extracted");
        }
        result
    }

    /// Deadline errors end the run's active tiers; anything else is the caller's to absorb.
    fn interrupted(&self, run: &mut RunState, stage: &str) -> PipelineState {
        warn!(stage, "Run deadline reached, skipping to fallback");
        run.deadline_hit = true;
        PipelineState::Fallback
    }

    // ── Tier 1 ────────────────────────────────────────────

    async fn tier1(
        &self,
        document: &Document,
        run: &mut RunState,
        progress: &mut ProgressTracker<'_>,
    ) -> PipelineState {
        run.reach(1);
        progress.emit(ProgressStage::Direct, 5, 1, "Reading embedded text layer");

        let direct = {
            let extractor = Arc::clone(&self.direct);
            let doc = document.clone();
            run_blocking(run.deadline, "direct", move || Ok(extract_direct(&*extractor, &doc))).await
        };
        let direct = match direct {
            Ok(d) => d,
            Err(ExtractionError::DeadlineExceeded { stage }) => return self.interrupted(run, stage),
            Err(e) => {
                warn!(error = %e, "Direct extraction task failed");
                DirectExtraction::default()
            }
        };
        run.text_pages = direct.pages.len();

        let chars = direct.char_len();
        info!(chars, confidence = direct.confidence, pages = direct.pages.len(), "Text layer read");

        if direct.confidence >= self.config.min_confidence && chars > self.config.direct_min_chars {
            let pages_used: Vec<usize> = direct
                .pages
                .iter()
                .filter(|p| char_len(&p.text) > 0)
                .map(|p| p.page_index)
                .collect();
            self.learn_success(
                document,
                run,
                ExtractionMethod::Direct,
                &direct.text,
                pages_used,
                direct.confidence,
            )
            .await;
            return PipelineState::Complete(ExtractionResult::succeeded(
                ExtractionMethod::Direct,
                direct.text,
                direct.confidence,
                direct.pages.len().max(1),
                0,
            ));
        }

        progress.emit(ProgressStage::Direct, 15, 1, "Text layer insufficient");
        run.offer(Candidate {
            method: ExtractionMethod::Direct,
            pages_processed: direct.pages.len(),
            text: direct.text,
            confidence: direct.confidence,
        });
        PipelineState::Tier2LocalOcr
    }

    // ── Tier 2 ────────────────────────────────────────────

    async fn tier2(
        &self,
        document: &Document,
        run: &mut RunState,
        progress: &mut ProgressTracker<'_>,
    ) -> PipelineState {
        run.reach(2);
        progress.emit(ProgressStage::Rendering, 20, 2, "Rendering pages");

        let budget = self.config.max_local_pages;
        let order = match self.page_order(document, run, budget).await {
            Ok(order) => order,
            Err(ExtractionError::DeadlineExceeded { stage }) => return self.interrupted(run, stage),
            Err(e) => {
                warn!(error = %e, "Page ordering failed");
                Vec::new()
            }
        };
        if let Err(ExtractionError::DeadlineExceeded { stage }) =
            self.render(document, &order, run).await
        {
            return self.interrupted(run, stage);
        }
        let raw = run.pages_in(&order);
        progress.emit(
            ProgressStage::Rendering,
            30,
            2,
            format!("Rendered {} of {} pages", raw.len(), order.len()),
        );

        progress.emit(ProgressStage::Preprocessing, 35, 2, "Enhancing page images");
        let prepared = match self.preprocess_pages(raw, run.deadline).await {
            Ok(pages) => pages,
            Err(ExtractionError::DeadlineExceeded { stage }) => return self.interrupted(run, stage),
            Err(e) => {
                warn!(error = %e, "Preprocessing failed");
                Vec::new()
            }
        };

        progress.emit(ProgressStage::LocalOcr, 45, 2, "Recognizing text locally");
        let outcome = if prepared.is_empty() {
            warn!("No pages available for local OCR");
            Default::default()
        } else {
            let deadline = run.deadline;
            self.local
                .recognize_with(&prepared, budget, deadline, |done, total| {
                    let percent = 45 + (done * 30 / total.max(1)) as u8;
                    progress.emit(
                        ProgressStage::LocalOcr,
                        percent,
                        2,
                        format!("Recognized page {done} of {total}"),
                    );
                })
                .await
        };

        let accepted = self
            .config
            .local_acceptance
            .accepts(outcome.confidence, &outcome.text);
        info!(
            chars = outcome.char_len(),
            confidence = outcome.confidence,
            pages = outcome.pages_processed,
            early_exit = outcome.exited_early,
            accepted,
            "Local OCR finished"
        );

        if accepted {
            self.learn_success(
                document,
                run,
                ExtractionMethod::LocalOcr,
                &outcome.text,
                outcome.pages_used.clone(),
                outcome.confidence,
            )
            .await;
            return PipelineState::Complete(ExtractionResult::succeeded(
                ExtractionMethod::LocalOcr,
                outcome.text,
                outcome.confidence,
                outcome.pages_processed,
                0,
            ));
        }

        let timed_out = outcome.timed_out;
        run.offer(Candidate {
            method: ExtractionMethod::LocalOcr,
            pages_processed: outcome.pages_processed,
            text: outcome.text,
            confidence: outcome.confidence,
        });
        if timed_out {
            return self.interrupted(run, "local-ocr");
        }
        self.learn_failure(ExtractionMethod::LocalOcr).await;
        if self.cloud_available() {
            PipelineState::Tier3Cloud
        } else {
            PipelineState::Fallback
        }
    }

    // ── Tier 3 ────────────────────────────────────────────

    async fn tier3(
        &self,
        document: &Document,
        run: &mut RunState,
        progress: &mut ProgressTracker<'_>,
    ) -> PipelineState {
        run.reach(3);
        let Some(cloud) = self.cloud.as_ref().filter(|_| self.cloud_available()) else {
            return PipelineState::Fallback;
        };
        progress.emit(ProgressStage::CloudOcr, 80, 3, "Sending pages to cloud OCR");

        let budget = self.config.max_cloud_pages.min(cloud.max_pages());
        let order = match self.page_order(document, run, budget).await {
            Ok(order) => order,
            Err(ExtractionError::DeadlineExceeded { stage }) => return self.interrupted(run, stage),
            Err(e) => {
                warn!(error = %e, "Page ordering failed");
                Vec::new()
            }
        };
        if let Err(ExtractionError::DeadlineExceeded { stage }) =
            self.render(document, &order, run).await
        {
            return self.interrupted(run, stage);
        }
        let pages = run.pages_in(&order);
        if pages.is_empty() {
            warn!("No rendered pages to send to cloud OCR");
            self.learn_failure(ExtractionMethod::CloudOcr).await;
            return PipelineState::Fallback;
        }

        match cloud.recognize(&pages, run.deadline).await {
            Ok(result) if char_len(&result.text) > self.config.cloud_min_chars => {
                progress.emit(
                    ProgressStage::CloudOcr,
                    88,
                    3,
                    format!("Cloud OCR succeeded via {}", result.provider),
                );
                let pages_used: Vec<usize> =
                    pages.iter().take(result.pages_sent).map(|p| p.page_index).collect();
                self.learn_success(
                    document,
                    run,
                    ExtractionMethod::CloudOcr,
                    &result.text,
                    pages_used,
                    result.confidence,
                )
                .await;
                PipelineState::Complete(ExtractionResult::succeeded(
                    ExtractionMethod::CloudOcr,
                    result.text,
                    result.confidence,
                    result.pages_sent,
                    0,
                ))
            }
            Ok(result) => {
                warn!(
                    provider = %result.provider,
                    chars = char_len(&result.text),
                    "Cloud OCR result below character floor"
                );
                self.learn_failure(ExtractionMethod::CloudOcr).await;
                run.offer(Candidate {
                    method: ExtractionMethod::CloudOcr,
                    pages_processed: result.pages_sent,
                    text: result.text,
                    confidence: result.confidence,
                });
                PipelineState::Fallback
            }
            Err(ExtractionError::DeadlineExceeded { stage }) => self.interrupted(run, stage),
            Err(e) => {
                warn!(error = %e, "Cloud OCR failed");
                self.learn_failure(ExtractionMethod::CloudOcr).await;
                PipelineState::Fallback
            }
        }
    }

    // ── Fallback ──────────────────────────────────────────

    async fn fallback(
        &self,
        document: &Document,
        run: &mut RunState,
        progress: &mut ProgressTracker<'_>,
    ) -> PipelineState {
        progress.emit(ProgressStage::Fallback, 90, run.tier_reached, "Using best partial result");

        if let Some(candidate) = run.fallback_candidate.take() {
            info!(
                method = %candidate.method,
                chars = char_len(&candidate.text),
                confidence = candidate.confidence,
                "Returning fallback candidate"
            );
            return PipelineState::Complete(ExtractionResult::succeeded(
                candidate.method,
                candidate.text,
                candidate.confidence,
                candidate.pages_processed,
                0,
            ));
        }

        if run.deadline_hit || Instant::now() >= run.deadline {
            return PipelineState::Failed;
        }

        // Last resort: raw renders, no preprocessing.
        let budget = self.config.max_local_pages;
        let order = match self.page_order(document, run, budget).await {
            Ok(order) => order,
            Err(_) => return PipelineState::Failed,
        };
        if self.render(document, &order, run).await.is_err() {
            return PipelineState::Failed;
        }
        let raw = run.pages_in(&order);
        if raw.is_empty() {
            return PipelineState::Failed;
        }

        let outcome = self.local.recognize(&raw, budget, run.deadline).await;
        if outcome.char_len() == 0 {
            return PipelineState::Failed;
        }
        info!(chars = outcome.char_len(), "Best-effort pass recovered text");
        PipelineState::Complete(ExtractionResult::succeeded(
            ExtractionMethod::LocalOcr,
            outcome.text,
            outcome.confidence,
            outcome.pages_processed,
            0,
        ))
    }

    // ── Steps ─────────────────────────────────────────────

    async fn page_order(
        &self,
        document: &Document,
        run: &mut RunState,
        budget: usize,
    ) -> Result<Vec<usize>, ExtractionError> {
        let total = match run.page_count {
            Some(n) => n,
            None => {
                let renderer = Arc::clone(&self.renderer);
                let doc = document.clone();
                let n = match run_blocking(run.deadline, "rendering", move || renderer.page_count(&doc))
                    .await
                {
                    Ok(n) => n,
                    Err(e @ ExtractionError::DeadlineExceeded { .. }) => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "Page count unavailable");
                        0
                    }
                };
                run.page_count = Some(n);
                n
            }
        };

        let recommended = self
            .store
            .as_ref()
            .map(|s| s.recommended_pages(total))
            .unwrap_or_default();
        Ok(preferred_order(total, &recommended, budget))
    }

    /// Render pages not rendered (or failed) yet. Only the deadline is an error.
    async fn render(
        &self,
        document: &Document,
        order: &[usize],
        run: &mut RunState,
    ) -> Result<(), ExtractionError> {
        for &index in order {
            if run.rendered.contains_key(&index) || run.render_failed.contains(&index) {
                continue;
            }
            let renderer = Arc::clone(&self.renderer);
            let doc = document.clone();
            let dpi = self.config.render_dpi;
            match run_blocking(run.deadline, "rendering", move || {
                renderer.render_page(&doc, index, dpi)
            })
            .await
            {
                Ok(page) => {
                    run.rendered.insert(index, page);
                }
                Err(e @ ExtractionError::DeadlineExceeded { .. }) => return Err(e),
                Err(e) => {
                    warn!(page = index, error = %e, "Page render failed, skipping");
                    run.render_failed.insert(index);
                }
            }
        }
        Ok(())
    }

    async fn preprocess_pages(
        &self,
        pages: Vec<PageImage>,
        deadline: Instant,
    ) -> Result<Vec<PageImage>, ExtractionError> {
        let mut prepared = Vec::with_capacity(pages.len());
        for page in pages {
            let preprocessor = Arc::clone(&self.preprocessor);
            let base = self.config.preset;
            let adaptive = self.config.adaptive_preset;
            let page = run_blocking(deadline, "preprocessing", move || {
                let preset = select_preset(base, adaptive, &page);
                if preset != base {
                    info!(page = page.page_index, "Washed-out page, using low-quality preset");
                    Ok(ImagePreprocessor::new(preset).preprocess(&page))
                } else {
                    Ok(preprocessor.preprocess(&page))
                }
            })
            .await?;
            prepared.push(page);
        }
        Ok(prepared)
    }

    // ── Learning ──────────────────────────────────────────

    async fn learn_success(
        &self,
        document: &Document,
        run: &RunState,
        method: ExtractionMethod,
        text: &str,
        pages_used: Vec<usize>,
        confidence: f32,
    ) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let finder = self.field_finder.clone();
        let text = text.to_string();
        let file_size = document.len() as u64;
        let page_count = run.page_count.unwrap_or(run.text_pages);

        let task = tokio::task::spawn_blocking(move || {
            let metadata = FileMetadata {
                file_size,
                page_count,
                found_fields: finder.map(|f| f.find_fields(&text)).unwrap_or_default(),
            };
            store.record_success(method, &text, &pages_used, confidence, &metadata);
        });
        if let Err(e) = task.await {
            warn!(error = %e, "Recording success failed");
        }
    }

    async fn learn_failure(&self, method: ExtractionMethod) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || store.record_failure(method)).await {
            warn!(error = %e, "Recording failure failed");
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
enum CloudSource {
    /// Build from the config's providers (or the environment).
    #[default]
    Auto,
    Fixed(Option<Arc<CloudOcrClient>>),
}

/// Missing parts are filled with the production adapters at `build`.
#[derive(Default)]
pub struct ExtractionPipelineBuilder {
    direct: Option<Arc<dyn DirectTextExtractor>>,
    renderer: Option<Arc<dyn PageRenderer>>,
    preprocessor: Option<ImagePreprocessor>,
    local: Option<Arc<LocalOcrEngine>>,
    cloud: CloudSource,
    store: Option<Arc<TemplateStore>>,
    field_finder: Option<Arc<dyn FieldFinder>>,
    config: Option<ExtractionConfig>,
    deadline: Option<Duration>,
}

impl ExtractionPipelineBuilder {
    pub fn with_config(mut self, config: ExtractionConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_direct_extractor(mut self, extractor: Arc<dyn DirectTextExtractor>) -> Self {
        self.direct = Some(extractor);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: ImagePreprocessor) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_local_ocr(mut self, engine: Arc<LocalOcrEngine>) -> Self {
        self.local = Some(engine);
        self
    }

    pub fn with_cloud_client(mut self, client: Arc<CloudOcrClient>) -> Self {
        self.cloud = CloudSource::Fixed(Some(client));
        self
    }

    pub fn without_cloud(mut self) -> Self {
        self.cloud = CloudSource::Fixed(None);
        self
    }

    pub fn with_template_store(mut self, store: Arc<TemplateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_field_finder(mut self, finder: Arc<dyn FieldFinder>) -> Self {
        self.field_finder = Some(finder);
        self
    }

    /// Overrides `deadline_secs` with a finer-grained budget.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> Result<ExtractionPipeline, ExtractionError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let local = match self.local {
            Some(local) => local,
            None => Arc::new(
                LocalOcrEngine::new(OcrEnginePool::tesseract(
                    config.ocr_pool_size,
                    &config.ocr_language,
                ))
                .with_early_exit(config.early_exit),
            ),
        };

        let cloud = match self.cloud {
            CloudSource::Fixed(client) => client,
            CloudSource::Auto if config.cloud_fallback_enabled => {
                let client = CloudOcrClient::from_configs(
                    &config.resolved_providers(),
                    config.max_cloud_pages,
                    config.cloud_min_chars,
                )?;
                if client.is_empty() {
                    info!("No cloud OCR provider configured, tier 3 disabled");
                    None
                } else {
                    info!(providers = ?client.provider_names(), "Cloud OCR providers ready");
                    Some(Arc::new(client))
                }
            }
            CloudSource::Auto => None,
        };

        Ok(ExtractionPipeline {
            direct: self.direct.unwrap_or_else(|| Arc::new(PdfiumTextExtractor)),
            renderer: self
                .renderer
                .unwrap_or_else(|| Arc::new(DocumentRenderer::detect())),
            preprocessor: Arc::new(
                self.preprocessor
                    .unwrap_or_else(|| ImagePreprocessor::new(config.preset)),
            ),
            local,
            cloud,
            store: self.store,
            field_finder: self.field_finder,
            deadline: self.deadline.unwrap_or_else(|| config.deadline()),
            config,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::pipeline::extraction::{
        MockCloudProvider, MockDirectExtractor, MockOcrEngine, OcrEngine, OcrPageResult,
        ProgressEvent,
    };
    use crate::pipeline::extraction::pdfium::MockPageRenderer;

    fn doc() -> Document {
        Document::from_bytes(b"%PDF-1.7 contract".to_vec())
    }

    fn config() -> ExtractionConfig {
        ExtractionConfig::base_default()
    }

    fn local(engine: impl OcrEngine + 'static) -> Arc<LocalOcrEngine> {
        Arc::new(LocalOcrEngine::new(OcrEnginePool::from_engines(vec![Box::new(engine)])))
    }

    /// Exactly `chars` characters, never ending in whitespace.
    fn contract_text(chars: usize) -> String {
        let mut text: String = "عقد إيجار سيارة بين الطرفين "
            .chars()
            .cycle()
            .take(chars.saturating_sub(1))
            .collect();
        text.push('ع');
        text
    }

    /// Renderer that counts render calls.
    struct CountingRenderer {
        inner: MockPageRenderer,
        renders: AtomicUsize,
    }

    impl CountingRenderer {
        fn new(pages: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MockPageRenderer::new(pages),
                renders: AtomicUsize::new(0),
            })
        }
    }

    impl PageRenderer for CountingRenderer {
        fn page_count(&self, document: &Document) -> Result<usize, ExtractionError> {
            self.inner.page_count(document)
        }

        fn render_page(
            &self,
            document: &Document,
            page_index: usize,
            dpi: u32,
        ) -> Result<PageImage, ExtractionError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            self.inner.render_page(document, page_index, dpi)
        }
    }

    /// OCR engine sharing its call counter with the test.
    struct CountingEngine {
        inner: MockOcrEngine,
        calls: Arc<AtomicUsize>,
    }

    impl OcrEngine for CountingEngine {
        fn ocr_image(&self, png: &[u8]) -> Result<OcrPageResult, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.ocr_image(png)
        }
    }

    struct SlowRenderer(Duration);

    impl PageRenderer for SlowRenderer {
        fn page_count(&self, _document: &Document) -> Result<usize, ExtractionError> {
            Ok(2)
        }

        fn render_page(
            &self,
            document: &Document,
            page_index: usize,
            dpi: u32,
        ) -> Result<PageImage, ExtractionError> {
            std::thread::sleep(self.0);
            MockPageRenderer::new(2).render_page(document, page_index, dpi)
        }
    }

    struct SlowEngine(Duration);

    impl OcrEngine for SlowEngine {
        fn ocr_image(&self, png: &[u8]) -> Result<OcrPageResult, ExtractionError> {
            std::thread::sleep(self.0);
            MockOcrEngine::new(&contract_text(900), 0.9).ocr_image(png)
        }
    }

    fn cloud(providers: Vec<Arc<MockCloudProvider>>) -> Arc<CloudOcrClient> {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn crate::pipeline::extraction::CloudOcrProvider>)
            .collect();
        Arc::new(CloudOcrClient::new(providers, 3, 100))
    }

    // ── pure helpers ──

    #[test]
    fn preferred_order_puts_recommended_first() {
        assert_eq!(preferred_order(5, &[3, 1], 3), vec![3, 1, 0]);
        assert_eq!(preferred_order(5, &[], 2), vec![0, 1]);
        assert_eq!(preferred_order(2, &[7, 1, 1], 3), vec![1, 0]);
        assert_eq!(preferred_order(0, &[0, 1], 3), Vec::<usize>::new());
    }

    #[test]
    fn washed_out_page_selects_low_quality() {
        let flat = PageImage::new(0, RgbImage::from_pixel(32, 32, Rgb([230; 3])));
        let crisp = PageImage::new(
            0,
            RgbImage::from_fn(32, 32, |x, _| if x % 2 == 0 { Rgb([0; 3]) } else { Rgb([255; 3]) }),
        );
        assert_eq!(
            select_preset(PreprocessPreset::ContractDefault, true, &flat),
            PreprocessPreset::LowQuality
        );
        assert_eq!(
            select_preset(PreprocessPreset::ContractDefault, false, &flat),
            PreprocessPreset::ContractDefault
        );
        assert_eq!(
            select_preset(PreprocessPreset::ScriptOptimized, true, &crisp),
            PreprocessPreset::ScriptOptimized
        );
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut c = config();
        c.max_local_pages = 0;
        let result = ExtractionPipeline::builder().with_config(c).without_cloud().build();
        assert!(matches!(result, Err(ExtractionError::InvalidConfig(_))));
    }

    // ── scenarios ──

    #[tokio::test]
    async fn digital_document_completes_at_tier_one() {
        let body = contract_text(2000);
        let renderer = CountingRenderer::new(1);
        let provider = Arc::new(MockCloudProvider::new("gemini", &contract_text(1500)));
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec![body.as_str()])))
            .with_renderer(renderer.clone())
            .with_local_ocr(local(MockOcrEngine::new("unused", 0.9)))
            .with_cloud_client(cloud(vec![provider.clone()]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::Direct);
        assert_eq!(result.tier, 1);
        assert_eq!(result.pages_processed, 1);
        assert!(result.confidence > 0.9);
        assert_eq!(renderer.renders.load(Ordering::SeqCst), 0, "tier 2 must not run");
        assert!(provider.calls().is_empty(), "tier 3 must not run");
    }

    #[tokio::test]
    async fn clean_scan_completes_at_tier_two() {
        let provider = Arc::new(MockCloudProvider::new("gemini", &contract_text(1500)));
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(2)))
            .with_renderer(Arc::new(MockPageRenderer::new(2)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(400), 0.82)))
            .with_cloud_client(cloud(vec![provider.clone()]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::LocalOcr);
        assert_eq!(result.tier, 2);
        assert!(result.confidence >= 0.65);
        assert_eq!(result.pages_processed, 2);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn long_low_confidence_text_passes_dual_criterion() {
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(1)))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(700), 0.4)))
            .without_cloud()
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert_eq!(result.method, ExtractionMethod::LocalOcr);
        assert!((result.confidence - 0.4).abs() < 1e-5);
    }

    #[tokio::test]
    async fn poor_scan_escalates_to_cloud() {
        let failing = Arc::new(MockCloudProvider::new(
            "gemini",
            &format!("I'm sorry, I cannot read this. {}", "x".repeat(150)),
        ));
        let good = Arc::new(MockCloudProvider::new("deepseek", &contract_text(1500)));
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(3)))
            .with_renderer(Arc::new(MockPageRenderer::new(3)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(60), 0.2)))
            .with_cloud_client(cloud(vec![failing.clone(), good.clone()]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::CloudOcr);
        assert_eq!(result.tier, 3);
        assert_eq!(char_len(&result.text), 1500);
        assert_eq!(failing.calls(), vec![3]);
        assert_eq!(good.calls(), vec![3]);
    }

    #[tokio::test]
    async fn cloud_disabled_returns_local_partial() {
        let mut c = config();
        c.cloud_fallback_enabled = false;
        let provider = Arc::new(MockCloudProvider::new("gemini", &contract_text(1500)));
        let text = contract_text(300);
        let pipeline = ExtractionPipeline::builder()
            .with_config(c)
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(1)))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new(&text, 0.3)))
            .with_cloud_client(cloud(vec![provider.clone()]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::LocalOcr);
        assert_eq!(char_len(&result.text), 300);
        assert!((result.confidence - 0.3).abs() < 1e-5);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn corrupted_document_fails_cleanly() {
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::failing("xref table damaged")))
            .with_renderer(Arc::new(MockPageRenderer::new(2).with_failing_pages(vec![0, 1])))
            .with_local_ocr(local(MockOcrEngine::new("", 0.0)))
            .with_cloud_client(cloud(vec![Arc::new(MockCloudProvider::new("gemini", ""))]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(!result.success);
        assert_eq!(result.method, ExtractionMethod::Failed);
        assert!(result.text.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn empty_everywhere_fails_after_best_effort_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = CountingEngine {
            inner: MockOcrEngine::new("   ", 0.0),
            calls: calls.clone(),
        };
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(1)))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(engine))
            .without_cloud()
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(!result.success);
        assert_eq!(result.tier, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "tier 2 plus the raw best-effort pass");
    }

    #[tokio::test]
    async fn fallback_prefers_higher_confidence_partial() {
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec!["رقم العقد 118"])))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(250), 0.3)))
            .with_cloud_client(cloud(vec![Arc::new(MockCloudProvider::failing("gemini", "HTTP 503"))]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::LocalOcr);
        assert_eq!(char_len(&result.text), 250);
    }

    #[tokio::test]
    async fn unusable_direct_text_survives_as_fallback() {
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec!["Contract No. 2024/118"])))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new("", 0.0)))
            .without_cloud()
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::Direct);
        assert_eq!(result.text, "Contract No. 2024/118");
    }

    #[tokio::test]
    async fn fallback_reports_highest_tier_reached() {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = move |e: ProgressEvent| sink.lock().unwrap().push(e);

        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec!["Contract No. 2024/118"])))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new("", 0.0)))
            .with_cloud_client(cloud(vec![Arc::new(MockCloudProvider::failing("gemini", "HTTP 503"))]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), Some(&reporter)).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::Direct);
        assert_eq!(result.tier, 3);

        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.stage, ProgressStage::Complete);
        assert_eq!(last.tier, 3);
        for pair in events.windows(2) {
            assert!(pair[0].tier <= pair[1].tier, "tier went backwards");
        }
    }

    // ── progress ──

    #[tokio::test]
    async fn progress_is_ordered_and_monotonic() {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = move |e: ProgressEvent| sink.lock().unwrap().push(e);

        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(2)))
            .with_renderer(Arc::new(MockPageRenderer::new(2)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(60), 0.2)))
            .with_cloud_client(cloud(vec![Arc::new(MockCloudProvider::new("gemini", &contract_text(1200)))]))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), Some(&reporter)).await;
        assert_eq!(result.method, ExtractionMethod::CloudOcr);

        let events = events.lock().unwrap();
        assert_eq!(events.first().unwrap().stage, ProgressStage::Starting);
        assert_eq!(events.last().unwrap().stage, ProgressStage::Complete);
        assert_eq!(events.last().unwrap().percent, 100);
        for pair in events.windows(2) {
            assert!(pair[0].percent <= pair[1].percent, "percent went backwards");
            assert!(pair[0].tier <= pair[1].tier, "tier went backwards");
        }
        let stages: Vec<ProgressStage> = events.iter().map(|e| e.stage).collect();
        let pos = |s: ProgressStage| stages.iter().position(|x| *x == s).unwrap();
        assert!(pos(ProgressStage::Direct) < pos(ProgressStage::Rendering));
        assert!(pos(ProgressStage::Preprocessing) < pos(ProgressStage::LocalOcr));
        assert!(pos(ProgressStage::LocalOcr) < pos(ProgressStage::CloudOcr));
    }

    #[tokio::test]
    async fn failed_run_ends_with_failed_event() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reporter = crate::pipeline::extraction::ChannelReporter(tx);
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(1)))
            .with_renderer(Arc::new(MockPageRenderer::new(0)))
            .with_local_ocr(local(MockOcrEngine::new("", 0.0)))
            .without_cloud()
            .build()
            .unwrap();

        pipeline.extract(doc(), Some(&reporter)).await;
        drop(reporter);
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert_eq!(last.unwrap().stage, ProgressStage::Failed);
    }

    // ── deadline ──

    #[tokio::test]
    async fn deadline_skips_to_fallback_with_candidate() {
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec!["partial header"])))
            .with_renderer(Arc::new(SlowRenderer(Duration::from_millis(400))))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(900), 0.9)))
            .without_cloud()
            .with_deadline(Duration::from_millis(100))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.method, ExtractionMethod::Direct);
        assert_eq!(result.text, "partial header");
    }

    #[tokio::test]
    async fn deadline_skips_best_effort_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = CountingEngine {
            inner: MockOcrEngine::new(&contract_text(900), 0.9),
            calls: calls.clone(),
        };
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(2)))
            .with_renderer(Arc::new(SlowRenderer(Duration::from_millis(400))))
            .with_local_ocr(local(engine))
            .without_cloud()
            .with_deadline(Duration::from_millis(100))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.elapsed_ms < 400);
    }

    #[tokio::test]
    async fn oversized_deadline_is_capped() {
        let mut c = config();
        c.deadline_secs = u64::MAX;
        assert!(c.validate().is_ok());

        let body = contract_text(2000);
        let pipeline = ExtractionPipeline::builder()
            .with_config(c)
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec![body.as_str()])))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new("", 0.0)))
            .without_cloud()
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);
        assert_eq!(result.tier, 1);
    }

    // ── learning hooks ──

    #[tokio::test]
    async fn success_is_learned_with_pages_used() {
        let store = Arc::new(TemplateStore::in_memory());
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(2)))
            .with_renderer(Arc::new(MockPageRenderer::new(2)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(400), 0.8)))
            .without_cloud()
            .with_template_store(store.clone())
            .build()
            .unwrap();

        pipeline.extract(doc(), None).await;
        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].method, ExtractionMethod::LocalOcr);
        assert_eq!(patterns[0].important_pages, vec![0, 1]);
    }

    #[tokio::test]
    async fn found_fields_reach_the_store() {
        let store = Arc::new(TemplateStore::in_memory());
        let body = format!("{} رقم اللوحة: 45821 {}", contract_text(900), contract_text(900));
        let finder = |text: &str| -> Vec<FoundField> {
            if text.contains("45821") {
                vec![FoundField::new("plate_number", "45821")]
            } else {
                vec![]
            }
        };
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec![body.as_str()])))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new("", 0.0)))
            .without_cloud()
            .with_template_store(store.clone())
            .with_field_finder(Arc::new(finder))
            .build()
            .unwrap();

        pipeline.extract(doc(), None).await;
        let pattern = &store.patterns()[0];
        assert!(pattern.field_contexts["plate_number"][0].contains("45821"));
    }

    #[tokio::test]
    async fn insufficient_local_decays_and_fallback_is_not_learned() {
        let store = Arc::new(TemplateStore::in_memory());
        store.record_success(
            ExtractionMethod::LocalOcr,
            &contract_text(300),
            &[0],
            0.8,
            &FileMetadata::default(),
        );

        let mut c = config();
        c.cloud_fallback_enabled = false;
        let pipeline = ExtractionPipeline::builder()
            .with_config(c)
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(1)))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(300), 0.3)))
            .without_cloud()
            .with_template_store(store.clone())
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(result.success);

        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].usage_count, 1, "fallback completion must not be learned");
        assert!((patterns[0].success_rate - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn cloud_failure_decays_cloud_pattern() {
        let store = Arc::new(TemplateStore::in_memory());
        store.record_success(
            ExtractionMethod::CloudOcr,
            &contract_text(1500),
            &[0],
            0.9,
            &FileMetadata::default(),
        );
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(1)))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(50), 0.1)))
            .with_cloud_client(cloud(vec![Arc::new(MockCloudProvider::failing("gemini", "HTTP 500"))]))
            .with_template_store(store.clone())
            .build()
            .unwrap();

        pipeline.extract(doc(), None).await;
        let cloud_pattern = store
            .patterns()
            .into_iter()
            .find(|p| p.method == ExtractionMethod::CloudOcr)
            .unwrap();
        assert!((cloud_pattern.success_rate - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn recommended_pages_are_tried_first() {
        let store = Arc::new(TemplateStore::in_memory());
        store.record_success(
            ExtractionMethod::LocalOcr,
            &contract_text(400),
            &[3],
            0.8,
            &FileMetadata::default(),
        );

        let mut c = config();
        c.max_local_pages = 1;
        let pipeline = ExtractionPipeline::builder()
            .with_config(c)
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(4)))
            .with_renderer(Arc::new(MockPageRenderer::new(4)))
            .with_local_ocr(local(MockOcrEngine::new(&contract_text(400), 0.8)))
            .without_cloud()
            .with_template_store(store.clone())
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert_eq!(result.method, ExtractionMethod::LocalOcr);
        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].usage_count, 2);
        assert_eq!(patterns[0].important_pages, vec![3]);
    }

    #[tokio::test]
    async fn text_layer_finishes_at_tier_one_despite_ocr_history() {
        let store = Arc::new(TemplateStore::in_memory());
        for _ in 0..3 {
            store.record_success(
                ExtractionMethod::LocalOcr,
                &contract_text(400),
                &[0],
                0.8,
                &FileMetadata::default(),
            );
        }
        assert_eq!(store.recommended_method(), ExtractionMethod::LocalOcr);

        let calls = Arc::new(AtomicUsize::new(0));
        let engine = CountingEngine {
            inner: MockOcrEngine::new(&contract_text(400), 0.8),
            calls: calls.clone(),
        };
        let body = contract_text(2000);
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::new(vec![body.as_str()])))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(engine))
            .without_cloud()
            .with_template_store(store)
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert_eq!(result.method, ExtractionMethod::Direct);
        assert_eq!(result.tier, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timed_out_local_ocr_does_not_decay_pattern() {
        let store = Arc::new(TemplateStore::in_memory());
        store.record_success(
            ExtractionMethod::LocalOcr,
            &contract_text(400),
            &[0],
            0.8,
            &FileMetadata::default(),
        );
        let pipeline = ExtractionPipeline::builder()
            .with_config(config())
            .with_direct_extractor(Arc::new(MockDirectExtractor::empty(1)))
            .with_renderer(Arc::new(MockPageRenderer::new(1)))
            .with_local_ocr(local(SlowEngine(Duration::from_millis(600))))
            .without_cloud()
            .with_template_store(store.clone())
            .with_deadline(Duration::from_millis(200))
            .build()
            .unwrap();

        let result = pipeline.extract(doc(), None).await;
        assert!(!result.success);
        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert!((patterns[0].success_rate - 1.0).abs() < 1e-6);
    }

    // ── invariants ──

    #[tokio::test]
    async fn results_always_within_confidence_domain() {
        let cases: Vec<(MockDirectExtractor, MockOcrEngine)> = vec![
            (MockDirectExtractor::new(vec![contract_text(3000).as_str()]), MockOcrEngine::new("", 0.0)),
            (MockDirectExtractor::empty(1), MockOcrEngine::new(&contract_text(200), 1.7)),
            (MockDirectExtractor::empty(1), MockOcrEngine::new("", 0.0)),
            (MockDirectExtractor::failing("bad"), MockOcrEngine::failing("crash")),
        ];
        for (direct, ocr) in cases {
            let pipeline = ExtractionPipeline::builder()
                .with_config(config())
                .with_direct_extractor(Arc::new(direct))
                .with_renderer(Arc::new(MockPageRenderer::new(1)))
                .with_local_ocr(local(ocr))
                .without_cloud()
                .build()
                .unwrap();
            let result = pipeline.extract(doc(), None).await;
            assert!((0.0..=1.0).contains(&result.confidence));
            assert!((1..=3).contains(&result.tier));
            if !result.success {
                assert_eq!(result.confidence, 0.0);
                assert!(result.text.is_empty());
            }
        }
    }
}
