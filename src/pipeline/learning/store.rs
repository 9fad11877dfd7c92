//! Persisted set of learned patterns.
//!
//! The whole set lives in one JSON blob under a versioned key. Every mutation
//! re-reads the blob, merges it with memory, applies the change, keeps the
//! top patterns and writes back, all under one lock. The blob decides which
//! patterns exist; memory only wins on revision. Persistence failures are
//! logged and never reach the caller.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::{debug, warn};

use super::pattern::{extract_contexts, FileMetadata, Pattern};
use crate::db::{self, DatabaseError};
use crate::pipeline::extraction::{char_len, ExtractionMethod};

/// Storage key. Bump the suffix when `Pattern`'s layout changes.
pub const PATTERNS_KEY: &str = "extraction_patterns_v2";

pub const DEFAULT_MAX_PATTERNS: usize = 50;

/// Pages suggested before anything has been learned.
pub const DEFAULT_PAGES: [usize; 2] = [0, 1];

pub const RECOMMENDED_PAGE_COUNT: usize = 3;

// ═══════════════════════════════════════════════════════════
// Storage slots
// ═══════════════════════════════════════════════════════════

/// A durable key-value slot holding the serialized pattern set.
pub trait PatternSlot: Send + Sync {
    fn load(&self) -> Result<Option<String>, DatabaseError>;
    fn save(&self, blob: &str) -> Result<(), DatabaseError>;
}

/// Slot in the `learned_patterns` table.
pub struct SqlitePatternSlot {
    conn: Mutex<Connection>,
    key: String,
}

impl SqlitePatternSlot {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            key: PATTERNS_KEY.to_string(),
        }
    }

    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::new(db::open_database(path)?))
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::new(db::open_memory_database()?))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PatternSlot for SqlitePatternSlot {
    fn load(&self) -> Result<Option<String>, DatabaseError> {
        db::get_slot(&self.conn(), &self.key)
    }

    fn save(&self, blob: &str) -> Result<(), DatabaseError> {
        db::set_slot(&self.conn(), &self.key, blob)
    }
}

/// Process-local slot. Clones of the `Arc` share contents.
#[derive(Default)]
pub struct MemoryPatternSlot {
    blob: Mutex<Option<String>>,
}

impl MemoryPatternSlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternSlot for MemoryPatternSlot {
    fn load(&self) -> Result<Option<String>, DatabaseError> {
        Ok(self.blob.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, blob: &str) -> Result<(), DatabaseError> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = Some(blob.to_string());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════

pub struct TemplateStore {
    patterns: Mutex<Vec<Pattern>>,
    slot: Arc<dyn PatternSlot>,
    max_patterns: usize,
}

impl TemplateStore {
    pub fn new(slot: Arc<dyn PatternSlot>) -> Self {
        let patterns = read_slot(slot.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "Could not load learned patterns, starting empty");
            Vec::new()
        });
        debug!(count = patterns.len(), "Learned patterns loaded");
        Self {
            patterns: Mutex::new(patterns),
            slot,
            max_patterns: DEFAULT_MAX_PATTERNS,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPatternSlot::new()))
    }

    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::new(Arc::new(SqlitePatternSlot::open(path)?)))
    }

    pub fn with_max_patterns(mut self, max: usize) -> Self {
        self.max_patterns = max.max(1);
        self
    }

    pub fn max_patterns(&self) -> usize {
        self.max_patterns
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Pattern>> {
        self.patterns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the in-memory set.
    pub fn patterns(&self) -> Vec<Pattern> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replace memory with what is persisted.
    pub fn reload(&self) {
        let mut patterns = self.lock();
        match read_slot(self.slot.as_ref()) {
            Ok(stored) => *patterns = stored,
            Err(e) => warn!(error = %e, "Pattern reload failed, keeping in-memory set"),
        }
    }

    /// Forget everything, in memory and in the slot.
    pub fn clear(&self) {
        let mut patterns = self.lock();
        patterns.clear();
        if let Err(e) = self.slot.save("[]") {
            warn!(error = %e, "Failed to persist cleared pattern set");
        }
    }

    pub fn record_success(
        &self,
        method: ExtractionMethod,
        text: &str,
        pages_used: &[usize],
        confidence: f32,
        metadata: &FileMetadata,
    ) {
        if method == ExtractionMethod::Failed || char_len(text) == 0 {
            return;
        }
        let text_length = char_len(text);
        let contexts = extract_contexts(text, &metadata.found_fields);

        self.mutate(|patterns| {
            let closest = patterns
                .iter_mut()
                .filter(|p| p.matches(method, text_length))
                .min_by(|a, b| {
                    let da = (a.avg_text_length - text_length as f64).abs();
                    let db = (b.avg_text_length - text_length as f64).abs();
                    da.total_cmp(&db)
                });

            match closest {
                Some(pattern) => {
                    pattern.merge_success(text_length, pages_used, confidence, metadata, contexts);
                    debug!(id = %pattern.id, usage = pattern.usage_count, "Pattern reinforced");
                }
                None => {
                    let pattern =
                        Pattern::new(method, text_length, pages_used, confidence, metadata, contexts);
                    debug!(id = %pattern.id, method = %method, "Pattern created");
                    patterns.push(pattern);
                }
            }
        });
    }

    /// Decay the most recently used pattern for `method`.
    pub fn record_failure(&self, method: ExtractionMethod) {
        self.mutate(|patterns| {
            if let Some(pattern) = patterns
                .iter_mut()
                .filter(|p| p.method == method)
                .max_by_key(|p| p.last_used)
            {
                pattern.decay();
                debug!(id = %pattern.id, rate = pattern.success_rate, "Pattern decayed");
            }
        });
    }

    /// Page indices worth processing first, best first, all below `total_pages`.
    pub fn recommended_pages(&self, total_pages: usize) -> Vec<usize> {
        let patterns = self.lock();

        let mut scores: HashMap<usize, f32> = HashMap::new();
        for pattern in patterns.iter() {
            for &page in &pattern.important_pages {
                if page < total_pages {
                    *scores.entry(page).or_default() += pattern.score();
                }
            }
        }

        if scores.is_empty() {
            return DEFAULT_PAGES
                .iter()
                .copied()
                .filter(|&p| p < total_pages)
                .collect();
        }

        let mut ranked: Vec<(usize, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(RECOMMENDED_PAGE_COUNT)
            .map(|(page, _)| page)
            .collect()
    }

    /// Method with the best track record, `Direct` when nothing is known.
    pub fn recommended_method(&self) -> ExtractionMethod {
        let patterns = self.lock();

        let mut scores: HashMap<ExtractionMethod, f32> = HashMap::new();
        for pattern in patterns.iter().filter(|p| p.method != ExtractionMethod::Failed) {
            *scores.entry(pattern.method).or_default() += pattern.score() * pattern.confidence;
        }

        scores
            .into_iter()
            .max_by(|a, b| {
                a.1.total_cmp(&b.1)
                    .then_with(|| tier_order(b.0).cmp(&tier_order(a.0)))
            })
            .map(|(method, _)| method)
            .unwrap_or(ExtractionMethod::Direct)
    }

    /// Read-merge-apply-truncate-write under the lock.
    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut Vec<Pattern>),
    {
        let mut patterns = self.lock();

        match read_slot(self.slot.as_ref()) {
            Ok(stored) => merge_into(&mut patterns, stored),
            Err(e) => warn!(error = %e, "Could not re-read learned patterns before update"),
        }

        apply(&mut patterns);

        patterns.sort_by(|a, b| b.score().total_cmp(&a.score()));
        patterns.truncate(self.max_patterns);

        match serde_json::to_string(&*patterns) {
            Ok(blob) => {
                if let Err(e) = self.slot.save(&blob) {
                    warn!(error = %e, "Failed to persist learned patterns");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize learned patterns"),
        }
    }
}

fn tier_order(method: ExtractionMethod) -> u8 {
    method.tier().unwrap_or(u8::MAX)
}

fn read_slot(slot: &dyn PatternSlot) -> Result<Vec<Pattern>, DatabaseError> {
    match slot.load()? {
        Some(blob) if !blob.trim().is_empty() => Ok(serde_json::from_str(&blob)?),
        _ => Ok(Vec::new()),
    }
}

/// Stored membership wins: patterns missing from `stored` are dropped. For an
/// id present on both sides the higher revision wins, the stored copy on a tie.
fn merge_into(memory: &mut Vec<Pattern>, stored: Vec<Pattern>) {
    memory.retain(|p| stored.iter().any(|s| s.id == p.id));
    for incoming in stored {
        match memory.iter_mut().find(|p| p.id == incoming.id) {
            Some(existing) => {
                if incoming.revision >= existing.revision {
                    *existing = incoming;
                }
            }
            None => memory.push(incoming),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::pipeline::learning::FoundField;

    fn meta() -> FileMetadata {
        FileMetadata {
            file_size: 250_000,
            page_count: 4,
            found_fields: vec![],
        }
    }

    fn text(len: usize) -> String {
        "ع".repeat(len)
    }

    #[test]
    fn first_success_creates_pattern() {
        let store = TemplateStore::in_memory();
        store.record_success(ExtractionMethod::LocalOcr, &text(1200), &[0, 2], 0.8, &meta());
        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].method, ExtractionMethod::LocalOcr);
        assert_eq!(patterns[0].important_pages, vec![0, 2]);
    }

    #[test]
    fn similar_success_merges() {
        let store = TemplateStore::in_memory();
        store.record_success(ExtractionMethod::LocalOcr, &text(1200), &[0], 0.8, &meta());
        store.record_success(ExtractionMethod::LocalOcr, &text(1500), &[1], 0.7, &meta());
        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].usage_count, 2);
        assert_eq!(patterns[0].important_pages, vec![0, 1]);
    }

    #[test]
    fn different_shape_or_method_creates_new() {
        let store = TemplateStore::in_memory();
        store.record_success(ExtractionMethod::LocalOcr, &text(1000), &[0], 0.8, &meta());
        store.record_success(ExtractionMethod::LocalOcr, &text(3000), &[0], 0.8, &meta());
        store.record_success(ExtractionMethod::Direct, &text(1000), &[0], 0.9, &meta());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn empty_text_is_not_learned() {
        let store = TemplateStore::in_memory();
        store.record_success(ExtractionMethod::Direct, "   ", &[0], 0.9, &meta());
        store.record_success(ExtractionMethod::Failed, &text(100), &[0], 0.0, &meta());
        assert!(store.is_empty());
    }

    #[test]
    fn found_fields_become_contexts() {
        let store = TemplateStore::in_memory();
        let body = format!("{} رقم اللوحة: 45821 {}", text(50), text(50));
        let metadata = FileMetadata {
            found_fields: vec![FoundField::new("plate_number", "45821")],
            ..meta()
        };
        store.record_success(ExtractionMethod::Direct, &body, &[0], 0.9, &metadata);
        let pattern = &store.patterns()[0];
        assert!(pattern.field_contexts["plate_number"][0].contains("رقم اللوحة: 45821"));
    }

    #[test]
    fn failure_decays_most_recent_of_method() {
        let store = TemplateStore::in_memory();
        store.record_success(ExtractionMethod::CloudOcr, &text(1000), &[0], 0.8, &meta());
        thread::sleep(std::time::Duration::from_millis(5));
        store.record_success(ExtractionMethod::CloudOcr, &text(5000), &[0], 0.8, &meta());

        store.record_failure(ExtractionMethod::CloudOcr);

        let patterns = store.patterns();
        let recent = patterns.iter().find(|p| p.avg_text_length > 4000.0).unwrap();
        let older = patterns.iter().find(|p| p.avg_text_length < 2000.0).unwrap();
        assert!((recent.success_rate - 0.9).abs() < 1e-6);
        assert!((older.success_rate - 1.0).abs() < 1e-6);
        assert_eq!(store.len(), 2, "failure never deletes");
    }

    #[test]
    fn failure_without_patterns_is_noop() {
        let store = TemplateStore::in_memory();
        store.record_failure(ExtractionMethod::LocalOcr);
        assert!(store.is_empty());
    }

    #[test]
    fn default_recommendations_when_empty() {
        let store = TemplateStore::in_memory();
        assert_eq!(store.recommended_pages(10), vec![0, 1]);
        assert_eq!(store.recommended_pages(1), vec![0]);
        assert_eq!(store.recommended_method(), ExtractionMethod::Direct);
    }

    #[test]
    fn recommended_pages_ranked_by_score() {
        let store = TemplateStore::in_memory();
        for _ in 0..3 {
            store.record_success(ExtractionMethod::LocalOcr, &text(1000), &[2, 3], 0.8, &meta());
        }
        store.record_success(ExtractionMethod::Direct, &text(1000), &[0, 3], 0.9, &meta());

        let pages = store.recommended_pages(10);
        assert_eq!(pages, vec![3, 2, 0]);
        assert_eq!(store.recommended_pages(3), vec![2, 0]);
    }

    #[test]
    fn recommendations_are_stable_without_updates() {
        let store = TemplateStore::in_memory();
        store.record_success(ExtractionMethod::LocalOcr, &text(1000), &[4, 1, 7], 0.8, &meta());
        let first = store.recommended_pages(10);
        for _ in 0..5 {
            assert_eq!(store.recommended_pages(10), first);
        }
    }

    #[test]
    fn recommended_method_weighs_confidence() {
        let store = TemplateStore::in_memory();
        store.record_success(ExtractionMethod::LocalOcr, &text(1000), &[0], 0.5, &meta());
        store.record_success(ExtractionMethod::LocalOcr, &text(1000), &[0], 0.5, &meta());
        store.record_success(ExtractionMethod::CloudOcr, &text(1000), &[0], 0.95, &meta());
        assert_eq!(store.recommended_method(), ExtractionMethod::LocalOcr);
    }

    #[test]
    fn pattern_count_never_exceeds_bound() {
        let slot = Arc::new(MemoryPatternSlot::new());
        let store = TemplateStore::new(slot.clone()).with_max_patterns(5);
        for i in 0..20 {
            store.record_success(ExtractionMethod::Direct, &text(1000 + i * 1000), &[0], 0.9, &meta());
            assert!(store.len() <= 5);
        }
        let persisted: Vec<Pattern> = serde_json::from_str(&slot.load().unwrap().unwrap()).unwrap();
        assert_eq!(persisted.len(), 5);
    }

    #[test]
    fn eviction_keeps_strongest() {
        let store = TemplateStore::in_memory().with_max_patterns(2);
        for _ in 0..4 {
            store.record_success(ExtractionMethod::LocalOcr, &text(1000), &[0], 0.8, &meta());
        }
        store.record_success(ExtractionMethod::Direct, &text(8000), &[0], 0.9, &meta());
        store.record_success(ExtractionMethod::CloudOcr, &text(20000), &[0], 0.9, &meta());
        let strongest = &store.patterns()[0];
        assert_eq!(strongest.usage_count, 4);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn sqlite_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.db");
        {
            let store = TemplateStore::open(&path).unwrap();
            store.record_success(ExtractionMethod::LocalOcr, &text(1400), &[0, 1], 0.72, &meta());
        }
        let reopened = TemplateStore::open(&path).unwrap();
        let patterns = reopened.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].important_pages, vec![0, 1]);
        assert!((patterns[0].confidence - 0.72).abs() < 1e-6);
    }

    #[test]
    fn corrupt_blob_starts_empty() {
        let slot = Arc::new(MemoryPatternSlot::new());
        slot.save("{not json").unwrap();
        let store = TemplateStore::new(slot);
        assert!(store.is_empty());
        store.record_success(ExtractionMethod::Direct, &text(500), &[0], 0.9, &meta());
        assert_eq!(store.len(), 1);
    }

    struct BrokenSlot;

    impl PatternSlot for BrokenSlot {
        fn load(&self) -> Result<Option<String>, DatabaseError> {
            Err(DatabaseError::Io(std::io::Error::other("disk gone")))
        }
        fn save(&self, _blob: &str) -> Result<(), DatabaseError> {
            Err(DatabaseError::Io(std::io::Error::other("disk gone")))
        }
    }

    #[test]
    fn persistence_failures_do_not_block_learning() {
        let store = TemplateStore::new(Arc::new(BrokenSlot));
        store.record_success(ExtractionMethod::LocalOcr, &text(900), &[0], 0.8, &meta());
        store.record_failure(ExtractionMethod::LocalOcr);
        assert_eq!(store.len(), 1);
        assert!((store.patterns()[0].success_rate - 0.9).abs() < 1e-6);
    }

    #[test]
    fn two_stores_sharing_a_slot_see_each_others_updates() {
        let slot: Arc<dyn PatternSlot> = Arc::new(MemoryPatternSlot::new());
        let a = TemplateStore::new(Arc::clone(&slot));
        let b = TemplateStore::new(Arc::clone(&slot));

        a.record_success(ExtractionMethod::LocalOcr, &text(1000), &[0], 0.8, &meta());
        b.record_success(ExtractionMethod::LocalOcr, &text(1000), &[1], 0.8, &meta());
        a.record_success(ExtractionMethod::LocalOcr, &text(1000), &[2], 0.8, &meta());

        a.reload();
        let patterns = a.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].usage_count, 3);
        assert_eq!(patterns[0].important_pages, vec![0, 1, 2]);
    }

    #[test]
    fn clear_from_another_store_is_not_undone() {
        let slot: Arc<dyn PatternSlot> = Arc::new(MemoryPatternSlot::new());
        let running = TemplateStore::new(Arc::clone(&slot));
        running.record_success(ExtractionMethod::LocalOcr, &text(1000), &[0], 0.8, &meta());
        running.record_success(ExtractionMethod::Direct, &text(4000), &[0], 0.9, &meta());

        TemplateStore::new(Arc::clone(&slot)).clear();

        running.record_success(ExtractionMethod::LocalOcr, &text(1000), &[2], 0.8, &meta());
        let patterns = running.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].usage_count, 1);
        assert_eq!(patterns[0].important_pages, vec![2]);

        let persisted: Vec<Pattern> = serde_json::from_str(&slot.load().unwrap().unwrap()).unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let store = Arc::new(TemplateStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..25 {
                        store.record_success(ExtractionMethod::LocalOcr, &text(1000), &[0], 0.8, &meta());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let patterns = store.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].usage_count, 200);
    }

    #[test]
    fn clear_empties_slot_and_memory() {
        let slot = Arc::new(MemoryPatternSlot::new());
        let store = TemplateStore::new(slot.clone());
        store.record_success(ExtractionMethod::Direct, &text(500), &[0], 0.9, &meta());
        store.clear();
        assert!(store.is_empty());
        store.reload();
        assert!(store.is_empty());
        assert_eq!(slot.load().unwrap().as_deref(), Some("[]"));
    }
}
