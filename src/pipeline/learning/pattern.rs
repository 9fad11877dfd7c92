use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::extraction::ExtractionMethod;

/// Two results belong to the same document shape when their text lengths differ by at most this.
pub const LENGTH_TOLERANCE_CHARS: f64 = 500.0;

/// Fraction of the remaining headroom a success adds to the success rate.
pub const SUCCESS_NUDGE: f32 = 0.1;

/// Multiplier applied to the success rate on failure.
pub const FAILURE_DECAY: f32 = 0.9;

pub const MAX_IMPORTANT_PAGES: usize = 10;
pub const MAX_CONTEXTS_PER_FIELD: usize = 5;

/// Characters kept on each side of a found value.
pub const CONTEXT_RADIUS_CHARS: usize = 40;

/// A field value found in the extracted text by a downstream parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundField {
    pub name: String,
    pub value: String,
}

impl FoundField {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Facts about the source file recorded with a success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_size: u64,
    pub page_count: usize,
    #[serde(default)]
    pub found_fields: Vec<FoundField>,
}

/// A learned extraction template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: Uuid,
    pub method: ExtractionMethod,
    /// Field name to snippets of text seen around its value.
    #[serde(default)]
    pub field_contexts: BTreeMap<String, Vec<String>>,
    /// Page indices that produced text, oldest first.
    #[serde(default)]
    pub important_pages: Vec<usize>,
    pub confidence: f32,
    pub usage_count: u32,
    pub last_used: DateTime<Utc>,
    pub success_rate: f32,
    pub avg_text_length: f64,
    pub avg_file_size: f64,
    /// Bumped on every change; the higher revision wins when copies are merged.
    #[serde(default)]
    pub revision: u64,
}

impl Pattern {
    pub fn new(
        method: ExtractionMethod,
        text_length: usize,
        pages_used: &[usize],
        confidence: f32,
        metadata: &FileMetadata,
        contexts: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let mut pattern = Self {
            id: Uuid::new_v4(),
            method,
            field_contexts: BTreeMap::new(),
            important_pages: Vec::new(),
            confidence: crate::pipeline::extraction::clamp_unit(confidence),
            usage_count: 1,
            last_used: Utc::now(),
            success_rate: 1.0,
            avg_text_length: text_length as f64,
            avg_file_size: metadata.file_size as f64,
            revision: 1,
        };
        pattern.union_pages(pages_used);
        pattern.union_contexts(contexts);
        pattern
    }

    /// Ranking used for eviction and recommendations.
    pub fn score(&self) -> f32 {
        self.success_rate * self.usage_count as f32
    }

    pub fn matches(&self, method: ExtractionMethod, text_length: usize) -> bool {
        self.method == method
            && (self.avg_text_length - text_length as f64).abs() <= LENGTH_TOLERANCE_CHARS
    }

    /// Fold a repeat success into this pattern.
    pub fn merge_success(
        &mut self,
        text_length: usize,
        pages_used: &[usize],
        confidence: f32,
        metadata: &FileMetadata,
        contexts: BTreeMap<String, Vec<String>>,
    ) {
        let n = self.usage_count as f64;
        self.avg_text_length = (self.avg_text_length * n + text_length as f64) / (n + 1.0);
        self.avg_file_size = (self.avg_file_size * n + metadata.file_size as f64) / (n + 1.0);
        self.confidence = crate::pipeline::extraction::clamp_unit(
            ((self.confidence as f64 * n + confidence as f64) / (n + 1.0)) as f32,
        );
        self.usage_count = self.usage_count.saturating_add(1);
        self.success_rate = (self.success_rate + (1.0 - self.success_rate) * SUCCESS_NUDGE).min(1.0);
        self.last_used = Utc::now();
        self.union_pages(pages_used);
        self.union_contexts(contexts);
        self.revision += 1;
    }

    pub fn decay(&mut self) {
        self.success_rate *= FAILURE_DECAY;
        self.revision += 1;
    }

    fn union_pages(&mut self, pages: &[usize]) {
        for &page in pages {
            if !self.important_pages.contains(&page) {
                self.important_pages.push(page);
            }
        }
        if self.important_pages.len() > MAX_IMPORTANT_PAGES {
            let excess = self.important_pages.len() - MAX_IMPORTANT_PAGES;
            self.important_pages.drain(..excess);
        }
    }

    fn union_contexts(&mut self, contexts: BTreeMap<String, Vec<String>>) {
        for (field, snippets) in contexts {
            let existing = self.field_contexts.entry(field).or_default();
            for snippet in snippets {
                if !existing.contains(&snippet) {
                    existing.push(snippet);
                }
            }
            if existing.len() > MAX_CONTEXTS_PER_FIELD {
                let excess = existing.len() - MAX_CONTEXTS_PER_FIELD;
                existing.drain(..excess);
            }
        }
    }
}

/// Snippets of `text` around each found field value, grouped by field name.
///
/// Values that do not occur in the text are ignored.
pub fn extract_contexts(text: &str, fields: &[FoundField]) -> BTreeMap<String, Vec<String>> {
    let mut contexts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for field in fields {
        let value = field.value.trim();
        if value.is_empty() {
            continue;
        }
        let Some(start) = text.find(value) else {
            continue;
        };
        let end = start + value.len();

        let before: Vec<char> = text[..start].chars().rev().take(CONTEXT_RADIUS_CHARS).collect();
        let after: String = text[end..].chars().take(CONTEXT_RADIUS_CHARS).collect();
        let before: String = before.into_iter().rev().collect();

        let snippet = format!("{before}{value}{after}")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let entry = contexts.entry(field.name.clone()).or_default();
        if !entry.contains(&snippet) {
            entry.push(snippet);
        }
    }
    contexts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> FileMetadata {
        FileMetadata {
            file_size: size,
            page_count: 3,
            found_fields: vec![],
        }
    }

    #[test]
    fn new_pattern_starts_at_full_success() {
        let p = Pattern::new(ExtractionMethod::LocalOcr, 1200, &[0, 1], 0.8, &meta(1000), BTreeMap::new());
        assert_eq!(p.usage_count, 1);
        assert!((p.success_rate - 1.0).abs() < f32::EPSILON);
        assert_eq!(p.important_pages, vec![0, 1]);
        assert!((p.score() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn matches_within_tolerance_only() {
        let p = Pattern::new(ExtractionMethod::Direct, 2000, &[0], 0.9, &meta(1), BTreeMap::new());
        assert!(p.matches(ExtractionMethod::Direct, 2500));
        assert!(p.matches(ExtractionMethod::Direct, 1500));
        assert!(!p.matches(ExtractionMethod::Direct, 2501));
        assert!(!p.matches(ExtractionMethod::LocalOcr, 2000));
    }

    #[test]
    fn merge_updates_running_averages() {
        let mut p = Pattern::new(ExtractionMethod::Direct, 1000, &[0], 0.6, &meta(100), BTreeMap::new());
        p.merge_success(2000, &[1], 1.0, &meta(300), BTreeMap::new());
        assert_eq!(p.usage_count, 2);
        assert!((p.avg_text_length - 1500.0).abs() < 1e-9);
        assert!((p.avg_file_size - 200.0).abs() < 1e-9);
        assert!((p.confidence - 0.8).abs() < 1e-5);
        assert_eq!(p.important_pages, vec![0, 1]);
    }

    #[test]
    fn success_nudges_rate_towards_one() {
        let mut p = Pattern::new(ExtractionMethod::Direct, 1000, &[], 0.9, &meta(1), BTreeMap::new());
        p.success_rate = 0.5;
        p.merge_success(1000, &[], 0.9, &meta(1), BTreeMap::new());
        assert!((p.success_rate - 0.55).abs() < 1e-6);
    }

    #[test]
    fn decay_is_multiplicative() {
        let mut p = Pattern::new(ExtractionMethod::CloudOcr, 1000, &[], 0.9, &meta(1), BTreeMap::new());
        p.decay();
        p.decay();
        assert!((p.success_rate - 0.81).abs() < 1e-6);
        assert_eq!(p.usage_count, 1);
    }

    #[test]
    fn important_pages_are_capped() {
        let mut p = Pattern::new(ExtractionMethod::LocalOcr, 1000, &[0, 1, 2, 3, 4, 5], 0.9, &meta(1), BTreeMap::new());
        p.merge_success(1000, &[6, 7, 8, 9, 10, 11], 0.9, &meta(1), BTreeMap::new());
        assert_eq!(p.important_pages.len(), MAX_IMPORTANT_PAGES);
        assert_eq!(p.important_pages.first(), Some(&2));
        assert_eq!(p.important_pages.last(), Some(&11));
    }

    #[test]
    fn contexts_are_capped_per_field() {
        let mut p = Pattern::new(ExtractionMethod::Direct, 1000, &[], 0.9, &meta(1), BTreeMap::new());
        for i in 0..8 {
            let mut ctx = BTreeMap::new();
            ctx.insert("contract_number".to_string(), vec![format!("رقم العقد {i}")]);
            p.merge_success(1000, &[], 0.9, &meta(1), ctx);
        }
        let snippets = &p.field_contexts["contract_number"];
        assert_eq!(snippets.len(), MAX_CONTEXTS_PER_FIELD);
        assert_eq!(snippets.last().unwrap(), "رقم العقد 7");
    }

    #[test]
    fn context_window_around_value() {
        let text = format!("{}رقم العقد: 2024-118 التاريخ{}", "أ".repeat(60), "ب".repeat(60));
        let contexts = extract_contexts(&text, &[FoundField::new("contract_number", "2024-118")]);
        let snippet = &contexts["contract_number"][0];
        assert!(snippet.contains("رقم العقد: 2024-118 التاريخ"));
        assert!(snippet.chars().count() <= 2 * CONTEXT_RADIUS_CHARS + "2024-118".len());
    }

    #[test]
    fn absent_and_blank_values_ignored() {
        let contexts = extract_contexts(
            "no values here",
            &[FoundField::new("plate", "12345"), FoundField::new("name", "  ")],
        );
        assert!(contexts.is_empty());
    }

    #[test]
    fn pattern_json_roundtrip_tolerates_missing_optional_fields() {
        let p = Pattern::new(ExtractionMethod::LocalOcr, 900, &[2], 0.7, &meta(5), BTreeMap::new());
        let mut value = serde_json::to_value(&p).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("field_contexts");
        obj.remove("revision");
        let back: Pattern = serde_json::from_value(value).unwrap();
        assert_eq!(back.method, ExtractionMethod::LocalOcr);
        assert_eq!(back.revision, 0);
        assert!(back.field_contexts.is_empty());
    }
}
