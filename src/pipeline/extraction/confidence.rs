use serde::{Deserialize, Serialize};

use super::types::{clamp_unit, OcrPageResult, PageText};

/// Confidence constants shared by the tiers
pub mod thresholds {
    /// Ceiling for a digital text layer. Never claim certainty.
    pub const DIRECT_MAX: f32 = 0.95;

    /// Non-whitespace characters at which a page counts as a full text layer.
    pub const DIRECT_FULL_PAGE_CHARS: usize = 200;

    /// Ceiling for heuristic (model-reported-nothing) scoring.
    pub const HEURISTIC_MAX: f32 = 0.95;

    /// Local OCR "high quality" bar.
    pub const HIGH_QUALITY: f32 = 0.65;

    /// Local OCR lower bar, paired with the good-content length.
    pub const LOWER: f32 = 0.35;

    /// Local OCR "good content" length in characters.
    pub const GOOD_CONTENT_CHARS: usize = 500;
}

/// Character count of the trimmed text. Scripts with multi-byte glyphs
/// must not be measured in bytes.
pub fn char_len(text: &str) -> usize {
    text.trim().chars().count()
}

fn non_whitespace_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// Tier-1 confidence: how much of each page looks like a real text layer.
///
/// Each page scores `min(1, chars / DIRECT_FULL_PAGE_CHARS)`; the document
/// confidence is the mean page score scaled by `DIRECT_MAX`. A scanned page
/// with a stray OCR'd header contributes little.
pub fn direct_confidence(pages: &[PageText]) -> f32 {
    if pages.is_empty() {
        return 0.0;
    }

    let total: f32 = pages
        .iter()
        .map(|p| {
            let chars = non_whitespace_chars(&p.text) as f32;
            (chars / thresholds::DIRECT_FULL_PAGE_CHARS as f32).min(1.0)
        })
        .sum();

    clamp_unit(thresholds::DIRECT_MAX * total / pages.len() as f32)
}

/// OCR document confidence: page confidences weighted by text length.
pub fn ocr_confidence(pages: &[OcrPageResult]) -> f32 {
    let total_chars: usize = pages.iter().map(|p| char_len(&p.text)).sum();
    if total_chars == 0 {
        return 0.0;
    }

    let weighted_sum: f32 = pages
        .iter()
        .map(|p| clamp_unit(p.confidence) * char_len(&p.text) as f32)
        .sum();

    clamp_unit(weighted_sum / total_chars as f32)
}

/// Heuristic confidence for engines that report none (cloud vision models).
///
/// Base from length: 0 chars → 0.0, <50 → 0.2, <200 → 0.4, <500 → 0.6,
/// otherwise 0.8. Bonuses for Markdown headers (+0.05), tables (+0.05) and
/// lists (+0.03). Capped at `HEURISTIC_MAX`.
pub fn heuristic_text_confidence(text: &str) -> f32 {
    let len = char_len(text);
    if len == 0 {
        return 0.0;
    }

    let base: f32 = if len < 50 {
        0.2
    } else if len < 200 {
        0.4
    } else if len < 500 {
        0.6
    } else {
        0.8
    };

    let has_headers = text.lines().any(|l| l.starts_with('#'));
    let has_tables = text.lines().any(|l| l.matches('|').count() >= 2);
    let has_lists = text
        .lines()
        .any(|l| l.trim_start().starts_with("- ") || l.trim_start().starts_with("* "));

    let bonus: f32 = if has_headers { 0.05 } else { 0.0 }
        + if has_tables { 0.05 } else { 0.0 }
        + if has_lists { 0.03 } else { 0.0 };

    (base + bonus).min(thresholds::HEURISTIC_MAX)
}

/// Dual acceptance rule for local OCR.
///
/// Some scripts and fonts depress the engine's confidence even when the text
/// is long and usable, so a long result passes on a lower bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalAcceptance {
    #[serde(default = "default_high_quality")]
    pub high_quality_confidence: f32,
    #[serde(default = "default_lower")]
    pub lower_confidence: f32,
    #[serde(default = "default_good_content_chars")]
    pub good_content_chars: usize,
}

fn default_high_quality() -> f32 {
    thresholds::HIGH_QUALITY
}

fn default_lower() -> f32 {
    thresholds::LOWER
}

fn default_good_content_chars() -> usize {
    thresholds::GOOD_CONTENT_CHARS
}

impl Default for LocalAcceptance {
    fn default() -> Self {
        Self {
            high_quality_confidence: default_high_quality(),
            lower_confidence: default_lower(),
            good_content_chars: default_good_content_chars(),
        }
    }
}

impl LocalAcceptance {
    pub fn accepts(&self, confidence: f32, text: &str) -> bool {
        if char_len(text) == 0 {
            return false;
        }
        if confidence >= self.high_quality_confidence {
            return true;
        }
        confidence >= self.lower_confidence && char_len(text) >= self.good_content_chars
    }
}
