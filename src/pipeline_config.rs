//! Extraction configuration.
//!
//! Every field has a serde default, so a config file only needs the values it
//! changes. `Default` starts from the built-in values and applies environment
//! overrides on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::extraction::{
    providers_from_env, CloudProviderConfig, EarlyExitRule, ExtractionError, LocalAcceptance,
    PreprocessPreset, DEFAULT_OCR_LANGUAGE,
};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Tier 1 confidence bar.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Tier 1 character floor.
    #[serde(default = "default_direct_min_chars")]
    pub direct_min_chars: usize,
    #[serde(default = "default_page_budget")]
    pub max_local_pages: usize,
    #[serde(default = "default_page_budget")]
    pub max_cloud_pages: usize,
    #[serde(default = "default_true")]
    pub cloud_fallback_enabled: bool,
    #[serde(default)]
    pub preset: PreprocessPreset,
    #[serde(default)]
    pub local_acceptance: LocalAcceptance,
    #[serde(default)]
    pub early_exit: EarlyExitRule,
    /// Tier 3 character floor.
    #[serde(default = "default_cloud_min_chars")]
    pub cloud_min_chars: usize,
    #[serde(default = "default_render_dpi")]
    pub render_dpi: u32,
    /// Overall budget for one run, in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_ocr_pool_size")]
    pub ocr_pool_size: usize,
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,
    /// Re-run washed-out pages with the low-quality preset.
    #[serde(default = "default_true")]
    pub adaptive_preset: bool,
    /// Tried in order. Empty means auto-detect from the environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cloud_providers: Vec<CloudProviderConfig>,
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_direct_min_chars() -> usize {
    100
}

fn default_page_budget() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_cloud_min_chars() -> usize {
    100
}

fn default_render_dpi() -> u32 {
    crate::pipeline::extraction::pdfium::DEFAULT_RENDER_DPI
}

fn default_deadline_secs() -> u64 {
    180
}

fn default_ocr_pool_size() -> usize {
    1
}

fn default_ocr_language() -> String {
    DEFAULT_OCR_LANGUAGE.to_string()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::base_default().with_env_overrides()
    }
}

// ═══════════════════════════════════════════════════════════
// Construction
// ═══════════════════════════════════════════════════════════

impl ExtractionConfig {
    /// Built-in values without environment overrides.
    pub fn base_default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            direct_min_chars: default_direct_min_chars(),
            max_local_pages: default_page_budget(),
            max_cloud_pages: default_page_budget(),
            cloud_fallback_enabled: true,
            preset: PreprocessPreset::default(),
            local_acceptance: LocalAcceptance::default(),
            early_exit: EarlyExitRule::default(),
            cloud_min_chars: default_cloud_min_chars(),
            render_dpi: default_render_dpi(),
            deadline_secs: default_deadline_secs(),
            ocr_pool_size: default_ocr_pool_size(),
            ocr_language: default_ocr_language(),
            adaptive_preset: true,
            cloud_providers: Vec::new(),
        }
    }

    /// Read a JSON config file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self, ExtractionError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ExtractionError::InvalidConfig(format!("{}: {e}", path.display()))
        })?;
        Ok(config.with_env_overrides())
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `EXTRACT_MIN_CONFIDENCE`, `EXTRACT_DIRECT_MIN_CHARS`
    /// - `EXTRACT_MAX_LOCAL_PAGES`, `EXTRACT_MAX_CLOUD_PAGES`
    /// - `EXTRACT_CLOUD_FALLBACK`: "true"/"1" or "false"/"0"
    /// - `EXTRACT_PRESET`: `contract-default`, `low-quality` or `script-optimized`
    /// - `EXTRACT_HIGH_QUALITY_CONFIDENCE`, `EXTRACT_LOWER_CONFIDENCE`, `EXTRACT_GOOD_CONTENT_CHARS`
    /// - `EXTRACT_RENDER_DPI`, `EXTRACT_DEADLINE_SECS`
    /// - `EXTRACT_OCR_POOL_SIZE`, `EXTRACT_OCR_LANG`
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    pub(crate) fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            let raw = lookup(name)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(var = name, value = %raw, "Ignoring unparseable override");
                    None
                }
            }
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parsed(lookup, "EXTRACT_MIN_CONFIDENCE") {
            self.min_confidence = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_DIRECT_MIN_CHARS") {
            self.direct_min_chars = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_MAX_LOCAL_PAGES") {
            self.max_local_pages = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_MAX_CLOUD_PAGES") {
            self.max_cloud_pages = v;
        }
        if let Some(val) = lookup("EXTRACT_CLOUD_FALLBACK") {
            self.cloud_fallback_enabled = val.eq_ignore_ascii_case("true") || val.trim() == "1";
        }
        if let Some(v) = parsed(lookup, "EXTRACT_PRESET") {
            self.preset = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_HIGH_QUALITY_CONFIDENCE") {
            self.local_acceptance.high_quality_confidence = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_LOWER_CONFIDENCE") {
            self.local_acceptance.lower_confidence = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_GOOD_CONTENT_CHARS") {
            self.local_acceptance.good_content_chars = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_RENDER_DPI") {
            self.render_dpi = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_DEADLINE_SECS") {
            self.deadline_secs = v;
        }
        if let Some(v) = parsed(lookup, "EXTRACT_OCR_POOL_SIZE") {
            self.ocr_pool_size = v;
        }
        if let Some(v) = lookup("EXTRACT_OCR_LANG").filter(|v| !v.trim().is_empty()) {
            self.ocr_language = v.trim().to_string();
        }
        self
    }

    /// Reject values no run could honor.
    pub fn validate(&self) -> Result<(), ExtractionError> {
        let unit = [
            ("min_confidence", self.min_confidence),
            ("local_acceptance.high_quality_confidence", self.local_acceptance.high_quality_confidence),
            ("local_acceptance.lower_confidence", self.local_acceptance.lower_confidence),
            ("early_exit.min_confidence", self.early_exit.min_confidence),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ExtractionError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.local_acceptance.lower_confidence > self.local_acceptance.high_quality_confidence {
            return Err(ExtractionError::InvalidConfig(
                "local_acceptance.lower_confidence exceeds high_quality_confidence".into(),
            ));
        }
        for (name, value) in [
            ("max_local_pages", self.max_local_pages),
            ("max_cloud_pages", self.max_cloud_pages),
            ("ocr_pool_size", self.ocr_pool_size),
        ] {
            if value == 0 {
                return Err(ExtractionError::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if self.render_dpi == 0 {
            return Err(ExtractionError::InvalidConfig("render_dpi must be positive".into()));
        }
        if self.deadline_secs == 0 {
            return Err(ExtractionError::InvalidConfig("deadline_secs must be positive".into()));
        }
        if self.ocr_language.trim().is_empty() {
            return Err(ExtractionError::InvalidConfig("ocr_language must not be empty".into()));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Configured providers, or those found in the environment when none are configured.
    pub fn resolved_providers(&self) -> Vec<CloudProviderConfig> {
        if self.cloud_providers.is_empty() {
            providers_from_env()
        } else {
            self.cloud_providers.clone()
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
