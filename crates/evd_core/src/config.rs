use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Direction of a date discrepancy (observed relative to declared).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Observed date is later than the declared date (document claims to be older).
    Later,
    /// Observed date is earlier than the declared date.
    Earlier,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Later => "later",
            Direction::Earlier => "earlier",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatesConfig {
    pub prefix: String,
    pub width: u32,
}

impl Default for BatesConfig {
    fn default() -> Self {
        Self {
            prefix: "EVD".to_string(),
            width: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub max_file_bytes: u64,
    pub include_hidden: bool,
    /// Extraction worker threads; `None` uses the rayon default.
    pub workers: Option<usize>,
    /// Deadline for one external OCR run.
    pub ocr_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 256 * 1024 * 1024,
            include_hidden: false,
            workers: None,
            ocr_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Absolute discrepancy (days) above which an item is flagged individually.
    pub materiality_days: i64,
    /// Minimum number of dated items before a p-value is reported.
    pub min_sample: usize,
    pub significance_level: f64,
    /// Fixed alternative hypothesis; `None` tests the dominant direction.
    pub expected_direction: Option<Direction>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            materiality_days: 0,
            min_sample: 5,
            significance_level: 0.05,
            expected_direction: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SemanticConfig {
    pub ollama_base_url: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorrelationConfig {
    pub window_days: u32,
    pub min_sample: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            min_sample: 3,
        }
    }
}

/// Per-case configuration. Every field has a default; missing sections fall back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaseConfig {
    pub bates: BatesConfig,
    pub ingest: IngestConfig,
    /// Party name -> aliases matched case-insensitively in filenames and text.
    pub parties: BTreeMap<String, Vec<String>>,
    /// Category -> keywords matched case-insensitively in text.
    pub categories: BTreeMap<String, Vec<String>>,
    pub anomaly: AnomalyConfig,
    pub semantic: SemanticConfig,
    pub correlation: CorrelationConfig,
}

impl CaseConfig {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            AppError::new("CONFIG_READ_FAILED", "Failed to read case config")
                .with_details(format!("path={}; err={}", path.display(), e))
        })?;
        let mut cfg: CaseConfig = serde_json::from_str(&raw).map_err(|e| {
            AppError::validation("CONFIG_INVALID", "Failed to parse case config")
                .with_details(format!("path={}; err={}", path.display(), e))
        })?;
        cfg.apply_env_overrides(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `EVD_*` overrides. The lookup is injected so tests stay hermetic.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), AppError> {
        if let Some(v) = lookup("EVD_BATES_PREFIX") {
            self.bates.prefix = v;
        }
        if let Some(v) = lookup("EVD_BATES_WIDTH") {
            self.bates.width = parse_env("EVD_BATES_WIDTH", &v)?;
        }
        if let Some(v) = lookup("EVD_OLLAMA_URL") {
            self.semantic.ollama_base_url = v;
        }
        if let Some(v) = lookup("EVD_EMBED_MODEL") {
            self.semantic.model = v;
        }
        if let Some(v) = lookup("EVD_EMBED_TIMEOUT_MS") {
            self.semantic.timeout_ms = parse_env("EVD_EMBED_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EVD_OCR_TIMEOUT_MS") {
            self.ingest.ocr_timeout_ms = parse_env("EVD_OCR_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EVD_MATERIALITY_DAYS") {
            self.anomaly.materiality_days = parse_env("EVD_MATERIALITY_DAYS", &v)?;
        }
        if let Some(v) = lookup("EVD_MIN_SAMPLE") {
            self.anomaly.min_sample = parse_env("EVD_MIN_SAMPLE", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        crate::bates::validate_prefix(&self.bates.prefix)?;
        if !(1..=12).contains(&self.bates.width) {
            return Err(AppError::validation(
                "CONFIG_INVALID",
                "Bates width must be between 1 and 12",
            )
            .with_details(format!("width={}", self.bates.width)));
        }
        if self.semantic.timeout_ms == 0 || self.ingest.ocr_timeout_ms == 0 {
            return Err(AppError::validation(
                "CONFIG_INVALID",
                "Embedding and OCR timeouts must be positive",
            ));
        }
        if self.anomaly.min_sample < 1 || self.correlation.min_sample < 1 {
            return Err(AppError::validation(
                "CONFIG_INVALID",
                "Minimum sample sizes must be at least 1",
            ));
        }
        if self.anomaly.materiality_days < 0 {
            return Err(AppError::validation(
                "CONFIG_INVALID",
                "Materiality threshold must not be negative",
            )
            .with_details(format!("materiality_days={}", self.anomaly.materiality_days)));
        }
        if !(self.anomaly.significance_level > 0.0 && self.anomaly.significance_level < 1.0) {
            return Err(AppError::validation(
                "CONFIG_INVALID",
                "Significance level must be in (0, 1)",
            )
            .with_details(format!("level={}", self.anomaly.significance_level)));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        AppError::validation("CONFIG_INVALID", "Invalid environment override")
            .with_details(format!("key={key}; value={value}; err={e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: CaseConfig =
            serde_json::from_str(r#"{"bates":{"prefix":"SEDG"},"anomaly":{"min_sample":8}}"#)
                .unwrap();
        assert_eq!(cfg.bates.prefix, "SEDG");
        assert_eq!(cfg.bates.width, 6);
        assert_eq!(cfg.anomaly.min_sample, 8);
        assert_eq!(cfg.anomaly.materiality_days, 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let mut cfg = CaseConfig::default();
        cfg.apply_env_overrides(|k| match k {
            "EVD_BATES_PREFIX" => Some("CASE".to_string()),
            "EVD_MATERIALITY_DAYS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.bates.prefix, "CASE");
        assert_eq!(cfg.anomaly.materiality_days, 3);

        let err = cfg
            .apply_env_overrides(|k| (k == "EVD_MIN_SAMPLE").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.code, "CONFIG_INVALID");
    }

    #[test]
    fn validate_rejects_bad_prefix_and_width() {
        let mut cfg = CaseConfig::default();
        cfg.bates.prefix = "bad prefix".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = CaseConfig::default();
        cfg.bates.width = 0;
        assert!(cfg.validate().is_err());
    }
}
