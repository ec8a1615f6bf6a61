use serde::{Deserialize, Serialize};
use time::Date;

use crate::config::Direction;

/// Format detected from the file signature (never from the extension alone).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Email,
    Image,
    Plaintext,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Email => "email",
            DocumentFormat::Image => "image",
            DocumentFormat::Plaintext => "plaintext",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(DocumentFormat::Pdf),
            "email" => Some(DocumentFormat::Email),
            "image" => Some(DocumentFormat::Image),
            "plaintext" => Some(DocumentFormat::Plaintext),
            _ => None,
        }
    }
}

/// Where a date on an evidence item came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    ControlNumber,
    Filename,
    EmbeddedMetadata,
    ContainerMetadata,
    Filesystem,
}

impl DateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateSource::ControlNumber => "control_number",
            DateSource::Filename => "filename",
            DateSource::EmbeddedMetadata => "embedded_metadata",
            DateSource::ContainerMetadata => "container_metadata",
            DateSource::Filesystem => "filesystem",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "control_number" => Some(DateSource::ControlNumber),
            "filename" => Some(DateSource::Filename),
            "embedded_metadata" => Some(DateSource::EmbeddedMetadata),
            "container_metadata" => Some(DateSource::ContainerMetadata),
            "filesystem" => Some(DateSource::Filesystem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourcedDate {
    pub date: Date,
    pub source: DateSource,
}

/// An ingested piece of evidence. Identifier, hash, and text never change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceItem {
    pub bates_number: String,
    pub sha256: String,
    pub source_path: String,
    pub format: DocumentFormat,
    pub byte_len: u64,
    pub extracted_text: String,
    pub declared_date: Option<SourcedDate>,
    pub observed_date: Option<SourcedDate>,
    pub party_tags: Vec<String>,
    pub category_tags: Vec<String>,
    pub ingested_at: String,
}

impl EvidenceItem {
    /// Signed day difference, observed minus declared, when both dates are known.
    pub fn discrepancy_days(&self) -> Option<i64> {
        match (&self.declared_date, &self.observed_date) {
            (Some(d), Some(o)) => Some((o.date - d.date).whole_days()),
            _ => None,
        }
    }
}

/// A file that could not be ingested. Recorded, never fatal for the batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedIngestion {
    pub source_path: String,
    pub sha256: Option<String>,
    pub reason_code: String,
    pub details: Option<String>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEvent {
    pub id: i64,
    pub event_date: Date,
    pub category: String,
    pub title: String,
    pub description: Option<String>,
    pub participants: Vec<String>,
    pub evidence: Vec<String>,
    pub created_at: String,
}

/// Derived per-item output of a detector run. Regenerated wholesale, never edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyRecord {
    pub bates_number: String,
    pub declared_date: Date,
    pub observed_date: Date,
    pub discrepancy_days: i64,
    pub direction: Option<Direction>,
    pub flagged: bool,
    /// Batch-level p-value of the run this record belongs to.
    pub batch_p_value: Option<f64>,
}
