//! Format-specific text extraction, dispatched on the file signature.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::domain::DocumentFormat;

pub mod email;
pub mod image;
pub mod pdf;
pub mod plaintext;

pub use image::{CommandOcr, OcrEngine};

/// Why a file was skipped. The code is persisted with the failed-ingestion record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ReadFailed,
    TooLarge,
    UnsupportedFormat,
    CorruptFile,
    ExtractionFailed,
    EmptyText,
    OcrUnavailable,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ReadFailed => "INGEST_READ_FAILED",
            FailureReason::TooLarge => "INGEST_TOO_LARGE",
            FailureReason::UnsupportedFormat => "INGEST_UNSUPPORTED_FORMAT",
            FailureReason::CorruptFile => "INGEST_CORRUPT_FILE",
            FailureReason::ExtractionFailed => "INGEST_EXTRACTION_FAILED",
            FailureReason::EmptyText => "INGEST_EMPTY_TEXT",
            FailureReason::OcrUnavailable => "INGEST_OCR_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractFailure {
    pub reason: FailureReason,
    pub details: String,
}

impl ExtractFailure {
    pub fn new(reason: FailureReason, details: impl Into<String>) -> Self {
        Self {
            reason,
            details: details.into(),
        }
    }
}

/// Raw input handed to an extractor.
#[derive(Debug, Clone, Copy)]
pub struct SourceFile<'a> {
    pub path: &'a Path,
    pub bytes: &'a [u8],
}

/// What an extractor could recover from one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    /// Date the document claims for itself in its own metadata.
    pub declared: Option<Date>,
    /// Date the container records for when the artifact was produced.
    pub observed: Option<Date>,
    pub participants: Vec<String>,
}

pub trait Extractor: Send + Sync {
    fn format(&self) -> DocumentFormat;
    fn extract(&self, src: &SourceFile<'_>) -> Result<Extraction, ExtractFailure>;
}

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_MAGIC_WINDOW: usize = 1024;

/// Identify the format from leading bytes.
pub fn sniff(bytes: &[u8]) -> Option<DocumentFormat> {
    let head = &bytes[..bytes.len().min(PDF_MAGIC_WINDOW)];
    if head.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC) {
        return Some(DocumentFormat::Pdf);
    }
    if image::is_image(bytes) {
        return Some(DocumentFormat::Image);
    }
    let text = std::str::from_utf8(bytes).ok()?;
    if text.contains('\0') {
        return None;
    }
    if email::looks_like_email(text) {
        return Some(DocumentFormat::Email);
    }
    Some(DocumentFormat::Plaintext)
}

/// The set of extractors available to an ingestion run, one per format.
pub struct ExtractorSet {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorSet {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// PDF, email, and plaintext extractors, plus image OCR when an engine is supplied.
    pub fn with_defaults(ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        let mut set = Self::empty();
        set.register(Box::new(pdf::PdfExtractor));
        set.register(Box::new(email::EmailExtractor));
        set.register(Box::new(plaintext::PlaintextExtractor));
        set.register(Box::new(image::ImageExtractor::new(ocr)));
        set
    }

    /// Register an extractor, replacing any existing one for the same format.
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        let format = extractor.format();
        self.extractors.retain(|e| e.format() != format);
        self.extractors.push(extractor);
    }

    pub fn formats(&self) -> Vec<DocumentFormat> {
        let mut out: Vec<DocumentFormat> = self.extractors.iter().map(|e| e.format()).collect();
        out.sort();
        out
    }

    pub fn extract(
        &self,
        src: &SourceFile<'_>,
    ) -> Result<(DocumentFormat, Extraction), ExtractFailure> {
        let format = sniff(src.bytes).ok_or_else(|| {
            ExtractFailure::new(
                FailureReason::UnsupportedFormat,
                "file signature not recognized",
            )
        })?;
        let extractor = self
            .extractors
            .iter()
            .find(|e| e.format() == format)
            .ok_or_else(|| {
                ExtractFailure::new(
                    FailureReason::UnsupportedFormat,
                    format!("no extractor registered for {}", format.as_str()),
                )
            })?;
        let mut extraction = extractor.extract(src)?;
        extraction.text = normalize_text(&extraction.text);
        if extraction.text.trim().is_empty() {
            return Err(ExtractFailure::new(
                FailureReason::EmptyText,
                format!("{} extractor produced no text", format.as_str()),
            ));
        }
        Ok((format, extraction))
    }
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self::with_defaults(None)
    }
}

pub(crate) fn normalize_text(s: &str) -> String {
    s.trim_start_matches('\u{feff}')
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}
