use lopdf::{Dictionary, Document, Object};
use time::Date;
use tracing::debug;

use super::{ExtractFailure, Extraction, Extractor, FailureReason, SourceFile};
use crate::domain::DocumentFormat;
use crate::normalize::dates::parse_pdf_date;

/// Text-layer extraction via lopdf. Scanned PDFs without a text layer are reported
/// as empty rather than rasterized.
pub struct PdfExtractor;

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(d) => Some(d),
        _ => None,
    }
}

fn info_date(doc: &Document, key: &[u8]) -> Option<Date> {
    let raw = info_dictionary(doc)?.get(key).ok()?.as_str().ok()?;
    parse_pdf_date(&String::from_utf8_lossy(raw))
}

impl Extractor for PdfExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn extract(&self, src: &SourceFile<'_>) -> Result<Extraction, ExtractFailure> {
        let doc = Document::load_mem(src.bytes).map_err(|e| {
            ExtractFailure::new(FailureReason::CorruptFile, format!("failed to load PDF: {e}"))
        })?;
        if doc.is_encrypted() {
            return Err(ExtractFailure::new(
                FailureReason::ExtractionFailed,
                "PDF is encrypted",
            ));
        }

        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        if pages.is_empty() {
            return Err(ExtractFailure::new(
                FailureReason::CorruptFile,
                "PDF has no pages",
            ));
        }
        debug!(path = %src.path.display(), page_count = pages.len(), "extracting PDF text");

        let text = doc.extract_text(&pages).map_err(|e| {
            ExtractFailure::new(
                FailureReason::ExtractionFailed,
                format!("failed to extract PDF text: {e}"),
            )
        })?;

        Ok(Extraction {
            text,
            declared: info_date(&doc, b"CreationDate"),
            observed: info_date(&doc, b"ModDate"),
            participants: Vec::new(),
        })
    }
}
