use super::{ExtractFailure, Extraction, Extractor, FailureReason, SourceFile};
use crate::domain::DocumentFormat;

pub struct PlaintextExtractor;

impl Extractor for PlaintextExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Plaintext
    }

    fn extract(&self, src: &SourceFile<'_>) -> Result<Extraction, ExtractFailure> {
        if src.bytes.contains(&0) {
            return Err(ExtractFailure::new(
                FailureReason::UnsupportedFormat,
                "binary content is not plain text",
            ));
        }
        let text = std::str::from_utf8(src.bytes).map_err(|e| {
            ExtractFailure::new(FailureReason::CorruptFile, format!("invalid UTF-8: {e}"))
        })?;
        Ok(Extraction {
            text: text.to_string(),
            ..Extraction::default()
        })
    }
}
