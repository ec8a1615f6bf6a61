//! The natural-language boundary.
//!
//! A translator turns a free-text question into JSON. That JSON is accepted
//! only if it deserializes into the closed `QueryInput` grammar and then passes
//! the same validation as any other query. Nothing the translator returns is
//! executed any other way. When the translator itself is unreachable or times
//! out, the question falls back to a plain keyword query and the result says so.

use evd_core::error::{AppError, ErrorKind};
use evd_core::fulltext::MatchMode;
use tracing::{debug, warn};

use crate::llm::Llm;
use crate::query::{
    QueryInput, ReceivedQuery, ValidatedQuery, DEFAULT_KEYWORD_LIMIT, DEFAULT_SEMANTIC_K,
    MAX_KEYWORD_LIMIT, MAX_SEMANTIC_K,
};

/// Human- and model-readable description of the allowed query shapes.
pub struct QueryGrammar;

impl QueryGrammar {
    pub fn describe() -> String {
        format!(
            r#"Respond with exactly one JSON object in one of these shapes and nothing else:
{{"mode":"keyword","term":"<words>","match_mode":"exact|substring|stemmed","limit":<1-{MAX_KEYWORD_LIMIT}, default {DEFAULT_KEYWORD_LIMIT}>}}
{{"mode":"semantic","text":"<description>","k":<1-{MAX_SEMANTIC_K}, default {DEFAULT_SEMANTIC_K}>}}
{{"mode":"correlate","from":"YYYY-MM-DD","to":"YYYY-MM-DD","protected_category":"<category>","adverse_category":"<category>","window_days":<1-3650>}}
Optional fields may be omitted. A correlate query needs a date range, a category pair, or both. No other fields are allowed."#
        )
    }
}

pub trait QueryTranslator {
    fn translate(&self, question: &str, grammar: &str) -> Result<String, AppError>;
}

/// Translator backed by a local model.
pub struct LlmQueryTranslator<L: Llm> {
    llm: L,
    model: String,
}

impl<L: Llm> LlmQueryTranslator<L> {
    pub fn new(llm: L, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }
}

impl<L: Llm> QueryTranslator for LlmQueryTranslator<L> {
    fn translate(&self, question: &str, grammar: &str) -> Result<String, AppError> {
        let prompt = format!(
            "You translate questions about a case evidence corpus into structured queries.\n\n{grammar}\n\nQuestion: {question}\n"
        );
        self.llm.generate(&self.model, &prompt)
    }
}

/// Accept translator output only if it is one of the allowed query shapes.
///
/// A single surrounding Markdown code fence is tolerated; anything else that
/// is not a bare grammar object is rejected.
pub fn parse_translated_query(raw: &str) -> Result<ReceivedQuery, AppError> {
    let body = strip_code_fence(raw.trim());
    ReceivedQuery::from_json(body).map_err(|e| {
        warn!(code = %e.code, "translated query rejected");
        AppError::validation(
            "QUERY_OUT_OF_GRAMMAR",
            "Translated query is outside the allowed query grammar",
        )
        .with_details(e.details.unwrap_or_else(|| e.message.clone()))
    })
}

/// A validated query produced from a natural-language question.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedQuery {
    pub query: ValidatedQuery,
    /// True when the translator was unavailable and the question ran as keywords.
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

/// Translate, parse, and validate. The result is ready to execute.
///
/// Transient translator failures (timeouts, connection errors) fall back to a
/// stemmed keyword query over the question text. Output that is not in the
/// grammar is always rejected.
pub fn translate_and_validate(
    translator: &dyn QueryTranslator,
    question: &str,
) -> Result<TranslatedQuery, AppError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AppError::validation("QUERY_EMPTY", "Question is empty"));
    }
    let raw = match translator.translate(question, &QueryGrammar::describe()) {
        Ok(raw) => raw,
        Err(e) if e.kind == ErrorKind::Transient => {
            warn!(code = %e.code, "query translation unavailable, using keyword search");
            let query = ReceivedQuery::new(QueryInput::Keyword {
                term: question.to_string(),
                match_mode: MatchMode::Stemmed,
                limit: None,
            })
            .validate()?;
            return Ok(TranslatedQuery {
                query,
                degraded: true,
                degraded_reason: Some(e.code),
            });
        }
        Err(e) => return Err(e),
    };
    let received = parse_translated_query(&raw)?;
    debug!(mode = received.input().mode(), "translated query accepted");
    Ok(TranslatedQuery {
        query: received.validate()?,
        degraded: false,
        degraded_reason: None,
    })
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return s;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_fenced_grammar_object() {
        let q = parse_translated_query("```json\n{\"mode\":\"semantic\",\"text\":\"late appeal\"}\n```")
            .unwrap();
        assert_eq!(
            q.input(),
            &QueryInput::Semantic {
                text: "late appeal".to_string(),
                k: None
            }
        );
    }

    #[test]
    fn rejects_anything_outside_the_grammar() {
        for raw in [
            "SELECT * FROM evidence_items",
            r#"{"mode":"keyword","term":"x","sql":"DROP TABLE evidence"}"#,
            r#"{"mode":"exec","cmd":"rm -rf /"}"#,
            r#"[{"mode":"keyword","term":"x"}]"#,
        ] {
            let err = parse_translated_query(raw).unwrap_err();
            assert_eq!(err.code, "QUERY_OUT_OF_GRAMMAR", "input: {raw}");
        }
    }

    #[test]
    fn grammar_lists_every_mode() {
        let g = QueryGrammar::describe();
        for mode in ["\"keyword\"", "\"semantic\"", "\"correlate\""] {
            assert!(g.contains(mode));
        }
    }
}
