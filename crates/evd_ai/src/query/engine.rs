use std::sync::Arc;
use std::time::Duration;

use evd_core::config::{CaseConfig, CorrelationConfig, SemanticConfig};
use evd_core::db::Connection;
use evd_core::error::AppError;
use evd_core::fulltext::{self, MatchMode, SearchHit};
use evd_core::repo;
use evd_core::timeline::{self, CorrelationRequest, CorrelationResult};
use tracing::{debug, warn};

use super::{
    QueryInput, QueryPlan, QueryResponse, RankedResult, ReceivedQuery, SemanticResults,
    DEFAULT_KEYWORD_LIMIT,
};
use crate::embeddings::{embed_with_timeout, Embedder};
use crate::vector::VectorIndex;

const SNIPPET_CHARS: usize = 160;

/// Executes validated queries against a read connection and the vector index.
///
/// Holds no locks of its own; the vector index read lock is taken only after
/// the embedding call has returned.
pub struct QueryEngine<'a> {
    conn: &'a Connection,
    vectors: &'a VectorIndex,
    embedder: Arc<dyn Embedder>,
    semantic: SemanticConfig,
    correlation: CorrelationConfig,
}

impl<'a> QueryEngine<'a> {
    pub fn new(
        conn: &'a Connection,
        vectors: &'a VectorIndex,
        embedder: Arc<dyn Embedder>,
        cfg: &CaseConfig,
    ) -> Self {
        Self {
            conn,
            vectors,
            embedder,
            semantic: cfg.semantic.clone(),
            correlation: cfg.correlation.clone(),
        }
    }

    pub fn run(&self, input: QueryInput) -> Result<QueryResponse, AppError> {
        Ok(ReceivedQuery::new(input)
            .validate()?
            .execute(self)?
            .into_response())
    }

    pub fn run_json(&self, json: &str) -> Result<QueryResponse, AppError> {
        Ok(ReceivedQuery::from_json(json)?
            .validate()?
            .execute(self)?
            .into_response())
    }

    /// Stemmed keyword search with the default limit.
    pub fn search(&self, term: &str) -> Result<Vec<RankedResult>, AppError> {
        self.search_with(term, MatchMode::Stemmed, Some(DEFAULT_KEYWORD_LIMIT))
    }

    pub fn search_with(
        &self,
        term: &str,
        match_mode: MatchMode,
        limit: Option<usize>,
    ) -> Result<Vec<RankedResult>, AppError> {
        match self.run(QueryInput::Keyword {
            term: term.to_string(),
            match_mode,
            limit,
        })? {
            QueryResponse::Keyword { results } => Ok(results),
            other => Err(unexpected_response("keyword", &other)),
        }
    }

    pub fn semantic_search(&self, text: &str, k: usize) -> Result<SemanticResults, AppError> {
        match self.run(QueryInput::Semantic {
            text: text.to_string(),
            k: Some(k),
        })? {
            QueryResponse::Semantic(results) => Ok(results),
            other => Err(unexpected_response("semantic", &other)),
        }
    }

    pub fn correlate(&self, req: CorrelationRequest) -> Result<CorrelationResult, AppError> {
        match self.run(QueryInput::Correlate {
            from: req.from,
            to: req.to,
            protected_category: req.protected_category,
            adverse_category: req.adverse_category,
            window_days: req.window_days,
        })? {
            QueryResponse::Correlate(result) => Ok(result),
            other => Err(unexpected_response("correlate", &other)),
        }
    }

    pub(crate) fn execute_plan(&self, plan: QueryPlan) -> Result<QueryResponse, AppError> {
        match plan {
            QueryPlan::Keyword { term, mode, limit } => Ok(QueryResponse::Keyword {
                results: self.keyword(&term, mode, limit)?,
            }),
            QueryPlan::Semantic { text, k } => Ok(QueryResponse::Semantic(self.semantic(&text, k)?)),
            QueryPlan::Correlate(req) => Ok(QueryResponse::Correlate(timeline::correlate(
                self.conn,
                &req,
                &self.correlation,
            )?)),
        }
    }

    fn keyword(&self, term: &str, mode: MatchMode, limit: usize) -> Result<Vec<RankedResult>, AppError> {
        let hits = fulltext::search(self.conn, term, mode, limit)?;
        self.rank_keyword_hits(hits)
    }

    fn rank_keyword_hits(&self, hits: Vec<SearchHit>) -> Result<Vec<RankedResult>, AppError> {
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let item = repo::get_evidence(self.conn, &hit.bates_number)?;
            out.push(RankedResult {
                rank: out.len() + 1,
                snippet: snippet(&item.extracted_text, &hit.matched_terms),
                bates_number: hit.bates_number,
                score: hit.score,
                matched_terms: hit.matched_terms,
            });
        }
        Ok(out)
    }

    fn semantic(&self, text: &str, k: usize) -> Result<SemanticResults, AppError> {
        match self.nearest(text, k) {
            Ok(results) => Ok(SemanticResults {
                results,
                degraded: false,
                degraded_reason: None,
            }),
            Err(e) if e.is_fatal() && e.code != "VECTOR_DIMS_MISMATCH" => Err(e),
            Err(e) => {
                warn!(code = %e.code, query = %text, "semantic search degraded to keyword search");
                Ok(SemanticResults {
                    results: self.keyword(text, MatchMode::Stemmed, k)?,
                    degraded: true,
                    degraded_reason: Some(e.code),
                })
            }
        }
    }

    fn nearest(&self, text: &str, k: usize) -> Result<Vec<RankedResult>, AppError> {
        if self.vectors.is_empty()? {
            return Err(AppError::transient(
                "VECTOR_INDEX_EMPTY",
                "No items have been embedded yet",
            ));
        }
        let query = embed_with_timeout(
            self.embedder.clone(),
            &self.semantic.model,
            text,
            Duration::from_millis(self.semantic.timeout_ms),
        )?;
        let hits = self.vectors.nearest(&query, k)?;

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let item = match repo::get_evidence(self.conn, &hit.bates_number) {
                Ok(item) => item,
                Err(e) if e.code == "EVIDENCE_NOT_FOUND" => {
                    debug!(bates = %hit.bates_number, "vector without evidence row skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            out.push(RankedResult {
                rank: out.len() + 1,
                snippet: snippet(&item.extracted_text, &[]),
                bates_number: hit.bates_number,
                score: f64::from(hit.score),
                matched_terms: Vec::new(),
            });
        }
        Ok(out)
    }
}

fn unexpected_response(expected: &str, got: &QueryResponse) -> AppError {
    let got = match got {
        QueryResponse::Keyword { .. } => "keyword",
        QueryResponse::Semantic(_) => "semantic",
        QueryResponse::Correlate(_) => "correlate",
    };
    AppError::new("QUERY_INTERNAL", "Query returned an unexpected response shape")
        .with_details(format!("expected={expected}; got={got}"))
}

/// A short excerpt around the first matched term, or the start of the text.
fn snippet(text: &str, terms: &[String]) -> String {
    let lower = text.to_lowercase();
    let start = if lower.len() == text.len() {
        terms
            .iter()
            .filter_map(|t| lower.find(t.as_str()))
            .filter(|i| text.is_char_boundary(*i))
            .min()
            .unwrap_or(0)
    } else {
        // Lowercasing changed byte offsets.
        0
    };

    let prefix_chars = text[..start].chars().count();
    let skip = prefix_chars.saturating_sub(SNIPPET_CHARS / 4);
    let excerpt: String = text
        .chars()
        .skip(skip)
        .take(SNIPPET_CHARS)
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect();
    let mut out = excerpt.trim().to_string();
    if skip > 0 {
        out.insert_str(0, "...");
    }
    if skip + SNIPPET_CHARS < text.chars().count() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_centers_on_first_match() {
        let text = format!("{} retaliation memo follows", "filler ".repeat(40));
        let s = snippet(&text, &["retaliation".to_string()]);
        assert!(s.starts_with("..."));
        assert!(s.contains("retaliation memo follows"));
    }

    #[test]
    fn snippet_without_terms_starts_at_beginning() {
        assert_eq!(snippet("Short\nnote", &[]), "Short note");
    }
}
