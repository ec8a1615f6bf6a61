//! Read-only query modes and the request lifecycle.
//!
//! A request moves `ReceivedQuery -> ValidatedQuery -> ExecutedQuery ->
//! QueryResponse`. Only a `ValidatedQuery` can be executed, and execution has
//! no write path to any index or record.

mod engine;

use evd_core::error::AppError;
use evd_core::fulltext::{tokenize, MatchMode};
use evd_core::timeline::{CorrelationRequest, CorrelationResult};
use serde::{Deserialize, Serialize};
use time::Date;

pub use engine::QueryEngine;

pub const MAX_QUERY_CHARS: usize = 1000;
pub const DEFAULT_KEYWORD_LIMIT: usize = 20;
pub const MAX_KEYWORD_LIMIT: usize = 100;
pub const DEFAULT_SEMANTIC_K: usize = 10;
pub const MAX_SEMANTIC_K: usize = 50;

/// The closed query grammar. Anything that does not deserialize into one of
/// these shapes is rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum QueryInput {
    Keyword {
        term: String,
        #[serde(default)]
        match_mode: MatchMode,
        #[serde(default)]
        limit: Option<usize>,
    },
    Semantic {
        text: String,
        #[serde(default)]
        k: Option<usize>,
    },
    Correlate {
        #[serde(default)]
        from: Option<Date>,
        #[serde(default)]
        to: Option<Date>,
        #[serde(default)]
        protected_category: Option<String>,
        #[serde(default)]
        adverse_category: Option<String>,
        #[serde(default)]
        window_days: Option<u32>,
    },
}

impl QueryInput {
    pub fn mode(&self) -> &'static str {
        match self {
            QueryInput::Keyword { .. } => "keyword",
            QueryInput::Semantic { .. } => "semantic",
            QueryInput::Correlate { .. } => "correlate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedResult {
    pub rank: usize,
    pub bates_number: String,
    pub score: f64,
    pub snippet: String,
    pub matched_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticResults {
    pub results: Vec<RankedResult>,
    /// True when the embedding step failed and keyword search answered instead.
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueryResponse {
    Keyword { results: Vec<RankedResult> },
    Semantic(SemanticResults),
    Correlate(CorrelationResult),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueryPlan {
    Keyword {
        term: String,
        mode: MatchMode,
        limit: usize,
    },
    Semantic {
        text: String,
        k: usize,
    },
    Correlate(CorrelationRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedQuery {
    input: QueryInput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    plan: QueryPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedQuery {
    response: QueryResponse,
}

impl ReceivedQuery {
    pub fn new(input: QueryInput) -> Self {
        Self { input }
    }

    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let input: QueryInput = serde_json::from_str(json).map_err(|e| {
            AppError::validation("QUERY_MALFORMED", "Query does not match any allowed shape")
                .with_details(format!("query={}; err={}", truncate_for_details(json), e))
        })?;
        Ok(Self::new(input))
    }

    pub fn input(&self) -> &QueryInput {
        &self.input
    }

    pub fn validate(self) -> Result<ValidatedQuery, AppError> {
        let plan = match self.input {
            QueryInput::Keyword {
                term,
                match_mode,
                limit,
            } => {
                let term = validate_text(&term)?;
                let limit = validate_limit(limit, DEFAULT_KEYWORD_LIMIT, MAX_KEYWORD_LIMIT, "limit")?;
                QueryPlan::Keyword {
                    term,
                    mode: match_mode,
                    limit,
                }
            }
            QueryInput::Semantic { text, k } => {
                let text = validate_text(&text)?;
                let k = validate_limit(k, DEFAULT_SEMANTIC_K, MAX_SEMANTIC_K, "k")?;
                QueryPlan::Semantic { text, k }
            }
            QueryInput::Correlate {
                from,
                to,
                protected_category,
                adverse_category,
                window_days,
            } => {
                let req = CorrelationRequest {
                    from,
                    to,
                    protected_category,
                    adverse_category,
                    window_days,
                };
                req.validate()?;
                QueryPlan::Correlate(req)
            }
        };
        Ok(ValidatedQuery { plan })
    }
}

impl ValidatedQuery {
    pub(crate) fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn execute(self, engine: &QueryEngine<'_>) -> Result<ExecutedQuery, AppError> {
        let response = engine.execute_plan(self.plan)?;
        Ok(ExecutedQuery { response })
    }
}

impl ExecutedQuery {
    pub fn response(&self) -> &QueryResponse {
        &self.response
    }

    pub fn into_response(self) -> QueryResponse {
        self.response
    }
}

fn validate_text(raw: &str) -> Result<String, AppError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(AppError::validation("QUERY_EMPTY", "Query text is empty"));
    }
    let chars = text.chars().count();
    if chars > MAX_QUERY_CHARS {
        return Err(AppError::validation("QUERY_TOO_LONG", "Query text is too long")
            .with_details(format!("chars={chars}; max={MAX_QUERY_CHARS}")));
    }
    if tokenize(text).is_empty() {
        return Err(AppError::validation("QUERY_EMPTY", "Query has no searchable terms")
            .with_details(format!("query={text}")));
    }
    Ok(text.to_string())
}

fn validate_limit(
    requested: Option<usize>,
    default: usize,
    max: usize,
    field: &str,
) -> Result<usize, AppError> {
    match requested {
        None => Ok(default),
        Some(n) if (1..=max).contains(&n) => Ok(n),
        Some(n) => Err(AppError::validation(
            "QUERY_LIMIT_INVALID",
            "Result limit is out of range",
        )
        .with_details(format!("{field}={n}; max={max}"))),
    }
}

fn truncate_for_details(s: &str) -> String {
    const MAX: usize = 200;
    if s.chars().count() <= MAX {
        return s.to_string();
    }
    let cut: String = s.chars().take(MAX).collect();
    format!("{cut}...")
}
