//! Inverted index over extracted text, stored in SQLite next to the evidence rows.
//!
//! Postings are keyed by identifier, so re-indexing an item replaces its entries.
//! Scores are TF-IDF: `sum(tf / doc_len * ln(1 + N / df))` over query terms.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{db_err, AppError};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    Substring,
    #[default]
    Stemmed,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Exact => "exact",
            MatchMode::Substring => "substring",
            MatchMode::Stemmed => "stemmed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub bates_number: String,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Light suffix stripping; enough to fold plurals and common verb endings.
pub fn stem(term: &str) -> String {
    let t = term.to_lowercase();
    let n = t.chars().count();
    let strip = |suffix: &str, min_len: usize, replacement: &str| -> Option<String> {
        (n >= min_len && t.ends_with(suffix))
            .then(|| format!("{}{}", &t[..t.len() - suffix.len()], replacement))
    };
    strip("ies", 5, "y")
        .or_else(|| strip("sses", 6, "ss"))
        .or_else(|| strip("ing", 6, ""))
        .or_else(|| strip("edly", 7, ""))
        .or_else(|| strip("ed", 5, ""))
        .or_else(|| strip("ly", 5, ""))
        .or_else(|| {
            (n >= 4 && t.ends_with('s') && !t.ends_with("ss") && !t.ends_with("us"))
                .then(|| t[..t.len() - 1].to_string())
        })
        .unwrap_or_else(|| t.clone())
}

/// Replace the postings for one identifier.
pub fn index_item(conn: &Connection, bates_number: &str, text: &str) -> Result<(), AppError> {
    remove_item(conn, bates_number)?;

    let tokens = tokenize(text);
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for t in &tokens {
        *counts.entry(t.as_str()).or_insert(0) += 1;
    }

    conn.execute(
        "INSERT INTO fulltext_docs(bates_number, token_count) VALUES (?1, ?2)",
        params![bates_number, tokens.len() as i64],
    )
    .map_err(|e| {
        AppError::new("INDEX_WRITE_FAILED", "Failed to write full-text document row")
            .with_details(format!("bates={bates_number}; err={e}"))
    })?;

    let mut stmt = conn
        .prepare("INSERT INTO fulltext_postings(bates_number, term, stem, tf) VALUES (?1, ?2, ?3, ?4)")
        .map_err(db_err("INDEX_WRITE_FAILED", "Failed to prepare posting insert"))?;
    for (term, tf) in counts {
        stmt.execute(params![bates_number, term, stem(term), tf])
            .map_err(|e| {
                AppError::new("INDEX_WRITE_FAILED", "Failed to write posting")
                    .with_details(format!("bates={bates_number}; term={term}; err={e}"))
            })?;
    }
    Ok(())
}

/// Drop an identifier from the index. The evidence row is untouched.
pub fn remove_item(conn: &Connection, bates_number: &str) -> Result<(), AppError> {
    conn.execute(
        "DELETE FROM fulltext_postings WHERE bates_number = ?1",
        [bates_number],
    )
    .map_err(db_err("INDEX_WRITE_FAILED", "Failed to remove postings"))?;
    conn.execute("DELETE FROM fulltext_docs WHERE bates_number = ?1", [bates_number])
        .map_err(db_err("INDEX_WRITE_FAILED", "Failed to remove document row"))?;
    Ok(())
}

pub fn document_count(conn: &Connection) -> Result<i64, AppError> {
    conn.query_row("SELECT COUNT(*) FROM fulltext_docs", [], |row| row.get(0))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to count indexed documents"))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// (bates, term, tf, token_count) postings matching one query term.
fn postings_for(
    conn: &Connection,
    term: &str,
    mode: MatchMode,
) -> Result<Vec<(String, String, i64, i64)>, AppError> {
    let (predicate, arg) = match mode {
        MatchMode::Exact => ("p.term = ?1", term.to_string()),
        MatchMode::Stemmed => ("p.stem = ?1", stem(term)),
        MatchMode::Substring => (
            "p.term LIKE ?1 ESCAPE '\\'",
            format!("%{}%", escape_like(term)),
        ),
    };
    let sql = format!(
        r#"
        SELECT p.bates_number, p.term, p.tf, d.token_count
        FROM fulltext_postings p
        JOIN fulltext_docs d ON d.bates_number = p.bates_number
        WHERE {predicate}
        ORDER BY p.bates_number, p.term
        "#
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare posting lookup"))?;
    let rows = stmt
        .query_map([arg], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query postings"))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode posting row"))?);
    }
    Ok(out)
}

/// Rank indexed items for `query`. Ties are broken by identifier, ascending.
pub fn search(
    conn: &Connection,
    query: &str,
    mode: MatchMode,
    limit: usize,
) -> Result<Vec<SearchHit>, AppError> {
    let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
    if terms.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let n_docs = document_count(conn)? as f64;

    let mut scores: BTreeMap<String, (f64, BTreeSet<String>)> = BTreeMap::new();
    for term in &terms {
        let postings = postings_for(conn, term, mode)?;
        let mut per_doc: BTreeMap<&str, (i64, i64, Vec<&str>)> = BTreeMap::new();
        for (bates, matched, tf, len) in &postings {
            let e = per_doc.entry(bates.as_str()).or_insert((0, *len, Vec::new()));
            e.0 += tf;
            e.2.push(matched.as_str());
        }
        if per_doc.is_empty() {
            continue;
        }
        let idf = (1.0 + n_docs / per_doc.len() as f64).ln();
        for (bates, (tf, len, matched)) in per_doc {
            let weight = if len > 0 { tf as f64 / len as f64 } else { 0.0 };
            let e = scores
                .entry(bates.to_string())
                .or_insert((0.0, BTreeSet::new()));
            e.0 += weight * idf;
            e.1.extend(matched.into_iter().map(str::to_string));
        }
    }

    let mut hits: Vec<SearchHit> = scores
        .into_iter()
        .map(|(bates_number, (score, matched))| SearchHit {
            bates_number,
            score,
            matched_terms: matched.into_iter().collect(),
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.bates_number.cmp(&b.bates_number))
    });
    hits.truncate(limit);
    Ok(hits)
}

/// Clear the index and rebuild it from the evidence rows alone.
pub fn rebuild(conn: &mut Connection) -> Result<usize, AppError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("DB_TX_FAILED", "Failed to start index rebuild"))?;
    tx.execute("DELETE FROM fulltext_postings", [])
        .map_err(db_err("INDEX_WRITE_FAILED", "Failed to clear postings"))?;
    tx.execute("DELETE FROM fulltext_docs", [])
        .map_err(db_err("INDEX_WRITE_FAILED", "Failed to clear document rows"))?;

    let items: Vec<(String, String)> = {
        let mut stmt = tx
            .prepare("SELECT bates_number, extracted_text FROM evidence_items ORDER BY bates_prefix, bates_seq")
            .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare evidence scan"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err("DB_QUERY_FAILED", "Failed to scan evidence text"))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode evidence text"))?);
        }
        out
    };
    for (bates, text) in &items {
        index_item(&tx, bates, text)?;
    }
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit index rebuild"))?;
    info!(documents = items.len(), "rebuilt full-text index");
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use pretty_assertions::assert_eq;

    fn indexed(docs: &[(&str, &str)]) -> Connection {
        let mut conn = db::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();
        for (bates, text) in docs {
            index_item(&conn, bates, text).unwrap();
        }
        conn
    }

    #[test]
    fn stems_common_suffixes() {
        assert_eq!(stem("denials"), "denial");
        assert_eq!(stem("denied"), "deni");
        assert_eq!(stem("policies"), "policy");
        assert_eq!(stem("reviewing"), "review");
        assert_eq!(stem("status"), "status");
        assert_eq!(stem("glass"), "glass");
    }

    #[test]
    fn unique_term_ranks_its_document_first() {
        let conn = indexed(&[
            ("EVD-000001", "claim received and acknowledged"),
            ("EVD-000002", "claim denied after review; retaliation suspected"),
            ("EVD-000003", "claim review scheduled"),
        ]);
        let hits = search(&conn, "retaliation", MatchMode::Stemmed, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bates_number, "EVD-000002");
    }

    #[test]
    fn modes_and_tie_break() {
        let conn = indexed(&[
            ("EVD-000002", "reviews pending"),
            ("EVD-000001", "reviews pending"),
            ("EVD-000003", "preview copy"),
        ]);
        let exact = search(&conn, "review", MatchMode::Exact, 10).unwrap();
        assert!(exact.is_empty());

        let stemmed = search(&conn, "review", MatchMode::Stemmed, 10).unwrap();
        let ids: Vec<&str> = stemmed.iter().map(|h| h.bates_number.as_str()).collect();
        assert_eq!(ids, vec!["EVD-000001", "EVD-000002"]);

        let sub = search(&conn, "review", MatchMode::Substring, 10).unwrap();
        assert_eq!(sub.len(), 3);
        assert_eq!(search(&conn, "100%", MatchMode::Substring, 10).unwrap().len(), 0);
    }

    #[test]
    fn reindex_replaces_entries() {
        let conn = indexed(&[("EVD-000001", "alpha beta")]);
        index_item(&conn, "EVD-000001", "gamma").unwrap();
        assert!(search(&conn, "alpha", MatchMode::Exact, 10).unwrap().is_empty());
        assert_eq!(search(&conn, "gamma", MatchMode::Exact, 10).unwrap().len(), 1);
        remove_item(&conn, "EVD-000001").unwrap();
        assert_eq!(document_count(&conn).unwrap(), 0);
    }
}
