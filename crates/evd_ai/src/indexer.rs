//! Keeps the full-text and vector indexes in step with the evidence rows.
//!
//! Full-text updates are synchronous. Semantic updates call the embedder with
//! a deadline and, on any failure, park the identifier in `semantic_pending`
//! for `retry_pending`. No lock or transaction is held across an embed call.

use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use evd_core::config::SemanticConfig;
use evd_core::db::{Connection, TransactionBehavior};
use evd_core::domain::EvidenceItem;
use evd_core::error::AppError;
use evd_core::fulltext;
use evd_core::ingest::IngestSink;
use evd_core::normalize::dates::now_rfc3339_utc;
use evd_core::repo;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::embeddings::{embed_with_timeout, Embedder};
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SemanticState {
    Indexed,
    Unchanged,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingEmbedding {
    pub bates_number: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub queued_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySummary {
    pub indexed: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebuildSummary {
    pub fulltext_documents: usize,
    pub embedded: usize,
    pub unchanged: usize,
    pub queued: usize,
    pub removed_stale: usize,
}

fn db_error<E: std::fmt::Display>(code: &'static str, message: &'static str) -> impl FnOnce(E) -> AppError {
    move |e| AppError::new(code, message).with_details(e.to_string())
}

pub struct IndexBuilder {
    vectors: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    model: String,
    timeout: Duration,
}

impl IndexBuilder {
    pub fn new(vectors: Arc<VectorIndex>, embedder: Arc<dyn Embedder>, cfg: &SemanticConfig) -> Self {
        Self {
            vectors,
            embedder,
            model: cfg.model.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }

    pub fn vectors(&self) -> &Arc<VectorIndex> {
        &self.vectors
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    /// Re-index one item in both indexes. Idempotent.
    ///
    /// The full-text write always lands before this returns. The semantic write
    /// may come back `Queued` when the embedder is slow or down.
    pub fn index_item(&self, conn: &mut Connection, bates_number: &str) -> Result<SemanticState, AppError> {
        let item = repo::get_evidence(conn, bates_number)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error("DB_TX_FAILED", "Failed to start index transaction"))?;
        fulltext::index_item(&tx, &item.bates_number, &item.extracted_text)?;
        tx.commit()
            .map_err(db_error("DB_TX_FAILED", "Failed to commit index transaction"))?;

        self.index_semantic(conn, &item)
    }

    /// Drop an item from both indexes. The evidence row is untouched.
    pub fn remove_item(&self, conn: &mut Connection, bates_number: &str) -> Result<(), AppError> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error("DB_TX_FAILED", "Failed to start index transaction"))?;
        fulltext::remove_item(&tx, bates_number)?;
        tx.execute(
            "DELETE FROM semantic_pending WHERE bates_number = ?1",
            [bates_number],
        )
        .map_err(db_error("INDEX_WRITE_FAILED", "Failed to clear pending embedding"))?;
        tx.commit()
            .map_err(db_error("DB_TX_FAILED", "Failed to commit index transaction"))?;
        self.vectors.remove(bates_number)?;
        Ok(())
    }

    /// Embed one item unless its stored vector already matches its text.
    pub fn index_semantic(&self, conn: &Connection, item: &EvidenceItem) -> Result<SemanticState, AppError> {
        let hash = text_hash(&item.extracted_text);
        if self.vectors.text_hash(&item.bates_number)?.as_deref() == Some(hash.as_str()) {
            clear_pending(conn, &item.bates_number)?;
            return Ok(SemanticState::Unchanged);
        }

        let embedded = embed_with_timeout(
            self.embedder.clone(),
            &self.model,
            &item.extracted_text,
            self.timeout,
        )
        .and_then(|v| self.vectors.upsert(&item.bates_number, &hash, v));

        match embedded {
            Ok(()) => {
                clear_pending(conn, &item.bates_number)?;
                debug!(bates = %item.bates_number, "semantic index updated");
                Ok(SemanticState::Indexed)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(bates = %item.bates_number, code = %e.code, "embedding failed; queued for retry");
                queue_pending(conn, &item.bates_number, &e)?;
                Ok(SemanticState::Queued)
            }
        }
    }

    /// Try every queued identifier once, oldest first.
    pub fn retry_pending(&self, conn: &Connection) -> Result<RetrySummary, AppError> {
        let pending = self.pending(conn)?;
        let mut summary = RetrySummary::default();
        for p in pending {
            let item = match repo::get_evidence(conn, &p.bates_number) {
                Ok(item) => item,
                Err(e) if e.code == "EVIDENCE_NOT_FOUND" => {
                    clear_pending(conn, &p.bates_number)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.index_semantic(conn, &item)? {
                SemanticState::Queued => summary.still_pending += 1,
                SemanticState::Indexed | SemanticState::Unchanged => summary.indexed += 1,
            }
        }
        info!(indexed = summary.indexed, still_pending = summary.still_pending, "semantic retry finished");
        Ok(summary)
    }

    pub fn pending(&self, conn: &Connection) -> Result<Vec<PendingEmbedding>, AppError> {
        let mut stmt = conn
            .prepare(
                "SELECT bates_number, attempts, last_error, queued_at FROM semantic_pending ORDER BY queued_at, bates_number",
            )
            .map_err(db_error("DB_QUERY_FAILED", "Failed to prepare pending query"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PendingEmbedding {
                    bates_number: row.get(0)?,
                    attempts: row.get::<_, i64>(1)? as u32,
                    last_error: row.get(2)?,
                    queued_at: row.get(3)?,
                })
            })
            .map_err(db_error("DB_QUERY_FAILED", "Failed to read pending embeddings"))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(db_error("DB_QUERY_FAILED", "Failed to decode pending embedding"))?);
        }
        Ok(out)
    }

    /// Rebuild both indexes from the evidence rows alone.
    ///
    /// Full-text is cleared and rebuilt. Vectors whose text hash still matches
    /// are kept; vectors for identifiers with no evidence row are dropped.
    pub fn rebuild(&self, conn: &mut Connection) -> Result<RebuildSummary, AppError> {
        let mut summary = RebuildSummary {
            fulltext_documents: fulltext::rebuild(conn)?,
            ..RebuildSummary::default()
        };

        let items = repo::list_evidence(conn, &repo::EvidenceFilter::default())?;
        let live: std::collections::BTreeSet<&str> =
            items.iter().map(|i| i.bates_number.as_str()).collect();
        for id in self.vectors.ids()? {
            if !live.contains(id.as_str()) && self.vectors.remove(&id)? {
                summary.removed_stale += 1;
            }
        }

        for item in &items {
            match self.index_semantic(conn, item)? {
                SemanticState::Indexed => summary.embedded += 1,
                SemanticState::Unchanged => summary.unchanged += 1,
                SemanticState::Queued => summary.queued += 1,
            }
        }
        info!(
            documents = summary.fulltext_documents,
            embedded = summary.embedded,
            unchanged = summary.unchanged,
            queued = summary.queued,
            removed = summary.removed_stale,
            "index rebuild finished"
        );
        Ok(summary)
    }
}

/// Key for "has this text already been embedded".
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn queue_pending(conn: &Connection, bates_number: &str, err: &AppError) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO semantic_pending(bates_number, attempts, last_error, queued_at) VALUES (?1, 1, ?2, ?3)
         ON CONFLICT(bates_number) DO UPDATE SET attempts = attempts + 1, last_error = excluded.last_error",
        (bates_number, err.to_string(), now_rfc3339_utc()),
    )
    .map_err(|e| {
        AppError::new("INDEX_WRITE_FAILED", "Failed to queue pending embedding")
            .with_details(format!("bates={bates_number}; err={e}"))
    })?;
    Ok(())
}

fn clear_pending(conn: &Connection, bates_number: &str) -> Result<(), AppError> {
    conn.execute(
        "DELETE FROM semantic_pending WHERE bates_number = ?1",
        [bates_number],
    )
    .map_err(db_error("INDEX_WRITE_FAILED", "Failed to clear pending embedding"))?;
    Ok(())
}

/// Background semantic indexing fed by ingestion.
///
/// The worker owns its own database connection. `shutdown` drains everything
/// already submitted before returning.
pub struct SemanticWorker {
    sender: Mutex<Option<Sender<String>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SemanticWorker {
    pub fn spawn(builder: Arc<IndexBuilder>, db_path: &Path) -> Result<Self, AppError> {
        let conn = evd_core::db::open(db_path)?;
        let (tx, rx) = mpsc::channel::<String>();
        let handle = thread::Builder::new()
            .name("evd-semantic".to_string())
            .spawn(move || {
                for bates in rx {
                    let item = match repo::get_evidence(&conn, &bates) {
                        Ok(item) => item,
                        Err(e) => {
                            warn!(bates = %bates, code = %e.code, "semantic worker could not load item");
                            continue;
                        }
                    };
                    if let Err(e) = builder.index_semantic(&conn, &item) {
                        warn!(bates = %bates, code = %e.code, "semantic worker failed");
                    }
                }
                debug!("semantic worker stopped");
            })
            .map_err(|e| {
                AppError::new("SEMANTIC_WORKER_FAILED", "Failed to start semantic worker")
                    .with_details(e.to_string())
            })?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn submit(&self, bates_number: &str) -> Result<(), AppError> {
        let guard = self.sender.lock().map_err(|_| {
            AppError::new("SEMANTIC_WORKER_FAILED", "Semantic worker lock was poisoned")
        })?;
        let sender = guard.as_ref().ok_or_else(|| {
            AppError::new("SEMANTIC_WORKER_STOPPED", "Semantic worker has shut down")
                .with_details(format!("bates={bates_number}"))
        })?;
        sender.send(bates_number.to_string()).map_err(|_| {
            AppError::new("SEMANTIC_WORKER_STOPPED", "Semantic worker has shut down")
                .with_details(format!("bates={bates_number}"))
        })
    }

    /// Close the queue and wait for queued items to finish.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(h) = handle {
            if h.join().is_err() {
                warn!("semantic worker panicked");
            }
        }
    }
}

impl IngestSink for SemanticWorker {
    fn created(&self, item: &EvidenceItem) {
        if let Err(e) = self.submit(&item.bates_number) {
            warn!(bates = %item.bates_number, code = %e.code, "could not queue semantic indexing");
        }
    }
}

impl Drop for SemanticWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
