//! File discovery, extraction, and evidence creation.
//!
//! A batch is processed in path-ordered chunks. Within a chunk, files are read
//! and hashed in parallel, hashes already in the corpus resolve to their
//! existing items with a read-only lookup, and only new content is extracted
//! and stored (again in parallel). Commits then run one file at a time in path
//! order: each new item gets its identifier, evidence row, and full-text
//! postings in a single write transaction, so identifiers follow path order and
//! a rolled-back commit never consumes a number.

pub mod parties;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bates::BatesAllocator;
use crate::config::CaseConfig;
use crate::domain::{
    DateSource, DocumentFormat, EvidenceItem, FailedIngestion, SourcedDate,
};
use crate::error::{db_err, AppError};
use crate::extract::{ExtractFailure, Extraction, ExtractorSet, FailureReason, SourceFile};
use crate::fulltext;
use crate::normalize::dates::{
    date_from_system_time, find_control_number_date, find_filename_date, now_rfc3339_utc,
};
use crate::repo;
use crate::store::{sha256_hex, ContentStore};

/// Receives every newly created item after its commit.
pub trait IngestSink: Send + Sync {
    fn created(&self, item: &EvidenceItem);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestOutcome {
    pub item: EvidenceItem,
    /// False when the bytes were already in the corpus and the existing item was returned.
    pub created: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub outcomes: Vec<IngestOutcome>,
    pub failures: Vec<FailedIngestion>,
}

impl IngestReport {
    pub fn created_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.created).count()
    }

    pub fn existing_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.created).count()
    }
}

/// Result of ingesting a single file or byte stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestResult {
    Ingested(IngestOutcome),
    Failed(FailedIngestion),
}

struct Candidate {
    path: PathBuf,
    sha256: String,
    byte_len: u64,
    format: DocumentFormat,
    extraction: Extraction,
    modified: Option<time::Date>,
}

/// Files read and hashed per parallel round; bounds how many file bodies are held at once.
const CHUNK_FILES: usize = 64;

enum Prepared {
    Ready(Box<Candidate>),
    /// The hash was already in the corpus before extraction.
    Existing { path: PathBuf, sha256: String },
    Failed(FailedIngestion),
}

struct Loaded {
    path: PathBuf,
    bytes: Vec<u8>,
    sha256: String,
    modified: Option<time::Date>,
}

enum Staged {
    Loaded(Loaded),
    Done(Prepared),
}

fn failure(path: &Path, sha256: Option<String>, f: ExtractFailure) -> Prepared {
    Prepared::Failed(FailedIngestion {
        source_path: path.display().to_string(),
        sha256,
        reason_code: f.reason.code().to_string(),
        details: Some(f.details),
        recorded_at: now_rfc3339_utc(),
    })
}

/// Read-only lookup run before extraction; `commit` re-checks under the write lock.
fn existing(conn: &Connection, path: &Path, sha256: &str) -> Result<Option<Prepared>, AppError> {
    Ok(repo::find_by_hash(conn, sha256)?.map(|_| Prepared::Existing {
        path: path.to_path_buf(),
        sha256: sha256.to_string(),
    }))
}

fn in_pool<R: Send>(pool: Option<&ThreadPool>, op: impl FnOnce() -> R + Send) -> R {
    match pool {
        Some(p) => p.install(op),
        None => op(),
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Every candidate file under `root` (or `root` itself), sorted by path.
pub fn discover(root: &Path, include_hidden: bool) -> Result<Vec<PathBuf>, AppError> {
    let meta = fs::metadata(root).map_err(|e| {
        AppError::validation("INGEST_PATH_NOT_FOUND", "Ingestion path does not exist")
            .with_details(format!("path={}; err={}", root.display(), e))
    })?;
    if meta.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| {
            AppError::new("INGEST_DIR_READ_FAILED", "Failed to list ingestion directory")
                .with_details(format!("path={}; err={}", dir.display(), e))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                AppError::new("INGEST_DIR_READ_FAILED", "Failed to read directory entry")
                    .with_details(format!("path={}; err={}", dir.display(), e))
            })?;
            let path = entry.path();
            if !include_hidden && is_hidden(&path) {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| {
                AppError::new("INGEST_DIR_READ_FAILED", "Failed to stat directory entry")
                    .with_details(format!("path={}; err={}", path.display(), e))
            })?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

pub struct Ingestor {
    store: ContentStore,
    allocator: BatesAllocator,
    extractors: ExtractorSet,
    config: CaseConfig,
    sink: Option<Arc<dyn IngestSink>>,
}

impl Ingestor {
    pub fn new(
        store: ContentStore,
        allocator: BatesAllocator,
        extractors: ExtractorSet,
        config: CaseConfig,
    ) -> Self {
        Self {
            store,
            allocator,
            extractors,
            config,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn IngestSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Ingest a file or directory tree. Bad files are recorded and skipped;
    /// only structural failures (allocator, store, database) end the batch.
    pub fn ingest_path(&self, conn: &mut Connection, root: &Path) -> Result<IngestReport, AppError> {
        let paths = discover(root, self.config.ingest.include_hidden)?;
        info!(root = %root.display(), files = paths.len(), "ingest batch started");

        let pool = self.worker_pool()?;
        let mut report = IngestReport::default();
        for chunk in paths.chunks(CHUNK_FILES) {
            let prepared = self.prepare_chunk(conn, pool.as_ref(), chunk)?;
            for p in prepared {
                match self.commit(conn, p)? {
                    IngestResult::Ingested(outcome) => report.outcomes.push(outcome),
                    IngestResult::Failed(failed) => report.failures.push(failed),
                }
            }
        }

        info!(
            created = report.created_count(),
            existing = report.existing_count(),
            failed = report.failures.len(),
            "ingest batch finished"
        );
        Ok(report)
    }

    /// Ingest an in-memory byte stream recorded under `source_path`.
    pub fn ingest_bytes(
        &self,
        conn: &mut Connection,
        source_path: &Path,
        bytes: &[u8],
    ) -> Result<IngestResult, AppError> {
        let prepared = match self.oversize(source_path, bytes.len() as u64) {
            Some(failed) => failed,
            None => {
                let sha256 = sha256_hex(bytes);
                match existing(conn, source_path, &sha256)? {
                    Some(found) => found,
                    None => self.extract_and_store(source_path, bytes, sha256, None)?,
                }
            }
        };
        self.commit(conn, prepared)
    }

    fn worker_pool(&self) -> Result<Option<ThreadPool>, AppError> {
        let Some(n) = self.config.ingest.workers else {
            return Ok(None);
        };
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map(Some)
            .map_err(|e| {
                AppError::new("INGEST_POOL_FAILED", "Failed to start extraction workers")
                    .with_details(format!("workers={n}; err={e}"))
            })
    }

    fn prepare_chunk(
        &self,
        conn: &Connection,
        pool: Option<&ThreadPool>,
        paths: &[PathBuf],
    ) -> Result<Vec<Prepared>, AppError> {
        let staged: Vec<Staged> = in_pool(pool, || {
            paths.par_iter().map(|p| self.load_file(p)).collect()
        });

        let mut resolved = Vec::with_capacity(staged.len());
        for s in staged {
            resolved.push(match s {
                Staged::Loaded(l) => match existing(conn, &l.path, &l.sha256)? {
                    Some(found) => Staged::Done(found),
                    None => Staged::Loaded(l),
                },
                done => done,
            });
        }

        in_pool(pool, || {
            resolved
                .into_par_iter()
                .map(|s| match s {
                    Staged::Done(p) => Ok(p),
                    Staged::Loaded(l) => {
                        self.extract_and_store(&l.path, &l.bytes, l.sha256, l.modified)
                    }
                })
                .collect()
        })
    }

    fn oversize(&self, path: &Path, len: u64) -> Option<Prepared> {
        let max = self.config.ingest.max_file_bytes;
        (len > max).then(|| {
            failure(
                path,
                None,
                ExtractFailure::new(FailureReason::TooLarge, format!("size={len}; max={max}")),
            )
        })
    }

    fn load_file(&self, path: &Path) -> Staged {
        let read_failed = |e: std::io::Error| {
            Staged::Done(failure(
                path,
                None,
                ExtractFailure::new(FailureReason::ReadFailed, e.to_string()),
            ))
        };
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => return read_failed(e),
        };
        if let Some(failed) = self.oversize(path, meta.len()) {
            return Staged::Done(failed);
        }
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => return read_failed(e),
        };
        Staged::Loaded(Loaded {
            path: path.to_path_buf(),
            sha256: sha256_hex(&bytes),
            bytes,
            modified: meta.modified().ok().map(date_from_system_time),
        })
    }

    fn extract_and_store(
        &self,
        path: &Path,
        bytes: &[u8],
        sha256: String,
        modified: Option<time::Date>,
    ) -> Result<Prepared, AppError> {
        let (format, extraction) = match self.extractors.extract(&SourceFile { path, bytes }) {
            Ok(v) => v,
            Err(f) => return Ok(failure(path, Some(sha256), f)),
        };
        // Store failures are structural: the batch cannot keep its integrity guarantee.
        self.store.put(bytes)?;
        Ok(Prepared::Ready(Box::new(Candidate {
            path: path.to_path_buf(),
            sha256,
            byte_len: bytes.len() as u64,
            format,
            extraction,
            modified,
        })))
    }

    fn commit(&self, conn: &mut Connection, prepared: Prepared) -> Result<IngestResult, AppError> {
        let candidate = match prepared {
            Prepared::Ready(c) => c,
            Prepared::Existing { path, sha256 } => {
                // Evidence rows are never deleted, so a hash seen once stays resolvable.
                let item = repo::find_by_hash(conn, &sha256)?.ok_or_else(|| {
                    AppError::new("INGEST_EXISTING_MISSING", "Previously found evidence item vanished")
                        .with_details(format!("path={}; sha256={sha256}", path.display()))
                })?;
                debug!(bates = %item.bates_number, path = %path.display(), "content already ingested");
                return Ok(IngestResult::Ingested(IngestOutcome {
                    item,
                    created: false,
                }));
            }
            Prepared::Failed(failed) => {
                warn!(
                    path = %failed.source_path,
                    reason = %failed.reason_code,
                    "skipped file"
                );
                repo::record_failed_ingestion(conn, &failed)?;
                return Ok(IngestResult::Failed(failed));
            }
        };

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("DB_TX_FAILED", "Failed to start ingest transaction"))?;

        // The write lock is held from here on, so the hash check cannot race another writer.
        if let Some(existing) = repo::find_by_hash(&tx, &candidate.sha256)? {
            return Ok(IngestResult::Ingested(IngestOutcome {
                item: existing,
                created: false,
            }));
        }

        let number = self.allocator.allocate_in(&tx)?;
        let item = self.build_item(number.to_string(), &candidate);
        repo::insert_evidence(&tx, &number, &item)?;
        fulltext::index_item(&tx, &item.bates_number, &item.extracted_text)?;
        tx.commit()
            .map_err(db_err("DB_TX_FAILED", "Failed to commit evidence item"))?;

        info!(
            bates = %item.bates_number,
            path = %item.source_path,
            format = item.format.as_str(),
            "created evidence item"
        );
        if let Some(sink) = &self.sink {
            sink.created(&item);
        }
        Ok(IngestResult::Ingested(IngestOutcome {
            item,
            created: true,
        }))
    }

    fn build_item(&self, bates_number: String, c: &Candidate) -> EvidenceItem {
        let file_name = c
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = &c.extraction.text;

        let declared_date = find_control_number_date(text)
            .map(|date| SourcedDate {
                date,
                source: DateSource::ControlNumber,
            })
            .or_else(|| {
                find_filename_date(&file_name).map(|date| SourcedDate {
                    date,
                    source: DateSource::Filename,
                })
            })
            .or_else(|| {
                c.extraction.declared.map(|date| SourcedDate {
                    date,
                    source: DateSource::EmbeddedMetadata,
                })
            });
        let observed_date = c
            .extraction
            .observed
            .map(|date| SourcedDate {
                date,
                source: DateSource::ContainerMetadata,
            })
            .or_else(|| {
                c.modified.map(|date| SourcedDate {
                    date,
                    source: DateSource::Filesystem,
                })
            });

        EvidenceItem {
            bates_number,
            sha256: c.sha256.clone(),
            source_path: c.path.display().to_string(),
            format: c.format,
            byte_len: c.byte_len,
            extracted_text: text.clone(),
            declared_date,
            observed_date,
            party_tags: parties::infer_parties(
                &self.config,
                &c.path,
                text,
                &c.extraction.participants,
            ),
            category_tags: parties::infer_categories(&self.config, c.format, text),
            ingested_at: now_rfc3339_utc(),
        }
    }
}
