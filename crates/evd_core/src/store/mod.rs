use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{db_err, AppError};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file_hex(path: &Path) -> Result<(String, u64), AppError> {
    let mut f = fs::File::open(path).map_err(|e| {
        AppError::new("STORE_FILE_OPEN_FAILED", "Failed to open file for hashing")
            .with_details(format!("path={}; err={}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = f.read(&mut buf).map_err(|e| {
            AppError::new("STORE_FILE_READ_FAILED", "Failed to read file for hashing")
                .with_details(format!("path={}; err={}", path.display(), e))
        })?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), total))
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityMismatch {
    pub bates_number: String,
    pub expected_sha256: String,
    pub actual_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checked: usize,
    pub ok: Vec<String>,
    pub missing: Vec<String>,
    pub mismatched: Vec<IntegrityMismatch>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Content-addressed blob storage: `<root>/blobs/<first two hex chars>/<sha256>`.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn open(root: PathBuf) -> Result<Self, AppError> {
        let store = Self { root };
        fs::create_dir_all(store.blobs_dir()).map_err(|e| {
            AppError::new("STORE_UNAVAILABLE", "Failed to create content store directory")
                .with_details(format!("path={}; err={}", store.blobs_dir().display(), e))
        })?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn blob_path(&self, sha256: &str) -> Result<PathBuf, AppError> {
        if !is_sha256_hex(sha256) {
            return Err(AppError::validation("STORE_HASH_INVALID", "Not a SHA-256 hex digest")
                .with_details(format!("sha256={sha256}")));
        }
        Ok(self.blobs_dir().join(&sha256[..2]).join(sha256))
    }

    pub fn contains(&self, sha256: &str) -> Result<bool, AppError> {
        Ok(self.blob_path(sha256)?.exists())
    }

    /// Store bytes under their digest. Writing the same content twice is a no-op.
    pub fn put(&self, bytes: &[u8]) -> Result<String, AppError> {
        let sha = sha256_hex(bytes);
        let path = self.blob_path(&sha)?;
        if path.exists() {
            return Ok(sha);
        }
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.blobs_dir());
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::new("STORE_UNAVAILABLE", "Failed to create blob directory")
                .with_details(format!("path={}; err={}", dir.display(), e))
        })?;

        let tmp = dir.join(format!(
            "{sha}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, bytes).map_err(|e| {
            AppError::new("STORE_WRITE_FAILED", "Failed to write blob")
                .with_details(format!("path={}; err={}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            AppError::new("STORE_WRITE_FAILED", "Failed to finalize blob write")
                .with_details(format!("tmp={}; dest={}; err={}", tmp.display(), path.display(), e))
        })?;
        Ok(sha)
    }

    pub fn read(&self, sha256: &str) -> Result<Vec<u8>, AppError> {
        let path = self.blob_path(sha256)?;
        fs::read(&path).map_err(|e| {
            AppError::not_found("STORE_BLOB_NOT_FOUND", "Stored content not found")
                .with_details(format!("sha256={sha256}; err={e}"))
        })
    }

    /// Re-hash every stored blob and compare with the digest recorded at ingestion.
    pub fn verify(&self, conn: &Connection) -> Result<IntegrityReport, AppError> {
        let mut stmt = conn
            .prepare("SELECT bates_number, sha256 FROM evidence_items ORDER BY bates_prefix, bates_seq")
            .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare integrity scan"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err("DB_QUERY_FAILED", "Failed to scan evidence hashes"))?;

        let mut report = IntegrityReport {
            checked: 0,
            ok: Vec::new(),
            missing: Vec::new(),
            mismatched: Vec::new(),
        };
        for r in rows {
            let (bates, expected) =
                r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode evidence hash row"))?;
            report.checked += 1;
            let path = self.blob_path(&expected)?;
            if !path.exists() {
                warn!(bates = %bates, "stored blob missing");
                report.missing.push(bates);
                continue;
            }
            let (actual, _) = sha256_file_hex(&path)?;
            if actual == expected {
                report.ok.push(bates);
            } else {
                warn!(bates = %bates, expected = %expected, actual = %actual, "stored blob hash mismatch");
                report.mismatched.push(IntegrityMismatch {
                    bates_number: bates,
                    expected_sha256: expected,
                    actual_sha256: actual,
                });
            }
        }
        Ok(report)
    }
}
