//! Persisted embedding vectors with approximate nearest-neighbor lookup.
//!
//! Vectors are stored as JSON under `<dir>/vectors.json` (tmp -> rename) and
//! tagged with the model that produced them. An index opened with a different
//! model starts empty. Each entry keeps the SHA-256 of the text it embeds so a
//! rebuild can skip unchanged items.

pub mod ann;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use evd_core::error::AppError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::similarity::{cosine_similarity, l2_norm};
use ann::LshIndex;

/// Below this many entries every lookup is an exact scan.
const EXACT_SCAN_LIMIT: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct VectorEntry {
    text_sha256: String,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct VectorFile {
    model: String,
    dims: Option<usize>,
    entries: BTreeMap<String, VectorEntry>,
}

struct State {
    file: VectorFile,
    norms: BTreeMap<String, f32>,
    lsh: Option<LshIndex>,
}

impl State {
    fn empty(model: &str) -> Self {
        Self {
            file: VectorFile {
                model: model.to_string(),
                dims: None,
                entries: BTreeMap::new(),
            },
            norms: BTreeMap::new(),
            lsh: None,
        }
    }

    fn from_file(file: VectorFile) -> Self {
        let mut norms = BTreeMap::new();
        let mut lsh = file.dims.map(LshIndex::new);
        for (id, e) in &file.entries {
            norms.insert(id.clone(), l2_norm(&e.vector));
            if let Some(l) = lsh.as_mut() {
                l.insert(id, &e.vector);
            }
        }
        Self { file, norms, lsh }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub bates_number: String,
    pub score: f32,
}

pub struct VectorIndex {
    path: PathBuf,
    state: RwLock<State>,
}

fn poisoned() -> AppError {
    AppError::new("VECTOR_INDEX_UNAVAILABLE", "Vector index lock was poisoned")
}

impl VectorIndex {
    pub fn open(dir: PathBuf, model: &str) -> Result<Self, AppError> {
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::new("VECTOR_INDEX_UNAVAILABLE", "Failed to create vector index directory")
                .with_details(format!("path={}; err={}", dir.display(), e))
        })?;
        let path = dir.join("vectors.json");
        let state = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| {
                AppError::new("VECTOR_INDEX_UNAVAILABLE", "Failed to read vector index")
                    .with_details(format!("path={}; err={}", path.display(), e))
            })?;
            let file: VectorFile = serde_json::from_slice(&bytes).map_err(|e| {
                AppError::new("VECTOR_INDEX_CORRUPT", "Failed to decode vector index")
                    .with_details(format!("path={}; err={}", path.display(), e))
            })?;
            if file.model == model {
                State::from_file(file)
            } else {
                info!(stored = %file.model, requested = %model, "embedding model changed; starting empty vector index");
                State::empty(model)
            }
        } else {
            State::empty(model)
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, AppError> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, AppError> {
        self.state.write().map_err(|_| poisoned())
    }

    fn persist(&self, file: &VectorFile) -> Result<(), AppError> {
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_string(file).map_err(|e| {
            AppError::new("VECTOR_INDEX_WRITE_FAILED", "Failed to encode vector index")
                .with_details(e.to_string())
        })?;
        fs::write(&tmp, json.as_bytes()).map_err(|e| {
            AppError::new("VECTOR_INDEX_WRITE_FAILED", "Failed to write vector index")
                .with_details(format!("path={}; err={}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            AppError::new("VECTOR_INDEX_WRITE_FAILED", "Failed to finalize vector index write")
                .with_details(format!(
                    "tmp={}; dest={}; err={}",
                    tmp.display(),
                    self.path.display(),
                    e
                ))
        })
    }

    pub fn model(&self) -> Result<String, AppError> {
        Ok(self.read()?.file.model.clone())
    }

    pub fn dims(&self) -> Result<Option<usize>, AppError> {
        Ok(self.read()?.file.dims)
    }

    pub fn len(&self) -> Result<usize, AppError> {
        Ok(self.read()?.file.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, AppError> {
        Ok(self.len()? == 0)
    }

    pub fn ids(&self) -> Result<Vec<String>, AppError> {
        Ok(self.read()?.file.entries.keys().cloned().collect())
    }

    /// Hash of the text the stored vector was computed from.
    pub fn text_hash(&self, bates_number: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .read()?
            .file
            .entries
            .get(bates_number)
            .map(|e| e.text_sha256.clone()))
    }

    /// Insert or replace the vector for one identifier.
    pub fn upsert(&self, bates_number: &str, text_sha256: &str, vector: Vec<f32>) -> Result<(), AppError> {
        let norm = l2_norm(&vector);
        if vector.is_empty() || norm == 0.0 || !norm.is_finite() {
            return Err(AppError::validation(
                "VECTOR_INVALID",
                "Embedding must be non-empty with a finite, non-zero norm",
            )
            .with_details(format!("bates={bates_number}")));
        }

        let mut st = self.write()?;
        let dims = st.file.dims;
        match dims {
            Some(d) if d != vector.len() => {
                return Err(AppError::new(
                    "VECTOR_DIMS_MISMATCH",
                    "Embedding dimension does not match the index",
                )
                .with_details(format!(
                    "bates={bates_number}; expected={d}; got={}",
                    vector.len()
                )));
            }
            Some(_) => {}
            None => {
                st.file.dims = Some(vector.len());
                st.lsh = Some(LshIndex::new(vector.len()));
            }
        }
        if let Some(l) = st.lsh.as_mut() {
            l.insert(bates_number, &vector);
        }
        st.norms.insert(bates_number.to_string(), norm);
        st.file.entries.insert(
            bates_number.to_string(),
            VectorEntry {
                text_sha256: text_sha256.to_string(),
                vector,
            },
        );
        self.persist(&st.file)?;
        debug!(bates = %bates_number, "stored embedding");
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, bates_number: &str) -> Result<bool, AppError> {
        let mut st = self.write()?;
        if st.file.entries.remove(bates_number).is_none() {
            return Ok(false);
        }
        st.norms.remove(bates_number);
        if let Some(l) = st.lsh.as_mut() {
            l.remove(bates_number);
        }
        self.persist(&st.file)?;
        Ok(true)
    }

    /// The `k` stored vectors most similar to `query`, best first, ties by identifier.
    ///
    /// Small indexes are scanned exactly. Larger ones score LSH candidates and
    /// fall back to a full scan when fewer than `k` candidates come back.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, AppError> {
        let st = self.read()?;
        let Some(dims) = st.file.dims else {
            return Ok(Vec::new());
        };
        if query.len() != dims {
            return Err(AppError::new(
                "VECTOR_DIMS_MISMATCH",
                "Query embedding dimension does not match the index",
            )
            .with_details(format!("expected={dims}; got={}", query.len())));
        }
        let qnorm = l2_norm(query);
        if qnorm == 0.0 {
            return Err(AppError::validation("VECTOR_INVALID", "Query embedding norm is zero"));
        }

        let candidates: Vec<String> = match st.lsh.as_ref() {
            Some(l) if st.file.entries.len() > EXACT_SCAN_LIMIT => {
                let c = l.candidates(query);
                if c.len() >= k {
                    c.into_iter().collect()
                } else {
                    st.file.entries.keys().cloned().collect()
                }
            }
            _ => st.file.entries.keys().cloned().collect(),
        };

        let mut hits: Vec<VectorHit> = candidates
            .into_iter()
            .filter_map(|id| {
                let e = st.file.entries.get(&id)?;
                let norm = st.norms.get(&id).copied().unwrap_or_else(|| l2_norm(&e.vector));
                Some(VectorHit {
                    score: cosine_similarity(query, &e.vector, qnorm, norm),
                    bates_number: id,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.bates_number.cmp(&b.bates_number))
        });
        hits.truncate(k);
        Ok(hits)
    }
}
