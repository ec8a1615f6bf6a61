//! Random-hyperplane LSH for cosine similarity.
//!
//! Hyperplanes come from a fixed-seed generator, so two indexes built over the
//! same vectors always hash identically. Lookups probe the exact bucket plus
//! every bucket one bit away in each table.

use std::collections::{BTreeMap, BTreeSet};

const TABLES: usize = 6;
const BITS: usize = 10;
const SEED: u64 = 0x5EED_E71D_E7CE_0001;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Uniform in [-1, 1).
fn next_unit(state: &mut u64) -> f32 {
    let bits = splitmix64(state) >> 40;
    (bits as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

#[derive(Debug, Clone)]
struct Table {
    planes: Vec<Vec<f32>>,
    buckets: BTreeMap<u32, BTreeSet<String>>,
}

impl Table {
    fn signature(&self, v: &[f32]) -> u32 {
        let mut sig = 0u32;
        for (bit, plane) in self.planes.iter().enumerate() {
            let dot: f32 = plane.iter().zip(v.iter()).map(|(p, x)| p * x).sum();
            if dot >= 0.0 {
                sig |= 1 << bit;
            }
        }
        sig
    }
}

#[derive(Debug, Clone)]
pub struct LshIndex {
    dims: usize,
    tables: Vec<Table>,
    signatures: BTreeMap<String, Vec<u32>>,
}

impl LshIndex {
    pub fn new(dims: usize) -> Self {
        let mut state = SEED ^ dims as u64;
        let tables = (0..TABLES)
            .map(|_| Table {
                planes: (0..BITS)
                    .map(|_| (0..dims).map(|_| next_unit(&mut state)).collect())
                    .collect(),
                buckets: BTreeMap::new(),
            })
            .collect();
        Self {
            dims,
            tables,
            signatures: BTreeMap::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn insert(&mut self, id: &str, v: &[f32]) {
        self.remove(id);
        let sigs: Vec<u32> = self.tables.iter().map(|t| t.signature(v)).collect();
        for (table, sig) in self.tables.iter_mut().zip(sigs.iter()) {
            table
                .buckets
                .entry(*sig)
                .or_default()
                .insert(id.to_string());
        }
        self.signatures.insert(id.to_string(), sigs);
    }

    pub fn remove(&mut self, id: &str) {
        let Some(sigs) = self.signatures.remove(id) else {
            return;
        };
        for (table, sig) in self.tables.iter_mut().zip(sigs) {
            if let Some(bucket) = table.buckets.get_mut(&sig) {
                bucket.remove(id);
                if bucket.is_empty() {
                    table.buckets.remove(&sig);
                }
            }
        }
    }

    /// Ids sharing a bucket with `q`, or one bit away from it, in any table.
    pub fn candidates(&self, q: &[f32]) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for table in &self.tables {
            let sig = table.signature(q);
            let probes = std::iter::once(sig).chain((0..BITS).map(|b| sig ^ (1 << b)));
            for probe in probes {
                if let Some(bucket) = table.buckets.get(&probe) {
                    out.extend(bucket.iter().cloned());
                }
            }
        }
        out
    }
}
