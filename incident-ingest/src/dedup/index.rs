//! Similarity indexes.
//!
//! The filter talks to an index through [`SimilarityIndex`] so the windowing
//! logic can be tested independently of the locality-sensitive structure.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use super::signature::SimilaritySignature;

/// A previously indexed key whose signature is within the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub key: String,
    pub similarity: f64,
}

pub trait SimilarityIndex: Send + Sync {
    /// Index `signature` under `key`, replacing any previous signature for it.
    fn insert(&mut self, key: &str, signature: &SimilaritySignature);

    /// Every indexed key whose estimated similarity is at least the threshold.
    fn query(&self, signature: &SimilaritySignature) -> Vec<Match>;

    /// Returns false if the key was not indexed.
    fn remove(&mut self, key: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Banded MinHash LSH.
    Lsh,
    /// Compare against every indexed signature.
    Exact,
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "lsh" => Ok(IndexKind::Lsh),
            "exact" => Ok(IndexKind::Exact),
            _ => Err(format!("Unknown dedup index: {s}, must be LSH or EXACT")),
        }
    }
}

pub fn build_index(kind: IndexKind, threshold: f64, num_perm: usize) -> Box<dyn SimilarityIndex> {
    match kind {
        IndexKind::Lsh => Box::new(LshIndex::new(threshold, num_perm)),
        IndexKind::Exact => Box::new(ExactIndex::new(threshold)),
    }
}

/// Linear scan. Useful as a reference and for small working sets.
#[derive(Debug, Default)]
pub struct ExactIndex {
    threshold: f64,
    signatures: HashMap<String, SimilaritySignature>,
}

impl ExactIndex {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            signatures: HashMap::new(),
        }
    }
}

impl SimilarityIndex for ExactIndex {
    fn insert(&mut self, key: &str, signature: &SimilaritySignature) {
        self.signatures.insert(key.to_string(), signature.clone());
    }

    fn query(&self, signature: &SimilaritySignature) -> Vec<Match> {
        self.signatures
            .iter()
            .filter_map(|(key, candidate)| {
                let similarity = candidate.jaccard(signature);
                (similarity >= self.threshold).then(|| Match {
                    key: key.clone(),
                    similarity,
                })
            })
            .collect()
    }

    fn remove(&mut self, key: &str) -> bool {
        self.signatures.remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.signatures.len()
    }
}

/// MinHash LSH: signatures are cut into `bands` of `rows` slots, and two
/// signatures become candidates when any band is identical. Candidates are
/// verified against the threshold before being reported.
#[derive(Debug)]
pub struct LshIndex {
    threshold: f64,
    bands: usize,
    rows: usize,
    tables: Vec<HashMap<Vec<u64>, HashSet<String>>>,
    signatures: HashMap<String, SimilaritySignature>,
}

impl LshIndex {
    pub fn new(threshold: f64, num_perm: usize) -> Self {
        let (bands, rows) = optimal_params(threshold, num_perm);
        Self::with_params(threshold, bands, rows)
    }

    pub fn with_params(threshold: f64, bands: usize, rows: usize) -> Self {
        Self {
            threshold,
            bands,
            rows,
            tables: (0..bands).map(|_| HashMap::new()).collect(),
            signatures: HashMap::new(),
        }
    }

    pub fn params(&self) -> (usize, usize) {
        (self.bands, self.rows)
    }

    fn band<'a>(&self, signature: &'a SimilaritySignature, band: usize) -> &'a [u64] {
        let values = signature.values();
        let start = (band * self.rows).min(values.len());
        let end = (start + self.rows).min(values.len());
        &values[start..end]
    }
}

impl SimilarityIndex for LshIndex {
    fn insert(&mut self, key: &str, signature: &SimilaritySignature) {
        self.remove(key);
        for band in 0..self.bands {
            let slice = self.band(signature, band).to_vec();
            self.tables[band]
                .entry(slice)
                .or_default()
                .insert(key.to_string());
        }
        self.signatures.insert(key.to_string(), signature.clone());
    }

    fn query(&self, signature: &SimilaritySignature) -> Vec<Match> {
        let mut candidates: HashSet<&String> = HashSet::new();
        for (band, table) in self.tables.iter().enumerate() {
            if let Some(keys) = table.get(self.band(signature, band)) {
                candidates.extend(keys.iter());
            }
        }

        candidates
            .into_iter()
            .filter_map(|key| {
                let similarity = self.signatures.get(key)?.jaccard(signature);
                (similarity >= self.threshold).then(|| Match {
                    key: key.clone(),
                    similarity,
                })
            })
            .collect()
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(signature) = self.signatures.remove(key) else {
            return false;
        };
        for band in 0..self.bands {
            let slice = self.band(&signature, band);
            if let Some(keys) = self.tables[band].get_mut(slice) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tables[band].remove(slice);
                }
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.signatures.len()
    }
}

/// Picks the (bands, rows) split of `num_perm` slots minimising the equally
/// weighted sum of false positive and false negative probability mass around
/// `threshold`.
pub fn optimal_params(threshold: f64, num_perm: usize) -> (usize, usize) {
    let num_perm = num_perm.max(1);
    let mut best = (1, num_perm);
    let mut min_error = f64::MAX;
    for bands in 1..=num_perm {
        for rows in 1..=(num_perm / bands) {
            let candidate = |s: f64| 1.0 - (1.0 - s.powi(rows as i32)).powi(bands as i32);
            let false_positive = integrate(&candidate, 0.0, threshold);
            let false_negative = integrate(|s| 1.0 - candidate(s), threshold, 1.0);
            let error = 0.5 * false_positive + 0.5 * false_negative;
            if error < min_error {
                min_error = error;
                best = (bands, rows);
            }
        }
    }
    best
}

fn integrate(f: impl Fn(f64) -> f64, from: f64, to: f64) -> f64 {
    const STEPS: usize = 200;
    if to <= from {
        return 0.0;
    }
    let step = (to - from) / STEPS as f64;
    (0..STEPS)
        .map(|i| f(from + (i as f64 + 0.5) * step) * step)
        .sum()
}
