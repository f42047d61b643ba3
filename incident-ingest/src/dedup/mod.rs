//! Near-duplicate detection over a sliding time window.
//!
//! The filter owns its index exclusively and is driven by a single sequential
//! consumer, so it needs no locking. Run one filter per partition; duplicates
//! that land on different partitions are not detected.

pub mod index;
pub mod signature;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::metrics_consts::DEDUP_INDEX_SIZE;

pub use index::{build_index, ExactIndex, IndexKind, LshIndex, Match, SimilarityIndex};
pub use signature::{MinHasher, SimilaritySignature};

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Minimum estimated Jaccard similarity for two reports to be duplicates.
    pub threshold: f64,
    /// How long an admitted report stays eligible for matching.
    pub window: Duration,
    /// Signature size.
    pub num_perm: usize,
    pub index: IndexKind,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            window: Duration::minutes(45),
            num_perm: 64,
            index: IndexKind::Lsh,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Admitted,
    /// The report matched `matched_key`, which was admitted earlier and is
    /// still inside the window.
    Rejected { matched_key: String, similarity: f64 },
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted)
    }
}

#[derive(Debug, Clone)]
pub struct DedupIndexEntry {
    pub key: String,
    pub signature: SimilaritySignature,
    pub admitted_at: DateTime<Utc>,
    seq: u64,
}

pub struct NearDuplicateFilter {
    window: Duration,
    hasher: MinHasher,
    index: Box<dyn SimilarityIndex>,
    entries: HashMap<String, DedupIndexEntry>,
    // admission order, for eviction. seq breaks ties between equal instants.
    timeline: BTreeMap<(DateTime<Utc>, u64), String>,
    next_seq: u64,
}

impl NearDuplicateFilter {
    pub fn new(config: &DedupConfig) -> Self {
        let index = build_index(config.index, config.threshold, config.num_perm);
        Self::with_index(config, index)
    }

    /// Build a filter around a caller-provided index.
    pub fn with_index(config: &DedupConfig, index: Box<dyn SimilarityIndex>) -> Self {
        Self {
            window: config.window,
            hasher: MinHasher::new(config.num_perm),
            index,
            entries: HashMap::new(),
            timeline: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Decide whether a report is new. Admitted reports are indexed; rejected
    /// ones are not, so a cluster stays anchored on its first report.
    pub fn evaluate(&mut self, key: &str, title: &str, body: &str, now: DateTime<Utc>) -> Verdict {
        self.evict_expired(now);

        let signature = self.hasher.signature(&format!("{title} {body}"));

        let verdict = match self.best_match(&signature) {
            Some(found) => {
                debug!(
                    key,
                    matched_key = %found.key,
                    similarity = found.similarity,
                    "rejected near-duplicate"
                );
                Verdict::Rejected {
                    matched_key: found.key,
                    similarity: found.similarity,
                }
            }
            None => {
                self.admit(key, signature, now);
                Verdict::Admitted
            }
        };

        metrics::gauge!(DEDUP_INDEX_SIZE).set(self.entries.len() as f64);
        verdict
    }

    /// Drop every entry admitted more than one window before `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let mut evicted = 0;
        while let Some(entry) = self.timeline.first_entry() {
            // entries exactly one window old are still eligible
            if entry.key().0 >= cutoff {
                break;
            }
            let key = entry.remove();
            self.entries.remove(&key);
            self.index.remove(&key);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "evicted dedup entries");
        }
        evicted
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &str) -> Option<&DedupIndexEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn best_match(&self, signature: &SimilaritySignature) -> Option<Match> {
        self.index.query(signature).into_iter().max_by(|a, b| {
            a.similarity.total_cmp(&b.similarity).then_with(|| {
                // prefer the earliest admission on ties
                let admitted =
                    |m: &Match| self.entries.get(&m.key).map(|e| (e.admitted_at, e.seq));
                admitted(b).cmp(&admitted(a))
            })
        })
    }

    fn admit(&mut self, key: &str, signature: SimilaritySignature, now: DateTime<Utc>) {
        if let Some(previous) = self.entries.remove(key) {
            self.timeline.remove(&(previous.admitted_at, previous.seq));
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        self.index.insert(key, &signature);
        self.timeline.insert((now, seq), key.to_string());
        self.entries.insert(
            key.to_string(),
            DedupIndexEntry {
                key: key.to_string(),
                signature,
                admitted_at: now,
                seq,
            },
        );
    }
}
