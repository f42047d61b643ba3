//! MinHash signatures over report text.

use std::collections::HashSet;
use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// 2^61 - 1, the modulus for the permutation family.
const MERSENNE_PRIME: u64 = (1 << 61) - 1;
/// Value of every slot in a signature built from no tokens.
const EMPTY_SLOT: u64 = u64::MAX;
const DEFAULT_SEED: u64 = 1;

/// Fixed-size sketch of a token set. The fraction of equal slots between two
/// signatures estimates the Jaccard similarity of the underlying sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilaritySignature {
    values: Vec<u64>,
}

impl SimilaritySignature {
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for the degenerate signature of empty text.
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| *v == EMPTY_SLOT)
    }

    pub fn jaccard(&self, other: &SimilaritySignature) -> f64 {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return 0.0;
        }
        let equal = self
            .values
            .iter()
            .zip(other.values.iter())
            .filter(|(a, b)| a == b)
            .count();
        equal as f64 / self.values.len() as f64
    }
}

/// Builds signatures with a fixed family of `num_perm` permutations. Two
/// hashers built with the same size and seed produce comparable signatures.
#[derive(Debug, Clone)]
pub struct MinHasher {
    permutations: Vec<(u64, u64)>,
}

impl MinHasher {
    pub fn new(num_perm: usize) -> Self {
        Self::with_seed(num_perm, DEFAULT_SEED)
    }

    pub fn with_seed(num_perm: usize, seed: u64) -> Self {
        let mut state = seed;
        let permutations = (0..num_perm.max(1))
            .map(|_| {
                let a = splitmix64(&mut state) % (MERSENNE_PRIME - 1) + 1;
                let b = splitmix64(&mut state) % MERSENNE_PRIME;
                (a, b)
            })
            .collect();
        Self { permutations }
    }

    pub fn num_perm(&self) -> usize {
        self.permutations.len()
    }

    pub fn signature(&self, text: &str) -> SimilaritySignature {
        let mut values = vec![EMPTY_SLOT; self.permutations.len()];
        for token in tokenize(text) {
            let hv = token_hash(&token) % MERSENNE_PRIME;
            for (slot, (a, b)) in values.iter_mut().zip(self.permutations.iter()) {
                let permuted =
                    ((*a as u128 * hv as u128 + *b as u128) % MERSENNE_PRIME as u128) as u64;
                if permuted < *slot {
                    *slot = permuted;
                }
            }
        }
        SimilaritySignature { values }
    }
}

/// Lower-cased whitespace tokens with leading and trailing punctuation removed.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|raw| {
            raw.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

fn token_hash(token: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(token.as_bytes());
    hasher.finish()
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
