//! Searchable index: the read-only structure produced by
//! [`crate::indexer::ParallelIndexer::finish`], exposing BM25 top-k search.
//! Postings are flattened into one term map at merge time — nothing about
//! querying requires the shard partitioning used during indexing to
//! survive, and a flat map is the simpler structure to query.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

use crate::document::DocLengths;
use crate::hash::{fnv1a, nonzero_hash, CHAR_LUT};
use crate::shard::PostingList;

/// BM25 parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

impl Bm25Params {
    pub fn idf(&self, num_docs: u32, df: u32) -> f32 {
        let n = num_docs as f32;
        let df = df as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    pub fn score(&self, tf: u16, df: u32, doc_len: u16, avgdl: f32, num_docs: u32) -> f32 {
        if avgdl <= 0.0 {
            return 0.0;
        }
        let tf = tf as f32;
        let idf = self.idf(num_docs, df);
        let norm = 1.0 - self.b + self.b * (doc_len as f32 / avgdl);
        idf * (tf * (self.k1 + 1.0)) / (tf + self.k1 * norm)
    }
}

/// A scored hit: doc-id plus BM25 score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub doc_id: u32,
    pub score: f32,
}

/// Wraps `f32` with a total order so scores can live in a `BinaryHeap`.
/// NaN never occurs here (every input to `Bm25Params::score` is finite).
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedFloat(f32);

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// The merged, immutable index: one term -> posting-list map, the global
/// doc-length vector, and the document count.
pub struct SearchableIndex {
    terms: FxHashMap<u64, PostingList>,
    doc_lengths: DocLengths,
    num_docs: u32,
}

impl SearchableIndex {
    pub fn empty() -> Self {
        Self {
            terms: FxHashMap::default(),
            doc_lengths: DocLengths::new(),
            num_docs: 0,
        }
    }

    pub fn from_parts(terms: FxHashMap<u64, PostingList>, doc_lengths: DocLengths, num_docs: u32) -> Self {
        Self {
            terms,
            doc_lengths,
            num_docs,
        }
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn doc_len(&self, doc_id: u32) -> Option<u16> {
        self.doc_lengths.get(doc_id)
    }

    pub fn avgdl(&self) -> f32 {
        if self.num_docs == 0 {
            0.0
        } else {
            self.doc_lengths.total() as f32 / self.num_docs as f32
        }
    }

    pub fn postings(&self, term_hash: u64) -> Option<&PostingList> {
        self.terms.get(&term_hash)
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Tokenize `query` with the same classifier/hash the indexer uses and
    /// score every document containing any query term with BM25, returning
    /// the top `k` by descending score (ties broken by ascending doc-id).
    pub fn search(&self, query: &str, k: usize, bm25: Bm25Params) -> Vec<Hit> {
        if k == 0 || self.num_docs == 0 {
            return Vec::new();
        }
        let avgdl = self.avgdl();
        let query_hashes = query_term_hashes(query);

        let mut scores: FxHashMap<u32, f32> = FxHashMap::default();
        for hash in query_hashes {
            let Some(pl) = self.terms.get(&hash) else { continue };
            let df = pl.len() as u32;
            if df == 0 {
                continue;
            }
            for (&doc_id, &freq) in pl.doc_ids.iter().zip(pl.freqs.iter()) {
                let Some(doc_len) = self.doc_len(doc_id) else { continue };
                let s = bm25.score(freq, df, doc_len, avgdl, self.num_docs);
                *scores.entry(doc_id).or_insert(0.0) += s;
            }
        }

        let mut heap: BinaryHeap<Reverse<(OrderedFloat, Reverse<u32>)>> = BinaryHeap::with_capacity(k + 1);
        for (doc_id, score) in scores {
            heap.push(Reverse((OrderedFloat(score), Reverse(doc_id))));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut hits: Vec<Hit> = heap
            .into_iter()
            .map(|Reverse((OrderedFloat(score), Reverse(doc_id)))| Hit { doc_id, score })
            .collect();
        hits.sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.doc_id.cmp(&b.doc_id))
        });
        hits
    }
}

/// Reuses the same ASCII classifier and FNV-1a hash as the indexer's
/// tokenizer so query terms route to the same hashes as indexed terms.
fn query_term_hashes(query: &str) -> Vec<u64> {
    let bytes = query.as_bytes();
    let mut hashes = Vec::new();
    let mut start: Option<usize> = None;
    let mut buf = [0u8; crate::tokenizer::MAX_TOKEN_LEN];
    let mut len = 0usize;

    let mut flush = |buf: &[u8], len: usize, hashes: &mut Vec<u64>| {
        if len >= crate::tokenizer::MIN_TOKEN_LEN {
            hashes.push(nonzero_hash(fnv1a(&buf[..len])));
        }
    };

    for &b in bytes {
        let folded = CHAR_LUT[b as usize];
        if folded == 0 {
            if start.is_some() {
                flush(&buf, len, &mut hashes);
            }
            start = None;
            len = 0;
        } else {
            if start.is_none() {
                start = Some(0);
            }
            if len < crate::tokenizer::MAX_TOKEN_LEN {
                buf[len] = folded;
                len += 1;
            } else {
                len += 1; // overflow past MAX_TOKEN_LEN: token will be dropped by flush
            }
        }
    }
    if start.is_some() {
        flush(&buf, len, &mut hashes);
    }
    hashes
}
