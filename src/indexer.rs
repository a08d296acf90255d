//! Parallel indexer: the two-phase fan-out/fan-in batch core. Phase 1
//! tokenizes and routes every document in a batch concurrently; phase 2
//! merges the routed postings into their owning shards, also concurrently,
//! one worker per contiguous range of shard ids. Flushing a full segment to
//! disk is decoupled from the batch call via a one-deep pipeline, so at
//! most one flush is ever in flight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::IndexerConfig;
use crate::document::DocLengths;
use crate::error::IndexError;
use crate::freq_table::FreqTable;
use crate::index::SearchableIndex;
use crate::segment::{self, FlushRequest, SegmentMeta};
use crate::shard::{shard_id_for_hash, ShardStore};
use crate::tokenizer::tokenize_into;

/// Rebuild a worker's `FreqTable` every this many documents, bounding how
/// far a single heavily-loaded table can drift from its ideal load factor.
const TABLE_REBUILD_INTERVAL: usize = 100;

/// One worker's phase 1 output: its slice's doc lengths (in original
/// order) and its contribution to every shard's scratch buffer.
struct WorkerOutput {
    lengths: Vec<u16>,
    shard_scratch: Vec<Vec<(u64, u32, u16)>>,
}

fn worker_range(total: usize, num_workers: usize, worker: usize) -> std::ops::Range<usize> {
    let base = total / num_workers;
    let rem = total % num_workers;
    let start = worker * base + worker.min(rem);
    let extra = if worker < rem { 1 } else { 0 };
    let end = start + base + extra;
    start..end
}

/// Pairs a submitted flush job with the worker thread that runs it. At most
/// one flush is in flight at a time: submitting a new job first blocks on
/// the previous job's result.
struct FlushPipeline {
    job_tx: crossbeam_channel::Sender<FlushRequest>,
    result_rx: crossbeam_channel::Receiver<Result<SegmentMeta, IndexError>>,
    worker: Option<JoinHandle<()>>,
    outstanding: bool,
}

impl FlushPipeline {
    fn new() -> Self {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<FlushRequest>(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let worker = std::thread::spawn(move || {
            while let Ok(req) = job_rx.recv() {
                let result = segment::flush_segment(req);
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });
        Self {
            job_tx,
            result_rx,
            worker: Some(worker),
            outstanding: false,
        }
    }

    /// Blocks until any previously submitted flush has completed (returning
    /// its result), then hands off `req` to the background worker.
    fn submit(&mut self, req: FlushRequest) -> Option<Result<SegmentMeta, IndexError>> {
        let prev = self.wait_outstanding();
        self.job_tx.send(req).expect("flush worker thread died unexpectedly");
        self.outstanding = true;
        prev
    }

    fn wait_outstanding(&mut self) -> Option<Result<SegmentMeta, IndexError>> {
        if !self.outstanding {
            return None;
        }
        self.outstanding = false;
        self.result_rx.recv().ok()
    }

    /// Waits for the last outstanding flush (if any) and shuts the worker
    /// thread down.
    fn finish(mut self) -> Option<Result<SegmentMeta, IndexError>> {
        let prev = self.wait_outstanding();
        drop(self.job_tx);
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
        prev
    }
}

/// The parallel indexing core. Accepts batches via
/// [`add_batch`](Self::add_batch) from a single orchestrating caller and
/// produces a [`SearchableIndex`] via [`finish`](Self::finish).
pub struct ParallelIndexer {
    config: IndexerConfig,
    pool: rayon::ThreadPool,
    shard_store: ShardStore,
    doc_lengths: Mutex<DocLengths>,
    doc_count: AtomicU64,
    total_length: AtomicU64,
    max_doc_id_seen: AtomicI64,
    docs_since_flush: AtomicU64,
    flushed_up_to: AtomicU64,
    next_segment_id: AtomicU32,
    segments: Mutex<Vec<SegmentMeta>>,
    flush_errors: Mutex<Vec<IndexError>>,
    flush_pipeline: Mutex<FlushPipeline>,
}

impl ParallelIndexer {
    pub fn new(config: IndexerConfig) -> Self {
        config.validate();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .thread_name(|i| format!("indexer-worker-{i}"))
            .build()
            .expect("failed to build indexer worker pool");

        Self {
            shard_store: ShardStore::new(config.num_shards),
            doc_lengths: Mutex::new(DocLengths::new()),
            doc_count: AtomicU64::new(0),
            total_length: AtomicU64::new(0),
            max_doc_id_seen: AtomicI64::new(-1),
            docs_since_flush: AtomicU64::new(0),
            flushed_up_to: AtomicU64::new(0),
            next_segment_id: AtomicU32::new(0),
            segments: Mutex::new(Vec::new()),
            flush_errors: Mutex::new(Vec::new()),
            flush_pipeline: Mutex::new(FlushPipeline::new()),
            pool,
            config,
        }
    }

    pub fn doc_count(&self) -> u64 {
        self.doc_count.load(Ordering::Relaxed)
    }

    pub fn out_dir(&self) -> &PathBuf {
        &self.config.out_dir
    }

    /// Index one batch: tokenize and route every document in parallel
    /// (phase 1), then merge each shard's contributions under its own lock,
    /// also in parallel (phase 2). Triggers an async segment flush if the
    /// configured doc-count or byte-size soft cap is exceeded afterward.
    ///
    /// `doc_ids` must be strictly greater than every doc-id seen in a prior
    /// call; violating this returns [`IndexError::InvalidInput`] without
    /// mutating any state.
    pub fn add_batch(&self, doc_ids: &[u32], texts: &[&str]) -> Result<(), IndexError> {
        if doc_ids.len() != texts.len() {
            return Err(IndexError::InvalidInput(format!(
                "doc_ids.len() ({}) != texts.len() ({})",
                doc_ids.len(),
                texts.len()
            )));
        }
        if doc_ids.is_empty() {
            return Ok(());
        }

        let batch_min = *doc_ids.iter().min().unwrap();
        let batch_max = *doc_ids.iter().max().unwrap();
        let prev_max = self.max_doc_id_seen.load(Ordering::Acquire);
        if prev_max >= 0 && batch_min as i64 <= prev_max {
            return Err(IndexError::InvalidInput(format!(
                "doc_id {batch_min} is not greater than the previously seen maximum {prev_max}"
            )));
        }

        let num_workers = self.config.num_workers;
        let num_shards = self.config.num_shards;
        let n = doc_ids.len();

        let worker_outputs: Vec<WorkerOutput> = self.pool.install(|| {
            (0..num_workers)
                .into_par_iter()
                .map(|w| {
                    let range = worker_range(n, num_workers, w);
                    let mut table = FreqTable::new(crate::freq_table::DEFAULT_CAPACITY);
                    let mut shard_scratch: Vec<Vec<(u64, u32, u16)>> =
                        (0..num_shards).map(|_| Vec::new()).collect();
                    let mut lengths = Vec::with_capacity(range.len());
                    let mut since_rebuild = 0usize;

                    for i in range {
                        let doc_len = tokenize_into(texts[i], &mut table);
                        lengths.push(doc_len);
                        for (hash, freq) in table.iter() {
                            let shard = shard_id_for_hash(hash, num_shards);
                            shard_scratch[shard].push((hash, doc_ids[i], freq));
                        }
                        since_rebuild += 1;
                        if since_rebuild >= TABLE_REBUILD_INTERVAL {
                            table = FreqTable::new(table.capacity());
                            since_rebuild = 0;
                        }
                    }

                    WorkerOutput { lengths, shard_scratch }
                })
                .collect()
        });

        // Phase 2: each worker owns a contiguous range of shard ids and
        // drains every phase-1 worker's scratch for those shards. Reads
        // only — disjoint shard ranges across workers, so no two workers
        // ever touch the same `shard_scratch[w][shard_id]` cell.
        self.pool.install(|| {
            (0..num_workers).into_par_iter().for_each(|w| {
                let range = worker_range(num_shards, num_workers, w);
                for shard_id in range {
                    let total: usize = worker_outputs
                        .iter()
                        .map(|out| out.shard_scratch[shard_id].len())
                        .sum();
                    if total == 0 {
                        continue;
                    }
                    let mut shard = self.shard_store.shards[shard_id].lock();
                    for out in &worker_outputs {
                        for &(hash, doc_id, freq) in &out.shard_scratch[shard_id] {
                            shard.add_posting(hash, doc_id, freq);
                        }
                    }
                }
            });
        });

        let mut batch_lengths = Vec::with_capacity(n);
        for out in &worker_outputs {
            batch_lengths.extend_from_slice(&out.lengths);
        }
        let batch_total_length: u64 = batch_lengths.iter().map(|&l| l as u64).sum();

        self.doc_count.fetch_add(n as u64, Ordering::Relaxed);
        self.total_length.fetch_add(batch_total_length, Ordering::Relaxed);
        self.max_doc_id_seen.store(batch_max as i64, Ordering::Release);
        {
            let mut lengths_guard = self.doc_lengths.lock();
            lengths_guard.extend_from_slice(&batch_lengths);
        }
        self.docs_since_flush.fetch_add(n as u64, Ordering::Relaxed);

        let live_bytes = self.shard_store.estimated_bytes();
        let docs_pending = self.docs_since_flush.load(Ordering::Relaxed) as usize;
        if docs_pending >= self.config.segment_docs || live_bytes >= self.config.segment_bytes {
            self.trigger_flush();
        }

        Ok(())
    }

    /// Swap every shard's map for an empty one and hand the drained data to
    /// the flush pipeline. Never fails directly — I/O errors are buffered
    /// and surfaced by [`finish`](Self::finish).
    fn trigger_flush(&self) {
        let doc_count = self.docs_since_flush.swap(0, Ordering::AcqRel);
        if doc_count == 0 {
            return;
        }
        let shards = self.shard_store.take_and_reset();
        let doc_start = self.flushed_up_to.fetch_add(doc_count, Ordering::AcqRel) as u32;
        let doc_count = doc_count as u32;

        let lengths = {
            let guard = self.doc_lengths.lock();
            let slice = guard.as_slice();
            slice[doc_start as usize..(doc_start + doc_count) as usize].to_vec()
        };

        let id = self.next_segment_id.fetch_add(1, Ordering::AcqRel);
        log::info!(
            "flushing segment {id}: docs [{doc_start}, {}), {} shards",
            doc_start + doc_count,
            shards.len()
        );

        let req = FlushRequest {
            id,
            out_dir: self.config.out_dir.clone(),
            shards,
            doc_start,
            doc_count,
            lengths,
        };

        let prev = self.flush_pipeline.lock().submit(req);
        self.record_flush_result(prev);
    }

    fn record_flush_result(&self, result: Option<Result<SegmentMeta, IndexError>>) {
        match result {
            None => {}
            Some(Ok(meta)) => {
                log::info!("segment {} flushed: {} docs, {} terms, {} bytes", meta.id, meta.num_docs, meta.num_terms, meta.bytes);
                self.segments.lock().push(meta);
            }
            Some(Err(e)) => {
                log::error!("segment flush failed: {e}");
                self.flush_errors.lock().push(e);
            }
        }
    }

    /// Flush any remaining unflushed documents, wait for every outstanding
    /// flush to complete, then run the streaming k-way merge and return the
    /// resulting [`SearchableIndex`]. Consumes the indexer — there is no
    /// further use for it once merged.
    pub fn finish(self) -> Result<SearchableIndex, IndexError> {
        if self.docs_since_flush.load(Ordering::Relaxed) > 0 {
            self.trigger_flush();
        }

        let pipeline = self.flush_pipeline.into_inner();
        let last = pipeline.finish();
        self.record_flush_result(last);

        let mut errors = self.flush_errors.into_inner();
        if !errors.is_empty() {
            let first = errors.remove(0);
            for e in &errors {
                log::error!("additional flush error surfaced at finish: {e}");
            }
            return Err(first);
        }

        let segments = self.segments.into_inner();
        segment::merge_segments(&self.pool, &segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Bm25Params;

    fn config(dir: &std::path::Path) -> IndexerConfig {
        let mut cfg = IndexerConfig::new(dir);
        cfg.num_workers = 2;
        cfg.num_shards = 4;
        cfg
    }

    #[test]
    fn single_batch_round_trips_through_search() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = ParallelIndexer::new(config(dir.path()));

        let texts = ["hello world", "world peace", "hello again"];
        let ids = [0u32, 1, 2];
        indexer.add_batch(&ids, &texts).unwrap();

        let index = indexer.finish().unwrap();
        assert_eq!(index.num_docs(), 3);

        let hits = index.search("hello", 10, Bm25Params::default());
        let doc_ids: Vec<u32> = hits.iter().map(|h| h.doc_id).collect();
        assert!(doc_ids.contains(&0));
        assert!(doc_ids.contains(&2));
        assert!(!doc_ids.contains(&1));
    }

    #[test]
    fn non_monotonic_doc_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = ParallelIndexer::new(config(dir.path()));
        indexer.add_batch(&[5, 6], &["a document", "another one"]).unwrap();
        let err = indexer.add_batch(&[3], &["too late"]).unwrap_err();
        assert!(matches!(err, IndexError::InvalidInput(_)));
    }

    #[test]
    fn segmentation_trigger_produces_equivalent_index_to_one_segment() {
        let texts: Vec<String> = (0..20).map(|i| format!("doc number {i} shared term")).collect();
        let text_refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        let ids: Vec<u32> = (0..20).collect();

        let dir_a = tempfile::tempdir().unwrap();
        let mut cfg_a = config(dir_a.path());
        cfg_a.segment_docs = 1_000_000; // never triggers: one segment total
        let indexer_a = ParallelIndexer::new(cfg_a);
        indexer_a.add_batch(&ids, &text_refs).unwrap();
        let index_a = indexer_a.finish().unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let mut cfg_b = config(dir_b.path());
        cfg_b.segment_docs = 5; // triggers multiple flushes within the batch loop
        let indexer_b = ParallelIndexer::new(cfg_b);
        for chunk_ids in ids.chunks(3) {
            let chunk_texts: Vec<&str> = chunk_ids.iter().map(|&id| text_refs[id as usize]).collect();
            indexer_b.add_batch(chunk_ids, &chunk_texts).unwrap();
        }
        let index_b = indexer_b.finish().unwrap();

        assert_eq!(index_a.num_docs(), index_b.num_docs());
        let shared_hash = crate::hash::nonzero_hash(crate::hash::fnv1a(b"shared"));
        let pl_a = index_a.postings(shared_hash).unwrap();
        let pl_b = index_b.postings(shared_hash).unwrap();
        assert_eq!(pl_a.doc_ids, pl_b.doc_ids);
        assert_eq!(pl_a.freqs, pl_b.freqs);
    }
}
