//! Segment builder + flush, and the final streaming k-way merge. Both sides
//! hand-roll little-endian framing with `BufWriter`/`BufReader` rather than
//! reaching for a serde derive — the wire format is part of the contract,
//! not an implementation detail.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::document::DocLengths;
use crate::error::IndexError;
use crate::index::SearchableIndex;
use crate::shard::{PostingList, ShardMap};

/// Metadata recorded about one flushed segment.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub id: u32,
    pub path: PathBuf,
    pub num_docs: u32,
    pub num_terms: u32,
    pub bytes: u64,
}

/// Everything one flush needs, handed over by the indexer when a
/// segmentation trigger fires. Owns the drained shards so the indexer's
/// allocator can release the old pages once this is built.
pub struct FlushRequest {
    pub id: u32,
    pub out_dir: PathBuf,
    pub shards: Vec<ShardMap>,
    pub doc_start: u32,
    pub doc_count: u32,
    pub lengths: Vec<u16>,
}

fn segment_path(out_dir: &Path, id: u32) -> PathBuf {
    out_dir.join(format!("segment-{:06}.seg", id))
}

/// Write one segment file in a single pass with no back-patching: postings
/// offsets are computed ahead of time since posting counts are already
/// known per term. Terms are written in ascending hash order.
fn write_segment(path: &Path, req: &FlushRequest) -> io::Result<(u32, u64)> {
    let mut terms: Vec<(u64, &PostingList)> = req
        .shards
        .iter()
        .flat_map(|shard| shard.terms.iter())
        .map(|(hash, pl)| (*hash, pl))
        .collect();
    terms.sort_unstable_by_key(|(hash, _)| *hash);

    let header_size: i64 = 12 + terms.len() as i64 * (2 + 8 + 4 + 8);
    let mut offset = header_size;
    let mut dict: Vec<(u64, u32, i64)> = Vec::with_capacity(terms.len());
    for (hash, pl) in &terms {
        let posting_count = pl.len() as u32;
        dict.push((*hash, posting_count, offset));
        offset += posting_count as i64 * (4 + 2);
    }

    let file = File::create(path)?;
    let mut w = BufWriter::with_capacity(1 << 20, file);

    w.write_all(&req.doc_count.to_le_bytes())?;
    w.write_all(&(terms.len() as u32).to_le_bytes())?;
    w.write_all(&req.doc_start.to_le_bytes())?;

    for (hash, count, off) in &dict {
        w.write_all(&8u16.to_le_bytes())?;
        w.write_all(&hash.to_le_bytes())?;
        w.write_all(&count.to_le_bytes())?;
        w.write_all(&off.to_le_bytes())?;
    }

    for (_, pl) in &terms {
        for (&doc_id, &freq) in pl.doc_ids.iter().zip(pl.freqs.iter()) {
            w.write_all(&doc_id.to_le_bytes())?;
            w.write_all(&freq.to_le_bytes())?;
        }
    }

    w.write_all(&(req.lengths.len() as u32).to_le_bytes())?;
    for (i, &len) in req.lengths.iter().enumerate() {
        let doc_id = req.doc_start + i as u32;
        w.write_all(&doc_id.to_le_bytes())?;
        w.write_all(&len.to_le_bytes())?;
    }

    w.flush()?;
    let bytes = w.get_ref().metadata().map(|m| m.len()).unwrap_or(0);
    Ok((terms.len() as u32, bytes))
}

/// Flush one segment to disk. On I/O failure the partial file is removed
/// and the in-memory shard/length data is dropped regardless — the data is
/// gone either way.
pub fn flush_segment(req: FlushRequest) -> Result<SegmentMeta, IndexError> {
    let path = segment_path(&req.out_dir, req.id);
    if let Err(e) = fs::create_dir_all(&req.out_dir) {
        return Err(IndexError::io(&req.out_dir, e));
    }

    match write_segment(&path, &req) {
        Ok((num_terms, bytes)) => Ok(SegmentMeta {
            id: req.id,
            path,
            num_docs: req.doc_count,
            num_terms,
            bytes,
        }),
        Err(e) => {
            let _ = fs::remove_file(&path);
            Err(IndexError::io(&path, e))
        }
    }
}

struct LoadedSegment {
    doc_start: u32,
    terms: Vec<(u64, PostingList)>,
    lengths: Vec<(u32, u16)>,
}

/// Read only the segment header + term dictionary, not the posting bytes —
/// used by the merger's first scan to size the final per-term vectors
/// without materializing every segment at once.
fn read_segment_header(path: &Path) -> Result<(u32, u32, u32, Vec<(u64, u32)>), IndexError> {
    let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
    let mut r = BufReader::with_capacity(1 << 20, file);

    let mut buf4 = [0u8; 4];
    let mut buf2 = [0u8; 2];
    let mut buf8 = [0u8; 8];

    r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
    let num_docs = u32::from_le_bytes(buf4);
    r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
    let num_terms = u32::from_le_bytes(buf4);
    r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
    let doc_start = u32::from_le_bytes(buf4);

    let mut dict = Vec::with_capacity(num_terms as usize);
    for _ in 0..num_terms {
        r.read_exact(&mut buf2).map_err(|e| IndexError::io(path, e))?;
        let term_len = u16::from_le_bytes(buf2);
        if term_len != 8 {
            return Err(IndexError::format(path, format!("unexpected term_len {}", term_len)));
        }
        r.read_exact(&mut buf8).map_err(|e| IndexError::io(path, e))?;
        let hash = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
        let posting_count = u32::from_le_bytes(buf4);
        r.read_exact(&mut buf8).map_err(|e| IndexError::io(path, e))?; // postings_offset, unused on sequential read
        dict.push((hash, posting_count));
    }

    Ok((num_docs, num_terms, doc_start, dict))
}

/// Read a full segment (header, term dictionary, all postings, and the doc
/// length section) sequentially. The on-disk `postings_offset` field is
/// informational only — segments are written and read in one pass, so no
/// seeking is required.
fn read_segment_full(path: &Path) -> Result<LoadedSegment, IndexError> {
    let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
    let mut r = BufReader::with_capacity(1 << 20, file);

    let mut buf4 = [0u8; 4];
    let mut buf2 = [0u8; 2];
    let mut buf8 = [0u8; 8];

    r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
    let _num_docs = u32::from_le_bytes(buf4);
    r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
    let num_terms = u32::from_le_bytes(buf4);
    r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
    let doc_start = u32::from_le_bytes(buf4);

    let mut dict = Vec::with_capacity(num_terms as usize);
    for _ in 0..num_terms {
        r.read_exact(&mut buf2).map_err(|e| IndexError::io(path, e))?;
        let term_len = u16::from_le_bytes(buf2);
        if term_len != 8 {
            return Err(IndexError::format(path, format!("unexpected term_len {}", term_len)));
        }
        r.read_exact(&mut buf8).map_err(|e| IndexError::io(path, e))?;
        let hash = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
        let posting_count = u32::from_le_bytes(buf4);
        r.read_exact(&mut buf8).map_err(|e| IndexError::io(path, e))?; // postings_offset
        dict.push((hash, posting_count));
    }

    let mut terms = Vec::with_capacity(dict.len());
    for (hash, posting_count) in dict {
        let mut pl = PostingList {
            doc_ids: Vec::with_capacity(posting_count as usize),
            freqs: Vec::with_capacity(posting_count as usize),
        };
        for _ in 0..posting_count {
            r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
            let doc_id = u32::from_le_bytes(buf4);
            r.read_exact(&mut buf2).map_err(|e| IndexError::io(path, e))?;
            let freq = u16::from_le_bytes(buf2);
            pl.doc_ids.push(doc_id);
            pl.freqs.push(freq);
        }
        terms.push((hash, pl));
    }

    r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
    let dl_count = u32::from_le_bytes(buf4);
    let mut lengths = Vec::with_capacity(dl_count as usize);
    for _ in 0..dl_count {
        r.read_exact(&mut buf4).map_err(|e| IndexError::io(path, e))?;
        let doc_id = u32::from_le_bytes(buf4);
        r.read_exact(&mut buf2).map_err(|e| IndexError::io(path, e))?;
        let len = u16::from_le_bytes(buf2);
        lengths.push((doc_id, len));
    }

    Ok(LoadedSegment {
        doc_start,
        terms,
        lengths,
    })
}

/// Stream all segments into one [`SearchableIndex`]:
/// 1. scan every segment's header to size each term's final posting
///    vector exactly and find the global max doc-id,
/// 2. load segments one at a time, append, then drop before the next,
/// 3. sort each term's postings by ascending doc-id, in parallel,
/// 4. delete the segment files.
///
/// On a [`IndexError::FormatError`] the remaining segment files are left in
/// place for operator inspection; on success every segment file named in
/// `segments` is removed.
pub fn merge_segments(
    pool: &rayon::ThreadPool,
    segments: &[SegmentMeta],
) -> Result<SearchableIndex, IndexError> {
    if segments.is_empty() {
        return Ok(SearchableIndex::empty());
    }

    let mut total_counts: FxHashMap<u64, u32> = FxHashMap::default();
    let mut max_doc_id: i64 = -1;
    for meta in segments {
        let (num_docs, _num_terms, doc_start, dict) = read_segment_header(&meta.path)?;
        for (hash, count) in dict {
            *total_counts.entry(hash).or_insert(0) += count;
        }
        if num_docs > 0 {
            max_doc_id = max_doc_id.max(doc_start as i64 + num_docs as i64 - 1);
        }
    }

    let mut terms: FxHashMap<u64, PostingList> = total_counts
        .into_iter()
        .map(|(hash, total)| {
            (
                hash,
                PostingList {
                    doc_ids: Vec::with_capacity(total as usize),
                    freqs: Vec::with_capacity(total as usize),
                },
            )
        })
        .collect();

    let mut doc_lengths = DocLengths::new();

    for meta in segments {
        let loaded = read_segment_full(&meta.path)?;
        for (hash, pl) in loaded.terms {
            let entry = terms.entry(hash).or_default();
            entry.doc_ids.extend(pl.doc_ids);
            entry.freqs.extend(pl.freqs);
        }
        for (doc_id, len) in loaded.lengths {
            doc_lengths.set(doc_id, len);
        }
        let _ = loaded.doc_start; // segment dropped here, memory released
    }

    pool.install(|| {
        terms.par_iter_mut().for_each(|(_, pl)| sort_posting_list(pl));
    });

    for meta in segments {
        let _ = fs::remove_file(&meta.path);
    }

    let num_docs = (max_doc_id + 1).max(0) as u32;
    Ok(SearchableIndex::from_parts(terms, doc_lengths, num_docs))
}

/// Sort one term's (doc_ids, freqs) parallel arrays by ascending doc-id.
fn sort_posting_list(pl: &mut PostingList) {
    let mut paired: Vec<(u32, u16)> = pl.doc_ids.drain(..).zip(pl.freqs.drain(..)).collect();
    paired.sort_unstable_by_key(|&(doc_id, _)| doc_id);
    pl.doc_ids.extend(paired.iter().map(|&(d, _)| d));
    pl.freqs.extend(paired.iter().map(|&(_, f)| f));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardMap;

    fn make_request(id: u32, out_dir: &Path, doc_start: u32, postings: &[(u64, u32, u16)], lengths: Vec<u16>) -> FlushRequest {
        let mut shard = ShardMap::new();
        for &(hash, doc_id, freq) in postings {
            shard.add_posting(hash, doc_id, freq);
        }
        FlushRequest {
            id,
            out_dir: out_dir.to_path_buf(),
            shards: vec![shard],
            doc_start,
            doc_count: lengths.len() as u32,
            lengths,
        }
    }

    #[test]
    fn segment_round_trip_preserves_postings() {
        let dir = tempfile::tempdir().unwrap();
        let req = make_request(
            0,
            dir.path(),
            0,
            &[(111, 0, 2), (111, 1, 1), (222, 1, 3)],
            vec![5, 7],
        );
        let meta = flush_segment(req).unwrap();
        assert_eq!(meta.num_docs, 2);
        assert_eq!(meta.num_terms, 2);

        let loaded = read_segment_full(&meta.path).unwrap();
        assert_eq!(loaded.doc_start, 0);
        let map: FxHashMap<u64, PostingList> = loaded.terms.into_iter().collect();
        assert_eq!(map[&111].doc_ids, vec![0, 1]);
        assert_eq!(map[&111].freqs, vec![2, 1]);
        assert_eq!(map[&222].doc_ids, vec![1]);
        assert_eq!(loaded.lengths, vec![(0, 5), (1, 7)]);
    }

    #[test]
    fn merge_sorts_and_dedupes_doc_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        let req_a = make_request(0, dir.path(), 0, &[(42, 1, 1), (42, 0, 1)], vec![3, 2]);
        let meta_a = flush_segment(req_a).unwrap();
        let req_b = make_request(1, dir.path(), 2, &[(42, 2, 1)], vec![4]);
        let meta_b = flush_segment(req_b).unwrap();

        let index = merge_segments(&pool, &[meta_a, meta_b]).unwrap();
        let pl = index.postings(42).unwrap();
        assert_eq!(pl.doc_ids, vec![0, 1, 2]);
        assert_eq!(index.num_docs(), 3);
        assert_eq!(index.doc_len(0), Some(3));
        assert_eq!(index.doc_len(2), Some(4));
    }

    #[test]
    fn merge_deletes_segment_files_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let req = make_request(0, dir.path(), 0, &[(1, 0, 1)], vec![1]);
        let meta = flush_segment(req).unwrap();
        let path = meta.path.clone();
        assert!(path.exists());
        let _ = merge_segments(&pool, &[meta]).unwrap();
        assert!(!path.exists());
    }
}
