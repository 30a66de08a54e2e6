//! Local group-by-key: turn a KeyValue into a KeyMultiValue on one rank.
//!
//! Two passes. Pass A hashes every record into one of `nbucket` spool
//! files, sized so a whole bucket is expected to fit in scratch memory;
//! buckets that come out too large trigger a re-partition with more
//! buckets. Pass B groups each bucket: the fast path loads the bucket into
//! memory and indexes it; the fallback for a bucket that cannot fit (a
//! single enormous key) streams the bucket once per distinct key. Values
//! keep their insertion order; keys are emitted in first-seen order within
//! a bucket.

use std::collections::HashMap;
use std::hash::Hasher;
use std::path::Path;

use anyhow::Result;
use fnv::FnvHasher;
use tracing::debug;

use crate::kmv::{KeyMultiValue, SliceValues, ValueSource};
use crate::kv::KeyValue;
use crate::layout::{Aligns, KvRecords, FILE_ALIGN};
use crate::spool::Spool;

const MAX_BUCKETS: usize = 4096;
const MAX_GROW: usize = 3;

fn bucket_of(key: &[u8], nbucket: usize) -> usize {
    let mut h = FnvHasher::default();
    h.write(key);
    h.finish() as usize & (nbucket - 1)
}

pub(crate) fn convert(
    kv: &mut KeyValue,
    dst: &mut KeyMultiValue,
    scratch_size: usize,
    fpath: &Path,
    tag: &str,
) -> Result<()> {
    if kv.nkv() == 0 {
        return Ok(());
    }
    let aligns = kv.aligns();

    let mut nbucket = (kv.tsize() as usize / (scratch_size / 2) + 1)
        .next_power_of_two()
        .min(MAX_BUCKETS);

    let mut attempt = 0usize;
    let mut spools = loop {
        // Bucket pages share the scratch budget; an entry bigger than its
        // spool page still goes through as a page of its own.
        let spool_page = (scratch_size / nbucket / FILE_ALIGN * FILE_ALIGN).max(FILE_ALIGN);
        let spools = partition(kv, nbucket, spool_page, fpath, tag, attempt)?;
        let largest = spools.iter().map(|s| s.total_bytes).max().unwrap_or(0) as usize;
        if largest <= scratch_size || nbucket >= MAX_BUCKETS || attempt >= MAX_GROW {
            break spools;
        }
        drop(spools);
        nbucket = (nbucket * 2).min(MAX_BUCKETS);
        attempt += 1;
        debug!(largest, nbucket, "convert bucket overflow, repartitioning");
    };

    for spool in &mut spools {
        if spool.total_entries == 0 {
            continue;
        }
        if spool.total_bytes as usize <= scratch_size {
            group_in_memory(spool, aligns, dst)?;
        } else {
            group_streaming(spool, aligns, dst)?;
        }
    }
    Ok(())
}

/// Pass A: hash every record of `kv` into a spool per bucket.
fn partition(
    kv: &mut KeyValue,
    nbucket: usize,
    spool_page: usize,
    fpath: &Path,
    tag: &str,
    attempt: usize,
) -> Result<Vec<Spool>> {
    let mut spools: Vec<Spool> = (0..nbucket)
        .map(|b| Spool::new(spool_page, fpath.join(format!("{tag}.{attempt}.{b}"))))
        .collect();
    for i in 0..kv.npages() {
        kv.load_page(i)?;
        let page = kv.page_bytes();
        for rec in kv.records() {
            let b = bucket_of(rec.key, nbucket);
            let (s, e) = rec.span;
            spools[b].add(&page[s..e])?;
        }
    }
    for s in &mut spools {
        s.complete()?;
    }
    Ok(spools)
}

/// Pass B fast path: the whole bucket fits in memory. Index it by key and
/// emit one record per distinct key.
fn group_in_memory(spool: &mut Spool, aligns: Aligns, dst: &mut KeyMultiValue) -> Result<()> {
    let mut buf = Vec::with_capacity(spool.total_bytes as usize);
    for i in 0..spool.npages() {
        spool.load_page(i)?;
        buf.extend_from_slice(spool.page_bytes());
    }
    let total = spool.total_entries;

    // Spans into `buf` rather than slices, so the groups outlive the index.
    struct Group {
        key: (usize, usize),
        values: Vec<(usize, usize)>,
    }
    let mut index: HashMap<&[u8], usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    let base = buf.as_ptr() as usize;
    for rec in KvRecords::new(&buf, total, aligns) {
        let koff = rec.key.as_ptr() as usize - base;
        let voff = rec.value.as_ptr() as usize - base;
        let vspan = (voff, voff + rec.value.len());
        match index.get(rec.key) {
            Some(&g) => groups[g].values.push(vspan),
            None => {
                index.insert(rec.key, groups.len());
                groups.push(Group {
                    key: (koff, koff + rec.key.len()),
                    values: vec![vspan],
                });
            }
        }
    }
    drop(index);

    for group in &groups {
        let key = &buf[group.key.0..group.key.1];
        let vals: Vec<&[u8]> = group.values.iter().map(|&(s, e)| &buf[s..e]).collect();
        dst.add_multivalue(key, &mut SliceValues::new(&vals))?;
    }
    Ok(())
}

/// Pass B fallback: the bucket cannot fit in scratch even after
/// re-partitioning, which means very few (usually one) enormous keys.
/// Collect key metadata in one scan, then stream the bucket once per key.
fn group_streaming(spool: &mut Spool, aligns: Aligns, dst: &mut KeyMultiValue) -> Result<()> {
    struct Group {
        key: Vec<u8>,
        nvalues: u64,
        bytes: u64,
    }
    let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for i in 0..spool.npages() {
        let n = spool.load_page(i)?;
        for rec in KvRecords::new(spool.page_bytes(), n, aligns) {
            match index.get(rec.key) {
                Some(&g) => {
                    groups[g].nvalues += 1;
                    groups[g].bytes += rec.value.len() as u64;
                }
                None => {
                    index.insert(rec.key.to_vec(), groups.len());
                    groups.push(Group {
                        key: rec.key.to_vec(),
                        nvalues: 1,
                        bytes: rec.value.len() as u64,
                    });
                }
            }
        }
    }
    drop(index);
    debug!(
        distinct = groups.len(),
        bytes = spool.total_bytes,
        "streaming oversized convert bucket"
    );

    for group in &groups {
        let mut src = BucketValues {
            spool: &mut *spool,
            key: &group.key,
            nvalues: group.nvalues,
            bytes: group.bytes,
            aligns,
        };
        dst.add_multivalue(&group.key, &mut src)?;
    }
    Ok(())
}

/// Restartable value stream for one key of an oversized bucket.
struct BucketValues<'a> {
    spool: &'a mut Spool,
    key: &'a [u8],
    nvalues: u64,
    bytes: u64,
    aligns: Aligns,
}

impl ValueSource for BucketValues<'_> {
    fn nvalues(&self) -> u64 {
        self.nvalues
    }

    fn total_bytes(&self) -> u64 {
        self.bytes
    }

    fn visit(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        for i in 0..self.spool.npages() {
            let n = self.spool.load_page(i)?;
            for rec in KvRecords::new(self.spool.page_bytes(), n, self.aligns) {
                if rec.key == self.key {
                    f(rec.value)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KmvRecord;

    fn collect_groups(kmv: &mut KeyMultiValue) -> Vec<(Vec<u8>, Vec<Vec<u8>>)> {
        let mut out = Vec::new();
        let mut ipage = 0;
        while ipage < kmv.npages() {
            kmv.load_page(ipage).unwrap();
            let mut skip = 0usize;
            let recs: Vec<_> = kmv
                .records()
                .map(|rec| match rec {
                    KmvRecord::Inline { key, values, .. } => (
                        key.to_vec(),
                        values.iter().map(|v| v.to_vec()).collect::<Vec<_>>(),
                        0usize,
                    ),
                    KmvRecord::BlockHeader { key, nblocks, .. } => {
                        (key.to_vec(), Vec::new(), nblocks)
                    }
                })
                .collect();
            for (key, vals, nblocks) in recs {
                if nblocks == 0 {
                    out.push((key, vals));
                } else {
                    let mut all = Vec::new();
                    let mut buf = Vec::new();
                    for b in 0..nblocks {
                        kmv.read_page_into(ipage + 1 + b, &mut buf).unwrap();
                        let block = crate::layout::decode_block_page(&buf, &kmv.aligns());
                        all.extend(block.iter().map(|v| v.to_vec()));
                    }
                    out.push((key, all));
                    skip = nblocks;
                }
            }
            ipage += 1 + skip;
        }
        out
    }

    #[test]
    fn one_record_per_distinct_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut kv = KeyValue::new(512, Aligns::default(), dir.path().join("kv.c"));
        for round in 0..3u8 {
            for k in 0..20u8 {
                kv.add(&[k; 4], &[round, k]).unwrap();
            }
        }
        kv.complete().unwrap();
        assert!(kv.npages() > 1);

        let mut kmv = KeyMultiValue::new(512, Aligns::default(), dir.path().join("kmv.c"));
        convert(&mut kv, &mut kmv, 4096, dir.path(), "cvt.t1").unwrap();
        kmv.complete().unwrap();

        assert_eq!(kmv.nkmv(), 20);
        let mut groups = collect_groups(&mut kmv);
        groups.sort();
        for (i, (key, vals)) in groups.iter().enumerate() {
            assert_eq!(key, &[i as u8; 4]);
            // values keep insertion order: round 0, 1, 2
            assert_eq!(
                vals,
                &vec![vec![0, i as u8], vec![1, i as u8], vec![2, i as u8]]
            );
        }
    }

    #[test]
    fn empty_kv_converts_to_empty_kmv() {
        let dir = tempfile::tempdir().unwrap();
        let mut kv = KeyValue::new(512, Aligns::default(), dir.path().join("kv.e"));
        kv.complete().unwrap();
        let mut kmv = KeyMultiValue::new(512, Aligns::default(), dir.path().join("kmv.e"));
        convert(&mut kv, &mut kmv, 4096, dir.path(), "cvt.t2").unwrap();
        kmv.complete().unwrap();
        assert_eq!(kmv.nkmv(), 0);
        assert_eq!(kmv.npages(), 0);
    }

    #[test]
    fn giant_key_streams_into_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut kv = KeyValue::new(512, Aligns::default(), dir.path().join("kv.g"));
        // One key whose grouped values exceed the scratch budget by far.
        for i in 0..24u8 {
            kv.add(b"hot", &[i; 120]).unwrap();
        }
        kv.add(b"cold", b"v").unwrap();
        kv.complete().unwrap();

        let mut kmv = KeyMultiValue::new(512, Aligns::default(), dir.path().join("kmv.g"));
        // Scratch of one page forces the streaming fallback for "hot".
        convert(&mut kv, &mut kmv, 512, dir.path(), "cvt.t3").unwrap();
        kmv.complete().unwrap();

        assert_eq!(kmv.nkmv(), 2);
        let groups = collect_groups(&mut kmv);
        let hot = groups.iter().find(|(k, _)| k == b"hot").unwrap();
        assert_eq!(hot.1.len(), 24);
        for (i, v) in hot.1.iter().enumerate() {
            assert_eq!(v, &vec![i as u8; 120]);
        }
        let cold = groups.iter().find(|(k, _)| k == b"cold").unwrap();
        assert_eq!(cold.1, vec![b"v".to_vec()]);
    }
}
