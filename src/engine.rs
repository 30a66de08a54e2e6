//! The engine driver: owns at most one live KeyValue or KeyMultiValue per
//! rank and sequences the bulk-synchronous operators over them.
//!
//! Every operator runs on all ranks of the fabric group in the same order.
//! An operator whose precondition fails (wrong container state, bad
//! arguments) returns an error, which is fatal to the group: peers blocked
//! in a collective will fail as soon as the erroring rank drops its fabric
//! handle. Each operator returns the record total across the group.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, ensure, Result};
use bytes::Bytes;
use tracing::info;

use crate::config::{MapStyle, Settings};
use crate::convert;
use crate::fabric::{decode_u64s, encode_u64s, Fabric};
use crate::filemap::{FileMap, Separator};
use crate::ihash;
use crate::irregular::Irregular;
use crate::kmv::{BlockCursor, KeyMultiValue, MultiValue};
use crate::kv::KeyValue;
use crate::layout::KmvRecord;
use crate::sort::{self, SortTarget};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

fn next_file_id() -> u64 {
    NEXT_FILE_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Whether a map operator starts a fresh KeyValue or appends to the
/// current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapMode {
    #[default]
    Fresh,
    Append,
}

enum StatKind {
    Kv,
    Kmv,
}

pub struct MapReduce {
    settings: Settings,
    fabric: Arc<Fabric>,
    aligns: crate::layout::Aligns,
    page_size: usize,
    scratch_size: usize,
    instance: u64,
    kv: Option<KeyValue>,
    kmv: Option<KeyMultiValue>,
    time_start: Option<Instant>,
}

impl MapReduce {
    /// Create one engine rank over `fabric`. Validates the settings and
    /// ensures the scratch directory exists.
    pub fn new(fabric: Arc<Fabric>, settings: Settings) -> Result<MapReduce> {
        let aligns = settings.aligns()?;
        std::fs::create_dir_all(&settings.fpath)?;
        let page_size = settings.page_size();
        let scratch_size = settings.scratch_size();
        Ok(MapReduce {
            settings,
            fabric,
            aligns,
            page_size,
            scratch_size,
            instance: NEXT_INSTANCE.fetch_add(1, AtomicOrdering::Relaxed),
            kv: None,
            kmv: None,
            time_start: None,
        })
    }

    pub fn rank(&self) -> usize {
        self.fabric.rank()
    }

    pub fn nranks(&self) -> usize {
        self.fabric.size()
    }

    /// Duplicate this engine: same settings and fabric, plus a copy of the
    /// live container if any.
    pub fn copy(&mut self) -> Result<MapReduce> {
        let mut mrnew = MapReduce::new(Arc::clone(&self.fabric), self.settings.clone())?;
        if let Some(kv) = self.kv.as_mut() {
            let mut dst = mrnew.new_kv();
            dst.add_kv(kv)?;
            dst.complete()?;
            mrnew.kv = Some(dst);
        }
        if let Some(kmv) = self.kmv.as_mut() {
            let mut dst = mrnew.new_kmv();
            dst.copy_from(kmv)?;
            dst.complete()?;
            mrnew.kmv = Some(dst);
        }
        Ok(mrnew)
    }

    /////////////////////////////////////////////////////////////////////////
    // map operators
    /////////////////////////////////////////////////////////////////////////

    /// Run `nmap` tasks across the group; each call may add records to the
    /// destination KeyValue.
    pub fn map_tasks<F>(&mut self, nmap: u64, mode: MapMode, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        self.kmv = None;
        let mut kv = self.prepare_dest_kv(mode)?;
        self.run_tasks(nmap, &mut kv, &mut |itask, kv| f(itask, kv))?;
        kv.complete()?;
        self.kv = Some(kv);
        self.stats("map", StatKind::Kv)?;
        self.kv_total()
    }

    /// One task per named file.
    pub fn map_files<F>(&mut self, files: &[PathBuf], mode: MapMode, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &Path, &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        self.kmv = None;
        let mut kv = self.prepare_dest_kv(mode)?;
        self.run_tasks(files.len() as u64, &mut kv, &mut |itask, kv| {
            f(itask, &files[itask as usize], kv)
        })?;
        kv.complete()?;
        self.kv = Some(kv);
        self.stats("map", StatKind::Kv)?;
        self.kv_total()
    }

    /// Split the union of `files` into about `nmap` byte chunks trimmed at
    /// `sep`, and run one task per chunk. `delta` bounds how far a
    /// separator may sit past a nominal chunk boundary.
    pub fn map_file_chunks<F>(
        &mut self,
        nmap: u64,
        files: &[PathBuf],
        sep: Separator,
        delta: usize,
        mode: MapMode,
        mut f: F,
    ) -> Result<u64>
    where
        F: FnMut(u64, &[u8], &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        self.kmv = None;

        // Rank 0 queries the file sizes once and broadcasts them.
        let sizes = if self.fabric.rank() == 0 {
            let mut sizes = Vec::with_capacity(files.len());
            for path in files {
                let md = std::fs::metadata(path)
                    .map_err(|e| anyhow!("could not query size of {}: {e}", path.display()))?;
                sizes.push(md.len());
            }
            decode_u64s(self.fabric.bcast(0, encode_u64s(&sizes))?)
        } else {
            decode_u64s(self.fabric.bcast(0, Bytes::new())?)
        };

        let fm = FileMap::build(
            files.to_vec(),
            sizes,
            nmap as usize,
            sep,
            delta,
            self.fabric.rank() == 0,
        )?;

        let mut kv = self.prepare_dest_kv(mode)?;
        self.run_tasks(fm.ntasks() as u64, &mut kv, &mut |itask, kv| {
            let chunk = fm.read_chunk(itask as usize)?;
            f(itask, &chunk, kv)
        })?;
        kv.complete()?;
        self.kv = Some(kv);
        self.stats("map", StatKind::Kv)?;
        self.kv_total()
    }

    /// One callback per record of another engine's KeyValue; this engine's
    /// KeyValue receives whatever the callback adds.
    pub fn map_kv<F>(&mut self, source: &mut MapReduce, mode: MapMode, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &[u8], &[u8], &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        self.kmv = None;
        let mut src = source
            .kv
            .take()
            .ok_or_else(|| anyhow!("MapReduce passed to map_kv() has no KeyValue"))?;
        let mut dest = self.prepare_dest_kv(mode)?;
        let result = Self::map_over(&mut src, &mut dest, &mut f);
        source.kv = Some(src);
        result?;
        dest.complete()?;
        self.kv = Some(dest);
        self.stats("map", StatKind::Kv)?;
        self.kv_total()
    }

    /// [`map_kv`](Self::map_kv) over this engine's own KeyValue: the old
    /// container is consumed and the callback's additions replace it (or
    /// extend a copy of it in `Append` mode).
    pub fn map_self<F>(&mut self, mode: MapMode, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &[u8], &[u8], &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        self.kmv = None;
        let mut src = self.take_kv("map")?;
        let mut dest = self.new_kv();
        if mode == MapMode::Append {
            dest.add_kv(&mut src)?;
            dest.complete()?;
            dest.append()?;
        }
        Self::map_over(&mut src, &mut dest, &mut f)?;
        drop(src);
        dest.complete()?;
        self.kv = Some(dest);
        self.stats("map", StatKind::Kv)?;
        self.kv_total()
    }

    fn map_over(
        src: &mut KeyValue,
        dest: &mut KeyValue,
        f: &mut dyn FnMut(u64, &[u8], &[u8], &mut KeyValue) -> Result<()>,
    ) -> Result<()> {
        for ipage in 0..src.npages() {
            src.load_page(ipage)?;
            for (i, rec) in src.records().enumerate() {
                f(i as u64, rec.key, rec.value, dest)?;
            }
        }
        Ok(())
    }

    /// Append another engine's KeyValue records to this engine's.
    pub fn add(&mut self, other: &mut MapReduce) -> Result<u64> {
        self.start_timer();
        let mut kv = self.take_kv("add")?;
        let mut okv = other
            .kv
            .take()
            .ok_or_else(|| anyhow!("MapReduce passed to add() has no KeyValue"))?;
        kv.append()?;
        let result = kv.add_kv(&mut okv);
        other.kv = Some(okv);
        result?;
        kv.complete()?;
        self.kv = Some(kv);
        self.stats("add", StatKind::Kv)?;
        self.kv_total()
    }

    /////////////////////////////////////////////////////////////////////////
    // shuffle and grouping
    /////////////////////////////////////////////////////////////////////////

    /// Cross-rank shuffle: after this, all records with a given key live
    /// on the rank chosen by `hash(key) % nranks` (default hash if none).
    pub fn aggregate(&mut self, hash: Option<&dyn Fn(&[u8]) -> u32>) -> Result<u64> {
        self.start_timer();
        let mut kv = self.take_kv("aggregate")?;
        if self.fabric.size() == 1 {
            self.kv = Some(kv);
            self.stats("aggregate", StatKind::Kv)?;
            return self.kv_total();
        }

        let mut kvnew = self.new_kv();
        let irregular = Irregular::new(&self.fabric);
        let nprocs = self.fabric.size() as u32;
        let npage = kv.npages() as u64;
        // Every per-page exchange is collective, so all ranks loop to the
        // group-wide maximum page count; ranks out of pages send nothing.
        let maxpage = self.fabric.allreduce_max(npage)?;
        let mut recvbuf: Vec<u8> = Vec::new();

        for ipage in 0..maxpage {
            let has = ipage < npage;
            let mut dest = Vec::new();
            let mut sizes = Vec::new();
            let mut spans = Vec::new();
            if has {
                kv.load_page(ipage as usize)?;
                for rec in kv.records() {
                    let r = match hash {
                        Some(h) => h(rec.key) % nprocs,
                        None => ihash(rec.key) % nprocs,
                    };
                    dest.push(r as usize);
                    sizes.push((rec.span.1 - rec.span.0) as u32);
                    spans.push(rec.span);
                }
            }

            let plan = irregular.plan(&dest, &sizes)?;
            let recvsizes = irregular.exchange_sizes(&plan, &dest, &sizes)?;
            let recv_total: u64 = recvsizes.iter().map(|&s| s as u64).sum();
            ensure!(
                recv_total == plan.total_recv_bytes(),
                "shuffle size exchange disagrees with counts exchange"
            );
            let empty: [u8; 0] = [];
            let page: &[u8] = if has { kv.page_bytes() } else { &empty };
            irregular.exchange_payload(&plan, &dest, &spans, page, &mut recvbuf)?;
            kvnew.add_packed(plan.total_recv_records(), &recvbuf)?;
        }

        drop(kv);
        kvnew.complete()?;
        self.kv = Some(kvnew);
        self.stats("aggregate", StatKind::Kv)?;
        self.kv_total()
    }

    /// Local group-by-key: the KeyValue becomes a KeyMultiValue with one
    /// record per distinct key on this rank.
    pub fn convert(&mut self) -> Result<u64> {
        self.start_timer();
        let kv = self.take_kv("convert")?;
        let kmv = self.convert_kv(kv)?;
        self.kmv = Some(kmv);
        self.stats("convert", StatKind::Kmv)?;
        self.kmv_total()
    }

    /// Aggregate followed by convert.
    pub fn collate(&mut self, hash: Option<&dyn Fn(&[u8]) -> u32>) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot collate without a KeyValue");
        }
        self.start_timer();
        let hold = (self.settings.verbosity, self.settings.timer);
        self.settings.verbosity = 0;
        self.settings.timer = 0;
        let result = self.aggregate(hash).and_then(|_| self.convert());
        self.settings.verbosity = hold.0;
        self.settings.timer = hold.1;
        result?;
        self.stats("collate", StatKind::Kmv)?;
        self.kmv_total()
    }

    /// One KMV record per KV record, each with a single value.
    pub fn clone_kv(&mut self) -> Result<u64> {
        self.start_timer();
        let mut kv = self.take_kv("clone")?;
        let mut kmv = self.new_kmv();
        kmv.clone_from(&mut kv)?;
        kmv.complete()?;
        drop(kv);
        self.kmv = Some(kmv);
        self.stats("clone", StatKind::Kmv)?;
        self.kmv_total()
    }

    /// Collapse the KeyValue into a single KMV record per rank under the
    /// given key, whose multivalue alternates old keys and values.
    pub fn collapse(&mut self, key: &[u8]) -> Result<u64> {
        self.start_timer();
        let mut kv = self.take_kv("collapse")?;
        let mut kmv = self.new_kmv();
        kmv.collapse_from(key, &mut kv)?;
        kmv.complete()?;
        drop(kv);
        self.kmv = Some(kmv);
        self.stats("collapse", StatKind::Kmv)?;
        self.kmv_total()
    }

    /// Locally group duplicate keys and fold each group back into a single
    /// record through `f`: a convert-and-reduce that never crosses ranks.
    pub fn compress<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(&[u8], MultiValue<'_, '_>, &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        let kv = self.take_kv("compress")?;
        let mut kmv = self.convert_kv(kv)?;
        let mut dest = self.new_kv();
        Self::drive_reduce(&mut kmv, &mut dest, &mut f)?;
        drop(kmv);
        dest.complete()?;
        self.kv = Some(dest);
        self.stats("compress", StatKind::Kv)?;
        self.kv_total()
    }

    /// Call `f` once per key/multivalue; the callback's additions form the
    /// new KeyValue.
    pub fn reduce<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(&[u8], MultiValue<'_, '_>, &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        let mut kmv = self.take_kmv("reduce")?;
        let mut dest = self.new_kv();
        Self::drive_reduce(&mut kmv, &mut dest, &mut f)?;
        drop(kmv);
        dest.complete()?;
        self.kv = Some(dest);
        self.stats("reduce", StatKind::Kv)?;
        self.kv_total()
    }

    fn drive_reduce(
        kmv: &mut KeyMultiValue,
        dest: &mut KeyValue,
        f: &mut dyn FnMut(&[u8], MultiValue<'_, '_>, &mut KeyValue) -> Result<()>,
    ) -> Result<()> {
        let aligns = kmv.aligns();
        let mut scratch: Vec<u8> = Vec::new();
        let npage = kmv.npages();
        let mut ipage = 0;
        while ipage < npage {
            let nrec = kmv.load_page(ipage)?;
            let alignsize = kmv.page_bytes().len();
            let page = kmv.take_page();
            let mut skip = 0usize;
            for rec in crate::layout::KmvRecords::new(&page[..alignsize], nrec, aligns) {
                match rec {
                    KmvRecord::Inline { key, values, .. } => {
                        f(key, MultiValue::Inline(values), dest)?;
                    }
                    KmvRecord::BlockHeader { key, nblocks, .. } => {
                        let mut cursor = BlockCursor::new(kmv, &mut scratch, ipage, nblocks);
                        f(key, MultiValue::Blocks(&mut cursor), dest)?;
                        skip = nblocks;
                    }
                }
            }
            kmv.put_page(page);
            ipage += 1 + skip;
        }
        Ok(())
    }

    /////////////////////////////////////////////////////////////////////////
    // concentration
    /////////////////////////////////////////////////////////////////////////

    /// Move every record onto ranks `[0, nranks)`: rank `r >= nranks`
    /// ships its pages to rank `r % nranks` and is left empty.
    pub fn gather(&mut self, nranks: usize) -> Result<u64> {
        self.start_timer();
        if self.kv.is_none() {
            bail!("cannot gather without a KeyValue");
        }
        let size = self.fabric.size();
        let me = self.fabric.rank();
        if nranks < 1 || nranks > size {
            bail!("invalid rank count {nranks} for gather over {size} ranks");
        }
        if size == 1 || nranks == size {
            self.stats("gather", StatKind::Kv)?;
            return self.kv_total();
        }

        let mut kv = self.kv.take().unwrap();
        if me < nranks {
            kv.append()?;
            let mut iproc = me + nranks;
            while iproc < size {
                let npage = decode_u64s(self.fabric.recv(iproc)?)[0];
                for _ in 0..npage {
                    let hdr = decode_u64s(self.fabric.recv(iproc)?);
                    let payload = self.fabric.recv(iproc)?;
                    kv.add_chunk(hdr[0], &payload, hdr[1], hdr[2])?;
                }
                iproc += nranks;
            }
        } else {
            let dst = me % nranks;
            self.fabric
                .send(dst, encode_u64s(&[kv.npages() as u64]))?;
            for i in 0..kv.npages() {
                let nrec = kv.load_page(i)?;
                let (ks, vs) = kv.loaded_page_sizes();
                self.fabric.send(dst, encode_u64s(&[nrec, ks, vs]))?;
                self.fabric
                    .send(dst, Bytes::copy_from_slice(kv.page_bytes()))?;
            }
            drop(kv);
            kv = self.new_kv();
        }
        kv.complete()?;
        self.kv = Some(kv);
        self.stats("gather", StatKind::Kv)?;
        self.kv_total()
    }

    /// Gather followed by collapse: a single KMV record per surviving rank.
    pub fn scrunch(&mut self, nranks: usize, key: &[u8]) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot scrunch without a KeyValue");
        }
        self.start_timer();
        let hold = (self.settings.verbosity, self.settings.timer);
        self.settings.verbosity = 0;
        self.settings.timer = 0;
        let result = self.gather(nranks).and_then(|_| self.collapse(key));
        self.settings.verbosity = hold.0;
        self.settings.timer = hold.1;
        result?;
        self.stats("scrunch", StatKind::Kmv)?;
        self.kmv_total()
    }

    /////////////////////////////////////////////////////////////////////////
    // sorting
    /////////////////////////////////////////////////////////////////////////

    /// Reorder this rank's records by key under `cmp`. Local to each rank.
    pub fn sort_keys<F>(&mut self, mut cmp: F) -> Result<u64>
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        self.start_timer();
        let kv = self.take_kv("sort_keys")?;
        let sorted = self.run_sort(kv, SortTarget::Keys, &mut cmp)?;
        self.kv = Some(sorted);
        self.stats("sort_keys", StatKind::Kv)?;
        self.kv_total()
    }

    /// Reorder this rank's records by value under `cmp`. Local to each rank.
    pub fn sort_values<F>(&mut self, mut cmp: F) -> Result<u64>
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        self.start_timer();
        let kv = self.take_kv("sort_values")?;
        let sorted = self.run_sort(kv, SortTarget::Values, &mut cmp)?;
        self.kv = Some(sorted);
        self.stats("sort_values", StatKind::Kv)?;
        self.kv_total()
    }

    fn run_sort(
        &mut self,
        kv: KeyValue,
        target: SortTarget,
        cmp: &mut dyn FnMut(&[u8], &[u8]) -> Ordering,
    ) -> Result<KeyValue> {
        let tag = format!("sps.{}.{}", next_file_id(), self.fabric.rank());
        sort::sort_kv(
            kv,
            target,
            cmp,
            self.scratch_size,
            &self.settings.fpath,
            &tag,
            self.spill_path("kv"),
        )
    }

    /// Sort the values inside every multivalue, in place.
    pub fn sort_multivalues<F>(&mut self, mut cmp: F) -> Result<u64>
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        self.start_timer();
        let mut kmv = self.take_kmv("sort_multivalues")?;
        sort::sort_multivalues(&mut kmv, &mut cmp)?;
        self.kmv = Some(kmv);
        self.stats("sort_multivalues", StatKind::Kmv)?;
        self.kmv_total()
    }

    /////////////////////////////////////////////////////////////////////////
    // stats and plumbing
    /////////////////////////////////////////////////////////////////////////

    /// Log the group totals of the current KeyValue; level 2 adds per-rank
    /// distributions. Collective.
    pub fn kv_stats(&self, level: u8) -> Result<()> {
        if self.kv.is_none() {
            bail!("cannot print stats without a KeyValue");
        }
        self.log_kv_stats("kv_stats", level)
    }

    /// Log the group totals of the current KeyMultiValue. Collective.
    pub fn kmv_stats(&self, level: u8) -> Result<()> {
        if self.kmv.is_none() {
            bail!("cannot print stats without a KeyMultiValue");
        }
        self.log_kmv_stats("kmv_stats", level)
    }

    fn stats(&mut self, op: &str, which: StatKind) -> Result<()> {
        if self.settings.timer > 0 {
            if let Some(t0) = self.time_start.take() {
                let micros = t0.elapsed().as_micros() as u64;
                if self.settings.timer == 1 {
                    self.fabric.barrier()?;
                    if self.fabric.rank() == 0 {
                        info!(
                            instance = self.instance,
                            op,
                            elapsed_ms = micros as f64 / 1000.0,
                            "operator time"
                        );
                    }
                } else {
                    let (min, max, avg, histo) = self.histogram(micros)?;
                    if self.fabric.rank() == 0 {
                        info!(
                            instance = self.instance,
                            op,
                            min_us = min,
                            max_us = max,
                            avg_us = avg,
                            histo = ?histo,
                            "operator time"
                        );
                    }
                }
            }
        }
        if self.settings.verbosity == 0 {
            return Ok(());
        }
        match which {
            StatKind::Kv => self.log_kv_stats(op, self.settings.verbosity),
            StatKind::Kmv => self.log_kmv_stats(op, self.settings.verbosity),
        }
    }

    fn log_kv_stats(&self, op: &str, level: u8) -> Result<()> {
        let (n, k, v) = match self.kv.as_ref() {
            Some(kv) => (kv.nkv(), kv.ksize(), kv.vsize()),
            None => (0, 0, 0),
        };
        let t = self.fabric.allreduce_sum_vec(&[n, k, v])?;
        if self.fabric.rank() == 0 {
            info!(
                instance = self.instance,
                op,
                pairs = t[0],
                key_mb = mb(t[1]),
                value_mb = mb(t[2]),
                "KeyValue"
            );
        }
        if level >= 2 {
            self.log_distributions(op, &[("pairs", n), ("key_bytes", k), ("value_bytes", v)])?;
        }
        Ok(())
    }

    fn log_kmv_stats(&self, op: &str, level: u8) -> Result<()> {
        let (n, k, v) = match self.kmv.as_ref() {
            Some(kmv) => (kmv.nkmv(), kmv.ksize(), kmv.vsize()),
            None => (0, 0, 0),
        };
        let t = self.fabric.allreduce_sum_vec(&[n, k, v])?;
        if self.fabric.rank() == 0 {
            info!(
                instance = self.instance,
                op,
                pairs = t[0],
                key_mb = mb(t[1]),
                value_mb = mb(t[2]),
                "KeyMultiValue"
            );
        }
        if level >= 2 {
            self.log_distributions(op, &[("pairs", n), ("key_bytes", k), ("value_bytes", v)])?;
        }
        Ok(())
    }

    fn log_distributions(&self, op: &str, metrics: &[(&str, u64)]) -> Result<()> {
        for &(label, value) in metrics {
            let (min, max, avg, histo) = self.histogram(value)?;
            if self.fabric.rank() == 0 {
                info!(
                    instance = self.instance,
                    op,
                    metric = label,
                    min,
                    max,
                    avg,
                    histo = ?histo,
                    "per-rank distribution"
                );
            }
        }
        Ok(())
    }

    /// Ten-bin histogram of one per-rank value across the group.
    fn histogram(&self, v: u64) -> Result<(u64, u64, f64, [u64; 10])> {
        let n = self.fabric.size() as u64;
        let sum = self.fabric.allreduce_sum(v)?;
        let min = self.fabric.allreduce_min(v)?;
        let max = self.fabric.allreduce_max(v)?;
        let avg = sum as f64 / n as f64;
        let bin = if max > min {
            (((v - min) as u128 * 10) / ((max - min + 1) as u128)) as usize
        } else {
            0
        };
        let mut local = [0u64; 10];
        local[bin.min(9)] = 1;
        let summed = self.fabric.allreduce_sum_vec(&local)?;
        let mut histo = [0u64; 10];
        histo.copy_from_slice(&summed);
        Ok((min, max, avg, histo))
    }

    fn start_timer(&mut self) {
        if self.settings.timer == 0 {
            return;
        }
        if self.settings.timer == 1 {
            let _ = self.fabric.barrier();
        }
        self.time_start = Some(Instant::now());
    }

    fn run_tasks(
        &self,
        nmap: u64,
        kv: &mut KeyValue,
        f: &mut dyn FnMut(u64, &mut KeyValue) -> Result<()>,
    ) -> Result<()> {
        let me = self.fabric.rank() as u64;
        let n = self.fabric.size() as u64;
        if n == 1 {
            for itask in 0..nmap {
                f(itask, kv)?;
            }
            return Ok(());
        }
        match self.settings.mapstyle {
            MapStyle::Chunk => {
                let lo = me * nmap / n;
                let hi = (me + 1) * nmap / n;
                for itask in lo..hi {
                    f(itask, kv)?;
                }
            }
            MapStyle::Stride => {
                let mut itask = me;
                while itask < nmap {
                    f(itask, kv)?;
                    itask += n;
                }
            }
            MapStyle::MasterWorker => self.run_master_worker(nmap, kv, f)?,
        }
        Ok(())
    }

    /// Rank 0 hands out tasks on demand and performs none itself.
    fn run_master_worker(
        &self,
        nmap: u64,
        kv: &mut KeyValue,
        f: &mut dyn FnMut(u64, &mut KeyValue) -> Result<()>,
    ) -> Result<()> {
        const DONE: u64 = u64::MAX;
        let n = self.fabric.size();
        if self.fabric.rank() == 0 {
            let mut itask = 0u64;
            let mut ndone = 0usize;
            for w in 1..n {
                if itask < nmap {
                    self.fabric.send(w, encode_u64s(&[itask]))?;
                    itask += 1;
                } else {
                    self.fabric.send(w, encode_u64s(&[DONE]))?;
                    ndone += 1;
                }
            }
            while ndone < n - 1 {
                let (src, _) = self.fabric.recv_any()?;
                if itask < nmap {
                    self.fabric.send(src, encode_u64s(&[itask]))?;
                    itask += 1;
                } else {
                    self.fabric.send(src, encode_u64s(&[DONE]))?;
                    ndone += 1;
                }
            }
        } else {
            loop {
                let itask = decode_u64s(self.fabric.recv(0)?)[0];
                if itask == DONE {
                    break;
                }
                f(itask, kv)?;
                self.fabric.send(0, encode_u64s(&[itask]))?;
            }
        }
        Ok(())
    }

    fn prepare_dest_kv(&mut self, mode: MapMode) -> Result<KeyValue> {
        match (mode, self.kv.take()) {
            (MapMode::Append, Some(mut kv)) => {
                kv.append()?;
                Ok(kv)
            }
            _ => Ok(self.new_kv()),
        }
    }

    fn convert_kv(&mut self, mut kv: KeyValue) -> Result<KeyMultiValue> {
        let mut kmv = self.new_kmv();
        let tag = format!("grp.{}.{}", next_file_id(), self.fabric.rank());
        convert::convert(
            &mut kv,
            &mut kmv,
            self.scratch_size,
            &self.settings.fpath,
            &tag,
        )?;
        kmv.complete()?;
        Ok(kmv)
    }

    fn take_kv(&mut self, op: &str) -> Result<KeyValue> {
        self.kv
            .take()
            .ok_or_else(|| anyhow!("cannot {op} without a KeyValue"))
    }

    fn take_kmv(&mut self, op: &str) -> Result<KeyMultiValue> {
        self.kmv
            .take()
            .ok_or_else(|| anyhow!("cannot {op} without a KeyMultiValue"))
    }

    fn new_kv(&self) -> KeyValue {
        KeyValue::new(self.page_size, self.aligns, self.spill_path("kv"))
    }

    fn new_kmv(&self) -> KeyMultiValue {
        KeyMultiValue::new(self.page_size, self.aligns, self.spill_path("kmv"))
    }

    fn spill_path(&self, kind: &str) -> PathBuf {
        self.settings
            .fpath
            .join(format!("{kind}.{}.{}", next_file_id(), self.fabric.rank()))
    }

    fn kv_total(&self) -> Result<u64> {
        let n = self.kv.as_ref().map(|kv| kv.nkv()).unwrap_or(0);
        self.fabric.allreduce_sum(n)
    }

    fn kmv_total(&self) -> Result<u64> {
        let n = self.kmv.as_ref().map(|kmv| kmv.nkmv()).unwrap_or(0);
        self.fabric.allreduce_sum(n)
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
