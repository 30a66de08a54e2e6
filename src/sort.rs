//! Key, value and multivalue sorting.
//!
//! A KV that fits in one page is sorted in memory through an index vector
//! and rewritten in place. A multi-page KV writes each locally sorted page
//! to a spool, then merge-sorts pairs of spools until one remains; the
//! survivor is repacked into a fresh KeyValue. Comparators are plain
//! closures over borrowed byte ranges; no global state is involved.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::kmv::KeyMultiValue;
use crate::kv::KeyValue;
use crate::layout::{align_up, read_i32, write_i32, Aligns, KmvRecord, FILE_ALIGN, TWO_LEN};
use crate::spool::Spool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SortTarget {
    Keys,
    Values,
}

pub(crate) type Compare<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> Ordering;

/// Parse the record at `off`: its aligned length and the compared field.
fn parse<'p>(page: &'p [u8], off: usize, a: &Aligns, target: SortTarget) -> (usize, &'p [u8]) {
    let kb = read_i32(page, off) as usize;
    let vb = read_i32(page, off + 4) as usize;
    let mut o = align_up(off + TWO_LEN, a.kalign);
    let key = &page[o..o + kb];
    o = align_up(o + kb, a.valign);
    let value = &page[o..o + vb];
    o = align_up(o + vb, a.talign);
    let field = match target {
        SortTarget::Keys => key,
        SortTarget::Values => value,
    };
    (o - off, field)
}

pub(crate) fn sort_kv(
    mut kv: KeyValue,
    target: SortTarget,
    cmp: Compare<'_>,
    scratch_size: usize,
    spool_dir: &Path,
    spool_tag: &str,
    new_kv_path: PathBuf,
) -> Result<KeyValue> {
    let npage = kv.npages();
    if npage == 0 {
        return Ok(kv);
    }
    let aligns = kv.aligns();

    if npage == 1 {
        kv.load_page(0)?;
        let sorted = sort_page_image(kv.page_bytes(), kv.records().count(), aligns, target, cmp);
        kv.rewrite_loaded_page(&sorted)?;
        return Ok(kv);
    }

    // One spool per locally sorted page, plus one per merge.
    let nspool = 2 * npage - 1;
    let memspool = (scratch_size / 3 / FILE_ALIGN * FILE_ALIGN).max(FILE_ALIGN);
    let mut spools: Vec<Option<Spool>> = (0..nspool)
        .map(|i| {
            Some(Spool::new(
                memspool,
                spool_dir.join(format!("{spool_tag}.{i}")),
            ))
        })
        .collect();

    for ipage in 0..npage {
        kv.load_page(ipage)?;
        let sorted = sort_page_image(kv.page_bytes(), kv.records().count(), aligns, target, cmp);
        let sp = spools[ipage].as_mut().unwrap();
        let mut off = 0;
        while off < sorted.len() {
            let (len, _) = parse(&sorted, off, &aligns, target);
            sp.add(&sorted[off..off + len])?;
            off += len;
        }
        sp.complete()?;
    }
    let page_size = kv.page_size();
    drop(kv);

    let mut isrc = 0;
    let mut idest = npage;
    for _ in 0..npage - 1 {
        let mut a = spools[isrc].take().unwrap();
        let mut b = spools[isrc + 1].take().unwrap();
        let mut d = spools[idest].take().unwrap();
        merge(&mut a, &mut b, &mut d, aligns, target, cmp)?;
        d.complete()?;
        spools[idest] = Some(d);
        isrc += 2;
        idest += 1;
    }

    let sp = spools[nspool - 1].as_mut().unwrap();
    let mut newkv = KeyValue::new(page_size, aligns, new_kv_path);
    for i in 0..sp.npages() {
        let n = sp.load_page(i)?;
        newkv.add_packed(n, sp.page_bytes())?;
    }
    newkv.complete()?;
    Ok(newkv)
}

/// Index-sort one page image and return the reordered image.
fn sort_page_image(
    page: &[u8],
    nrec: usize,
    aligns: Aligns,
    target: SortTarget,
    cmp: Compare<'_>,
) -> Vec<u8> {
    let mut spans = Vec::with_capacity(nrec);
    let mut off = 0;
    for _ in 0..nrec {
        let (len, _) = parse(page, off, &aligns, target);
        spans.push((off, len));
        off += len;
    }
    let mut order: Vec<usize> = (0..nrec).collect();
    order.sort_by(|&i, &j| {
        let (_, fi) = parse(page, spans[i].0, &aligns, target);
        let (_, fj) = parse(page, spans[j].0, &aligns, target);
        cmp(fi, fj)
    });
    let mut out = Vec::with_capacity(page.len());
    for &i in &order {
        let (s, len) = spans[i];
        out.extend_from_slice(&page[s..s + len]);
    }
    out
}

/// A read cursor over one sorted spool.
struct Run<'a> {
    sp: &'a mut Spool,
    aligns: Aligns,
    target: SortTarget,
    ipage: usize,
    nentry: u64,
    ientry: u64,
    off: usize,
    exhausted: bool,
}

impl<'a> Run<'a> {
    fn new(sp: &'a mut Spool, aligns: Aligns, target: SortTarget) -> Result<Self> {
        let mut run = Run {
            sp,
            aligns,
            target,
            ipage: 0,
            nentry: 0,
            ientry: 0,
            off: 0,
            exhausted: false,
        };
        if run.sp.npages() == 0 {
            run.exhausted = true;
        } else {
            run.nentry = run.sp.load_page(0)?;
            run.exhausted = run.nentry == 0;
        }
        Ok(run)
    }

    fn entry(&self) -> (&[u8], &[u8]) {
        let page = self.sp.page_bytes();
        let (len, field) = parse(page, self.off, &self.aligns, self.target);
        (&page[self.off..self.off + len], field)
    }

    fn advance(&mut self) -> Result<()> {
        let (len, _) = parse(self.sp.page_bytes(), self.off, &self.aligns, self.target);
        self.off += len;
        self.ientry += 1;
        if self.ientry == self.nentry {
            self.ipage += 1;
            if self.ipage < self.sp.npages() {
                self.nentry = self.sp.load_page(self.ipage)?;
                self.ientry = 0;
                self.off = 0;
            } else {
                self.exhausted = true;
            }
        }
        Ok(())
    }
}

/// Merge two sorted spools into a third.
fn merge(
    a: &mut Spool,
    b: &mut Spool,
    dest: &mut Spool,
    aligns: Aligns,
    target: SortTarget,
    cmp: Compare<'_>,
) -> Result<()> {
    let mut a = Run::new(a, aligns, target)?;
    let mut b = Run::new(b, aligns, target)?;
    while !a.exhausted && !b.exhausted {
        let take_a = {
            let (_, fa) = a.entry();
            let (_, fb) = b.entry();
            cmp(fa, fb) != Ordering::Greater
        };
        if take_a {
            dest.add(a.entry().0)?;
            a.advance()?;
        } else {
            dest.add(b.entry().0)?;
            b.advance()?;
        }
    }
    while !a.exhausted {
        dest.add(a.entry().0)?;
        a.advance()?;
    }
    while !b.exhausted {
        dest.add(b.entry().0)?;
        b.advance()?;
    }
    Ok(())
}

/// Sort the values inside every multivalue of a KMV, in place. Both the
/// value bytes and the per-value size array are reordered, page by page.
pub(crate) fn sort_multivalues(kmv: &mut KeyMultiValue, cmp: Compare<'_>) -> Result<()> {
    for ipage in 0..kmv.npages() {
        let nrec = kmv.load_page(ipage)?;
        if nrec == 0 {
            continue;
        }
        // (sizes offset, data offset, value sizes) per record.
        let mut jobs: Vec<(usize, usize, Vec<usize>)> = Vec::new();
        {
            let base = kmv.page_bytes().as_ptr() as usize;
            for rec in kmv.records() {
                match rec {
                    KmvRecord::Inline { values, .. } => {
                        let sizes_off = values.sizes.raw_ptr() as usize - base;
                        let data_off = values.data.as_ptr() as usize - base;
                        jobs.push((sizes_off, data_off, values.sizes.iter().collect()));
                    }
                    KmvRecord::BlockHeader { .. } => {
                        bail!("cannot sort multivalues of a block-split record")
                    }
                }
            }
        }
        let mut scratch: Vec<u8> = Vec::new();
        let page = kmv.page_mut();
        for (sizes_off, data_off, sizes) in &jobs {
            let nv = sizes.len();
            let mut offs = Vec::with_capacity(nv);
            let mut acc = 0usize;
            for &s in sizes {
                offs.push(acc);
                acc += s;
            }
            let mut order: Vec<usize> = (0..nv).collect();
            order.sort_by(|&i, &j| {
                cmp(
                    &page[data_off + offs[i]..data_off + offs[i] + sizes[i]],
                    &page[data_off + offs[j]..data_off + offs[j] + sizes[j]],
                )
            });
            scratch.clear();
            for &k in &order {
                scratch.extend_from_slice(&page[data_off + offs[k]..data_off + offs[k] + sizes[k]]);
            }
            page[*data_off..*data_off + acc].copy_from_slice(&scratch);
            for (i, &k) in order.iter().enumerate() {
                write_i32(page, sizes_off + 4 * i, sizes[k] as i32);
            }
        }
        kmv.overwrite_page(ipage)?;
    }
    Ok(())
}
