//! The KeyMultiValue container: for each distinct key, the list of values
//! grouped under it, packed into fixed-size pages backed by a spill file.
//!
//! A multivalue that fits in one page alongside its key is stored inline.
//! One that does not is stored in block-split form: a header record (the
//! last record on its page) carries the key and a negative value count
//! whose magnitude is the number of following pages devoted to that key;
//! each of those block pages holds a slice of the values, split on value
//! boundaries.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::layout::{
    align_up, block_prefix_size, decode_block_page, kmv_header_size, kmv_inline_size, write_i32,
    Aligns, KmvRecords, ValuesView, FILE_ALIGN, KMV_HEADER,
};
use crate::spill::SpillFile;

/// The values handed to a reduce or compress callback for one key.
///
/// Most multivalues arrive as [`MultiValue::Inline`], a borrowed view of
/// sizes and concatenated bytes. A multivalue too large for one page
/// arrives as [`MultiValue::Blocks`]: the callback pulls the blocks one at
/// a time through the cursor, each loaded into scratch memory on demand.
pub enum MultiValue<'a, 'c> {
    Inline(ValuesView<'a>),
    Blocks(&'a mut BlockCursor<'c>),
}

/// Streams the block pages of one page-spanning multivalue.
pub struct BlockCursor<'a> {
    kmv: &'a mut KeyMultiValue,
    scratch: &'a mut Vec<u8>,
    aligns: Aligns,
    header_page: usize,
    nblocks: usize,
    next: usize,
}

impl<'a> BlockCursor<'a> {
    pub(crate) fn new(
        kmv: &'a mut KeyMultiValue,
        scratch: &'a mut Vec<u8>,
        header_page: usize,
        nblocks: usize,
    ) -> Self {
        let aligns = kmv.aligns();
        BlockCursor {
            kmv,
            scratch,
            aligns,
            header_page,
            nblocks,
            next: 0,
        }
    }

    /// Total number of blocks in this multivalue.
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    /// Load the next block and return a view of its values, or `None`
    /// after the last block.
    pub fn next_block(&mut self) -> Result<Option<ValuesView<'_>>> {
        if self.next == self.nblocks {
            return Ok(None);
        }
        let alignsize = self
            .kmv
            .read_page_into(self.header_page + 1 + self.next, self.scratch)?;
        self.next += 1;
        Ok(Some(decode_block_page(&self.scratch[..alignsize], &self.aligns)))
    }
}

#[derive(Clone, Copy)]
struct Page {
    nrec: u64,
    keysize: u64,
    valuesize: u64,
    exactsize: u64,
    alignsize: usize,
    filesize: usize,
    fileoffset: u64,
}

/// A restartable stream of value byte-slices, consumed by
/// [`KeyMultiValue::add_multivalue`]. `visit` may be called more than once:
/// block-split emission needs one pass to plan page boundaries and one to
/// write them.
pub(crate) trait ValueSource {
    fn nvalues(&self) -> u64;
    fn total_bytes(&self) -> u64;
    fn visit(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;
}

/// Values held as in-memory slices.
pub(crate) struct SliceValues<'a> {
    vals: &'a [&'a [u8]],
}

impl<'a> SliceValues<'a> {
    pub fn new(vals: &'a [&'a [u8]]) -> Self {
        SliceValues { vals }
    }
}

impl ValueSource for SliceValues<'_> {
    fn nvalues(&self) -> u64 {
        self.vals.len() as u64
    }

    fn total_bytes(&self) -> u64 {
        self.vals.iter().map(|v| v.len() as u64).sum()
    }

    fn visit(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        for v in self.vals {
            f(v)?;
        }
        Ok(())
    }
}

pub struct KeyMultiValue {
    aligns: Aligns,
    page_size: usize,
    page: Vec<u8>,

    // accumulation state of the in-memory page
    nkey: u64,
    keysize: u64,
    valuesize: u64,
    exact: u64,
    alignsize: usize,

    pages: Vec<Page>,
    spill: SpillFile,
    cur_page: Option<usize>,

    // container totals, valid after complete()
    nkmv: u64,
    ksize: u64,
    vsize: u64,
    tsize: u64,
}

impl KeyMultiValue {
    pub(crate) fn new(page_size: usize, aligns: Aligns, path: PathBuf) -> Self {
        debug_assert_eq!(page_size % FILE_ALIGN, 0);
        KeyMultiValue {
            aligns,
            page_size,
            page: vec![0u8; page_size],
            nkey: 0,
            keysize: 0,
            valuesize: 0,
            exact: 0,
            alignsize: 0,
            pages: Vec::new(),
            spill: SpillFile::new(path),
            cur_page: None,
            nkmv: 0,
            ksize: 0,
            vsize: 0,
            tsize: 0,
        }
    }

    /// Number of distinct keys across the whole container.
    pub fn nkmv(&self) -> u64 {
        self.nkmv
    }

    pub fn ksize(&self) -> u64 {
        self.ksize
    }

    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    pub fn tsize(&self) -> u64 {
        self.tsize
    }

    pub(crate) fn aligns(&self) -> Aligns {
        self.aligns
    }

    /// Emit one key/multivalue record, choosing inline or block-split form
    /// by whether the packed record fits in one page.
    pub(crate) fn add_multivalue(
        &mut self,
        key: &[u8],
        src: &mut dyn ValueSource,
    ) -> Result<()> {
        let nv = src.nvalues();
        let mv = src.total_bytes();
        if key.len() > i32::MAX as usize || nv > i32::MAX as u64 {
            bail!("key length or value count exceeds i32 range");
        }
        let inline = kmv_inline_size(&self.aligns, key.len(), nv as usize, mv as usize);
        if mv <= i32::MAX as u64 && inline <= self.page_size {
            self.add_inline(key, nv as usize, mv as usize, src)
        } else {
            self.add_blocked(key, nv as usize, mv, src)
        }
    }

    fn add_inline(
        &mut self,
        key: &[u8],
        nv: usize,
        mv: usize,
        src: &mut dyn ValueSource,
    ) -> Result<()> {
        let size = kmv_inline_size(&self.aligns, key.len(), nv, mv);
        if self.alignsize + size > self.page_size {
            self.spill_page()?;
        }
        let at = self.alignsize;
        let sizes_at = at + KMV_HEADER;
        let key_at = align_up(sizes_at + nv * 4, self.aligns.kalign);
        let data_at = align_up(key_at + key.len(), self.aligns.valign);
        {
            let page = &mut self.page;
            write_i32(page, at, key.len() as i32);
            write_i32(page, at + 4, mv as i32);
            write_i32(page, at + 8, nv as i32);
            page[key_at..key_at + key.len()].copy_from_slice(key);
            let mut sz_off = sizes_at;
            let mut d_off = data_at;
            src.visit(&mut |v: &[u8]| {
                write_i32(page, sz_off, v.len() as i32);
                sz_off += 4;
                page[d_off..d_off + v.len()].copy_from_slice(v);
                d_off += v.len();
                Ok(())
            })?;
            debug_assert_eq!(d_off, data_at + mv);
        }
        self.nkey += 1;
        self.keysize += key.len() as u64;
        self.valuesize += mv as u64;
        self.exact += (KMV_HEADER + 4 * nv + key.len() + mv) as u64;
        self.alignsize += size;
        self.cur_page = None;
        Ok(())
    }

    fn add_blocked(
        &mut self,
        key: &[u8],
        nv: usize,
        mv: u64,
        src: &mut dyn ValueSource,
    ) -> Result<()> {
        // Plan pass: collect value lengths, then pack them greedily into
        // block pages split on value boundaries.
        let mut lens: Vec<usize> = Vec::with_capacity(nv);
        src.visit(&mut |v: &[u8]| {
            lens.push(v.len());
            Ok(())
        })?;
        debug_assert_eq!(lens.len(), nv);

        let mut counts: Vec<usize> = Vec::new();
        let mut cnt = 0usize;
        let mut bytes = 0usize;
        for &len in &lens {
            if block_prefix_size(&self.aligns, 1) + len > self.page_size {
                bail!(
                    "single value of {len} bytes exceeds page size {}",
                    self.page_size
                );
            }
            if cnt > 0 && block_prefix_size(&self.aligns, cnt + 1) + bytes + len > self.page_size {
                counts.push(cnt);
                cnt = 0;
                bytes = 0;
            }
            cnt += 1;
            bytes += len;
        }
        if cnt > 0 {
            counts.push(cnt);
        }
        let nblocks = counts.len();

        // Header record: key plus a negative value count. It must be the
        // last record on its page so readers can skip straight over the
        // block pages that follow.
        let hdr = kmv_header_size(&self.aligns, key.len());
        if hdr > self.page_size {
            bail!(
                "single key of {} bytes exceeds page size {}",
                key.len(),
                self.page_size
            );
        }
        if self.alignsize + hdr > self.page_size {
            self.spill_page()?;
        }
        let at = self.alignsize;
        write_i32(&mut self.page, at, key.len() as i32);
        write_i32(&mut self.page, at + 4, mv.min(i32::MAX as u64) as i32);
        write_i32(&mut self.page, at + 8, -(nblocks as i64) as i32);
        let key_at = align_up(at + KMV_HEADER, self.aligns.kalign);
        self.page[key_at..key_at + key.len()].copy_from_slice(key);
        self.nkey += 1;
        self.keysize += key.len() as u64;
        self.exact += (KMV_HEADER + key.len()) as u64;
        self.alignsize += hdr;
        self.spill_page()?;

        // Write pass: stream the values again, one block page at a time.
        let this = &mut *self;
        let mut bi = 0usize;
        let mut vi = 0usize;
        let mut sz_off = 0usize;
        let mut d_off = 0usize;
        src.visit(&mut |v: &[u8]| {
            if vi == 0 {
                let count = counts[bi];
                write_i32(&mut this.page, 0, count as i32);
                sz_off = 4;
                d_off = block_prefix_size(&this.aligns, count);
                this.exact += 4;
            }
            write_i32(&mut this.page, sz_off, v.len() as i32);
            sz_off += 4;
            this.page[d_off..d_off + v.len()].copy_from_slice(v);
            d_off += v.len();
            this.valuesize += v.len() as u64;
            this.exact += 4 + v.len() as u64;
            vi += 1;
            if vi == counts[bi] {
                this.alignsize = d_off;
                this.spill_page()?;
                bi += 1;
                vi = 0;
            }
            Ok(())
        })?;
        debug_assert_eq!(bi, nblocks);
        self.cur_page = None;
        Ok(())
    }

    /// One KMV record per KV record, each with a single value.
    pub(crate) fn clone_from(&mut self, kv: &mut crate::kv::KeyValue) -> Result<()> {
        for i in 0..kv.npages() {
            kv.load_page(i)?;
            for rec in kv.records() {
                let vals = [rec.value];
                self.add_multivalue(rec.key, &mut SliceValues::new(&vals))?;
            }
        }
        Ok(())
    }

    /// One KMV record under the supplied key whose multivalue alternates
    /// every KV record's key and value, in insertion order.
    pub(crate) fn collapse_from(
        &mut self,
        key: &[u8],
        kv: &mut crate::kv::KeyValue,
    ) -> Result<()> {
        if kv.nkv() == 0 {
            return Ok(());
        }
        struct KvPairs<'a> {
            kv: &'a mut crate::kv::KeyValue,
        }
        impl ValueSource for KvPairs<'_> {
            fn nvalues(&self) -> u64 {
                2 * self.kv.nkv()
            }
            fn total_bytes(&self) -> u64 {
                self.kv.ksize() + self.kv.vsize()
            }
            fn visit(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
                for i in 0..self.kv.npages() {
                    self.kv.load_page(i)?;
                    for rec in self.kv.records() {
                        f(rec.key)?;
                        f(rec.value)?;
                    }
                }
                Ok(())
            }
        }
        self.add_multivalue(key, &mut KvPairs { kv })
    }

    /// Page-by-page byte copy of another KMV, replicating its page
    /// descriptors.
    pub(crate) fn copy_from(&mut self, other: &mut KeyMultiValue) -> Result<()> {
        if self.aligns != other.aligns {
            bail!("cannot copy a KeyMultiValue across different alignments");
        }
        let npage = other.npages();
        for i in 0..npage {
            other.load_page(i)?;
            let p = other.pages[i];
            self.page[..p.alignsize].copy_from_slice(&other.page[..p.alignsize]);
            self.nkey = p.nrec;
            self.keysize = p.keysize;
            self.valuesize = p.valuesize;
            self.exact = p.exactsize;
            self.alignsize = p.alignsize;
            if i + 1 < npage {
                self.spill_page()?;
            }
        }
        self.cur_page = None;
        Ok(())
    }

    /// Flush the tail page and close the spill file, then fold the page
    /// descriptors into the container totals.
    pub(crate) fn complete(&mut self) -> Result<()> {
        if self.nkey > 0 || self.alignsize > 0 {
            let desc = self.make_desc();
            if self.spill.exists() {
                self.page[desc.alignsize..desc.filesize].fill(0);
                self.spill.write_page(desc.fileoffset, &self.page[..desc.filesize])?;
                self.spill.close();
            }
            self.cur_page = Some(self.pages.len());
            self.pages.push(desc);
        }
        self.nkey = 0;
        self.keysize = 0;
        self.valuesize = 0;
        self.exact = 0;
        self.alignsize = 0;

        self.nkmv = self.pages.iter().map(|p| p.nrec).sum();
        self.ksize = self.pages.iter().map(|p| p.keysize).sum();
        self.vsize = self.pages.iter().map(|p| p.valuesize).sum();
        self.tsize = self.pages.iter().map(|p| p.exactsize).sum();
        Ok(())
    }

    pub(crate) fn npages(&self) -> usize {
        self.pages.len()
    }

    /// Load page `i` into the working buffer; returns its record count.
    /// Block pages report zero records.
    pub(crate) fn load_page(&mut self, i: usize) -> Result<u64> {
        if self.cur_page != Some(i) {
            let p = &self.pages[i];
            let (offset, filesize) = (p.fileoffset, p.filesize);
            self.spill.read_page(offset, &mut self.page[..filesize])?;
            self.cur_page = Some(i);
        }
        if i + 1 == self.pages.len() {
            self.spill.close();
        }
        Ok(self.pages[i].nrec)
    }

    pub(crate) fn page_bytes(&self) -> &[u8] {
        let p = &self.pages[self.cur_page.expect("no page loaded")];
        &self.page[..p.alignsize]
    }

    /// Decode the records of the loaded page.
    pub(crate) fn records(&self) -> KmvRecords<'_> {
        let p = &self.pages[self.cur_page.expect("no page loaded")];
        KmvRecords::new(&self.page[..p.alignsize], p.nrec, self.aligns)
    }

    /// Move the working buffer out so a caller can hold a page image while
    /// asking this container to read other pages elsewhere.
    pub(crate) fn take_page(&mut self) -> Vec<u8> {
        self.cur_page = None;
        std::mem::take(&mut self.page)
    }

    pub(crate) fn put_page(&mut self, page: Vec<u8>) {
        debug_assert_eq!(page.len(), self.page_size);
        self.page = page;
    }

    /// Read page `i` into a caller-owned buffer without touching the
    /// working page. Used for the block pages of a page-spanning
    /// multivalue, which always live in the spill file.
    pub(crate) fn read_page_into(&mut self, i: usize, buf: &mut Vec<u8>) -> Result<usize> {
        let p = &self.pages[i];
        if !self.spill.exists() {
            bail!("page {i} is not in the spill file");
        }
        if buf.len() < p.filesize {
            buf.resize(p.filesize, 0);
        }
        let (offset, filesize, alignsize) = (p.fileoffset, p.filesize, p.alignsize);
        self.spill.read_page(offset, &mut buf[..filesize])?;
        Ok(alignsize)
    }

    /// Write the working buffer back over page `i` after an in-place
    /// rewrite (value sorting). A container that never spilled keeps its
    /// only page resident, so there is nothing to do.
    pub(crate) fn overwrite_page(&mut self, i: usize) -> Result<()> {
        debug_assert_eq!(self.cur_page, Some(i));
        if !self.spill.exists() {
            return Ok(());
        }
        let p = &self.pages[i];
        let (offset, filesize, alignsize) = (p.fileoffset, p.filesize, p.alignsize);
        self.page[alignsize..filesize].fill(0);
        self.spill.write_page(offset, &self.page[..filesize])?;
        Ok(())
    }

    pub(crate) fn page_mut(&mut self) -> &mut [u8] {
        let p = &self.pages[self.cur_page.expect("no page loaded")];
        let alignsize = p.alignsize;
        &mut self.page[..alignsize]
    }

    fn next_offset(&self) -> u64 {
        match self.pages.last() {
            Some(p) => p.fileoffset + p.filesize as u64,
            None => 0,
        }
    }

    fn make_desc(&self) -> Page {
        Page {
            nrec: self.nkey,
            keysize: self.keysize,
            valuesize: self.valuesize,
            exactsize: self.exact,
            alignsize: self.alignsize,
            filesize: align_up(self.alignsize, FILE_ALIGN),
            fileoffset: self.next_offset(),
        }
    }

    fn spill_page(&mut self) -> Result<()> {
        let desc = self.make_desc();
        self.page[desc.alignsize..desc.filesize].fill(0);
        self.spill.write_page(desc.fileoffset, &self.page[..desc.filesize])?;
        self.pages.push(desc);
        self.nkey = 0;
        self.keysize = 0;
        self.valuesize = 0;
        self.exact = 0;
        self.alignsize = 0;
        Ok(())
    }
}
