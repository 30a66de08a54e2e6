//! The KeyValue container: a multiset of key/value records packed into
//! fixed-size pages backed by a spill file.
//!
//! One page lives in memory at a time. Records are appended to it until the
//! next record would not fit, at which point the page image is written to
//! the spill file and the buffer starts over. A container that never
//! overflows a single page never touches the filesystem. After
//! [`complete`](KeyValue::complete), every page is readable through
//! [`load_page`](KeyValue::load_page) / [`records`](KeyValue::records).

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::layout::{
    align_up, encode_kv, kv_record_size, read_i32, Aligns, KvRecords, FILE_ALIGN, TWO_LEN,
};
use crate::spill::SpillFile;

struct Page {
    nrec: u64,
    keysize: u64,
    valuesize: u64,
    exactsize: u64,
    alignsize: usize,
    filesize: usize,
    fileoffset: u64,
}

pub struct KeyValue {
    aligns: Aligns,
    page_size: usize,
    page: Vec<u8>,

    // accumulation state of the in-memory page
    nkey: u64,
    keysize: u64,
    valuesize: u64,
    alignsize: usize,

    pages: Vec<Page>,
    spill: SpillFile,
    /// Which completed page the buffer currently holds, if any.
    cur_page: Option<usize>,

    // container totals, valid after complete()
    nkv: u64,
    ksize: u64,
    vsize: u64,
    tsize: u64,
}

impl KeyValue {
    pub(crate) fn new(page_size: usize, aligns: Aligns, path: PathBuf) -> Self {
        debug_assert_eq!(page_size % FILE_ALIGN, 0);
        KeyValue {
            aligns,
            page_size,
            page: vec![0u8; page_size],
            nkey: 0,
            keysize: 0,
            valuesize: 0,
            alignsize: 0,
            pages: Vec::new(),
            spill: SpillFile::new(path),
            cur_page: None,
            nkv: 0,
            ksize: 0,
            vsize: 0,
            tsize: 0,
        }
    }

    /// Number of records across the whole container.
    pub fn nkv(&self) -> u64 {
        self.nkv
    }

    /// Exact key bytes across the whole container.
    pub fn ksize(&self) -> u64 {
        self.ksize
    }

    /// Exact value bytes across the whole container.
    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    /// Exact data bytes (prefixes + keys + values) across the container.
    pub fn tsize(&self) -> u64 {
        self.tsize
    }

    pub(crate) fn aligns(&self) -> Aligns {
        self.aligns
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Add a single key/value pair.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > i32::MAX as usize || value.len() > i32::MAX as usize {
            bail!("key or value length exceeds i32 range");
        }
        let kvbytes = kv_record_size(&self.aligns, key.len(), value.len());
        if kvbytes > self.page_size {
            bail!(
                "single key/value pair of {kvbytes} bytes exceeds page size {}",
                self.page_size
            );
        }
        if self.alignsize + kvbytes > self.page_size {
            self.spill_page()?;
        }
        let n = encode_kv(&mut self.page, self.alignsize, &self.aligns, key, value);
        self.nkey += 1;
        self.keysize += key.len() as u64;
        self.valuesize += value.len() as u64;
        self.alignsize += n;
        self.cur_page = None;
        Ok(())
    }

    /// Bulk add of key/value pairs.
    pub fn add_pairs<'a, I>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        for (k, v) in pairs {
            self.add(k, v)?;
        }
        Ok(())
    }

    /// Add `n` records from a packed page image with the same alignment as
    /// this container. Scans the image for its exact sizes, then copies it
    /// in page-sized chunks.
    pub(crate) fn add_packed(&mut self, n: u64, buf: &[u8]) -> Result<()> {
        let mut ks = 0u64;
        let mut vs = 0u64;
        let mut off = 0usize;
        for _ in 0..n {
            let kb = read_i32(buf, off) as usize;
            let vb = read_i32(buf, off + 4) as usize;
            ks += kb as u64;
            vs += vb as u64;
            off += kv_record_size(&self.aligns, kb, vb);
        }
        self.add_chunk(n, &buf[..off], ks, vs)
    }

    /// Core of the packed-add path: break `buf` into chunks that fit the
    /// current and successive pages, splitting only on record boundaries.
    pub(crate) fn add_chunk(
        &mut self,
        n: u64,
        buf: &[u8],
        keysize: u64,
        valuesize: u64,
    ) -> Result<()> {
        let mut n = n;
        let mut buf = buf;
        let mut ks = keysize;
        let mut vs = valuesize;

        while self.alignsize + buf.len() > self.page_size {
            let limit = self.page_size - self.alignsize;
            let mut off = 0usize;
            let mut cnt = 0u64;
            let mut cks = 0u64;
            let mut cvs = 0u64;
            while cnt < n {
                let kb = read_i32(buf, off) as usize;
                let vb = read_i32(buf, off + 4) as usize;
                let rec = kv_record_size(&self.aligns, kb, vb);
                if off + rec > limit {
                    if rec > self.page_size {
                        bail!(
                            "single key/value pair of {rec} bytes exceeds page size {}",
                            self.page_size
                        );
                    }
                    break;
                }
                off += rec;
                cnt += 1;
                cks += kb as u64;
                cvs += vb as u64;
            }
            self.page[self.alignsize..self.alignsize + off].copy_from_slice(&buf[..off]);
            self.nkey += cnt;
            self.keysize += cks;
            self.valuesize += cvs;
            self.alignsize += off;
            self.spill_page()?;

            buf = &buf[off..];
            n -= cnt;
            ks -= cks;
            vs -= cvs;
        }

        self.page[self.alignsize..self.alignsize + buf.len()].copy_from_slice(buf);
        self.nkey += n;
        self.keysize += ks;
        self.valuesize += vs;
        self.alignsize += buf.len();
        self.cur_page = None;
        Ok(())
    }

    /// Add every record of another KeyValue. A page-copy fast path applies
    /// when both containers share alignments; otherwise records are
    /// re-encoded one by one.
    pub fn add_kv(&mut self, other: &mut KeyValue) -> Result<()> {
        if self.aligns == other.aligns {
            for i in 0..other.npages() {
                let nrec = other.load_page(i)?;
                let (ks, vs) = other.loaded_page_sizes();
                self.add_chunk(nrec, other.page_bytes(), ks, vs)?;
            }
        } else {
            for i in 0..other.npages() {
                other.load_page(i)?;
                let recs: KvRecords<'_> = other.records();
                for rec in recs {
                    self.add(rec.key, rec.value)?;
                }
            }
        }
        Ok(())
    }

    /// Reopen the container for appending: the last completed page is
    /// reloaded into the buffer and its descriptor is popped, so new
    /// records continue where the container left off.
    pub(crate) fn append(&mut self) -> Result<()> {
        let Some(last) = self.pages.len().checked_sub(1) else {
            return Ok(());
        };
        if self.cur_page != Some(last) {
            self.load_page(last)?;
        }
        let p = self.pages.pop().unwrap();
        self.nkey = p.nrec;
        self.keysize = p.keysize;
        self.valuesize = p.valuesize;
        self.alignsize = p.alignsize;
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
        self.alignsize = 0;

        self.nkv = self.pages.iter().map(|p| p.nrec).sum();
        self.ksize = self.pages.iter().map(|p| p.keysize).sum();
        self.vsize = self.pages.iter().map(|p| p.valuesize).sum();
        self.tsize = self.pages.iter().map(|p| p.exactsize).sum();
        Ok(())
    }

    pub(crate) fn npages(&self) -> usize {
        self.pages.len()
    }

    /// Load page `i` into the working buffer; returns its record count.
    /// Closes the spill file after the last page.
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

    /// Exact (key, value) byte totals of the loaded page.
    pub(crate) fn loaded_page_sizes(&self) -> (u64, u64) {
        let p = &self.pages[self.cur_page.expect("no page loaded")];
        (p.keysize, p.valuesize)
    }

    /// The used bytes of the loaded page.
    pub(crate) fn page_bytes(&self) -> &[u8] {
        let p = &self.pages[self.cur_page.expect("no page loaded")];
        &self.page[..p.alignsize]
    }

    /// Decode the records of the loaded page.
    pub(crate) fn records(&self) -> KvRecords<'_> {
        let p = &self.pages[self.cur_page.expect("no page loaded")];
        KvRecords::new(&self.page[..p.alignsize], p.nrec, self.aligns)
    }

    /// Replace the loaded page's contents with a reordered image of the
    /// same records, writing through to the spill file when one exists.
    pub(crate) fn rewrite_loaded_page(&mut self, data: &[u8]) -> Result<()> {
        let idx = self.cur_page.expect("no page loaded");
        let p = &self.pages[idx];
        debug_assert_eq!(data.len(), p.alignsize);
        let (alignsize, filesize, offset) = (p.alignsize, p.filesize, p.fileoffset);
        self.page[..alignsize].copy_from_slice(data);
        if self.spill.exists() {
            self.page[alignsize..filesize].fill(0);
            self.spill.write_page(offset, &self.page[..filesize])?;
        }
        Ok(())
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
            exactsize: self.nkey * TWO_LEN as u64 + self.keysize + self.valuesize,
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
        self.alignsize = 0;
        Ok(())
    }
}
