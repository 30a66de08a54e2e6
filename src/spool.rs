//! Append-only page-spilling byte streams.
//!
//! A spool holds a flat sequence of whole records: merge-sort runs and the
//! hash buckets of a local group-by-key. Entries are appended verbatim, one
//! page at a time, and read back page by page after `complete()`. Record
//! sizes are always a multiple of the record alignment, so concatenating
//! entries preserves in-page alignment.

use std::path::PathBuf;

use anyhow::Result;

use crate::layout::{align_up, FILE_ALIGN};
use crate::spill::SpillFile;

struct Page {
    nentry: u64,
    size: usize,
    filesize: usize,
    fileoffset: u64,
}

pub(crate) struct Spool {
    page: Vec<u8>,
    page_size: usize,
    nentry: u64,
    size: usize,
    pages: Vec<Page>,
    spill: SpillFile,
    /// Total entries across all pages, valid after `complete()`.
    pub total_entries: u64,
    /// Total entry bytes across all pages, valid after `complete()`.
    pub total_bytes: u64,
}

impl Spool {
    pub fn new(page_size: usize, path: PathBuf) -> Self {
        Spool {
            page: vec![0u8; page_size],
            page_size,
            nentry: 0,
            size: 0,
            pages: Vec::new(),
            spill: SpillFile::new(path),
            total_entries: 0,
            total_bytes: 0,
        }
    }

    /// Append one entry. An entry larger than the spool page becomes a
    /// page of its own rather than failing.
    pub fn add(&mut self, entry: &[u8]) -> Result<()> {
        if entry.len() > self.page_size {
            self.flush()?;
            self.write_oversize(entry)?;
            return Ok(());
        }
        if self.size + entry.len() > self.page_size {
            self.flush()?;
        }
        self.page[self.size..self.size + entry.len()].copy_from_slice(entry);
        self.size += entry.len();
        self.nentry += 1;
        Ok(())
    }

    fn next_offset(&self) -> u64 {
        match self.pages.last() {
            Some(p) => p.fileoffset + p.filesize as u64,
            None => 0,
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.nentry == 0 {
            return Ok(());
        }
        let filesize = align_up(self.size, FILE_ALIGN);
        self.page[self.size..filesize].fill(0);
        let fileoffset = self.next_offset();
        self.spill.write_page(fileoffset, &self.page[..filesize])?;
        self.pages.push(Page {
            nentry: self.nentry,
            size: self.size,
            filesize,
            fileoffset,
        });
        self.nentry = 0;
        self.size = 0;
        Ok(())
    }

    fn write_oversize(&mut self, entry: &[u8]) -> Result<()> {
        let filesize = align_up(entry.len(), FILE_ALIGN);
        let mut buf = vec![0u8; filesize];
        buf[..entry.len()].copy_from_slice(entry);
        let fileoffset = self.next_offset();
        self.spill.write_page(fileoffset, &buf)?;
        self.pages.push(Page {
            nentry: 1,
            size: entry.len(),
            filesize,
            fileoffset,
        });
        Ok(())
    }

    /// Flush the tail page and close the file. Every page, including the
    /// last, is on disk afterwards.
    pub fn complete(&mut self) -> Result<()> {
        self.flush()?;
        self.spill.close();
        self.total_entries = self.pages.iter().map(|p| p.nentry).sum();
        self.total_bytes = self.pages.iter().map(|p| p.size as u64).sum();
        Ok(())
    }

    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    /// Load page `i` into the working buffer and return its entry count.
    pub fn load_page(&mut self, i: usize) -> Result<u64> {
        let p = &self.pages[i];
        if self.page.len() < p.filesize {
            self.page.resize(p.filesize, 0);
        }
        let (offset, filesize, nentry) = (p.fileoffset, p.filesize, p.nentry);
        self.spill.read_page(offset, &mut self.page[..filesize])?;
        if i + 1 == self.pages.len() {
            self.spill.close();
        }
        self.size = self.pages[i].size;
        Ok(nentry)
    }

    /// The used bytes of the currently loaded page.
    pub fn page_bytes(&self) -> &[u8] {
        &self.page[..self.size]
    }
}
