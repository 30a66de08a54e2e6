//! Per-container spill files.
//!
//! Each container owns at most one spill file, named
//! `<fpath>/<kind>.<instance>.<rank>`. The file has no header: all
//! structural metadata lives in the in-memory page descriptors. I/O happens
//! in whole page images rounded up to [`FILE_ALIGN`](crate::layout::FILE_ALIGN)
//! bytes, with an explicit seek before every transfer because a partial tail
//! page may be overwritten after an append.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::trace;

pub(crate) struct SpillFile {
    path: PathBuf,
    file: Option<File>,
    created: bool,
}

impl SpillFile {
    /// Lazily bind to `path`. Nothing touches the filesystem until the
    /// first write, so containers that never overflow one page never
    /// create a file.
    pub fn new(path: PathBuf) -> Self {
        SpillFile {
            path,
            file: None,
            created: false,
        }
    }

    /// Whether any page has ever been written.
    pub fn exists(&self) -> bool {
        self.created
    }

    fn open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)
                .with_context(|| format!("could not open spill file {}", self.path.display()))?;
            trace!(path = %self.path.display(), "opened spill file");
            self.file = Some(file);
            self.created = true;
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Write one page image at `offset`. `data` is already rounded up to
    /// the file-alignment unit.
    pub fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.open()?;
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek failed on spill file {}", path.display()))?;
        file.write_all(data)
            .with_context(|| format!("write failed on spill file {}", path.display()))?;
        Ok(())
    }

    /// Read one page image at `offset` into `buf`.
    pub fn read_page(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.open()?;
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek failed on spill file {}", path.display()))?;
        file.read_exact(buf)
            .with_context(|| format!("read failed on spill file {}", path.display()))?;
        Ok(())
    }

    /// Drop the file handle. The file stays on disk; a later access
    /// reopens it.
    pub fn close(&mut self) {
        self.file = None;
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        self.file = None;
        if self.created {
            if let Err(err) = std::fs::remove_file(&self.path) {
                trace!(path = %self.path.display(), %err, "failed to remove spill file");
            }
        }
    }
}
