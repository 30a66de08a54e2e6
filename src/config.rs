//! Engine settings.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::layout::Aligns;

const MIB: u64 = 1024 * 1024;

/// How map tasks are handed to ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapStyle {
    /// Contiguous chunk of tasks per rank.
    #[default]
    Chunk,
    /// Round-robin striding of tasks across ranks.
    Stride,
    /// Rank 0 dispatches tasks on demand and performs none itself.
    MasterWorker,
}

/// Per-rank engine configuration.
///
/// `memsize` is the per-rank memory slab in MiB; a quarter of it becomes the
/// working page of each container and half of it is scratch for shuffles,
/// sorts and grouping.
#[derive(Debug, Clone)]
pub struct Settings {
    pub memsize: u64,
    pub keyalign: usize,
    pub valuealign: usize,
    pub mapstyle: MapStyle,
    /// 0 = silent, 1 = per-operator totals, 2 = totals plus per-rank histograms.
    pub verbosity: u8,
    /// 0 = off, 1 = barrier-and-wall per operator, 2 = per-rank time histogram.
    pub timer: u8,
    /// Scratch directory for spill files.
    pub fpath: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            memsize: 64,
            keyalign: 4,
            valuealign: 4,
            mapstyle: MapStyle::Chunk,
            verbosity: 0,
            timer: 0,
            fpath: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Validate the settings and derive the record alignments.
    pub(crate) fn aligns(&self) -> Result<Aligns> {
        if self.memsize == 0 {
            bail!("invalid memsize setting: must be at least 1 MiB");
        }
        Aligns::new(self.keyalign, self.valuealign)
    }

    /// Working-page size: a quarter of the slab.
    pub(crate) fn page_size(&self) -> usize {
        (self.memsize * MIB / 4) as usize
    }

    /// Scratch size: half of the slab.
    pub(crate) fn scratch_size(&self) -> usize {
        (self.memsize * MIB / 2) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.memsize, 64);
        assert_eq!(s.page_size(), 16 * 1024 * 1024);
        assert_eq!(s.scratch_size(), 32 * 1024 * 1024);
        assert!(s.aligns().is_ok());
    }

    #[test]
    fn rejects_zero_memsize() {
        let s = Settings {
            memsize: 0,
            ..Settings::default()
        };
        assert!(s.aligns().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let s = Settings {
            keyalign: 6,
            ..Settings::default()
        };
        assert!(s.aligns().is_err());
    }

    #[test]
    fn page_is_file_aligned() {
        for memsize in [1u64, 2, 3, 64] {
            let s = Settings {
                memsize,
                ..Settings::default()
            };
            assert_eq!(s.page_size() % crate::layout::FILE_ALIGN, 0);
        }
    }
}
