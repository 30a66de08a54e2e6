//! Splitting a set of input files into byte chunks for file-chunk maps.
//!
//! The union of the named files is divided into roughly equal tasks. Each
//! task reads its chunk plus `delta` extra bytes and trims at separator
//! occurrences so that separator-delimited records are never split across
//! two chunks: a non-first task drops everything up to the first separator,
//! a non-last task cuts at the first separator past its nominal end.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// The record separator a chunk boundary snaps to. With a `Char`
/// separator the chunk starts after the separator byte; with a `Str`
/// separator it starts at the separator itself.
#[derive(Debug, Clone)]
pub enum Separator {
    Char(u8),
    Str(Vec<u8>),
}

impl Separator {
    fn find(&self, hay: &[u8]) -> Option<usize> {
        match self {
            Separator::Char(c) => hay.iter().position(|b| b == c),
            Separator::Str(s) => hay.windows(s.len()).position(|w| w == &s[..]),
        }
    }
}

#[derive(Debug)]
pub(crate) struct FileMap {
    files: Vec<PathBuf>,
    sizes: Vec<u64>,
    sep: Separator,
    delta: usize,
    tasks_per_file: Vec<usize>,
    which_file: Vec<usize>,
    which_task: Vec<usize>,
}

impl FileMap {
    /// Divide `files` into about `nmap` tasks. Files too small to carry
    /// the `delta` overlap get fewer tasks, with a warning.
    pub fn build(
        files: Vec<PathBuf>,
        sizes: Vec<u64>,
        nmap: usize,
        sep: Separator,
        delta: usize,
        log_shrink: bool,
    ) -> Result<FileMap> {
        let nfiles = files.len();
        if nfiles == 0 {
            bail!("cannot map an empty file list");
        }
        if nfiles > nmap {
            bail!("cannot map with more files ({nfiles}) than tasks ({nmap})");
        }

        let ntotal: u64 = sizes.iter().sum();
        let nideal = (ntotal / nmap as u64).max(1);

        let mut tasks_per_file: Vec<usize> =
            sizes.iter().map(|&s| ((s / nideal) as usize).max(1)).collect();
        let mut ntasks: usize = tasks_per_file.iter().sum();

        while ntasks < nmap {
            let mut progressed = false;
            for (i, t) in tasks_per_file.iter_mut().enumerate() {
                if sizes[i] > nideal {
                    *t += 1;
                    ntasks += 1;
                    progressed = true;
                    if ntasks == nmap {
                        break;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        while ntasks > nmap {
            let mut progressed = false;
            for t in tasks_per_file.iter_mut() {
                if *t > 1 {
                    *t -= 1;
                    ntasks -= 1;
                    progressed = true;
                    if ntasks == nmap {
                        break;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        // A task smaller than delta would make the overlap read cross more
        // than one neighbouring task; shrink such files to fewer tasks.
        let mut shrunk = false;
        for (i, t) in tasks_per_file.iter_mut().enumerate() {
            while *t > 1 && sizes[i] / *t as u64 <= delta as u64 {
                *t -= 1;
                ntasks -= 1;
                shrunk = true;
            }
        }
        if shrunk && log_shrink {
            warn!(
                ntasks,
                "input files too small for the chunk delta, decreased map task count"
            );
        }

        let mut which_file = Vec::with_capacity(ntasks);
        let mut which_task = Vec::with_capacity(ntasks);
        for (i, &t) in tasks_per_file.iter().enumerate() {
            for j in 0..t {
                which_file.push(i);
                which_task.push(j);
            }
        }

        Ok(FileMap {
            files,
            sizes,
            sep,
            delta,
            tasks_per_file,
            which_file,
            which_task,
        })
    }

    pub fn ntasks(&self) -> usize {
        self.which_file.len()
    }

    /// Read and trim the chunk for task `itask`.
    pub fn read_chunk(&self, itask: usize) -> Result<Vec<u8>> {
        let fi = self.which_file[itask];
        let ti = self.which_task[itask];
        let ntask = self.tasks_per_file[fi];
        let filesize = self.sizes[fi];

        let readstart = ti as u64 * filesize / ntask as u64;
        let readnext = (ti + 1) as u64 * filesize / ntask as u64;
        let readsize =
            (((readnext - readstart) as usize + self.delta) as u64).min(filesize - readstart);

        let path = &self.files[fi];
        let mut file = File::open(path)
            .with_context(|| format!("could not open input file {}", path.display()))?;
        file.seek(SeekFrom::Start(readstart))
            .with_context(|| format!("seek failed on input file {}", path.display()))?;
        let mut buf = vec![0u8; readsize as usize];
        file.read_exact(&mut buf)
            .with_context(|| format!("read failed on input file {}", path.display()))?;

        // Trim the head of every task but the first in a file.
        let mut start = 0usize;
        if ti > 0 {
            let pos = self
                .sep
                .find(&buf)
                .filter(|&p| p <= self.delta)
                .with_context(|| {
                    format!("could not find separator within delta in {}", path.display())
                })?;
            start = match self.sep {
                Separator::Char(_) => pos + 1,
                Separator::Str(_) => pos,
            };
        }

        // Trim the tail of every task but the last in a file.
        let mut stop = buf.len();
        if ti < ntask - 1 {
            let from = (readnext - readstart) as usize;
            let pos = self.sep.find(&buf[from..]).with_context(|| {
                format!("could not find separator within delta in {}", path.display())
            })?;
            stop = match self.sep {
                Separator::Char(_) => from + pos + 1,
                Separator::Str(_) => from + pos,
            };
        }

        Ok(buf[start..stop].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[test]
    fn chunks_cover_file_without_splitting_words() {
        let dir = tempfile::tempdir().unwrap();
        let text: String = (0..200).map(|i| format!("word{i} ")).collect();
        let path = write_file(dir.path(), "in.txt", text.as_bytes());

        let fm = FileMap::build(
            vec![path],
            vec![text.len() as u64],
            4,
            Separator::Char(b' '),
            32,
            false,
        )
        .unwrap();
        assert_eq!(fm.ntasks(), 4);

        let mut reassembled = String::new();
        for t in 0..fm.ntasks() {
            let chunk = fm.read_chunk(t).unwrap();
            reassembled.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        // Every word survives exactly once.
        let words: Vec<&str> = reassembled.split_whitespace().collect();
        assert_eq!(words.len(), 200);
        for (i, w) in words.iter().enumerate() {
            assert_eq!(*w, format!("word{i}"));
        }
    }

    #[test]
    fn string_separator_keeps_delimiter_with_next_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let text = b"aaaa|SEP|bbbb|SEP|cccc|SEP|dddd".to_vec();
        let path = write_file(dir.path(), "in.txt", &text);

        let fm = FileMap::build(
            vec![path],
            vec![text.len() as u64],
            2,
            Separator::Str(b"|SEP|".to_vec()),
            12,
            false,
        )
        .unwrap();
        assert_eq!(fm.ntasks(), 2);

        let c0 = fm.read_chunk(0).unwrap();
        let c1 = fm.read_chunk(1).unwrap();
        let mut joined = c0.clone();
        joined.extend_from_slice(&c1);
        assert_eq!(joined, text);
        // The second chunk begins at a separator.
        assert!(c1.starts_with(b"|SEP|"));
    }

    #[test]
    fn small_file_shrinks_task_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "tiny.txt", b"a b c");
        let fm = FileMap::build(
            vec![path],
            vec![5],
            4,
            Separator::Char(b' '),
            64,
            false,
        )
        .unwrap();
        assert_eq!(fm.ntasks(), 1);
        assert_eq!(fm.read_chunk(0).unwrap(), b"a b c");
    }

    #[test]
    fn more_files_than_tasks_is_an_error() {
        let err = FileMap::build(
            vec![PathBuf::from("a"), PathBuf::from("b")],
            vec![1, 1],
            1,
            Separator::Char(b' '),
            1,
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more files"));
    }
}
