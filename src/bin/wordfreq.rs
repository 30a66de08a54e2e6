//! Word frequency over a set of text files: the classic demo chain
//! `map_file_chunks -> collate -> reduce -> gather -> sort_keys`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use itertools::Itertools;
use tracing_subscriber::EnvFilter;

use mrbig::{Fabric, MapMode, MapReduce, MultiValue, Separator, Settings};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input text files
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Number of ranks to run in this process
    #[clap(short, long, default_value_t = 2)]
    ranks: usize,

    /// Per-rank memory slab in MiB
    #[clap(short, long, default_value_t = 64)]
    memsize: u64,

    /// Number of map tasks (defaults to one per rank)
    #[clap(short, long)]
    nmap: Option<u64>,

    /// Scratch directory for spill files
    #[clap(short, long, default_value = ".")]
    fpath: PathBuf,

    /// Operator verbosity (0-2)
    #[clap(short, long, default_value_t = 1)]
    verbosity: u8,

    /// Show only the top N words
    #[clap(short, long, default_value_t = 20)]
    top: usize,
}

fn run_rank(fabric: Fabric, args: &Args) -> Result<()> {
    let me = fabric.rank();
    let settings = Settings {
        memsize: args.memsize,
        verbosity: args.verbosity,
        fpath: args.fpath.clone(),
        ..Settings::default()
    };
    let mut mr = MapReduce::new(Arc::new(fabric), settings)?;

    let nmap = args.nmap.unwrap_or(args.ranks as u64).max(args.files.len() as u64);
    mr.map_file_chunks(
        nmap,
        &args.files,
        Separator::Char(b'\n'),
        4096,
        MapMode::Fresh,
        |_task, chunk, kv| {
            for word in chunk
                .split(|b| !b.is_ascii_alphanumeric())
                .filter(|w| !w.is_empty())
            {
                kv.add(&word.to_ascii_lowercase(), b"")?;
            }
            Ok(())
        },
    )?;

    mr.collate(None)?;
    mr.reduce(|key, values, kv| {
        let count: u64 = match values {
            MultiValue::Inline(v) => v.nvalues() as u64,
            MultiValue::Blocks(cursor) => {
                let mut n = 0u64;
                while let Some(block) = cursor.next_block()? {
                    n += block.nvalues() as u64;
                }
                n
            }
        };
        kv.add(key, &count.to_ne_bytes())
    })?;

    let total = mr.gather(1)?;
    mr.sort_keys(|a, b| a.cmp(b))?;

    // Pull the counts out through a map over the gathered KV.
    let mut counts: Vec<(String, u64)> = Vec::new();
    mr.map_self(MapMode::Fresh, |_, key, value, kv| {
        let n = u64::from_ne_bytes(value.try_into().unwrap());
        counts.push((String::from_utf8_lossy(key).into_owned(), n));
        kv.add(key, value)
    })?;

    if me == 0 {
        println!("{total} distinct words");
        let top = counts
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            .take(args.top);
        for (word, n) in top {
            println!("{n:>8}  {word}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let fabrics = Fabric::group(args.ranks);
    std::thread::scope(|s| {
        let mut handles = Vec::new();
        for fabric in fabrics {
            let args = &args;
            handles.push(s.spawn(move || run_rank(fabric, args)));
        }
        for h in handles {
            h.join().expect("rank thread panicked")?;
        }
        Ok(())
    })
}
