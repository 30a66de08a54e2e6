//! End-to-end scenarios over single- and multi-rank groups.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use mrbig::{
    ihash, Fabric, MapMode, MapReduce, MapStyle, MultiValue, Separator, Settings,
};

fn settings(dir: &std::path::Path) -> Settings {
    Settings {
        memsize: 1,
        fpath: dir.to_path_buf(),
        ..Settings::default()
    }
}

fn solo_engine(dir: &std::path::Path) -> MapReduce {
    MapReduce::new(Arc::new(Fabric::solo()), settings(dir)).unwrap()
}

/// Run one closure per rank on its own thread.
fn run_ranks<F>(n: usize, f: F)
where
    F: Fn(Fabric) + Sync,
{
    let fabrics = Fabric::group(n);
    std::thread::scope(|s| {
        for fabric in fabrics {
            s.spawn(|| f(fabric));
        }
    });
}

/// Drain the engine's KeyValue into owned pairs, leaving it intact.
fn collect(mr: &mut MapReduce) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    mr.map_self(MapMode::Fresh, |_, key, value, kv| {
        out.push((key.to_vec(), value.to_vec()));
        kv.add(key, value)
    })
    .unwrap();
    out
}

fn write_file(dir: &std::path::Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

fn count_values(values: MultiValue<'_, '_>) -> Result<u64> {
    Ok(match values {
        MultiValue::Inline(v) => v.nvalues() as u64,
        MultiValue::Blocks(cursor) => {
            let mut n = 0u64;
            while let Some(block) = cursor.next_block()? {
                n += block.nvalues() as u64;
            }
            n
        }
    })
}

#[test]
fn word_frequency_across_two_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let f1 = write_file(dir.path(), "one.txt", "a b a");
    let f2 = write_file(dir.path(), "two.txt", "b c");
    let files = vec![f1, f2];
    let dirpath = dir.path().to_path_buf();

    run_ranks(2, |fabric| {
        let me = fabric.rank();
        let mut mr = MapReduce::new(Arc::new(fabric), settings(&dirpath)).unwrap();
        mr.map_files(&files, MapMode::Fresh, |_, path, kv| {
            let text = std::fs::read_to_string(path)?;
            for word in text.split_whitespace() {
                kv.add(word.as_bytes(), b"")?;
            }
            Ok(())
        })
        .unwrap();

        mr.collate(None).unwrap();
        let distinct = mr
            .reduce(|key, values, kv| {
                let n = count_values(values)?;
                kv.add(key, &n.to_ne_bytes())
            })
            .unwrap();
        assert_eq!(distinct, 3);

        mr.gather(1).unwrap();
        let counts: BTreeMap<String, u64> = collect(&mut mr)
            .into_iter()
            .map(|(k, v)| {
                (
                    String::from_utf8(k).unwrap(),
                    u64::from_ne_bytes(v.as_slice().try_into().unwrap()),
                )
            })
            .collect();
        if me == 0 {
            let want: BTreeMap<String, u64> =
                [("a", 2u64), ("b", 2), ("c", 1)]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
            assert_eq!(counts, want);
        } else {
            assert!(counts.is_empty());
        }
    });
}

#[test]
fn clone_then_reduce_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    let input: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (b"x".to_vec(), vec![1]),
        (b"y".to_vec(), vec![2]),
        (b"x".to_vec(), vec![3]),
    ];
    let pairs = input.clone();
    mr.map_tasks(1, MapMode::Fresh, move |_, kv| {
        for (k, v) in &pairs {
            kv.add(k, v)?;
        }
        Ok(())
    })
    .unwrap();

    mr.clone_kv().unwrap();
    mr.reduce(|key, values, kv| {
        match values {
            MultiValue::Inline(v) => {
                assert_eq!(v.nvalues(), 1);
                kv.add(key, v.iter().next().unwrap())
            }
            MultiValue::Blocks(_) => unreachable!("clone never block-splits"),
        }
    })
    .unwrap();

    let mut got = collect(&mut mr);
    let mut want = input;
    got.sort();
    want.sort();
    assert_eq!(got, want);
}

#[test]
fn aggregate_colocates_keys() {
    let dir = tempfile::tempdir().unwrap();
    let dirpath = dir.path().to_path_buf();
    run_ranks(2, |fabric| {
        let me = fabric.rank();
        let mut mr = MapReduce::new(Arc::new(fabric), settings(&dirpath)).unwrap();
        mr.map_tasks(1, MapMode::Fresh, |_, kv| {
            if me == 0 {
                kv.add(b"a", &[1])?;
                kv.add(b"b", &[2])?;
            } else {
                kv.add(b"a", &[3])?;
                kv.add(b"c", &[4])?;
            }
            Ok(())
        })
        .unwrap();

        let total = mr.aggregate(None).unwrap();
        assert_eq!(total, 4);

        let local = collect(&mut mr);
        // Every local record belongs here, and the rank owning "a" holds
        // both copies.
        for (key, _) in &local {
            assert_eq!(ihash(key) as usize % 2, me);
        }
        let n_a = local.iter().filter(|(k, _)| k == b"a").count();
        if ihash(b"a") as usize % 2 == me {
            assert_eq!(n_a, 2);
        } else {
            assert_eq!(n_a, 0);
        }
    });
}

#[test]
fn collapse_preserves_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    mr.map_tasks(1, MapMode::Fresh, |_, kv| {
        kv.add(b"p", &10u32.to_ne_bytes())?;
        kv.add(b"q", &20u32.to_ne_bytes())
    })
    .unwrap();

    let nkeys = mr.collapse(b"all").unwrap();
    assert_eq!(nkeys, 1);

    mr.reduce(|key, values, kv| {
        assert_eq!(key, b"all");
        match values {
            MultiValue::Inline(v) => {
                let got: Vec<Vec<u8>> = v.iter().map(|x| x.to_vec()).collect();
                assert_eq!(
                    got,
                    vec![
                        b"p".to_vec(),
                        10u32.to_ne_bytes().to_vec(),
                        b"q".to_vec(),
                        20u32.to_ne_bytes().to_vec(),
                    ]
                );
            }
            MultiValue::Blocks(_) => unreachable!("small collapse stays inline"),
        }
        kv.add(key, b"")
    })
    .unwrap();
}

#[test]
fn block_split_multivalue_reaches_reduce() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    // Page is 256 KiB at memsize 1. Twelve 65024-byte values for one key
    // exceed both the page and the scratch half, forcing block-split mode
    // with four values per block.
    let vlen = 65024usize;
    mr.map_tasks(1, MapMode::Fresh, move |_, kv| {
        for i in 0..12u8 {
            kv.add(b"k", &vec![i; vlen])?;
        }
        Ok(())
    })
    .unwrap();

    mr.convert().unwrap();

    let mut seen_blocks = 0usize;
    let mut seen_values: Vec<u8> = Vec::new();
    mr.reduce(|key, values, kv| {
        assert_eq!(key, b"k");
        match values {
            MultiValue::Blocks(cursor) => {
                seen_blocks = cursor.nblocks();
                while let Some(block) = cursor.next_block()? {
                    for v in block.iter() {
                        assert_eq!(v.len(), vlen);
                        seen_values.push(v[0]);
                    }
                }
            }
            MultiValue::Inline(_) => panic!("multivalue should have block-split"),
        }
        kv.add(key, b"done")
    })
    .unwrap();

    assert_eq!(seen_blocks, 3);
    assert_eq!(seen_values, (0..12u8).collect::<Vec<u8>>());
}

#[test]
fn sort_values_over_spilled_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    // 1000 records of ~800 bytes spill across several 256 KiB pages.
    mr.map_tasks(1, MapMode::Fresh, |_, kv| {
        for i in 0..1000u32 {
            let x = i.wrapping_mul(2654435761) % 100_000;
            let mut value = vec![0u8; 800];
            value[..4].copy_from_slice(&x.to_ne_bytes());
            kv.add(&i.to_ne_bytes(), &value)?;
        }
        Ok(())
    })
    .unwrap();

    let total = mr
        .sort_values(|a, b| {
            let x = u32::from_ne_bytes(a[..4].try_into().unwrap());
            let y = u32::from_ne_bytes(b[..4].try_into().unwrap());
            x.cmp(&y)
        })
        .unwrap();
    assert_eq!(total, 1000);

    let vals: Vec<u32> = collect(&mut mr)
        .into_iter()
        .map(|(_, v)| u32::from_ne_bytes(v[..4].try_into().unwrap()))
        .collect();
    assert_eq!(vals.len(), 1000);
    assert!(vals.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn compress_on_unique_keys_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    mr.map_tasks(1, MapMode::Fresh, |_, kv| {
        for i in 0..50u32 {
            kv.add(&i.to_ne_bytes(), &vec![i as u8; 9])?;
        }
        Ok(())
    })
    .unwrap();
    let before = collect(&mut mr);

    let total = mr
        .compress(|key, values, kv| {
            let n = count_values(values)?;
            assert_eq!(n, 1);
            kv.add(key, &vec![key[0]; 9])
        })
        .unwrap();
    assert_eq!(total, 50);

    let mut got = collect(&mut mr);
    let mut want = before;
    got.sort();
    want.sort();
    assert_eq!(got, want);
}

#[test]
fn collate_equals_aggregate_then_convert() {
    let dir = tempfile::tempdir().unwrap();
    let dirpath = dir.path().to_path_buf();
    run_ranks(2, |fabric| {
        let me = fabric.rank();
        let fabric = Arc::new(fabric);
        let fill = |mr: &mut MapReduce| {
            mr.map_tasks(1, MapMode::Fresh, |_, kv| {
                for i in 0..40u32 {
                    let key = format!("k{}", (i + me as u32 * 7) % 11);
                    kv.add(key.as_bytes(), &i.to_ne_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        };
        let summarize = |mr: &mut MapReduce| -> BTreeMap<Vec<u8>, Vec<Vec<u8>>> {
            mr.reduce(|key, values, kv| {
                match values {
                    MultiValue::Inline(v) => {
                        let mut vals: Vec<Vec<u8>> =
                            v.iter().map(|x| x.to_vec()).collect();
                        vals.sort();
                        for val in &vals {
                            kv.add(key, val)?;
                        }
                    }
                    MultiValue::Blocks(_) => unreachable!("groups stay inline here"),
                }
                Ok(())
            })
            .unwrap();
            let mut out: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();
            for (k, v) in collect(mr) {
                out.entry(k).or_default().push(v);
            }
            out.values_mut().for_each(|v| v.sort());
            out
        };

        let mut via_collate = MapReduce::new(Arc::clone(&fabric), settings(&dirpath)).unwrap();
        fill(&mut via_collate);
        via_collate.collate(None).unwrap();
        let a = summarize(&mut via_collate);

        let mut via_steps = MapReduce::new(Arc::clone(&fabric), settings(&dirpath)).unwrap();
        fill(&mut via_steps);
        via_steps.aggregate(None).unwrap();
        via_steps.convert().unwrap();
        let b = summarize(&mut via_steps);

        assert_eq!(a, b);
    });
}

#[test]
fn scrunch_concentrates_on_low_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let dirpath = dir.path().to_path_buf();
    run_ranks(3, |fabric| {
        let me = fabric.rank();
        let mut mr = MapReduce::new(Arc::new(fabric), settings(&dirpath)).unwrap();
        mr.map_tasks(1, MapMode::Fresh, |_, kv| {
            for i in 0..5u8 {
                kv.add(&[me as u8, i], &[i])?;
            }
            Ok(())
        })
        .unwrap();

        let nkeys = mr.scrunch(1, b"g").unwrap();
        assert_eq!(nkeys, 1);

        let mut groups = 0usize;
        let mut nvals = 0u64;
        mr.reduce(|key, values, kv| {
            assert_eq!(key, b"g");
            groups += 1;
            nvals += count_values(values)?;
            kv.add(key, b"")
        })
        .unwrap();
        if me == 0 {
            assert_eq!(groups, 1);
            // 15 records from 3 ranks, each contributing key and value.
            assert_eq!(nvals, 30);
        } else {
            assert_eq!(groups, 0);
        }
    });
}

#[test]
fn master_worker_runs_every_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let dirpath = dir.path().to_path_buf();
    run_ranks(3, |fabric| {
        let me = fabric.rank();
        let mut s = settings(&dirpath);
        s.mapstyle = MapStyle::MasterWorker;
        let mut mr = MapReduce::new(Arc::new(fabric), s).unwrap();
        let total = mr
            .map_tasks(10, MapMode::Fresh, |itask, kv| {
                kv.add(&itask.to_ne_bytes(), b"")
            })
            .unwrap();
        assert_eq!(total, 10);
        let local = collect(&mut mr);
        if me == 0 {
            // The master performs no tasks itself.
            assert!(local.is_empty());
        }

        // Every task id 0..10 appears exactly once across the group.
        mr.gather(1).unwrap();
        let gathered = collect(&mut mr);
        if me == 0 {
            let mut ids: Vec<u64> = gathered
                .into_iter()
                .map(|(k, _)| u64::from_ne_bytes(k.as_slice().try_into().unwrap()))
                .collect();
            ids.sort();
            assert_eq!(ids, (0..10).collect::<Vec<u64>>());
        }
    });
}

#[test]
fn append_mode_extends_the_kv() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    mr.map_tasks(3, MapMode::Fresh, |t, kv| kv.add(&[t as u8], b"first"))
        .unwrap();
    let total = mr
        .map_tasks(3, MapMode::Append, |t, kv| kv.add(&[t as u8 + 10], b"second"))
        .unwrap();
    assert_eq!(total, 6);

    let got = collect(&mut mr);
    assert_eq!(got.len(), 6);
}

#[test]
fn empty_kv_through_shuffle_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let dirpath = dir.path().to_path_buf();
    run_ranks(2, |fabric| {
        let mut mr = MapReduce::new(Arc::new(fabric), settings(&dirpath)).unwrap();
        let total = mr.map_tasks(0, MapMode::Fresh, |_, _| Ok(())).unwrap();
        assert_eq!(total, 0);
        assert_eq!(mr.aggregate(None).unwrap(), 0);
        assert_eq!(mr.convert().unwrap(), 0);
        assert_eq!(mr.reduce(|_, _, _| Ok(())).unwrap(), 0);
    });
}

#[test]
fn operators_demand_the_right_container() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    assert!(mr.aggregate(None).is_err());
    assert!(mr.convert().is_err());
    assert!(mr.reduce(|_, _, _| Ok(())).is_err());
    assert!(mr.sort_keys(|a, b| a.cmp(b)).is_err());

    mr.map_tasks(1, MapMode::Fresh, |_, kv| kv.add(b"k", b"v"))
        .unwrap();
    // A KV is live; KMV-only operators must refuse.
    assert!(mr.sort_multivalues(|a, b| a.cmp(b)).is_err());
    mr.convert().unwrap();
    // Now a KMV is live; KV-only operators must refuse.
    assert!(mr.aggregate(None).is_err());
    assert!(mr.sort_keys(|a, b| a.cmp(b)).is_err());
}

#[test]
fn engine_copy_duplicates_the_container() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    mr.map_tasks(1, MapMode::Fresh, |_, kv| {
        for i in 0..20u8 {
            kv.add(&[i], &[i, i])?;
        }
        Ok(())
    })
    .unwrap();

    let mut dup = mr.copy().unwrap();
    let a = collect(&mut mr);
    let b = collect(&mut dup);
    assert_eq!(a, b);

    // The copies are independent.
    dup.map_tasks(1, MapMode::Append, |_, kv| kv.add(b"extra", b""))
        .unwrap();
    assert_eq!(collect(&mut dup).len(), 21);
    assert_eq!(collect(&mut mr).len(), 20);
}

#[test]
fn add_merges_two_engines() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = solo_engine(dir.path());
    let mut b = solo_engine(dir.path());
    a.map_tasks(1, MapMode::Fresh, |_, kv| kv.add(b"one", b"1")).unwrap();
    b.map_tasks(1, MapMode::Fresh, |_, kv| kv.add(b"two", b"2")).unwrap();

    let total = a.add(&mut b).unwrap();
    assert_eq!(total, 2);
    let mut got = collect(&mut a);
    got.sort();
    assert_eq!(
        got,
        vec![
            (b"one".to_vec(), b"1".to_vec()),
            (b"two".to_vec(), b"2".to_vec()),
        ]
    );
    // The source engine keeps its records.
    assert_eq!(collect(&mut b).len(), 1);
}

#[test]
fn map_kv_feeds_one_engine_from_another() {
    let dir = tempfile::tempdir().unwrap();
    let mut src = solo_engine(dir.path());
    src.map_tasks(1, MapMode::Fresh, |_, kv| {
        for i in 0..10u8 {
            kv.add(&[i], &[i; 4])?;
        }
        Ok(())
    })
    .unwrap();

    let mut dst = solo_engine(dir.path());
    let total = dst
        .map_kv(&mut src, MapMode::Fresh, |_, key, value, kv| {
            // Swap key and value.
            kv.add(value, key)
        })
        .unwrap();
    assert_eq!(total, 10);

    let got = collect(&mut dst);
    for (i, (k, v)) in got.iter().enumerate() {
        assert_eq!(k, &[i as u8; 4]);
        assert_eq!(v, &[i as u8]);
    }
    // The source keeps its KeyValue.
    assert_eq!(collect(&mut src).len(), 10);
}

#[test]
fn strided_dispatch_covers_all_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let dirpath = dir.path().to_path_buf();
    run_ranks(3, |fabric| {
        let mut s = settings(&dirpath);
        s.mapstyle = MapStyle::Stride;
        let mut mr = MapReduce::new(Arc::new(fabric), s).unwrap();
        let me = mr.rank() as u64;
        let total = mr
            .map_tasks(11, MapMode::Fresh, |itask, kv| {
                assert_eq!(itask % 3, me);
                kv.add(&itask.to_ne_bytes(), b"")
            })
            .unwrap();
        assert_eq!(total, 11);
    });
}

#[test]
fn sort_keys_orders_ties_and_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut mr = solo_engine(dir.path());
    mr.map_tasks(1, MapMode::Fresh, |_, kv| {
        for i in (0..600u32).rev() {
            let key = (i % 7) as u8;
            let mut value = vec![0u8; 800];
            value[..4].copy_from_slice(&i.to_ne_bytes());
            kv.add(&[key], &value)?;
        }
        Ok(())
    })
    .unwrap();

    mr.sort_keys(|a, b| a.cmp(b)).unwrap();

    let keys: Vec<u8> = collect(&mut mr).into_iter().map(|(k, _)| k[0]).collect();
    assert_eq!(keys.len(), 600);
    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn stats_and_timers_run_collectively() {
    let dir = tempfile::tempdir().unwrap();
    let dirpath = dir.path().to_path_buf();
    run_ranks(2, |fabric| {
        let mut s = settings(&dirpath);
        s.verbosity = 2;
        s.timer = 2;
        let mut mr = MapReduce::new(Arc::new(fabric), s).unwrap();
        mr.map_tasks(4, MapMode::Fresh, |t, kv| {
            kv.add(&[(t % 3) as u8], &t.to_ne_bytes())
        })
        .unwrap();
        mr.kv_stats(2).unwrap();
        mr.collate(None).unwrap();
        mr.kmv_stats(2).unwrap();
        let total = mr
            .reduce(|key, values, kv| {
                let n = count_values(values)?;
                kv.add(key, &n.to_ne_bytes())
            })
            .unwrap();
        assert_eq!(total, 3);
    });
}

#[test]
fn file_chunk_map_counts_every_line() {
    let dir = tempfile::tempdir().unwrap();
    let text: String = (0..500).map(|i| format!("line-{i}\n")).collect();
    let path = write_file(dir.path(), "lines.txt", &text);
    let dirpath = dir.path().to_path_buf();
    let files = vec![path];

    run_ranks(2, |fabric| {
        let mut mr = MapReduce::new(Arc::new(fabric), settings(&dirpath)).unwrap();
        let total = mr
            .map_file_chunks(
                4,
                &files,
                Separator::Char(b'\n'),
                64,
                MapMode::Fresh,
                |_, chunk, kv| {
                    for line in chunk.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
                        kv.add(line, b"")?;
                    }
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(total, 500);
    });
}
