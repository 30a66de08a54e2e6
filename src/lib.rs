//! An out-of-core MapReduce engine.
//!
//! Applications build, shuffle, group and reduce opaque byte-keyed records
//! across a fixed group of ranks. Data sets much larger than one rank's
//! memory are handled by packing records into fixed-size pages that spill
//! to local disk and stream back in; the engine owns at most one live
//! [`KeyValue`] or [`KeyMultiValue`] per rank and sequences the operators
//! over them.
//!
//! A canonical chain looks like:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mrbig::{Fabric, MapMode, MapReduce, MultiValue, Settings};
//! # fn main() -> anyhow::Result<()> {
//! let fabric = Arc::new(Fabric::solo());
//! let mut mr = MapReduce::new(fabric, Settings::default())?;
//! mr.map_tasks(10, MapMode::Fresh, |task, kv| {
//!     kv.add(format!("key-{}", task % 3).as_bytes(), &task.to_ne_bytes())
//! })?;
//! mr.collate(None)?;
//! mr.reduce(|key, values, kv| {
//!     let n = match values {
//!         MultiValue::Inline(v) => v.nvalues() as u64,
//!         MultiValue::Blocks(_) => unreachable!("small groups stay inline"),
//!     };
//!     kv.add(key, &n.to_ne_bytes())
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! Keys and values are borrowed byte ranges for the duration of a
//! callback; callbacks must not retain them across returns.

use std::hash::Hasher;

pub mod config;
mod convert;
pub mod engine;
pub mod fabric;
pub mod filemap;
mod irregular;
pub mod kmv;
pub mod kv;
pub mod layout;
mod sort;
mod spill;
mod spool;

pub use config::{MapStyle, Settings};
pub use engine::{MapMode, MapReduce};
pub use fabric::Fabric;
pub use filemap::Separator;
pub use kmv::{BlockCursor, KeyMultiValue, MultiValue};
pub use kv::KeyValue;
pub use layout::{SizesView, ValuesView};

/// Hashes a key to pick its home rank during a shuffle: records land on
/// rank `ihash(key) % nranks` unless the caller supplies its own hash.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    let value = hasher.finish() & 0x7fffffff;
    u32::try_from(value).expect("Failed to compute ihash of value")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihash_is_deterministic_and_spread() {
        assert_eq!(ihash(b"a"), ihash(b"a"));
        assert_ne!(ihash(b"a"), ihash(b"b"));
        // Stays in the positive i32 range for callers that mod by nranks.
        for k in 0..100u32 {
            assert!(ihash(&k.to_ne_bytes()) <= 0x7fffffff);
        }
    }
}
