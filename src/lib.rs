//! A sharded concurrent hash map whose capacity changes online.
//!
//! `molt` maps hashable keys to values and is safe to share between any number
//! of threads. Internally the map is split into buckets, each guarded by its
//! own reader-writer lock, so threads operating on different keys rarely
//! contend. The bucket array itself is not fixed: as the population grows or
//! shrinks, the map publishes a new *generation* of the table, with twice or
//! half as many buckets, and migrates entries over while readers and writers
//! keep going.
//!
//! Migration is incremental. A background worker sweeps the new generation
//! bucket by bucket, and any operation that routes into a not-yet-populated
//! bucket pulls the relevant entries over on the spot, so no operation ever
//! waits for the whole table to be rebuilt. Source buckets in the retired
//! generation are frozen once their contents have been committed; a writer
//! that raced the handoff and still holds a stale route simply observes the
//! freeze and re-resolves against the current generation.
//!
//! # Consistency
//!
//! Operations on a single key are linearizable: [`HashMap::insert`],
//! [`HashMap::get_or_insert`], and [`HashMap::remove`] serialize through the
//! owning bucket's exclusive lock. No ordering is promised across keys.
//! [`HashMap::range`] and the snapshot iterators are *not* consistent
//! snapshots: entries inserted or removed concurrently may or may not be
//! observed, but no key is ever visited twice in one pass. [`HashMap::len`]
//! is maintained with relaxed atomics and is exact only once concurrent
//! writers have quiesced.
//!
//! Values are cloned out of the map rather than borrowed, so `V` is typically
//! something cheap to clone (a small value, or an [`Arc`](std::sync::Arc)).
//!
//! # Examples
//!
//! ```
//! use molt::HashMap;
//!
//! let map = HashMap::new();
//! map.insert("apple", 3);
//! map.insert("pear", 5);
//!
//! assert_eq!(map.get("apple"), Some(3));
//! assert_eq!(map.get("plum"), None);
//! assert_eq!(map.len(), 2);
//!
//! assert_eq!(map.remove("pear"), Some(5));
//! assert!(!map.contains_key("pear"));
//! ```
//!
//! Shared between threads:
//!
//! ```
//! use molt::HashMap;
//! use std::sync::Arc;
//!
//! let map = Arc::new(HashMap::new());
//! let handles: Vec<_> = (0..4u64)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         std::thread::spawn(move || {
//!             for i in 0..100u64 {
//!                 map.insert(t * 100 + i, i);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(map.len(), 400);
//! ```
#![deny(missing_docs, missing_debug_implementations, unreachable_pub)]
#![warn(rust_2018_idioms)]

mod bucket;
mod map;
mod raw;
#[cfg(feature = "serde")]
mod serde_impls;

pub use map::HashMap;

/// The default [`BuildHasher`](std::hash::BuildHasher) for [`HashMap`].
///
/// aHash mixes the low bits well, which matters here twice over: bucket
/// routing masks the hash directly, and a growing table partitions each old
/// bucket by the next-higher hash bit.
pub type DefaultHashBuilder = ahash::RandomState;
