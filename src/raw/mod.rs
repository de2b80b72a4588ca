use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_epoch::{Atomic, Guard, Shared};

use crate::bucket::Bucket;

/// One generation of the table: a fixed, immutable array of `2^b` buckets
/// plus the two fields that only matter while entries are being migrated in
/// from the previous generation.
///
/// `prev` points back at the generation this one replaced. It is set when the
/// table is published and swapped back to null exactly once, by the migration
/// worker, after every bucket has been evacuated; at that point the
/// predecessor is retired through the epoch collector. `resizing` doubles as
/// the election that keeps transitions from overlapping: whoever flips it
/// `0 → 1` on the *current* table is the only thread allowed to publish a
/// successor.
pub(crate) struct Table<K, V, S> {
    b: u8,
    mask: u64,
    buckets: Box<[Bucket<K, V>]>,
    prev: Atomic<Table<K, V, S>>,
    resizing: AtomicU32,
    build_hasher: S,
}

impl<K, V, S> Table<K, V, S> {
    pub(crate) fn new(b: u8, build_hasher: S) -> Self {
        let len = 1usize << b;
        Self {
            b,
            mask: (1u64 << b) - 1,
            buckets: (0..len).map(|_| Bucket::new()).collect(),
            prev: Atomic::null(),
            resizing: AtomicU32::new(0),
            build_hasher,
        }
    }

    /// A table that takes over from `prev`; it is born mid-migration.
    pub(crate) fn successor(b: u8, build_hasher: S, prev: Shared<'_, Table<K, V, S>>) -> Self {
        let table = Self::new(b, build_hasher);
        table.resizing.store(1, Ordering::Relaxed);
        table.prev.store(prev, Ordering::Relaxed);
        table
    }

    pub(crate) fn b(&self) -> u8 {
        self.b
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn is_migrating(&self, guard: &Guard) -> bool {
        !self.prev.load(Ordering::SeqCst, guard).is_null()
    }

    /// Win the right to publish this table's successor. At most one caller
    /// ever succeeds per generation; the flag is cleared only after the
    /// migration it started has completed.
    pub(crate) fn claim_resize(&self) -> bool {
        self.resizing
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }
}

impl<K, V, S> Table<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub(crate) fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.build_hasher.hash_one(key)
    }

    /// Route a hash to its bucket, readying the bucket on the way: allocate
    /// the payload if this is its first touch and, while a migration is in
    /// flight, pull over whatever it still owes from the previous generation.
    /// Both the background worker and ordinary operations funnel through
    /// here, so evacuation proceeds from both ends.
    pub(crate) fn bucket_for<'g>(&'g self, hash: u64, guard: &'g Guard) -> &'g Bucket<K, V> {
        let i = hash & self.mask;
        let bucket = &self.buckets[i as usize];
        bucket.lazy_init();
        let prev = self.prev.load(Ordering::SeqCst, guard);
        if !prev.is_null() && !bucket.is_evacuated() {
            // safety: `prev` is retired only by the migration worker, and only
            // after it has swapped `self.prev` back to null; we loaded it
            // non-null under our guard, which keeps the allocation alive even
            // if that retirement races us.
            self.evacuate(unsafe { prev.deref() }, bucket, i, guard);
        }
        bucket
    }

    /// Move bucket `i`'s share of the previous generation into `bucket`.
    ///
    /// The target's exclusive lock is held for the whole transfer and the
    /// source buckets live in a different (older) generation, so lock order
    /// is always new-before-old and cannot cycle.
    fn evacuate(&self, prev: &Table<K, V, S>, bucket: &Bucket<K, V>, i: u64, guard: &Guard) {
        if self.mask > prev.mask {
            // Growing: the old bucket `i & prev.mask` splits in two; this
            // bucket inherits the keys the wider mask routes to `i`.
            let src = prev.bucket_for(i, guard);
            bucket.evacuate_with(|dst| {
                src.freeze_and_drain(|k, v| {
                    if self.hash(k) & self.mask == i {
                        dst.insert(k.clone(), v.clone());
                    }
                });
            });
        } else {
            // Shrinking: this bucket unions old buckets `i` and `i + 2^b`.
            let src0 = prev.bucket_for(i, guard);
            let src1 = prev.bucket_for(i + (1u64 << self.b), guard);
            bucket.evacuate_with(|dst| {
                src0.freeze_and_drain(|k, v| {
                    dst.insert(k.clone(), v.clone());
                });
                src1.freeze_and_drain(|k, v| {
                    dst.insert(k.clone(), v.clone());
                });
            });
        }
    }

    /// The background sweep: touch every bucket (evacuating each one that
    /// still needs it), then unlink and retire the predecessor and mark this
    /// generation stable. Runs to completion exactly once per transition.
    pub(crate) fn migrate(&self, guard: &Guard) {
        for i in 0..self.buckets.len() {
            self.bucket_for(i as u64, guard);
        }
        let prev = self.prev.swap(Shared::null(), Ordering::SeqCst, guard);
        assert!(!prev.is_null(), "migration completed twice for one table");
        self.resizing.store(0, Ordering::SeqCst);
        // safety: new routes no longer reach `prev` (the handle points at
        // `self` and `self.prev` is now null); any reader that found it
        // earlier holds a guard, so destruction is deferred until they unpin.
        unsafe { guard.defer_destroy(prev) };
    }
}
