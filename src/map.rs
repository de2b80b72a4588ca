use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use crate::bucket::{Bucket, Frozen};
use crate::raw::Table;
use crate::DefaultHashBuilder;

/// log₂ of the bucket count of a freshly materialized table: 16 buckets.
/// The table never shrinks back below this.
const INITIAL_BITS: u8 = 4;

/// Cap applied to the exponent when evaluating the per-bucket grow trigger,
/// so the per-bucket threshold tops out at `2^16` entries.
const MAX_BUCKET_BITS: u8 = 15;

/// Exponent beyond which the whole-table grow trigger never fires; `2^(2·31)`
/// already exceeds any population a signed counter can describe.
const MAX_TABLE_BITS: u8 = 31;

/// Did an insertion leave a single bucket holding more than `2^(b+1)` entries?
fn bucket_overflow(bucket_len: usize, b: u8) -> bool {
    bucket_len > 1usize << (b.min(MAX_BUCKET_BITS) + 1)
}

/// Did the whole table reach `2^(2b)` entries?
fn table_overflow(count: i64, b: u8) -> bool {
    if b > MAX_TABLE_BITS {
        return false;
    }
    count >= 1i64 << (2 * b)
}

/// Did the population fall below `2^(b-1)`? Never fires once shrinking would
/// take the table to its initial size.
fn table_underflow(count: i64, b: u8) -> bool {
    b > INITIAL_BITS + 1 && count < 1i64 << (b - 1)
}

/// Raw pointer to a table, handed to the migration worker thread.
struct TableRef<K, V, S>(*const Table<K, V, S>);

// safety: the worker only ever reborrows the pointer as `&Table`, which is
// fine to send when the table itself is `Sync`.
unsafe impl<K, V, S> Send for TableRef<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Send + Sync,
{
}

/// A concurrent hash map, sharded into per-bucket locks, that resizes online.
///
/// See the [crate documentation](crate) for the design. In short: every key
/// routes to one bucket of the current table generation; point operations
/// take that bucket's lock; growth and shrinkage publish a new generation and
/// migrate entries over incrementally while operations continue.
///
/// A fresh handle allocates nothing; the first operation materializes the
/// initial 16-bucket table.
///
/// # Examples
///
/// ```
/// use molt::HashMap;
///
/// let map = HashMap::new();
/// assert_eq!(map.get_or_insert("a", 1), (1, false));
/// assert_eq!(map.get_or_insert("a", 2), (1, true));
/// ```
pub struct HashMap<K, V, S = DefaultHashBuilder> {
    /// The current table generation. Null until the first operation; swapped
    /// with a CAS by whoever wins a resize election.
    table: Atomic<Table<K, V, S>>,

    /// Net insertions minus removals, maintained with relaxed operations.
    count: AtomicI64,

    /// Serializes first-table materialization (and nothing else).
    init_lock: Mutex<()>,

    /// Handles of migration workers; joined on drop so no worker outlives
    /// the handle they migrate for.
    migrations: Mutex<Vec<JoinHandle<()>>>,

    build_hasher: S,
}

impl<K, V> HashMap<K, V, DefaultHashBuilder> {
    /// Creates an empty map with the default hasher.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = molt::HashMap::<u32, String>::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty map that will hash keys with `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self {
            table: Atomic::null(),
            count: AtomicI64::new(0),
            init_lock: Mutex::new(()),
            migrations: Mutex::new(Vec::new()),
            build_hasher,
        }
    }

    /// Returns a reference to the map's [`BuildHasher`].
    pub fn hasher(&self) -> &S {
        &self.build_hasher
    }

    /// Returns the number of entries in the map.
    ///
    /// The count is maintained with relaxed atomics: while writers are active
    /// it is an estimate; once they quiesce it is exact.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Returns `true` if the map holds no entries. Same caveat as [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the current table generation, or 0 if
    /// the map has never been touched.
    ///
    /// Always a power of two, at least 16 once materialized. It doubles and
    /// halves as the map grows and shrinks, so it is mostly useful for
    /// observing resize behavior.
    pub fn bucket_count(&self) -> usize {
        let guard = epoch::pin();
        let table = self.table.load(Ordering::SeqCst, &guard);
        if table.is_null() {
            0
        } else {
            // safety: loaded under our guard; a table is retired only after
            // it is unlinked from both the handle and its successor.
            unsafe { table.deref() }.len()
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.build_hasher.hash_one(key)
    }

    /// The current table, materializing the first generation if necessary.
    fn table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<K, V, S>> {
        let table = self.table.load(Ordering::SeqCst, guard);
        if table.is_null() {
            self.init_table(guard)
        } else {
            table
        }
    }

    #[cold]
    fn init_table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<K, V, S>> {
        let _latch = self.init_lock.lock();
        let table = self.table.load(Ordering::SeqCst, guard);
        if !table.is_null() {
            // lost the materialization race
            return table;
        }
        let table =
            Owned::new(Table::new(INITIAL_BITS, self.build_hasher.clone())).into_shared(guard);
        self.table.store(table, Ordering::SeqCst);
        table
    }

    /// Resolve `hash` to the current table and its (readied) bucket.
    fn table_and_bucket<'g>(
        &'g self,
        hash: u64,
        guard: &'g Guard,
    ) -> (Shared<'g, Table<K, V, S>>, &'g Bucket<K, V>) {
        let table = self.table(guard);
        // safety: loaded under our guard; a table is retired only after it is
        // unlinked from both the handle and its successor's back-pointer.
        let t = unsafe { table.deref() };
        (table, t.bucket_for(hash, guard))
    }

    /// Returns a clone of the value stored for `key`, if any.
    ///
    /// Routes once against the current table and never retries: even if a
    /// resize overtakes it mid-flight, the routed bucket keeps serving its
    /// last committed snapshot.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = molt::HashMap::new();
    /// map.insert(17, "seventeen");
    /// assert_eq!(map.get(&17), Some("seventeen"));
    /// assert_eq!(map.get(&18), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = epoch::pin();
        let (_, bucket) = self.table_and_bucket(hash, &guard);
        bucket.try_get(key)
    }

    /// Returns `true` if the map holds a value for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Inserts a key-value pair, returning the value it replaced, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = molt::HashMap::new();
    /// assert_eq!(map.insert("k", 1), None);
    /// assert_eq!(map.insert("k", 2), Some(1));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let hash = self.hash(&key);
        let guard = epoch::pin();
        let mut entry = (key, value);
        loop {
            let (table, bucket) = self.table_and_bucket(hash, &guard);
            match bucket.try_insert(entry.0, entry.1) {
                Ok((replaced, bucket_len)) => {
                    if replaced.is_none() {
                        self.record_insert(table, bucket_len, &guard);
                    }
                    return replaced;
                }
                // the bucket froze under us: a newer generation took over
                // mid-operation, so re-resolve and try again
                Err(pair) => entry = pair,
            }
            thread::yield_now();
        }
    }

    /// Returns the value stored for `key`, inserting `value` if the key was
    /// absent. The boolean is `true` if the value was already present.
    ///
    /// Atomic with respect to other map operations on the same key: of many
    /// concurrent callers for one absent key, exactly one inserts.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = molt::HashMap::new();
    /// assert_eq!(map.get_or_insert("k", 10), (10, false));
    /// assert_eq!(map.get_or_insert("k", 20), (10, true));
    /// ```
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        self.get_or_insert_with(key, move || value)
    }

    /// Like [`get_or_insert`](Self::get_or_insert), but the value is produced
    /// by `make`, which runs at most once and only if the key is absent.
    ///
    /// `make` is invoked under the owning bucket's lock; it should not touch
    /// this map.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        let hash = self.hash(&key);
        let guard = epoch::pin();
        let mut entry = (key, make);
        loop {
            let (table, bucket) = self.table_and_bucket(hash, &guard);
            match bucket.try_get_or_insert_with(entry.0, entry.1) {
                Ok((value, loaded, bucket_len)) => {
                    if !loaded {
                        self.record_insert(table, bucket_len, &guard);
                    }
                    return (value, loaded);
                }
                Err(pair) => entry = pair,
            }
            thread::yield_now();
        }
    }

    /// Removes `key` from the map, returning the value that was stored, if
    /// any. Removing an absent key is a no-op.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = molt::HashMap::new();
    /// map.insert("k", 1);
    /// assert_eq!(map.remove("k"), Some(1));
    /// assert_eq!(map.remove("k"), None);
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let guard = epoch::pin();
        loop {
            let (table, bucket) = self.table_and_bucket(hash, &guard);
            match bucket.try_remove(key) {
                Ok(removed) => {
                    if removed.is_some() {
                        self.record_remove(table, &guard);
                    }
                    return removed;
                }
                Err(Frozen) => {}
            }
            thread::yield_now();
        }
    }

    /// Calls `f` for every entry, stopping if `f` returns `false`.
    ///
    /// The table pointer is snapshotted once and buckets are visited in
    /// order; each bucket's entries are copied out under its shared lock and
    /// `f` runs with no lock held, so it may call back into the map. The pass
    /// is not a snapshot (concurrent mutation may or may not be reflected),
    /// but no key is visited twice.
    ///
    /// # Examples
    ///
    /// ```
    /// let map = molt::HashMap::new();
    /// for i in 0..10u32 {
    ///     map.insert(i, i * i);
    /// }
    /// let mut sum = 0;
    /// map.range(|_, v| {
    ///     sum += v;
    ///     true
    /// });
    /// assert_eq!(sum, (0..10).map(|i| i * i).sum());
    /// ```
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = epoch::pin();
        let table = self.table(&guard);
        // safety: see `table_and_bucket`
        let t = unsafe { table.deref() };
        for i in 0..t.len() {
            let bucket = t.bucket_for(i as u64, &guard);
            if !bucket.walk(&mut f) {
                return;
            }
        }
    }

    /// Returns an iterator over a copied snapshot of the entries.
    ///
    /// The snapshot is taken eagerly with the same semantics as
    /// [`range`](Self::range); the iterator itself touches the map no
    /// further.
    pub fn iter(&self) -> std::vec::IntoIter<(K, V)> {
        let mut pairs = Vec::with_capacity(self.len());
        self.range(|k, v| {
            pairs.push((k.clone(), v.clone()));
            true
        });
        pairs.into_iter()
    }

    /// Returns an iterator over a copied snapshot of the keys.
    pub fn keys(&self) -> std::vec::IntoIter<K> {
        let mut keys = Vec::with_capacity(self.len());
        self.range(|k, _| {
            keys.push(k.clone());
            true
        });
        keys.into_iter()
    }

    /// Returns an iterator over a copied snapshot of the values.
    pub fn values(&self) -> std::vec::IntoIter<V> {
        let mut values = Vec::with_capacity(self.len());
        self.range(|_, v| {
            values.push(v.clone());
            true
        });
        values.into_iter()
    }

    /// Account for a fresh insertion and consult the grow triggers.
    fn record_insert(&self, table: Shared<'_, Table<K, V, S>>, bucket_len: usize, guard: &Guard) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        // safety: see `table_and_bucket`
        let t = unsafe { table.deref() };
        if bucket_overflow(bucket_len, t.b()) || table_overflow(count, t.b()) {
            self.begin_resize(table, t.b() + 1, guard);
        }
    }

    /// Account for a removal and consult the shrink trigger.
    fn record_remove(&self, table: Shared<'_, Table<K, V, S>>, guard: &Guard) {
        let count = self.count.fetch_sub(1, Ordering::Relaxed) - 1;
        assert!(count >= 0, "element count went negative");
        // safety: see `table_and_bucket`
        let t = unsafe { table.deref() };
        if table_underflow(count, t.b()) {
            self.begin_resize(table, t.b() - 1, guard);
        }
    }

    /// Publish a `new_b`-bucket successor to `table` and start its migration,
    /// unless a transition is already in flight or another thread wins the
    /// election first.
    fn begin_resize(&self, table: Shared<'_, Table<K, V, S>>, new_b: u8, guard: &Guard) {
        // safety: see `table_and_bucket`
        let t = unsafe { table.deref() };
        if t.is_migrating(guard) || !t.claim_resize() {
            return;
        }
        let next = Owned::new(Table::successor(new_b, self.build_hasher.clone(), table))
            .into_shared(guard);
        if self
            .table
            .compare_exchange(table, next, Ordering::SeqCst, Ordering::SeqCst, guard)
            .is_err()
        {
            // winning the claim on `table` means nobody else may publish its
            // successor, so the pointer cannot have moved
            panic!("table pointer changed while the resize claim was held");
        }
        self.spawn_migration(next);
    }

    fn spawn_migration(&self, table: Shared<'_, Table<K, V, S>>) {
        let table = TableRef(table.as_raw());
        let worker = thread::Builder::new()
            .name("molt-migrate".into())
            .spawn(move || {
                let table = table;
                let guard = epoch::pin();
                // safety: a published table is retired only by the migration
                // that replaces it, and no successor can be published before
                // this migration completes and clears the resize flag.
                let table = unsafe { &*table.0 };
                table.migrate(&guard);
            })
            .expect("failed to spawn migration worker");
        let mut migrations = self.migrations.lock();
        migrations.retain(|handle| !handle.is_finished());
        migrations.push(worker);
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // Wait out in-flight migrations; their workers hold pointers into the
        // generation chain.
        for worker in self.migrations.get_mut().drain(..) {
            worker.join().expect("migration worker panicked");
        }
        // safety: we have &mut self and every worker is joined, so nothing
        // can reach the table anymore.
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::SeqCst, guard);
        if table.is_null() {
            // never materialized
            return;
        }
        // every join above completed a migration, so no predecessor is linked
        debug_assert!(!unsafe { table.deref() }.is_migrating(guard));
        drop(unsafe { table.into_owned() });
    }
}

impl<K, V, S: Default> Default for HashMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Debug for HashMap<K, V, S>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: Debug + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        let map = Self::with_hasher(self.build_hasher.clone());
        self.range(|k, v| {
            map.insert(k.clone(), v.clone());
            true
        });
        map
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: PartialEq + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut equal = true;
        self.range(|k, v| {
            equal = other.get(k).map_or(false, |theirs| theirs == *v);
            equal
        });
        equal
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Eq + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = Self::with_hasher(S::default());
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_overflow_trips_past_double_capacity() {
        assert!(!bucket_overflow(32, 4));
        assert!(bucket_overflow(33, 4));
        // the exponent is capped, so huge tables keep a finite threshold
        assert!(!bucket_overflow(1 << 16, 20));
        assert!(bucket_overflow((1 << 16) + 1, 20));
    }

    #[test]
    fn table_overflow_trips_at_squared_capacity() {
        assert!(!table_overflow(255, 4));
        assert!(table_overflow(256, 4));
        assert!(table_overflow(1 << 10, 5));
        assert!(!table_overflow(i64::MAX, 32));
    }

    #[test]
    fn table_underflow_respects_the_floor() {
        // shrinking to the initial size is never worth it
        assert!(!table_underflow(0, 4));
        assert!(!table_underflow(0, 5));
        assert!(table_underflow(31, 6));
        assert!(!table_underflow(32, 6));
        assert!(table_underflow(63, 7));
    }

    #[test]
    fn first_operation_materializes_the_table() {
        let map = HashMap::<u64, u64>::new();
        assert_eq!(map.bucket_count(), 0);
        map.insert(1, 1);
        assert_eq!(map.bucket_count(), 1 << INITIAL_BITS);
    }

    #[test]
    fn reads_also_materialize() {
        let map = HashMap::<u64, u64>::new();
        assert_eq!(map.get(&1), None);
        assert_eq!(map.bucket_count(), 1 << INITIAL_BITS);
    }

    #[test]
    fn len_tracks_distinct_keys() {
        let map = HashMap::new();
        map.insert("a", 1);
        map.insert("a", 2);
        map.insert("b", 3);
        assert_eq!(map.len(), 2);
        map.remove("a");
        map.remove("a");
        assert_eq!(map.len(), 1);
    }
}
