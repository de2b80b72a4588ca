use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

/// The key→value table inside one bucket.
pub(crate) type Payload<K, V> = std::collections::HashMap<K, V, crate::DefaultHashBuilder>;

/// Refusal returned by mutating bucket operations: the bucket belongs to a
/// retired generation and its contents have been committed to migration. The
/// caller must re-resolve the current table and try again.
pub(crate) struct Frozen;

/// One shard of the table: a lazily allocated payload behind a reader-writer
/// lock, plus three monotonic lifecycle flags. Within a single generation the
/// flags only ever go `0 → 1`:
///
/// - `init`: the payload has been allocated;
/// - `frozen`: the payload has been drained into the next generation and no
///   further mutation is allowed. Reads stay valid: the drained snapshot is
///   left in place for late readers still routed through the old generation;
/// - `evacuated`: this bucket has absorbed everything it should own from the
///   previous generation.
pub(crate) struct Bucket<K, V> {
    payload: RwLock<Option<Payload<K, V>>>,
    init: AtomicBool,
    frozen: AtomicBool,
    evacuated: AtomicBool,
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            payload: RwLock::new(None),
            init: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            evacuated: AtomicBool::new(false),
        }
    }

    /// Allocate the payload if this bucket has never been touched.
    /// Double-checked: the flag read is the fast path, the lock settles races.
    pub(crate) fn lazy_init(&self) {
        if self.init.load(Ordering::Acquire) {
            return;
        }
        let mut payload = self.payload.write();
        if payload.is_none() {
            *payload = Some(Payload::default());
            self.init.store(true, Ordering::Release);
        }
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn is_evacuated(&self) -> bool {
        self.evacuated.load(Ordering::Acquire)
    }
}

impl<K, V> Bucket<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub(crate) fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let payload = self.payload.read();
        payload.as_ref()?.get(key).cloned()
    }

    /// Insert or overwrite under the exclusive lock.
    ///
    /// On success returns the replaced value (if any) and the post-insert
    /// population of this bucket, which the handle feeds to the grow trigger.
    /// If the bucket is frozen the pair is handed back untouched.
    pub(crate) fn try_insert(&self, key: K, value: V) -> Result<(Option<V>, usize), (K, V)> {
        let mut payload = self.payload.write();
        if self.is_frozen() {
            return Err((key, value));
        }
        let payload = payload.get_or_insert_with(Payload::default);
        let replaced = payload.insert(key, value);
        Ok((replaced, payload.len()))
    }

    /// Return the existing value for `key`, or run `make` and insert its
    /// result. The factory is consumed only when the slot is vacant; on a
    /// frozen bucket both the key and the factory are handed back so the
    /// caller can retry against the current generation.
    pub(crate) fn try_get_or_insert_with<F>(
        &self,
        key: K,
        make: F,
    ) -> Result<(V, bool, usize), (K, F)>
    where
        F: FnOnce() -> V,
    {
        let mut payload = self.payload.write();
        if self.is_frozen() {
            return Err((key, make));
        }
        let payload = payload.get_or_insert_with(Payload::default);
        if let Some(existing) = payload.get(&key) {
            return Ok((existing.clone(), true, payload.len()));
        }
        let value = make();
        payload.insert(key, value.clone());
        Ok((value, false, payload.len()))
    }

    pub(crate) fn try_remove<Q>(&self, key: &Q) -> Result<Option<V>, Frozen>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.is_frozen() {
            return Err(Frozen);
        }
        let mut payload = self.payload.write();
        if self.is_frozen() {
            return Err(Frozen);
        }
        match payload.as_mut() {
            Some(payload) => Ok(payload.remove(key)),
            None => Ok(None),
        }
    }

    /// Copy the entries out under the shared lock, then invoke `f` on each
    /// pair with no lock held, so the callback is free to re-enter the map.
    /// Returns `false` as soon as `f` does.
    pub(crate) fn walk<F>(&self, f: &mut F) -> bool
    where
        F: FnMut(&K, &V) -> bool,
    {
        let entries: Vec<(K, V)> = {
            let payload = self.payload.read();
            match payload.as_ref() {
                Some(payload) => payload
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => return true,
            }
        };
        for (k, v) in &entries {
            if !f(k, v) {
                return false;
            }
        }
        true
    }

    /// Freeze this bucket and feed every entry to `f`, all under the
    /// exclusive lock. Once a mutating operation can acquire the lock again
    /// it will observe `frozen` and back off, so `f` sees a final snapshot.
    ///
    /// The entries are deliberately left in place: a reader still routed
    /// through this bucket's generation keeps seeing the frozen snapshot
    /// instead of a spurious miss. The memory goes away with the generation.
    pub(crate) fn freeze_and_drain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let payload = self.payload.write();
        self.frozen.store(true, Ordering::Release);
        if let Some(payload) = payload.as_ref() {
            for (k, v) in payload.iter() {
                f(k, v);
            }
        }
    }

    /// Run `fill` against the payload under the exclusive lock and mark this
    /// bucket evacuated, unless another thread already did. The flag is
    /// re-checked under the lock so the fill runs at most once per generation.
    pub(crate) fn evacuate_with<F>(&self, fill: F)
    where
        F: FnOnce(&mut Payload<K, V>),
    {
        if self.is_evacuated() {
            return;
        }
        let mut payload = self.payload.write();
        if self.is_evacuated() {
            return;
        }
        fill(payload.get_or_insert_with(Payload::default));
        self.evacuated.store(true, Ordering::Release);
    }
}
