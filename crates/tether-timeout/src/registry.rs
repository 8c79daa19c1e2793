//! Expiring keyed sets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Something the [`Clock`](crate::Clock) can sweep once per tick.
pub trait Sweep: Send + Sync {
    /// Registry name, for logs.
    fn name(&self) -> &'static str;

    /// Removes every entry whose deadline is at or before `now` and
    /// emits them as one batch. Returns how many entries expired.
    fn sweep(&self, now: Instant) -> usize;
}

/// The receiving end of a registry's expiry batches.
///
/// Each message is every entry that expired during one sweep, in
/// deadline order.
pub struct Expirations<K, V> {
    rx: mpsc::UnboundedReceiver<Vec<(K, V)>>,
}

impl<K, V> Expirations<K, V> {
    /// Waits for the next batch. Returns `None` once every handle to the
    /// registry has been dropped.
    pub async fn recv(&mut self) -> Option<Vec<(K, V)>> {
        self.rx.recv().await
    }

    /// Returns a batch if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Vec<(K, V)>> {
        self.rx.try_recv().ok()
    }
}

struct Entry<V> {
    payload: V,
    deadline: Instant,
    seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Deadline order. `seq` breaks ties between entries added within
    /// the same instant.
    order: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
    tx: mpsc::UnboundedSender<Vec<(K, V)>>,
}

/// A named set of `key → payload` entries that expire a fixed duration
/// after they were last added.
///
/// Adding an existing key replaces its payload and pushes its deadline
/// out again (a sliding timeout). Deleting a key before its deadline
/// means it never fires. Nothing fires on its own: a [`Clock`] sweeps
/// all registered registries on a shared tick, and a sweep only does
/// work when the *oldest* entry is due.
///
/// Handles are cheap to clone and share the same entries.
///
/// [`Clock`]: crate::Clock
pub struct TimeoutRegistry<K, V> {
    name: &'static str,
    duration: Duration,
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for TimeoutRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            duration: self.duration,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for TimeoutRegistry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutRegistry")
            .field("name", &self.name)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

impl<K, V> TimeoutRegistry<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a registry and the stream its expiry batches arrive on.
    pub fn new(name: &'static str, duration: Duration) -> (Self, Expirations<K, V>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            name,
            duration,
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                tx,
            })),
        };
        (registry, Expirations { rx })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The registry's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// How long an entry lives after its last `add`.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Inserts or refreshes `key`.
    pub fn add(&self, key: K, payload: V) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(old) = inner.entries.remove(&key) {
            inner.order.remove(&(old.deadline, old.seq));
        }

        let deadline = Instant::now() + self.duration;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        inner.order.insert((deadline, seq), key.clone());
        inner.entries.insert(
            key,
            Entry {
                payload,
                deadline,
                seq,
            },
        );
    }

    /// Removes `key`, returning its payload if it was present.
    pub fn delete(&self, key: &K) -> Option<V> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = inner.entries.remove(key)?;
        inner.order.remove(&(entry.deadline, entry.seq));
        Some(entry.payload)
    }

    /// Whether `key` is currently pending.
    pub fn has(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Pending keys, oldest deadline first.
    pub fn keys(&self) -> Vec<K> {
        self.lock().order.values().cloned().collect()
    }

    /// Pending payloads, oldest deadline first.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let inner = self.lock();
        inner
            .order
            .values()
            .filter_map(|k| inner.entries.get(k))
            .map(|e| e.payload.clone())
            .collect()
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;

        match inner.order.first_key_value() {
            Some(((deadline, _), _)) if *deadline <= now => {}
            _ => return 0,
        }

        let mut batch = Vec::new();
        while let Some(first) = inner.order.first_entry() {
            if first.key().0 > now {
                break;
            }
            let key = first.remove();
            if let Some(entry) = inner.entries.remove(&key) {
                batch.push((key, entry.payload));
            }
        }

        let expired = batch.len();
        debug!(registry = self.name, expired, "timeouts expired");
        if inner.tx.send(batch).is_err() {
            trace!(registry = self.name, "no expiry listener, batch dropped");
        }
        expired
    }
}

impl<K, V> Sweep for TimeoutRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn sweep(&self, now: Instant) -> usize {
        self.sweep_at(now)
    }
}
