//! The single-flight response cache.
//!
//! Each listener owns one [`Cache`]. A key is reserved with
//! [`Cache::loading`] by exactly one producer; readers that arrive while
//! production runs subscribe through [`Cache::get_notified`] and are all
//! resolved by the single [`Cache::add`]. Entries carry an optional
//! time-to-live measured from admission, and the cache is bounded by the
//! summed byte size of its artifacts: admission evicts the entry with the
//! soonest remaining expiry first, because an entry about to lapse is the
//! least valuable one to keep.
//!
//! All operations take `&self` and serialize on one internal mutex that is
//! never held across an await point.

use crate::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Duration, Instant};

/// Fingerprint of a cacheable request: the producing handler instance and
/// the canonical resolved name. The precomputed hash sorts first so map
/// lookups compare cheaply.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheKey {
    hash: u64,
    owner: u64,
    name: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(owner: u64, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut hasher = DefaultHasher::new();
        owner.hash(&mut hasher);
        name.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            owner,
            name,
        }
    }

    /// The canonical name, `<host>:<port><resolved path>` for the file
    /// handler.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.owner.cmp(&other.owner))
    }
}
impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Debug for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({}@{})", self.name, self.owner)
    }
}

/// A stored response: status, meta line, body and a time-to-live.
/// `lifetime == Duration::ZERO` means the artifact never expires on its
/// own (size-bounded eviction may still claim it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub status: u8,
    pub meta: String,
    pub body: Bytes,
    pub lifetime: Duration,
}

impl Artifact {
    #[must_use]
    pub fn new(status: u8, meta: impl Into<String>, body: Bytes, lifetime: Duration) -> Self {
        debug_assert!((10..=62).contains(&status));
        Self {
            status,
            meta: meta.into(),
            body,
            lifetime,
        }
    }

    /// Accounted size: meta plus body bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.meta.len() + self.body.len()
    }

    /// The response header line, `<status> <meta>\r\n`.
    #[must_use]
    pub fn header(&self) -> String {
        format!("{} {}\r\n", self.status, self.meta)
    }

    /// Whether a body belongs on the wire (status `2x`).
    #[must_use]
    pub fn is_success(&self) -> bool {
        (20..=29).contains(&self.status)
    }
}

/// What a [`Subscription`] resolves to.
#[derive(Debug)]
pub enum Notified {
    /// The producer finished; here is the artifact.
    Ready(Arc<Artifact>),
    /// The producer cancelled and the role falls to this subscriber: call
    /// [`Cache::loading`], produce, then [`Cache::add`].
    Produce,
}

/// A pending notification for a key in the `Loading` state.
#[derive(Debug)]
pub struct Subscription {
    rx: oneshot::Receiver<Notified>,
}
impl Subscription {
    /// Waits for the producer. If the entry evaporates without an `add`
    /// (invalidate or clear mid-flight), the subscriber inherits the
    /// producer role.
    pub async fn wait(self) -> Notified {
        self.rx.await.unwrap_or(Notified::Produce)
    }
}

/// Result of [`Cache::get_notified`].
#[derive(Debug)]
pub enum Lookup {
    /// Not in the map; the caller should reserve and produce.
    Absent,
    /// Ready; delivered synchronously.
    Ready(Arc<Artifact>),
    /// Loading; the subscription resolves on `add` or `cancel`.
    Waiting(Subscription),
}

enum Entry {
    Loading {
        subscribers: VecDeque<oneshot::Sender<Notified>>,
    },
    Ready {
        artifact: Arc<Artifact>,
        expires: Option<Instant>,
        generation: u64,
    },
}

struct Inner {
    map: BTreeMap<CacheKey, Entry>,
    size: usize,
    max_size: usize,
    generation: u64,
}

impl Inner {
    /// Removes a `Ready` entry and returns its accounted size.
    fn remove_ready(&mut self, key: &CacheKey) -> bool {
        if let Some(Entry::Ready { artifact, .. }) = self.map.get(key) {
            self.size -= artifact.size();
            self.map.remove(key);
            true
        } else {
            false
        }
    }

    /// Evicts the `Ready` entry with the soonest remaining expiry.
    /// Entries without a TTL are spared while any TTL'd entry remains;
    /// ties fall to map iteration order.
    fn evict_soonest(&mut self) -> bool {
        let mut victim: Option<(&CacheKey, Option<Instant>)> = None;
        for (key, entry) in &self.map {
            let Entry::Ready { expires, .. } = entry else {
                continue;
            };
            victim = match victim {
                None => Some((key, *expires)),
                Some((_, Some(soonest))) => match expires {
                    Some(e) if *e < soonest => Some((key, *expires)),
                    _ => victim,
                },
                // Any TTL beats the no-TTL candidate.
                Some((_, None)) if expires.is_some() => Some((key, *expires)),
                Some(keep) => Some(keep),
            };
        }
        let Some((key, _)) = victim else {
            return false;
        };
        let key = key.clone();
        debug!("evicting {key:?} to make room");
        self.remove_ready(&key)
    }
}

/// A shared handle to one listener's response cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Mutex<Inner>>,
}

impl Cache {
    /// `max_size` bounds the summed artifact bytes; `0` means unbounded.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: BTreeMap::new(),
                size: 0,
                max_size,
                generation: 0,
            })),
        }
    }

    /// Reserves `key` for production. A `Ready` entry is invalidated and
    /// demoted; reserving an already loading key is a no-op.
    pub fn loading(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get(key) {
            Some(Entry::Loading { .. }) => {}
            Some(Entry::Ready { .. }) => {
                inner.remove_ready(key);
                inner.map.insert(
                    key.clone(),
                    Entry::Loading {
                        subscribers: VecDeque::new(),
                    },
                );
            }
            None => {
                inner.map.insert(
                    key.clone(),
                    Entry::Loading {
                        subscribers: VecDeque::new(),
                    },
                );
            }
        }
    }

    /// Gives up a reservation. The first waiting subscriber (FIFO)
    /// inherits the producer role; with no subscribers the entry is
    /// dropped.
    pub fn cancel(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().unwrap();
        let Some(Entry::Loading { subscribers }) = inner.map.get_mut(key) else {
            return;
        };
        while let Some(subscriber) = subscribers.pop_front() {
            if subscriber.send(Notified::Produce).is_ok() {
                return;
            }
            // Receiver gave up; try the next one.
        }
        inner.map.remove(key);
    }

    /// Stores `artifact` under a key previously reserved with
    /// [`loading`](Self::loading) and resolves every subscriber, in
    /// insertion order, with it.
    ///
    /// Returns `false` without storing when the reservation was lost
    /// (the producer was cancelled and superseded) or when the artifact
    /// alone exceeds the size bound; subscribers are still resolved in
    /// the latter case.
    pub fn add(&self, key: &CacheKey, artifact: Artifact) -> bool {
        let artifact = Arc::new(artifact);
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.map.get(key), Some(Entry::Loading { .. })) {
            return false;
        }

        let admit = inner.max_size == 0 || artifact.size() <= inner.max_size;
        if admit {
            while inner.max_size > 0 && inner.size + artifact.size() > inner.max_size {
                if !inner.evict_soonest() {
                    break;
                }
            }
        }

        let Some(Entry::Loading { subscribers }) = inner.map.remove(key) else {
            unreachable!("checked above");
        };

        if admit {
            inner.generation += 1;
            let generation = inner.generation;
            let expires = (!artifact.lifetime.is_zero())
                .then(|| Instant::now() + artifact.lifetime);
            inner.size += artifact.size();
            inner.map.insert(
                key.clone(),
                Entry::Ready {
                    artifact: Arc::clone(&artifact),
                    expires,
                    generation,
                },
            );
            if let Some(expires) = expires {
                let weak = Arc::downgrade(&self.inner);
                let key = key.clone();
                tokio::spawn(async move {
                    sleep_until(expires).await;
                    if let Some(inner) = weak.upgrade() {
                        let mut inner = inner.lock().unwrap();
                        if matches!(
                            inner.map.get(&key),
                            Some(Entry::Ready { generation: g, .. }) if *g == generation
                        ) {
                            trace!("cache entry {key:?} expired");
                            inner.remove_ready(&key);
                        }
                    }
                });
            }
        } else {
            debug!(
                "artifact for {key:?} ({} B) exceeds the cache bound; serving uncached",
                artifact.size()
            );
        }
        drop(inner);

        for subscriber in subscribers {
            let _ = subscriber.send(Notified::Ready(Arc::clone(&artifact)));
        }
        admit
    }

    /// Looks a key up, subscribing when production is in flight.
    #[must_use]
    pub fn get_notified(&self, key: &CacheKey) -> Lookup {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get_mut(key) {
            None => Lookup::Absent,
            Some(Entry::Ready { artifact, .. }) => Lookup::Ready(Arc::clone(artifact)),
            Some(Entry::Loading { subscribers }) => {
                let (tx, rx) = oneshot::channel();
                subscribers.push_back(tx);
                Lookup::Waiting(Subscription { rx })
            }
        }
    }

    /// The artifact for a `Ready` key.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Artifact>> {
        match self.inner.lock().unwrap().map.get(key) {
            Some(Entry::Ready { artifact, .. }) => Some(Arc::clone(artifact)),
            _ => None,
        }
    }

    /// Drops a key without notifying anyone. The armed TTL task, if any,
    /// no-ops through its generation check.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.remove_ready(key) {
            inner.map.remove(key);
        }
    }

    #[must_use]
    pub fn is_loading(&self, key: &CacheKey) -> bool {
        matches!(
            self.inner.lock().unwrap().map.get(key),
            Some(Entry::Loading { .. })
        )
    }

    #[must_use]
    pub fn is_loaded(&self, key: &CacheKey) -> bool {
        matches!(
            self.inner.lock().unwrap().map.get(key),
            Some(Entry::Ready { .. })
        )
    }

    /// Drops everything, loading entries included.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.size = 0;
    }

    /// Summed artifact bytes currently stored.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size
    }
}
impl Debug for Cache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(
            f,
            "Cache {{ entries: {}, size: {}/{} }}",
            inner.map.len(),
            inner.size,
            inner.max_size
        )
    }
}
