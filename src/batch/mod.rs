//! Batched read-through cache for per-item lookups
//!
//! Many single-id lookups issued close together are coalesced into one
//! batched fetch. The first lookup in an idle window schedules a flush after
//! a fixed debounce delay; later lookups join the queue without moving the
//! deadline. Ids that the fetch does not return are cached as placeholders so
//! they are not queried again until invalidated.

pub mod release;

use futures::future::{BoxFuture, Shared, join_all};
use futures::{FutureExt, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::BatchSettings;
use crate::error::FetchError;

pub use release::{ReleaseState, ReleaseStateCache, ReleaseStatus, release_cache};

/// Delay between the first queued id and the batched fetch
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Entities served by a [`BatchCache`]
pub trait BatchEntity: Clone + Send + Sync + 'static {
    fn entity_id(&self) -> &str;

    /// Negative-result entity cached for an id the fetch did not return
    fn placeholder(id: &str) -> Self;

    fn is_placeholder(&self) -> bool;
}

/// Caller-supplied batched data source
pub type BatchFetcher<E> =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<Vec<E>, FetchError>> + Send + Sync>;

/// Build a [`BatchFetcher`] from an async closure
pub fn batch_fetcher<E, F, Fut>(f: F) -> BatchFetcher<E>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<E>, FetchError>> + Send + 'static,
{
    Arc::new(move |ids| f(ids).boxed())
}

/// Upstream signal that data for `id` changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub id: String,
}

impl InvalidationEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

type Lookup<E> = Shared<BoxFuture<'static, Option<E>>>;

struct Pending<E> {
    ticket: u64,
    lookup: Lookup<E>,
}

struct Queued<E> {
    id: String,
    ticket: u64,
    sender: oneshot::Sender<Option<E>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Scheduled,
}

struct BatchState<E> {
    entities: HashMap<String, E>,
    pending: HashMap<String, Pending<E>>,
    queue: Vec<Queued<E>>,
    timer: TimerState,
    observers: HashMap<String, watch::Sender<Option<E>>>,
    next_ticket: u64,
    flushes: usize,
}

impl<E> Default for BatchState<E> {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
            pending: HashMap::new(),
            queue: Vec::new(),
            timer: TimerState::Idle,
            observers: HashMap::new(),
            next_ticket: 0,
            flushes: 0,
        }
    }
}

struct BatchInner<E> {
    state: Mutex<BatchState<E>>,
    fetcher: BatchFetcher<E>,
    debounce: Duration,
}

/// Debounced, de-duplicating read-through cache.
///
/// Cheap to clone; clones share one cache, queue, and pending map.
pub struct BatchCache<E: BatchEntity> {
    inner: Arc<BatchInner<E>>,
}

impl<E: BatchEntity> Clone for BatchCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// What callers see for a cached entity
fn visible<E: BatchEntity>(entity: &E) -> Option<E> {
    if entity.is_placeholder() {
        None
    } else {
        Some(entity.clone())
    }
}

/// Drop observers whose receivers are all gone
fn prune_observers<E>(observers: &mut HashMap<String, watch::Sender<Option<E>>>) {
    observers.retain(|_, sender| sender.receiver_count() > 0);
}

impl<E: BatchEntity> BatchCache<E> {
    pub fn new(fetcher: BatchFetcher<E>) -> Self {
        Self::with_debounce(fetcher, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(fetcher: BatchFetcher<E>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                state: Mutex::new(BatchState::default()),
                fetcher,
                debounce,
            }),
        }
    }

    /// Debounce window taken from the `batch` config section
    pub fn from_settings(fetcher: BatchFetcher<E>, settings: &BatchSettings) -> Self {
        Self::with_debounce(fetcher, settings.debounce())
    }

    fn lock(&self) -> MutexGuard<'_, BatchState<E>> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up one id.
    ///
    /// The lookup is registered when `get` is called, not when the future is
    /// first polled. Resolves to `None` for ids the backend does not track.
    pub fn get(&self, id: &str) -> BoxFuture<'static, Option<E>> {
        let mut state = self.lock();

        if let Some(entity) = state.entities.get(id) {
            return futures::future::ready(visible(entity)).boxed();
        }

        if let Some(pending) = state.pending.get(id) {
            return pending.lookup.clone().boxed();
        }

        let (sender, receiver) = oneshot::channel();
        let lookup: Lookup<E> = receiver.map(|r| r.ok().flatten()).boxed().shared();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        state.pending.insert(
            id.to_string(),
            Pending {
                ticket,
                lookup: lookup.clone(),
            },
        );
        state.queue.push(Queued {
            id: id.to_string(),
            ticket,
            sender,
        });

        if state.timer == TimerState::Idle {
            state.timer = TimerState::Scheduled;
            let cache = self.clone();
            let debounce = self.inner.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                cache.flush().await;
            });
        }

        lookup.boxed()
    }

    /// Look up several ids, waiting until all have resolved
    pub async fn prefetch<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lookups: Vec<_> = ids.into_iter().map(|id| self.get(id.as_ref())).collect();
        join_all(lookups).await;
    }

    /// Drop cached and pending state for one id, or for everything.
    ///
    /// Callers already waiting on a queued lookup still receive its result,
    /// but that result is not cached.
    pub fn invalidate(&self, id: Option<&str>) {
        let mut state = self.lock();
        match id {
            Some(id) => {
                state.entities.remove(id);
                state.pending.remove(id);
            }
            None => {
                state.entities.clear();
                state.pending.clear();
            }
        }
    }

    /// Invalidate after the user acknowledged a release upstream
    pub fn acknowledge(&self, id: &str) {
        log::debug!("Acknowledged {}", id);
        self.refresh(id);
    }

    /// Observe one id; every resolved value is published to the receiver.
    ///
    /// Starts a lookup if the id is not cached.
    pub fn subscribe(&self, id: &str) -> watch::Receiver<Option<E>> {
        let receiver = {
            let mut state = self.lock();
            prune_observers(&mut state.observers);
            let initial = state.entities.get(id).and_then(visible);
            let sender = state
                .observers
                .entry(id.to_string())
                .or_insert_with(|| watch::channel(initial.clone()).0);
            if initial.is_some() {
                sender.send_replace(initial);
            }
            sender.subscribe()
        };

        // Registration is eager; the flush publishes to the observer
        drop(self.get(id));
        receiver
    }

    /// Consume upstream change signals until the stream ends
    pub fn attach_invalidations<S>(&self, events: S) -> JoinHandle<()>
    where
        S: Stream<Item = InvalidationEvent> + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                log::debug!("Upstream change for {}", event.id);
                cache.refresh(&event.id);
            }
        })
    }

    /// Cached value without triggering a lookup
    pub fn peek(&self, id: &str) -> Option<Option<E>> {
        self.lock().entities.get(id).map(visible)
    }

    /// Number of batched fetches issued so far
    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    /// Invalidate `id` and look it up again if anyone still observes it
    fn refresh(&self, id: &str) {
        self.invalidate(Some(id));

        let observed = {
            let mut state = self.lock();
            match state.observers.get(id) {
                Some(sender) if sender.receiver_count() > 0 => true,
                Some(_) => {
                    state.observers.remove(id);
                    false
                }
                None => false,
            }
        };

        if observed {
            drop(self.get(id));
        }
    }

    async fn flush(&self) {
        let batch = {
            let mut state = self.lock();
            state.timer = TimerState::Idle;
            std::mem::take(&mut state.queue)
        };

        if batch.is_empty() {
            return;
        }

        // An id invalidated and requested again within one window is queued twice
        let mut requested = HashSet::with_capacity(batch.len());
        let ids: Vec<String> = batch
            .iter()
            .filter(|q| requested.insert(q.id.clone()))
            .map(|q| q.id.clone())
            .collect();
        log::debug!("Flushing batch of {} ids", ids.len());

        // A panicking fetcher fails the batch instead of stranding its waiters
        let result = match tokio::spawn((self.inner.fetcher)(ids)).await {
            Ok(result) => result,
            Err(join_err) => Err(FetchError::Aborted(join_err.to_string())),
        };

        let mut state = self.lock();
        state.flushes += 1;

        match result {
            Ok(entities) => {
                let by_id: HashMap<String, E> = entities
                    .into_iter()
                    .map(|e| (e.entity_id().to_string(), e))
                    .collect();

                for queued in batch {
                    let entity = by_id
                        .get(&queued.id)
                        .cloned()
                        .unwrap_or_else(|| E::placeholder(&queued.id));
                    let value = visible(&entity);

                    let current = state
                        .pending
                        .get(&queued.id)
                        .is_some_and(|p| p.ticket == queued.ticket);
                    if current {
                        state.pending.remove(&queued.id);
                        state.entities.insert(queued.id.clone(), entity);
                        if let Some(observer) = state.observers.get(&queued.id) {
                            observer.send_replace(value.clone());
                        }
                    } else {
                        log::debug!("Not caching invalidated lookup for {}", queued.id);
                    }

                    let _ = queued.sender.send(value);
                }

                // Unrequested entities are cached too
                for (id, entity) in by_id {
                    if !requested.contains(&id) {
                        state.entities.insert(id, entity);
                    }
                }

                prune_observers(&mut state.observers);
            }
            Err(err) => {
                log::warn!("Batched fetch of {} ids failed: {}", batch.len(), err);
                for queued in batch {
                    if state
                        .pending
                        .get(&queued.id)
                        .is_some_and(|p| p.ticket == queued.ticket)
                    {
                        state.pending.remove(&queued.id);
                    }
                    let _ = queued.sender.send(None);
                }
            }
        }
    }
}
