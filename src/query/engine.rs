//! Query client and per-consumer query handles
//!
//! [`QueryClient`] is created once per process and cloned into every
//! consumer; it owns the store handle and the in-flight map, so coalescing
//! survives consumers being dropped and re-created. Each [`Query`] owns one
//! [`QueryState`] and runs activations against the client.

use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::inflight::{InFlightMap, SharedValue};
use super::{QueryItem, QueryRequest, QueryState, ResultPage, dedupe_by_id};
use crate::cache::CacheStore;
use crate::error::FetchError;

struct ClientInner {
    store: Arc<dyn CacheStore>,
    inflight: Arc<InFlightMap>,
}

/// Shared query services: persistent store plus in-flight fetch map
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                store,
                inflight: Arc::new(InFlightMap::new()),
            }),
        }
    }

    /// Create a query handle with empty state
    pub fn query<T: QueryItem>(&self) -> Query<T> {
        let (tx, _rx) = watch::channel(QueryState::default());
        Query {
            client: self.clone(),
            shared: Arc::new(QueryShared {
                slot: Mutex::new(Slot {
                    generation: 0,
                    request: None,
                    state: QueryState::default(),
                }),
                tx,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    /// Number of fetches currently running
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Forget all in-flight fetches (test teardown)
    pub fn reset(&self) {
        self.inner.inflight.clear();
    }
}

struct Slot<T> {
    /// Bumped by every activation and teardown; completions from an older
    /// generation are discarded
    generation: u64,
    request: Option<QueryRequest<T>>,
    state: QueryState<T>,
}

struct QueryShared<T> {
    slot: Mutex<Slot<T>>,
    tx: watch::Sender<QueryState<T>>,
}

impl<T: QueryItem> QueryShared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply `update` if `generation` is still current and publish the result
    fn commit(&self, generation: u64, update: impl FnOnce(&mut QueryState<T>)) -> bool {
        let mut slot = self.lock();
        if slot.generation != generation {
            log::debug!(
                "Discarding stale completion (generation {} != {})",
                generation,
                slot.generation
            );
            return false;
        }
        update(&mut slot.state);
        self.tx.send_replace(slot.state.clone());
        true
    }

    fn retire(&self) {
        let mut slot = self.lock();
        slot.generation += 1;
        slot.request = None;
        slot.state = QueryState::default();
        self.tx.send_replace(slot.state.clone());
    }
}

/// One consumer's view of a cached query.
///
/// Dropping the handle counts as teardown: running work for it keeps going
/// but no longer touches its state.
pub struct Query<T: QueryItem> {
    client: QueryClient,
    shared: Arc<QueryShared<T>>,
}

impl<T: QueryItem> Query<T> {
    /// Switch this handle to `request`.
    ///
    /// State is reset to the new key before this returns; anything still
    /// running for a previous key is ignored when it completes. The returned
    /// handle finishes once the cache read and any fetch it triggered settle.
    pub fn activate(&self, request: QueryRequest<T>) -> JoinHandle<()> {
        let generation = {
            let mut slot = self.shared.lock();
            slot.generation += 1;
            slot.state = QueryState {
                loading: request.options.enabled,
                ..QueryState::default()
            };
            slot.request = Some(request.clone());
            self.shared.tx.send_replace(slot.state.clone());
            slot.generation
        };

        if !request.options.enabled {
            log::debug!("Query disabled: {}", request.key);
            return tokio::spawn(async {});
        }

        let activation = Activation {
            client: self.client.clone(),
            shared: Arc::clone(&self.shared),
            generation,
            request,
        };
        tokio::spawn(activation.run())
    }

    /// Fetch again regardless of freshness.
    ///
    /// Returns `None` when nothing is active or the query is disabled.
    pub fn refetch(&self) -> Option<JoinHandle<()>> {
        let (generation, request) = {
            let mut slot = self.shared.lock();
            let request = slot.request.clone()?;
            if !request.options.enabled {
                return None;
            }
            if slot.state.data.is_empty() {
                slot.state.loading = true;
            } else {
                slot.state.is_revalidating = true;
            }
            self.shared.tx.send_replace(slot.state.clone());
            (slot.generation, request)
        };

        let activation = Activation {
            client: self.client.clone(),
            shared: Arc::clone(&self.shared),
            generation,
            request,
        };
        Some(tokio::spawn(activation.revalidate()))
    }

    /// Tear down: clear state and ignore anything still running
    pub fn deactivate(&self) {
        self.shared.retire();
    }

    /// Snapshot of the current state
    pub fn state(&self) -> QueryState<T> {
        self.shared.lock().state.clone()
    }

    /// Receive every published state
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.shared.tx.subscribe()
    }

    /// Key of the active request, if any
    pub fn key(&self) -> Option<String> {
        self.shared.lock().request.as_ref().map(|r| r.key.clone())
    }
}

impl<T: QueryItem> Drop for Query<T> {
    fn drop(&mut self) {
        self.shared.retire();
    }
}

/// One run of a request, tagged with the generation it belongs to
struct Activation<T> {
    client: QueryClient,
    shared: Arc<QueryShared<T>>,
    generation: u64,
    request: QueryRequest<T>,
}

impl<T: QueryItem> Activation<T> {
    async fn run(self) {
        let key = &self.request.key;

        let cached = match self
            .client
            .inner
            .store
            .read_with_freshness(key, self.request.ttl)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Cache read failed for {}, treating as miss: {}", key, e);
                None
            }
        };

        let usable = cached.and_then(|entry| match serde_json::from_str::<Vec<T>>(&entry.data) {
            Ok(items) if !items.is_empty() => Some((items, entry.is_fresh)),
            Ok(_) => None,
            Err(e) => {
                log::debug!("Ignoring unreadable cache entry for {}: {}", key, e);
                None
            }
        });

        match usable {
            Some((items, is_fresh)) => {
                log::debug!("Cache hit: {} (fresh: {})", key, is_fresh);
                let shown = self.shared.commit(self.generation, |state| {
                    state.data = items;
                    state.loading = false;
                    state.error = None;
                    state.is_revalidating = !is_fresh;
                });
                if shown && !is_fresh {
                    self.revalidate().await;
                }
            }
            None => {
                log::debug!("Cache miss: {}", key);
                let shown = self.shared.commit(self.generation, |state| {
                    state.loading = true;
                    state.is_revalidating = false;
                });
                if shown {
                    self.revalidate().await;
                }
            }
        }
    }

    /// Fetch through the in-flight map and commit the outcome
    async fn revalidate(self) {
        let key = self.request.key.clone();
        let fetcher = Arc::clone(&self.request.fetcher);

        let joined = self.client.inner.inflight.join_or_start(&key, move || {
            async move { fetcher().await.map(|page| Arc::new(page) as SharedValue) }.boxed()
        });

        let outcome = joined.fetch.await.and_then(|value| {
            value
                .downcast::<ResultPage<T>>()
                .map_err(|_| FetchError::TypeMismatch(key.clone()))
        });

        match outcome {
            Ok(page) => {
                let items = if self.request.options.deduplicate_by_id {
                    dedupe_by_id(page.results.clone())
                } else {
                    page.results.clone()
                };

                // Only the caller that started the fetch persists it
                if joined.started {
                    self.persist(&items);
                }

                self.shared.commit(self.generation, |state| {
                    state.data = items;
                    state.has_next_page = page.has_next_page;
                    state.error = None;
                    state.loading = false;
                    state.is_revalidating = false;
                });
            }
            Err(err) => {
                self.shared.commit(self.generation, |state| {
                    if state.data.is_empty() {
                        state.error = Some(err.to_string());
                    } else {
                        log::debug!("Background refresh failed for {}: {}", key, err);
                    }
                    state.loading = false;
                    state.is_revalidating = false;
                });
            }
        }
    }

    /// Write fetched items to the store without waiting for the result
    fn persist(&self, items: &[T]) {
        let data = match serde_json::to_string(items) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Failed to serialize results for {}: {}", self.request.key, e);
                return;
            }
        };

        let store = Arc::clone(&self.client.inner.store);
        let key = self.request.key.clone();
        let kind = self.request.kind;
        let ttl = self.request.ttl;
        tokio::spawn(async move {
            if let Err(e) = store.write(&key, &data, kind, ttl).await {
                log::warn!("Failed to persist {}: {}", key, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryStore, ResultKind, SqliteStore};
    use crate::query::mock::{GatedStore, Item, ScriptedFetcher, items};
    use crate::query::{QueryOptions, ResultPage};
    use std::time::Duration;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(600);

    fn setup() -> (QueryClient, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let client = QueryClient::new(store.clone());
        (client, store)
    }

    fn seed(store: &MemoryStore, key: &str, ids: &[&str], age: Duration) {
        let data = serde_json::to_string(&items(ids)).unwrap();
        store.seed(key, &data, ResultKind::Anime, age);
    }

    fn page(ids: &[&str], has_next_page: bool) -> Result<ResultPage<Item>, FetchError> {
        Ok(ResultPage::new(items(ids), has_next_page))
    }

    async fn wait_for_persisted(store: &MemoryStore, key: &str, expected: &str) {
        for _ in 0..100 {
            if store.get(key).is_some_and(|(data, _)| data == expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} was never persisted as {}", key, expected);
    }

    #[tokio::test]
    async fn test_cold_start_loads_then_shows_results() {
        let (client, store) = setup();
        let scripted = ScriptedFetcher::gated();
        let query = client.query::<Item>();

        let handle = query.activate(QueryRequest::new(
            "home:trending",
            scripted.fetcher(page(&["a", "b"], true)),
            TTL,
            ResultKind::Anime,
        ));

        // Loading as soon as activate returns
        assert!(query.state().loading);
        assert!(query.state().data.is_empty());

        scripted.release(1);
        handle.await.unwrap();

        let state = query.state();
        assert_eq!(state.data, items(&["a", "b"]));
        assert!(!state.loading);
        assert!(!state.is_revalidating);
        assert!(state.has_next_page);
        assert_eq!(state.error, None);
        assert_eq!(scripted.calls(), 1);

        wait_for_persisted(&store, "home:trending", &serde_json::to_string(&items(&["a", "b"])).unwrap()).await;
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_fetcher() {
        let (client, store) = setup();
        seed(&store, "home:trending", &["cached"], Duration::from_secs(10));
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "home:trending",
                scripted.fetcher(page(&["new"], false)),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        let state = query.state();
        assert_eq!(state.data, items(&["cached"]));
        assert!(!state.loading);
        assert!(!state.is_revalidating);
        assert_eq!(scripted.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_shows_then_replaces() {
        let (client, store) = setup();
        seed(&store, "home:trending", &["old"], Duration::from_secs(3600));
        let scripted = ScriptedFetcher::gated();
        let query = client.query::<Item>();
        let mut rx = query.subscribe();

        let handle = query.activate(QueryRequest::new(
            "home:trending",
            scripted.fetcher(page(&["new"], false)),
            TTL,
            ResultKind::Anime,
        ));

        let shown = rx.wait_for(|s| !s.data.is_empty()).await.unwrap().clone();
        assert_eq!(shown.data, items(&["old"]));
        assert!(!shown.loading);
        assert!(shown.is_revalidating);

        scripted.release(1);
        handle.await.unwrap();

        let state = query.state();
        assert_eq!(state.data, items(&["new"]));
        assert!(!state.is_revalidating);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_background_failure_keeps_stale_data() {
        let (client, store) = setup();
        seed(&store, "home:trending", &["old"], Duration::from_secs(3600));
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "home:trending",
                scripted.fetcher(Err(FetchError::Network("offline".to_string()))),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        let state = query.state();
        assert_eq!(state.data, items(&["old"]));
        assert!(!state.is_revalidating);
        assert_eq!(state.error, None);
        assert_eq!(scripted.calls(), 1);
    }

    #[tokio::test]
    async fn test_cold_failure_sets_error() {
        let (client, _store) = setup();
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "home:trending",
                scripted.fetcher(Err(FetchError::Network("offline".to_string()))),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        let state = query.state();
        assert!(state.data.is_empty());
        assert!(!state.loading);
        assert!(!state.is_revalidating);
        assert_eq!(state.error.as_deref(), Some("Network error: offline"));
    }

    #[tokio::test]
    async fn test_concurrent_activations_fetch_once() {
        let (client, _store) = setup();
        let scripted = ScriptedFetcher::gated();
        let first = client.query::<Item>();
        let second = client.query::<Item>();

        let request = QueryRequest::new(
            "browse:anime",
            scripted.fetcher(page(&["a"], false)),
            TTL,
            ResultKind::Anime,
        );
        let h1 = first.activate(request.clone());
        let h2 = second.activate(request);

        // Both reach the in-flight map before the fetch is released
        for _ in 0..100 {
            if scripted.calls() == 1 && client.in_flight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        scripted.release(1);
        h1.await.unwrap();
        h2.await.unwrap();

        assert_eq!(scripted.calls(), 1);
        assert_eq!(first.state().data, items(&["a"]));
        assert_eq!(second.state().data, items(&["a"]));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_repeated_refetch_coalesces() {
        let (client, _store) = setup();
        let scripted = ScriptedFetcher::gated();
        let query = client.query::<Item>();

        let activation = query.activate(QueryRequest::new(
            "browse:anime",
            scripted.fetcher(page(&["a"], false)),
            TTL,
            ResultKind::Anime,
        ));
        for _ in 0..100 {
            if scripted.calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let r1 = query.refetch().unwrap();
        let r2 = query.refetch().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        scripted.release(1);
        activation.await.unwrap();
        r1.await.unwrap();
        r2.await.unwrap();

        assert_eq!(scripted.calls(), 1);
        assert_eq!(query.state().data, items(&["a"]));
    }

    #[tokio::test]
    async fn test_dedupe_by_id_on_fetch() {
        let (client, _store) = setup();
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "browse:anime",
                scripted.fetcher(page(&["a", "b", "a"], false)),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();
        assert_eq!(query.state().data, items(&["a", "b"]));

        query
            .activate(
                QueryRequest::new(
                    "browse:anime:raw",
                    scripted.fetcher(page(&["a", "b", "a"], false)),
                    TTL,
                    ResultKind::Anime,
                )
                .options(QueryOptions::new().deduplicate_by_id(false)),
            )
            .await
            .unwrap();
        assert_eq!(query.state().data, items(&["a", "b", "a"]));
    }

    #[tokio::test]
    async fn test_key_switch_discards_late_completion() {
        let (client, _store) = setup();
        let slow = ScriptedFetcher::gated();
        let fast = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        let a = query.activate(QueryRequest::new(
            "browse:A",
            slow.fetcher(page(&["from-a"], true)),
            TTL,
            ResultKind::Anime,
        ));
        for _ in 0..100 {
            if slow.calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let b = query.activate(QueryRequest::new(
            "browse:B",
            fast.fetcher(page(&["from-b"], false)),
            TTL,
            ResultKind::Anime,
        ));
        b.await.unwrap();

        slow.release(1);
        a.await.unwrap();

        let state = query.state();
        assert_eq!(state.data, items(&["from-b"]));
        assert!(!state.has_next_page);
        assert_eq!(query.key().as_deref(), Some("browse:B"));
    }

    #[tokio::test]
    async fn test_key_switch_during_cache_read_discards_old_items() {
        let store = Arc::new(GatedStore::new("browse:A"));
        seed(&store.inner, "browse:A", &["cached-a"], Duration::from_secs(10));
        let client = QueryClient::new(store.clone());
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        let mut rx = query.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let data = rx.borrow_and_update().data.clone();
                    seen.lock().unwrap().push(data);
                }
            })
        };

        let a = query.activate(QueryRequest::new(
            "browse:A",
            scripted.fetcher(page(&["fetched-a"], false)),
            TTL,
            ResultKind::Anime,
        ));
        for _ in 0..100 {
            if store.held_reads() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.held_reads(), 1);

        query
            .activate(QueryRequest::new(
                "browse:B",
                scripted.fetcher(page(&["from-b"], false)),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        store.release(1);
        a.await.unwrap();

        assert_eq!(query.state().data, items(&["from-b"]));
        assert_eq!(query.key().as_deref(), Some("browse:B"));
        // A's read resolved as fresh, so it never reached the fetcher either
        assert_eq!(scripted.calls(), 1);

        drop(query);
        recorder.await.unwrap();
        let seen = seen.lock().unwrap();
        assert!(!seen.iter().any(|data| *data == items(&["cached-a"])));
    }

    #[tokio::test]
    async fn test_superseded_fetch_still_persists() {
        let (client, store) = setup();
        let slow = ScriptedFetcher::gated();
        let query = client.query::<Item>();

        let a = query.activate(QueryRequest::new(
            "browse:A",
            slow.fetcher(page(&["from-a"], false)),
            TTL,
            ResultKind::Manga,
        ));
        for _ in 0..100 {
            if slow.calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        query.deactivate();

        slow.release(1);
        a.await.unwrap();

        assert_eq!(query.state(), QueryState::default());
        wait_for_persisted(&store, "browse:A", &serde_json::to_string(&items(&["from-a"])).unwrap()).await;
    }

    #[tokio::test]
    async fn test_disabled_query_does_nothing() {
        let (client, _store) = setup();
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(
                QueryRequest::new(
                    "browse:anime",
                    scripted.fetcher(page(&["a"], false)),
                    TTL,
                    ResultKind::Anime,
                )
                .options(QueryOptions::new().enabled(false)),
            )
            .await
            .unwrap();

        assert!(!query.state().loading);
        assert!(query.refetch().is_none());
        assert_eq!(scripted.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_read_failure_is_a_miss() {
        let (client, store) = setup();
        seed(&store, "home:trending", &["cached"], Duration::from_secs(10));
        store.fail_reads(true);
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "home:trending",
                scripted.fetcher(page(&["fetched"], false)),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        assert_eq!(scripted.calls(), 1);
        assert_eq!(query.state().data, items(&["fetched"]));
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_silent() {
        let (client, store) = setup();
        store.fail_writes(true);
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "home:trending",
                scripted.fetcher(page(&["fetched"], false)),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        let state = query.state();
        assert_eq!(state.data, items(&["fetched"]));
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn test_empty_cached_array_is_a_miss() {
        let (client, store) = setup();
        store.seed("home:trending", "[]", ResultKind::Anime, Duration::from_secs(10));
        let scripted = ScriptedFetcher::ready();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "home:trending",
                scripted.fetcher(page(&["a"], false)),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        assert_eq!(scripted.calls(), 1);
        assert_eq!(query.state().data, items(&["a"]));
    }

    #[tokio::test]
    async fn test_refetch_with_data_revalidates_in_background() {
        let (client, store) = setup();
        seed(&store, "home:trending", &["cached"], Duration::from_secs(10));
        let scripted = ScriptedFetcher::gated();
        let query = client.query::<Item>();

        query
            .activate(QueryRequest::new(
                "home:trending",
                scripted.fetcher(Err(FetchError::Server("down".to_string()))),
                TTL,
                ResultKind::Anime,
            ))
            .await
            .unwrap();

        let refetch = query.refetch().unwrap();
        let state = query.state();
        assert!(state.is_revalidating);
        assert!(!state.loading);

        scripted.release(1);
        refetch.await.unwrap();

        let state = query.state();
        assert_eq!(state.data, items(&["cached"]));
        assert_eq!(state.error, None);
        assert!(!state.is_revalidating);
    }

    #[tokio::test]
    async fn test_persisted_results_survive_new_client() {
        let dir = TempDir::new().unwrap();
        let scripted = ScriptedFetcher::ready();

        {
            let store = Arc::new(SqliteStore::open(Some(dir.path())).unwrap());
            let client = QueryClient::new(store);
            let query = client.query::<Item>();
            query
                .activate(QueryRequest::new(
                    "browse:manga",
                    scripted.fetcher(page(&["m1", "m2"], false)),
                    TTL,
                    ResultKind::Manga,
                ))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let store = Arc::new(SqliteStore::open(Some(dir.path())).unwrap());
        let client = QueryClient::new(store);
        let query = client.query::<Item>();
        query
            .activate(QueryRequest::new(
                "browse:manga",
                scripted.fetcher(page(&["other"], false)),
                TTL,
                ResultKind::Manga,
            ))
            .await
            .unwrap();

        assert_eq!(query.state().data, items(&["m1", "m2"]));
        assert_eq!(scripted.calls(), 1);
    }
}
