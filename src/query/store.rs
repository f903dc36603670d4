//! Read-through query store with deduplicated fetches and invalidation.
//!
//! A [`QueryStore`] holds one [`CacheEntry`] per [`QueryKey`]. Reading a key
//! that was never fetched spawns a fetch through the injected fetcher and
//! hands back the entry in `Loading` state right away; callers learn about
//! the outcome through [`QueryStore::subscribe`] or by awaiting
//! [`QueryStore::fetch`].
//!
//! # Example
//!
//! ```ignore
//! let posts = posts_source.clone();
//! let store = QueryStore::new(move |_key| {
//!     let posts = posts.clone();
//!     async move { posts.list().await }
//! });
//!
//! let _subscription = store.subscribe("posts", |entry| render(entry));
//!
//! // Loading now, Success once the source answers
//! let entry = store.get("posts");
//!
//! // After a write, refresh in the background
//! store.invalidate("posts");
//! ```
//!
//! All methods must be called from within a Tokio runtime.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::entry::{CacheEntry, QueryStatus};
use super::error::QueryError;
use super::key::QueryKey;
use super::mutation::Invalidate;

/// A factory creating the fetch future for a key
type FetcherFn<T> =
  Box<dyn Fn(&QueryKey) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// A subscriber callback
type Listener<T> = Arc<dyn Fn(&CacheEntry<T>) + Send + Sync>;

struct Slot<T> {
  entry: CacheEntry<T>,
  /// Generation of the most recently started fetch
  generation: u64,
  /// Set while a fetch is in flight
  task: Option<AbortHandle>,
  refetch_queued: bool,
  listeners: Vec<(u64, Listener<T>)>,
}

impl<T> Slot<T> {
  fn new(key: QueryKey) -> Self {
    Self {
      entry: CacheEntry::idle(key),
      generation: 0,
      task: None,
      refetch_queued: false,
      listeners: Vec::new(),
    }
  }
}

struct State<T> {
  slots: HashMap<QueryKey, Slot<T>>,
  /// Entry snapshots waiting to be handed to subscribers, in transition order
  pending: VecDeque<CacheEntry<T>>,
  delivering: bool,
  disposed: bool,
  stale_time: Option<Duration>,
  next_generation: u64,
  next_listener: u64,
}

struct Shared<T> {
  state: Mutex<State<T>>,
  fetcher: FetcherFn<T>,
}

/// Shared handle to a query cache.
///
/// Cloning is cheap; clones refer to the same entries.
pub struct QueryStore<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for QueryStore<T> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

/// What a waiter sees when it looks at a key
enum Probe<T> {
  Settled(CacheEntry<T>),
  Pending,
  Missing,
  Disposed,
}

impl<T: Clone + Send + 'static> QueryStore<T> {
  /// Create a store that loads every key through `fetcher`.
  ///
  /// The fetcher receives the key being loaded and is called once per fetch.
  /// Its error is rendered with `{:#}` and kept on the entry.
  pub fn new<F, Fut, E>(fetcher: F) -> Self
  where
    F: Fn(&QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Display + Send + 'static,
  {
    let fetcher: FetcherFn<T> = Box::new(move |key: &QueryKey| {
      let fetch = fetcher(key);
      async move { fetch.await.map_err(QueryError::fetch) }.boxed()
    });

    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State {
          slots: HashMap::new(),
          pending: VecDeque::new(),
          delivering: false,
          disposed: false,
          stale_time: None,
          next_generation: 0,
          next_listener: 0,
        }),
        fetcher,
      }),
    }
  }

  /// Set the stale time for cached data.
  ///
  /// A successful entry older than this is refetched in the background by the
  /// next `get`. Without a stale time, data stays fresh until invalidated.
  pub fn with_stale_time(self, stale_time: Duration) -> Self {
    self.lock().stale_time = Some(stale_time);
    self
  }

  /// Return the current entry for `key`, starting a fetch when needed.
  ///
  /// A fetch starts when the entry is new, idle, failed, or stale. While one
  /// is in flight, further calls attach to it instead of fetching again.
  pub fn get(&self, key: impl Into<QueryKey>) -> CacheEntry<T> {
    let key = key.into();

    let entry = {
      let mut state = self.lock();
      if state.disposed {
        return CacheEntry::disposed(key);
      }

      let stale_time = state.stale_time;
      let slot = state.slot(&key);
      let should_fetch = slot.task.is_none()
        && match slot.entry.status {
          QueryStatus::Idle | QueryStatus::Error => true,
          QueryStatus::Loading => false,
          QueryStatus::Success => is_stale(&slot.entry, stale_time),
        };
      if slot.task.is_some() {
        debug!(key = %key, "Attaching to in-flight fetch");
      }

      if should_fetch {
        state.start_fetch(&key, self.weak());
      }
      state.slot(&key).entry.clone()
    };

    self.deliver();
    entry
  }

  /// Get `key` and wait until it has no fetch in flight or queued.
  ///
  /// Returns the settled entry, which is either `Success` or `Error`.
  pub async fn fetch(&self, key: impl Into<QueryKey>) -> CacheEntry<T> {
    let key = key.into();

    loop {
      // Subscribe before reading so no transition is missed
      let (tx, mut rx) = mpsc::unbounded_channel();
      let _subscription = self.subscribe(key.clone(), move |_: &CacheEntry<T>| {
        let _ = tx.send(());
      });
      self.get(key.clone());

      loop {
        match self.probe(&key) {
          Probe::Settled(entry) => return entry,
          Probe::Disposed => return CacheEntry::disposed(key),
          Probe::Missing => break,
          Probe::Pending => {}
        }
        // The sender goes away when the entry is removed; start over
        if rx.recv().await.is_none() {
          break;
        }
      }
    }
  }

  /// Mark `key` stale and refetch it in the background.
  ///
  /// Unknown and never-fetched keys are left alone. If a fetch is already in
  /// flight, one follow-up fetch is queued to run when it completes; more
  /// invalidations before then are coalesced into that one.
  pub fn invalidate(&self, key: impl Into<QueryKey>) {
    let key = key.into();

    {
      let mut state = self.lock();
      if state.disposed {
        return;
      }

      let Some(slot) = state.slots.get_mut(&key) else {
        debug!(key = %key, "Nothing cached, skipping invalidation");
        return;
      };
      if slot.entry.is_idle() {
        debug!(key = %key, "Never fetched, skipping invalidation");
        return;
      }

      slot.entry.is_invalidated = true;
      if slot.task.is_some() {
        if slot.refetch_queued {
          debug!(key = %key, "Refetch already queued");
        } else {
          debug!(key = %key, "Fetch in flight, queueing refetch");
          slot.refetch_queued = true;
        }
        return;
      }

      state.start_fetch(&key, self.weak());
    }

    self.deliver();
  }

  /// Call `callback` after every change of the entry for `key`.
  ///
  /// Subscribing does not fetch. The callback stops when the returned
  /// [`Subscription`] is dropped or unsubscribed.
  pub fn subscribe<F>(&self, key: impl Into<QueryKey>, callback: F) -> Subscription
  where
    F: Fn(&CacheEntry<T>) + Send + Sync + 'static,
  {
    let key = key.into();
    let mut state = self.lock();
    if state.disposed {
      return Subscription::inert();
    }

    state.next_listener += 1;
    let id = state.next_listener;
    state.slot(&key).listeners.push((id, Arc::new(callback)));

    let store = self.weak();
    Subscription::new(move || {
      if let Some(shared) = store.upgrade() {
        QueryStore { shared }.unsubscribe(&key, id);
      }
    })
  }

  /// Current entry for `key`, without fetching.
  pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.lock().slots.get(key).map(|slot| slot.entry.clone())
  }

  /// Whether `key` has a fetch in flight or queued.
  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self
      .lock()
      .slots
      .get(key)
      .is_some_and(|slot| slot.task.is_some() || slot.refetch_queued)
  }

  /// Write `data` for `key` directly, as if a fetch had returned it.
  ///
  /// A fetch already in flight is not cancelled; its result lands afterwards.
  pub fn set_data(&self, key: impl Into<QueryKey>, data: T) {
    let key = key.into();

    {
      let mut guard = self.lock();
      let state = &mut *guard;
      if state.disposed {
        return;
      }

      let slot = state
        .slots
        .entry(key.clone())
        .or_insert_with(|| Slot::new(key));
      slot.entry.data = Some(data);
      slot.entry.status = QueryStatus::Success;
      slot.entry.error = None;
      slot.entry.last_updated = Some(Utc::now());
      state.pending.push_back(slot.entry.clone());
    }

    self.deliver();
  }

  /// Evict `key`, aborting its fetch and dropping its subscribers.
  pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    let slot = self.lock().slots.remove(key)?;
    if let Some(task) = &slot.task {
      debug!(key = %key, "Aborting fetch of removed entry");
      task.abort();
    }
    Some(slot.entry)
  }

  /// All entries, ordered by key.
  pub fn snapshot(&self) -> Vec<CacheEntry<T>> {
    let mut entries: Vec<_> = self
      .lock()
      .slots
      .values()
      .map(|slot| slot.entry.clone())
      .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  /// Tear the store down: abort fetches, drop entries and subscribers.
  pub fn dispose(&self) {
    let slots = {
      let mut state = self.lock();
      state.disposed = true;
      state.pending.clear();
      std::mem::take(&mut state.slots)
    };

    for (key, slot) in &slots {
      if let Some(task) = &slot.task {
        debug!(key = %key, "Aborting fetch on dispose");
        task.abort();
      }
    }
    debug!(entries = slots.len(), "Query store disposed");
  }

  pub fn is_disposed(&self) -> bool {
    self.lock().disposed
  }

  fn complete(&self, key: &QueryKey, generation: u64, result: Result<T, QueryError>) {
    self.lock().complete(key, generation, result, self.weak());
    self.deliver();
  }

  fn unsubscribe(&self, key: &QueryKey, id: u64) {
    // Dropped outside the lock, the callback may own store handles
    let removed = {
      let mut state = self.lock();
      state.slots.get_mut(key).and_then(|slot| {
        let index = slot.listeners.iter().position(|(lid, _)| *lid == id)?;
        Some(slot.listeners.remove(index))
      })
    };
    drop(removed);
  }

  fn probe(&self, key: &QueryKey) -> Probe<T> {
    let state = self.lock();
    if state.disposed {
      return Probe::Disposed;
    }
    match state.slots.get(key) {
      None => Probe::Missing,
      Some(slot) if slot.task.is_some() || slot.refetch_queued => Probe::Pending,
      Some(slot) if slot.entry.is_settled() => Probe::Settled(slot.entry.clone()),
      Some(_) => Probe::Pending,
    }
  }

  /// Hand queued snapshots to subscribers, outside the lock.
  ///
  /// Only one caller drains at a time. Notifications raised by a callback are
  /// queued and delivered by the loop that is already running.
  fn deliver(&self) {
    {
      let mut state = self.lock();
      if state.delivering || state.pending.is_empty() {
        return;
      }
      state.delivering = true;
    }
    let _draining = Draining(self);

    loop {
      let (entry, listeners) = {
        let mut state = self.lock();
        let Some(entry) = state.pending.pop_front() else {
          state.delivering = false;
          return;
        };
        let listeners: Vec<Listener<T>> = state
          .slots
          .get(&entry.key)
          .map(|slot| slot.listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
          .unwrap_or_default();
        (entry, listeners)
      };

      for listener in listeners {
        listener(&entry);
      }
    }
  }

  fn weak(&self) -> Weak<Shared<T>> {
    Arc::downgrade(&self.shared)
  }

  fn lock(&self) -> MutexGuard<'_, State<T>> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: Clone + Send + 'static> State<T> {
  fn slot(&mut self, key: &QueryKey) -> &mut Slot<T> {
    self
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone()))
  }

  /// Move `key` to loading and spawn its fetch. Nothing may be in flight.
  fn start_fetch(&mut self, key: &QueryKey, store: Weak<Shared<T>>) {
    self.next_generation += 1;
    let generation = self.next_generation;

    let slot = self
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone()));
    slot.generation = generation;
    slot.entry.status = QueryStatus::Loading;

    // The fetcher runs inside the task, never under the lock
    let task_key = key.clone();
    let task = tokio::spawn(async move {
      let fetch = async {
        let fetch = store.upgrade().map(|shared| (shared.fetcher)(&task_key))?;
        Some(fetch.await)
      };
      // A panicking fetcher must still settle the entry
      let result = match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(Some(result)) => result,
        Ok(None) => return,
        Err(panic) => Err(QueryError::Fetch(format!(
          "fetch panicked: {}",
          panic_message(panic.as_ref())
        ))),
      };
      if let Some(shared) = store.upgrade() {
        QueryStore { shared }.complete(&task_key, generation, result);
      }
    });
    slot.task = Some(task.abort_handle());

    debug!(key = %key, generation, "Starting fetch");
    self.pending.push_back(slot.entry.clone());
  }

  fn complete(
    &mut self,
    key: &QueryKey,
    generation: u64,
    result: Result<T, QueryError>,
    store: Weak<Shared<T>>,
  ) {
    let Some(slot) = self.slots.get_mut(key) else {
      debug!(key = %key, generation, "Entry removed, discarding fetch result");
      return;
    };
    if slot.generation != generation {
      debug!(
        key = %key,
        generation,
        latest = slot.generation,
        "Discarding result of superseded fetch"
      );
      return;
    }

    slot.task = None;
    match result {
      Ok(data) => {
        debug!(key = %key, generation, "Fetch succeeded");
        slot.entry.data = Some(data);
        slot.entry.status = QueryStatus::Success;
        slot.entry.error = None;
        slot.entry.last_updated = Some(Utc::now());
        slot.entry.is_invalidated = slot.refetch_queued;
      }
      Err(error) => {
        warn!(key = %key, generation, %error, "Fetch failed");
        slot.entry.status = QueryStatus::Error;
        slot.entry.error = Some(error);
      }
    }
    self.pending.push_back(slot.entry.clone());

    if slot.refetch_queued {
      slot.refetch_queued = false;
      debug!(key = %key, "Running queued refetch");
      self.start_fetch(key, store);
    }
  }
}

fn is_stale<T>(entry: &CacheEntry<T>, stale_time: Option<Duration>) -> bool {
  let Some(stale_time) = stale_time else {
    return false;
  };
  match entry.age(Utc::now()) {
    Some(age) => age.to_std().is_ok_and(|age| age >= stale_time),
    None => true,
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message
  } else {
    "unknown panic"
  }
}

/// Releases the delivery flag if a subscriber panics mid-drain.
struct Draining<'a, T: Clone + Send + 'static>(&'a QueryStore<T>);

impl<T: Clone + Send + 'static> Drop for Draining<'_, T> {
  fn drop(&mut self) {
    if std::thread::panicking() {
      self.0.lock().delivering = false;
    }
  }
}

impl<T: Clone + Send + 'static> Invalidate for QueryStore<T> {
  fn invalidate(&self, key: &QueryKey) {
    QueryStore::invalidate(self, key);
  }
}

impl<T> fmt::Debug for QueryStore<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    f.debug_struct("QueryStore")
      .field("entries", &state.slots.len())
      .field("stale_time", &state.stale_time)
      .field("disposed", &state.disposed)
      .finish_non_exhaustive()
  }
}

/// Handle returned by [`QueryStore::subscribe`].
///
/// The callback stays registered until this is dropped or
/// [`unsubscribe`](Subscription::unsubscribe)d.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      release: Some(Box::new(release)),
    }
  }

  fn inert() -> Self {
    Self { release: None }
  }

  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if let Some(release) = self.release.take() {
      release();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.release.is_some())
      .finish()
  }
}
