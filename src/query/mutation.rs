//! Writes against the data source, followed by cache invalidation.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::QueryError;
use super::key::QueryKey;

/// Anything that can mark a cached key stale.
///
/// [`QueryStore`](super::QueryStore) implements this; mutations only need
/// this much of it.
pub trait Invalidate: Send + Sync {
  fn invalidate(&self, key: &QueryKey);
}

impl<I: Invalidate + ?Sized> Invalidate for Arc<I> {
  fn invalidate(&self, key: &QueryKey) {
    (**self).invalidate(key);
  }
}

/// Status of a mutation executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  /// Nothing has run yet (or the executor was reset)
  Idle,
  /// At least one run has not resolved
  Pending,
  /// The most recently settled run succeeded
  Success,
  /// The most recently settled run failed
  Error,
}

type MutateFn<P, R> = Box<dyn Fn(P) -> BoxFuture<'static, Result<R, QueryError>> + Send + Sync>;

#[derive(Debug)]
struct Progress {
  in_flight: usize,
  last: MutationStatus,
  last_error: Option<QueryError>,
}

/// Runs writes and invalidates the keys they affect.
///
/// Every call to [`run`](Self::run) is a single, independent attempt: no
/// retries and no deduplication of concurrent runs.
pub struct MutationExecutor<P, R> {
  mutate: Arc<MutateFn<P, R>>,
  cache: Arc<dyn Invalidate>,
  progress: Arc<Mutex<Progress>>,
}

impl<P, R> Clone for MutationExecutor<P, R> {
  fn clone(&self) -> Self {
    Self {
      mutate: Arc::clone(&self.mutate),
      cache: Arc::clone(&self.cache),
      progress: Arc::clone(&self.progress),
    }
  }
}

impl<P: Send + 'static, R: Send + 'static> MutationExecutor<P, R> {
  pub fn new<C, F, Fut, E>(cache: C, mutate: F) -> Self
  where
    C: Invalidate + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    E: Display + Send + 'static,
  {
    let mutate: MutateFn<P, R> = Box::new(move |payload: P| {
      let write = mutate(payload);
      async move { write.await.map_err(QueryError::mutation) }.boxed()
    });

    Self {
      mutate: Arc::new(mutate),
      cache: Arc::new(cache),
      progress: Arc::new(Mutex::new(Progress {
        in_flight: 0,
        last: MutationStatus::Idle,
        last_error: None,
      })),
    }
  }

  /// Run the mutation with `payload`.
  ///
  /// On success every key in `invalidate` is invalidated before the result is
  /// returned. On failure nothing is invalidated.
  pub async fn run(&self, payload: P, invalidate: &[QueryKey]) -> Result<R, QueryError> {
    let pending = self.begin();
    self.execute(payload, invalidate, pending).await
  }

  /// Fire-and-forget variant of [`run`](Self::run).
  ///
  /// The executor reports `Pending` as soon as this returns.
  pub fn mutate(&self, payload: P, invalidate: Vec<QueryKey>) -> JoinHandle<Result<R, QueryError>> {
    let pending = self.begin();
    let executor = self.clone();
    tokio::spawn(async move { executor.execute(payload, &invalidate, pending).await })
  }

  pub fn status(&self) -> MutationStatus {
    let progress = self.progress();
    if progress.in_flight > 0 {
      MutationStatus::Pending
    } else {
      progress.last
    }
  }

  /// Whether any run is unresolved. Used to keep a submit control disabled.
  pub fn is_pending(&self) -> bool {
    self.status() == MutationStatus::Pending
  }

  /// Error of the most recently settled run, if it failed.
  pub fn last_error(&self) -> Option<QueryError> {
    self.progress().last_error.clone()
  }

  /// Forget the last outcome. Does nothing while a run is pending.
  pub fn reset(&self) {
    let mut progress = self.progress();
    if progress.in_flight == 0 {
      progress.last = MutationStatus::Idle;
      progress.last_error = None;
    }
  }

  fn begin(&self) -> Pending {
    self.progress().in_flight += 1;
    Pending {
      progress: Arc::clone(&self.progress),
    }
  }

  async fn execute(
    &self,
    payload: P,
    invalidate: &[QueryKey],
    pending: Pending,
  ) -> Result<R, QueryError> {
    let result = (self.mutate)(payload).await;

    match &result {
      Ok(_) => {
        for key in invalidate {
          debug!(key = %key, "Mutation succeeded, invalidating");
          self.cache.invalidate(key);
        }
        pending.settle(MutationStatus::Success, None);
      }
      Err(error) => {
        warn!(%error, "Mutation failed");
        pending.settle(MutationStatus::Error, Some(error.clone()));
      }
    }

    result
  }

  fn progress(&self) -> MutexGuard<'_, Progress> {
    self.progress.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<P, R> fmt::Debug for MutationExecutor<P, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationExecutor")
      .field("progress", &self.progress)
      .finish_non_exhaustive()
  }
}

/// One unresolved run. Dropping it, settled or not, ends the pending state.
struct Pending {
  progress: Arc<Mutex<Progress>>,
}

impl Pending {
  fn settle(&self, status: MutationStatus, error: Option<QueryError>) {
    let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
    progress.last = status;
    progress.last_error = error;
  }
}

impl Drop for Pending {
  fn drop(&mut self) {
    let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
    progress.in_flight = progress.in_flight.saturating_sub(1);
  }
}
