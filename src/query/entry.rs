//! Per-key cache entries and their status.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::QueryError;
use super::key::QueryKey;

/// The status of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  /// Entry exists (e.g. has subscribers) but was never fetched
  Idle,
  /// A fetch is in flight; previous data, if any, is still readable
  Loading,
  /// The last fetch succeeded
  Success,
  /// The last fetch failed
  Error,
}

/// Snapshot of one cached resource.
///
/// Entries handed out by the store are copies; the store owns the live one.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry<T> {
  pub key: QueryKey,
  /// Last successfully fetched value. Kept while a refetch is loading.
  pub data: Option<T>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  /// When `data` was last written
  pub last_updated: Option<DateTime<Utc>>,
  /// Set by an invalidation, cleared once a fetch succeeds
  pub is_invalidated: bool,
}

impl<T> CacheEntry<T> {
  pub(crate) fn idle(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      status: QueryStatus::Idle,
      error: None,
      last_updated: None,
      is_invalidated: false,
    }
  }

  pub(crate) fn disposed(key: QueryKey) -> Self {
    Self {
      status: QueryStatus::Error,
      error: Some(QueryError::Disposed),
      ..Self::idle(key)
    }
  }

  pub fn is_idle(&self) -> bool {
    self.status == QueryStatus::Idle
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Settled entries are neither idle nor loading.
  pub fn is_settled(&self) -> bool {
    self.is_success() || self.is_error()
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }

  /// Age of `data` relative to `now`, if any data was ever written.
  pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
    self.last_updated.map(|at| now - at)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_idle_entry_has_nothing() {
    let entry: CacheEntry<u32> = CacheEntry::idle("posts".into());
    assert!(entry.is_idle());
    assert!(!entry.is_settled());
    assert_eq!(entry.data(), None);
    assert!(entry.error().is_none());
    assert!(entry.age(Utc::now()).is_none());
  }

  #[test]
  fn test_disposed_entry_is_settled_error() {
    let entry: CacheEntry<u32> = CacheEntry::disposed("posts".into());
    assert!(entry.is_error());
    assert!(entry.is_settled());
    assert_eq!(entry.error(), Some(&QueryError::Disposed));
  }

  #[test]
  fn test_status_serializes_lowercase() {
    let json = serde_json::to_string(&QueryStatus::Success).unwrap();
    assert_eq!(json, r#""success""#);
  }
}
