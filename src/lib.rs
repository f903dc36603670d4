//! Read-through query cache with invalidation-triggered refetch.
//!
//! The [`query`] module is the library proper. [`posts`] is an in-memory
//! data source with simulated latency used by the `querykit` binary.

pub mod config;
pub mod logging;
pub mod posts;
pub mod query;

pub use query::{
  CacheEntry, Invalidate, MutationExecutor, MutationStatus, QueryError, QueryKey, QueryStatus,
  QueryStore, Subscription,
};
