//! Async query cache inspired by TanStack Query.
//!
//! - [`QueryStore`] caches one entry per [`QueryKey`], deduplicates fetches
//!   and refetches invalidated keys in the background
//! - [`MutationExecutor`] runs writes and invalidates the keys they touch

mod entry;
mod error;
mod key;
mod mutation;
mod store;

pub use entry::{CacheEntry, QueryStatus};
pub use error::QueryError;
pub use key::QueryKey;
pub use mutation::{Invalidate, MutationExecutor, MutationStatus};
pub use store::{QueryStore, Subscription};
