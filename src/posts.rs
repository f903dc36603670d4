//! In-memory posts source with simulated network latency.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::query::{CacheEntry, MutationExecutor, QueryKey, QueryStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
  pub id: Uuid,
  pub title: String,
}

impl Post {
  pub fn new(title: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      title: title.into(),
    }
  }
}

/// Cache key of the posts list
pub fn posts_key() -> QueryKey {
  QueryKey::from("posts")
}

/// Mock data source holding posts in memory.
///
/// Every call waits `latency` before answering. Reads can be made to fail a
/// number of times to exercise error handling.
#[derive(Clone)]
pub struct MockPosts {
  posts: Arc<Mutex<Vec<Post>>>,
  latency: Duration,
  failing_reads: Arc<AtomicUsize>,
}

impl MockPosts {
  pub fn new<I, S>(titles: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      posts: Arc::new(Mutex::new(titles.into_iter().map(Post::new).collect())),
      latency: Duration::ZERO,
      failing_reads: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// Make the next `count` reads fail.
  pub fn with_failing_reads(self, count: usize) -> Self {
    self.failing_reads.store(count, Ordering::SeqCst);
    self
  }

  /// List all posts in insertion order
  pub async fn list(&self) -> Result<Vec<Post>> {
    tokio::time::sleep(self.latency).await;

    let failing = self
      .failing_reads
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failing {
      return Err(eyre!("Failed to list posts: source unavailable"));
    }

    Ok(self.posts().clone())
  }

  /// Append a post and return its new id
  pub async fn append(&self, title: String) -> Result<Uuid> {
    tokio::time::sleep(self.latency).await;

    if title.trim().is_empty() {
      return Err(eyre!("Failed to add post: title must not be empty"));
    }

    let post = Post::new(title);
    let id = post.id;
    self.posts().push(post);
    Ok(id)
  }

  fn posts(&self) -> MutexGuard<'_, Vec<Post>> {
    self.posts.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Query store reading the posts list from `source`.
pub fn posts_store(source: &MockPosts, stale_time: Option<Duration>) -> QueryStore<Vec<Post>> {
  let source = source.clone();
  let store = QueryStore::new(move |_key: &QueryKey| {
    let source = source.clone();
    async move { source.list().await }
  });

  match stale_time {
    Some(stale_time) => store.with_stale_time(stale_time),
    None => store,
  }
}

/// Mutation appending a post with the given title.
pub fn add_post_mutation(
  store: &QueryStore<Vec<Post>>,
  source: &MockPosts,
) -> MutationExecutor<String, Uuid> {
  let source = source.clone();
  MutationExecutor::new(store.clone(), move |title: String| {
    let source = source.clone();
    async move { source.append(title).await }
  })
}

/// Render a posts entry as text, or as JSON when `json` is set.
pub fn render(entry: &CacheEntry<Vec<Post>>, json: bool) -> Result<String> {
  if json {
    return serde_json::to_string_pretty(entry)
      .map_err(|e| eyre!("Failed to serialize posts: {}", e));
  }

  if let Some(error) = entry.error() {
    return Ok(format!("Error: {}", error));
  }

  let posts = entry.data().map(Vec::as_slice).unwrap_or_default();
  let mut out = format!("Posts ({})", posts.len());
  for post in posts {
    out.push_str(&format!("\n  {}  {}", post.id, post.title));
  }
  Ok(out)
}

/// Print an entry: data goes to `out`, a failed read is reported on `err`.
///
/// In JSON mode the full entry still goes to `out` so it stays machine readable.
pub fn print_entry(
  entry: &CacheEntry<Vec<Post>>,
  json: bool,
  out: &mut impl Write,
  err: &mut impl Write,
) -> Result<()> {
  let rendered = render(entry, json)?;

  if let Some(error) = entry.error() {
    warn!(key = %entry.key, %error, "Failed to load posts");
    if json {
      writeln!(err, "Error: {}", error)?;
    } else {
      writeln!(err, "{}", rendered)?;
      return Ok(());
    }
  }

  writeln!(out, "{}", rendered)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::{MutationStatus, QueryError};

  fn titles(entry: &CacheEntry<Vec<Post>>) -> Vec<&str> {
    entry
      .data()
      .map(|posts| posts.iter().map(|p| p.title.as_str()).collect())
      .unwrap_or_default()
  }

  #[tokio::test]
  async fn test_initial_load() {
    let source = MockPosts::new(["Post 1", "Post 2"]).with_latency(Duration::from_millis(10));
    let store = posts_store(&source, None);

    let entry = store.get(posts_key());
    assert!(entry.is_loading());
    assert!(entry.data().is_none());

    let entry = store.fetch(posts_key()).await;
    assert!(entry.is_success());
    assert_eq!(titles(&entry), vec!["Post 1", "Post 2"]);
  }

  #[tokio::test]
  async fn test_add_post_refetches_list() {
    let source = MockPosts::new(["Post 1", "Post 2"]).with_latency(Duration::from_millis(5));
    let store = posts_store(&source, None);
    let add_post = add_post_mutation(&store, &source);

    store.fetch(posts_key()).await;
    let id = add_post
      .run("New Title".to_string(), &[posts_key()])
      .await
      .unwrap();

    let entry = store.fetch(posts_key()).await;
    assert_eq!(titles(&entry), vec!["Post 1", "Post 2", "New Title"]);
    assert_eq!(entry.data().unwrap()[2].id, id);
  }

  #[tokio::test]
  async fn test_failed_read_recovers_on_invalidate() {
    let source = MockPosts::new(["Post 1"]).with_failing_reads(1);
    let store = posts_store(&source, None);

    let entry = store.fetch(posts_key()).await;
    assert!(entry.is_error());
    assert_eq!(
      entry.error(),
      Some(&QueryError::Fetch(
        "Failed to list posts: source unavailable".to_string()
      ))
    );

    store.invalidate(posts_key());
    let entry = store.fetch(posts_key()).await;
    assert!(entry.is_success());
    assert_eq!(titles(&entry), vec!["Post 1"]);
  }

  #[tokio::test]
  async fn test_empty_title_is_rejected() {
    let source = MockPosts::new(["Post 1"]);
    let store = posts_store(&source, None);
    let add_post = add_post_mutation(&store, &source);

    store.fetch(posts_key()).await;
    let result = add_post.run("  ".to_string(), &[posts_key()]).await;

    assert!(matches!(result, Err(QueryError::Mutation(_))));
    assert_eq!(add_post.status(), MutationStatus::Error);
    assert!(!store.is_fetching(&posts_key()));
    assert_eq!(source.list().await.unwrap().len(), 1);
  }

  #[test]
  fn test_ids_are_unique() {
    let source = MockPosts::new(["Post 1", "Post 2"]);
    let posts = source.posts().clone();
    assert_ne!(posts[0].id, posts[1].id);
  }

  #[tokio::test]
  async fn test_render_text_and_json() {
    let source = MockPosts::new(["Post 1"]);
    let store = posts_store(&source, None);
    let entry = store.fetch(posts_key()).await;

    let text = render(&entry, false).unwrap();
    assert!(text.starts_with("Posts (1)"));
    assert!(text.contains("Post 1"));

    let json: serde_json::Value = serde_json::from_str(&render(&entry, true).unwrap()).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["key"], serde_json::json!(["posts"]));
    assert_eq!(json["data"][0]["title"], "Post 1");
  }

  #[tokio::test]
  async fn test_render_error() {
    let source = MockPosts::new(["Post 1"]).with_failing_reads(1);
    let store = posts_store(&source, None);
    let entry = store.fetch(posts_key()).await;

    assert_eq!(
      render(&entry, false).unwrap(),
      "Error: Failed to list posts: source unavailable"
    );
  }

  #[tokio::test]
  async fn test_failed_read_is_printed_to_stderr() {
    let source = MockPosts::new(["Post 1"]).with_failing_reads(1);
    let store = posts_store(&source, None);
    let entry = store.fetch(posts_key()).await;

    let (mut out, mut err) = (Vec::new(), Vec::new());
    print_entry(&entry, false, &mut out, &mut err).unwrap();
    assert!(out.is_empty());
    assert_eq!(
      String::from_utf8(err).unwrap(),
      "Error: Failed to list posts: source unavailable\n"
    );

    let (mut out, mut err) = (Vec::new(), Vec::new());
    print_entry(&entry, true, &mut out, &mut err).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json["status"], "error");
    assert!(String::from_utf8(err).unwrap().contains("source unavailable"));
  }

  #[tokio::test]
  async fn test_successful_read_is_printed_to_stdout() {
    let source = MockPosts::new(["Post 1"]);
    let store = posts_store(&source, None);
    let entry = store.fetch(posts_key()).await;

    let (mut out, mut err) = (Vec::new(), Vec::new());
    print_entry(&entry, false, &mut out, &mut err).unwrap();
    assert!(String::from_utf8(out).unwrap().starts_with("Posts (1)"));
    assert!(err.is_empty());
  }
}
