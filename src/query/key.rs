//! Query keys identify one cached resource.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a cached resource, e.g. `["posts"]` or `["posts", "42"]`.
///
/// Keys compare by value: two keys built from the same parts name the same entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
  pub fn new<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  pub fn parts(&self) -> &[String] {
    &self.0
  }

  /// Human readable description used in logs.
  pub fn description(&self) -> String {
    self.0.join("/")
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}

impl From<&str> for QueryKey {
  fn from(part: &str) -> Self {
    Self(vec![part.to_string()])
  }
}

impl From<String> for QueryKey {
  fn from(part: String) -> Self {
    Self(vec![part])
  }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for QueryKey {
  fn from(parts: [S; N]) -> Self {
    Self::new(parts)
  }
}

impl<S: Into<String>> From<Vec<S>> for QueryKey {
  fn from(parts: Vec<S>) -> Self {
    Self::new(parts)
  }
}

impl From<&QueryKey> for QueryKey {
  fn from(key: &QueryKey) -> Self {
    key.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_compare_by_value() {
    assert_eq!(QueryKey::from("posts"), QueryKey::from(["posts"]));
    assert_eq!(
      QueryKey::from(vec!["posts", "1"]),
      QueryKey::new(["posts".to_string(), "1".to_string()])
    );
    assert_ne!(QueryKey::from("posts"), QueryKey::from(["posts", "1"]));
  }

  #[test]
  fn test_display_joins_parts() {
    let key = QueryKey::from(["posts", "drafts"]);
    assert_eq!(key.to_string(), "posts/drafts");
    assert_eq!(key.parts().len(), 2);
  }

  #[test]
  fn test_serializes_as_plain_list() {
    let key = QueryKey::from(["posts", "1"]);
    assert_eq!(serde_json::to_string(&key).unwrap(), r#"["posts","1"]"#);
  }
}
