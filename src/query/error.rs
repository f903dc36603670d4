use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

/// Failure captured on a cache entry or returned from a mutation.
///
/// Errors are values here: a failed fetch is stored on its entry and a failed
/// mutation is returned to the caller. Nothing in the store panics on them.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum QueryError {
  /// The collaborator's read was rejected
  #[error("{0}")]
  Fetch(String),
  /// The collaborator's write was rejected
  #[error("{0}")]
  Mutation(String),
  /// The store was disposed
  #[error("query store has been disposed")]
  Disposed,
}

impl QueryError {
  pub(crate) fn fetch(error: impl Display) -> Self {
    Self::Fetch(format!("{error:#}"))
  }

  pub(crate) fn mutation(error: impl Display) -> Self {
    Self::Mutation(format!("{error:#}"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_display_is_collaborator_message() {
    assert_eq!(QueryError::fetch("boom").to_string(), "boom");
    assert_eq!(QueryError::mutation("nope").to_string(), "nope");
  }

  #[test]
  fn test_keeps_eyre_context_chain() {
    let report = eyre!("connection reset").wrap_err("Failed to list posts");
    assert_eq!(
      QueryError::fetch(report).to_string(),
      "Failed to list posts: connection reset"
    );
  }

  #[test]
  fn test_serializes_with_kind_tag() {
    let json = serde_json::to_value(QueryError::fetch("boom")).unwrap();
    assert_eq!(json["kind"], "fetch");
    assert_eq!(json["message"], "boom");
  }
}
