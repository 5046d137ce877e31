//! Volume and container handles.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A handle naming a volume or container on a worker.
///
/// Handles are opaque strings. Generated handles use UUIDv7 so they sort by
/// creation time, but handles supplied by callers (fixed container handles)
/// are accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct Handle(String);

impl Handle {
    /// Generate a new unique handle.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_handles_are_unique() {
        let a = Handle::generate();
        let b = Handle::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_serializes_as_plain_string() {
        let handle = Handle::from("vol-1");
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"vol-1\"");
        assert_eq!(handle.to_string(), "vol-1");
    }
}
