use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Globally unique identifier of a task instance.
///
/// Generated references are UUIDv7 so they sort by creation time in logs.
/// Callers may also supply their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskReference(pub String);

impl TaskReference {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for TaskReference {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for TaskReference {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskReference {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for TaskReference {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TaskReference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_references_are_unique() {
        let a = TaskReference::new();
        let b = TaskReference::new();
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_as_plain_string() {
        let r = TaskReference::from("copy-orders");
        assert_eq!(serde_json::to_string(&r).unwrap(), r#""copy-orders""#);
    }
}
