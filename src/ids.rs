use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned identity of one live connection.
///
/// Unique per live connection; invalid the instant the connection closes.
/// A reconnect always produces a fresh identity; ids are never reused.
///
/// The `WS-` prefix is a debugging aid and not part of the protocol
/// contract; peers must treat the id as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh connection identity.
    pub fn generate() -> Self {
        // ---
        Self(format!("WS-{}", Uuid::new_v4()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation identifier linking a CALL to its RETURN.
///
/// Chosen by the call initiator, echoed verbatim by the responder. The
/// `WSM-` prefix distinguishes call ids from connection ids in logs; it is
/// not part of the protocol contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    /// Generate a new unique call id.
    pub fn generate() -> Self {
        // ---
        Self(format!("WSM-{}", Uuid::new_v4()))
    }

    /// Borrow the call id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
        assert_ne!(CallId::generate(), CallId::generate());
    }

    #[test]
    fn test_prefixes() {
        // ---
        assert!(ConnectionId::generate().as_str().starts_with("WS-"));
        assert!(CallId::generate().as_str().starts_with("WSM-"));
    }
}
