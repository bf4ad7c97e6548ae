//! Opaque model handles used as ledger keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Process-unique identifier of a loaded model.
///
/// Handles are assigned by whoever loads the model (an engine or the
/// [`ModelLifecycleManager`](crate::ModelLifecycleManager)) and are only ever
/// looked up, never dereferenced. They deliberately carry no ordering: LRU
/// order comes from access recency, not from handle values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelHandle(u64);

impl ModelHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw integer value, e.g. for passing across an FFI boundary.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ModelHandle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<ModelHandle> for u64 {
    fn from(handle: ModelHandle) -> Self {
        handle.0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ModelHandle::new(42).to_string(), "#42");
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        let json = serde_json::to_string(&ModelHandle::new(5)).unwrap();
        assert_eq!(json, "5");
        let back: ModelHandle = serde_json::from_str("5").unwrap();
        assert_eq!(back, ModelHandle::from(5));
        assert_eq!(u64::from(back), 5);
    }
}
