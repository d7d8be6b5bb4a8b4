use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Unique identifier of one orchestration attempt.
///
/// Every log line an attempt emits carries this id, so interleaved attempts
/// sharing one broker can be told apart. Retries get a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptId(Arc<str>);

impl AttemptId {
    /// Generate a new unique attempt ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Borrow the attempt ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AttemptId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for AttemptId {
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
        let id1 = AttemptId::generate();
        let id2 = AttemptId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_format() {
        // ---
        let id = AttemptId::generate();
        assert_eq!(id.to_string().len(), 36); // Standard UUID format
        assert_eq!(id.as_str(), id.to_string());
    }
}
