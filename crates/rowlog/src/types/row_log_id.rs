use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one row log. Leader election and published addresses are scoped by it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RowLogId(pub String);

impl RowLogId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RowLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RowLogId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
