use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic, non-negative position inside one aggregate's stream.
///
/// Values are `Copy`, so every buffered event keeps the version it reached
/// even after the aggregate moves on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamVersion(u64);

impl StreamVersion {
    pub fn start() -> Self {
        Self(0)
    }

    pub fn next(&mut self) {
        self.0 += 1;
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<StreamVersion> for u64 {
    fn from(version: StreamVersion) -> Self {
        version.0
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
