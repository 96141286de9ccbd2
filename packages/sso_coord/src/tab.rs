//! Per-tab identity.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

static CURRENT: OnceLock<TabId> = OnceLock::new();

/// Opaque identity of one execution context (browser tab).
///
/// Never persisted: a reloaded tab gets a fresh identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(Uuid);

impl TabId {
    /// A fresh identity, independent of the process-wide one.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The process-wide identity, generated on first use.
    pub fn current() -> Self {
        *CURRENT.get_or_init(Self::new)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TabId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
