//! Broadcast envelope, topic names, and typed payloads.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tab::TabId;

// --- Topic ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ModalOpened,
    ModalClosed,
    PollingStarted,
    AuthorizationComplete,
    SessionAuthenticated,
    SessionLogout,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Self::ModalOpened,
        Self::ModalClosed,
        Self::PollingStarted,
        Self::AuthorizationComplete,
        Self::SessionAuthenticated,
        Self::SessionLogout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModalOpened => "sso-modal-opened",
            Self::ModalClosed => "sso-modal-closed",
            Self::PollingStarted => "sso-polling-started",
            Self::AuthorizationComplete => "sso-authorization-complete",
            Self::SessionAuthenticated => "session-authenticated",
            Self::SessionLogout => "session-logout",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| format!("unknown topic: {s}"))
    }
}

// --- BroadcastMessage ---

/// What travels over the channel. Built by the sender, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
    #[serde(rename = "tabId")]
    pub tab_id: TabId,
}

impl BroadcastMessage {
    pub fn new(kind: impl Into<String>, data: serde_json::Value, timestamp: i64, tab_id: TabId) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp,
            tab_id,
        }
    }

    /// Decode `data` as the payload bound to this message's topic.
    pub fn payload<P: Payload>(&self) -> Result<P, serde_json::Error> {
        P::deserialize(&self.data)
    }
}

// --- Payloads ---

/// A payload type and the topic it is published on.
pub trait Payload: Serialize + DeserializeOwned {
    const TOPIC: Topic;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalOpened {
    pub organization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl Payload for ModalOpened {
    const TOPIC: Topic = Topic::ModalOpened;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalClosed {
    pub organization: String,
    #[serde(default)]
    pub later_clicked: bool,
}

impl Payload for ModalClosed {
    const TOPIC: Topic = Topic::ModalClosed;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingStarted {
    pub organization: String,
}

impl Payload for PollingStarted {
    const TOPIC: Topic = Topic::PollingStarted;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationComplete {
    pub organization: String,
}

impl Payload for AuthorizationComplete {
    const TOPIC: Topic = Topic::AuthorizationComplete;
}

/// Carries the storage layer's encrypted session blob, untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthenticated {
    pub encrypted_session: String,
}

impl Payload for SessionAuthenticated {
    const TOPIC: Topic = Topic::SessionAuthenticated;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLogout {}

impl Payload for SessionLogout {
    const TOPIC: Topic = Topic::SessionLogout;
}
