//! Session propagation across tabs.
//!
//! The encrypted session blob is opaque here: receivers store exactly what
//! was sent, or clear their copy on logout.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Subscription};
use crate::error::ChannelError;
use crate::message::{Payload, SessionAuthenticated, SessionLogout};
use crate::tab::TabId;

/// A tab's local persistent session storage.
pub trait SessionVault: Send + Sync + fmt::Debug {
    fn load(&self) -> Option<String>;
    fn store(&self, encrypted: &str);
    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct MemoryVault {
    session: RwLock<Option<String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionVault for MemoryVault {
    fn load(&self) -> Option<String> {
        self.session.read().clone()
    }

    fn store(&self, encrypted: &str) {
        *self.session.write() = Some(encrypted.to_string());
    }

    fn clear(&self) {
        *self.session.write() = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A sibling's session was written to the local vault.
    Adopted { from: TabId },
    /// A sibling logged out; the local vault was cleared.
    Cleared { from: TabId },
}

pub struct SessionSync {
    channel: Channel,
    vault: Arc<dyn SessionVault>,
    events: broadcast::Sender<SessionEvent>,
    subscriptions: Vec<Subscription>,
}

impl fmt::Debug for SessionSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSync")
            .field("tab_id", &self.channel.tab_id())
            .field("vault", &self.vault)
            .finish()
    }
}

impl SessionSync {
    pub fn attach(channel: Channel, vault: Arc<dyn SessionVault>) -> Result<Self, ChannelError> {
        let (events, _) = broadcast::channel(64);

        let on_auth = {
            let vault = vault.clone();
            let events = events.clone();
            channel.subscribe(SessionAuthenticated::TOPIC.as_str(), move |msg| {
                let payload: SessionAuthenticated = msg.payload()?;
                vault.store(&payload.encrypted_session);
                debug!(from = %msg.tab_id, "adopted session from sibling tab");
                let _ = events.send(SessionEvent::Adopted { from: msg.tab_id });
                Ok(())
            })?
        };

        let on_logout = {
            let vault = vault.clone();
            let events = events.clone();
            channel.subscribe(SessionLogout::TOPIC.as_str(), move |msg| {
                vault.clear();
                debug!(from = %msg.tab_id, "session cleared by sibling logout");
                let _ = events.send(SessionEvent::Cleared { from: msg.tab_id });
                Ok(())
            })?
        };

        Ok(Self {
            channel,
            vault,
            events,
            subscriptions: vec![on_auth, on_logout],
        })
    }

    pub fn vault(&self) -> &Arc<dyn SessionVault> {
        &self.vault
    }

    /// Store a freshly obtained session locally and announce it.
    pub fn authenticated(&self, encrypted: &str) -> bool {
        self.vault.store(encrypted);
        info!(tab = %self.channel.tab_id(), "session authenticated");
        self.announce(&SessionAuthenticated {
            encrypted_session: encrypted.to_string(),
        })
    }

    pub fn logout(&self) -> bool {
        self.vault.clear();
        info!(tab = %self.channel.tab_id(), "session logged out");
        self.announce(&SessionLogout {})
    }

    /// Re-announce the stored session, if there is one.
    pub fn rebroadcast(&self) -> bool {
        match self.vault.load() {
            Some(encrypted) => self.announce(&SessionAuthenticated {
                encrypted_session: encrypted,
            }),
            None => {
                debug!(tab = %self.channel.tab_id(), "no stored session to rebroadcast");
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn detach(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
    }

    fn announce<P: Payload>(&self, payload: &P) -> bool {
        match self.channel.emit(payload) {
            Ok(sent) => sent,
            Err(e) => {
                warn!(topic = %P::TOPIC, error = %e, "session broadcast failed");
                false
            }
        }
    }
}
