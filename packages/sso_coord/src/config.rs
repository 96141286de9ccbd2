use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poller::PollOptions;

// =============================================================================
// Coordinator config (figment-deserialized from defaults / toml file / env vars)
// =============================================================================
//
//   coordinator.toml:   cooldown_ms = 120000
//
//   env var:            SSO_COORD_COOLDOWN_MS=120000

/// Timing and transport tunables shared by every tab's coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How long a "remind me later" suppresses re-prompting.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Modal ownership older than this is treated as abandoned.
    #[serde(default = "default_modal_stale_after_ms")]
    pub modal_stale_after_ms: u64,
    #[serde(default = "default_authorization_base_url")]
    pub authorization_base_url: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            modal_stale_after_ms: default_modal_stale_after_ms(),
            authorization_base_url: default_authorization_base_url(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_poll_timeout_ms() -> u64 {
    300_000
}

fn default_modal_stale_after_ms() -> u64 {
    300_000
}

fn default_authorization_base_url() -> String {
    "https://github.com".to_string()
}

fn default_channel_capacity() -> usize {
    crate::channel::DEFAULT_CAPACITY
}

impl CoordinatorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn modal_stale_after(&self) -> Duration {
        Duration::from_millis(self.modal_stale_after_ms)
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: self.poll_interval(),
            timeout: self.poll_timeout(),
        }
    }
}

/// Build a figment that layers: defaults → toml file → SSO_COORD_* env vars.
///
/// A missing file is not an error; figment skips it.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(CoordinatorConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("SSO_COORD_").split("__"))
}
