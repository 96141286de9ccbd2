//! Coordinator metrics
//!
//! Counters for one tab's coordinator, shared with its polling engine.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    // Detection
    /// Authorization prompts this tab displayed
    pub prompts_shown: AtomicU64,
    /// SSO errors deferred to another tab's prompt
    pub deferrals: AtomicU64,
    /// SSO errors absorbed because of an active cooldown
    pub suppressed_by_cooldown: AtomicU64,
    /// SSO errors absorbed because a flow was already running locally
    pub duplicates: AtomicU64,

    // Polling
    pub polls_started: AtomicU64,
    /// Poll runs that ended (any outcome, including explicit stop)
    pub polls_stopped: AtomicU64,
    pub poll_ticks: AtomicU64,

    // Outcomes
    pub authorizations: AtomicU64,
    pub timeouts: AtomicU64,
    pub poll_failures: AtomicU64,
    pub cooldowns_set: AtomicU64,

    // Channel
    pub broadcasts_sent: AtomicU64,
    /// Publishes that found no cross-tab transport
    pub broadcasts_dropped: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            detection: DetectionMetrics {
                prompts_shown: load(&self.prompts_shown),
                deferrals: load(&self.deferrals),
                suppressed_by_cooldown: load(&self.suppressed_by_cooldown),
                duplicates: load(&self.duplicates),
            },
            polling: PollingMetrics {
                started: load(&self.polls_started),
                stopped: load(&self.polls_stopped),
                ticks: load(&self.poll_ticks),
            },
            outcomes: OutcomeMetrics {
                authorizations: load(&self.authorizations),
                timeouts: load(&self.timeouts),
                poll_failures: load(&self.poll_failures),
                cooldowns_set: load(&self.cooldowns_set),
            },
            channel: ChannelMetrics {
                sent: load(&self.broadcasts_sent),
                dropped: load(&self.broadcasts_dropped),
            },
        }
    }
}

/// Point-in-time view of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub detection: DetectionMetrics,
    pub polling: PollingMetrics,
    pub outcomes: OutcomeMetrics,
    pub channel: ChannelMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub prompts_shown: u64,
    pub deferrals: u64,
    pub suppressed_by_cooldown: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingMetrics {
    pub started: u64,
    pub stopped: u64,
    pub ticks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub authorizations: u64,
    pub timeouts: u64,
    pub poll_failures: u64,
    pub cooldowns_set: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub sent: u64,
    pub dropped: u64,
}
