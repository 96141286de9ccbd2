//! Bounded retry loop run by the tab that owns the authorization prompt.
//!
//! One run per organization per engine. A run re-invokes the caller's retry
//! callback every `interval` until it succeeds, fails for a reason other than
//! SSO enforcement, is stopped, or the `timeout` budget is spent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::ErrorClassifier;
use crate::error::RemoteError;
use crate::metrics::CoordinatorMetrics;

pub type RetryFuture = BoxFuture<'static, Result<(), RemoteError>>;

/// Re-issues the remote operation that failed with an SSO error.
pub type RetryFn = Arc<dyn Fn() -> RetryFuture + Send + Sync>;

pub fn retry_fn<F, Fut>(f: F) -> RetryFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(3_000),
            timeout: Duration::from_millis(300_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Authorized { ticks: u32 },
    TimedOut { ticks: u32, elapsed: Duration },
    Failed { error: RemoteError, ticks: u32 },
    Stopped,
}

struct ActivePoll {
    generation: u64,
    cancel: CancellationToken,
}

pub struct PollingEngine {
    classifier: ErrorClassifier,
    metrics: Arc<CoordinatorMetrics>,
    active: Mutex<HashMap<String, ActivePoll>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for PollingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active: Vec<String> = self.active.lock().keys().cloned().collect();
        f.debug_struct("PollingEngine")
            .field("active", &active)
            .finish()
    }
}

impl PollingEngine {
    pub fn new(classifier: ErrorClassifier, metrics: Arc<CoordinatorMetrics>) -> Self {
        Self {
            classifier,
            metrics,
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start polling for `organization`, replacing any run already active for it.
    pub fn start(self: &Arc<Self>, organization: &str, retry: RetryFn, opts: PollOptions) -> PollTicket {
        self.stop(organization);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        self.active.lock().insert(
            organization.to_string(),
            ActivePoll {
                generation,
                cancel: cancel.clone(),
            },
        );
        CoordinatorMetrics::incr(&self.metrics.polls_started);
        info!(
            organization,
            interval_ms = opts.interval.as_millis() as u64,
            timeout_ms = opts.timeout.as_millis() as u64,
            "polling for authorization"
        );

        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(self);
        let org = organization.to_string();
        tokio::spawn(async move {
            let outcome = engine.run(&org, retry, opts, cancel).await;
            engine.finish(&org, generation, &outcome);
            let _ = tx.send(outcome);
        });

        PollTicket {
            organization: organization.to_string(),
            generation,
            rx,
        }
    }

    /// Idempotent. Returns whether a run was active.
    pub fn stop(&self, organization: &str) -> bool {
        let Some(poll) = self.active.lock().remove(organization) else {
            return false;
        };
        poll.cancel.cancel();
        CoordinatorMetrics::incr(&self.metrics.polls_stopped);
        debug!(organization, generation = poll.generation, "polling stopped");
        true
    }

    pub fn stop_all(&self) {
        let drained: Vec<(String, ActivePoll)> = self.active.lock().drain().collect();
        for (organization, poll) in drained {
            poll.cancel.cancel();
            CoordinatorMetrics::incr(&self.metrics.polls_stopped);
            debug!(organization, "polling stopped on shutdown");
        }
    }

    pub fn is_active(&self, organization: &str) -> bool {
        self.active.lock().contains_key(organization)
    }

    pub fn active_generation(&self, organization: &str) -> Option<u64> {
        self.active.lock().get(organization).map(|p| p.generation)
    }

    // A run that ended on its own retires its entry, unless a newer run replaced it.
    fn finish(&self, organization: &str, generation: u64, outcome: &PollOutcome) {
        let retired = {
            let mut active = self.active.lock();
            match active.get(organization) {
                Some(poll) if poll.generation == generation => {
                    active.remove(organization);
                    true
                }
                _ => false,
            }
        };
        if !retired {
            return;
        }
        CoordinatorMetrics::incr(&self.metrics.polls_stopped);
        match outcome {
            PollOutcome::TimedOut { .. } => CoordinatorMetrics::incr(&self.metrics.timeouts),
            PollOutcome::Failed { .. } => CoordinatorMetrics::incr(&self.metrics.poll_failures),
            PollOutcome::Authorized { .. } | PollOutcome::Stopped => {}
        }
    }

    async fn run(
        &self,
        organization: &str,
        retry: RetryFn,
        opts: PollOptions,
        cancel: CancellationToken,
    ) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + opts.timeout;
        let mut ticker = time::interval_at(started + opts.interval, opts.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Stopped,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if now >= deadline {
                info!(organization, ticks, "polling timed out");
                return PollOutcome::TimedOut {
                    ticks,
                    elapsed: now - started,
                };
            }

            ticks += 1;
            CoordinatorMetrics::incr(&self.metrics.poll_ticks);
            debug!(organization, tick = ticks, "retrying remote operation");

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Stopped,
                attempt = time::timeout_at(deadline, retry()) => attempt,
            };

            match attempt {
                Ok(Ok(())) => return PollOutcome::Authorized { ticks },
                Ok(Err(error)) if self.classifier.is_sso_error(&error) => {
                    debug!(organization, tick = ticks, "still awaiting authorization");
                }
                Ok(Err(error)) => {
                    warn!(organization, tick = ticks, error = %error, "retry failed; polling aborted");
                    return PollOutcome::Failed { error, ticks };
                }
                Err(_) => {
                    info!(organization, ticks, "polling timed out during retry");
                    return PollOutcome::TimedOut {
                        ticks,
                        elapsed: Instant::now() - started,
                    };
                }
            }
        }
    }
}

/// Resolves once the run it was issued for ends.
#[derive(Debug)]
pub struct PollTicket {
    organization: String,
    generation: u64,
    rx: oneshot::Receiver<PollOutcome>,
}

impl PollTicket {
    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn outcome(self) -> PollOutcome {
        self.rx.await.unwrap_or(PollOutcome::Stopped)
    }
}
