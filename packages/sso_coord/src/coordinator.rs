//! The per-tab authorization state machine.
//!
//! Each tab builds one [`AuthCoordinator`] over its [`Channel`] endpoint and the
//! shared [`CoordinationStore`]. Remote-operation failures are fed in through
//! [`AuthCoordinator::handle`]; the coordinator decides whether this tab shows
//! the prompt, defers to a sibling, polls for completion, or stays quiet
//! because of a cooldown.
//!
//! ```text
//! Idle → Detected → (ModalOwned | ModalDeferred) → Polling
//!      → (Authorized | TimedOut | Cancelled) → Cooldown → Idle
//! ```
//!
//! Local flow state lives behind a mutex that is never held across a
//! callback, a publish, or a store access.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Subscription};
use crate::classifier::ErrorClassifier;
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::error::{ChannelError, RemoteError};
use crate::message::{
    AuthorizationComplete, BroadcastMessage, ModalClosed, ModalOpened, Payload, PollingStarted,
};
use crate::metrics::{CoordinatorMetrics, MetricsSnapshot};
use crate::poller::{PollOutcome, PollTicket, PollingEngine, RetryFn};
use crate::session::SessionSync;
use crate::store::{
    CoordinationStore, Cooldown, ModalOwnership, PendingAuthorizationRequest, PollingState,
    SharedState,
};
use crate::tab::TabId;

const EVENT_CAPACITY: usize = 64;

/// External SSO-authorization entry point for an organization.
pub fn authorization_url(base: &str, organization: &str) -> String {
    format!("{}/orgs/{}/sso", base.trim_end_matches('/'), organization)
}

/// What the presentation layer needs to render the authorization prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPrompt {
    pub organization: String,
    pub repository: Option<String>,
    pub authorization_url: String,
    pub message: String,
}

pub type PromptCallback = Arc<dyn Fn(AuthorizationPrompt) + Send + Sync>;

/// Caller-side context of a failed remote operation.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub organization: Option<String>,
    pub repository: Option<String>,
    pub retry: Option<RetryFn>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("organization", &self.organization)
            .field("repository", &self.repository)
            .field("retry", &self.retry.is_some())
            .finish()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_organization(organization: impl Into<String>) -> Self {
        Self {
            organization: Some(organization.into()),
            ..Self::default()
        }
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn retry(mut self, retry: RetryFn) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationState {
    Idle,
    Detected,
    ModalOwned,
    ModalDeferred,
    Polling,
    Authorized,
    TimedOut,
    Cancelled,
    Cooldown,
}

impl AuthorizationState {
    /// States in which another error for the same organization is a duplicate.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Detected | Self::ModalOwned | Self::ModalDeferred | Self::Polling
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    PromptShown { organization: String },
    Deferred { organization: String, owner: TabId },
    CooldownSuppressed { organization: String },
    PollingStarted { organization: String },
    PollingYielded { organization: String, owner: TabId },
    Authorized { organization: String },
    TimedOut { organization: String },
    PollingFailed { organization: String, error: RemoteError },
    Cancelled { organization: String },
    RemoteAuthorized { organization: String, from: TabId },
    RemoteCancelled { organization: String, from: TabId },
}

#[derive(Debug, Clone)]
struct Flow {
    state: AuthorizationState,
    poll_generation: Option<u64>,
}

impl Flow {
    fn detected() -> Self {
        Self {
            state: AuthorizationState::Detected,
            poll_generation: None,
        }
    }
}

struct Inner {
    tab_id: TabId,
    channel: Channel,
    shared: SharedState,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    classifier: ErrorClassifier,
    poller: Arc<PollingEngine>,
    metrics: Arc<CoordinatorMetrics>,
    session: Option<Arc<SessionSync>>,
    prompt: RwLock<Option<PromptCallback>>,
    flows: Mutex<HashMap<String, Flow>>,
    // Ownership announced by siblings, consulted when the store has none.
    announced: Mutex<HashMap<String, ModalOwnership>>,
    events: broadcast::Sender<CoordinatorEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.poller.stop_all();
    }
}

pub struct AuthCoordinatorBuilder {
    channel: Channel,
    store: Arc<dyn CoordinationStore>,
    clock: Option<Arc<dyn Clock>>,
    config: CoordinatorConfig,
    classifier: ErrorClassifier,
    session: Option<Arc<SessionSync>>,
    prompt: Option<PromptCallback>,
}

impl AuthCoordinatorBuilder {
    /// Defaults to the channel's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Re-broadcast the stored session after a successful authorization.
    pub fn session_sync(mut self, session: Arc<SessionSync>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn on_authorization_needed<F>(mut self, callback: F) -> Self
    where
        F: Fn(AuthorizationPrompt) + Send + Sync + 'static,
    {
        self.prompt = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<AuthCoordinator, ChannelError> {
        let metrics = Arc::new(CoordinatorMetrics::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let clock = self.clock.unwrap_or_else(|| self.channel.clock().clone());

        let inner = Arc::new(Inner {
            tab_id: self.channel.tab_id(),
            poller: Arc::new(PollingEngine::new(self.classifier, metrics.clone())),
            channel: self.channel,
            shared: SharedState::new(self.store),
            clock,
            config: self.config,
            classifier: self.classifier,
            metrics,
            session: self.session,
            prompt: RwLock::new(self.prompt),
            flows: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashMap::new()),
            events,
            subscriptions: Mutex::new(Vec::new()),
        });

        let subscriptions = vec![
            listen::<ModalOpened>(&inner, Inner::on_modal_opened)?,
            listen::<ModalClosed>(&inner, Inner::on_modal_closed)?,
            listen::<PollingStarted>(&inner, Inner::on_polling_started)?,
            listen::<AuthorizationComplete>(&inner, Inner::on_authorization_complete)?,
        ];
        *inner.subscriptions.lock() = subscriptions;

        debug!(tab = %inner.tab_id, connected = inner.channel.is_connected(), "coordinator ready");
        Ok(AuthCoordinator { inner })
    }
}

fn listen<P: Payload + 'static>(
    inner: &Arc<Inner>,
    on: fn(&Arc<Inner>, P, &BroadcastMessage),
) -> Result<Subscription, ChannelError> {
    let weak = Arc::downgrade(inner);
    inner.channel.subscribe(P::TOPIC.as_str(), move |msg| {
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        let payload: P = msg.payload()?;
        on(&inner, payload, msg);
        Ok(())
    })
}

/// One tab's coordinator. Clones share state.
#[derive(Clone)]
pub struct AuthCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("tab_id", &self.inner.tab_id)
            .field("flows", &self.inner.flows.lock().len())
            .finish()
    }
}

impl AuthCoordinator {
    pub fn builder(channel: Channel, store: Arc<dyn CoordinationStore>) -> AuthCoordinatorBuilder {
        AuthCoordinatorBuilder {
            channel,
            store,
            clock: None,
            config: CoordinatorConfig::default(),
            classifier: ErrorClassifier::new(),
            session: None,
            prompt: None,
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.inner.tab_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn set_prompt_callback<F>(&self, callback: F)
    where
        F: Fn(AuthorizationPrompt) + Send + Sync + 'static,
    {
        *self.inner.prompt.write() = Some(Arc::new(callback));
    }

    /// Feed a failed remote operation into the coordinator.
    ///
    /// Returns `false` when `error` is not an SSO-enforcement rejection; the
    /// caller keeps ownership of it. When `ctx` carries a retry callback and
    /// this tab claims the prompt, polling starts on the current tokio runtime.
    pub fn handle(&self, error: &RemoteError, ctx: RequestContext) -> bool {
        self.inner.handle(error, ctx)
    }

    /// Whether `error` would enter the flow: an SSO error outside its cooldown.
    pub fn should_handle(&self, error: &RemoteError) -> bool {
        let Some(sso) = self.inner.classifier.classify(error) else {
            return false;
        };
        !self
            .inner
            .shared
            .cooldown_active(&sso.organization, self.inner.clock.now_ms())
    }

    /// Called by the presentation layer when the user dismisses the prompt.
    pub fn notify_modal_closed(&self, organization: &str, later_clicked: bool) {
        self.inner.modal_closed(organization, later_clicked);
    }

    pub fn state(&self, organization: &str) -> AuthorizationState {
        if let Some(flow) = self.inner.flows.lock().get(organization) {
            return flow.state;
        }
        if self
            .inner
            .shared
            .cooldown_active(organization, self.inner.clock.now_ms())
        {
            AuthorizationState::Cooldown
        } else {
            AuthorizationState::Idle
        }
    }

    pub fn pending_request(&self, organization: &str) -> Option<PendingAuthorizationRequest> {
        self.inner.shared.get(organization)
    }

    pub fn is_polling(&self, organization: &str) -> bool {
        self.inner.poller.is_active(organization)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop all polling and detach from the channel.
    pub fn shutdown(&self) {
        self.inner.poller.stop_all();
        let subscriptions: Vec<Subscription> = self.inner.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        debug!(tab = %self.inner.tab_id, "coordinator shut down");
    }
}

impl Inner {
    fn handle(self: &Arc<Self>, error: &RemoteError, ctx: RequestContext) -> bool {
        let Some(sso) = self.classifier.classify(error) else {
            return false;
        };
        let organization = ctx.organization.clone().unwrap_or(sso.organization);
        let now = self.clock.now_ms();

        if self.shared.cooldown_active(&organization, now) {
            CoordinatorMetrics::incr(&self.metrics.suppressed_by_cooldown);
            debug!(organization, "sso error suppressed by cooldown");
            self.notify(CoordinatorEvent::CooldownSuppressed { organization });
            return true;
        }

        // A deferred flow whose owner vanished or went stale is taken over.
        let reclaim = match self.flow_state(&organization) {
            Some(AuthorizationState::ModalDeferred) => self
                .current_owner(&organization, now)
                .is_none_or(|owner| owner.owner_tab_id == self.tab_id),
            _ => false,
        };

        {
            let mut flows = self.flows.lock();
            if let Some(flow) = flows.get(&organization) {
                let replaceable = reclaim && flow.state == AuthorizationState::ModalDeferred;
                if flow.state.is_in_flight() && !replaceable {
                    CoordinatorMetrics::incr(&self.metrics.duplicates);
                    debug!(organization, state = ?flow.state, "duplicate sso error absorbed");
                    return true;
                }
            }
            flows.insert(organization.clone(), Flow::detected());
        }
        debug!(organization, tab = %self.tab_id, reclaim, "sso enforcement detected");

        if self
            .shared
            .get::<PendingAuthorizationRequest>(&organization)
            .is_none()
        {
            self.shared.put(
                &organization,
                &PendingAuthorizationRequest {
                    organization: organization.clone(),
                    repository: ctx.repository.clone(),
                    error_message: sso.message.clone(),
                    has_retry_callback: ctx.retry.is_some(),
                    created_at: now,
                },
            );
        }

        match self.current_owner(&organization, now) {
            Some(owner) if owner.owner_tab_id != self.tab_id => {
                self.set_state(&organization, AuthorizationState::ModalDeferred);
                CoordinatorMetrics::incr(&self.metrics.deferrals);
                debug!(organization, owner = %owner.owner_tab_id, "prompt owned by sibling tab; deferring");
                self.notify(CoordinatorEvent::Deferred {
                    organization,
                    owner: owner.owner_tab_id,
                });
            }
            _ => {
                self.claim(&organization, ctx.repository, sso.message, now);
                if let Some(retry) = ctx.retry {
                    self.start_polling(&organization, retry);
                }
            }
        }
        true
    }

    // Live owner from the store, else from a sibling's announcement. Stale
    // claims count as abandoned.
    fn current_owner(&self, organization: &str, now: i64) -> Option<ModalOwnership> {
        let owner = self
            .shared
            .get::<ModalOwnership>(organization)
            .or_else(|| self.announced.lock().get(organization).cloned())?;

        let age = now.saturating_sub(owner.claimed_at);
        if owner.owner_tab_id != self.tab_id && age >= self.config.modal_stale_after_ms as i64 {
            info!(organization, owner = %owner.owner_tab_id, age_ms = age, "reclaiming abandoned prompt");
            return None;
        }
        Some(owner)
    }

    fn claim(&self, organization: &str, repository: Option<String>, message: String, now: i64) {
        self.shared.put(
            organization,
            &ModalOwnership {
                owner_tab_id: self.tab_id,
                claimed_at: now,
            },
        );
        self.set_state(organization, AuthorizationState::ModalOwned);
        CoordinatorMetrics::incr(&self.metrics.prompts_shown);
        info!(organization, tab = %self.tab_id, "prompting for sso authorization");

        let prompt = AuthorizationPrompt {
            organization: organization.to_string(),
            repository: repository.clone(),
            authorization_url: authorization_url(&self.config.authorization_base_url, organization),
            message,
        };
        let callback = self.prompt.read().clone();
        match callback {
            Some(callback) => callback(prompt),
            None => warn!(organization, "no prompt callback registered"),
        }

        self.announce(&ModalOpened {
            organization: organization.to_string(),
            repository,
        });
        self.notify(CoordinatorEvent::PromptShown {
            organization: organization.to_string(),
        });
    }

    fn start_polling(self: &Arc<Self>, organization: &str, retry: RetryFn) {
        self.shared.put(
            organization,
            &PollingState {
                active: true,
                started_at: self.clock.now_ms(),
                owner_tab_id: self.tab_id,
            },
        );

        let ticket = self
            .poller
            .start(organization, retry, self.config.poll_options());
        if let Some(flow) = self.flows.lock().get_mut(organization) {
            flow.state = AuthorizationState::Polling;
            flow.poll_generation = Some(ticket.generation());
        }

        self.announce(&PollingStarted {
            organization: organization.to_string(),
        });
        self.notify(CoordinatorEvent::PollingStarted {
            organization: organization.to_string(),
        });

        tokio::spawn(await_outcome(Arc::downgrade(self), ticket));
    }

    fn on_poll_outcome(&self, organization: &str, generation: u64, outcome: PollOutcome) {
        let current = {
            let flows = self.flows.lock();
            flows
                .get(organization)
                .is_some_and(|flow| flow.poll_generation == Some(generation))
        };
        if !current {
            debug!(organization, generation, "stale poll outcome ignored");
            return;
        }

        match outcome {
            PollOutcome::Authorized { ticks } => {
                self.shared.clear_organization(organization);
                self.announced.lock().remove(organization);
                self.update_flow(organization, AuthorizationState::Authorized);
                CoordinatorMetrics::incr(&self.metrics.authorizations);
                info!(organization, ticks, "sso authorization complete");

                self.announce(&AuthorizationComplete {
                    organization: organization.to_string(),
                });
                if let Some(session) = &self.session {
                    session.rebroadcast();
                }
                self.notify(CoordinatorEvent::Authorized {
                    organization: organization.to_string(),
                });
            }
            PollOutcome::TimedOut { ticks, elapsed } => {
                self.shared.clear::<PollingState>(organization);
                self.update_flow(organization, AuthorizationState::TimedOut);
                info!(organization, ticks, elapsed_ms = elapsed.as_millis() as u64, "sso authorization timed out");
                self.notify(CoordinatorEvent::TimedOut {
                    organization: organization.to_string(),
                });
            }
            PollOutcome::Failed { error, .. } => {
                self.shared.clear::<PollingState>(organization);
                self.update_flow(organization, AuthorizationState::ModalOwned);
                warn!(organization, error = %error, "retry failed outside sso enforcement");
                self.notify(CoordinatorEvent::PollingFailed {
                    organization: organization.to_string(),
                    error,
                });
            }
            PollOutcome::Stopped => {
                debug!(organization, "polling stopped");
            }
        }
    }

    fn modal_closed(&self, organization: &str, later_clicked: bool) {
        let now = self.clock.now_ms();

        if later_clicked {
            self.poller.stop(organization);
            self.shared.clear::<PollingState>(organization);
            self.shared.clear::<PendingAuthorizationRequest>(organization);
            self.shared.clear::<ModalOwnership>(organization);
            self.shared.put(
                organization,
                &Cooldown {
                    expires_at: now + self.config.cooldown_ms as i64,
                },
            );
            self.flows.lock().remove(organization);
            CoordinatorMetrics::incr(&self.metrics.cooldowns_set);
            info!(organization, cooldown_ms = self.config.cooldown_ms, "authorization deferred; cooldown set");
            self.notify(CoordinatorEvent::Cancelled {
                organization: organization.to_string(),
            });
        } else {
            let owned = self
                .shared
                .get::<ModalOwnership>(organization)
                .is_some_and(|owner| owner.owner_tab_id == self.tab_id);
            if owned {
                self.shared.clear::<ModalOwnership>(organization);
            }
            let mut flows = self.flows.lock();
            if flows
                .get(organization)
                .is_some_and(|flow| flow.state != AuthorizationState::Polling)
            {
                flows.remove(organization);
            }
            drop(flows);
            debug!(organization, "prompt closed");
        }

        self.announce(&ModalClosed {
            organization: organization.to_string(),
            later_clicked,
        });
    }

    // --- Sibling messages ---

    fn on_modal_opened(self: &Arc<Self>, payload: ModalOpened, msg: &BroadcastMessage) {
        debug!(organization = %payload.organization, from = %msg.tab_id, "sibling opened prompt");
        self.announced.lock().insert(
            payload.organization,
            ModalOwnership {
                owner_tab_id: msg.tab_id,
                claimed_at: msg.timestamp,
            },
        );
    }

    fn on_modal_closed(self: &Arc<Self>, payload: ModalClosed, msg: &BroadcastMessage) {
        let organization = payload.organization;
        self.announced.lock().remove(&organization);

        let removed = {
            let mut flows = self.flows.lock();
            match flows.get(&organization) {
                Some(flow) if flow.state != AuthorizationState::Polling => {
                    flows.remove(&organization).is_some()
                }
                _ => false,
            }
        };
        debug!(organization, from = %msg.tab_id, later = payload.later_clicked, removed, "sibling closed prompt");

        if payload.later_clicked && removed {
            self.notify(CoordinatorEvent::RemoteCancelled {
                organization,
                from: msg.tab_id,
            });
        }
    }

    fn on_polling_started(self: &Arc<Self>, payload: PollingStarted, msg: &BroadcastMessage) {
        let organization = payload.organization;
        if !self.poller.is_active(&organization) {
            return;
        }
        let owner = self
            .shared
            .get::<PollingState>(&organization)
            .map(|state| state.owner_tab_id)
            .unwrap_or(msg.tab_id);
        if owner == self.tab_id {
            return;
        }

        self.poller.stop(&organization);
        if let Some(flow) = self.flows.lock().get_mut(&organization) {
            flow.state = AuthorizationState::ModalDeferred;
            flow.poll_generation = None;
        }
        info!(organization, owner = %owner, "sibling tab took over polling");
        self.notify(CoordinatorEvent::PollingYielded { organization, owner });
    }

    fn on_authorization_complete(
        self: &Arc<Self>,
        payload: AuthorizationComplete,
        msg: &BroadcastMessage,
    ) {
        let organization = payload.organization;
        self.announced.lock().remove(&organization);
        self.poller.stop(&organization);
        let had_flow = self.flows.lock().remove(&organization).is_some();
        self.shared.clear_organization(&organization);

        if had_flow {
            info!(organization, from = %msg.tab_id, "sso authorization completed in sibling tab");
            self.notify(CoordinatorEvent::RemoteAuthorized {
                organization,
                from: msg.tab_id,
            });
        } else {
            debug!(organization, from = %msg.tab_id, "authorization complete; nothing pending");
        }
    }

    // --- Helpers ---

    fn flow_state(&self, organization: &str) -> Option<AuthorizationState> {
        self.flows.lock().get(organization).map(|flow| flow.state)
    }

    fn set_state(&self, organization: &str, state: AuthorizationState) {
        if let Some(flow) = self.flows.lock().get_mut(organization) {
            flow.state = state;
        }
    }

    fn update_flow(&self, organization: &str, state: AuthorizationState) {
        if let Some(flow) = self.flows.lock().get_mut(organization) {
            flow.state = state;
            flow.poll_generation = None;
        }
    }

    fn announce<P: Payload>(&self, payload: &P) {
        match self.channel.emit(payload) {
            Ok(true) => CoordinatorMetrics::incr(&self.metrics.broadcasts_sent),
            Ok(false) => CoordinatorMetrics::incr(&self.metrics.broadcasts_dropped),
            Err(e) => {
                CoordinatorMetrics::incr(&self.metrics.broadcasts_dropped);
                warn!(topic = %P::TOPIC, error = %e, "coordination broadcast failed");
            }
        }
    }

    fn notify(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }
}

async fn await_outcome(inner: std::sync::Weak<Inner>, ticket: PollTicket) {
    let organization = ticket.organization().to_string();
    let generation = ticket.generation();
    let outcome = ticket.outcome().await;
    if let Some(inner) = inner.upgrade() {
        inner.on_poll_outcome(&organization, generation, outcome);
    }
}
