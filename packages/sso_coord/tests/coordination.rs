//! Multi-tab scenarios: several coordinators on one hub and one store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

use sso_coord::channel::{BroadcastHub, Channel};
use sso_coord::clock::{Clock, ManualClock};
use sso_coord::coordinator::{
    AuthCoordinator, AuthorizationState, CoordinatorEvent, RequestContext,
};
use sso_coord::error::RemoteError;
use sso_coord::poller::{RetryFn, retry_fn};
use sso_coord::session::{MemoryVault, SessionSync, SessionVault};
use sso_coord::store::{MemoryStore, ModalOwnership, PollingState, SharedState};
use sso_coord::tab::TabId;

const ORG: &str = "acme";

fn sso_error() -> RemoteError {
    RemoteError::new(403, "organization: acme requires saml sso enforcement")
}

struct World {
    hub: BroadcastHub,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

impl World {
    fn new() -> Self {
        Self {
            hub: BroadcastHub::default(),
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
        }
    }

    fn shared(&self) -> SharedState {
        SharedState::new(self.store.clone())
    }

    fn tab(&self) -> Tab {
        self.tab_with_session(None)
    }

    fn tab_with_session(&self, vault: Option<Arc<MemoryVault>>) -> Tab {
        let channel = Channel::connect(&self.hub, TabId::new(), self.clock.clone());
        let prompts = Arc::new(AtomicU32::new(0));
        let counter = prompts.clone();

        let mut builder = AuthCoordinator::builder(channel.clone(), self.store.clone())
            .on_authorization_needed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        if let Some(vault) = vault {
            let session = SessionSync::attach(channel, vault).unwrap();
            builder = builder.session_sync(Arc::new(session));
        }

        let coordinator = builder.build().unwrap();
        let events = coordinator.subscribe_events();
        Tab {
            coordinator,
            prompts,
            events,
        }
    }
}

struct Tab {
    coordinator: AuthCoordinator,
    prompts: Arc<AtomicU32>,
    events: broadcast::Receiver<CoordinatorEvent>,
}

impl Tab {
    fn prompts(&self) -> u32 {
        self.prompts.load(Ordering::SeqCst)
    }

    async fn wait_for<F>(&mut self, mut matches: F) -> CoordinatorEvent
    where
        F: FnMut(&CoordinatorEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let event = self.events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }
}

/// A remote that keeps rejecting with SSO enforcement until `authorized` flips.
fn gated_remote(authorized: &Arc<AtomicBool>) -> RetryFn {
    let authorized = authorized.clone();
    retry_fn(move || {
        let ok = authorized.load(Ordering::SeqCst);
        async move { if ok { Ok(()) } else { Err(sso_error()) } }
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn two_tabs_one_prompt() {
    let world = World::new();
    let a = world.tab();
    let b = world.tab();

    assert!(a.coordinator.handle(&sso_error(), RequestContext::new()));
    assert!(b.coordinator.handle(&sso_error(), RequestContext::new()));

    assert_eq!(a.coordinator.state(ORG), AuthorizationState::ModalOwned);
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::ModalDeferred);
    assert_eq!(a.prompts() + b.prompts(), 1);

    let owner = world.shared().get::<ModalOwnership>(ORG).unwrap();
    assert_eq!(owner.owner_tab_id, a.coordinator.tab_id());
    assert_eq!(b.coordinator.metrics().detection.deferrals, 1);
}

#[tokio::test]
async fn deferred_tab_reclaims_abandoned_prompt() {
    let world = World::new();
    let a = world.tab();
    let b = world.tab();

    a.coordinator.handle(&sso_error(), RequestContext::new());
    b.coordinator.handle(&sso_error(), RequestContext::new());
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::ModalDeferred);

    // A live owner keeps repeats absorbed.
    assert!(b.coordinator.handle(&sso_error(), RequestContext::new()));
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::ModalDeferred);
    assert_eq!(b.coordinator.metrics().detection.duplicates, 1);

    // The owning tab goes away without closing its prompt.
    a.coordinator.shutdown();
    drop(a);
    world.clock.advance(600_000);

    assert!(b.coordinator.handle(&sso_error(), RequestContext::new()));
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::ModalOwned);
    assert_eq!(b.prompts(), 1);
    let owner = world.shared().get::<ModalOwnership>(ORG).unwrap();
    assert_eq!(owner.owner_tab_id, b.coordinator.tab_id());
    assert_eq!(owner.claimed_at, world.clock.now_ms());
}

#[tokio::test]
async fn announced_owner_is_respected_without_store_record() {
    let world = World::new();
    let a = world.tab();
    let b = world.tab();

    a.coordinator.handle(&sso_error(), RequestContext::new());
    settle().await;
    // The store lost the record (e.g. another writer cleared it).
    world.shared().clear::<ModalOwnership>(ORG);

    b.coordinator.handle(&sso_error(), RequestContext::new());
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::ModalDeferred);
    assert_eq!(b.prompts(), 0);
}

#[tokio::test(start_paused = true)]
async fn completion_clears_sibling_state() {
    let world = World::new();
    let mut a = world.tab();
    let mut b = world.tab();
    let authorized = Arc::new(AtomicBool::new(false));

    let ctx = RequestContext::new()
        .repository("guides")
        .retry(gated_remote(&authorized));
    a.coordinator.handle(&sso_error(), ctx.clone());
    b.coordinator.handle(&sso_error(), ctx);
    assert_eq!(a.coordinator.state(ORG), AuthorizationState::Polling);
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::ModalDeferred);
    assert!(!b.coordinator.is_polling(ORG));

    // The human completes the external step.
    authorized.store(true, Ordering::SeqCst);

    a.wait_for(|e| matches!(e, CoordinatorEvent::Authorized { .. })).await;
    let event = b
        .wait_for(|e| matches!(e, CoordinatorEvent::RemoteAuthorized { .. }))
        .await;
    assert_eq!(
        event,
        CoordinatorEvent::RemoteAuthorized {
            organization: ORG.into(),
            from: a.coordinator.tab_id(),
        }
    );

    assert_eq!(b.coordinator.state(ORG), AuthorizationState::Idle);
    assert!(b.coordinator.pending_request(ORG).is_none());
    assert!(world.shared().get::<ModalOwnership>(ORG).is_none());
    assert!(world.store.is_empty());
}

#[tokio::test]
async fn completion_broadcast_is_idempotent() {
    let world = World::new();
    let a = world.tab();
    let mut b = world.tab();

    // Nothing pending anywhere: a completion must change nothing.
    let channel = Channel::connect(&world.hub, TabId::new(), world.clock.clone());
    channel
        .emit(&sso_coord::message::AuthorizationComplete {
            organization: ORG.into(),
        })
        .unwrap();
    settle().await;
    assert_eq!(a.coordinator.state(ORG), AuthorizationState::Idle);
    assert!(b.events.try_recv().is_err());
}

#[tokio::test]
async fn cooldown_absorbs_repeats_in_every_tab() {
    let world = World::new();
    let a = world.tab();
    let mut b = world.tab();

    a.coordinator.handle(&sso_error(), RequestContext::new());
    b.coordinator.handle(&sso_error(), RequestContext::new());
    a.coordinator.notify_modal_closed(ORG, true);

    let event = b
        .wait_for(|e| matches!(e, CoordinatorEvent::RemoteCancelled { .. }))
        .await;
    assert!(matches!(event, CoordinatorEvent::RemoteCancelled { from, .. } if from == a.coordinator.tab_id()));
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::Cooldown);

    assert!(a.coordinator.handle(&sso_error(), RequestContext::new()));
    assert!(a.coordinator.handle(&sso_error(), RequestContext::new()));
    assert!(b.coordinator.handle(&sso_error(), RequestContext::new()));
    assert_eq!(a.prompts() + b.prompts(), 1);
    assert_eq!(a.coordinator.metrics().detection.suppressed_by_cooldown, 2);

    world.clock.advance(59_999);
    assert!(!b.coordinator.should_handle(&sso_error()));
    world.clock.advance(1);
    assert!(b.coordinator.should_handle(&sso_error()));
    b.coordinator.handle(&sso_error(), RequestContext::new());
    assert_eq!(b.coordinator.state(ORG), AuthorizationState::ModalOwned);
    assert_eq!(b.prompts(), 1);
}

#[tokio::test(start_paused = true)]
async fn racing_pollers_converge_on_last_writer() {
    let world = World::new();
    let mut a = world.tab();
    let b = world.tab();
    let authorized = Arc::new(AtomicBool::new(false));

    a.coordinator.handle(
        &sso_error(),
        RequestContext::new().retry(gated_remote(&authorized)),
    );
    // B read "no owner" before A's write landed.
    world.shared().clear::<ModalOwnership>(ORG);
    b.coordinator.handle(
        &sso_error(),
        RequestContext::new().retry(gated_remote(&authorized)),
    );

    let event = a
        .wait_for(|e| matches!(e, CoordinatorEvent::PollingYielded { .. }))
        .await;
    assert_eq!(
        event,
        CoordinatorEvent::PollingYielded {
            organization: ORG.into(),
            owner: b.coordinator.tab_id(),
        }
    );
    assert!(!a.coordinator.is_polling(ORG));
    assert!(b.coordinator.is_polling(ORG));
    let polling = world.shared().get::<PollingState>(ORG).unwrap();
    assert_eq!(polling.owner_tab_id, b.coordinator.tab_id());
}

#[tokio::test(start_paused = true)]
async fn authorization_propagates_session() {
    let world = World::new();
    let vault_a = Arc::new(MemoryVault::new());
    let vault_b = Arc::new(MemoryVault::new());
    vault_a.store("enc:v2:abcdef");

    let mut a = world.tab_with_session(Some(vault_a));
    let _b = world.tab_with_session(Some(vault_b.clone()));
    let authorized = Arc::new(AtomicBool::new(true));

    a.coordinator.handle(
        &sso_error(),
        RequestContext::new().retry(gated_remote(&authorized)),
    );
    a.wait_for(|e| matches!(e, CoordinatorEvent::Authorized { .. })).await;
    settle().await;

    assert_eq!(vault_b.load().as_deref(), Some("enc:v2:abcdef"));
}

#[tokio::test]
async fn ownership_timestamps_come_from_the_clock() {
    let world = World::new();
    let a = world.tab();
    a.coordinator.handle(&sso_error(), RequestContext::new());

    let owner = world.shared().get::<ModalOwnership>(ORG).unwrap();
    assert_eq!(owner.claimed_at, world.clock.now_ms());
    let pending = a.coordinator.pending_request(ORG).unwrap();
    assert_eq!(pending.created_at, world.clock.now_ms());
}
