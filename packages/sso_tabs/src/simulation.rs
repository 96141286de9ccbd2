//! Drives N in-process tabs through one SSO authorization flow.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use sso_coord::channel::{BroadcastHub, Channel};
use sso_coord::clock::{Clock, SystemClock};
use sso_coord::config::CoordinatorConfig;
use sso_coord::coordinator::{
    AuthCoordinator, AuthorizationPrompt, AuthorizationState, CoordinatorEvent, RequestContext,
};
use sso_coord::metrics::MetricsSnapshot;
use sso_coord::session::{MemoryVault, SessionSync, SessionVault};
use sso_coord::store::{CoordinationStore, FileStore, MemoryStore};
use sso_coord::tab::TabId;

use crate::remote::SimulatedRemote;

// Gap between tabs issuing their first request.
const TAB_STAGGER: Duration = Duration::from_millis(10);
const PROMPT_WAIT: Duration = Duration::from_secs(1);
const SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Scenario {
    pub tabs: usize,
    pub organization: String,
    pub repository: Option<String>,
    pub authorize_after: Duration,
    pub later: bool,
    pub store: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Authorized,
    TimedOut,
    Failed,
    Cancelled,
    NoPrompt,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub organization: String,
    pub outcome: Outcome,
    pub prompted_tabs: Vec<String>,
    pub remote_requests: u64,
    pub tabs: Vec<TabReport>,
}

#[derive(Debug, Serialize)]
pub struct TabReport {
    pub tab: String,
    pub state: AuthorizationState,
    pub pending: bool,
    pub session: bool,
    pub metrics: MetricsSnapshot,
}

struct SimTab {
    coordinator: AuthCoordinator,
    vault: Arc<MemoryVault>,
    events: broadcast::Receiver<CoordinatorEvent>,
}

pub async fn run(scenario: &Scenario, config: CoordinatorConfig) -> Result<Report> {
    anyhow::ensure!(scenario.tabs > 0, "at least one tab is required");

    let hub = BroadcastHub::new(config.channel_capacity);
    let store: Arc<dyn CoordinationStore> = match &scenario.store {
        Some(path) => Arc::new(
            FileStore::open(path)
                .with_context(|| format!("failed to open coordination store {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let remote = SimulatedRemote::new(&scenario.organization);
    let (prompt_tx, mut prompt_rx) = mpsc::unbounded_channel::<(usize, AuthorizationPrompt)>();

    let mut tabs = Vec::with_capacity(scenario.tabs);
    for index in 0..scenario.tabs {
        let channel = Channel::connect(&hub, TabId::new(), clock.clone());
        let vault = Arc::new(MemoryVault::new());
        let session = SessionSync::attach(channel.clone(), vault.clone())
            .context("failed to attach session propagation")?;
        let tx = prompt_tx.clone();
        let coordinator = AuthCoordinator::builder(channel, store.clone())
            .clock(clock.clone())
            .config(config.clone())
            .session_sync(Arc::new(session))
            .on_authorization_needed(move |prompt| {
                let _ = tx.send((index, prompt));
            })
            .build()
            .context("failed to build coordinator")?;
        let events = coordinator.subscribe_events();
        tabs.push(SimTab {
            coordinator,
            vault,
            events,
        });
    }
    drop(prompt_tx);

    // Only the first tab holds a session; the rest pick it up on completion.
    let seed = format!("enc:{}", tabs[0].coordinator.tab_id());
    tabs[0].vault.store(&seed);

    let path = match &scenario.repository {
        Some(repo) => format!("repos/{}/{}", scenario.organization, repo),
        None => format!("orgs/{}/repos", scenario.organization),
    };
    for (index, tab) in tabs.iter().enumerate() {
        if let Err(error) = remote.fetch(&path).await {
            let mut ctx = RequestContext::new().retry(remote.retry(&path));
            if let Some(repo) = &scenario.repository {
                ctx = ctx.repository(repo.clone());
            }
            if !tab.coordinator.handle(&error, ctx) {
                warn!(tab = index, error = %error, "remote error not handled by coordinator");
            }
        }
        tokio::time::sleep(TAB_STAGGER).await;
    }

    let first = tokio::time::timeout(PROMPT_WAIT, prompt_rx.recv())
        .await
        .ok()
        .flatten();
    let mut prompted = Vec::new();

    let outcome = match first {
        None => Outcome::NoPrompt,
        Some((owner, prompt)) => {
            prompted.push(owner);
            info!(
                tab = owner,
                organization = %prompt.organization,
                url = %prompt.authorization_url,
                "authorization prompt displayed"
            );

            if scenario.later {
                tokio::time::sleep(scenario.authorize_after).await;
                tabs[owner]
                    .coordinator
                    .notify_modal_closed(&prompt.organization, true);
                Outcome::Cancelled
            } else {
                let human = remote.clone();
                let delay = scenario.authorize_after;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    human.authorize();
                });
                let budget = config.poll_timeout() + config.poll_interval();
                wait_for_outcome(&mut tabs[owner].events, budget).await
            }
        }
    };
    tokio::time::sleep(SETTLE).await;

    while let Ok((index, _)) = prompt_rx.try_recv() {
        prompted.push(index);
    }

    let report = Report {
        organization: scenario.organization.clone(),
        outcome,
        prompted_tabs: prompted
            .iter()
            .map(|&i| tabs[i].coordinator.tab_id().short())
            .collect(),
        remote_requests: remote.requests(),
        tabs: tabs
            .iter()
            .map(|tab| TabReport {
                tab: tab.coordinator.tab_id().short(),
                state: tab.coordinator.state(&scenario.organization),
                pending: tab
                    .coordinator
                    .pending_request(&scenario.organization)
                    .is_some(),
                session: tab.vault.load().is_some(),
                metrics: tab.coordinator.metrics(),
            })
            .collect(),
    };

    for tab in &tabs {
        tab.coordinator.shutdown();
    }
    info!(outcome = ?report.outcome, tabs = report.tabs.len(), "simulation finished");
    Ok(report)
}

async fn wait_for_outcome(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    budget: Duration,
) -> Outcome {
    let waited = tokio::time::timeout(budget, async {
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::Authorized { .. }) => return Outcome::Authorized,
                Ok(CoordinatorEvent::TimedOut { .. }) => return Outcome::TimedOut,
                Ok(CoordinatorEvent::PollingFailed { .. }) => return Outcome::Failed,
                Ok(CoordinatorEvent::Cancelled { .. }) => return Outcome::Cancelled,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Outcome::Failed,
            }
        }
    })
    .await;
    waited.unwrap_or(Outcome::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(tabs: usize) -> Scenario {
        Scenario {
            tabs,
            organization: "acme".into(),
            repository: Some("guides".into()),
            authorize_after: Duration::from_millis(4_000),
            later: false,
            store: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_tabs_converge_after_authorization() {
        let report = run(&scenario(3), CoordinatorConfig::default()).await.unwrap();

        assert_eq!(report.outcome, Outcome::Authorized);
        assert_eq!(report.prompted_tabs.len(), 1);
        assert_eq!(report.tabs.len(), 3);
        assert!(report.tabs.iter().all(|t| !t.pending));
        assert!(report.tabs.iter().all(|t| t.session));
        assert_eq!(
            report
                .tabs
                .iter()
                .filter(|t| t.state == AuthorizationState::Authorized)
                .count(),
            1
        );
        let polls: u64 = report.tabs.iter().map(|t| t.metrics.polling.started).sum();
        assert_eq!(polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn later_puts_every_tab_in_cooldown() {
        let mut scenario = scenario(2);
        scenario.later = true;
        scenario.authorize_after = Duration::from_millis(500);

        let report = run(&scenario, CoordinatorConfig::default()).await.unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(
            report
                .tabs
                .iter()
                .all(|t| t.state == AuthorizationState::Cooldown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn file_store_backs_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut scenario = scenario(2);
        scenario.store = Some(tmp.path().join("coord.json"));

        let report = run(&scenario, CoordinatorConfig::default()).await.unwrap();
        assert_eq!(report.outcome, Outcome::Authorized);
        assert!(tmp.path().join("coord.json").exists());
    }

    #[tokio::test]
    async fn zero_tabs_is_rejected() {
        assert!(run(&scenario(0), CoordinatorConfig::default()).await.is_err());
    }
}
