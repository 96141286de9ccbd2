//! Cross-tab coordination of organization SSO authorization: one prompt,
//! one poller, one session for every open tab.

pub mod channel;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod metrics;
pub mod poller;
pub mod session;
pub mod store;
pub mod tab;

pub use channel::{BroadcastHub, Channel, Subscription};
pub use classifier::{ErrorClassifier, SsoError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoordinatorConfig, load_config};
pub use coordinator::{
    AuthCoordinator, AuthorizationPrompt, AuthorizationState, CoordinatorEvent, RequestContext,
    authorization_url,
};
pub use error::{ChannelError, RemoteError, StoreError};
pub use message::{BroadcastMessage, Topic};
pub use metrics::{CoordinatorMetrics, MetricsSnapshot};
pub use poller::{PollOptions, PollOutcome, PollingEngine, RetryFn, retry_fn};
pub use session::{MemoryVault, SessionEvent, SessionSync, SessionVault};
pub use store::{CoordinationStore, FileStore, MemoryStore, SharedState};
pub use tab::TabId;
