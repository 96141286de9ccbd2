//! Best-effort publish/subscribe between tabs.
//!
//! Every tab opens one [`Channel`] endpoint on a shared [`BroadcastHub`].
//! A published message reaches every *other* endpoint; the publishing tab
//! never sees its own messages. Delivery is asynchronous (a dispatcher task
//! per endpoint) and lossy under lag.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::ChannelError;
use crate::message::{BroadcastMessage, Payload};
use crate::tab::TabId;

pub const DEFAULT_CAPACITY: usize = 256;

/// Subscriber callback. Errors and panics are logged and swallowed per handler.
pub type Handler = Arc<dyn Fn(&BroadcastMessage) -> anyhow::Result<()> + Send + Sync>;

/// The shared transport all same-origin tabs attach to.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of endpoints currently listening.
    pub fn endpoints(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

struct Registered {
    id: u64,
    handler: Handler,
}

struct ChannelInner {
    tab_id: TabId,
    clock: Arc<dyn Clock>,
    tx: Option<broadcast::Sender<BroadcastMessage>>,
    handlers: RwLock<HashMap<String, Vec<Registered>>>,
    next_handler_id: AtomicU64,
    cancel: CancellationToken,
}

impl ChannelInner {
    fn deliver(&self, msg: &BroadcastMessage) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&msg.kind)
            .map(|registered| registered.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(msg))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(tab = %self.tab_id, topic = %msg.kind, error = %err, "channel handler failed");
                }
                Err(_) => {
                    error!(tab = %self.tab_id, topic = %msg.kind, "channel handler panicked");
                }
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One tab's endpoint. Cheap to clone; clones share handlers and identity.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("tab_id", &self.inner.tab_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Channel {
    /// Attach `tab_id` to the hub. Must be called from within a tokio runtime.
    pub fn connect(hub: &BroadcastHub, tab_id: TabId, clock: Arc<dyn Clock>) -> Self {
        let rx = hub.tx.subscribe();
        let inner = Arc::new(ChannelInner {
            tab_id,
            clock,
            tx: Some(hub.tx.clone()),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(dispatch(
            Arc::downgrade(&inner),
            rx,
            inner.cancel.clone(),
            tab_id,
        ));
        debug!(tab = %tab_id, "channel connected");
        Self { inner }
    }

    /// An endpoint with no cross-tab transport: publishes report `Ok(false)`,
    /// subscriptions succeed but never fire.
    pub fn detached(tab_id: TabId, clock: Arc<dyn Clock>) -> Self {
        warn!(tab = %tab_id, "cross-tab transport unavailable; running single-tab");
        Self {
            inner: Arc::new(ChannelInner {
                tab_id,
                clock,
                tx: None,
                handlers: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.inner.tab_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tx.is_some()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<Subscription, ChannelError>
    where
        F: Fn(&BroadcastMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if topic.trim().is_empty() {
            return Err(ChannelError::InvalidArgument(
                "subscribe: topic must not be empty".into(),
            ));
        }

        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Registered {
                id,
                handler: Arc::new(handler),
            });

        Ok(Subscription {
            topic: topic.to_string(),
            id,
            channel: Arc::downgrade(&self.inner),
        })
    }

    /// Returns `Ok(false)` when there is no transport to publish on.
    pub fn publish(&self, topic: &str, data: serde_json::Value) -> Result<bool, ChannelError> {
        if topic.trim().is_empty() {
            return Err(ChannelError::InvalidArgument(
                "publish: topic must not be empty".into(),
            ));
        }

        let Some(tx) = &self.inner.tx else {
            debug!(tab = %self.inner.tab_id, topic, "no cross-tab transport; publish skipped");
            return Ok(false);
        };

        let msg = BroadcastMessage::new(topic, data, self.inner.clock.now_ms(), self.inner.tab_id);
        match tx.send(msg) {
            Ok(_) => Ok(true),
            Err(_) => {
                debug!(tab = %self.inner.tab_id, topic, "no listening endpoints");
                Ok(false)
            }
        }
    }

    /// Publish a typed payload on its topic.
    pub fn emit<P: Payload>(&self, payload: &P) -> Result<bool, ChannelError> {
        let data =
            serde_json::to_value(payload).map_err(|e| ChannelError::Payload(e.to_string()))?;
        self.publish(P::TOPIC.as_str(), data)
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Handle for one registered handler.
///
/// Dropping it leaves the handler installed; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(self) {
        let Some(inner) = self.channel.upgrade() else {
            return;
        };
        let mut handlers = inner.handlers.write();
        if let Some(registered) = handlers.get_mut(&self.topic) {
            registered.retain(|r| r.id != self.id);
            if registered.is_empty() {
                handlers.remove(&self.topic);
            }
        }
    }
}

async fn dispatch(
    inner: Weak<ChannelInner>,
    mut rx: broadcast::Receiver<BroadcastMessage>,
    cancel: CancellationToken,
    tab_id: TabId,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(msg) => msg,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(tab = %tab_id, skipped, "channel lagged; messages dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        if msg.tab_id == tab_id {
            continue;
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.deliver(&msg);
    }
    debug!(tab = %tab_id, "channel dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::message::{PollingStarted, Topic};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connect(hub: &BroadcastHub) -> Channel {
        Channel::connect(hub, TabId::new(), Arc::new(SystemClock))
    }

    fn collector(
        channel: &Channel,
        topic: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<BroadcastMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = channel
            .subscribe(topic, move |msg| {
                let _ = tx.send(msg.clone());
                Ok(())
            })
            .unwrap();
        (sub, rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn empty_topic_is_rejected() {
        let hub = BroadcastHub::default();
        let channel = connect(&hub);

        let err = channel.subscribe("", |_| Ok(())).unwrap_err();
        assert_eq!(err.error_code(), "invalid_argument");
        assert!(matches!(
            channel.publish("  ", serde_json::Value::Null),
            Err(ChannelError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn delivers_to_other_tabs_but_not_sender() {
        let hub = BroadcastHub::default();
        let a = connect(&hub);
        let b = connect(&hub);
        let c = connect(&hub);

        let (_sa, mut rx_a) = collector(&a, "topic");
        let (_sb, mut rx_b) = collector(&b, "topic");
        let (_sc, mut rx_c) = collector(&c, "topic");

        assert!(a.publish("topic", serde_json::json!({ "n": 1 })).unwrap());

        let got_b = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        let got_c = tokio::time::timeout(Duration::from_secs(1), rx_c.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_b.data["n"], 1);
        assert_eq!(got_b.tab_id, a.tab_id());
        assert_eq!(got_c, got_b);

        settle().await;
        assert!(rx_a.try_recv().is_err(), "publisher must not see its own message");
        assert!(rx_b.try_recv().is_err(), "exactly one delivery per publish");
        assert!(rx_c.try_recv().is_err(), "exactly one delivery per publish");
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_others() {
        let hub = BroadcastHub::default();
        let a = connect(&hub);
        let b = connect(&hub);

        let calls = Arc::new(AtomicUsize::new(0));
        b.subscribe("t", |_| anyhow::bail!("boom")).unwrap();
        b.subscribe("t", |_| panic!("handler panic")).unwrap();
        let counter = calls.clone();
        b.subscribe("t", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        a.publish("t", serde_json::Value::Null).unwrap();
        a.publish("t", serde_json::Value::Null).unwrap();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn only_matching_topic_handlers_run() {
        let hub = BroadcastHub::default();
        let a = connect(&hub);
        let b = connect(&hub);
        let (_s1, mut opened) = collector(&b, Topic::ModalOpened.as_str());
        let (_s2, mut polling) = collector(&b, Topic::PollingStarted.as_str());

        a.emit(&PollingStarted {
            organization: "acme".into(),
        })
        .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), polling.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload::<PollingStarted>().unwrap().organization, "acme");
        settle().await;
        assert!(opened.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_handler() {
        let hub = BroadcastHub::default();
        let a = connect(&hub);
        let b = connect(&hub);

        let (first, mut rx1) = collector(&b, "t");
        let (_second, mut rx2) = collector(&b, "t");
        assert_eq!(b.handler_count("t"), 2);

        first.unsubscribe();
        assert_eq!(b.handler_count("t"), 1);

        a.publish("t", serde_json::Value::Null).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn detached_channel_soft_fails() {
        let channel = Channel::detached(TabId::new(), Arc::new(SystemClock));
        assert!(!channel.is_connected());
        tokio_test::assert_ok!(channel.subscribe("t", |_| Ok(())));
        let sent = tokio_test::assert_ok!(channel.publish("t", serde_json::Value::Null));
        assert!(!sent);
    }

    #[tokio::test]
    async fn dropping_endpoint_stops_dispatcher() {
        let hub = BroadcastHub::default();
        let a = connect(&hub);
        let b = connect(&hub);
        assert_eq!(hub.endpoints(), 2);

        drop(b);
        for _ in 0..50 {
            if hub.endpoints() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hub.endpoints(), 1);
        assert!(a.publish("t", serde_json::Value::Null).unwrap());
    }
}
