//! Real-time fan-out of newly persisted messages to live subscribers.
//!
//! The gateway consumes the store's change feed and routes each message to a per-thread
//! upstream channel. Every subscription owns one receiver on that channel and a task that
//! enriches and delivers messages in persisted order.
//!
//! Slow consumers: sinks must not block. Queued consumers go through a [`backlog`], a
//! bounded queue that evicts its oldest entry when a new message arrives at capacity, so a
//! stalled consumer always resumes with the newest messages and the gap sits at the front.
//! Drops are per subscriber (counted in `convo_fanout_dropped_total`); the writer and the
//! other subscribers are never held up. Clients that miss messages, or reconnect, reconcile
//! with `list_messages` and must deduplicate by message id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collab::UserDirectory;
use crate::models::{AuthorInfo, DeliveredMessage, Id, Message};
use crate::telemetry;

/// Where a subscription's messages end up.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Returns `false` once the receiving side is gone; the subscription then ends.
    async fn deliver(&self, message: DeliveredMessage) -> bool;
}

struct BacklogShared {
    queue: Mutex<VecDeque<DeliveredMessage>>,
    capacity: usize,
    ready: Notify,
    sink_gone: AtomicBool,
    receiver_gone: AtomicBool,
}

impl BacklogShared {
    fn pop(&self) -> Option<DeliveredMessage> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }
}

/// Producing half of a [`backlog`]. Never waits: at capacity the oldest queued message
/// is evicted.
pub struct BacklogSink {
    shared: Arc<BacklogShared>,
}

/// Consuming half of a [`backlog`]. Yields `None` once the subscription has ended and
/// everything queued has been read.
pub struct Backlog {
    shared: Arc<BacklogShared>,
}

/// A bounded drop-oldest queue to hand to [`FanOutGateway::subscribe`].
pub fn backlog(capacity: usize) -> (BacklogSink, Backlog) {
    let shared = Arc::new(BacklogShared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        capacity: capacity.max(1),
        ready: Notify::new(),
        sink_gone: AtomicBool::new(false),
        receiver_gone: AtomicBool::new(false),
    });
    (BacklogSink { shared: shared.clone() }, Backlog { shared })
}

#[async_trait]
impl MessageSink for BacklogSink {
    async fn deliver(&self, message: DeliveredMessage) -> bool {
        if self.shared.receiver_gone.load(Ordering::Acquire) {
            return false;
        }
        let evicted = {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(message);
            if queue.len() > self.shared.capacity {
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            debug!(message_id = old.message.id, "backlog full, evicted oldest message");
            telemetry::fanout_dropped(1);
        }
        self.shared.ready.notify_one();
        true
    }
}

impl Drop for BacklogSink {
    fn drop(&mut self) {
        self.shared.sink_gone.store(true, Ordering::Release);
        self.shared.ready.notify_one();
    }
}

impl Backlog {
    pub async fn recv(&mut self) -> Option<DeliveredMessage> {
        loop {
            if let Some(message) = self.shared.pop() {
                return Some(message);
            }
            if self.shared.sink_gone.load(Ordering::Acquire) {
                // the last delivery may have landed between the pop and the flag check
                return self.shared.pop();
            }
            self.shared.ready.notified().await;
        }
    }

    /// Number of messages waiting to be read.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Backlog {
    fn drop(&mut self) {
        self.shared.receiver_gone.store(true, Ordering::Release);
    }
}

/// Adapts a plain closure into a sink.
pub struct CallbackSink<F>(pub F);

#[async_trait]
impl<F> MessageSink for CallbackSink<F>
where
    F: Fn(DeliveredMessage) -> bool + Send + Sync + 'static,
{
    async fn deliver(&self, message: DeliveredMessage) -> bool {
        (self.0)(message)
    }
}

struct Subscriber {
    token: u64,
    task: JoinHandle<()>,
}

struct ThreadChannel {
    upstream: broadcast::Sender<Message>,
    subscribers: HashMap<Id, Subscriber>, // subscriber id -> live subscription
}

struct GatewayInner {
    channels: DashMap<Id, ThreadChannel>,
    users: Arc<dyn UserDirectory>,
    queue_capacity: usize,
    next_token: AtomicU64,
    router: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct FanOutGateway {
    inner: Arc<GatewayInner>,
}

/// Handle to one live subscription. Dropping it leaves the subscription running;
/// call [`SubscriptionHandle::cancel`] to end it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    gateway: Weak<GatewayInner>,
    pub thread_id: Id,
    pub subscriber_id: Id,
    token: u64,
}

impl SubscriptionHandle {
    pub fn cancel(self) {
        if let Some(inner) = self.gateway.upgrade() {
            if let Some(sub) = inner.release(self.thread_id, self.subscriber_id, self.token) {
                sub.task.abort();
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.gateway.upgrade().map_or(false, |inner| {
            inner
                .channels
                .get(&self.thread_id)
                .and_then(|ch| ch.subscribers.get(&self.subscriber_id).map(|s| s.token == self.token))
                .unwrap_or(false)
        })
    }
}

impl GatewayInner {
    /// Drops one subscription if it is still the current one for its key, and the thread's
    /// upstream once nobody listens anymore.
    fn release(&self, thread_id: Id, subscriber_id: Id, token: u64) -> Option<Subscriber> {
        let removed = {
            let mut ch = self.channels.get_mut(&thread_id)?;
            match ch.subscribers.get(&subscriber_id) {
                Some(s) if s.token == token => ch.subscribers.remove(&subscriber_id),
                _ => None,
            }
        };
        self.channels.remove_if(&thread_id, |_, ch| ch.subscribers.is_empty());
        removed
    }

    fn route(&self, message: Message) {
        if let Some(ch) = self.channels.get(&message.thread_id) {
            // no receivers left is fine: the channel is about to be released
            let _ = ch.upstream.send(message);
        }
    }
}

impl FanOutGateway {
    pub fn new(users: Arc<dyn UserDirectory>, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                channels: DashMap::new(),
                users,
                queue_capacity: queue_capacity.max(1),
                next_token: AtomicU64::new(1),
                router: Mutex::new(None),
            }),
        }
    }

    /// Starts routing the store's change feed. Replaces any previously attached feed.
    pub fn attach_feed(&self, mut feed: broadcast::Receiver<Message>) {
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(message) => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.route(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fan-out router fell behind the change feed");
                        telemetry::fanout_dropped(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("change feed closed");
        });
        if let Ok(mut router) = self.inner.router.lock() {
            if let Some(previous) = router.replace(task) {
                previous.abort();
            }
        }
    }

    /// Pushes a message straight to the thread's subscribers, bypassing the change feed.
    pub fn publish(&self, message: Message) {
        self.inner.route(message);
    }

    /// Registers `sink` for new messages on `thread_id`. An existing subscription with the
    /// same `subscriber_id` on that thread is replaced.
    pub fn subscribe<S: MessageSink>(&self, thread_id: Id, subscriber_id: Id, sink: S) -> SubscriptionHandle {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let capacity = self.inner.queue_capacity;
        let mut ch = self.inner.channels.entry(thread_id).or_insert_with(|| ThreadChannel {
            upstream: broadcast::channel(capacity).0,
            subscribers: HashMap::new(),
        });
        let rx = ch.upstream.subscribe();
        let task = tokio::spawn(deliver_loop(
            Arc::downgrade(&self.inner),
            self.inner.users.clone(),
            rx,
            sink,
            (thread_id, subscriber_id, token),
        ));
        if let Some(previous) = ch.subscribers.insert(subscriber_id, Subscriber { token, task }) {
            debug!(thread_id, subscriber_id, "replacing existing subscription");
            previous.task.abort();
        }
        drop(ch);
        SubscriptionHandle { gateway: Arc::downgrade(&self.inner), thread_id, subscriber_id, token }
    }

    /// Ends every local subscription on `thread_id` and releases its upstream. Idempotent.
    pub fn unsubscribe(&self, thread_id: Id) {
        if let Some((_, ch)) = self.inner.channels.remove(&thread_id) {
            for sub in ch.subscribers.into_values() {
                sub.task.abort();
            }
        }
    }

    /// Ends one subscriber's subscription on `thread_id`, whichever handle created it.
    pub fn drop_subscriber(&self, thread_id: Id, subscriber_id: Id) -> bool {
        let removed = self
            .inner
            .channels
            .get_mut(&thread_id)
            .and_then(|mut ch| ch.subscribers.remove(&subscriber_id));
        self.inner.channels.remove_if(&thread_id, |_, ch| ch.subscribers.is_empty());
        match removed {
            Some(sub) => {
                sub.task.abort();
                true
            }
            None => false,
        }
    }

    /// Tears down the router and all subscriptions.
    pub fn shutdown(&self) {
        if let Ok(mut router) = self.inner.router.lock() {
            if let Some(task) = router.take() {
                task.abort();
            }
        }
        let threads: Vec<Id> = self.inner.channels.iter().map(|e| *e.key()).collect();
        for thread_id in threads {
            self.unsubscribe(thread_id);
        }
    }

    pub fn subscriber_count(&self, thread_id: Id) -> usize {
        self.inner.channels.get(&thread_id).map_or(0, |ch| ch.subscribers.len())
    }

    pub fn active_threads(&self) -> usize {
        self.inner.channels.len()
    }
}

async fn deliver_loop<S: MessageSink>(
    gateway: Weak<GatewayInner>,
    users: Arc<dyn UserDirectory>,
    mut rx: broadcast::Receiver<Message>,
    sink: S,
    (thread_id, subscriber_id, token): (Id, Id, u64),
) {
    loop {
        match rx.recv().await {
            Ok(message) => {
                let author = resolve_author(users.as_ref(), message.author_id).await;
                if !sink.deliver(DeliveredMessage { message, author }).await {
                    debug!(thread_id, subscriber_id, "subscriber went away");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(thread_id, subscriber_id, skipped, "delivery fell behind, oldest messages dropped");
                telemetry::fanout_dropped(skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    if let Some(inner) = gateway.upgrade() {
        inner.release(thread_id, subscriber_id, token);
    }
}

/// Looked up per delivery so profile changes show up on live streams.
async fn resolve_author(users: &dyn UserDirectory, author_id: Id) -> AuthorInfo {
    match users.get_user(author_id).await {
        Ok(u) => AuthorInfo { id: u.id, display_name: Some(u.display_name), avatar_url: u.avatar_url },
        Err(e) => {
            debug!(author_id, error = %e, "author lookup failed, delivering without profile");
            AuthorInfo { id: author_id, display_name: None, avatar_url: None }
        }
    }
}
