//! CMDP monitoring: publisher, listener and the tracing bridge.
//!
//! The publisher owns the `MONITORING` socket of a satellite: log records go
//! out as `LOG/<LEVEL>/<domain>` messages, metrics as `STAT/<name>`, and the
//! set of offered topics is announced with `NOTICE/TOPICS` notifications
//! whenever it changes or a listener subscribes to notifications.
//!
//! The listener aggregates topic availability across the fleet and manages
//! subscriptions in two tiers: *global* topics applied to every connected
//! peer and *extra* topics requested for a single host. For every
//! `(peer, topic)` pair a subscription is announced while either tier wants
//! it and withdrawn only when neither does.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use constellation_core::{Dictionary, Md5Hash, Value};
use constellation_protocol::chirp::ServiceIdentifier;
use constellation_protocol::cmdp::NOTICE_TOPIC_PREFIX;
use constellation_protocol::codec;
use constellation_protocol::{CmdpMessage, CmdpNotification};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::chirp::ChirpManager;
use crate::error::NetworkError;
use crate::pool::{PoolEvent, SubscriberPool};
use crate::sockets::{PubSocket, SubscriptionEvent};

/// Queue depth between the tracing layer and the publisher task.
const LOG_QUEUE: usize = 512;

// ─────────────────────────────────────────────────────────────────────────────
// Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// The monitoring publisher of a satellite.
pub struct CmdpPublisher {
    sender_name: String,
    socket: Arc<PubSocket>,
    topics: Mutex<Dictionary>,
    cancel: CancellationToken,
}

impl CmdpPublisher {
    /// Bind the publisher socket and announce it via CHIRP.
    ///
    /// # Errors
    /// Returns [`NetworkError::Bind`] if the socket cannot be created.
    pub async fn start(chirp: &ChirpManager, sender_name: String) -> Result<Arc<Self>, NetworkError> {
        let socket = PubSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        let events = socket.take_subscription_events();

        let publisher = Arc::new(Self {
            sender_name,
            socket: Arc::new(socket),
            topics: Mutex::new(Dictionary::new()),
            cancel: CancellationToken::new(),
        });
        chirp
            .register_service(ServiceIdentifier::Monitoring, publisher.port())
            .await;

        // Re-announce offered topics whenever a listener subscribes to
        // notifications, so late joiners converge without polling.
        if let Some(mut events) = events {
            let weak = Arc::downgrade(&publisher);
            let cancel = publisher.cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break,
                        event = events.recv() => event,
                    };
                    let Some(event) = event else { break };
                    if let SubscriptionEvent::Subscribe(prefix) = event {
                        if NOTICE_TOPIC_PREFIX.as_bytes().starts_with(prefix.as_ref())
                            || prefix.starts_with(NOTICE_TOPIC_PREFIX.as_bytes())
                        {
                            match weak.upgrade() {
                                Some(publisher) => publisher.send_notification(),
                                None => break,
                            }
                        }
                    }
                }
            });
        }

        Ok(publisher)
    }

    /// TCP port of the publisher socket.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Register an offered topic and announce the updated set.
    pub fn register_topic(&self, topic: impl Into<String>, description: impl Into<String>) {
        self.topics.lock().insert(topic.into(), description.into());
        self.send_notification();
    }

    /// Publish a log record.
    pub fn log(&self, level: &str, domain: &str, message: &str) {
        self.publish(&CmdpMessage::log(self.sender_name.clone(), level, domain, message));
    }

    /// Publish a metric value.
    pub fn stat(&self, name: &str, value: &Value) {
        match codec::value_to_bytes(value) {
            Ok(payload) => {
                self.publish(&CmdpMessage::stat(self.sender_name.clone(), name, payload));
            }
            Err(err) => warn!(%err, name, "failed to encode metric value"),
        }
    }

    /// Build a `tracing` layer that mirrors log events onto this publisher.
    #[must_use]
    pub fn layer(self: &Arc<Self>) -> CmdpLayer {
        let (tx, mut rx) = mpsc::channel::<LogRecord>(LOG_QUEUE);
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    () = cancel.cancelled() => break,
                    record = rx.recv() => record,
                };
                let Some(record) = record else { break };
                match weak.upgrade() {
                    Some(publisher) => publisher.log(&record.level, &record.target, &record.message),
                    None => break,
                }
            }
        });
        CmdpLayer { tx }
    }

    /// Stop publishing and close the socket.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.socket.close();
    }

    fn publish(&self, message: &CmdpMessage) {
        match message.assemble() {
            Ok(frames) => self.socket.publish(&frames),
            Err(err) => warn!(%err, "failed to assemble monitoring message"),
        }
    }

    fn send_notification(&self) {
        let topics = self.topics.lock().clone();
        match CmdpNotification::message(self.sender_name.clone(), &topics) {
            Ok(message) => self.publish(&message),
            Err(err) => warn!(%err, "failed to assemble topic notification"),
        }
    }
}

impl Drop for CmdpPublisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracing bridge
// ─────────────────────────────────────────────────────────────────────────────

struct LogRecord {
    level: String,
    target: String,
    message: String,
}

/// A `tracing-subscriber` layer forwarding events to a [`CmdpPublisher`].
///
/// Events are handed off through a bounded queue and dropped on overflow, so
/// logging never blocks the instrumented code path.
pub struct CmdpLayer {
    tx: mpsc::Sender<LogRecord>,
}

impl<S> Layer<S> for CmdpLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        // The publisher itself logs via tracing; forwarding those events
        // would loop back into the publisher.
        if target.starts_with("constellation_mesh") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: level_name(*event.metadata().level()).to_owned(),
            target: target.to_owned(),
            message: visitor.message,
        };
        let _ = self.tx.try_send(record);
    }
}

fn level_name(level: Level) -> &'static str {
    if level == Level::ERROR {
        "CRITICAL"
    } else if level == Level::WARN {
        "WARNING"
    } else if level == Level::INFO {
        "INFO"
    } else if level == Level::DEBUG {
        "DEBUG"
    } else {
        "TRACE"
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Hook invoked with a sender's canonical name.
pub type SenderHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback receiving every non-notification monitoring message.
pub type MessageCallback = Arc<dyn Fn(CmdpMessage) + Send + Sync>;

/// Optional hooks of a [`CmdpListener`].
#[derive(Default, Clone)]
pub struct ListenerHooks {
    /// Invoked when a sender appears for the first time.
    pub new_sender: Option<SenderHook>,
    /// Invoked when a sender announces topics not seen before.
    pub new_topics: Option<SenderHook>,
}

#[derive(Default)]
struct ListenerState {
    subscribed: Mutex<BTreeSet<String>>,
    extra: Mutex<BTreeMap<String, BTreeSet<String>>>,
    available: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

/// Subscriber-side aggregation of monitoring channels across the fleet.
pub struct CmdpListener {
    pool: Arc<SubscriberPool>,
    state: Arc<ListenerState>,
    cancel: CancellationToken,
}

impl CmdpListener {
    /// Start listening: one subscriber socket per discovered `MONITORING`
    /// service, notifications always subscribed.
    #[must_use]
    pub fn start(chirp: Arc<ChirpManager>, callback: MessageCallback, hooks: ListenerHooks) -> Self {
        let (pool, mut events) = SubscriberPool::new(Arc::clone(&chirp), ServiceIdentifier::Monitoring);
        let pool = Arc::new(pool);
        let state = Arc::new(ListenerState::default());
        let cancel = CancellationToken::new();

        let task_pool = Arc::clone(&pool);
        let task_state = Arc::clone(&state);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            chirp.send_request(ServiceIdentifier::Monitoring).await;
            loop {
                let event = tokio::select! {
                    () = task_cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                match event {
                    PoolEvent::Connected(service) => {
                        connect_subscriptions(&task_pool, &task_state, service.host_id).await;
                    }
                    PoolEvent::Message(_, frames) => {
                        let message = match CmdpMessage::disassemble(&frames) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(%err, "discarding malformed monitoring message");
                                continue;
                            }
                        };
                        handle_message(&task_state, message, &callback, &hooks);
                    }
                    PoolEvent::Disconnected(_) => {
                        // Availability is kept: topics describe what a sender
                        // offers, not whether it is currently connected.
                    }
                }
            }
        });

        Self { pool, state, cancel }
    }

    /// Subscribe a topic on every peer.
    pub async fn subscribe_topic(&self, topic: impl Into<String>) {
        self.multiscribe_topics(Vec::new(), vec![topic.into()]).await;
    }

    /// Unsubscribe a topic from every peer.
    pub async fn unsubscribe_topic(&self, topic: impl Into<String>) {
        self.multiscribe_topics(vec![topic.into()], Vec::new()).await;
    }

    /// Drop and add global topics in one pass.
    pub async fn multiscribe_topics(&self, drop: Vec<String>, add: Vec<String>) {
        let mut actually_dropped = Vec::new();
        let mut actually_added = Vec::new();
        {
            let mut subscribed = self.state.subscribed.lock();
            for topic in drop {
                if subscribed.remove(&topic) {
                    actually_dropped.push(topic);
                }
            }
            for topic in add {
                if subscribed.insert(topic.clone()) {
                    actually_added.push(topic);
                }
            }
        }

        for topic in &actually_dropped {
            self.pool.unsubscribe_all(topic.as_bytes()).await;
        }
        for topic in &actually_added {
            self.pool.subscribe_all(topic.as_bytes()).await;
        }

        // Hosts with an extra-tier request for a dropped topic keep it.
        let resubscribe: Vec<(Md5Hash, String)> = {
            let extra = self.state.extra.lock();
            extra
                .iter()
                .flat_map(|(host, topics)| {
                    topics
                        .iter()
                        .filter(|topic| actually_dropped.contains(*topic))
                        .map(|topic| (Md5Hash::new(host), topic.clone()))
                })
                .collect()
        };
        for (host_id, topic) in resubscribe {
            if let Err(err) = self.pool.subscribe(host_id, topic.as_bytes()).await {
                debug!(%err, "failed to restore extra-tier subscription");
            }
        }
    }

    /// Subscribe a topic on a single host.
    pub async fn subscribe_extra_topic(&self, host: &str, topic: impl Into<String>) {
        self.multiscribe_extra_topics(host, Vec::new(), vec![topic.into()]).await;
    }

    /// Unsubscribe a per-host topic.
    pub async fn unsubscribe_extra_topic(&self, host: &str, topic: impl Into<String>) {
        self.multiscribe_extra_topics(host, vec![topic.into()], Vec::new()).await;
    }

    /// Drop and add per-host extra topics in one pass.
    pub async fn multiscribe_extra_topics(&self, host: &str, drop: Vec<String>, add: Vec<String>) {
        let host_id = Md5Hash::new(host);
        let mut to_unsubscribe = Vec::new();
        let mut to_subscribe = Vec::new();
        {
            let subscribed = self.state.subscribed.lock();
            let mut extra = self.state.extra.lock();
            let topics = extra.entry(host.to_owned()).or_default();
            for topic in drop {
                if topics.remove(&topic) && !subscribed.contains(&topic) {
                    to_unsubscribe.push(topic);
                }
            }
            for topic in add {
                if topics.insert(topic.clone()) && !subscribed.contains(&topic) {
                    to_subscribe.push(topic);
                }
            }
            if topics.is_empty() {
                extra.remove(host);
            }
        }

        for topic in to_unsubscribe {
            if let Err(err) = self.pool.unsubscribe(host_id, topic.as_bytes()).await {
                debug!(%err, host, "failed to unsubscribe extra topic");
            }
        }
        for topic in to_subscribe {
            if let Err(err) = self.pool.subscribe(host_id, topic.as_bytes()).await {
                debug!(%err, host, "failed to subscribe extra topic");
            }
        }
    }

    /// Remove all extra topics of one host.
    pub async fn remove_extra_topic_subscriptions(&self, host: &str) {
        let topics: Vec<String> = self
            .state
            .extra
            .lock()
            .get(host)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default();
        self.multiscribe_extra_topics(host, topics, Vec::new()).await;
    }

    /// Remove the extra topics of every host.
    pub async fn remove_all_extra_topic_subscriptions(&self) {
        let hosts: Vec<String> = self.state.extra.lock().keys().cloned().collect();
        for host in hosts {
            self.remove_extra_topic_subscriptions(&host).await;
        }
    }

    /// The current global subscriptions.
    #[must_use]
    pub fn topic_subscriptions(&self) -> BTreeSet<String> {
        self.state.subscribed.lock().clone()
    }

    /// The current extra subscriptions of one host.
    #[must_use]
    pub fn extra_topic_subscriptions(&self, host: &str) -> BTreeSet<String> {
        self.state.extra.lock().get(host).cloned().unwrap_or_default()
    }

    /// All topics ever announced, across senders.
    #[must_use]
    pub fn available_topics(&self) -> BTreeMap<String, String> {
        let available = self.state.available.lock();
        let mut topics = BTreeMap::new();
        for sender_topics in available.values() {
            for (topic, description) in sender_topics {
                topics.entry(topic.clone()).or_insert_with(|| description.clone());
            }
        }
        topics
    }

    /// The topics announced by one sender.
    #[must_use]
    pub fn available_topics_of(&self, sender: &str) -> BTreeMap<String, String> {
        self.state.available.lock().get(sender).cloned().unwrap_or_default()
    }

    /// Whether any sender has announced the topic.
    #[must_use]
    pub fn is_topic_available(&self, topic: &str) -> bool {
        self.state
            .available
            .lock()
            .values()
            .any(|topics| topics.contains_key(topic))
    }

    /// Stop the listener and disconnect from all peers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pool.shutdown().await;
    }
}

impl Drop for CmdpListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn connect_subscriptions(pool: &SubscriberPool, state: &ListenerState, host_id: Md5Hash) {
    let mut topics: BTreeSet<String> = state.subscribed.lock().clone();
    {
        let extra = state.extra.lock();
        for (host, host_topics) in extra.iter() {
            if Md5Hash::new(host) == host_id {
                topics.extend(host_topics.iter().cloned());
            }
        }
    }
    // Notifications are always wanted.
    topics.insert(NOTICE_TOPIC_PREFIX.to_owned());

    for topic in topics {
        if let Err(err) = pool.subscribe(host_id, topic.as_bytes()).await {
            debug!(%err, "failed to apply subscription on connect");
            return;
        }
    }
}

fn handle_message(
    state: &ListenerState,
    message: CmdpMessage,
    callback: &MessageCallback,
    hooks: &ListenerHooks,
) {
    let sender = message.header().sender().to_owned();

    if message.is_notification() {
        let notification = match CmdpNotification::from_message(&message) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(%err, "discarding malformed notification");
                return;
            }
        };

        let (new_sender, new_topics) = {
            let mut available = state.available.lock();
            let new_sender = !available.contains_key(&sender);
            let sender_topics = available.entry(sender.clone()).or_default();
            let mut new_topics = false;
            for (topic, description) in notification.topics().iter() {
                let description = match description {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                new_topics |= sender_topics.insert(topic.to_owned(), description).is_none();
            }
            (new_sender, new_topics)
        };

        if new_sender {
            if let Some(hook) = &hooks.new_sender {
                hook(&sender);
            }
        }
        if new_topics {
            if let Some(hook) = &hooks.new_topics {
                hook(&sender);
            }
        }
        return;
    }

    let (new_sender, new_topic) = {
        let mut available = state.available.lock();
        let new_sender = !available.contains_key(&sender);
        let sender_topics = available.entry(sender.clone()).or_default();
        let new_topic = !sender_topics.contains_key(message.topic());
        if new_topic {
            sender_topics.insert(message.topic().to_owned(), String::new());
        }
        (new_sender, new_topic)
    };

    if new_sender {
        if let Some(hook) = &hooks.new_sender {
            hook(&sender);
        }
    }
    if new_topic {
        if let Some(hook) = &hooks.new_topics {
            hook(&sender);
        }
    }

    callback(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_state() -> ListenerState {
        ListenerState::default()
    }

    fn log_message(sender: &str, topic_domain: &str) -> CmdpMessage {
        CmdpMessage::log(sender, "info", topic_domain, "text")
    }

    #[test]
    fn regular_message_records_topic_and_fires_hooks_once() {
        let state = listener_state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let callback: MessageCallback = Arc::new(move |message| {
            seen_cb.lock().push(message.topic().to_owned());
        });

        let senders = Arc::new(Mutex::new(Vec::new()));
        let senders_hook = Arc::clone(&senders);
        let hooks = ListenerHooks {
            new_sender: Some(Arc::new(move |sender| {
                senders_hook.lock().push(sender.to_owned());
            })),
            new_topics: None,
        };

        handle_message(&state, log_message("Sat.one", "fsm"), &callback, &hooks);
        handle_message(&state, log_message("Sat.one", "fsm"), &callback, &hooks);

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(senders.lock().as_slice(), ["Sat.one"]);
        assert!(state.available.lock().get("Sat.one").unwrap().contains_key("LOG/INFO/fsm"));
    }

    #[test]
    fn notification_updates_available_topics() {
        let state = listener_state();
        let callback: MessageCallback = Arc::new(|_| panic!("notifications are not forwarded"));
        let topics_hooked = Arc::new(Mutex::new(0_u32));
        let hook_count = Arc::clone(&topics_hooked);
        let hooks = ListenerHooks {
            new_sender: None,
            new_topics: Some(Arc::new(move |_| {
                *hook_count.lock() += 1;
            })),
        };

        let mut topics = Dictionary::new();
        topics.insert("LOG/INFO/fsm", "FSM logs");
        let message = CmdpNotification::message("Sat.one", &topics).unwrap();

        handle_message(&state, message.clone(), &callback, &hooks);
        assert_eq!(*topics_hooked.lock(), 1);

        // Re-announcing the same topics is not news.
        handle_message(&state, message, &callback, &hooks);
        assert_eq!(*topics_hooked.lock(), 1);
        assert_eq!(
            state.available.lock().get("Sat.one").unwrap().get("LOG/INFO/fsm"),
            Some(&"FSM logs".to_owned())
        );
    }
}
