//! Subscribe-side MQTT session
//!
//! [`MqttSubscriber`] runs one long-lived listener task. Each connect cycle
//! resolves credentials, subscribes to the prefixed topic set and feeds
//! decoded messages to a [`MessageSink`]. Topic changes and token expiry
//! raise a level-triggered reconnect flag; the live session notices it,
//! closes, and the next cycle picks up the new topics and credentials.

use super::connection::{configure_mqtt_options, resolve_credentials, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use super::publisher::REQUEST_CHANNEL_CAPACITY;
use super::reconnect::{token_refresh_delay, ReconnectPolicy, ReconnectionDecision};
use crate::config::MqttConfig;
use crate::error::HandlerError;
use crate::protocol::topics::strip_topic_prefix;
use crate::protocol::QoS;
use crate::transport::TokenProvider;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::v5::mqttbytes::v5::Filter;
use rumqttc::v5::{AsyncClient, EventLoop};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Suffix appended to the configured client id for the subscribe session
pub const SUBSCRIBER_CLIENT_SUFFIX: &str = "-sub";

/// How long `stop` waits for the listener before aborting it
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing session gets to flush its DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Received messages buffered per session ahead of the sink
const DELIVERY_QUEUE_CAPACITY: usize = 256;

/// How long a closing session's queued messages get before the worker is aborted
const DELIVERY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver of decoded inbound messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// `topic` has the configured prefix stripped already
    async fn on_message(&self, topic: &str, payload: Value, raw: Bytes) -> Result<(), HandlerError>;
}

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    Stopped,
    Connecting,
    Listening,
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub running: bool,
    pub state: SubscriberState,
    pub message_count: u64,
    pub error_count: u64,
    pub topics: Vec<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Why a connect cycle ended without an error
#[derive(Debug, PartialEq)]
enum SessionEnd {
    ReconnectRequested,
    Shutdown,
}

/// Feeds one session's messages to the sink in arrival order.
///
/// Runs beside the polling loop so a slow handler never stalls keepalive
/// pings or acknowledgements on the session.
struct DeliveryWorker {
    queue: Option<mpsc::Sender<(String, Bytes)>>,
    task: JoinHandle<()>,
}

impl DeliveryWorker {
    fn spawn(shared: Arc<SubscriberShared>, sink: Arc<dyn MessageSink>) -> Self {
        let (queue, mut inbox) = mpsc::channel::<(String, Bytes)>(DELIVERY_QUEUE_CAPACITY);
        let task = tokio::spawn(
            async move {
                while let Some((topic, payload)) = inbox.recv().await {
                    shared.handle_message(&topic, payload, sink.as_ref()).await;
                }
            }
            .in_current_span(),
        );
        Self {
            queue: Some(queue),
            task,
        }
    }

    /// Queue a message, waiting while the queue is full
    async fn deliver(&self, topic: String, payload: Bytes) {
        let Some(queue) = &self.queue else {
            return;
        };
        if queue.send((topic, payload)).await.is_err() {
            warn!("MQTT delivery worker gone, dropping message");
        }
    }

    /// Stop accepting messages. With `drain`, already queued messages get
    /// [`DELIVERY_DRAIN_TIMEOUT`] to reach the sink.
    async fn close(&mut self, drain: bool) {
        self.queue.take();
        if drain
            && tokio::time::timeout(DELIVERY_DRAIN_TIMEOUT, &mut self.task)
                .await
                .is_ok()
        {
            return;
        }
        self.task.abort();
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// State shared between the handle, the listener and the refresh timer
struct SubscriberShared {
    config: MqttConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    qos: QoS,
    topics: RwLock<Vec<String>>,
    running: AtomicBool,
    reconnect_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SubscriberState>,
    message_count: AtomicU64,
    error_count: AtomicU64,
    last_message_at: RwLock<Option<DateTime<Utc>>>,
    refresh_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SubscriberShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SubscriberState) {
        self.state_tx.send_replace(state);
    }

    fn request_reconnect(&self, reason: &str) {
        debug!(reason, "MQTT subscriber reconnect requested");
        self.reconnect_tx.send_replace(true);
    }

    fn topics(&self) -> Vec<String> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscription_plan(&self) -> Vec<String> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        MessageHandler::subscription_filters(&self.config.topic_prefix, topics.iter())
    }

    fn cancel_refresh(&self) {
        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Decode, strip the prefix and hand over to the sink. Never fails.
    async fn handle_message(&self, topic: &str, raw: Bytes, sink: &dyn MessageSink) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self
            .last_message_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

        let payload = match MessageHandler::decode_payload(&raw) {
            Ok(payload) => payload,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %topic, error = %e, "Dropping malformed MQTT message");
                return;
            }
        };

        let logical_topic = strip_topic_prefix(&self.config.topic_prefix, topic);
        trace!(topic = %logical_topic, "MQTT message received");

        if let Err(e) = sink.on_message(logical_topic, payload, raw).await {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            error!(topic = %logical_topic, error = %e, "Message callback failed");
        }
    }
}

struct ListenerHandle {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Inbound MQTT subscriber
pub struct MqttSubscriber {
    shared: Arc<SubscriberShared>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl MqttSubscriber {
    pub fn new(config: MqttConfig) -> Self {
        let (reconnect_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(SubscriberState::Stopped);

        Self {
            shared: Arc::new(SubscriberShared {
                config,
                token_provider: None,
                qos: QoS::default(),
                topics: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                reconnect_tx,
                state_tx,
                message_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                last_message_at: RwLock::new(None),
                refresh_task: StdMutex::new(None),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Builder-time only; has no effect once the subscriber has been shared
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.token_provider = Some(provider);
        }
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.qos = qos;
        }
        self
    }

    /// Spawn the listener. Warns and does nothing when already running.
    pub async fn start(&self, topics: Vec<String>, sink: Arc<dyn MessageSink>) {
        let mut listener = self.listener.lock().await;
        if self.shared.is_running() {
            warn!("MQTT subscriber already running");
            return;
        }
        if let Some(finished) = listener.take() {
            finished.task.abort();
        }

        *self
            .shared
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner) = topics;
        self.shared.reconnect_tx.send_replace(false);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(SubscriberState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = crate::mqtt_span!(
            role = "subscriber",
            client_id = %self.shared.config.client_id
        );
        let task = tokio::spawn(Self::listen(self.shared.clone(), sink, shutdown_rx).instrument(span));
        *listener = Some(ListenerHandle { task, shutdown_tx });

        info!(
            host = %self.shared.config.host,
            port = self.shared.config.port,
            topics = ?self.shared.topics(),
            "MQTT subscriber started"
        );
    }

    /// Cancel the listener and the refresh timer and wait for both; idempotent
    pub async fn stop(&self) {
        let handle = self.listener.lock().await.take();
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cancel_refresh();

        let Some(mut handle) = handle else {
            debug!("MQTT subscriber not running, nothing to stop");
            return;
        };

        let _ = handle.shutdown_tx.send(true);
        match tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, &mut handle.task).await {
            Ok(Ok(())) => debug!("Subscriber listener shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Subscriber listener ended with error: {}", e),
            Err(_) => {
                warn!("Subscriber listener didn't shut down gracefully, forcing abort");
                handle.task.abort();
            }
            _ => {}
        }

        self.shared.set_state(SubscriberState::Stopped);
        info!("MQTT subscriber stopped");
    }

    /// Watch more topics; a running session re-subscribes on its next cycle
    pub fn add_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        {
            let mut current = self
                .shared
                .topics
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for topic in topics {
                let topic = topic.into();
                if !current.contains(&topic) {
                    current.push(topic);
                    changed = true;
                }
            }
        }

        if changed && self.is_running() {
            self.shared.request_reconnect("topics added");
        }
    }

    pub fn remove_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<S> = topics.into_iter().collect();
        let changed = {
            let mut current = self
                .shared
                .topics
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let before = current.len();
            current.retain(|topic| !removed.iter().any(|r| r.as_ref() == topic));
            current.len() != before
        };

        if changed && self.is_running() {
            self.shared.request_reconnect("topics removed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn state(&self) -> SubscriberState {
        *self.shared.state_tx.borrow()
    }

    pub fn reconnect_requested(&self) -> bool {
        *self.shared.reconnect_tx.borrow()
    }

    /// Snapshot of the logical topic set
    pub fn topics(&self) -> Vec<String> {
        self.shared.topics()
    }

    /// Prefixed, deduplicated filters the next connect cycle subscribes to
    pub fn subscription_plan(&self) -> Vec<String> {
        self.shared.subscription_plan()
    }

    pub fn qos(&self) -> QoS {
        self.shared.qos
    }

    pub fn message_count(&self) -> u64 {
        self.shared.message_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.shared.error_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            running: self.is_running(),
            state: self.state(),
            message_count: self.message_count(),
            error_count: self.error_count(),
            topics: self.topics(),
            last_message_at: *self
                .shared
                .last_message_at
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Listener loop: connect cycles until stopped or out of attempts
    async fn listen(
        shared: Arc<SubscriberShared>,
        sink: Arc<dyn MessageSink>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let policy = ReconnectPolicy::from_config(&shared.config);
        let mut reconnect_attempts = 0u32;

        while shared.is_running() {
            let outcome = Self::connect_and_listen(
                &shared,
                &sink,
                &mut shutdown_rx,
                &mut reconnect_attempts,
            )
            .await;

            match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ReconnectRequested) => {
                    shared.set_state(SubscriberState::Connecting);
                }
                Err(e) => {
                    warn!(error = %e, "MQTT subscriber connection failed");

                    let shutdown_requested = *shutdown_rx.borrow();
                    match policy.decide(reconnect_attempts, shutdown_requested) {
                        ReconnectionDecision::Proceed { attempt, delay } => {
                            reconnect_attempts = attempt;
                            shared.set_state(SubscriberState::Reconnecting { attempt });
                            info!(
                                "Subscriber reconnection attempt {}/{} in {:?}",
                                attempt,
                                policy.max_display(),
                                delay
                            );
                            if !Self::interruptible_sleep(&mut shutdown_rx, delay).await {
                                break;
                            }
                        }
                        ReconnectionDecision::AbortShutdownRequested => break,
                        ReconnectionDecision::AbortMaxAttemptsExceeded => {
                            error!(
                                "Max reconnection attempts ({}) exceeded, MQTT subscriber giving up",
                                policy.max_attempts
                            );
                            break;
                        }
                    }
                }
            }
        }

        shared.running.store(false, Ordering::SeqCst);
        shared.cancel_refresh();
        shared.set_state(SubscriberState::Stopped);
        info!("MQTT subscriber listener stopped");
    }

    /// One connect cycle: authenticate, subscribe, then deliver until the
    /// reconnect flag is raised, shutdown is requested or the session fails
    async fn connect_and_listen(
        shared: &Arc<SubscriberShared>,
        sink: &Arc<dyn MessageSink>,
        shutdown_rx: &mut watch::Receiver<bool>,
        reconnect_attempts: &mut u32,
    ) -> Result<SessionEnd, MqttError> {
        let credentials =
            resolve_credentials(&shared.config, shared.token_provider.as_deref()).await?;
        if let Some(expires_at) = credentials.as_ref().and_then(|c| c.expires_at) {
            let delay = token_refresh_delay(expires_at, Utc::now());
            info!(delay_secs = delay.as_secs(), "Scheduled MQTT token refresh");
            Self::schedule_reconnect(shared, delay);
        }

        let client_id = format!("{}{}", shared.config.client_id, SUBSCRIBER_CLIENT_SUFFIX);
        let options = configure_mqtt_options(&shared.config, &client_id, credentials.as_ref())?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let acknowledged = tokio::time::timeout(
            shared.config.connect_timeout_duration(),
            Self::wait_for_connack(&mut event_loop, shutdown_rx),
        )
        .await
        .map_err(|_| MqttError::Timeout("no ConnAck from broker".to_string()))??;
        if !acknowledged {
            return Ok(SessionEnd::Shutdown);
        }

        // Clear before reading the plan so a concurrent topic change re-raises it
        shared.reconnect_tx.send_replace(false);
        *reconnect_attempts = 0;
        shared.set_state(SubscriberState::Listening);

        let filters = shared.subscription_plan();
        if !filters.is_empty() {
            let qos = shared.qos.into();
            client
                .subscribe_many(filters.iter().map(|path| Filter::new(path.clone(), qos)))
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        }
        info!(client_id = %client_id, filters = ?filters, "MQTT subscriber listening");

        let mut worker = DeliveryWorker::spawn(Arc::clone(shared), Arc::clone(sink));
        let mut reconnect_rx = shared.reconnect_tx.subscribe();
        let end = loop {
            tokio::select! {
                biased;
                _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => {
                    Self::close_session(&client, &mut event_loop).await;
                    break Ok(SessionEnd::Shutdown);
                }
                _ = async { reconnect_rx.wait_for(|requested| *requested).await.is_ok() } => {
                    info!("Reconnect requested, cycling MQTT subscriber session");
                    Self::close_session(&client, &mut event_loop).await;
                    break Ok(SessionEnd::ReconnectRequested);
                }
                polled = event_loop.poll() => {
                    let event = match polled {
                        Ok(event) => event,
                        Err(e) => break Err(MqttError::ConnectionFailed(Box::new(e))),
                    };
                    match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::MessageReceived { topic, payload, .. } => {
                            // A full queue holds polling back until the worker catches up
                            tokio::select! {
                                biased;
                                _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => {
                                    Self::close_session(&client, &mut event_loop).await;
                                    break Ok(SessionEnd::Shutdown);
                                }
                                _ = worker.deliver(topic, payload) => {}
                            }
                        }
                        EventRoute::Disconnected => {
                            break Err(MqttError::ConnectionFailedStr(
                                "Broker closed the connection".to_string(),
                            ));
                        }
                        EventRoute::SubscriptionConfirmed { packet_id, reason_codes } => {
                            debug!(packet_id, reason_codes = %reason_codes, "Subscription confirmed");
                        }
                        EventRoute::ConnectionAcknowledged => {
                            debug!("Unexpected second ConnAck on subscriber session");
                        }
                        EventRoute::InfrastructureEvent(description) => {
                            trace!("MQTT infrastructure event: {}", description);
                        }
                        EventRoute::OutgoingEvent => {}
                    }
                }
            }
        };

        worker.close(!matches!(end, Ok(SessionEnd::Shutdown))).await;
        end
    }

    /// Poll until ConnAck. Returns false when shutdown arrives first.
    async fn wait_for_connack(
        event_loop: &mut EventLoop,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<bool, MqttError> {
        loop {
            let polled = tokio::select! {
                biased;
                _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => return Ok(false),
                polled = event_loop.poll() => polled,
            };

            let event = polled.map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(true),
                EventRoute::Disconnected => {
                    return Err(MqttError::ConnectionFailedStr(
                        "Broker refused the connection".to_string(),
                    ))
                }
                _ => {}
            }
        }
    }

    /// Timer that only raises the reconnect flag; it performs no I/O
    fn schedule_reconnect(shared: &Arc<SubscriberShared>, delay: Duration) {
        let weak = Arc::downgrade(shared);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                if shared.is_running() {
                    info!("MQTT token refresh due, requesting reconnect");
                    shared.request_reconnect("token refresh");
                }
            }
        });

        let previous = shared
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn close_session(client: &AsyncClient, event_loop: &mut EventLoop) {
        let graceful = async {
            if client.disconnect().await.is_ok() {
                while event_loop.poll().await.is_ok() {}
            }
        };
        let _ = tokio::time::timeout(DISCONNECT_GRACE, graceful).await;
    }

    /// Returns false once shutdown was requested during the delay
    async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => {
                info!("Shutdown signal received during reconnection delay, stopping");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Drop for MqttSubscriber {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            let _ = handle.shutdown_tx.send(true);
            handle.task.abort();
        }
        self.shared.cancel_refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct CollectingSink {
        received: StdMutex<Vec<(String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn on_message(&self, topic: &str, payload: Value, _raw: Bytes) -> Result<(), HandlerError> {
            if self.fail {
                return Err("sink rejected message".into());
            }
            self.received
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    /// Holds every message far longer than any test runs
    struct StallingSink;

    #[async_trait]
    impl MessageSink for StallingSink {
        async fn on_message(&self, _topic: &str, _payload: Value, _raw: Bytes) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn unreachable_config() -> MqttConfig {
        let mut config = MqttConfig::new("127.0.0.1", 1);
        config.client_id = "eventbus-test".to_string();
        config.topic_prefix = "site".to_string();
        config.reconnect_interval = 60.0;
        config.connect_timeout = 1;
        config
    }

    #[test]
    fn test_initial_state() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        assert!(!subscriber.is_running());
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
        assert!(!subscriber.reconnect_requested());
        assert_eq!(subscriber.qos(), QoS::AtLeastOnce);
        assert_eq!(subscriber.stats().message_count, 0);
    }

    #[test]
    fn test_topic_changes_while_stopped_do_not_request_reconnect() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        subscriber.add_topics(["meters/+", "alerts/#"]);
        subscriber.add_topics(["meters/+"]);
        assert_eq!(subscriber.topics(), vec!["meters/+", "alerts/#"]);
        assert!(!subscriber.reconnect_requested());

        subscriber.remove_topics(["alerts/#"]);
        assert_eq!(subscriber.topics(), vec!["meters/+"]);
        assert!(!subscriber.reconnect_requested());
    }

    #[test]
    fn test_subscription_plan_is_prefixed() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        subscriber.add_topics(["b/#", "a/+", "/a/+"]);
        assert_eq!(subscriber.subscription_plan(), vec!["site/a/+", "site/b/#"]);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_cleans_up() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        let sink: Arc<dyn MessageSink> = Arc::new(CollectingSink::default());

        subscriber.start(vec!["a/#".to_string()], sink.clone()).await;
        assert!(subscriber.is_running());

        // Second start keeps the original topic set
        subscriber.start(vec!["other".to_string()], sink).await;
        assert_eq!(subscriber.topics(), vec!["a/#"]);

        subscriber.stop().await;
        assert!(!subscriber.is_running());
        assert_eq!(subscriber.state(), SubscriberState::Stopped);

        subscriber.stop().await;
        assert!(!subscriber.is_running());
    }

    #[tokio::test]
    async fn test_topic_changes_while_running_request_reconnect() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        subscriber
            .start(vec!["a/#".to_string()], Arc::new(CollectingSink::default()))
            .await;

        subscriber.add_topics(["a/#"]);
        assert!(!subscriber.reconnect_requested());

        subscriber.add_topics(["b/+"]);
        assert!(subscriber.reconnect_requested());
        assert_eq!(subscriber.topics(), vec!["a/#", "b/+"]);

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_failed_connection_moves_to_reconnecting() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        subscriber
            .start(Vec::new(), Arc::new(CollectingSink::default()))
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            subscriber.state(),
            SubscriberState::Reconnecting { attempt: 1 }
        ));
        assert!(subscriber.is_running());

        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
    }

    #[tokio::test]
    async fn test_listener_exits_after_max_attempts() {
        let mut config = unreachable_config();
        config.reconnect_interval = 0.01;
        config.max_reconnect_attempts = 2;
        let subscriber = MqttSubscriber::new(config);
        subscriber
            .start(Vec::new(), Arc::new(CollectingSink::default()))
            .await;

        for _ in 0..50 {
            if !subscriber.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!subscriber.is_running());
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
    }

    #[tokio::test]
    async fn test_refresh_timer_sets_reconnect_flag() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        subscriber.shared.running.store(true, Ordering::SeqCst);

        MqttSubscriber::schedule_reconnect(&subscriber.shared, Duration::from_millis(10));
        assert!(!subscriber.reconnect_requested());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(subscriber.reconnect_requested());
    }

    #[tokio::test]
    async fn test_refresh_timer_cancelled_on_stop() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        subscriber.shared.running.store(true, Ordering::SeqCst);

        MqttSubscriber::schedule_reconnect(&subscriber.shared, Duration::from_millis(50));
        subscriber.stop().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!subscriber.reconnect_requested());
    }

    #[tokio::test]
    async fn test_handle_message_strips_prefix_and_counts() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        let sink = CollectingSink::default();

        subscriber
            .shared
            .handle_message("site/meters/1", Bytes::from(r#"{"kwh":2}"#), &sink)
            .await;

        let received = sink.received.lock().unwrap().clone();
        assert_eq!(received, vec![("meters/1".to_string(), json!({"kwh": 2}))]);
        assert_eq!(subscriber.message_count(), 1);
        assert_eq!(subscriber.error_count(), 0);
        assert!(subscriber.stats().last_message_at.is_some());
    }

    #[tokio::test]
    async fn test_handle_message_drops_malformed_payload() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        let sink = CollectingSink::default();

        subscriber
            .shared
            .handle_message("site/x", Bytes::from_static(b"{not json"), &sink)
            .await;

        assert!(sink.received.lock().unwrap().is_empty());
        assert_eq!(subscriber.error_count(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_counted_not_raised() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        let sink = CollectingSink {
            fail: true,
            ..Default::default()
        };

        subscriber
            .shared
            .handle_message("site/x", Bytes::from_static(b"{}"), &sink)
            .await;
        assert_eq!(subscriber.message_count(), 1);
        assert_eq!(subscriber.error_count(), 1);
    }

    #[tokio::test]
    async fn test_delivery_worker_keeps_arrival_order_and_drains_on_close() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        let sink = Arc::new(CollectingSink::default());
        let mut worker = DeliveryWorker::spawn(Arc::clone(&subscriber.shared), sink.clone());

        for n in 0..5 {
            worker
                .deliver(format!("site/m/{n}"), Bytes::from(format!(r#"{{"n":{n}}}"#)))
                .await;
        }
        worker.close(true).await;

        let topics: Vec<String> = sink
            .received
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect();
        assert_eq!(topics, vec!["m/0", "m/1", "m/2", "m/3", "m/4"]);
        assert_eq!(subscriber.message_count(), 5);
    }

    #[tokio::test]
    async fn test_delivery_worker_aborts_stuck_sink_on_shutdown_close() {
        let subscriber = MqttSubscriber::new(unreachable_config());
        let mut worker = DeliveryWorker::spawn(Arc::clone(&subscriber.shared), Arc::new(StallingSink));

        worker.deliver("site/x".to_string(), Bytes::from_static(b"{}")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        worker.close(false).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let joined = tokio::time::timeout(Duration::from_secs(1), &mut worker.task)
            .await
            .expect("aborted worker finishes promptly");
        assert!(joined.unwrap_err().is_cancelled());

        // Messages after close are dropped quietly
        worker.deliver("site/y".to_string(), Bytes::from_static(b"{}")).await;
        assert_eq!(subscriber.message_count(), 1);
    }
}
