//! Publish-side MQTT broker
//!
//! [`MqttBroker`] owns one MQTT session for outbound traffic. A spawned
//! driver task polls the `rumqttc` event loop, reports connection state over
//! a watch channel, and rebuilds the session per [`ReconnectPolicy`] after
//! the first ConnAck. `connect` only returns once the broker has
//! acknowledged the session.

use super::connection::{
    configure_mqtt_options, resolve_credentials, ConnectionState, MqttError,
};
use super::message_handler::{EventRoute, MessageHandler};
use super::reconnect::{
    determine_next_state, ConnectionEvent, ReconnectPolicy, ReconnectionDecision,
};
use crate::config::MqttConfig;
use crate::error::TransportError;
use crate::protocol::topics::full_topic;
use crate::protocol::{BrokerMessage, PublishResult, QoS};
use crate::transport::{Broker, TokenProvider};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::v5::{AsyncClient, EventLoop};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// Capacity of the `rumqttc` request channel
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long a closing session gets to flush its DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// How long `disconnect` waits for the driver task before aborting it
const DRIVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const NOT_CONNECTED: &str = "Not connected to MQTT broker";

/// Counters exposed by [`MqttBroker::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub connected: bool,
    pub publish_count: u64,
    pub error_count: u64,
}

/// One live session: the shared client slot plus its driver task
struct PublisherSession {
    client: Arc<Mutex<AsyncClient>>,
    driver: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl PublisherSession {
    /// Signal the driver, let it send DISCONNECT, then wait for it
    async fn close(self) {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(DRIVER_SHUTDOWN_TIMEOUT, self.driver).await {
            Ok(Ok(())) => debug!("Publisher driver shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Publisher driver ended with error: {}", e),
            Err(_) => warn!("Publisher driver didn't shut down gracefully, aborted"),
            _ => {}
        }
    }
}

/// Everything the driver task needs to rebuild a session on its own
struct DriverContext {
    config: MqttConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    client: Arc<Mutex<AsyncClient>>,
    connected: Arc<AtomicBool>,
    state_tx: watch::Sender<ConnectionState>,
    policy: ReconnectPolicy,
}

impl DriverContext {
    fn set_state(&self, state: ConnectionState) {
        self.connected
            .store(matches!(state, ConnectionState::Connected), Ordering::SeqCst);
        self.state_tx.send_replace(state);
    }

    /// Fresh credentials and a fresh event loop; the shared client is swapped in place
    async fn rebuild_connection(&self) -> Result<EventLoop, MqttError> {
        let credentials =
            resolve_credentials(&self.config, self.token_provider.as_deref()).await?;
        let options =
            configure_mqtt_options(&self.config, &self.config.client_id, credentials.as_ref())?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        *self.client.lock().await = client;
        Ok(event_loop)
    }

    /// Best-effort DISCONNECT, bounded by [`DISCONNECT_GRACE`]
    async fn close_session(&self, event_loop: &mut EventLoop) {
        let client = self.client.lock().await.clone();
        let graceful = async {
            if let Err(e) = client.disconnect().await {
                debug!("Could not queue DISCONNECT: {}", e);
                return;
            }
            while event_loop.poll().await.is_ok() {}
        };
        let _ = tokio::time::timeout(DISCONNECT_GRACE, graceful).await;
    }
}

/// Outbound MQTT broker
pub struct MqttBroker {
    config: MqttConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    /// Also serves as the connect lock
    session: Mutex<Option<PublisherSession>>,
    connected: Arc<AtomicBool>,
    publish_count: AtomicU64,
    error_count: AtomicU64,
}

impl MqttBroker {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            token_provider: None,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            publish_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Authenticate with bearer tokens instead of static credentials
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Open the session and wait for the broker's ConnAck.
    ///
    /// A second call while connected is a no-op. On failure the driver is
    /// stopped and the broker stays disconnected.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let mut session = self.session.lock().await;
        if session.is_some() && self.is_connected() {
            debug!("MQTT publisher already connected");
            return Ok(());
        }
        if let Some(stale) = session.take() {
            debug!("Discarding stale publisher session");
            stale.close().await;
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "Connecting to MQTT broker"
        );

        let credentials =
            resolve_credentials(&self.config, self.token_provider.as_deref()).await?;
        let options =
            configure_mqtt_options(&self.config, &self.config.client_id, credentials.as_ref())?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let client = Arc::new(Mutex::new(client));

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let context = DriverContext {
            config: self.config.clone(),
            token_provider: self.token_provider.clone(),
            client: client.clone(),
            connected: self.connected.clone(),
            state_tx,
            policy: ReconnectPolicy::from_config(&self.config),
        };
        let span = crate::mqtt_span!(role = "publisher", client_id = %self.config.client_id);
        let driver = tokio::spawn(
            Self::drive_event_loop(context, event_loop, shutdown_rx).instrument(span),
        );

        let new_session = PublisherSession {
            client,
            driver,
            shutdown_tx,
            state_rx: state_rx.clone(),
        };

        match Self::wait_for_connection_confirmation(
            state_rx,
            self.config.connect_timeout_duration(),
        )
        .await
        {
            Ok(()) => {
                *session = Some(new_session);
                info!(host = %self.config.host, port = self.config.port, "Connected to MQTT broker");
                Ok(())
            }
            Err(e) => {
                new_session.driver.abort();
                self.connected.store(false, Ordering::SeqCst);
                error!(host = %self.config.host, port = self.config.port, error = %e, "Failed to connect to MQTT broker");
                Err(e)
            }
        }
    }

    /// Close the session; safe to call repeatedly or before `connect`
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            debug!("MQTT publisher not connected, nothing to disconnect");
            return Ok(());
        };

        session.close().await;
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from MQTT broker");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Latest driver-reported state, `None` before the first `connect`
    pub async fn connection_state(&self) -> Option<ConnectionState> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.state_rx.borrow().clone())
    }

    /// Publish one message. Failures are reported in the result, never raised.
    pub async fn publish(&self, message: BrokerMessage) -> PublishResult {
        if !self.is_connected() {
            warn!(topic = %message.topic, "Publish attempted while disconnected");
            return PublishResult::failed(NOT_CONNECTED);
        }

        let payload = match MessageHandler::encode_payload(&message, Utc::now()) {
            Ok(payload) => payload,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                error!(topic = %message.topic, error = %e, "Failed to serialize payload");
                return PublishResult::failed(format!("Failed to serialize payload: {e}"));
            }
        };

        let Some(client) = self.current_client().await else {
            return PublishResult::failed(NOT_CONNECTED);
        };

        let topic = full_topic(&self.config.topic_prefix, &message.topic);
        let properties = MessageHandler::publish_properties(&message);
        let request = client.publish_with_properties(
            topic.clone(),
            message.qos.into(),
            message.retain,
            payload,
            properties,
        );

        match tokio::time::timeout(self.config.publish_timeout_duration(), request).await {
            Ok(Ok(())) => {
                self.publish_count.fetch_add(1, Ordering::Relaxed);
                let message_id = Uuid::new_v4().to_string();
                debug!(topic = %topic, message_id = %message_id, qos = ?message.qos, "Published message");
                PublishResult::ok(message_id)
            }
            Ok(Err(e)) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                error!(topic = %topic, error = %e, "Failed to publish message");
                PublishResult::failed(format!("Publish failed: {e}"))
            }
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                error!(topic = %topic, "Publish timed out");
                PublishResult::failed(format!(
                    "Publish timed out after {}s",
                    self.config.publish_timeout
                ))
            }
        }
    }

    /// Serialize `value` to a JSON object and publish it
    pub async fn publish_serialized<T: Serialize + ?Sized>(
        &self,
        topic: impl Into<String>,
        value: &T,
        qos: QoS,
        retain: bool,
    ) -> PublishResult {
        let topic = topic.into();
        match BrokerMessage::from_serializable(topic.clone(), value) {
            Ok(message) => self.publish(message.with_qos(qos).with_retain(retain)).await,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                error!(topic = %topic, error = %e, "Failed to serialize payload");
                PublishResult::failed(format!("Failed to serialize payload: {e}"))
            }
        }
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connected: self.is_connected(),
            publish_count: self.publish_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    async fn current_client(&self) -> Option<AsyncClient> {
        let client = self.session.lock().await.as_ref()?.client.clone();
        let client = client.lock().await.clone();
        Some(client)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let settled = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|state| !matches!(state, ConnectionState::Connecting))
                .await
                .map(|state| state.clone())
        })
        .await;

        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(ConnectionState::Disconnected(reason))) => {
                Err(MqttError::ConnectionFailedStr(reason))
            }
            Ok(Ok(ConnectionState::PermanentlyDisconnected(reason))) => Err(
                MqttError::ConnectionFailedStr(format!("Permanently disconnected: {reason}")),
            ),
            Ok(Ok(state)) => Err(MqttError::NotConnected { state }),
            Ok(Err(_)) => Err(MqttError::ConnectionFailedStr(
                "State channel closed".to_string(),
            )),
            Err(_) => Err(MqttError::Timeout(format!(
                "no ConnAck within {}s",
                timeout.as_secs_f64()
            ))),
        }
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

    /// Poll the event loop until shutdown or a permanent failure.
    ///
    /// Errors before the first ConnAck end the driver so `connect` can fail
    /// fast; after that the reconnect policy decides.
    async fn drive_event_loop(
        context: DriverContext,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut established = false;
        let mut reconnect_attempts = 0u32;

        loop {
            let polled = tokio::select! {
                biased;
                _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => {
                    info!("Shutdown signal received, closing publisher session");
                    context.close_session(&mut event_loop).await;
                    break;
                }
                polled = event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        established = true;
                        reconnect_attempts = 0;
                        context.set_state(determine_next_state(ConnectionEvent::ConnAckReceived));
                    }
                    EventRoute::Disconnected => {
                        context
                            .set_state(determine_next_state(ConnectionEvent::DisconnectedByBroker));
                    }
                    EventRoute::MessageReceived { topic, .. } => {
                        debug!(topic = %topic, "Ignoring inbound message on publisher session");
                    }
                    EventRoute::SubscriptionConfirmed { packet_id, .. } => {
                        trace!(packet_id, "Unexpected SubAck on publisher session");
                    }
                    EventRoute::InfrastructureEvent(description) => {
                        trace!("MQTT infrastructure event: {}", description);
                    }
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    context.set_state(determine_next_state(ConnectionEvent::NetworkError(
                        e.to_string(),
                    )));

                    if !established {
                        break;
                    }

                    let shutdown_requested = *shutdown_rx.borrow();
                    match context.policy.decide(reconnect_attempts, shutdown_requested) {
                        ReconnectionDecision::Proceed { attempt, delay } => {
                            reconnect_attempts = attempt;
                            context.set_state(determine_next_state(
                                ConnectionEvent::ReconnectionStarted(attempt),
                            ));
                            info!(
                                "Attempting publisher reconnection {}/{} after {:?}",
                                attempt,
                                context.policy.max_display(),
                                delay
                            );

                            if !Self::interruptible_sleep(&mut shutdown_rx, delay).await {
                                break;
                            }

                            match context.rebuild_connection().await {
                                Ok(new_loop) => event_loop = new_loop,
                                Err(e) => {
                                    error!("Failed to rebuild publisher connection: {}", e)
                                }
                            }
                        }
                        ReconnectionDecision::AbortShutdownRequested => break,
                        ReconnectionDecision::AbortMaxAttemptsExceeded => {
                            let reason = format!(
                                "Max reconnection attempts ({}) exceeded",
                                context.policy.max_attempts
                            );
                            context.set_state(determine_next_state(
                                ConnectionEvent::PermanentFailure(reason),
                            ));
                            break;
                        }
                    }
                }
            }
        }

        context.connected.store(false, Ordering::SeqCst);
        info!("MQTT publisher event loop stopped");
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        MqttBroker::connect(self).await.map_err(TransportError::from)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        MqttBroker::disconnect(self).await.map_err(TransportError::from)
    }

    async fn publish(&self, message: BrokerMessage) -> PublishResult {
        MqttBroker::publish(self, message).await
    }

    fn is_connected(&self) -> bool {
        MqttBroker::is_connected(self)
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        // Async cleanup is impossible here; callers should `disconnect` first
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.shutdown_tx.send(true);
            session.driver.abort();
        }
    }
}
