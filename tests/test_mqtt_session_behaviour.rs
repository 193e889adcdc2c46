//! Publisher and subscriber sessions against an in-process scripted broker
//!
//! These run without any external service; the broker in
//! `mqtt_integration_helpers` logs every packet it sees.


use async_trait::async_trait;
use bytes::Bytes;
use mqtt_eventbus::config::MqttConfig;
use mqtt_eventbus::error::HandlerError;
use mqtt_eventbus::protocol::{BrokerMessage, UNKNOWN_EVENT_TYPE};
use mqtt_eventbus::subscription::{EventSubscriptions, SubscriptionService};
use mqtt_eventbus::testing::RecordingHandler;
use mqtt_eventbus::transport::mqtt::subscriber::SUBSCRIBER_CLIENT_SUFFIX;
use mqtt_eventbus::transport::mqtt::{MessageSink, MqttBroker, MqttSubscriber, SubscriberState};
use mqtt_integration_helpers::{wait_until, BrokerLog, ScriptedBroker};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn scripted_config(broker: &ScriptedBroker, prefix: &str) -> MqttConfig {
    let mut config = MqttConfig::new("127.0.0.1", broker.port());
    config.client_id = format!("eventbus-{}", &Uuid::new_v4().simple().to_string()[..8]);
    config.topic_prefix = prefix.to_string();
    config.keepalive = 5;
    config.reconnect_interval = 0.2;
    config.connect_timeout = 2;
    config
}

/// Records topics in arrival order. The first message is held for `hold`
/// and the broker's ping count is sampled around it.
struct HoldingSink {
    log: Arc<BrokerLog>,
    hold: Duration,
    topics: Mutex<Vec<String>>,
    pings_during_hold: Mutex<Option<usize>>,
    holding: AtomicBool,
}

impl HoldingSink {
    fn new(log: Arc<BrokerLog>, hold: Duration) -> Self {
        Self {
            log,
            hold,
            topics: Mutex::new(Vec::new()),
            pings_during_hold: Mutex::new(None),
            holding: AtomicBool::new(false),
        }
    }

    fn topics(&self) -> Vec<String> {
        self.topics.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for HoldingSink {
    async fn on_message(&self, topic: &str, _payload: Value, _raw: Bytes) -> Result<(), HandlerError> {
        let first = self.topics.lock().unwrap().is_empty();
        if first {
            self.holding.store(true, Ordering::SeqCst);
            let before = self.log.ping_count();
            tokio::time::sleep(self.hold).await;
            *self.pings_during_hold.lock().unwrap() = Some(self.log.ping_count() - before);
            self.holding.store(false, Ordering::SeqCst);
        }
        self.topics.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

async fn listening_subscriber(
    broker: &ScriptedBroker,
    topics: &[&str],
    sink: Arc<dyn MessageSink>,
) -> MqttSubscriber {
    let log = broker.log();
    let subscriber = MqttSubscriber::new(scripted_config(broker, "p"));
    subscriber
        .start(topics.iter().map(|t| t.to_string()).collect(), sink)
        .await;
    assert!(
        wait_until(WAIT, || log.subscribe_requests().len() == 1).await,
        "subscriber never subscribed"
    );
    subscriber
}

#[tokio::test]
async fn test_second_connect_reuses_the_session() {
    let broker = ScriptedBroker::start().await;
    let log = broker.log();
    let publisher = MqttBroker::new(scripted_config(&broker, "p"));

    publisher.connect().await.expect("first connect");
    publisher.connect().await.expect("second connect is a no-op");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(log.client_ids(), vec![publisher.config().client_id.clone()]);

    publisher.disconnect().await.unwrap();
    assert!(!publisher.is_connected());
}

#[tokio::test]
async fn test_prefixed_round_trip_reaches_handler() {
    // Arrange
    let broker = ScriptedBroker::start().await;
    let log = broker.log();
    let service = SubscriptionService::builder()
        .mqtt(scripted_config(&broker, "p"))
        .build();
    let handler = Arc::new(RecordingHandler::new());
    service.subscribe(vec!["x".to_string()], handler.clone()).unwrap();
    service.start().await;
    assert!(wait_until(WAIT, || log.subscribe_requests().len() == 1).await);
    assert_eq!(log.subscribe_requests()[0], vec!["p/x"]);

    let publisher = MqttBroker::new(scripted_config(&broker, "p"));
    publisher.connect().await.unwrap();

    // Act
    let mut payload = Map::new();
    payload.insert("a".to_string(), json!(1));
    let result = publisher.publish(BrokerMessage::new("x", payload)).await;
    assert!(result.success, "publish failed: {:?}", result.error);

    // Assert
    assert!(wait_until(WAIT, || handler.count() == 1).await, "event not delivered");
    let published = log.published();
    assert_eq!(published[0].topic, "p/x");
    assert_eq!(published[0].qos, 1);

    let (event, context) = handler.events().remove(0);
    assert_eq!(context.topic, "x");
    let raw: Value = serde_json::from_slice(context.raw_payload.as_ref().unwrap()).unwrap();
    assert_eq!(raw["a"], 1);
    assert!(raw["_timestamp"].is_string());
    assert_eq!(event.event_type, UNKNOWN_EVENT_TYPE);
    assert_eq!(event.payload["data"]["a"], 1);

    publisher.disconnect().await.unwrap();
    service.stop().await;
}

#[tokio::test]
async fn test_topic_added_while_running_resubscribes_with_superset() {
    let broker = ScriptedBroker::start().await;
    let log = broker.log();
    let sink = Arc::new(HoldingSink::new(broker.log(), Duration::ZERO));
    let subscriber = listening_subscriber(&broker, &["a/#"], sink.clone()).await;

    subscriber.add_topics(["b/+"]);

    assert!(
        wait_until(WAIT, || log.subscribe_requests().len() == 2).await,
        "no re-subscribe after topic change"
    );
    let mut filters = log.subscribe_requests()[1].clone();
    filters.sort();
    assert_eq!(filters, vec!["p/a/#", "p/b/+"]);

    let client_ids = log.client_ids();
    assert_eq!(client_ids.len(), 2);
    assert!(client_ids.iter().all(|id| id.ends_with(SUBSCRIBER_CLIENT_SUFFIX)));

    assert!(
        wait_until(WAIT, || subscriber.state() == SubscriberState::Listening
            && !subscriber.reconnect_requested())
        .await
    );
    assert_eq!(log.route("p/b/1", br#"{"n":1}"#), 1);
    assert!(wait_until(WAIT, || sink.topics() == vec!["b/1"]).await);

    subscriber.stop().await;
}

#[tokio::test]
async fn test_slow_handler_does_not_starve_keepalive() {
    let broker = ScriptedBroker::start().await;
    let log = broker.log();
    // Longer than one 5s keepalive interval
    let sink = Arc::new(HoldingSink::new(broker.log(), Duration::from_secs(6)));
    let subscriber = listening_subscriber(&broker, &["slow/#"], sink.clone()).await;

    assert_eq!(log.route("p/slow/1", br#"{"n":1}"#), 1);
    assert_eq!(log.route("p/slow/2", br#"{"n":2}"#), 1);

    assert!(
        wait_until(Duration::from_secs(15), || sink.topics().len() == 2).await,
        "messages stopped flowing"
    );
    assert_eq!(sink.topics(), vec!["slow/1", "slow/2"]);
    let pings = sink.pings_during_hold.lock().unwrap().unwrap_or(0);
    assert!(pings >= 1, "no PINGREQ while the handler was busy");
    assert_eq!(subscriber.state(), SubscriberState::Listening);
    assert_eq!(log.client_ids().len(), 1, "session was dropped and reopened");

    subscriber.stop().await;
}

#[tokio::test]
async fn test_stop_does_not_wait_for_busy_handler() {
    let broker = ScriptedBroker::start().await;
    let log = broker.log();
    let sink = Arc::new(HoldingSink::new(broker.log(), Duration::from_secs(60)));
    let subscriber = listening_subscriber(&broker, &["busy/#"], sink.clone()).await;

    assert_eq!(log.route("p/busy/1", b"{}"), 1);
    assert!(wait_until(WAIT, || sink.holding.load(Ordering::SeqCst)).await);

    let started = Instant::now();
    subscriber.stop().await;

    assert!(started.elapsed() < Duration::from_secs(3), "stop took {:?}", started.elapsed());
    assert_eq!(subscriber.state(), SubscriberState::Stopped);
}
