//! `eventbus` command line entry point

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use mqtt_eventbus::config::{EventBusConfig, MqttConfig};
use mqtt_eventbus::error::{EventBusError, EventBusResult, HandlerError};
use mqtt_eventbus::observability::init_default_logging;
use mqtt_eventbus::protocol::{BrokerMessage, EventContext, EventEnvelope, QoS};
use mqtt_eventbus::subscription::{
    register_from_config, EventHandler, EventSubscriptions, HandlerCatalog, SubscriptionService,
};
use mqtt_eventbus::transport::mqtt::MqttBroker;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Publish and listen for JSON events over MQTT
#[derive(Parser)]
#[command(name = "eventbus")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL overriding the [mqtt] section, e.g. mqtt://localhost:1883
    #[arg(long, env = "EVENTBUS_BROKER_URL")]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and log matching events until interrupted
    Listen {
        /// Extra topic filter handled by the `log` handler (repeatable)
        #[arg(long = "topic", value_name = "FILTER")]
        topics: Vec<String>,
    },
    /// Publish one JSON object
    Publish {
        #[arg(long)]
        topic: String,
        /// JSON object to send
        #[arg(long)]
        payload: String,
        #[arg(long, default_value_t = 1)]
        qos: u8,
        #[arg(long)]
        retain: bool,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Validate the configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

/// Logs every event it receives
struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, event: &EventEnvelope, context: &EventContext) -> Result<(), HandlerError> {
        info!(
            topic = %context.topic,
            broker = %context.broker_name,
            event_type = %event.event_type,
            event_id = %event.id,
            payload = %event.payload,
            "Event received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_deref(), cli.broker.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { topics } => run_listener(config, topics).await,
        Commands::Publish {
            topic,
            payload,
            qos,
            retain,
            correlation_id,
        } => publish_once(config, topic, &payload, qos, retain, correlation_id).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>, broker_url: Option<&str>) -> EventBusResult<EventBusConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            EventBusConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from("eventbus.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                EventBusConfig::load_from_file(&default_path)?
            } else {
                EventBusConfig::from_toml_str("")?
            }
        }
    };

    if let Some(url) = broker_url {
        let mut mqtt = MqttConfig::from_url(url)?;
        if let Some(existing) = &config.mqtt {
            mqtt.topic_prefix = existing.topic_prefix.clone();
            mqtt.client_id = existing.client_id.clone();
        }
        config.mqtt = Some(mqtt);
    }

    Ok(config)
}

async fn run_listener(config: EventBusConfig, extra_topics: Vec<String>) -> EventBusResult<()> {
    if config.mqtt.is_none() {
        warn!("No [mqtt] section or --broker given, only local events will be dispatched");
    }

    let log_handler: Arc<dyn EventHandler> = Arc::new(LogHandler);
    let catalog = HandlerCatalog::new().with("log", Arc::clone(&log_handler));

    let service = SubscriptionService::from_config(&config);
    register_from_config(&service, &config.subscriptions, &catalog)?;
    if !extra_topics.is_empty() {
        service.subscribe(extra_topics, log_handler)?;
    }

    service.start().await;

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| EventBusError::invalid_input(format!("cannot install SIGTERM handler: {e}")))?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    service.stop().await;
    info!(stats = ?service.stats(), "Listener stopped");
    Ok(())
}

async fn publish_once(
    config: EventBusConfig,
    topic: String,
    payload: &str,
    qos: u8,
    retain: bool,
    correlation_id: Option<String>,
) -> EventBusResult<()> {
    let mqtt = config
        .mqtt
        .ok_or_else(|| EventBusError::invalid_input("publish needs an [mqtt] section or --broker"))?;
    let qos = QoS::try_from(qos).map_err(|e| EventBusError::invalid_input(e.to_string()))?;
    let payload = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(EventBusError::invalid_input("payload must be a JSON object")),
        Err(e) => return Err(EventBusError::invalid_input(format!("payload is not valid JSON: {e}"))),
    };

    let mut message = BrokerMessage::new(topic, payload)
        .with_qos(qos)
        .with_retain(retain);
    if let Some(correlation_id) = correlation_id {
        message = message.with_correlation_id(correlation_id);
    }

    let broker = MqttBroker::new(mqtt);
    broker.connect().await?;
    let result = broker.publish(message).await;
    broker.disconnect().await?;

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Could not render publish result: {}", e),
    }

    if result.success {
        Ok(())
    } else {
        Err(EventBusError::invalid_input(
            result.error.unwrap_or_else(|| "publish failed".to_string()),
        ))
    }
}

fn handle_config_command(config: &EventBusConfig, show: bool) -> EventBusResult<()> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        let mut display = config.clone();
        display.mqtt = display.mqtt.as_ref().map(MqttConfig::redacted);
        match toml::to_string_pretty(&display) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => return Err(EventBusError::invalid_input(format!("cannot render config: {e}"))),
        }
    }
    Ok(())
}
