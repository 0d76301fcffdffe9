//! MQTT Session - command-line client
//!
//! Publishes or subscribes through a single session, printing inbound
//! messages as they arrive. Ctrl-C disconnects cleanly.

use chrono::Utc;
use clap::{Parser, Subcommand};
use mqtt_session::config::{ConnectionConfig, ReconnectSection, SessionConfig};
use mqtt_session::error::ClientResult;
use mqtt_session::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_session::protocol::{Message, QoS};
use mqtt_session::session::{EventChannel, MqttClient, SessionEvent};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn, Instrument, Level};
use uuid::Uuid;

/// Callback-driven MQTT client session
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Publish and subscribe through a single MQTT session")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker address, e.g. tcp://localhost:1883
    #[arg(long, env = "MQTT_ADDRESS")]
    address: Option<String>,

    /// Client identifier (generated when absent)
    #[arg(long, env = "MQTT_CLIENT_ID")]
    client_id: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single message and wait for the acknowledgement
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value_t = 0, value_parser = parse_qos)]
        qos: u8,
        #[arg(long)]
        retain: bool,
        /// Acknowledgement timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Subscribe to a topic filter and print messages
    Subscribe {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long, default_value_t = 0, value_parser = parse_qos)]
        qos: u8,
        /// Exit after this many messages
        #[arg(long)]
        count: Option<usize>,
        /// Print one JSON object per message
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

fn parse_qos(value: &str) -> Result<u8, String> {
    let level: u8 = value.parse().map_err(|e| format!("{e}"))?;
    QoS::try_from(level)
        .map(u8::from)
        .map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct PrintedMessage<'a> {
    timestamp: String,
    topic: &'a str,
    bytes: usize,
    payload: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
            timeout_ms,
        } => {
            run_publish(
                config,
                &topic,
                message,
                qos,
                retain,
                Duration::from_millis(timeout_ms),
            )
            .await
        }
        Commands::Subscribe {
            topic,
            qos,
            count,
            json,
        } => run_subscribe(config, &topic, qos, count, json).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// Configuration file (explicit or default location) with flag overrides applied
fn load_configuration(cli: &Cli) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let file = match &cli.config {
        Some(path) => Some(path.clone()),
        None => ["mqtt-session.toml", "config/mqtt-session.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    };

    let mut config = match file {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            SessionConfig::parse_file(Path::new(&path))?
        }
        None => SessionConfig {
            mqtt: ConnectionConfig::new("", ""),
            reconnect: None,
        },
    };

    if let Some(address) = &cli.address {
        config.mqtt.address = address.clone();
    }
    if let Some(client_id) = &cli.client_id {
        config.mqtt.client_id = client_id.clone();
    }
    if config.mqtt.client_id.is_empty() {
        config.mqtt.client_id = format!("mqtt-session-{}", Uuid::new_v4().simple());
    }

    config.validate()?;
    Ok(config)
}

/// Connect and wait for the handshake to finish
async fn open_session(
    config: &SessionConfig,
) -> Result<(MqttClient, UnboundedReceiver<SessionEvent>), Box<dyn std::error::Error>> {
    let (events, receiver) = EventChannel::new();
    let client = MqttClient::with_rumqttc(events)?;
    client.configure(config.mqtt.clone())?;

    let span = mqtt_session::lifecycle_span!(phase = "connect", client_id = %config.mqtt.client_id);
    client.connect()?.wait().instrument(span).await?;
    info!(address = %config.mqtt.address, "Session established");
    Ok((client, receiver))
}

async fn close_session(client: &MqttClient) {
    if !client.state().is_live() {
        return;
    }
    match client.disconnect() {
        Ok(token) => {
            if let Err(e) = token.wait_timeout(Duration::from_secs(5)).await {
                warn!("Disconnect did not complete cleanly: {}", e);
            }
        }
        Err(e) => warn!("Disconnect rejected: {}", e),
    }
}

async fn run_publish(
    config: SessionConfig,
    topic: &str,
    message: String,
    qos: u8,
    retain: bool,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (client, _events) = open_session(&config).await?;

    let outcome = tokio::select! {
        result = client.publish_and_wait(topic, message.into_bytes(), qos, retain, timeout) => result,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, abandoning publish");
            Ok(())
        }
    };

    close_session(&client).await;
    outcome?;
    info!(topic, qos = %qos, retain, "Message published");
    Ok(())
}

async fn run_subscribe(
    config: SessionConfig,
    filter: &str,
    qos: u8,
    count: Option<usize>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let reconnect = config.reconnect.clone();
    let (client, mut events) = open_session(&config).await?;
    client.subscribe(filter, qos)?.wait().await?;
    info!(filter, qos = %qos, "Subscribed");

    let mut received = 0usize;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, disconnecting");
                break;
            }
        };

        match event {
            Some(SessionEvent::Message(message)) => {
                print_message(&message, json)?;
                received += 1;
                if count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            Some(SessionEvent::ConnectionLost(cause)) => {
                warn!("Connection lost: {}", cause);
                let Some(reconnect) = &reconnect else {
                    return Err(format!("connection lost: {cause}").into());
                };
                if !resume(&client, reconnect, filter, qos).await {
                    info!("Received Ctrl-C, disconnecting");
                    break;
                }
            }
            Some(SessionEvent::SubscribeFailed(id, reason)) => {
                error!(operation = %id, "Subscription failed: {}", reason);
            }
            Some(_) => {}
            None => break,
        }
    }

    close_session(&client).await;
    Ok(())
}

/// Reconnect and resubscribe until it succeeds; false when interrupted by Ctrl-C
async fn resume(
    client: &MqttClient,
    reconnect: &ReconnectSection,
    filter: &str,
    qos: QoS,
) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(reconnect.interval()) => {}
            _ = signal::ctrl_c() => return false,
        }

        let attempt = tokio::select! {
            result = resubscribe(client, filter, qos) => result,
            _ = signal::ctrl_c() => return false,
        };

        match attempt {
            Ok(()) => {
                info!("Session resumed");
                return true;
            }
            Err(e) => warn!("Resume attempt failed: {}", e),
        }
    }
}

/// One resume attempt; a session that is still up only needs the subscription
async fn resubscribe(client: &MqttClient, filter: &str, qos: QoS) -> ClientResult<()> {
    if !client.is_connected() {
        info!("Reconnecting");
        client.connect()?.wait().await?;
    }
    client.subscribe(filter, qos)?.wait().await
}

fn print_message(message: &Message, json: bool) -> Result<(), serde_json::Error> {
    let timestamp = Utc::now().to_rfc3339();
    let payload = String::from_utf8_lossy(message.payload()).into_owned();

    if json {
        let printed = PrintedMessage {
            timestamp,
            topic: message.topic(),
            bytes: message.len(),
            payload,
        };
        println!("{}", serde_json::to_string(&printed)?);
    } else {
        println!("[{}] {}: {}", timestamp, message.topic(), payload);
    }
    Ok(())
}

fn handle_config_command(
    config: &SessionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
