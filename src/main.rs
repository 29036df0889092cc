//! Insidious bridge CLI - drive the worker from a terminal.
//!
//! A thin stand-in for the graphical front end: it connects to the worker,
//! issues single commands, or streams unsolicited traffic to stdout.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use insidious_bridge::{BridgeClient, BridgeConfig, BridgeService, Message, Topic};

#[derive(Parser, Debug)]
#[command(name = "insidious-bridge")]
#[command(about = "Send commands to the Insidious worker and watch its events")]
struct Args {
    /// Worker host (overrides INSIDIOUS_BRIDGE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Worker port (overrides INSIDIOUS_BRIDGE_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Connection attempts before giving up
    #[arg(long)]
    attempts: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one command to a worker module
    Send {
        /// Worker module (e.g. "dns", "mitm")
        scope: String,
        /// Action within the module (e.g. "spoof_all")
        operation: String,
        /// JSON payload
        #[arg(default_value = "null")]
        payload: String,
        /// Wait for the correlated response and print it
        #[arg(short, long)]
        wait: bool,
        /// Seconds to wait for a response
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Print unsolicited responses, events and errors until the worker disconnects
    Watch,
}

impl Args {
    fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::from_env();
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(attempts) = self.attempts {
            config = config.with_max_attempts(attempts);
        }
        config
    }
}

/// A validated subcommand, ready to run once connected.
#[derive(Debug)]
enum Action {
    Send {
        scope: String,
        operation: String,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    },
    Watch,
}

impl Action {
    /// Check the arguments up front, so bad input fails before any connect attempt.
    fn from_command(command: Command) -> Result<Self> {
        match command {
            Command::Send {
                scope,
                operation,
                payload,
                wait,
                timeout,
            } => {
                let payload = serde_json::from_str(&payload)
                    .with_context(|| format!("Payload is not valid JSON: {}", payload))?;
                Ok(Action::Send {
                    scope,
                    operation,
                    payload,
                    timeout: wait.then(|| Duration::from_secs(timeout)),
                })
            }
            Command::Watch => Ok(Action::Watch),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "insidious_bridge=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = args.config();
    let action = Action::from_command(args.command)?;

    let client = BridgeClient::new(config);
    client
        .connect()
        .await
        .context("Failed to connect to the Insidious worker")?;

    let result = match action {
        Action::Send {
            scope,
            operation,
            payload,
            timeout,
        } => run_send(&client, &scope, &operation, payload, timeout).await,
        Action::Watch => run_watch(&client).await,
    };

    client.disconnect().await;
    result
}

/// Issue one command; print the reply when one is awaited.
async fn run_send(
    bridge: &dyn BridgeService,
    scope: &str,
    operation: &str,
    payload: serde_json::Value,
    timeout: Option<Duration>,
) -> Result<()> {
    match timeout {
        None => {
            bridge
                .send(scope, operation, payload)
                .await
                .with_context(|| format!("Failed to send {}.{}", scope, operation))?;
            tracing::info!("Sent {}.{}", scope, operation);
        }
        Some(timeout) => {
            let reply = bridge
                .request(scope, operation, payload, timeout)
                .await
                .with_context(|| format!("Request {}.{} failed", scope, operation))?;
            println!("{}", render(&reply)?);
        }
    }
    Ok(())
}

/// Stream unsolicited traffic until the worker closes or Ctrl-C.
async fn run_watch(client: &BridgeClient) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    for topic in [Topic::Response, Topic::Event, Topic::Error] {
        let tx = tx.clone();
        client.subscribe(topic, move |message| {
            let _ = tx.send(message.clone());
        });
    }
    drop(tx);

    let mut liveness = tokio::time::interval(Duration::from_millis(500));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            Some(message) = rx.recv() => println!("{}", render(&message)?),
            _ = liveness.tick() => {
                if !client.is_connected() {
                    tracing::info!("Worker closed the connection");
                    return Ok(());
                }
            }
            _ = &mut interrupted => return Ok(()),
        }
    }
}

fn render(message: &Message) -> Result<String> {
    serde_json::to_string(message).context("Failed to render message")
}
