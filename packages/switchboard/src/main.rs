use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use switchboard::{Client, ConnectionState, Envelope, WsConnector, config};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Tail and send dashboard events over one shared connection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (defaults + SWITCHBOARD_* env vars when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server WebSocket URL, overrides the config
    #[arg(long, global = true)]
    url: Option<String>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print inbound events of the given types as JSON lines until Ctrl-C
    Tail {
        /// Event type to follow (repeatable)
        #[arg(long = "event", required = true)]
        events: Vec<String>,
    },
    /// Send one event and exit once it has left the outbound queue
    Send {
        /// Event type
        #[arg(long)]
        event: String,

        /// JSON payload
        #[arg(long, default_value = "null")]
        data: String,

        /// Give up if the event is still queued after this long
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "switchboard=debug,warn"
    } else {
        "switchboard=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut config = config::resolve(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.url {
        config.url = url;
        config.validate()?;
    }

    let connector = WsConnector::new();
    let client = Client::spawn(config, connector.clone());
    let result = match cli.command {
        Commands::Tail { events } => tail(&client, events).await,
        Commands::Send {
            event,
            data,
            wait_secs,
        } => send(&client, event, &data, Duration::from_secs(wait_secs)).await,
    };
    client.shutdown().await;
    // Let released sockets write what they hold and finish the close handshake
    connector.drained().await;
    result
}

async fn tail(client: &Client, events: Vec<String>) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let subscriptions: Vec<_> = events
        .into_iter()
        .map(|event_type| {
            let tx = tx.clone();
            client.subscribe(event_type, move |envelope| {
                tx.send(envelope.clone())
                    .map_err(|_| anyhow::anyhow!("output closed"))
            })
        })
        .collect();
    drop(tx);

    let mut states = client.watch_state();
    client.connect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *states.borrow_and_update();
                if state == ConnectionState::Failed {
                    break Err(anyhow::anyhow!("connection failed, giving up"));
                }
            }
            Some(envelope) = rx.recv() => {
                println!("{}", envelope.encode()?);
            }
        }
    };

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    outcome
}

async fn send(client: &Client, event: String, data: &str, wait: Duration) -> Result<()> {
    let data: serde_json::Value = serde_json::from_str(data).context("--data must be JSON")?;
    client.emit(event.clone(), data);
    client.connect();

    let deadline = Instant::now() + wait;
    loop {
        let stats = client.stats().await.context("engine stopped")?;
        if stats.sent > 0 && stats.queued == 0 {
            info!(event = %event, "sent");
            break;
        }
        if stats.state == ConnectionState::Failed {
            bail!("connection failed before {event} was sent");
        }
        if Instant::now() >= deadline {
            warn!(state = %stats.state, queued = stats.queued, "still waiting to send");
            bail!("{event} still queued after {}s", wait.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}
