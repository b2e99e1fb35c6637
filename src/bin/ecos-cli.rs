//! ecos-cli - Command-line client for ECoS command stations
//!
//! Connects, waits for the startup refresh, runs one subcommand and closes.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use ecoslink::station::codec;
use ecoslink::{
    ConnectionState, NotificationKind, ObjectId, ObjectOption, SinkHandle, Station, StationConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "ecos-cli")]
#[command(about = "Talk to an ECoS model-railway command station", long_about = None)]
struct Cli {
    /// Command station address or host name
    #[arg(long, default_value = "192.168.1.100")]
    host: String,

    /// TCP port (default: from config, 15471)
    #[arg(short, long)]
    port: Option<u16>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-request reply deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show device identification and status
    Info,

    /// List the engine roster
    Engines,

    /// Send a raw command, e.g. `get(1,status)`
    Send {
        /// Command text
        command: String,
    },

    /// Print events for the given object ids until interrupted
    Watch {
        /// Object ids
        #[arg(required = true)]
        ids: Vec<ObjectId>,
    },

    /// Switch track power on
    Go,

    /// Switch track power off
    Stop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StationConfig::load(path)?,
        None => StationConfig::default(),
    };
    if let Some(timeout_ms) = cli.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    let ready_within = config.request_timeout() * 4;

    let station = Station::new(config);
    let mut notifications = station.notifications();
    station
        .connect(&cli.host, cli.port)
        .await
        .with_context(|| format!("connecting to {}", cli.host))?;
    wait_ready(&mut notifications, ready_within).await?;

    let outcome = run(&station, cli.command, notifications).await;
    station.close();
    outcome
}

async fn run(
    station: &Station,
    command: Commands,
    mut notifications: broadcast::Receiver<ecoslink::Notification>,
) -> anyhow::Result<()> {
    match command {
        Commands::Info => {
            let info = station.device_info();
            println!("Station:     {}", info.name);
            println!("Protocol:    {}", info.protocol_version);
            println!("Application: {}", info.application_version);
            println!("Hardware:    {}", info.hardware_version);
            println!("Status:      {}", station.state());
            if let Some(peer) = station.peer_addr() {
                println!("Address:     {peer}");
            }
        }

        Commands::Engines => {
            let engines = station.engines();
            if engines.is_empty() {
                println!("No engines");
            }
            for engine in engines {
                println!("{:>6}  addr {:>5}  {}", engine.id, engine.address, engine.name);
            }
        }

        Commands::Send { command } => {
            let parsed = codec::parse_command(&command)
                .with_context(|| format!("parsing `{command}`"))?;
            let rows = station.send_command(&parsed).await?;
            for row in rows {
                println!("{row}");
            }
        }

        Commands::Watch { ids } => {
            let printer: SinkHandle =
                Arc::new(|id: ObjectId, options: &[ObjectOption]| -> anyhow::Result<()> {
                    let rendered: Vec<String> = options.iter().map(ToString::to_string).collect();
                    println!("{id} {}", rendered.join(" "));
                    Ok(())
                });
            for id in &ids {
                station.subscribe(*id, printer.clone());
            }
            println!("Watching {} object(s), Ctrl-C to stop", ids.len());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = notifications.recv() => match received {
                        Ok(notification) => match notification.kind {
                            NotificationKind::Error(err) => eprintln!("error: {err}"),
                            NotificationKind::StateChanged { to: ConnectionState::Closed, .. } => {
                                bail!("connection closed");
                            }
                            NotificationKind::StateChanged { to, .. } => println!("status {to}"),
                            _ => {}
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            eprintln!("missed {missed} notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            for id in &ids {
                station.unsubscribe(*id, &printer);
            }
            // Give the release commands a moment before closing.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Commands::Go => {
            let state = station.start().await?;
            println!("Status: {state}");
        }

        Commands::Stop => {
            let state = station.stop().await?;
            println!("Status: {state}");
        }
    }

    Ok(())
}

/// Wait until the startup refresh has read the engine roster.
async fn wait_ready(
    notifications: &mut broadcast::Receiver<ecoslink::Notification>,
    within: Duration,
) -> anyhow::Result<()> {
    let ready = async {
        loop {
            match notifications.recv().await {
                Ok(notification) => match notification.kind {
                    NotificationKind::EnginesChanged(_) => return Ok(()),
                    NotificationKind::Error(err) => {
                        tracing::warn!(error = %err, "during startup");
                    }
                    NotificationKind::StateChanged {
                        to: ConnectionState::Closed,
                        ..
                    } => bail!("connection closed during startup"),
                    _ => {}
                },
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => bail!("station dropped"),
            }
        }
    };
    tokio::time::timeout(within, ready)
        .await
        .context("startup refresh did not finish")?
}
