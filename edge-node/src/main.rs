// edge-node: serve or push payloads over the edge-core transport.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use edge_core::{ConnectType, EdgeData, EdgeEvent, EdgeHandle, EventKind, Roles, CLIENT_ID_KEY};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "edge-node", version, about = "Edge data transport node")]
struct Cli {
    /// Config file (default: ~/.config/edge-node/config.toml, then /etc/edge-node/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and log received data.
    Serve {
        /// Listen port (overrides config).
        #[arg(long)]
        port: Option<u16>,
        /// Send every received payload back to its sender.
        #[arg(long)]
        echo: bool,
    },
    /// Connect to a server and send messages.
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: u16,
        /// Times each message is sent.
        #[arg(long, default_value = "1")]
        count: u32,
        /// Seconds to wait for replies after sending.
        #[arg(long, default_value = "0")]
        wait: u64,
        /// Messages; each becomes one buffer.
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

/// What the event callback hands to the async side.
enum Incoming {
    Data(EdgeData),
    Closed(String),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        match cli.command {
            Command::Serve { port, echo } => serve(cfg, port, echo).await,
            Command::Send {
                host,
                port,
                count,
                wait,
                messages,
            } => send(cfg, &host, port, count, wait, &messages).await,
        }
    })
}

fn open_handle(cfg: &config::Config, roles: Roles) -> anyhow::Result<EdgeHandle> {
    let id = cfg
        .id
        .clone()
        .unwrap_or_else(|| format!("edge-node-{}", uuid::Uuid::new_v4()));
    let handle = EdgeHandle::create(&id, ConnectType::Tcp, roles, &cfg.topic)?;
    handle.set_info("HOST", &cfg.host)?;
    handle.set_info("CAPS", &cfg.caps)?;
    if let Some(q) = &cfg.queue_size {
        handle.set_info("QUEUE_SIZE", q)?;
    }
    Ok(handle)
}

/// Route handle events into a channel drained on the runtime.
fn forward_events(handle: &EdgeHandle) -> anyhow::Result<mpsc::UnboundedReceiver<Incoming>> {
    let (tx, rx) = mpsc::unbounded_channel();
    handle.set_event_callback(Some(Arc::new(move |event: &EdgeEvent| -> edge_core::Result<()> {
        match event.kind() {
            EventKind::Capability => {
                info!(caps = %event.parse_capability()?, "peer capability accepted");
            }
            EventKind::NewDataReceived => {
                let _ = tx.send(Incoming::Data(event.parse_new_data()?));
            }
            EventKind::ConnectionCompleted => {
                info!(client = %event.text().unwrap_or_default(), "connection established");
            }
            EventKind::ConnectionClosed => {
                let _ = tx.send(Incoming::Closed(event.text().unwrap_or_default()));
            }
            _ => {}
        }
        Ok(())
    })))?;
    Ok(rx)
}

fn describe(data: &EdgeData) -> String {
    data.buffers()
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect::<Vec<_>>()
        .join(" | ")
}

async fn serve(mut cfg: config::Config, port: Option<u16>, echo: bool) -> anyhow::Result<()> {
    if let Some(p) = port {
        cfg.port = p;
    }
    let handle = open_handle(&cfg, Roles::SERVER | Roles::RECEIVE | Roles::SEND)?;
    if cfg.port != 0 {
        handle.set_info("PORT", &cfg.port.to_string())?;
    }
    let mut rx = forward_events(&handle)?;
    handle.start().context("starting listener")?;
    info!(
        id = %handle.get_info("ID")?,
        port = %handle.get_info("PORT")?,
        "edge-node serving"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            Some(incoming) = rx.recv() => match incoming {
                Incoming::Data(data) => {
                    let from = data.get_info(CLIENT_ID_KEY).unwrap_or_default();
                    info!(client = %from, buffers = data.count(), "received: {}", describe(&data));
                    if echo {
                        if let Err(e) = handle.send(&data) {
                            warn!(client = %from, "echo failed: {e}");
                        }
                    }
                }
                Incoming::Closed(id) => info!(client = %id, "connection closed"),
            }
        }
    }
    info!("shutting down");
    handle.release()?;
    Ok(())
}

async fn send(
    cfg: config::Config,
    host: &str,
    port: u16,
    count: u32,
    wait: u64,
    messages: &[String],
) -> anyhow::Result<()> {
    let handle = open_handle(&cfg, Roles::SEND | Roles::RECEIVE)?;
    let mut rx = forward_events(&handle)?;
    handle.start()?;
    handle
        .connect(host, port)
        .with_context(|| format!("connecting to {host}:{port}"))?;
    let client_id = handle.get_info("CLIENT_ID")?;

    for seq in 0..count {
        let data = EdgeData::new();
        for m in messages {
            data.add(m.clone().into_bytes())?;
        }
        data.set_info(CLIENT_ID_KEY, &client_id)?;
        data.set_info("seq", &seq.to_string())?;
        handle.send(&data)?;
    }
    info!(count, client = %client_id, "sent");

    if wait > 0 {
        let deadline = tokio::time::sleep(Duration::from_secs(wait));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Some(incoming) = rx.recv() => match incoming {
                    Incoming::Data(data) => println!("{}", describe(&data)),
                    Incoming::Closed(_) => {
                        warn!("server closed the connection");
                        break;
                    }
                },
            }
        }
    }
    handle.release()?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
