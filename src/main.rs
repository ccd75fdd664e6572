use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use droplink::receiver;
use droplink::relay::{self, RelayConfig};
use droplink::sender::{self, FlowOutcome};
use droplink::status::{Status, StatusSnapshot};
use droplink::token::SessionToken;
use droplink::transfer::DEFAULT_CHUNK_SIZE;
use droplink::webrtc_peer::WebRtcLinkFactory;

/// Default relay deployment.
const DEFAULT_RELAY_HTTP: &str = "https://relay.droplink.dev";
const DEFAULT_RELAY_WS: &str = "wss://relay.droplink.dev/ws";

#[derive(Parser)]
#[command(name = "droplink")]
#[command(about = "Direct peer-to-peer file transfer via a rendezvous relay")]
#[command(version)]
struct Cli {
    /// Relay HTTP base URL
    #[arg(long, global = true, default_value = DEFAULT_RELAY_HTTP)]
    relay_url: String,

    /// Relay WebSocket URL
    #[arg(long, global = true, default_value = DEFAULT_RELAY_WS)]
    relay_ws_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and send files once a peer joins
    Host {
        /// Files to send, in order
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Join a session by token and receive files
    Join {
        /// 16-character session token
        token: String,

        /// Output directory (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn,webrtc_ice=warn,webrtc_sctp=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();
    let relay_config = RelayConfig {
        http_base: cli.relay_url.clone(),
        ws_url: cli.relay_ws_url.clone(),
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, tearing the session down...");
            ctrl_c_cancel.cancel();
        }
    });

    let (status_tx, status_rx) = watch::channel(StatusSnapshot::idle());
    let printer = tokio::spawn(print_status_transitions(status_rx));

    let factory = WebRtcLinkFactory::new(DEFAULT_CHUNK_SIZE);

    let outcome = match cli.command {
        Commands::Host { paths } => {
            for path in &paths {
                anyhow::ensure!(path.is_file(), "not a file: {}", path.display());
            }

            let created = relay::create_session(&relay_config)
                .await
                .context("relay refused to create a session")?;
            let token = SessionToken::parse(&created.token)
                .context("relay returned a malformed token")?;

            println!("Session token: {token}");
            println!("Expires: {}", created.expires_at);
            println!("On the other device, run: droplink join {token}\n");

            sender::host_session(
                &relay_config,
                token,
                &paths,
                DEFAULT_CHUNK_SIZE,
                &factory,
                &status_tx,
                &cancel,
            )
            .await
        }
        Commands::Join { token, output } => {
            let output_dir = output.unwrap_or_else(|| PathBuf::from("."));
            anyhow::ensure!(
                output_dir.is_dir(),
                "output directory does not exist: {}",
                output_dir.display()
            );

            receiver::join_session(
                &relay_config,
                &token,
                &output_dir,
                &factory,
                &status_tx,
                &cancel,
            )
            .await
        }
    };

    drop(status_tx);
    let _ = printer.await;

    match outcome {
        Ok(FlowOutcome::Completed) => {
            println!("Done.");
            Ok(())
        }
        Ok(FlowOutcome::Cancelled) => {
            println!("Session cancelled.");
            std::process::exit(130);
        }
        Err(err) => Err(err.into()),
    }
}

/// Print each status transition as it is published.
async fn print_status_transitions(mut status_rx: watch::Receiver<StatusSnapshot>) {
    loop {
        let snapshot = status_rx.borrow_and_update().clone();
        let line = match snapshot.status {
            Status::Idle => None,
            Status::Waiting => Some("Waiting for the other device to join...".to_string()),
            Status::Connected => Some("Peer connected, channel ready.".to_string()),
            Status::Transferring => Some("Transferring...".to_string()),
            Status::Completed => Some("Transfer complete.".to_string()),
            Status::Error => Some(format!(
                "Error: {}",
                snapshot.message.as_deref().unwrap_or("unknown failure")
            )),
        };
        if let Some(line) = line {
            println!("{line}");
        }
        if status_rx.changed().await.is_err() {
            return;
        }
    }
}
