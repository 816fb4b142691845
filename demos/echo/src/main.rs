//! Echo over Falcon.
//!
//! ```text
//! echo server --addr 127.0.0.1:5555
//! echo client --addr 127.0.0.1:5555 --count 5
//! ```
//!
//! Set `FALCON_CONFIG` to a JSON file to override the defaults, and
//! `RUST_LOG` (e.g. `falcon=debug`) to see the protocol at work.

use std::time::Duration;

use clap::{Parser, Subcommand};
use falcon::prelude::*;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Echo server and client over the Falcon transport.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Listen and send every payload back on the stream it arrived on.
    Server {
        /// Local address to bind.
        #[arg(short, long, default_value = "127.0.0.1:5555")]
        addr: String,
    },
    /// Connect, send numbered messages on a reliable stream, print replies.
    Client {
        /// Server address.
        #[arg(short, long, default_value = "127.0.0.1:5555")]
        addr: String,
        /// Number of messages to send.
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .ok();
}

fn load_config() -> Result<FalconConfig, Box<dyn std::error::Error>> {
    let config = match std::env::var("FALCON_CONFIG") {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        Err(_) => FalconConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

async fn run_server(addr: &str, config: FalconConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut server = FalconServer::new(config);
    server.on_client_connected(|peer_id| tracing::info!(%peer_id, "joined"));
    server.on_client_disconnected(|peer_id| tracing::info!(%peer_id, "left"));
    server.on_data_received(move |peer_id, stream_id, data| {
        // The receiver only goes away on shutdown.
        let _ = tx.send((peer_id, stream_id, data.to_vec()));
    });
    server.listen(addr).await?;
    eprintln!("echo server listening on {addr}");

    loop {
        tokio::select! {
            Some((peer_id, stream_id, data)) = rx.recv() => {
                if let Err(e) = server.send_data(peer_id, stream_id, &data).await {
                    tracing::warn!(%peer_id, %stream_id, error = %e, "echo failed");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.stop_listening().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

async fn run_client(
    addr: &str,
    count: usize,
    config: FalconConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut client = FalconClient::new(config);
    client.on_disconnect(|| tracing::warn!("connection lost"));
    client.on_data_received(move |_stream_id, data| {
        let _ = tx.send(String::from_utf8_lossy(data).into_owned());
    });
    client.connect(addr).await?;
    let peer_id = client.wait_until_connected().await?;
    eprintln!("connected to {addr} as {peer_id}");

    let stream = client.create_stream(true).await?;
    for n in 0..count {
        client
            .send_data(stream.stream_id, format!("message {n}").as_bytes())
            .await?;
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(reply)) => println!("{reply}"),
            Ok(None) => break,
            Err(_) => eprintln!("no reply to message {n}"),
        }
    }

    client.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config()?;

    match cli.mode {
        Mode::Server { addr } => run_server(&addr, config).await,
        Mode::Client { addr, count } => run_client(&addr, count, config).await,
    }
}
