use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::debug;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::SessionId;

#[derive(Parser, Debug)]
#[command(name = "beach-pier", version)]
#[command(about = "Beach Pier session gateway and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

/// Server options; used when no subcommand is given.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Redis connection URI; when set, idempotency keys are shared through Redis.
    #[arg(long, env = "BEACH_PIER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// How long an accepted idempotency key blocks repeats (0 keeps keys forever).
    #[arg(long, env = "BEACH_PIER_IDEMPOTENCY_RETENTION_SECS", default_value_t = 86_400)]
    pub idempotency_retention_secs: u64,

    /// Maximum idempotency keys held in memory (0 is unbounded).
    #[arg(long, env = "BEACH_PIER_IDEMPOTENCY_MAX_KEYS", default_value_t = 100_000)]
    pub idempotency_max_keys: usize,

    /// How often expired in-memory idempotency keys are reclaimed.
    #[arg(
        long,
        env = "BEACH_PIER_IDEMPOTENCY_PURGE_INTERVAL_SECS",
        default_value_t = 60
    )]
    pub idempotency_purge_interval_secs: u64,

    /// Key namespace used in Redis.
    #[arg(
        long,
        env = "BEACH_PIER_IDEMPOTENCY_KEY_PREFIX",
        default_value = "pier:idempotency"
    )]
    pub idempotency_key_prefix: String,

    /// Close sessions that send nothing for this long (0 disables).
    #[arg(long, env = "BEACH_PIER_SESSION_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub session_idle_timeout_secs: u64,

    /// How often idle sessions are swept.
    #[arg(long, env = "BEACH_PIER_IDLE_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub idle_sweep_interval_secs: u64,

    /// Business service that accepted `/api/*` requests are forwarded to.
    #[arg(long, env = "BEACH_PIER_UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a gateway, print the assigned session id and measure PING round trips
    Probe {
        /// WebSocket endpoint (e.g., ws://localhost:8080/ws)
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Number of pings to send
        #[arg(short = 'n', long, default_value_t = 3)]
        count: u32,

        /// Seconds to wait for each server message
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

#[derive(Debug)]
pub struct ProbeReport {
    pub session_id: SessionId,
    pub round_trips: Vec<Duration>,
}

pub async fn run_probe(url: &str, count: u32, wait: Duration) -> Result<ProbeReport> {
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(wait, connect_async(url)).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {url}"))?,
        Err(_) => {
            return Err(anyhow!(
                "connection timeout - is the gateway running at {url}?"
            ))
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let session_id = match next_server_message(&mut read, wait).await? {
        ServerMessage::Hello { session_id } => session_id,
        other => return Err(anyhow!("expected HELLO first, got {other:?}")),
    };
    debug!("Session established: {}", session_id);

    let ping = serde_json::to_string(&ClientMessage::Ping)?;
    let mut round_trips = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let started = Instant::now();
        write.send(Message::Text(ping.clone().into())).await?;
        match next_server_message(&mut read, wait).await? {
            ServerMessage::Pong => round_trips.push(started.elapsed()),
            other => return Err(anyhow!("expected PONG, got {other:?}")),
        }
    }

    write.send(Message::Close(None)).await?;

    Ok(ProbeReport {
        session_id,
        round_trips,
    })
}

async fn next_server_message<S>(read: &mut S, wait: Duration) -> Result<ServerMessage>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = timeout(wait, read.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for the gateway"))?
            .ok_or_else(|| anyhow!("connection closed unexpectedly"))??;
        match frame {
            Message::Text(text) => {
                let text = text.as_str();
                return serde_json::from_str(text)
                    .with_context(|| format!("unexpected frame from gateway: {text}"));
            }
            Message::Close(_) => return Err(anyhow!("gateway closed the connection")),
            _ => continue,
        }
    }
}

pub fn print_probe_report(report: &ProbeReport) {
    println!("session: {}", report.session_id);
    for (index, rtt) in report.round_trips.iter().enumerate() {
        println!("  ping {}: {:.2} ms", index + 1, rtt.as_secs_f64() * 1000.0);
    }
    if !report.round_trips.is_empty() {
        let total: Duration = report.round_trips.iter().sum();
        let average = total / report.round_trips.len() as u32;
        println!(
            "  avg: {:.2} ms over {} pings",
            average.as_secs_f64() * 1000.0,
            report.round_trips.len()
        );
    }
}
