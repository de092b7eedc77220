mod logging;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use peer_relay::{
    ConnectOptions, DomainKey, HttpRelay, PeerIdentity, RelayConfig, RelayEvent, RelayRegistry,
    WebRtcPeerConfig, WebRtcPeerFactory,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::logging::{LogConfig, LogLevel};

/// Grace period for queued disconnect signals to reach the relay on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "peer-relay", about = "Negotiate peer data channels through a signaling relay")]
struct Cli {
    /// Relay provider base URL
    #[arg(long, env = "PEER_RELAY_PROVIDER", default_value = "http://127.0.0.1:8080")]
    provider: String,

    /// Application name to join the relay as
    #[arg(long, env = "PEER_RELAY_APP", default_value = "localhost")]
    app: String,

    /// Access token in `<user>:<secret>` form
    #[arg(long, env = "PEER_RELAY_TOKEN", hide_env_values = true)]
    token: String,

    /// Peer to call on startup, as `user` or `user@app` (repeatable)
    #[arg(long = "connect", value_name = "USER[@APP]")]
    connect: Vec<String>,

    /// Delay before resending a signal the relay could not deliver
    #[arg(long, env = "PEER_RELAY_RETRY_MS")]
    retry_ms: Option<u64>,

    /// Give up on a negotiation after this long (0 disables)
    #[arg(long, env = "PEER_RELAY_NEGOTIATION_TIMEOUT_MS")]
    negotiation_timeout_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn relay_config(&self) -> Result<RelayConfig> {
        let mut config = RelayConfig::new(&self.provider, self.app.clone())?;
        if let Some(ms) = self.retry_ms {
            config = config.with_retry_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.negotiation_timeout_ms {
            config = config.with_negotiation_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        Ok(config)
    }
}

fn parse_peer(target: &str, default_app: &str) -> Result<PeerIdentity> {
    let peer = match target.split_once('@') {
        Some((user, app)) => PeerIdentity::new(user, app),
        None => PeerIdentity::new(target, default_app),
    };
    peer.validate()
        .with_context(|| format!("invalid peer `{target}`"))?;
    Ok(peer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = cli.relay_config()?;
    let relay = Arc::new(HttpRelay::new(config.provider.clone()));
    let peers = Arc::new(WebRtcPeerFactory::new(WebRtcPeerConfig::from_env())?);
    let mut registry = RelayRegistry::new(config, relay, peers);
    let Some(mut events) = registry.take_events() else {
        bail!("registry event receiver unavailable");
    };

    registry
        .set_access_token(Some(&cli.token))
        .await
        .context("rejected access token")?;
    for target in &cli.connect {
        let peer = parse_peer(target, &cli.app)?;
        let key = registry.connect(peer, ConnectOptions::default()).await?;
        info!(domain = %key, "calling peer");
    }

    let mut connected: BTreeMap<DomainKey, String> = BTreeMap::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupt received; shutting down");
                break;
            }
            input = registry.next_input() => match input {
                Some(input) => registry.handle(input).await,
                None => break,
            },
            Some(event) = events.recv() => {
                report(event, &mut connected, &mut stdout).await?;
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => broadcast(&mut registry, &connected, line).await,
                None => stdin_open = false,
            },
        }
    }

    registry.shutdown().await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn report(
    event: RelayEvent,
    connected: &mut BTreeMap<DomainKey, String>,
    stdout: &mut tokio::io::Stdout,
) -> Result<()> {
    match event {
        RelayEvent::AccessGranted { user_id } => info!(user_id = %user_id, "relay access granted"),
        RelayEvent::AccessDenied => warn!("relay access denied"),
        RelayEvent::Connected(peer) => {
            eprintln!("* connected to {}@{}", peer.user, peer.application);
            connected.insert(peer.domain, format!("{}@{}", peer.user, peer.application));
        }
        RelayEvent::Disconnected(peer) => {
            if connected.remove(&peer.domain).is_some() {
                eprintln!("* disconnected from {}@{}", peer.user, peer.application);
            }
        }
        RelayEvent::Error { peer, error } => match peer {
            Some(peer) => warn!(domain = %peer.domain, error = %error, "peer error"),
            None => warn!(error = %error, "relay error"),
        },
        RelayEvent::Message { peer, data } => {
            let line = format!(
                "[{}@{}] {}\n",
                peer.user,
                peer.application,
                String::from_utf8_lossy(&data)
            );
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

async fn broadcast(registry: &mut RelayRegistry, connected: &BTreeMap<DomainKey, String>, line: String) {
    if connected.is_empty() {
        eprintln!("* no connected peers");
        return;
    }
    let data = Bytes::from(line);
    for (key, name) in connected {
        if let Err(err) = registry.send(key, data.clone()).await {
            warn!(peer = %name, error = %err, "failed to send line");
        }
    }
}
