use crate::config::PeerConfig;
use crate::jsonrpc::{stop_child, CloseReason, Peer};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

/// peer-rpc - line-delimited JSON RPC client for a child process
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Method to call (or notify) on the child
    #[arg(short, long)]
    pub method: Option<String>,

    /// Params as a JSON value
    #[arg(short, long, default_value = "null")]
    pub params: String,

    /// Send a notification instead of a call
    #[arg(long)]
    pub notify: bool,

    /// Print inbound notifications for this method (repeatable)
    #[arg(short, long = "listen")]
    pub listen: Vec<String>,

    /// How long to wait for the reply
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Keep listening for notifications this long after the call
    #[arg(long, default_value_t = 0)]
    pub linger_ms: u64,

    /// Limit concurrently running notification handlers
    #[arg(long)]
    pub max_handlers: Option<usize>,

    /// Exit with status 1 as soon as the child breaks the protocol
    #[arg(long)]
    pub exit_on_protocol_error: bool,

    /// Child command and its arguments (after `--`)
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Cli {
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig::new()
            .with_max_concurrent_handlers(self.max_handlers)
            .with_exit_on_protocol_error(self.exit_on_protocol_error)
    }
}

/// `--params` の解析
pub fn parse_params(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--params is not valid JSON: {}", raw))
}

/// CLI実行エントリーポイント
pub async fn run_cli() -> Result<()> {
    run(Cli::parse()).await
}

pub async fn run(cli: Cli) -> Result<()> {
    let params = parse_params(&cli.params)?;
    if cli.notify && cli.method.is_none() {
        bail!("--notify requires --method");
    }

    let Some((program, args)) = cli.command.split_first() else {
        bail!("missing child command");
    };

    let (peer, mut child) = Peer::spawn(program, args, cli.peer_config())
        .with_context(|| format!("Failed to spawn {}", program))?;

    for method in &cli.listen {
        let name = method.clone();
        peer.handle(method.clone(), move |params: Value| {
            let line = json!({"method": name, "params": params});
            async move {
                println!("{}", line);
            }
        });
    }

    match &cli.method {
        Some(method) if cli.notify => {
            peer.notify(method, params)
                .await
                .with_context(|| format!("Failed to notify {}", method))?;
            log::debug!("Notification {} sent", method);
        }
        Some(method) => {
            let reply: Value = timeout(
                Duration::from_millis(cli.timeout_ms),
                peer.call_sync(method, params),
            )
            .await
            .with_context(|| format!("Timed out waiting for {} after {}ms", method, cli.timeout_ms))?
            .with_context(|| format!("Call {} failed", method))?;
            println!("{}", reply);
        }
        None => {
            // 通知の待ち受けのみ
            let reason = peer.closed().await;
            log::info!("Child closed the stream: {}", reason);
            if let CloseReason::Protocol(e) | CloseReason::Transport(e) = reason {
                bail!("Connection failed: {}", e);
            }
        }
    }

    if cli.linger_ms > 0 {
        sleep(Duration::from_millis(cli.linger_ms)).await;
    }

    peer.shutdown().await.context("Failed to close child stdin")?;
    stop_child(&mut child, Duration::from_secs(5))
        .await
        .context("Failed to stop child")?;
    Ok(())
}
