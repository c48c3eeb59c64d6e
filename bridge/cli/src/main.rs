//! sandbox-bridge
//!
//! Command-line front end for the Bridge.
//!
//! # Usage
//!
//! ```bash
//! # Deliver a message, letting the Bridge pick the strategy
//! sandbox-bridge send worker-1 'stop and report'
//!
//! # Structured payload over a fixed strategy
//! sandbox-bridge send worker-1 '{"action":"ping"}' --json --strategy shared-volume
//!
//! # Same message to several sandboxes
//! sandbox-bridge broadcast ping worker-1 worker-2 worker-3
//!
//! # Print every inbound envelope for this sandbox until Ctrl-C
//! sandbox-bridge listen coordinator
//!
//! # Exit status 0 if the container is running
//! sandbox-bridge alive worker-1
//! ```
//!
//! # Environment Variables
//!
//! - `BRIDGE_*`: see `BridgeConfig::apply_env`
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use bridge_core::{
    Bridge, BridgeConfig, DockerCli, EnvelopeId, Payload, SendOptions, Strategy, StrategyMode,
};

#[derive(Parser, Debug)]
#[command(name = "sandbox-bridge", version, about = "Deliver messages into container sandboxes")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/sandbox-bridge/bridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Container runtime binary
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Strategy selection for every send: auto or a strategy name
    #[arg(long, global = true)]
    mode: Option<StrategyMode>,

    /// Attempts per strategy
    #[arg(long, global = true)]
    retry_attempts: Option<u32>,

    /// Delay between attempts in milliseconds
    #[arg(long, global = true)]
    retry_delay_ms: Option<u64>,

    /// Log every failed attempt
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deliver one message
    Send {
        /// Target container identity
        target: String,
        /// Message text
        payload: String,
        /// Sender label
        #[arg(long)]
        from: Option<String>,
        /// Envelope id (generated if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Use only this strategy
        #[arg(long)]
        strategy: Option<Strategy>,
        /// Parse the payload as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deliver one message to several targets concurrently
    Broadcast {
        /// Message text
        payload: String,
        /// Target container identities
        #[arg(required = true)]
        targets: Vec<String>,
        /// Sender label
        #[arg(long)]
        from: Option<String>,
        /// Parse the payload as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print inbound messages as JSON lines until interrupted
    Listen {
        /// Identity to listen for (default: self_identity, then $HOSTNAME)
        identity: Option<String>,
    },
    /// Check whether a target container is running
    Alive {
        /// Target container identity
        target: String,
    },
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("sandbox_bridge={level}").parse()?)
                .add_directive(format!("bridge_core={level}").parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(runtime) = &cli.runtime {
        config.runtime.clone_from(runtime);
    }
    if let Some(mode) = cli.mode {
        config.strategy = mode;
    }
    if let Some(attempts) = cli.retry_attempts {
        config.retry_attempts = attempts;
    }
    if let Some(delay) = cli.retry_delay_ms {
        config.retry_delay_ms = delay;
    }
    if cli.verbose {
        config.verbose = true;
    }
    Ok(config)
}

fn parse_payload(text: String, json: bool) -> Result<Payload> {
    if json {
        let value: serde_json::Value =
            serde_json::from_str(&text).context("Payload is not valid JSON")?;
        Ok(Payload::Structured(value))
    } else {
        Ok(Payload::Text(text))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = load_config(&cli)?;
    let engine = Arc::new(DockerCli::new(config.runtime.clone()));
    let bridge = Bridge::new(engine, config).context("Invalid bridge configuration")?;

    match cli.command {
        Command::Send {
            target,
            payload,
            from,
            id,
            strategy,
            json,
        } => {
            let options = SendOptions {
                from,
                id: id.map(EnvelopeId::from),
                strategy,
            };
            let result = bridge
                .send(&target, parse_payload(payload, json)?, options)
                .await
                .with_context(|| format!("Failed to deliver to {target}"))?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Broadcast {
            payload,
            targets,
            from,
            json,
        } => {
            let options = SendOptions {
                from,
                ..Default::default()
            };
            let report = bridge
                .broadcast(targets, parse_payload(payload, json)?, options)
                .await;
            for settled in &report.results {
                let line = match &settled.outcome {
                    Ok(result) => serde_json::json!({
                        "target": settled.target,
                        "status": "fulfilled",
                        "result": result,
                    }),
                    Err(e) => serde_json::json!({
                        "target": settled.target,
                        "status": "rejected",
                        "error": e.to_string(),
                    }),
                };
                println!("{line}");
            }
            Ok(if report.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Listen { identity } => {
            let mut messages = bridge
                .listen(identity.as_deref())
                .await
                .context("Failed to start listening")?;
            info!("Listening, press Ctrl-C to stop");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted");
                        break;
                    }
                    message = messages.recv() => {
                        let Some(message) = message else { break };
                        let line = serde_json::json!({
                            "strategy": message.strategy,
                            "identity": message.identity,
                            "received_at": message.received_at,
                            "envelope": message.envelope,
                        });
                        println!("{line}");
                    }
                }
            }
            bridge.stop().await;
            Ok(ExitCode::SUCCESS)
        }

        Command::Alive { target } => {
            let alive = bridge.is_alive(&target).await;
            println!("{target}: {}", if alive { "alive" } else { "not alive" });
            Ok(if alive {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
