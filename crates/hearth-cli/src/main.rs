//! Diagnostic client for Hearth gateways.
//!
//!   hearth --url ws://localhost:18789 watch
//!   hearth --url wss://gw.example.com call health '{"probe":true}'

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hearth_client::{ClientConfig, GatewayClient, MemoryCredentialStore};
use hearth_core::{ClientInfo, ConnectionState, StaticDeviceIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hearth", version, about = "Talk to a Hearth gateway")]
struct Args {
    /// Gateway URL (ws:// or wss://)
    #[arg(long, env = "HEARTH_URL")]
    url: String,

    /// TOML file with client settings
    #[arg(long, env = "HEARTH_CONFIG")]
    config: Option<PathBuf>,

    /// Stable device id presented in the handshake
    #[arg(long, env = "HEARTH_DEVICE_ID", default_value = "hearth-cli")]
    device_id: String,

    /// Display name presented in the handshake
    #[arg(long, default_value = "hearth")]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print connection changes, presence and events until interrupted
    Watch,
    /// Send one request and print the result
    Call {
        method: String,
        /// JSON parameters
        #[arg(default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("hearth_client=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };

    let info = ClientInfo::new(&StaticDeviceIdentity(args.device_id.clone()), args.name.clone());
    let client = GatewayClient::builder(&args.url, info)?
        .config(config)
        .credentials(Arc::new(MemoryCredentialStore::new()))
        .build();

    let outcome = match args.command {
        Command::Watch => watch(&client).await,
        Command::Call { method, params } => call(&client, &method, &params).await,
    };
    client.destroy().await;
    outcome
}

async fn watch(client: &GatewayClient) -> Result<()> {
    let _events = client.on_any(|event| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Unprintable event {}: {}", event.name, e),
        }
    });

    let mut status = client.watch_status();
    let mut presence = client.watch_presence();
    client.connect()?;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match &current.last_fault {
                    Some(fault) => eprintln!("[{}] {} (attempt {})", current.state, fault, current.attempt),
                    None => eprintln!("[{}]", current.state),
                }
                if current.state == ConnectionState::Error {
                    bail!("gateway connection failed");
                }
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = presence.borrow_and_update().clone();
                let ids: Vec<&str> = view.entries.iter().map(|e| e.instance_id.as_str()).collect();
                eprintln!(
                    "presence: {} (leader {}, role {:?})",
                    ids.join(", "),
                    view.leader.as_deref().unwrap_or("-"),
                    view.role
                );
                if !view.stale.is_empty() {
                    eprintln!("stale domains: {:?}", view.stale);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn call(client: &GatewayClient, method: &str, params: &str) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("params must be valid JSON")?;

    client.connect()?;
    let status = client.wait_for_state(ConnectionState::Connected).await?;
    if status.state != ConnectionState::Connected {
        match status.last_fault {
            Some(fault) => bail!("could not connect: {fault}"),
            None => bail!("could not connect"),
        }
    }

    let result = client.request(method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
