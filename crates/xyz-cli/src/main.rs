//! xyz CLI: run a microservice node or call one from the terminal.
//!
//! Every command reads the node configuration (`~/.xyz/config.toml` unless
//! `--config` is given) and boots an in-process node on a tokio runtime.

mod cli;
mod cmd;
mod config;
mod interval;

use crate::cli::*;
use clap::Parser;
use std::time::Duration;
use xyz_types::XyzResult;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn dispatch(cli: Cli) -> XyzResult<()> {
    let loaded = config::load_config(cli.config.as_deref())?;
    let mut identity = cli.identity.clone();

    match cli.command {
        Commands::Run {
            target,
            payload,
            every_secs,
        } => {
            let node_config = config::apply_overrides(loaded, &identity)?;
            let payload = cmd::parse_payload(&payload)?;
            cmd::cmd_run(node_config, target, payload, every_secs).await
        }
        Commands::Call {
            service,
            payload,
            timeout,
        } => {
            // One-shot commands listen on an ephemeral port unless --port is given.
            identity.port = identity.port.or(Some(0));
            let node_config = config::apply_overrides(loaded, &identity)?;
            let payload = cmd::parse_payload(&payload)?;
            cmd::cmd_call(
                node_config,
                &service,
                payload,
                timeout.map(Duration::from_secs),
            )
            .await
        }
        Commands::Ping { service } => {
            identity.port = identity.port.or(Some(0));
            let node_config = config::apply_overrides(loaded, &identity)?;
            cmd::cmd_ping(node_config, &service).await
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(dispatch(cli)) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
