//! Clap CLI definitions for xyz.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  xyz run                          Serve up/down and call mul every 2s
  xyz run --target mul --every 5   Change the periodic call
  xyz call stringMS/up '\"abc\"'     One-shot call, prints the reply body
  xyz ping mathMS                  Check that a peer is reachable

\x1b[1;36mConfig:\x1b[0m
  Defaults to ~/.xyz/config.toml; override with --config.";

/// xyz: name-addressed RPC between microservice nodes.
#[derive(Parser)]
#[command(name = "xyz", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub identity: IdentityOverrides,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags that replace values from the `[self]` section.
#[derive(Args, Debug, Default, Clone)]
pub struct IdentityOverrides {
    /// Node name.
    #[arg(long, global = true)]
    pub name: Option<String>,
    /// Host to listen on.
    #[arg(long, global = true)]
    pub host: Option<String>,
    /// Port to listen on.
    #[arg(long, global = true)]
    pub port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the string service: serve `up`/`down` and call a peer periodically.
    Run {
        /// Service to call on every tick.
        #[arg(long, default_value = "mul")]
        target: String,
        /// JSON payload sent on every tick.
        #[arg(long, default_value = r#"{"x":2,"y":5}"#)]
        payload: String,
        /// Seconds between calls.
        #[arg(long = "every", default_value_t = 2)]
        every_secs: u64,
    },
    /// Call a peer once and print the reply body.
    Call {
        /// `service/action` or a bare service or action name.
        service: String,
        /// JSON payload.
        #[arg(default_value = "null")]
        payload: String,
        /// Override the configured call timeout, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Ping a peer and print its uptime.
    Ping {
        /// Service name from `[system]`.
        service: String,
    },
}
