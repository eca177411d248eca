//! Command-line argument parsing for the `valkey-mux` topology tool

use clap::{Parser, ValueEnum};

/// Connect to a Valkey/Redis deployment, show the discovered topology and
/// optionally route a single command through the multiplexer
#[derive(Parser, Debug, Clone)]
#[command(name = "valkey-mux")]
#[command(version, about, long_about = None)]
#[command(disable_help_flag = true)]
pub struct CliArgs {
    /// Print help information
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    // ===== Connection Options =====
    /// Seed endpoint host[:port] (repeat for several seeds)
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1:6379", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Password for AUTH command
    #[arg(short = 'a', long = "auth")]
    pub password: Option<String>,

    /// Username for ACL AUTH (requires --auth)
    #[arg(long = "user")]
    pub username: Option<String>,

    /// Database number to SELECT
    #[arg(long = "dbnum")]
    pub dbnum: Option<u32>,

    /// Endpoints are twemproxy instances
    #[arg(long = "twemproxy")]
    pub twemproxy: bool,

    // ===== Election Options =====
    /// Key consulted on each primary to agree on a single primary
    #[arg(long = "tiebreaker", default_value = super::mux_config::DEFAULT_TIEBREAKER)]
    pub tiebreaker: String,

    /// Do not consult a tie-breaker key
    #[arg(long = "no-tiebreaker")]
    pub no_tiebreaker: bool,

    /// Channel to publish primary changes on
    #[arg(long = "broadcast-channel")]
    pub broadcast_channel: Option<String>,

    /// Allow administrative commands (CONFIG, FLUSHALL, ...)
    #[arg(long = "allow-admin")]
    pub allow_admin: bool,

    // ===== Timeouts =====
    /// Synchronous operation timeout in milliseconds
    #[arg(long = "sync-timeout", default_value_t = 5000)]
    pub sync_timeout_ms: u64,

    /// Connect timeout in milliseconds
    #[arg(long = "connect-timeout", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Number of connect cycles before giving up on the initial connect
    #[arg(long = "connect-retry", default_value_t = 3)]
    pub connect_retry: u32,

    /// Keep running when no endpoint answers the initial connect
    #[arg(long = "no-abort-connect")]
    pub no_abort_connect: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long = "heartbeat", default_value_t = 1000)]
    pub heartbeat_ms: u64,

    /// Idle seconds before a keep-alive PING is sent
    #[arg(long = "keep-alive", default_value_t = 60)]
    pub keep_alive_secs: u64,

    /// Resolve DNS once and reuse the address on reconnect
    #[arg(long = "resolve-dns-once")]
    pub resolve_dns_once: bool,

    // ===== Routing =====
    /// Key used to route the command (also appended as its first argument)
    #[arg(short = 'k', long = "key")]
    pub key: Option<String>,

    /// Role preference for the command
    #[arg(long = "prefer", value_enum, default_value_t = ReadPreference::PreferPrimary)]
    pub prefer: ReadPreference,

    /// Keep running and print events for this many seconds
    #[arg(long = "watch", default_value_t = 0)]
    pub watch_secs: u64,

    // ===== Output =====
    /// Output format for the topology report
    #[arg(long = "output-format", value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Command to run, e.g. `GET` (with --key) or `PING`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Which role may serve a request
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadPreference {
    /// Primary only; fail if none is selectable
    DemandPrimary,
    /// Primary, falling back to a replica
    #[default]
    PreferPrimary,
    /// Replica only; fail if none is selectable
    DemandReplica,
    /// Replica, falling back to the primary
    PreferReplica,
}

impl ReadPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreference::DemandPrimary => "demand-primary",
            ReadPreference::PreferPrimary => "prefer-primary",
            ReadPreference::DemandReplica => "demand-replica",
            ReadPreference::PreferReplica => "prefer-replica",
        }
    }
}

/// Output format for the topology report
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_some() && self.password.is_none() {
            return Err("--user requires --auth to be set".to_string());
        }

        if self.key.is_some() && self.command.is_empty() {
            return Err("--key requires a command".to_string());
        }

        if self.heartbeat_ms == 0 {
            return Err("--heartbeat must be at least 1".to_string());
        }

        Ok(())
    }
}
