//! Multiplexer configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use super::cli::CliArgs;
use super::command_map::CommandMap;

/// Default key consulted during primary election
pub const DEFAULT_TIEBREAKER: &str = "__mux_tiebreak";

/// Default port when an address omits one
pub const DEFAULT_PORT: u16 = 6379;

/// Server endpoint (host:port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = String;

    /// Parse "host:port", "host" or "[v6]:port"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty address".to_string());
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 address: {}", s))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| format!("invalid port in {}", s))?,
                None => DEFAULT_PORT,
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            // a bare IPv6 literal has several colons and no port
            Some((host, _)) if host.contains(':') => Ok(Self::new(s, DEFAULT_PORT)),
            Some((host, port)) => {
                let port = port.parse().map_err(|_| format!("invalid port in {}", s))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub password: String,
    pub username: Option<String>,
}

/// Proxy in front of the servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Proxy {
    #[default]
    None,
    /// Stateless proxy: no INFO, no election, every endpoint is selectable
    Twemproxy,
}

/// Complete multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    // Endpoints
    pub seeds: Vec<ServerAddress>,
    pub auth: Option<AuthConfig>,
    pub default_database: Option<u32>,
    pub proxy: Proxy,

    // Election
    pub tiebreaker: Option<String>,
    /// Channel used to tell sibling clients that the primary changed
    pub broadcast_channel: Option<String>,

    // Timeouts
    pub sync_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub connect_retry: u32,
    pub abort_on_connect_fail: bool,

    // Liveness
    pub heartbeat_interval_ms: u64,
    pub keep_alive_secs: u64,

    // Dispatch
    pub allow_admin: bool,
    pub preserve_order: bool,
    pub completion_pool_size: usize,
    pub completion_workers: usize,

    /// Resolve DNS only once per endpoint, reusing the address on reconnect
    pub resolve_dns_once: bool,
    pub command_map: CommandMap,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            auth: None,
            default_database: None,
            proxy: Proxy::None,
            tiebreaker: Some(DEFAULT_TIEBREAKER.to_string()),
            broadcast_channel: None,
            sync_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            response_timeout_ms: 5000,
            connect_retry: 3,
            abort_on_connect_fail: true,
            heartbeat_interval_ms: 1000,
            keep_alive_secs: 60,
            allow_admin: false,
            preserve_order: true,
            completion_pool_size: 256,
            completion_workers: 2,
            resolve_dns_once: false,
            command_map: CommandMap::default(),
        }
    }
}

impl MuxConfig {
    /// Configuration for the given seed endpoints with default settings
    pub fn new<I, S>(seeds: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let seeds = seeds
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<ServerAddress>, _>>()?;
        let config = Self {
            seeds,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Create configuration from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, String> {
        args.validate()?;

        let seeds = args
            .hosts
            .iter()
            .map(|h| h.parse())
            .collect::<Result<Vec<ServerAddress>, _>>()?;

        let auth = args.password.as_ref().map(|p| AuthConfig {
            password: p.clone(),
            username: args.username.clone(),
        });

        let tiebreaker = if args.no_tiebreaker {
            None
        } else {
            Some(args.tiebreaker.clone())
        };

        let config = Self {
            seeds,
            auth,
            default_database: args.dbnum,
            proxy: if args.twemproxy {
                Proxy::Twemproxy
            } else {
                Proxy::None
            },
            tiebreaker,
            broadcast_channel: args.broadcast_channel.clone(),
            sync_timeout_ms: args.sync_timeout_ms,
            connect_timeout_ms: args.connect_timeout_ms,
            response_timeout_ms: args.sync_timeout_ms,
            connect_retry: args.connect_retry,
            abort_on_connect_fail: !args.no_abort_connect,
            heartbeat_interval_ms: args.heartbeat_ms,
            keep_alive_secs: args.keep_alive_secs,
            allow_admin: args.allow_admin,
            preserve_order: true,
            resolve_dns_once: args.resolve_dns_once,
            command_map: if args.twemproxy {
                CommandMap::twemproxy()
            } else {
                CommandMap::default()
            },
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate setting combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.seeds.is_empty() {
            return Err("at least one seed endpoint is required".to_string());
        }
        if self.sync_timeout_ms == 0 {
            return Err("sync timeout must be positive".to_string());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat interval must be positive".to_string());
        }
        if self.completion_pool_size == 0 {
            return Err("completion pool size must be at least 1".to_string());
        }
        if let Some(ref key) = self.tiebreaker {
            if key.is_empty() {
                return Err("tie-breaker key must not be empty".to_string());
            }
        }
        Ok(())
    }

    pub fn with_tiebreaker(mut self, key: Option<&str>) -> Self {
        self.tiebreaker = key.map(str::to_string);
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Bounded wait used while collecting discovery replies during reconfiguration
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.min(self.sync_timeout_ms).max(1))
    }
}
