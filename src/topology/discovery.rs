//! Liveness commands and INFO parsing

use crate::config::{CommandMap, ServerAddress};
use crate::node::{NodeRole, ServerKind};
use crate::utils::RespValue;

/// Payload sent with ECHO so the reply can be recognised
pub const ECHO_PAYLOAD: &str = "mux-liveness";

/// Liveness verb, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerb {
    Echo,
    Ping,
    /// GET of the tie-breaker key doubles as the liveness check
    GetTiebreaker,
}

impl LivenessVerb {
    /// First verb the command map allows
    pub fn choose(map: &CommandMap, tiebreaker: Option<&str>) -> Option<Self> {
        if map.is_available("ECHO") {
            Some(LivenessVerb::Echo)
        } else if map.is_available("PING") {
            Some(LivenessVerb::Ping)
        } else if tiebreaker.is_some() && map.is_available("GET") {
            Some(LivenessVerb::GetTiebreaker)
        } else {
            None
        }
    }

    pub fn args<'a>(&self, tiebreaker: Option<&'a str>) -> Vec<&'a str> {
        match self {
            LivenessVerb::Echo => vec!["ECHO", ECHO_PAYLOAD],
            LivenessVerb::Ping => vec!["PING"],
            LivenessVerb::GetTiebreaker => vec!["GET", tiebreaker.unwrap_or_default()],
        }
    }

    /// Reply proves the node is serving commands
    pub fn accepts(&self, reply: &RespValue) -> bool {
        match self {
            LivenessVerb::Echo => reply.as_str() == Some(ECHO_PAYLOAD),
            LivenessVerb::Ping => reply.as_str() == Some("PONG"),
            LivenessVerb::GetTiebreaker => !reply.is_error(),
        }
    }
}

/// Fields of interest from `INFO replication` / `INFO server`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub role: Option<NodeRole>,
    pub kind: Option<ServerKind>,
    /// For replicas: the primary they follow
    pub primary: Option<ServerAddress>,
    pub version: Option<String>,
    pub connected_replicas: Option<u32>,
}

impl ServerInfo {
    pub fn parse(info: &str) -> Self {
        let mut parsed = Self::default();
        let mut primary_host: Option<&str> = None;
        let mut primary_port: Option<u16> = None;

        for line in info.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "role" => {
                    parsed.role = match value {
                        "master" | "primary" => Some(NodeRole::Primary),
                        "slave" | "replica" => Some(NodeRole::Replica),
                        _ => None,
                    }
                }
                "redis_mode" | "server_mode" => {
                    parsed.kind = match value {
                        "standalone" => Some(ServerKind::Standalone),
                        "cluster" => Some(ServerKind::Cluster),
                        "sentinel" => Some(ServerKind::Sentinel),
                        _ => None,
                    }
                }
                "master_host" | "primary_host" => primary_host = Some(value),
                "master_port" | "primary_port" => primary_port = value.parse().ok(),
                "redis_version" | "valkey_version" => parsed.version = Some(value.to_string()),
                "connected_slaves" | "connected_replicas" => {
                    parsed.connected_replicas = value.parse().ok()
                }
                _ => {}
            }
        }

        if parsed.role == Some(NodeRole::Replica) {
            if let (Some(host), Some(port)) = (primary_host, primary_port) {
                parsed.primary = Some(ServerAddress::new(host, port));
            }
        }
        parsed
    }

    /// Fold in a later INFO section
    pub fn merge(&mut self, other: ServerInfo) {
        self.role = other.role.or(self.role);
        self.kind = other.kind.or(self.kind);
        self.primary = other.primary.or(self.primary.take());
        self.version = other.version.or(self.version.take());
        self.connected_replicas = other.connected_replicas.or(self.connected_replicas);
    }
}
