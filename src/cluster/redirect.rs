//! MOVED / ASK redirect parsing

use crate::config::ServerAddress;
use crate::utils::RespValue;

/// Kind of ownership redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Slot permanently owned elsewhere; the shard map is stale
    Moved,
    /// Slot is migrating; retry once on the target with ASKING
    Ask,
}

/// Redirect information parsed from MOVED/ASK error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    pub kind: RedirectKind,
    pub slot: u16,
    pub address: ServerAddress,
}

impl RedirectInfo {
    /// Parse from error message like "MOVED 3999 127.0.0.1:7001" or "ASK 3999 127.0.0.1:7001"
    ///
    /// An empty host (`MOVED 3999 :7001`) means "same host as the node that
    /// replied", which the caller supplies as `replied_host`.
    pub fn parse(error_msg: &str, replied_host: &str) -> Option<Self> {
        let mut parts = error_msg.split_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };

        let slot: u16 = parts.next()?.parse().ok()?;
        let (host, port) = parts.next()?.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let host = if host.is_empty() { replied_host } else { host };

        Some(Self {
            kind,
            slot,
            address: ServerAddress::new(host, port),
        })
    }

    /// Parse from a reply value, if it is a redirect error
    pub fn from_reply(reply: &RespValue, replied_host: &str) -> Option<Self> {
        match reply {
            RespValue::Error(e) if e.starts_with("MOVED ") || e.starts_with("ASK ") => {
                Self::parse(e, replied_host)
            }
            _ => None,
        }
    }
}

/// Check if CLUSTERDOWN error
pub fn is_cluster_down(error_msg: &str) -> bool {
    error_msg.starts_with("CLUSTERDOWN")
}
