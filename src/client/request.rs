//! Outgoing request model

use crate::cluster::slot;
use crate::config::{CommandMap, ReadPreference, ServerAddress};
use crate::utils::{MuxError, RespEncoder, Result};

/// Commands that need admin mode
const ADMIN_COMMANDS: &[&str] = &[
    "BGREWRITEAOF",
    "BGSAVE",
    "CLIENT",
    "CLUSTER",
    "CONFIG",
    "DEBUG",
    "FAILOVER",
    "FLUSHALL",
    "FLUSHDB",
    "INFO",
    "KEYS",
    "LASTSAVE",
    "MONITOR",
    "REPLICAOF",
    "SAVE",
    "SHUTDOWN",
    "SLAVEOF",
    "SLOWLOG",
    "SWAPDB",
    "SYNC",
];

/// A single command to route and send
///
/// ```
/// use valkey_mux::{ReadPreference, Request};
///
/// let req = Request::cmd("GET")
///     .key("{user1000}.following")
///     .prefer(ReadPreference::PreferReplica);
/// assert_eq!(req.command_name(), "GET");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    args: Vec<Vec<u8>>,
    /// Indices into `args` holding keys
    key_positions: Vec<usize>,
    preference: ReadPreference,
    redirectable: bool,
    pinned: Option<ServerAddress>,
}

impl Request {
    pub fn cmd(name: &str) -> Self {
        Self {
            args: vec![name.as_bytes().to_vec()],
            key_positions: Vec::new(),
            preference: ReadPreference::default(),
            redirectable: true,
            pinned: None,
        }
    }

    /// Build from raw arguments, treating none of them as keys
    pub fn from_args<I, A>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args: Vec<Vec<u8>> = args.into_iter().map(|a| a.as_ref().to_vec()).collect();
        if args.is_empty() {
            return Err(MuxError::Config("empty command".to_string()));
        }
        Ok(Self {
            args,
            ..Self::cmd("")
        })
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Append a key argument; keys decide the hash slot
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key_positions.push(self.args.len());
        self.args.push(key.as_ref().to_vec());
        self
    }

    pub fn prefer(mut self, preference: ReadPreference) -> Self {
        self.preference = preference;
        self
    }

    /// Do not follow MOVED/ASK for this request
    pub fn no_redirect(mut self) -> Self {
        self.redirectable = false;
        self
    }

    /// Send to this node instead of routing
    pub fn on_node(mut self, address: ServerAddress) -> Self {
        self.pinned = Some(address);
        self
    }

    /// Upper-cased command name
    pub fn command_name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.key_positions.iter().map(|&i| self.args[i].as_slice())
    }

    pub fn preference(&self) -> ReadPreference {
        self.preference
    }

    pub fn is_redirectable(&self) -> bool {
        self.redirectable
    }

    pub fn pinned(&self) -> Option<&ServerAddress> {
        self.pinned.as_ref()
    }

    /// Slot shared by all keys; fails if keys span several slots
    pub fn slot(&self) -> Result<Option<u16>> {
        slot::common_slot(self.keys())
    }

    pub fn is_admin(&self) -> bool {
        let name = self.command_name();
        ADMIN_COMMANDS.contains(&name.as_str())
    }

    /// Encode for the wire, applying command renames
    pub fn encode(&self, map: &CommandMap) -> Vec<u8> {
        let name = self.command_name();
        let wire = map.wire_name(&name);

        let mut encoder = RespEncoder::with_capacity(
            16 + self.args.iter().map(|a| a.len() + 16).sum::<usize>(),
        );
        if wire == name {
            encoder.encode_command(&self.args);
        } else {
            let mut args: Vec<&[u8]> = self.args.iter().map(Vec::as_slice).collect();
            args[0] = wire.as_bytes();
            encoder.encode_command(&args);
        }
        encoder.into_bytes()
    }
}
