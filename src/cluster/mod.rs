//! Cluster routing
//!
//! - Hash slot calculation (CRC16 with hash tags)
//! - CLUSTER NODES parsing and the slot ownership map
//! - MOVED/ASK redirect parsing
//! - Server selection by slot and read preference

pub mod node;
pub mod redirect;
pub mod router;
pub mod shard_map;
pub mod slot;

pub use node::ClusterNodeEntry;
pub use redirect::{is_cluster_down, RedirectInfo, RedirectKind};
pub use router::Router;
pub use shard_map::{ShardMap, SlotRange};
pub use slot::{slot_for_key, TOTAL_SLOTS};
