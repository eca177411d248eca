//! Topology discovery and primary election

pub mod coordinator;
pub mod election;
pub mod discovery;
pub mod snapshot;
pub mod worker;

pub use coordinator::CycleReport;
pub use election::{elect, ElectionBallot, ElectionOutcome, Verdict};
pub use discovery::{LivenessVerb, ServerInfo};
pub use snapshot::{DeploymentKind, TopologySnapshot, TopologySummary};
pub use worker::{trigger_channel, ReconfigureTrigger, ReconfigureWorker};
