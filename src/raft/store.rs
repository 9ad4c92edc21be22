// Contracts between the node driver and its collaborators: the replicated
// user store, the status listener, and the outbound message transport

use raft::eraftpb::{ConfChange, Message};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::raft::request::NodeInfo;

/// The replicated state machine the node applies committed entries to.
///
/// Implementations must be deterministic and free of side effects outside
/// their own state: no wall clock, no randomness. Two replicas applying the
/// same log prefix must serialize to identical bytes.
pub trait Store: Send + Sync + 'static {
    /// Command carried inside a replicated request.
    type Command: Serialize + DeserializeOwned + Send + 'static;
    /// Reply produced by applying a command; `None` for commands that only
    /// mutate state.
    type Reply: Send + 'static;

    /// Applies one committed command. Errors are returned to the proposer
    /// and never halt the replica.
    fn apply(&self, cmd: Self::Command) -> Result<Option<Self::Reply>, Error>;

    /// Observes a committed membership change. `info` carries the peer's
    /// address when the proposer supplied one, and is empty otherwise.
    fn apply_conf_change(&self, cc: &ConfChange, info: NodeInfo) -> Result<(), Error>;

    /// Serializes the full state for a snapshot.
    fn save(&self) -> Result<Vec<u8>, Error>;

    /// Replaces the full state from a snapshot, atomically.
    fn restore(&self, data: &[u8]) -> Result<(), Error>;
}

/// Cluster status events emitted by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChange {
    LeaderChanged { old: u64, new: u64 },
}

/// Receives status events from the driver thread.
pub trait StatusListener: Send + 'static {
    fn on_status_change(&self, change: StatusChange);
}

/// Listener that ignores every event.
pub struct NullListener;

impl StatusListener for NullListener {
    fn on_status_change(&self, _change: StatusChange) {}
}

/// Outbound transport callback: fire-and-forget delivery of raft messages to
/// peers addressed by node id. Delivery failures are the transport's problem.
pub type SendFn = Box<dyn Fn(Vec<Message>) + Send + 'static>;
