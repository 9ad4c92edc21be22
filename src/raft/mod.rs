// Raft consensus module
// Drives the protocol engine through a single-threaded driver loop and
// persists its log and snapshots for crash recovery

pub mod config;
pub mod line;
pub mod memstore;
pub mod node;
pub mod request;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod wal;

// Re-export commonly used types
pub use config::RaftConfig;
pub use memstore::MemStorage;
pub use node::{RaftNode, RaftNodeBuilder};
pub use request::{NodeInfo, Request, RequestId, Response, SeqGen};
pub use snapshot::SnapStore;
pub use storage::DiskStorage;
pub use store::{NullListener, SendFn, StatusChange, StatusListener, Store};
pub use wal::Wal;
