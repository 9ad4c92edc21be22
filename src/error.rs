// Error types for the consensus core and the replicated registry
// Caller-level errors travel back through responses; fatal errors halt the replica

/// Errors surfaced by the consensus core and the registry state machine.
///
/// The first group is returned to callers through responses and never stops
/// the node. The second group is fatal to the replica: the driver loop logs
/// the error and halts rather than risk diverging from the replicated log.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ==================== Caller-level ====================
    #[error("node stopped")]
    Stopped,
    #[error("request canceled")]
    Canceled,
    #[error("invalid command")]
    InvalidCommand,
    #[error("unsupported request")]
    UnsupportedRequest,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("no such hive")]
    NoSuchHive,
    #[error("duplicate hive")]
    DuplicateHive,
    #[error("no such bee")]
    NoSuchBee,
    #[error("duplicate bee")]
    DuplicateBee,
    #[error("cell {cell} of app {app} is locked by another colony")]
    ColonyConflict { app: String, cell: String },

    // ==================== Replica-fatal ====================
    #[error("raft: {0}")]
    Raft(#[from] raft::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("wire: {0}")]
    Wire(#[from] prost::DecodeError),
    #[error("write-ahead log corrupt: {0}")]
    WalCorrupt(String),
    #[error("write-ahead log belongs to node {found}, not {expected}")]
    WalIdMismatch { expected: u64, found: u64 },
    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),
    #[error("first committed index {first} leaves a gap after applied index {applied}")]
    LogGap { first: u64, applied: u64 },
    #[error("conf change context names node {context} but targets node {target}")]
    ConfChangeMismatch { context: u64, target: u64 },
    #[error("unexpected entry type at index {0}")]
    UnexpectedEntry(u64),
}

impl Error {
    /// Whether the error is fatal to the replica rather than returnable to
    /// the caller that issued the request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Raft(_)
                | Error::Io(_)
                | Error::Codec(_)
                | Error::Wire(_)
                | Error::WalCorrupt(_)
                | Error::WalIdMismatch { .. }
                | Error::SnapshotCorrupt(_)
                | Error::LogGap { .. }
                | Error::ConfChangeMismatch { .. }
                | Error::UnexpectedEntry(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::Stopped), "node stopped");
        assert_eq!(format!("{}", Error::NoSuchBee), "no such bee");
        let err = Error::WalIdMismatch {
            expected: 1,
            found: 7,
        };
        assert_eq!(
            format!("{}", err),
            "write-ahead log belongs to node 7, not 1"
        );
    }

    #[test]
    fn test_fatal_split() {
        assert!(!Error::DuplicateBee.is_fatal());
        assert!(!Error::Canceled.is_fatal());
        assert!(Error::LogGap { first: 9, applied: 3 }.is_fatal());
        assert!(Error::WalCorrupt("bad frame".to_string()).is_fatal());
    }
}
