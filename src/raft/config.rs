// Raft node configuration
// Tick counts, snapshot threshold, and the on-disk layout of one replica

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::error::Error;

/// Configuration for one consensus replica.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Ticks without leader contact before a follower starts an election.
    pub election_tick: usize,

    /// Ticks between leader heartbeats.
    pub heartbeat_tick: usize,

    /// Log entries applied beyond the last snapshot before a new snapshot is
    /// taken and the log compacted.
    pub snapshot_count: u64,

    /// Interval of the logical clock driving the tick counts.
    pub tick_interval_ms: u64,

    /// Upper bound on the payload of a single append message.
    pub max_size_per_msg: u64,

    /// In-flight append messages allowed per follower.
    pub max_inflight_msgs: usize,

    /// Data directory; `wal/` and `snap/` live underneath it.
    pub data_dir: PathBuf,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_tick: 10,
            heartbeat_tick: 1,
            snapshot_count: 10_000,
            tick_interval_ms: 100,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            data_dir: PathBuf::from("./data/raft"),
        }
    }
}

impl RaftConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Ticker running at the configured interval. Tests pass a manual
    /// channel instead to single-step or pause the logical clock.
    pub fn ticker(&self) -> Receiver<Instant> {
        crossbeam_channel::tick(self.tick_interval())
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snap")
    }

    /// The engine-facing configuration for this replica.
    pub fn to_engine_config(&self, id: u64) -> Result<raft::Config, Error> {
        let cfg = raft::Config {
            id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            ..Default::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
