//! Apiary - replicated consensus core for a distributed actor runtime
//!
//! This crate provides:
//! - A raft-driven node that serializes requests and membership changes
//!   into a totally ordered, durably persisted log
//! - A rendezvous layer coupling asynchronous apply events to blocking
//!   proposers
//! - A write-ahead log and snapshot store for crash recovery
//! - The replicated registry of hives, bees, and cell ownership built on
//!   top of the core

pub mod error;
pub mod raft;
pub mod registry;

// Re-export the main surface
pub use crate::error::Error;
pub use crate::raft::{
    NodeInfo, NullListener, RaftConfig, RaftNode, RaftNodeBuilder, Request, RequestId, Response,
    StatusChange, StatusListener, Store,
};
pub use crate::registry::{
    BeeInfo, CellKey, Colony, HiveInfo, MappedCells, Registry, RegistryCommand, RegistryReply,
};
