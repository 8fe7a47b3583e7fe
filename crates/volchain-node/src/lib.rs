// volchain-node/src/lib.rs

//! Volchain node
//!
//! This crate provides:
//! - TOML configuration with `VOLCHAIN_*` environment overrides
//! - The async `Node` runtime (timed producer, submission, queries)
//! - Barrier waits that let callers observe sealing
//! - Ledger-first bundle commits with an Invariant Guard check

pub mod barrier;
pub mod config;
pub mod runtime;

pub use barrier::{Barrier, BarrierMetricsSnapshot, WaitOutcome};
pub use config::NodeConfig;
pub use runtime::{AccountView, CommitOutcome, Node, NodeMetrics};

use volchain_core::{GuardReport, LedgerError};
use volchain_storage::StorageError;

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Guard failed with {} mismatches", .0.mismatches.len())]
    GuardFailed(Box<GuardReport>),

    #[error("Block producer already running")]
    AlreadyRunning,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl NodeError {
    /// Stable wire code
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::Ledger(e) => e.code(),
            NodeError::Storage(_) => "storage_error",
            NodeError::GuardFailed(_) => "guard_failed",
            NodeError::AlreadyRunning => "already_running",
            NodeError::Task(_) => "task_failed",
        }
    }
}
