// volchain-core/src/lib.rs

//! Core ledger engine for Volchain
//!
//! This crate provides:
//! - Transaction model and canonical signing codec
//! - Account state machine (`Ledger`)
//! - In-memory FIFO mempool with byte accounting
//! - Hash-chained blocks and the derived legacy event log
//! - Block producer (`Chain`) over a pluggable `ChainStore`
//! - Invariant guard and replay verifier

pub mod block;
pub mod chain;
pub mod events;
pub mod guard;
pub mod mempool;
pub mod replay;
pub mod state;
pub mod store;
pub mod transaction;
pub mod types;

pub use block::{Block, BlockHeader};
pub use chain::{BundleReceipt, Chain, ChainConfig, ChainMetrics, Receipt, SealOutcome};
pub use events::LegacyEvent;
pub use guard::{
    auto_correct, invariant_report, AccountChange, Correction, GroundTruth, GuardReport, GuardTotals, Mismatch,
    MismatchCode, TruthCounts,
};
pub use mempool::Mempool;
pub use replay::{replay_blocks, replay_events, verify, ReplayMismatch, ReplaySource, VerifyReport};
pub use state::{Account, ChainHead, DigIdMode, Effect, Ledger, LedgerRules};
pub use store::{ChainStore, MemoryStore};
pub use transaction::{Memo, Origin, Reason, Transaction, TxKind, TxRequest};
pub use types::*;

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Coarse grouping of rejections, used by callers to pick a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Ordering,
    Idempotency,
    Insufficiency,
    Capacity,
    Invariant,
    Integrity,
    Storage,
}

/// Errors that can occur in ledger operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Amount must be a positive integer")]
    InvalidAmount,

    #[error("Memo too large: {size} bytes (max {max})")]
    MemoTooLarge { size: usize, max: usize },

    #[error("Bad public key: {0}")]
    BadPubkey(String),

    #[error("Bad destination public key: {0}")]
    BadToPubkey(String),

    #[error("Sender address does not match public key")]
    FromAddressMismatch,

    #[error("Cannot resolve destination account: {0}")]
    ToResolveFailed(String),

    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: Nonce, got: Nonce },

    #[error("Duplicate op_id: {0}")]
    DuplicateOpId(String),

    #[error("Duplicate dig_id: {0}")]
    DuplicateDigId(String),

    #[error("Mint requires a dig_id")]
    DigIdRequired,

    #[error("Insufficient available balance: have {available}, need {required}")]
    InsufficientAvailable { available: Amount, required: Amount },

    #[error("Insufficient stake: have {staked}, need {required}")]
    InsufficientStake { staked: Amount, required: Amount },

    #[error("Mempool full: {current} + {incoming} bytes exceeds {max}")]
    MempoolFull { current: usize, incoming: usize, max: usize },

    #[error("Transaction too large: {size} bytes (max {max})")]
    TxTooLarge { size: usize, max: usize },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Supply invariant violation: supply {supply} != sum of balances {sum}")]
    SupplyInvariantViolation { supply: Amount, sum: u128 },

    #[error("Bad signature")]
    BadSignature,

    #[error("Arithmetic overflow")]
    Overflow,

    #[error("Malformed transaction: {0}")]
    Malformed(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Stable wire code for this rejection
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "invalid_amount",
            LedgerError::MemoTooLarge { .. } => "memo_too_large",
            LedgerError::BadPubkey(_) => "BAD_PUBKEY",
            LedgerError::BadToPubkey(_) => "BAD_TO_PUBKEY",
            LedgerError::FromAddressMismatch => "FROM_ADDRESS_MISMATCH",
            LedgerError::ToResolveFailed(_) => "TO_RESOLVE_FAILED",
            LedgerError::InvalidNonce { .. } => "invalid_nonce",
            LedgerError::DuplicateOpId(_) => "duplicate_op_id",
            LedgerError::DuplicateDigId(_) => "duplicate_dig_id",
            LedgerError::DigIdRequired => "dig_id_required",
            LedgerError::InsufficientAvailable { .. } => "insufficient_available",
            LedgerError::InsufficientStake { .. } => "insufficient_stake",
            LedgerError::MempoolFull { .. } => "mempool_full",
            LedgerError::TxTooLarge { .. } => "tx_too_large",
            LedgerError::InvariantViolation(_) => "invariant_violation",
            LedgerError::SupplyInvariantViolation { .. } => "supply_invariant_violation",
            LedgerError::BadSignature => "bad_signature",
            LedgerError::Overflow => "overflow",
            LedgerError::Malformed(_) => "malformed",
            LedgerError::Integrity(_) => "integrity_error",
            LedgerError::Storage(_) => "storage_error",
            LedgerError::Serialization(_) => "serialization_error",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InvalidAmount
            | LedgerError::MemoTooLarge { .. }
            | LedgerError::BadPubkey(_)
            | LedgerError::BadToPubkey(_)
            | LedgerError::FromAddressMismatch
            | LedgerError::ToResolveFailed(_)
            | LedgerError::DigIdRequired
            | LedgerError::Overflow
            | LedgerError::Malformed(_) => ErrorClass::Validation,
            LedgerError::InvalidNonce { .. } => ErrorClass::Ordering,
            LedgerError::DuplicateOpId(_) | LedgerError::DuplicateDigId(_) => ErrorClass::Idempotency,
            LedgerError::InsufficientAvailable { .. } | LedgerError::InsufficientStake { .. } => {
                ErrorClass::Insufficiency
            }
            LedgerError::MempoolFull { .. } | LedgerError::TxTooLarge { .. } => ErrorClass::Capacity,
            LedgerError::InvariantViolation(_) | LedgerError::SupplyInvariantViolation { .. } => {
                ErrorClass::Invariant
            }
            LedgerError::BadSignature | LedgerError::Integrity(_) => ErrorClass::Integrity,
            LedgerError::Storage(_) | LedgerError::Serialization(_) => ErrorClass::Storage,
        }
    }

    /// Idempotency rejections mean the effect already happened
    pub fn is_duplicate(&self) -> bool {
        self.class() == ErrorClass::Idempotency
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(LedgerError::InvalidAmount.code(), "invalid_amount");
        assert_eq!(LedgerError::BadPubkey("x".into()).code(), "BAD_PUBKEY");
        assert_eq!(LedgerError::FromAddressMismatch.code(), "FROM_ADDRESS_MISMATCH");
        assert_eq!(
            LedgerError::MempoolFull { current: 1, incoming: 1, max: 1 }.code(),
            "mempool_full"
        );
    }

    #[test]
    fn test_duplicate_classification() {
        assert!(LedgerError::DuplicateOpId("a".into()).is_duplicate());
        assert!(LedgerError::DuplicateDigId("a".into()).is_duplicate());
        assert!(!LedgerError::InvalidNonce { expected: 1, got: 2 }.is_duplicate());
        assert_eq!(
            LedgerError::SupplyInvariantViolation { supply: 1, sum: 2 }.class(),
            ErrorClass::Invariant
        );
    }
}
