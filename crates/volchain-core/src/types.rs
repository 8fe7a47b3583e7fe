// volchain-core/src/types.rs

/// Token amount
pub type Amount = u64;

/// Per-account transaction counter
pub type Nonce = u64;

/// Block height (genesis state is height 0, the first sealed block is 1)
pub type BlockHeight = u64;

/// Unix time in milliseconds
pub type Timestamp = i64;

/// Chain identifier mixed into every signed payload
pub const CHAIN_ID: &str = "volchain-main";

/// Default validator identity stamped on sealed blocks
pub const DEFAULT_VALIDATOR: &str = "volchain-validator-1";

pub const DEFAULT_MAX_TX_PER_BLOCK: usize = 100;
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_MEMPOOL_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_MEMO_BYTES: usize = 256;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
