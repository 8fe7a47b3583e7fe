// volchain-core/src/block.rs

use crate::{transaction::Transaction, types::*, LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use volchain_crypto::{hash::Hashable, Hash};

/// Block header; one line of the block index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: BlockHeight,
    /// `None` for the first block
    pub prev_hash: Option<Hash>,
    pub hash: Hash,
    /// Seal time in milliseconds, never earlier than the parent's
    pub time: Timestamp,
    #[serde(rename = "txsHash")]
    pub txs_hash: Hash,
    pub validator: String,
    pub count: usize,
}

impl BlockHeader {
    /// `H(prev_hash ‖ height ‖ time ‖ txsHash)` over their decimal/hex text
    pub fn compute_hash(
        prev_hash: Option<&Hash>,
        height: BlockHeight,
        time: Timestamp,
        txs_hash: &Hash,
    ) -> Hash {
        let prev = prev_hash.map(Hash::to_hex).unwrap_or_default();
        format!("{prev}{height}{time}{}", txs_hash.to_hex()).as_str().hash()
    }

    /// Check this header follows `parent` (or genesis when `None`)
    pub fn validate_link(&self, parent: Option<(BlockHeight, Hash)>) -> LedgerResult<()> {
        let (expected_height, expected_prev) = match parent {
            Some((height, hash)) => (height + 1, Some(hash)),
            None => (1, None),
        };
        if self.height != expected_height {
            return Err(LedgerError::Integrity(format!(
                "block height {} does not follow {}",
                self.height,
                expected_height - 1
            )));
        }
        if self.prev_hash != expected_prev {
            return Err(LedgerError::Integrity(format!(
                "block {} prev_hash does not match parent",
                self.height
            )));
        }
        Ok(())
    }
}

/// Full block body, stored once per height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn new(
        height: BlockHeight,
        prev_hash: Option<Hash>,
        time: Timestamp,
        validator: impl Into<String>,
        txs: Vec<Transaction>,
    ) -> LedgerResult<Self> {
        let txs_hash = Self::txs_hash(&txs)?;
        let hash = BlockHeader::compute_hash(prev_hash.as_ref(), height, time, &txs_hash);
        Ok(Self {
            header: BlockHeader {
                height,
                prev_hash,
                hash,
                time,
                txs_hash,
                validator: validator.into(),
                count: txs.len(),
            },
            txs,
        })
    }

    pub fn txs_hash(txs: &[Transaction]) -> LedgerResult<Hash> {
        Ok(serde_json::to_vec(txs)?.hash())
    }

    pub fn height(&self) -> BlockHeight {
        self.header.height
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    /// Recompute the transaction and header hashes
    pub fn verify(&self) -> LedgerResult<()> {
        let height = self.header.height;
        if self.header.count != self.txs.len() {
            return Err(LedgerError::Integrity(format!("block {height} count mismatch")));
        }
        if Self::txs_hash(&self.txs)? != self.header.txs_hash {
            return Err(LedgerError::Integrity(format!("block {height} txsHash mismatch")));
        }
        let expected = BlockHeader::compute_hash(
            self.header.prev_hash.as_ref(),
            height,
            self.header.time,
            &self.header.txs_hash,
        );
        if expected != self.header.hash {
            return Err(LedgerError::Integrity(format!("block {height} hash mismatch")));
        }
        Ok(())
    }
}
