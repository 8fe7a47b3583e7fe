// volchain-core/src/mempool.rs

use crate::{transaction::Transaction, LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use volchain_crypto::Hash;

/// Pool metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pending_count: usize,
    pub pending_bytes: usize,
    pub total_added: u64,
    pub total_drained: u64,
    pub total_requeued: u64,
}

#[derive(Debug, Clone)]
struct PoolEntry {
    transaction: Transaction,
    hash: Hash,
    /// Bytes this entry occupies in the backing file, newline included
    size: usize,
}

impl PoolEntry {
    fn new(transaction: Transaction) -> LedgerResult<Self> {
        Ok(Self { hash: transaction.hash()?, size: transaction.encoded_len()?, transaction })
    }
}

/// FIFO queue of accepted but unsealed transactions.
///
/// Only the in-memory mirror lives here; the owner is responsible for
/// appending to the backing file before `push` and rewriting it after
/// `drain`.
#[derive(Debug, Clone)]
pub struct Mempool {
    entries: VecDeque<PoolEntry>,
    bytes: usize,
    max_bytes: usize,
    metrics: PoolMetrics,
}

impl Mempool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            max_bytes,
            metrics: PoolMetrics::default(),
        }
    }

    /// Reject with `MempoolFull` if `incoming` more bytes would not fit
    pub fn check_capacity(&self, incoming: usize) -> LedgerResult<()> {
        if self.bytes.saturating_add(incoming) > self.max_bytes {
            return Err(LedgerError::MempoolFull {
                current: self.bytes,
                incoming,
                max: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Append after the capacity check
    pub fn push(&mut self, transaction: Transaction) -> LedgerResult<()> {
        let entry = PoolEntry::new(transaction)?;
        self.check_capacity(entry.size)?;
        self.push_entry(entry);
        self.metrics.total_added += 1;
        Ok(())
    }

    /// Append without a capacity check; used when reloading from disk
    pub fn restore(&mut self, transaction: Transaction) -> LedgerResult<()> {
        let entry = PoolEntry::new(transaction)?;
        self.push_entry(entry);
        Ok(())
    }

    fn push_entry(&mut self, entry: PoolEntry) {
        self.bytes += entry.size;
        self.entries.push_back(entry);
    }

    /// Remove up to `max_count` entries from the head, stopping before the
    /// entry that would exceed `max_bytes`. The head entry is always taken
    /// so an oversized transaction cannot wedge the queue.
    pub fn drain(&mut self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let mut out = Vec::new();
        let mut used = 0usize;
        while out.len() < max_count {
            let Some(front) = self.entries.front() else { break };
            if !out.is_empty() && used + front.size > max_bytes {
                break;
            }
            let Some(entry) = self.entries.pop_front() else { break };
            used += entry.size;
            self.bytes -= entry.size;
            out.push(entry.transaction);
        }
        self.metrics.total_drained += out.len() as u64;
        out
    }

    /// Put a drained batch back at the head, preserving its order
    pub fn requeue_front(&mut self, batch: Vec<Transaction>) -> LedgerResult<()> {
        let mut sized = Vec::with_capacity(batch.len());
        for transaction in batch {
            sized.push(PoolEntry::new(transaction)?);
        }
        self.metrics.total_requeued += sized.len() as u64;
        for entry in sized.into_iter().rev() {
            self.bytes += entry.size;
            self.entries.push_front(entry);
        }
        Ok(())
    }

    /// Whether a transaction with this hash is still pending
    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.iter().any(|e| &e.hash == hash)
    }

    /// Drop every entry whose hash is in `hashes`, returning how many went
    pub fn remove_hashes(&mut self, hashes: &HashSet<Hash>) -> usize {
        let before = self.entries.len();
        let mut bytes = 0;
        self.entries.retain(|e| {
            let keep = !hashes.contains(&e.hash);
            if keep {
                bytes += e.size;
            }
            keep
        });
        self.bytes = bytes;
        before - self.entries.len()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.entries.iter().map(|e| e.transaction.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.iter().map(|e| &e.transaction)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            pending_count: self.entries.len(),
            pending_bytes: self.bytes,
            ..self.metrics.clone()
        }
    }
}
