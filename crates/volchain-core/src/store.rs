// volchain-core/src/store.rs

use crate::{block::Block, events::LegacyEvent, state::Ledger, transaction::Transaction, LedgerError, LedgerResult};
use std::sync::{Arc, Mutex, MutexGuard};

/// Persistence seam for the block producer.
///
/// Whole-record writes (`write_snapshot`, `rewrite_mempool`, the body half
/// of `persist_block`) must be atomic. Appends must be durable before they
/// return.
pub trait ChainStore {
    fn load_snapshot(&self) -> LedgerResult<Option<Ledger>>;
    fn write_snapshot(&self, ledger: &Ledger) -> LedgerResult<()>;

    fn load_mempool(&self) -> LedgerResult<Vec<Transaction>>;
    fn append_mempool(&self, txs: &[Transaction]) -> LedgerResult<()>;
    fn rewrite_mempool(&self, txs: &[Transaction]) -> LedgerResult<()>;

    /// Append the header to the block index and store the full body
    fn persist_block(&self, block: &Block) -> LedgerResult<()>;
    fn load_blocks(&self) -> LedgerResult<Vec<Block>>;

    fn append_events(&self, events: &[LegacyEvent]) -> LedgerResult<()>;
    fn load_events(&self) -> LedgerResult<Vec<LegacyEvent>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: Option<Ledger>,
    mempool: Vec<Transaction>,
    blocks: Vec<Block>,
    events: Vec<LegacyEvent>,
}

/// In-memory store; clones share state, which lets tests "restart" a chain
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::Storage("memory store poisoned".into()))
    }

    /// Seed the stored snapshot directly
    pub fn put_snapshot(&self, ledger: Ledger) -> LedgerResult<()> {
        self.lock()?.snapshot = Some(ledger);
        Ok(())
    }
}

impl ChainStore for MemoryStore {
    fn load_snapshot(&self) -> LedgerResult<Option<Ledger>> {
        Ok(self.lock()?.snapshot.clone())
    }

    fn write_snapshot(&self, ledger: &Ledger) -> LedgerResult<()> {
        self.lock()?.snapshot = Some(ledger.clone());
        Ok(())
    }

    fn load_mempool(&self) -> LedgerResult<Vec<Transaction>> {
        Ok(self.lock()?.mempool.clone())
    }

    fn append_mempool(&self, txs: &[Transaction]) -> LedgerResult<()> {
        self.lock()?.mempool.extend_from_slice(txs);
        Ok(())
    }

    fn rewrite_mempool(&self, txs: &[Transaction]) -> LedgerResult<()> {
        self.lock()?.mempool = txs.to_vec();
        Ok(())
    }

    fn persist_block(&self, block: &Block) -> LedgerResult<()> {
        self.lock()?.blocks.push(block.clone());
        Ok(())
    }

    fn load_blocks(&self) -> LedgerResult<Vec<Block>> {
        Ok(self.lock()?.blocks.clone())
    }

    fn append_events(&self, events: &[LegacyEvent]) -> LedgerResult<()> {
        self.lock()?.events.extend_from_slice(events);
        Ok(())
    }

    fn load_events(&self) -> LedgerResult<Vec<LegacyEvent>> {
        Ok(self.lock()?.events.clone())
    }
}
