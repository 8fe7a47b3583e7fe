// volchain-core/src/chain.rs

use crate::{
    block::{Block, BlockHeader},
    events::{self, LegacyEvent},
    guard::{self, Correction, GroundTruth},
    mempool::Mempool,
    state::{Account, ChainHead, DigIdMode, Effect, Ledger, LedgerRules},
    store::ChainStore,
    transaction::Transaction,
    types::*,
    LedgerError, LedgerResult,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};
use volchain_crypto::{resolve_key, Address, Hash, PublicKey};

/// Block production limits and validation rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub validator: String,
    pub max_tx_per_block: usize,
    pub max_block_bytes: usize,
    pub max_mempool_bytes: usize,
    pub rules: LedgerRules,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            validator: DEFAULT_VALIDATOR.to_string(),
            max_tx_per_block: DEFAULT_MAX_TX_PER_BLOCK,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            max_mempool_bytes: DEFAULT_MAX_MEMPOOL_BYTES,
            rules: LedgerRules::default(),
        }
    }
}

/// Chain metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainMetrics {
    pub blocks_sealed: u64,
    pub txs_sealed: u64,
    pub txs_dropped: u64,
    pub rollbacks: u64,
    pub blocks_rolled_forward: u64,
}

/// Acknowledgement for one accepted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub op_id: Option<String>,
}

/// Acknowledgement for an atomically admitted bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleReceipt {
    pub tx_hashes: Vec<Hash>,
    pub op_ids: Vec<String>,
    pub bundle_size: usize,
}

/// Result of one sealing pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealOutcome {
    /// Mempool was empty
    Idle,
    Sealed(BlockHeader),
    /// Every drained transaction failed re-validation and was dropped
    Empty { dropped: usize },
    /// Invariant check failed; the batch went back to the mempool head
    RolledBack { reason: String },
}

/// Single-writer block producer: owns the ledger, the mempool mirror and
/// the store. Callers serialize access (one `&mut Chain` at a time).
pub struct Chain<S: ChainStore> {
    store: S,
    config: ChainConfig,
    ledger: Ledger,
    mempool: Mempool,
    metrics: ChainMetrics,
    /// Events of a sealed block that failed to reach the log
    unlogged: Vec<LegacyEvent>,
    /// Stored mempool and snapshot lag the in-memory state
    stale: bool,
}

impl<S: ChainStore> Chain<S> {
    /// Load persisted state, rolling the snapshot forward over any block
    /// sealed after it was last written
    pub fn open(store: S, config: ChainConfig) -> LedgerResult<Self> {
        let mut ledger = store.load_snapshot()?.unwrap_or_default();
        let mut metrics = ChainMetrics::default();

        let blocks = store.load_blocks()?;
        let mut sealed: HashSet<Hash> = HashSet::new();
        let pending: Vec<&Block> = blocks.iter().filter(|b| b.height() > ledger.height()).collect();
        if !pending.is_empty() {
            let mut logged_through = store.load_events()?.last().map_or(0, |e| e.id);
            for block in pending {
                let head = ledger.head();
                block.verify()?;
                block
                    .header
                    .validate_link(head.last_block_hash.map(|h| (head.height, h)))?;

                let mut trial = ledger.clone_for_trial();
                let mut effects = Vec::with_capacity(block.txs.len());
                for tx in &block.txs {
                    effects.push(trial.apply(tx, &LedgerRules::replay())?);
                    sealed.insert(tx.hash()?);
                }
                trial.check_invariants()?;

                let (last_id, last_hash) = trial.last_event();
                let projected = events::project_block(block, &effects, last_id, last_hash)?;
                let missing: Vec<_> = projected.iter().filter(|e| e.id > logged_through).cloned().collect();
                if !missing.is_empty() {
                    store.append_events(&missing)?;
                }
                if let Some(last) = projected.last() {
                    logged_through = logged_through.max(last.id);
                    trial.set_last_event(last.id, last.hash);
                }
                trial.set_head(block.height(), block.hash(), block.header.time);
                ledger.commit(trial);
                metrics.blocks_rolled_forward += 1;
                info!("⏩ Rolled snapshot forward to block #{}", block.height());
            }
            store.write_snapshot(&ledger)?;
        }

        if let Err(e) = ledger.check_invariants() {
            warn!("Snapshot loaded with broken invariant: {}", e);
        }

        let mut mempool = Mempool::new(config.max_mempool_bytes);
        for tx in store.load_mempool()? {
            mempool.restore(tx)?;
        }
        let removed = mempool.remove_hashes(&sealed);
        if removed > 0 {
            info!("Dropped {} already-sealed mempool entries", removed);
            store.rewrite_mempool(&mempool.transactions())?;
        }

        info!(
            "Chain opened at height {} with {} pending transactions",
            ledger.height(),
            mempool.len()
        );

        Ok(Self { store, config, ledger, mempool, metrics, unlogged: Vec::new(), stale: false })
    }

    /// Signature plus full state-machine validation against the current
    /// snapshot
    pub fn prevalidate(&self, tx: &Transaction) -> LedgerResult<Effect> {
        if !tx.verify_signature() {
            return Err(LedgerError::BadSignature);
        }
        let effect = self.ledger.validate(tx, &self.config.rules)?;
        if self.config.rules.dig_id_mode == DigIdMode::Shadow && tx.missing_dig_id() {
            warn!("[dig_id shadow] mint without dig_id accepted (op_id {:?})", tx.op_id());
        }
        Ok(effect)
    }

    fn check_size(&self, tx: &Transaction) -> LedgerResult<usize> {
        let size = tx.encoded_len()?;
        if size > self.config.max_block_bytes {
            return Err(LedgerError::TxTooLarge { size, max: self.config.max_block_bytes });
        }
        Ok(size)
    }

    /// Validate, durably append, then queue one transaction
    pub fn enqueue(&mut self, tx: Transaction) -> LedgerResult<Receipt> {
        self.prevalidate(&tx)?;
        let size = self.check_size(&tx)?;
        self.mempool.check_capacity(size)?;

        self.store.append_mempool(std::slice::from_ref(&tx))?;
        let receipt = Receipt { tx_hash: tx.hash()?, op_id: tx.memo.op_id.clone() };
        self.mempool.push(tx)?;

        debug!("Enqueued tx {} ({} pending)", receipt.tx_hash, self.mempool.len());
        Ok(receipt)
    }

    /// Admit a bundle all-or-nothing. The bundle is trial-applied in order
    /// on a copy of the ledger before anything is written.
    pub fn enqueue_bundle(&mut self, txs: Vec<Transaction>) -> LedgerResult<BundleReceipt> {
        if txs.is_empty() {
            return Err(LedgerError::Malformed("empty bundle".into()));
        }

        let mut trial = self.ledger.clone_for_trial();
        let mut total = 0usize;
        for tx in &txs {
            if !tx.verify_signature() {
                return Err(LedgerError::BadSignature);
            }
            trial.apply(tx, &self.config.rules)?;
            total += self.check_size(tx)?;
        }
        trial.check_invariants()?;
        self.mempool.check_capacity(total)?;

        self.store.append_mempool(&txs)?;
        let mut receipt = BundleReceipt {
            tx_hashes: Vec::with_capacity(txs.len()),
            op_ids: Vec::new(),
            bundle_size: txs.len(),
        };
        for tx in txs {
            receipt.tx_hashes.push(tx.hash()?);
            if let Some(op_id) = tx.op_id() {
                receipt.op_ids.push(op_id.to_string());
            }
            self.mempool.push(tx)?;
        }

        debug!("Enqueued bundle of {} ({} pending)", receipt.bundle_size, self.mempool.len());
        Ok(receipt)
    }

    /// Drain up to `max_batch` transactions and seal them into a block
    pub fn seal(&mut self, max_batch: usize) -> LedgerResult<SealOutcome> {
        self.finish_persist()?;
        if self.mempool.is_empty() {
            return Ok(SealOutcome::Idle);
        }

        let limit = max_batch.min(self.config.max_tx_per_block).max(1);
        let batch = self.mempool.drain(limit, self.config.max_block_bytes);

        let mut trial = self.ledger.clone_for_trial();
        let mut included = Vec::with_capacity(batch.len());
        let mut effects = Vec::with_capacity(batch.len());
        let mut dropped = 0usize;
        for tx in &batch {
            if !tx.verify_signature() {
                warn!("Dropping tx with bad signature (op_id {:?})", tx.op_id());
                dropped += 1;
                continue;
            }
            match trial.apply(tx, &self.config.rules) {
                Ok(effect) => {
                    included.push(tx.clone());
                    effects.push(effect);
                }
                Err(e) => {
                    warn!("Dropping tx at seal: {} ({})", e, e.code());
                    dropped += 1;
                }
            }
        }

        if let Err(e) = trial.check_invariants() {
            error!("❌ Invariant violation, rolling back batch of {}: {}", batch.len(), e);
            self.mempool.requeue_front(batch)?;
            self.metrics.rollbacks += 1;
            return Ok(SealOutcome::RolledBack { reason: e.to_string() });
        }

        self.metrics.txs_dropped += dropped as u64;
        if included.is_empty() {
            self.store.rewrite_mempool(&self.mempool.transactions())?;
            return Ok(SealOutcome::Empty { dropped });
        }

        let head = self.ledger.head();
        let height = head.height + 1;
        let time = now_millis().max(head.last_block_time);
        let block = Block::new(height, head.last_block_hash, time, self.config.validator.clone(), included)?;

        let (last_id, last_hash) = trial.last_event();
        let events = events::project_block(&block, &effects, last_id, last_hash)?;
        if let Some(last) = events.last() {
            trial.set_last_event(last.id, last.hash);
        }
        trial.set_head(height, block.hash(), time);

        if let Err(e) = self.store.persist_block(&block) {
            self.mempool.requeue_front(batch)?;
            return Err(e);
        }
        // The block is durable: the ledger adopts it even if a later write
        // fails, and the snapshot is never written ahead of the event log.
        self.ledger.commit(trial);
        self.metrics.blocks_sealed += 1;
        self.metrics.txs_sealed += block.txs.len() as u64;
        self.stale = true;
        if let Err(e) = self.store.append_events(&events) {
            error!("❌ Block #{} sealed but its events were not logged: {}", height, e);
            self.unlogged = events;
            return Err(e);
        }
        self.finish_persist()?;

        info!(
            "✓ Sealed block #{} with {} txs ({} dropped, {} pending)",
            height,
            block.header.count,
            dropped,
            self.mempool.len()
        );
        Ok(SealOutcome::Sealed(block.header))
    }

    /// Complete the persistence of the last sealed block: log any events
    /// that failed to append, then rewrite the mempool and the snapshot
    fn finish_persist(&mut self) -> LedgerResult<()> {
        if !self.unlogged.is_empty() {
            // an append that failed part-way may have written a prefix
            let logged_through = self.store.load_events()?.last().map_or(0, |e| e.id);
            let missing: Vec<_> = self.unlogged.iter().filter(|e| e.id > logged_through).cloned().collect();
            if !missing.is_empty() {
                self.store.append_events(&missing)?;
            }
            info!("Logged {} deferred events", missing.len());
            self.unlogged.clear();
        }
        if self.stale {
            self.store.rewrite_mempool(&self.mempool.transactions())?;
            self.store.write_snapshot(&self.ledger)?;
            self.stale = false;
        }
        Ok(())
    }

    /// Repair the ledger from external ground truth and persist it.
    /// Destructive; meant for operator use only.
    pub fn auto_correct(&mut self, truth: &GroundTruth) -> LedgerResult<Correction> {
        self.finish_persist()?;
        let mut trial = self.ledger.clone_for_trial();
        let correction = guard::auto_correct(&mut trial, truth);
        trial.check_invariants()?;
        self.store.write_snapshot(&trial)?;
        self.ledger.commit(trial);
        warn!(
            "Auto-correct applied: {} accounts changed, supply {} -> {}",
            correction.changes.len(),
            correction.supply_before,
            correction.supply_after
        );
        Ok(correction)
    }

    /// Resolve a user-supplied key or address to an account key. Addresses
    /// are matched against known accounts first.
    pub fn resolve_account(&self, input: &str) -> LedgerResult<PublicKey> {
        if let Ok(address) = Address::parse(input.trim()) {
            if let Some(key) = self.ledger.find_by_address(&address) {
                return Ok(key);
            }
        }
        resolve_key(input).map_err(|e| LedgerError::BadPubkey(e.to_string()))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn head(&self) -> ChainHead {
        self.ledger.head()
    }

    pub fn account(&self, key: &PublicKey) -> Account {
        self.ledger.account(key)
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ChainMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
