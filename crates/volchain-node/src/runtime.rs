// volchain-node/src/runtime.rs
use crate::{
    barrier::{Barrier, BarrierMetricsSnapshot, WaitOutcome},
    NodeConfig, NodeError, NodeResult,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use volchain_core::{
    guard, mempool::PoolMetrics, replay, BlockHeader, BundleReceipt, Chain, ChainHead, ChainMetrics, ChainStore,
    Correction, GroundTruth, GuardReport, Ledger, LedgerError, LedgerResult, LegacyEvent, Receipt, SealOutcome, Transaction,
    TxRequest, VerifyReport,
};
use volchain_crypto::{Address, PublicKey};
use volchain_storage::{FileStore, Page};

/// Public account view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountView {
    pub pubkey: PublicKey,
    pub address: Option<Address>,
    pub balance: u64,
    pub staked: u64,
    pub available: u64,
    pub nonce: u64,
}

impl AccountView {
    fn new(pubkey: PublicKey, ledger: &Ledger) -> Self {
        let account = ledger.account(&pubkey);
        Self {
            pubkey,
            address: pubkey.to_address().ok(),
            balance: account.balance,
            staked: account.staked,
            available: account.available(),
            nonce: account.nonce,
        }
    }
}

/// Result of a ledger-first bundle commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed {
        receipt: BundleReceipt,
        seal: WaitOutcome,
        apply: WaitOutcome,
        guard: Option<GuardReport>,
    },
    /// The bundle (or its dig) was already recorded; treat as success
    AlreadyApplied { code: String },
}

#[derive(Debug, Default)]
struct DedupMetrics {
    op_id_dedup_total: AtomicU64,
    dig_id_duplicate_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub chain: ChainMetrics,
    pub pool: PoolMetrics,
    pub barrier: BarrierMetricsSnapshot,
    pub op_id_dedup_total: u64,
    pub dig_id_duplicate_total: u64,
}

pub struct Node {
    config: NodeConfig,
    chain: Arc<Mutex<Chain<FileStore>>>,
    store: FileStore,
    barrier: Barrier,
    dedup: DedupMetrics,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> NodeResult<Self> {
        tracing::info!("Opening chain data at {}", config.data_dir);

        let store = FileStore::open(&config.data_dir)?;
        let chain = Chain::open(store.clone(), config.chain_config())?;
        let barrier = Barrier::new(
            Duration::from_millis(config.barrier.poll_ms),
            Duration::from_millis(config.barrier.timeout_ms),
        );

        tracing::info!(
            "✓ Chain ready: height={}, max_tx_per_block={}, dig_id_mode={:?}",
            chain.head().height,
            config.chain.max_tx_per_block,
            config.ledger.dig_id_mode
        );

        Ok(Self {
            config,
            chain: Arc::new(Mutex::new(chain)),
            store,
            barrier,
            dedup: DedupMetrics::default(),
            producer: Mutex::new(None),
        })
    }

    /// Spawn the timed block producer
    pub async fn start(self: Arc<Self>) -> NodeResult<()> {
        let mut producer = self.producer.lock().await;
        if producer.is_some() {
            return Err(NodeError::AlreadyRunning);
        }

        let period = Duration::from_millis(self.config.producer.interval_ms.max(1));
        let node = self.clone();
        *producer = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = node.seal_now(None).await {
                    tracing::error!("Block production failed: {}", e);
                }
            }
        }));

        tracing::info!(
            "✓ Block producer started: interval={}ms, batch={}",
            self.config.producer.interval_ms,
            self.config.producer.batch
        );
        Ok(())
    }

    pub async fn stop(&self) -> NodeResult<()> {
        tracing::info!("Shutting down node...");
        if let Some(handle) = self.producer.lock().await.take() {
            handle.abort();
        }
        // wake anyone still waiting so they observe the final state
        self.barrier.notify_sealed();
        tracing::info!("Node shutdown complete");
        Ok(())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Run `f` against the chain on the blocking pool. Sealing and enqueueing
    /// fsync, so they stay off the async workers.
    async fn with_chain<T, F>(&self, f: F) -> NodeResult<LedgerResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Chain<FileStore>) -> LedgerResult<T> + Send + 'static,
    {
        let chain = self.chain.clone();
        Ok(tokio::task::spawn_blocking(move || f(&mut chain.blocking_lock())).await?)
    }

    fn note_rejection(&self, e: &LedgerError) {
        match e {
            LedgerError::DuplicateOpId(_) => {
                self.dedup.op_id_dedup_total.fetch_add(1, Ordering::Relaxed);
            }
            LedgerError::DuplicateDigId(_) => {
                self.dedup.dig_id_duplicate_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        tracing::debug!("Rejected transaction: {} ({})", e, e.code());
    }

    // ==================== SUBMISSION ====================

    pub async fn submit(&self, tx: Transaction) -> NodeResult<Receipt> {
        let result = self.with_chain(move |chain| chain.enqueue(tx)).await?;
        result.map_err(|e| {
            self.note_rejection(&e);
            e.into()
        })
    }

    /// Validate a loosely typed request and enqueue it
    pub async fn submit_request(&self, request: TxRequest) -> NodeResult<Receipt> {
        let tx = Transaction::try_from(request)?;
        self.submit(tx).await
    }

    pub async fn submit_bundle(&self, txs: Vec<Transaction>) -> NodeResult<BundleReceipt> {
        let result = self.with_chain(move |chain| chain.enqueue_bundle(txs)).await?;
        result.map_err(|e| {
            self.note_rejection(&e);
            e.into()
        })
    }

    /// Seal one block now; `None` uses the configured batch
    pub async fn seal_now(&self, max_batch: Option<usize>) -> NodeResult<SealOutcome> {
        let batch = max_batch.unwrap_or(self.config.producer.batch);
        let outcome = self.with_chain(move |chain| chain.seal(batch)).await??;
        match &outcome {
            SealOutcome::Sealed(_) | SealOutcome::Empty { .. } => self.barrier.notify_sealed(),
            SealOutcome::RolledBack { reason } => tracing::warn!("Seal rolled back: {}", reason),
            SealOutcome::Idle => {}
        }
        Ok(outcome)
    }

    // ==================== BARRIER ====================

    /// Wait until every `op_id` is recorded in the ledger
    pub async fn wait_until_sealed(&self, op_ids: &[String], timeout: Option<Duration>) -> WaitOutcome {
        let timeout = timeout.unwrap_or_else(|| self.barrier.timeout());
        let chain = &self.chain;
        self.barrier
            .wait_until(timeout, || async move {
                let chain = chain.lock().await;
                op_ids.iter().all(|id| chain.ledger().has_op_id(id))
            })
            .await
    }

    /// Wait until no transaction of the bundle is still pending (sealed, or
    /// dropped at seal time)
    pub async fn wait_until_applied(&self, receipt: &BundleReceipt, timeout: Option<Duration>) -> WaitOutcome {
        let timeout = timeout.unwrap_or_else(|| self.barrier.timeout());
        let chain = &self.chain;
        let hashes = &receipt.tx_hashes;
        self.barrier
            .wait_until(timeout, || async move {
                let chain = chain.lock().await;
                !hashes.iter().any(|h| chain.mempool().contains(h))
            })
            .await
    }

    /// Ledger-first commit: admit the bundle, force a seal, wait for it, and
    /// check the result against ground truth when supplied. Never corrects.
    pub async fn commit_bundle(&self, txs: Vec<Transaction>, truth: Option<&GroundTruth>) -> NodeResult<CommitOutcome> {
        let receipt = match self.submit_bundle(txs).await {
            Ok(receipt) => receipt,
            Err(NodeError::Ledger(e)) if e.is_duplicate() => {
                tracing::info!("Bundle already applied ({})", e.code());
                return Ok(CommitOutcome::AlreadyApplied { code: e.code().to_string() });
            }
            Err(e) => return Err(e),
        };

        let retry = self.barrier.timeout() / 2;
        self.force_seal().await;
        let mut seal = self.wait_until_sealed(&receipt.op_ids, None).await;
        if !seal.ok {
            self.force_seal().await;
            seal = self.wait_until_sealed(&receipt.op_ids, Some(retry)).await;
        }
        let mut apply = self.wait_until_applied(&receipt, None).await;
        if !apply.ok {
            self.force_seal().await;
            apply = self.wait_until_applied(&receipt, Some(retry)).await;
        }

        let guard = match truth {
            Some(truth) => {
                let report = self.guard_check(truth).await;
                if report.has_critical() {
                    tracing::error!("❌ Guard failed after commit: {:?}", report.mismatches);
                    return Err(NodeError::GuardFailed(Box::new(report)));
                }
                Some(report)
            }
            None => None,
        };

        Ok(CommitOutcome::Committed { receipt, seal, apply, guard })
    }

    async fn force_seal(&self) {
        if let Err(e) = self.seal_now(None).await {
            tracing::warn!("Forced seal failed: {}", e);
        }
    }

    // ==================== QUERIES ====================

    /// Look up by hex, base64 or bech32 address
    pub async fn account(&self, key: &str) -> NodeResult<AccountView> {
        let chain = self.chain.lock().await;
        let pubkey = chain.resolve_account(key)?;
        Ok(AccountView::new(pubkey, chain.ledger()))
    }

    pub async fn snapshot(&self) -> Ledger {
        self.chain.lock().await.ledger().clone()
    }

    pub async fn holders(&self, limit: usize) -> Vec<AccountView> {
        let chain = self.chain.lock().await;
        let ledger = chain.ledger();
        ledger
            .holders(limit)
            .into_iter()
            .map(|(key, _)| AccountView::new(key, ledger))
            .collect()
    }

    pub async fn head(&self) -> ChainHead {
        self.chain.lock().await.head()
    }

    pub fn blocks(&self, limit: usize, before: Option<u64>) -> NodeResult<Page<BlockHeader>> {
        Ok(self.store.blocks_page(limit, before)?)
    }

    pub fn events(&self, limit: usize, before: Option<u64>) -> NodeResult<Page<LegacyEvent>> {
        Ok(self.store.events_page(limit, before)?)
    }

    pub async fn metrics(&self) -> NodeMetrics {
        let chain = self.chain.lock().await;
        NodeMetrics {
            chain: chain.metrics().clone(),
            pool: chain.mempool().metrics(),
            barrier: self.barrier.metrics(),
            op_id_dedup_total: self.dedup.op_id_dedup_total.load(Ordering::Relaxed),
            dig_id_duplicate_total: self.dedup.dig_id_duplicate_total.load(Ordering::Relaxed),
        }
    }

    // ==================== AUDIT ====================

    /// Replay sealed history against a point-in-time copy of the ledger.
    /// Does not hold the chain lock while reading history.
    pub async fn verify(&self) -> NodeResult<VerifyReport> {
        let ledger = self.snapshot().await;
        let store = self.store.clone();
        let report = tokio::task::spawn_blocking(move || -> NodeResult<VerifyReport> {
            let blocks = store.load_blocks()?;
            let events = store.load_events()?;
            Ok(replay::verify(&ledger, &blocks, &events))
        })
        .await??;
        if !report.ok {
            tracing::warn!("Replay verification failed: {:?}", report.mismatch);
        }
        Ok(report)
    }

    pub async fn guard_check(&self, truth: &GroundTruth) -> GuardReport {
        let chain = self.chain.lock().await;
        guard::invariant_report(chain.ledger(), truth)
    }

    /// Destructive repair from ground truth; operator use only
    pub async fn guard_correct(&self, truth: &GroundTruth) -> NodeResult<Correction> {
        let truth = truth.clone();
        Ok(self.with_chain(move |chain| chain.auto_correct(&truth)).await??)
    }
}
