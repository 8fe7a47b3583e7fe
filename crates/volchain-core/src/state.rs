// volchain-core/src/state.rs

use crate::{
    transaction::{Origin, Transaction, TxKind},
    types::*,
    LedgerError, LedgerResult,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use volchain_crypto::{Address, Hash, PublicKey};

/// How strictly mints are required to carry a dig_id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigIdMode {
    /// Missing dig_ids are reported but accepted
    #[default]
    Shadow,
    /// Missing dig_ids are rejected
    Enforce,
}

impl FromStr for DigIdMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shadow" => Ok(DigIdMode::Shadow),
            "enforce" => Ok(DigIdMode::Enforce),
            other => Err(format!("unknown dig_id mode: {other}")),
        }
    }
}

/// Validation knobs applied on top of the fixed state-machine rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRules {
    pub max_memo_bytes: usize,
    pub dig_id_mode: DigIdMode,
}

impl Default for LedgerRules {
    fn default() -> Self {
        Self {
            max_memo_bytes: DEFAULT_MAX_MEMO_BYTES,
            dig_id_mode: DigIdMode::Shadow,
        }
    }
}

impl LedgerRules {
    /// Rules for re-applying already sealed history
    pub fn replay() -> Self {
        Self {
            max_memo_bytes: usize::MAX,
            dig_id_mode: DigIdMode::Shadow,
        }
    }
}

/// Read-only view of one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: Amount,
    pub staked: Amount,
    pub nonce: Nonce,
}

impl Account {
    pub fn available(&self) -> Amount {
        self.balance.saturating_sub(self.staked)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct AccountMeta {
    nonce: Nonce,
}

/// Height and tip of the sealed chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHead {
    pub height: BlockHeight,
    pub last_block_hash: Option<Hash>,
    pub last_block_time: Timestamp,
}

/// State change produced by one applied transaction. Also the payload of
/// the legacy event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Effect {
    Mint { to: PublicKey, amount: Amount },
    Burn { from: PublicKey, amount: Amount },
    Transfer { from: PublicKey, to: PublicKey, amount: Amount },
    Stake { account: PublicKey, amount: Amount },
    Unstake { account: PublicKey, amount: Amount },
    Attack { attacker: PublicKey, defender: PublicKey },
}

/// Pending writes for one transaction, computed against a read-through
/// overlay so that aliased accounts (self-transfer, self-attack) net out.
struct Plan {
    balances: BTreeMap<PublicKey, Amount>,
    staked: BTreeMap<PublicKey, Amount>,
    nonce_bump: Option<PublicKey>,
    supply: Amount,
    effect: Effect,
}

struct Overlay<'a> {
    ledger: &'a Ledger,
    balances: BTreeMap<PublicKey, Amount>,
    staked: BTreeMap<PublicKey, Amount>,
}

impl<'a> Overlay<'a> {
    fn new(ledger: &'a Ledger) -> Self {
        Self { ledger, balances: BTreeMap::new(), staked: BTreeMap::new() }
    }

    fn balance(&self, key: &PublicKey) -> Amount {
        self.balances.get(key).copied().unwrap_or_else(|| self.ledger.balance_of(key))
    }

    fn staked(&self, key: &PublicKey) -> Amount {
        self.staked.get(key).copied().unwrap_or_else(|| self.ledger.staked_of(key))
    }

    fn available(&self, key: &PublicKey) -> Amount {
        self.balance(key).saturating_sub(self.staked(key))
    }

    fn require_available(&self, key: &PublicKey, required: Amount) -> LedgerResult<()> {
        let available = self.available(key);
        if available < required {
            return Err(LedgerError::InsufficientAvailable { available, required });
        }
        Ok(())
    }

    fn credit(&mut self, key: &PublicKey, amount: Amount) -> LedgerResult<()> {
        let next = self.balance(key).checked_add(amount).ok_or(LedgerError::Overflow)?;
        self.balances.insert(*key, next);
        Ok(())
    }

    fn debit(&mut self, key: &PublicKey, amount: Amount) -> LedgerResult<()> {
        let next = self.balance(key).checked_sub(amount).ok_or(LedgerError::Overflow)?;
        self.balances.insert(*key, next);
        Ok(())
    }

    fn lock(&mut self, key: &PublicKey, amount: Amount) -> LedgerResult<()> {
        let next = self.staked(key).checked_add(amount).ok_or(LedgerError::Overflow)?;
        self.staked.insert(*key, next);
        Ok(())
    }

    fn unlock(&mut self, key: &PublicKey, amount: Amount) -> LedgerResult<()> {
        let staked = self.staked(key);
        if staked < amount {
            return Err(LedgerError::InsufficientStake { staked, required: amount });
        }
        self.staked.insert(*key, staked - amount);
        Ok(())
    }
}

/// The authoritative account state. All mutation goes through `apply`
/// (one transaction) or `commit` (adopt a trial copy).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    #[serde(default)]
    balances: BTreeMap<PublicKey, Amount>,
    #[serde(default)]
    staked: BTreeMap<PublicKey, Amount>,
    #[serde(default)]
    accounts: BTreeMap<PublicKey, AccountMeta>,
    #[serde(default)]
    used_op_ids: BTreeSet<String>,
    #[serde(default)]
    used_dig_ids: BTreeSet<String>,
    #[serde(default)]
    supply: Amount,
    #[serde(default)]
    height: BlockHeight,
    #[serde(default)]
    last_block_hash: Option<Hash>,
    #[serde(default)]
    last_block_time: Timestamp,
    #[serde(default)]
    last_event_id: u64,
    #[serde(default)]
    last_event_hash: Option<Hash>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent copy for trial application
    pub fn clone_for_trial(&self) -> Self {
        self.clone()
    }

    /// Adopt a trial copy that has passed `check_invariants`
    pub fn commit(&mut self, trial: Ledger) {
        *self = trial;
    }

    /// Apply one transaction. On error nothing is mutated.
    pub fn apply(&mut self, tx: &Transaction, rules: &LedgerRules) -> LedgerResult<Effect> {
        let plan = self.plan(tx, rules)?;
        Ok(self.write_plan(tx, plan))
    }

    /// Run every check `apply` would, without mutating
    pub fn validate(&self, tx: &Transaction, rules: &LedgerRules) -> LedgerResult<Effect> {
        self.plan(tx, rules).map(|plan| plan.effect)
    }

    fn plan(&self, tx: &Transaction, rules: &LedgerRules) -> LedgerResult<Plan> {
        if tx.amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let memo_len = tx.memo.encoded_len()?;
        if memo_len > rules.max_memo_bytes {
            return Err(LedgerError::MemoTooLarge { size: memo_len, max: rules.max_memo_bytes });
        }

        if rules.dig_id_mode == DigIdMode::Enforce && tx.missing_dig_id() {
            return Err(LedgerError::DigIdRequired);
        }

        let sender = self.sender_key(tx)?;

        let user_sender = match (&tx.from, sender) {
            (Origin::User(_), Some(key)) => Some(key),
            _ => None,
        };
        if let Some(key) = user_sender {
            if !tx.skips_nonce() {
                let expected = self.nonce_of(&key) + 1;
                if tx.nonce != expected {
                    return Err(LedgerError::InvalidNonce { expected, got: tx.nonce });
                }
            }
        }

        if let Some(dig_id) = tx.dig_id() {
            if self.used_dig_ids.contains(dig_id) {
                return Err(LedgerError::DuplicateDigId(dig_id.to_string()));
            }
        }
        if let Some(op_id) = tx.op_id() {
            if self.used_op_ids.contains(op_id) {
                return Err(LedgerError::DuplicateOpId(op_id.to_string()));
            }
        }

        let mut overlay = Overlay::new(self);
        let mut supply = self.supply;
        let amount = tx.amount;

        let effect = match tx.kind {
            TxKind::Mint => {
                let to = self.resolve_destination(tx)?;
                overlay.credit(&to, amount)?;
                supply = supply.checked_add(amount).ok_or(LedgerError::Overflow)?;
                Effect::Mint { to, amount }
            }
            TxKind::Burn => {
                let from = require_sender(sender)?;
                overlay.require_available(&from, amount)?;
                overlay.debit(&from, amount)?;
                supply = supply.checked_sub(amount).ok_or(LedgerError::Overflow)?;
                Effect::Burn { from, amount }
            }
            TxKind::Transfer => {
                let from = require_sender(sender)?;
                let to = self.resolve_destination(tx)?;
                overlay.require_available(&from, amount)?;
                overlay.debit(&from, amount)?;
                overlay.credit(&to, amount)?;
                Effect::Transfer { from, to, amount }
            }
            TxKind::Stake => {
                let account = require_sender(sender)?;
                overlay.require_available(&account, amount)?;
                overlay.lock(&account, amount)?;
                Effect::Stake { account, amount }
            }
            TxKind::Unstake => {
                let account = require_sender(sender)?;
                overlay.unlock(&account, amount)?;
                Effect::Unstake { account, amount }
            }
            TxKind::Attack => {
                let attacker = require_sender(sender)?;
                let defender = self.resolve_destination(tx)?;
                // attacker burns one unit of available balance
                overlay.require_available(&attacker, 1)?;
                overlay.debit(&attacker, 1)?;
                // defender loses one staked unit, which also leaves its balance
                overlay.unlock(&defender, 1)?;
                overlay.debit(&defender, 1)?;
                supply = supply.checked_sub(2).ok_or(LedgerError::Overflow)?;
                Effect::Attack { attacker, defender }
            }
        };

        Ok(Plan {
            balances: overlay.balances,
            staked: overlay.staked,
            nonce_bump: user_sender,
            supply,
            effect,
        })
    }

    fn write_plan(&mut self, tx: &Transaction, plan: Plan) -> Effect {
        for (key, balance) in plan.balances {
            self.accounts.entry(key).or_default();
            self.balances.insert(key, balance);
        }
        for (key, staked) in plan.staked {
            self.accounts.entry(key).or_default();
            self.staked.insert(key, staked);
        }
        if let Some(key) = plan.nonce_bump {
            let meta = self.accounts.entry(key).or_default();
            meta.nonce = meta.nonce.saturating_add(1);
        }
        if let Some(dig_id) = tx.dig_id() {
            self.used_dig_ids.insert(dig_id.to_string());
        }
        if let Some(op_id) = tx.op_id() {
            self.used_op_ids.insert(op_id.to_string());
        }
        self.supply = plan.supply;
        plan.effect
    }

    /// Resolve and authenticate the sending account key.
    ///
    /// User-origin transactions must carry a pubkey whose address equals
    /// `from`. System-origin transactions name the debited account through
    /// `pubkey` when the kind needs one.
    fn sender_key(&self, tx: &Transaction) -> LedgerResult<Option<PublicKey>> {
        match &tx.from {
            Origin::User(address) => {
                let key = tx
                    .pubkey
                    .ok_or_else(|| LedgerError::BadPubkey("missing sender pubkey".into()))?;
                let derived = key
                    .to_address()
                    .map_err(|e| LedgerError::BadPubkey(e.to_string()))?;
                if &derived != address {
                    return Err(LedgerError::FromAddressMismatch);
                }
                Ok(Some(key))
            }
            Origin::System => {
                if tx.kind.needs_sender_key() && tx.pubkey.is_none() {
                    return Err(LedgerError::BadPubkey("missing account pubkey".into()));
                }
                Ok(tx.pubkey)
            }
        }
    }

    /// Destination key: explicit `memo.toPubkey` wins, otherwise the `to`
    /// address is matched against known accounts.
    fn resolve_destination(&self, tx: &Transaction) -> LedgerResult<PublicKey> {
        if let Some(key) = tx.memo.to_pubkey {
            return Ok(key);
        }
        let Some(address) = tx.to.as_ref() else {
            return Err(LedgerError::ToResolveFailed("no destination".into()));
        };
        self.find_by_address(address)
            .ok_or_else(|| LedgerError::ToResolveFailed(address.to_string()))
    }

    /// Look up a known account by its bech32 address
    pub fn find_by_address(&self, address: &Address) -> Option<PublicKey> {
        self.known_keys()
            .into_iter()
            .find(|key| key.to_address().map_or(false, |a| &a == address))
    }

    fn known_keys(&self) -> BTreeSet<PublicKey> {
        self.balances
            .keys()
            .chain(self.staked.keys())
            .chain(self.accounts.keys())
            .copied()
            .collect()
    }

    /// Recompute the per-account and global invariants
    pub fn check_invariants(&self) -> LedgerResult<()> {
        for key in self.known_keys() {
            let balance = self.balance_of(&key);
            let staked = self.staked_of(&key);
            if staked > balance {
                return Err(LedgerError::InvariantViolation(format!(
                    "account {key}: staked {staked} exceeds balance {balance}"
                )));
            }
        }

        let sum_balance: u128 = self.balances.values().map(|&v| v as u128).sum();
        let sum_staked: u128 = self.staked.values().map(|&v| v as u128).sum();
        let sum_available: u128 = self
            .known_keys()
            .iter()
            .map(|k| (self.balance_of(k) - self.staked_of(k)) as u128)
            .sum();
        if sum_balance != sum_staked + sum_available {
            return Err(LedgerError::InvariantViolation(format!(
                "sum balance {sum_balance} != staked {sum_staked} + available {sum_available}"
            )));
        }
        if self.supply as u128 != sum_balance {
            return Err(LedgerError::SupplyInvariantViolation { supply: self.supply, sum: sum_balance });
        }
        Ok(())
    }

    pub fn balance_of(&self, key: &PublicKey) -> Amount {
        self.balances.get(key).copied().unwrap_or(0)
    }

    pub fn staked_of(&self, key: &PublicKey) -> Amount {
        self.staked.get(key).copied().unwrap_or(0)
    }

    pub fn nonce_of(&self, key: &PublicKey) -> Nonce {
        self.accounts.get(key).map_or(0, |m| m.nonce)
    }

    pub fn account(&self, key: &PublicKey) -> Account {
        Account {
            balance: self.balance_of(key),
            staked: self.staked_of(key),
            nonce: self.nonce_of(key),
        }
    }

    pub fn balances(&self) -> &BTreeMap<PublicKey, Amount> {
        &self.balances
    }

    pub fn staked(&self) -> &BTreeMap<PublicKey, Amount> {
        &self.staked
    }

    /// Top `limit` accounts by balance, ties broken by key
    pub fn holders(&self, limit: usize) -> Vec<(PublicKey, Account)> {
        let mut all: Vec<(PublicKey, Account)> = self
            .balances
            .keys()
            .map(|k| (*k, self.account(k)))
            .filter(|(_, a)| a.balance > 0)
            .collect();
        all.sort_by(|a, b| b.1.balance.cmp(&a.1.balance).then(a.0.cmp(&b.0)));
        all.truncate(limit);
        all
    }

    pub fn supply(&self) -> Amount {
        self.supply
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn head(&self) -> ChainHead {
        ChainHead {
            height: self.height,
            last_block_hash: self.last_block_hash,
            last_block_time: self.last_block_time,
        }
    }

    pub fn has_op_id(&self, op_id: &str) -> bool {
        self.used_op_ids.contains(op_id)
    }

    pub fn has_dig_id(&self, dig_id: &str) -> bool {
        self.used_dig_ids.contains(dig_id)
    }

    pub fn last_event(&self) -> (u64, Option<Hash>) {
        (self.last_event_id, self.last_event_hash)
    }

    pub(crate) fn set_head(&mut self, height: BlockHeight, hash: Hash, time: Timestamp) {
        self.height = height;
        self.last_block_hash = Some(hash);
        self.last_block_time = time;
    }

    pub(crate) fn set_last_event(&mut self, id: u64, hash: Hash) {
        self.last_event_id = id;
        self.last_event_hash = Some(hash);
    }

    /// Overwrite balances and supply wholesale; used only by the guard's
    /// repair path
    pub(crate) fn replace_balances(
        &mut self,
        balances: BTreeMap<PublicKey, Amount>,
        staked: BTreeMap<PublicKey, Amount>,
    ) {
        for key in balances.keys().chain(staked.keys()) {
            self.accounts.entry(*key).or_default();
        }
        self.supply = balances.values().fold(0u64, |acc, v| acc.saturating_add(*v));
        self.balances = balances;
        self.staked = staked;
    }
}

fn require_sender(sender: Option<PublicKey>) -> LedgerResult<PublicKey> {
    sender.ok_or_else(|| LedgerError::BadPubkey("missing sender pubkey".into()))
}
