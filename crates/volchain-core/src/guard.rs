// volchain-core/src/guard.rs

//! Invariant Guard: cross-check the ledger against externally supplied
//! game counters and, on operator request, force the ledger to match them.

use crate::{state::Ledger, types::Amount};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;
use volchain_crypto::PublicKey;

/// Authoritative counts for one player
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthCounts {
    /// Blocks the player has mined
    pub mined: Amount,
    /// Blocks the player currently has in use (staked)
    pub used: Amount,
}

/// Ground truth supplied by the calling subsystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruth {
    #[serde(default)]
    pub accounts: BTreeMap<PublicKey, TruthCounts>,
}

impl GroundTruth {
    pub fn set(&mut self, key: PublicKey, mined: Amount, used: Amount) {
        self.accounts.insert(key, TruthCounts { mined, used });
    }

    pub fn counts(&self, key: &PublicKey) -> TruthCounts {
        self.accounts.get(key).copied().unwrap_or_default()
    }

    pub fn total_mined(&self) -> u128 {
        self.accounts.values().map(|c| c.mined as u128).sum()
    }

    pub fn total_used(&self) -> u128 {
        self.accounts.values().map(|c| c.used as u128).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchCode {
    SystemSupplyMined,
    SystemUsedStaked,
    SystemTotalCalc,
    UserBalanceMined,
    UserStakedUsed,
    UserBalanceCalc,
}

impl MismatchCode {
    /// System-wide drift; callers should roll back their own state
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            MismatchCode::SystemSupplyMined | MismatchCode::SystemUsedStaked | MismatchCode::SystemTotalCalc
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub code: MismatchCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<PublicKey>,
    pub expected: u128,
    pub actual: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardTotals {
    pub supply: u128,
    pub staked: u128,
    pub available: u128,
    pub mined: u128,
    pub used: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardReport {
    pub ok: bool,
    pub totals: GuardTotals,
    pub mismatches: Vec<Mismatch>,
}

impl GuardReport {
    pub fn has_critical(&self) -> bool {
        self.mismatches.iter().any(|m| m.code.is_critical())
    }
}

fn accounts_in_scope(ledger: &Ledger, truth: &GroundTruth) -> BTreeSet<PublicKey> {
    ledger
        .balances()
        .keys()
        .chain(ledger.staked().keys())
        .chain(truth.accounts.keys())
        .copied()
        .collect()
}

/// Compare the ledger against `truth`. Pure; never mutates.
pub fn invariant_report(ledger: &Ledger, truth: &GroundTruth) -> GuardReport {
    let supply: u128 = ledger.balances().values().map(|&v| v as u128).sum();
    let staked: u128 = ledger.staked().values().map(|&v| v as u128).sum();
    let mut totals = GuardTotals {
        supply,
        staked,
        available: 0,
        mined: truth.total_mined(),
        used: truth.total_used(),
    };
    let mut mismatches = Vec::new();

    for key in accounts_in_scope(ledger, truth) {
        let account = ledger.account(&key);
        let counts = truth.counts(&key);
        totals.available += account.available() as u128;

        if account.balance != counts.mined {
            mismatches.push(Mismatch {
                code: MismatchCode::UserBalanceMined,
                account: Some(key),
                expected: counts.mined as u128,
                actual: account.balance as u128,
            });
        }
        if account.staked != counts.used {
            mismatches.push(Mismatch {
                code: MismatchCode::UserStakedUsed,
                account: Some(key),
                expected: counts.used as u128,
                actual: account.staked as u128,
            });
        }
        if account.staked > account.balance {
            mismatches.push(Mismatch {
                code: MismatchCode::UserBalanceCalc,
                account: Some(key),
                expected: account.balance as u128,
                actual: account.staked as u128 + account.available() as u128,
            });
        }
    }

    if supply != totals.mined {
        mismatches.push(Mismatch {
            code: MismatchCode::SystemSupplyMined,
            account: None,
            expected: totals.mined,
            actual: supply,
        });
    }
    if staked != totals.used {
        mismatches.push(Mismatch {
            code: MismatchCode::SystemUsedStaked,
            account: None,
            expected: totals.used,
            actual: staked,
        });
    }
    if supply != staked + totals.available {
        mismatches.push(Mismatch {
            code: MismatchCode::SystemTotalCalc,
            account: None,
            expected: supply,
            actual: staked + totals.available,
        });
    }

    GuardReport { ok: mismatches.is_empty(), totals, mismatches }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountChange {
    pub key: PublicKey,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub staked_before: Amount,
    pub staked_after: Amount,
}

/// Record of what `auto_correct` rewrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub changes: Vec<AccountChange>,
    pub supply_before: Amount,
    pub supply_after: Amount,
}

/// Rebuild balances strictly from mined counts. Staked is clamped to the new
/// balance and zeroed where no balance remains; supply becomes the new sum.
/// Nonces and used ids are untouched.
pub fn auto_correct(ledger: &mut Ledger, truth: &GroundTruth) -> Correction {
    let supply_before = ledger.supply();
    let keys = accounts_in_scope(ledger, truth);

    let mut balances = BTreeMap::new();
    let mut staked = BTreeMap::new();
    let mut changes = Vec::new();
    for key in keys {
        let before = ledger.account(&key);
        let balance = truth.counts(&key).mined;
        let stake = before.staked.min(balance);
        if balance > 0 {
            balances.insert(key, balance);
        }
        if stake > 0 {
            staked.insert(key, stake);
        }
        if balance != before.balance || stake != before.staked {
            warn!(
                "auto-correct {}: balance {} -> {}, staked {} -> {}",
                key, before.balance, balance, before.staked, stake
            );
            changes.push(AccountChange {
                key,
                balance_before: before.balance,
                balance_after: balance,
                staked_before: before.staked,
                staked_after: stake,
            });
        }
    }

    ledger.replace_balances(balances, staked);
    Correction { changes, supply_before, supply_after: ledger.supply() }
}
