// volchain-core/src/replay.rs

//! Replay Verifier: recompute balances from sealed history and compare them
//! with a snapshot. Side-effect free.

use crate::{
    block::Block,
    events::LegacyEvent,
    state::{Effect, Ledger, LedgerRules},
    types::*,
    LedgerError, LedgerResult,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use volchain_crypto::PublicKey;

/// Which history a replay used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaySource {
    Blocks,
    Events,
}

/// First account whose replayed balance differs from the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMismatch {
    pub source: ReplaySource,
    pub account: PublicKey,
    pub snapshot: Amount,
    pub computed: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub ok: bool,
    /// History that matched, if any
    pub mode: Option<ReplaySource>,
    pub height: BlockHeight,
    pub accounts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mismatch: Option<ReplayMismatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Re-apply every block, in order, from an empty ledger. Hash links are
/// checked along the way.
pub fn replay_blocks(blocks: &[Block]) -> LedgerResult<Ledger> {
    let mut ledger = Ledger::new();
    let rules = LedgerRules::replay();
    let mut parent = None;
    for block in blocks {
        block.verify()?;
        block.header.validate_link(parent)?;
        for tx in &block.txs {
            ledger.apply(tx, &rules).map_err(|e| {
                LedgerError::Integrity(format!("block {} does not replay: {}", block.height(), e))
            })?;
        }
        ledger.set_head(block.height(), block.hash(), block.header.time);
        parent = Some((block.height(), block.hash()));
    }
    Ok(ledger)
}

fn add(balances: &mut BTreeMap<PublicKey, Amount>, key: &PublicKey, amount: Amount) {
    let entry = balances.entry(*key).or_default();
    *entry = entry.saturating_add(amount);
}

fn sub(balances: &mut BTreeMap<PublicKey, Amount>, key: &PublicKey, amount: Amount) {
    let entry = balances.entry(*key).or_default();
    *entry = entry.saturating_sub(amount);
}

/// Fold the legacy event log into balances, checking every hash link
pub fn replay_events(events: &[LegacyEvent]) -> LedgerResult<BTreeMap<PublicKey, Amount>> {
    let mut balances = BTreeMap::new();
    let mut prev: Option<&LegacyEvent> = None;
    for event in events {
        event.verify(prev)?;
        match &event.effect {
            Effect::Mint { to, amount } => add(&mut balances, to, *amount),
            Effect::Burn { from, amount } => sub(&mut balances, from, *amount),
            Effect::Transfer { from, to, amount } => {
                sub(&mut balances, from, *amount);
                add(&mut balances, to, *amount);
            }
            Effect::Stake { .. } | Effect::Unstake { .. } => {}
            Effect::Attack { attacker, defender } => {
                sub(&mut balances, attacker, 1);
                sub(&mut balances, defender, 1);
            }
        }
        prev = Some(event);
    }
    Ok(balances)
}

fn compare(
    source: ReplaySource,
    snapshot: &BTreeMap<PublicKey, Amount>,
    computed: &BTreeMap<PublicKey, Amount>,
) -> Option<ReplayMismatch> {
    let keys: BTreeSet<&PublicKey> = snapshot.keys().chain(computed.keys()).collect();
    keys.into_iter().find_map(|key| {
        let s = snapshot.get(key).copied().unwrap_or(0);
        let c = computed.get(key).copied().unwrap_or(0);
        (s != c).then(|| ReplayMismatch { source, account: *key, snapshot: s, computed: c })
    })
}

/// Check `ledger` against both histories. Only records at or below the
/// snapshot height are replayed, so a block sealed concurrently with the
/// read is not reported as drift. `ok` when either history matches.
pub fn verify(ledger: &Ledger, blocks: &[Block], events: &[LegacyEvent]) -> VerifyReport {
    let height = ledger.height();
    let snapshot = ledger.balances();
    let mut report = VerifyReport {
        ok: false,
        mode: None,
        height,
        accounts: snapshot.len(),
        mismatch: None,
        errors: Vec::new(),
    };

    let sealed: Vec<Block> = blocks.iter().filter(|b| b.height() <= height).cloned().collect();
    match replay_blocks(&sealed) {
        Ok(replayed) => match compare(ReplaySource::Blocks, snapshot, replayed.balances()) {
            None => {
                report.ok = true;
                report.mode = Some(ReplaySource::Blocks);
                return report;
            }
            Some(m) => report.mismatch = Some(m),
        },
        Err(e) => report.errors.push(format!("blocks: {e}")),
    }

    let logged: Vec<LegacyEvent> = events.iter().filter(|e| e.height <= height).cloned().collect();
    match replay_events(&logged) {
        Ok(replayed) => match compare(ReplaySource::Events, snapshot, &replayed) {
            None => {
                report.ok = true;
                report.mode = Some(ReplaySource::Events);
                report.mismatch = None;
            }
            Some(m) => {
                report.mismatch.get_or_insert(m);
            }
        },
        Err(e) => report.errors.push(format!("events: {e}")),
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::project_block, transaction::Transaction};
    use volchain_crypto::KeyPair;

    struct History {
        ledger: Ledger,
        blocks: Vec<Block>,
        events: Vec<LegacyEvent>,
    }

    fn seal(history: &mut History, txs: Vec<Transaction>) {
        let rules = LedgerRules::default();
        let effects: Vec<Effect> = txs.iter().map(|tx| history.ledger.apply(tx, &rules).unwrap()).collect();
        let head = history.ledger.head();
        let block = Block::new(head.height + 1, head.last_block_hash, head.height as i64 + 1, "v", txs).unwrap();
        let (id, hash) = history.ledger.last_event();
        let events = project_block(&block, &effects, id, hash).unwrap();
        if let Some(last) = events.last() {
            history.ledger.set_last_event(last.id, last.hash);
        }
        history.ledger.set_head(block.height(), block.hash(), block.header.time);
        history.blocks.push(block);
        history.events.extend(events);
    }

    fn stake_attack_history() -> (History, KeyPair, KeyPair) {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let mut history = History { ledger: Ledger::new(), blocks: Vec::new(), events: Vec::new() };
        seal(
            &mut history,
            vec![
                Transaction::mint(a.public_key(), 5).unwrap(),
                Transaction::mint(b.public_key(), 5).unwrap(),
            ],
        );
        seal(
            &mut history,
            vec![
                Transaction::stake(a.public_key(), 3).unwrap().signed(&a).unwrap(),
                Transaction::stake(b.public_key(), 3).unwrap().signed(&b).unwrap(),
            ],
        );
        seal(&mut history, vec![Transaction::attack(a.public_key(), b.public_key()).unwrap()]);
        (history, a, b)
    }

    #[test]
    fn test_stake_attack_replay_matches() {
        let (history, a, b) = stake_attack_history();
        assert_eq!(history.ledger.balance_of(a.public_key()), 4);
        assert_eq!(history.ledger.staked_of(b.public_key()), 2);
        assert_eq!(history.ledger.supply(), 8);

        let report = verify(&history.ledger, &history.blocks, &history.events);
        assert!(report.ok, "{report:?}");
        assert_eq!(report.mode, Some(ReplaySource::Blocks));
        assert_eq!(report.height, 3);

        let replayed = replay_blocks(&history.blocks).unwrap();
        assert_eq!(replayed.balances(), history.ledger.balances());
        assert_eq!(replayed.staked(), history.ledger.staked());
        assert_eq!(&replay_events(&history.events).unwrap(), history.ledger.balances());
    }

    #[test]
    fn test_drifted_snapshot_reports_first_account() {
        let (history, _, _) = stake_attack_history();
        let mut json = serde_json::to_value(&history.ledger).unwrap();
        let balances = json["balances"].as_object_mut().unwrap();
        let first = balances.keys().next().unwrap().clone();
        balances.insert(first.clone(), serde_json::json!(42));
        let drifted: Ledger = serde_json::from_value(json).unwrap();

        let report = verify(&drifted, &history.blocks, &history.events);
        assert!(!report.ok);
        let mismatch = report.mismatch.unwrap();
        assert_eq!(mismatch.source, ReplaySource::Blocks);
        assert_eq!(mismatch.account.to_hex(), first);
        assert_eq!(mismatch.snapshot, 42);
    }

    #[test]
    fn test_events_fallback_when_blocks_broken() {
        let (mut history, _, _) = stake_attack_history();
        history.blocks[1].header.count = 9;

        let report = verify(&history.ledger, &history.blocks, &history.events);
        assert!(report.ok);
        assert_eq!(report.mode, Some(ReplaySource::Events));
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_tampered_event_log_detected() {
        let (history, _, _) = stake_attack_history();
        let mut events = history.events.clone();
        events.remove(1);
        assert!(replay_events(&events).is_err());
    }

    #[test]
    fn test_records_above_snapshot_height_ignored() {
        let (history, a, _) = stake_attack_history();
        let mut ahead = History {
            ledger: history.ledger.clone(),
            blocks: history.blocks.clone(),
            events: history.events.clone(),
        };
        seal(&mut ahead, vec![Transaction::mint(a.public_key(), 7).unwrap()]);

        let report = verify(&history.ledger, &ahead.blocks, &ahead.events);
        assert!(report.ok, "{report:?}");
        assert_eq!(report.height, 3);
    }
}
