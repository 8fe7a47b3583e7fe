// volchain-core/src/events.rs

//! Legacy per-transaction audit log.
//!
//! Every applied transaction in a sealed block is projected into one
//! event, linked to its predecessor by `prev_hash`. The log is derived from
//! blocks and never written independently.

use crate::{block::Block, state::Effect, transaction::Reason, types::*, LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use volchain_crypto::{hash::Hashable, Hash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEvent {
    pub id: u64,
    pub prev_hash: Option<Hash>,
    pub hash: Hash,
    pub ts: Timestamp,
    pub height: BlockHeight,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(flatten)]
    pub effect: Effect,
}

#[derive(Serialize)]
struct EventContent<'a> {
    id: u64,
    ts: Timestamp,
    height: BlockHeight,
    op_id: Option<&'a str>,
    reason: Option<Reason>,
    #[serde(flatten)]
    effect: &'a Effect,
}

impl LegacyEvent {
    /// Digest of everything except the link fields
    fn content_hash(&self) -> LedgerResult<Hash> {
        let content = EventContent {
            id: self.id,
            ts: self.ts,
            height: self.height,
            op_id: self.op_id.as_deref(),
            reason: self.reason,
            effect: &self.effect,
        };
        Ok(serde_json::to_vec(&content)?.hash())
    }

    /// `H(prev_hash ‖ H(content))`
    pub fn compute_hash(&self) -> LedgerResult<Hash> {
        let prev = self.prev_hash.map(|h| h.to_hex()).unwrap_or_default();
        let content = self.content_hash()?;
        Ok(format!("{prev}{}", content.to_hex()).as_str().hash())
    }

    /// Check the embedded hash and the link to `prev`
    pub fn verify(&self, prev: Option<&LegacyEvent>) -> LedgerResult<()> {
        let expected_prev = prev.map(|p| p.hash);
        if self.prev_hash != expected_prev {
            return Err(LedgerError::Integrity(format!("event {} prev_hash does not match", self.id)));
        }
        if let Some(p) = prev {
            if self.id != p.id + 1 {
                return Err(LedgerError::Integrity(format!("event {} does not follow {}", self.id, p.id)));
            }
        }
        if self.compute_hash()? != self.hash {
            return Err(LedgerError::Integrity(format!("event {} hash mismatch", self.id)));
        }
        Ok(())
    }
}

/// Project a sealed block into events continuing from `(last_id, last_hash)`
pub fn project_block(
    block: &Block,
    effects: &[Effect],
    last_id: u64,
    last_hash: Option<Hash>,
) -> LedgerResult<Vec<LegacyEvent>> {
    if effects.len() != block.txs.len() {
        return Err(LedgerError::Integrity(format!(
            "block {} has {} txs but {} effects",
            block.height(),
            block.txs.len(),
            effects.len()
        )));
    }

    let mut events = Vec::with_capacity(effects.len());
    let mut prev_hash = last_hash;
    for (i, (tx, effect)) in block.txs.iter().zip(effects).enumerate() {
        let mut event = LegacyEvent {
            id: last_id + 1 + i as u64,
            prev_hash,
            hash: Hash::default(),
            ts: block.header.time,
            height: block.height(),
            op_id: tx.memo.op_id.clone(),
            reason: tx.memo.reason,
            effect: effect.clone(),
        };
        event.hash = event.compute_hash()?;
        prev_hash = Some(event.hash);
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use volchain_crypto::KeyPair;

    fn block_with_events() -> (Block, Vec<LegacyEvent>) {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let txs = vec![
            Transaction::mint(a.public_key(), 5).unwrap().with_op_id("m"),
            Transaction::mint(b.public_key(), 2).unwrap(),
        ];
        let effects = vec![
            Effect::Mint { to: *a.public_key(), amount: 5 },
            Effect::Mint { to: *b.public_key(), amount: 2 },
        ];
        let block = Block::new(1, None, 10, "v", txs).unwrap();
        let events = project_block(&block, &effects, 0, None).unwrap();
        (block, events)
    }

    #[test]
    fn test_projection_links_events() {
        let (_, events) = block_with_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 1);
        assert_eq!(events[0].op_id.as_deref(), Some("m"));
        events[0].verify(None).unwrap();
        events[1].verify(Some(&events[0])).unwrap();
    }

    #[test]
    fn test_tampered_event_detected() {
        let (_, mut events) = block_with_events();
        if let Effect::Mint { amount, .. } = &mut events[1].effect {
            *amount = 9;
        }
        assert!(events[1].verify(Some(&events[0])).is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let (_, events) = block_with_events();
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["type"], "mint");
        assert_eq!(json["amount"], 5);
        let back: LegacyEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, events[0]);
    }

    #[test]
    fn test_effect_count_must_match() {
        let (block, _) = block_with_events();
        assert!(project_block(&block, &[], 0, None).is_err());
    }
}
