// volchain-core/src/transaction.rs

use crate::{types::*, LedgerError, LedgerResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use volchain_crypto::{hash::Hashable, resolve_key, Address, Hash, KeyPair, PublicKey, Signature};

/// Transaction types supported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Mint,
    Burn,
    Transfer,
    Stake,
    Unstake,
    Attack,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Mint => "mint",
            TxKind::Burn => "burn",
            TxKind::Transfer => "transfer",
            TxKind::Stake => "stake",
            TxKind::Unstake => "unstake",
            TxKind::Attack => "attack",
        }
    }

    /// Kinds that debit or lock funds of the sender account
    pub fn needs_sender_key(&self) -> bool {
        !matches!(self, TxKind::Mint)
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the game server issued a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Dig,
    CastleBonus,
    Support,
    ClaimOwnerless,
    WarzoneAttack,
    WarzoneAttackCost,
    WarzoneDefenseLoss,
    ManualUnstake,
    RemoveBlock,
    Backfill,
    BackfillAlign,
    ResetReseed,
    ServerTransfer,
    AttackBurnAttacker,
    AttackBurnDefender,
    Seed,
    SeedBackfill,
}

impl Reason {
    /// Reasons generated by the trusted server process; transactions carrying
    /// one skip signature verification
    pub fn skips_signature(&self) -> bool {
        !matches!(self, Reason::Seed | Reason::SeedBackfill)
    }

    /// Server-side debits that do not consume the sender's nonce. Narrower
    /// than `skips_signature`: dig and castle mints, alignment backfills and
    /// attack burns still follow the nonce rule when sent from a user key.
    pub fn skips_nonce(&self) -> bool {
        matches!(
            self,
            Reason::Support
                | Reason::ClaimOwnerless
                | Reason::WarzoneAttack
                | Reason::WarzoneAttackCost
                | Reason::WarzoneDefenseLoss
                | Reason::ManualUnstake
                | Reason::RemoveBlock
                | Reason::Backfill
                | Reason::ResetReseed
                | Reason::ServerTransfer
        )
    }

    /// Mints with these reasons do not need a dig_id
    pub fn exempt_from_dig_id(&self) -> bool {
        matches!(
            self,
            Reason::Seed | Reason::SeedBackfill | Reason::ResetReseed | Reason::CastleBonus
        )
    }
}

/// Sender of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Trusted server process; serialized as `"SYSTEM"`
    System,
    User(Address),
}

const SYSTEM_ORIGIN: &str = "SYSTEM";

impl Origin {
    pub fn is_system(&self) -> bool {
        matches!(self, Origin::System)
    }

    pub fn parse(s: &str) -> LedgerResult<Self> {
        if s == SYSTEM_ORIGIN {
            return Ok(Origin::System);
        }
        Address::parse(s)
            .map(Origin::User)
            .map_err(|e| LedgerError::Malformed(format!("invalid sender: {e}")))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::System => f.write_str(SYSTEM_ORIGIN),
            Origin::User(address) => write!(f, "{address}"),
        }
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Origin::System => serializer.serialize_str(SYSTEM_ORIGIN),
            Origin::User(address) => serializer.serialize_str(address.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Origin::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Transaction metadata. Fields are declared in key order so the
/// serialized form is already sorted for the canonical encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Memo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dig_id: Option<String>,
    #[serde(rename = "gridIndex", default, skip_serializing_if = "Option::is_none")]
    pub grid_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(rename = "toPubkey", default, skip_serializing_if = "Option::is_none")]
    pub to_pubkey: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Memo {
    pub fn is_empty(&self) -> bool {
        self == &Memo::default()
    }

    /// Size of the JSON-encoded memo; an empty memo costs nothing
    pub fn encoded_len(&self) -> LedgerResult<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// A ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub kind: TxKind,
    pub from: Origin,
    #[serde(default)]
    pub to: Option<Address>,
    pub amount: Amount,
    #[serde(default)]
    pub nonce: Nonce,
    #[serde(default, skip_serializing_if = "Memo::is_empty")]
    pub memo: Memo,
    /// Key of the sending account (the debited side for burns and stakes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<PublicKey>,
    #[serde(rename = "sig", default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(rename = "ts")]
    pub timestamp: Timestamp,
}

/// Signed payload. Field order is part of the wire contract.
#[derive(Serialize)]
struct CanonicalTx<'a> {
    chain_id: &'static str,
    #[serde(rename = "type")]
    kind: TxKind,
    from: &'a Origin,
    to: Option<&'a Address>,
    amount: Amount,
    nonce: Nonce,
    memo: Option<&'a Memo>,
    pubkey: Option<&'a PublicKey>,
}

impl Transaction {
    /// A server-issued transaction with no sender account attached
    pub fn system(kind: TxKind, amount: Amount) -> Self {
        Self {
            kind,
            from: Origin::System,
            to: None,
            amount,
            nonce: 0,
            memo: Memo::default(),
            pubkey: None,
            signature: None,
            timestamp: now_millis(),
        }
    }

    /// A user-origin transaction sent from `sender`
    pub fn user(kind: TxKind, sender: &PublicKey, amount: Amount, nonce: Nonce) -> LedgerResult<Self> {
        let address = sender
            .to_address()
            .map_err(|e| LedgerError::BadPubkey(e.to_string()))?;
        Ok(Self {
            from: Origin::User(address),
            nonce,
            pubkey: Some(*sender),
            ..Self::system(kind, amount)
        })
    }

    pub fn mint(to: &PublicKey, amount: Amount) -> LedgerResult<Self> {
        Self::system(TxKind::Mint, amount).with_recipient(to)
    }

    /// Server-side burn from `account`
    pub fn burn(account: &PublicKey, amount: Amount) -> Self {
        Self::system(TxKind::Burn, amount).with_pubkey(account)
    }

    pub fn transfer(from: &PublicKey, to: &PublicKey, amount: Amount, nonce: Nonce) -> LedgerResult<Self> {
        Self::user(TxKind::Transfer, from, amount, nonce)?.with_recipient(to)
    }

    pub fn stake(account: &PublicKey, amount: Amount) -> LedgerResult<Self> {
        Self::user(TxKind::Stake, account, amount, 0)
    }

    pub fn unstake(account: &PublicKey, amount: Amount) -> LedgerResult<Self> {
        Self::user(TxKind::Unstake, account, amount, 0)
    }

    /// Attack always moves exactly one unit on each side
    pub fn attack(attacker: &PublicKey, defender: &PublicKey) -> LedgerResult<Self> {
        Ok(Self::user(TxKind::Attack, attacker, 1, 0)?
            .with_recipient(defender)?
            .with_reason(Reason::WarzoneAttack))
    }

    /// Point `to` and `memo.toPubkey` at `recipient`
    pub fn with_recipient(mut self, recipient: &PublicKey) -> LedgerResult<Self> {
        let address = recipient
            .to_address()
            .map_err(|e| LedgerError::BadToPubkey(e.to_string()))?;
        self.to = Some(address);
        self.memo.to_pubkey = Some(*recipient);
        Ok(self)
    }

    pub fn with_pubkey(mut self, pubkey: &PublicKey) -> Self {
        self.pubkey = Some(*pubkey);
        self
    }

    pub fn with_op_id(mut self, op_id: impl Into<String>) -> Self {
        self.memo.op_id = Some(op_id.into());
        self
    }

    pub fn with_dig_id(mut self, dig_id: impl Into<String>) -> Self {
        self.memo.dig_id = Some(dig_id.into());
        self
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.memo.reason = Some(reason);
        self
    }

    pub fn with_nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn op_id(&self) -> Option<&str> {
        self.memo.op_id.as_deref()
    }

    pub fn dig_id(&self) -> Option<&str> {
        self.memo.dig_id.as_deref()
    }

    pub fn reason(&self) -> Option<Reason> {
        self.memo.reason
    }

    /// A mint that should carry a dig_id but does not
    pub fn missing_dig_id(&self) -> bool {
        self.kind == TxKind::Mint
            && self.dig_id().is_none()
            && !self.reason().map_or(false, |r| r.exempt_from_dig_id())
    }

    /// Server-origin transactions bypass signature verification
    pub fn skips_signature(&self) -> bool {
        self.reason().map_or(false, |r| r.skips_signature())
    }

    /// Stake, unstake and the server debit reasons are nonce-exempt
    pub fn skips_nonce(&self) -> bool {
        matches!(self.kind, TxKind::Stake | TxKind::Unstake) || self.reason().map_or(false, |r| r.skips_nonce())
    }

    /// Deterministic bytes covered by the signature
    pub fn canonical_bytes(&self) -> LedgerResult<Vec<u8>> {
        let canonical = CanonicalTx {
            chain_id: CHAIN_ID,
            kind: self.kind,
            from: &self.from,
            to: self.to.as_ref(),
            amount: self.amount,
            nonce: self.nonce,
            memo: (!self.memo.is_empty()).then_some(&self.memo),
            pubkey: self.pubkey.as_ref(),
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Sign with `keypair`, setting `pubkey` to its public key first
    pub fn sign(&mut self, keypair: &KeyPair) -> LedgerResult<()> {
        self.pubkey = Some(*keypair.public_key());
        let bytes = self.canonical_bytes()?;
        self.signature = Some(keypair.sign(&bytes));
        Ok(())
    }

    pub fn signed(mut self, keypair: &KeyPair) -> LedgerResult<Self> {
        self.sign(keypair)?;
        Ok(self)
    }

    /// True when the transaction is trusted (system or server-origin) or
    /// carries a valid signature by `pubkey`
    pub fn verify_signature(&self) -> bool {
        if self.from.is_system() || self.skips_signature() {
            return true;
        }
        let (Some(pubkey), Some(signature)) = (self.pubkey.as_ref(), self.signature.as_ref()) else {
            return false;
        };
        match self.canonical_bytes() {
            Ok(bytes) => pubkey.verify(&bytes, signature),
            Err(_) => false,
        }
    }

    /// Identity of this exact transaction, signature included
    pub fn hash(&self) -> LedgerResult<Hash> {
        Ok(serde_json::to_vec(self)?.hash())
    }

    /// Length of the JSON line this transaction occupies on disk
    pub fn encoded_len(&self) -> LedgerResult<usize> {
        Ok(serde_json::to_vec(self)?.len() + 1)
    }
}

/// Loosely typed transaction as submitted by a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub amount: serde_json::Value,
    #[serde(default)]
    pub nonce: Option<Nonce>,
    #[serde(default)]
    pub memo: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub sig: Option<String>,
    #[serde(default)]
    pub ts: Option<Timestamp>,
}

fn parse_amount(value: &serde_json::Value) -> LedgerResult<Amount> {
    use serde_json::Value;

    let amount = match value {
        Value::Number(n) => match n.as_u64() {
            Some(v) => Some(v),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f > 0.0 && *f < u64::MAX as f64)
                .map(|f| f as u64),
        },
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match amount {
        Some(v) if v > 0 => Ok(v),
        _ => Err(LedgerError::InvalidAmount),
    }
}

fn memo_string(key: &str, value: serde_json::Value) -> LedgerResult<Option<String>> {
    match value {
        serde_json::Value::String(s) if s.is_empty() => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        other => Err(LedgerError::Malformed(format!("memo.{key} must be a string, got {other}"))),
    }
}

fn parse_memo(raw: serde_json::Map<String, serde_json::Value>) -> LedgerResult<Memo> {
    let mut memo = Memo::default();
    for (key, value) in raw {
        if value.is_null() {
            continue;
        }
        match key.as_str() {
            "op_id" => memo.op_id = memo_string(&key, value)?,
            "dig_id" => memo.dig_id = memo_string(&key, value)?,
            "username" => memo.username = memo_string(&key, value)?,
            "reason" => {
                let reason = serde_json::from_value(value)
                    .map_err(|e| LedgerError::Malformed(format!("memo.reason: {e}")))?;
                memo.reason = Some(reason);
            }
            "toPubkey" => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| LedgerError::BadToPubkey("toPubkey must be a string".into()))?;
                let key = resolve_key(raw).map_err(|e| LedgerError::BadToPubkey(e.to_string()))?;
                memo.to_pubkey = Some(key);
            }
            "gridIndex" => {
                let index = value
                    .as_u64()
                    .ok_or_else(|| LedgerError::Malformed("memo.gridIndex must be an integer".into()))?;
                memo.grid_index = Some(index);
            }
            other => return Err(LedgerError::Malformed(format!("unknown memo field: {other}"))),
        }
    }
    Ok(memo)
}

impl TryFrom<TxRequest> for Transaction {
    type Error = LedgerError;

    fn try_from(req: TxRequest) -> LedgerResult<Self> {
        let kind: TxKind = serde_json::from_value(serde_json::Value::String(req.kind.clone()))
            .map_err(|_| LedgerError::Malformed(format!("unknown transaction type: {}", req.kind)))?;
        let from = Origin::parse(req.from.trim())?;
        let amount = parse_amount(&req.amount)?;
        let to = match req.to.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(
                Address::parse(s).map_err(|e| LedgerError::ToResolveFailed(e.to_string()))?,
            ),
        };
        let memo = match req.memo {
            Some(raw) => parse_memo(raw)?,
            None => Memo::default(),
        };
        let pubkey = match req.pubkey.as_deref() {
            None | Some("") => None,
            Some(s) => Some(resolve_key(s).map_err(|e| LedgerError::BadPubkey(e.to_string()))?),
        };
        let signature = match req.sig.as_deref() {
            None | Some("") => None,
            Some(s) => Some(Signature::from_base64(s).map_err(|_| LedgerError::BadSignature)?),
        };

        Ok(Self {
            kind,
            from,
            to,
            amount,
            nonce: req.nonce.unwrap_or(0),
            memo,
            pubkey,
            signature,
            timestamp: req.ts.unwrap_or_else(now_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_form_layout() {
        let kp = KeyPair::generate();
        let tx = Transaction::mint(kp.public_key(), 10)
            .unwrap()
            .with_op_id("op1")
            .with_reason(Reason::Dig);
        let canonical: serde_json::Value =
            serde_json::from_slice(&tx.canonical_bytes().unwrap()).unwrap();
        assert_eq!(canonical["chain_id"], CHAIN_ID);
        assert_eq!(canonical["type"], "mint");
        assert_eq!(canonical["from"], "SYSTEM");
        assert_eq!(canonical["pubkey"], serde_json::Value::Null);

        let text = String::from_utf8(tx.canonical_bytes().unwrap()).unwrap();
        let op = text.find("\"op_id\"").unwrap();
        let reason = text.find("\"reason\"").unwrap();
        let to_pubkey = text.find("\"toPubkey\"").unwrap();
        assert!(op < reason && reason < to_pubkey);
    }

    #[test]
    fn test_canonical_excludes_signature_and_timestamp() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let tx = Transaction::transfer(kp.public_key(), other.public_key(), 3, 1).unwrap();
        let signed = tx.clone().signed(&kp).unwrap();
        let later = signed.clone().with_timestamp(signed.timestamp + 1000);
        assert_eq!(signed.canonical_bytes().unwrap(), later.canonical_bytes().unwrap());
        assert!(later.verify_signature());
    }

    #[test]
    fn test_signature_verification() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let tx = Transaction::transfer(kp.public_key(), other.public_key(), 5, 1)
            .unwrap()
            .signed(&kp)
            .unwrap();
        assert!(tx.verify_signature());

        let mut tampered = tx.clone();
        tampered.amount = 6;
        assert!(!tampered.verify_signature());

        let mut unsigned = tx;
        unsigned.signature = None;
        assert!(!unsigned.verify_signature());
    }

    #[test]
    fn test_trusted_transactions_skip_signature() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        assert!(Transaction::mint(kp.public_key(), 1).unwrap().verify_signature());
        let server = Transaction::transfer(kp.public_key(), other.public_key(), 1, 0)
            .unwrap()
            .with_reason(Reason::ServerTransfer);
        assert!(server.verify_signature());
        let seeded = Transaction::transfer(kp.public_key(), other.public_key(), 1, 0)
            .unwrap()
            .with_reason(Reason::Seed);
        assert!(!seeded.verify_signature());
    }

    #[test]
    fn test_serde_roundtrip_preserves_signature() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let tx = Transaction::transfer(kp.public_key(), other.public_key(), 2, 1)
            .unwrap()
            .with_op_id("op-x")
            .signed(&kp)
            .unwrap();
        let line = serde_json::to_string(&tx).unwrap();
        assert!(line.contains("\"type\":\"transfer\""));
        assert!(line.contains("\"sig\""));
        let back: Transaction = serde_json::from_str(&line).unwrap();
        assert_eq!(back, tx);
        assert!(back.verify_signature());
        assert_eq!(back.hash().unwrap(), tx.hash().unwrap());
    }

    #[test]
    fn test_request_conversion() {
        let kp = KeyPair::generate();
        let req: TxRequest = serde_json::from_value(json!({
            "type": "mint",
            "from": "SYSTEM",
            "amount": 10,
            "memo": { "op_id": "op1", "toPubkey": kp.public_key().to_base64(), "reason": "dig", "dig_id": "d1" }
        }))
        .unwrap();
        let tx = Transaction::try_from(req).unwrap();
        assert_eq!(tx.kind, TxKind::Mint);
        assert_eq!(tx.memo.to_pubkey, Some(*kp.public_key()));
        assert_eq!(tx.op_id(), Some("op1"));
        assert_eq!(tx.reason(), Some(Reason::Dig));
    }

    #[test]
    fn test_request_rejections() {
        let base = json!({ "type": "mint", "from": "SYSTEM", "amount": 1 });

        let mut req = base.clone();
        req["amount"] = json!(0);
        let err = Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap_err();
        assert_eq!(err.code(), "invalid_amount");

        let mut req = base.clone();
        req["amount"] = json!(1.5);
        let err = Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap_err();
        assert_eq!(err.code(), "invalid_amount");

        // 2^64 is representable as f64 but not as u64
        let mut req = base.clone();
        req["amount"] = json!(18_446_744_073_709_551_616.0_f64);
        let err = Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap_err();
        assert_eq!(err.code(), "invalid_amount");

        let mut req = base.clone();
        req["amount"] = json!(1e18);
        assert_eq!(Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap().amount, 1_000_000_000_000_000_000);

        let mut req = base.clone();
        req["memo"] = json!({ "toPubkey": "nope" });
        let err = Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap_err();
        assert_eq!(err.code(), "BAD_TO_PUBKEY");

        let mut req = base.clone();
        req["pubkey"] = json!("nope");
        let err = Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap_err();
        assert_eq!(err.code(), "BAD_PUBKEY");

        let mut req = base.clone();
        req["memo"] = json!({ "color": "red" });
        let err = Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap_err();
        assert_eq!(err.code(), "malformed");

        let mut req = base;
        req["type"] = json!("teleport");
        let err = Transaction::try_from(serde_json::from_value::<TxRequest>(req).unwrap()).unwrap_err();
        assert_eq!(err.code(), "malformed");
    }

    #[test]
    fn test_reason_allow_list() {
        assert!(Reason::Support.skips_signature());
        assert!(Reason::AttackBurnDefender.skips_signature());
        assert!(!Reason::Seed.skips_signature());
        assert!(Reason::Support.skips_nonce() && Reason::ServerTransfer.skips_nonce());
        assert!(!Reason::AttackBurnDefender.skips_nonce());
        assert!(!Reason::Dig.skips_nonce() && !Reason::BackfillAlign.skips_nonce());
        assert!(Reason::CastleBonus.exempt_from_dig_id());
        assert!(!Reason::Dig.exempt_from_dig_id());
    }
}
