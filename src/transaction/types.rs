/// Transaction types for Holdchain
use crate::crypto::{sha256_hex, KeyPair, PublicKeyHex};
use crate::economics::Credits;
use crate::error::ChainError;
use serde::{Deserialize, Serialize};

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// The discriminant carried in the `type` field of a serialized transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    Coinbase,
    Request,
    Release,
    Transfer,
    BuyoutOffer,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Coinbase => "COINBASE",
            TxType::Request => "REQUEST",
            TxType::Release => "RELEASE",
            TxType::Transfer => "TRANSFER",
            TxType::BuyoutOffer => "BUYOUT_OFFER",
        }
    }
}

/// How a REQUEST was priced. Signed requests start out `Unpriced`; admission
/// and mining assign the class and the matching amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPricing {
    #[default]
    Unpriced,
    /// Item was free; pays the base cost.
    Regular,
    /// Item was held and the requester could afford its current value.
    Buyout,
    /// Item was held and the requester could only afford the demand penalty.
    Penalty,
}

/// Kind-specific payload of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxKind {
    Coinbase {
        amount: Credits,
    },
    Request {
        #[serde(default)]
        amount: Credits,
        #[serde(default)]
        pricing: RequestPricing,
    },
    Release {
        #[serde(default)]
        amount: Credits,
    },
    Transfer {
        amount: Credits,
        recipient: PublicKeyHex,
    },
    /// Deprecated offer book entry; admitted but never mined.
    BuyoutOffer {
        amount: Credits,
    },
}

impl TxKind {
    pub fn tx_type(&self) -> TxType {
        match self {
            TxKind::Coinbase { .. } => TxType::Coinbase,
            TxKind::Request { .. } => TxType::Request,
            TxKind::Release { .. } => TxType::Release,
            TxKind::Transfer { .. } => TxType::Transfer,
            TxKind::BuyoutOffer { .. } => TxType::BuyoutOffer,
        }
    }

    pub fn amount(&self) -> Credits {
        match self {
            TxKind::Coinbase { amount }
            | TxKind::Request { amount, .. }
            | TxKind::Release { amount }
            | TxKind::Transfer { amount, .. }
            | TxKind::BuyoutOffer { amount } => *amount,
        }
    }
}

/// Signatures that only the mining step may mint. They stand in for a real
/// signature on transactions the ledger synthesizes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemSeal {
    Genesis,
    Coinbase,
    BuyoutPayment,
    EscrowDistribution,
}

impl SystemSeal {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemSeal::Genesis => "GENESIS",
            SystemSeal::Coinbase => "COINBASE",
            SystemSeal::BuyoutPayment => "BUYOUT_PAYMENT",
            SystemSeal::EscrowDistribution => "ESCROW_DISTRIBUTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GENESIS" => Some(SystemSeal::Genesis),
            "COINBASE" => Some(SystemSeal::Coinbase),
            "BUYOUT_PAYMENT" => Some(SystemSeal::BuyoutPayment),
            "ESCROW_DISTRIBUTION" => Some(SystemSeal::EscrowDistribution),
            _ => None,
        }
    }
}

/// The signature slot of a transaction. On the wire this is a nullable string:
/// `null`, a hex ECDSA signature, or one of the system seal names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum TxSignature {
    #[default]
    Unsigned,
    Signed(String),
    System(SystemSeal),
}

impl From<Option<String>> for TxSignature {
    fn from(value: Option<String>) -> Self {
        match value {
            None => TxSignature::Unsigned,
            Some(s) => match SystemSeal::parse(&s) {
                Some(seal) => TxSignature::System(seal),
                None => TxSignature::Signed(s),
            },
        }
    }
}

impl From<TxSignature> for Option<String> {
    fn from(value: TxSignature) -> Self {
        match value {
            TxSignature::Unsigned => None,
            TxSignature::Signed(hex) => Some(hex),
            TxSignature::System(seal) => Some(seal.as_str().to_string()),
        }
    }
}

/// An economic or reservation event on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hex public key of the principal acting (the miner for coinbase).
    pub requester: PublicKeyHex,
    /// Item identifier; synthesized for transfers and system transactions.
    pub uid: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub signature: TxSignature,
    #[serde(flatten)]
    pub kind: TxKind,
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl Transaction {
    pub fn new(requester: impl Into<PublicKeyHex>, uid: impl Into<String>, kind: TxKind) -> Self {
        Transaction {
            requester: requester.into(),
            uid: uid.into(),
            timestamp: now_millis(),
            signature: TxSignature::Unsigned,
            kind,
        }
    }

    /// Request a hold on `uid`. The amount is priced on admission.
    pub fn request(requester: impl Into<PublicKeyHex>, uid: impl Into<String>) -> Self {
        Self::new(
            requester,
            uid,
            TxKind::Request {
                amount: 0.0,
                pricing: RequestPricing::Unpriced,
            },
        )
    }

    /// Release a held item. The refund is priced on admission and fixed at mining.
    pub fn release(requester: impl Into<PublicKeyHex>, uid: impl Into<String>) -> Self {
        Self::new(requester, uid, TxKind::Release { amount: 0.0 })
    }

    /// Send credits to another principal.
    pub fn transfer(
        requester: impl Into<PublicKeyHex>,
        recipient: impl Into<PublicKeyHex>,
        amount: Credits,
    ) -> Self {
        let uid = format!("TRANSFER_{:016x}", rand::random::<u64>());
        Self::new(
            requester,
            uid,
            TxKind::Transfer {
                amount,
                recipient: recipient.into(),
            },
        )
    }

    /// Legacy standing offer to buy a held item.
    pub fn buyout_offer(
        requester: impl Into<PublicKeyHex>,
        uid: impl Into<String>,
        amount: Credits,
    ) -> Self {
        Self::new(requester, uid, TxKind::BuyoutOffer { amount })
    }

    /// Coinbase minted by the mining step (or the genesis block).
    pub(crate) fn coinbase(
        beneficiary: impl Into<PublicKeyHex>,
        uid: impl Into<String>,
        amount: Credits,
        seal: SystemSeal,
    ) -> Self {
        let mut tx = Self::new(beneficiary, uid, TxKind::Coinbase { amount });
        tx.signature = TxSignature::System(seal);
        tx
    }

    /// Credit-only transfer synthesized by the mining step.
    pub(crate) fn system_transfer(
        from: impl Into<PublicKeyHex>,
        to: impl Into<PublicKeyHex>,
        uid: impl Into<String>,
        amount: Credits,
        seal: SystemSeal,
    ) -> Self {
        let mut tx = Self::new(
            from,
            uid,
            TxKind::Transfer {
                amount,
                recipient: to.into(),
            },
        );
        tx.signature = TxSignature::System(seal);
        tx
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tx_type(&self) -> TxType {
        self.kind.tx_type()
    }

    pub fn amount(&self) -> Credits {
        self.kind.amount()
    }

    pub fn recipient(&self) -> Option<&str> {
        match &self.kind {
            TxKind::Transfer { recipient, .. } => Some(recipient),
            _ => None,
        }
    }

    pub fn pricing(&self) -> Option<RequestPricing> {
        match &self.kind {
            TxKind::Request { pricing, .. } => Some(*pricing),
            _ => None,
        }
    }

    pub fn system_seal(&self) -> Option<SystemSeal> {
        match &self.signature {
            TxSignature::System(seal) => Some(*seal),
            _ => None,
        }
    }

    /// True for transactions synthesized by the ledger rather than signed by a principal.
    pub fn is_system(&self) -> bool {
        matches!(self.signature, TxSignature::System(_))
    }

    /// Overwrite the system-computed amount of a REQUEST or RELEASE.
    /// The amount is outside the signed payload, so this never invalidates the signature.
    pub(crate) fn price(&mut self, new_amount: Credits, new_pricing: Option<RequestPricing>) {
        match &mut self.kind {
            TxKind::Request { amount, pricing } => {
                *amount = new_amount;
                if let Some(p) = new_pricing {
                    *pricing = p;
                }
            }
            TxKind::Release { amount } => *amount = new_amount,
            _ => {}
        }
    }

    /// Canonical encoding of the immutable fields: sorted-key JSON of
    /// `{requester, uid, type, timestamp}`.
    pub fn signable_message(&self) -> Vec<u8> {
        let signable = serde_json::json!({
            "requester": self.requester,
            "uid": self.uid,
            "type": self.tx_type().as_str(),
            "timestamp": self.timestamp,
        });
        signable.to_string().into_bytes()
    }

    /// Sign the immutable fields with `keypair`, which must own the requester key.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        if keypair.public_key_hex() != self.requester {
            return Err(ChainError::InvalidSignature(
                "Signing key does not match the requester".to_string(),
            ));
        }
        let signature = keypair.sign(&self.signable_message())?;
        self.signature = TxSignature::Signed(hex::encode(signature));
        Ok(())
    }

    /// Builder form of [`Transaction::sign`].
    pub fn signed(mut self, keypair: &KeyPair) -> Result<Self, ChainError> {
        self.sign(keypair)?;
        Ok(self)
    }

    /// Full canonical JSON of the transaction, signature included.
    pub fn canonical_json(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_value(self)?.to_string())
    }

    /// Content identifier: SHA-256 of the full canonical JSON.
    pub fn id(&self) -> String {
        match self.canonical_json() {
            Ok(json) => sha256_hex(json.as_bytes()),
            Err(_) => sha256_hex(&self.signable_message()),
        }
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let size = self.canonical_json()?.len();
        if size > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                size, MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }
}
