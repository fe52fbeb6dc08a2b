/// Validation logic for transactions separated from type definitions
use crate::crypto::{is_valid_public_key, verify_hex_signature};
use crate::error::ChainError;
use crate::transaction::types::{SystemSeal, Transaction, TxKind, TxSignature};

impl Transaction {
    /// Checks the signature slot without access to ledger state.
    ///
    /// Coinbase transactions and system-sealed transactions pass here; whether a
    /// seal is allowed in its position is decided by block validation.
    pub fn validate_signature(&self) -> Result<(), ChainError> {
        if matches!(self.kind, TxKind::Coinbase { .. }) {
            return Ok(());
        }
        match &self.signature {
            TxSignature::System(_) => Ok(()),
            TxSignature::Unsigned => Err(ChainError::InvalidSignature(format!(
                "{} for {} is not signed",
                self.tx_type().as_str(),
                self.uid
            ))),
            TxSignature::Signed(signature) => {
                verify_hex_signature(&self.requester, &self.signable_message(), signature)
                    .map_err(|e| ChainError::InvalidSignature(e.to_string()))
            }
        }
    }

    /// Boolean form of [`Transaction::validate_signature`].
    pub fn verify(&self) -> bool {
        self.validate_signature().is_ok()
    }

    /// Structural checks that hold regardless of ledger state.
    pub fn validate_stateless(&self) -> Result<(), ChainError> {
        self.validate_size()?;

        if self.uid.trim().is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Item identifier must not be empty".to_string(),
            ));
        }

        let amount = self.amount();
        if !amount.is_finite() || amount < 0.0 {
            return Err(ChainError::InvalidTransaction(format!(
                "Amount must be a non-negative finite number, got {}",
                amount
            )));
        }

        // System transactions may name the genesis placeholder or any miner string.
        if !self.is_system() && !is_valid_public_key(&self.requester) {
            return Err(ChainError::InvalidTransaction(
                "Requester is not a valid public key".to_string(),
            ));
        }

        match &self.kind {
            TxKind::Transfer { amount, recipient } if !self.is_system() => {
                if *amount <= 0.0 {
                    return Err(ChainError::InvalidTransaction(
                        "Transfer amount must be positive".to_string(),
                    ));
                }
                if !is_valid_public_key(recipient) {
                    return Err(ChainError::InvalidTransaction(
                        "Transfer recipient is not a valid public key".to_string(),
                    ));
                }
                if *recipient == self.requester {
                    return Err(ChainError::InvalidTransaction(
                        "Cannot transfer to yourself".to_string(),
                    ));
                }
            }
            TxKind::BuyoutOffer { amount } if *amount <= 0.0 => {
                return Err(ChainError::InvalidTransaction(
                    "Buyout offer must be positive".to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// Seals a transaction kind may legitimately carry inside a block.
    pub(crate) fn seal_allowed(&self) -> bool {
        match (self.system_seal(), &self.kind) {
            (None, _) => true,
            (Some(SystemSeal::Coinbase), TxKind::Coinbase { .. }) => true,
            (Some(SystemSeal::BuyoutPayment), TxKind::Transfer { .. }) => true,
            (Some(SystemSeal::EscrowDistribution), TxKind::Transfer { .. }) => true,
            _ => false,
        }
    }
}
