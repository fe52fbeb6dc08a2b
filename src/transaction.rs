//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::error::ChainError;

    #[test]
    fn test_signed_request_verifies() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::request(keypair.public_key_hex(), "printer-3")
            .signed(&keypair)
            .unwrap();
        assert!(tx.verify());
    }

    #[test]
    fn test_unsigned_transaction_fails() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::request(keypair.public_key_hex(), "printer-3");
        assert!(!tx.verify());
        assert!(matches!(
            tx.validate_signature(),
            Err(ChainError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_amount_is_outside_signed_payload() {
        let keypair = KeyPair::generate().unwrap();
        let mut tx = Transaction::request(keypair.public_key_hex(), "desk-12")
            .signed(&keypair)
            .unwrap();
        tx.price(10.0, Some(RequestPricing::Regular));
        assert!(tx.verify());
        assert_eq!(tx.amount(), 10.0);
    }

    #[test]
    fn test_mutating_signable_fields_breaks_signature() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::request(keypair.public_key_hex(), "desk-12")
            .signed(&keypair)
            .unwrap();

        let mut other_uid = tx.clone();
        other_uid.uid = "desk-13".to_string();
        assert!(!other_uid.verify());

        let mut other_time = tx.clone();
        other_time.timestamp += 1;
        assert!(!other_time.verify());

        let mut other_kind = tx.clone();
        other_kind.kind = TxKind::Release { amount: 0.0 };
        assert!(!other_kind.verify());

        let intruder = KeyPair::generate().unwrap();
        let mut other_requester = tx;
        other_requester.requester = intruder.public_key_hex();
        assert!(!other_requester.verify());
    }

    #[test]
    fn test_signing_with_foreign_key_is_refused() {
        let owner = KeyPair::generate().unwrap();
        let intruder = KeyPair::generate().unwrap();
        let mut tx = Transaction::release(owner.public_key_hex(), "desk-12");
        assert!(tx.sign(&intruder).is_err());
    }

    #[test]
    fn test_system_seals_pass_signature_check() {
        let coinbase = Transaction::coinbase("miner", "COINBASE_BLOCK_1", 50.0, SystemSeal::Coinbase);
        assert!(coinbase.verify());
        assert!(coinbase.seal_allowed());

        let payment =
            Transaction::system_transfer("a", "b", "BUYOUT_X_1", 10.0, SystemSeal::BuyoutPayment);
        assert!(payment.verify());
        assert!(payment.seal_allowed());

        let mut forged = Transaction::request("a", "X");
        forged.signature = TxSignature::System(SystemSeal::BuyoutPayment);
        assert!(!forged.seal_allowed());
    }

    #[test]
    fn test_wire_format_is_flat_with_type_tag() {
        let keypair = KeyPair::generate().unwrap();
        let recipient = KeyPair::generate().unwrap();
        let tx = Transaction::transfer(keypair.public_key_hex(), recipient.public_key_hex(), 3.0)
            .signed(&keypair)
            .unwrap();

        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["type"], "TRANSFER");
        assert_eq!(value["amount"], 3.0);
        assert_eq!(value["recipient"], recipient.public_key_hex());
        assert!(value["signature"].is_string());

        let decoded: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, tx);
        assert!(decoded.verify());
    }

    #[test]
    fn test_sentinel_signature_wire_form() {
        let coinbase = Transaction::coinbase("miner", "COINBASE_BLOCK_7", 50.0, SystemSeal::Coinbase);
        let value = serde_json::to_value(&coinbase).unwrap();
        assert_eq!(value["signature"], "COINBASE");

        let unsigned = Transaction::release("someone", "X");
        let value = serde_json::to_value(&unsigned).unwrap();
        assert!(value["signature"].is_null());

        let decoded: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.signature, TxSignature::Unsigned);
    }

    #[test]
    fn test_id_changes_with_amount() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::request(keypair.public_key_hex(), "X")
            .signed(&keypair)
            .unwrap();
        let mut priced = tx.clone();
        priced.price(10.0, Some(RequestPricing::Regular));
        assert_ne!(tx.id(), priced.id());
        assert_eq!(tx.id(), tx.clone().id());
    }

    #[test]
    fn test_stateless_validation() {
        let keypair = KeyPair::generate().unwrap();
        let pk = keypair.public_key_hex();

        assert!(Transaction::request(pk.clone(), "X").validate_stateless().is_ok());
        assert!(Transaction::request(pk.clone(), "  ").validate_stateless().is_err());
        assert!(Transaction::request("not-a-key", "X").validate_stateless().is_err());
        assert!(Transaction::transfer(pk.clone(), pk.clone(), 1.0)
            .validate_stateless()
            .is_err());

        let other = KeyPair::generate().unwrap().public_key_hex();
        assert!(Transaction::transfer(pk.clone(), other.clone(), 0.0)
            .validate_stateless()
            .is_err());
        assert!(Transaction::transfer(pk.clone(), other, f64::NAN)
            .validate_stateless()
            .is_err());
        assert!(Transaction::buyout_offer(pk, "X", 0.0).validate_stateless().is_err());
    }

    #[test]
    fn test_oversized_transaction_rejected() {
        let tx = Transaction::request("a".repeat(MAX_TRANSACTION_SIZE), "X");
        assert!(tx.validate_size().is_err());
    }
}
