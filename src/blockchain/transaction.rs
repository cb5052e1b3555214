use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{sha256, verify_signature, Address, DigitalSignature, KeyPair};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Cannot sign a transaction for another wallet: signer {signer}, sender {sender}")]
    Unauthorized { signer: Address, sender: String },

    #[error("No signature in this transaction")]
    MissingSignature,

    #[error("Invalid signature")]
    InvalidSignature,
}

/// A transfer of `amount` from one address to another.
///
/// Reward transactions have no sender; they are issued by the chain itself and
/// never carry a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's address, `None` for a reward transaction
    pub from_address: Option<Address>,

    /// Recipient's address
    pub to_address: Address,

    /// Amount being transferred
    pub amount: u64,

    /// DER signature over the content hash, absent until signed
    pub signature: Option<DigitalSignature>,
}

impl Transaction {
    /// Creates a new unsigned transaction
    pub fn new(from_address: Address, to_address: Address, amount: u64) -> Self {
        Transaction {
            from_address: Some(from_address),
            to_address,
            amount,
            signature: None,
        }
    }

    /// Creates a reward transaction (mining reward issued by the chain)
    pub fn reward(to_address: Address, amount: u64) -> Self {
        Transaction {
            from_address: None,
            to_address,
            amount,
            signature: None,
        }
    }

    /// Checks if the transaction is a reward transaction
    pub fn is_reward(&self) -> bool {
        self.from_address.is_none()
    }

    /// Calculates the hash of `(from_address, to_address, amount)` as hex.
    ///
    /// The signature is not part of the hash.
    pub fn calculate_hash(&self) -> String {
        let data = serde_json::json!({
            "from_address": self.from_address,
            "to_address": self.to_address,
            "amount": self.amount,
        });

        hex::encode(sha256(data.to_string().as_bytes()))
    }

    /// Signs the transaction with a key pair
    ///
    /// Only the owner of `from_address` may sign; any other key pair is rejected
    /// and the transaction is left untouched.
    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), TransactionError> {
        if self.from_address.as_ref() != Some(key_pair.address()) {
            return Err(TransactionError::Unauthorized {
                signer: key_pair.address().clone(),
                sender: self
                    .from_address
                    .as_ref()
                    .map(Address::to_string)
                    .unwrap_or_else(|| "<reward>".to_string()),
            });
        }

        let hash = self.calculate_hash();
        self.signature = Some(key_pair.sign(hash.as_bytes()));

        Ok(())
    }

    /// Checks the transaction's signature against its sender
    ///
    /// # Returns
    ///
    /// `Ok(true)` for reward transactions and correctly signed transfers, `Ok(false)`
    /// when the signature does not match, `Err(MissingSignature)` when a transfer
    /// was never signed.
    pub fn is_valid(&self) -> Result<bool, TransactionError> {
        let from_address = match &self.from_address {
            Some(address) => address,
            None => return Ok(true),
        };

        let signature = match &self.signature {
            Some(sig) if !sig.is_empty() => sig,
            _ => return Err(TransactionError::MissingSignature),
        };

        let hash = self.calculate_hash();
        let valid = verify_signature(from_address, signature, hash.as_bytes());
        if !valid {
            warn!("Signature check failed for transaction {}", hash);
        }

        Ok(valid)
    }
}
