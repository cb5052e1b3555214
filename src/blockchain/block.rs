use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::crypto::sha256;
use super::mining::{meets_difficulty, MiningControl, MiningError};
use super::transaction::Transaction;

/// Previous-hash value carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Timestamp when the block was created
    pub timestamp: DateTime<Utc>,

    /// Transactions included in this block, in committed order
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Hash of the current block
    pub hash: String,

    /// Proof of work counter
    pub nonce: u64,
}

impl Block {
    /// Creates a new block with nonce 0 and its hash already computed
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `timestamp` - The creation time of the block
    /// * `transactions` - The list of transactions to include in the block
    /// * `previous_hash` - The hash of the previous block
    pub fn new(
        index: u64,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        previous_hash: String,
    ) -> Self {
        let mut block = Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            hash: String::new(),
            nonce: 0,
        };

        block.hash = block.calculate_hash();
        block
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 hash of the block as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        let block_data = serde_json::json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "timestamp": self.timestamp,
            "transactions": self.transactions,
            "nonce": self.nonce,
        });

        hex::encode(sha256(block_data.to_string().as_bytes()))
    }

    /// Searches for a nonce whose hash starts with `difficulty` zeros.
    ///
    /// On error the block is left with whatever nonce was last tried and must
    /// be discarded.
    pub fn mine(&mut self, difficulty: usize, control: &MiningControl) -> Result<(), MiningError> {
        let mut attempts: u64 = 0;

        while !meets_difficulty(&self.hash, difficulty) {
            control.check(attempts)?;

            self.nonce = self.nonce.checked_add(1).ok_or(MiningError::NonceExhausted)?;
            self.hash = self.calculate_hash();
            attempts += 1;
        }

        debug!("Found nonce {} after {} attempts", self.nonce, attempts);
        info!("Block mined: {}", self.hash);
        Ok(())
    }

    /// Whether the stored hash is reproducible and satisfies `difficulty`
    pub fn has_valid_proof(&self, difficulty: usize) -> bool {
        self.hash == self.calculate_hash() && meets_difficulty(&self.hash, difficulty)
    }
}
