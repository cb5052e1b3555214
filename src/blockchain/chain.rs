use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::block::{Block, GENESIS_PREVIOUS_HASH};
use super::clock::{Clock, SystemClock};
use super::crypto::Address;
use super::mining::{CancelToken, MiningControl, MiningError};
use super::transaction::{Transaction, TransactionError};
use crate::config::{ChainConfig, ConfigError};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("Mining failed: {0}")]
    Mining(#[from] MiningError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("System error: {0}")]
    SystemError(String),
}

/// The first rule a chain breaks, by block position
#[derive(Debug, Error)]
pub enum ChainValidationError {
    #[error("Transaction {transaction} in block {position} is invalid: {source}")]
    InvalidTransaction {
        position: usize,
        transaction: usize,
        #[source]
        source: TransactionError,
    },

    #[error("Hash of block {position} does not match its contents")]
    HashMismatch { position: usize },

    #[error("Block {position} does not point at the hash of its predecessor")]
    BrokenLink { position: usize },
}

/// Poisoning only records that another thread panicked; every mutation here is a
/// single push or assignment, so the data behind the lock is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Represents the blockchain
///
/// Clones share the same blocks and pending pool. The pending pool is always
/// locked before the blocks.
#[derive(Clone)]
pub struct Blockchain {
    /// The chain of blocks
    chain: Arc<Mutex<Vec<Block>>>,

    /// Pending transactions to be included in the next block
    pending_transactions: Arc<Mutex<Vec<Transaction>>>,

    config: ChainConfig,

    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blockchain")
            .field("length", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// Creates a new blockchain with default parameters and the system clock
    pub fn new() -> Self {
        Self::build(ChainConfig::default(), Arc::new(SystemClock))
    }

    /// Creates a new blockchain from explicit parameters and time source
    pub fn with_config(config: ChainConfig, clock: Arc<dyn Clock>) -> Result<Self, BlockchainError> {
        config.validate()?;
        Ok(Self::build(config, clock))
    }

    fn build(config: ChainConfig, clock: Arc<dyn Clock>) -> Self {
        let genesis = Self::create_genesis_block(clock.as_ref());
        info!(
            "Created chain with genesis block {} (difficulty {}, reward {})",
            genesis.hash, config.difficulty, config.mining_reward
        );

        Blockchain {
            chain: Arc::new(Mutex::new(vec![genesis])),
            pending_transactions: Arc::new(Mutex::new(Vec::new())),
            config,
            clock,
        }
    }

    /// Creates the genesis block (first block in the chain)
    fn create_genesis_block(clock: &dyn Clock) -> Block {
        Block::new(0, clock.now(), Vec::new(), GENESIS_PREVIOUS_HASH.to_string())
    }

    pub fn difficulty(&self) -> usize {
        self.config.difficulty
    }

    pub fn mining_reward(&self) -> u64 {
        self.config.mining_reward
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> usize {
        lock(&self.chain).len()
    }

    /// A chain holds at least its genesis block
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Gets the last block in the chain
    pub fn latest_block(&self) -> Block {
        let chain = lock(&self.chain);
        // The genesis block is never removed
        chain[chain.len() - 1].clone()
    }

    /// Gets a snapshot of the entire blockchain
    pub fn blocks(&self) -> Vec<Block> {
        lock(&self.chain).clone()
    }

    /// Gets a snapshot of the pending transactions
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        lock(&self.pending_transactions).clone()
    }

    /// Adds a new transaction to the pending transactions
    ///
    /// Only the signature is checked. Balances are not, so a sender may commit
    /// more than it holds.
    ///
    /// # Returns
    ///
    /// The index of the block that will include this transaction
    pub fn add_transaction(&self, transaction: Transaction) -> Result<u64, BlockchainError> {
        match transaction.is_valid() {
            Ok(true) => {}
            Ok(false) => {
                warn!("Rejected transaction {}: bad signature", transaction.calculate_hash());
                return Err(TransactionError::InvalidSignature.into());
            }
            Err(err) => {
                warn!("Rejected transaction {}: {}", transaction.calculate_hash(), err);
                return Err(err.into());
            }
        }

        let mut pending = lock(&self.pending_transactions);
        debug!("Admitted transaction {}", transaction.calculate_hash());
        pending.push(transaction);

        Ok(lock(&self.chain).len() as u64)
    }

    /// Mines a new block with the pending transactions
    ///
    /// The reward for this block is not part of it: afterwards the pending pool
    /// holds exactly one reward transaction for `reward_address`, settled by the
    /// next mining round.
    pub fn mine_pending_transactions(&self, reward_address: &Address) -> Result<Block, BlockchainError> {
        self.mine_pending_transactions_with(reward_address, &CancelToken::new())
    }

    /// Like [`Blockchain::mine_pending_transactions`], stopping early when `token`
    /// is cancelled or the configured timeout passes. A stopped run leaves the
    /// chain and the pending pool untouched.
    pub fn mine_pending_transactions_with(
        &self,
        reward_address: &Address,
        token: &CancelToken,
    ) -> Result<Block, BlockchainError> {
        let control = MiningControl::new(token.clone(), self.config.mining_timeout);

        // Both locks stay held so no transaction can slip in between the
        // snapshot and the reset of the pool
        let mut pending = lock(&self.pending_transactions);
        let mut chain = lock(&self.chain);

        let previous_hash = chain
            .last()
            .map(|block| block.hash.clone())
            .ok_or_else(|| BlockchainError::SystemError("chain has no genesis block".to_string()))?;

        let mut block = Block::new(chain.len() as u64, self.clock.now(), pending.clone(), previous_hash);
        info!(
            "Mining block {} with {} transactions at difficulty {}",
            block.index,
            block.transactions.len(),
            self.config.difficulty
        );

        if let Err(err) = block.mine(self.config.difficulty, &control) {
            warn!("Abandoned block {}: {}", block.index, err);
            return Err(err.into());
        }

        chain.push(block.clone());
        *pending = vec![Transaction::reward(reward_address.clone(), self.config.mining_reward)];

        Ok(block)
    }

    /// Mines on a blocking worker thread of the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn spawn_mining(&self, reward_address: Address) -> MiningJob {
        let token = CancelToken::new();
        let job_token = token.clone();
        let chain = self.clone();

        let handle = tokio::task::spawn_blocking(move || {
            chain.mine_pending_transactions_with(&reward_address, &job_token)
        });

        MiningJob { token, handle }
    }

    /// Replays every mined transaction to compute the settled balance of `address`
    ///
    /// Pending transactions are ignored. The result is negative when the address
    /// has sent more than it received.
    pub fn get_balance_of_address(&self, address: &Address) -> i128 {
        let chain = lock(&self.chain);
        let mut balance: i128 = 0;

        for transaction in chain.iter().flat_map(|block| block.transactions.iter()) {
            if transaction.from_address.as_ref() == Some(address) {
                balance -= i128::from(transaction.amount);
            }
            if &transaction.to_address == address {
                balance += i128::from(transaction.amount);
            }
        }

        balance
    }

    /// Validates the blockchain, reporting the first violation found
    pub fn validate(&self) -> Result<(), ChainValidationError> {
        validate_blocks(&lock(&self.chain))
    }

    /// Validates the blockchain
    ///
    /// # Returns
    ///
    /// true if the blockchain is valid, false otherwise
    pub fn is_chain_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!("Chain validation failed: {}", err);
                false
            }
        }
    }
}

/// Checks signatures, stored hashes and links of every block after the genesis block
pub fn validate_blocks(blocks: &[Block]) -> Result<(), ChainValidationError> {
    for (position, pair) in blocks.windows(2).enumerate() {
        let (previous_block, current_block) = (&pair[0], &pair[1]);
        let position = position + 1;

        for (index, transaction) in current_block.transactions.iter().enumerate() {
            let failure = match transaction.is_valid() {
                Ok(true) => continue,
                Ok(false) => TransactionError::InvalidSignature,
                Err(err) => err,
            };
            return Err(ChainValidationError::InvalidTransaction {
                position,
                transaction: index,
                source: failure,
            });
        }

        if current_block.hash != current_block.calculate_hash() {
            return Err(ChainValidationError::HashMismatch { position });
        }

        if current_block.previous_hash != previous_block.hash {
            return Err(ChainValidationError::BrokenLink { position });
        }
    }

    Ok(())
}

/// A mining run executing on a background worker
#[derive(Debug)]
pub struct MiningJob {
    token: CancelToken,
    handle: JoinHandle<Result<Block, BlockchainError>>,
}

impl MiningJob {
    /// Asks the worker to stop; the chain is left unchanged if it does
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A handle that cancels this job when triggered
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Waits for the mined block or the reason mining stopped
    pub async fn wait(self) -> Result<Block, BlockchainError> {
        self.handle
            .await
            .map_err(|e| BlockchainError::SystemError(format!("mining worker failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::clock::FixedClock;
    use crate::blockchain::crypto::DigitalSignature;
    use crate::blockchain::KeyPair;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn fixed_clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
    }

    fn chain_with(config: ChainConfig) -> Blockchain {
        Blockchain::with_config(config, fixed_clock()).unwrap()
    }

    fn unmineable() -> ChainConfig {
        ChainConfig {
            difficulty: 64,
            ..ChainConfig::default()
        }
    }

    fn signed_transfer(sender: &KeyPair, recipient: &Address, amount: u64) -> Transaction {
        let mut transaction = Transaction::new(sender.address().clone(), recipient.clone(), amount);
        transaction.sign(sender).unwrap();
        transaction
    }

    #[test]
    fn test_new_blockchain() {
        let blockchain = Blockchain::new();
        let chain = blockchain.blocks();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index, 0);
        assert_eq!(chain[0].previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(chain[0].transactions.is_empty());
        assert!(blockchain.pending_transactions().is_empty());
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = Blockchain::with_config(
            ChainConfig {
                difficulty: 65,
                ..ChainConfig::default()
            },
            fixed_clock(),
        );
        assert!(matches!(result, Err(BlockchainError::Config(_))));
    }

    #[test]
    fn test_add_transaction() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();

        let block_index = blockchain
            .add_transaction(signed_transfer(&sender, recipient.address(), 10))
            .unwrap();

        assert_eq!(block_index, 1);
        assert_eq!(blockchain.pending_transactions().len(), 1);
    }

    #[test]
    fn test_add_unsigned_transaction_is_rejected() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let transaction = Transaction::new(sender.address().clone(), recipient.address().clone(), 10);

        let result = blockchain.add_transaction(transaction);

        assert!(matches!(
            result,
            Err(BlockchainError::InvalidTransaction(TransactionError::MissingSignature))
        ));
        assert!(blockchain.pending_transactions().is_empty());
    }

    #[test]
    fn test_add_tampered_transaction_is_rejected() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let mut transaction = signed_transfer(&sender, recipient.address(), 10);
        transaction.amount = 11;

        let result = blockchain.add_transaction(transaction);

        assert!(matches!(
            result,
            Err(BlockchainError::InvalidTransaction(TransactionError::InvalidSignature))
        ));
        assert!(blockchain.pending_transactions().is_empty());
    }

    #[test]
    fn test_overspending_is_not_checked_on_admission() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();

        blockchain
            .add_transaction(signed_transfer(&sender, recipient.address(), 1_000_000))
            .unwrap();
        blockchain.mine_pending_transactions(recipient.address()).unwrap();

        assert_eq!(blockchain.get_balance_of_address(sender.address()), -1_000_000);
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_mine_block() {
        let blockchain = chain_with(ChainConfig::default());
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let genesis_hash = blockchain.latest_block().hash;

        blockchain
            .add_transaction(signed_transfer(&sender, recipient.address(), 10))
            .unwrap();
        let block = blockchain.mine_pending_transactions(sender.address()).unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, genesis_hash);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.has_valid_proof(blockchain.difficulty()));
        assert_eq!(blockchain.latest_block(), block);

        // The pool now holds only the reward for this round
        let pending = blockchain.pending_transactions();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_reward());
        assert_eq!(&pending[0].to_address, sender.address());
        assert_eq!(pending[0].amount, blockchain.mining_reward());
    }

    #[test]
    fn test_mining_empty_pool_still_extends_chain() {
        let blockchain = Blockchain::new();
        let miner = KeyPair::generate();

        let block = blockchain.mine_pending_transactions(miner.address()).unwrap();

        assert!(block.transactions.is_empty());
        assert_eq!(blockchain.len(), 2);
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_reward_is_credited_one_round_late() {
        let blockchain = Blockchain::new();
        let miner = KeyPair::generate();

        blockchain.mine_pending_transactions(miner.address()).unwrap();
        assert_eq!(blockchain.get_balance_of_address(miner.address()), 0);

        blockchain.mine_pending_transactions(miner.address()).unwrap();
        assert_eq!(blockchain.get_balance_of_address(miner.address()), 100);
    }

    #[test]
    fn test_balance_ignores_pending_transactions() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();

        blockchain
            .add_transaction(signed_transfer(&sender, recipient.address(), 30))
            .unwrap();

        assert_eq!(blockchain.get_balance_of_address(sender.address()), 0);
        assert_eq!(blockchain.get_balance_of_address(recipient.address()), 0);
    }

    #[test]
    fn test_blockchain_validity() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();

        for amount in [10, 20, 30] {
            blockchain
                .add_transaction(signed_transfer(&sender, recipient.address(), amount))
                .unwrap();
            blockchain.mine_pending_transactions(sender.address()).unwrap();
        }

        assert_eq!(blockchain.len(), 4);
        assert!(blockchain.validate().is_ok());
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_tampered_transfer_amount_invalidates_chain() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();

        blockchain
            .add_transaction(signed_transfer(&sender, recipient.address(), 10))
            .unwrap();
        blockchain.mine_pending_transactions(sender.address()).unwrap();

        lock(&blockchain.chain)[1].transactions[0].amount = 10_000;

        assert!(matches!(
            blockchain.validate(),
            Err(ChainValidationError::InvalidTransaction { position: 1, transaction: 0, .. })
        ));
        assert!(!blockchain.is_chain_valid());
    }

    #[test]
    fn test_stripped_signature_invalidates_chain() {
        let blockchain = Blockchain::new();
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();

        blockchain
            .add_transaction(signed_transfer(&sender, recipient.address(), 10))
            .unwrap();
        blockchain.mine_pending_transactions(sender.address()).unwrap();

        lock(&blockchain.chain)[1].transactions[0].signature = Some(DigitalSignature::from_hex(""));

        assert!(matches!(
            blockchain.validate(),
            Err(ChainValidationError::InvalidTransaction {
                source: TransactionError::MissingSignature,
                ..
            })
        ));
    }

    #[test]
    fn test_tampered_reward_breaks_block_hash() {
        let blockchain = Blockchain::new();
        let miner = KeyPair::generate();

        blockchain.mine_pending_transactions(miner.address()).unwrap();
        blockchain.mine_pending_transactions(miner.address()).unwrap();

        // Rewards carry no signature, so only the block hash catches this
        lock(&blockchain.chain)[2].transactions[0].amount = 1_000_000;

        assert!(matches!(
            blockchain.validate(),
            Err(ChainValidationError::HashMismatch { position: 2 })
        ));
        assert!(!blockchain.is_chain_valid());
    }

    #[test]
    fn test_rehashed_block_breaks_link() {
        let blockchain = Blockchain::new();
        let miner = KeyPair::generate();

        for _ in 0..3 {
            blockchain.mine_pending_transactions(miner.address()).unwrap();
        }

        {
            let mut chain = lock(&blockchain.chain);
            chain[2].transactions[0].amount = 1_000_000;
            chain[2].hash = chain[2].calculate_hash();
        }

        assert!(matches!(
            blockchain.validate(),
            Err(ChainValidationError::BrokenLink { position: 3 })
        ));
    }

    #[test]
    fn test_cancelled_mining_leaves_state_unchanged() {
        let blockchain = chain_with(unmineable());
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        blockchain
            .add_transaction(signed_transfer(&sender, recipient.address(), 10))
            .unwrap();
        let pending_before = blockchain.pending_transactions();

        let token = CancelToken::new();
        token.cancel();
        let result = blockchain.mine_pending_transactions_with(sender.address(), &token);

        assert!(matches!(
            result,
            Err(BlockchainError::Mining(MiningError::Cancelled { .. }))
        ));
        assert_eq!(blockchain.len(), 1);
        assert_eq!(blockchain.pending_transactions(), pending_before);
    }

    #[test]
    fn test_mining_timeout_leaves_state_unchanged() {
        let blockchain = chain_with(ChainConfig {
            mining_timeout: Some(Duration::ZERO),
            ..unmineable()
        });
        let miner = KeyPair::generate();

        let result = blockchain.mine_pending_transactions(miner.address());

        assert!(matches!(
            result,
            Err(BlockchainError::Mining(MiningError::TimedOut { .. }))
        ));
        assert_eq!(blockchain.len(), 1);
        assert!(blockchain.pending_transactions().is_empty());
    }

    #[test]
    fn test_huge_mining_timeout_does_not_panic() {
        let config = ChainConfig::from_toml_str("mining_timeout_secs = 9223372036854775807").unwrap();
        let blockchain = chain_with(config);
        let miner = KeyPair::generate();

        let block = blockchain.mine_pending_transactions(miner.address()).unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(blockchain.len(), 2);
        assert!(!blockchain.is_empty());
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_concurrent_submissions_are_all_mined() {
        let blockchain = Blockchain::new();
        let recipient = KeyPair::generate();
        let senders: Vec<KeyPair> = (0..8).map(|_| KeyPair::generate()).collect();

        std::thread::scope(|scope| {
            for sender in &senders {
                let blockchain = blockchain.clone();
                let recipient = recipient.address().clone();
                scope.spawn(move || {
                    blockchain
                        .add_transaction(signed_transfer(sender, &recipient, 5))
                        .unwrap();
                });
            }
        });

        let block = blockchain.mine_pending_transactions(recipient.address()).unwrap();

        assert_eq!(block.transactions.len(), senders.len());
        assert_eq!(blockchain.get_balance_of_address(recipient.address()), 40);
        assert!(blockchain.is_chain_valid());
    }

    #[tokio::test]
    async fn test_background_mining() {
        let blockchain = Blockchain::new();
        let miner = KeyPair::generate();

        let block = blockchain.spawn_mining(miner.address().clone()).wait().await.unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(blockchain.len(), 2);
        assert!(blockchain.is_chain_valid());
    }

    #[tokio::test]
    async fn test_background_mining_can_be_cancelled() {
        let blockchain = chain_with(unmineable());
        let miner = KeyPair::generate();

        let job = blockchain.spawn_mining(miner.address().clone());
        let token = job.token();
        assert!(!token.is_cancelled());
        job.cancel();
        assert!(token.is_cancelled());
        let result = job.wait().await;

        assert!(matches!(
            result,
            Err(BlockchainError::Mining(MiningError::Cancelled { .. }))
        ));
        assert_eq!(blockchain.len(), 1);
        assert!(blockchain.pending_transactions().is_empty());
    }
}
