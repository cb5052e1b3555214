//! A single-process proof-of-work ledger.
//!
//! Transfers are signed with secp256k1 ECDSA over SHA-256 digests, batched into
//! blocks that are hash-chained and sealed by a mined nonce. Balances are derived
//! by replaying every mined transaction.

pub mod blockchain;
pub mod config;

pub use blockchain::{Address, Block, Blockchain, BlockchainError, KeyPair, Transaction};
pub use config::ChainConfig;
