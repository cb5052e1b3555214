// Blockchain module
//
// This module contains the core ledger implementation including:
// - Key pairs, signing and verification over secp256k1
// - Transaction structure
// - Block structure and proof of work
// - Blockchain structure, balances and validation

pub mod block;
pub mod chain;
pub mod clock;
pub mod crypto;
pub mod mining;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{validate_blocks, Blockchain, BlockchainError, ChainValidationError, MiningJob};
pub use clock::{Clock, FixedClock, SystemClock};
pub use crypto::{verify_signature, Address, CryptoError, DigitalSignature, KeyPair};
pub use mining::{CancelToken, MiningError};
pub use transaction::{Transaction, TransactionError};
