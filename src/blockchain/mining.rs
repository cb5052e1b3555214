use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

/// How many nonces are tried between cancellation and deadline checks
const CHECK_INTERVAL: u64 = 4096;

/// Errors that stop a proof-of-work search before a nonce is found
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiningError {
    #[error("Mining was cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    #[error("Mining timed out after {attempts} attempts")]
    TimedOut { attempts: u64 },

    #[error("Nonce space exhausted")]
    NonceExhausted,
}

/// A cloneable flag used to stop a running proof-of-work search
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stop conditions for a single mining run
#[derive(Debug, Clone, Default)]
pub struct MiningControl {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl MiningControl {
    /// A run that only stops once a nonce is found
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A run bounded by `token` and, when given, by `timeout`.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn new(token: CancelToken, timeout: Option<Duration>) -> Self {
        MiningControl {
            token,
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
        }
    }

    /// Checks the stop conditions, cheaply skipping most attempts
    pub(crate) fn check(&self, attempts: u64) -> Result<(), MiningError> {
        if attempts % CHECK_INTERVAL != 0 {
            return Ok(());
        }

        if self.token.is_cancelled() {
            return Err(MiningError::Cancelled { attempts });
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(MiningError::TimedOut { attempts }),
            _ => Ok(()),
        }
    }
}

/// Whether `hash` starts with `difficulty` zero symbols
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
