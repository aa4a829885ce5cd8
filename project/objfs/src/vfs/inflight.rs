//! Cancellation tokens for requests the kernel may interrupt.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// Live requests keyed by the FUSE request `unique`.
#[derive(Default)]
pub struct InFlight {
    tokens: Mutex<HashMap<u64, CancellationToken>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `unique`; the entry goes away when the guard drops.
    pub fn begin(&self, unique: u64) -> InFlightGuard<'_> {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unique, token.clone());
        InFlightGuard {
            owner: self,
            unique,
            token,
        }
    }

    /// Cancels the request if it is still running. Returns whether it was.
    pub fn cancel(&self, unique: u64) -> bool {
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&unique)
            .cloned();
        match token {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels everything; used on unmount.
    pub fn cancel_all(&self) {
        for token in self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
    unique: u64,
    token: CancellationToken,
}

impl InFlightGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.unique);
    }
}
