//! At-most-once execution keyed by idempotency key
//!
//! The first caller for a key becomes its owner and runs the work; concurrent
//! callers wait and then receive the owner's result. An owner that gives up
//! without a result releases the key so the next caller can try again.
//! Completed results are kept until [`IdempotencyGuard::prune`] ages them out.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::core::Market;

enum Slot<T> {
    /// Dropping the sender wakes every waiter
    InFlight(watch::Sender<()>),
    Done(T, Instant),
}

pub struct IdempotencyGuard<T> {
    slots: RwLock<HashMap<String, Slot<T>>>,
}

/// Outcome of [`IdempotencyGuard::acquire`]
pub enum Acquired<T: Clone> {
    /// Caller owns the key and must run the work
    Owner(IdempotencyTicket<T>),
    /// Key already completed; the stored result
    Done(T),
}

impl<T: Clone> Default for IdempotencyGuard<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> std::fmt::Debug for IdempotencyGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("keys", &self.slots.read().len())
            .finish()
    }
}

impl<T: Clone> IdempotencyGuard<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Own the key, or wait for the current owner and return its result.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> Acquired<T> {
        loop {
            if let Some(Slot::Done(v, _)) = self.slots.read().get(key) {
                return Acquired::Done(v.clone());
            }

            let mut rx = {
                let mut slots = self.slots.write();
                match slots.get(key) {
                    Some(Slot::Done(v, _)) => return Acquired::Done(v.clone()),
                    Some(Slot::InFlight(tx)) => tx.subscribe(),
                    None => {
                        let (tx, _) = watch::channel(());
                        slots.insert(key.to_string(), Slot::InFlight(tx));
                        return Acquired::Owner(IdempotencyTicket {
                            guard: Arc::clone(self),
                            key: key.to_string(),
                            finished: false,
                        });
                    }
                }
            };

            debug!("Key {} in flight, waiting for owner", key);
            // Err once the owner completes or releases
            let _ = rx.changed().await;
        }
    }

    /// Non-blocking claim. `false` when the key is in flight or done.
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(key) {
            return false;
        }
        let (tx, _) = watch::channel(());
        slots.insert(key.to_string(), Slot::InFlight(tx));
        true
    }

    /// Drop an in-flight claim without a result. Completed keys stay.
    pub fn release(&self, key: &str) {
        let mut slots = self.slots.write();
        if matches!(slots.get(key), Some(Slot::InFlight(_))) {
            slots.remove(key);
        }
    }

    /// Store the result for a claimed key
    pub fn complete(&self, key: &str, value: T) {
        self.slots
            .write()
            .insert(key.to_string(), Slot::Done(value, Instant::now()));
    }

    pub fn get(&self, key: &str) -> Option<T> {
        match self.slots.read().get(key) {
            Some(Slot::Done(v, _)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Forget results completed at least `ttl` ago. In-flight keys stay.
    pub fn prune(&self, ttl: Duration) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Done(_, at) => at.elapsed() < ttl,
            Slot::InFlight(_) => true,
        });
        let pruned = before - slots.len();
        if pruned > 0 {
            debug!("Pruned {} completed key(s)", pruned);
        }
        pruned
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        matches!(self.slots.read().get(key), Some(Slot::InFlight(_)))
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

/// Ownership of one key. Dropped without [`complete`](Self::complete) it
/// releases the key.
pub struct IdempotencyTicket<T: Clone> {
    guard: Arc<IdempotencyGuard<T>>,
    key: String,
    finished: bool,
}

impl<T: Clone> IdempotencyTicket<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn complete(mut self, value: T) {
        self.guard.complete(&self.key, value);
        self.finished = true;
    }
}

impl<T: Clone> Drop for IdempotencyTicket<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.guard.release(&self.key);
        }
    }
}

/// Idempotency key for a treasury transfer.
///
/// Same route, same amount, same reason inside one time bucket ⇒ same key.
pub fn transfer_key(
    from: Market,
    to: Market,
    amount_usdt: Decimal,
    reason: &str,
    at: DateTime<Utc>,
    bucket_secs: i64,
) -> String {
    let bucket = at.timestamp().div_euclid(bucket_secs.max(1));
    let amount = amount_usdt.normalize();

    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}|{}|{}", from, to, amount, bucket, reason).as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("transfer:{}:{}:{}:{}:{}", from, to, amount, bucket, &digest[..16])
}
