//! Session-seeded order id generation.
//!
//! The gateway's handshake ack carries the first usable order id for
//! the session; every id handed out afterwards is strictly higher.
//! Reseeding on reconnect never moves the counter backwards, so ids
//! stay unique across sessions within one process lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub struct OrderIdGenerator {
    next: AtomicU64,
}

impl OrderIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Adopt the gateway's `next_order_id` if it is ahead of ours.
    ///
    /// CAS loop: concurrent `next()` calls may race the reseed.
    pub fn seed(&self, next_order_id: u64) {
        loop {
            let current = self.next.load(Ordering::Acquire);
            if next_order_id <= current {
                debug!(
                    seed = next_order_id,
                    current, "Seed behind local counter, keeping local"
                );
                return;
            }
            match self.next.compare_exchange_weak(
                current,
                next_order_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(seed = next_order_id, "Order id counter reseeded");
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// Hand out the next id.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// The id the next call to `next()` would return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for OrderIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotone_from_seed() {
        let gen = OrderIdGenerator::new();
        gen.seed(500);
        assert_eq!(gen.next(), 500);
        assert_eq!(gen.next(), 501);
        assert_eq!(gen.peek(), 502);
    }

    #[test]
    fn test_reseed_never_goes_backwards() {
        let gen = OrderIdGenerator::new();
        gen.seed(1000);
        assert_eq!(gen.next(), 1000);

        // A reconnect handing out a lower seed must not reuse ids.
        gen.seed(10);
        assert_eq!(gen.next(), 1001);

        gen.seed(5000);
        assert_eq!(gen.next(), 5000);
    }
}
