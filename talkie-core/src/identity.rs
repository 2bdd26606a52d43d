//! Message identity: a 16-bit, wrapping, clock-derived conversation id.
//!
//! The identity doubles as the timestamp PING round trips are measured with, so
//! every comparison on it goes through [`age`], never plain subtraction.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Identity space size. All identity arithmetic is modulo this value.
pub const IDENTITY_MODULUS: u32 = 1 << 16;

/// Source of identities. One unit is one millisecond for [`MonotonicClock`].
pub trait IdentityClock: Send {
    fn now(&self) -> u16;
}

/// Elapsed milliseconds since creation, truncated to 16 bits.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityClock for MonotonicClock {
    fn now(&self) -> u16 {
        (self.epoch.elapsed().as_millis() % u128::from(IDENTITY_MODULUS)) as u16
    }
}

/// Hand-driven clock for simulations and tests. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU16>,
}

impl ManualClock {
    pub fn new(start: u16) -> Self {
        Self {
            now: Arc::new(AtomicU16::new(start)),
        }
    }

    pub fn set(&self, now: u16) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward, wrapping at 65536.
    pub fn advance(&self, units: u16) {
        let now = self.now.load(Ordering::SeqCst);
        self.set(wrapping_add(now, units));
    }
}

impl IdentityClock for ManualClock {
    fn now(&self) -> u16 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Units elapsed from `then` to `now` on the wrapping identity clock.
pub fn age(now: u16, then: u16) -> u16 {
    ((u32::from(now) + IDENTITY_MODULUS - u32::from(then)) % IDENTITY_MODULUS) as u16
}

pub fn wrapping_add(identity: u16, units: u16) -> u16 {
    ((u32::from(identity) + u32::from(units)) % IDENTITY_MODULUS) as u16
}
