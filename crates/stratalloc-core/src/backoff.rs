//! Contention backoff for CAS retry loops.
//!
//! Operations never block; the only waiting in the allocator is a
//! `PAUSE`-equivalent hint inside compare-exchange loops, optionally
//! escalating exponentially in outer retry loops.

/// Emits a single CPU spin hint.
#[inline]
pub fn stall_execution() {
    std::hint::spin_loop();
}

/// Single-hint backoff used inside the innermost CAS loops.
#[derive(Default)]
pub struct SpinBackoff;

impl SpinBackoff {
    #[inline]
    pub fn spin(&mut self) {
        stall_execution();
    }
}

/// Exponential backoff used by outer retry loops (chunk allocation rounds,
/// graveyard scans). Spins `a * n + b` hints per call, capped.
pub struct ExpBackoff {
    spins: u32,
    a: u32,
    b: u32,
    max_spins: u32,
}

impl ExpBackoff {
    pub fn new(a: u32, b: u32, max_spins: u32) -> Self {
        Self {
            spins: 0,
            a,
            b,
            max_spins,
        }
    }

    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.spins {
            stall_execution();
        }
        self.spins = (self.a * self.spins + self.b).min(self.max_spins);
    }
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self::new(2, 1, 64)
    }
}
