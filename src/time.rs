//! Monotonic time reference and fixed-point tick arithmetic.
//!
//! Every timed subsystem (timers, Tpipe, ARP backoff, DHCP leases, PTP/NTP)
//! measures elapsed time against a single free-running tick counter rather
//! than wall-clock time, so that the whole stack keeps working correctly
//! through a `u32` wraparound.

/// A free-running hardware or software tick source.
///
/// The counter MUST increment monotonically and wrap at `u32::MAX`. The
/// tick rate is fixed at construction time and is expected to lie between
/// 1 kHz and 1 GHz; callers needing a specific unit use the `*_per_*`
/// conversion helpers rather than assuming any particular rate.
pub trait TimeRef {
    /// Current value of the free-running tick counter.
    fn raw_tick(&self) -> u32;

    /// Ticks per microsecond, as a Q32.32 fixed-point scale factor
    /// (i.e., `raw_ticks * scale >> 32 == microseconds`, rounded down).
    fn ticks_per_usec(&self) -> u64;
}

/// Convert a tick delta to microseconds using a precomputed Q32.32 scale.
#[inline]
fn ticks_to_usec(ticks: u32, ticks_per_usec_q32: u64) -> u32 {
    // ticks_per_usec_q32 is actually usec_per_tick in Q32.32: usec = ticks / ticks_per_usec
    // We store the inverse scale (usec per tick, Q32.32) to avoid division at call time.
    (((ticks as u64) * ticks_per_usec_q32) >> 32) as u32
}

/// A timestamp plus the clock it was measured against, used to compute
/// elapsed time and to arm one-shot or periodic deadlines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeVal {
    tick: u32,
    /// Inverse of `TimeRef::ticks_per_usec`, i.e. microseconds-per-tick in
    /// Q32.32 fixed point, cached at construction so later arithmetic needs
    /// no access to the original clock.
    usec_per_tick_q32: u64,
}

impl TimeVal {
    /// Snapshot the current time from a clock.
    pub fn now<C: TimeRef + ?Sized>(clk: &C) -> Self {
        let ticks_per_usec = clk.ticks_per_usec().max(1);
        // Invert Q32.32 ticks-per-usec into Q32.32 usec-per-tick.
        let usec_per_tick_q32 = (1u128 << 64) / (ticks_per_usec as u128);
        TimeVal {
            tick: clk.raw_tick(),
            usec_per_tick_q32: usec_per_tick_q32 as u64,
        }
    }

    #[inline]
    fn usec_for(&self, ticks: u32) -> u32 {
        ticks_to_usec(ticks, self.usec_per_tick_q32)
    }

    /// Ticks elapsed since this timestamp, relative to `now`. Correct
    /// across a `u32` wraparound because subtraction is performed modulo
    /// 2^32.
    pub fn elapsed_tick(&self, now: u32) -> u32 {
        now.wrapping_sub(self.tick)
    }

    /// Microseconds elapsed since this timestamp.
    pub fn elapsed_usec(&self, now: u32) -> u32 {
        self.usec_for(self.elapsed_tick(now))
    }

    /// Milliseconds elapsed since this timestamp.
    pub fn elapsed_msec(&self, now: u32) -> u32 {
        self.elapsed_usec(now) / 1000
    }

    /// Advance the stored timestamp by exactly `ticks`, returning the
    /// elapsed tick count prior to the advance. Used by periodic timers to
    /// maintain phase rather than drift.
    pub fn increment_tick(&mut self, now: u32, ticks: u32) -> u32 {
        let elapsed = self.elapsed_tick(now);
        self.tick = self.tick.wrapping_add(ticks);
        elapsed
    }

    /// Returns true exactly once per `period_usec`, advancing the internal
    /// reference by whole periods so phase does not drift, and coalescing
    /// any number of missed periods into a single fired event.
    pub fn interval_usec(&mut self, now: u32, period_usec: u32) -> bool {
        if period_usec == 0 {
            return false;
        }
        let elapsed = self.elapsed_usec(now);
        if elapsed < period_usec {
            return false;
        }
        // Advance by whole periods, capped at `now`, to preserve phase.
        let period_ticks = self.ticks_for_usec(period_usec);
        if period_ticks == 0 {
            self.tick = now;
            return true;
        }
        loop {
            let next = self.tick.wrapping_add(period_ticks);
            if next.wrapping_sub(self.tick) > now.wrapping_sub(self.tick) {
                break;
            }
            self.tick = next;
        }
        true
    }

    fn ticks_for_usec(&self, usec: u32) -> u32 {
        if self.usec_per_tick_q32 == 0 {
            return 0;
        }
        (((usec as u128) << 32) / (self.usec_per_tick_q32 as u128)) as u32
    }

    /// One-shot deadline check: true the first time `now` reaches or passes
    /// the deadline `usec` microseconds after this timestamp was taken.
    /// Does not re-arm; callers wanting periodic behavior use
    /// `interval_usec`.
    pub fn checkpoint_usec(&self, now: u32, usec: u32) -> bool {
        self.elapsed_usec(now) >= usec
    }
}

/// Minimal software clock for tests and simulation: a caller-advanced tick
/// counter with a fixed rate. Not part of the public hot path, but useful
/// wherever a `TimeRef` is needed without real hardware.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    tick: u32,
    ticks_per_usec_q32: u64,
}

impl SimClock {
    /// Construct a simulated clock running at `ticks_per_sec` Hz.
    pub fn new(ticks_per_sec: u32) -> Self {
        let ticks_per_usec_q32 = ((ticks_per_sec as u128) << 32) / 1_000_000u128;
        SimClock {
            tick: 0,
            ticks_per_usec_q32: ticks_per_usec_q32 as u64,
        }
    }

    /// Advance the simulated clock by the given number of ticks.
    pub fn advance_ticks(&mut self, ticks: u32) {
        self.tick = self.tick.wrapping_add(ticks);
    }

    /// Advance the simulated clock by the given number of microseconds.
    pub fn advance_usec(&mut self, usec: u32) {
        let ticks = (((usec as u128) * (self.ticks_per_usec_q32 as u128)) >> 32) as u32;
        self.advance_ticks(ticks.max(1));
    }
}

impl TimeRef for SimClock {
    fn raw_tick(&self) -> u32 {
        self.tick
    }

    fn ticks_per_usec(&self) -> u64 {
        self.ticks_per_usec_q32
    }
}
