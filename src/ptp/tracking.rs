//! Closed-loop time discipline: pipes [`super::Measurement`] samples from a
//! PTP (or NTP) client through a chain of [`super::filters::Filter`]
//! objects and commands one or more [`TrackingClock`] targets.

use heapless::Vec;

use super::filters::{AmplitudeReject, ControllerPII, Filter};
use super::{Callback, Measurement, Time};

/// Maximum number of clocks a single [`TrackingController`] can discipline
/// in lock-step (one primary, phase-locked; the rest frequency-locked only).
pub const MAX_CLOCKS: usize = 4;
/// Maximum filter-chain depth.
pub const MAX_FILTERS: usize = 8;

/// Generic interface to a numerically-controlled reference clock.
///
/// `clock_rate` implementations must store their input so it can be read
/// back through [`get_rate`](TrackingClock::get_rate).
pub trait TrackingClock {
    /// Current time, or [`Time::ZERO`] if not yet available.
    fn clock_now(&mut self) -> Time;

    /// One-time adjustment; positive moves the clock forward. Returns the
    /// estimated residual (implementations that cannot step exactly should
    /// report what's left over).
    fn clock_adjust(&mut self, amount: Time) -> Time;

    /// Adjust rate by a normalized frequency offset (see
    /// [`super::RATE_ONE_PPB`]); positive runs the clock faster.
    fn clock_rate(&mut self, offset: i64);

    /// Most recent value passed to `clock_rate`.
    fn get_rate(&self) -> i64;
}

/// Acquisition/tracking state machine driving [`TrackingController`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockState {
    /// No measurements yet; next sample re-arms acquisition.
    Reset,
    /// Large error: step the clock directly via `clock_adjust`.
    Acquire,
    /// Small error: filter chain drives `clock_rate`.
    Track,
    /// Frequency-only holdover, no phase steering (fallback mode).
    Linear,
}

/// Error magnitude above which `TrackingController` steps the clock
/// directly instead of trusting the filter chain to correct it gradually:
/// one millisecond, expressed in sub-nanosecond LSBs.
const ACQUIRE_THRESHOLD_SUBNS: i64 = 1_000_000 * super::SUBNS_PER_NSEC;

/// Clock controller handling coarse acquisition and fine-grained rate
/// discipline. Implements [`Callback`] so it can be registered directly
/// with a PTP or NTP client.
pub struct TrackingController<'a> {
    clocks: Vec<&'a mut dyn TrackingClock, MAX_CLOCKS>,
    filters: Vec<&'a mut dyn Filter, MAX_FILTERS>,
    lock_state: LockState,
}

impl<'a> TrackingController<'a> {
    /// Construct with an optional primary clock target (safe to omit and
    /// `add_clock` later; a controller with no clocks just tracks state).
    pub fn new(clk: Option<&'a mut dyn TrackingClock>) -> Self {
        let mut clocks = Vec::new();
        if let Some(c) = clk {
            let _ = clocks.push(c);
        }
        TrackingController {
            clocks,
            filters: Vec::new(),
            lock_state: LockState::Reset,
        }
    }

    /// Add a clock to the disciplined set. The first clock added (whether
    /// via the constructor or this method) is the phase-locked primary;
    /// later ones are frequency-locked only.
    pub fn add_clock(&mut self, clock: &'a mut dyn TrackingClock) -> Result<(), &'a mut dyn TrackingClock> {
        self.clocks.push(clock)
    }

    /// Append a filter to the processing chain; filters run in the order
    /// added, each consuming the previous filter's output.
    pub fn add_filter(&mut self, filter: &'a mut dyn Filter) -> Result<(), &'a mut dyn Filter> {
        self.filters.push(filter)
    }

    pub fn lock_state(&self) -> LockState {
        self.lock_state
    }

    /// Reset the filter chain and begin free-wheeling acquisition.
    /// `linear` skips straight to frequency-only holdover, disabling the
    /// nonlinear coarse-acquisition step.
    pub fn reset(&mut self, linear: bool) {
        for f in self.filters.iter_mut() {
            f.reset();
        }
        self.lock_state = if linear { LockState::Linear } else { LockState::Reset };
    }

    /// Feed a new offset measurement (delta = remote - local) through the
    /// acquisition/tracking state machine.
    pub fn update(&mut self, delta: Time) {
        let subns = delta.total_subns();
        let large = subns.unsigned_abs() as i128 > ACQUIRE_THRESHOLD_SUBNS as i128;
        match self.lock_state {
            LockState::Linear => self.run_filters(delta),
            LockState::Reset => {
                self.lock_state = if large { LockState::Acquire } else { LockState::Track };
                self.update(delta);
            }
            LockState::Acquire => {
                if large {
                    self.clock_adjust(delta);
                } else {
                    self.lock_state = LockState::Track;
                    self.run_filters(delta);
                }
            }
            LockState::Track => {
                if large {
                    self.lock_state = LockState::Acquire;
                    self.clock_adjust(delta);
                } else {
                    self.run_filters(delta);
                }
            }
        }
    }

    fn run_filters(&mut self, delta: Time) {
        let mut signal = delta.total_subns() as i64;
        for f in self.filters.iter_mut() {
            signal = f.update(signal, 0);
        }
        self.clock_rate(signal);
    }

    fn clock_adjust(&mut self, amount: Time) -> Time {
        let mut residual = amount;
        for (i, c) in self.clocks.iter_mut().enumerate() {
            let r = c.clock_adjust(amount);
            if i == 0 {
                residual = r;
            }
        }
        residual
    }

    fn clock_rate(&mut self, offset: i64) {
        for c in self.clocks.iter_mut() {
            c.clock_rate(offset);
        }
    }
}

impl<'a> Callback for TrackingController<'a> {
    fn ptp_ready(&mut self, data: &Measurement) {
        self.update(data.offset());
    }
}

/// All-in-one [`TrackingController`] with a built-in filter chain
/// (amplitude rejection into a type-II PI loop) that performs well for
/// most applications; usable as-is or as a template for a custom chain.
pub struct TrackingSimple<'a> {
    ctrl: TrackingController<'a>,
    ampl: AmplitudeReject,
    pii: ControllerPII,
}

impl<'a> TrackingSimple<'a> {
    pub fn new(clk: &'a mut dyn TrackingClock, tau_sec: f64) -> Self {
        TrackingSimple {
            ctrl: TrackingController::new(Some(clk)),
            ampl: AmplitudeReject::new(2000 * super::SUBNS_PER_NSEC),
            pii: ControllerPII::new(super::filters::CoeffPII::new(tau_sec)),
        }
    }

    /// Feed one measurement through amplitude rejection then the PII loop.
    pub fn update(&mut self, delta: Time) {
        let rejected = self.ampl.update(delta.total_subns() as i64, 0);
        let signal = self.pii.update(rejected, 0);
        self.ctrl.clock_rate(signal);
    }

    pub fn reset(&mut self) {
        self.ampl.reset();
        self.pii.reset();
        self.ctrl.reset(false);
    }
}

impl<'a> Callback for TrackingSimple<'a> {
    fn ptp_ready(&mut self, data: &Measurement) {
        self.update(data.offset());
    }
}

/// Bang-bang alternative to [`TrackingController`]: makes stepwise
/// adjustments only, with no rate discipline and no monotonicity
/// guarantee. Much simpler, adequate when fine-grained timing isn't
/// required.
pub struct TrackingCoarse<'a> {
    clock: &'a mut dyn TrackingClock,
}

impl<'a> TrackingCoarse<'a> {
    pub fn new(clk: &'a mut dyn TrackingClock) -> Self {
        TrackingCoarse { clock: clk }
    }
}

impl<'a> Callback for TrackingCoarse<'a> {
    fn ptp_ready(&mut self, data: &Measurement) {
        self.clock.clock_adjust(data.offset());
    }
}
