//! Cooperative polling runtime: `Always`, `OnDemand`, and `Timer` tasks
//! driven round-robin by a single-threaded main loop.

use heapless::Vec;

use crate::irq::is_irq_context;
use crate::time::{TimeRef, TimeVal};

/// Upper bound on concurrently registered tasks of each kind. Chosen to
/// comfortably cover one switch/router instance plus its protocol objects
/// without requiring a heap.
pub const MAX_TASKS: usize = 32;

/// A task serviced on every pass of the main loop.
pub trait Always {
    fn poll_always(&mut self);
}

/// A task that runs at most once per main-loop pass, triggered by
/// `request_poll()` (typically called from interrupt context).
pub trait OnDemand {
    /// Arm this task to run on the next service pass. Safe to call from
    /// interrupt context; safe to call any number of times before the next
    /// pass services it exactly once.
    fn request_poll(&mut self);

    /// Run the deferred work. Called by the runtime at most once per pass,
    /// and only if `request_poll` was called since the last pass.
    fn poll_demand(&mut self);

    /// Has a poll been requested since the last service pass?
    fn poll_requested(&self) -> bool;
}

/// A simple one-bit request flag shared between an ISR and user context.
/// Single-word so a plain load/store is presumed atomic on every target in
/// scope (documented crate-wide assumption, see concurrency notes).
#[derive(Default)]
pub struct RequestFlag(core::sync::atomic::AtomicBool);

impl RequestFlag {
    pub const fn new() -> Self {
        RequestFlag(core::sync::atomic::AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, core::sync::atomic::Ordering::Release);
    }

    /// Clear and return the previous value.
    pub fn take(&self) -> bool {
        self.0.swap(false, core::sync::atomic::Ordering::Acquire)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(core::sync::atomic::Ordering::Relaxed)
    }
}

/// A task fired once after `timer_once`, or repeatedly after `timer_every`,
/// with missed deadlines coalesced into a single event and no phase drift.
pub trait Timer {
    fn timer_event(&mut self);
}

enum TimerKind {
    Once,
    Every(u32),
}

struct TimerEntry<'a> {
    task: &'a mut dyn Timer,
    deadline: TimeVal,
    period_usec: u32,
    kind: TimerKind,
    active: bool,
}

/// The cooperative scheduler: owns the registered task lists and drives
/// them in a fixed order each pass — all `Always` tasks, then pending
/// `OnDemand` tasks (single pass, no re-entry), then the timekeeper.
pub struct PollRuntime<'a> {
    always: Vec<&'a mut dyn Always, MAX_TASKS>,
    demand: Vec<&'a mut dyn OnDemand, MAX_TASKS>,
    timers: Vec<TimerEntry<'a>, MAX_TASKS>,
}

impl<'a> PollRuntime<'a> {
    pub fn new() -> Self {
        PollRuntime {
            always: Vec::new(),
            demand: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Register a task to run every pass. Returns `Err(task)` if the fixed
    /// task-table capacity (`MAX_TASKS`) is already exhausted.
    pub fn add_always(&mut self, task: &'a mut dyn Always) -> Result<(), &'a mut dyn Always> {
        self.always.push(task)
    }

    /// Register a task to run when `request_poll` has been called.
    pub fn add_demand(&mut self, task: &'a mut dyn OnDemand) -> Result<(), &'a mut dyn OnDemand> {
        self.demand.push(task)
    }

    /// Arm a one-shot timer against the given clock.
    pub fn timer_once<C: TimeRef>(
        &mut self,
        clk: &C,
        task: &'a mut dyn Timer,
        msec: u32,
    ) -> Result<(), &'static str> {
        self.timers
            .push(TimerEntry {
                task,
                deadline: TimeVal::now(clk),
                period_usec: msec.saturating_mul(1000),
                kind: TimerKind::Once,
                active: true,
            })
            .map_err(|_| "timer table full")
    }

    /// Arm a periodic timer against the given clock.
    pub fn timer_every<C: TimeRef>(
        &mut self,
        clk: &C,
        task: &'a mut dyn Timer,
        msec: u32,
    ) -> Result<(), &'static str> {
        self.timers
            .push(TimerEntry {
                task,
                deadline: TimeVal::now(clk),
                period_usec: msec.saturating_mul(1000),
                kind: TimerKind::Every(msec),
                active: true,
            })
            .map_err(|_| "timer table full")
    }

    /// Service one full pass: all `Always`, then pending `OnDemand`s, then
    /// due timers. A `request_poll` made by a callback invoked during this
    /// pass is serviced only on the *next* call to `service`.
    pub fn service<C: TimeRef>(&mut self, clk: &C) {
        debug_assert!(
            !is_irq_context(),
            "PollRuntime::service must run from user context"
        );
        for task in self.always.iter_mut() {
            task.poll_always();
        }
        for task in self.demand.iter_mut() {
            if task.poll_requested() {
                task.poll_demand();
            }
        }
        let now = clk.raw_tick();
        for entry in self.timers.iter_mut() {
            if !entry.active {
                continue;
            }
            match entry.kind {
                TimerKind::Once => {
                    if entry.deadline.checkpoint_usec(now, entry.period_usec) {
                        entry.active = false;
                        entry.task.timer_event();
                    }
                }
                TimerKind::Every(msec) => {
                    if entry
                        .deadline
                        .interval_usec(now, msec.saturating_mul(1000))
                    {
                        entry.task.timer_event();
                    }
                }
            }
        }
    }
}

impl<'a> Default for PollRuntime<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SimClock;

    struct Counter(u32);
    impl Always for Counter {
        fn poll_always(&mut self) {
            self.0 += 1;
        }
    }

    struct Demand {
        flag: RequestFlag,
        ran: u32,
    }
    impl OnDemand for Demand {
        fn request_poll(&mut self) {
            self.flag.set();
        }
        fn poll_demand(&mut self) {
            self.flag.take();
            self.ran += 1;
        }
        fn poll_requested(&self) -> bool {
            self.flag.is_set()
        }
    }

    #[test]
    fn always_runs_every_pass() {
        let mut c = Counter(0);
        let clk = SimClock::new(1_000_000);
        let mut rt = PollRuntime::new();
        rt.add_always(&mut c).unwrap();
        rt.service(&clk);
        rt.service(&clk);
        rt.service(&clk);
        drop(rt);
        assert_eq!(c.0, 3);
    }

    #[test]
    fn on_demand_runs_once_even_if_requested_repeatedly() {
        let mut d = Demand {
            flag: RequestFlag::new(),
            ran: 0,
        };
        d.request_poll();
        d.request_poll();
        d.request_poll();
        let clk = SimClock::new(1_000_000);
        let mut rt = PollRuntime::new();
        rt.add_demand(&mut d).unwrap();
        rt.service(&clk);
        rt.service(&clk);
        drop(rt);
        assert_eq!(d.ran, 1);
    }

    struct Fired(u32);
    impl Timer for Fired {
        fn timer_event(&mut self) {
            self.0 += 1;
        }
    }

    #[test]
    fn timer_every_coalesces_missed_deadlines() {
        let mut clk = SimClock::new(1_000_000);
        let mut f = Fired(0);
        let mut rt = PollRuntime::new();
        rt.timer_every(&clk, &mut f, 1).unwrap(); // 1ms period
        clk.advance_usec(10_500); // 10 periods elapsed
        rt.service(&clk);
        drop(rt);
        assert_eq!(f.0, 1, "one event per service pass, not one per ms overshot");
    }
}
