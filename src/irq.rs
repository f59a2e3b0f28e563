//! Interrupt-context bookkeeping: a scoped lock tracking nesting depth, and
//! adapters that bridge a hardware interrupt line to the cooperative
//! `OnDemand` poll class.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::poll::OnDemand;

static LOCK_COUNT: AtomicU32 = AtomicU32::new(0);
static IN_IRQ: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Platform hook for masking/unmasking interrupts. The embedder provides
/// one implementation; `irq::Lock` calls it exactly once per outermost
/// nested lock.
pub trait IrqPlatform {
    fn irq_pause(&self);
    fn irq_resume(&self);
}

/// Mark entry into interrupt context. Call once from the top of the ISR,
/// paired with `leave_irq_context` before returning. Not re-entrant across
/// nested interrupts on platforms with interrupt priorities; such
/// platforms should treat every ISR level as "irq context" for the
/// purposes of this flag.
pub fn enter_irq_context() {
    IN_IRQ.store(true, Ordering::Release);
}

pub fn leave_irq_context() {
    IN_IRQ.store(false, Ordering::Release);
}

/// Is the caller currently running inside an interrupt handler?
pub fn is_irq_context() -> bool {
    IN_IRQ.load(Ordering::Acquire)
}

/// Is the caller either inside an interrupt handler, or inside a `Lock`
/// critical section entered from user context?
pub fn is_irq_or_locked() -> bool {
    is_irq_context() || LOCK_COUNT.load(Ordering::Acquire) > 0
}

/// RAII guard masking interrupts for the scope of its lifetime. Nesting is
/// supported: the platform's `irq_pause`/`irq_resume` are invoked exactly
/// once per outermost `Lock`, regardless of how many are nested within it.
pub struct Lock<'a, P: IrqPlatform> {
    platform: &'a P,
    outermost: bool,
}

impl<'a, P: IrqPlatform> Lock<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        let prev = LOCK_COUNT.fetch_add(1, Ordering::AcqRel);
        let outermost = prev == 0;
        if outermost {
            platform.irq_pause();
        }
        Lock { platform, outermost }
    }
}

impl<'a, P: IrqPlatform> Drop for Lock<'a, P> {
    fn drop(&mut self) {
        let prev = LOCK_COUNT.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "irq::Lock underflow");
        if self.outermost {
            self.platform.irq_resume();
        }
    }
}

/// Binds a single hardware interrupt line to one `OnDemand` task: the ISR
/// calls `fire()`, which defers the real work to the next user-context
/// poll pass via `request_poll()`.
pub struct Adapter<'a> {
    target: &'a mut dyn OnDemand,
}

impl<'a> Adapter<'a> {
    pub fn new(target: &'a mut dyn OnDemand) -> Self {
        Adapter { target }
    }

    /// Called from the ISR for the bound interrupt line.
    pub fn fire(&mut self) {
        self.target.request_poll();
    }
}

/// Fans one hardware interrupt line out to a fixed-capacity list of
/// virtual handlers, each implementing `OnDemand`. Every registered
/// handler is requested to poll when the shared line fires; handlers that
/// were not actually the source of the interrupt simply find nothing to
/// do in their own `poll_demand`.
pub struct Shared<'a> {
    handlers: heapless::Vec<&'a mut dyn OnDemand, 8>,
}

impl<'a> Shared<'a> {
    pub fn new() -> Self {
        Shared {
            handlers: heapless::Vec::new(),
        }
    }

    pub fn add(&mut self, handler: &'a mut dyn OnDemand) -> Result<(), &'a mut dyn OnDemand> {
        self.handlers.push(handler)
    }

    /// Called from the shared ISR.
    pub fn fire(&mut self) {
        for h in self.handlers.iter_mut() {
            h.request_poll();
        }
    }
}

impl<'a> Default for Shared<'a> {
    fn default() -> Self {
        Self::new()
    }
}
