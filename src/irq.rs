/*
 * Interrupt Line Contract and Dispatch
 *
 * The host owns the interrupt controller; the framework only asks it to
 * attach a handler to a numbered line and to mask or unmask that line.
 * Every line the framework attaches points at one dispatcher,
 * `dispatch_interrupt`, which routes the event to the device bound to that
 * line in a global dispatch table.
 *
 * IRQ Safety:
 * The dispatcher runs in interrupt context. It touches the table through
 * atomics and `try_lock` only, so it never waits on a caller thread that
 * is in the middle of binding or unbinding a device. An interrupt that
 * cannot be routed is counted, not reported, and the count can be read
 * later with `spurious_interrupts()`.
 */

use alloc::sync::Weak;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{DeviceError, Result};

/// Hardware interrupt number. Zero means "no interrupt".
pub type IrqNumber = u32;

/// Entry point the host calls when an attached line fires
///
/// The second argument is the address of the interrupted register frame,
/// or zero when the host does not provide one.
pub type IrqHandler = fn(IrqNumber, usize);

/// Number of lines the dispatch table can route at once
pub const MAX_IRQ_ENTRIES: usize = 16;

/// Host interrupt-controller facility
///
/// The framework is the only caller of `attach`/`detach` for the lines its
/// devices own.
pub trait InterruptLine: Send + Sync {
    /// Routes `irq` to `handler`.
    fn attach(&self, irq: IrqNumber, handler: IrqHandler) -> Result<()>;

    /// Removes whatever handler is attached to `irq`.
    fn detach(&self, irq: IrqNumber);

    /// Masks (disables) `irq` at the controller.
    fn mask(&self, irq: IrqNumber);

    /// Unmasks (enables) `irq` at the controller.
    fn unmask(&self, irq: IrqNumber);
}

/// Token to indicate the local core is running in IRQ context
pub struct IrqContext<'irq> {
    irq: IrqNumber,
    frame: usize,
    _0: PhantomData<&'irq ()>,
}

impl IrqContext<'_> {
    /// Constructs an IRQ context token
    ///
    /// # Safety
    ///
    /// Only allowed to be constructed by the interrupt dispatcher, or by a
    /// caller that really is running in the interrupt context of `irq`.
    #[inline(always)]
    pub unsafe fn new(irq: IrqNumber, frame: usize) -> Self {
        Self {
            irq,
            frame,
            _0: PhantomData,
        }
    }

    /// The line that fired
    pub const fn irq(&self) -> IrqNumber {
        self.irq
    }

    /// Address of the interrupted register frame (zero if unknown)
    pub const fn frame(&self) -> usize {
        self.frame
    }
}

/// Receiver of dispatched interrupts
///
/// Implementations run in interrupt context: they must not take the
/// device lock, must not block and must finish in bounded time.
pub trait InterruptHook: Send + Sync {
    fn interrupt(&self, ctx: &IrqContext<'_>);
}

/// One routing slot: a line number and the device bound to it
struct IrqEntry {
    irq: AtomicU32,
    hook: Mutex<Option<Weak<dyn InterruptHook>>>,
}

impl IrqEntry {
    fn new() -> Self {
        Self {
            irq: AtomicU32::new(0),
            hook: Mutex::new(None),
        }
    }
}

/// Line → device routing table
pub(crate) struct IrqTable {
    entries: [IrqEntry; MAX_IRQ_ENTRIES],
    /// Serializes bind/unbind; never touched from interrupt context
    registration: Mutex<()>,
    spurious: AtomicU32,
}

impl IrqTable {
    fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| IrqEntry::new()),
            registration: Mutex::new(()),
            spurious: AtomicU32::new(0),
        }
    }

    /// Binds `hook` to `irq`
    ///
    /// Fails with [`DeviceError::Busy`] if another device already owns the
    /// line, and with [`DeviceError::CapacityExceeded`] if every slot is in
    /// use.
    pub(crate) fn bind(&self, irq: IrqNumber, hook: Weak<dyn InterruptHook>) -> Result<()> {
        if irq == 0 {
            return Err(DeviceError::InvalidArgument);
        }

        let _reg = self.registration.lock();

        if self.find(irq).is_some() {
            return Err(DeviceError::Busy);
        }

        let entry = self
            .entries
            .iter()
            .find(|e| e.irq.load(Ordering::Acquire) == 0)
            .ok_or(DeviceError::CapacityExceeded)?;

        // Hook first, then the number: the dispatcher only looks at entries
        // whose number matches, so it never sees a half-filled slot.
        *entry.hook.lock() = Some(hook);
        entry.irq.store(irq, Ordering::Release);
        Ok(())
    }

    /// Releases the slot owned by `irq`, if any
    pub(crate) fn unbind(&self, irq: IrqNumber) {
        let _reg = self.registration.lock();

        if let Some(entry) = self.find(irq) {
            entry.irq.store(0, Ordering::Release);
            *entry.hook.lock() = None;
        }
    }

    fn find(&self, irq: IrqNumber) -> Option<&IrqEntry> {
        self.entries
            .iter()
            .find(|e| e.irq.load(Ordering::Acquire) == irq)
    }

    /// Routes one interrupt. Never blocks.
    fn dispatch(&self, irq: IrqNumber, frame: usize) {
        let hook = self
            .find(irq)
            .and_then(|entry| entry.hook.try_lock().and_then(|slot| (*slot).clone()))
            .and_then(|weak| weak.upgrade());

        match hook {
            Some(hook) => {
                // SAFETY: we are the dispatcher, called by the host for `irq`
                let ctx = unsafe { IrqContext::new(irq, frame) };
                hook.interrupt(&ctx);
            }
            None => {
                self.spurious.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn is_bound(&self, irq: IrqNumber) -> bool {
        irq != 0 && self.find(irq).is_some()
    }
}

lazy_static! {
    pub(crate) static ref IRQ_TABLE: IrqTable = IrqTable::new();
}

/// Interrupt dispatcher
///
/// This is the handler the framework attaches to every line it owns.
///
/// # Arguments
/// * `irq` - The interrupt that has been triggered
/// * `frame` - Address of the interrupted context (zero if unknown)
pub fn dispatch_interrupt(irq: IrqNumber, frame: usize) {
    IRQ_TABLE.dispatch(irq, frame);
}

/// Number of interrupts the dispatcher could not route to a live device
///
/// Covers lines with no bound device, devices already dropped, and slots
/// that were being rebound at the moment the line fired.
pub fn spurious_interrupts() -> u32 {
    IRQ_TABLE.spurious.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    struct Counter {
        hits: AtomicUsize,
        last_irq: AtomicU32,
    }

    impl InterruptHook for Counter {
        fn interrupt(&self, ctx: &IrqContext<'_>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.last_irq.store(ctx.irq(), Ordering::SeqCst);
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            hits: AtomicUsize::new(0),
            last_irq: AtomicU32::new(0),
        })
    }

    #[test]
    fn dispatch_reaches_bound_hook() {
        let table = IrqTable::new();
        let hook = counter();
        let weak: Weak<dyn InterruptHook> = Arc::downgrade(&hook) as Weak<dyn InterruptHook>;
        table.bind(5, weak).unwrap();

        table.dispatch(5, 0);
        table.dispatch(5, 0);

        assert_eq!(hook.hits.load(Ordering::SeqCst), 2);
        assert_eq!(hook.last_irq.load(Ordering::SeqCst), 5);
        assert_eq!(table.spurious.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn second_binding_of_a_line_is_refused() {
        let table = IrqTable::new();
        let a = counter();
        let b = counter();
        table.bind(7, Arc::downgrade(&a) as Weak<dyn InterruptHook>).unwrap();
        assert_eq!(
            table.bind(7, Arc::downgrade(&b) as Weak<dyn InterruptHook>),
            Err(DeviceError::Busy)
        );

        table.dispatch(7, 0);
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unbound_and_dead_lines_count_as_spurious() {
        let table = IrqTable::new();
        table.dispatch(9, 0);
        assert_eq!(table.spurious.load(Ordering::SeqCst), 1);

        let hook = counter();
        table.bind(9, Arc::downgrade(&hook) as Weak<dyn InterruptHook>).unwrap();
        drop(hook);
        table.dispatch(9, 0);
        assert_eq!(table.spurious.load(Ordering::SeqCst), 2);

        table.unbind(9);
        assert!(!table.is_bound(9));
    }

    #[test]
    fn table_capacity_is_bounded() {
        let table = IrqTable::new();
        let hook = counter();
        for irq in 1..=MAX_IRQ_ENTRIES as u32 {
            table.bind(irq, Arc::downgrade(&hook) as Weak<dyn InterruptHook>).unwrap();
        }
        assert_eq!(
            table.bind(100, Arc::downgrade(&hook) as Weak<dyn InterruptHook>),
            Err(DeviceError::CapacityExceeded)
        );

        table.unbind(3);
        table.bind(100, Arc::downgrade(&hook) as Weak<dyn InterruptHook>).unwrap();
    }

    #[test]
    fn irq_zero_is_never_bound() {
        let table = IrqTable::new();
        let hook = counter();
        assert_eq!(
            table.bind(0, Arc::downgrade(&hook) as Weak<dyn InterruptHook>),
            Err(DeviceError::InvalidArgument)
        );
    }
}
