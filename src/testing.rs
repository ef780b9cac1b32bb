//! Host-side stand-ins for the interrupt controller, shared by the unit tests.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{DeviceError, Result};
use crate::irq::{InterruptLine, IrqHandler, IrqNumber};

/// Interrupt controller that records every call and can raise lines on demand
#[derive(Default)]
pub struct MockLine {
    handlers: Mutex<BTreeMap<IrqNumber, IrqHandler>>,
    unmasked: Mutex<BTreeSet<IrqNumber>>,
    attach_calls: AtomicUsize,
    mask_calls: AtomicUsize,
    fail_attach: AtomicBool,
}

impl MockLine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following `attach` fail
    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    /// Raise `irq` as the hardware would
    pub fn fire(&self, irq: IrqNumber) {
        let handler = self.handlers.lock().get(&irq).copied();
        if let Some(handler) = handler {
            handler(irq, 0);
        }
    }

    pub fn is_attached(&self, irq: IrqNumber) -> bool {
        self.handlers.lock().contains_key(&irq)
    }

    pub fn is_unmasked(&self, irq: IrqNumber) -> bool {
        self.unmasked.lock().contains(&irq)
    }

    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn mask_calls(&self) -> usize {
        self.mask_calls.load(Ordering::SeqCst)
    }
}

impl InterruptLine for MockLine {
    fn attach(&self, irq: IrqNumber, handler: IrqHandler) -> Result<()> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(DeviceError::Io);
        }
        self.handlers.lock().insert(irq, handler);
        Ok(())
    }

    fn detach(&self, irq: IrqNumber) {
        self.handlers.lock().remove(&irq);
    }

    fn mask(&self, irq: IrqNumber) {
        self.mask_calls.fetch_add(1, Ordering::SeqCst);
        self.unmasked.lock().remove(&irq);
    }

    fn unmask(&self, irq: IrqNumber) {
        self.unmasked.lock().insert(irq);
    }
}
