/*
 * Device Base
 *
 * Fundamental building block for all device drivers. It handles the basic
 * "being a driver" things: the driver name, interrupt registration with the
 * host and per-instance locking.
 *
 * Two kinds of code touch a device:
 * - caller threads (open/close/read/write/ioctl), serialized by `lock()`
 * - the interrupt dispatcher, which never takes `lock()`
 *
 * Everything the interrupt side needs to read (the attached flag, the debug
 * switch) is kept in atomics so it can be read without the lock.
 */

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::error::{DeviceError, Result};
use crate::irq::{IRQ_TABLE, InterruptHook, InterruptLine, IrqNumber, dispatch_interrupt};

/// Base state shared by every device
///
/// Not `Clone`: a device's identity, its lock and its interrupt line must
/// never be duplicated.
pub struct Device {
    name: &'static str,
    irq: IrqNumber,
    irq_attached: AtomicBool,
    debug_enabled: AtomicBool,
    interrupts: Arc<dyn InterruptLine>,
    lock: Mutex<()>,
}

/// Proof that the device lock is held
///
/// Dropping the guard releases the lock.
pub struct DeviceGuard<'a> {
    device: &'a Device,
    _inner: MutexGuard<'a, ()>,
}

impl DeviceGuard<'_> {
    /// The device whose lock this guard holds
    pub fn device(&self) -> &Device {
        self.device
    }
}

impl Device {
    /// Create a new device
    ///
    /// # Arguments
    /// * `name` - Driver name, used as the log prefix
    /// * `irq` - Interrupt assigned to the device (0 for none)
    /// * `interrupts` - Host interrupt controller
    pub fn new(name: &'static str, irq: IrqNumber, interrupts: Arc<dyn InterruptLine>) -> Self {
        Self {
            name,
            irq,
            irq_attached: AtomicBool::new(false),
            debug_enabled: AtomicBool::new(false),
            interrupts,
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn irq(&self) -> IrqNumber {
        self.irq
    }

    /// True once the interrupt line is attached to this instance
    pub fn irq_attached(&self) -> bool {
        self.irq_attached.load(Ordering::Acquire)
    }

    /// Initialise the device and claim its interrupt line
    ///
    /// Binds `hook` as the receiver of this device's interrupt and attaches
    /// the line at the host. Calling it again once attached is a no-op, and
    /// a device without an interrupt always succeeds.
    ///
    /// If the line cannot be claimed, `irq_attached` stays false. With
    /// `optional` set the device carries on without interrupts; otherwise
    /// the call fails with [`DeviceError::InitializationFailure`].
    pub fn init(&self, hook: Weak<dyn InterruptHook>, optional: bool) -> Result<()> {
        if self.irq == 0 {
            return Ok(());
        }

        let _guard = self.lock();

        if self.irq_attached() {
            return Ok(());
        }

        match self.register_interrupt(hook) {
            Ok(()) => {
                self.irq_attached.store(true, Ordering::Release);
                self.debug(format_args!("attached irq {}", self.irq));
                Ok(())
            }
            Err(err) if optional => {
                log::warn!(
                    "{}: irq {} unavailable ({}), running without interrupts",
                    self.name,
                    self.irq,
                    err
                );
                Ok(())
            }
            Err(err) => {
                log::error!("{}: failed to attach irq {}: {}", self.name, self.irq, err);
                Err(DeviceError::InitializationFailure)
            }
        }
    }

    /// Register ourselves as the handler for our interrupt
    fn register_interrupt(&self, hook: Weak<dyn InterruptHook>) -> Result<()> {
        IRQ_TABLE.bind(self.irq, hook)?;

        if let Err(err) = self.interrupts.attach(self.irq, dispatch_interrupt) {
            IRQ_TABLE.unbind(self.irq);
            return Err(err);
        }

        Ok(())
    }

    /// Give the interrupt line back to the host
    ///
    /// Safe to call when nothing is attached.
    pub(crate) fn unregister_interrupt(&self) {
        if self.irq_attached.swap(false, Ordering::AcqRel) {
            self.interrupts.mask(self.irq);
            self.interrupts.detach(self.irq);
            IRQ_TABLE.unbind(self.irq);
            self.debug(format_args!("detached irq {}", self.irq));
        }
    }

    /// Enable the device interrupt
    ///
    /// No-op if the device has no attached line.
    pub fn interrupt_enable(&self) {
        if self.irq_attached() {
            self.interrupts.unmask(self.irq);
        }
    }

    /// Disable the device interrupt
    ///
    /// No-op if the device has no attached line.
    pub fn interrupt_disable(&self) {
        if self.irq_attached() {
            self.interrupts.mask(self.irq);
        }
    }

    /// Take the driver lock
    ///
    /// Each device instance has its own lock. Acquisition waits until the
    /// lock is free and never reports failure to the caller. Must not be
    /// called from interrupt context.
    pub fn lock(&self) -> DeviceGuard<'_> {
        DeviceGuard {
            device: self,
            _inner: self.lock.lock(),
        }
    }

    /// Enable or disable debug messages for this instance
    pub fn set_debug(&self, enabled: bool) {
        self.debug_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled.load(Ordering::Relaxed)
    }

    /// Log a message, prefixed with the driver name
    pub fn log(&self, args: fmt::Arguments<'_>) {
        log::info!("{}: {}", self.name, args);
    }

    /// Print a debug message, prefixed with the driver name
    ///
    /// Only emitted while debugging is enabled for this instance.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.debug_enabled() {
            log::debug!("{}: {}", self.name, args);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.unregister_interrupt();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("irq", &self.irq)
            .field("irq_attached", &self.irq_attached())
            .finish()
    }
}
