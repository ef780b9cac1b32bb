/*
 * Character Devices
 *
 * CDev adds the generic character-device semantics on top of Device:
 * open/close accounting, default I/O behaviour, ioctl fallback and poll
 * multiplexing. A concrete driver supplies a Driver implementation and
 * overrides only the hooks it cares about; everything else falls back to
 * the defaults below.
 *
 * Lifecycle (per instance, not per session):
 * - Unopened (open_count == 0) -> Open on the first successful open;
 *   `open_first` runs under the device lock and can veto the open
 * - Open -> Open on further opens and on closes that leave sessions behind
 * - Open -> Unopened on the close that drops the count to zero;
 *   `close_last` runs under the device lock
 * - close while Unopened is refused with InvalidState
 */

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use spin::Mutex;

use crate::device::{Device, DeviceGuard};
use crate::error::{DeviceError, Result};
use crate::file::{DIOC_GETPRIV, File, FileOps, Whence};
use crate::irq::{InterruptHook, IrqContext, IrqNumber};
use crate::namespace::Namespace;
use crate::platform::Platform;
use crate::poll::{PollEvents, PollFd, PollSet};

/// Hooks a concrete driver implements
///
/// Every hook receives the owning [`CDev`] so it can reach the device
/// lock, the poll registry and the logging helpers.
pub trait Driver: Send + Sync + Sized + 'static {
    /// Driver-specific initialisation (probe the hardware, reset it, ...)
    ///
    /// Runs after the interrupt line is attached and before the node is
    /// published.
    fn init(&self, _dev: &CDev<Self>) -> Result<()> {
        Ok(())
    }

    /// Notification of the first open
    ///
    /// Called when the open count goes from zero to one, with the device
    /// lock held. An error fails the open.
    fn open_first(&self, _dev: &CDev<Self>, _file: &mut File) -> Result<()> {
        Ok(())
    }

    /// Notification of the last close
    ///
    /// Called when the open count goes from one to zero, with the device
    /// lock held. An error is returned from the close, which still counts.
    fn close_last(&self, _dev: &CDev<Self>, _file: &mut File) -> Result<()> {
        Ok(())
    }

    fn read(&self, _dev: &CDev<Self>, _file: &mut File, _buf: &mut [u8]) -> Result<usize> {
        Err(DeviceError::Unsupported)
    }

    fn write(&self, _dev: &CDev<Self>, _file: &mut File, _buf: &[u8]) -> Result<usize> {
        Err(DeviceError::Unsupported)
    }

    /// Returns the previous position
    fn seek(
        &self,
        _dev: &CDev<Self>,
        _file: &mut File,
        _offset: i64,
        _whence: Whence,
    ) -> Result<u64> {
        Err(DeviceError::Unsupported)
    }

    /// Device control
    ///
    /// Implementations must hand commands they do not handle to
    /// [`CDev::default_ioctl`].
    fn ioctl(&self, dev: &CDev<Self>, file: &mut File, cmd: u32, arg: usize) -> Result<usize> {
        dev.default_ioctl(file, cmd, arg)
    }

    /// Events currently ready from the point of view of `file`
    fn poll_state(&self, _dev: &CDev<Self>, _file: &File) -> PollEvents {
        PollEvents::empty()
    }

    /// Interrupt handler
    ///
    /// Runs in interrupt context: no device lock, no blocking, bounded
    /// time. An error is latched on the device and announced to poll
    /// waiters as [`PollEvents::ERR`].
    fn interrupt(&self, _dev: &CDev<Self>, _ctx: &IrqContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Whether the device may run without its interrupt line
    fn interrupt_optional(&self) -> bool {
        false
    }
}

/// A character device
pub struct CDev<D: Driver> {
    device: Device,
    devname: Option<&'static str>,
    registered: AtomicBool,
    initialized: AtomicBool,
    /// Serializes `init`; held across the driver hook and the publish
    init_lock: Mutex<()>,
    /// The node handed to the namespace, used to take it back on drop
    node: Mutex<Option<Weak<dyn FileOps>>>,
    open_count: AtomicU32,
    pollset: PollSet,
    irq_error: AtomicU8,
    namespace: Arc<dyn Namespace>,
    driver: D,
}

impl<D: Driver> CDev<D> {
    /// Create a character device
    ///
    /// # Arguments
    /// * `name` - Driver name
    /// * `devname` - Device node name, or `None` for a device that is never published
    /// * `irq` - Interrupt assigned to the device (0 for none)
    /// * `platform` - Host interrupt controller and namespace
    /// * `driver` - The driver hooks
    pub fn new(
        name: &'static str,
        devname: Option<&'static str>,
        irq: IrqNumber,
        platform: &Platform,
        driver: D,
    ) -> Arc<Self> {
        Arc::new(Self {
            device: Device::new(name, irq, platform.interrupts().clone()),
            devname,
            registered: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            node: Mutex::new(None),
            open_count: AtomicU32::new(0),
            pollset: PollSet::new(),
            irq_error: AtomicU8::new(0),
            namespace: platform.namespace().clone(),
            driver,
        })
    }

    /// Initialise the device and publish its node
    ///
    /// Attaches the interrupt line, runs the driver's `init`, then
    /// publishes the node. Any failure undoes the earlier steps and reports
    /// [`DeviceError::InitializationFailure`]; the instance must not be used
    /// afterwards. Calling `init` again after it succeeded is a no-op;
    /// concurrent calls wait for the first one to finish.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        let _init = self.init_lock.lock();

        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let hook: Weak<dyn InterruptHook> = Arc::downgrade(self) as Weak<dyn InterruptHook>;
        self.device.init(hook, self.driver.interrupt_optional())?;

        if let Err(err) = self.driver.init(self) {
            log::error!("{}: driver init failed: {}", self.name(), err);
            self.device.unregister_interrupt();
            return Err(DeviceError::InitializationFailure);
        }

        if let Some(devname) = self.devname {
            let node: Weak<dyn FileOps> = Arc::downgrade(self) as Weak<dyn FileOps>;
            if let Err(err) = self.namespace.publish(devname, node.clone()) {
                log::error!("{}: could not publish {}: {}", self.name(), devname, err);
                self.device.unregister_interrupt();
                return Err(DeviceError::InitializationFailure);
            }
            *self.node.lock() = Some(node);
            self.registered.store(true, Ordering::Release);
        }

        self.initialized.store(true, Ordering::Release);
        self.device.debug(format_args!("initialised"));
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn name(&self) -> &'static str {
        self.device.name()
    }

    pub fn devname(&self) -> Option<&'static str> {
        self.devname
    }

    /// True once the node is published
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Take the driver lock (see [`Device::lock`])
    pub fn lock(&self) -> DeviceGuard<'_> {
        self.device.lock()
    }

    /// Test whether the device is currently open
    ///
    /// Does not take the lock; can be used to avoid tearing down a device
    /// that is still active.
    pub fn is_open(&self) -> bool {
        self.open_count() > 0
    }

    /// Number of sessions currently open
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Handle an open of the device
    ///
    /// Fails with [`DeviceError::InvalidState`] if the open count is
    /// saturated.
    pub fn open(&self, file: &mut File) -> Result<()> {
        let _guard = self.device.lock();

        let count = self.open_count.load(Ordering::Acquire);
        let next = count.checked_add(1).ok_or(DeviceError::InvalidState)?;
        if count == 0 {
            self.driver.open_first(self, file)?;
        }
        self.open_count.store(next, Ordering::Release);
        Ok(())
    }

    /// Handle a close of the device
    ///
    /// Fails with [`DeviceError::InvalidState`] if nothing is open; the
    /// count never underflows.
    pub fn close(&self, file: &mut File) -> Result<()> {
        let _guard = self.device.lock();

        match self.open_count.load(Ordering::Acquire) {
            0 => {
                log::warn!("{}: close without matching open", self.name());
                Err(DeviceError::InvalidState)
            }
            1 => {
                self.open_count.store(0, Ordering::Release);
                self.driver.close_last(self, file)
            }
            n => {
                self.open_count.store(n - 1, Ordering::Release);
                Ok(())
            }
        }
    }

    pub fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        self.driver.read(self, file, buf)
    }

    pub fn write(&self, file: &mut File, buf: &[u8]) -> Result<usize> {
        self.driver.write(self, file, buf)
    }

    pub fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> Result<u64> {
        self.driver.seek(self, file, offset, whence)
    }

    pub fn ioctl(&self, file: &mut File, cmd: u32, arg: usize) -> Result<usize> {
        self.driver.ioctl(self, file, cmd, arg)
    }

    /// Framework-level ioctl handling
    ///
    /// Handles [`DIOC_GETPRIV`] by returning the session's private handle
    /// and refuses everything else with
    /// [`DeviceError::UnrecognizedControl`].
    pub fn default_ioctl(&self, file: &File, cmd: u32, _arg: usize) -> Result<usize> {
        match cmd {
            DIOC_GETPRIV => Ok(file.private()),
            _ => Err(DeviceError::UnrecognizedControl),
        }
    }

    /// Perform a poll setup/teardown operation
    ///
    /// On setup, events reported by an earlier round are cleared and a
    /// waiter whose events are already ready is woken at once and not
    /// registered. Otherwise it is stored until teardown; a full
    /// waiter table fails with [`DeviceError::CapacityExceeded`]. Teardown
    /// of a waiter that is not registered succeeds. Neither direction takes
    /// the device lock.
    pub fn poll(&self, file: &mut File, fd: &Arc<PollFd>, setup: bool) -> Result<()> {
        if !setup {
            self.pollset.remove(fd);
            return Ok(());
        }

        fd.take_revents();

        let ready = fd.events() & self.driver.poll_state(self, file);
        if !ready.is_empty() {
            self.poll_notify_one(fd, ready);
            return Ok(());
        }

        let posts = fd.pending_posts();
        if let Err(err) = self.pollset.store(fd) {
            self.device.debug(format_args!("poll waiter rejected: {}", err));
            return Err(err);
        }

        // The state may have changed while the waiter was being stored, and
        // a notification racing with the store can skip the slot.
        let ready = fd.events() & self.driver.poll_state(self, file);
        if !ready.is_empty() {
            self.pollset.remove(fd);
            if fd.pending_posts() == posts {
                self.poll_notify_one(fd, ready);
            }
        }

        Ok(())
    }

    /// Report new poll events
    ///
    /// Call whenever the device state changes in a way a poll waiter might
    /// care about. Safe from interrupt context. Returns the number of
    /// waiters woken.
    pub fn poll_notify(&self, events: PollEvents) -> usize {
        self.pollset
            .notify_with(events, |fd, events| self.poll_notify_one(fd, events))
    }

    /// Deliver `events` to a single waiter
    pub fn poll_notify_one(&self, fd: &PollFd, events: PollEvents) -> bool {
        fd.notify(events)
    }

    /// Number of registered poll waiters
    pub fn poll_waiters(&self) -> usize {
        self.pollset.len()
    }

    /// Return and clear the last error raised by the interrupt handler
    pub fn take_interrupt_error(&self) -> Option<DeviceError> {
        DeviceError::from_code(self.irq_error.swap(0, Ordering::AcqRel))
    }
}

impl<D: Driver> InterruptHook for CDev<D> {
    fn interrupt(&self, ctx: &IrqContext<'_>) {
        if let Err(err) = self.driver.interrupt(self, ctx) {
            self.irq_error.store(err.code(), Ordering::Release);
            self.poll_notify(PollEvents::ERR);
        }
    }
}

impl<D: Driver> FileOps for CDev<D> {
    fn open(&self, file: &mut File) -> Result<()> {
        Self::open(self, file)
    }

    fn close(&self, file: &mut File) -> Result<()> {
        Self::close(self, file)
    }

    fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        Self::read(self, file, buf)
    }

    fn write(&self, file: &mut File, buf: &[u8]) -> Result<usize> {
        Self::write(self, file, buf)
    }

    fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> Result<u64> {
        Self::seek(self, file, offset, whence)
    }

    fn ioctl(&self, file: &mut File, cmd: u32, arg: usize) -> Result<usize> {
        Self::ioctl(self, file, cmd, arg)
    }

    fn poll(&self, file: &mut File, fd: &Arc<PollFd>, setup: bool) -> Result<()> {
        Self::poll(self, file, fd, setup)
    }
}

impl<D: Driver> Drop for CDev<D> {
    fn drop(&mut self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            if let (Some(devname), Some(node)) = (self.devname, self.node.get_mut().take()) {
                self.namespace.unpublish(devname, &node);
            }
        }
    }
}

impl<D: Driver> fmt::Debug for CDev<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CDev")
            .field("device", &self.device)
            .field("devname", &self.devname)
            .field("registered", &self.is_registered())
            .field("open_count", &self.open_count())
            .finish()
    }
}
