/*
 * Device Framework
 *
 * Base layer every peripheral driver in the flight stack builds on. It
 * gives drivers a uniform lifecycle (init/open/close), interrupt
 * registration and dispatch, per-instance locking and poll readiness
 * notification, so none of them has to re-implement those.
 *
 * Layering:
 * - Device: name, interrupt line, per-instance lock
 * - CDev: character-device semantics (open counting, default I/O, poll)
 * - Pio: register window for memory-mapped peripherals
 *
 * The framework consumes two host facilities, an interrupt controller
 * (irq::InterruptLine) and a device namespace (namespace::Namespace), and
 * exposes a file-like surface (file::FileOps) on every published node.
 *
 * The crate is no_std + alloc; tests build against std on the host.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cdev;
pub mod device;
pub mod error;
pub mod file;
pub mod irq;
pub mod namespace;
pub mod pio;
pub mod platform;
pub mod poll;

#[cfg(test)]
mod testing;

pub use cdev::{CDev, Driver};
pub use device::{Device, DeviceGuard};
pub use error::{DeviceError, Result};
pub use file::{DIOC_GETPRIV, File, FileOps, OpenFlags, Whence};
pub use irq::{
    InterruptHook, InterruptLine, IrqContext, IrqHandler, IrqNumber, dispatch_interrupt,
    spurious_interrupts,
};
pub use namespace::{DeviceRegistry, Namespace};
pub use pio::{Io, Mmio, Pio, PioDriver, ReadOnly};
pub use platform::Platform;
pub use poll::{MAX_POLL_WAITERS, PollEvents, PollFd, PollHandle, PollSet};
