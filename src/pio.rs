/*
 * Register-Mapped I/O Devices
 *
 * Most peripherals on the flight controller are driven through a window of
 * 32-bit registers at a fixed physical address. This module provides:
 *
 * - `Io`: the generic register interface (read, write, flag helpers)
 * - `Mmio<T>`: one volatile memory-mapped register
 * - `ReadOnly<I>`: wrapper exposing only the read side of a register
 * - `Pio`: a register window at a base address with byte-offset accessors
 * - `PioDriver`: lets a CDev reach its driver's window by delegation
 *
 * Offsets are never checked against the size of the window; reaching past
 * it is a bug in the caller. Read-modify-write is not atomic: two contexts
 * modifying the same register must serialize themselves, either through
 * the device lock (`modify_register_locked`) or their own discipline.
 */

use core::marker::PhantomData;
use core::ops::{BitAnd, BitOr, Not};
use core::ptr::{self, NonNull};

use volatile::VolatilePtr;

use crate::cdev::{CDev, Driver};
use crate::device::DeviceGuard;
use crate::error::{DeviceError, Result};

/// I/O interface trait
pub trait Io {
    /// The value type used for I/O operations.
    type Value: Copy
        + PartialEq
        + BitAnd<Output = Self::Value>
        + BitOr<Output = Self::Value>
        + Not<Output = Self::Value>;

    /// Reads the value from the I/O interface.
    fn read(&self) -> Self::Value;

    /// Writes the value to the I/O interface.
    fn write(&mut self, value: Self::Value);

    /// Reads the value from the I/O interface and checks if the specified flags are set.
    fn readf(&self, flags: Self::Value) -> bool {
        (self.read() & flags) == flags
    }

    /// Sets (`value == true`) or clears the specified flags.
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let tmp: Self::Value = match value {
            true => self.read() | flags,
            false => self.read() & !flags,
        };
        self.write(tmp);
    }
}

/// Wrapper for an I/O interface providing read-only access.
pub struct ReadOnly<I> {
    inner: I,
}

impl<I> ReadOnly<I> {
    /// Creates a new `ReadOnly` wrapper instance.
    pub const fn new(inner: I) -> ReadOnly<I> {
        ReadOnly { inner }
    }
}

impl<I: Io> ReadOnly<I> {
    /// Reads the value from the I/O interface.
    #[inline(always)]
    pub fn read(&self) -> I::Value {
        self.inner.read()
    }

    /// Reads the value from the I/O interface and checks if the specified flags are set.
    pub fn readf(&self, flags: I::Value) -> bool {
        self.inner.readf(flags)
    }
}

/// A single memory-mapped register
#[derive(Debug, Clone, Copy)]
pub struct Mmio<T> {
    addr: usize,
    value: PhantomData<T>,
}

impl<T> Mmio<T> {
    /// Create a register handle for `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be non-null, suitably aligned for `T` and mapped for
    /// volatile access for as long as the handle is used.
    pub const unsafe fn new(addr: usize) -> Self {
        Mmio {
            addr,
            value: PhantomData,
        }
    }

    pub const fn addr(&self) -> usize {
        self.addr
    }

    fn ptr(&self) -> VolatilePtr<'_, T> {
        // SAFETY: guaranteed by the contract of `Mmio::new`
        unsafe { VolatilePtr::new(NonNull::new_unchecked(self.addr as *mut T)) }
    }
}

impl<T> Io for Mmio<T>
where
    T: Copy + PartialEq + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
{
    type Value = T;

    #[inline(always)]
    fn read(&self) -> T {
        self.ptr().read()
    }

    #[inline(always)]
    fn write(&mut self, value: T) {
        self.ptr().write(value)
    }
}

/// Register window of a memory-mapped peripheral
#[derive(Debug)]
pub struct Pio {
    base: usize,
}

impl Pio {
    /// Create a window starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be non-null, 4-byte aligned and mapped for volatile
    /// access, together with every offset later passed to the accessors,
    /// for as long as the window lives.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub const fn base_address(&self) -> usize {
        self.base
    }

    /// Register at `offset` bytes from the base
    pub fn reg(&self, offset: usize) -> Mmio<u32> {
        // SAFETY: the window's contract covers every offset the driver uses
        unsafe { Mmio::new(self.base + offset) }
    }

    /// Read-only view of the register at `offset`
    pub fn reg_ro(&self, offset: usize) -> ReadOnly<Mmio<u32>> {
        ReadOnly::new(self.reg(offset))
    }

    /// Read a register
    ///
    /// # Arguments
    /// * `offset` - Register offset in bytes from the base address
    pub fn read_register(&self, offset: usize) -> u32 {
        self.reg(offset).read()
    }

    /// Write a register
    ///
    /// # Arguments
    /// * `offset` - Register offset in bytes from the base address
    /// * `value` - Value to write
    pub fn write_register(&self, offset: usize, value: u32) {
        self.reg(offset).write(value)
    }

    /// Modify a register
    ///
    /// Clears `clear_bits`, then sets `set_bits`. The read/modify/write
    /// cycle can race with any other context touching the same register;
    /// the caller must rule that out.
    pub fn modify_register(&self, offset: usize, clear_bits: u32, set_bits: u32) {
        let mut reg = self.reg(offset);
        let value = (reg.read() & !clear_bits) | set_bits;
        reg.write(value);
    }

    /// True if every bit of `mask` is set in the register at `offset`
    pub fn bits_set(&self, offset: usize, mask: u32) -> bool {
        self.reg_ro(offset).readf(mask)
    }
}

/// A driver for a register-mapped device
pub trait PioDriver: Driver {
    fn pio(&self) -> &Pio;
}

impl<D: PioDriver> CDev<D> {
    /// Base address of the driver's register window
    pub fn base_address(&self) -> usize {
        self.driver().pio().base_address()
    }

    /// See [`Pio::read_register`]
    pub fn read_register(&self, offset: usize) -> u32 {
        self.driver().pio().read_register(offset)
    }

    /// See [`Pio::write_register`]
    pub fn write_register(&self, offset: usize, value: u32) {
        self.driver().pio().write_register(offset, value)
    }

    /// See [`Pio::modify_register`]; unsynchronized
    pub fn modify_register(&self, offset: usize, clear_bits: u32, set_bits: u32) {
        self.driver().pio().modify_register(offset, clear_bits, set_bits)
    }

    /// Read-modify-write while holding this device's lock
    ///
    /// Serializes against every other caller that modifies through the
    /// lock. It does not protect against the interrupt handler, which never
    /// takes the lock. Fails with [`DeviceError::InvalidState`] if `guard`
    /// belongs to another device.
    pub fn modify_register_locked(
        &self,
        guard: &DeviceGuard<'_>,
        offset: usize,
        clear_bits: u32,
        set_bits: u32,
    ) -> Result<()> {
        if !ptr::eq(guard.device(), self.device()) {
            return Err(DeviceError::InvalidState);
        }
        self.modify_register(offset, clear_bits, set_bits);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{File, OpenFlags};
    use crate::namespace::DeviceRegistry;
    use crate::platform::Platform;
    use crate::testing::MockLine;
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;

    const CTRL: usize = 0x00;
    const STATUS: usize = 0x04;
    const DATA: usize = 0x08;

    /// Backing store standing in for a peripheral's register block
    struct Regs(Vec<u32>);

    impl Regs {
        fn new() -> Self {
            Regs(vec![0u32; 16])
        }

        fn window(&mut self) -> Pio {
            unsafe { Pio::new(self.0.as_mut_ptr() as usize) }
        }
    }

    struct Timer {
        pio: Pio,
    }

    impl Driver for Timer {
        fn open_first(&self, dev: &CDev<Self>, _file: &mut File) -> Result<()> {
            dev.write_register(CTRL, 0x1);
            Ok(())
        }

        fn close_last(&self, dev: &CDev<Self>, _file: &mut File) -> Result<()> {
            dev.modify_register(CTRL, 0x1, 0);
            Ok(())
        }

        fn read(&self, dev: &CDev<Self>, _file: &mut File, buf: &mut [u8]) -> Result<usize> {
            if buf.len() < 4 {
                return Err(DeviceError::InvalidArgument);
            }
            buf[..4].copy_from_slice(&dev.read_register(DATA).to_le_bytes());
            Ok(4)
        }
    }

    impl PioDriver for Timer {
        fn pio(&self) -> &Pio {
            &self.pio
        }
    }

    #[test]
    fn modify_matches_read_clear_set_write() {
        let mut regs = Regs::new();
        let pio = regs.window();

        let cases = [
            (0xffff_0000u32, 0x0000_ff00u32, 0x0000_000fu32),
            (0x1234_5678, 0xffff_ffff, 0xa5a5_a5a5),
            (0x0000_0000, 0x0000_0000, 0x8000_0001),
            (0xdead_beef, 0x0f0f_0f0f, 0x0000_0000),
        ];

        for (initial, clear, set) in cases {
            pio.write_register(STATUS, initial);
            pio.modify_register(STATUS, clear, set);
            assert_eq!(pio.read_register(STATUS), (initial & !clear) | set);
        }
    }

    #[test]
    fn registers_are_addressed_by_byte_offset() {
        let mut regs = Regs::new();
        let pio = regs.window();

        pio.write_register(CTRL, 1);
        pio.write_register(DATA, 3);
        assert_eq!(pio.read_register(CTRL), 1);
        assert_eq!(pio.read_register(STATUS), 0);
        assert_eq!(pio.read_register(DATA), 3);
        assert_eq!(pio.reg(DATA).addr(), pio.base_address() + 8);

        assert!(pio.bits_set(DATA, 0x3));
        assert!(!pio.bits_set(DATA, 0x4));
    }

    #[test]
    fn io_flag_helpers() {
        let mut regs = Regs::new();
        let pio = regs.window();
        let mut ctrl = pio.reg(CTRL);

        ctrl.writef(0x10, true);
        assert!(ctrl.readf(0x10));
        ctrl.writef(0x10, false);
        assert_eq!(ctrl.read(), 0);
    }

    #[test]
    fn pio_device_drives_registers_through_hooks() {
        let mut regs = Regs::new();
        let line = MockLine::new();
        let platform = Platform::new(line, Arc::new(DeviceRegistry::new()));
        let dev = CDev::new("timer", None, 0, &platform, Timer { pio: regs.window() });
        dev.init().unwrap();

        let mut file = File::new(OpenFlags::READ);
        dev.open(&mut file).unwrap();
        assert_eq!(dev.read_register(CTRL), 0x1);

        dev.write_register(DATA, 0x0403_0201);
        let mut buf = [0u8; 4];
        assert_eq!(dev.read(&mut file, &mut buf), Ok(4));
        assert_eq!(buf, [1, 2, 3, 4]);

        dev.close(&mut file).unwrap();
        assert_eq!(dev.read_register(CTRL), 0);
    }

    #[test]
    fn locked_modify_checks_guard_ownership() {
        let mut regs_a = Regs::new();
        let mut regs_b = Regs::new();
        let line = MockLine::new();
        let platform = Platform::new(line, Arc::new(DeviceRegistry::new()));
        let a = CDev::new("a", None, 0, &platform, Timer { pio: regs_a.window() });
        let b = CDev::new("b", None, 0, &platform, Timer { pio: regs_b.window() });

        let guard = a.lock();
        a.modify_register_locked(&guard, STATUS, 0, 0x5).unwrap();
        assert_eq!(
            b.modify_register_locked(&guard, STATUS, 0, 0x5),
            Err(DeviceError::InvalidState)
        );
        drop(guard);

        assert_eq!(a.read_register(STATUS), 0x5);
        assert_eq!(b.read_register(STATUS), 0);
    }
}
