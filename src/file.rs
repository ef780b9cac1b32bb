/*
 * Caller-Facing File Operations
 *
 * Once a device node is published, callers reach it through the FileOps
 * trait: open, close, read, write, seek, ioctl and poll, each taking the
 * File that represents the caller's open session.
 *
 * Sessions are anonymous to the framework. A device only counts them;
 * the File is how a caller hands per-session data (the private handle)
 * down to the driver.
 */

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::poll::PollFd;

bitflags! {
    /// Flags a session was opened with
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const NONBLOCK = 1 << 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the beginning
    Set,
    /// From the current position
    Current,
    /// From the end
    End,
}

// Ioctl command numbering: an 8-bit command base in the high byte, the
// command number in the low byte.
pub const fn ioc(base: u32, nr: u32) -> u32 {
    (base << 8) | (nr & 0xff)
}

pub const fn ioc_base(cmd: u32) -> u32 {
    cmd >> 8
}

pub const fn ioc_nr(cmd: u32) -> u32 {
    cmd & 0xff
}

/// Command base reserved for framework-level controls
pub const DIOC_BASE: u32 = 0x05;

/// Retrieve the private handle of the calling session
pub const DIOC_GETPRIV: u32 = ioc(DIOC_BASE, 0x01);

/// One open session on a device node
#[derive(Debug, Clone)]
pub struct File {
    flags: OpenFlags,
    pos: u64,
    private: usize,
}

impl File {
    pub fn new(flags: OpenFlags) -> Self {
        Self {
            flags,
            pos: 0,
            private: 0,
        }
    }

    /// Create a session carrying a caller-chosen private handle
    pub fn with_private(flags: OpenFlags, private: usize) -> Self {
        Self {
            flags,
            pos: 0,
            private,
        }
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags.contains(OpenFlags::NONBLOCK)
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn set_pos(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Private handle associated with this session
    ///
    /// The framework attaches no meaning to it: it is whatever the opener
    /// (or the driver's `open_first`) stored, and two sessions on the same
    /// node may carry the same value.
    pub fn private(&self) -> usize {
        self.private
    }

    pub fn set_private(&mut self, private: usize) {
        self.private = private;
    }
}

/// Operations a published device node answers
///
/// Return values follow the usual convention: `Ok` carries a byte count,
/// offset or command result, `Err` names the failure kind (see
/// [`crate::error::ret`] for the `-errno` form).
pub trait FileOps: Send + Sync {
    fn open(&self, file: &mut File) -> Result<()>;

    fn close(&self, file: &mut File) -> Result<()>;

    fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, file: &mut File, buf: &[u8]) -> Result<usize>;

    /// Returns the previous position
    fn seek(&self, file: &mut File, offset: i64, whence: Whence) -> Result<u64>;

    fn ioctl(&self, file: &mut File, cmd: u32, arg: usize) -> Result<usize>;

    /// Set up (`setup == true`) or tear down a poll wait
    fn poll(&self, file: &mut File, fd: &Arc<PollFd>, setup: bool) -> Result<()>;
}
