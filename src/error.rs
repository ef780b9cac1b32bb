/*
 * Device Error Codes
 *
 * Every framework and driver operation reports failure through
 * DeviceError. Each kind carries the POSIX errno it stands for, so the
 * caller-facing surface can still hand out the classic "negative value
 * names the failure" return code when it has to.
 */

use core::fmt;

/// POSIX errno values used by the framework
///
/// Subset of standard POSIX error codes for file-operation compatibility.
pub mod errno {
    pub const ENOENT: i32 = 2; // No such file or directory
    pub const EIO: i32 = 5; // I/O error
    pub const EBADF: i32 = 9; // Bad file descriptor
    pub const EAGAIN: i32 = 11; // Try again
    pub const ENOMEM: i32 = 12; // Out of memory
    pub const EBUSY: i32 = 16; // Device or resource busy
    pub const EEXIST: i32 = 17; // File exists
    pub const ENODEV: i32 = 19; // No such device
    pub const EINVAL: i32 = 22; // Invalid argument
    pub const ENOTTY: i32 = 25; // Not a typewriter
    pub const ENOSYS: i32 = 38; // Function not implemented
}

/// Failure kinds reported by devices
///
/// The discriminant doubles as a compact code so a kind can be parked in an
/// atomic (see [`DeviceError::code`]); zero is reserved for "no error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceError {
    /// `init()` or the interrupt attach failed; the instance must not be used
    InitializationFailure = 1,
    /// The driver does not implement this operation
    Unsupported = 2,
    /// A fixed-capacity table (poll waiters, IRQ entries, nodes) is full
    CapacityExceeded = 3,
    /// Lifecycle precondition violated, e.g. close without an open
    InvalidState = 4,
    /// No layer recognized the ioctl command
    UnrecognizedControl = 5,
    /// The interrupt line is already bound to another device
    Busy = 6,
    /// A node with this name is already published
    AlreadyExists = 7,
    /// No node with this name is published
    NotFound = 8,
    /// Driver rejected an argument
    InvalidArgument = 9,
    /// The operation would block and the caller asked it not to
    WouldBlock = 10,
    /// Hardware or transfer error reported by the driver
    Io = 11,
}

/// Result type used across the framework
pub type Result<T> = core::result::Result<T, DeviceError>;

impl DeviceError {
    /// Returns the positive errno this kind corresponds to.
    pub const fn errno(self) -> i32 {
        match self {
            Self::InitializationFailure => errno::ENODEV,
            Self::Unsupported => errno::ENOSYS,
            Self::CapacityExceeded => errno::ENOMEM,
            Self::InvalidState => errno::EBADF,
            Self::UnrecognizedControl => errno::ENOTTY,
            Self::Busy => errno::EBUSY,
            Self::AlreadyExists => errno::EEXIST,
            Self::NotFound => errno::ENOENT,
            Self::InvalidArgument => errno::EINVAL,
            Self::WouldBlock => errno::EAGAIN,
            Self::Io => errno::EIO,
        }
    }

    /// Returns the `-errno` form handed back through file operations.
    pub const fn as_ret(self) -> isize {
        -(self.errno() as isize)
    }

    /// Compact non-zero code for storing a kind in an atomic.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`DeviceError::code`]. Zero and unknown codes yield `None`.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::InitializationFailure,
            2 => Self::Unsupported,
            3 => Self::CapacityExceeded,
            4 => Self::InvalidState,
            5 => Self::UnrecognizedControl,
            6 => Self::Busy,
            7 => Self::AlreadyExists,
            8 => Self::NotFound,
            9 => Self::InvalidArgument,
            10 => Self::WouldBlock,
            11 => Self::Io,
            _ => return None,
        })
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InitializationFailure => "device initialization failed",
            Self::Unsupported => "operation not supported",
            Self::CapacityExceeded => "capacity exceeded",
            Self::InvalidState => "invalid device state",
            Self::UnrecognizedControl => "no such control operation",
            Self::Busy => "interrupt line busy",
            Self::AlreadyExists => "device node already exists",
            Self::NotFound => "no such device node",
            Self::InvalidArgument => "invalid argument",
            Self::WouldBlock => "operation would block",
            Self::Io => "I/O error",
        };
        write!(f, "{} (errno {})", msg, self.errno())
    }
}

/// Folds a transfer result into the file-operation return convention
///
/// Non-negative values are byte counts or offsets, negative values are
/// `-errno`.
pub fn ret(result: Result<usize>) -> isize {
    match result {
        Ok(n) => n as isize,
        Err(e) => e.as_ret(),
    }
}
