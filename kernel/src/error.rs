// Kernel Error Taxonomy
//
// Defines the single error type shared by every subsystem of the core and
// its translation into the negative codes returned across the syscall
// boundary.
//
// Key responsibilities:
// - Name every failure class the memory and scheduling layers can report
// - Give each class a stable negative code for user space
// - Provide a `Result` alias so subsystems propagate errors with `?`
//
// Error classes:
// - `ResourceExhausted`: no free frame, no fitting heap block, PID table full
// - `InvalidArgument`: null pointer, zero size, bad priority, bad CPU index
// - `DoubleFree`: a release of something already released (state untouched)
// - `Unimplemented`: requests the kernel knowingly does not support
// - `NoMessage`: empty mailbox on a non-blocking receive
// - `NoSuchProcess`: PID not present (or no longer addressable)
// - `BadAddress`: a caller-supplied buffer pointer that cannot be used
//
// Correctness notes:
// - Fatal only during mandatory boot-time setup; everywhere else a failure
//   fails the single request that produced it

use core::fmt;

pub const ESRCH: i64 = -3;
pub const EAGAIN: i64 = -11;
pub const ENOMEM: i64 = -12;
pub const EFAULT: i64 = -14;
pub const EINVAL: i64 = -21;
pub const ENOSYS: i64 = -38;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    ResourceExhausted,
    InvalidArgument,
    DoubleFree,
    Unimplemented,
    NoMessage,
    NoSuchProcess,
    BadAddress,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    pub const fn errno(self) -> i64 {
        match self {
            KernelError::ResourceExhausted => ENOMEM,
            KernelError::InvalidArgument | KernelError::DoubleFree => EINVAL,
            KernelError::Unimplemented => ENOSYS,
            KernelError::NoMessage => EAGAIN,
            KernelError::NoSuchProcess => ESRCH,
            KernelError::BadAddress => EFAULT,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            KernelError::ResourceExhausted => "resource exhausted",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::DoubleFree => "double free",
            KernelError::Unimplemented => "not supported",
            KernelError::NoMessage => "no message",
            KernelError::NoSuchProcess => "no such process",
            KernelError::BadAddress => "bad address",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
