//! # Kernel Errors
//!
//! Every kernel service returns `Result<_, Error>`. Errors never unwind
//! across the call boundary; a failure local to one task leaves the rest of
//! the kernel untouched.

use core::fmt;

/// The reason a kernel service failed.
///
/// [`Error::status_code`] maps each variant onto the OSEK `StatusType`
/// value an OSEK application would see.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unknown task, resource, alarm or counter ID.
    InvalidId,
    /// Activating a task that is not suspended, or arming an armed alarm.
    AlreadyActive,
    /// Releasing a resource the calling task does not own.
    NotOwner,
    /// Releasing a resource that is not the most recently locked one.
    UnlockOrderViolation,
    /// Locking resources out of ceiling order (`nesting_checks` only).
    NestingViolation,
    /// The service is not callable from the current execution context.
    IllegalContext,
    /// Argument out of range.
    InvalidValue,
    /// The object is not accessible to the caller: a resource the task is
    /// not configured to lock, a resource owned by another task, or an
    /// event service on a basic task.
    Access,
    /// The target task or the kernel is in the wrong state for this call.
    State,
    /// The calling task still holds resources. Returned as a diagnostic by
    /// `terminate_task`, which releases them anyway.
    ResourcesHeld,
    /// The alarm is not armed.
    NotActive,
}

impl Error {
    /// OSEK `StatusType` code for this error (`E_OK` is 0).
    pub const fn status_code(self) -> u8 {
        match self {
            Error::Access | Error::NestingViolation => 1, // E_OS_ACCESS
            Error::IllegalContext => 2,                    // E_OS_CALLEVEL
            Error::InvalidId => 3,                         // E_OS_ID
            Error::AlreadyActive => 4,                     // E_OS_LIMIT
            Error::NotOwner | Error::NotActive => 5,       // E_OS_NOFUNC
            Error::UnlockOrderViolation | Error::ResourcesHeld => 6, // E_OS_RESOURCE
            Error::State => 7,                             // E_OS_STATE
            Error::InvalidValue => 8,                      // E_OS_VALUE
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidId => "invalid object id",
            Error::AlreadyActive => "object already active",
            Error::NotOwner => "resource not owned by caller",
            Error::UnlockOrderViolation => "resource released out of lock order",
            Error::NestingViolation => "resource locked out of ceiling order",
            Error::IllegalContext => "service not callable from this context",
            Error::InvalidValue => "argument out of range",
            Error::Access => "object not accessible to caller",
            Error::State => "object in wrong state",
            Error::ResourcesHeld => "task still holds resources",
            Error::NotActive => "alarm not armed",
        };
        f.write_str(msg)
    }
}
