//! # Architecture Abstraction Layer
//!
//! The [`Port`] trait is everything the portable kernel needs from the
//! target. The Cortex-M4 port is the only implementation; extend to other
//! architectures by adding sibling modules.

use crate::service::Context;

pub trait Port {
    /// The execution context of the caller.
    fn context() -> Context;

    /// Request a task switch. Called with interrupts masked; the switch
    /// happens once they are unmasked.
    fn request_dispatch();

    /// Stop the CPU for good.
    fn halt() -> !;
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
