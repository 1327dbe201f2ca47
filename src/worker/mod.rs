//! The worker runtime: one module per resource-axis kernel plus the shared
//! epoch loop.

pub mod cpu;
pub mod disk;
pub mod mem;
pub mod net;
pub mod runtime;

use std::sync::atomic::AtomicBool;

/// Result of one call into a class kernel for up to one epoch's worth of
/// work. `stalled` lets the disk kernel report `MAX_CONSECUTIVE_SEEKS`
/// exhaustion without the runtime special-casing any one class.
pub struct EpochResult {
    pub done: u64,
    pub stalled: bool,
}

/// The only coupling between the generic epoch loop and a resource-specific
/// kernel.
pub trait Kernel: Send {
    /// Perform up to `units` of work, checking `exiting` between
    /// individually-blocking operations so cancellation is honored within
    /// one kernel call.
    fn run_epoch(&mut self, units: u64, exiting: &AtomicBool) -> EpochResult;

    /// Flush/close any durable resources. Called once, from the worker's
    /// teardown step.
    fn teardown(&mut self) {}
}
