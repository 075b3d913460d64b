// src/io/event_loop.rs
//
// Event loop contract consumed by the transport backends.
//
// Backends never block: they register interest in read or write readiness
// on a descriptor, schedule timers, and defer work to run after the current
// callback batch. All methods take `&self` so a callback that is currently
// running may register, deregister or cancel freely.

use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness a descriptor callback is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
    Write,
}

/// Returned by every callback. `Remove` deregisters a descriptor callback
/// and stops a timer from being rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Keep,
    Remove,
}

/// Identifies a scheduled timer or deferred task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

pub type FdCallback = Box<dyn FnMut(RawFd, Interest) -> Directive>;
pub type TimerCallback = Box<dyn FnMut() -> Directive>;
pub type DeferredTask = Box<dyn FnOnce()>;

pub trait EventLoop {
    /// Register a callback for readiness on `fd`. Replaces any callback
    /// already registered for the same descriptor and interest.
    fn register_fd(&self, fd: RawFd, interest: Interest, callback: FdCallback);

    /// Drop the callback for readiness on `fd`. No-op when none is registered.
    fn deregister_fd(&self, fd: RawFd, interest: Interest);

    /// Run `callback` after `delay`. A callback returning `Keep` is
    /// rescheduled with the same delay.
    fn schedule_timer(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Cancel a timer or deferred task. Unknown or already fired ids are ignored.
    fn cancel_timer(&self, id: TimerId);

    /// Run `task` once the current callback batch has finished.
    fn defer(&self, task: DeferredTask) -> TimerId;
}
