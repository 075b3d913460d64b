// src/io/poll_loop.rs
//
// Single-threaded event loop on the `polling` crate (epoll/kqueue), with
// descriptors registered in level-triggered mode so a callback that reads
// only part of what is pending is woken again on the next iteration.
//
// One iteration:
//   1. run the deferred tasks queued before the iteration started
//   2. wait on registered descriptors until the nearest timer is due
//   3. dispatch readiness callbacks
//   4. fire due timers
//
// Callbacks are taken out of the tables while they run, so they may call
// back into the loop (register, deregister, cancel, defer) without conflict.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use polling::{Event, Events, PollMode, Poller};

use super::event_loop::{
    DeferredTask, Directive, EventLoop, FdCallback, Interest, TimerCallback, TimerId,
};

// ============================================================================
// Types
// ============================================================================

struct FdEntry {
    id: u64,
    fd: RawFd,
    interest: Interest,
    /// `None` while the callback is running
    callback: Option<FdCallback>,
}

struct TimerEntry {
    deadline: Instant,
    period: Duration,
    /// `None` while the callback is running
    callback: Option<TimerCallback>,
}

#[derive(Default)]
struct LoopState {
    next_id: u64,
    fds: Vec<FdEntry>,
    /// Descriptors currently added to the poller
    sources: HashSet<RawFd>,
    timers: HashMap<u64, TimerEntry>,
    deferred: VecDeque<(u64, DeferredTask)>,
}

impl LoopState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        self.timers
            .values()
            .filter(|t| t.callback.is_some())
            .map(|t| t.deadline)
            .min()
    }

    fn wants(&self, fd: RawFd, interest: Interest) -> bool {
        self.fds
            .iter()
            .any(|e| e.fd == fd && e.interest == interest)
    }
}

/// Readiness-driven implementation of [`EventLoop`].
pub struct PollLoop {
    poller: Poller,
    events: RefCell<Events>,
    state: RefCell<LoopState>,
    exit: Cell<bool>,
}

impl PollLoop {
    pub fn new() -> io::Result<Self> {
        Ok(PollLoop {
            poller: Poller::new()?,
            events: RefCell::new(Events::new()),
            state: RefCell::new(LoopState::default()),
            exit: Cell::new(false),
        })
    }

    /// Make `run` return after the current iteration.
    pub fn request_exit(&self) {
        self.exit.set(true);
    }

    /// Number of (descriptor, interest) registrations.
    pub fn registered_fd_count(&self) -> usize {
        self.state.borrow().fds.len()
    }

    /// Number of scheduled timers plus queued deferred tasks.
    pub fn pending_timer_count(&self) -> usize {
        let state = self.state.borrow();
        state.timers.len() + state.deferred.len()
    }

    /// Whether nothing is registered, scheduled or deferred.
    pub fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.fds.is_empty() && state.timers.is_empty() && state.deferred.is_empty()
    }

    /// Run until `request_exit` is called or the loop has nothing left to do.
    pub fn run(&self) {
        loop {
            if self.exit.replace(false) || self.is_idle() {
                break;
            }
            self.run_once(None);
        }
    }

    /// Run for at most `duration`, returning early on `request_exit`.
    pub fn run_for(&self, duration: Duration) {
        self.run_until(duration, || false);
    }

    /// Run until `done` returns true, `request_exit` is called, or `timeout`
    /// elapses. Returns the final value of `done`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.exit.replace(false) {
                return done();
            }
            self.run_once(Some(deadline - now));
        }
    }

    /// One loop iteration, waiting at most `max_wait` (forever when `None`
    /// and nothing is scheduled). Returns the number of callbacks run.
    pub fn run_once(&self, max_wait: Option<Duration>) -> usize {
        let mut ran = self.run_deferred();

        let timeout = {
            let state = self.state.borrow();
            if ran > 0 || !state.deferred.is_empty() {
                Some(Duration::ZERO)
            } else {
                let until_timer = state
                    .nearest_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()));
                match (until_timer, max_wait) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
        };

        for (fd, interest) in self.wait_ready(timeout) {
            if self.dispatch_fd(fd, interest) {
                ran += 1;
            }
        }

        ran + self.fire_timers()
    }

    // ------------------------------------------------------------------------
    // Poller registration
    // ------------------------------------------------------------------------

    /// Bring the poller's interest for `fd` in line with the callback table.
    fn sync_source(&self, fd: RawFd) {
        let mut state = self.state.borrow_mut();
        let readable = state.wants(fd, Interest::Read);
        let writable = state.wants(fd, Interest::Write);
        let event = Event::new(fd as usize, readable, writable);
        // Descriptors are always deregistered before their owner closes them
        let source = unsafe { BorrowedFd::borrow_raw(fd) };

        let result = if !readable && !writable {
            if state.sources.remove(&fd) {
                self.poller.delete(source)
            } else {
                Ok(())
            }
        } else if state.sources.contains(&fd) {
            self.poller.modify_with_mode(source, event, PollMode::Level)
        } else {
            let added = unsafe { self.poller.add_with_mode(fd, event, PollMode::Level) };
            if added.is_ok() {
                state.sources.insert(fd);
            }
            added
        };

        if let Err(e) = result {
            tlog!("[poll_loop] Unable to update interest for descriptor {}: {}", fd, e);
        }
    }

    // ------------------------------------------------------------------------
    // Iteration steps
    // ------------------------------------------------------------------------

    fn run_deferred(&self) -> usize {
        // Tasks deferred while this batch runs wait for the next iteration
        let boundary = self.state.borrow().next_id;
        let mut ran = 0;
        loop {
            let task = {
                let mut state = self.state.borrow_mut();
                match state.deferred.front() {
                    Some((id, _)) if *id <= boundary => state.deferred.pop_front(),
                    _ => None,
                }
            };
            match task {
                Some((_, task)) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> Vec<(RawFd, Interest)> {
        let mut events = self.events.borrow_mut();
        events.clear();

        if let Err(e) = self.poller.wait(&mut events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                tlog!("[poll_loop] wait failed: {}", e);
            }
            return Vec::new();
        }

        // Hangup and error conditions are reported as readable/writable
        let state = self.state.borrow();
        let mut ready = Vec::new();
        for event in events.iter() {
            let fd = event.key as RawFd;
            if event.readable && state.wants(fd, Interest::Read) {
                ready.push((fd, Interest::Read));
            }
            if event.writable && state.wants(fd, Interest::Write) {
                ready.push((fd, Interest::Write));
            }
        }
        ready
    }

    fn dispatch_fd(&self, fd: RawFd, interest: Interest) -> bool {
        let taken = {
            let mut state = self.state.borrow_mut();
            state
                .fds
                .iter_mut()
                .find(|e| e.fd == fd && e.interest == interest)
                .and_then(|e| e.callback.take().map(|cb| (e.id, cb)))
        };
        // Deregistered by an earlier callback in this batch
        let Some((id, mut callback)) = taken else {
            return false;
        };

        let directive = callback(fd, interest);

        let removed = {
            let mut state = self.state.borrow_mut();
            match state.fds.iter().position(|e| e.id == id) {
                Some(pos) if directive == Directive::Remove => {
                    state.fds.remove(pos);
                    true
                }
                Some(pos) => {
                    state.fds[pos].callback = Some(callback);
                    false
                }
                None => false,
            }
        };
        if removed {
            self.sync_source(fd);
        }
        true
    }

    fn fire_timers(&self) -> usize {
        let now = Instant::now();
        let mut due: Vec<(Instant, u64)> = self
            .state
            .borrow()
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now && t.callback.is_some())
            .map(|(id, t)| (t.deadline, *id))
            .collect();
        due.sort();

        let mut ran = 0;
        for (_, id) in due {
            // May have been cancelled by an earlier timer in this batch
            let Some(mut callback) = self
                .state
                .borrow_mut()
                .timers
                .get_mut(&id)
                .and_then(|t| t.callback.take())
            else {
                continue;
            };

            let directive = callback();
            ran += 1;

            let mut state = self.state.borrow_mut();
            if directive == Directive::Keep {
                if let Some(timer) = state.timers.get_mut(&id) {
                    timer.deadline = Instant::now() + timer.period;
                    timer.callback = Some(callback);
                }
            } else {
                state.timers.remove(&id);
            }
        }
        ran
    }
}

impl EventLoop for PollLoop {
    fn register_fd(&self, fd: RawFd, interest: Interest, callback: FdCallback) {
        let replaced = {
            let mut state = self.state.borrow_mut();
            let id = state.alloc_id();
            let replaced = state
                .fds
                .iter()
                .position(|e| e.fd == fd && e.interest == interest)
                .map(|pos| state.fds.remove(pos));
            state.fds.push(FdEntry {
                id,
                fd,
                interest,
                callback: Some(callback),
            });
            replaced
        };
        drop(replaced);
        self.sync_source(fd);
    }

    fn deregister_fd(&self, fd: RawFd, interest: Interest) {
        let removed = {
            let mut state = self.state.borrow_mut();
            state
                .fds
                .iter()
                .position(|e| e.fd == fd && e.interest == interest)
                .map(|pos| state.fds.remove(pos))
        };
        if removed.is_some() {
            self.sync_source(fd);
        }
    }

    fn schedule_timer(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.alloc_id();
        state.timers.insert(
            id,
            TimerEntry {
                deadline: Instant::now() + delay,
                period: delay,
                callback: Some(callback),
            },
        );
        TimerId(id)
    }

    fn cancel_timer(&self, id: TimerId) {
        let removed = {
            let mut state = self.state.borrow_mut();
            let timer = state.timers.remove(&id.0);
            let task = state
                .deferred
                .iter()
                .position(|(i, _)| *i == id.0)
                .and_then(|pos| state.deferred.remove(pos));
            (timer, task)
        };
        drop(removed);
    }

    fn defer(&self, task: DeferredTask) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.alloc_id();
        state.deferred.push_back((id, task));
        TimerId(id)
    }
}
