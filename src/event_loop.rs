//! Single-threaded readiness dispatcher.
//!
//! The loop multiplexes file descriptors with `poll(2)` and calls the
//! handlers registered for them.  It is the only place the stack blocks.
//!
//! ```text
//!   INIT ──listen()──▶ LISTENING ──enter_running()──▶ RUNNING
//!     │                    │                            │
//!     └────────────────────┴──────── stop() ────────────┴──▶ STOPPED
//! ```
//!
//! - LISTENING multiplexes readable interest only (accepting).
//! - RUNNING multiplexes readable, writable, and error interest.
//! - STOPPED is terminal: every handler and timer is dropped.
//!
//! # One iteration
//! 1. Snapshot `(fd, generation, interest)` for every registration.
//! 2. `poll(2)` until a descriptor is ready, a timer is due, or the stop
//!    pipe is written.  Without timers the wait has no timeout.
//! 3. For each ready descriptor, in fd order, call its handlers in the order
//!    readable → writable → error, each at most once.
//! 4. Fire the timers that are due, one at a time; a timer cancelled by an
//!    earlier callback does not fire.
//!
//! # Registration semantics
//! - [`EventLoop::add_handler`] for an `(fd, interest)` pair that already has
//!   a handler **replaces** it silently.  Wiring the same descriptor twice
//!   never produces two calls.
//! - Handlers added or replaced during an iteration are first considered in
//!   the next iteration's snapshot.
//! - Removal is observed immediately: once [`EventLoop::remove_fd`] or
//!   [`EventLoop::remove_handler`] returns, the removed handler is never
//!   called again, even if its descriptor is already marked ready in the
//!   current iteration.
//!
//! A descriptor that `poll(2)` reports as invalid (`POLLNVAL`) is dropped
//! from the table with a warning.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::timer::{TimerId, TimerQueue};

/// Callback invoked with the loop and the ready descriptor.
pub type Handler = Box<dyn FnMut(&mut EventLoop, RawFd)>;

/// One-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce(&mut EventLoop)>;

/// Lifecycle state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Listening,
    Running,
    Stopped,
}

/// The readiness a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
    Error,
}

impl Interest {
    fn index(self) -> usize {
        match self {
            Interest::Readable => 0,
            Interest::Writable => 1,
            Interest::Error => 2,
        }
    }
}

/// Errors that end [`EventLoop::run`].
#[derive(Debug, Error)]
pub enum LoopError {
    /// Reading or writing the network device failed.
    #[error("device I/O failed: {0}")]
    Device(#[source] io::Error),
    /// `poll(2)` itself failed.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("event loop is stopped")]
    Stopped,
}

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

enum Slot {
    Empty,
    Ready(u64, Handler),
    /// Handler taken out while it runs; the token detects replacement.
    Running(u64),
}

impl Slot {
    fn is_set(&self) -> bool {
        !matches!(self, Slot::Empty)
    }

    fn token(&self) -> Option<u64> {
        match self {
            Slot::Empty => None,
            Slot::Ready(token, _) | Slot::Running(token) => Some(*token),
        }
    }
}

struct Registration {
    generation: u64,
    slots: [Slot; 3],
}

impl Registration {
    fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| !s.is_set())
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    fd: RawFd,
    generation: u64,
    /// Slot tokens seen at snapshot time, by [`Interest::index`].
    tokens: [Option<u64>; 3],
    readable: bool,
    writable: bool,
    error: bool,
}

impl Snapshot {
    fn events(&self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Cloneable, `Send` handle that stops the loop from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<UnixStream>,
}

impl StopHandle {
    pub fn stop(&self) -> io::Result<()> {
        match (&*self.tx).write(&[1]) {
            Ok(_) => Ok(()),
            // A full pipe already holds a pending stop request.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

pub struct EventLoop {
    state: LoopState,
    handlers: HashMap<RawFd, Registration>,
    timers: TimerQueue<TimerCallback>,
    next_token: u64,
    stop_rx: UnixStream,
    stop_tx: Arc<UnixStream>,
    fatal: Option<io::Error>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("state", &self.state)
            .field("descriptors", &self.handlers.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let (stop_rx, stop_tx) = UnixStream::pair()?;
        stop_rx.set_nonblocking(true)?;
        stop_tx.set_nonblocking(true)?;
        Ok(Self {
            state: LoopState::Init,
            handlers: HashMap::new(),
            timers: TimerQueue::new(),
            next_token: 1,
            stop_rx,
            stop_tx: Arc::new(stop_tx),
            fatal: None,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// INIT → LISTENING: only readable interest is multiplexed until
    /// [`EventLoop::enter_running`] is called.
    pub fn listen(&mut self) {
        if self.state == LoopState::Init {
            self.transition(LoopState::Listening);
        }
    }

    /// LISTENING (or INIT) → RUNNING: full multiplexing.  Called by the
    /// accept path once the first connection exists.
    pub fn enter_running(&mut self) {
        if matches!(self.state, LoopState::Init | LoopState::Listening) {
            self.transition(LoopState::Running);
        }
    }

    /// Enter STOPPED and drop every handler and timer.  Idempotent.
    pub fn stop(&mut self) {
        if self.state == LoopState::Stopped {
            return;
        }
        self.transition(LoopState::Stopped);
        self.handlers.clear();
        self.timers.clear();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Report a device failure from inside a handler.  The current
    /// iteration ends, the loop stops, and [`EventLoop::run`] returns
    /// [`LoopError::Device`].
    pub fn fail(&mut self, err: io::Error) {
        log::error!("[loop] device failure: {err}");
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register `handler` for `interest` on `fd`, replacing any existing
    /// handler for the same pair.
    pub fn add_handler<F>(&mut self, fd: RawFd, interest: Interest, handler: F)
    where
        F: FnMut(&mut EventLoop, RawFd) + 'static,
    {
        if self.state == LoopState::Stopped {
            log::debug!("[loop] ignoring registration for fd {fd} after stop");
            return;
        }
        let token = self.token();
        let reg = self.handlers.entry(fd).or_insert_with(|| Registration {
            generation: token,
            slots: [Slot::Empty, Slot::Empty, Slot::Empty],
        });
        let slot = &mut reg.slots[interest.index()];
        if slot.is_set() {
            log::debug!("[loop] replacing {interest:?} handler for fd {fd}");
        }
        *slot = Slot::Ready(token, Box::new(handler));
    }

    /// Remove the handler for one `(fd, interest)` pair.  Returns `false` if
    /// none was registered.
    pub fn remove_handler(&mut self, fd: RawFd, interest: Interest) -> bool {
        let Some(reg) = self.handlers.get_mut(&fd) else {
            return false;
        };
        let slot = &mut reg.slots[interest.index()];
        let was_set = slot.is_set();
        *slot = Slot::Empty;
        if reg.is_empty() {
            self.handlers.remove(&fd);
        }
        was_set
    }

    /// Remove every handler for `fd` at once.
    pub fn remove_fd(&mut self, fd: RawFd) -> bool {
        self.handlers.remove(&fd).is_some()
    }

    pub fn is_registered(&self, fd: RawFd, interest: Interest) -> bool {
        self.handlers
            .get(&fd)
            .is_some_and(|reg| reg.slots[interest.index()].is_set())
    }

    /// Registered descriptors.
    pub fn descriptor_count(&self) -> usize {
        self.handlers.len()
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    pub fn add_timer<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.add_timer_at(Instant::now() + delay, callback)
    }

    pub fn add_timer_at<F>(&mut self, deadline: Instant, callback: F) -> TimerId
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.timers.schedule(deadline, Box::new(callback))
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Run iterations until the loop is stopped.
    ///
    /// Returns `Ok(())` after an explicit stop, [`LoopError::Device`] if a
    /// handler reported a device failure, and [`LoopError::Stopped`] if the
    /// loop was already stopped.  Bad network input never ends the loop.
    pub fn run(&mut self) -> Result<(), LoopError> {
        if self.state == LoopState::Stopped {
            return Err(LoopError::Stopped);
        }
        if self.state == LoopState::Init {
            self.enter_running();
        }
        log::info!("[loop] running with {} descriptor(s)", self.handlers.len());
        while self.state != LoopState::Stopped {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Run a single iteration, waiting at most `max_wait` (in addition to the
    /// timer deadline).  Returns the number of callbacks invoked.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<usize, LoopError> {
        if self.state == LoopState::Stopped {
            return Err(LoopError::Stopped);
        }

        let snapshot = self.snapshot();
        let mut pollfds: Vec<libc::pollfd> = snapshot
            .iter()
            .map(|s| libc::pollfd {
                fd: s.fd,
                events: s.events(),
                revents: 0,
            })
            .collect();
        pollfds.push(libc::pollfd {
            fd: self.stop_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        let timeout = self.poll_timeout(max_wait);
        poll(&mut pollfds, timeout)?;

        let stop_requested = pollfds
            .last()
            .is_some_and(|p| p.revents & libc::POLLIN != 0);
        if stop_requested {
            self.drain_stop_pipe();
            log::info!("[loop] stop requested");
            self.stop();
            return Ok(0);
        }

        let mut invoked = 0;
        for (entry, pfd) in snapshot.iter().zip(&pollfds) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            if revents & libc::POLLNVAL != 0 {
                log::warn!("[loop] fd {} is not a valid descriptor; dropping it", entry.fd);
                self.remove_generation(entry.fd, entry.generation);
                continue;
            }
            if entry.readable && revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                invoked += self.invoke(entry, Interest::Readable);
            }
            if entry.writable && revents & libc::POLLOUT != 0 {
                invoked += self.invoke(entry, Interest::Writable);
            }
            if entry.error && revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                invoked += self.invoke(entry, Interest::Error);
            }
            self.check_fatal()?;
            if self.state == LoopState::Stopped {
                return Ok(invoked);
            }
        }

        // Timers scheduled by these callbacks wait for the next iteration.
        let now = Instant::now();
        let bound = self.timers.next_id();
        while let Some(callback) = self.timers.pop_due(now, bound) {
            callback(self);
            invoked += 1;
            self.check_fatal()?;
            if self.state == LoopState::Stopped {
                break;
            }
        }
        Ok(invoked)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn snapshot(&self) -> Vec<Snapshot> {
        let listening = self.state == LoopState::Listening;
        let mut snapshot: Vec<Snapshot> = self
            .handlers
            .iter()
            .filter(|(fd, _)| **fd >= 0)
            .map(|(fd, reg)| Snapshot {
                fd: *fd,
                generation: reg.generation,
                tokens: [
                    reg.slots[0].token(),
                    reg.slots[1].token(),
                    reg.slots[2].token(),
                ],
                readable: reg.slots[Interest::Readable.index()].is_set(),
                writable: !listening && reg.slots[Interest::Writable.index()].is_set(),
                error: !listening && reg.slots[Interest::Error.index()].is_set(),
            })
            .filter(|s| s.readable || s.writable || s.error)
            .collect();
        snapshot.sort_by_key(|s| s.fd);
        snapshot
    }

    /// Call one handler if both its registration and its slot are still the
    /// ones snapshotted.  A replacement made earlier in the iteration waits
    /// for the next snapshot.
    fn invoke(&mut self, entry: &Snapshot, interest: Interest) -> usize {
        let idx = interest.index();
        let (token, mut handler) = {
            let Some(reg) = self.handlers.get_mut(&entry.fd) else {
                return 0;
            };
            if reg.generation != entry.generation {
                return 0;
            }
            match std::mem::replace(&mut reg.slots[idx], Slot::Empty) {
                Slot::Ready(token, handler) if Some(token) == entry.tokens[idx] => {
                    reg.slots[idx] = Slot::Running(token);
                    (token, handler)
                }
                other => {
                    reg.slots[idx] = other;
                    return 0;
                }
            }
        };

        handler(self, entry.fd);

        // Put the handler back unless it was removed or replaced meanwhile.
        if let Some(reg) = self.handlers.get_mut(&entry.fd) {
            let slot = &mut reg.slots[idx];
            if reg.generation == entry.generation && matches!(slot, Slot::Running(t) if *t == token)
            {
                *slot = Slot::Ready(token, handler);
            }
        }
        1
    }

    fn remove_generation(&mut self, fd: RawFd, generation: u64) {
        if self
            .handlers
            .get(&fd)
            .is_some_and(|reg| reg.generation == generation)
        {
            self.handlers.remove(&fd);
        }
    }

    fn poll_timeout(&mut self, max_wait: Option<Duration>) -> libc::c_int {
        let timer_wait = self.timers.timeout(Instant::now());
        let wait = match (timer_wait, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match wait {
            None => -1,
            // Round up so a sub-millisecond deadline does not spin.
            Some(d) => {
                let ms = d.as_micros().div_ceil(1000);
                libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
            }
        }
    }

    fn drain_stop_pipe(&mut self) {
        let mut buf = [0u8; 64];
        while matches!(self.stop_rx.read(&mut buf), Ok(n) if n > 0) {}
    }

    fn check_fatal(&mut self) -> Result<(), LoopError> {
        match self.fatal.take() {
            Some(err) => {
                self.stop();
                Err(LoopError::Device(err))
            }
            None => Ok(()),
        }
    }

    fn token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn transition(&mut self, next: LoopState) {
        log::debug!("[loop] {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// `poll(2)` with EINTR retried.
fn poll(fds: &mut [libc::pollfd], timeout: libc::c_int) -> Result<usize, LoopError> {
    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(LoopError::Poll(err));
        }
    }
}
