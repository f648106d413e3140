//! Wiring: one device, one socket manager, one event loop.
//!
//! ```text
//!   device fd readable ──▶ read frames ──▶ SocketManager::dispatch
//!                                               │
//!                          app hook ◀── events ─┤
//!                                               ▼
//!   device fd writable ◀── unsent ◀──── outbound frames
//!                                               │
//!   loop timer (earliest TIME_WAIT) ──▶ SocketManager::poll_timers
//! ```
//!
//! Everything runs on the loop's thread.  The device and the manager are
//! shared between handlers through `Rc<RefCell<_>>`; a handler never holds
//! a borrow across a call back into the loop.
//!
//! The application is a callback receiving `(&mut SocketManager,
//! SocketEvent)`.  It runs inside the dispatch path, so it must use the
//! non-waiting calls (`try_accept`, `read`, `try_recvfrom`) or keep a
//! [`crate::socket::Pending`] and poll it on a later event.

use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::{DeviceMode, StackConfig};
use crate::device::Device;
use crate::event_loop::{EventLoop, Interest, LoopError, LoopState, StopHandle};
use crate::socket::SocketEvent;
use crate::socket_manager::{Disposition, SocketManager};
use crate::timer::TimerId;

/// Frames read per readable callback before yielding to other descriptors.
const READ_BUDGET: usize = 64;

/// Application callback.
pub type AppHook = Box<dyn FnMut(&mut SocketManager, SocketEvent)>;

struct Core<D> {
    device: RefCell<D>,
    sockets: RefCell<SocketManager>,
    app: RefCell<Option<AppHook>>,
    /// Frames the device refused with `WouldBlock`, oldest first.
    unsent: RefCell<VecDeque<Vec<u8>>>,
    armed: Cell<Option<(Instant, TimerId)>>,
    mtu: usize,
}

/// A runnable user-space TCP/IP stack.
pub struct Stack<D: Device + 'static> {
    core: Rc<Core<D>>,
    event_loop: EventLoop,
    installed: bool,
}

impl<D: Device + 'static> Stack<D> {
    /// Build a stack over `device`.  TAP devices are rejected: there is no
    /// Ethernet or ARP layer.
    pub fn new(device: D, config: StackConfig) -> io::Result<Self> {
        if device.mode() == DeviceMode::Tap {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TAP devices carry Ethernet frames; the stack needs a TUN device",
            ));
        }
        log::info!(
            "[dev] stack on {} as {} (mss {}, window {})",
            device.name(),
            config.local_addr,
            config.mss,
            config.window
        );
        let mtu = config.mtu;
        Ok(Self {
            core: Rc::new(Core {
                device: RefCell::new(device),
                sockets: RefCell::new(SocketManager::new(config)),
                app: RefCell::new(None),
                unsent: RefCell::new(VecDeque::new()),
                armed: Cell::new(None),
                mtu,
            }),
            event_loop: EventLoop::new()?,
            installed: false,
        })
    }

    /// Borrow the socket manager.  Must not be held while the loop runs.
    pub fn sockets(&self) -> RefMut<'_, SocketManager> {
        self.core.sockets.borrow_mut()
    }

    /// Install the application callback, replacing any previous one.
    pub fn set_app<F>(&mut self, app: F)
    where
        F: FnMut(&mut SocketManager, SocketEvent) + 'static,
    {
        *self.core.app.borrow_mut() = Some(Box::new(app));
    }

    pub fn loop_state(&self) -> LoopState {
        self.event_loop.state()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    /// Run until stopped or until the device fails.
    pub fn run(&mut self) -> Result<(), LoopError> {
        self.prepare();
        self.event_loop.run()
    }

    /// Run one loop iteration, waiting at most `max_wait`.
    pub fn run_once(&mut self, max_wait: Duration) -> Result<usize, LoopError> {
        self.prepare();
        self.event_loop.run_once(Some(max_wait))
    }

    /// Register the device handlers and flush anything the application
    /// queued outside the loop.
    fn prepare(&mut self) {
        if !self.installed {
            self.installed = true;
            let fd = self.core.device.borrow().raw_fd();
            let core = Rc::clone(&self.core);
            self.event_loop
                .add_handler(fd, Interest::Readable, move |ev, _| on_readable(&core, ev));
            let core = Rc::clone(&self.core);
            self.event_loop
                .add_handler(fd, Interest::Error, move |ev, _| on_device_error(&core, ev));
            self.event_loop.listen();
        }
        pump(&self.core, &mut self.event_loop);
    }
}

fn on_readable<D: Device + 'static>(core: &Rc<Core<D>>, ev: &mut EventLoop) {
    let mut buf = vec![0u8; core.mtu.max(crate::packet::IPV4_HEADER_LEN)];
    for _ in 0..READ_BUDGET {
        let n = match core.device.borrow_mut().read_frame(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                ev.fail(e);
                return;
            }
        };
        if let Disposition::Dropped(reason) = core.sockets.borrow_mut().dispatch(&buf[..n]) {
            log::debug!("[dev] frame of {n} bytes dropped: {reason:?}");
        }
        // Reply before reading on, so the peer sees responses in order.
        pump(core, ev);
    }
}

fn on_writable<D: Device + 'static>(core: &Rc<Core<D>>, ev: &mut EventLoop) {
    let fd = core.device.borrow().raw_fd();
    if let Err(e) = flush(core) {
        ev.fail(e);
        return;
    }
    if core.unsent.borrow().is_empty() {
        ev.remove_handler(fd, Interest::Writable);
    }
}

fn on_device_error<D: Device + 'static>(core: &Rc<Core<D>>, ev: &mut EventLoop) {
    let name = core.device.borrow().name().to_string();
    ev.fail(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("device {name} reported an error condition"),
    ));
}

fn on_timer<D: Device + 'static>(core: &Rc<Core<D>>, ev: &mut EventLoop) {
    core.armed.set(None);
    let released = core.sockets.borrow_mut().poll_timers(Instant::now());
    if released > 0 {
        log::debug!("[loop] released {released} connection(s) from TIME_WAIT");
    }
    pump(core, ev);
}

/// Deliver events to the application, push outbound frames to the device,
/// and re-arm the linger timer.
fn pump<D: Device + 'static>(core: &Rc<Core<D>>, ev: &mut EventLoop) {
    deliver_events(core, ev);

    {
        let mut sockets = core.sockets.borrow_mut();
        let mut unsent = core.unsent.borrow_mut();
        unsent.extend(sockets.drain_outbound());
    }
    if let Err(e) = flush(core) {
        ev.fail(e);
        return;
    }
    if !core.unsent.borrow().is_empty() {
        // Writable interest is only multiplexed while running.
        ev.enter_running();
        let fd = core.device.borrow().raw_fd();
        if !ev.is_registered(fd, Interest::Writable) {
            let c = Rc::clone(core);
            ev.add_handler(fd, Interest::Writable, move |ev, _| on_writable(&c, ev));
        }
    }

    arm_timer(core, ev);
}

fn deliver_events<D: Device + 'static>(core: &Rc<Core<D>>, ev: &mut EventLoop) {
    let mut app = core.app.borrow_mut();
    let mut sockets = core.sockets.borrow_mut();
    loop {
        let events = sockets.take_events();
        if events.is_empty() {
            break;
        }
        for event in events {
            if matches!(event, SocketEvent::Acceptable(_) | SocketEvent::Connected(_)) {
                ev.enter_running();
            }
            match app.as_mut() {
                Some(app) => app(&mut sockets, event),
                None => log::debug!("[loop] no application for {event:?}"),
            }
        }
    }
}

/// Write queued frames until the device pushes back.
fn flush<D: Device + 'static>(core: &Rc<Core<D>>) -> io::Result<()> {
    let mut device = core.device.borrow_mut();
    let mut unsent = core.unsent.borrow_mut();
    while let Some(frame) = unsent.front() {
        match device.write_frame(frame) {
            Ok(_) => {
                unsent.pop_front();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn arm_timer<D: Device + 'static>(core: &Rc<Core<D>>, ev: &mut EventLoop) {
    let next = core.sockets.borrow_mut().next_deadline();
    let armed = core.armed.get();
    if next.is_some() && armed.map(|(at, _)| at) == next {
        return;
    }
    if let Some((_, id)) = armed {
        ev.cancel_timer(id);
        core.armed.set(None);
    }
    if let Some(deadline) = next {
        let c = Rc::clone(core);
        let id = ev.add_timer_at(deadline, move |ev| on_timer(&c, ev));
        core.armed.set(Some((deadline, id)));
    }
}
