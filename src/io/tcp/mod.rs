// src/io/tcp/mod.rs
//
// TCP client backend with automatic reconnect.
//
//   Disconnected --timer--> Connecting --writable, SO_ERROR 0--> Connected
//        ^                      |                                  |
//        |<----- failure -------+        read/write failure, EOF   v
//        |<------------- deferred close task ---------------- Closing
//
// Every failure schedules a reconnect after the retry interval. The host is
// resolved once when the handle is created and never again.

mod socket;
mod write_queue;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use socket2::Socket;

use super::{
    BackendKind, Callbacks, ConnectionState, Directive, EventLoop, Interest, IoError,
    StreamFramer, TimerId, Transport, TCP_SCHEME,
};
use crate::settings::TransportSettings;
use socket::{parse_host_port, ConnectProgress};
use write_queue::WriteQueue;

// ============================================================================
// Backend State
// ============================================================================

struct TcpState {
    socket: Option<Socket>,
    fd: RawFd,
    conn: ConnectionState,
    framer: StreamFramer,
    queue: WriteQueue,
    read_reg: bool,
    write_reg: bool,
    connect_timer: Option<TimerId>,
    close_task: Option<TimerId>,
    /// Deferred `on_connect(true)` not yet delivered
    notify_task: Option<TimerId>,
    /// Set by cleanup/drop; no more reconnects
    shut_down: bool,
}

struct TcpShared {
    endpoint: String,
    addr: SocketAddr,
    settings: TransportSettings,
    event_loop: Rc<dyn EventLoop>,
    state: RefCell<TcpState>,
    callbacks: Callbacks,
}

/// TCP client transport
pub struct TcpTransport {
    shared: Rc<TcpShared>,
}

/// Read/write conditions retried on the next readiness event. Unlike the
/// serial device, a timed out socket (keepalive expiry) is fatal.
fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl TcpTransport {
    /// `endpoint` is the full `tcp://host:port` string.
    pub(crate) fn open(
        endpoint: &str,
        event_loop: Rc<dyn EventLoop>,
        callbacks: Callbacks,
        eol_marker: Option<&[u8]>,
        settings: &TransportSettings,
    ) -> Result<Self, IoError> {
        let target = endpoint.get(TCP_SCHEME.len()..).unwrap_or_default();
        let (host, port) =
            parse_host_port(target).map_err(|reason| IoError::unavailable(endpoint, reason))?;
        let addr =
            socket::resolve(host, port).map_err(|reason| IoError::unavailable(endpoint, reason))?;

        tlog!("[tcp] {} resolved to {}", endpoint, addr);

        let shared = Rc::new(TcpShared {
            endpoint: endpoint.to_string(),
            addr,
            settings: settings.clone(),
            event_loop,
            state: RefCell::new(TcpState {
                socket: None,
                fd: -1,
                conn: ConnectionState::Disconnected,
                framer: StreamFramer::new(settings.read_buffer_size, eol_marker),
                queue: WriteQueue::new(),
                read_reg: false,
                write_reg: false,
                connect_timer: None,
                close_task: None,
                notify_task: None,
                shut_down: false,
            }),
            callbacks,
        });

        shared.schedule_connect(settings.initial_connect_delay());
        Ok(TcpTransport { shared })
    }
}

// ============================================================================
// Connection State Machine
// ============================================================================

impl TcpShared {
    fn schedule_connect(self: &Rc<Self>, delay: Duration) {
        let mut st = self.state.borrow_mut();
        if st.shut_down || st.connect_timer.is_some() {
            return;
        }

        let weak = Rc::downgrade(self);
        let id = self.event_loop.schedule_timer(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.state.borrow_mut().connect_timer = None;
                    shared.initiate_connection();
                }
                Directive::Remove
            }),
        );
        st.connect_timer = Some(id);
    }

    fn initiate_connection(self: &Rc<Self>) {
        match socket::start_connect(&self.addr, &self.settings) {
            Ok((socket, ConnectProgress::Established)) => {
                {
                    let mut st = self.state.borrow_mut();
                    st.fd = socket.as_raw_fd();
                    st.socket = Some(socket);
                }
                self.established();
            }
            Ok((socket, ConnectProgress::InProgress)) => {
                let fd = socket.as_raw_fd();
                {
                    let mut st = self.state.borrow_mut();
                    st.fd = fd;
                    st.socket = Some(socket);
                    st.conn = ConnectionState::Connecting;
                    st.write_reg = true;
                }
                self.register(fd, Interest::Write, TcpShared::on_writable);
            }
            Err(e) => {
                tlog!("[tcp] Connect to {} failed: {}", self.endpoint, e);
                self.connect_failed();
            }
        }
    }

    /// Give up on the current attempt and retry after the backoff.
    fn connect_failed(self: &Rc<Self>) {
        {
            let mut st = self.state.borrow_mut();
            if st.write_reg {
                self.event_loop.deregister_fd(st.fd, Interest::Write);
                st.write_reg = false;
            }
            st.socket = None;
            st.fd = -1;
            st.conn = ConnectionState::Disconnected;
        }
        self.schedule_connect(self.settings.retry_interval());
        self.callbacks.notify(false);
    }

    fn established(self: &Rc<Self>) {
        tlog!("[tcp] Connected to {}", self.endpoint);

        let fd = {
            let mut st = self.state.borrow_mut();
            st.conn = ConnectionState::Connected;
            st.read_reg = true;
            st.fd
        };
        self.register(fd, Interest::Read, TcpShared::on_readable);

        let weak = Rc::downgrade(self);
        let id = self.event_loop.defer(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.state.borrow_mut().notify_task = None;
                shared.callbacks.notify(true);
            }
        }));
        self.state.borrow_mut().notify_task = Some(id);
    }

    /// Stop reading and close on the next loop iteration.
    fn begin_close(self: &Rc<Self>) {
        let mut st = self.state.borrow_mut();
        if st.close_task.is_some() || st.socket.is_none() {
            return;
        }
        st.conn = ConnectionState::Closing;
        if st.read_reg {
            self.event_loop.deregister_fd(st.fd, Interest::Read);
            st.read_reg = false;
        }

        let weak = Rc::downgrade(self);
        let id = self.event_loop.defer(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.run_close();
            }
        }));
        st.close_task = Some(id);
    }

    fn run_close(self: &Rc<Self>) {
        {
            let mut st = self.state.borrow_mut();
            st.close_task = None;
            if st.read_reg {
                self.event_loop.deregister_fd(st.fd, Interest::Read);
                st.read_reg = false;
            }
            if st.write_reg {
                self.event_loop.deregister_fd(st.fd, Interest::Write);
                st.write_reg = false;
            }
            if let Some(id) = st.connect_timer.take() {
                self.event_loop.cancel_timer(id);
            }
            st.socket = None;
            st.fd = -1;
            st.framer.discard();
            let dropped = st.queue.clear();
            st.conn = ConnectionState::Disconnected;

            tlog!(
                "[tcp] Closed {} ({} queued bytes dropped), retrying in {:?}",
                self.endpoint,
                dropped,
                self.settings.retry_interval()
            );
        }
        self.schedule_connect(self.settings.retry_interval());
        self.callbacks.notify(false);
    }

    fn register(self: &Rc<Self>, fd: RawFd, interest: Interest, f: fn(&Rc<TcpShared>) -> Directive) {
        let weak: Weak<TcpShared> = Rc::downgrade(self);
        self.event_loop.register_fd(
            fd,
            interest,
            Box::new(move |_, _| match weak.upgrade() {
                Some(shared) => f(&shared),
                None => Directive::Remove,
            }),
        );
    }

    // ------------------------------------------------------------------------
    // Readiness callbacks
    // ------------------------------------------------------------------------

    fn on_readable(self: &Rc<Self>) -> Directive {
        let has_reader = self.callbacks.has_reader();

        let messages = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            let Some(socket) = st.socket.as_mut() else {
                st.read_reg = false;
                return Directive::Remove;
            };

            match socket.read(st.framer.spare_mut()) {
                Ok(0) => {
                    tlog!("[tcp] {} closed by peer", self.endpoint);
                    st.read_reg = false;
                    None
                }
                Ok(n) if has_reader => Some(st.framer.commit(n)),
                Ok(_) => {
                    st.framer.discard();
                    return Directive::Keep;
                }
                Err(e) if would_block(&e) => return Directive::Keep,
                Err(e) => {
                    tlog!("[tcp] {}", IoError::io(&self.endpoint, "read", e));
                    st.read_reg = false;
                    None
                }
            }
        };

        match messages {
            Some(messages) => {
                self.callbacks.deliver(messages);
                Directive::Keep
            }
            None => {
                self.begin_close();
                Directive::Remove
            }
        }
    }

    fn on_writable(self: &Rc<Self>) -> Directive {
        let conn = self.state.borrow().conn;
        match conn {
            ConnectionState::Connecting => self.on_connect_ready(),
            ConnectionState::Connected => self.flush_head(),
            _ => {
                self.state.borrow_mut().write_reg = false;
                Directive::Remove
            }
        }
    }

    fn on_connect_ready(self: &Rc<Self>) -> Directive {
        let result = {
            let mut st = self.state.borrow_mut();
            // This callback's own registration goes away with `Remove`
            st.write_reg = false;
            match st.socket.as_ref() {
                Some(socket) => socket::connect_result(socket),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            }
        };

        match result {
            Ok(()) => self.established(),
            Err(e) => {
                tlog!("[tcp] Connect to {} failed: {}", self.endpoint, e);
                self.connect_failed();
            }
        }
        Directive::Remove
    }

    fn flush_head(self: &Rc<Self>) -> Directive {
        let failed = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            let (Some(socket), Some(head)) = (st.socket.as_mut(), st.queue.front()) else {
                st.write_reg = false;
                return Directive::Remove;
            };

            match socket.write(head) {
                Ok(n) => {
                    if n < head.len() {
                        tlog!(
                            "[tcp] Short write to {} ({} of {} bytes), retrying remainder",
                            self.endpoint,
                            n,
                            head.len()
                        );
                    }
                    st.queue.consume_front(n);
                    false
                }
                Err(e) if would_block(&e) => return Directive::Keep,
                Err(e) => {
                    tlog!("[tcp] {}", IoError::io(&self.endpoint, "write", e));
                    true
                }
            }
        };

        if failed {
            self.state.borrow_mut().write_reg = false;
            self.begin_close();
            return Directive::Remove;
        }

        let mut st = self.state.borrow_mut();
        if st.queue.is_empty() {
            st.write_reg = false;
            Directive::Remove
        } else {
            Directive::Keep
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Release everything without scheduling a retry. Returns whether the
    /// caller had been told the link was up.
    fn teardown(&self) -> bool {
        let mut st = self.state.borrow_mut();
        let announced = matches!(
            st.conn,
            ConnectionState::Connected | ConnectionState::Closing
        ) && st.notify_task.is_none();

        st.shut_down = true;
        if st.read_reg {
            self.event_loop.deregister_fd(st.fd, Interest::Read);
            st.read_reg = false;
        }
        if st.write_reg {
            self.event_loop.deregister_fd(st.fd, Interest::Write);
            st.write_reg = false;
        }
        for id in [
            st.connect_timer.take(),
            st.close_task.take(),
            st.notify_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.event_loop.cancel_timer(id);
        }
        st.socket = None;
        st.fd = -1;
        st.framer.discard();
        st.queue.clear();
        st.conn = ConnectionState::Disconnected;
        announced
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl Transport for TcpTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Tcp
    }

    fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.borrow().conn
    }

    fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        let arm_fd = {
            let mut st = self.shared.state.borrow_mut();
            if st.conn != ConnectionState::Connected {
                return Err(IoError::not_connected(&self.shared.endpoint));
            }
            if data.is_empty() {
                return Ok(());
            }

            st.queue.push(data);
            if st.write_reg {
                None
            } else {
                st.write_reg = true;
                Some(st.fd)
            }
        };

        if let Some(fd) = arm_fd {
            self.shared.register(fd, Interest::Write, TcpShared::on_writable);
        }
        Ok(())
    }

    fn cleanup(self: Box<Self>) -> Result<(), IoError> {
        tlog!("[tcp] Cleaning up {}", self.shared.endpoint);
        if self.shared.teardown() {
            self.shared.callbacks.notify(false);
        }
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

// ============================================================================
// Tests
// ============================================================================
