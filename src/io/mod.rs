// src/io/mod.rs
//
// Transport facade. `open` picks the serial or TCP backend from the endpoint
// string and hands back a `TransportHandle`; both backends report data and
// connection changes through the same two callbacks.
//
// Endpoints:
//   tcp://host:port   (scheme is case-insensitive) -> TCP backend
//   anything else     -> serial device path

pub mod error;
mod event_loop;
mod framer;
mod poll_loop;
pub mod serial;
pub mod tcp;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub use error::IoError;
pub use event_loop::{
    DeferredTask, Directive, EventLoop, FdCallback, Interest, TimerCallback, TimerId,
};
pub use framer::{FramingMode, StreamFramer};
pub use poll_loop::PollLoop;

use crate::settings::TransportSettings;

/// Scheme prefix selecting the TCP backend
pub const TCP_SCHEME: &str = "tcp://";

// ============================================================================
// Callbacks
// ============================================================================

/// Invoked once per framed message (or per raw chunk in chunk mode)
pub type ReadCallback = Box<dyn FnMut(&[u8])>;

/// Invoked on every transition into (`true`) or out of (`false`) the
/// connected state
pub type ConnectCallback = Box<dyn FnMut(bool)>;

/// User callbacks shared by a backend and its event loop registrations.
/// Never invoked while backend state is borrowed, so they may call back
/// into the handle.
pub(crate) struct Callbacks {
    on_read: RefCell<Option<ReadCallback>>,
    on_connect: RefCell<Option<ConnectCallback>>,
}

impl Callbacks {
    pub(crate) fn new(on_read: Option<ReadCallback>, on_connect: Option<ConnectCallback>) -> Self {
        Callbacks {
            on_read: RefCell::new(on_read),
            on_connect: RefCell::new(on_connect),
        }
    }

    pub(crate) fn has_reader(&self) -> bool {
        // A reader that is running right now is still attached
        self.on_read
            .try_borrow()
            .map(|cb| cb.is_some())
            .unwrap_or(true)
    }

    pub(crate) fn deliver(&self, messages: Vec<Vec<u8>>) {
        if messages.is_empty() {
            return;
        }
        match self.on_read.try_borrow_mut() {
            Ok(mut guard) => {
                if let Some(cb) = guard.as_mut() {
                    for msg in &messages {
                        cb(msg);
                    }
                }
            }
            Err(_) => tlog!(
                "[transport] Read callback re-entered, dropping {} messages",
                messages.len()
            ),
        }
    }

    pub(crate) fn notify(&self, connected: bool) {
        match self.on_connect.try_borrow_mut() {
            Ok(mut guard) => {
                if let Some(cb) = guard.as_mut() {
                    cb(connected);
                }
            }
            Err(_) => tlog!(
                "[transport] Connect callback re-entered, dropping status {}",
                connected
            ),
        }
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Which backend a handle is driving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Serial,
    Tcp,
}

/// Connection state as seen by the caller. The serial backend is
/// `Connected` from open until its read side fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Non-blocking connect issued, waiting for writability
    Connecting,
    Connected,
    /// Deferred close scheduled but not yet run
    Closing,
}

pub(crate) trait Transport {
    fn kind(&self) -> BackendKind;
    fn endpoint(&self) -> &str;
    fn state(&self) -> ConnectionState;
    fn write(&mut self, data: &[u8]) -> Result<(), IoError>;
    fn cleanup(self: Box<Self>) -> Result<(), IoError>;
}

// ============================================================================
// Handle
// ============================================================================

/// Open transport. Owned by the caller until `cleanup` consumes it.
/// Dropping a handle without `cleanup` still releases every event loop
/// registration, but invokes no callbacks.
pub struct TransportHandle {
    backend: Box<dyn Transport>,
}

impl TransportHandle {
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn endpoint(&self) -> &str {
        self.backend.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        self.backend.state()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.state() == ConnectionState::Connected
    }

    /// Queue bytes for transmission.
    ///
    /// Serial: fails with `BufferFull` when the bytes do not fit in the
    /// remaining write buffer (nothing is buffered in that case).
    /// TCP: fails with `NotConnected` unless connected; never performs I/O
    /// directly, the queue is flushed on write readiness.
    pub fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.backend.write(data)
    }

    /// Deregister everything, cancel all timers and close the descriptor.
    pub fn cleanup(self) -> Result<(), IoError> {
        self.backend.cleanup()
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("kind", &self.kind())
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Endpoint Selection
// ============================================================================

/// Parsed endpoint string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint<'a> {
    /// `host:port` after the scheme
    Tcp(&'a str),
    /// Device path
    Serial(&'a str),
}

impl<'a> Endpoint<'a> {
    pub fn parse(endpoint: &'a str) -> Self {
        match endpoint.get(..TCP_SCHEME.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(TCP_SCHEME) => {
                Endpoint::Tcp(&endpoint[TCP_SCHEME.len()..])
            }
            _ => Endpoint::Serial(endpoint),
        }
    }
}

/// Open an endpoint with default settings.
///
/// `baud_rate` only applies to serial devices. `eol_marker` selects line
/// mode (split on the marker, marker dropped); `None` selects chunk mode.
/// A serial open reports `on_connect(true)` before returning; TCP reports
/// connection changes asynchronously.
pub fn open(
    endpoint: &str,
    event_loop: Rc<dyn EventLoop>,
    on_read: Option<ReadCallback>,
    on_connect: Option<ConnectCallback>,
    baud_rate: u32,
    eol_marker: Option<&str>,
) -> Result<TransportHandle, IoError> {
    open_with_settings(
        endpoint,
        event_loop,
        on_read,
        on_connect,
        baud_rate,
        eol_marker,
        &TransportSettings::default(),
    )
}

/// Same as [`open`] with explicit settings.
pub fn open_with_settings(
    endpoint: &str,
    event_loop: Rc<dyn EventLoop>,
    on_read: Option<ReadCallback>,
    on_connect: Option<ConnectCallback>,
    baud_rate: u32,
    eol_marker: Option<&str>,
    settings: &TransportSettings,
) -> Result<TransportHandle, IoError> {
    let callbacks = Callbacks::new(on_read, on_connect);
    let marker = eol_marker.map(str::as_bytes);

    let backend: Box<dyn Transport> = match Endpoint::parse(endpoint) {
        Endpoint::Tcp(_) => Box::new(tcp::TcpTransport::open(
            endpoint, event_loop, callbacks, marker, settings,
        )?),
        Endpoint::Serial(path) => Box::new(serial::SerialTransport::open(
            path, event_loop, callbacks, baud_rate, marker, settings,
        )?),
    };

    Ok(TransportHandle { backend })
}

/// Close a descriptor, reporting the error `Drop` impls would swallow.
pub(crate) fn close_fd(fd: RawFd) -> std::io::Result<()> {
    if unsafe { libc::close(fd) } == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Would-block style conditions that are retried on the next readiness event
pub(crate) fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_endpoint_scheme_is_case_insensitive() {
        assert_eq!(Endpoint::parse("tcp://radio:4000"), Endpoint::Tcp("radio:4000"));
        assert_eq!(Endpoint::parse("TCP://10.0.0.2:23"), Endpoint::Tcp("10.0.0.2:23"));
        assert_eq!(Endpoint::parse("Tcp://h:1"), Endpoint::Tcp("h:1"));
    }

    #[test]
    fn test_endpoint_without_scheme_is_serial() {
        assert_eq!(Endpoint::parse("/dev/ttyUSB0"), Endpoint::Serial("/dev/ttyUSB0"));
        assert_eq!(Endpoint::parse("tcp:/x"), Endpoint::Serial("tcp:/x"));
        assert_eq!(Endpoint::parse("tcp"), Endpoint::Serial("tcp"));
        assert_eq!(Endpoint::parse("ü/dev"), Endpoint::Serial("ü/dev"));
    }

    #[test]
    fn test_open_missing_device_is_unavailable() {
        let lp = Rc::new(PollLoop::new().unwrap());
        let connected = Rc::new(Cell::new(false));
        let c = connected.clone();

        let err = open(
            "/dev/serial-link-does-not-exist",
            lp.clone(),
            None,
            Some(Box::new(move |up: bool| c.set(up))),
            9600,
            None,
        )
        .unwrap_err();

        assert!(matches!(err, IoError::Unavailable { .. }));
        assert!(!connected.get());
        assert!(lp.is_idle());
    }

    #[test]
    fn test_open_tcp_without_port_is_unavailable() {
        let lp = Rc::new(PollLoop::new().unwrap());
        let err = open("tcp://localhost", lp.clone(), None, None, 0, None).unwrap_err();
        assert!(matches!(err, IoError::Unavailable { .. }));
        assert!(lp.is_idle());
    }

    #[test]
    fn test_callbacks_deliver_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let callbacks = Callbacks::new(
            Some(Box::new(move |msg: &[u8]| s.borrow_mut().push(msg.to_vec()))),
            None,
        );

        assert!(callbacks.has_reader());
        callbacks.deliver(vec![b"a".to_vec(), b"b".to_vec()]);
        callbacks.notify(true);
        assert_eq!(*seen.borrow(), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
