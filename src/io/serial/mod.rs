// src/io/serial/mod.rs
//
// Serial device backend.
//
// Opening the device is the "connected" signal: `on_connect(true)` fires
// before `open` returns. Writes accumulate in a single bounded buffer that
// is flushed on the next write readiness. A read failure or hangup is
// terminal and reported as `on_connect(false)`; the caller re-opens the
// device to recover.

pub mod utils;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use super::{
    close_fd, is_transient, BackendKind, Callbacks, ConnectionState, Directive, EventLoop,
    Interest, IoError, StreamFramer, Transport,
};
use crate::settings::TransportSettings;
pub use utils::{is_supported_baud_rate, LineFlags, Parity};

// ============================================================================
// Device Abstraction
// ============================================================================

/// A non-blocking byte device the backend can poll, read, write and close.
pub(crate) trait LineDevice: Read + Write + AsRawFd {
    /// Give up ownership of the descriptor so `close` errors can be reported.
    fn into_fd(self: Box<Self>) -> RawFd;
}

impl LineDevice for serialport::TTYPort {
    fn into_fd(self: Box<Self>) -> RawFd {
        (*self).into_raw_fd()
    }
}

/// Open the device read/write without becoming its controlling terminal,
/// apply line settings and flush anything pending on the line.
fn open_device(
    path: &str,
    baud_rate: u32,
    flags: &LineFlags,
) -> Result<serialport::TTYPort, IoError> {
    if !is_supported_baud_rate(baud_rate) {
        return Err(IoError::unavailable(
            path,
            format!("unsupported baud rate {}", baud_rate),
        ));
    }

    let port = serialport::new(path, baud_rate)
        .data_bits(utils::to_serialport_data_bits(flags.data_bits))
        .parity(utils::to_serialport_parity(&flags.parity))
        .stop_bits(utils::to_serialport_stop_bits(flags.two_stop_bits))
        .flow_control(utils::to_serialport_flow_control(flags.hardware_flow_control))
        .timeout(Duration::ZERO)
        .open_native()
        .map_err(|e| IoError::unavailable(path, format!("open: {}", e)))?;

    port.clear(ClearBuffer::All)
        .map_err(|e| IoError::unavailable(path, format!("flush: {}", e)))?;

    set_nonblocking(port.as_raw_fd())
        .map_err(|e| IoError::unavailable(path, format!("set non-blocking: {}", e)))?;

    Ok(port)
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// ============================================================================
// Backend State
// ============================================================================

struct SerialState {
    /// `None` once torn down
    device: Option<Box<dyn LineDevice>>,
    fd: RawFd,
    framer: StreamFramer,
    write_buf: Vec<u8>,
    write_capacity: usize,
    read_reg: bool,
    write_reg: bool,
}

struct SerialShared {
    path: String,
    event_loop: Rc<dyn EventLoop>,
    state: RefCell<SerialState>,
    callbacks: Callbacks,
}

/// Serial device transport
pub struct SerialTransport {
    shared: Rc<SerialShared>,
}

impl SerialTransport {
    pub(crate) fn open(
        path: &str,
        event_loop: Rc<dyn EventLoop>,
        callbacks: Callbacks,
        baud_rate: u32,
        eol_marker: Option<&[u8]>,
        settings: &TransportSettings,
    ) -> Result<Self, IoError> {
        let flags = LineFlags::parse(&settings.line_flags);
        let port = open_device(path, baud_rate, &flags)?;

        tlog!(
            "[serial] Opened {} at {} baud ({:?})",
            path,
            baud_rate,
            flags
        );

        Ok(Self::from_device(
            path,
            Box::new(port),
            event_loop,
            callbacks,
            eol_marker,
            settings,
        ))
    }

    /// Start driving an already opened, non-blocking device.
    pub(crate) fn from_device(
        path: &str,
        device: Box<dyn LineDevice>,
        event_loop: Rc<dyn EventLoop>,
        callbacks: Callbacks,
        eol_marker: Option<&[u8]>,
        settings: &TransportSettings,
    ) -> Self {
        let fd = device.as_raw_fd();
        let shared = Rc::new(SerialShared {
            path: path.to_string(),
            event_loop,
            state: RefCell::new(SerialState {
                device: Some(device),
                fd,
                framer: StreamFramer::new(settings.read_buffer_size, eol_marker),
                write_buf: Vec::with_capacity(settings.write_buffer_size),
                write_capacity: settings.write_buffer_size,
                read_reg: true,
                write_reg: false,
            }),
            callbacks,
        });

        let weak = Rc::downgrade(&shared);
        shared.event_loop.register_fd(
            fd,
            Interest::Read,
            Box::new(move |_, _| with_shared(&weak, on_readable)),
        );

        // No handshake for a local device
        shared.callbacks.notify(true);

        SerialTransport { shared }
    }
}

fn with_shared(weak: &Weak<SerialShared>, f: fn(&SerialShared) -> Directive) -> Directive {
    match weak.upgrade() {
        Some(shared) => f(&shared),
        None => Directive::Remove,
    }
}

// ============================================================================
// Readiness Callbacks
// ============================================================================

fn on_readable(shared: &SerialShared) -> Directive {
    let has_reader = shared.callbacks.has_reader();

    // `None` when the read side is gone for good
    let messages = {
        let mut guard = shared.state.borrow_mut();
        let st = &mut *guard;
        let Some(device) = st.device.as_mut() else {
            st.read_reg = false;
            return Directive::Remove;
        };

        match device.read(st.framer.spare_mut()) {
            Ok(0) => {
                tlog!("[serial] {} closed", shared.path);
                st.read_reg = false;
                None
            }
            Ok(n) if has_reader => Some(st.framer.commit(n)),
            Ok(_) => {
                st.framer.discard();
                return Directive::Keep;
            }
            Err(e) if is_transient(&e) => return Directive::Keep,
            Err(e) => {
                tlog!(
                    "[serial] {}, no further reads until re-opened",
                    IoError::io(&shared.path, "read", e)
                );
                st.read_reg = false;
                None
            }
        }
    };

    match messages {
        Some(messages) => {
            shared.callbacks.deliver(messages);
            Directive::Keep
        }
        None => {
            shared.callbacks.notify(false);
            Directive::Remove
        }
    }
}

fn on_writable(shared: &SerialShared) -> Directive {
    let mut guard = shared.state.borrow_mut();
    let st = &mut *guard;

    let Some(device) = st.device.as_mut() else {
        st.write_reg = false;
        return Directive::Remove;
    };
    if st.write_buf.is_empty() {
        st.write_reg = false;
        return Directive::Remove;
    }

    match device.write(&st.write_buf) {
        Ok(n) => {
            if n < st.write_buf.len() {
                tlog!(
                    "[serial] Short write on {} ({} of {} bytes), retrying remainder",
                    shared.path,
                    n,
                    st.write_buf.len()
                );
            }
            st.write_buf.drain(..n);
        }
        Err(e) if is_transient(&e) => return Directive::Keep,
        Err(e) => {
            tlog!(
                "[serial] {}, dropping {} buffered bytes",
                IoError::io(&shared.path, "write", e),
                st.write_buf.len()
            );
            st.write_buf.clear();
        }
    }

    if st.write_buf.is_empty() {
        st.write_reg = false;
        Directive::Remove
    } else {
        Directive::Keep
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl SerialTransport {
    /// Deregister all interest and take the device out of the state.
    fn teardown(&self) -> Option<Box<dyn LineDevice>> {
        let (device, fd, read_reg, write_reg) = {
            let mut st = self.shared.state.borrow_mut();
            let regs = (st.read_reg, st.write_reg);
            st.read_reg = false;
            st.write_reg = false;
            st.write_buf.clear();
            st.framer.discard();
            (st.device.take(), st.fd, regs.0, regs.1)
        };

        if device.is_some() {
            if read_reg {
                self.shared.event_loop.deregister_fd(fd, Interest::Read);
            }
            if write_reg {
                self.shared.event_loop.deregister_fd(fd, Interest::Write);
            }
        }
        device
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    fn endpoint(&self) -> &str {
        &self.shared.path
    }

    fn state(&self) -> ConnectionState {
        let st = self.shared.state.borrow();
        if st.device.is_some() && st.read_reg {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        let arm_fd = {
            let mut st = self.shared.state.borrow_mut();
            if st.device.is_none() {
                return Err(IoError::not_connected(&self.shared.path));
            }

            let available = st.write_capacity - st.write_buf.len();
            if data.len() > available {
                tlog!(
                    "[serial] Cannot write {} bytes to {}, {} bytes of buffer left",
                    data.len(),
                    self.shared.path,
                    available
                );
                return Err(IoError::BufferFull {
                    device: self.shared.path.clone(),
                    requested: data.len(),
                    available,
                });
            }
            if data.is_empty() {
                return Ok(());
            }

            st.write_buf.extend_from_slice(data);
            if st.write_reg {
                None
            } else {
                st.write_reg = true;
                Some(st.fd)
            }
        };

        if let Some(fd) = arm_fd {
            let weak = Rc::downgrade(&self.shared);
            self.shared.event_loop.register_fd(
                fd,
                Interest::Write,
                Box::new(move |_, _| with_shared(&weak, on_writable)),
            );
        }
        Ok(())
    }

    fn cleanup(self: Box<Self>) -> Result<(), IoError> {
        let Some(device) = self.teardown() else {
            return Ok(());
        };

        close_fd(device.into_fd()).map_err(|source| {
            tlog!("[serial] Unable to close {}: {}", self.shared.path, source);
            IoError::CloseFailed {
                device: self.shared.path.clone(),
                source,
            }
        })
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        drop(self.teardown());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PollLoop;
    use std::cell::Cell;
    use std::io::ErrorKind;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    impl LineDevice for UnixStream {
        fn into_fd(self: Box<Self>) -> RawFd {
            (*self).into_raw_fd()
        }
    }

    struct Harness {
        lp: Rc<PollLoop>,
        transport: Box<SerialTransport>,
        peer: UnixStream,
        lines: Rc<RefCell<Vec<Vec<u8>>>>,
        connects: Rc<RefCell<Vec<bool>>>,
    }

    fn harness(marker: Option<&[u8]>, settings: TransportSettings) -> Harness {
        let lp = Rc::new(PollLoop::new().unwrap());
        let (device, peer) = UnixStream::pair().unwrap();
        device.set_nonblocking(true).unwrap();

        let lines = Rc::new(RefCell::new(Vec::new()));
        let connects = Rc::new(RefCell::new(Vec::new()));
        let (l, c) = (lines.clone(), connects.clone());
        let callbacks = Callbacks::new(
            Some(Box::new(move |msg: &[u8]| l.borrow_mut().push(msg.to_vec()))),
            Some(Box::new(move |up: bool| c.borrow_mut().push(up))),
        );

        let transport = Box::new(SerialTransport::from_device(
            "/dev/ttyTEST",
            Box::new(device),
            lp.clone(),
            callbacks,
            marker,
            &settings,
        ));

        Harness {
            lp,
            transport,
            peer,
            lines,
            connects,
        }
    }

    #[test]
    fn test_connect_reported_synchronously() {
        let h = harness(None, TransportSettings::default());
        assert_eq!(*h.connects.borrow(), vec![true]);
        assert_eq!(h.transport.state(), ConnectionState::Connected);
        assert_eq!(h.lp.registered_fd_count(), 1);
    }

    #[test]
    fn test_line_mode_reads() {
        let mut h = harness(Some(b"\n"), TransportSettings::default());

        h.peer.write_all(b"AB\nCD").unwrap();
        h.lp.run_until(Duration::from_secs(1), || !h.lines.borrow().is_empty());
        h.peer.write_all(b"EF\n").unwrap();
        h.lp.run_until(Duration::from_secs(1), || h.lines.borrow().len() == 2);

        assert_eq!(*h.lines.borrow(), vec![b"AB".to_vec(), b"CDEF".to_vec()]);
    }

    #[test]
    fn test_write_flushes_on_readiness() {
        let mut h = harness(None, TransportSettings::default());
        h.transport.write(b"hello ").unwrap();
        h.transport.write(b"radio").unwrap();
        assert_eq!(h.lp.registered_fd_count(), 2);

        h.lp.run_until(Duration::from_secs(1), || h.lp.registered_fd_count() == 1);

        let mut buf = [0u8; 32];
        h.peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let n = h.peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello radio");
    }

    #[test]
    fn test_write_overflow_rejected_and_buffer_kept() {
        let settings = TransportSettings {
            write_buffer_size: 8,
            ..TransportSettings::default()
        };
        let mut h = harness(None, settings);

        h.transport.write(b"12345").unwrap();
        let err = h.transport.write(b"6789").unwrap_err();
        assert!(matches!(
            err,
            IoError::BufferFull {
                requested: 4,
                available: 3,
                ..
            }
        ));
        assert_eq!(h.transport.shared.state.borrow().write_buf, b"12345");

        // Exactly filling the buffer is fine
        h.transport.write(b"678").unwrap();
        assert_eq!(h.transport.shared.state.borrow().write_buf, b"12345678");
    }

    #[test]
    fn test_peer_close_stops_reading() {
        let h = harness(Some(b"\n"), TransportSettings::default());
        let Harness {
            lp, transport, peer, ..
        } = h;
        drop(peer);

        lp.run_until(Duration::from_secs(1), || lp.registered_fd_count() == 0);
        assert_eq!(lp.registered_fd_count(), 0);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_peer_close_reports_disconnect() {
        let Harness {
            lp,
            transport,
            peer,
            connects,
            ..
        } = harness(None, TransportSettings::default());
        drop(peer);

        lp.run_until(Duration::from_secs(1), || connects.borrow().len() == 2);
        assert_eq!(*connects.borrow(), vec![true, false]);
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        // Already reported, cleanup stays silent
        transport.cleanup().unwrap();
        assert_eq!(*connects.borrow(), vec![true, false]);
        assert!(lp.is_idle());
    }

    #[test]
    fn test_large_write_survives_short_writes() {
        const TOTAL: usize = 1 << 20;
        let settings = TransportSettings {
            write_buffer_size: TOTAL,
            ..TransportSettings::default()
        };
        let mut h = harness(None, settings);
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        h.transport.write(&payload).unwrap();

        // Far more than a socket buffer holds, so the flush takes many writes
        h.peer.set_nonblocking(true).unwrap();
        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = Instant::now() + Duration::from_secs(10);
        while received.len() < TOTAL && Instant::now() < deadline {
            h.lp.run_once(Some(Duration::from_millis(10)));
            loop {
                match h.peer.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("peer read failed: {}", e),
                }
            }
        }

        assert_eq!(received.len(), TOTAL);
        assert!(received == payload, "payload corrupted in transit");
        assert!(h.transport.shared.state.borrow().write_buf.is_empty());
        assert_eq!(h.lp.registered_fd_count(), 1);
    }

    #[test]
    fn test_write_error_drops_buffer_and_disarms() {
        let mut h = harness(None, TransportSettings::default());
        h.transport.write(b"never delivered").unwrap();
        let Harness {
            lp,
            transport,
            peer,
            connects,
            ..
        } = h;
        // EPIPE on the next flush
        drop(peer);

        lp.run_until(Duration::from_secs(1), || lp.registered_fd_count() == 0);

        let st = transport.shared.state.borrow();
        assert!(st.write_buf.is_empty());
        assert!(!st.write_reg);
        assert!(!st.read_reg);
        assert_eq!(*connects.borrow(), vec![true, false]);
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let mut h = harness(None, TransportSettings::default());
        h.transport.write(b"pending").unwrap();
        assert_eq!(h.lp.registered_fd_count(), 2);

        h.transport.cleanup().unwrap();
        assert_eq!(h.lp.registered_fd_count(), 0);
        assert!(h.lp.is_idle());
        // No disconnect callback for serial cleanup
        assert_eq!(*h.connects.borrow(), vec![true]);
    }

    #[test]
    fn test_sink_mode_discards() {
        let lp = Rc::new(PollLoop::new().unwrap());
        let (device, mut peer) = UnixStream::pair().unwrap();
        device.set_nonblocking(true).unwrap();
        let connected = Rc::new(Cell::new(false));
        let c = connected.clone();

        let transport = SerialTransport::from_device(
            "/dev/ttyTEST",
            Box::new(device),
            lp.clone(),
            Callbacks::new(None, Some(Box::new(move |up: bool| c.set(up)))),
            Some(b"\n"),
            &TransportSettings::default(),
        );
        assert!(connected.get());

        peer.write_all(b"partial line").unwrap();
        lp.run_for(Duration::from_millis(20));
        assert!(transport.shared.state.borrow().framer.buffered().is_empty());
    }
}
