// tools/kiss_cmd/main.rs
//
// Send one KISS-framed command to a radio and print whatever comes back.
//
//   kiss_cmd /dev/ttyUSB0 0x01 0x02
//   kiss_cmd tcp://radio.local:8001 1 0x20 010

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;

use serial_link::{
    kiss, logging, tlog, ConnectCallback, PollLoop, TransportHandle, TransportSettings,
};

const BAUD_RATE: u32 = 9600;

/// Send a KISS command packet over a serial device or tcp://host:port.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Serial device path or tcp://host:port
    endpoint: String,

    /// Command bytes (0x.. hex, 0.. octal, otherwise decimal)
    #[arg(required = true, value_parser = kiss::parse_byte)]
    bytes: Vec<u8>,

    /// How long to wait for replies before exiting
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// TOML file with transport settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Mirror log output to a file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kiss_cmd: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    if let Some(dir) = &cli.log_dir {
        logging::init_file_logging(dir)?;
    }

    let settings = match &cli.config {
        Some(path) => TransportSettings::load(path)?,
        None => TransportSettings::default(),
    };

    let command = kiss::build_command(&cli.bytes)?;
    let frame = kiss::encode_frame(&command);
    println!("Sending: {}", hex::encode_upper(&frame));

    let lp = Rc::new(PollLoop::new().map_err(|e| format!("Unable to create event loop: {}", e))?);
    let sender = Rc::new(FrameSender::new(frame));

    let on_read = Box::new(|data: &[u8]| println!("Recvd: {}", hex::encode_upper(data)));

    let opened = serial_link::open_with_settings(
        &cli.endpoint,
        lp.clone(),
        Some(on_read),
        Some(FrameSender::connect_callback(&sender)),
        BAUD_RATE,
        None,
        &settings,
    )
    .map_err(String::from)?;
    sender.attach(opened);

    lp.run_for(Duration::from_millis(cli.timeout_ms));

    if !sender.connected_once.get() {
        tlog!("[kiss_cmd] Never connected to {}", cli.endpoint);
    }

    let opened = sender.handle.borrow_mut().take();
    let result = match opened {
        Some(h) => h.cleanup().map_err(String::from),
        None => Ok(()),
    };
    logging::stop_file_logging();
    result
}

/// Writes the frame each time the link comes up, so a TCP link that drops
/// and reconnects gets the command again.
struct FrameSender {
    frame: Vec<u8>,
    handle: RefCell<Option<TransportHandle>>,
    /// Serial reports the connection before `open` has returned the handle
    connected_early: Cell<bool>,
    connected_once: Cell<bool>,
}

impl FrameSender {
    fn new(frame: Vec<u8>) -> Self {
        FrameSender {
            frame,
            handle: RefCell::new(None),
            connected_early: Cell::new(false),
            connected_once: Cell::new(false),
        }
    }

    fn connect_callback(sender: &Rc<Self>) -> ConnectCallback {
        let sender = Rc::clone(sender);
        Box::new(move |up: bool| sender.on_connect(up))
    }

    fn on_connect(&self, up: bool) {
        tlog!("[kiss_cmd] Link {}", if up { "up" } else { "down" });
        if !up {
            return;
        }
        self.connected_once.set(true);
        match self.handle.borrow_mut().as_mut() {
            Some(h) => send_frame(h, &self.frame),
            None => self.connected_early.set(true),
        }
    }

    fn attach(&self, opened: TransportHandle) {
        let mut slot = self.handle.borrow_mut();
        let h = slot.insert(opened);
        if self.connected_early.replace(false) {
            send_frame(h, &self.frame);
        }
    }
}

fn send_frame(handle: &mut TransportHandle, frame: &[u8]) {
    if let Err(e) = handle.write(frame) {
        tlog!("[kiss_cmd] Write failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    const WAIT: Duration = Duration::from_secs(3);

    fn read_frame(peer: &mut TcpStream, len: usize) -> Vec<u8> {
        peer.set_read_timeout(Some(WAIT)).unwrap();
        let mut frame = vec![0u8; len];
        peer.read_exact(&mut frame).unwrap();
        frame
    }

    #[test]
    fn test_frame_resent_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let settings = TransportSettings {
            retry_interval_ms: 50,
            ..TransportSettings::default()
        };

        let frame = kiss::encode_frame(&kiss::build_command(&[0x01, 0x02]).unwrap());
        let lp = Rc::new(PollLoop::new().unwrap());
        let sender = Rc::new(FrameSender::new(frame.clone()));
        let opened = serial_link::open_with_settings(
            &endpoint,
            lp.clone(),
            None,
            Some(FrameSender::connect_callback(&sender)),
            BAUD_RATE,
            None,
            &settings,
        )
        .unwrap();
        sender.attach(opened);

        // The kernel completes the handshake before accept
        assert!(lp.run_until(WAIT, || sender.connected_once.get()));
        lp.run_for(Duration::from_millis(20));
        let (mut first, _) = listener.accept().unwrap();
        assert_eq!(read_frame(&mut first, frame.len()), frame);

        // Peer hangs up, the backend reconnects and the frame goes out again
        drop(first);
        listener.set_nonblocking(true).unwrap();
        let mut accepted = None;
        lp.run_until(WAIT, || {
            if accepted.is_none() {
                accepted = listener.accept().ok();
            }
            accepted.is_some()
        });
        let (mut second, _) = accepted.unwrap();
        second.set_nonblocking(false).unwrap();
        lp.run_for(Duration::from_millis(50));
        assert_eq!(read_frame(&mut second, frame.len()), frame);

        if let Some(h) = sender.handle.borrow_mut().take() {
            h.cleanup().unwrap();
        }
    }
}
