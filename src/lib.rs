// src/lib.rs
//
// serial-link: byte-stream transport over a local serial device or a remote
// TCP-to-serial bridge, driven by a caller-owned single-threaded event loop.
//
// Unix only: descriptors are polled directly.

// Logging must come first so `tlog!` is in scope for every module below
#[macro_use]
pub mod logging;

pub mod checksums;
pub mod io;
pub mod kiss;
pub mod settings;

pub use io::{
    open, open_with_settings, BackendKind, ConnectCallback, ConnectionState, Directive,
    EventLoop, FramingMode, Interest, IoError, PollLoop, ReadCallback, TimerId,
    TransportHandle,
};
pub use settings::{KeepaliveSettings, TransportSettings};
