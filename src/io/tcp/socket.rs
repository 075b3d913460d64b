// src/io/tcp/socket.rs
//
// Address parsing/resolution and non-blocking connect setup on socket2.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};

use crate::settings::TransportSettings;

/// Split `host:port`. IPv6 literals use brackets: `[::1]:4000`.
pub(crate) fn parse_host_port(target: &str) -> Result<(&str, u16), String> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated '[' in '{}'", target))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| format!("missing port in '{}'", target))?;
        (host, port)
    } else {
        target
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in '{}'", target))?
    };

    if host.is_empty() {
        return Err(format!("missing host in '{}'", target));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", port))?;
    Ok((host, port))
}

/// Resolve once, preferring the first IPv4 address.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve '{}': {}", host, e))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| format!("no addresses for '{}'", host))
}

/// Outcome of a non-blocking connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectProgress {
    Established,
    InProgress,
}

/// Create a configured non-blocking socket and start connecting it.
/// The socket is closed on any error.
pub(crate) fn start_connect(
    addr: &SocketAddr,
    settings: &TransportSettings,
) -> io::Result<(Socket, ConnectProgress)> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(settings.tcp_nodelay)?;
    socket.set_tcp_keepalive(&keepalive_params(settings))?;

    match socket.connect(&SockAddr::from(*addr)) {
        Ok(()) => Ok((socket, ConnectProgress::Established)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            Ok((socket, ConnectProgress::InProgress))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Ok((socket, ConnectProgress::InProgress))
        }
        Err(e) => Err(e),
    }
}

fn keepalive_params(settings: &TransportSettings) -> TcpKeepalive {
    let ka = &settings.keepalive;
    let params = TcpKeepalive::new().with_time(Duration::from_secs(ka.idle_secs));

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let params = params
        .with_interval(Duration::from_secs(ka.interval_secs))
        .with_retries(ka.count);

    params
}

/// Result of the pending connect: `Ok(())` once established.
pub(crate) fn connect_result(socket: &Socket) -> io::Result<()> {
    match socket.take_error()? {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("localhost:4000").unwrap(), ("localhost", 4000));
        assert_eq!(parse_host_port("10.1.2.3:23").unwrap(), ("10.1.2.3", 23));
        assert_eq!(parse_host_port("[::1]:8001").unwrap(), ("::1", 8001));
    }

    #[test]
    fn test_parse_host_port_rejects_malformed() {
        assert!(parse_host_port("localhost").is_err());
        assert!(parse_host_port(":4000").is_err());
        assert!(parse_host_port("host:").is_err());
        assert!(parse_host_port("host:70000").is_err());
        assert!(parse_host_port("[::1]4000").is_err());
        assert!(parse_host_port("[::1:4000").is_err());
    }

    #[test]
    fn test_resolve_prefers_ipv4_literal() {
        let addr = resolve("127.0.0.1", 9).unwrap();
        assert_eq!(addr, "127.0.0.1:9".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_start_connect_to_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (socket, _progress) = start_connect(&addr, &TransportSettings::default()).unwrap();
        assert!(socket.nodelay().unwrap());
        assert!(socket.keepalive().unwrap());

        listener.accept().unwrap();
    }
}
