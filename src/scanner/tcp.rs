use std::io;
use std::net::SocketAddr;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::scanner::results::PortState;

pub const TAG_TIMEOUT: &str = "timeout";
pub const TAG_CONNECTION_REFUSED: &str = "connection_refused";
pub const TAG_RESOLVE_FAILED: &str = "resolve_failed";

/// Classified result of one port probe: a state plus the reason tag for anything
/// that is not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub state: PortState,
    pub reason: Option<&'static str>,
}

impl ProbeOutcome {
    pub const fn open() -> Self {
        Self { state: PortState::Open, reason: None }
    }

    pub const fn filtered(reason: &'static str) -> Self {
        Self { state: PortState::Filtered, reason: Some(reason) }
    }

    pub const fn closed(reason: &'static str) -> Self {
        Self { state: PortState::Closed, reason: Some(reason) }
    }
}

/// How a single port gets probed. Implementations must respect `deadline` and
/// never fail: every error is an outcome.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: SocketAddr, deadline: Duration) -> ProbeOutcome;
}

/// Full TCP handshake; the connection is closed as soon as it is established.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectProber;

#[async_trait]
impl Prober for TcpConnectProber {
    async fn probe(&self, addr: SocketAddr, deadline: Duration) -> ProbeOutcome {
        connect_scan(addr, deadline).await
    }
}

pub async fn connect_scan(addr: SocketAddr, deadline: Duration) -> ProbeOutcome {
    match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            ProbeOutcome::open()
        }
        // The OS gave up before our deadline did; same meaning as our own timeout.
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => ProbeOutcome::filtered(TAG_TIMEOUT),
        Ok(Err(e)) => ProbeOutcome::closed(reason_tag(&e)),
        Err(_) => ProbeOutcome::filtered(TAG_TIMEOUT),
    }
}

/// Map a connect error to the reason tag carried on a closed port.
pub fn reason_tag(error: &io::Error) -> &'static str {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => TAG_CONNECTION_REFUSED,
        io::ErrorKind::ConnectionReset => "connection_reset",
        io::ErrorKind::ConnectionAborted => "connection_aborted",
        io::ErrorKind::AddrNotAvailable => "address_unavailable",
        io::ErrorKind::PermissionDenied => "permission_denied",
        io::ErrorKind::TimedOut => TAG_TIMEOUT,
        _ => match error.raw_os_error() {
            Some(code) if is_host_unreachable(code) => "host_unreachable",
            Some(code) if is_network_unreachable(code) => "network_unreachable",
            _ => "io_error",
        },
    }
}

#[cfg(unix)]
fn is_host_unreachable(code: i32) -> bool {
    // EHOSTUNREACH: 113 on Linux, 65 on the BSDs and macOS.
    if cfg!(target_os = "linux") { code == 113 } else { code == 65 }
}

#[cfg(unix)]
fn is_network_unreachable(code: i32) -> bool {
    // ENETUNREACH: 101 on Linux, 51 on the BSDs and macOS.
    if cfg!(target_os = "linux") { code == 101 } else { code == 51 }
}

#[cfg(windows)]
fn is_host_unreachable(code: i32) -> bool {
    code == 10065 // WSAEHOSTUNREACH
}

#[cfg(windows)]
fn is_network_unreachable(code: i32) -> bool {
    code == 10051 // WSAENETUNREACH
}

#[cfg(not(any(unix, windows)))]
fn is_host_unreachable(_code: i32) -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
fn is_network_unreachable(_code: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let outcome = connect_scan(addr, Duration::from_secs(1)).await;
        assert_eq!(outcome, ProbeOutcome::open());
    }

    #[tokio::test]
    async fn test_refused_port_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = connect_scan(addr, Duration::from_secs(1)).await;
        assert_eq!(outcome.state, PortState::Closed);
        assert_eq!(outcome.reason, Some(TAG_CONNECTION_REFUSED));
    }

    #[test]
    fn test_reason_tags() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(reason_tag(&refused), "connection_refused");

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(reason_tag(&reset), "connection_reset");

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(reason_tag(&other), "io_error");
    }
}
