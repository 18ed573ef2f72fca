// HTTP and HTTPS detection: one GET / and a look at the response head.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};

use super::{connect, read_until, truncate_banner, write_all, ProtocolDetectionResult, ProtocolDetector};
use crate::error::ProbeError;

const RESPONSE_LIMIT: usize = 8192;
const STATUS_LINE_LIMIT: usize = 200;

/// Status line and `Server` header of a response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    pub status_line: String,
    pub server: Option<String>,
}

/// Pull the status line and server header out of a (possibly partial)
/// response. Returns `None` only for an empty response.
pub fn parse_http_head(response: &[u8]) -> Option<HttpHead> {
    let text = String::from_utf8_lossy(response);
    let head = text.split("\r\n\r\n").next().unwrap_or_default();
    let mut lines = head.lines();

    let status_line = lines.next()?.trim();
    if status_line.is_empty() {
        return None;
    }

    let server = lines
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("server"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty());

    Some(HttpHead {
        status_line: truncate_banner(status_line, STATUS_LINE_LIMIT),
        server,
    })
}

pub struct HttpDetector {
    tls: bool,
}

impl HttpDetector {
    pub fn http() -> Self {
        Self { tls: false }
    }

    pub fn https() -> Self {
        Self { tls: true }
    }

    fn request(target: &str) -> Vec<u8> {
        format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: reconscope/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            target,
            env!("CARGO_PKG_VERSION")
        )
        .into_bytes()
    }

    async fn exchange<S>(stream: &mut S, request: &[u8], deadline: Duration) -> Result<Vec<u8>, ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_all(stream, request, deadline).await?;
        read_until(stream, RESPONSE_LIMIT, deadline, |buf| {
            buf.windows(4).any(|w| w == b"\r\n\r\n")
        })
        .await
    }
}

#[async_trait]
impl ProtocolDetector for HttpDetector {
    fn name(&self) -> &str {
        if self.tls {
            "HTTPS"
        } else {
            "HTTP"
        }
    }

    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult> {
        let head = parse_http_head(response)?;
        let banner = match &head.server {
            Some(server) => format!("{} - Server: {}", head.status_line, server),
            None => head.status_line.clone(),
        };

        Some(
            ProtocolDetectionResult::matched(self.name())
                .with_version(head.server)
                .with_banner(banner),
        )
    }

    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
        let mut stream = connect(target, port, deadline).await?;
        let request = Self::request(target);

        let response = if self.tls {
            // Reconnaissance only: self-signed and mismatched certificates are fine.
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .use_sni(target.parse::<std::net::IpAddr>().is_err())
                .build()?;
            let connector = tokio_native_tls::TlsConnector::from(connector);

            let mut tls = match timeout(deadline, connector.connect(target, stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => return Err(ProbeError::Tls(e)),
                Err(_) => return Err(ProbeError::Timeout { stage: "tls handshake", timeout: deadline }),
            };
            Self::exchange(&mut tls, &request, deadline).await?
        } else {
            Self::exchange(&mut stream, &request, deadline).await?
        };

        Ok(self.detect(&response))
    }
}
