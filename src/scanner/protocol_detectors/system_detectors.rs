// SSH identification and the generic banner grab used for every port without
// a dedicated handler.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::time::Duration;

use super::{
    connect, first_line, read_some, read_until, truncate_banner, write_all, ProtocolDetectionResult,
    ProtocolDetector,
};
use crate::error::ProbeError;

/// Confidence when a generic banner contains a protocol keyword.
pub const KEYWORD_CONFIDENCE: f32 = 0.6;
/// Confidence when a banner was read but nothing in it was recognised.
pub const BANNER_ONLY_CONFIDENCE: f32 = 0.3;

const BANNER_READ_LIMIT: usize = 1024;

lazy_static! {
    // SSH-<protoversion>-<softwareversion> [comments]
    static ref SSH_IDENT: Regex = Regex::new(r"SSH-([0-9][0-9.]*)-(\S+)").unwrap();
}

/// Checked in order; the first keyword found in the lower-cased banner wins.
const BANNER_KEYWORDS: &[(&str, &str)] = &[
    ("ftp", "FTP"),
    ("smtp", "SMTP"),
    ("pop3", "POP3"),
    ("imap", "IMAP"),
    ("http", "HTTP"),
    ("ssh", "SSH"),
];

pub struct SshDetector;

impl SshDetector {
    /// Version from the software field of an identification line, so
    /// `SSH-2.0-OpenSSH_8.9p1 Ubuntu` gives `8.9p1`.
    pub fn version(line: &str) -> Option<String> {
        let software = SSH_IDENT.captures(line)?.get(2)?.as_str();
        let version = match software.split_once('_') {
            Some((_, version)) => version,
            None => software,
        };
        (!version.is_empty()).then(|| version.to_string())
    }
}

#[async_trait]
impl ProtocolDetector for SshDetector {
    fn name(&self) -> &str {
        "SSH"
    }

    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult> {
        let line = first_line(response);
        if !line.contains("SSH-") {
            return None;
        }

        Some(
            ProtocolDetectionResult::matched("SSH")
                .with_version(Self::version(&line))
                .with_banner(line),
        )
    }

    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
        let mut stream = connect(target, port, deadline).await?;
        let greeting = read_until(&mut stream, 255, deadline, |buf| buf.contains(&b'\n')).await?;
        Ok(self.detect(&greeting))
    }
}

/// Read whatever the service volunteers, nudging it once with a line
/// terminator if it stays quiet, and classify the text by keyword.
pub struct BannerGrabber {
    banner_limit: usize,
}

impl BannerGrabber {
    pub fn new(banner_limit: usize) -> Self {
        Self { banner_limit }
    }

    /// Collapse a raw banner onto one line and clamp it.
    pub fn clean(&self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        let flat = text.replace('\r', "").replace('\n', " ");
        truncate_banner(flat.trim(), self.banner_limit)
    }

    async fn read_quietly(
        stream: &mut tokio::net::TcpStream,
        deadline: Duration,
    ) -> Result<Vec<u8>, ProbeError> {
        match read_some(stream, BANNER_READ_LIMIT, deadline).await {
            Err(ProbeError::Timeout { .. }) => Ok(Vec::new()),
            other => other,
        }
    }
}

impl Default for BannerGrabber {
    fn default() -> Self {
        Self::new(200)
    }
}

#[async_trait]
impl ProtocolDetector for BannerGrabber {
    fn name(&self) -> &str {
        "banner"
    }

    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult> {
        let banner = self.clean(response);
        if banner.is_empty() {
            return None;
        }

        let lowered = banner.to_lowercase();
        let service = BANNER_KEYWORDS
            .iter()
            .find(|(keyword, _)| lowered.contains(keyword))
            .map(|(_, service)| service.to_string());

        let confidence = if service.is_some() {
            KEYWORD_CONFIDENCE
        } else {
            BANNER_ONLY_CONFIDENCE
        };

        Some(ProtocolDetectionResult {
            service_name: service,
            confidence,
            version: None,
            banner: Some(banner),
        })
    }

    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
        let mut stream = connect(target, port, deadline).await?;

        // Only a quiet peer gets the line terminator; an empty read is EOF.
        let data = match read_some(&mut stream, BANNER_READ_LIMIT, deadline).await {
            Ok(data) => data,
            Err(ProbeError::Timeout { .. }) => {
                write_all(&mut stream, b"\r\n", deadline).await?;
                Self::read_quietly(&mut stream, deadline).await?
            }
            Err(e) => return Err(e),
        };

        Ok(self.detect(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::protocol_detectors::test_support::{fake_server, silent_server};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn test_ssh_version_from_software_field() {
        assert_eq!(SshDetector::version("SSH-2.0-OpenSSH_8.9").as_deref(), Some("8.9"));
        assert_eq!(
            SshDetector::version("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1").as_deref(),
            Some("8.9p1")
        );
        assert_eq!(SshDetector::version("SSH-2.0-dropbear").as_deref(), Some("dropbear"));
        assert_eq!(SshDetector::version("HTTP/1.1 200 OK"), None);
    }

    #[test]
    fn test_ssh_detect() {
        let result = SshDetector.detect(b"SSH-2.0-OpenSSH_8.9\r\n").unwrap();
        assert_eq!(result.service_name.as_deref(), Some("SSH"));
        assert_eq!(result.version.as_deref(), Some("8.9"));
        assert_eq!(result.banner.as_deref(), Some("SSH-2.0-OpenSSH_8.9"));

        assert!(SshDetector.detect(b"220 mail.example.org ESMTP\r\n").is_none());
    }

    #[test]
    fn test_banner_keywords_in_order() {
        let grabber = BannerGrabber::default();

        let ftp = grabber.detect(b"220 ProFTPD Server ready\r\n").unwrap();
        assert_eq!(ftp.service_name.as_deref(), Some("FTP"));
        assert_eq!(ftp.confidence, KEYWORD_CONFIDENCE);

        // "ftp" is checked before "smtp".
        let both = grabber.detect(b"220 smtp and ftp gateway").unwrap();
        assert_eq!(both.service_name.as_deref(), Some("FTP"));

        let unknown = grabber.detect(b"\x00\x01hello there\r\n").unwrap();
        assert!(unknown.service_name.is_none());
        assert_eq!(unknown.confidence, BANNER_ONLY_CONFIDENCE);

        assert!(grabber.detect(b"  \r\n").is_none());
    }

    #[test]
    fn test_banner_cleaned_and_truncated() {
        let grabber = BannerGrabber::new(10);
        assert_eq!(grabber.clean(b"line one\r\nline two\r\n"), "line one l...");
        assert_eq!(BannerGrabber::default().clean(b" +OK POP3 ready\r\n"), "+OK POP3 ready");
    }

    #[tokio::test]
    async fn test_ssh_probe_against_fake_server() {
        let port = fake_server(Some(b"SSH-2.0-OpenSSH_8.9\r\n".to_vec()), vec![]).await;
        let result = SshDetector
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.version.as_deref(), Some("8.9"));
    }

    #[tokio::test]
    async fn test_banner_grab_nudges_quiet_service() {
        // Says nothing until it receives a line terminator.
        let port = fake_server(None, vec![b"+OK POP3 server ready\r\n".to_vec()]).await;
        let result = BannerGrabber::default()
            .probe("127.0.0.1", port, Duration::from_millis(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.service_name.as_deref(), Some("POP3"));
    }

    #[tokio::test]
    async fn test_banner_grab_leaves_closed_peer_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.shutdown().await.unwrap();
            let mut received = Vec::new();
            let _ = socket.read_to_end(&mut received).await;
            let _ = tx.send(received);
        });

        let result = BannerGrabber::default()
            .probe("127.0.0.1", port, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(rx.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_banner_grab_silent_service_yields_nothing() {
        let port = silent_server().await;
        let result = BannerGrabber::default()
            .probe("127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
