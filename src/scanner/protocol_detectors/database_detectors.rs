// Database protocol detectors (MySQL, PostgreSQL, Redis, MongoDB).
//
// These are byte-pattern heuristics for naming a service, nothing more.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::time::Duration;

use super::{connect, first_line, read_some, read_until, write_all, ProtocolDetectionResult, ProtocolDetector};
use crate::error::ProbeError;

lazy_static! {
    static ref REDIS_VERSION: Regex = Regex::new(r"redis_version:([^\r\n]+)").unwrap();
}

/// Protocol version byte that opens a MySQL initial handshake payload.
const MYSQL_HANDSHAKE_V10: u8 = 0x0a;

/// Length 8 followed by request code 1234/5679. Any PostgreSQL server answers
/// it with a single byte before authentication starts.
const POSTGRES_PROBE: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

const REDIS_PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";
const REDIS_INFO: &[u8] = b"*1\r\n$4\r\nINFO\r\n";

pub struct MySqlDetector;

impl MySqlDetector {
    /// Server version string from an initial handshake packet: 3-byte length,
    /// sequence id, protocol version, then a NUL-terminated version string.
    pub fn handshake_version(packet: &[u8]) -> Option<String> {
        if packet.len() < 5 || packet[4] != MYSQL_HANDSHAKE_V10 {
            return None;
        }
        let rest = &packet[5..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let version = &rest[..end];
        if version.is_empty() || !version.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return None;
        }
        Some(String::from_utf8_lossy(version).into_owned())
    }
}

#[async_trait]
impl ProtocolDetector for MySqlDetector {
    fn name(&self) -> &str {
        "MySQL"
    }

    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult> {
        if response.len() < 5 || response[4] != MYSQL_HANDSHAKE_V10 {
            return None;
        }
        let version = Self::handshake_version(response);
        let banner = match &version {
            Some(v) => format!("MySQL {v}"),
            None => "MySQL".to_string(),
        };
        Some(ProtocolDetectionResult::matched("MySQL").with_version(version).with_banner(banner))
    }

    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
        let mut stream = connect(target, port, deadline).await?;
        let handshake = read_some(&mut stream, 1024, deadline).await?;
        Ok(self.detect(&handshake))
    }
}

pub struct PostgresDetector;

#[async_trait]
impl ProtocolDetector for PostgresDetector {
    fn name(&self) -> &str {
        "PostgreSQL"
    }

    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult> {
        if response.is_empty() {
            return None;
        }
        Some(ProtocolDetectionResult::matched("PostgreSQL").with_banner("PostgreSQL server"))
    }

    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
        let mut stream = connect(target, port, deadline).await?;
        write_all(&mut stream, &POSTGRES_PROBE, deadline).await?;

        match read_some(&mut stream, 64, deadline).await {
            Ok(reply) => Ok(self.detect(&reply)),
            // Some builds hang up on the request instead of answering it.
            Err(e) if e.is_connection_reset() => Ok(Some(
                ProtocolDetectionResult::matched("PostgreSQL").with_banner("PostgreSQL server"),
            )),
            Err(e) => Err(e),
        }
    }
}

pub struct RedisDetector;

impl RedisDetector {
    pub fn info_version(info: &str) -> Option<String> {
        REDIS_VERSION
            .captures(info)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl ProtocolDetector for RedisDetector {
    fn name(&self) -> &str {
        "Redis"
    }

    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult> {
        let line = first_line(response);
        if !line.starts_with('+') && !line.contains("PONG") {
            return None;
        }
        Some(ProtocolDetectionResult::matched("Redis").with_banner("Redis server"))
    }

    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
        let mut stream = connect(target, port, deadline).await?;
        write_all(&mut stream, REDIS_PING, deadline).await?;
        let pong = read_until(&mut stream, 512, deadline, |buf| buf.contains(&b'\n')).await?;

        let Some(detected) = self.detect(&pong) else {
            return Ok(None);
        };

        // The PING already identified the service; INFO only adds a version.
        let info = match write_all(&mut stream, REDIS_INFO, deadline).await {
            Ok(()) => read_until(&mut stream, 16 * 1024, deadline, |buf| {
                REDIS_VERSION.is_match(&String::from_utf8_lossy(buf))
                    && buf.ends_with(b"\n")
            })
            .await
            .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        Ok(Some(match Self::info_version(&String::from_utf8_lossy(&info)) {
            Some(version) => detected
                .with_banner(format!("Redis {version}"))
                .with_version(Some(version)),
            None => detected,
        }))
    }
}

pub struct MongoDbDetector;

impl MongoDbDetector {
    /// Legacy OP_QUERY `{isMaster: 1}` against `admin.$cmd`.
    pub fn is_master_query() -> Vec<u8> {
        let mut element = vec![0x10]; // int32
        element.extend_from_slice(b"isMaster\0");
        element.extend_from_slice(&1i32.to_le_bytes());

        let document_len = 4 + element.len() + 1;
        let mut document = (document_len as i32).to_le_bytes().to_vec();
        document.extend(element);
        document.push(0);

        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes()); // flags
        body.extend_from_slice(b"admin.$cmd\0");
        body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
        body.extend_from_slice(&1i32.to_le_bytes()); // numberToReturn
        body.extend(document);

        let mut message = ((16 + body.len()) as i32).to_le_bytes().to_vec();
        message.extend_from_slice(&1i32.to_le_bytes()); // requestID
        message.extend_from_slice(&0i32.to_le_bytes()); // responseTo
        message.extend_from_slice(&2004i32.to_le_bytes()); // OP_QUERY
        message.extend(body);
        message
    }
}

#[async_trait]
impl ProtocolDetector for MongoDbDetector {
    fn name(&self) -> &str {
        "MongoDB"
    }

    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult> {
        if response.is_empty() {
            return None;
        }
        Some(ProtocolDetectionResult::matched("MongoDB").with_banner("MongoDB server"))
    }

    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
        let mut stream = connect(target, port, deadline).await?;
        write_all(&mut stream, &Self::is_master_query(), deadline).await?;
        let reply = read_some(&mut stream, 1024, deadline).await?;
        Ok(self.detect(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::protocol_detectors::test_support::fake_server;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn mysql_handshake(version: &str) -> Vec<u8> {
        let mut payload = vec![MYSQL_HANDSHAKE_V10];
        payload.extend_from_slice(version.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&[0x08, 0x00, 0x00, 0x00]); // thread id
        let mut packet = (payload.len() as u32).to_le_bytes()[..3].to_vec();
        packet.push(0); // sequence id
        packet.extend(payload);
        packet
    }

    #[test]
    fn test_mysql_handshake_version() {
        let packet = mysql_handshake("8.0.36");
        assert_eq!(MySqlDetector::handshake_version(&packet).as_deref(), Some("8.0.36"));

        let result = MySqlDetector.detect(&packet).unwrap();
        assert_eq!(result.banner.as_deref(), Some("MySQL 8.0.36"));
        assert_eq!(result.version.as_deref(), Some("8.0.36"));
    }

    #[test]
    fn test_mysql_rejects_other_marker() {
        // Error packet (0xff) sent to hosts that may not connect.
        let packet = [0x17, 0x00, 0x00, 0x00, 0xff, 0x6a, 0x04, b'H', b'o', b's', b't'];
        assert!(MySqlDetector.detect(&packet).is_none());
        assert!(MySqlDetector.detect(&[0x01, 0x02]).is_none());
    }

    #[test]
    fn test_redis_detect_and_version() {
        assert!(RedisDetector.detect(b"+PONG\r\n").is_some());
        assert!(RedisDetector.detect(b"-NOAUTH Authentication required.\r\n").is_none());

        let info = "# Server\r\nredis_version:7.2.4\r\nredis_git_sha1:00000000\r\n";
        assert_eq!(RedisDetector::info_version(info).as_deref(), Some("7.2.4"));
        assert_eq!(RedisDetector::info_version("# Server\r\n"), None);
    }

    #[test]
    fn test_mongodb_query_lengths() {
        let query = MongoDbDetector::is_master_query();
        assert_eq!(query.len(), 58);
        assert_eq!(i32::from_le_bytes([query[0], query[1], query[2], query[3]]), 58);
        assert_eq!(i32::from_le_bytes([query[12], query[13], query[14], query[15]]), 2004);

        // Document starts after header, flags, collection name, skip and return.
        let doc = 16 + 4 + "admin.$cmd\0".len() + 8;
        assert_eq!(i32::from_le_bytes([query[doc], query[doc + 1], query[doc + 2], query[doc + 3]]), 19);
        assert_eq!(query.last(), Some(&0));
    }

    #[tokio::test]
    async fn test_mysql_probe_reads_handshake() {
        let port = fake_server(Some(mysql_handshake("5.7.44-log")), vec![]).await;
        let result = MySqlDetector
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.version.as_deref(), Some("5.7.44-log"));
    }

    #[tokio::test]
    async fn test_postgres_probe_any_reply() {
        let port = fake_server(None, vec![b"N".to_vec()]).await;
        let result = PostgresDetector
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.service_name.as_deref(), Some("PostgreSQL"));
        assert_eq!(result.banner.as_deref(), Some("PostgreSQL server"));
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_postgres_probe_reset_counts_as_match() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 4];
            socket.read_exact(&mut head).await.unwrap();
            // Zero linger turns the close into a reset.
            socket.set_linger(Some(Duration::ZERO)).unwrap();
        });

        let result = PostgresDetector
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.service_name.as_deref(), Some("PostgreSQL"));
        assert_eq!(result.banner.as_deref(), Some("PostgreSQL server"));
    }

    #[tokio::test]
    async fn test_redis_probe_with_info() {
        let port = fake_server(
            None,
            vec![
                b"+PONG\r\n".to_vec(),
                b"$40\r\n# Server\r\nredis_version:6.2.14\r\nos:Linux\r\n".to_vec(),
            ],
        )
        .await;
        let result = RedisDetector
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.version.as_deref(), Some("6.2.14"));
        assert_eq!(result.banner.as_deref(), Some("Redis 6.2.14"));
    }

    #[tokio::test]
    async fn test_redis_probe_without_info_keeps_match() {
        let port = fake_server(None, vec![b"+PONG\r\n".to_vec()]).await;
        let result = RedisDetector
            .probe("127.0.0.1", port, Duration::from_millis(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.service_name.as_deref(), Some("Redis"));
        assert_eq!(result.banner.as_deref(), Some("Redis server"));
        assert!(result.version.is_none());
    }

    #[tokio::test]
    async fn test_mongodb_probe_non_empty_reply() {
        let port = fake_server(None, vec![vec![0x24, 0x00, 0x00, 0x00, 0x01]]).await;
        let result = MongoDbDetector
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.banner.as_deref(), Some("MongoDB server"));
    }
}
