// SIP/TCP 连接
// 单条到平台的长连接；读超时 100ms 充当事件循环的等待量程，
// 按 Content-Length 做增量成帧

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::{Result, SipError};

/// 事件等待量程
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

pub struct SipConnection {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl SipConnection {
    /// 连接平台信令地址。
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        stream.set_nodelay(true)?;
        tracing::info!(target: "sip", "signalling connected to {}", addr);
        Ok(Self {
            stream,
            buf: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// 等待一条完整消息，至多阻塞一个量程（100ms）。
    /// 量程内无数据返回 `None`；对端关闭返回 `Disconnected`。
    pub fn poll_message(&mut self) -> Result<Option<String>> {
        if let Some(msg) = self.extract_message()? {
            return Ok(Some(msg));
        }

        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(SipError::Disconnected),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                self.extract_message()
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(SipError::Io(e)),
        }
    }

    /// 发送一段报文（流为阻塞写）。
    pub fn send(&mut self, data: &str) -> Result<()> {
        self.stream.write_all(data.as_bytes())?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// 从缓冲中切出一条完整 SIP 消息（头部 + Content-Length 字节的正文）。
    fn extract_message(&mut self) -> Result<Option<String>> {
        // 丢掉保活用的空行
        let skip = self
            .buf
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        if skip > 0 {
            self.buf.drain(..skip);
        }

        let Some(head_end) = find_subsequence(&self.buf, b"\r\n\r\n") else {
            return Ok(None);
        };

        let head = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|_| SipError::Parse("non-utf8 header block".into()))?;
        let content_length = parse_content_length(head);

        let total = head_end + 4 + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let message = String::from_utf8(self.buf.drain(..total).collect())
            .map_err(|_| SipError::Parse("non-utf8 message body".into()))?;
        Ok(Some(message))
    }
}

fn parse_content_length(head: &str) -> usize {
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (SipConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = SipConnection::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (conn, peer)
    }

    #[test]
    fn test_poll_times_out_quickly() {
        let (mut conn, _peer) = pair();
        let begin = std::time::Instant::now();
        assert!(conn.poll_message().unwrap().is_none());
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_frames_message_with_body() {
        let (mut conn, mut peer) = pair();
        let wire = "MESSAGE sip:x SIP/2.0\r\nCall-ID: a1\r\nContent-Length: 5\r\n\r\nhello";
        peer.write_all(wire.as_bytes()).unwrap();

        let mut got = None;
        for _ in 0..20 {
            if let Some(msg) = conn.poll_message().unwrap() {
                got = Some(msg);
                break;
            }
        }
        assert_eq!(got.as_deref(), Some(wire));
    }

    #[test]
    fn test_frames_two_pipelined_messages() {
        let (mut conn, mut peer) = pair();
        let first = "SIP/2.0 200 OK\r\nCSeq: 1 REGISTER\r\nContent-Length: 0\r\n\r\n";
        let second = "BYE sip:x SIP/2.0\r\nCall-ID: b2\r\nContent-Length: 0\r\n\r\n";
        peer.write_all(format!("{first}{second}").as_bytes()).unwrap();

        let mut messages = Vec::new();
        for _ in 0..20 {
            if let Some(msg) = conn.poll_message().unwrap() {
                messages.push(msg);
                if messages.len() == 2 {
                    break;
                }
            }
        }
        assert_eq!(messages, vec![first.to_string(), second.to_string()]);
    }

    #[test]
    fn test_partial_message_waits_for_rest() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"MESSAGE sip:x SIP/2.0\r\nContent-Le").unwrap();
        assert!(conn.poll_message().unwrap().is_none());

        peer.write_all(b"ngth: 2\r\n\r\nok").unwrap();
        let mut got = None;
        for _ in 0..20 {
            if let Some(msg) = conn.poll_message().unwrap() {
                got = Some(msg);
                break;
            }
        }
        assert!(got.unwrap().ends_with("\r\n\r\nok"));
    }

    #[test]
    fn test_keepalive_crlf_skipped() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"\r\n\r\nSIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();

        let mut got = None;
        for _ in 0..20 {
            if let Some(msg) = conn.poll_message().unwrap() {
                got = Some(msg);
                break;
            }
        }
        assert!(got.unwrap().starts_with("SIP/2.0 200 OK"));
    }

    #[test]
    fn test_peer_close_reports_disconnected() {
        let (mut conn, peer) = pair();
        drop(peer);

        let mut saw_disconnect = false;
        for _ in 0..20 {
            match conn.poll_message() {
                Err(SipError::Disconnected) => {
                    saw_disconnect = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_disconnect);
    }
}
