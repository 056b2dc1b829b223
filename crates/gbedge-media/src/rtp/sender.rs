// RTP/TCP 发送器
// 主动连接平台，PS 包按 1400 字节分片，interleaved 成帧后推送

use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{MediaError, Result};
use crate::ps::PsPacketSink;

use super::{packet, MAX_RTP_PAYLOAD, PS_PAYLOAD_TYPE, RTP_HEADER_LEN};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_BUFFER_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct RtpSenderConfig {
    /// 平台接收地址（SDP c= 行）
    pub remote_host: String,
    /// 平台接收端口（SDP m= 行）
    pub remote_port: u16,
    /// SDP y= 字段原文（十进制），空或非法时随机生成
    pub ssrc_text: String,
}

struct SenderInner {
    stream: Option<TcpStream>,
    seq: u16,
    scratch: Vec<u8>,
}

/// RTP 发送会话。
///
/// 所有发送经由内部锁串行化，序列号因此在线路上单调递增；
/// `shutdown` 之后的发送调用是空操作。
pub struct RtpSender {
    inner: Mutex<SenderInner>,
    ssrc: u32,
    payload_type: u8,
}

impl RtpSender {
    /// 按 SDP 协商结果连接平台。5 秒内未就绪视为失败。
    pub fn connect(config: &RtpSenderConfig) -> Result<Self> {
        if config.remote_host.is_empty() || config.remote_port == 0 {
            return Err(MediaError::InvalidDescriptor(format!(
                "remote {}:{}",
                config.remote_host, config.remote_port
            )));
        }
        let ip: IpAddr = config.remote_host.parse().map_err(|_| {
            MediaError::InvalidDescriptor(format!("invalid remote host {}", config.remote_host))
        })?;
        let addr = SocketAddr::new(ip, config.remote_port);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
        socket
            .connect_timeout(&addr.into(), CONNECT_TIMEOUT)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    MediaError::ConnectTimeout(CONNECT_TIMEOUT)
                } else {
                    MediaError::Io(e)
                }
            })?;
        socket.set_nonblocking(true)?;

        let ssrc = parse_ssrc(&config.ssrc_text);
        let seq = rand::thread_rng().gen::<u16>();
        tracing::info!(
            target: "rtp",
            "connected to platform {}:{}, ssrc={}, initial seq={}",
            config.remote_host,
            config.remote_port,
            ssrc,
            seq
        );

        Ok(Self {
            inner: Mutex::new(SenderInner {
                stream: Some(socket.into()),
                seq,
                scratch: Vec::with_capacity(4 + RTP_HEADER_LEN + MAX_RTP_PAYLOAD),
            }),
            ssrc,
            payload_type: PS_PAYLOAD_TYPE,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// 发送一个 PS 包。超过 1400 字节时分片，所有分片共享时间戳与 SSRC，
    /// 仅 `is_end` 时的最后一个分片置 marker 位。
    pub fn send(&self, ps_packet: &[u8], pts_90k: u64, is_end: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stream.is_none() {
            return Ok(());
        }
        let timestamp = pts_90k as u32;

        let mut offset = 0usize;
        while offset < ps_packet.len() {
            let remaining = ps_packet.len() - offset;
            let chunk_len = remaining.min(MAX_RTP_PAYLOAD);
            let last = remaining <= MAX_RTP_PAYLOAD;
            let marker = last && is_end;

            let seq = inner.seq;
            let header = packet::build_header(self.payload_type, marker, seq, timestamp, self.ssrc);
            let rtp_len = RTP_HEADER_LEN + chunk_len;

            inner.scratch.clear();
            inner
                .scratch
                .extend_from_slice(&packet::interleaved_header(rtp_len));
            inner.scratch.extend_from_slice(&header);
            inner
                .scratch
                .extend_from_slice(&ps_packet[offset..offset + chunk_len]);

            let scratch = std::mem::take(&mut inner.scratch);
            let send_result = {
                let stream = inner.stream.as_mut().unwrap();
                send_all(stream, &scratch)
            };
            inner.scratch = scratch;
            if let Err(e) = send_result {
                tracing::warn!(target: "rtp", "send failed, aborting packet: {}", e);
                return Err(MediaError::Io(e));
            }

            inner.seq = inner.seq.wrapping_add(1);
            offset += chunk_len;
        }
        Ok(())
    }

    /// 关闭连接；之后的发送变为空操作。
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stream) = inner.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            tracing::info!(target: "rtp", "sender shut down");
        }
    }
}

impl PsPacketSink for RtpSender {
    fn send_ps_packet(&self, ps_packet: bytes::Bytes, pts_90k: u64, is_end: bool) -> Result<()> {
        self.send(&ps_packet, pts_90k, is_end)
    }
}

/// 短写续传 + EAGAIN 重试的整包发送。其余错误原样返回。
fn send_all(stream: &mut TcpStream, buf: &[u8]) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "peer stopped accepting data",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// 解析 SDP y= 字段（十进制）。空或非法时按
/// 设备类型(2位) + 厂商(2位) + 序号(6位) 规则随机生成。
pub fn parse_ssrc(text: &str) -> u32 {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        if let Ok(value) = trimmed.parse::<u32>() {
            return value;
        }
        tracing::warn!(target: "rtp", "unparsable ssrc {:?}, falling back to random", text);
    }
    random_ssrc_text().parse().unwrap_or(0x0108_0000)
}

/// 生成 `0108` + 6 位随机数字的 SSRC 文本。
pub fn random_ssrc_text() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("0108{suffix}")
}
