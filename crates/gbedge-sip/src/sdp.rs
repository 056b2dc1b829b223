// SDP 编解码
// 解析平台 offer 的连接/媒体/ssrc 行；生成上行应答与下行对讲 offer

use std::collections::HashMap;

use gbedge_media::g711::G711Law;
use gbedge_media::rtp::sender::random_ssrc_text;

use crate::error::{Result, SipError};

/// 媒体传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpTransport {
    Tcp,
    Udp,
}

/// 平台 SDP 的关键信息。
#[derive(Debug, Clone, Default)]
pub struct SdpDescriptor {
    /// c= 行地址
    pub remote_host: String,
    /// m= 行端口
    pub remote_port: u16,
    /// m= 行媒体类型（video/audio）
    pub media_kind: String,
    /// m= 行协议是否含 TCP
    pub transport: Option<SdpTransport>,
    /// a=setup: 角色
    pub setup: String,
    /// y= 行 SSRC 原文（十进制）
    pub ssrc: String,
    /// a=rtpmap: 负载类型 → 编码名
    pub rtpmap: HashMap<u8, String>,
    /// a=fmtp: 负载类型 → 参数
    pub fmtp: HashMap<u8, String>,
}

impl SdpDescriptor {
    pub fn is_tcp(&self) -> bool {
        self.transport == Some(SdpTransport::Tcp)
    }

    /// 地址为空或端口为 0 的描述不可用。
    pub fn validate(&self) -> Result<()> {
        if self.remote_host.is_empty() || self.remote_port == 0 {
            return Err(SipError::Sdp(format!(
                "unusable remote endpoint {}:{}",
                self.remote_host, self.remote_port
            )));
        }
        Ok(())
    }
}

/// 宽松地解析 SDP 文本，缺失的行留默认值。
pub fn parse(sdp: &str) -> SdpDescriptor {
    let mut desc = SdpDescriptor::default();

    for raw_line in sdp.lines() {
        let line = raw_line.trim();

        if let Some(rest) = line.strip_prefix("c=") {
            // c=IN IP4 111.198.10.15
            let mut parts = rest.split_whitespace();
            if parts.next() == Some("IN") {
                let _addr_type = parts.next();
                if let Some(addr) = parts.next() {
                    desc.remote_host = addr.to_string();
                }
            }
        } else if let Some(rest) = line.strip_prefix("m=") {
            // m=video 30465 TCP/RTP/AVP 96 97 98
            let mut parts = rest.split_whitespace();
            if let Some(kind) = parts.next() {
                desc.media_kind = kind.to_string();
            }
            if let Some(port) = parts.next().and_then(|p| p.parse::<u16>().ok()) {
                desc.remote_port = port;
            }
            if let Some(proto) = parts.next() {
                desc.transport = Some(if proto.contains("TCP") {
                    SdpTransport::Tcp
                } else {
                    SdpTransport::Udp
                });
            }
        } else if let Some(rest) = line.strip_prefix("a=setup:") {
            desc.setup = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            // a=rtpmap:96 PS/90000
            let mut parts = rest.split_whitespace();
            let pt = parts.next().and_then(|p| p.parse::<u8>().ok());
            let encoding = parts.next().and_then(|e| e.split('/').next());
            if let (Some(pt), Some(encoding)) = (pt, encoding) {
                desc.rtpmap.insert(pt, encoding.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let pt = parts.next().and_then(|p| p.parse::<u8>().ok());
            if let (Some(pt), Some(params)) = (pt, parts.next()) {
                desc.fmtp.insert(pt, params.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix("y=") {
            desc.ssrc = rest.trim().to_string();
        }
    }

    desc
}

/// 上行推流应答（设备 → 平台，TCP/PS）。
///
/// 端口按惯例写 9（连接沿信令面约定自建），设备随后主动连接平台
/// 通告的媒体地址。
pub fn build_upstream_answer(device_id: &str, local_ip: &str, ssrc: &str) -> String {
    format!(
        "v=0\r\n\
         o={device_id} 0 0 IN IP4 {local_ip}\r\n\
         s=Play\r\n\
         c=IN IP4 {local_ip}\r\n\
         t=0 0\r\n\
         m=video 9 TCP/RTP/AVP 96\r\n\
         a=sendonly\r\n\
         a=rtpmap:96 PS/90000\r\n\
         a=setup:active\r\n\
         a=connection:new\r\n\
         y={ssrc}\r\n"
    )
}

/// 下行对讲 offer（设备 → 平台，请求平台推送 G.711）。
/// 返回 (SDP 文本, 随机 y=)。
pub fn build_downstream_offer(
    device_id: &str,
    local_ip: &str,
    local_port: u16,
    law: G711Law,
) -> (String, String) {
    let pt = law.payload_type();
    let encoding = match law {
        G711Law::Pcma => "PCMA",
        G711Law::Pcmu => "PCMU",
    };
    let ssrc = random_ssrc_text();
    let sdp = format!(
        "v=0\r\n\
         o={device_id} 0 0 IN IP4 {local_ip}\r\n\
         s=Play\r\n\
         c=IN IP4 {local_ip}\r\n\
         t=0 0\r\n\
         m=audio {local_port} TCP/RTP/AVP {pt} 96\r\n\
         a=setup:active\r\n\
         a=rtpmap:{pt} {encoding}/8000\r\n\
         a=recvonly\r\n\
         f=v/////a/1/8/1\r\n\
         y={ssrc}\r\n"
    );
    (sdp, ssrc)
}
