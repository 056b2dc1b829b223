// RTP 发送
// packet: 头部与 TCP interleaved 成帧；sender: 分片 + 非阻塞 TCP 推送

pub mod packet;
pub mod sender;

pub use sender::{RtpSender, RtpSenderConfig};

/// PS 流的动态负载类型
pub const PS_PAYLOAD_TYPE: u8 = 96;

/// 单个 RTP 包的负载上限（PS 分片大小）
pub const MAX_RTP_PAYLOAD: usize = 1400;

/// RTP 固定头长度
pub const RTP_HEADER_LEN: usize = 12;
