// gbedge-media: GB28181 边缘设备媒体面
//
// 上行：H.264 接入单元 + G.711 音频帧 → PS 复用 → RTP/TCP 推送到平台
// 下行：平台推送的 G.711 语音 → 环形缓冲 → 重同步分帧 → 回调

pub mod audio;
pub mod buffer;
pub mod error;
pub mod g711;
pub mod nalu;
pub mod ps;
pub mod rtp;

pub use error::{MediaError, Result};
