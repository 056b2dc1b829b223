// PS 复用器
// 把 H.264 接入单元与 G.711 音频帧封装为 PES/PS 包并交给下游发送

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::g711::{self, G711Law};
use crate::nalu::{self, Nalu};

use super::header;
use super::{AUDIO_STREAM_ID, MAX_PES_PAYLOAD_PER_PACKET, VIDEO_STREAM_ID};

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// PS 包下游（通常是 RTP 发送器）。
/// `is_end` 表示该包是一帧关键帧的收尾包，RTP 层据此设置 marker 位。
pub trait PsPacketSink: Send + Sync {
    fn send_ps_packet(&self, packet: Bytes, pts_90k: u64, is_end: bool) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MuxerConfig {
    /// 上行音频使用的 G.711 律
    pub audio_law: G711Law,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            audio_law: G711Law::Pcmu,
        }
    }
}

struct MuxerState {
    sps_cache: Vec<u8>,
    pps_cache: Vec<u8>,
    waiting_for_idr: bool,
    idr_sent: bool,
}

/// PS 复用器。
///
/// 视频流必须以 IDR 开始：首个 IDR 之前的视频帧整帧丢弃，音频在首个 IDR
/// 发出之前同样丢弃，保证解码端总能拿到关键帧锚点。SPS/PPS 随到随缓存，
/// 只在 IDR 帧的 PES 负载中重新注入。
pub struct PsMuxer {
    state: Mutex<MuxerState>,
    audio_law: G711Law,
}

impl PsMuxer {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            state: Mutex::new(MuxerState {
                sps_cache: Vec::new(),
                pps_cache: Vec::new(),
                waiting_for_idr: true,
                idr_sent: false,
            }),
            audio_law: config.audio_law,
        }
    }

    /// 写入一帧 Annex-B 视频（90kHz PTS），返回交给下游的 PS 包数量。
    pub fn write_video_frame(
        &self,
        frame: &[u8],
        pts_90k: u64,
        sink: &dyn PsPacketSink,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();

        let nalus = nalu::split_annex_b(frame);
        if nalus.is_empty() {
            tracing::warn!(target: "ps", "video frame without start code, dropped");
            return Ok(0);
        }

        let mut slices: Vec<Nalu> = Vec::new();
        let mut idr_units: Vec<Nalu> = Vec::new();
        let mut frame_sps: Option<Nalu> = None;
        let mut frame_pps: Option<Nalu> = None;

        for unit in &nalus {
            match unit.kind {
                nalu::NALU_TYPE_SLICE => slices.push(*unit),
                nalu::NALU_TYPE_IDR => idr_units.push(*unit),
                nalu::NALU_TYPE_SEI => {}
                nalu::NALU_TYPE_SPS => {
                    frame_sps = Some(*unit);
                    state.sps_cache = unit.payload(frame).to_vec();
                }
                nalu::NALU_TYPE_PPS => {
                    frame_pps = Some(*unit);
                    state.pps_cache = unit.payload(frame).to_vec();
                }
                _ => {}
            }
        }

        if state.waiting_for_idr {
            if idr_units.is_empty() {
                tracing::debug!(target: "ps", "waiting for first IDR, frame dropped");
                return Ok(0);
            }
            state.waiting_for_idr = false;
            tracing::info!(target: "ps", "first IDR received, stream started");
        }

        if !idr_units.is_empty() {
            // SPS/PPS 优先取本帧携带的，否则用缓存
            let sps: &[u8] = match frame_sps {
                Some(n) => n.payload(frame),
                None => &state.sps_cache,
            };
            let pps: &[u8] = match frame_pps {
                Some(n) => n.payload(frame),
                None => &state.pps_cache,
            };
            if sps.is_empty() || pps.is_empty() {
                tracing::warn!(target: "ps", "no SPS/PPS available, IDR frame dropped");
                return Ok(0);
            }

            let mut payload =
                Vec::with_capacity(sps.len() + pps.len() + frame.len() + 3 * START_CODE.len());
            payload.extend_from_slice(&START_CODE);
            payload.extend_from_slice(sps);
            payload.extend_from_slice(&START_CODE);
            payload.extend_from_slice(pps);
            for idr in &idr_units {
                payload.extend_from_slice(&START_CODE);
                payload.extend_from_slice(idr.payload(frame));
            }

            let sent = emit_pes(VIDEO_STREAM_ID, &payload, pts_90k, true, sink)?;
            state.idr_sent = true;
            Ok(sent)
        } else if !slices.is_empty() {
            let mut payload = Vec::with_capacity(frame.len());
            for unit in &slices {
                payload.extend_from_slice(&START_CODE);
                payload.extend_from_slice(unit.payload(frame));
            }
            emit_pes(VIDEO_STREAM_ID, &payload, pts_90k, false, sink)
        } else {
            tracing::debug!(target: "ps", "frame carries neither IDR nor slice, dropped");
            Ok(0)
        }
    }

    /// 写入一帧 8 位线性 PCM 音频（90kHz PTS）。
    /// 首个 IDR 发出前丢弃；样本按 `(s - 128) << 8` 提升为 16 位后编码为 G.711。
    pub fn write_audio_frame(
        &self,
        pcm8: &[u8],
        pts_90k: u64,
        sink: &dyn PsPacketSink,
    ) -> Result<usize> {
        let state = self.state.lock().unwrap();
        if !state.idr_sent {
            tracing::debug!(target: "ps", "audio before first IDR, dropped");
            return Ok(0);
        }

        let pcm16: Vec<i16> = pcm8.iter().map(|&s| ((s as i16) - 128) << 8).collect();
        let encoded = g711::encode(self.audio_law, &pcm16);
        emit_pes(AUDIO_STREAM_ID, &encoded, pts_90k, false, sink)
    }

    /// 复位：清空参数集缓存，回到等待 IDR 状态。
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.sps_cache.clear();
        state.pps_cache.clear();
        state.waiting_for_idr = true;
        state.idr_sent = false;
        tracing::info!(target: "ps", "muxer released");
    }

    pub fn is_idr_sent(&self) -> bool {
        self.state.lock().unwrap().idr_sent
    }

    pub fn is_waiting_for_idr(&self) -> bool {
        self.state.lock().unwrap().waiting_for_idr
    }
}

/// PES 负载 → 一个或多个 PS 包。
///
/// 负载超过单包上限时按 1300 字节切片，每片带独立 PES 头（同一 PTS）；
/// 关键帧的 System Header + PSM 跟随 key 标志所在的包（即收尾片）。
fn emit_pes(
    stream_id: u8,
    payload: &[u8],
    pts_90k: u64,
    is_key_frame: bool,
    sink: &dyn PsPacketSink,
) -> Result<usize> {
    if payload.is_empty() {
        return Ok(0);
    }

    let mut sent = 0usize;
    let mut offset = 0usize;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let chunk_len = remaining.min(MAX_PES_PAYLOAD_PER_PACKET);
        let last = remaining <= MAX_PES_PAYLOAD_PER_PACKET;
        let key = is_key_frame && last;

        let chunk = &payload[offset..offset + chunk_len];
        let pes_header = header::pes_header(stream_id, chunk.len(), pts_90k, key);

        let mut ps_packet = BytesMut::with_capacity(14 + 20 + 24 + pes_header.len() + chunk.len());
        ps_packet.extend_from_slice(&header::pack_header(pts_90k));
        if key {
            ps_packet.extend_from_slice(&header::system_header());
            ps_packet.extend_from_slice(&header::program_stream_map());
        }
        ps_packet.extend_from_slice(&pes_header);
        ps_packet.extend_from_slice(chunk);

        sink.send_ps_packet(ps_packet.freeze(), pts_90k, key)?;
        sent += 1;
        offset += chunk_len;
    }
    Ok(sent)
}
