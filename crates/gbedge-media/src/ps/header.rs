// PS 流各级包头的字节构造
// 所有字段布局与标记位按 GB28181 推流模板固定

use super::{AUDIO_STREAM_ID, STREAM_TYPE_G711, STREAM_TYPE_H264, VIDEO_STREAM_ID};

/// 构造 14 字节 PS Pack Header。
///
/// SCR 复用 PTS 的低 33 位，6 字节编码中第 4/6/8 字节在 bit2、第 9 字节在
/// bit0 各有一个 marker 位；随后 4 字节为最大码流率模板 `FF FF FC 00`。
pub fn pack_header(pts_90k: u64) -> [u8; 14] {
    let mut hdr = [0u8; 14];
    hdr[0] = 0x00;
    hdr[1] = 0x00;
    hdr[2] = 0x01;
    hdr[3] = 0xBA;

    let scr = pts_90k & 0x1_FFFF_FFFF;
    let scr_ext: u64 = 0;
    hdr[4] = 0x40                       // '01' 起始标记
        | ((scr >> 27) & 0x38) as u8    // scr[32:30]
        | 0x04                          // marker
        | ((scr >> 28) & 0x03) as u8;   // scr[29:28]
    hdr[5] = ((scr >> 20) & 0xFF) as u8;
    hdr[6] = ((scr >> 12) & 0xF8) as u8 // scr[19:15]
        | 0x04
        | ((scr >> 13) & 0x03) as u8;   // scr[14:13]
    hdr[7] = ((scr >> 5) & 0xFF) as u8;
    hdr[8] = ((scr << 3) & 0xF8) as u8  // scr[4:0]
        | 0x04
        | ((scr_ext >> 7) & 0x03) as u8;
    hdr[9] = ((scr_ext << 1) & 0xFE) as u8 | 0x01;

    // program mux rate 取最大值模板，外加 5 个填充位
    hdr[10] = 0xFF;
    hdr[11] = 0xFF;
    hdr[12] = 0xFC;
    hdr[13] = 0x00;
    hdr
}

/// 构造 20 字节 System Header（固定模板 + 两路流的 buffer bound）。
pub fn system_header() -> [u8; 20] {
    [
        0x00, 0x00, 0x01, 0xBB, // 起始码
        0x00, 0x0C, // 后续长度 = 12
        0x80, // marker
        0x04, 0xFF, 0xFF, // 最大码率
        0xE0, 0x07, 0xC0, 0x0F, // 预留
        VIDEO_STREAM_ID,
        0x20, 0x00, // 视频 buffer bound
        AUDIO_STREAM_ID,
        0x01, 0x00, // 音频 buffer bound
    ]
}

/// 构造 Program Stream Map：H.264(0x1B)/0xE0 与 G.711(0x91)/0xBD 两条 ES 记录，
/// 末尾 4 字节为对 `[4, crc)` 区间的 CRC-32（反射多项式 0xEDB88320），大端存放。
pub fn program_stream_map() -> Vec<u8> {
    let mut psm = vec![0x00, 0x00, 0x01, 0xBC];

    // 长度占位，回填
    let length_pos = psm.len();
    psm.extend_from_slice(&[0x00, 0x00]);

    psm.push(0xE0); // current_next(1) + version(00000) + 保留(11)... 模板值
    psm.push(0xFF); // 保留 + marker

    // program stream info length = 0
    psm.extend_from_slice(&[0x00, 0x00]);

    // elementary stream map length：每条流 4 字节
    let es_map_length: u16 = 8;
    psm.extend_from_slice(&es_map_length.to_be_bytes());

    psm.push(STREAM_TYPE_H264);
    psm.push(VIDEO_STREAM_ID);
    psm.extend_from_slice(&[0x00, 0x00]); // ES info length

    psm.push(STREAM_TYPE_G711);
    psm.push(AUDIO_STREAM_ID);
    psm.extend_from_slice(&[0x00, 0x00]);

    let crc_pos = psm.len();
    psm.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

    let psm_length = (psm.len() - length_pos - 2) as u16;
    psm[length_pos..length_pos + 2].copy_from_slice(&psm_length.to_be_bytes());

    let crc = crc32(&psm[4..crc_pos]);
    psm[crc_pos..].copy_from_slice(&crc.to_be_bytes());
    psm
}

/// 构造 14 字节 PES 头。
///
/// 长度字段 = 可选字段(8) + 负载；超过 0xFFFF 时写 0 表示不定长，绝不回绕。
/// 关键帧设置 data_alignment（0x87），否则 0x83；第二标志 0x80 表示仅含 PTS。
pub fn pes_header(stream_id: u8, payload_len: usize, pts_90k: u64, is_key_frame: bool) -> [u8; 14] {
    let total_len = 8 + payload_len;
    let len_field: u16 = if total_len > 0xFFFF { 0 } else { total_len as u16 };

    let mut hdr = [0u8; 14];
    hdr[0] = 0x00;
    hdr[1] = 0x00;
    hdr[2] = 0x01;
    hdr[3] = stream_id;
    hdr[4] = (len_field >> 8) as u8;
    hdr[5] = (len_field & 0xFF) as u8;
    hdr[6] = if is_key_frame { 0x87 } else { 0x83 };
    hdr[7] = 0x80; // 仅 PTS
    hdr[8] = 0x05; // PTS 占 5 字节

    let pts = pts_90k & 0x1_FFFF_FFFF;
    hdr[9] = 0x20 | ((pts >> 29) & 0x0E) as u8 | 0x01; // '0010' + pts[32:30] + marker
    hdr[10] = ((pts >> 22) & 0xFF) as u8; //               pts[29:22]
    hdr[11] = ((pts >> 14) & 0xFE) as u8 | 0x01; //        pts[21:15] + marker
    hdr[12] = ((pts >> 7) & 0xFF) as u8; //                pts[14:7]
    hdr[13] = ((pts << 1) & 0xFE) as u8 | 0x01; //         pts[6:0] + marker
    hdr
}

/// 从 PES 头的 5 字节 PTS 字段还原 33 位时间戳。
pub fn decode_pes_pts(field: &[u8; 5]) -> u64 {
    (((field[0] as u64) & 0x0E) << 29)
        | ((field[1] as u64) << 22)
        | (((field[2] as u64) & 0xFE) << 14)
        | ((field[3] as u64) << 7)
        | ((field[4] as u64) >> 1)
}

/// 位反射 CRC-32（多项式 0xEDB88320）。
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc ^ 0xFFFF_FFFF
}
