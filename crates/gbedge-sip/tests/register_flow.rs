// 端到端信令：模拟平台驱动注册鉴权、拉流与语音广播全流程

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gbedge_sip::agent::{AgentCallbacks, AgentConfig, MediaEdgeAgent, RegisterState};
use gbedge_sip::device::DeviceIdentity;

struct MockPlatform {
    listener: TcpListener,
    signalling: Option<TcpStream>,
    buf: Vec<u8>,
}

impl MockPlatform {
    fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        Self {
            listener,
            signalling: None,
            buf: Vec::new(),
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    fn accept_signalling(&mut self) {
        let (stream, _) = self.listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        self.signalling = Some(stream);
    }

    /// 按 Content-Length 成帧收一条完整 SIP 消息。
    fn recv(&mut self) -> String {
        let stream = self.signalling.as_mut().expect("signalling accepted");
        loop {
            let skip = self
                .buf
                .iter()
                .take_while(|&&b| b == b'\r' || b == b'\n')
                .count();
            if skip > 0 {
                self.buf.drain(..skip);
            }
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8(self.buf[..pos].to_vec()).unwrap();
                let content_length = head
                    .split("\r\n")
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.trim()
                            .eq_ignore_ascii_case("Content-Length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                let total = pos + 4 + content_length;
                if self.buf.len() >= total {
                    let msg: Vec<u8> = self.buf.drain(..total).collect();
                    return String::from_utf8(msg).unwrap();
                }
            }
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).expect("platform read");
            assert!(n > 0, "device closed signalling");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn send(&mut self, text: &str) {
        self.signalling
            .as_mut()
            .unwrap()
            .write_all(text.as_bytes())
            .unwrap();
    }

    /// 从请求原文拼一条响应（复制事务头部）。
    fn reply(&mut self, request_wire: &str, code: u16, extra: &[(&str, &str)], body: &str) {
        let mut out = format!("SIP/2.0 {code} Mock\r\n");
        for header in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = header_value(request_wire, header) {
                if header == "To" && code == 200 && !value.contains("tag=") {
                    out.push_str(&format!("{header}: {value};tag=mock1\r\n"));
                } else {
                    out.push_str(&format!("{header}: {value}\r\n"));
                }
            }
        }
        for (name, value) in extra {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
        self.send(&out);
    }
}

fn header_value(wire: &str, name: &str) -> Option<String> {
    wire.split("\r\n").find_map(|line| {
        let (n, v) = line.split_once(':')?;
        if n.trim().eq_ignore_ascii_case(name) {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

fn identity(server_port: u16) -> DeviceIdentity {
    DeviceIdentity {
        local_ip: "127.0.0.1".to_string(),
        server_ip: "127.0.0.1".to_string(),
        server_port,
        server_id: "34020000002000000001".to_string(),
        server_domain: "3402000000".to_string(),
        device_id: "34020000001320011118".to_string(),
        serial_number: "L1300011118".to_string(),
        device_name: "EdgeCam01".to_string(),
        password: "1234qwer".to_string(),
        longitude: 116.3975,
        latitude: 39.9085,
    }
}

struct Harness {
    agent: Arc<MediaEdgeAgent>,
    platform: MockPlatform,
    events: Arc<Mutex<Vec<(i32, String)>>>,
    g711_frames: Arc<Mutex<Vec<Vec<u8>>>>,
    pcm_frames: Arc<Mutex<Vec<Vec<i16>>>>,
}

fn start_harness() -> Harness {
    let mut platform = MockPlatform::new();
    let config = AgentConfig::new(identity(platform.port()));

    let agent = Arc::new(MediaEdgeAgent::new(config).unwrap());
    platform.accept_signalling();

    let events = Arc::new(Mutex::new(Vec::new()));
    let g711_frames = Arc::new(Mutex::new(Vec::new()));
    let pcm_frames = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        let g711_frames = Arc::clone(&g711_frames);
        let pcm_frames = Arc::clone(&pcm_frames);
        agent.set_callbacks(AgentCallbacks {
            event: Some(Arc::new(move |code, message| {
                events.lock().unwrap().push((code, message.to_string()));
            })),
            g711: Some(Arc::new(move |frame| {
                g711_frames.lock().unwrap().push(frame.to_vec());
            })),
            pcm: Some(Arc::new(move |samples| {
                pcm_frames.lock().unwrap().push(samples.to_vec());
            })),
        });
    }
    agent.start().unwrap();

    Harness {
        agent,
        platform,
        events,
        g711_frames,
        pcm_frames,
    }
}

fn wait_until(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if probe() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

/// 注册全流程：401 挑战 → 带鉴权重发 → 成功，单次回调 (200, _)。
#[test]
fn test_register_with_digest_retry() {
    let mut h = start_harness();
    h.agent.do_register();
    assert_eq!(h.agent.register_state(), RegisterState::SentInitial);

    let initial = h.platform.recv();
    assert!(initial.starts_with("REGISTER sip:127.0.0.1:"));
    assert!(initial.contains("Expires: 7200\r\n"));
    assert!(initial.contains("User-Agent: GB28181-Device/1.0 EdgeCam01\r\n"));
    assert!(!initial.contains("Authorization:"));

    h.platform.reply(
        &initial,
        401,
        &[(
            "WWW-Authenticate",
            r#"Digest realm="3402000000", nonce="b1946ac9", algorithm=MD5"#,
        )],
        "",
    );

    // 单次挑战后进入 SentAuth 并重发
    let authorized = h.platform.recv();
    assert_eq!(h.agent.register_state(), RegisterState::SentAuth);
    assert!(authorized.contains("Authorization: Digest "));
    assert!(authorized.contains(r#"username="EdgeCam01""#));
    assert!(authorized.contains(r#"realm="3402000000""#));

    // 摘要响应按 RFC 2617 验算
    let ha1 = format!("{:x}", md5::compute("EdgeCam01:3402000000:1234qwer"));
    let uri = format!("sip:127.0.0.1:{}", h.platform.port());
    let ha2 = format!("{:x}", md5::compute(format!("REGISTER:{uri}")));
    let expected = format!("{:x}", md5::compute(format!("{ha1}:b1946ac9:{ha2}")));
    assert!(
        authorized.contains(&format!(r#"response="{expected}""#)),
        "digest mismatch in: {authorized}"
    );

    h.platform.reply(&authorized, 200, &[], "");
    wait_until("registration success", || {
        h.agent.register_state() == RegisterState::Success
    });

    let events = h.events.lock().unwrap().clone();
    let oks: Vec<_> = events.iter().filter(|(code, _)| *code == 200).collect();
    assert_eq!(oks.len(), 1, "events: {events:?}");

    h.agent.stop();
}

/// 注销：同一注册上下文上 expires=0，成功后回调 201。
#[test]
fn test_unregister() {
    let mut h = start_harness();
    h.agent.do_register();
    let initial = h.platform.recv();
    h.platform.reply(&initial, 200, &[], "");
    wait_until("registered", || {
        h.agent.register_state() == RegisterState::Success
    });

    h.agent.un_register();
    let unregister = h.platform.recv();
    assert!(unregister.starts_with("REGISTER "));
    assert!(unregister.contains("Expires: 0\r\n"));
    // 同一注册上下文：Call-ID 不变、CSeq 递增
    assert_eq!(
        header_value(&unregister, "Call-ID"),
        header_value(&initial, "Call-ID")
    );
    assert!(unregister.contains("CSeq: 2 REGISTER\r\n"));

    h.platform.reply(&unregister, 200, &[], "");
    wait_until("unregistered", || {
        h.agent.register_state() == RegisterState::Idle
    });
    wait_until("201 event", || {
        h.events.lock().unwrap().iter().any(|(code, _)| *code == 201)
    });

    h.agent.stop();
}

/// 上行拉流：平台 INVITE → 设备 200(SDP) + RTP/TCP 主动连接 → 推帧 → BYE。
#[test]
fn test_media_push_session() {
    let mut h = start_harness();
    h.agent.do_register();
    let initial = h.platform.recv();
    h.platform.reply(&initial, 200, &[], "");
    wait_until("registered", || {
        h.agent.register_state() == RegisterState::Success
    });

    // 平台的媒体接收口
    let media_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let media_port = media_listener.local_addr().unwrap().port();

    let offer = format!(
        "v=0\r\no=34020000002000000001 0 0 IN IP4 127.0.0.1\r\ns=Play\r\n\
         c=IN IP4 127.0.0.1\r\nt=0 0\r\n\
         m=video {media_port} TCP/RTP/AVP 96\r\n\
         a=recvonly\r\na=setup:passive\r\na=rtpmap:96 PS/90000\r\ny=0108000147\r\n"
    );
    let invite = format!(
        "INVITE sip:34020000001320011118@3402000000 SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKmock1\r\n\
         From: <sip:34020000002000000001@3402000000>;tag=pf1\r\n\
         To: <sip:34020000001320011118@3402000000>\r\n\
         Call-ID: push1@127.0.0.1\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:34020000002000000001@127.0.0.1:5060>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        offer.len(),
        offer
    );
    h.platform.send(&invite);

    // 设备先主动连上媒体口，再回 200
    let (mut media, _) = media_listener.accept().unwrap();
    media
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let answer = h.platform.recv();
    assert!(answer.starts_with("SIP/2.0 200 "));
    assert!(answer.contains("Content-Type: application/sdp\r\n"));
    assert!(answer.contains("m=video 9 TCP/RTP/AVP 96\r\n"));
    assert!(answer.contains("a=sendonly\r\n"));
    assert!(answer.contains("a=connection:new\r\n"));
    assert!(answer.contains("y=0108000147\r\n"));

    wait_until("push started event", || {
        h.events.lock().unwrap().iter().any(|(code, _)| *code == 1000)
    });

    // 推一个 IDR 帧：SPS/PPS/IDR
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F]);
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80]);
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, 0x10]);
    assert_eq!(h.agent.write_video_frame(&frame, 3000).unwrap(), 1);

    // 平台侧收到 interleaved RTP：$ 0 len + RTP + PS
    let mut framing = [0u8; 4];
    media.read_exact(&mut framing).unwrap();
    assert_eq!(framing[0], 0x24);
    assert_eq!(framing[1], 0x00);
    let len = u16::from_be_bytes([framing[2], framing[3]]) as usize;
    let mut rtp = vec![0u8; len];
    media.read_exact(&mut rtp).unwrap();
    assert_eq!(rtp[0], 0x80);
    assert_eq!(rtp[1], 0x80 | 96);
    assert_eq!(&rtp[8..12], &108_000_147u32.to_be_bytes());
    assert_eq!(&rtp[12..16], &[0x00, 0x00, 0x01, 0xBA]);

    // 平台挂断
    let bye = "BYE sip:34020000001320011118@3402000000 SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKmock2\r\n\
         From: <sip:34020000002000000001@3402000000>;tag=pf1\r\n\
         To: <sip:34020000001320011118@3402000000>;tag=dev1\r\n\
         Call-ID: push1@127.0.0.1\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\r\n";
    h.platform.send(bye);

    let bye_answer = h.platform.recv();
    assert!(bye_answer.starts_with("SIP/2.0 200 "));
    wait_until("push stopped event", || {
        h.events.lock().unwrap().iter().any(|(code, _)| *code == 1001)
    });

    // 会话结束后投帧直接丢弃
    assert_eq!(h.agent.write_video_frame(&frame, 6000).unwrap(), 0);

    h.agent.stop();
}

/// MANSCDP：Catalog 查询先 200 后回目录 MESSAGE；坏 XML 回 400。
#[test]
fn test_catalog_query_and_bad_xml() {
    let mut h = start_harness();
    h.agent.do_register();
    let initial = h.platform.recv();
    h.platform.reply(&initial, 200, &[], "");
    wait_until("registered", || {
        h.agent.register_state() == RegisterState::Success
    });

    let query = "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
        <Query>\r\n<CmdType>Catalog</CmdType>\r\n<SN>17</SN>\r\n\
        <DeviceID>34020000001320011118</DeviceID>\r\n</Query>";
    let message = format!(
        "MESSAGE sip:34020000001320011118@3402000000 SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKq1\r\n\
         From: <sip:34020000002000000001@3402000000>;tag=q1\r\n\
         To: <sip:34020000001320011118@3402000000>\r\n\
         Call-ID: q1@127.0.0.1\r\n\
         CSeq: 20 MESSAGE\r\n\
         Content-Type: Application/MANSCDP+xml\r\n\
         Content-Length: {}\r\n\r\n{}",
        query.len(),
        query
    );
    h.platform.send(&message);

    let ok = h.platform.recv();
    assert!(ok.starts_with("SIP/2.0 200 "), "got: {ok}");

    let catalog = h.platform.recv();
    assert!(catalog.starts_with("MESSAGE "));
    assert!(catalog.contains("Content-Type: Application/MANSCDP+xml\r\n"));
    assert!(catalog.contains("<CmdType>Catalog</CmdType>"));
    assert!(catalog.contains("<SN>17</SN>"));
    assert!(catalog.contains("<DeviceID>34020000001320010001</DeviceID>"));
    h.platform.reply(&catalog, 200, &[], "");

    // 坏 XML：400
    let malformed = format!(
        "MESSAGE sip:34020000001320011118@3402000000 SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKq2\r\n\
         From: <sip:34020000002000000001@3402000000>;tag=q2\r\n\
         To: <sip:34020000001320011118@3402000000>\r\n\
         Call-ID: q2@127.0.0.1\r\n\
         CSeq: 21 MESSAGE\r\n\
         Content-Type: Application/MANSCDP+xml\r\n\
         Content-Length: 8\r\n\r\n<Query>{{"
    );
    h.platform.send(&malformed);
    let bad = h.platform.recv();
    assert!(bad.starts_with("SIP/2.0 400 "), "got: {bad}");

    // 非 MANSCDP 类型：415
    let text = format!(
        "MESSAGE sip:34020000001320011118@3402000000 SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKq3\r\n\
         From: <sip:34020000002000000001@3402000000>;tag=q3\r\n\
         To: <sip:34020000001320011118@3402000000>\r\n\
         Call-ID: q3@127.0.0.1\r\n\
         CSeq: 22 MESSAGE\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 2\r\n\r\nhi"
    );
    h.platform.send(&text);
    let unsupported = h.platform.recv();
    assert!(unsupported.starts_with("SIP/2.0 415 "), "got: {unsupported}");

    h.agent.stop();
}

/// 下行对讲：Broadcast 通知 → 设备 INVITE → 平台 200(SDP) → 推 G.711 → 回调。
#[test]
fn test_voice_broadcast_session() {
    let mut h = start_harness();
    h.agent.do_register();
    let initial = h.platform.recv();
    h.platform.reply(&initial, 200, &[], "");
    wait_until("registered", || {
        h.agent.register_state() == RegisterState::Success
    });

    // 平台语音推流口
    let audio_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let audio_port = audio_listener.local_addr().unwrap().port();

    let notify = "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
        <Notify>\r\n<CmdType>Broadcast</CmdType>\r\n<SN>31</SN>\r\n\
        <SourceID>34020000002000000001</SourceID>\r\n\
        <TargetID>34020000001370000001</TargetID>\r\n</Notify>";
    let message = format!(
        "MESSAGE sip:34020000001320011118@3402000000 SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKb1\r\n\
         From: <sip:34020000002000000001@3402000000>;tag=b1\r\n\
         To: <sip:34020000001320011118@3402000000>\r\n\
         Call-ID: b1@127.0.0.1\r\n\
         CSeq: 30 MESSAGE\r\n\
         Content-Type: Application/MANSCDP+xml\r\n\
         Content-Length: {}\r\n\r\n{}",
        notify.len(),
        notify
    );
    h.platform.send(&message);

    let ok = h.platform.recv();
    assert!(ok.starts_with("SIP/2.0 200 "));

    // 设备应主动发 INVITE 请平台推音频
    let invite = h.platform.recv();
    assert!(invite.starts_with("INVITE "), "got: {invite}");
    assert!(invite
        .contains("Subject: 34020000002000000001:1,34020000001370000001:1\r\n"));
    assert!(invite.contains("m=audio "));
    assert!(invite.contains("a=recvonly\r\n"));
    assert!(invite.contains("f=v/////a/1/8/1\r\n"));

    // 应答 SDP 指向平台语音口（PCMA）
    let answer_sdp = format!(
        "v=0\r\no=34020000002000000001 0 0 IN IP4 127.0.0.1\r\ns=Play\r\n\
         c=IN IP4 127.0.0.1\r\nt=0 0\r\n\
         m=audio {audio_port} TCP/RTP/AVP 8\r\n\
         a=sendonly\r\na=setup:passive\r\na=rtpmap:8 PCMA/8000\r\n"
    );
    h.platform.reply(
        &invite,
        200,
        &[
            ("Contact", "<sip:34020000002000000001@127.0.0.1:5060>"),
            ("Content-Type", "application/sdp"),
        ],
        &answer_sdp,
    );

    // 设备连上语音口并发 ACK
    let (mut audio_push, _) = audio_listener.accept().unwrap();
    let ack = h.platform.recv();
    assert!(ack.starts_with("ACK "), "got: {ack}");

    wait_until("audio started event", || {
        h.events.lock().unwrap().iter().any(|(code, _)| *code == 2000)
    });

    // 平台帧格式：03 2C + RTP 头 + 160 字节 A 律
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&[0x03, 0x2C, 0x80, 0x88]);
    datagram.extend_from_slice(&[0u8; 10]);
    datagram.extend_from_slice(&[0xD5u8; 160]); // A 律静音
    audio_push.write_all(&datagram).unwrap();

    wait_until("g711 frame delivered", || {
        !h.g711_frames.lock().unwrap().is_empty()
    });
    {
        let frames = h.g711_frames.lock().unwrap();
        assert_eq!(frames[0].len(), 160);
        assert!(frames[0].iter().all(|&b| b == 0xD5));
    }
    wait_until("pcm frame delivered", || {
        !h.pcm_frames.lock().unwrap().is_empty()
    });
    {
        let frames = h.pcm_frames.lock().unwrap();
        assert_eq!(frames[0].len(), 160);
        // 0xD5 是 A 律零电平
        assert!(frames[0].iter().all(|&s| s.unsigned_abs() <= 8));
    }

    // 平台结束广播
    let call_id = header_value(&invite, "Call-ID").unwrap();
    let from = header_value(&invite, "From").unwrap();
    let to = header_value(&invite, "To").unwrap();
    let bye = format!(
        "BYE sip:34020000001320011118@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKb2\r\n\
         From: {to};tag=mock1\r\n\
         To: {from}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 31 BYE\r\n\
         Content-Length: 0\r\n\r\n"
    );
    h.platform.send(&bye);
    let bye_ok = h.platform.recv();
    assert!(bye_ok.starts_with("SIP/2.0 200 "));

    wait_until("audio stopped event", || {
        h.events.lock().unwrap().iter().any(|(code, _)| *code == 2001)
    });

    h.agent.stop();
}
