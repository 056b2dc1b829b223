// 设备代理（控制器）
// 事件循环线程独占 SIP 栈；注册/心跳/查询应答/上行拉流/下行对讲在此汇合

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use gbedge_media::audio::AudioReceiver;
use gbedge_media::g711::{self, G711Law};
use gbedge_media::ps::{MuxerConfig, PsMuxer};
use gbedge_media::rtp::{RtpSender, RtpSenderConfig};

use crate::codes;
use crate::codes::*;
use crate::device::DeviceIdentity;
use crate::error::{Result, SipError};
use crate::event::{SipEvent, SipEventKind};
use crate::manscdp::{self, ManscdpKind};
use crate::sdp;
use crate::stack::{RegId, SipStack, StackConfig};

/// 注册状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState {
    Idle,
    SentInitial,
    SentAuth,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub identity: DeviceIdentity,
    /// 上行音频复用 / 下行对讲通告使用的 G.711 律
    pub audio_law: G711Law,
    /// 注册有效期（秒）
    pub register_expires: u32,
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
}

impl AgentConfig {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            audio_law: G711Law::Pcmu,
            register_expires: 7200,
            heartbeat_interval_secs: 30,
        }
    }
}

/// 事件回调：(事件码, 文本)。回调在事件线程上执行，必须保持非阻塞。
pub type EventCallback = Arc<dyn Fn(i32, &str) + Send + Sync>;
/// 下行对讲解码后的 PCM 回调
pub type PcmCallback = Arc<dyn Fn(&[i16]) + Send + Sync>;
/// 下行对讲原始 G.711 回调
pub type G711Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Clone, Default)]
pub struct AgentCallbacks {
    pub event: Option<EventCallback>,
    pub pcm: Option<PcmCallback>,
    pub g711: Option<G711Callback>,
}

struct AgentState {
    reg_state: RegisterState,
    rid: Option<RegId>,
    unregistering: bool,
    /// 上行视频对话 (cid, did)
    video_dialog: Option<(i32, i32)>,
    /// 下行音频对话 (cid, did)
    audio_dialog: Option<(i32, i32)>,
    /// 已发出未应答的下行 INVITE
    pending_audio_cid: Option<i32>,
}

/// GB28181 媒体边缘代理。
///
/// 一个实例对应一台设备：持有 SIP 栈、PS 复用器，并在拉流/对讲会话期间
/// 持有 RTP 发送器与语音接收器。采集/编码侧通过 `write_video_frame` /
/// `write_audio_frame` 投递媒体帧。
pub struct MediaEdgeAgent {
    config: AgentConfig,
    stack: Arc<SipStack>,
    muxer: Arc<PsMuxer>,
    sender: Arc<Mutex<Option<Arc<RtpSender>>>>,
    receiver: Arc<Mutex<Option<Arc<AudioReceiver>>>>,
    state: Arc<Mutex<AgentState>>,
    callbacks: Arc<Mutex<AgentCallbacks>>,
    sn_counter: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    heartbeat_running: Arc<AtomicBool>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MediaEdgeAgent {
    /// 连接平台信令地址并创建代理。
    pub fn new(config: AgentConfig) -> Result<Self> {
        let stack = SipStack::connect(StackConfig {
            server_ip: config.identity.server_ip.clone(),
            server_port: config.identity.server_port,
            user_agent: format!("GB28181-Device/1.0 {}", config.identity.device_name),
        })?;

        let muxer = PsMuxer::new(MuxerConfig {
            audio_law: config.audio_law,
        });

        Ok(Self {
            config,
            stack: Arc::new(stack),
            muxer: Arc::new(muxer),
            sender: Arc::new(Mutex::new(None)),
            receiver: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(AgentState {
                reg_state: RegisterState::Idle,
                rid: None,
                unregistering: false,
                video_dialog: None,
                audio_dialog: None,
                pending_audio_cid: None,
            })),
            callbacks: Arc::new(Mutex::new(AgentCallbacks::default())),
            sn_counter: Arc::new(AtomicU32::new(1)),
            running: Arc::new(AtomicBool::new(false)),
            heartbeat_running: Arc::new(AtomicBool::new(false)),
            event_thread: Mutex::new(None),
            heartbeat_thread: Mutex::new(None),
        })
    }

    pub fn set_callbacks(&self, callbacks: AgentCallbacks) {
        *self.callbacks.lock().unwrap() = callbacks;
    }

    pub fn register_state(&self) -> RegisterState {
        self.state.lock().unwrap().reg_state
    }

    /// 启动事件循环线程。
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let agent = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("sip-event".into())
            .spawn(move || agent.event_loop())?;
        *self.event_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// 停止事件循环、心跳与媒体会话。
    pub fn stop(&self) {
        // 趁连接还在，礼貌地结束仍在进行的对讲对话
        let audio_did = self.state.lock().unwrap().audio_dialog.map(|(_, did)| did);
        if let Some(did) = audio_did {
            if let Err(e) = self.stack.call_terminate(did) {
                tracing::debug!(target: "agent", "terminate audio dialog failed: {}", e);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.stop_heartbeat();
        self.stack.shutdown();
        if let Some(handle) = self.event_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.teardown_video();
        self.teardown_audio();
    }

    /// 发起注册（首次无鉴权，401/407 后由事件循环补鉴权重发）。
    pub fn do_register(&self) {
        let identity = &self.config.identity;
        let built = self.stack.register_build_initial(
            &identity.device_uri(),
            &identity.registrar_uri(),
            self.config.register_expires,
        );
        let (rid, request) = match built {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(target: "agent", "build REGISTER failed: {}", e);
                self.notify(CODE_BUILD_REGISTER_FAILED);
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            state.rid = Some(rid);
            state.unregistering = false;
            state.reg_state = RegisterState::SentInitial;
        }
        if let Err(e) = self.stack.register_send(rid, request) {
            tracing::error!(target: "agent", "send REGISTER failed: {}", e);
            self.state.lock().unwrap().reg_state = RegisterState::Failed;
            self.notify(CODE_SEND_REGISTER_FAILED);
        }
    }

    /// 注销（expires=0 的 REGISTER）。
    pub fn un_register(&self) {
        let rid = {
            let mut state = self.state.lock().unwrap();
            let Some(rid) = state.rid else {
                tracing::warn!(target: "agent", "unregister without active registration");
                return;
            };
            state.unregistering = true;
            rid
        };

        let request = match self.stack.register_build(rid, 0) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(target: "agent", "build unregister failed: {}", e);
                self.notify(CODE_BUILD_UNREGISTER_FAILED);
                return;
            }
        };
        if let Err(e) = self.stack.register_send(rid, request) {
            tracing::error!(target: "agent", "send unregister failed: {}", e);
            self.notify(CODE_SEND_UNREGISTER_FAILED);
        }
    }

    /// 投递一帧 Annex-B 视频。未在推流会话内时整帧丢弃。
    /// 返回交给 RTP 层的 PS 包数量。
    pub fn write_video_frame(&self, frame: &[u8], pts_90k: u64) -> Result<usize> {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => self.muxer.write_video_frame(frame, pts_90k, sender.as_ref()).map_err(SipError::Media),
            None => Ok(0),
        }
    }

    /// 投递一帧 8 位 PCM 音频（首个 IDR 发出前会被复用器丢弃）。
    pub fn write_audio_frame(&self, pcm8: &[u8], pts_90k: u64) -> Result<usize> {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => self.muxer.write_audio_frame(pcm8, pts_90k, sender.as_ref()).map_err(SipError::Media),
            None => Ok(0),
        }
    }

    // ---------------- 事件循环 ----------------

    fn event_loop(self: Arc<Self>) {
        tracing::info!(target: "agent", "sip event loop started");
        while self.running.load(Ordering::Relaxed) {
            match self.stack.event_wait() {
                Ok(Some(event)) => self.dispatch(event),
                Ok(None) => self.stack.execute(),
                Err(SipError::Disconnected) => {
                    if self.running.load(Ordering::Relaxed) {
                        tracing::error!(target: "agent", "signalling connection lost");
                        self.notify(CODE_STACK_INIT_FAILED);
                    }
                    break;
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        tracing::error!(target: "agent", "event wait failed: {}", e);
                    }
                    break;
                }
            }
        }
        tracing::info!(target: "agent", "sip event loop exited");
    }

    fn dispatch(&self, event: SipEvent) {
        tracing::debug!(target: "agent", "sip event {:?}", event.kind);
        match event.kind {
            SipEventKind::RegistrationSuccess => self.on_registration_success(),
            SipEventKind::RegistrationFailure => self.on_registration_failure(&event),
            SipEventKind::MessageNew => self.on_message_new(&event),
            SipEventKind::CallInvite => self.on_call_invite(&event),
            SipEventKind::CallAnswered => self.on_call_answered(&event),
            SipEventKind::CallAck => {
                tracing::debug!(target: "agent", "dialog {} confirmed", event.did);
            }
            SipEventKind::CallClosed => self.on_call_closed(&event),
            SipEventKind::CallReleased => {
                tracing::debug!(target: "agent", "dialog {} released", event.did);
            }
            SipEventKind::CallNoAnswer
            | SipEventKind::CallCancelled
            | SipEventKind::CallRequestFailure
            | SipEventKind::CallServerFailure
            | SipEventKind::CallGlobalFailure => self.on_call_failed(&event),
            SipEventKind::MessageAnswered => {
                tracing::debug!(target: "agent", "platform acked MESSAGE");
            }
            SipEventKind::MessageRequestFailure => {
                tracing::warn!(
                    target: "agent",
                    "outbound MESSAGE failed: {:?}",
                    event.status_code()
                );
            }
            SipEventKind::SubscriptionNotify => {
                tracing::info!(target: "agent", "subscription/notify event ignored");
            }
        }
    }

    // ---------------- 注册 ----------------

    fn on_registration_success(&self) {
        let unregistering = {
            let mut state = self.state.lock().unwrap();
            if state.unregistering {
                state.reg_state = RegisterState::Idle;
                state.rid = None;
                true
            } else {
                state.reg_state = RegisterState::Success;
                false
            }
        };

        if unregistering {
            tracing::info!(target: "agent", "unregistered from platform");
            self.stop_heartbeat();
            self.notify(CODE_UNREGISTERED);
        } else {
            tracing::info!(target: "agent", "registered to platform");
            self.start_heartbeat();
            self.notify(CODE_REGISTERED);
        }
    }

    fn on_registration_failure(&self, event: &SipEvent) {
        let status = event.status_code().unwrap_or(408);
        let reg_state = self.state.lock().unwrap().reg_state;

        if (status == 401 || status == 407) && reg_state == RegisterState::SentInitial {
            // 单次摘要重试
            let identity = &self.config.identity;
            self.stack
                .add_authentication(&identity.device_name, &identity.password);

            let rid = match self.state.lock().unwrap().rid {
                Some(rid) => rid,
                None => return,
            };
            let request = match self.stack.register_build(rid, self.config.register_expires) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(target: "agent", "build authorized REGISTER failed: {}", e);
                    self.state.lock().unwrap().reg_state = RegisterState::Failed;
                    self.notify(CODE_BUILD_AUTH_REGISTER_FAILED);
                    return;
                }
            };
            self.state.lock().unwrap().reg_state = RegisterState::SentAuth;
            if let Err(e) = self.stack.register_send(rid, request) {
                tracing::error!(target: "agent", "send authorized REGISTER failed: {}", e);
                self.state.lock().unwrap().reg_state = RegisterState::Failed;
                self.notify(CODE_SEND_AUTH_REGISTER_FAILED);
                return;
            }
            tracing::info!(target: "agent", "challenged with {}, retrying with credentials", status);
            return;
        }

        tracing::warn!(target: "agent", "registration failed with status {}", status);
        self.state.lock().unwrap().reg_state = RegisterState::Failed;
        self.notify(status as i32);
    }

    // ---------------- 心跳 ----------------

    fn start_heartbeat(&self) {
        if self.heartbeat_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let stack = Arc::clone(&self.stack);
        let running = Arc::clone(&self.heartbeat_running);
        let sn_counter = Arc::clone(&self.sn_counter);
        let identity = self.config.identity.clone();
        let interval = self.config.heartbeat_interval_secs;

        let handle = std::thread::Builder::new()
            .name("sip-heartbeat".into())
            .spawn(move || {
                tracing::info!(target: "agent", "heartbeat thread started");
                'outer: while running.load(Ordering::Relaxed) {
                    // 100ms 小步睡眠，停止请求在一个量程内生效
                    for _ in 0..interval * 10 {
                        if !running.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }

                    let sn = sn_counter.fetch_add(1, Ordering::Relaxed);
                    let mut request =
                        stack.message_build_request(&identity.registrar_uri(), &identity.device_uri());
                    request.set_body(
                        manscdp::build_keepalive(sn, &identity.device_id),
                        manscdp::CONTENT_TYPE,
                    );
                    match stack.message_send(request) {
                        Ok(()) => {
                            tracing::debug!(target: "agent", "keepalive sent, sn={}", sn)
                        }
                        Err(e) => {
                            tracing::warn!(target: "agent", "keepalive send failed: {}", e)
                        }
                    }
                }
                tracing::info!(target: "agent", "heartbeat thread exited");
            });

        match handle {
            Ok(handle) => {
                *self.heartbeat_thread.lock().unwrap() = Some(handle);
            }
            Err(e) => {
                tracing::error!(target: "agent", "spawn heartbeat failed: {}", e);
                self.heartbeat_running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn stop_heartbeat(&self) {
        self.heartbeat_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // ---------------- 平台 MESSAGE ----------------

    fn on_message_new(&self, event: &SipEvent) {
        let Some(request) = event.request.as_ref() else {
            return;
        };
        let tid = event.tid;

        // Content-Type 必须是 MANSCDP
        let content_type = request.header("Content-Type").unwrap_or_default();
        if !content_type.eq_ignore_ascii_case(manscdp::CONTENT_TYPE) {
            tracing::warn!(target: "agent", "unsupported content type {:?}", content_type);
            let _ = self.stack.send_answer(tid, 415, None);
            return;
        }

        let parsed = match manscdp::parse(&request.body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(target: "agent", "malformed MANSCDP body: {}", e);
                let _ = self.stack.send_answer(tid, 400, None);
                return;
            }
        };

        // 先 200 再处理业务，抑制平台重传
        if let Err(e) = self.stack.send_answer(tid, 200, None) {
            tracing::warn!(target: "agent", "answer MESSAGE failed: {}", e);
        }

        match parsed.kind {
            ManscdpKind::Query => self.handle_query(&parsed.payload.cmd_type, &parsed.payload.sn),
            ManscdpKind::Notify => match parsed.payload.cmd_type.as_str() {
                "Broadcast" => {
                    tracing::info!(
                        target: "agent",
                        "broadcast request: source={}, target={}",
                        parsed.payload.source_id,
                        parsed.payload.target_id
                    );
                    self.start_broadcast(&parsed.payload.source_id, &parsed.payload.target_id);
                }
                other => {
                    tracing::info!(target: "agent", "notify {} ignored", other);
                }
            },
        }
    }

    fn handle_query(&self, cmd_type: &str, sn: &str) {
        let identity = &self.config.identity;
        let body = match cmd_type {
            "DeviceInfo" => manscdp::build_device_info_response(sn, identity),
            "Catalog" => manscdp::build_catalog_response(sn, identity),
            other => {
                tracing::info!(target: "agent", "query {} not supported, ignored", other);
                return;
            }
        };

        let mut request = self
            .stack
            .message_build_request(&identity.registrar_uri(), &identity.device_uri());
        request.set_body(body, manscdp::CONTENT_TYPE);
        if let Err(e) = self.stack.message_send(request) {
            tracing::warn!(target: "agent", "send {} response failed: {}", cmd_type, e);
        }
    }

    // ---------------- 上行拉流 ----------------

    fn on_call_invite(&self, event: &SipEvent) {
        let Some(request) = event.request.as_ref() else {
            return;
        };
        let tid = event.tid;

        if request.body.is_empty() {
            tracing::warn!(target: "agent", "INVITE without SDP body");
            let _ = self.stack.send_answer(tid, 488, None);
            return;
        }

        let offer = sdp::parse(&request.body);
        if offer.validate().is_err() {
            tracing::warn!(target: "agent", "INVITE SDP has no usable endpoint");
            let _ = self.stack.send_answer(tid, 488, None);
            return;
        }
        if !offer.is_tcp() {
            // 仅支持 TCP 被动推流
            tracing::warn!(target: "agent", "platform requested UDP transport, rejecting");
            let _ = self.stack.send_answer(tid, 488, None);
            self.notify(488);
            return;
        }

        // 已有推流会话：掐掉旧的
        if self.state.lock().unwrap().video_dialog.is_some() {
            tracing::warn!(target: "agent", "new INVITE while streaming, replacing session");
            self.teardown_video();
        }

        let sender = match RtpSender::connect(&RtpSenderConfig {
            remote_host: offer.remote_host.clone(),
            remote_port: offer.remote_port,
            ssrc_text: offer.ssrc.clone(),
        }) {
            Ok(sender) => Arc::new(sender),
            Err(e) => {
                tracing::error!(target: "agent", "rtp sender init failed: {}", e);
                let _ = self.stack.send_answer(tid, 500, None);
                self.notify(CODE_RTP_INIT_FAILED);
                return;
            }
        };

        let identity = &self.config.identity;
        let answer_sdp =
            sdp::build_upstream_answer(&identity.device_id, &identity.local_ip, &offer.ssrc);
        let mut answer = match self.stack.build_answer(tid, 200) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(target: "agent", "build 200 answer failed: {}", e);
                sender.shutdown();
                let _ = self.stack.send_answer(tid, 500, None);
                return;
            }
        };
        answer.set_body(answer_sdp, "application/sdp");
        if let Err(e) = self.stack.send_answer(tid, 200, Some(answer)) {
            tracing::error!(target: "agent", "send 200 answer failed: {}", e);
            sender.shutdown();
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.video_dialog = Some((event.cid, event.did));
        }
        *self.sender.lock().unwrap() = Some(sender);
        tracing::info!(
            target: "agent",
            "media push session established to {}:{}",
            offer.remote_host,
            offer.remote_port
        );
        self.notify(CODE_PUSH_STARTED);
    }

    fn on_call_closed(&self, event: &SipEvent) {
        let (is_video, is_audio) = {
            let state = self.state.lock().unwrap();
            (
                state.video_dialog.map(|(cid, _)| cid) == Some(event.cid),
                state.audio_dialog.map(|(cid, _)| cid) == Some(event.cid),
            )
        };

        if is_video {
            tracing::info!(target: "agent", "platform closed media push session");
            self.teardown_video();
            self.notify(CODE_PUSH_STOPPED);
        } else if is_audio {
            tracing::info!(target: "agent", "platform closed audio session");
            self.teardown_audio();
            self.notify(CODE_AUDIO_STOPPED);
        } else {
            tracing::debug!(target: "agent", "BYE for unknown call {}", event.cid);
        }
    }

    fn teardown_video(&self) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            sender.shutdown();
        }
        self.muxer.release();
        self.state.lock().unwrap().video_dialog = None;
    }

    // ---------------- 下行对讲 ----------------

    fn start_broadcast(&self, source_id: &str, target_id: &str) {
        // 已有对讲会话：掐掉旧的
        if self.state.lock().unwrap().audio_dialog.is_some() {
            tracing::warn!(target: "agent", "new broadcast while receiving, replacing session");
            self.teardown_audio();
        }

        let receiver = match AudioReceiver::new() {
            Ok(r) => Arc::new(r),
            Err(e) => {
                tracing::error!(target: "agent", "audio receiver init failed: {}", e);
                self.notify(CODE_AUDIO_INIT_FAILED);
                return;
            }
        };
        let local_port = receiver.local_port();

        let identity = &self.config.identity;
        let (offer_sdp, _ssrc) = sdp::build_downstream_offer(
            &identity.device_id,
            &identity.local_ip,
            local_port,
            self.config.audio_law,
        );

        let subject = format!("{source_id}:1,{target_id}:1");
        let built = self.stack.call_build_initial_invite(
            &identity.platform_uri(),
            &identity.device_uri(),
            &subject,
        );
        let (cid, mut invite) = match built {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(target: "agent", "build audio INVITE failed: {}", e);
                self.notify(CODE_AUDIO_INVITE_FAILED);
                return;
            }
        };
        invite.set_body(offer_sdp, "application/sdp");

        *self.receiver.lock().unwrap() = Some(receiver);
        self.state.lock().unwrap().pending_audio_cid = Some(cid);

        if let Err(e) = self.stack.call_send_initial_invite(cid, invite) {
            tracing::error!(target: "agent", "send audio INVITE failed: {}", e);
            self.state.lock().unwrap().pending_audio_cid = None;
            *self.receiver.lock().unwrap() = None;
            self.notify(CODE_AUDIO_INVITE_FAILED);
        }
    }

    fn on_call_answered(&self, event: &SipEvent) {
        let pending = self.state.lock().unwrap().pending_audio_cid;
        if pending != Some(event.cid) {
            tracing::debug!(target: "agent", "answer for unknown call {}", event.cid);
            return;
        }

        let Some(response) = event.response.as_ref() else {
            return;
        };
        let answer = sdp::parse(&response.body);
        if answer.validate().is_err() {
            tracing::error!(target: "agent", "audio answer has no usable endpoint");
            self.abort_audio_setup();
            return;
        }

        let receiver = self.receiver.lock().unwrap().clone();
        let Some(receiver) = receiver else {
            tracing::error!(target: "agent", "audio answer without receiver");
            return;
        };

        if let Err(e) = receiver.connect_platform(&answer.remote_host, answer.remote_port) {
            tracing::error!(target: "agent", "connect audio source failed: {}", e);
            self.abort_audio_setup();
            return;
        }
        if let Err(e) = self.stack.call_send_ack(event.did) {
            tracing::warn!(target: "agent", "send ACK failed: {}", e);
        }

        // 平台应答里的负载类型决定解码律：PCMA=8，其余按 PCMU
        let law = answer
            .rtpmap
            .keys()
            .find_map(|&pt| G711Law::from_payload_type(pt))
            .unwrap_or(G711Law::Pcmu);

        let callbacks = Arc::clone(&self.callbacks);
        let started = receiver.start(Box::new(move |frame| {
            let callbacks = callbacks.lock().unwrap();
            if let Some(g711_cb) = callbacks.g711.as_ref() {
                g711_cb(frame);
            }
            if let Some(pcm_cb) = callbacks.pcm.as_ref() {
                let pcm = g711::decode(law, frame);
                pcm_cb(&pcm);
            }
        }));
        if let Err(e) = started {
            tracing::error!(target: "agent", "start audio receiver failed: {}", e);
            self.abort_audio_setup();
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.pending_audio_cid = None;
            state.audio_dialog = Some((event.cid, event.did));
        }
        tracing::info!(
            target: "agent",
            "audio receive session established from {}:{} ({:?})",
            answer.remote_host,
            answer.remote_port,
            law
        );
        self.notify(CODE_AUDIO_STARTED);
    }

    fn on_call_failed(&self, event: &SipEvent) {
        let pending = self.state.lock().unwrap().pending_audio_cid;
        if pending == Some(event.cid) {
            tracing::warn!(
                target: "agent",
                "audio INVITE failed: {:?} {:?}",
                event.kind,
                event.status_code()
            );
            self.abort_audio_setup();
            self.notify(CODE_AUDIO_INVITE_FAILED);
        } else {
            tracing::debug!(target: "agent", "call {} failed: {:?}", event.cid, event.kind);
        }
    }

    fn abort_audio_setup(&self) {
        self.state.lock().unwrap().pending_audio_cid = None;
        if let Some(receiver) = self.receiver.lock().unwrap().take() {
            receiver.stop();
        }
    }

    fn teardown_audio(&self) {
        if let Some(receiver) = self.receiver.lock().unwrap().take() {
            receiver.stop();
        }
        let mut state = self.state.lock().unwrap();
        state.audio_dialog = None;
        state.pending_audio_cid = None;
    }

    // ---------------- 回调 ----------------

    fn notify(&self, code: i32) {
        let message = codes::describe(code);
        let callback = self.callbacks.lock().unwrap().event.clone();
        if let Some(callback) = callback {
            callback(code, &message);
        }
    }
}
