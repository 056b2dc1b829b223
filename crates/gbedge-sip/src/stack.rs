// 设备侧迷你 SIP 栈
// 单条平台长连接上的事务/注册/对话管理，向事件循环吐出 eXosip 风格事件

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::auth::{self, DigestChallenge};
use crate::error::{Result, SipError};
use crate::event::{SipEvent, SipEventKind};
use crate::message::{extract_tag, extract_uri, SipMessage, SipMethod, SipRequest, SipResponse};
use crate::transport::SipConnection;

/// 客户端事务超时（无任何终结响应）
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

pub type RegId = i32;

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub user_agent: String,
}

struct Registration {
    from_uri: String,
    registrar_uri: String,
    call_id: String,
    from_tag: String,
    cseq: u32,
    expires: u32,
    challenge: Option<DigestChallenge>,
    nc: u32,
}

struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxKind {
    Register(RegId),
    Message,
    Invite(i32),
    Bye(i32),
}

struct ClientTx {
    call_id: String,
    cseq: u32,
    method: SipMethod,
    kind: TxKind,
    sent_at: Instant,
}

struct ServerTx {
    request: SipRequest,
    /// INVITE 事务关联的对话
    did: i32,
}

struct Dialog {
    cid: i32,
    did: i32,
    call_id: String,
    local_tag: String,
    remote_tag: String,
    /// 对话内出向请求的目标（对端 Contact，缺省用对端 URI）
    remote_target: String,
    local_uri: String,
    remote_uri: String,
    invite_cseq: u32,
    local_cseq: u32,
}

struct StackInner {
    config: StackConfig,
    local_addr: SocketAddr,
    registrations: HashMap<RegId, Registration>,
    credentials: Option<Credentials>,
    client_txs: Vec<ClientTx>,
    server_txs: HashMap<i32, ServerTx>,
    dialogs: Vec<Dialog>,
    /// 出向 INVITE 的未成对话记录（cid → 初始请求）
    pending_calls: HashMap<i32, SipRequest>,
    events: VecDeque<SipEvent>,
    next_id: i32,
}

impl StackInner {
    fn alloc_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn dialog_by_call_id(&self, call_id: &str) -> Option<&Dialog> {
        self.dialogs.iter().find(|d| d.call_id == call_id)
    }

    fn dialog_by_did(&self, did: i32) -> Option<&Dialog> {
        self.dialogs.iter().find(|d| d.did == did)
    }

    fn remove_dialog(&mut self, did: i32) {
        self.dialogs.retain(|d| d.did != did);
    }
}

/// SIP 栈。内部分两把锁：连接锁只包住套接字读写，状态锁包住
/// 事务与对话表；两把锁从不嵌套，心跳线程发送与事件线程等待互不死锁。
pub struct SipStack {
    conn: Mutex<SipConnection>,
    inner: Mutex<StackInner>,
}

impl SipStack {
    /// 连接平台并初始化栈。
    pub fn connect(config: StackConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.server_ip, config.server_port)
            .parse()
            .map_err(|_| {
                SipError::Other(format!(
                    "invalid signalling address {}:{}",
                    config.server_ip, config.server_port
                ))
            })?;
        let conn = SipConnection::connect(addr)?;
        let local_addr = conn.local_addr()?;

        Ok(Self {
            conn: Mutex::new(conn),
            inner: Mutex::new(StackInner {
                config,
                local_addr,
                registrations: HashMap::new(),
                credentials: None,
                client_txs: Vec::new(),
                server_txs: HashMap::new(),
                dialogs: Vec::new(),
                pending_calls: HashMap::new(),
                events: VecDeque::new(),
                next_id: 1,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.lock().unwrap().local_addr
    }

    /// 等待下一条栈事件，至多阻塞一个量程（100ms）。
    pub fn event_wait(&self) -> Result<Option<SipEvent>> {
        if let Some(event) = self.inner.lock().unwrap().events.pop_front() {
            return Ok(Some(event));
        }

        let polled = self.conn.lock().unwrap().poll_message();
        match polled {
            Ok(Some(text)) => {
                self.process_incoming(&text)?;
                Ok(self.inner.lock().unwrap().events.pop_front())
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 内部维护：过期客户端事务转为失败事件。
    pub fn execute(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut expired = Vec::new();
        inner.client_txs.retain(|tx| {
            if now.duration_since(tx.sent_at) > TRANSACTION_TIMEOUT {
                expired.push(tx.kind);
                false
            } else {
                true
            }
        });
        for kind in expired {
            let mut event = match kind {
                TxKind::Register(rid) => {
                    let mut ev = SipEvent::new(SipEventKind::RegistrationFailure);
                    ev.rid = rid;
                    ev
                }
                TxKind::Message => SipEvent::new(SipEventKind::MessageRequestFailure),
                TxKind::Invite(cid) => {
                    let mut ev = SipEvent::new(SipEventKind::CallNoAnswer);
                    ev.cid = cid;
                    ev
                }
                TxKind::Bye(did) => {
                    let mut ev = SipEvent::new(SipEventKind::CallReleased);
                    ev.did = did;
                    ev
                }
            };
            event.tid = -1;
            tracing::warn!(target: "sip", "transaction timed out: {:?}", kind);
            inner.events.push_back(event);
        }
    }

    /// 关闭信令连接。
    pub fn shutdown(&self) {
        self.conn.lock().unwrap().shutdown();
    }

    // ---------------- 注册 ----------------

    /// 预设摘要鉴权凭据（收到 401/407 后重建请求时生效）。
    pub fn add_authentication(&self, username: &str, password: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    /// 新建注册上下文并构建首个 REGISTER。
    pub fn register_build_initial(
        &self,
        from_uri: &str,
        registrar_uri: &str,
        expires: u32,
    ) -> Result<(RegId, SipRequest)> {
        let mut inner = self.inner.lock().unwrap();
        let rid = inner.alloc_id();
        let registration = Registration {
            from_uri: from_uri.to_string(),
            registrar_uri: registrar_uri.to_string(),
            call_id: random_call_id(&inner.local_addr),
            from_tag: random_token(8),
            cseq: 1,
            expires,
            challenge: None,
            nc: 0,
        };
        let request = build_register_request(&inner, &registration, None);
        inner.registrations.insert(rid, registration);
        Ok((rid, request))
    }

    /// 在既有注册上下文上重建 REGISTER（注销传 expires=0）。
    /// 已收到挑战且凭据就绪时自动附加 Authorization。
    pub fn register_build(&self, rid: RegId, expires: u32) -> Result<SipRequest> {
        let mut inner = self.inner.lock().unwrap();
        let credentials = inner
            .credentials
            .as_ref()
            .map(|c| (c.username.clone(), c.password.clone()));

        let registration = inner
            .registrations
            .get_mut(&rid)
            .ok_or(SipError::UnknownRegistration(rid))?;
        registration.cseq += 1;
        registration.expires = expires;

        let authorization = match (&registration.challenge, credentials) {
            (Some(challenge), Some((username, password))) => {
                registration.nc += 1;
                Some(
                    auth::build_authorization(
                        &username,
                        &password,
                        "REGISTER",
                        &registration.registrar_uri,
                        challenge,
                        registration.nc,
                    )
                    .ok_or_else(|| SipError::Other("unsupported digest algorithm".to_string()))?,
                )
            }
            _ => None,
        };

        let registration = &inner.registrations[&rid];
        Ok(build_register_request(
            &inner,
            registration,
            authorization.as_deref(),
        ))
    }

    /// 发送 REGISTER，登记客户端事务。
    pub fn register_send(&self, rid: RegId, request: SipRequest) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.registrations.contains_key(&rid) {
                return Err(SipError::UnknownRegistration(rid));
            }
            let (cseq, _) = request
                .cseq()
                .ok_or_else(|| SipError::Parse("REGISTER without CSeq".into()))?;
            let call_id = request
                .call_id()
                .ok_or_else(|| SipError::Parse("REGISTER without Call-ID".into()))?
                .to_string();
            inner.client_txs.push(ClientTx {
                call_id,
                cseq,
                method: SipMethod::Register,
                kind: TxKind::Register(rid),
                sent_at: Instant::now(),
            });
        }
        self.send_text(&request.to_wire())
    }

    // ---------------- MESSAGE ----------------

    /// 构建对话外 MESSAGE 请求（正文由调用方填充）。
    pub fn message_build_request(&self, to_uri: &str, from_uri: &str) -> SipRequest {
        let inner = self.inner.lock().unwrap();
        let mut request = SipRequest::new(SipMethod::Message, to_uri);
        fill_common_headers(
            &mut request,
            &inner,
            from_uri,
            to_uri,
            &random_token(8),
            &random_call_id(&inner.local_addr),
            1,
        );
        request
    }

    /// 发送 MESSAGE，登记客户端事务。
    pub fn message_send(&self, request: SipRequest) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            let (cseq, _) = request
                .cseq()
                .ok_or_else(|| SipError::Parse("MESSAGE without CSeq".into()))?;
            let call_id = request
                .call_id()
                .ok_or_else(|| SipError::Parse("MESSAGE without Call-ID".into()))?
                .to_string();
            inner.client_txs.push(ClientTx {
                call_id,
                cseq,
                method: SipMethod::Message,
                kind: TxKind::Message,
                sent_at: Instant::now(),
            });
        }
        self.send_text(&request.to_wire())
    }

    // ---------------- 应答入向请求 ----------------

    /// 按事务构建应答（复制 Via/From/To/Call-ID/CSeq）。
    pub fn build_answer(&self, tid: i32, code: u16) -> Result<SipResponse> {
        let inner = self.inner.lock().unwrap();
        let tx = inner
            .server_txs
            .get(&tid)
            .ok_or(SipError::UnknownTransaction(tid))?;
        let local_tag = inner
            .dialog_by_did(tx.did)
            .map(|d| d.local_tag.clone());
        Ok(build_response_from_request(
            &tx.request,
            code,
            local_tag.as_deref(),
            &inner.config.user_agent,
        ))
    }

    /// 发送应答；`answer` 为 None 时按默认模板构建。
    /// 终结应答（≥200）会结束服务端事务。
    pub fn send_answer(&self, tid: i32, code: u16, answer: Option<SipResponse>) -> Result<()> {
        let response = match answer {
            Some(r) => r,
            None => self.build_answer(tid, code)?,
        };
        let wire = response.to_wire();
        if code >= 200 {
            self.inner.lock().unwrap().server_txs.remove(&tid);
        }
        self.send_text(&wire)
    }

    // ---------------- 呼叫 ----------------

    /// 构建出向 INVITE（下行对讲），返回呼叫 id。
    pub fn call_build_initial_invite(
        &self,
        to_uri: &str,
        from_uri: &str,
        subject: &str,
    ) -> Result<(i32, SipRequest)> {
        let mut inner = self.inner.lock().unwrap();
        let cid = inner.alloc_id();
        let mut request = SipRequest::new(SipMethod::Invite, to_uri);
        fill_common_headers(
            &mut request,
            &inner,
            from_uri,
            to_uri,
            &random_token(8),
            &random_call_id(&inner.local_addr),
            1,
        );
        request.headers.push("Subject", subject);
        request
            .headers
            .push("Contact", format!("<sip:{}>", contact_host(&inner, from_uri)));
        inner.pending_calls.insert(cid, request.clone());
        Ok((cid, request))
    }

    /// 发送出向 INVITE，登记客户端事务。
    pub fn call_send_initial_invite(&self, cid: i32, request: SipRequest) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.pending_calls.contains_key(&cid) {
                return Err(SipError::UnknownDialog(cid));
            }
            let (cseq, _) = request
                .cseq()
                .ok_or_else(|| SipError::Parse("INVITE without CSeq".into()))?;
            let call_id = request
                .call_id()
                .ok_or_else(|| SipError::Parse("INVITE without Call-ID".into()))?
                .to_string();
            inner.client_txs.push(ClientTx {
                call_id,
                cseq,
                method: SipMethod::Invite,
                kind: TxKind::Invite(cid),
                sent_at: Instant::now(),
            });
        }
        self.send_text(&request.to_wire())
    }

    /// 对话内发送 ACK（出向呼叫收到 2xx 后）。
    pub fn call_send_ack(&self, did: i32) -> Result<()> {
        let wire = {
            let inner = self.inner.lock().unwrap();
            let dialog = inner
                .dialog_by_did(did)
                .ok_or(SipError::UnknownDialog(did))?;

            let mut ack = SipRequest::new(SipMethod::Ack, &dialog.remote_target);
            ack.headers.push("Via", via_header(&inner));
            ack.headers.push("Max-Forwards", "70");
            ack.headers.push(
                "From",
                format!("<{}>;tag={}", dialog.local_uri, dialog.local_tag),
            );
            let to_value = if dialog.remote_tag.is_empty() {
                format!("<{}>", dialog.remote_uri)
            } else {
                format!("<{}>;tag={}", dialog.remote_uri, dialog.remote_tag)
            };
            ack.headers.push("To", to_value);
            ack.headers.push("Call-ID", &dialog.call_id);
            ack.headers.push("CSeq", format!("{} ACK", dialog.invite_cseq));
            ack.headers.push("User-Agent", &inner.config.user_agent);
            ack.to_wire()
        };
        self.send_text(&wire)
    }

    /// 对话内发送 BYE 并移除对话。
    pub fn call_terminate(&self, did: i32) -> Result<()> {
        let wire = {
            let mut inner = self.inner.lock().unwrap();
            let via = via_header(&inner);
            let user_agent = inner.config.user_agent.clone();

            let dialog = inner
                .dialogs
                .iter_mut()
                .find(|d| d.did == did)
                .ok_or(SipError::UnknownDialog(did))?;
            dialog.local_cseq += 1;

            let mut bye = SipRequest::new(SipMethod::Bye, dialog.remote_target.clone());
            bye.headers.push("Via", via);
            bye.headers.push("Max-Forwards", "70");
            bye.headers.push(
                "From",
                format!("<{}>;tag={}", dialog.local_uri, dialog.local_tag),
            );
            let to_value = if dialog.remote_tag.is_empty() {
                format!("<{}>", dialog.remote_uri)
            } else {
                format!("<{}>;tag={}", dialog.remote_uri, dialog.remote_tag)
            };
            bye.headers.push("To", to_value);
            bye.headers.push("Call-ID", dialog.call_id.clone());
            bye.headers.push("CSeq", format!("{} BYE", dialog.local_cseq));
            bye.headers.push("User-Agent", user_agent);

            let tx = ClientTx {
                call_id: dialog.call_id.clone(),
                cseq: dialog.local_cseq,
                method: SipMethod::Bye,
                kind: TxKind::Bye(did),
                sent_at: Instant::now(),
            };
            inner.client_txs.push(tx);
            inner.remove_dialog(did);
            bye.to_wire()
        };
        self.send_text(&wire)
    }

    // ---------------- 入向处理 ----------------

    fn process_incoming(&self, text: &str) -> Result<()> {
        let message = match SipMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(target: "sip", "discarding unparsable message: {}", e);
                return Ok(());
            }
        };

        let outgoing = {
            let mut inner = self.inner.lock().unwrap();
            match message {
                SipMessage::Request(req) => handle_request(&mut inner, req),
                SipMessage::Response(resp) => {
                    handle_response(&mut inner, resp);
                    Vec::new()
                }
            }
        };

        for wire in outgoing {
            self.send_text(&wire)?;
        }
        Ok(())
    }

    fn send_text(&self, wire: &str) -> Result<()> {
        self.conn.lock().unwrap().send(wire)
    }
}

/// 入向请求 → 事件 + 需立即发出的自动应答。
fn handle_request(inner: &mut StackInner, req: SipRequest) -> Vec<String> {
    let mut outgoing = Vec::new();
    match req.method {
        SipMethod::Message => {
            let tid = inner.alloc_id();
            inner.server_txs.insert(
                tid,
                ServerTx {
                    request: req.clone(),
                    did: -1,
                },
            );
            let mut event = SipEvent::new(SipEventKind::MessageNew);
            event.tid = tid;
            event.request = Some(req);
            inner.events.push_back(event);
        }
        SipMethod::Invite => {
            let tid = inner.alloc_id();
            let cid = inner.alloc_id();
            let did = inner.alloc_id();

            let call_id = req.call_id().unwrap_or_default().to_string();
            let remote_from = req.header("From").unwrap_or_default().to_string();
            let local_to = req.header("To").unwrap_or_default().to_string();
            let remote_target = req
                .header("Contact")
                .map(extract_uri)
                .unwrap_or_else(|| extract_uri(&remote_from))
                .to_string();
            let invite_cseq = req.cseq().map(|(n, _)| n).unwrap_or(1);

            inner.dialogs.push(Dialog {
                cid,
                did,
                call_id,
                local_tag: random_token(8),
                remote_tag: extract_tag(&remote_from).unwrap_or_default().to_string(),
                remote_target,
                local_uri: extract_uri(&local_to).to_string(),
                remote_uri: extract_uri(&remote_from).to_string(),
                invite_cseq,
                local_cseq: invite_cseq,
            });
            inner.server_txs.insert(
                tid,
                ServerTx {
                    request: req.clone(),
                    did,
                },
            );

            let mut event = SipEvent::new(SipEventKind::CallInvite);
            event.tid = tid;
            event.cid = cid;
            event.did = did;
            event.request = Some(req);
            inner.events.push_back(event);
        }
        SipMethod::Ack => {
            if let Some(dialog) = req
                .call_id()
                .and_then(|call_id| inner.dialog_by_call_id(call_id))
            {
                let mut event = SipEvent::new(SipEventKind::CallAck);
                event.cid = dialog.cid;
                event.did = dialog.did;
                event.request = Some(req);
                inner.events.push_back(event);
            } else {
                tracing::debug!(target: "sip", "ACK outside any dialog, ignored");
            }
        }
        SipMethod::Bye => {
            // 先 200 再上报，抑制重传
            outgoing.push(
                build_response_from_request(&req, 200, None, &inner.config.user_agent).to_wire(),
            );
            if let Some(dialog) = req
                .call_id()
                .and_then(|call_id| inner.dialog_by_call_id(call_id))
            {
                let (cid, did) = (dialog.cid, dialog.did);
                inner.remove_dialog(did);

                let mut event = SipEvent::new(SipEventKind::CallClosed);
                event.cid = cid;
                event.did = did;
                event.request = Some(req);
                inner.events.push_back(event);

                let mut released = SipEvent::new(SipEventKind::CallReleased);
                released.cid = cid;
                released.did = did;
                inner.events.push_back(released);
            } else {
                tracing::debug!(target: "sip", "BYE outside any dialog, answered 200 only");
            }
        }
        SipMethod::Cancel => {
            outgoing.push(
                build_response_from_request(&req, 200, None, &inner.config.user_agent).to_wire(),
            );
            if let Some(dialog) = req
                .call_id()
                .and_then(|call_id| inner.dialog_by_call_id(call_id))
            {
                let (cid, did) = (dialog.cid, dialog.did);
                inner.remove_dialog(did);
                let mut event = SipEvent::new(SipEventKind::CallCancelled);
                event.cid = cid;
                event.did = did;
                inner.events.push_back(event);
            }
        }
        SipMethod::Subscribe | SipMethod::Notify | SipMethod::Info => {
            outgoing.push(
                build_response_from_request(&req, 200, None, &inner.config.user_agent).to_wire(),
            );
            let mut event = SipEvent::new(SipEventKind::SubscriptionNotify);
            event.request = Some(req);
            inner.events.push_back(event);
        }
        SipMethod::Register => {
            tracing::warn!(target: "sip", "platform sent REGISTER to device, rejecting");
            outgoing.push(
                build_response_from_request(&req, 501, None, &inner.config.user_agent).to_wire(),
            );
        }
    }
    outgoing
}

/// 入向响应 → 匹配客户端事务并生成事件。
fn handle_response(inner: &mut StackInner, resp: SipResponse) {
    let Some((cseq, method)) = resp.cseq() else {
        tracing::warn!(target: "sip", "response without CSeq, dropped");
        return;
    };
    let call_id = resp.call_id().unwrap_or_default().to_string();

    // 1xx 临时响应不结束事务
    if resp.status_code < 200 {
        tracing::debug!(
            target: "sip",
            "provisional response {} for {} cseq {}",
            resp.status_code,
            method,
            cseq
        );
        return;
    }

    let position = inner.client_txs.iter().position(|tx| {
        tx.call_id == call_id && tx.cseq == cseq && tx.method.to_string() == method
    });
    let Some(position) = position else {
        tracing::debug!(
            target: "sip",
            "response {} matches no transaction (cseq {} {})",
            resp.status_code,
            cseq,
            method
        );
        return;
    };
    let tx = inner.client_txs.remove(position);

    match tx.kind {
        TxKind::Register(rid) => handle_register_response(inner, rid, resp),
        TxKind::Message => {
            let kind = if resp.status_code < 300 {
                SipEventKind::MessageAnswered
            } else {
                SipEventKind::MessageRequestFailure
            };
            let mut event = SipEvent::new(kind);
            event.response = Some(resp);
            inner.events.push_back(event);
        }
        TxKind::Invite(cid) => handle_invite_response(inner, cid, resp),
        TxKind::Bye(did) => {
            let mut event = SipEvent::new(SipEventKind::CallReleased);
            event.did = did;
            event.response = Some(resp);
            inner.events.push_back(event);
        }
    }
}

fn handle_register_response(inner: &mut StackInner, rid: RegId, resp: SipResponse) {
    let status = resp.status_code;
    if status == 200 {
        let mut event = SipEvent::new(SipEventKind::RegistrationSuccess);
        event.rid = rid;
        event.response = Some(resp);
        inner.events.push_back(event);
        return;
    }

    if status == 401 || status == 407 {
        let challenge_header = resp
            .header("WWW-Authenticate")
            .or_else(|| resp.header("Proxy-Authenticate"));
        if let Some(parsed) = challenge_header.and_then(auth::parse_challenge) {
            if let Some(registration) = inner.registrations.get_mut(&rid) {
                registration.challenge = Some(parsed);
                registration.nc = 0;
            }
        } else {
            tracing::warn!(target: "sip", "{} without usable digest challenge", status);
        }
    }

    let mut event = SipEvent::new(SipEventKind::RegistrationFailure);
    event.rid = rid;
    event.response = Some(resp);
    inner.events.push_back(event);
}

fn handle_invite_response(inner: &mut StackInner, cid: i32, resp: SipResponse) {
    let Some(invite) = inner.pending_calls.remove(&cid) else {
        tracing::debug!(target: "sip", "response for unknown call {}", cid);
        return;
    };

    if resp.status_code < 300 {
        let did = inner.alloc_id();
        let from_value = invite.header("From").unwrap_or_default().to_string();
        let to_value = resp.header("To").unwrap_or_default().to_string();
        let remote_target = resp
            .header("Contact")
            .map(extract_uri)
            .map(str::to_string)
            .unwrap_or_else(|| invite.uri.clone());
        let invite_cseq = invite.cseq().map(|(n, _)| n).unwrap_or(1);

        inner.dialogs.push(Dialog {
            cid,
            did,
            call_id: invite.call_id().unwrap_or_default().to_string(),
            local_tag: extract_tag(&from_value).unwrap_or_default().to_string(),
            remote_tag: extract_tag(&to_value).unwrap_or_default().to_string(),
            remote_target,
            local_uri: extract_uri(&from_value).to_string(),
            remote_uri: extract_uri(&to_value).to_string(),
            invite_cseq,
            local_cseq: invite_cseq,
        });

        let mut event = SipEvent::new(SipEventKind::CallAnswered);
        event.cid = cid;
        event.did = did;
        event.response = Some(resp);
        inner.events.push_back(event);
        return;
    }

    let kind = match resp.status_code {
        487 => SipEventKind::CallCancelled,
        300..=499 => SipEventKind::CallRequestFailure,
        500..=599 => SipEventKind::CallServerFailure,
        _ => SipEventKind::CallGlobalFailure,
    };
    let mut event = SipEvent::new(kind);
    event.cid = cid;
    event.response = Some(resp);
    inner.events.push_back(event);
}

// ---------------- 报文构造 ----------------

fn build_register_request(
    inner: &StackInner,
    registration: &Registration,
    authorization: Option<&str>,
) -> SipRequest {
    let mut request = SipRequest::new(SipMethod::Register, &registration.registrar_uri);
    fill_common_headers(
        &mut request,
        inner,
        &registration.from_uri,
        &registration.from_uri,
        &registration.from_tag,
        &registration.call_id,
        registration.cseq,
    );
    request
        .headers
        .push("Contact", format!("<sip:{}>", contact_host(inner, &registration.from_uri)));
    request
        .headers
        .push("Expires", registration.expires.to_string());
    if let Some(authorization) = authorization {
        request.headers.push("Authorization", authorization);
    }
    request
}

/// Via/From/To/Call-ID/CSeq/Max-Forwards/User-Agent 一把填。
fn fill_common_headers(
    request: &mut SipRequest,
    inner: &StackInner,
    from_uri: &str,
    to_uri: &str,
    from_tag: &str,
    call_id: &str,
    cseq: u32,
) {
    let method = request.method;
    request.headers.push("Via", via_header(inner));
    request.headers.push("Max-Forwards", "70");
    request
        .headers
        .push("From", format!("<{from_uri}>;tag={from_tag}"));
    request.headers.push("To", format!("<{to_uri}>"));
    request.headers.push("Call-ID", call_id);
    request.headers.push("CSeq", format!("{cseq} {method}"));
    request
        .headers
        .push("User-Agent", inner.config.user_agent.clone());
}

fn build_response_from_request(
    request: &SipRequest,
    code: u16,
    to_tag: Option<&str>,
    user_agent: &str,
) -> SipResponse {
    let mut response = SipResponse::new(code, crate::codes::describe(code as i32));
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("Via") {
            response.headers.push("Via", value.to_string());
        }
    }
    if let Some(from) = request.header("From") {
        response.headers.push("From", from.to_string());
    }
    if let Some(to) = request.header("To") {
        let value = match to_tag {
            Some(tag) if extract_tag(to).is_none() => format!("{to};tag={tag}"),
            _ => to.to_string(),
        };
        response.headers.push("To", value);
    }
    if let Some(call_id) = request.call_id() {
        response.headers.push("Call-ID", call_id.to_string());
    }
    if let Some(cseq) = request.header("CSeq") {
        response.headers.push("CSeq", cseq.to_string());
    }
    response.headers.push("User-Agent", user_agent);
    response
}

fn via_header(inner: &StackInner) -> String {
    format!(
        "SIP/2.0/TCP {};rport;branch=z9hG4bK{}",
        inner.local_addr,
        random_token(10)
    )
}

/// Contact 的 user@host:port：user 取 from_uri 的用户名，地址取本地连接地址。
fn contact_host(inner: &StackInner, from_uri: &str) -> String {
    let user = from_uri
        .strip_prefix("sip:")
        .and_then(|rest| rest.split('@').next())
        .unwrap_or_default();
    format!("{}@{}", user, inner.local_addr)
}

fn random_token(len: usize) -> String {
    const CHARS: &[u8] = b"abcdef0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

fn random_call_id(local_addr: &SocketAddr) -> String {
    format!("{}@{}", random_token(16), local_addr.ip())
}
