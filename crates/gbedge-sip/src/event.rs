// SIP 栈事件
// 事件循环逐个取出并分发，承载对应的请求/响应原文

use crate::message::{SipRequest, SipResponse};

/// 事件类别，对齐设备侧会用到的 eXosip 事件族。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipEventKind {
    /// 注册（或注销）成功
    RegistrationSuccess,
    /// 注册失败（含 401/407 挑战）
    RegistrationFailure,
    /// 对话外新请求（MESSAGE）
    MessageNew,
    /// 出向 MESSAGE 收到 2xx
    MessageAnswered,
    /// 出向 MESSAGE 失败
    MessageRequestFailure,
    /// 平台发来 INVITE
    CallInvite,
    /// 出向 INVITE 收到 2xx
    CallAnswered,
    /// 对话内收到 ACK
    CallAck,
    /// 收到 BYE，呼叫结束
    CallClosed,
    /// 呼叫资源释放
    CallReleased,
    /// 出向 INVITE 超时无应答
    CallNoAnswer,
    /// 呼叫被取消
    CallCancelled,
    /// 出向呼叫 4xx
    CallRequestFailure,
    /// 出向呼叫 5xx
    CallServerFailure,
    /// 出向呼叫 6xx
    CallGlobalFailure,
    /// 订阅/通知族（记录日志，不处理）
    SubscriptionNotify,
}

/// 一次栈事件。id 字段按事件类别可用性填充，未知为 -1。
#[derive(Debug, Clone)]
pub struct SipEvent {
    pub kind: SipEventKind,
    /// 事务 id（应答入向请求用）
    pub tid: i32,
    /// 呼叫 id
    pub cid: i32,
    /// 对话 id
    pub did: i32,
    /// 注册 id
    pub rid: i32,
    /// 入向请求原文
    pub request: Option<SipRequest>,
    /// 入向响应原文
    pub response: Option<SipResponse>,
}

impl SipEvent {
    pub fn new(kind: SipEventKind) -> Self {
        Self {
            kind,
            tid: -1,
            cid: -1,
            did: -1,
            rid: -1,
            request: None,
            response: None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status_code)
    }
}
