// gbedge-sip: GB28181 边缘设备信令面
//
// 设备侧 SIP 栈：注册（摘要鉴权）、心跳、MANSCDP 查询应答、
// 上行拉流 INVITE 应答与下行语音广播 INVITE 发起。

pub mod agent;
pub mod auth;
pub mod codes;
pub mod device;
pub mod error;
pub mod event;
pub mod manscdp;
pub mod message;
pub mod sdp;
pub mod stack;
pub mod transport;

pub use agent::{AgentCallbacks, AgentConfig, MediaEdgeAgent, RegisterState};
pub use device::DeviceIdentity;
pub use error::{Result, SipError};
