// 事件码
// SIP 状态码与设备自定义码共用一个回调通道，这里统一给出文本

/// 注册成功
pub const CODE_REGISTERED: i32 = 200;
/// 注销成功
pub const CODE_UNREGISTERED: i32 = 201;
/// 开始推流
pub const CODE_PUSH_STARTED: i32 = 1000;
/// 停止推流
pub const CODE_PUSH_STOPPED: i32 = 1001;
/// 开始接收语音
pub const CODE_AUDIO_STARTED: i32 = 2000;
/// 停止接收语音
pub const CODE_AUDIO_STOPPED: i32 = 2001;

/// 构建注册请求失败
pub const CODE_BUILD_REGISTER_FAILED: i32 = 4011;
/// 发送注册请求失败
pub const CODE_SEND_REGISTER_FAILED: i32 = 4012;
/// 构建鉴权注册请求失败
pub const CODE_BUILD_AUTH_REGISTER_FAILED: i32 = 4013;
/// 发送鉴权注册请求失败
pub const CODE_SEND_AUTH_REGISTER_FAILED: i32 = 4014;
/// 构建注销请求失败
pub const CODE_BUILD_UNREGISTER_FAILED: i32 = 4021;
/// 发送注销请求失败
pub const CODE_SEND_UNREGISTER_FAILED: i32 = 4022;

/// SIP 栈初始化/连接失败
pub const CODE_STACK_INIT_FAILED: i32 = 5001;
/// RTP 发送器初始化失败
pub const CODE_RTP_INIT_FAILED: i32 = 5002;
/// 语音接收器初始化失败
pub const CODE_AUDIO_INIT_FAILED: i32 = 5003;
/// 语音 INVITE 构建/发送失败
pub const CODE_AUDIO_INVITE_FAILED: i32 = 5004;

/// 事件码的可读文本。
pub fn describe(code: i32) -> String {
    let text = match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        201 => "Unregistered",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        600 => "Busy Everywhere",
        603 => "Decline",

        CODE_PUSH_STARTED => "Media push started",
        CODE_PUSH_STOPPED => "Media push stopped",
        CODE_AUDIO_STARTED => "Audio receive started",
        CODE_AUDIO_STOPPED => "Audio receive stopped",

        CODE_BUILD_REGISTER_FAILED => "Failed to build REGISTER",
        CODE_SEND_REGISTER_FAILED => "Failed to send REGISTER",
        CODE_BUILD_AUTH_REGISTER_FAILED => "Failed to build authorized REGISTER",
        CODE_SEND_AUTH_REGISTER_FAILED => "Failed to send authorized REGISTER",
        CODE_BUILD_UNREGISTER_FAILED => "Failed to build unregister request",
        CODE_SEND_UNREGISTER_FAILED => "Failed to send unregister request",

        CODE_STACK_INIT_FAILED => "SIP stack initialization failed",
        CODE_RTP_INIT_FAILED => "RTP sender initialization failed",
        CODE_AUDIO_INIT_FAILED => "Audio receiver initialization failed",
        CODE_AUDIO_INVITE_FAILED => "Audio INVITE failed",

        other => return format!("Status {other}"),
    };
    text.to_string()
}
