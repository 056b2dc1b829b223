// SIP 消息解析与生成
// 设备侧只面向平台一条连接，消息统一走 CRLF 文本编解码

use std::fmt;

use crate::error::{Result, SipError};

pub const SIP_VERSION: &str = "SIP/2.0";

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "CANCEL" => Ok(SipMethod::Cancel),
            "MESSAGE" => Ok(SipMethod::Message),
            "SUBSCRIBE" => Ok(SipMethod::Subscribe),
            "NOTIFY" => Ok(SipMethod::Notify),
            "INFO" => Ok(SipMethod::Info),
            other => Err(SipError::Parse(format!("unknown method {other}"))),
        }
    }
}

/// 保序的头部列表。Via 等头部的顺序有协议含义，不能用散列表。
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 首个同名头部（大小写不敏感）。
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 替换首个同名头部，不存在则追加。
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value.into(),
            None => self.push(name.to_string(), value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn render(&self, out: &mut String, body_len: usize) {
        for (name, value) in self.iter() {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {body_len}\r\n"));
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: String,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, body: impl Into<String>, content_type: &str) {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
    }

    /// 生成线路报文（自动补 Content-Length）。
    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        self.headers.render(&mut out, self.body.len());
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    /// CSeq 头拆为（序号, 方法）。
    pub fn cseq(&self) -> Option<(u32, String)> {
        parse_cseq(self.header("CSeq")?)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: String,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: SIP_VERSION.to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, body: impl Into<String>, content_type: &str) {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        );
        self.headers.render(&mut out, self.body.len());
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    pub fn cseq(&self) -> Option<(u32, String)> {
        parse_cseq(self.header("CSeq")?)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let (head, body) = split_head_and_body(text);
        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SipError::Parse("empty message".into()))?;

        let headers = parse_headers(lines)?;

        if let Some(rest) = start_line.strip_prefix("SIP/") {
            // 状态行：SIP/2.0 <code> <reason>
            let mut parts = rest.splitn(3, ' ');
            let version = format!("SIP/{}", parts.next().unwrap_or_default());
            let status_code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| SipError::Parse(format!("bad status line: {start_line}")))?;
            let reason_phrase = parts.next().unwrap_or_default().to_string();
            Ok(SipMessage::Response(SipResponse {
                version,
                status_code,
                reason_phrase,
                headers,
                body: body.to_string(),
            }))
        } else {
            // 请求行：<METHOD> <uri> SIP/2.0
            let mut parts = start_line.split_whitespace();
            let method: SipMethod = parts
                .next()
                .ok_or_else(|| SipError::Parse("missing method".into()))?
                .parse()?;
            let uri = parts
                .next()
                .ok_or_else(|| SipError::Parse("missing request uri".into()))?
                .to_string();
            let version = parts.next().unwrap_or(SIP_VERSION).to_string();
            Ok(SipMessage::Request(SipRequest {
                method,
                uri,
                version,
                headers,
                body: body.to_string(),
            }))
        }
    }
}

fn split_head_and_body(input: &str) -> (&str, &str) {
    match input.find("\r\n\r\n") {
        Some(pos) => (&input[..pos], &input[pos + 4..]),
        None => (input, ""),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SipError::Parse(format!("bad header line: {line}")))?;
        headers.push(name.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn parse_cseq(value: &str) -> Option<(u32, String)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse::<u32>().ok()?;
    let method = parts.next()?.to_string();
    Some((seq, method))
}

/// 从 From/To 的 name-addr 中提取 tag 参数。
pub fn extract_tag(header_value: &str) -> Option<&str> {
    header_value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.eq_ignore_ascii_case("tag") {
            Some(value)
        } else {
            None
        }
    })
}

/// 从 name-addr（`<sip:user@host>` 或裸 URI）中提取 URI 本体。
pub fn extract_uri(header_value: &str) -> &str {
    let value = header_value.trim();
    match (value.find('<'), value.find('>')) {
        (Some(open), Some(close)) if open < close => &value[open + 1..close],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}
