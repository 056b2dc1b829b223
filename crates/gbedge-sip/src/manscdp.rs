// MANSCDP 信令编解码
// 出向 XML 用模板拼接；入向 Query/Notify 用 quick-xml 反序列化

use quick_xml::de::from_str;
use serde::Deserialize;

use crate::device::DeviceIdentity;
use crate::error::{Result, SipError};

/// 设备 → 平台业务消息的 Content-Type（GB28181 的大小写写法）
pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"GB2312\"?>";

const MANUFACTURER: &str = "GBEdge";
const MODEL: &str = "EdgeCamera";
const FIRMWARE: &str = "1.0.0";

/// 入向消息的根元素类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManscdpKind {
    Query,
    Notify,
}

/// Query/Notify 共有的载荷字段。
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpPayload {
    /// 命令类型
    pub cmd_type: String,

    /// 序列号（原样回显，保留文本形式）
    #[serde(rename = "SN", default)]
    pub sn: String,

    /// 设备 ID
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    /// 语音广播源（Notify/Broadcast）
    #[serde(rename = "SourceID", default)]
    pub source_id: String,

    /// 语音广播目标（Notify/Broadcast）
    #[serde(rename = "TargetID", default)]
    pub target_id: String,
}

/// 解析后的 MANSCDP 消息。
#[derive(Debug)]
pub struct ManscdpMessage {
    pub kind: ManscdpKind,
    pub payload: ManscdpPayload,
}

/// 解析平台下发的 MANSCDP XML。根元素只认 Query 与 Notify。
pub fn parse(xml: &str) -> Result<ManscdpMessage> {
    let kind = match root_element(xml) {
        Some("Query") => ManscdpKind::Query,
        Some("Notify") => ManscdpKind::Notify,
        Some(other) => {
            return Err(SipError::Xml(format!("unexpected root element {other}")));
        }
        None => return Err(SipError::Xml("no root element".to_string())),
    };

    let payload: ManscdpPayload =
        from_str(xml.trim()).map_err(|e| SipError::Xml(e.to_string()))?;
    Ok(ManscdpMessage { kind, payload })
}

/// 找出首个元素名（跳过 XML 声明与空白）。
fn root_element(xml: &str) -> Option<&str> {
    let mut rest = xml.trim_start();
    while let Some(stripped) = rest.strip_prefix("<?") {
        let end = stripped.find("?>")?;
        rest = stripped[end + 2..].trim_start();
    }
    let stripped = rest.strip_prefix('<')?;
    let end = stripped.find(|c: char| c == '>' || c.is_whitespace())?;
    Some(&stripped[..end])
}

/// DeviceInfo 查询应答。
pub fn build_device_info_response(sn: &str, identity: &DeviceIdentity) -> String {
    format!(
        "{XML_DECLARATION}\r\n\
         <Response>\r\n\
         <CmdType>DeviceInfo</CmdType>\r\n\
         <SN>{sn}</SN>\r\n\
         <DeviceID>{device_id}</DeviceID>\r\n\
         <DeviceName>{device_name}</DeviceName>\r\n\
         <Manufacturer>{MANUFACTURER}</Manufacturer>\r\n\
         <Model>{MODEL}</Model>\r\n\
         <Firmware>{FIRMWARE}</Firmware>\r\n\
         <SerialNumber>{serial}</SerialNumber>\r\n\
         <Status>ON</Status>\r\n\
         </Response>\r\n",
        device_id = identity.device_id,
        device_name = identity.device_name,
        serial = identity.serial_number,
    )
}

/// Catalog 查询应答：单通道目录。
pub fn build_catalog_response(sn: &str, identity: &DeviceIdentity) -> String {
    format!(
        "{XML_DECLARATION}\r\n\
         <Response>\r\n\
         <CmdType>Catalog</CmdType>\r\n\
         <SN>{sn}</SN>\r\n\
         <DeviceID>{device_id}</DeviceID>\r\n\
         <SumNum>1</SumNum>\r\n\
         <DeviceList Num=\"1\">\r\n\
         <Item>\r\n\
         <DeviceID>{channel_id}</DeviceID>\r\n\
         <Name>Channel01</Name>\r\n\
         <Manufacturer>{MANUFACTURER}</Manufacturer>\r\n\
         <Model>{MODEL}</Model>\r\n\
         <Owner>{device_name}</Owner>\r\n\
         <CivilCode>{civil_code}</CivilCode>\r\n\
         <Address></Address>\r\n\
         <ParentID>{device_id}</ParentID>\r\n\
         <Parental>1</Parental>\r\n\
         <SafetyWay>0</SafetyWay>\r\n\
         <RegisterWay>1</RegisterWay>\r\n\
         <Secrecy>0</Secrecy>\r\n\
         <Status>ON</Status>\r\n\
         <Longitude>{longitude:.6}</Longitude>\r\n\
         <Latitude>{latitude:.6}</Latitude>\r\n\
         <Altitude>0</Altitude>\r\n\
         </Item>\r\n\
         </DeviceList>\r\n\
         </Response>\r\n",
        device_id = identity.device_id,
        channel_id = identity.channel_id(),
        device_name = identity.device_name,
        civil_code = identity.server_domain,
        longitude = identity.longitude,
        latitude = identity.latitude,
    )
}

/// 心跳通知。
pub fn build_keepalive(sn: u32, device_id: &str) -> String {
    format!(
        "{XML_DECLARATION}\r\n\
         <Notify>\r\n\
         <CmdType>Keepalive</CmdType>\r\n\
         <SN>{sn}</SN>\r\n\
         <DeviceID>{device_id}</DeviceID>\r\n\
         <Status>OK</Status>\r\n\
         </Notify>\r\n"
    )
}
