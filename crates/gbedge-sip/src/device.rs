// 设备身份
// 构造期固定，之后只读；派生各类 SIP URI 与通道编号

/// GB28181 设备身份参数。
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// 本机 IP（SDP/Via/Contact 使用）
    pub local_ip: String,
    /// 平台 IP
    pub server_ip: String,
    /// 平台 SIP 端口
    pub server_port: u16,
    /// 平台国标编码
    pub server_id: String,
    /// 平台 SIP 域
    pub server_domain: String,
    /// 设备国标编码
    pub device_id: String,
    /// 设备序列号
    pub serial_number: String,
    /// 设备显示名（鉴权用户名）
    pub device_name: String,
    /// 注册口令
    pub password: String,
    /// 经度
    pub longitude: f64,
    /// 纬度
    pub latitude: f64,
}

impl DeviceIdentity {
    /// 设备在平台 SIP 域内的地址：`sip:<device_id>@<domain>`
    pub fn device_uri(&self) -> String {
        format!("sip:{}@{}", self.device_id, self.server_domain)
    }

    /// 注册服务器地址：`sip:<server_ip>:<server_port>`
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}:{}", self.server_ip, self.server_port)
    }

    /// 平台的可路由地址：`sip:<server_id>@<server_ip>:<server_port>`
    pub fn platform_uri(&self) -> String {
        format!("sip:{}@{}:{}", self.server_id, self.server_ip, self.server_port)
    }

    /// 设备的联系地址：`sip:<device_id>@<local_ip>:<local_port>`
    pub fn contact_uri(&self, local_port: u16) -> String {
        format!("sip:{}@{}:{}", self.device_id, self.local_ip, local_port)
    }

    /// 首路通道编号：设备编码前 16 位 + "0001"
    pub fn channel_id(&self) -> String {
        let prefix: String = self.device_id.chars().take(16).collect();
        format!("{prefix}0001")
    }
}
