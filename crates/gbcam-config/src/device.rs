use serde::{Deserialize, Serialize};

/// SIP 传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SipTransport {
    Udp,
    Tcp,
}

impl Default for SipTransport {
    fn default() -> Self {
        Self::Udp
    }
}

/// SIP 信令配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SipConfig {
    /// 平台 SIP 服务器地址
    pub server: String,

    /// 平台 SIP 端口
    #[serde(default = "default_sip_port")]
    pub port: u16,

    /// 传输协议（udp/tcp）
    #[serde(default)]
    pub transport: SipTransport,

    /// 本地监听端口
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// 本地绑定地址
    #[serde(default = "default_local_ip")]
    pub local_ip: String,

    /// 对外通告的联系地址（NAT 场景下与绑定地址不同）
    #[serde(default)]
    pub contact_ip: Option<String>,

    /// Digest 鉴权用户名（默认与 device_id 相同）
    #[serde(default)]
    pub username: Option<String>,

    /// Digest 鉴权密码
    #[serde(default)]
    pub password: String,

    /// SIP 域（realm）
    #[serde(default = "default_realm")]
    pub realm: String,

    /// 注册有效期（秒）
    #[serde(default = "default_register_expires")]
    pub register_expires: u32,

    /// 心跳间隔（秒）
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl SipConfig {
    /// 通告给平台的联系地址，未配置时退回绑定地址
    pub fn effective_contact_ip(&self) -> &str {
        self.contact_ip.as_deref().unwrap_or(&self.local_ip)
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: default_sip_port(),
            transport: SipTransport::Udp,
            local_port: default_local_port(),
            local_ip: default_local_ip(),
            contact_ip: None,
            username: None,
            password: String::new(),
            realm: default_realm(),
            register_expires: default_register_expires(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

/// 设备级配置（进程生命周期内不可变）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// 20 位 GB28181 设备 ID
    pub device_id: String,

    /// SIP 信令配置
    #[serde(default)]
    pub sip: SipConfig,

    /// 媒体扫描根目录
    #[serde(default = "default_stream_directory")]
    pub stream_directory: String,

    /// 设备名称（DeviceInfo 响应中使用）
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// 厂商
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    /// 型号
    #[serde(default = "default_model")]
    pub model: String,

    /// 固件版本
    #[serde(default = "default_firmware")]
    pub firmware: String,
}

impl DeviceConfig {
    /// 鉴权用户名，未配置时使用 device_id
    pub fn sip_username(&self) -> &str {
        self.sip.username.as_deref().unwrap_or(&self.device_id)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "34020000001110000001".to_string(),
            sip: SipConfig::default(),
            stream_directory: default_stream_directory(),
            device_name: default_device_name(),
            manufacturer: default_manufacturer(),
            model: default_model(),
            firmware: default_firmware(),
        }
    }
}

fn default_sip_port() -> u16 {
    5060
}

fn default_local_port() -> u16 {
    5080
}

fn default_local_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_realm() -> String {
    "3402000000".to_string()
}

fn default_register_expires() -> u32 {
    3600
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_stream_directory() -> String {
    "./media".to_string()
}

fn default_device_name() -> String {
    "GBCam Virtual Device".to_string()
}

fn default_manufacturer() -> String {
    "GBCam".to_string()
}

fn default_model() -> String {
    "Video-File".to_string()
}

fn default_firmware() -> String {
    "0.1.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.sip.local_port, 5080);
        assert_eq!(cfg.sip.register_expires, 3600);
        assert_eq!(cfg.sip.keepalive_interval, 30);
        assert_eq!(cfg.sip_username(), cfg.device_id);
    }

    #[test]
    fn test_contact_ip_fallback() {
        let mut cfg = SipConfig::default();
        cfg.local_ip = "192.168.1.10".to_string();
        assert_eq!(cfg.effective_contact_ip(), "192.168.1.10");

        cfg.contact_ip = Some("203.0.113.8".to_string());
        assert_eq!(cfg.effective_contact_ip(), "203.0.113.8");
    }

    #[test]
    fn test_transport_deserialize() {
        let cfg: SipConfig =
            toml::from_str("server = \"10.0.0.1\"\ntransport = \"tcp\"").unwrap();
        assert_eq!(cfg.transport, SipTransport::Tcp);
    }
}
