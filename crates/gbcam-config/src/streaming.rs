use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 目录条目上限默认值（超过会导致 UDP 响应超限）
pub const CATALOG_MAX_ITEMS_DEFAULT: usize = 20;

/// 文件播放结束策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EosPolicy {
    /// 循环播放
    Loop,
    /// 结束会话
    Terminate,
}

impl Default for EosPolicy {
    fn default() -> Self {
        Self::Loop
    }
}

/// RTSP 直播源绑定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RtspSourceConfig {
    /// RTSP 地址
    pub url: String,

    /// 通道名称
    pub name: String,

    /// 是否启用
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 指定通道 ID（缺省时按序生成）
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// 编码参数组
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderPreset {
    /// 输出宽度
    #[serde(default = "default_width")]
    pub width: u32,

    /// 输出高度
    #[serde(default = "default_height")]
    pub height: u32,

    /// 帧率
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// 码率 (kbps)
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// 关键帧间隔（帧）
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,

    /// H.264 profile
    #[serde(default = "default_profile")]
    pub profile: String,

    /// 编码调优
    #[serde(default = "default_tune")]
    pub tune: String,
}

impl Default for EncoderPreset {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            bitrate: default_bitrate(),
            keyframe_interval: default_keyframe_interval(),
            profile: default_profile(),
            tune: default_tune(),
        }
    }
}

/// 流媒体配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    /// 命名参数组
    #[serde(default)]
    pub presets: HashMap<String, EncoderPreset>,

    /// RTSP 直播源
    #[serde(default)]
    pub rtsp_sources: Vec<RtspSourceConfig>,

    /// 目录条目上限
    #[serde(default = "default_catalog_max_items")]
    pub catalog_max_items: usize,

    /// 文件播放结束策略
    #[serde(default)]
    pub eos_policy: EosPolicy,

    /// 单个数据报预算（字节），超出时拆分或转 TCP
    #[serde(default = "default_datagram_budget")]
    pub datagram_budget: usize,

    /// 单会话最大重启次数
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            presets: HashMap::new(),
            rtsp_sources: Vec::new(),
            catalog_max_items: default_catalog_max_items(),
            eos_policy: EosPolicy::default(),
            datagram_budget: default_datagram_budget(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl StreamingConfig {
    /// 按名称取参数组，不存在时退回默认组
    pub fn preset(&self, name: &str) -> EncoderPreset {
        self.presets.get(name).cloned().unwrap_or_default()
    }

    /// GB28181 format 字段（codec:res）对应的分辨率
    ///
    /// 1:1=QCIF 1:2=CIF 1:3=4CIF 1:4=D1，未识别时退回 4CIF。
    pub fn format_resolution(format_id: &str) -> (u32, u32) {
        match format_id {
            "1:1" => (176, 144),
            "1:2" => (352, 288),
            "1:3" => (704, 576),
            "1:4" => (720, 576),
            _ => (704, 576),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    704
}

fn default_height() -> u32 {
    576
}

fn default_framerate() -> u32 {
    25
}

fn default_bitrate() -> u32 {
    1024
}

fn default_keyframe_interval() -> u32 {
    50
}

fn default_profile() -> String {
    "baseline".to_string()
}

fn default_tune() -> String {
    "zerolatency".to_string()
}

fn default_catalog_max_items() -> usize {
    CATALOG_MAX_ITEMS_DEFAULT
}

fn default_datagram_budget() -> usize {
    1400
}

fn default_max_restarts() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_preset() {
        let preset = EncoderPreset::default();
        assert_eq!(preset.width, 704);
        assert_eq!(preset.height, 576);
        assert_eq!(preset.bitrate, 1024);
        assert_eq!(preset.keyframe_interval, 50);
        assert_eq!(preset.profile, "baseline");
        assert_eq!(preset.tune, "zerolatency");
    }

    #[test]
    fn test_format_resolution() {
        assert_eq!(StreamingConfig::format_resolution("1:1"), (176, 144));
        assert_eq!(StreamingConfig::format_resolution("1:2"), (352, 288));
        assert_eq!(StreamingConfig::format_resolution("1:3"), (704, 576));
        assert_eq!(StreamingConfig::format_resolution("1:4"), (720, 576));
        assert_eq!(StreamingConfig::format_resolution("9:9"), (704, 576));
    }

    #[test]
    fn test_named_preset_fallback() {
        let cfg = StreamingConfig::default();
        let preset = cfg.preset("does-not-exist");
        assert_eq!(preset.width, 704);
    }

    #[test]
    fn test_rtsp_source_deserialize() {
        let cfg: StreamingConfig = toml::from_str(
            r#"
[[rtsp_sources]]
url = "rtsp://10.0.0.9/main"
name = "Gate"
channel_id = "34020000001320000099"
"#,
        )
        .unwrap();

        assert_eq!(cfg.rtsp_sources.len(), 1);
        assert!(cfg.rtsp_sources[0].enabled);
        assert_eq!(
            cfg.rtsp_sources[0].channel_id.as_deref(),
            Some("34020000001320000099")
        );
    }
}
