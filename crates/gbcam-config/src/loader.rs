use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{DeviceConfig, StreamingConfig};

/// 完整进程配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GbcamConfig {
    #[serde(flatten)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,
}

/// 配置加载器
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// 加载配置，文件不存在时返回默认配置
    pub fn load(&self) -> Result<GbcamConfig> {
        if !self.config_path.exists() {
            return Ok(GbcamConfig::default());
        }

        let config = Config::builder()
            .add_source(File::new(
                self.config_path
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 启动前校验，无效配置拒绝启动
    pub fn validate(cfg: &GbcamConfig) -> Result<()> {
        if !is_gb_id(&cfg.device.device_id) {
            return Err(anyhow!(
                "device_id must be a 20-digit decimal GB28181 ID, got {:?}",
                cfg.device.device_id
            ));
        }

        if cfg.device.sip.server.is_empty() {
            return Err(anyhow!("sip.server must not be empty"));
        }

        if cfg.device.sip.keepalive_interval == 0 {
            return Err(anyhow!("sip.keepalive_interval must be greater than 0"));
        }

        if cfg.device.sip.register_expires < 60 {
            return Err(anyhow!(
                "sip.register_expires must be at least 60 seconds, got {}",
                cfg.device.sip.register_expires
            ));
        }

        if cfg.streaming.catalog_max_items == 0 {
            return Err(anyhow!("streaming.catalog_max_items must be greater than 0"));
        }

        for source in &cfg.streaming.rtsp_sources {
            if !source.url.starts_with("rtsp://") {
                return Err(anyhow!("rtsp source {:?} is not an rtsp:// URL", source.name));
            }
            if let Some(id) = &source.channel_id {
                if !is_gb_id(id) {
                    return Err(anyhow!(
                        "rtsp source {:?} channel_id must be a 20-digit ID",
                        source.name
                    ));
                }
            }
        }

        Ok(())
    }
}

fn is_gb_id(id: &str) -> bool {
    id.len() == 20 && id.bytes().all(|b| b.is_ascii_digit())
}
