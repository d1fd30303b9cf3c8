// 媒体会话管理
// 会话以 Call-ID 为键；同一 (通道, 远端) 最多一路活跃会话，
// 新 INVITE 先有序停掉旧会话再替换。

use crate::media::pipeline::{self, PipelineHandle, PipelineSpec, PipelineState};
use crate::{GbError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Playing,
    Error,
    Stopping,
    Stopped,
}

/// 媒体会话
#[derive(Debug, Clone)]
pub struct MediaSession {
    /// 会话 ID（Call-ID）
    pub session_id: String,

    /// 通道 ID
    pub channel_id: String,

    /// RTP 目的端
    pub remote_rtp: SocketAddr,

    /// SSRC（y= 原文，保留前导零）
    pub ssrc: String,

    /// 管线声明（重启时复用）
    pub spec: PipelineSpec,

    /// 本地 RTP 端口（SDP answer 使用）
    pub local_rtp_port: u16,

    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub error_count: u32,
    pub restart_count: u32,
}

struct Entry {
    session: MediaSession,
    handle: Option<PipelineHandle>,
}

/// 会话管理器
pub struct SessionManager {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// 建立会话：按声明起管线，等待初始化完成
    ///
    /// 同 (通道, 远端) 已有会话时先有序停止旧会话；
    /// 容量耗尽返回 Resource（调用方回 503）。
    pub async fn start_session(
        &self,
        session_id: &str,
        channel_id: &str,
        ssrc: &str,
        spec: PipelineSpec,
    ) -> Result<MediaSession> {
        // 替换语义：同 (channel, remote) 最多一路
        let duplicate = {
            let entries = self.entries.read().await;
            entries
                .values()
                .find(|e| {
                    e.session.channel_id == channel_id && e.session.remote_rtp == spec.target
                })
                .map(|e| e.session.session_id.clone())
        };
        if let Some(old_id) = duplicate {
            tracing::info!(
                target: "gbcam::media",
                session_id = %old_id,
                %channel_id,
                "replacing existing session for same channel and endpoint",
            );
            self.stop_session(&old_id).await;
        }

        {
            let entries = self.entries.read().await;
            if entries.len() >= self.max_sessions {
                return Err(GbError::Resource(format!(
                    "session limit {} reached",
                    self.max_sessions
                )));
            }
        }

        let handle = pipeline::spawn(spec.clone()).await?;
        handle.wait_ready(Duration::from_secs(5)).await?;

        let session = MediaSession {
            session_id: session_id.to_string(),
            channel_id: channel_id.to_string(),
            remote_rtp: spec.target,
            ssrc: ssrc.to_string(),
            local_rtp_port: handle.local_rtp_port(),
            spec,
            state: SessionState::Playing,
            started_at: Utc::now(),
            error_count: 0,
            restart_count: 0,
        };

        let mut entries = self.entries.write().await;
        entries.insert(
            session_id.to_string(),
            Entry {
                session: session.clone(),
                handle: Some(handle),
            },
        );

        tracing::info!(
            target: "gbcam::media",
            %session_id,
            %channel_id,
            remote = %session.remote_rtp,
            ssrc = %session.ssrc,
            "media session started",
        );

        Ok(session)
    }

    /// 停止会话并移除
    pub async fn stop_session(&self, session_id: &str) -> Option<MediaSession> {
        let (mut session, handle) = {
            let mut entries = self.entries.write().await;
            let entry = entries.remove(session_id)?;
            (entry.session, entry.handle)
        };

        session.state = SessionState::Stopping;
        if let Some(handle) = handle {
            handle.stop().await;
        }
        session.state = SessionState::Stopped;

        tracing::info!(target: "gbcam::media", %session_id, "media session stopped");
        Some(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<MediaSession> {
        let entries = self.entries.read().await;
        entries.get(session_id).map(|e| e.session.clone())
    }

    pub async fn list(&self) -> Vec<MediaSession> {
        let entries = self.entries.read().await;
        entries.values().map(|e| e.session.clone()).collect()
    }

    pub async fn count(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    /// 会话管线的状态通道（监护者订阅）
    pub async fn watch_pipeline(&self, session_id: &str) -> Option<watch::Receiver<PipelineState>> {
        let entries = self.entries.read().await;
        entries
            .get(session_id)
            .and_then(|e| e.handle.as_ref())
            .map(|h| h.watch_state())
    }

    /// 标记管线错误
    pub async fn mark_error(&self, session_id: &str) -> Option<MediaSession> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(session_id)?;
        entry.session.state = SessionState::Error;
        entry.session.error_count += 1;
        Some(entry.session.clone())
    }

    /// 重启管线：换上新句柄并递增重启计数
    pub async fn restart_pipeline(&self, session_id: &str) -> Result<watch::Receiver<PipelineState>> {
        let spec = {
            let entries = self.entries.read().await;
            entries
                .get(session_id)
                .map(|e| e.session.spec.clone())
                .ok_or_else(|| GbError::SessionNotFound(session_id.to_string()))?
        };

        let handle = pipeline::spawn(spec).await?;
        handle.wait_ready(Duration::from_secs(5)).await?;
        let rx = handle.watch_state();

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(session_id)
            .ok_or_else(|| GbError::SessionNotFound(session_id.to_string()))?;

        if let Some(old) = entry.handle.take() {
            old.stop().await;
        }
        entry.handle = Some(handle);
        entry.session.state = SessionState::Playing;
        entry.session.restart_count += 1;
        entry.session.started_at = Utc::now();

        tracing::info!(
            target: "gbcam::media",
            %session_id,
            restarts = entry.session.restart_count,
            "pipeline restarted",
        );

        Ok(rx)
    }

    /// 稳定播放达标后清零重启计数
    pub async fn reset_restart_count(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(session_id) {
            entry.session.restart_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::pipeline::{PayloadKind, PipelineSource};
    use gbcam_config::{EncoderPreset, EosPolicy};
    use std::io::Write;
    use std::path::PathBuf;
    use tokio::net::UdpSocket;

    async fn media_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&vec![0x33u8; 64 * 1024])
            .unwrap();
        (dir, path)
    }

    fn spec_for(path: PathBuf, target: SocketAddr) -> PipelineSpec {
        PipelineSpec {
            source: PipelineSource::File {
                path,
                on_eos: EosPolicy::Loop,
            },
            encoder: EncoderPreset::default(),
            payload_type: 96,
            ssrc: 100000001,
            payload_kind: PayloadKind::Ps,
            target,
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let (_dir, path) = media_file().await;

        let manager = SessionManager::new(8);
        let session = manager
            .start_session("call-1", "ch-1", "0100000001", spec_for(path, target))
            .await
            .unwrap();

        assert_eq!(session.state, SessionState::Playing);
        assert_eq!(session.ssrc, "0100000001");
        assert!(session.local_rtp_port > 0);
        assert_eq!(manager.count().await, 1);

        let stopped = manager.stop_session("call-1").await.unwrap();
        assert_eq!(stopped.state, SessionState::Stopped);
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_channel_endpoint_replaced() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let (_dir, path) = media_file().await;

        let manager = SessionManager::new(8);
        manager
            .start_session("call-1", "ch-1", "0100000001", spec_for(path.clone(), target))
            .await
            .unwrap();
        manager
            .start_session("call-2", "ch-1", "0100000002", spec_for(path, target))
            .await
            .unwrap();

        // 旧会话被替换，(channel, remote) 仍只有一路
        assert_eq!(manager.count().await, 1);
        assert!(manager.get("call-1").await.is_none());
        assert!(manager.get("call-2").await.is_some());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let (_dir, path) = media_file().await;

        let manager = SessionManager::new(1);
        manager
            .start_session("call-1", "ch-1", "1", spec_for(path.clone(), target))
            .await
            .unwrap();

        let other: SocketAddr = "127.0.0.1:65001".parse().unwrap();
        match manager
            .start_session("call-2", "ch-2", "2", spec_for(path, other))
            .await
        {
            Err(GbError::Resource(_)) => {}
            other => panic!("expected resource error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_restart_pipeline_increments_count() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let (_dir, path) = media_file().await;

        let manager = SessionManager::new(8);
        manager
            .start_session("call-1", "ch-1", "1", spec_for(path, target))
            .await
            .unwrap();

        manager.mark_error("call-1").await.unwrap();
        manager.restart_pipeline("call-1").await.unwrap();

        let session = manager.get("call-1").await.unwrap();
        assert_eq!(session.restart_count, 1);
        assert_eq!(session.error_count, 1);
        assert_eq!(session.state, SessionState::Playing);

        manager.reset_restart_count("call-1").await;
        assert_eq!(manager.get("call-1").await.unwrap().restart_count, 0);

        manager.stop_session("call-1").await;
    }
}
