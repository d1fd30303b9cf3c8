// 监护与健康
// 每会话看门狗：出错按 {1,2,5,10,30}s 退避重启，超过
// max_restarts 放弃并通知信令侧收尾（BYE/NOTIFY）；
// 连续播放满 60 秒清零重启计数。
// 健康观察者盯注册时效与心跳失败数。

use crate::media::pipeline::PipelineState;
use crate::media::session::SessionManager;
use crate::sip::registration::RegistrationSnapshot;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// 稳定播放判定窗口
const STABLE_PLAY_WINDOW: Duration = Duration::from_secs(60);

/// 监护事件（信令侧消费）
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// 管线多次重启无效，会话已被放弃
    SessionGivenUp {
        session_id: String,
        channel_id: String,
        reason: String,
    },

    /// 文件播完且策略为终止
    SessionEnded {
        session_id: String,
        channel_id: String,
    },
}

/// 重启退避序列
pub fn restart_delay(restart_count: u32) -> Duration {
    const SCHEDULE: [u64; 5] = [1, 2, 5, 10, 30];
    let idx = (restart_count as usize).min(SCHEDULE.len() - 1);
    Duration::from_secs(SCHEDULE[idx])
}

/// 每会话看门狗
pub struct Watchdog {
    session_id: String,
    channel_id: String,
    sessions: Arc<SessionManager>,
    max_restarts: u32,
    events: mpsc::Sender<SupervisorEvent>,
}

impl Watchdog {
    pub fn new(
        session_id: String,
        channel_id: String,
        sessions: Arc<SessionManager>,
        max_restarts: u32,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            session_id,
            channel_id,
            sessions,
            max_restarts,
            events,
        }
    }

    /// 监护循环：跟随管线状态直到会话结束
    pub async fn run(self, mut state_rx: watch::Receiver<PipelineState>) {
        loop {
            let state = state_rx.borrow().clone();
            match state {
                PipelineState::Starting => {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
                PipelineState::Playing => {
                    // 播放稳定满窗口后清零重启计数
                    tokio::select! {
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(STABLE_PLAY_WINDOW) => {
                            self.sessions.reset_restart_count(&self.session_id).await;
                            if state_rx.changed().await.is_err() {
                                break;
                            }
                        }
                    }
                }
                PipelineState::Error(reason) => {
                    let Some(session) = self.sessions.mark_error(&self.session_id).await else {
                        break;
                    };

                    tracing::error!(
                        target: "gbcam::media",
                        session_id = %self.session_id,
                        %reason,
                        errors = session.error_count,
                        restarts = session.restart_count,
                        "pipeline error",
                    );

                    if session.restart_count >= self.max_restarts {
                        self.give_up(reason).await;
                        break;
                    }

                    tokio::time::sleep(restart_delay(session.restart_count)).await;

                    match self.sessions.restart_pipeline(&self.session_id).await {
                        Ok(new_rx) => {
                            state_rx = new_rx;
                        }
                        Err(e) => {
                            tracing::error!(
                                target: "gbcam::media",
                                session_id = %self.session_id,
                                error = %e,
                                "pipeline restart failed",
                            );
                            let restarts = self
                                .sessions
                                .get(&self.session_id)
                                .await
                                .map(|s| s.restart_count)
                                .unwrap_or(self.max_restarts);
                            if restarts >= self.max_restarts {
                                self.give_up(e.to_string()).await;
                                break;
                            }
                        }
                    }
                }
                PipelineState::Eos => {
                    tracing::info!(
                        target: "gbcam::media",
                        session_id = %self.session_id,
                        "pipeline reached end of stream",
                    );
                    let _ = self
                        .events
                        .send(SupervisorEvent::SessionEnded {
                            session_id: self.session_id.clone(),
                            channel_id: self.channel_id.clone(),
                        })
                        .await;
                    break;
                }
                PipelineState::Stopped => {
                    // 外部停止（BYE），正常退出
                    break;
                }
            }
        }
    }

    async fn give_up(&self, reason: String) {
        tracing::error!(
            target: "gbcam::media",
            session_id = %self.session_id,
            %reason,
            "giving up on session after repeated restarts",
        );
        let _ = self
            .events
            .send(SupervisorEvent::SessionGivenUp {
                session_id: self.session_id.clone(),
                channel_id: self.channel_id.clone(),
                reason,
            })
            .await;
    }
}

/// 连通性健康告警
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAlert {
    /// 注册超过名义有效期的 3 倍未确认
    RegistrationStale { seconds_since_confirm: u64 },

    /// 心跳连续失败超过 3 次
    KeepaliveFailing { failures: u32 },
}

/// 健康观察者
pub struct HealthObserver {
    nominal_expires: u32,
}

impl HealthObserver {
    pub fn new(nominal_expires: u32) -> Self {
        Self { nominal_expires }
    }

    /// 依据注册快照给出告警
    pub fn check(&self, snapshot: &RegistrationSnapshot) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        let stale_after = (self.nominal_expires as u64) * 3;
        let since_confirm = match snapshot.registered_at {
            Some(t) => (Utc::now() - t).num_seconds().max(0) as u64,
            None => u64::MAX,
        };

        if since_confirm > stale_after {
            alerts.push(HealthAlert::RegistrationStale {
                seconds_since_confirm: since_confirm,
            });
        }

        if snapshot.keepalive_failures > 3 {
            alerts.push(HealthAlert::KeepaliveFailing {
                failures: snapshot.keepalive_failures,
            });
        }

        alerts
    }

    /// 周期巡检，告警写入日志
    pub async fn run(
        self,
        registrar: Arc<crate::sip::registration::Registrar>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let snapshot = registrar.snapshot().await;
                    for alert in self.check(&snapshot) {
                        match alert {
                            HealthAlert::RegistrationStale { seconds_since_confirm } => {
                                tracing::error!(
                                    target: "gbcam::health",
                                    seconds_since_confirm,
                                    "registration has not been confirmed within 3x expiry",
                                );
                            }
                            HealthAlert::KeepaliveFailing { failures } => {
                                tracing::error!(
                                    target: "gbcam::health",
                                    failures,
                                    "keepalive failing repeatedly",
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}
