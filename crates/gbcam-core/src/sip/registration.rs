// 注册状态机与心跳
// 首次 REGISTER 不带凭证，401/407 挑战后补 Authorization；
// 75% 有效期续注册，97% 未确认强制重注册并告警；
// 连续 3 次失败进入 Failed 并按 {5,10,30,60,120,...} 退避。
// 心跳每 keepalive_interval 秒一次，连续 3 次失败立即重注册。

use crate::manscdp::render_keepalive_notify;
use crate::sip::auth::DigestChallenge;
use crate::sip::message::{SipMethod, SipRequest};
use crate::sip::transport::{new_branch, new_call_id, new_tag, SipTransport, TransportKind};
use crate::{GbError, Result};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Challenged,
    Registered,
    Expiring,
    Failed,
}

/// 注册配置
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub device_id: String,
    pub username: String,
    pub password: String,
    pub realm: String,
    pub server: SocketAddr,
    pub transport: TransportKind,
    pub expires: u32,
    pub keepalive_interval: Duration,
}

/// 注册状态快照（健康观察者读取）
#[derive(Debug, Clone)]
pub struct RegistrationSnapshot {
    pub state: RegistrationState,
    pub registered_at: Option<DateTime<Utc>>,
    pub granted_expires: u32,
    pub consecutive_failures: u32,
    pub keepalive_failures: u32,
}

struct RegInner {
    state: RegistrationState,
    registered_at: Option<DateTime<Utc>>,
    granted_expires: u32,
    consecutive_failures: u32,
    keepalive_failures: u32,
    challenge: Option<DigestChallenge>,
    call_id: String,
    local_tag: String,
    cseq: u32,
    keepalive_sn: u32,
}

/// 设备侧注册器
pub struct Registrar {
    config: RegistrationConfig,
    transport: Arc<SipTransport>,
    inner: Arc<RwLock<RegInner>>,

    /// 心跳失败触发的立即重注册信号
    rereg_tx: watch::Sender<u64>,
    rereg_rx: watch::Receiver<u64>,
}

/// 注册失败退避序列
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    const SCHEDULE: [u64; 5] = [5, 10, 30, 60, 120];
    let idx = (consecutive_failures.saturating_sub(1) as usize).min(SCHEDULE.len() - 1);
    Duration::from_secs(SCHEDULE[idx])
}

impl Registrar {
    pub fn new(config: RegistrationConfig, transport: Arc<SipTransport>) -> Self {
        let call_id = new_call_id(&config.realm);
        let (rereg_tx, rereg_rx) = watch::channel(0);

        Self {
            transport,
            inner: Arc::new(RwLock::new(RegInner {
                state: RegistrationState::Unregistered,
                registered_at: None,
                granted_expires: config.expires,
                consecutive_failures: 0,
                keepalive_failures: 0,
                challenge: None,
                call_id,
                local_tag: new_tag(),
                cseq: 0,
                keepalive_sn: 0,
            })),
            config,
            rereg_tx,
            rereg_rx,
        }
    }

    /// 当前状态
    pub async fn state(&self) -> RegistrationState {
        self.inner.read().await.state
    }

    /// 状态快照
    pub async fn snapshot(&self) -> RegistrationSnapshot {
        let inner = self.inner.read().await;
        RegistrationSnapshot {
            state: inner.state,
            registered_at: inner.registered_at,
            granted_expires: inner.granted_expires,
            consecutive_failures: inner.consecutive_failures,
            keepalive_failures: inner.keepalive_failures,
        }
    }

    /// REGISTER 请求目标 URI
    fn register_uri(&self) -> String {
        format!("sip:{}@{}", self.config.realm, self.config.server)
    }

    /// 构建 REGISTER 请求
    async fn build_register(&self, expires: u32, with_auth: bool) -> SipRequest {
        let mut inner = self.inner.write().await;
        inner.cseq += 1;

        let uri = self.register_uri();
        let mut req = SipRequest::new(SipMethod::Register, uri.clone());

        req.headers
            .append("Via", self.transport.via(self.config.transport, &new_branch()));
        req.headers.append(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.config.device_id, self.config.realm, inner.local_tag
            ),
        );
        req.headers.append(
            "To",
            format!("<sip:{}@{}>", self.config.device_id, self.config.realm),
        );
        req.headers.append("Call-ID", inner.call_id.clone());
        req.headers.append("CSeq", format!("{} REGISTER", inner.cseq));
        req.headers
            .append("Contact", self.transport.contact(&self.config.device_id));
        req.headers.append("Max-Forwards", "70");
        req.headers.append("Expires", expires.to_string());

        if with_auth {
            if let Some(challenge) = &inner.challenge {
                req.headers.append(
                    "Authorization",
                    challenge.authorization(
                        &self.config.username,
                        &self.config.password,
                        "REGISTER",
                        &uri,
                    ),
                );
            }
        }

        req
    }

    /// 执行一轮注册（含挑战应答）
    pub async fn register_once(&self) -> Result<()> {
        self.register_with_expires(self.config.expires).await
    }

    /// 注销（Expires: 0）
    pub async fn deregister(&self) -> Result<()> {
        let result = self.register_with_expires(0).await;
        let mut inner = self.inner.write().await;
        inner.state = RegistrationState::Unregistered;
        inner.registered_at = None;
        result
    }

    async fn register_with_expires(&self, expires: u32) -> Result<()> {
        let has_challenge = self.inner.read().await.challenge.is_some();
        let req = self.build_register(expires, has_challenge).await;

        let resp = self
            .transport
            .request_with_retransmit(&req, self.config.server, self.config.transport)
            .await?;

        match resp.status_code {
            200 => {
                let granted = resp
                    .headers
                    .get("Expires")
                    .and_then(|e| e.parse::<u32>().ok())
                    .unwrap_or(self.config.expires);

                let mut inner = self.inner.write().await;
                if expires > 0 {
                    inner.state = RegistrationState::Registered;
                    inner.registered_at = Some(Utc::now());
                    inner.granted_expires = granted;
                    inner.consecutive_failures = 0;
                }

                tracing::info!(
                    target: "gbcam::sip",
                    call_id = %inner.call_id,
                    expires = granted,
                    "REGISTER confirmed",
                );
                Ok(())
            }
            401 | 407 => {
                let header = resp
                    .headers
                    .get("WWW-Authenticate")
                    .or_else(|| resp.headers.get("Proxy-Authenticate"))
                    .ok_or_else(|| {
                        GbError::Auth("challenge response without authenticate header".to_string())
                    })?;
                let challenge = DigestChallenge::parse(header)?;

                {
                    let mut inner = self.inner.write().await;
                    inner.state = RegistrationState::Challenged;
                    inner.challenge = Some(challenge);
                }

                tracing::debug!(target: "gbcam::sip", "REGISTER challenged, retrying with credentials");

                // 带凭证重发
                let req = self.build_register(expires, true).await;
                let resp = self
                    .transport
                    .request_with_retransmit(&req, self.config.server, self.config.transport)
                    .await?;

                if resp.status_code == 200 {
                    let granted = resp
                        .headers
                        .get("Expires")
                        .and_then(|e| e.parse::<u32>().ok())
                        .unwrap_or(self.config.expires);

                    let mut inner = self.inner.write().await;
                    if expires > 0 {
                        inner.state = RegistrationState::Registered;
                        inner.registered_at = Some(Utc::now());
                        inner.granted_expires = granted;
                        inner.consecutive_failures = 0;
                    }
                    tracing::info!(
                        target: "gbcam::sip",
                        expires = granted,
                        "REGISTER confirmed after digest challenge",
                    );
                    Ok(())
                } else {
                    Err(GbError::Auth(format!(
                        "REGISTER rejected: {} {}",
                        resp.status_code, resp.reason_phrase
                    )))
                }
            }
            other => Err(GbError::Transport(format!(
                "REGISTER failed: {} {}",
                other, resp.reason_phrase
            ))),
        }
    }

    /// 发送一次心跳
    pub async fn send_keepalive(&self) -> Result<()> {
        let (sn, call_id, local_tag, cseq) = {
            let mut inner = self.inner.write().await;
            inner.keepalive_sn += 1;
            inner.cseq += 1;
            (
                inner.keepalive_sn,
                inner.call_id.clone(),
                inner.local_tag.clone(),
                inner.cseq,
            )
        };

        let uri = self.register_uri();
        let mut req = SipRequest::new(SipMethod::Message, uri.clone());
        req.headers
            .append("Via", self.transport.via(self.config.transport, &new_branch()));
        req.headers.append(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.config.device_id, self.config.realm, local_tag
            ),
        );
        req.headers.append(
            "To",
            format!("<sip:{}@{}>", self.config.realm, self.config.realm),
        );
        req.headers.append("Call-ID", call_id);
        req.headers.append("CSeq", format!("{} MESSAGE", cseq));
        req.headers.append("Max-Forwards", "70");
        req.headers
            .append("Content-Type", "Application/MANSCDP+xml");
        req.set_body(render_keepalive_notify(sn, &self.config.device_id));

        let resp = self
            .transport
            .request_with_retransmit(&req, self.config.server, self.config.transport)
            .await?;

        match resp.status_code {
            200 => Ok(()),
            401 | 407 => {
                // 平台对心跳挑战：补凭证重发一次
                let header = resp
                    .headers
                    .get("WWW-Authenticate")
                    .or_else(|| resp.headers.get("Proxy-Authenticate"))
                    .ok_or_else(|| GbError::Auth("keepalive challenge without header".to_string()))?;
                let challenge = DigestChallenge::parse(header)?;

                let mut authed = req.clone();
                let cseq = {
                    let mut inner = self.inner.write().await;
                    inner.challenge = Some(challenge.clone());
                    inner.cseq += 1;
                    inner.cseq
                };
                authed.headers.set("CSeq", format!("{} MESSAGE", cseq));
                authed.headers.set(
                    "Via",
                    self.transport.via(self.config.transport, &new_branch()),
                );
                authed.headers.append(
                    "Authorization",
                    challenge.authorization(
                        &self.config.username,
                        &self.config.password,
                        "MESSAGE",
                        &uri,
                    ),
                );

                let resp = self
                    .transport
                    .request_with_retransmit(&authed, self.config.server, self.config.transport)
                    .await?;
                if resp.status_code == 200 {
                    Ok(())
                } else {
                    Err(GbError::Transport(format!(
                        "keepalive rejected: {}",
                        resp.status_code
                    )))
                }
            }
            other => Err(GbError::Transport(format!("keepalive rejected: {}", other))),
        }
    }

    /// 记录心跳结果；连续 3 次失败时触发立即重注册
    async fn track_keepalive(&self, ok: bool) {
        let mut inner = self.inner.write().await;
        if ok {
            inner.keepalive_failures = 0;
            return;
        }

        inner.keepalive_failures += 1;
        tracing::warn!(
            target: "gbcam::sip",
            failures = inner.keepalive_failures,
            "keepalive failed",
        );

        if inner.keepalive_failures >= 3 {
            inner.keepalive_failures = 0;
            inner.state = RegistrationState::Unregistered;
            inner.registered_at = None;
            drop(inner);
            tracing::warn!(
                target: "gbcam::sip",
                "3 consecutive keepalive failures, forcing re-registration",
            );
            self.rereg_tx.send_modify(|v| *v += 1);
        }
    }

    /// 注册/心跳驱动循环，直到 shutdown 信号
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rereg = self.rereg_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let state = self.state().await;
            match state {
                RegistrationState::Unregistered
                | RegistrationState::Challenged
                | RegistrationState::Failed => {
                    match self.register_once().await {
                        Ok(()) => {}
                        Err(e) => {
                            let delay = {
                                let mut inner = self.inner.write().await;
                                inner.consecutive_failures += 1;
                                if inner.consecutive_failures >= 3 {
                                    inner.state = RegistrationState::Failed;
                                }
                                backoff_delay(inner.consecutive_failures)
                            };
                            tracing::error!(
                                target: "gbcam::sip",
                                error = %e,
                                backoff_secs = delay.as_secs(),
                                "registration attempt failed",
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                    }
                }
                RegistrationState::Registered | RegistrationState::Expiring => {
                    let (renew_in, force_in) = {
                        let inner = self.inner.read().await;
                        let elapsed = inner
                            .registered_at
                            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
                            .unwrap_or(0);
                        let expires = inner.granted_expires as u64;
                        let renew_at = expires * 75 / 100;
                        let force_at = expires * 97 / 100;
                        (
                            Duration::from_secs(renew_at.saturating_sub(elapsed)),
                            Duration::from_secs(force_at.saturating_sub(elapsed)),
                        )
                    };

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = rereg.changed() => {
                            // 心跳失败触发，回到循环顶部立即注册
                        }
                        _ = keepalive.tick() => {
                            let ok = match self.send_keepalive().await {
                                Ok(()) => true,
                                Err(e) => {
                                    tracing::warn!(target: "gbcam::sip", error = %e, "keepalive error");
                                    false
                                }
                            };
                            self.track_keepalive(ok).await;
                        }
                        _ = tokio::time::sleep(renew_in) => {
                            {
                                let mut inner = self.inner.write().await;
                                inner.state = RegistrationState::Expiring;
                            }

                            // 97% 截止前反复尝试续注册；到点仍未确认则
                            // 告警并从头重注册
                            let force_deadline = tokio::time::Instant::now()
                                + force_in.saturating_sub(renew_in);
                            loop {
                                match self.register_once().await {
                                    Ok(()) => break,
                                    Err(e) => {
                                        tracing::warn!(target: "gbcam::sip", error = %e, "proactive renewal failed");
                                    }
                                }

                                if tokio::time::Instant::now() >= force_deadline {
                                    tracing::error!(
                                        target: "gbcam::sip",
                                        "registration not confirmed before 97% of expiry, forcing re-registration",
                                    );
                                    let mut inner = self.inner.write().await;
                                    inner.state = RegistrationState::Unregistered;
                                    inner.registered_at = None;
                                    break;
                                }

                                let pause = Duration::from_secs(30)
                                    .min(force_deadline.saturating_duration_since(tokio::time::Instant::now()));
                                tokio::select! {
                                    _ = shutdown.changed() => return,
                                    _ = tokio::time::sleep(pause) => {}
                                }
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(target: "gbcam::sip", "registrar loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::{SipMessage, SipResponse};
    use crate::sip::transport::TransportConfig;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(30));
        assert_eq!(backoff_delay(4), Duration::from_secs(60));
        assert_eq!(backoff_delay(5), Duration::from_secs(120));
        // 封顶
        assert_eq!(backoff_delay(9), Duration::from_secs(120));
    }

    async fn platform_stub(
        require_auth: bool,
    ) -> (SocketAddr, Arc<SipTransport>, tokio::task::JoinHandle<()>) {
        let (transport, mut rx) = SipTransport::bind(TransportConfig {
            bind_ip: "127.0.0.1".to_string(),
            local_port: 0,
            contact_ip: "127.0.0.1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let addr = transport.local_addr().unwrap();

        let responder = Arc::clone(&transport);
        let handle = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let SipMessage::Request(req) = inbound.message else {
                    continue;
                };

                let challenge_needed =
                    require_auth && req.headers.get("Authorization").is_none();

                let mut resp = if challenge_needed {
                    let mut resp = SipResponse::new(401, "Unauthorized");
                    resp.headers.append(
                        "WWW-Authenticate",
                        "Digest realm=\"3402000000\", nonce=\"abc123\", algorithm=MD5",
                    );
                    resp
                } else {
                    let mut resp = SipResponse::new(200, "OK");
                    resp.headers.append("Expires", "3600");
                    resp
                };

                for via in req.headers.get_all("Via") {
                    resp.headers.append("Via", via.to_string());
                }
                for name in ["From", "To", "Call-ID", "CSeq"] {
                    if let Some(v) = req.headers.get(name) {
                        resp.headers.append(name, v.to_string());
                    }
                }

                responder
                    .send_response(&resp, inbound.remote, inbound.transport)
                    .await
                    .unwrap();
            }
        });

        (addr, transport, handle)
    }

    async fn test_registrar(server: SocketAddr) -> Registrar {
        let (transport, _rx) = SipTransport::bind(TransportConfig {
            bind_ip: "127.0.0.1".to_string(),
            local_port: 0,
            contact_ip: "127.0.0.1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        Registrar::new(
            RegistrationConfig {
                device_id: "81000000465001000001".to_string(),
                username: "81000000465001000001".to_string(),
                password: "admin123".to_string(),
                realm: "3402000000".to_string(),
                server,
                transport: TransportKind::Udp,
                expires: 3600,
                keepalive_interval: Duration::from_secs(30),
            },
            transport,
        )
    }

    #[tokio::test]
    async fn test_register_without_challenge() {
        let (addr, _t, _h) = platform_stub(false).await;
        let registrar = test_registrar(addr).await;

        registrar.register_once().await.unwrap();
        assert_eq!(registrar.state().await, RegistrationState::Registered);

        let snapshot = registrar.snapshot().await;
        assert_eq!(snapshot.granted_expires, 3600);
        assert!(snapshot.registered_at.is_some());
    }

    #[tokio::test]
    async fn test_register_with_digest_challenge() {
        let (addr, _t, _h) = platform_stub(true).await;
        let registrar = test_registrar(addr).await;

        registrar.register_once().await.unwrap();
        assert_eq!(registrar.state().await, RegistrationState::Registered);
    }

    #[tokio::test]
    async fn test_keepalive_roundtrip() {
        let (addr, _t, _h) = platform_stub(false).await;
        let registrar = test_registrar(addr).await;

        registrar.register_once().await.unwrap();
        registrar.send_keepalive().await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_failures_force_reregistration() {
        let (addr, _t, _h) = platform_stub(false).await;
        let registrar = test_registrar(addr).await;
        registrar.register_once().await.unwrap();

        // 连续三次失败 → 回到 Unregistered 并发出重注册信号
        let mut rereg = registrar.rereg_rx.clone();
        let before = *rereg.borrow();

        registrar.track_keepalive(false).await;
        registrar.track_keepalive(false).await;
        assert_eq!(registrar.state().await, RegistrationState::Registered);

        registrar.track_keepalive(false).await;
        assert_eq!(registrar.state().await, RegistrationState::Unregistered);
        rereg.changed().await.unwrap();
        assert!(*rereg.borrow() > before);
    }

    #[tokio::test]
    async fn test_keepalive_success_resets_counter() {
        let (addr, _t, _h) = platform_stub(false).await;
        let registrar = test_registrar(addr).await;
        registrar.register_once().await.unwrap();

        registrar.track_keepalive(false).await;
        registrar.track_keepalive(false).await;
        registrar.track_keepalive(true).await;
        assert_eq!(registrar.snapshot().await.keepalive_failures, 0);

        registrar.track_keepalive(false).await;
        assert_eq!(registrar.state().await, RegistrationState::Registered);
    }
}
