// 请求分发器
// 入站请求分类处理；目录/录像响应按数据报预算走 MESSAGE 推送；
// INVITE 建媒体会话，BYE 收尾；SUBSCRIBE 维护目录订阅。
//
// 单对话内请求按到达顺序处理，响应先于下一条出队。

use crate::catalog::{parse_gb_time, ChannelCatalog, MediaHandle};
use crate::manscdp::{
    self, parse_query, render_catalog_response, render_device_info_response,
    render_device_status_response, split_catalog_response, CmdType, QueryRoot,
};
use crate::media::pipeline::{PayloadKind, PipelineSource, PipelineSpec};
use crate::media::session::SessionManager;
use crate::media::supervisor::{SupervisorEvent, Watchdog};
use crate::sdp::SdpSession;
use crate::sip::dialog::{Dialog, DialogManager, Subscription};
use crate::sip::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use crate::sip::transport::{new_branch, new_tag, Inbound, SipTransport, TransportKind};
use crate::{GbError, Result};
use chrono::Utc;
use gbcam_config::{DeviceConfig, EncoderPreset};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// 入站请求处理时限，超时回 500
const INBOUND_DEADLINE: Duration = Duration::from_secs(8);

/// 分发器配置
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub device: DeviceConfig,
    pub datagram_budget: usize,
    pub encoder: EncoderPreset,
    pub max_restarts: u32,
}

/// 请求分发器
pub struct Dispatcher {
    config: DispatcherConfig,
    transport: Arc<SipTransport>,
    catalog: Arc<ChannelCatalog>,
    dialogs: DialogManager,
    sessions: Arc<SessionManager>,

    /// 监护事件入口（看门狗持有发送端）
    events_tx: mpsc::Sender<SupervisorEvent>,

    /// 出站 MESSAGE/NOTIFY 的 CSeq
    out_cseq: AtomicU32,

    /// 关闭流程中拒收新 INVITE
    accepting: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        transport: Arc<SipTransport>,
        catalog: Arc<ChannelCatalog>,
        sessions: Arc<SessionManager>,
        events_tx: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            catalog,
            dialogs: DialogManager::new(),
            sessions,
            events_tx,
            out_cseq: AtomicU32::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn dialogs(&self) -> &DialogManager {
        &self.dialogs
    }

    /// 关闭流程：停收新 INVITE
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// 主循环：入站请求 + 监护事件 + 订阅到期
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut events: mpsc::Receiver<SupervisorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sub_sweep = tokio::time::interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                item = inbound.recv() => {
                    let Some(item) = item else { break };
                    self.process_inbound(item).await;
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.process_event(event).await;
                }
                _ = sub_sweep.tick() => {
                    for dialog in self.dialogs.expire_subscriptions().await {
                        self.notify_terminated(&dialog).await;
                    }
                }
            }
        }

        tracing::info!(target: "gbcam::sip", "dispatcher loop stopped");
    }

    async fn process_inbound(self: &Arc<Self>, item: Inbound) {
        let SipMessage::Request(req) = item.message else {
            return;
        };

        let call_id = req.call_id().unwrap_or("-").to_string();
        let span = tracing::info_span!(
            "gbcam.sip.request",
            method = %req.method,
            %call_id,
            remote = %item.remote,
        );
        let _enter = span.enter();

        let handled = tokio::time::timeout(
            INBOUND_DEADLINE,
            self.handle_request(&req, item.remote, item.transport),
        )
        .await;

        match handled {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(target: "gbcam::sip", error = %e, "request failed");
                let (code, reason) = status_for_error(&e);
                let mut resp = self.response_for(&req, code, reason);
                if code == 503 {
                    resp.headers.append("Retry-After", "60");
                }
                let _ = self
                    .transport
                    .send_response(&resp, item.remote, item.transport)
                    .await;
            }
            Err(_) => {
                tracing::error!(target: "gbcam::sip", "request processing exceeded deadline");
                let resp = self.response_for(&req, 500, "Server Internal Error");
                let _ = self
                    .transport
                    .send_response(&resp, item.remote, item.transport)
                    .await;
            }
        }
    }

    async fn process_event(self: &Arc<Self>, event: SupervisorEvent) {
        match event {
            SupervisorEvent::SessionGivenUp {
                session_id,
                channel_id,
                reason,
            } => {
                tracing::error!(
                    target: "gbcam::media",
                    %session_id,
                    %channel_id,
                    %reason,
                    "session given up, closing dialog",
                );
                self.notify_media_failure(&channel_id, &reason).await;
                self.sessions.stop_session(&session_id).await;
                self.close_dialog_with_bye(&session_id).await;
            }
            SupervisorEvent::SessionEnded {
                session_id,
                channel_id: _,
            } => {
                self.sessions.stop_session(&session_id).await;
                self.close_dialog_with_bye(&session_id).await;
            }
        }
    }

    /// 分类处理入站请求
    pub async fn handle_request(
        self: &Arc<Self>,
        req: &SipRequest,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        match req.method {
            SipMethod::Register => {
                let resp = self.response_for(req, 405, "Method Not Allowed");
                self.transport.send_response(&resp, remote, kind).await
            }
            SipMethod::Message => self.handle_message(req, remote, kind).await,
            SipMethod::Invite => self.handle_invite(req, remote, kind).await,
            SipMethod::Ack => {
                if let Some(call_id) = req.call_id() {
                    self.dialogs.update(call_id, |d| d.touch()).await;
                }
                Ok(())
            }
            SipMethod::Bye => self.handle_bye(req, remote, kind).await,
            SipMethod::Subscribe => self.handle_subscribe(req, remote, kind).await,
            SipMethod::Options => {
                let resp = self.response_for(req, 200, "OK");
                self.transport.send_response(&resp, remote, kind).await
            }
            _ => {
                let resp = self.response_for(req, 501, "Not Implemented");
                self.transport.send_response(&resp, remote, kind).await
            }
        }
    }

    /// MESSAGE：MANSCDP 查询
    async fn handle_message(
        self: &Arc<Self>,
        req: &SipRequest,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        let is_manscdp = req
            .headers
            .get("Content-Type")
            .map(|ct| ct.to_ascii_lowercase().contains("manscdp"))
            .unwrap_or(false);

        if !is_manscdp {
            let resp = self.response_for(req, 200, "OK");
            return self.transport.send_response(&resp, remote, kind).await;
        }

        let body = req
            .body
            .as_deref()
            .ok_or_else(|| GbError::BadRequest("MANSCDP message without body".to_string()))?;
        let query = parse_query(body)?;

        tracing::debug!(
            target: "gbcam::sip",
            cmd = query.cmd_type.as_str(),
            sn = query.sn,
            "MANSCDP query",
        );

        // Control 与未知命令：确认即可
        if query.root == QueryRoot::Control || matches!(query.cmd_type, CmdType::Other(_)) {
            let resp = self.response_for(req, 200, "OK");
            return self.transport.send_response(&resp, remote, kind).await;
        }

        match query.cmd_type {
            CmdType::Keepalive => {
                let resp = self.response_for(req, 200, "OK");
                self.transport.send_response(&resp, remote, kind).await
            }
            CmdType::DeviceInfo => {
                let device = &self.config.device;
                let body = render_device_info_response(
                    query.sn,
                    &device.device_id,
                    &device.device_name,
                    &device.manufacturer,
                    &device.model,
                    &device.firmware,
                    self.catalog.channels().channels.len(),
                );
                let mut resp = self.response_for(req, 200, "OK");
                resp.headers
                    .append("Content-Type", "Application/MANSCDP+xml");
                resp.set_body(body);
                self.transport.send_response(&resp, remote, kind).await
            }
            CmdType::DeviceStatus => {
                let body =
                    render_device_status_response(query.sn, &self.config.device.device_id, true);
                let mut resp = self.response_for(req, 200, "OK");
                resp.headers
                    .append("Content-Type", "Application/MANSCDP+xml");
                resp.set_body(body);
                self.transport.send_response(&resp, remote, kind).await
            }
            CmdType::Catalog => {
                let items = self.catalog.catalog_items();
                let full = render_catalog_response(query.sn, &self.config.device.device_id, &items);

                if full.len() <= self.config.datagram_budget || kind == TransportKind::Tcp {
                    let mut resp = self.response_for(req, 200, "OK");
                    resp.headers
                        .append("Content-Type", "Application/MANSCDP+xml");
                    resp.set_body(full);
                    self.transport.send_response(&resp, remote, kind).await
                } else {
                    // 超预算：先空体 200，再分片 MESSAGE 推送
                    let resp = self.response_for(req, 200, "OK");
                    self.transport.send_response(&resp, remote, kind).await?;

                    let fragments = split_catalog_response(
                        query.sn,
                        &self.config.device.device_id,
                        &items,
                        self.config.datagram_budget,
                    );
                    self.push_bodies(fragments, remote, kind);
                    Ok(())
                }
            }
            CmdType::RecordInfo => {
                let start = query.start_time.as_deref().map(parse_gb_time).transpose()?;
                let end = query.end_time.as_deref().map(parse_gb_time).transpose()?;

                let channel_id = if query.device_id.is_empty() {
                    self.config.device.device_id.clone()
                } else {
                    query.device_id.clone()
                };

                let records = self.catalog.recordings().query(&channel_id, start, end);
                let items: Vec<_> = records.iter().map(|r| r.to_record_item()).collect();

                let name = self
                    .catalog
                    .find_channel(&channel_id)
                    .map(|c| c.name)
                    .unwrap_or_else(|| channel_id.clone());

                let pages = manscdp::paginate_record_info(
                    query.sn,
                    &channel_id,
                    &name,
                    &items,
                    self.config.datagram_budget,
                );

                if pages.len() == 1 && (pages[0].len() <= self.config.datagram_budget || kind == TransportKind::Tcp) {
                    let mut resp = self.response_for(req, 200, "OK");
                    resp.headers
                        .append("Content-Type", "Application/MANSCDP+xml");
                    resp.set_body(pages.into_iter().next().unwrap());
                    self.transport.send_response(&resp, remote, kind).await
                } else {
                    let resp = self.response_for(req, 200, "OK");
                    self.transport.send_response(&resp, remote, kind).await?;
                    self.push_bodies(pages, remote, kind);
                    Ok(())
                }
            }
            CmdType::Other(_) => unreachable!("handled above"),
        }
    }

    /// INVITE：SDP 协商并起媒体会话
    async fn handle_invite(
        self: &Arc<Self>,
        req: &SipRequest,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(GbError::Resource("shutting down".to_string()));
        }

        let call_id = req
            .call_id()
            .ok_or_else(|| GbError::BadRequest("INVITE without Call-ID".to_string()))?
            .to_string();

        let offer_text = req
            .body
            .as_deref()
            .ok_or_else(|| GbError::BadRequest("INVITE without SDP".to_string()))?;
        let offer = SdpSession::parse(offer_text)?;
        let media = offer.media_offer()?;

        let channel_id = req
            .target_user()
            .ok_or_else(|| GbError::BadRequest("INVITE without target user".to_string()))?
            .to_string();
        let channel = self
            .catalog
            .find_channel(&channel_id)
            .ok_or_else(|| GbError::ChannelNotFound(channel_id.clone()))?;

        // 先回 100，管线初始化可能耗时
        let trying = self.response_for(req, 100, "Trying");
        self.transport.send_response(&trying, remote, kind).await?;

        let ssrc_value = media
            .ssrc
            .parse::<u32>()
            .map_err(|_| GbError::Sdp(format!("SSRC is not decimal: {}", media.ssrc)))?;

        let target: SocketAddr = format!("{}:{}", media.remote_ip, media.remote_port)
            .parse()
            .map_err(|e| GbError::Sdp(format!("bad RTP target: {}", e)))?;

        let source = match &channel.handle {
            MediaHandle::File(path) => PipelineSource::File {
                path: path.clone(),
                on_eos: channel.eos_policy,
            },
            MediaHandle::Rtsp(url) => PipelineSource::Rtsp { url: url.clone() },
        };

        // offer 携带 codec:res 形式的 f= 时覆盖预设分辨率
        let mut encoder = self.config.encoder.clone();
        if let Some(format_id) = media.format.as_deref() {
            if format_id.split(':').count() == 2 {
                let (width, height) = gbcam_config::StreamingConfig::format_resolution(format_id);
                encoder.width = width;
                encoder.height = height;
            }
        }

        let spec = PipelineSpec {
            source,
            encoder,
            payload_type: media.payload_type,
            ssrc: ssrc_value,
            payload_kind: PayloadKind::from_encoding(&media.encoding_name),
            target,
        };

        let session = self
            .sessions
            .start_session(&call_id, &channel_id, &media.ssrc, spec)
            .await?;

        // 对话登记：捕获 Record-Route 为 Route 集
        let local_tag = new_tag();
        let mut dialog = Dialog::new(call_id.clone(), local_tag.clone(), remote, kind);
        dialog.remote_tag = req.from_tag().map(str::to_string);
        dialog.remote_from = req.headers.get("From").unwrap_or_default().to_string();
        dialog.local_to = format!(
            "{};tag={}",
            req.headers.get("To").unwrap_or_default(),
            local_tag
        );
        dialog.route_set = req
            .headers
            .get_all("Record-Route")
            .into_iter()
            .map(str::to_string)
            .collect();
        dialog.remote_cseq = req.cseq().map(|(n, _)| n).unwrap_or(0);
        dialog.media_session_id = Some(call_id.clone());
        self.dialogs.create(dialog).await;

        // 应答 SDP：镜像负载，y= 原样回显，声明 sendonly
        let answer = offer.answer(
            &self.config.device.device_id,
            self.transport.contact_ip(),
            session.local_rtp_port,
        )?;

        let mut ok = self.response_for_with_tag(req, 200, "OK", &local_tag);
        ok.headers.append("Content-Type", "application/sdp");
        ok.headers
            .append("Contact", self.transport.contact(&self.config.device.device_id));
        ok.set_body(answer.encode());
        self.transport.send_response(&ok, remote, kind).await?;

        // 看门狗跟随管线
        if let Some(state_rx) = self.sessions.watch_pipeline(&call_id).await {
            let watchdog = Watchdog::new(
                call_id.clone(),
                channel_id.clone(),
                Arc::clone(&self.sessions),
                self.config.max_restarts,
                self.events_tx.clone(),
            );
            tokio::spawn(watchdog.run(state_rx));
        }

        tracing::info!(
            target: "gbcam::sip",
            %call_id,
            %channel_id,
            ssrc = %media.ssrc,
            rtp_target = %target,
            "INVITE accepted",
        );

        Ok(())
    }

    /// BYE：停媒体会话并拆对话
    async fn handle_bye(
        self: &Arc<Self>,
        req: &SipRequest,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        let Some(call_id) = req.call_id() else {
            return Err(GbError::BadRequest("BYE without Call-ID".to_string()));
        };

        let dialog = self.dialogs.remove(call_id).await;
        self.sessions.stop_session(call_id).await;

        let (code, reason) = if dialog.is_some() {
            (200, "OK")
        } else {
            (481, "Call/Transaction Does Not Exist")
        };

        let resp = self.response_for(req, code, reason);
        self.transport.send_response(&resp, remote, kind).await
    }

    /// SUBSCRIBE：目录订阅
    async fn handle_subscribe(
        self: &Arc<Self>,
        req: &SipRequest,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        let call_id = req
            .call_id()
            .ok_or_else(|| GbError::BadRequest("SUBSCRIBE without Call-ID".to_string()))?
            .to_string();

        let event = req.headers.get("Event").unwrap_or("Catalog").to_string();
        let expires = req
            .headers
            .get("Expires")
            .and_then(|e| e.parse::<i64>().ok())
            .unwrap_or(3600);

        let local_tag = match self.dialogs.get(&call_id).await {
            Some(dialog) => {
                // 续订
                self.dialogs
                    .update(&call_id, |d| {
                        if let Some(sub) = &mut d.subscription {
                            sub.expires_at = Utc::now() + chrono::Duration::seconds(expires);
                        }
                    })
                    .await;
                dialog.local_tag
            }
            None => {
                let local_tag = new_tag();
                let mut dialog = Dialog::new(call_id.clone(), local_tag.clone(), remote, kind);
                dialog.remote_tag = req.from_tag().map(str::to_string);
                dialog.remote_from = req.headers.get("From").unwrap_or_default().to_string();
                dialog.local_to = format!(
                    "{};tag={}",
                    req.headers.get("To").unwrap_or_default(),
                    local_tag
                );
                dialog.route_set = req
                    .headers
                    .get_all("Record-Route")
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                dialog.subscription = Some(Subscription {
                    event: event.clone(),
                    expires_at: Utc::now() + chrono::Duration::seconds(expires),
                    notify_count: 0,
                });
                self.dialogs.create(dialog).await;
                local_tag
            }
        };

        let mut resp = self.response_for_with_tag(req, 200, "OK", &local_tag);
        resp.headers.append("Expires", expires.to_string());
        self.transport.send_response(&resp, remote, kind).await?;

        // 立即推一轮当前目录
        self.notify_catalog(&call_id, expires).await;

        Ok(())
    }

    /// 对订阅对话发送携带目录的 NOTIFY
    async fn notify_catalog(self: &Arc<Self>, call_id: &str, expires: i64) {
        let Some(dialog) = self.dialogs.get(call_id).await else {
            return;
        };

        let items = self.catalog.catalog_items();
        let sn = self.out_cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let fragments = split_catalog_response(
            sn,
            &self.config.device.device_id,
            &items,
            self.config.datagram_budget,
        );

        for body in fragments {
            let mut req = self.in_dialog_request(&dialog, SipMethod::Notify).await;
            req.headers.append("Event", dialog
                .subscription
                .as_ref()
                .map(|s| s.event.clone())
                .unwrap_or_else(|| "Catalog".to_string()));
            req.headers.append(
                "Subscription-State",
                format!("active;expires={}", expires),
            );
            req.headers
                .append("Content-Type", "Application/MANSCDP+xml");
            req.set_body(body);

            let transport = Arc::clone(&self.transport);
            let remote = dialog.remote;
            let kind = dialog.transport;
            tokio::spawn(async move {
                if let Err(e) = transport.request_with_retransmit(&req, remote, kind).await {
                    tracing::warn!(target: "gbcam::sip", error = %e, "catalog NOTIFY failed");
                }
            });
        }

        self.dialogs
            .update(call_id, |d| {
                if let Some(sub) = &mut d.subscription {
                    sub.notify_count += 1;
                }
            })
            .await;
    }

    /// 订阅到期：Subscription-State: terminated
    async fn notify_terminated(self: &Arc<Self>, dialog: &Dialog) {
        let mut req = self.in_dialog_request(dialog, SipMethod::Notify).await;
        req.headers.append(
            "Event",
            dialog
                .subscription
                .as_ref()
                .map(|s| s.event.clone())
                .unwrap_or_else(|| "Catalog".to_string()),
        );
        req.headers
            .append("Subscription-State", "terminated;reason=timeout");

        let transport = Arc::clone(&self.transport);
        let remote = dialog.remote;
        let kind = dialog.transport;
        tokio::spawn(async move {
            let _ = transport.request_with_retransmit(&req, remote, kind).await;
        });
    }

    /// 媒体故障时向订阅方推送通道 OFF 状态
    async fn notify_media_failure(self: &Arc<Self>, channel_id: &str, reason: &str) {
        for dialog in self.dialogs.subscriptions().await {
            tracing::warn!(
                target: "gbcam::sip",
                call_id = %dialog.call_id,
                %channel_id,
                %reason,
                "notifying subscriber of media failure",
            );
            self.notify_catalog(&dialog.call_id, 3600).await;
        }
    }

    /// 监护放弃/播放结束后的出站 BYE
    async fn close_dialog_with_bye(self: &Arc<Self>, call_id: &str) {
        let Some(dialog) = self.dialogs.remove(call_id).await else {
            return;
        };

        let req = self.in_dialog_request(&dialog, SipMethod::Bye).await;
        let transport = Arc::clone(&self.transport);
        let remote = dialog.remote;
        let kind = dialog.transport;
        tokio::spawn(async move {
            if let Err(e) = transport.request_with_retransmit(&req, remote, kind).await {
                tracing::warn!(target: "gbcam::sip", error = %e, "outbound BYE failed");
            }
        });
    }

    /// 关闭流程：对全部会话发 BYE 并停管线
    pub async fn teardown_sessions(self: &Arc<Self>) {
        for session in self.sessions.list().await {
            self.sessions.stop_session(&session.session_id).await;
            self.close_dialog_with_bye(&session.session_id).await;
        }
    }

    /// 构造对话内请求：回放 Route 集，CSeq 递增
    async fn in_dialog_request(&self, dialog: &Dialog, method: SipMethod) -> SipRequest {
        let remote_user = crate::sip::message::extract_sip_user(&dialog.remote_from)
            .unwrap_or(&self.config.device.sip.realm);
        let uri = format!("sip:{}@{}", remote_user, dialog.remote);

        let mut req = SipRequest::new(method, uri);
        req.headers
            .append("Via", self.transport.via(dialog.transport, &new_branch()));

        // 本端发起：From 带本端 tag，To 为对端原 From
        req.headers.append("From", dialog.local_to.clone());
        req.headers.append("To", dialog.remote_from.clone());
        req.headers.append("Call-ID", dialog.call_id.clone());

        let cseq = self
            .dialogs
            .update(&dialog.call_id, |d| {
                d.next_cseq();
            })
            .await
            .map(|d| d.local_cseq)
            .unwrap_or(dialog.local_cseq + 1);
        req.headers.append("CSeq", format!("{} {}", cseq, method));

        // 建立对话时捕获的 Route 集原样回放
        for route in &dialog.route_set {
            req.headers.append("Route", route.clone());
        }

        req.headers.append("Max-Forwards", "70");
        req
    }

    /// 标准响应：回显 Via/From/To/Call-ID/CSeq，首个最终响应补本端 tag
    fn response_for(&self, req: &SipRequest, code: u16, reason: &str) -> SipResponse {
        self.build_response(req, code, reason, None)
    }

    /// 指定本端 tag 的响应（对话建立场景）
    fn response_for_with_tag(
        &self,
        req: &SipRequest,
        code: u16,
        reason: &str,
        local_tag: &str,
    ) -> SipResponse {
        self.build_response(req, code, reason, Some(local_tag))
    }

    fn build_response(
        &self,
        req: &SipRequest,
        code: u16,
        reason: &str,
        local_tag: Option<&str>,
    ) -> SipResponse {
        let mut resp = SipResponse::new(code, reason);

        for via in req.headers.get_all("Via") {
            resp.headers.append("Via", via.to_string());
        }
        if let Some(from) = req.headers.get("From") {
            resp.headers.append("From", from.to_string());
        }
        if let Some(to) = req.headers.get("To") {
            if req.to_tag().is_none() && code > 100 {
                let tag = local_tag.map(str::to_string).unwrap_or_else(new_tag);
                resp.headers.append("To", format!("{};tag={}", to, tag));
            } else {
                resp.headers.append("To", to.to_string());
            }
        }
        if let Some(call_id) = req.headers.get("Call-ID") {
            resp.headers.append("Call-ID", call_id.to_string());
        }
        if let Some(cseq) = req.headers.get("CSeq") {
            resp.headers.append("CSeq", cseq.to_string());
        }

        resp
    }

    /// 以 MESSAGE 推送一组 MANSCDP 响应体
    fn push_bodies(self: &Arc<Self>, bodies: Vec<String>, remote: SocketAddr, kind: TransportKind) {
        for body in bodies {
            let cseq = self.out_cseq.fetch_add(1, Ordering::SeqCst) + 1;
            let device = &self.config.device;

            let mut req = SipRequest::new(
                SipMethod::Message,
                format!("sip:{}@{}", device.device_id, device.sip.realm),
            );
            req.headers
                .append("Via", self.transport.via(kind, &new_branch()));
            req.headers.append(
                "From",
                format!(
                    "<sip:{}@{}>;tag={}",
                    device.device_id,
                    device.sip.realm,
                    new_tag()
                ),
            );
            req.headers.append(
                "To",
                format!("<sip:{}@{}>", device.sip.realm, device.sip.realm),
            );
            req.headers
                .append("Call-ID", crate::sip::transport::new_call_id(&device.sip.realm));
            req.headers.append("CSeq", format!("{} MESSAGE", cseq));
            req.headers.append("Max-Forwards", "70");
            req.headers
                .append("Content-Type", "Application/MANSCDP+xml");
            req.set_body(body);

            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(e) = transport.request_with_retransmit(&req, remote, kind).await {
                    tracing::warn!(target: "gbcam::sip", error = %e, "MANSCDP push failed");
                }
            });
        }
    }
}

fn status_for_error(e: &GbError) -> (u16, &'static str) {
    match e {
        GbError::BadRequest(_) | GbError::Xml(_) | GbError::Sdp(_) | GbError::SipParse(_) => {
            (400, "Bad Request")
        }
        GbError::ChannelNotFound(_) | GbError::SessionNotFound(_) => (404, "Not Found"),
        GbError::Pipeline(_) => (488, "Not Acceptable Here"),
        GbError::Resource(_) => (503, "Service Unavailable"),
        GbError::Timeout => (504, "Server Time-out"),
        _ => (500, "Server Internal Error"),
    }
}
