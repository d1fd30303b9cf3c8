// SIP 传输层
// UDP 单 socket + 串行发送队列；TCP 按远端建池、空闲回收
//
// 非 INVITE 请求的 UDP 重传：T1=500ms 倍增至 T2=4s，最多 5 次；
// 对 UDP 请求的响应保留 32 秒，重复请求直接重放。

use crate::sip::message::{extract_branch, SipMessage, SipRequest, SipResponse};
use crate::{GbError, Result};
use dashmap::DashMap;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};

/// 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
}

/// 传输层配置
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// 绑定地址
    pub bind_ip: String,

    /// 绑定端口
    pub local_port: u16,

    /// 对外通告地址（Contact/Via 使用，NAT 下与绑定地址不同）
    pub contact_ip: String,

    /// TCP 连接空闲回收时间
    pub tcp_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            local_port: 5080,
            contact_ip: "127.0.0.1".to_string(),
            tcp_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// 收到的 SIP 消息
#[derive(Debug)]
pub struct Inbound {
    pub message: SipMessage,
    pub remote: SocketAddr,
    pub transport: TransportKind,
}

/// 生成事务 branch：z9hG4bK + 96 位随机数
pub fn new_branch() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("z9hG4bK{}", hex)
}

/// 生成对话 tag
pub fn new_tag() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 生成 Call-ID
pub fn new_call_id(domain: &str) -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}@{}", hex, domain)
}

struct CachedResponse {
    encoded: String,
    stored_at: Instant,
}

struct TcpConn {
    tx: mpsc::Sender<String>,
    last_used: Instant,
}

/// SIP 传输
pub struct SipTransport {
    config: TransportConfig,
    udp: Arc<UdpSocket>,

    /// 串行发送队列（保护重传记账）
    send_tx: mpsc::Sender<(String, SocketAddr)>,

    /// 等待响应的事务（branch → 完成端）
    pending: DashMap<String, oneshot::Sender<SipResponse>>,

    /// 已发响应缓存（branch → 报文），用于 UDP 重复请求重放
    response_cache: DashMap<String, CachedResponse>,

    /// TCP 连接池（远端 → 写入端）
    tcp_pool: DashMap<SocketAddr, TcpConn>,

    inbound_tx: mpsc::Sender<Inbound>,
}

impl SipTransport {
    /// 绑定 UDP socket 并启动收发任务
    pub async fn bind(config: TransportConfig) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let bind_addr = format!("{}:{}", config.bind_ip, config.local_port);
        let udp = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| GbError::Transport(format!("bind {} failed: {}", bind_addr, e)))?;

        tracing::info!(target: "gbcam::sip", %bind_addr, "SIP transport listening");

        let (send_tx, mut send_rx) = mpsc::channel::<(String, SocketAddr)>(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let transport = Arc::new(Self {
            config,
            udp: Arc::new(udp),
            send_tx,
            pending: DashMap::new(),
            response_cache: DashMap::new(),
            tcp_pool: DashMap::new(),
            inbound_tx,
        });

        // 串行发送任务
        let send_socket = Arc::clone(&transport.udp);
        tokio::spawn(async move {
            while let Some((data, addr)) = send_rx.recv().await {
                if let Err(e) = send_socket.send_to(data.as_bytes(), addr).await {
                    tracing::error!(target: "gbcam::sip", remote = %addr, error = %e, "UDP send failed");
                }
            }
        });

        // UDP 接收循环
        let recv_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match recv_transport.udp.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                        recv_transport.route_inbound(text, addr, TransportKind::Udp).await;
                    }
                    Err(e) => {
                        tracing::error!(target: "gbcam::sip", error = %e, "UDP recv failed");
                    }
                }
            }
        });

        // 缓存与空闲连接清理
        let sweep_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(8));
            loop {
                interval.tick().await;
                sweep_transport
                    .response_cache
                    .retain(|_, v| v.stored_at.elapsed() < Duration::from_secs(32));
                let idle = sweep_transport.config.tcp_idle_timeout;
                sweep_transport
                    .tcp_pool
                    .retain(|_, conn| conn.last_used.elapsed() < idle);
            }
        });

        Ok((transport, inbound_rx))
    }

    /// 通告地址
    pub fn contact_ip(&self) -> &str {
        &self.config.contact_ip
    }

    /// 本地端口
    pub fn local_port(&self) -> u16 {
        self.config.local_port
    }

    /// 实际绑定地址（端口 0 绑定后由内核分配）
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.udp
            .local_addr()
            .map_err(|e| GbError::Transport(format!("local_addr failed: {}", e)))
    }

    /// Via 头部值
    pub fn via(&self, kind: TransportKind, branch: &str) -> String {
        let proto = match kind {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        };
        format!(
            "SIP/2.0/{} {}:{};branch={}",
            proto, self.config.contact_ip, self.config.local_port, branch
        )
    }

    /// Contact 头部值（使用通告地址）
    pub fn contact(&self, user: &str) -> String {
        format!(
            "<sip:{}@{}:{}>",
            user, self.config.contact_ip, self.config.local_port
        )
    }

    async fn route_inbound(self: &Arc<Self>, text: String, remote: SocketAddr, kind: TransportKind) {
        let message = match SipMessage::parse(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(target: "gbcam::sip", remote = %remote, error = %e, "dropping unparseable SIP message");
                return;
            }
        };

        match message {
            SipMessage::Response(resp) => {
                if let Some(branch) = resp.branch().map(str::to_string) {
                    if let Some((_, waiter)) = self.pending.remove(&branch) {
                        let _ = waiter.send(resp);
                        return;
                    }
                }
                tracing::debug!(
                    target: "gbcam::sip",
                    remote = %remote,
                    status = resp.status_code,
                    "response without matching transaction",
                );
            }
            SipMessage::Request(req) => {
                // 重复请求：直接重放缓存的响应
                if kind == TransportKind::Udp {
                    if let Some(branch) = req.headers.get("Via").and_then(extract_branch) {
                        if let Some(cached) = self.response_cache.get(branch) {
                            tracing::debug!(
                                target: "gbcam::sip",
                                remote = %remote,
                                "replaying cached response for repeated request",
                            );
                            let _ = self.send_tx.send((cached.encoded.clone(), remote)).await;
                            return;
                        }
                    }
                }

                let inbound = Inbound {
                    message: SipMessage::Request(req),
                    remote,
                    transport: kind,
                };
                if self.inbound_tx.send(inbound).await.is_err() {
                    tracing::warn!(target: "gbcam::sip", "inbound queue closed, dropping request");
                }
            }
        }
    }

    /// 发送响应并缓存以备重放
    pub async fn send_response(
        self: &Arc<Self>,
        resp: &SipResponse,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        let encoded = resp.encode();

        if kind == TransportKind::Udp {
            if let Some(branch) = resp.branch().map(str::to_string) {
                self.response_cache.insert(
                    branch,
                    CachedResponse {
                        encoded: encoded.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
        }

        self.send_raw(encoded, remote, kind).await
    }

    /// 发送请求，不等待响应（ACK 等）
    pub async fn send_request(
        self: &Arc<Self>,
        req: &SipRequest,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        self.send_raw(req.encode(), remote, kind).await
    }

    /// 发送请求并等待最终响应
    ///
    /// UDP 按 T1 倍增重传；整体受 32 秒 Timer F 约束。
    pub async fn request_with_retransmit(
        self: &Arc<Self>,
        req: &SipRequest,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<SipResponse> {
        let branch = req
            .headers
            .get("Via")
            .and_then(extract_branch)
            .ok_or_else(|| GbError::Transport("request has no Via branch".to_string()))?
            .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(branch.clone(), tx);

        let encoded = req.encode();
        let result = match kind {
            TransportKind::Udp => self.udp_retransmit_loop(&branch, encoded, remote, rx).await,
            TransportKind::Tcp => {
                self.send_raw(encoded, remote, TransportKind::Tcp).await?;
                match tokio::time::timeout(Duration::from_secs(32), rx).await {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(_)) => Err(GbError::Transport("transaction dropped".to_string())),
                    Err(_) => Err(GbError::Timeout),
                }
            }
        };

        self.pending.remove(&branch);
        result
    }

    async fn udp_retransmit_loop(
        &self,
        branch: &str,
        encoded: String,
        remote: SocketAddr,
        mut rx: oneshot::Receiver<SipResponse>,
    ) -> Result<SipResponse> {
        let deadline = Instant::now() + Duration::from_secs(32);
        let mut interval = Duration::from_millis(500);

        for attempt in 0..5u32 {
            let _ = self.send_tx.send((encoded.clone(), remote)).await;
            if attempt > 0 {
                tracing::debug!(
                    target: "gbcam::sip",
                    remote = %remote,
                    branch,
                    attempt,
                    "retransmitting request",
                );
            }

            let wait = interval.min(deadline.saturating_duration_since(Instant::now()));
            if wait.is_zero() {
                break;
            }

            match tokio::time::timeout(wait, &mut rx).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(_)) => return Err(GbError::Transport("transaction dropped".to_string())),
                Err(_) => {}
            }

            interval = (interval * 2).min(Duration::from_secs(4));
        }

        // 最后一次发送后等到 Timer F 截止
        let rest = deadline.saturating_duration_since(Instant::now());
        if !rest.is_zero() {
            if let Ok(Ok(resp)) = tokio::time::timeout(rest, &mut rx).await {
                return Ok(resp);
            }
        }

        Err(GbError::Timeout)
    }

    async fn send_raw(
        self: &Arc<Self>,
        data: String,
        remote: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        match kind {
            TransportKind::Udp => {
                self.send_tx
                    .send((data, remote))
                    .await
                    .map_err(|_| GbError::Transport("send queue closed".to_string()))?;
                Ok(())
            }
            TransportKind::Tcp => self.send_tcp(data, remote).await,
        }
    }

    async fn send_tcp(self: &Arc<Self>, data: String, remote: SocketAddr) -> Result<()> {
        if let Some(mut conn) = self.tcp_pool.get_mut(&remote) {
            conn.last_used = Instant::now();
            if conn.tx.send(data.clone()).await.is_ok() {
                return Ok(());
            }
            drop(conn);
            self.tcp_pool.remove(&remote);
        }

        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| GbError::Transport(format!("TCP connect {} failed: {}", remote, e)))?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(chunk.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // 每连接一个读取任务，按 Content-Length 组帧
        let reader_transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::with_capacity(8192);
            let mut chunk = vec![0u8; 8192];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some((frame, consumed)) = extract_frame(&buf) {
                            buf.drain(..consumed);
                            reader_transport
                                .route_inbound(frame, remote, TransportKind::Tcp)
                                .await;
                        }
                    }
                }
            }
            tracing::debug!(target: "gbcam::sip", remote = %remote, "TCP connection closed");
        });

        tx.send(data)
            .await
            .map_err(|_| GbError::Transport("TCP writer closed".to_string()))?;

        self.tcp_pool.insert(
            remote,
            TcpConn {
                tx,
                last_used: Instant::now(),
            },
        );

        Ok(())
    }

}

/// 从字节流中截取一个完整 SIP 报文
///
/// 头部结束于第一个空行，消息体长度以 Content-Length 为准。
fn extract_frame(buf: &[u8]) -> Option<(String, usize)> {
    let text = String::from_utf8_lossy(buf);
    let header_end = match text.find("\r\n\r\n") {
        Some(pos) => pos + 4,
        None => text.find("\n\n").map(|pos| pos + 2)?,
    };

    let head = &text[..header_end];
    let content_length = head
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let total = header_end + content_length;
    if buf.len() < total {
        return None;
    }

    Some((text[..total].to_string(), total))
}
