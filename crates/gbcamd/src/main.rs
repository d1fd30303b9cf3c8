// gbcamd: GB28181 虚拟设备守护进程
// 配置加载 → 目录扫描 → SIP 传输/分发 → 注册/心跳 → 协作式关闭

use anyhow::{Context, Result};
use clap::Parser;
use gbcam_config::{ConfigLoader, GbcamConfig};
use gbcam_core::catalog::ChannelCatalog;
use gbcam_core::media::{HealthObserver, SessionManager};
use gbcam_core::sip::{
    Dispatcher, DispatcherConfig, Registrar, RegistrationConfig, SipTransport, TransportConfig,
    TransportKind,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// 并发媒体会话上限，超出对新 INVITE 回 503
const MAX_MEDIA_SESSIONS: usize = 16;

/// 媒体根目录重扫描周期
const RESCAN_INTERVAL: Duration = Duration::from_secs(300);

/// 关闭流程总时限
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置文件路径
    #[arg(long, default_value = "gbcam.toml")]
    config: String,

    /// 覆盖扫描根目录
    #[arg(long)]
    stream_directory: Option<String>,

    /// 输出调试日志
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = ConfigLoader::new(&args.config)
        .load()
        .with_context(|| format!("failed to load config from {}", args.config))?;
    if let Some(dir) = args.stream_directory {
        config.device.stream_directory = dir;
    }

    // 配置无效拒绝启动
    ConfigLoader::validate(&config).context("invalid configuration")?;

    tracing::info!(
        device_id = %config.device.device_id,
        server = %config.device.sip.server,
        transport = ?config.device.sip.transport,
        "gbcamd starting",
    );

    run(config).await
}

async fn run(config: GbcamConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 目录与录像索引
    let catalog = Arc::new(ChannelCatalog::new(
        config.device.clone(),
        config.streaming.rtsp_sources.clone(),
        config.streaming.catalog_max_items,
        config.streaming.eos_policy,
    ));
    let _ = catalog.start_scan(&config.device.stream_directory);

    // 周期重扫描
    {
        let catalog = Arc::clone(&catalog);
        let root = config.device.stream_directory.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RESCAN_INTERVAL);
            interval.tick().await; // 启动扫描已在进行
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let _ = catalog.start_scan(&root);
                    }
                }
            }
        });
    }

    // SIP 传输
    let (transport, inbound_rx) = SipTransport::bind(TransportConfig {
        bind_ip: config.device.sip.local_ip.clone(),
        local_port: config.device.sip.local_port,
        contact_ip: config.device.sip.effective_contact_ip().to_string(),
        tcp_idle_timeout: Duration::from_secs(60),
    })
    .await
    .context("failed to bind SIP transport")?;

    let transport_kind = match config.device.sip.transport {
        gbcam_config::SipTransport::Udp => TransportKind::Udp,
        gbcam_config::SipTransport::Tcp => TransportKind::Tcp,
    };

    // 分发器与媒体会话
    let sessions = Arc::new(SessionManager::new(MAX_MEDIA_SESSIONS));
    let (events_tx, events_rx) = mpsc::channel(64);

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig {
            device: config.device.clone(),
            datagram_budget: config.streaming.datagram_budget,
            encoder: config.streaming.preset("default"),
            max_restarts: config.streaming.max_restarts,
        },
        Arc::clone(&transport),
        Arc::clone(&catalog),
        Arc::clone(&sessions),
        events_tx,
    ));
    tokio::spawn(Arc::clone(&dispatcher).run(inbound_rx, events_rx, shutdown_rx.clone()));

    // 注册与心跳（sip.server 允许域名）
    let server: SocketAddr = tokio::net::lookup_host(format!(
        "{}:{}",
        config.device.sip.server, config.device.sip.port
    ))
    .await
    .context("failed to resolve sip.server")?
    .next()
    .ok_or_else(|| anyhow::anyhow!("sip.server resolved to no addresses"))?;

    let registrar = Arc::new(Registrar::new(
        RegistrationConfig {
            device_id: config.device.device_id.clone(),
            username: config.device.sip_username().to_string(),
            password: config.device.sip.password.clone(),
            realm: config.device.sip.realm.clone(),
            server,
            transport: transport_kind,
            expires: config.device.sip.register_expires,
            keepalive_interval: Duration::from_secs(config.device.sip.keepalive_interval),
        },
        Arc::clone(&transport),
    ));
    tokio::spawn(Arc::clone(&registrar).run(shutdown_rx.clone()));

    // 连通性健康观察
    let observer = HealthObserver::new(config.device.sip.register_expires);
    tokio::spawn(observer.run(Arc::clone(&registrar), shutdown_rx.clone()));

    tracing::info!("gbcamd running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    graceful_shutdown(shutdown_tx, dispatcher, registrar).await;
    Ok(())
}

/// 协作式关闭：停收 INVITE → BYE 全部会话 → 注销 → 限时退出
async fn graceful_shutdown(
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Arc<Dispatcher>,
    registrar: Arc<Registrar>,
) {
    tracing::info!("shutdown requested, draining sessions");
    let started = std::time::Instant::now();

    dispatcher.stop_accepting();
    let _ = shutdown_tx.send(true);

    let drain = async {
        dispatcher.teardown_sessions().await;
        if let Err(e) = registrar.deregister().await {
            tracing::warn!(error = %e, "deregister failed");
        }
    };

    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        tracing::warn!(
            deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
            "shutdown deadline exceeded, forcing exit",
        );
    }

    tracing::info!(elapsed = ?started.elapsed(), "gbcamd stopped");
}
