// 媒体管线
// 声明式描述（源 → 编码参数 → RTP 出口），提交后由运行器执行，
// 状态变化通过 watch 通道上报，监护者据此重启或放弃。

use crate::media::rtp::{ps_wrap, RtpSender};
use crate::{GbError, Result};
use futures::StreamExt;
use gbcam_config::{EncoderPreset, EosPolicy};
use retina::client::{PlayOptions, Session, SessionOptions, SetupOptions};
use retina::codec::CodecItem;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use url::Url;

/// RTP 负载封装方式（按 offer 的 a=rtpmap 选择）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Ps,
    H264,
}

impl PayloadKind {
    pub fn from_encoding(name: &str) -> Self {
        if name.eq_ignore_ascii_case("H264") {
            Self::H264
        } else {
            Self::Ps
        }
    }
}

/// 管线源
#[derive(Debug, Clone)]
pub enum PipelineSource {
    File { path: PathBuf, on_eos: EosPolicy },
    Rtsp { url: String },
}

/// 管线声明
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub source: PipelineSource,
    pub encoder: EncoderPreset,
    pub payload_type: u8,
    pub ssrc: u32,
    pub payload_kind: PayloadKind,
    pub target: SocketAddr,
}

/// 管线状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Playing,
    Error(String),
    Eos,
    Stopped,
}

/// 管线句柄
pub struct PipelineHandle {
    state_rx: watch::Receiver<PipelineState>,
    stop_tx: watch::Sender<bool>,
    local_rtp_port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl PipelineHandle {
    /// 当前状态
    pub fn state(&self) -> PipelineState {
        self.state_rx.borrow().clone()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub fn local_rtp_port(&self) -> u16 {
        self.local_rtp_port
    }

    /// 等待进入 Playing；Error/超时视为初始化失败
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match &*rx.borrow() {
                PipelineState::Playing => return Ok(()),
                PipelineState::Error(e) => return Err(GbError::Pipeline(e.clone())),
                PipelineState::Eos | PipelineState::Stopped => {
                    return Err(GbError::Pipeline("pipeline ended before playing".to_string()))
                }
                PipelineState::Starting => {}
            }

            if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                return Err(GbError::Pipeline("pipeline start timed out".to_string()));
            }
        }
    }

    /// 停止并排空管线
    ///
    /// 发送循环须在 100ms 内退出（BYE 之后不得再有 RTP 发出），
    /// 超时直接中止任务。
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(Duration::from_millis(100), self.task)
            .await
            .is_err()
        {
            tracing::warn!(target: "gbcam::media", "pipeline did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// 构建并启动管线
///
/// RTP socket 绑定失败与文件打开失败都算初始化失败，
/// 调用方以 488 响应 INVITE。
pub async fn spawn(spec: PipelineSpec) -> Result<PipelineHandle> {
    let sender = RtpSender::connect(spec.target, spec.payload_type, spec.ssrc).await?;
    let local_rtp_port = sender.local_port();

    if let PipelineSource::File { path, .. } = &spec.source {
        if !path.is_file() {
            return Err(GbError::Pipeline(format!(
                "media file not found: {}",
                path.display()
            )));
        }
    }

    let (state_tx, state_rx) = watch::channel(PipelineState::Starting);
    let (stop_tx, stop_rx) = watch::channel(false);

    let task = tokio::spawn(run_pipeline(spec, sender, state_tx, stop_rx));

    Ok(PipelineHandle {
        state_rx,
        stop_tx,
        local_rtp_port,
        task,
    })
}

async fn run_pipeline(
    spec: PipelineSpec,
    sender: RtpSender,
    state_tx: watch::Sender<PipelineState>,
    stop_rx: watch::Receiver<bool>,
) {
    let result = match spec.source.clone() {
        PipelineSource::File { path, on_eos } => {
            run_file_source(&spec, path, on_eos, sender, &state_tx, stop_rx).await
        }
        PipelineSource::Rtsp { url } => {
            run_rtsp_source(&spec, url, sender, &state_tx, stop_rx).await
        }
    };

    match result {
        Ok(()) => {
            // Eos/Stopped 已在循环内上报
        }
        Err(e) => {
            tracing::error!(target: "gbcam::media", error = %e, "pipeline failed");
            let _ = state_tx.send(PipelineState::Error(e.to_string()));
        }
    }
}

/// 文件源：按编码参数的码率与帧率节拍读取并打包
async fn run_file_source(
    spec: &PipelineSpec,
    path: PathBuf,
    on_eos: EosPolicy,
    mut sender: RtpSender,
    state_tx: &watch::Sender<PipelineState>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut file = tokio::fs::File::open(&path).await?;

    let framerate = spec.encoder.framerate.max(1);
    let frame_bytes = ((spec.encoder.bitrate as usize * 1000 / 8) / framerate as usize).max(256);
    let ts_increment = 90_000 / framerate;
    let mut interval = tokio::time::interval(Duration::from_millis(1000 / framerate as u64));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let _ = state_tx.send(PipelineState::Playing);
    tracing::info!(
        target: "gbcam::media",
        path = %path.display(),
        ssrc = spec.ssrc,
        "file pipeline playing",
    );

    let mut buf = vec![0u8; frame_bytes];

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                // 句柄被丢弃等同停止
                if changed.is_err() || *stop_rx.borrow() {
                    let _ = state_tx.send(PipelineState::Stopped);
                    return Ok(());
                }
            }
            _ = interval.tick() => {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    match on_eos {
                        EosPolicy::Loop => {
                            file.seek(std::io::SeekFrom::Start(0)).await?;
                            continue;
                        }
                        EosPolicy::Terminate => {
                            tracing::info!(target: "gbcam::media", "file source reached EOS");
                            let _ = state_tx.send(PipelineState::Eos);
                            return Ok(());
                        }
                    }
                }

                match spec.payload_kind {
                    PayloadKind::Ps => {
                        let ps = ps_wrap(&buf[..n]);
                        sender.send_ps_frame(&ps, ts_increment).await?;
                    }
                    PayloadKind::H264 => {
                        sender.send_h264_frame(&buf[..n], ts_increment).await?;
                    }
                }
            }
        }
    }
}

/// RTSP 源：retina 拉流，视频帧转发
async fn run_rtsp_source(
    spec: &PipelineSpec,
    url: String,
    mut sender: RtpSender,
    state_tx: &watch::Sender<PipelineState>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let url = Url::parse(&url).map_err(|e| GbError::Pipeline(format!("bad RTSP URL: {}", e)))?;

    let creds = if !url.username().is_empty() {
        Some(retina::client::Credentials {
            username: url.username().to_string(),
            password: url.password().unwrap_or("").to_string(),
        })
    } else {
        None
    };

    let mut session = Session::describe(url.clone(), SessionOptions::default().creds(creds))
        .await
        .map_err(|e| GbError::Pipeline(format!("RTSP describe failed: {}", e)))?;

    let video_stream_i = session
        .streams()
        .iter()
        .position(|s| matches!(s.media(), "video"))
        .ok_or_else(|| GbError::Pipeline("RTSP source has no video stream".to_string()))?;

    session
        .setup(video_stream_i, SetupOptions::default())
        .await
        .map_err(|e| GbError::Pipeline(format!("RTSP setup failed: {}", e)))?;

    let session = session
        .play(PlayOptions::default())
        .await
        .map_err(|e| GbError::Pipeline(format!("RTSP play failed: {}", e)))?
        .demuxed()
        .map_err(|e| GbError::Pipeline(format!("RTSP demux failed: {}", e)))?;

    let _ = state_tx.send(PipelineState::Playing);
    tracing::info!(target: "gbcam::media", %url, ssrc = spec.ssrc, "RTSP pipeline playing");

    let ts_increment = 90_000 / spec.encoder.framerate.max(1);

    tokio::pin!(session);
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    let _ = state_tx.send(PipelineState::Stopped);
                    return Ok(());
                }
            }
            item = session.next() => {
                match item {
                    Some(Ok(CodecItem::VideoFrame(frame))) => {
                        let annexb = to_annexb(frame.data());
                        match spec.payload_kind {
                            PayloadKind::Ps => {
                                let ps = ps_wrap(&annexb);
                                sender.send_ps_frame(&ps, ts_increment).await?;
                            }
                            PayloadKind::H264 => {
                                sender.send_h264_frame(&annexb, ts_increment).await?;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(GbError::Pipeline(format!("RTSP receive error: {}", e)));
                    }
                    None => {
                        tracing::info!(target: "gbcam::media", "RTSP source ended");
                        let _ = state_tx.send(PipelineState::Eos);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// AVC 长度前缀格式转 Annex B；已是 Annex B 时原样返回
fn to_annexb(data: &[u8]) -> Vec<u8> {
    if data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1]) {
        return data.to_vec();
    }

    let mut out = Vec::with_capacity(data.len() + 16);
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let len = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        offset += 4;
        if len == 0 || offset + len > data.len() {
            // 长度字段不可信，当作 Annex B 兜底
            return data.to_vec();
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&data[offset..offset + len]);
        offset += len;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::net::UdpSocket;

    fn file_spec(path: PathBuf, target: SocketAddr, on_eos: EosPolicy) -> PipelineSpec {
        PipelineSpec {
            source: PipelineSource::File { path, on_eos },
            encoder: EncoderPreset::default(),
            payload_type: 96,
            ssrc: 100000001,
            payload_kind: PayloadKind::Ps,
            target,
        }
    }

    #[tokio::test]
    async fn test_file_pipeline_sends_rtp_with_ssrc() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&vec![0x42u8; 64 * 1024])
            .unwrap();

        let handle = spawn(file_spec(path, target, EosPolicy::Loop)).await.unwrap();
        handle.wait_ready(Duration::from_secs(2)).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(len >= 12);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(ssrc, 100000001);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_file_pipeline_eos_terminates() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.mp4");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0x11u8; 128])
            .unwrap();

        let handle = spawn(file_spec(path, target, EosPolicy::Terminate))
            .await
            .unwrap();

        let mut rx = handle.watch_state();
        let eos = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if *rx.borrow() == PipelineState::Eos {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap();
        assert!(eos);
    }

    #[tokio::test]
    async fn test_missing_file_fails_spawn() {
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let spec = file_spec(PathBuf::from("/no/such/file.mp4"), target, EosPolicy::Loop);
        match spawn(spec).await {
            Err(GbError::Pipeline(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected pipeline error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_payload_kind_from_encoding() {
        assert_eq!(PayloadKind::from_encoding("H264"), PayloadKind::H264);
        assert_eq!(PayloadKind::from_encoding("h264"), PayloadKind::H264);
        assert_eq!(PayloadKind::from_encoding("PS"), PayloadKind::Ps);
        assert_eq!(PayloadKind::from_encoding("MPEG4"), PayloadKind::Ps);
    }

    #[test]
    fn test_avcc_to_annexb() {
        let mut avcc = Vec::new();
        avcc.extend_from_slice(&4u32.to_be_bytes());
        avcc.extend_from_slice(&[0x65, 1, 2, 3]);
        avcc.extend_from_slice(&2u32.to_be_bytes());
        avcc.extend_from_slice(&[0x41, 9]);

        let annexb = to_annexb(&avcc);
        assert_eq!(
            annexb,
            vec![0, 0, 0, 1, 0x65, 1, 2, 3, 0, 0, 0, 1, 0x41, 9]
        );

        // 已是 Annex B 的数据原样返回
        let raw = vec![0u8, 0, 0, 1, 0x67, 0xAA];
        assert_eq!(to_annexb(&raw), raw);
    }
}
