// 通道目录
// 扫描媒体根目录，维护 channel_id → 媒体句柄 的映射

pub mod recording;

pub use recording::{format_gb_time, parse_gb_time, Recording, RecordingIndex};

use crate::manscdp::CatalogItem;
use arc_swap::ArcSwap;
use gbcam_config::{DeviceConfig, EosPolicy, RtspSourceConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 识别为视频的文件后缀
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "3gp", "ts", "mts",
];

/// 媒体句柄：本地文件或上游 RTSP 源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaHandle {
    File(PathBuf),
    Rtsp(String),
}

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    On,
    Off,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

/// 通道（摄像头等价物）
#[derive(Debug, Clone)]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub handle: MediaHandle,
    pub status: ChannelStatus,
    pub eos_policy: EosPolicy,
}

/// 目录快照（插入序）
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    pub channels: Vec<Channel>,
}

impl CatalogSnapshot {
    pub fn find(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }
}

/// 扫描状态快照
#[derive(Debug, Clone, Copy)]
pub struct ScanStatus {
    pub scanning: bool,
    pub scan_complete: bool,
    pub files_cached: usize,
    /// 最近一次扫描完成时间（Unix 秒，0 表示从未完成）
    pub last_scan_at: u64,
}

/// 通道目录存储
///
/// 读多写少：读者通过 arc-swap 快照访问，扫描任务在后台
/// 构建新目录后整体替换，扫描期间读者看到旧目录。
pub struct ChannelCatalog {
    device: DeviceConfig,
    rtsp_sources: Vec<RtspSourceConfig>,
    max_items: usize,
    eos_policy: EosPolicy,

    snapshot: ArcSwap<CatalogSnapshot>,
    recordings: RecordingIndex,

    scanning: AtomicBool,
    scan_complete: AtomicBool,
    files_cached: AtomicUsize,
    last_scan_at: AtomicU64,
}

impl ChannelCatalog {
    pub fn new(
        device: DeviceConfig,
        rtsp_sources: Vec<RtspSourceConfig>,
        max_items: usize,
        eos_policy: EosPolicy,
    ) -> Self {
        Self {
            device,
            rtsp_sources,
            max_items,
            eos_policy,
            snapshot: ArcSwap::from_pointee(CatalogSnapshot::default()),
            recordings: RecordingIndex::new(),
            scanning: AtomicBool::new(false),
            scan_complete: AtomicBool::new(false),
            files_cached: AtomicUsize::new(0),
            last_scan_at: AtomicU64::new(0),
        }
    }

    /// 当前目录快照
    pub fn channels(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.load_full()
    }

    /// 按通道 ID 查找
    pub fn find_channel(&self, channel_id: &str) -> Option<Channel> {
        self.snapshot.load().find(channel_id).cloned()
    }

    /// 历史录像索引
    pub fn recordings(&self) -> &RecordingIndex {
        &self.recordings
    }

    /// 扫描状态
    pub fn scan_status(&self) -> ScanStatus {
        ScanStatus {
            scanning: self.scanning.load(Ordering::Relaxed),
            scan_complete: self.scan_complete.load(Ordering::Relaxed),
            files_cached: self.files_cached.load(Ordering::Relaxed),
            last_scan_at: self.last_scan_at.load(Ordering::Relaxed),
        }
    }

    /// 后台扫描媒体根目录
    ///
    /// 立即返回扫描句柄；重复调用是幂等的（上一次未结束时
    /// 直接返回空扫描）。完成后目录与录像索引原子替换。
    pub fn start_scan(self: &Arc<Self>, root: impl AsRef<Path>) -> JoinHandle<usize> {
        let root = root.as_ref().to_path_buf();
        let catalog = Arc::clone(self);

        tokio::spawn(async move {
            if catalog.scanning.swap(true, Ordering::SeqCst) {
                tracing::debug!(target: "gbcam::catalog", "scan already in progress, skipping");
                return catalog.files_cached.load(Ordering::Relaxed);
            }

            // 扫描期间 files_cached 递增，可供进度查询
            catalog.files_cached.store(0, Ordering::Relaxed);
            let walk_root = root.clone();
            let walk_catalog = Arc::clone(&catalog);

            let walked =
                tokio::task::spawn_blocking(move || walk_media_files(&walk_root, &walk_catalog.files_cached))
                    .await
                    .unwrap_or_default();

            let found = walked.len();
            catalog.apply_scan(walked);

            catalog.files_cached.store(found, Ordering::Relaxed);
            catalog.scan_complete.store(true, Ordering::Relaxed);
            catalog.scanning.store(false, Ordering::SeqCst);
            catalog
                .last_scan_at
                .store(chrono::Utc::now().timestamp() as u64, Ordering::Relaxed);

            tracing::info!(
                target: "gbcam::catalog",
                root = %root.display(),
                files = found,
                "media scan complete",
            );

            found
        })
    }

    /// 用扫描结果构建并替换目录与录像索引
    fn apply_scan(&self, mut files: Vec<MediaFileEntry>) {
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut channels = Vec::new();
        let mut ordinal = 0usize;

        for source in &self.rtsp_sources {
            if !source.enabled {
                continue;
            }
            ordinal += 1;
            let channel_id = source
                .channel_id
                .clone()
                .unwrap_or_else(|| self.ordinal_channel_id(ordinal));
            channels.push(Channel {
                channel_id,
                name: source.name.clone(),
                handle: MediaHandle::Rtsp(source.url.clone()),
                status: ChannelStatus::On,
                eos_policy: self.eos_policy,
            });
        }

        // 目录条目上限只约束扫描结果，配置的直播源不受限
        if files.len() > self.max_items {
            tracing::warn!(
                target: "gbcam::catalog",
                found = files.len(),
                cap = self.max_items,
                "limiting catalog to stay within datagram budget",
            );
            files.truncate(self.max_items);
        }

        let mut recordings = Vec::with_capacity(files.len());
        for entry in files {
            ordinal += 1;
            let channel_id = self.ordinal_channel_id(ordinal);
            let name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| channel_id.clone());

            recordings.push(Recording::from_file(
                &channel_id,
                &name,
                &entry.path,
                entry.size,
                entry.modified,
            ));

            channels.push(Channel {
                channel_id,
                name,
                handle: MediaHandle::File(entry.path),
                status: ChannelStatus::On,
                eos_policy: self.eos_policy,
            });
        }

        self.recordings.replace(recordings);
        self.snapshot.store(Arc::new(CatalogSnapshot { channels }));
    }

    fn ordinal_channel_id(&self, ordinal: usize) -> String {
        format!("{}{:03}", self.device.device_id, ordinal)
    }

    /// 目录响应条目：首项为设备自身，其后为各通道
    pub fn catalog_items(&self) -> Vec<CatalogItem> {
        let device_id = &self.device.device_id;
        let snapshot = self.snapshot.load();

        let mut items = Vec::with_capacity(snapshot.channels.len() + 1);
        items.push(CatalogItem {
            device_id: device_id.clone(),
            name: self.device.device_name.clone(),
            manufacturer: self.device.manufacturer.clone(),
            model: self.device.model.clone(),
            owner: "gbcam".to_string(),
            civil_code: self.device.sip.realm.clone(),
            block: String::new(),
            address: "Local".to_string(),
            parental: 1,
            parent_id: device_id.clone(),
            safety_way: 0,
            register_way: 1,
            secrecy: 0,
            status: "ON".to_string(),
        });

        for channel in &snapshot.channels {
            items.push(CatalogItem {
                device_id: channel.channel_id.clone(),
                name: channel.name.clone(),
                manufacturer: self.device.manufacturer.clone(),
                model: self.device.model.clone(),
                owner: "gbcam".to_string(),
                civil_code: self.device.sip.realm.clone(),
                block: String::new(),
                address: channel.name.clone(),
                parental: 0,
                parent_id: device_id.clone(),
                safety_way: 0,
                register_way: 1,
                secrecy: 0,
                status: channel.status.as_str().to_string(),
            });
        }

        items
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }
}

#[derive(Debug)]
struct MediaFileEntry {
    path: PathBuf,
    size: u64,
    modified: chrono::DateTime<chrono::Utc>,
}

/// 递归收集视频文件；不可读目录记日志并跳过
fn walk_media_files(root: &Path, counter: &AtomicUsize) -> Vec<MediaFileEntry> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    target: "gbcam::catalog",
                    dir = %dir.display(),
                    error = %e,
                    "skipping unreadable directory",
                );
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }

            let is_video = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !is_video {
                continue;
            }

            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = meta
                .modified()
                .map(chrono::DateTime::<chrono::Utc>::from)
                .unwrap_or_else(|_| chrono::Utc::now());

            out.push(MediaFileEntry {
                path,
                size: meta.len(),
                modified,
            });
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    out
}
