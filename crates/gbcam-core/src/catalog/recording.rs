// 历史录像索引
// 按 (channel, start, end) 时间相交查询，重扫描时整体替换

use crate::manscdp::RecordItem;
use crate::{GbError, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;

/// GB28181 负载中的紧凑 UTC 时间格式
const GB_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// 格式化为紧凑 UTC 时间
pub fn format_gb_time(dt: DateTime<Utc>) -> String {
    dt.format(GB_TIME_FORMAT).to_string()
}

/// 解析紧凑 UTC 时间；兼容带连字符的变体
pub fn parse_gb_time(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, GB_TIME_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    Err(GbError::BadRequest(format!("bad time value {:?}", s)))
}

/// 历史录像条目
#[derive(Debug, Clone)]
pub struct Recording {
    pub channel_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub name: String,
    pub path: String,
    pub file_size: u64,
    pub record_type: String,
}

impl Recording {
    /// 从文件元数据构造
    ///
    /// mtime 视为结束时间，开始时间按码率 1024 kbps 估算时长
    /// 回推，夹在 [1s, 24h] 内。
    pub fn from_file(
        channel_id: &str,
        name: &str,
        path: &Path,
        size: u64,
        modified: DateTime<Utc>,
    ) -> Self {
        let est_secs = ((size * 8) / 1_024_000).clamp(1, 86_400) as i64;

        Self {
            channel_id: channel_id.to_string(),
            start_time: modified - chrono::Duration::seconds(est_secs),
            end_time: modified,
            name: name.to_string(),
            path: path.to_string_lossy().into_owned(),
            file_size: size,
            record_type: "time".to_string(),
        }
    }

    /// 转换为 MANSCDP 响应条目
    pub fn to_record_item(&self) -> RecordItem {
        RecordItem {
            device_id: self.channel_id.clone(),
            name: self.name.clone(),
            file_path: self.path.clone(),
            start_time: format_gb_time(self.start_time),
            end_time: format_gb_time(self.end_time),
            secrecy: 0,
            record_type: self.record_type.clone(),
        }
    }
}

/// 录像索引存储
///
/// 与目录同源：扫描完成时整体替换，查询方持快照。
pub struct RecordingIndex {
    snapshot: ArcSwap<Vec<Recording>>,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// 原子替换全部条目
    pub fn replace(&self, mut recordings: Vec<Recording>) {
        recordings.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.name.cmp(&b.name))
        });
        self.snapshot.store(Arc::new(recordings));
    }

    /// 时间相交查询
    ///
    /// 命中条件：[start_time, end_time] 与 [start, end] 相交，
    /// 边界含端点；None 表示开区间。结果按 start_time 升序，
    /// 同刻按名称。
    pub fn query(
        &self,
        channel_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Recording> {
        self.snapshot
            .load()
            .iter()
            .filter(|r| r.channel_id == channel_id)
            .filter(|r| match end {
                Some(end) => r.start_time <= end,
                None => true,
            })
            .filter(|r| match start {
                Some(start) => r.end_time >= start,
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Default for RecordingIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        parse_gb_time(s).unwrap()
    }

    fn rec(channel: &str, start: &str, end: &str, name: &str) -> Recording {
        Recording {
            channel_id: channel.to_string(),
            start_time: t(start),
            end_time: t(end),
            name: name.to_string(),
            path: format!("/srv/media/{}", name),
            file_size: 1024,
            record_type: "time".to_string(),
        }
    }

    #[test]
    fn test_gb_time_roundtrip() {
        let dt = t("20250515T080000Z");
        assert_eq!(format_gb_time(dt), "20250515T080000Z");
    }

    #[test]
    fn test_parse_dashed_variant() {
        assert_eq!(
            parse_gb_time("2025-05-15T08:00:00").unwrap(),
            t("20250515T080000Z")
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_gb_time("yesterday").is_err());
    }

    #[test]
    fn test_time_filter_scenario() {
        // 三段录像，查询窗口只应命中 13:00 的一段
        let index = RecordingIndex::new();
        index.replace(vec![
            rec("ch1", "20250515T080000Z", "20250515T090000Z", "early.mp4"),
            rec("ch1", "20250515T130000Z", "20250515T140000Z", "midday.mp4"),
            rec("ch1", "20250516T100000Z", "20250516T110000Z", "nextday.mp4"),
        ]);

        let hits = index.query(
            "ch1",
            Some(t("20250515T120000Z")),
            Some(t("20250515T235959Z")),
        );

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "midday.mp4");
    }

    #[test]
    fn test_inclusive_bounds() {
        let index = RecordingIndex::new();
        index.replace(vec![rec(
            "ch1",
            "20250515T080000Z",
            "20250515T090000Z",
            "a.mp4",
        )]);

        // 查询起点恰好等于录像终点，仍然命中
        let hits = index.query(
            "ch1",
            Some(t("20250515T090000Z")),
            Some(t("20250515T100000Z")),
        );
        assert_eq!(hits.len(), 1);

        // 查询终点恰好等于录像起点，仍然命中
        let hits = index.query(
            "ch1",
            Some(t("20250515T070000Z")),
            Some(t("20250515T080000Z")),
        );
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_open_bounds() {
        let index = RecordingIndex::new();
        index.replace(vec![
            rec("ch1", "20250515T080000Z", "20250515T090000Z", "a.mp4"),
            rec("ch1", "20250516T080000Z", "20250516T090000Z", "b.mp4"),
        ]);

        assert_eq!(index.query("ch1", None, None).len(), 2);
        assert_eq!(
            index
                .query("ch1", Some(t("20250516T000000Z")), None)
                .len(),
            1
        );
        assert_eq!(
            index.query("ch1", None, Some(t("20250515T235959Z"))).len(),
            1
        );
    }

    #[test]
    fn test_ordering_start_then_name() {
        let index = RecordingIndex::new();
        index.replace(vec![
            rec("ch1", "20250515T100000Z", "20250515T110000Z", "b.mp4"),
            rec("ch1", "20250515T100000Z", "20250515T110000Z", "a.mp4"),
            rec("ch1", "20250515T080000Z", "20250515T090000Z", "z.mp4"),
        ]);

        let hits = index.query("ch1", None, None);
        let names: Vec<&str> = hits.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["z.mp4", "a.mp4", "b.mp4"]);
    }

    #[test]
    fn test_channel_isolation() {
        let index = RecordingIndex::new();
        index.replace(vec![
            rec("ch1", "20250515T080000Z", "20250515T090000Z", "a.mp4"),
            rec("ch2", "20250515T080000Z", "20250515T090000Z", "b.mp4"),
        ]);

        let hits = index.query("ch2", None, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "b.mp4");
    }

    #[test]
    fn test_from_file_estimates_duration() {
        let end = t("20250515T090000Z");
        let rec = Recording::from_file(
            "ch1",
            "clip.mp4",
            Path::new("/srv/media/clip.mp4"),
            128_000 * 60, // 约 60 秒 @1024kbps
            end,
        );

        assert_eq!(rec.end_time, end);
        assert!(rec.start_time < rec.end_time);
        let item = rec.to_record_item();
        assert_eq!(item.end_time, "20250515T090000Z");
        assert_eq!(item.record_type, "time");
    }
}
