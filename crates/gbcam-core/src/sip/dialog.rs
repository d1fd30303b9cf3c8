// SIP 对话管理
// 以 Call-ID 为键维护标签、CSeq、Route 集与订阅状态

use crate::sip::transport::TransportKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 目录订阅状态
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Event 头部值
    pub event: String,

    /// 到期时间
    pub expires_at: DateTime<Utc>,

    /// NOTIFY 已发送次数（作为 NOTIFY 的 SN）
    pub notify_count: u32,
}

impl Subscription {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// SIP 对话
///
/// 注册对话与 INVITE 对话共用此结构；Route 集来自建立对话的
/// 请求中的 Record-Route，对话内出站请求原样回放。
#[derive(Debug, Clone)]
pub struct Dialog {
    /// Call-ID
    pub call_id: String,

    /// 本端 tag（首个响应时分配）
    pub local_tag: String,

    /// 远端 tag
    pub remote_tag: Option<String>,

    /// 远端 From/To 原值（出站请求回显用）
    pub remote_from: String,
    pub local_to: String,

    /// 对端地址
    pub remote: SocketAddr,

    /// 对端传输方式
    pub transport: TransportKind,

    /// Record-Route 捕获的 Route 集（按出现顺序）
    pub route_set: Vec<String>,

    /// 本端出站 CSeq
    pub local_cseq: u32,

    /// 远端最近一次 CSeq
    pub remote_cseq: u32,

    /// 订阅状态（SUBSCRIBE 对话）
    pub subscription: Option<Subscription>,

    /// 关联的媒体会话
    pub media_session_id: Option<String>,

    /// 建立时间
    pub created_at: DateTime<Utc>,

    /// 最近活动时间
    pub updated_at: DateTime<Utc>,
}

impl Dialog {
    pub fn new(call_id: String, local_tag: String, remote: SocketAddr, transport: TransportKind) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            local_tag,
            remote_tag: None,
            remote_from: String::new(),
            local_to: String::new(),
            remote,
            transport,
            route_set: Vec::new(),
            local_cseq: 0,
            remote_cseq: 0,
            subscription: None,
            media_session_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 下一个本端 CSeq
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.updated_at = Utc::now();
        self.local_cseq
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 对话管理器
pub struct DialogManager {
    dialogs: Arc<RwLock<HashMap<String, Dialog>>>,
}

impl DialogManager {
    pub fn new() -> Self {
        Self {
            dialogs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 建立对话
    pub async fn create(&self, dialog: Dialog) -> Dialog {
        let mut dialogs = self.dialogs.write().await;
        tracing::info!(
            target: "gbcam::sip",
            call_id = %dialog.call_id,
            remote = %dialog.remote,
            "dialog created",
        );
        dialogs.insert(dialog.call_id.clone(), dialog.clone());
        dialog
    }

    pub async fn get(&self, call_id: &str) -> Option<Dialog> {
        let dialogs = self.dialogs.read().await;
        dialogs.get(call_id).cloned()
    }

    /// 就地修改对话，返回修改后的副本
    pub async fn update<F>(&self, call_id: &str, f: F) -> Option<Dialog>
    where
        F: FnOnce(&mut Dialog),
    {
        let mut dialogs = self.dialogs.write().await;
        let dialog = dialogs.get_mut(call_id)?;
        f(dialog);
        dialog.touch();
        Some(dialog.clone())
    }

    /// 终止并移除对话
    pub async fn remove(&self, call_id: &str) -> Option<Dialog> {
        let mut dialogs = self.dialogs.write().await;
        let removed = dialogs.remove(call_id);
        if removed.is_some() {
            tracing::info!(target: "gbcam::sip", %call_id, "dialog removed");
        }
        removed
    }

    pub async fn list(&self) -> Vec<Dialog> {
        let dialogs = self.dialogs.read().await;
        dialogs.values().cloned().collect()
    }

    /// 携带活跃订阅的对话
    pub async fn subscriptions(&self) -> Vec<Dialog> {
        let dialogs = self.dialogs.read().await;
        dialogs
            .values()
            .filter(|d| d.subscription.as_ref().map(|s| !s.is_expired()).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// 清理过期订阅，返回刚过期的对话（供发送 terminated NOTIFY）
    pub async fn expire_subscriptions(&self) -> Vec<Dialog> {
        let mut dialogs = self.dialogs.write().await;
        let expired_ids: Vec<String> = dialogs
            .values()
            .filter(|d| d.subscription.as_ref().map(Subscription::is_expired).unwrap_or(false))
            .map(|d| d.call_id.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for call_id in expired_ids {
            if let Some(dialog) = dialogs.remove(&call_id) {
                tracing::info!(target: "gbcam::sip", %call_id, "subscription expired");
                expired.push(dialog);
            }
        }
        expired
    }

    pub async fn count(&self) -> usize {
        let dialogs = self.dialogs.read().await;
        dialogs.len()
    }
}

impl Default for DialogManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.1:5060".parse().unwrap()
    }

    #[tokio::test]
    async fn test_dialog_lifecycle() {
        let manager = DialogManager::new();
        manager
            .create(Dialog::new(
                "call-1".to_string(),
                "tag-a".to_string(),
                addr(),
                TransportKind::Udp,
            ))
            .await;

        assert_eq!(manager.count().await, 1);
        assert!(manager.get("call-1").await.is_some());

        manager.remove("call-1").await.unwrap();
        assert!(manager.get("call-1").await.is_none());
    }

    #[tokio::test]
    async fn test_cseq_monotonic() {
        let manager = DialogManager::new();
        manager
            .create(Dialog::new(
                "call-1".to_string(),
                "tag-a".to_string(),
                addr(),
                TransportKind::Udp,
            ))
            .await;

        let d1 = manager.update("call-1", |d| { d.next_cseq(); }).await.unwrap();
        let d2 = manager.update("call-1", |d| { d.next_cseq(); }).await.unwrap();
        assert!(d2.local_cseq > d1.local_cseq);
    }

    #[tokio::test]
    async fn test_route_set_stored() {
        let manager = DialogManager::new();
        let mut dialog = Dialog::new(
            "call-1".to_string(),
            "tag-a".to_string(),
            addr(),
            TransportKind::Udp,
        );
        dialog.route_set = vec!["<sip:proxy.example;lr>".to_string()];
        manager.create(dialog).await;

        let stored = manager.get("call-1").await.unwrap();
        assert_eq!(stored.route_set, vec!["<sip:proxy.example;lr>"]);
    }

    #[tokio::test]
    async fn test_subscription_expiry() {
        let manager = DialogManager::new();
        let mut dialog = Dialog::new(
            "sub-1".to_string(),
            "tag-a".to_string(),
            addr(),
            TransportKind::Udp,
        );
        dialog.subscription = Some(Subscription {
            event: "Catalog".to_string(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            notify_count: 1,
        });
        manager.create(dialog).await;

        let expired = manager.expire_subscriptions().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(manager.count().await, 0);
    }
}
