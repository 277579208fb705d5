//! 活动存储：显式的注册表对象，由编排器持有并按句柄传递
//!
//! 所有临界区都很短，且从不跨越 I/O 的 await 持有锁。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agent::DeliveryReport;
use crate::core::error::CampaignError;
use crate::core::events::ObserverHandle;
use crate::core::recipient::Recipient;
use crate::core::state::{
    Campaign, CampaignId, CampaignOptions, CampaignSnapshot, CampaignStatus, Commit, ControlAction,
    Cycle, Dispatch, LoopEnd, Transition,
};
use crate::session::SessionBinding;

/// 活动注册表
#[derive(Debug, Default)]
pub struct CampaignStore {
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
    next_id: AtomicU64,
}

impl CampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新建活动（running，version 1），并标记循环已占用
    pub async fn insert(&self, recipients: Vec<Recipient>, options: CampaignOptions) -> CampaignId {
        let id = CampaignId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut campaign = Campaign::new(id, recipients, options);
        campaign.loop_active = true;
        self.campaigns.write().await.insert(id, campaign);
        id
    }

    pub async fn contains(&self, id: CampaignId) -> bool {
        self.campaigns.read().await.contains_key(&id)
    }

    pub async fn apply(&self, id: CampaignId, action: ControlAction) -> Result<Transition, CampaignError> {
        let mut campaigns = self.campaigns.write().await;
        let campaign = campaigns.get_mut(&id).ok_or(CampaignError::NotFound(id))?;
        campaign.apply(action)
    }

    pub async fn cancel_token(&self, id: CampaignId) -> Option<CancellationToken> {
        self.campaigns.read().await.get(&id).map(|c| c.cancel.clone())
    }

    pub async fn next_cycle(&self, id: CampaignId) -> Option<Cycle> {
        self.campaigns.read().await.get(&id).map(Campaign::next_cycle)
    }

    pub async fn commit(&self, id: CampaignId, dispatch: &Dispatch, report: &DeliveryReport) -> Option<Commit> {
        let mut campaigns = self.campaigns.write().await;
        campaigns.get_mut(&id).map(|c| c.commit(dispatch, report))
    }

    pub async fn bind_session(&self, id: CampaignId, binding: Option<SessionBinding>) {
        if let Some(c) = self.campaigns.write().await.get_mut(&id) {
            c.session = binding;
        }
    }

    /// 取走会话绑定（终态回收时使用）
    pub async fn take_session(&self, id: CampaignId) -> Option<SessionBinding> {
        self.campaigns.write().await.get_mut(&id).and_then(|c| c.session.take())
    }

    pub async fn finish_if_exhausted(&self, id: CampaignId) {
        if let Some(c) = self.campaigns.write().await.get_mut(&id) {
            c.finish_if_exhausted();
        }
    }

    pub async fn halt(&self, id: CampaignId) {
        if let Some(c) = self.campaigns.write().await.get_mut(&id) {
            c.halt();
        }
    }

    pub async fn end_loop(&self, id: CampaignId) -> Option<LoopEnd> {
        self.campaigns.write().await.get_mut(&id).map(Campaign::end_loop)
    }

    pub async fn attach(&self, id: CampaignId, observer: ObserverHandle) -> Result<(), CampaignError> {
        let mut campaigns = self.campaigns.write().await;
        let campaign = campaigns.get_mut(&id).ok_or(CampaignError::NotFound(id))?;
        campaign.observer = Some(observer);
        Ok(())
    }

    pub async fn observer(&self, id: CampaignId) -> Option<ObserverHandle> {
        self.campaigns.read().await.get(&id).and_then(|c| c.observer.clone())
    }

    /// 观察者断开后清除句柄
    pub async fn detach(&self, id: CampaignId) {
        if let Some(c) = self.campaigns.write().await.get_mut(&id) {
            c.observer = None;
        }
    }

    /// 是否仍有循环任务在跑
    pub async fn loop_active(&self, id: CampaignId) -> bool {
        self.campaigns.read().await.get(&id).map(|c| c.loop_active).unwrap_or(false)
    }

    pub async fn snapshot(&self, id: CampaignId) -> Option<CampaignSnapshot> {
        self.campaigns.read().await.get(&id).map(Campaign::snapshot)
    }

    pub async fn total(&self, id: CampaignId) -> Option<usize> {
        self.campaigns.read().await.get(&id).map(Campaign::total)
    }

    pub async fn recipients(&self, id: CampaignId) -> Option<Vec<Recipient>> {
        self.campaigns.read().await.get(&id).map(|c| c.recipients.clone())
    }

    /// 满足条件的最新活动（id 最大者）
    pub async fn latest_where(&self, pred: impl Fn(CampaignStatus) -> bool) -> Option<CampaignId> {
        self.campaigns
            .read()
            .await
            .values()
            .filter(|c| pred(c.status))
            .map(|c| c.id)
            .max()
    }

    /// 所有未进入终态的活动
    pub async fn live_ids(&self) -> Vec<CampaignId> {
        let mut ids: Vec<_> = self
            .campaigns
            .read()
            .await
            .values()
            .filter(|c| !c.status.is_terminal())
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    /// 外部清理：移除终态活动；核心自身从不调用
    pub async fn remove_terminal(&self, id: CampaignId) -> bool {
        let mut campaigns = self.campaigns.write().await;
        match campaigns.get(&id) {
            Some(c) if c.status.is_terminal() && !c.loop_active => campaigns.remove(&id).is_some(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient::new(&format!("98765432{:02}", i), "R", "hi", "91").unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_latest_wins() {
        let store = CampaignStore::new();
        let a = store.insert(recipients(1), CampaignOptions::default()).await;
        let b = store.insert(recipients(1), CampaignOptions::default()).await;
        assert_ne!(a, b);
        assert_eq!(store.latest_where(|s| s == CampaignStatus::Running).await, Some(b));

        store.apply(b, ControlAction::Stop).await.unwrap();
        assert_eq!(store.latest_where(|s| !s.is_terminal()).await, Some(a));
        assert_eq!(store.live_ids().await, vec![a]);
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_not_found() {
        let store = CampaignStore::new();
        let err = store.apply(CampaignId(42), ControlAction::Pause).await.unwrap_err();
        assert_eq!(err, CampaignError::NotFound(CampaignId(42)));
    }

    #[tokio::test]
    async fn test_remove_terminal_only() {
        let store = CampaignStore::new();
        let id = store.insert(recipients(1), CampaignOptions::default()).await;
        assert!(!store.remove_terminal(id).await);
        store.apply(id, ControlAction::Stop).await.unwrap();
        store.end_loop(id).await;
        assert!(store.remove_terminal(id).await);
        assert!(!store.contains(id).await);
    }
}
