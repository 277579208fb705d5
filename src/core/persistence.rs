//! 活动快照持久化
//!
//! 每处理完一位收件人（以及每次控制命令后）把 `{id, index, status, total}` 写入 JSON 文件，
//! 仅供外部检查；核心从不回读，也不据此恢复。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::core::state::{CampaignId, CampaignSnapshot};

/// 快照输出端（在活动任务上调用，不能阻塞）
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn persist(&self, snapshot: &CampaignSnapshot) -> anyhow::Result<()>;
}

/// 目录下每个活动一个 JSON 文件：`wabulk_campaign_<id>.json`
#[derive(Debug)]
pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, id: CampaignId) -> PathBuf {
        self.dir.join(format!("wabulk_campaign_{}.json", id))
    }
}

#[async_trait]
impl SnapshotSink for JsonSnapshotStore {
    /// 写入快照；目录不存在时自动创建
    async fn persist(&self, snapshot: &CampaignSnapshot) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_string_pretty(snapshot)?;
        fs::write(self.path_for(snapshot.id), body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::CampaignStatus;

    #[tokio::test]
    async fn test_snapshot_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("nested"));
        let snap = CampaignSnapshot {
            id: CampaignId(7),
            index: 2,
            status: CampaignStatus::Running,
            total: 5,
            sent: 2,
            failed: 0,
            updated_at: 0,
        };
        store.persist(&snap).await.unwrap();

        let data = fs::read_to_string(store.path_for(CampaignId(7))).await.unwrap();
        let back: CampaignSnapshot = serde_json::from_str(&data).unwrap();
        assert_eq!(back, snap);
        assert!(data.contains("\"status\": \"running\""));

        // 再次写入覆盖同一文件
        let later = CampaignSnapshot { index: 3, ..snap };
        store.persist(&later).await.unwrap();
        let data = fs::read_to_string(store.path_for(CampaignId(7))).await.unwrap();
        assert_eq!(serde_json::from_str::<CampaignSnapshot>(&data).unwrap().index, 3);
    }
}
