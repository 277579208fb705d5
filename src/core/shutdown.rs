//! 优雅关闭：Ctrl+C / SIGTERM 时停止所有活动
//!
//! 收到信号后先停止所有未结束的活动（等同于操作员的 stop-all），
//! 再给循环任务一点时间发出最终状态、回收 owned 会话。

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::Orchestrator;

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或控制台 quit
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "shutdown requested");
        self.shutdown_token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping all campaigns...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping all campaigns...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 运行 app 直到其结束或收到关闭信号；信号触发时 stop-all，并在 grace 内等待收尾
pub async fn run_until_shutdown<F>(
    shutdown_manager: Arc<ShutdownManager>,
    orchestrator: Orchestrator,
    grace: std::time::Duration,
    app: F,
) where
    F: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
            return;
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let stopped = orchestrator.stop_all().await;
    tracing::info!("Stopped {} campaign(s)", stopped.len());

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if stopped_loops_done(&orchestrator, &stopped).await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

/// 被停止的活动都已不再有循环任务
async fn stopped_loops_done(orchestrator: &Orchestrator, ids: &[crate::core::state::CampaignId]) -> bool {
    for id in ids {
        if orchestrator.store().loop_active(*id).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::recipient::Recipient;
    use crate::core::state::CampaignOptions;
    use crate::session::mock::{MockBackend, MockSurface};

    #[tokio::test]
    async fn test_wait_for_shutdown_released_by_any_clone() {
        let manager = ShutdownManager::new();
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), manager.wait_for_shutdown()).await;
        assert!(waiting.is_err());

        manager.clone().shutdown(ShutdownReason::Signal);
        tokio::time::timeout(std::time::Duration::from_secs(1), manager.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_app_finishing_first_leaves_campaigns_running() {
        let surface = Arc::new(MockSurface::whatsapp());
        let mut cfg = AppConfig::default();
        cfg.persistence.enabled = false;
        cfg.campaign.default_delay_ms = 10_000;
        cfg.session.create_settle_ms = 1;
        cfg.delivery.settle_ms = 1;
        cfg.delivery.interstitial_timeout_ms = 10;
        let orch = Orchestrator::new(Arc::new(MockBackend::new(surface)), &cfg);
        let recipients = vec![
            Recipient::new("9876543210", "A", "one", "91").unwrap(),
            Recipient::new("9876543211", "B", "two", "91").unwrap(),
        ];
        let id = orch.create(recipients, CampaignOptions::default()).await.unwrap();

        run_until_shutdown(
            Arc::new(ShutdownManager::new()),
            orch.clone(),
            std::time::Duration::from_secs(1),
            async {},
        )
        .await;
        assert!(!orch.store().snapshot(id).await.unwrap().status.is_terminal());
        orch.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_campaigns() {
        let surface = Arc::new(MockSurface::whatsapp());
        let mut cfg = AppConfig::default();
        cfg.persistence.enabled = false;
        cfg.campaign.default_delay_ms = 10_000;
        cfg.session.create_settle_ms = 1;
        cfg.delivery.settle_ms = 1;
        cfg.delivery.interstitial_timeout_ms = 10;
        let orch = Orchestrator::new(Arc::new(MockBackend::new(surface)), &cfg);
        let recipients = vec![
            Recipient::new("9876543210", "A", "one", "91").unwrap(),
            Recipient::new("9876543211", "B", "two", "91").unwrap(),
        ];
        let id = orch.create(recipients, CampaignOptions::default()).await.unwrap();

        let manager = Arc::new(ShutdownManager::new());
        let trigger = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.shutdown(ShutdownReason::UserInitiated);
        });
        run_until_shutdown(
            manager,
            orch.clone(),
            std::time::Duration::from_secs(5),
            std::future::pending::<()>(),
        )
        .await;

        let snap = orch.store().snapshot(id).await.unwrap();
        assert!(snap.status.is_terminal());
        assert!(!orch.store().loop_active(id).await);
    }
}
