//! Session Manager：会话的复用 / 发现 / 创建策略与回收责任
//!
//! 同一时间假定只有一个活动使用某个会话；owned 会话只在活动终态时关闭，从不在循环中途回收。

use std::sync::Arc;

use crate::agent::Surface;
use crate::config::SessionSection;
use crate::core::error::CampaignError;
use crate::session::{SessionBackend, SessionBinding, SessionError, SessionInfo};

/// 导航结果；超时与失败都不会中断循环
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    Loaded,
    TimedOut,
    Failed(String),
}

/// 单个收件人的目标地址：服务 origin + 规范化号码 + 百分号编码后的消息
pub fn target_url(origin: &str, phone: &str, message: &str) -> String {
    format!(
        "{}/send?phone={}&text={}",
        origin.trim_end_matches('/'),
        phone,
        urlencoding::encode(message)
    )
}

pub struct SessionManager {
    backend: Arc<dyn SessionBackend>,
    settings: SessionSection,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn SessionBackend>, settings: SessionSection) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &SessionSection {
        &self.settings
    }

    /// 确保有一个可用会话
    ///
    /// 已绑定且存活则直接复用；否则按 origin 发现（优先前台会话，不归本活动所有）；
    /// 都没有时新建一个（归本活动所有），并在首次使用前等待片刻。
    pub async fn ensure(&self, current: Option<SessionBinding>) -> Result<SessionBinding, CampaignError> {
        if let Some(binding) = current {
            if self.backend.probe(&binding.id).await {
                return Ok(binding);
            }
            tracing::info!(session = %binding.id, "bound session is gone, rediscovering");
        }

        let origin = self.settings.service_origin.as_str();
        match self.backend.discover(origin).await {
            Ok(found) => {
                if let Some(info) = pick(&found) {
                    tracing::debug!(session = %info.id, focused = info.focused, "reusing existing session");
                    return Ok(SessionBinding {
                        id: info.id.clone(),
                        owned: false,
                    });
                }
            }
            Err(e) => tracing::warn!(error = %e, "session discovery failed"),
        }

        let info = self
            .backend
            .create(origin)
            .await
            .map_err(|e| CampaignError::SessionUnavailable(e.to_string()))?;
        tracing::info!(session = %info.id, "created new session");
        tokio::time::sleep(self.settings.create_settle()).await;
        Ok(SessionBinding {
            id: info.id,
            owned: true,
        })
    }

    /// 导航到 target 并等待加载完成，最多 navigation_timeout；从不返回错误
    pub async fn navigate(&self, id: &str, target: &str) -> NavigationOutcome {
        if self.settings.focus_on_navigate {
            self.focus(id).await;
        }
        if let Err(e) = self.backend.navigate(id, target).await {
            tracing::warn!(session = %id, error = %e, "navigation failed, continuing");
            return NavigationOutcome::Failed(e.to_string());
        }
        let limit = self.settings.navigation_timeout();
        match tokio::time::timeout(limit, self.backend.wait_loaded(id)).await {
            Ok(Ok(())) => NavigationOutcome::Loaded,
            Ok(Err(e)) => {
                tracing::warn!(session = %id, error = %e, "load wait failed, continuing");
                NavigationOutcome::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(session = %id, "{}", CampaignError::NavigationTimeout(limit));
                NavigationOutcome::TimedOut
            }
        }
    }

    /// 切到前台（尽力而为）
    pub async fn focus(&self, id: &str) {
        if let Err(e) = self.backend.focus(id).await {
            tracing::debug!(session = %id, error = %e, "focus failed");
        }
    }

    /// 会话已消失时返回 SessionLost，由调用方重新发现
    pub async fn surface(&self, id: &str) -> Result<Arc<dyn Surface>, CampaignError> {
        self.backend.surface(id).await.map_err(|e| match e {
            SessionError::Gone(_) => CampaignError::SessionLost(e.to_string()),
            other => CampaignError::SessionUnavailable(other.to_string()),
        })
    }

    /// 回收 owned 会话；非 owned 的会话保持原样
    pub async fn teardown(&self, binding: &SessionBinding) {
        if !binding.owned {
            return;
        }
        match self.backend.close(&binding.id).await {
            Ok(()) => tracing::info!(session = %binding.id, "owned session closed"),
            Err(e) => tracing::warn!(session = %binding.id, error = %e, "failed to close owned session"),
        }
    }
}

/// 优先前台会话，否则第一个匹配
fn pick(found: &[SessionInfo]) -> Option<&SessionInfo> {
    found.iter().find(|s| s.focused).or_else(|| found.first())
}
