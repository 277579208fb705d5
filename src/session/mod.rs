//! 会话层：浏览器会话的发现 / 创建 / 导航，以及与 Delivery Agent 的握手
//!
//! 具体浏览器由 [`SessionBackend`] 抽象；真实实现见 browser 模块（feature "browser"），
//! 测试与演练使用 [`mock`]。

pub mod handshake;
pub mod manager;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::Surface;

pub use handshake::{Handshake, HandshakeOutcome};
pub use manager::{target_url, NavigationOutcome, SessionManager};

/// 会话 ID（浏览器标签页的标识）
pub type SessionId = String;

/// 后端报告的会话信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub url: String,
    /// 当前是否处于前台
    pub focused: bool,
}

/// 活动与会话的绑定；owned 表示由活动自己创建，终态时回收
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub id: SessionId,
    pub owned: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} no longer exists")]
    Gone(SessionId),

    #[error("Browser backend unavailable: {0}")]
    Backend(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),
}

/// 浏览器后端抽象
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// 会话是否仍然存在
    async fn probe(&self, id: &str) -> bool;

    /// 列出 URL 以 origin 开头的会话
    async fn discover(&self, origin: &str) -> Result<Vec<SessionInfo>, SessionError>;

    /// 新建会话并打开 url（不抢前台）
    async fn create(&self, url: &str) -> Result<SessionInfo, SessionError>;

    async fn close(&self, id: &str) -> Result<(), SessionError>;

    /// 把会话切到前台
    async fn focus(&self, id: &str) -> Result<(), SessionError>;

    /// 发起导航，不等待加载完成
    async fn navigate(&self, id: &str, url: &str) -> Result<(), SessionError>;

    /// 等待最近一次导航加载完成
    async fn wait_loaded(&self, id: &str) -> Result<(), SessionError>;

    /// 会话内的页面表面
    async fn surface(&self, id: &str) -> Result<Arc<dyn Surface>, SessionError>;
}
