//! Chrome 会话后端：标签页即会话
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 建议配置 browser.user_data_dir 指向已登录的用户目录，否则需要在新开的窗口中扫码登录。

pub mod script;
pub mod surface;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::agent::Surface;
use crate::config::BrowserSection;
use crate::session::{SessionBackend, SessionError, SessionInfo};

pub use surface::ChromeSurface;

pub struct ChromeBackend {
    browser: Browser,
}

impl ChromeBackend {
    /// 按 [browser] 配置启动 Chrome
    pub fn launch(settings: &BrowserSection) -> Result<Self, SessionError> {
        let options = LaunchOptions::default_builder()
            .headless(settings.headless)
            .user_data_dir(settings.user_data_dir.clone())
            .idle_browser_timeout(Duration::from_secs(settings.idle_timeout_secs))
            .build()
            .map_err(|e| SessionError::Backend(format!("Launch options: {}", e)))?;
        let browser = Browser::new(options).map_err(|e| SessionError::Backend(format!("Chrome launch failed: {}", e)))?;
        tracing::info!(headless = settings.headless, "Chrome launched");
        Ok(Self { browser })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(Browser) -> Result<T, SessionError> + Send + 'static,
    {
        let browser = self.browser.clone();
        tokio::task::spawn_blocking(move || f(browser))
            .await
            .map_err(|e| SessionError::Backend(format!("Task join: {}", e)))?
    }
}

fn tabs(browser: &Browser) -> Result<Vec<Arc<Tab>>, SessionError> {
    browser
        .get_tabs()
        .lock()
        .map(|tabs| tabs.clone())
        .map_err(|e| SessionError::Backend(e.to_string()))
}

fn find_tab(browser: &Browser, id: &str) -> Result<Arc<Tab>, SessionError> {
    tabs(browser)?
        .into_iter()
        .find(|t| t.get_target_id().as_str() == id)
        .ok_or_else(|| SessionError::Gone(id.to_string()))
}

fn has_focus(tab: &Tab) -> bool {
    tab.evaluate("document.visibilityState === 'visible' && document.hasFocus()", false)
        .ok()
        .and_then(|o| o.value)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

#[async_trait]
impl SessionBackend for ChromeBackend {
    async fn probe(&self, id: &str) -> bool {
        let id = id.to_string();
        self.blocking(move |b| find_tab(&b, &id).map(|_| ())).await.is_ok()
    }

    async fn discover(&self, origin: &str) -> Result<Vec<SessionInfo>, SessionError> {
        let origin = origin.to_string();
        self.blocking(move |b| {
            Ok(tabs(&b)?
                .iter()
                .filter(|t| t.get_url().starts_with(&origin))
                .map(|t| SessionInfo {
                    id: t.get_target_id().to_string(),
                    url: t.get_url(),
                    focused: has_focus(t),
                })
                .collect())
        })
        .await
    }

    async fn create(&self, url: &str) -> Result<SessionInfo, SessionError> {
        let url = url.to_string();
        self.blocking(move |b| {
            let tab = b
                .new_tab()
                .map_err(|e| SessionError::Backend(format!("Browser tab failed: {}", e)))?;
            tab.navigate_to(&url)
                .map_err(|e| SessionError::Navigation(e.to_string()))?;
            Ok(SessionInfo {
                id: tab.get_target_id().to_string(),
                url,
                focused: false,
            })
        })
        .await
    }

    async fn close(&self, id: &str) -> Result<(), SessionError> {
        let id = id.to_string();
        self.blocking(move |b| {
            find_tab(&b, &id)?
                .close(true)
                .map(|_| ())
                .map_err(|e| SessionError::Backend(e.to_string()))
        })
        .await
    }

    async fn focus(&self, id: &str) -> Result<(), SessionError> {
        let id = id.to_string();
        self.blocking(move |b| {
            find_tab(&b, &id)?
                .activate()
                .map(|_| ())
                .map_err(|e| SessionError::Backend(e.to_string()))
        })
        .await
    }

    async fn navigate(&self, id: &str, url: &str) -> Result<(), SessionError> {
        let (id, url) = (id.to_string(), url.to_string());
        self.blocking(move |b| {
            find_tab(&b, &id)?
                .navigate_to(&url)
                .map(|_| ())
                .map_err(|e| SessionError::Navigation(e.to_string()))
        })
        .await
    }

    async fn wait_loaded(&self, id: &str) -> Result<(), SessionError> {
        let id = id.to_string();
        self.blocking(move |b| {
            find_tab(&b, &id)?
                .wait_until_navigated()
                .map(|_| ())
                .map_err(|e| SessionError::Navigation(e.to_string()))
        })
        .await
    }

    async fn surface(&self, id: &str) -> Result<Arc<dyn Surface>, SessionError> {
        let id = id.to_string();
        let tab = self.blocking(move |b| find_tab(&b, &id)).await?;
        Ok(Arc::new(ChromeSurface::new(tab)))
    }
}
