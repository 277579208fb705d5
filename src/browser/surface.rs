//! Chrome 标签页上的页面表面：通过 evaluate 调用注入的 agent
//!
//! headless_chrome 是同步 API，所有调用都放进 spawn_blocking。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::Tab;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::agent::{ElementRef, PromptCandidate, Surface, SurfaceError, TranscriptEntry};
use crate::browser::script::{agent_call, AGENT_JS, MISSING, STALE};

pub struct ChromeSurface {
    tab: Arc<Tab>,
}

impl ChromeSurface {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }

    async fn evaluate(&self, expression: String) -> Result<Option<Value>, SurfaceError> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || {
            tab.evaluate(&expression, true)
                .map(|obj| obj.value)
                .map_err(|e| SurfaceError::Script(e.to_string()))
        })
        .await
        .map_err(|e| SurfaceError::Script(format!("Task join: {}", e)))?
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, args: &[Value]) -> Result<T, SurfaceError> {
        let raw = self
            .evaluate(agent_call(method, args))
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| SurfaceError::Script(format!("{} returned nothing", method)))?;
        if raw == MISSING {
            return Err(SurfaceError::AgentMissing);
        }
        serde_json::from_str(&raw).map_err(|e| SurfaceError::Script(e.to_string()))
    }

    async fn act(&self, method: &str, element: &ElementRef, extra: Option<Value>) -> Result<(), SurfaceError> {
        let mut args = vec![json!(element.0)];
        args.extend(extra);
        let status: String = self.call(method, &args).await?;
        if status == STALE {
            return Err(SurfaceError::StaleElement(element.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Surface for ChromeSurface {
    async fn inject_agent(&self) -> Result<(), SurfaceError> {
        self.evaluate(AGENT_JS.to_string()).await.map(|_| ())
    }

    async fn ping(&self) -> Result<bool, SurfaceError> {
        self.call("ping", &[]).await
    }

    async fn prompts(&self) -> Result<Vec<PromptCandidate>, SurfaceError> {
        self.call("prompts", &[]).await
    }

    async fn query_first(&self, selectors: &[String]) -> Result<Option<ElementRef>, SurfaceError> {
        self.call("query", &[json!(selectors)]).await
    }

    async fn fill(&self, input: &ElementRef, segments: &[&str]) -> Result<(), SurfaceError> {
        self.act("fill", input, Some(json!(segments))).await
    }

    async fn press(&self, element: &ElementRef) -> Result<(), SurfaceError> {
        self.act("press", element, None).await
    }

    async fn press_enter(&self, input: &ElementRef) -> Result<(), SurfaceError> {
        self.act("enter", input, None).await
    }

    async fn transcript(
        &self,
        selectors: &[String],
        outgoing_markers: &[String],
    ) -> Result<Vec<TranscriptEntry>, SurfaceError> {
        self.call("transcript", &[json!(selectors), json!(outgoing_markers)]).await
    }

    async fn changed(&self, within: Duration) -> Result<bool, SurfaceError> {
        self.call("changed", &[json!(within.as_millis() as u64)]).await
    }
}
