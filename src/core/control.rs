//! 控制面：请求 / 应答形式的操作员命令
//!
//! pause / resume / stop 作用于「当前可寻址」的活动（单活动假设）：
//! pause 找最新的 running，resume 找最新的 paused，stop 找最新的未结束活动。

use serde::{Deserialize, Serialize};

use crate::core::error::CampaignError;
use crate::core::orchestrator::Orchestrator;
use crate::core::recipient::Recipient;
use crate::core::state::{CampaignId, CampaignOptions, CampaignStatus};

const KNOWN_ACTIONS: [&str; 5] = [
    "startCampaign",
    "pauseCampaign",
    "resumeCampaign",
    "stopCampaign",
    "getActiveCampaign",
];

/// 控制请求中的收件人（号码尚未规范化）
#[derive(Debug, Clone, Deserialize)]
pub struct RecipientInput {
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
}

/// 控制请求（JSON 形如 `{"action": "pauseCampaign"}`）
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlRequest {
    StartCampaign {
        recipients: Vec<RecipientInput>,
        #[serde(default)]
        options: CampaignOptions,
    },
    PauseCampaign,
    ResumeCampaign,
    StopCampaign,
    GetActiveCampaign,
}

impl ControlRequest {
    /// 解析原始 JSON；缺少 action 或 action 未知时给出与协议一致的错误文本
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let action = match value.get("action").and_then(|a| a.as_str()) {
            Some(action) => action,
            None => return Err("no action".to_string()),
        };
        if !KNOWN_ACTIONS.contains(&action) {
            return Err("unknown action".to_string());
        }
        serde_json::from_value(value).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CampaignId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            id: None,
            error: None,
        }
    }

    pub fn with_id(id: CampaignId) -> Self {
        Self {
            ok: true,
            id: Some(id),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            id: None,
            error: Some(error.into()),
        }
    }
}

/// 控制面：把请求转成编排器调用
#[derive(Clone)]
pub struct ControlSurface {
    orchestrator: Orchestrator,
    country_code: String,
}

impl ControlSurface {
    pub fn new(orchestrator: Orchestrator, country_code: impl Into<String>) -> Self {
        Self {
            orchestrator,
            country_code: country_code.into(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// 处理原始 JSON 请求
    pub async fn handle_json(&self, raw: &str) -> ControlResponse {
        match ControlRequest::parse(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => ControlResponse::err(e),
        }
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::StartCampaign { recipients, options } => self.start(recipients, options).await,
            ControlRequest::PauseCampaign => self.pause().await,
            ControlRequest::ResumeCampaign => self.resume().await,
            ControlRequest::StopCampaign => self.stop().await,
            ControlRequest::GetActiveCampaign => match self.orchestrator.active_campaign().await {
                Some(id) => ControlResponse::with_id(id),
                None => ControlResponse::err("no active campaign"),
            },
        }
    }

    /// 规范化号码后启动；无效号码丢弃并记录警告
    pub async fn start(&self, recipients: Vec<RecipientInput>, options: CampaignOptions) -> ControlResponse {
        let mut valid = Vec::with_capacity(recipients.len());
        for input in recipients {
            match Recipient::new(&input.phone, input.name, input.message, &self.country_code) {
                Ok(r) => valid.push(r),
                Err(e) => tracing::warn!(error = %e, "dropping recipient"),
            }
        }
        match self.orchestrator.create(valid, options).await {
            Ok(id) => ControlResponse::with_id(id),
            Err(e) => ControlResponse::err(e.to_string()),
        }
    }

    pub async fn pause(&self) -> ControlResponse {
        let store = self.orchestrator.store();
        match store.latest_where(|s| s == CampaignStatus::Running).await {
            Some(id) => respond(self.orchestrator.pause(id).await),
            None => ControlResponse::err("no running campaign"),
        }
    }

    pub async fn resume(&self) -> ControlResponse {
        let store = self.orchestrator.store();
        match store.latest_where(|s| s == CampaignStatus::Paused).await {
            Some(id) => respond(self.orchestrator.resume(id).await),
            None => ControlResponse::err("no paused campaign"),
        }
    }

    pub async fn stop(&self) -> ControlResponse {
        match self.orchestrator.active_campaign().await {
            Some(id) => respond(self.orchestrator.stop(id).await),
            None => ControlResponse::err("no running campaign"),
        }
    }
}

fn respond(result: Result<(), CampaignError>) -> ControlResponse {
    match result {
        Ok(()) => ControlResponse::ok(),
        Err(e) => ControlResponse::err(e.to_string()),
    }
}
