//! 进度事件与事件中继
//!
//! 事件优先发往活动绑定的观察者；未绑定或观察者已断开时，发往进程级广播（任何订阅者都能收到）。

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::agent::DeliveryReport;
use crate::core::recipient::Recipient;
use crate::core::state::{CampaignId, CampaignStatus};

/// 观察者句柄：由控制面板等外部组件持有接收端
pub type ObserverHandle = mpsc::UnboundedSender<CampaignEvent>;

/// 推送给观察者的事件（JSON 形如 `{"event": "progress", ...}`）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CampaignEvent {
    /// 循环任务启动（创建或 resume 重启）
    Started { id: CampaignId, total: usize },
    /// 一位收件人处理完毕
    Progress {
        id: CampaignId,
        index: usize,
        recipient: Recipient,
        result: DeliveryReport,
    },
    /// 最终状态
    Status { id: CampaignId, status: CampaignStatus },
    /// 致命错误
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<CampaignId>,
        error: String,
    },
    /// 提示信息（暂停、恢复、作废等）
    Info {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<CampaignId>,
        message: String,
    },
    /// attach 成功的确认
    Attached { id: CampaignId },
}

impl CampaignEvent {
    pub fn info(id: CampaignId, message: impl Into<String>) -> Self {
        CampaignEvent::Info {
            id: Some(id),
            message: message.into(),
        }
    }

    pub fn error(id: CampaignId, error: impl Into<String>) -> Self {
        CampaignEvent::Error {
            id: Some(id),
            error: error.into(),
        }
    }

    /// 是否为最终状态事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignEvent::Status { .. })
    }
}

/// 事件中继：观察者优先，广播兜底
#[derive(Debug, Clone)]
pub struct EventRelay {
    runtime: broadcast::Sender<CampaignEvent>,
}

/// 一次投递的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Observer,
    Runtime,
    /// 观察者已断开，已改走广播；调用方应清除该句柄
    ObserverGone,
}

impl EventRelay {
    pub fn new(capacity: usize) -> Self {
        let (runtime, _) = broadcast::channel(capacity.max(1));
        Self { runtime }
    }

    /// 订阅进程级广播
    pub fn subscribe(&self) -> broadcast::Receiver<CampaignEvent> {
        self.runtime.subscribe()
    }

    pub fn emit(&self, observer: Option<&ObserverHandle>, event: CampaignEvent) -> Delivered {
        let event = match observer {
            Some(handle) => match handle.send(event) {
                Ok(()) => return Delivered::Observer,
                Err(mpsc::error::SendError(event)) => {
                    let _ = self.runtime.send(event);
                    return Delivered::ObserverGone;
                }
            },
            None => event,
        };
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.runtime.send(event);
        Delivered::Runtime
    }
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new(256)
    }
}
