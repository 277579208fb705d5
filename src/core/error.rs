//! 活动（Campaign）错误类型与处置方式
//!
//! 只有 SessionUnavailable 会终止整个活动；其余错误要么只影响当前收件人，要么仅记录日志后继续。

use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::core::state::{CampaignId, CampaignStatus, ControlAction};

/// 活动层面的错误（会话、导航、握手、控制命令）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CampaignError {
    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    /// 绑定的会话在使用途中消失
    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Navigation did not complete within {0:?}")]
    NavigationTimeout(Duration),

    #[error("Delivery agent not confirmed after {rounds} handshake rounds")]
    HandshakeExhausted { rounds: u32 },

    #[error("Campaign {0} not found")]
    NotFound(CampaignId),

    #[error("Cannot {action} campaign {id} while {status}")]
    InvalidTransition {
        id: CampaignId,
        status: CampaignStatus,
        action: ControlAction,
    },

    #[error("No recipients")]
    NoRecipients,

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// 单个收件人的投递失败原因（记录在该收件人上，循环继续）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Recipient not reachable (interstitial)")]
    RecipientUnreachable,

    #[error("Cannot find compose box")]
    CannotFindInput,

    #[error("Message not observed in chat after send")]
    VerificationTimeout,

    #[error("aborted")]
    Aborted,

    #[error("Delivery call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("Surface error: {0}")]
    Surface(String),
}

impl Serialize for DeliveryError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 错误对活动的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 终止活动（状态转为终态，并通过 error 事件上报）
    HaltCampaign,
    /// 记录到当前收件人，继续下一位
    FailRecipient,
    /// 解除会话绑定，重新发现后重试当前收件人
    Rediscover,
    /// 仅记录日志，尽力继续当前发送
    Proceed,
    /// 控制命令被拒绝，活动本身不受影响
    Reject,
}

impl CampaignError {
    pub fn disposition(&self) -> Disposition {
        match self {
            CampaignError::SessionUnavailable(_) => Disposition::HaltCampaign,
            CampaignError::SessionLost(_) => Disposition::Rediscover,
            CampaignError::NavigationTimeout(_) | CampaignError::HandshakeExhausted { .. } => {
                Disposition::Proceed
            }
            CampaignError::Delivery(_) => Disposition::FailRecipient,
            CampaignError::NotFound(_)
            | CampaignError::InvalidTransition { .. }
            | CampaignError::NoRecipients
            | CampaignError::InvalidPhone(_) => Disposition::Reject,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::HaltCampaign
    }
}
