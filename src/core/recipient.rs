//! 收件人与号码规范化
//!
//! 号码只保留数字：10 位补国家码；11–15 位原样使用；超过 15 位取末 10 位并补国家码；不足 10 位视为无效。

use serde::{Deserialize, Serialize};

use crate::core::error::CampaignError;

/// 收件人投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// 单个收件人（号码已规范化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub phone: String,
    pub name: String,
    /// 收件人自带的消息；活动模板存在时被模板取代
    #[serde(default)]
    pub message: String,
    #[serde(default = "pending")]
    pub status: DeliveryStatus,
    /// 最近一次失败原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn pending() -> DeliveryStatus {
    DeliveryStatus::Pending
}

impl Recipient {
    /// 规范化号码并创建收件人；号码无效时返回 InvalidPhone
    pub fn new(
        raw_phone: &str,
        name: impl Into<String>,
        message: impl Into<String>,
        country_code: &str,
    ) -> Result<Self, CampaignError> {
        let phone = canonicalize_phone(raw_phone, country_code)
            .ok_or_else(|| CampaignError::InvalidPhone(raw_phone.to_string()))?;
        Ok(Self {
            phone,
            name: name.into(),
            message: message.into(),
            status: DeliveryStatus::Pending,
            error: None,
        })
    }
}

/// 号码规范化；不足 10 位返回 None（由上游丢弃）
pub fn canonicalize_phone(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        0..=9 => None,
        10 => Some(format!("{}{}", country_code, digits)),
        11..=15 => Some(digits),
        n => Some(format!("{}{}", country_code, &digits[n - 10..])),
    }
}
