//! 弹层处理：点掉「继续聊天」「在网页版使用」一类提示，识别「号码不可达」
//!
//! 只看按钮 / 链接的可见文本（小写后匹配）。

use std::time::Duration;

use tokio::time::Instant;

use crate::agent::surface::{PromptCandidate, Surface};

/// 文本分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// 可点击继续，附带原因标签
    Dismiss(&'static str),
    /// 收件人不可达，不应再尝试发送
    Unreachable,
}

/// 弹层处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterstitialOutcome {
    Handled(&'static str),
    Unreachable,
    /// 超时内未发现需要处理的弹层
    Clear,
}

pub fn classify_prompt(text: &str) -> Option<PromptKind> {
    let t = text.trim().to_lowercase();
    if t.is_empty() {
        return None;
    }
    if (t.contains("send message") && t.contains("not")) || t.contains("shared via url is invalid") {
        return Some(PromptKind::Unreachable);
    }
    if t.contains("continue") && t.contains("chat") {
        return Some(PromptKind::Dismiss("continue-chat"));
    }
    if t.contains("use whatsapp") || t.contains("open whatsapp") || t.contains("open in app") {
        return Some(PromptKind::Dismiss("use-whatsapp"));
    }
    None
}

fn first_match(candidates: &[PromptCandidate]) -> Option<(&PromptCandidate, PromptKind)> {
    candidates
        .iter()
        .find_map(|c| classify_prompt(&c.text).map(|k| (c, k)))
}

/// 在 timeout 内反复扫描弹层；点掉第一个可处理的即返回
pub async fn dismiss_interstitials(surface: &dyn Surface, timeout: Duration, poll: Duration) -> InterstitialOutcome {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match surface.prompts().await {
            Ok(candidates) => match first_match(&candidates) {
                Some((_, PromptKind::Unreachable)) => return InterstitialOutcome::Unreachable,
                Some((candidate, PromptKind::Dismiss(reason))) => {
                    match surface.press(&candidate.element).await {
                        Ok(()) => return InterstitialOutcome::Handled(reason),
                        Err(e) => tracing::debug!(error = %e, "interstitial click failed"),
                    }
                }
                None => {}
            },
            Err(e) => tracing::debug!(error = %e, "interstitial scan failed"),
        }
        tokio::time::sleep(poll).await;
    }
    InterstitialOutcome::Clear
}
