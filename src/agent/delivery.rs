//! Delivery Agent 协议：填充 → 发送 → 观察确认
//!
//! 发送动作没有可靠的同步确认，因此以「消息出现在发出记录中」作为投递成功的依据。
//! 每一步都有时间预算；stop 通过 CancellationToken 在校验轮询中被观察到。

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::interstitial::{dismiss_interstitials, InterstitialOutcome};
use crate::agent::surface::{ElementRef, Surface, TranscriptEntry};
use crate::agent::wait::wait_for;
use crate::config::DeliverySection;
use crate::core::error::DeliveryError;
use crate::core::state::CampaignId;

/// 一次投递请求
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub phone: String,
    pub name: String,
    pub message: String,
    pub campaign_id: CampaignId,
}

/// 投递结果与诊断轨迹
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub success: bool,
    /// 校验成功时的尝试序号（从 1 开始）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
    /// 按顺序记录的步骤标签
    pub steps: Vec<String>,
}

impl DeliveryReport {
    pub fn sent(attempt: u32, steps: Vec<String>) -> Self {
        Self {
            success: true,
            attempt: Some(attempt),
            error: None,
            steps,
        }
    }

    pub fn failed(error: DeliveryError, steps: Vec<String>) -> Self {
        Self {
            success: false,
            attempt: None,
            error: Some(error),
            steps,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.error == Some(DeliveryError::Aborted)
    }
}

/// abort 的确认
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AbortAck {
    pub ok: bool,
    pub aborted: bool,
}

enum VerifyOutcome {
    Verified,
    TimedOut,
    Aborted,
}

/// 投递协议执行者（无状态，参数来自 [delivery] 配置段）
#[derive(Debug, Clone, Default)]
pub struct DeliveryAgent {
    settings: DeliverySection,
}

impl DeliveryAgent {
    pub fn new(settings: DeliverySection) -> Self {
        Self { settings }
    }

    /// 探活：within 内收到肯定回复才算存活
    pub async fn ping(&self, surface: &dyn Surface, within: Duration) -> bool {
        match tokio::time::timeout(within, surface.ping()).await {
            Ok(Ok(alive)) => alive,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "agent ping failed");
                false
            }
            Err(_) => {
                tracing::debug!("agent ping timed out");
                false
            }
        }
    }

    /// 记录取消标记（尽力而为），返回确认
    pub fn abort(&self, cancel: &CancellationToken) -> AbortAck {
        cancel.cancel();
        AbortAck {
            ok: true,
            aborted: true,
        }
    }

    /// 完整的填充 / 发送 / 校验流程
    pub async fn verify_and_send(
        &self,
        surface: &dyn Surface,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let s = &self.settings;
        let mut steps = Vec::new();

        if cancel.is_cancelled() {
            steps.push("aborted-before-start".to_string());
            return DeliveryReport::failed(DeliveryError::Aborted, steps);
        }

        match dismiss_interstitials(surface, s.interstitial_timeout(), s.interstitial_poll()).await {
            InterstitialOutcome::Unreachable => {
                steps.push("interstitial-unreachable".to_string());
                return DeliveryReport::failed(DeliveryError::RecipientUnreachable, steps);
            }
            InterstitialOutcome::Handled(reason) => steps.push(format!("interstitial-handled:{}", reason)),
            InterstitialOutcome::Clear => {}
        }

        let input = match self.locate_input(surface).await {
            Some(input) => {
                steps.push("compose-box-found".to_string());
                input
            }
            None => return DeliveryReport::failed(DeliveryError::CannotFindInput, steps),
        };

        let segments: Vec<&str> = request.message.split('\n').collect();
        let mut last_err = DeliveryError::VerificationTimeout;

        for attempt in 1..=s.max_attempts.max(1) {
            match surface.fill(&input, &segments).await {
                Ok(()) => steps.push(format!("message-filled-attempt-{}", attempt)),
                Err(e) => {
                    tracing::debug!(campaign_id = %request.campaign_id, attempt, error = %e, "fill failed");
                    steps.push(format!("message-fill-failed-attempt-{}", attempt));
                    last_err = DeliveryError::Surface(e.to_string());
                    tokio::time::sleep(s.fill_retry()).await;
                    continue;
                }
            }
            tokio::time::sleep(s.settle()).await;

            self.trigger_send(surface, &input, attempt, &mut steps).await;

            match self.verify(surface, &request.message, cancel).await {
                VerifyOutcome::Verified => {
                    steps.push(format!("verified-attempt-{}", attempt));
                    tracing::debug!(campaign_id = %request.campaign_id, attempt, "delivery verified");
                    return DeliveryReport::sent(attempt, steps);
                }
                VerifyOutcome::Aborted => {
                    steps.push(format!("aborted-attempt-{}", attempt));
                    return DeliveryReport::failed(DeliveryError::Aborted, steps);
                }
                VerifyOutcome::TimedOut => {
                    steps.push(format!("verify-timeout-attempt-{}", attempt));
                    last_err = DeliveryError::VerificationTimeout;
                    tokio::time::sleep(s.retry_backoff(attempt)).await;
                }
            }
        }

        DeliveryReport::failed(last_err, steps)
    }

    /// 等待输入区出现：以页面变化通知为节拍
    async fn locate_input(&self, surface: &dyn Surface) -> Option<ElementRef> {
        let selectors = self.settings.compose_selectors.as_slice();
        wait_for(
            self.settings.input_timeout(),
            || async move { surface.query_first(selectors).await.ok().flatten() },
            |remaining| async move {
                let _ = surface.changed(remaining).await;
            },
        )
        .await
    }

    /// 优先点击发送按钮，找不到或点击失败时派发 Enter
    async fn trigger_send(&self, surface: &dyn Surface, input: &ElementRef, attempt: u32, steps: &mut Vec<String>) {
        let control = surface
            .query_first(&self.settings.send_selectors)
            .await
            .ok()
            .flatten();
        if let Some(control) = control {
            match surface.press(&control).await {
                Ok(()) => {
                    steps.push(format!("send-clicked-attempt-{}", attempt));
                    return;
                }
                Err(e) => tracing::debug!(attempt, error = %e, "send click failed, falling back to Enter"),
            }
        }
        match surface.press_enter(input).await {
            Ok(()) => steps.push(format!("enter-dispatched-attempt-{}", attempt)),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Enter dispatch failed");
                steps.push(format!("enter-failed-attempt-{}", attempt));
            }
        }
    }

    /// 轮询发出记录；每轮检查取消标记，取消时立即返回
    async fn verify(&self, surface: &dyn Surface, message: &str, cancel: &CancellationToken) -> VerifyOutcome {
        let s = &self.settings;
        let deadline = tokio::time::Instant::now() + s.verify_timeout();
        loop {
            if cancel.is_cancelled() {
                return VerifyOutcome::Aborted;
            }
            if let Ok(entries) = surface.transcript(&s.transcript_selectors, &s.outgoing_markers).await {
                if entries.iter().any(|e| matches_outgoing(e, message)) {
                    return VerifyOutcome::Verified;
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return VerifyOutcome::TimedOut;
            }
            let pause = s.verify_poll().min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return VerifyOutcome::Aborted,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

/// 发出的记录，且文本等于或包含所发消息
pub fn matches_outgoing(entry: &TranscriptEntry, message: &str) -> bool {
    if !entry.outgoing {
        return false;
    }
    let text = entry.text.trim();
    let message = message.trim();
    !text.is_empty() && !message.is_empty() && (text == message || text.contains(message))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::mock::MockSurface;

    fn fast() -> DeliverySection {
        DeliverySection {
            interstitial_timeout_ms: 10,
            interstitial_poll_ms: 2,
            input_timeout_ms: 30,
            settle_ms: 1,
            fill_retry_ms: 1,
            verify_timeout_ms: 40,
            verify_poll_ms: 2,
            retry_backoff_base_ms: 1,
            retry_backoff_step_ms: 1,
            ..DeliverySection::default()
        }
    }

    fn request(message: &str) -> DeliveryRequest {
        DeliveryRequest {
            phone: "919876543210".into(),
            name: "Amy".into(),
            message: message.into(),
            campaign_id: CampaignId(1),
        }
    }

    #[test]
    fn test_matches_outgoing_only() {
        let out = TranscriptEntry { text: "Hello Amy".into(), outgoing: true };
        let incoming = TranscriptEntry { text: "Hello Amy".into(), outgoing: false };
        assert!(matches_outgoing(&out, "Hello Amy"));
        assert!(matches_outgoing(&out, "Amy"));
        assert!(!matches_outgoing(&incoming, "Hello Amy"));
        assert!(!matches_outgoing(&out, "Bye"));
    }

    #[tokio::test]
    async fn test_sent_and_verified_first_attempt() {
        let surface = MockSurface::whatsapp();
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("Hi Amy"), &CancellationToken::new())
            .await;
        assert!(report.success, "{:?}", report);
        assert_eq!(report.attempt, Some(1));
        assert!(report.steps.contains(&"compose-box-found".to_string()));
        assert!(report.steps.contains(&"send-clicked-attempt-1".to_string()));
    }

    #[tokio::test]
    async fn test_multiline_message_keeps_segments() {
        let surface = MockSurface::whatsapp();
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("line one\nline two"), &CancellationToken::new())
            .await;
        assert!(report.success);
        assert_eq!(surface.last_fill(), vec!["line one".to_string(), "line two".to_string()]);
    }

    #[tokio::test]
    async fn test_enter_fallback_without_send_control() {
        let surface = MockSurface::whatsapp();
        surface.remove_element(r#"[data-testid="send"]"#);
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("Hi"), &CancellationToken::new())
            .await;
        assert!(report.success);
        assert!(report.steps.contains(&"enter-dispatched-attempt-1".to_string()));
        assert_eq!(surface.enters(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_lost_send() {
        let surface = MockSurface::whatsapp();
        surface.drop_next_sends(1);
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("Hi"), &CancellationToken::new())
            .await;
        assert!(report.success);
        assert_eq!(report.attempt, Some(2));
        assert!(report.steps.contains(&"verify-timeout-attempt-1".to_string()));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_with_trace() {
        let surface = MockSurface::whatsapp();
        surface.swallow("never shows");
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("never shows"), &CancellationToken::new())
            .await;
        assert!(!report.success);
        assert_eq!(report.error, Some(DeliveryError::VerificationTimeout));
        assert_eq!(surface.sends(), 3);
        assert!(report.steps.contains(&"verify-timeout-attempt-3".to_string()));
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_sending() {
        let surface = MockSurface::blank();
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("Hi"), &CancellationToken::new())
            .await;
        assert_eq!(report.error, Some(DeliveryError::CannotFindInput));
        assert_eq!(surface.sends(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_interstitial_short_circuits() {
        let surface = MockSurface::whatsapp();
        surface.add_prompt("Phone number shared via url is invalid.");
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("Hi"), &CancellationToken::new())
            .await;
        assert_eq!(report.error, Some(DeliveryError::RecipientUnreachable));
        assert_eq!(surface.fills(), 0);
    }

    #[tokio::test]
    async fn test_dismissible_interstitial_clicked_through() {
        let surface = MockSurface::whatsapp();
        surface.add_prompt("Continue to Chat");
        let agent = DeliveryAgent::new(fast());
        let report = agent
            .verify_and_send(&surface, &request("Hi"), &CancellationToken::new())
            .await;
        assert!(report.success);
        assert_eq!(report.steps[0], "interstitial-handled:continue-chat");
    }

    #[tokio::test]
    async fn test_cancel_during_verification_aborts_promptly() {
        let surface = Arc::new(MockSurface::whatsapp());
        surface.swallow("stuck");
        let agent = DeliveryAgent::new(DeliverySection {
            verify_timeout_ms: 5_000,
            ..fast()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let report = agent.verify_and_send(surface.as_ref(), &request("stuck"), &cancel).await;
        assert!(report.is_aborted());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(surface.sends(), 1);
    }

    #[tokio::test]
    async fn test_ping_reports_liveness() {
        let agent = DeliveryAgent::default();
        let surface = MockSurface::whatsapp();
        assert!(agent.ping(&surface, Duration::from_millis(50)).await);
        surface.fail_pings(1);
        assert!(!agent.ping(&surface, Duration::from_millis(50)).await);
        surface.set_agent_alive(false);
        assert!(!agent.ping(&surface, Duration::from_millis(50)).await);
        assert_eq!(surface.pings(), 3);
    }

    #[test]
    fn test_abort_acknowledges_and_cancels() {
        let agent = DeliveryAgent::default();
        let token = CancellationToken::new();
        let ack = agent.abort(&token);
        assert!(ack.ok && ack.aborted);
        assert!(token.is_cancelled());
    }
}
