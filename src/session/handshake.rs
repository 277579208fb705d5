//! 握手：确认会话内的 Delivery Agent 已加载且可响应
//!
//! 导航经常会销毁页面内的 agent，所以每次发送前都要探活；全部轮次失败后仍然尝试发送，
//! 失败由投递结果体现，不阻塞活动。

use crate::agent::{DeliveryAgent, Surface};
use crate::config::HandshakeSection;
use crate::core::error::CampaignError;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub confirmed: bool,
    /// 实际执行的探活轮数
    pub rounds: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Handshake {
    settings: HandshakeSection,
}

impl Handshake {
    pub fn new(settings: HandshakeSection) -> Self {
        Self { settings }
    }

    pub async fn run(
        &self,
        sessions: &SessionManager,
        agent: &DeliveryAgent,
        session_id: &str,
        surface: &dyn Surface,
    ) -> HandshakeOutcome {
        let s = &self.settings;
        for round in 1..=s.rounds {
            sessions.focus(session_id).await;
            if agent.ping(surface, s.probe_timeout()).await {
                return HandshakeOutcome {
                    confirmed: true,
                    rounds: round,
                };
            }
            tracing::debug!(round, "agent not confirmed, reinjecting");
            if let Err(e) = surface.inject_agent().await {
                tracing::debug!(round, error = %e, "agent injection failed");
            }
            tokio::time::sleep(s.backoff(round)).await;
        }

        tracing::warn!(session = %session_id, "{}; sending anyway", CampaignError::HandshakeExhausted { rounds: s.rounds });
        if let Err(e) = surface.inject_agent().await {
            tracing::debug!(error = %e, "final agent injection failed");
        }
        tokio::time::sleep(s.final_settle()).await;
        HandshakeOutcome {
            confirmed: false,
            rounds: s.rounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SessionSection;
    use crate::session::mock::{MockBackend, MockSurface};

    fn fast() -> HandshakeSection {
        HandshakeSection {
            rounds: 3,
            probe_timeout_ms: 20,
            backoff_base_ms: 1,
            backoff_step_ms: 1,
            final_settle_ms: 1,
        }
    }

    fn setup(surface: Arc<MockSurface>) -> (SessionManager, String) {
        let backend = Arc::new(MockBackend::new(surface));
        let id = backend.open_existing("https://web.whatsapp.com/", true);
        (SessionManager::new(backend, SessionSection::default()), id)
    }

    #[tokio::test]
    async fn test_live_agent_confirmed_first_round() {
        let surface = Arc::new(MockSurface::whatsapp());
        let (mgr, id) = setup(surface.clone());
        let outcome = Handshake::new(fast()).run(&mgr, &DeliveryAgent::default(), &id, surface.as_ref()).await;
        assert_eq!(outcome, HandshakeOutcome { confirmed: true, rounds: 1 });
        assert_eq!(surface.injections(), 0);
    }

    #[tokio::test]
    async fn test_missing_agent_reinjected_then_confirmed() {
        let surface = Arc::new(MockSurface::whatsapp());
        surface.set_agent_alive(false);
        let (mgr, id) = setup(surface.clone());
        let outcome = Handshake::new(fast()).run(&mgr, &DeliveryAgent::default(), &id, surface.as_ref()).await;
        assert_eq!(outcome, HandshakeOutcome { confirmed: true, rounds: 2 });
        assert_eq!(surface.injections(), 1);
    }

    #[tokio::test]
    async fn test_at_most_three_probes_then_proceeds() {
        let surface = Arc::new(MockSurface::whatsapp());
        surface.fail_pings(u32::MAX);
        let (mgr, id) = setup(surface.clone());
        let outcome = Handshake::new(fast()).run(&mgr, &DeliveryAgent::default(), &id, surface.as_ref()).await;
        assert!(!outcome.confirmed);
        assert_eq!(surface.pings(), 3);
        // 每轮一次 + 最后一次尽力注入
        assert_eq!(surface.injections(), 4);
    }
}
