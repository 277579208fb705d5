//! 活动端到端集成测试（内存模拟会话后端）

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use wabulk::config::AppConfig;
    use wabulk::core::{
        CampaignEvent, CampaignOptions, CampaignStatus, ControlSurface, DeliveryStatus,
        JsonSnapshotStore, Orchestrator, Recipient, SnapshotSink,
    };
    use wabulk::session::mock::{MockBackend, MockSurface};

    fn fast_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.campaign.default_delay_ms = 1;
        cfg.campaign.pause_poll_ms = 5;
        cfg.session.create_settle_ms = 1;
        cfg.session.navigation_timeout_ms = 50;
        cfg.handshake.probe_timeout_ms = 20;
        cfg.handshake.backoff_base_ms = 1;
        cfg.handshake.backoff_step_ms = 1;
        cfg.handshake.final_settle_ms = 1;
        cfg.delivery.interstitial_timeout_ms = 5;
        cfg.delivery.interstitial_poll_ms = 1;
        cfg.delivery.input_timeout_ms = 20;
        cfg.delivery.settle_ms = 1;
        cfg.delivery.fill_retry_ms = 1;
        cfg.delivery.verify_timeout_ms = 30;
        cfg.delivery.verify_poll_ms = 2;
        cfg.delivery.retry_backoff_base_ms = 1;
        cfg.delivery.retry_backoff_step_ms = 1;
        cfg.persistence.enabled = false;
        cfg
    }

    fn recipients(messages: &[&str]) -> Vec<Recipient> {
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| Recipient::new(&format!("98765432{:02}", i), format!("R{}", i), *m, "91").unwrap())
            .collect()
    }

    fn setup(cfg: &AppConfig) -> (Arc<MockBackend>, Arc<MockSurface>, Orchestrator) {
        let surface = Arc::new(MockSurface::whatsapp());
        let backend = Arc::new(MockBackend::new(surface.clone()));
        let orch = Orchestrator::new(backend.clone(), cfg);
        (backend, surface, orch)
    }

    /// 收集事件直到该活动的最终状态
    async fn collect_until_status(rx: &mut mpsc::UnboundedReceiver<CampaignEvent>) -> Vec<CampaignEvent> {
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(ev)) => {
                    let done = ev.is_terminal();
                    events.push(ev);
                    if done {
                        return events;
                    }
                }
                other => panic!("campaign did not reach a final status: {:?} after {:?}", other, events),
            }
        }
    }

    fn progress_indices(events: &[CampaignEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                CampaignEvent::Progress { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    fn final_status(events: &[CampaignEvent]) -> Option<CampaignStatus> {
        events.iter().rev().find_map(|e| match e {
            CampaignEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_two_verified_one_never_observed() {
        let (_backend, surface, orch) = setup(&fast_config());
        surface.swallow("third");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["first", "second", "third"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();

        let events = collect_until_status(&mut rx).await;
        assert!(matches!(events[0], CampaignEvent::Attached { .. }));
        assert!(matches!(events[1], CampaignEvent::Started { total: 3, .. }));
        assert_eq!(progress_indices(&events), vec![0, 1, 2]);
        assert_eq!(final_status(&events), Some(CampaignStatus::Finished));

        let snap = orch.store().snapshot(id).await.unwrap();
        assert_eq!((snap.index, snap.total, snap.sent, snap.failed), (3, 3, 2, 1));

        let last = events
            .iter()
            .find_map(|e| match e {
                CampaignEvent::Progress { index: 2, result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert!(!last.success);
        assert!(last.steps.contains(&"verify-timeout-attempt-3".to_string()));
        assert_eq!(surface.delivered(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_template_rendered_per_recipient() {
        let (backend, surface, orch) = setup(&fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = CampaignOptions {
            template: Some("Hi {name}, #{phone}".to_string()),
            ..CampaignOptions::default()
        };
        orch.create_attached(recipients(&["ignored"]), options, Some(tx))
            .await
            .unwrap();
        collect_until_status(&mut rx).await;

        assert_eq!(surface.delivered(), vec!["Hi R0, #919876543200".to_string()]);
        let nav = &backend.navigations()[0];
        assert!(nav.starts_with("https://web.whatsapp.com/send?phone=919876543200&text="));
        assert!(nav.ends_with("Hi%20R0%2C%20%23919876543200"));
    }

    #[tokio::test]
    async fn test_pause_then_resume_keeps_index() {
        let mut cfg = fast_config();
        cfg.campaign.default_delay_ms = 80;
        let (_backend, _surface, orch) = setup(&cfg);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["a", "b", "c"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
            let first_progress = matches!(ev, CampaignEvent::Progress { index: 0, .. });
            seen.push(ev);
            if first_progress {
                break;
            }
        }
        orch.pause(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let paused = orch.store().snapshot(id).await.unwrap();
        assert_eq!(paused.status, CampaignStatus::Paused);
        assert_eq!(paused.index, 1);

        orch.resume(id).await.unwrap();
        seen.extend(collect_until_status(&mut rx).await);
        assert_eq!(progress_indices(&seen), vec![0, 1, 2]);
        assert_eq!(final_status(&seen), Some(CampaignStatus::Finished));
        assert!(seen.iter().any(|e| matches!(e, CampaignEvent::Info { message, .. } if message == "Paused by user")));
    }

    fn started_count(events: &[CampaignEvent]) -> usize {
        events.iter().filter(|e| matches!(e, CampaignEvent::Started { .. })).count()
    }

    fn saw_info(events: &[CampaignEvent], text: &str) -> bool {
        events
            .iter()
            .any(|e| matches!(e, CampaignEvent::Info { message, .. } if message == text))
    }

    /// 首条消息的第一次发送丢失，校验要等满 verify_timeout 才会重试
    fn in_flight_config() -> AppConfig {
        let mut cfg = fast_config();
        cfg.delivery.verify_timeout_ms = 300;
        cfg
    }

    #[tokio::test]
    async fn test_pause_during_delivery_discards_result_and_resumes_same_index() {
        let (_backend, surface, orch) = setup(&in_flight_config());
        surface.drop_next_sends(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["a", "b", "c"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();

        let watch = surface.clone();
        wait_until(move || watch.sends() >= 1).await;
        orch.pause(id).await.unwrap();

        // 投递返回后结果作废，循环停车
        let mut parked = false;
        for _ in 0..500 {
            if !orch.store().loop_active(id).await {
                parked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(parked);
        let snap = orch.store().snapshot(id).await.unwrap();
        assert_eq!((snap.index, snap.status), (0, CampaignStatus::Paused));
        let list = orch.store().recipients(id).await.unwrap();
        assert_eq!(list[0].status, DeliveryStatus::Pending);

        orch.resume(id).await.unwrap();
        let events = collect_until_status(&mut rx).await;

        assert!(saw_info(&events, "campaign invalidated, aborting"));
        assert_eq!(started_count(&events), 2);
        assert_eq!(progress_indices(&events), vec![0, 1, 2]);
        assert_eq!(final_status(&events), Some(CampaignStatus::Finished));
        let list = orch.store().recipients(id).await.unwrap();
        assert!(list.iter().all(|r| r.status == DeliveryStatus::Sent));
        let delivered = surface.delivered();
        for m in ["b", "c"] {
            assert_eq!(delivered.iter().filter(|d| *d == m).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume_during_delivery_relaunch_in_place() {
        let (_backend, surface, orch) = setup(&in_flight_config());
        surface.drop_next_sends(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["a", "b", "c"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();

        let watch = surface.clone();
        wait_until(move || watch.sends() >= 1).await;
        orch.pause(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        orch.resume(id).await.unwrap();
        // 循环仍在 await 投递，resume 不另起任务
        assert!(orch.store().loop_active(id).await);

        let events = collect_until_status(&mut rx).await;
        assert!(saw_info(&events, "Paused by user"));
        assert!(saw_info(&events, "Resumed by user"));
        assert!(saw_info(&events, "campaign invalidated, aborting"));
        assert_eq!(started_count(&events), 2);
        assert_eq!(progress_indices(&events), vec![0, 1, 2]);
        assert_eq!(final_status(&events), Some(CampaignStatus::Finished));

        let snap = orch.store().snapshot(id).await.unwrap();
        assert_eq!((snap.index, snap.total, snap.sent), (3, 3, 3));
    }

    #[tokio::test]
    async fn test_stop_during_verification_aborts_current_recipient() {
        let mut cfg = fast_config();
        cfg.delivery.verify_timeout_ms = 5_000;
        let (backend, surface, orch) = setup(&cfg);
        surface.swallow("stuck");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["stuck", "next", "last"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();

        let probe = surface.clone();
        wait_until(move || probe.sends() >= 1).await;
        orch.stop(id).await.unwrap();

        let events = collect_until_status(&mut rx).await;
        assert_eq!(final_status(&events), Some(CampaignStatus::Stopped));
        assert!(progress_indices(&events).is_empty());

        let list = orch.store().recipients(id).await.unwrap();
        assert_eq!(list[0].status, DeliveryStatus::Failed);
        assert_eq!(list[0].error.as_deref(), Some("aborted"));
        assert_eq!(list[1].status, DeliveryStatus::Pending);
        assert_eq!(list[2].status, DeliveryStatus::Pending);
        assert_eq!(surface.sends(), 1);
        assert_eq!(backend.navigations().len(), 1);
        assert_eq!(orch.store().snapshot(id).await.unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_existing_session_reused_and_left_open() {
        let (backend, _surface, orch) = setup(&fast_config());
        let tab = backend.open_existing("https://web.whatsapp.com/", true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        orch.create_attached(recipients(&["a", "b"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();
        collect_until_status(&mut rx).await;

        assert_eq!(backend.created(), 0);
        assert!(backend.closed().is_empty());
        assert!(backend.live_sessions().iter().any(|s| s.id == tab));
    }

    #[tokio::test]
    async fn test_agent_reinjected_after_each_navigation() {
        let (_backend, surface, orch) = setup(&fast_config());
        surface.set_reset_on_navigate(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["a", "b"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();
        let events = collect_until_status(&mut rx).await;

        assert_eq!(final_status(&events), Some(CampaignStatus::Finished));
        assert_eq!(orch.store().snapshot(id).await.unwrap().sent, 2);
        assert_eq!(surface.injections(), 2);
    }

    #[tokio::test]
    async fn test_session_unavailable_is_fatal() {
        let (backend, _surface, orch) = setup(&fast_config());
        backend.set_unavailable(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["a", "b"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();
        let events = collect_until_status(&mut rx).await;

        let error_at = events.iter().position(|e| matches!(e, CampaignEvent::Error { .. })).unwrap();
        let status_at = events.iter().position(|e| e.is_terminal()).unwrap();
        assert!(error_at < status_at);
        assert_eq!(final_status(&events), Some(CampaignStatus::Stopped));
        assert_eq!(orch.store().snapshot(id).await.unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_control_surface_addresses_active_campaign() {
        let mut cfg = fast_config();
        cfg.campaign.default_delay_ms = 5_000;
        let (_backend, _surface, orch) = setup(&cfg);
        let control = ControlSurface::new(orch.clone(), "91");
        let mut runtime = orch.subscribe();

        assert_eq!(control.pause().await.error.as_deref(), Some("no running campaign"));
        assert_eq!(control.resume().await.error.as_deref(), Some("no paused campaign"));
        assert_eq!(
            control.handle_json(r#"{"action":"launchRockets"}"#).await.error.as_deref(),
            Some("unknown action")
        );
        let rejected = control
            .handle_json(r#"{"action":"startCampaign","recipients":[{"phone":"12345"}]}"#)
            .await;
        assert!(!rejected.ok);

        let started = control
            .handle_json(r#"{"action":"startCampaign","recipients":[{"phone":"+91 98765 43210","name":"Amy","message":"hi"},{"phone":"123"},{"phone":"9876543211","name":"Bo","message":"hi"}],"options":{"delayMs":5000}}"#)
            .await;
        assert!(started.ok);
        let id = started.id.unwrap();
        assert_eq!(orch.store().total(id).await, Some(2));

        let active = control.handle_json(r#"{"action":"getActiveCampaign"}"#).await;
        assert_eq!(active.id, Some(id));

        assert!(control.pause().await.ok);
        assert!(!control.pause().await.ok);
        assert!(control.resume().await.ok);
        assert!(control.stop().await.ok);
        assert_eq!(control.stop().await.error.as_deref(), Some("no running campaign"));

        // 未绑定观察者时事件走进程级广播
        let mut saw_status = false;
        while let Ok(Ok(ev)) = tokio::time::timeout(Duration::from_secs(10), runtime.recv()).await {
            if matches!(ev, CampaignEvent::Status { id: got, status: CampaignStatus::Stopped } if got == id) {
                saw_status = true;
                break;
            }
        }
        assert!(saw_status);
    }

    #[tokio::test]
    async fn test_snapshot_written_after_each_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config();
        let surface = Arc::new(MockSurface::whatsapp());
        let sink: Arc<dyn SnapshotSink> = Arc::new(JsonSnapshotStore::new(dir.path()));
        let orch = Orchestrator::with_snapshot_sink(Arc::new(MockBackend::new(surface)), &cfg, Some(sink));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = orch
            .create_attached(recipients(&["a", "b"]), CampaignOptions::default(), Some(tx))
            .await
            .unwrap();
        collect_until_status(&mut rx).await;

        let path = JsonSnapshotStore::new(dir.path()).path_for(id);
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["id"], id.0);
        assert_eq!(json["index"], 2);
        assert_eq!(json["total"], 2);
        assert_eq!(json["status"], "finished");
    }

    #[tokio::test]
    async fn test_stop_all_halts_every_live_campaign() {
        let mut cfg = fast_config();
        cfg.campaign.default_delay_ms = 5_000;
        let (_backend, _surface, orch) = setup(&cfg);
        let a = orch.create(recipients(&["a", "b"]), CampaignOptions::default()).await.unwrap();
        let b = orch.create(recipients(&["c", "d"]), CampaignOptions::default()).await.unwrap();

        let mut stopped = orch.stop_all().await;
        stopped.sort();
        assert_eq!(stopped, vec![a, b]);
        assert!(orch.active_campaign().await.is_none());
        assert_eq!(orch.store().snapshot(a).await.unwrap().status, CampaignStatus::Stopped);
    }
}
