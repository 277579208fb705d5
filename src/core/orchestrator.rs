//! 活动编排器：每个活动一个主循环任务
//!
//! 主循环按顺序处理收件人：确保会话 → 导航到收件人目标 → 握手 → verify_and_send → 提交结果。
//! 控制命令（pause / resume / stop）立即返回，只修改共享状态并递增 version；
//! 主循环在下一个挂起点观察到变化，跨 await 的结果以 version 校验后才提交。

use std::sync::Arc;

use crate::agent::{DeliveryAgent, DeliveryReport, DeliveryRequest};
use crate::config::{AppConfig, CampaignSection};
use crate::core::error::{CampaignError, DeliveryError, Disposition};
use crate::core::events::{CampaignEvent, Delivered, EventRelay, ObserverHandle};
use crate::core::persistence::{JsonSnapshotStore, SnapshotSink};
use crate::core::recipient::Recipient;
use crate::core::state::{
    CampaignId, CampaignOptions, CampaignStatus, Commit, ControlAction, Cycle, Dispatch, LoopEnd,
};
use crate::core::store::CampaignStore;
use crate::core::template::render_message;
use crate::session::{target_url, Handshake, SessionBackend, SessionManager};

/// 会话中途消失后，同一收件人最多重新发现的次数
const SESSION_LOSS_RETRIES: u32 = 2;

struct Inner {
    store: CampaignStore,
    sessions: SessionManager,
    handshake: Handshake,
    agent: DeliveryAgent,
    relay: EventRelay,
    snapshots: Option<Arc<dyn SnapshotSink>>,
    settings: CampaignSection,
}

/// 编排器句柄（可克隆，内部共享同一个活动存储）
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// 按配置创建；persistence.enabled 时快照写入 persistence.dir
    pub fn new(backend: Arc<dyn SessionBackend>, cfg: &AppConfig) -> Self {
        let snapshots: Option<Arc<dyn SnapshotSink>> = if cfg.persistence.enabled {
            Some(Arc::new(JsonSnapshotStore::new(&cfg.persistence.dir)))
        } else {
            None
        };
        Self::with_snapshot_sink(backend, cfg, snapshots)
    }

    pub fn with_snapshot_sink(
        backend: Arc<dyn SessionBackend>,
        cfg: &AppConfig,
        snapshots: Option<Arc<dyn SnapshotSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: CampaignStore::new(),
                sessions: SessionManager::new(backend, cfg.session.clone()),
                handshake: Handshake::new(cfg.handshake.clone()),
                agent: DeliveryAgent::new(cfg.delivery.clone()),
                relay: EventRelay::default(),
                snapshots,
                settings: cfg.campaign.clone(),
            }),
        }
    }

    pub fn store(&self) -> &CampaignStore {
        &self.inner.store
    }

    /// 进程级事件广播（无观察者时的兜底通道）
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CampaignEvent> {
        self.inner.relay.subscribe()
    }

    /// 新建活动并启动主循环，立即返回 id
    pub async fn create(&self, recipients: Vec<Recipient>, options: CampaignOptions) -> Result<CampaignId, CampaignError> {
        self.create_attached(recipients, options, None).await
    }

    /// 同 create，但在循环启动前绑定观察者，保证其能收到 started
    pub async fn create_attached(
        &self,
        recipients: Vec<Recipient>,
        options: CampaignOptions,
        observer: Option<ObserverHandle>,
    ) -> Result<CampaignId, CampaignError> {
        if recipients.is_empty() {
            return Err(CampaignError::NoRecipients);
        }
        let total = recipients.len();
        let id = self.inner.store.insert(recipients, options).await;
        if let Some(observer) = observer {
            self.attach(id, observer).await?;
        }
        tracing::info!(campaign_id = %id, total, "campaign created");
        self.persist(id).await;
        self.launch(id);
        Ok(id)
    }

    pub async fn pause(&self, id: CampaignId) -> Result<(), CampaignError> {
        self.inner.store.apply(id, ControlAction::Pause).await?;
        tracing::info!(campaign_id = %id, "campaign paused");
        self.emit(id, CampaignEvent::info(id, "Paused by user")).await;
        self.persist(id).await;
        Ok(())
    }

    pub async fn resume(&self, id: CampaignId) -> Result<(), CampaignError> {
        let transition = self.inner.store.apply(id, ControlAction::Resume).await?;
        tracing::info!(campaign_id = %id, relaunch = transition.relaunch, "campaign resumed");
        self.emit(id, CampaignEvent::info(id, "Resumed by user")).await;
        self.persist(id).await;
        if transition.relaunch {
            self.launch(id);
        }
        Ok(())
    }

    /// 停止活动；正在校验中的投递通过取消标记尽快返回 aborted
    pub async fn stop(&self, id: CampaignId) -> Result<(), CampaignError> {
        let transition = self.inner.store.apply(id, ControlAction::Stop).await?;
        if let Some(token) = self.inner.store.cancel_token(id).await {
            let ack = self.inner.agent.abort(&token);
            tracing::debug!(campaign_id = %id, aborted = ack.aborted, "abort signalled");
        }
        tracing::info!(campaign_id = %id, "campaign stopped");
        self.emit(id, CampaignEvent::info(id, "Stopped by user")).await;
        self.persist(id).await;
        if transition.finalize {
            // 暂停中没有循环任务，由这里完成收尾
            self.finish(id, CampaignStatus::Stopped).await;
        }
        Ok(())
    }

    /// 停止所有未结束的活动，返回被停止的 id
    pub async fn stop_all(&self) -> Vec<CampaignId> {
        let mut stopped = Vec::new();
        for id in self.inner.store.live_ids().await {
            match self.stop(id).await {
                Ok(()) => stopped.push(id),
                Err(e) => tracing::debug!(campaign_id = %id, error = %e, "stop_all skipped campaign"),
            }
        }
        stopped
    }

    /// 绑定观察者，并在该观察者上回复 attached
    pub async fn attach(&self, id: CampaignId, observer: ObserverHandle) -> Result<(), CampaignError> {
        self.inner.store.attach(id, observer.clone()).await?;
        self.inner.relay.emit(Some(&observer), CampaignEvent::Attached { id });
        Ok(())
    }

    /// 当前可寻址的活动（最新的未结束活动）
    pub async fn active_campaign(&self) -> Option<CampaignId> {
        self.inner.store.latest_where(|s| !s.is_terminal()).await
    }

    fn launch(&self, id: CampaignId) {
        let this = self.clone();
        tokio::spawn(async move { this.drive(id).await });
    }

    /// 循环任务：每次（重新）启动都发送 started
    async fn drive(self, id: CampaignId) {
        loop {
            if let Some(total) = self.inner.store.total(id).await {
                self.emit(id, CampaignEvent::Started { id, total }).await;
            }
            self.run_cycles(id).await;

            match self.inner.store.end_loop(id).await {
                Some(LoopEnd::Relaunch) => {
                    tracing::debug!(campaign_id = %id, "resumed while invalidated, relaunching");
                }
                Some(LoopEnd::Parked) => {
                    tracing::debug!(campaign_id = %id, "loop parked while paused");
                    return;
                }
                Some(LoopEnd::Terminal(status)) => {
                    self.finish(id, status).await;
                    return;
                }
                None => return,
            }
        }
    }

    async fn run_cycles(&self, id: CampaignId) {
        let store = &self.inner.store;
        let mut lost = 0;
        loop {
            let dispatch = match store.next_cycle(id).await {
                None | Some(Cycle::Stopped) => return,
                Some(Cycle::Exhausted) => {
                    store.finish_if_exhausted(id).await;
                    return;
                }
                Some(Cycle::Paused) => {
                    tokio::time::sleep(self.inner.settings.pause_poll()).await;
                    continue;
                }
                Some(Cycle::Dispatch(d)) if d.cancel.is_cancelled() => {
                    // stop 落在 next_cycle 之后：不导航，收件人保持 pending
                    tracing::debug!(campaign_id = %id, index = d.index, "cancelled before dispatch");
                    return;
                }
                Some(Cycle::Dispatch(d)) => d,
            };

            let report = match self.dispatch(id, &dispatch).await {
                Ok(report) => {
                    lost = 0;
                    report
                }
                Err(e) if e.disposition() == Disposition::Rediscover && lost < SESSION_LOSS_RETRIES => {
                    lost += 1;
                    tracing::warn!(campaign_id = %id, index = dispatch.index, error = %e, "session lost, rediscovering");
                    continue;
                }
                Err(e) if e.is_fatal() || e.disposition() == Disposition::Rediscover => {
                    tracing::error!(campaign_id = %id, error = %e, "campaign halted");
                    store.halt(id).await;
                    self.emit(id, CampaignEvent::error(id, e.to_string())).await;
                    self.persist(id).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(campaign_id = %id, error = %e, "recipient failed before delivery");
                    let error = match e {
                        CampaignError::Delivery(d) => d,
                        other => DeliveryError::Surface(other.to_string()),
                    };
                    DeliveryReport::failed(error, vec!["dispatch-failed".to_string()])
                }
            };

            match store.commit(id, &dispatch, &report).await {
                None => return,
                Some(Commit::Stale { status }) => {
                    tracing::info!(campaign_id = %id, index = dispatch.index, %status, "stale result discarded");
                    self.emit(id, CampaignEvent::info(id, "campaign invalidated, aborting")).await;
                    self.persist(id).await;
                    return;
                }
                Some(Commit::Accepted {
                    index,
                    recipient,
                    finished,
                }) => {
                    tracing::info!(
                        campaign_id = %id,
                        index,
                        phone = %recipient.phone,
                        success = report.success,
                        "recipient processed"
                    );
                    self.emit(
                        id,
                        CampaignEvent::Progress {
                            id,
                            index,
                            recipient,
                            result: report,
                        },
                    )
                    .await;
                    self.persist(id).await;
                    if finished {
                        return;
                    }
                    let delay = dispatch.delay(self.inner.settings.default_delay_ms);
                    tokio::select! {
                        _ = dispatch.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// 处理一位收件人；只有会话不可用或会话丢失会返回错误
    async fn dispatch(&self, id: CampaignId, d: &Dispatch) -> Result<DeliveryReport, CampaignError> {
        let inner = &self.inner;
        let message = render_message(d.template.as_deref(), &d.recipient);

        let binding = inner.sessions.ensure(d.session.clone()).await?;
        if d.session.as_ref() != Some(&binding) {
            inner.store.bind_session(id, Some(binding.clone())).await;
        }

        let target = target_url(&inner.sessions.settings().service_origin, &d.recipient.phone, &message);
        let nav = inner.sessions.navigate(&binding.id, &target).await;
        tracing::debug!(campaign_id = %id, session = %binding.id, ?nav, "navigated");

        let surface = match inner.sessions.surface(&binding.id).await {
            Ok(surface) => surface,
            Err(e) => {
                if e.disposition() == Disposition::Rediscover {
                    inner.store.bind_session(id, None).await;
                }
                return Err(e);
            }
        };
        let handshake = inner.handshake.run(&inner.sessions, &inner.agent, &binding.id, surface.as_ref()).await;
        tracing::debug!(
            campaign_id = %id,
            confirmed = handshake.confirmed,
            rounds = handshake.rounds,
            "handshake finished"
        );

        let request = DeliveryRequest {
            phone: d.recipient.phone.clone(),
            name: d.recipient.name.clone(),
            message,
            campaign_id: id,
        };
        let limit = inner.settings.delivery_call_timeout();
        let call = inner.agent.verify_and_send(surface.as_ref(), &request, &d.cancel);
        Ok(match tokio::time::timeout(limit, call).await {
            Ok(report) => report,
            Err(_) => {
                tracing::warn!(campaign_id = %id, "delivery call timed out");
                DeliveryReport::failed(DeliveryError::CallTimeout(limit), vec!["delivery-call-timeout".to_string()])
            }
        })
    }

    /// 终态收尾：最终状态事件、快照、回收 owned 会话
    async fn finish(&self, id: CampaignId, status: CampaignStatus) {
        tracing::info!(campaign_id = %id, %status, "campaign ended");
        self.emit(id, CampaignEvent::Status { id, status }).await;
        self.persist(id).await;
        if let Some(binding) = self.inner.store.take_session(id).await {
            self.inner.sessions.teardown(&binding).await;
        }
    }

    async fn emit(&self, id: CampaignId, event: CampaignEvent) {
        let observer = self.inner.store.observer(id).await;
        if self.inner.relay.emit(observer.as_ref(), event) == Delivered::ObserverGone {
            tracing::debug!(campaign_id = %id, "observer disconnected, falling back to broadcast");
            self.inner.store.detach(id).await;
        }
    }

    async fn persist(&self, id: CampaignId) {
        let Some(sink) = self.inner.snapshots.as_ref() else {
            return;
        };
        if let Some(snapshot) = self.inner.store.snapshot(id).await {
            if let Err(e) = sink.persist(&snapshot).await {
                tracing::warn!(campaign_id = %id, error = %e, "failed to persist snapshot");
            }
        }
    }
}
