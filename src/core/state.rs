//! 活动状态：Campaign 及其状态机
//!
//! version 在每次外部控制（pause / resume / stop）时严格递增；主循环派发时记下 version，
//! 结果回来后若 version 已变化则丢弃，保证跨 await 的一致性。

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::DeliveryReport;
use crate::core::error::CampaignError;
use crate::core::events::ObserverHandle;
use crate::core::recipient::{DeliveryStatus, Recipient};
use crate::session::SessionBinding;

/// 活动 ID（进程内单调分配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub u64);

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 活动状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Running,
    Paused,
    Stopped,
    Finished,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Stopped | CampaignStatus::Finished)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Stopped => "stopped",
            CampaignStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// 操作员控制动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// 活动选项（与控制面 JSON 一致，camelCase）
///
/// batchSize / batchDelayMs 只被接受并保存，主循环不使用。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, alias = "delay", skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_delay_ms: Option<u64>,
}

/// 外部检查用的快照（只写）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub id: CampaignId,
    pub index: usize,
    pub status: CampaignStatus,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    /// 毫秒时间戳
    pub updated_at: i64,
}

/// 一次控制命令的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub version: u64,
    /// resume 时没有活跃循环，需要重新启动
    pub relaunch: bool,
    /// stop 时没有活跃循环（已停车），需由调用方完成收尾
    pub finalize: bool,
}

/// 主循环一轮开始时看到的情况
#[derive(Debug, Clone)]
pub enum Cycle {
    Stopped,
    Paused,
    Exhausted,
    Dispatch(Dispatch),
}

/// 一次派发所需的全部数据（在锁外使用）
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub index: usize,
    pub recipient: Recipient,
    pub template: Option<String>,
    /// options.delayMs；缺省时用配置的默认间隔
    pub delay_ms: Option<u64>,
    pub version: u64,
    pub cancel: CancellationToken,
    pub session: Option<SessionBinding>,
}

impl Dispatch {
    /// 本条之后的消息间隔
    pub fn delay(&self, default_ms: u64) -> std::time::Duration {
        std::time::Duration::from_millis(self.delay_ms.unwrap_or(default_ms))
    }
}

/// 提交结果
#[derive(Debug, Clone)]
pub enum Commit {
    Accepted {
        index: usize,
        recipient: Recipient,
        finished: bool,
    },
    /// 派发后发生过控制命令，结果作废
    Stale { status: CampaignStatus },
}

/// 循环退出时的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    /// 终态：发送最终状态事件并回收会话
    Terminal(CampaignStatus),
    /// 暂停中：循环停车，等待 resume 重新启动
    Parked,
    /// 作废期间已被 resume：立即重新启动
    Relaunch,
}

/// 单个活动
#[derive(Debug)]
pub struct Campaign {
    pub id: CampaignId,
    pub recipients: Vec<Recipient>,
    pub index: usize,
    pub status: CampaignStatus,
    pub version: u64,
    pub options: CampaignOptions,
    pub session: Option<SessionBinding>,
    pub observer: Option<ObserverHandle>,
    /// stop 时经 DeliveryAgent::abort 取消，传入 verify_and_send
    pub cancel: CancellationToken,
    /// 是否有循环任务在跑（每个活动至多一个）
    pub loop_active: bool,
}

impl Campaign {
    pub fn new(id: CampaignId, recipients: Vec<Recipient>, options: CampaignOptions) -> Self {
        Self {
            id,
            recipients,
            index: 0,
            status: CampaignStatus::Running,
            version: 1,
            options,
            session: None,
            observer: None,
            cancel: CancellationToken::new(),
            loop_active: false,
        }
    }

    pub fn total(&self) -> usize {
        self.recipients.len()
    }

    pub fn count(&self, status: DeliveryStatus) -> usize {
        self.recipients.iter().filter(|r| r.status == status).count()
    }

    /// 应用控制命令：成功时 version 加一
    pub fn apply(&mut self, action: ControlAction) -> Result<Transition, CampaignError> {
        let next = match (action, self.status) {
            (ControlAction::Pause, CampaignStatus::Running) => CampaignStatus::Paused,
            (ControlAction::Resume, CampaignStatus::Paused) => CampaignStatus::Running,
            (ControlAction::Stop, CampaignStatus::Running | CampaignStatus::Paused) => {
                CampaignStatus::Stopped
            }
            (action, status) => {
                return Err(CampaignError::InvalidTransition {
                    id: self.id,
                    status,
                    action,
                })
            }
        };

        self.status = next;
        self.version += 1;

        let mut relaunch = false;
        let mut finalize = false;
        match action {
            ControlAction::Stop => finalize = !self.loop_active,
            ControlAction::Resume if !self.loop_active => {
                self.loop_active = true;
                relaunch = true;
            }
            _ => {}
        }

        Ok(Transition {
            version: self.version,
            relaunch,
            finalize,
        })
    }

    /// 主循环读取本轮要做的事
    pub fn next_cycle(&self) -> Cycle {
        match self.status {
            CampaignStatus::Stopped => Cycle::Stopped,
            CampaignStatus::Finished => Cycle::Exhausted,
            CampaignStatus::Paused => Cycle::Paused,
            CampaignStatus::Running => match self.recipients.get(self.index) {
                None => Cycle::Exhausted,
                Some(recipient) => Cycle::Dispatch(Dispatch {
                    index: self.index,
                    recipient: recipient.clone(),
                    template: self.options.template.clone(),
                    delay_ms: self.options.delay_ms,
                    version: self.version,
                    cancel: self.cancel.clone(),
                    session: self.session.clone(),
                }),
            },
        }
    }

    /// 提交一次投递结果；version 不一致时作废
    pub fn commit(&mut self, dispatch: &Dispatch, report: &DeliveryReport) -> Commit {
        if dispatch.version != self.version || dispatch.index != self.index {
            // stop 打断的投递仍在收件人上留下结果，但不推进游标
            if self.status == CampaignStatus::Stopped {
                if let Some(r) = self.recipients.get_mut(dispatch.index) {
                    record(r, report);
                }
            }
            return Commit::Stale { status: self.status };
        }

        let index = self.index;
        let recipient = match self.recipients.get_mut(index) {
            Some(r) => {
                record(r, report);
                r.clone()
            }
            None => return Commit::Stale { status: self.status },
        };

        self.index += 1;
        let finished = self.index == self.total();
        if finished {
            self.status = CampaignStatus::Finished;
        }

        Commit::Accepted {
            index,
            recipient,
            finished,
        }
    }

    /// 循环耗尽收件人（空活动）时标记完成
    pub fn finish_if_exhausted(&mut self) {
        if self.status == CampaignStatus::Running && self.index >= self.total() {
            self.status = CampaignStatus::Finished;
        }
    }

    /// 致命错误：直接进入终态
    pub fn halt(&mut self) {
        if !self.status.is_terminal() {
            self.status = CampaignStatus::Stopped;
            self.cancel.cancel();
        }
    }

    /// 循环任务退出：决定停车、重启还是收尾
    pub fn end_loop(&mut self) -> LoopEnd {
        match self.status {
            CampaignStatus::Running => LoopEnd::Relaunch,
            CampaignStatus::Paused => {
                self.loop_active = false;
                LoopEnd::Parked
            }
            status => {
                self.loop_active = false;
                LoopEnd::Terminal(status)
            }
        }
    }

    pub fn snapshot(&self) -> CampaignSnapshot {
        CampaignSnapshot {
            id: self.id,
            index: self.index,
            status: self.status,
            total: self.total(),
            sent: self.count(DeliveryStatus::Sent),
            failed: self.count(DeliveryStatus::Failed),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

fn record(recipient: &mut Recipient, report: &DeliveryReport) {
    if report.success {
        recipient.status = DeliveryStatus::Sent;
        recipient.error = None;
    } else {
        recipient.status = DeliveryStatus::Failed;
        recipient.error = report.error.as_ref().map(|e| e.to_string());
    }
}
