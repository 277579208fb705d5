//! 页面表面抽象：Delivery Agent 在会话内可用的原语
//!
//! 具体实现可以是注入到真实页面的脚本（见 browser 模块），也可以是内存模拟（session::mock）。
//! 选择器匹配等页面细节都留在实现里，投递协议只依赖这些原语。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 页面元素的不透明引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementRef(pub String);

/// 可能需要点掉的弹层候选（按钮 / 链接及其文本）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptCandidate {
    pub element: ElementRef,
    pub text: String,
}

/// 聊天记录中的一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub text: String,
    /// 祖先节点带「发出」标记
    pub outgoing: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    /// 页面内的 agent 不存在（导航后被销毁，需重新注入）
    #[error("Delivery agent not present in session")]
    AgentMissing,

    #[error("Element {0:?} is gone")]
    StaleElement(ElementRef),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Session closed")]
    Closed,
}

#[async_trait]
pub trait Surface: Send + Sync {
    /// 注入（或重新注入）Delivery Agent
    async fn inject_agent(&self) -> Result<(), SurfaceError>;

    /// 探活：agent 已加载且能响应时返回 true
    async fn ping(&self) -> Result<bool, SurfaceError>;

    /// 当前页面上文本非空的按钮 / 链接
    async fn prompts(&self) -> Result<Vec<PromptCandidate>, SurfaceError>;

    /// 按顺序尝试选择器，返回第一个命中的元素
    async fn query_first(&self, selectors: &[String]) -> Result<Option<ElementRef>, SurfaceError>;

    /// 清空输入区后逐段写入，段与段之间插入显式换行，并通知页面内容已变化
    async fn fill(&self, input: &ElementRef, segments: &[&str]) -> Result<(), SurfaceError>;

    /// 合成按压序列（mousedown / mouseup）后点击
    async fn press(&self, element: &ElementRef) -> Result<(), SurfaceError>;

    /// 向输入区派发 Enter 键
    async fn press_enter(&self, input: &ElementRef) -> Result<(), SurfaceError>;

    /// 读取聊天记录；outgoing 由祖先 class 中的标记判定
    async fn transcript(
        &self,
        selectors: &[String],
        outgoing_markers: &[String],
    ) -> Result<Vec<TranscriptEntry>, SurfaceError>;

    /// 等待页面发生变化，最多 within；返回是否观察到变化
    ///
    /// 默认实现不观察，直接睡满 within。
    async fn changed(&self, within: Duration) -> Result<bool, SurfaceError> {
        tokio::time::sleep(within).await;
        Ok(false)
    }
}
