//! 内存模拟的会话后端与页面表面（用于测试与 --dry-run，无需浏览器）
//!
//! MockSurface 模拟一个聊天页面：输入区、发送按钮、弹层，以及发送后出现在记录中的消息。
//! 通过 swallow / drop_next_sends 等开关制造「发了但没看到」的情况。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::{ElementRef, PromptCandidate, Surface, SurfaceError, TranscriptEntry};
use crate::session::{SessionBackend, SessionError, SessionInfo};

/// 模拟页面上的输入区标记
pub const COMPOSE: &str = r#"[data-testid="compose-box-input"]"#;
/// 模拟页面上的发送按钮标记
pub const SEND: &str = r#"[data-testid="send"]"#;

const PROMPT_PREFIX: &str = "prompt:";

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct SurfaceState {
    elements: HashSet<String>,
    prompts: Vec<String>,
    agent_alive: bool,
    reset_on_navigate: bool,
    ping_failures: u32,
    swallowed: HashSet<String>,
    drop_next_sends: u32,
    draft: String,
    last_fill: Vec<String>,
    transcript: Vec<TranscriptEntry>,
    sends: u32,
    enters: u32,
    fills: u32,
    pings: u32,
    injections: u32,
}

#[derive(Debug, Default)]
pub struct MockSurface {
    state: Mutex<SurfaceState>,
}

impl MockSurface {
    /// 已加载的聊天页面：agent 存活，输入区与发送按钮都在
    pub fn whatsapp() -> Self {
        let surface = Self::blank();
        {
            let mut s = guard(&surface.state);
            s.elements.insert(COMPOSE.to_string());
            s.elements.insert(SEND.to_string());
        }
        surface
    }

    /// 空白页面：agent 存活，但没有任何元素
    pub fn blank() -> Self {
        let surface = Self::default();
        guard(&surface.state).agent_alive = true;
        surface
    }

    pub fn remove_element(&self, selector: &str) {
        guard(&self.state).elements.remove(selector);
    }

    pub fn add_prompt(&self, text: &str) {
        guard(&self.state).prompts.push(text.to_string());
    }

    pub fn set_agent_alive(&self, alive: bool) {
        guard(&self.state).agent_alive = alive;
    }

    /// 导航后 agent 是否被销毁
    pub fn set_reset_on_navigate(&self, reset: bool) {
        guard(&self.state).reset_on_navigate = reset;
    }

    /// 接下来 n 次 ping 返回否定
    pub fn fail_pings(&self, n: u32) {
        guard(&self.state).ping_failures = n;
    }

    /// 该消息发送后永远不会出现在记录中
    pub fn swallow(&self, message: &str) {
        guard(&self.state).swallowed.insert(message.trim().to_string());
    }

    /// 接下来 n 次发送丢失
    pub fn drop_next_sends(&self, n: u32) {
        guard(&self.state).drop_next_sends = n;
    }

    pub fn on_navigate(&self) {
        let mut s = guard(&self.state);
        if s.reset_on_navigate {
            s.agent_alive = false;
        }
        s.draft.clear();
    }

    pub fn sends(&self) -> u32 {
        guard(&self.state).sends
    }

    pub fn enters(&self) -> u32 {
        guard(&self.state).enters
    }

    pub fn fills(&self) -> u32 {
        guard(&self.state).fills
    }

    pub fn pings(&self) -> u32 {
        guard(&self.state).pings
    }

    pub fn injections(&self) -> u32 {
        guard(&self.state).injections
    }

    pub fn last_fill(&self) -> Vec<String> {
        guard(&self.state).last_fill.clone()
    }

    /// 记录中所有发出的消息文本
    pub fn delivered(&self) -> Vec<String> {
        guard(&self.state)
            .transcript
            .iter()
            .filter(|e| e.outgoing)
            .map(|e| e.text.clone())
            .collect()
    }

    fn send(s: &mut SurfaceState) {
        s.sends += 1;
        let text = std::mem::take(&mut s.draft);
        if s.drop_next_sends > 0 {
            s.drop_next_sends -= 1;
            return;
        }
        if text.trim().is_empty() || s.swallowed.contains(text.trim()) {
            return;
        }
        s.transcript.push(TranscriptEntry { text, outgoing: true });
    }
}

#[async_trait]
impl Surface for MockSurface {
    async fn inject_agent(&self) -> Result<(), SurfaceError> {
        let mut s = guard(&self.state);
        s.injections += 1;
        s.agent_alive = true;
        Ok(())
    }

    async fn ping(&self) -> Result<bool, SurfaceError> {
        let mut s = guard(&self.state);
        s.pings += 1;
        if s.ping_failures > 0 {
            s.ping_failures -= 1;
            return Ok(false);
        }
        if !s.agent_alive {
            return Err(SurfaceError::AgentMissing);
        }
        Ok(true)
    }

    async fn prompts(&self) -> Result<Vec<PromptCandidate>, SurfaceError> {
        Ok(guard(&self.state)
            .prompts
            .iter()
            .map(|text| PromptCandidate {
                element: ElementRef(format!("{}{}", PROMPT_PREFIX, text)),
                text: text.clone(),
            })
            .collect())
    }

    async fn query_first(&self, selectors: &[String]) -> Result<Option<ElementRef>, SurfaceError> {
        let s = guard(&self.state);
        Ok(selectors
            .iter()
            .find(|sel| s.elements.contains(sel.as_str()))
            .map(|sel| ElementRef(sel.clone())))
    }

    async fn fill(&self, input: &ElementRef, segments: &[&str]) -> Result<(), SurfaceError> {
        let mut s = guard(&self.state);
        s.fills += 1;
        if !s.elements.contains(&input.0) {
            return Err(SurfaceError::StaleElement(input.clone()));
        }
        s.draft = segments.join("\n");
        s.last_fill = segments.iter().map(|seg| seg.to_string()).collect();
        Ok(())
    }

    async fn press(&self, element: &ElementRef) -> Result<(), SurfaceError> {
        let mut s = guard(&self.state);
        if let Some(text) = element.0.strip_prefix(PROMPT_PREFIX) {
            s.prompts.retain(|p| p != text);
            return Ok(());
        }
        if !s.elements.contains(&element.0) {
            return Err(SurfaceError::StaleElement(element.clone()));
        }
        if element.0 == SEND {
            Self::send(&mut s);
        }
        Ok(())
    }

    async fn press_enter(&self, input: &ElementRef) -> Result<(), SurfaceError> {
        let mut s = guard(&self.state);
        s.enters += 1;
        if !s.elements.contains(&input.0) {
            return Err(SurfaceError::StaleElement(input.clone()));
        }
        Self::send(&mut s);
        Ok(())
    }

    async fn transcript(
        &self,
        _selectors: &[String],
        _outgoing_markers: &[String],
    ) -> Result<Vec<TranscriptEntry>, SurfaceError> {
        Ok(guard(&self.state).transcript.clone())
    }
}

#[derive(Debug, Default)]
struct BackendState {
    sessions: Vec<SessionInfo>,
    unavailable: bool,
    created: u32,
    closed: Vec<String>,
    navigations: Vec<String>,
    navigation_delay: Duration,
    next_id: u64,
}

/// 模拟浏览器：所有会话共享同一个 MockSurface
pub struct MockBackend {
    surface: Arc<MockSurface>,
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new(surface: Arc<MockSurface>) -> Self {
        Self {
            surface,
            state: Mutex::new(BackendState::default()),
        }
    }

    /// 预先打开一个会话，返回其 ID
    pub fn open_existing(&self, url: &str, focused: bool) -> String {
        let mut s = guard(&self.state);
        s.next_id += 1;
        let id = format!("tab-{}", s.next_id);
        if focused {
            s.sessions.iter_mut().for_each(|x| x.focused = false);
        }
        s.sessions.push(SessionInfo {
            id: id.clone(),
            url: url.to_string(),
            focused,
        });
        id
    }

    pub fn open_with_id(&self, id: &str, url: &str) {
        guard(&self.state).sessions.push(SessionInfo {
            id: id.to_string(),
            url: url.to_string(),
            focused: false,
        });
    }

    /// 模拟用户关掉了标签页
    pub fn kill(&self, id: &str) {
        guard(&self.state).sessions.retain(|x| x.id != id);
    }

    /// 不可用时 discover / create 都失败
    pub fn set_unavailable(&self, unavailable: bool) {
        guard(&self.state).unavailable = unavailable;
    }

    pub fn set_navigation_delay(&self, delay: Duration) {
        guard(&self.state).navigation_delay = delay;
    }

    pub fn created(&self) -> u32 {
        guard(&self.state).created
    }

    pub fn closed(&self) -> Vec<String> {
        guard(&self.state).closed.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        guard(&self.state).navigations.clone()
    }

    pub fn live_sessions(&self) -> Vec<SessionInfo> {
        guard(&self.state).sessions.clone()
    }

    fn exists(&self, id: &str) -> bool {
        guard(&self.state).sessions.iter().any(|x| x.id == id)
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn probe(&self, id: &str) -> bool {
        self.exists(id)
    }

    async fn discover(&self, origin: &str) -> Result<Vec<SessionInfo>, SessionError> {
        let s = guard(&self.state);
        if s.unavailable {
            return Err(SessionError::Backend("mock browser unavailable".into()));
        }
        Ok(s.sessions.iter().filter(|x| x.url.starts_with(origin)).cloned().collect())
    }

    async fn create(&self, url: &str) -> Result<SessionInfo, SessionError> {
        let mut s = guard(&self.state);
        if s.unavailable {
            return Err(SessionError::Backend("mock browser unavailable".into()));
        }
        s.next_id += 1;
        s.created += 1;
        let info = SessionInfo {
            id: format!("tab-{}", s.next_id),
            url: url.to_string(),
            focused: false,
        };
        s.sessions.push(info.clone());
        Ok(info)
    }

    async fn close(&self, id: &str) -> Result<(), SessionError> {
        let mut s = guard(&self.state);
        let before = s.sessions.len();
        s.sessions.retain(|x| x.id != id);
        if s.sessions.len() == before {
            return Err(SessionError::Gone(id.to_string()));
        }
        s.closed.push(id.to_string());
        Ok(())
    }

    async fn focus(&self, id: &str) -> Result<(), SessionError> {
        let mut s = guard(&self.state);
        if !s.sessions.iter().any(|x| x.id == id) {
            return Err(SessionError::Gone(id.to_string()));
        }
        for x in s.sessions.iter_mut() {
            x.focused = x.id == id;
        }
        Ok(())
    }

    async fn navigate(&self, id: &str, url: &str) -> Result<(), SessionError> {
        {
            let mut s = guard(&self.state);
            let session = s
                .sessions
                .iter_mut()
                .find(|x| x.id == id)
                .ok_or_else(|| SessionError::Gone(id.to_string()))?;
            session.url = url.to_string();
            s.navigations.push(url.to_string());
        }
        self.surface.on_navigate();
        Ok(())
    }

    async fn wait_loaded(&self, id: &str) -> Result<(), SessionError> {
        let delay = guard(&self.state).navigation_delay;
        if !self.exists(id) {
            return Err(SessionError::Gone(id.to_string()));
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn surface(&self, id: &str) -> Result<Arc<dyn Surface>, SessionError> {
        if !self.exists(id) {
            return Err(SessionError::Gone(id.to_string()));
        }
        Ok(self.surface.clone())
    }
}
