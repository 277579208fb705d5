//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WABULK__*` 覆盖（双下划线表示嵌套，如 `WABULK__DELIVERY__VERIFY_TIMEOUT_MS=20000`）。
//! 所有时间类字段以毫秒为单位，默认值即协议常量；测试通过缩小这些值来加速。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub campaign: CampaignSection,
    pub session: SessionSection,
    pub handshake: HandshakeSection,
    pub delivery: DeliverySection,
    pub persistence: PersistenceSection,
    pub browser: BrowserSection,
}

/// [campaign] 段：主循环节奏与默认国家码
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CampaignSection {
    /// 10 位号码补全时使用的国家码
    pub default_country_code: String,
    /// options.delayMs 缺省时的消息间隔
    pub default_delay_ms: u64,
    /// 暂停状态下的轮询间隔
    pub pause_poll_ms: u64,
    /// 单次 verify_and_send 调用的总上限（覆盖所有内部重试）
    pub delivery_call_timeout_ms: u64,
}

fn default_country_code() -> String {
    "91".to_string()
}

impl Default for CampaignSection {
    fn default() -> Self {
        Self {
            default_country_code: default_country_code(),
            default_delay_ms: 1000,
            pause_poll_ms: 300,
            delivery_call_timeout_ms: 75_000,
        }
    }
}

impl CampaignSection {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn delivery_call_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_call_timeout_ms)
    }
}

/// [session] 段：目标服务与导航
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 目标服务的 origin，会话发现按此前缀匹配
    pub service_origin: String,
    pub navigation_timeout_ms: u64,
    /// 新建会话后首次使用前的等待
    pub create_settle_ms: u64,
    /// 导航时是否把会话切到前台
    pub focus_on_navigate: bool,
}

fn default_service_origin() -> String {
    "https://web.whatsapp.com".to_string()
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            service_origin: default_service_origin(),
            navigation_timeout_ms: 12_000,
            create_settle_ms: 600,
            focus_on_navigate: true,
        }
    }
}

impl SessionSection {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn create_settle(&self) -> Duration {
        Duration::from_millis(self.create_settle_ms)
    }
}

/// [handshake] 段：探活轮数与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeSection {
    pub rounds: u32,
    pub probe_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_step_ms: u64,
    pub final_settle_ms: u64,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            rounds: 3,
            probe_timeout_ms: 3000,
            backoff_base_ms: 700,
            backoff_step_ms: 200,
            final_settle_ms: 500,
        }
    }
}

impl HandshakeSection {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// 第 round 轮（从 1 开始）失败后的退避
    pub fn backoff(&self, round: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms + self.backoff_step_ms * round as u64)
    }

    pub fn final_settle(&self) -> Duration {
        Duration::from_millis(self.final_settle_ms)
    }
}

/// [delivery] 段：填充 / 发送 / 校验的时间预算与页面标记
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub interstitial_timeout_ms: u64,
    pub interstitial_poll_ms: u64,
    pub input_timeout_ms: u64,
    pub max_attempts: u32,
    pub settle_ms: u64,
    pub fill_retry_ms: u64,
    pub verify_timeout_ms: u64,
    pub verify_poll_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_step_ms: u64,
    /// 输入区标记（按顺序尝试）
    pub compose_selectors: Vec<String>,
    /// 发送按钮标记
    pub send_selectors: Vec<String>,
    /// 聊天记录中消息文本节点的标记
    pub transcript_selectors: Vec<String>,
    /// 祖先节点 class 中表示「发出」的片段
    pub outgoing_markers: Vec<String>,
}

fn default_compose_selectors() -> Vec<String> {
    vec![
        r#"[data-testid="compose-box-input"]"#.into(),
        r#"#main footer [contenteditable="true"]"#.into(),
        r#"[contenteditable="true"]"#.into(),
        r#"div[role="textbox"]"#.into(),
    ]
}

fn default_send_selectors() -> Vec<String> {
    vec![
        r#"[data-testid="send"]"#.into(),
        r#"button[type="submit"]"#.into(),
        r#"span[data-icon="send"]"#.into(),
        r#"[aria-label="Send"]"#.into(),
    ]
}

fn default_transcript_selectors() -> Vec<String> {
    vec![
        "span.selectable-text".into(),
        "div.copyable-text".into(),
        "span.copyable-text".into(),
        "span._11JPr".into(),
    ]
}

fn default_outgoing_markers() -> Vec<String> {
    vec![
        "outgoing".into(),
        "message-out".into(),
        "message-outgoing".into(),
        "_2hqOq".into(),
        "_3ays3".into(),
    ]
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            interstitial_timeout_ms: 2000,
            interstitial_poll_ms: 250,
            input_timeout_ms: 10_000,
            max_attempts: 3,
            settle_ms: 350,
            fill_retry_ms: 300,
            verify_timeout_ms: 14_000,
            verify_poll_ms: 400,
            retry_backoff_base_ms: 500,
            retry_backoff_step_ms: 200,
            compose_selectors: default_compose_selectors(),
            send_selectors: default_send_selectors(),
            transcript_selectors: default_transcript_selectors(),
            outgoing_markers: default_outgoing_markers(),
        }
    }
}

impl DeliverySection {
    pub fn interstitial_timeout(&self) -> Duration {
        Duration::from_millis(self.interstitial_timeout_ms)
    }

    pub fn interstitial_poll(&self) -> Duration {
        Duration::from_millis(self.interstitial_poll_ms)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn fill_retry(&self) -> Duration {
        Duration::from_millis(self.fill_retry_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn verify_poll(&self) -> Duration {
        Duration::from_millis(self.verify_poll_ms)
    }

    /// 第 attempt 次（从 1 开始）校验超时后的退避
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms + self.retry_backoff_step_ms * attempt as u64)
    }
}

/// [persistence] 段：快照输出目录（只写，不回读）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("state"),
        }
    }
}

/// [browser] 段：Chrome 启动参数（仅 feature "browser"）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub headless: bool,
    /// 复用已登录的用户目录；未设置时使用临时 profile
    pub user_data_dir: Option<PathBuf>,
    pub idle_timeout_secs: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: false,
            user_data_dir: None,
            idle_timeout_secs: 3600,
        }
    }
}

/// 从 config 目录加载配置，环境变量 WABULK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WABULK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WABULK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
