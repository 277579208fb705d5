//! WABulk - 批量消息活动编排器
//!
//! 模块划分：
//! - **agent**: 会话内的 Delivery Agent（填充 / 发送 / 观察确认）与页面原语
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 活动状态、存储、主循环、控制面、事件、快照、优雅关闭
//! - **session**: 会话复用 / 创建 / 导航与握手，含内存模拟后端
//! - **browser**: Chrome 会话后端（feature "browser"）
//! - **observability**: 日志初始化

pub mod agent;
#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod core;
pub mod observability;
pub mod session;

pub use crate::core::{ControlSurface, Orchestrator};
