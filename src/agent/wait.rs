//! 「在超时内等待谓词成立」原语
//!
//! 谓词与等待方式都由调用方提供：投递协议用页面变化通知作为等待方式，避免紧密轮询。

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// 反复执行 probe，直到返回 Some 或超时；两次 probe 之间调用 idle(剩余时间)
///
/// probe 至少执行一次；超时后再做最后一次检查，避免错过等待期间刚出现的结果。
pub async fn wait_for<T, P, PF, I, IF>(timeout: Duration, mut probe: P, mut idle: I) -> Option<T>
where
    P: FnMut() -> PF,
    PF: Future<Output = Option<T>>,
    I: FnMut(Duration) -> IF,
    IF: Future<Output = ()>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = probe().await {
            return Some(v);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        idle(deadline - now).await;
        if Instant::now() >= deadline {
            return probe().await;
        }
    }
}
