//! 会话内的 Delivery Agent：页面原语、弹层处理、填充 / 发送 / 校验协议

pub mod delivery;
pub mod interstitial;
pub mod surface;
pub mod wait;

pub use delivery::{AbortAck, DeliveryAgent, DeliveryReport, DeliveryRequest};
pub use interstitial::{classify_prompt, dismiss_interstitials, InterstitialOutcome, PromptKind};
pub use surface::{ElementRef, PromptCandidate, Surface, SurfaceError, TranscriptEntry};
pub use wait::wait_for;
