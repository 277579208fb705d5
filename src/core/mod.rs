//! 核心编排层：活动状态与存储、错误处置、事件中继、快照、主循环、控制面、优雅关闭

pub mod control;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod persistence;
pub mod recipient;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod template;

pub use control::{ControlRequest, ControlResponse, ControlSurface, RecipientInput};
pub use error::{CampaignError, DeliveryError, Disposition};
pub use events::{CampaignEvent, EventRelay, ObserverHandle};
pub use orchestrator::Orchestrator;
pub use persistence::{JsonSnapshotStore, SnapshotSink};
pub use recipient::{canonicalize_phone, DeliveryStatus, Recipient};
pub use shutdown::{run_until_shutdown, ShutdownManager, ShutdownReason};
pub use state::{CampaignId, CampaignOptions, CampaignSnapshot, CampaignStatus, ControlAction};
pub use store::CampaignStore;
pub use template::{render_message, substitute};
