//! 群聊编排：历史、指令、拍卖、剧本、节奏与成员循环

pub mod action;
pub mod agent;
pub mod auction;
pub mod events;
pub mod history;
pub mod pacing;
pub mod prompt;
pub mod salvage;
pub mod scenario;
pub mod session;
pub mod turn;

pub use action::{interpret, ActionCommand, Interpretation};
pub use agent::{Agent, Sampling};
pub use auction::{Auction, BidOutcome, Settlement};
pub use events::{ChatEvent, GroupInfo, MemberInfo};
pub use history::{ChatMessage, History, MessageKind, Quote};
pub use pacing::{decide, Decision, DecisionContext, DelayRange, PacingPolicy};
pub use scenario::{ForceSkip, Progress, Scenario, ScenarioConfig, ScenarioEvent, ScenarioStatus, StageType};
pub use session::{AgentSpec, GroupSession, SessionSettings, SessionState};
