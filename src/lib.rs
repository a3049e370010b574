//! Agora - 多模型自主群聊编排引擎
//!
//! 模块划分：
//! - **chat**: 群聊会话、每个成员的发言循环、指令协议、剧本与拍卖
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、运行监管、优雅关闭
//! - **gateway**: 房间管理与 WebSocket / HTTP 接口
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、重试
//! - **memory**: 对话历史窗口、成员设定与动态记忆
//! - **observability**: 日志初始化
//! - **storage**: 房间配置持久化

pub mod chat;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod storage;

pub use chat::{GroupSession, SessionSettings};
pub use gateway::RoomManager;
