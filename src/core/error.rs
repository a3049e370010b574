//! 会话与房间层错误类型

use thiserror::Error;

/// 编排过程中可能出现的错误（指令、剧本、存储、协议）
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("No agents configured")]
    NoAgents,

    #[error("Event index {idx} out of range ({len} events)")]
    InvalidEventIndex { idx: usize, len: usize },

    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("Auction error: {0}")]
    Auction(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
