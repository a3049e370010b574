//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete_stream 返回增量片段流，
//! 片段分为正文（Content）与推理（Reasoning）两路。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::memory::Message;

/// 认为可以重试的错误文本特征（小写匹配）
const TRANSIENT_MARKERS: [&str; 6] = [
    "429",
    "too many requests",
    "closed connection",
    "limitation",
    "quota",
    "resource_exhausted",
];

/// 流式增量片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    /// 最终回复正文
    Content(String),
    /// 推理过程（部分模型单独下发），只用于实时展示
    Reasoning(String),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LlmError>> + Send>>;

/// 单次对话请求：消息与采样参数
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens: 512,
            top_p: 1.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }
}

/// LLM 调用错误
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// 连接建立失败、读流中断、超时
    #[error("Connection error: {0}")]
    Connection(String),

    /// 服务端返回非 2xx
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// 请求本身无法构造或被客户端拒绝
    #[error("Request error: {0}")]
    Request(String),

    #[error("Max retries exceeded. Last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl LlmError {
    /// 是否属于可重试的瞬时故障（限流、配额、连接被重置）
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Connection(_) => true,
            LlmError::RetriesExhausted { .. } => false,
            other => has_transient_marker(&other.to_string()),
        }
    }
}

pub(crate) fn has_transient_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// LLM 客户端 trait：流式完成（返回增量片段流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发起一次流式请求；建立连接或握手阶段的失败直接以 Err 返回
    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError>;

    /// 模型标识（用于日志）
    fn model_name(&self) -> &str;
}
