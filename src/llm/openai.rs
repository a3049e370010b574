//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）的 `/chat/completions`（stream: true）。
//! 流式分片用自定义类型反序列化（byot），正文来自 `delta.content`，推理过程来自 `delta.reasoning_content`。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatRequest, DeltaStream, LlmClient, LlmError, StreamDelta};
use crate::memory::Message;

/// Google 的 OpenAI 兼容端点不接受带 `models/` 前缀的模型名
const GOOGLE_COMPAT_HOST: &str = "generativelanguage.googleapis.com";

/// 按服务商规则规范化模型名
pub fn normalize_model_name(base_url: &str, model: &str) -> String {
    if base_url.contains(GOOGLE_COMPAT_HOST) {
        if let Some(stripped) = model.strip_prefix("models/") {
            return stripped.to_string();
        }
    }
    model.to_string()
}

/// OpenAI 兼容客户端：持有 async_openai Client 与模型名
pub struct OpenAiCompatClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let base_url = base_url.trim_end_matches('/');
        let config = OpenAIConfig::new()
            .with_api_base(base_url)
            .with_api_key(api_key);
        Ok(Self {
            client: Client::with_config(config).with_http_client(http),
            model: normalize_model_name(base_url, model),
        })
    }
}

/// 请求体：messages 直接沿用内部 Message 的序列化
#[derive(Serialize)]
struct CompletionBody {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

/// 流式分片；标准类型里没有 reasoning_content，所以自带
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
}

/// 一个分片拆成推理与正文两路；空 choices、空字符串跳过
fn chunk_deltas(chunk: StreamChunk) -> Vec<StreamDelta> {
    let mut out = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(r) = choice.delta.reasoning_content.filter(|s| !s.is_empty()) {
            out.push(StreamDelta::Reasoning(r));
        }
        if let Some(c) = choice.delta.content.filter(|s| !s.is_empty()) {
            out.push(StreamDelta::Content(c));
        }
    }
    out
}

/// 传输层错误算连接错误（可重试）；其余交给文本特征判断
fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(e) if e.is_builder() => LlmError::Request(e.to_string()),
        OpenAIError::Reqwest(e) => LlmError::Connection(e.to_string()),
        other => LlmError::Request(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError> {
        let body = CompletionBody {
            model: self.model.clone(),
            messages: request.messages.clone(),
            stream: true,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        };

        let chunks = self
            .client
            .chat()
            .create_stream_byot(body)
            .await
            .map_err(map_openai_error)?;

        let deltas = chunks.flat_map(|item: Result<StreamChunk, OpenAIError>| {
            let out: Vec<Result<StreamDelta, LlmError>> = match item {
                Ok(chunk) => chunk_deltas(chunk).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(map_openai_error(e))],
            };
            stream::iter(out)
        });
        Ok(Box::pin(deltas))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
