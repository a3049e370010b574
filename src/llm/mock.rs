//! Mock LLM 客户端（用于测试与未配置端点的成员，无需 API）
//!
//! 回复来源：固定脚本（按调用顺序弹出）或自定义 responder 闭包；
//! 可选附带一段推理片段，便于走通 thought 转发链路。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChatRequest, DeltaStream, LlmClient, LlmError, StreamDelta};

type Responder = dyn Fn(&ChatRequest, usize) -> Result<String, LlmError> + Send + Sync;

/// Mock 客户端
pub struct MockLlmClient {
    model: String,
    responder: Box<Responder>,
    reasoning: Option<String>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    /// 默认行为：每次返回带序号的短句
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_responder(model, |_, n| Ok(format!("Mock 回复 #{}", n + 1)))
    }

    /// 自定义回复：闭包拿到请求与第几次调用（从 0 开始）
    pub fn with_responder<F>(model: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ChatRequest, usize) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            model: model.into(),
            responder: Box::new(f),
            reasoning: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 按顺序返回脚本中的结果，脚本耗尽后回复沉默
    pub fn scripted(model: impl Into<String>, script: Vec<Result<String, LlmError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(script));
        Self::with_responder(model, move |_, _| {
            let next = queue.lock().ok().and_then(|mut q| q.pop_front());
            next.unwrap_or_else(|| Ok("[沉默]".to_string()))
        })
    }

    /// 每次回复前先下发一段推理片段
    pub fn with_reasoning(mut self, text: impl Into<String>) -> Self {
        self.reasoning = Some(text.into());
        self
    }

    /// 已被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let content = (self.responder)(request, n)?;

        let mut deltas = Vec::new();
        if let Some(r) = &self.reasoning {
            deltas.push(Ok(StreamDelta::Reasoning(r.clone())));
        }
        // 拆成两段，模拟真实流式增量
        let mid = content
            .char_indices()
            .nth(content.chars().count() / 2)
            .map(|(i, _)| i)
            .unwrap_or(content.len());
        let (head, tail) = content.split_at(mid);
        for part in [head, tail] {
            if !part.is_empty() {
                deltas.push(Ok(StreamDelta::Content(part.to_string())));
            }
        }
        Ok(Box::pin(stream::iter(deltas)))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_scripted_then_silence() {
        let mock = MockLlmClient::scripted(
            "m",
            vec![Ok("第一句".into()), Err(LlmError::Connection("reset".into()))],
        );
        let req = ChatRequest::new(Vec::new());

        let s = mock.complete_stream(&req).await.unwrap();
        let parts: Vec<_> = s.collect().await;
        let text: String = parts
            .into_iter()
            .map(|d| match d.unwrap() {
                StreamDelta::Content(c) => c,
                StreamDelta::Reasoning(_) => String::new(),
            })
            .collect();
        assert_eq!(text, "第一句");

        assert!(mock.complete_stream(&req).await.is_err());
        assert!(mock.complete_stream(&req).await.is_ok());
        assert_eq!(mock.calls(), 3);
    }
}
