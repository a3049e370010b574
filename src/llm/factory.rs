//! 按成员端点配置创建 LLM 客户端

use std::sync::Arc;
use std::time::Duration;

use crate::llm::{LlmClient, LlmError, MockLlmClient, OpenAiCompatClient};

/// 单个成员的模型端点
#[derive(Debug, Clone, Default)]
pub struct ModelEndpoint {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

/// 客户端工厂：房间 setup 时为每个成员构建后端
pub trait ClientFactory: Send + Sync {
    fn build(&self, endpoint: &ModelEndpoint) -> Result<Arc<dyn LlmClient>, LlmError>;
}

/// 默认工厂：有 base_url 走 OpenAI 兼容 HTTP，否则退回 Mock
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, endpoint: &ModelEndpoint) -> Result<Arc<dyn LlmClient>, LlmError> {
        if endpoint.base_url.trim().is_empty() {
            tracing::warn!(
                "No base_url for model {}, falling back to mock client",
                endpoint.model
            );
            return Ok(Arc::new(MockLlmClient::new(endpoint.model.clone())));
        }
        let client = OpenAiCompatClient::new(
            &endpoint.base_url,
            &endpoint.model,
            &endpoint.api_key,
            self.timeout,
        )?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_base_url_falls_back_to_mock() {
        let factory = HttpClientFactory::new(Duration::from_secs(5));
        let client = factory
            .build(&ModelEndpoint {
                model: "models/gemini-2.0-flash".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(client.model_name(), "models/gemini-2.0-flash");
    }

    #[test]
    fn test_google_endpoint_model_normalized() {
        let factory = HttpClientFactory::new(Duration::from_secs(5));
        let client = factory
            .build(&ModelEndpoint {
                model: "models/gemini-2.0-flash".into(),
                base_url: "https://generativelanguage.googleapis.com/v1beta/openai/".into(),
                api_key: "k".into(),
            })
            .unwrap();
        assert_eq!(client.model_name(), "gemini-2.0-flash");
    }
}
