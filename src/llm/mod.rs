//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、重试与思考转发

pub mod factory;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use factory::{ClientFactory, HttpClientFactory, ModelEndpoint};
pub use mock::MockLlmClient;
pub use openai::{normalize_model_name, OpenAiCompatClient};
pub use retry::{delay_for, suggested_wait, RetryConfig, RetryingLlmClient, Thought, ThoughtSender};
pub use traits::{ChatRequest, DeltaStream, LlmClient, LlmError, StreamDelta};
