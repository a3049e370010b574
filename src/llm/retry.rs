//! 带重试的 LLM 调用
//!
//! 每次尝试发起一次流式请求并累积正文；推理片段经有界通道实时转发给观察者。
//! 瞬时故障（限流、配额、连接中断）按指数退避 + 抖动重试，错误文本里带建议等待时间时以其为准。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::llm::{ChatRequest, LlmClient, LlmError, StreamDelta};

/// 重试参数（对应配置 [llm.retry]）
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 第 n 次失败后的基础等待为 base_delay_ms * 2^n
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// 采用服务端建议等待时追加的余量
    #[serde(default = "default_suggested_margin_ms")]
    pub suggested_margin_ms: u64,
    /// 限流/配额错误但没有建议时长时的最小等待
    #[serde(default = "default_rate_limit_floor_ms")]
    pub rate_limit_floor_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_jitter_ms() -> u64 {
    1000
}

fn default_suggested_margin_ms() -> u64 {
    1500
}

fn default_rate_limit_floor_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            suggested_margin_ms: default_suggested_margin_ms(),
            rate_limit_floor_ms: default_rate_limit_floor_ms(),
        }
    }
}

/// 推送给观察者的思考片段
#[derive(Debug, Clone, PartialEq)]
pub struct Thought {
    pub model: String,
    pub content: String,
    /// true 表示追加到上一段推理之后（流式片段），false 表示独立的一条状态
    pub append: bool,
}

pub type ThoughtSender = mpsc::Sender<Thought>;

fn retry_in_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)retry in (\d+(?:\.\d+)?)s").ok())
        .as_ref()
}

fn retry_after_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)retry after (\d+(?:\.\d+)?)").ok())
        .as_ref()
}

/// 从错误文本中提取服务端建议的等待时长（"retry in 43.9s" / "retry after 20"）
pub fn suggested_wait(text: &str) -> Option<Duration> {
    [retry_in_re(), retry_after_re()]
        .into_iter()
        .flatten()
        .find_map(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn is_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["429", "quota", "resource_exhausted"]
        .iter()
        .any(|m| lower.contains(m))
}

/// 计算第 `attempt` 次（从 0 开始）失败后的等待时长
///
/// 没有建议时长时，结果不小于同一次调用中上一次的等待（`previous`）。
pub fn delay_for(
    config: &RetryConfig,
    attempt: u32,
    error_text: &str,
    jitter_ms: u64,
    previous: Option<Duration>,
) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let computed =
        Duration::from_millis(config.base_delay_ms.saturating_mul(factor).saturating_add(jitter_ms));

    if let Some(suggested) = suggested_wait(error_text) {
        return computed.max(suggested + Duration::from_millis(config.suggested_margin_ms));
    }

    let mut wait = computed;
    if is_rate_limited(error_text) {
        wait = wait.max(Duration::from_millis(config.rate_limit_floor_ms));
    }
    match previous {
        Some(prev) => wait.max(prev),
        None => wait,
    }
}

/// 包装任意 LlmClient，提供重试与思考转发
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
    label: String,
    thoughts: Option<ThoughtSender>,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        let label = inner.model_name().to_string();
        Self {
            inner,
            config,
            label,
            thoughts: None,
        }
    }

    /// 设置思考片段的接收端；`label` 是观察者看到的成员标识
    pub fn with_thoughts(mut self, label: impl Into<String>, tx: ThoughtSender) -> Self {
        self.label = label.into();
        self.thoughts = Some(tx);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn emit(&self, content: String, append: bool) {
        if let Some(tx) = &self.thoughts {
            // 通道满时丢弃，观察者展示不能阻塞发言
            let _ = tx.try_send(Thought {
                model: self.label.clone(),
                content,
                append,
            });
        }
    }

    /// 发起请求，瞬时故障自动重试；返回完整正文
    pub async fn ask(&self, request: &ChatRequest) -> Result<String, LlmError> {
        if let Some(last) = request.messages.last() {
            self.emit(format!("正在思考: {}", preview(&last.content, 30)), false);
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut previous_wait: Option<Duration> = None;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            match self.attempt_once(request).await {
                Ok(text) => {
                    self.emit(format!("回答生成: {}", preview(&text, 30)), false);
                    return Ok(text);
                }
                Err(e) if !e.is_transient() => {
                    tracing::warn!("[{}] LLM request failed permanently: {}", self.label, e);
                    self.emit(format!("错误: {}", e), false);
                    return Err(e);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        "[{}] LLM request failed (attempt {}/{}): {}",
                        self.label,
                        attempt + 1,
                        max_attempts,
                        preview(&last_error, 100)
                    );
                    if attempt + 1 < max_attempts {
                        let jitter = rand::thread_rng().gen_range(0..=self.config.max_jitter_ms);
                        let wait = delay_for(&self.config, attempt, &last_error, jitter, previous_wait);
                        previous_wait = Some(wait);
                        self.emit(format!("等待 {:.1} 秒后重试...", wait.as_secs_f64()), false);
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: max_attempts,
            last: last_error,
        })
    }

    async fn attempt_once(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let mut stream = self.inner.complete_stream(request).await?;
        let mut content = String::new();
        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::Content(c) => content.push_str(&c),
                StreamDelta::Reasoning(r) => self.emit(r, true),
            }
        }
        Ok(content)
    }
}

/// 按字符截断（不会切坏多字节字符）
fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::Message;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_jitter_ms: 0,
            suggested_margin_ms: 5,
            rate_limit_floor_ms: 50,
        }
    }

    #[test]
    fn test_suggested_wait_patterns() {
        assert_eq!(
            suggested_wait("Please retry in 43.5s."),
            Some(Duration::from_secs_f64(43.5))
        );
        assert_eq!(
            suggested_wait("RETRY AFTER 20 seconds"),
            Some(Duration::from_secs(20))
        );
        assert_eq!(suggested_wait("429 Too Many Requests"), None);
    }

    #[test]
    fn test_suggested_wait_overrides_backoff() {
        let cfg = RetryConfig::default();
        let d = delay_for(&cfg, 0, "quota exceeded, retry in 30s", 0, None);
        assert_eq!(d, Duration::from_millis(31_500));
    }

    #[test]
    fn test_rate_limit_floor_without_suggestion() {
        let cfg = RetryConfig::default();
        let d = delay_for(&cfg, 0, "HTTP 429: slow down", 0, None);
        assert_eq!(d, Duration::from_millis(10_000));
        let plain = delay_for(&cfg, 0, "Connection error: reset", 0, None);
        assert_eq!(plain, Duration::from_millis(2_000));
    }

    #[test]
    fn test_waits_non_decreasing_without_suggestion() {
        let cfg = RetryConfig::default();
        let errors = [
            "HTTP 429: quota",
            "Connection error: closed connection",
            "HTTP 503: too many requests",
            "Connection error: reset",
        ];
        let mut prev = None;
        for (attempt, (err, jitter)) in errors.iter().zip([1000u64, 0, 999, 0]).enumerate() {
            let d = delay_for(&cfg, attempt as u32, err, jitter, prev);
            if let Some(p) = prev {
                assert!(d >= p, "attempt {} waited {:?} < {:?}", attempt, d, p);
            }
            prev = Some(d);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_until_success() {
        let mock = Arc::new(MockLlmClient::scripted(
            "m",
            vec![
                Err(LlmError::Status {
                    status: 429,
                    body: "Too Many Requests".into(),
                }),
                Ok("终于好了".into()),
            ],
        ));
        let client = RetryingLlmClient::new(mock.clone(), fast_config());
        let out = client
            .ask(&ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(out, "终于好了");
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let mock = Arc::new(MockLlmClient::scripted(
            "m",
            vec![Err(LlmError::Status {
                status: 401,
                body: "invalid api key".into(),
            })],
        ));
        let client = RetryingLlmClient::new(mock.clone(), fast_config());
        let err = client
            .ask(&ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 401, .. }));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_typed_error() {
        let mock = Arc::new(MockLlmClient::with_responder("m", |_, _| {
            Err(LlmError::Connection("closed connection".into()))
        }));
        let client = RetryingLlmClient::new(mock.clone(), fast_config());
        let err = client
            .ask(&ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_reasoning_forwarded_as_thoughts() {
        let mock = Arc::new(MockLlmClient::new("m").with_reasoning("让我想想"));
        let (tx, mut rx) = mpsc::channel(16);
        let client = RetryingLlmClient::new(mock, fast_config()).with_thoughts("成员A", tx);
        client
            .ask(&ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();

        let mut got = Vec::new();
        while let Ok(t) = rx.try_recv() {
            got.push(t);
        }
        assert!(got
            .iter()
            .any(|t| t.append && t.content == "让我想想" && t.model == "成员A"));
    }
}
