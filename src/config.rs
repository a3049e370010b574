//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGORA__*` 覆盖（双下划线表示嵌套，如 `AGORA__SCENARIO__MESSAGES_PER_EVENT=10`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::chat::pacing::PacingPolicy;
use crate::llm::RetryConfig;

/// 默认群名
pub const DEFAULT_GROUP_NAME: &str = "语言模型内部意识讨论群";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub scenario: ScenarioSection,
}

/// [server] 段：监听地址、房间配置目录
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 房间配置（群名、成员设定）落盘目录
    #[serde(default = "default_rooms_dir")]
    pub rooms_dir: PathBuf,
    #[serde(default = "default_group_name")]
    pub default_group_name: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_rooms_dir() -> PathBuf {
    PathBuf::from("workspace/rooms")
}

fn default_group_name() -> String {
    DEFAULT_GROUP_NAME.to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            rooms_dir: default_rooms_dir(),
            default_group_name: default_group_name(),
        }
    }
}

/// [llm] 段：采样参数、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// 单次 HTTP 请求超时（秒），包含整个流式读取
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 推理片段（thought）转发通道容量，满了直接丢弃
    #[serde(default = "default_thought_buffer")]
    pub thought_buffer: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_temperature() -> f32 {
    0.85
}

fn default_max_tokens() -> u32 {
    512
}

fn default_top_p() -> f32 {
    1.0
}

fn default_request_timeout() -> u64 {
    120
}

fn default_thought_buffer() -> usize {
    256
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            request_timeout_secs: default_request_timeout(),
            thought_buffer: default_thought_buffer(),
            retry: RetryConfig::default(),
        }
    }
}

/// [chat] 段：群聊身份、沉默判定与发言节奏
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSection {
    /// 人类观察者在群里的名字
    #[serde(default = "default_human_name")]
    pub human_name: String,
    /// 导演注入事件时使用的署名
    #[serde(default = "default_director_name")]
    pub director_name: String,
    #[serde(default = "default_silence_token")]
    pub silence_token: String,
    /// 去掉首尾空白后短于该字符数的回复视为沉默
    #[serde(default = "default_min_reply_chars")]
    pub min_reply_chars: usize,
    /// 构建 Prompt 时带入的最近消息条数
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub pacing: PacingPolicy,
}

fn default_human_name() -> String {
    "Gaia".to_string()
}

fn default_director_name() -> String {
    "导演".to_string()
}

fn default_silence_token() -> String {
    "[沉默]".to_string()
}

fn default_min_reply_chars() -> usize {
    2
}

fn default_context_window() -> usize {
    20
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            human_name: default_human_name(),
            director_name: default_director_name(),
            silence_token: default_silence_token(),
            min_reply_chars: default_min_reply_chars(),
            context_window: default_context_window(),
            pacing: PacingPolicy::default(),
        }
    }
}

/// [scenario] 段：章节推进阈值与动态记忆上限
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSection {
    /// 每个章节达到多少条新消息后推进
    #[serde(default = "default_messages_per_event")]
    pub messages_per_event: usize,
    /// 每个成员动态记忆最多保留的条目数，超出时丢弃最旧的
    #[serde(default = "default_memory_cap")]
    pub memory_cap: usize,
}

fn default_messages_per_event() -> usize {
    15
}

fn default_memory_cap() -> usize {
    12
}

impl Default for ScenarioSection {
    fn default() -> Self {
        Self {
            messages_per_event: default_messages_per_event(),
            memory_cap: default_memory_cap(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AGORA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGORA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGORA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_group_chat_conventions() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.chat.human_name, "Gaia");
        assert_eq!(cfg.chat.silence_token, "[沉默]");
        assert_eq!(cfg.scenario.messages_per_event, 15);
        assert_eq!(cfg.llm.max_tokens, 512);
        assert_eq!(cfg.llm.retry.max_attempts, 5);
        assert_eq!(cfg.server.default_group_name, DEFAULT_GROUP_NAME);
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind_addr = "127.0.0.1:9100"

[scenario]
messages_per_event = 4

[llm.retry]
max_attempts = 2
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:9100");
        assert_eq!(cfg.scenario.messages_per_event, 4);
        assert_eq!(cfg.llm.retry.max_attempts, 2);
        // 未出现的键保持默认
        assert_eq!(cfg.scenario.memory_cap, 12);
        assert_eq!(cfg.chat.context_window, 20);
    }
}
