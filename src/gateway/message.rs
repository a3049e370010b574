//! 观察者入站协议（WebSocket JSON，按 `type` 区分）

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::chat::scenario::ScenarioConfig;
use crate::memory::{MemberConfig, MemberConfigPatch};

/// setup 里的一个模型
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    pub model_name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub is_manager: bool,
    #[serde(default)]
    pub custom_prompt: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub nickname: Option<String>,
    /// 静态记忆
    #[serde(default)]
    pub memory: Option<String>,
}

impl ModelSpec {
    pub fn member_config(&self) -> MemberConfig {
        MemberConfig {
            is_manager: self.is_manager,
            custom_prompt: self.custom_prompt.clone(),
            nickname: self.nickname.clone().filter(|n| !n.trim().is_empty()),
            memory: self.memory.clone().unwrap_or_default(),
            avatar: self.avatar.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UserMessage {
        content: String,
        #[serde(default)]
        name: Option<String>,
    },
    Setup {
        #[serde(default)]
        models: Vec<ModelSpec>,
        #[serde(default)]
        scenario: Option<ScenarioConfig>,
        #[serde(default)]
        group_name: Option<String>,
    },
    UpdateSettings {
        #[serde(default)]
        group_name: Option<String>,
        #[serde(default)]
        member_configs: Option<BTreeMap<String, MemberConfigPatch>>,
    },
    Start,
    Stop,
    Clear,
    Reset,
    GetMembers,
    GetHistory,
    UserTyping {
        is_typing: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setup() {
        let raw = r#"{
            "type": "setup",
            "group_name": "摸鱼群",
            "models": [{"model_name": "deepseek-v3", "is_manager": true, "nickname": "小D"}],
            "scenario": {"enabled": true, "events": [{"Time": "早上", "Event": "开会", "Goal": "定方案"}]}
        }"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::Setup {
                models,
                scenario,
                group_name,
            } => {
                assert_eq!(group_name.as_deref(), Some("摸鱼群"));
                let cfg = models[0].member_config();
                assert!(cfg.is_manager);
                assert_eq!(cfg.nickname.as_deref(), Some("小D"));
                assert_eq!(scenario.unwrap().events[0].goal, "定方案");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unit_variants_and_unknown_type() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "get_members"}"#).unwrap(),
            ClientMessage::GetMembers
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"content": "hi"}"#).is_err());
    }
}
