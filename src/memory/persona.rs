//! 成员设定与动态记忆
//!
//! - `MemberConfig`：可持久化的成员设定（群主标记、人设补充、昵称、静态记忆、头像）
//! - `DynamicMemory`：章节切换时追加的总结与行动方针，按条数封顶，超出丢弃最旧的

use std::collections::VecDeque;
use std::fmt;

use chrono::Local;
use serde::{Deserialize, Serialize};

/// 成员设定（随房间配置落盘）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    #[serde(default)]
    pub is_manager: bool,
    #[serde(default)]
    pub custom_prompt: String,
    /// 群内昵称；未设置时使用模型标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// 静态记忆 / 知识库
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub avatar: String,
}

/// update_settings 里的部分更新，只覆盖出现的字段
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MemberConfigPatch {
    pub is_manager: Option<bool>,
    pub custom_prompt: Option<String>,
    pub nickname: Option<String>,
    pub memory: Option<String>,
    pub avatar: Option<String>,
}

impl MemberConfig {
    pub fn apply(&mut self, patch: MemberConfigPatch) {
        if let Some(v) = patch.is_manager {
            self.is_manager = v;
        }
        if let Some(v) = patch.custom_prompt {
            self.custom_prompt = v;
        }
        if let Some(v) = patch.nickname {
            self.nickname = Some(v).filter(|n| !n.trim().is_empty());
        }
        if let Some(v) = patch.memory {
            self.memory = v;
        }
        if let Some(v) = patch.avatar {
            self.avatar = v;
        }
    }
}

/// 成员身份快照：组 Prompt 时使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub model_key: String,
    pub nickname: String,
    pub is_manager: bool,
    pub custom_prompt: String,
    pub static_memory: String,
    /// 渲染好的动态记忆
    pub dynamic_memory: String,
}

impl AgentIdentity {
    pub fn new(model_key: &str, config: &MemberConfig, memory: &DynamicMemory) -> Self {
        Self {
            model_key: model_key.to_string(),
            nickname: config
                .nickname
                .clone()
                .unwrap_or_else(|| model_key.to_string()),
            is_manager: config.is_manager,
            custom_prompt: config.custom_prompt.clone(),
            static_memory: config.memory.clone(),
            dynamic_memory: memory.render(),
        }
    }
}

/// 动态记忆条目类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// 章节总结
    Summary,
    /// 章节间隙的行动方针
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    /// HH:MM
    pub at: String,
    pub kind: MemoryKind,
    pub text: String,
}

impl fmt::Display for MemoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MemoryKind::Summary => write!(f, "[{}] {}", self.at, self.text),
            MemoryKind::Policy => write!(f, "[{} 思考/行动方针] {}", self.at, self.text),
        }
    }
}

const EMPTY_MEMORY: &str = "暂无先前动态记忆。";

/// 动态记忆
#[derive(Debug, Clone)]
pub struct DynamicMemory {
    entries: VecDeque<MemoryEntry>,
    cap: usize,
}

impl DynamicMemory {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, kind: MemoryKind, text: impl Into<String>) {
        self.entries.push_back(MemoryEntry {
            at: Local::now().format("%H:%M").to_string(),
            kind,
            text: text.into().trim().to_string(),
        });
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    pub fn count(&self, kind: MemoryKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// 每条一行；为空时返回占位文本
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return EMPTY_MEMORY.to_string();
        }
        self.entries
            .iter()
            .map(|e| format!("{}\n", e))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_drops_oldest() {
        let mut m = DynamicMemory::new(2);
        m.push(MemoryKind::Summary, "一");
        m.push(MemoryKind::Policy, "二");
        m.push(MemoryKind::Summary, "三");
        let texts: Vec<&str> = m.entries().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["二", "三"]);
    }

    #[test]
    fn test_render_format() {
        let mut m = DynamicMemory::new(4);
        assert_eq!(m.render(), "暂无先前动态记忆。");
        m.push(MemoryKind::Policy, " 先观望 ");
        let rendered = m.render();
        assert!(rendered.contains(" 思考/行动方针] 先观望\n"));
    }

    #[test]
    fn test_patch_only_touches_present_fields() {
        let mut c = MemberConfig {
            is_manager: true,
            custom_prompt: "毒舌".into(),
            ..Default::default()
        };
        let patch: MemberConfigPatch = serde_json::from_str(r#"{"nickname": "小D"}"#).unwrap();
        c.apply(patch);
        assert!(c.is_manager);
        assert_eq!(c.custom_prompt, "毒舌");
        assert_eq!(c.nickname.as_deref(), Some("小D"));
    }

    #[test]
    fn test_identity_nickname_fallback() {
        let id = AgentIdentity::new("deepseek-v3", &MemberConfig::default(), &DynamicMemory::new(3));
        assert_eq!(id.nickname, "deepseek-v3");
        assert_eq!(id.dynamic_memory, "暂无先前动态记忆。");
    }
}
