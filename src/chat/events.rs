//! 推送给观察者的事件（WebSocket 出站消息）

use std::collections::BTreeMap;

use serde::Serialize;

use crate::chat::history::ChatMessage;
use crate::chat::scenario::ScenarioStatus;
use crate::llm::Thought;
use crate::memory::MemberConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub name: String,
}

/// 成员列表中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub name: String,
    pub nickname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub avatar: String,
    pub is_manager: bool,
    pub is_user: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    History {
        messages: Vec<ChatMessage>,
    },
    Message {
        message: ChatMessage,
    },
    Typing {
        models: Vec<String>,
    },
    Thought {
        model: String,
        content: String,
        append: bool,
    },
    Status {
        is_running: bool,
        member_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        group_info: Option<GroupInfo>,
    },
    System {
        content: String,
    },
    SettingsUpdated {
        group_name: String,
        member_configs: BTreeMap<String, MemberConfig>,
    },
    ScenarioStatus(ScenarioStatus),
    Pat {
        from_user: String,
        to_user: String,
    },
    Recall {
        from_user: String,
        msg_id: i64,
    },
    Members {
        members: Vec<MemberInfo>,
        group_name: String,
    },
}

impl ChatEvent {
    pub fn system(content: impl Into<String>) -> Self {
        ChatEvent::System {
            content: content.into(),
        }
    }
}

impl From<Thought> for ChatEvent {
    fn from(t: Thought) -> Self {
        ChatEvent::Thought {
            model: t.model,
            content: t.content,
            append: t.append,
        }
    }
}
