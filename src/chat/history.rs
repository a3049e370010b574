//! 群聊共享历史
//!
//! 只追加；唯一的删除路径是成员撤回自己最近的一条消息。下标顺序即时间顺序。

use chrono::Local;
use serde::{Deserialize, Serialize};

/// 消息类别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Bid,
    Hammer,
}

/// 引用：被引用者昵称 + 原文
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub user: String,
    pub text: String,
}

/// 单条群聊消息（字段名与观察端协议一致）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "name")]
    pub author: String,
    pub content: String,
    /// 展示用 HH:MM:SS
    pub timestamp: String,
    /// 毫秒时间戳，在同一份历史内严格递增，撤回以此为键
    pub ts: i64,
    #[serde(rename = "is_user")]
    pub is_human: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
    #[serde(rename = "msg_type", default)]
    pub kind: MessageKind,
    #[serde(rename = "image_desc", default, skip_serializing_if = "Option::is_none")]
    pub image_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ChatMessage {
    /// 成员发出的普通文本
    pub fn text(author: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            author: author.into(),
            content: content.into(),
            timestamp: now.format("%H:%M:%S").to_string(),
            ts: now.timestamp_millis(),
            is_human: false,
            quote: None,
            kind: MessageKind::Text,
            image_description: None,
            price: None,
            avatar: None,
        }
    }

    /// 人类观察者（或导演）发出的消息
    pub fn human(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_human: true,
            ..Self::text(author, content)
        }
    }

    pub fn with_quote(mut self, quote: Quote) -> Self {
        self.quote = Some(quote);
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_image(mut self, description: impl Into<String>) -> Self {
        self.kind = MessageKind::Image;
        self.image_description = Some(description.into());
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_avatar(mut self, avatar: Option<String>) -> Self {
        self.avatar = avatar.filter(|a| !a.is_empty());
        self
    }
}

/// 共享历史
#[derive(Debug, Clone, Default)]
pub struct History {
    messages: Vec<ChatMessage>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加消息，返回其 ts（必要时顺延 1ms 以保持唯一）
    pub fn push(&mut self, mut msg: ChatMessage) -> i64 {
        if let Some(last) = self.messages.last() {
            if msg.ts <= last.ts {
                msg.ts = last.ts + 1;
            }
        }
        let ts = msg.ts;
        self.messages.push(msg);
        ts
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// 最近 n 条
    pub fn recent(&self, n: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// 从下标 idx 起的全部消息（越界返回空）
    pub fn since(&self, idx: usize) -> &[ChatMessage] {
        self.messages.get(idx..).unwrap_or(&[])
    }

    /// 撤回：删除 author 最近的一条消息，返回它原来的下标
    pub fn remove_last_by(&mut self, author: &str) -> Option<(usize, ChatMessage)> {
        let idx = self.messages.iter().rposition(|m| m.author == author)?;
        Some((idx, self.messages.remove(idx)))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
