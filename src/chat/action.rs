//! 成员回复里的动作指令
//!
//! 主解析器只接受严格语法：去掉代码围栏后整段是一个 JSON 对象，且 `type` 属于固定集合。
//! 不满足时交给 [`crate::chat::salvage`] 做有损兜底。

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::chat::salvage;

/// 支持的指令类型
pub const COMMAND_TYPES: [&str; 6] = ["quote", "pat", "image", "recall", "bid", "hammer"];

/// 动作指令
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionCommand {
    /// 引用某人的一句话并回复
    Quote {
        #[serde(default)]
        quote_text: String,
        #[serde(default)]
        quote_user: String,
        #[serde(default)]
        content: String,
    },
    /// 拍一拍（不进入历史）
    Pat {
        #[serde(default)]
        target: Option<String>,
    },
    /// 以文字描述代替图片
    Image {
        #[serde(default)]
        description: Option<String>,
    },
    /// 撤回自己最近的一条消息
    Recall {},
    Bid {
        /// 缺省按 0 处理，交给拍卖判为低价
        #[serde(default, deserialize_with = "de_price")]
        price: f64,
        #[serde(default)]
        reason: String,
    },
    Hammer {
        #[serde(default)]
        winner: Option<String>,
        #[serde(default, deserialize_with = "de_opt_price")]
        price: Option<f64>,
    },
}

/// 解释结果
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// 普通文本
    Plain(String),
    Command(ActionCommand),
    /// 损坏的指令片段且找不到可展示的正文，本轮作废
    Discard,
}

fn price_from_value(v: &Value) -> Option<f64> {
    let p = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    p.is_finite().then_some(p)
}

fn de_price<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let v = Value::deserialize(d)?;
    price_from_value(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid price: {}", v)))
}

fn de_opt_price<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(price_from_value))
}

/// 去掉 ```json / ``` 围栏
pub fn strip_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// 严格解析的结果
#[derive(Debug)]
pub(crate) enum Strict {
    Command(ActionCommand),
    /// 合法 JSON，但不是已知指令（无 type 或 type 未知）
    NotCommand,
    /// 声称是已知指令，但字段不合法或 JSON 本身损坏
    Malformed,
}

/// 对一段完整 JSON 文本做严格解析
pub(crate) fn parse_strict(text: &str) -> Strict {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Strict::Malformed;
    };
    let known = value
        .get("type")
        .and_then(Value::as_str)
        .map(|t| COMMAND_TYPES.contains(&t))
        .unwrap_or(false);
    if !known {
        return Strict::NotCommand;
    }
    match serde_json::from_value::<ActionCommand>(value) {
        Ok(cmd) => Strict::Command(cmd),
        Err(_) => Strict::Malformed,
    }
}

/// 解释一条原始回复
pub fn interpret(raw: &str) -> Interpretation {
    let cleaned = strip_fences(raw);
    if cleaned.starts_with('{') && cleaned.ends_with('}') {
        match parse_strict(cleaned) {
            Strict::Command(cmd) => return Interpretation::Command(cmd),
            Strict::NotCommand => return Interpretation::Plain(cleaned.to_string()),
            Strict::Malformed => {}
        }
    }
    salvage::salvage(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_pat_command() {
        let raw = "```json\n{\"type\": \"pat\", \"target\": \"小D\"}\n```";
        assert_eq!(
            interpret(raw),
            Interpretation::Command(ActionCommand::Pat {
                target: Some("小D".into())
            })
        );
    }

    #[test]
    fn test_plain_text_passthrough() {
        assert_eq!(
            interpret("  今天摸鱼了吗~  "),
            Interpretation::Plain("今天摸鱼了吗~".into())
        );
    }

    #[test]
    fn test_unknown_type_is_plain_text() {
        let raw = r#"{"type": "dance", "content": "跳舞"}"#;
        assert_eq!(interpret(raw), Interpretation::Plain(raw.into()));
    }

    #[test]
    fn test_bid_price_accepts_numeric_string() {
        let raw = r#"{"type": "bid", "price": "120", "reason": "因为喜欢"}"#;
        assert_eq!(
            interpret(raw),
            Interpretation::Command(ActionCommand::Bid {
                price: 120.0,
                reason: "因为喜欢".into()
            })
        );
    }

    #[test]
    fn test_bid_without_price_defaults_to_zero() {
        assert_eq!(
            interpret(r#"{"type": "bid", "reason": "先举个牌"}"#),
            Interpretation::Command(ActionCommand::Bid {
                price: 0.0,
                reason: "先举个牌".into()
            })
        );
    }

    #[test]
    fn test_recall_with_extra_fields() {
        assert_eq!(
            interpret(r#"{"type": "recall", "why": "说错了"}"#),
            Interpretation::Command(ActionCommand::Recall {})
        );
    }

    #[test]
    fn test_hammer_defaults() {
        assert_eq!(
            interpret(r#"{"type": "hammer"}"#),
            Interpretation::Command(ActionCommand::Hammer {
                winner: None,
                price: None
            })
        );
    }
}
