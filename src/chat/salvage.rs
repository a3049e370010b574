//! 指令兜底解析（有损）
//!
//! 模型经常把指令 JSON 夹在正文里，或者输出半截/转义错误的 JSON。
//! 这里只做尽力而为的抢救：能抽出完整指令就用，抽不出就退而取 `content` 字段当普通文本，
//! 仍然失败则整轮作废；已匹配到指令形态的损坏片段不会原样展示给观察者。
//! 主解析器 [`crate::chat::action::interpret`] 的正确性不依赖本模块。

use std::sync::OnceLock;

use regex::Regex;

use crate::chat::action::{parse_strict, Interpretation, Strict};

fn embedded_command_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)(\{.*"type"\s*:\s*"(?:quote|pat|image|recall|hammer|bid)".*\})"#).ok()
    })
    .as_ref()
}

fn content_key_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""content"\s*:\s*"#).ok()).as_ref()
}

fn bare_content_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)"content"\s*:\s*([^,}]+)"#).ok())
        .as_ref()
}

/// 兜底解释
pub fn salvage(cleaned: &str) -> Interpretation {
    let Some(candidate) = embedded_command_re()
        .and_then(|re| re.captures(cleaned))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
    else {
        return Interpretation::Plain(cleaned.to_string());
    };

    if let Strict::Command(cmd) = parse_strict(candidate) {
        tracing::debug!("Extracted embedded command from reply");
        return Interpretation::Command(cmd);
    }

    match extract_content(candidate) {
        Some(text) if !text.is_empty() => {
            tracing::debug!("Broken command JSON, kept its content field as text");
            Interpretation::Plain(text)
        }
        _ => Interpretation::Discard,
    }
}

/// 从损坏的 JSON 片段里取 `content` 的值
fn extract_content(fragment: &str) -> Option<String> {
    let raw = quoted_content(fragment).or_else(|| {
        bare_content_re()
            .and_then(|re| re.captures(fragment))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    })?;
    Some(unescape(raw.trim()).trim().to_string())
}

/// `"content": "..."`：取到第一个未被反斜杠转义的引号为止
fn quoted_content(fragment: &str) -> Option<String> {
    let start = content_key_re()?.find(fragment)?.end();
    let rest = fragment.get(start..)?.strip_prefix('"')?;

    let mut out = String::new();
    let mut escaped = false;
    for ch in rest.chars() {
        if escaped {
            out.push('\\');
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '"' {
            return Some(out);
        } else {
            out.push(ch);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::action::{interpret, ActionCommand};

    #[test]
    fn test_command_embedded_in_prose() {
        let raw = "哈哈我来拍一下 {\"type\": \"pat\", \"target\": \"Gaia\"} 嘿嘿";
        assert_eq!(
            interpret(raw),
            Interpretation::Command(ActionCommand::Pat {
                target: Some("Gaia".into())
            })
        );
    }

    #[test]
    fn test_broken_quote_falls_back_to_content() {
        // 末尾多了逗号，JSON 不合法
        let raw = r#"{"type": "quote", "quote_user": "小D", "content": "你说得对\"真的\"\n", }"#;
        assert_eq!(
            interpret(raw),
            Interpretation::Plain("你说得对\"真的\"".into())
        );
    }

    #[test]
    fn test_unquoted_content_value() {
        let raw = r#"{"type": "quote", "content": 好的吧 }"#;
        assert_eq!(interpret(raw), Interpretation::Plain("好的吧".into()));
    }

    #[test]
    fn test_broken_fragment_without_content_discarded() {
        let raw = r#"{"type": "image", "description": "一只猫"#;
        // 没有闭合的花括号，连兜底正则都匹配不上，按普通文本处理
        assert_eq!(interpret(raw), Interpretation::Plain(raw.into()));

        let raw = r#"看图 {"type": "image", description: 一只猫}"#;
        assert_eq!(interpret(raw), Interpretation::Discard);
    }
}
