//! 群成员：一个模型标识 + 带重试的客户端
//!
//! Agent 本身不持有任何群聊状态，每次调用都拿快照组 Prompt。

use crate::chat::history::ChatMessage;
use crate::chat::prompt::{self, PersonaContext, Roster};
use crate::chat::scenario::ScenarioEvent;
use crate::config::LlmSection;
use crate::llm::{ChatRequest, LlmError, RetryingLlmClient};
use crate::memory::Message;

const SUMMARY_TEMPERATURE: f32 = 0.5;
const POLICY_TEMPERATURE: f32 = 0.6;

/// 采样参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self::from(&LlmSection::default())
    }
}

impl From<&LlmSection> for Sampling {
    fn from(s: &LlmSection) -> Self {
        Self {
            temperature: s.temperature,
            max_tokens: s.max_tokens,
            top_p: s.top_p,
        }
    }
}

pub struct Agent {
    key: String,
    llm: RetryingLlmClient,
    sampling: Sampling,
}

impl Agent {
    pub fn new(key: impl Into<String>, llm: RetryingLlmClient, sampling: Sampling) -> Self {
        Self {
            key: key.into(),
            llm,
            sampling,
        }
    }

    /// 模型标识（成员键）
    pub fn key(&self) -> &str {
        &self.key
    }

    fn request(&self, messages: Vec<Message>, temperature: f32) -> ChatRequest {
        ChatRequest::new(messages)
            .with_temperature(temperature)
            .with_max_tokens(self.sampling.max_tokens)
            .with_top_p(self.sampling.top_p)
    }

    /// 看最近的聊天记录，生成一条回复（原始文本，是否沉默由调用方判断）
    pub async fn compose_reply(
        &self,
        persona: &PersonaContext<'_>,
        recent: &[ChatMessage],
    ) -> Result<String, LlmError> {
        let system = prompt::persona_prompt(persona);
        let log = prompt::chat_log(recent, &self.key, persona.roster);
        let user = prompt::turn_prompt(&log, &persona.identity.nickname, persona.silence_token);
        let req = self.request(
            vec![Message::system(system), Message::user(user)],
            self.sampling.temperature,
        );
        self.llm.ask(&req).await
    }

    /// 章节结束：把这一章总结成一条记忆
    pub async fn summarize_chapter(
        &self,
        my_nick: &str,
        chapter: &[ChatMessage],
        roster: &Roster,
    ) -> Result<String, LlmError> {
        let user = prompt::summary_prompt(chapter, my_nick, roster);
        let req = self.request(vec![Message::user(user)], SUMMARY_TEMPERATURE);
        self.llm.ask(&req).await
    }

    /// 章节间隙：结合记忆与下一章预告制定行动方针
    pub async fn plan_next_chapter(
        &self,
        my_nick: &str,
        memory: &str,
        next: &ScenarioEvent,
    ) -> Result<String, LlmError> {
        let user = prompt::policy_prompt(memory, next, my_nick);
        let req = self.request(vec![Message::user(user)], POLICY_TEMPERATURE);
        self.llm.ask(&req).await
    }
}

/// 回复是否算沉默：含沉默标记、为空或去掉空白后过短
pub fn is_silence(reply: &str, silence_token: &str, min_chars: usize) -> bool {
    let trimmed = reply.trim();
    trimmed.is_empty()
        || (!silence_token.is_empty() && trimmed.contains(silence_token))
        || trimmed.chars().count() < min_chars
}
