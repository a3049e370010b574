//! 剧本推进：章节（事件）状态机
//!
//! 纯状态与判定逻辑；并发互斥、记忆整理与全局停止由 [`crate::chat::session::GroupSession`] 负责。

use serde::{Deserialize, Serialize};

use crate::core::ChatError;

/// 舞台类型（决定人设 Prompt 的风格段落）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageType {
    #[default]
    #[serde(rename = "聊天群聊")]
    ChatGroup,
    #[serde(rename = "网站论坛")]
    Forum,
    #[serde(rename = "跑团桌")]
    TabletopRpg,
    #[serde(rename = "辩论赛")]
    Debate,
    #[serde(rename = "审判法庭")]
    Courtroom,
    #[serde(rename = "博弈游戏")]
    StrategyGame,
    #[serde(rename = "传话筒迷宫")]
    WhisperMaze,
}

/// 一个章节：虚拟时间、事件描述、收敛目标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    #[serde(rename = "Time", alias = "time", default)]
    pub time: String,
    #[serde(rename = "Event", alias = "event", alias = "description", default)]
    pub description: String,
    #[serde(rename = "Goal", alias = "goal", default)]
    pub goal: String,
}

/// 剧本配置（setup 时随消息下发，不落盘）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub stage_type: StageType,
    #[serde(default)]
    pub events: Vec<ScenarioEvent>,
}

/// 每轮检查的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// 未启用或没有章节
    Idle,
    /// 本章消息数未达阈值
    Continue,
    /// 最后一章已达阈值：整场对话结束
    Finished,
    /// 达到阈值且还有下一章
    Advance,
}

/// 手动推进被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceSkip {
    Disabled,
    NoEvents,
    /// 上次切换后还没有新消息，防止连续推进两次
    NoNewMessages,
    FinalEvent,
}

/// 推送给观察者的剧本状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioStatus {
    pub current_event_idx: usize,
    pub events: Vec<ScenarioEvent>,
    pub enabled: bool,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    config: ScenarioConfig,
    current_event_idx: usize,
    chapter_start: usize,
    messages_per_event: usize,
}

impl Scenario {
    pub fn new(config: ScenarioConfig, messages_per_event: usize) -> Self {
        Self {
            config,
            current_event_idx: 0,
            chapter_start: 0,
            messages_per_event: messages_per_event.max(1),
        }
    }

    pub fn disabled(messages_per_event: usize) -> Self {
        Self::new(ScenarioConfig::default(), messages_per_event)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn stage_type(&self) -> StageType {
        self.config.stage_type
    }

    pub fn events(&self) -> &[ScenarioEvent] {
        &self.config.events
    }

    pub fn current_idx(&self) -> usize {
        self.current_event_idx
    }

    pub fn chapter_start(&self) -> usize {
        self.chapter_start
    }

    pub fn messages_per_event(&self) -> usize {
        self.messages_per_event
    }

    /// 当前章节（未启用时为 None）
    pub fn current_event(&self) -> Option<&ScenarioEvent> {
        if !self.config.enabled {
            return None;
        }
        self.config.events.get(self.current_event_idx)
    }

    fn is_final(&self) -> bool {
        self.current_event_idx + 1 >= self.config.events.len()
    }

    /// 当前章节还没有任何新消息
    pub fn is_fresh_chapter(&self, history_len: usize) -> bool {
        self.config.enabled && history_len <= self.chapter_start
    }

    pub fn evaluate(&self, history_len: usize) -> Progress {
        if !self.config.enabled || self.config.events.is_empty() {
            return Progress::Idle;
        }
        if history_len.saturating_sub(self.chapter_start) < self.messages_per_event {
            return Progress::Continue;
        }
        if self.is_final() {
            Progress::Finished
        } else {
            Progress::Advance
        }
    }

    /// 检查能否手动推进
    pub fn check_force(&self, history_len: usize) -> Result<(), ForceSkip> {
        if !self.config.enabled {
            return Err(ForceSkip::Disabled);
        }
        if history_len <= self.chapter_start {
            return Err(ForceSkip::NoNewMessages);
        }
        if self.config.events.is_empty() {
            return Err(ForceSkip::NoEvents);
        }
        if self.is_final() {
            return Err(ForceSkip::FinalEvent);
        }
        Ok(())
    }

    /// 进入下一章，章节起点重置为当前历史长度；返回新章节
    pub fn advance(&mut self, history_len: usize) -> Option<&ScenarioEvent> {
        if self.is_final() {
            return None;
        }
        self.current_event_idx += 1;
        self.chapter_start = history_len;
        self.config.events.get(self.current_event_idx)
    }

    /// 运维跳转到任意章节（唯一允许下标回退的路径）
    pub fn jump(&mut self, idx: usize, history_len: usize) -> Result<(), ChatError> {
        if idx >= self.config.events.len() {
            return Err(ChatError::InvalidEventIndex {
                idx,
                len: self.config.events.len(),
            });
        }
        self.current_event_idx = idx;
        self.chapter_start = history_len;
        Ok(())
    }

    /// 整体替换章节列表；列表为空即关闭剧本
    pub fn replace_events(&mut self, events: Vec<ScenarioEvent>) {
        self.config.enabled = !events.is_empty();
        self.config.events = events;
        let last = self.config.events.len().saturating_sub(1);
        self.current_event_idx = self.current_event_idx.min(last);
    }

    /// 历史中下标 idx 的消息被删除：章节起点之前少一条，起点跟着前移
    pub fn on_message_removed(&mut self, idx: usize) {
        if idx < self.chapter_start {
            self.chapter_start -= 1;
        }
    }

    /// 历史缩短（清空）后保持 chapter_start <= history_len
    pub fn clamp_chapter_start(&mut self, history_len: usize) {
        self.chapter_start = self.chapter_start.min(history_len);
    }

    pub fn status(&self, paused: bool) -> ScenarioStatus {
        ScenarioStatus {
            current_event_idx: self.current_event_idx,
            events: self.config.events.clone(),
            enabled: self.config.enabled,
            paused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_events() -> ScenarioConfig {
        ScenarioConfig {
            enabled: true,
            stage_type: StageType::ChatGroup,
            events: vec![
                ScenarioEvent {
                    time: "周一早上".into(),
                    description: "开会".into(),
                    goal: "定方案".into(),
                },
                ScenarioEvent {
                    time: "周一晚上".into(),
                    description: "聚餐".into(),
                    goal: String::new(),
                },
            ],
        }
    }

    #[test]
    fn test_event_accepts_capitalized_keys() {
        let e: ScenarioEvent =
            serde_json::from_str(r#"{"Time": "午夜", "Event": "停电", "Goal": "找到电闸"}"#).unwrap();
        assert_eq!(e.time, "午夜");
        assert_eq!(e.description, "停电");
        let lower: ScenarioEvent = serde_json::from_str(r#"{"time": "午夜", "event": "停电"}"#).unwrap();
        assert_eq!(lower.description, "停电");
        assert!(lower.goal.is_empty());
    }

    #[test]
    fn test_stage_type_unknown_rejected() {
        let ok: StageType = serde_json::from_str(r#""辩论赛""#).unwrap();
        assert_eq!(ok, StageType::Debate);
        assert!(serde_json::from_str::<StageType>(r#""卡拉OK""#).is_err());
    }

    #[test]
    fn test_evaluate_threshold_and_final() {
        let mut s = Scenario::new(two_events(), 3);
        assert_eq!(s.evaluate(2), Progress::Continue);
        assert_eq!(s.evaluate(3), Progress::Advance);
        let next = s.advance(3).cloned().unwrap();
        assert_eq!(next.time, "周一晚上");
        assert_eq!(s.chapter_start(), 3);
        assert_eq!(s.evaluate(5), Progress::Continue);
        assert_eq!(s.evaluate(6), Progress::Finished);
        assert!(s.advance(6).is_none());
        assert_eq!(s.current_idx(), 1);
    }

    #[test]
    fn test_force_guard_against_double_advance() {
        let mut s = Scenario::new(two_events(), 15);
        assert_eq!(s.check_force(0), Err(ForceSkip::NoNewMessages));
        assert_eq!(s.check_force(2), Ok(()));
        s.advance(2);
        assert_eq!(s.check_force(2), Err(ForceSkip::NoNewMessages));
        assert_eq!(s.check_force(4), Err(ForceSkip::FinalEvent));
    }

    #[test]
    fn test_jump_and_replace_events() {
        let mut s = Scenario::new(two_events(), 15);
        s.advance(4);
        s.jump(0, 7).unwrap();
        assert_eq!(s.current_idx(), 0);
        assert_eq!(s.chapter_start(), 7);
        assert!(s.jump(5, 7).is_err());

        s.advance(8);
        s.replace_events(vec![ScenarioEvent::default()]);
        assert_eq!(s.current_idx(), 0);
        s.replace_events(Vec::new());
        assert!(!s.is_enabled());
        assert_eq!(s.evaluate(100), Progress::Idle);
    }

    #[test]
    fn test_clamp_after_history_shrinks() {
        let mut s = Scenario::new(two_events(), 15);
        s.advance(5);
        s.clamp_chapter_start(4);
        assert_eq!(s.chapter_start(), 4);
        assert!(s.is_fresh_chapter(4));
    }
}
