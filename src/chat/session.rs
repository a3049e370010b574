//! 群聊会话：共享状态、指令落地、剧本推进与运行生命周期
//!
//! - 全部可变状态放在一把 `RwLock<SessionState>` 里；修改历史时持锁且不跨 await
//! - 章节推进由 `advance_guard` 串行化，是唯一跨 await 持锁的区段
//! - 每轮运行一枚停止令牌，成员循环见 [`crate::chat::turn`]
//! - 推理片段经有界 mpsc 通道汇入事件总线

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::chat::action::{ActionCommand, Interpretation};
use crate::chat::agent::{is_silence, Agent, Sampling};
use crate::chat::auction::{Auction, BidOutcome};
use crate::chat::events::{ChatEvent, GroupInfo, MemberInfo};
use crate::chat::history::{ChatMessage, History, MessageKind, Quote};
use crate::chat::pacing::{DecisionContext, PacingPolicy};
use crate::chat::prompt::{PersonaContext, Roster};
use crate::chat::scenario::{
    ForceSkip, Progress, Scenario, ScenarioConfig, ScenarioEvent, ScenarioStatus,
};
use crate::chat::turn;
use crate::config::AppConfig;
use crate::core::{ChatError, SessionSupervisor};
use crate::llm::{LlmClient, LlmError, RetryConfig, RetryingLlmClient, ThoughtSender};
use crate::memory::{AgentIdentity, DynamicMemory, MemberConfig, MemberConfigPatch, MemoryKind};

const EVENT_BUFFER: usize = 1024;

/// 会话运行参数（由 AppConfig 展开）
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub human_name: String,
    pub director_name: String,
    pub silence_token: String,
    pub min_reply_chars: usize,
    pub context_window: usize,
    pub pacing: PacingPolicy,
    pub messages_per_event: usize,
    pub memory_cap: usize,
    pub default_group_name: String,
    pub sampling: Sampling,
    pub retry: RetryConfig,
    pub thought_buffer: usize,
}

impl SessionSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            human_name: cfg.chat.human_name.clone(),
            director_name: cfg.chat.director_name.clone(),
            silence_token: cfg.chat.silence_token.clone(),
            min_reply_chars: cfg.chat.min_reply_chars,
            context_window: cfg.chat.context_window,
            pacing: cfg.chat.pacing.clone(),
            messages_per_event: cfg.scenario.messages_per_event,
            memory_cap: cfg.scenario.memory_cap,
            default_group_name: cfg.server.default_group_name.clone(),
            sampling: Sampling::from(&cfg.llm),
            retry: cfg.llm.retry.clone(),
            thought_buffer: cfg.llm.thought_buffer,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// setup 时的一个成员
pub struct AgentSpec {
    pub key: String,
    pub client: Arc<dyn LlmClient>,
    pub config: MemberConfig,
}

/// 成员循环每轮看到的局面
#[derive(Debug, Clone)]
pub struct Observation {
    pub nickname: String,
    pub is_manager: bool,
    pub chapter_fresh: bool,
    pub manager_can_open: bool,
    pub human_typing: bool,
    pub last: Option<(String, String)>,
}

impl Observation {
    pub fn last_len_chars(&self) -> usize {
        self.last.as_ref().map(|(_, c)| c.chars().count()).unwrap_or(0)
    }

    pub fn context<'a>(&'a self, me: &'a str) -> DecisionContext<'a> {
        DecisionContext {
            me,
            my_nickname: &self.nickname,
            is_manager: self.is_manager,
            chapter_fresh: self.chapter_fresh,
            manager_can_open: self.manager_can_open,
            last: self.last.as_ref().map(|(a, c)| (a.as_str(), c.as_str())),
        }
    }
}

/// 会话共享状态
pub struct SessionState {
    pub history: History,
    pub scenario: Scenario,
    pub auction: Auction,
    pub group_name: String,
    /// 当前在群里的成员（模型标识，按加入顺序）
    pub members: Vec<String>,
    /// 成员设定（含历史上配置过、当前不在群里的成员）
    pub member_configs: BTreeMap<String, MemberConfig>,
    pub memories: BTreeMap<String, DynamicMemory>,
    pub human_typing: bool,
    pub typing: BTreeSet<String>,
    pub running: bool,
    generation: u64,
}

impl SessionState {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            history: History::new(),
            scenario: Scenario::disabled(settings.messages_per_event),
            auction: Auction::default(),
            group_name: settings.default_group_name.clone(),
            members: Vec::new(),
            member_configs: BTreeMap::new(),
            memories: BTreeMap::new(),
            human_typing: false,
            typing: BTreeSet::new(),
            running: false,
            generation: 0,
        }
    }

    pub fn nickname(&self, key: &str) -> String {
        self.member_configs
            .get(key)
            .and_then(|c| c.nickname.clone())
            .unwrap_or_else(|| key.to_string())
    }

    pub fn roster(&self) -> Roster {
        Roster::new(
            self.members
                .iter()
                .map(|k| (k.clone(), self.nickname(k))),
        )
    }

    pub fn is_manager(&self, key: &str) -> bool {
        self.member_configs
            .get(key)
            .map(|c| c.is_manager)
            .unwrap_or(false)
    }

    /// 群里有群主，且最后发言的不是（全部）群主
    pub fn manager_can_open(&self) -> bool {
        let last = self.history.last().map(|m| m.author.as_str());
        self.members
            .iter()
            .any(|k| self.is_manager(k) && Some(k.as_str()) != last)
    }

    pub fn identity(&self, key: &str) -> AgentIdentity {
        let config = self.member_configs.get(key).cloned().unwrap_or_default();
        match self.memories.get(key) {
            Some(memory) => AgentIdentity::new(key, &config, memory),
            None => AgentIdentity::new(key, &config, &DynamicMemory::new(1)),
        }
    }

    fn avatar(&self, key: &str) -> Option<String> {
        self.member_configs.get(key).map(|c| c.avatar.clone())
    }

    fn last_author_is(&self, key: &str) -> bool {
        self.history.last().map(|m| m.author == key).unwrap_or(false)
    }

    /// 追加到历史，返回实际写入的消息（ts 可能被顺延）
    fn append(&mut self, mut msg: ChatMessage) -> ChatMessage {
        msg.ts = self.history.push(msg.clone());
        msg
    }

    fn push(&mut self, msg: ChatMessage) -> ChatEvent {
        ChatEvent::Message {
            message: self.append(msg),
        }
    }

    /// 把解释好的回复落到共享状态上，返回要广播的事件
    ///
    /// 追加类动作在这里再次检查“最后发言者不是自己”，拍一拍与撤回不受此限。
    pub fn apply_action(
        &mut self,
        actor: &str,
        interp: Interpretation,
        settings: &SessionSettings,
    ) -> Vec<ChatEvent> {
        let appends = match &interp {
            Interpretation::Discard => return Vec::new(),
            Interpretation::Plain(_) => true,
            Interpretation::Command(cmd) => !matches!(
                cmd,
                ActionCommand::Pat { .. } | ActionCommand::Recall {}
            ),
        };
        if appends && self.last_author_is(actor) {
            tracing::debug!("[{}] dropped reply: already the last speaker", actor);
            return Vec::new();
        }

        let avatar = self.avatar(actor);
        let silent = |text: &str| is_silence(text, &settings.silence_token, settings.min_reply_chars);

        match interp {
            Interpretation::Discard => Vec::new(),
            Interpretation::Plain(text) => {
                if silent(&text) {
                    return Vec::new();
                }
                vec![self.push(ChatMessage::text(actor, text.trim()).with_avatar(avatar))]
            }
            Interpretation::Command(cmd) => match cmd {
                ActionCommand::Quote {
                    quote_text,
                    quote_user,
                    content,
                } => {
                    if silent(&content) {
                        return Vec::new();
                    }
                    let roster = self.roster();
                    let mut msg = ChatMessage::text(actor, content.trim()).with_avatar(avatar);
                    if roster.is_self(actor, &quote_user) {
                        tracing::debug!("[{}] self-quote demoted to plain text", actor);
                    } else {
                        msg = msg.with_quote(Quote {
                            user: roster.nick(quote_user.trim()).to_string(),
                            text: quote_text,
                        });
                    }
                    vec![self.push(msg)]
                }
                ActionCommand::Pat { target } => {
                    let to_user = target
                        .filter(|t| !t.trim().is_empty())
                        .unwrap_or_else(|| settings.human_name.clone());
                    tracing::info!("[{}] patted {}", actor, to_user);
                    vec![ChatEvent::Pat {
                        from_user: actor.to_string(),
                        to_user,
                    }]
                }
                ActionCommand::Recall {} => match self.history.remove_last_by(actor) {
                    Some((idx, removed)) => {
                        self.scenario.on_message_removed(idx);
                        tracing::info!("[{}] recalled a message", actor);
                        vec![ChatEvent::Recall {
                            from_user: actor.to_string(),
                            msg_id: removed.ts,
                        }]
                    }
                    None => Vec::new(),
                },
                ActionCommand::Image { description } => {
                    let desc = description
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or_else(|| "image".to_string());
                    let msg = ChatMessage::text(actor, format!("[图片: {}]", desc))
                        .with_image(desc)
                        .with_avatar(avatar);
                    vec![self.push(msg)]
                }
                ActionCommand::Bid { price, reason } => {
                    match self.auction.bid(actor, price, &reason) {
                        BidOutcome::Accepted { price } => {
                            let msg = ChatMessage::text(actor, format!("💸 [出价] {} - {}", price, reason))
                                .with_kind(MessageKind::Bid)
                                .with_price(price)
                                .with_avatar(avatar);
                            let nick = self.nickname(actor);
                            vec![
                                self.push(msg),
                                ChatEvent::system(format!(
                                    "当前最高价更新: {} (出价人: {})",
                                    price, nick
                                )),
                            ]
                        }
                        BidOutcome::TooLow { price, .. } => {
                            let msg = ChatMessage::text(actor, format!("(低价无效) 我想出 {}，但是...", price))
                                .with_avatar(avatar);
                            vec![self.push(msg)]
                        }
                        BidOutcome::Ignored => {
                            tracing::debug!("[{}] bid ignored", actor);
                            Vec::new()
                        }
                    }
                }
                ActionCommand::Hammer { winner, price } => {
                    let Some(settlement) = self.auction.hammer(actor, winner, price) else {
                        tracing::debug!("[{}] hammer ignored", actor);
                        return Vec::new();
                    };
                    let winner = settlement
                        .winner
                        .as_deref()
                        .map(|w| self.nickname(w))
                        .unwrap_or_else(|| "无人".to_string());
                    tracing::info!(
                        "Auction settled: {} -> {} at {}",
                        settlement.item,
                        winner,
                        settlement.price
                    );
                    let msg = ChatMessage::text(actor, settlement.hammer_line(&winner))
                        .with_kind(MessageKind::Hammer)
                        .with_price(settlement.price)
                        .with_avatar(avatar);
                    vec![
                        self.push(msg),
                        ChatEvent::system(settlement.closing_notice(&winner)),
                    ]
                }
            },
        }
    }
}

pub struct GroupSession {
    room_id: String,
    settings: SessionSettings,
    state: RwLock<SessionState>,
    agents: RwLock<Vec<Arc<Agent>>>,
    supervisor: SessionSupervisor,
    advance_guard: Mutex<()>,
    events: broadcast::Sender<ChatEvent>,
    thoughts: ThoughtSender,
    /// 当前运行的收尾任务：等所有成员循环退出后复位 running
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl GroupSession {
    /// 创建会话并启动推理片段转发任务
    pub fn new(room_id: impl Into<String>, settings: SessionSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (thoughts, mut rx) = mpsc::channel(settings.thought_buffer.max(1));
        let bus = events.clone();
        tokio::spawn(async move {
            while let Some(thought) = rx.recv().await {
                let _ = bus.send(ChatEvent::from(thought));
            }
        });

        Arc::new(Self {
            room_id: room_id.into(),
            state: RwLock::new(SessionState::new(&settings)),
            settings,
            agents: RwLock::new(Vec::new()),
            supervisor: SessionSupervisor::new(),
            advance_guard: Mutex::new(()),
            events,
            thoughts,
            watcher: Mutex::new(None),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: ChatEvent) {
        // 没有观察者时发送失败，忽略
        let _ = self.events.send(event);
    }

    fn publish_all(&self, events: Vec<ChatEvent>) {
        for e in events {
            self.publish(e);
        }
    }

    // ---- 配置 ----

    /// 恢复落盘的群名与成员设定（房间创建时调用）
    pub async fn restore(&self, group_name: String, member_configs: BTreeMap<String, MemberConfig>) {
        let mut st = self.state.write().await;
        if !group_name.trim().is_empty() {
            st.group_name = group_name;
        }
        st.member_configs = member_configs;
    }

    /// 重新组建成员；正在运行时先停止
    pub async fn configure(
        &self,
        specs: Vec<AgentSpec>,
        scenario: Option<ScenarioConfig>,
        group_name: Option<String>,
    ) {
        self.stop().await;

        let agents: Vec<Arc<Agent>> = specs
            .iter()
            .map(|s| {
                let llm = RetryingLlmClient::new(s.client.clone(), self.settings.retry.clone())
                    .with_thoughts(s.key.clone(), self.thoughts.clone());
                Arc::new(Agent::new(s.key.clone(), llm, self.settings.sampling))
            })
            .collect();

        {
            let mut st = self.state.write().await;
            if let Some(name) = group_name.filter(|n| !n.trim().is_empty()) {
                st.group_name = name;
            }
            st.members = specs.iter().map(|s| s.key.clone()).collect();
            st.memories.clear();
            for spec in specs {
                st.memories
                    .insert(spec.key.clone(), DynamicMemory::new(self.settings.memory_cap));
                st.member_configs.insert(spec.key, spec.config);
            }
            st.scenario = match scenario {
                Some(cfg) => Scenario::new(cfg, self.settings.messages_per_event),
                None => Scenario::disabled(self.settings.messages_per_event),
            };
            st.auction = Auction::default();
            st.typing.clear();
            tracing::info!(
                "[{}] configured {} members (scenario: {})",
                self.room_id,
                st.members.len(),
                st.scenario.is_enabled()
            );
        }
        *self.agents.write().await = agents;
    }

    /// 部分更新群名与成员设定（只更新已知成员），广播 settings_updated
    pub async fn update_settings(
        &self,
        group_name: Option<String>,
        patches: Option<BTreeMap<String, MemberConfigPatch>>,
    ) -> ChatEvent {
        let event = {
            let mut st = self.state.write().await;
            if let Some(name) = group_name.filter(|n| !n.trim().is_empty()) {
                st.group_name = name;
            }
            for (key, patch) in patches.unwrap_or_default() {
                match st.member_configs.get_mut(&key) {
                    Some(cfg) => cfg.apply(patch),
                    None => tracing::debug!("[{}] settings for unknown member {} ignored", self.room_id, key),
                }
            }
            ChatEvent::SettingsUpdated {
                group_name: st.group_name.clone(),
                member_configs: st.member_configs.clone(),
            }
        };
        self.publish(event.clone());
        event
    }

    pub async fn set_group_name(&self, name: impl Into<String>) -> ChatEvent {
        self.update_settings(Some(name.into()), None).await
    }

    // ---- 查询 ----

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.state.read().await.history.messages().to_vec()
    }

    pub async fn group_name(&self) -> String {
        self.state.read().await.group_name.clone()
    }

    pub async fn member_configs(&self) -> BTreeMap<String, MemberConfig> {
        self.state.read().await.member_configs.clone()
    }

    pub async fn memory(&self, key: &str) -> Option<DynamicMemory> {
        self.state.read().await.memories.get(key).cloned()
    }

    pub async fn auction(&self) -> Auction {
        self.state.read().await.auction.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn is_paused(&self) -> bool {
        self.supervisor.is_paused().await
    }

    pub async fn status_event(&self) -> ChatEvent {
        let st = self.state.read().await;
        ChatEvent::Status {
            is_running: st.running,
            member_count: st.members.len() + 1,
            group_info: Some(GroupInfo {
                name: st.group_name.clone(),
            }),
        }
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len() + 1
    }

    pub async fn scenario_snapshot(&self) -> ScenarioStatus {
        let paused = self.supervisor.is_paused().await;
        self.state.read().await.scenario.status(paused)
    }

    pub async fn scenario_status(&self) -> ChatEvent {
        ChatEvent::ScenarioStatus(self.scenario_snapshot().await)
    }

    /// 成员列表：人类观察者排第一
    pub async fn members_event(&self) -> ChatEvent {
        let st = self.state.read().await;
        let mut members = vec![MemberInfo {
            name: self.settings.human_name.clone(),
            nickname: self.settings.human_name.clone(),
            avatar: String::new(),
            is_manager: true,
            is_user: true,
        }];
        for key in &st.members {
            let cfg = st.member_configs.get(key).cloned().unwrap_or_default();
            members.push(MemberInfo {
                name: key.clone(),
                nickname: st.nickname(key),
                avatar: cfg.avatar,
                is_manager: cfg.is_manager,
                is_user: false,
            });
        }
        ChatEvent::Members {
            members,
            group_name: st.group_name.clone(),
        }
    }

    // ---- 人类与导演 ----

    /// 人类观察者发言
    pub async fn post_human(&self, name: Option<String>, content: &str) -> ChatMessage {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.settings.human_name.clone());
        self.post_as_human(name, content).await
    }

    /// 导演注入剧情事件
    pub async fn inject_event(&self, content: &str) -> ChatMessage {
        tracing::info!("[{}] director injected an event", self.room_id);
        self.post_as_human(self.settings.director_name.clone(), content).await
    }

    async fn post_as_human(&self, name: String, content: &str) -> ChatMessage {
        let msg = {
            let mut st = self.state.write().await;
            let avatar = st.avatar(&name);
            st.append(ChatMessage::human(name, content).with_avatar(avatar))
        };
        self.publish(ChatEvent::Message {
            message: msg.clone(),
        });
        msg
    }

    pub async fn set_human_typing(&self, typing: bool) {
        self.state.write().await.human_typing = typing;
    }

    pub async fn pause(&self) {
        self.supervisor.set_paused(true).await;
        tracing::info!("[{}] paused", self.room_id);
        let status = self.scenario_status().await;
        self.publish(status);
    }

    pub async fn resume(&self) {
        self.supervisor.set_paused(false).await;
        tracing::info!("[{}] resumed", self.room_id);
        let status = self.scenario_status().await;
        self.publish(status);
    }

    // ---- 拍卖 ----

    pub async fn open_auction(
        &self,
        item: &str,
        description: &str,
        starting_price: f64,
        auctioneer: &str,
    ) -> Result<(), ChatError> {
        if !starting_price.is_finite() || starting_price < 0.0 {
            return Err(ChatError::Auction(format!("invalid starting price: {}", starting_price)));
        }
        let notice = {
            let mut st = self.state.write().await;
            if !st.members.iter().any(|m| m == auctioneer) {
                return Err(ChatError::Auction(format!("unknown auctioneer: {}", auctioneer)));
            }
            st.auction.open(item, description, starting_price, auctioneer);
            let display = st.nickname(auctioneer);
            st.auction.announcement(&display)
        };
        self.publish(ChatEvent::system(notice));
        Ok(())
    }

    pub async fn close_auction(&self) -> Result<(), ChatError> {
        let notice = {
            let mut st = self.state.write().await;
            let settlement = st
                .auction
                .close()
                .ok_or_else(|| ChatError::Auction("no auction in progress".to_string()))?;
            let winner = settlement
                .winner
                .as_deref()
                .map(|w| st.nickname(w))
                .unwrap_or_else(|| "无人".to_string());
            settlement.closing_notice(&winner)
        };
        self.publish(ChatEvent::system(notice));
        Ok(())
    }

    // ---- 剧本 ----

    /// 运维跳转章节
    pub async fn jump(&self, idx: usize) -> Result<(), ChatError> {
        let _guard = self.advance_guard.lock().await;
        {
            let mut st = self.state.write().await;
            let len = st.history.len();
            st.scenario.jump(idx, len)?;
        }
        tracing::info!("[{}] jumped to event {}", self.room_id, idx);
        let status = self.scenario_status().await;
        self.publish(status);
        Ok(())
    }

    /// 导演整体替换章节列表
    pub async fn replace_events(&self, events: Vec<ScenarioEvent>) {
        let _guard = self.advance_guard.lock().await;
        self.state.write().await.scenario.replace_events(events);
        let status = self.scenario_status().await;
        self.publish(status);
    }

    /// 每轮观察时调用：达到阈值则推进（或结束）并停止本轮运行
    pub async fn check_and_advance(&self) -> Progress {
        let _guard = self.advance_guard.lock().await;
        let progress = {
            let st = self.state.read().await;
            st.scenario.evaluate(st.history.len())
        };
        match progress {
            Progress::Idle | Progress::Continue => {}
            Progress::Finished => {
                let token = self.supervisor.run_token().await;
                if !token.is_cancelled() {
                    tracing::info!("[{}] final chapter reached its goal, stopping", self.room_id);
                    self.publish(ChatEvent::system(
                        "SCENARIO_END: 剧本所有章节已结束，正在收敛对话...",
                    ));
                    token.cancel();
                }
            }
            Progress::Advance => {
                self.publish(ChatEvent::system(
                    "SCENARIO_UPDATE: 章节目标达成，自动暂停，准备进入下一章节...",
                ));
                if let Some(next) = self.transition().await {
                    self.publish(ChatEvent::system(format!(
                        "SCENARIO_UPDATE: 已切换至新章节 - {}。等待用户重新启动。",
                        or_unknown(&next.time)
                    )));
                }
                self.supervisor.cancel().await;
            }
        }
        progress
    }

    /// 手动结束当前章节（stop 之后调用）
    pub async fn force_advance(&self) -> Result<(), ForceSkip> {
        let _guard = self.advance_guard.lock().await;
        let check = {
            let st = self.state.read().await;
            st.scenario.check_force(st.history.len())
        };
        match check {
            Err(ForceSkip::NoNewMessages) => {
                self.publish(ChatEvent::system("SCENARIO: 当前章节尚未开始或刚切换，跳过强制推进。"));
                return check;
            }
            Err(ForceSkip::FinalEvent) => {
                self.publish(ChatEvent::system("SCENARIO: 已是最后章节，无法强制推进。"));
                return check;
            }
            Err(_) => return check,
            Ok(()) => {}
        }
        self.publish(ChatEvent::system("SCENARIO_MANUAL: 用户强制结束当前章节..."));
        if let Some(next) = self.transition().await {
            self.publish(ChatEvent::system(format!(
                "SCENARIO_UPDATE: 已切换至新章节 - {}",
                or_unknown(&next.time)
            )));
        }
        Ok(())
    }

    /// 章节切换：并行总结 → 推进下标 → 并行行动方针 → 广播剧本状态
    ///
    /// 调用方必须持有 advance_guard。
    async fn transition(&self) -> Option<ScenarioEvent> {
        let agents = self.agents.read().await.clone();
        let (chapter, roster, boundary) = {
            let st = self.state.read().await;
            (
                st.history.since(st.scenario.chapter_start()).to_vec(),
                st.roster(),
                st.history.len(),
            )
        };

        let chapter_ref = &chapter;
        let roster_ref = &roster;
        let summaries = join_all(agents.iter().map(|agent| async move {
            let nick = roster_ref.nick(agent.key()).to_string();
            let result = agent.summarize_chapter(&nick, chapter_ref, roster_ref).await;
            (agent.key().to_string(), result)
        }))
        .await;

        let (next, memories) = {
            let mut st = self.state.write().await;
            let notes = self.record_memories(&mut st, summaries, MemoryKind::Summary);
            self.publish_all(notes);
            let len = boundary.min(st.history.len());
            let next = st.scenario.advance(len).cloned();
            let memories: Vec<(String, String)> = agents
                .iter()
                .map(|a| {
                    let rendered = st
                        .memories
                        .get(a.key())
                        .map(|m| m.render())
                        .unwrap_or_default();
                    (a.key().to_string(), rendered)
                })
                .collect();
            (next, memories)
        };

        let next = next?;
        tracing::info!(
            "[{}] advanced to chapter: {}",
            self.room_id,
            or_unknown(&next.time)
        );

        let next_ref = &next;
        let memories_ref = &memories;
        let policies = join_all(agents.iter().map(|agent| async move {
            let nick = roster_ref.nick(agent.key()).to_string();
            let memory = memories_ref
                .iter()
                .find(|(k, _)| k == agent.key())
                .map(|(_, m)| m.as_str())
                .unwrap_or("");
            let result = agent.plan_next_chapter(&nick, memory, next_ref).await;
            (agent.key().to_string(), result)
        }))
        .await;

        {
            let mut st = self.state.write().await;
            let notes = self.record_memories(&mut st, policies, MemoryKind::Policy);
            self.publish_all(notes);
        }

        let status = self.scenario_status().await;
        self.publish(status);
        Some(next)
    }

    fn record_memories(
        &self,
        st: &mut SessionState,
        results: Vec<(String, Result<String, LlmError>)>,
        kind: MemoryKind,
    ) -> Vec<ChatEvent> {
        let cap = self.settings.memory_cap;
        let mut notes = Vec::new();
        for (key, result) in results {
            let (ok_note, err_note) = match kind {
                MemoryKind::Summary => ("记忆已更新", "记忆总结失败"),
                MemoryKind::Policy => ("行动方针已生成并存入记忆库", "后台思考失败"),
            };
            match result {
                Ok(text) => {
                    st.memories
                        .entry(key.clone())
                        .or_insert_with(|| DynamicMemory::new(cap))
                        .push(kind, text);
                    notes.push(ChatEvent::system(format!("[{}] {}", key, ok_note)));
                }
                Err(e) => {
                    tracing::warn!("[{}] {:?} consolidation failed for {}: {}", self.room_id, kind, key, e);
                    notes.push(ChatEvent::system(format!("[{}] {}: {}", key, err_note, e)));
                }
            }
        }
        notes
    }

    // ---- 成员循环使用 ----

    pub async fn observe(&self, key: &str) -> Observation {
        let st = self.state.read().await;
        Observation {
            nickname: st.nickname(key),
            is_manager: st.is_manager(key),
            chapter_fresh: st.scenario.is_fresh_chapter(st.history.len()),
            manager_can_open: st.manager_can_open(),
            human_typing: st.human_typing,
            last: st
                .history
                .last()
                .map(|m| (m.author.clone(), m.content.clone())),
        }
    }

    pub async fn last_author_is(&self, key: &str) -> bool {
        self.state.read().await.last_author_is(key)
    }

    pub async fn set_typing(&self, key: &str, typing: bool) {
        let models = {
            let mut st = self.state.write().await;
            if typing {
                st.typing.insert(key.to_string());
            } else {
                st.typing.remove(key);
            }
            st.typing.iter().cloned().collect()
        };
        self.publish(ChatEvent::Typing { models });
    }

    /// 用快照组 Prompt 并请求回复；请求期间不持锁
    pub async fn compose(&self, agent: &Agent) -> Result<String, LlmError> {
        let (identity, roster, group_name, stage, briefing, auction, recent) = {
            let st = self.state.read().await;
            (
                st.identity(agent.key()),
                st.roster(),
                st.group_name.clone(),
                st.scenario.stage_type(),
                st.scenario.current_event().cloned(),
                st.auction.clone(),
                st.history.recent(self.settings.context_window).to_vec(),
            )
        };
        let persona = PersonaContext {
            identity: &identity,
            roster: &roster,
            group_name: &group_name,
            human_name: &self.settings.human_name,
            silence_token: &self.settings.silence_token,
            stage,
            briefing: briefing.as_ref(),
            auction: &auction,
        };
        agent.compose_reply(&persona, &recent).await
    }

    /// 提交一条解释好的回复；返回是否产生了事件
    pub async fn commit(&self, actor: &str, interp: Interpretation) -> bool {
        let events = {
            let mut st = self.state.write().await;
            st.apply_action(actor, interp, &self.settings)
        };
        let produced = !events.is_empty();
        self.publish_all(events);
        produced
    }

    // ---- 运行生命周期 ----

    /// 启动所有成员循环；已在运行时返回 Ok(false)
    pub async fn start(self: &Arc<Self>) -> Result<bool, ChatError> {
        let agents = self.agents.read().await.clone();
        if agents.is_empty() {
            return Err(ChatError::NoAgents);
        }
        let mut watcher = self.watcher.lock().await;
        let generation = {
            let mut st = self.state.write().await;
            if st.running {
                return Ok(false);
            }
            st.running = true;
            st.generation += 1;
            st.generation
        };
        let token = self.supervisor.begin_run().await;
        tracing::info!("[{}] starting {} member loops", self.room_id, agents.len());

        let handles: Vec<JoinHandle<()>> = agents
            .into_iter()
            .map(|agent| tokio::spawn(turn::run_member_loop(self.clone(), agent, token.clone())))
            .collect();

        let session = self.clone();
        *watcher = Some(tokio::spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!("[{}] member loop ended abnormally: {}", session.room_id, e);
                }
            }
            session.finish_run(generation).await;
        }));
        drop(watcher);

        let status = self.status_event().await;
        self.publish(status);
        Ok(true)
    }

    async fn finish_run(&self, generation: u64) {
        let changed = {
            let mut st = self.state.write().await;
            if st.generation == generation && st.running {
                st.running = false;
                st.typing.clear();
                true
            } else {
                false
            }
        };
        if changed {
            tracing::info!("[{}] run finished", self.room_id);
            self.publish(ChatEvent::Typing { models: Vec::new() });
            let status = self.status_event().await;
            self.publish(status);
        }
    }

    /// 停止并等待所有成员循环退出
    pub async fn stop(&self) {
        self.supervisor.cancel().await;
        let handle = self.watcher.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let was_running = {
            let mut st = self.state.write().await;
            let was = st.running;
            st.running = false;
            st.typing.clear();
            was
        };
        if was_running {
            tracing::info!("[{}] stopped", self.room_id);
        }
        let status = self.status_event().await;
        self.publish(status);
    }

    /// 清空历史
    pub async fn clear(&self) {
        {
            let mut st = self.state.write().await;
            st.history.clear();
            st.scenario.clamp_chapter_start(0);
        }
        self.publish(ChatEvent::History {
            messages: Vec::new(),
        });
    }

    /// 停止并清空
    pub async fn reset(&self) {
        self.stop().await;
        self.clear().await;
    }
}

fn or_unknown(s: &str) -> &str {
    if s.trim().is_empty() {
        "未知时间"
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::action::interpret;
    use crate::llm::MockLlmClient;

    fn state_with(members: &[(&str, &str)]) -> SessionState {
        let settings = SessionSettings::default();
        let mut st = SessionState::new(&settings);
        for (key, nick) in members {
            st.members.push(key.to_string());
            st.member_configs.insert(
                key.to_string(),
                MemberConfig {
                    nickname: Some(nick.to_string()),
                    ..Default::default()
                },
            );
        }
        st
    }

    #[test]
    fn test_no_self_chaining() {
        let settings = SessionSettings::default();
        let mut st = state_with(&[("a", "阿A"), ("b", "阿B")]);
        assert_eq!(st.apply_action("a", interpret("第一句"), &settings).len(), 1);
        assert!(st.apply_action("a", interpret("第二句"), &settings).is_empty());
        assert!(st
            .apply_action("a", interpret(r#"{"type": "image", "description": "猫"}"#), &settings)
            .is_empty());
        // 拍一拍不进历史，不受限制
        let pat = st.apply_action("a", interpret(r#"{"type": "pat"}"#), &settings);
        assert_eq!(
            pat,
            vec![ChatEvent::Pat {
                from_user: "a".into(),
                to_user: "Gaia".into()
            }]
        );
        assert_eq!(st.history.len(), 1);
    }

    #[test]
    fn test_silence_never_enters_history() {
        let settings = SessionSettings::default();
        let mut st = state_with(&[("a", "阿A")]);
        assert!(st.apply_action("a", interpret("[沉默]"), &settings).is_empty());
        assert!(st.apply_action("a", interpret("嗯"), &settings).is_empty());
        assert!(st.apply_action("a", Interpretation::Discard, &settings).is_empty());
        assert!(st.history.is_empty());
    }

    #[test]
    fn test_self_quote_demoted() {
        let settings = SessionSettings::default();
        let mut st = state_with(&[("a", "阿A"), ("b", "阿B")]);
        st.history.push(ChatMessage::text("b", "你好"));
        let raw = r#"{"type": "quote", "quote_text": "我之前说的", "quote_user": "阿A", "content": "补充一下"}"#;
        st.apply_action("a", interpret(raw), &settings);
        assert!(st.history.last().unwrap().quote.is_none());

        let raw = r#"{"type": "quote", "quote_text": "我之前说的", "quote_user": "a", "content": "我再说"}"#;
        st.apply_action("b", interpret(raw), &settings);
        let quote = st.history.last().unwrap().quote.clone().unwrap();
        assert_eq!(quote.user, "阿A");
    }

    #[test]
    fn test_recall_removes_own_latest_and_clamps_chapter() {
        let settings = SessionSettings::default();
        let mut st = state_with(&[("a", "阿A"), ("b", "阿B")]);
        st.scenario = Scenario::new(
            ScenarioConfig {
                enabled: true,
                events: vec![ScenarioEvent::default(), ScenarioEvent::default()],
                ..Default::default()
            },
            15,
        );
        st.history.push(ChatMessage::text("a", "a1"));
        st.history.push(ChatMessage::text("b", "b1"));
        st.history.push(ChatMessage::text("a", "a2"));
        st.scenario.advance(3);

        let events = st.apply_action("a", interpret(r#"{"type": "recall"}"#), &settings);
        assert!(matches!(events.as_slice(), [ChatEvent::Recall { .. }]));
        let left: Vec<&str> = st.history.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(left, vec!["a1", "b1"]);
        assert_eq!(st.scenario.chapter_start(), 2);

        assert!(st
            .apply_action("c", interpret(r#"{"type": "recall"}"#), &settings)
            .is_empty());
    }

    #[test]
    fn test_recall_from_earlier_chapter_keeps_current_chapter_intact() {
        let settings = SessionSettings::default();
        let mut st = state_with(&[("a", "阿A"), ("b", "阿B"), ("c", "阿C")]);
        st.scenario = Scenario::new(
            ScenarioConfig {
                enabled: true,
                events: vec![ScenarioEvent::default(), ScenarioEvent::default()],
                ..Default::default()
            },
            15,
        );
        st.history.push(ChatMessage::text("a", "a1"));
        st.history.push(ChatMessage::text("b", "b1"));
        st.history.push(ChatMessage::text("c", "c1"));
        st.scenario.advance(3);
        st.history.push(ChatMessage::text("b", "新章节 b2"));

        let events = st.apply_action("a", interpret(r#"{"type": "recall"}"#), &settings);
        assert!(matches!(events.as_slice(), [ChatEvent::Recall { .. }]));
        assert_eq!(st.scenario.chapter_start(), 2);
        let chapter: Vec<&str> = st
            .history
            .since(st.scenario.chapter_start())
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(chapter, vec!["新章节 b2"]);
        assert!(!st.scenario.is_fresh_chapter(st.history.len()));
    }

    #[test]
    fn test_bid_without_price_is_too_low() {
        let settings = SessionSettings::default();
        let mut st = state_with(&[("host", "拍卖师"), ("b", "阿B")]);
        st.auction.open("月光", "瓶装", 100.0, "host");

        let ev = st.apply_action("b", interpret(r#"{"type": "bid"}"#), &settings);
        assert_eq!(ev.len(), 1);
        assert_eq!(st.history.last().unwrap().content, "(低价无效) 我想出 0，但是...");
        assert_eq!(st.auction.current_price, 100.0);
        assert!(st.auction.highest_bidder.is_none());
    }

    #[test]
    fn test_bid_and_hammer_flow() {
        let settings = SessionSettings::default();
        let mut st = state_with(&[("host", "拍卖师"), ("b", "阿B"), ("c", "阿C")]);
        st.auction.open("月光", "瓶装", 100.0, "host");

        let ev = st.apply_action(
            "b",
            interpret(r#"{"type": "bid", "price": 150, "reason": "想要"}"#),
            &settings,
        );
        assert_eq!(ev.len(), 2);
        assert_eq!(st.history.last().unwrap().kind, MessageKind::Bid);
        assert_eq!(ev[1], ChatEvent::system("当前最高价更新: 150 (出价人: 阿B)"));

        st.apply_action("c", interpret(r#"{"type": "bid", "price": 120}"#), &settings);
        assert_eq!(st.history.last().unwrap().content, "(低价无效) 我想出 120，但是...");
        assert_eq!(st.auction.current_price, 150.0);

        // 非拍卖师落槌无效
        assert!(st
            .apply_action("b", interpret(r#"{"type": "hammer"}"#), &settings)
            .is_empty());

        let ev = st.apply_action("host", interpret(r#"{"type": "hammer"}"#), &settings);
        assert_eq!(ev.len(), 2);
        assert_eq!(
            st.history.last().unwrap().content,
            "🔨 [成交] 恭喜 阿B 以 150 拍得拍品！"
        );
        assert!(!st.auction.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_advance_happens_once() {
        let session = GroupSession::new("t", SessionSettings::default());
        let specs = vec![
            AgentSpec {
                key: "a".into(),
                client: Arc::new(MockLlmClient::new("a")),
                config: MemberConfig::default(),
            },
            AgentSpec {
                key: "b".into(),
                client: Arc::new(MockLlmClient::new("b")),
                config: MemberConfig::default(),
            },
        ];
        let scenario = ScenarioConfig {
            enabled: true,
            stage_type: Default::default(),
            events: vec![ScenarioEvent::default(), ScenarioEvent::default()],
        };
        session.configure(specs, Some(scenario), None).await;
        for i in 0..15 {
            session.post_human(None, &format!("消息 {}", i)).await;
        }

        let (p1, p2) = tokio::join!(session.check_and_advance(), session.check_and_advance());
        let mut outcomes = vec![p1, p2];
        outcomes.sort_by_key(|p| *p == Progress::Advance);
        assert_eq!(outcomes, vec![Progress::Continue, Progress::Advance]);

        for key in ["a", "b"] {
            let memory = session.memory(key).await.unwrap();
            assert_eq!(memory.count(MemoryKind::Summary), 1);
            assert_eq!(memory.count(MemoryKind::Policy), 1);
        }
        match session.scenario_status().await {
            ChatEvent::ScenarioStatus(s) => assert_eq!(s.current_event_idx, 1),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(session.force_advance().await, Err(ForceSkip::NoNewMessages));
    }

    #[tokio::test]
    async fn test_start_without_agents_fails() {
        let session = GroupSession::new("t", SessionSettings::default());
        assert!(matches!(session.start().await, Err(ChatError::NoAgents)));
    }
}
