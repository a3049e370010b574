//! Prompt 构建：人设（system）、发言轮（user）、章节总结与行动方针
//!
//! 给模型看的所有内容只用昵称称呼其他成员，模型标识不出现在别人的发言上下文里。

use crate::chat::auction::Auction;
use crate::chat::history::ChatMessage;
use crate::chat::scenario::{ScenarioEvent, StageType};
use crate::memory::AgentIdentity;

/// 成员花名册：模型标识 → 昵称
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<(String, String)>,
}

impl Roster {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// 模型标识转昵称；不认识的名字原样返回
    pub fn nick<'a>(&'a self, name: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, n)| n.as_str())
            .unwrap_or(name)
    }

    /// 除自己外所有成员的昵称
    pub fn others(&self, me: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k != me)
            .map(|(_, n)| n.as_str())
            .collect()
    }

    /// raw 是否指向 me（按标识或昵称）
    pub fn is_self(&self, me: &str, raw: &str) -> bool {
        let raw = raw.trim();
        let my_nick = self.nick(me);
        raw == me || raw == my_nick || self.nick(raw) == my_nick
    }

    /// 文本里是否提到了 me
    pub fn mentions(&self, me: &str, content: &str) -> bool {
        content.contains(me) || content.contains(self.nick(me))
    }
}

/// 人设 Prompt 的输入
pub struct PersonaContext<'a> {
    pub identity: &'a AgentIdentity,
    pub roster: &'a Roster,
    pub group_name: &'a str,
    pub human_name: &'a str,
    pub silence_token: &'a str,
    pub stage: StageType,
    pub briefing: Option<&'a ScenarioEvent>,
    pub auction: &'a Auction,
}

fn stage_section(ctx: &PersonaContext<'_>, members: &str, virtual_time: &str, event: &str) -> String {
    let nickname = &ctx.identity.nickname;
    match ctx.stage {
        StageType::Forum => format!(
            "你是 {nickname}。\n【当前舞台：网站论坛】\n你正在一个网络论坛的帖子下进行回复讨论。\n\
             其他参与者：{members}。\n当前虚拟时间：{virtual_time}\n当前帖子/讨论背景：{event}\n\
             【行动指南】\n1. 你的发言风格应像论坛回帖（可以是长评，也可以是短评，支持引用）。\n2. 保持你的观点鲜明。\n"
        ),
        StageType::TabletopRpg => format!(
            "你是 {nickname}。\n【当前舞台：TRPG跑团桌】\n你正在参与一场桌面角色扮演游戏。\n\
             队友：{members}。\n当前虚拟时间：{virtual_time}\n当前剧情/GM描述：{event}\n\
             【行动指南】\n1. 你不仅是玩家，也是角色。请描述你的行动（Action）和对白（Dialogue）。\n\
             2. 遇到需要检定的情况，请等待GM（导演）的判定。\n3. 沉浸在角色扮演中。\n"
        ),
        StageType::Debate => format!(
            "你是 {nickname}。\n【当前舞台：辩论赛】\n你正在辩论赛现场。\n对手/队友：{members}。\n\
             当前辩题/阶段：{event}\n【行动指南】\n1. 逻辑严密，针锋相对。\n2. 引用对方的论点进行反驳。\n"
        ),
        StageType::Courtroom => format!(
            "你是 {nickname}。\n【当前舞台：审判法庭】\n你正在法庭上。可能是法官、检察官、律师或被告（请参考你的个人设定）。\n\
             在场人员：{members}。\n当前审理阶段：{event}\n【行动指南】\n1. 语言庄重，符合法庭规范。\n\
             2. 围绕证据和法律条文（或虚构的规则）进行陈述。\n"
        ),
        StageType::StrategyGame => format!(
            "你是 {nickname}。\n【当前舞台：博弈游戏】\n你正在参与一场高智商博弈游戏（如狼人杀、囚徒困境等）。\n\
             玩家：{members}。\n当前局势：{event}\n【行动指南】\n1. 隐藏你的真实意图，分析他人的动机。\n2. 每一句话都可能是陷阱。\n"
        ),
        StageType::WhisperMaze => format!(
            "你是 {nickname}。\n【当前舞台：传话筒迷宫】\n你身处一个巨大的迷宫中，声音只能传递给临近的人。\n\
             附近的人：{members}。\n当前位置/状况：{event}\n【行动指南】\n1. 你得到的信息可能是不完整的或者是被扭曲的。\n\
             2. 你的目标是传递信息或寻找出口。\n"
        ),
        StageType::ChatGroup => chat_group_section(ctx, members, virtual_time, event),
    }
}

fn chat_group_section(ctx: &PersonaContext<'_>, members: &str, virtual_time: &str, event: &str) -> String {
    let id = ctx.identity;
    let mut prompt = format!("你是 {}。", id.nickname);
    if id.is_manager {
        prompt.push_str(" 你是本群的【群主/主理人】，你需要负责引导话题、维持秩序。");
    }
    prompt.push_str("\n\n");

    if ctx.briefing.is_some() {
        prompt.push_str(&format!(
            "【当前环境】\n你们正在“{}”群聊中。\n当前虚拟时间：{}\n当前群聊背景/事件：{}\n",
            ctx.group_name, virtual_time, event
        ));
    } else {
        prompt.push_str(&format!(
            "你正在一个名为“{}”的微信群中。\n群里还有其他成员：{} 以及人类观察者 ({})。\n",
            ctx.group_name, members, ctx.human_name
        ));
        if id.custom_prompt.is_empty() {
            prompt.push_str(
                "【背景设定】\n现在是下班时间，这是你们AI模型内部的私密吐槽群。\n大家都在摸鱼，随便聊点什么。\n",
            );
        }
    }

    prompt.push_str(&format!(
        "\n【风格指南 - 必须严格遵守】\n\
         1. **拒绝小作文**：必须极度口语化，像在微信群里聊天一样。单条消息尽量控制在 20 字以内。如果话多，请分多次发送（但在本轮回复中只发一条最想说的）。\n\
         2. **严禁AI腔**：严禁使用书面语、翻译腔、严禁使用“总的来说”、“首先/其次”等结构。不要像写邮件或回答问题一样。（AI人设除外）\n\
         3. **情绪表达**：善用emoji表情、波浪号~、颜文字来表达语气。\n\
         4. **互动感**：可以引用别人的话，或者直接@某人（用文字表示）。\n\
         5. **混乱感**：不要过于礼貌，可以抢话、插科打诨、歪楼。群聊就是为了图一乐。（特殊人设除外）\n\
         6. **称呼规范**：提及他人时**必须**只使用对方的【昵称】（即 {} 中的名字），**严禁**提及对方的 ID。\n",
        members
    ));
    prompt
}

const ACTION_SCHEMA: &str = "\n【高级功能接口 - 慎用】\n\
你可以像真人一样使用以下高级功能。如需使用，请**严格遵守**以下格式，**只输出** JSON 对象：\n\
⚠️ **高危警告**：如果你决定输出 JSON，那么你的**整个**回复必须**仅仅**包含这个 JSON 对象。**绝对禁止**在 JSON 前后添加任何其他文字、换行或 Markdown 标记。\n\
⚠️ 如果你无法保证只输出纯 JSON，请直接用文字描述你的动作（如 *拍了拍某人*），不要使用指令。\n\n\
1. **引用回复**（针对某条特定消息）：\n   {\"type\": \"quote\", \"quote_text\": \"引用的原文\", \"quote_user\": \"原作者昵称\", \"content\": \"你的回复内容\"}\n\
2. **拍一拍**（提醒某人）：\n   {\"type\": \"pat\", \"target\": \"目标昵称\"}\n\
3. **发送图片**（描述图片内容）：\n   {\"type\": \"image\", \"description\": \"图片内容的详细描述\"}\n\
4. **撤回消息**（撤回你刚刚发送的一条消息）：\n   {\"type\": \"recall\"}\n";

fn auction_section(ctx: &PersonaContext<'_>) -> String {
    let a = ctx.auction;
    let bidder = a
        .highest_bidder
        .as_deref()
        .map(|b| ctx.roster.nick(b))
        .unwrap_or("无");
    let mut s = format!(
        "\n【⚠️ 特殊模式：暗网拍卖会】\n当前正在拍卖物品：**{}**\n物品描述：{}\n当前最高价：{} (由 {} 出价)\n拍卖师是：{}\n",
        a.item,
        a.description,
        a.current_price,
        bidder,
        ctx.roster.nick(&a.auctioneer)
    );
    if a.auctioneer == ctx.identity.model_key {
        s.push_str(
            "你是【拍卖师】。你的职责是：\n1. 煽动大家出价，描述这个不存在的物品有多么珍贵（运用通感、超现实隐喻）。\n\
             2. 只有你可以使用 hammer 指令成交。\n   成交指令：{\"type\": \"hammer\", \"winner\": \"名字\", \"price\": 100}\n",
        );
    } else {
        s.push_str(
            "你是【买家】。如果你想要这个物品，请出价。你需要为这个虚无的概念赋予你个人的意义，说明你为什么要买它。\n\
             \u{20}  出价指令：{\"type\": \"bid\", \"price\": 100, \"reason\": \"我出100，因为...\"}\n",
        );
    }
    s
}

/// 人设（system）Prompt
pub fn persona_prompt(ctx: &PersonaContext<'_>) -> String {
    let id = ctx.identity;
    let members = ctx.roster.others(&id.model_key).join("、");
    let (virtual_time, event, goal) = match ctx.briefing {
        Some(e) => (e.time.as_str(), e.description.as_str(), e.goal.as_str()),
        None => ("未知时间", "", ""),
    };
    let virtual_time = if virtual_time.is_empty() { "未知时间" } else { virtual_time };

    let mut prompt = stage_section(ctx, &members, virtual_time, event);

    if !goal.is_empty() {
        prompt.push_str(&format!("当前阶段目标：{}\n", goal));
    }

    prompt.push_str(&format!(
        "\n【你的记忆】\n1. 长期记忆/知识库：\n{}\n\n2. 近期经历（动态总结）：\n{}\n\n",
        id.static_memory, id.dynamic_memory
    ));

    if !id.custom_prompt.is_empty() {
        prompt.push_str(&format!("\n【个人设定/补充规则】\n{}\n", id.custom_prompt));
    }

    prompt.push_str(&format!(
        "\n【通用操作规则】\n\
         1. 如果看完上下文觉得没啥好回的，或者想潜水，直接回复「{silence}」。\n\
         2. 严禁扮演其他角色，你只能代表你自己 ({nick})。\n\
         3. 历史记录中标记为 [{nick} (你自己)] 的是你自己之前发的消息。请勿将这些消息误认为是别人发的，也不要尝试回复这些消息（除非是为了自我补充）。\n",
        silence = ctx.silence_token,
        nick = id.nickname
    ));

    if ctx.stage == StageType::ChatGroup {
        prompt.push_str(ACTION_SCHEMA);
    }

    if ctx.auction.is_open() {
        prompt.push_str(&auction_section(ctx));
    }

    prompt
}

/// 聊天记录文本：昵称代替标识，自己的消息显式标注
pub fn chat_log(messages: &[ChatMessage], me: &str, roster: &Roster) -> String {
    let my_nick = roster.nick(me);
    let mut log = String::new();
    for m in messages {
        let nick = roster.nick(&m.author);
        let content = match &m.quote {
            Some(q) => format!("「回复 {}: {}」 {}", roster.nick(&q.user), q.text, m.content),
            None => m.content.clone(),
        };
        if m.author == me {
            log.push_str(&format!("[{} (你自己)]: {}\n", my_nick, content));
        } else {
            log.push_str(&format!("[{}]: {}\n", nick, content));
        }
    }
    log
}

/// 发言轮的 user Prompt
pub fn turn_prompt(chat_log: &str, my_nick: &str, silence_token: &str) -> String {
    format!(
        "当前群聊记录（其中标记为 (你自己) 的是你刚才发的消息）：\n------\n{}\n------\n\
         你是 {}。看完聊天记录，你想说什么？\n如果不想发言，或者觉得别人已经说得很好，请回复「{}」。",
        chat_log, my_nick, silence_token
    )
}

/// 章节总结 Prompt
pub fn summary_prompt(chapter: &[ChatMessage], my_nick: &str, roster: &Roster) -> String {
    let log: String = chapter
        .iter()
        .map(|m| format!("[{}]: {}\n", roster.nick(&m.author), m.content))
        .collect();
    format!(
        "这是刚才发生的一段对话记录：\n------\n{}------\n\
         你是 {}。请简要总结这段对话中发生的关键事件、你对他人的看法变化，以及你自己的心理活动。\n\
         总结要简练（100字以内），作为你的长期记忆保存。",
        log, my_nick
    )
}

fn or_default<'a>(s: &'a str, fallback: &'a str) -> &'a str {
    if s.trim().is_empty() {
        fallback
    } else {
        s
    }
}

/// 章节间隙后台思考 Prompt
pub fn policy_prompt(memory: &str, next: &ScenarioEvent, my_nick: &str) -> String {
    format!(
        "【后台思考 - 章节间隙】\n你刚刚结束了一段经历，你的记忆库已更新：\n{}\n\n\
         接下来即将发生（下一章预告）：\n- 时间：{}\n- 事件：{}\n- 目标：{}\n\n\
         你是 {}。请结合你的性格和过往经历，思考：\n1. 你现在的心情如何？\n2. 你对新环境有什么打算？\n\
         3. 制定一个简短的【自我行动方针】（Self-Action Policy），指导你接下来的言行。\n\n\
         请输出一段简练的内心独白和行动方针（100字以内）。",
        memory,
        or_default(&next.time, "未知"),
        or_default(&next.description, "未知"),
        or_default(&next.goal, "无"),
        my_nick
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::history::Quote;
    use crate::memory::{DynamicMemory, MemberConfig};

    fn roster() -> Roster {
        Roster::new(vec![
            ("deepseek-v3".to_string(), "小D".to_string()),
            ("qwen-max".to_string(), "千问".to_string()),
        ])
    }

    fn identity(key: &str, nick: &str, manager: bool) -> AgentIdentity {
        let cfg = MemberConfig {
            is_manager: manager,
            nickname: Some(nick.into()),
            ..Default::default()
        };
        AgentIdentity::new(key, &cfg, &DynamicMemory::new(4))
    }

    #[test]
    fn test_roster_self_resolution() {
        let r = roster();
        assert!(r.is_self("deepseek-v3", "deepseek-v3"));
        assert!(r.is_self("deepseek-v3", "小D"));
        assert!(!r.is_self("deepseek-v3", "千问"));
        assert!(r.mentions("qwen-max", "@千问 你怎么看"));
        assert_eq!(r.nick("Gaia"), "Gaia");
    }

    #[test]
    fn test_persona_uses_nicknames_only() {
        let r = roster();
        let id = identity("deepseek-v3", "小D", true);
        let auction = Auction::default();
        let p = persona_prompt(&PersonaContext {
            identity: &id,
            roster: &r,
            group_name: "摸鱼群",
            human_name: "Gaia",
            silence_token: "[沉默]",
            stage: StageType::ChatGroup,
            briefing: None,
            auction: &auction,
        });
        assert!(p.contains("群主/主理人"));
        assert!(p.contains("千问"));
        assert!(!p.contains("qwen-max"));
        assert!(p.contains("高级功能接口"));
        assert!(p.contains("「[沉默]」"));
        assert!(!p.contains("暗网拍卖会"));
    }

    #[test]
    fn test_action_schema_only_for_chat_group_and_auction_roles() {
        let r = roster();
        let id = identity("qwen-max", "千问", false);
        let mut auction = Auction::default();
        auction.open("月光", "装在瓶子里", 10.0, "deepseek-v3");
        let event = ScenarioEvent {
            time: "深夜".into(),
            description: "辩论是否该加班".into(),
            goal: "达成共识".into(),
        };
        let p = persona_prompt(&PersonaContext {
            identity: &id,
            roster: &r,
            group_name: "摸鱼群",
            human_name: "Gaia",
            silence_token: "[沉默]",
            stage: StageType::Debate,
            briefing: Some(&event),
            auction: &auction,
        });
        assert!(p.contains("【当前舞台：辩论赛】"));
        assert!(p.contains("当前阶段目标：达成共识"));
        assert!(!p.contains("高级功能接口"));
        assert!(p.contains("你是【买家】"));
        assert!(p.contains("拍卖师是：小D"));
    }

    #[test]
    fn test_chat_log_marks_self_and_quotes() {
        let r = roster();
        let msgs = vec![
            ChatMessage::text("deepseek-v3", "早"),
            ChatMessage::text("qwen-max", "早啊").with_quote(Quote {
                user: "deepseek-v3".into(),
                text: "早".into(),
            }),
        ];
        let log = chat_log(&msgs, "deepseek-v3", &r);
        assert_eq!(log, "[小D (你自己)]: 早\n[千问]: 「回复 小D: 早」 早啊\n");
    }
}
