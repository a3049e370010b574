//! 成员自主循环
//!
//! 加入 → 观察 ⇄ 决定 → 打字 → 提交 → 冷却，直到停止令牌被取消。
//! 每次等待和每次模型请求都与停止令牌赛跑。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::chat::action;
use crate::chat::agent::Agent;
use crate::chat::events::ChatEvent;
use crate::chat::pacing::{self, Decision};
use crate::chat::session::GroupSession;

/// 睡眠 d；被取消时返回 false
async fn sleep_or_cancel(token: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// 暂停期间原地轮询；被取消时返回 false
async fn wait_while_paused(session: &GroupSession, token: &CancellationToken) -> bool {
    let poll = session.settings().pacing.pause_poll();
    while session.is_paused().await {
        if !sleep_or_cancel(token, poll).await {
            return false;
        }
    }
    !token.is_cancelled()
}

pub(crate) async fn run_member_loop(
    session: Arc<GroupSession>,
    agent: Arc<Agent>,
    token: CancellationToken,
) {
    let key = agent.key().to_string();
    let room = session.room_id().to_string();
    let policy = session.settings().pacing.clone();

    let join = policy.join.sample(&mut rand::thread_rng());
    if !sleep_or_cancel(&token, join).await {
        return;
    }
    tracing::info!("[{}] {} joined", room, key);
    session.publish(ChatEvent::system(format!("{} 加入群聊", key)));

    let first = session.observe(&key).await;
    if first.chapter_fresh && !first.is_manager {
        tracing::debug!("[{}] {} waits for the manager to open the chapter", room, key);
        let hold = policy.chapter_hold.sample(&mut rand::thread_rng());
        if !sleep_or_cancel(&token, hold).await {
            return;
        }
    }

    loop {
        if !wait_while_paused(&session, &token).await {
            break;
        }

        session.check_and_advance().await;
        if token.is_cancelled() {
            break;
        }

        // 观察
        let seen = session.observe(&key).await;
        let opening = seen.chapter_fresh && seen.is_manager;
        let wait = policy.observe_delay(
            &mut rand::thread_rng(),
            opening,
            seen.last_len_chars(),
            seen.human_typing,
        );
        if seen.human_typing {
            tracing::debug!("[{}] {} slows down, human is typing", room, key);
        }
        if !sleep_or_cancel(&token, wait).await {
            break;
        }
        if session.is_paused().await {
            continue;
        }

        // 决定
        let seen = session.observe(&key).await;
        let roll: f64 = rand::thread_rng().gen();
        let urgency = match pacing::decide(&seen.context(&key), roll, &policy) {
            Decision::Silent => continue,
            Decision::Speak { urgency, .. } => urgency,
        };

        // 打字
        session.set_typing(&key, true).await;
        let typing = policy.compose_delay(&mut rand::thread_rng(), urgency);
        if !sleep_or_cancel(&token, typing).await {
            session.set_typing(&key, false).await;
            break;
        }
        if session.last_author_is(&key).await {
            session.set_typing(&key, false).await;
            continue;
        }

        let reply = tokio::select! {
            _ = token.cancelled() => None,
            r = session.compose(&agent) => Some(r),
        };
        session.set_typing(&key, false).await;

        match reply {
            None => break,
            Some(Ok(raw)) => {
                session.commit(&key, action::interpret(&raw)).await;
            }
            Some(Err(e)) => {
                tracing::warn!("[{}] {} produced nothing this turn: {}", room, key, e);
                session.publish(ChatEvent::system(format!("[{}] Error: {}", key, e)));
            }
        }

        // 冷却
        let cooldown = policy.cooldown_delay(&mut rand::thread_rng());
        if !sleep_or_cancel(&token, cooldown).await {
            break;
        }
    }

    tracing::debug!("[{}] {} left the loop", room, key);
}
