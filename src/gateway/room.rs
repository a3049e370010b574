//! 房间：一个群聊会话 + 它的观察者与落盘配置
//!
//! WebSocket 入站消息在这里分发到会话；需要广播的事件走会话总线，
//! 只回给发送方的事件作为返回值交给连接处理。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::chat::auction::Auction;
use crate::chat::events::ChatEvent;
use crate::chat::scenario::ScenarioStatus;
use crate::chat::session::{AgentSpec, GroupSession, SessionSettings};
use crate::core::ChatError;
use crate::gateway::message::ClientMessage;
use crate::llm::{ClientFactory, ModelEndpoint};
use crate::storage::{RoomConfigStore, RoomRecord};

/// /rooms 列表项
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub clients: usize,
    pub is_running: bool,
    pub message_count: usize,
}

/// 运维查询的房间状态
#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    pub room_id: String,
    pub group_name: String,
    pub is_running: bool,
    pub member_count: usize,
    pub message_count: usize,
    pub scenario: ScenarioStatus,
    pub auction: Auction,
}

pub struct Room {
    id: String,
    session: Arc<GroupSession>,
    store: Arc<dyn RoomConfigStore>,
    factory: Arc<dyn ClientFactory>,
    observers: AtomicUsize,
}

impl Room {
    /// 创建房间并恢复落盘配置；读取失败时用默认配置继续
    pub async fn open(
        id: &str,
        settings: SessionSettings,
        store: Arc<dyn RoomConfigStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> Arc<Self> {
        let session = GroupSession::new(id, settings);
        match store.load(id).await {
            Ok(Some(record)) => {
                tracing::info!("[{}] restored {} member configs", id, record.member_configs.len());
                session.restore(record.group_name, record.member_configs).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("[{}] failed to load room config: {}", id, e),
        }
        Arc::new(Self {
            id: id.to_string(),
            session,
            store,
            factory,
            observers: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<GroupSession> {
        &self.session
    }

    /// 新观察者接入：先订阅，再拿到 history 与 status 两条初始事件
    pub async fn connect(&self) -> (Vec<ChatEvent>, broadcast::Receiver<ChatEvent>) {
        let rx = self.session.subscribe();
        self.observers.fetch_add(1, Ordering::SeqCst);
        let initial = vec![
            ChatEvent::History {
                messages: self.session.history().await,
            },
            self.session.status_event().await,
        ];
        (initial, rx)
    }

    pub fn disconnect(&self) {
        self.observers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn observers(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    pub async fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            clients: self.observers(),
            is_running: self.session.is_running().await,
            message_count: self.session.history().await.len(),
        }
    }

    pub async fn status(&self) -> RoomStatus {
        RoomStatus {
            room_id: self.id.clone(),
            group_name: self.session.group_name().await,
            is_running: self.session.is_running().await,
            member_count: self.session.member_count().await,
            message_count: self.session.history().await.len(),
            scenario: self.session.scenario_snapshot().await,
            auction: self.session.auction().await,
        }
    }

    async fn persist(&self) -> Result<(), ChatError> {
        let record = RoomRecord {
            group_name: self.session.group_name().await,
            member_configs: self.session.member_configs().await,
        };
        self.store.save(&self.id, &record).await?;
        Ok(())
    }

    /// 修改群名并落盘
    pub async fn set_group_name(&self, name: &str) -> Result<(), ChatError> {
        self.session.set_group_name(name).await;
        self.persist().await
    }

    /// 解析并处理一条原始文本消息；出错时回一条 system 消息
    pub async fn handle_text(&self, text: &str) -> Vec<ChatEvent> {
        let result = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => Err(ChatError::Protocol(e.to_string())),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!("[{}] error processing message: {}", self.id, e);
            vec![ChatEvent::system(format!("处理请求时出错: {}", e))]
        })
    }

    /// 处理一条入站消息，返回只回给发送方的事件
    pub async fn handle(&self, msg: ClientMessage) -> Result<Vec<ChatEvent>, ChatError> {
        match msg {
            ClientMessage::UserMessage { content, name } => {
                self.session.post_human(name, &content).await;
                if !self.session.is_running().await {
                    match self.session.start().await {
                        Ok(_) | Err(ChatError::NoAgents) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(Vec::new())
            }
            ClientMessage::Setup {
                models,
                scenario,
                group_name,
            } => {
                let mut specs = Vec::with_capacity(models.len());
                for m in models.iter().filter(|m| !m.model_name.trim().is_empty()) {
                    let client = self.factory.build(&ModelEndpoint {
                        model: m.model_name.clone(),
                        base_url: m.base_url.clone(),
                        api_key: m.api_key.clone(),
                    })?;
                    specs.push(AgentSpec {
                        key: m.model_name.clone(),
                        client,
                        config: m.member_config(),
                    });
                }
                self.session.configure(specs, scenario, group_name).await;
                self.persist().await?;
                Ok(vec![self.session.status_event().await])
            }
            ClientMessage::UpdateSettings {
                group_name,
                member_configs,
            } => {
                self.session.update_settings(group_name, member_configs).await;
                self.persist().await?;
                Ok(Vec::new())
            }
            ClientMessage::Start => {
                self.session.start().await?;
                Ok(Vec::new())
            }
            ClientMessage::Stop => {
                self.session.stop().await;
                if let Err(skip) = self.session.force_advance().await {
                    tracing::debug!("[{}] no manual advance: {:?}", self.id, skip);
                }
                Ok(Vec::new())
            }
            ClientMessage::Clear => {
                self.session.clear().await;
                Ok(Vec::new())
            }
            ClientMessage::Reset => {
                self.session.reset().await;
                Ok(Vec::new())
            }
            ClientMessage::GetMembers => Ok(vec![self.session.members_event().await]),
            ClientMessage::GetHistory => Ok(vec![ChatEvent::History {
                messages: self.session.history().await,
            }]),
            ClientMessage::UserTyping { is_typing } => {
                self.session.set_human_typing(is_typing).await;
                Ok(Vec::new())
            }
        }
    }
}
