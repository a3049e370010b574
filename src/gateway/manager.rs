//! 房间注册表：按 ID 懒创建，进程内常驻

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::chat::session::SessionSettings;
use crate::config::AppConfig;
use crate::core::ChatError;
use crate::gateway::room::{Room, RoomSummary};
use crate::llm::{ClientFactory, HttpClientFactory};
use crate::storage::{validate_room_id, RoomConfigStore, TomlRoomConfigStore};

pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    settings: SessionSettings,
    store: Arc<dyn RoomConfigStore>,
    factory: Arc<dyn ClientFactory>,
}

impl RoomManager {
    pub fn new(
        settings: SessionSettings,
        store: Arc<dyn RoomConfigStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            settings,
            store,
            factory,
        }
    }

    /// 按应用配置装配：TOML 房间配置 + HTTP 客户端工厂
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            SessionSettings::from_config(cfg),
            Arc::new(TomlRoomConfigStore::new(&cfg.server.rooms_dir)),
            Arc::new(HttpClientFactory::new(Duration::from_secs(
                cfg.llm.request_timeout_secs,
            ))),
        )
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>, ChatError> {
        validate_room_id(room_id).map_err(|_| ChatError::InvalidRoomId(room_id.to_string()))?;
        if let Some(room) = self.get(room_id).await {
            return Ok(room);
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }
        let room = Room::open(
            room_id,
            self.settings.clone(),
            self.store.clone(),
            self.factory.clone(),
        )
        .await;
        tracing::info!("Room created: {}", room_id);
        rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    pub async fn list(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            out.push(room.summary().await);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// 停止所有房间的运行
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        tracing::info!("Stopping {} rooms...", rooms.len());
        for room in rooms {
            room.session().stop().await;
        }
    }
}
