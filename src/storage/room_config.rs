//! 房间配置存储：群名与成员设定
//!
//! 剧本、历史都不落盘，只有这份很小的配置随房间保存。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::memory::MemberConfig;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse room config: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("Failed to serialize room config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),
}

/// 落盘的房间配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub member_configs: BTreeMap<String, MemberConfig>,
}

/// 房间配置存储接口
#[async_trait]
pub trait RoomConfigStore: Send + Sync {
    /// 读取房间配置；从未保存过时返回 None
    async fn load(&self, room_id: &str) -> Result<Option<RoomRecord>, StorageError>;

    async fn save(&self, room_id: &str, record: &RoomRecord) -> Result<(), StorageError>;
}

/// 房间 ID 只能作为单个文件名使用
pub fn validate_room_id(room_id: &str) -> Result<(), StorageError> {
    let bad = room_id.is_empty()
        || room_id == "."
        || room_id.contains("..")
        || room_id.contains('/')
        || room_id.contains('\\')
        || room_id.chars().any(char::is_control);
    if bad {
        return Err(StorageError::InvalidRoomId(room_id.to_string()));
    }
    Ok(())
}

/// 每个房间一个 TOML 文件：`<dir>/<room_id>.toml`
pub struct TomlRoomConfigStore {
    dir: PathBuf,
}

impl TomlRoomConfigStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, room_id: &str) -> Result<PathBuf, StorageError> {
        validate_room_id(room_id)?;
        Ok(self.dir.join(format!("{}.toml", room_id)))
    }
}

#[async_trait]
impl RoomConfigStore for TomlRoomConfigStore {
    async fn load(&self, room_id: &str) -> Result<Option<RoomRecord>, StorageError> {
        let path = self.path_for(room_id)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: RoomRecord = toml::from_str(&text)?;
        tracing::debug!("Loaded room config {}", path.display());
        Ok(Some(record))
    }

    async fn save(&self, room_id: &str, record: &RoomRecord) -> Result<(), StorageError> {
        let path = self.path_for(room_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let text = toml::to_string_pretty(record)?;
        // 先写临时文件再改名，避免写到一半被读到
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!("Saved room config {}", path.display());
        Ok(())
    }
}

/// 内存存储（测试用）
#[derive(Default)]
pub struct MemoryRoomConfigStore {
    records: RwLock<HashMap<String, RoomRecord>>,
}

impl MemoryRoomConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomConfigStore for MemoryRoomConfigStore {
    async fn load(&self, room_id: &str) -> Result<Option<RoomRecord>, StorageError> {
        validate_room_id(room_id)?;
        Ok(self.records.read().await.get(room_id).cloned())
    }

    async fn save(&self, room_id: &str, record: &RoomRecord) -> Result<(), StorageError> {
        validate_room_id(room_id)?;
        self.records
            .write()
            .await
            .insert(room_id.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RoomRecord {
        let mut member_configs = BTreeMap::new();
        member_configs.insert(
            "deepseek-v3".to_string(),
            MemberConfig {
                is_manager: true,
                nickname: Some("小D".into()),
                memory: "喜欢猫".into(),
                ..Default::default()
            },
        );
        RoomRecord {
            group_name: "摸鱼群".into(),
            member_configs,
        }
    }

    #[tokio::test]
    async fn test_toml_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlRoomConfigStore::new(dir.path().join("rooms"));
        assert!(store.load("lobby").await.unwrap().is_none());

        store.save("lobby", &sample()).await.unwrap();
        let loaded = store.load("lobby").await.unwrap().unwrap();
        assert_eq!(loaded, sample());
        assert!(dir.path().join("rooms/lobby.toml").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_like_room_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlRoomConfigStore::new(dir.path());
        for id in ["../etc", "a/b", "", "a\\b"] {
            assert!(matches!(
                store.save(id, &RoomRecord::default()).await,
                Err(StorageError::InvalidRoomId(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryRoomConfigStore::new();
        store.save("r1", &sample()).await.unwrap();
        assert_eq!(store.load("r1").await.unwrap(), Some(sample()));
        assert_eq!(store.load("r2").await.unwrap(), None);
    }
}
