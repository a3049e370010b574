//! 持久化：房间配置

pub mod room_config;

pub use room_config::{
    validate_room_id, MemoryRoomConfigStore, RoomConfigStore, RoomRecord, StorageError,
    TomlRoomConfigStore,
};
