//! 网关：房间注册表、观察者协议与 HTTP / WebSocket 服务
//!
//! - **manager**: 按房间 ID 懒创建并常驻的房间表
//! - **room**: 单个房间（会话 + 观察者计数 + 配置落盘），入站消息分发
//! - **message**: 观察者入站 JSON 协议
//! - **server**: axum 路由（`/ws/:room_id` 与运维接口）

pub mod manager;
pub mod message;
pub mod room;
pub mod server;

pub use manager::RoomManager;
pub use message::{ClientMessage, ModelSpec};
pub use room::{Room, RoomStatus, RoomSummary};
pub use server::{router, serve};
