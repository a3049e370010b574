//! Agora 服务入口
//!
//! 初始化日志、加载配置、创建房间管理器，并启动 WebSocket / HTTP 服务。

use std::sync::Arc;

use agora::config::load_config;
use agora::core::ShutdownManager;
use agora::gateway::{serve, RoomManager};
use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agora::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let manager = Arc::new(RoomManager::from_config(&cfg));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.listen_for_signals();

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind_addr))?;
    tracing::info!("Agora listening on {}", cfg.server.bind_addr);

    serve(listener, manager, shutdown)
        .await
        .context("Server error")?;

    tracing::info!("Agora stopped");
    Ok(())
}
