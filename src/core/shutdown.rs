//! 优雅关闭
//!
//! 信号（Ctrl+C / SIGTERM）或进程内调用触发一次关闭；等待方拿到首个关闭原因，
//! 随后 HTTP 服务停止接收新连接，所有房间停止运行。

use std::sync::Arc;

use tokio::sync::watch;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 关闭信号管理器：只记录第一次触发的原因
pub struct ShutdownManager {
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self { reason }
    }

    /// 触发关闭（重复调用无副作用）
    pub fn shutdown(&self, reason: ShutdownReason) {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            tracing::info!("Shutdown requested: {:?}", reason);
        }
    }

    /// 等到关闭被触发，返回原因
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        let mut rx = self.reason.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // 发送端就是 self，存活期间 changed 不会报错
            if rx.changed().await.is_err() {
                return ShutdownReason::Terminate;
            }
        }
    }

    /// 后台监听 Ctrl+C 与 SIGTERM
    pub fn listen_for_signals(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = signal_received().await;
            manager.shutdown(reason);
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn signal_received() -> ShutdownReason {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => ShutdownReason::Interrupt,
        _ = terminate => ShutdownReason::Terminate,
    }
}
