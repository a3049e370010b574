//! 运行监管：每轮运行的停止令牌与暂停状态
//!
//! 每次 start 换一枚新的 CancellationToken，stop 或章节推进时取消它，所有成员循环随之退出。
//! 暂停不取消令牌，成员循环轮询暂停标记原地等待。

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    /// 当前运行的停止令牌
    run_token: RwLock<CancellationToken>,
    /// 运维暂停
    paused: Arc<RwLock<bool>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            run_token: RwLock::new(CancellationToken::new()),
            paused: Arc::new(RwLock::new(false)),
        }
    }

    /// 开始新一轮运行，返回其停止令牌
    pub async fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.run_token.write().await = token.clone();
        token
    }

    pub async fn run_token(&self) -> CancellationToken {
        self.run_token.read().await.clone()
    }

    /// 取消当前运行
    pub async fn cancel(&self) {
        self.run_token.read().await.cancel();
    }

    pub async fn is_paused(&self) -> bool {
        *self.paused.read().await
    }

    pub async fn set_paused(&self, paused: bool) {
        *self.paused.write().await = paused;
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
