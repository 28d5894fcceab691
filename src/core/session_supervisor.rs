//! 循环监管：生命周期与取消
//!
//! 持有循环级 CancellationToken；stop() 时取消，进行中的协作方调用与退避等待随之返回。
//! 每次调用使用子 token，单次调用取消不影响整个循环。

use tokio_util::sync::CancellationToken;

/// 循环级取消令牌
#[derive(Debug, Clone)]
pub struct LoopSupervisor {
    cancel_token: CancellationToken,
}

impl LoopSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消；重复调用无副作用
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单次协作方调用）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 可取消的等待：返回 false 表示等待期间被取消
    pub async fn sleep(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel_token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Default for LoopSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
