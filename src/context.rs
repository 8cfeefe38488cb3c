//! 调用上下文
//! 携带调用方的截止时间与取消令牌，分类器调用和存储操作都必须遵守

use crate::error::{AppError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 单次逻辑调用的上下文
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以当前时间为起点设置整体截止时间
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 与外部取消信号绑定
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// 在上下文约束下执行一个阻塞点
    ///
    /// `limit` 是该操作自身的超时：超时记为 `Connectivity`（可重试）；
    /// 调用方截止时间到达或取消令牌触发则记为 `Cancelled`。
    /// future 在返回前被丢弃，未完成的调用随之中止。
    pub async fn run<T, F>(&self, operation: &str, limit: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(AppError::Cancelled(format!("{} not started", operation)));
        }

        let local_deadline = limit.map(|d| Instant::now() + d);
        let effective = match (self.deadline, local_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let timed = async {
            match effective {
                Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
                None => Some(fut.await),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(AppError::Cancelled(format!("{} cancelled by caller", operation)))
            }
            outcome = timed => match outcome {
                Some(result) => result,
                None if self.deadline.is_some_and(|d| Instant::now() >= d) => {
                    Err(AppError::Cancelled(format!("{} exceeded caller deadline", operation)))
                }
                None => Err(AppError::Connectivity(format!(
                    "{} timed out after {} ms",
                    operation,
                    limit.map(|d| d.as_millis()).unwrap_or_default()
                ))),
            },
        }
    }
}
