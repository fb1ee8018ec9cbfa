pub mod job;
pub mod retry;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::core::Tier;
use crate::index::IndexError;
use crate::tier::TierError;

pub use job::{MigrationJob, MigrationReport};
pub use retry::RetryPolicy;
pub use scheduler::MigrationScheduler;

/// 单条记录的迁移失败原因：收进报告，不中断整批
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum MigrationFailure {
    #[error("tier unavailable: {0}")]
    TierUnavailable(String),
    #[error("source copy missing")]
    SourceMissing,
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("index error: {0}")]
    Index(String),
}

impl From<TierError> for MigrationFailure {
    fn from(e: TierError) -> Self {
        match e {
            TierError::Codec(msg) => MigrationFailure::Codec(msg),
            other => MigrationFailure::TierUnavailable(other.to_string()),
        }
    }
}

impl From<IndexError> for MigrationFailure {
    fn from(e: IndexError) -> Self {
        MigrationFailure::Index(e.to_string())
    }
}

/// 整轮迁移无法开始（或无法继续）的错误
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("invalid migration job: {0}")]
    Configuration(String),
    #[error("a {from}->{to} cycle is already running")]
    AlreadyRunning { from: Tier, to: Tier },
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// 取消一轮迁移：停止认领新记录，等待在途记录完成（迁移或回滚）。
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            // 先登记等待再检查标志，避免错过 notify_waiters
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
