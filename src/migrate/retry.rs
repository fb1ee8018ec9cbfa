use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Tier;
use crate::tier::{bounded, TierError};

/// 单条记录内的有限重试：只重试瞬时故障，指数退避 + 上限
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 含首次尝试
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// 不重试（测试 / 故障注入场景）
    pub const NONE: RetryPolicy = RetryPolicy {
        attempts: 1,
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };

    /// base * 2^(attempt-1)，封顶 max_backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// 每次尝试都受 `io_timeout` 约束；超时同样算瞬时故障
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    tier: Tier,
    io_timeout: Duration,
    what: &str,
    mut op: F,
) -> Result<T, TierError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TierError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match bounded(tier, io_timeout, op()).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                let backoff = policy.backoff(attempt);
                tracing::debug!(
                    "{} on {} failed (attempt {}/{}): {}. Retrying in {:?}",
                    what,
                    tier,
                    attempt,
                    attempts,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(150),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(50));
        assert_eq!(p.backoff(2), Duration::from_millis(100));
        assert_eq!(p.backoff(3), Duration::from_millis(150));
        assert_eq!(p.backoff(40), Duration::from_millis(150));
    }

    #[tokio::test]
    async fn transient_faults_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let r = with_retry(&p, Tier::Warm, Duration::from_secs(1), "get", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TierError::Unavailable {
                    tier: Tier::Warm,
                    reason: "flaky".into(),
                })
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let r: Result<(), TierError> =
            with_retry(&RetryPolicy::default(), Tier::Cold, Duration::from_secs(1), "put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TierError::WriteOnce {
                    tier: Tier::Cold,
                    key: "k".into(),
                })
            })
            .await;
        assert!(matches!(r, Err(TierError::WriteOnce { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
