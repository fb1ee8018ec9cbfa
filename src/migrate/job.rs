use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::{MigrationFailure, RetryPolicy};
use crate::core::{RecordId, Tier};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// 一个迁移任务：把 `source` 上年龄超过 `cutoff_age` 的记录搬到 `dest`
#[derive(Clone, Debug)]
pub struct MigrationJob {
    pub name: String,
    pub source: Tier,
    pub dest: Tier,
    pub cutoff_age: chrono::Duration,
    pub batch_size: usize,
    pub concurrency: usize,
    pub io_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_failed_attempts: u32,
}

impl MigrationJob {
    pub fn new(source: Tier, dest: Tier, cutoff_age: chrono::Duration) -> Self {
        Self {
            name: format!("{}-to-{}", source, dest),
            source,
            dest,
            cutoff_age,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: num_cpus::get().max(1),
            io_timeout: DEFAULT_IO_TIMEOUT,
            retry: RetryPolicy::default(),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }

    /// 日常任务：HOT -> WARM，30 天
    pub fn hot_to_warm() -> Self {
        Self::new(Tier::Hot, Tier::Warm, chrono::Duration::days(30))
    }

    /// 每周任务：WARM -> COLD，90 天
    pub fn warm_to_cold() -> Self {
        Self::new(Tier::Warm, Tier::Cold, chrono::Duration::days(90))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn with_max_failed_attempts(mut self, max: u32) -> Self {
        self.max_failed_attempts = max;
        self
    }
}

/// 一轮迁移的结果
#[derive(Clone, Debug, Serialize)]
pub struct MigrationReport {
    pub source: Tier,
    pub dest: Tier,
    pub attempted: usize,
    pub succeeded: usize,
    /// 被其他 worker 抢先认领
    pub skipped: usize,
    pub failed: Vec<(RecordId, MigrationFailure)>,
    /// 恢复扫描中收尾（完成或回滚）的在途记录
    pub recovered: usize,
    /// 删除的旧副本数
    pub cleaned: usize,
    /// 本轮被停在 MigrationFailed 的记录数
    pub escalated: usize,
    pub bytes_migrated: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl MigrationReport {
    pub fn new(source: Tier, dest: Tier) -> Self {
        Self {
            source,
            dest,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: Vec::new(),
            recovered: 0,
            cleaned: 0,
            escalated: 0,
            bytes_migrated: 0,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed.len() as f64 / self.attempted as f64
        }
    }

    /// 本轮什么都没做
    pub fn is_noop(&self) -> bool {
        self.attempted == 0 && self.recovered == 0 && self.cleaned == 0
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{}", rule)?;
        writeln!(
            f,
            "MIGRATION SUMMARY {} -> {}{}",
            self.source.as_str().to_uppercase(),
            self.dest.as_str().to_uppercase(),
            if self.cancelled { " (cancelled)" } else { "" }
        )?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "Duration: {:.2} seconds", self.elapsed.as_secs_f64())?;
        writeln!(f, "Records Processed: {}", self.attempted)?;
        writeln!(f, "Successfully Migrated: {}", self.succeeded)?;
        writeln!(f, "Skipped (claimed elsewhere): {}", self.skipped)?;
        writeln!(f, "Failed Migrations: {}", self.failed.len())?;
        writeln!(f, "Escalated for review: {}", self.escalated)?;
        writeln!(f, "Recovered in-flight: {}", self.recovered)?;
        writeln!(f, "Old copies cleaned: {}", self.cleaned)?;
        writeln!(
            f,
            "Total Data Migrated: {:.2} MB",
            self.bytes_migrated as f64 / (1024.0 * 1024.0)
        )?;
        if !self.failed.is_empty() {
            writeln!(f)?;
            writeln!(f, "First 5 Errors:")?;
            for (i, (id, why)) in self.failed.iter().take(5).enumerate() {
                writeln!(f, "  {}. {}: {}", i + 1, id, why)?;
            }
        }
        write!(f, "{}", rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_at_most_five_errors() {
        let mut r = MigrationReport::new(Tier::Hot, Tier::Warm);
        r.attempted = 8;
        for i in 0..7 {
            r.failed.push((
                RecordId::new(format!("R-{i:03}")),
                MigrationFailure::SourceMissing,
            ));
        }
        let text = r.to_string();
        assert!(text.contains("MIGRATION SUMMARY HOT -> WARM"));
        assert!(text.contains("5. R-004"));
        assert!(!text.contains("R-005"));
        assert!((r.failure_rate() - 7.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn presets_match_billing_cadence() {
        let daily = MigrationJob::hot_to_warm();
        assert_eq!(daily.cutoff_age, chrono::Duration::days(30));
        assert_eq!(daily.batch_size, 100);
        let weekly = MigrationJob::warm_to_cold();
        assert_eq!((weekly.source, weekly.dest), (Tier::Warm, Tier::Cold));
        assert_eq!(weekly.name, "warm-to-cold");
    }
}
