use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Tier;
use crate::migrate::{MigrationJob, RetryPolicy};
use crate::tier::{Capabilities, Codec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 配置文件（TOML）。每个字段都有默认值，空文件即可运行。
///
/// ```toml
/// [storage]
/// data_dir = "/var/lib/tierkeep"
/// policy_file = "/etc/tierkeep/lifecycle.json"
///
/// [tiers.cold]
/// write_once = true
///
/// [[jobs]]
/// source = "hot"
/// dest = "warm"
/// cutoff_days = 30
/// every_hours = 24
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub tiers: TiersConfig,
    pub resolver: ResolverConfig,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub jobs: Vec<JobConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// 外部生命周期策略（JSON）；调度器拒绝落在其前缀下的任务
    pub policy_file: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Blob,
    Memory,
}

#[derive(Clone, Debug, Serialize)]
pub struct TierConfig {
    pub backend: Backend,
    /// 默认 `<data_dir>/<tier>`
    pub path: Option<PathBuf>,
    pub codec: Codec,
    pub prefix: String,
    pub write_once: bool,
    pub deletable: bool,
}

impl TierConfig {
    fn for_tier(tier: Tier) -> Self {
        Self {
            backend: Backend::Blob,
            path: None,
            codec: if tier == Tier::Hot {
                Codec::Bincode
            } else {
                Codec::Json
            },
            prefix: tier.as_str().to_string(),
            write_once: tier == Tier::Cold,
            deletable: true,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            write_once: self.write_once,
            deletable: self.deletable,
        }
    }
}

/// 每层缺省值不同（编码、前缀、write-once），所以先按部分字段读，再按层补齐
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "PartialTiers")]
pub struct TiersConfig {
    pub hot: TierConfig,
    pub warm: TierConfig,
    pub cold: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        PartialTiers::default().into()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct PartialTier {
    backend: Option<Backend>,
    path: Option<PathBuf>,
    codec: Option<Codec>,
    prefix: Option<String>,
    write_once: Option<bool>,
    deletable: Option<bool>,
}

impl PartialTier {
    fn complete(self, tier: Tier) -> TierConfig {
        let d = TierConfig::for_tier(tier);
        TierConfig {
            backend: self.backend.unwrap_or(d.backend),
            path: self.path.or(d.path),
            codec: self.codec.unwrap_or(d.codec),
            prefix: self.prefix.unwrap_or(d.prefix),
            write_once: self.write_once.unwrap_or(d.write_once),
            deletable: self.deletable.unwrap_or(d.deletable),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct PartialTiers {
    hot: PartialTier,
    warm: PartialTier,
    cold: PartialTier,
}

impl From<PartialTiers> for TiersConfig {
    fn from(p: PartialTiers) -> Self {
        Self {
            hot: p.hot.complete(Tier::Hot),
            warm: p.warm.complete(Tier::Warm),
            cold: p.cold.complete(Tier::Cold),
        }
    }
}

impl TiersConfig {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub read_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub failure_alert_threshold: f64,
    pub max_failed_attempts: u32,
    pub io_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub concurrency: usize,
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_alert_threshold: 0.2,
            max_failed_attempts: 5,
            io_timeout_ms: 5000,
            retry_attempts: 3,
            retry_backoff_ms: 50,
            retry_max_backoff_ms: 5000,
            concurrency: num_cpus::get().max(1),
            batch_size: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:6060".to_string(),
        }
    }
}

/// cutoff_days 上限：一百年
pub const MAX_CUTOFF_DAYS: i64 = 36_500;
/// every_hours 上限：十年
pub const MAX_EVERY_HOURS: u64 = 24 * 3_660;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub source: Tier,
    pub dest: Tier,
    pub cutoff_days: i64,
    /// 运行间隔（小时）
    pub every_hours: u64,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// 带运行间隔的迁移任务
#[derive(Clone, Debug)]
pub struct ScheduledJob {
    pub job: MigrationJob,
    pub every: Duration,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tierkeep")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            policy_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            tiers: TiersConfig::default(),
            resolver: ResolverConfig::default(),
            scheduler: SchedulerConfig::default(),
            server: ServerConfig::default(),
            jobs: vec![
                JobConfig {
                    name: Some("hot-to-warm".into()),
                    source: Tier::Hot,
                    dest: Tier::Warm,
                    cutoff_days: 30,
                    every_hours: 24,
                    batch_size: None,
                    concurrency: None,
                },
                JobConfig {
                    name: Some("warm-to-cold".into()),
                    source: Tier::Warm,
                    dest: Tier::Cold,
                    cutoff_days: 90,
                    every_hours: 24 * 7,
                    batch_size: None,
                    concurrency: None,
                },
            ],
        }
    }
}

impl Config {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {:?}: {}", path, e))?;
        let config = Self::from_toml(&raw)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// 有路径就读文件，否则用默认值
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.resolver.read_timeout_ms == 0 {
            return invalid("resolver.read_timeout_ms must be positive".into());
        }
        let s = &self.scheduler;
        if !(0.0..=1.0).contains(&s.failure_alert_threshold) {
            return invalid(format!(
                "scheduler.failure_alert_threshold {} is outside 0..=1",
                s.failure_alert_threshold
            ));
        }
        if s.max_failed_attempts == 0 || s.retry_attempts == 0 {
            return invalid("scheduler attempts must be at least 1".into());
        }
        if s.io_timeout_ms == 0 || s.concurrency == 0 || s.batch_size == 0 {
            return invalid("scheduler io_timeout_ms, concurrency and batch_size must be positive".into());
        }

        let mut prefixes: Vec<(Tier, String)> = Vec::new();
        for tier in Tier::PROBE_ORDER {
            let prefix = crate::tier::layout::normalize_prefix(&self.tiers.get(tier).prefix);
            if prefix.is_empty() {
                return invalid(format!("tiers.{}.prefix must not be empty", tier));
            }
            if let Some((other, _)) = prefixes
                .iter()
                .find(|(_, p)| p.starts_with(prefix.as_str()) || prefix.starts_with(p.as_str()))
            {
                return invalid(format!("tiers.{} and tiers.{} prefixes overlap", other, tier));
            }
            prefixes.push((tier, prefix));
        }

        for (i, job) in self.jobs.iter().enumerate() {
            let name = job.name.clone().unwrap_or_else(|| format!("jobs[{}]", i));
            if !job.dest.is_colder_than(job.source) {
                return invalid(format!(
                    "{}: {} -> {} does not move to a colder tier",
                    name, job.source, job.dest
                ));
            }
            if !(1..=MAX_CUTOFF_DAYS).contains(&job.cutoff_days) {
                return invalid(format!(
                    "{}: cutoff_days {} is outside 1..={}",
                    name, job.cutoff_days, MAX_CUTOFF_DAYS
                ));
            }
            if !(1..=MAX_EVERY_HOURS).contains(&job.every_hours) {
                return invalid(format!(
                    "{}: every_hours {} is outside 1..={}",
                    name, job.every_hours, MAX_EVERY_HOURS
                ));
            }
            if job.batch_size == Some(0) || job.concurrency == Some(0) {
                return invalid(format!("{}: batch_size and concurrency must be positive", name));
            }
        }
        Ok(())
    }

    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.tiers
            .get(tier)
            .path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join(tier.as_str()))
    }

    /// 位置索引与热层同址
    pub fn index_dir(&self) -> PathBuf {
        self.tier_dir(Tier::Hot).join("_index")
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver.read_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.scheduler.retry_attempts,
            base_backoff: Duration::from_millis(self.scheduler.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.scheduler.retry_max_backoff_ms),
        }
    }

    /// 未经 `validate` 的配置也不会溢出：天数与间隔先夹到合法区间
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let s = &self.scheduler;
        self.jobs
            .iter()
            .map(|j| {
                let cutoff = chrono::Duration::days(j.cutoff_days.clamp(1, MAX_CUTOFF_DAYS));
                let mut job = MigrationJob::new(j.source, j.dest, cutoff)
                    .with_batch_size(j.batch_size.unwrap_or(s.batch_size))
                    .with_concurrency(j.concurrency.unwrap_or(s.concurrency))
                    .with_io_timeout(Duration::from_millis(s.io_timeout_ms))
                    .with_retry(self.retry_policy())
                    .with_max_failed_attempts(s.max_failed_attempts);
                if let Some(name) = &j.name {
                    job.name = name.clone();
                }
                ScheduledJob {
                    job,
                    every: Duration::from_secs(j.every_hours.clamp(1, MAX_EVERY_HOURS) * 3600),
                }
            })
            .collect()
    }

    pub fn job(&self, source: Tier, dest: Tier) -> Option<MigrationJob> {
        self.jobs()
            .into_iter()
            .map(|s| s.job)
            .find(|j| j.source == source && j.dest == dest)
    }
}
