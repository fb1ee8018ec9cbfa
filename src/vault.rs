use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{Backend, Config, ScheduledJob};
use crate::core::{Clock, Record, RecordId, SystemClock, Tier};
use crate::index::{
    DurableLocationIndex, Distribution, Expect, IndexError, LocationEntry, LocationIndex,
};
use crate::migrate::{CancelHandle, CycleError, MigrationJob, MigrationReport, MigrationScheduler};
use crate::policy::LifecyclePolicy;
use crate::resolver::{ResolveError, Resolved, Resolver};
use crate::stats::{
    AuditEvent, AuditSink, FanoutSink, Operation, Outcome, StatsReport, TierStats, TracingSink,
};
use crate::tier::{
    bounded, BlobTierStore, MemoryTierStore, TierError, TierHandle, TierSet, TierStore,
};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("record {0} already exists")]
    Duplicate(RecordId),
    #[error("hot tier is not configured")]
    NoHotTier,
    #[error(transparent)]
    Tier(#[from] TierError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// 分层账单存储的门面：新记录写热层，按 ID 透明检索，按任务定期下沉。
pub struct TieredVault {
    tiers: TierSet,
    index: Arc<dyn LocationIndex>,
    durable: Option<Arc<DurableLocationIndex>>,
    resolver: Resolver,
    scheduler: MigrationScheduler,
    sink: Arc<dyn AuditSink>,
    stats: Arc<TierStats>,
    jobs: Vec<ScheduledJob>,
    write_timeout: Duration,
}

impl TieredVault {
    /// 按配置打开：层存储、持久索引（热层目录下）、生命周期策略
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let mut tiers = TierSet::new();
        for tier in Tier::PROBE_ORDER {
            let tc = config.tiers.get(tier);
            let store: Arc<dyn TierStore> = match tc.backend {
                Backend::Blob => Arc::new(BlobTierStore::open(
                    tier,
                    config.tier_dir(tier),
                    tc.capabilities(),
                )?),
                Backend::Memory => Arc::new(MemoryTierStore::with_capabilities(tier, tc.capabilities())),
            };
            tiers = tiers.with(TierHandle::new(store, tc.codec, tc.prefix.clone()));
        }

        let durable = Arc::new(DurableLocationIndex::open(config.index_dir()).await?);
        let policy = match &config.storage.policy_file {
            Some(path) => Some(LifecyclePolicy::load(path).await?),
            None => None,
        };

        let mut vault = Self::assemble(
            tiers,
            durable.clone(),
            Arc::new(SystemClock),
            policy,
            config,
        );
        vault.durable = Some(durable);
        tracing::info!(
            "tierkeep vault open at {:?} ({} jobs configured)",
            config.storage.data_dir,
            vault.jobs.len()
        );
        Ok(vault)
    }

    /// 由现成部件组装（嵌入 / 测试）
    pub fn assemble(
        tiers: TierSet,
        index: Arc<dyn LocationIndex>,
        clock: Arc<dyn Clock>,
        policy: Option<LifecyclePolicy>,
        config: &Config,
    ) -> Self {
        let stats = Arc::new(TierStats::new());
        let sink: Arc<dyn AuditSink> = Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(stats.clone()),
        );
        let resolver = Resolver::new(tiers.clone(), index.clone(), sink.clone())
            .with_read_timeout(config.read_timeout());
        let mut scheduler = MigrationScheduler::new(tiers.clone(), index.clone(), sink.clone(), clock)
            .with_failure_alert_threshold(config.scheduler.failure_alert_threshold);
        if let Some(policy) = policy {
            scheduler = scheduler.with_policy(policy);
        }
        Self {
            tiers,
            index,
            durable: None,
            resolver,
            scheduler,
            sink,
            stats,
            jobs: config.jobs(),
            write_timeout: Duration::from_millis(config.scheduler.io_timeout_ms),
        }
    }

    /// 新记录只写热层，并登记 Resident 条目。
    ///
    /// 先用 CAS 占住索引槽位再写热层：同一 ID 的并发创建只有一个能写 blob，
    /// 败者直接拿到 `Duplicate`。写失败时撤销占位。
    pub async fn create(
        &self,
        id: impl Into<RecordId>,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Result<LocationEntry, VaultError> {
        let started = Instant::now();
        let record = Record::new(id, payload, created_at);
        let hot = self.tiers.get(Tier::Hot).ok_or(VaultError::NoHotTier)?;

        let key = hot.key_for(&record.id);
        let entry = match self
            .index
            .put(LocationEntry::resident(&record, hot.tier, key.clone()), Expect::Absent)
        {
            Ok(e) => e,
            Err(IndexError::Conflict { .. }) => return Err(VaultError::Duplicate(record.id)),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = bounded(hot.tier, self.write_timeout, hot.write_record(&key, &record)).await {
            tracing::warn!("Hot write of {} failed, releasing its index slot: {}", record.id, e);
            if let Err(ie) = self.index.delete(&record.id) {
                tracing::error!("Could not release index slot of {}: {}", record.id, ie);
            }
            return Err(e.into());
        }

        self.sink.record(&AuditEvent {
            operation: Operation::Create,
            record: record.id.clone(),
            tier: Some(hot.tier),
            latency: started.elapsed(),
            outcome: Outcome::Created,
        });
        tracing::debug!("Created {} on {} ({} bytes)", record.id, hot.tier, record.size());
        Ok(entry)
    }

    pub async fn resolve(&self, id: &RecordId) -> Result<Resolved, ResolveError> {
        self.resolver.resolve(id).await
    }

    pub async fn resolve_many(
        &self,
        ids: &[RecordId],
    ) -> Vec<(RecordId, Result<Resolved, ResolveError>)> {
        self.resolver.resolve_many(ids).await
    }

    pub async fn run_cycle(
        &self,
        job: &MigrationJob,
        cancel: &CancelHandle,
    ) -> Result<MigrationReport, CycleError> {
        self.scheduler.run_cycle_with(job, cancel).await
    }

    /// 所有配置任务各跑一轮
    pub async fn run_jobs(
        &self,
        cancel: &CancelHandle,
    ) -> Vec<(String, Result<MigrationReport, CycleError>)> {
        let jobs: Vec<MigrationJob> = self.jobs.iter().map(|s| s.job.clone()).collect();
        let out = self.scheduler.run_all(&jobs, cancel).await;
        self.checkpoint_quietly().await;
        out
    }

    /// 按各任务的间隔循环运行，直到取消
    pub async fn run_scheduled(&self, cancel: &CancelHandle) {
        if self.jobs.is_empty() {
            tracing::warn!("No migration jobs configured, scheduler idle");
            cancel.cancelled().await;
            return;
        }
        let mut next: Vec<Instant> = self.jobs.iter().map(|_| Instant::now()).collect();
        loop {
            let now = Instant::now();
            let mut ran = false;
            for (due, scheduled) in next.iter_mut().zip(&self.jobs) {
                if *due > now || cancel.is_cancelled() {
                    continue;
                }
                match self.scheduler.run_cycle_with(&scheduled.job, cancel).await {
                    Ok(report) if !report.is_noop() => tracing::info!("\n{}", report),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Migration job {} failed to run: {}", scheduled.job.name, e),
                }
                *due = Instant::now() + scheduled.every;
                ran = true;
            }
            if ran {
                self.checkpoint_quietly().await;
            }

            let wake = next.iter().min().copied().unwrap_or(now + Duration::from_secs(3600));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(wake.into()) => {}
            }
        }
        tracing::info!("Migration scheduler stopped");
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn job(&self, source: Tier, dest: Tier) -> Option<MigrationJob> {
        self.jobs
            .iter()
            .map(|s| s.job.clone())
            .find(|j| j.source == source && j.dest == dest)
    }

    pub fn distribution(&self) -> Result<Distribution, IndexError> {
        self.index.distribution()
    }

    pub fn stats(&self) -> StatsReport {
        let report = self.stats.snapshot();
        match self.index.distribution() {
            Ok(d) => report.with_distribution(d),
            Err(e) => {
                tracing::warn!("Record distribution unavailable: {}", e);
                report
            }
        }
    }

    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        if let Some(durable) = &self.durable {
            durable.checkpoint().await?;
        }
        Ok(())
    }

    async fn checkpoint_quietly(&self) {
        if let Err(e) = self.checkpoint().await {
            tracing::warn!("Location index checkpoint failed: {}", e);
        }
    }
}
