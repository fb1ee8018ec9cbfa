use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::retry::with_retry;
use super::{CancelHandle, CycleError, MigrationFailure, MigrationJob, MigrationReport};
use crate::core::{Clock, RecordId, Tier};
use crate::index::{Expect, IndexError, LocationEntry, LocationIndex, MigrationStatus, Placement};
use crate::policy::LifecyclePolicy;
use crate::stats::{Alert, AuditEvent, AuditSink, Operation, Outcome};
use crate::tier::{TierError, TierHandle, TierSet};

pub const DEFAULT_FAILURE_ALERT_THRESHOLD: f64 = 0.2;

/// 迁移调度器：按任务把老记录从热层搬到更冷的层。
///
/// ## 单条记录的状态机
/// `Resident/Migrated(src) -> Migrating -> Migrated(dest) | Resident(src) | MigrationFailed(src)`
///
/// 顺序固定为：CAS 认领 -> 复制 -> 校验 -> 索引切到 dest -> 删除源副本。
/// 任何一步之后崩溃，下一轮的恢复扫描都能把记录收敛到一个确定状态，
/// 且任何时刻至少有一份通过校验的副本可读。
///
/// 每条记录由独立的 tokio 任务迁移。调用方丢弃 `run_cycle` 的 future 时，
/// 已开始的记录照常走完（不会被中途 abort 停在 Migrating），
/// 任务租约也由这些 worker 持有，直到最后一个结束才释放。
pub struct MigrationScheduler {
    tiers: TierSet,
    index: Arc<dyn LocationIndex>,
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    policy: Option<LifecyclePolicy>,
    /// 进程内任务租约：同一 (source, dest) 同时只跑一轮
    leases: Arc<Mutex<HashSet<(Tier, Tier)>>>,
    failure_alert_threshold: f64,
}

struct Lease {
    leases: Arc<Mutex<HashSet<(Tier, Tier)>>>,
    key: (Tier, Tier),
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.key);
    }
}

impl MigrationScheduler {
    pub fn new(
        tiers: TierSet,
        index: Arc<dyn LocationIndex>,
        sink: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tiers,
            index,
            sink,
            clock,
            policy: None,
            leases: Arc::new(Mutex::new(HashSet::new())),
            failure_alert_threshold: DEFAULT_FAILURE_ALERT_THRESHOLD,
        }
    }

    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_failure_alert_threshold(mut self, threshold: f64) -> Self {
        self.failure_alert_threshold = threshold;
        self
    }

    pub async fn run_cycle(&self, job: &MigrationJob) -> Result<MigrationReport, CycleError> {
        self.run_cycle_with(job, &CancelHandle::new()).await
    }

    pub async fn run_cycle_with(
        &self,
        job: &MigrationJob,
        cancel: &CancelHandle,
    ) -> Result<MigrationReport, CycleError> {
        let (source, dest) = self.validate(job)?;
        let lease = Arc::new(self.acquire(job)?);
        let started = Instant::now();
        let mut report = MigrationReport::new(job.source, job.dest);
        let migrator = Arc::new(self.migrator(job, source, dest));

        self.recover(&migrator, &mut report).await?;

        if cancel.is_cancelled() {
            report.cancelled = true;
        } else {
            let cutoff = self.clock.now().checked_sub_signed(job.cutoff_age).ok_or_else(|| {
                CycleError::Configuration(format!(
                    "{}: cutoff age of {} days is out of range",
                    job.name,
                    job.cutoff_age.num_days()
                ))
            })?;
            let batch = self.index.eligible(job.source, cutoff, job.batch_size)?;
            tracing::info!(
                "Migration cycle {}: {} record(s) created before {} eligible",
                job.name,
                batch.len(),
                cutoff.to_rfc3339()
            );

            let semaphore = Arc::new(Semaphore::new(job.concurrency));
            let mut workers: Vec<JoinHandle<RecordOutcome>> = Vec::with_capacity(batch.len());
            for entry in batch {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!("Migration cycle {} cancelled, draining in-flight records", job.name);
                        report.cancelled = true;
                        break;
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                report.attempted += 1;
                let m = migrator.clone();
                let held = lease.clone();
                workers.push(tokio::spawn(async move {
                    let _permit = permit;
                    let _lease = held;
                    m.migrate(entry).await
                }));
            }

            for worker in workers {
                match worker.await {
                    Ok(outcome) => absorb(&mut report, outcome),
                    // 条目停在 Migrating，留给下一轮恢复扫描
                    Err(e) => tracing::error!("Migration worker for {} died: {}", job.name, e),
                }
            }
        }

        report.elapsed = started.elapsed();
        if report.attempted > 0 && report.failure_rate() > self.failure_alert_threshold {
            self.sink.alert(&Alert::FailureRate {
                source: job.source,
                dest: job.dest,
                failed: report.failed.len(),
                attempted: report.attempted,
                threshold: self.failure_alert_threshold,
            });
        }
        tracing::info!(
            "Migration cycle {} finished in {:?}: attempted={} succeeded={} skipped={} failed={} recovered={} cleaned={} escalated={}",
            job.name,
            report.elapsed,
            report.attempted,
            report.succeeded,
            report.skipped,
            report.failed.len(),
            report.recovered,
            report.cleaned,
            report.escalated
        );
        Ok(report)
    }

    /// 按顺序跑完所有任务；取消后不再开始新任务
    pub async fn run_all(
        &self,
        jobs: &[MigrationJob],
        cancel: &CancelHandle,
    ) -> Vec<(String, Result<MigrationReport, CycleError>)> {
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }
            let result = self.run_cycle_with(job, cancel).await;
            if let Err(e) = &result {
                tracing::error!("Migration job {} did not run: {}", job.name, e);
            }
            out.push((job.name.clone(), result));
        }
        out
    }

    fn validate(&self, job: &MigrationJob) -> Result<(TierHandle, TierHandle), CycleError> {
        let config = |msg: String| CycleError::Configuration(format!("{}: {}", job.name, msg));

        if job.source == job.dest {
            return Err(config(format!("source and destination are both {}", job.source)));
        }
        if !job.dest.is_colder_than(job.source) {
            return Err(config(format!(
                "{} -> {} would move records to a hotter tier",
                job.source, job.dest
            )));
        }
        if job.cutoff_age <= chrono::Duration::zero() {
            return Err(config("cutoff age must be positive".into()));
        }
        if job.batch_size == 0 || job.concurrency == 0 {
            return Err(config("batch size and concurrency must be at least 1".into()));
        }
        if job.max_failed_attempts == 0 {
            return Err(config("max failed attempts must be at least 1".into()));
        }

        let source = self
            .tiers
            .get(job.source)
            .cloned()
            .ok_or_else(|| config(format!("{} tier is not configured", job.source)))?;
        let dest = self
            .tiers
            .get(job.dest)
            .cloned()
            .ok_or_else(|| config(format!("{} tier is not configured", job.dest)))?;
        if !source.store.capabilities().deletable {
            return Err(config(format!(
                "{} tier cannot delete migrated copies",
                job.source
            )));
        }

        if let Some(policy) = &self.policy {
            for handle in [&source, &dest] {
                if let Some((rule, owned)) = policy.owner_of(&handle.prefix) {
                    return Err(config(format!(
                        "{} prefix {} overlaps lifecycle rule {} ({})",
                        handle.tier, handle.prefix, rule.name, owned
                    )));
                }
            }
        }
        Ok((source, dest))
    }

    fn acquire(&self, job: &MigrationJob) -> Result<Lease, CycleError> {
        let key = (job.source, job.dest);
        if !self.leases.lock().insert(key) {
            return Err(CycleError::AlreadyRunning {
                from: job.source,
                to: job.dest,
            });
        }
        Ok(Lease {
            leases: self.leases.clone(),
            key,
        })
    }

    fn migrator(&self, job: &MigrationJob, source: TierHandle, dest: TierHandle) -> RecordMigrator {
        RecordMigrator {
            job: job.clone(),
            source,
            dest,
            index: self.index.clone(),
            sink: self.sink.clone(),
        }
    }

    /// 恢复扫描：收尾本任务留下的在途记录，并补删待清理的旧副本
    async fn recover(
        &self,
        m: &RecordMigrator,
        report: &mut MigrationReport,
    ) -> Result<(), CycleError> {
        let stranded: Vec<(LocationEntry, String)> = self
            .index
            .in_flight()?
            .into_iter()
            .filter_map(|e| {
                let key = e
                    .target
                    .as_ref()
                    .filter(|t| e.tier == m.source.tier && t.tier == m.dest.tier)
                    .map(|t| t.key.clone())?;
                Some((e, key))
            })
            .collect();

        for (entry, key) in stranded {
            let id = entry.id.clone();
            match m.recover(entry, &key).await {
                Ok(finalized) => {
                    report.recovered += 1;
                    if finalized == Some(true) {
                        report.cleaned += 1;
                    }
                }
                Err(f) => tracing::warn!("Could not recover in-flight migration of {}: {}", id, f),
            }
        }

        for entry in self.index.pending_cleanup()? {
            if entry.retired.as_ref().map(|p| p.tier) == Some(m.source.tier) && m.retire(&entry).await
            {
                report.cleaned += 1;
            }
        }
        Ok(())
    }
}

fn absorb(report: &mut MigrationReport, outcome: RecordOutcome) {
    match outcome {
        RecordOutcome::Migrated { bytes, cleaned } => {
            report.succeeded += 1;
            report.bytes_migrated += bytes;
            if cleaned {
                report.cleaned += 1;
            }
        }
        RecordOutcome::Skipped => report.skipped += 1,
        RecordOutcome::Failed {
            id,
            failure,
            escalated,
        } => {
            report.failed.push((id, failure));
            if escalated {
                report.escalated += 1;
            }
        }
    }
}

#[derive(Debug)]
enum RecordOutcome {
    Migrated {
        bytes: u64,
        cleaned: bool,
    },
    Skipped,
    Failed {
        id: RecordId,
        failure: MigrationFailure,
        escalated: bool,
    },
}

/// 目标层上该 key 的现状
enum DestState {
    Absent,
    Valid,
    Stale(String),
}

/// 单条记录的迁移执行者（在 worker 任务间共享）
struct RecordMigrator {
    job: MigrationJob,
    source: TierHandle,
    dest: TierHandle,
    index: Arc<dyn LocationIndex>,
    sink: Arc<dyn AuditSink>,
}

impl RecordMigrator {
    async fn migrate(&self, entry: LocationEntry) -> RecordOutcome {
        let started = Instant::now();
        let key = self.dest.key_for(&entry.id);
        let target = Placement {
            tier: self.dest.tier,
            key: key.clone(),
        };

        let claimed = match self
            .index
            .put(entry.claim(target), Expect::Revision(entry.revision))
        {
            Ok(c) => c,
            Err(IndexError::Conflict { reason, .. }) => {
                tracing::debug!("{} claimed elsewhere, skipping: {}", entry.id, reason);
                self.audit(&entry.id, started, Outcome::Skipped);
                return RecordOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!("Failed to claim {} for migration: {}", entry.id, e);
                self.audit(&entry.id, started, Outcome::Failed);
                return RecordOutcome::Failed {
                    id: entry.id,
                    failure: e.into(),
                    escalated: false,
                };
            }
        };

        let outcome = match self.copy_and_verify(&claimed, &key).await {
            Ok(()) => match self.commit(&claimed).await {
                Ok(cleaned) => RecordOutcome::Migrated {
                    bytes: claimed.size,
                    cleaned,
                },
                Err(failure) => {
                    tracing::warn!(
                        "Verified copy of {} on {} but could not record it: {}",
                        claimed.id,
                        self.dest.tier,
                        failure
                    );
                    RecordOutcome::Failed {
                        id: claimed.id.clone(),
                        failure,
                        escalated: false,
                    }
                }
            },
            Err(failure) => self.abort(&claimed, &key, failure).await,
        };

        let audited = match &outcome {
            RecordOutcome::Migrated { .. } => Outcome::Migrated,
            RecordOutcome::Skipped => Outcome::Skipped,
            RecordOutcome::Failed { .. } => Outcome::Failed,
        };
        self.audit(&claimed.id, started, audited);
        outcome
    }

    async fn copy_and_verify(&self, entry: &LocationEntry, key: &str) -> Result<(), MigrationFailure> {
        match self.inspect_dest(entry, key).await? {
            DestState::Valid => {
                tracing::debug!(
                    "{} already has a verified copy of {}, skipping copy",
                    self.dest.tier,
                    entry.id
                );
                return Ok(());
            }
            DestState::Stale(why) => {
                tracing::warn!(
                    "Discarding stale {} copy of {}: {}",
                    self.dest.tier,
                    entry.id,
                    why
                );
                self.delete_dest(key).await?;
            }
            DestState::Absent => {}
        }

        let source = &self.source;
        let src_key = entry.key.as_str();
        let record = match with_retry(
            &self.job.retry,
            source.tier,
            self.job.io_timeout,
            "read source",
            move || source.read_record(src_key),
        )
        .await
        {
            Ok(Some(r)) => r,
            Ok(None) => return Err(MigrationFailure::SourceMissing),
            Err(e) => return Err(e.into()),
        };
        if record.id != entry.id || record.checksum() != entry.checksum {
            return Err(MigrationFailure::VerificationFailed(format!(
                "{} copy does not match the index entry",
                source.tier
            )));
        }

        let dest = &self.dest;
        let rec = &record;
        match with_retry(
            &self.job.retry,
            dest.tier,
            self.job.io_timeout,
            "write destination",
            move || dest.write_record(key, rec),
        )
        .await
        {
            Ok(_) => {}
            Err(TierError::WriteOnce { .. }) => {
                tracing::debug!("{} appeared on write-once {} meanwhile, verifying it", entry.id, dest.tier);
            }
            Err(e) => return Err(e.into()),
        }

        match self.inspect_dest(entry, key).await? {
            DestState::Valid => Ok(()),
            DestState::Absent => Err(MigrationFailure::VerificationFailed(format!(
                "{} copy missing after write",
                dest.tier
            ))),
            DestState::Stale(why) => Err(MigrationFailure::VerificationFailed(why)),
        }
    }

    /// 读回目标副本并与索引条目比对（ID / 大小 / 内容校验和）
    async fn inspect_dest(&self, entry: &LocationEntry, key: &str) -> Result<DestState, MigrationFailure> {
        let dest = &self.dest;
        match with_retry(
            &self.job.retry,
            dest.tier,
            self.job.io_timeout,
            "read destination",
            move || dest.read_record(key),
        )
        .await
        {
            Ok(None) => Ok(DestState::Absent),
            Ok(Some(r)) if r.id != entry.id => Ok(DestState::Stale(format!("holds record {}", r.id))),
            Ok(Some(r)) if r.size() != entry.size => Ok(DestState::Stale(format!(
                "size {} != {}",
                r.size(),
                entry.size
            ))),
            Ok(Some(r)) if r.checksum() != entry.checksum => Ok(DestState::Stale(format!(
                "checksum {:#x} != {:#x}",
                r.checksum(),
                entry.checksum
            ))),
            Ok(Some(_)) => Ok(DestState::Valid),
            Err(TierError::Codec(msg)) => Ok(DestState::Stale(format!("undecodable: {}", msg))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_dest(&self, key: &str) -> Result<(), MigrationFailure> {
        let dest = &self.dest;
        with_retry(
            &self.job.retry,
            dest.tier,
            self.job.io_timeout,
            "delete destination",
            move || dest.store.delete(key),
        )
        .await?;
        Ok(())
    }

    /// 索引切到 dest，然后删除源副本；返回源副本是否已清理
    async fn commit(&self, claimed: &LocationEntry) -> Result<bool, MigrationFailure> {
        let migrated = self
            .index
            .put(claimed.migrated(), Expect::Revision(claimed.revision))?;
        Ok(self.retire(&migrated).await)
    }

    /// 删除已迁出的旧副本并清掉标记；失败时保留标记，下一轮再删
    async fn retire(&self, entry: &LocationEntry) -> bool {
        let Some(old) = entry.retired.as_ref() else {
            return true;
        };
        if old.tier != self.source.tier {
            return false;
        }

        let source = &self.source;
        let key = old.key.as_str();
        if let Err(e) = with_retry(
            &self.job.retry,
            source.tier,
            self.job.io_timeout,
            "delete source",
            move || source.store.delete(key),
        )
        .await
        {
            tracing::warn!(
                "Failed to delete migrated {} copy of {}: {} (left for the next sweep)",
                source.tier,
                entry.id,
                e
            );
            return false;
        }

        match self
            .index
            .put(entry.cleaned(), Expect::Revision(entry.revision))
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Deleted old copy of {} but could not clear marker: {}", entry.id, e);
                false
            }
        }
    }

    /// 失败收尾：丢弃目标层残留，回到源层（达到上限则停在 MigrationFailed）
    async fn abort(&self, claimed: &LocationEntry, key: &str, failure: MigrationFailure) -> RecordOutcome {
        tracing::warn!(
            "Migration of {} {}->{} failed: {}",
            claimed.id,
            self.source.tier,
            self.dest.tier,
            failure
        );
        if let Err(e) = self.delete_dest(key).await {
            tracing::warn!("Could not discard partial {} copy of {}: {}", self.dest.tier, claimed.id, e);
        }

        let reverted = claimed.reverted(self.job.max_failed_attempts);
        let mut escalated = false;
        match self.index.put(reverted, Expect::Revision(claimed.revision)) {
            Ok(stored) if stored.status == MigrationStatus::MigrationFailed => {
                escalated = true;
                self.sink.alert(&Alert::Escalated {
                    record: stored.id.clone(),
                    tier: stored.tier,
                    attempts: stored.failed_attempts,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(
                "Could not revert {} after failed migration: {} (left for recovery)",
                claimed.id,
                e
            ),
        }

        RecordOutcome::Failed {
            id: claimed.id.clone(),
            failure,
            escalated,
        }
    }

    /// 收尾一条崩溃遗留的 Migrating 条目。
    /// 目标副本校验通过则完成迁移（返回 `Some(源副本是否已清理)`），否则回滚（`None`）。
    async fn recover(&self, entry: LocationEntry, key: &str) -> Result<Option<bool>, MigrationFailure> {
        match self.inspect_dest(&entry, key).await? {
            DestState::Valid => {
                tracing::info!(
                    "Finalizing interrupted migration of {} to {}",
                    entry.id,
                    self.dest.tier
                );
                self.commit(&entry).await.map(Some)
            }
            state => {
                if let DestState::Stale(why) = state {
                    tracing::warn!("Discarding partial {} copy of {}: {}", self.dest.tier, entry.id, why);
                    self.delete_dest(key).await?;
                }
                tracing::info!("Releasing interrupted migration of {}", entry.id);
                self.index
                    .put(entry.released(), Expect::Revision(entry.revision))?;
                Ok(None)
            }
        }
    }

    fn audit(&self, id: &RecordId, started: Instant, outcome: Outcome) {
        self.sink.record(&AuditEvent {
            operation: Operation::Migrate {
                source: self.source.tier,
                dest: self.dest.tier,
            },
            record: id.clone(),
            tier: Some(self.dest.tier),
            latency: started.elapsed(),
            outcome,
        });
    }
}
