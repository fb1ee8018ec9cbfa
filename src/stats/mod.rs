use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::{RecordId, Tier};
use crate::index::Distribution;

/// 保留的最近告警条数
const MAX_ALERTS: usize = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Operation {
    Create,
    Resolve,
    Migrate { source: Tier, dest: Tier },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Hit,
    Miss,
    Migrated,
    /// 被其他 worker 认领（CAS 冲突）
    Skipped,
    Failed,
}

/// 一次操作的审计事件：每次解析 / 每条记录的每次迁移尝试各一条
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub operation: Operation,
    pub record: RecordId,
    pub tier: Option<Tier>,
    pub latency: Duration,
    pub outcome: Outcome,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Alert {
    /// 单轮迁移失败率超过阈值
    FailureRate {
        source: Tier,
        dest: Tier,
        failed: usize,
        attempted: usize,
        threshold: f64,
    },
    /// 记录失败次数到达上限，停在 MigrationFailed 等待人工处理
    Escalated {
        record: RecordId,
        tier: Tier,
        attempts: u32,
    },
}

impl Alert {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            Alert::FailureRate { .. } => AlertSeverity::Warning,
            Alert::Escalated { .. } => AlertSeverity::Critical,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::FailureRate {
                source,
                dest,
                failed,
                attempted,
                threshold,
            } => write!(
                f,
                "{}->{} failure rate {}/{} exceeds {:.0}%",
                source,
                dest,
                failed,
                attempted,
                threshold * 100.0
            ),
            Alert::Escalated {
                record,
                tier,
                attempts,
            } => write!(
                f,
                "{} parked on {} after {} failed migration attempts",
                record, tier, attempts
            ),
        }
    }
}

/// 指标/审计下游。实现必须廉价且不阻塞（在热路径上同步调用）。
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
    fn alert(&self, alert: &Alert);
}

/// 结构化日志下游
#[derive(Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &AuditEvent) {
        tracing::debug!(
            op = ?event.operation,
            record = %event.record,
            tier = ?event.tier,
            latency_us = event.latency.as_micros() as u64,
            outcome = ?event.outcome,
            "audit"
        );
    }

    fn alert(&self, alert: &Alert) {
        match alert.severity() {
            AlertSeverity::Warning => tracing::warn!("ALERT: {}", alert),
            AlertSeverity::Critical => tracing::error!("ALERT: {}", alert),
        }
    }
}

/// 广播到多个下游
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutSink {
    fn record(&self, event: &AuditEvent) {
        for s in &self.sinks {
            s.record(event);
        }
    }

    fn alert(&self, alert: &Alert) {
        for s in &self.sinks {
            s.alert(alert);
        }
    }
}

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    hit_latency_us: AtomicU64,
    migrated_in: AtomicU64,
    migrate_failed: AtomicU64,
    migrate_skipped: AtomicU64,
}

/// 内存聚合：按层的命中分布、平均响应时间、迁移计数、最近告警。
#[derive(Default)]
pub struct TierStats {
    tiers: [TierCounters; 3],
    misses: AtomicU64,
    miss_latency_us: AtomicU64,
    created: AtomicU64,
    alerts: Mutex<Vec<Alert>>,
}

impl TierStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsReport {
        let hits_total: u64 = self
            .tiers
            .iter()
            .map(|c| c.hits.load(Ordering::Relaxed))
            .sum();
        let misses = self.misses.load(Ordering::Relaxed);
        let resolves = hits_total + misses;

        let tiers = Tier::PROBE_ORDER
            .iter()
            .map(|&tier| {
                let c = &self.tiers[tier.index()];
                let hits = c.hits.load(Ordering::Relaxed);
                let latency = c.hit_latency_us.load(Ordering::Relaxed);
                TierReport {
                    tier,
                    hits,
                    hit_pct: percent(hits, resolves),
                    avg_response_ms: average_ms(latency, hits),
                    migrated_in: c.migrated_in.load(Ordering::Relaxed),
                    migrate_failed: c.migrate_failed.load(Ordering::Relaxed),
                    migrate_skipped: c.migrate_skipped.load(Ordering::Relaxed),
                }
            })
            .collect();

        StatsReport {
            resolves,
            misses,
            miss_avg_ms: average_ms(self.miss_latency_us.load(Ordering::Relaxed), misses),
            created: self.created.load(Ordering::Relaxed),
            tiers,
            alerts: self.alerts.lock().iter().map(|a| a.to_string()).collect(),
            distribution: None,
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AuditSink for TierStats {
    fn record(&self, event: &AuditEvent) {
        let us = event.latency.as_micros() as u64;
        match (event.operation, event.outcome, event.tier) {
            (Operation::Create, _, _) => {
                self.created.fetch_add(1, Ordering::Relaxed);
            }
            (Operation::Resolve, Outcome::Hit, Some(tier)) => {
                let c = &self.tiers[tier.index()];
                c.hits.fetch_add(1, Ordering::Relaxed);
                c.hit_latency_us.fetch_add(us, Ordering::Relaxed);
            }
            (Operation::Resolve, _, _) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.miss_latency_us.fetch_add(us, Ordering::Relaxed);
            }
            (Operation::Migrate { dest, .. }, outcome, _) => {
                let c = &self.tiers[dest.index()];
                let counter = match outcome {
                    Outcome::Migrated => &c.migrated_in,
                    Outcome::Skipped => &c.migrate_skipped,
                    _ => &c.migrate_failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn alert(&self, alert: &Alert) {
        let mut alerts = self.alerts.lock();
        alerts.push(alert.clone());
        if alerts.len() > MAX_ALERTS {
            let excess = alerts.len() - MAX_ALERTS;
            alerts.drain(0..excess);
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn average_ms(total_us: u64, n: u64) -> f64 {
    if n == 0 {
        0.0
    } else {
        total_us as f64 / n as f64 / 1000.0
    }
}

fn human_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2} s", ms / 1000.0)
    } else {
        format!("{:.2} ms", ms)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TierReport {
    pub tier: Tier,
    pub hits: u64,
    pub hit_pct: f64,
    pub avg_response_ms: f64,
    pub migrated_in: u64,
    pub migrate_failed: u64,
    pub migrate_skipped: u64,
}

/// 运行时统计快照（CLI `stats` / HTTP `GET /stats`）
#[derive(Clone, Debug, Serialize)]
pub struct StatsReport {
    pub resolves: u64,
    pub misses: u64,
    pub miss_avg_ms: f64,
    pub created: u64,
    pub tiers: Vec<TierReport>,
    pub alerts: Vec<String>,
    /// 位置索引里的记录分布（由 vault 补上）
    pub distribution: Option<Distribution>,
}

impl StatsReport {
    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = Some(distribution);
        self
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           tierkeep Stats Report                  ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Resolves: {:>10}   misses: {:>10}       ║", self.resolves, self.misses)?;
        writeln!(f, "║ Created:  {:>10}   miss avg: {:>10}     ║", self.created, human_ms(self.miss_avg_ms))?;
        for t in &self.tiers {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ {:<5}                                            ║", t.tier.as_str().to_uppercase())?;
            writeln!(
                f,
                "║   hits:         {:>10}  ({:>6.1}%)             ║",
                t.hits, t.hit_pct
            )?;
            writeln!(
                f,
                "║   avg response: {:>10}                       ║",
                human_ms(t.avg_response_ms)
            )?;
            writeln!(
                f,
                "║   migrated in:  {:>10}  failed: {:>6}        ║",
                t.migrated_in, t.migrate_failed
            )?;
            if let Some(d) = &self.distribution {
                let c = d.tiers.get(&t.tier).cloned().unwrap_or_default();
                writeln!(
                    f,
                    "║   records:      {:>10}  parked: {:>6}        ║",
                    c.total(),
                    c.migration_failed
                )?;
            }
        }
        if !self.alerts.is_empty() {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Recent alerts:                                   ║")?;
            for a in self.alerts.iter().rev().take(5) {
                writeln!(f, "║   {}", a)?;
            }
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(tier: Option<Tier>, ms: u64) -> AuditEvent {
        AuditEvent {
            operation: Operation::Resolve,
            record: RecordId::new("R-001"),
            tier,
            latency: Duration::from_millis(ms),
            outcome: if tier.is_some() { Outcome::Hit } else { Outcome::Miss },
        }
    }

    #[test]
    fn hit_distribution_and_average_latency_per_tier() {
        let stats = TierStats::new();
        stats.record(&resolve(Some(Tier::Hot), 2));
        stats.record(&resolve(Some(Tier::Hot), 4));
        stats.record(&resolve(Some(Tier::Cold), 30));
        stats.record(&resolve(None, 10));

        let r = stats.snapshot();
        assert_eq!(r.resolves, 4);
        assert_eq!(r.misses, 1);
        let hot = &r.tiers[0];
        assert_eq!(hot.hits, 2);
        assert!((hot.hit_pct - 50.0).abs() < 1e-9);
        assert!((hot.avg_response_ms - 3.0).abs() < 1e-9);
        assert_eq!(r.tiers[1].hits, 0);
        assert_eq!(r.tiers[1].avg_response_ms, 0.0);
        assert!(r.to_string().contains("tierkeep Stats Report"));
    }

    #[test]
    fn migrate_events_count_against_destination_tier() {
        let stats = TierStats::new();
        for outcome in [Outcome::Migrated, Outcome::Migrated, Outcome::Failed, Outcome::Skipped] {
            stats.record(&AuditEvent {
                operation: Operation::Migrate {
                    source: Tier::Hot,
                    dest: Tier::Warm,
                },
                record: RecordId::new("x"),
                tier: Some(Tier::Warm),
                latency: Duration::from_millis(1),
                outcome,
            });
        }
        let warm = &stats.snapshot().tiers[1];
        assert_eq!(warm.migrated_in, 2);
        assert_eq!(warm.migrate_failed, 1);
        assert_eq!(warm.migrate_skipped, 1);
    }

    #[test]
    fn alerts_are_bounded_and_fanned_out() {
        let a = Arc::new(TierStats::new());
        let b = Arc::new(TierStats::new());
        let fan = FanoutSink::new().with(a.clone()).with(b.clone());
        for i in 0..(MAX_ALERTS + 5) {
            fan.alert(&Alert::Escalated {
                record: RecordId::new(format!("r{i}")),
                tier: Tier::Hot,
                attempts: 5,
            });
        }
        assert_eq!(a.alerts().len(), MAX_ALERTS);
        assert_eq!(b.alerts().len(), MAX_ALERTS);
        assert_eq!(
            a.alerts()[0],
            Alert::Escalated {
                record: RecordId::new("r5"),
                tier: Tier::Hot,
                attempts: 5
            }
        );
    }
}
