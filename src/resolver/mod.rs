use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::core::{Record, RecordId, Tier};
use crate::index::LocationIndex;
use crate::stats::{AuditEvent, AuditSink, Operation, Outcome};
use crate::tier::{bounded, TierHandle, TierSet};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("record {0} not found in any tier")]
    NotFound(RecordId),
}

/// 记录是怎么找到的
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookup {
    Index,
    Probe,
}

#[derive(Clone, Debug)]
pub struct Resolved {
    pub record: Record,
    pub tier: Tier,
    pub elapsed: Duration,
    pub lookup: Lookup,
}

/// 检索解析器：按 ID 找到记录，调用方不需要知道它在哪一层。
///
/// 先查位置索引（只读一层）；索引缺失/不可用/指向的层未命中时，
/// 按 HOT -> WARM -> COLD 顺序逐层探测，首个命中即返回。
/// 层故障只记日志并按未命中处理，调用方只会看到 `NotFound`。
pub struct Resolver {
    tiers: TierSet,
    index: Arc<dyn LocationIndex>,
    sink: Arc<dyn AuditSink>,
    read_timeout: Duration,
}

impl Resolver {
    pub fn new(tiers: TierSet, index: Arc<dyn LocationIndex>, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            tiers,
            index,
            sink,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub async fn resolve(&self, id: &RecordId) -> Result<Resolved, ResolveError> {
        let started = Instant::now();
        let mut tried: Vec<(Tier, String)> = Vec::with_capacity(4);
        // 索引已知内容校验和时，任何一层读到的副本都必须与之一致
        let mut expected: Option<u64> = None;

        match self.index.get(id) {
            Ok(Some(entry)) => {
                expected = Some(entry.checksum);
                if let Some(handle) = self.tiers.get(entry.tier) {
                    tried.push((entry.tier, entry.key.clone()));
                    if let Some(record) = self.read(handle, &entry.key, id, expected).await {
                        return Ok(self.hit(record, entry.tier, Lookup::Index, started));
                    }
                }
                tracing::debug!(
                    "Index points {} at {} ({:?}) but it missed, probing all tiers",
                    id,
                    entry.tier,
                    entry.status
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Location index lookup for {} failed: {}, probing", id, e),
        }

        for handle in self.tiers.iter() {
            let key = handle.key_for(id);
            if tried.iter().any(|(t, k)| *t == handle.tier && *k == key) {
                continue;
            }
            if let Some(record) = self.read(handle, &key, id, expected).await {
                return Ok(self.hit(record, handle.tier, Lookup::Probe, started));
            }
            tried.push((handle.tier, key));
        }

        let elapsed = started.elapsed();
        self.sink.record(&AuditEvent {
            operation: Operation::Resolve,
            record: id.clone(),
            tier: None,
            latency: elapsed,
            outcome: Outcome::Miss,
        });
        tracing::debug!("{} not found after {} tier reads", id, tried.len());
        Err(ResolveError::NotFound(id.clone()))
    }

    /// 逐个解析，保持输入顺序
    pub async fn resolve_many(
        &self,
        ids: &[RecordId],
    ) -> Vec<(RecordId, Result<Resolved, ResolveError>)> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push((id.clone(), self.resolve(id).await));
        }
        out
    }

    /// 单层读：故障、超时、ID 不符、校验和不符一律视为该层未命中
    async fn read(
        &self,
        handle: &TierHandle,
        key: &str,
        id: &RecordId,
        expected: Option<u64>,
    ) -> Option<Record> {
        let started = Instant::now();
        let result = bounded(handle.tier, self.read_timeout, handle.read_record(key)).await;
        tracing::debug!(
            "read {} from {} in {:?}: {}",
            key,
            handle.tier,
            started.elapsed(),
            match &result {
                Ok(Some(_)) => "found",
                Ok(None) => "absent",
                Err(_) => "fault",
            }
        );
        match result {
            Ok(Some(record)) if &record.id != id => {
                tracing::warn!(
                    "{} tier returned {} for key {}, expected {}",
                    handle.tier,
                    record.id,
                    key,
                    id
                );
                None
            }
            Ok(Some(record)) => match expected {
                Some(sum) if record.checksum() != sum => {
                    tracing::warn!(
                        "{} tier copy of {} fails checksum ({:#x} != {:#x})",
                        handle.tier,
                        id,
                        record.checksum(),
                        sum
                    );
                    None
                }
                _ => Some(record),
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("{} tier read of {} failed: {}", handle.tier, id, e);
                None
            }
        }
    }

    fn hit(&self, record: Record, tier: Tier, lookup: Lookup, started: Instant) -> Resolved {
        let elapsed = started.elapsed();
        self.sink.record(&AuditEvent {
            operation: Operation::Resolve,
            record: record.id.clone(),
            tier: Some(tier),
            latency: elapsed,
            outcome: Outcome::Hit,
        });
        Resolved {
            record,
            tier,
            elapsed,
            lookup,
        }
    }
}
