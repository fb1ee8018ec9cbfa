pub mod durable;
pub mod memory;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Record, RecordId, Tier};

pub use durable::DurableLocationIndex;
pub use memory::MemoryLocationIndex;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Resident,
    /// 瞬态：读者必须把记录视为仍在迁移前的层
    Migrating,
    Migrated,
    /// 源副本保留，停止自动迁移，等待人工处理
    MigrationFailed,
}

impl MigrationStatus {
    /// 已落定：记录完整地驻留在 `entry.tier`，可以被迁移任务认领
    pub fn is_settled(self) -> bool {
        matches!(self, MigrationStatus::Resident | MigrationStatus::Migrated)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub tier: Tier,
    pub key: String,
}

/// 位置条目：记录 ID -> 当前层/物理 key/迁移状态。
///
/// `tier`/`key` 永远指向“读者应该读的位置”：Migrating 期间仍是源位置，
/// 目标位置放在 `target` 里，直到 Migrated 才切换。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEntry {
    pub id: RecordId,
    pub tier: Tier,
    pub key: String,
    pub status: MigrationStatus,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub checksum: u64,
    pub failed_attempts: u32,
    pub revision: u64,
    pub target: Option<Placement>,
    /// 已迁出、尚未删除的旧副本（删除失败时留给下一轮清理）
    pub retired: Option<Placement>,
}

impl LocationEntry {
    pub fn resident(record: &Record, tier: Tier, key: impl Into<String>) -> Self {
        Self {
            id: record.id.clone(),
            tier,
            key: key.into(),
            status: MigrationStatus::Resident,
            created_at: record.created_at,
            size: record.size(),
            checksum: record.checksum(),
            failed_attempts: 0,
            revision: 0,
            target: None,
            retired: None,
        }
    }

    pub fn placement(&self) -> Placement {
        Placement {
            tier: self.tier,
            key: self.key.clone(),
        }
    }

    pub fn claim(&self, target: Placement) -> Self {
        Self {
            status: MigrationStatus::Migrating,
            target: Some(target),
            ..self.clone()
        }
    }

    /// Migrating -> Migrated(dest)；源位置记为待删除
    pub fn migrated(&self) -> Self {
        let target = self.target.clone().unwrap_or_else(|| self.placement());
        Self {
            tier: target.tier,
            key: target.key,
            status: MigrationStatus::Migrated,
            failed_attempts: 0,
            target: None,
            retired: Some(self.placement()),
            ..self.clone()
        }
    }

    /// 迁移失败：回到源层；失败次数达到上限则停在 MigrationFailed
    pub fn reverted(&self, max_failed_attempts: u32) -> Self {
        let failed_attempts = self.failed_attempts.saturating_add(1);
        let status = if failed_attempts >= max_failed_attempts {
            MigrationStatus::MigrationFailed
        } else {
            MigrationStatus::Resident
        };
        Self {
            status,
            failed_attempts,
            target: None,
            ..self.clone()
        }
    }

    /// 放弃认领但不计失败（崩溃恢复 / 取消）
    pub fn released(&self) -> Self {
        Self {
            status: MigrationStatus::Resident,
            target: None,
            ..self.clone()
        }
    }

    pub fn cleaned(&self) -> Self {
        Self {
            retired: None,
            ..self.clone()
        }
    }
}

/// `put` 的 compare-and-set 前置条件
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expect {
    Absent,
    Revision(u64),
    Any,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index conflict on {id}: {reason}")]
    Conflict { id: RecordId, reason: String },
    #[error("location index unavailable: {0}")]
    Unavailable(String),
    #[error("location index I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub resident: usize,
    pub migrating: usize,
    pub migrated: usize,
    pub migration_failed: usize,
}

impl TierCounts {
    pub fn total(&self) -> usize {
        self.resident + self.migrating + self.migrated + self.migration_failed
    }

    fn bump(&mut self, status: MigrationStatus) {
        match status {
            MigrationStatus::Resident => self.resident += 1,
            MigrationStatus::Migrating => self.migrating += 1,
            MigrationStatus::Migrated => self.migrated += 1,
            MigrationStatus::MigrationFailed => self.migration_failed += 1,
        }
    }
}

/// 各层记录分布（按当前 `entry.tier` 归类）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Distribution {
    pub tiers: BTreeMap<Tier, TierCounts>,
}

impl Distribution {
    pub fn total(&self) -> usize {
        self.tiers.values().map(TierCounts::total).sum()
    }

    pub fn count(&self, tier: Tier) -> usize {
        self.tiers.get(&tier).map(TierCounts::total).unwrap_or(0)
    }
}

/// 位置索引契约。
///
/// ## 契约（重要）
/// - 每个 ID 至多一个条目；单 ID 的状态迁移通过 `put` 的 CAS 线性化。
/// - `put` 一个 Migrating 条目时，当前条目必须存在且已落定，否则 `Conflict`：
///   这就是防止两个 worker 同时迁移同一条记录的互斥机制。
/// - 每次成功的 `put` 都会把 revision 加一，并返回实际存储的条目。
/// - `delete` 只用于终态清理策略，正常迁移不调用。
pub trait LocationIndex: Send + Sync {
    fn get(&self, id: &RecordId) -> Result<Option<LocationEntry>, IndexError>;
    fn put(&self, entry: LocationEntry, expect: Expect) -> Result<LocationEntry, IndexError>;
    fn delete(&self, id: &RecordId) -> Result<Option<LocationEntry>, IndexError>;
    /// `tier` 上已落定、`created_at <= created_before` 的条目，最老的在前。
    /// 旧副本尚未清理（`retired` 非空）的条目不参与选择。
    fn eligible(
        &self,
        tier: Tier,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LocationEntry>, IndexError>;
    fn in_flight(&self) -> Result<Vec<LocationEntry>, IndexError>;
    fn pending_cleanup(&self) -> Result<Vec<LocationEntry>, IndexError>;
    fn distribution(&self) -> Result<Distribution, IndexError>;
}

/// 两种索引实现共享的内存表 + CAS 规则
#[derive(Clone, Debug, Default)]
pub(crate) struct EntryTable {
    entries: HashMap<RecordId, LocationEntry>,
}

impl EntryTable {
    pub(crate) fn from_entries(entries: Vec<LocationEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, id: &RecordId) -> Option<&LocationEntry> {
        self.entries.get(id)
    }

    /// 只做校验，返回将要存储的条目（revision 已递增）
    pub(crate) fn check_put(
        &self,
        mut entry: LocationEntry,
        expect: Expect,
    ) -> Result<LocationEntry, IndexError> {
        let current = self.entries.get(&entry.id);
        let conflict = |reason: String| IndexError::Conflict {
            id: entry.id.clone(),
            reason,
        };

        match (expect, current) {
            (Expect::Absent, Some(cur)) => {
                return Err(conflict(format!("already present at revision {}", cur.revision)))
            }
            (Expect::Revision(want), Some(cur)) if cur.revision != want => {
                return Err(conflict(format!(
                    "revision {} expected, found {}",
                    want, cur.revision
                )))
            }
            (Expect::Revision(want), None) => {
                return Err(conflict(format!("revision {} expected, entry absent", want)))
            }
            _ => {}
        }

        if entry.status == MigrationStatus::Migrating {
            match current {
                Some(cur) if cur.status.is_settled() => {}
                Some(cur) => {
                    return Err(conflict(format!("cannot claim while {:?}", cur.status)));
                }
                None => return Err(conflict("cannot claim an unknown record".into())),
            }
        }

        entry.revision = current.map(|c| c.revision + 1).unwrap_or(1);
        Ok(entry)
    }

    /// 无条件写入（CAS 已通过，或来自 WAL 回放）
    pub(crate) fn store(&mut self, entry: LocationEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub(crate) fn remove(&mut self, id: &RecordId) -> Option<LocationEntry> {
        self.entries.remove(id)
    }

    pub(crate) fn eligible(
        &self,
        tier: Tier,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Vec<LocationEntry> {
        let mut picked: Vec<&LocationEntry> = self
            .entries
            .values()
            .filter(|e| {
                e.tier == tier
                    && e.status.is_settled()
                    && e.retired.is_none()
                    && e.created_at <= created_before
            })
            .collect();
        // 最老优先 + ID 决胜：同一批失败记录不会无限重复被挑中
        picked.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        picked.into_iter().take(limit).cloned().collect()
    }

    pub(crate) fn in_flight(&self) -> Vec<LocationEntry> {
        let mut v: Vec<LocationEntry> = self
            .entries
            .values()
            .filter(|e| e.status == MigrationStatus::Migrating)
            .cloned()
            .collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    pub(crate) fn pending_cleanup(&self) -> Vec<LocationEntry> {
        let mut v: Vec<LocationEntry> = self
            .entries
            .values()
            .filter(|e| e.retired.is_some() && e.status != MigrationStatus::Migrating)
            .cloned()
            .collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    pub(crate) fn distribution(&self) -> Distribution {
        let mut d = Distribution::default();
        for e in self.entries.values() {
            d.tiers.entry(e.tier).or_default().bump(e.status);
        }
        d
    }

    pub(crate) fn snapshot(&self) -> Vec<LocationEntry> {
        let mut v: Vec<LocationEntry> = self.entries.values().cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }
}
