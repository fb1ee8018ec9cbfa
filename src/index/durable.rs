use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Distribution, EntryTable, Expect, IndexError, LocationEntry, LocationIndex};
use crate::core::{RecordId, Tier};
use crate::storage::{IndexOp, IndexSnapshot, SnapshotStore, WalStore};

/// 持久化位置索引：内存表 + WAL + 原子快照。
///
/// 与热层同址（默认在热层数据目录下的 `_index/`），查询只走内存表。
/// 每次变更先过 CAS，再写 WAL（fsync），最后才更新内存表；
/// WAL 写失败时内存表保持不变，调用方拿到 `Unavailable`。
pub struct DurableLocationIndex {
    dir: PathBuf,
    table: Mutex<EntryTable>,
    wal: WalStore,
    snapshots: SnapshotStore,
}

impl DurableLocationIndex {
    /// 打开：加载有效快照，再回放快照之后的 WAL
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let snapshots = SnapshotStore::new(dir.join("locations.snap"));

        let (mut table, seal_id) = match snapshots.load_if_valid().await {
            Ok(Some(snap)) => {
                tracing::info!("Loaded location snapshot: {} entries", snap.entries.len());
                (EntryTable::from_entries(snap.entries), snap.seal_id)
            }
            Ok(None) => {
                tracing::info!("No valid location snapshot, replaying full WAL");
                (EntryTable::default(), 0)
            }
            Err(e) => {
                tracing::warn!("Failed to load location snapshot: {}, replaying full WAL", e);
                (EntryTable::default(), 0)
            }
        };

        let wal = WalStore::open_in_dir(dir.clone())?;
        wal.advance_seal_floor(seal_id);
        let replay = wal.replay_since_seal(seal_id)?;
        if replay.truncated_tail_records > 0 {
            tracing::warn!(
                "Location WAL replay dropped {} torn record(s)",
                replay.truncated_tail_records
            );
        }
        let replayed = replay.ops.len();
        for op in replay.ops {
            match op {
                IndexOp::Put(entry) => table.store(entry),
                IndexOp::Delete(id) => {
                    table.remove(&id);
                }
            }
        }
        tracing::info!(
            "Location index ready at {:?}: {} entries ({} WAL ops from {} sealed + current)",
            dir,
            table.len(),
            replayed,
            replay.sealed_used
        );

        Ok(Self {
            dir,
            table: Mutex::new(table),
            wal,
            snapshots,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 把当前表折叠成快照，并清理已覆盖的 WAL。
    ///
    /// seal 与拷贝表在同一把锁内完成：快照恰好等于 seal 之前的全部变更。
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let snap = {
            let table = self.table.lock();
            let seal_id = self.wal.seal()?;
            IndexSnapshot {
                seal_id,
                entries: table.snapshot(),
            }
        };
        self.snapshots.write_atomic(&snap).await?;
        self.wal.cleanup_sealed_up_to(snap.seal_id)?;
        Ok(())
    }

    fn log(&self, op: IndexOp) -> Result<(), IndexError> {
        self.wal
            .append(std::slice::from_ref(&op))
            .map_err(|e| IndexError::Unavailable(format!("WAL append failed: {e}")))
    }
}

impl LocationIndex for DurableLocationIndex {
    fn get(&self, id: &RecordId) -> Result<Option<LocationEntry>, IndexError> {
        Ok(self.table.lock().get(id).cloned())
    }

    fn put(&self, entry: LocationEntry, expect: Expect) -> Result<LocationEntry, IndexError> {
        let mut table = self.table.lock();
        let stored = table.check_put(entry, expect)?;
        self.log(IndexOp::Put(stored.clone()))?;
        table.store(stored.clone());
        Ok(stored)
    }

    fn delete(&self, id: &RecordId) -> Result<Option<LocationEntry>, IndexError> {
        let mut table = self.table.lock();
        if table.get(id).is_none() {
            return Ok(None);
        }
        self.log(IndexOp::Delete(id.clone()))?;
        Ok(table.remove(id))
    }

    fn eligible(
        &self,
        tier: Tier,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LocationEntry>, IndexError> {
        Ok(self.table.lock().eligible(tier, created_before, limit))
    }

    fn in_flight(&self) -> Result<Vec<LocationEntry>, IndexError> {
        Ok(self.table.lock().in_flight())
    }

    fn pending_cleanup(&self) -> Result<Vec<LocationEntry>, IndexError> {
        Ok(self.table.lock().pending_cleanup())
    }

    fn distribution(&self) -> Result<Distribution, IndexError> {
        Ok(self.table.lock().distribution())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use crate::index::{MigrationStatus, Placement};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("tierkeep-index-{}-{}", tag, nanos))
    }

    fn resident(id: &str) -> LocationEntry {
        let r = Record::new(id, b"{}".to_vec(), Utc::now());
        LocationEntry::resident(&r, Tier::Hot, format!("hot/00/{id}.bin"))
    }

    #[tokio::test]
    async fn reopen_replays_wal_including_stranded_claims() {
        let dir = unique_tmp_dir("replay");
        {
            let idx = DurableLocationIndex::open(&dir).await.unwrap();
            let a = idx.put(resident("a"), Expect::Absent).unwrap();
            idx.put(resident("b"), Expect::Absent).unwrap();
            idx.put(
                a.claim(Placement {
                    tier: Tier::Warm,
                    key: "warm/00/a.json".into(),
                }),
                Expect::Revision(a.revision),
            )
            .unwrap();
            idx.delete(&RecordId::new("b")).unwrap();
            // 不 checkpoint，直接“崩溃”
        }

        let idx = DurableLocationIndex::open(&dir).await.unwrap();
        assert_eq!(idx.len(), 1);
        let a = idx.get(&RecordId::new("a")).unwrap().unwrap();
        assert_eq!(a.status, MigrationStatus::Migrating);
        assert_eq!(a.revision, 2);
        assert_eq!(idx.in_flight().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_then_more_writes_survive_reopen() {
        let dir = unique_tmp_dir("checkpoint");
        {
            let idx = DurableLocationIndex::open(&dir).await.unwrap();
            idx.put(resident("a"), Expect::Absent).unwrap();
            idx.checkpoint().await.unwrap();
            idx.put(resident("b"), Expect::Absent).unwrap();
        }

        let idx = DurableLocationIndex::open(&dir).await.unwrap();
        assert_eq!(idx.len(), 2);
        // CAS 语义在重启后仍然成立
        let dup = idx.put(resident("a"), Expect::Absent);
        assert!(matches!(dup, Err(IndexError::Conflict { .. })));
    }
}
