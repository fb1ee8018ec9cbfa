use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{Distribution, EntryTable, Expect, IndexError, LocationEntry, LocationIndex};
use crate::core::{RecordId, Tier};

/// 纯内存位置索引（测试 / 无持久化需求的嵌入场景）。
#[derive(Default)]
pub struct MemoryLocationIndex {
    table: RwLock<EntryTable>,
}

impl MemoryLocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocationIndex for MemoryLocationIndex {
    fn get(&self, id: &RecordId) -> Result<Option<LocationEntry>, IndexError> {
        Ok(self.table.read().get(id).cloned())
    }

    fn put(&self, entry: LocationEntry, expect: Expect) -> Result<LocationEntry, IndexError> {
        let mut table = self.table.write();
        let stored = table.check_put(entry, expect)?;
        table.store(stored.clone());
        Ok(stored)
    }

    fn delete(&self, id: &RecordId) -> Result<Option<LocationEntry>, IndexError> {
        Ok(self.table.write().remove(id))
    }

    fn eligible(
        &self,
        tier: Tier,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LocationEntry>, IndexError> {
        Ok(self.table.read().eligible(tier, created_before, limit))
    }

    fn in_flight(&self) -> Result<Vec<LocationEntry>, IndexError> {
        Ok(self.table.read().in_flight())
    }

    fn pending_cleanup(&self) -> Result<Vec<LocationEntry>, IndexError> {
        Ok(self.table.read().pending_cleanup())
    }

    fn distribution(&self) -> Result<Distribution, IndexError> {
        Ok(self.table.read().distribution())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use crate::index::{MigrationStatus, Placement};
    use chrono::TimeZone;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(n)
    }

    fn resident(id: &str, created_day: i64) -> LocationEntry {
        let r = Record::new(id, id.as_bytes().to_vec(), day(created_day));
        LocationEntry::resident(&r, Tier::Hot, format!("hot/00/{id}.bin"))
    }

    fn warm_target(id: &str) -> Placement {
        Placement {
            tier: Tier::Warm,
            key: format!("warm/00/{id}.json"),
        }
    }

    #[test]
    fn create_is_absent_only() {
        let idx = MemoryLocationIndex::new();
        let stored = idx.put(resident("a", 0), Expect::Absent).unwrap();
        assert_eq!(stored.revision, 1);

        let err = idx.put(resident("a", 0), Expect::Absent).unwrap_err();
        assert!(matches!(err, IndexError::Conflict { .. }));
    }

    #[test]
    fn only_one_claim_wins_for_the_same_revision() {
        let idx = MemoryLocationIndex::new();
        let e = idx.put(resident("a", 0), Expect::Absent).unwrap();

        let first = idx.put(e.claim(warm_target("a")), Expect::Revision(e.revision));
        let second = idx.put(e.claim(warm_target("a")), Expect::Revision(e.revision));
        assert!(first.is_ok());
        assert!(matches!(second, Err(IndexError::Conflict { .. })));
    }

    #[test]
    fn claim_requires_settled_status_even_without_revision_check() {
        let idx = MemoryLocationIndex::new();
        let e = idx.put(resident("a", 0), Expect::Absent).unwrap();
        let claimed = idx
            .put(e.claim(warm_target("a")), Expect::Revision(e.revision))
            .unwrap();

        let again = idx.put(claimed.claim(warm_target("a")), Expect::Any);
        assert!(matches!(again, Err(IndexError::Conflict { .. })));

        let failed = idx
            .put(claimed.reverted(1), Expect::Revision(claimed.revision))
            .unwrap();
        assert_eq!(failed.status, MigrationStatus::MigrationFailed);
        let parked = idx.put(failed.claim(warm_target("a")), Expect::Any);
        assert!(matches!(parked, Err(IndexError::Conflict { .. })));
    }

    #[test]
    fn migrated_entry_points_at_destination_and_remembers_source() {
        let e = resident("a", 0).claim(warm_target("a"));
        let m = e.migrated();
        assert_eq!(m.tier, Tier::Warm);
        assert_eq!(m.status, MigrationStatus::Migrated);
        assert_eq!(m.retired.as_ref().map(|p| p.tier), Some(Tier::Hot));
        assert!(m.status.is_settled());
    }

    #[test]
    fn eligible_is_oldest_first_bounded_and_settled_only() {
        let idx = MemoryLocationIndex::new();
        for (id, d) in [("c", 3), ("a", 1), ("b", 1), ("new", 40)] {
            idx.put(resident(id, d), Expect::Absent).unwrap();
        }
        let busy = idx.get(&RecordId::new("c")).unwrap().unwrap();
        idx.put(busy.claim(warm_target("c")), Expect::Revision(busy.revision))
            .unwrap();

        let picked = idx.eligible(Tier::Hot, day(10), 10).unwrap();
        let ids: Vec<&str> = picked.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let one = idx.eligible(Tier::Hot, day(10), 1).unwrap();
        assert_eq!(one.len(), 1);
        assert!(idx.eligible(Tier::Warm, day(100), 10).unwrap().is_empty());
    }

    #[test]
    fn distribution_groups_by_current_tier() {
        let idx = MemoryLocationIndex::new();
        let a = idx.put(resident("a", 0), Expect::Absent).unwrap();
        idx.put(resident("b", 0), Expect::Absent).unwrap();
        idx.put(a.claim(warm_target("a")).migrated(), Expect::Any)
            .unwrap();

        let d = idx.distribution().unwrap();
        assert_eq!(d.count(Tier::Hot), 1);
        assert_eq!(d.tiers[&Tier::Warm].migrated, 1);
        assert_eq!(d.total(), 2);
    }
}
