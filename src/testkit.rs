//! 测试夹具：故障注入层存储、离线索引、内存层集合。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::core::{Record, RecordId, Tier};
use crate::index::{
    Distribution, Expect, IndexError, LocationEntry, LocationIndex, MemoryLocationIndex,
};
use crate::tier::{Capabilities, Codec, MemoryTierStore, TierError, TierHandle, TierSet, TierStore};

pub fn unique_tmp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("tierkeep-{}-{}", tag, nanos))
}

pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(n)
}

pub fn record(id: &str, created_day: i64) -> Record {
    let payload = format!(r#"{{"id":"{id}","amount":{}}}"#, created_day * 100);
    Record::new(id, payload.into_bytes(), day(created_day))
}

/// 包一层内存存储，按 key 子串注入故障
pub struct FlakyStore {
    inner: MemoryTierStore,
    offline: AtomicBool,
    failing_gets: Mutex<HashSet<String>>,
    corrupt_puts: Mutex<HashSet<String>>,
    failing_deletes: AtomicU32,
    slow_gets: Mutex<Option<Duration>>,
}

impl FlakyStore {
    pub fn new(tier: Tier) -> Self {
        Self::wrap(MemoryTierStore::new(tier))
    }

    pub fn write_once(tier: Tier) -> Self {
        Self::wrap(MemoryTierStore::write_once(tier))
    }

    fn wrap(inner: MemoryTierStore) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            failing_gets: Mutex::new(HashSet::new()),
            corrupt_puts: Mutex::new(HashSet::new()),
            failing_deletes: AtomicU32::new(0),
            slow_gets: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &MemoryTierStore {
        &self.inner
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_gets_matching(&self, pattern: &str) {
        self.failing_gets.lock().insert(pattern.to_string());
    }

    /// 写入时把内容替换成垃圾（校验必然失败）
    pub fn corrupt_puts_matching(&self, pattern: &str) {
        self.corrupt_puts.lock().insert(pattern.to_string());
    }

    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn slow_gets(&self, by: Duration) {
        *self.slow_gets.lock() = Some(by);
    }

    fn check_online(&self) -> Result<(), TierError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(self.unavailable("offline"));
        }
        Ok(())
    }

    fn unavailable(&self, reason: &str) -> TierError {
        TierError::Unavailable {
            tier: self.inner.tier(),
            reason: reason.to_string(),
        }
    }

    fn matches(set: &Mutex<HashSet<String>>, key: &str) -> bool {
        set.lock().iter().any(|p| key.contains(p.as_str()))
    }
}

#[async_trait]
impl TierStore for FlakyStore {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn exists(&self, key: &str) -> Result<bool, TierError> {
        self.check_online()?;
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.check_online()?;
        let delay = *self.slow_gets.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if Self::matches(&self.failing_gets, key) {
            return Err(self.unavailable("injected get fault"));
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TierError> {
        self.check_online()?;
        if Self::matches(&self.corrupt_puts, key) {
            return self.inner.put(key, b"\x00garbage".to_vec()).await;
        }
        self.inner.put(key, bytes).await
    }

    async fn delete(&self, key: &str) -> Result<bool, TierError> {
        self.check_online()?;
        let pending = self.failing_deletes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_deletes.store(pending - 1, Ordering::SeqCst);
            return Err(self.unavailable("injected delete fault"));
        }
        self.inner.delete(key).await
    }
}

/// 永远不可用的位置索引
pub struct OfflineIndex;

impl OfflineIndex {
    fn down() -> IndexError {
        IndexError::Unavailable("index offline".into())
    }
}

impl LocationIndex for OfflineIndex {
    fn get(&self, _id: &RecordId) -> Result<Option<LocationEntry>, IndexError> {
        Err(Self::down())
    }
    fn put(&self, _entry: LocationEntry, _expect: Expect) -> Result<LocationEntry, IndexError> {
        Err(Self::down())
    }
    fn delete(&self, _id: &RecordId) -> Result<Option<LocationEntry>, IndexError> {
        Err(Self::down())
    }
    fn eligible(
        &self,
        _tier: Tier,
        _created_before: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<LocationEntry>, IndexError> {
        Err(Self::down())
    }
    fn in_flight(&self) -> Result<Vec<LocationEntry>, IndexError> {
        Err(Self::down())
    }
    fn pending_cleanup(&self) -> Result<Vec<LocationEntry>, IndexError> {
        Err(Self::down())
    }
    fn distribution(&self) -> Result<Distribution, IndexError> {
        Err(Self::down())
    }
}

/// 三层内存存储（冷层 write-once）+ 内存索引
pub struct Fixture {
    pub hot: Arc<FlakyStore>,
    pub warm: Arc<FlakyStore>,
    pub cold: Arc<FlakyStore>,
    pub tiers: TierSet,
    pub index: Arc<MemoryLocationIndex>,
}

impl Fixture {
    pub fn new() -> Self {
        let hot = Arc::new(FlakyStore::new(Tier::Hot));
        let warm = Arc::new(FlakyStore::new(Tier::Warm));
        let cold = Arc::new(FlakyStore::write_once(Tier::Cold));
        let tiers = TierSet::new()
            .with(TierHandle::with_defaults(hot.clone(), Codec::Bincode))
            .with(TierHandle::with_defaults(warm.clone(), Codec::Json))
            .with(TierHandle::with_defaults(cold.clone(), Codec::Json));
        Self {
            hot,
            warm,
            cold,
            tiers,
            index: Arc::new(MemoryLocationIndex::new()),
        }
    }

    pub fn store(&self, tier: Tier) -> &FlakyStore {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    /// 直接写入某层并登记 Resident 条目
    pub async fn seed(&self, record: &Record, tier: Tier) -> LocationEntry {
        let entry = self.place(record, tier).await;
        self.index.put(entry, Expect::Absent).unwrap()
    }

    /// 只写层存储，不登记索引
    pub async fn place(&self, record: &Record, tier: Tier) -> LocationEntry {
        let handle = self.tiers.get(tier).unwrap();
        let key = handle.key_for(&record.id);
        handle.write_record(&key, record).await.unwrap();
        LocationEntry::resident(record, tier, key)
    }

    pub fn holds(&self, tier: Tier, id: &str) -> bool {
        let handle = self.tiers.get(tier).unwrap();
        let key = handle.key_for(&RecordId::new(id));
        self.store(tier).inner().keys().contains(&key)
    }
}
