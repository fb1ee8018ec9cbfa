use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Capabilities, TierError, TierStore};
use crate::core::Tier;

/// 内存层（DashMap 实现）：热层默认后端，也用于测试温/冷层。
pub struct MemoryTierStore {
    tier: Tier,
    caps: Capabilities,
    inner: DashMap<String, Vec<u8>>,
}

impl MemoryTierStore {
    pub fn new(tier: Tier) -> Self {
        Self::with_capabilities(tier, Capabilities::FULL)
    }

    pub fn write_once(tier: Tier) -> Self {
        Self::with_capabilities(tier, Capabilities::WRITE_ONCE)
    }

    pub fn with_capabilities(tier: Tier, caps: Capabilities) -> Self {
        Self {
            tier,
            caps,
            inner: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// 测试用：绕过 write-once 直接改写字节（模拟层内损坏）
    pub fn overwrite_raw(&self, key: &str, bytes: Vec<u8>) {
        self.inner.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl TierStore for MemoryTierStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn exists(&self, key: &str) -> Result<bool, TierError> {
        Ok(self.inner.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        Ok(self.inner.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TierError> {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(_) if self.caps.write_once => Err(TierError::WriteOnce {
                tier: self.tier,
                key: key.to_string(),
            }),
            Entry::Occupied(mut o) => {
                o.insert(bytes);
                Ok(())
            }
            Entry::Vacant(v) => {
                v.insert(bytes);
                Ok(())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, TierError> {
        if !self.caps.deletable {
            return Err(TierError::DeleteUnsupported { tier: self.tier });
        }
        Ok(self.inner.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_once_rejects_overwrite_but_allows_delete() {
        let store = MemoryTierStore::write_once(Tier::Cold);
        store.put("cold/00/a.json", b"1".to_vec()).await.unwrap();

        let err = store.put("cold/00/a.json", b"2".to_vec()).await.unwrap_err();
        assert!(matches!(err, TierError::WriteOnce { .. }));
        assert_eq!(store.get("cold/00/a.json").await.unwrap(), Some(b"1".to_vec()));

        assert!(store.delete("cold/00/a.json").await.unwrap());
        assert!(!store.delete("cold/00/a.json").await.unwrap());
        assert!(!store.exists("cold/00/a.json").await.unwrap());
    }

    #[tokio::test]
    async fn full_crud_on_hot_tier() {
        let store = MemoryTierStore::new(Tier::Hot);
        assert_eq!(store.get("hot/01/x.bin").await.unwrap(), None);
        store.put("hot/01/x.bin", b"a".to_vec()).await.unwrap();
        store.put("hot/01/x.bin", b"b".to_vec()).await.unwrap();
        assert_eq!(store.get("hot/01/x.bin").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.keys(), vec!["hot/01/x.bin".to_string()]);
    }
}
