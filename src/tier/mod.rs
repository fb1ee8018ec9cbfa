pub mod blob;
pub mod codec;
pub mod layout;
pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Record, RecordId, Tier};

pub use blob::BlobTierStore;
pub use codec::Codec;
pub use memory::MemoryTierStore;

#[derive(Debug, Error)]
pub enum TierError {
    #[error("{tier} tier unavailable: {reason}")]
    Unavailable { tier: Tier, reason: String },
    #[error("{tier} tier I/O timed out after {after:?}")]
    Timeout { tier: Tier, after: Duration },
    #[error("{tier} tier is write-once and already holds {key}")]
    WriteOnce { tier: Tier, key: String },
    #[error("{tier} tier does not support delete")]
    DeleteUnsupported { tier: Tier },
    #[error("{tier} tier I/O error: {source}")]
    Io {
        tier: Tier,
        #[source]
        source: std::io::Error,
    },
    #[error("codec error: {0}")]
    Codec(String),
}

impl TierError {
    /// 瞬时故障：允许在单条记录范围内有限次重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TierError::Unavailable { .. } | TierError::Timeout { .. } | TierError::Io { .. }
        )
    }
}

/// 层能力：热层完整 CRUD；冷层可以是 write-once。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub write_once: bool,
    pub deletable: bool,
}

impl Capabilities {
    pub const FULL: Capabilities = Capabilities {
        write_once: false,
        deletable: true,
    };
    pub const WRITE_ONCE: Capabilities = Capabilities {
        write_once: true,
        deletable: true,
    };
}

/// 层存储契约（外部协作者实现；本 crate 只消费这个接口）。
///
/// ## 契约
/// - `get` 对不存在的 key 返回 `Ok(None)`，不是错误。
/// - `put` 在 write-once 层上遇到已存在的 key 必须返回 `TierError::WriteOnce`。
/// - 单 key 操作由实现自身保证一致性。
#[async_trait]
pub trait TierStore: Send + Sync {
    fn tier(&self) -> Tier;
    fn capabilities(&self) -> Capabilities;
    async fn exists(&self, key: &str) -> Result<bool, TierError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TierError>;
    async fn delete(&self, key: &str) -> Result<bool, TierError>;
}

/// 给一次层 I/O 加上延迟上限；超时按瞬时故障处理。
pub async fn bounded<T, F>(tier: Tier, limit: Duration, fut: F) -> Result<T, TierError>
where
    F: Future<Output = Result<T, TierError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(TierError::Timeout { tier, after: limit }),
    }
}

/// 一个层的完整句柄：store + 编码 + key 前缀。
#[derive(Clone)]
pub struct TierHandle {
    pub tier: Tier,
    pub store: Arc<dyn TierStore>,
    pub codec: Codec,
    pub prefix: String,
}

impl TierHandle {
    pub fn new(store: Arc<dyn TierStore>, codec: Codec, prefix: impl Into<String>) -> Self {
        Self {
            tier: store.tier(),
            store,
            codec,
            prefix: layout::normalize_prefix(&prefix.into()),
        }
    }

    /// 默认句柄：前缀即层名（hot/ warm/ cold/）
    pub fn with_defaults(store: Arc<dyn TierStore>, codec: Codec) -> Self {
        let prefix = store.tier().as_str().to_string();
        Self::new(store, codec, prefix)
    }

    pub fn key_for(&self, id: &RecordId) -> String {
        layout::record_key(&self.prefix, id, self.codec)
    }

    pub async fn read_record(&self, key: &str) -> Result<Option<Record>, TierError> {
        match self.store.get(key).await? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// 返回写入的字节数
    pub async fn write_record(&self, key: &str, record: &Record) -> Result<u64, TierError> {
        let bytes = self.codec.encode(record)?;
        let len = bytes.len() as u64;
        self.store.put(key, bytes).await?;
        Ok(len)
    }
}

/// 按固定顺序（热 -> 温 -> 冷）排列的层句柄集合。
#[derive(Clone, Default)]
pub struct TierSet {
    handles: [Option<TierHandle>; 3],
}

impl TierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handle: TierHandle) -> Self {
        let slot = handle.tier.index();
        self.handles[slot] = Some(handle);
        self
    }

    pub fn get(&self, tier: Tier) -> Option<&TierHandle> {
        self.handles[tier.index()].as_ref()
    }

    /// 探测顺序迭代；未配置的层直接跳过
    pub fn iter(&self) -> impl Iterator<Item = &TierHandle> {
        self.handles.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_set_iterates_in_probe_order_regardless_of_insert_order() {
        let set = TierSet::new()
            .with(TierHandle::with_defaults(
                Arc::new(MemoryTierStore::new(Tier::Cold)),
                Codec::Json,
            ))
            .with(TierHandle::with_defaults(
                Arc::new(MemoryTierStore::new(Tier::Hot)),
                Codec::Bincode,
            ));

        let order: Vec<Tier> = set.iter().map(|h| h.tier).collect();
        assert_eq!(order, vec![Tier::Hot, Tier::Cold]);
        assert!(set.get(Tier::Warm).is_none());
        assert_eq!(set.get(Tier::Cold).unwrap().prefix, "cold/");
    }

    #[tokio::test]
    async fn bounded_turns_slow_io_into_transient_timeout() {
        let r: Result<(), TierError> = bounded(Tier::Cold, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = r.unwrap_err();
        assert!(matches!(err, TierError::Timeout { tier: Tier::Cold, .. }));
        assert!(err.is_transient());
    }
}
