use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// 账单记录 ID：一经分配不可变。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for RecordId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// 账单记录。
///
/// `payload` 是不透明的序列化账单文档，跨层迁移只改变位置，不改变内容；
/// 目标层编码不同时允许重新序列化，但必须无损往返（见 `checksum`）。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, payload: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            payload,
            created_at,
            modified_at: created_at,
        }
    }

    /// 年龄按创建时间计算（账期由创建时间定义，不看 modified_at）
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// 内容校验和：与编码无关，迁移校验以此为准。
    pub fn checksum(&self) -> u64 {
        let mut h = Xxh3::new();
        h.update(self.id.as_str().as_bytes());
        h.update(&[0]);
        h.update(&(self.payload.len() as u64).to_le_bytes());
        h.update(&self.payload);
        for ts in [self.created_at, self.modified_at] {
            h.update(&ts.timestamp().to_le_bytes());
            h.update(&ts.timestamp_subsec_nanos().to_le_bytes());
        }
        h.digest()
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn age_ignores_modification_time() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut r = Record::new("R-001", b"{}".to_vec(), created);
        r.modified_at = created + chrono::Duration::days(20);

        let now = created + chrono::Duration::days(35);
        assert_eq!(r.age(now).num_days(), 35);
    }

    #[test]
    fn checksum_changes_with_payload_or_id() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let a = Record::new("R-001", b"{\"amount\":12}".to_vec(), created);
        let b = a.clone();
        assert_eq!(a.checksum(), b.checksum());

        let mut c = a.clone();
        c.payload[2] ^= 0x20;
        assert_ne!(a.checksum(), c.checksum());

        let mut d = a.clone();
        d.id = RecordId::new("R-002");
        assert_ne!(a.checksum(), d.checksum());
    }
}
