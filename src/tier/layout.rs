//! 物理 key 布局：`<prefix>/<shard>/<escaped id>.<ext>`
//!
//! key 只由 (层前缀, 记录 ID, 编码) 决定，所以索引缺失时回退探测也能算出每一层的 key。
//! 前缀同时是与外部生命周期策略划分所有权的边界（见 `policy`）。

use std::fmt::Write;

use xxhash_rust::xxh3::xxh3_64;

use super::Codec;
use crate::core::RecordId;

/// 统一成 `xxx/` 形式；空前缀保持为空（key 直接从分片目录开始）
pub fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

pub fn record_key(prefix: &str, id: &RecordId, codec: Codec) -> String {
    let shard = (xxh3_64(id.as_str().as_bytes()) & 0xff) as u8;
    format!(
        "{}{:02x}/{}.{}",
        normalize_prefix(prefix),
        shard,
        escape_id(id.as_str()),
        codec.extension()
    )
}

/// ID 转义：保留 `[A-Za-z0-9_-]`，其余字节写成 `%XX`（单射，不会产生 `..` 或 `/`）
fn escape_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_and_prefixed() {
        let id = RecordId::new("R-001");
        let a = record_key("warm", &id, Codec::Json);
        let b = record_key("/warm/", &id, Codec::Json);
        assert_eq!(a, b);
        assert!(a.starts_with("warm/"));
        assert!(a.ends_with("/R-001.json"));
    }

    #[test]
    fn escaping_keeps_distinct_ids_distinct() {
        let k1 = record_key("hot", &RecordId::new("cust/1"), Codec::Bincode);
        let k2 = record_key("hot", &RecordId::new("cust_1"), Codec::Bincode);
        let k3 = record_key("hot", &RecordId::new("../etc"), Codec::Bincode);
        assert_ne!(
            k1.rsplit('/').next().unwrap(),
            k2.rsplit('/').next().unwrap()
        );
        assert!(!k3.contains(".."));
        assert_eq!(k3.matches('/').count(), 2);
    }
}
