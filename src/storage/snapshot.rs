use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::index::LocationEntry;

/// 快照文件 Header
const MAGIC: u32 = 0x544B_5358; // "XSKT"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8; // magic + version + state + data_len + checksum

/// 位置索引快照：`seal_id` 之前的 WAL 已全部折叠进 `entries`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub seal_id: u64,
    pub entries: Vec<LocationEntry>,
}

/// 原子快照存储（atomic replacement）
///
/// 落盘流程：
/// 1) 写 locations.snap.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into(file)` 流式写 body，边写边算 xxh3 / data_len
/// 3) seek 回开头覆盖 COMMITTED header（写入真实 len/checksum）
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target) — 原子替换（POSIX 保证）
/// 6) fsync(dir) — 确保目录项更新落盘
///
/// 任一步崩溃，target 都保持旧快照；加载时校验 magic/version/state/len/checksum，
/// 任何不一致都拒绝（调用方回退到空表 + 全量 WAL 回放）。
pub struct SnapshotStore {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn encode_header(state: u32, data_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..20].copy_from_slice(&data_len.to_le_bytes());
    header[20..28].copy_from_slice(&checksum.to_le_bytes());
    header
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照（校验 magic/version/state/checksum）；无效返回 None
    pub async fn load_if_valid(&self) -> anyhow::Result<Option<IndexSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path).await?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Snapshot too small, ignoring");
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u64::from_le_bytes(data[12..20].try_into()?) as usize;
        let stored_checksum = u64::from_le_bytes(data[20..28].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!(
                "Snapshot version mismatch: {} != {}",
                version,
                VERSION_CURRENT
            );
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Snapshot state INCOMPLETE, ignoring");
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Snapshot data length mismatch");
            return Ok(None);
        }

        let computed = xxh3_64(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Snapshot checksum mismatch: {:#x} != {:#x}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<IndexSnapshot>(body) {
            Ok(snap) => Ok(Some(snap)),
            Err(e) => {
                tracing::warn!("Snapshot deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    /// 原子写入快照
    pub async fn write_atomic(&self, snap: &IndexSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("snap.tmp");

        // 1) INCOMPLETE header，然后流式写 body（不把整个 body 序列化进一个巨型 Vec）
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&encode_header(STATE_INCOMPLETE, 0, 0))?;

        // 2) 流式写 body 并计算长度/校验
        let (data_len, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, snap)?;
            cw.finish()
        };

        // 3) seek 回开头覆盖 COMMITTED header
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(STATE_COMMITTED, data_len, checksum))?;

        // 4) fsync — 确保数据与 header 都落盘
        file.sync_all()?;
        drop(file);

        // 5) rename 原子替换
        std::fs::rename(&tmp_path, &self.path)?;

        // 6) fsync(dir)
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::info!(
            "Location snapshot written: {} entries, {} bytes (seal {:#x})",
            snap.entries.len(),
            HEADER_SIZE as u64 + data_len,
            snap.seal_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Record, Tier};
    use chrono::Utc;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("tierkeep-snap-{}-{}", tag, nanos))
    }

    fn sample() -> IndexSnapshot {
        let r = Record::new("R-001", b"{}".to_vec(), Utc::now());
        IndexSnapshot {
            seal_id: 42,
            entries: vec![LocationEntry::resident(&r, Tier::Hot, "hot/00/R-001.bin")],
        }
    }

    #[tokio::test]
    async fn committed_snapshot_loads_back() {
        let dir = unique_tmp_dir("ok");
        let store = SnapshotStore::new(dir.join("locations.snap"));
        store.write_atomic(&sample()).await.unwrap();

        let loaded = store.load_if_valid().await.unwrap().unwrap();
        assert_eq!(loaded.seal_id, 42);
        assert_eq!(loaded.entries, sample().entries);
        assert!(!dir.join("locations.snap.tmp").exists());
    }

    #[tokio::test]
    async fn flipped_body_byte_is_rejected() {
        let dir = unique_tmp_dir("corrupt");
        let store = SnapshotStore::new(dir.join("locations.snap"));
        store.write_atomic(&sample()).await.unwrap();

        let mut bytes = std::fs::read(store.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(store.path(), bytes).unwrap();

        assert!(store.load_if_valid().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn incomplete_header_is_rejected() {
        let dir = unique_tmp_dir("incomplete");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("locations.snap");
        let body = bincode::serialize(&sample()).unwrap();
        let mut bytes = encode_header(STATE_INCOMPLETE, body.len() as u64, xxh3_64(&body)).to_vec();
        bytes.extend_from_slice(&body);
        std::fs::write(&path, bytes).unwrap();

        assert!(SnapshotStore::new(path).load_if_valid().await.unwrap().is_none());
    }
}
