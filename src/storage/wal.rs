use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::core::RecordId;
use crate::index::LocationEntry;

const WAL_MAGIC: u32 = 0x314C_5754; // "TWL1"
const WAL_VERSION: u32 = 1;
const WAL_HEADER_LEN: u64 = 8;
const CURRENT_NAME: &str = "locations.wal";
const SEAL_PREFIX: &str = "locations.wal.seal-";

fn now_seal_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// 帧校验：发现截断/随机翻转即可（非 cryptographic）
fn frame_checksum(data: &[u8]) -> u32 {
    (xxh3_64(data) & 0xFFFF_FFFF) as u32
}

/// 位置索引的一次变更（已通过 CAS 的结果，回放时无条件应用）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOp {
    Put(LocationEntry),
    Delete(RecordId),
}

#[derive(Clone, Debug)]
pub struct WalReplayResult {
    pub ops: Vec<IndexOp>,
    pub sealed_used: usize,
    pub truncated_tail_records: usize,
}

/// Append-only 位置索引日志（WAL）。
///
/// - current: locations.wal
/// - sealed: locations.wal.seal-<id>（checkpoint 边界切分）
///
/// 帧格式：`len:u32 | checksum:u32 | bincode(IndexOp)`。
pub struct WalStore {
    dir: PathBuf,
    current: PathBuf,
    file: Mutex<File>,
    last_seal: AtomicU64,
}

impl WalStore {
    pub fn open_in_dir(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let current = dir.join(CURRENT_NAME);
        let f = open_or_init(&current)?;
        let last_seal = list_sealed(&dir)?
            .last()
            .map(|(id, _)| *id)
            .unwrap_or(0);
        Ok(Self {
            dir,
            current,
            file: Mutex::new(f),
            last_seal: AtomicU64::new(last_seal),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 把 seal_id 下限抬到 `floor`（通常是快照里的 seal_id）。
    /// checkpoint 会删掉已被快照覆盖的 sealed 文件，只看目录会把下限退回 0；
    /// 时钟回拨时新 seal 可能落在快照之前，回放时被跳过。
    pub fn advance_seal_floor(&self, floor: u64) {
        self.last_seal.fetch_max(floor, Ordering::AcqRel);
    }

    /// 追加并 fsync：返回 Ok 之后这批变更在崩溃后可回放
    pub fn append(&self, ops: &[IndexOp]) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for op in ops {
            let payload = bincode::serialize(op)?;
            let len: u32 = payload
                .len()
                .try_into()
                .map_err(|_| anyhow::anyhow!("WAL record too large ({} bytes)", payload.len()))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&frame_checksum(&payload).to_le_bytes());
            buf.extend_from_slice(&payload);
        }
        let mut f = self.file.lock();
        f.write_all(&buf)?;
        f.sync_data()?;
        Ok(())
    }

    /// seal：把当前 WAL rename 成 sealed 文件，并创建新的空 WAL。
    /// 返回 seal_id（写进 snapshot，回放时只读更新的部分）。
    pub fn seal(&self) -> anyhow::Result<u64> {
        let mut f = self.file.lock();
        f.sync_all()?;

        // seal_id 必须单调，否则回放顺序会乱
        let prev = self.last_seal.load(Ordering::Acquire);
        let id = now_seal_id().max(prev + 1);
        let sealed = self.dir.join(format!("{SEAL_PREFIX}{id:016x}"));

        if self.current.exists() {
            std::fs::rename(&self.current, &sealed)?;
        }
        *f = open_or_init(&self.current)?;
        self.last_seal.store(id, Ordering::Release);
        Ok(id)
    }

    pub fn cleanup_sealed_up_to(&self, seal_id: u64) -> anyhow::Result<()> {
        if seal_id == 0 {
            return Ok(());
        }
        for (id, p) in list_sealed(&self.dir)? {
            if id <= seal_id {
                if let Err(e) = std::fs::remove_file(&p) {
                    tracing::warn!("Failed to remove sealed WAL {:?}: {}", p, e);
                }
            }
        }
        Ok(())
    }

    /// 回放：只读取 seal_id > checkpoint 的 sealed WAL + 当前 WAL。
    pub fn replay_since_seal(&self, checkpoint_seal_id: u64) -> anyhow::Result<WalReplayResult> {
        let sealed: Vec<(u64, PathBuf)> = list_sealed(&self.dir)?
            .into_iter()
            .filter(|(id, _)| *id > checkpoint_seal_id)
            .collect();

        let mut ops = Vec::new();
        let mut truncated = 0usize;
        for (_, p) in sealed.iter() {
            let (mut part, t, _) = read_wal_file(p)?;
            truncated += t;
            ops.append(&mut part);
        }
        // 持有锁读取 current，避免与并发 append 交错
        let _guard = self.file.lock();
        let (mut cur, t, _) = read_wal_file(&self.current)?;
        truncated += t;
        ops.append(&mut cur);

        Ok(WalReplayResult {
            ops,
            sealed_used: sealed.len(),
            truncated_tail_records: truncated,
        })
    }
}

fn write_header(f: &mut File) -> anyhow::Result<()> {
    f.write_all(&WAL_MAGIC.to_le_bytes())?;
    f.write_all(&WAL_VERSION.to_le_bytes())?;
    f.sync_data()?;
    Ok(())
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?)
}

fn open_or_init(path: &Path) -> anyhow::Result<File> {
    let exists = path.exists();
    let mut f = open_append(path)?;

    if !exists {
        write_header(&mut f)?;
        return Ok(f);
    }

    // 快速校验 header；不匹配则重建（避免历史垃圾文件导致读崩）。
    let mut hdr = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    let header_ok = f.read_exact(&mut hdr).is_ok()
        && u32::from_le_bytes(hdr[0..4].try_into()?) == WAL_MAGIC
        && u32::from_le_bytes(hdr[4..8].try_into()?) == WAL_VERSION;
    if !header_ok {
        tracing::warn!("WAL {:?} has an invalid header, starting a fresh log", path);
        let mut nf = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        write_header(&mut nf)?;
        drop(nf);
        return open_append(path);
    }

    // 截掉损坏的尾部：否则后续追加的记录会排在垃圾后面，回放读不到。
    let (_, truncated, good_len) = read_wal_file(path)?;
    if truncated > 0 {
        tracing::warn!(
            "WAL {:?}: dropping torn tail after {} bytes",
            path,
            good_len
        );
        let tf = OpenOptions::new().write(true).open(path)?;
        tf.set_len(good_len)?;
        tf.sync_all()?;
        drop(tf);
        return open_append(path);
    }

    Ok(f)
}

fn list_sealed(dir: &Path) -> anyhow::Result<Vec<(u64, PathBuf)>> {
    let mut sealed = Vec::new();
    for ent in std::fs::read_dir(dir)? {
        let Ok(ent) = ent else { continue };
        let p = ent.path();
        if let Some(id) = parse_seal_id(&p) {
            sealed.push((id, p));
        }
    }
    sealed.sort_by_key(|(id, _)| *id);
    Ok(sealed)
}

fn parse_seal_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(SEAL_PREFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// 返回 (ops, 被丢弃的尾部记录数, 最后一条完好记录之后的偏移)
fn read_wal_file(path: &Path) -> anyhow::Result<(Vec<IndexOp>, usize, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0, 0));
    }
    let mut f = File::open(path)?;

    let mut hdr = [0u8; 8];
    if f.read_exact(&mut hdr).is_err() {
        return Ok((Vec::new(), 0, 0));
    }
    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        return Ok((Vec::new(), 0, 0));
    }

    let mut out = Vec::new();
    let mut truncated_tail = 0usize;
    let mut good_len = WAL_HEADER_LEN;
    loop {
        let mut lb = [0u8; 8];
        match f.read_exact(&mut lb) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // 干净结尾或半个帧头
                let pos = f.stream_position()?;
                if pos > good_len {
                    truncated_tail += 1;
                }
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(lb[0..4].try_into()?) as usize;
        let crc = u32::from_le_bytes(lb[4..8].try_into()?);
        let mut buf = vec![0u8; len];
        if f.read_exact(&mut buf).is_err() {
            truncated_tail += 1;
            break;
        }
        if frame_checksum(&buf) != crc {
            // 校验失败：视为截断/损坏，停止读取（保守）。
            truncated_tail += 1;
            break;
        }
        match bincode::deserialize::<IndexOp>(&buf) {
            Ok(op) => out.push(op),
            Err(e) => {
                tracing::warn!("WAL {:?}: undecodable record, stopping replay: {}", path, e);
                truncated_tail += 1;
                break;
            }
        }
        good_len += 8 + len as u64;
    }
    Ok((out, truncated_tail, good_len))
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
        std::env::temp_dir().join(format!("tierkeep-wal-{}-{}", tag, nanos))
    }

    fn put(id: &str) -> IndexOp {
        let r = Record::new(id, b"x".to_vec(), Utc::now());
        IndexOp::Put(LocationEntry::resident(&r, Tier::Hot, format!("hot/00/{id}.bin")))
    }

    #[test]
    fn wal_append_seal_replay_respects_checkpoint() {
        let dir = unique_tmp_dir("basic");
        let wal = WalStore::open_in_dir(dir.clone()).unwrap();

        wal.append(&[put("a")]).unwrap();
        let seal1 = wal.seal().unwrap();
        wal.append(&[IndexOp::Delete(RecordId::new("b"))]).unwrap();

        // checkpoint=0：回放 sealed+current
        let r = wal.replay_since_seal(0).unwrap();
        assert_eq!(r.ops.len(), 2);
        assert_eq!(r.sealed_used, 1);

        // checkpoint=seal1：只回放 current
        let r2 = wal.replay_since_seal(seal1).unwrap();
        assert_eq!(r2.ops, vec![IndexOp::Delete(RecordId::new("b"))]);

        wal.cleanup_sealed_up_to(seal1).unwrap();
        assert_eq!(wal.replay_since_seal(0).unwrap().sealed_used, 0);
    }

    #[test]
    fn torn_tail_is_dropped_and_later_appends_survive() {
        let dir = unique_tmp_dir("torn");
        {
            let wal = WalStore::open_in_dir(dir.clone()).unwrap();
            wal.append(&[put("a")]).unwrap();
        }
        // 模拟写到一半崩溃：半个帧头
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(dir.join(CURRENT_NAME))
                .unwrap();
            f.write_all(&[7, 0, 0]).unwrap();
        }

        let wal = WalStore::open_in_dir(dir.clone()).unwrap();
        wal.append(&[put("b")]).unwrap();
        let r = wal.replay_since_seal(0).unwrap();
        assert_eq!(r.ops.len(), 2);
        assert_eq!(r.truncated_tail_records, 0);
    }

    #[test]
    fn seals_after_reopen_stay_above_the_snapshot_seal() {
        let dir = unique_tmp_dir("floor");
        // 快照记录的 seal 远在当前时钟之后，且对应 sealed 文件已被清理
        let snapshot_seal = now_seal_id() + 3_600_000_000_000;
        let wal = WalStore::open_in_dir(dir.clone()).unwrap();
        wal.advance_seal_floor(snapshot_seal);
        wal.advance_seal_floor(1);

        wal.append(&[put("a")]).unwrap();
        let id = wal.seal().unwrap();
        assert!(id > snapshot_seal);
        let r = wal.replay_since_seal(snapshot_seal).unwrap();
        assert_eq!(r.ops.len(), 1);
        assert_eq!(r.sealed_used, 1);
    }
}
