use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{Capabilities, TierError, TierStore};
use crate::core::Tier;

/// 目录型 blob 层（温/冷层默认后端）。
///
/// 写入流程与 snapshot 相同：写 `<key>.tmp-<nanos>` -> fsync -> rename，
/// 所以读者永远看不到半截 blob；崩溃只会留下 tmp 文件，不会破坏已有对象。
/// 写入被中途丢弃时由 `TmpGuard` 删掉 tmp；崩溃留下的由 `open` 清扫。
pub struct BlobTierStore {
    tier: Tier,
    caps: Capabilities,
    root: PathBuf,
}

impl BlobTierStore {
    pub fn open(tier: Tier, root: PathBuf, caps: Capabilities) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)?;
        let swept = sweep_orphan_tmps(&root);
        if swept > 0 {
            tracing::info!("Removed {} orphaned temp file(s) from {} tier at {:?}", swept, tier, root);
        }
        tracing::debug!("Opened {} blob tier at {:?} ({:?})", tier, root, caps);
        Ok(Self { tier, caps, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, TierError> {
        let rel = Path::new(key);
        // key 来自 layout，正常不会越界；这里拒绝 `..`/绝对路径，避免写出 root。
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(TierError::Io {
                tier: self.tier,
                source: std::io::Error::new(ErrorKind::InvalidInput, format!("bad key {key}")),
            });
        }
        Ok(self.root.join(rel))
    }

    fn io(&self, source: std::io::Error) -> TierError {
        TierError::Io {
            tier: self.tier,
            source,
        }
    }
}

/// `<name>.tmp-<digits>`
fn is_orphan_tmp(name: &str) -> bool {
    name.rsplit_once(".tmp-")
        .map(|(_, n)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// 只在打开时跑一次：此时没有在途写入
fn sweep_orphan_tmps(root: &Path) -> usize {
    let mut removed = 0;
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::warn!("Cannot scan {:?} for temp files: {}", dir, e);
                continue;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() => dirs.push(path),
                Ok(t) if t.is_file() && is_orphan_tmp(&entry.file_name().to_string_lossy()) => {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => tracing::warn!("Failed to remove temp file {:?}: {}", path, e),
                    }
                }
                _ => {}
            }
        }
    }
    removed
}

/// rename 之前被丢弃（出错或 future 被 drop）时删掉 tmp 文件
struct TmpGuard {
    path: Option<PathBuf>,
}

impl TmpGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TmpGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn tmp_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[async_trait]
impl TierStore for BlobTierStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn exists(&self, key: &str) -> Result<bool, TierError> {
        let path = self.path_of(key)?;
        match fs::metadata(&path).await {
            Ok(md) => Ok(md.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io(e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        let path = self.path_of(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io(e)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TierError> {
        let path = self.path_of(key)?;
        if self.caps.write_once && self.exists(key).await? {
            return Err(TierError::WriteOnce {
                tier: self.tier,
                key: key.to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| self.io(e))?;
        }

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(format!(".tmp-{}", tmp_suffix()));
        let tmp = path.with_file_name(tmp_name);
        let mut guard = TmpGuard::new(tmp.clone());

        let write = async {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(&bytes).await?;
            f.sync_all().await?;
            drop(f);
            fs::rename(&tmp, &path).await
        };
        write.await.map_err(|e| self.io(e))?;
        guard.disarm();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, TierError> {
        if !self.caps.deletable {
            return Err(TierError::DeleteUnsupported { tier: self.tier });
        }
        let path = self.path_of(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io(e)),
        }
    }
}
