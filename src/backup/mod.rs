//! Backup/snapshot storage.
//!
//! Every mutating step captures the pre-state of the paths it is about to
//! touch. A snapshot lives in its own directory under the backup root:
//!
//! ```text
//! backups/
//! ├── .lock                      # exclusive lock held while writing
//! └── snap-1718000000-1a2b3c4d/
//!     ├── manifest.json          # Snapshot metadata + per-entry hashes
//!     └── data/0/...             # copied content of target #0
//! ```
//!
//! The directory is assembled under a `.staging-*` name and renamed into
//! place once complete, so a reader never observes a half-written snapshot.
//! Content above the size ceiling is recorded as metadata only.

use crate::error::{GuardError, Result};
use crate::fsutil::{self, FileLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 디렉토리 트리 캡처 시 최대 엔트리 수
const MAX_ENTRIES: usize = 10_000;
const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        SnapshotId(format!("snap-{}-{}", Utc::now().timestamp(), &uuid[..8]))
    }

    /// 경로 조작을 막기 위한 형식 검사
    pub fn is_well_formed(&self) -> bool {
        self.0.starts_with("snap-")
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 캡처 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Captured {
    /// 내용 전체 복사
    FullCopy,
    /// 크기 상한 초과: 권한/크기만 기록
    MetadataOnly,
    /// 실행 전 존재하지 않음 (복원 시 삭제)
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// 대상 경로 기준 상대 경로 (대상 자신은 빈 경로)
    pub relative: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub sha256: Option<String>,
    pub link_target: Option<PathBuf>,
}

/// 한 경로의 실행 전 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPath {
    pub path: PathBuf,
    pub captured: Captured,
    pub entries: Vec<SnapshotEntry>,
}

impl CapturedPath {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    fn root_entry(&self) -> Option<&SnapshotEntry> {
        self.entries
            .iter()
            .find(|e| e.relative.as_os_str().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// 주 대상 경로
    pub target_path: PathBuf,
    pub targets: Vec<CapturedPath>,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// 모든 대상이 내용까지 복원 가능한지
    pub fn is_fully_restorable(&self) -> bool {
        self.targets
            .iter()
            .all(|t| t.captured != Captured::MetadataOnly)
    }

    pub fn target(&self, path: &Path) -> Option<&CapturedPath> {
        self.targets.iter().find(|t| t.path == path)
    }
}

/// 스냅샷 저장소. 여러 세션이 공유할 수 있으며 쓰기는 전역 잠금으로 직렬화됩니다.
pub struct BackupStore {
    root: PathBuf,
    max_copy_bytes: u64,
    retention: Duration,
}

impl BackupStore {
    pub fn new(root: PathBuf, max_copy_bytes: u64, retention: Duration) -> Self {
        Self {
            root,
            max_copy_bytes,
            retention,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 대상 경로들의 현재 상태를 캡처
    pub fn capture(&self, primary: &Path, paths: &[PathBuf]) -> Result<Snapshot> {
        let snapshot_err = |reason: String| GuardError::Snapshot {
            target: primary.display().to_string(),
            reason,
        };

        fsutil::create_private_dir(&self.root)
            .map_err(|e| snapshot_err(format!("cannot create backup dir: {}", e)))?;
        let _lock = FileLock::acquire(&self.root.join(".lock"))
            .map_err(|e| snapshot_err(format!("cannot lock backup dir: {}", e)))?;

        let id = SnapshotId::generate();
        let staging = self.root.join(format!(".staging-{}", id));
        let result = self.write_staging(&id, primary, paths, &staging);

        match result {
            Ok(snapshot) => {
                fs::rename(&staging, self.snapshot_dir(&id)).map_err(|e| {
                    let _ = fs::remove_dir_all(&staging);
                    snapshot_err(format!("cannot persist snapshot: {}", e))
                })?;
                info!(
                    snapshot = %snapshot.id,
                    target = %primary.display(),
                    full = snapshot.is_fully_restorable(),
                    "snapshot captured"
                );
                Ok(snapshot)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(snapshot_err(e.to_string()))
            }
        }
    }

    fn write_staging(
        &self,
        id: &SnapshotId,
        primary: &Path,
        paths: &[PathBuf],
        staging: &Path,
    ) -> std::io::Result<Snapshot> {
        fsutil::create_private_dir(&staging.join("data"))?;

        let mut budget = self.max_copy_bytes;
        let mut targets = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            let absolute = fsutil::absolute_path(path)?;
            let data_dir = staging.join("data").join(index.to_string());
            let captured = capture_path(&absolute, &data_dir, &mut budget)?;
            targets.push(captured);
        }

        let snapshot = Snapshot {
            id: id.clone(),
            target_path: fsutil::absolute_path(primary)?,
            targets,
            timestamp: Utc::now(),
        };
        let manifest = serde_json::to_vec_pretty(&snapshot)?;
        fsutil::atomic_write(&staging.join(MANIFEST), &manifest)?;
        Ok(snapshot)
    }

    /// 저장된 스냅샷 로드. 없거나 손상되면 에러
    pub fn load(&self, id: &SnapshotId) -> Result<Snapshot> {
        if !id.is_well_formed() {
            return Err(GuardError::Snapshot {
                target: id.to_string(),
                reason: "malformed snapshot id".to_string(),
            });
        }
        let manifest = self.snapshot_dir(id).join(MANIFEST);
        let content = fs::read(&manifest).map_err(|e| GuardError::Snapshot {
            target: id.to_string(),
            reason: format!("snapshot missing: {}", e),
        })?;
        serde_json::from_slice(&content).map_err(|e| GuardError::Snapshot {
            target: id.to_string(),
            reason: format!("snapshot manifest corrupt: {}", e),
        })
    }

    /// 복사본 해시 검증 (복원 전에 호출)
    pub fn verify(&self, snapshot: &Snapshot) -> Result<()> {
        for (index, target) in snapshot.targets.iter().enumerate() {
            if target.captured != Captured::FullCopy {
                continue;
            }
            for entry in target.entries.iter().filter(|e| e.kind == EntryKind::File) {
                let data = self.data_path(&snapshot.id, index, &entry.relative);
                let bytes = fs::read(&data).map_err(|e| GuardError::Snapshot {
                    target: target.path.display().to_string(),
                    reason: format!("backup copy {} unreadable: {}", data.display(), e),
                })?;
                if Some(sha256_hex(&bytes)) != entry.sha256 {
                    return Err(GuardError::Snapshot {
                        target: target.path.display().to_string(),
                        reason: format!("backup copy {} is corrupt", data.display()),
                    });
                }
            }
        }
        Ok(())
    }

    /// 스냅샷의 모든 대상을 캡처 시점 상태로 복원
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        self.restore_except(snapshot, &[])
    }

    /// `skip`에 포함된 경로를 제외하고 복원
    pub fn restore_except(&self, snapshot: &Snapshot, skip: &[PathBuf]) -> Result<()> {
        self.verify(snapshot)?;

        for (index, target) in snapshot.targets.iter().enumerate() {
            if skip.contains(&target.path) {
                continue;
            }
            self.restore_target(&snapshot.id, index, target)
                .map_err(|e| GuardError::Snapshot {
                    target: target.path.display().to_string(),
                    reason: format!("restore failed: {}", e),
                })?;
            debug!(snapshot = %snapshot.id, path = %target.path.display(), "target restored");
        }
        Ok(())
    }

    fn restore_target(
        &self,
        id: &SnapshotId,
        index: usize,
        target: &CapturedPath,
    ) -> std::io::Result<()> {
        match target.captured {
            Captured::Absent => remove_path(&target.path),
            Captured::MetadataOnly => {
                let root = target.root_entry().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "no root entry")
                })?;
                let current = fs::symlink_metadata(&target.path).map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "metadata-only snapshot cannot recreate missing content",
                    )
                })?;
                if current.len() != root.size && root.kind == EntryKind::File {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "content changed and only metadata was captured",
                    ));
                }
                if root.kind != EntryKind::Symlink {
                    fsutil::set_mode(&target.path, root.mode)?;
                }
                Ok(())
            }
            Captured::FullCopy => {
                remove_path(&target.path)?;
                if let Some(parent) = target.path.parent() {
                    fs::create_dir_all(parent)?;
                }

                // 디렉토리 권한은 파일을 모두 쓴 뒤 깊은 곳부터 적용
                let mut dir_modes = Vec::new();
                for entry in &target.entries {
                    let dest = join_relative(&target.path, &entry.relative);
                    match entry.kind {
                        EntryKind::Directory => {
                            fs::create_dir_all(&dest)?;
                            dir_modes.push((dest, entry.mode));
                        }
                        EntryKind::File => {
                            let data = self.data_path(id, index, &entry.relative);
                            fs::copy(&data, &dest)?;
                            fsutil::set_mode(&dest, entry.mode)?;
                        }
                        EntryKind::Symlink => {
                            if let Some(link) = &entry.link_target {
                                make_symlink(link, &dest)?;
                            }
                        }
                    }
                }
                dir_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
                for (path, mode) in dir_modes {
                    fsutil::set_mode(&path, mode)?;
                }
                Ok(())
            }
        }
    }

    /// 현재 상태가 스냅샷과 같은지 (실패한 시도 후 복원 필요 여부 판단)
    pub fn matches_current(&self, snapshot: &Snapshot) -> bool {
        snapshot.targets.iter().all(|target| {
            let exists = fs::symlink_metadata(&target.path).is_ok();
            match target.captured {
                Captured::Absent => !exists,
                Captured::MetadataOnly => target
                    .root_entry()
                    .zip(fs::symlink_metadata(&target.path).ok())
                    .map(|(entry, meta)| {
                        meta.len() == entry.size && fsutil::mode_of(&meta) == entry.mode
                    })
                    .unwrap_or(false),
                Captured::FullCopy => {
                    let mut budget = u64::MAX;
                    match scan_entries(&target.path, &mut budget, true) {
                        Ok(Some(entries)) => entries == target.entries,
                        _ => false,
                    }
                }
            }
        })
    }

    /// 스냅샷 삭제 (커밋 또는 실패한 시도 정리)
    pub fn discard(&self, id: &SnapshotId) -> Result<()> {
        if !id.is_well_formed() {
            return Ok(());
        }
        let dir = self.snapshot_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!(snapshot = %id, "snapshot discarded");
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<SnapshotId> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| SnapshotId(entry.file_name().to_string_lossy().into_owned()))
            .filter(SnapshotId::is_well_formed)
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }

    /// 보존 기간이 지난 스냅샷과 남은 staging 디렉토리 삭제
    pub fn collect_garbage(&self, keep: &HashSet<SnapshotId>) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let _lock = FileLock::acquire(&self.root.join(".lock"))?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());

        let mut removed = 0;
        for entry in fs::read_dir(&self.root)?.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if name.starts_with(".staging-") {
                let _ = fs::remove_dir_all(&path);
                continue;
            }
            let id = SnapshotId(name);
            if !id.is_well_formed() || keep.contains(&id) {
                continue;
            }
            let expired = match self.load(&id) {
                Ok(snapshot) => snapshot.timestamp < cutoff,
                // 읽을 수 없는 스냅샷은 아무도 복원할 수 없음
                Err(_) => true,
            };
            if expired {
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!(snapshot = %id, error = %e, "failed to remove expired snapshot");
                    continue;
                }
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired snapshots collected");
        }
        Ok(removed)
    }

    fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(&id.0)
    }

    fn data_path(&self, id: &SnapshotId, index: usize, relative: &Path) -> PathBuf {
        join_relative(
            &self.snapshot_dir(id).join("data").join(index.to_string()),
            relative,
        )
    }
}

fn capture_path(path: &Path, data_dir: &Path, budget: &mut u64) -> std::io::Result<CapturedPath> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(CapturedPath {
            path: path.to_path_buf(),
            captured: Captured::Absent,
            entries: Vec::new(),
        });
    }

    match scan_entries(path, budget, false)? {
        Some(entries) => {
            for entry in entries.iter().filter(|e| e.kind != EntryKind::Symlink) {
                let source = join_relative(path, &entry.relative);
                let dest = join_relative(data_dir, &entry.relative);
                match entry.kind {
                    EntryKind::Directory => fs::create_dir_all(&dest)?,
                    _ => {
                        if let Some(parent) = dest.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::copy(&source, &dest)?;
                    }
                }
            }
            Ok(CapturedPath {
                path: path.to_path_buf(),
                captured: Captured::FullCopy,
                entries,
            })
        }
        None => {
            let meta = fs::symlink_metadata(path)?;
            Ok(CapturedPath {
                path: path.to_path_buf(),
                captured: Captured::MetadataOnly,
                entries: vec![entry_from_metadata(PathBuf::new(), &meta, None, None)],
            })
        }
    }
}

/// 트리를 순회하며 엔트리 목록 생성. 예산을 넘으면 None
fn scan_entries(
    path: &Path,
    budget: &mut u64,
    hash_only: bool,
) -> std::io::Result<Option<Vec<SnapshotEntry>>> {
    let mut entries = Vec::new();
    for item in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let item = item.map_err(std::io::Error::other)?;
        let meta = item.metadata().map_err(std::io::Error::other)?;
        let relative = item
            .path()
            .strip_prefix(path)
            .unwrap_or(Path::new(""))
            .to_path_buf();

        let entry = if meta.file_type().is_symlink() {
            let link = fs::read_link(item.path())?;
            entry_from_metadata(relative, &meta, None, Some(link))
        } else if meta.is_file() {
            if meta.len() > *budget {
                return Ok(None);
            }
            *budget -= meta.len();
            let bytes = fs::read(item.path())?;
            entry_from_metadata(relative, &meta, Some(sha256_hex(&bytes)), None)
        } else {
            entry_from_metadata(relative, &meta, None, None)
        };
        entries.push(entry);

        if entries.len() > MAX_ENTRIES && !hash_only {
            return Ok(None);
        }
    }
    Ok(Some(entries))
}

fn entry_from_metadata(
    relative: PathBuf,
    meta: &fs::Metadata,
    sha256: Option<String>,
    link_target: Option<PathBuf>,
) -> SnapshotEntry {
    let kind = if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    SnapshotEntry {
        relative,
        kind,
        mode: fsutil::mode_of(meta),
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        sha256,
        link_target,
    }
}

fn join_relative(base: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(relative)
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn make_symlink(link: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, dest)
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, _dest: &Path) -> std::io::Result<()> {
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
