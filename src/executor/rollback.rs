/// Undo management for cmdguard
///
/// Every mutating step that completes successfully leaves an [`UndoRecord`]
/// on a per-session stack. Records are reversed strictly last-in first-out.
///
/// ## Design Overview
///
/// ```text
/// ┌──────────────────┐
/// │ PlanOrchestrator │ - pushes a record after each completed mutating step
/// └────────┬─────────┘
///          │
///          ▼
/// ┌──────────────────┐      ┌─────────────┐
/// │   UndoManager    │ ───▶ │ BackupStore │ - snapshots referenced by records
/// └────────┬─────────┘      └─────────────┘
///          │
///          ▼
/// <data_dir>/sessions/<session>.undo.json   (rewritten atomically on change)
/// ```
///
/// ## Inverse actions
///
/// - `RestoreSnapshot`: put every captured path back to its pre-step state
/// - `MoveBack`: rename the moved entry back (keeps inode, mode and times),
///   then restore whatever the move overwrote at the destination
/// - `RunCommand`: run a defined inverse program, e.g. a package uninstall
///
/// Process signals and shell commands without a declared target have no
/// inverse; they are reported as non-reversible and never enter the stack.
///
/// ## Failure semantics
///
/// Undo fails closed. A missing or corrupt snapshot aborts the undo before
/// the filesystem is touched, the record stays on the stack, and the error
/// reports how many records were already reversed in the same sweep.
use crate::backup::{BackupStore, SnapshotId};
use crate::error::{GuardError, Result};
use crate::executor::planner::StepId;
use crate::executor::runner::{CommandRunner, RunOptions};
use crate::fsutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Inverse of a completed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InverseAction {
    RestoreSnapshot,
    MoveBack { from: PathBuf, to: PathBuf },
    RunCommand { program: String, args: Vec<String> },
}

impl InverseAction {
    pub fn describe(&self) -> String {
        match self {
            InverseAction::RestoreSnapshot => "restore snapshot".to_string(),
            InverseAction::MoveBack { from, to } => {
                format!("move {} back to {}", from.display(), to.display())
            }
            InverseAction::RunCommand { program, args } => {
                format!("run {} {}", program, args.join(" "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub step_id: StepId,
    pub description: String,
    pub inverse_action: InverseAction,
    pub snapshot_ref: Option<SnapshotId>,
    /// 적용된 변경이면 true, 되돌린 뒤에는 false
    pub committed: bool,
    pub recorded_at: DateTime<Utc>,
}

impl UndoRecord {
    pub fn new(
        step_id: StepId,
        description: impl Into<String>,
        inverse_action: InverseAction,
        snapshot_ref: Option<SnapshotId>,
    ) -> Self {
        Self {
            step_id,
            description: description.into(),
            inverse_action,
            snapshot_ref,
            committed: true,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UndoFile {
    session: String,
    records: Vec<UndoRecord>,
}

/// 세션별 되돌리기 스택
pub struct UndoManager {
    session: String,
    path: PathBuf,
    store: Arc<BackupStore>,
    runner: CommandRunner,
    records: Vec<UndoRecord>,
}

impl UndoManager {
    /// 저장된 스택을 불러오고 보존 기간이 지난 기록은 스냅샷과 함께 버림
    pub fn open(
        sessions_dir: &Path,
        session: &str,
        store: Arc<BackupStore>,
        runner: CommandRunner,
        retention: Duration,
    ) -> Result<Self> {
        let path = sessions_dir.join(format!("{}.undo.json", session));
        let mut records = if path.exists() {
            let content = fs::read(&path)?;
            let file: UndoFile = serde_json::from_slice(&content)?;
            file.records
        } else {
            Vec::new()
        };

        let cutoff =
            Utc::now() - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        let before = records.len();
        let (expired, kept): (Vec<_>, Vec<_>) =
            records.drain(..).partition(|r| r.recorded_at < cutoff);
        for record in &expired {
            if let Some(id) = &record.snapshot_ref {
                store.discard(id)?;
            }
        }

        let manager = Self {
            session: session.to_string(),
            path,
            store,
            runner,
            records: kept,
        };
        if manager.records.len() != before {
            info!(
                session,
                expired = before - manager.records.len(),
                "expired undo records dropped"
            );
            manager.persist()?;
        }
        Ok(manager)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn records(&self) -> &[UndoRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 스택이 참조하는 스냅샷 (GC에서 보존)
    pub fn snapshot_refs(&self) -> HashSet<SnapshotId> {
        self.records
            .iter()
            .filter_map(|r| r.snapshot_ref.clone())
            .collect()
    }

    /// 모든 세션의 되돌리기 스택이 참조하는 스냅샷. 읽을 수 없는 파일은 건너뜀
    pub fn referenced_snapshots(sessions_dir: &Path) -> HashSet<SnapshotId> {
        let Ok(entries) = fs::read_dir(sessions_dir) else {
            return HashSet::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".undo.json"))
            .filter_map(|p| {
                let content = fs::read(&p).ok()?;
                match serde_json::from_slice::<UndoFile>(&content) {
                    Ok(file) => Some(file.records),
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "unreadable undo stack");
                        None
                    }
                }
            })
            .flatten()
            .filter_map(|r| r.snapshot_ref)
            .collect()
    }

    pub fn push(&mut self, record: UndoRecord) -> Result<()> {
        info!(step = %record.step_id, action = %record.inverse_action.describe(), "undo record pushed");
        self.records.push(record);
        self.persist()
    }

    /// 가장 최근 기록을 되돌림
    pub async fn undo_last(&mut self) -> Result<UndoRecord> {
        let record = self.records.last().cloned().ok_or(GuardError::NothingToUndo)?;
        self.reverse(&record)
            .await
            .map_err(|reason| GuardError::Undo {
                step: record.step_id.to_string(),
                reason,
                undone: 0,
            })?;
        self.pop_reversed()
    }

    /// 대상 단계까지(포함) 한 번에 되돌림. 첫 실패에서 멈추고 진행 상황을 보고
    pub async fn undo_to(&mut self, target: StepId) -> Result<Vec<UndoRecord>> {
        if !self.records.iter().any(|r| r.step_id == target) {
            return Err(GuardError::Undo {
                step: target.to_string(),
                reason: "step is not on the undo stack".to_string(),
                undone: 0,
            });
        }

        let mut undone = Vec::new();
        while let Some(record) = self.records.last().cloned() {
            self.reverse(&record)
                .await
                .map_err(|reason| GuardError::Undo {
                    step: record.step_id.to_string(),
                    reason,
                    undone: undone.len(),
                })?;
            undone.push(self.pop_reversed()?);
            if record.step_id == target {
                break;
            }
        }
        Ok(undone)
    }

    /// 한 계획에 속한 기록을 모두 역순으로 되돌림 (중단 시 롤백)
    pub async fn rollback_plan(&mut self, plan: Uuid) -> Result<Vec<UndoRecord>> {
        let first = self
            .records
            .iter()
            .filter(|r| r.step_id.plan == plan)
            .map(|r| r.step_id)
            .min_by_key(|id| id.index);
        match first {
            Some(step) => self.undo_to(step).await,
            None => Ok(Vec::new()),
        }
    }

    /// 세션의 모든 변경을 확정: 기록과 스냅샷 삭제
    pub fn commit(&mut self) -> Result<usize> {
        let count = self.records.len();
        for record in &self.records {
            if let Some(id) = &record.snapshot_ref {
                self.store.discard(id)?;
            }
        }
        self.records.clear();
        self.persist()?;
        info!(session = %self.session, count, "changes committed");
        Ok(count)
    }

    fn pop_reversed(&mut self) -> Result<UndoRecord> {
        let mut record = self.records.pop().ok_or(GuardError::NothingToUndo)?;
        record.committed = false;
        if let Some(id) = &record.snapshot_ref {
            if let Err(e) = self.store.discard(id) {
                warn!(snapshot = %id, error = %e, "failed to discard reversed snapshot");
            }
        }
        self.persist()?;
        info!(step = %record.step_id, "step undone");
        Ok(record)
    }

    async fn reverse(&self, record: &UndoRecord) -> std::result::Result<(), String> {
        // 스냅샷이 없거나 손상되면 아무것도 건드리지 않음
        let snapshot = match &record.snapshot_ref {
            Some(id) => {
                let snapshot = self.store.load(id).map_err(|e| e.to_string())?;
                self.store.verify(&snapshot).map_err(|e| e.to_string())?;
                Some(snapshot)
            }
            None => None,
        };

        match &record.inverse_action {
            InverseAction::RestoreSnapshot => {
                let snapshot =
                    snapshot.ok_or_else(|| "record has no snapshot to restore".to_string())?;
                self.store.restore(&snapshot).map_err(|e| e.to_string())
            }
            InverseAction::MoveBack { from, to } => {
                let can_rename =
                    fs::symlink_metadata(from).is_ok() && fs::symlink_metadata(to).is_err();
                match (can_rename, snapshot) {
                    (true, snapshot) => {
                        if let Some(parent) = to.parent() {
                            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                        }
                        fs::rename(from, to)
                            .or_else(|_| {
                                fsutil::copy_tree(from, to)?;
                                remove_any(from)
                            })
                            .map_err(|e| format!("move back failed: {}", e))?;
                        // 이동이 덮어쓴 대상 복원
                        match snapshot {
                            Some(snapshot) => self
                                .store
                                .restore_except(&snapshot, &[to.clone()])
                                .map_err(|e| e.to_string()),
                            None => Ok(()),
                        }
                    }
                    (false, Some(snapshot)) => {
                        self.store.restore(&snapshot).map_err(|e| e.to_string())
                    }
                    (false, None) => Err(format!(
                        "cannot move {} back to {}",
                        from.display(),
                        to.display()
                    )),
                }
            }
            InverseAction::RunCommand { program, args } => {
                let out = self
                    .runner
                    .run(program, args, &RunOptions::default(), None)
                    .await
                    .map_err(|e| e.to_string())?;
                if out.success() {
                    Ok(())
                } else {
                    Err(format!(
                        "inverse command exited with {:?}: {}",
                        out.exit_code(),
                        out.stderr.trim()
                    ))
                }
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let file = UndoFile {
            session: self.session.clone(),
            records: self.records.clone(),
        };
        let content = serde_json::to_vec_pretty(&file)?;
        fsutil::atomic_write(&self.path, &content)?;
        Ok(())
    }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<BackupStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(BackupStore::new(
                dir.path().join("backups"),
                1024 * 1024,
                Duration::from_secs(3600),
            ));
            Self { dir, store }
        }

        fn manager(&self, retention: Duration) -> UndoManager {
            UndoManager::open(
                &self.dir.path().join("sessions"),
                "test",
                self.store.clone(),
                CommandRunner::new(Duration::from_secs(5), Duration::from_millis(100), 4096),
                retention,
            )
            .unwrap()
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    fn step(plan: Uuid, index: usize) -> StepId {
        StepId { plan, index }
    }

    /// 파일을 덮어쓰고 스냅샷 기록을 남기는 헬퍼
    fn overwrite(fx: &Fixture, manager: &mut UndoManager, id: StepId, name: &str, content: &str) {
        let path = fx.path(name);
        let snapshot = fx.store.capture(&path, &[path.clone()]).unwrap();
        fs::write(&path, content).unwrap();
        manager
            .push(UndoRecord::new(
                id,
                format!("write {}", name),
                InverseAction::RestoreSnapshot,
                Some(snapshot.id),
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn test_undo_last_restores_and_persists() {
        let fx = Fixture::new();
        let file = fx.path("a.txt");
        fs::write(&file, "v1").unwrap();
        fsutil::set_mode(&file, 0o640).unwrap();

        let plan = Uuid::new_v4();
        let mut manager = fx.manager(Duration::from_secs(3600));
        overwrite(&fx, &mut manager, step(plan, 0), "a.txt", "v2");
        fsutil::set_mode(&file, 0o777).unwrap();

        // 재시작 후에도 스택 유지
        let mut reopened = fx.manager(Duration::from_secs(3600));
        assert_eq!(reopened.len(), 1);

        let record = reopened.undo_last().await.unwrap();
        assert!(!record.committed);
        assert_eq!(fs::read_to_string(&file).unwrap(), "v1");
        assert_eq!(fsutil::mode_of(&fs::metadata(&file).unwrap()), 0o640);
        assert!(reopened.is_empty());
        assert!(fx.store.list().unwrap().is_empty());

        assert!(matches!(
            reopened.undo_last().await,
            Err(GuardError::NothingToUndo)
        ));
    }

    #[tokio::test]
    async fn test_move_back_preserves_original_location() {
        let fx = Fixture::new();
        let src = fx.path("a.txt");
        let docs = fx.path("Documents");
        fs::create_dir(&docs).unwrap();
        fs::write(&src, "content").unwrap();
        let dest = docs.join("a.txt");

        let snapshot = fx.store.capture(&src, &[src.clone(), dest.clone()]).unwrap();
        fs::rename(&src, &dest).unwrap();

        let mut manager = fx.manager(Duration::from_secs(3600));
        manager
            .push(UndoRecord::new(
                step(Uuid::new_v4(), 0),
                "move",
                InverseAction::MoveBack {
                    from: dest.clone(),
                    to: src.clone(),
                },
                Some(snapshot.id),
            ))
            .unwrap();

        manager.undo_last().await.unwrap();
        assert_eq!(fs::read_to_string(&src).unwrap(), "content");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_undo_to_reverses_in_lifo_order() {
        let fx = Fixture::new();
        for name in ["a", "b", "c"] {
            fs::write(fx.path(name), format!("{}0", name)).unwrap();
        }
        let plan = Uuid::new_v4();
        let mut manager = fx.manager(Duration::from_secs(3600));
        overwrite(&fx, &mut manager, step(plan, 0), "a", "a1");
        overwrite(&fx, &mut manager, step(plan, 1), "b", "b1");
        overwrite(&fx, &mut manager, step(plan, 2), "c", "c1");

        let undone = manager.undo_to(step(plan, 1)).await.unwrap();
        let order: Vec<usize> = undone.iter().map(|r| r.step_id.index).collect();
        assert_eq!(order, vec![2, 1]);
        assert_eq!(fs::read_to_string(fx.path("a")).unwrap(), "a1");
        assert_eq!(fs::read_to_string(fx.path("b")).unwrap(), "b0");
        assert_eq!(fs::read_to_string(fx.path("c")).unwrap(), "c0");
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_fails_closed_with_progress() {
        let fx = Fixture::new();
        for name in ["a", "b"] {
            fs::write(fx.path(name), "0").unwrap();
        }
        let plan = Uuid::new_v4();
        let mut manager = fx.manager(Duration::from_secs(3600));
        overwrite(&fx, &mut manager, step(plan, 0), "a", "1");
        overwrite(&fx, &mut manager, step(plan, 1), "b", "1");

        // 첫 단계의 스냅샷을 삭제
        let lost = manager.records()[0].snapshot_ref.clone().unwrap();
        fx.store.discard(&lost).unwrap();

        let err = manager.rollback_plan(plan).await.unwrap_err();
        assert!(!err.is_retryable());
        match err {
            GuardError::Undo { step: at, undone, .. } => {
                assert_eq!(at, step(plan, 0).to_string());
                assert_eq!(undone, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read_to_string(fx.path("b")).unwrap(), "0");
        assert_eq!(fs::read_to_string(fx.path("a")).unwrap(), "1");
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_drops_records_and_snapshots() {
        let fx = Fixture::new();
        fs::write(fx.path("a"), "0").unwrap();
        let mut manager = fx.manager(Duration::from_secs(3600));
        overwrite(&fx, &mut manager, step(Uuid::new_v4(), 0), "a", "1");

        assert_eq!(manager.commit().unwrap(), 1);
        assert!(manager.is_empty());
        assert!(fx.store.list().unwrap().is_empty());
        assert_eq!(fs::read_to_string(fx.path("a")).unwrap(), "1");
    }

    #[test]
    fn test_referenced_snapshots_across_sessions() {
        let fx = Fixture::new();
        fs::write(fx.path("a"), "0").unwrap();
        let mut manager = fx.manager(Duration::from_secs(3600));
        overwrite(&fx, &mut manager, step(Uuid::new_v4(), 0), "a", "1");

        let refs = UndoManager::referenced_snapshots(&fx.dir.path().join("sessions"));
        assert_eq!(refs, manager.snapshot_refs());
        assert!(UndoManager::referenced_snapshots(&fx.path("missing")).is_empty());
    }

    #[tokio::test]
    async fn test_expired_records_dropped_on_open() {
        let fx = Fixture::new();
        fs::write(fx.path("a"), "0").unwrap();
        {
            let mut manager = fx.manager(Duration::from_secs(3600));
            overwrite(&fx, &mut manager, step(Uuid::new_v4(), 0), "a", "1");
        }
        std::thread::sleep(Duration::from_millis(20));

        let manager = fx.manager(Duration::ZERO);
        assert!(manager.is_empty());
        assert!(fx.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inverse_command_runs() {
        let fx = Fixture::new();
        let marker = fx.path("uninstalled");
        let mut manager = fx.manager(Duration::from_secs(3600));
        manager
            .push(UndoRecord::new(
                step(Uuid::new_v4(), 0),
                "install",
                InverseAction::RunCommand {
                    program: "touch".to_string(),
                    args: vec![marker.display().to_string()],
                },
                None,
            ))
            .unwrap();

        manager.undo_last().await.unwrap();
        assert!(marker.exists());
    }
}
