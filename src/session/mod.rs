use crate::audit::{verify_chain, AuditEntry, AuditLogger, ChainReport};
use crate::backup::BackupStore;
use crate::config::{Config, SandboxMode};
use crate::error::{GuardError, Result};
use crate::executor::orchestrator::{
    CancelHandle, ConfirmationHandler, PlanEvent, PlanOrchestrator, PlanReport, StepCheck,
};
use crate::executor::planner::{Plan, StepId};
use crate::executor::rollback::{UndoManager, UndoRecord};
use crate::executor::runner::CommandRunner;
use crate::fsutil;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

static SESSION_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("static session name pattern")
});

/// 세션 이름 검사 (파일 이름으로 쓰임)
pub fn is_valid_session_name(name: &str) -> bool {
    SESSION_NAME.is_match(name)
}

/// 한 세션의 구성 요소 묶음
///
/// 세션마다 되돌리기 스택이 분리되고, 백업 디렉토리와 감사 로그는
/// 파일 잠금을 통해 다른 세션과 공유됩니다.
pub struct Session {
    name: String,
    mode: SandboxMode,
    orchestrator: PlanOrchestrator,
    audit: Arc<AuditLogger>,
}

impl Session {
    pub fn open(config: Config, name: &str) -> Result<Self> {
        if !is_valid_session_name(name) {
            return Err(GuardError::ConfigError(format!(
                "invalid session name '{}': use letters, digits, '-' or '_'",
                name
            )));
        }
        config.validate()?;

        fsutil::create_private_dir(&config.data_dir())?;
        fsutil::create_private_dir(&config.sessions_dir())?;

        let store = Arc::new(BackupStore::new(
            config.backup_dir(),
            config.max_file_size_bytes(),
            hours(config.snapshot_retention_hours),
        ));
        let undo = UndoManager::open(
            &config.sessions_dir(),
            name,
            store.clone(),
            CommandRunner::from_config(&config),
            hours(config.undo_retention_hours),
        )?;

        // 다른 세션이 아직 참조하는 스냅샷은 보존
        let mut keep = UndoManager::referenced_snapshots(&config.sessions_dir());
        keep.extend(undo.snapshot_refs());
        if let Err(e) = store.collect_garbage(&keep) {
            warn!(error = %e, "snapshot garbage collection failed");
        }

        let audit = Arc::new(AuditLogger::from_config(&config, name)?);
        let mode = config.sandbox_mode;
        let orchestrator = PlanOrchestrator::new(config, store, undo, audit.clone())?;

        info!(session = name, %mode, "session opened");
        Ok(Self {
            name: name.to_string(),
            mode,
            orchestrator,
            audit,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    /// 실행하지 않고 검증과 위험도만 확인
    pub fn check(&self, plan: &Plan) -> Vec<StepCheck> {
        self.orchestrator.check(plan)
    }

    pub async fn run(
        &mut self,
        plan: &mut Plan,
        handler: &dyn ConfirmationHandler,
    ) -> Result<PlanReport> {
        let report = self.orchestrator.run(plan, handler).await;
        self.flush_audit().await;
        report
    }

    pub async fn undo_last(&mut self) -> Result<UndoRecord> {
        let result = self.orchestrator.undo_last().await;
        self.flush_audit().await;
        result
    }

    pub async fn undo_to(&mut self, step: StepId) -> Result<Vec<UndoRecord>> {
        let result = self.orchestrator.undo_to(step).await;
        self.flush_audit().await;
        result
    }

    pub async fn commit(&mut self) -> Result<usize> {
        let result = self.orchestrator.commit().await;
        self.flush_audit().await;
        result
    }

    pub fn undo_records(&self) -> &[UndoRecord] {
        self.orchestrator.undo_records()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.orchestrator.subscribe()
    }

    pub fn audit_feed(&self) -> broadcast::Receiver<AuditEntry> {
        self.orchestrator.audit_feed()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.orchestrator.cancel_handle()
    }

    pub fn verify_audit(&self) -> Result<ChainReport> {
        verify_chain(self.audit.path())
    }

    /// 남은 감사 기록을 내보내고 종료
    pub async fn close(self) -> Result<()> {
        self.audit.flush().await?;
        info!(session = %self.name, "session closed");
        Ok(())
    }

    async fn flush_audit(&self) {
        if let Err(e) = self.audit.flush().await {
            warn!(pending = self.audit.pending(), error = %e, "audit entries still buffered");
        }
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_names() {
        assert!(is_valid_session_name("default"));
        assert!(is_valid_session_name("ci_run-2"));
        assert!(!is_valid_session_name(""));
        assert!(!is_valid_session_name("../etc"));
        assert!(!is_valid_session_name("-flag"));
        assert!(!is_valid_session_name(&"a".repeat(65)));
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_data_dir(dir.path().join("data"));
        let session = Session::open(config, "default").unwrap();

        assert_eq!(session.name(), "default");
        assert!(dir.path().join("data/sessions").is_dir());
        assert!(session.undo_records().is_empty());
        assert!(session.verify_audit().unwrap().is_intact());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_and_audit_feed() {
        use crate::command::Command;
        use crate::executor::orchestrator::{
            ConfirmationAnswer, ConfirmationRequest, FailureContext, FailureDecision,
        };

        struct Approve;

        #[async_trait::async_trait]
        impl ConfirmationHandler for Approve {
            async fn confirm(&self, _request: &ConfirmationRequest<'_>) -> ConfirmationAnswer {
                ConfirmationAnswer::Approved
            }

            async fn on_failure(&self, _failure: &FailureContext) -> FailureDecision {
                FailureDecision::Abort
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = Config::default()
            .with_data_dir(dir.path().join("data"))
            .with_mode(SandboxMode::DryRun);
        let mut session = Session::open(config, "feed").unwrap();
        let mut plan = Plan::single(Command::shell("echo hi"));

        let checks = session.check(&plan);
        assert!(checks[0].valid && !checks[0].requires_confirmation);

        let mut feed = session.audit_feed();
        let report = session.run(&mut plan, &Approve).await.unwrap();
        assert!(report.all_succeeded());

        let first = feed.recv().await.unwrap();
        assert_eq!(first.session_id, "feed");
        assert_eq!(first.plan_id, Some(plan.id()));
        session.close().await.unwrap();
    }

    #[test]
    fn test_open_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_data_dir(dir.path());
        assert!(Session::open(config.clone(), "a/b").is_err());

        let mut zero = config;
        zero.command_timeout = 0;
        assert!(matches!(
            Session::open(zero, "ok"),
            Err(GuardError::ConfigError(_))
        ));
    }
}
