use crate::audit::{AuditEntry, AuditEvent, AuditKind, AuditLogger};
use crate::backup::{BackupStore, Captured, CapturedPath, Snapshot};
use crate::command::{Command, CommandKind};
use crate::config::Config;
use crate::error::{GuardError, Result};
use crate::executor::planner::{CachedAnswer, Plan, PlanState, Step, StepId, StepState};
use crate::executor::risk::{RiskAssessment, RiskAssessor};
use crate::executor::rollback::{InverseAction, UndoManager, UndoRecord};
use crate::executor::sandbox::{
    package_uninstall, ExecutionResult, ExecutionStatus, SandboxExecutor,
};
use crate::executor::simulator::DryRunSimulator;
use crate::executor::validator::{CommandValidator, ValidationResult};
use crate::fsutil;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 확인 요청에 대한 응답
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationAnswer {
    Approved,
    /// 이 단계만 건너뜀
    Denied,
    /// 계획을 AwaitingConfirmation 상태로 멈추고 반환
    Deferred,
    /// 같은 종류의 명령어를 이 위험도 이하에서 계속 승인
    Always,
    /// 같은 종류의 명령어를 계속 건너뜀
    Never,
    Abort,
}

/// 실패한 단계의 처리 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry,
    Skip,
    Abort,
}

pub struct ConfirmationRequest<'a> {
    pub step: &'a Step,
    pub assessment: &'a RiskAssessment,
    /// 드라이런 설명 (변경 명령어만)
    pub preview: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailureContext {
    pub step: StepId,
    pub description: String,
    pub error: String,
    /// false면 Retry는 Abort로 처리됨
    pub retry_allowed: bool,
    pub attempts: u32,
    pub next_action: &'static str,
}

/// 외부 승인 콜백. 세션만 멈추고 프로세스는 막지 않습니다.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest<'_>) -> ConfirmationAnswer;

    async fn on_failure(&self, failure: &FailureContext) -> FailureDecision;

    /// 스냅샷 없이 실행할지 (true면 단계는 되돌릴 수 없음으로 표시)
    async fn on_snapshot_failure(&self, _step: &Step, _error: &GuardError) -> bool {
        false
    }
}

/// 계획/단계 상태 변경 알림
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanState {
        plan: Uuid,
        state: PlanState,
    },
    StepState {
        step: StepId,
        state: StepState,
        description: String,
        detail: Option<String>,
    },
}

/// 단계 실행 결과
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: StepId,
    pub description: String,
    pub kind: CommandKind,
    pub state: StepState,
    pub assessment: Option<RiskAssessment>,
    pub result: Option<ExecutionResult>,
    pub attempts: u32,
    pub reversible: bool,
    pub error: Option<String>,
}

impl StepReport {
    fn from_step(step: &Step) -> Self {
        Self {
            step: step.id,
            description: step.description.clone(),
            kind: step.command.kind(),
            state: step.state,
            assessment: step.assessment.clone(),
            result: step.result.clone(),
            attempts: step.attempts,
            reversible: step.reversible,
            error: step.error.clone(),
        }
    }
}

/// 중단 시 롤백 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    /// 되돌린 순서대로
    pub undone: Vec<StepId>,
    pub error: Option<String>,
}

/// 계획 실행 결과
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub plan: Uuid,
    pub state: PlanState,
    pub steps: Vec<StepReport>,
    pub rollback: Option<RollbackReport>,
    pub total_duration_ms: u64,
}

impl PlanReport {
    /// 모든 단계가 완료되었는지
    pub fn all_succeeded(&self) -> bool {
        self.state == PlanState::Completed
            && self.steps.iter().all(|s| s.state == StepState::Completed)
    }

    pub fn count(&self, state: StepState) -> usize {
        self.steps.iter().filter(|s| s.state == state).count()
    }

    pub fn non_reversible_steps(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Completed && !s.reversible)
            .collect()
    }
}

/// 실행 전 점검 결과 (`check`)
#[derive(Debug, Clone, Serialize)]
pub struct StepCheck {
    pub step: StepId,
    pub description: String,
    pub valid: bool,
    pub reason: Option<String>,
    pub assessment: Option<RiskAssessment>,
    pub requires_confirmation: bool,
}

/// 실행 중인 계획을 취소하는 핸들
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

enum StepFlow {
    Continue,
    Suspend,
    Abort(String),
}

enum Gate {
    Proceed,
    Skip(String),
    Suspend,
    Abort,
}

/// 계획 상태 머신. 단계는 순서대로 하나씩 실행됩니다.
pub struct PlanOrchestrator {
    config: Config,
    validator: CommandValidator,
    assessor: RiskAssessor,
    simulator: DryRunSimulator,
    sandbox: SandboxExecutor,
    store: Arc<BackupStore>,
    undo: UndoManager,
    audit: Arc<AuditLogger>,
    events: broadcast::Sender<PlanEvent>,
    cancel: Arc<watch::Sender<bool>>,
}

impl PlanOrchestrator {
    pub fn new(
        config: Config,
        store: Arc<BackupStore>,
        undo: UndoManager,
        audit: Arc<AuditLogger>,
    ) -> Result<Self> {
        let sandbox = SandboxExecutor::from_config(&config)?;
        let (events, _) = broadcast::channel(256);
        let (cancel, _) = watch::channel(false);
        Ok(Self {
            config,
            validator: CommandValidator::new(),
            assessor: RiskAssessor::new(),
            simulator: DryRunSimulator::new(),
            sandbox,
            store,
            undo,
            audit,
            events,
            cancel: Arc::new(cancel),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.events.subscribe()
    }

    pub fn audit_feed(&self) -> broadcast::Receiver<AuditEntry> {
        self.audit.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    pub fn undo_records(&self) -> &[UndoRecord] {
        self.undo.records()
    }

    pub fn requires_confirmation(&self, assessment: &RiskAssessment) -> bool {
        requires_confirmation(&self.config, assessment)
    }

    /// 실행 없이 검증과 위험도만 평가
    pub fn check(&self, plan: &Plan) -> Vec<StepCheck> {
        check_plan(&self.config, plan)
    }

    /// 계획을 끝까지(또는 보류/중단까지) 실행
    pub async fn run(
        &mut self,
        plan: &mut Plan,
        handler: &dyn ConfirmationHandler,
    ) -> Result<PlanReport> {
        let started = Instant::now();
        if plan.is_terminal() {
            return Ok(Self::report(plan, None, started));
        }
        self.cancel.send_replace(false);

        if plan.state() == PlanState::Pending {
            info!(plan = %plan.id(), steps = plan.step_count(), mode = %self.sandbox.mode(), "plan started");
            self.record(
                AuditEvent::new(
                    AuditKind::PlanStarted,
                    format!("{} step(s), mode {}", plan.step_count(), self.sandbox.mode()),
                )
                .plan(plan.id()),
            )
            .await;
        }

        let mut rollback = None;
        while let Some(index) = plan.next_open_step() {
            if self.is_cancelled() {
                rollback = Some(self.abort(plan, "cancelled").await);
                break;
            }
            match self.process_step(plan, index, handler).await? {
                StepFlow::Continue => {}
                StepFlow::Suspend => {
                    self.set_plan_state(plan, PlanState::AwaitingConfirmation);
                    self.record(
                        AuditEvent::new(AuditKind::PlanSuspended, "awaiting confirmation")
                            .step(plan.id(), index),
                    )
                    .await;
                    info!(plan = %plan.id(), step = index, "plan suspended");
                    return Ok(Self::report(plan, None, started));
                }
                StepFlow::Abort(reason) => {
                    rollback = Some(self.abort(plan, &reason).await);
                    break;
                }
            }
        }

        if !plan.is_terminal() {
            self.set_plan_state(plan, PlanState::Completed);
            self.record(AuditEvent::new(AuditKind::PlanCompleted, "completed").plan(plan.id()))
                .await;
            info!(plan = %plan.id(), "plan completed");
        }
        Ok(Self::report(plan, rollback, started))
    }

    pub async fn undo_last(&mut self) -> Result<UndoRecord> {
        match self.undo.undo_last().await {
            Ok(record) => {
                self.record_undo(&record).await;
                Ok(record)
            }
            Err(e) => {
                self.record(AuditEvent::new(AuditKind::UndoFailed, e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn undo_to(&mut self, step: StepId) -> Result<Vec<UndoRecord>> {
        let before: Vec<UndoRecord> = self.undo.records().iter().rev().cloned().collect();
        match self.undo.undo_to(step).await {
            Ok(records) => {
                for record in &records {
                    self.record_undo(record).await;
                }
                Ok(records)
            }
            Err(e) => {
                if let GuardError::Undo { undone, .. } = &e {
                    for record in before.iter().take(*undone) {
                        self.record_undo(record).await;
                    }
                }
                self.record(AuditEvent::new(AuditKind::UndoFailed, e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// 세션 변경 확정 (기록과 스냅샷 삭제)
    pub async fn commit(&mut self) -> Result<usize> {
        let count = self.undo.commit()?;
        self.record(AuditEvent::new(
            AuditKind::Committed,
            format!("{} change(s) committed", count),
        ))
        .await;
        Ok(count)
    }

    async fn process_step(
        &mut self,
        plan: &mut Plan,
        index: usize,
        handler: &dyn ConfirmationHandler,
    ) -> Result<StepFlow> {
        let plan_id = plan.id();
        let command = plan.steps()[index].command.clone();

        let assessment = match plan.steps()[index].assessment.clone() {
            Some(assessment) => assessment,
            None => {
                let validation = self.validator.validate(&command);
                if let Some(reason) = validation.reason.filter(|_| !validation.ok) {
                    warn!(plan = %plan_id, step = index, %reason, "validation failed");
                    self.record(
                        AuditEvent::new(AuditKind::ValidationFailed, reason.clone())
                            .step(plan_id, index)
                            .payload(command.raw_text()),
                    )
                    .await;
                    let err = GuardError::Validation { reason };
                    return Ok(self.fail_without_execution(plan, index, err, handler).await);
                }
                self.record(
                    AuditEvent::new(AuditKind::ValidationPassed, "ok")
                        .step(plan_id, index)
                        .payload(command.raw_text()),
                )
                .await;

                let assessment = self.assessor.assess(&command);
                debug!(step = index, level = %assessment.level, rule = %assessment.rule, "risk assessed");
                self.record(
                    AuditEvent::new(AuditKind::RiskAssessed, assessment.rule.clone())
                        .step(plan_id, index)
                        .risk(assessment.level)
                        .payload(assessment.warnings.join("; ")),
                )
                .await;
                plan.step_mut(index).assessment = Some(assessment.clone());
                assessment
            }
        };

        if assessment.is_forbidden() {
            let err = GuardError::RiskBlocked {
                level: assessment.level,
                reason: format!("rule '{}' forbids execution", assessment.rule),
            };
            warn!(plan = %plan_id, step = index, rule = %assessment.rule, "critical step refused");
            return Ok(self.fail_without_execution(plan, index, err, handler).await);
        }

        if self.requires_confirmation(&assessment) {
            match self.confirm(plan, index, &assessment, handler).await {
                Gate::Proceed => {}
                Gate::Skip(reason) => {
                    self.skip(plan, index, reason).await;
                    return Ok(StepFlow::Continue);
                }
                Gate::Suspend => return Ok(StepFlow::Suspend),
                Gate::Abort => return Ok(StepFlow::Abort("aborted at confirmation".to_string())),
            }
        }

        self.execute_step(plan, index, handler).await
    }

    async fn confirm(
        &self,
        plan: &mut Plan,
        index: usize,
        assessment: &RiskAssessment,
        handler: &dyn ConfirmationHandler,
    ) -> Gate {
        let plan_id = plan.id();
        let kind = plan.steps()[index].command.kind();

        match plan.cached_answer(kind) {
            Some(CachedAnswer::Never) => {
                return Gate::Skip(format!("{} steps declined for this plan", kind));
            }
            Some(CachedAnswer::Always(level)) if assessment.level <= level => {
                self.record(
                    AuditEvent::new(AuditKind::ConfirmationAnswered, "always (cached)")
                        .step(plan_id, index)
                        .risk(assessment.level),
                )
                .await;
                return Gate::Proceed;
            }
            _ => {}
        }

        self.transition(plan, index, StepState::AwaitingConfirmation, None);
        self.set_plan_state(plan, PlanState::AwaitingConfirmation);
        self.record(
            AuditEvent::new(AuditKind::ConfirmationRequested, assessment.rule.clone())
                .step(plan_id, index)
                .risk(assessment.level),
        )
        .await;

        let answer = {
            let step = &plan.steps()[index];
            let preview = step
                .command
                .is_mutating()
                .then(|| self.simulator.simulate(&step.command).text());
            let request = ConfirmationRequest {
                step,
                assessment,
                preview,
            };
            let cancelled = crate::executor::runner::wait_cancelled(Some(self.cancel.subscribe()));
            tokio::select! {
                answer = handler.confirm(&request) => answer,
                _ = cancelled => ConfirmationAnswer::Abort,
            }
        };

        self.record(
            AuditEvent::new(
                AuditKind::ConfirmationAnswered,
                format!("{:?}", answer).to_lowercase(),
            )
            .step(plan_id, index)
            .risk(assessment.level),
        )
        .await;

        match answer {
            ConfirmationAnswer::Approved => Gate::Proceed,
            ConfirmationAnswer::Always => {
                plan.cache_answer(kind, CachedAnswer::Always(assessment.level));
                Gate::Proceed
            }
            ConfirmationAnswer::Denied => Gate::Skip("denied at confirmation".to_string()),
            ConfirmationAnswer::Never => {
                plan.cache_answer(kind, CachedAnswer::Never);
                Gate::Skip("denied at confirmation (never)".to_string())
            }
            ConfirmationAnswer::Deferred => Gate::Suspend,
            ConfirmationAnswer::Abort => Gate::Abort,
        }
    }

    async fn execute_step(
        &mut self,
        plan: &mut Plan,
        index: usize,
        handler: &dyn ConfirmationHandler,
    ) -> Result<StepFlow> {
        let plan_id = plan.id();
        let command = plan.steps()[index].command.clone();
        let mutates = self.sandbox.mode().mutates() && command.is_mutating();
        let mut auto_retries = 0;

        loop {
            if self.is_cancelled() {
                return Ok(StepFlow::Abort("cancelled".to_string()));
            }

            // 변경 전 상태 캡처. 실패하면 Executing에 도달하지 않음
            let mut snapshot = None;
            let mut reversible = true;
            let paths = if mutates { snapshot_paths(&command) } else { Vec::new() };
            if !paths.is_empty() {
                match self.capture_restorable(&command, &paths).await {
                    Ok(captured) => {
                        self.record(
                            AuditEvent::new(AuditKind::SnapshotCaptured, captured.id.to_string())
                                .step(plan_id, index)
                                .payload(format!(
                                    "{} path(s), {} bytes",
                                    captured.targets.len(),
                                    captured.targets.iter().map(|t| t.total_size()).sum::<u64>()
                                )),
                        )
                        .await;
                        snapshot = Some(captured);
                    }
                    Err(err) => {
                        self.record(
                            AuditEvent::new(AuditKind::SnapshotFailed, err.to_string())
                                .step(plan_id, index),
                        )
                        .await;
                        if handler.on_snapshot_failure(&plan.steps()[index], &err).await {
                            warn!(step = index, "running without snapshot at user request");
                            reversible = false;
                        } else {
                            match self.fail(plan, index, &err, true, handler).await {
                                FailureDecision::Retry => continue,
                                FailureDecision::Skip => {
                                    self.skip(plan, index, err.to_string()).await;
                                    return Ok(StepFlow::Continue);
                                }
                                FailureDecision::Abort => {
                                    return Ok(StepFlow::Abort(err.to_string()))
                                }
                            }
                        }
                    }
                }
            } else if mutates && command.kind() != CommandKind::PackageInstall {
                reversible = false;
            }

            plan.step_mut(index).attempts += 1;
            plan.step_mut(index).error = None;
            self.set_plan_state(plan, PlanState::Executing);
            self.transition(plan, index, StepState::Executing, None);
            self.record(
                AuditEvent::new(AuditKind::StepStarted, format!("mode {}", self.sandbox.mode()))
                    .step(plan_id, index)
                    .payload(command.raw_text()),
            )
            .await;

            let outcome = self
                .sandbox
                .execute(&command, Some(self.cancel.subscribe()))
                .await;

            let err = match outcome {
                Ok(result) if result.is_success() => {
                    let record = match &snapshot {
                        _ if !mutates => None,
                        Some(snapshot) => Some(undo_record(&plan.steps()[index], Some(snapshot))),
                        None if command.kind() == CommandKind::PackageInstall => {
                            Some(undo_record(&plan.steps()[index], None))
                        }
                        None => None,
                    };
                    match record {
                        Some(record) => self.undo.push(record)?,
                        None if mutates => reversible = false,
                        None => {}
                    }

                    let output = result.output.clone();
                    let step = plan.step_mut(index);
                    step.result = Some(result);
                    step.reversible = reversible;
                    self.transition(plan, index, StepState::Completed, None);
                    let outcome = if reversible {
                        "completed"
                    } else {
                        "completed (non-reversible)"
                    };
                    self.record(
                        AuditEvent::new(AuditKind::StepCompleted, outcome)
                            .step(plan_id, index)
                            .payload(output),
                    )
                    .await;
                    return Ok(StepFlow::Continue);
                }
                Ok(result) if result.status == ExecutionStatus::Aborted => {
                    plan.step_mut(index).result = Some(result);
                    self.release(snapshot).await;
                    return Ok(StepFlow::Abort("cancelled during execution".to_string()));
                }
                Ok(result) => {
                    let err = if result.status == ExecutionStatus::TimedOut {
                        GuardError::Timeout {
                            seconds: self.config.command_timeout,
                        }
                    } else {
                        GuardError::Execution(format!(
                            "exit code {:?}: {}",
                            result.exit_code,
                            summarize(&result.output)
                        ))
                    };
                    plan.step_mut(index).result = Some(result);
                    err
                }
                Err(err) => err,
            };

            // 실패한 시도가 남긴 변경 복원, 스냅샷은 남기지 않음
            self.release(snapshot).await;

            let retryable = err.is_retryable();
            if retryable && auto_retries < self.config.max_retries {
                auto_retries += 1;
                info!(step = index, attempt = auto_retries, error = %err, "retrying step");
                self.record(
                    AuditEvent::new(AuditKind::StepRetried, err.to_string()).step(plan_id, index),
                )
                .await;
                continue;
            }

            match self.fail(plan, index, &err, retryable, handler).await {
                FailureDecision::Retry => {
                    self.record(
                        AuditEvent::new(AuditKind::StepRetried, "retry requested")
                            .step(plan_id, index),
                    )
                    .await;
                    continue;
                }
                FailureDecision::Skip => {
                    self.skip(plan, index, err.to_string()).await;
                    return Ok(StepFlow::Continue);
                }
                FailureDecision::Abort => return Ok(StepFlow::Abort(err.to_string())),
            }
        }
    }

    /// 실행 전에 거부된 단계 (검증 실패, Critical). 재시도는 제공하지 않음
    async fn fail_without_execution(
        &self,
        plan: &mut Plan,
        index: usize,
        err: GuardError,
        handler: &dyn ConfirmationHandler,
    ) -> StepFlow {
        match self.fail(plan, index, &err, false, handler).await {
            FailureDecision::Skip => {
                self.skip(plan, index, err.to_string()).await;
                StepFlow::Continue
            }
            FailureDecision::Retry | FailureDecision::Abort => StepFlow::Abort(err.to_string()),
        }
    }

    /// Failed로 전이하고 처리 방법을 물음. 재시도가 허용되지 않으면 Retry는 Abort가 됨
    async fn fail(
        &self,
        plan: &mut Plan,
        index: usize,
        err: &GuardError,
        retry_allowed: bool,
        handler: &dyn ConfirmationHandler,
    ) -> FailureDecision {
        let plan_id = plan.id();
        plan.step_mut(index).error = Some(err.to_string());
        self.transition(plan, index, StepState::Failed, Some(err.to_string()));
        self.record(
            AuditEvent::new(AuditKind::StepFailed, err.to_string())
                .step(plan_id, index)
                .payload(err.next_action()),
        )
        .await;

        let step = &plan.steps()[index];
        let context = FailureContext {
            step: step.id,
            description: step.description.clone(),
            error: err.to_string(),
            retry_allowed,
            attempts: step.attempts,
            next_action: err.next_action(),
        };
        match handler.on_failure(&context).await {
            FailureDecision::Retry if !retry_allowed => FailureDecision::Abort,
            decision => decision,
        }
    }

    async fn skip(&self, plan: &mut Plan, index: usize, reason: String) {
        let plan_id = plan.id();
        let mode = self.sandbox.mode();
        let step = plan.step_mut(index);
        if step.result.is_none() {
            step.result = Some(ExecutionResult::not_run(
                ExecutionStatus::Skipped,
                mode,
                reason.clone(),
            ));
        }
        self.transition(plan, index, StepState::Skipped, Some(reason.clone()));
        self.record(AuditEvent::new(AuditKind::StepSkipped, reason).step(plan_id, index))
            .await;
    }

    /// 남은 단계를 중단하고 완료된 단계를 역순으로 되돌림
    async fn abort(&mut self, plan: &mut Plan, reason: &str) -> RollbackReport {
        let plan_id = plan.id();
        warn!(plan = %plan_id, reason, "aborting plan");

        for index in 0..plan.step_count() {
            if !plan.steps()[index].state.is_terminal() {
                let mode = self.sandbox.mode();
                let step = plan.step_mut(index);
                if step.result.is_none() {
                    step.result = Some(ExecutionResult::not_run(
                        ExecutionStatus::Aborted,
                        mode,
                        reason,
                    ));
                }
                self.transition(plan, index, StepState::Aborted, Some(reason.to_string()));
                self.record(
                    AuditEvent::new(AuditKind::StepAborted, reason).step(plan_id, index),
                )
                .await;
            }
        }
        self.set_plan_state(plan, PlanState::Aborted);

        let pending: Vec<UndoRecord> = self
            .undo
            .records()
            .iter()
            .rev()
            .filter(|r| r.step_id.plan == plan_id)
            .cloned()
            .collect();

        let report = match self.undo.rollback_plan(plan_id).await {
            Ok(records) => {
                for record in &records {
                    self.record_undo(record).await;
                }
                RollbackReport {
                    undone: records.iter().map(|r| r.step_id).collect(),
                    error: None,
                }
            }
            Err(e) => {
                error!(plan = %plan_id, error = %e, "rollback incomplete");
                let undone = match &e {
                    GuardError::Undo { undone, .. } => *undone,
                    _ => 0,
                };
                for record in pending.iter().take(undone) {
                    self.record_undo(record).await;
                }
                self.record(AuditEvent::new(AuditKind::UndoFailed, e.to_string()).plan(plan_id))
                    .await;
                RollbackReport {
                    undone: pending.iter().take(undone).map(|r| r.step_id).collect(),
                    error: Some(e.to_string()),
                }
            }
        };

        self.record(
            AuditEvent::new(
                AuditKind::PlanAborted,
                format!("{}; {} step(s) rolled back", reason, report.undone.len()),
            )
            .plan(plan_id),
        )
        .await;
        report
    }

    async fn capture(&self, paths: &[PathBuf]) -> Result<Snapshot> {
        let store = self.store.clone();
        let paths = paths.to_vec();
        tokio::task::spawn_blocking(move || store.capture(&paths[0], &paths))
            .await
            .map_err(|e| GuardError::Snapshot {
                target: String::new(),
                reason: e.to_string(),
            })?
    }

    /// 되돌리기에 충분한 스냅샷만 인정. 크기 상한 때문에 내용이 빠졌으면 캡처 실패로 취급
    async fn capture_restorable(&self, command: &Command, paths: &[PathBuf]) -> Result<Snapshot> {
        let snapshot = self.capture(paths).await?;
        if !content_at_risk(command, &snapshot) {
            return Ok(snapshot);
        }

        let store = self.store.clone();
        let id = snapshot.id.clone();
        match tokio::task::spawn_blocking(move || store.discard(&id)).await {
            Ok(Err(e)) => warn!(error = %e, "failed to discard metadata-only snapshot"),
            Err(e) => warn!(error = %e, "snapshot cleanup task failed"),
            Ok(Ok(())) => {}
        }
        Err(GuardError::Snapshot {
            target: snapshot.target_path.display().to_string(),
            reason: format!(
                "larger than max_file_size ({} MB), only metadata could be captured",
                self.config.max_file_size
            ),
        })
    }

    /// 실패한 시도 정리: 대상이 바뀌었으면 복원 후 스냅샷 삭제
    async fn release(&self, snapshot: Option<Snapshot>) {
        let Some(snapshot) = snapshot else {
            return;
        };
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<bool> {
            let changed = !store.matches_current(&snapshot);
            if changed {
                store.restore(&snapshot)?;
            }
            store.discard(&snapshot.id)?;
            Ok(changed)
        })
        .await;

        match result {
            Ok(Ok(true)) => info!("partial changes of failed attempt restored"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!(error = %e, "failed to restore snapshot after failed attempt"),
            Err(e) => error!(error = %e, "snapshot cleanup task failed"),
        }
    }

    fn transition(&self, plan: &mut Plan, index: usize, state: StepState, detail: Option<String>) {
        let step = plan.step_mut(index);
        step.state = state;
        debug!(step = %step.id, state = %state, "step transition");
        let _ = self.events.send(PlanEvent::StepState {
            step: step.id,
            state,
            description: step.description.clone(),
            detail,
        });
    }

    fn set_plan_state(&self, plan: &mut Plan, state: PlanState) {
        if plan.state() != state {
            plan.set_state(state);
            let _ = self.events.send(PlanEvent::PlanState {
                plan: plan.id(),
                state,
            });
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn record(&self, event: AuditEvent) {
        self.audit.record(event).await;
    }

    async fn record_undo(&self, record: &UndoRecord) {
        self.record(
            AuditEvent::new(AuditKind::UndoApplied, record.inverse_action.describe())
                .step(record.step_id.plan, record.step_id.index)
                .payload(record.description.clone()),
        )
        .await;
    }

    fn report(plan: &Plan, rollback: Option<RollbackReport>, started: Instant) -> PlanReport {
        PlanReport {
            plan: plan.id(),
            state: plan.state(),
            steps: plan.steps().iter().map(StepReport::from_step).collect(),
            rollback,
            total_duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// 확인이 필요한지: blocking, 항상 확인 설정, 또는 임계값 이상
pub fn requires_confirmation(config: &Config, assessment: &RiskAssessment) -> bool {
    assessment.blocking
        || config.always_confirm_commands
        || assessment.level >= config.confirmation_threshold
}

/// 계획의 각 단계를 검증하고 위험도를 평가 (아무것도 실행하지 않음)
pub fn check_plan(config: &Config, plan: &Plan) -> Vec<StepCheck> {
    let validator = CommandValidator::new();
    let assessor = RiskAssessor::new();
    plan.steps()
        .iter()
        .map(|step| {
            let validation: ValidationResult = validator.validate(&step.command);
            let assessment = validation.ok.then(|| assessor.assess(&step.command));
            StepCheck {
                step: step.id,
                description: step.description.clone(),
                valid: validation.ok,
                reason: validation.reason,
                requires_confirmation: assessment
                    .as_ref()
                    .map(|a| requires_confirmation(config, a))
                    .unwrap_or(false),
                assessment,
            }
        })
        .collect()
}

/// 단계가 변경할 경로들 (첫 번째가 주 대상). 비어 있으면 스냅샷 불가
fn snapshot_paths(command: &Command) -> Vec<PathBuf> {
    let Some(target) = command.target_path() else {
        return Vec::new();
    };
    match command.kind() {
        CommandKind::FileMove => match command.destination() {
            Some(dest) => vec![
                target.to_path_buf(),
                fsutil::resolve_destination(target, dest),
            ],
            None => Vec::new(),
        },
        CommandKind::FileCopy => command
            .destination()
            .map(|dest| vec![fsutil::resolve_destination(target, dest)])
            .unwrap_or_default(),
        CommandKind::FileDelete
        | CommandKind::CreateDirectory
        | CommandKind::PermissionChange
        | CommandKind::Shell => vec![target.to_path_buf()],
        _ => Vec::new(),
    }
}

/// 메타데이터만 있는 대상이 내용을 잃을 수 있는지.
/// 권한 변경은 메타데이터로 복원되고, 이동의 원본은 되돌려 옮기면 됨
fn content_at_risk(command: &Command, snapshot: &Snapshot) -> bool {
    let metadata_only = |t: &CapturedPath| t.captured == Captured::MetadataOnly;
    match command.kind() {
        CommandKind::PermissionChange => false,
        CommandKind::FileMove => snapshot.targets.iter().skip(1).any(metadata_only),
        _ => snapshot.targets.iter().any(metadata_only),
    }
}

fn undo_record(step: &Step, snapshot: Option<&Snapshot>) -> UndoRecord {
    let inverse = match (step.command.kind(), snapshot) {
        (CommandKind::FileMove, Some(snapshot)) if snapshot.targets.len() == 2 => {
            InverseAction::MoveBack {
                from: snapshot.targets[1].path.clone(),
                to: snapshot.targets[0].path.clone(),
            }
        }
        (_, Some(_)) => InverseAction::RestoreSnapshot,
        (_, None) => {
            let (program, args) = package_uninstall(step.command.arguments());
            InverseAction::RunCommand { program, args }
        }
    };
    UndoRecord::new(
        step.id,
        step.description.clone(),
        inverse,
        snapshot.map(|s| s.id.clone()),
    )
}

fn summarize(output: &str) -> String {
    let line = output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    if line.chars().count() > 200 {
        line.chars().take(200).collect::<String>() + "..."
    } else {
        line.to_string()
    }
}
