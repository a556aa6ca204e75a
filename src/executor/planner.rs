use crate::command::{Command, CommandKind};
use crate::error::{GuardError, Result};
use crate::executor::risk::{RiskAssessment, RiskLevel};
use crate::executor::sandbox::ExecutionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// 계획 안의 단계 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId {
    pub plan: Uuid,
    pub index: usize,
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.plan, self.index)
    }
}

impl FromStr for StepId {
    type Err = String;

    /// `<plan-uuid>:<index>` 형식
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (plan, index) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("'{}' is not <plan>:<index>", s))?;
        Ok(StepId {
            plan: Uuid::parse_str(plan).map_err(|e| format!("invalid plan id: {}", e))?,
            index: index
                .parse()
                .map_err(|_| format!("invalid step index '{}'", index))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Pending,
    AwaitingConfirmation,
    Executing,
    Completed,
    Aborted,
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanState::Completed | PlanState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    AwaitingConfirmation,
    Executing,
    Completed,
    /// 재시도/건너뛰기/중단 결정을 기다리는 중
    Failed,
    Skipped,
    Aborted,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Skipped | StepState::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::AwaitingConfirmation => "awaiting_confirmation",
            StepState::Executing => "executing",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
            StepState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 계획의 한 단계
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: StepId,
    pub command: Command,
    pub description: String,
    pub state: StepState,
    pub assessment: Option<RiskAssessment>,
    pub result: Option<ExecutionResult>,
    /// 실행 시도 횟수
    pub attempts: u32,
    /// 되돌릴 수 있는지 (실제 변경이 없으면 true)
    pub reversible: bool,
    pub error: Option<String>,
}

impl Step {
    pub fn new(id: StepId, command: Command) -> Self {
        Self {
            id,
            description: command.summary(),
            command,
            state: StepState::Pending,
            assessment: None,
            result: None,
            attempts: 0,
            reversible: true,
            error: None,
        }
    }
}

/// 계획 범위에서 기억하는 always/never 응답
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedAnswer {
    /// 주어진 위험도 이하에서만 유효
    Always(RiskLevel),
    Never,
}

/// 실행 계획. 단계는 순서대로 하나씩 실행됩니다.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    id: Uuid,
    steps: Vec<Step>,
    state: PlanState,
    created_at: DateTime<Utc>,
    #[serde(skip)]
    answers: HashMap<CommandKind, CachedAnswer>,
}

impl Plan {
    pub fn new(commands: Vec<Command>) -> Self {
        let id = Uuid::new_v4();
        let steps = commands
            .into_iter()
            .enumerate()
            .map(|(index, command)| Step::new(StepId { plan: id, index }, command))
            .collect();
        Self {
            id,
            steps,
            state: PlanState::Pending,
            created_at: Utc::now(),
            answers: HashMap::new(),
        }
    }

    /// 단일 명령어 계획
    pub fn single(command: Command) -> Self {
        Self::new(vec![command])
    }

    /// JSON 계획 파싱: 단계 배열 또는 `{"steps": [...]}`
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| GuardError::InvalidCommand(format!("plan is not valid JSON: {}", e)))?;
        Self::from_payload(value)
    }

    pub fn from_payload(value: serde_json::Value) -> Result<Self> {
        let payload: PlanPayload = serde_json::from_value(value)
            .map_err(|e| GuardError::InvalidCommand(format!("malformed plan: {}", e)))?;
        let entries = match payload {
            PlanPayload::Steps(steps) => steps,
            PlanPayload::Wrapped { steps } => steps,
        };
        if entries.is_empty() {
            return Err(GuardError::InvalidCommand("plan has no steps".to_string()));
        }

        let mut commands = Vec::with_capacity(entries.len());
        let mut descriptions = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let description = entry
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string);
            let command = Command::from_payload(entry).map_err(|e| {
                GuardError::InvalidCommand(format!("step {}: {}", index + 1, e))
            })?;
            commands.push(command);
            descriptions.push(description);
        }

        let mut plan = Self::new(commands);
        for (step, description) in plan.steps.iter_mut().zip(descriptions) {
            if let Some(description) = description {
                step.description = description;
            }
        }
        Ok(plan)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// 모든 단계가 Completed/Skipped이거나 계획이 중단됨
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 아직 끝나지 않은 첫 단계
    pub fn next_open_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.state.is_terminal())
    }

    pub(crate) fn step_mut(&mut self, index: usize) -> &mut Step {
        &mut self.steps[index]
    }

    pub(crate) fn set_state(&mut self, state: PlanState) {
        self.state = state;
    }

    pub(crate) fn cached_answer(&self, kind: CommandKind) -> Option<CachedAnswer> {
        self.answers.get(&kind).copied()
    }

    pub(crate) fn cache_answer(&mut self, kind: CommandKind, answer: CachedAnswer) {
        self.answers.insert(kind, answer);
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanPayload {
    Steps(Vec<serde_json::Value>),
    Wrapped {
        #[serde(alias = "commands")]
        steps: Vec<serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_creation() {
        let plan = Plan::new(vec![Command::shell("ls"), Command::file_delete("b.tmp")]);

        assert_eq!(plan.step_count(), 2);
        assert_eq!(plan.state(), PlanState::Pending);
        assert_eq!(plan.steps()[1].id, StepId { plan: plan.id(), index: 1 });
        assert_eq!(plan.next_open_step(), Some(0));
    }

    #[test]
    fn test_from_json_array_and_wrapped() {
        let plan = Plan::from_json(
            r#"[
                {"kind": "file_move", "target_path": "a.txt", "arguments": ["Documents/"],
                 "description": "move a.txt"},
                {"kind": "delete", "path": "b.tmp"}
            ]"#,
        )
        .unwrap();
        assert_eq!(plan.step_count(), 2);
        assert_eq!(plan.steps()[0].description, "move a.txt");
        assert_eq!(plan.steps()[1].command.kind(), CommandKind::FileDelete);

        let wrapped = Plan::from_json(r#"{"steps": [{"kind": "shell", "command": "ls"}]}"#).unwrap();
        assert_eq!(wrapped.steps()[0].description, "ls");
    }

    #[test]
    fn test_from_json_rejects_bad_steps() {
        assert!(Plan::from_json("[]").is_err());
        assert!(Plan::from_json("not json").is_err());
        let err = Plan::from_json(r#"[{"kind": "shell", "command": "ls"}, {"kind": "nuke"}]"#)
            .unwrap_err();
        assert!(err.to_string().contains("step 2"));
    }

    #[test]
    fn test_step_id_roundtrip() {
        let id = StepId {
            plan: Uuid::new_v4(),
            index: 3,
        };
        assert_eq!(id.to_string().parse::<StepId>().unwrap(), id);
        assert!("nope".parse::<StepId>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Failed.is_terminal());
        assert!(PlanState::Aborted.is_terminal());
        assert!(!PlanState::AwaitingConfirmation.is_terminal());
    }

    #[test]
    fn test_cached_answers_are_per_plan() {
        let mut plan = Plan::single(Command::shell("ls"));
        plan.cache_answer(CommandKind::Shell, CachedAnswer::Never);
        assert_eq!(plan.cached_answer(CommandKind::Shell), Some(CachedAnswer::Never));

        let other = Plan::single(Command::shell("ls"));
        assert_eq!(other.cached_answer(CommandKind::Shell), None);
    }
}
