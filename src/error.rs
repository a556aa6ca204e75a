use crate::executor::risk::RiskLevel;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    /// 경계에서 거부된 페이로드 (알 수 없는 kind, 필수 필드 누락)
    #[error("Invalid command payload: {0}")]
    InvalidCommand(String),

    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Blocked by {level} risk: {reason}")]
    RiskBlocked { level: RiskLevel, reason: String },

    #[error("Command execution failed: {0}")]
    Execution(String),

    #[error("Command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Snapshot of {target} failed: {reason}")]
    Snapshot { target: String, reason: String },

    /// 실패 지점과 이미 되돌린 단계를 함께 보고
    #[error("Undo failed at step {step}: {reason} ({undone} record(s) reversed before failure)")]
    Undo {
        step: String,
        reason: String,
        undone: usize,
    },

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("Audit sink error: {0}")]
    Audit(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl GuardError {
    /// 자동 재시도 대상 여부 (타임아웃과 일시적 실행 실패만)
    pub fn is_retryable(&self) -> bool {
        matches!(self, GuardError::Execution(_) | GuardError::Timeout { .. })
    }

    /// 사용자에게 제시할 가장 안전한 다음 행동
    pub fn next_action(&self) -> &'static str {
        match self {
            GuardError::InvalidCommand(_) | GuardError::Validation { .. } => {
                "fix the command and resubmit; it was never executed"
            }
            GuardError::RiskBlocked { level, .. } if *level == RiskLevel::Critical => {
                "skip this step; critical operations are never executed"
            }
            GuardError::RiskBlocked { .. } => "review the warnings and approve or skip the step",
            GuardError::Execution(_) | GuardError::Timeout { .. } => {
                "retry, skip the step, or abort the plan to roll back completed steps"
            }
            GuardError::Snapshot { .. } => {
                "free backup space or opt out of the snapshot explicitly; the step did not run"
            }
            GuardError::Undo { .. } => {
                "inspect the reported step manually; remaining records are left on the stack"
            }
            GuardError::NothingToUndo => "no action needed",
            GuardError::Audit(_) => "check the audit log location; execution continues",
            GuardError::ConfigError(_) => "correct the configuration file",
            GuardError::IoError(_) | GuardError::JsonError(_) => {
                "check file permissions and storage, then retry"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classes() {
        assert!(GuardError::Execution("exit 1".to_string()).is_retryable());
        assert!(GuardError::Timeout { seconds: 30 }.is_retryable());
        assert!(!GuardError::Validation {
            reason: "bad".to_string()
        }
        .is_retryable());
        assert!(!GuardError::Snapshot {
            target: "a".to_string(),
            reason: "disk full".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_critical_next_action_never_suggests_approval() {
        let err = GuardError::RiskBlocked {
            level: RiskLevel::Critical,
            reason: "rm -rf /".to_string(),
        };
        assert!(err.next_action().contains("never executed"));
    }
}
