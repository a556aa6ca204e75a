use crate::error::{GuardError, Result};
use crate::executor::risk::RiskLevel;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 실행 격리 수준
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// 시뮬레이터 설명만 생성
    DryRun,
    /// 임시 디렉토리의 복사본에서 실행 후 폐기
    Simulation,
    /// 제한된 권한, 자원 제한, 허용 경로 목록
    Isolated,
    /// 문법 검사만 수행 (절대 실행하지 않음)
    Validation,
    /// 제한 없이 실행
    Direct,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::DryRun => "dry_run",
            SandboxMode::Simulation => "simulation",
            SandboxMode::Isolated => "isolated",
            SandboxMode::Validation => "validation",
            SandboxMode::Direct => "direct",
        }
    }

    /// 실제 파일 시스템을 변경할 수 있는 모드인지
    pub fn mutates(&self) -> bool {
        matches!(self, SandboxMode::Isolated | SandboxMode::Direct)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "dry_run" => Some(SandboxMode::DryRun),
            "simulation" => Some(SandboxMode::Simulation),
            "isolated" => Some(SandboxMode::Isolated),
            "validation" => Some(SandboxMode::Validation),
            "direct" => Some(SandboxMode::Direct),
            _ => None,
        }
    }
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// cmdguard 설정
///
/// 설정 파일은 ~/.cmdguard/config.toml에 저장됩니다.
/// 한 번 로드된 값은 불변으로 각 컴포넌트 생성자에 전달됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 실행 모드 (dry_run, simulation, isolated, validation, direct)
    #[serde(default = "default_sandbox_mode")]
    pub sandbox_mode: SandboxMode,

    /// 명령어 제한 시간 (초)
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// 위험도와 관계없이 모든 단계에서 확인 요청
    #[serde(default)]
    pub always_confirm_commands: bool,

    /// 스냅샷 전체 복사 상한 (MB). 초과하면 메타데이터만 저장
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// 이 수준 이상이면 확인 요청
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold: RiskLevel,

    /// 타임아웃/일시적 실패 자동 재시도 횟수
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// isolated 모드에서 접근 가능한 경로 (glob 패턴 허용). 비어 있으면 현재 디렉토리
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// 감사 로그에서 마스킹할 정규표현식
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,

    #[serde(default = "default_audit_flush_timeout_ms")]
    pub audit_flush_timeout_ms: u64,

    /// SIGTERM 이후 SIGKILL까지 대기 시간
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_retention_hours")]
    pub snapshot_retention_hours: u64,

    #[serde(default = "default_retention_hours")]
    pub undo_retention_hours: u64,

    /// 백업, 감사 로그, 세션 파일 위치 (기본: ~/.cmdguard)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_sandbox_mode() -> SandboxMode {
    SandboxMode::Isolated
}

fn default_command_timeout() -> u64 {
    30
}

fn default_max_file_size() -> u64 {
    10
}

fn default_confirmation_threshold() -> RiskLevel {
    RiskLevel::Medium
}

fn default_max_retries() -> u32 {
    1
}

fn default_redact_patterns() -> Vec<String> {
    vec![
        r"(?i)(password|passwd|secret|token|api[_-]?key)\s*[=:]\s*\S+".to_string(),
        r"(?i)bearer\s+[a-z0-9._\-]+".to_string(),
        r"AKIA[0-9A-Z]{16}".to_string(),
        r"ghp_[A-Za-z0-9]{36}".to_string(),
        r"sk-[A-Za-z0-9]{20,}".to_string(),
    ]
}

fn default_audit_flush_timeout_ms() -> u64 {
    2000
}

fn default_termination_grace_ms() -> u64 {
    2000
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_retention_hours() -> u64 {
    72
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_mode: default_sandbox_mode(),
            command_timeout: default_command_timeout(),
            always_confirm_commands: false,
            max_file_size: default_max_file_size(),
            confirmation_threshold: default_confirmation_threshold(),
            max_retries: default_max_retries(),
            allowed_paths: Vec::new(),
            redact_patterns: default_redact_patterns(),
            audit_flush_timeout_ms: default_audit_flush_timeout_ms(),
            termination_grace_ms: default_termination_grace_ms(),
            max_output_bytes: default_max_output_bytes(),
            snapshot_retention_hours: default_retention_hours(),
            undo_retention_hours: default_retention_hours(),
            data_dir: None,
        }
    }
}

impl Config {
    /// 설정 디렉토리 경로
    fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cmdguard")
    }

    /// 기본 설정 파일 경로
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// 설정 파일에서 로드 (없으면 기본값 사용)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| GuardError::ConfigError(format!("{}: {}", config_path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 설정을 파일에 저장
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if let Some(dir) = config_path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| GuardError::ConfigError(e.to_string()))?;
        fs::write(&config_path, toml_string)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout == 0 {
            return Err(GuardError::ConfigError(
                "command_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(GuardError::ConfigError(
                "max_output_bytes must be positive".to_string(),
            ));
        }
        for pattern in &self.redact_patterns {
            Regex::new(pattern).map_err(|e| {
                GuardError::ConfigError(format!("invalid redact pattern '{}': {}", pattern, e))
            })?;
        }
        for pattern in &self.allowed_paths {
            glob::Pattern::new(pattern).map_err(|e| {
                GuardError::ConfigError(format!("invalid allowed path '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// 테스트나 임베딩 용도로 데이터 디렉토리를 지정
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_mode(mut self, mode: SandboxMode) -> Self {
        self.sandbox_mode = mode;
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Self::config_dir)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir().join("audit.jsonl")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir().join("sessions")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size.saturating_mul(1024 * 1024)
    }

    /// isolated 모드 허용 경로 (비어 있으면 현재 디렉토리)
    pub fn allowed_roots(&self) -> Vec<String> {
        if !self.allowed_paths.is_empty() {
            return self.allowed_paths.clone();
        }
        std::env::current_dir()
            .map(|cwd| vec![cwd.display().to_string()])
            .unwrap_or_default()
    }
}
