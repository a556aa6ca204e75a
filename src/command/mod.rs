//! Typed command model.
//!
//! Upstream layers hand over loosely structured payloads (JSON objects with a
//! `kind` string and free-form arguments). They are converted exactly once,
//! here, into an immutable [`Command`]. Unknown kinds and malformed argument
//! values are rejected at this boundary so the rest of the engine only ever
//! matches on [`CommandKind`].

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 명령어 종류 (닫힌 집합)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Shell,
    ListDirectory,
    ReadFile,
    FileMove,
    FileCopy,
    FileDelete,
    CreateDirectory,
    PermissionChange,
    PackageInstall,
    ProcessControl,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Shell => "shell",
            CommandKind::ListDirectory => "list_directory",
            CommandKind::ReadFile => "read_file",
            CommandKind::FileMove => "file_move",
            CommandKind::FileCopy => "file_copy",
            CommandKind::FileDelete => "file_delete",
            CommandKind::CreateDirectory => "create_directory",
            CommandKind::PermissionChange => "permission_change",
            CommandKind::PackageInstall => "package_install",
            CommandKind::ProcessControl => "process_control",
        }
    }

    /// 별칭을 포함한 kind 문자열 해석
    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s.trim().to_lowercase().replace('-', "_").as_str() {
            "shell" | "run_command" | "command" => CommandKind::Shell,
            "list_directory" | "list" | "ls" => CommandKind::ListDirectory,
            "read_file" | "read" | "cat" => CommandKind::ReadFile,
            "file_move" | "move" | "mv" | "rename" => CommandKind::FileMove,
            "file_copy" | "copy" | "cp" => CommandKind::FileCopy,
            "file_delete" | "delete" | "rm" | "remove" => CommandKind::FileDelete,
            "create_directory" | "mkdir" => CommandKind::CreateDirectory,
            "permission_change" | "chmod" => CommandKind::PermissionChange,
            "package_install" | "install" => CommandKind::PackageInstall,
            "process_control" | "kill" | "signal" => CommandKind::ProcessControl,
            _ => return None,
        };
        Some(kind)
    }

    /// 시스템 상태를 변경하는 종류인지
    pub fn is_mutating(&self) -> bool {
        !matches!(self, CommandKind::ListDirectory | CommandKind::ReadFile)
    }

    /// 파일 시스템 경로를 대상으로 하는 종류인지
    pub fn is_file_kind(&self) -> bool {
        matches!(
            self,
            CommandKind::ListDirectory
                | CommandKind::ReadFile
                | CommandKind::FileMove
                | CommandKind::FileCopy
                | CommandKind::FileDelete
                | CommandKind::CreateDirectory
                | CommandKind::PermissionChange
        )
    }

    pub fn requires_target(&self) -> bool {
        self.is_file_kind()
    }

    /// 최소 인자 개수
    pub fn required_arguments(&self) -> usize {
        match self {
            CommandKind::FileMove | CommandKind::FileCopy | CommandKind::PermissionChange => 1,
            CommandKind::PackageInstall | CommandKind::ProcessControl => 2,
            _ => 0,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 실행 요청 단위. 생성 후 변경되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "CommandPayload")]
pub struct Command {
    kind: CommandKind,
    raw_text: String,
    target_path: Option<PathBuf>,
    arguments: Vec<String>,
}

impl Command {
    pub fn new(kind: CommandKind, raw_text: impl Into<String>) -> Self {
        Self {
            kind,
            raw_text: raw_text.into(),
            target_path: None,
            arguments: Vec::new(),
        }
    }

    /// 셸 명령어 생성
    pub fn shell(raw_text: impl Into<String>) -> Self {
        Self::new(CommandKind::Shell, raw_text)
    }

    pub fn with_target(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn file_move(from: impl Into<PathBuf>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        Self::new(
            CommandKind::FileMove,
            format!("mv {} {}", from.display(), to),
        )
        .with_target(from)
        .with_args([to])
    }

    pub fn file_delete(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(CommandKind::FileDelete, format!("rm {}", path.display())).with_target(path)
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn target_path(&self) -> Option<&Path> {
        self.target_path.as_deref()
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn is_mutating(&self) -> bool {
        self.kind.is_mutating()
    }

    /// 이동/복사 대상 경로 (arguments[0])
    pub fn destination(&self) -> Option<&Path> {
        match self.kind {
            CommandKind::FileMove | CommandKind::FileCopy => {
                self.arguments.first().map(|a| Path::new(a.as_str()))
            }
            _ => None,
        }
    }

    /// 대화상자와 로그에 표시할 한 줄 설명
    pub fn summary(&self) -> String {
        if self.raw_text.len() > 120 {
            let mut end = 117;
            while !self.raw_text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &self.raw_text[..end])
        } else {
            self.raw_text.clone()
        }
    }

    /// 타입이 없는 JSON 페이로드를 Command로 변환
    pub fn from_payload(value: serde_json::Value) -> Result<Self> {
        let payload: CommandPayload = serde_json::from_value(value)
            .map_err(|e| GuardError::InvalidCommand(e.to_string()))?;
        Command::try_from(payload).map_err(GuardError::InvalidCommand)
    }
}

/// 상위 계층에서 넘어오는 느슨한 형태의 명령어
#[derive(Debug, Clone, Deserialize)]
pub struct CommandPayload {
    #[serde(alias = "action", alias = "type")]
    pub kind: String,
    #[serde(default, alias = "command")]
    pub raw_text: Option<String>,
    #[serde(default, alias = "path", alias = "target")]
    pub target_path: Option<String>,
    #[serde(default, alias = "args")]
    pub arguments: Vec<serde_json::Value>,
}

impl TryFrom<CommandPayload> for Command {
    type Error = String;

    fn try_from(payload: CommandPayload) -> std::result::Result<Self, Self::Error> {
        let kind = CommandKind::parse(&payload.kind)
            .ok_or_else(|| format!("unknown command kind '{}'", payload.kind))?;

        let mut arguments = Vec::with_capacity(payload.arguments.len());
        for value in payload.arguments {
            let arg = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(format!(
                        "argument for {} must be a scalar, got {}",
                        kind, other
                    ))
                }
            };
            arguments.push(arg);
        }

        let target_path = payload
            .target_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        if kind.requires_target() && target_path.is_none() {
            return Err(format!("{} requires a target_path", kind));
        }
        if arguments.len() < kind.required_arguments() {
            return Err(format!(
                "{} requires at least {} argument(s), got {}",
                kind,
                kind.required_arguments(),
                arguments.len()
            ));
        }

        let raw_text = match payload.raw_text.filter(|t| !t.trim().is_empty()) {
            Some(text) => text,
            None if kind == CommandKind::Shell => {
                return Err("shell command requires raw_text".to_string())
            }
            None => synthesize_raw_text(kind, target_path.as_deref(), &arguments),
        };

        Ok(Command {
            kind,
            raw_text,
            target_path,
            arguments,
        })
    }
}

fn synthesize_raw_text(kind: CommandKind, target: Option<&Path>, args: &[String]) -> String {
    let mut parts = vec![kind.as_str().to_string()];
    if let Some(target) = target {
        parts.push(target.display().to_string());
    }
    parts.extend(args.iter().cloned());
    parts.join(" ")
}
