use crate::command::{Command, CommandKind};
use crate::fsutil::{mode_of, resolve_destination};
use std::fs;
use std::path::Path;

/// 드라이런 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Simulation {
    /// 의도된 효과 설명
    Described(String),
    /// 시뮬레이션 불가 (정보성, 실행을 막지 않음)
    CannotSimulate(String),
}

impl Simulation {
    pub fn text(&self) -> String {
        match self {
            Simulation::Described(text) => text.clone(),
            Simulation::CannotSimulate(reason) => format!("cannot simulate: {}", reason),
        }
    }
}

/// 부작용 없는 예행 연습. 메타데이터만 읽고 아무것도 쓰지 않습니다.
pub struct DryRunSimulator;

impl DryRunSimulator {
    pub fn new() -> Self {
        Self
    }

    pub fn simulate(&self, command: &Command) -> Simulation {
        let target = command.target_path();
        match command.kind() {
            CommandKind::FileMove | CommandKind::FileCopy => {
                let (Some(src), Some(dest)) = (target, command.destination()) else {
                    return Simulation::CannotSimulate("missing source or destination".to_string());
                };
                let verb = if command.kind() == CommandKind::FileMove {
                    "move"
                } else {
                    "copy"
                };
                let resolved = resolve_destination(src, dest);
                let mut text = format!(
                    "would {} {} ({}) to {}",
                    verb,
                    src.display(),
                    describe_path(src),
                    resolved.display()
                );
                if resolved.exists() {
                    text.push_str(&format!(
                        "; existing {} would be overwritten",
                        resolved.display()
                    ));
                }
                Simulation::Described(text)
            }
            CommandKind::FileDelete => match target {
                Some(path) => Simulation::Described(format!(
                    "would delete {} ({})",
                    path.display(),
                    describe_path(path)
                )),
                None => Simulation::CannotSimulate("missing target".to_string()),
            },
            CommandKind::CreateDirectory => match target {
                Some(path) if path.exists() => Simulation::Described(format!(
                    "{} already exists; nothing would change",
                    path.display()
                )),
                Some(path) => {
                    Simulation::Described(format!("would create directory {}", path.display()))
                }
                None => Simulation::CannotSimulate("missing target".to_string()),
            },
            CommandKind::PermissionChange => {
                let (Some(path), Some(mode)) = (target, command.arguments().first()) else {
                    return Simulation::CannotSimulate("missing target or mode".to_string());
                };
                let current = fs::symlink_metadata(path)
                    .map(|m| format!("{:o}", mode_of(&m)))
                    .unwrap_or_else(|_| "missing".to_string());
                Simulation::Described(format!(
                    "would change mode of {} from {} to {}",
                    path.display(),
                    current,
                    mode
                ))
            }
            CommandKind::ListDirectory | CommandKind::ReadFile => match target {
                Some(path) => Simulation::Described(format!(
                    "would read {} ({})",
                    path.display(),
                    describe_path(path)
                )),
                None => Simulation::CannotSimulate("missing target".to_string()),
            },
            CommandKind::PackageInstall => {
                let args = command.arguments();
                Simulation::Described(format!(
                    "would install {} with {}",
                    args.get(1..).map(|p| p.join(", ")).unwrap_or_default(),
                    args.first().map(String::as_str).unwrap_or("?")
                ))
            }
            CommandKind::ProcessControl => {
                let args = command.arguments();
                let pid = args.get(1).and_then(|p| p.parse::<i32>().ok());
                let alive = pid.map(process_alive).unwrap_or(false);
                Simulation::Described(format!(
                    "would send SIG{} to pid {} ({})",
                    args.first()
                        .map(|s| s.trim_start_matches("SIG").to_uppercase())
                        .unwrap_or_default(),
                    args.get(1).map(String::as_str).unwrap_or("?"),
                    if alive { "running" } else { "not running" }
                ))
            }
            CommandKind::Shell => Simulation::CannotSimulate(
                "arbitrary shell commands have no side-effect-free rehearsal".to_string(),
            ),
        }
    }
}

impl Default for DryRunSimulator {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_path(path: &Path) -> String {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => "directory".to_string(),
        Ok(m) if m.file_type().is_symlink() => "symlink".to_string(),
        Ok(m) => format!("{} bytes", m.len()),
        Err(_) => "does not exist".to_string(),
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}
