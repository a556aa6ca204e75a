use crate::command::{Command, CommandKind};
use crate::config::{Config, SandboxMode};
use crate::error::{GuardError, Result};
use crate::executor::risk::split_commands;
use crate::executor::runner::{CommandRunner, RunExit, RunLimits, RunOptions, RunOutput};
use crate::executor::simulator::{DryRunSimulator, Simulation};
use crate::fsutil;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info};

/// isolated 모드 자식 프로세스 수 상한
const ISOLATED_MAX_PROCESSES: u64 = 4096;

/// 셸 토큰 안에서 경로를 가르는 문자
const PATH_SEPARATORS: &str = ";|&()<>='\"";
const DIR_CHANGERS: &[&str] = &["cd", "pushd", "popd", "chdir"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    TimedOut,
    Skipped,
    Aborted,
}

/// 단일 명령어 실행 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
    pub duration_ms: u64,
    pub mode: SandboxMode,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn success(mode: SandboxMode, output: impl Into<String>, started: Instant) -> Self {
        Self::with_status(ExecutionStatus::Success, mode, output, started)
    }

    pub fn failure(mode: SandboxMode, output: impl Into<String>, started: Instant) -> Self {
        Self::with_status(ExecutionStatus::Failure, mode, output, started)
    }

    /// 실행되지 않은 단계 (건너뜀/중단)
    pub fn not_run(status: ExecutionStatus, mode: SandboxMode, reason: impl Into<String>) -> Self {
        Self {
            status,
            output: reason.into(),
            duration_ms: 0,
            mode,
            exit_code: None,
            truncated: false,
        }
    }

    fn with_status(
        status: ExecutionStatus,
        mode: SandboxMode,
        output: impl Into<String>,
        started: Instant,
    ) -> Self {
        Self {
            status,
            output: output.into(),
            duration_ms: started.elapsed().as_millis() as u64,
            mode,
            exit_code: None,
            truncated: false,
        }
    }

    fn from_run(mode: SandboxMode, run: RunOutput) -> Self {
        let status = match run.exit {
            RunExit::Exited(Some(0)) => ExecutionStatus::Success,
            RunExit::Exited(_) => ExecutionStatus::Failure,
            RunExit::TimedOut => ExecutionStatus::TimedOut,
            RunExit::Cancelled => ExecutionStatus::Aborted,
        };
        Self {
            status,
            output: run.combined(),
            duration_ms: run.duration.as_millis() as u64,
            mode,
            exit_code: run.exit_code(),
            truncated: run.truncated,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// 문법 검사 결과 (validation 모드 페이로드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxReport {
    pub tokens: usize,
    pub segments: usize,
}

/// 모드에 따라 명령어를 실행하는 샌드박스
pub struct SandboxExecutor {
    mode: SandboxMode,
    runner: CommandRunner,
    simulator: DryRunSimulator,
    allow_list: Vec<glob::Pattern>,
    working_dir: Option<PathBuf>,
    limits: RunLimits,
    max_read_bytes: usize,
    max_copy_bytes: u64,
}

impl SandboxExecutor {
    pub fn from_config(config: &Config) -> Result<Self> {
        let roots = config.allowed_roots();
        let mut allow_list = Vec::with_capacity(roots.len());
        for root in &roots {
            allow_list.push(root_pattern(root)?);
        }

        // 상대 경로 해석과 일치하도록 현재 디렉토리가 허용되면 그곳에서 실행
        let cwd = std::env::current_dir().ok();
        let working_dir = cwd
            .filter(|dir| allow_list.iter().any(|p| matches_ancestor(p, dir)))
            .or_else(|| {
                roots
                    .iter()
                    .map(PathBuf::from)
                    .find(|root| root.is_dir())
            });

        Ok(Self {
            mode: config.sandbox_mode,
            runner: CommandRunner::from_config(config),
            simulator: DryRunSimulator::new(),
            allow_list,
            working_dir,
            limits: RunLimits {
                cpu_seconds: config.command_timeout.saturating_add(1),
                max_file_bytes: config.max_file_size_bytes(),
                max_processes: ISOLATED_MAX_PROCESSES,
            },
            max_read_bytes: config.max_output_bytes,
            max_copy_bytes: config.max_file_size_bytes(),
        })
    }

    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    /// 경로가 isolated 허용 목록 안에 있는지 (상위 디렉토리 포함)
    pub fn is_allowed(&self, path: &Path) -> bool {
        let normalized = normalize(path);
        self.allow_list
            .iter()
            .any(|pattern| matches_ancestor(pattern, &normalized))
    }

    pub async fn execute(
        &self,
        command: &Command,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ExecutionResult> {
        debug!(kind = %command.kind(), mode = %self.mode, "executing");
        let started = Instant::now();
        match self.mode {
            SandboxMode::DryRun => {
                let simulation = self.simulator.simulate(command);
                Ok(ExecutionResult::success(self.mode, simulation.text(), started))
            }
            SandboxMode::Validation => Ok(match check_syntax(command.raw_text()) {
                Ok(report) => ExecutionResult::success(
                    self.mode,
                    format!(
                        "syntax ok: {} {} token(s) in {} segment(s); not executed",
                        command.kind(),
                        report.tokens,
                        report.segments
                    ),
                    started,
                ),
                Err(reason) => {
                    ExecutionResult::failure(self.mode, format!("syntax error: {}", reason), started)
                }
            }),
            SandboxMode::Simulation => self.simulate_in_scratch(command, started).await,
            SandboxMode::Isolated => {
                self.enforce_allow_list(command)?;
                let options = RunOptions::isolated(self.working_dir.clone(), self.limits);
                self.run_for_real(command, &options, cancel, started).await
            }
            SandboxMode::Direct => {
                self.run_for_real(command, &RunOptions::default(), cancel, started)
                    .await
            }
        }
    }

    async fn run_for_real(
        &self,
        command: &Command,
        options: &RunOptions,
        cancel: Option<watch::Receiver<bool>>,
        started: Instant,
    ) -> Result<ExecutionResult> {
        match command.kind() {
            CommandKind::Shell => {
                let run = self
                    .runner
                    .run_shell(command.raw_text(), options, cancel)
                    .await?;
                Ok(ExecutionResult::from_run(self.mode, run))
            }
            CommandKind::PackageInstall => {
                let (program, args) = package_invocation(command.arguments());
                let run = self.runner.run(&program, &args, options, cancel).await?;
                Ok(ExecutionResult::from_run(self.mode, run))
            }
            CommandKind::ProcessControl => {
                Ok(match send_signal(command.arguments()) {
                    Ok(text) => ExecutionResult::success(self.mode, text, started),
                    Err(e) => ExecutionResult::failure(self.mode, e, started),
                })
            }
            _ => {
                let owned = command.clone();
                let max_read = self.max_read_bytes;
                let result = tokio::task::spawn_blocking(move || {
                    apply_file_op(&owned, &|p: &Path| p.to_path_buf(), max_read)
                })
                .await
                .map_err(|e| GuardError::Execution(e.to_string()))?;

                Ok(match result {
                    Ok(text) => ExecutionResult::success(self.mode, text, started),
                    Err(e) => ExecutionResult::failure(self.mode, e.to_string(), started),
                })
            }
        }
    }

    /// 임시 디렉토리에 대상을 복사해 재현하고 결과는 버림
    async fn simulate_in_scratch(
        &self,
        command: &Command,
        started: Instant,
    ) -> Result<ExecutionResult> {
        if !command.kind().is_file_kind() {
            let reason = format!(
                "cannot simulate: {} has no scratch-copy replay",
                command.kind()
            );
            return Ok(ExecutionResult::success(self.mode, reason, started));
        }

        let owned = command.clone();
        let max_read = self.max_read_bytes;
        let max_copy = self.max_copy_bytes;
        let outcome = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let scratch = tempfile::Builder::new().prefix("cmdguard-sim-").tempdir()?;
            let remap = |p: &Path| remap_into(scratch.path(), p);

            if let Some(reason) = stage_scratch(&owned, &remap, max_copy)? {
                return Ok(Simulation::CannotSimulate(reason).text());
            }
            let text = apply_file_op(&owned, &remap, max_read)?;
            Ok(format!("simulated on scratch copy: {}; changes discarded", text))
        })
        .await
        .map_err(|e| GuardError::Execution(e.to_string()))?;

        Ok(match outcome {
            Ok(text) => ExecutionResult::success(self.mode, text, started),
            Err(e) => ExecutionResult::failure(
                self.mode,
                format!("simulation failed: {}", e),
                started,
            ),
        })
    }

    fn enforce_allow_list(&self, command: &Command) -> Result<()> {
        let refuse = |path: &Path| GuardError::Validation {
            reason: format!(
                "isolated mode: {} is outside the allowed paths",
                path.display()
            ),
        };

        if command.kind() == CommandKind::PackageInstall {
            return Err(GuardError::Validation {
                reason: "isolated mode: package managers write outside the allowed paths; \
                         use direct mode"
                    .to_string(),
            });
        }

        let mut paths: Vec<PathBuf> = command
            .target_path()
            .map(Path::to_path_buf)
            .into_iter()
            .collect();
        if let (Some(src), Some(dest)) = (command.target_path(), command.destination()) {
            paths.push(fsutil::resolve_destination(src, dest));
        }
        if command.kind() == CommandKind::Shell {
            let touched = isolated_shell_paths(command.raw_text(), self.working_dir.as_deref())
                .map_err(|reason| GuardError::Validation {
                    reason: format!("isolated mode: {}", reason),
                })?;
            paths.extend(touched);
        }

        for path in &paths {
            if !self.is_allowed(path) {
                info!(path = %path.display(), "refused by allow-list");
                return Err(refuse(path));
            }
        }
        Ok(())
    }
}

/// 허용 경로 문자열을 패턴으로 변환 (존재하는 리터럴 경로는 정규화)
fn root_pattern(root: &str) -> Result<glob::Pattern> {
    let has_glob = root.contains(['*', '?', '[']);
    let pattern = if has_glob {
        root.to_string()
    } else {
        glob::Pattern::escape(&normalize(Path::new(root)).to_string_lossy())
    };
    glob::Pattern::new(&pattern)
        .map_err(|e| GuardError::ConfigError(format!("invalid allowed path '{}': {}", root, e)))
}

fn matches_ancestor(pattern: &glob::Pattern, path: &Path) -> bool {
    path.ancestors().any(|ancestor| pattern.matches_path(ancestor))
}

/// 절대 경로로 바꾸고 존재하는 가장 긴 상위 경로를 정규화 (`..` 제거 포함)
fn normalize(path: &Path) -> PathBuf {
    let absolute = fsutil::absolute_path(path).unwrap_or_else(|_| path.to_path_buf());

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::ParentDir => {
                lexical.pop();
            }
            std::path::Component::CurDir => {}
            other => lexical.push(other),
        }
    }

    let mut existing = lexical.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut result = canonical;
            for part in rest.iter().rev() {
                result.push(part);
            }
            return result;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}

/// isolated 모드에서 셸 명령어가 가리킬 수 있는 모든 경로.
///
/// 토큰을 공백, 연산자, 리다이렉션, 따옴표 기준으로 다시 나눠 중첩된
/// `sh -c '...'` 안의 경로도 잡아냅니다. 상대 경로는 자식의 작업 디렉토리
/// 기준으로 해석합니다. 허용 목록으로 판단할 수 없는 형태(확장, 디렉토리 이동,
/// 상위 디렉토리, 다른 사용자의 `~`)는 거부 사유를 돌려줍니다.
fn isolated_shell_paths(
    raw: &str,
    working_dir: Option<&Path>,
) -> std::result::Result<Vec<PathBuf>, String> {
    if raw.contains(['$', '`']) {
        return Err("variable or command expansion cannot be checked".to_string());
    }
    let tokens = shell_words::split(raw)
        .unwrap_or_else(|_| raw.split_whitespace().map(str::to_string).collect());
    let home = dirs::home_dir();

    let mut paths = Vec::new();
    for token in &tokens {
        let pieces = token.split(|c: char| c.is_whitespace() || PATH_SEPARATORS.contains(c));
        for piece in pieces {
            if piece.is_empty() || piece == "/dev/null" {
                continue;
            }
            if DIR_CHANGERS.contains(&piece) {
                return Err(format!("'{}' changes the working directory", piece));
            }
            let path = Path::new(piece);
            if path
                .components()
                .any(|c| c == std::path::Component::ParentDir)
            {
                return Err(format!("'{}' refers to a parent directory", piece));
            }

            if let Some(rest) = piece.strip_prefix('~') {
                match (&home, rest.is_empty() || rest.starts_with('/')) {
                    (Some(home), true) => paths.push(home.join(rest.trim_start_matches('/'))),
                    _ => return Err(format!("cannot resolve '{}'", piece)),
                }
            } else if path.is_absolute() {
                paths.push(path.to_path_buf());
            } else {
                paths.push(match working_dir {
                    Some(dir) => dir.join(path),
                    None => path.to_path_buf(),
                });
            }
        }
    }
    Ok(paths)
}

fn remap_into(scratch: &Path, path: &Path) -> PathBuf {
    let absolute = normalize(path);
    let relative: PathBuf = absolute
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect();
    scratch.join(relative)
}

/// 시뮬레이션 전 실제 상태를 scratch에 복사. 복사 불가 사유를 반환
fn stage_scratch(
    command: &Command,
    remap: &dyn Fn(&Path) -> PathBuf,
    max_copy: u64,
) -> std::io::Result<Option<String>> {
    let Some(target) = command.target_path() else {
        return Ok(Some("missing target".to_string()));
    };

    if fs::symlink_metadata(target).is_ok() {
        if fsutil::tree_size(target) > max_copy {
            return Ok(Some(format!(
                "{} exceeds the snapshot size ceiling",
                target.display()
            )));
        }
        fsutil::copy_tree(target, &remap(target))?;
    } else if let Some(parent) = target.parent().filter(|p| p.is_dir()) {
        fs::create_dir_all(remap(parent))?;
    }

    if let Some(dest) = command.destination() {
        let resolved = fsutil::resolve_destination(target, dest);
        if dest.is_dir() {
            fs::create_dir_all(remap(dest))?;
        }
        if resolved.is_file() {
            fsutil::copy_tree(&resolved, &remap(&resolved))?;
        } else if let Some(parent) = resolved.parent().filter(|p| p.is_dir()) {
            fs::create_dir_all(remap(parent))?;
        }
    }
    Ok(None)
}

/// 파일 종류 명령어를 직접 수행. `remap`으로 경로를 바꿔 scratch에서도 재사용
fn apply_file_op(
    command: &Command,
    remap: &dyn Fn(&Path) -> PathBuf,
    max_read: usize,
) -> std::io::Result<String> {
    let missing = || std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing target path");
    let target = command.target_path().map(remap).ok_or_else(missing)?;

    match command.kind() {
        CommandKind::ListDirectory => {
            let mut names: Vec<String> = fs::read_dir(&target)?
                .filter_map(|e| e.ok())
                .map(|e| {
                    let mut name = e.file_name().to_string_lossy().into_owned();
                    if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        name.push('/');
                    }
                    name
                })
                .collect();
            names.sort();
            Ok(names.join("\n"))
        }
        CommandKind::ReadFile => {
            let bytes = fs::read(&target)?;
            let shown = &bytes[..bytes.len().min(max_read)];
            Ok(String::from_utf8_lossy(shown).into_owned())
        }
        CommandKind::FileMove => {
            let dest = destination(command, remap)?;
            let resolved = fsutil::resolve_destination(&target, &dest);
            if let Err(e) = fs::rename(&target, &resolved) {
                if !is_cross_device(&e) {
                    return Err(e);
                }
                fsutil::copy_tree(&target, &resolved)?;
                remove_any(&target)?;
            }
            Ok(format!("moved {} to {}", target.display(), resolved.display()))
        }
        CommandKind::FileCopy => {
            let dest = destination(command, remap)?;
            let resolved = fsutil::resolve_destination(&target, &dest);
            let bytes = fsutil::copy_tree(&target, &resolved)?;
            Ok(format!(
                "copied {} to {} ({} bytes)",
                target.display(),
                resolved.display(),
                bytes
            ))
        }
        CommandKind::FileDelete => {
            remove_any(&target)?;
            Ok(format!("deleted {}", target.display()))
        }
        CommandKind::CreateDirectory => {
            fs::create_dir_all(&target)?;
            Ok(format!("created directory {}", target.display()))
        }
        CommandKind::PermissionChange => {
            let raw = command.arguments().first().map(String::as_str).unwrap_or("");
            let mode = u32::from_str_radix(raw, 8).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("'{}' is not an octal mode", raw),
                )
            })?;
            fsutil::set_mode(&target, mode)?;
            Ok(format!("changed mode of {} to {:o}", target.display(), mode))
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{} is not a file operation", other),
        )),
    }
}

fn destination(command: &Command, remap: &dyn Fn(&Path) -> PathBuf) -> std::io::Result<PathBuf> {
    let dest = command.destination().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing destination")
    })?;
    let mapped = remap(dest);
    // resolve_destination이 후행 '/'를 보고 디렉토리로 판단하므로 유지
    if dest.to_string_lossy().ends_with('/') && !mapped.to_string_lossy().ends_with('/') {
        return Ok(PathBuf::from(format!("{}/", mapped.display())));
    }
    Ok(mapped)
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn is_cross_device(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// 패키지 관리자별 설치 명령
fn package_invocation(args: &[String]) -> (String, Vec<String>) {
    let manager = args.first().map(String::as_str).unwrap_or("");
    let packages = args.get(1..).unwrap_or(&[]).to_vec();
    let (program, mut argv) = match manager {
        "apt" | "apt-get" => ("apt-get", vec!["install".to_string(), "-y".to_string()]),
        other => (other, vec!["install".to_string()]),
    };
    argv.extend(packages);
    (program.to_string(), argv)
}

/// 설치의 역명령 (되돌리기 기록용)
pub(crate) fn package_uninstall(args: &[String]) -> (String, Vec<String>) {
    let manager = args.first().map(String::as_str).unwrap_or("");
    let packages = args.get(1..).unwrap_or(&[]).to_vec();
    let (program, mut argv) = match manager {
        "apt" | "apt-get" => ("apt-get", vec!["remove".to_string(), "-y".to_string()]),
        "brew" | "npm" | "cargo" => (manager, vec!["uninstall".to_string()]),
        "pip" | "pip3" => (manager, vec!["uninstall".to_string(), "-y".to_string()]),
        other => (other, vec!["uninstall".to_string()]),
    };
    argv.extend(packages);
    (program.to_string(), argv)
}

#[cfg(unix)]
fn send_signal(args: &[String]) -> std::result::Result<String, String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let name = args
        .first()
        .map(|s| s.trim_start_matches("SIG").to_uppercase())
        .unwrap_or_default();
    let signal = match name.as_str() {
        "TERM" => Signal::SIGTERM,
        "KILL" => Signal::SIGKILL,
        "INT" => Signal::SIGINT,
        "HUP" => Signal::SIGHUP,
        "STOP" => Signal::SIGSTOP,
        "CONT" => Signal::SIGCONT,
        other => return Err(format!("unsupported signal '{}'", other)),
    };
    let pid: i32 = args
        .get(1)
        .and_then(|p| p.parse().ok())
        .filter(|pid| *pid > 1)
        .ok_or_else(|| "invalid pid".to_string())?;

    kill(Pid::from_raw(pid), signal).map_err(|e| format!("kill {}: {}", pid, e))?;
    Ok(format!("sent {} to pid {}", signal.as_str(), pid))
}

#[cfg(not(unix))]
fn send_signal(_args: &[String]) -> std::result::Result<String, String> {
    Err("process control is only supported on unix".to_string())
}

/// 실행 없이 셸 문법만 확인 (따옴표/괄호 균형, 끝에 걸린 연산자)
pub fn check_syntax(raw: &str) -> std::result::Result<SyntaxReport, String> {
    if raw.trim().is_empty() {
        return Err("empty command".to_string());
    }
    let tokens = shell_words::split(raw).map_err(|_| "unbalanced quotes".to_string())?;

    let mut stack = Vec::new();
    let mut unquoted = String::new();
    let (mut single, mut double, mut escaped) = (false, false, false);
    for c in raw.chars() {
        if escaped {
            escaped = false;
            unquoted.push('_');
            continue;
        }
        match c {
            '\\' if !single => escaped = true,
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            _ if single || double => {}
            '(' | '{' | '[' => stack.push(c),
            ')' | '}' | ']' => {
                let open = match c {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                if stack.pop() != Some(open) {
                    return Err(format!("unbalanced '{}'", c));
                }
            }
            _ => {}
        }
        if !single && !double && c != '\\' {
            unquoted.push(c);
        }
    }
    if let Some(open) = stack.last() {
        return Err(format!("unclosed '{}'", open));
    }

    let trimmed = unquoted.trim();
    let dangling_end = trimmed.ends_with('|') || trimmed.ends_with("&&");
    let dangling_start = trimmed.starts_with('|')
        || trimmed.starts_with('&')
        || trimmed.starts_with(';');
    if dangling_end || dangling_start {
        return Err("dangling operator".to_string());
    }

    let segments = split_commands(trimmed)
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .count();
    Ok(SyntaxReport {
        tokens: tokens.len(),
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(mode: SandboxMode, allowed: &Path) -> SandboxExecutor {
        let mut config = Config::default().with_mode(mode);
        config.allowed_paths = vec![allowed.display().to_string()];
        config.command_timeout = 2;
        SandboxExecutor::from_config(&config).unwrap()
    }

    #[test]
    fn test_check_syntax() {
        assert_eq!(
            check_syntax("ls -la | grep 'a b'").unwrap(),
            SyntaxReport {
                tokens: 5,
                segments: 2
            }
        );
        assert!(check_syntax("echo \"unterminated").is_err());
        assert!(check_syntax("echo $(date").is_err());
        assert!(check_syntax("ls |").is_err());
        assert!(check_syntax("make &&").is_err());
        assert!(check_syntax("| ls").is_err());
        assert!(check_syntax("echo ')'").is_ok());
        assert!(check_syntax("sleep 1 &").is_ok());
        assert_eq!(check_syntax("make 2>&1 | tee log").unwrap().segments, 2);
    }

    #[tokio::test]
    async fn test_validation_mode_performs_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keep.txt");
        fs::write(&file, b"data").unwrap();

        let sandbox = executor(SandboxMode::Validation, dir.path());
        let result = sandbox
            .execute(&Command::file_delete(&file), None)
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(result.output.starts_with("syntax ok"));
        assert_eq!(result.mode, SandboxMode::Validation);
        assert!(file.exists());

        let bad = sandbox
            .execute(&Command::shell("echo 'oops"), None)
            .await
            .unwrap();
        assert_eq!(bad.status, ExecutionStatus::Failure);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"data").unwrap();

        let sandbox = executor(SandboxMode::DryRun, dir.path());
        let result = sandbox
            .execute(&Command::file_delete(&file), None)
            .await
            .unwrap();

        assert!(result.output.contains("would delete"));
        assert_eq!(fs::read(&file).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_simulation_replays_on_scratch_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"data").unwrap();
        let docs = dir.path().join("Documents");
        fs::create_dir(&docs).unwrap();

        let sandbox = executor(SandboxMode::Simulation, dir.path());
        let cmd = Command::file_move(&src, format!("{}/", docs.display()));
        let result = sandbox.execute(&cmd, None).await.unwrap();

        assert!(result.is_success(), "{}", result.output);
        assert!(result.output.contains("moved"));
        assert!(src.exists());
        assert!(!docs.join("a.txt").exists());

        let shell = sandbox.execute(&Command::shell("make"), None).await.unwrap();
        assert!(shell.output.starts_with("cannot simulate"));
    }

    #[tokio::test]
    async fn test_isolated_refuses_paths_outside_allow_list() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        fs::write(&victim, b"x").unwrap();

        let sandbox = executor(SandboxMode::Isolated, allowed.path());
        let err = sandbox
            .execute(&Command::file_delete(&victim), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Validation { .. }));
        assert!(victim.exists());

        let shell = Command::shell(format!("rm {}", victim.display()));
        assert!(sandbox.execute(&shell, None).await.is_err());
        assert!(victim.exists());

        let inside = allowed.path().join("mine.txt");
        fs::write(&inside, b"y").unwrap();
        let result = sandbox
            .execute(&Command::file_delete(&inside), None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(!inside.exists());
    }

    #[tokio::test]
    async fn test_direct_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = executor(SandboxMode::Direct, dir.path());

        let new_dir = dir.path().join("Documents");
        let mkdir = Command::new(CommandKind::CreateDirectory, "mkdir Documents")
            .with_target(&new_dir);
        assert!(sandbox.execute(&mkdir, None).await.unwrap().is_success());

        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();
        let chmod = Command::new(CommandKind::PermissionChange, "chmod 600 a.txt")
            .with_target(&file)
            .with_args(["600"]);
        assert!(sandbox.execute(&chmod, None).await.unwrap().is_success());
        assert_eq!(fsutil::mode_of(&fs::metadata(&file).unwrap()), 0o600);

        let mv = Command::file_move(&file, new_dir.display().to_string());
        let result = sandbox.execute(&mv, None).await.unwrap();
        assert!(result.is_success());
        assert_eq!(fs::read(new_dir.join("a.txt")).unwrap(), b"hello");

        let missing = sandbox
            .execute(&Command::file_delete(dir.path().join("nope")), None)
            .await
            .unwrap();
        assert_eq!(missing.status, ExecutionStatus::Failure);
    }

    #[tokio::test]
    async fn test_shell_timeout_reports_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default().with_mode(SandboxMode::Direct);
        config.command_timeout = 1;
        config.termination_grace_ms = 100;
        config.allowed_paths = vec![dir.path().display().to_string()];
        let sandbox = SandboxExecutor::from_config(&config).unwrap();

        let result = sandbox
            .execute(&Command::shell("sleep 10"), None)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.duration_ms < 5000);
    }

    #[test]
    fn test_package_invocation() {
        let args = vec!["apt".to_string(), "vim".to_string()];
        assert_eq!(
            package_invocation(&args),
            (
                "apt-get".to_string(),
                vec!["install".to_string(), "-y".to_string(), "vim".to_string()]
            )
        );
    }

    #[test]
    fn test_package_uninstall() {
        let pip = vec!["pip".to_string(), "requests".to_string()];
        assert_eq!(
            package_uninstall(&pip),
            (
                "pip".to_string(),
                vec!["uninstall".to_string(), "-y".to_string(), "requests".to_string()]
            )
        );
        let apt = vec!["apt-get".to_string(), "vim".to_string()];
        assert_eq!(package_uninstall(&apt).1[0], "remove");
    }

    #[test]
    fn test_isolated_shell_paths() {
        let work = Path::new("/w");
        let paths =
            isolated_shell_paths("cp notes.txt /etc/motd --log=/var/log/x 2>/dev/null 2>>/tmp/e", Some(work))
                .unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/w/cp"),
                PathBuf::from("/w/notes.txt"),
                PathBuf::from("/etc/motd"),
                PathBuf::from("/w/--log"),
                PathBuf::from("/var/log/x"),
                PathBuf::from("/w/2"),
                PathBuf::from("/w/2"),
                PathBuf::from("/tmp/e"),
            ]
        );

        let nested = isolated_shell_paths("sh -c 'echo x > /etc/passwd'", Some(work)).unwrap();
        assert!(nested.contains(&PathBuf::from("/etc/passwd")));

        for escape in [
            "echo pwned > ../outside.txt",
            "cat sub/../../x",
            "cd .. && touch x",
            "cd; touch x",
            "pushd /tmp",
            "sh -c 'cd ..; touch x'",
            "echo x > $HOME/x",
            "touch `pwd`/x",
            "touch ~root/x",
        ] {
            assert!(isolated_shell_paths(escape, Some(work)).is_err(), "{}", escape);
        }
    }

    #[tokio::test]
    async fn test_isolated_blocks_relative_and_expansion_escapes() {
        let root = tempfile::tempdir().unwrap();
        let allowed = root.path().join("allowed");
        fs::create_dir(&allowed).unwrap();
        let sandbox = executor(SandboxMode::Isolated, &allowed);

        for line in [
            "echo pwned > ../outside.txt",
            "cd .. && echo pwned > outside.txt",
            "echo pwned > $PWD/../outside.txt",
            "echo pwned > `pwd`/../outside.txt",
        ] {
            let err = sandbox.execute(&Command::shell(line), None).await.unwrap_err();
            assert!(matches!(err, GuardError::Validation { .. }), "{}", line);
        }
        let home_write = Command::shell("touch ~/cmdguard-isolated-escape");
        if dirs::home_dir().map_or(false, |h| !h.starts_with(&allowed)) {
            assert!(sandbox.execute(&home_write, None).await.is_err());
        }
        assert!(!root.path().join("outside.txt").exists());

        // 허용된 작업 디렉토리 안에서는 상대 경로 사용 가능
        let result = sandbox
            .execute(&Command::shell("echo ok > inside.txt"), None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(fs::read_to_string(allowed.join("inside.txt")).unwrap(), "ok\n");
    }
}
