use crate::config::Config;
use crate::error::{GuardError, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// isolated 모드에서 유지하는 환경 변수
const KEPT_ENV: &[&str] = &["PATH", "HOME", "LANG"];

/// 자식 프로세스 자원 제한
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub cpu_seconds: u64,
    pub max_file_bytes: u64,
    pub max_processes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub working_dir: Option<PathBuf>,
    /// KEPT_ENV 외의 환경 변수 제거
    pub clear_env: bool,
    pub limits: Option<RunLimits>,
}

impl RunOptions {
    pub fn isolated(working_dir: Option<PathBuf>, limits: RunLimits) -> Self {
        Self {
            working_dir,
            clear_env: true,
            limits: Some(limits),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// 정상 종료 (시그널로 죽으면 코드 없음)
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit: RunExit,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit == RunExit::Exited(Some(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            RunExit::Exited(code) => code,
            _ => None,
        }
    }

    /// stdout 뒤에 stderr를 붙인 출력
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// 하위 프로세스 실행기. 자식은 자체 프로세스 그룹에서 실행되며
/// 타임아웃이나 취소 시 그룹 전체에 SIGTERM, 유예 후 SIGKILL을 보냅니다.
pub struct CommandRunner {
    timeout: Duration,
    grace: Duration,
    max_output_bytes: usize,
}

impl CommandRunner {
    pub fn new(timeout: Duration, grace: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            grace,
            max_output_bytes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.timeout(),
            Duration::from_millis(config.termination_grace_ms),
            config.max_output_bytes,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `sh -c`로 셸 명령어 실행
    pub async fn run_shell(
        &self,
        line: &str,
        options: &RunOptions,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutput> {
        self.run("sh", &["-c".to_string(), line.to_string()], options, cancel)
            .await
    }

    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        options: &RunOptions,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutput> {
        let start = Instant::now();
        let mut child = self.spawn(program, args, options)?;
        debug!(program, pid = ?child.id(), "child spawned");

        let limit = self.max_output_bytes;
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, limit)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, limit)));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            _ = wait_cancelled(cancel) => Outcome::Cancelled,
        };

        let exit = match outcome {
            Outcome::Exited(status) => RunExit::Exited(
                status
                    .map_err(|e| GuardError::Execution(e.to_string()))?
                    .code(),
            ),
            Outcome::TimedOut => {
                warn!(program, timeout = ?self.timeout, "command timed out, terminating");
                self.terminate(&mut child).await;
                RunExit::TimedOut
            }
            Outcome::Cancelled => {
                warn!(program, "command cancelled, terminating");
                self.terminate(&mut child).await;
                RunExit::Cancelled
            }
        };

        let (stdout, out_truncated) = self.collect(stdout).await;
        let (stderr, err_truncated) = self.collect(stderr).await;

        Ok(RunOutput {
            exit,
            stdout,
            stderr,
            truncated: out_truncated || err_truncated,
            duration: start.elapsed(),
        })
    }

    fn spawn(&self, program: &str, args: &[String], options: &RunOptions) -> Result<Child> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        if options.clear_env {
            cmd.env_clear();
            for key in KEPT_ENV {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(limits) = options.limits {
                // SAFETY: fork 이후 exec 이전에는 setrlimit/getrlimit 시스템 호출만 사용
                unsafe {
                    cmd.pre_exec(move || apply_limits(&limits));
                }
            }
        }

        cmd.spawn()
            .map_err(|e| GuardError::Execution(format!("failed to spawn {}: {}", program, e)))
    }

    /// 프로세스 그룹에 SIGTERM, 유예 시간 후 SIGKILL
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let group = Pid::from_raw(pid as i32);
                let _ = killpg(group, Signal::SIGTERM);
                let exited = tokio::time::timeout(self.grace, child.wait()).await.is_ok();
                // 그룹에 남은 프로세스 정리
                let _ = killpg(group, Signal::SIGKILL);
                if exited {
                    return;
                }
            }
        }
        let _ = child.kill().await;
    }

    async fn collect(
        &self,
        handle: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
    ) -> (String, bool) {
        let Some(handle) = handle else {
            return (String::new(), false);
        };
        // 분리된 손자 프로세스가 파이프를 쥐고 있어도 멈추지 않도록 제한
        match tokio::time::timeout(self.grace.max(Duration::from_millis(100)), handle).await {
            Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
            _ => (String::new(), true),
        }
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

pub(crate) async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // 송신자가 사라지면 더 이상 취소될 수 없음
            return std::future::pending().await;
        }
    }
}

/// 한도까지만 보관하고 나머지는 버리며 끝까지 읽음 (자식이 파이프에서 막히지 않도록)
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, truncated)
}

#[cfg(unix)]
fn apply_limits(limits: &RunLimits) -> std::io::Result<()> {
    use nix::sys::resource::Resource;

    lower_limit(Resource::RLIMIT_CPU, limits.cpu_seconds)?;
    lower_limit(Resource::RLIMIT_FSIZE, limits.max_file_bytes)?;
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    lower_limit(Resource::RLIMIT_NPROC, limits.max_processes)?;
    Ok(())
}

/// 현재 hard limit보다 높게 올리지는 않음 (비특권 프로세스는 올릴 수 없음)
#[cfg(unix)]
fn lower_limit(resource: nix::sys::resource::Resource, value: u64) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = getrlimit(resource).map_err(std::io::Error::from)?;
    let value = value.min(hard);
    setrlimit(resource, value, value).map_err(std::io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(timeout_ms: u64) -> CommandRunner {
        CommandRunner::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(200),
            1024,
        )
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let out = runner(5000)
            .run_shell("echo hello; echo oops >&2; exit 3", &RunOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(out.exit, RunExit::Exited(Some(3)));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.combined().contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let started = Instant::now();
        let out = runner(300)
            .run_shell("sleep 10", &RunOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(out.exit, RunExit::TimedOut);
        assert_eq!(out.exit_code(), None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let out = runner(5000)
            .run_shell(
                "head -c 5000 /dev/zero | tr '\\0' a",
                &RunOptions::default(),
                None,
            )
            .await
            .unwrap();

        assert!(out.success());
        assert!(out.truncated);
        assert_eq!(out.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });

        let out = runner(10_000)
            .run_shell("sleep 10", &RunOptions::default(), Some(rx))
            .await
            .unwrap();
        assert_eq!(out.exit, RunExit::Cancelled);
    }

    #[tokio::test]
    async fn test_isolated_clears_environment() {
        std::env::set_var("CMDGUARD_RUNNER_SECRET", "leak");
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions::isolated(
            Some(dir.path().to_path_buf()),
            RunLimits {
                cpu_seconds: 5,
                max_file_bytes: 1024 * 1024,
                max_processes: 4096,
            },
        );

        let out = runner(5000)
            .run_shell("env; pwd", &options, None)
            .await
            .unwrap();

        assert!(out.success(), "stderr: {}", out.stderr);
        assert!(!out.stdout.contains("CMDGUARD_RUNNER_SECRET"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_missing_program_is_execution_error() {
        let err = runner(1000)
            .run("/nonexistent/cmdguard-bin", &[], &RunOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Execution(_)));
    }
}
