use clap::{Parser, Subcommand};
use cmdguard::config::SandboxMode;
use cmdguard::executor::StepId;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cmdguard")]
#[command(version)]
#[command(about = "Sandboxed command execution with undo", long_about = None)]
pub struct Cli {
    /// 세션 이름 (되돌리기 스택 단위)
    #[arg(short = 's', long, global = true, default_value = "default")]
    pub session: String,

    /// 실행 모드 (dry_run, simulation, isolated, validation, direct). 미지정시 설정 파일 값 사용
    #[arg(short = 'm', long, global = true, value_parser = parse_mode)]
    pub mode: Option<SandboxMode>,

    /// High 미만 단계는 확인 없이 실행, 실패 시 중단
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// 설정 파일 경로 (기본: ~/.cmdguard/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// 디버그 로그
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// JSON 계획 파일 실행
    Run {
        /// 계획 파일 (단계 배열 또는 {"steps": [...]})
        plan: PathBuf,

        /// 결과를 JSON으로 출력
        #[arg(long)]
        json: bool,
    },

    /// 실행하지 않고 검증과 위험도만 평가
    Check {
        plan: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// 마지막 변경 되돌리기
    Undo {
        /// 이 단계까지 한 번에 되돌림 (<plan-uuid>:<index>)
        #[arg(long)]
        to: Option<StepId>,

        /// 되돌리기 스택만 출력
        #[arg(long, conflicts_with = "to")]
        list: bool,
    },

    /// 세션의 변경을 확정 (되돌리기 기록과 스냅샷 삭제)
    Commit,

    /// 감사 로그 관리
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuditAction {
    /// 해시 체인 무결성 검사
    Verify,
}

fn parse_mode(s: &str) -> Result<SandboxMode, String> {
    SandboxMode::from_str(s).ok_or_else(|| {
        format!(
            "unknown mode '{}' (expected dry_run, simulation, isolated, validation or direct)",
            s
        )
    })
}
