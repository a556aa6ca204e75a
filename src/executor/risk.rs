use crate::command::{Command, CommandKind};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 위험도. 순서가 의미를 가지므로 비교 연산에 사용됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 위험도 평가 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub warnings: Vec<String>,
    /// High 이상: 확인 없이는 실행 불가
    pub blocking: bool,
    /// 등급을 결정한 규칙 이름
    pub rule: String,
}

impl RiskAssessment {
    /// Critical은 승인 여부와 관계없이 실행되지 않음
    pub fn is_forbidden(&self) -> bool {
        self.level == RiskLevel::Critical
    }
}

/// 셸 명령어의 한 구간 (`;`, `|`, `&`로 구분)
#[derive(Debug, Clone)]
struct Segment {
    program: String,
    args: Vec<String>,
    elevated: bool,
}

/// 규칙 평가에 쓰이는 명령어의 파생 정보
struct CommandView<'a> {
    command: &'a Command,
    segments: Vec<Segment>,
}

impl<'a> CommandView<'a> {
    fn new(command: &'a Command) -> Self {
        let segments = if command.kind() == CommandKind::Shell {
            parse_segments(command.raw_text())
        } else {
            Vec::new()
        };
        Self { command, segments }
    }

    fn kind(&self) -> CommandKind {
        self.command.kind()
    }

    fn runs(&self, programs: &[&str]) -> bool {
        self.segments
            .iter()
            .any(|s| programs.contains(&s.program.as_str()))
    }

    fn segments_running<'s>(&'s self, program: &'s str) -> impl Iterator<Item = &'s Segment> + 's {
        self.segments.iter().filter(move |s| s.program == program)
    }

    fn elevated(&self) -> bool {
        self.segments.iter().any(|s| s.elevated)
    }

    /// 검사 대상이 되는 모든 경로/토큰
    fn path_like(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .command
            .target_path()
            .map(|p| p.to_string_lossy().into_owned())
            .into_iter()
            .collect();
        if self.kind().is_file_kind() {
            out.extend(self.command.arguments().iter().cloned());
        }
        for seg in &self.segments {
            out.extend(seg.args.iter().filter(|a| !a.starts_with('-')).cloned());
        }
        out
    }
}

const SYSTEM_ROOTS: &[&str] = &[
    "/", "/*", "~", "~/", "$HOME", "/home", "/etc", "/usr", "/var", "/boot", "/bin", "/sbin",
    "/lib", "/opt", "/System", "/Users", "/root",
];
const SYSTEM_PREFIXES: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/lib", "/var", "/System", "/Library",
];
const SENSITIVE_MARKERS: &[&str] = &[
    ".ssh", "id_rsa", "id_ed25519", ".env", ".aws", ".gnupg", ".netrc", "credentials",
    "/etc/shadow", "/etc/passwd", "/etc/sudoers",
];
const READ_ONLY_PROGRAMS: &[&str] = &[
    "ls", "cat", "echo", "pwd", "whoami", "date", "head", "tail", "wc", "du", "df", "which",
    "grep", "rg", "stat", "file", "uname", "ps", "tree", "less", "more", "true", "printf",
];
const SYSTEM_PACKAGE_MANAGERS: &[&str] = &["apt", "apt-get", "brew"];

/// 등급 규칙. 표 순서대로 평가하며 처음 일치한 규칙이 등급을 정합니다.
struct LevelRule {
    name: &'static str,
    level: RiskLevel,
    warning: &'static str,
    matches: fn(&CommandView) -> bool,
}

/// 경고 규칙. 일치하는 모든 규칙의 경고가 누적됩니다.
struct WarningRule {
    warning: &'static str,
    matches: fn(&CommandView) -> bool,
}

const LEVEL_RULES: &[LevelRule] = &[
    LevelRule {
        name: "recursive-delete-of-system-root",
        level: RiskLevel::Critical,
        warning: "recursively deletes a system root or home directory",
        matches: |v| {
            let shell = v.segments_running("rm").any(|s| {
                let recursive = s.args.iter().any(|a| is_recursive_flag(a));
                let no_preserve = s.args.iter().any(|a| a == "--no-preserve-root");
                no_preserve
                    || (recursive && s.args.iter().any(|a| SYSTEM_ROOTS.contains(&a.as_str())))
            });
            let structured = v.kind() == CommandKind::FileDelete
                && v.command
                    .target_path()
                    .map(is_system_root)
                    .unwrap_or(false);
            shell || structured
        },
    },
    LevelRule {
        name: "filesystem-format",
        level: RiskLevel::Critical,
        warning: "formats or repartitions a disk",
        matches: |v| {
            v.runs(&["mkfs", "fdisk", "parted", "wipefs", "sfdisk", "diskutil"])
                || v.segments.iter().any(|s| s.program.starts_with("mkfs."))
        },
    },
    LevelRule {
        name: "raw-device-write",
        level: RiskLevel::Critical,
        warning: "writes directly to a block device",
        matches: |v| {
            v.segments_running("dd")
                .any(|s| s.args.iter().any(|a| a.starts_with("of=/dev/")))
        },
    },
    LevelRule {
        name: "recursive-permission-change-of-system-root",
        level: RiskLevel::Critical,
        warning: "recursively changes ownership or permissions of a system root",
        matches: |v| {
            let shell = ["chmod", "chown", "chgrp"].iter().any(|p| {
                v.segments_running(p).any(|s| {
                    s.args.iter().any(|a| is_recursive_flag(a))
                        && s.args.iter().any(|a| SYSTEM_ROOTS.contains(&a.as_str()))
                })
            });
            let structured = v.kind() == CommandKind::PermissionChange
                && v.command.target_path().map(|p| p == Path::new("/")).unwrap_or(false);
            shell || structured
        },
    },
    LevelRule {
        name: "system-power",
        level: RiskLevel::Critical,
        warning: "shuts down or reboots the machine",
        matches: |v| {
            v.runs(&["shutdown", "reboot", "halt", "poweroff"])
                || v.segments_running("init")
                    .any(|s| s.args.first().map(|a| a == "0" || a == "6").unwrap_or(false))
        },
    },
    LevelRule {
        name: "privilege-escalation",
        level: RiskLevel::High,
        warning: "runs with elevated privileges",
        matches: |v| v.elevated(),
    },
    LevelRule {
        name: "recursive-delete",
        level: RiskLevel::High,
        warning: "recursively deletes files",
        matches: |v| {
            v.segments_running("rm")
                .any(|s| s.args.iter().any(|a| is_recursive_flag(a)))
                || v.runs(&["shred"])
        },
    },
    LevelRule {
        name: "force-kill",
        level: RiskLevel::High,
        warning: "forcibly terminates a process",
        matches: |v| {
            (v.kind() == CommandKind::ProcessControl
                && v.command
                    .arguments()
                    .first()
                    .map(|s| s.trim_start_matches("SIG").eq_ignore_ascii_case("KILL"))
                    .unwrap_or(false))
                || v.runs(&["killall", "pkill"])
        },
    },
    LevelRule {
        name: "system-package-install",
        level: RiskLevel::High,
        warning: "installs system-wide packages",
        matches: |v| {
            v.kind() == CommandKind::PackageInstall
                && v.command
                    .arguments()
                    .first()
                    .map(|m| SYSTEM_PACKAGE_MANAGERS.contains(&m.as_str()))
                    .unwrap_or(false)
        },
    },
    LevelRule {
        name: "world-writable-permissions",
        level: RiskLevel::High,
        warning: "makes files writable by every user",
        matches: |v| {
            let structured = v.kind() == CommandKind::PermissionChange
                && v.command
                    .arguments()
                    .first()
                    .map(|m| world_writable(m))
                    .unwrap_or(false);
            let shell = v
                .segments_running("chmod")
                .any(|s| s.args.iter().any(|a| world_writable(a) || a.contains("o+w")));
            structured || shell
        },
    },
    LevelRule {
        name: "system-directory-mutation",
        level: RiskLevel::High,
        warning: "modifies files under a system directory",
        matches: touches_system_dir,
    },
    LevelRule {
        name: "file-delete",
        level: RiskLevel::Medium,
        warning: "deletes a file (snapshot taken first)",
        matches: |v| v.kind() == CommandKind::FileDelete,
    },
    LevelRule {
        name: "permission-change",
        level: RiskLevel::Medium,
        warning: "changes file permissions",
        matches: |v| v.kind() == CommandKind::PermissionChange,
    },
    LevelRule {
        name: "process-signal",
        level: RiskLevel::Medium,
        warning: "sends a signal to a process",
        matches: |v| v.kind() == CommandKind::ProcessControl,
    },
    LevelRule {
        name: "user-package-install",
        level: RiskLevel::Medium,
        warning: "installs packages",
        matches: |v| v.kind() == CommandKind::PackageInstall,
    },
    LevelRule {
        name: "reversible-file-operation",
        level: RiskLevel::Low,
        warning: "reversible file operation",
        matches: |v| {
            matches!(
                v.kind(),
                CommandKind::FileMove | CommandKind::FileCopy | CommandKind::CreateDirectory
            )
        },
    },
    LevelRule {
        name: "sensitive-read",
        level: RiskLevel::Medium,
        warning: "reads a sensitive location",
        matches: |v| {
            matches!(v.kind(), CommandKind::ReadFile | CommandKind::ListDirectory)
                && v.path_like().iter().any(|p| is_sensitive(p))
        },
    },
    LevelRule {
        name: "read-only",
        level: RiskLevel::Low,
        warning: "read-only operation",
        matches: |v| {
            matches!(v.kind(), CommandKind::ReadFile | CommandKind::ListDirectory)
                || is_read_only_shell(v)
        },
    },
];

const WARNING_RULES: &[WarningRule] = &[
    WarningRule {
        warning: "touches a sensitive path",
        matches: |v| v.path_like().iter().any(|p| is_sensitive(p)),
    },
    WarningRule {
        warning: "accesses the network",
        matches: |v| v.runs(&["curl", "wget", "ssh", "scp", "rsync", "nc", "ftp"]),
    },
    WarningRule {
        warning: "no target path; changes cannot be snapshotted",
        matches: |v| {
            v.kind() == CommandKind::Shell
                && v.command.target_path().is_none()
                && !is_read_only_shell(v)
        },
    },
    WarningRule {
        warning: "effect cannot be undone",
        matches: |v| v.kind() == CommandKind::ProcessControl,
    },
];

/// 순수 함수 위험도 평가기
pub struct RiskAssessor;

impl RiskAssessor {
    pub fn new() -> Self {
        Self
    }

    /// 같은 입력에는 항상 같은 결과를 반환합니다 (파일 시스템을 보지 않음).
    pub fn assess(&self, command: &Command) -> RiskAssessment {
        let view = CommandView::new(command);

        let (name, level, warning) = LEVEL_RULES
            .iter()
            .find(|rule| (rule.matches)(&view))
            .map(|rule| (rule.name, rule.level, rule.warning))
            // 분류되지 않은 명령어는 Medium (fail safe)
            .unwrap_or(("unclassified", RiskLevel::Medium, "unclassified command"));

        let mut warnings = vec![warning.to_string()];
        for rule in WARNING_RULES {
            if (rule.matches)(&view) && !warnings.iter().any(|w| w == rule.warning) {
                warnings.push(rule.warning.to_string());
            }
        }

        RiskAssessment {
            level,
            warnings,
            blocking: level >= RiskLevel::High,
            rule: name.to_string(),
        }
    }
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::new()
    }
}

/// `;`, `|`, `&`, 줄바꿈으로 명령어를 나눔. `2>&1`, `&>`, `<&`의 `&`는 리다이렉션
pub(crate) fn split_commands(raw: &str) -> Vec<&str> {
    let bytes = raw.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        let separator = match c {
            ';' | '|' | '\n' => true,
            '&' => {
                let after_redirect = i > 0 && matches!(bytes[i - 1], b'>' | b'<');
                let before_redirect = bytes.get(i + 1) == Some(&b'>');
                !(after_redirect || before_redirect)
            }
            _ => false,
        };
        if separator {
            parts.push(&raw[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn parse_segments(raw: &str) -> Vec<Segment> {
    split_commands(raw)
        .into_iter()
        .filter_map(|part| {
            let tokens = shell_words::split(part)
                .unwrap_or_else(|_| part.split_whitespace().map(str::to_string).collect());
            let mut elevated = false;
            let mut iter = tokens.into_iter().peekable();
            while let Some(tok) = iter.peek() {
                let base = base_name(tok);
                if matches!(base.as_str(), "sudo" | "doas" | "su") {
                    elevated = true;
                    iter.next();
                    // sudo 옵션 (-u user 등)
                    while iter.peek().map(|t| t.starts_with('-')).unwrap_or(false) {
                        let flag = iter.next().unwrap_or_default();
                        if flag == "-u" || flag == "-g" {
                            iter.next();
                        }
                    }
                } else if matches!(base.as_str(), "env" | "nohup" | "time" | "exec" | "command")
                    || (tok.contains('=') && !tok.starts_with('-'))
                {
                    iter.next();
                } else {
                    break;
                }
            }
            let program = iter.next().map(|p| base_name(&p))?;
            Some(Segment {
                program,
                args: iter.collect(),
                elevated,
            })
        })
        .collect()
}

fn base_name(token: &str) -> String {
    token.rsplit('/').next().unwrap_or(token).to_string()
}

fn is_recursive_flag(arg: &str) -> bool {
    arg == "--recursive"
        || (arg.starts_with('-') && !arg.starts_with("--") && (arg.contains('r') || arg.contains('R')))
}

fn is_system_root(path: &Path) -> bool {
    let text = path.to_string_lossy();
    let trimmed = if text.len() > 1 {
        text.trim_end_matches('/')
    } else {
        &text
    };
    SYSTEM_ROOTS.contains(&trimmed)
}

fn world_writable(mode: &str) -> bool {
    if !(3..=4).contains(&mode.len()) || !mode.chars().all(|c| c.is_digit(8)) {
        return false;
    }
    mode.chars()
        .last()
        .and_then(|c| c.to_digit(8))
        .map(|others| others & 0o2 != 0)
        .unwrap_or(false)
}

fn is_sensitive(path: &str) -> bool {
    SENSITIVE_MARKERS.iter().any(|m| path.contains(m))
}

fn touches_system_dir(view: &CommandView) -> bool {
    if !view.command.is_mutating() || is_read_only_shell(view) {
        return false;
    }
    view.path_like().iter().any(|p| {
        SYSTEM_PREFIXES
            .iter()
            .any(|prefix| p == prefix || p.starts_with(&format!("{}/", prefix)))
    })
}

fn is_read_only_shell(view: &CommandView) -> bool {
    view.kind() == CommandKind::Shell
        && !view.segments.is_empty()
        && !view.command.raw_text().contains('>')
        && view
            .segments
            .iter()
            .all(|s| READ_ONLY_PROGRAMS.contains(&s.program.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(cmd: &Command) -> RiskLevel {
        RiskAssessor::new().assess(cmd).level
    }

    #[test]
    fn test_rm_rf_root_is_critical_and_blocking() {
        let assessment = RiskAssessor::new().assess(&Command::shell("rm -rf /"));
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert!(assessment.blocking);
        assert!(assessment.is_forbidden());
        assert_eq!(assessment.rule, "recursive-delete-of-system-root");
    }

    #[test]
    fn test_redirections_do_not_split_commands() {
        let programs: Vec<String> = parse_segments("make 2>&1 | tee build.log &> /dev/null; ls <&0")
            .into_iter()
            .map(|s| s.program)
            .collect();
        assert_eq!(programs, vec!["make", "tee", "ls"]);
        assert_eq!(split_commands("a && b & c"), vec!["a ", "", " b ", " c"]);
        assert_eq!(level(&Command::shell("cargo build 2>&1")), level(&Command::shell("cargo build")));
    }

    #[test]
    fn test_critical_variants() {
        assert_eq!(level(&Command::shell("sudo rm -fr /*")), RiskLevel::Critical);
        assert_eq!(level(&Command::shell("rm --no-preserve-root -r x")), RiskLevel::Critical);
        assert_eq!(level(&Command::shell("mkfs.ext4 /dev/sdb1")), RiskLevel::Critical);
        assert_eq!(level(&Command::shell("dd if=img of=/dev/sda")), RiskLevel::Critical);
        assert_eq!(level(&Command::shell("chmod -R 777 /")), RiskLevel::Critical);
        assert_eq!(level(&Command::shell("echo bye; shutdown -h now")), RiskLevel::Critical);
        assert_eq!(level(&Command::file_delete("/")), RiskLevel::Critical);
    }

    #[test]
    fn test_high_levels() {
        assert_eq!(level(&Command::shell("sudo apt update")), RiskLevel::High);
        assert_eq!(level(&Command::shell("rm -rf build/")), RiskLevel::High);
        assert_eq!(level(&Command::shell("cp conf /etc/app.conf")), RiskLevel::High);

        let kill = Command::new(CommandKind::ProcessControl, "kill -9 4242").with_args(["KILL", "4242"]);
        assert_eq!(level(&kill), RiskLevel::High);

        let chmod = Command::new(CommandKind::PermissionChange, "chmod 666 f")
            .with_target("f")
            .with_args(["666"]);
        assert_eq!(level(&chmod), RiskLevel::High);
    }

    #[test]
    fn test_structured_kinds() {
        assert_eq!(level(&Command::file_move("a.txt", "Documents/")), RiskLevel::Low);
        assert_eq!(level(&Command::file_delete("b.tmp")), RiskLevel::Medium);

        let chmod = Command::new(CommandKind::PermissionChange, "chmod 644 f")
            .with_target("f")
            .with_args(["644"]);
        assert_eq!(level(&chmod), RiskLevel::Medium);

        let read = Command::new(CommandKind::ReadFile, "cat ~/.ssh/id_rsa").with_target("~/.ssh/id_rsa");
        assert_eq!(level(&read), RiskLevel::Medium);
    }

    #[test]
    fn test_read_only_shell_is_low() {
        assert_eq!(level(&Command::shell("ls -la | grep foo")), RiskLevel::Low);
        assert_eq!(level(&Command::shell("echo hi > out.txt")), RiskLevel::Medium);
    }

    #[test]
    fn test_unclassified_defaults_to_medium() {
        let assessment = RiskAssessor::new().assess(&Command::shell("make install-local"));
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert_eq!(assessment.rule, "unclassified");
        assert!(!assessment.blocking);
    }

    #[test]
    fn test_warnings_accumulate() {
        let assessment = RiskAssessor::new().assess(&Command::shell("curl -o ~/.ssh/key http://x"));
        assert!(assessment.warnings.iter().any(|w| w.contains("network")));
        assert!(assessment.warnings.iter().any(|w| w.contains("sensitive")));
    }

    #[test]
    fn test_assessment_is_pure() {
        let commands = [
            Command::shell("rm -rf /"),
            Command::shell("sudo apt install vim"),
            Command::file_move("a", "b"),
            Command::shell("weird ';' \"unterminated"),
        ];
        let assessor = RiskAssessor::new();
        for cmd in &commands {
            assert_eq!(assessor.assess(cmd), assessor.assess(cmd));
            assert_eq!(assessor.assess(cmd), RiskAssessor::new().assess(&cmd.clone()));
        }
    }
}
