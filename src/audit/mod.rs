//! Append-only audit trail.
//!
//! Every state transition of a plan, step, undo or commit becomes one
//! [`AuditEntry`] in `<data_dir>/audit.jsonl`. Entries are chained: each
//! carries the SHA-256 of its predecessor (`prev_hash`) and its own `hash`,
//! so [`verify_chain`] detects edits, reordering and truncation in the middle
//! of the file.
//!
//! Writing never blocks execution. A flush runs on the blocking pool under an
//! exclusive file lock with a bounded wait; if the sink is unavailable the
//! entries stay buffered, a warning is logged, and the next write retries.

use crate::backup::sha256_hex;
use crate::config::Config;
use crate::error::{GuardError, Result};
use crate::executor::risk::RiskLevel;
use crate::fsutil::FileLock;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// 페이로드 최대 길이 (마스킹 후)
const MAX_PAYLOAD_CHARS: usize = 2048;
/// 체인 이어쓰기 시 읽는 파일 끝 영역 크기
const TAIL_WINDOW: u64 = 64 * 1024;
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    PlanStarted,
    PlanSuspended,
    PlanCompleted,
    PlanAborted,
    ValidationPassed,
    ValidationFailed,
    RiskAssessed,
    ConfirmationRequested,
    ConfirmationAnswered,
    SnapshotCaptured,
    SnapshotFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetried,
    StepSkipped,
    StepAborted,
    UndoApplied,
    UndoFailed,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub session_id: String,
    pub plan_id: Option<Uuid>,
    pub step: Option<usize>,
    pub kind: AuditKind,
    pub risk_level: Option<RiskLevel>,
    pub outcome: String,
    pub redacted_payload: String,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// `hash` 필드를 비운 상태의 직렬화 값에 대한 SHA-256
    pub fn compute_hash(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.hash = String::new();
        let bytes = serde_json::to_vec(&unsigned).unwrap_or_default();
        sha256_hex(&bytes)
    }
}

/// 기록 요청. 순번과 해시는 기록 시점에 채워집니다.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub plan_id: Option<Uuid>,
    pub step: Option<usize>,
    pub risk_level: Option<RiskLevel>,
    pub outcome: String,
    pub payload: String,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, outcome: impl Into<String>) -> Self {
        Self {
            kind,
            plan_id: None,
            step: None,
            risk_level: None,
            outcome: outcome.into(),
            payload: String::new(),
        }
    }

    pub fn plan(mut self, plan: Uuid) -> Self {
        self.plan_id = Some(plan);
        self
    }

    pub fn step(mut self, plan: Uuid, index: usize) -> Self {
        self.plan_id = Some(plan);
        self.step = Some(index);
        self
    }

    pub fn risk(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// 설정된 정규식에 걸리는 비밀값을 가림
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    GuardError::ConfigError(format!("invalid redact pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for pattern in &self.patterns {
            redacted = pattern.replace_all(&redacted, "[REDACTED]").into_owned();
        }
        if redacted.chars().count() > MAX_PAYLOAD_CHARS {
            redacted = redacted.chars().take(MAX_PAYLOAD_CHARS).collect::<String>() + "...";
        }
        redacted
    }
}

pub struct AuditLogger {
    path: PathBuf,
    session_id: String,
    actor: String,
    redactor: Redactor,
    flush_timeout: Duration,
    /// 아직 파일에 쓰지 못한 항목. 잠금은 꺼내고 되돌릴 때만 잡음
    pending: Arc<Mutex<Vec<AuditEntry>>>,
    /// 한 번에 하나의 플러시만 파일에 씀 (블로킹 풀에서만 잡음)
    writer: Arc<Mutex<()>>,
    feed: broadcast::Sender<AuditEntry>,
}

impl AuditLogger {
    pub fn new(
        path: PathBuf,
        session_id: impl Into<String>,
        actor: impl Into<String>,
        redactor: Redactor,
        flush_timeout: Duration,
    ) -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            path,
            session_id: session_id.into(),
            actor: actor.into(),
            redactor,
            flush_timeout,
            pending: Arc::new(Mutex::new(Vec::new())),
            writer: Arc::new(Mutex::new(())),
            feed,
        }
    }

    pub fn from_config(config: &Config, session_id: &str) -> Result<Self> {
        let actor = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self::new(
            config.audit_log_path(),
            session_id,
            actor,
            Redactor::new(&config.redact_patterns)?,
            Duration::from_millis(config.audit_flush_timeout_ms),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 기록된 항목 구독
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.feed.subscribe()
    }

    /// 버퍼에 남아 있는 항목 수
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// 항목을 추가하고 플러시 시도. 실패해도 실행을 막지 않음
    pub async fn record(&self, event: AuditEvent) {
        let entry = AuditEntry {
            seq: 0,
            timestamp: Utc::now(),
            actor: self.actor.clone(),
            session_id: self.session_id.clone(),
            plan_id: event.plan_id,
            step: event.step,
            kind: event.kind,
            risk_level: event.risk_level,
            outcome: self.redactor.redact(&event.outcome),
            redacted_payload: self.redactor.redact(&event.payload),
            prev_hash: String::new(),
            hash: String::new(),
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(entry);
        }

        if let Err(e) = self.flush().await {
            warn!(error = %e, pending = self.pending(), "audit sink unavailable, entries buffered");
        }
    }

    /// 버퍼를 파일에 기록. 제한 시간을 넘기면 에러, 쓰지 못한 항목은 버퍼로 돌아감
    pub async fn flush(&self) -> Result<usize> {
        let sink = Sink {
            path: self.path.clone(),
            pending: self.pending.clone(),
            writer: self.writer.clone(),
            feed: self.feed.clone(),
            lock_wait: self.flush_timeout,
        };
        let task = tokio::task::spawn_blocking(move || sink.write_pending());

        match tokio::time::timeout(self.flush_timeout, task).await {
            Ok(Ok(Ok(written))) => Ok(written),
            Ok(Ok(Err(e))) => Err(GuardError::Audit(e.to_string())),
            Ok(Err(e)) => Err(GuardError::Audit(e.to_string())),
            Err(_) => Err(GuardError::Audit(format!(
                "flush exceeded {}ms",
                self.flush_timeout.as_millis()
            ))),
        }
    }
}

/// 블로킹 풀에서 쓰는 데 필요한 것들
struct Sink {
    path: PathBuf,
    pending: Arc<Mutex<Vec<AuditEntry>>>,
    writer: Arc<Mutex<()>>,
    feed: broadcast::Sender<AuditEntry>,
    lock_wait: Duration,
}

impl Sink {
    /// 잠금 아래에서 꼬리의 해시를 이어받아 버퍼 전체를 기록.
    /// 버퍼는 I/O 전에 꺼내므로 `record`는 파일 잠금을 기다리지 않음
    fn write_pending(&self) -> std::io::Result<usize> {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("audit writer poisoned"))?;
        let drafts = self.take()?;
        if drafts.is_empty() {
            return Ok(0);
        }

        match append_chained(&self.path, &drafts, self.lock_wait) {
            Ok(chained) => {
                debug!(count = chained.len(), "audit entries flushed");
                let written = chained.len();
                for entry in chained {
                    let _ = self.feed.send(entry);
                }
                Ok(written)
            }
            Err(e) => {
                self.restore(drafts);
                Err(e)
            }
        }
    }

    fn take(&self) -> std::io::Result<Vec<AuditEntry>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| std::io::Error::other("audit buffer poisoned"))?;
        Ok(std::mem::take(&mut *pending))
    }

    /// 쓰지 못한 항목을 그 사이 추가된 항목 앞에 되돌림
    fn restore(&self, mut drafts: Vec<AuditEntry>) {
        if let Ok(mut pending) = self.pending.lock() {
            drafts.append(&mut pending);
            *pending = drafts;
        }
    }
}

fn append_chained(
    path: &Path,
    drafts: &[AuditEntry],
    lock_wait: Duration,
) -> std::io::Result<Vec<AuditEntry>> {
    let lock_path = path.with_extension("lock");
    let _lock = FileLock::acquire_within(&lock_path, lock_wait)?;

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let (mut seq, mut prev_hash) = read_tail(&mut file)?;

    let mut buf = Vec::new();
    let mut chained = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let mut entry = draft.clone();
        seq += 1;
        entry.seq = seq;
        entry.prev_hash = prev_hash;
        entry.hash = entry.compute_hash();
        prev_hash = entry.hash.clone();

        serde_json::to_writer(&mut buf, &entry)?;
        buf.push(b'\n');
        chained.push(entry);
    }
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(chained)
}

/// 마지막 항목의 (seq, hash). 빈 파일이면 genesis
fn read_tail(file: &mut File) -> std::io::Result<(u64, String)> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok((0, GENESIS_HASH.to_string()));
    }
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    let text = String::from_utf8_lossy(&tail);
    let Some(last) = text.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok((0, GENESIS_HASH.to_string()));
    };
    match serde_json::from_str::<AuditEntry>(last) {
        Ok(entry) => Ok((entry.seq, entry.hash)),
        // 손상된 꼬리: 그 줄의 해시에 이어 붙이고 verify_chain이 단절을 보고
        Err(_) => Ok((0, sha256_hex(last.as_bytes()))),
    }
}

/// 체인 검증 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entries: usize,
    /// 처음 단절이 발견된 줄 번호 (1부터)
    pub first_break: Option<usize>,
    pub reason: Option<String>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

pub fn verify_chain(path: &Path) -> Result<ChainReport> {
    if !path.exists() {
        return Ok(ChainReport {
            entries: 0,
            first_break: None,
            reason: None,
        });
    }
    let content = fs::read_to_string(path)?;

    let mut prev_hash = GENESIS_HASH.to_string();
    let mut prev_seq = 0;
    let mut entries = 0;
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let broken = |reason: String| ChainReport {
            entries,
            first_break: Some(index + 1),
            reason: Some(reason),
        };
        let entry: AuditEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => return Ok(broken(format!("unparseable entry: {}", e))),
        };
        if entry.prev_hash != prev_hash {
            return Ok(broken("prev_hash does not match previous entry".to_string()));
        }
        if entry.compute_hash() != entry.hash {
            return Ok(broken("entry content does not match its hash".to_string()));
        }
        if entry.seq != prev_seq + 1 {
            return Ok(broken(format!(
                "sequence jumps from {} to {}",
                prev_seq, entry.seq
            )));
        }
        prev_hash = entry.hash;
        prev_seq = entry.seq;
        entries += 1;
    }

    Ok(ChainReport {
        entries,
        first_break: None,
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(path: PathBuf) -> AuditLogger {
        let redactor = Redactor::new(&Config::default().redact_patterns).unwrap();
        AuditLogger::new(path, "s1", "tester", redactor, Duration::from_secs(2))
    }

    #[test]
    fn test_redaction() {
        let redactor = Redactor::new(&Config::default().redact_patterns).unwrap();
        let text = redactor.redact("curl -H 'Authorization: Bearer abc.def' --token=hunter2 x");
        assert!(!text.contains("abc.def"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("[REDACTED]"));
        assert_eq!(redactor.redact("ls -la"), "ls -la");
    }

    #[tokio::test]
    async fn test_entries_are_chained_and_verifiable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit = logger(path.clone());
        let mut feed = audit.subscribe();

        let plan = Uuid::new_v4();
        audit
            .record(AuditEvent::new(AuditKind::PlanStarted, "2 steps").plan(plan))
            .await;
        audit
            .record(
                AuditEvent::new(AuditKind::RiskAssessed, "recursive-delete")
                    .step(plan, 0)
                    .risk(RiskLevel::High)
                    .payload("rm -rf build password=s3cret"),
            )
            .await;

        let first = feed.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        let second = feed.recv().await.unwrap();
        assert_eq!(second.prev_hash, first.hash);
        assert!(!second.redacted_payload.contains("s3cret"));

        let report = verify_chain(&path).unwrap();
        assert!(report.is_intact());
        assert_eq!(report.entries, 2);

        // 다른 로거가 같은 파일에 이어 써도 체인 유지
        let other = logger(path.clone());
        other
            .record(AuditEvent::new(AuditKind::Committed, "ok"))
            .await;
        assert_eq!(verify_chain(&path).unwrap().entries, 3);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit = logger(path.clone());
        for outcome in ["one", "two", "three"] {
            audit
                .record(AuditEvent::new(AuditKind::StepCompleted, outcome))
                .await;
        }

        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replacen("\"two\"", "\"TWO\"", 1)).unwrap();

        let report = verify_chain(&path).unwrap();
        assert_eq!(report.first_break, Some(2));
        assert_eq!(report.entries, 1);
    }

    #[tokio::test]
    async fn test_unavailable_sink_buffers_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("logs");
        // 디렉토리 자리에 파일이 있으면 열기 실패
        fs::write(&blocker, b"not a dir").unwrap();
        let path = blocker.join("audit.jsonl");
        let audit = logger(path.clone());

        audit
            .record(AuditEvent::new(AuditKind::StepStarted, "first"))
            .await;
        assert_eq!(audit.pending(), 1);

        fs::remove_file(&blocker).unwrap();
        fs::create_dir(&blocker).unwrap();
        audit
            .record(AuditEvent::new(AuditKind::StepCompleted, "second"))
            .await;

        assert_eq!(audit.pending(), 0);
        let report = verify_chain(&path).unwrap();
        assert_eq!(report.entries, 2);
        assert!(report.is_intact());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_held_log_lock_does_not_stall_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let redactor = Redactor::new(&Config::default().redact_patterns).unwrap();
        let audit = AuditLogger::new(
            path.clone(),
            "s1",
            "tester",
            redactor,
            Duration::from_millis(200),
        );

        // 다른 프로세스가 로그를 잡고 있는 상황
        let held = FileLock::acquire(&path.with_extension("lock")).unwrap();
        let recorded = tokio::time::timeout(Duration::from_secs(5), async {
            for outcome in ["one", "two", "three"] {
                audit
                    .record(AuditEvent::new(AuditKind::StepCompleted, outcome))
                    .await;
            }
        })
        .await;
        assert!(recorded.is_ok());

        // 제한 시간이 지난 쓰기 작업이 항목을 버퍼로 되돌릴 때까지 기다림
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(audit.pending(), 3);
        assert_eq!(verify_chain(&path).unwrap().entries, 0);

        drop(held);
        assert_eq!(audit.flush().await.unwrap(), 3);
        assert_eq!(audit.pending(), 0);

        let report = verify_chain(&path).unwrap();
        assert!(report.is_intact());
        assert_eq!(report.entries, 3);
        let content = fs::read_to_string(&path).unwrap();
        let one = content.find("\"one\"").unwrap();
        let three = content.find("\"three\"").unwrap();
        assert!(one < three);
    }
}
