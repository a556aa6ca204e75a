use crate::executor::orchestrator::{PlanEvent, PlanReport};
use crate::executor::planner::{PlanState, StepState};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// 스피너 스타일 (되돌리기, 커밋 등 단일 작업)
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(TICKS)
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// 계획 진행률 표시. PlanEvent 스트림으로 갱신됩니다.
pub struct PlanProgress {
    bar: ProgressBar,
}

impl PlanProgress {
    pub fn new(total: usize, title: &str) -> Self {
        Self::with_bar(ProgressBar::new(total as u64), title)
    }

    /// 화면에 그리지 않는 진행률 (테스트, 비대화형 출력)
    pub fn hidden(total: usize) -> Self {
        Self::with_bar(ProgressBar::hidden(), "").resized(total)
    }

    fn with_bar(bar: ProgressBar, title: &str) -> Self {
        if let Ok(style) = ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {{msg}}",
                title
            ))
            .map(|s| s.tick_strings(TICKS).progress_chars("█▓▒░ "))
        {
            bar.set_style(style);
        }
        Self { bar }
    }

    fn resized(self, total: usize) -> Self {
        self.bar.set_length(total as u64);
        self
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn handle(&self, event: &PlanEvent) {
        match event {
            PlanEvent::StepState {
                step,
                state,
                description,
                detail,
            } => {
                let label = format!("{}. {}", step.index + 1, description);
                match state {
                    StepState::Executing => {
                        self.bar.enable_steady_tick(Duration::from_millis(80));
                        self.bar.set_message(label);
                    }
                    StepState::AwaitingConfirmation => {
                        self.bar.disable_steady_tick();
                        self.bar.set_message(format!(
                            "{} {}",
                            label,
                            "(awaiting confirmation)".yellow()
                        ));
                    }
                    StepState::Completed => {
                        self.bar.println(format!("  {} {}", "✓".green(), label));
                        self.bar.inc(1);
                    }
                    StepState::Skipped => {
                        let reason = detail.as_deref().unwrap_or("");
                        self.bar.println(format!(
                            "  {} {} {}",
                            "-".yellow(),
                            label,
                            reason.dimmed()
                        ));
                        self.bar.inc(1);
                    }
                    StepState::Failed => {
                        self.bar.disable_steady_tick();
                        let reason = detail.as_deref().unwrap_or("");
                        self.bar
                            .println(format!("  {} {} {}", "✗".red(), label, reason.dimmed()));
                    }
                    StepState::Aborted => {
                        self.bar
                            .println(format!("  {} {}", "⊘".red(), label.dimmed()));
                    }
                    StepState::Pending => {}
                }
            }
            PlanEvent::PlanState { state, .. } => {
                if *state == PlanState::AwaitingConfirmation {
                    self.bar.disable_steady_tick();
                }
            }
        }
    }

    /// 전체 완료
    pub fn finish(&self, report: &PlanReport) {
        self.bar.finish_with_message(summary(report));
    }
}

/// 계획 결과 한 줄 요약
fn summary(report: &PlanReport) -> String {
    match report.state {
        PlanState::Completed => format!(
            "{} completed ({} succeeded, {} skipped)",
            "✓".green().bold(),
            report.count(StepState::Completed).to_string().green(),
            report.count(StepState::Skipped).to_string().yellow()
        ),
        PlanState::Aborted => {
            let undone = report.rollback.as_ref().map(|r| r.undone.len()).unwrap_or(0);
            format!(
                "{} aborted ({} rolled back)",
                "✗".red().bold(),
                undone.to_string().yellow()
            )
        }
        _ => format!("{} awaiting confirmation", "…".yellow()),
    }
}

/// 이벤트 수신 루프. 채널이 닫히면 종료됩니다.
pub fn spawn_renderer(
    mut events: broadcast::Receiver<PlanEvent>,
    progress: std::sync::Arc<PlanProgress>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => progress.handle(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::orchestrator::RollbackReport;
    use crate::executor::planner::StepId;
    use uuid::Uuid;

    fn event(index: usize, state: StepState) -> PlanEvent {
        PlanEvent::StepState {
            step: StepId {
                plan: Uuid::nil(),
                index,
            },
            state,
            description: format!("step {}", index),
            detail: None,
        }
    }

    #[test]
    fn test_create_spinner() {
        let spinner = create_spinner("Testing...");
        assert!(!spinner.is_finished());
        spinner.finish_and_clear();
    }

    #[test]
    fn test_progress_counts_finished_steps() {
        let progress = PlanProgress::hidden(3);
        progress.handle(&event(0, StepState::Executing));
        progress.handle(&event(0, StepState::Completed));
        progress.handle(&event(1, StepState::AwaitingConfirmation));
        progress.handle(&event(1, StepState::Skipped));
        progress.handle(&event(2, StepState::Failed));
        assert_eq!(progress.position(), 2);
    }

    #[test]
    fn test_summary_is_plain_english() {
        colored::control::set_override(false);
        let report = PlanReport {
            plan: Uuid::nil(),
            state: PlanState::Aborted,
            steps: Vec::new(),
            rollback: Some(RollbackReport {
                undone: vec![StepId {
                    plan: Uuid::nil(),
                    index: 0,
                }],
                error: None,
            }),
            total_duration_ms: 0,
        };
        assert_eq!(summary(&report), "✗ aborted (1 rolled back)");

        let report = PlanReport {
            state: PlanState::Completed,
            rollback: None,
            ..report
        };
        assert_eq!(summary(&report), "✓ completed (0 succeeded, 0 skipped)");
    }

    #[tokio::test]
    async fn test_renderer_stops_when_channel_closes() {
        let (tx, rx) = broadcast::channel(8);
        let progress = std::sync::Arc::new(PlanProgress::hidden(1));
        let handle = spawn_renderer(rx, progress.clone());

        tx.send(event(0, StepState::Completed)).unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(progress.position(), 1);
    }
}
