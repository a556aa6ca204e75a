use crate::error::GuardError;
use crate::executor::orchestrator::{
    ConfirmationAnswer, ConfirmationHandler, ConfirmationRequest, FailureContext, FailureDecision,
};
use crate::executor::planner::Step;
use crate::executor::risk::RiskLevel;
use async_trait::async_trait;
use colored::*;
use dialoguer::{Confirm, Select};

/// 위험도별 색상
pub fn colored_level(level: RiskLevel) -> ColoredString {
    match level {
        RiskLevel::Low => "Low".green(),
        RiskLevel::Medium => "Medium".yellow(),
        RiskLevel::High => "High".red().bold(),
        RiskLevel::Critical => "Critical".on_red().white().bold(),
    }
}

const ANSWERS: [(&str, ConfirmationAnswer); 6] = [
    ("Yes, run this step", ConfirmationAnswer::Approved),
    ("No, skip this step", ConfirmationAnswer::Denied),
    ("Always for this kind of step in this plan", ConfirmationAnswer::Always),
    ("Never for this kind of step in this plan", ConfirmationAnswer::Never),
    ("Decide later (suspend the plan)", ConfirmationAnswer::Deferred),
    ("Abort the plan and roll back", ConfirmationAnswer::Abort),
];

/// 터미널 확인 프롬프트
///
/// eval 등으로 stdout이 소비될 수 있으므로 모든 출력은 stderr로 보냅니다.
/// `assume_yes`는 High 미만 단계만 자동 승인하고, 실패 시에는 Abort를 선택합니다.
pub struct ConsoleConfirmer {
    assume_yes: bool,
}

impl ConsoleConfirmer {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }

    /// 자동 응답 (프롬프트 없이 결정할 수 있으면 Some)
    pub fn automatic_answer(&self, level: RiskLevel) -> Option<ConfirmationAnswer> {
        (self.assume_yes && level < RiskLevel::High).then_some(ConfirmationAnswer::Approved)
    }

    fn print_request(request: &ConfirmationRequest<'_>) {
        let step = request.step;
        let assessment = request.assessment;

        eprintln!(
            "\n{} {} {}",
            "[>]".cyan().bold(),
            format!("Step {}:", step.id.index + 1).bold(),
            step.description
        );
        let command = match assessment.level {
            RiskLevel::Low => step.command.raw_text().green(),
            RiskLevel::Medium => step.command.raw_text().yellow(),
            _ => step.command.raw_text().red().bold(),
        };
        eprintln!("  {}", command);
        eprintln!(
            "{} {} ({})",
            "Risk level:".bold(),
            colored_level(assessment.level),
            assessment.rule.dimmed()
        );
        for warning in &assessment.warnings {
            eprintln!("  {} {}", "[!]".yellow(), warning);
        }
        if let Some(preview) = &request.preview {
            eprintln!("{} {}", "Preview:".bold(), preview.dimmed());
        }
    }
}

impl Default for ConsoleConfirmer {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl ConfirmationHandler for ConsoleConfirmer {
    async fn confirm(&self, request: &ConfirmationRequest<'_>) -> ConfirmationAnswer {
        Self::print_request(request);
        if let Some(answer) = self.automatic_answer(request.assessment.level) {
            eprintln!("{}", "Approved (--yes)".dimmed());
            return answer;
        }

        let choice = tokio::task::spawn_blocking(|| {
            let labels: Vec<&str> = ANSWERS.iter().map(|(label, _)| *label).collect();
            Select::new()
                .with_prompt("Execute this step?")
                .items(&labels)
                .default(1)
                .interact_opt()
                .ok()
                .flatten()
        })
        .await
        .ok()
        .flatten();

        // 터미널이 없거나 ESC면 건너뜀
        choice
            .and_then(|index| ANSWERS.get(index))
            .map(|(_, answer)| *answer)
            .unwrap_or(ConfirmationAnswer::Denied)
    }

    async fn on_failure(&self, failure: &FailureContext) -> FailureDecision {
        eprintln!(
            "\n{} Step {} failed after {} attempt(s): {}",
            "[x]".red().bold(),
            failure.step.index + 1,
            failure.attempts,
            failure.error
        );
        eprintln!("  {} {}", "Next:".bold(), failure.next_action);
        if self.assume_yes {
            return FailureDecision::Abort;
        }

        let mut options = Vec::new();
        if failure.retry_allowed {
            options.push(("Retry", FailureDecision::Retry));
        }
        options.push(("Skip this step", FailureDecision::Skip));
        options.push(("Abort the plan and roll back", FailureDecision::Abort));

        let labels: Vec<&'static str> = options.iter().map(|(label, _)| *label).collect();
        let default = labels.len() - 1;
        let choice = tokio::task::spawn_blocking(move || {
            Select::new()
                .with_prompt("How should the plan continue?")
                .items(&labels)
                .default(default)
                .interact_opt()
                .ok()
                .flatten()
        })
        .await
        .ok()
        .flatten();

        choice
            .and_then(|index| options.get(index))
            .map(|(_, decision)| *decision)
            .unwrap_or(FailureDecision::Abort)
    }

    async fn on_snapshot_failure(&self, step: &Step, error: &GuardError) -> bool {
        eprintln!(
            "\n{} Could not snapshot step {}: {}",
            "[!!!]".red().bold(),
            step.id.index + 1,
            error
        );
        if self.assume_yes {
            return false;
        }
        tokio::task::spawn_blocking(|| {
            Confirm::new()
                .with_prompt("Run it anyway? It cannot be undone")
                .default(false)
                .interact()
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assume_yes_stops_at_high() {
        let confirmer = ConsoleConfirmer::new(true);
        assert_eq!(
            confirmer.automatic_answer(RiskLevel::Medium),
            Some(ConfirmationAnswer::Approved)
        );
        assert_eq!(confirmer.automatic_answer(RiskLevel::High), None);
        assert_eq!(ConsoleConfirmer::default().automatic_answer(RiskLevel::Low), None);
    }

    #[test]
    fn test_answer_table_covers_every_answer() {
        for answer in [
            ConfirmationAnswer::Approved,
            ConfirmationAnswer::Denied,
            ConfirmationAnswer::Deferred,
            ConfirmationAnswer::Always,
            ConfirmationAnswer::Never,
            ConfirmationAnswer::Abort,
        ] {
            assert!(ANSWERS.iter().any(|(_, a)| *a == answer));
        }
    }
}
