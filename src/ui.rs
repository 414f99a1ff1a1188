//! Terminal rendering of operation progress and plans.

use std::time::Duration;

use console::{style, Emoji};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;

use crate::errors::Result;
use crate::model::{OperationKey, ProgressState};
use crate::ops::Operator;
use crate::plan::{OperationPhase, OperationPlan, PhaseState};

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");

/// Renders the operation's progress feed as a single progress bar.
pub struct OperationUI {
    bar: ProgressBar,
}

impl OperationUI {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .expect("static template")
                .progress_chars("█▓▒░"),
        );
        bar.set_prefix("Install");
        Self { bar }
    }

    pub fn observe(&self, completion: u8, message: &str) {
        self.bar.set_position(completion as u64);
        self.bar.set_message(message.to_string());
    }

    pub fn finish(&self, state: ProgressState, message: &str) {
        match state {
            ProgressState::Completed => self.bar.finish_with_message(format!("{CHECK}{message}")),
            ProgressState::Failed => self.bar.abandon_with_message(format!("{CROSS}{message}")),
            ProgressState::InProgress => self.bar.finish_with_message(message.to_string()),
        }
    }
}

impl Default for OperationUI {
    fn default() -> Self {
        Self::new()
    }
}

/// Follow the operation's progress feed until it reaches a terminal entry.
pub async fn poll_progress(
    operator: &Operator,
    key: &OperationKey,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ProgressState> {
    let ui = OperationUI::new();
    let mut last_sequence = 0i64;
    loop {
        if let Some(entry) = operator.last_progress_entry(key).await? {
            if entry.sequence != last_sequence {
                last_sequence = entry.sequence;
                ui.observe(entry.completion, &entry.message);
            }
            if entry.state.is_terminal() {
                ui.finish(entry.state, &entry.message);
                return Ok(entry.state);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = shutdown.changed() => return Ok(ProgressState::InProgress),
        }
    }
}

fn state_glyph(state: PhaseState) -> console::StyledObject<&'static str> {
    match state {
        PhaseState::Unstarted => style("·").dim(),
        PhaseState::InProgress => style("→").cyan(),
        PhaseState::Completed => style("✔").green(),
        PhaseState::Failed => style("✘").red(),
        PhaseState::RolledBack => style("↩").yellow(),
    }
}

fn print_phase(phase: &OperationPhase, depth: usize) {
    let indent = "  ".repeat(depth);
    let description = phase.description.as_deref().unwrap_or("");
    println!(
        "{indent}{} {} {}",
        state_glyph(phase.effective_state()),
        style(&phase.id).bold(),
        style(description).dim()
    );
    if let Some(error) = &phase.error {
        println!("{indent}    {}", style(error).red());
    }
    for child in &phase.phases {
        print_phase(child, depth + 1);
    }
}

/// Print the plan tree with per-phase states.
pub fn print_plan(plan: &OperationPlan) {
    println!(
        "{} {} ({} operation, {} phases)",
        style("Plan for").bold(),
        style(&plan.cluster_name).cyan(),
        plan.operation_type,
        plan.leaves().len()
    );
    for phase in &plan.phases {
        print_phase(phase, 1);
    }
}

/// The joiner's fatal message when the elected installer disappears.
pub fn print_installer_exited(installer_ip: &str) {
    eprintln!(
        "{}",
        style(format!("Installer agent at {installer_ip} has exited.")).red().bold()
    );
}
