//! Terminal presentation: banner, tables, progress

use std::time::Duration;

use comfy_table::{Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use console::{Emoji, style};
use hostprep_provision::{
    HostFacts, Outcome, ProvisionConfig, RunObserver, RunReport, RunStatus, SkipReason, Step,
    StepRegistry, StepResult,
};
use indicatif::{ProgressBar, ProgressStyle};

pub static LOOKING_GLASS: Emoji<'_, '_> = Emoji("🔍 ", "");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

pub fn print_banner() {
    println!();
    println!(
        "{}",
        style("╔═══════════════════════════════════════╗")
            .cyan()
            .bold()
    );
    println!(
        "{}",
        style("║         HOSTPREP PROVISIONING         ║")
            .cyan()
            .bold()
    );
    println!(
        "{}",
        style("╚═══════════════════════════════════════╝")
            .cyan()
            .bold()
    );
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(
        header
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

pub fn print_config_table(cfg: &ProvisionConfig) {
    println!("\n{} Configuration\n", style("▸").blue().bold());

    let mut table = new_table(&["Setting", "Value"]);
    let rules: Vec<String> = cfg.firewall_rules().iter().map(ToString::to_string).collect();

    table.add_row(vec!["Admin user", &cfg.admin_user]);
    table.add_row(vec!["SSH keys", &cfg.ssh_keys.len().to_string()]);
    table.add_row(vec!["Timezone", &cfg.timezone]);
    table.add_row(vec!["SSH port", &cfg.ssh_port.to_string()]);
    table.add_row(vec![
        "Password auth",
        yes_no(cfg.password_auth_enabled()),
    ]);
    table.add_row(vec!["Firewall", &rules.join(", ")]);
    table.add_row(vec![
        "fail2ban",
        &format!(
            "{} retries, {}s ban",
            cfg.ban_max_retry, cfg.ban_time_secs
        ),
    ]);
    table.add_row(vec!["Packages", &cfg.packages.join(" ")]);
    table.add_row(vec!["On failure", &cfg.policy.to_string()]);
    table.add_row(vec!["Dry run", yes_no(cfg.dry_run)]);

    println!("{table}");
}

/// Steps in execution order with their dependencies and commands
pub fn print_plan_table(registry: &StepRegistry) {
    println!("\n{LOOKING_GLASS} Plan ({} steps)\n", registry.len());

    let mut table = new_table(&["#", "Step", "After", "Commands"]);
    for (i, step) in registry.steps().iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(step.name()).fg(Color::Cyan),
            Cell::new(step.depends_on().join(", ")),
            Cell::new(step.planned_actions().join("\n")),
        ]);
    }
    println!("{table}");
}

pub fn print_facts_table(facts: &HostFacts) {
    println!("\n{LOOKING_GLASS} Host facts\n");

    let mut table = new_table(&["Fact", "Value"]);
    table.add_row(vec![
        "OS".to_string(),
        facts
            .os
            .pretty_name
            .clone()
            .unwrap_or_else(|| facts.os.id.clone()),
    ]);
    table.add_row(vec!["Timezone".to_string(), facts.timezone.clone()]);
    table.add_row(vec![
        format!("User {}", facts.admin_user),
        if facts.admin_user_exists { "present" } else { "missing" }.to_string(),
    ]);
    let missing = facts.missing_packages();
    table.add_row(vec![
        "Missing packages".to_string(),
        if missing.is_empty() {
            "none".to_string()
        } else {
            missing.join(" ")
        },
    ]);
    for (service, active) in &facts.services {
        table.add_row(vec![
            format!("Service {service}"),
            if *active { "active" } else { "inactive" }.to_string(),
        ]);
    }
    let firewall = match &facts.firewall {
        None => "not installed".to_string(),
        Some(status) if status.active => format!("active, {} rules", status.rules.len()),
        Some(_) => "inactive".to_string(),
    };
    table.add_row(vec!["Firewall".to_string(), firewall]);

    println!("{table}");
}

fn outcome_cell(outcome: Outcome) -> Cell {
    let cell = Cell::new(outcome);
    match outcome {
        Outcome::Applied => cell.fg(Color::Green),
        Outcome::Skipped(SkipReason::AlreadySatisfied) => cell,
        Outcome::Skipped(SkipReason::DryRun) => cell.fg(Color::Cyan),
        Outcome::Skipped(SkipReason::Blocked) => cell.fg(Color::Yellow),
        Outcome::Failed | Outcome::Aborted => cell.fg(Color::Red),
    }
}

pub fn print_report(report: &RunReport) {
    println!("\n{} Summary\n", style("▸").blue().bold());

    let mut table = new_table(&["Step", "Outcome", "Detail"]);
    for result in &report.results {
        let detail: String = result.detail.lines().take(3).collect::<Vec<_>>().join("\n");
        table.add_row(vec![
            Cell::new(&result.step_name),
            outcome_cell(result.outcome),
            Cell::new(detail),
        ]);
    }
    println!("{table}");

    let counts = report.counts();
    println!(
        "\n  {} applied, {} ok, {} would apply, {} blocked, {} failed, {} aborted",
        counts.applied,
        counts.already_satisfied,
        counts.dry_run,
        counts.blocked,
        counts.failed,
        counts.aborted,
    );

    match report.status {
        RunStatus::AllApplied if report.dry_run => {
            println!("\n{} Dry run - no changes made", style("i").cyan());
        }
        RunStatus::AllApplied => println!("\n{SPARKLE} Host provisioned!"),
        RunStatus::PartialFailure => println!("\n{CROSS} Completed with failures"),
        RunStatus::Aborted => println!("\n{CROSS} Aborted"),
    }
}

/// Spinner while a step runs, one line per finished step
pub struct Progress {
    spinner: ProgressBar,
}

impl Progress {
    pub fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            spinner.set_style(template);
        }
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self { spinner }
    }

    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl RunObserver for Progress {
    fn step_started(&self, index: usize, total: usize, step: &dyn Step) {
        self.spinner
            .set_message(format!("[{}/{total}] {}", index + 1, step.description()));
    }

    fn step_finished(&self, index: usize, total: usize, result: &StepResult) {
        let mark = match result.outcome {
            Outcome::Applied | Outcome::Skipped(SkipReason::AlreadySatisfied) => {
                CHECK.to_string()
            }
            Outcome::Skipped(_) => format!("{} ", style("-").dim()),
            Outcome::Failed | Outcome::Aborted => CROSS.to_string(),
        };
        self.spinner.println(format!(
            "{mark}[{}/{total}] {} {}",
            index + 1,
            result.step_name,
            style(result.outcome).dim()
        ));
    }
}
