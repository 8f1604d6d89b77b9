//! Hostprep - Fresh Debian Server Provisioning
//!
//! Brings a newly installed Debian host to a hardened baseline in a single
//! idempotent run: package updates, timezone, an admin account, SSH policy,
//! UFW, fail2ban and unattended upgrades.

mod output;
mod settings;
mod signal;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use hostprep_provision::{
    FailurePolicy, FirewallRule, Orchestrator, ProvisionConfig, RunReport, RunSettings,
    SecretPrompt, SecretValue, StateProbe, StopSignal, SystemRunner, TerminalSource, plan,
};
use tracing_subscriber::EnvFilter;

use output::{CHECK, FOLDER, GEAR, Progress, ROCKET};
use settings::{config_path, load_config, resolve};

/// Exit status when the run could not start (config, plan, privileges, OS)
const EXIT_PREFLIGHT: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "hostprep",
    version,
    about = "Provision a fresh Debian server in one idempotent run"
)]
pub struct Args {
    /// Show what would change without changing anything
    #[arg(long)]
    dry_run: bool,

    /// What to do when a step fails (fail-fast, best-effort)
    #[arg(long, env = "HOSTPREP_ON_FAILURE")]
    on_failure: Option<FailurePolicy>,

    /// Target timezone (e.g., Europe/Paris)
    #[arg(long, env = "HOSTPREP_TIMEZONE")]
    timezone: Option<String>,

    /// SSH port, also opened in the firewall
    #[arg(long, env = "HOSTPREP_SSH_PORT")]
    ssh_port: Option<u16>,

    /// Administrative account to create
    #[arg(long, env = "HOSTPREP_ADMIN_USER")]
    admin_user: Option<String>,

    /// Authorized SSH public key for the admin account (repeatable)
    #[arg(long = "ssh-key", env = "HOSTPREP_SSH_KEY", action = ArgAction::Append)]
    ssh_keys: Vec<String>,

    /// Extra inbound port to allow, as PORT or PORT/PROTO (repeatable)
    #[arg(long = "allow-port", action = ArgAction::Append)]
    allow_ports: Vec<FirewallRule>,

    /// Per-command timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Minimum length of the admin password
    #[arg(long)]
    min_password_length: Option<usize>,

    /// Write the run report as JSON to this file
    #[arg(long)]
    report_file: Option<PathBuf>,

    /// Print the step plan and exit
    #[arg(long)]
    plan: bool,

    /// Print current host facts and exit
    #[arg(long)]
    facts: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show config file path and exit
    #[arg(long)]
    show_config: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::from(EXIT_PREFLIGHT)
        }
    }
}

/// Errors returned here happen before any step runs
fn run(args: &Args) -> Result<ExitCode> {
    // Show config path and exit
    if args.show_config {
        let path = args.config.clone().unwrap_or_else(config_path);
        println!("{FOLDER} Config: {}", path.display());
        if path.exists() {
            println!("  {CHECK} exists");
        } else {
            println!("  {} not found (will use defaults)", style("!").yellow());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let file_config = load_config(args.config.as_deref())?;
    let config = resolve(args, &file_config).context("Invalid configuration")?;
    tracing::debug!(?config, "configuration resolved");

    let runner = SystemRunner::new();
    let probe = StateProbe::new(&runner, config.timeout);

    if args.facts {
        require_root(&probe)?;
        let facts = probe.facts(&config).context("Failed to collect host facts")?;
        output::print_facts_table(&facts);
        return Ok(ExitCode::SUCCESS);
    }

    if args.plan {
        let registry = plan::debian_plan(&config, None).context("Invalid plan")?;
        output::print_plan_table(&registry);
        return Ok(ExitCode::SUCCESS);
    }

    output::print_banner();
    output::print_config_table(&config);

    preflight(&probe, &config)?;

    if !args.yes && !config.dry_run {
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Provision this host now?")
            .default(false)
            .interact()?;
        if !proceed {
            println!("Aborted.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let password = admin_password(&probe, &config)?;
    let registry = plan::debian_plan(&config, password).context("Invalid plan")?;

    let stop = StopSignal::new();
    signal::forward_ctrl_c(stop.clone())?;

    println!("\n{ROCKET} Provisioning ({} steps)\n", registry.len());
    let progress = Progress::new();
    let report = Orchestrator::new(registry, &runner, RunSettings::from_config(&config))
        .with_stop_signal(stop)
        .with_observer(&progress)
        .run();
    progress.finish();

    output::print_report(&report);

    if let Some(path) = &args.report_file {
        if let Err(e) = write_report(&report, path) {
            eprintln!("{} {e:#}", style("error:").red().bold());
            return Ok(ExitCode::FAILURE);
        }
        println!("{FOLDER} Report written to {}", path.display());
    }

    Ok(ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1)))
}

/// Host checks that must pass before anything is changed
fn preflight(probe: &StateProbe<'_>, config: &ProvisionConfig) -> Result<()> {
    println!("\n{GEAR} Checking host...");

    let os = probe.os_release().context("Failed to read /etc/os-release")?;
    if !os.is_debian_family() {
        bail!(
            "Unsupported OS '{}' (Debian or a derivative required)",
            os.pretty_name.as_deref().unwrap_or(&os.id)
        );
    }
    println!(
        "  {CHECK} {}",
        os.pretty_name.as_deref().unwrap_or(&os.id)
    );

    require_root(probe)?;
    println!("  {CHECK} running as root");

    Ok(())
}

/// Probes read root-only state (firewall rules, private files), so dry runs
/// and fact collection need root too
fn require_root(probe: &StateProbe<'_>) -> Result<()> {
    let uid = probe
        .effective_uid()
        .context("Failed to determine effective user")?;
    if uid != 0 {
        bail!("Must run as root (uid {uid}); only --plan and --show-config work without it");
    }
    Ok(())
}

/// Prompt for the admin password when the account has to be created, or
/// when a key-less account has no usable password.
///
/// Dry runs never change the account, so they never prompt.
fn admin_password(probe: &StateProbe<'_>, config: &ProvisionConfig) -> Result<Option<SecretValue>> {
    if config.dry_run {
        return Ok(None);
    }
    let user = &config.admin_user;
    let exists = probe.user_exists(user).context("Failed to look up admin user")?;
    if exists {
        let usable = probe
            .password_usable(user)
            .context("Failed to read admin password status")?;
        if !config.ssh_keys.is_empty() || usable {
            tracing::info!(%user, "admin user exists, no password needed");
            return Ok(None);
        }
        tracing::warn!(%user, "admin user has no usable password and no SSH keys");
    }

    let prompt = if exists { "Set a password for user" } else { "Set a password for new user" };
    println!(
        "\n{} {prompt} {}",
        style("▸").blue().bold(),
        style(user).cyan()
    );
    let password = SecretPrompt::new(TerminalSource, user)
        .collect(config.min_password_length)
        .context("Password entry cancelled")?;
    Ok(Some(password))
}

/// Write the report as pretty JSON, atomically
fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    writeln!(file, "{json}").context("Failed to write report")?;
    file.persist(path)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    Ok(())
}
