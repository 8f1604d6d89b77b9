//! Configuration file and setting resolution
//!
//! Priority: CLI args > env vars > config file > defaults. Environment
//! variables are read by clap, so by the time [`resolve`] runs an `Option`
//! in [`Args`] already reflects both of the first two layers.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hostprep_provision::{
    ConfigError, FailurePolicy, FirewallRule, PasswordAuth, ProvisionConfig,
};
use serde::{Deserialize, Serialize};

use crate::Args;

/// Configuration file structure
/// Path: ~/.config/hostprep/config.toml (XDG-style)
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    pub user: Option<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    pub min_password_length: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub timezone: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SshConfig {
    pub port: Option<u16>,
    pub service: Option<String>,
    pub password_auth: Option<PasswordAuth>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Extra allow rules, e.g. `["80/tcp", "443"]`
    #[serde(default)]
    pub allow: Vec<String>,
    pub reset: Option<bool>,
    pub ban_max_retry: Option<u32>,
    pub ban_time_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PackagesConfig {
    /// Replaces the default package set
    pub install: Option<Vec<String>>,
    /// Added to the package set
    #[serde(default)]
    pub extra: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub on_failure: Option<FailurePolicy>,
    pub timeout_secs: Option<u64>,
    pub index_max_age_secs: Option<u64>,
}

/// Config path - always ~/.config/hostprep/config.toml (even on macOS)
pub fn config_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hostprep")
        .join("config.toml")
}

/// Load the config file, or defaults when it does not exist
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    } else {
        Ok(FileConfig::default())
    }
}

/// Merge CLI/env and file settings into a validated [`ProvisionConfig`]
pub fn resolve(args: &Args, file: &FileConfig) -> Result<ProvisionConfig, ConfigError> {
    let mut builder = ProvisionConfig::builder().dry_run(args.dry_run);

    if let Some(user) = args.admin_user.clone().or_else(|| file.admin.user.clone()) {
        builder = builder.admin_user(user);
    }
    if let Some(tz) = args.timezone.clone().or_else(|| file.system.timezone.clone()) {
        builder = builder.timezone(tz);
    }
    if let Some(port) = args.ssh_port.or(file.ssh.port) {
        builder = builder.ssh_port(port);
    }
    if let Some(service) = file.ssh.service.clone() {
        builder = builder.ssh_service(service);
    }
    if let Some(policy) = file.ssh.password_auth {
        builder = builder.password_auth(policy);
    }

    let keys = if args.ssh_keys.is_empty() {
        file.admin.ssh_keys.clone()
    } else {
        args.ssh_keys.clone()
    };
    builder = builder.ssh_keys(keys);

    let rules = if args.allow_ports.is_empty() {
        file.firewall
            .allow
            .iter()
            .map(|r| r.parse())
            .collect::<Result<Vec<FirewallRule>, _>>()?
    } else {
        args.allow_ports.clone()
    };
    builder = builder.allow_rules(rules);

    if let Some(reset) = file.firewall.reset {
        builder = builder.firewall_reset(reset);
    }
    let defaults = ProvisionConfig::default();
    builder = builder.ban(
        file.firewall.ban_max_retry.unwrap_or(defaults.ban_max_retry),
        file.firewall.ban_time_secs.unwrap_or(defaults.ban_time_secs),
    );

    if let Some(packages) = file.packages.install.clone() {
        builder = builder.packages(packages);
    }
    builder = builder.extra_packages(file.packages.extra.clone());

    if let Some(len) = args
        .min_password_length
        .or(file.admin.min_password_length)
    {
        builder = builder.min_password_length(len);
    }
    if let Some(policy) = args.on_failure.or(file.run.on_failure) {
        builder = builder.policy(policy);
    }
    if let Some(secs) = args.timeout.or(file.run.timeout_secs) {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = file.run.index_max_age_secs {
        builder = builder.index_max_age(Duration::from_secs(secs));
    }

    builder.try_build()
}
