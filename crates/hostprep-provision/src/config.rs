//! Configuration types for host provisioning

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::DEFAULT_TIMEOUT;

/// POSIX-portable account names, as `useradd` accepts them by default on Debian
static USER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));

/// Olson identifiers such as `UTC`, `Europe/Paris`, `America/Argentina/Buenos_Aires`
static TIMEZONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_+\-]*(/[A-Za-z0-9_+\-]+)*$").expect("valid regex")
});

/// Debian package names
static PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.\-]+$").expect("valid regex"));

/// Packages installed by default
pub const DEFAULT_PACKAGES: &[&str] = &[
    "sudo",
    "curl",
    "wget",
    "git",
    "vim",
    "htop",
    "ufw",
    "fail2ban",
    "unattended-upgrades",
    "apt-listchanges",
    "ca-certificates",
    "gnupg",
];

/// Default minimum password length for new accounts
pub const DEFAULT_MIN_PASSWORD_LENGTH: usize = 12;

/// What the orchestrator does after a step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop at the first failure and abort every remaining step
    #[default]
    FailFast,
    /// Keep going; only dependents of a failed step are skipped
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FailFast => "fail-fast",
            Self::BestEffort => "best-effort",
        })
    }
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" => Ok(Self::FailFast),
            "best-effort" => Ok(Self::BestEffort),
            other => Err(ConfigError::FailurePolicy(other.to_string())),
        }
    }
}

/// Transport protocol of a firewall rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(ConfigError::FirewallRule(s.to_string())),
        }
    }
}

/// An inbound allow rule (`port/proto`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FirewallRule {
    pub port: u16,
    pub protocol: Protocol,
}

impl FirewallRule {
    /// Allow TCP traffic to `port`
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for FirewallRule {
    type Err = ConfigError;

    /// Parses `443`, `443/tcp` or `51820/udp`; a bare port means TCP
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::FirewallRule(s.to_string()))?;
        if port == 0 {
            return Err(ConfigError::FirewallRule(s.to_string()));
        }
        Ok(Self { port, protocol })
    }
}

/// Invalid provisioning configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid admin user name {0:?} (expected lowercase letters, digits, '-' or '_')")]
    UserName(String),

    #[error("admin user must not be root")]
    RootAdmin,

    #[error("invalid SSH port {0}")]
    SshPort(u16),

    #[error("invalid timezone identifier {0:?}")]
    Timezone(String),

    #[error("invalid package name {0:?}")]
    Package(String),

    #[error("package list is empty")]
    NoPackages,

    #[error("package list must include {0:?}")]
    RequiredPackage(&'static str),

    #[error("invalid firewall rule {0:?} (expected PORT or PORT/tcp|udp)")]
    FirewallRule(String),

    #[error("invalid failure policy {0:?} (expected fail-fast or best-effort)")]
    FailurePolicy(String),

    #[error("invalid SSH public key {0:?}")]
    SshKey(String),

    #[error("minimum password length must be at least 8, got {0}")]
    MinPasswordLength(usize),

    #[error("command timeout must be positive")]
    Timeout,
}

/// Whether the SSH daemon accepts password logins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordAuth {
    /// Disabled when authorized keys are configured, enabled otherwise
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// Immutable configuration for one provisioning run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// Administrative account to create or verify
    pub admin_user: String,
    /// Authorized SSH public keys for the admin account
    pub ssh_keys: Vec<String>,
    /// Target timezone
    pub timezone: String,
    /// Port sshd listens on, shared with the firewall step
    pub ssh_port: u16,
    /// systemd unit of the SSH daemon
    pub ssh_service: String,
    /// SSH password authentication policy
    pub password_auth: PasswordAuth,
    /// Extra inbound allow rules beyond SSH
    pub allow_rules: Vec<FirewallRule>,
    /// Reset all firewall rules before applying ours
    pub firewall_reset: bool,
    /// fail2ban: failures before a ban
    pub ban_max_retry: u32,
    /// fail2ban: ban duration in seconds
    pub ban_time_secs: u64,
    /// Packages that must be installed
    pub packages: Vec<String>,
    /// Package index older than this is refreshed
    pub index_max_age: Duration,
    /// Minimum length of a new account password
    pub min_password_length: usize,
    /// Orchestrator failure policy
    pub policy: FailurePolicy,
    /// Report only, change nothing
    pub dry_run: bool,
    /// Per-command timeout
    pub timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            admin_user: "admin".into(),
            ssh_keys: vec![],
            timezone: "UTC".into(),
            ssh_port: 22,
            ssh_service: "ssh".into(),
            password_auth: PasswordAuth::Auto,
            allow_rules: vec![],
            firewall_reset: false,
            ban_max_retry: 3,
            ban_time_secs: 3600,
            packages: DEFAULT_PACKAGES.iter().map(|p| (*p).to_string()).collect(),
            index_max_age: Duration::from_secs(3600),
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            policy: FailurePolicy::FailFast,
            dry_run: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ProvisionConfig {
    /// Create a new config builder
    pub fn builder() -> ProvisionConfigBuilder {
        ProvisionConfigBuilder::default()
    }

    /// Whether sshd should accept passwords
    pub fn password_auth_enabled(&self) -> bool {
        match self.password_auth {
            PasswordAuth::Auto => self.ssh_keys.is_empty(),
            PasswordAuth::Enabled => true,
            PasswordAuth::Disabled => false,
        }
    }

    /// All inbound rules the firewall must allow, SSH first, deduplicated
    pub fn firewall_rules(&self) -> Vec<FirewallRule> {
        let mut rules = vec![FirewallRule::tcp(self.ssh_port)];
        for rule in &self.allow_rules {
            if !rules.contains(rule) {
                rules.push(*rule);
            }
        }
        rules
    }

    /// Check every field, reporting the first problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_user == "root" {
            return Err(ConfigError::RootAdmin);
        }
        if !USER_NAME.is_match(&self.admin_user) {
            return Err(ConfigError::UserName(self.admin_user.clone()));
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::SshPort(self.ssh_port));
        }
        if !TIMEZONE.is_match(&self.timezone) || self.timezone.contains("..") {
            return Err(ConfigError::Timezone(self.timezone.clone()));
        }
        if self.packages.is_empty() {
            return Err(ConfigError::NoPackages);
        }
        if let Some(bad) = self.packages.iter().find(|p| !PACKAGE.is_match(p)) {
            return Err(ConfigError::Package(bad.clone()));
        }
        // Later steps depend on these being present
        for required in ["sudo", "ufw", "fail2ban", "unattended-upgrades"] {
            if !self.packages.iter().any(|p| p == required) {
                return Err(ConfigError::RequiredPackage(required));
            }
        }
        if let Some(bad) = self.allow_rules.iter().find(|r| r.port == 0) {
            return Err(ConfigError::FirewallRule(bad.to_string()));
        }
        if let Some(bad) = self.ssh_keys.iter().find(|k| !looks_like_public_key(k)) {
            return Err(ConfigError::SshKey(bad.clone()));
        }
        if self.min_password_length < 8 {
            return Err(ConfigError::MinPasswordLength(self.min_password_length));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Timeout);
        }
        Ok(())
    }
}

/// `<type> <base64> [comment]` on a single line
fn looks_like_public_key(key: &str) -> bool {
    let mut parts = key.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();
    !key.contains('\n')
        && (kind.starts_with("ssh-") || kind.starts_with("ecdsa-") || kind.starts_with("sk-"))
        && body.len() >= 16
}

/// Builder for `ProvisionConfig`
#[derive(Debug, Clone, Default)]
pub struct ProvisionConfigBuilder {
    config: ProvisionConfig,
}

impl ProvisionConfigBuilder {
    /// Set the admin account name
    pub fn admin_user(mut self, user: impl Into<String>) -> Self {
        self.config.admin_user = user.into();
        self
    }

    /// Set authorized SSH keys
    pub fn ssh_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.ssh_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the target timezone
    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.config.timezone = tz.into();
        self
    }

    /// Set the SSH port
    pub fn ssh_port(mut self, port: u16) -> Self {
        self.config.ssh_port = port;
        self
    }

    /// Set the SSH daemon unit name
    pub fn ssh_service(mut self, service: impl Into<String>) -> Self {
        self.config.ssh_service = service.into();
        self
    }

    /// Set the password authentication policy
    pub fn password_auth(mut self, policy: PasswordAuth) -> Self {
        self.config.password_auth = policy;
        self
    }

    /// Set extra firewall allow rules
    pub fn allow_rules(mut self, rules: impl IntoIterator<Item = FirewallRule>) -> Self {
        self.config.allow_rules = rules.into_iter().collect();
        self
    }

    /// Reset the firewall before applying rules
    pub fn firewall_reset(mut self, reset: bool) -> Self {
        self.config.firewall_reset = reset;
        self
    }

    /// Set fail2ban retry limit and ban duration
    pub fn ban(mut self, max_retry: u32, ban_time_secs: u64) -> Self {
        self.config.ban_max_retry = max_retry;
        self.config.ban_time_secs = ban_time_secs;
        self
    }

    /// Replace the package set
    pub fn packages(mut self, packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    /// Add packages to the default set
    pub fn extra_packages(mut self, packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for pkg in packages {
            let pkg = pkg.into();
            if !self.config.packages.contains(&pkg) {
                self.config.packages.push(pkg);
            }
        }
        self
    }

    /// Set the maximum package index age
    pub fn index_max_age(mut self, age: Duration) -> Self {
        self.config.index_max_age = age;
        self
    }

    /// Set the minimum password length
    pub fn min_password_length(mut self, len: usize) -> Self {
        self.config.min_password_length = len;
        self
    }

    /// Set the failure policy
    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Enable or disable dry-run mode
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    /// Set the per-command timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ProvisionConfig {
        self.config
    }

    /// Build and validate the configuration
    pub fn try_build(self) -> Result<ProvisionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
