//! Read-only host state queries
//!
//! Every answer is re-derived from the live host. Probes never run in dry-run
//! mode, and a result that cannot be interpreted is reported as
//! [`ProbeError`] rather than `false`.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{FirewallRule, Protocol, ProvisionConfig};
use crate::runner::{CommandError, CommandOutput, CommandRunner, Invocation, RunOptions};

/// `dpkg-query -f=${Status}` output, e.g. `install ok installed`
static DPKG_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+) (\S+) (\S+)$").expect("valid regex"));

/// One `ufw status` rule line, e.g. `22/tcp  ALLOW IN  Anywhere (v6)`
static UFW_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(?::\d+)?(?:/(tcp|udp))?(\s+\(v6\))?\s+(ALLOW|DENY|REJECT|LIMIT)(?:\s+IN)?\s")
        .expect("valid regex")
});

/// `sha256sum` output line
static SHA256_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{64})\s").expect("valid regex"));

/// State could not be determined
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The inspection command failed in an unexpected way
    #[error("{probe}: {source}")]
    Command {
        probe: &'static str,
        #[source]
        source: CommandError,
    },

    /// The inspection command produced output we do not understand
    #[error("{probe}: unexpected output {output:?}")]
    Parse { probe: &'static str, output: String },
}

impl ProbeError {
    fn parse(probe: &'static str, output: impl Into<String>) -> Self {
        Self::Parse {
            probe,
            output: output.into(),
        }
    }
}

/// A firewall rule as listed by `ufw status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedRule {
    pub port: u16,
    /// `None` when the rule covers both protocols
    pub protocol: Option<Protocol>,
    pub action: String,
    pub v6: bool,
}

/// When the apt index was last refreshed by an `update-index` step
pub const APT_UPDATE_STAMP: &str = "/var/lib/hostprep/apt-update-stamp";

/// Parsed `ufw status verbose`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallStatus {
    pub active: bool,
    /// Default incoming policy (`deny`, `allow`, `reject`); only listed when active
    pub default_incoming: Option<String>,
    /// Default outgoing policy
    pub default_outgoing: Option<String>,
    pub rules: Vec<ListedRule>,
}

impl FirewallStatus {
    /// Active, denying incoming and allowing outgoing traffic by default
    pub fn default_deny_incoming(&self) -> bool {
        self.active
            && self.default_incoming.as_deref() == Some("deny")
            && self.default_outgoing.as_deref() == Some("allow")
    }

    /// Whether an active allow rule covers `port/protocol`
    pub fn allows(&self, port: u16, protocol: Protocol) -> bool {
        self.active
            && self.rules.iter().any(|r| {
                r.port == port
                    && r.action == "ALLOW"
                    && r.protocol.is_none_or(|p| p == protocol)
            })
    }
}

/// Parsed `/etc/os-release`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
    pub pretty_name: Option<String>,
}

impl OsRelease {
    /// Debian or a Debian derivative
    pub fn is_debian_family(&self) -> bool {
        self.id == "debian" || self.id_like.iter().any(|id| id == "debian")
    }
}

/// A point-in-time snapshot of host state, for display only.
///
/// Steps never read from it; their checks always re-query the host.
#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    pub collected_at: DateTime<Utc>,
    pub os: OsRelease,
    pub admin_user: String,
    pub admin_user_exists: bool,
    /// Configured packages and whether each is installed
    pub packages: BTreeMap<String, bool>,
    /// Services of interest and whether each is active
    pub services: BTreeMap<String, bool>,
    pub timezone: String,
    /// `None` when ufw is not installed yet
    pub firewall: Option<FirewallStatus>,
}

impl HostFacts {
    /// Configured packages that are not installed
    pub fn missing_packages(&self) -> Vec<&str> {
        self.packages
            .iter()
            .filter(|(_, installed)| !**installed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Issues read-only inspection commands through a [`CommandRunner`]
#[derive(Clone, Copy)]
pub struct StateProbe<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> StateProbe<'a> {
    /// Create a probe over `runner`
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Probes inspect the real host even during a dry run
    fn query(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        self.runner.run(invocation, &RunOptions::live(self.timeout))
    }

    /// Run a query where some non-zero exit codes are meaningful answers
    fn query_codes(
        &self,
        probe: &'static str,
        invocation: &Invocation,
        accepted: &[i32],
    ) -> Result<(i32, String), ProbeError> {
        match self.query(invocation) {
            Ok(out) => Ok((0, out.stdout)),
            Err(CommandError::NonZeroExit { code, stdout, .. }) if accepted.contains(&code) => {
                Ok((code, stdout))
            }
            Err(source) => Err(ProbeError::Command { probe, source }),
        }
    }

    /// Run an arbitrary read-only check; only the exit status matters
    pub fn check_command(&self, invocation: &Invocation) -> Result<(), CommandError> {
        self.query(invocation).map(|_| ())
    }

    /// Whether the account exists
    pub fn user_exists(&self, name: &str) -> Result<bool, ProbeError> {
        const PROBE: &str = "user_exists";
        let inv = Invocation::new("getent").args(["passwd", name]);
        // getent exits 2 when the key is not found
        match self.query_codes(PROBE, &inv, &[2])? {
            (2, _) => Ok(false),
            (_, out) => {
                let prefix = format!("{name}:");
                if out.lines().any(|l| l.starts_with(&prefix)) {
                    Ok(true)
                } else {
                    Err(ProbeError::parse(PROBE, out))
                }
            }
        }
    }

    /// Whether the account is a member of `group`
    pub fn user_in_group(&self, name: &str, group: &str) -> Result<bool, ProbeError> {
        const PROBE: &str = "user_in_group";
        let inv = Invocation::new("id").args(["-nG", name]);
        // id exits 1 for an unknown user
        match self.query_codes(PROBE, &inv, &[1])? {
            (1, _) => Ok(false),
            (_, out) => {
                let groups: Vec<&str> = out.split_whitespace().collect();
                if groups.is_empty() {
                    return Err(ProbeError::parse(PROBE, out));
                }
                Ok(groups.contains(&group))
            }
        }
    }

    /// Whether the package is fully installed
    pub fn package_installed(&self, name: &str) -> Result<bool, ProbeError> {
        const PROBE: &str = "package_installed";
        let inv = Invocation::new("dpkg-query").args(["-W", "-f=${Status}", name]);
        // dpkg-query exits 1 when no package matches
        match self.query_codes(PROBE, &inv, &[1])? {
            (1, _) => Ok(false),
            (_, out) => parse_dpkg_status(&out).ok_or_else(|| ProbeError::parse(PROBE, out)),
        }
    }

    /// Whether the unit is currently running
    pub fn service_active(&self, name: &str) -> Result<bool, ProbeError> {
        const PROBE: &str = "service_active";
        let inv = Invocation::new("systemctl").args(["is-active", name]);
        let (_, out) = self.query_codes(PROBE, &inv, &[1, 2, 3, 4])?;
        match out.trim() {
            "active" | "reloading" => Ok(true),
            "inactive" | "failed" | "activating" | "deactivating" | "unknown" => Ok(false),
            _ => Err(ProbeError::parse(PROBE, out)),
        }
    }

    /// Whether the unit starts at boot
    pub fn service_enabled(&self, name: &str) -> Result<bool, ProbeError> {
        const PROBE: &str = "service_enabled";
        let inv = Invocation::new("systemctl").args(["is-enabled", name]);
        let (_, out) = self.query_codes(PROBE, &inv, &[1, 4])?;
        match out.trim() {
            "enabled" | "enabled-runtime" | "alias" => Ok(true),
            "disabled" | "masked" | "masked-runtime" | "static" | "indirect" | "generated"
            | "transient" | "linked" | "linked-runtime" | "not-found" => Ok(false),
            _ => Err(ProbeError::parse(PROBE, out)),
        }
    }

    /// The configured system timezone
    pub fn timezone(&self) -> Result<String, ProbeError> {
        const PROBE: &str = "timezone";
        let inv = Invocation::new("timedatectl").args(["show", "--property=Timezone", "--value"]);
        let out = self
            .query(&inv)
            .map_err(|source| ProbeError::Command { probe: PROBE, source })?;
        let tz = out.stdout.trim();
        if tz.is_empty() || tz.contains(char::is_whitespace) {
            return Err(ProbeError::parse(PROBE, out.stdout));
        }
        Ok(tz.to_string())
    }

    /// Whether the system timezone is `tz`
    pub fn timezone_is(&self, tz: &str) -> Result<bool, ProbeError> {
        Ok(self.timezone()? == tz)
    }

    /// Parsed `ufw status verbose`
    pub fn firewall_status(&self) -> Result<FirewallStatus, ProbeError> {
        const PROBE: &str = "firewall_status";
        let out = self
            .query(&Invocation::new("ufw").args(["status", "verbose"]))
            .map_err(|source| ProbeError::Command { probe: PROBE, source })?;
        parse_ufw_status(&out.stdout).ok_or_else(|| ProbeError::parse(PROBE, out.stdout))
    }

    /// Whether the firewall is enabled
    pub fn firewall_active(&self) -> Result<bool, ProbeError> {
        Ok(self.firewall_status()?.active)
    }

    /// Whether an active allow rule exists for `port/protocol`
    pub fn firewall_rule_exists(&self, port: u16, protocol: Protocol) -> Result<bool, ProbeError> {
        Ok(self.firewall_status()?.allows(port, protocol))
    }

    /// Whether the file at `path` has exactly `content`
    pub fn file_matches(&self, path: &str, content: &str) -> Result<bool, ProbeError> {
        const PROBE: &str = "file_matches";
        let inv = Invocation::new("sha256sum").arg(path);
        match self.query(&inv) {
            Ok(out) => {
                let actual = SHA256_LINE
                    .captures(out.stdout.trim_start())
                    .map(|c| c[1].to_string())
                    .ok_or_else(|| ProbeError::parse(PROBE, out.stdout.clone()))?;
                Ok(actual == content_hash(content))
            }
            Err(CommandError::NonZeroExit { stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(false)
            }
            Err(source) => Err(ProbeError::Command { probe: PROBE, source }),
        }
    }

    /// Whether the account has a usable password (`passwd -S` status `P`)
    pub fn password_usable(&self, name: &str) -> Result<bool, ProbeError> {
        const PROBE: &str = "password_usable";
        let out = self
            .query(&Invocation::new("passwd").args(["-S", name]))
            .map_err(|source| ProbeError::Command { probe: PROBE, source })?;
        // NAME STATUS DATE MIN MAX WARN INACTIVE; STATUS is P, L or NP
        let mut fields = out.stdout.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(user), Some(status)) if user == name => Ok(status == "P"),
            _ => Err(ProbeError::parse(PROBE, out.stdout)),
        }
    }

    /// Time since the last successful index refresh, `None` if there never was one.
    ///
    /// Read from [`APT_UPDATE_STAMP`]: `apt-get update` leaves the list
    /// files untouched when every repository answers "Hit", so their mtimes
    /// say nothing about when the index was last checked.
    pub fn package_index_age(&self) -> Result<Option<Duration>, ProbeError> {
        const PROBE: &str = "package_index_age";
        let inv = Invocation::new("stat").args(["-c", "%Y", APT_UPDATE_STAMP]);
        // stat exits 1 for a missing file
        let out = match self.query_codes(PROBE, &inv, &[1])? {
            (1, _) => return Ok(None),
            (_, out) => out,
        };
        let mtime: i64 = out
            .trim()
            .parse()
            .map_err(|_| ProbeError::parse(PROBE, out.clone()))?;
        let age = Utc::now().timestamp().saturating_sub(mtime).max(0);
        Ok(Some(Duration::from_secs(age.unsigned_abs())))
    }

    /// Packages with a pending upgrade
    pub fn upgradable_packages(&self) -> Result<Vec<String>, ProbeError> {
        const PROBE: &str = "upgradable_packages";
        let inv = Invocation::new("apt").args(["list", "--upgradable"]);
        let out = self
            .query(&inv)
            .map_err(|source| ProbeError::Command { probe: PROBE, source })?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| l.contains("[upgradable from"))
            .filter_map(|l| l.split('/').next())
            .map(str::to_string)
            .collect())
    }

    /// Downloaded `.deb` archives still in the apt cache
    pub fn cached_archives(&self) -> Result<Vec<String>, ProbeError> {
        const PROBE: &str = "cached_archives";
        let inv = Invocation::new("find").args([
            "/var/cache/apt/archives",
            "-maxdepth",
            "1",
            "-name",
            "*.deb",
        ]);
        let out = self
            .query(&inv)
            .map_err(|source| ProbeError::Command { probe: PROBE, source })?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Parsed `/etc/os-release`
    pub fn os_release(&self) -> Result<OsRelease, ProbeError> {
        const PROBE: &str = "os_release";
        let out = self
            .query(&Invocation::new("cat").arg("/etc/os-release"))
            .map_err(|source| ProbeError::Command { probe: PROBE, source })?;
        parse_os_release(&out.stdout).ok_or_else(|| ProbeError::parse(PROBE, out.stdout))
    }

    /// Effective uid of this process, as the host reports it
    pub fn effective_uid(&self) -> Result<u32, ProbeError> {
        const PROBE: &str = "effective_uid";
        let out = self
            .query(&Invocation::new("id").arg("-u"))
            .map_err(|source| ProbeError::Command { probe: PROBE, source })?;
        out.stdout
            .trim()
            .parse()
            .map_err(|_| ProbeError::parse(PROBE, out.stdout))
    }

    /// Collect a [`HostFacts`] snapshot for the given configuration
    pub fn facts(&self, config: &ProvisionConfig) -> Result<HostFacts, ProbeError> {
        let mut packages = BTreeMap::new();
        for pkg in &config.packages {
            packages.insert(pkg.clone(), self.package_installed(pkg)?);
        }

        let mut services = BTreeMap::new();
        for svc in [
            config.ssh_service.as_str(),
            "fail2ban",
            "unattended-upgrades",
        ] {
            services.insert(svc.to_string(), self.service_active(svc)?);
        }

        let firewall = match self.firewall_status() {
            Ok(status) => Some(status),
            Err(ProbeError::Command {
                source: CommandError::Execution { .. },
                ..
            }) => None,
            Err(e) => return Err(e),
        };

        Ok(HostFacts {
            collected_at: Utc::now(),
            os: self.os_release()?,
            admin_user: config.admin_user.clone(),
            admin_user_exists: self.user_exists(&config.admin_user)?,
            packages,
            services,
            timezone: self.timezone()?,
            firewall,
        })
    }

    /// Whether the firewall is active, denies incoming traffic by default and
    /// allows every rule in `rules`
    pub fn firewall_enforces(&self, rules: &[FirewallRule]) -> Result<bool, ProbeError> {
        let status = self.firewall_status()?;
        Ok(status.default_deny_incoming()
            && rules.iter().all(|r| status.allows(r.port, r.protocol)))
    }
}

/// SHA-256 of `content`, hex-encoded (matches `sha256sum`)
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_dpkg_status(out: &str) -> Option<bool> {
    let caps = DPKG_STATUS.captures(out.trim())?;
    Some(&caps[1] == "install" && &caps[3] == "installed")
}

fn parse_ufw_status(out: &str) -> Option<FirewallStatus> {
    let mut active = None;
    let mut default_incoming = None;
    let mut default_outgoing = None;
    let mut rules = vec![];

    for line in out.lines() {
        let line = line.trim();
        if let Some(status) = line.strip_prefix("Status:") {
            active = match status.trim() {
                "active" => Some(true),
                "inactive" => Some(false),
                _ => return None,
            };
            continue;
        }
        // Default: deny (incoming), allow (outgoing), disabled (routed)
        if let Some(defaults) = line.strip_prefix("Default:") {
            for part in defaults.split(',') {
                let Some((policy, direction)) = part.trim().split_once(' ') else {
                    return None;
                };
                match direction {
                    "(incoming)" => default_incoming = Some(policy.to_string()),
                    "(outgoing)" => default_outgoing = Some(policy.to_string()),
                    _ => {}
                }
            }
            continue;
        }
        if let Some(caps) = UFW_RULE.captures(line) {
            let port = caps[1].parse().ok()?;
            let protocol = caps.get(2).and_then(|p| p.as_str().parse().ok());
            rules.push(ListedRule {
                port,
                protocol,
                action: caps[4].to_string(),
                v6: caps.get(3).is_some(),
            });
        }
    }

    active.map(|active| FirewallStatus {
        active,
        default_incoming,
        default_outgoing,
        rules,
    })
}

fn parse_os_release(out: &str) -> Option<OsRelease> {
    let mut fields = BTreeMap::new();
    for line in out.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        fields.insert(key.trim(), value.to_string());
    }

    Some(OsRelease {
        id: fields.remove("ID")?,
        id_like: fields
            .remove("ID_LIKE")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        version_id: fields.remove("VERSION_ID"),
        pretty_name: fields.remove("PRETTY_NAME"),
    })
}
