//! In-memory Debian host for tests
//!
//! [`SimHost`] implements [`CommandRunner`] by interpreting the commands the
//! probes and steps issue against a small model of host state, and records
//! every call it receives.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::probe::content_hash;
use crate::runner::{CommandError, CommandOutput, CommandRunner, Invocation, RunOptions};

const OS_RELEASE: &str = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n\
NAME=\"Debian GNU/Linux\"\n\
VERSION_ID=\"12\"\n\
VERSION=\"12 (bookworm)\"\n\
VERSION_CODENAME=bookworm\n\
ID=debian\n";

/// Packages that ship a systemd unit of the same name
const SERVICE_PACKAGES: &[(&str, &str)] = &[
    ("openssh-server", "ssh"),
    ("fail2ban", "fail2ban"),
    ("unattended-upgrades", "unattended-upgrades"),
];

#[derive(Debug, Clone, Copy)]
struct Service {
    enabled: bool,
    active: bool,
}

#[derive(Debug, Default)]
struct User {
    groups: Vec<String>,
    password: Option<String>,
}

#[derive(Debug)]
struct Firewall {
    active: bool,
    incoming: String,
    outgoing: String,
    rules: Vec<String>,
}

/// ufw as installed: inactive, deny incoming, allow outgoing
impl Default for Firewall {
    fn default() -> Self {
        Self {
            active: false,
            incoming: "deny".into(),
            outgoing: "allow".into(),
            rules: vec![],
        }
    }
}

#[derive(Debug)]
struct Call {
    line: String,
    mutating: bool,
}

/// Failure from the simulated command: exit code, stdout, stderr
type Exit = (i32, String, String);

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<String, User>,
    packages: BTreeSet<String>,
    unavailable: BTreeSet<String>,
    services: BTreeMap<String, Service>,
    timezone: String,
    files: BTreeMap<String, String>,
    /// Modification times of `files`, Unix seconds
    mtimes: BTreeMap<String, i64>,
    firewall: Firewall,
    upgradable: Vec<String>,
    archives: Vec<String>,
    removed_binaries: BTreeSet<String>,
    failures: Vec<(String, i32)>,
    hangs: Vec<String>,
    ignored: Vec<String>,
    stdout_overrides: BTreeMap<String, String>,
    calls: Vec<Call>,
}

/// A simulated Debian 12 host
#[derive(Debug)]
pub(crate) struct SimHost {
    state: Mutex<State>,
}

impl SimHost {
    /// Minimal Debian install: root, openssh running, apt index never
    /// refreshed by us, two pending upgrades, one cached archive
    pub fn fresh_debian() -> Self {
        let mut state = State {
            timezone: "Etc/UTC".into(),
            upgradable: vec!["libc6".into(), "openssl".into()],
            archives: vec!["/var/cache/apt/archives/tzdata_2024a-0+deb12u1_all.deb".into()],
            ..State::default()
        };
        state.users.insert(
            "root".into(),
            User {
                groups: vec!["root".into()],
                password: None,
            },
        );
        for pkg in ["openssh-server", "sudo", "curl", "ca-certificates", "systemd"] {
            state.install(pkg);
        }
        state.write_file("/etc/os-release", OS_RELEASE);
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make commands starting with `prefix` exit with `code`
    pub fn fail_on(&self, prefix: &str, code: i32) {
        self.lock().failures.push((prefix.into(), code));
    }

    /// Make commands starting with `prefix` time out
    pub fn hang_on(&self, prefix: &str) {
        self.lock().hangs.push(prefix.into());
    }

    /// Make commands starting with `prefix` succeed without effect
    pub fn ignore(&self, prefix: &str) {
        self.lock().ignored.push(prefix.into());
    }

    /// Replace the stdout of every successful `program` call
    pub fn override_stdout(&self, program: &str, stdout: &str) {
        self.lock()
            .stdout_overrides
            .insert(program.into(), stdout.into());
    }

    /// Make `program` impossible to spawn
    pub fn remove_binary(&self, program: &str) {
        self.lock().removed_binaries.insert(program.into());
    }

    /// Make `apt-get install` unable to find `package`
    pub fn make_unavailable(&self, package: &str) {
        self.lock().unavailable.insert(package.into());
    }

    pub fn install_package(&self, package: &str) {
        self.lock().install(package);
    }

    pub fn stop_service(&self, service: &str) {
        if let Some(svc) = self.lock().services.get_mut(service) {
            svc.active = false;
        }
    }

    /// An existing account with a password set
    pub fn add_user(&self, name: &str, groups: &[&str]) {
        let mut all = vec![name.to_string()];
        all.extend(groups.iter().map(|g| (*g).to_string()));
        self.lock().users.insert(
            name.into(),
            User {
                groups: all,
                password: Some("existing-password".into()),
            },
        );
    }

    /// Remove the account's password, as `passwd -d` would
    pub fn lock_password(&self, name: &str) {
        if let Some(user) = self.lock().users.get_mut(name) {
            user.password = None;
        }
    }

    pub fn user_exists(&self, name: &str) -> bool {
        self.lock().users.contains_key(name)
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.lock().write_file(path, content);
    }

    /// Backdate a file's modification time
    pub fn age_file(&self, path: &str, secs: i64) {
        let now = Utc::now().timestamp();
        self.lock().mtimes.insert(path.into(), now - secs);
    }

    /// Set the firewall's default policy for `direction` (`incoming`, `outgoing`)
    pub fn firewall_default(&self, policy: &str, direction: &str) {
        self.lock().ufw(&["default", policy, direction]);
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn timezone(&self) -> String {
        self.lock().timezone.clone()
    }

    pub fn password_of(&self, user: &str) -> Option<String> {
        self.lock().users.get(user).and_then(|u| u.password.clone())
    }

    /// Every command line received, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.line.clone()).collect()
    }

    /// Command lines that would change the host
    pub fn mutating_calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.mutating)
            .map(|c| c.line.clone())
            .collect()
    }

    /// Whether any received command starts with `prefix`
    pub fn ran(&self, prefix: &str) -> bool {
        self.lock().calls.iter().any(|c| c.line.starts_with(prefix))
    }
}

impl CommandRunner for SimHost {
    fn run(
        &self,
        invocation: &Invocation,
        options: &RunOptions,
    ) -> Result<CommandOutput, CommandError> {
        let line = invocation.display();
        let mut state = self.lock();
        state.calls.push(Call {
            line: line.clone(),
            mutating: is_mutating(invocation),
        });

        if options.dry_run {
            return Ok(CommandOutput::default());
        }
        if !state.binary_present(&invocation.program) {
            return Err(CommandError::Execution {
                program: invocation.program.clone(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        if state.hangs.iter().any(|p| line.starts_with(p.as_str())) {
            return Err(CommandError::Timeout {
                command: line,
                timeout: options.timeout,
            });
        }
        if let Some((_, code)) = state.failures.iter().find(|(p, _)| line.starts_with(p.as_str())) {
            return Err(CommandError::NonZeroExit {
                command: line,
                code: *code,
                stdout: String::new(),
                stderr: "simulated failure".into(),
            });
        }
        if state.ignored.iter().any(|p| line.starts_with(p.as_str())) {
            return Ok(CommandOutput::default());
        }

        let result = state.execute(invocation);
        match result {
            Ok(stdout) => {
                let stdout = state
                    .stdout_overrides
                    .get(&invocation.program)
                    .cloned()
                    .unwrap_or(stdout);
                Ok(CommandOutput::ok(stdout))
            }
            Err((code, stdout, stderr)) => Err(CommandError::NonZeroExit {
                command: line,
                code,
                stdout,
                stderr,
            }),
        }
    }
}

fn is_mutating(inv: &Invocation) -> bool {
    let first = inv.args.first().map_or("", String::as_str);
    match inv.program.as_str() {
        "apt-get" | "useradd" | "usermod" | "userdel" | "chpasswd" | "install" | "rm"
        | "touch" => true,
        "timedatectl" => first == "set-timezone",
        "systemctl" => !first.starts_with("is-"),
        "ufw" => first != "status",
        "sh" => inv.args.get(1).is_some_and(|s| !s.starts_with("test ")),
        _ => false,
    }
}

fn fail(code: i32, stderr: impl Into<String>) -> Exit {
    (code, String::new(), stderr.into())
}

impl State {
    fn binary_present(&self, program: &str) -> bool {
        if self.removed_binaries.contains(program) {
            return false;
        }
        match program {
            "ufw" => self.packages.contains("ufw"),
            _ => true,
        }
    }

    fn write_file(&mut self, path: &str, content: &str) {
        self.files.insert(path.into(), content.into());
        self.mtimes.insert(path.into(), Utc::now().timestamp());
    }

    fn install(&mut self, package: &str) {
        self.packages.insert(package.into());
        if let Some((_, unit)) = SERVICE_PACKAGES.iter().find(|(p, _)| *p == package) {
            self.services.entry((*unit).into()).or_insert(Service {
                enabled: true,
                active: true,
            });
        }
    }

    fn execute(&mut self, inv: &Invocation) -> Result<String, Exit> {
        let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();
        match (inv.program.as_str(), args.as_slice()) {
            ("getent", ["passwd", name]) => match self.users.get(*name) {
                Some(_) => Ok(format!("{name}:x:1000:1000::/home/{name}:/bin/bash\n")),
                None => Err(fail(2, "")),
            },
            ("id", ["-u"]) => Ok("0\n".into()),
            ("id", ["-nG", name]) => match self.users.get(*name) {
                Some(user) => Ok(format!("{}\n", user.groups.join(" "))),
                None => Err(fail(1, format!("id: '{name}': no such user"))),
            },
            ("dpkg-query", ["-W", _, pkg]) => {
                if self.packages.contains(*pkg) {
                    Ok("install ok installed".into())
                } else {
                    Err(fail(1, format!("dpkg-query: no packages found matching {pkg}")))
                }
            }
            ("systemctl", [verb, unit]) => self.systemctl(verb, unit),
            ("timedatectl", ["show", ..]) => Ok(format!("{}\n", self.timezone)),
            ("timedatectl", ["set-timezone", tz]) => {
                self.timezone = (*tz).to_string();
                Ok(String::new())
            }
            ("ufw", rest) => Ok(self.ufw(rest)),
            ("sha256sum", [path]) => match self.files.get(*path) {
                Some(content) => Ok(format!("{}  {path}\n", content_hash(content))),
                None => Err(fail(
                    1,
                    format!("sha256sum: {path}: No such file or directory"),
                )),
            },
            ("stat", ["-c", "%Y", path]) => match self.mtimes.get(*path) {
                Some(mtime) if self.files.contains_key(*path) => Ok(format!("{mtime}\n")),
                _ => Err(fail(
                    1,
                    format!("stat: cannot statx '{path}': No such file or directory"),
                )),
            },
            ("touch", [path]) => {
                let content = self.files.get(*path).cloned().unwrap_or_default();
                self.write_file(path, &content);
                Ok(String::new())
            }
            ("passwd", ["-S", name]) => match self.users.get(*name) {
                Some(user) => {
                    let status = if user.password.is_some() { "P" } else { "L" };
                    Ok(format!("{name} {status} 2026-01-01 0 99999 7 -1\n"))
                }
                None => Err(fail(1, format!("passwd: user '{name}' does not exist"))),
            },
            ("apt", ["list", "--upgradable"]) => {
                let mut out = String::from("Listing... Done\n");
                for pkg in &self.upgradable {
                    out.push_str(&format!(
                        "{pkg}/stable-security 1.0-2 amd64 [upgradable from: 1.0-1]\n"
                    ));
                }
                Ok(out)
            }
            ("find", ["/var/cache/apt/archives", ..]) => {
                Ok(self.archives.iter().map(|a| format!("{a}\n")).collect())
            }
            ("cat", [path]) => self
                .files
                .get(*path)
                .cloned()
                .ok_or_else(|| fail(1, format!("cat: {path}: No such file or directory"))),
            ("apt-get", rest) => self.apt_get(rest),
            ("useradd", rest) => self.useradd(rest),
            ("usermod", ["-aG", groups, name]) => match self.users.get_mut(*name) {
                Some(user) => {
                    for group in groups.split(',') {
                        if !user.groups.iter().any(|g| g == group) {
                            user.groups.push(group.into());
                        }
                    }
                    Ok(String::new())
                }
                None => Err(fail(6, format!("usermod: user '{name}' does not exist"))),
            },
            ("chpasswd", []) => self.chpasswd(inv.stdin.as_deref().unwrap_or_default()),
            ("install", rest) => self.install_file(rest, inv.stdin.as_deref()),
            ("userdel", ["-r", name]) => match self.users.remove(*name) {
                Some(_) => {
                    let home = format!("/home/{name}/");
                    self.files.retain(|path, _| !path.starts_with(&home));
                    Ok(String::new())
                }
                None => Err(fail(6, format!("userdel: user '{name}' does not exist"))),
            },
            ("rm", ["-f", path]) => {
                self.files.remove(*path);
                Ok(String::new())
            }
            ("sshd", ["-t"]) => Ok(String::new()),
            ("sh", ["-c", script]) => self.shell(script),
            (program, _) => Err(fail(127, format!("{program}: command not found"))),
        }
    }

    fn systemctl(&mut self, verb: &str, unit: &str) -> Result<String, Exit> {
        let not_found = || fail(5, format!("Failed to {verb} {unit}.service: Unit {unit}.service not found."));
        match verb {
            "is-active" => match self.services.get(unit) {
                Some(svc) if svc.active => Ok("active\n".into()),
                _ => Err((3, "inactive\n".into(), String::new())),
            },
            "is-enabled" => match self.services.get(unit) {
                Some(svc) if svc.enabled => Ok("enabled\n".into()),
                Some(_) => Err((1, "disabled\n".into(), String::new())),
                None => Err((4, "not-found\n".into(), String::new())),
            },
            "enable" | "disable" => {
                let svc = self.services.get_mut(unit).ok_or_else(not_found)?;
                svc.enabled = verb == "enable";
                Ok(String::new())
            }
            "start" | "restart" => {
                let svc = self.services.get_mut(unit).ok_or_else(not_found)?;
                svc.active = true;
                Ok(String::new())
            }
            "stop" => {
                let svc = self.services.get_mut(unit).ok_or_else(not_found)?;
                svc.active = false;
                Ok(String::new())
            }
            _ => Err(fail(1, format!("Unknown command verb {verb}."))),
        }
    }

    fn ufw(&mut self, args: &[&str]) -> String {
        match args {
            ["status", "verbose"] => {
                if !self.firewall.active {
                    return "Status: inactive\n".into();
                }
                let mut out = format!(
                    "Status: active\nLogging: on (low)\n\
                     Default: {} (incoming), {} (outgoing), disabled (routed)\n\
                     New profiles: skip\n\n\
                     To                         Action      From\n\
                     --                         ------      ----\n",
                    self.firewall.incoming, self.firewall.outgoing
                );
                for rule in &self.firewall.rules {
                    out.push_str(&format!("{rule:<27}{:<12}Anywhere\n", "ALLOW IN"));
                }
                for rule in &self.firewall.rules {
                    let v6 = format!("{rule} (v6)");
                    out.push_str(&format!("{v6:<27}{:<12}Anywhere (v6)\n", "ALLOW IN"));
                }
                out
            }
            ["default", policy, direction] => {
                match *direction {
                    "incoming" => self.firewall.incoming = (*policy).to_string(),
                    "outgoing" => self.firewall.outgoing = (*policy).to_string(),
                    _ => return String::new(),
                }
                format!("Default {direction} policy changed to '{policy}'\n")
            }
            ["--force", "reset"] => {
                self.firewall = Firewall::default();
                "Resetting all rules to installed defaults.\n".into()
            }
            ["--force", "enable"] => {
                self.firewall.active = true;
                "Firewall is active and enabled on system startup\n".into()
            }
            ["allow", rule] => {
                if !self.firewall.rules.iter().any(|r| r == rule) {
                    self.firewall.rules.push((*rule).to_string());
                }
                "Rules updated\nRules updated (v6)\n".into()
            }
            _ => String::new(),
        }
    }

    fn apt_get(&mut self, args: &[&str]) -> Result<String, Exit> {
        // Skip flags and `-o` option values
        let mut words = vec![];
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if *arg == "-o" {
                iter.next();
            } else if !arg.starts_with('-') {
                words.push(*arg);
            }
        }

        match words.split_first() {
            Some((&"update", [])) => Ok("Hit:1 http://deb.debian.org/debian bookworm InRelease\n\
                 Reading package lists... Done\n"
                .into()),
            Some((&"upgrade", [])) => {
                for pkg in std::mem::take(&mut self.upgradable) {
                    self.archives
                        .push(format!("/var/cache/apt/archives/{pkg}_1.0-2_amd64.deb"));
                }
                Ok(String::new())
            }
            Some((&"install", packages)) => {
                if let Some(missing) = packages.iter().find(|p| self.unavailable.contains(**p)) {
                    return Err((
                        100,
                        "Reading package lists...\n".into(),
                        format!("E: Unable to locate package {missing}"),
                    ));
                }
                for pkg in packages {
                    self.install(pkg);
                }
                Ok(String::new())
            }
            Some((&"clean", [])) => {
                self.archives.clear();
                Ok(String::new())
            }
            _ => Err(fail(100, "E: Invalid operation")),
        }
    }

    fn useradd(&mut self, args: &[&str]) -> Result<String, Exit> {
        let Some(name) = args.last() else {
            return Err(fail(2, "Usage: useradd [options] LOGIN"));
        };
        if self.users.contains_key(*name) {
            return Err(fail(9, format!("useradd: user '{name}' already exists")));
        }
        let mut groups = vec![(*name).to_string()];
        if let Some(pos) = args.iter().position(|a| *a == "-G") {
            if let Some(list) = args.get(pos + 1) {
                groups.extend(list.split(',').map(str::to_string));
            }
        }
        self.users.insert(
            (*name).to_string(),
            User {
                groups,
                password: None,
            },
        );
        Ok(String::new())
    }

    fn chpasswd(&mut self, input: &str) -> Result<String, Exit> {
        for line in input.lines() {
            let Some((name, password)) = line.split_once(':') else {
                return Err(fail(1, "chpasswd: line 1: missing new password"));
            };
            match self.users.get_mut(name) {
                Some(user) => user.password = Some(password.to_string()),
                None => return Err(fail(1, format!("chpasswd: user '{name}' does not exist"))),
            }
        }
        Ok(String::new())
    }

    fn install_file(&mut self, args: &[&str], stdin: Option<&str>) -> Result<String, Exit> {
        if let Some(pos) = args.iter().position(|a| *a == "-o") {
            let owner = args.get(pos + 1).copied().unwrap_or_default();
            if owner != "root" && !self.users.contains_key(owner) {
                return Err(fail(1, format!("install: invalid user '{owner}'")));
            }
        }
        if args.contains(&"-d") {
            return Ok(String::new());
        }
        match args {
            [.., "/dev/stdin", path] => {
                self.write_file(path, stdin.unwrap_or_default());
                Ok(String::new())
            }
            _ => Err(fail(1, "install: missing destination file operand")),
        }
    }

    fn shell(&mut self, script: &str) -> Result<String, Exit> {
        let words: Vec<&str> = script.split_whitespace().collect();
        match words.as_slice() {
            ["true"] => Ok(String::new()),
            ["false"] => Err(fail(1, "")),
            ["exit", code] => match code.parse() {
                Ok(0) => Ok(String::new()),
                Ok(code) => Err(fail(code, "")),
                Err(_) => Err(fail(2, format!("sh: exit: Illegal number: {code}"))),
            },
            ["test", "-e", path] => {
                if self.files.contains_key(*path) {
                    Ok(String::new())
                } else {
                    Err(fail(1, ""))
                }
            }
            ["touch", path] => {
                let content = self.files.get(*path).cloned().unwrap_or_default();
                self.write_file(path, &content);
                Ok(String::new())
            }
            _ => Err(fail(127, format!("sh: unsupported script: {script}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_dry_run_calls_change_nothing() {
        let host = SimHost::fresh_debian();
        let options = RunOptions {
            dry_run: true,
            timeout: Duration::from_secs(1),
        };
        host.run(&Invocation::new("apt-get").arg("clean"), &options)
            .unwrap();
        assert_eq!(host.mutating_calls(), vec!["apt-get clean"]);
        assert_eq!(host.lock().archives.len(), 1);
    }

    #[test]
    fn test_unknown_program_is_not_found() {
        let host = SimHost::fresh_debian();
        let err = host
            .run(&Invocation::new("frobnicate"), &RunOptions::default())
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(127));
    }
}
