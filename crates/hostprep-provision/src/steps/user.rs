//! Administrative user account

use std::sync::{Mutex, PoisonError};

use super::{ApplyError, Condition, ManagedFile, Step, StepContext, StepExt, StepInfo, describe};
use crate::probe::ProbeError;
use crate::runner::Invocation;
use crate::secret::SecretValue;

/// Ensure a sudo-capable login account exists
///
/// A missing account is created with the password handed over through
/// [`EnsureAdminUser::with_password`]. The password is consumed by the first
/// `apply` that needs it and only ever travels over `chpasswd`'s stdin.
///
/// Without SSH keys the password is the only way in, so the account then
/// also needs a usable password to count as satisfied.
#[derive(Debug)]
pub struct EnsureAdminUser {
    info: StepInfo,
    /// Account name
    pub name: String,
    /// Supplementary groups
    pub groups: Vec<String>,
    /// Login shell
    pub shell: String,
    /// SSH public keys for `~/.ssh/authorized_keys`
    pub ssh_keys: Vec<String>,
    password: Mutex<Option<SecretValue>>,
}

impl EnsureAdminUser {
    /// Create a new admin user step with membership in `sudo`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            info: StepInfo::new("admin-user", format!("Ensure admin user {name} exists")),
            name,
            groups: vec!["sudo".into()],
            shell: "/bin/bash".into(),
            ssh_keys: vec![],
            password: Mutex::new(None),
        }
    }

    /// Set the login shell
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Install these SSH keys
    pub fn with_ssh_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ssh_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Password for a newly created account
    pub fn with_password(mut self, password: Option<SecretValue>) -> Self {
        self.password = Mutex::new(password);
        self
    }

    fn home(&self) -> String {
        format!("/home/{}", self.name)
    }

    fn authorized_keys(&self) -> Option<ManagedFile> {
        if self.ssh_keys.is_empty() {
            return None;
        }
        let mut content = self.ssh_keys.join("\n");
        content.push('\n');
        Some(
            ManagedFile::new(format!("{}/.ssh/authorized_keys", self.home()), content)
                .with_mode("0600")
                .with_owner(self.name.clone()),
        )
    }

    fn create(&self) -> Invocation {
        let groups = self.groups.join(",");
        Invocation::new("useradd").args([
            "-m",
            "-s",
            self.shell.as_str(),
            "-G",
            groups.as_str(),
            self.name.as_str(),
        ])
    }

    fn add_to_groups(&self) -> Invocation {
        let groups = self.groups.join(",");
        Invocation::new("usermod").args(["-aG", groups.as_str(), self.name.as_str()])
    }

    fn set_password(&self, password: SecretValue) -> Invocation {
        Invocation::new("chpasswd").stdin(format!("{}:{}\n", self.name, password.into_inner()))
    }

    fn remove(&self) -> Invocation {
        Invocation::new("userdel").args(["-r", self.name.as_str()])
    }

    fn take_password(&self) -> Result<SecretValue, ApplyError> {
        self.password
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                ApplyError::MissingInput(format!("no password provided for user {}", self.name))
            })
    }

    /// Create the account and set its password, removing it again if the
    /// password cannot be set
    fn create_with_password(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        let password = self.take_password()?;
        let created = ctx.run_all(&[self.create()])?;
        match ctx.run_all(&[self.set_password(password)]) {
            Ok(set) => Ok(format!("{created}\n{set}")),
            Err(e) => {
                tracing::warn!(user = %self.name, error = %e, "setting password failed, removing new account");
                if let Err(cleanup) = ctx.run(&self.remove()) {
                    tracing::warn!(user = %self.name, error = %cleanup, "could not remove account");
                }
                Err(e.into())
            }
        }
    }

    /// Whether a password has to be set on an existing account
    fn needs_password(&self, ctx: &StepContext<'_>) -> Result<bool, ProbeError> {
        Ok(self.ssh_keys.is_empty() && !ctx.probe().password_usable(&self.name)?)
    }

    fn key_invocations(&self) -> Vec<Invocation> {
        let Some(file) = self.authorized_keys() else {
            return vec![];
        };
        let ssh_dir = format!("{}/.ssh", self.home());
        vec![
            Invocation::new("install").args([
                "-d",
                "-m",
                "0700",
                "-o",
                self.name.as_str(),
                "-g",
                self.name.as_str(),
                ssh_dir.as_str(),
            ]),
            file.write_invocation(),
        ]
    }
}

impl StepExt for EnsureAdminUser {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for EnsureAdminUser {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        let probe = ctx.probe();
        if !probe.user_exists(&self.name)? {
            return Ok(Condition::NotSatisfied);
        }
        for group in &self.groups {
            if !probe.user_in_group(&self.name, group)? {
                return Ok(Condition::NotSatisfied);
            }
        }
        if self.needs_password(ctx)? {
            return Ok(Condition::NotSatisfied);
        }
        match self.authorized_keys() {
            Some(file) => Ok(Condition::from_bool(file.matches(&probe)?)),
            None => Ok(Condition::Satisfied),
        }
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        let mut ran = vec![];

        if ctx.probe().user_exists(&self.name)? {
            ran.push(ctx.run_all(&[self.add_to_groups()])?);
            if self.needs_password(ctx)? {
                let password = self.take_password()?;
                ran.push(ctx.run_all(&[self.set_password(password)])?);
            }
        } else {
            ran.push(self.create_with_password(ctx)?);
        }

        let keys = self.key_invocations();
        if !keys.is_empty() {
            ran.push(ctx.run_all(&keys)?);
        }

        Ok(ran.join("\n"))
    }

    fn planned_actions(&self) -> Vec<String> {
        let mut planned = describe(&[self.create()]);
        planned.push("chpasswd".into());
        planned.push(format!("(if chpasswd fails) {}", self.remove().display()));
        planned.push(format!("(if {} exists) {}", self.name, self.add_to_groups().display()));
        planned.extend(describe(&self.key_invocations()));
        planned
    }
}
