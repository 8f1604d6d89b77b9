//! Configuration files written to the host

use tera::{Context, Tera};

use crate::config::ProvisionConfig;

/// Drop-in read by Debian's stock `sshd_config` (`Include sshd_config.d/*.conf`)
pub const SSHD_FRAGMENT_PATH: &str = "/etc/ssh/sshd_config.d/10-hostprep.conf";
/// fail2ban local overrides
pub const JAIL_LOCAL_PATH: &str = "/etc/fail2ban/jail.local";
/// apt periodic settings consumed by unattended-upgrades
pub const AUTO_UPGRADES_PATH: &str = "/etc/apt/apt.conf.d/20auto-upgrades";

const SSHD: &str = include_str!("../templates/sshd_config.conf.tera");
const JAIL: &str = include_str!("../templates/jail.local.tera");
const AUTO_UPGRADES: &str = include_str!("../templates/auto-upgrades.tera");

/// Renders the managed configuration files from a [`ProvisionConfig`]
pub struct Templates {
    tera: Tera,
}

impl Templates {
    /// Load the built-in templates
    pub fn new() -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_templates([
            ("sshd", SSHD),
            ("jail", JAIL),
            ("auto-upgrades", AUTO_UPGRADES),
        ])?;
        Ok(Self { tera })
    }

    /// sshd drop-in enforcing the access policy
    pub fn sshd_fragment(&self, config: &ProvisionConfig) -> Result<String, tera::Error> {
        let mut ctx = Context::new();
        ctx.insert("ssh_port", &config.ssh_port);
        ctx.insert("password_auth", &config.password_auth_enabled());
        ctx.insert("max_auth_tries", &config.ban_max_retry.max(3));
        self.tera.render("sshd", &ctx)
    }

    /// fail2ban jail protecting sshd on the configured port
    pub fn jail_local(&self, config: &ProvisionConfig) -> Result<String, tera::Error> {
        let mut ctx = Context::new();
        ctx.insert("ssh_port", &config.ssh_port);
        ctx.insert("max_retry", &config.ban_max_retry);
        ctx.insert("ban_time", &config.ban_time_secs);
        self.tera.render("jail", &ctx)
    }

    /// apt periodic configuration enabling unattended upgrades
    pub fn auto_upgrades(&self) -> Result<String, tera::Error> {
        self.tera.render("auto-upgrades", &Context::new())
    }
}
