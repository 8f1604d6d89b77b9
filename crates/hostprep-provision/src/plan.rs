//! The canonical hardening plan for a fresh Debian host

use crate::config::ProvisionConfig;
use crate::registry::{PlanError, StepRegistry};
use crate::secret::SecretValue;
use crate::steps::{
    CleanPackageCache, ConfigureService, EnsureAdminUser, EnsureFirewall, InstallPackages,
    ManagedFile, SetTimezone, SshAccessPolicy, Step, StepExt, UpdatePackageIndex,
    UpgradePackages,
};
use crate::templates::{AUTO_UPGRADES_PATH, JAIL_LOCAL_PATH, SSHD_FRAGMENT_PATH, Templates};

pub const UPDATE_INDEX: &str = "update-index";
pub const UPGRADE_PACKAGES: &str = "upgrade-packages";
pub const INSTALL_PACKAGES: &str = "install-packages";
pub const SET_TIMEZONE: &str = "set-timezone";
pub const ADMIN_USER: &str = "admin-user";
pub const SSH_POLICY: &str = "ssh-policy";
pub const FIREWALL: &str = "firewall";
pub const FAIL2BAN: &str = "fail2ban";
pub const UNATTENDED_UPGRADES: &str = "unattended-upgrades";
pub const CLEAN_CACHE: &str = "clean-cache";

/// Build the ten-step plan for `config`.
///
/// `password` is used only if the admin account has to be created.
pub fn debian_plan(
    config: &ProvisionConfig,
    password: Option<SecretValue>,
) -> Result<StepRegistry, PlanError> {
    let templates = Templates::new()?;

    let steps: Vec<Box<dyn Step>> = vec![
        // =========================================================
        // Packages
        // =========================================================
        Box::new(UpdatePackageIndex::new(config.index_max_age).named(UPDATE_INDEX)),
        Box::new(
            UpgradePackages::new()
                .named(UPGRADE_PACKAGES)
                .after([UPDATE_INDEX]),
        ),
        Box::new(
            InstallPackages::new(config.packages.iter().cloned())
                .named(INSTALL_PACKAGES)
                .after([UPDATE_INDEX]),
        ),
        Box::new(SetTimezone::new(&config.timezone).named(SET_TIMEZONE)),
        // =========================================================
        // Access
        // =========================================================
        Box::new(
            EnsureAdminUser::new(&config.admin_user)
                .with_ssh_keys(config.ssh_keys.iter().cloned())
                .with_password(password)
                .named(ADMIN_USER)
                .after([INSTALL_PACKAGES]),
        ),
        Box::new(
            SshAccessPolicy::new(
                ManagedFile::new(SSHD_FRAGMENT_PATH, templates.sshd_fragment(config)?),
                &config.ssh_service,
            )
            .named(SSH_POLICY)
            .after([ADMIN_USER]),
        ),
        // =========================================================
        // Network protection
        // =========================================================
        Box::new(
            EnsureFirewall::new(config.firewall_rules())
                .with_reset(config.firewall_reset)
                .named(FIREWALL)
                .after([INSTALL_PACKAGES, SSH_POLICY]),
        ),
        Box::new(
            ConfigureService::new(
                FAIL2BAN,
                "fail2ban",
                ManagedFile::new(JAIL_LOCAL_PATH, templates.jail_local(config)?),
            )
            .after([INSTALL_PACKAGES, FIREWALL]),
        ),
        Box::new(
            ConfigureService::new(
                UNATTENDED_UPGRADES,
                "unattended-upgrades",
                ManagedFile::new(AUTO_UPGRADES_PATH, templates.auto_upgrades()?),
            )
            .after([INSTALL_PACKAGES]),
        ),
        // =========================================================
        // Cleanup
        // =========================================================
        Box::new(
            CleanPackageCache::new()
                .named(CLEAN_CACHE)
                .after([UPGRADE_PACKAGES, INSTALL_PACKAGES]),
        ),
    ];

    StepRegistry::new(steps)
}
