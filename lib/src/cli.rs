//! # Atomic deployment CLI
//!
//! Command line surface over the transaction engine.

use std::ffi::OsString;

use anyhow::Result;
use clap::Parser;
use fn_error_context::context;

use crate::error::HammerError;
use crate::logfile;
use crate::retention;
use crate::status;
use crate::sysroot::Sysroot;
use crate::task::Task;
use crate::transaction::{self, TxKind};

/// External tool handling containerized package installs.
const CONTAINER_TOOL: &str = "hammer-container";

/// Perform an install operation
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Name of the package to install.
    pub(crate) package: String,

    /// Install into the package container instead of the system image.
    #[clap(long)]
    pub(crate) container: bool,
}

/// Perform a remove operation
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RemoveOpts {
    /// Name of the package to remove.
    pub(crate) package: String,

    /// Remove from the package container instead of the system image.
    #[clap(long)]
    pub(crate) container: bool,
}

/// Options controlling switch
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct SwitchOpts {
    /// Deployment to boot next; defaults to the second-newest.
    pub(crate) deployment: Option<String>,
}

/// Options controlling rollback
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RollbackOpts {
    /// How many deployments to step back, not counting the current one.
    #[clap(default_value_t = 1)]
    pub(crate) count: usize,
}

/// Perform a status operation
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct StatusOpts {
    /// Output in JSON format.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Perform a history operation
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct HistoryOpts {
    /// Output in JSON format.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Transactional package and image management for HammerOS.
///
/// Every mutating subcommand materializes as a new read-only BTRFS
/// snapshot that becomes the next boot target only after it passes
/// validation; the previous system image stays available for rollback.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "hammer")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Install a package as a new deployment.
    ///
    /// The running system is not modified; the package is installed
    /// into a snapshot that is selected on the next boot.
    Install(InstallOpts),
    /// Remove a package as a new deployment.
    Remove(RemoveOpts),
    /// Rebuild the current image as a new deployment.
    ///
    /// Re-runs the image trailer (initramfs and grub regeneration)
    /// without changing the package set.
    Deploy,
    /// Upgrade all packages as a new deployment.
    #[clap(alias = "upgrade")]
    Update,
    /// Boot an existing deployment next.
    Switch(SwitchOpts),
    /// Step back to an earlier deployment.
    ///
    /// The outgoing deployment is recorded as `previous` and remains in
    /// the bootloader menu until the retention policy reclaims it.
    Rollback(RollbackOpts),
    /// Delete old deployments, keeping the newest five.
    Clean,
    /// Display the metadata of the current deployment.
    Status(StatusOpts),
    /// List all deployments, newest first.
    History(HistoryOpts),
    /// Reconcile an in-flight transaction after a reboot.
    ///
    /// Intended to run from a boot-time service: confirms the committed
    /// deployment as booted, or marks it broken when the bootloader
    /// fell back to an older one.
    CheckTransaction,
    /// Make the current deployment and its nested subvolumes read-only.
    Lock,
    /// Make the current deployment and its nested subvolumes writable.
    Unlock,
}

#[context("Querying root privilege")]
pub(crate) fn require_root() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        return Err(HammerError::NotRoot.into());
    }
    tracing::trace!("Verified uid 0");
    Ok(())
}

/// Parse the provided arguments and execute the selected command.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    require_root()?;
    let sysroot = Sysroot::host();
    match opt {
        Opt::Install(opts) => {
            if opts.container {
                return container_delegate("install", &opts.package);
            }
            run_transaction(&sysroot, TxKind::Install(opts.package))
        }
        Opt::Remove(opts) => {
            if opts.container {
                return container_delegate("remove", &opts.package);
            }
            run_transaction(&sysroot, TxKind::Remove(opts.package))
        }
        Opt::Deploy => run_transaction(&sysroot, TxKind::Deploy),
        Opt::Update => run_transaction(&sysroot, TxKind::Update),
        Opt::Switch(opts) => {
            let target = transaction::switch(&sysroot, opts.deployment.as_deref())?;
            logfile::append(&format!("switch: next boot targets {target}"));
            println!("Next boot: {target}");
            Ok(())
        }
        Opt::Rollback(opts) => {
            let target = transaction::rollback(&sysroot, opts.count)?;
            logfile::append(&format!("rollback: next boot targets {target}"));
            println!("Next boot: {target}");
            Ok(())
        }
        Opt::Clean => {
            let deleted = retention::clean(&sysroot)?;
            logfile::append(&format!("clean: deleted {deleted} deployments"));
            println!("Deleted {deleted} deployments");
            Ok(())
        }
        Opt::Status(opts) => status::status(&sysroot, opts.json),
        Opt::History(opts) => status::history(&sysroot, opts.json),
        Opt::CheckTransaction => transaction::check_transaction(&sysroot),
        Opt::Lock => status::lock(&sysroot),
        Opt::Unlock => status::unlock(&sysroot),
    }
}

fn run_transaction(sysroot: &Sysroot, kind: TxKind) -> Result<()> {
    let action = kind.action();
    logfile::append(&format!("{action}: starting"));
    match transaction::run(sysroot, kind) {
        Ok(name) => {
            logfile::append(&format!("{action}: created {name}"));
            println!("Created deployment {name}; reboot to start using it");
            Ok(())
        }
        Err(e) => {
            logfile::append(&format!("{action}: failed: {e:#}"));
            Err(e)
        }
    }
}

/// Delegate a package operation to the container tool, streaming its
/// output to the terminal.
fn container_delegate(verb: &str, package: &str) -> Result<()> {
    Task::new(
        format!("Delegating {verb} of {package} to {CONTAINER_TOOL}"),
        CONTAINER_TOOL,
    )
    .args([verb, package])
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_install() {
        let opt = Opt::parse_from(["hammer", "install", "vim"]);
        assert_eq!(
            opt,
            Opt::Install(InstallOpts {
                package: "vim".to_string(),
                container: false,
            })
        );
        let opt = Opt::parse_from(["hammer", "install", "vim", "--container"]);
        assert_eq!(
            opt,
            Opt::Install(InstallOpts {
                package: "vim".to_string(),
                container: true,
            })
        );
    }

    #[test]
    fn test_parse_rollback_default() {
        assert_eq!(
            Opt::parse_from(["hammer", "rollback"]),
            Opt::Rollback(RollbackOpts { count: 1 })
        );
        assert_eq!(
            Opt::parse_from(["hammer", "rollback", "3"]),
            Opt::Rollback(RollbackOpts { count: 3 })
        );
    }

    #[test]
    fn test_parse_switch() {
        assert_eq!(
            Opt::parse_from(["hammer", "switch"]),
            Opt::Switch(SwitchOpts { deployment: None })
        );
        assert_eq!(
            Opt::parse_from(["hammer", "switch", "hammer-20250101000000"]),
            Opt::Switch(SwitchOpts {
                deployment: Some("hammer-20250101000000".to_string()),
            })
        );
    }

    #[test]
    fn test_update_alias() {
        assert_eq!(Opt::parse_from(["hammer", "upgrade"]), Opt::Update);
        assert_eq!(Opt::parse_from(["hammer", "check-transaction"]), Opt::CheckTransaction);
    }
}
