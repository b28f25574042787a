//! The prepare/commit sequence behind every mutating operation.
//!
//! A transaction snapshots the current deployment writably, mutates the
//! copy under chroot, validates it, records metadata and the bootloader
//! menu, then publishes it by switching the default subvolume and the
//! `current` symlink. The pending-transaction marker written before the
//! switch and cleared after it is what lets the next boot distinguish
//! "booted the new image" from "fell back to the old one".

use std::cmp::Ordering;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use sha2::{Digest, Sha256};

use crate::bootloader;
use crate::chroot::BindMounts;
use crate::error::HammerError;
use crate::lock::{LockGuard, LOCK_PATH};
use crate::metadata::{self, DeployStatus, DeploymentMeta};
use crate::sanity;
use crate::snapshot;
use crate::sysroot::Sysroot;
use crate::task::Task;

/// Shell trailer shared by every package operation: record the package
/// inventory, regenerate the initramfs and the grub configuration.
const CHROOT_TRAILER: &str =
    "dpkg -l > /tmp/packages.list && update-initramfs -u -k all && update-grub";

/// statfs(2) magic for btrfs.
const BTRFS_SUPER_MAGIC: u64 = 0x9123_683e;

/// A mutating operation on the system image.
#[derive(Debug)]
pub(crate) enum TxKind {
    /// Install one package.
    Install(String),
    /// Remove one package.
    Remove(String),
    /// Upgrade every installed package.
    Update,
    /// Rebuild the current image unchanged.
    Deploy,
}

impl TxKind {
    /// The `action` string recorded in deployment metadata.
    pub(crate) fn action(&self) -> String {
        match self {
            TxKind::Install(p) => format!("install {p}"),
            TxKind::Remove(p) => format!("remove {p}"),
            TxKind::Update => "update".to_string(),
            TxKind::Deploy => "deploy".to_string(),
        }
    }

    fn chroot_script(&self) -> String {
        match self {
            TxKind::Install(p) => {
                format!("apt update && apt install -y {p} && apt autoremove -y && {CHROOT_TRAILER}")
            }
            TxKind::Remove(p) => {
                format!("apt remove -y {p} && apt autoremove -y && {CHROOT_TRAILER}")
            }
            TxKind::Update => format!(
                "apt update && apt upgrade -y -o Dpkg::Options::=\"--force-confold\" && apt autoremove -y && {CHROOT_TRAILER}"
            ),
            TxKind::Deploy => CHROOT_TRAILER.to_string(),
        }
    }
}

/// Run one mutating operation end to end, returning the basename of
/// the new deployment.
pub(crate) fn run(sysroot: &Sysroot, kind: TxKind) -> Result<String> {
    let _lock = LockGuard::acquire(LOCK_PATH)?;
    run_locked(sysroot, kind)
}

fn run_locked(sysroot: &Sysroot, kind: TxKind) -> Result<String> {
    if let TxKind::Install(p) | TxKind::Remove(p) = &kind {
        validate_package_name(p)?;
    }
    validate_system(sysroot)?;
    let current = sysroot.current_deployment()?;
    let staged = snapshot::create(sysroot, &sysroot.deployment_path(&current), true)?;
    tracing::debug!("staged {staged} from {current}");
    match build_and_publish(sysroot, &kind, &current, &staged) {
        Ok(()) => {
            metadata::clear_marker(sysroot)?;
            Ok(staged)
        }
        Err(e) => {
            // The staged tree stays behind as evidence, marked broken;
            // the prior current remains the boot target.
            mark_broken(sysroot, &staged, &current, &kind.action(), &e);
            if let Err(clear_err) = metadata::clear_marker(sysroot) {
                tracing::warn!("Failed to clear transaction marker: {clear_err:#}");
            }
            Err(e)
        }
    }
}

#[context("Building deployment {staged}")]
fn build_and_publish(sysroot: &Sysroot, kind: &TxKind, current: &str, staged: &str) -> Result<()> {
    let staged_path = sysroot.deployment_path(staged);
    metadata::write_marker(sysroot, staged)?;

    let binds = BindMounts::enter(&staged_path)?;
    match run_chroot_commands(&staged_path, kind) {
        Ok(()) => binds.unmount()?,
        // On failure the binds unwind via Drop; the command error is
        // the one reported.
        Err(e) => return Err(e),
    }

    let kernel = query_kernel(&staged_path)?;
    sanity::check(sysroot, staged, &kernel)?;
    let system_version = compute_system_version(&staged_path)?;

    let meta = DeploymentMeta::new(
        &kind.action(),
        current,
        &kernel,
        &system_version,
        DeployStatus::Ready,
    );
    metadata::write_meta(sysroot, staged, &meta)?;
    write_menu_fragment(sysroot, staged)?;

    snapshot::set_readonly(&staged_path, true)?;
    snapshot::set_default(sysroot, &staged_path)?;
    sysroot.set_current(staged)?;
    Ok(())
}

fn run_chroot_commands(staged_path: &Utf8Path, kind: &TxKind) -> Result<()> {
    match kind {
        TxKind::Install(p) => {
            if dpkg_has_package(staged_path, p)? {
                return Err(HammerError::AlreadyInstalled(p.clone()).into());
            }
        }
        TxKind::Remove(p) => {
            if !dpkg_has_package(staged_path, p)? {
                return Err(HammerError::NotInstalled(p.clone()).into());
            }
        }
        TxKind::Update | TxKind::Deploy => {}
    }
    let script = kind.chroot_script();
    let o = Task::new(format!("Running {} in {staged_path}", kind.action()), "chroot")
        .args([staged_path.as_str(), "/bin/sh", "-c", script.as_str()])
        .output()?;
    if !o.success {
        return Err(HammerError::ChrootCommandFailed(o.stderr.trim().to_string()).into());
    }
    Ok(())
}

fn dpkg_has_package(staged_path: &Utf8Path, package: &str) -> Result<bool> {
    let o = Task::new(format!("Probing for {package}"), "chroot")
        .args([staged_path.as_str(), "dpkg", "-s", package])
        .quiet()
        .output()?;
    Ok(o.success)
}

/// Version of the newest kernel installed in the tree.
#[context("Querying installed kernel")]
fn query_kernel(staged_path: &Utf8Path) -> Result<String> {
    let o = Task::new("Querying package list", "chroot")
        .args([staged_path.as_str(), "dpkg", "-l"])
        .quiet()
        .output()?;
    if !o.success {
        return Err(HammerError::ChrootCommandFailed(o.stderr.trim().to_string()).into());
    }
    parse_newest_kernel(&o.stdout).ok_or_else(|| {
        HammerError::SanityFailed("no linux-image package installed".to_string()).into()
    })
}

/// `dpkg -l` lines look like `ii  linux-image-6.1.0-18-amd64  6.1.76-1 ...`.
/// Meta packages like `linux-image-amd64` carry no version and are
/// ignored; the rest are ordered version-aware, not lexically.
fn parse_newest_kernel(dpkg_list: &str) -> Option<String> {
    let mut versions: Vec<&str> = dpkg_list
        .lines()
        .filter(|l| l.starts_with("ii"))
        .filter_map(|l| l.split_whitespace().nth(1))
        .map(|name| name.split(':').next().unwrap_or(name))
        .filter_map(|name| name.strip_prefix("linux-image-"))
        .filter(|v| v.starts_with(|c: char| c.is_ascii_digit()))
        .collect();
    versions.sort_unstable_by(|a, b| compare_kernel_versions(a, b));
    versions.pop().map(ToOwned::to_owned)
}

/// Order kernel version strings by alternating numeric and non-numeric
/// chunks, the numeric ones compared as numbers: `6.1.0-9` sorts below
/// `6.1.0-18`, and `6.9` below `6.10`.
fn compare_kernel_versions(a: &str, b: &str) -> Ordering {
    let mut a = a;
    let mut b = b;
    loop {
        if a.is_empty() || b.is_empty() {
            return a.len().cmp(&b.len());
        }
        let (num_a, rest_a) = split_leading(a, |c| c.is_ascii_digit());
        let (num_b, rest_b) = split_leading(b, |c| c.is_ascii_digit());
        // Numeric runs compare by magnitude: more digits after leading
        // zeros wins, equal widths fall back to the digits themselves.
        let num_a = num_a.trim_start_matches('0');
        let num_b = num_b.trim_start_matches('0');
        let ord = num_a.len().cmp(&num_b.len()).then_with(|| num_a.cmp(num_b));
        if ord != Ordering::Equal {
            return ord;
        }
        let (sep_a, rest_a) = split_leading(rest_a, |c| !c.is_ascii_digit());
        let (sep_b, rest_b) = split_leading(rest_b, |c| !c.is_ascii_digit());
        let ord = sep_a.cmp(sep_b);
        if ord != Ordering::Equal {
            return ord;
        }
        a = rest_a;
        b = rest_b;
    }
}

fn split_leading(s: &str, pred: impl Fn(char) -> bool) -> (&str, &str) {
    let idx = s.find(|c| !pred(c)).unwrap_or(s.len());
    s.split_at(idx)
}

/// Content identity of the deployment: digest of the package inventory
/// the chroot trailer wrote. The inventory file is removed afterwards
/// so identical package sets produce identical trees.
#[context("Computing system version")]
fn compute_system_version(staged_path: &Utf8Path) -> Result<String> {
    let list = staged_path.join("tmp/packages.list");
    let contents = std::fs::read(&list).with_context(|| format!("Reading {list}"))?;
    let digest = Sha256::digest(&contents);
    std::fs::remove_file(&list).with_context(|| format!("Removing {list}"))?;
    Ok(hex::encode(digest))
}

/// Regenerate the menu fragment inside the staged tree from the full
/// deployment history (including the staged deployment itself, whose
/// metadata is already written at this point).
fn write_menu_fragment(sysroot: &Sysroot, staged: &str) -> Result<()> {
    let mut deployments = Vec::new();
    for name in snapshot::list(sysroot)? {
        match metadata::read_meta(sysroot, &name) {
            Ok(meta) => deployments.push((name, meta)),
            // A half-built deployment without metadata cannot be a
            // menu candidate.
            Err(e) => tracing::debug!("Skipping {name}: {e:#}"),
        }
    }
    let entries = bootloader::select_entries(&deployments);
    let uuid = snapshot::get_uuid(sysroot)?;
    let content = bootloader::render_fragment(&entries, &uuid);
    bootloader::write_fragment(&sysroot.deployment_path(staged), &content)
}

fn mark_broken(sysroot: &Sysroot, staged: &str, current: &str, action: &str, err: &anyhow::Error) {
    let reason = format!("{err:#}");
    let r = match metadata::read_meta(sysroot, staged) {
        Ok(mut meta) => {
            meta.status = DeployStatus::Broken;
            meta.rollback_reason = Some(reason);
            metadata::write_sealed_meta(sysroot, staged, &meta)
        }
        Err(_) => {
            let mut meta = DeploymentMeta::new(action, current, "", "", DeployStatus::Broken);
            meta.rollback_reason = Some(reason);
            metadata::write_meta(sysroot, staged, &meta)
        }
    };
    if let Err(e) = r {
        tracing::warn!("Failed to record broken status on {staged}: {e:#}");
    }
}

/// Switch the next boot to an existing deployment. With no name given,
/// the second-newest deployment is chosen.
pub(crate) fn switch(sysroot: &Sysroot, target: Option<&str>) -> Result<String> {
    let _lock = LockGuard::acquire(LOCK_PATH)?;
    validate_system(sysroot)?;
    let current = sysroot.current_deployment()?;
    let names = snapshot::list(sysroot)?;
    let target = match target {
        Some(name) => {
            if !names.iter().any(|n| n == name) {
                return Err(
                    HammerError::ValidationFailed(format!("no deployment named {name}")).into(),
                );
            }
            if name == current {
                return Err(HammerError::ValidationFailed(format!(
                    "deployment {name} is already current"
                ))
                .into());
            }
            name.to_string()
        }
        None => select_rollback_target(&names, &current, 1)?,
    };
    publish_existing(sysroot, &current, &target)?;
    Ok(target)
}

/// Switch the next boot to the Nth newest deployment other than the
/// current one (N >= 1).
pub(crate) fn rollback(sysroot: &Sysroot, n: usize) -> Result<String> {
    let _lock = LockGuard::acquire(LOCK_PATH)?;
    validate_system(sysroot)?;
    let current = sysroot.current_deployment()?;
    let names = snapshot::list(sysroot)?;
    let target = select_rollback_target(&names, &current, n)?;
    publish_existing(sysroot, &current, &target)?;
    Ok(target)
}

#[context("Switching to {target}")]
fn publish_existing(sysroot: &Sysroot, current: &str, target: &str) -> Result<()> {
    snapshot::set_default(sysroot, &sysroot.deployment_path(target))?;
    sysroot.set_current(target)?;
    metadata::update_sealed_meta(sysroot, current, |m| {
        m.status = DeployStatus::Previous;
        m.rollback_reason = Some("manual".to_string());
    })?;
    Ok(())
}

/// `names` is sorted ascending; pick the Nth newest entry that is not
/// the current deployment.
fn select_rollback_target(names: &[String], current: &str, n: usize) -> Result<String> {
    let index = n
        .checked_sub(1)
        .ok_or_else(|| HammerError::ValidationFailed("rollback count must be at least 1".into()))?;
    let others: Vec<&str> = names
        .iter()
        .rev()
        .map(String::as_str)
        .filter(|name| *name != current)
        .collect();
    others
        .get(index)
        .map(|name| name.to_string())
        .ok_or_else(|| {
            HammerError::ValidationFailed(format!(
                "rollback {n} needs more than {n} deployments, found {}",
                names.len()
            ))
            .into()
        })
}

/// Package names reach a shell command line inside the chroot; anything
/// outside the Debian package-name alphabet is rejected outright.
fn validate_package_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(HammerError::ValidationFailed(format!("invalid package name {name:?}")).into())
    }
}

/// Preconditions for any mutation: a btrfs root, a deployments tree,
/// and a resolvable, read-only current deployment.
#[context("Validating system state")]
fn validate_system(sysroot: &Sysroot) -> Result<()> {
    if !is_btrfs(sysroot.path())? {
        return Err(HammerError::ValidationFailed(format!(
            "{} is not on a btrfs filesystem",
            sysroot.path()
        ))
        .into());
    }
    if !sysroot.deployments_dir().try_exists()? {
        return Err(HammerError::ValidationFailed(format!(
            "deployments directory {} is missing",
            sysroot.deployments_dir()
        ))
        .into());
    }
    let current = match sysroot.current_deployment() {
        Ok(c) => c,
        Err(e) => {
            return Err(HammerError::ValidationFailed(format!(
                "current deployment link is unreadable: {e:#}"
            ))
            .into())
        }
    };
    let path = sysroot.deployment_path(&current);
    if !path.try_exists()? {
        return Err(HammerError::ValidationFailed(format!(
            "current deployment {current} does not exist"
        ))
        .into());
    }
    if !snapshot::get_readonly(&path)? {
        return Err(HammerError::ValidationFailed(format!(
            "current deployment {current} is writable"
        ))
        .into());
    }
    Ok(())
}

fn is_btrfs(path: &Utf8Path) -> Result<bool> {
    let st = rustix::fs::statfs(path.as_std_path())
        .with_context(|| format!("statfs {path}"))?;
    Ok(st.f_type as u64 == BTRFS_SUPER_MAGIC)
}

/// First-boot reconciliation: if a pending marker survives into this
/// boot, either the marked deployment is what we are running (confirm
/// it `booted`) or the bootloader fell back to an older one (declare
/// it `broken`). The marker is removed either way.
#[context("Reconciling pending transaction")]
pub(crate) fn check_transaction(sysroot: &Sysroot) -> Result<()> {
    let Some(marker) = metadata::read_marker(sysroot)? else {
        tracing::debug!("No pending transaction");
        return Ok(());
    };
    let pending = marker.deployment;
    let current = sysroot.current_deployment()?;
    let update = if current == pending {
        println!("Confirming boot of {pending}");
        metadata::set_status_booted(sysroot, &pending)
    } else {
        println!("Marking {pending} broken: booted {current} instead");
        metadata::set_status_broken(
            sysroot,
            &pending,
            &format!("boot fell back to {current}"),
        )
    };
    metadata::clear_marker(sysroot)?;
    update
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn test_sysroot() -> (tempfile::TempDir, Sysroot) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let sysroot = Sysroot::new(root);
        std::fs::create_dir(sysroot.deployments_dir()).unwrap();
        (td, sysroot)
    }

    fn add_deployment(sysroot: &Sysroot, name: &str, status: DeployStatus) {
        std::fs::create_dir(sysroot.deployment_path(name)).unwrap();
        let meta = DeploymentMeta::new("deploy", "hammer-0", "6.1.0-18-amd64", "v", status);
        metadata::write_meta(sysroot, name, &meta).unwrap();
    }

    #[test]
    fn test_validate_package_name() {
        for ok in ["vim", "g++", "libstdc++6", "linux-image-6.1.0-18-amd64", "libc6.1"] {
            validate_package_name(ok).unwrap();
        }
        for bad in ["", "vim; rm -rf /", "$(reboot)", "a b", "vim\n"] {
            assert!(validate_package_name(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_parse_newest_kernel() {
        let listing = "\
Desired=Unknown/Install/Remove/Purge/Hold
ii  libc6:amd64                 2.36-9+deb12u4   amd64  GNU C Library
ii  linux-image-6.1.0-17-amd64  6.1.69-1         amd64  Linux 6.1 for 64-bit PCs
ii  linux-image-6.1.0-18-amd64  6.1.76-1         amd64  Linux 6.1 for 64-bit PCs
ii  linux-image-amd64           6.1.76-1         amd64  Linux for 64-bit PCs (meta)
rc  linux-image-5.10.0-8-amd64  5.10.46-4        amd64  removed kernel
";
        assert_eq!(parse_newest_kernel(listing).as_deref(), Some("6.1.0-18-amd64"));
        assert_eq!(parse_newest_kernel("ii  vim  2:9.0  amd64  editor\n"), None);

        // 18 beats 9 despite sorting before it byte-wise
        let listing = "\
ii  linux-image-6.1.0-18-amd64  6.1.76-1  amd64  Linux 6.1 for 64-bit PCs
ii  linux-image-6.1.0-9-amd64   6.1.27-1  amd64  Linux 6.1 for 64-bit PCs
";
        assert_eq!(parse_newest_kernel(listing).as_deref(), Some("6.1.0-18-amd64"));
    }

    #[test]
    fn test_compare_kernel_versions() {
        use std::cmp::Ordering::*;
        for (a, b, expected) in [
            ("6.1.0-9-amd64", "6.1.0-18-amd64", Less),
            ("6.9.2", "6.10.1", Less),
            ("6.10.1", "6.10.1", Equal),
            ("6.1.0-18", "6.1.0-18-amd64", Less),
            ("6.2.0-1-amd64", "6.1.0-18-amd64", Greater),
            ("6.1.0-010", "6.1.0-10", Equal),
        ] {
            assert_eq!(compare_kernel_versions(a, b), expected, "{a} vs {b}");
        }
    }

    #[test]
    fn test_select_rollback_target() {
        let names = vec![
            "hammer-a".to_string(),
            "hammer-b".to_string(),
            "hammer-c".to_string(),
        ];
        // C is current: rollback 1 -> B, rollback 2 -> A
        assert_eq!(select_rollback_target(&names, "hammer-c", 1).unwrap(), "hammer-b");
        assert_eq!(select_rollback_target(&names, "hammer-c", 2).unwrap(), "hammer-a");
        // B is current: the newest other deployment is C
        assert_eq!(select_rollback_target(&names, "hammer-b", 1).unwrap(), "hammer-c");
        // Not enough deployments
        assert!(select_rollback_target(&names, "hammer-c", 3).is_err());
        assert!(select_rollback_target(&names, "hammer-c", 0).is_err());
        let one = vec!["hammer-a".to_string()];
        assert!(select_rollback_target(&one, "hammer-a", 1).is_err());
    }

    #[test]
    fn test_check_transaction_confirms_booted() -> Result<()> {
        let (_td, sysroot) = test_sysroot();
        add_deployment(&sysroot, "hammer-20250101000000", DeployStatus::Booted);
        add_deployment(&sysroot, "hammer-20250102000000", DeployStatus::Ready);
        sysroot.set_current("hammer-20250102000000")?;
        metadata::write_marker(&sysroot, "hammer-20250102000000")?;

        check_transaction(&sysroot)?;

        let meta = metadata::read_meta(&sysroot, "hammer-20250102000000")?;
        assert_eq!(meta.status, DeployStatus::Booted);
        assert!(metadata::read_marker(&sysroot)?.is_none());
        Ok(())
    }

    #[test]
    fn test_check_transaction_marks_fallback_broken() -> Result<()> {
        let (_td, sysroot) = test_sysroot();
        add_deployment(&sysroot, "hammer-20250101000000", DeployStatus::Booted);
        add_deployment(&sysroot, "hammer-20250102000000", DeployStatus::Ready);
        // The bootloader fell back to the older deployment
        sysroot.set_current("hammer-20250101000000")?;
        metadata::write_marker(&sysroot, "hammer-20250102000000")?;

        check_transaction(&sysroot)?;

        let meta = metadata::read_meta(&sysroot, "hammer-20250102000000")?;
        assert_eq!(meta.status, DeployStatus::Broken);
        assert!(meta
            .rollback_reason
            .as_deref()
            .unwrap()
            .contains("hammer-20250101000000"));
        assert!(metadata::read_marker(&sysroot)?.is_none());
        Ok(())
    }

    #[test]
    fn test_check_transaction_without_marker_is_noop() -> Result<()> {
        let (_td, sysroot) = test_sysroot();
        add_deployment(&sysroot, "hammer-20250101000000", DeployStatus::Booted);
        sysroot.set_current("hammer-20250101000000")?;
        check_transaction(&sysroot)?;
        let meta = metadata::read_meta(&sysroot, "hammer-20250101000000")?;
        assert_eq!(meta.status, DeployStatus::Booted);
        Ok(())
    }

    #[test]
    fn test_mark_broken_without_existing_meta() {
        let (_td, sysroot) = test_sysroot();
        std::fs::create_dir(sysroot.deployment_path("hammer-20250102000000")).unwrap();
        let err = anyhow::Error::from(HammerError::SanityFailed("missing kernel".into()));
        mark_broken(
            &sysroot,
            "hammer-20250102000000",
            "hammer-20250101000000",
            "install vim",
            &err,
        );
        let meta = metadata::read_meta(&sysroot, "hammer-20250102000000").unwrap();
        assert_eq!(meta.status, DeployStatus::Broken);
        assert_eq!(meta.action, "install vim");
        assert_eq!(meta.parent, "hammer-20250101000000");
        assert!(meta.rollback_reason.unwrap().contains("missing kernel"));
    }
}
