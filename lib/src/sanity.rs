//! Pre-publish verification that a staged deployment can boot.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::error::HammerError;
use crate::sysroot::Sysroot;
use crate::task::Task;

/// Verify the staged deployment is bootable: the kernel and initramfs
/// the bootloader entry will reference must exist, and every fstab
/// entry must be mountable.
#[context("Sanity checking {name}")]
pub(crate) fn check(sysroot: &Sysroot, name: &str, kernel: &str) -> Result<()> {
    let root = sysroot.deployment_path(name);
    check_boot_files(&root, kernel)?;
    check_fstab(&root)?;
    Ok(())
}

fn check_boot_files(root: &Utf8Path, kernel: &str) -> Result<()> {
    let vmlinuz = root.join(format!("boot/vmlinuz-{kernel}"));
    if !vmlinuz.try_exists()? {
        return Err(HammerError::SanityFailed(format!("missing kernel image {vmlinuz}")).into());
    }
    let initrd = root.join(format!("boot/initrd.img-{kernel}"));
    if !initrd.try_exists()? {
        return Err(HammerError::SanityFailed(format!("missing initramfs {initrd}")).into());
    }
    Ok(())
}

/// `mount -f -a` fake-mounts every fstab entry, catching malformed
/// lines before the deployment is published.
fn check_fstab(root: &Utf8Path) -> Result<()> {
    let o = Task::new(format!("Checking fstab in {root}"), "chroot")
        .args([root.as_str(), "mount", "-f", "-a"])
        .quiet()
        .output()?;
    if !o.success {
        return Err(
            HammerError::SanityFailed(format!("fstab check failed: {}", o.stderr.trim())).into(),
        );
    }
    Ok(())
}
