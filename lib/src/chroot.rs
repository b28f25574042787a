//! Scoped bind mounts for running package commands inside a staged
//! deployment.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::HammerError;
use crate::task::Task;

/// Host directories bound into the staged tree, in mount order.
const BIND_DIRS: &[&str] = &["proc", "sys", "dev"];

/// Bind mounts of the host's `/proc`, `/sys` and `/dev` into a staged
/// deployment. Call [`BindMounts::unmount`] before sealing the tree; a
/// subvolume with live binds cannot be made read-only. The `Drop`
/// teardown is a best-effort fallback for error paths that must not
/// mask the original failure.
pub(crate) struct BindMounts {
    target: Utf8PathBuf,
    mounted: Vec<&'static str>,
}

impl BindMounts {
    #[context("Binding host filesystems into {target}")]
    pub(crate) fn enter(target: &Utf8Path) -> Result<Self> {
        let mut this = Self {
            target: target.to_owned(),
            mounted: Vec::new(),
        };
        for &dir in BIND_DIRS {
            let dest = target.join(dir);
            if !dest.try_exists()? {
                std::fs::create_dir(&dest).with_context(|| format!("Creating {dest}"))?;
            }
            let src = format!("/{dir}");
            let o = Task::new(format!("Binding {src}"), "mount")
                .args(["--bind", &src, dest.as_str()])
                .quiet()
                .output()?;
            if !o.success {
                // Drop of `this` unwinds the binds made so far.
                return Err(HammerError::MountError(format!(
                    "bind {src} -> {dest}: {}",
                    o.stderr.trim()
                ))
                .into());
            }
            this.mounted.push(dir);
        }
        Ok(this)
    }

    /// Tear down the binds in mount order. Consumes the harness; a
    /// failure leaves the remainder to the `Drop` fallback.
    pub(crate) fn unmount(mut self) -> Result<()> {
        while let Some(dir) = self.mounted.first().copied() {
            let dest = self.target.join(dir);
            let o = Task::new(format!("Unmounting {dest}"), "umount")
                .args([dest.as_str()])
                .quiet()
                .output()?;
            if !o.success {
                return Err(HammerError::MountError(format!(
                    "umount {dest}: {}",
                    o.stderr.trim()
                ))
                .into());
            }
            self.mounted.remove(0);
        }
        Ok(())
    }
}

impl Drop for BindMounts {
    fn drop(&mut self) {
        for dir in self.mounted.drain(..) {
            let dest = self.target.join(dir);
            let r = Task::new(format!("Unmounting {dest}"), "umount")
                .args([dest.as_str()])
                .quiet()
                .output();
            match r {
                Ok(o) if o.success => {}
                Ok(o) => tracing::warn!("Failed to unmount {dest}: {}", o.stderr.trim()),
                Err(e) => tracing::warn!("Failed to unmount {dest}: {e:#}"),
            }
        }
    }
}
