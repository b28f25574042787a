//! The fixed on-disk layout of a hammer-managed system.

use std::io::ErrorKind;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// Mount point of the physical btrfs root (the top-level subvolume).
const HOST_BTRFS_ROOT: &str = "/btrfs-root";
/// Directory under the btrfs root holding all deployments.
const DEPLOYMENTS_DIR: &str = "deployments";
/// Prefix shared by every deployment subvolume name.
pub(crate) const DEPLOYMENT_PREFIX: &str = "hammer-";
/// Basename of the symlink selecting the deployment for the next boot.
const CURRENT_LINK: &str = "current";
/// Basename of the pending-transaction marker.
const TRANSACTION_MARKER: &str = "hammer-transaction";

/// Handle to the btrfs root a hammer system lives on. All other paths
/// (deployments, the `current` symlink, the pending marker) derive from
/// it, which is also what lets tests run against a temporary tree.
#[derive(Debug, Clone)]
pub(crate) struct Sysroot {
    root: Utf8PathBuf,
}

impl Sysroot {
    /// The fixed location on a running system.
    pub(crate) fn host() -> Self {
        Self::new(HOST_BTRFS_ROOT.into())
    }

    pub(crate) fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.root
    }

    pub(crate) fn deployments_dir(&self) -> Utf8PathBuf {
        self.root.join(DEPLOYMENTS_DIR)
    }

    pub(crate) fn deployment_path(&self, name: &str) -> Utf8PathBuf {
        self.deployments_dir().join(name)
    }

    pub(crate) fn current_link(&self) -> Utf8PathBuf {
        self.root.join(CURRENT_LINK)
    }

    pub(crate) fn marker_path(&self) -> Utf8PathBuf {
        self.root.join(TRANSACTION_MARKER)
    }

    /// Basename of the deployment the `current` symlink points at.
    pub(crate) fn current_deployment(&self) -> Result<String> {
        let link = self.current_link();
        let target = link
            .read_link_utf8()
            .with_context(|| format!("Reading {link}"))?;
        let name = target
            .file_name()
            .ok_or_else(|| anyhow!("Link {link} has no target basename"))?;
        Ok(name.to_string())
    }

    /// Repoint `current` at the named deployment. The replacement is an
    /// unlink followed by a fresh symlink; readers observe either the
    /// old or the new target.
    pub(crate) fn set_current(&self, name: &str) -> Result<()> {
        let link = self.current_link();
        match std::fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Removing {link}")),
        }
        std::os::unix::fs::symlink(self.deployment_path(name), &link)
            .with_context(|| format!("Creating {link}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_roundtrip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let sysroot = Sysroot::new(root);
        std::fs::create_dir(sysroot.deployments_dir())?;
        std::fs::create_dir(sysroot.deployment_path("hammer-20250101000000"))?;
        std::fs::create_dir(sysroot.deployment_path("hammer-20250102000000"))?;

        assert!(sysroot.current_deployment().is_err());

        sysroot.set_current("hammer-20250101000000")?;
        assert_eq!(sysroot.current_deployment()?, "hammer-20250101000000");

        // Replacing an existing link works too
        sysroot.set_current("hammer-20250102000000")?;
        assert_eq!(sysroot.current_deployment()?, "hammer-20250102000000");
        Ok(())
    }
}
