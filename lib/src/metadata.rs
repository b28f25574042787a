//! Per-deployment metadata records and the pending-transaction marker.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::error::HammerError;
use crate::snapshot;
use crate::sysroot::Sysroot;

/// Basename of the metadata record inside each deployment.
const META_FILE: &str = "meta.json";

/// Boot status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DeployStatus {
    /// Built and validated, not yet booted.
    Ready,
    /// Confirmed booted after construction.
    Booted,
    /// Displaced by a manual switch or rollback.
    Previous,
    /// Failed validation, or never came up after a commit.
    Broken,
}

impl std::fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeployStatus::Ready => "ready",
            DeployStatus::Booted => "booted",
            DeployStatus::Previous => "previous",
            DeployStatus::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// The flat record stored at `<deployment>/meta.json`. Keys written by
/// other tools are carried through updates untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DeploymentMeta {
    pub(crate) created: DateTime<Utc>,
    pub(crate) action: String,
    pub(crate) parent: String,
    #[serde(default)]
    pub(crate) kernel: String,
    pub(crate) system_version: String,
    pub(crate) status: DeployStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) rollback_reason: Option<String>,
    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, String>,
}

impl DeploymentMeta {
    /// Fresh record stamped with the current time.
    pub(crate) fn new(
        action: &str,
        parent: &str,
        kernel: &str,
        system_version: &str,
        status: DeployStatus,
    ) -> Self {
        Self {
            created: Utc::now(),
            action: action.to_string(),
            parent: parent.to_string(),
            kernel: kernel.to_string(),
            system_version: system_version.to_string(),
            status,
            rollback_reason: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Sidecar record naming a committed-but-unconfirmed transaction.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TransactionMarker {
    pub(crate) deployment: String,
}

#[context("Reading metadata of {name}")]
pub(crate) fn read_meta(sysroot: &Sysroot, name: &str) -> Result<DeploymentMeta> {
    let path = sysroot.deployment_path(name).join(META_FILE);
    let data = std::fs::read_to_string(&path)
        .map_err(|e| HammerError::MetadataError(format!("{path}: {e}")))?;
    let meta = serde_json::from_str(&data)
        .map_err(|e| HammerError::MetadataError(format!("{path}: {e}")))?;
    Ok(meta)
}

#[context("Writing metadata of {name}")]
pub(crate) fn write_meta(sysroot: &Sysroot, name: &str, meta: &DeploymentMeta) -> Result<()> {
    let dir = Dir::open_ambient_dir(sysroot.deployment_path(name), cap_std::ambient_authority())
        .with_context(|| format!("Opening deployment {name}"))?;
    let data = serde_json::to_vec_pretty(meta)?;
    dir.atomic_write(META_FILE, data)
        .context("Writing meta.json")?;
    Ok(())
}

/// Write the record of a possibly-sealed deployment: the subvolume is
/// made writable around the write and resealed afterwards. When the
/// read-only state cannot be determined (the tree is not a subvolume)
/// the write is attempted directly and its own failure is the verdict.
pub(crate) fn write_sealed_meta(sysroot: &Sysroot, name: &str, meta: &DeploymentMeta) -> Result<()> {
    let path = sysroot.deployment_path(name);
    let sealed = match snapshot::get_readonly(&path) {
        Ok(ro) => ro,
        Err(e) => {
            tracing::debug!("Cannot query read-only state of {path}: {e:#}");
            false
        }
    };
    if sealed {
        snapshot::set_readonly(&path, false)?;
    }
    let r = write_meta(sysroot, name, meta);
    if sealed {
        let reseal = snapshot::set_readonly(&path, true);
        match (&r, reseal) {
            (Ok(()), reseal) => reseal?,
            (Err(_), Err(e)) => tracing::warn!("Failed to reseal {path}: {e:#}"),
            _ => {}
        }
    }
    r
}

/// Merge an edit onto the existing record; keys the edit does not touch
/// are preserved.
pub(crate) fn update_sealed_meta(
    sysroot: &Sysroot,
    name: &str,
    f: impl FnOnce(&mut DeploymentMeta),
) -> Result<()> {
    let mut meta = read_meta(sysroot, name)?;
    f(&mut meta);
    write_sealed_meta(sysroot, name, &meta)
}

/// Mark a deployment as confirmed booted.
pub(crate) fn set_status_booted(sysroot: &Sysroot, name: &str) -> Result<()> {
    update_sealed_meta(sysroot, name, |m| {
        m.status = DeployStatus::Booted;
    })
}

/// Mark a deployment as broken, recording why.
pub(crate) fn set_status_broken(sysroot: &Sysroot, name: &str, reason: &str) -> Result<()> {
    update_sealed_meta(sysroot, name, |m| {
        m.status = DeployStatus::Broken;
        m.rollback_reason = Some(reason.to_string());
    })
}

/// Durably record the in-flight transaction. The marker is the commit
/// record: it must reach disk before the default-subvolume switch makes
/// the transaction visible, hence the explicit fsync of file and
/// directory.
#[context("Recording pending transaction")]
pub(crate) fn write_marker(sysroot: &Sysroot, deployment: &str) -> Result<()> {
    let path = sysroot.marker_path();
    let tmp = sysroot.path().join(".hammer-transaction.tmp");
    let marker = TransactionMarker {
        deployment: deployment.to_string(),
    };
    let f = File::create(&tmp).with_context(|| format!("Creating {tmp}"))?;
    serde_json::to_writer(&f, &marker)?;
    f.sync_all().with_context(|| format!("Syncing {tmp}"))?;
    drop(f);
    std::fs::rename(&tmp, &path).with_context(|| format!("Renaming {tmp} to {path}"))?;
    File::open(sysroot.path())
        .and_then(|d| d.sync_all())
        .with_context(|| format!("Syncing {}", sysroot.path()))?;
    Ok(())
}

#[context("Reading transaction marker")]
pub(crate) fn read_marker(sysroot: &Sysroot) -> Result<Option<TransactionMarker>> {
    let path = sysroot.marker_path();
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    let marker = serde_json::from_str(&data)
        .map_err(|e| HammerError::MetadataError(format!("{path}: {e}")))?;
    Ok(Some(marker))
}

/// Remove the marker; absence is not an error.
pub(crate) fn clear_marker(sysroot: &Sysroot) -> Result<()> {
    match std::fs::remove_file(sysroot.marker_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("Removing transaction marker"),
    }
}
