//! CRUD over the btrfs subvolumes backing deployments.
//!
//! Every operation shells out to `btrfs(8)`; a non-zero exit is
//! reported as [`HammerError::SnapshotError`] with the captured stderr.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::HammerError;
use crate::sysroot::{Sysroot, DEPLOYMENT_PREFIX};
use crate::task::Task;

fn run_btrfs(operation: &str, args: &[&str]) -> Result<String> {
    let o = Task::new(format!("btrfs {operation}"), "btrfs")
        .args(args)
        .quiet()
        .output()?;
    if !o.success {
        return Err(HammerError::SnapshotError {
            operation: operation.to_string(),
            stderr: o.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(o.stdout)
}

/// Pick a deployment name for the current wall-clock second. Names have
/// one-second resolution, so a second snapshot within the same second
/// gets a counter suffix instead of colliding.
fn disambiguate_name(base: &str, exists: impl Fn(&str) -> bool) -> String {
    if !exists(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Snapshot `src` into a new deployment, returning its basename.
#[context("Snapshotting {src}")]
pub(crate) fn create(sysroot: &Sysroot, src: &Utf8Path, writable: bool) -> Result<String> {
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let base = format!("{DEPLOYMENT_PREFIX}{timestamp}");
    let name = disambiguate_name(&base, |n| sysroot.deployment_path(n).exists());
    let dest = sysroot.deployment_path(&name);
    let mut args = vec!["subvolume", "snapshot"];
    if !writable {
        args.push("-r");
    }
    args.push(src.as_str());
    args.push(dest.as_str());
    run_btrfs("subvolume snapshot", &args)?;
    Ok(name)
}

/// Delete a deployment subvolume.
#[context("Deleting {path}")]
pub(crate) fn delete(path: &Utf8Path) -> Result<()> {
    run_btrfs("subvolume delete", &["subvolume", "delete", path.as_str()])?;
    Ok(())
}

/// Make the subvolume the filesystem's default mount. This is the
/// publish step; the next boot resolves the root through it.
#[context("Setting default subvolume to {path}")]
pub(crate) fn set_default(sysroot: &Sysroot, path: &Utf8Path) -> Result<()> {
    let id = get_id(path)?;
    run_btrfs(
        "subvolume set-default",
        &[
            "subvolume",
            "set-default",
            &id.to_string(),
            sysroot.path().as_str(),
        ],
    )?;
    Ok(())
}

pub(crate) fn set_readonly(path: &Utf8Path, readonly: bool) -> Result<()> {
    let value = if readonly { "true" } else { "false" };
    run_btrfs(
        "property set",
        &["property", "set", "-ts", path.as_str(), "ro", value],
    )?;
    Ok(())
}

pub(crate) fn get_readonly(path: &Utf8Path) -> Result<bool> {
    let out = run_btrfs("property get", &["property", "get", "-ts", path.as_str(), "ro"])?;
    parse_ro_property(&out).ok_or_else(|| {
        HammerError::SnapshotError {
            operation: "property get".to_string(),
            stderr: format!("unexpected output {:?}", out.trim()),
        }
        .into()
    })
}

/// Toggle the read-only property on a subvolume and every subvolume
/// nested beneath it. Children are sealed before their parent and
/// unsealed after it.
#[context("Toggling read-only on {path}")]
pub(crate) fn set_readonly_recursive(
    sysroot: &Sysroot,
    path: &Utf8Path,
    readonly: bool,
) -> Result<()> {
    let rel = path.strip_prefix(sysroot.path()).unwrap_or(path);
    let out = run_btrfs("subvolume list", &["subvolume", "list", sysroot.path().as_str()])?;
    let mut nested: Vec<Utf8PathBuf> = parse_subvolume_list_paths(&out)
        .into_iter()
        .map(Utf8PathBuf::from)
        .filter(|p| p.starts_with(rel) && p.as_path() != rel)
        .map(|p| sysroot.path().join(p))
        .collect();
    // Deepest first when sealing, shallowest first when unsealing.
    nested.sort_by_key(|p| p.components().count());
    if readonly {
        for p in nested.iter().rev() {
            set_readonly(p, true)?;
        }
        set_readonly(path, true)?;
    } else {
        set_readonly(path, false)?;
        for p in &nested {
            set_readonly(p, false)?;
        }
    }
    Ok(())
}

/// Numeric subvolume id, parsed from `btrfs subvolume show`.
#[context("Querying subvolume id of {path}")]
pub(crate) fn get_id(path: &Utf8Path) -> Result<u64> {
    let out = run_btrfs("subvolume show", &["subvolume", "show", path.as_str()])?;
    parse_subvolume_id(&out).ok_or_else(|| {
        HammerError::SnapshotError {
            operation: "subvolume show".to_string(),
            stderr: "no subvolume id in output".to_string(),
        }
        .into()
    })
}

/// UUID of the filesystem holding the sysroot, parsed from
/// `btrfs filesystem show`.
#[context("Querying filesystem uuid")]
pub(crate) fn get_uuid(sysroot: &Sysroot) -> Result<String> {
    let out = run_btrfs(
        "filesystem show",
        &["filesystem", "show", sysroot.path().as_str()],
    )?;
    parse_filesystem_uuid(&out).ok_or_else(|| {
        HammerError::SnapshotError {
            operation: "filesystem show".to_string(),
            stderr: "no uuid in output".to_string(),
        }
        .into()
    })
}

/// Enumerate deployments, sorted ascending by name (and thereby by
/// creation time).
#[context("Listing deployments")]
pub(crate) fn list(sysroot: &Sysroot) -> Result<Vec<String>> {
    let dir = sysroot.deployments_dir();
    let mut names = Vec::new();
    for entry in dir.read_dir_utf8().with_context(|| format!("Reading {dir}"))? {
        let entry = entry?;
        let name = entry.file_name();
        if name.starts_with(DEPLOYMENT_PREFIX) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn parse_ro_property(output: &str) -> Option<bool> {
    match output.trim() {
        "ro=true" => Some(true),
        "ro=false" => Some(false),
        _ => None,
    }
}

fn parse_subvolume_id(show_output: &str) -> Option<u64> {
    show_output.lines().find_map(|l| {
        l.trim_start()
            .strip_prefix("Subvolume ID:")
            .and_then(|v| v.trim().parse().ok())
    })
}

fn parse_filesystem_uuid(show_output: &str) -> Option<String> {
    show_output
        .lines()
        .find_map(|l| l.split("uuid:").nth(1).map(|v| v.trim().to_string()))
        .filter(|s| !s.is_empty())
}

/// Extract the `path` field of each `btrfs subvolume list` line; paths
/// are relative to the top of the filesystem.
fn parse_subvolume_list_paths(list_output: &str) -> Vec<String> {
    list_output
        .lines()
        .filter_map(|l| l.split(" path ").nth(1).map(|p| p.trim().to_string()))
        .collect()
}
