//! Read-only queries over the deployment history, plus the manual
//! read-only toggles on the current deployment.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::metadata::{self, DeploymentMeta};
use crate::snapshot;
use crate::sysroot::Sysroot;

/// One deployment in the history listing.
#[derive(Debug, Serialize)]
struct HistoryRow {
    deployment: String,
    current: bool,
    #[serde(flatten)]
    meta: Option<DeploymentMeta>,
}

/// Implementation of the `status` CLI command.
pub(crate) fn status(sysroot: &Sysroot, json: bool) -> Result<()> {
    let current = sysroot.current_deployment()?;
    let meta = metadata::read_meta(sysroot, &current)?;
    if json {
        let row = HistoryRow {
            deployment: current,
            current: true,
            meta: Some(meta),
        };
        let out = std::io::stdout();
        let mut out = out.lock();
        serde_json::to_writer_pretty(&mut out, &row).context("Writing to stdout")?;
        println!();
    } else {
        print!("{}", format_status(&current, &meta));
    }
    Ok(())
}

/// Implementation of the `history` CLI command.
pub(crate) fn history(sysroot: &Sysroot, json: bool) -> Result<()> {
    let rows = collect_history(sysroot)?;
    if json {
        let out = std::io::stdout();
        let mut out = out.lock();
        serde_json::to_writer_pretty(&mut out, &rows).context("Writing to stdout")?;
        println!();
    } else {
        print!("{}", format_history(&rows));
    }
    Ok(())
}

/// All deployments newest first, with the current one flagged.
fn collect_history(sysroot: &Sysroot) -> Result<Vec<HistoryRow>> {
    let current = sysroot.current_deployment().ok();
    let mut rows = Vec::new();
    for name in snapshot::list(sysroot)? {
        let meta = match metadata::read_meta(sysroot, &name) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!("No metadata for {name}: {e:#}");
                None
            }
        };
        let is_current = current.as_deref() == Some(name.as_str());
        rows.push(HistoryRow {
            deployment: name,
            current: is_current,
            meta,
        });
    }
    // Names are time-ordered by construction; created breaks ties for
    // records imported from elsewhere.
    rows.sort_by(|a, b| {
        let ka = (a.meta.as_ref().map(|m| m.created), &a.deployment);
        let kb = (b.meta.as_ref().map(|m| m.created), &b.deployment);
        kb.cmp(&ka)
    });
    Ok(rows)
}

fn format_status(name: &str, meta: &DeploymentMeta) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{name}");
    let _ = writeln!(
        out,
        "    Created: {}",
        meta.created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let _ = writeln!(out, "    Action: {}", meta.action);
    let _ = writeln!(out, "    Parent: {}", meta.parent);
    let _ = writeln!(out, "    Kernel: {}", meta.kernel);
    let _ = writeln!(out, "    System version: {}", meta.system_version);
    let _ = writeln!(out, "    Status: {}", meta.status);
    if let Some(reason) = meta.rollback_reason.as_deref() {
        let _ = writeln!(out, "    Rollback reason: {reason}");
    }
    out
}

fn format_history(rows: &[HistoryRow]) -> String {
    let mut out = String::new();
    for row in rows {
        let marker = if row.current { "*" } else { " " };
        let _ = writeln!(out, "{marker} {}", row.deployment);
        match row.meta.as_ref() {
            Some(meta) => {
                let _ = writeln!(
                    out,
                    "    Created: {}  Action: {}  Status: {}",
                    meta.created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    meta.action,
                    meta.status
                );
            }
            None => {
                let _ = writeln!(out, "    (missing metadata)");
            }
        }
    }
    out
}

/// Seal the current deployment and its nested subvolumes read-only.
pub(crate) fn lock(sysroot: &Sysroot) -> Result<()> {
    let current = sysroot.current_deployment()?;
    snapshot::set_readonly_recursive(sysroot, &sysroot.deployment_path(&current), true)?;
    println!("Locked {current}");
    Ok(())
}

/// Make the current deployment and its nested subvolumes writable for
/// manual surgery; `lock` undoes this.
pub(crate) fn unlock(sysroot: &Sysroot) -> Result<()> {
    let current = sysroot.current_deployment()?;
    snapshot::set_readonly_recursive(sysroot, &sysroot.deployment_path(&current), false)?;
    println!("Unlocked {current}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DeployStatus;
    use camino::Utf8PathBuf;
    use chrono::TimeZone;
    use indoc::indoc;

    fn test_sysroot() -> (tempfile::TempDir, Sysroot) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let sysroot = Sysroot::new(root);
        std::fs::create_dir(sysroot.deployments_dir()).unwrap();
        (td, sysroot)
    }

    fn add_deployment(sysroot: &Sysroot, name: &str, day: u32, status: DeployStatus) {
        std::fs::create_dir(sysroot.deployment_path(name)).unwrap();
        let mut meta = DeploymentMeta::new("deploy", "hammer-0", "6.1.0-18-amd64", "v", status);
        meta.created = chrono::Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap();
        metadata::write_meta(sysroot, name, &meta).unwrap();
    }

    #[test]
    fn test_format_status() {
        let mut meta = DeploymentMeta::new(
            "install vim",
            "hammer-20250101000000",
            "6.1.0-18-amd64",
            "deadbeef",
            DeployStatus::Previous,
        );
        meta.created = chrono::Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        meta.rollback_reason = Some("manual".to_string());
        let expected = indoc! {"
            hammer-20250102000000
                Created: 2025-01-02T00:00:00Z
                Action: install vim
                Parent: hammer-20250101000000
                Kernel: 6.1.0-18-amd64
                System version: deadbeef
                Status: previous
                Rollback reason: manual
        "};
        similar_asserts::assert_eq!(format_status("hammer-20250102000000", &meta), expected);
    }

    #[test]
    fn test_history_newest_first_with_current_marked() -> Result<()> {
        let (_td, sysroot) = test_sysroot();
        add_deployment(&sysroot, "hammer-20250101000000", 1, DeployStatus::Previous);
        add_deployment(&sysroot, "hammer-20250103000000", 3, DeployStatus::Booted);
        add_deployment(&sysroot, "hammer-20250102000000", 2, DeployStatus::Ready);
        sysroot.set_current("hammer-20250103000000")?;

        let rows = collect_history(&sysroot)?;
        assert_eq!(
            rows.iter().map(|r| r.deployment.as_str()).collect::<Vec<_>>(),
            vec![
                "hammer-20250103000000",
                "hammer-20250102000000",
                "hammer-20250101000000",
            ]
        );
        assert!(rows[0].current);
        assert!(!rows[1].current);

        let text = format_history(&rows);
        let expected = indoc! {"
            * hammer-20250103000000
                Created: 2025-01-03T00:00:00Z  Action: deploy  Status: booted
              hammer-20250102000000
                Created: 2025-01-02T00:00:00Z  Action: deploy  Status: ready
              hammer-20250101000000
                Created: 2025-01-01T00:00:00Z  Action: deploy  Status: previous
        "};
        similar_asserts::assert_eq!(text, expected);
        Ok(())
    }

    #[test]
    fn test_history_tolerates_missing_metadata() -> Result<()> {
        let (_td, sysroot) = test_sysroot();
        add_deployment(&sysroot, "hammer-20250102000000", 2, DeployStatus::Booted);
        std::fs::create_dir(sysroot.deployment_path("hammer-20250101000000"))?;
        sysroot.set_current("hammer-20250102000000")?;

        let rows = collect_history(&sysroot)?;
        // The record without metadata sorts last
        assert_eq!(rows[1].deployment, "hammer-20250101000000");
        assert!(format_history(&rows).contains("(missing metadata)"));
        Ok(())
    }
}
