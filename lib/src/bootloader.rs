//! Generation of the GRUB menu fragment listing bootable deployments.
//!
//! The fragment is a `/etc/grub.d` drop-in whose content after the
//! two-line header is copied verbatim into the effective configuration
//! by `update-grub` (which runs inside the chroot, not here).

use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use indoc::indoc;

use crate::metadata::{DeployStatus, DeploymentMeta};

/// Relative path of the fragment inside a deployment.
const FRAGMENT_PATH: &str = "etc/grub.d/25_hammer_entries";
/// Maximum number of menu entries emitted.
const MAX_ENTRIES: usize = 5;

const HEADER: &str = indoc! {"
    #!/bin/sh
    exec tail -n +3 $0
"};

/// One bootable deployment in the menu.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MenuEntry {
    pub(crate) name: String,
    pub(crate) kernel: String,
}

/// Menu candidates: `ready` or `booted` deployments ordered newest
/// first, capped at [`MAX_ENTRIES`]. Deployments without a recorded
/// kernel cannot produce a bootable entry and are skipped.
pub(crate) fn select_entries(deployments: &[(String, DeploymentMeta)]) -> Vec<MenuEntry> {
    let mut candidates: Vec<&(String, DeploymentMeta)> = deployments
        .iter()
        .filter(|(_, m)| matches!(m.status, DeployStatus::Ready | DeployStatus::Booted))
        .filter(|(_, m)| !m.kernel.is_empty())
        .collect();
    candidates.sort_by(|a, b| b.1.created.cmp(&a.1.created));
    candidates
        .into_iter()
        .take(MAX_ENTRIES)
        .map(|(name, m)| MenuEntry {
            name: name.clone(),
            kernel: m.kernel.clone(),
        })
        .collect()
}

/// Render the full fragment for the given entries and filesystem UUID.
pub(crate) fn render_fragment(entries: &[MenuEntry], uuid: &str) -> String {
    let mut out = String::from(HEADER);
    for e in entries {
        out.push('\n');
        out.push_str(&render_entry(e, uuid));
    }
    out
}

fn render_entry(e: &MenuEntry, uuid: &str) -> String {
    let name = &e.name;
    let kernel = &e.kernel;
    format!(
        indoc! {"
            menuentry 'HammerOS ({name})' --class hammeros --class gnu-linux --class os {{
              insmod gzio; insmod part_gpt; insmod btrfs
              search --no-floppy --fs-uuid --set=root {uuid}
              linux /deployments/{name}/boot/vmlinuz-{kernel} root=UUID={uuid} rw rootflags=subvol=deployments/{name} quiet splash $vt_handoff
              initrd /deployments/{name}/boot/initrd.img-{kernel}
            }}
        "},
        name = name,
        kernel = kernel,
        uuid = uuid
    )
}

/// Install the fragment into a staged deployment with the executable
/// mode grub requires of `/etc/grub.d` drop-ins.
#[context("Writing bootloader fragment into {staged_root}")]
pub(crate) fn write_fragment(staged_root: &Utf8Path, content: &str) -> Result<()> {
    let path = staged_root.join(FRAGMENT_PATH);
    // SAFETY: the fragment path always has a parent
    let parent = path.parent().unwrap();
    std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    std::fs::write(&path, content).with_context(|| format!("Writing {path}"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Setting mode on {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(created_day: u32, status: DeployStatus, kernel: &str) -> DeploymentMeta {
        let mut m = DeploymentMeta::new("deploy", "hammer-0", kernel, "v", status);
        m.created = chrono::Utc
            .with_ymd_and_hms(2025, 1, created_day, 0, 0, 0)
            .unwrap();
        m
    }

    #[test]
    fn test_select_entries() {
        let deployments = vec![
            ("hammer-a".to_string(), meta(1, DeployStatus::Booted, "6.1.0-17")),
            ("hammer-b".to_string(), meta(2, DeployStatus::Broken, "6.1.0-17")),
            ("hammer-c".to_string(), meta(3, DeployStatus::Ready, "6.1.0-18")),
            ("hammer-d".to_string(), meta(4, DeployStatus::Ready, "")),
            ("hammer-e".to_string(), meta(5, DeployStatus::Previous, "6.1.0-18")),
        ];
        let entries = select_entries(&deployments);
        assert_eq!(
            entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["hammer-c", "hammer-a"]
        );
    }

    #[test]
    fn test_select_entries_caps_at_five() {
        let deployments: Vec<_> = (1..=7)
            .map(|day| {
                (
                    format!("hammer-{day}"),
                    meta(day, DeployStatus::Ready, "6.1.0-18"),
                )
            })
            .collect();
        let entries = select_entries(&deployments);
        assert_eq!(entries.len(), 5);
        // Newest first, oldest two dropped
        assert_eq!(entries[0].name, "hammer-7");
        assert_eq!(entries[4].name, "hammer-3");
    }

    #[test]
    fn test_render_fragment() {
        let entries = vec![MenuEntry {
            name: "hammer-20250101000000".to_string(),
            kernel: "6.1.0-18-amd64".to_string(),
        }];
        let uuid = "d1c1b3a8-8d5f-4f5e-9a9b-2b2a1a000000";
        let expected = indoc! {"
            #!/bin/sh
            exec tail -n +3 $0

            menuentry 'HammerOS (hammer-20250101000000)' --class hammeros --class gnu-linux --class os {
              insmod gzio; insmod part_gpt; insmod btrfs
              search --no-floppy --fs-uuid --set=root d1c1b3a8-8d5f-4f5e-9a9b-2b2a1a000000
              linux /deployments/hammer-20250101000000/boot/vmlinuz-6.1.0-18-amd64 root=UUID=d1c1b3a8-8d5f-4f5e-9a9b-2b2a1a000000 rw rootflags=subvol=deployments/hammer-20250101000000 quiet splash $vt_handoff
              initrd /deployments/hammer-20250101000000/boot/initrd.img-6.1.0-18-amd64
            }
        "};
        similar_asserts::assert_eq!(render_fragment(&entries, uuid), expected);
    }

    #[test]
    fn test_write_fragment_mode() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = camino::Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        write_fragment(&root, "#!/bin/sh\n")?;
        let path = root.join(FRAGMENT_PATH);
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        Ok(())
    }
}
