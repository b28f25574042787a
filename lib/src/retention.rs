//! Bounded deletion of old deployments.

use anyhow::Result;
use fn_error_context::context;

use crate::lock::{LockGuard, LOCK_PATH};
use crate::metadata;
use crate::snapshot;
use crate::sysroot::Sysroot;

/// How many deployments a clean sweep preserves.
const KEEP: usize = 5;

/// Delete all but the newest [`KEEP`] deployments. The current
/// deployment and one referenced by a pending transaction marker are
/// never deleted. Individual delete failures are reported and the
/// sweep continues; returns how many were actually removed.
#[context("Cleaning old deployments")]
pub(crate) fn clean(sysroot: &Sysroot) -> Result<usize> {
    let _lock = LockGuard::acquire(LOCK_PATH)?;
    let names = snapshot::list(sysroot)?;
    let current = sysroot.current_deployment()?;
    let marker = metadata::read_marker(sysroot)?;
    let mut protected = vec![current.as_str()];
    if let Some(m) = marker.as_ref() {
        protected.push(m.deployment.as_str());
    }
    let mut deleted = 0;
    for name in select_deletions(&names, KEEP, &protected) {
        match snapshot::delete(&sysroot.deployment_path(name)) {
            Ok(()) => {
                println!("Deleted {name}");
                deleted += 1;
            }
            Err(e) => tracing::warn!("Failed to delete {name}: {e:#}"),
        }
    }
    Ok(deleted)
}

/// Deletion candidates: `names` is sorted ascending, so the excess
/// beyond `keep` is its prefix, minus protected entries.
fn select_deletions<'a>(names: &'a [String], keep: usize, protected: &[&str]) -> Vec<&'a str> {
    let excess = names.len().saturating_sub(keep);
    names
        .iter()
        .take(excess)
        .map(String::as_str)
        .filter(|name| !protected.contains(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("hammer-2025010{i}000000")).collect()
    }

    #[test]
    fn test_select_deletions_keeps_newest_five() {
        let names = names(7);
        let victims = select_deletions(&names, KEEP, &[names[6].as_str()]);
        assert_eq!(victims, vec![names[0].as_str(), names[1].as_str()]);
    }

    #[test]
    fn test_select_deletions_noop_at_or_below_cap() {
        let five = names(5);
        assert!(select_deletions(&five, KEEP, &[]).is_empty());
        let three = names(3);
        assert!(select_deletions(&three, KEEP, &[]).is_empty());
    }

    #[test]
    fn test_select_deletions_spares_protected() {
        let names = names(7);
        // The oldest deployment is current; only the second-oldest goes.
        let victims = select_deletions(&names, KEEP, &[names[0].as_str()]);
        assert_eq!(victims, vec![names[1].as_str()]);
        // A pending-transaction reference is spared too
        let victims = select_deletions(&names, KEEP, &[names[6].as_str(), names[1].as_str()]);
        assert_eq!(victims, vec![names[0].as_str()]);
    }
}
