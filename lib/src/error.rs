//! The failure classes surfaced to users.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Failure classes for hammer operations. Each carries enough state to
/// render the user-visible message; ambient I/O failures stay as
/// [`anyhow`] context around these.
#[derive(Debug, Error)]
pub(crate) enum HammerError {
    /// The invoking user is not the superuser.
    #[error("This command requires root privileges")]
    NotRoot,
    /// Another invocation currently holds the transaction lock.
    #[error("Another operation is in progress (lock file {0} exists)")]
    ConcurrentOperation(Utf8PathBuf),
    /// The system does not satisfy the preconditions for a mutation.
    #[error("System validation failed: {0}")]
    ValidationFailed(String),
    /// A btrfs invocation returned non-zero.
    #[error("btrfs {operation} failed: {stderr}")]
    SnapshotError {
        /// The btrfs subcommand that failed.
        operation: String,
        /// Captured stderr of the failed invocation.
        stderr: String,
    },
    /// Bind-mount setup or teardown failed.
    #[error("Mount operation failed: {0}")]
    MountError(String),
    /// A command run inside the staged deployment returned non-zero.
    #[error("Command failed in chroot: {0}")]
    ChrootCommandFailed(String),
    /// The install probe found the package already present.
    #[error("Package {0} is already installed in the system")]
    AlreadyInstalled(String),
    /// The remove probe found the package absent.
    #[error("Package {0} is not installed in the system")]
    NotInstalled(String),
    /// The staged deployment failed pre-publish verification.
    #[error("Sanity check failed: {0}")]
    SanityFailed(String),
    /// Deployment metadata is missing or unparseable.
    #[error("Metadata error: {0}")]
    MetadataError(String),
}
