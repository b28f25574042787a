//! # Atomic BTRFS deployment tool
//!
//! This crate implements transactional image management for an
//! immutable, snapshot-based OS root: every mutation (package install,
//! removal, full upgrade, redeploy) becomes a new read-only BTRFS
//! subvolume that is validated before it is published as the next boot
//! target, and remains reversible via bootloader-level rollback.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

mod bootloader;
mod chroot;
pub mod cli;
mod error;
mod lock;
mod logfile;
mod metadata;
mod retention;
mod sanity;
mod snapshot;
mod status;
mod sysroot;
mod task;
mod transaction;
