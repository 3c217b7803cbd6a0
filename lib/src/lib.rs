//! # Bootable distribution image builder
//!
//! This crate creates a bootable disk image of a Linux distribution
//! in a file or on a block device: partitioning, filesystems, package
//! bootstrap and the configuration needed to boot it with systemd-boot.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
mod distro;
mod install;
mod mount;
mod notify;

pub use distro::{DistroKind, DistroStep};
pub use install::BuildError;
