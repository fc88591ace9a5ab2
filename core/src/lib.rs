//! Morpheus Virtual Disk Library
//!
//! Serves a disk image stored as a file on a FAT/exFAT partition as a
//! read-only block device, without copying it.
//! Designed to be no_std compatible.

#![no_std]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

pub mod fs;
pub mod logger;
pub mod vdisk;
