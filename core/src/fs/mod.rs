// Filesystem extent discovery

pub mod fat32_extent;

pub use fat32_extent::{Fat32File, Fat32Volume};
