//! ISO-9660 sector overflow workaround
//!
//! Some loaders keep directory extent locations in 32-bit byte-derived
//! arithmetic. For an image larger than 4GB a directory whose extent sits
//! past sector 2097152 gets requested at `first_sector - 2097152` instead.
//! When a 16-byte directory-entry override points past the threshold, the
//! next requests for the wrapped location are translated back up.
//!
//! ```text
//!   Idle ──(16B dirent override applied, first_sector >= T)──► Armed
//!   Armed ──(lba + T == first_sector)──► Consuming
//!   Consuming ──(consumed >= ceil(size / 2048))──► Idle
//!   Armed | Consuming ──(lba == first_sector)──► Idle
//! ```

use super::overrides::{OverrideChunk, OverrideList};
use super::{image_sectors_for, read_u32_le};
use crate::log_info;

/// Size of a both-endian directory extent record
pub const DIRENT_OVERRIDE_SIZE: usize = 16;

/// ISO-9660 extent location and data length in both-endian form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentOverride {
    pub first_sector: u32,
    pub first_sector_be: u32,
    pub size: u32,
    pub size_be: u32,
}

impl DirentOverride {
    pub fn new(first_sector: u32, size: u32) -> Self {
        Self {
            first_sector,
            first_sector_be: first_sector.swap_bytes(),
            size,
            size_be: size.swap_bytes(),
        }
    }

    /// Decode from override payload bytes. Only the little-endian halves
    /// are meaningful.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < DIRENT_OVERRIDE_SIZE {
            return None;
        }
        Some(Self {
            first_sector: read_u32_le(buf, 0),
            first_sector_be: read_u32_le(buf, 4),
            size: read_u32_le(buf, 8),
            size_be: read_u32_le(buf, 12),
        })
    }

    pub fn to_bytes(&self) -> [u8; DIRENT_OVERRIDE_SIZE] {
        let mut out = [0u8; DIRENT_OVERRIDE_SIZE];
        out[0..4].copy_from_slice(&self.first_sector.to_le_bytes());
        out[4..8].copy_from_slice(&self.first_sector_be.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&self.size_be.to_le_bytes());
        out
    }

    fn of(chunk: &OverrideChunk) -> Option<Self> {
        if chunk.override_size as usize != DIRENT_OVERRIDE_SIZE {
            return None;
        }
        Self::from_bytes(chunk.data())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupState {
    Idle,
    /// A qualifying override was served; waiting for the wrapped request
    Armed,
    /// Translating the wrapped extent, `consumed` of `total` sectors done
    Consuming { consumed: u64, total: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct Iso9660Fixup {
    enabled: bool,
    threshold: u64,
    state: FixupState,
}

impl Iso9660Fixup {
    pub const fn new(enabled: bool, threshold: u64) -> Self {
        Self {
            enabled,
            threshold,
            state: FixupState::Idle,
        }
    }

    pub const fn disabled() -> Self {
        Self::new(false, super::ISO9660_SECTOR_OVERFLOW)
    }

    pub fn state(&self) -> FixupState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_active(&self) -> bool {
        self.state != FixupState::Idle
    }

    pub fn reset(&mut self) {
        self.state = FixupState::Idle;
    }

    /// Called for every override copied into a read
    pub fn observe_override(&mut self, chunk: &OverrideChunk) {
        if !self.enabled || self.state != FixupState::Idle {
            return;
        }
        if let Some(dirent) = DirentOverride::of(chunk) {
            if dirent.first_sector as u64 >= self.threshold {
                log_info!("iso9660 fixup armed");
                self.state = FixupState::Armed;
            }
        }
    }

    /// Translate a requested image LBA for a read of `count` sectors.
    ///
    /// Returns the LBA to actually serve. Leaves `lba` unchanged unless the
    /// request matches the wrapped location of an armed directory.
    pub fn translate(&mut self, lba: u64, count: u64, overrides: &OverrideList) -> u64 {
        if self.state == FixupState::Idle {
            return lba;
        }

        // A direct hit on the real extent means the loader did not wrap
        for chunk in overrides.iter() {
            if let Some(dirent) = DirentOverride::of(chunk) {
                if dirent.first_sector as u64 == lba {
                    log_info!("iso9660 fixup cancelled");
                    self.state = FixupState::Idle;
                    return lba;
                }
            }
        }

        match self.state {
            FixupState::Idle => lba,
            FixupState::Armed => {
                let Some(wrapped) = lba.checked_add(self.threshold) else {
                    return lba;
                };
                let target = overrides
                    .iter()
                    .filter_map(DirentOverride::of)
                    .find(|d| d.first_sector as u64 == wrapped);

                match target {
                    Some(dirent) => {
                        let total = image_sectors_for(dirent.size as u64);
                        self.state = if count >= total {
                            FixupState::Idle
                        } else {
                            FixupState::Consuming {
                                consumed: count,
                                total,
                            }
                        };
                        log_info!("iso9660 fixup translating wrapped extent");
                        wrapped
                    }
                    None => lba,
                }
            }
            FixupState::Consuming { consumed, total } => {
                // No wrapped request can sit this high; stop translating
                let Some(wrapped) = lba.checked_add(self.threshold) else {
                    log_info!("iso9660 fixup cancelled");
                    self.state = FixupState::Idle;
                    return lba;
                };
                let consumed = consumed.saturating_add(count);
                self.state = if consumed >= total {
                    FixupState::Idle
                } else {
                    FixupState::Consuming { consumed, total }
                };
                wrapped
            }
        }
    }
}

impl Default for Iso9660Fixup {
    fn default() -> Self {
        Self::disabled()
    }
}
