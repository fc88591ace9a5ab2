//! Memdisk fallback
//!
//! When the chunk list fails validation the loader reads the whole image
//! into memory and serves it from there.

use super::error::VdiskError;
use super::resolver::SectorReader;
use super::{image_sectors_for, IMAGE_SECTOR_SIZE};

pub struct MemDisk<D: AsRef<[u8]>> {
    data: D,
}

impl<D: AsRef<[u8]>> MemDisk<D> {
    pub fn new(data: D) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn into_inner(self) -> D {
        self.data
    }
}

impl<D: AsRef<[u8]>> SectorReader for MemDisk<D> {
    fn image_size(&self) -> u64 {
        self.data.as_ref().len() as u64
    }

    fn read_native(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), VdiskError> {
        if buffer.len() % IMAGE_SECTOR_SIZE != 0 {
            return Err(VdiskError::InvalidBuffer);
        }
        let data = self.data.as_ref();
        let sectors = (buffer.len() / IMAGE_SECTOR_SIZE) as u64;
        if lba + sectors > image_sectors_for(data.len() as u64) {
            return Err(VdiskError::ReadOverflow);
        }

        // The last sector may be partial
        let start = lba as usize * IMAGE_SECTOR_SIZE;
        let avail = (data.len() - start).min(buffer.len());
        buffer[..avail].copy_from_slice(&data[start..start + avail]);
        buffer[avail..].fill(0);
        Ok(())
    }
}
