//! Image location table
//!
//! Copy of the chunk list in a stable format, left in runtime memory for
//! the booted OS (its address goes into `OsParam::location_addr`). An OS
//! side driver uses it to read the image straight off the physical disk.
//!
//! Header is 28 bytes (guid, image sector size, disk sector size, region
//! count) followed by one 16-byte record per region.

use alloc::vec::Vec;
use uguid::Guid;

use super::chunk::ChunkList;
use super::error::VdiskError;
use super::os_param::OS_PARAM_GUID;
use super::{read_u32_le, read_u64_le, IMAGE_SECTOR_SIZE};

pub const LOCATION_HEADER_SIZE: usize = 28;
pub const REGION_SIZE: usize = 16;

/// One contiguous run of the image on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskRegion {
    pub image_sector_count: u32,
    pub image_start_sector: u32,
    pub disk_start_sector: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLocation {
    pub guid: Guid,
    pub image_sector_size: u32,
    pub disk_sector_size: u32,
    pub regions: Vec<DiskRegion>,
}

impl ImageLocation {
    pub fn from_chunks(chunks: &ChunkList, disk_sector_size: u32) -> Result<Self, VdiskError> {
        let mut regions = Vec::new();
        regions.try_reserve_exact(chunks.len())?;
        for chunk in chunks {
            regions.push(DiskRegion {
                image_sector_count: chunk.image_sectors() as u32,
                image_start_sector: chunk.img_start_sector,
                disk_start_sector: chunk.disk_start_sector,
            });
        }
        Ok(Self {
            guid: OS_PARAM_GUID,
            image_sector_size: IMAGE_SECTOR_SIZE as u32,
            disk_sector_size,
            regions,
        })
    }

    /// Bytes needed to serialize
    pub fn encoded_len(&self) -> usize {
        LOCATION_HEADER_SIZE + self.regions.len() * REGION_SIZE
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, VdiskError> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(VdiskError::InvalidBuffer);
        }
        buf[0..16].copy_from_slice(&self.guid.to_bytes());
        buf[16..20].copy_from_slice(&self.image_sector_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.disk_sector_size.to_le_bytes());
        buf[24..28].copy_from_slice(&(self.regions.len() as u32).to_le_bytes());

        let body = &mut buf[LOCATION_HEADER_SIZE..len];
        for (slot, region) in body.chunks_exact_mut(REGION_SIZE).zip(&self.regions) {
            slot[0..4].copy_from_slice(&region.image_sector_count.to_le_bytes());
            slot[4..8].copy_from_slice(&region.image_start_sector.to_le_bytes());
            slot[8..16].copy_from_slice(&region.disk_start_sector.to_le_bytes());
        }
        Ok(len)
    }

    pub fn parse(buf: &[u8]) -> Result<Self, VdiskError> {
        if buf.len() < LOCATION_HEADER_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&buf[0..16]);
        let guid = Guid::from_bytes(guid);
        if guid != OS_PARAM_GUID {
            return Err(VdiskError::ChecksumMismatch);
        }

        let count = read_u32_le(buf, 24) as usize;
        let len = count
            .checked_mul(REGION_SIZE)
            .and_then(|n| n.checked_add(LOCATION_HEADER_SIZE))
            .ok_or(VdiskError::InvalidBuffer)?;
        if buf.len() < len {
            return Err(VdiskError::InvalidBuffer);
        }

        let mut regions = Vec::new();
        regions.try_reserve_exact(count)?;
        for record in buf[LOCATION_HEADER_SIZE..len].chunks_exact(REGION_SIZE) {
            regions.push(DiskRegion {
                image_sector_count: read_u32_le(record, 0),
                image_start_sector: read_u32_le(record, 4),
                disk_start_sector: read_u64_le(record, 8),
            });
        }

        Ok(Self {
            guid,
            image_sector_size: read_u32_le(buf, 16),
            disk_sector_size: read_u32_le(buf, 20),
            regions,
        })
    }

    /// Disk sector holding the start of an image sector
    pub fn map_sector(&self, image_sector: u64) -> Option<u64> {
        if self.disk_sector_size == 0 {
            return None;
        }
        self.regions.iter().find_map(|r| {
            let start = r.image_start_sector as u64;
            if image_sector >= start && image_sector < start + r.image_sector_count as u64 {
                Some(
                    (image_sector - start) * self.image_sector_size as u64
                        / self.disk_sector_size as u64
                        + r.disk_start_sector,
                )
            } else {
                None
            }
        })
    }
}
