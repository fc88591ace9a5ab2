//! Chain blob
//!
//! The loader hands everything over in one buffer: a fixed 2616-byte head
//! followed by the chunk, override and virtual tables. Table offsets in the
//! head are relative to the start of the blob.
//!
//! The virtual memory region starts at `virt_chunk_offset`, i.e. the
//! virtual records themselves occupy its first `virt_chunk_num * 24` bytes
//! and `mem_sector_offset` values point past them.
//!
//! # Head layout (4-byte packing)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 512  | os_param |
//! | 512    | 4    | disk_drive |
//! | 516    | 4    | drive_map |
//! | 520    | 4    | disk_sector_size |
//! | 524    | 8    | real_img_size_in_bytes |
//! | 532    | 8    | virt_img_size_in_bytes |
//! | 540    | 4    | boot_catalog |
//! | 544    | 2048 | boot_catalog_sector |
//! | 2592   | 4+4  | img_chunk_offset / num |
//! | 2600   | 4+4  | override_chunk_offset / num |
//! | 2608   | 4+4  | virt_chunk_offset / num |

use alloc::vec;
use alloc::vec::Vec;

use super::chunk::{ChunkList, IMG_CHUNK_SIZE};
use super::error::VdiskError;
use super::os_param::{OsParam, OS_PARAM_SIZE};
use super::overrides::{OverrideList, OVERRIDE_CHUNK_SIZE};
use super::resolver::ServingContext;
use super::virt::{VirtTable, VIRT_CHUNK_SIZE};
use super::{read_u32_le, read_u64_le, VdiskConfig};
use crate::log_info;

pub const CHAIN_HEAD_SIZE: usize = 2616;
pub const BOOT_CATALOG_SECTOR_SIZE: usize = 2048;

const OFF_DISK_DRIVE: usize = 512;
const OFF_DRIVE_MAP: usize = 516;
const OFF_DISK_SECTOR_SIZE: usize = 520;
const OFF_REAL_SIZE: usize = 524;
const OFF_VIRT_SIZE: usize = 532;
const OFF_BOOT_CATALOG: usize = 540;
const OFF_BOOT_CATALOG_SECTOR: usize = 544;
const OFF_TABLES: usize = OFF_BOOT_CATALOG_SECTOR + BOOT_CATALOG_SECTOR_SIZE;

#[derive(Debug, Clone)]
pub struct ChainHead {
    pub os_param: OsParam,
    /// BIOS drive number of the physical disk
    pub disk_drive: u32,
    pub drive_map: u32,
    pub disk_sector_size: u32,
    pub real_img_size_in_bytes: u64,
    pub virt_img_size_in_bytes: u64,
    /// Image sector of the El Torito boot catalog
    pub boot_catalog: u32,
    pub boot_catalog_sector: Vec<u8>,
    pub img_chunk_offset: u32,
    pub img_chunk_num: u32,
    pub override_chunk_offset: u32,
    pub override_chunk_num: u32,
    pub virt_chunk_offset: u32,
    pub virt_chunk_num: u32,
}

impl ChainHead {
    pub fn new(os_param: OsParam, disk_sector_size: u32, real_img_size: u64) -> Self {
        Self {
            os_param,
            disk_drive: 0,
            drive_map: 0,
            disk_sector_size,
            real_img_size_in_bytes: real_img_size,
            virt_img_size_in_bytes: real_img_size,
            boot_catalog: 0,
            boot_catalog_sector: vec![0u8; BOOT_CATALOG_SECTOR_SIZE],
            img_chunk_offset: 0,
            img_chunk_num: 0,
            override_chunk_offset: 0,
            override_chunk_num: 0,
            virt_chunk_offset: 0,
            virt_chunk_num: 0,
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, VdiskError> {
        if buf.len() < CHAIN_HEAD_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        let mut boot_catalog_sector = Vec::new();
        boot_catalog_sector.try_reserve_exact(BOOT_CATALOG_SECTOR_SIZE)?;
        boot_catalog_sector.extend_from_slice(&buf[OFF_BOOT_CATALOG_SECTOR..OFF_TABLES]);

        Ok(Self {
            os_param: OsParam::from_bytes(&buf[..OS_PARAM_SIZE])?,
            disk_drive: read_u32_le(buf, OFF_DISK_DRIVE),
            drive_map: read_u32_le(buf, OFF_DRIVE_MAP),
            disk_sector_size: read_u32_le(buf, OFF_DISK_SECTOR_SIZE),
            real_img_size_in_bytes: read_u64_le(buf, OFF_REAL_SIZE),
            virt_img_size_in_bytes: read_u64_le(buf, OFF_VIRT_SIZE),
            boot_catalog: read_u32_le(buf, OFF_BOOT_CATALOG),
            boot_catalog_sector,
            img_chunk_offset: read_u32_le(buf, OFF_TABLES),
            img_chunk_num: read_u32_le(buf, OFF_TABLES + 4),
            override_chunk_offset: read_u32_le(buf, OFF_TABLES + 8),
            override_chunk_num: read_u32_le(buf, OFF_TABLES + 12),
            virt_chunk_offset: read_u32_le(buf, OFF_TABLES + 16),
            virt_chunk_num: read_u32_le(buf, OFF_TABLES + 20),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), VdiskError> {
        if buf.len() < CHAIN_HEAD_SIZE
            || self.boot_catalog_sector.len() != BOOT_CATALOG_SECTOR_SIZE
        {
            return Err(VdiskError::InvalidBuffer);
        }
        buf[..OS_PARAM_SIZE].copy_from_slice(&self.os_param.to_bytes());

        let words = [
            (OFF_DISK_DRIVE, self.disk_drive),
            (OFF_DRIVE_MAP, self.drive_map),
            (OFF_DISK_SECTOR_SIZE, self.disk_sector_size),
            (OFF_BOOT_CATALOG, self.boot_catalog),
            (OFF_TABLES, self.img_chunk_offset),
            (OFF_TABLES + 4, self.img_chunk_num),
            (OFF_TABLES + 8, self.override_chunk_offset),
            (OFF_TABLES + 12, self.override_chunk_num),
            (OFF_TABLES + 16, self.virt_chunk_offset),
            (OFF_TABLES + 20, self.virt_chunk_num),
        ];
        for (off, value) in words {
            buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
        buf[OFF_REAL_SIZE..OFF_REAL_SIZE + 8]
            .copy_from_slice(&self.real_img_size_in_bytes.to_le_bytes());
        buf[OFF_VIRT_SIZE..OFF_VIRT_SIZE + 8]
            .copy_from_slice(&self.virt_img_size_in_bytes.to_le_bytes());
        buf[OFF_BOOT_CATALOG_SECTOR..OFF_TABLES].copy_from_slice(&self.boot_catalog_sector);
        Ok(())
    }

    /// Decode the head and check every table lies inside `blob`
    pub fn parse(blob: &[u8]) -> Result<Self, VdiskError> {
        let head = Self::from_bytes(blob)?;
        head.check_tables(blob)?;
        Ok(head)
    }

    /// Check each table lies past the head and inside `blob`, and that the
    /// real image fits the virtual one
    pub fn check_tables(&self, blob: &[u8]) -> Result<(), VdiskError> {
        let tables = [
            (self.img_chunk_offset, self.img_chunk_num, IMG_CHUNK_SIZE),
            (self.override_chunk_offset, self.override_chunk_num, OVERRIDE_CHUNK_SIZE),
            (self.virt_chunk_offset, self.virt_chunk_num, VIRT_CHUNK_SIZE),
        ];
        for (offset, num, record) in tables {
            if num == 0 {
                continue;
            }
            let end = (num as u64)
                .checked_mul(record as u64)
                .and_then(|len| len.checked_add(offset as u64));
            let fits = matches!(end, Some(end) if end <= blob.len() as u64);
            if (offset as usize) < CHAIN_HEAD_SIZE || !fits {
                log_info!("chain table outside blob");
                return Err(VdiskError::InvalidChain);
            }
        }
        if self.real_img_size_in_bytes > self.virt_img_size_in_bytes {
            log_info!("chain real size exceeds virtual size");
            return Err(VdiskError::InvalidChain);
        }
        Ok(())
    }

    /// Decode the three tables and build a serving context from them
    pub fn into_context(self, blob: &[u8], config: VdiskConfig) -> Result<ServingContext, VdiskError> {
        self.check_tables(blob)?;

        let chunks = ChunkList::from_records(
            table(blob, self.img_chunk_offset, self.img_chunk_num),
            self.img_chunk_num as usize,
        )?;
        let overrides = OverrideList::from_records(
            table(blob, self.override_chunk_offset, self.override_chunk_num),
            self.override_chunk_num as usize,
        )?;

        let virt = if self.virt_chunk_num == 0 {
            VirtTable::empty()
        } else {
            let region = &blob[self.virt_chunk_offset as usize..];
            let mut memory = Vec::new();
            memory.try_reserve_exact(region.len())?;
            memory.extend_from_slice(region);
            VirtTable::from_records(region, self.virt_chunk_num as usize, memory)?
        };

        Ok(
            ServingContext::new(chunks, overrides, virt, self.real_img_size_in_bytes, config)?
                .with_virtual_size(self.virt_img_size_in_bytes)
                .with_disk_sector_size(self.disk_sector_size),
        )
    }

    /// Assemble a blob: head, chunk records, override records, then the
    /// virtual region. The region of `virt` must reserve its first
    /// `len * 24` bytes for the records.
    pub fn build(
        mut self,
        chunks: &ChunkList,
        overrides: &OverrideList,
        virt: &VirtTable,
    ) -> Result<Vec<u8>, VdiskError> {
        let chunk_bytes = chunks.len() * IMG_CHUNK_SIZE;
        let override_bytes = overrides.len() * OVERRIDE_CHUNK_SIZE;
        let virt_records = virt.len() * VIRT_CHUNK_SIZE;
        let region = virt.memory().len().max(virt_records);

        let img_off = CHAIN_HEAD_SIZE;
        let ov_off = img_off + chunk_bytes;
        let virt_off = ov_off + override_bytes;
        let total = virt_off + region;

        self.img_chunk_offset = img_off as u32;
        self.img_chunk_num = chunks.len() as u32;
        self.override_chunk_offset = ov_off as u32;
        self.override_chunk_num = overrides.len() as u32;
        self.virt_chunk_offset = virt_off as u32;
        self.virt_chunk_num = virt.len() as u32;

        let mut blob = Vec::new();
        blob.try_reserve_exact(total)?;
        blob.resize(total, 0);

        self.write_to(&mut blob)?;
        chunks.write_records(&mut blob[img_off..ov_off])?;
        overrides.write_records(&mut blob[ov_off..virt_off])?;
        blob[virt_off..virt_off + virt.memory().len()].copy_from_slice(virt.memory());
        virt.write_records(&mut blob[virt_off..])?;
        Ok(blob)
    }

    /// Image bytes of a memdisk blob (head followed directly by the image)
    pub fn memdisk_image(blob: &[u8]) -> Result<&[u8], VdiskError> {
        if blob.len() < CHAIN_HEAD_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        Ok(&blob[CHAIN_HEAD_SIZE..])
    }
}

fn table(blob: &[u8], offset: u32, num: u32) -> &[u8] {
    if num == 0 {
        &[]
    } else {
        &blob[offset as usize..]
    }
}
