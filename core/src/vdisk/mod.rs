//! Virtual Disk Engine
//!
//! Presents a disk image file (ISO or raw image) stored on a FAT/exFAT
//! partition as a directly attached, read-only block device, without ever
//! copying the image. Reads against the virtual device are resolved in
//! three tiers:
//!
//! ```text
//!   read(lba, n)
//!        │
//!        ├─ ISO-9660 overflow fixup (translate lba if active)
//!        │
//!        ├─ inside real image? ── yes ──► chunk list ──► backing BlockIo
//!        │                                     │
//!        │                                     └──► override patches
//!        │
//!        └─ no ──► virtual/remap table
//!                    ├─ virtual: copy from in-memory region
//!                    └─ remap:   coalesce runs ──► chunk list (as above)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut chunks = ChunkList::new()?;
//! fat32_file.get_block_list(&mut disk, &mut chunks, partition_start)?;
//! chunks.validate(image_size, partition_start, 512)?;
//!
//! let ctx = ServingContext::new(chunks, OverrideList::new(), VirtTable::empty(),
//!                               image_size, VdiskConfig::default())?;
//! let image = MappedImage::new(ctx, &mut disk)?;
//! let mut device = VirtualBlockDevice::new(image, HostBlockSize::Native2048)?;
//!
//! // Hand `device` to whatever expects a gpt_disk_io::BlockIo
//! let volume = iso9660::mount(&mut device, 0)?;
//! ```
//!
//! # Constraints
//!
//! - Image sectors are always 2048 bytes
//! - Backing disk sector size must divide 2048 (512, 1024 or 2048)
//! - Single-threaded; every mutable table lives in one `ServingContext`

mod chain;
mod chunk;
mod device;
mod error;
mod fixup;
mod location;
mod memdisk;
mod os_param;
mod overrides;
mod replace;
mod resolver;
mod virt;

pub use chain::{ChainHead, CHAIN_HEAD_SIZE, BOOT_CATALOG_SECTOR_SIZE};
pub use chunk::{ChunkList, ExtentSource, ImgChunk, IMG_CHUNK_SIZE};
pub use device::{Media, VirtualBlockDevice};
pub use error::VdiskError;
pub use fixup::{DirentOverride, FixupState, Iso9660Fixup, DIRENT_OVERRIDE_SIZE};
pub use location::{DiskRegion, ImageLocation, LOCATION_HEADER_SIZE, REGION_SIZE};
pub use memdisk::MemDisk;
pub use os_param::{OsParam, PartitionFs, OS_PARAM_GUID, OS_PARAM_SIZE, IMG_PATH_LEN};
pub use overrides::{OverrideChunk, OverrideList, OVERRIDE_CHUNK_SIZE};
pub use replace::{FileReplaceList, ReplacedFile, FILE_REPLACE_MAGIC, FILE_REPLACE_LIST_SIZE};
pub use resolver::{MappedImage, SectorFlag, SectorKind, SectorReader, ServingContext};
pub use virt::{SectorClass, VirtChunk, VirtTable, VIRT_CHUNK_SIZE};

/// Image (optical media) sector size
pub const IMAGE_SECTOR_SIZE: usize = 2048;

/// Host sector size offered in 512-byte mode
pub const HOST_SECTOR_SIZE: usize = 512;

/// Host sectors per image sector
pub const HOST_SECTORS_PER_IMAGE_SECTOR: u64 = (IMAGE_SECTOR_SIZE / HOST_SECTOR_SIZE) as u64;

/// Initial chunk list capacity
pub const DEFAULT_CHUNK_NUM: usize = 1024;

/// Payload capacity of a single override record
pub const OVERRIDE_DATA_SIZE: usize = 512;

/// Alignment of the image location table in runtime memory
pub const LOCATION_ALIGN: u64 = 4096;

/// Sector number past which some loaders wrap directory pointers (4GB / 2048)
pub const ISO9660_SECTOR_OVERFLOW: u64 = 2_097_152;

/// Block size the virtual device exposes to its consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBlockSize {
    /// 512-byte blocks, re-expressed internally as 2048-byte reads
    Host512,
    /// 2048-byte blocks, one per image sector
    Native2048,
}

impl HostBlockSize {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Host512 => HOST_SECTOR_SIZE,
            Self::Native2048 => IMAGE_SECTOR_SIZE,
        }
    }
}

/// Per-session configuration of the engine
#[derive(Debug, Clone, Copy)]
pub struct VdiskConfig {
    /// Block size exposed by `VirtualBlockDevice`
    pub host_block_size: HostBlockSize,
    /// Enable the ISO-9660 sector overflow workaround
    pub fixup_iso9660: bool,
    /// Sector count at which directory pointers are considered wrapped
    pub overflow_threshold: u64,
    /// Reject virtual/remap tables with overlapping ranges at setup
    pub check_virt_overlap: bool,
}

impl Default for VdiskConfig {
    fn default() -> Self {
        Self {
            host_block_size: HostBlockSize::Native2048,
            fixup_iso9660: false,
            overflow_threshold: ISO9660_SECTOR_OVERFLOW,
            check_virt_overlap: true,
        }
    }
}

/// Round a byte count up to whole image sectors
pub const fn image_sectors_for(bytes: u64) -> u64 {
    (bytes + IMAGE_SECTOR_SIZE as u64 - 1) / IMAGE_SECTOR_SIZE as u64
}

pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
