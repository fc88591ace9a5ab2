//! Image chunk structures
//!
//! A chunk maps a contiguous run of 2048-byte image sectors onto a
//! contiguous run of backing disk sectors. The chunk list for an image is
//! built once when the image is opened and is read-only while serving.

use alloc::vec::Vec;
use gpt_disk_io::BlockIo;

use super::error::VdiskError;
use super::{image_sectors_for, read_u32_le, read_u64_le, DEFAULT_CHUNK_NUM, IMAGE_SECTOR_SIZE};
use crate::log_info;

/// Size of a packed chunk record
pub const IMG_CHUNK_SIZE: usize = 24;

/// One image fragment and where it lives on disk (all ranges inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImgChunk {
    /// First image sector (2048-byte units)
    pub img_start_sector: u32,
    /// Last image sector
    pub img_end_sector: u32,
    /// First disk sector (backing device units)
    pub disk_start_sector: u64,
    /// Last disk sector
    pub disk_end_sector: u64,
}

impl ImgChunk {
    pub const fn new(
        img_start_sector: u32,
        img_end_sector: u32,
        disk_start_sector: u64,
        disk_end_sector: u64,
    ) -> Self {
        Self {
            img_start_sector,
            img_end_sector,
            disk_start_sector,
            disk_end_sector,
        }
    }

    /// Number of image sectors covered
    pub const fn image_sectors(&self) -> u64 {
        self.img_end_sector as u64 + 1 - self.img_start_sector as u64
    }

    /// Number of disk sectors covered
    pub const fn disk_sectors(&self) -> u64 {
        self.disk_end_sector + 1 - self.disk_start_sector
    }

    /// Check whether an image sector falls inside this chunk
    pub const fn contains(&self, sector: u64) -> bool {
        sector >= self.img_start_sector as u64 && sector <= self.img_end_sector as u64
    }

    /// Translate an image sector inside this chunk to a disk sector
    pub const fn map_sector(&self, sector: u64, disk_sector_size: u64) -> u64 {
        (sector - self.img_start_sector as u64) * IMAGE_SECTOR_SIZE as u64 / disk_sector_size
            + self.disk_start_sector
    }

    /// Encode as the 24-byte little-endian record
    pub fn to_bytes(&self) -> [u8; IMG_CHUNK_SIZE] {
        let mut out = [0u8; IMG_CHUNK_SIZE];
        out[0..4].copy_from_slice(&self.img_start_sector.to_le_bytes());
        out[4..8].copy_from_slice(&self.img_end_sector.to_le_bytes());
        out[8..16].copy_from_slice(&self.disk_start_sector.to_le_bytes());
        out[16..24].copy_from_slice(&self.disk_end_sector.to_le_bytes());
        out
    }

    /// Decode a 24-byte record
    pub fn from_bytes(buf: &[u8]) -> Result<Self, VdiskError> {
        if buf.len() < IMG_CHUNK_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        Ok(Self {
            img_start_sector: read_u32_le(buf, 0),
            img_end_sector: read_u32_le(buf, 4),
            disk_start_sector: read_u64_le(buf, 8),
            disk_end_sector: read_u64_le(buf, 16),
        })
    }
}

/// Ordered, growable list of image chunks
#[derive(Debug, Clone, Default)]
pub struct ChunkList {
    chunks: Vec<ImgChunk>,
}

impl ChunkList {
    /// Create an empty list with the default up-front capacity
    pub fn new() -> Result<Self, VdiskError> {
        Self::with_capacity(DEFAULT_CHUNK_NUM)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, VdiskError> {
        let mut chunks = Vec::new();
        chunks.try_reserve_exact(capacity)?;
        Ok(Self { chunks })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.chunks.capacity()
    }

    pub fn get(&self, index: usize) -> Option<&ImgChunk> {
        self.chunks.get(index)
    }

    pub fn as_slice(&self) -> &[ImgChunk] {
        &self.chunks
    }

    pub fn iter(&self) -> core::slice::Iter<'_, ImgChunk> {
        self.chunks.iter()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Register an extent: image sectors `img_range` live at disk sectors `disk_range`
    pub fn append(
        &mut self,
        img_start: u32,
        img_end: u32,
        disk_start: u64,
        disk_end: u64,
    ) -> Result<(), VdiskError> {
        if img_start > img_end || disk_start > disk_end {
            return Err(VdiskError::InvalidParameter);
        }
        self.push(ImgChunk::new(img_start, img_end, disk_start, disk_end))
    }

    /// Add a chunk, doubling the backing array when full
    pub fn push(&mut self, chunk: ImgChunk) -> Result<(), VdiskError> {
        if self.chunks.len() == self.chunks.capacity() {
            let extra = self.chunks.capacity().max(DEFAULT_CHUNK_NUM);
            self.chunks.try_reserve_exact(extra)?;
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Find the chunk holding an image sector
    pub fn find(&self, sector: u64) -> Option<&ImgChunk> {
        self.chunks.iter().find(|c| c.contains(sector))
    }

    /// Sum of image sectors over all chunks
    pub fn total_image_sectors(&self) -> u64 {
        self.chunks.iter().map(ImgChunk::image_sectors).sum()
    }

    /// Sum of disk sectors over all chunks
    pub fn total_disk_sectors(&self) -> u64 {
        self.chunks.iter().map(ImgChunk::disk_sectors).sum()
    }

    /// Check the list describes exactly `file_size` bytes of a file stored
    /// inside the partition starting at `partition_start`.
    ///
    /// Image ranges must tile `[0, ceil(size/2048))` in order, disk ranges
    /// must lie past the partition start, increase strictly and cover exactly
    /// `ceil(size/disk_sector_size)` sectors. Anything else means the extent
    /// map cannot be served block-mapped.
    pub fn validate(
        &self,
        file_size: u64,
        partition_start: u64,
        disk_sector_size: u64,
    ) -> Result<(), VdiskError> {
        if self.chunks.is_empty() || disk_sector_size == 0 {
            log_info!("chunk list: empty or bad sector size");
            return Err(VdiskError::UnsupportedLayout);
        }

        let mut next_img = 0u64;
        let mut prev_disk_end: Option<u64> = None;

        for chunk in &self.chunks {
            if chunk.img_start_sector > chunk.img_end_sector
                || chunk.disk_start_sector > chunk.disk_end_sector
            {
                log_info!("chunk list: inverted range");
                return Err(VdiskError::UnsupportedLayout);
            }
            if chunk.disk_start_sector <= partition_start {
                log_info!("chunk list: disk start inside partition header");
                return Err(VdiskError::UnsupportedLayout);
            }
            if chunk.img_start_sector as u64 != next_img {
                log_info!("chunk list: image ranges not contiguous");
                return Err(VdiskError::UnsupportedLayout);
            }
            if let Some(prev_end) = prev_disk_end {
                if chunk.disk_start_sector <= prev_end {
                    log_info!("chunk list: disk ranges overlap or go backwards");
                    return Err(VdiskError::UnsupportedLayout);
                }
            }
            next_img = chunk.img_end_sector as u64 + 1;
            prev_disk_end = Some(chunk.disk_end_sector);
        }

        if next_img != image_sectors_for(file_size) {
            log_info!("chunk list: image sector total mismatch");
            return Err(VdiskError::UnsupportedLayout);
        }

        let disk_needed = (file_size + disk_sector_size - 1) / disk_sector_size;
        if self.total_disk_sectors() != disk_needed {
            log_info!("chunk list: disk sector total mismatch");
            return Err(VdiskError::UnsupportedLayout);
        }

        Ok(())
    }

    /// Shift every disk range by `start` (partition-relative → absolute)
    pub fn offset_disk(&mut self, start: u64) {
        if start == 0 {
            return;
        }
        for chunk in &mut self.chunks {
            chunk.disk_start_sector += start;
            chunk.disk_end_sector += start;
        }
    }

    /// Recompute image ranges from disk extents for raw (non-ISO) images,
    /// where every extent counts at least one image sector.
    pub fn renumber_raw_image(&mut self, disk_sector_size: u64) {
        let mut sector = 0u32;
        for chunk in &mut self.chunks {
            let bytes = chunk.disk_sectors() * disk_sector_size;
            let count = (bytes / IMAGE_SECTOR_SIZE as u64).max(1) as u32;
            chunk.img_start_sector = sector;
            chunk.img_end_sector = sector + count - 1;
            sector += count;
        }
    }

    /// Start recording disk reads issued while the file is streamed once.
    ///
    /// Fallback for file systems without an extent API: every underlying
    /// read is fed to `ReadHookRecorder::record`.
    pub fn read_hook(&mut self, log_sector_size: u32) -> ReadHookRecorder<'_> {
        ReadHookRecorder {
            chunks: self,
            bytes: 0,
            log_sector_size,
        }
    }

    /// Serialize as consecutive 24-byte records
    pub fn write_records(&self, buffer: &mut [u8]) -> Result<usize, VdiskError> {
        let size = self.chunks.len() * IMG_CHUNK_SIZE;
        if buffer.len() < size {
            return Err(VdiskError::InvalidBuffer);
        }
        for (i, chunk) in self.chunks.iter().enumerate() {
            let offset = i * IMG_CHUNK_SIZE;
            buffer[offset..offset + IMG_CHUNK_SIZE].copy_from_slice(&chunk.to_bytes());
        }
        Ok(size)
    }

    /// Decode `count` consecutive 24-byte records
    pub fn from_records(buffer: &[u8], count: usize) -> Result<Self, VdiskError> {
        let size = count
            .checked_mul(IMG_CHUNK_SIZE)
            .ok_or(VdiskError::InvalidBuffer)?;
        if buffer.len() < size {
            return Err(VdiskError::InvalidBuffer);
        }
        let mut list = Self::with_capacity(count)?;
        for record in buffer[..size].chunks_exact(IMG_CHUNK_SIZE) {
            list.push(ImgChunk::from_bytes(record)?)?;
        }
        Ok(list)
    }
}

impl<'a> IntoIterator for &'a ChunkList {
    type Item = &'a ImgChunk;
    type IntoIter = core::slice::Iter<'a, ImgChunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}

/// Builds a chunk list from the sequence of disk reads a file system
/// performs while a file is read front to back.
pub struct ReadHookRecorder<'a> {
    chunks: &'a mut ChunkList,
    /// File bytes accounted so far
    bytes: u64,
    log_sector_size: u32,
}

impl<'a> ReadHookRecorder<'a> {
    /// Record one underlying read of `len` bytes at partition-relative `disk_sector`
    pub fn record(&mut self, disk_sector: u64, len: u64) -> Result<(), VdiskError> {
        let disk_count = len >> self.log_sector_size;
        if disk_count == 0 {
            return Err(VdiskError::InvalidParameter);
        }

        let end_bytes = self.bytes + len;
        let img_end = (image_sectors_for(end_bytes) - 1) as u32;

        if let Some(last) = self.chunks.chunks.last_mut() {
            if last.disk_end_sector + 1 == disk_sector {
                last.disk_end_sector += disk_count;
                last.img_end_sector = img_end;
                self.bytes = end_bytes;
                return Ok(());
            }
        }

        let img_start = (self.bytes / IMAGE_SECTOR_SIZE as u64) as u32;
        self.chunks.push(ImgChunk::new(
            img_start,
            img_end,
            disk_sector,
            disk_sector + disk_count - 1,
        ))?;
        self.bytes = end_bytes;
        Ok(())
    }

    /// Bytes recorded so far
    pub fn recorded_bytes(&self) -> u64 {
        self.bytes
    }
}

/// File-system specific extent discovery for an open file
pub trait ExtentSource {
    /// Populate `chunks` with the file's on-disk layout. Disk sectors are
    /// absolute: `partition_start` is already added.
    fn get_block_list<B: BlockIo>(
        &self,
        block_io: &mut B,
        chunks: &mut ChunkList,
        partition_start: u64,
    ) -> Result<(), VdiskError>;
}
