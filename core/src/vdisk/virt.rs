//! Virtual/remap table
//!
//! Sectors past the end of the real image are synthesized. A virtual range
//! is served from a memory region the loader built at setup; a remap range
//! aliases sectors that do exist in the real image.

use alloc::vec::Vec;

use super::error::VdiskError;
use super::{read_u32_le, IMAGE_SECTOR_SIZE};
use crate::log_info;

/// Size of a packed virtual/remap record
pub const VIRT_CHUNK_SIZE: usize = 24;

/// One virtual/remap entry. Both ranges are half-open image sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtChunk {
    pub mem_sector_start: u32,
    pub mem_sector_end: u32,
    /// Byte offset of the first virtual sector in the memory region
    pub mem_sector_offset: u32,
    pub remap_sector_start: u32,
    pub remap_sector_end: u32,
    /// Real image sector that `remap_sector_start` aliases
    pub org_sector_start: u32,
}

impl VirtChunk {
    pub fn mem_sectors(&self) -> u32 {
        self.mem_sector_end.saturating_sub(self.mem_sector_start)
    }

    pub fn remap_sectors(&self) -> u32 {
        self.remap_sector_end.saturating_sub(self.remap_sector_start)
    }

    pub fn to_bytes(&self) -> [u8; VIRT_CHUNK_SIZE] {
        let mut out = [0u8; VIRT_CHUNK_SIZE];
        let fields = [
            self.mem_sector_start,
            self.mem_sector_end,
            self.mem_sector_offset,
            self.remap_sector_start,
            self.remap_sector_end,
            self.org_sector_start,
        ];
        for (slot, value) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, VdiskError> {
        if buf.len() < VIRT_CHUNK_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        Ok(Self {
            mem_sector_start: read_u32_le(buf, 0),
            mem_sector_end: read_u32_le(buf, 4),
            mem_sector_offset: read_u32_le(buf, 8),
            remap_sector_start: read_u32_le(buf, 12),
            remap_sector_end: read_u32_le(buf, 16),
            org_sector_start: read_u32_le(buf, 20),
        })
    }
}

/// Result of looking a sector up in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorClass {
    None,
    /// Byte offset of the sector's 2048 bytes in the memory region
    Virtual { offset: usize },
    /// Real image sector holding the content
    Remap { org_sector: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct VirtTable {
    chunks: Vec<VirtChunk>,
    memory: Vec<u8>,
}

impl VirtTable {
    pub const fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            memory: Vec::new(),
        }
    }

    /// Build a table over an owned memory region. Every virtual range must
    /// lie entirely inside `memory`.
    pub fn new(chunks: Vec<VirtChunk>, memory: Vec<u8>) -> Result<Self, VdiskError> {
        for chunk in &chunks {
            if chunk.mem_sector_start > chunk.mem_sector_end
                || chunk.remap_sector_start > chunk.remap_sector_end
            {
                return Err(VdiskError::InvalidParameter);
            }
            let span_end = chunk.mem_sector_offset as u64
                + chunk.mem_sectors() as u64 * IMAGE_SECTOR_SIZE as u64;
            if chunk.mem_sectors() > 0 && span_end > memory.len() as u64 {
                log_info!("virtual range exceeds memory region");
                return Err(VdiskError::UnsupportedLayout);
            }
        }
        Ok(Self { chunks, memory })
    }

    pub fn from_records(
        buffer: &[u8],
        count: usize,
        memory: Vec<u8>,
    ) -> Result<Self, VdiskError> {
        let size = count
            .checked_mul(VIRT_CHUNK_SIZE)
            .ok_or(VdiskError::InvalidBuffer)?;
        if buffer.len() < size {
            return Err(VdiskError::InvalidBuffer);
        }
        let mut chunks = Vec::new();
        chunks.try_reserve_exact(count)?;
        for record in buffer[..size].chunks_exact(VIRT_CHUNK_SIZE) {
            chunks.push(VirtChunk::from_bytes(record)?);
        }
        Self::new(chunks, memory)
    }

    pub fn write_records(&self, buffer: &mut [u8]) -> Result<usize, VdiskError> {
        let size = self.chunks.len() * VIRT_CHUNK_SIZE;
        if buffer.len() < size {
            return Err(VdiskError::InvalidBuffer);
        }
        for (slot, chunk) in buffer.chunks_exact_mut(VIRT_CHUNK_SIZE).zip(&self.chunks) {
            slot.copy_from_slice(&chunk.to_bytes());
        }
        Ok(size)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[VirtChunk] {
        &self.chunks
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// First match in table order; the virtual range of an entry wins over
    /// its remap range.
    pub fn classify(&self, sector: u64) -> SectorClass {
        for chunk in &self.chunks {
            let mem = chunk.mem_sector_start as u64..chunk.mem_sector_end as u64;
            let remap = chunk.remap_sector_start as u64..chunk.remap_sector_end as u64;

            if mem.contains(&sector) {
                let offset = chunk.mem_sector_offset as usize
                    + (sector - mem.start) as usize * IMAGE_SECTOR_SIZE;
                return SectorClass::Virtual { offset };
            }
            if remap.contains(&sector) {
                return SectorClass::Remap {
                    org_sector: chunk.org_sector_start as u64 + (sector - remap.start),
                };
            }
        }
        SectorClass::None
    }

    /// The 2048 bytes of a virtual sector
    pub fn virtual_sector(&self, offset: usize) -> &[u8] {
        &self.memory[offset..offset + IMAGE_SECTOR_SIZE]
    }

    /// Reject tables where any two non-empty ranges overlap, across all
    /// entries and both range kinds.
    pub fn check_overlaps(&self) -> Result<(), VdiskError> {
        let ranges = || {
            self.chunks.iter().flat_map(|c| {
                [
                    (c.mem_sector_start, c.mem_sector_end),
                    (c.remap_sector_start, c.remap_sector_end),
                ]
            })
        };

        for (i, (a_start, a_end)) in ranges().enumerate() {
            if a_start == a_end {
                continue;
            }
            for (b_start, b_end) in ranges().skip(i + 1) {
                if b_start == b_end {
                    continue;
                }
                if a_start < b_end && b_start < a_end {
                    log_info!("virtual table ranges overlap");
                    return Err(VdiskError::InvalidParameter);
                }
            }
        }
        Ok(())
    }
}
