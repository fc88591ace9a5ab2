//! Override chunks
//!
//! Literal byte patches laid over raw image reads. Used to rewrite small
//! metadata regions (boot catalog pointers, directory records of a
//! synthesized boot image) without touching the backing file.

use alloc::vec::Vec;

use super::error::VdiskError;
use super::fixup::Iso9660Fixup;
use super::{read_u32_le, read_u64_le, OVERRIDE_DATA_SIZE};

/// Size of a packed override record
pub const OVERRIDE_CHUNK_SIZE: usize = 8 + 4 + OVERRIDE_DATA_SIZE;

/// A byte patch at an absolute image byte offset
#[derive(Clone, Copy)]
pub struct OverrideChunk {
    /// Image byte offset the patch starts at
    pub img_offset: u64,
    /// Number of valid bytes in `override_data`
    pub override_size: u32,
    pub override_data: [u8; OVERRIDE_DATA_SIZE],
}

impl OverrideChunk {
    /// Create a patch; `data` must fit the 512-byte payload
    pub fn new(img_offset: u64, data: &[u8]) -> Result<Self, VdiskError> {
        if data.len() > OVERRIDE_DATA_SIZE || img_offset.checked_add(data.len() as u64).is_none() {
            return Err(VdiskError::InvalidOverride);
        }
        let mut override_data = [0u8; OVERRIDE_DATA_SIZE];
        override_data[..data.len()].copy_from_slice(data);
        Ok(Self {
            img_offset,
            override_size: data.len() as u32,
            override_data,
        })
    }

    /// The patch bytes
    pub fn data(&self) -> &[u8] {
        &self.override_data[..self.override_size as usize]
    }

    /// Image byte range covered, end exclusive
    pub fn range(&self) -> (u64, u64) {
        (
            self.img_offset,
            self.img_offset.saturating_add(self.override_size as u64),
        )
    }

    pub fn to_bytes(&self) -> [u8; OVERRIDE_CHUNK_SIZE] {
        let mut out = [0u8; OVERRIDE_CHUNK_SIZE];
        out[0..8].copy_from_slice(&self.img_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.override_size.to_le_bytes());
        out[12..].copy_from_slice(&self.override_data);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, VdiskError> {
        if buf.len() < OVERRIDE_CHUNK_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        let img_offset = read_u64_le(buf, 0);
        let override_size = read_u32_le(buf, 8);
        if override_size as usize > OVERRIDE_DATA_SIZE
            || img_offset.checked_add(override_size as u64).is_none()
        {
            return Err(VdiskError::InvalidOverride);
        }
        let mut override_data = [0u8; OVERRIDE_DATA_SIZE];
        override_data.copy_from_slice(&buf[12..OVERRIDE_CHUNK_SIZE]);
        Ok(Self {
            img_offset,
            override_size,
            override_data,
        })
    }
}

impl core::fmt::Debug for OverrideChunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OverrideChunk")
            .field("img_offset", &self.img_offset)
            .field("override_size", &self.override_size)
            .finish()
    }
}

/// Ordered collection of override patches
#[derive(Debug, Clone, Default)]
pub struct OverrideList {
    entries: Vec<OverrideChunk>,
}

impl OverrideList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: OverrideChunk) -> Result<(), VdiskError> {
        self.entries.try_reserve(1)?;
        self.entries.push(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, OverrideChunk> {
        self.entries.iter()
    }

    /// Patch `buffer`, which holds image bytes `[read_start, read_end)`.
    ///
    /// Every override intersecting the read is copied in, clipped on both
    /// the source and destination side. Each applied override is reported
    /// to `fixup` so a directory-entry patch can arm it.
    pub fn apply(
        &self,
        buffer: &mut [u8],
        read_start: u64,
        read_end: u64,
        mut fixup: Option<&mut Iso9660Fixup>,
    ) {
        debug_assert!(buffer.len() as u64 >= read_end - read_start);

        for entry in &self.entries {
            let (ov_start, ov_end) = entry.range();
            if ov_start >= read_end || read_start >= ov_end {
                continue;
            }

            let lo = ov_start.max(read_start);
            let hi = ov_end.min(read_end);
            let src = &entry.override_data[(lo - ov_start) as usize..(hi - ov_start) as usize];
            let dst_off = (lo - read_start) as usize;
            buffer[dst_off..dst_off + src.len()].copy_from_slice(src);

            if let Some(fixup) = fixup.as_deref_mut() {
                fixup.observe_override(entry);
            }
        }
    }

    /// Serialize as consecutive 524-byte records
    pub fn write_records(&self, buffer: &mut [u8]) -> Result<usize, VdiskError> {
        let size = self.entries.len() * OVERRIDE_CHUNK_SIZE;
        if buffer.len() < size {
            return Err(VdiskError::InvalidBuffer);
        }
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = i * OVERRIDE_CHUNK_SIZE;
            buffer[offset..offset + OVERRIDE_CHUNK_SIZE].copy_from_slice(&entry.to_bytes());
        }
        Ok(size)
    }

    pub fn from_records(buffer: &[u8], count: usize) -> Result<Self, VdiskError> {
        let size = count
            .checked_mul(OVERRIDE_CHUNK_SIZE)
            .ok_or(VdiskError::InvalidBuffer)?;
        if buffer.len() < size {
            return Err(VdiskError::InvalidBuffer);
        }
        let mut entries = Vec::new();
        entries.try_reserve_exact(count)?;
        for record in buffer[..size].chunks_exact(OVERRIDE_CHUNK_SIZE) {
            entries.push(OverrideChunk::from_bytes(record)?);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> [u8; 50] {
        let mut data = [0u8; 50];
        for (i, b) in data.iter_mut().enumerate() {
            *b = 0xA0 + i as u8;
        }
        data
    }

    fn list_with(offset: u64, data: &[u8]) -> OverrideList {
        let mut list = OverrideList::new();
        list.push(OverrideChunk::new(offset, data).unwrap()).unwrap();
        list
    }

    #[test]
    fn test_override_inside_read() {
        let data = payload();
        let list = list_with(100, &data);
        let mut buf = [0x11u8; 120];
        list.apply(&mut buf, 80, 200, None);

        assert!(buf[..20].iter().all(|&b| b == 0x11));
        assert_eq!(&buf[20..70], &data[..]);
        assert!(buf[70..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_read_inside_override() {
        let data = payload();
        let list = list_with(100, &data);
        let mut buf = [0x11u8; 20];
        list.apply(&mut buf, 110, 130, None);
        assert_eq!(&buf[..], &data[10..30]);
    }

    #[test]
    fn test_override_straddles_left_edge() {
        let data = payload();
        let list = list_with(100, &data);
        let mut buf = [0x11u8; 40];
        list.apply(&mut buf, 130, 170, None);

        assert_eq!(&buf[..20], &data[30..50]);
        assert!(buf[20..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_override_straddles_right_edge() {
        let data = payload();
        let list = list_with(100, &data);
        let mut buf = [0x11u8; 40];
        list.apply(&mut buf, 70, 110, None);

        assert!(buf[..30].iter().all(|&b| b == 0x11));
        assert_eq!(&buf[30..40], &data[..10]);
    }

    #[test]
    fn test_disjoint_override_untouched() {
        let data = payload();
        let list = list_with(100, &data);
        let mut buf = [0x11u8; 100];
        list.apply(&mut buf, 0, 100, None);
        list.apply(&mut buf, 150, 250, None);
        assert!(buf.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = [0u8; OVERRIDE_DATA_SIZE + 1];
        assert_eq!(
            OverrideChunk::new(0, &big).unwrap_err(),
            VdiskError::InvalidOverride
        );
    }

    #[test]
    fn test_record_size_field_validated() {
        let chunk = OverrideChunk::new(4096, &[1, 2, 3]).unwrap();
        let mut bytes = chunk.to_bytes();
        assert_eq!(bytes.len(), 524);
        let decoded = OverrideChunk::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.img_offset, 4096);
        assert_eq!(decoded.data(), &[1, 2, 3]);

        bytes[8..12].copy_from_slice(&513u32.to_le_bytes());
        assert_eq!(
            OverrideChunk::from_bytes(&bytes).unwrap_err(),
            VdiskError::InvalidOverride
        );
    }

    #[test]
    fn test_override_end_must_not_wrap() {
        let mut bytes = OverrideChunk::new(0, &[7; 16]).unwrap().to_bytes();
        bytes[0..8].copy_from_slice(&(u64::MAX - 8).to_le_bytes());
        assert_eq!(
            OverrideChunk::from_bytes(&bytes).unwrap_err(),
            VdiskError::InvalidOverride
        );
        assert_eq!(
            OverrideChunk::new(u64::MAX, &[1]).unwrap_err(),
            VdiskError::InvalidOverride
        );
        assert!(OverrideChunk::new(u64::MAX, &[]).is_ok());
    }
}
