//! File replacement
//!
//! A loader can ask for a file inside the image (for example a boot
//! manager) to be swapped for content it synthesized into a virtual entry.
//! `FileReplaceList` names the files to intercept; `ReplacedFile` is the
//! byte stream served in their place.

use super::error::VdiskError;
use super::resolver::SectorReader;
use super::virt::{VirtChunk, VirtTable};
use super::{read_u32_le, IMAGE_SECTOR_SIZE};

pub const FILE_REPLACE_MAGIC: u32 = 0x1258_BEEF;
pub const FILE_REPLACE_LIST_SIZE: usize = 4 + MAX_OLD_NAMES * NAME_LEN + 4 + 4;

const MAX_OLD_NAMES: usize = 4;
const NAME_LEN: usize = 256;
const OFF_CNT: usize = 4 + MAX_OLD_NAMES * NAME_LEN;

#[derive(Clone)]
pub struct FileReplaceList {
    pub magic: u32,
    pub old_file_name: [[u8; NAME_LEN]; MAX_OLD_NAMES],
    pub old_file_cnt: u32,
    /// Index into the virtual table of the replacement content
    pub new_file_virtual_id: u32,
}

impl FileReplaceList {
    pub fn new(new_file_virtual_id: u32, names: &[&str]) -> Result<Self, VdiskError> {
        if names.len() > MAX_OLD_NAMES {
            return Err(VdiskError::InvalidParameter);
        }
        let mut old_file_name = [[0u8; NAME_LEN]; MAX_OLD_NAMES];
        for (slot, name) in old_file_name.iter_mut().zip(names) {
            let bytes = name.as_bytes();
            if bytes.len() >= NAME_LEN {
                return Err(VdiskError::InvalidParameter);
            }
            slot[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(Self {
            magic: FILE_REPLACE_MAGIC,
            old_file_name,
            old_file_cnt: names.len() as u32,
            new_file_virtual_id,
        })
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, VdiskError> {
        if buf.len() < FILE_REPLACE_LIST_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        let mut old_file_name = [[0u8; NAME_LEN]; MAX_OLD_NAMES];
        for (i, slot) in old_file_name.iter_mut().enumerate() {
            let off = 4 + i * NAME_LEN;
            slot.copy_from_slice(&buf[off..off + NAME_LEN]);
        }
        Ok(Self {
            magic: read_u32_le(buf, 0),
            old_file_name,
            old_file_cnt: read_u32_le(buf, OFF_CNT),
            new_file_virtual_id: read_u32_le(buf, OFF_CNT + 4),
        })
    }

    pub fn to_bytes(&self) -> [u8; FILE_REPLACE_LIST_SIZE] {
        let mut out = [0u8; FILE_REPLACE_LIST_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        for (i, name) in self.old_file_name.iter().enumerate() {
            let off = 4 + i * NAME_LEN;
            out[off..off + NAME_LEN].copy_from_slice(name);
        }
        out[OFF_CNT..OFF_CNT + 4].copy_from_slice(&self.old_file_cnt.to_le_bytes());
        out[OFF_CNT + 4..OFF_CNT + 8].copy_from_slice(&self.new_file_virtual_id.to_le_bytes());
        out
    }

    /// Names to intercept
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let cnt = (self.old_file_cnt as usize).min(MAX_OLD_NAMES);
        self.old_file_name[..cnt].iter().map(|raw| {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
            core::str::from_utf8(&raw[..end]).unwrap_or("")
        })
    }

    /// Magic is right and the target entry exists
    pub fn is_active(&self, virt_count: usize) -> bool {
        self.magic == FILE_REPLACE_MAGIC && (self.new_file_virtual_id as usize) < virt_count
    }

    pub fn matches(&self, name: &str) -> bool {
        !name.is_empty() && self.names().any(|n| n == name)
    }

    /// The replacement stream for `name`, if it should be intercepted
    pub fn resolve(&self, name: &str, virt: &VirtTable) -> Option<ReplacedFile> {
        if !self.is_active(virt.len()) || !self.matches(name) {
            return None;
        }
        virt.chunks()
            .get(self.new_file_virtual_id as usize)
            .map(ReplacedFile::open)
    }
}

impl core::fmt::Debug for FileReplaceList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileReplaceList")
            .field("magic", &self.magic)
            .field("old_file_cnt", &self.old_file_cnt)
            .field("new_file_virtual_id", &self.new_file_virtual_id)
            .finish()
    }
}

/// Read-only byte stream over the sectors of one virtual entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacedFile {
    /// First image sector of the content
    start_sector: u64,
    size: u64,
    position: u64,
}

impl ReplacedFile {
    /// The stream covers the virtual sectors followed by the remapped ones
    pub fn open(virt: &VirtChunk) -> Self {
        let sectors = virt.mem_sectors() as u64 + virt.remap_sectors() as u64;
        Self {
            start_sector: virt.mem_sector_start as u64,
            size: sectors * IMAGE_SECTOR_SIZE as u64,
            position: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Seek; positions past the end clamp to the end
    pub fn set_position(&mut self, position: u64) {
        self.position = position.min(self.size);
    }

    /// Read at the current position, returning the bytes copied
    pub fn read<R: SectorReader>(
        &mut self,
        reader: &mut R,
        buffer: &mut [u8],
    ) -> Result<usize, VdiskError> {
        let available = (self.size - self.position) as usize;
        let to_read = buffer.len().min(available);
        let mut sector_buf = [0u8; IMAGE_SECTOR_SIZE];
        let mut done = 0;

        while done < to_read {
            let pos = self.position + done as u64;
            let lba = self.start_sector + pos / IMAGE_SECTOR_SIZE as u64;
            let offset = (pos % IMAGE_SECTOR_SIZE as u64) as usize;
            let remaining = to_read - done;

            if offset == 0 && remaining >= IMAGE_SECTOR_SIZE {
                let whole = remaining / IMAGE_SECTOR_SIZE * IMAGE_SECTOR_SIZE;
                reader.read_native(lba, &mut buffer[done..done + whole])?;
                done += whole;
                continue;
            }

            reader.read_native(lba, &mut sector_buf)?;
            let copy_len = remaining.min(IMAGE_SECTOR_SIZE - offset);
            buffer[done..done + copy_len].copy_from_slice(&sector_buf[offset..offset + copy_len]);
            done += copy_len;
        }

        self.position += done as u64;
        Ok(done)
    }

    pub fn write(&mut self, _buffer: &[u8]) -> Result<usize, VdiskError> {
        Err(VdiskError::WriteProtected)
    }
}
