//! OS parameter block
//!
//! 512-byte record handed to the booted OS so it can find the physical
//! disk and the image path. Integrity is a GUID plus a one-byte checksum
//! chosen so that all 512 bytes sum to zero.
//!
//! # Layout (packed, little-endian)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 16   | guid |
//! | 16     | 1    | chksum |
//! | 17     | 16   | disk_guid |
//! | 33     | 8    | disk_size (bytes) |
//! | 41     | 2    | part_id (1-based) |
//! | 43     | 2    | part_type |
//! | 45     | 384  | img_path (UTF-8, NUL padded) |
//! | 429    | 8    | img_size (bytes) |
//! | 437    | 8    | location_addr (4KB aligned, 0 = none) |
//! | 445    | 4    | location_len |
//! | 449    | 32   | reserved u64 x4 |
//! | 481    | 31   | reserved bytes |

use uguid::{guid, Guid};

use super::error::VdiskError;
use super::{read_u16_le, read_u32_le, read_u64_le, LOCATION_ALIGN};

pub const OS_PARAM_SIZE: usize = 512;
pub const IMG_PATH_LEN: usize = 384;

/// Magic GUID identifying a parameter block
pub const OS_PARAM_GUID: Guid = guid!("77772020-2e77-6576-6e74-6f792e6e6574");

const OFF_CHKSUM: usize = 16;
const OFF_DISK_GUID: usize = 17;
const OFF_DISK_SIZE: usize = 33;
const OFF_PART_ID: usize = 41;
const OFF_PART_TYPE: usize = 43;
const OFF_IMG_PATH: usize = 45;
const OFF_IMG_SIZE: usize = 429;
const OFF_LOC_ADDR: usize = 437;
const OFF_LOC_LEN: usize = 445;
const OFF_RESERVED: usize = 449;
const OFF_RESERVED_TAIL: usize = 481;

/// File system holding the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PartitionFs {
    Exfat = 0,
    Ntfs = 1,
    Ext = 2,
    Xfs = 3,
    Udf = 4,
    Fat = 5,
}

impl PartitionFs {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Exfat),
            1 => Some(Self::Ntfs),
            2 => Some(Self::Ext),
            3 => Some(Self::Xfs),
            4 => Some(Self::Udf),
            5 => Some(Self::Fat),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exfat => "exfat",
            Self::Ntfs => "ntfs",
            Self::Ext => "ext*",
            Self::Xfs => "xfs",
            Self::Udf => "udf",
            Self::Fat => "fat",
        }
    }
}

#[derive(Clone)]
pub struct OsParam {
    pub guid: Guid,
    pub chksum: u8,
    pub disk_guid: [u8; 16],
    pub disk_size: u64,
    pub part_id: u16,
    /// Raw `PartitionFs` value; unknown values are preserved
    pub part_type: u16,
    pub img_path: [u8; IMG_PATH_LEN],
    pub img_size: u64,
    pub location_addr: u64,
    pub location_len: u32,
    pub reserved: [u64; 4],
    pub reserved_tail: [u8; 31],
}

impl OsParam {
    /// A fresh block with the magic GUID and everything else zero
    pub fn new() -> Self {
        Self {
            guid: OS_PARAM_GUID,
            chksum: 0,
            disk_guid: [0; 16],
            disk_size: 0,
            part_id: 0,
            part_type: 0,
            img_path: [0; IMG_PATH_LEN],
            img_size: 0,
            location_addr: 0,
            location_len: 0,
            reserved: [0; 4],
            reserved_tail: [0; 31],
        }
    }

    pub fn fs(&self) -> Option<PartitionFs> {
        PartitionFs::from_u16(self.part_type)
    }

    pub fn set_fs(&mut self, fs: PartitionFs) {
        self.part_type = fs as u16;
    }

    /// Store an image path, truncated to leave room for the terminator
    pub fn set_img_path(&mut self, path: &str) {
        self.img_path = [0; IMG_PATH_LEN];
        let bytes = path.as_bytes();
        let len = bytes.len().min(IMG_PATH_LEN - 1);
        self.img_path[..len].copy_from_slice(&bytes[..len]);
    }

    /// Image path up to the first NUL
    pub fn img_path_str(&self) -> &str {
        let end = self
            .img_path
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IMG_PATH_LEN);
        core::str::from_utf8(&self.img_path[..end]).unwrap_or("")
    }

    /// Record where the image location table was copied
    pub fn set_location(&mut self, addr: u64, len: u32) -> Result<(), VdiskError> {
        if addr % LOCATION_ALIGN != 0 {
            return Err(VdiskError::InvalidParameter);
        }
        self.location_addr = addr;
        self.location_len = len;
        Ok(())
    }

    /// Recompute `chksum` so the serialized block sums to zero
    pub fn update_checksum(&mut self) {
        self.chksum = 0;
        let sum = byte_sum(&self.to_bytes());
        self.chksum = 0u8.wrapping_sub(sum);
    }

    /// GUID matches and the bytes sum to zero
    pub fn verify(&self) -> bool {
        self.guid == OS_PARAM_GUID && byte_sum(&self.to_bytes()) == 0
    }

    /// Whether this block describes the disk with the given size and GUID.
    /// Some firmwares report one sector less than the loader saw.
    pub fn matches_disk(&self, disk_size: u64, disk_guid: &[u8; 16]) -> bool {
        (self.disk_size == disk_size || self.disk_size == disk_size + 512)
            && &self.disk_guid == disk_guid
    }

    pub fn to_bytes(&self) -> [u8; OS_PARAM_SIZE] {
        let mut out = [0u8; OS_PARAM_SIZE];
        out[0..16].copy_from_slice(&self.guid.to_bytes());
        out[OFF_CHKSUM] = self.chksum;
        out[OFF_DISK_GUID..OFF_DISK_GUID + 16].copy_from_slice(&self.disk_guid);
        out[OFF_DISK_SIZE..OFF_DISK_SIZE + 8].copy_from_slice(&self.disk_size.to_le_bytes());
        out[OFF_PART_ID..OFF_PART_ID + 2].copy_from_slice(&self.part_id.to_le_bytes());
        out[OFF_PART_TYPE..OFF_PART_TYPE + 2].copy_from_slice(&self.part_type.to_le_bytes());
        out[OFF_IMG_PATH..OFF_IMG_PATH + IMG_PATH_LEN].copy_from_slice(&self.img_path);
        out[OFF_IMG_SIZE..OFF_IMG_SIZE + 8].copy_from_slice(&self.img_size.to_le_bytes());
        out[OFF_LOC_ADDR..OFF_LOC_ADDR + 8].copy_from_slice(&self.location_addr.to_le_bytes());
        out[OFF_LOC_LEN..OFF_LOC_LEN + 4].copy_from_slice(&self.location_len.to_le_bytes());
        for (i, value) in self.reserved.iter().enumerate() {
            let off = OFF_RESERVED + i * 8;
            out[off..off + 8].copy_from_slice(&value.to_le_bytes());
        }
        out[OFF_RESERVED_TAIL..].copy_from_slice(&self.reserved_tail);
        out
    }

    /// Decode without any integrity check
    pub fn from_bytes(buf: &[u8]) -> Result<Self, VdiskError> {
        if buf.len() < OS_PARAM_SIZE {
            return Err(VdiskError::InvalidBuffer);
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&buf[0..16]);
        let mut disk_guid = [0u8; 16];
        disk_guid.copy_from_slice(&buf[OFF_DISK_GUID..OFF_DISK_GUID + 16]);
        let mut img_path = [0u8; IMG_PATH_LEN];
        img_path.copy_from_slice(&buf[OFF_IMG_PATH..OFF_IMG_PATH + IMG_PATH_LEN]);
        let mut reserved = [0u64; 4];
        for (i, value) in reserved.iter_mut().enumerate() {
            *value = read_u64_le(buf, OFF_RESERVED + i * 8);
        }
        let mut reserved_tail = [0u8; 31];
        reserved_tail.copy_from_slice(&buf[OFF_RESERVED_TAIL..OS_PARAM_SIZE]);

        Ok(Self {
            guid: Guid::from_bytes(guid),
            chksum: buf[OFF_CHKSUM],
            disk_guid,
            disk_size: read_u64_le(buf, OFF_DISK_SIZE),
            part_id: read_u16_le(buf, OFF_PART_ID),
            part_type: read_u16_le(buf, OFF_PART_TYPE),
            img_path,
            img_size: read_u64_le(buf, OFF_IMG_SIZE),
            location_addr: read_u64_le(buf, OFF_LOC_ADDR),
            location_len: read_u32_le(buf, OFF_LOC_LEN),
            reserved,
            reserved_tail,
        })
    }

    /// Decode and verify GUID and checksum
    pub fn parse(buf: &[u8]) -> Result<Self, VdiskError> {
        let param = Self::from_bytes(buf)?;
        if !param.verify() {
            return Err(VdiskError::ChecksumMismatch);
        }
        Ok(param)
    }

    /// Scan `memory` at 16-byte steps for the first valid block.
    ///
    /// Absence is not an error: plenty of boots have no parameter block.
    pub fn find(memory: &[u8]) -> Option<(usize, Self)> {
        let guid = OS_PARAM_GUID.to_bytes();
        let mut offset = 0;
        while offset + OS_PARAM_SIZE <= memory.len() {
            if memory[offset..offset + 16] == guid {
                if let Ok(param) = Self::parse(&memory[offset..offset + OS_PARAM_SIZE]) {
                    return Some((offset, param));
                }
            }
            offset += 16;
        }
        None
    }
}

impl Default for OsParam {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for OsParam {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OsParam")
            .field("chksum", &self.chksum)
            .field("disk_size", &self.disk_size)
            .field("part_id", &self.part_id)
            .field("part_type", &self.part_type)
            .field("img_path", &self.img_path_str())
            .field("img_size", &self.img_size)
            .field("location_addr", &self.location_addr)
            .field("location_len", &self.location_len)
            .finish()
    }
}

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}
