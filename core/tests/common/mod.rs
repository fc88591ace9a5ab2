//! Common test utilities and mock block devices

#![allow(dead_code)]

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};
use std::io;

/// In-memory block device that logs every read as `(lba, blocks)`
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    pub data: Vec<u8>,
    pub block_size: usize,
    pub reads: Vec<(u64, u64)>,
    pub fail_reads: bool,
}

impl MemoryBlockDevice {
    pub fn new(data: Vec<u8>, block_size: usize) -> Self {
        Self {
            data,
            block_size,
            reads: Vec::new(),
            fail_reads: false,
        }
    }

    /// `blocks` blocks where every byte of block N is `N as u8`
    pub fn patterned(blocks: usize, block_size: usize) -> Self {
        let mut data = vec![0u8; blocks * block_size];
        for (i, block) in data.chunks_exact_mut(block_size).enumerate() {
            block.fill(i as u8);
        }
        Self::new(data, block_size)
    }

    pub fn clear_reads(&mut self) {
        self.reads.clear();
    }
}

impl BlockIo for MemoryBlockDevice {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        BlockSize::new(self.block_size as u32).expect("valid block size")
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok((self.data.len() / self.block_size) as u64)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        if self.fail_reads {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let offset = start_lba.0 as usize * self.block_size;
        if offset + dst.len() > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond end of device",
            ));
        }
        self.reads
            .push((start_lba.0, (dst.len() / self.block_size) as u64));
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
        let offset = start_lba.0 as usize * self.block_size;
        if offset + src.len() > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write beyond end of device",
            ));
        }
        self.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Lay `image` out on a 512-byte-sector disk in the given fragments.
///
/// Each fragment is `(image_sector_start, image_sector_count, disk_lba)`.
pub fn scatter_image(image: &[u8], fragments: &[(usize, usize, u64)], disk_blocks: usize) -> MemoryBlockDevice {
    let mut data = vec![0u8; disk_blocks * 512];
    for &(img_start, count, disk_lba) in fragments {
        let src_start = img_start * 2048;
        let src_end = (src_start + count * 2048).min(image.len());
        let dst = disk_lba as usize * 512;
        data[dst..dst + (src_end - src_start)].copy_from_slice(&image[src_start..src_end]);
    }
    MemoryBlockDevice::new(data, 512)
}

/// Image bytes with a recognizable per-offset pattern
pub fn pattern_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
