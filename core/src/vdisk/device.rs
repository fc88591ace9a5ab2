//! Emulated block device
//!
//! Wraps any `SectorReader` as a read-only `gpt_disk_io::BlockIo`, so the
//! image can be handed to code that only knows how to talk to disks
//! (iso9660 mount, GPT scan, a boot loader's block protocol).
//!
//! In 512-byte mode a request is split into at most three native reads:
//!
//! ```text
//!   host lba:   S ...                                   S+C
//!               |-- lead --|====== whole 2048 ======|-- tail --|
//!   native:     S/4 bounce   one direct read          bounce
//! ```

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};

use super::error::VdiskError;
use super::resolver::SectorReader;
use super::{HostBlockSize, HOST_SECTORS_PER_IMAGE_SECTOR, HOST_SECTOR_SIZE, IMAGE_SECTOR_SIZE};
use crate::log_trace;

/// Media description published with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Media {
    pub block_size: u32,
    pub last_block: u64,
    pub read_only: bool,
    pub media_present: bool,
}

pub struct VirtualBlockDevice<R: SectorReader> {
    reader: R,
    media: Media,
    host: HostBlockSize,
    bounce: [u8; IMAGE_SECTOR_SIZE],
}

impl<R: SectorReader> VirtualBlockDevice<R> {
    /// Install a device over `reader`. The media size is fixed here from
    /// the reader's image size.
    pub fn new(reader: R, host: HostBlockSize) -> Result<Self, VdiskError> {
        let blocks = reader.image_size() / host.bytes() as u64;
        if blocks == 0 {
            return Err(VdiskError::InvalidParameter);
        }
        Ok(Self {
            reader,
            media: Media {
                block_size: host.bytes() as u32,
                last_block: blocks - 1,
                read_only: true,
                media_present: true,
            },
            host,
            bounce: [0u8; IMAGE_SECTOR_SIZE],
        })
    }

    pub fn media(&self) -> &Media {
        &self.media
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn into_reader(self) -> R {
        self.reader
    }

    /// Nothing to reset
    pub fn reset(&mut self, _extended: bool) -> Result<(), VdiskError> {
        Ok(())
    }

    /// Read whole host blocks starting at `lba`
    pub fn read(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), VdiskError> {
        let block_size = self.media.block_size as usize;
        if buffer.len() % block_size != 0 {
            return Err(VdiskError::InvalidBuffer);
        }
        if buffer.is_empty() {
            return Ok(());
        }
        let blocks = (buffer.len() / block_size) as u64;
        if lba > self.media.last_block || blocks > self.media.last_block + 1 - lba {
            return Err(VdiskError::ReadOverflow);
        }

        match self.host {
            HostBlockSize::Native2048 => self.reader.read_native(lba, buffer),
            HostBlockSize::Host512 => self.read_host512(lba, buffer),
        }
    }

    pub fn write(&mut self, _lba: u64, _buffer: &[u8]) -> Result<(), VdiskError> {
        Err(VdiskError::WriteProtected)
    }

    pub fn flush(&mut self) -> Result<(), VdiskError> {
        Ok(())
    }

    fn read_host512(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), VdiskError> {
        let per = HOST_SECTORS_PER_IMAGE_SECTOR;
        let total = buffer.len();
        let mut lba = lba;
        let mut pos = 0usize;

        let lead = (lba % per) as usize;
        if lead != 0 {
            log_trace!("512 mode: unaligned head");
            self.reader.read_native(lba / per, &mut self.bounce)?;
            let from = lead * HOST_SECTOR_SIZE;
            let take = (IMAGE_SECTOR_SIZE - from).min(total);
            buffer[..take].copy_from_slice(&self.bounce[from..from + take]);
            pos += take;
            lba += (take / HOST_SECTOR_SIZE) as u64;
        }

        let whole = (total - pos) / IMAGE_SECTOR_SIZE;
        if whole > 0 {
            let len = whole * IMAGE_SECTOR_SIZE;
            self.reader
                .read_native(lba / per, &mut buffer[pos..pos + len])?;
            pos += len;
            lba += whole as u64 * per;
        }

        if pos < total {
            log_trace!("512 mode: partial tail");
            self.reader.read_native(lba / per, &mut self.bounce)?;
            let rest = total - pos;
            buffer[pos..].copy_from_slice(&self.bounce[..rest]);
        }
        Ok(())
    }
}

impl<R: SectorReader> BlockIo for VirtualBlockDevice<R> {
    type Error = VdiskError;

    fn block_size(&self) -> BlockSize {
        BlockSize::new(self.media.block_size).unwrap_or(BlockSize::BS_512)
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok(self.media.last_block + 1)
    }

    fn read_blocks(&mut self, start_lba: Lba, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.read(start_lba.0, buffer)
    }

    fn write_blocks(&mut self, start_lba: Lba, buffer: &[u8]) -> Result<(), Self::Error> {
        self.write(start_lba.0, buffer)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        VirtualBlockDevice::flush(self)
    }
}
