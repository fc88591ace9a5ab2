// Raw disk image file as a BlockIo backing store

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

pub struct FileDisk {
    file: File,
    block_size: BlockSize,
    len: u64,
}

impl FileDisk {
    pub fn open(path: &Path, block_size: u32) -> io::Result<Self> {
        let block_size = BlockSize::new(block_size).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "unsupported disk sector size")
        })?;
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            block_size,
            len,
        })
    }
}

impl BlockIo for FileDisk {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok(self.len / self.block_size.to_u64())
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        let offset = start_lba.0 * self.block_size.to_u64();
        if offset + dst.len() as u64 > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond end of disk image",
            ));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(dst)
    }

    fn write_blocks(&mut self, _start_lba: Lba, _src: &[u8]) -> Result<(), Self::Error> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "disk image opened read-only",
        ))
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
