//! Sector resolver
//!
//! Turns a native (2048-byte) sector request into backing disk reads,
//! override patches and virtual memory copies.

use alloc::vec::Vec;
use gpt_disk_io::BlockIo;
use gpt_disk_types::Lba;

use super::chunk::{ChunkList, ImgChunk};
use super::error::VdiskError;
use super::fixup::Iso9660Fixup;
use super::overrides::OverrideList;
use super::virt::{SectorClass, VirtTable};
use super::{image_sectors_for, VdiskConfig, IMAGE_SECTOR_SIZE};
use crate::{log_info, log_trace};

const SECTOR: u64 = IMAGE_SECTOR_SIZE as u64;

/// Something that can serve whole 2048-byte image sectors
pub trait SectorReader {
    /// Bytes exposed by the image
    fn image_size(&self) -> u64;

    /// Read `buffer.len() / 2048` sectors starting at image sector `lba`
    fn read_native(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), VdiskError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SectorKind {
    /// Not covered by the virtual table
    #[default]
    None,
    /// Already copied from the memory region
    Virtual,
    /// Must be fetched from `remap_lba` in the real image
    Remap,
}

/// Per-sector classification scratch entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectorFlag {
    pub kind: SectorKind,
    pub remap_lba: u64,
}

/// Everything a read needs, owned in one place
pub struct ServingContext {
    chunks: ChunkList,
    overrides: OverrideList,
    virt: VirtTable,
    fixup: Iso9660Fixup,
    /// Scratch for the two-pass path; grows, never shrinks
    flags: Vec<SectorFlag>,
    real_img_size: u64,
    virt_img_size: u64,
    /// Backing sector size the tables were built for, if recorded
    disk_sector_size: Option<u64>,
    config: VdiskConfig,
}

impl ServingContext {
    pub fn new(
        chunks: ChunkList,
        overrides: OverrideList,
        virt: VirtTable,
        real_img_size: u64,
        config: VdiskConfig,
    ) -> Result<Self, VdiskError> {
        if config.check_virt_overlap {
            virt.check_overlaps()?;
        }

        let virt_end = virt
            .chunks()
            .iter()
            .map(|c| c.mem_sector_end.max(c.remap_sector_end) as u64 * SECTOR)
            .max()
            .unwrap_or(0);

        Ok(Self {
            chunks,
            overrides,
            virt,
            fixup: Iso9660Fixup::new(config.fixup_iso9660, config.overflow_threshold),
            flags: Vec::new(),
            real_img_size,
            virt_img_size: real_img_size.max(virt_end),
            disk_sector_size: None,
            config,
        })
    }

    /// Override the exposed image size (the loader records it explicitly)
    pub fn with_virtual_size(mut self, virt_img_size: u64) -> Self {
        self.virt_img_size = virt_img_size.max(self.real_img_size);
        self
    }

    /// Pin the backing sector size the chunk tables were built for
    pub fn with_disk_sector_size(mut self, disk_sector_size: u32) -> Self {
        self.disk_sector_size = Some(disk_sector_size as u64);
        self
    }

    pub fn disk_sector_size(&self) -> Option<u64> {
        self.disk_sector_size
    }

    pub fn chunks(&self) -> &ChunkList {
        &self.chunks
    }

    pub fn overrides(&self) -> &OverrideList {
        &self.overrides
    }

    pub fn virt(&self) -> &VirtTable {
        &self.virt
    }

    pub fn fixup(&self) -> &Iso9660Fixup {
        &self.fixup
    }

    pub fn config(&self) -> &VdiskConfig {
        &self.config
    }

    pub fn real_img_size(&self) -> u64 {
        self.real_img_size
    }

    pub fn virt_img_size(&self) -> u64 {
        self.virt_img_size
    }

    /// Current scratch capacity in sectors
    pub fn flag_capacity(&self) -> usize {
        self.flags.len()
    }

    /// Serve `count` image sectors starting at `lba` into `out`.
    ///
    /// Requests that fit in the real image go straight to the chunk list.
    /// Anything reaching past it is classified sector by sector against the
    /// virtual table first, then remapped sectors are fetched in coalesced
    /// runs.
    pub fn read<B: BlockIo>(
        &mut self,
        backing: &mut B,
        lba: u64,
        count: u64,
        out: &mut [u8],
    ) -> Result<(), VdiskError> {
        let bytes = count
            .checked_mul(SECTOR)
            .ok_or(VdiskError::InvalidParameter)?;
        if (out.len() as u64) < bytes {
            return Err(VdiskError::InvalidBuffer);
        }
        let out = &mut out[..bytes as usize];

        let lba = if self.fixup.is_active() {
            self.fixup.translate(lba, count, &self.overrides)
        } else {
            lba
        };

        let end = lba
            .checked_mul(SECTOR)
            .and_then(|start| start.checked_add(bytes))
            .ok_or_else(|| {
                log_info!("read address overflows image range");
                VdiskError::ReadOverflow
            })?;

        if end <= self.real_img_size {
            return self.read_image(backing, lba, count, out);
        }

        log_trace!("read reaches past real image");
        self.classify(lba, count, out)?;
        self.fetch_remapped(backing, count, out)
    }

    /// Pass one: copy virtual sectors, flag remapped ones
    fn classify(&mut self, lba: u64, count: u64, out: &mut [u8]) -> Result<(), VdiskError> {
        let count = count as usize;
        if self.flags.len() < count {
            self.flags.try_reserve(count - self.flags.len())?;
            self.flags.resize(count, SectorFlag::default());
            log_info!("sector flag buffer grown");
        }

        let real_sectors = image_sectors_for(self.real_img_size);

        for (j, dst) in out.chunks_exact_mut(IMAGE_SECTOR_SIZE).enumerate() {
            let sector = lba + j as u64;
            self.flags[j] = match self.virt.classify(sector) {
                SectorClass::Virtual { offset } => {
                    dst.copy_from_slice(self.virt.virtual_sector(offset));
                    SectorFlag {
                        kind: SectorKind::Virtual,
                        remap_lba: 0,
                    }
                }
                SectorClass::Remap { org_sector } => SectorFlag {
                    kind: SectorKind::Remap,
                    remap_lba: org_sector,
                },
                // Still real image data when the request merely straddles its end
                SectorClass::None if sector < real_sectors => SectorFlag {
                    kind: SectorKind::Remap,
                    remap_lba: sector,
                },
                SectorClass::None => {
                    dst.fill(0);
                    SectorFlag::default()
                }
            };
        }
        Ok(())
    }

    /// Pass two: fetch remapped sectors, one backing read per contiguous run
    fn fetch_remapped<B: BlockIo>(
        &mut self,
        backing: &mut B,
        count: u64,
        out: &mut [u8],
    ) -> Result<(), VdiskError> {
        // (buffer index, first remap lba, run length)
        let mut run: Option<(usize, u64, u64)> = None;

        for j in 0..count as usize {
            let flag = self.flags[j];
            if flag.kind != SectorKind::Remap {
                continue;
            }
            // A run needs adjacent slots in the request as well as adjacent targets
            run = match run {
                Some((idx, start, len))
                    if idx + len as usize == j && start + len == flag.remap_lba =>
                {
                    Some((idx, start, len + 1))
                }
                Some((idx, start, len)) => {
                    self.read_run(backing, out, idx, start, len)?;
                    Some((j, flag.remap_lba, 1))
                }
                None => Some((j, flag.remap_lba, 1)),
            };
        }

        if let Some((idx, start, len)) = run {
            self.read_run(backing, out, idx, start, len)?;
        }
        Ok(())
    }

    fn read_run<B: BlockIo>(
        &mut self,
        backing: &mut B,
        out: &mut [u8],
        idx: usize,
        start: u64,
        len: u64,
    ) -> Result<(), VdiskError> {
        let from = idx * IMAGE_SECTOR_SIZE;
        let to = from + len as usize * IMAGE_SECTOR_SIZE;
        self.read_image(backing, start, len, &mut out[from..to])
    }

    /// Tier one: chunk list translation plus override patches
    fn read_image<B: BlockIo>(
        &mut self,
        backing: &mut B,
        lba: u64,
        count: u64,
        buf: &mut [u8],
    ) -> Result<(), VdiskError> {
        let disk_sector_size = backing.block_size().to_u64();
        let read_start = lba * SECTOR;
        let read_end = (lba + count) * SECTOR;

        let mut sector = lba;
        let mut left = count;
        let mut pos = 0usize;

        while left > 0 {
            let chunk: Option<ImgChunk> = self.chunks.find(sector).copied();
            let n = match chunk {
                Some(chunk) => {
                    let map_lba = chunk.map_sector(sector, disk_sector_size);
                    let n = left.min(chunk.img_end_sector as u64 + 1 - sector);
                    let len = n as usize * IMAGE_SECTOR_SIZE;
                    backing
                        .read_blocks(Lba(map_lba), &mut buf[pos..pos + len])
                        .map_err(|_| {
                            log_info!("backing disk read failed");
                            VdiskError::BackingReadFailure
                        })?;
                    n
                }
                None => {
                    buf[pos..pos + IMAGE_SECTOR_SIZE].fill(0);
                    1
                }
            };
            sector += n;
            left -= n;
            pos += n as usize * IMAGE_SECTOR_SIZE;
        }

        if read_start <= self.real_img_size {
            self.overrides
                .apply(buf, read_start, read_end, Some(&mut self.fixup));
        }
        Ok(())
    }
}

/// A serving context bound to its backing disk
pub struct MappedImage<'a, B: BlockIo> {
    ctx: ServingContext,
    backing: &'a mut B,
}

impl<'a, B: BlockIo> MappedImage<'a, B> {
    /// Bind `ctx` to `backing`, whose block size must divide 2048 and
    /// match the sector size the context was built for
    pub fn new(ctx: ServingContext, backing: &'a mut B) -> Result<Self, VdiskError> {
        let block_size = backing.block_size().to_u64();
        if block_size == 0 || SECTOR % block_size != 0 {
            log_info!("backing block size does not divide 2048");
            return Err(VdiskError::InvalidParameter);
        }
        if matches!(ctx.disk_sector_size, Some(expected) if expected != block_size) {
            log_info!("backing block size differs from chain sector size");
            return Err(VdiskError::InvalidParameter);
        }
        Ok(Self { ctx, backing })
    }

    pub fn context(&self) -> &ServingContext {
        &self.ctx
    }

    pub fn into_context(self) -> ServingContext {
        self.ctx
    }
}

impl<'a, B: BlockIo> SectorReader for MappedImage<'a, B> {
    fn image_size(&self) -> u64 {
        self.ctx.virt_img_size()
    }

    fn read_native(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), VdiskError> {
        if buffer.len() % IMAGE_SECTOR_SIZE != 0 {
            return Err(VdiskError::InvalidBuffer);
        }
        let count = (buffer.len() / IMAGE_SECTOR_SIZE) as u64;
        self.ctx.read(self.backing, lba, count, buffer)
    }
}
