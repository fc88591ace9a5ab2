// FAT32 cluster chain to chunk list

use gpt_disk_io::BlockIo;
use gpt_disk_types::Lba;

use crate::log_info;
use crate::vdisk::{image_sectors_for, ChunkList, ExtentSource, VdiskError, IMAGE_SECTOR_SIZE};

const SECTOR_SIZE: usize = 512;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
const FAT_BAD_CLUSTER: u32 = 0x0FFF_FFF7;
const FAT_END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// Geometry of a FAT32 volume, read from its boot sector
#[derive(Debug, Clone, Copy)]
pub struct Fat32Volume {
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_size: u32,
    pub num_fats: u32,
    pub data_start_sector: u32,
}

impl Fat32Volume {
    pub fn from_boot_sector<B: BlockIo>(
        block_io: &mut B,
        partition_start: u64,
    ) -> Result<Self, VdiskError> {
        let mut boot_sector = [0u8; SECTOR_SIZE];
        block_io
            .read_blocks(Lba(partition_start), &mut boot_sector)
            .map_err(|_| VdiskError::BackingReadFailure)?;

        let bytes_per_sector = u16::from_le_bytes([boot_sector[0x0B], boot_sector[0x0C]]);
        let sectors_per_cluster = boot_sector[0x0D] as u32;
        let reserved_sectors = u16::from_le_bytes([boot_sector[0x0E], boot_sector[0x0F]]) as u32;
        let num_fats = boot_sector[0x10] as u32;
        let fat_size = u32::from_le_bytes([
            boot_sector[0x24],
            boot_sector[0x25],
            boot_sector[0x26],
            boot_sector[0x27],
        ]);

        if bytes_per_sector as usize != SECTOR_SIZE || sectors_per_cluster == 0 || num_fats == 0 {
            log_info!("fat32: unsupported boot sector");
            return Err(VdiskError::UnsupportedLayout);
        }

        Ok(Self {
            sectors_per_cluster,
            reserved_sectors,
            fat_size,
            num_fats,
            data_start_sector: reserved_sectors + num_fats * fat_size,
        })
    }

    /// Partition-relative first sector of a cluster
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.data_start_sector as u64 + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    pub fn cluster_bytes(&self) -> u64 {
        self.sectors_per_cluster as u64 * SECTOR_SIZE as u64
    }

    /// Handle for a file given its directory entry fields
    pub fn file(&self, first_cluster: u32, size: u64) -> Fat32File {
        Fat32File {
            volume: *self,
            first_cluster,
            size,
        }
    }
}

/// Reads FAT entries, keeping the last FAT sector around since chain
/// walks mostly stay in one sector.
struct FatReader {
    cached: Option<u64>,
    sector: [u8; SECTOR_SIZE],
}

impl FatReader {
    fn new() -> Self {
        Self {
            cached: None,
            sector: [0u8; SECTOR_SIZE],
        }
    }

    fn next_cluster<B: BlockIo>(
        &mut self,
        volume: &Fat32Volume,
        block_io: &mut B,
        partition_start: u64,
        cluster: u32,
    ) -> Result<u32, VdiskError> {
        let fat_offset = cluster as u64 * 4;
        let lba = partition_start + volume.reserved_sectors as u64 + fat_offset / SECTOR_SIZE as u64;
        let entry_offset = (fat_offset % SECTOR_SIZE as u64) as usize;

        if self.cached != Some(lba) {
            block_io
                .read_blocks(Lba(lba), &mut self.sector)
                .map_err(|_| VdiskError::BackingReadFailure)?;
            self.cached = Some(lba);
        }

        let entry = u32::from_le_bytes([
            self.sector[entry_offset],
            self.sector[entry_offset + 1],
            self.sector[entry_offset + 2],
            self.sector[entry_offset + 3],
        ]) & FAT_ENTRY_MASK;

        Ok(entry)
    }
}

/// A file on a FAT32 volume, identified by its first cluster and size
#[derive(Debug, Clone, Copy)]
pub struct Fat32File {
    volume: Fat32Volume,
    pub first_cluster: u32,
    pub size: u64,
}

impl Fat32File {
    fn is_data_cluster(cluster: u32) -> bool {
        (2..FAT_BAD_CLUSTER).contains(&cluster)
    }

    /// Append one run of physically contiguous clusters
    fn push_run(
        &self,
        chunks: &mut ChunkList,
        partition_start: u64,
        first: u32,
        count: u64,
        bytes_done: u64,
    ) -> Result<u64, VdiskError> {
        let run_bytes = (count * self.volume.cluster_bytes()).min(self.size - bytes_done);
        let disk_sectors = (run_bytes + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64;
        let disk_start = partition_start + self.volume.cluster_to_sector(first);
        let img_start = bytes_done / IMAGE_SECTOR_SIZE as u64;
        let img_end = image_sectors_for(bytes_done + run_bytes) - 1;

        chunks.append(
            img_start as u32,
            img_end as u32,
            disk_start,
            disk_start + disk_sectors - 1,
        )?;
        Ok(bytes_done + run_bytes)
    }
}

impl ExtentSource for Fat32File {
    fn get_block_list<B: BlockIo>(
        &self,
        block_io: &mut B,
        chunks: &mut ChunkList,
        partition_start: u64,
    ) -> Result<(), VdiskError> {
        if self.size == 0 {
            return Err(VdiskError::InvalidParameter);
        }

        let cluster_bytes = self.volume.cluster_bytes();
        let needed = (self.size + cluster_bytes - 1) / cluster_bytes;
        let mut fat = FatReader::new();

        let mut cluster = self.first_cluster;
        let mut run_start = cluster;
        let mut run_len = 0u64;
        let mut bytes_done = 0u64;

        for i in 0..needed {
            if !Self::is_data_cluster(cluster) {
                log_info!("fat32: bad or free cluster in chain");
                return Err(VdiskError::UnsupportedLayout);
            }

            if run_len > 0 && cluster == run_start + run_len as u32 {
                run_len += 1;
            } else {
                if run_len > 0 {
                    bytes_done =
                        self.push_run(chunks, partition_start, run_start, run_len, bytes_done)?;
                }
                run_start = cluster;
                run_len = 1;
            }

            if i + 1 < needed {
                let next = fat.next_cluster(&self.volume, block_io, partition_start, cluster)?;
                if next >= FAT_END_OF_CHAIN {
                    log_info!("fat32: chain shorter than file size");
                    return Err(VdiskError::UnsupportedLayout);
                }
                cluster = next;
            }
        }

        self.push_run(chunks, partition_start, run_start, run_len, bytes_done)?;
        Ok(())
    }
}
