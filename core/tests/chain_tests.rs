//! Loader handoff: chain blob, parameter block and file replacement

mod common;

use common::{pattern_image, scatter_image};
use morpheus_vdisk::vdisk::{
    ChainHead, ChunkList, FileReplaceList, HostBlockSize, ImageLocation, MappedImage,
    OsParam, OverrideChunk, OverrideList, PartitionFs, SectorReader, VdiskConfig, VdiskError,
    VirtChunk, VirtTable, VirtualBlockDevice, CHAIN_HEAD_SIZE, VIRT_CHUNK_SIZE,
};

/// 8 image sectors
const IMAGE_LEN: usize = 8 * 2048;
const PATH: &str = "/ISO/linux-live.iso";

fn chunks() -> ChunkList {
    let mut chunks = ChunkList::new().unwrap();
    chunks.append(0, 3, 100, 115).unwrap();
    chunks.append(4, 7, 300, 315).unwrap();
    chunks
}

fn os_param() -> OsParam {
    let mut param = OsParam::new();
    param.disk_size = 64 * 1024 * 1024;
    param.disk_guid = [0x5A; 16];
    param.part_id = 1;
    param.set_fs(PartitionFs::Exfat);
    param.set_img_path(PATH);
    param.img_size = IMAGE_LEN as u64;
    param.update_checksum();
    param
}

/// One virtual sector at 8 followed by two sectors remapped onto 0..2
fn virt_table() -> VirtTable {
    let mut memory = vec![0u8; VIRT_CHUNK_SIZE + 2048];
    memory[VIRT_CHUNK_SIZE..].fill(0x7E);
    VirtTable::new(
        vec![VirtChunk {
            mem_sector_start: 8,
            mem_sector_end: 9,
            mem_sector_offset: VIRT_CHUNK_SIZE as u32,
            remap_sector_start: 9,
            remap_sector_end: 11,
            org_sector_start: 0,
        }],
        memory,
    )
    .unwrap()
}

fn blob() -> Vec<u8> {
    let mut overrides = OverrideList::new();
    overrides
        .push(OverrideChunk::new(2048 * 5 + 100, b"patched").unwrap())
        .unwrap();

    let mut head = ChainHead::new(os_param(), 512, IMAGE_LEN as u64);
    head.virt_img_size_in_bytes = 11 * 2048;
    head.build(&chunks(), &overrides, &virt_table()).unwrap()
}

#[test]
fn test_blob_serves_real_patched_and_virtual_sectors() {
    let image = pattern_image(IMAGE_LEN);
    let mut disk = scatter_image(&image, &[(0, 4, 100), (4, 4, 300)], 400);

    let blob = blob();
    let head = ChainHead::parse(&blob).unwrap();
    assert_eq!(head.img_chunk_offset as usize, CHAIN_HEAD_SIZE);
    assert_eq!(head.os_param.img_path_str(), PATH);

    let ctx = head.into_context(&blob, VdiskConfig::default()).unwrap();
    assert_eq!(ctx.chunks().len(), 2);
    assert_eq!(ctx.overrides().len(), 1);
    assert_eq!(ctx.virt_img_size(), 11 * 2048);

    let mapped = MappedImage::new(ctx, &mut disk).unwrap();
    let mut dev = VirtualBlockDevice::new(mapped, HostBlockSize::Native2048).unwrap();
    assert_eq!(dev.media().last_block, 10);

    let mut all = vec![0u8; 11 * 2048];
    dev.read(0, &mut all).unwrap();

    let mut expected = image.clone();
    expected[2048 * 5 + 100..2048 * 5 + 107].copy_from_slice(b"patched");
    assert_eq!(&all[..IMAGE_LEN], &expected[..]);
    assert!(all[8 * 2048..9 * 2048].iter().all(|&b| b == 0x7E));
    assert_eq!(&all[9 * 2048..], &image[..2 * 2048]);
}

#[test]
fn test_corrupt_table_offsets_rejected() {
    let mut blob = blob();
    // img_chunk_num pushed far past the end of the blob
    blob[2596..2600].copy_from_slice(&10_000u32.to_le_bytes());
    assert!(matches!(ChainHead::parse(&blob), Err(VdiskError::InvalidChain)));

    let mut blob = self::blob();
    // override table starting inside the head
    blob[2600..2604].copy_from_slice(&16u32.to_le_bytes());
    assert!(matches!(ChainHead::parse(&blob), Err(VdiskError::InvalidChain)));
}

#[test]
fn test_unparsed_head_with_bad_offsets_rejected() {
    let blob = blob();
    let mut head = ChainHead::from_bytes(&blob).unwrap();
    head.img_chunk_offset = 100_000;
    head.img_chunk_num = 1;
    assert_eq!(
        head.into_context(&blob, VdiskConfig::default()).err(),
        Some(VdiskError::InvalidChain)
    );
}

#[test]
fn test_backing_sector_size_must_match_head() {
    let image = pattern_image(IMAGE_LEN);
    // Same bytes, exposed as 2048-byte blocks instead of the head's 512
    let disk = scatter_image(&image, &[(0, 4, 100), (4, 4, 300)], 400);
    let mut wide = common::MemoryBlockDevice::new(disk.data.clone(), 2048);

    let blob = blob();
    let ctx = ChainHead::parse(&blob)
        .unwrap()
        .into_context(&blob, VdiskConfig::default())
        .unwrap();
    assert!(matches!(
        MappedImage::new(ctx, &mut wide),
        Err(VdiskError::InvalidParameter)
    ));
}

#[test]
fn test_os_param_found_in_memory() {
    let blob = blob();
    let mut memory = vec![0u8; 64 * 1024];
    // Decoy with the right GUID but a broken checksum
    let mut decoy = os_param().to_bytes();
    decoy[100] ^= 0xFF;
    memory[0x400..0x400 + 512].copy_from_slice(&decoy);
    memory[0x2000..0x2000 + 512].copy_from_slice(&blob[..512]);

    let (offset, param) = OsParam::find(&memory).unwrap();
    assert_eq!(offset, 0x2000);
    assert_eq!(param.img_path_str(), PATH);
    assert_eq!(param.fs(), Some(PartitionFs::Exfat));
    assert!(param.matches_disk(64 * 1024 * 1024 - 512, &[0x5A; 16]));
    assert!(!param.matches_disk(64 * 1024 * 1024, &[0; 16]));

    assert!(OsParam::find(&memory[..0x2000]).is_none());
}

#[test]
fn test_location_table_mirrors_chunks() {
    let location = ImageLocation::from_chunks(&chunks(), 512).unwrap();
    let mut buf = vec![0u8; location.encoded_len()];
    location.write_to(&mut buf).unwrap();

    let parsed = ImageLocation::parse(&buf).unwrap();
    assert_eq!(parsed.regions.len(), 2);
    assert_eq!(parsed.map_sector(0), Some(100));
    assert_eq!(parsed.map_sector(5), Some(304));
    assert_eq!(parsed.map_sector(8), None);

    let mut param = os_param();
    assert!(param.set_location(0x7F00_0000, buf.len() as u32).is_ok());
    assert_eq!(
        param.set_location(0x7F00_0010, buf.len() as u32),
        Err(VdiskError::InvalidParameter)
    );
}

#[test]
fn test_replaced_file_streams_virtual_entry() {
    let image = pattern_image(IMAGE_LEN);
    let mut disk = scatter_image(&image, &[(0, 4, 100), (4, 4, 300)], 400);

    let blob = blob();
    let ctx = ChainHead::parse(&blob)
        .unwrap()
        .into_context(&blob, VdiskConfig::default())
        .unwrap();

    let replace = FileReplaceList::new(0, &["\\EFI\\BOOT\\BOOTX64.EFI"]).unwrap();
    let list = FileReplaceList::from_bytes(&replace.to_bytes()).unwrap();
    let mut file = list
        .resolve("\\EFI\\BOOT\\BOOTX64.EFI", ctx.virt())
        .expect("file is replaced");
    assert!(list.resolve("\\EFI\\BOOT\\mmx64.efi", ctx.virt()).is_none());
    assert_eq!(file.size(), 3 * 2048);

    let mut mapped = MappedImage::new(ctx, &mut disk).unwrap();
    assert_eq!(mapped.image_size(), 11 * 2048);

    file.set_position(2000);
    let mut buf = vec![0u8; 200];
    assert_eq!(file.read(&mut mapped, &mut buf).unwrap(), 200);
    assert!(buf[..48].iter().all(|&b| b == 0x7E));
    assert_eq!(&buf[48..], &image[..152]);

    let mut rest = vec![0u8; 8192];
    let n = file.read(&mut mapped, &mut rest).unwrap();
    assert_eq!(n, 3 * 2048 - 2200);
    assert_eq!(file.write(b"nope"), Err(VdiskError::WriteProtected));
}

#[test]
fn test_memdisk_blob() {
    let image = pattern_image(3 * 2048);
    let mut blob = vec![0u8; CHAIN_HEAD_SIZE];
    ChainHead::new(os_param(), 512, image.len() as u64)
        .write_to(&mut blob)
        .unwrap();
    blob.extend_from_slice(&image);

    let served = ChainHead::memdisk_image(&blob).unwrap();
    let mut dev = VirtualBlockDevice::new(
        morpheus_vdisk::vdisk::MemDisk::new(served),
        HostBlockSize::Host512,
    )
    .unwrap();
    let mut buf = vec![0u8; 3 * 512];
    dev.read(3, &mut buf).unwrap();
    assert_eq!(&buf[..], &image[3 * 512..6 * 512]);
}
