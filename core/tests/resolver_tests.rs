//! Sector resolver tests against a recording backing disk

mod common;

use common::MemoryBlockDevice;
use morpheus_vdisk::vdisk::{
    ChunkList, DirentOverride, FixupState, OverrideChunk, OverrideList, ServingContext,
    VdiskConfig, VdiskError, VirtChunk, VirtTable, ISO9660_SECTOR_OVERFLOW,
};

fn identity_chunks(sectors: u32) -> ChunkList {
    let mut chunks = ChunkList::new().unwrap();
    chunks.append(0, sectors - 1, 0, sectors as u64 - 1).unwrap();
    chunks
}

#[test]
fn test_end_to_end_two_chunks() {
    let size = 1_000_000u64;
    let mut chunks = ChunkList::new().unwrap();
    chunks.append(0, 199, 2048, 2247).unwrap();
    chunks.append(200, 488, 5000, 5288).unwrap();
    assert_eq!(chunks.total_image_sectors(), 489);
    chunks.validate(size, 0, 2048).expect("valid layout");

    let mut ctx = ServingContext::new(
        chunks,
        OverrideList::new(),
        VirtTable::empty(),
        size,
        VdiskConfig::default(),
    )
    .unwrap();

    let mut disk = MemoryBlockDevice::patterned(6000, 2048);
    let mut buf = vec![0u8; 61 * 2048];
    ctx.read(&mut disk, 150, 61, &mut buf).unwrap();

    assert_eq!(disk.reads, vec![(2198, 50), (5000, 11)]);
    // Image sector 199 lives at disk 2247, 200 at 5000
    assert_eq!(buf[49 * 2048], 2247u64 as u8);
    assert_eq!(buf[50 * 2048], 5000u64 as u8);
}

#[test]
fn test_remap_coalescing_follows_target_order() {
    // Request sectors 1000..1007 remap to 5,6,7,20,8,9,10
    let virt = VirtTable::new(
        vec![
            VirtChunk {
                remap_sector_start: 1000,
                remap_sector_end: 1003,
                org_sector_start: 5,
                ..Default::default()
            },
            VirtChunk {
                remap_sector_start: 1003,
                remap_sector_end: 1004,
                org_sector_start: 20,
                ..Default::default()
            },
            VirtChunk {
                remap_sector_start: 1004,
                remap_sector_end: 1007,
                org_sector_start: 8,
                ..Default::default()
            },
        ],
        Vec::new(),
    )
    .unwrap();

    let mut ctx = ServingContext::new(
        identity_chunks(30),
        OverrideList::new(),
        virt,
        30 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();

    let mut disk = MemoryBlockDevice::patterned(30, 2048);
    let mut buf = vec![0u8; 7 * 2048];
    ctx.read(&mut disk, 1000, 7, &mut buf).unwrap();

    assert_eq!(disk.reads, vec![(5, 3), (20, 1), (8, 3)]);
    let firsts: Vec<u8> = buf.chunks_exact(2048).map(|s| s[0]).collect();
    assert_eq!(firsts, vec![5, 6, 7, 20, 8, 9, 10]);
}

#[test]
fn test_remap_runs_break_at_non_remap_sectors() {
    // 1000..1003 -> 5, 1003 virtual, 1004 -> 20, 1005 unmapped,
    // 1006..1009 -> 8, 1009 virtual
    let mut memory = vec![0xA1u8; 2 * 2048];
    memory[2048..].fill(0xA2);
    let virt = VirtTable::new(
        vec![
            VirtChunk {
                mem_sector_start: 1003,
                mem_sector_end: 1004,
                mem_sector_offset: 0,
                remap_sector_start: 1000,
                remap_sector_end: 1003,
                org_sector_start: 5,
            },
            VirtChunk {
                remap_sector_start: 1004,
                remap_sector_end: 1005,
                org_sector_start: 20,
                ..Default::default()
            },
            VirtChunk {
                mem_sector_start: 1009,
                mem_sector_end: 1010,
                mem_sector_offset: 2048,
                remap_sector_start: 1006,
                remap_sector_end: 1009,
                org_sector_start: 8,
            },
        ],
        memory,
    )
    .unwrap();

    let mut ctx = ServingContext::new(
        identity_chunks(30),
        OverrideList::new(),
        virt,
        30 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();

    let mut disk = MemoryBlockDevice::patterned(30, 2048);
    let mut buf = vec![0x11u8; 10 * 2048];
    ctx.read(&mut disk, 1000, 10, &mut buf).unwrap();

    assert_eq!(disk.reads, vec![(5, 3), (20, 1), (8, 3)]);
    let firsts: Vec<u8> = buf.chunks_exact(2048).map(|s| s[0]).collect();
    assert_eq!(firsts, vec![5, 6, 7, 0xA1, 20, 0, 8, 9, 10, 0xA2]);
    assert!(buf[5 * 2048..6 * 2048].iter().all(|&b| b == 0));
}

#[test]
fn test_contiguous_targets_split_by_gap_in_request() {
    // 100 -> 5, 101 virtual, 102 -> 6, 103 unmapped, 104 -> 7
    let virt = VirtTable::new(
        vec![
            VirtChunk {
                mem_sector_start: 101,
                mem_sector_end: 102,
                mem_sector_offset: 0,
                remap_sector_start: 100,
                remap_sector_end: 101,
                org_sector_start: 5,
            },
            VirtChunk {
                remap_sector_start: 102,
                remap_sector_end: 103,
                org_sector_start: 6,
                ..Default::default()
            },
            VirtChunk {
                remap_sector_start: 104,
                remap_sector_end: 105,
                org_sector_start: 7,
                ..Default::default()
            },
        ],
        vec![0xEE; 2048],
    )
    .unwrap();

    let mut ctx = ServingContext::new(
        identity_chunks(30),
        OverrideList::new(),
        virt,
        30 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();

    let mut disk = MemoryBlockDevice::patterned(30, 2048);
    let mut buf = vec![0x11u8; 5 * 2048];
    ctx.read(&mut disk, 100, 5, &mut buf).unwrap();

    assert_eq!(disk.reads, vec![(5, 1), (6, 1), (7, 1)]);
    let firsts: Vec<u8> = buf.chunks_exact(2048).map(|s| s[0]).collect();
    assert_eq!(firsts, vec![5, 0xEE, 6, 0, 7]);
}

#[test]
fn test_read_address_overflow_rejected() {
    let mut ctx = ServingContext::new(
        identity_chunks(4),
        OverrideList::new(),
        VirtTable::empty(),
        4 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();
    let mut disk = MemoryBlockDevice::patterned(4, 2048);
    let mut buf = vec![0u8; 2048];
    assert_eq!(
        ctx.read(&mut disk, u64::MAX / 2048 + 1, 1, &mut buf),
        Err(VdiskError::ReadOverflow)
    );
    assert!(disk.reads.is_empty());
}

#[test]
fn test_virtual_sectors_never_touch_disk() {
    let mut memory = vec![0u8; 24 + 3 * 2048];
    memory[24..].fill(0xC3);
    let virt = VirtTable::new(
        vec![VirtChunk {
            mem_sector_start: 40,
            mem_sector_end: 43,
            mem_sector_offset: 24,
            ..Default::default()
        }],
        memory,
    )
    .unwrap();

    // The chunk list claims to cover the virtual sectors too
    let mut ctx = ServingContext::new(
        identity_chunks(50),
        OverrideList::new(),
        virt,
        20 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();

    let mut disk = MemoryBlockDevice::patterned(50, 2048);
    let mut buf = vec![0u8; 3 * 2048];
    ctx.read(&mut disk, 40, 3, &mut buf).unwrap();

    assert!(disk.reads.is_empty());
    assert!(buf.iter().all(|&b| b == 0xC3));
}

#[test]
fn test_override_follows_remapped_sector() {
    let mut overrides = OverrideList::new();
    overrides
        .push(OverrideChunk::new(5 * 2048, b"BOOTCAT").unwrap())
        .unwrap();

    let virt = VirtTable::new(
        vec![VirtChunk {
            remap_sector_start: 100,
            remap_sector_end: 101,
            org_sector_start: 5,
            ..Default::default()
        }],
        Vec::new(),
    )
    .unwrap();
    let mut ctx = ServingContext::new(
        identity_chunks(10),
        overrides,
        virt,
        10 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();

    let mut disk = MemoryBlockDevice::patterned(10, 2048);
    let mut buf = vec![0u8; 2048];

    ctx.read(&mut disk, 5, 1, &mut buf).unwrap();
    assert_eq!(&buf[..7], b"BOOTCAT");

    // Remapped copies are fetched through tier one and carry the patch too
    ctx.read(&mut disk, 100, 1, &mut buf).unwrap();
    assert_eq!(&buf[..7], b"BOOTCAT");
    assert_eq!(buf[7], 5);
}

#[test]
fn test_fixup_translates_wrapped_directory() {
    let t = ISO9660_SECTOR_OVERFLOW;
    let first_sector = 2_100_000u32;

    // Directory record patch lives in image sector 2
    let mut overrides = OverrideList::new();
    let dirent = DirentOverride::new(first_sector, 3 * 2048);
    overrides
        .push(OverrideChunk::new(2 * 2048 + 2, &dirent.to_bytes()).unwrap())
        .unwrap();

    // The appended directory content is remapped onto image sectors 10..13
    let virt = VirtTable::new(
        vec![VirtChunk {
            remap_sector_start: first_sector,
            remap_sector_end: first_sector + 3,
            org_sector_start: 10,
            ..Default::default()
        }],
        Vec::new(),
    )
    .unwrap();

    let config = VdiskConfig {
        fixup_iso9660: true,
        ..VdiskConfig::default()
    };
    let mut ctx =
        ServingContext::new(identity_chunks(20), overrides, virt, 20 * 2048, config).unwrap();
    let mut disk = MemoryBlockDevice::patterned(20, 2048);
    let mut buf = vec![0u8; 2048];

    ctx.read(&mut disk, 2, 1, &mut buf).unwrap();
    assert_eq!(ctx.fixup().state(), FixupState::Armed);

    let base = first_sector as u64 - t;
    for i in 0..3u64 {
        disk.clear_reads();
        ctx.read(&mut disk, base + i, 1, &mut buf).unwrap();
        assert_eq!(disk.reads, vec![(10 + i, 1)]);
        assert_eq!(buf[0], (10 + i) as u8);
    }
    assert_eq!(ctx.fixup().state(), FixupState::Idle);

    // Idle again: the wrapped address is served untranslated
    disk.clear_reads();
    ctx.read(&mut disk, 3, 1, &mut buf).unwrap();
    assert_eq!(disk.reads, vec![(3, 1)]);
}

#[test]
fn test_fixup_cancelled_by_direct_read() {
    let first_sector = 2_200_000u32;
    let mut overrides = OverrideList::new();
    overrides
        .push(OverrideChunk::new(0, &DirentOverride::new(first_sector, 8 * 2048).to_bytes()).unwrap())
        .unwrap();
    let config = VdiskConfig {
        fixup_iso9660: true,
        ..VdiskConfig::default()
    };
    let mut ctx = ServingContext::new(
        identity_chunks(4),
        overrides,
        VirtTable::empty(),
        4 * 2048,
        config,
    )
    .unwrap();
    let mut disk = MemoryBlockDevice::patterned(4, 2048);
    let mut buf = vec![0u8; 2048];

    ctx.read(&mut disk, 0, 1, &mut buf).unwrap();
    assert_eq!(ctx.fixup().state(), FixupState::Armed);

    let base = first_sector as u64 - ISO9660_SECTOR_OVERFLOW;
    ctx.read(&mut disk, base, 1, &mut buf).unwrap();
    assert!(matches!(ctx.fixup().state(), FixupState::Consuming { .. }));

    ctx.read(&mut disk, first_sector as u64, 1, &mut buf).unwrap();
    assert_eq!(ctx.fixup().state(), FixupState::Idle);
}

#[test]
fn test_fixup_disabled_by_default() {
    let mut overrides = OverrideList::new();
    overrides
        .push(OverrideChunk::new(0, &DirentOverride::new(3_000_000, 2048).to_bytes()).unwrap())
        .unwrap();
    let mut ctx = ServingContext::new(
        identity_chunks(4),
        overrides,
        VirtTable::empty(),
        4 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();
    let mut disk = MemoryBlockDevice::patterned(4, 2048);
    let mut buf = vec![0u8; 2048];
    ctx.read(&mut disk, 0, 1, &mut buf).unwrap();
    assert_eq!(ctx.fixup().state(), FixupState::Idle);
}

#[test]
fn test_backing_failure_is_fatal() {
    let mut ctx = ServingContext::new(
        identity_chunks(4),
        OverrideList::new(),
        VirtTable::empty(),
        4 * 2048,
        VdiskConfig::default(),
    )
    .unwrap();
    let mut disk = MemoryBlockDevice::patterned(4, 2048);
    disk.fail_reads = true;
    let mut buf = vec![0u8; 2048];
    assert_eq!(
        ctx.read(&mut disk, 1, 1, &mut buf),
        Err(VdiskError::BackingReadFailure)
    );
}

#[test]
fn test_overlapping_virtual_table_rejected() {
    let virt = VirtTable::new(
        vec![
            VirtChunk {
                remap_sector_start: 10,
                remap_sector_end: 20,
                ..Default::default()
            },
            VirtChunk {
                remap_sector_start: 15,
                remap_sector_end: 25,
                ..Default::default()
            },
        ],
        Vec::new(),
    )
    .unwrap();

    let strict = ServingContext::new(
        identity_chunks(4),
        OverrideList::new(),
        virt.clone(),
        4 * 2048,
        VdiskConfig::default(),
    );
    assert_eq!(strict.err(), Some(VdiskError::InvalidParameter));

    let lenient = VdiskConfig {
        check_virt_overlap: false,
        ..VdiskConfig::default()
    };
    assert!(ServingContext::new(identity_chunks(4), OverrideList::new(), virt, 4 * 2048, lenient).is_ok());
}
