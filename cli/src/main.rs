// Host-side inspector for virtual disk handoff data
//
// Usage:
//   vdisk-dump param <memory.bin> [-v]
//   vdisk-dump location <table.bin>
//   vdisk-dump chain <chain.bin>
//   vdisk-dump extract <chain.bin> <disk.img> <out.img> [--fixup]

mod disk;

use disk::FileDisk;
use morpheus_vdisk::logger;
use morpheus_vdisk::vdisk::{
    ChainHead, HostBlockSize, ImageLocation, MappedImage, OsParam, VdiskConfig, VdiskError,
    VirtualBlockDevice,
};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process;

/// Native sectors copied per device read during extract
const EXTRACT_BATCH: usize = 64;

fn usage(prog: &str) -> ! {
    eprintln!("Usage: {} param <memory.bin> [-v]", prog);
    eprintln!("       {} location <table.bin>", prog);
    eprintln!("       {} chain <chain.bin>", prog);
    eprintln!("       {} extract <chain.bin> <disk.img> <out.img> [--fixup]", prog);
    process::exit(1);
}

fn vdisk_err(err: VdiskError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.as_str())
}

fn dump_engine_log() {
    let mut entries = [""; 64];
    let n = logger::get_logs(&mut entries);
    for msg in &entries[..n] {
        eprintln!("  [vdisk] {}", msg);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn print_param(param: &OsParam) {
    println!("################# dump os param ################");
    println!("guid           = {}", param.guid);
    println!("chksum         = 0x{:x}", param.chksum);
    println!("disk_guid      = {}", hex(&param.disk_guid));
    println!("disk_size      = {}", param.disk_size);
    println!("part_id        = {}", param.part_id);
    println!(
        "part_type      = {} ({})",
        param.part_type,
        param.fs().map(|fs| fs.as_str()).unwrap_or("unknown")
    );
    println!("img_path       = <{}>", param.img_path_str());
    println!("img_size       = <{}>", param.img_size);
    println!("location_addr  = <0x{:x}>", param.location_addr);
    println!("location_len   = <{}>", param.location_len);
    println!("reserved[0]    = 0x{:x}", param.reserved[0]);
    println!("reserved[1]    = 0x{:x}", param.reserved[1]);
    println!();
}

fn cmd_param(path: &str, verbose: bool) -> io::Result<()> {
    let data = fs::read(path)?;
    match OsParam::find(&data) {
        Some((offset, param)) => {
            if verbose {
                println!("found os param at offset 0x{:x} in {}", offset, path);
                print_param(&param);
            }
            println!("{}", param.img_path_str());
            Ok(())
        }
        None => {
            eprintln!("os param NOT found in {}", path);
            process::exit(1);
        }
    }
}

fn cmd_location(path: &str) -> io::Result<()> {
    let data = fs::read(path)?;
    let location = ImageLocation::parse(&data).map_err(vdisk_err)?;

    println!("guid              = {}", location.guid);
    println!("image_sector_size = {}", location.image_sector_size);
    println!("disk_sector_size  = {}", location.disk_sector_size);
    println!("regions           = {}", location.regions.len());
    for (i, region) in location.regions.iter().enumerate() {
        println!(
            "  [{:4}] img {:>10} +{:<8} -> disk {}",
            i, region.image_start_sector, region.image_sector_count, region.disk_start_sector
        );
    }
    Ok(())
}

fn cmd_chain(path: &str) -> io::Result<()> {
    let blob = fs::read(path)?;
    let head = ChainHead::parse(&blob).map_err(vdisk_err)?;

    println!("img_path         = <{}>", head.os_param.img_path_str());
    println!("param checksum   = {}", if head.os_param.verify() { "ok" } else { "BAD" });
    println!("disk_sector_size = {}", head.disk_sector_size);
    println!("real_img_size    = {}", head.real_img_size_in_bytes);
    println!("virt_img_size    = {}", head.virt_img_size_in_bytes);
    println!("boot_catalog     = {}", head.boot_catalog);
    println!(
        "tables           = {} chunks @{}, {} overrides @{}, {} virtual @{}",
        head.img_chunk_num,
        head.img_chunk_offset,
        head.override_chunk_num,
        head.override_chunk_offset,
        head.virt_chunk_num,
        head.virt_chunk_offset
    );

    let ctx = head
        .into_context(&blob, VdiskConfig::default())
        .map_err(vdisk_err)?;

    for (i, chunk) in ctx.chunks().iter().enumerate() {
        println!(
            "  chunk    [{:4}] img {}-{} -> disk {}-{}",
            i, chunk.img_start_sector, chunk.img_end_sector, chunk.disk_start_sector,
            chunk.disk_end_sector
        );
    }
    for (i, entry) in ctx.overrides().iter().enumerate() {
        println!(
            "  override [{:4}] offset 0x{:x} size {}",
            i, entry.img_offset, entry.override_size
        );
    }
    for (i, entry) in ctx.virt().chunks().iter().enumerate() {
        println!(
            "  virtual  [{:4}] mem {}-{} @0x{:x}, remap {}-{} -> {}",
            i,
            entry.mem_sector_start,
            entry.mem_sector_end,
            entry.mem_sector_offset,
            entry.remap_sector_start,
            entry.remap_sector_end,
            entry.org_sector_start
        );
    }
    Ok(())
}

/// Serve the whole virtual image from the backing disk image into a file
fn cmd_extract(chain: &str, disk_path: &str, out_path: &str, fixup: bool) -> io::Result<()> {
    let blob = fs::read(chain)?;
    let head = ChainHead::parse(&blob).map_err(vdisk_err)?;
    let mut disk = FileDisk::open(Path::new(disk_path), head.disk_sector_size)?;

    let config = VdiskConfig {
        fixup_iso9660: fixup,
        ..VdiskConfig::default()
    };
    let ctx = head.into_context(&blob, config).map_err(vdisk_err)?;
    let image = MappedImage::new(ctx, &mut disk).map_err(vdisk_err)?;
    let mut device =
        VirtualBlockDevice::new(image, HostBlockSize::Native2048).map_err(vdisk_err)?;

    let blocks = device.media().last_block + 1;
    let mut out = io::BufWriter::new(fs::File::create(out_path)?);
    let mut buf = vec![0u8; EXTRACT_BATCH * 2048];

    let mut lba = 0u64;
    while lba < blocks {
        let n = (blocks - lba).min(EXTRACT_BATCH as u64) as usize;
        if let Err(e) = device.read(lba, &mut buf[..n * 2048]) {
            eprintln!("read failed at sector {}: {}", lba, e);
            dump_engine_log();
            process::exit(1);
        }
        out.write_all(&buf[..n * 2048])?;
        lba += n as u64;
    }
    out.flush()?;

    println!("wrote {} sectors to {}", blocks, out_path);
    Ok(())
}

fn main() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let prog = args.first().map(String::as_str).unwrap_or("vdisk-dump");
    if args.len() < 3 {
        usage(prog);
    }

    match args[1].as_str() {
        "param" => {
            let verbose = args[3..].iter().any(|a| a == "-v");
            cmd_param(&args[2], verbose)
        }
        "location" => cmd_location(&args[2]),
        "chain" => cmd_chain(&args[2]),
        "extract" if args.len() >= 5 => {
            let fixup = args[5..].iter().any(|a| a == "--fixup");
            cmd_extract(&args[2], &args[3], &args[4], fixup)
        }
        _ => usage(prog),
    }
}
