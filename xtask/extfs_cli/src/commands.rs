use std::{io::Write, path::Path, time::SystemTime};

use anyhow::{Context, Result, bail};
use extfs::{
    Disk, Ext4FileSystem, FormatOptions, MountOptions, Partition,
    api::{self, read_file},
    has_partition_table, list_partitions, open_partition,
};
use log::{debug, info};

use crate::{
    args::{Args, Command},
    blockdev::FileDisk,
    util::{align_up, ensure_parent, mode_string},
};

const CAT_CHUNK: usize = 64 * 1024;

/// Executes one command against the image named in `args`.
pub fn run(args: Args, out: &mut dyn Write) -> Result<()> {
    match args.command {
        Command::Mkfs {
            block_size,
            inode_size,
            ref label,
            size,
        } => {
            let opts = FormatOptions {
                block_size,
                inode_size,
                label: label.clone(),
                uuid: volume_uuid(),
                ..FormatOptions::default()
            };
            return format(&args, size, &opts, out);
        }
        Command::Parts => {
            let disk = open_disk(&args.image, true)?;
            return print_partitions(&disk, out);
        }
        _ => {}
    }

    let read_only = args.read_only || !args.command.writes();
    let disk = open_disk(&args.image, read_only)?;
    let part = select_partition(&disk, args.part)?;
    let mut fs = Ext4FileSystem::mount_with(part, MountOptions { read_only })
        .with_context(|| format!("failed to mount {}", args.image.display()))?;

    dispatch(&mut fs, args.command, out)?;
    api::unmount(fs).context("failed to unmount")?;
    Ok(())
}

fn dispatch(fs: &mut Ext4FileSystem<FileDisk>, command: Command, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Info => {
            let st = fs.stat_fs();
            writeln!(out, "label:        {}", st.label.as_deref().unwrap_or("<none>"))?;
            writeln!(out, "block size:   {}", st.block_size)?;
            writeln!(out, "groups:       {}", st.groups)?;
            writeln!(out, "blocks:       {} ({} free)", st.blocks, st.free_blocks)?;
            writeln!(out, "inodes:       {} ({} free)", st.inodes, st.free_inodes)?;
        }
        Command::Ls { path } => {
            let mut lines = Vec::new();
            api::iterate_directory(fs, &path, |name, stat, is_dir| {
                let suffix = if is_dir { "/" } else { "" };
                lines.push(format!(
                    "{} {:>10} {name}{suffix}",
                    mode_string(stat.mode),
                    stat.size
                ));
            })
            .with_context(|| format!("cannot list {path}"))?;
            for line in lines {
                writeln!(out, "{line}")?;
            }
        }
        Command::Cat { path } => {
            let mut file = api::open_file(fs, &path).with_context(|| format!("cannot open {path}"))?;
            let mut buf = vec![0u8; CAT_CHUNK];
            let mut offset = 0u64;
            loop {
                let n = read_file(fs, &mut file, offset, &mut buf)
                    .with_context(|| format!("read of {path} failed at {offset}"))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                offset += n as u64;
            }
            api::close_file(file);
        }
        Command::Stat { path } => {
            let file = api::open_file(fs, &path).with_context(|| format!("cannot open {path}"))?;
            let st = api::stat_file(&file);
            writeln!(out, "inode: {}", st.ino)?;
            writeln!(out, "mode:  {} ({:o})", mode_string(st.mode), st.mode)?;
            writeln!(out, "size:  {}", st.size)?;
            writeln!(out, "links: {}", st.links)?;
            writeln!(out, "atime: {}  mtime: {}  ctime: {}", st.atime, st.mtime, st.ctime)?;
            api::close_file(file);
        }
        Command::Put { src, dest } => {
            let data = std::fs::read(&src)
                .with_context(|| format!("failed to read {}", src.display()))?;
            let ino = fs
                .write_new_file(&dest, &data)
                .with_context(|| format!("cannot write {dest}"))?;
            info!("wrote {} bytes to {dest} (inode {ino})", data.len());
        }
        Command::Rm { path } => {
            fs.delete_file(&path)
                .with_context(|| format!("cannot remove {path}"))?;
        }
        Command::Mkdir { path } => {
            fs.mkdir(&path)
                .with_context(|| format!("cannot create directory {path}"))?;
        }
        Command::Ln {
            symbolic,
            target,
            path,
        } => {
            if !symbolic {
                bail!("hard links are not supported, use -s");
            }
            fs.symlink(&path, &target)
                .with_context(|| format!("cannot link {path} -> {target}"))?;
        }
        Command::Mkfs { .. } | Command::Parts => bail!("command works on the raw image"),
    }
    Ok(())
}

fn open_disk(path: &Path, readonly: bool) -> Result<Disk<FileDisk>> {
    let dev = FileDisk::open(path, readonly)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Disk::new(dev))
}

/// `Some(0)` is the whole image; no choice picks partition 1 on partitioned
/// images.
fn select_partition(disk: &Disk<FileDisk>, part: Option<u32>) -> Result<Partition<FileDisk>> {
    let number = match part {
        Some(n) => n,
        None if has_partition_table(disk).context("failed to read sector 0")? => 1,
        None => 0,
    };
    debug!("using partition {number}");
    open_partition(disk, number).with_context(|| format!("partition {number} unavailable"))
}

fn format(args: &Args, size: Option<u64>, opts: &FormatOptions, out: &mut dyn Write) -> Result<()> {
    if args.read_only {
        bail!("mkfs needs write access");
    }
    let disk = match size {
        Some(size) => {
            ensure_parent(&args.image)
                .with_context(|| format!("failed to create parent of {}", args.image.display()))?;
            let size = align_up(size, opts.block_size as u64);
            let dev = FileDisk::create(&args.image, size)
                .with_context(|| format!("failed to create {}", args.image.display()))?;
            Disk::new(dev)
        }
        None => open_disk(&args.image, false)?,
    };
    let part = select_partition(&disk, args.part)?;
    extfs::mkfs(&part, opts).context("format failed")?;

    let fs = Ext4FileSystem::mount_with(part, MountOptions::read_only())
        .context("formatted volume does not mount")?;
    let st = fs.stat_fs();
    writeln!(
        out,
        "formatted {}: {} blocks of {} bytes, {} inodes in {} groups",
        args.image.display(),
        st.blocks,
        st.block_size,
        st.inodes,
        st.groups
    )?;
    api::unmount(fs)?;
    Ok(())
}

fn print_partitions(disk: &Disk<FileDisk>, out: &mut dyn Write) -> Result<()> {
    if !has_partition_table(disk).context("failed to read sector 0")? {
        writeln!(out, "no partition table")?;
        return Ok(());
    }
    for p in list_partitions(disk).context("failed to read partition table")? {
        writeln!(
            out,
            "{:>2} {:>10} {:>10} type {:#04x}{}{}",
            p.number,
            p.start_sector,
            p.sectors,
            p.kind,
            if p.bootable { " boot" } else { "" },
            if p.logical { " logical" } else { "" }
        )?;
    }
    Ok(())
}

/// Version 4 style uuid from the clock and the pid.
fn volume_uuid() -> [u8; 16] {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut bytes = (nanos ^ ((std::process::id() as u128) << 96)).to_le_bytes();
    // RFC 4122 version 4, variant 1
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    bytes
}
