use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Parse human-readable size strings like 64M, 512K, or raw bytes.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("size is empty".to_string());
    }

    let (num_str, unit) = s.split_at(s.len().saturating_sub(1));
    let (value, multiplier) = match unit.to_ascii_lowercase().as_str() {
        "k" => (num_str, 1024u64),
        "m" => (num_str, 1024u64 * 1024),
        "g" => (num_str, 1024u64 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num: u64 = value
        .parse()
        .map_err(|_| format!("invalid size: {input}"))?;
    Ok(num.saturating_mul(multiplier))
}

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and edit ext2/3/4 disk images")]
pub struct Args {
    /// Disk image path.
    pub image: PathBuf,

    /// Partition number; 0 selects the whole image. Defaults to 1 when the
    /// image carries a partition table.
    #[arg(long)]
    pub part: Option<u32>,

    /// Refuse every modification.
    #[arg(long)]
    pub read_only: bool,

    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print volume geometry, free counts and label.
    Info,
    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file to stdout.
    Cat { path: String },
    /// Print the inode summary of a file.
    Stat { path: String },
    /// Copy a host file into the volume, replacing an existing file.
    Put { src: PathBuf, dest: String },
    /// Remove a file or symlink.
    Rm { path: String },
    /// Create a directory.
    Mkdir { path: String },
    /// Create a link; only symbolic links are supported.
    Ln {
        #[arg(short = 's', long)]
        symbolic: bool,
        target: String,
        path: String,
    },
    /// Format the image, creating it when `--size` is given.
    Mkfs {
        #[arg(long, default_value_t = 4096)]
        block_size: usize,
        #[arg(long, default_value_t = 256)]
        inode_size: u16,
        #[arg(long)]
        label: Option<String>,
        /// Image size (bytes or with K/M/G suffix).
        #[arg(long, value_parser = parse_size)]
        size: Option<u64>,
    },
    /// List the partition table.
    Parts,
}

impl Command {
    /// Whether the command changes the volume.
    pub fn writes(&self) -> bool {
        matches!(
            self,
            Command::Put { .. }
                | Command::Rm { .. }
                | Command::Mkdir { .. }
                | Command::Ln { .. }
                | Command::Mkfs { .. }
        )
    }
}

/// Parse CLI args into a structured Args value.
pub fn parse_args() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("12X").is_err());
    }

    #[test]
    fn test_ln_flag_and_defaults() {
        let args = Args::try_parse_from(["extfs", "disk.img", "ln", "-s", "/a", "/b"]).unwrap();
        match args.command {
            Command::Ln {
                symbolic,
                target,
                path,
            } => {
                assert!(symbolic);
                assert_eq!((target.as_str(), path.as_str()), ("/a", "/b"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let args = Args::try_parse_from(["extfs", "-vv", "disk.img", "ls"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.command, Command::Ls { ref path } if path == "/"));
        assert!(!args.command.writes());
    }
}
