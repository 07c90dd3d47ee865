//! Floppy disk image access and the FAT12 reader.
//!
//! The image is addressed two ways: flat LBA sector I/O for the BIOS 13h
//! and DOS driver transfer paths, and a read-only FAT12 view used to pull
//! individual files (the DOS kernel, COMMAND.COM) out of the unmounted
//! image by 8.3 name.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::VmError;

pub const SECTOR_SIZE: usize = 512;

/// Supported floppy geometries; any other image size is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloppyFormat {
    /// 360KB - 5.25" DD (40 tracks, 9 sectors, 2 heads)
    Floppy360K,
    /// 1.44MB - 3.5" HD (80 tracks, 18 sectors, 2 heads)
    Floppy1_44M,
}

impl FloppyFormat {
    pub fn from_size(size: u64) -> Option<Self> {
        match size {
            368_640 => Some(FloppyFormat::Floppy360K),
            1_474_560 => Some(FloppyFormat::Floppy1_44M),
            _ => None,
        }
    }

    /// Get the geometry (cylinders, sectors_per_track, heads) for this format
    pub fn geometry(&self) -> (u16, u8, u8) {
        match self {
            FloppyFormat::Floppy360K => (40, 9, 2),
            FloppyFormat::Floppy1_44M => (80, 18, 2),
        }
    }

    /// BIOS drive type code reported by INT 13h function 8.
    pub fn drive_type(&self) -> u8 {
        match self {
            FloppyFormat::Floppy360K => 1,
            FloppyFormat::Floppy1_44M => 4,
        }
    }
}

/// The BPB fields the monitor cares about; also the packed parameter block
/// handed to the DOS kernel's disk driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors: u16,
}

impl Bpb {
    /// Legacy 360 KiB layout assumed when the boot sector carries no BPB.
    pub const LEGACY_360K: Bpb = Bpb {
        bytes_per_sector: 512,
        sectors_per_cluster: 2,
        reserved_sectors: 1,
        num_fats: 2,
        root_entries: 112,
        total_sectors: 640,
    };

    /// Parse the BPB at offset 11 of a boot sector. A declared sector size
    /// other than 512 means the sector holds no usable BPB.
    pub fn parse(boot: &[u8]) -> Option<Bpb> {
        if boot.len() < 24 {
            return None;
        }
        let bytes_per_sector = u16::from_le_bytes([boot[11], boot[12]]);
        if bytes_per_sector != 512 {
            return None;
        }
        Some(Bpb {
            bytes_per_sector,
            sectors_per_cluster: boot[13],
            reserved_sectors: u16::from_le_bytes([boot[14], boot[15]]),
            num_fats: boot[16],
            root_entries: u16::from_le_bytes([boot[17], boot[18]]),
            total_sectors: u16::from_le_bytes([boot[19], boot[20]]),
        })
    }

    /// Packed little-endian image for the driver parameter block.
    pub fn to_bytes(&self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0..2].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        out[2] = self.sectors_per_cluster;
        out[3..5].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        out[5] = self.num_fats;
        out[6..8].copy_from_slice(&self.root_entries.to_le_bytes());
        out[8..10].copy_from_slice(&self.total_sectors.to_le_bytes());
        out
    }
}

/// Standard CHS to LBA translation. `sector0` is the zero-based sector
/// (BIOS register values are 1-based).
pub fn chs_to_lba(cylinder: u16, head: u8, sector0: u8, spt: u8, heads: u8) -> u32 {
    sector0 as u32 + head as u32 * spt as u32 + cylinder as u32 * heads as u32 * spt as u32
}

/// Look up a 12-bit FAT entry; three bytes pack two entries.
pub fn fat12_entry(fat: &[u8], cluster: u16) -> u16 {
    let off = cluster as usize * 3 / 2;
    let lo = fat[off] as u16;
    let hi = fat[off + 1] as u16;
    if cluster & 1 == 0 {
        lo | ((hi & 0x0F) << 8)
    } else {
        (lo >> 4) | (hi << 4)
    }
}

/// End-of-chain marker range (0xFF8..=0xFFF, including the canonical 0xFFF).
fn fat12_end_of_chain(entry: u16) -> bool {
    entry >= 0xFF8
}

/// Build the 11-byte space-padded comparison name for a root entry.
fn padded_name(name: &str, ext: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    for (i, b) in name.bytes().take(8).enumerate() {
        out[i] = b;
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b;
    }
    out
}

/// An open floppy image: flat sector I/O plus a FAT12 view.
#[derive(Debug)]
pub struct Floppy {
    file: std::fs::File,
    pub format: FloppyFormat,
    pub bpb: Bpb,
    pub sectors_per_fat: u16,
}

impl Floppy {
    /// Open an image read-write, validating its size against the known
    /// geometries and reading the BPB (or assuming the legacy layout).
    pub fn open(path: &Path) -> Result<Self, VmError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        let format = FloppyFormat::from_size(size).ok_or(VmError::BadFloppySize(size))?;

        let mut boot = [0u8; SECTOR_SIZE];
        file.read_exact_at(&mut boot, 0)?;
        let (bpb, sectors_per_fat) = match Bpb::parse(&boot) {
            Some(bpb) => (bpb, u16::from_le_bytes([boot[22], boot[23]])),
            None => (Bpb::LEGACY_360K, 2),
        };

        Ok(Self {
            file,
            format,
            bpb,
            sectors_per_fat,
        })
    }

    pub fn num_cylinders(&self) -> u16 {
        self.format.geometry().0
    }

    pub fn sectors_per_track(&self) -> u8 {
        self.format.geometry().1
    }

    pub fn num_heads(&self) -> u8 {
        self.format.geometry().2
    }

    pub fn total_sectors(&self) -> u32 {
        let (c, s, h) = self.format.geometry();
        c as u32 * s as u32 * h as u32
    }

    /// Read whole sectors starting at `lba` into `buf`.
    pub fn read_sectors(&self, lba: u32, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, lba as u64 * SECTOR_SIZE as u64)
    }

    /// Write whole sectors starting at `lba` from `buf`.
    pub fn write_sectors(&self, lba: u32, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, lba as u64 * SECTOR_SIZE as u64)
    }

    /// Extract a file's contents by 8.3 name, or `None` if no root
    /// directory entry matches.
    pub fn read_file(&self, name: &str, ext: &str) -> Result<Option<Vec<u8>>, VmError> {
        let wanted = padded_name(name, ext);
        let bpb = &self.bpb;

        let fat_start = bpb.reserved_sectors as u32;
        let mut fat = vec![0u8; self.sectors_per_fat as usize * SECTOR_SIZE];
        self.read_sectors(fat_start, &mut fat)?;

        let root_start = fat_start + bpb.num_fats as u32 * self.sectors_per_fat as u32;
        let root_bytes = bpb.root_entries as usize * 32;
        let mut root = vec![0u8; root_bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE];
        self.read_sectors(root_start, &mut root)?;

        let data_start = root_start + (root_bytes.div_ceil(SECTOR_SIZE)) as u32;
        let cluster_bytes = bpb.sectors_per_cluster as usize * SECTOR_SIZE;

        for entry in root[..root_bytes].chunks_exact(32) {
            if entry[0] == 0 {
                break; // end of directory
            }
            if entry[0] == 0xE5 {
                continue; // deleted
            }
            if entry[0..11] != wanted {
                continue;
            }

            let first_cluster = u16::from_le_bytes([entry[26], entry[27]]);
            let size = u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]) as usize;

            let mut out = vec![0u8; size];
            let mut pos = 0;
            let mut cluster = first_cluster;
            let mut buf = vec![0u8; cluster_bytes];
            while cluster >= 2 && !fat12_end_of_chain(cluster) && pos < size {
                let lba = data_start + (cluster as u32 - 2) * bpb.sectors_per_cluster as u32;
                self.read_sectors(lba, &mut buf)?;
                let take = cluster_bytes.min(size - pos);
                out[pos..pos + take].copy_from_slice(&buf[..take]);
                pos += take;
                cluster = fat12_entry(&fat, cluster);
            }
            return Ok(Some(out));
        }
        Ok(None)
    }
}
