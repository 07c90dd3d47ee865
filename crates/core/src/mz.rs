//! MZ executable loader for direct-executable mode.
//!
//! Parses the 28-byte MZ header, copies the load image to the fixed
//! executable segment, applies relocations in guest memory, builds the
//! Program Segment Prefix, and sets initial CPU state from the header.

use kvm_bindings::{kvm_regs, kvm_sregs};

use crate::cpu::set_seg;
use crate::layout::{EXE_SEG, PSP_SEG};
use crate::memory::{GuestMemory, TRAP_SEG_BASE};
use crate::vm::Vm;
use crate::VmError;

pub const HEADER_SIZE: usize = 28;

/// Parsed MZ header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MzHeader {
    pub extra_bytes: u16,
    pub pages: u16,
    pub reloc_items: u16,
    pub header_paragraphs: u16,
    pub min_alloc: u16,
    pub max_alloc: u16,
    pub initial_ss: u16,
    pub initial_sp: u16,
    pub checksum: u16,
    pub initial_ip: u16,
    pub initial_cs: u16,
    pub reloc_table: u16,
    pub overlay: u16,
}

impl MzHeader {
    pub fn parse(image: &[u8]) -> Result<Self, VmError> {
        if image.len() < HEADER_SIZE {
            return Err(VmError::InvalidExecutable("file shorter than the header"));
        }
        if &image[0..2] != b"MZ" {
            return Err(VmError::InvalidExecutable("missing MZ signature"));
        }
        let word = |off: usize| u16::from_le_bytes([image[off], image[off + 1]]);
        Ok(Self {
            extra_bytes: word(2),
            pages: word(4),
            reloc_items: word(6),
            header_paragraphs: word(8),
            min_alloc: word(10),
            max_alloc: word(12),
            initial_ss: word(14),
            initial_sp: word(16),
            checksum: word(18),
            initial_ip: word(20),
            initial_cs: word(22),
            reloc_table: word(24),
            overlay: word(26),
        })
    }

    /// The relocation table as (offset, segment) pairs.
    pub fn relocations(&self, image: &[u8]) -> Result<Vec<(u16, u16)>, VmError> {
        let start = self.reloc_table as usize;
        let end = start + self.reloc_items as usize * 4;
        if end > image.len() {
            return Err(VmError::InvalidExecutable("relocation table out of range"));
        }
        Ok(image[start..end]
            .chunks_exact(4)
            .map(|e| {
                (
                    u16::from_le_bytes([e[0], e[1]]),
                    u16::from_le_bytes([e[2], e[3]]),
                )
            })
            .collect())
    }
}

/// Build the 256-byte Program Segment Prefix at the PSP segment: an INT 20h
/// terminate vector, the top-of-memory word, and the command tail.
pub fn build_psp(mem: &mut GuestMemory, command_tail: &str) {
    let base = PSP_SEG as usize * 16;
    mem.fill(base, 256, 0);
    mem.write_bytes(base, &[0xCD, 0x20]); // int 20h
    mem.write_u16(base + 2, 0x7FFF); // first segment past available memory

    let tail = &command_tail.as_bytes()[..command_tail.len().min(126)];
    mem.write_u8(base + 0x80, tail.len() as u8);
    mem.write_bytes(base + 0x81, tail);
    mem.write_u8(base + 0x81 + tail.len(), 0x0D);
}

/// Place a parsed executable in guest memory and set initial CPU state.
pub fn install(
    mem: &mut GuestMemory,
    regs: &mut kvm_regs,
    sregs: &mut kvm_sregs,
    image: &[u8],
    command_tail: &str,
) -> Result<(), VmError> {
    let header = MzHeader::parse(image)?;
    let load_off = header.header_paragraphs as usize * 16;
    if load_off > image.len() {
        return Err(VmError::InvalidExecutable("header size exceeds the file"));
    }
    let data = &image[load_off..];

    let dst = EXE_SEG as usize * 16;
    if dst + data.len() + header.min_alloc as usize * 16 > TRAP_SEG_BASE {
        return Err(VmError::InvalidExecutable("image does not fit in guest memory"));
    }

    build_psp(mem, command_tail);
    mem.write_bytes(dst, data);
    mem.fill(dst + data.len(), header.min_alloc as usize * 16, 0);

    for (offset, segment) in header.relocations(image)? {
        let addr = dst + segment as usize * 16 + offset as usize;
        if addr + 2 > TRAP_SEG_BASE {
            return Err(VmError::InvalidExecutable("relocation outside guest memory"));
        }
        let word = mem.read_u16(addr);
        mem.write_u16(addr, word.wrapping_add(EXE_SEG));
    }

    set_seg(&mut sregs.ds, PSP_SEG);
    set_seg(&mut sregs.es, PSP_SEG);
    set_seg(&mut sregs.cs, EXE_SEG.wrapping_add(header.initial_cs));
    set_seg(&mut sregs.ss, EXE_SEG.wrapping_add(header.initial_ss));
    regs.rip = header.initial_ip as u64;
    regs.rsp = header.initial_sp as u64;
    Ok(())
}

/// Load an executable file into a VM session. A missing or malformed file
/// is reported to the caller, not fatal to the process.
pub fn load(vm: &mut Vm, path: &std::path::Path, command_tail: &str) -> Result<(), VmError> {
    let image = std::fs::read(path)?;
    install(
        &mut vm.mem,
        &mut vm.cpu.regs,
        &mut vm.cpu.sregs,
        &image,
        command_tail,
    )
}
