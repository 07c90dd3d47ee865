//! Emulated BIOS interrupt services.
//!
//! Each handler touches only the registers and memory the real BIOS call
//! would, then unwinds the interrupt frame with `reti`. Success and failure
//! are reported through the carry flag in the pushed flags word; an
//! interrupt the monitor does not implement answers with carry set rather
//! than failing the session.

use log::warn;

use crate::console;
use crate::dos;
use crate::floppy::SECTOR_SIZE;
use crate::vm::Vm;
use crate::VmError;

/// Unpack the INT 13h CX/DX register encoding into
/// (cylinder, head, zero-based sector, drive).
pub fn decode_chs(cx: u16, dx: u16) -> (u16, u8, u8, u8) {
    // CH holds the low 8 cylinder bits, CL bits 6-7 the high 2;
    // CL bits 0-5 are the 1-based sector number.
    let cylinder = (cx >> 8) | ((cx & 0xC0) << 2);
    let sector0 = ((cx & 0x3F) as u8).wrapping_sub(1);
    let head = (dx >> 8) as u8;
    let drive = (dx & 0xFF) as u8;
    (cylinder, head, sector0, drive)
}

/// Dispatch one trapped interrupt and return to the guest.
pub fn handle_bios_call(vm: &mut Vm, nr: u8) -> Result<(), VmError> {
    // The DOS system-call surface runs through the same trap path when the
    // guest has not installed its own INT 21h handler; it owns its frame.
    if nr == 0x21 {
        return dos::handle_system_call(vm);
    }

    vm.clear_carry();
    match nr {
        0x10 => handle_video(vm)?,
        // Equipment list: one floppy, nothing else.
        0x11 => vm.cpu.regs.rax = 0x1,
        // Conventional memory size in KiB.
        0x12 => vm.cpu.regs.rax = 256,
        0x13 => handle_disk(vm)?,
        0x16 => handle_keyboard(vm)?,
        // Printer services: no printer.
        0x17 => vm.set_carry(),
        0x20 => {
            // Program terminate, planted in the PSP of direct executables.
            console::flush()?;
            std::process::exit(0);
        }
        _ => {
            warn!("unhandled interrupt {nr:#04x}");
            vm.set_carry();
        }
    }
    vm.reti();
    Ok(())
}

fn handle_video(vm: &mut Vm) -> Result<(), VmError> {
    let ah = ((vm.cpu.regs.rax >> 8) & 0xFF) as u8;
    match ah {
        // Teletype output.
        0x0E => {
            console::write_char((vm.cpu.regs.rax & 0xFF) as u8)?;
            console::flush()?;
        }
        // Set cursor shape.
        0x01 => {}
        // Get video mode: unsupported.
        0x0F => vm.set_carry(),
        _ => warn!("unhandled video function {ah:#04x}"),
    }
    Ok(())
}

fn handle_disk(vm: &mut Vm) -> Result<(), VmError> {
    let ah = ((vm.cpu.regs.rax >> 8) & 0xFF) as u8;
    match ah {
        // Reset.
        0x00 => {
            if vm.cpu.regs.rdx & 0x7F != 0 {
                vm.set_carry();
            }
            vm.cpu.regs.rax = 0;
        }
        // Read (2) / write (3) sectors.
        0x02 | 0x03 => {
            let count = (vm.cpu.regs.rax & 0xFF) as usize;
            let (cylinder, head, sector0, drive) =
                decode_chs(vm.cpu.regs.rcx as u16, vm.cpu.regs.rdx as u16);
            if drive != 0 {
                warn!("disk transfer on unknown drive {drive}");
                vm.set_carry();
                vm.cpu.regs.rax = 0x01 << 8;
                return Ok(());
            }
            let addr = (vm.cpu.sregs.es.base + vm.cpu.regs.rbx) as usize;
            let floppy = vm.floppy.as_ref().ok_or(VmError::NoFloppy)?;
            let lba = crate::floppy::chs_to_lba(
                cylinder,
                head,
                sector0,
                floppy.sectors_per_track(),
                floppy.num_heads(),
            );
            let len = count * SECTOR_SIZE;
            let mut buf = vec![0u8; len];
            if ah == 0x02 {
                floppy.read_sectors(lba, &mut buf)?;
                vm.mem.write_bytes(addr, &buf);
            } else {
                buf.copy_from_slice(vm.mem.slice(addr, len));
                floppy.write_sectors(lba, &buf)?;
            }
            vm.cpu.regs.rax = count as u64;
        }
        // Get drive parameters.
        0x08 => {
            if vm.cpu.regs.rdx & 0xFF != 0 {
                vm.set_carry();
                return Ok(());
            }
            let floppy = vm.floppy.as_ref().ok_or(VmError::NoFloppy)?;
            let (cylinders, spt, heads) = (
                floppy.num_cylinders(),
                floppy.sectors_per_track(),
                floppy.num_heads(),
            );
            vm.cpu.regs.rax = 0;
            vm.cpu.regs.rbx = floppy.format.drive_type() as u64;
            vm.cpu.regs.rcx = ((cylinders as u64) << 8) | spt as u64;
            vm.cpu.regs.rdx = ((heads as u64) << 8) | 1;
        }
        // Get disk type.
        0x15 => {
            if vm.cpu.regs.rdx & 0xFF != 0 {
                warn!("disk type query on unknown drive {}", vm.cpu.regs.rdx & 0xFF);
                vm.set_carry();
                return Ok(());
            }
            let floppy = vm.floppy.as_ref().ok_or(VmError::NoFloppy)?;
            let total = floppy.total_sectors();
            vm.cpu.regs.rcx = (total >> 16) as u64;
            vm.cpu.regs.rdx = (total & 0xFFFF) as u64;
            // Floppy without change-line support.
            vm.cpu.regs.rax = 1 << 8;
        }
        _ => {
            warn!("unhandled disk function {ah:#04x}");
            vm.set_carry();
            vm.cpu.regs.rax = 0x0100;
        }
    }
    Ok(())
}

fn handle_keyboard(vm: &mut Vm) -> Result<(), VmError> {
    let ah = ((vm.cpu.regs.rax >> 8) & 0xFF) as u8;
    match ah {
        // Blocking read.
        0x00 | 0x10 => {
            let mut c = console::read_char()?;
            if c == b'\n' {
                c = b'\r';
            }
            vm.cpu.regs.rax = c as u64;
        }
        // Non-blocking poll: ZF set means nothing pending.
        0x01 | 0x11 => {
            if console::input_ready()? {
                vm.clear_zero();
            } else {
                vm.set_zero();
            }
            vm.cpu.regs.rax = b'?' as u64;
        }
        _ => {
            warn!("unhandled keyboard function {ah:#04x}");
            vm.set_zero();
            vm.set_carry();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chs_simple() {
        // CH=0, CL=1 (sector 1), DH=0, DL=0.
        assert_eq!(decode_chs(0x0001, 0x0000), (0, 0, 0, 0));
        // CH=5, CL=9, DH=1, DL=0.
        assert_eq!(decode_chs(0x0509, 0x0100), (5, 1, 8, 0));
    }

    #[test]
    fn test_decode_chs_high_cylinder_bits() {
        // CL bits 6-7 extend the cylinder to 10 bits: CH=0x04, CL=0xC1
        // encodes cylinder 0x304, sector 1.
        assert_eq!(decode_chs(0x04C1, 0x0000), (0x304, 0, 0, 0));
    }

    #[test]
    fn test_decode_chs_drive_byte() {
        assert_eq!(decode_chs(0x0001, 0x0081).3, 0x81);
    }
}
