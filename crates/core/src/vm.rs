//! VM session and real-mode call/return emulation.
//!
//! The hardware never delivers or returns from an interrupt on its own;
//! every far call, far return, and interrupt return the guest observes is
//! synthesized here by editing the guest stack and the register copies
//! between execution steps.

use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::{Kvm, VmFd};
use log::debug;

use crate::cpu::{set_seg, ExitEvent, GuestCpu, FLAGS_CF, FLAGS_IF, FLAGS_ZF};
use crate::dos::DosFiles;
use crate::floppy::{Floppy, SECTOR_SIZE};
use crate::layout::{AddressLayout, BIOS_TRAP_SEG, RETURN_TO_MONITOR};
use crate::memory::GuestMemory;
use crate::{bios, dos, VmError};

/// Decrement SP by two and store a 16-bit value at the new top of stack.
pub fn push16(mem: &mut GuestMemory, regs: &mut kvm_regs, sregs: &kvm_sregs, value: u16) {
    regs.rsp -= 2;
    let addr = (sregs.ss.base + regs.rsp) as usize;
    mem.write_u16(addr, value);
}

/// Jump to `segment:offset` with a synthetic return frame on the stack:
/// flags, then the fixed monitor return address F000:0200. A routine that
/// returns normally therefore halts at the return-to-monitor trap.
pub fn far_call(
    mem: &mut GuestMemory,
    regs: &mut kvm_regs,
    sregs: &mut kvm_sregs,
    segment: u16,
    offset: u16,
) {
    push16(mem, regs, sregs, regs.rflags as u16);
    push16(mem, regs, sregs, BIOS_TRAP_SEG);
    push16(mem, regs, sregs, RETURN_TO_MONITOR);
    set_seg(&mut sregs.cs, segment);
    regs.rip = offset as u64;
}

/// Pop offset and segment (4 bytes) and jump there, exactly as a RETF would.
pub fn far_ret(mem: &GuestMemory, regs: &mut kvm_regs, sregs: &mut kvm_sregs) {
    let addr = (sregs.ss.base + regs.rsp) as usize;
    let ip = mem.read_u16(addr);
    let cs = mem.read_u16(addr + 2);
    set_seg(&mut sregs.cs, cs);
    regs.rip = ip as u64;
    regs.rsp += 4;
}

/// Pop offset, segment, and flags (6 bytes) and restore them, exactly as an
/// IRET would. The flags word comes from the stack, which is why handlers
/// edit the pushed copy rather than the live register.
pub fn reti(mem: &GuestMemory, regs: &mut kvm_regs, sregs: &mut kvm_sregs) {
    let addr = (sregs.ss.base + regs.rsp) as usize;
    let ip = mem.read_u16(addr);
    let cs = mem.read_u16(addr + 2);
    let flags = mem.read_u16(addr + 4);
    set_seg(&mut sregs.cs, cs);
    regs.rflags = flags as u64;
    regs.rip = ip as u64;
    regs.rsp += 6;
}

/// Build an interrupt entry frame and jump through the IVT: push flags and
/// the fixed monitor return address, clear IF, and load CS:IP from vector
/// `nr`, exactly as hardware interrupt delivery would.
pub fn deliver_intr(mem: &mut GuestMemory, regs: &mut kvm_regs, sregs: &mut kvm_sregs, nr: u8) {
    let flags = regs.rflags as u16;
    push16(mem, regs, sregs, flags);
    push16(mem, regs, sregs, BIOS_TRAP_SEG);
    push16(mem, regs, sregs, RETURN_TO_MONITOR);
    let ip = mem.read_u16(nr as usize * 4);
    let cs = mem.read_u16(nr as usize * 4 + 2);
    regs.rflags &= !FLAGS_IF;
    set_seg(&mut sregs.cs, cs);
    regs.rip = ip as u64;
}

fn stack_flags_addr(regs: &kvm_regs, sregs: &kvm_sregs) -> usize {
    // SS:SP -> ip at +0, cs at +2, flags at +4.
    (sregs.ss.base + regs.rsp + 4) as usize
}

fn update_stack_flags(
    mem: &mut GuestMemory,
    regs: &kvm_regs,
    sregs: &kvm_sregs,
    mask: u16,
    set: bool,
) {
    let addr = stack_flags_addr(regs, sregs);
    let flags = mem.read_u16(addr);
    let flags = if set { flags | mask } else { flags & !mask };
    mem.write_u16(addr, flags);
}

/// One monitor session: KVM handles, guest memory, one vCPU, and the
/// host-side device state the emulated services need.
pub struct Vm {
    _kvm: Kvm,
    _vm: VmFd,
    pub mem: GuestMemory,
    pub cpu: GuestCpu,
    pub layout: AddressLayout,
    pub floppy: Option<Floppy>,
    pub files: DosFiles,
}

impl Vm {
    /// Open /dev/kvm, create the VM and vCPU, and map guest memory.
    pub fn new() -> Result<Self, VmError> {
        let kvm = Kvm::new()?;
        let vm = kvm.create_vm()?;
        let mem = GuestMemory::new()?;
        mem.register(&vm)?;
        let cpu = GuestCpu::new(&vm)?;
        Ok(Self {
            _kvm: kvm,
            _vm: vm,
            mem,
            cpu,
            layout: AddressLayout::default(),
            floppy: None,
            files: DosFiles::new(),
        })
    }

    /// Attach the floppy image backing BIOS 13h and the DOS driver.
    pub fn set_floppy(&mut self, path: &std::path::Path) -> Result<(), VmError> {
        self.floppy = Some(Floppy::open(path)?);
        Ok(())
    }

    /// Copy the image's first sector to 0000:7C00 for boot-sector mode.
    pub fn load_boot_sector(&mut self) -> Result<(), VmError> {
        let floppy = self.floppy.as_ref().ok_or(VmError::NoFloppy)?;
        let mut boot = [0u8; SECTOR_SIZE];
        floppy.read_sectors(0, &mut boot)?;
        self.mem.write_bytes(0x7C00, &boot);
        Ok(())
    }

    pub fn push16(&mut self, value: u16) {
        push16(&mut self.mem, &mut self.cpu.regs, &self.cpu.sregs, value);
    }

    pub fn far_call(&mut self, segment: u16, offset: u16) {
        far_call(
            &mut self.mem,
            &mut self.cpu.regs,
            &mut self.cpu.sregs,
            segment,
            offset,
        );
    }

    pub fn far_ret(&mut self) {
        far_ret(&self.mem, &mut self.cpu.regs, &mut self.cpu.sregs);
    }

    pub fn reti(&mut self) {
        reti(&self.mem, &mut self.cpu.regs, &mut self.cpu.sregs);
    }

    /// Set the carry flag in the flags word pushed on the guest stack.
    pub fn set_carry(&mut self) {
        update_stack_flags(
            &mut self.mem,
            &self.cpu.regs,
            &self.cpu.sregs,
            FLAGS_CF as u16,
            true,
        );
    }

    pub fn clear_carry(&mut self) {
        update_stack_flags(
            &mut self.mem,
            &self.cpu.regs,
            &self.cpu.sregs,
            FLAGS_CF as u16,
            false,
        );
    }

    pub fn set_zero(&mut self) {
        update_stack_flags(
            &mut self.mem,
            &self.cpu.regs,
            &self.cpu.sregs,
            FLAGS_ZF as u16,
            true,
        );
    }

    pub fn clear_zero(&mut self) {
        update_stack_flags(
            &mut self.mem,
            &self.cpu.regs,
            &self.cpu.sregs,
            FLAGS_ZF as u16,
            false,
        );
    }

    /// Deliver interrupt `nr` into the guest through its IVT and pump the
    /// dispatch loop until the handler returns to the monitor.
    pub fn invoke_intr(&mut self, nr: u8) -> Result<(), VmError> {
        deliver_intr(&mut self.mem, &mut self.cpu.regs, &mut self.cpu.sregs, nr);
        self.run_until_return()
    }

    /// The trap-and-emulate loop: step the guest, service the trap, resume;
    /// returns when the guest hands control back through the monitor-return
    /// trap. A single-step trap reaching this loop means nobody armed
    /// tracing on purpose, which is a protocol violation.
    pub fn run_until_return(&mut self) -> Result<(), VmError> {
        let layout = self.layout;
        loop {
            let event = match self.cpu.run(&layout, false) {
                Ok(event) => event,
                Err(e) => {
                    // Fatal stop: the register dump has already happened,
                    // complete the picture with the vector table.
                    self.mem.dump_ivt();
                    return Err(e);
                }
            };
            match event {
                ExitEvent::BiosCall(nr) => {
                    debug!("bios call int {nr:#04x}");
                    bios::handle_bios_call(self, nr)?;
                }
                ExitEvent::DosDriverCall(idx) => {
                    debug!("dos driver call {idx:#04x}");
                    dos::handle_driver_call(self, idx)?;
                }
                ExitEvent::ReturnToMonitor => return Ok(()),
                ExitEvent::SingleStep => {
                    self.cpu.dump_regs();
                    return Err(VmError::UnhandledExit("unexpected single-step trap".into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_segment;

    fn machine() -> (GuestMemory, kvm_regs, kvm_sregs) {
        let mem = GuestMemory::new().unwrap();
        let mut regs = kvm_regs::default();
        let mut sregs = kvm_sregs::default();
        set_seg(&mut sregs.ss, 0x100);
        regs.rsp = 0x400;
        regs.rflags = 0x0202;
        (mem, regs, sregs)
    }

    fn seg(selector: u16) -> kvm_segment {
        let mut s = kvm_segment::default();
        set_seg(&mut s, selector);
        s
    }

    #[test]
    fn test_push16_decrements_and_stores() {
        let (mut mem, mut regs, sregs) = machine();
        push16(&mut mem, &mut regs, &sregs, 0xBEEF);
        assert_eq!(regs.rsp, 0x3FE);
        assert_eq!(mem.read_u16(0x1000 + 0x3FE), 0xBEEF);
    }

    #[test]
    fn test_far_call_frame_and_target() {
        let (mut mem, mut regs, mut sregs) = machine();
        sregs.cs = seg(0x700);
        regs.rip = 0x123;
        far_call(&mut mem, &mut regs, &mut sregs, 0x68, 0);

        assert_eq!(sregs.cs.selector, 0x68);
        assert_eq!(sregs.cs.base, 0x680);
        assert_eq!(regs.rip, 0);
        assert_eq!(regs.rsp, 0x3FA);
        // Frame from the top of stack: return ip, return cs, saved flags.
        assert_eq!(mem.read_u16(0x1000 + 0x3FA), RETURN_TO_MONITOR);
        assert_eq!(mem.read_u16(0x1000 + 0x3FC), BIOS_TRAP_SEG);
        assert_eq!(mem.read_u16(0x1000 + 0x3FE), 0x0202);
    }

    #[test]
    fn test_far_call_then_far_ret_lands_on_monitor_return() {
        let (mut mem, mut regs, mut sregs) = machine();
        sregs.cs = seg(0x700);
        regs.rip = 0x123;
        let sp_before = regs.rsp;
        far_call(&mut mem, &mut regs, &mut sregs, 0x68, 0x10);
        far_ret(&mem, &mut regs, &mut sregs);

        assert_eq!(sregs.cs.selector, BIOS_TRAP_SEG);
        assert_eq!(regs.rip, RETURN_TO_MONITOR as u64);
        // RETF pops 4 of the 6 pushed bytes; the saved flags word remains.
        assert_eq!(regs.rsp, sp_before - 2);
    }

    #[test]
    fn test_deliver_intr_frame_and_vector() {
        let (mut mem, mut regs, mut sregs) = machine();
        sregs.cs = seg(0x700);
        regs.rip = 0x123;
        regs.rflags = 0x0202 | FLAGS_IF;
        let sp_before = regs.rsp;

        deliver_intr(&mut mem, &mut regs, &mut sregs, 0x13);

        // CS:IP comes from vector 0x13, which points into the trap segment;
        // interrupts are masked on entry.
        assert_eq!(sregs.cs.selector, BIOS_TRAP_SEG);
        assert_eq!(sregs.cs.base, BIOS_TRAP_SEG as u64 * 16);
        assert_eq!(regs.rip, 0x13);
        assert_eq!(regs.rflags & FLAGS_IF, 0);
        assert_eq!(regs.rsp, sp_before - 6);
        // The frame returns to the monitor carrying the caller's flags.
        let top = 0x1000 + regs.rsp as usize;
        assert_eq!(mem.read_u16(top), RETURN_TO_MONITOR);
        assert_eq!(mem.read_u16(top + 2), BIOS_TRAP_SEG);
        assert_eq!(mem.read_u16(top + 4), (0x0202 | FLAGS_IF) as u16);
    }

    #[test]
    fn test_interrupt_frame_reti_round_trip() {
        let (mut mem, mut regs, mut sregs) = machine();
        sregs.cs = seg(0x123);
        regs.rip = 0x456;
        regs.rflags = 0x0246;
        let sp_before = regs.rsp;

        // A hardware interrupt pushes flags, cs, ip; reti must restore all
        // three exactly.
        let (flags, cs, ip) = (regs.rflags as u16, sregs.cs.selector, regs.rip as u16);
        push16(&mut mem, &mut regs, &sregs, flags);
        push16(&mut mem, &mut regs, &sregs, cs);
        push16(&mut mem, &mut regs, &sregs, ip);

        sregs.cs = seg(BIOS_TRAP_SEG);
        regs.rip = 0x21;
        regs.rflags = 0x0002;

        reti(&mem, &mut regs, &mut sregs);
        assert_eq!(sregs.cs.selector, 0x123);
        assert_eq!(sregs.cs.base, 0x1230);
        assert_eq!(sregs.cs.limit, 0xFFFF);
        assert_eq!(regs.rip, 0x456);
        assert_eq!(regs.rflags, 0x0246);
        assert_eq!(regs.rsp, sp_before);
    }

    #[test]
    fn test_stack_carry_survives_reti() {
        let (mut mem, mut regs, mut sregs) = machine();
        sregs.cs = seg(0x123);
        regs.rip = 0x456;
        regs.rflags = 0x0202; // carry clear

        let (flags, cs, ip) = (regs.rflags as u16, sregs.cs.selector, regs.rip as u16);
        push16(&mut mem, &mut regs, &sregs, flags);
        push16(&mut mem, &mut regs, &sregs, cs);
        push16(&mut mem, &mut regs, &sregs, ip);

        // Handler signals failure on the pushed flags word, not the live
        // register.
        update_stack_flags(&mut mem, &regs, &sregs, FLAGS_CF as u16, true);
        reti(&mem, &mut regs, &mut sregs);

        assert_eq!(regs.rflags & FLAGS_CF, FLAGS_CF);
        assert_eq!(regs.rflags & !FLAGS_CF, 0x0202);
    }

    #[test]
    fn test_stack_zero_flag_helpers() {
        let (mut mem, mut regs, mut sregs) = machine();
        sregs.cs = seg(0x123);
        regs.rip = 0x456;
        regs.rflags = 0x0202 | FLAGS_ZF;

        let (flags, cs, ip) = (regs.rflags as u16, sregs.cs.selector, regs.rip as u16);
        push16(&mut mem, &mut regs, &sregs, flags);
        push16(&mut mem, &mut regs, &sregs, cs);
        push16(&mut mem, &mut regs, &sregs, ip);

        update_stack_flags(&mut mem, &regs, &sregs, FLAGS_ZF as u16, false);
        reti(&mem, &mut regs, &mut sregs);
        assert_eq!(regs.rflags & FLAGS_ZF, 0);
    }
}
