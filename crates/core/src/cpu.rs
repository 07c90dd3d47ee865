//! Virtual CPU: register state, mode setup, and exit classification.
//!
//! The monitor performs no instruction decoding. One execution step runs the
//! guest until KVM reports an exit, and the stop is classified purely from
//! where the instruction pointer landed: a HLT inside the BIOS trap segment
//! is an interrupt invocation, a HLT inside the DOS I/O segment is a driver
//! call, anything else is a protocol violation.

use kvm_bindings::{
    kvm_guest_debug, kvm_regs, kvm_segment, kvm_sregs, KVM_GUESTDBG_ENABLE,
    KVM_GUESTDBG_SINGLESTEP,
};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use serde::{Deserialize, Serialize};

use crate::layout::{AddressLayout, BIOS_TRAP_SEG, RETURN_TO_MONITOR};
use crate::VmError;

pub const FLAGS_CF: u64 = 1 << 0;
pub const FLAGS_ZF: u64 = 1 << 6;
pub const FLAGS_IF: u64 = 1 << 9;

/// Why one guest execution step stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEvent {
    /// HLT trap in the BIOS segment: the guest invoked this interrupt.
    BiosCall(u8),
    /// HLT trap in the DOS I/O segment: driver entry index.
    DosDriverCall(u8),
    /// HLT at the reserved monitor-return offset.
    ReturnToMonitor,
    /// Hardware single-step trap.
    SingleStep,
}

/// How initial register state is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Boot sector at 0000:7C00.
    BootSector,
    /// DOS kernel bootstrap at dos_seg:0000.
    DosKernel,
    /// State is set explicitly by a loader.
    Explicit,
}

/// Point a segment register at `selector` the real-mode way: base is
/// selector * 16, limit 0xFFFF, 16-bit default operand size. This is the
/// only place the base/selector invariant is established.
pub fn set_seg(seg: &mut kvm_segment, selector: u16) {
    seg.base = selector as u64 * 16;
    seg.limit = 0xFFFF;
    seg.selector = selector;
    seg.db = 0;
    seg.l = 0;
}

/// Classify a HLT exit from the code segment base and the instruction
/// pointer (which points one byte past the HLT). Returns `None` for a halt
/// the monitor did not plant.
pub fn classify_halt(cs_base: u64, rip: u64, layout: &AddressLayout) -> Option<ExitEvent> {
    let trap_base = BIOS_TRAP_SEG as u64 * 16;
    let io_base = layout.dos_io_seg as u64 * 16;
    if cs_base == trap_base {
        let nr = rip.wrapping_sub(1);
        if nr == RETURN_TO_MONITOR as u64 {
            Some(ExitEvent::ReturnToMonitor)
        } else if nr < 0x100 {
            Some(ExitEvent::BiosCall(nr as u8))
        } else {
            None
        }
    } else if cs_base == io_base {
        // Each driver entry point occupies exactly 3 trap bytes; the entry
        // stubs end where the driver init table begins, and a halt beyond
        // them is not a driver call.
        let nr = rip.wrapping_sub(1);
        if nr < layout.drv_init_tab as u64 {
            Some(ExitEvent::DosDriverCall((nr / 3) as u8))
        } else {
            None
        }
    } else {
        None
    }
}

/// Owned reduction of a vCPU exit, freeing the vCPU borrow before
/// register state is read back.
enum Stop {
    Halt,
    SingleStep,
    Fatal(String),
}

/// One virtual CPU and its software-side register copies.
///
/// `regs`/`sregs` are the authoritative state between execution steps;
/// handlers mutate them freely and `run` pushes them back to the hardware
/// before resuming the guest.
pub struct GuestCpu {
    vcpu: VcpuFd,
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
}

impl GuestCpu {
    pub fn new(vm: &VmFd) -> Result<Self, VmError> {
        let vcpu = vm.create_vcpu(0)?;
        let sregs = vcpu.get_sregs()?;
        let regs = vcpu.get_regs()?;
        Ok(Self { vcpu, regs, sregs })
    }

    /// Prepare IP/SP and segment registers for one of the run modes.
    pub fn setup(&mut self, layout: &AddressLayout, mode: RunMode) {
        match mode {
            RunMode::BootSector => {
                self.regs.rip = 0x7C00;
                self.regs.rsp = 0x8000;
                set_seg(&mut self.sregs.cs, 0);
                set_seg(&mut self.sregs.ds, 0);
                set_seg(&mut self.sregs.ss, 0);
            }
            RunMode::DosKernel => {
                self.regs.rip = 0;
                self.regs.rsp = 0x8000 - 4;
                // The kernel expects the memory size in DX and its driver
                // init table offset in SI.
                self.regs.rdx = 1024 * 256 / 64;
                self.regs.rsi = layout.drv_init_tab as u64;
                set_seg(&mut self.sregs.cs, layout.dos_seg);
                set_seg(&mut self.sregs.ss, 0);
                set_seg(&mut self.sregs.es, layout.dos_seg);
                set_seg(&mut self.sregs.ds, layout.dos_io_seg);
            }
            RunMode::Explicit => {}
        }
    }

    /// Execute one step of guest code and classify the stop.
    ///
    /// Register state is pushed to the vCPU before the step and pulled back
    /// afterwards, so handlers always see the post-trap state. Unrecognized
    /// exits and unrecognized halts dump full state and fail.
    pub fn run(&mut self, layout: &AddressLayout, single_step: bool) -> Result<ExitEvent, VmError> {
        self.vcpu.set_sregs(&self.sregs)?;
        self.vcpu.set_regs(&self.regs)?;

        if single_step {
            let dbg = kvm_guest_debug {
                control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP,
                ..Default::default()
            };
            self.vcpu.set_guest_debug(&dbg)?;
        }
        // The exit holds a borrow of the vCPU, so reduce it to owned data
        // before pulling register state back out.
        let stop = {
            match self.vcpu.run()? {
                VcpuExit::Hlt => Stop::Halt,
                VcpuExit::Debug(_) => Stop::SingleStep,
                VcpuExit::MmioRead(addr, _) => {
                    Stop::Fatal(format!("reference to unmapped region: read at {addr:#x}"))
                }
                VcpuExit::MmioWrite(addr, _) => {
                    Stop::Fatal(format!("reference to unmapped region: write at {addr:#x}"))
                }
                VcpuExit::IoIn(port, _) => {
                    Stop::Fatal(format!("reference to unconnected i/o port {port:#x} (in)"))
                }
                VcpuExit::IoOut(port, _) => {
                    Stop::Fatal(format!("reference to unconnected i/o port {port:#x} (out)"))
                }
                VcpuExit::InternalError => Stop::Fatal("kvm internal error".into()),
                VcpuExit::Shutdown => Stop::Fatal("guest shutdown".into()),
                VcpuExit::FailEntry(reason, cpu) => {
                    Stop::Fatal(format!("entry failure: reason={reason:#x} cpu={cpu}"))
                }
                other => Stop::Fatal(format!("{other:?}")),
            }
        };

        self.sregs = self.vcpu.get_sregs()?;
        self.regs = self.vcpu.get_regs()?;

        match stop {
            Stop::Halt => {
                classify_halt(self.sregs.cs.base, self.regs.rip, layout).ok_or_else(|| {
                    self.dump_regs();
                    VmError::UnexpectedHalt(self.sregs.cs.selector, self.regs.rip as u16)
                })
            }
            Stop::SingleStep => Ok(ExitEvent::SingleStep),
            Stop::Fatal(msg) => {
                self.dump_regs();
                Err(VmError::UnhandledExit(msg))
            }
        }
    }

    /// Capture the 16-bit visible register state.
    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            ax: self.regs.rax as u16,
            bx: self.regs.rbx as u16,
            cx: self.regs.rcx as u16,
            dx: self.regs.rdx as u16,
            si: self.regs.rsi as u16,
            di: self.regs.rdi as u16,
            bp: self.regs.rbp as u16,
            sp: self.regs.rsp as u16,
            ip: self.regs.rip as u16,
            flags: self.regs.rflags as u16,
            cs: self.sregs.cs.selector,
            ds: self.sregs.ds.selector,
            es: self.sregs.es.selector,
            ss: self.sregs.ss.selector,
        }
    }

    /// Print full register and segment state to stderr for diagnosis.
    pub fn dump_regs(&self) {
        let regs = &self.regs;
        let sregs = &self.sregs;

        let reg = |tag: &str, val: u64| {
            eprintln!("{tag:>10}:{val:22}({val:16x})");
        };
        let seg = |tag: &str, s: &kvm_segment| {
            eprintln!(
                "{tag:>10}: base={:16x}, limit={:8x}, sel={:8x}, type={:4}, db={}, l={}, g={}",
                s.base, s.limit, s.selector, s.type_, s.db, s.l, s.g
            );
        };

        reg("rip", regs.rip);
        reg("rflags", regs.rflags);
        reg("rax", regs.rax);
        reg("rbx", regs.rbx);
        reg("rcx", regs.rcx);
        reg("rdx", regs.rdx);
        reg("rsi", regs.rsi);
        reg("rdi", regs.rdi);
        reg("rsp", regs.rsp);
        reg("rbp", regs.rbp);
        reg("cr0", sregs.cr0);
        reg("cr2", sregs.cr2);
        reg("cr3", sregs.cr3);
        reg("cr4", sregs.cr4);
        reg("efer", sregs.efer);
        seg("cs", &sregs.cs);
        seg("ds", &sregs.ds);
        seg("es", &sregs.es);
        seg("fs", &sregs.fs);
        seg("gs", &sregs.gs);
        seg("ss", &sregs.ss);
        seg("tr", &sregs.tr);
        seg("ldt", &sregs.ldt);
        eprintln!(
            "{:>10}: base={:16x}, limit={:8x}",
            "gdt", sregs.gdt.base, sregs.gdt.limit
        );
        eprintln!(
            "{:>10}: base={:16x}, limit={:8x}",
            "idt", sregs.idt.base, sregs.idt.limit
        );
    }
}

/// Serializable 16-bit register snapshot, for state dumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,
    pub ip: u16,
    pub flags: u16,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_seg_invariant() {
        let mut seg = kvm_segment::default();
        set_seg(&mut seg, 0x1234);
        assert_eq!(seg.base, 0x12340);
        assert_eq!(seg.limit, 0xFFFF);
        assert_eq!(seg.selector, 0x1234);
        assert_eq!(seg.db, 0);
        assert_eq!(seg.l, 0);
    }

    #[test]
    fn test_classify_bios_call() {
        let layout = AddressLayout::default();
        // HLT at F000:0010 leaves IP at 0x11 -> interrupt 0x10.
        assert_eq!(
            classify_halt(0xF0000, 0x11, &layout),
            Some(ExitEvent::BiosCall(0x10))
        );
        assert_eq!(
            classify_halt(0xF0000, 0x22, &layout),
            Some(ExitEvent::BiosCall(0x21))
        );
    }

    #[test]
    fn test_classify_return_to_monitor() {
        let layout = AddressLayout::default();
        assert_eq!(
            classify_halt(0xF0000, RETURN_TO_MONITOR as u64 + 1, &layout),
            Some(ExitEvent::ReturnToMonitor)
        );
    }

    #[test]
    fn test_classify_dos_driver_call() {
        let layout = AddressLayout::default();
        let io_base = layout.dos_io_seg as u64 * 16;
        // Driver entry n sits at offset n * 3; IP stops one byte past it.
        for idx in [1u8, 2, 7, 0xE] {
            assert_eq!(
                classify_halt(io_base, idx as u64 * 3 + 1, &layout),
                Some(ExitEvent::DosDriverCall(idx))
            );
        }
    }

    #[test]
    fn test_classify_driver_halt_past_entry_stubs() {
        let layout = AddressLayout::default();
        let io_base = layout.dos_io_seg as u64 * 16;
        // A halt beyond the 16 entry stubs must not alias back onto a
        // valid index (0x303 would truncate to entry 1).
        assert_eq!(classify_halt(io_base, 0x304, &layout), None);
        // The first byte past the stubs is the init table, not entry 16.
        assert_eq!(
            classify_halt(io_base, layout.drv_init_tab as u64 + 1, &layout),
            None
        );
        // A halt on the last stub byte leaves IP at the table start and
        // still classifies as the final entry.
        assert_eq!(
            classify_halt(io_base, layout.drv_init_tab as u64, &layout),
            Some(ExitEvent::DosDriverCall(15))
        );
    }

    #[test]
    fn test_classify_unknown_halt() {
        let layout = AddressLayout::default();
        assert_eq!(classify_halt(0x7C00, 0x10, &layout), None);
        // Trap-segment halt beyond the IVT range and not the return slot.
        assert_eq!(classify_halt(0xF0000, 0x5000, &layout), None);
    }
}
