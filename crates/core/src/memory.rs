//! Guest physical memory.
//!
//! One flat, page-aligned megabyte shared with KVM. Every byte starts out
//! as a HLT opcode, so any stray jump traps back to the monitor; the IVT at
//! offset 0 points all 256 vectors into the trap segment at 0xF000, where
//! the trapped instruction pointer encodes the interrupt number.

use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use kvm_ioctls::VmFd;

use crate::layout::{BIOS_TRAP_SEG, GUEST_MEM_SIZE};
use crate::VmError;

/// HLT opcode; the trap marker the whole monitor is built around.
pub const HLT_OPCODE: u8 = 0xF4;

/// Guest physical base of the BIOS trap segment.
pub const TRAP_SEG_BASE: usize = (BIOS_TRAP_SEG as usize) * 16;

/// Flat guest address space, addressed by physical byte offset.
///
/// Callers compute effective addresses as `segment.base + offset`. Accesses
/// beyond the 1 MiB extent panic; the guest itself cannot produce them
/// through the registered KVM regions (stray guest references surface as
/// MMIO exits, which are fatal).
pub struct GuestMemory {
    ptr: *mut u8,
    size: usize,
}

impl GuestMemory {
    /// Map guest memory, fill it with HLT, and build the IVT.
    pub fn new() -> Result<Self, VmError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                GUEST_MEM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::MemoryMap);
        }
        let mut mem = Self {
            ptr: ptr as *mut u8,
            size: GUEST_MEM_SIZE,
        };
        mem.bytes_mut().fill(HLT_OPCODE);
        // IVT entry n -> F000:n. The trap segment is already all HLT, so the
        // handler for interrupt n is the single trap byte at F000:n.
        for intr in 0..256usize {
            mem.write_u16(intr * 4, intr as u16);
            mem.write_u16(intr * 4 + 2, BIOS_TRAP_SEG);
        }
        Ok(mem)
    }

    /// Register the address space with KVM: a writable low region and a
    /// read-only region covering the trap segment, so guest writes to the
    /// trap segment fault instead of corrupting the trap bytes.
    pub fn register(&self, vm: &VmFd) -> Result<(), VmError> {
        let low = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: TRAP_SEG_BASE as u64,
            userspace_addr: self.ptr as u64,
        };
        let high = kvm_userspace_memory_region {
            slot: 1,
            flags: KVM_MEM_READONLY,
            guest_phys_addr: TRAP_SEG_BASE as u64,
            memory_size: (GUEST_MEM_SIZE - TRAP_SEG_BASE) as u64,
            userspace_addr: self.ptr as u64 + TRAP_SEG_BASE as u64,
        };
        unsafe {
            vm.set_user_memory_region(low)?;
            vm.set_user_memory_region(high)?;
        }
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    pub fn read_u8(&self, addr: usize) -> u8 {
        self.bytes()[addr]
    }

    pub fn write_u8(&mut self, addr: usize, value: u8) {
        self.bytes_mut()[addr] = value;
    }

    pub fn read_u16(&self, addr: usize) -> u16 {
        let b = self.bytes();
        u16::from_le_bytes([b[addr], b[addr + 1]])
    }

    pub fn write_u16(&mut self, addr: usize, value: u16) {
        self.bytes_mut()[addr..addr + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn slice(&self, addr: usize, len: usize) -> &[u8] {
        &self.bytes()[addr..addr + len]
    }

    pub fn slice_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        &mut self.bytes_mut()[addr..addr + len]
    }

    pub fn write_bytes(&mut self, addr: usize, data: &[u8]) {
        self.bytes_mut()[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn fill(&mut self, addr: usize, len: usize, value: u8) {
        self.bytes_mut()[addr..addr + len].fill(value);
    }

    /// Print every interrupt vector to stderr for diagnosis.
    pub fn dump_ivt(&self) {
        for i in 0..0x100 {
            eprintln!(
                "ivt [{:02x}] = offset:{:x} cs:{:x}",
                i,
                self.read_u16(i * 4),
                self.read_u16(i * 4 + 2)
            );
        }
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_starts_as_hlt() {
        let mem = GuestMemory::new().unwrap();
        // Everything outside the IVT starts as a trap byte.
        assert_eq!(mem.read_u8(0x7C00), HLT_OPCODE);
        assert_eq!(mem.read_u8(TRAP_SEG_BASE), HLT_OPCODE);
        assert_eq!(mem.read_u8(GUEST_MEM_SIZE - 1), HLT_OPCODE);
    }

    #[test]
    fn test_ivt_points_into_trap_segment() {
        let mem = GuestMemory::new().unwrap();
        for intr in 0..256usize {
            assert_eq!(mem.read_u16(intr * 4), intr as u16);
            assert_eq!(mem.read_u16(intr * 4 + 2), BIOS_TRAP_SEG);
        }
    }

    #[test]
    fn test_word_access_is_little_endian() {
        let mut mem = GuestMemory::new().unwrap();
        mem.write_u16(0x500, 0x1234);
        assert_eq!(mem.read_u8(0x500), 0x34);
        assert_eq!(mem.read_u8(0x501), 0x12);
        assert_eq!(mem.read_u16(0x500), 0x1234);
    }

    #[test]
    fn test_write_bytes_and_fill() {
        let mut mem = GuestMemory::new().unwrap();
        mem.write_bytes(0x600, &[1, 2, 3]);
        assert_eq!(mem.slice(0x600, 3), &[1, 2, 3]);
        mem.fill(0x600, 3, 0);
        assert_eq!(mem.slice(0x600, 3), &[0, 0, 0]);
    }
}
