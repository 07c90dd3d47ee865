//! Guest-visible memory layout.
//!
//! These offsets are part of the contract between the monitor and the guest
//! images it loads; the DOS kernel binary in particular is built against the
//! driver-table layout below, and no negotiation protocol exists.

/// Segment whose 64 KiB hold nothing but HLT trap bytes. The IVT points
/// every interrupt here, and the segment is mapped read-only to the guest.
pub const BIOS_TRAP_SEG: u16 = 0xF000;

/// Offset inside the trap segment reserved for "return to monitor".
/// `far_call` pushes this as the return address, so a guest routine that
/// returns normally halts here and hands control back to the monitor.
pub const RETURN_TO_MONITOR: u16 = 0x200;

/// PSP segment for direct-executable mode (PSP at guest physical 0x1000).
pub const PSP_SEG: u16 = 0x100;

/// Load segment for MZ images, directly after the 256-byte PSP.
pub const EXE_SEG: u16 = 0x110;

/// One real-mode megabyte of guest physical memory.
pub const GUEST_MEM_SIZE: usize = 1024 * 1024;

/// Where the DOS kernel and its I/O driver table live in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    /// Segment holding the DOS kernel's I/O driver entry points.
    pub dos_io_seg: u16,
    /// Offset of the driver init table inside the I/O segment.
    pub drv_init_tab: u16,
    /// Offset of the per-drive parameter block inside the I/O segment.
    pub drv_param: u16,
    /// Size reserved for the I/O segment image, in bytes.
    pub dos_io_size: u16,
    /// Segment where the DOS kernel body is loaded.
    pub dos_seg: u16,
}

impl Default for AddressLayout {
    fn default() -> Self {
        let dos_io_seg = 0x60;
        let dos_io_size = 128;
        Self {
            dos_io_seg,
            // 16 driver entry points of 3 trap bytes each, then the tables.
            drv_init_tab: 16 * 3,
            drv_param: 16 * 3 + 8,
            dos_io_size,
            dos_seg: dos_io_seg + dos_io_size / 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = AddressLayout::default();
        assert_eq!(layout.dos_io_seg, 0x60);
        assert_eq!(layout.drv_init_tab, 0x30);
        assert_eq!(layout.drv_param, 0x38);
        assert_eq!(layout.dos_seg, 0x68);
    }
}
