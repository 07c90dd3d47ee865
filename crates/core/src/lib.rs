//! Real-mode KVM monitor core.
//!
//! This crate runs real-mode x86 guest code (a boot sector, a DOS kernel
//! extracted from a FAT12 floppy, or a raw MZ executable) on a single KVM
//! vCPU and emulates the minimum BIOS and DOS surface the guest needs.
//!
//! The monitor never decodes guest instructions. Every interrupt vector
//! points into a reserved segment filled with HLT bytes, so any service the
//! guest invokes immediately traps back here; the trapped address alone
//! identifies the requested service.

pub mod bios;
pub mod console;
pub mod cpu;
pub mod dos;
pub mod floppy;
pub mod layout;
pub mod memory;
pub mod mz;
pub mod vm;

use thiserror::Error;

pub use cpu::{CpuSnapshot, ExitEvent, GuestCpu, RunMode};
pub use layout::AddressLayout;
pub use vm::Vm;

/// Errors surfaced by the monitor core.
///
/// Guest-recoverable failures (unsupported function, bad drive number,
/// missing file on open) are reported to the guest through the carry flag
/// and never appear here. Everything below either prevents the session from
/// starting or is a protocol violation that cannot be safely continued.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("kvm: {0}")]
    Kvm(#[from] kvm_ioctls::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("guest memory map failed")]
    MemoryMap,
    #[error("unsupported floppy image size: {0} bytes")]
    BadFloppySize(u64),
    #[error("no floppy image attached")]
    NoFloppy,
    #[error("{0}.{1} not found on the floppy image")]
    FileNotFound(String, String),
    #[error("invalid MZ executable: {0}")]
    InvalidExecutable(&'static str),
    #[error("unknown DOS driver call {0:#04x}")]
    UnknownDriverCall(u8),
    #[error("unknown DOS system call ah={0:#04x}")]
    UnknownSystemCall(u8),
    #[error("unexpected hlt at {0:04x}:{1:04x}")]
    UnexpectedHalt(u16, u16),
    #[error("unhandled vcpu exit: {0}")]
    UnhandledExit(String),
}
