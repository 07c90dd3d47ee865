//! DOS emulation: the kernel's internal I/O driver protocol, the INT 21h
//! system-call surface, and the floppy bootstrap that installs the kernel
//! and the command interpreter.
//!
//! The driver protocol is what the DOS kernel binary itself calls through
//! the entry stubs in the I/O segment; it returns with a plain far return
//! and live flags. The system-call surface is what guest programs call
//! through INT 21h; it returns with an interrupt return, so handlers edit
//! the flags word pushed on the guest stack.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::console;
use crate::cpu::{set_seg, FLAGS_CF, FLAGS_ZF};
use crate::floppy::SECTOR_SIZE;
use crate::memory::GuestMemory;
use crate::vm::Vm;
use crate::VmError;

/// The DOS kernel's disk/console driver functions, keyed by entry index.
/// The kernel binary is built against these indices; anything else it
/// calls is a layout mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    Status,
    Input,
    Output,
    Read,
    Write,
    DiskChange,
    GetTime,
    Flush,
    MapDevice,
}

impl DriverCall {
    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0x1 => Some(DriverCall::Status),
            0x2 => Some(DriverCall::Input),
            0x3 => Some(DriverCall::Output),
            0x7 => Some(DriverCall::Read),
            0x8 => Some(DriverCall::Write),
            0x9 => Some(DriverCall::DiskChange),
            0xC => Some(DriverCall::GetTime),
            0xD => Some(DriverCall::Flush),
            0xE => Some(DriverCall::MapDevice),
            _ => None,
        }
    }
}

/// Service one driver call and far-return to the kernel.
///
/// The kernel observes ZF and CF directly after the far return, so this is
/// the one path that writes the live flags register instead of a pushed
/// copy.
pub fn handle_driver_call(vm: &mut Vm, idx: u8) -> Result<(), VmError> {
    let call = DriverCall::from_index(idx).ok_or(VmError::UnknownDriverCall(idx))?;

    let mut zf = false;
    match call {
        // Console status: ZF set reports no character waiting, steering
        // the kernel to the blocking Input call.
        DriverCall::Status => zf = true,
        DriverCall::Input => {
            let mut c = console::read_char()?;
            if c == b'\n' {
                c = b'\r';
            }
            vm.cpu.regs.rax = c as u64;
        }
        DriverCall::Output => {
            console::write_char((vm.cpu.regs.rax & 0xFF) as u8)?;
        }
        DriverCall::Read | DriverCall::Write => {
            // BX = transfer address in DS, CX = sector count,
            // DX = logical record number.
            let addr = (vm.cpu.sregs.ds.base + vm.cpu.regs.rbx) as usize;
            let count = (vm.cpu.regs.rcx & 0xFFFF) as usize;
            let lba = (vm.cpu.regs.rdx & 0xFFFF) as u32;
            debug!("driver {call:?}: lba={lba} count={count} addr={addr:#x}");
            let floppy = vm.floppy.as_ref().ok_or(VmError::NoFloppy)?;
            let len = count * SECTOR_SIZE;
            let mut buf = vec![0u8; len];
            if call == DriverCall::Read {
                floppy.read_sectors(lba, &mut buf)?;
                vm.mem.write_bytes(addr, &buf);
            } else {
                buf.copy_from_slice(vm.mem.slice(addr, len));
                floppy.write_sectors(lba, &buf)?;
            }
            vm.cpu.regs.rax = 0;
        }
        // No change-line hardware, so media never changes under the kernel.
        DriverCall::DiskChange => vm.cpu.regs.rax = 0,
        DriverCall::GetTime => {
            let t = host_time();
            vm.cpu.regs.rax = t.day_of_year as u64;
            vm.cpu.regs.rdx = ((t.second as u64) << 8) | t.centisecond as u64;
            vm.cpu.regs.rcx = ((t.hour as u64) << 8) | t.minute as u64;
        }
        DriverCall::Flush => console::flush()?,
        // Single drive: every logical drive maps to device 0.
        DriverCall::MapDevice => vm.cpu.regs.rax = 0,
    }

    vm.cpu.regs.rflags &= !(FLAGS_ZF | FLAGS_CF);
    if zf {
        vm.cpu.regs.rflags |= FLAGS_ZF;
    }
    vm.far_ret();
    Ok(())
}

/// Host clock broken into the fields the driver GETTIME call reports.
struct DriverTime {
    day_of_year: u16,
    hour: u8,
    minute: u8,
    second: u8,
    centisecond: u8,
}

fn host_time() -> DriverTime {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let rem = secs % 86_400;
    DriverTime {
        day_of_year: day_of_year(secs / 86_400),
        hour: (rem / 3600) as u8,
        minute: ((rem % 3600) / 60) as u8,
        second: (rem % 60) as u8,
        centisecond: 0,
    }
}

fn is_leap_year(year: u64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Zero-based day of year for a day count since 1970-01-01.
fn day_of_year(mut days: u64) -> u16 {
    let mut year = 1970u64;
    loop {
        let len = if is_leap_year(year) { 366 } else { 365 };
        if days < len {
            return days as u16;
        }
        days -= len;
        year += 1;
    }
}

/// Strip an optional `X:` drive prefix from a guest-supplied path.
pub fn truncate_drive(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' {
        &path[2..]
    } else {
        path
    }
}

/// Read a NUL-terminated guest string.
pub fn read_guest_string(mem: &GuestMemory, addr: usize) -> String {
    let bytes = mem.bytes();
    let end = bytes[addr..]
        .iter()
        .position(|&b| b == 0)
        .map_or(bytes.len(), |n| addr + n);
    String::from_utf8_lossy(&bytes[addr..end]).into_owned()
}

/// Monitor-side file handle table backing the INT 21h file calls.
///
/// Handles 0-4 are the DOS standard devices; opened files get handles
/// from 5 up, so a guest never confuses a file with a device.
pub struct DosFiles {
    open: HashMap<u16, File>,
    next: u16,
}

impl Default for DosFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl DosFiles {
    pub fn new() -> Self {
        Self {
            open: HashMap::new(),
            next: 5,
        }
    }

    /// Register an opened host file and return its guest handle.
    pub fn insert(&mut self, file: File) -> u16 {
        let handle = self.next;
        self.next += 1;
        self.open.insert(handle, file);
        handle
    }

    pub fn close(&mut self, handle: u16) -> bool {
        self.open.remove(&handle).is_some()
    }

    pub fn read(&mut self, handle: u16, buf: &mut [u8]) -> io::Result<usize> {
        match handle {
            0 => io::stdin().read(buf),
            1..=4 => Err(io::Error::from(io::ErrorKind::Unsupported)),
            _ => {
                let mut file = self.file(handle)?;
                file.read(buf)
            }
        }
    }

    pub fn write(&mut self, handle: u16, buf: &[u8]) -> io::Result<usize> {
        match handle {
            1 => {
                io::stdout().write_all(buf)?;
                Ok(buf.len())
            }
            2 => {
                io::stderr().write_all(buf)?;
                Ok(buf.len())
            }
            0 | 3 | 4 => Err(io::Error::from(io::ErrorKind::Unsupported)),
            _ => {
                let mut file = self.file(handle)?;
                file.write(buf)
            }
        }
    }

    pub fn seek(&mut self, handle: u16, pos: SeekFrom) -> io::Result<u64> {
        if handle < 5 {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        let mut file = self.file(handle)?;
        file.seek(pos)
    }

    fn file(&self, handle: u16) -> io::Result<&File> {
        self.open
            .get(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

/// Service one INT 21h system call and interrupt-return to the guest.
///
/// Every handler starts with carry clear; error paths set it in the
/// pushed flags word. An unknown function code is a protocol violation.
pub fn handle_system_call(vm: &mut Vm) -> Result<(), VmError> {
    let ah = ((vm.cpu.regs.rax >> 8) & 0xFF) as u8;
    debug!("dos call ah={ah:#04x}");
    vm.clear_carry();

    match ah {
        // Character output.
        0x02 => {
            console::write_char((vm.cpu.regs.rdx & 0xFF) as u8)?;
            console::flush()?;
        }
        // $-terminated string output.
        0x09 => {
            let mut addr = (vm.cpu.sregs.ds.base + vm.cpu.regs.rdx) as usize;
            loop {
                let c = vm.mem.read_u8(addr);
                if c == b'$' {
                    break;
                }
                console::write_char(c)?;
                addr += 1;
            }
            console::write_char(b'\n')?;
            vm.cpu.regs.rax = 0x0024;
        }
        // Buffered line input: byte 0 holds the capacity, byte 1 receives
        // the stored length, data starts at byte 2.
        0x0A => {
            let addr = (vm.cpu.sregs.ds.base + vm.cpu.regs.rdx) as usize;
            let cap = vm.mem.read_u8(addr) as usize;
            let mut buf = vec![0u8; cap];
            let n = console::read_line(&mut buf)?;
            vm.mem.write_u8(addr + 1, n as u8);
            vm.mem.write_bytes(addr + 2, &buf[..n]);
        }
        // Current drive: always A.
        0x19 => vm.cpu.regs.rax = 0,
        // Version probe family; only sub-function 0x34 is acknowledged.
        0x25 => {
            if vm.cpu.regs.rax & 0xFF == 0x34 {
                vm.cpu.regs.rax = 0;
            } else {
                vm.set_carry();
            }
        }
        // Get date: fixed epoch, 1981-01-01.
        0x2A => {
            vm.cpu.regs.rcx = 1;
            vm.cpu.regs.rdx = 0x0101;
        }
        // Get version: 2.0, with carry set so version probes read it as
        // unsupported.
        0x30 => {
            vm.cpu.regs.rax = 0x0002;
            vm.cpu.regs.rbx = 0;
            vm.set_carry();
        }
        // Verify flag.
        0x37 => vm.cpu.regs.rdx = 1,
        // Create file.
        0x3C => {
            let path = guest_path(vm);
            match File::create(&path) {
                Ok(file) => vm.cpu.regs.rax = vm.files.insert(file) as u64,
                Err(e) => {
                    warn!("create {path:?}: {e}");
                    vm.set_carry();
                }
            }
        }
        // Open file; AL selects the access mode.
        0x3D => {
            let path = guest_path(vm);
            let mut opts = OpenOptions::new();
            match vm.cpu.regs.rax & 0xFF {
                0 => opts.read(true),
                1 => opts.write(true),
                _ => opts.read(true).write(true),
            };
            match opts.open(&path) {
                Ok(file) => vm.cpu.regs.rax = vm.files.insert(file) as u64,
                Err(e) => {
                    warn!("open {path:?}: {e}");
                    vm.set_carry();
                }
            }
        }
        // Close handle; closing an unknown handle is ignored.
        0x3E => {
            vm.files.close(vm.cpu.regs.rbx as u16);
        }
        // Read (0x3F) / write (0x40) by handle: DS:DX buffer, CX bytes.
        0x3F | 0x40 => {
            let handle = vm.cpu.regs.rbx as u16;
            let addr = (vm.cpu.sregs.ds.base + vm.cpu.regs.rdx) as usize;
            let count = (vm.cpu.regs.rcx & 0xFFFF) as usize;
            let result = if ah == 0x3F {
                let mut buf = vec![0u8; count];
                match vm.files.read(handle, &mut buf) {
                    Ok(n) => {
                        vm.mem.write_bytes(addr, &buf[..n]);
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            } else {
                let buf = vm.mem.slice(addr, count).to_vec();
                vm.files.write(handle, &buf)
            };
            match result {
                Ok(n) => vm.cpu.regs.rax = n as u64,
                Err(_) => vm.set_carry(),
            }
        }
        // Seek: CX:DX offset, AL whence.
        0x42 => {
            let offset = ((vm.cpu.regs.rcx & 0xFFFF) << 16) | (vm.cpu.regs.rdx & 0xFFFF);
            let pos = match vm.cpu.regs.rax & 0xFF {
                0 => SeekFrom::Start(offset),
                1 => SeekFrom::Current(offset as i64),
                _ => SeekFrom::End(offset as i64),
            };
            if vm.files.seek(vm.cpu.regs.rbx as u16, pos).is_err() {
                vm.set_carry();
            }
        }
        // Terminate with return code in AL.
        0x4C => {
            console::flush()?;
            std::process::exit((vm.cpu.regs.rax & 0xFF) as i32);
        }
        _ => {
            vm.cpu.dump_regs();
            return Err(VmError::UnknownSystemCall(ah));
        }
    }

    vm.reti();
    Ok(())
}

fn guest_path(vm: &Vm) -> String {
    let addr = (vm.cpu.sregs.ds.base + vm.cpu.regs.rdx) as usize;
    let raw = read_guest_string(&vm.mem, addr);
    truncate_drive(&raw).to_owned()
}

/// Extract the DOS kernel from the floppy, place it at the kernel segment,
/// and build the driver init table and BPB parameter block the kernel's
/// initialization code walks.
pub fn install_dos_kernel(vm: &mut Vm) -> Result<(), VmError> {
    let layout = vm.layout;
    let (kernel, bpb) = {
        let floppy = vm.floppy.as_ref().ok_or(VmError::NoFloppy)?;
        let kernel = floppy.read_file("MSDOS", "SYS")?.ok_or_else(|| {
            VmError::FileNotFound("MSDOS".into(), "SYS".into())
        })?;
        (kernel, floppy.bpb.to_bytes())
    };
    vm.mem.write_bytes(layout.dos_seg as usize * 16, &kernel);

    let io_base = layout.dos_io_seg as usize * 16;
    let init_tab = io_base + layout.drv_init_tab as usize;
    vm.mem.write_u8(init_tab, 1); // drive count
    vm.mem.write_u8(init_tab + 1, 0); // disk id
    vm.mem.write_u16(init_tab + 2, layout.drv_param);
    vm.mem.write_bytes(io_base + layout.drv_param as usize, &bpb);
    Ok(())
}

/// Extract COMMAND.COM from the floppy into the kernel's data segment and
/// point CS:IP at its entry, completing the DOS bootstrap. Runs after the
/// kernel's initialization call has returned to the monitor.
pub fn start_command_interpreter(vm: &mut Vm) -> Result<(), VmError> {
    let command = {
        let floppy = vm.floppy.as_ref().ok_or(VmError::NoFloppy)?;
        floppy.read_file("COMMAND", "COM")?.ok_or_else(|| {
            VmError::FileNotFound("COMMAND".into(), "COM".into())
        })?
    };
    let base = vm.cpu.sregs.ds.base as usize;
    vm.mem.write_bytes(base + 0x100, &command);

    let selector = vm.cpu.sregs.ds.selector;
    set_seg(&mut vm.cpu.sregs.es, selector);
    set_seg(&mut vm.cpu.sregs.ss, selector);
    set_seg(&mut vm.cpu.sregs.cs, selector);
    vm.cpu.regs.rsp = 0x5C;
    vm.cpu.regs.rip = 0x100;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_call_indices() {
        assert_eq!(DriverCall::from_index(0x1), Some(DriverCall::Status));
        assert_eq!(DriverCall::from_index(0x7), Some(DriverCall::Read));
        assert_eq!(DriverCall::from_index(0x8), Some(DriverCall::Write));
        assert_eq!(DriverCall::from_index(0xC), Some(DriverCall::GetTime));
        assert_eq!(DriverCall::from_index(0xE), Some(DriverCall::MapDevice));
        // PRINT/AUXIN/AUXOUT and SETDATE/SETTIME are not served.
        assert_eq!(DriverCall::from_index(0x4), None);
        assert_eq!(DriverCall::from_index(0xA), None);
        assert_eq!(DriverCall::from_index(0xF), None);
    }

    #[test]
    fn test_truncate_drive() {
        assert_eq!(truncate_drive("C:FILE.TXT"), "FILE.TXT");
        assert_eq!(truncate_drive("a:/tmp/out"), "/tmp/out");
        assert_eq!(truncate_drive("FILE.TXT"), "FILE.TXT");
        assert_eq!(truncate_drive(""), "");
        assert_eq!(truncate_drive("x"), "x");
    }

    #[test]
    fn test_day_of_year() {
        assert_eq!(day_of_year(0), 0); // 1970-01-01
        assert_eq!(day_of_year(364), 364); // 1970-12-31
        assert_eq!(day_of_year(365), 0); // 1971-01-01
        // 1972 is a leap year: 1972-12-31 is day 365, 1973-01-01 day 0.
        let to_1972 = 365 * 2;
        assert_eq!(day_of_year(to_1972 + 365), 365);
        assert_eq!(day_of_year(to_1972 + 366), 0);
    }

    #[test]
    fn test_read_guest_string() {
        let mut mem = GuestMemory::new().unwrap();
        mem.write_bytes(0x2000, b"HELLO.TXT\0garbage");
        assert_eq!(read_guest_string(&mem, 0x2000), "HELLO.TXT");
    }

    #[test]
    fn test_handle_table_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"contents").unwrap();

        let mut files = DosFiles::new();
        let h1 = files.insert(File::open(&path).unwrap());
        let h2 = files.insert(File::open(&path).unwrap());
        assert_eq!(h1, 5);
        assert_eq!(h2, 6);

        let mut buf = [0u8; 8];
        assert_eq!(files.read(h1, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"contents");

        assert!(files.close(h1));
        assert!(!files.close(h1));
        assert!(files.read(h1, &mut buf).is_err());
    }

    #[test]
    fn test_handle_table_file_write_and_seek() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut files = DosFiles::new();
        let h = files.insert(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .unwrap(),
        );
        assert_eq!(files.write(h, b"0123456789").unwrap(), 10);
        assert_eq!(files.seek(h, SeekFrom::Start(4)).unwrap(), 4);
        let mut buf = [0u8; 3];
        files.read(h, &mut buf).unwrap();
        assert_eq!(&buf, b"456");
    }

    #[test]
    fn test_handle_table_rejects_device_misuse() {
        let mut files = DosFiles::new();
        let mut buf = [0u8; 1];
        // Reading the output devices or seeking any device fails.
        assert!(files.read(1, &mut buf).is_err());
        assert!(files.read(2, &mut buf).is_err());
        assert!(files.write(0, b"x").is_err());
        assert!(files.seek(0, SeekFrom::Start(0)).is_err());
    }

    #[test]
    fn test_handle_table_stdout_write() {
        let mut files = DosFiles::new();
        assert_eq!(files.write(1, b"").unwrap(), 0);
        assert_eq!(files.write(2, b"").unwrap(), 0);
    }

    #[test]
    fn test_write_temp_then_reopen() {
        // The create/open pair the guest performs through 0x3C/0x3D.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("REPORT.TXT");
        let mut files = DosFiles::new();

        let h = files.insert(File::create(&path).unwrap());
        files.write(h, b"dos output").unwrap();
        files.close(h);

        let h = files.insert(File::open(&path).unwrap());
        let mut buf = [0u8; 10];
        assert_eq!(files.read(h, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"dos output");
        assert_eq!(std::fs::read(&path).unwrap(), b"dos output");
    }
}
