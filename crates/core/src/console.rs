//! Host console plumbing for the BIOS keyboard and DOS console services.
//!
//! The monitor is strictly single-threaded: a blocking read here stalls the
//! whole session until the host delivers a byte, which matches what a guest
//! spinning on INT 16h would observe on real hardware.

use std::io::{self, Read, Write};

/// Blocking read of one byte from standard input.
pub fn read_char() -> io::Result<u8> {
    let mut buf = [0u8; 1];
    io::stdin().read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Zero-timeout readiness probe on standard input, for the non-blocking
/// keyboard poll.
pub fn input_ready() -> io::Result<bool> {
    let mut fds = libc::pollfd {
        fd: libc::STDIN_FILENO,
        events: libc::POLLIN,
        revents: 0,
    };
    let r = unsafe { libc::poll(&mut fds, 1, 0) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r > 0 && fds.revents & libc::POLLIN != 0)
}

/// Read one burst of line input, up to the buffer length; returns the
/// number of bytes stored.
pub fn read_line(buf: &mut [u8]) -> io::Result<usize> {
    io::stdin().lock().read(buf)
}

pub fn write_char(c: u8) -> io::Result<()> {
    io::stdout().write_all(&[c])
}

pub fn flush() -> io::Result<()> {
    io::stdout().flush()
}
