//! Serial port acquisition.
//!
//! Opens the character device read/write without becoming its controlling
//! terminal and configures raw 8-N-1 line discipline at the requested
//! speed. All flow control happens at the line level in the router, so the
//! port itself runs with no hardware or software handshaking.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;

use nix::sys::termios::{self, BaudRate, SetArg};

/// Open `path` for the event loop: read/write, `O_NOCTTY`, non-blocking,
/// raw mode at `baud`.
///
/// Any open or attribute failure is a deployment error and propagates to
/// the caller, which treats it as fatal.
pub fn open(path: &str, baud: u32) -> io::Result<OwnedFd> {
    let speed = baud_rate(baud).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported baud rate: {baud}"),
        )
    })?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)?;

    let mut attrs = termios::tcgetattr(&file).map_err(io::Error::from)?;
    // No canonical mode, no echo, no signal generation, 8 data bits.
    termios::cfmakeraw(&mut attrs);
    termios::cfsetspeed(&mut attrs, speed).map_err(io::Error::from)?;
    termios::tcsetattr(&file, SetArg::TCSANOW, &attrs).map_err(io::Error::from)?;

    Ok(file.into())
}

/// Map an integer baud rate onto the platform's termios speed constant.
/// Returns `None` for rates the platform does not enumerate.
pub fn baud_rate(baud: u32) -> Option<BaudRate> {
    match baud {
        0 => Some(BaudRate::B0),
        50 => Some(BaudRate::B50),
        75 => Some(BaudRate::B75),
        110 => Some(BaudRate::B110),
        134 => Some(BaudRate::B134),
        150 => Some(BaudRate::B150),
        200 => Some(BaudRate::B200),
        300 => Some(BaudRate::B300),
        600 => Some(BaudRate::B600),
        1200 => Some(BaudRate::B1200),
        1800 => Some(BaudRate::B1800),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        460800 => Some(BaudRate::B460800),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        500000 => Some(BaudRate::B500000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        576000 => Some(BaudRate::B576000),
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        921600 => Some(BaudRate::B921600),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1000000 => Some(BaudRate::B1000000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1152000 => Some(BaudRate::B1152000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1500000 => Some(BaudRate::B1500000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        2000000 => Some(BaudRate::B2000000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        2500000 => Some(BaudRate::B2500000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        3000000 => Some(BaudRate::B3000000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        3500000 => Some(BaudRate::B3500000),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        4000000 => Some(BaudRate::B4000000),
        _ => None,
    }
}
