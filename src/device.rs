//! Virtual network device I/O.
//!
//! The stack treats a device as an opaque, non-blocking source and sink of
//! frames with a pollable descriptor.  [`TunDevice`] opens a Linux TUN or
//! TAP interface through `/dev/net/tun`; interface addressing, MTU, and
//! link state are left to OS tooling (`ip addr`, `ip link set up`).
//!
//! Closing is `Drop`: the owned descriptor is closed with the device.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{c_char, c_short, c_void};

use crate::config::{DeviceConfig, DeviceMode};

/// A frame source/sink driven by the event loop.
pub trait Device {
    /// Interface name assigned by the OS.
    fn name(&self) -> &str;

    fn mode(&self) -> DeviceMode;

    /// Descriptor the event loop polls for readability.
    fn raw_fd(&self) -> RawFd;

    /// Read one frame into `buf`.  Returns `Ok(0)` when no frame is ready.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame.  A full device reports
    /// [`io::ErrorKind::WouldBlock`].
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
}

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// `struct ifreq` as used by TUNSETIFF: name plus flags.
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; libc::IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// Linux TUN/TAP interface.
#[derive(Debug)]
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
    mode: DeviceMode,
}

impl TunDevice {
    /// Create (or attach to) the interface named in `config`.
    ///
    /// An empty name lets the kernel choose one (`tun0`, `tap0`, ...).
    pub fn open(config: &DeviceConfig) -> io::Result<Self> {
        let mode_flag = match config.mode {
            DeviceMode::Tun => libc::IFF_TUN,
            DeviceMode::Tap => libc::IFF_TAP,
        };
        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: (mode_flag | libc::IFF_NO_PI) as c_short,
            _pad: [0; 22],
        };
        for (dst, byte) in ifr
            .ifr_name
            .iter_mut()
            .zip(config.name.bytes().take(libc::IFNAMSIZ - 1))
        {
            *dst = byte as c_char;
        }

        // SAFETY: the path is NUL-terminated; the returned descriptor is
        // checked before use and owned by `OwnedFd` from then on.
        let fd = unsafe {
            let raw = libc::open(
                b"/dev/net/tun\0".as_ptr() as *const c_char,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            );
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(raw)
        };

        // SAFETY: `ifr` is a properly sized, initialised ifreq.
        let rc = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                TUNSETIFF as _,
                &mut ifr as *mut IfReq as *mut c_void,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the kernel NUL-terminates the name it writes back.
        let name = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        log::info!("[dev] opened {name} ({:?}, mtu {})", config.mode, config.mtu);

        Ok(Self {
            fd,
            name,
            mode: config.mode,
        })
    }
}

impl Device for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for `buf.len()` writable bytes.
        let n = unsafe { libc::read(self.raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }
        Ok(n as usize)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        // SAFETY: `frame` is valid for `frame.len()` readable bytes.
        let n = unsafe { libc::write(self.raw_fd(), frame.as_ptr() as *const c_void, frame.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}
