// Raw terminal control: termios, file-status flags and select() on a tty fd
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::log_debug;

#[derive(Debug, Error)]
pub enum TerminalConfigError {
    #[error("unable to get current terminal attributes: {0}")]
    GetAttributes(#[source] io::Error),
    #[error("unable to set terminal attributes: {0}")]
    SetAttributes(#[source] io::Error),
    #[error("unable to get file status flags: {0}")]
    GetFlags(#[source] io::Error),
    #[error("unable to set file status flags: {0}")]
    SetFlags(#[source] io::Error),
    #[error("terminal is already held in raw mode by this process")]
    AlreadyActive,
}

/// Set while a `TerminalModeGuard` holds a terminal; one per process
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Tests that take a guard run one at a time, the session flag is global
#[cfg(test)]
pub(crate) fn session_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The operations the probe needs from a terminal descriptor.
///
/// `TtyDevice` is the real implementation; tests drive the probe through
/// scripted fakes.
pub trait TerminalDevice {
    fn get_attrs(&mut self) -> io::Result<libc::termios>;
    fn set_attrs(&mut self, attrs: &libc::termios) -> io::Result<()>;
    fn get_flags(&mut self) -> io::Result<libc::c_int>;
    fn set_flags(&mut self, flags: libc::c_int) -> io::Result<()>;

    /// Wait up to `timeout` for input. `Ok(false)` means the wait timed out.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Single read; a non-blocking descriptor with nothing pending reports
    /// `io::ErrorKind::WouldBlock`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A terminal file descriptor, usually stdin
#[derive(Debug, Clone, Copy)]
pub struct TtyDevice {
    fd: RawFd,
}

impl TtyDevice {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn stdin() -> Self {
        Self::new(libc::STDIN_FILENO)
    }
}

impl TerminalDevice for TtyDevice {
    fn get_attrs(&mut self) -> io::Result<libc::termios> {
        unsafe {
            let mut termios: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(self.fd, &mut termios) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(termios)
        }
    }

    fn set_attrs(&mut self, attrs: &libc::termios) -> io::Result<()> {
        if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, attrs) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn get_flags(&mut self) -> io::Result<libc::c_int> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }

    fn set_flags(&mut self, flags: libc::c_int) -> io::Result<()> {
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.fd < 0 || self.fd >= libc::FD_SETSIZE as RawFd {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        unsafe {
            let mut fds: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut fds);
            libc::FD_SET(self.fd, &mut fds);

            let mut tv = libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            };

            let result = libc::select(
                self.fd + 1,
                &mut fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            );

            if result < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(result > 0)
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl<D: TerminalDevice + ?Sized> TerminalDevice for &mut D {
    fn get_attrs(&mut self) -> io::Result<libc::termios> {
        (**self).get_attrs()
    }
    fn set_attrs(&mut self, attrs: &libc::termios) -> io::Result<()> {
        (**self).set_attrs(attrs)
    }
    fn get_flags(&mut self) -> io::Result<libc::c_int> {
        (**self).get_flags()
    }
    fn set_flags(&mut self, flags: libc::c_int) -> io::Result<()> {
        (**self).set_flags(flags)
    }
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }
}

/// What the terminal looked like before raw mode was entered
pub struct TerminalSession {
    termios: libc::termios,
    flags: libc::c_int,
}

/// Canonical mode and echo off, reads return after at most 0.1s
pub fn raw_attrs(original: &libc::termios) -> libc::termios {
    let mut raw = *original;
    raw.c_lflag &= !(libc::ICANON | libc::ECHO);
    raw.c_cc[libc::VMIN] = 0;
    raw.c_cc[libc::VTIME] = 1;
    raw
}

/// Holds a terminal in raw, non-blocking mode.
///
/// Acquiring saves the attributes and file-status flags, then switches the
/// descriptor over. The saved state is written back exactly once: by
/// `release`, or by `Drop` on any other exit path.
pub struct TerminalModeGuard<D: TerminalDevice> {
    device: D,
    session: Option<TerminalSession>,
}

impl<D: TerminalDevice> TerminalModeGuard<D> {
    pub fn acquire(mut device: D) -> Result<Self, TerminalConfigError> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TerminalConfigError::AlreadyActive);
        }

        match enter_raw_mode(&mut device) {
            Ok(session) => Ok(Self { device, session: Some(session) }),
            Err(e) => {
                SESSION_ACTIVE.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Restore the saved mode now and report any failure
    pub fn release(mut self) -> io::Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> io::Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        // Both halves are attempted even if the first fails
        let attrs = self.device.set_attrs(&session.termios);
        let flags = self.device.set_flags(session.flags);
        SESSION_ACTIVE.store(false, Ordering::Release);
        log_debug!("[TERMINAL] mode restored");
        attrs.and(flags)
    }
}

fn enter_raw_mode<D: TerminalDevice>(
    device: &mut D,
) -> Result<TerminalSession, TerminalConfigError> {
    let termios = device
        .get_attrs()
        .map_err(TerminalConfigError::GetAttributes)?;
    let flags = device.get_flags().map_err(TerminalConfigError::GetFlags)?;

    device
        .set_attrs(&raw_attrs(&termios))
        .map_err(TerminalConfigError::SetAttributes)?;

    if let Err(e) = device.set_flags(flags | libc::O_NONBLOCK) {
        // Attributes already changed; put them back before bailing
        if let Err(restore) = device.set_attrs(&termios) {
            log_debug!("[TERMINAL] failed to restore attributes: {}", restore);
        }
        return Err(TerminalConfigError::SetFlags(e));
    }

    log_debug!("[TERMINAL] raw non-blocking mode entered (flags {:#x})", flags);
    Ok(TerminalSession { termios, flags })
}

impl<D: TerminalDevice> Deref for TerminalModeGuard<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.device
    }
}

impl<D: TerminalDevice> DerefMut for TerminalModeGuard<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: TerminalDevice> Drop for TerminalModeGuard<D> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log_debug!("[TERMINAL] failed to restore terminal mode: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub columns: u16,
    pub width: u16,
    pub height: u16,
}

// Terminal size detection, cells and pixels
pub fn window_size() -> io::Result<WindowSize> {
    let size = crossterm::terminal::window_size()?;
    Ok(WindowSize {
        rows: size.rows,
        columns: size.columns,
        width: size.width,
        height: size.height,
    })
}
