//! Pseudo-terminal allocation
//!
//! Interactive shells only print prompts and enable job control when their
//! standard streams are a terminal, so console scenarios run the CLI on the
//! slave side of a pty and talk to it through the master.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, Winsize};

use crate::common::{Error, Result};

/// Terminal size reported to the child
const ROWS: u16 = 24;
const COLS: u16 = 80;

mod ioctl {
    nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, nix::pty::Winsize);
    nix::ioctl_write_int_bad!(set_controlling_tty, libc::TIOCSCTTY);
}

/// A master/slave pseudo-terminal pair
#[derive(Debug)]
pub struct Pty {
    pub master: File,
    pub slave: File,
    pub slave_path: PathBuf,
}

fn pty_error(call: &str, errno: Errno) -> Error {
    Error::Pty(format!("{call}: {errno}"))
}

impl Pty {
    /// Allocate a new pty pair
    pub fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(|e| pty_error("posix_openpt", e))?;
        grantpt(&master).map_err(|e| pty_error("grantpt", e))?;
        unlockpt(&master).map_err(|e| pty_error("unlockpt", e))?;
        let slave_path = PathBuf::from(ptsname_r(&master).map_err(|e| pty_error("ptsname_r", e))?);

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_CLOEXEC).bits())
            .open(&slave_path)
            .map_err(|e| Error::Pty(format!("open {}: {e}", slave_path.display())))?;

        let size = Winsize {
            ws_row: ROWS,
            ws_col: COLS,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        if let Err(e) = unsafe { ioctl::set_window_size(master.as_raw_fd(), &size) } {
            tracing::debug!(error = %e, "Could not set pty size");
        }

        // std::fs::File gives the reader thread and the writer their own handles
        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };

        tracing::trace!(slave = %slave_path.display(), "Allocated pty");
        Ok(Self {
            master,
            slave,
            slave_path,
        })
    }
}

/// Make the child a session leader with stdin as its controlling terminal
///
/// Runs between fork and exec, so it only uses async-signal-safe calls.
pub(crate) fn become_session_leader() -> io::Result<()> {
    nix::unistd::setsid()?;
    unsafe { ioctl::set_controlling_tty(0, 0) }?;
    Ok(())
}

/// Whether a read error on the master means the slave side is gone
///
/// Linux reports EIO once every slave descriptor is closed.
pub(crate) fn is_hangup(error: &io::Error) -> bool {
    error.raw_os_error() == Some(Errno::EIO as i32)
}
