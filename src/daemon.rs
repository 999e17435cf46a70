//! Detaching from the controlling terminal

use std::io;

/// Which side of the fork we are on
#[derive(Debug, PartialEq, Eq)]
pub enum Fork {
    Parent(u32),
    Child,
}

/// Fork and start a new session in the child.
///
/// Must run before any threads (including the async runtime) exist.
#[cfg(unix)]
pub fn detach() -> io::Result<Fork> {
    // SAFETY: the caller guarantees the process is still single-threaded.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // SAFETY: setsid has no memory-safety preconditions.
            if unsafe { libc::setsid() } == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(Fork::Child)
        }
        pid => Ok(Fork::Parent(pid as u32)),
    }
}

#[cfg(not(unix))]
pub fn detach() -> io::Result<Fork> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "running in the background is only supported on unix; use --foreground",
    ))
}
