use std::ops::Deref;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared ownership wrapper for the session's file descriptor.
///
/// The descriptor is closed when the last owner goes away, unless
/// [`FdGuard::should_not_close`] has been called first (which the
/// consuming `close`/`into_raw_fd` paths do after closing it
/// themselves).
#[derive(Debug)]
pub(crate) struct FdGuard {
    pub(crate) fd: RawFd,
    pub(crate) close_on_drop: AtomicBool,
}

impl FdGuard {
    pub(crate) fn new(fd: RawFd) -> FdGuard {
        FdGuard {
            fd,
            close_on_drop: AtomicBool::new(true),
        }
    }

    /// Indicate that the file descriptor should not be closed on drop.
    pub(crate) fn should_not_close(&self) {
        self.close_on_drop.store(false, Ordering::Release);
    }
}

impl Deref for FdGuard {
    type Target = RawFd;

    fn deref(&self) -> &Self::Target {
        &self.fd
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.close_on_drop.load(Ordering::Acquire) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl AsRawFd for FdGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for FdGuard {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FdGuard::new(fd)
    }
}

impl PartialEq for FdGuard {
    fn eq(&self, other: &FdGuard) -> bool {
        self.fd == other.fd
    }
}
