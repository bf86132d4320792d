//! EINTR-safe I/O helpers and small descriptor probes.

use std::io;
use std::os::unix::io::RawFd;

use libc::{c_void, size_t};

/// Maximum iovec slots handed to a single writev(2) call.
const IOV_BATCH: usize = 1024;

/// Give up on a stream after this many consecutive calls that make no
/// forward progress.
const MAX_STALLS: u32 = 10;

/// Issue a single read(2), returning the raw result.
///
/// Unlike [`safe_read`], this does not loop: the caller decides what a
/// short read means. Used on the session descriptor, where one read
/// yields one batch of event records.
pub(crate) fn read_into_buffer(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe {
        libc::read(
            fd,
            buffer.as_mut_ptr() as *mut c_void,
            buffer.len() as size_t,
        )
    }
}

/// EINTR-ready version of read(2).
///
/// Reads until `data` is full or end-of-file is reached, and returns the
/// number of bytes actually read.
pub(crate) fn safe_read(fd: RawFd, data: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < data.len() {
        let ret = unsafe {
            libc::read(
                fd,
                data[total..].as_mut_ptr() as *mut c_void,
                (data.len() - total) as size_t,
            )
        };
        match ret {
            0 => break,
            n if n > 0 => total += n as usize,
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
    Ok(total)
}

/// EINTR-ready version of write(2). Writes the whole buffer.
pub(crate) fn safe_write(fd: RawFd, data: &[u8]) -> io::Result<()> {
    let mut total = 0;
    let mut stalls = 0;
    while total < data.len() {
        let ret = unsafe {
            libc::write(
                fd,
                data[total..].as_ptr() as *const c_void,
                (data.len() - total) as size_t,
            )
        };
        match ret {
            0 => {
                stalls += 1;
                if stalls > MAX_STALLS {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write made no progress",
                    ));
                }
            }
            n if n > 0 => {
                total += n as usize;
                stalls = 0;
            }
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

/// EINTR-ready version of writev(2).
///
/// Writes every buffer in `bufs` completely, retrying the remainder on
/// interruption or a partial write. The records of one wake cycle are
/// flushed through here so the consumer observes them as one write.
pub(crate) fn safe_writev(fd: RawFd, bufs: &[Vec<u8>]) -> io::Result<()> {
    let mut iov: Vec<libc::iovec> = bufs
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut c_void,
            iov_len: b.len(),
        })
        .collect();

    let mut idx = 0;
    let mut stalls = 0;
    while idx < iov.len() {
        let count = (iov.len() - idx).min(IOV_BATCH);
        let ret = unsafe { libc::writev(fd, iov[idx..].as_ptr(), count as _) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let mut written = ret as usize;
        if written == 0 {
            stalls += 1;
            if stalls > MAX_STALLS {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "writev made no progress",
                ));
            }
            continue;
        }
        stalls = 0;

        // Skip over the fully written slots, then shrink the slot the
        // write stopped in.
        while idx < iov.len() && written >= iov[idx].iov_len {
            written -= iov[idx].iov_len;
            idx += 1;
        }
        if written > 0 {
            iov[idx].iov_base = unsafe { (iov[idx].iov_base as *mut u8).add(written) } as *mut c_void;
            iov[idx].iov_len -= written;
        }
    }
    Ok(())
}

/// Check whether a descriptor is still open.
pub(crate) fn is_opened(fd: RawFd) -> bool {
    fd != -1 && unsafe { libc::fcntl(fd, libc::F_GETFL) } != -1
}

/// Check whether the file behind a descriptor has lost its last link.
///
/// Errors count as deleted; the caller is about to drop the watch
/// either way.
pub(crate) fn is_deleted(fd: RawFd) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } == -1 {
        return true;
    }
    st.st_nlink == 0
}
