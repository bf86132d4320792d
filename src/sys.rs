//! Thin safe wrappers around the kqueue(2) calls the crate needs.
//!
//! Every `unsafe` syscall invocation related to the kernel event queue
//! lives here; the rest of the crate works with `io::Result`.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// Create a new kernel event queue.
pub(crate) fn kqueue() -> io::Result<RawFd> {
    match unsafe { libc::kqueue() } {
        -1 => Err(io::Error::last_os_error()),
        kq => Ok(kq),
    }
}

/// Create a connected `AF_UNIX`/`SOCK_STREAM` pair.
///
/// The first descriptor is handed to the session (consumer side), the
/// second is kept by the worker. A write racing the peer's close must
/// fail with `EPIPE` rather than raise `SIGPIPE`.
pub(crate) fn socketpair_stream() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    let ret = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "dragonfly",
    ))]
    for fd in &fds {
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                *fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    Ok((fds[0], fds[1]))
}

/// Register (or re-register) a vnode filter on an open descriptor.
///
/// `EV_CLEAR` gives the edge-triggered semantics the worker loop relies
/// on: a filter fires once per state change and resets on retrieval.
pub(crate) fn register_vnode(kq: RawFd, fd: RawFd, fflags: u32) -> io::Result<()> {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = libc::EVFILT_VNODE;
    ev.flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR;
    ev.fflags = fflags;
    submit(kq, &ev)
}

/// Register a read filter with a low watermark of one byte.
///
/// Used on the worker's end of the socketpair so that a single wakeup
/// byte from the controlling thread interrupts the kqueue wait.
pub(crate) fn register_read_lowat(kq: RawFd, fd: RawFd) -> io::Result<()> {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = libc::EVFILT_READ;
    ev.flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR;
    ev.fflags = libc::NOTE_LOWAT;
    ev.data = 1;
    submit(kq, &ev)
}

fn submit(kq: RawFd, ev: &libc::kevent) -> io::Result<()> {
    let ret = unsafe {
        libc::kevent(kq, ev, 1 as _, ptr::null_mut(), 0 as _, ptr::null())
    };
    match ret {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Block until at least one event is available and fill `events`.
///
/// Returns the number of events written. `EINTR` is reported as an
/// error of kind `Interrupted`; the caller retries.
pub(crate) fn wait(kq: RawFd, events: &mut [libc::kevent]) -> io::Result<usize> {
    let ret = unsafe {
        libc::kevent(
            kq,
            ptr::null(),
            0 as _,
            events.as_mut_ptr(),
            events.len() as _,
            ptr::null(),
        )
    };
    match ret {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Close a descriptor, ignoring errors.
pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
