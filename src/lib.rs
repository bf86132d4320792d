#![deny(missing_docs)]

//! Linux inotify semantics for kqueue hosts
//!
//! # About
//!
//! inotify-kqueue provides the Linux [inotify] file-change notification
//! interface on systems whose kernel event facility is [kqueue]: macOS,
//! FreeBSD, NetBSD, OpenBSD and DragonFly. It can be used for
//! monitoring changes to files or directories.
//!
//! The two interfaces do not line up naturally. inotify hands out a
//! watch descriptor per *path* and synthesizes events for the entries
//! of a watched directory, while kqueue reports raw vnode events on
//! descriptors the watcher already opened, with no notion of names.
//! This crate bridges the gap with a per-session worker thread: it
//! keeps a descriptor open for every watched path and for every entry
//! of a watched directory, re-lists a directory whenever the kernel
//! reports its contents changed, and diffs the listings (by name, then
//! by inode) to synthesize the create/delete/rename event stream a
//! Linux consumer expects.
//!
//! The [`Inotify`] struct is the main entry point into the API.
//!
//! # Example
//!
//! ``` no_run
//! use inotify_kqueue::{
//!     Inotify,
//!     WatchMask,
//! };
//!
//! let mut inotify = Inotify::init()
//!     .expect("Error while initializing session");
//!
//! // Watch for modify and delete events.
//! inotify
//!     .add_watch(
//!         "/tmp/inotify-kqueue-test-file",
//!         WatchMask::MODIFY | WatchMask::DELETE_SELF,
//!     )
//!     .expect("Failed to add file watch");
//!
//! // Read events that were added with `add_watch` above.
//! let mut buffer = [0; 1024];
//! let events = inotify.read_events_blocking(&mut buffer)
//!     .expect("Error while reading events");
//!
//! for event in events {
//!     // Handle event
//! }
//! ```
//!
//! # Attention: semantic gaps
//!
//! kqueue cannot observe everything inotify can. Open/close/access
//! events do not exist at the vnode layer, and events for the children
//! of a watched directory are reconstructed from directory listings, so
//! a create immediately followed by a delete may be missed entirely.
//! Only one level of children is tracked: entries of a watched
//! directory, not their contents.
//!
//! [inotify]: https://en.wikipedia.org/wiki/Inotify
//! [kqueue]: https://www.freebsd.org/cgi/man.cgi?kqueue
//! [`Inotify`]: struct.Inotify.html

mod emit;
mod events;
mod fd_guard;
mod sets;
mod snapshot;
mod sys;
mod translate;
mod util;
mod watch;
mod watches;
mod worker;

pub use crate::events::{Event, EventMask, EventOwned, Events};
pub use crate::watches::{WatchDescriptor, WatchMask};

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use libc::{fcntl, F_GETFL, F_SETFL, O_NONBLOCK};

use crate::fd_guard::FdGuard;
use crate::worker::CommandSlot;

/// One notification session
///
/// An `Inotify` owns a worker thread, a kernel event queue, and the
/// readable end of the stream the worker emits event records to. It
/// generally tries to adhere to the Linux inotify API closely, while
/// making access to it safe and convenient.
///
/// Please refer to the [top-level documentation] for further details
/// and a usage example.
///
/// [top-level documentation]: index.html
pub struct Inotify {
    fd: Arc<FdGuard>,
    cmd: Arc<CommandSlot>,
    thread: Option<JoinHandle<()>>,
}

impl Inotify {
    /// Creates an [`Inotify`] instance
    ///
    /// Sets up a kernel event queue, a socket pair, and the worker
    /// thread that owns both. The returned session holds the readable
    /// end of the pair; it is non-blocking, so the blocking behavior of
    /// this API is entirely managed by this wrapper.
    ///
    /// # Errors
    ///
    /// Returns the error of whichever setup step failed: the
    /// `kqueue(2)` or `socketpair(2)` call, the filter registration, or
    /// spawning the thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use inotify_kqueue::Inotify;
    ///
    /// let inotify = Inotify::init()
    ///     .expect("Failed to initialize a session");
    /// ```
    ///
    /// [`Inotify`]: struct.Inotify.html
    pub fn init() -> io::Result<Inotify> {
        let (fd, cmd, thread) = worker::spawn()?;
        Ok(Inotify {
            fd,
            cmd,
            thread: Some(thread),
        })
    }

    /// Adds or updates a watch for the given path
    ///
    /// Adds a new watch or updates an existing one for the file
    /// referred to by `path`. Returns a watch descriptor that can be
    /// used to refer to this watch later.
    ///
    /// The `mask` argument defines what kind of changes the file should
    /// be watched for. See the documentation of [`WatchMask`] for
    /// details.
    ///
    /// If this method is used to add a new watch, a new
    /// [`WatchDescriptor`] is returned. If it is used to update an
    /// existing watch (same `path` as an earlier call), the same
    /// [`WatchDescriptor`] is returned and the watch's mask is
    /// replaced; for a directory watch, the masks of the internal
    /// per-entry watches are replaced along with it.
    ///
    /// Under the hood, this method submits a command to the worker
    /// thread and blocks until the worker has executed it.
    ///
    /// # Errors
    ///
    /// Fails with the error of the `open(2)` on the path or of the
    /// kernel registration, with `ErrorKind::InvalidInput` for an empty
    /// mask, and with `ErrorKind::BrokenPipe` if the worker is gone.
    ///
    /// # Examples
    ///
    /// ``` no_run
    /// use inotify_kqueue::{
    ///     Inotify,
    ///     WatchMask,
    /// };
    ///
    /// let mut inotify = Inotify::init()
    ///     .expect("Failed to initialize a session");
    ///
    /// inotify.add_watch("/tmp/inotify-kqueue-test-file", WatchMask::MODIFY)
    ///     .expect("Failed to add file watch");
    ///
    /// // Handle events for the file here
    /// ```
    ///
    /// [`WatchMask`]: struct.WatchMask.html
    /// [`WatchDescriptor`]: struct.WatchDescriptor.html
    pub fn add_watch<P>(&mut self, path: P, mask: WatchMask) -> io::Result<WatchDescriptor>
    where
        P: AsRef<Path>,
    {
        if mask.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "watch mask must not be empty",
            ));
        }

        let id = self
            .cmd
            .submit_add(**self.fd, path.as_ref().to_path_buf(), mask)?;

        Ok(WatchDescriptor {
            id,
            fd: Arc::downgrade(&self.fd),
        })
    }

    /// Stops watching a path
    ///
    /// Removes the watch represented by the provided
    /// [`WatchDescriptor`]. [`WatchDescriptor`]s can be obtained via
    /// [`Inotify::add_watch`], or from the `wd` field of [`Event`].
    ///
    /// Once the removal has been executed, a final event with the
    /// [`IGNORED`] mask and this watch's id appears on the stream, and
    /// no event with this id ever follows it.
    ///
    /// Removing a watch that this session no longer knows (because the
    /// watched path disappeared concurrently) is a no-op, matching the
    /// tolerance of the Linux interface.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] with [`ErrorKind`]`::InvalidInput`, if
    /// the given [`WatchDescriptor`] did not originate from this
    /// [`Inotify`] instance.
    ///
    /// [`WatchDescriptor`]: struct.WatchDescriptor.html
    /// [`Inotify::add_watch`]: struct.Inotify.html#method.add_watch
    /// [`Event`]: struct.Event.html
    /// [`IGNORED`]: struct.EventMask.html#associatedconstant.IGNORED
    /// [`Inotify`]: struct.Inotify.html
    /// [`io::Error`]: https://doc.rust-lang.org/std/io/struct.Error.html
    /// [`ErrorKind`]: https://doc.rust-lang.org/std/io/enum.ErrorKind.html
    pub fn rm_watch(&mut self, wd: WatchDescriptor) -> io::Result<()> {
        if wd.fd.upgrade().as_ref() != Some(&self.fd) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid WatchDescriptor",
            ));
        }

        self.cmd.submit_remove(**self.fd, wd.id)
    }

    /// Waits until events are available, then returns them
    ///
    /// Blocks the current thread until at least one event is available.
    /// If this is not desirable, please consider
    /// [`Inotify::read_events`].
    ///
    /// [`Inotify::read_events`]: struct.Inotify.html#method.read_events
    pub fn read_events_blocking<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<Events<'a>> {
        unsafe {
            fcntl(**self.fd, F_SETFL, fcntl(**self.fd, F_GETFL) & !O_NONBLOCK);
        }
        let result = self.read_events(buffer);
        unsafe {
            fcntl(**self.fd, F_SETFL, fcntl(**self.fd, F_GETFL) | O_NONBLOCK);
        }

        result
    }

    /// Returns any available events
    ///
    /// Returns an iterator over all events that are currently
    /// available. If no events are available, an iterator is still
    /// returned.
    ///
    /// The `buffer` argument, as the name indicates, is used as a
    /// buffer for the event records. Its contents may be overwritten.
    /// Records flushed by the worker in one wake cycle arrive in one
    /// piece; a buffer of a few kilobytes is plenty.
    ///
    /// # Errors
    ///
    /// This function directly returns all errors from the call to
    /// `read(2)` (except `EAGAIN`/`EWOULDBLOCK`, which result in an
    /// empty iterator). In addition, [`ErrorKind::UnexpectedEof`] is
    /// returned if the call to `read(2)` returns `0`, signaling that
    /// the worker has shut down.
    ///
    /// [`ErrorKind::UnexpectedEof`]: https://doc.rust-lang.org/std/io/enum.ErrorKind.html#variant.UnexpectedEof
    pub fn read_events<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<Events<'a>> {
        let num_bytes = util::read_into_buffer(**self.fd, buffer);

        let num_bytes = match num_bytes {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "`read` returned `0`, signaling end-of-file",
                ));
            }
            -1 => {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::WouldBlock {
                    return Ok(Events::new(Arc::downgrade(&self.fd), buffer, 0));
                } else {
                    return Err(error);
                }
            }
            _ if num_bytes < 0 => {
                panic!(
                    "Unexpected return value from `read`: {}. According to the \
                     `read` man page, either `-1` is returned on error, `0` on \
                     end-of-file, or a positive value for the number of bytes \
                     read.",
                    num_bytes,
                );
            }
            _ => num_bytes as usize,
        };

        Ok(Events::new(Arc::downgrade(&self.fd), buffer, num_bytes))
    }

    /// Closes the session
    ///
    /// Closes the session descriptor; the worker thread observes the
    /// hangup on its kernel queue, releases every watch, and exits.
    /// This method waits for it. The user usually doesn't have to call
    /// this function, as the same shutdown happens when [`Inotify`] is
    /// dropped (without the wait).
    ///
    /// # Errors
    ///
    /// Directly returns the error from the call to `close(2)`, without
    /// adding any error conditions of its own.
    ///
    /// # Examples
    ///
    /// ```
    /// use inotify_kqueue::Inotify;
    ///
    /// let inotify = Inotify::init()
    ///     .expect("Failed to initialize a session");
    ///
    /// inotify.close()
    ///     .expect("Failed to close the session");
    /// ```
    ///
    /// [`Inotify`]: struct.Inotify.html
    pub fn close(mut self) -> io::Result<()> {
        // `self` is dropped when this method returns; the guard's
        // `Drop` must not close the descriptor a second time.
        self.fd.should_not_close();

        let result = match unsafe { libc::close(**self.fd) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        };

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        result
    }
}

impl AsRawFd for Inotify {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
