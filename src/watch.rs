//! A single kernel-registered vnode watch on an open descriptor.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::snapshot::DirSnapshot;
use crate::sys;
use crate::translate::{self, DEPS_EXCLUDED_FLAGS};
use crate::watches::WatchMask;

/// Distinguishes watches the consumer asked for from the internal ones
/// tracking a directory's children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WatchKind {
    /// Created at the consumer's request; addressable by its id.
    User,
    /// Created internally for one entry of a user directory watch.
    Dependency,
}

/// One watch: an open descriptor with a vnode filter registered on it.
///
/// The descriptor doubles as the watch id the consumer sees. `-1` means
/// the descriptor is gone (a failed reopen); such a watch is dead
/// weight until the next reconciliation sweeps it away.
#[derive(Debug)]
pub(crate) struct Watch {
    pub fd: RawFd,
    pub inode: u64,
    /// The descriptor refers to a directory.
    pub is_really_dir: bool,
    /// This is a *user* watch on a directory; only these reconcile.
    pub is_directory: bool,
    pub flags: WatchMask,
    /// Full path for user watches; bare entry name for dependencies.
    pub filename: PathBuf,
    pub kind: WatchKind,
    /// Id (descriptor) of the owning user watch; never an ownership
    /// edge.
    pub parent: Option<RawFd>,
    /// Current contents; present exactly for user directory watches.
    pub deps: Option<DirSnapshot>,
}

impl Watch {
    /// Open `path` and register a vnode filter for it on `kq`.
    ///
    /// For dependency watches, `entry_name` (never `path`) is what gets
    /// stored as the watch's filename, and the mask bits that only make
    /// sense on a user watch are stripped before translation.
    pub(crate) fn init(
        kind: WatchKind,
        kq: RawFd,
        path: &Path,
        entry_name: Option<PathBuf>,
        mask: WatchMask,
    ) -> io::Result<Watch> {
        let file = File::open(path)?;
        let meta = file.metadata()?;

        let flags = match kind {
            WatchKind::User => mask,
            WatchKind::Dependency => mask.difference(DEPS_EXCLUDED_FLAGS),
        };

        let is_really_dir = meta.is_dir();
        let is_subwatch = kind == WatchKind::Dependency;
        let fflags = translate::to_kqueue(flags, is_really_dir, is_subwatch);

        // Dropping `file` on the error path closes the descriptor.
        sys::register_vnode(kq, file.as_raw_fd(), fflags)?;

        let filename = match kind {
            WatchKind::User => path.to_path_buf(),
            WatchKind::Dependency => match entry_name {
                Some(name) => name,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "dependency watch requires an entry name",
                    ));
                }
            },
        };

        Ok(Watch {
            fd: file.into_raw_fd(),
            inode: meta.ino(),
            is_really_dir,
            is_directory: kind == WatchKind::User && is_really_dir,
            flags,
            filename,
            kind,
            parent: None,
            deps: None,
        })
    }

    /// Re-open a dependency watch after its file was renamed or
    /// replaced.
    ///
    /// The full path is rebuilt from the parent's path and this watch's
    /// entry name. On failure the descriptor is left at `-1`; the next
    /// reconciliation removes the watch.
    pub(crate) fn reopen(&mut self, kq: RawFd, parent_path: &Path) -> io::Result<()> {
        if self.fd != -1 {
            sys::close(self.fd);
            self.fd = -1;
        }

        let path = parent_path.join(&self.filename);
        let file = File::open(&path)?;
        let meta = file.metadata()?;

        let fflags = translate::to_kqueue(
            self.flags,
            meta.is_dir(),
            self.kind == WatchKind::Dependency,
        );
        sys::register_vnode(kq, file.as_raw_fd(), fflags)?;

        self.fd = file.into_raw_fd();
        self.inode = meta.ino();
        self.is_really_dir = meta.is_dir();
        self.is_directory = self.kind == WatchKind::User && self.is_really_dir;

        Ok(())
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if self.fd != -1 {
            sys::close(self.fd);
        }
    }
}
