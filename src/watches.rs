use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    os::raw::c_int,
    sync::Weak,
};

use bitflags::bitflags;

use crate::fd_guard::FdGuard;

bitflags! {
    /// Describes a file system watch
    ///
    /// Passed to [`Inotify::add_watch`], to describe what file system
    /// events to watch for. The bit values are the ones Linux uses, so
    /// masks round-trip through the wire format unchanged.
    ///
    /// # Attention: limits of the vnode filter
    ///
    /// kqueue reports what happened to an open file, not who touched
    /// it. [`ACCESS`], [`OPEN`], [`CLOSE_WRITE`] and [`CLOSE_NOWRITE`]
    /// are accepted for compatibility but never fire on this
    /// implementation; `CLOSE_WRITE` still counts as interest in
    /// directory content changes, matching how callers use it on Linux.
    ///
    /// # Examples
    ///
    /// ``` no_run
    /// # use inotify_kqueue::{Inotify, WatchMask};
    /// #
    /// # let mut inotify = Inotify::init().unwrap();
    /// inotify.add_watch("/tmp/", WatchMask::CREATE | WatchMask::DELETE)
    ///    .expect("Error adding watch");
    /// ```
    ///
    /// [`Inotify::add_watch`]: crate::Inotify::add_watch
    /// [`ACCESS`]: Self::ACCESS
    /// [`OPEN`]: Self::OPEN
    /// [`CLOSE_WRITE`]: Self::CLOSE_WRITE
    /// [`CLOSE_NOWRITE`]: Self::CLOSE_NOWRITE
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct WatchMask: u32 {
        /// File was accessed (never generated here; see above)
        const ACCESS = 0x0000_0001;

        /// File was modified
        ///
        /// When watching a directory, this event is only triggered for
        /// objects inside the directory, not the directory itself.
        const MODIFY = 0x0000_0002;

        /// Metadata (permissions, timestamps, ...) changed
        ///
        /// When watching a directory, this event can be triggered for
        /// the directory itself, as well as objects inside the
        /// directory.
        const ATTRIB = 0x0000_0004;

        /// File opened for writing was closed (never generated here)
        const CLOSE_WRITE = 0x0000_0008;

        /// Non-writable file was closed (never generated here)
        const CLOSE_NOWRITE = 0x0000_0010;

        /// File or directory was opened (never generated here)
        const OPEN = 0x0000_0020;

        /// File was renamed away; watched directory contained old name
        const MOVED_FROM = 0x0000_0040;

        /// File was renamed in; watched directory contains new name
        const MOVED_TO = 0x0000_0080;

        /// File/directory created in watched directory
        const CREATE = 0x0000_0100;

        /// File/directory deleted from watched directory
        const DELETE = 0x0000_0200;

        /// Watched file/directory was itself deleted
        const DELETE_SELF = 0x0000_0400;

        /// Watched file/directory was itself moved
        const MOVE_SELF = 0x0000_0800;

        /// Watch for all events
        ///
        /// This constant is simply a convenient combination of all the
        /// other event constants.
        const ALL_EVENTS = Self::ACCESS.bits() | Self::MODIFY.bits()
            | Self::ATTRIB.bits() | Self::CLOSE_WRITE.bits()
            | Self::CLOSE_NOWRITE.bits() | Self::OPEN.bits()
            | Self::MOVED_FROM.bits() | Self::MOVED_TO.bits()
            | Self::CREATE.bits() | Self::DELETE.bits()
            | Self::DELETE_SELF.bits() | Self::MOVE_SELF.bits();

        /// Watch for all move events
        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();

        /// Watch for all close events
        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
    }
}

impl WatchDescriptor {
    /// Getter method for a watch's id.
    ///
    /// Can be used to distinguish events for files with the same name.
    pub fn get_watch_descriptor_id(&self) -> c_int {
        self.id
    }
}

/// Represents a watch on a path
///
/// Can be obtained from [`Inotify::add_watch`], or from the `wd` field
/// of an [`Event`]. The id is the number that appears in the event
/// records the session emits.
///
/// [`Inotify::add_watch`]: crate::Inotify::add_watch
/// [`Event`]: crate::Event
#[derive(Clone, Debug)]
pub struct WatchDescriptor {
    pub(crate) id: c_int,
    pub(crate) fd: Weak<FdGuard>,
}

impl Eq for WatchDescriptor {}

impl PartialEq for WatchDescriptor {
    fn eq(&self, other: &Self) -> bool {
        let self_fd = self.fd.upgrade();
        let other_fd = other.fd.upgrade();

        self.id == other.id && self_fd.is_some() && self_fd == other_fd
    }
}

impl Ord for WatchDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for WatchDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for WatchDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // This function only takes `self.id` into account, as `self.fd`
        // is a weak pointer that might no longer be available. Since
        // neither panicking nor changing the hash depending on whether
        // it's available is acceptable, we just don't look at it at
        // all.
        self.id.hash(state);
    }
}
