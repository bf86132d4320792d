//! Translation between the Linux-style event masks and the kqueue
//! vnode filter flags.
//!
//! The two directions are deliberately asymmetric: a watch is
//! registered for the superset of filters its mask could ever need
//! ([`to_kqueue`]), while the events reported back are gated by what
//! the caller actually requested ([`to_inotify`]), so an un-requested
//! bit is never emitted.

use crate::events::EventMask;
use crate::watches::WatchMask;

/// Bits that make no sense on a dependency watch.
///
/// A child's rename or disappearance is reported against its parent
/// directory, never against the child itself, so these are stripped
/// from the mask before a dependency watch is registered.
pub(crate) const DEPS_EXCLUDED_FLAGS: WatchMask = WatchMask::MOVED_FROM
    .union(WatchMask::MOVED_TO)
    .union(WatchMask::MOVE_SELF)
    .union(WatchMask::DELETE_SELF);

/// The mask bits that require watching a directory's contents.
const DIRECTORY_CHANGES: WatchMask = WatchMask::CREATE
    .union(WatchMask::DELETE)
    .union(WatchMask::MOVED_FROM)
    .union(WatchMask::MOVED_TO)
    .union(WatchMask::CLOSE_WRITE);

/// Select the vnode filter flags to register for a watch.
///
/// `is_subwatch` is true for dependency watches; they always listen for
/// `NOTE_DELETE` so the parent learns of child loss even when the
/// caller never asked for `DELETE_SELF`.
pub(crate) fn to_kqueue(mask: WatchMask, is_dir: bool, is_subwatch: bool) -> u32 {
    let mut fflags = 0;

    if mask.contains(WatchMask::ATTRIB) {
        fflags |= libc::NOTE_ATTRIB;
    }

    if mask.intersects(DIRECTORY_CHANGES) || (!is_dir && mask.contains(WatchMask::MODIFY)) {
        fflags |= libc::NOTE_WRITE;
        if is_dir {
            fflags |= libc::NOTE_EXTEND;
        }
    }

    if mask.contains(WatchMask::DELETE_SELF) || is_subwatch {
        fflags |= libc::NOTE_DELETE;
    }

    if mask.contains(WatchMask::MOVE_SELF) {
        fflags |= libc::NOTE_RENAME;
    }

    fflags
}

/// Map the filter flags of one vnode event back to an event mask.
///
/// `requested` is the mask stored on the watch the event fired on (for
/// dependency watches: the parent's mask with the excluded bits already
/// stripped). `ISDIR` accompanies attribute events on directories.
pub(crate) fn to_inotify(fflags: u32, requested: WatchMask, is_really_dir: bool) -> EventMask {
    let mut mask = EventMask::empty();

    if fflags & libc::NOTE_ATTRIB != 0 && requested.contains(WatchMask::ATTRIB) {
        mask |= EventMask::ATTRIB;
        if is_really_dir {
            mask |= EventMask::ISDIR;
        }
    }

    if fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND) != 0
        && !is_really_dir
        && requested.contains(WatchMask::MODIFY)
    {
        mask |= EventMask::MODIFY;
    }

    if fflags & libc::NOTE_DELETE != 0 && requested.contains(WatchMask::DELETE_SELF) {
        mask |= EventMask::DELETE_SELF;
    }

    if fflags & libc::NOTE_RENAME != 0 && requested.contains(WatchMask::MOVE_SELF) {
        mask |= EventMask::MOVE_SELF;
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrib_maps_to_note_attrib() {
        let fflags = to_kqueue(WatchMask::ATTRIB, false, false);
        assert_eq!(fflags, libc::NOTE_ATTRIB);
    }

    #[test]
    fn directory_content_interest_enables_write_and_extend() {
        for bit in [
            WatchMask::CREATE,
            WatchMask::DELETE,
            WatchMask::MOVED_FROM,
            WatchMask::MOVED_TO,
            WatchMask::CLOSE_WRITE,
        ] {
            let fflags = to_kqueue(bit, true, false);
            assert_eq!(fflags & libc::NOTE_WRITE, libc::NOTE_WRITE);
            assert_eq!(fflags & libc::NOTE_EXTEND, libc::NOTE_EXTEND);
        }
    }

    #[test]
    fn modify_enables_write_only_for_files() {
        let file = to_kqueue(WatchMask::MODIFY, false, false);
        assert_eq!(file & libc::NOTE_WRITE, libc::NOTE_WRITE);
        assert_eq!(file & libc::NOTE_EXTEND, 0);

        let dir = to_kqueue(WatchMask::MODIFY, true, false);
        assert_eq!(dir & libc::NOTE_WRITE, 0);
    }

    #[test]
    fn subwatches_always_listen_for_delete() {
        let fflags = to_kqueue(WatchMask::MODIFY, false, true);
        assert_eq!(fflags & libc::NOTE_DELETE, libc::NOTE_DELETE);

        let plain = to_kqueue(WatchMask::MODIFY, false, false);
        assert_eq!(plain & libc::NOTE_DELETE, 0);
    }

    #[test]
    fn move_self_maps_to_note_rename() {
        let fflags = to_kqueue(WatchMask::MOVE_SELF, false, false);
        assert_eq!(fflags, libc::NOTE_RENAME);
    }

    #[test]
    fn unrequested_bits_are_never_reported() {
        let mask = to_inotify(
            libc::NOTE_ATTRIB | libc::NOTE_WRITE | libc::NOTE_DELETE | libc::NOTE_RENAME,
            WatchMask::MODIFY,
            false,
        );
        assert_eq!(mask, EventMask::MODIFY);
    }

    #[test]
    fn write_on_a_directory_is_not_a_modification() {
        let mask = to_inotify(libc::NOTE_WRITE, WatchMask::MODIFY, true);
        assert!(mask.is_empty());
    }

    #[test]
    fn attrib_on_a_directory_carries_isdir() {
        let mask = to_inotify(libc::NOTE_ATTRIB, WatchMask::ATTRIB, true);
        assert_eq!(mask, EventMask::ATTRIB | EventMask::ISDIR);

        let mask = to_inotify(libc::NOTE_ATTRIB, WatchMask::ATTRIB, false);
        assert_eq!(mask, EventMask::ATTRIB);
    }

    #[test]
    fn self_events_survive_the_gate_when_requested() {
        let mask = to_inotify(
            libc::NOTE_DELETE | libc::NOTE_RENAME,
            WatchMask::DELETE_SELF | WatchMask::MOVE_SELF,
            false,
        );
        assert_eq!(mask, EventMask::DELETE_SELF | EventMask::MOVE_SELF);
    }

    #[test]
    fn excluded_flags_cover_the_self_and_move_bits() {
        assert!(DEPS_EXCLUDED_FLAGS.contains(WatchMask::MOVED_FROM));
        assert!(DEPS_EXCLUDED_FLAGS.contains(WatchMask::MOVED_TO));
        assert!(DEPS_EXCLUDED_FLAGS.contains(WatchMask::MOVE_SELF));
        assert!(DEPS_EXCLUDED_FLAGS.contains(WatchMask::DELETE_SELF));
        assert!(!DEPS_EXCLUDED_FLAGS.contains(WatchMask::MODIFY));
    }
}
