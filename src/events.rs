use std::{
    ffi::{OsStr, OsString},
    mem,
    os::unix::ffi::OsStrExt,
    sync::Weak,
};

use bitflags::bitflags;

use crate::fd_guard::FdGuard;
use crate::watches::WatchDescriptor;

/// Fixed-size header of one event record on the wire.
///
/// Matches the layout of Linux's `struct inotify_event`: the header is
/// followed by `len` bytes of NUL-terminated name, or by nothing when
/// `len` is zero.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct RawEvent {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    pub len: u32,
}

/// Iterator over the events in one read from the session descriptor
///
/// Allows for iteration over the events returned by
/// [`Inotify::read_events_blocking`] or [`Inotify::read_events`].
///
/// [`Inotify::read_events_blocking`]: crate::Inotify::read_events_blocking
/// [`Inotify::read_events`]: crate::Inotify::read_events
#[derive(Debug)]
pub struct Events<'a> {
    fd: Weak<FdGuard>,
    buffer: &'a [u8],
    num_bytes: usize,
    pos: usize,
}

impl<'a> Events<'a> {
    pub(crate) fn new(fd: Weak<FdGuard>, buffer: &'a [u8], num_bytes: usize) -> Self {
        Events {
            fd,
            buffer,
            num_bytes,
            pos: 0,
        }
    }
}

impl<'a> Iterator for Events<'a> {
    type Item = Event<&'a OsStr>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos < self.num_bytes {
            let (step, event) = Event::from_buffer(self.fd.clone(), &self.buffer[self.pos..]);
            self.pos += step;

            Some(event)
        } else {
            None
        }
    }
}

/// A file system event
///
/// Describes a change that the consumer previously registered interest
/// in. To watch for events, call [`Inotify::add_watch`]. To retrieve
/// events, call [`Inotify::read_events_blocking`] or
/// [`Inotify::read_events`].
///
/// [`Inotify::add_watch`]: crate::Inotify::add_watch
/// [`Inotify::read_events_blocking`]: crate::Inotify::read_events_blocking
/// [`Inotify::read_events`]: crate::Inotify::read_events
#[derive(Clone, Debug)]
pub struct Event<S> {
    /// Identifies the watch this event originates from
    ///
    /// This [`WatchDescriptor`] is equal to the one that
    /// [`Inotify::add_watch`] returned when interest for this event was
    /// registered. Events for children of a watched directory carry the
    /// descriptor of the directory watch.
    ///
    /// [`Inotify::add_watch`]: crate::Inotify::add_watch
    pub wd: WatchDescriptor,

    /// Indicates what kind of event this is
    pub mask: EventMask,

    /// Connects related events to each other
    ///
    /// When a file is renamed, this results in two events:
    /// [`MOVED_FROM`] and [`MOVED_TO`]. The `cookie` field will be the
    /// same for both of them, thereby making it possible to connect the
    /// event pair. For all other events `cookie` is zero.
    ///
    /// [`MOVED_FROM`]: EventMask::MOVED_FROM
    /// [`MOVED_TO`]: EventMask::MOVED_TO
    pub cookie: u32,

    /// The name of the file the event originates from
    ///
    /// This field is set only if the subject of the event is an entry
    /// in a watched directory. If the event concerns the watched file
    /// or directory itself, `name` is `None`.
    pub name: Option<S>,
}

impl<'a> Event<&'a OsStr> {
    fn new(fd: Weak<FdGuard>, event: &RawEvent, name: &'a OsStr) -> Self {
        let mask = EventMask::from_bits_retain(event.mask);

        let wd = WatchDescriptor { id: event.wd, fd };

        let name = if name.is_empty() { None } else { Some(name) };

        Event {
            wd,
            mask,
            cookie: event.cookie,
            name,
        }
    }

    /// Create an `Event` from a buffer
    ///
    /// Assumes that a full event record, including its name, is located
    /// at the beginning of `buffer`.
    ///
    /// Returns the number of bytes used from the buffer, and the event.
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not contain a full record, including
    /// its name.
    pub(crate) fn from_buffer(fd: Weak<FdGuard>, buffer: &'a [u8]) -> (usize, Self) {
        let event_size = mem::size_of::<RawEvent>();

        // Make sure that the buffer is big enough to contain an event
        // header. Otherwise we can't safely convert it to a `RawEvent`.
        assert!(buffer.len() >= event_size);

        let raw_ptr = buffer.as_ptr() as *const RawEvent;

        // The byte buffer has alignment 1 while `RawEvent` has a higher
        // alignment, so the pointer must be read unaligned.
        let raw = unsafe { raw_ptr.read_unaligned() };

        // The name's length is given by `raw.len`. There should always
        // be enough bytes left in the buffer to fit the name.
        let bytes_left_in_buffer = buffer.len() - event_size;
        assert!(bytes_left_in_buffer >= raw.len as usize);

        let bytes_consumed = event_size + raw.len as usize;
        let name = &buffer[event_size..bytes_consumed];

        // Remove the trailing NUL byte(s) from the name. The `unwrap`
        // here is safe, because `splitn` always returns at least one
        // result, even if the original slice contains no NUL.
        let name = name.splitn(2, |b| b == &0u8).next().unwrap();

        let event = Event::new(fd, &raw, OsStr::from_bytes(name));

        (bytes_consumed, event)
    }

    /// Returns an owned copy of the event.
    #[must_use = "cloning is often expensive and is not expected to have side effects"]
    pub fn to_owned(&self) -> EventOwned {
        Event {
            wd: self.wd.clone(),
            mask: self.mask,
            cookie: self.cookie,
            name: self.name.map(OsStr::to_os_string),
        }
    }
}

/// An owned version of `Event`
pub type EventOwned = Event<OsString>;

bitflags! {
    /// Indicates the type of an event
    ///
    /// This struct can be retrieved from an [`Event`] via its `mask`
    /// field. You can determine the [`Event`]'s type by comparing the
    /// `EventMask` to its associated constants.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct EventMask: u32 {
        /// File was accessed (never generated by this implementation)
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

        /// File opened for writing was closed (never generated by this
        /// implementation)
        const CLOSE_WRITE = 0x0000_0008;

        /// Non-writable file was closed (never generated by this
        /// implementation)
        const CLOSE_NOWRITE = 0x0000_0010;

        /// File or directory was opened (never generated by this
        /// implementation)
        const OPEN = 0x0000_0020;

        /// File was renamed away; watched directory contained old name
        const MOVED_FROM = 0x0000_0040;

        /// File was renamed in; watched directory contains new name
        const MOVED_TO = 0x0000_0080;

        /// File/directory created in watched directory
        const CREATE = 0x0000_0100;

        /// File/directory deleted from watched directory
        const DELETE = 0x0000_0200;

        /// Watched file/directory was deleted
        const DELETE_SELF = 0x0000_0400;

        /// Watched file/directory was moved
        const MOVE_SELF = 0x0000_0800;

        /// File system containing the watched object was unmounted
        ///
        /// Present for wire compatibility; not generated by this
        /// implementation.
        const UNMOUNT = 0x0000_2000;

        /// Event queue overflowed
        ///
        /// Present for wire compatibility; not generated by this
        /// implementation.
        const Q_OVERFLOW = 0x0000_4000;

        /// Watch was removed
        ///
        /// This event will be generated if the watch was removed
        /// explicitly (via [`Inotify::rm_watch`]), or automatically
        /// (because the watched path was deleted or moved away).
        ///
        /// [`Inotify::rm_watch`]: crate::Inotify::rm_watch
        const IGNORED = 0x0000_8000;

        /// Event related to a directory
        ///
        /// The subject of the event is a directory.
        const ISDIR = 0x4000_0000;
    }
}

#[cfg(test)]
mod tests {
    use std::{io::prelude::*, mem, slice, sync};

    use super::{Event, RawEvent};

    #[test]
    fn from_buffer_should_not_mistake_next_event_for_name_of_previous_event() {
        let mut buffer = [0u8; 1024];

        // First, put a normal event into the buffer
        let event = RawEvent {
            wd: 0,
            mask: 0,
            cookie: 0,
            len: 0, // no name following after event
        };
        let event = unsafe {
            slice::from_raw_parts(&event as *const _ as *const u8, mem::size_of_val(&event))
        };
        (&mut buffer[..])
            .write_all(event)
            .expect("Failed to write into buffer");

        // After that event, simulate an event that starts with a
        // non-zero byte.
        buffer[mem::size_of_val(event)] = 1;

        // Now create the event and verify that the name is actually
        // `None`, as dictated by the value `len` above.
        let (_, event) = Event::from_buffer(sync::Weak::new(), &buffer);
        assert_eq!(event.name, None);
    }

    #[test]
    fn from_buffer_should_strip_trailing_nul_bytes_from_name() {
        let mut buffer = [0u8; 1024];

        let header = RawEvent {
            wd: 3,
            mask: 0x100,
            cookie: 0,
            len: 8, // "name\0" padded to eight bytes
        };
        let header = unsafe {
            slice::from_raw_parts(&header as *const _ as *const u8, mem::size_of_val(&header))
        };
        (&mut buffer[..])
            .write_all(header)
            .expect("Failed to write into buffer");
        buffer[header.len()..header.len() + 4].copy_from_slice(b"name");

        let (step, event) = Event::from_buffer(sync::Weak::new(), &buffer);
        assert_eq!(step, header.len() + 8);
        assert_eq!(event.name.map(|n| n.to_os_string()),
            Some(std::ffi::OsString::from("name")));
        assert_eq!(event.wd.get_watch_descriptor_id(), 3);
    }
}
