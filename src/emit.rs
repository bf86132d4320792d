//! Packing synthesized events into wire records and flushing them to
//! the session descriptor.

use std::ffi::OsStr;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::slice;

use crate::events::{EventMask, RawEvent};
use crate::util;

/// The outbound vector of packed event records.
///
/// Records accumulate over one wake cycle of the worker and leave in a
/// single scatter-write, so the consumer observes the cycle's events
/// atomically.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    records: Vec<Vec<u8>>,
}

impl EventQueue {
    pub(crate) fn new() -> EventQueue {
        EventQueue::default()
    }

    /// Append one event record.
    ///
    /// An empty `name` produces `len == 0` and no name buffer; a
    /// present name is stored NUL-terminated, with the terminator
    /// counted in `len`.
    pub(crate) fn enqueue(
        &mut self,
        wd: RawFd,
        mask: EventMask,
        cookie: u32,
        name: Option<&OsStr>,
    ) {
        let name = name.map(OsStr::as_bytes);
        let name_len = name.map_or(0, |n| n.len() + 1);

        let header = RawEvent {
            wd,
            mask: mask.bits(),
            cookie,
            len: name_len as u32,
        };

        let mut record = Vec::with_capacity(mem::size_of::<RawEvent>() + name_len);
        record.extend_from_slice(unsafe {
            slice::from_raw_parts(
                &header as *const RawEvent as *const u8,
                mem::size_of::<RawEvent>(),
            )
        });
        if let Some(name) = name {
            record.extend_from_slice(name);
            record.push(0);
        }

        self.records.push(record);
    }

    /// Write all pending records to `fd` in one scatter-write.
    ///
    /// The queue is cleared only on success; a failed flush leaves the
    /// records in place so the caller can decide whether the session is
    /// broken.
    pub(crate) fn flush(&mut self, fd: RawFd) -> io::Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        util::safe_writev(fd, &self.records)?;
        self.records.clear();
        Ok(())
    }
}
