//! The per-session worker: a background thread owning the kernel event
//! queue, the watch set, and the outbound event stream.
//!
//! The worker thread is the only mutator of its watch set. Controlling
//! threads never touch worker state; they place a command in the shared
//! slot, write one wakeup byte to the session descriptor, and block on
//! the command's reply channel until the worker has executed it. The
//! wakeup byte arrives through the same kqueue the vnode events do, so
//! the worker blocks in exactly one place.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::emit::EventQueue;
use crate::events::EventMask;
use crate::fd_guard::FdGuard;
use crate::sets::WatchSet;
use crate::snapshot::{self, DiffOp, DirSnapshot, Entry};
use crate::sys;
use crate::translate::{self, DEPS_EXCLUDED_FLAGS};
use crate::util;
use crate::watch::{Watch, WatchKind};
use crate::watches::WatchMask;

/// How many kernel events one wait can drain.
const EVENT_BATCH: usize = 32;

/// A request from the controlling thread, with the channel its result
/// travels back on.
///
/// The reply channels are rendezvous channels: the worker's send and
/// the caller's receive complete together, so both sides leave the
/// exchange at the same time.
pub(crate) enum Command {
    Add {
        path: PathBuf,
        mask: WatchMask,
        reply: SyncSender<io::Result<RawFd>>,
    },
    Remove {
        id: RawFd,
        reply: SyncSender<io::Result<()>>,
    },
}

/// The single shared slot between the controlling threads and the
/// worker.
///
/// `lock` serializes submitters, guaranteeing at most one command in
/// flight; `slot` carries it across the thread boundary.
pub(crate) struct CommandSlot {
    lock: Mutex<()>,
    slot: Mutex<Option<Command>>,
}

impl CommandSlot {
    fn new() -> CommandSlot {
        CommandSlot {
            lock: Mutex::new(()),
            slot: Mutex::new(None),
        }
    }

    /// Ask the worker to add or modify a watch, and wait for the id.
    pub(crate) fn submit_add(
        &self,
        session_fd: RawFd,
        path: PathBuf,
        mask: WatchMask,
    ) -> io::Result<RawFd> {
        let _serialized = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let (reply, result) = mpsc::sync_channel(0);
        self.place(session_fd, Command::Add { path, mask, reply })?;
        result.recv().unwrap_or_else(|_| Err(worker_gone()))
    }

    /// Ask the worker to remove a watch, and wait until it has.
    pub(crate) fn submit_remove(&self, session_fd: RawFd, id: RawFd) -> io::Result<()> {
        let _serialized = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let (reply, result) = mpsc::sync_channel(0);
        self.place(session_fd, Command::Remove { id, reply })?;
        result.recv().unwrap_or_else(|_| Err(worker_gone()))
    }

    fn place(&self, session_fd: RawFd, command: Command) -> io::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(command);

        // One byte on the socketpair interrupts the worker's kqueue
        // wait. If even that fails, withdraw the command so a later
        // submission doesn't execute it by surprise.
        if let Err(err) = util::safe_write(session_fd, b"*") {
            self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            return Err(err);
        }
        Ok(())
    }

    fn take(&self) -> Option<Command> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

fn worker_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "the worker thread is gone")
}

/// Create the session plumbing and start the worker thread.
///
/// Returns the consumer's end of the socketpair (the session
/// descriptor), the shared command slot, and the thread handle.
pub(crate) fn spawn() -> io::Result<(Arc<FdGuard>, Arc<CommandSlot>, JoinHandle<()>)> {
    let kq = sys::kqueue()?;

    let (session_fd, worker_fd) = match sys::socketpair_stream() {
        Ok(pair) => pair,
        Err(err) => {
            sys::close(kq);
            return Err(err);
        }
    };

    if let Err(err) = sys::register_read_lowat(kq, worker_fd) {
        sys::close(session_fd);
        sys::close(worker_fd);
        sys::close(kq);
        return Err(err);
    }

    // The session descriptor is non-blocking by default; the blocking
    // read path toggles the flag around its read.
    unsafe {
        libc::fcntl(
            session_fd,
            libc::F_SETFL,
            libc::fcntl(session_fd, libc::F_GETFL) | libc::O_NONBLOCK,
        );
    }

    let cmd = Arc::new(CommandSlot::new());
    let worker = Worker {
        kq,
        fd: worker_fd,
        sets: WatchSet::new(),
        queue: EventQueue::new(),
        cmd: Arc::clone(&cmd),
        cookie: 0,
    };

    let thread = thread::Builder::new()
        .name("inotify-kqueue worker".to_string())
        .spawn(move || worker.run());
    let thread = match thread {
        Ok(thread) => thread,
        Err(err) => {
            // The closure (and with it the worker's descriptors) has
            // already been dropped.
            sys::close(session_fd);
            return Err(err);
        }
    };

    Ok((Arc::new(FdGuard::new(session_fd)), cmd, thread))
}

struct Worker {
    kq: RawFd,
    /// The worker's end of the socketpair: commands wake it here, and
    /// event records leave through it.
    fd: RawFd,
    sets: WatchSet,
    queue: EventQueue,
    cmd: Arc<CommandSlot>,
    cookie: u32,
}

impl Worker {
    fn run(mut self) {
        let zeroed: libc::kevent = unsafe { mem::zeroed() };
        let mut events = [zeroed; EVENT_BATCH];

        'events: loop {
            let count = match sys::wait(self.kq, &mut events) {
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("kqueue wait failed: {}", err);
                    break;
                }
            };

            for event in events.iter().take(count) {
                if event.flags & libc::EV_ERROR != 0 {
                    log::warn!(
                        "kqueue error event on {}: {}",
                        event.ident,
                        io::Error::from_raw_os_error(event.data as i32)
                    );
                    continue;
                }
                if event.ident == self.fd as usize {
                    if !self.handle_control() {
                        break 'events;
                    }
                } else {
                    self.handle_vnode(event.ident as RawFd, event.fflags);
                }
            }

            if let Err(err) = self.queue.flush(self.fd) {
                log::error!("failed to emit events, shutting the session down: {}", err);
                break;
            }
        }
    }

    /// Drain a wakeup byte and execute the pending command.
    ///
    /// Returns false when the session descriptor reports end-of-file,
    /// which is the shutdown signal.
    fn handle_control(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match util::safe_read(self.fd, &mut byte) {
            Ok(0) => return false,
            Ok(_) => {}
            Err(err) => {
                log::error!("failed to read a control byte: {}", err);
                return false;
            }
        }

        match self.cmd.take() {
            Some(Command::Add { path, mask, reply }) => {
                let result = self.add_or_modify(&path, mask);
                let _ = reply.send(result);
            }
            Some(Command::Remove { id, reply }) => {
                let result = self.remove(id);
                let _ = reply.send(result);
            }
            None => {}
        }
        true
    }

    fn handle_vnode(&mut self, fd: RawFd, fflags: u32) {
        // A missing entry means the watch was removed between event
        // delivery and handling.
        let (kind, is_directory, is_really_dir, flags) = match self.sets.by_fd(fd) {
            Some(w) => (w.kind, w.is_directory, w.is_really_dir, w.flags),
            None => return,
        };

        match kind {
            WatchKind::User if is_directory => self.user_directory_event(fd, fflags, flags),
            WatchKind::User => self.user_file_event(fd, fflags, flags, is_really_dir),
            WatchKind::Dependency => self.dependency_event(fd, fflags, flags, is_really_dir),
        }
    }

    fn user_file_event(&mut self, fd: RawFd, fflags: u32, flags: WatchMask, is_really_dir: bool) {
        let mask = translate::to_inotify(fflags, flags, is_really_dir);
        if !mask.is_empty() {
            self.queue.enqueue(fd, mask, 0, None);
        }

        // The watch dies with its file: on deletion, or on a rename
        // that left the descriptor without a single remaining link. A
        // plain rename keeps following the inode, as inotify does.
        let gone = fflags & libc::NOTE_DELETE != 0
            || (fflags & libc::NOTE_RENAME != 0 && util::is_deleted(fd));
        if gone {
            self.remove_user_watch(fd);
        }
    }

    fn user_directory_event(&mut self, fd: RawFd, fflags: u32, flags: WatchMask) {
        if fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND) != 0 {
            self.reconcile(fd);
        }

        if fflags & libc::NOTE_ATTRIB != 0 && flags.contains(WatchMask::ATTRIB) {
            self.queue
                .enqueue(fd, EventMask::ATTRIB | EventMask::ISDIR, 0, None);
        }

        if fflags & (libc::NOTE_DELETE | libc::NOTE_RENAME) != 0 {
            let mut mask = EventMask::empty();
            if fflags & libc::NOTE_DELETE != 0 && flags.contains(WatchMask::DELETE_SELF) {
                mask |= EventMask::DELETE_SELF;
            }
            if fflags & libc::NOTE_RENAME != 0 && flags.contains(WatchMask::MOVE_SELF) {
                mask |= EventMask::MOVE_SELF;
            }
            if !mask.is_empty() {
                self.queue.enqueue(fd, mask, 0, None);
            }
            // A renamed directory invalidates every child path this
            // watch could reopen, so the watch ends either way.
            self.remove_user_watch(fd);
        }
    }

    fn dependency_event(&mut self, fd: RawFd, fflags: u32, flags: WatchMask, is_really_dir: bool) {
        let (parent, name) = match self.sets.by_fd(fd) {
            Some(w) => match w.parent {
                Some(parent) => (parent, w.filename.clone().into_os_string()),
                None => return,
            },
            None => return,
        };

        let mask = translate::to_inotify(fflags, flags, is_really_dir);
        if !mask.is_empty() {
            self.queue.enqueue(parent, mask, 0, Some(name.as_os_str()));
        }

        // Whether the child was deleted or moved away is decided by
        // re-listing the parent.
        if fflags & libc::NOTE_DELETE != 0 {
            self.reconcile(parent);
        }
    }

    /// Execute `ADD`: update an existing user watch for the path, or
    /// start a new one.
    fn add_or_modify(&mut self, path: &Path, mask: WatchMask) -> io::Result<RawFd> {
        if let Some(fd) = self.sets.user_by_path(path).map(|w| w.fd) {
            return self.update_flags(fd, mask);
        }

        let index = self.start_watching(path, None, mask, WatchKind::User, None)?;
        self.sets
            .get(index)
            .map(|w| w.fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "watch vanished during insert"))
    }

    /// Execute `REMOVE`: drop the user watch with this id, if any.
    ///
    /// Removal of an unknown id is a tolerated no-op; the Linux
    /// interface allows the caller to race against self-removal.
    fn remove(&mut self, id: RawFd) -> io::Result<()> {
        let known = self
            .sets
            .by_fd(id)
            .map_or(false, |w| w.kind == WatchKind::User);
        if known {
            self.remove_user_watch(id);
            self.queue.flush(self.fd)?;
        }
        Ok(())
    }

    /// Open a path, register it with the kernel queue, and insert the
    /// watch. User watches on directories get a dependency watch per
    /// current entry.
    fn start_watching(
        &mut self,
        path: &Path,
        entry_name: Option<PathBuf>,
        mask: WatchMask,
        kind: WatchKind,
        parent: Option<RawFd>,
    ) -> io::Result<usize> {
        let mut watch = Watch::init(kind, self.kq, path, entry_name, mask)?;
        watch.parent = parent;

        let fd = watch.fd;
        let is_directory = watch.is_directory;
        let index = self.sets.insert(watch);

        if is_directory {
            self.add_dependencies(fd);
        }
        Ok(index)
    }

    /// Attach a dependency watch for every current entry of a user
    /// directory watch, and capture the first snapshot.
    fn add_dependencies(&mut self, parent: RawFd) {
        let (path, flags) = match self.sets.by_fd(parent) {
            Some(w) => (w.filename.clone(), w.flags),
            None => return,
        };

        let listing = match DirSnapshot::scan(&path) {
            Ok(listing) => listing,
            Err(err) => {
                log::warn!("failed to list {:?}: {}", path, err);
                DirSnapshot::default()
            }
        };

        for entry in &listing.entries {
            let child = path.join(&entry.name);
            if let Err(err) = self.start_watching(
                &child,
                Some(PathBuf::from(&entry.name)),
                flags,
                WatchKind::Dependency,
                Some(parent),
            ) {
                log::warn!("failed to watch dependency {:?} of {:?}: {}", child, path, err);
            }
        }

        if let Some(w) = self.sets.by_fd_mut(parent) {
            w.deps = Some(listing);
        }
    }

    /// Execute a mask update on an existing user watch, propagating the
    /// change to every dependency watch it owns.
    fn update_flags(&mut self, fd: RawFd, flags: WatchMask) -> io::Result<RawFd> {
        let (is_really_dir, is_directory) = match self.sets.by_fd_mut(fd) {
            Some(w) => {
                w.flags = flags;
                (w.is_really_dir, w.is_directory)
            }
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "no such watch")),
        };

        sys::register_vnode(self.kq, fd, translate::to_kqueue(flags, is_really_dir, false))?;

        if is_directory {
            let dep_flags = flags.difference(DEPS_EXCLUDED_FLAGS);
            let kq = self.kq;
            for index in self.sets.dependencies_of(fd) {
                let child = match self.sets.get_mut(index) {
                    Some(w) => {
                        w.flags = dep_flags;
                        (w.fd, w.is_really_dir)
                    }
                    None => continue,
                };
                if child.0 == -1 {
                    continue;
                }
                let fflags = translate::to_kqueue(dep_flags, child.1, true);
                if let Err(err) = sys::register_vnode(kq, child.0, fflags) {
                    log::warn!("failed to update a dependency watch: {}", err);
                }
            }
        }
        Ok(fd)
    }

    /// Drop a user watch and all its dependencies, and queue the final
    /// `IGNORED` record. No event with this id follows it.
    fn remove_user_watch(&mut self, fd: RawFd) {
        for index in self.sets.dependencies_of(fd) {
            self.sets.delete(index);
        }
        if let Some(index) = self.sets.index_by_fd(fd) {
            self.sets.delete(index);
        }
        self.queue.enqueue(fd, EventMask::IGNORED, 0, None);
    }

    /// Re-list a watched directory and synthesize the events its change
    /// implies.
    fn reconcile(&mut self, parent: RawFd) {
        // Dependencies that lost their descriptor on a failed reopen
        // are dead weight; this is the pass that collects them.
        for index in self.sets.dependencies_of(parent) {
            let dead = self.sets.get(index).map_or(false, |w| w.fd == -1);
            if dead {
                self.sets.delete(index);
            }
        }

        let (path, flags, old) = match self.sets.by_fd_mut(parent) {
            Some(w) => (w.filename.clone(), w.flags, w.deps.take().unwrap_or_default()),
            None => return,
        };

        // A listing failure means the directory itself is going away;
        // diffing against an empty listing reports every entry deleted,
        // and the directory's own NOTE_DELETE does the rest.
        let new = match DirSnapshot::scan(&path) {
            Ok(listing) => listing,
            Err(err) => {
                log::debug!("failed to list {:?}: {}", path, err);
                DirSnapshot::default()
            }
        };

        for op in snapshot::diff(&old, &new) {
            match op {
                DiffOp::Renamed { from, to } => {
                    self.child_renamed(parent, &path, flags, &old.entries[from], &new.entries[to]);
                }
                DiffOp::Replaced { to, .. } => {
                    self.child_replaced(parent, &path, flags, &new.entries[to]);
                }
                DiffOp::Removed { from } => {
                    self.child_removed(parent, flags, &old.entries[from]);
                }
                DiffOp::Added { to } => {
                    self.child_added(parent, &path, flags, &new.entries[to]);
                }
            }
        }

        if let Some(w) = self.sets.by_fd_mut(parent) {
            w.deps = Some(new);
        }
        self.update_paths(parent);
    }

    /// A rename within the directory: emit the paired move events and
    /// redirect the dependency watch to the new name.
    fn child_renamed(
        &mut self,
        parent: RawFd,
        parent_path: &Path,
        flags: WatchMask,
        old_entry: &Entry,
        new_entry: &Entry,
    ) {
        let cookie = self.next_cookie();

        let dep = self
            .sets
            .dependency_by_inode(parent, old_entry.inode, &old_entry.name);
        let isdir = match dep.and_then(|i| self.sets.get(i)) {
            Some(w) if w.is_really_dir => EventMask::ISDIR,
            _ => EventMask::empty(),
        };

        if flags.contains(WatchMask::MOVED_FROM) {
            self.queue.enqueue(
                parent,
                EventMask::MOVED_FROM | isdir,
                cookie,
                Some(old_entry.name.as_os_str()),
            );
        }
        if flags.contains(WatchMask::MOVED_TO) {
            self.queue.enqueue(
                parent,
                EventMask::MOVED_TO | isdir,
                cookie,
                Some(new_entry.name.as_os_str()),
            );
        }

        if let Some(index) = dep {
            let kq = self.kq;
            if let Some(w) = self.sets.get_mut(index) {
                w.filename = PathBuf::from(&new_entry.name);
                if !util::is_opened(w.fd) {
                    w.fd = -1;
                    if let Err(err) = w.reopen(kq, parent_path) {
                        log::warn!(
                            "failed to reopen {:?} under {:?}: {}",
                            w.filename,
                            parent_path,
                            err
                        );
                    }
                }
            }
        }
    }

    /// The entry's name survived but its file did not: something was
    /// renamed over it, or it was unlinked and recreated. The
    /// dependency watch still points at the old vnode and is reopened
    /// under the surviving name.
    fn child_replaced(&mut self, parent: RawFd, parent_path: &Path, flags: WatchMask, entry: &Entry) {
        let kq = self.kq;
        match self.sets.dependency_by_name(parent, &entry.name) {
            Some(index) => {
                if let Some(w) = self.sets.get_mut(index) {
                    if let Err(err) = w.reopen(kq, parent_path) {
                        log::warn!(
                            "failed to reopen replaced entry {:?} under {:?}: {}",
                            w.filename,
                            parent_path,
                            err
                        );
                    }
                }
            }
            // The old file was never tracked (its watch failed or was
            // swept); start fresh.
            None => {
                let child = parent_path.join(&entry.name);
                if let Err(err) = self.start_watching(
                    &child,
                    Some(PathBuf::from(&entry.name)),
                    flags,
                    WatchKind::Dependency,
                    Some(parent),
                ) {
                    log::warn!("failed to watch replaced entry {:?}: {}", child, err);
                }
            }
        }
    }

    /// An entry vanished: emit `DELETE` and drop its dependency watch.
    fn child_removed(&mut self, parent: RawFd, flags: WatchMask, entry: &Entry) {
        let dep = self.sets.dependency_by_name(parent, &entry.name);

        if flags.contains(WatchMask::DELETE) {
            let mask = match dep.and_then(|i| self.sets.get(i)) {
                Some(w) if w.is_really_dir => EventMask::DELETE | EventMask::ISDIR,
                _ => EventMask::DELETE,
            };
            self.queue.enqueue(parent, mask, 0, Some(entry.name.as_os_str()));
        }

        if let Some(index) = dep {
            self.sets.delete(index);
        }
    }

    /// A new entry appeared: start tracking it and emit `CREATE`.
    ///
    /// A failed dependency watch still yields the `CREATE` event;
    /// changes inside that child just won't be observed until the
    /// parent is re-added.
    fn child_added(&mut self, parent: RawFd, parent_path: &Path, flags: WatchMask, entry: &Entry) {
        let child = parent_path.join(&entry.name);
        let isdir = match self.start_watching(
            &child,
            Some(PathBuf::from(&entry.name)),
            flags,
            WatchKind::Dependency,
            Some(parent),
        ) {
            Ok(index) => self.sets.get(index).map_or(false, |w| w.is_really_dir),
            Err(err) => {
                log::warn!("failed to watch new entry {:?}: {}", child, err);
                std::fs::symlink_metadata(&child)
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
            }
        };

        if flags.contains(WatchMask::CREATE) {
            let mask = if isdir {
                EventMask::CREATE | EventMask::ISDIR
            } else {
                EventMask::CREATE
            };
            self.queue.enqueue(parent, mask, 0, Some(entry.name.as_os_str()));
        }
    }

    /// Refresh dependency watch names from the parent's snapshot.
    ///
    /// Each snapshot entry is consumed at most once, so hardlinked
    /// children each keep a name of their own.
    fn update_paths(&mut self, parent: RawFd) {
        let entries: Vec<Entry> = match self.sets.by_fd(parent).and_then(|w| w.deps.as_ref()) {
            Some(deps) => deps.entries.clone(),
            None => return,
        };
        let mut used = vec![false; entries.len()];

        for w in self.sets.iter_mut() {
            if w.parent != Some(parent) || w.kind != WatchKind::Dependency {
                continue;
            }
            let slot = entries
                .iter()
                .enumerate()
                .position(|(j, e)| !used[j] && e.inode == w.inode);
            if let Some(j) = slot {
                used[j] = true;
                if w.filename != entries[j].name {
                    w.filename = PathBuf::from(&entries[j].name);
                }
            }
        }
    }

    /// Next rename cookie; never zero.
    fn next_cookie(&mut self) -> u32 {
        self.cookie = self.cookie.wrapping_add(1);
        if self.cookie == 0 {
            self.cookie = 1;
        }
        self.cookie
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        sys::close(self.fd);
        sys::close(self.kq);
    }
}
