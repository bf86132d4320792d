//! The dense collection of watches owned by one worker.

use std::ffi::OsStr;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::watch::{Watch, WatchKind};

/// All watches of one worker, indexable `0..len`.
///
/// Deletion swaps the last element into the gap, so indices are only
/// valid until the next mutation; watches are addressed by their
/// descriptor (the caller-visible watch id) across mutations.
#[derive(Debug, Default)]
pub(crate) struct WatchSet {
    watches: Vec<Watch>,
}

impl WatchSet {
    pub(crate) fn new() -> WatchSet {
        WatchSet::default()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Watch> {
        self.watches.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Watch> {
        self.watches.get_mut(index)
    }

    /// Append a watch and return its index.
    pub(crate) fn insert(&mut self, watch: Watch) -> usize {
        self.watches.push(watch);
        self.watches.len() - 1
    }

    /// Drop the watch at `index`, closing its descriptor.
    ///
    /// The tail element takes its slot.
    pub(crate) fn delete(&mut self, index: usize) -> Watch {
        self.watches.swap_remove(index)
    }

    pub(crate) fn index_by_fd(&self, fd: RawFd) -> Option<usize> {
        self.watches.iter().position(|w| w.fd == fd)
    }

    pub(crate) fn by_fd(&self, fd: RawFd) -> Option<&Watch> {
        self.watches.iter().find(|w| w.fd == fd)
    }

    pub(crate) fn by_fd_mut(&mut self, fd: RawFd) -> Option<&mut Watch> {
        self.watches.iter_mut().find(|w| w.fd == fd)
    }

    /// Look up a user watch by the path the caller supplied.
    pub(crate) fn user_by_path(&self, path: &Path) -> Option<&Watch> {
        self.watches
            .iter()
            .find(|w| w.kind == WatchKind::User && w.filename == path)
    }

    /// Indices of every dependency of the given user watch, descending.
    ///
    /// Descending order keeps the indices valid while the caller
    /// deletes them one by one.
    pub(crate) fn dependencies_of(&self, parent: RawFd) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .watches
            .iter()
            .enumerate()
            .filter(|(_, w)| w.parent == Some(parent))
            .map(|(i, _)| i)
            .collect();
        indices.reverse();
        indices
    }

    /// Find a dependency of `parent` by its entry name.
    pub(crate) fn dependency_by_name(&self, parent: RawFd, name: &OsStr) -> Option<usize> {
        self.watches.iter().position(|w| {
            w.parent == Some(parent) && w.kind == WatchKind::Dependency && w.filename == name
        })
    }

    /// Find a dependency of `parent` by inode, preferring a name match.
    ///
    /// The name preference matters for hardlinked children, where one
    /// inode can back several dependency watches.
    pub(crate) fn dependency_by_inode(
        &self,
        parent: RawFd,
        inode: u64,
        prefer_name: &OsStr,
    ) -> Option<usize> {
        let candidate = |w: &Watch| {
            w.parent == Some(parent) && w.kind == WatchKind::Dependency && w.inode == inode
        };
        self.watches
            .iter()
            .position(|w| candidate(w) && w.filename == prefer_name)
            .or_else(|| self.watches.iter().position(|w| candidate(w)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Watch> {
        self.watches.iter_mut()
    }
}
