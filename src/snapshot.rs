//! Owned snapshots of a directory's contents and the diff that turns
//! two snapshots into a stream of create/delete/rename operations.
//!
//! A snapshot is rebuilt from scratch on every reconciliation; entry
//! names are owned by the snapshot, while the names stored on the
//! dependency watches are owned by the watches themselves.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::DirEntryExt;
use std::path::Path;

/// One directory entry, captured at scan time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub name: OsString,
    pub inode: u64,
}

/// An ordered listing of a directory's entries.
#[derive(Clone, Debug, Default)]
pub(crate) struct DirSnapshot {
    pub entries: Vec<Entry>,
}

impl DirSnapshot {
    /// List `path`, in directory-iteration order.
    ///
    /// `.` and `..` are not included. Entries that vanish between the
    /// `readdir` and the inode lookup are skipped.
    pub(crate) fn scan(path: &Path) -> io::Result<DirSnapshot> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            entries.push(Entry {
                inode: entry.ino(),
                name: entry.file_name(),
            });
        }
        Ok(DirSnapshot { entries })
    }

    fn position_by_name(&self, name: &OsString) -> Option<usize> {
        self.entries.iter().position(|e| &e.name == name)
    }
}

/// One step of a snapshot diff.
///
/// Indices refer into the snapshots the diff was computed from:
/// `from` into the old one, `to` into the new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DiffOp {
    /// The entry kept its inode but changed names.
    Renamed { from: usize, to: usize },
    /// The entry kept its name but points at a different file now (a
    /// rename over it, or an unlink and recreate).
    Replaced { from: usize, to: usize },
    /// The entry is gone (deleted, or moved out of the directory).
    Removed { from: usize },
    /// The entry is new (created, or moved into the directory).
    Added { to: usize },
}

/// Diff two snapshots of the same directory.
///
/// Entries are first matched by name; a surviving name is never part of
/// a rename, but a name whose inode changed is reported as a
/// replacement so the watch layer can refresh its descriptor. The
/// remaining entries are paired by inode, which detects renames within
/// the directory. An inode pairing is only trusted when it is
/// unambiguous (exactly one unmatched old entry and one unmatched new
/// entry carry the inode); hardlink collisions degrade to a remove/add
/// pair instead of a guessed rename.
///
/// Replacements, removals and renames are reported in old-listing
/// order, additions in new-listing order after them.
pub(crate) fn diff(old: &DirSnapshot, new: &DirSnapshot) -> Vec<DiffOp> {
    let mut new_matched = vec![false; new.entries.len()];

    let name_match: Vec<Option<usize>> = old
        .entries
        .iter()
        .map(|entry| {
            let j = new.position_by_name(&entry.name);
            if let Some(j) = j {
                new_matched[j] = true;
            }
            j
        })
        .collect();

    let mut old_by_inode: HashMap<u64, usize> = HashMap::new();
    let mut new_by_inode: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, entry) in old.entries.iter().enumerate() {
        if name_match[i].is_none() {
            *old_by_inode.entry(entry.inode).or_insert(0) += 1;
        }
    }
    for (j, entry) in new.entries.iter().enumerate() {
        if !new_matched[j] {
            new_by_inode.entry(entry.inode).or_default().push(j);
        }
    }

    let mut ops = Vec::new();

    for (i, entry) in old.entries.iter().enumerate() {
        if let Some(j) = name_match[i] {
            if new.entries[j].inode != entry.inode {
                ops.push(DiffOp::Replaced { from: i, to: j });
            }
            continue;
        }
        let candidates = new_by_inode.get(&entry.inode);
        let unambiguous = old_by_inode.get(&entry.inode) == Some(&1)
            && candidates.map_or(false, |c| c.len() == 1);
        match candidates {
            Some(c) if unambiguous && !new_matched[c[0]] => {
                new_matched[c[0]] = true;
                ops.push(DiffOp::Renamed { from: i, to: c[0] });
            }
            _ => ops.push(DiffOp::Removed { from: i }),
        }
    }

    for (j, _) in new.entries.iter().enumerate() {
        if !new_matched[j] {
            ops.push(DiffOp::Added { to: j });
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, u64)]) -> DirSnapshot {
        DirSnapshot {
            entries: entries
                .iter()
                .map(|(name, inode)| Entry {
                    name: OsString::from(name),
                    inode: *inode,
                })
                .collect(),
        }
    }

    #[test]
    fn identical_snapshots_produce_no_ops() {
        let old = snapshot(&[("a", 1), ("b", 2)]);
        assert!(diff(&old, &old.clone()).is_empty());
    }

    #[test]
    fn a_new_entry_is_an_addition() {
        let old = snapshot(&[("a", 1)]);
        let new = snapshot(&[("a", 1), ("b", 2)]);
        assert_eq!(diff(&old, &new), vec![DiffOp::Added { to: 1 }]);
    }

    #[test]
    fn a_vanished_entry_is_a_removal() {
        let old = snapshot(&[("a", 1), ("b", 2)]);
        let new = snapshot(&[("b", 2)]);
        assert_eq!(diff(&old, &new), vec![DiffOp::Removed { from: 0 }]);
    }

    #[test]
    fn a_kept_inode_under_a_new_name_is_a_rename() {
        let old = snapshot(&[("a", 1), ("c", 3)]);
        let new = snapshot(&[("b", 1), ("c", 3)]);
        assert_eq!(diff(&old, &new), vec![DiffOp::Renamed { from: 0, to: 0 }]);
    }

    #[test]
    fn renames_and_removals_come_in_old_listing_order() {
        let old = snapshot(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = snapshot(&[("d", 3)]);
        assert_eq!(
            diff(&old, &new),
            vec![
                DiffOp::Removed { from: 0 },
                DiffOp::Removed { from: 1 },
                DiffOp::Renamed { from: 2, to: 0 },
            ]
        );
    }

    #[test]
    fn a_replaced_file_under_the_same_name_is_a_replacement() {
        // Same name, different inode: the entry was replaced in place.
        // Name matching wins over any rename pairing, and the watch
        // layer reopens the descriptor under the surviving name.
        let old = snapshot(&[("a", 1)]);
        let new = snapshot(&[("a", 9)]);
        assert_eq!(diff(&old, &new), vec![DiffOp::Replaced { from: 0, to: 0 }]);
    }

    #[test]
    fn a_surviving_hardlink_name_is_not_mistaken_for_a_rename() {
        // "a" and "b" are hardlinks to inode 1; "a" disappears. The
        // surviving "b" is matched by name, so "a" must be a removal,
        // not a rename onto "b".
        let old = snapshot(&[("a", 1), ("b", 1)]);
        let new = snapshot(&[("b", 1)]);
        assert_eq!(diff(&old, &new), vec![DiffOp::Removed { from: 0 }]);
    }

    #[test]
    fn ambiguous_hardlink_renames_degrade_to_remove_and_add() {
        // Two old names for inode 1 both vanish while two new ones
        // appear. Any pairing would be a guess, so the diff reports
        // removals and additions instead.
        let old = snapshot(&[("a", 1), ("b", 1)]);
        let new = snapshot(&[("c", 1), ("d", 1)]);
        assert_eq!(
            diff(&old, &new),
            vec![
                DiffOp::Removed { from: 0 },
                DiffOp::Removed { from: 1 },
                DiffOp::Added { to: 0 },
                DiffOp::Added { to: 1 },
            ]
        );
    }

    #[test]
    fn a_swap_of_two_names_is_a_pair_of_replacements() {
        let old = snapshot(&[("a", 1), ("b", 2)]);
        let new = snapshot(&[("b", 1), ("a", 2)]);
        // Both names survive the name pass but each now backs the
        // other's inode, so both descriptors get refreshed.
        assert_eq!(
            diff(&old, &new),
            vec![
                DiffOp::Replaced { from: 0, to: 1 },
                DiffOp::Replaced { from: 1, to: 0 },
            ]
        );
    }

    #[test]
    fn a_surviving_name_beats_an_inode_pairing() {
        // a -> b while a fresh file takes the name a. The old "a" is
        // matched by its surviving name (and refreshed, since its inode
        // changed), so inode 1 reappearing as "b" is an addition rather
        // than a rename.
        let old = snapshot(&[("a", 1)]);
        let new = snapshot(&[("a", 5), ("b", 1)]);
        assert_eq!(
            diff(&old, &new),
            vec![DiffOp::Replaced { from: 0, to: 0 }, DiffOp::Added { to: 1 }]
        );
    }
}
