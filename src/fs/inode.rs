//! Maps FUSE's flat `u64` inode numbers onto [`NodeKey`]s, attaching
//! PTP identity to each inode the kernel hands back.

use std::collections::HashMap;

use crate::NodeKey;

/// FUSE reserves inode 1 for the mount root.
pub const ROOT_INO: u64 = 1;

/// Bidirectional `ino <-> NodeKey` table. Entries are never reclaimed:
/// `forget` is advisory, and the tree this filesystem presents is small
/// enough that holding every node seen for the life of the mount is
/// cheap — unlike the source, which frees `ptpfs_inode_data` from
/// `ptpfs_put_inode` as the kernel's inode cache evicts entries.
pub struct InodeTable {
    keys: Vec<NodeKey>,
    by_key: HashMap<NodeKey, u64>,
}

impl InodeTable {
    pub fn new() -> InodeTable {
        let mut table = InodeTable {
            keys: Vec::new(),
            by_key: HashMap::new(),
        };
        let root_ino = table.intern(NodeKey::Root);
        debug_assert_eq!(root_ino, ROOT_INO);
        table
    }

    /// Returns `key`'s inode number, assigning one if this is the first
    /// time `key` has been seen.
    pub fn intern(&mut self, key: NodeKey) -> u64 {
        if let Some(&ino) = self.by_key.get(&key) {
            return ino;
        }
        self.keys.push(key);
        let ino = self.keys.len() as u64;
        self.by_key.insert(key, ino);
        ino
    }

    pub fn key(&self, ino: u64) -> Option<NodeKey> {
        self.keys.get(ino.checked_sub(1)? as usize).copied()
    }

    /// Re-points `ino` at `new_key` after a write-back changes an
    /// object's handle, instead of minting a fresh inode number for
    /// the same file.
    pub fn remap(&mut self, ino: u64, new_key: NodeKey) {
        if let Some(slot) = self.keys.get_mut(ino.checked_sub(1).unwrap_or(u64::MAX) as usize) {
            let old_key = *slot;
            self.by_key.remove(&old_key);
            *slot = new_key;
            self.by_key.insert(new_key, ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectHandle, StorageId};

    #[test]
    fn root_gets_reserved_inode_one() {
        let table = InodeTable::new();
        assert_eq!(table.key(ROOT_INO), Some(NodeKey::Root));
    }

    #[test]
    fn interning_the_same_key_twice_returns_the_same_inode() {
        let mut table = InodeTable::new();
        let key = NodeKey::StorageDir(StorageId::from_raw(1));
        let ino1 = table.intern(key);
        let ino2 = table.intern(key);
        assert_eq!(ino1, ino2);
        assert_eq!(table.key(ino1), Some(key));
    }

    #[test]
    fn remap_points_existing_inode_at_a_new_key() {
        let mut table = InodeTable::new();
        let storage = StorageId::from_raw(1);
        let old_key = NodeKey::Object(storage, ObjectHandle::from_raw(100));
        let ino = table.intern(old_key);

        let new_key = NodeKey::Object(storage, ObjectHandle::from_raw(200));
        table.remap(ino, new_key);

        assert_eq!(table.key(ino), Some(new_key));
        assert_eq!(table.by_key.get(&old_key), None);
        assert_eq!(table.by_key.get(&new_key), Some(&ino));
    }
}
