//! Inode table for mapping remote entries to stable inode numbers
//!
//! FUSE requires stable inode numbers for the lifetime of a mount.
//! Each inode remembers its path (for parent lookup) and the remote key it
//! stands for.

use std::collections::HashMap;

use crate::api::{FolderKey, QuickKey};

/// Root inode number (always 1 per FUSE convention)
pub const ROOT_INO: u64 = 1;

/// The remote object behind an inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteNode {
    Folder(FolderKey),
    File(QuickKey),
}

#[derive(Debug)]
struct InodeEntry {
    path: String,
    node: RemoteNode,
}

/// Manages path-to-inode mapping for the filesystem
pub struct InodeTable {
    /// Map from path (relative to the account root) to inode number
    path_to_ino: HashMap<String, u64>,
    /// Map from inode number to its path and remote key
    entries: HashMap<u64, InodeEntry>,
    /// Next available inode number
    next_ino: u64,
}

impl InodeTable {
    /// Create a new inode table with root inode initialized
    pub fn new() -> Self {
        let mut table = Self {
            path_to_ino: HashMap::new(),
            entries: HashMap::new(),
            next_ino: ROOT_INO + 1, // Start at 2, since 1 is root
        };

        // Root inode: empty path, root folder alias
        table.path_to_ino.insert(String::new(), ROOT_INO);
        table.entries.insert(
            ROOT_INO,
            InodeEntry {
                path: String::new(),
                node: RemoteNode::Folder(FolderKey::root()),
            },
        );

        table
    }

    /// Look up an inode for a path, creating one if it doesn't exist
    ///
    /// An existing inode keeps its number but takes the given remote key, so a
    /// file replaced remotely under the same name stays reachable.
    pub fn lookup_or_create(&mut self, path: &str, node: RemoteNode) -> u64 {
        let normalized = Self::normalize_path(path);

        if let Some(&ino) = self.path_to_ino.get(&normalized) {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.node = node;
            }
            return ino;
        }

        // Allocate new inode
        let ino = self.next_ino;
        self.next_ino += 1;

        self.path_to_ino.insert(normalized.clone(), ino);
        self.entries.insert(
            ino,
            InodeEntry {
                path: normalized,
                node,
            },
        );

        ino
    }

    /// Get the path for an inode number
    pub fn get_path(&self, ino: u64) -> Option<&str> {
        self.entries.get(&ino).map(|e| e.path.as_str())
    }

    /// Get the remote key for an inode number
    pub fn get_node(&self, ino: u64) -> Option<&RemoteNode> {
        self.entries.get(&ino).map(|e| &e.node)
    }

    /// Get parent inode for a given inode
    pub fn get_parent_ino(&self, ino: u64) -> u64 {
        if ino == ROOT_INO {
            return ROOT_INO; // Root's parent is itself
        }

        if let Some(path) = self.get_path(ino) {
            if let Some(last_slash) = path.rfind('/') {
                if let Some(&parent_ino) = self.path_to_ino.get(&path[..last_slash]) {
                    return parent_ino;
                }
            }
        }

        ROOT_INO
    }

    /// Path of a child entry under a parent path
    pub fn child_path(parent_path: &str, name: &str) -> String {
        if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_path, name)
        }
    }

    /// Normalize a path for consistent lookup
    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
