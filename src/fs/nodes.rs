//! Inode to path mapping
//!
//! The kernel addresses entries by inode, data sources by path. Root is
//! inode 1; every other path gets the next free number the first time it
//! is seen and keeps it until it is removed or renamed away.

use std::collections::HashMap;

pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode <-> path arena
pub struct NodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl NodeTable {
    pub fn new() -> Self {
        let mut table = NodeTable {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.path_to_inode.insert("/".to_string(), ROOT_INODE);
        table.inode_to_path.insert(ROOT_INODE, "/".to_string());
        table
    }

    /// Inode for `path`, allocating one if needed
    pub fn get_or_create(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(path.to_string(), ino);
        self.inode_to_path.insert(ino, path.to_string());
        ino
    }

    pub fn inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(path).copied()
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.inode_to_path.get(&ino).map(String::as_str)
    }

    /// Forget `path` and everything below it
    pub fn remove(&mut self, path: &str) {
        if path == "/" {
            return;
        }
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(ino) = self.path_to_inode.remove(&p) {
                self.inode_to_path.remove(&ino);
            }
        }
    }

    /// Move `from` and its descendants to `to`, keeping their inodes
    pub fn rename(&mut self, from: &str, to: &str) {
        self.remove(to);
        let prefix = format!("{}/", from);
        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            self.path_to_inode.remove(&old);
            self.path_to_inode.insert(new.clone(), ino);
            self.inode_to_path.insert(ino, new);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}
