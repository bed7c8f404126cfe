use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::path::PathComponent;

/// kind of tree entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Symlink,
    Directory,
}

/// a single entry in a tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: PathComponent,
    pub hash: Hash,
    pub file_type: FileType,
    /// owner permission bits: 0b100 read, 0b010 write, 0b001 execute
    pub owner_perms: u8,
}

impl TreeEntry {
    pub fn new(name: PathComponent, hash: Hash, file_type: FileType, owner_perms: u8) -> Self {
        Self {
            name,
            hash,
            file_type,
            owner_perms,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// full mode word: file-type bits plus permissions expanded from the
    /// owner bits (0755 when executable, 0644 otherwise)
    pub fn mode(&self) -> u32 {
        match self.file_type {
            FileType::Directory => 0o040755,
            FileType::Symlink => 0o120755,
            FileType::Regular => {
                if self.owner_perms & 0b001 != 0 {
                    0o100755
                } else {
                    0o100644
                }
            }
        }
    }
}

/// compare two names in tree order: directory names sort as if they
/// carried a trailing separator
pub(crate) fn tree_name_order(a: &str, a_is_dir: bool, b: &str, b_is_dir: bool) -> Ordering {
    let left = a.as_bytes().iter().copied().chain(a_is_dir.then_some(b'/'));
    let right = b.as_bytes().iter().copied().chain(b_is_dir.then_some(b'/'));
    left.cmp(right)
}

/// an immutable directory object - entries sorted in tree order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    hash: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// create a tree from its id and entries, validating order and uniqueness
    pub fn new(hash: Hash, mut entries: Vec<TreeEntry>) -> Result<Self> {
        entries.sort_by(|a, b| {
            tree_name_order(
                a.name.as_str(),
                a.is_directory(),
                b.name.as_str(),
                b.is_directory(),
            )
        });
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::MalformedObject(format!(
                    "duplicate tree entry name: {}",
                    entry.name
                )));
            }
        }
        Ok(Self { hash, entries })
    }

    /// source-control id of this tree
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// look up an entry by name
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.lookup(name, false).or_else(|| self.lookup(name, true))
    }

    fn lookup(&self, name: &str, as_dir: bool) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| {
                tree_name_order(e.name.as_str(), e.is_directory(), name, as_dir)
            })
            .ok()
            .map(|i| &self.entries[i])
    }
}
