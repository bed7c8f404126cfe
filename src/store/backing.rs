use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::model::{deserialize_tree, Blob, Tree};

/// upstream repository serving immutable objects by hash
pub trait BackingStore: Send + Sync {
    fn get_blob(&self, hash: &Hash) -> Result<Blob>;
    fn get_tree(&self, hash: &Hash) -> Result<Tree>;
}

/// in-memory backing store - the `type = "memory"` repository kind
///
/// holds raw git-format objects; trees are stored serialized and decoded
/// on fetch so the wire codec is exercised the same way as for a real
/// upstream.
#[derive(Default)]
pub struct MemoryBackingStore {
    blobs: RwLock<HashMap<Hash, Vec<u8>>>,
    trees: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a blob under an explicit object id
    pub fn put_blob(&self, hash: Hash, contents: impl Into<Vec<u8>>) {
        self.blobs.write().insert(hash, contents.into());
    }

    /// register a serialized tree object; the id is its SHA-1
    pub fn put_tree_object(&self, object: Vec<u8>) -> Hash {
        let hash = Hash::sha1_of(&object);
        self.trees.write().insert(hash, object);
        hash
    }
}

impl BackingStore for MemoryBackingStore {
    fn get_blob(&self, hash: &Hash) -> Result<Blob> {
        let blobs = self.blobs.read();
        let contents = blobs
            .get(hash)
            .cloned()
            .ok_or(Error::ObjectNotFound(*hash))?;
        Ok(Blob::new(*hash, contents))
    }

    fn get_tree(&self, hash: &Hash) -> Result<Tree> {
        let object = {
            let trees = self.trees.read();
            trees.get(hash).cloned().ok_or(Error::ObjectNotFound(*hash))?
        };
        deserialize_tree(*hash, &object)
    }
}
