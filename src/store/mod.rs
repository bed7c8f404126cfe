mod backing;
mod local;

pub use backing::{BackingStore, MemoryBackingStore};
pub use local::{BlobMetadata, LocalStore};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::model::{serialize_tree, Blob, Tree};
use crate::util::Deferred;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ObjectKind {
    Blob,
    Tree,
}

/// façade over the local cache and the backing store
///
/// reads check the local store first and fall back to the backing store,
/// writing fetched objects (and derived blob metadata) through to the
/// cache. concurrent lookups of the same hash collapse to a single
/// backing-store fetch.
pub struct ObjectStore {
    local: Arc<LocalStore>,
    backing: Arc<dyn BackingStore>,
    in_flight: Mutex<HashSet<(ObjectKind, Hash)>>,
    fetch_done: Condvar,
}

impl ObjectStore {
    pub fn new(local: Arc<LocalStore>, backing: Arc<dyn BackingStore>) -> Self {
        Self {
            local,
            backing,
            in_flight: Mutex::new(HashSet::new()),
            fetch_done: Condvar::new(),
        }
    }

    /// the local cache, for local-only debug reads
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn get_blob(&self, hash: &Hash) -> Result<Arc<Blob>> {
        if let Some(blob) = self.local.get_blob(hash)? {
            return Ok(Arc::new(blob));
        }

        let _guard = self.begin_fetch(ObjectKind::Blob, *hash);

        // another fetch may have completed while we waited for the slot
        if let Some(blob) = self.local.get_blob(hash)? {
            return Ok(Arc::new(blob));
        }

        let blob = self.backing.get_blob(hash)?;
        self.local.put_blob(&blob)?;
        self.local.put_blob_metadata(
            hash,
            &BlobMetadata {
                size: blob.len() as u64,
                sha1: blob.sha1(),
            },
        )?;
        Ok(Arc::new(blob))
    }

    pub fn get_tree(&self, hash: &Hash) -> Result<Arc<Tree>> {
        if let Some(tree) = self.local.get_tree(hash)? {
            return Ok(Arc::new(tree));
        }

        let _guard = self.begin_fetch(ObjectKind::Tree, *hash);

        if let Some(tree) = self.local.get_tree(hash)? {
            return Ok(Arc::new(tree));
        }

        let tree = self.backing.get_tree(hash)?;
        // same check the cache applies on read-back: a tree must hash to
        // the id it was fetched under, or every later cache hit would
        // report corruption
        let object = serialize_tree(tree.entries());
        if Hash::sha1_of(&object) != *hash {
            return Err(Error::Corrupt(*hash));
        }
        self.local.put_tree(hash, &object)?;
        Ok(Arc::new(tree))
    }

    /// SHA-1 of a blob's contents, from recorded metadata when available
    pub fn get_sha1_for_blob(&self, hash: &Hash) -> Result<Hash> {
        Ok(self.get_blob_metadata(hash)?.sha1)
    }

    pub fn get_blob_metadata(&self, hash: &Hash) -> Result<BlobMetadata> {
        if let Some(metadata) = self.local.get_blob_metadata(hash)? {
            return Ok(metadata);
        }

        // loading the blob records the metadata as a side effect, but the
        // blob may predate metadata recording in the cache
        let blob = self.get_blob(hash)?;
        let metadata = BlobMetadata {
            size: blob.len() as u64,
            sha1: blob.sha1(),
        };
        self.local.put_blob_metadata(hash, &metadata)?;
        Ok(metadata)
    }

    /// fetch a blob on a worker thread
    pub fn get_blob_deferred(self: &Arc<Self>, hash: &Hash) -> Deferred<Arc<Blob>> {
        let store = self.clone();
        let hash = *hash;
        Deferred::spawn(move || store.get_blob(&hash))
    }

    /// fetch a tree on a worker thread
    pub fn get_tree_deferred(self: &Arc<Self>, hash: &Hash) -> Deferred<Arc<Tree>> {
        let store = self.clone();
        let hash = *hash;
        Deferred::spawn(move || store.get_tree(&hash))
    }

    /// claim the fetch slot for a key, waiting out any fetch already in
    /// flight for it
    fn begin_fetch(&self, kind: ObjectKind, hash: Hash) -> FetchGuard<'_> {
        let key = (kind, hash);
        let mut in_flight = self.in_flight.lock();
        while in_flight.contains(&key) {
            self.fetch_done.wait(&mut in_flight);
        }
        in_flight.insert(key);
        FetchGuard { store: self, key }
    }
}

struct FetchGuard<'a> {
    store: &'a ObjectStore,
    key: (ObjectKind, Hash),
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.store.in_flight.lock().remove(&self.key);
        self.store.fetch_done.notify_all();
    }
}
