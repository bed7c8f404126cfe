use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::model::{deserialize_tree, Blob, Tree};

/// derived attributes of a blob, recorded alongside the cached object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub size: u64,
    pub sha1: Hash,
}

/// write-through on-disk cache of fetched objects
///
/// three key namespaces: `tree/<hash>`, `blob/<hash>`, `blobmeta/<hash>`.
/// values are zstd-compressed and written temp-then-rename so a key is
/// either absent or durable, never partial.
pub struct LocalStore {
    path: PathBuf,
}

const COMPRESSION_LEVEL: i32 = 3;

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        for namespace in ["tree", "blob", "blobmeta", "tmp"] {
            fs::create_dir_all(path.join(namespace)).with_path(path)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn key_path(&self, namespace: &str, hash: &Hash) -> PathBuf {
        self.path.join(namespace).join(hash.to_hex())
    }

    /// read a key; `None` when absent
    fn get(&self, namespace: &str, hash: &Hash) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(namespace, hash);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Io {
                    path,
                    source: e,
                })
            }
        };
        let data = zstd::decode_all(&compressed[..]).with_path(&path)?;
        Ok(Some(data))
    }

    /// write a key durably: temp file, fsync, rename, fsync directory
    fn put(&self, namespace: &str, hash: &Hash, data: &[u8]) -> Result<()> {
        let final_path = self.key_path(namespace, hash);
        if final_path.exists() {
            return Ok(());
        }

        let compressed = zstd::encode_all(data, COMPRESSION_LEVEL).with_path(&final_path)?;

        let tmp_path = self.path.join("tmp").join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(&compressed).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, &final_path).with_path(&final_path)?;

        let namespace_dir = self.path.join(namespace);
        let dir_file = File::open(&namespace_dir).with_path(&namespace_dir)?;
        dir_file.sync_all().with_path(&namespace_dir)?;

        Ok(())
    }

    /// cached tree; verifies the stored object still matches its id
    pub fn get_tree(&self, hash: &Hash) -> Result<Option<Tree>> {
        let object = match self.get("tree", hash)? {
            Some(object) => object,
            None => return Ok(None),
        };
        if Hash::sha1_of(&object) != *hash {
            return Err(Error::Corrupt(*hash));
        }
        Ok(Some(deserialize_tree(*hash, &object)?))
    }

    /// cache a serialized tree object
    pub fn put_tree(&self, hash: &Hash, object: &[u8]) -> Result<()> {
        self.put("tree", hash, object)
    }

    pub fn get_blob(&self, hash: &Hash) -> Result<Option<Blob>> {
        Ok(self
            .get("blob", hash)?
            .map(|contents| Blob::new(*hash, contents)))
    }

    pub fn put_blob(&self, blob: &Blob) -> Result<()> {
        self.put("blob", blob.hash(), blob.contents())
    }

    pub fn get_blob_metadata(&self, hash: &Hash) -> Result<Option<BlobMetadata>> {
        let data = match self.get("blobmeta", hash)? {
            Some(data) => data,
            None => return Ok(None),
        };
        let metadata = ciborium::from_reader(&data[..])
            .map_err(|e| Error::Internal(format!("undecodable blob metadata: {}", e)))?;
        Ok(Some(metadata))
    }

    pub fn put_blob_metadata(&self, hash: &Hash, metadata: &BlobMetadata) -> Result<()> {
        let mut data = Vec::new();
        ciborium::into_writer(metadata, &mut data)
            .map_err(|e| Error::Internal(format!("unencodable blob metadata: {}", e)))?;
        self.put("blobmeta", hash, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{serialize_tree, FileType, TreeEntry};
    use crate::path::PathComponent;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("local-store")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_blob_roundtrip() {
        let (_dir, store) = test_store();
        let blob = Blob::new(Hash::sha1_of(b"contents"), &b"contents"[..]);

        assert!(store.get_blob(blob.hash()).unwrap().is_none());
        store.put_blob(&blob).unwrap();

        let loaded = store.get_blob(blob.hash()).unwrap().unwrap();
        assert_eq!(loaded, blob);
    }

    #[test]
    fn test_tree_roundtrip() {
        let (_dir, store) = test_store();
        let entries = vec![TreeEntry::new(
            PathComponent::new("file.txt").unwrap(),
            Hash::sha1_of(b"x"),
            FileType::Regular,
            0b110,
        )];
        let object = serialize_tree(&entries);
        let hash = Hash::sha1_of(&object);

        store.put_tree(&hash, &object).unwrap();
        let tree = store.get_tree(&hash).unwrap().unwrap();
        assert_eq!(tree.entries(), &entries[..]);
    }

    #[test]
    fn test_tree_corruption_detected() {
        let (_dir, store) = test_store();
        let object = serialize_tree(&[]);
        // store under an id that does not match the content
        let wrong = Hash::sha1_of(b"something else");
        store.put_tree(&wrong, &object).unwrap();

        assert!(matches!(store.get_tree(&wrong), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_blob_metadata_roundtrip() {
        let (_dir, store) = test_store();
        let hash = Hash::sha1_of(b"id");
        let metadata = BlobMetadata {
            size: 6,
            sha1: Hash::sha1_of(b"hello\n"),
        };

        assert!(store.get_blob_metadata(&hash).unwrap().is_none());
        store.put_blob_metadata(&hash, &metadata).unwrap();
        assert_eq!(store.get_blob_metadata(&hash).unwrap(), Some(metadata));
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = test_store();
        let blob = Blob::new(Hash::sha1_of(b"dup"), &b"dup"[..]);
        store.put_blob(&blob).unwrap();
        store.put_blob(&blob).unwrap();
        assert_eq!(store.get_blob(blob.hash()).unwrap().unwrap(), blob);
    }
}
