//! per-mount persistent storage for locally-modified inode state
//!
//! lives under the client directory:
//!   `SNAPSHOT`         current commit hash, text, trailing newline
//!   `local/<inode_id>` materialized file contents / directory listings
//!   `dirstate`         user-staged add/remove directives
//!   `clone-succeeded`  sentinel for a completed initial clone
//!   `bind-mounts/`     scratch sources for bind mounts

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::inode::InodeId;
use crate::path::PathComponent;

const SNAPSHOT_FILE: &str = "SNAPSHOT";
const LOCAL_DIR: &str = "local";
const DIRSTATE_FILE: &str = "dirstate";
const CLONE_SUCCEEDED_FILE: &str = "clone-succeeded";
const BIND_MOUNTS_DIR: &str = "bind-mounts";

/// the single user-visible extended attribute
pub const SHA1_XATTR: &str = "user.sha1";

/// one name in a materialized directory listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayDirEntry {
    pub inode_id: InodeId,
    /// source-store hash for unmaterialized children; `None` once the
    /// child itself is materialized
    pub hash: Option<Hash>,
    pub mode: u32,
}

/// serialized listing of a materialized directory
pub type OverlayDir = BTreeMap<PathComponent, OverlayDirEntry>;

pub struct Overlay {
    client_dir: PathBuf,
}

impl Overlay {
    pub fn open(client_dir: &Path) -> Result<Self> {
        fs::create_dir_all(client_dir.join(LOCAL_DIR)).with_path(client_dir)?;
        fs::create_dir_all(client_dir.join(BIND_MOUNTS_DIR)).with_path(client_dir)?;
        Ok(Self {
            client_dir: client_dir.to_path_buf(),
        })
    }

    pub fn client_dir(&self) -> &Path {
        &self.client_dir
    }

    /// on-disk path of an inode's overlay entry
    pub fn file_path(&self, inode_id: InodeId) -> PathBuf {
        self.client_dir.join(LOCAL_DIR).join(inode_id.to_string())
    }

    pub fn dirstate_path(&self) -> PathBuf {
        self.client_dir.join(DIRSTATE_FILE)
    }

    pub fn bind_mounts_dir(&self) -> PathBuf {
        self.client_dir.join(BIND_MOUNTS_DIR)
    }

    // --- snapshot ---

    pub fn snapshot_path(&self) -> PathBuf {
        self.client_dir.join(SNAPSHOT_FILE)
    }

    /// current commit hash; whitespace around the hex is tolerated
    pub fn read_snapshot(&self) -> Result<Hash> {
        let path = self.snapshot_path();
        let contents = fs::read_to_string(&path).with_path(&path)?;
        Hash::from_hex(contents.trim())
    }

    /// atomically record the current commit hash
    pub fn write_snapshot(&self, hash: &Hash) -> Result<()> {
        let contents = format!("{}\n", hash.to_hex());
        atomic_write(&self.snapshot_path(), contents.as_bytes())
    }

    // --- clone sentinel ---

    pub fn clone_succeeded(&self) -> bool {
        self.client_dir.join(CLONE_SUCCEEDED_FILE).exists()
    }

    pub fn mark_clone_succeeded(&self) -> Result<()> {
        atomic_write(&self.client_dir.join(CLONE_SUCCEEDED_FILE), b"\n")
    }

    // --- per-inode files ---

    /// open the overlay file for an inode, creating or truncating it when
    /// the inode is being materialized
    pub fn open_file(&self, inode_id: InodeId, create: bool, truncate: bool) -> Result<File> {
        let path = self.file_path(inode_id);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(truncate)
            .open(&path)
            .with_path(&path)
    }

    /// materialize a file inode's contents atomically and return an open
    /// read-write handle to the final file
    pub fn write_file(&self, inode_id: InodeId, contents: &[u8]) -> Result<File> {
        let final_path = self.file_path(inode_id);
        let tmp_path = self
            .client_dir
            .join(LOCAL_DIR)
            .join(format!("tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut tmp = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp.write_all(contents).with_path(&tmp_path)?;
            tmp.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, &final_path).with_path(&final_path)?;
        self.open_file(inode_id, false, false)
    }

    /// read the serialized listing of a materialized directory
    pub fn read_dir(&self, inode_id: InodeId) -> Result<OverlayDir> {
        let path = self.file_path(inode_id);
        let data = fs::read(&path).with_path(&path)?;
        ciborium::from_reader(&data[..])
            .map_err(|e| Error::Internal(format!("undecodable overlay listing: {}", e)))
    }

    /// write the serialized listing of a materialized directory
    pub fn write_dir(&self, inode_id: InodeId, listing: &OverlayDir) -> Result<()> {
        let mut data = Vec::new();
        ciborium::into_writer(listing, &mut data)
            .map_err(|e| Error::Internal(format!("unencodable overlay listing: {}", e)))?;
        atomic_write(&self.file_path(inode_id), &data)
    }

    /// delete an inode's overlay entry
    pub fn remove(&self, inode_id: InodeId) -> Result<()> {
        let path = self.file_path(inode_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }

    pub fn has_entry(&self, inode_id: InodeId) -> bool {
        self.file_path(inode_id).exists()
    }

    /// highest inode id with persisted overlay state, for id allocation
    /// after a restart
    pub fn max_inode_id(&self) -> Result<InodeId> {
        let local = self.client_dir.join(LOCAL_DIR);
        let mut max = 0;
        for entry in fs::read_dir(&local).with_path(&local)? {
            let entry = entry.with_path(&local)?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<InodeId>().ok())
            {
                max = max.max(id);
            }
        }
        Ok(max)
    }

    // --- sha1 xattr ---

    /// stored content SHA-1 of a materialized file, when present and valid
    pub fn get_sha1_xattr(&self, inode_id: InodeId) -> Option<Hash> {
        let value = xattr::get(self.file_path(inode_id), SHA1_XATTR).ok()??;
        let hex = std::str::from_utf8(&value).ok()?;
        Hash::from_hex(hex).ok()
    }

    /// record the content SHA-1 on the overlay file
    ///
    /// a store failure is logged and reported as `false`; the caller keeps
    /// the computed digest and recomputes next time.
    pub fn set_sha1_xattr(&self, inode_id: InodeId, sha1: &Hash) -> bool {
        let path = self.file_path(inode_id);
        match xattr::set(&path, SHA1_XATTR, sha1.to_hex().as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                warn!(?path, error = %e, "failed to store sha1 attribute in the overlay");
                false
            }
        }
    }
}

/// write-to-temp-then-rename within the target's directory
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidArgument(format!("no parent directory: {:?}", path)))?;
    let tmp_path = dir.join(format!("tmp-{}", uuid::Uuid::new_v4()));
    {
        let mut tmp = File::create(&tmp_path).with_path(&tmp_path)?;
        tmp.write_all(contents).with_path(&tmp_path)?;
        tmp.sync_all().with_path(&tmp_path)?;
    }
    fs::rename(&tmp_path, path).with_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn test_overlay() -> (tempfile::TempDir, Overlay) {
        let dir = tempdir().unwrap();
        let overlay = Overlay::open(&dir.path().join("client")).unwrap();
        (dir, overlay)
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (_dir, overlay) = test_overlay();
        let hash = Hash::sha1_of(b"commit");

        overlay.write_snapshot(&hash).unwrap();
        assert_eq!(overlay.read_snapshot().unwrap(), hash);

        // trailing newline on disk
        let raw = fs::read_to_string(overlay.snapshot_path()).unwrap();
        assert_eq!(raw, format!("{}\n", hash.to_hex()));
    }

    #[test]
    fn test_snapshot_tolerates_whitespace() {
        let (_dir, overlay) = test_overlay();
        let hash = Hash::sha1_of(b"commit");
        fs::write(
            overlay.snapshot_path(),
            format!("  {}\n\n", hash.to_hex()),
        )
        .unwrap();
        assert_eq!(overlay.read_snapshot().unwrap(), hash);
    }

    #[test]
    fn test_file_materialize_and_reopen() {
        let (_dir, overlay) = test_overlay();

        let mut file = overlay.write_file(7, b"hello\n").unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello\n");

        assert!(overlay.has_entry(7));
        let reopened = overlay.open_file(7, false, false);
        assert!(reopened.is_ok());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let (_dir, overlay) = test_overlay();
        assert!(overlay.open_file(99, false, false).is_err());
    }

    #[test]
    fn test_dir_listing_roundtrip() {
        let (_dir, overlay) = test_overlay();

        let mut listing = OverlayDir::new();
        listing.insert(
            PathComponent::new("a.txt").unwrap(),
            OverlayDirEntry {
                inode_id: 12,
                hash: Some(Hash::sha1_of(b"a")),
                mode: 0o100644,
            },
        );
        listing.insert(
            PathComponent::new("sub").unwrap(),
            OverlayDirEntry {
                inode_id: 13,
                hash: None,
                mode: 0o040755,
            },
        );

        overlay.write_dir(3, &listing).unwrap();
        assert_eq!(overlay.read_dir(3).unwrap(), listing);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, overlay) = test_overlay();
        overlay.write_file(5, b"x").unwrap();
        overlay.remove(5).unwrap();
        assert!(!overlay.has_entry(5));
        overlay.remove(5).unwrap();
    }

    #[test]
    fn test_sha1_xattr_roundtrip() {
        let (_dir, overlay) = test_overlay();
        overlay.write_file(9, b"HELLO\n").unwrap();

        let sha1 = Hash::sha1_of(b"HELLO\n");
        // tmpfs may lack user xattr support; both outcomes are legal here
        if overlay.set_sha1_xattr(9, &sha1) {
            assert_eq!(overlay.get_sha1_xattr(9), Some(sha1));
        } else {
            assert_eq!(overlay.get_sha1_xattr(9), None);
        }
    }

    #[test]
    fn test_clone_sentinel() {
        let (_dir, overlay) = test_overlay();
        assert!(!overlay.clone_succeeded());
        overlay.mark_clone_succeeded().unwrap();
        assert!(overlay.clone_succeeded());
    }
}
