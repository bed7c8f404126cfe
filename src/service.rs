//! request surface: stable verbs over a table of mounts
//!
//! a thin wire translator sits above this; every verb here takes and
//! returns plain core types.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::info;

use crate::config::{ClientConfig, ConfigData};
use crate::checkout::CheckoutConflict;
use crate::dirstate::{ScmError, StatusCode};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::journal::{JournalDelta, JournalPosition, JournalRange, SubscriberId};
use crate::model::Tree;
use crate::mount::{FileInformation, Mount};
use crate::path::{AbsolutePath, RelativePath};
use crate::store::{BackingStore, BlobMetadata, LocalStore, ObjectStore};
use crate::util::{CancellationToken, Deferred};

/// creates a backing store for a `(type, source)` pair from configuration
pub type BackingStoreFactory =
    Box<dyn Fn(&str, &str) -> Result<Arc<dyn BackingStore>> + Send + Sync>;

/// debug view of one directory entry's inode state
#[derive(Clone, Debug)]
pub struct InodeDebugEntry {
    pub name: String,
    pub inode_id: Option<u64>,
    pub hash: Option<Hash>,
    pub mode: u32,
    pub materialized: bool,
}

pub struct FsService {
    etc_dir: PathBuf,
    user_config: PathBuf,
    local_store: Arc<LocalStore>,
    backing_factory: BackingStoreFactory,
    mounts: RwLock<HashMap<AbsolutePath, Arc<Mount>>>,
    running: AtomicBool,
}

impl FsService {
    pub fn new(
        etc_dir: &Path,
        user_config: &Path,
        local_store: Arc<LocalStore>,
        backing_factory: BackingStoreFactory,
    ) -> FsService {
        FsService {
            etc_dir: etc_dir.to_path_buf(),
            user_config: user_config.to_path_buf(),
            local_store,
            backing_factory,
            mounts: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    fn mount_for(&self, mount_point: &str) -> Result<Arc<Mount>> {
        let path = AbsolutePath::new(mount_point)?;
        self.mounts
            .read()
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no mount at {}", mount_point)))
    }

    // --- mount management ---

    pub fn mount(&self, mount_point: &str, client_dir: &Path) -> Result<Arc<Mount>> {
        let mount_path = AbsolutePath::new(mount_point)?;
        if self.mounts.read().contains_key(&mount_path) {
            return Err(Error::AlreadyExists(mount_point.to_string()));
        }

        let config_data = ConfigData::load(&self.etc_dir, &self.user_config)?;
        let client_config = ClientConfig::load_from_client_directory(
            mount_path.clone(),
            client_dir,
            &config_data,
            &self.etc_dir,
        )?;

        let backing = (self.backing_factory)(
            client_config.repo_type(),
            client_config.repo_source(),
        )?;
        let store = Arc::new(ObjectStore::new(self.local_store.clone(), backing));
        let mount = Mount::open(
            mount_path.clone(),
            client_dir,
            store,
            client_config.bind_mounts().to_vec(),
        )?;

        // post-clone hooks run out of process; the sentinel records that
        // the initial clone completed
        if mount.ensure_clone_marked()? {
            info!(mount = %mount_path, "initial clone completed");
        }

        self.mounts.write().insert(mount_path, mount.clone());
        Ok(mount)
    }

    pub fn unmount(&self, mount_point: &str) -> Result<()> {
        let path = AbsolutePath::new(mount_point)?;
        self.mounts
            .write()
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no mount at {}", mount_point)))
    }

    pub fn list_mounts(&self) -> Vec<AbsolutePath> {
        let mut paths: Vec<_> = self.mounts.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    // --- snapshots ---

    pub fn get_current_snapshot(&self, mount_point: &str) -> Result<Hash> {
        Ok(self.mount_for(mount_point)?.current_snapshot())
    }

    pub fn checkout(
        &self,
        mount_point: &str,
        commit: Hash,
        force: bool,
        token: &CancellationToken,
    ) -> Result<Vec<CheckoutConflict>> {
        self.mount_for(mount_point)?.checkout(commit, force, token)
    }

    pub fn reset_parent(&self, mount_point: &str, commit: Hash) -> Result<()> {
        self.mount_for(mount_point)?.reset_parent(commit)
    }

    // --- file queries ---

    /// per-path SHA-1 results; the whole call fails only if the mount is
    /// unknown
    pub fn get_sha1(&self, mount_point: &str, paths: &[String]) -> Result<Vec<Result<Hash>>> {
        let mount = self.mount_for(mount_point)?;

        let pending: Vec<Deferred<Hash>> = paths
            .iter()
            .map(|path| {
                if path.is_empty() {
                    return Deferred::ready(Err(Error::InvalidArgument(
                        "path cannot be the empty string".to_string(),
                    )));
                }
                match RelativePath::new(path.clone()) {
                    Ok(path) => {
                        let mount = mount.clone();
                        Deferred::spawn(move || mount.get_sha1(&path))
                    }
                    Err(e) => Deferred::ready(Err(e)),
                }
            })
            .collect();

        Ok(pending.into_iter().map(Deferred::wait).collect())
    }

    pub fn get_bind_mounts(&self, mount_point: &str) -> Result<Vec<RelativePath>> {
        let mount = self.mount_for(mount_point)?;
        mount
            .bind_mounts()
            .iter()
            .map(|bind| mount.mount_path().relativize(&bind.mount_path))
            .collect()
    }

    pub fn get_file_information(
        &self,
        mount_point: &str,
        paths: &[String],
    ) -> Result<Vec<Result<FileInformation>>> {
        let mount = self.mount_for(mount_point)?;
        Ok(paths
            .iter()
            .map(|path| {
                let path = RelativePath::new(path.clone())?;
                mount.get_file_information(&path)
            })
            .collect())
    }

    // --- journal ---

    pub fn get_current_journal_position(&self, mount_point: &str) -> Result<JournalPosition> {
        Ok(self.mount_for(mount_point)?.journal_position())
    }

    pub fn get_files_changed_since(
        &self,
        mount_point: &str,
        cursor: &JournalPosition,
    ) -> Result<JournalRange> {
        self.mount_for(mount_point)?.changes_since(cursor)
    }

    pub fn subscribe(
        &self,
        mount_point: &str,
        callback: impl Fn(&Arc<JournalDelta>) -> bool + Send + Sync + 'static,
    ) -> Result<SubscriberId> {
        Ok(self.mount_for(mount_point)?.subscribe(callback))
    }

    // --- source control ---

    pub fn scm_get_status(
        &self,
        mount_point: &str,
        list_ignored: bool,
        token: &CancellationToken,
    ) -> Result<BTreeMap<RelativePath, StatusCode>> {
        self.mount_for(mount_point)?.scm_status(list_ignored, token)
    }

    pub fn scm_add(&self, mount_point: &str, paths: &[RelativePath]) -> Result<Vec<ScmError>> {
        self.mount_for(mount_point)?.scm_add(paths)
    }

    pub fn scm_remove(
        &self,
        mount_point: &str,
        paths: &[RelativePath],
        force: bool,
    ) -> Result<Vec<ScmError>> {
        self.mount_for(mount_point)?.scm_remove(paths, force)
    }

    pub fn scm_mark_committed(
        &self,
        mount_point: &str,
        commit: Hash,
        paths_to_clean: &[RelativePath],
        paths_to_drop: &[RelativePath],
    ) -> Result<()> {
        self.mount_for(mount_point)?
            .scm_mark_committed(commit, paths_to_clean, paths_to_drop)
    }

    // --- debug ---

    pub fn debug_get_scm_tree(
        &self,
        mount_point: &str,
        id: &Hash,
        local_only: bool,
    ) -> Result<Arc<Tree>> {
        let mount = self.mount_for(mount_point)?;
        if local_only {
            mount
                .store()
                .local()
                .get_tree(id)?
                .map(Arc::new)
                .ok_or(Error::ObjectNotFound(*id))
        } else {
            mount.store().get_tree(id)
        }
    }

    pub fn debug_get_scm_blob(
        &self,
        mount_point: &str,
        id: &Hash,
        local_only: bool,
    ) -> Result<Bytes> {
        let mount = self.mount_for(mount_point)?;
        if local_only {
            let blob = mount
                .store()
                .local()
                .get_blob(id)?
                .ok_or(Error::ObjectNotFound(*id))?;
            Ok(blob.contents().clone())
        } else {
            Ok(mount.store().get_blob(id)?.contents().clone())
        }
    }

    pub fn debug_get_scm_blob_metadata(
        &self,
        mount_point: &str,
        id: &Hash,
        local_only: bool,
    ) -> Result<BlobMetadata> {
        let mount = self.mount_for(mount_point)?;
        if local_only {
            mount
                .store()
                .local()
                .get_blob_metadata(id)?
                .ok_or(Error::ObjectNotFound(*id))
        } else {
            mount.store().get_blob_metadata(id)
        }
    }

    /// inode states of a directory's entries
    pub fn debug_inode_status(
        &self,
        mount_point: &str,
        path: &str,
    ) -> Result<Vec<InodeDebugEntry>> {
        let mount = self.mount_for(mount_point)?;
        let path = RelativePath::new(path.to_string())?;
        let dir = mount.inodes().resolve(&path)?;
        Ok(mount
            .inodes()
            .list(&dir)?
            .into_iter()
            .map(|(name, entry)| InodeDebugEntry {
                name: name.as_str().to_string(),
                inode_id: entry.inode_id,
                hash: entry.hash,
                mode: entry.mode,
                materialized: entry.hash.is_none(),
            })
            .collect())
    }

    // --- lifecycle ---

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.mounts.write().clear();
        info!("service shut down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{serialize_tree, FileType, TreeEntry};
    use crate::path::PathComponent;
    use crate::store::MemoryBackingStore;
    use std::fs;
    use tempfile::tempdir;

    struct Env {
        _dir: tempfile::TempDir,
        service: FsService,
        client_dir: PathBuf,
        commit: Hash,
        tree_id: Hash,
        blob_id: Hash,
    }

    fn entry(name: &str, hash: Hash, file_type: FileType, perms: u8) -> TreeEntry {
        TreeEntry::new(PathComponent::new(name).unwrap(), hash, file_type, perms)
    }

    fn test_env() -> Env {
        let dir = tempdir().unwrap();

        let backing = Arc::new(MemoryBackingStore::new());
        let blob_id = Hash::sha1_of(b"id-readme");
        backing.put_blob(blob_id, &b"hello service\n"[..]);
        let link_id = Hash::sha1_of(b"id-link");
        backing.put_blob(link_id, &b"README.md"[..]);
        let commit = backing.put_tree_object(serialize_tree(&[
            entry("README.md", blob_id, FileType::Regular, 0b110),
            entry("link", link_id, FileType::Symlink, 0b111),
        ]));

        // global config: one memory-backed repository
        let etc = dir.path().join("etc");
        fs::create_dir_all(etc.join("config.d")).unwrap();
        fs::write(
            etc.join("config.d").join("10-repos"),
            "[repository demo]\ntype = memory\npath = /unused\n",
        )
        .unwrap();
        let user_config = dir.path().join("user-config");

        // client directory pre-seeded at `commit`
        let client_dir = dir.path().join("clients").join("demo");
        fs::create_dir_all(&client_dir).unwrap();
        fs::write(
            client_dir.join("config.ini"),
            "[repository]\nname = demo\n",
        )
        .unwrap();
        fs::write(
            client_dir.join("SNAPSHOT"),
            format!("{}\n", commit.to_hex()),
        )
        .unwrap();

        let local_store =
            Arc::new(LocalStore::open(&dir.path().join("local-store")).unwrap());
        let factory_backing = backing.clone();
        let service = FsService::new(
            &etc,
            &user_config,
            local_store,
            Box::new(move |repo_type, _source| match repo_type {
                "memory" => {
                    let backing: Arc<dyn BackingStore> = factory_backing.clone();
                    Ok(backing)
                }
                _ => Err(Error::Unsupported("unknown repository type")),
            }),
        );

        Env {
            _dir: dir,
            service,
            client_dir,
            commit,
            tree_id: commit,
            blob_id,
        }
    }

    #[test]
    fn test_mount_lifecycle() {
        let env = test_env();
        assert!(env.service.list_mounts().is_empty());

        env.service.mount("/mnt/demo", &env.client_dir).unwrap();
        assert_eq!(env.service.list_mounts().len(), 1);
        assert!(matches!(
            env.service.mount("/mnt/demo", &env.client_dir),
            Err(Error::AlreadyExists(_))
        ));

        assert_eq!(
            env.service.get_current_snapshot("/mnt/demo").unwrap(),
            env.commit
        );

        env.service.unmount("/mnt/demo").unwrap();
        assert!(matches!(
            env.service.unmount("/mnt/demo"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_mount_marks_clone_succeeded() {
        let env = test_env();
        assert!(!env.client_dir.join("clone-succeeded").exists());
        env.service.mount("/mnt/demo", &env.client_dir).unwrap();
        assert!(env.client_dir.join("clone-succeeded").exists());
    }

    #[test]
    fn test_get_sha1_per_path_results() {
        let env = test_env();
        env.service.mount("/mnt/demo", &env.client_dir).unwrap();

        let results = env
            .service
            .get_sha1(
                "/mnt/demo",
                &[
                    "README.md".to_string(),
                    "link".to_string(),
                    String::new(),
                    "missing".to_string(),
                ],
            )
            .unwrap();

        assert_eq!(
            *results[0].as_ref().unwrap(),
            Hash::sha1_of(b"hello service\n")
        );
        assert!(matches!(results[1], Err(Error::InvalidArgument(_))));
        assert!(matches!(results[2], Err(Error::InvalidArgument(_))));
        assert!(matches!(results[3], Err(Error::NotFound(_))));
    }

    #[test]
    fn test_get_file_information() {
        let env = test_env();
        env.service.mount("/mnt/demo", &env.client_dir).unwrap();

        let results = env
            .service
            .get_file_information("/mnt/demo", &["README.md".to_string()])
            .unwrap();
        let info = results[0].as_ref().unwrap();
        assert_eq!(info.size, 14);
        assert_eq!(info.mode & 0o170000, 0o100000);
    }

    #[test]
    fn test_journal_position_and_changes() {
        let env = test_env();
        env.service.mount("/mnt/demo", &env.client_dir).unwrap();

        let start = env
            .service
            .get_current_journal_position("/mnt/demo")
            .unwrap();
        assert_eq!(start.sequence, 0);

        // a write produces a visible delta
        let mount = env.service.mount_for("/mnt/demo").unwrap();
        let readme = mount
            .inodes()
            .resolve(&RelativePath::new("README.md").unwrap())
            .unwrap();
        mount.inodes().materialize_for_write(&readme, false).unwrap();

        let range = env
            .service
            .get_files_changed_since("/mnt/demo", &start)
            .unwrap();
        assert!(range
            .changed_paths
            .contains(&RelativePath::new("README.md").unwrap()));

        // a cursor from a previous mount generation is refused
        let stale = JournalPosition {
            generation: start.generation.wrapping_add(1),
            sequence: 0,
            hash: Hash::ZERO,
        };
        assert!(matches!(
            env.service.get_files_changed_since("/mnt/demo", &stale),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_subscription_via_service() {
        let env = test_env();
        env.service.mount("/mnt/demo", &env.client_dir).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(0u32));
        let seen_clone = seen.clone();
        env.service
            .subscribe("/mnt/demo", move |_| {
                *seen_clone.lock() += 1;
                true
            })
            .unwrap();

        let mount = env.service.mount_for("/mnt/demo").unwrap();
        let readme = mount
            .inodes()
            .resolve(&RelativePath::new("README.md").unwrap())
            .unwrap();
        mount.inodes().materialize_for_write(&readme, false).unwrap();
        assert!(*seen.lock() >= 1);
    }

    #[test]
    fn test_debug_verbs() {
        let env = test_env();
        env.service.mount("/mnt/demo", &env.client_dir).unwrap();

        // nothing cached yet: local-only lookups miss
        assert!(matches!(
            env.service
                .debug_get_scm_blob("/mnt/demo", &env.blob_id, true),
            Err(Error::ObjectNotFound(_))
        ));

        // a full fetch populates the cache
        let contents = env
            .service
            .debug_get_scm_blob("/mnt/demo", &env.blob_id, false)
            .unwrap();
        assert_eq!(&contents[..], b"hello service\n");
        assert!(env
            .service
            .debug_get_scm_blob("/mnt/demo", &env.blob_id, true)
            .is_ok());

        let tree = env
            .service
            .debug_get_scm_tree("/mnt/demo", &env.tree_id, false)
            .unwrap();
        assert_eq!(tree.len(), 2);

        let metadata = env
            .service
            .debug_get_scm_blob_metadata("/mnt/demo", &env.blob_id, false)
            .unwrap();
        assert_eq!(metadata.size, 14);

        let entries = env.service.debug_inode_status("/mnt/demo", "").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].materialized);
    }

    #[test]
    fn test_shutdown() {
        let env = test_env();
        env.service.mount("/mnt/demo", &env.client_dir).unwrap();
        assert!(env.service.is_running());

        env.service.shutdown();
        assert!(!env.service.is_running());
        assert!(env.service.list_mounts().is_empty());
    }
}
