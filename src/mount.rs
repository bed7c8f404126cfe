//! a mounted client: object store, overlay, inode tree, journal and
//! dirstate for one checkout

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::checkout::{run_checkout, CheckoutConflict};
use crate::config::BindMount;
use crate::dirstate::{compute_status, Dirstate, ScmError, StatusCode};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::inode::InodeManager;
use crate::journal::{Journal, JournalPosition, JournalRange, SubscriberId};
use crate::overlay::Overlay;
use crate::path::{AbsolutePath, RelativePath};
use crate::store::ObjectStore;
use crate::util::CancellationToken;

static NEXT_MOUNT_SLOT: AtomicU64 = AtomicU64::new(1);

/// a 64-bit value that changes on every mount, so journal cursors from an
/// earlier mount are detectably stale
fn next_mount_generation() -> u64 {
    let slot = NEXT_MOUNT_SLOT.fetch_add(1, Ordering::SeqCst);
    ((std::process::id() as u64) << 32) | (slot & 0xffff_ffff)
}

/// batch stat result for the request surface
#[derive(Clone, Copy, Debug)]
pub struct FileInformation {
    pub size: u64,
    pub mode: u32,
    pub mtime: SystemTime,
}

pub struct Mount {
    mount_path: AbsolutePath,
    overlay: Arc<Overlay>,
    store: Arc<ObjectStore>,
    inodes: Arc<InodeManager>,
    journal: Arc<Journal>,
    dirstate: Mutex<Dirstate>,
    snapshot: Arc<RwLock<Hash>>,
    /// serializes snapshot transitions (checkout, reset, mark-committed)
    transition_lock: Mutex<()>,
    bind_mounts: Vec<BindMount>,
}

impl Mount {
    /// open a client directory whose `SNAPSHOT` already names a commit
    pub fn open(
        mount_path: AbsolutePath,
        client_dir: &Path,
        store: Arc<ObjectStore>,
        bind_mounts: Vec<BindMount>,
    ) -> Result<Arc<Mount>> {
        let overlay = Arc::new(Overlay::open(client_dir)?);
        let commit = overlay.read_snapshot()?;
        Self::build(mount_path, overlay, store, bind_mounts, commit)
    }

    /// set up a fresh client directory at `commit` and open it
    pub fn clone_initial(
        mount_path: AbsolutePath,
        client_dir: &Path,
        store: Arc<ObjectStore>,
        commit: Hash,
    ) -> Result<Arc<Mount>> {
        let overlay = Arc::new(Overlay::open(client_dir)?);
        overlay.write_snapshot(&commit)?;
        let mount = Self::build(mount_path, overlay, store, Vec::new(), commit)?;
        mount.overlay.mark_clone_succeeded()?;
        Ok(mount)
    }

    fn build(
        mount_path: AbsolutePath,
        overlay: Arc<Overlay>,
        store: Arc<ObjectStore>,
        bind_mounts: Vec<BindMount>,
        commit: Hash,
    ) -> Result<Arc<Mount>> {
        let journal = Arc::new(Journal::new(next_mount_generation()));
        let snapshot = Arc::new(RwLock::new(commit));
        let inodes = Arc::new(InodeManager::new(
            store.clone(),
            overlay.clone(),
            journal.clone(),
            snapshot.clone(),
            commit,
        )?);
        let dirstate = Mutex::new(Dirstate::load(&overlay.dirstate_path())?);

        info!(mount = %mount_path, commit = %commit, "mount ready");
        Ok(Arc::new(Mount {
            mount_path,
            overlay,
            store,
            inodes,
            journal,
            dirstate,
            snapshot,
            transition_lock: Mutex::new(()),
            bind_mounts,
        }))
    }

    pub fn mount_path(&self) -> &AbsolutePath {
        &self.mount_path
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn inodes(&self) -> &Arc<InodeManager> {
        &self.inodes
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn bind_mounts(&self) -> &[BindMount] {
        &self.bind_mounts
    }

    pub fn current_snapshot(&self) -> Hash {
        *self.snapshot.read()
    }

    /// sentinel marking the initial clone of this client as complete
    pub fn ensure_clone_marked(&self) -> Result<bool> {
        if self.overlay.clone_succeeded() {
            return Ok(false);
        }
        self.overlay.mark_clone_succeeded()?;
        Ok(true)
    }

    // --- snapshot transitions ---

    /// reconcile the mount onto `commit`
    ///
    /// without `force`, conflicts abort the checkout and the snapshot and
    /// overlay stay untouched. with `force`, conflicting paths are
    /// overwritten and the conflicts are still reported.
    pub fn checkout(
        &self,
        commit: Hash,
        force: bool,
        token: &CancellationToken,
    ) -> Result<Vec<CheckoutConflict>> {
        let _guard = self.transition_lock.lock();
        let old = *self.snapshot.read();
        if old == commit {
            return Ok(Vec::new());
        }

        let outcome = run_checkout(&self.inodes, old, commit, force, token)?;
        if outcome.applied {
            self.overlay.write_snapshot(&commit)?;
            *self.snapshot.write() = commit;
            self.journal.record(old, commit, outcome.changed_paths);
            info!(from = %old, to = %commit, "checkout complete");
        }
        Ok(outcome.conflicts)
    }

    /// move the snapshot pointer without reconciling file state
    pub fn reset_parent(&self, commit: Hash) -> Result<()> {
        let _guard = self.transition_lock.lock();
        let old = *self.snapshot.read();
        self.overlay.write_snapshot(&commit)?;
        *self.snapshot.write() = commit;
        self.journal.record(old, commit, Default::default());
        Ok(())
    }

    // --- file queries ---

    /// content SHA-1 of a regular file; symlinks are refused
    pub fn get_sha1(&self, path: &RelativePath) -> Result<Hash> {
        let inode = self.inodes.resolve(path)?;
        if !inode.is_regular_file() {
            return Err(Error::InvalidArgument(format!(
                "{}: file is a symlink or directory",
                path
            )));
        }
        self.inodes.sha1(&inode)
    }

    pub fn get_file_information(&self, path: &RelativePath) -> Result<FileInformation> {
        let inode = self.inodes.resolve(path)?;
        let attr = self.inodes.getattr(&inode)?;
        Ok(FileInformation {
            size: attr.size,
            mode: attr.mode,
            mtime: attr.mtime,
        })
    }

    // --- journal ---

    pub fn journal_position(&self) -> JournalPosition {
        self.journal.position()
    }

    pub fn changes_since(&self, cursor: &JournalPosition) -> Result<JournalRange> {
        self.journal.changes_since(cursor)
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&Arc<crate::journal::JournalDelta>) -> bool + Send + Sync + 'static,
    ) -> SubscriberId {
        self.journal.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.journal.unsubscribe(id);
    }

    // --- dirstate ---

    pub fn scm_status(
        &self,
        list_ignored: bool,
        token: &CancellationToken,
    ) -> Result<BTreeMap<RelativePath, StatusCode>> {
        let root_tree = self.current_snapshot();
        let dirstate = self.dirstate.lock();
        compute_status(
            &self.inodes,
            &self.store,
            &root_tree,
            dirstate.directives(),
            list_ignored,
            token,
        )
    }

    pub fn scm_add(&self, paths: &[RelativePath]) -> Result<Vec<ScmError>> {
        self.dirstate.lock().add(&self.inodes, paths)
    }

    pub fn scm_remove(&self, paths: &[RelativePath], force: bool) -> Result<Vec<ScmError>> {
        let root_tree = self.current_snapshot();
        self.dirstate
            .lock()
            .remove(&self.inodes, &self.store, &root_tree, paths, force)
    }

    /// record a commit: move the snapshot and clear the named directives
    pub fn scm_mark_committed(
        &self,
        commit: Hash,
        paths_to_clean: &[RelativePath],
        paths_to_drop: &[RelativePath],
    ) -> Result<()> {
        let _guard = self.transition_lock.lock();
        let old = *self.snapshot.read();
        self.overlay.write_snapshot(&commit)?;
        *self.snapshot.write() = commit;
        self.dirstate
            .lock()
            .mark_committed(paths_to_clean, paths_to_drop)?;
        self.journal.record(old, commit, Default::default());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::ConflictType;
    use crate::dirstate::Directive;
    use crate::model::{serialize_tree, FileType, TreeEntry};
    use crate::path::PathComponent;
    use crate::store::{LocalStore, MemoryBackingStore};
    use tempfile::tempdir;

    struct Env {
        _dir: tempfile::TempDir,
        backing: Arc<MemoryBackingStore>,
        mount: Arc<Mount>,
        commit1: Hash,
        commit2: Hash,
    }

    fn entry(name: &str, hash: Hash, file_type: FileType, perms: u8) -> TreeEntry {
        TreeEntry::new(PathComponent::new(name).unwrap(), hash, file_type, perms)
    }

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    /// commit1:                      commit2:
    ///   f          "one\n"            f          "two\n"
    ///   stable.txt "same\n"           stable.txt "same\n"
    ///   dir/keep   "keep\n"           dir/keep   "keep\n"
    ///                                 added.txt  "fresh\n"
    fn test_env() -> Env {
        let dir = tempdir().unwrap();
        let backing = Arc::new(MemoryBackingStore::new());

        let blob_one = Hash::sha1_of(b"id-one");
        backing.put_blob(blob_one, &b"one\n"[..]);
        let blob_two = Hash::sha1_of(b"id-two");
        backing.put_blob(blob_two, &b"two\n"[..]);
        let blob_same = Hash::sha1_of(b"id-same");
        backing.put_blob(blob_same, &b"same\n"[..]);
        let blob_keep = Hash::sha1_of(b"id-keep");
        backing.put_blob(blob_keep, &b"keep\n"[..]);
        let blob_fresh = Hash::sha1_of(b"id-fresh");
        backing.put_blob(blob_fresh, &b"fresh\n"[..]);

        let dir_tree = backing.put_tree_object(serialize_tree(&[entry(
            "keep",
            blob_keep,
            FileType::Regular,
            0b110,
        )]));
        let commit1 = backing.put_tree_object(serialize_tree(&[
            entry("dir", dir_tree, FileType::Directory, 0b111),
            entry("f", blob_one, FileType::Regular, 0b110),
            entry("stable.txt", blob_same, FileType::Regular, 0b110),
        ]));
        let commit2 = backing.put_tree_object(serialize_tree(&[
            entry("added.txt", blob_fresh, FileType::Regular, 0b110),
            entry("dir", dir_tree, FileType::Directory, 0b111),
            entry("f", blob_two, FileType::Regular, 0b110),
            entry("stable.txt", blob_same, FileType::Regular, 0b110),
        ]));

        let local = Arc::new(LocalStore::open(&dir.path().join("local-store")).unwrap());
        let store = Arc::new(ObjectStore::new(local, backing.clone()));
        let mount = Mount::clone_initial(
            AbsolutePath::new("/mnt/repo").unwrap(),
            &dir.path().join("client"),
            store,
            commit1,
        )
        .unwrap();

        Env {
            _dir: dir,
            backing,
            mount,
            commit1,
            commit2,
        }
    }

    fn modify(env: &Env, path: &str, contents: &[u8]) {
        let inode = env.mount.inodes().resolve(&rel(path)).unwrap();
        env.mount
            .inodes()
            .materialize_for_write(&inode, true)
            .unwrap();
        env.mount.inodes().write(&inode, 0, contents).unwrap();
    }

    #[test]
    fn test_clean_checkout_swaps_and_journals() {
        let env = test_env();
        let token = CancellationToken::new();

        let conflicts = env.mount.checkout(env.commit2, false, &token).unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(env.mount.current_snapshot(), env.commit2);
        assert_eq!(env.mount.overlay().read_snapshot().unwrap(), env.commit2);

        let delta = env.mount.journal().latest().unwrap();
        assert_eq!(delta.from_hash, env.commit1);
        assert_eq!(delta.to_hash, env.commit2);
        assert!(delta.changed_paths.contains(&rel("f")));
        assert!(delta.changed_paths.contains(&rel("added.txt")));
        assert!(!delta.changed_paths.contains(&rel("stable.txt")));

        // the new contents are visible
        let f = env.mount.inodes().resolve(&rel("f")).unwrap();
        assert_eq!(&env.mount.inodes().read(&f, 0, 16).unwrap()[..], b"two\n");
        assert!(env.mount.inodes().resolve(&rel("added.txt")).is_ok());
    }

    #[test]
    fn test_modification_blocks_checkout() {
        let env = test_env();
        let token = CancellationToken::new();
        modify(&env, "f", b"local edit\n");

        let conflicts = env.mount.checkout(env.commit2, false, &token).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, rel("f"));
        assert_eq!(
            conflicts[0].conflict_type,
            ConflictType::ModifiedBlocksCheckout
        );

        // snapshot and overlay are untouched
        assert_eq!(env.mount.current_snapshot(), env.commit1);
        assert_eq!(env.mount.overlay().read_snapshot().unwrap(), env.commit1);
        let f = env.mount.inodes().resolve(&rel("f")).unwrap();
        assert_eq!(
            &env.mount.inodes().read(&f, 0, 32).unwrap()[..],
            b"local edit\n"
        );
    }

    #[test]
    fn test_force_checkout_overwrites_and_still_reports() {
        let env = test_env();
        let token = CancellationToken::new();
        modify(&env, "f", b"local edit\n");
        let f_id = env.mount.inodes().resolve(&rel("f")).unwrap().id();

        let conflicts = env.mount.checkout(env.commit2, true, &token).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            conflicts[0].conflict_type,
            ConflictType::ModifiedBlocksCheckout
        );

        assert_eq!(env.mount.current_snapshot(), env.commit2);
        let delta = env.mount.journal().latest().unwrap();
        assert_eq!(delta.to_hash, env.commit2);
        assert!(delta.changed_paths.contains(&rel("f")));

        // the local copy was replaced by the new commit's contents
        assert!(!env.mount.overlay().has_entry(f_id));
        let f = env.mount.inodes().resolve(&rel("f")).unwrap();
        assert_eq!(&env.mount.inodes().read(&f, 0, 16).unwrap()[..], b"two\n");
    }

    #[test]
    fn test_unmodified_materialized_file_is_replaced() {
        let env = test_env();
        let token = CancellationToken::new();

        // materialize without changing content
        let f = env.mount.inodes().resolve(&rel("f")).unwrap();
        env.mount.inodes().materialize_for_write(&f, false).unwrap();
        let f_id = f.id();
        assert!(env.mount.overlay().has_entry(f_id));

        let conflicts = env.mount.checkout(env.commit2, false, &token).unwrap();
        assert!(conflicts.is_empty());

        // overlay copy dropped, content now tracks the new commit
        assert!(!env.mount.overlay().has_entry(f_id));
        let f = env.mount.inodes().resolve(&rel("f")).unwrap();
        assert_eq!(&env.mount.inodes().read(&f, 0, 16).unwrap()[..], b"two\n");
    }

    #[test]
    fn test_untracked_file_conflicts_with_new_entry() {
        let env = test_env();
        let token = CancellationToken::new();

        // drop an untracked file where commit2 wants added.txt
        let root = env.mount.inodes().root();
        {
            // force the root listing to know about the untracked name
            let hello = env.mount.inodes().resolve(&rel("f")).unwrap();
            env.mount
                .inodes()
                .materialize_for_write(&hello, false)
                .unwrap();
        }
        let untracked_id = {
            let mut body = root.body.write();
            let crate::inode::InodeBody::Dir(dir) = &mut *body else {
                panic!("root is a directory")
            };
            let id = env.mount.inodes().alloc_id();
            let entries = dir.entries.as_mut().unwrap();
            entries.insert(
                PathComponent::new("added.txt").unwrap(),
                crate::inode::DirEntry {
                    inode_id: Some(id),
                    hash: None,
                    mode: 0o100644,
                },
            );
            env.mount
                .inodes()
                .persist_dir_entries(root.id(), entries)
                .unwrap();
            id
        };
        std::fs::write(env.mount.overlay().file_path(untracked_id), b"mine\n").unwrap();

        let conflicts = env.mount.checkout(env.commit2, false, &token).unwrap();
        let untracked: Vec<_> = conflicts
            .iter()
            .filter(|c| c.conflict_type == ConflictType::Untracked)
            .collect();
        assert_eq!(untracked.len(), 1);
        assert_eq!(untracked[0].path, rel("added.txt"));
        assert_eq!(env.mount.current_snapshot(), env.commit1);

        // force replaces the untracked file
        let conflicts = env.mount.checkout(env.commit2, true, &token).unwrap();
        assert!(!conflicts.is_empty());
        let added = env.mount.inodes().resolve(&rel("added.txt")).unwrap();
        assert_eq!(
            &env.mount.inodes().read(&added, 0, 16).unwrap()[..],
            b"fresh\n"
        );
    }

    #[test]
    fn test_checkout_honors_cancellation() {
        let env = test_env();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            env.mount.checkout(env.commit2, false, &token),
            Err(Error::Cancelled)
        ));
        assert_eq!(env.mount.current_snapshot(), env.commit1);
    }

    #[test]
    fn test_checkout_to_same_commit_is_a_noop() {
        let env = test_env();
        let token = CancellationToken::new();
        let conflicts = env.mount.checkout(env.commit1, false, &token).unwrap();
        assert!(conflicts.is_empty());
        assert!(env.mount.journal().latest().is_none());
    }

    #[test]
    fn test_reset_parent_moves_pointer_only() {
        let env = test_env();
        modify(&env, "f", b"kept across reset\n");

        env.mount.reset_parent(env.commit2).unwrap();
        assert_eq!(env.mount.current_snapshot(), env.commit2);

        // the modified file is untouched
        let f = env.mount.inodes().resolve(&rel("f")).unwrap();
        assert_eq!(
            &env.mount.inodes().read(&f, 0, 32).unwrap()[..],
            b"kept across reset\n"
        );
        let delta = env.mount.journal().latest().unwrap();
        assert_eq!(delta.from_hash, env.commit1);
        assert_eq!(delta.to_hash, env.commit2);
        assert!(delta.changed_paths.is_empty());
    }

    #[test]
    fn test_get_sha1_refuses_symlinks() {
        let dir = tempdir().unwrap();
        let backing = Arc::new(MemoryBackingStore::new());
        let blob = Hash::sha1_of(b"id");
        backing.put_blob(blob, &b"x\n"[..]);
        let link = Hash::sha1_of(b"id-link");
        backing.put_blob(link, &b"target"[..]);
        let commit = backing.put_tree_object(serialize_tree(&[
            entry("file", blob, FileType::Regular, 0b110),
            entry("link", link, FileType::Symlink, 0b111),
        ]));

        let local = Arc::new(LocalStore::open(&dir.path().join("ls")).unwrap());
        let store = Arc::new(ObjectStore::new(local, backing));
        let mount = Mount::clone_initial(
            AbsolutePath::new("/mnt/x").unwrap(),
            &dir.path().join("client"),
            store,
            commit,
        )
        .unwrap();

        assert_eq!(mount.get_sha1(&rel("file")).unwrap(), Hash::sha1_of(b"x\n"));
        assert!(matches!(
            mount.get_sha1(&rel("link")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_status_reports_modified_and_missing() {
        let env = test_env();
        let token = CancellationToken::new();
        modify(&env, "f", b"changed\n");

        let status = env.mount.scm_status(false, &token).unwrap();
        assert_eq!(status.get(&rel("f")), Some(&StatusCode::Modified));
        assert_eq!(status.get(&rel("stable.txt")), None);

        // user stages a removal of a clean file
        let errors = env.mount.scm_remove(&[rel("stable.txt")], false).unwrap();
        assert!(errors.is_empty());
        let status = env.mount.scm_status(false, &token).unwrap();
        assert_eq!(status.get(&rel("stable.txt")), Some(&StatusCode::Removed));
    }

    #[test]
    fn test_scm_remove_refuses_modified_without_force() {
        let env = test_env();
        modify(&env, "f", b"changed\n");

        let errors = env.mount.scm_remove(&[rel("f")], false).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, rel("f"));

        let errors = env.mount.scm_remove(&[rel("f")], true).unwrap();
        assert!(errors.is_empty());
    }

    #[test]
    fn test_scm_add_untracked_file() {
        let env = test_env();
        let token = CancellationToken::new();

        // errors are per-path
        let errors = env
            .mount
            .scm_add(&[rel("no-such-file"), rel("stable.txt")])
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, rel("no-such-file"));

        // an untracked file shows Added once staged
        let untracked = make_untracked(&env, "scratch.txt", b"scratch\n");
        let status = env.mount.scm_status(false, &token).unwrap();
        assert_eq!(status.get(&untracked), Some(&StatusCode::NotTracked));

        env.mount.scm_add(&[untracked.clone()]).unwrap();
        let status = env.mount.scm_status(false, &token).unwrap();
        assert_eq!(status.get(&untracked), Some(&StatusCode::Added));
    }

    /// plant an untracked file directly in the root listing
    fn make_untracked(env: &Env, name: &str, contents: &[u8]) -> RelativePath {
        let probe = env.mount.inodes().resolve(&rel("f")).unwrap();
        env.mount
            .inodes()
            .materialize_for_write(&probe, false)
            .unwrap();

        let root = env.mount.inodes().root();
        let id = {
            let mut body = root.body.write();
            let crate::inode::InodeBody::Dir(dir) = &mut *body else {
                panic!("root is a directory")
            };
            let id = env.mount.inodes().alloc_id();
            let entries = dir.entries.as_mut().unwrap();
            entries.insert(
                PathComponent::new(name).unwrap(),
                crate::inode::DirEntry {
                    inode_id: Some(id),
                    hash: None,
                    mode: 0o100644,
                },
            );
            env.mount
                .inodes()
                .persist_dir_entries(root.id(), entries)
                .unwrap();
            id
        };
        std::fs::write(env.mount.overlay().file_path(id), contents).unwrap();
        rel(name)
    }

    #[test]
    fn test_mark_committed_clears_and_moves() {
        let env = test_env();
        env.mount.scm_remove(&[rel("stable.txt")], false).unwrap();

        env.mount
            .scm_mark_committed(env.commit2, &[rel("stable.txt")], &[])
            .unwrap();
        assert_eq!(env.mount.current_snapshot(), env.commit2);
        assert!(env
            .mount
            .dirstate
            .lock()
            .directives()
            .get(&rel("stable.txt"))
            .is_none());
    }

    #[test]
    fn test_dirstate_survives_reopen() {
        let env = test_env();
        env.mount.scm_remove(&[rel("stable.txt")], false).unwrap();
        let client_dir = env.mount.overlay().client_dir().to_path_buf();

        let local = Arc::new(
            LocalStore::open(&env._dir.path().join("local-store-2")).unwrap(),
        );
        let store = Arc::new(ObjectStore::new(local, env.backing.clone()));
        let reopened = Mount::open(
            AbsolutePath::new("/mnt/repo").unwrap(),
            &client_dir,
            store,
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            reopened.dirstate.lock().directives().get(&rel("stable.txt")),
            Some(&Directive::Remove)
        );
        // a reopened mount gets a fresh journal generation
        assert_ne!(
            reopened.journal().generation(),
            env.mount.journal().generation()
        );
    }
}
