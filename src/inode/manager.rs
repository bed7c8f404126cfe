use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, FileTimes};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{Hash, StreamingSha1};
use crate::inode::{
    DirEntry, DirState, FileState, Inode, InodeAttr, InodeBody, InodeHeader, InodeId, InodeParent,
    SetAttr, TimeUpdate, ROOT_INODE_ID,
};
use crate::journal::Journal;
use crate::overlay::{Overlay, OverlayDir, OverlayDirEntry};
use crate::path::{PathComponent, RelativePath};
use crate::store::ObjectStore;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// owns every live inode of a mount, indexed by id
///
/// inodes are created lazily: the root always exists, children appear when
/// first listed or resolved. materialized overlay state is keyed by inode
/// id and survives eviction.
pub struct InodeManager {
    store: Arc<ObjectStore>,
    overlay: Arc<Overlay>,
    journal: Arc<Journal>,
    snapshot: Arc<RwLock<Hash>>,
    inodes: Mutex<HashMap<InodeId, Arc<Inode>>>,
    next_id: AtomicU64,
}

impl InodeManager {
    pub fn new(
        store: Arc<ObjectStore>,
        overlay: Arc<Overlay>,
        journal: Arc<Journal>,
        snapshot: Arc<RwLock<Hash>>,
        root_tree: Hash,
    ) -> Result<Self> {
        let next_id = overlay.max_inode_id()?.max(ROOT_INODE_ID) + 1;
        let root_materialized = overlay.has_entry(ROOT_INODE_ID);

        let root = Arc::new(Inode {
            header: InodeHeader {
                id: ROOT_INODE_ID,
                parent: RwLock::new(InodeParent {
                    id: ROOT_INODE_ID,
                    name: None,
                }),
            },
            body: RwLock::new(InodeBody::Dir(DirState {
                mode: S_IFDIR | 0o755,
                creation_time: SystemTime::now(),
                source: (!root_materialized).then_some(root_tree),
                materialized: root_materialized,
                entries: None,
            })),
        });

        let mut inodes = HashMap::new();
        inodes.insert(ROOT_INODE_ID, root);

        Ok(Self {
            store,
            overlay,
            journal,
            snapshot,
            inodes: Mutex::new(inodes),
            next_id: AtomicU64::new(next_id),
        })
    }

    pub fn root(&self) -> Arc<Inode> {
        self.get(ROOT_INODE_ID).expect("root inode always present")
    }

    pub fn get(&self, id: InodeId) -> Option<Arc<Inode>> {
        self.inodes.lock().get(&id).cloned()
    }

    pub(crate) fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub(crate) fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub(crate) fn alloc_id(&self) -> InodeId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// drop an inode and its in-memory descendants from the arena
    pub(crate) fn forget_subtree(&self, id: InodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let inode = match self.inodes.lock().remove(&current) {
                Some(inode) => inode,
                None => continue,
            };
            if let InodeBody::Dir(dir) = &*inode.body.read() {
                if let Some(entries) = &dir.entries {
                    stack.extend(entries.values().filter_map(|e| e.inode_id));
                }
            };
        }
    }

    // --- resolution ---

    /// walk `path` from the root, loading directories on demand
    pub fn resolve(&self, path: &RelativePath) -> Result<Arc<Inode>> {
        let mut current = self.root();
        for component in path.components() {
            current = self.child(&current, component).map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(path.to_string()),
                other => other,
            })?;
        }
        Ok(current)
    }

    /// look up (and instantiate if needed) a named child of a directory
    pub fn child(&self, parent: &Arc<Inode>, name: &str) -> Result<Arc<Inode>> {
        self.ensure_dir_loaded(parent)?;

        {
            let body = parent.body.read();
            let dir = as_dir(&body)?;
            let entries = dir.entries.as_ref().expect("loaded above");
            let entry = entries
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if let Some(id) = entry.inode_id {
                if let Some(inode) = self.get(id) {
                    return Ok(inode);
                }
            }
        }

        let mut body = parent.body.write();
        let dir = as_dir_mut(&mut body)?;
        let entries = dir.entries.as_mut().expect("loaded above");
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if let Some(id) = entry.inode_id {
            if let Some(inode) = self.get(id) {
                return Ok(inode);
            }
        }
        let id = match entry.inode_id {
            Some(id) => id,
            None => {
                let id = self.alloc_id();
                entry.inode_id = Some(id);
                id
            }
        };
        let name = PathComponent::new(name)?;
        let inode = self.instantiate(id, parent.id(), name, entry)?;
        self.inodes.lock().insert(id, inode.clone());
        Ok(inode)
    }

    fn instantiate(
        &self,
        id: InodeId,
        parent_id: InodeId,
        name: PathComponent,
        entry: &DirEntry,
    ) -> Result<Arc<Inode>> {
        let header = InodeHeader {
            id,
            parent: RwLock::new(InodeParent {
                id: parent_id,
                name: Some(name),
            }),
        };
        let now = SystemTime::now();

        let body = if entry.mode & S_IFMT == S_IFDIR {
            InodeBody::Dir(DirState {
                mode: entry.mode,
                creation_time: now,
                source: entry.hash,
                materialized: entry.hash.is_none(),
                entries: None,
            })
        } else {
            // a materialized regular file keeps its overlay handle open;
            // materialized symlinks are read back by path
            let file = if entry.hash.is_none() && entry.mode & S_IFMT != 0o120000 {
                Some(self.overlay.open_file(id, false, false)?)
            } else {
                None
            };
            InodeBody::File(FileState {
                mode: entry.mode,
                creation_time: now,
                source: entry.hash,
                file,
                sha1_valid: false,
                blob: None,
            })
        };

        Ok(Arc::new(Inode {
            header,
            body: RwLock::new(body),
        }))
    }

    /// load a directory inode's listing from its tree or the overlay
    pub(crate) fn ensure_dir_loaded(&self, inode: &Arc<Inode>) -> Result<()> {
        loop {
            let (source, materialized) = {
                let body = inode.body.read();
                let dir = as_dir(&body)?;
                if dir.entries.is_some() {
                    return Ok(());
                }
                (dir.source, dir.materialized)
            };

            if let Some(hash) = source {
                // fetch outside the inode lock
                let tree = self.store.get_tree(&hash)?;
                let mut body = inode.body.write();
                let dir = as_dir_mut(&mut body)?;
                if dir.entries.is_some() {
                    return Ok(());
                }
                if dir.source != Some(hash) {
                    // swapped by a checkout while we fetched
                    continue;
                }
                let entries = tree
                    .entries()
                    .iter()
                    .map(|e| {
                        (
                            e.name.clone(),
                            DirEntry {
                                inode_id: None,
                                hash: Some(e.hash),
                                mode: e.mode(),
                            },
                        )
                    })
                    .collect();
                dir.entries = Some(entries);
                return Ok(());
            }

            if materialized {
                let listing = self.overlay.read_dir(inode.id())?;
                let mut body = inode.body.write();
                let dir = as_dir_mut(&mut body)?;
                if dir.entries.is_some() {
                    return Ok(());
                }
                let entries = listing
                    .into_iter()
                    .map(|(name, e)| {
                        (
                            name,
                            DirEntry {
                                inode_id: Some(e.inode_id),
                                hash: e.hash,
                                mode: e.mode,
                            },
                        )
                    })
                    .collect();
                dir.entries = Some(entries);
                return Ok(());
            }

            return Err(Error::Internal(format!(
                "directory inode {} has neither source tree nor overlay listing",
                inode.id()
            )));
        }
    }

    /// children of a directory, loading from the tree if unmaterialized
    pub fn list(&self, inode: &Arc<Inode>) -> Result<Vec<(PathComponent, DirEntry)>> {
        self.ensure_dir_loaded(inode)?;
        let body = inode.body.read();
        let dir = as_dir(&body)?;
        Ok(dir
            .entries
            .as_ref()
            .expect("loaded above")
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect())
    }

    /// reconstruct an inode's path from parent back-references
    pub fn path_of(&self, inode: &Arc<Inode>) -> Result<RelativePath> {
        let mut components = Vec::new();
        let mut current = inode.clone();
        while current.id() != ROOT_INODE_ID {
            let parent = current.header.parent.read().clone();
            let name = parent.name.ok_or_else(|| {
                Error::Internal(format!("non-root inode {} has no name", current.id()))
            })?;
            components.push(name);
            current = self.get(parent.id).ok_or_else(|| {
                Error::Internal(format!("parent inode {} evicted", parent.id))
            })?;
        }
        let mut path = RelativePath::root();
        for name in components.into_iter().rev() {
            path = path.join(&name);
        }
        Ok(path)
    }

    // --- attributes ---

    pub fn getattr(&self, inode: &Arc<Inode>) -> Result<InodeAttr> {
        let (mode, creation_time, handle_stat, source) = {
            let body = inode.body.read();
            match &*body {
                InodeBody::Dir(dir) => (dir.mode, dir.creation_time, None, None),
                InodeBody::File(file) => {
                    let stat = match &file.file {
                        Some(handle) => {
                            Some(handle.metadata().with_path(self.overlay.file_path(inode.id()))?)
                        }
                        None => None,
                    };
                    (file.mode, file.creation_time, stat, file.source)
                }
            }
        };

        if let Some(stat) = handle_stat {
            let mtime = stat.modified().unwrap_or(creation_time);
            let atime = stat.accessed().unwrap_or(mtime);
            return Ok(InodeAttr {
                mode,
                size: stat.len(),
                atime,
                mtime,
                ctime: mtime,
                nlink: 1,
            });
        }

        // unmaterialized: size comes from blob metadata, times from the
        // inode's creation
        let size = match source {
            Some(hash) => self.store.get_blob_metadata(&hash)?.size,
            None => 0,
        };
        Ok(InodeAttr {
            mode,
            size,
            atime: creation_time,
            mtime: creation_time,
            ctime: creation_time,
            nlink: 1,
        })
    }

    pub fn setattr(&self, inode: &Arc<Inode>, changes: SetAttr) -> Result<InodeAttr> {
        // ownership changes are refused unless they are a no-op
        if let Some(uid) = changes.uid {
            if uid != nix::unistd::geteuid().as_raw() {
                return Err(Error::PermissionDenied(
                    "changing the owner/group is not supported".to_string(),
                ));
            }
        }
        if let Some(gid) = changes.gid {
            if gid != nix::unistd::getegid().as_raw() {
                return Err(Error::PermissionDenied(
                    "changing the owner/group is not supported".to_string(),
                ));
            }
        }

        let touches_contents =
            changes.size.is_some() || changes.atime.is_some() || changes.mtime.is_some();
        if touches_contents {
            if inode.is_dir() {
                return Err(Error::InvalidArgument(
                    "cannot change size or times of a directory".to_string(),
                ));
            }
            self.materialize_for_write(inode, false)?;
        }

        {
            let mut body = inode.body.write();
            match &mut *body {
                InodeBody::File(state) => {
                    if let Some(size) = changes.size {
                        let file = state.file.as_ref().expect("materialized above");
                        file.set_len(size)
                            .with_path(self.overlay.file_path(inode.id()))?;
                        state.sha1_valid = false;
                    }
                    if changes.atime.is_some() || changes.mtime.is_some() {
                        let file = state.file.as_ref().expect("materialized above");
                        let mut times = FileTimes::new();
                        if let Some(atime) = changes.atime {
                            times = times.set_accessed(resolve_time(atime));
                        }
                        if let Some(mtime) = changes.mtime {
                            times = times.set_modified(resolve_time(mtime));
                        }
                        file.set_times(times)
                            .with_path(self.overlay.file_path(inode.id()))?;
                    }
                    if let Some(mode) = changes.mode {
                        // permission bits only; the file-type bits are kept
                        state.mode = (state.mode & S_IFMT) | (mode & 0o7777);
                    }
                }
                InodeBody::Dir(state) => {
                    if let Some(mode) = changes.mode {
                        state.mode = (state.mode & S_IFMT) | (mode & 0o7777);
                    }
                }
            }
        }

        self.record_change(inode);
        self.getattr(inode)
    }

    // --- file contents ---

    /// read file contents; reads past end return empty
    pub fn read(&self, inode: &Arc<Inode>, offset: u64, size: usize) -> Result<Bytes> {
        loop {
            let hash = {
                let body = inode.body.read();
                let state = as_file(&body)?;
                if let Some(file) = &state.file {
                    let buf = read_at(file, offset, size)
                        .with_path(self.overlay.file_path(inode.id()))?;
                    return Ok(Bytes::from(buf));
                }
                if let Some(blob) = &state.blob {
                    return Ok(blob.slice(offset, size));
                }
                state.source.ok_or_else(|| {
                    Error::Internal(format!("file inode {} has no source", inode.id()))
                })?
            };

            let blob = self.store.get_blob(&hash)?;
            let mut body = inode.body.write();
            if let InodeBody::File(state) = &mut *body {
                if state.file.is_none() && state.blob.is_none() && state.source == Some(hash) {
                    state.blob = Some(blob);
                }
            }
        }
    }

    /// whole file contents
    pub fn read_all(&self, inode: &Arc<Inode>) -> Result<Bytes> {
        let size = self.getattr(inode)?.size as usize;
        self.read(inode, 0, size)
    }

    /// write to a materialized file; fails with `InvalidArgument` otherwise
    pub fn write(&self, inode: &Arc<Inode>, offset: u64, data: &[u8]) -> Result<usize> {
        {
            let mut body = inode.body.write();
            let state = as_file_mut(&mut body)?;
            let file = state.file.as_ref().ok_or_else(|| {
                Error::InvalidArgument("file is not materialized for write".to_string())
            })?;
            state.sha1_valid = false;
            file.write_all_at(data, offset)
                .with_path(self.overlay.file_path(inode.id()))?;
        }
        self.record_change(inode);
        Ok(data.len())
    }

    /// copy blob contents into the overlay and switch the inode to
    /// materialized state; with `truncate` the overlay file starts empty
    ///
    /// the blob is fetched before the exclusive lock is taken; the state is
    /// re-checked under the lock so at most one materialization wins.
    pub fn materialize_for_write(&self, inode: &Arc<Inode>, truncate: bool) -> Result<()> {
        let mut became_materialized = false;

        if truncate {
            let mut body = inode.body.write();
            let state = as_file_mut(&mut body)?;
            match &state.file {
                Some(file) => {
                    file.set_len(0)
                        .with_path(self.overlay.file_path(inode.id()))?;
                }
                None => {
                    let file = self.overlay.open_file(inode.id(), true, true)?;
                    state.file = Some(file);
                    state.source = None;
                    state.blob = None;
                    became_materialized = true;
                }
            }
            let empty = Hash::sha1_of(b"");
            state.sha1_valid = self.overlay.set_sha1_xattr(inode.id(), &empty);
        } else {
            loop {
                let hash = {
                    let body = inode.body.read();
                    let state = as_file(&body)?;
                    if state.file.is_some() {
                        break;
                    }
                    state.source.ok_or_else(|| {
                        Error::Internal(format!("file inode {} has no source", inode.id()))
                    })?
                };

                // fetch outside the inode lock
                let blob = self.store.get_blob(&hash)?;
                let sha1 = self.store.get_sha1_for_blob(&hash)?;

                let mut body = inode.body.write();
                let state = as_file_mut(&mut body)?;
                if state.file.is_some() {
                    break;
                }
                if state.source != Some(hash) {
                    // swapped by a checkout while we fetched
                    continue;
                }
                let file = self.overlay.write_file(inode.id(), blob.contents())?;
                state.sha1_valid = self.overlay.set_sha1_xattr(inode.id(), &sha1);
                state.file = Some(file);
                state.source = None;
                state.blob = None;
                became_materialized = true;
                break;
            }
        }

        if became_materialized {
            self.materialize_parents(inode)?;
            self.record_change(inode);
        }
        Ok(())
    }

    /// propagate materialization to ancestor directories: the child's
    /// listing entry loses its hash and each not-yet-materialized ancestor
    /// gets its listing persisted
    fn materialize_parents(&self, inode: &Arc<Inode>) -> Result<()> {
        let mut current = inode.clone();
        while current.id() != ROOT_INODE_ID {
            let parent_ref = current.header.parent.read().clone();
            let parent = self.get(parent_ref.id).ok_or_else(|| {
                Error::Internal(format!("parent inode {} evicted", parent_ref.id))
            })?;
            self.ensure_dir_loaded(&parent)?;

            let newly_materialized = {
                let mut body = parent.body.write();
                let dir = as_dir_mut(&mut body)?;
                let entries = dir.entries.as_mut().expect("loaded above");
                for entry in entries.values_mut() {
                    if entry.inode_id == Some(current.id()) {
                        entry.hash = None;
                    }
                }
                let newly = !dir.materialized;
                dir.materialized = true;
                dir.source = None;
                self.persist_dir_entries(parent.id(), entries)?;
                newly
            };

            if !newly_materialized {
                break;
            }
            current = parent;
        }
        Ok(())
    }

    /// write a directory's listing to the overlay, allocating ids for
    /// children that never had one. caller holds the directory's lock.
    pub(crate) fn persist_dir_entries(
        &self,
        id: InodeId,
        entries: &mut BTreeMap<PathComponent, DirEntry>,
    ) -> Result<()> {
        for entry in entries.values_mut() {
            if entry.inode_id.is_none() {
                entry.inode_id = Some(self.alloc_id());
            }
        }
        let listing: OverlayDir = entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    OverlayDirEntry {
                        inode_id: entry.inode_id.expect("allocated above"),
                        hash: entry.hash,
                        mode: entry.mode,
                    },
                )
            })
            .collect();
        self.overlay.write_dir(id, &listing)
    }

    // --- sha1 ---

    /// content SHA-1 of a file inode
    ///
    /// materialized files use the stored xattr when valid and stream the
    /// overlay file otherwise; a failure to store the recomputed xattr is
    /// logged only and the digest is still returned.
    pub fn sha1(&self, inode: &Arc<Inode>) -> Result<Hash> {
        let source = {
            let mut body = inode.body.write();
            let state = as_file_mut(&mut body)?;
            match &state.file {
                Some(file) => {
                    if state.sha1_valid {
                        if let Some(stored) = self.overlay.get_sha1_xattr(inode.id()) {
                            return Ok(stored);
                        }
                    }
                    let digest = stream_sha1(file)
                        .with_path(self.overlay.file_path(inode.id()))?;
                    state.sha1_valid = self.overlay.set_sha1_xattr(inode.id(), &digest);
                    return Ok(digest);
                }
                None => state.source.ok_or_else(|| {
                    Error::Internal(format!("file inode {} has no source", inode.id()))
                })?,
            }
        };
        self.store.get_sha1_for_blob(&source)
    }

    /// refresh the stored sha1 if writes invalidated it
    pub fn flush(&self, inode: &Arc<Inode>) -> Result<()> {
        let mut body = inode.body.write();
        if let InodeBody::File(state) = &mut *body {
            if let Some(file) = &state.file {
                if !state.sha1_valid {
                    let digest = stream_sha1(file)
                        .with_path(self.overlay.file_path(inode.id()))?;
                    state.sha1_valid = self.overlay.set_sha1_xattr(inode.id(), &digest);
                }
            }
        }
        Ok(())
    }

    /// fsync the overlay file, then refresh the stored sha1
    pub fn fsync(&self, inode: &Arc<Inode>, datasync: bool) -> Result<()> {
        {
            let body = inode.body.read();
            if let InodeBody::File(state) = &*body {
                if let Some(file) = &state.file {
                    let result = if datasync {
                        file.sync_data()
                    } else {
                        file.sync_all()
                    };
                    result.with_path(self.overlay.file_path(inode.id()))?;
                }
            }
        }
        self.flush(inode)
    }

    // --- symlinks ---

    /// symlink target; for materialized links the readback is verified
    /// against the preceding lstat size
    pub fn readlink(&self, inode: &Arc<Inode>) -> Result<PathBuf> {
        if !inode.is_symlink() {
            return Err(Error::InvalidArgument(
                "not a symbolic link".to_string(),
            ));
        }

        let source = {
            let body = inode.body.read();
            let state = as_file(&body)?;
            state.source
        };

        match source {
            Some(hash) => {
                let blob = self.store.get_blob(&hash)?;
                let bytes = blob.contents().to_vec();
                Ok(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
            }
            None => {
                let path = self.overlay.file_path(inode.id());
                let stat = std::fs::symlink_metadata(&path).with_path(&path)?;
                let target = std::fs::read_link(&path).with_path(&path)?;
                if target.as_os_str().len() as u64 != stat.len() {
                    return Err(Error::Io {
                        path,
                        source: std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "symlink changed size during readback",
                        ),
                    });
                }
                Ok(target)
            }
        }
    }

    // --- extended attributes ---

    /// the only user-visible attribute is the content sha1 of regular files
    pub fn list_xattrs(&self, inode: &Arc<Inode>) -> Vec<String> {
        if inode.is_regular_file() {
            vec![crate::overlay::SHA1_XATTR.to_string()]
        } else {
            Vec::new()
        }
    }

    pub fn get_xattr(&self, inode: &Arc<Inode>, name: &str) -> Result<Vec<u8>> {
        if name != crate::overlay::SHA1_XATTR || !inode.is_regular_file() {
            return Err(Error::NotFound(format!("no attribute {}", name)));
        }
        Ok(self.sha1(inode)?.to_hex().into_bytes())
    }

    // --- journal ---

    fn record_change(&self, inode: &Arc<Inode>) {
        match self.path_of(inode) {
            Ok(path) => {
                let snapshot = *self.snapshot.read();
                self.journal
                    .record(snapshot, snapshot, HashSet::from([path]));
            }
            Err(e) => warn!(inode = inode.id(), error = %e, "cannot journal change"),
        }
    }
}

fn as_dir<'a>(body: &'a InodeBody) -> Result<&'a DirState> {
    match body {
        InodeBody::Dir(dir) => Ok(dir),
        InodeBody::File(_) => Err(Error::InvalidArgument("not a directory".to_string())),
    }
}

fn as_dir_mut<'a>(body: &'a mut InodeBody) -> Result<&'a mut DirState> {
    match body {
        InodeBody::Dir(dir) => Ok(dir),
        InodeBody::File(_) => Err(Error::InvalidArgument("not a directory".to_string())),
    }
}

fn as_file<'a>(body: &'a InodeBody) -> Result<&'a FileState> {
    match body {
        InodeBody::File(file) => Ok(file),
        InodeBody::Dir(_) => Err(Error::InvalidArgument("is a directory".to_string())),
    }
}

fn as_file_mut<'a>(body: &'a mut InodeBody) -> Result<&'a mut FileState> {
    match body {
        InodeBody::File(file) => Ok(file),
        InodeBody::Dir(_) => Err(Error::InvalidArgument("is a directory".to_string())),
    }
}

fn resolve_time(update: TimeUpdate) -> SystemTime {
    match update {
        TimeUpdate::Now => SystemTime::now(),
        TimeUpdate::At(time) => time,
    }
}

/// positional read that never moves the shared file offset
fn read_at(file: &File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// stream a file through SHA-1 using positional reads
fn stream_sha1(file: &File) -> std::io::Result<Hash> {
    let mut hasher = StreamingSha1::new();
    let mut buf = [0u8; 8192];
    let mut offset = 0u64;
    loop {
        let n = file.read_at(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok(hasher.finalize())
}
