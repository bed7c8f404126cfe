mod manager;

pub use manager::InodeManager;

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::hash::Hash;
use crate::model::Blob;
use crate::path::PathComponent;

pub type InodeId = u64;

/// the root inode; its parent is itself
pub const ROOT_INODE_ID: InodeId = 1;

/// back-reference to the parent, for path reconstruction
///
/// the root carries no name and points at itself.
#[derive(Clone, Debug)]
pub struct InodeParent {
    pub id: InodeId,
    pub name: Option<PathComponent>,
}

/// attributes common to file and directory inodes
pub struct InodeHeader {
    pub id: InodeId,
    pub parent: RwLock<InodeParent>,
}

/// a live inode: shared header plus a tagged file/directory body
pub struct Inode {
    pub header: InodeHeader,
    pub body: RwLock<InodeBody>,
}

pub enum InodeBody {
    File(FileState),
    Dir(DirState),
}

/// mutable state of a file inode
///
/// exactly one of `source` (unmaterialized, blob hash) and `file`
/// (materialized, open overlay handle) is set.
pub struct FileState {
    pub mode: u32,
    pub creation_time: SystemTime,
    pub source: Option<Hash>,
    pub file: Option<File>,
    /// whether the sha1 xattr on the overlay file is trustworthy
    pub sha1_valid: bool,
    /// cached blob for an unmaterialized file
    pub blob: Option<Arc<Blob>>,
}

/// one name in a directory inode's listing
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// allocated lazily when the child inode is first created
    pub inode_id: Option<InodeId>,
    /// source-store hash; `None` once the child is materialized
    pub hash: Option<Hash>,
    pub mode: u32,
}

/// mutable state of a directory inode
///
/// exactly one of `source` (unmaterialized, tree hash) and a persisted
/// overlay listing (`materialized`) backs the entries.
pub struct DirState {
    pub mode: u32,
    pub creation_time: SystemTime,
    pub source: Option<Hash>,
    pub materialized: bool,
    /// in-memory listing, loaded on demand from the tree or the overlay
    pub entries: Option<BTreeMap<PathComponent, DirEntry>>,
}

impl Inode {
    pub fn id(&self) -> InodeId {
        self.header.id
    }

    pub fn is_dir(&self) -> bool {
        matches!(&*self.body.read(), InodeBody::Dir(_))
    }

    /// file-type bits say this is a symlink
    pub fn is_symlink(&self) -> bool {
        match &*self.body.read() {
            InodeBody::File(file) => file.mode & 0o170000 == 0o120000,
            InodeBody::Dir(_) => false,
        }
    }

    pub fn is_regular_file(&self) -> bool {
        match &*self.body.read() {
            InodeBody::File(file) => file.mode & 0o170000 == 0o100000,
            InodeBody::Dir(_) => false,
        }
    }

    /// whether local state (overlay) backs this inode
    pub fn is_materialized(&self) -> bool {
        match &*self.body.read() {
            InodeBody::File(file) => file.file.is_some(),
            InodeBody::Dir(dir) => dir.materialized,
        }
    }
}

/// result of `getattr`
#[derive(Clone, Copy, Debug)]
pub struct InodeAttr {
    pub mode: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub nlink: u32,
}

/// a time change requested through `setattr`
#[derive(Clone, Copy, Debug)]
pub enum TimeUpdate {
    Now,
    At(SystemTime),
}

/// changes requested through `setattr`; unset fields are preserved
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<TimeUpdate>,
    pub mtime: Option<TimeUpdate>,
}
