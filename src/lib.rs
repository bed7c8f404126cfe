//! mirage - a user-space virtual filesystem over source control
//!
//! projects a commit as a live, writable directory tree. reads come out of
//! a content-addressed object store; local modifications land in a
//! per-mount overlay without touching the original objects. a journal
//! records every inode-visible mutation for subscribers, and a dirstate
//! tracks what the user has staged for the next commit.
//!
//! # Core concepts
//!
//! - **Blob / Tree**: immutable objects fetched by hash from a backing
//!   store, cached write-through in a local store
//! - **Inode**: an on-demand materialization of a tree entry; switches
//!   from hash-backed to overlay-backed on first write
//! - **Overlay**: on-disk home of locally-modified file contents and
//!   directory listings, keyed by inode id
//! - **Checkout**: three-way reconciliation of the inode tree against a
//!   new commit, reporting conflicts instead of losing local edits
//! - **Privileged helper**: a forked subprocess that performs the mount
//!   syscalls so the main process can drop privileges
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mirage::{
//!     AbsolutePath, Hash, LocalStore, MemoryBackingStore, Mount, ObjectStore,
//! };
//!
//! let backing = Arc::new(MemoryBackingStore::new());
//! let local = Arc::new(LocalStore::open(std::path::Path::new("/var/cache/mirage")).unwrap());
//! let store = Arc::new(ObjectStore::new(local, backing));
//!
//! let commit = Hash::from_hex("8e073e366ed82de6465d1209d3f07da7eebabb93").unwrap();
//! let mount = Mount::clone_initial(
//!     AbsolutePath::new("/mnt/repo").unwrap(),
//!     std::path::Path::new("/var/lib/mirage/clients/repo"),
//!     store,
//!     commit,
//! )
//! .unwrap();
//! println!("mounted at {}", mount.mount_path());
//! ```

mod checkout;
mod config;
mod error;
mod hash;
mod journal;
mod model;
mod mount;
mod overlay;
mod path;
mod service;
mod util;

pub mod dirstate;
pub mod inode;
pub mod privhelper;
pub mod store;

pub use checkout::{CheckoutConflict, ConflictType};
pub use config::{BindMount, ClientConfig, ConfigData};
pub use error::{Error, IoResultExt, Result};
pub use hash::{Hash, StreamingSha1, HASH_LEN};
pub use journal::{Journal, JournalDelta, JournalPosition, JournalRange, SubscriberId};
pub use model::{deserialize_tree, serialize_tree, Blob, FileType, Tree, TreeEntry};
pub use mount::{FileInformation, Mount};
pub use overlay::{Overlay, OverlayDir, OverlayDirEntry, SHA1_XATTR};
pub use path::{AbsolutePath, PathComponent, RelativePath};
pub use service::{BackingStoreFactory, FsService, InodeDebugEntry};
pub use store::{BackingStore, BlobMetadata, LocalStore, MemoryBackingStore, ObjectStore};
pub use util::{CancellationToken, Deferred, Promise};

pub use dirstate::{Directive, Dirstate, GitIgnore, GitIgnorePattern, MatchResult, StatusCode};
pub use inode::{InodeAttr, InodeId, InodeManager, SetAttr, TimeUpdate, ROOT_INODE_ID};
pub use privhelper::{start_priv_helper, PrivHelperClient, PrivHelperServer};
