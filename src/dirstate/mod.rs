//! user-staged add/remove directives and status computation

mod gitignore;

pub use gitignore::{GitIgnore, GitIgnorePattern, MatchResult};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::inode::{Inode, InodeManager};
use crate::model::{Tree, TreeEntry};
use crate::path::{PathComponent, RelativePath};
use crate::store::ObjectStore;
use crate::util::CancellationToken;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// a user-staged intent for the next commit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Add,
    Remove,
}

/// per-path status relative to the current snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Added,
    Removed,
    Modified,
    Missing,
    NotTracked,
    Ignored,
    Clean,
}

/// a per-path failure from `add`/`remove`
#[derive(Clone, Debug)]
pub struct ScmError {
    pub path: RelativePath,
    pub message: String,
}

/// staged directives, persisted compactly in the client directory
///
/// pure user intent: recording a directive never changes file contents.
pub struct Dirstate {
    storage_path: PathBuf,
    directives: BTreeMap<RelativePath, Directive>,
}

impl Dirstate {
    /// load from disk; an absent file is an empty dirstate
    pub fn load(storage_path: &Path) -> Result<Self> {
        let directives = match fs::read(storage_path) {
            Ok(data) => ciborium::from_reader(&data[..])
                .map_err(|e| Error::Internal(format!("undecodable dirstate: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::Io {
                    path: storage_path.to_path_buf(),
                    source: e,
                })
            }
        };
        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            directives,
        })
    }

    pub fn save(&self) -> Result<()> {
        let mut data = Vec::new();
        ciborium::into_writer(&self.directives, &mut data)
            .map_err(|e| Error::Internal(format!("unencodable dirstate: {}", e)))?;
        crate::overlay::atomic_write(&self.storage_path, &data)
    }

    pub fn directives(&self) -> &BTreeMap<RelativePath, Directive> {
        &self.directives
    }

    /// stage paths for addition; each path's outcome is independent
    pub fn add(
        &mut self,
        manager: &InodeManager,
        paths: &[RelativePath],
    ) -> Result<Vec<ScmError>> {
        let mut errors = Vec::new();
        for path in paths {
            match manager.resolve(path) {
                Ok(_) => {
                    self.directives.insert(path.clone(), Directive::Add);
                }
                Err(Error::NotFound(_)) => errors.push(ScmError {
                    path: path.clone(),
                    message: "path does not exist".to_string(),
                }),
                Err(e) => errors.push(ScmError {
                    path: path.clone(),
                    message: e.to_string(),
                }),
            }
        }
        self.save()?;
        Ok(errors)
    }

    /// stage paths for removal; without `force` a modified file is refused
    pub fn remove(
        &mut self,
        manager: &InodeManager,
        store: &Arc<ObjectStore>,
        root_tree: &Hash,
        paths: &[RelativePath],
        force: bool,
    ) -> Result<Vec<ScmError>> {
        let mut errors = Vec::new();
        for path in paths {
            let tracked = lookup_tree_path(store, root_tree, path)?;
            let Some(entry) = tracked else {
                errors.push(ScmError {
                    path: path.clone(),
                    message: "path is not tracked".to_string(),
                });
                continue;
            };

            if !force {
                match self.is_modified(manager, store, &entry, path) {
                    Ok(false) => {}
                    Ok(true) => {
                        errors.push(ScmError {
                            path: path.clone(),
                            message: "path is modified; pass force to remove anyway"
                                .to_string(),
                        });
                        continue;
                    }
                    Err(e) => {
                        errors.push(ScmError {
                            path: path.clone(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                }
            }
            self.directives.insert(path.clone(), Directive::Remove);
        }
        self.save()?;
        Ok(errors)
    }

    fn is_modified(
        &self,
        manager: &InodeManager,
        store: &Arc<ObjectStore>,
        entry: &TreeEntry,
        path: &RelativePath,
    ) -> Result<bool> {
        let inode = match manager.resolve(path) {
            Ok(inode) => inode,
            // locally deleted counts as modified
            Err(Error::NotFound(_)) => return Ok(true),
            Err(e) => return Err(e),
        };
        if !inode.is_materialized() || inode.is_dir() {
            return Ok(false);
        }
        let current = manager.sha1(&inode)?;
        let tracked = store.get_sha1_for_blob(&entry.hash)?;
        Ok(current != tracked)
    }

    /// clear directives after a commit; `paths_to_clean` were committed,
    /// `paths_to_drop` were abandoned
    pub fn mark_committed(
        &mut self,
        paths_to_clean: &[RelativePath],
        paths_to_drop: &[RelativePath],
    ) -> Result<()> {
        for path in paths_to_clean.iter().chain(paths_to_drop) {
            self.directives.remove(path);
        }
        self.save()
    }
}

/// walk the current tree and overlay, overlaying user directives
pub(crate) fn compute_status(
    manager: &InodeManager,
    store: &Arc<ObjectStore>,
    root_tree: &Hash,
    directives: &BTreeMap<RelativePath, Directive>,
    list_ignored: bool,
    token: &CancellationToken,
) -> Result<BTreeMap<RelativePath, StatusCode>> {
    let ignore = load_root_ignore(manager);

    let mut status = BTreeMap::new();
    let root = manager.root();
    let tree = store.get_tree(root_tree)?;
    walk_status(
        manager,
        store,
        &root,
        Some(tree),
        RelativePath::root(),
        &ignore,
        list_ignored,
        token,
        &mut status,
    )?;

    for (path, directive) in directives {
        match directive {
            Directive::Add => match status.get(path).copied() {
                Some(StatusCode::NotTracked) | Some(StatusCode::Ignored) => {
                    status.insert(path.clone(), StatusCode::Added);
                }
                Some(_) => {}
                None => {
                    if manager.resolve(path).is_err() {
                        status.insert(path.clone(), StatusCode::Missing);
                    }
                }
            },
            Directive::Remove => {
                status.insert(path.clone(), StatusCode::Removed);
            }
        }
    }

    if !list_ignored {
        status.retain(|_, code| *code != StatusCode::Ignored);
    }
    Ok(status)
}

/// ignore patterns come from the gitignore file at the root of the mount
fn load_root_ignore(manager: &InodeManager) -> GitIgnore {
    let path = match RelativePath::new(".gitignore") {
        Ok(path) => path,
        Err(_) => return GitIgnore::default(),
    };
    match manager.resolve(&path) {
        Ok(inode) if inode.is_regular_file() => match manager.read_all(&inode) {
            Ok(contents) => GitIgnore::parse(&String::from_utf8_lossy(&contents)),
            Err(_) => GitIgnore::default(),
        },
        _ => GitIgnore::default(),
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_status(
    manager: &InodeManager,
    store: &Arc<ObjectStore>,
    dir: &Arc<Inode>,
    tree: Option<Arc<Tree>>,
    path: RelativePath,
    ignore: &GitIgnore,
    list_ignored: bool,
    token: &CancellationToken,
    status: &mut BTreeMap<RelativePath, StatusCode>,
) -> Result<()> {
    token.check()?;

    // an unmaterialized directory tracks its tree exactly
    if !dir.is_materialized() {
        return Ok(());
    }

    let entries = manager.list(dir)?;
    let mut names: Vec<PathComponent> = entries.iter().map(|(name, _)| name.clone()).collect();
    if let Some(tree) = &tree {
        for entry in tree.entries() {
            if !entries.iter().any(|(name, _)| name == &entry.name) {
                names.push(entry.name.clone());
            }
        }
    }
    names.sort();
    names.dedup();

    for name in names {
        token.check()?;
        let entry_path = path.join(&name);
        let tree_entry = tree.as_ref().and_then(|t| t.get(name.as_str()));
        let current = entries.iter().find(|(n, _)| n == &name).map(|(_, e)| e);

        match (current, tree_entry) {
            (None, Some(_)) => {
                status.insert(entry_path, StatusCode::Missing);
            }
            (Some(entry), tracked) => {
                let is_dir = entry.mode & S_IFMT == S_IFDIR;
                let tracked_dir = tracked.map(|t| t.is_directory()).unwrap_or(false);

                if is_dir {
                    let subtree = match tracked {
                        Some(t) if tracked_dir => Some(store.get_tree(&t.hash)?),
                        _ => None,
                    };
                    let child = manager.child(dir, name.as_str())?;
                    walk_status(
                        manager,
                        store,
                        &child,
                        subtree,
                        entry_path,
                        ignore,
                        list_ignored,
                        token,
                        status,
                    )?;
                    continue;
                }

                match tracked {
                    Some(tree_entry) if !tracked_dir => {
                        // tracked file: only a materialized copy can differ
                        if entry.hash.is_none() {
                            let child = manager.child(dir, name.as_str())?;
                            let current_sha1 = manager.sha1(&child)?;
                            let tracked_sha1 = store.get_sha1_for_blob(&tree_entry.hash)?;
                            if current_sha1 != tracked_sha1 {
                                status.insert(entry_path, StatusCode::Modified);
                            }
                        }
                    }
                    _ => {
                        // untracked file
                        let code = match ignore.match_path(&entry_path, false) {
                            MatchResult::Exclude => StatusCode::Ignored,
                            _ => StatusCode::NotTracked,
                        };
                        status.insert(entry_path, code);
                    }
                }
            }
            (None, None) => {}
        }
    }
    Ok(())
}

/// walk a tree by path, fetching intermediate trees on demand
pub(crate) fn lookup_tree_path(
    store: &Arc<ObjectStore>,
    root_tree: &Hash,
    path: &RelativePath,
) -> Result<Option<TreeEntry>> {
    let mut tree = store.get_tree(root_tree)?;
    let mut components = path.components().peekable();
    while let Some(component) = components.next() {
        let entry = match tree.get(component) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        if components.peek().is_none() {
            return Ok(Some(entry));
        }
        if !entry.is_directory() {
            return Ok(None);
        }
        tree = store.get_tree(&entry.hash)?;
    }
    Ok(None)
}
