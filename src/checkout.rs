//! three-way reconciliation of the inode tree against a new commit
//!
//! the walk plans first and mutates second: conflicts discovered during
//! planning abort a non-force checkout with the overlay and snapshot
//! untouched.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::hash::Hash;
use crate::inode::{DirEntry, Inode, InodeBody, InodeManager};
use crate::model::{Tree, TreeEntry};
use crate::path::{PathComponent, RelativePath};
use crate::util::CancellationToken;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictType {
    /// a locally-modified file blocks the checkout
    ModifiedBlocksCheckout,
    /// a directory slated for removal still holds local content
    DirectoryNotEmpty,
    /// an untracked local file collides with a new tree entry
    Untracked,
}

#[derive(Clone, Debug)]
pub struct CheckoutConflict {
    pub path: RelativePath,
    pub conflict_type: ConflictType,
}

/// result of a checkout walk, before snapshot/journal bookkeeping
pub(crate) struct CheckoutOutcome {
    pub conflicts: Vec<CheckoutConflict>,
    pub changed_paths: HashSet<RelativePath>,
    pub applied: bool,
}

enum StepAction {
    /// point the directory inode itself at a new source tree
    SwapDirSource { new_hash: Hash },
    /// point a listing entry at a (new) source hash, dropping any overlay
    /// state the child had
    SetEntry {
        hash: Hash,
        mode: u32,
        drop_overlay: bool,
    },
    /// remove a listing entry
    RemoveEntry { drop_overlay: bool },
}

struct Step {
    dir: Arc<Inode>,
    name: Option<PathComponent>,
    action: StepAction,
}

struct CheckoutContext<'a> {
    manager: &'a InodeManager,
    force: bool,
    token: &'a CancellationToken,
    conflicts: Vec<CheckoutConflict>,
    steps: Vec<Step>,
    changed_paths: HashSet<RelativePath>,
}

/// reconcile the inode tree from `old_root` to `new_root`
pub(crate) fn run_checkout(
    manager: &InodeManager,
    old_root: Hash,
    new_root: Hash,
    force: bool,
    token: &CancellationToken,
) -> Result<CheckoutOutcome> {
    let mut ctx = CheckoutContext {
        manager,
        force,
        token,
        conflicts: Vec::new(),
        steps: Vec::new(),
        changed_paths: HashSet::new(),
    };

    let root = manager.root();
    let old_tree = manager.store().get_tree(&old_root)?;
    let new_tree = manager.store().get_tree(&new_root)?;
    plan_dir(
        &mut ctx,
        root,
        Some(old_tree),
        Some(new_tree),
        RelativePath::root(),
    )?;

    if !ctx.conflicts.is_empty() && !force {
        debug!(
            conflicts = ctx.conflicts.len(),
            "checkout blocked by conflicts"
        );
        return Ok(CheckoutOutcome {
            conflicts: ctx.conflicts,
            changed_paths: HashSet::new(),
            applied: false,
        });
    }

    for step in &ctx.steps {
        apply_step(manager, step)?;
    }

    Ok(CheckoutOutcome {
        conflicts: ctx.conflicts,
        changed_paths: ctx.changed_paths,
        applied: true,
    })
}

/// plan one directory; returns whether local content keeps the directory
/// alive after the checkout
fn plan_dir(
    ctx: &mut CheckoutContext<'_>,
    dir: Arc<Inode>,
    old_tree: Option<Arc<Tree>>,
    new_tree: Option<Arc<Tree>>,
    path: RelativePath,
) -> Result<bool> {
    ctx.token.check()?;

    if !dir.is_materialized() {
        // nothing local below an unmaterialized directory: swap the source
        let old_hash = old_tree.as_ref().map(|t| *t.hash());
        let new_hash = new_tree.as_ref().map(|t| *t.hash());
        if old_hash != new_hash {
            if let Some(new_hash) = new_hash {
                ctx.steps.push(Step {
                    dir: dir.clone(),
                    name: None,
                    action: StepAction::SwapDirSource { new_hash },
                });
            }
            tree_diff_paths(ctx, old_tree.as_deref(), new_tree.as_deref(), &path)?;
        }
        return Ok(false);
    }

    ctx.manager.ensure_dir_loaded(&dir)?;
    let entries: BTreeMap<PathComponent, DirEntry> = {
        let body = dir.body.read();
        match &*body {
            InodeBody::Dir(state) => state.entries.clone().expect("loaded above"),
            InodeBody::File(_) => unreachable!("directory inode"),
        }
    };

    let mut names: Vec<PathComponent> = entries.keys().cloned().collect();
    for tree in [&old_tree, &new_tree].into_iter().flatten() {
        for entry in tree.entries() {
            if !entries.contains_key(&entry.name) {
                names.push(entry.name.clone());
            }
        }
    }
    names.sort();
    names.dedup();

    let mut retains_local = false;
    for name in names {
        ctx.token.check()?;
        let entry_path = path.join(&name);
        let old_entry = old_tree.as_ref().and_then(|t| t.get(name.as_str()));
        let new_entry = new_tree.as_ref().and_then(|t| t.get(name.as_str()));
        let current = entries.get(&name);

        if plan_name(ctx, &dir, &name, entry_path, old_entry, new_entry, current)? {
            retains_local = true;
        }
    }
    Ok(retains_local)
}

/// plan one name of a materialized directory; returns whether it leaves
/// local content behind
fn plan_name(
    ctx: &mut CheckoutContext<'_>,
    dir: &Arc<Inode>,
    name: &PathComponent,
    path: RelativePath,
    old_entry: Option<&TreeEntry>,
    new_entry: Option<&TreeEntry>,
    current: Option<&DirEntry>,
) -> Result<bool> {
    let current = match current {
        Some(current) => current,
        None => {
            // the name was deleted locally
            return plan_locally_deleted(ctx, dir, name, path, old_entry, new_entry);
        }
    };

    if let Some(current_hash) = current.hash {
        // unmaterialized child: tracks a source hash, no local edits
        match new_entry {
            Some(new_e) => {
                if new_e.hash != current_hash || new_e.mode() != current.mode {
                    let both_dirs =
                        current.mode & S_IFMT == S_IFDIR && new_e.is_directory();
                    if both_dirs {
                        let old_sub = ctx.manager.store().get_tree(&current_hash)?;
                        let new_sub = ctx.manager.store().get_tree(&new_e.hash)?;
                        tree_diff_paths(ctx, Some(&old_sub), Some(&new_sub), &path)?;
                    } else {
                        subtree_paths(ctx, current.mode, current_hash, &path)?;
                        ctx.changed_paths.insert(path.clone());
                    }
                    ctx.steps.push(Step {
                        dir: dir.clone(),
                        name: Some(name.clone()),
                        action: StepAction::SetEntry {
                            hash: new_e.hash,
                            mode: new_e.mode(),
                            drop_overlay: false,
                        },
                    });
                }
            }
            None => {
                subtree_paths(ctx, current.mode, current_hash, &path)?;
                ctx.changed_paths.insert(path.clone());
                ctx.steps.push(Step {
                    dir: dir.clone(),
                    name: Some(name.clone()),
                    action: StepAction::RemoveEntry {
                        drop_overlay: false,
                    },
                });
            }
        }
        return Ok(false);
    }

    // materialized child
    let child = ctx.manager.child(dir, name.as_str())?;
    if current.mode & S_IFMT == S_IFDIR {
        let old_sub = match old_entry {
            Some(e) if e.is_directory() => Some(ctx.manager.store().get_tree(&e.hash)?),
            _ => None,
        };
        let new_sub = match new_entry {
            Some(e) if e.is_directory() => Some(ctx.manager.store().get_tree(&e.hash)?),
            _ => None,
        };
        let child_retains = plan_dir(ctx, child, old_sub, new_sub, path.clone())?;

        match new_entry {
            Some(new_e) if !new_e.is_directory() => {
                // directory replaced by a file upstream
                ctx.conflicts.push(CheckoutConflict {
                    path: path.clone(),
                    conflict_type: ConflictType::ModifiedBlocksCheckout,
                });
                if ctx.force {
                    ctx.changed_paths.insert(path.clone());
                    ctx.steps.push(Step {
                        dir: dir.clone(),
                        name: Some(name.clone()),
                        action: StepAction::SetEntry {
                            hash: new_e.hash,
                            mode: new_e.mode(),
                            drop_overlay: true,
                        },
                    });
                    return Ok(false);
                }
                return Ok(true);
            }
            Some(_) => Ok(true),
            None => {
                if child_retains {
                    ctx.conflicts.push(CheckoutConflict {
                        path: path.clone(),
                        conflict_type: ConflictType::DirectoryNotEmpty,
                    });
                    return Ok(true);
                }
                ctx.changed_paths.insert(path.clone());
                ctx.steps.push(Step {
                    dir: dir.clone(),
                    name: Some(name.clone()),
                    action: StepAction::RemoveEntry { drop_overlay: true },
                });
                Ok(false)
            }
        }
    } else {
        plan_materialized_file(ctx, dir, name, path, old_entry, new_entry, &child)
    }
}

fn plan_locally_deleted(
    ctx: &mut CheckoutContext<'_>,
    dir: &Arc<Inode>,
    name: &PathComponent,
    path: RelativePath,
    old_entry: Option<&TreeEntry>,
    new_entry: Option<&TreeEntry>,
) -> Result<bool> {
    match (old_entry, new_entry) {
        (Some(old_e), Some(new_e)) => {
            if entry_same(old_e, new_e) {
                // upstream unchanged: the local deletion stands
                return Ok(true);
            }
            ctx.conflicts.push(CheckoutConflict {
                path: path.clone(),
                conflict_type: ConflictType::ModifiedBlocksCheckout,
            });
            if ctx.force {
                ctx.changed_paths.insert(path);
                ctx.steps.push(Step {
                    dir: dir.clone(),
                    name: Some(name.clone()),
                    action: StepAction::SetEntry {
                        hash: new_e.hash,
                        mode: new_e.mode(),
                        drop_overlay: false,
                    },
                });
                return Ok(false);
            }
            Ok(true)
        }
        (None, Some(new_e)) => {
            // an entry appears
            subtree_paths(ctx, new_e.mode(), new_e.hash, &path)?;
            ctx.steps.push(Step {
                dir: dir.clone(),
                name: Some(name.clone()),
                action: StepAction::SetEntry {
                    hash: new_e.hash,
                    mode: new_e.mode(),
                    drop_overlay: false,
                },
            });
            Ok(false)
        }
        // deleted locally, deleted (or never present) upstream
        (Some(_), None) => Ok(true),
        (None, None) => Ok(false),
    }
}

fn plan_materialized_file(
    ctx: &mut CheckoutContext<'_>,
    dir: &Arc<Inode>,
    name: &PathComponent,
    path: RelativePath,
    old_entry: Option<&TreeEntry>,
    new_entry: Option<&TreeEntry>,
    child: &Arc<Inode>,
) -> Result<bool> {
    // a materialized symlink has no overlay handle to hash; treat it as
    // modified so the checkout never overwrites it silently
    let current_sha1 = if child.is_symlink() {
        None
    } else {
        Some(ctx.manager.sha1(child)?)
    };

    match old_entry {
        Some(old_e) if !old_e.is_directory() => {
            let old_sha1 = ctx.manager.store().get_sha1_for_blob(&old_e.hash)?;
            let unmodified = current_sha1 == Some(old_sha1);

            if unmodified {
                match new_entry {
                    Some(new_e) => {
                        // unmodified: drop the overlay copy and track the
                        // new source entry
                        if new_e.hash != old_e.hash {
                            ctx.changed_paths.insert(path.clone());
                        }
                        ctx.steps.push(Step {
                            dir: dir.clone(),
                            name: Some(name.clone()),
                            action: StepAction::SetEntry {
                                hash: new_e.hash,
                                mode: new_e.mode(),
                                drop_overlay: true,
                            },
                        });
                        Ok(false)
                    }
                    None => {
                        ctx.changed_paths.insert(path.clone());
                        ctx.steps.push(Step {
                            dir: dir.clone(),
                            name: Some(name.clone()),
                            action: StepAction::RemoveEntry { drop_overlay: true },
                        });
                        Ok(false)
                    }
                }
            } else {
                // locally modified
                if let Some(new_e) = new_entry {
                    if entry_same(old_e, new_e) {
                        // upstream unchanged: keep the local modification
                        return Ok(true);
                    }
                }
                ctx.conflicts.push(CheckoutConflict {
                    path: path.clone(),
                    conflict_type: ConflictType::ModifiedBlocksCheckout,
                });
                if ctx.force {
                    ctx.changed_paths.insert(path.clone());
                    match new_entry {
                        Some(new_e) => ctx.steps.push(Step {
                            dir: dir.clone(),
                            name: Some(name.clone()),
                            action: StepAction::SetEntry {
                                hash: new_e.hash,
                                mode: new_e.mode(),
                                drop_overlay: true,
                            },
                        }),
                        None => ctx.steps.push(Step {
                            dir: dir.clone(),
                            name: Some(name.clone()),
                            action: StepAction::RemoveEntry { drop_overlay: true },
                        }),
                    }
                    return Ok(false);
                }
                Ok(true)
            }
        }
        _ => {
            // untracked in the old tree (or the old entry was a directory)
            match new_entry {
                Some(new_e) => {
                    ctx.conflicts.push(CheckoutConflict {
                        path: path.clone(),
                        conflict_type: ConflictType::Untracked,
                    });
                    if ctx.force {
                        ctx.changed_paths.insert(path.clone());
                        ctx.steps.push(Step {
                            dir: dir.clone(),
                            name: Some(name.clone()),
                            action: StepAction::SetEntry {
                                hash: new_e.hash,
                                mode: new_e.mode(),
                                drop_overlay: true,
                            },
                        });
                        return Ok(false);
                    }
                    Ok(true)
                }
                None => Ok(true),
            }
        }
    }
}

fn entry_same(a: &TreeEntry, b: &TreeEntry) -> bool {
    a.hash == b.hash && a.mode() == b.mode()
}

/// record every path that differs between two trees
fn tree_diff_paths(
    ctx: &mut CheckoutContext<'_>,
    old_tree: Option<&Tree>,
    new_tree: Option<&Tree>,
    path: &RelativePath,
) -> Result<()> {
    ctx.token.check()?;

    let empty: [TreeEntry; 0] = [];
    let old_entries = old_tree.map(|t| t.entries()).unwrap_or(&empty);
    let new_entries = new_tree.map(|t| t.entries()).unwrap_or(&empty);

    let mut names: Vec<&PathComponent> = old_entries.iter().map(|e| &e.name).collect();
    names.extend(new_entries.iter().map(|e| &e.name));
    names.sort();
    names.dedup();

    for name in names {
        let old_e = old_tree.and_then(|t| t.get(name.as_str()));
        let new_e = new_tree.and_then(|t| t.get(name.as_str()));
        let entry_path = path.join(name);

        match (old_e, new_e) {
            (Some(o), Some(n)) if entry_same(o, n) => {}
            (Some(o), Some(n)) if o.is_directory() && n.is_directory() => {
                let old_sub = ctx.manager.store().get_tree(&o.hash)?;
                let new_sub = ctx.manager.store().get_tree(&n.hash)?;
                tree_diff_paths(ctx, Some(&old_sub), Some(&new_sub), &entry_path)?;
            }
            (old_e, new_e) => {
                if let Some(o) = old_e {
                    subtree_paths(ctx, o.mode(), o.hash, &entry_path)?;
                }
                if let Some(n) = new_e {
                    subtree_paths(ctx, n.mode(), n.hash, &entry_path)?;
                }
                ctx.changed_paths.insert(entry_path);
            }
        }
    }
    Ok(())
}

/// record a whole appearing or disappearing subtree
fn subtree_paths(
    ctx: &mut CheckoutContext<'_>,
    mode: u32,
    hash: Hash,
    path: &RelativePath,
) -> Result<()> {
    if mode & S_IFMT != S_IFDIR {
        ctx.changed_paths.insert(path.clone());
        return Ok(());
    }
    let tree = ctx.manager.store().get_tree(&hash)?;
    for entry in tree.entries() {
        let entry_path = path.join(&entry.name);
        subtree_paths(ctx, entry.mode(), entry.hash, &entry_path)?;
    }
    ctx.changed_paths.insert(path.clone());
    Ok(())
}

fn apply_step(manager: &InodeManager, step: &Step) -> Result<()> {
    match &step.action {
        StepAction::SwapDirSource { new_hash } => {
            let child_ids: Vec<_> = {
                let mut body = step.dir.body.write();
                match &mut *body {
                    InodeBody::Dir(dir) => {
                        dir.source = Some(*new_hash);
                        dir.materialized = false;
                        dir.entries
                            .take()
                            .map(|entries| {
                                entries.values().filter_map(|e| e.inode_id).collect()
                            })
                            .unwrap_or_default()
                    }
                    InodeBody::File(_) => Vec::new(),
                }
            };
            for id in child_ids {
                manager.forget_subtree(id);
            }
            Ok(())
        }
        StepAction::SetEntry {
            hash,
            mode,
            drop_overlay,
        } => {
            let name = step.name.as_ref().expect("entry step has a name");
            let evicted = {
                let mut body = step.dir.body.write();
                let InodeBody::Dir(dir) = &mut *body else {
                    return Ok(());
                };
                let entries = dir.entries.get_or_insert_with(BTreeMap::new);
                let evicted = match entries.get_mut(name) {
                    Some(entry) => {
                        let evicted = entry.inode_id.map(|id| (id, entry.mode));
                        entry.hash = Some(*hash);
                        entry.mode = *mode;
                        evicted
                    }
                    None => {
                        entries.insert(
                            name.clone(),
                            DirEntry {
                                inode_id: None,
                                hash: Some(*hash),
                                mode: *mode,
                            },
                        );
                        None
                    }
                };
                manager.persist_dir_entries(step.dir.id(), entries)?;
                evicted
            };
            if let Some((id, old_mode)) = evicted {
                if *drop_overlay {
                    remove_overlay_subtree(manager, id, old_mode)?;
                }
                manager.forget_subtree(id);
            }
            Ok(())
        }
        StepAction::RemoveEntry { drop_overlay } => {
            let name = step.name.as_ref().expect("entry step has a name");
            let evicted = {
                let mut body = step.dir.body.write();
                let InodeBody::Dir(dir) = &mut *body else {
                    return Ok(());
                };
                let entries = dir.entries.get_or_insert_with(BTreeMap::new);
                let evicted = entries.remove(name).and_then(|e| e.inode_id.map(|id| (id, e.mode)));
                manager.persist_dir_entries(step.dir.id(), entries)?;
                evicted
            };
            if let Some((id, old_mode)) = evicted {
                if *drop_overlay {
                    remove_overlay_subtree(manager, id, old_mode)?;
                }
                manager.forget_subtree(id);
            }
            Ok(())
        }
    }
}

/// delete an inode's overlay state and, for directories, its descendants'
fn remove_overlay_subtree(manager: &InodeManager, id: u64, mode: u32) -> Result<()> {
    if !manager.overlay().has_entry(id) {
        return Ok(());
    }
    if mode & S_IFMT == S_IFDIR {
        let listing = manager.overlay().read_dir(id)?;
        for entry in listing.values() {
            remove_overlay_subtree(manager, entry.inode_id, entry.mode)?;
        }
    }
    manager.overlay().remove(id)
}
