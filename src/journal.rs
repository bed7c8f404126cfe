//! append-only record of inode-visible mutations within a mount
//!
//! deltas form a newest-first linked chain held in memory; the journal
//! starts fresh at sequence 0 on every mount with a bumped generation so
//! subscribers can detect stale cursors.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::path::RelativePath;

/// one recorded mutation
#[derive(Debug)]
pub struct JournalDelta {
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub from_hash: Hash,
    pub to_hash: Hash,
    pub changed_paths: HashSet<RelativePath>,
    pub previous: Option<Arc<JournalDelta>>,
}

/// a subscriber's cursor into the journal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalPosition {
    pub generation: u64,
    pub sequence: u64,
    pub hash: Hash,
}

/// accumulated changes between two positions
#[derive(Debug)]
pub struct JournalRange {
    pub from_position: JournalPosition,
    pub to_position: JournalPosition,
    pub changed_paths: HashSet<RelativePath>,
}

pub type SubscriberId = u64;
type SubscriberFn = Box<dyn Fn(&Arc<JournalDelta>) -> bool + Send + Sync>;

struct JournalState {
    latest: Option<Arc<JournalDelta>>,
    subscribers: HashMap<SubscriberId, SubscriberFn>,
    next_subscriber_id: SubscriberId,
}

pub struct Journal {
    generation: u64,
    state: Mutex<JournalState>,
}

impl Journal {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            state: Mutex::new(JournalState {
                latest: None,
                subscribers: HashMap::new(),
                next_subscriber_id: 1,
            }),
        }
    }

    /// mount generation this journal belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// append a delta and notify subscribers; returns the new latest delta
    pub fn record(
        &self,
        from_hash: Hash,
        to_hash: Hash,
        changed_paths: HashSet<RelativePath>,
    ) -> Arc<JournalDelta> {
        let mut state = self.state.lock();

        let from_sequence = state
            .latest
            .as_ref()
            .map(|latest| latest.to_sequence)
            .unwrap_or(0);
        let delta = Arc::new(JournalDelta {
            from_sequence,
            to_sequence: from_sequence + 1,
            from_hash,
            to_hash,
            changed_paths,
            previous: state.latest.take(),
        });
        state.latest = Some(delta.clone());

        // a subscriber that panics or declines is detached
        let mut detached = Vec::new();
        for (&id, callback) in &state.subscribers {
            let keep = catch_unwind(AssertUnwindSafe(|| callback(&delta)));
            match keep {
                Ok(true) => {}
                Ok(false) => detached.push(id),
                Err(_) => {
                    warn!(subscriber = id, "journal subscriber panicked; detaching");
                    detached.push(id);
                }
            }
        }
        for id in detached {
            state.subscribers.remove(&id);
        }

        delta
    }

    pub fn latest(&self) -> Option<Arc<JournalDelta>> {
        self.state.lock().latest.clone()
    }

    /// current position for new cursors
    pub fn position(&self) -> JournalPosition {
        let state = self.state.lock();
        match &state.latest {
            Some(latest) => JournalPosition {
                generation: self.generation,
                sequence: latest.to_sequence,
                hash: latest.to_hash,
            },
            None => JournalPosition {
                generation: self.generation,
                sequence: 0,
                hash: Hash::ZERO,
            },
        }
    }

    /// accumulate changed paths since `cursor`
    ///
    /// walks the chain from the latest delta back to the first entry at or
    /// before the cursor. a cursor from another mount generation fails
    /// with `OutOfRange`.
    pub fn changes_since(&self, cursor: &JournalPosition) -> Result<JournalRange> {
        if cursor.generation != self.generation {
            return Err(Error::OutOfRange(format!(
                "cursor generation {} does not match mount generation {}; \
                 compute a new basis for delta queries",
                cursor.generation, self.generation
            )));
        }

        let to_position = self.position();
        let mut from_position = to_position;
        let mut changed_paths = HashSet::new();

        let mut current = self.latest();
        while let Some(delta) = current {
            if delta.to_sequence <= cursor.sequence {
                break;
            }
            changed_paths.extend(delta.changed_paths.iter().cloned());
            from_position.sequence = delta.from_sequence;
            from_position.hash = delta.from_hash;
            current = delta.previous.clone();
        }

        Ok(JournalRange {
            from_position,
            to_position,
            changed_paths,
        })
    }

    /// register a callback invoked with every new latest delta; a callback
    /// that returns `false` is dropped after the call
    pub fn subscribe(
        &self,
        callback: impl Fn(&Arc<JournalDelta>) -> bool + Send + Sync + 'static,
    ) -> SubscriberId {
        let mut state = self.state.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(id, Box::new(callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.state.lock().subscribers.remove(&id);
    }
}
