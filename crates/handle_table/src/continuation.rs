//! Continuation store for paginated calls.
//!
//! A token is always owned by a live directory node; removing the node
//! releases every token it owns. Release callbacks run with no lock held.

use crate::arena::{ArenaError, SegmentedArena};
use crate::config::ArenaLimits;
use crate::errors::{HandleError, Result};
use crate::table::Shared;
use dirsvc_types::{ContinuationToken, HandleId, HandleKind};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

/// Caller-defined resume state, shared read-only with readers.
pub type ContinuationPayload = Arc<dyn Any + Send + Sync>;

type ReleaseFn = Box<dyn FnOnce(ContinuationPayload) + Send>;

struct ContinuationEntry {
    token: ContinuationToken,
    owner: HandleId,
    payload: ContinuationPayload,
    release: ReleaseFn,
}

pub(crate) struct TokenState {
    entries: SegmentedArena<ContinuationEntry>,
    by_owner: HashMap<HandleId, BTreeSet<ContinuationToken>>,
}

impl TokenState {
    pub(crate) fn new(limits: ArenaLimits) -> Self {
        Self {
            entries: SegmentedArena::new(limits),
            by_owner: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn take(&mut self, token: ContinuationToken) -> Option<ContinuationEntry> {
        let entry = self.entries.remove(token.raw())?;
        if let Some(tokens) = self.by_owner.get_mut(&entry.owner) {
            tokens.remove(&token);
            if tokens.is_empty() {
                self.by_owner.remove(&entry.owner);
            }
        }
        Some(entry)
    }

    fn take_owner(&mut self, owner: HandleId) -> Vec<ContinuationEntry> {
        let Some(tokens) = self.by_owner.remove(&owner) else {
            return Vec::new();
        };
        tokens
            .into_iter()
            .filter_map(|token| self.entries.remove(token.raw()))
            .collect()
    }

    /// Empties the store, handing back what each release callback needs.
    pub(crate) fn drain(&mut self) -> Vec<(ContinuationPayload, ReleaseFn)> {
        let owners: Vec<HandleId> = self.by_owner.keys().copied().collect();
        owners
            .into_iter()
            .flat_map(|owner| self.take_owner(owner))
            .map(|entry| (entry.payload, entry.release))
            .collect()
    }
}

/// Resume tokens bound to directory-node handles.
///
/// Obtained from [`HandleTable::continuations`](crate::HandleTable::continuations);
/// clones share the same store.
#[derive(Clone)]
pub struct ContinuationStore {
    shared: Arc<Shared>,
}

impl ContinuationStore {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Stash `payload` under a new token owned by node `owner`.
    ///
    /// `release` runs exactly once with the payload, when the token is
    /// released or its owner node is removed.
    pub fn put<P, F>(&self, owner: HandleId, payload: P, release: F) -> Result<ContinuationToken>
    where
        P: Any + Send + Sync,
        F: FnOnce(ContinuationPayload) + Send + 'static,
    {
        // The owner check and the insert happen under the table lock, so a
        // node being removed can never pick up a token after its sweep.
        let handles = self.shared.handles.lock();
        let owner_is_node = handles
            .live(owner)
            .is_some_and(|entry| entry.kind == HandleKind::DirectoryNode);
        if !owner_is_node {
            debug!(%owner, "continuation rejected: owner is not a live node");
            return Err(HandleError::InvalidOwner { owner });
        }

        let mut tokens = self.shared.tokens.lock();
        let capacity = tokens.entries.capacity();
        let payload: ContinuationPayload = Arc::new(payload);
        let raw = tokens
            .entries
            .insert_with(|raw| ContinuationEntry {
                token: ContinuationToken::from_raw(raw),
                owner,
                payload,
                release: Box::new(release),
            })
            .map_err(|err| match err {
                ArenaError::Full => {
                    error!(%owner, capacity, "continuation store full");
                    HandleError::TableFull { capacity }
                }
                ArenaError::AllocationFailed => {
                    error!(%owner, "continuation segment allocation failed");
                    HandleError::AllocationFailed
                }
            })?;
        let token = ContinuationToken::from_raw(raw);
        tokens.by_owner.entry(owner).or_default().insert(token);
        drop(tokens);
        drop(handles);

        debug!(%token, %owner, "continuation stored");
        Ok(token)
    }

    /// Read the payload of `token` without consuming it.
    pub fn get(&self, token: ContinuationToken) -> Result<ContinuationPayload> {
        let tokens = self.shared.tokens.lock();
        tokens
            .entries
            .get(token.raw())
            .map(|entry| Arc::clone(&entry.payload))
            .ok_or(HandleError::InvalidToken { token })
    }

    /// Like [`get`](Self::get), downcast to the payload type the caller stored.
    pub fn get_as<T: Any + Send + Sync>(&self, token: ContinuationToken) -> Result<Arc<T>> {
        self.get(token)?
            .downcast::<T>()
            .map_err(|_| HandleError::PayloadType { token })
    }

    pub fn owner_of(&self, token: ContinuationToken) -> Result<HandleId> {
        let tokens = self.shared.tokens.lock();
        tokens
            .entries
            .get(token.raw())
            .map(|entry| entry.owner)
            .ok_or(HandleError::InvalidToken { token })
    }

    /// Release `token`, running its callback. Returns false when the token
    /// was already gone, which is expected when the owner closed first.
    pub fn release(&self, token: ContinuationToken) -> bool {
        let entry = self.shared.tokens.lock().take(token);
        match entry {
            Some(entry) => {
                debug!(token = %entry.token, owner = %entry.owner, "continuation released");
                (entry.release)(entry.payload);
                true
            }
            None => false,
        }
    }

    /// Release every token owned by `owner`. Returns how many were released.
    pub fn invalidate_owner(&self, owner: HandleId) -> usize {
        let entries = self.shared.tokens.lock().take_owner(owner);
        let released = entries.len();
        for entry in entries {
            (entry.release)(entry.payload);
        }
        if released > 0 {
            debug!(%owner, released, "continuations invalidated");
        }
        released
    }

    pub fn tokens_for(&self, owner: HandleId) -> Vec<ContinuationToken> {
        let tokens = self.shared.tokens.lock();
        tokens
            .by_owner
            .get(&owner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shared.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
