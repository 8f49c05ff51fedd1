//! Hierarchical handle table
//!
//! One coarse lock guards every structural change. Cascading removal runs in
//! two phases: the whole subtree is claimed (marked closing) in a single
//! critical section, then entries are unlinked one at a time in post-order
//! with the lock released around each plugin notification.
//!
//! A parent is unlinked only after every child is gone and its plugin has
//! been notified, including children claimed by another cascade. A cascade
//! that reaches such a parent waits for them, unless it runs inside a plugin
//! callback of the same thread. There it hands the parent to whichever
//! cascade settles the last child, since waiting could never end.

use crate::arena::{ArenaError, SegmentedArena};
use crate::client_index::ClientSessionIndex;
use crate::config::TableLimits;
use crate::continuation::{ContinuationStore, TokenState};
use crate::errors::{HandleError, Result};
use crate::types::*;
use dirsvc_types::{ClientIdentity, HandleId, HandleKind};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State shared by a [`HandleTable`] and its [`ContinuationStore`].
///
/// Lock order is `handles` then `tokens`; nothing takes `handles` while
/// holding `tokens`.
pub(crate) struct Shared {
    pub(crate) handles: Mutex<TableState>,
    pub(crate) tokens: Mutex<TokenState>,
    /// Signalled each time a removed child has been fully notified.
    pub(crate) settled: Condvar,
    pub(crate) limits: TableLimits,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Outstanding tokens still get their release callback exactly once.
        for (payload, release) in self.tokens.get_mut().drain() {
            release(payload);
        }
    }
}

thread_local! {
    static CASCADE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running a cascade for as long as it lives.
struct CascadeScope {
    nested: bool,
}

impl CascadeScope {
    fn enter() -> Self {
        let depth = CASCADE_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current + 1);
            current
        });
        Self { nested: depth > 0 }
    }
}

impl Drop for CascadeScope {
    fn drop(&mut self) {
        CASCADE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

type Unlinked = (ReleasedHandle, Option<PluginRef>);

pub(crate) struct TableState {
    entries: SegmentedArena<HandleEntry>,
    clients: ClientSessionIndex,
    kind_counts: [usize; HandleKind::ALL.len()],
    high_water_crossings: u64,
}

impl TableState {
    fn new(limits: &TableLimits) -> Self {
        Self {
            entries: SegmentedArena::new(limits.handles),
            clients: ClientSessionIndex::new(limits.client_high_water),
            kind_counts: [0; HandleKind::ALL.len()],
            high_water_crossings: 0,
        }
    }

    /// Entry that exists and has not been claimed by a cascade.
    pub(crate) fn live(&self, id: HandleId) -> Option<&HandleEntry> {
        self.entries.get(id.raw()).filter(|entry| !entry.closing)
    }

    fn live_mut(&mut self, id: HandleId) -> Option<&mut HandleEntry> {
        self.entries
            .get_mut(id.raw())
            .filter(|entry| !entry.closing)
    }

    /// Returns the parent's creator, or `None` for a root.
    fn check_parent(&self, kind: HandleKind, parent: HandleId) -> Result<Option<ClientIdentity>> {
        let invalid = || HandleError::InvalidParent { kind, parent };
        match kind.required_parent() {
            None if parent.is_none() => Ok(None),
            None => Err(invalid()),
            Some(_) if parent.is_none() => Err(invalid()),
            Some(required) => {
                let entry = self.live(parent).ok_or_else(invalid)?;
                if entry.kind != required {
                    return Err(invalid());
                }
                Ok(Some(entry.client))
            }
        }
    }

    /// Marks `root` and every live descendant as closing and returns them in
    /// post-order. Descendants already claimed by another cascade are left
    /// to it. Nothing is marked if an inconsistency is found.
    fn claim_subtree(&mut self, root: HandleId) -> Result<Vec<HandleId>> {
        let mut order = Vec::new();
        let mut stack = vec![(root, false)];

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            let entry = self
                .entries
                .get(id.raw())
                .ok_or_else(|| HandleError::internal(format!("handle {id} vanished mid-claim")))?;
            stack.push((id, true));
            for &child in &entry.children {
                let child_entry = self.entries.get(child.raw()).ok_or_else(|| {
                    HandleError::internal(format!("handle {id} lists missing child {child}"))
                })?;
                if child_entry.parent != id {
                    return Err(HandleError::internal(format!(
                        "child {child} of {id} points at parent {}",
                        child_entry.parent
                    )));
                }
                if !child_entry.closing {
                    stack.push((child, false));
                }
            }
        }

        for id in &order {
            if let Some(entry) = self.entries.get_mut(id.raw()) {
                entry.closing = true;
            }
        }
        Ok(order)
    }

    fn claimed(&self, id: HandleId) -> Result<&HandleEntry> {
        self.entries
            .get(id.raw())
            .filter(|entry| entry.closing)
            .ok_or_else(|| HandleError::internal(format!("claimed handle {id} is missing")))
    }

    /// True once every child of a claimed entry is unlinked and notified.
    fn is_settled(&self, id: HandleId) -> Result<bool> {
        let entry = self.claimed(id)?;
        Ok(entry.children.is_empty() && entry.unsettled == 0)
    }

    fn hand_off(&mut self, id: HandleId) -> Result<()> {
        self.claimed(id)?;
        if let Some(entry) = self.entries.get_mut(id.raw()) {
            entry.handed_off = true;
        }
        Ok(())
    }

    /// Removes one claimed, settled entry. Its parent counts it as unsettled
    /// until [`settle`](Self::settle) is called after the notification.
    fn unlink(&mut self, id: HandleId) -> Result<Unlinked> {
        let entry = self.claimed(id)?;
        if let Some(child) = entry.children.iter().next() {
            return Err(HandleError::internal(format!(
                "handle {id} unlinked before its child {child}"
            )));
        }
        if entry.unsettled > 0 {
            return Err(HandleError::internal(format!(
                "handle {id} unlinked before its children were notified"
            )));
        }

        let parent = entry.parent;
        if !parent.is_none() {
            let linked = self
                .entries
                .get(parent.raw())
                .is_some_and(|parent_entry| parent_entry.children.contains(&id));
            if !linked {
                return Err(HandleError::internal(format!(
                    "parent {parent} does not list child {id}"
                )));
            }
        }

        let entry = self
            .entries
            .remove(id.raw())
            .ok_or_else(|| HandleError::internal(format!("claimed handle {id} is missing")))?;

        if let Some(parent_entry) = self.entries.get_mut(parent.raw()) {
            parent_entry.children.remove(&id);
            parent_entry.unsettled += 1;
        }

        self.clients.decrement(&entry.client);
        if entry.top_level {
            self.clients.untrack(&entry.client, id);
        }
        let count = &mut self.kind_counts[entry.kind.index()];
        *count = count.saturating_sub(1);

        Ok((entry.released(), entry.plugin))
    }

    /// Records that one child of `parent` has been notified. A handed-off
    /// parent that just became settled is unlinked and returned.
    fn settle(&mut self, parent: HandleId) -> Result<Option<Unlinked>> {
        let Some(entry) = self.entries.get_mut(parent.raw()) else {
            return Ok(None);
        };
        entry.unsettled = entry.unsettled.saturating_sub(1);
        if entry.handed_off && entry.children.is_empty() && entry.unsettled == 0 {
            return self.unlink(parent).map(Some);
        }
        Ok(None)
    }

    fn audit(&self) -> Result<()> {
        let mut kind_counts = [0usize; HandleKind::ALL.len()];

        for (raw, entry) in self.entries.iter() {
            let id = entry.id;
            if id.is_none() || id.raw() != raw {
                return Err(HandleError::internal(format!(
                    "slot {raw} holds entry recorded as {id}"
                )));
            }
            kind_counts[entry.kind.index()] += 1;
            if entry.closing {
                continue;
            }

            match entry.kind.required_parent() {
                None if !entry.parent.is_none() => {
                    return Err(HandleError::internal(format!(
                        "root {id} has parent {}",
                        entry.parent
                    )));
                }
                None => {}
                Some(required) => {
                    let parent = self.live(entry.parent).ok_or_else(|| {
                        HandleError::internal(format!(
                            "handle {id} has no live parent {}",
                            entry.parent
                        ))
                    })?;
                    if parent.kind != required || !parent.children.contains(&id) {
                        return Err(HandleError::internal(format!(
                            "parent {} does not hold {id} as a {required} child",
                            entry.parent
                        )));
                    }
                }
            }

            for child in &entry.children {
                let linked = self
                    .entries
                    .get(child.raw())
                    .is_some_and(|child_entry| child_entry.parent == id);
                if !linked {
                    return Err(HandleError::internal(format!(
                        "child {child} of {id} does not point back"
                    )));
                }
            }

            if entry.top_level != self.clients.is_tracked(&entry.client, id) {
                return Err(HandleError::internal(format!(
                    "client index disagrees about top-level handle {id}"
                )));
            }
        }

        if kind_counts != self.kind_counts {
            return Err(HandleError::internal("per-kind counters drifted"));
        }
        if self.clients.total_live() != self.entries.len() {
            return Err(HandleError::internal(format!(
                "client index counts {} handles, table holds {}",
                self.clients.total_live(),
                self.entries.len()
            )));
        }
        Ok(())
    }
}

/// Typed, hierarchical handle table shared by every worker.
///
/// Cloning is cheap and yields another reference to the same table.
#[derive(Clone)]
pub struct HandleTable {
    shared: Arc<Shared>,
}

impl HandleTable {
    pub fn new(limits: TableLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self::from_limits(limits))
    }

    fn from_limits(limits: TableLimits) -> Self {
        Self {
            shared: Arc::new(Shared {
                handles: Mutex::new(TableState::new(&limits)),
                tokens: Mutex::new(TokenState::new(limits.continuations)),
                settled: Condvar::new(),
                limits,
            }),
        }
    }

    pub fn limits(&self) -> &TableLimits {
        &self.shared.limits
    }

    /// Continuation store whose tokens are owned by this table's nodes.
    pub fn continuations(&self) -> ContinuationStore {
        ContinuationStore::new(Arc::clone(&self.shared))
    }

    /// Allocate a handle of `kind` under `parent` for `client`.
    ///
    /// `plugin` may be `None` when the owning plugin is resolved later via
    /// [`rebind`](Self::rebind).
    pub fn create(
        &self,
        kind: HandleKind,
        parent: HandleId,
        plugin: Option<PluginRef>,
        client: ClientIdentity,
        display_name: Option<String>,
    ) -> Result<HandleId> {
        let mut state = self.shared.handles.lock();

        let parent_owner = state.check_parent(kind, parent).inspect_err(|_| {
            debug!(%kind, %parent, %client, "create rejected: invalid parent");
        })?;
        let top_level = parent_owner.map_or(true, |owner| owner != client);

        let capacity = state.entries.capacity();
        let raw = state
            .entries
            .insert_with(|raw| HandleEntry {
                id: HandleId::from_raw(raw),
                kind,
                parent,
                plugin,
                client,
                children: Default::default(),
                display_name,
                delegates: Default::default(),
                top_level,
                closing: false,
                handed_off: false,
                unsettled: 0,
            })
            .map_err(|err| match err {
                ArenaError::Full => {
                    error!(%client, %kind, capacity, "handle table full");
                    HandleError::TableFull { capacity }
                }
                ArenaError::AllocationFailed => {
                    error!(%client, %kind, "handle table segment allocation failed");
                    HandleError::AllocationFailed
                }
            })?;
        let id = HandleId::from_raw(raw);

        if let Some(parent_entry) = state.entries.get_mut(parent.raw()) {
            parent_entry.children.insert(id);
        }
        if top_level {
            state.clients.track(client, id);
        }
        state.kind_counts[kind.index()] += 1;

        let update = state.clients.increment(client);
        if update.crossed_high_water {
            state.high_water_crossings += 1;
            warn!(
                %client,
                live_handles = update.count,
                high_water = self.shared.limits.client_high_water,
                "client crossed handle high-water mark"
            );
        }

        debug!(%id, %kind, %parent, %client, "handle created");
        Ok(id)
    }

    /// Check that `id` is a live `expected` handle usable by `client` and
    /// return its plugin binding (`None` while awaiting late binding).
    ///
    /// Ownership is checked before kind so a foreign handle's kind is not
    /// revealed.
    pub fn verify(
        &self,
        id: HandleId,
        expected: HandleKind,
        client: &ClientIdentity,
    ) -> Result<Option<PluginRef>> {
        let state = self.shared.handles.lock();
        let entry = state
            .live(id)
            .ok_or(HandleError::InvalidHandle { id })
            .inspect_err(|_| debug!(%id, %client, "verify: unknown handle"))?;
        if !entry.is_usable_by(client) {
            debug!(%id, %client, creator = %entry.client, "verify: not owner");
            return Err(HandleError::NotOwner {
                id,
                client: *client,
            });
        }
        if entry.kind != expected {
            debug!(%id, %client, %expected, actual = %entry.kind, "verify: wrong kind");
            return Err(HandleError::WrongKind {
                id,
                expected,
                actual: entry.kind,
            });
        }
        Ok(entry.plugin.clone())
    }

    /// Remove `id` and its whole subtree on behalf of `client`.
    ///
    /// Every removed entry's plugin is notified once, children before
    /// parents. Removing a node also invalidates its continuation tokens.
    ///
    /// Descendants already being removed by another thread are waited for.
    /// When called from a plugin callback, entries whose children belong to
    /// a cascade further up this thread's stack are finished by that cascade
    /// after this call returns.
    pub fn remove(&self, id: HandleId, client: &ClientIdentity) -> Result<()> {
        let order = {
            let mut state = self.shared.handles.lock();
            match state.live(id) {
                Some(entry) if entry.is_usable_by(client) => {}
                Some(_) => {
                    debug!(%id, %client, "remove refused: not owner");
                    return Err(HandleError::InvalidHandle { id });
                }
                None => {
                    debug!(%id, %client, "remove: unknown handle");
                    return Err(HandleError::InvalidHandle { id });
                }
            }
            state.claim_subtree(id).inspect_err(|err| {
                error!(%id, %client, error = %err, "remove aborted");
            })?
        };

        let removed = self.finish_cascade(order)?;
        debug!(%id, %client, removed, "handle subtree removed");
        Ok(())
    }

    /// Replace the plugin binding of `id` without touching the hierarchy.
    pub fn rebind(&self, id: HandleId, plugin: PluginRef) -> Result<()> {
        let mut state = self.shared.handles.lock();
        let entry = state
            .live_mut(id)
            .ok_or(HandleError::InvalidHandle { id })?;
        debug!(%id, plugin = plugin.name(), "handle rebound");
        entry.plugin = Some(plugin);
        Ok(())
    }

    /// Grant process `pid` use of `id`. The creator of record is unchanged.
    pub fn delegate(&self, id: HandleId, pid: u32) -> Result<()> {
        let mut state = self.shared.handles.lock();
        let entry = state
            .live_mut(id)
            .ok_or(HandleError::InvalidHandle { id })?;
        if entry.delegates.insert(pid) {
            debug!(%id, pid, "handle delegated");
        }
        Ok(())
    }

    /// Remove every top-level handle `client` created, with their subtrees.
    ///
    /// All subtrees are claimed in one critical section. Handles that are
    /// already gone or already being removed are skipped, so repeating the
    /// call is harmless. Returns the number of handles removed.
    pub fn clean_client_refs(&self, client: &ClientIdentity) -> usize {
        let orders = {
            let mut state = self.shared.handles.lock();
            let mut orders = Vec::new();
            for root in state.clients.roots_for(client) {
                let owned = state
                    .live(root)
                    .is_some_and(|entry| entry.client == *client);
                if !owned {
                    continue;
                }
                match state.claim_subtree(root) {
                    Ok(order) => orders.push(order),
                    Err(err) => error!(%client, %root, error = %err, "client sweep skipped subtree"),
                }
            }
            orders
        };

        let mut removed = 0;
        for order in orders {
            match self.finish_cascade(order) {
                Ok(count) => removed += count,
                Err(err) => error!(%client, error = %err, "client sweep aborted subtree"),
            }
        }
        if removed > 0 {
            info!(%client, removed, "released handles of departed client");
        }
        removed
    }

    /// Describe `id` under the same ownership rules as [`verify`](Self::verify).
    pub fn describe(&self, id: HandleId, client: &ClientIdentity) -> Result<HandleInfo> {
        let state = self.shared.handles.lock();
        let entry = state.live(id).ok_or(HandleError::InvalidHandle { id })?;
        if !entry.is_usable_by(client) {
            return Err(HandleError::NotOwner {
                id,
                client: *client,
            });
        }
        Ok(entry.info())
    }

    pub fn display_name(&self, id: HandleId) -> Result<Option<String>> {
        let state = self.shared.handles.lock();
        state
            .live(id)
            .map(|entry| entry.display_name.clone())
            .ok_or(HandleError::InvalidHandle { id })
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.shared.handles.lock().live(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.handles.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn client_usage(&self, client: &ClientIdentity) -> Option<ClientUsage> {
        self.shared.handles.lock().clients.usage(client)
    }

    pub fn clients(&self) -> Vec<ClientIdentity> {
        self.shared.handles.lock().clients.clients()
    }

    pub fn stats(&self) -> TableStats {
        let mut stats = {
            let state = self.shared.handles.lock();
            let by_kind: BTreeMap<HandleKind, usize> = HandleKind::ALL
                .iter()
                .map(|kind| (*kind, state.kind_counts[kind.index()]))
                .collect();
            TableStats {
                live_handles: state.entries.len(),
                by_kind,
                segments_allocated: state.entries.segments_allocated(),
                max_segments: self.shared.limits.handles.max_segments,
                capacity: state.entries.capacity(),
                clients: state.clients.len(),
                high_water_crossings: state.high_water_crossings,
                continuation_tokens: 0,
            }
        };
        stats.continuation_tokens = self.shared.tokens.lock().len();
        stats
    }

    /// Check every structural invariant. Meant for tests and diagnostics;
    /// entries mid-cascade are counted but not checked.
    pub fn audit(&self) -> Result<()> {
        self.shared.handles.lock().audit()
    }

    /// Unlink claimed entries in post-order. The table lock is dropped
    /// before continuation release and plugin notification.
    fn finish_cascade(&self, order: Vec<HandleId>) -> Result<usize> {
        let scope = CascadeScope::enter();
        let mut removed = 0;

        for id in order {
            let mut next = {
                let mut state = self.shared.handles.lock();
                loop {
                    if state.is_settled(id).inspect_err(|err| {
                        error!(%id, error = %err, "cascade aborted");
                    })? {
                        break Some(state.unlink(id).inspect_err(|err| {
                            error!(%id, error = %err, "cascade aborted");
                        })?);
                    }
                    if scope.nested {
                        state.hand_off(id)?;
                        debug!(%id, "unlink handed to the cascade holding its children");
                        break None;
                    }
                    self.shared.settled.wait(&mut state);
                }
            };

            while let Some((released, plugin)) = next.take() {
                removed += 1;
                self.release(&released, plugin);
                next = self
                    .shared
                    .handles
                    .lock()
                    .settle(released.parent)
                    .inspect_err(|err| {
                        error!(id = %released.parent, error = %err, "cascade aborted");
                    })?;
                self.shared.settled.notify_all();
            }
        }
        Ok(removed)
    }

    fn release(&self, released: &ReleasedHandle, plugin: Option<PluginRef>) {
        if released.kind == HandleKind::DirectoryNode {
            self.continuations().invalidate_owner(released.id);
        }
        if let Some(plugin) = plugin {
            plugin.notify(released);
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::from_limits(TableLimits::default())
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("limits", &self.shared.limits)
            .field("live_handles", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaLimits;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Recorder {
        released: PlMutex<Vec<ReleasedHandle>>,
    }

    impl HandlePlugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle_released(&self, released: &ReleasedHandle) {
            self.released.lock().push(released.clone());
        }
    }

    impl Recorder {
        fn ids(&self) -> Vec<HandleId> {
            self.released.lock().iter().map(|r| r.id).collect()
        }
    }

    fn client() -> ClientIdentity {
        ClientIdentity::new(7, 1000)
    }

    fn session(table: &HandleTable, client: ClientIdentity) -> HandleId {
        table
            .create(HandleKind::DirectorySession, HandleId::NONE, None, client, None)
            .unwrap()
    }

    #[test]
    fn test_create_rejects_wrong_parent_kind_without_side_effects() {
        let table = HandleTable::default();
        let c = client();
        let s = session(&table, c);
        let before = table.stats();

        for (kind, parent) in [
            (HandleKind::Record, s),
            (HandleKind::DirectoryNode, HandleId::NONE),
            (HandleKind::DirectorySession, s),
            (HandleKind::DirectoryNode, HandleId::from_raw(77)),
        ] {
            let err = table.create(kind, parent, None, c, None).unwrap_err();
            assert_eq!(err, HandleError::InvalidParent { kind, parent });
        }

        assert_eq!(table.stats(), before);
        table.audit().unwrap();
    }

    #[test]
    fn test_verify_reports_kind_and_ownership() {
        let table = HandleTable::default();
        let plugin = Arc::new(Recorder::default());
        let c = client();
        let s = table
            .create(
                HandleKind::DirectorySession,
                HandleId::NONE,
                Some(PluginRef::from(Arc::clone(&plugin))),
                c,
                None,
            )
            .unwrap();

        let bound = table.verify(s, HandleKind::DirectorySession, &c).unwrap();
        assert_eq!(bound.map(|p| p.name().to_string()), Some("recorder".into()));

        assert_eq!(
            table.verify(s, HandleKind::DirectoryNode, &c).unwrap_err(),
            HandleError::WrongKind {
                id: s,
                expected: HandleKind::DirectoryNode,
                actual: HandleKind::DirectorySession,
            }
        );

        let stranger = ClientIdentity::new(8, 1000);
        assert!(matches!(
            table.verify(s, HandleKind::DirectoryNode, &stranger),
            Err(HandleError::NotOwner { .. })
        ));
        assert!(matches!(
            table.verify(HandleId::NONE, HandleKind::DirectorySession, &c),
            Err(HandleError::InvalidHandle { id }) if id.is_none()
        ));
    }

    #[test]
    fn test_remove_notifies_children_before_parent() {
        let table = HandleTable::default();
        let plugin = Arc::new(Recorder::default());
        let bound = || Some(PluginRef::from(Arc::clone(&plugin)));
        let c = client();

        let s = table
            .create(HandleKind::DirectorySession, HandleId::NONE, bound(), c, None)
            .unwrap();
        let n = table
            .create(HandleKind::DirectoryNode, s, bound(), c, Some("/LDAPv3".into()))
            .unwrap();
        let r = table.create(HandleKind::Record, n, bound(), c, None).unwrap();
        let a = table
            .create(HandleKind::AttributeList, n, bound(), c, None)
            .unwrap();

        table.remove(s, &c).unwrap();

        let order = plugin.ids();
        assert_eq!(order.len(), 4);
        assert_eq!(order[3], s);
        assert_eq!(order[2], n);
        assert!(order[..2].contains(&r) && order[..2].contains(&a));
        assert!(table.is_empty());
        assert!(table.clients().is_empty());

        let node_release = plugin
            .released
            .lock()
            .iter()
            .find(|released| released.id == n)
            .cloned()
            .unwrap();
        assert_eq!(node_release.display_name.as_deref(), Some("/LDAPv3"));
        assert_eq!(node_release.parent, s);
    }

    #[test]
    fn test_remove_unknown_or_foreign_handle_is_invalid() {
        let table = HandleTable::default();
        let c = client();
        let s = session(&table, c);

        let other = ClientIdentity::new(9, 9);
        assert_eq!(
            table.remove(s, &other),
            Err(HandleError::InvalidHandle { id: s })
        );
        table.remove(s, &c).unwrap();
        assert_eq!(table.remove(s, &c), Err(HandleError::InvalidHandle { id: s }));
    }

    #[test]
    fn test_rebind_sets_late_bound_plugin() {
        let table = HandleTable::default();
        let c = client();
        let s = session(&table, c);
        assert!(table
            .verify(s, HandleKind::DirectorySession, &c)
            .unwrap()
            .is_none());

        let plugin = Arc::new(Recorder::default());
        table.rebind(s, PluginRef::from(Arc::clone(&plugin))).unwrap();
        let bound = table
            .verify(s, HandleKind::DirectorySession, &c)
            .unwrap()
            .unwrap();
        assert!(bound.same_plugin(&PluginRef::from(Arc::clone(&plugin))));

        table.remove(s, &c).unwrap();
        assert_eq!(plugin.ids(), vec![s]);
        assert!(table.rebind(s, bound).is_err());
    }

    #[test]
    fn test_delegate_keeps_creator_of_record() {
        let table = HandleTable::default();
        let c = client();
        let s = session(&table, c);
        let helper = c.with_pid(2000);

        assert!(table.describe(s, &helper).is_err());
        table.delegate(s, helper.pid).unwrap();
        table.delegate(s, helper.pid).unwrap();

        let info = table.describe(s, &helper).unwrap();
        assert_eq!(info.client, c);
        assert_eq!(info.delegates, vec![2000]);
        assert!(table.delegate(HandleId::from_raw(55), 1).is_err());
    }

    #[test]
    fn test_cross_client_children_are_tracked_for_their_creator() {
        let table = HandleTable::default();
        let owner = client();
        let helper = owner.with_pid(4242);
        let s = session(&table, owner);
        table.delegate(s, helper.pid).unwrap();

        let n = table
            .create(HandleKind::DirectoryNode, s, None, helper, None)
            .unwrap();
        assert_eq!(table.client_usage(&helper).unwrap().top_level, vec![n]);

        assert_eq!(table.clean_client_refs(&helper), 1);
        assert!(!table.contains(n));
        assert!(table.contains(s));
        table.audit().unwrap();
    }

    #[test]
    fn test_high_water_crossing_is_counted_not_fatal() {
        let limits = TableLimits {
            client_high_water: 2,
            ..TableLimits::default()
        };
        let table = HandleTable::new(limits).unwrap();
        let c = client();
        for _ in 0..4 {
            session(&table, c);
        }
        let usage = table.client_usage(&c).unwrap();
        assert!(usage.above_high_water);
        assert_eq!(usage.live_handles, 4);
        assert_eq!(table.stats().high_water_crossings, 1);
    }

    #[test]
    fn test_reentrant_plugin_can_close_other_handles() {
        struct Closer {
            table: HandleTable,
            target: PlMutex<Option<(HandleId, ClientIdentity)>>,
        }

        impl HandlePlugin for Closer {
            fn name(&self) -> &str {
                "closer"
            }

            fn handle_released(&self, _released: &ReleasedHandle) {
                if let Some((id, client)) = self.target.lock().take() {
                    self.table.remove(id, &client).unwrap();
                }
            }
        }

        let table = HandleTable::default();
        let c = client();
        let first = session(&table, c);
        let second = session(&table, c);
        let closer = Arc::new(Closer {
            table: table.clone(),
            target: PlMutex::new(Some((second, c))),
        });
        table.rebind(first, PluginRef::from(closer)).unwrap();

        table.remove(first, &c).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_callback_closing_an_ancestor_keeps_post_order() {
        struct AncestorCloser {
            table: HandleTable,
            log: Arc<Recorder>,
            target: PlMutex<Option<(HandleId, ClientIdentity)>>,
            outcome: PlMutex<Option<Result<()>>>,
        }

        impl HandlePlugin for AncestorCloser {
            fn name(&self) -> &str {
                "ancestor-closer"
            }

            fn handle_released(&self, released: &ReleasedHandle) {
                self.log.handle_released(released);
                if let Some((id, client)) = self.target.lock().take() {
                    *self.outcome.lock() = Some(self.table.remove(id, &client));
                }
            }
        }

        let table = HandleTable::default();
        let log = Arc::new(Recorder::default());
        let bound = || Some(PluginRef::from(Arc::clone(&log)));
        let c = client();

        let s = table
            .create(HandleKind::DirectorySession, HandleId::NONE, bound(), c, None)
            .unwrap();
        let n = table
            .create(HandleKind::DirectoryNode, s, bound(), c, None)
            .unwrap();
        let closer = Arc::new(AncestorCloser {
            table: table.clone(),
            log: Arc::clone(&log),
            target: PlMutex::new(Some((s, c))),
            outcome: PlMutex::new(None),
        });
        let r = table
            .create(HandleKind::Record, n, Some(PluginRef::from(Arc::clone(&closer))), c, None)
            .unwrap();

        table.remove(n, &c).unwrap();

        assert_eq!(*closer.outcome.lock(), Some(Ok(())));
        let released: Vec<(HandleId, HandleId)> = log
            .released
            .lock()
            .iter()
            .map(|released| (released.id, released.parent))
            .collect();
        assert_eq!(released, vec![(r, n), (n, s), (s, HandleId::NONE)]);
        assert!(table.is_empty());
        assert!(table.clients().is_empty());
        table.audit().unwrap();
    }

    #[test]
    fn test_stats_track_segments_and_kinds() {
        let limits = TableLimits {
            handles: ArenaLimits::new(2, 4),
            ..TableLimits::default()
        };
        let table = HandleTable::new(limits).unwrap();
        let c = client();
        let s = session(&table, c);
        let n = table
            .create(HandleKind::DirectoryNode, s, None, c, None)
            .unwrap();
        table.create(HandleKind::Record, n, None, c, None).unwrap();

        let stats = table.stats();
        assert_eq!(stats.live_handles, 3);
        assert_eq!(stats.segments_allocated, 2);
        assert_eq!(stats.capacity, 8);
        assert_eq!(stats.by_kind[&HandleKind::Record], 1);
        assert_eq!(stats.by_kind[&HandleKind::AttributeList], 0);
        assert_eq!(stats.clients, 1);
    }

    #[test]
    fn test_new_rejects_invalid_limits() {
        let limits = TableLimits {
            client_high_water: 0,
            ..TableLimits::default()
        };
        assert!(matches!(
            HandleTable::new(limits),
            Err(HandleError::InvalidLimits { .. })
        ));
    }
}
