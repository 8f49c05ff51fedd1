//! Types for the handle table

use dirsvc_types::{ClientIdentity, HandleId, HandleKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A subsystem that owns handles and must hear about their removal.
///
/// `handle_released` runs with no table lock held and may call back into the
/// table (open or close other handles).
pub trait HandlePlugin: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Called exactly once for every removed handle bound to this plugin.
    fn handle_released(&self, released: &ReleasedHandle);
}

/// Shared reference to the plugin a handle is bound to.
#[derive(Clone)]
pub struct PluginRef(Arc<dyn HandlePlugin>);

impl PluginRef {
    pub fn new(plugin: Arc<dyn HandlePlugin>) -> Self {
        Self(plugin)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Identity comparison: true when both refer to the same plugin instance.
    pub fn same_plugin(&self, other: &PluginRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn plugin(&self) -> &Arc<dyn HandlePlugin> {
        &self.0
    }

    pub(crate) fn notify(&self, released: &ReleasedHandle) {
        self.0.handle_released(released);
    }
}

impl<P: HandlePlugin + 'static> From<Arc<P>> for PluginRef {
    fn from(plugin: Arc<P>) -> Self {
        Self(plugin)
    }
}

impl fmt::Debug for PluginRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginRef").field(&self.name()).finish()
    }
}

/// Snapshot of a handle handed to its plugin on removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedHandle {
    pub id: HandleId,
    pub kind: HandleKind,
    pub parent: HandleId,
    pub client: ClientIdentity,
    pub display_name: Option<String>,
}

/// Stored state of one live handle.
#[derive(Debug)]
pub(crate) struct HandleEntry {
    pub id: HandleId,
    pub kind: HandleKind,
    /// `HandleId::NONE` for roots.
    pub parent: HandleId,
    pub plugin: Option<PluginRef>,
    pub client: ClientIdentity,
    pub children: HashSet<HandleId>,
    pub display_name: Option<String>,
    pub delegates: HashSet<u32>,
    /// Tracked in the client index as one of the creator's top-level handles.
    pub top_level: bool,
    /// Claimed by a cascade; invisible to lookups from then on.
    pub closing: bool,
    /// Claimed, but its unlink was left to whichever cascade finishes its
    /// last child.
    pub handed_off: bool,
    /// Children already unlinked whose plugin has not been notified yet.
    pub unsettled: usize,
}

impl HandleEntry {
    pub fn is_usable_by(&self, client: &ClientIdentity) -> bool {
        self.client == *client || self.delegates.contains(&client.pid)
    }

    pub fn released(&self) -> ReleasedHandle {
        ReleasedHandle {
            id: self.id,
            kind: self.kind,
            parent: self.parent,
            client: self.client,
            display_name: self.display_name.clone(),
        }
    }

    pub fn info(&self) -> HandleInfo {
        let mut delegates: Vec<u32> = self.delegates.iter().copied().collect();
        delegates.sort_unstable();
        HandleInfo {
            id: self.id,
            kind: self.kind,
            parent: self.parent,
            client: self.client,
            display_name: self.display_name.clone(),
            children: self.children.len(),
            delegates,
            plugin: self.plugin.as_ref().map(|plugin| plugin.name().to_string()),
        }
    }
}

/// Read-only description of a live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub kind: HandleKind,
    pub parent: HandleId,
    /// Creator of record.
    pub client: ClientIdentity,
    pub display_name: Option<String>,
    pub children: usize,
    pub delegates: Vec<u32>,
    /// Name of the bound plugin, `None` while awaiting late binding.
    pub plugin: Option<String>,
}

/// Handle usage of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUsage {
    pub client: ClientIdentity,
    pub live_handles: usize,
    pub top_level: Vec<HandleId>,
    pub above_high_water: bool,
}

/// Table-wide counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub live_handles: usize,
    pub by_kind: BTreeMap<HandleKind, usize>,
    pub segments_allocated: usize,
    pub max_segments: u32,
    pub capacity: u32,
    pub clients: usize,
    pub high_water_crossings: u64,
    pub continuation_tokens: usize,
}
