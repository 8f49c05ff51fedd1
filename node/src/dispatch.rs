//! Request dispatch on top of the handle table.
//!
//! Every call that names a handle verifies it first, so backends never see a
//! stale or foreign handle. Closing tears down backend state before removing
//! the handle. Paginated searches keep their cursor in the continuation
//! store, owned by the node being searched.

use dirsvc_handle_table::{
    ClientIdentity, ContinuationStore, ContinuationToken, HandleError, HandleId, HandleKind,
    HandlePlugin, HandleTable, PluginRef, ReleasedHandle,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("No such node: {path}")]
    NoSuchNode { path: String },

    #[error("No such record {name} in {path}")]
    NoSuchRecord { path: String, name: String },

    #[error("Backend failure: {0}")]
    Failed(String),
}

/// Error reported back to a client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Handle(HandleError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<HandleError> for ClientError {
    fn from(err: HandleError) -> Self {
        ClientError::Handle(err.client_visible())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Directory storage the dispatcher drives. Handles it opens are bound to
/// it, so it hears about every removal through [`HandlePlugin`].
pub trait DirectoryBackend: HandlePlugin {
    fn open_node(&self, path: &str) -> Result<(), BackendError>;

    fn open_record(&self, path: &str, name: &str) -> Result<(), BackendError>;

    /// Names of every record under `path` matching `pattern`, in a stable order.
    fn search(&self, path: &str, pattern: &str) -> Result<Vec<String>, BackendError>;

    /// Release backend state tied to `id` before the handle is removed.
    fn teardown(&self, id: HandleId, kind: HandleKind) -> Result<(), BackendError>;
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchPage {
    pub results: Vec<String>,
    /// Present while more results remain.
    pub continuation: Option<ContinuationToken>,
}

struct SearchCursor {
    results: Arc<Vec<String>>,
    offset: usize,
}

pub struct Dispatcher<B: DirectoryBackend + 'static> {
    table: HandleTable,
    continuations: ContinuationStore,
    backend: Arc<B>,
    plugin: PluginRef,
    chunk_size: usize,
}

impl<B: DirectoryBackend + 'static> Dispatcher<B> {
    pub fn new(table: HandleTable, backend: Arc<B>, chunk_size: usize) -> Self {
        let plugin = PluginRef::from(Arc::clone(&backend));
        Self {
            continuations: table.continuations(),
            table,
            backend,
            plugin,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Verify `id` for `client`. A handle owned by someone else is reported
    /// exactly like one that does not exist.
    pub fn resolve(
        &self,
        id: HandleId,
        kind: HandleKind,
        client: &ClientIdentity,
    ) -> ClientResult<Option<PluginRef>> {
        Ok(self.table.verify(id, kind, client)?)
    }

    pub fn open_session(&self, client: ClientIdentity) -> ClientResult<HandleId> {
        let id = self.table.create(
            HandleKind::DirectorySession,
            HandleId::NONE,
            Some(self.plugin.clone()),
            client,
            None,
        )?;
        Ok(id)
    }

    pub fn open_node(
        &self,
        session: HandleId,
        path: &str,
        client: ClientIdentity,
    ) -> ClientResult<HandleId> {
        self.resolve(session, HandleKind::DirectorySession, &client)?;
        self.backend.open_node(path)?;
        let id = self.table.create(
            HandleKind::DirectoryNode,
            session,
            Some(self.plugin.clone()),
            client,
            Some(path.to_string()),
        )?;
        Ok(id)
    }

    pub fn open_record(
        &self,
        node: HandleId,
        name: &str,
        client: ClientIdentity,
    ) -> ClientResult<HandleId> {
        let path = self.node_path(node, &client)?;
        self.backend.open_record(&path, name)?;
        self.open_child(HandleKind::Record, node, client, Some(name.to_string()))
    }

    pub fn open_attribute_list(
        &self,
        node: HandleId,
        client: ClientIdentity,
    ) -> ClientResult<HandleId> {
        self.resolve(node, HandleKind::DirectoryNode, &client)?;
        self.open_child(HandleKind::AttributeList, node, client, None)
    }

    pub fn open_attribute_value_list(
        &self,
        node: HandleId,
        attribute: &str,
        client: ClientIdentity,
    ) -> ClientResult<HandleId> {
        self.resolve(node, HandleKind::DirectoryNode, &client)?;
        self.open_child(
            HandleKind::AttributeValueList,
            node,
            client,
            Some(attribute.to_string()),
        )
    }

    /// Close `id` and everything opened under it.
    ///
    /// The handle is removed even when backend teardown fails; the teardown
    /// error is still returned, also when a concurrent close removed the
    /// handle first.
    pub fn close(&self, id: HandleId, kind: HandleKind, client: &ClientIdentity) -> ClientResult<()> {
        self.resolve(id, kind, client)?;
        let teardown = self.backend.teardown(id, kind);
        if let Err(err) = &teardown {
            warn!(%id, %kind, %client, error = %err, "teardown failed, removing handle anyway");
        }
        match self.table.remove(id, client) {
            Ok(()) => {}
            Err(HandleError::InvalidHandle { .. }) if teardown.is_err() => {
                debug!(%id, %client, "handle already closed elsewhere");
            }
            Err(err) => return Err(err.into()),
        }
        teardown.map_err(ClientError::from)
    }

    /// Allow process `pid` to use `id`. Only someone who may use the handle
    /// can hand it on.
    pub fn delegate(
        &self,
        id: HandleId,
        kind: HandleKind,
        client: &ClientIdentity,
        pid: u32,
    ) -> ClientResult<()> {
        self.resolve(id, kind, client)?;
        self.table.delegate(id, pid)?;
        Ok(())
    }

    /// Release everything a departed client left open. Safe to repeat.
    pub fn client_disconnected(&self, client: &ClientIdentity) -> usize {
        let removed = self.table.clean_client_refs(client);
        debug!(%client, removed, "client disconnected");
        removed
    }

    pub fn begin_search(
        &self,
        node: HandleId,
        pattern: &str,
        client: &ClientIdentity,
    ) -> ClientResult<SearchPage> {
        let path = self.node_path(node, client)?;
        let results = Arc::new(self.backend.search(&path, pattern)?);
        debug!(%node, %path, pattern, matches = results.len(), "search started");
        self.page(node, results, 0)
    }

    /// Next page for `token`. The token is consumed; the returned page
    /// carries a fresh one while results remain.
    pub fn continue_search(
        &self,
        node: HandleId,
        token: ContinuationToken,
        client: &ClientIdentity,
    ) -> ClientResult<SearchPage> {
        self.resolve(node, HandleKind::DirectoryNode, client)?;
        self.check_token_owner(node, token)?;
        let cursor = self.continuations.get_as::<SearchCursor>(token)?;
        if !self.continuations.release(token) {
            // Consumed by a concurrent call.
            return Err(HandleError::InvalidToken { token }.into());
        }
        self.page(node, Arc::clone(&cursor.results), cursor.offset)
    }

    /// Abandon a search before its last page.
    pub fn end_search(
        &self,
        node: HandleId,
        token: ContinuationToken,
        client: &ClientIdentity,
    ) -> ClientResult<()> {
        self.resolve(node, HandleKind::DirectoryNode, client)?;
        self.check_token_owner(node, token)?;
        if !self.continuations.release(token) {
            return Err(HandleError::InvalidToken { token }.into());
        }
        Ok(())
    }

    fn open_child(
        &self,
        kind: HandleKind,
        node: HandleId,
        client: ClientIdentity,
        display_name: Option<String>,
    ) -> ClientResult<HandleId> {
        let id = self
            .table
            .create(kind, node, Some(self.plugin.clone()), client, display_name)?;
        Ok(id)
    }

    fn node_path(&self, node: HandleId, client: &ClientIdentity) -> ClientResult<String> {
        self.resolve(node, HandleKind::DirectoryNode, client)?;
        Ok(self.table.display_name(node)?.unwrap_or_default())
    }

    fn check_token_owner(&self, node: HandleId, token: ContinuationToken) -> ClientResult<()> {
        if self.continuations.owner_of(token)? != node {
            debug!(%node, %token, "continuation presented against another node");
            return Err(HandleError::InvalidToken { token }.into());
        }
        Ok(())
    }

    fn page(
        &self,
        node: HandleId,
        results: Arc<Vec<String>>,
        offset: usize,
    ) -> ClientResult<SearchPage> {
        let start = offset.min(results.len());
        let end = start.saturating_add(self.chunk_size).min(results.len());
        let chunk = results[start..end].to_vec();

        let continuation = if end < results.len() {
            let cursor = SearchCursor {
                results: Arc::clone(&results),
                offset: end,
            };
            let token = self.continuations.put(node, cursor, move |_| {
                debug!(%node, offset = end, "search cursor released");
            })?;
            Some(token)
        } else {
            None
        };

        Ok(SearchPage {
            results: chunk,
            continuation,
        })
    }
}

/// In-memory directory: node paths mapped to their record names.
#[derive(Default)]
pub struct MemoryDirectory {
    nodes: Mutex<BTreeMap<String, Vec<String>>>,
    released: AtomicUsize,
    torn_down: AtomicUsize,
}

impl MemoryDirectory {
    pub fn add_node(&self, path: &str) {
        self.nodes.lock().entry(path.to_string()).or_default();
    }

    pub fn add_record(&self, path: &str, name: &str) {
        let mut nodes = self.nodes.lock();
        let records = nodes.entry(path.to_string()).or_default();
        if let Err(pos) = records.binary_search_by(|existing| existing.as_str().cmp(name)) {
            records.insert(pos, name.to_string());
        }
    }

    /// Handles released through this directory so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    pub fn torn_down(&self) -> usize {
        self.torn_down.load(Ordering::Relaxed)
    }
}

impl HandlePlugin for MemoryDirectory {
    fn name(&self) -> &str {
        "memory"
    }

    fn handle_released(&self, released: &ReleasedHandle) {
        self.released.fetch_add(1, Ordering::Relaxed);
        debug!(id = %released.id, kind = %released.kind, "memory directory released handle");
    }
}

impl DirectoryBackend for MemoryDirectory {
    fn open_node(&self, path: &str) -> Result<(), BackendError> {
        if self.nodes.lock().contains_key(path) {
            Ok(())
        } else {
            Err(BackendError::NoSuchNode {
                path: path.to_string(),
            })
        }
    }

    fn open_record(&self, path: &str, name: &str) -> Result<(), BackendError> {
        let nodes = self.nodes.lock();
        let records = nodes.get(path).ok_or_else(|| BackendError::NoSuchNode {
            path: path.to_string(),
        })?;
        if records.iter().any(|record| record == name) {
            Ok(())
        } else {
            Err(BackendError::NoSuchRecord {
                path: path.to_string(),
                name: name.to_string(),
            })
        }
    }

    fn search(&self, path: &str, pattern: &str) -> Result<Vec<String>, BackendError> {
        let nodes = self.nodes.lock();
        let records = nodes.get(path).ok_or_else(|| BackendError::NoSuchNode {
            path: path.to_string(),
        })?;
        Ok(records
            .iter()
            .filter(|record| record.contains(pattern))
            .cloned()
            .collect())
    }

    fn teardown(&self, _id: HandleId, _kind: HandleKind) -> Result<(), BackendError> {
        self.torn_down.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Dispatcher over a fresh in-memory directory, used when the daemon starts
/// without an external backend.
pub fn memory_dispatcher(table: HandleTable, chunk_size: usize) -> Dispatcher<MemoryDirectory> {
    let directory = MemoryDirectory::default();
    directory.add_node("/Local/Default");
    info!(nodes = 1, "memory directory ready");
    Dispatcher::new(table, Arc::new(directory), chunk_size)
}
