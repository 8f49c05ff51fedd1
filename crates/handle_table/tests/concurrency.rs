//! Multi-threaded use of one table: overlapping removals, disconnect sweeps
//! racing in-flight calls, and plugins that re-enter the table from their
//! removal callback.

use dirsvc_handle_table::{
    ClientIdentity, HandleError, HandleId, HandleKind, HandlePlugin, HandleTable, PluginRef,
    ReleasedHandle,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

const WORKERS: usize = 8;

#[derive(Default)]
struct CountingPlugin {
    per_handle: Mutex<HashMap<HandleId, usize>>,
    order: Mutex<Vec<ReleasedHandle>>,
}

impl HandlePlugin for CountingPlugin {
    fn name(&self) -> &str {
        "counting"
    }

    fn handle_released(&self, released: &ReleasedHandle) {
        *self.per_handle.lock().entry(released.id).or_default() += 1;
        self.order.lock().push(released.clone());
    }
}

/// Asserts every released parent was notified after all of its children.
fn assert_post_order(order: &[ReleasedHandle]) {
    let position: HashMap<HandleId, usize> = order
        .iter()
        .enumerate()
        .map(|(index, released)| (released.id, index))
        .collect();
    for (index, released) in order.iter().enumerate() {
        if released.parent.is_none() {
            continue;
        }
        if let Some(parent_index) = position.get(&released.parent) {
            assert!(
                *parent_index > index,
                "{} notified before its child {}",
                released.parent,
                released.id
            );
        }
    }
}

fn build_tree(table: &HandleTable, client: ClientIdentity, plugin: &PluginRef) -> Vec<HandleId> {
    let bound = || Some(plugin.clone());
    let session = table
        .create(HandleKind::DirectorySession, HandleId::NONE, bound(), client, None)
        .unwrap();
    let mut ids = vec![session];
    for _ in 0..3 {
        let node = table
            .create(HandleKind::DirectoryNode, session, bound(), client, None)
            .unwrap();
        ids.push(node);
        for kind in [
            HandleKind::Record,
            HandleKind::AttributeList,
            HandleKind::AttributeValueList,
        ] {
            ids.push(table.create(kind, node, bound(), client, None).unwrap());
        }
    }
    ids
}

#[test]
fn test_overlapping_removes_notify_each_handle_once() {
    let table = HandleTable::default();
    let plugin = Arc::new(CountingPlugin::default());
    let plugin_ref = PluginRef::from(Arc::clone(&plugin));
    let client = ClientIdentity::new(1, 1);
    let ids = build_tree(&table, client, &plugin_ref);
    let barrier = Barrier::new(WORKERS);
    let successes = AtomicUsize::new(0);

    thread::scope(|scope| {
        for worker in 0..WORKERS {
            let table = &table;
            let ids = &ids;
            let barrier = &barrier;
            let successes = &successes;
            scope.spawn(move || {
                barrier.wait();
                // Half the workers go for the session, the rest for a node.
                let target = if worker % 2 == 0 { ids[0] } else { ids[1] };
                match table.remove(target, &client) {
                    Ok(()) => {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => assert_eq!(err, HandleError::InvalidHandle { id: target }),
                }
            });
        }
    });

    assert!(successes.load(Ordering::SeqCst) >= 1);
    assert!(table.is_empty());
    let counts = plugin.per_handle.lock();
    assert_eq!(counts.len(), ids.len());
    assert!(counts.values().all(|count| *count == 1));

    let order = plugin.order.lock();
    assert_post_order(&order);
    let roots: Vec<HandleId> = order
        .iter()
        .filter(|released| released.parent.is_none())
        .map(|released| released.id)
        .collect();
    assert_eq!(roots, vec![ids[0]]);
    table.audit().unwrap();
}

/// Records release order and stalls on the first record it sees.
struct StallingPlugin {
    order: Mutex<Vec<(HandleId, HandleId)>>,
    stalled: Mutex<Option<mpsc::Sender<()>>>,
}

impl HandlePlugin for StallingPlugin {
    fn name(&self) -> &str {
        "stalling"
    }

    fn handle_released(&self, released: &ReleasedHandle) {
        self.order.lock().push((released.id, released.parent));
        if released.kind != HandleKind::Record {
            return;
        }
        if let Some(stalled) = self.stalled.lock().take() {
            stalled.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
        }
    }
}

#[test]
fn test_remove_waits_for_descendants_released_by_another_thread() {
    let table = HandleTable::default();
    let client = ClientIdentity::new(2, 2);
    let (stalled_tx, stalled_rx) = mpsc::channel();
    let plugin = Arc::new(StallingPlugin {
        order: Mutex::new(Vec::new()),
        stalled: Mutex::new(Some(stalled_tx)),
    });
    let bound = || Some(PluginRef::from(Arc::clone(&plugin)));

    let session = table
        .create(HandleKind::DirectorySession, HandleId::NONE, bound(), client, None)
        .unwrap();
    let node = table
        .create(HandleKind::DirectoryNode, session, bound(), client, None)
        .unwrap();
    let record = table
        .create(HandleKind::Record, node, bound(), client, None)
        .unwrap();

    thread::scope(|scope| {
        let table = &table;
        let node_closer = scope.spawn(move || table.remove(node, &client));

        // The node's cascade is now inside the record's callback.
        stalled_rx.recv().unwrap();
        table.remove(session, &client).unwrap();

        assert!(table.is_empty());
        assert_eq!(
            *plugin.order.lock(),
            vec![(record, node), (node, session), (session, HandleId::NONE)]
        );
        node_closer.join().unwrap().unwrap();
    });
    table.audit().unwrap();
}

#[test]
fn test_disconnect_sweep_races_verification() {
    let table = HandleTable::default();
    let plugin = Arc::new(CountingPlugin::default());
    let plugin_ref = PluginRef::from(Arc::clone(&plugin));
    let clients: Vec<ClientIdentity> = (0..WORKERS as u32)
        .map(|pid| ClientIdentity::new(9, 100 + pid))
        .collect();
    let trees: Vec<Vec<HandleId>> = clients
        .iter()
        .map(|client| build_tree(&table, *client, &plugin_ref))
        .collect();
    let barrier = Barrier::new(WORKERS * 2);

    thread::scope(|scope| {
        for (client, tree) in clients.iter().zip(&trees) {
            let table = &table;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                table.clean_client_refs(client);
                table.clean_client_refs(client);
            });
            scope.spawn(move || {
                barrier.wait();
                for id in tree.iter().cycle().take(200) {
                    match table.verify(*id, HandleKind::Record, client) {
                        Ok(_)
                        | Err(HandleError::WrongKind { .. })
                        | Err(HandleError::InvalidHandle { .. }) => {}
                        Err(other) => panic!("unexpected verify failure: {other}"),
                    }
                }
            });
        }
    });

    assert!(table.is_empty());
    assert!(table.clients().is_empty());
    assert_eq!(
        plugin.per_handle.lock().len(),
        trees.iter().map(Vec::len).sum::<usize>()
    );
    table.audit().unwrap();
}

/// Opens and closes a scratch session from inside every removal callback.
struct ReentrantPlugin {
    table: HandleTable,
    client: ClientIdentity,
    callbacks: AtomicUsize,
}

impl HandlePlugin for ReentrantPlugin {
    fn name(&self) -> &str {
        "reentrant"
    }

    fn handle_released(&self, released: &ReleasedHandle) {
        self.callbacks.fetch_add(1, Ordering::SeqCst);
        if released.kind == HandleKind::DirectorySession {
            return;
        }
        let scratch = self
            .table
            .create(HandleKind::DirectorySession, HandleId::NONE, None, self.client, None)
            .unwrap();
        self.table.remove(scratch, &self.client).unwrap();
    }
}

#[test]
fn test_reentrant_callbacks_do_not_deadlock() {
    let table = HandleTable::default();
    let client = ClientIdentity::new(3, 3);
    let plugin = Arc::new(ReentrantPlugin {
        table: table.clone(),
        client,
        callbacks: AtomicUsize::new(0),
    });
    let plugin_ref = PluginRef::from(Arc::clone(&plugin));

    let trees: Vec<Vec<HandleId>> = (0..WORKERS)
        .map(|_| build_tree(&table, client, &plugin_ref))
        .collect();
    drop(plugin_ref);

    thread::scope(|scope| {
        for tree in &trees {
            let table = &table;
            scope.spawn(move || table.remove(tree[0], &client).unwrap());
        }
    });

    assert_eq!(
        plugin.callbacks.load(Ordering::SeqCst),
        trees.iter().map(Vec::len).sum::<usize>()
    );
    assert!(table.is_empty());
}

#[test]
fn test_continuation_put_races_node_removal() {
    let table = HandleTable::default();
    let store = table.continuations();
    let client = ClientIdentity::new(5, 5);
    let session = table
        .create(HandleKind::DirectorySession, HandleId::NONE, None, client, None)
        .unwrap();
    let nodes: Vec<HandleId> = (0..WORKERS)
        .map(|_| {
            table
                .create(HandleKind::DirectoryNode, session, None, client, None)
                .unwrap()
        })
        .collect();
    let stored = AtomicUsize::new(0);
    let released = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for node in &nodes {
            let table = &table;
            let store = &store;
            let stored = &stored;
            let released = &released;
            scope.spawn(move || {
                for page in 0..50u32 {
                    let counter = Arc::clone(released);
                    let put = store.put(*node, page, move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    match put {
                        Ok(_) => {
                            stored.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => assert_eq!(err, HandleError::InvalidOwner { owner: *node }),
                    }
                }
            });
            scope.spawn(move || table.remove(*node, &client).unwrap());
        }
    });

    // No token may outlive its node.
    assert!(store.is_empty());
    assert_eq!(
        released.load(Ordering::SeqCst),
        stored.load(Ordering::SeqCst)
    );
}
