//! Per-client index of top-level handles and live handle counts.
//!
//! Disconnect cleanup walks this index instead of scanning the table. The
//! index does not know the table's storage layout; it only holds ids.

use crate::types::ClientUsage;
use dirsvc_types::{ClientIdentity, HandleId};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct ClientSession {
    top_level: BTreeSet<HandleId>,
    live: usize,
    above_high_water: bool,
}

impl ClientSession {
    fn is_idle(&self) -> bool {
        self.live == 0 && self.top_level.is_empty()
    }
}

/// Result of bumping a client's live count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountUpdate {
    pub count: usize,
    /// True only on the increment that reached the high-water mark.
    pub crossed_high_water: bool,
}

#[derive(Debug)]
pub struct ClientSessionIndex {
    sessions: HashMap<ClientIdentity, ClientSession>,
    high_water: usize,
}

impl ClientSessionIndex {
    pub fn new(high_water: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            high_water,
        }
    }

    pub fn track(&mut self, client: ClientIdentity, id: HandleId) {
        self.sessions.entry(client).or_default().top_level.insert(id);
    }

    pub fn untrack(&mut self, client: &ClientIdentity, id: HandleId) {
        if let Some(session) = self.sessions.get_mut(client) {
            session.top_level.remove(&id);
            if session.is_idle() {
                self.sessions.remove(client);
            }
        }
    }

    /// Top-level handles created by `client`, in id order.
    pub fn roots_for(&self, client: &ClientIdentity) -> Vec<HandleId> {
        self.sessions
            .get(client)
            .map(|session| session.top_level.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn increment(&mut self, client: ClientIdentity) -> CountUpdate {
        let high_water = self.high_water;
        let session = self.sessions.entry(client).or_default();
        session.live += 1;
        let crossed = !session.above_high_water && session.live >= high_water;
        if crossed {
            session.above_high_water = true;
        }
        CountUpdate {
            count: session.live,
            crossed_high_water: crossed,
        }
    }

    pub fn decrement(&mut self, client: &ClientIdentity) -> usize {
        let Some(session) = self.sessions.get_mut(client) else {
            return 0;
        };
        session.live = session.live.saturating_sub(1);
        if session.live < self.high_water {
            session.above_high_water = false;
        }
        let remaining = session.live;
        if session.is_idle() {
            self.sessions.remove(client);
        }
        remaining
    }

    pub fn count(&self, client: &ClientIdentity) -> usize {
        self.sessions
            .get(client)
            .map(|session| session.live)
            .unwrap_or(0)
    }

    pub fn usage(&self, client: &ClientIdentity) -> Option<ClientUsage> {
        self.sessions.get(client).map(|session| ClientUsage {
            client: *client,
            live_handles: session.live,
            top_level: session.top_level.iter().copied().collect(),
            above_high_water: session.above_high_water,
        })
    }

    pub fn clients(&self) -> Vec<ClientIdentity> {
        let mut clients: Vec<ClientIdentity> = self.sessions.keys().copied().collect();
        clients.sort_unstable();
        clients
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn is_tracked(&self, client: &ClientIdentity, id: HandleId) -> bool {
        self.sessions
            .get(client)
            .is_some_and(|session| session.top_level.contains(&id))
    }

    pub(crate) fn total_live(&self) -> usize {
        self.sessions.values().map(|session| session.live).sum()
    }
}
