//! Seed and peer tables.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chronicle_types::{Duty, NodeId};
use tracing::{debug, warn};

use crate::{DirectoryError, PeerInfo, Result, Store};

/// Column family holding directory entries.
pub const PEERS_CF: &str = "peers";

#[derive(Debug, Default)]
struct Tables {
    seeds: HashMap<NodeId, PeerInfo>,
    peers: HashMap<NodeId, PeerInfo>,
}

impl Tables {
    fn table_mut(&mut self, duty: Duty) -> &mut HashMap<NodeId, PeerInfo> {
        match duty {
            Duty::Seed => &mut self.seeds,
            Duty::Peer => &mut self.peers,
        }
    }

    fn get(&self, id: &NodeId) -> Option<&PeerInfo> {
        self.seeds.get(id).or_else(|| self.peers.get(id))
    }
}

/// Cluster membership, optionally persisted.
///
/// Iteration callbacks run over a snapshot, never under the lock.
pub struct PeerDirectory {
    tables: RwLock<Tables>,
    store: Option<Arc<dyn Store>>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    /// In-memory directory.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            store: None,
        }
    }

    /// Directory backed by `store`; existing entries are loaded.
    pub fn with_store(store: Arc<dyn Store>) -> Result<Self> {
        let mut tables = Tables::default();
        for (_, value) in store.scan(PEERS_CF)? {
            let info: PeerInfo = serde_json::from_slice(&value)?;
            tables.table_mut(info.duty).insert(info.id, info);
        }
        debug!(
            seeds = tables.seeds.len(),
            peers = tables.peers.len(),
            "Loaded peer directory"
        );
        Ok(Self {
            tables: RwLock::new(tables),
            store: Some(store),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &NodeId) -> Result<PeerInfo> {
        self.read()
            .get(id)
            .cloned()
            .ok_or(DirectoryError::UnknownPeer(*id))
    }

    /// Flush and close the backing store, if any.
    pub fn close(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.close()?;
        }
        Ok(())
    }

    /// Insert or refresh an entry. Older info for a known id is ignored.
    ///
    /// Returns true if the directory changed.
    pub fn set(&self, info: PeerInfo) -> Result<bool> {
        {
            let mut tables = self.write();
            if let Some(existing) = tables.get(&info.id) {
                if !info.is_newer_than(existing) {
                    return Ok(false);
                }
            }
            // Duty can change across restarts; never keep both.
            tables.seeds.remove(&info.id);
            tables.peers.remove(&info.id);
            tables.table_mut(info.duty).insert(info.id, info.clone());
        }
        if let Some(store) = &self.store {
            let value = serde_json::to_vec(&info)?;
            store.set(PEERS_CF, info.id.as_bytes(), &value)?;
        }
        debug!(peer = %info, "Directory entry updated");
        Ok(true)
    }

    pub fn remove(&self, id: &NodeId) -> Result<Option<PeerInfo>> {
        let removed = {
            let mut tables = self.write();
            tables.seeds.remove(id).or_else(|| tables.peers.remove(id))
        };
        if removed.is_some() {
            if let Some(store) = &self.store {
                store.delete(PEERS_CF, id.as_bytes())?;
            }
        }
        Ok(removed)
    }

    /// Call `f` for every seed. Returns the number of seeds visited and
    /// the ids whose callback failed.
    pub fn range_seeds<E, F>(&self, f: F) -> (usize, Vec<(NodeId, E)>)
    where
        F: FnMut(&PeerInfo) -> std::result::Result<(), E>,
    {
        range(self.seeds(), f)
    }

    /// Call `f` for every peer.
    pub fn range_peers<E, F>(&self, f: F) -> (usize, Vec<(NodeId, E)>)
    where
        F: FnMut(&PeerInfo) -> std::result::Result<(), E>,
    {
        range(self.peers(), f)
    }

    pub fn is_seed(&self, id: &NodeId) -> bool {
        self.read().seeds.contains_key(id)
    }

    pub fn is_peer(&self, id: &NodeId) -> bool {
        self.read().peers.contains_key(id)
    }

    /// Snapshot of all seeds, ordered by id.
    pub fn seeds(&self) -> Vec<PeerInfo> {
        sorted(self.read().seeds.values())
    }

    /// Snapshot of all peers, ordered by id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        sorted(self.read().peers.values())
    }

    /// Everyone, seeds first.
    pub fn all(&self) -> Vec<PeerInfo> {
        let mut everyone = self.seeds();
        everyone.extend(self.peers());
        everyone
    }

    pub fn len(&self) -> usize {
        let tables = self.read();
        tables.seeds.len() + tables.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted<'a>(entries: impl Iterator<Item = &'a PeerInfo>) -> Vec<PeerInfo> {
    let mut out: Vec<PeerInfo> = entries.cloned().collect();
    out.sort_by_key(|p| p.id);
    out
}

fn range<E, F>(entries: Vec<PeerInfo>, mut f: F) -> (usize, Vec<(NodeId, E)>)
where
    F: FnMut(&PeerInfo) -> std::result::Result<(), E>,
{
    let total = entries.len();
    let mut errors = Vec::new();
    for info in &entries {
        if let Err(e) = f(info) {
            errors.push((info.id, e));
        }
    }
    if !errors.is_empty() {
        warn!(total, failed = errors.len(), "Directory range had failures");
    }
    (total, errors)
}
