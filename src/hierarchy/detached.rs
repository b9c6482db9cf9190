//! Detached subtrees.
//!
//! A deleted-with-detach subtree lives on as one compressed blob, in
//! memory or on disk, addressed by every node id it contains. Touching
//! any of those ids rehydrates the whole subtree.

use std::{collections::BTreeMap, fs, path::PathBuf, rc::Rc};

use crate::{
    hierarchy::SelvaHierarchy,
    snapshot::{self, SnapNode, SnapSubtree},
    sstring,
    types::NodeId,
    Result,
};

// Blobs at least this big go to disk instead of staying resident.
const DISK_LIMIT: usize = 1 << 20;

/// Where one detached subtree blob lives.
#[derive(Clone)]
pub enum DetachedStore {
    InMem(Rc<Vec<u8>>),
    OnDisk(Rc<PathBuf>),
}

impl DetachedStore {
    pub(crate) fn in_mem(blob: Vec<u8>) -> DetachedStore {
        DetachedStore::InMem(Rc::new(blob))
    }
}

/// Index over detached node ids. Every node of a detached subtree maps
/// to the shared blob of that subtree.
pub struct DetachedIndex {
    map: BTreeMap<NodeId, DetachedStore>,
}

impl DetachedIndex {
    pub fn new() -> DetachedIndex {
        DetachedIndex { map: BTreeMap::new() }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.map.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn get(&self, id: &NodeId) -> Option<DetachedStore> {
        self.map.get(id).cloned()
    }

    pub(crate) fn put(&mut self, id: NodeId, store: DetachedStore) {
        self.map.insert(id, store);
    }

    pub(crate) fn remove_keys(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.map.remove(id);
        }
    }

    pub(crate) fn entries(&self) -> Vec<(NodeId, DetachedStore)> {
        self.map.iter().map(|(id, store)| (*id, store.clone())).collect()
    }
}

impl Default for DetachedIndex {
    fn default() -> DetachedIndex {
        DetachedIndex::new()
    }
}

fn dump_path(h: &SelvaHierarchy, attach: &NodeId) -> PathBuf {
    std::env::temp_dir().join(format!(
        "selva_{}_{}_{}.z",
        std::process::id(),
        h.session_nonce(),
        attach
    ))
}

pub(crate) fn read_blob(store: &DetachedStore) -> Result<Vec<u8>> {
    match store {
        DetachedStore::InMem(blob) => Ok(blob.as_ref().clone()),
        DetachedStore::OnDisk(path) => err_at!(Fatal, fs::read(path.as_ref())),
    }
}

/// Compress the node snapshots of a freshly deleted subtree and index
/// the blob under every deleted id.
pub(crate) fn store_subtree(
    h: &mut SelvaHierarchy,
    attach: &NodeId,
    ids: &[NodeId],
    nodes: Vec<SnapNode>,
) -> Result<()> {
    let subtree = SnapSubtree { attach: attach.as_bytes().to_vec(), nodes };
    let raw = snapshot::into_cbor_bytes(subtree)?;
    let blob = sstring::deflate(&raw)?;
    let store = if blob.len() >= DISK_LIMIT {
        let path = dump_path(h, attach);
        err_at!(Fatal, fs::write(&path, &blob))?;
        DetachedStore::OnDisk(Rc::new(path))
    } else {
        DetachedStore::in_mem(blob)
    };
    for id in ids {
        h.detached.put(*id, store.clone());
    }
    Ok(())
}

// Test hook: force a subtree blob out to disk.
#[cfg(test)]
pub(crate) fn spill_to_disk(h: &mut SelvaHierarchy, id: &NodeId) -> Result<PathBuf> {
    let store = match h.detached.get(id) {
        Some(store) => store,
        None => return err_at!(NotFound, msg: "not detached: {}", id),
    };
    let blob = read_blob(&store)?;
    let path = dump_path(h, id);
    err_at!(Fatal, fs::write(&path, &blob))?;
    let on_disk = DetachedStore::OnDisk(Rc::new(path.clone()));
    let ids: Vec<NodeId> = h
        .detached
        .entries()
        .into_iter()
        .filter(|(_, s)| match (s, &store) {
            (DetachedStore::InMem(a), DetachedStore::InMem(b)) => Rc::ptr_eq(a, b),
            _ => false,
        })
        .map(|(id, _)| id)
        .collect();
    for id in ids {
        h.detached.put(id, on_disk.clone());
    }
    Ok(path)
}

/// Rehydrate the detached subtree containing `id`: read and decompress
/// the blob, reinstate the nodes and drop the index entries.
pub fn restore_subtree(h: &mut SelvaHierarchy, id: &NodeId) -> Result<usize> {
    let store = match h.detached.get(id) {
        Some(store) => store,
        None => return err_at!(NotFound, msg: "not detached: {}", id),
    };
    let blob = read_blob(&store)?;
    let raw = sstring::inflate_raw(&blob)?;
    let subtree: SnapSubtree = snapshot::from_cbor_bytes(&raw)?;
    let count = snapshot::restore_nodes(h, &subtree.nodes)?;

    let ids: Vec<NodeId> = subtree.nodes.iter().map(|sn| NodeId::new(&sn.id)).collect();
    h.detached.remove_keys(&ids);
    if let DetachedStore::OnDisk(path) = &store {
        fs::remove_file(path.as_ref()).ok();
    }
    Ok(count)
}

#[cfg(test)]
#[path = "detached_test.rs"]
mod detached_test;
