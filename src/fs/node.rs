//! In-memory node graph and inode identity.
//!
//! Parents own children through the children map; a child's parent link is a
//! weak back-reference, never an owner. Nodes that resolve to the same
//! backing (inode, device) pair share one inode record, which is what the
//! kernel sees as the file's identity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::crypto::blockio::BlockCache;

use super::layer::LayerIdx;

pub const FUSE_ROOT_ID: u64 = 1;

/// Deletion state for a node that is still referenced by kernel lookups.
/// Hidden nodes have been moved into the working directory and are unlinked
/// or removed on final release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenState {
    Active,
    PendingUnlink,
    PendingRmdir,
}

pub struct Node {
    pub name: Mutex<String>,
    /// Layer-relative path from the unified root; equals
    /// `parent.path + "/" + name` (re-established after rename).
    pub path: Mutex<String>,
    pub parent: Mutex<Weak<Node>>,
    /// Present for directories only.
    pub children: Mutex<Option<HashMap<String, Arc<Node>>>>,
    /// Topmost layer contributing this name.
    pub layer: Mutex<Option<LayerIdx>>,
    /// Deepest layer known to contribute to this name; lookup stops here.
    pub last_layer: Mutex<Option<LayerIdx>>,
    pub whiteout: AtomicBool,
    pub is_dir: AtomicBool,
    pub loaded: AtomicBool,
    pub hidden: Mutex<HiddenState>,
    /// Absolute working-directory location of a hidden node.
    pub hidden_path: Mutex<Option<PathBuf>>,
    pub in_readdir: AtomicU64,
    /// Bumped on every mutation of the children set, so an in-flight
    /// directory stream can detect staleness.
    pub dir_generation: AtomicU64,
    /// Origin inode and device captured from the backing layer.
    pub tmp_ino: AtomicU64,
    pub tmp_dev: AtomicU64,
    pub record: Mutex<Option<Arc<InodeRecord>>>,
    /// One-block plaintext cache for the crypto layer; the mutex doubles as
    /// the per-node cipher lock.
    pub block_cache: Mutex<BlockCache>,
}

impl Node {
    pub fn new(
        name: &str,
        path: &str,
        layer: Option<LayerIdx>,
        is_dir: bool,
        parent: Option<&Arc<Node>>,
        block_size: usize,
    ) -> Arc<Node> {
        Arc::new(Node {
            name: Mutex::new(name.to_string()),
            path: Mutex::new(path.to_string()),
            parent: Mutex::new(parent.map(Arc::downgrade).unwrap_or_default()),
            children: Mutex::new(if is_dir { Some(HashMap::new()) } else { None }),
            layer: Mutex::new(layer),
            last_layer: Mutex::new(layer),
            whiteout: AtomicBool::new(false),
            is_dir: AtomicBool::new(is_dir),
            loaded: AtomicBool::new(false),
            hidden: Mutex::new(HiddenState::Active),
            hidden_path: Mutex::new(None),
            in_readdir: AtomicU64::new(0),
            dir_generation: AtomicU64::new(0),
            tmp_ino: AtomicU64::new(0),
            tmp_dev: AtomicU64::new(0),
            record: Mutex::new(None),
            block_cache: Mutex::new(BlockCache::new(block_size)),
        })
    }

    /// A whiteout node never has children and is never copied up.
    pub fn new_whiteout(name: &str, path: &str, block_size: usize) -> Arc<Node> {
        let node = Node::new(name, path, None, false, None, block_size);
        node.whiteout.store(true, Ordering::Relaxed);
        node
    }

    pub fn is_whiteout(&self) -> bool {
        self.whiteout.load(Ordering::Relaxed)
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir.load(Ordering::Relaxed)
    }

    pub fn is_hidden(&self) -> bool {
        *self.hidden.lock() != HiddenState::Active
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn path(&self) -> String {
        self.path.lock().clone()
    }

    pub fn parent_node(&self) -> Option<Arc<Node>> {
        self.parent.lock().upgrade()
    }

    pub fn kernel_ino(&self) -> u64 {
        self.record
            .lock()
            .as_ref()
            .map(|r| r.kernel_ino)
            .unwrap_or(0)
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.lock().as_ref()?.get(name).cloned()
    }

    pub fn children_snapshot(&self) -> Vec<Arc<Node>> {
        self.children
            .lock()
            .as_ref()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<Node>> {
        let removed = self.children.lock().as_mut()?.remove(name);
        if removed.is_some() {
            self.dir_generation.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Count visible entries and whiteouts among the loaded children.
    pub fn count_entries(&self) -> (usize, usize) {
        let mut visible = 0;
        let mut whiteouts = 0;
        if let Some(children) = self.children.lock().as_ref() {
            for child in children.values() {
                if child.is_whiteout() {
                    whiteouts += 1;
                } else {
                    visible += 1;
                }
            }
        }
        (visible, whiteouts)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("path", &*self.path.lock())
            .field("whiteout", &self.is_whiteout())
            .field("dir", &self.is_dir())
            .finish()
    }
}

/// Insert `child` into `parent`. With `replace` false an existing entry is a
/// collision and the existing node is returned as the error.
pub fn insert_child(
    parent: &Arc<Node>,
    child: Arc<Node>,
    replace: bool,
) -> Result<Arc<Node>, Arc<Node>> {
    *child.parent.lock() = Arc::downgrade(parent);

    let mut guard = parent.children.lock();
    let children = guard.get_or_insert_with(HashMap::new);
    let name = child.name();

    if !replace {
        if let Some(existing) = children.get(&name) {
            return Err(existing.clone());
        }
    }

    children.insert(name, child.clone());
    parent.dir_generation.fetch_add(1, Ordering::Relaxed);
    Ok(child)
}

/// Re-establish `path == parent.path + "/" + name` for a node and all of its
/// descendants after a rename.
pub fn update_paths(node: &Arc<Node>) {
    if let Some(parent) = node.parent_node() {
        let parent_path = parent.path();
        let name = node.name();
        let new_path = if parent_path.is_empty() {
            name
        } else {
            format!("{parent_path}/{name}")
        };
        *node.path.lock() = new_path;
    }

    for child in node.children_snapshot() {
        update_paths(&child);
    }
}

/// Shared identity for every node resolving to one backing inode.
pub struct InodeRecord {
    pub kernel_ino: u64,
    pub fingerprint: (u64, u64),
    pub mode: AtomicU32,
    pub lookups: Mutex<u64>,
    pub nodes: Mutex<Vec<Weak<Node>>>,
}

impl InodeRecord {
    pub fn first_node(&self) -> Option<Arc<Node>> {
        self.nodes.lock().iter().find_map(Weak::upgrade)
    }

    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for InodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeRecord")
            .field("kernel_ino", &self.kernel_ino)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Table keyed both by backing (ino, dev) fingerprint and by the inode
/// number handed to the kernel.
#[derive(Default)]
pub struct InodeTable {
    by_fingerprint: HashMap<(u64, u64), Arc<InodeRecord>>,
    by_kernel: HashMap<u64, Arc<InodeRecord>>,
    next_kernel_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            by_fingerprint: HashMap::new(),
            by_kernel: HashMap::new(),
            next_kernel_ino: FUSE_ROOT_ID,
        }
    }

    pub fn record_count(&self) -> usize {
        self.by_kernel.len()
    }

    pub fn node_count(&self) -> usize {
        self.by_kernel
            .values()
            .map(|r| r.nodes.lock().iter().filter(|w| w.strong_count() > 0).count())
            .sum()
    }

    pub fn get(&self, kernel_ino: u64) -> Option<Arc<InodeRecord>> {
        self.by_kernel.get(&kernel_ino).cloned()
    }

    pub fn node_for(&self, kernel_ino: u64) -> Option<Arc<Node>> {
        self.get(kernel_ino)?.first_node()
    }

    /// Register a node under its (ino, dev) fingerprint. If a sibling with
    /// the same parent and name already aliases this inode, the node
    /// collapses into that sibling. Otherwise the node joins the record's
    /// alias list (new record if none exists) and adopts the given mode.
    pub fn register(&mut self, node: Arc<Node>, mode: u32) -> Arc<Node> {
        if node.record.lock().is_some() {
            return node;
        }

        let fp = (
            node.tmp_ino.load(Ordering::Relaxed),
            node.tmp_dev.load(Ordering::Relaxed),
        );

        if let Some(record) = self.by_fingerprint.get(&fp).cloned() {
            {
                let nodes = record.nodes.lock();
                let node_parent = node.parent.lock().upgrade();
                let node_name = node.name();
                for existing in nodes.iter().filter_map(Weak::upgrade) {
                    let same_parent = match (&node_parent, existing.parent.lock().upgrade()) {
                        (Some(a), Some(b)) => Arc::ptr_eq(a, &b),
                        (None, None) => true,
                        _ => false,
                    };
                    if same_parent && existing.name() == node_name {
                        return existing;
                    }
                }
            }

            record.nodes.lock().push(Arc::downgrade(&node));
            record.mode.store(mode, Ordering::Relaxed);
            *node.record.lock() = Some(record);
            return node;
        }

        self.next_kernel_ino += 1;
        let record = Arc::new(InodeRecord {
            kernel_ino: self.next_kernel_ino,
            fingerprint: fp,
            mode: AtomicU32::new(mode),
            lookups: Mutex::new(0),
            nodes: Mutex::new(vec![Arc::downgrade(&node)]),
        });
        self.by_fingerprint.insert(fp, record.clone());
        self.by_kernel.insert(record.kernel_ino, record.clone());
        *node.record.lock() = Some(record);
        node
    }

    /// Register the root node with the fixed kernel root inode number.
    pub fn register_root(&mut self, root: &Arc<Node>, mode: u32) {
        let fp = (
            root.tmp_ino.load(Ordering::Relaxed),
            root.tmp_dev.load(Ordering::Relaxed),
        );
        let record = Arc::new(InodeRecord {
            kernel_ino: FUSE_ROOT_ID,
            fingerprint: fp,
            mode: AtomicU32::new(mode),
            lookups: Mutex::new(2),
            nodes: Mutex::new(vec![Arc::downgrade(root)]),
        });
        self.by_fingerprint.insert(fp, record.clone());
        self.by_kernel.insert(FUSE_ROOT_ID, record.clone());
        *root.record.lock() = Some(record);
    }

    /// Drop `node` from its record without touching the kernel lookup count.
    /// A record whose lookups already reached zero is destroyed outright.
    pub fn drop_node(&mut self, node: &Arc<Node>) {
        let record = match node.record.lock().clone() {
            Some(r) => r,
            None => return,
        };

        if *record.lookups.lock() == 0 {
            self.remove_record(&record);
            return;
        }

        // Keep the record alive if this is its only node.
        {
            let nodes = record.nodes.lock();
            let live: Vec<Arc<Node>> = nodes.iter().filter_map(Weak::upgrade).collect();
            if live.len() == 1 && Arc::ptr_eq(&live[0], node) {
                return;
            }
        }

        *node.record.lock() = None;
        record
            .nodes
            .lock()
            .retain(|w| w.upgrade().map(|n| !Arc::ptr_eq(&n, node)).unwrap_or(false));
    }

    /// Decrement the kernel lookup count; at zero the record is removed and
    /// its still-live nodes are returned for detachment and hidden-state
    /// cleanup.
    pub fn forget(&mut self, kernel_ino: u64, nlookup: u64) -> Vec<Arc<Node>> {
        if kernel_ino == FUSE_ROOT_ID || kernel_ino == 0 {
            return Vec::new();
        }
        let record = match self.by_kernel.get(&kernel_ino).cloned() {
            Some(r) => r,
            None => return Vec::new(),
        };

        let mut lookups = record.lookups.lock();
        *lookups = lookups.saturating_sub(nlookup);
        if *lookups > 0 {
            return Vec::new();
        }
        drop(lookups);

        self.remove_record(&record)
    }

    fn remove_record(&mut self, record: &Arc<InodeRecord>) -> Vec<Arc<Node>> {
        self.by_kernel.remove(&record.kernel_ino);
        self.by_fingerprint.remove(&record.fingerprint);

        let nodes: Vec<Arc<Node>> = record.nodes.lock().iter().filter_map(Weak::upgrade).collect();
        for node in &nodes {
            *node.record.lock() = None;
        }
        nodes
    }
}
