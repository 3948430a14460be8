//! The composition engine: layered lookup, directory merge, copy-up and the
//! upper-layer mutation protocol.
//!
//! All mutations land on the upper layer only. New entries are staged in the
//! working directory and renamed into place; deletions leave whiteouts so
//! lower-layer names stay hidden; directories that shadow lower directories
//! are marked opaque. Upper-layer file bodies are encrypted block-wise.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};
use xattr::FileExt as XattrFileExt;

use crate::config::{MountOptions, StatOverride};
use crate::crypto::{blockio, CryptoParams, KeySchedule};
use crate::gate::path_allowed;
use crate::idmap::IdMapper;
use crate::profile::HideList;

use super::layer::{Layer, LayerIdx};
use super::node::{
    insert_child, update_paths, HiddenState, InodeTable, Node, FUSE_ROOT_ID,
};
use super::{
    can_access_xattr, unwhiteout_name, whiteout_name, OPAQUE_WHITEOUT, OPAQUE_XATTR,
    ORIGIN_XATTR, PRIVILEGED_OPAQUE_XATTR, WHITEOUT_MAX_LEN, WHITEOUT_PREFIX,
    XATTR_OVERRIDE_STAT, XATTR_PRIVILEGED_OVERRIDE_STAT,
};

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn is_not_found(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::ENOTDIR) | Some(libc::ENAMETOOLONG)
    )
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| errno(libc::EINVAL))
}

fn renameat2(old: &Path, new: &Path, flags: libc::c_uint) -> io::Result<()> {
    let old_c = cpath(old)?;
    let new_c = cpath(new)?;
    let ret = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            old_c.as_ptr(),
            libc::AT_FDCWD,
            new_c.as_ptr(),
            flags,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_with_flags(path: &Path, flags: i32, mode: u32) -> io::Result<File> {
    let c = cpath(path)?;
    let fd = loop {
        let fd = unsafe { libc::open(c.as_ptr(), flags | libc::O_NOFOLLOW, mode) };
        if fd >= 0 {
            break fd;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    };
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c = cpath(path)?;
    if unsafe { libc::lchown(c.as_ptr(), uid, gid) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn fchown(file: &File, uid: u32, gid: u32) -> io::Result<()> {
    if unsafe { libc::fchown(file.as_raw_fd(), uid, gid) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn mknod_char00(path: &Path) -> io::Result<()> {
    let c = cpath(path)?;
    let dev = libc::makedev(0, 0);
    if unsafe { libc::mknod(c.as_ptr(), libc::S_IFCHR | 0o700, dev) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_file_times(file: &File, atime_s: i64, atime_ns: i64, mtime_s: i64, mtime_ns: i64) -> io::Result<()> {
    let times = [
        libc::timespec {
            tv_sec: atime_s,
            tv_nsec: atime_ns,
        },
        libc::timespec {
            tv_sec: mtime_s,
            tv_nsec: mtime_ns,
        },
    ];
    if unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn is_char00(mode: u32, rdev: u64) -> bool {
    (mode & libc::S_IFMT) == libc::S_IFCHR && rdev == 0
}

/// Attribute data handed to the FUSE adapter, already identity-mapped.
#[derive(Debug, Clone, Copy)]
pub struct NodeStat {
    pub kernel_ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub atime: (i64, i64),
    pub mtime: (i64, i64),
    pub ctime: (i64, i64),
}

/// Field changes for setattr, applied in time, mode, size, ownership order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrChanges {
    pub atime: Option<(i64, i64)>,
    pub atime_now: bool,
    pub mtime: Option<(i64, i64)>,
    pub mtime_now: bool,
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

pub struct OverlayFs {
    layers: Vec<Layer>,
    upper: Option<LayerIdx>,
    root: Arc<Node>,
    pub inodes: parking_lot::Mutex<InodeTable>,
    key: Arc<KeySchedule>,
    idmap: IdMapper,
    hide_list: HideList,
    stat_override: StatOverride,
    pub timeout: f64,
    fast_ino: bool,
    static_nlink: bool,
    pub noxattrs: bool,
    pub fsync_enabled: bool,
    writeback: bool,
    workdir: Option<PathBuf>,
    wd_counter: AtomicU64,
    can_mknod: AtomicBool,
    mount_parent: Option<String>,
    euid: u32,
    egid: u32,
    block_size: usize,
}

impl OverlayFs {
    pub fn new(
        opts: &MountOptions,
        mountpoint: &Path,
        crypto: CryptoParams,
    ) -> crate::Result<Self> {
        opts.validate()?;

        let mut layers = Vec::new();
        let upper = if let Some(upper_dir) = &opts.upperdir {
            let full = std::fs::canonicalize(upper_dir)
                .map_err(|_| crate::Error::InvalidLayerDir(upper_dir.display().to_string()))?;
            layers.push(Layer::direct(full, true));
            Some(0)
        } else {
            None
        };

        for lower in opts.lower_dirs() {
            if !lower.is_dir() {
                return Err(crate::Error::InvalidLayerDir(lower.display().to_string()).into());
            }
            layers.push(Layer::direct(lower, false));
        }

        let workdir = match (&opts.workdir, upper) {
            (Some(base), Some(_)) => Some(prepare_workdir(base)?),
            (None, Some(_)) => return Err(crate::Error::MissingWorkDir.into()),
            _ => None,
        };

        let idmap = IdMapper::new(
            opts.uidmapping.as_deref(),
            opts.gidmapping.as_deref(),
            opts.squash_to_root,
            opts.squash_to_uid,
            opts.squash_to_gid,
        )?;

        let mount_parent = mountpoint
            .parent()
            .map(|p| p.to_string_lossy().trim_start_matches('/').to_string())
            .filter(|p| !p.is_empty());

        let key = Arc::new(KeySchedule::from_password(
            crate::crypto::DEFAULT_PASSWORD,
            crypto,
        ));
        let block_size = key.block_size();

        let root = Node::new("", "", Some(0), true, None, block_size);

        let fs = OverlayFs {
            layers,
            upper,
            root,
            inodes: parking_lot::Mutex::new(InodeTable::new()),
            key,
            idmap,
            hide_list: HideList::load(crate::profile::DEFAULT_PROFILE_PATH),
            stat_override: opts.stat_override(),
            timeout: opts.timeout,
            fast_ino: opts.fast_ino,
            static_nlink: opts.static_nlink,
            noxattrs: opts.noxattrs,
            fsync_enabled: opts.fsync,
            writeback: opts.writeback,
            workdir,
            wd_counter: AtomicU64::new(1),
            can_mknod: AtomicBool::new(true),
            mount_parent,
            euid: unsafe { libc::geteuid() },
            egid: unsafe { libc::getegid() },
            block_size,
        };

        fs.probe_can_mknod();
        fs.init_root()?;
        Ok(fs)
    }

    /// Test constructor: no profile file, explicit hide list.
    pub fn with_hide_list(
        opts: &MountOptions,
        mountpoint: &Path,
        crypto: CryptoParams,
        hide_list: HideList,
    ) -> crate::Result<Self> {
        let mut fs = Self::new(opts, mountpoint, crypto)?;
        fs.hide_list = hide_list;
        Ok(fs)
    }

    fn probe_can_mknod(&self) {
        let dir = match (&self.workdir, self.upper) {
            (Some(wd), Some(_)) => wd.clone(),
            _ => return,
        };
        let probe = dir.join(whiteout_name("mknod-probe"));
        match mknod_char00(&probe) {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
            }
            Err(e) => {
                warn!(error = %e, "mknod unavailable, falling back to whiteout files");
                self.can_mknod.store(false, Ordering::Relaxed);
            }
        }
    }

    fn init_root(&self) -> io::Result<()> {
        let mut mode = 0o40755;
        for layer in &self.layers {
            if let Ok(meta) = layer.store.stat("") {
                self.root.tmp_ino.store(meta.ino(), Ordering::Relaxed);
                self.root.tmp_dev.store(meta.dev(), Ordering::Relaxed);
                mode = meta.mode();
                break;
            }
        }
        self.root
            .last_layer
            .lock()
            .replace(self.layers.len().saturating_sub(1));
        self.inodes.lock().register_root(&self.root, mode);
        self.load_dir(&self.root)?;
        Ok(())
    }

    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn key_schedule(&self) -> Arc<KeySchedule> {
        self.key.clone()
    }

    fn upper_idx(&self) -> Option<LayerIdx> {
        self.upper
    }

    fn lower_range(&self) -> std::ops::Range<usize> {
        match self.upper {
            Some(_) => 1..self.layers.len(),
            None => 0..self.layers.len(),
        }
    }

    fn is_upper(&self, idx: LayerIdx) -> bool {
        self.upper == Some(idx)
    }

    fn upper_layer(&self) -> io::Result<&Layer> {
        self.upper
            .map(|i| &self.layers[i])
            .ok_or_else(|| errno(libc::EROFS))
    }

    /// Absolute upper-layer path of a relative entry.
    fn upper_full(&self, rel: &str) -> io::Result<PathBuf> {
        Ok(self.upper_layer()?.store.full_path(rel))
    }

    fn workdir(&self) -> io::Result<&Path> {
        self.workdir.as_deref().ok_or_else(|| errno(libc::EROFS))
    }

    fn next_wd_name(&self) -> String {
        self.wd_counter.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn node_on_upper(&self, node: &Node) -> bool {
        match self.upper {
            Some(u) => *node.layer.lock() == Some(u),
            None => false,
        }
    }

    /// Encrypted I/O applies when any part of the node lives on the upper
    /// layer.
    pub fn node_uses_crypto(&self, node: &Node) -> bool {
        match self.upper {
            Some(u) => *node.layer.lock() == Some(u) || *node.last_layer.lock() == Some(u),
            None => false,
        }
    }

    pub fn node_by_ino(&self, ino: u64) -> Option<Arc<Node>> {
        if ino == FUSE_ROOT_ID {
            return Some(self.root.clone());
        }
        self.inodes.lock().node_for(ino)
    }

    fn join_path(parent_path: &str, name: &str) -> String {
        if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        }
    }

    /// Maximum name length the backing store can take once the whiteout
    /// prefix is added.
    pub fn fs_namemax(&self) -> u64 {
        let root = self.layers[0].store.root().to_path_buf();
        match nix::sys::statvfs::statvfs(&root) {
            Ok(vfs) => (vfs.name_max() as u64).saturating_sub(WHITEOUT_MAX_LEN),
            Err(_) => 255 - WHITEOUT_MAX_LEN,
        }
    }

    pub fn statfs(&self) -> io::Result<nix::sys::statvfs::Statvfs> {
        let root = self.layers[0].store.root().to_path_buf();
        nix::sys::statvfs::statvfs(&root).map_err(|e| errno(e as i32))
    }

    // ------------------------------------------------------------------
    // Resolution

    fn is_directory_opaque(&self, layer: LayerIdx, path: &str) -> io::Result<bool> {
        let store = &self.layers[layer].store;
        for name in [PRIVILEGED_OPAQUE_XATTR, OPAQUE_XATTR] {
            match store.getxattr(path, name) {
                Ok(Some(v)) => return Ok(v.first() == Some(&b'y')),
                Ok(None) => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => break,
                // An unreadable attribute is not proof of anything; the
                // other encodings still decide.
                Err(_) => continue,
            }
        }
        store.file_exists(&Self::join_path(path, OPAQUE_WHITEOUT))
    }

    /// Fill a node's origin identity by walking from its layer downward,
    /// following recorded origin paths left by copy-up, so a copied-up file
    /// keeps the inode identity of its lower original.
    fn resolve_origin(&self, node: &Arc<Node>, start: LayerIdx, parent: Option<&Arc<Node>>) -> u32 {
        let mut mode = 0u32;
        let mut npath = node.path();
        let mut has_origin = true;
        let name = node.name();
        let parent_last = parent.and_then(|p| *p.last_layer.lock());
        let wh = parent
            .map(|p| Self::join_path(&p.path(), &whiteout_name(&name)))
            .unwrap_or_else(|| whiteout_name(&name));

        for idx in start..self.layers.len() {
            let store = &self.layers[idx].store;

            if node.is_dir() {
                match store.file_exists(&wh) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(_) => break,
                }
            }

            if let Ok(meta) = store.stat(&npath) {
                if has_origin {
                    node.tmp_ino.store(meta.ino(), Ordering::Relaxed);
                    node.tmp_dev.store(meta.dev(), Ordering::Relaxed);
                    if mode == 0 {
                        mode = meta.mode();
                    }
                }
                node.last_layer.lock().replace(idx);
            }

            if !self.fast_ino {
                match store.getxattr(&npath, ORIGIN_XATTR) {
                    Ok(Some(origin)) => {
                        npath = String::from_utf8_lossy(&origin).into_owned();
                    }
                    _ => has_origin = false,
                }
            } else {
                has_origin = false;
            }

            if parent_last == Some(idx) {
                break;
            }
        }

        mode
    }

    /// Construct and register a node discovered on `layer`.
    fn make_node(
        &self,
        path: &str,
        layer: LayerIdx,
        name: &str,
        ino: u64,
        dev: u64,
        dir_p: bool,
        parent: Option<&Arc<Node>>,
    ) -> Arc<Node> {
        let node = Node::new(name, path, Some(layer), dir_p, parent, self.block_size);
        node.tmp_ino.store(ino, Ordering::Relaxed);
        node.tmp_dev.store(dev, Ordering::Relaxed);

        let mut mode = 0;
        if ino == 0 {
            mode = self.resolve_origin(&node, layer, parent);
        }

        self.inodes.lock().register(node, mode)
    }

    fn make_whiteout_node(&self, path: &str, name: &str) -> Arc<Node> {
        Node::new_whiteout(name, path, self.block_size)
    }

    /// Locate the effective entry for `name` under `parent` across layers,
    /// honoring whiteouts and opaque markers. `Ok(None)` is not-found;
    /// whiteout nodes are returned and must be treated as absent by callers
    /// that surface entries.
    pub fn lookup(&self, parent: &Arc<Node>, name: &str) -> io::Result<Option<Arc<Node>>> {
        if !path_allowed(&parent.path(), self.mount_parent.as_deref()) {
            return Ok(None);
        }

        if name.is_empty() || name == "." {
            return Ok(Some(parent.clone()));
        }
        if name == ".." {
            return Ok(parent.parent_node().or_else(|| Some(self.root.clone())));
        }
        if name.starts_with(WHITEOUT_PREFIX) {
            return Err(errno(libc::EINVAL));
        }
        if parent.is_whiteout() {
            return Ok(None);
        }

        if let Some(child) = parent.child(name) {
            return Ok(Some(child));
        }
        if parent.loaded.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let parent_path = parent.path();
        let path = Self::join_path(&parent_path, name);
        let whpath = Self::join_path(&parent_path, &whiteout_name(name));
        let parent_last = *parent.last_layer.lock();

        let mut node: Option<Arc<Node>> = None;
        let mut stop = false;

        for idx in 0..self.layers.len() {
            if stop {
                break;
            }
            if parent_last == Some(idx) {
                stop = true;
            }

            let store = &self.layers[idx].store;
            let meta = match store.stat(&path) {
                Ok(m) => m,
                Err(e) if is_not_found(&e) => {
                    if node.is_some() {
                        continue;
                    }
                    if store.file_exists(&whpath)? {
                        node = Some(self.make_whiteout_node(&path, name));
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(existing) = &node {
                // A deeper layer also contributes: adopt its identity.
                existing.tmp_ino.store(meta.ino(), Ordering::Relaxed);
                existing.tmp_dev.store(meta.dev(), Ordering::Relaxed);
                existing.last_layer.lock().replace(idx);
                continue;
            }

            let new_node = if store.file_exists(&whpath)? {
                self.make_whiteout_node(&path, name)
            } else if let Some(wh) = unwhiteout_name(name, is_char00(meta.mode(), meta.rdev())) {
                self.make_whiteout_node(&path, wh)
            } else {
                let dir_p = meta.is_dir();
                let n = self.make_node(&path, idx, name, 0, 0, dir_p, Some(parent));
                if dir_p && self.is_directory_opaque(idx, &path)? {
                    n.last_layer.lock().replace(idx);
                    stop = true;
                }
                n
            };

            node = Some(new_node);
        }

        let node = match node {
            Some(n) => n,
            None => return Ok(None),
        };

        let inserted = match insert_child(parent, node.clone(), false) {
            Ok(n) => n,
            Err(existing) => existing,
        };
        Ok(Some(inserted))
    }

    pub fn lookup_ok(&self, parent: &Arc<Node>, name: &str) -> io::Result<Arc<Node>> {
        match self.lookup(parent, name)? {
            Some(n) if !n.is_whiteout() => Ok(n),
            _ => Err(errno(libc::ENOENT)),
        }
    }

    /// Merge all layers' listings of `node` into its children set.
    pub fn load_dir(&self, node: &Arc<Node>) -> io::Result<()> {
        let node_path = node.path();
        let node_name = node.name();
        let parent_wh = match node.parent_node() {
            Some(p) => Self::join_path(&p.path(), &whiteout_name(&node_name)),
            None => whiteout_name(&node_name),
        };
        let node_last = *node.last_layer.lock();

        let mut stop = false;
        for idx in 0..self.layers.len() {
            if stop {
                break;
            }
            if node_last == Some(idx) {
                stop = true;
            }

            let store = &self.layers[idx].store;

            // An outer whiteout for the directory itself shadows everything
            // beneath it.
            if !node_path.is_empty() && store.file_exists(&parent_wh)? {
                break;
            }

            if !path_allowed(&node_path, self.mount_parent.as_deref()) {
                continue;
            }

            let entries = match store.read_dir(&node_path) {
                Ok(e) => e,
                Err(_) => continue,
            };

            let is_lower = !self.is_upper(idx);
            for entry in entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                if is_lower && self.hide_list.hides(&node_path, &entry.name) {
                    continue;
                }

                if let Some(child) = node.child(&entry.name) {
                    child.last_layer.lock().replace(idx);
                    if !child.is_whiteout() || !self.is_upper(idx) {
                        continue;
                    }
                    // Stale upper whiteout entry: rebuild it from this layer.
                    node.remove_child(&entry.name);
                }

                let whiteout_path = Self::join_path(&node_path, &whiteout_name(&entry.name));
                let child_path = Self::join_path(&node_path, &entry.name);

                let child = if store.file_exists(&whiteout_path)? {
                    self.make_whiteout_node(&child_path, &entry.name)
                } else if let Some(wh) =
                    unwhiteout_name(&entry.name, entry.is_char_dev && entry.rdev == 0)
                {
                    self.make_whiteout_node(&child_path, wh)
                } else {
                    let ino = if self.fast_ino { entry.ino } else { 0 };
                    let n =
                        self.make_node(&child_path, idx, &entry.name, ino, 0, entry.is_dir, Some(node));
                    n.last_layer.lock().replace(idx);
                    n
                };

                let _ = insert_child(node, child, false);
            }

            if self.is_directory_opaque(idx, &node_path)? {
                node.last_layer.lock().replace(idx);
                stop = true;
            }
        }

        // With a zero attribute timeout the kernel revalidates constantly,
        // so the merged listing is rebuilt on demand instead of cached.
        node.loaded.store(self.timeout > 0.0, Ordering::Relaxed);
        Ok(())
    }

    pub fn reload_dir(&self, node: &Arc<Node>) -> io::Result<()> {
        if node.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.load_dir(node)
    }

    // ------------------------------------------------------------------
    // Attributes

    fn backing_stat(&self, node: &Arc<Node>) -> io::Result<std::fs::Metadata> {
        if node.is_hidden() {
            let path = node
                .hidden_path
                .lock()
                .clone()
                .ok_or_else(|| errno(libc::ENOENT))?;
            return std::fs::symlink_metadata(path);
        }
        let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
        self.layers[layer].store.stat(&node.path())
    }

    /// Stat with identity mapping, shared inode number and nlink synthesis
    /// applied; under an override mode the encoded uid/gid/mode wins.
    pub fn stat_node(&self, node: &Arc<Node>) -> io::Result<NodeStat> {
        let meta = self.backing_stat(node)?;

        let mut uid = meta.uid();
        let mut gid = meta.gid();
        let mut mode = meta.mode();

        if self.stat_override != StatOverride::None && self.node_on_upper(node) {
            if let Some((o_uid, o_gid, o_mode)) = self.read_override_stat(&node.path()) {
                uid = o_uid;
                gid = o_gid;
                mode = (mode & libc::S_IFMT) | o_mode;
            }
        }

        let nlink = if meta.is_dir() {
            if self.static_nlink {
                1
            } else {
                let mut n = 2u32;
                for child in node.children_snapshot() {
                    if child.is_dir() && !child.is_whiteout() {
                        n += 1;
                    }
                }
                n
            }
        } else {
            meta.nlink() as u32
        };

        Ok(NodeStat {
            kernel_ino: node.kernel_ino(),
            size: meta.size(),
            blocks: meta.blocks(),
            blksize: meta.blksize() as u32,
            mode,
            nlink,
            uid: self.idmap.uid_out(uid),
            gid: self.idmap.gid_out(gid),
            rdev: meta.rdev(),
            atime: (meta.atime(), meta.atime_nsec()),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            ctime: (meta.ctime(), meta.ctime_nsec()),
        })
    }

    fn read_override_stat(&self, rel: &str) -> Option<(u32, u32, u32)> {
        let name = match self.stat_override {
            StatOverride::Privileged => XATTR_PRIVILEGED_OVERRIDE_STAT,
            StatOverride::User => XATTR_OVERRIDE_STAT,
            StatOverride::None => return None,
        };
        let layer = self.upper_idx()?;
        let raw = self.layers[layer].store.getxattr(rel, name).ok()??;
        let text = String::from_utf8_lossy(&raw).into_owned();
        let mut parts = text.splitn(3, ':');
        let uid = parts.next()?.parse().ok()?;
        let gid = parts.next()?.parse().ok()?;
        let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
        Some((uid, gid, mode))
    }

    fn write_override_stat(
        &self,
        file: Option<&File>,
        path: Option<&Path>,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> io::Result<()> {
        let name = match self.stat_override {
            StatOverride::Privileged => XATTR_PRIVILEGED_OVERRIDE_STAT,
            StatOverride::User => XATTR_OVERRIDE_STAT,
            StatOverride::None => return Ok(()),
        };
        let value = format!("{}:{}:{:o}", uid, gid, mode & 0o7777);

        let result = if let Some(f) = file {
            f.set_xattr(name, value.as_bytes())
        } else if let Some(p) = path {
            xattr::set(p, name, value.as_bytes())
        } else {
            return Err(errno(libc::EINVAL));
        };

        match result {
            Err(e)
                if self.stat_override == StatOverride::User
                    && e.raw_os_error() == Some(libc::EPERM) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// Ownership update honoring the override mode; errors are ignored when
    /// a squash override is active.
    fn set_owner(&self, file: Option<&File>, path: Option<&Path>, uid: u32, gid: u32, mode: u32) -> io::Result<()> {
        let result = if self.stat_override != StatOverride::None {
            self.write_override_stat(file, path, uid, gid, mode)
        } else if let Some(f) = file {
            fchown(f, uid, gid)
        } else if let Some(p) = path {
            lchown(p, uid, gid)
        } else {
            Err(errno(libc::EINVAL))
        };

        if self.idmap.squashed() {
            return Ok(());
        }
        result
    }

    fn set_mode(&self, file: Option<&File>, path: Option<&Path>, mode: u32) -> io::Result<()> {
        if self.stat_override != StatOverride::None {
            let rel_stat = self.read_override_stat_target(file, path);
            let (uid, gid) = rel_stat.unwrap_or((0, 0));
            return self.write_override_stat(file, path, uid, gid, mode);
        }

        if let Some(f) = file {
            if unsafe { libc::fchmod(f.as_raw_fd(), mode) } < 0 {
                return Err(io::Error::last_os_error());
            }
            return Ok(());
        }
        if let Some(p) = path {
            let c = cpath(p)?;
            if unsafe { libc::chmod(c.as_ptr(), mode) } < 0 {
                return Err(io::Error::last_os_error());
            }
            return Ok(());
        }
        Err(errno(libc::EINVAL))
    }

    fn read_override_stat_target(&self, file: Option<&File>, path: Option<&Path>) -> Option<(u32, u32)> {
        let name = match self.stat_override {
            StatOverride::Privileged => XATTR_PRIVILEGED_OVERRIDE_STAT,
            StatOverride::User => XATTR_OVERRIDE_STAT,
            StatOverride::None => return None,
        };
        let raw = if let Some(f) = file {
            f.get_xattr(name).ok()??
        } else {
            xattr::get(path?, name).ok()??
        };
        let text = String::from_utf8_lossy(&raw).into_owned();
        let mut parts = text.splitn(3, ':');
        let uid = parts.next()?.parse().ok()?;
        let gid = parts.next()?.parse().ok()?;
        Some((uid, gid))
    }

    // ------------------------------------------------------------------
    // Copy-up

    /// Ensure the node's storage is the upper layer, copying up on demand.
    pub fn get_node_up(&self, node: &Arc<Node>) -> io::Result<Arc<Node>> {
        if self.upper.is_none() {
            return Err(errno(libc::EROFS));
        }
        if self.node_on_upper(node) {
            return Ok(node.clone());
        }
        self.copyup(node)?;
        Ok(node.clone())
    }

    /// Recursively materialize a directory chain on the upper layer,
    /// copying mode, ownership and times from the source layer.
    fn create_node_directory(&self, node: &Arc<Node>) -> io::Result<()> {
        if self.node_on_upper(node) {
            return Ok(());
        }

        let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
        let meta = self.layers[layer].store.stat(&node.path())?;

        if let Some(parent) = node.parent_node() {
            self.create_node_directory(&parent)?;
        }

        self.create_directory(
            &node.path(),
            node.parent_node().as_ref(),
            Some(&meta),
            meta.uid(),
            meta.gid(),
            meta.mode() & 0o7777,
            false,
        )?;

        node.layer.lock().replace(self.upper_idx().unwrap_or(0));
        if let Some(parent) = node.parent_node() {
            self.delete_whiteout(&parent, &node.name())?;
        }
        Ok(())
    }

    /// Create a directory at the upper-layer path `rel`. When extra metadata
    /// is needed the directory is staged in the working directory and
    /// renamed into place; a collision is resolved with an exchange rename
    /// and removal of the displaced entry.
    fn create_directory(
        &self,
        rel: &str,
        parent: Option<&Arc<Node>>,
        source_meta: Option<&std::fs::Metadata>,
        uid: u32,
        gid: u32,
        mut mode: u32,
        set_opaque: bool,
    ) -> io::Result<()> {
        if self.stat_override != StatOverride::None {
            mode |= 0o755;
        }

        let dest = self.upper_full(rel)?;
        let need_rename = set_opaque
            || source_meta.is_some()
            || uid != self.euid
            || gid != self.egid
            || self.stat_override != StatOverride::None;

        if !need_rename {
            let mut builder = std::fs::DirBuilder::new();
            std::os::unix::fs::DirBuilderExt::mode(&mut builder, mode);
            match builder.create(&dest) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    // A whiteout may sit at the destination.
                    let _ = std::fs::remove_file(&dest);
                    builder.create(&dest)?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let wd_name = self.next_wd_name();
        let staged = self.workdir()?.join(&wd_name);
        std::fs::create_dir(&staged)?;

        let result: io::Result<()> = (|| {
            let dirfile = open_with_flags(&staged, libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
            let _ = self.set_mode(Some(&dirfile), None, mode);

            if uid != self.euid || gid != self.egid || self.stat_override != StatOverride::None {
                self.set_owner(Some(&dirfile), None, uid, gid, mode)?;
            }

            if let Some(meta) = source_meta {
                set_file_times(
                    &dirfile,
                    meta.atime(),
                    meta.atime_nsec(),
                    meta.mtime(),
                    meta.mtime_nsec(),
                )?;
            }

            if set_opaque {
                self.set_opaque(&staged)?;
            }

            match std::fs::rename(&staged, &dest) {
                Ok(()) => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    renameat2(&staged, &dest, libc::RENAME_EXCHANGE)?;
                    // Drain whatever was displaced into the working
                    // directory and drop it.
                    empty_dir_tree(&staged)?;
                    std::fs::remove_dir(&staged)
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => {
                    let _ = std::fs::remove_file(&dest);
                    std::fs::rename(&staged, &dest)
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) && parent.is_some() => {
                    self.create_node_directory(parent.unwrap())?;
                    std::fs::rename(&staged, &dest)
                }
                Err(e) => Err(e),
            }
        })();

        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staged);
        }
        result
    }

    /// Promote one node to the upper layer via the working directory.
    fn copyup(&self, node: &Arc<Node>) -> io::Result<()> {
        let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
        let store = &self.layers[layer].store;
        let rel = node.path();
        let meta = store.stat(&rel)?;

        debug!(path = %rel, "copyup");

        if let Some(parent) = node.parent_node() {
            self.create_node_directory(&parent)?;
        }

        let mut mode = meta.mode() & 0o7777;
        if self.stat_override != StatOverride::None {
            mode |= 0o755;
        }
        if self.euid > 0 {
            mode |= 0o200;
        }

        let fmt = meta.mode() & libc::S_IFMT;

        if fmt == libc::S_IFDIR {
            self.create_node_directory(node)?;
            return Ok(());
        }

        if fmt == libc::S_IFLNK {
            let target = store.readlink(&rel)?;
            let dest = self.upper_full(&rel)?;
            std::os::unix::fs::symlink(&target, &dest)?;
            self.finish_copyup(node)?;
            return Ok(());
        }

        let src = store.open(&rel, false)?;

        let wd_name = self.next_wd_name();
        let staged = self.workdir()?.join(&wd_name);

        let result: io::Result<()> = (|| {
            let dst = open_with_flags(
                &staged,
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                mode,
            )?;

            if meta.uid() != self.euid
                || meta.gid() != self.egid
                || self.stat_override != StatOverride::None
            {
                self.set_owner(Some(&dst), None, meta.uid(), meta.gid(), mode)?;
            }

            blockio::encode_file(&self.key, &src, &dst)?;

            set_file_times(&dst, meta.atime(), meta.atime_nsec(), meta.mtime(), meta.mtime_nsec())?;
            copy_filtered_xattrs(&src, &dst)?;

            // Remember where this body came from, for inode identity.
            match dst.set_xattr(ORIGIN_XATTR, rel.as_bytes()) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {}
                Err(e) => return Err(e),
            }

            let dest = self.upper_full(&rel)?;
            std::fs::rename(&staged, &dest)?;

            if let Some(parent) = node.parent_node() {
                let wh = self
                    .upper_full(&Self::join_path(&parent.path(), &whiteout_name(&node.name())))?;
                match std::fs::remove_file(&wh) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }

        self.finish_copyup(node)
    }

    fn finish_copyup(&self, node: &Arc<Node>) -> io::Result<()> {
        node.layer.lock().replace(self.upper_idx().unwrap_or(0));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Whiteouts and opaque markers

    /// Mark a directory opaque: trusted xattr, then the user-namespace
    /// fallback, then the sentinel file when xattrs are unsupported.
    fn set_opaque(&self, dir: &Path) -> io::Result<()> {
        match xattr::set(dir, PRIVILEGED_OPAQUE_XATTR, b"y") {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                if xattr::set(dir, OPAQUE_XATTR, b"y").is_ok() {
                    return Ok(());
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {}
            Err(e) => return Err(e),
        }
        File::create(dir.join(OPAQUE_WHITEOUT)).map(|_| ())
    }

    /// Leave a whiteout for `name` under `parent`: a (0,0) char device when
    /// mknod is available, a `.wh.` file otherwise. Unless forced, nothing
    /// is created when no lower layer contributes the name.
    pub fn create_whiteout(
        &self,
        parent: &Arc<Node>,
        name: &str,
        skip_mknod: bool,
        force_create: bool,
    ) -> io::Result<()> {
        if !force_create {
            let path = Self::join_path(&parent.path(), name);
            let mut found = false;
            for idx in self.lower_range() {
                match self.layers[idx].store.file_exists(&path) {
                    Ok(true) => {
                        found = true;
                        break;
                    }
                    Ok(false) => continue,
                    Err(_) => continue,
                }
            }
            if !found {
                return Ok(());
            }
        }

        let rel = Self::join_path(&parent.path(), name);

        if !skip_mknod && self.can_mknod.load(Ordering::Relaxed) {
            let dest = self.upper_full(&rel)?;
            match mknod_char00(&dest) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    if let Ok(meta) = std::fs::symlink_metadata(&dest) {
                        if is_char00(meta.mode(), meta.rdev()) {
                            return Ok(());
                        }
                    }
                    return Err(e);
                }
                Err(e)
                    if e.raw_os_error() == Some(libc::EPERM)
                        || e.raw_os_error() == Some(libc::ENOTSUP) =>
                {
                    // Downgrade is sticky for the process lifetime.
                    self.can_mknod.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }

        let wh_rel = Self::join_path(&parent.path(), &whiteout_name(name));
        let dest = self.upper_full(&wh_rel)?;
        match open_with_flags(&dest, libc::O_CREAT | libc::O_WRONLY | libc::O_NONBLOCK, 0o700) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove both whiteout encodings of `name` under `parent`.
    pub fn delete_whiteout(&self, parent: &Arc<Node>, name: &str) -> io::Result<()> {
        let parent_path = parent.path();

        if self.can_mknod.load(Ordering::Relaxed) {
            let rel = Self::join_path(&parent_path, name);
            if let Ok(full) = self.upper_full(&rel) {
                if let Ok(meta) = std::fs::symlink_metadata(&full) {
                    if is_char00(meta.mode(), meta.rdev()) {
                        std::fs::remove_file(&full)?;
                    }
                }
            }
        }

        let wh_rel = Self::join_path(&parent_path, &whiteout_name(name));
        if let Ok(full) = self.upper_full(&wh_rel) {
            match std::fs::remove_file(&full) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write whiteouts for every loaded child; used when a new directory
    /// shadows lower-layer contents.
    fn hide_all(&self, node: &Arc<Node>) -> io::Result<()> {
        self.reload_dir(node)?;
        let children = node.children_snapshot();
        for child in children {
            if !child.is_whiteout() {
                self.create_whiteout(node, &child.name(), false, true)?;
            }
            node.remove_child(&child.name());
            self.inodes.lock().drop_node(&child);
        }
        node.loaded.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Before moving a directory over `from`, write whiteouts for every
    /// lower-layer entry that is not shadowed by the moved tree.
    fn create_missing_whiteouts(&self, node: &Arc<Node>, from: &str) -> io::Result<()> {
        if !node.is_dir() {
            return Ok(());
        }
        self.reload_dir(node)?;

        for idx in self.lower_range() {
            let entries = match self.layers[idx].store.read_dir(from) {
                Ok(e) => e,
                Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => break,
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
                Err(e) => return Err(e),
            };

            for entry in entries {
                if entry.name == "." || entry.name == ".." || entry.name.starts_with(WHITEOUT_PREFIX)
                {
                    continue;
                }

                if let Some(child) = node.child(&entry.name) {
                    if child.is_dir() {
                        self.reload_dir(&child)?;
                        let sub_from = Self::join_path(from, &entry.name);
                        self.create_missing_whiteouts(&child, &sub_from)?;
                    }
                    continue;
                }

                self.create_whiteout(node, &entry.name, false, true)?;
            }
        }
        Ok(())
    }

    /// Move a deleted-but-referenced node into the working directory and
    /// remember the unlink/rmdir for its final release. With `unlink_src`
    /// the visible entry is removed (preferring an atomic rename-with-
    /// whiteout); otherwise the storage is cloned so the original remains.
    fn hide_node(&self, node: &Arc<Node>, unlink_src: bool) -> io::Result<()> {
        let wd_name = self.next_wd_name();
        let hidden = self.workdir()?.join(&wd_name);
        let upper = self.upper_idx().ok_or_else(|| errno(libc::EROFS))?;
        let src_full = self.upper_full(&node.path())?;

        if unlink_src {
            let parent = node.parent_node();
            let mut needs_whiteout = *node.last_layer.lock() != Some(upper)
                && parent
                    .as_ref()
                    .map(|p| *p.last_layer.lock() != Some(upper))
                    .unwrap_or(false);

            if !needs_whiteout && node.is_dir() {
                if self.is_directory_opaque(upper, &node.path())? {
                    needs_whiteout = true;
                }
            }
            if let Some(p) = &parent {
                if self.is_directory_opaque(upper, &p.path())? {
                    needs_whiteout = false;
                }
            }

            let mut moved = false;
            if needs_whiteout {
                if self.can_mknod.load(Ordering::Relaxed)
                    && renameat2(&src_full, &hidden, libc::RENAME_WHITEOUT).is_ok()
                {
                    moved = true;
                } else if let Some(p) = &parent {
                    self.create_whiteout(p, &node.name(), true, false)?;
                }
            }

            if !moved {
                std::fs::rename(&src_full, &hidden)?;
            }
        } else if node.is_dir() {
            std::fs::create_dir(&hidden)?;
        } else {
            std::fs::hard_link(&src_full, &hidden)?;
        }

        self.inodes.lock().drop_node(node);

        *node.hidden_path.lock() = Some(hidden);
        *node.hidden.lock() = if node.is_dir() {
            HiddenState::PendingRmdir
        } else {
            HiddenState::PendingUnlink
        };
        if let Some(parent) = node.parent_node() {
            parent.loaded.store(false, Ordering::Relaxed);
        }
        *node.parent.lock() = std::sync::Weak::new();
        Ok(())
    }

    /// Empty an upper-layer directory of whiteouts and leftovers before
    /// rmdir.
    fn empty_upper_dir(&self, node: &Arc<Node>) -> io::Result<()> {
        if !node.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        self.reload_dir(node)?;
        if !self.node_on_upper(node) {
            return Ok(());
        }

        let full = self.upper_full(&node.path())?;

        // Drop the opaque sentinel first so a crash cannot leave a
        // half-empty opaque directory.
        let sentinel = full.join(OPAQUE_WHITEOUT);
        match std::fs::remove_file(&sentinel) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        for child in node.children_snapshot() {
            let on_upper = self.node_on_upper(&child) || child.is_whiteout();
            if !on_upper {
                continue;
            }

            if child.is_whiteout() {
                self.delete_whiteout(node, &child.name())?;
            } else if child.is_dir() {
                self.empty_upper_dir(&child)?;
                std::fs::remove_dir(self.upper_full(&child.path())?)?;
            } else {
                std::fs::remove_file(self.upper_full(&child.path())?)?;
            }

            node.remove_child(&child.name());
            self.inodes.lock().drop_node(&child);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutations

    fn check_namelen(&self, name: &str) -> io::Result<()> {
        if name.len() as u64 > self.fs_namemax() {
            return Err(errno(libc::ENAMETOOLONG));
        }
        Ok(())
    }

    /// Open, optionally creating. `flags` are the caller's open flags.
    pub fn open_node(
        &self,
        parent: &Arc<Node>,
        name: Option<&str>,
        mut flags: i32,
        mode: u32,
        caller: (u32, u32),
    ) -> io::Result<(Arc<Node>, File)> {
        flags &= !libc::O_DIRECT;

        let readonly = flags & (libc::O_APPEND | libc::O_RDWR | libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC)
            == 0;

        if self.writeback {
            if flags & libc::O_ACCMODE == libc::O_WRONLY {
                flags &= !libc::O_ACCMODE;
                flags |= libc::O_RDWR;
            }
            flags &= !libc::O_APPEND;
        }

        if let Some(n) = name {
            if n.starts_with(WHITEOUT_PREFIX) {
                return Err(errno(libc::EINVAL));
            }
        }

        let existing = match name {
            Some(n) => self.lookup(parent, n)?,
            None => Some(parent.clone()),
        };

        if let Some(node) = &existing {
            if node.is_hidden() {
                let hidden = node
                    .hidden_path
                    .lock()
                    .clone()
                    .ok_or_else(|| errno(libc::ENOENT))?;
                let file = open_with_flags(&hidden, flags, mode)?;
                return Ok((node.clone(), file));
            }
            if !node.is_whiteout() && flags & libc::O_CREAT != 0 {
                return Err(errno(libc::EEXIST));
            }
        }

        let is_whiteout = existing.as_ref().map(|n| n.is_whiteout()).unwrap_or(false);
        let node = existing.filter(|n| !n.is_whiteout());

        let node = match node {
            Some(n) => n,
            None => {
                // Create a fresh upper-layer file.
                if flags & libc::O_CREAT == 0 {
                    return Err(errno(libc::ENOENT));
                }
                let name = name.ok_or_else(|| errno(libc::EINVAL))?;
                self.check_namelen(name)?;

                let parent = self.get_node_up(parent)?;
                let need_delete_whiteout =
                    is_whiteout || !parent.loaded.load(Ordering::Relaxed);

                let rel = Self::join_path(&parent.path(), name);
                let uid = self.idmap.uid_in(caller.0);
                let gid = self.idmap.gid_in(caller.1);
                let create_mode = if self.stat_override != StatOverride::None {
                    mode | 0o755
                } else {
                    mode
                };

                let file = self.direct_create_file(&rel, uid, gid, flags, create_mode)?;

                if need_delete_whiteout {
                    self.delete_whiteout(&parent, name)?;
                }

                let meta = file.metadata()?;
                let node = self.make_node(
                    &rel,
                    self.upper_idx().unwrap_or(0),
                    name,
                    meta.ino(),
                    meta.dev(),
                    false,
                    Some(&parent),
                );
                if !is_whiteout {
                    node.last_layer.lock().replace(self.upper_idx().unwrap_or(0));
                }
                let node = insert_child(&parent, node, true).unwrap_or_else(|e| e);
                return Ok((node, file));
            }
        };

        if readonly {
            let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
            let full = self.layers[layer].store.full_path(&node.path());
            let file = open_with_flags(&full, flags, mode)?;
            return Ok((node, file));
        }

        let node = self.get_node_up(&node)?;
        let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
        let full = self.layers[layer].store.full_path(&node.path());
        let file = open_with_flags(&full, flags, mode)?;
        Ok((node, file))
    }

    /// Try to create directly in place; fall back to staging and rename when
    /// ownership must be adjusted or a whiteout sits at the destination.
    fn direct_create_file(
        &self,
        rel: &str,
        uid: u32,
        gid: u32,
        flags: i32,
        mode: u32,
    ) -> io::Result<File> {
        let no_chown =
            uid == self.euid && gid == self.egid && self.stat_override == StatOverride::None;
        let dest = self.upper_full(rel)?;

        if no_chown {
            if let Ok(file) = open_with_flags(&dest, flags, mode) {
                return Ok(file);
            }
        }

        let wd_name = self.next_wd_name();
        let staged = self.workdir()?.join(&wd_name);
        let file = open_with_flags(&staged, flags | libc::O_CREAT, mode)?;

        let result: io::Result<()> = (|| {
            if !no_chown {
                self.set_owner(Some(&file), None, uid, gid, mode)?;
            }
            std::fs::rename(&staged, &dest)
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }
        Ok(file)
    }

    pub fn mknod(
        &self,
        parent: &Arc<Node>,
        name: &str,
        mut mode: u32,
        rdev: u64,
        caller: (u32, u32),
    ) -> io::Result<Arc<Node>> {
        self.check_namelen(name)?;
        if self.stat_override != StatOverride::None {
            mode |= 0o755;
        }

        if let Some(existing) = self.lookup(parent, name)? {
            if !existing.is_whiteout() {
                return Err(errno(libc::EEXIST));
            }
        }

        let parent = self.get_node_up(parent)?;

        let wd_name = self.next_wd_name();
        let staged = self.workdir()?.join(&wd_name);
        let c = cpath(&staged)?;
        if unsafe { libc::mknod(c.as_ptr(), mode, rdev as libc::dev_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let result: io::Result<Arc<Node>> = (|| {
            self.set_owner(
                None,
                Some(&staged),
                self.idmap.uid_in(caller.0),
                self.idmap.gid_in(caller.1),
                mode,
            )?;

            let rel = Self::join_path(&parent.path(), name);
            std::fs::rename(&staged, self.upper_full(&rel)?)?;

            let node = self.make_node(
                &rel,
                self.upper_idx().unwrap_or(0),
                name,
                0,
                0,
                false,
                Some(&parent),
            );
            let node = insert_child(&parent, node, true).unwrap_or_else(|e| e);
            self.delete_whiteout(&parent, name)?;
            Ok(node)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&staged);
        }
        result
    }

    pub fn mkdir(
        &self,
        parent: &Arc<Node>,
        name: &str,
        mut mode: u32,
        caller: (u32, u32),
    ) -> io::Result<Arc<Node>> {
        self.check_namelen(name)?;
        if self.stat_override != StatOverride::None {
            mode |= 0o755;
        }

        let existing = self.lookup(parent, name)?;
        if let Some(node) = &existing {
            if !node.is_whiteout() {
                return Err(errno(libc::EEXIST));
            }
        }

        let parent = self.get_node_up(&parent.clone())?;
        let need_delete_whiteout =
            existing.is_some() || !parent.loaded.load(Ordering::Relaxed);
        let upper = self.upper_idx().unwrap_or(0);
        let parent_upperdir_only = *parent.last_layer.lock() == Some(upper);

        let rel = Self::join_path(&parent.path(), name);
        self.create_directory(
            &rel,
            Some(&parent),
            None,
            self.idmap.uid_in(caller.0),
            self.idmap.gid_in(caller.1),
            mode,
            true,
        )?;

        if need_delete_whiteout {
            self.delete_whiteout(&parent, name)?;
        }

        let meta = self.upper_layer()?.store.stat(&rel)?;
        let (ino, dev) = if parent_upperdir_only {
            (meta.ino(), meta.dev())
        } else {
            (0, 0)
        };

        let node = self.make_node(&rel, upper, name, ino, dev, true, Some(&parent));
        let node = insert_child(&parent, node, true).unwrap_or_else(|e| e);

        if parent_upperdir_only {
            *node.last_layer.lock() = *parent.last_layer.lock();
            if self.timeout > 0.0 {
                node.loaded.store(true, Ordering::Relaxed);
            }
        } else {
            self.hide_all(&node)?;
            node.last_layer.lock().replace(upper);
            node.loaded.store(self.timeout > 0.0, Ordering::Relaxed);
        }

        Ok(node)
    }

    pub fn symlink(
        &self,
        parent: &Arc<Node>,
        name: &str,
        target: &str,
        caller: (u32, u32),
    ) -> io::Result<Arc<Node>> {
        self.check_namelen(name)?;

        if let Some(existing) = self.lookup(parent, name)? {
            if !existing.is_whiteout() {
                return Err(errno(libc::EEXIST));
            }
        }

        let parent = self.get_node_up(parent)?;
        let rel = Self::join_path(&parent.path(), name);
        let dest = self.upper_full(&rel)?;

        std::os::unix::fs::symlink(target, &dest)?;
        self.set_owner(
            None,
            Some(&dest),
            self.idmap.uid_in(caller.0),
            self.idmap.gid_in(caller.1),
            0o777,
        )?;

        self.delete_whiteout(&parent, name)?;

        let node = self.make_node(
            &rel,
            self.upper_idx().unwrap_or(0),
            name,
            0,
            0,
            false,
            Some(&parent),
        );
        Ok(insert_child(&parent, node, true).unwrap_or_else(|e| e))
    }

    pub fn link(
        &self,
        node: &Arc<Node>,
        newparent: &Arc<Node>,
        newname: &str,
    ) -> io::Result<Arc<Node>> {
        self.check_namelen(newname)?;

        let node = self.get_node_up(node)?;
        let newparent = self.get_node_up(newparent)?;

        let rel = Self::join_path(&newparent.path(), newname);
        let src = self.upper_full(&node.path())?;
        let dest = self.upper_full(&rel)?;

        std::fs::hard_link(&src, &dest)?;
        self.delete_whiteout(&newparent, newname)?;

        let meta = std::fs::symlink_metadata(&dest)?;
        let alias = self.make_node(
            &rel,
            self.upper_idx().unwrap_or(0),
            newname,
            meta.ino(),
            meta.dev(),
            false,
            Some(&newparent),
        );
        Ok(insert_child(&newparent, alias, true).unwrap_or_else(|e| e))
    }

    pub fn readlink(&self, node: &Arc<Node>) -> io::Result<std::ffi::OsString> {
        let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
        self.layers[layer].store.readlink(&node.path())
    }

    /// Unlink or rmdir.
    pub fn do_rm(&self, parent: &Arc<Node>, name: &str, dirp: bool) -> io::Result<()> {
        let node = self
            .lookup(parent, name)?
            .filter(|n| !n.is_whiteout())
            .ok_or_else(|| errno(libc::ENOENT))?;

        let mut whiteouts = 0;
        if dirp {
            if !node.is_dir() {
                return Err(errno(libc::ENOTDIR));
            }
            self.reload_dir(&node)?;
            let (visible, wh) = node.count_entries();
            whiteouts = wh;
            if visible > 0 {
                return Err(errno(libc::ENOTEMPTY));
            }
        }

        if self.node_on_upper(&node) && dirp && whiteouts > 0 {
            self.empty_upper_dir(&node)?;
        }

        let parent = self.get_node_up(parent)?;
        let node = self.get_node_up(&node)?;

        if let Some(removed) = parent.remove_child(name) {
            self.hide_node(&removed, true)?;
        }

        Ok(())
    }

    /// Exchange-mode rename: both endpoints must already exist.
    pub fn rename_exchange(
        &self,
        parent: &Arc<Node>,
        name: &str,
        newparent: &Arc<Node>,
        newname: &str,
    ) -> io::Result<()> {
        let node = self
            .lookup(parent, name)?
            .filter(|n| !n.is_whiteout())
            .ok_or_else(|| errno(libc::ENOENT))?;

        let upper = self.upper_idx().ok_or_else(|| errno(libc::EROFS))?;

        if node.is_dir() {
            self.reload_dir(&node)?;
            if !self.node_on_upper(&node) || *node.last_layer.lock() != Some(upper) {
                return Err(errno(libc::EXDEV));
            }
        }

        let pnode = self.get_node_up(parent)?;
        let destpnode = self.get_node_up(newparent)?;

        let destnode = self
            .lookup(&destpnode, newname)?
            .ok_or_else(|| errno(libc::ENOENT))?;
        let node = self.get_node_up(&node)?;

        if node.is_dir() && *destnode.last_layer.lock() != Some(upper) {
            return Err(errno(libc::EXDEV));
        }
        let destnode = self.get_node_up(&destnode)?;

        let src = self.upper_full(&node.path())?;
        let dst = self.upper_full(&destnode.path())?;
        renameat2(&src, &dst, libc::RENAME_EXCHANGE)?;

        pnode.remove_child(name);
        destpnode.remove_child(newname);

        {
            let mut a_path = node.path.lock();
            let mut b_path = destnode.path.lock();
            std::mem::swap(&mut *a_path, &mut *b_path);
        }
        {
            let mut a_name = node.name.lock();
            let mut b_name = destnode.name.lock();
            std::mem::swap(&mut *a_name, &mut *b_name);
        }

        let node = insert_child(&destpnode, node, true).unwrap_or_else(|e| e);
        let destnode = insert_child(&pnode, destnode, true).unwrap_or_else(|e| e);
        update_paths(&node);
        update_paths(&destnode);

        self.delete_whiteout(&destpnode, newname)?;
        Ok(())
    }

    /// Direct-mode rename with whiteout bookkeeping.
    pub fn rename_direct(
        &self,
        parent: &Arc<Node>,
        name: &str,
        newparent: &Arc<Node>,
        newname: &str,
        noreplace: bool,
    ) -> io::Result<()> {
        let node = self
            .lookup(parent, name)?
            .filter(|n| !n.is_whiteout())
            .ok_or_else(|| errno(libc::ENOENT))?;

        let upper = self.upper_idx().ok_or_else(|| errno(libc::EROFS))?;

        if node.is_dir() {
            self.reload_dir(&node)?;
            if !self.node_on_upper(&node) || *node.last_layer.lock() != Some(upper) {
                return Err(errno(libc::EXDEV));
            }
        }

        let pnode = self.get_node_up(parent)?;
        let destpnode = self.get_node_up(newparent)?;
        let destnode = destpnode.child(newname).or(self.lookup(&destpnode, newname)?);
        let node = self.get_node_up(&node)?;

        let mut destnode_is_whiteout = false;

        if let Some(dest) = &destnode {
            if noreplace && !dest.is_whiteout() {
                return Err(errno(libc::EEXIST));
            }

            if !dest.is_whiteout() {
                if dest.tmp_ino.load(Ordering::Relaxed) == node.tmp_ino.load(Ordering::Relaxed)
                    && dest.tmp_dev.load(Ordering::Relaxed) == node.tmp_dev.load(Ordering::Relaxed)
                {
                    return Err(errno(libc::EEXIST));
                }

                if dest.is_dir() {
                    self.reload_dir(dest)?;
                    let (visible, wh) = dest.count_entries();
                    if visible > 0 {
                        return Err(errno(libc::ENOTEMPTY));
                    }
                    if wh > 0 {
                        self.empty_upper_dir(dest)?;
                    }
                }

                if node.is_dir() {
                    self.create_missing_whiteouts(&node, &dest.path())?;
                }

                let dest = self.get_node_up(dest)?;
                destpnode.remove_child(newname);
                self.hide_node(&dest, true)?;
            } else {
                destnode_is_whiteout = true;
            }
        }

        let src = self.upper_full(&node.path())?;
        let dst_rel = Self::join_path(&destpnode.path(), newname);
        let dst = self.upper_full(&dst_rel)?;

        let mut done = false;
        if destnode_is_whiteout {
            // Exchange gets both the rename and the whiteout in one step.
            if renameat2(&src, &dst, libc::RENAME_EXCHANGE).is_ok() {
                // Drain the displaced whiteout from the source name.
                let _ = std::fs::remove_file(&src);
                done = true;
            }
        }

        if !done {
            if node.is_dir() {
                // A whiteout at the destination would fail the rename.
                self.create_whiteout(&destpnode, newname, true, true)?;
                let _ = std::fs::remove_file(&dst);
            }

            let whiteout_res = if self.can_mknod.load(Ordering::Relaxed) {
                renameat2(&src, &dst, libc::RENAME_WHITEOUT)
            } else {
                Err(errno(libc::EPERM))
            };

            match whiteout_res {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    // Destination holds a whiteout: overwrite it.
                    renameat2(&src, &dst, 0)?;
                }
                Err(_) => {
                    renameat2(&src, &dst, if noreplace { libc::RENAME_NOREPLACE } else { 0 })?;
                    self.create_whiteout(&pnode, name, false, true)?;
                    pnode.loaded.store(false, Ordering::Relaxed);
                }
            }

            self.delete_whiteout(&destpnode, newname)?;
        }

        if let Some(dest) = destnode {
            if dest.is_whiteout() {
                destpnode.remove_child(newname);
                self.inodes.lock().drop_node(&dest);
            }
        }

        pnode.remove_child(name);
        *node.name.lock() = newname.to_string();
        let node = insert_child(&destpnode, node, true).unwrap_or_else(|e| e);
        update_paths(&node);
        node.loaded.store(false, Ordering::Relaxed);

        Ok(())
    }

    /// Apply attribute changes in time, mode, size, ownership order.
    pub fn setattr(&self, node: &Arc<Node>, changes: &SetAttrChanges) -> io::Result<NodeStat> {
        let node = self.get_node_up(node)?;

        let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
        let full = self.layers[layer].store.full_path(&node.path());
        let meta = std::fs::symlink_metadata(&full)?;
        let fmt = meta.mode() & libc::S_IFMT;

        let file = match fmt {
            libc::S_IFREG => {
                let write = changes.size.is_some();
                Some(open_with_flags(
                    &full,
                    libc::O_NONBLOCK | if write { libc::O_WRONLY } else { 0 },
                    0,
                )?)
            }
            libc::S_IFDIR => open_with_flags(&full, libc::O_NONBLOCK, 0).ok(),
            _ => None,
        };

        // Times first.
        if changes.atime.is_some() || changes.mtime.is_some() {
            let omit = libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            };
            let mk = |t: Option<(i64, i64)>, now: bool| -> libc::timespec {
                if now {
                    libc::timespec {
                        tv_sec: 0,
                        tv_nsec: libc::UTIME_NOW,
                    }
                } else if let Some((s, ns)) = t {
                    libc::timespec {
                        tv_sec: s,
                        tv_nsec: ns,
                    }
                } else {
                    omit
                }
            };
            let times = [
                mk(changes.atime, changes.atime_now),
                mk(changes.mtime, changes.mtime_now),
            ];
            let ret = if let Some(f) = &file {
                unsafe { libc::futimens(f.as_raw_fd(), times.as_ptr()) }
            } else {
                let c = cpath(&full)?;
                unsafe {
                    libc::utimensat(
                        libc::AT_FDCWD,
                        c.as_ptr(),
                        times.as_ptr(),
                        libc::AT_SYMLINK_NOFOLLOW,
                    )
                }
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(mode) = changes.mode {
            self.set_mode(file.as_ref(), Some(&full), mode & 0o7777)?;
            if let Some(record) = node.record.lock().as_ref() {
                record.mode.store(mode, Ordering::Relaxed);
            }
        }

        if let Some(size) = changes.size {
            let ret = if let Some(f) = &file {
                unsafe { libc::ftruncate(f.as_raw_fd(), size as libc::off_t) }
            } else {
                let c = cpath(&full)?;
                unsafe { libc::truncate(c.as_ptr(), size as libc::off_t) }
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            // The cached block may now lie past EOF.
            node.block_cache.lock().clear();
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            let uid = changes.uid.map(|u| self.idmap.uid_in(u)).unwrap_or(meta.uid());
            let gid = changes.gid.map(|g| self.idmap.gid_in(g)).unwrap_or(meta.gid());
            let mode = node
                .record
                .lock()
                .as_ref()
                .map(|r| r.mode())
                .unwrap_or(meta.mode());
            self.set_owner(file.as_ref(), Some(&full), uid, gid, mode)?;
        }

        self.stat_node(&node)
    }

    // ------------------------------------------------------------------
    // Extended attributes

    pub fn getxattr(&self, node: &Arc<Node>, name: &str) -> io::Result<Vec<u8>> {
        if self.noxattrs {
            return Err(errno(libc::ENOSYS));
        }
        if !can_access_xattr(name) {
            return Err(errno(libc::ENODATA));
        }

        let value = if node.is_hidden() {
            let path = node
                .hidden_path
                .lock()
                .clone()
                .ok_or_else(|| errno(libc::ENOENT))?;
            xattr::get(&path, name)?
        } else {
            let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
            self.layers[layer].store.getxattr(&node.path(), name)?
        };

        value.ok_or_else(|| errno(libc::ENODATA))
    }

    pub fn listxattr(&self, node: &Arc<Node>) -> io::Result<Vec<String>> {
        if self.noxattrs {
            return Err(errno(libc::ENOSYS));
        }

        let names = if node.is_hidden() {
            let path = node
                .hidden_path
                .lock()
                .clone()
                .ok_or_else(|| errno(libc::ENOENT))?;
            xattr::list(&path)?
                .map(|n| n.to_string_lossy().into_owned())
                .collect()
        } else {
            let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
            self.layers[layer].store.listxattr(&node.path())?
        };

        Ok(names.into_iter().filter(|n| can_access_xattr(n)).collect())
    }

    pub fn setxattr(&self, node: &Arc<Node>, name: &str, value: &[u8]) -> io::Result<()> {
        if self.noxattrs {
            return Err(errno(libc::ENOSYS));
        }
        if !can_access_xattr(name) {
            return Err(errno(libc::EPERM));
        }
        let node = self.get_node_up(node)?;
        let full = self.upper_full(&node.path())?;
        xattr::set(full, name, value)
    }

    pub fn removexattr(&self, node: &Arc<Node>, name: &str) -> io::Result<()> {
        if self.noxattrs {
            return Err(errno(libc::ENOSYS));
        }
        if !can_access_xattr(name) {
            return Err(errno(libc::EPERM));
        }
        let node = self.get_node_up(node)?;
        let full = self.upper_full(&node.path())?;
        xattr::remove(full, name)
    }

    // ------------------------------------------------------------------
    // File content

    /// Read file content; upper-layer bodies are decrypted block-wise.
    pub fn read_node(
        &self,
        node: &Arc<Node>,
        file: &File,
        offset: u64,
        size: usize,
    ) -> io::Result<Vec<u8>> {
        if self.node_uses_crypto(node) {
            let mut out = vec![0u8; size];
            let mut cache = node.block_cache.lock();
            let n = blockio::read_blocks(&self.key, &mut cache, file, &mut out, offset)?;
            out.truncate(n);
            return Ok(out);
        }

        use std::os::unix::fs::FileExt;
        let mut out = vec![0u8; size];
        let n = file.read_at(&mut out, offset)?;
        out.truncate(n);
        Ok(out)
    }

    /// Write file content; upper-layer bodies are encrypted block-wise
    /// through a private read-write descriptor on the backing file.
    pub fn write_node(
        &self,
        node: &Arc<Node>,
        file: &File,
        offset: u64,
        data: &[u8],
    ) -> io::Result<usize> {
        if self.node_uses_crypto(node) {
            let layer = (*node.layer.lock()).ok_or_else(|| errno(libc::ENOENT))?;
            let rw = self.layers[layer].store.open(&node.path(), true)?;
            let file_size = rw.metadata()?.len();
            let mut cache = node.block_cache.lock();
            return blockio::write_blocks(&self.key, &mut cache, &rw, file_size, data, offset);
        }

        use std::os::unix::fs::FileExt;
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Kernel dropped `nlookup` references to `ino`. Frees nodes whose
    /// record emptied, executing deferred hidden-node deletions.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        let released = self.inodes.lock().forget(ino, nlookup);
        for node in released {
            if let Some(parent) = node.parent_node() {
                let same = parent
                    .child(&node.name())
                    .map(|c| Arc::ptr_eq(&c, &node))
                    .unwrap_or(false);
                if same {
                    parent.remove_child(&node.name());
                    parent.loaded.store(false, Ordering::Relaxed);
                }
            }

            let state = *node.hidden.lock();
            if let Some(hidden) = node.hidden_path.lock().clone() {
                match state {
                    HiddenState::PendingUnlink => {
                        let _ = std::fs::remove_file(&hidden);
                    }
                    HiddenState::PendingRmdir => {
                        let _ = std::fs::remove_dir_all(&hidden);
                    }
                    HiddenState::Active => {}
                }
            }

            for child in node.children_snapshot() {
                *child.parent.lock() = std::sync::Weak::new();
            }
        }
    }

    pub fn lookup_count_up(&self, node: &Arc<Node>) {
        if let Some(record) = node.record.lock().as_ref() {
            *record.lookups.lock() += 1;
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        let table = self.inodes.lock();
        (table.node_count(), table.record_count())
    }

    /// Visible children for a directory stream, with `.` and `..`
    /// synthesized by the adapter.
    pub fn dir_entries(&self, node: &Arc<Node>) -> io::Result<Vec<Arc<Node>>> {
        self.reload_dir(node)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for child in node.children_snapshot() {
            if child.is_whiteout() || child.is_hidden() {
                continue;
            }
            if !path_allowed(&child.path(), self.mount_parent.as_deref()) {
                continue;
            }
            if seen.insert(child.name()) {
                out.push(child);
            }
        }
        out.sort_by_key(|n| n.name());
        Ok(out)
    }
}

/// Create `<base>/work` (mode 0700) and empty it.
fn prepare_workdir(base: &Path) -> crate::Result<PathBuf> {
    std::fs::create_dir_all(base)?;
    let work = base.join("work");
    if let Err(e) = std::fs::create_dir(&work) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            return Err(e.into());
        }
    }
    empty_dir_tree(&work)?;
    Ok(work)
}

/// Remove every entry under `dir`, leaving the directory itself.
fn empty_dir_tree(dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let ft = entry.file_type()?;
        if ft.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Copy user-visible xattrs between open files; reserved namespaces are
/// skipped, as are attributes the destination cannot take.
fn copy_filtered_xattrs(src: &File, dst: &File) -> io::Result<()> {
    let names = match src.list_xattr() {
        Ok(n) => n,
        Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return Ok(()),
        Err(e) => return Err(e),
    };

    for name in names {
        let name_str = name.to_string_lossy().into_owned();
        if !can_access_xattr(&name_str) {
            continue;
        }
        if let Some(value) = src.get_xattr(&name)? {
            match dst.set_xattr(&name, &value) {
                Ok(()) => {}
                Err(e)
                    if e.raw_os_error() == Some(libc::EINVAL)
                        || e.raw_os_error() == Some(libc::ENOTSUP) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
