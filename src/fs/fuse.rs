//! FUSE adapter: translates kernel operations into engine calls under the
//! request serialization lock, with the access gate applied to every
//! request before any state is touched.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::gate::AccessGate;

use super::node::{Node, FUSE_ROOT_ID};
use super::overlay::{NodeStat, OverlayFs, SetAttrChanges};

const COPY_RANGE_CHUNK: usize = 1 << 17;

struct FileHandle {
    node: Arc<Node>,
    file: File,
}

struct DirHandle {
    node: Arc<Node>,
    entries: Vec<(u64, FileType, String)>,
    generation: u64,
}

pub struct JailFs {
    fs: Arc<OverlayFs>,
    gate: Arc<AccessGate>,
    /// The big lock: one request mutates engine state at a time. Handlers
    /// drop it before long-latency per-file syscalls.
    lock: Mutex<()>,
    handles: HashMap<u64, FileHandle>,
    dir_handles: HashMap<u64, DirHandle>,
    next_fh: std::sync::atomic::AtomicU64,
}

fn ts(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn attr_of(stat: &NodeStat) -> FileAttr {
    FileAttr {
        ino: stat.kernel_ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: ts(stat.atime.0, stat.atime.1),
        mtime: ts(stat.mtime.0, stat.mtime.1),
        ctime: ts(stat.ctime.0, stat.ctime.1),
        crtime: ts(stat.ctime.0, stat.ctime.1),
        kind: kind_of(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev as u32,
        blksize: stat.blksize,
        flags: 0,
    }
}

fn errno_of(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

impl JailFs {
    pub fn new(fs: Arc<OverlayFs>, gate: Arc<AccessGate>) -> Self {
        Self {
            fs,
            gate,
            lock: Mutex::new(()),
            handles: HashMap::new(),
            dir_handles: HashMap::new(),
            next_fh: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Rejections surface as not-found so the gate never confirms a name.
    fn gate_ok(&self, req: &Request<'_>, ino: u64) -> bool {
        self.gate.allow(req.pid() as i32, ino == FUSE_ROOT_ID)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.fs.timeout.max(0.0).min(1.0e9))
    }

    fn node(&self, ino: u64) -> Option<Arc<Node>> {
        self.fs.node_by_ino(ino)
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn entry_reply(&self, node: &Arc<Node>, reply: ReplyEntry) {
        match self.fs.stat_node(node) {
            Ok(stat) => {
                self.fs.lookup_count_up(node);
                reply.entry(&self.ttl(), &attr_of(&stat), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn snapshot_dir(&self, node: &Arc<Node>) -> io::Result<DirHandle> {
        let children = self.fs.dir_entries(node)?;
        let parent_ino = node
            .parent_node()
            .map(|p| p.kernel_ino())
            .unwrap_or(node.kernel_ino());

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((node.kernel_ino(), FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for child in children {
            let kind = if child.is_dir() {
                FileType::Directory
            } else {
                let mode = child
                    .record
                    .lock()
                    .as_ref()
                    .map(|r| r.mode())
                    .unwrap_or(libc::S_IFREG);
                kind_of(mode)
            };
            entries.push((child.kernel_ino(), kind, child.name()));
        }

        Ok(DirHandle {
            generation: node.dir_generation.load(std::sync::atomic::Ordering::Relaxed),
            node: node.clone(),
            entries,
        })
    }
}

impl Filesystem for JailFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let pnode = match self.node(parent) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = name.to_string_lossy();

        match self.fs.lookup(&pnode, &name) {
            Ok(Some(node)) if !node.is_whiteout() => {
                if node.is_dir() {
                    if let Err(e) = self.fs.reload_dir(&node) {
                        reply.error(errno_of(&e));
                        return;
                    }
                }
                self.entry_reply(&node, reply);
            }
            Ok(_) => reply.error(libc::ENOENT),
            // Reserved-name lookups surface as not-found, never as a hint
            // that the prefix means something.
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        let _guard = self.lock.lock();
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        match self.node(ino).map(|n| self.fs.stat_node(&n)) {
            Some(Ok(stat)) => reply.attr(&self.ttl(), &attr_of(&stat)),
            Some(Err(e)) => reply.error(errno_of(&e)),
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let guard = self.lock.lock();

        let node = match self.node(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let mut changes = SetAttrChanges {
            mode,
            size,
            uid,
            gid,
            ..Default::default()
        };
        let to_parts = |t: SystemTime| -> (i64, i64) {
            match t.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
                Err(e) => (-(e.duration().as_secs() as i64), 0),
            }
        };
        match atime {
            Some(TimeOrNow::SpecificTime(t)) => changes.atime = Some(to_parts(t)),
            Some(TimeOrNow::Now) => {
                changes.atime = Some((0, 0));
                changes.atime_now = true;
            }
            None => {}
        }
        match mtime {
            Some(TimeOrNow::SpecificTime(t)) => changes.mtime = Some(to_parts(t)),
            Some(TimeOrNow::Now) => {
                changes.mtime = Some((0, 0));
                changes.mtime_now = true;
            }
            None => {}
        }

        // Large truncates can stall; do not hold other requests behind them.
        if size.is_some() {
            drop(guard);
        }

        match self.fs.setattr(&node, &changes) {
            Ok(stat) => reply.attr(&self.ttl(), &attr_of(&stat)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        match self.node(ino) {
            Some(node) => match self.fs.readlink(&node) {
                Ok(target) => reply.data(target.as_encoded_bytes()),
                Err(e) => reply.error(errno_of(&e)),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let pnode = match self.node(parent) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = name.to_string_lossy();
        let caller = (req.uid(), req.gid());

        match self
            .fs
            .mknod(&pnode, &name, mode & !umask, rdev as u64, caller)
        {
            Ok(node) => self.entry_reply(&node, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let pnode = match self.node(parent) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = name.to_string_lossy();
        let caller = (req.uid(), req.gid());

        match self.fs.mkdir(&pnode, &name, mode & !umask, caller) {
            Ok(node) => self.entry_reply(&node, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let pnode = match self.node(parent) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.fs.do_rm(&pnode, &name.to_string_lossy(), false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let pnode = match self.node(parent) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.fs.do_rm(&pnode, &name.to_string_lossy(), true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let pnode = match self.node(parent) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = link_name.to_string_lossy();
        let target = target.to_string_lossy();
        let caller = (req.uid(), req.gid());

        match self.fs.symlink(&pnode, &name, &target, caller) {
            Ok(node) => self.entry_reply(&node, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let (pnode, destpnode) = match (self.node(parent), self.node(newparent)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = name.to_string_lossy();
        let newname = newname.to_string_lossy();

        if newname.len() as u64 > self.fs.fs_namemax() {
            reply.error(libc::ENAMETOOLONG);
            return;
        }

        let result = if flags & libc::RENAME_EXCHANGE != 0 {
            self.fs.rename_exchange(&pnode, &name, &destpnode, &newname)
        } else {
            self.fs.rename_direct(
                &pnode,
                &name,
                &destpnode,
                &newname,
                flags & libc::RENAME_NOREPLACE != 0,
            )
        };

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let (node, pnode) = match (self.node(ino), self.node(newparent)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.fs.link(&node, &pnode, &newname.to_string_lossy()) {
            Ok(alias) => self.entry_reply(&alias, reply),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let node = match self.node(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let caller = (req.uid(), req.gid());

        match self.fs.open_node(&node, None, flags, 0, caller) {
            Ok((node, file)) => {
                let fh = self.alloc_fh();
                self.handles.insert(fh, FileHandle { node, file });
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if !self.gate_ok(req, parent) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let pnode = match self.node(parent) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = name.to_string_lossy();
        let caller = (req.uid(), req.gid());

        match self
            .fs
            .open_node(&pnode, Some(&name), flags | libc::O_CREAT, mode & !umask, caller)
        {
            Ok((node, file)) => match self.fs.stat_node(&node) {
                Ok(stat) => {
                    let fh = self.alloc_fh();
                    self.handles.insert(
                        fh,
                        FileHandle {
                            node: node.clone(),
                            file,
                        },
                    );
                    self.fs.lookup_count_up(&node);
                    reply.created(&self.ttl(), &attr_of(&stat), 0, fh, 0);
                }
                Err(e) => reply.error(errno_of(&e)),
            },
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let handle = match self.handles.get(&fh) {
            Some(h) => h,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        match self
            .fs
            .read_node(&handle.node, &handle.file, offset.max(0) as u64, size as usize)
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let handle = match self.handles.get(&fh) {
            Some(h) => h,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        match self
            .fs
            .write_node(&handle.node, &handle.file, offset.max(0) as u64, data)
        {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let _guard = self.lock.lock();
        self.handles.remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        if !self.fs.fsync_enabled {
            reply.ok();
            return;
        }
        let guard = self.lock.lock();
        let file = match self.handles.get(&fh) {
            Some(h) => h.file.try_clone(),
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        drop(guard);

        let result = file.and_then(|f| if datasync { f.sync_data() } else { f.sync_all() });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let node = match self.node(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if !node.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }

        match self.snapshot_dir(&node) {
            Ok(handle) => {
                node.in_readdir
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let fh = self.alloc_fh();
                self.dir_handles.insert(fh, handle);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        // A mutation may have landed while the stream was open; restart
        // passes re-snapshot so the listing reflects it.
        if offset == 0 {
            let stale = self
                .dir_handles
                .get(&fh)
                .map(|h| {
                    h.generation
                        != h.node
                            .dir_generation
                            .load(std::sync::atomic::Ordering::Relaxed)
                })
                .unwrap_or(false);
            if stale {
                let node = self.dir_handles.get(&fh).map(|h| h.node.clone());
                if let Some(node) = node {
                    debug!(path = %node.path(), "refreshing stale directory snapshot");
                    match self.snapshot_dir(&node) {
                        Ok(fresh) => {
                            self.dir_handles.insert(fh, fresh);
                        }
                        Err(e) => {
                            reply.error(errno_of(&e));
                            return;
                        }
                    }
                }
            }
        }

        let handle = match self.dir_handles.get(&fh) {
            Some(h) => h,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        for (i, (child_ino, kind, name)) in
            handle.entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let _guard = self.lock.lock();
        if let Some(handle) = self.dir_handles.remove(&fh) {
            handle
                .node
                .in_readdir
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        match self.fs.statfs() {
            Ok(vfs) => reply.statfs(
                vfs.blocks(),
                vfs.blocks_free(),
                vfs.blocks_available(),
                vfs.files(),
                vfs.files_free(),
                vfs.block_size() as u32,
                (vfs.name_max() as u32).saturating_sub(super::WHITEOUT_MAX_LEN as u32),
                vfs.fragment_size() as u32,
            ),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let node = match self.node(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.fs.setxattr(&node, &name.to_string_lossy(), value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let node = match self.node(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.fs.getxattr(&node, &name.to_string_lossy()) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() as u32 <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let node = match self.node(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.fs.listxattr(&node) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32);
                } else if buf.len() as u32 <= size {
                    reply.data(&buf);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let node = match self.node(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.fs.removexattr(&node, &name.to_string_lossy()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        if self.node(ino).is_some() {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        if !self.gate_ok(req, ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let guard = self.lock.lock();
        let fd = match self.handles.get(&fh) {
            Some(h) => h.file.as_raw_fd(),
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        drop(guard);

        let ret = unsafe { libc::fallocate(fd, mode, offset, length) };
        if ret < 0 {
            reply.error(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.ok();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        if !self.gate_ok(req, ino_in) {
            reply.error(libc::ENOENT);
            return;
        }
        let _guard = self.lock.lock();

        let (src_node, src_file) = match self.handles.get(&fh_in) {
            Some(h) => (h.node.clone(), h.file.try_clone()),
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let (dst_node, dst_file) = match self.handles.get(&fh_out) {
            Some(h) => (h.node.clone(), h.file.try_clone()),
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let (src_file, dst_file) = match (src_file, dst_file) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                reply.error(libc::EIO);
                return;
            }
        };

        let mut copied = 0u64;
        let mut read_off = offset_in.max(0) as u64;
        let mut write_off = offset_out.max(0) as u64;

        while copied < len {
            let chunk = COPY_RANGE_CHUNK.min((len - copied) as usize);
            let data = match self.fs.read_node(&src_node, &src_file, read_off, chunk) {
                Ok(d) => d,
                Err(e) => {
                    reply.error(errno_of(&e));
                    return;
                }
            };
            if data.is_empty() {
                break;
            }
            match self.fs.write_node(&dst_node, &dst_file, write_off, &data) {
                Ok(n) => {
                    copied += n as u64;
                    read_off += n as u64;
                    write_off += n as u64;
                }
                Err(e) => {
                    reply.error(errno_of(&e));
                    return;
                }
            }
        }

        reply.written(copied as u32);
    }
}

/// Handle to a running mount; callers invoke `unmount` explicitly.
pub struct MountHandle {
    mountpoint: String,
    session: BackgroundSession,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl MountHandle {
    pub fn unmount(self) {
        self.session.join();
    }
}

/// Spawn a background FUSE session for the adapter.
pub fn spawn_overlay(fs: JailFs, mountpoint: &Path) -> crate::Result<MountHandle> {
    let mountpoint_str = mountpoint.to_string_lossy().to_string();

    let mut options = vec![
        MountOption::FSName("jailfs".into()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if unsafe { libc::geteuid() } == 0 {
        options.push(MountOption::AllowOther);
        options.push(MountOption::Suid);
        options.push(MountOption::Dev);
    }

    let session = fuser::spawn_mount2(fs, mountpoint, &options)?;
    Ok(MountHandle {
        mountpoint: mountpoint_str,
        session,
    })
}
