//! Translates the inode-addressed wire protocol ([`Filesystem`]) into calls
//! against the node-tree API ([`FsNode`]/[`OpenFile`]/[`OpenDir`]), using the
//! [`InodeTable`] to track lookup counts and mint `nodeid`s and the
//! [`HandleMap`] to track open `fh`s.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use log::warn;

use crate::ll::Generation;
use crate::reply::Xattr;
use crate::{
    AccessFlags, Bytes, Errno, FileAttr, FileHandle, Filesystem, FopenFlags, INodeNo, KernelConfig,
    OpenFlags, ReadFlags, RenameFlags, Request, TimeOrNow,
};
use crate::reply::{ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry,
    ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr};

use super::dirent;
use super::inode::{FsOptions, Inode, InodeTable, Mount, OpenHandle, OpenedFile};
use super::node::{Context, FsNode, LookupReply, OpenFile};
use super::buffer_pool::BufferPool;

/// Builds the per-request [`Context`] from the wire request header.
fn ctx_of(req: &Request) -> Context {
    Context { uid: req.uid(), gid: req.gid(), pid: req.pid() }
}

/// Reserved name intercepted at the root when `FsOptions::poll_hack` is set.
const POLL_HACK_NAME: &[u8] = b".go-fuse-epoll-hack";
/// Sentinel `nodeid` given to the poll-hack entry; never minted by `InodeTable`.
const POLL_HACK_INODE: INodeNo = INodeNo(u64::MAX);

/// Synthetic, always-the-same attributes for the poll-hack entry.
fn poll_hack_attr() -> FileAttr {
    FileAttr {
        ino: POLL_HACK_INODE,
        size: 0,
        blocks: 0,
        atime: std::time::UNIX_EPOCH,
        mtime: std::time::UNIX_EPOCH,
        ctime: std::time::UNIX_EPOCH,
        crtime: std::time::UNIX_EPOCH,
        kind: crate::FileType::RegularFile,
        perm: 0o444,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

/// Wires a node-tree filesystem (rich [`FsNode`] capability set, or a
/// path-keyed [`FileSystem`](super::node::FileSystem) wrapped in
/// [`PathNodeFs`](super::pathfs::PathNodeFs)) up to the wire protocol.
pub struct Connector {
    table: InodeTable,
    mount: Arc<Mount>,
    buffers: BufferPool,
}

impl Connector {
    /// Builds a connector rooted at `root`, under `options`.
    pub fn new(root: Arc<dyn FsNode>, options: FsOptions) -> Self {
        let mount = Mount::new(options);
        let table = InodeTable::new(mount.clone(), root);
        Connector { table, mount, buffers: BufferPool::new() }
    }

    /// The mount this connector is attached to, for wiring up the
    /// notification channel once a session starts serving it (see
    /// [`Session::notifier`](crate::session::Session::notifier)).
    pub fn mount_handle(&self) -> Arc<Mount> {
        self.mount.clone()
    }

    /// Attaches a submount rooted at `name` under `parent`. Fails with
    /// `EBUSY` if `name` already exists there.
    pub fn mount_at(
        &self,
        parent: INodeNo,
        name: &OsStr,
        root: Arc<dyn FsNode>,
        options: FsOptions,
    ) -> Result<INodeNo, Errno> {
        let parent_inode = self.get_inode(parent)?;
        let submount = Mount::new(options);
        let sub_root = self.table.mount_at(&parent_inode, name.as_bytes(), submount, root)?;
        Ok(sub_root.nodeid)
    }

    /// Detaches the subtree rooted at `ino`. Fails with `EBUSY` if any inode
    /// in the subtree has open files, or `ENOENT` if `ino` is unknown.
    pub fn unmount(&self, ino: INodeNo) -> Result<(), Errno> {
        let inode = self.get_inode(ino)?;
        self.table.unmount_subtree(&inode)
    }

    fn get_inode(&self, ino: INodeNo) -> Result<Arc<Inode>, Errno> {
        self.table.get(ino).filter(|i| !i.is_unmounted()).ok_or(Errno::ENOENT)
    }

    fn open_file(&self, fh: FileHandle) -> Option<Arc<dyn OpenFile>> {
        self.mount
            .handles
            .with(fh, |opened| match &opened.handle {
                OpenHandle::File(f) => Some(f.clone()),
                OpenHandle::Dir(_) => None,
            })
            .flatten()
    }

    /// Mints/bumps the inode for a namespace-producing reply and rewrites its
    /// attributes' `ino` field to our own `nodeid` (the underlying filesystem's
    /// own inode numbering is never exposed on the wire).
    fn materialize(&self, parent: &Arc<Inode>, name: &OsStr, looked: LookupReply) -> (Arc<Inode>, FileAttr) {
        let child = self.table.lookup_update(parent, name.as_bytes(), looked.is_dir, looked.node.clone());
        parent.node.add_child(name.as_bytes(), &looked.node);
        let mut attr = looked.attr;
        attr.ino = child.nodeid;
        (child, attr)
    }
}

impl Filesystem for Connector {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        Ok(())
    }

    fn lookup(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let ctx = ctx_of(req);
        if self.mount.options.poll_hack && parent == INodeNo::ROOT && name.as_bytes() == POLL_HACK_NAME {
            return reply.entry(&self.mount.options.entry_timeout, &poll_hack_attr(), Generation(0));
        }
        let parent_inode = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        // `(parent, name)` may already resolve to a submount's root (attached
        // by `mount_at`): that entry's attributes come from its own mount,
        // not from a fresh lookup against the underlying filesystem.
        if let Some(existing) = self.table.child(&parent_inode, name.as_bytes()) {
            if existing.is_mount_root {
                match existing.node.getattr(None, &ctx) {
                    Ok(mut attr) => {
                        self.table.bump_lookup(&existing);
                        attr.ino = existing.nodeid;
                        reply.entry(&existing.mount.options.entry_timeout, &attr, Generation(0));
                    }
                    Err(e) => reply.error(e),
                }
                return;
            }
        }
        match parent_inode.node.lookup(name, &ctx) {
            Ok(looked) => {
                let (_, attr) = self.materialize(&parent_inode, name, looked);
                reply.entry(&self.mount.options.entry_timeout, &attr, Generation(0));
            }
            Err(Errno::ENOENT) if !self.mount.options.negative_timeout.is_zero() => {
                reply.entry_negative(&self.mount.options.negative_timeout);
            }
            Err(e) => reply.error(e),
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        self.table.forget_update(ino, nlookup);
    }

    fn getattr(&self, req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: ReplyAttr) {
        let ctx = ctx_of(req);
        if self.mount.options.poll_hack && ino == POLL_HACK_INODE {
            return reply.attr(&self.mount.options.attr_timeout, &poll_hack_attr());
        }
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        let file = fh.and_then(|h| self.open_file(h));
        let from_file = file.as_deref().and_then(OpenFile::getattr);
        let result = from_file.unwrap_or_else(|| inode.node.getattr(file.as_deref(), &ctx));
        match result {
            Ok(mut attr) => {
                attr.ino = inode.nodeid;
                reply.attr(&self.mount.options.attr_timeout, &attr);
            }
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<crate::BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        let file = fh.and_then(|h| self.open_file(h));
        let file_ref = file.as_deref();

        if let Some(mode) = mode {
            if let Err(e) = inode.node.chmod(file_ref, mode, &ctx) {
                return reply.error(e);
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = inode.node.chown(file_ref, uid, gid, &ctx) {
                return reply.error(e);
            }
        }
        if let Some(size) = size {
            if let Err(e) = inode.node.truncate(file_ref, size, &ctx) {
                return reply.error(e);
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(e) = inode.node.utimens(file_ref, atime, mtime, &ctx) {
                return reply.error(e);
            }
        }
        match inode.node.getattr(file_ref, &ctx) {
            Ok(mut attr) => {
                attr.ino = inode.nodeid;
                reply.attr(&self.mount.options.attr_timeout, &attr);
            }
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&self, req: &Request, ino: INodeNo, reply: ReplyData) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.readlink(&ctx) {
            Ok(target) => reply.data(Bytes::from(target)),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let ctx = ctx_of(req);
        let parent_inode = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match parent_inode.node.mknod(name, mode, rdev, &ctx) {
            Ok(looked) => {
                let (_, attr) = self.materialize(&parent_inode, name, looked);
                reply.entry(&self.mount.options.entry_timeout, &attr, Generation(0));
            }
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(&self, req: &Request, parent: INodeNo, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let ctx = ctx_of(req);
        let parent_inode = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match parent_inode.node.mkdir(name, mode, &ctx) {
            Ok(looked) => {
                let (_, attr) = self.materialize(&parent_inode, name, looked);
                reply.entry(&self.mount.options.entry_timeout, &attr, Generation(0));
            }
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        let parent_inode = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match parent_inode.node.unlink(name, &ctx) {
            Ok(()) => {
                if let Some(child) = self.table.unlink_update(&parent_inode, name.as_bytes()) {
                    parent_inode.node.rm_child(name.as_bytes(), &child.node);
                    self.table.delete_notify(&parent_inode, child.nodeid, name);
                }
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        let parent_inode = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match parent_inode.node.rmdir(name, &ctx) {
            Ok(()) => {
                if let Some(child) = self.table.unlink_update(&parent_inode, name.as_bytes()) {
                    parent_inode.node.rm_child(name.as_bytes(), &child.node);
                    self.table.delete_notify(&parent_inode, child.nodeid, name);
                }
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn symlink(&self, req: &Request, parent: INodeNo, link_name: &OsStr, target: &std::path::Path, reply: ReplyEntry) {
        let ctx = ctx_of(req);
        let parent_inode = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match parent_inode.node.symlink(link_name, target, &ctx) {
            Ok(looked) => {
                let (_, attr) = self.materialize(&parent_inode, link_name, looked);
                reply.entry(&self.mount.options.entry_timeout, &attr, Generation(0));
            }
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        let old_parent = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        let new_parent = match self.get_inode(newparent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        let Some(child) = self.table.child(&old_parent, name.as_bytes()) else {
            return reply.error(Errno::ENOENT);
        };
        if child.is_mount_root {
            return reply.error(Errno::EBUSY);
        }
        if let Some(dest) = self.table.child(&new_parent, newname.as_bytes()) {
            if dest.is_mount_root {
                return reply.error(Errno::EBUSY);
            }
        }
        if let Err(e) = old_parent.node.rename(name, new_parent.node.as_ref(), newname, &ctx) {
            return reply.error(e);
        }
        if let Err(e) = self.table.rename_update(&old_parent, name.as_bytes(), &new_parent, newname.as_bytes()) {
            return reply.error(e);
        }
        old_parent.node.rm_child(name.as_bytes(), &child.node);
        new_parent.node.add_child(newname.as_bytes(), &child.node);
        reply.ok();
    }

    fn link(&self, req: &Request, ino: INodeNo, newparent: INodeNo, newname: &OsStr, reply: ReplyEntry) {
        let ctx = ctx_of(req);
        let existing = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        let new_parent = match self.get_inode(newparent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match new_parent.node.link(&existing.node, newname, &ctx) {
            Ok(looked) => {
                let (_, attr) = self.materialize(&new_parent, newname, looked);
                reply.entry(&self.mount.options.entry_timeout, &attr, Generation(0));
            }
            Err(e) => reply.error(e),
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.open(flags.0, &ctx) {
            Ok((file, fuse_flags)) => {
                let handle = self.mount.handles.register(OpenedFile {
                    nodeid: ino,
                    open_flags: flags.0,
                    fuse_flags,
                    handle: OpenHandle::File(file),
                });
                inode.register_open_file(handle.0);
                reply.opened(handle, fuse_flags);
            }
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<crate::LockOwner>,
        reply: ReplyData,
    ) {
        let Some(file) = self.open_file(fh) else {
            return reply.error(Errno::EBADF);
        };
        match file.read(offset as i64, size) {
            Ok(result) => {
                let (bytes, done) = result.materialize(&self.buffers);
                match bytes {
                    Ok(bytes) => reply.data(bytes),
                    Err(err) => {
                        warn!("read materialize failed: {err}");
                        reply.error(Errno::EIO);
                    }
                }
                done.call();
            }
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: crate::WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<crate::LockOwner>,
        reply: ReplyWrite,
    ) {
        let Some(file) = self.open_file(fh) else {
            return reply.error(Errno::EBADF);
        };
        match file.write(offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _lock_owner: crate::LockOwner, reply: ReplyEmpty) {
        let Some(file) = self.open_file(fh) else {
            return reply.error(Errno::EBADF);
        };
        match file.flush() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<crate::LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let opened = self.mount.handles.forget(fh);
        if let Some(inode) = self.table.get(ino) {
            inode.unregister_open_file(fh.0);
        }
        if let OpenHandle::File(file) = opened.handle {
            if let Err(e) = file.release() {
                warn!("release failed for {ino:?}: {e}");
            }
        }
        reply.ok();
    }

    fn fsync(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        let Some(file) = self.open_file(fh) else {
            return reply.error(Errno::EBADF);
        };
        match file.fsync(datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.opendir(&ctx) {
            Ok(dir) => {
                let handle = self.mount.handles.register(OpenedFile {
                    nodeid: ino,
                    open_flags: flags.0,
                    fuse_flags: FopenFlags::empty(),
                    handle: OpenHandle::Dir(dir),
                });
                inode.register_open_file(handle.0);
                reply.opened(handle, FopenFlags::empty());
            }
            Err(e) => reply.error(e),
        }
    }

    fn readdir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, offset: u64, size: u32, reply: ReplyDirectory) {
        let entries = self.mount.handles.with(fh, |opened| match &opened.handle {
            OpenHandle::Dir(d) => d.entries(),
            OpenHandle::File(_) => Err(Errno::ENOTDIR),
        });
        match entries {
            Some(Ok(entries)) => {
                let list = dirent::build_readdir_list(&entries);
                reply.dir(&list, size as usize, offset as i64);
            }
            Some(Err(e)) => reply.error(e),
            None => reply.error(Errno::EBADF),
        }
    }

    fn readdirplus(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        reply: ReplyDirectoryPlus,
    ) {
        let ctx = ctx_of(req);
        let Some(inode) = self.table.get(ino) else {
            return reply.error(Errno::ENOENT);
        };
        let entries = self.mount.handles.with(fh, |opened| match &opened.handle {
            OpenHandle::Dir(d) => d.entries(),
            OpenHandle::File(_) => Err(Errno::ENOTDIR),
        });
        match entries {
            Some(Ok(entries)) => {
                let list = dirent::build_readdirplus_list(&self.table, &inode, &entries, &ctx);
                reply.dirplus(&list, size as usize, offset as i64);
            }
            Some(Err(e)) => reply.error(e),
            None => reply.error(Errno::EBADF),
        }
    }

    fn releasedir(&self, _req: &Request, ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        let opened = self.mount.handles.forget(fh);
        if let Some(inode) = self.table.get(ino) {
            inode.unregister_open_file(fh.0);
        }
        if let OpenHandle::Dir(dir) = opened.handle {
            if let Err(e) = dir.release() {
                warn!("releasedir failed for {ino:?}: {e}");
            }
        }
        reply.ok();
    }

    fn fsyncdir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        let result = self.mount.handles.with(fh, |opened| match &opened.handle {
            OpenHandle::Dir(d) => d.fsyncdir(datasync),
            OpenHandle::File(_) => Err(Errno::ENOTDIR),
        });
        match result {
            Some(Ok(())) => reply.ok(),
            Some(Err(e)) => reply.error(e),
            None => reply.error(Errno::EBADF),
        }
    }

    fn statfs(&self, req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.statfs(&ctx) {
            Ok(s) => reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize),
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &self,
        req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.setxattr(name, value, flags, &ctx) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&self, req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.getxattr(name, &ctx) {
            Ok(data) => {
                if size == 0 {
                    reply.xattr(Xattr::Size(data.len() as u32));
                } else if data.len() as u32 > size {
                    reply.error(Errno::ERANGE);
                } else {
                    reply.xattr(Xattr::Data(Bytes::from(data)));
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&self, req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.listxattr(&ctx) {
            Ok(data) => {
                if size == 0 {
                    reply.xattr(Xattr::Size(data.len() as u32));
                } else if data.len() as u32 > size {
                    reply.error(Errno::ERANGE);
                } else {
                    reply.xattr(Xattr::Data(Bytes::from(data)));
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&self, req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.removexattr(name, &ctx) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn access(&self, req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match inode.node.access(mask, &ctx) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let ctx = ctx_of(req);
        if self.mount.options.poll_hack && parent == INodeNo::ROOT && name.as_bytes() == POLL_HACK_NAME {
            // The entry already "exists"; nothing backs it to create or open.
            return reply.error(Errno::EEXIST);
        }
        let parent_inode = match self.get_inode(parent) {
            Ok(i) => i,
            Err(e) => return reply.error(e),
        };
        match parent_inode.node.create(name, mode, flags, &ctx) {
            Ok((looked, file, fuse_flags)) => {
                let (child, attr) = self.materialize(&parent_inode, name, looked);
                let handle = self.mount.handles.register(OpenedFile {
                    nodeid: child.nodeid,
                    open_flags: flags,
                    fuse_flags,
                    handle: OpenHandle::File(file),
                });
                child.register_open_file(handle.0);
                reply.created(&self.mount.options.entry_timeout, &attr, Generation(0), handle, fuse_flags.bits());
            }
            Err(e) => reply.error(e),
        }
    }

    fn fallocate(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, offset: i64, length: i64, mode: i32, reply: ReplyEmpty) {
        let Some(file) = self.open_file(fh) else {
            return reply.error(Errno::EBADF);
        };
        match file.fallocate(offset, length, mode) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn lseek(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, offset: i64, whence: i32, reply: ReplyLseek) {
        let Some(file) = self.open_file(fh) else {
            return reply.error(Errno::EBADF);
        };
        match file.lseek(offset, whence) {
            Ok(off) => reply.offset(off),
            Err(e) => reply.error(e),
        }
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<Connector>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::IoSlice;
    use std::os::fd::BorrowedFd;
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;

    use crate::connector::inode::FsOptions;
    use crate::connector::read_result::ReadResult;
    use crate::ll::fuse_abi::fuse_in_header;
    use crate::reply::{ReplyHandler, ReplySender};

    #[derive(Clone, Default)]
    struct RecordingSender {
        sent: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl ReplySender for RecordingSender {
        fn send(&self, data: &[IoSlice<'_>]) -> std::io::Result<()> {
            let mut v = vec![];
            for x in data {
                v.extend_from_slice(x);
            }
            *self.sent.lock().unwrap() = Some(v);
            Ok(())
        }

        #[cfg(feature = "abi-7-40")]
        fn open_backing(&self, _fd: BorrowedFd<'_>) -> std::io::Result<crate::passthrough::BackingId> {
            unreachable!()
        }
    }

    fn header(nodeid: u64, unique: u64) -> fuse_in_header {
        fuse_in_header { len: 0, opcode: 0, unique, nodeid, uid: 0, gid: 0, pid: 0, padding: 0 }
    }

    fn error_of(bytes: &[u8]) -> i32 {
        i32::from_le_bytes(bytes[4..8].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    /// Byte offset of the `fuse_open_out` (and so its `fh` field) within a
    /// `CREATE` reply: the 16-byte out header, followed by a full `fuse_entry_out`.
    fn entry_out_size() -> usize {
        16 + std::mem::size_of::<crate::ll::fuse_abi::fuse_entry_out>()
    }

    enum MemEntry {
        Dir(Mutex<HashMap<Vec<u8>, Arc<MemNode>>>),
        File(Arc<Mutex<Vec<u8>>>),
    }

    struct MemNode {
        entry: MemEntry,
    }

    impl MemNode {
        fn dir() -> Arc<MemNode> {
            Arc::new(MemNode { entry: MemEntry::Dir(Mutex::new(HashMap::new())) })
        }
    }

    fn dummy_attr(is_dir: bool, size: u64) -> FileAttr {
        FileAttr {
            ino: INodeNo(0),
            size,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: if is_dir { crate::FileType::Directory } else { crate::FileType::RegularFile },
            perm: if is_dir { 0o755 } else { 0o644 },
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    struct MemFile(Arc<Mutex<Vec<u8>>>);

    impl OpenFile for MemFile {
        fn read(&self, offset: i64, size: u32) -> crate::connector::node::NodeResult<ReadResult> {
            let data = self.0.lock().unwrap();
            let start = (offset as usize).min(data.len());
            let end = (start + size as usize).min(data.len());
            Ok(ReadResult::from_bytes(data[start..end].to_vec()))
        }

        fn write(&self, offset: i64, buf: &[u8]) -> crate::connector::node::NodeResult<u32> {
            let mut data = self.0.lock().unwrap();
            let start = offset as usize;
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len() as u32)
        }
    }

    impl FsNode for MemNode {
        fn lookup(&self, name: &OsStr, _ctx: &Context) -> crate::connector::node::NodeResult<LookupReply> {
            match &self.entry {
                MemEntry::Dir(children) => {
                    let child = children.lock().unwrap().get(name.as_bytes()).cloned().ok_or(Errno::ENOENT)?;
                    let is_dir = matches!(child.entry, MemEntry::Dir(_));
                    let size = match &child.entry {
                        MemEntry::File(data) => data.lock().unwrap().len() as u64,
                        MemEntry::Dir(_) => 0,
                    };
                    Ok(LookupReply { attr: dummy_attr(is_dir, size), node: child, is_dir })
                }
                MemEntry::File(_) => Err(Errno::ENOTDIR),
            }
        }

        fn getattr(&self, _file: Option<&dyn OpenFile>, _ctx: &Context) -> crate::connector::node::NodeResult<FileAttr> {
            match &self.entry {
                MemEntry::Dir(_) => Ok(dummy_attr(true, 0)),
                MemEntry::File(data) => Ok(dummy_attr(false, data.lock().unwrap().len() as u64)),
            }
        }

        fn create(
            &self,
            name: &OsStr,
            _mode: u32,
            _flags: i32,
            _ctx: &Context,
        ) -> crate::connector::node::NodeResult<(LookupReply, Arc<dyn OpenFile>, FopenFlags)> {
            match &self.entry {
                MemEntry::Dir(children) => {
                    let data = Arc::new(Mutex::new(Vec::new()));
                    let node = Arc::new(MemNode { entry: MemEntry::File(data.clone()) });
                    children.lock().unwrap().insert(name.as_bytes().to_vec(), node.clone());
                    let file: Arc<dyn OpenFile> = Arc::new(MemFile(data));
                    Ok((LookupReply { attr: dummy_attr(false, 0), node, is_dir: false }, file, FopenFlags::empty()))
                }
                MemEntry::File(_) => Err(Errno::ENOTDIR),
            }
        }

        fn open(&self, _flags: i32, _ctx: &Context) -> crate::connector::node::NodeResult<(Arc<dyn OpenFile>, FopenFlags)> {
            match &self.entry {
                MemEntry::File(data) => Ok((Arc::new(MemFile(data.clone())), FopenFlags::empty())),
                MemEntry::Dir(_) => Err(Errno::EISDIR),
            }
        }

        fn unlink(&self, name: &OsStr, _ctx: &Context) -> crate::connector::node::NodeResult<()> {
            match &self.entry {
                MemEntry::Dir(children) => {
                    children.lock().unwrap().remove(name.as_bytes());
                    Ok(())
                }
                MemEntry::File(_) => Err(Errno::ENOTDIR),
            }
        }

        fn rename(
            &self,
            name: &OsStr,
            newparent: &dyn FsNode,
            newname: &OsStr,
            _ctx: &Context,
        ) -> crate::connector::node::NodeResult<()> {
            let newparent = newparent.as_any().downcast_ref::<MemNode>().expect("rename across MemNode dirs only");
            match (&self.entry, &newparent.entry) {
                (MemEntry::Dir(src), MemEntry::Dir(dst)) => {
                    let node = src.lock().unwrap().remove(name.as_bytes()).ok_or(Errno::ENOENT)?;
                    dst.lock().unwrap().insert(newname.as_bytes().to_vec(), node);
                    Ok(())
                }
                _ => Err(Errno::ENOTDIR),
            }
        }
    }

    fn new_connector() -> Connector {
        Connector::new(MemNode::dir(), FsOptions::default())
    }

    /// A file created via `CREATE` and immediately `LOOKUP`ed resolves to
    /// the same `nodeid`.
    #[test]
    fn create_then_lookup_same_nodeid() {
        let connector = new_connector();
        let h = header(INodeNo::ROOT.0, 1);
        let req = Request::ref_cast(&h);

        let sender = RecordingSender::default();
        connector.create(req, INodeNo::ROOT, OsStr::new("hello.txt"), 0o644, 0, libc::O_WRONLY, ReplyHandler::new(1, sender.clone()));
        let created = sender.sent.lock().unwrap().take().unwrap();
        assert_eq!(error_of(&created), 0);
        let created_nodeid = u64_at(&created, 16);

        let sender = RecordingSender::default();
        connector.lookup(req, INodeNo::ROOT, OsStr::new("hello.txt"), ReplyHandler::new(2, sender.clone()));
        let looked = sender.sent.lock().unwrap().take().unwrap();
        assert_eq!(error_of(&looked), 0);
        assert_eq!(u64_at(&looked, 16), created_nodeid);
    }

    /// A file written then read returns the written bytes.
    #[test]
    fn write_then_read_roundtrip() {
        let connector = new_connector();
        let h = header(INodeNo::ROOT.0, 1);
        let req = Request::ref_cast(&h);

        let sender = RecordingSender::default();
        connector.create(req, INodeNo::ROOT, OsStr::new("out.txt"), 0o644, 0, libc::O_RDWR, ReplyHandler::new(1, sender.clone()));
        let created = sender.sent.lock().unwrap().take().unwrap();
        let fh = FileHandle(u64_at(&created, entry_out_size()));

        let sender = RecordingSender::default();
        connector.write(req, INodeNo(0), fh, 0, b"hello", crate::WriteFlags::empty(), OpenFlags(0), None, ReplyHandler::new(2, sender.clone()));
        let written = sender.sent.lock().unwrap().take().unwrap();
        assert_eq!(error_of(&written), 0);

        let sender = RecordingSender::default();
        connector.read(req, INodeNo(0), fh, 0, 5, ReadFlags::empty(), 0, None, ReplyHandler::new(3, sender.clone()));
        let read = sender.sent.lock().unwrap().take().unwrap();
        assert_eq!(error_of(&read), 0);
        assert_eq!(&read[16..], b"hello");
    }

    /// Renaming a file out from under an open descriptor leaves that
    /// descriptor reading the original content.
    #[test]
    fn rename_with_open_descriptor_keeps_original_content() {
        let connector = new_connector();
        let h = header(INodeNo::ROOT.0, 1);
        let req = Request::ref_cast(&h);

        // create + write "dest"
        let sender = RecordingSender::default();
        connector.create(req, INodeNo::ROOT, OsStr::new("dest"), 0o644, 0, libc::O_RDWR, ReplyHandler::new(1, sender.clone()));
        let created = sender.sent.lock().unwrap().take().unwrap();
        let dest_fh = FileHandle(u64_at(&created, entry_out_size()));
        connector.write(req, INodeNo(0), dest_fh, 0, b"original", crate::WriteFlags::empty(), OpenFlags(0), None, ReplyHandler::new(2, RecordingSender::default()));

        // unlink dest, create a new "src" with different content
        connector.unlink(req, INodeNo::ROOT, OsStr::new("dest"), ReplyHandler::new(3, RecordingSender::default()));
        let sender = RecordingSender::default();
        connector.create(req, INodeNo::ROOT, OsStr::new("src"), 0o644, 0, libc::O_RDWR, ReplyHandler::new(4, sender.clone()));
        let created_src = sender.sent.lock().unwrap().take().unwrap();
        let src_fh = FileHandle(u64_at(&created_src, entry_out_size()));
        connector.write(req, INodeNo(0), src_fh, 0, b"replacement", crate::WriteFlags::empty(), OpenFlags(0), None, ReplyHandler::new(5, RecordingSender::default()));

        // rename src -> dest
        let sender = RecordingSender::default();
        connector.rename(req, INodeNo::ROOT, OsStr::new("src"), INodeNo::ROOT, OsStr::new("dest"), RenameFlags::empty(), ReplyHandler::new(6, sender.clone()));
        assert_eq!(error_of(&sender.sent.lock().unwrap().take().unwrap()), 0);

        // the descriptor opened before the unlink/rename still reads the
        // original bytes, since it holds its own reference to the data.
        let sender = RecordingSender::default();
        connector.read(req, INodeNo(0), dest_fh, 0, 8, ReadFlags::empty(), 0, None, ReplyHandler::new(7, sender.clone()));
        let read = sender.sent.lock().unwrap().take().unwrap();
        assert_eq!(&read[16..], b"original");
    }

    /// Renaming a mountpoint itself away returns `EBUSY`.
    #[test]
    fn rename_of_mountpoint_is_busy() {
        let connector = new_connector();
        connector.mount_at(INodeNo::ROOT, OsStr::new("mnt"), MemNode::dir(), FsOptions::default()).unwrap();

        let h = header(INodeNo::ROOT.0, 1);
        let req = Request::ref_cast(&h);

        let sender = RecordingSender::default();
        connector.rename(req, INodeNo::ROOT, OsStr::new("mnt"), INodeNo::ROOT, OsStr::new("other"), RenameFlags::empty(), ReplyHandler::new(1, sender.clone()));
        let reply = sender.sent.lock().unwrap().take().unwrap();
        assert_eq!(error_of(&reply), -libc::EBUSY);
    }

    /// Renaming some other entry *onto* a mountpoint's name returns `EBUSY`
    /// rather than silently detaching the submount.
    #[test]
    fn rename_onto_mountpoint_is_busy() {
        let connector = new_connector();
        connector.mount_at(INodeNo::ROOT, OsStr::new("mnt"), MemNode::dir(), FsOptions::default()).unwrap();

        let h = header(INodeNo::ROOT.0, 1);
        let req = Request::ref_cast(&h);

        let sender = RecordingSender::default();
        connector.create(req, INodeNo::ROOT, OsStr::new("src"), 0o644, 0, libc::O_WRONLY, ReplyHandler::new(1, sender.clone()));
        sender.sent.lock().unwrap().take();

        let sender = RecordingSender::default();
        connector.rename(req, INodeNo::ROOT, OsStr::new("src"), INodeNo::ROOT, OsStr::new("mnt"), RenameFlags::empty(), ReplyHandler::new(2, sender.clone()));
        let reply = sender.sent.lock().unwrap().take().unwrap();
        assert_eq!(error_of(&reply), -libc::EBUSY);
    }

    /// A mount with an open file beneath it cannot be unmounted.
    #[test]
    fn unmount_with_open_file_is_busy() {
        let connector = new_connector();
        let h = header(INodeNo::ROOT.0, 1);
        let req = Request::ref_cast(&h);

        let sender = RecordingSender::default();
        connector.create(req, INodeNo::ROOT, OsStr::new("f"), 0o644, 0, libc::O_WRONLY, ReplyHandler::new(1, sender.clone()));
        sender.sent.lock().unwrap().take();

        assert_eq!(connector.unmount(INodeNo::ROOT), Err(Errno::EBUSY));
    }
}
