//! The node-tree API: what the [`Connector`](super::connector::Connector)
//! calls into once it has translated a wire-level, inode-addressed request.
//!
//! Two layered abstractions, both pluggable: the rich, per-inode [`FsNode`]
//! capability set, and the simpler path-keyed [`FileSystem`] set that
//! [`PathNodeFs`](super::pathfs::PathNodeFs) adapts into `FsNode` calls.
//! Every optional operation defaults to `ENOSYS` so partial implementations
//! compose cleanly.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use log::warn;

use crate::ll::Errno;
use crate::ll::flags::fopen_flags::FopenFlags;
use crate::{AccessFlags, FileAttr, INodeNo, TimeOrNow};

use super::read_result::ReadResult;

/// Result type for node-tree operations.
pub type NodeResult<T> = Result<T, Errno>;

/// The identity of the caller making a request: uid, gid and pid, as reported
/// by the kernel on the wire request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    /// Caller's user id.
    pub uid: u32,
    /// Caller's group id.
    pub gid: u32,
    /// Caller's process id.
    pub pid: u32,
}

/// Aggregate statistics for `STATFS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// What a namespace-producing operation (`LOOKUP`, `MKNOD`, `MKDIR`,
/// `SYMLINK`, `LINK`, the node half of `CREATE`) hands back to the connector:
/// the freshly resolved/minted node plus its attributes.
pub struct LookupReply {
    /// Attributes of the resolved/created node.
    pub attr: FileAttr,
    /// The node capability set for this entry.
    pub node: Arc<dyn FsNode>,
    /// Whether this entry is a directory.
    pub is_dir: bool,
}

/// One entry produced by an open directory stream.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: INodeNo,
    pub kind: crate::FileType,
}

/// The rich, per-inode capability set a filesystem node implements.
///
/// Every method defaults to `ENOSYS` (or a no-op, for the bookkeeping hooks),
/// so a filesystem only needs to implement the operations it actually supports.
#[allow(unused_variables, clippy::too_many_arguments)]
pub trait FsNode: Send + Sync + 'static {
    /// Gives back `self` as `dyn Any`, so adapters that need to recover their
    /// own concrete type from an `Arc<dyn FsNode>` (to relink a back-pointer
    /// on rename, say) can `downcast_ref`. The default is enough for any
    /// implementor; there's no need to override it.
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    /// May this inode be evicted from its parent's children list once its
    /// lookup count reaches zero? Default: yes.
    fn deletable(&self) -> bool {
        true
    }

    /// Informational callback fired when this node's lookup count reaches zero.
    fn on_forget(&self) {}

    /// Called once, right after the inode table mints the `nodeid` for this
    /// node, so a node that wants to know its own id can record it.
    fn bind_inode(&self, nodeid: INodeNo) {
        let _ = nodeid;
    }

    /// Called after a child is linked into this (directory) node's place in
    /// the inode table, so a path-keyed adapter can maintain a back-link.
    /// No-op by default.
    fn add_child(&self, name: &[u8], child: &Arc<dyn FsNode>) {
        let _ = (name, child);
    }

    /// Called after `child` is unlinked from this (directory) node's place in
    /// the inode table, so a path-keyed adapter can clear the child's
    /// back-link. No-op by default.
    fn rm_child(&self, name: &[u8], child: &Arc<dyn FsNode>) {
        let _ = (name, child);
    }

    /// Resolve `name` as a child of this (directory) node.
    fn lookup(&self, name: &OsStr, ctx: &Context) -> NodeResult<LookupReply> {
        warn!("[Not Implemented] lookup(name: {name:?})");
        Err(Errno::ENOENT)
    }

    /// Fetch attributes. `file` is `Some` when the kernel supplied an open
    /// file handle; implementations may prefer data cached on the open file.
    fn getattr(&self, file: Option<&dyn OpenFile>, ctx: &Context) -> NodeResult<FileAttr> {
        warn!("[Not Implemented] getattr()");
        Err(Errno::ENOSYS)
    }

    fn chmod(&self, file: Option<&dyn OpenFile>, mode: u32, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] chmod(mode: {mode:#o})");
        Err(Errno::ENOSYS)
    }

    fn chown(
        &self,
        file: Option<&dyn OpenFile>,
        uid: Option<u32>,
        gid: Option<u32>,
        ctx: &Context,
    ) -> NodeResult<()> {
        warn!("[Not Implemented] chown(uid: {uid:?}, gid: {gid:?})");
        Err(Errno::ENOSYS)
    }

    fn truncate(&self, file: Option<&dyn OpenFile>, size: u64, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] truncate(size: {size})");
        Err(Errno::ENOSYS)
    }

    fn utimens(
        &self,
        file: Option<&dyn OpenFile>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctx: &Context,
    ) -> NodeResult<()> {
        warn!("[Not Implemented] utimens(atime: {atime:?}, mtime: {mtime:?})");
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, ctx: &Context) -> NodeResult<Vec<u8>> {
        warn!("[Not Implemented] readlink()");
        Err(Errno::EINVAL)
    }

    fn access(&self, mask: AccessFlags, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] access(mask: {mask:?})");
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, ctx: &Context) -> NodeResult<StatFs> {
        Ok(StatFs::default())
    }

    fn mknod(
        &self,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        ctx: &Context,
    ) -> NodeResult<LookupReply> {
        warn!("[Not Implemented] mknod(name: {name:?}, mode: {mode:#o}, rdev: {rdev})");
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, name: &OsStr, mode: u32, ctx: &Context) -> NodeResult<LookupReply> {
        warn!("[Not Implemented] mkdir(name: {name:?}, mode: {mode:#o})");
        Err(Errno::ENOSYS)
    }

    fn symlink(
        &self,
        name: &OsStr,
        target: &Path,
        ctx: &Context,
    ) -> NodeResult<LookupReply> {
        warn!("[Not Implemented] symlink(name: {name:?}, target: {target:?})");
        Err(Errno::EPERM)
    }

    fn link(
        &self,
        existing: &Arc<dyn FsNode>,
        newname: &OsStr,
        ctx: &Context,
    ) -> NodeResult<LookupReply> {
        let _ = existing;
        warn!("[Not Implemented] link(newname: {newname:?})");
        Err(Errno::EPERM)
    }

    fn unlink(&self, name: &OsStr, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] unlink(name: {name:?})");
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, name: &OsStr, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] rmdir(name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Rename `name` (a child of this node) to `newname` under `newparent`.
    fn rename(
        &self,
        name: &OsStr,
        newparent: &dyn FsNode,
        newname: &OsStr,
        ctx: &Context,
    ) -> NodeResult<()> {
        let _ = newparent;
        warn!("[Not Implemented] rename(name: {name:?}, newname: {newname:?})");
        Err(Errno::ENOSYS)
    }

    /// Atomically open and create a new file.
    fn create(
        &self,
        name: &OsStr,
        mode: u32,
        flags: i32,
        ctx: &Context,
    ) -> NodeResult<(LookupReply, Arc<dyn OpenFile>, FopenFlags)> {
        warn!("[Not Implemented] create(name: {name:?}, mode: {mode:#o}, flags: {flags:#x})");
        Err(Errno::ENOSYS)
    }

    fn open(&self, flags: i32, ctx: &Context) -> NodeResult<(Arc<dyn OpenFile>, FopenFlags)> {
        warn!("[Not Implemented] open(flags: {flags:#x})");
        Err(Errno::ENOSYS)
    }

    fn opendir(&self, ctx: &Context) -> NodeResult<Arc<dyn OpenDir>> {
        warn!("[Not Implemented] opendir()");
        Err(Errno::ENOSYS)
    }

    fn getxattr(&self, name: &OsStr, ctx: &Context) -> NodeResult<Vec<u8>> {
        warn!("[Not Implemented] getxattr(name: {name:?})");
        Err(Errno::ENODATA)
    }

    fn setxattr(&self, name: &OsStr, value: &[u8], flags: i32, ctx: &Context) -> NodeResult<()> {
        let _ = value;
        warn!("[Not Implemented] setxattr(name: {name:?}, flags: {flags:#x})");
        Err(Errno::ENOSYS)
    }

    fn listxattr(&self, ctx: &Context) -> NodeResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn removexattr(&self, name: &OsStr, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] removexattr(name: {name:?})");
        Err(Errno::ENODATA)
    }
}

/// An open regular file.
#[allow(unused_variables)]
pub trait OpenFile: Send + Sync {
    fn read(&self, offset: i64, size: u32) -> NodeResult<ReadResult> {
        warn!("[Not Implemented] read(offset: {offset}, size: {size})");
        Err(Errno::ENOSYS)
    }

    fn write(&self, offset: i64, data: &[u8]) -> NodeResult<u32> {
        warn!("[Not Implemented] write(offset: {offset}, size: {})", data.len());
        Err(Errno::ENOSYS)
    }

    fn flush(&self) -> NodeResult<()> {
        Ok(())
    }

    /// Called exactly once, when the kernel has no more references to this open file.
    fn release(&self) -> NodeResult<()> {
        Ok(())
    }

    fn fsync(&self, datasync: bool) -> NodeResult<()> {
        warn!("[Not Implemented] fsync(datasync: {datasync})");
        Err(Errno::ENOSYS)
    }

    /// If this returns `Some`, the connector prefers it over the node's own `getattr`.
    fn getattr(&self) -> Option<NodeResult<FileAttr>> {
        None
    }

    fn fallocate(&self, offset: i64, length: i64, mode: i32) -> NodeResult<()> {
        warn!("[Not Implemented] fallocate(offset: {offset}, length: {length}, mode: {mode:#x})");
        Err(Errno::ENOSYS)
    }

    fn lseek(&self, offset: i64, whence: i32) -> NodeResult<i64> {
        warn!("[Not Implemented] lseek(offset: {offset}, whence: {whence})");
        Err(Errno::ENOSYS)
    }
}

/// An open directory stream.
#[allow(unused_variables)]
pub trait OpenDir: Send + Sync {
    /// All entries currently in this directory, in stable order. The
    /// connector is responsible for paginating these into bounded `READDIR`
    /// replies via [`DirEntryList`](super::dirent::DirEntryList).
    fn entries(&self) -> NodeResult<Vec<DirEntry>>;

    /// Called exactly once, when the kernel releases this directory stream.
    fn release(&self) -> NodeResult<()> {
        Ok(())
    }

    /// `FsyncDir` has no well-defined semantics in the source this is modeled
    /// on; it always returns success.
    fn fsyncdir(&self, datasync: bool) -> NodeResult<()> {
        let _ = datasync;
        Ok(())
    }
}

/// The simpler, path-keyed capability set, adapted into [`FsNode`] calls by
/// [`PathNodeFs`](super::pathfs::PathNodeFs).
#[allow(unused_variables, clippy::too_many_arguments)]
pub trait FileSystem: Send + Sync {
    fn getattr(&self, path: &Path, ctx: &Context) -> NodeResult<FileAttr> {
        warn!("[Not Implemented] getattr(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    fn chmod(&self, path: &Path, mode: u32, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] chmod(path: {path:?}, mode: {mode:#o})");
        Err(Errno::ENOSYS)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] chown(path: {path:?}, uid: {uid:?}, gid: {gid:?})");
        Err(Errno::ENOSYS)
    }

    fn truncate(&self, path: &Path, size: u64, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] truncate(path: {path:?}, size: {size})");
        Err(Errno::ENOSYS)
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctx: &Context,
    ) -> NodeResult<()> {
        warn!("[Not Implemented] utimens(path: {path:?}, atime: {atime:?}, mtime: {mtime:?})");
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, path: &Path, ctx: &Context) -> NodeResult<Vec<u8>> {
        warn!("[Not Implemented] readlink(path: {path:?})");
        Err(Errno::EINVAL)
    }

    fn access(&self, path: &Path, mask: AccessFlags, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] access(path: {path:?}, mask: {mask:?})");
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, path: &Path, ctx: &Context) -> NodeResult<StatFs> {
        Ok(StatFs::default())
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u32, ctx: &Context) -> NodeResult<FileAttr> {
        warn!("[Not Implemented] mknod(path: {path:?}, mode: {mode:#o}, rdev: {rdev})");
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, path: &Path, mode: u32, ctx: &Context) -> NodeResult<FileAttr> {
        warn!("[Not Implemented] mkdir(path: {path:?}, mode: {mode:#o})");
        Err(Errno::ENOSYS)
    }

    fn symlink(&self, path: &Path, target: &Path, ctx: &Context) -> NodeResult<FileAttr> {
        warn!("[Not Implemented] symlink(path: {path:?}, target: {target:?})");
        Err(Errno::EPERM)
    }

    fn link(&self, path: &Path, target: &Path, ctx: &Context) -> NodeResult<FileAttr> {
        warn!("[Not Implemented] link(path: {path:?}, target: {target:?})");
        Err(Errno::EPERM)
    }

    fn unlink(&self, path: &Path, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] unlink(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, path: &Path, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] rmdir(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    fn rename(&self, from: &Path, to: &Path, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] rename(from: {from:?}, to: {to:?})");
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        path: &Path,
        mode: u32,
        flags: i32,
        ctx: &Context,
    ) -> NodeResult<(FileAttr, Arc<dyn OpenFile>, FopenFlags)> {
        warn!("[Not Implemented] create(path: {path:?}, mode: {mode:#o}, flags: {flags:#x})");
        Err(Errno::ENOSYS)
    }

    fn open(&self, path: &Path, flags: i32, ctx: &Context) -> NodeResult<(Arc<dyn OpenFile>, FopenFlags)> {
        warn!("[Not Implemented] open(path: {path:?}, flags: {flags:#x})");
        Err(Errno::ENOSYS)
    }

    fn opendir(&self, path: &Path, ctx: &Context) -> NodeResult<Vec<(Vec<u8>, crate::FileType)>> {
        warn!("[Not Implemented] opendir(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    fn getxattr(&self, path: &Path, name: &OsStr, ctx: &Context) -> NodeResult<Vec<u8>> {
        warn!("[Not Implemented] getxattr(path: {path:?}, name: {name:?})");
        Err(Errno::ENODATA)
    }

    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32, ctx: &Context) -> NodeResult<()> {
        let _ = value;
        warn!("[Not Implemented] setxattr(path: {path:?}, name: {name:?}, flags: {flags:#x})");
        Err(Errno::ENOSYS)
    }

    fn listxattr(&self, path: &Path, ctx: &Context) -> NodeResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn removexattr(&self, path: &Path, name: &OsStr, ctx: &Context) -> NodeResult<()> {
        warn!("[Not Implemented] removexattr(path: {path:?}, name: {name:?})");
        Err(Errno::ENODATA)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A node implementing nothing but the defaults: every optional
    /// operation is `ENOSYS`. Used as filler where tests only care about the
    /// inode table's own bookkeeping.
    pub(crate) struct NullNode;
    impl FsNode for NullNode {}
}
