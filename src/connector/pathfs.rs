//! Adapts the simpler, path-keyed [`FileSystem`] capability set into the
//! per-inode [`FsNode`] calls the connector makes, for filesystems whose
//! natural API is path-based (a loopback filesystem over a host directory,
//! for example).
//!
//! Each [`PathNode`] stores a `(parent, name)` back-link so it can
//! reconstruct its absolute path on demand. The back-link is a non-owning
//! weak reference: the parent owns the child through the inode table's
//! children map; the child only remembers how to find its way back up.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;

use crate::ll::Errno;
use crate::{AccessFlags, FileAttr, FopenFlags, INodeNo, TimeOrNow};

use super::node::{Context, DirEntry, FileSystem, FsNode, LookupReply, NodeResult, OpenDir, OpenFile, StatFs};

struct Link {
    parent: Option<Weak<PathNode>>,
    name: Vec<u8>,
    /// Set once this node has been unlinked; kept alive only by open handles
    /// or a lingering lookup count. The debug name becomes `name.deleted`.
    deleted: bool,
}

/// A node that adapts [`FileSystem`] (path-keyed) calls to the per-inode
/// [`FsNode`] interface, by maintaining a back-link to its parent and
/// recomputing its absolute path on demand under the caller's tree lock.
pub struct PathNode {
    owner: Arc<PathNodeFs>,
    self_weak: Weak<PathNode>,
    link: RwLock<Link>,
}

impl PathNode {
    fn new(owner: Arc<PathNodeFs>, parent: Option<Weak<PathNode>>, name: Vec<u8>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| PathNode {
            owner,
            self_weak: self_weak.clone(),
            link: RwLock::new(Link { parent, name, deleted: false }),
        })
    }

    /// Reconstructs this node's absolute path by walking `(parent, name)`
    /// links up to the root.
    pub fn path(&self) -> PathBuf {
        let mut components: Vec<Vec<u8>> = Vec::new();
        {
            let link = self.link.read().unwrap();
            components.push(link.name.clone());
        }
        let mut parent = self.link.read().unwrap().parent.clone();
        while let Some(weak) = parent {
            let Some(node) = weak.upgrade() else { break };
            let link = node.link.read().unwrap();
            components.push(link.name.clone());
            parent = link.parent.clone();
        }
        components.reverse();
        let mut path = PathBuf::from("/");
        for c in components {
            if !c.is_empty() {
                path.push(OsStr::from_bytes(&c));
            }
        }
        path
    }

    fn child(&self, name: &OsStr) -> Arc<PathNode> {
        PathNode::new(self.owner.clone(), Some(self.self_weak.clone()), name.as_bytes().to_vec())
    }

    /// Downcasts a generic node reference, for adapting cross-node calls
    /// (`rename`'s `newparent`, `link`'s `existing`) back to a `PathNode`.
    fn downcast(node: &dyn FsNode) -> NodeResult<&PathNode> {
        node.as_any().downcast_ref::<PathNode>().ok_or(Errno::EXDEV)
    }
}

/// Hardlink tracking by client inode number: `GetAttr` results that share an
/// inode number reuse the same `PathNode`, so that a hardlinked file looked
/// up under two different paths still resolves to one `nodeid`.
pub struct PathNodeFs {
    fs: Arc<dyn FileSystem>,
    client_inodes: bool,
    by_client_inode: DashMap<u64, Weak<PathNode>>,
}

impl PathNodeFs {
    /// Wraps `fs` for use as a node-tree root. `client_inodes` enables
    /// hardlink tracking by the filesystem-reported inode number.
    pub fn new(fs: Arc<dyn FileSystem>, client_inodes: bool) -> Arc<Self> {
        Arc::new(PathNodeFs { fs, client_inodes, by_client_inode: DashMap::new() })
    }

    /// Builds the root node for this adapter.
    pub fn root(self: &Arc<Self>) -> Arc<PathNode> {
        PathNode::new(self.clone(), None, Vec::new())
    }

    fn resolve(&self, parent: &PathNode, name: &OsStr, attr: &FileAttr) -> Arc<PathNode> {
        if self.client_inodes {
            if let Some(existing) = self.by_client_inode.get(&attr.ino.0).and_then(|w| w.upgrade()) {
                return existing;
            }
        }
        let node = parent.child(name);
        if self.client_inodes {
            self.by_client_inode.insert(attr.ino.0, Arc::downgrade(&node));
        }
        node
    }
}

fn lookup_reply(attr: FileAttr, node: Arc<PathNode>) -> LookupReply {
    let is_dir = matches!(attr.kind, crate::FileType::Directory);
    LookupReply { attr, node, is_dir }
}

impl FsNode for PathNode {
    fn on_forget(&self) {
        // The hardlink table holds only a Weak, so a forgotten node (deleted
        // or not) just drops out of it on its own; nothing to do here.
    }

    fn add_child(&self, name: &[u8], child: &Arc<dyn FsNode>) {
        if let Some(path_child) = child.as_any().downcast_ref::<PathNode>() {
            let mut link = path_child.link.write().unwrap();
            link.parent = Some(self.self_weak.clone());
            link.name = name.to_vec();
            link.deleted = false;
        }
    }

    fn rm_child(&self, _name: &[u8], child: &Arc<dyn FsNode>) {
        if let Some(path_child) = child.as_any().downcast_ref::<PathNode>() {
            let mut link = path_child.link.write().unwrap();
            link.parent = None;
            link.deleted = true;
            let mut debug_name = link.name.clone();
            debug_name.extend_from_slice(b".deleted");
            link.name = debug_name;
        }
    }

    fn getattr(&self, _file: Option<&dyn OpenFile>, ctx: &Context) -> NodeResult<FileAttr> {
        self.owner.fs.getattr(&self.path(), ctx)
    }

    fn chmod(&self, _file: Option<&dyn OpenFile>, mode: u32, ctx: &Context) -> NodeResult<()> {
        self.owner.fs.chmod(&self.path(), mode, ctx)
    }

    fn chown(
        &self,
        _file: Option<&dyn OpenFile>,
        uid: Option<u32>,
        gid: Option<u32>,
        ctx: &Context,
    ) -> NodeResult<()> {
        self.owner.fs.chown(&self.path(), uid, gid, ctx)
    }

    fn truncate(&self, _file: Option<&dyn OpenFile>, size: u64, ctx: &Context) -> NodeResult<()> {
        self.owner.fs.truncate(&self.path(), size, ctx)
    }

    fn utimens(
        &self,
        _file: Option<&dyn OpenFile>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctx: &Context,
    ) -> NodeResult<()> {
        self.owner.fs.utimens(&self.path(), atime, mtime, ctx)
    }

    fn readlink(&self, ctx: &Context) -> NodeResult<Vec<u8>> {
        self.owner.fs.readlink(&self.path(), ctx)
    }

    fn access(&self, mask: AccessFlags, ctx: &Context) -> NodeResult<()> {
        self.owner.fs.access(&self.path(), mask, ctx)
    }

    fn statfs(&self, ctx: &Context) -> NodeResult<StatFs> {
        self.owner.fs.statfs(&self.path(), ctx)
    }

    fn lookup(&self, name: &OsStr, ctx: &Context) -> NodeResult<LookupReply> {
        let path = self.path().join(name);
        let attr = self.owner.fs.getattr(&path, ctx)?;
        let node = self.owner.resolve(self, name, &attr);
        Ok(lookup_reply(attr, node))
    }

    fn mknod(&self, name: &OsStr, mode: u32, rdev: u32, ctx: &Context) -> NodeResult<LookupReply> {
        let path = self.path().join(name);
        let attr = self.owner.fs.mknod(&path, mode, rdev, ctx)?;
        Ok(lookup_reply(attr, self.child(name)))
    }

    fn mkdir(&self, name: &OsStr, mode: u32, ctx: &Context) -> NodeResult<LookupReply> {
        let path = self.path().join(name);
        let attr = self.owner.fs.mkdir(&path, mode, ctx)?;
        Ok(lookup_reply(attr, self.child(name)))
    }

    fn symlink(&self, name: &OsStr, target: &Path, ctx: &Context) -> NodeResult<LookupReply> {
        let path = self.path().join(name);
        let attr = self.owner.fs.symlink(&path, target, ctx)?;
        Ok(lookup_reply(attr, self.child(name)))
    }

    fn link(&self, existing: &Arc<dyn FsNode>, newname: &OsStr, ctx: &Context) -> NodeResult<LookupReply> {
        let existing_path = PathNode::downcast(existing.as_ref())?.path();
        let path = self.path().join(newname);
        let attr = self.owner.fs.link(&existing_path, &path, ctx)?;
        Ok(lookup_reply(attr, self.child(newname)))
    }

    fn unlink(&self, name: &OsStr, ctx: &Context) -> NodeResult<()> {
        let path = self.path().join(name);
        self.owner.fs.unlink(&path, ctx)
    }

    fn rmdir(&self, name: &OsStr, ctx: &Context) -> NodeResult<()> {
        let path = self.path().join(name);
        self.owner.fs.rmdir(&path, ctx)
    }

    fn rename(&self, name: &OsStr, newparent: &dyn FsNode, newname: &OsStr, ctx: &Context) -> NodeResult<()> {
        let from = self.path().join(name);
        let new_dir = PathNode::downcast(newparent)?;
        let to = new_dir.path().join(newname);
        self.owner.fs.rename(&from, &to, ctx)
        // The connector relinks the moved child's back-link via `add_child`
        // on `newparent` once this returns; `PathNode` itself has no handle
        // on the child to do that here (it only knows its old name).
    }

    fn create(
        &self,
        name: &OsStr,
        mode: u32,
        flags: i32,
        ctx: &Context,
    ) -> NodeResult<(LookupReply, Arc<dyn OpenFile>, FopenFlags)> {
        let path = self.path().join(name);
        let (attr, file, fuse_flags) = self.owner.fs.create(&path, mode, flags, ctx)?;
        Ok((lookup_reply(attr, self.child(name)), file, fuse_flags))
    }

    fn open(&self, flags: i32, ctx: &Context) -> NodeResult<(Arc<dyn OpenFile>, FopenFlags)> {
        self.owner.fs.open(&self.path(), flags, ctx)
    }

    fn opendir(&self, ctx: &Context) -> NodeResult<Arc<dyn OpenDir>> {
        let entries = self.owner.fs.opendir(&self.path(), ctx)?;
        Ok(Arc::new(PathOpenDir { entries }))
    }

    fn getxattr(&self, name: &OsStr, ctx: &Context) -> NodeResult<Vec<u8>> {
        self.owner.fs.getxattr(&self.path(), name, ctx)
    }

    fn setxattr(&self, name: &OsStr, value: &[u8], flags: i32, ctx: &Context) -> NodeResult<()> {
        self.owner.fs.setxattr(&self.path(), name, value, flags, ctx)
    }

    fn listxattr(&self, ctx: &Context) -> NodeResult<Vec<u8>> {
        self.owner.fs.listxattr(&self.path(), ctx)
    }

    fn removexattr(&self, name: &OsStr, ctx: &Context) -> NodeResult<()> {
        self.owner.fs.removexattr(&self.path(), name, ctx)
    }
}

struct PathOpenDir {
    entries: Vec<(Vec<u8>, crate::FileType)>,
}

impl OpenDir for PathOpenDir {
    fn entries(&self) -> NodeResult<Vec<DirEntry>> {
        Ok(self
            .entries
            .iter()
            .map(|(name, kind)| DirEntry { name: name.clone(), ino: INodeNo(0), kind: *kind })
            .collect())
    }
}

#[allow(unused)]
fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<PathNode>();
    assert::<PathNodeFs>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MemFs {
        files: Mutex<std::collections::HashMap<PathBuf, FileAttr>>,
    }

    fn dummy_attr(ino: u64, kind: crate::FileType) -> FileAttr {
        use std::time::SystemTime;
        FileAttr {
            ino: INodeNo(ino),
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: 0o755,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    impl FileSystem for MemFs {
        fn getattr(&self, path: &Path, _ctx: &Context) -> NodeResult<FileAttr> {
            self.files.lock().unwrap().get(path).copied().ok_or(Errno::ENOENT)
        }

        fn mkdir(&self, path: &Path, _mode: u32, _ctx: &Context) -> NodeResult<FileAttr> {
            let attr = dummy_attr(path.as_os_str().len() as u64 + 10, crate::FileType::Directory);
            self.files.lock().unwrap().insert(path.to_path_buf(), attr);
            Ok(attr)
        }

        fn rename(&self, from: &Path, to: &Path, _ctx: &Context) -> NodeResult<()> {
            let mut files = self.files.lock().unwrap();
            let attr = files.remove(from).ok_or(Errno::ENOENT)?;
            files.insert(to.to_path_buf(), attr);
            Ok(())
        }
    }

    fn ctx() -> Context {
        Context { uid: 0, gid: 0, pid: 1 }
    }

    #[test]
    fn path_reconstructs_through_nested_mkdir() {
        let fs = Arc::new(MemFs { files: Mutex::new(std::collections::HashMap::new()) });
        let adapter = PathNodeFs::new(fs, false);
        let root = adapter.root();
        let a = root.mkdir(OsStr::new("a"), 0o755, &ctx()).unwrap();
        let b = a.node.mkdir(OsStr::new("b"), 0o755, &ctx()).unwrap();
        let b_path_node = b.node.as_any().downcast_ref::<PathNode>().unwrap();
        assert_eq!(b_path_node.path(), PathBuf::from("/a/b"));
    }

    #[test]
    fn rename_updates_back_link_via_add_child() {
        let fs = Arc::new(MemFs { files: Mutex::new(std::collections::HashMap::new()) });
        let adapter = PathNodeFs::new(fs, false);
        let root = adapter.root();
        let a = root.mkdir(OsStr::new("a"), 0o755, &ctx()).unwrap();
        let b_dir = root.mkdir(OsStr::new("b"), 0o755, &ctx()).unwrap();
        let a_node = a.node.as_any().downcast_ref::<PathNode>().unwrap();
        let moved = a.node.mkdir(OsStr::new("child"), 0o755, &ctx()).unwrap();
        let moved_node = moved.node.as_any().downcast_ref::<PathNode>().unwrap();
        assert_eq!(moved_node.path(), PathBuf::from("/a/child"));

        a_node.rename(OsStr::new("child"), b_dir.node.as_ref(), OsStr::new("child"), &ctx()).unwrap();
        // Simulates the connector's post-rename relink, which it performs
        // using the child it already resolved before calling `rename`.
        b_dir.node.add_child(b"child", &moved.node);
        assert_eq!(moved_node.path(), PathBuf::from("/b/child"));
    }
}
