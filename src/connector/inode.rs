//! The server's mirror of the kernel's inode cache: one entry per `nodeid`,
//! with a lookup reference count, a children map, and a mount attachment.
//!
//! This is the core correctness contract of the node-tree layer: every
//! `LOOKUP`-class reply bumps a count, every `FORGET` drains it, and an inode
//! is only ever evicted once its count reaches zero with nothing still
//! pinning it open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::notify::Notifier;
use crate::ll::Errno;
use crate::INodeNo;

use super::handle_map::HandleMap;
use super::node::FsNode;

/// Owner (uid/gid) a mount presents for inodes that don't carry their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Owner {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Owner {
    /// The uid/gid of the current process, used as the default mount owner.
    pub fn current() -> Self {
        Owner {
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
        }
    }
}

/// Options governing one mount (or submount) attached to the node tree.
#[derive(Debug, Clone)]
pub struct FsOptions {
    /// Cache TTL for name -> inode resolutions.
    pub entry_timeout: Duration,
    /// Cache TTL for inode attributes.
    pub attr_timeout: Duration,
    /// Cache TTL for cached nonexistence (negative `LOOKUP` replies).
    pub negative_timeout: Duration,
    /// Owner override presented for inodes that don't carry their own uid/gid.
    pub owner: Owner,
    /// Force inode numbers into 31 bits, for 32-bit `stat`.
    pub portable_inodes: bool,
    /// Never evict an inode on `FORGET`; keep the whole tree resident.
    pub remember_inodes: bool,
    /// Filesystem name shown by `mount`.
    pub name: String,
    /// Track hardlinks by client inode number, reusing one node for all paths
    /// that resolve to the same underlying file.
    pub client_inodes: bool,
    /// Intercept `LOOKUP`/`CREATE`/`GETATTR` of a reserved root entry
    /// (`.go-fuse-epoll-hack`) before they reach the filesystem, so the
    /// kernel can be tricked into disabling polling for this mount. See
    /// `Connector`'s `POLL_HACK_NAME`/`POLL_HACK_INODE`.
    pub poll_hack: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        FsOptions {
            entry_timeout: Duration::from_secs(1),
            attr_timeout: Duration::from_secs(1),
            negative_timeout: Duration::from_secs(0),
            owner: Owner::current(),
            portable_inodes: false,
            remember_inodes: false,
            name: "fusenode".to_string(),
            client_inodes: false,
            poll_hack: false,
        }
    }
}

/// An opened file or directory stream, rooted at one inode.
pub struct OpenedFile {
    /// The inode this handle was opened against.
    pub nodeid: INodeNo,
    /// Open flags as seen from userspace (`O_RDONLY`, `O_APPEND`, ...).
    pub open_flags: i32,
    /// FUSE-level flags the reply carried (`direct_io`, `keep_cache`, ...).
    pub fuse_flags: crate::ll::flags::fopen_flags::FopenFlags,
    /// The polymorphic open-file or directory-stream capability.
    pub handle: OpenHandle,
}

/// Either an open file or an open directory stream.
pub enum OpenHandle {
    /// An open regular file.
    File(Arc<dyn super::node::OpenFile>),
    /// An open directory stream.
    Dir(Arc<dyn super::node::OpenDir>),
}

/// A mount (or submount) attached at some inode of an enclosing tree.
pub struct Mount {
    /// Per-mount options (timeouts, owner, ...).
    pub options: FsOptions,
    /// Handle map for files/dirs opened under this mount.
    pub handles: HandleMap<OpenedFile>,
    /// Reader-writer lock over this mount's inode tree mutations.
    pub tree_lock: RwLock<()>,
    /// Outbound notification channel to the kernel, set once a session is running.
    pub notifier: RwLock<Option<Notifier>>,
}

impl Mount {
    /// Creates a mount with the given options.
    pub fn new(options: FsOptions) -> Arc<Self> {
        Arc::new(Mount {
            options,
            handles: HandleMap::new(),
            tree_lock: RwLock::new(()),
            notifier: RwLock::new(None),
        })
    }

    /// Attaches the outbound notification channel once a session starts serving.
    pub fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.write() = Some(notifier);
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount").field("name", &self.options.name).finish()
    }
}

/// One entry in the inode table: the server's record of a `nodeid` the kernel
/// knows about.
pub struct Inode {
    /// Stable identifier for the lifetime of this entry.
    pub nodeid: INodeNo,
    /// Number of outstanding "this entry exists" promises made to the kernel.
    lookup_count: AtomicU64,
    /// Fixed at creation: whether this inode is a directory.
    pub is_dir: bool,
    /// Component name -> child nodeid. Only meaningful for directories.
    pub children: DashMap<Vec<u8>, INodeNo>,
    /// The mount this inode belongs to.
    pub mount: Arc<Mount>,
    /// A submount attached at this inode, if any.
    pub mountpoint: RwLock<Option<Arc<Mount>>>,
    /// Whether this subtree has been detached by `Unmount`; once set, every
    /// operation against inodes under it should see `ENOENT`.
    pub unmounted: std::sync::atomic::AtomicBool,
    /// Handles of files/directories currently open against this inode.
    open_files: DashMap<u64, ()>,
    /// The user-supplied node capability set.
    pub node: Arc<dyn FsNode>,
    /// True for the top-level root and for the root of any submount: these
    /// are never evicted by `FORGET` bringing their lookup count to zero,
    /// since the mount attachment itself keeps them alive independent of the
    /// kernel's cache.
    pub is_mount_root: bool,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("nodeid", &self.nodeid)
            .field("lookup_count", &self.lookup_count.load(Ordering::Relaxed))
            .field("is_dir", &self.is_dir)
            .finish()
    }
}

impl Inode {
    /// Current lookup count.
    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::Acquire)
    }

    /// True if no open files are registered against this specific inode.
    pub fn has_open_files(&self) -> bool {
        !self.open_files.is_empty()
    }

    pub(super) fn register_open_file(&self, handle: u64) {
        self.open_files.insert(handle, ());
    }

    pub(super) fn unregister_open_file(&self, handle: u64) {
        self.open_files.remove(&handle);
    }

    /// True if this inode (or a submount attached below it) should be
    /// treated as gone because its mount was unmounted.
    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }
}

/// The server's mirror of the kernel's inode cache.
pub struct InodeTable {
    nodes: DashMap<u64, Arc<Inode>>,
    next_id: AtomicU64,
    root: Arc<Inode>,
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTable").field("size", &self.nodes.len()).finish()
    }
}

impl InodeTable {
    /// Creates a table with a fresh root inode, attached to `mount`, backed
    /// by `root_node`.
    pub fn new(mount: Arc<Mount>, root_node: Arc<dyn FsNode>) -> Self {
        let root = Arc::new(Inode {
            nodeid: INodeNo::ROOT,
            lookup_count: AtomicU64::new(1),
            is_dir: true,
            children: DashMap::new(),
            mount,
            mountpoint: RwLock::new(None),
            unmounted: std::sync::atomic::AtomicBool::new(false),
            open_files: DashMap::new(),
            node: root_node,
            is_mount_root: true,
        });
        let nodes = DashMap::new();
        nodes.insert(INodeNo::ROOT.0, root.clone());
        InodeTable {
            nodes,
            next_id: AtomicU64::new(2),
            root,
        }
    }

    /// The mount's root inode.
    pub fn root(&self) -> Arc<Inode> {
        self.root.clone()
    }

    /// Looks up a live inode by nodeid.
    pub fn get(&self, nodeid: INodeNo) -> Option<Arc<Inode>> {
        self.nodes.get(&nodeid.0).map(|e| e.clone())
    }

    /// Resolves a child name within `parent`, if it currently resolves to a live inode.
    pub fn child(&self, parent: &Inode, name: &[u8]) -> Option<Arc<Inode>> {
        let child_id = *parent.children.get(name)?;
        self.get(child_id)
    }

    /// Called before every lookup-producing reply (`LOOKUP`, `CREATE`,
    /// `MKNOD`, `MKDIR`, `SYMLINK`, `LINK`). If `parent.children[name]`
    /// already exists, bumps its lookup count; otherwise mints a fresh inode
    /// with count 1 and links it in.
    pub fn lookup_update(
        &self,
        parent: &Arc<Inode>,
        name: &[u8],
        is_dir: bool,
        node: Arc<dyn FsNode>,
    ) -> Arc<Inode> {
        let _guard = parent.mount.tree_lock.write();
        if let Some(child_id) = parent.children.get(name).map(|e| *e) {
            if let Some(existing) = self.get(child_id) {
                existing.lookup_count.fetch_add(1, Ordering::AcqRel);
                return existing;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let nodeid = INodeNo(id);
        let inode = Arc::new(Inode {
            nodeid,
            lookup_count: AtomicU64::new(1),
            is_dir,
            children: DashMap::new(),
            mount: parent.mount.clone(),
            mountpoint: RwLock::new(None),
            unmounted: std::sync::atomic::AtomicBool::new(false),
            open_files: DashMap::new(),
            node,
            is_mount_root: false,
        });
        self.nodes.insert(id, inode.clone());
        parent.children.insert(name.to_vec(), nodeid);
        inode
    }

    /// Bumps an already-known inode's lookup count, for a `LOOKUP`-class
    /// reply that resolved to a submount root rather than a fresh node-tree
    /// lookup (see `Connector::lookup`'s submount short-circuit).
    pub fn bump_lookup(&self, inode: &Arc<Inode>) {
        inode.lookup_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the target's lookup count by `n`, clamped at zero, and
    /// detaches it from the table if it is now evictable.
    ///
    /// "Remember" mode (`FsOptions::remember_inodes`) suppresses eviction.
    pub fn forget_update(&self, nodeid: INodeNo, n: u64) {
        if nodeid == INodeNo::ROOT {
            // The root is never forgotten; a well-behaved kernel never asks,
            // but a misbehaving one shouldn't be able to corrupt the count.
            return;
        }
        let Some(inode) = self.get(nodeid) else {
            return;
        };
        let previous = inode.lookup_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some(cur.saturating_sub(n))
        });
        let _ = previous;
        if inode.lookup_count() == 0 {
            self.maybe_evict(&inode);
        }
    }

    fn maybe_evict(&self, inode: &Arc<Inode>) {
        if inode.is_mount_root {
            return;
        }
        if inode.mount.options.remember_inodes {
            return;
        }
        if inode.lookup_count() != 0 {
            return;
        }
        if inode.has_open_files() {
            return;
        }
        if inode.mountpoint.read().is_some() {
            return;
        }
        if inode.is_dir && inode.children.iter().any(|e| {
            self.get(*e.value()).map(|c| c.lookup_count() > 0).unwrap_or(false)
        }) {
            return;
        }
        self.nodes.remove(&inode.nodeid.0);
    }

    /// Tells the table the kernel no longer expects `name` to resolve in
    /// `parent`. The child's lookup count is untouched (the kernel will
    /// `FORGET` separately); its node stays live for any open handles.
    pub fn unlink_update(&self, parent: &Arc<Inode>, name: &[u8]) -> Option<Arc<Inode>> {
        let _guard = parent.mount.tree_lock.write();
        let (_, child_id) = parent.children.remove(name)?;
        self.get(child_id)
    }

    /// Atomically relinks a child in the children maps. If a destination
    /// already existed at `(new_parent, new_name)`, it is unlinked with the
    /// same semantics as [`unlink_update`](Self::unlink_update).
    pub fn rename_update(
        &self,
        old_parent: &Arc<Inode>,
        old_name: &[u8],
        new_parent: &Arc<Inode>,
        new_name: &[u8],
    ) -> Result<(), Errno> {
        if !Arc::ptr_eq(&old_parent.mount, &new_parent.mount) {
            return Err(Errno::EXDEV);
        }
        if let Some(dest_id) = new_parent.children.get(new_name).map(|v| *v) {
            // Renaming onto an existing mountpoint entry would detach the
            // submount; refuse it the same way the kernel's own vfs does.
            if let Some(dest) = self.get(dest_id) {
                if dest.is_mount_root {
                    return Err(Errno::EBUSY);
                }
            }
        }
        let _guard = old_parent.mount.tree_lock.write();
        let Some(child_id) = old_parent.children.remove(old_name).map(|(_, v)| v) else {
            return Err(Errno::ENOENT);
        };
        if let Some((_, displaced)) = new_parent.children.remove(new_name) {
            let _ = displaced;
        }
        new_parent.children.insert(new_name.to_vec(), child_id);
        Ok(())
    }

    /// Informs the kernel it should invalidate its cache for `(parent, name)`
    /// because `child` was deleted server-side.
    pub fn delete_notify(&self, parent: &Inode, child: INodeNo, name: &std::ffi::OsStr) {
        if let Some(notifier) = parent.mount.notifier.read().as_ref() {
            let _ = notifier.delete(parent.nodeid, child, name);
        }
    }

    /// Attaches `mount` as a submount rooted at `parent`'s child `name`.
    /// Fails with `EBUSY` if that name already exists.
    pub fn mount_at(
        &self,
        parent: &Arc<Inode>,
        name: &[u8],
        mount: Arc<Mount>,
        root_node: Arc<dyn FsNode>,
    ) -> Result<Arc<Inode>, Errno> {
        let _guard = parent.mount.tree_lock.write();
        if parent.children.contains_key(name) {
            return Err(Errno::EBUSY);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let nodeid = INodeNo(id);
        let sub_root = Arc::new(Inode {
            nodeid,
            lookup_count: AtomicU64::new(1),
            is_dir: true,
            children: DashMap::new(),
            mount: mount.clone(),
            mountpoint: RwLock::new(None),
            unmounted: std::sync::atomic::AtomicBool::new(false),
            open_files: DashMap::new(),
            node: root_node,
            is_mount_root: true,
        });
        self.nodes.insert(id, sub_root.clone());
        parent.children.insert(name.to_vec(), nodeid);
        *parent.mountpoint.write() = Some(mount);
        Ok(sub_root)
    }

    /// Walks every node reachable from `root`, marking the subtree unmounted.
    /// Returns `EBUSY` (without changing anything) if any inode in the
    /// subtree has open files.
    pub fn unmount_subtree(&self, root: &Arc<Inode>) -> Result<(), Errno> {
        let mut stack = vec![root.clone()];
        let mut subtree = Vec::new();
        while let Some(node) = stack.pop() {
            if node.has_open_files() {
                return Err(Errno::EBUSY);
            }
            for entry in node.children.iter() {
                if let Some(child) = self.get(*entry.value()) {
                    stack.push(child);
                }
            }
            subtree.push(node);
        }
        for node in subtree {
            node.unmounted.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// A verification pass that walks the whole tree and asserts bidirectional
    /// consistency. Intended for debug/test builds; panics on the first
    /// violation found.
    pub fn check_consistency(&self) {
        for entry in self.nodes.iter() {
            let inode = entry.value();
            assert!(
                inode.lookup_count.load(Ordering::Relaxed) < u64::MAX / 2,
                "lookup count underflowed for {:?}",
                inode.nodeid
            );
            for child in inode.children.iter() {
                let child_id = *child.value();
                assert!(
                    self.nodes.contains_key(&child_id.0),
                    "dangling child {:?} under {:?}",
                    child_id,
                    inode.nodeid
                );
            }
        }
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<InodeTable>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::node::tests::NullNode;

    fn table() -> (InodeTable, Arc<Mount>) {
        let mount = Mount::new(FsOptions::default());
        let table = InodeTable::new(mount.clone(), Arc::new(NullNode));
        (table, mount)
    }

    #[test]
    fn lookup_then_forget_balances() {
        let (table, _mount) = table();
        let root = table.root();
        let child = table.lookup_update(&root, b"a", false, Arc::new(NullNode));
        assert_eq!(child.lookup_count(), 1);
        let same = table.lookup_update(&root, b"a", false, Arc::new(NullNode));
        assert_eq!(same.nodeid, child.nodeid);
        assert_eq!(same.lookup_count(), 2);
        table.forget_update(child.nodeid, 2);
        assert!(table.get(child.nodeid).is_none());
    }

    #[test]
    fn forget_clamps_at_zero() {
        let (table, _mount) = table();
        let root = table.root();
        let child = table.lookup_update(&root, b"a", false, Arc::new(NullNode));
        table.forget_update(child.nodeid, 100);
        assert!(table.get(child.nodeid).is_none());
    }

    #[test]
    fn unlink_keeps_node_alive_for_open_handles() {
        let (table, _mount) = table();
        let root = table.root();
        let child = table.lookup_update(&root, b"a", false, Arc::new(NullNode));
        child.register_open_file(1);
        table.unlink_update(&root, b"a");
        assert!(root.children.get(&b"a"[..]).is_none());
        assert!(table.get(child.nodeid).is_some());
    }

    #[test]
    fn rename_relinks_child() {
        let (table, _mount) = table();
        let root = table.root();
        let a = table.lookup_update(&root, b"src", false, Arc::new(NullNode));
        let dir = table.lookup_update(&root, b"dir", true, Arc::new(NullNode));
        table.rename_update(&root, b"src", &dir, b"dst").unwrap();
        assert!(root.children.get(&b"src"[..]).is_none());
        assert_eq!(*dir.children.get(&b"dst"[..]).unwrap(), a.nodeid);
    }

    #[test]
    fn submount_root_survives_forget() {
        let (table, _mount) = table();
        let root = table.root();
        let sub_mount = Mount::new(FsOptions::default());
        let sub_root = table
            .mount_at(&root, b"mnt", sub_mount, Arc::new(NullNode))
            .unwrap();
        assert!(sub_root.is_mount_root);
        // A well-behaved kernel still sends a matching FORGET for the LOOKUP
        // that resolved to the mount root; it must not evict it.
        table.forget_update(sub_root.nodeid, 1);
        assert!(table.get(sub_root.nodeid).is_some());
    }

    #[test]
    fn non_mount_root_is_evicted_on_forget() {
        let (table, _mount) = table();
        let root = table.root();
        let child = table.lookup_update(&root, b"a", false, Arc::new(NullNode));
        assert!(!child.is_mount_root);
        table.forget_update(child.nodeid, 1);
        assert!(table.get(child.nodeid).is_none());
    }
}
