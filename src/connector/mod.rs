//! The node-tree engine: translates the inode-addressed wire protocol into
//! calls against a pluggable filesystem object.
//!
//! [`connector::Connector`] is the [`Filesystem`](crate::Filesystem)
//! implementation a caller hands to [`Session`](crate::Session); it is built
//! from an [`InodeTable`](inode::InodeTable) (nodeid minting and lookup-count
//! bookkeeping), a [`HandleMap`](handle_map::HandleMap) (open file/dir
//! handles), and a [`BufferPool`](buffer_pool::BufferPool) (read buffer
//! reuse). The filesystem itself is supplied as an [`FsNode`](node::FsNode)
//! tree, either directly or via [`PathNodeFs`](pathfs::PathNodeFs) for
//! filesystems that would rather work in terms of paths.

pub mod buffer_pool;
pub mod connector;
pub mod dirent;
pub mod handle_map;
pub mod inode;
pub mod node;
pub mod pathfs;
pub mod read_result;

pub use buffer_pool::BufferPool;
pub use connector::Connector;
pub use handle_map::HandleMap;
pub use inode::{FsOptions, Mount, Owner};
pub use node::{Context, DirEntry, FileSystem, FsNode, LookupReply, NodeResult, OpenDir, OpenFile, StatFs};
pub use pathfs::{PathNode, PathNodeFs};
pub use read_result::{ReadDone, ReadResult};
