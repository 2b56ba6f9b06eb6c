//! Builds the directory-entry lists the connector hands to
//! [`ReplyHandler::dir`](crate::reply::ReplyHandler::dir) /
//! [`ReplyHandler::dirplus`](crate::reply::ReplyHandler::dirplus).
//!
//! The wire-level byte-packing and budget enforcement already lives in
//! [`crate::ll::reply::DirEntList`]/[`DirEntPlusList`] (pushed to by those
//! `ReplyHandler` methods); what this module owns is the node-tree-level
//! step above that: turning an [`OpenDir`](super::node::OpenDir)'s full
//! entry list into the `(offset, Dirent[, Entry])` sequence the kernel
//! expects, starting at the offset it asked for, and — for `READDIRPLUS` —
//! minting a lookup reference for every entry returned.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use crate::reply::{Dirent, DirentList, DirentPlusList, Entry as EntryReply};

use super::inode::{Inode, InodeTable};
use super::node::{Context, DirEntry};

/// Builds the plain `Dirent` list for a `READDIR` reply.
///
/// Entry `offset` fields are 1-based positions into the full listing. The
/// list always covers the whole directory; resuming at the offset the
/// kernel asked for is the job of `min_offset` at the `ReplyHandler::dir`
/// call site, which skips everything before it.
pub fn build_readdir_list<'a>(entries: &'a [DirEntry]) -> DirentList<'static, 'a> {
    let list: Vec<Dirent<'a>> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| Dirent {
            ino: e.ino,
            offset: (i + 1) as i64,
            kind: e.kind,
            name: (&e.name[..]).into(),
        })
        .collect();
    DirentList::from(list)
}

/// Builds the `READDIRPLUS` reply list: a `Dirent` plus a full `Entry` for
/// each name, minting a lookup reference for each child in the process (the
/// kernel now holds an implicit `LOOKUP` promise for every name it was shown).
///
/// Unlike `READDIR`, this can't rely on names already being linked in the
/// inode table — a directory's first `READDIRPLUS` sees none of its children
/// linked yet, so every name here gets its own fresh `lookup` against the
/// node, exactly as if the kernel had issued individual `LOOKUP`s.
pub fn build_readdirplus_list<'a>(
    table: &InodeTable,
    parent: &Arc<Inode>,
    entries: &'a [DirEntry],
    ctx: &Context,
) -> DirentPlusList<'static, 'a> {
    let mut out = Vec::with_capacity(entries.len());
    for (i, e) in entries.iter().enumerate() {
        let name = OsStr::from_bytes(&e.name);
        let Ok(looked) = parent.node.lookup(name, ctx) else {
            continue;
        };
        let child = table.lookup_update(parent, &e.name, looked.is_dir, looked.node.clone());
        parent.node.add_child(&e.name, &looked.node);
        let mut attr = looked.attr;
        attr.ino = child.nodeid;
        let dirent = Dirent {
            ino: child.nodeid,
            offset: (i + 1) as i64,
            kind: e.kind,
            name: (&e.name[..]).into(),
        };
        let entry = EntryReply {
            ino: attr.ino,
            generation: Some(0),
            file_ttl: parent.mount.options.entry_timeout,
            attr,
            attr_ttl: parent.mount.options.attr_timeout,
        };
        out.push((dirent, entry));
    }
    DirentPlusList::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileType;
    use crate::INodeNo;

    #[test]
    fn readdir_list_assigns_sequential_offsets() {
        let entries = vec![
            DirEntry { name: b"a".to_vec(), ino: INodeNo(2), kind: FileType::RegularFile },
            DirEntry { name: b"b".to_vec(), ino: INodeNo(3), kind: FileType::RegularFile },
        ];
        let list = build_readdir_list(&entries);
        let borrowed = list.borrow();
        assert_eq!(borrowed[0].offset, 1);
        assert_eq!(borrowed[1].offset, 2);
    }

    #[test]
    fn empty_directory_yields_empty_list() {
        let entries: Vec<DirEntry> = Vec::new();
        let list = build_readdir_list(&entries);
        assert_eq!(list.borrow().len(), 0);
    }
}
