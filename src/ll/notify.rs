//! Wire encoding for server-initiated notifications (poll wakeups and cache
//! invalidation), sent on the same `/dev/fuse` channel as ordinary replies but
//! framed with a notify code in place of a request's errno and `unique = 0`.

use std::convert::TryInto;
use std::io::IoSlice;
use std::num::TryFromIntError;
use std::os::unix::prelude::OsStrExt;

use smallvec::SmallVec;
use smallvec::smallvec;
use zerocopy::IntoBytes;

use super::INodeNo;
use super::fuse_abi as abi;
use super::fuse_abi::fuse_notify_code as notify_code;
use crate::notify::PollHandle;

type NotifyBuf = SmallVec<[u8; 64]>;

pub(crate) struct Notification<'a> {
    header_and_fixed: NotifyBuf,
    name_or_data: Option<&'a [u8]>,
}

impl<'a> Notification<'a> {
    fn from_struct<T: IntoBytes + ?Sized>(data: &T) -> Self {
        Self {
            header_and_fixed: NotifyBuf::from_slice(data.as_bytes()),
            name_or_data: None,
        }
    }

    pub(crate) fn new_poll(kh: PollHandle) -> Self {
        Self::from_struct(&abi::fuse_notify_poll_wakeup_out { kh: kh.0 })
    }

    pub(crate) fn new_inval_inode(ino: INodeNo, offset: i64, len: i64) -> Self {
        Self::from_struct(&abi::fuse_notify_inval_inode_out {
            ino: ino.into(),
            off: offset,
            len,
        })
    }

    pub(crate) fn new_inval_entry(
        parent: INodeNo,
        name: &'a std::ffi::OsStr,
    ) -> Result<Self, TryFromIntError> {
        let namelen: u32 = name.len().try_into()?;
        let mut this = Self::from_struct(&abi::fuse_notify_inval_entry_out {
            parent: parent.into(),
            namelen,
            padding: 0,
        });
        this.name_or_data = Some(name.as_bytes());
        Ok(this)
    }

    pub(crate) fn new_delete(
        parent: INodeNo,
        child: INodeNo,
        name: &'a std::ffi::OsStr,
    ) -> Result<Self, TryFromIntError> {
        let namelen: u32 = name.len().try_into()?;
        let mut this = Self::from_struct(&abi::fuse_notify_delete_out {
            parent: parent.into(),
            child: child.into(),
            namelen,
            padding: 0,
        });
        this.name_or_data = Some(name.as_bytes());
        Ok(this)
    }

    pub(crate) fn new_store(
        ino: INodeNo,
        offset: u64,
        data: &'a [u8],
    ) -> Result<Self, TryFromIntError> {
        let size: u32 = data.len().try_into()?;
        let mut this = Self::from_struct(&abi::fuse_notify_store_out {
            nodeid: ino.into(),
            offset,
            size,
            padding: 0,
        });
        this.name_or_data = Some(data);
        Ok(this)
    }

    pub(crate) fn new_retrieve(notify_unique: u64, ino: INodeNo, offset: u64, size: u32) -> Self {
        Self::from_struct(&abi::fuse_notify_retrieve_out {
            notify_unique,
            nodeid: ino.into(),
            offset,
            size,
            padding: 0,
        })
    }

    /// Frames this notification as `[fuse_out_header, fixed part, name/data]`
    /// and hands the resulting iovec to `f`. The notify code is carried in the
    /// header's `error` field, negated the same way a real errno would be.
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> std::io::Result<()>>(
        &self,
        code: notify_code,
        f: F,
    ) -> Result<std::io::Result<()>, TryFromIntError> {
        let extra_len = self.name_or_data.map_or(0, <[u8]>::len);
        let len: u32 = (size_of::<abi::fuse_out_header>() + self.header_and_fixed.len() + extra_len)
            .try_into()?;
        let header = abi::fuse_out_header {
            len,
            error: -(code as i32),
            unique: 0,
        };
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![
            IoSlice::new(header.as_bytes()),
            IoSlice::new(&self.header_and_fixed),
        ];
        if let Some(extra) = self.name_or_data {
            v.push(IoSlice::new(extra));
        }
        Ok(f(&v))
    }
}
