//! Low-level wire types: the kernel ABI structs, the request parser and the
//! reply encoder, plus the small newtypes that keep inode numbers, file
//! handles and the like from being confused with one another or with plain
//! integers further up the stack.

pub(crate) mod argument;
pub mod fuse_abi;
pub(crate) mod request;

pub(crate) mod errno;
pub(crate) mod flags;
pub(crate) mod ioctl;
pub(crate) mod notify;
pub(crate) mod reply;

pub use request::{Operation, Request, RequestError};

use std::fmt;
use std::num::NonZeroI32;
use std::time::SystemTime;

/// Inode number as seen on the wire. `0` is never assigned by the kernel to a real
/// inode; it is reserved to mean "no parent" / "the invalid node".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct INodeNo(pub u64);

impl INodeNo {
    /// The inode number the kernel always assigns to the mountpoint's root directory.
    pub const ROOT: INodeNo = INodeNo(1);
}

impl From<u64> for INodeNo {
    fn from(v: u64) -> Self {
        INodeNo(v)
    }
}

impl From<INodeNo> for u64 {
    fn from(v: INodeNo) -> Self {
        v.0
    }
}

impl fmt::Display for INodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Opaque handle returned to the kernel from `open`/`opendir` and echoed back on
/// every subsequent operation against that open file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

impl From<u64> for FileHandle {
    fn from(v: u64) -> Self {
        FileHandle(v)
    }
}

impl From<FileHandle> for u64 {
    fn from(v: FileHandle) -> Self {
        v.0
    }
}

/// Identifies the owner of a POSIX byte-range lock, as assigned by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u64);

impl From<u64> for LockOwner {
    fn from(v: u64) -> Self {
        LockOwner(v)
    }
}

/// Generation number paired with an inode number. Together they let a client
/// that caches `(nodeid, generation)` detect inode number reuse after a FORGET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(pub u64);

/// The unique id the kernel assigns to a single in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A FUSE protocol (major, minor) version pair, as exchanged during INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// An atime/mtime value supplied to `setattr`: either a concrete time, or a
/// request to stamp the current server time (`UTIME_NOW`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    SpecificTime(SystemTime),
    Now,
}

/// A POSIX byte-range lock description, as carried by `GETLK`/`SETLK`/`SETLKW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub range: (u64, u64),
    pub typ: i32,
    pub pid: u32,
}

/// A raw kernel errno, guaranteed non-zero. `Display`/`Debug` render the
/// conventional `ENOENT`-style name where one is known.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub(crate) NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                pub const $name: Errno = Errno(unsafe_nonzero(libc::$name));
            )*
        }

        impl fmt::Debug for Errno {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                $(
                    if self.0.get() == libc::$name {
                        return write!(f, stringify!($name));
                    }
                )*
                write!(f, "Errno({})", self.0)
            }
        }
    };
}

// `libc::E*` constants are always non-zero; this helper lets the macro above build
// the table as `const` items instead of falling back to runtime initialization.
const fn unsafe_nonzero(v: i32) -> NonZeroI32 {
    match NonZeroI32::new(v) {
        Some(v) => v,
        None => panic!("errno constant was zero"),
    }
}

errno_consts!(
    EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD, EAGAIN, ENOMEM,
    EACCES, EFAULT, ENOTBLK, EBUSY, EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, ENFILE,
    EMFILE, ENOTTY, ETXTBSY, EFBIG, ENOSPC, ESPIPE, EROFS, EMLINK, EPIPE, EDOM, ERANGE, EDEADLK,
    ENAMETOOLONG, ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, ENOMSG, EIDRM, ENODATA, ETIME, ENOSR, ENOSTR,
    EBADMSG, EOVERFLOW, EILSEQ, ERESTART, EUSERS, ENOTSOCK, EDESTADDRREQ, EMSGSIZE, EPROTOTYPE,
    ENOPROTOOPT, EPROTONOSUPPORT, ESOCKTNOSUPPORT, EOPNOTSUPP, EPFNOSUPPORT, EAFNOSUPPORT,
    EADDRINUSE, EADDRNOTAVAIL, ENETDOWN, ENETUNREACH, ENETRESET, ECONNABORTED, ECONNRESET,
    ENOBUFS, EISCONN, ENOTCONN, ESHUTDOWN, ETOOMANYREFS, ETIMEDOUT, ECONNREFUSED, EHOSTDOWN,
    EHOSTUNREACH, EALREADY, EINPROGRESS, ESTALE, EDQUOT, ECANCELED,
);

impl Errno {
    /// Builds an `Errno` from a raw, non-zero kernel errno value.
    ///
    /// # Panics
    /// Panics if `value` is zero; zero means "success" and has no place in an
    /// error reply.
    pub fn from_i32(value: i32) -> Self {
        Errno(NonZeroI32::new(value).expect("errno value must be non-zero"))
    }

    pub fn code(&self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Errno {}

impl From<i32> for Errno {
    fn from(value: i32) -> Self {
        Errno::from_i32(value)
    }
}

#[cfg(test)]
pub(crate) mod test {
    /// Forces 8-byte alignment on a byte-array test fixture so it can be handed
    /// straight to the zero-copy wire parser without a realignment copy.
    #[repr(align(8))]
    pub(crate) struct AlignedData<T>(pub T);

    impl<T, U> std::ops::Deref for AlignedData<T>
    where
        T: std::ops::Deref<Target = [U]>,
    {
        type Target = [U];
        fn deref(&self) -> &[U] {
            &self.0
        }
    }
}
