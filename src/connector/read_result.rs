//! The value a node's file returns from `read`: either bytes the node already
//! had in hand, or a descriptor of bytes that live in a backing fd, so the
//! connector can choose the cheapest way to get them to the kernel.

use std::os::fd::RawFd;

use crate::Bytes;

use super::buffer_pool::BufferPool;

/// Either owned bytes, or a `(fd, offset, size)` triple describing where to
/// read them from.
enum ReadResultKind {
    /// Data the node already had in memory.
    Bytes(Bytes<'static>),
    /// Data backed by an open file descriptor, read lazily.
    Fd {
        /// Source file descriptor. Not owned by `ReadResult`; the node (or its
        /// `done` callback) is responsible for its lifetime.
        fd: RawFd,
        /// Offset to read from within `fd`.
        offset: i64,
        /// Number of bytes to read.
        size: u32,
    },
}

/// A tagged value a node's `read` hands back to the connector: either owned
/// bytes or a lazily-evaluated `(fd, offset, size)` descriptor, plus an
/// optional `Done` callback the connector runs exactly once, after the data
/// has been delivered to the kernel — the one place a node gets to release
/// resources (e.g. close a temporary fd) regardless of which variant it
/// returned or whether delivery succeeded.
pub struct ReadResult {
    kind: ReadResultKind,
    done: Option<Box<dyn FnOnce() + Send>>,
}

/// Runs a `ReadResult`'s `Done` callback, if it had one. Obtained from
/// [`ReadResult::materialize`]; the connector calls [`ReadDone::call`] once
/// the reply has been handed to the kernel.
#[must_use]
pub struct ReadDone(Option<Box<dyn FnOnce() + Send>>);

impl ReadDone {
    /// Invokes the callback, consuming it. A no-op if there wasn't one.
    pub fn call(self) {
        if let Some(done) = self.0 {
            done();
        }
    }
}

impl ReadResult {
    /// Wraps an already-materialized buffer.
    pub fn from_bytes(data: impl Into<Bytes<'static>>) -> Self {
        ReadResult { kind: ReadResultKind::Bytes(data.into()), done: None }
    }

    /// Describes data to be pulled lazily from `fd` at `offset`, `size` bytes long.
    pub fn from_fd(fd: RawFd, offset: i64, size: u32) -> Self {
        ReadResult { kind: ReadResultKind::Fd { fd, offset, size }, done: None }
    }

    /// Attaches a callback the connector runs once, after this result has
    /// been delivered to the kernel (materialized and handed to the reply),
    /// whether or not materialization succeeded.
    pub fn with_done(mut self, done: impl FnOnce() + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    /// The number of bytes this result carries (or will carry once materialized).
    pub fn size(&self) -> usize {
        match &self.kind {
            ReadResultKind::Bytes(b) => b.borrow().len(),
            ReadResultKind::Fd { size, .. } => *size as usize,
        }
    }

    /// Resolves this result to owned bytes, returning the `Done` callback
    /// alongside it. The caller must invoke [`ReadDone::call`] once the bytes
    /// have been handed to the kernel, whether or not resolution succeeded.
    ///
    /// For the `Fd` variant this performs a `pread` into a pool-allocated
    /// buffer. The source spec also allows a splice-based zero-copy path from
    /// `fd` straight to the device when the kernel negotiated splice support;
    /// that transport-level optimization lives in the server's reply path
    /// (outside this type) and is not required for correctness — `materialize`
    /// is the one path that always works.
    pub fn materialize(self, pool: &BufferPool) -> (std::io::Result<Bytes<'static>>, ReadDone) {
        let done = ReadDone(self.done);
        let result = match self.kind {
            ReadResultKind::Bytes(b) => Ok(b),
            ReadResultKind::Fd { fd, offset, size } => {
                let mut buf = pool.alloc(size as usize);
                let n = unsafe {
                    libc::pread(
                        fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        offset,
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    let n = n as usize;
                    let data: Vec<u8> = buf[..n].to_vec();
                    pool.free(buf);
                    Ok(Bytes::from(data))
                }
            }
        };
        (result, done)
    }
}

impl std::fmt::Debug for ReadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ReadResultKind::Bytes(b) => f.debug_tuple("Bytes").field(&b.borrow().len()).finish(),
            ReadResultKind::Fd { fd, offset, size } => f
                .debug_struct("Fd")
                .field("fd", fd)
                .field("offset", offset)
                .field("size", size)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_variant_size_matches_len() {
        let r = ReadResult::from_bytes(vec![1u8, 2, 3]);
        assert_eq!(r.size(), 3);
    }

    #[test]
    fn fd_variant_materializes_via_pread() {
        use std::io::Write;
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello world").unwrap();
        let pool = BufferPool::new();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&file);
        let r = ReadResult::from_fd(fd, 6, 5);
        let (data, done) = r.materialize(&pool);
        assert_eq!(&*data.unwrap().borrow(), b"world");
        done.call();
    }

    #[test]
    fn done_callback_runs_exactly_once_after_materialize() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let r = ReadResult::from_bytes(vec![1u8, 2, 3]).with_done(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let pool = BufferPool::new();
        let (data, done) = r.materialize(&pool);
        assert!(data.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        done.call();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn done_callback_runs_even_when_materialize_fails() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        // -1 is never a valid fd; pread against it fails with EBADF.
        let r = ReadResult::from_fd(-1, 0, 4).with_done(move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        let pool = BufferPool::new();
        let (data, done) = r.materialize(&pool);
        assert!(data.is_err());
        done.call();
        assert!(ran.load(Ordering::SeqCst));
    }
}
