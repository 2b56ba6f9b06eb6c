//! Communication channel to the kernel driver.
//!
//! A `Channel` is a thin, cloneable handle on the open `/dev/fuse` file
//! descriptor that `mnt::Mount` produced. Cloning a `Channel` shares the same
//! fd; `clone_fd` instead opens a second fd bound to the same FUSE
//! connection via `FUSE_DEV_IOC_CLONE`, so a multi-threaded session can have
//! more than one thread blocked in `read` on the kernel device at once.

use libc::{c_int, c_void, size_t};
use log::error;
use std::io;
use std::io::IoSlice;
#[cfg(feature = "abi-7-40")]
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use crate::dev_fuse::DevFuse;
#[cfg(feature = "abi-7-40")]
use crate::passthrough::BackingId;
use crate::reply::ReplySender;

// From <linux/fuse.h>: FUSE_DEV_IOC_MAGIC = 229, nr 0, argument size 4 (a uint32_t fd).
const FUSE_DEV_IOC_CLONE: libc::c_ulong = 0x8004_e500;

/// Opens a fresh `/dev/fuse` fd and links it to `master`'s session so reads on
/// either fd observe the same kernel connection.
fn clone_fuse_fd(master: &DevFuse) -> io::Result<DevFuse> {
    let clone = DevFuse::open()?;
    let master_fd: c_int = master.as_raw_fd();
    let rc = unsafe { libc::ioctl(clone.as_raw_fd(), FUSE_DEV_IOC_CLONE, &master_fd) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(clone)
}

/// A handle on the FUSE device fd used to read requests from the kernel.
#[derive(Debug, Clone)]
pub(crate) struct Channel {
    fd: Arc<DevFuse>,
}

impl Channel {
    pub(crate) fn new(fd: Arc<DevFuse>) -> Self {
        Self { fd }
    }

    /// Blocks until a request is available, a signal interrupts the read, or
    /// the filesystem is unmounted (`ENODEV`).
    pub(crate) fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len() as size_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    pub(crate) fn sender(&self) -> ChannelSender {
        ChannelSender {
            fd: self.fd.clone(),
        }
    }

    /// Duplicates the underlying fd so a second worker thread can read
    /// independently. Falls back to sharing the same fd on failure.
    pub(crate) fn clone_fd(&self) -> io::Result<Channel> {
        let cloned = clone_fuse_fd(&self.fd)?;
        Ok(Channel {
            fd: Arc::new(cloned),
        })
    }

    pub(crate) fn device(&self) -> &Arc<DevFuse> {
        &self.fd
    }
}

/// The write half of a `Channel`, handed to each `Request` so a reply can be
/// sent back without holding a reference to the `Channel` that read it.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSender {
    fd: Arc<DevFuse>,
}

impl ReplySender for ChannelSender {
    fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        let iovecs: Vec<_> = data
            .iter()
            .map(|d| libc::iovec {
                iov_base: d.as_ptr() as *mut c_void,
                iov_len: d.len() as size_t,
            })
            .collect();
        let rc =
            unsafe { libc::writev(self.fd.as_raw_fd(), iovecs.as_ptr(), iovecs.len() as c_int) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            error!("Failed to send FUSE reply: {}", err);
            Err(err)
        } else {
            Ok(())
        }
    }

    #[cfg(feature = "abi-7-40")]
    fn open_backing(&self, fd: BorrowedFd<'_>) -> io::Result<BackingId> {
        BackingId::create(&self.fd, fd)
    }
}
