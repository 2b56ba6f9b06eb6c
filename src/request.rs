//! Adapts a parsed low-level FUSE request into a call against a `Filesystem`
//! implementation, and makes sure every request is answered exactly once.

use std::cell::RefCell;
use std::convert::TryFrom;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use log::{error, info, trace, warn};

use crate::forget_one::ForgetOne;
use crate::ll;
use crate::ll::flags::fattr_flags::FattrFlags;
use crate::ll::flags::fsync_flags::FsyncFlags;
use crate::ll::flags::getattr_flags::GetattrFlags;
use crate::ll::flags::release_flags::ReleaseFlags;
use crate::notify::{PollNotifier, RetrieveId};
use crate::reply::ReplyHandler;
use crate::request_param;
use crate::session::Session;
use crate::time::system_time_from_time;
use crate::{channel::ChannelSender, Filesystem, KernelConfig};
use crate::{
    AccessFlags, BsdFileFlags, CopyFileRangeFlags, FileHandle, INodeNo, IoctlFlags, LockOwner,
    OpenFlags, PollEvents, PollFlags, PollHandle, ReadFlags, RenameFlags, TimeOrNow, Version,
    WriteFlags,
};

/// A single FUSE request read off the device, not yet matched against a filesystem.
#[derive(Debug)]
pub struct Request<'a> {
    /// Channel sender for sending the reply
    ch: ChannelSender,
    /// Parsed request
    request: ll::Request<'a>,
    /// This request's cancellation token, registered in the session's inflight
    /// table for the duration of `dispatch` and handed to this request's
    /// `ReplyHandler` so an `INTERRUPT` landing mid-handler can suppress the
    /// reply. `None` until `dispatch` runs.
    cancel_token: RefCell<Option<Arc<AtomicBool>>>,
}

/// Removes a request's entry from the inflight table when the request finishes
/// dispatching, by whichever path (normal fall-through or an early `return`).
struct InflightGuard {
    inflight: Arc<DashMap<u64, Arc<AtomicBool>>>,
    unique: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.unique);
    }
}

impl<'a> Request<'a> {
    /// Create a new request from the given data
    pub fn new(ch: ChannelSender, data: &'a [u8]) -> Option<Request<'a>> {
        let request = match ll::Request::try_from(data) {
            Ok(request) => request,
            Err(err) => {
                error!("{}", err);
                return None;
            }
        };

        Some(Self { ch, request, cancel_token: RefCell::new(None) })
    }

    /// Dispatch request to the given filesystem.
    /// This calls the appropriate filesystem operation method for the
    /// request and sends back the returned reply to the kernel
    pub fn dispatch<FS: Filesystem>(&self, se: &mut Session<FS>) {
        trace!("{}", self.request);

        let req = request_param::Request::ref_cast(self.request.raw_header());

        // `INTERRUPT`/`FORGET`/`BATCH_FORGET` carry no reply of their own to
        // suppress, so they don't need a token; every other opcode gets one
        // registered for the duration of this call.
        let unique = self.request.unique();
        let opcode = self.request.raw_header().opcode;
        use crate::ll::fuse_abi::fuse_opcode::{FUSE_BATCH_FORGET, FUSE_FORGET, FUSE_INTERRUPT};
        let trackable = opcode != FUSE_INTERRUPT as u32
            && opcode != FUSE_FORGET as u32
            && opcode != FUSE_BATCH_FORGET as u32;
        let _guard;
        if trackable {
            let token = Arc::new(AtomicBool::new(false));
            se.inflight.insert(unique, token.clone());
            *self.cancel_token.borrow_mut() = Some(token);
            _guard = Some(InflightGuard {
                inflight: se.inflight.clone(),
                unique,
            });
        } else {
            _guard = None;
        }

        match self.request.operation() {
            // Filesystem initialization
            ll::Operation::Init(x) => {
                let v = Version(x.arg.major, x.arg.minor);
                // We don't support ABI versions before 7.6
                if v < Version(7, 6) {
                    error!("Unsupported FUSE ABI version {}", v);
                    self.reply().error(ll::Errno::EPROTO);
                    return;
                }
                // Remember ABI version supported by kernel
                se.proto_major = x.arg.major;
                se.proto_minor = x.arg.minor;

                #[cfg(feature = "abi-7-36")]
                let capabilities = (u64::from(x.arg.flags2) << 32) | u64::from(x.arg.flags);
                #[cfg(not(feature = "abi-7-36"))]
                let capabilities = u64::from(x.arg.flags);

                let mut config =
                    KernelConfig::new(crate::InitFlags::from_bits_truncate(capabilities), x.arg.max_readahead, v);
                // Call filesystem init method and give it a chance to return an error
                if let Err(err) = se.filesystem.init(req, &mut config) {
                    self.reply().error(err);
                    return;
                }
                se.initialized = true;
                info!(
                    "INIT response: ABI {}, max readahead {}, max write {}",
                    v,
                    config.max_readahead(),
                    config.max_write
                );
                // Replies with our desired version and settings. If the kernel supports a
                // larger major version, it'll re-send a matching init message. If it
                // supports only lower major versions, we replied with an error above.
                self.reply().config(capabilities, config);
            }
            // Any operation is invalid before initialization
            _ if !se.initialized => {
                warn!("Ignoring FUSE operation before init: {}", self.request);
                self.reply().error(ll::Errno::EIO);
            }
            // Filesystem destroyed
            ll::Operation::Destroy(_) => {
                se.filesystem.destroy();
                se.destroyed = true;
                self.reply().ok();
            }
            // Any operation is invalid after destroy
            _ if se.destroyed => {
                warn!("Ignoring FUSE operation after destroy: {}", self.request);
                self.reply().error(ll::Errno::EIO);
            }

            ll::Operation::Interrupt(x) => {
                // Advisory: flip the target's cancellation token if it's still
                // in flight, so its reply (whenever the handler gets around to
                // producing one) is dropped instead of written to the device.
                // libfuse's convention: EAGAIN if the target is no longer
                // known (it may have already replied), otherwise success.
                match se.inflight.get(&x.arg.unique) {
                    Some(token) => {
                        token.store(true, std::sync::atomic::Ordering::Release);
                        self.reply().ok();
                    }
                    None => {
                        self.reply().error(ll::Errno::EAGAIN);
                    }
                }
            }

            ll::Operation::Lookup(x) => {
                se.filesystem
                    .lookup(req, self.request.nodeid().into(), x.name, self.reply());
            }
            ll::Operation::Forget(x) => {
                se.filesystem
                    .forget(req, self.request.nodeid().into(), x.arg.nlookup); // no reply
            }
            ll::Operation::GetAttr(x) => {
                let fh = GetattrFlags::from_bits_truncate(x.arg.getattr_flags)
                    .contains(GetattrFlags::FUSE_GETATTR_FH)
                    .then(|| FileHandle(x.arg.fh));
                se.filesystem
                    .getattr(req, self.request.nodeid().into(), fh, self.reply());
            }
            ll::Operation::SetAttr(x) => {
                let valid = FattrFlags::from_bits_truncate(x.arg.valid);
                let atime = if x.arg.atime_now() {
                    Some(TimeOrNow::Now)
                } else if valid.contains(FattrFlags::FATTR_ATIME) {
                    Some(TimeOrNow::SpecificTime(system_time_from_time(
                        x.arg.atime,
                        x.arg.atimensec,
                    )))
                } else {
                    None
                };
                let mtime = if x.arg.mtime_now() {
                    Some(TimeOrNow::Now)
                } else if valid.contains(FattrFlags::FATTR_MTIME) {
                    Some(TimeOrNow::SpecificTime(system_time_from_time(
                        x.arg.mtime,
                        x.arg.mtimensec,
                    )))
                } else {
                    None
                };
                #[cfg(feature = "abi-7-23")]
                let ctime = valid
                    .contains(FattrFlags::FATTR_CTIME)
                    .then(|| system_time_from_time(x.arg.ctime, x.arg.ctimensec));
                #[cfg(not(feature = "abi-7-23"))]
                let ctime = None;
                #[cfg(target_os = "macos")]
                let crtime = valid
                    .contains(FattrFlags::FATTR_CRTIME)
                    .then(|| system_time_from_time(x.arg.crtime as i64, x.arg.crtimensec));
                #[cfg(not(target_os = "macos"))]
                let crtime = None;
                #[cfg(target_os = "macos")]
                let chgtime = valid
                    .contains(FattrFlags::FATTR_CHGTIME)
                    .then(|| system_time_from_time(x.arg.chgtime as i64, x.arg.chgtimensec));
                #[cfg(not(target_os = "macos"))]
                let chgtime = None;
                #[cfg(target_os = "macos")]
                let bkuptime = valid
                    .contains(FattrFlags::FATTR_BKUPTIME)
                    .then(|| system_time_from_time(x.arg.bkuptime as i64, x.arg.bkuptimensec));
                #[cfg(not(target_os = "macos"))]
                let bkuptime = None;
                #[cfg(target_os = "macos")]
                let flags = valid
                    .contains(FattrFlags::FATTR_FLAGS)
                    .then(|| BsdFileFlags::from_bits_truncate(x.arg.flags));
                #[cfg(not(target_os = "macos"))]
                let flags: Option<BsdFileFlags> = None;

                se.filesystem.setattr(
                    req,
                    self.request.nodeid().into(),
                    valid.contains(FattrFlags::FATTR_MODE).then(|| x.arg.mode),
                    valid.contains(FattrFlags::FATTR_UID).then(|| x.arg.uid),
                    valid.contains(FattrFlags::FATTR_GID).then(|| x.arg.gid),
                    valid.contains(FattrFlags::FATTR_SIZE).then(|| x.arg.size),
                    atime,
                    mtime,
                    ctime,
                    valid.contains(FattrFlags::FATTR_FH).then(|| FileHandle(x.arg.fh)),
                    crtime,
                    chgtime,
                    bkuptime,
                    flags,
                    self.reply(),
                );
            }
            ll::Operation::ReadLink(_) => {
                se.filesystem
                    .readlink(req, self.request.nodeid().into(), self.reply());
            }
            ll::Operation::MkNod(x) => {
                se.filesystem.mknod(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    x.arg.mode,
                    x.arg.umask,
                    x.arg.rdev,
                    self.reply(),
                );
            }
            ll::Operation::MkDir(x) => {
                se.filesystem.mkdir(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    x.arg.mode,
                    x.arg.umask,
                    self.reply(),
                );
            }
            ll::Operation::Unlink(x) => {
                se.filesystem
                    .unlink(req, self.request.nodeid().into(), x.name, self.reply());
            }
            ll::Operation::RmDir(x) => {
                se.filesystem
                    .rmdir(req, self.request.nodeid().into(), x.name, self.reply());
            }
            ll::Operation::SymLink(x) => {
                se.filesystem.symlink(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    Path::new(x.link),
                    self.reply(),
                );
            }
            ll::Operation::Rename(x) => {
                se.filesystem.rename(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    INodeNo(x.arg.newdir),
                    x.newname,
                    RenameFlags::empty(),
                    self.reply(),
                );
            }
            ll::Operation::Link(x) => {
                se.filesystem.link(
                    req,
                    INodeNo(x.arg.oldnodeid),
                    self.request.nodeid().into(),
                    x.name,
                    self.reply(),
                );
            }
            ll::Operation::Open(x) => {
                se.filesystem
                    .open(req, self.request.nodeid().into(), OpenFlags(x.arg.flags), self.reply());
            }
            ll::Operation::Read(x) => {
                let lock_owner = ReadFlags::from_bits_truncate(x.arg.read_flags)
                    .contains(ReadFlags::FUSE_READ_LOCKOWNER)
                    .then(|| LockOwner(x.arg.lock_owner));
                se.filesystem.read(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    x.arg.offset as u64,
                    x.arg.size,
                    ReadFlags::from_bits_truncate(x.arg.read_flags),
                    x.arg.flags as u32,
                    lock_owner,
                    self.reply(),
                );
            }
            ll::Operation::Write(x) => {
                let lock_owner = WriteFlags::from_bits_truncate(x.arg.write_flags)
                    .contains(WriteFlags::FUSE_WRITE_LOCKOWNER)
                    .then(|| LockOwner(x.arg.lock_owner));
                se.filesystem.write(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    x.arg.offset,
                    x.data,
                    WriteFlags::from_bits_truncate(x.arg.write_flags),
                    OpenFlags(x.arg.flags),
                    lock_owner,
                    self.reply(),
                );
            }
            ll::Operation::Flush(x) => {
                se.filesystem.flush(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    LockOwner(x.arg.lock_owner),
                    self.reply(),
                );
            }
            ll::Operation::Release(x) => {
                let release_flags = ReleaseFlags::from_bits_truncate(x.arg.release_flags);
                let lock_owner = release_flags
                    .contains(ReleaseFlags::FUSE_RELEASE_FLOCK_UNLOCK)
                    .then(|| LockOwner(x.arg.lock_owner));
                se.filesystem.release(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    OpenFlags(x.arg.flags),
                    lock_owner,
                    release_flags.contains(ReleaseFlags::FUSE_RELEASE_FLUSH),
                    self.reply(),
                );
            }
            ll::Operation::FSync(x) => {
                se.filesystem.fsync(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    FsyncFlags::from_bits_truncate(x.arg.fsync_flags)
                        .contains(FsyncFlags::FUSE_FSYNC_FDATASYNC),
                    self.reply(),
                );
            }
            ll::Operation::OpenDir(x) => {
                se.filesystem.opendir(
                    req,
                    self.request.nodeid().into(),
                    OpenFlags(x.arg.flags),
                    self.reply(),
                );
            }
            ll::Operation::ReadDir(x) => {
                se.filesystem.readdir(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    x.arg.offset as u64,
                    x.arg.size,
                    self.reply(),
                );
            }
            ll::Operation::ReleaseDir(x) => {
                se.filesystem.releasedir(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    OpenFlags(x.arg.flags),
                    self.reply(),
                );
            }
            ll::Operation::FSyncDir(x) => {
                se.filesystem.fsyncdir(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    FsyncFlags::from_bits_truncate(x.arg.fsync_flags)
                        .contains(FsyncFlags::FUSE_FSYNC_FDATASYNC),
                    self.reply(),
                );
            }
            ll::Operation::StatFs(_) => {
                se.filesystem
                    .statfs(req, self.request.nodeid().into(), self.reply());
            }
            ll::Operation::SetXAttr(x) => {
                #[cfg(target_os = "macos")]
                let position = x.arg.position;
                #[cfg(not(target_os = "macos"))]
                let position = 0;
                se.filesystem.setxattr(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    x.value,
                    x.arg.flags,
                    position,
                    self.reply(),
                );
            }
            ll::Operation::GetXAttr(x) => {
                se.filesystem.getxattr(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    x.arg.size,
                    self.reply(),
                );
            }
            ll::Operation::ListXAttr(x) => {
                se.filesystem
                    .listxattr(req, self.request.nodeid().into(), x.arg.size, self.reply());
            }
            ll::Operation::RemoveXAttr(x) => {
                se.filesystem
                    .removexattr(req, self.request.nodeid().into(), x.name, self.reply());
            }
            ll::Operation::Access(x) => {
                se.filesystem.access(
                    req,
                    self.request.nodeid().into(),
                    AccessFlags::from_bits_truncate(x.arg.mask),
                    self.reply(),
                );
            }
            ll::Operation::Create(x) => {
                se.filesystem.create(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    x.arg.mode,
                    x.arg.umask,
                    x.arg.flags,
                    self.reply(),
                );
            }
            ll::Operation::GetLk(x) => {
                se.filesystem.getlk(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    LockOwner(x.arg.owner),
                    x.arg.lk.start,
                    x.arg.lk.end,
                    x.arg.lk.typ,
                    x.arg.lk.pid,
                    self.reply(),
                );
            }
            ll::Operation::SetLk(x) => {
                se.filesystem.setlk(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    LockOwner(x.arg.owner),
                    x.arg.lk.start,
                    x.arg.lk.end,
                    x.arg.lk.typ,
                    x.arg.lk.pid,
                    false,
                    self.reply(),
                );
            }
            ll::Operation::SetLkW(x) => {
                se.filesystem.setlk(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    LockOwner(x.arg.owner),
                    x.arg.lk.start,
                    x.arg.lk.end,
                    x.arg.lk.typ,
                    x.arg.lk.pid,
                    true,
                    self.reply(),
                );
            }
            ll::Operation::BMap(x) => {
                se.filesystem.bmap(
                    req,
                    self.request.nodeid().into(),
                    x.arg.blocksize,
                    x.arg.block,
                    self.reply(),
                );
            }

            #[cfg(feature = "abi-7-11")]
            ll::Operation::IoCtl(x) => {
                let flags = IoctlFlags::from_bits_truncate(x.arg.flags);
                if flags.contains(IoctlFlags::FUSE_IOCTL_UNRESTRICTED) {
                    self.reply().error(ll::Errno::ENOSYS);
                } else {
                    se.filesystem.ioctl(
                        req,
                        self.request.nodeid().into(),
                        FileHandle(x.arg.fh),
                        flags,
                        x.arg.cmd,
                        x.data,
                        x.arg.out_size,
                        self.reply(),
                    );
                }
            }
            #[cfg(feature = "abi-7-11")]
            ll::Operation::Poll(x) => {
                let ph = PollNotifier::new(self.ch.clone(), PollHandle(x.arg.kh));
                #[cfg(feature = "abi-7-21")]
                let events = PollEvents::from_bits_truncate(x.arg.events);
                #[cfg(not(feature = "abi-7-21"))]
                let events = PollEvents::empty();
                se.filesystem.poll(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    ph,
                    events,
                    PollFlags::from_bits_truncate(x.arg.flags),
                    self.reply(),
                );
            }
            #[cfg(feature = "abi-7-15")]
            ll::Operation::NotifyReply(x) => {
                se.filesystem.notify_reply(
                    req,
                    self.request.nodeid().into(),
                    RetrieveId(self.request.unique()),
                    x.data,
                ); // no reply
            }
            #[cfg(feature = "abi-7-16")]
            ll::Operation::BatchForget(x) => {
                se.filesystem
                    .batch_forget(req, ForgetOne::slice_from_inner(x.nodes)); // no reply
            }
            #[cfg(feature = "abi-7-19")]
            ll::Operation::FAllocate(x) => {
                se.filesystem.fallocate(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    x.arg.offset,
                    x.arg.length,
                    x.arg.mode,
                    self.reply(),
                );
            }
            #[cfg(feature = "abi-7-21")]
            ll::Operation::ReadDirPlus(x) => {
                se.filesystem.readdirplus(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    x.arg.offset as u64,
                    x.arg.size,
                    self.reply(),
                );
            }
            #[cfg(feature = "abi-7-23")]
            ll::Operation::Rename2(x) => {
                se.filesystem.rename(
                    req,
                    self.request.nodeid().into(),
                    x.name,
                    INodeNo(x.arg.newdir),
                    x.newname,
                    RenameFlags::from_bits_truncate(x.arg.flags),
                    self.reply(),
                );
            }
            #[cfg(feature = "abi-7-24")]
            ll::Operation::Lseek(x) => {
                se.filesystem.lseek(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh),
                    x.arg.offset,
                    x.arg.whence,
                    self.reply(),
                );
            }
            #[cfg(feature = "abi-7-28")]
            ll::Operation::CopyFileRange(x) => {
                se.filesystem.copy_file_range(
                    req,
                    self.request.nodeid().into(),
                    FileHandle(x.arg.fh_in),
                    x.arg.off_in,
                    INodeNo(x.arg.nodeid_out),
                    FileHandle(x.arg.fh_out),
                    x.arg.off_out,
                    x.arg.len,
                    CopyFileRangeFlags::from_bits_truncate(x.arg.flags),
                    self.reply(),
                );
            }
            #[cfg(target_os = "macos")]
            ll::Operation::SetVolName(x) => {
                se.filesystem.setvolname(req, x.name, self.reply());
            }
            #[cfg(target_os = "macos")]
            ll::Operation::GetXTimes(_) => {
                se.filesystem
                    .getxtimes(req, self.request.nodeid().into(), self.reply());
            }
            #[cfg(target_os = "macos")]
            ll::Operation::Exchange(x) => {
                se.filesystem.exchange(
                    req,
                    INodeNo(x.arg.olddir),
                    x.oldname,
                    INodeNo(x.arg.newdir),
                    x.newname,
                    x.arg.options,
                    self.reply(),
                );
            }

            #[cfg(feature = "abi-7-12")]
            ll::Operation::CuseInit(_) => {
                // TODO: handle CUSE_INIT
                self.reply().error(ll::Errno::ENOSYS);
            }
        }
    }

    /// Create a reply object for this request that can be passed to the filesystem
    /// implementation and makes sure that a request is replied exactly once
    fn reply(&self) -> ReplyHandler {
        let header = self.request.raw_header();
        let handler = ReplyHandler::new(self.request.unique(), self.ch.clone())
            .with_request_info(header.opcode, header.nodeid);
        match self.cancel_token.borrow().clone() {
            Some(token) => handler.with_cancel_token(token),
            None => handler,
        }
    }

    /// Returns the unique identifier of this request
    #[inline]
    #[allow(dead_code)]
    pub fn unique(&self) -> u64 {
        self.request.unique()
    }

    /// Returns the uid of this request
    #[inline]
    #[allow(dead_code)]
    pub fn uid(&self) -> u32 {
        self.request.uid()
    }

    /// Returns the gid of this request
    #[inline]
    #[allow(dead_code)]
    pub fn gid(&self) -> u32 {
        self.request.gid()
    }

    /// Returns the pid of this request
    #[inline]
    #[allow(dead_code)]
    pub fn pid(&self) -> u32 {
        self.request.pid()
    }
}
