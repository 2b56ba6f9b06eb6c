//! Filesystem session
//!
//! A session runs a filesystem implementation while it is being mounted to a specific mount
//! point. A session begins by mounting the filesystem and ends by unmounting it. While the
//! filesystem is mounted, the session loop receives, dispatches and replies to kernel requests
//! for filesystem operations under its mount point.

use dashmap::DashMap;
use log::info;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::channel::Channel;
use crate::mnt::mount_options::Config;
use crate::mnt::unmount_options::UnmountOption;
use crate::mnt::Mount;
use crate::session_mt::{MtSession, SessionConfig};
use crate::Filesystem;

/// The max size of write requests from the kernel. The absolute minimum is 4k,
/// FUSE recommends at least 128k, max 16M. The FUSE default is 16M on macOS
/// and 128k on other systems.
pub(crate) const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the buffer for reading a request from the kernel. Since the kernel may send
/// up to MAX_WRITE_SIZE bytes in a write request, we use that value plus some extra space.
pub(crate) const BUFFER_SIZE: usize = MAX_WRITE_SIZE + 4096;

/// Shifts `buf` forward until its start satisfies `alignment`, so a `fuse_in_header` can be
/// read out of it without an unaligned load.
pub(crate) fn aligned_sub_buf(buf: &mut [u8], alignment: usize) -> &mut [u8] {
    let off = alignment - (buf.as_ptr() as usize) % alignment;
    if off == alignment {
        buf
    } else {
        &mut buf[off..]
    }
}

/// Who besides the user that started the session may access the mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionACL {
    /// Only the session owner may access the filesystem
    Owner,
    /// Only the session owner and root may access the filesystem
    #[default]
    RootAndOwner,
    /// Any user may access the filesystem
    All,
}

impl SessionACL {
    pub(crate) fn to_mount_option(self) -> Option<&'static str> {
        match self {
            SessionACL::Owner => None,
            SessionACL::RootAndOwner => Some("allow_root"),
            SessionACL::All => Some("allow_other"),
        }
    }
}

/// The session data structure.
///
/// Most `Filesystem` methods take `&self`, so once a session is running, worker threads share
/// it through `MtSession` and call into it concurrently; only `init`/`destroy` need exclusive
/// access, and those only ever happen while a single worker is alive (see `session_mt`).
pub struct Session<FS: Filesystem> {
    /// Filesystem operation implementations
    pub(crate) filesystem: FS,
    /// Communication channel to the kernel driver
    pub(crate) ch: Channel,
    /// Mountpoint and RAII mount guard, held so drop order unmounts then closes the fd
    pub(crate) mount: Arc<Mutex<Option<(PathBuf, Mount)>>>,
    /// Uid of the user that called `mount()`
    pub(crate) session_owner: u32,
    /// FUSE protocol major version
    pub(crate) proto_major: u32,
    /// FUSE protocol minor version
    pub(crate) proto_minor: u32,
    /// True if the filesystem is initialized (init operation done)
    pub(crate) initialized: bool,
    /// True if the filesystem was destroyed (destroy operation done)
    pub(crate) destroyed: bool,
    /// Who is allowed to access this filesystem
    pub(crate) allowed: SessionACL,
    /// Worker pool shape to run with, resolved from the `Config` passed to `new`
    pub(crate) session_config: SessionConfig,
    /// Cancellation tokens for requests currently dispatched, keyed by the wire
    /// `unique` id. `INTERRUPT(unique)` looks a target up here and flips its
    /// token; the reply path for the target request checks it before writing
    /// to the device so an interrupted request's reply is silently dropped.
    pub(crate) inflight: Arc<DashMap<u64, Arc<AtomicBool>>>,
    /// Shared counter handed to every `Notifier` this session gives out, so
    /// `retrieve` ids stay unique across all of them.
    pub(crate) retrieve_counter: Arc<std::sync::atomic::AtomicU64>,
}

impl<FS: Filesystem> fmt::Debug for Session<FS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_owner", &self.session_owner)
            .field("proto_major", &self.proto_major)
            .field("proto_minor", &self.proto_minor)
            .field("initialized", &self.initialized)
            .field("destroyed", &self.destroyed)
            .field("allowed", &self.allowed)
            .finish()
    }
}

impl<FS: Filesystem> Session<FS> {
    /// Create a new session by mounting the given filesystem to the given mountpoint
    pub fn new(filesystem: FS, mountpoint: &Path, config: &Config) -> io::Result<Session<FS>> {
        let allowed = config.acl;
        let (dev_fuse, mount) = Mount::new(mountpoint, &config.mount_options, allowed)?;
        let ch = Channel::new(dev_fuse);
        let session_config = SessionConfig::default()
            .max_threads(config.n_threads.unwrap_or(1))
            .clone_fd(config.clone_fd);
        Ok(Session {
            filesystem,
            ch,
            mount: Arc::new(Mutex::new(Some((mountpoint.to_path_buf(), mount)))),
            session_owner: unsafe { libc::geteuid() },
            proto_major: 0,
            proto_minor: 0,
            initialized: false,
            destroyed: false,
            allowed,
            session_config,
            inflight: Arc::new(DashMap::new()),
            retrieve_counter: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        })
    }

    /// Return path of the mounted filesystem
    pub fn mountpoint(&self) -> PathBuf {
        self.mount
            .lock()
            .unwrap()
            .as_ref()
            .map(|(path, _)| path.clone())
            .unwrap_or_default()
    }

    /// An outbound notification channel to the kernel for this session, independent of any
    /// in-flight request. Connectors attach this to their `Mount` so invalidation and
    /// delete notifications can be sent once the session starts serving.
    pub fn notifier(&self) -> crate::Notifier {
        crate::Notifier::new(self.ch.sender(), self.retrieve_counter.clone())
    }

    /// Run the session loop that receives kernel requests and dispatches them to method
    /// calls into the filesystem. This will not return until the filesystem is unmounted.
    ///
    /// The loop starts with a single worker thread and grows up to the `n_threads` ceiling
    /// from the `Config` this session was created with as concurrent requests arrive,
    /// following the same policy as libfuse's `fuse_loop_mt`.
    pub fn run(self) -> io::Result<()> {
        let config = self.session_config.clone();
        MtSession::from_session(self, config)?.run()
    }
}

impl<FS: 'static + Filesystem + Send + Sync> Session<FS> {
    /// Run the session loop in a background thread
    pub fn spawn(self) -> io::Result<BackgroundSession> {
        BackgroundSession::new(self)
    }
}

/// A handle to a session running in a background thread. Dropping it unmounts the filesystem
/// and waits for the session loop to end.
pub struct BackgroundSession {
    /// Path of the mounted filesystem
    pub mountpoint: PathBuf,
    /// Handle to the background thread, taken by `Drop` so it can be joined
    guard: Option<thread::JoinHandle<io::Result<()>>>,
    /// Shared handle to the live mount, so `SessionUnmounter` and `Drop` can race safely
    mount: Arc<Mutex<Option<(PathBuf, Mount)>>>,
}

impl BackgroundSession {
    /// Create a new background session for the given session by running its
    /// session loop in a background thread. If the returned handle is dropped,
    /// the filesystem is unmounted and the given session ends.
    pub fn new<FS: Filesystem + Send + Sync + 'static>(se: Session<FS>) -> io::Result<BackgroundSession> {
        let mountpoint = se.mountpoint();
        let mount = se.mount.clone();
        let guard = thread::Builder::new()
            .name("fuse-session".to_owned())
            .spawn(move || se.run())?;
        Ok(BackgroundSession {
            mountpoint,
            guard: Some(guard),
            mount,
        })
    }

    /// Returns an object that can be used to unmount the session this `BackgroundSession`
    /// belongs to, without waiting for the filesystem to be otherwise idle.
    pub fn unmount_callable(&self) -> SessionUnmounter {
        SessionUnmounter {
            mount: self.mount.clone(),
        }
    }

    /// Unmounts the filesystem and waits for the session loop to end.
    ///
    /// On success this consumes `self`. If the unmount fails in a way the kernel considers
    /// recoverable (for example `EBUSY` because a file under the mount is still open), the
    /// session is handed back unharmed so the caller can retry once whatever is holding it
    /// open goes away.
    pub fn umount_and_join(mut self, flags: &[UnmountOption]) -> Result<(), (Self, io::Error)> {
        let taken = self.mount.lock().unwrap().take();
        let (path, mount) = match taken {
            Some(v) => v,
            None => {
                if let Some(guard) = self.guard.take() {
                    let _ = guard.join();
                }
                return Ok(());
            }
        };
        match mount.umount(flags) {
            Ok(()) => {
                if let Some(guard) = self.guard.take() {
                    let _ = guard.join();
                }
                Ok(())
            }
            Err((salvaged, err)) => {
                *self.mount.lock().unwrap() = salvaged.map(|m| (path, m));
                Err((self, err))
            }
        }
    }
}

/// A handle that can unmount the filesystem of a running session from another thread.
#[derive(Debug)]
pub struct SessionUnmounter {
    mount: Arc<Mutex<Option<(PathBuf, Mount)>>>,
}

impl SessionUnmounter {
    /// Unmounts the filesystem
    pub fn unmount(&mut self) -> io::Result<()> {
        unmount(&self.mount)
    }
}

fn unmount(mount: &Arc<Mutex<Option<(PathBuf, Mount)>>>) -> io::Result<()> {
    let taken = mount.lock().unwrap().take();
    if let Some((_, mount)) = taken {
        mount
            .umount(&[] as &[UnmountOption])
            .map_err(|(_, err)| err)?;
    }
    Ok(())
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        info!("Unmounting {}", self.mountpoint.display());
        if let Err(err) = unmount(&self.mount) {
            log::error!("Failed to unmount {}: {}", self.mountpoint.display(), err);
        }
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }
}

impl fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackgroundSession {{ mountpoint: {:?} }}",
            self.mountpoint
        )
    }
}
