//! Multi-threaded session implementation
//!
//! This module provides a multi-threaded session loop for FUSE filesystems,
//! based on the design from libfuse's fuse_loop_mt: start with exactly one
//! worker thread, have a worker spawn a sibling just before it blocks on its
//! next read if it was the last idle thread and the pool is below its
//! ceiling, and optionally cull idle threads above a floor. `FORGET` and
//! `BATCH_FORGET` never trigger growth since they carry no reply the caller
//! is waiting on.

use libc::{EAGAIN, EINTR, ENODEV, ENOENT};
use log::{debug, error, info, warn};
use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::ll::fuse_abi::fuse_opcode::{FUSE_BATCH_FORGET, FUSE_FORGET};
use crate::request::Request;
use crate::session::{aligned_sub_buf, Session, BUFFER_SIZE};
use crate::Filesystem;

/// Default maximum number of worker threads
const DEFAULT_MAX_THREADS: usize = 10;

/// Default maximum idle threads (-1 means thread destruction is disabled)
const DEFAULT_MAX_IDLE_THREADS: i32 = -1;

/// Maximum reasonable number of threads to prevent resource exhaustion
const MAX_THREADS_LIMIT: usize = 100_000;

/// Configuration for the multi-threaded session loop
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    /// Maximum number of worker threads. `1` collapses the loop to single-threaded.
    pub(crate) max_threads: usize,
    /// Maximum number of idle threads before they are destroyed.
    /// Set to -1 to disable thread culling.
    pub(crate) max_idle_threads: i32,
    /// Whether to clone the `/dev/fuse` fd for each worker thread.
    pub(crate) clone_fd: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            max_idle_threads: DEFAULT_MAX_IDLE_THREADS,
            clone_fd: false,
        }
    }
}

impl SessionConfig {
    #[allow(dead_code)]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub(crate) fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.clamp(1, MAX_THREADS_LIMIT);
        self
    }

    #[allow(dead_code)]
    pub(crate) fn max_idle_threads(mut self, max_idle_threads: i32) -> Self {
        self.max_idle_threads = max_idle_threads;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn clone_fd(mut self, clone_fd: bool) -> Self {
        self.clone_fd = clone_fd;
        self
    }

    pub(crate) fn validate(&self) -> io::Result<()> {
        if self.max_threads == 0 || self.max_threads > MAX_THREADS_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("max_threads must be between 1 and {}", MAX_THREADS_LIMIT),
            ));
        }
        Ok(())
    }

    pub(crate) fn is_single_threaded(&self) -> bool {
        self.max_threads == 1
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
    id: usize,
}

impl Worker {
    fn new(id: usize, thread: JoinHandle<()>) -> Self {
        Self {
            thread: Some(thread),
            id,
        }
    }
}

/// Shared state for the multi-threaded session
struct MtState {
    num_workers: AtomicUsize,
    num_available: AtomicUsize,
    exit: AtomicBool,
    inner: Mutex<MtStateInner>,
    cvar: Condvar,
}

struct MtStateInner {
    workers: Vec<Worker>,
    error: Option<io::Error>,
}

impl MtState {
    fn new() -> Self {
        Self {
            num_workers: AtomicUsize::new(0),
            num_available: AtomicUsize::new(0),
            exit: AtomicBool::new(false),
            inner: Mutex::new(MtStateInner {
                workers: Vec::new(),
                error: None,
            }),
            cvar: Condvar::new(),
        }
    }
}

/// `UnsafeCell` wrapper that is `Sync` whenever `T` is, so `Arc<SyncUnsafeCell<T>>` can be
/// shared across worker threads. Safe to use here because every `Filesystem` method but
/// `init`/`destroy` takes `&self`, and those two only ever run while a single worker is alive
/// (the pool only grows once `Session::initialized` is set, and the session drops before any
/// worker can call `destroy` concurrently with another op).
struct SyncUnsafeCell<T>(UnsafeCell<T>);

impl<T> SyncUnsafeCell<T> {
    fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    fn get(&self) -> *mut T {
        self.0.get()
    }
}

unsafe impl<T: Send> Send for SyncUnsafeCell<T> {}
unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

/// Runs a `Session`'s request loop across a pool of OS threads that grows and shrinks on demand.
pub(crate) struct MtSession<FS: Filesystem> {
    state: Arc<MtState>,
    config: SessionConfig,
    session: Arc<SyncUnsafeCell<Session<FS>>>,
    worker_counter: Arc<AtomicUsize>,
}

impl<FS: Filesystem> std::fmt::Debug for MtSession<FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtSession").field("config", &self.config).finish()
    }
}

impl<FS: Filesystem> MtSession<FS> {
    /// Requests all workers to exit.
    pub(crate) fn exit(&self) {
        self.state.exit.store(true, Ordering::Release);
        let _unused = self.state.inner.lock();
        self.state.cvar.notify_all();
    }
}

impl<FS: Filesystem + Send + Sync + 'static> MtSession<FS> {
    /// Wraps an already-mounted `Session` for multi-threaded dispatch.
    pub(crate) fn from_session(session: Session<FS>, config: SessionConfig) -> io::Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(MtState::new()),
            config,
            session: Arc::new(SyncUnsafeCell::new(session)),
            worker_counter: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Runs the session loop until the filesystem is unmounted or a worker hits a fatal error.
    pub(crate) fn run(&self) -> io::Result<()> {
        let mode = if self.config.is_single_threaded() {
            "single-threaded"
        } else {
            "multi-threaded"
        };
        info!(
            "Starting {} FUSE session (max {} threads)",
            mode, self.config.max_threads
        );

        // Start with exactly one worker thread, like libfuse does. Additional threads are
        // spawned on demand once every running worker is busy.
        self.start_worker()?;

        let mut inner = self.state.inner.lock().unwrap();
        while self.state.num_workers.load(Ordering::Acquire) > 0 {
            if self.state.exit.load(Ordering::Acquire) && inner.workers.is_empty() {
                break;
            }
            inner = self.state.cvar.wait(inner).unwrap();
        }

        let result = match inner.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        drop(inner);

        info!("{} FUSE session ended", mode);
        result
    }

    fn channel(&self) -> crate::channel::Channel {
        unsafe { &*self.session.get() }.ch.clone()
    }

    fn start_worker(&self) -> io::Result<()> {
        let worker_id = self.worker_counter.fetch_add(1, Ordering::SeqCst);
        self.state.num_workers.fetch_add(1, Ordering::SeqCst);

        let channel = if self.config.clone_fd {
            self.channel().clone_fd().unwrap_or_else(|e| {
                warn!(
                    "Failed to clone fd for worker {}, sharing the main fd: {}",
                    worker_id, e
                );
                self.channel()
            })
        } else {
            self.channel()
        };

        let ctx = WorkerCtx {
            state: self.state.clone(),
            config: self.config.clone(),
            session: self.session.clone(),
            worker_counter: self.worker_counter.clone(),
            master_channel: self.channel(),
        };

        let res = thread::Builder::new()
            .name(format!("fuse-worker-{}", worker_id))
            .spawn(move || worker_main(worker_id, channel, ctx));

        match res {
            Ok(thread) => {
                let mut inner = self.state.inner.lock().unwrap();
                inner.workers.push(Worker::new(worker_id, thread));
                debug!("Worker {} started", worker_id);
                Ok(())
            }
            Err(e) => {
                self.state.num_workers.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Everything a worker needs to spawn a sibling, shared by cheap `Arc` clone.
struct WorkerCtx<FS: Filesystem> {
    state: Arc<MtState>,
    config: SessionConfig,
    session: Arc<SyncUnsafeCell<Session<FS>>>,
    worker_counter: Arc<AtomicUsize>,
    master_channel: crate::channel::Channel,
}

impl<FS: Filesystem> Clone for WorkerCtx<FS> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            config: self.config.clone(),
            session: self.session.clone(),
            worker_counter: self.worker_counter.clone(),
            master_channel: self.master_channel.clone(),
        }
    }
}

fn spawn_sibling<FS: Filesystem + Send + Sync + 'static>(ctx: &WorkerCtx<FS>, current_total: usize) {
    if current_total >= ctx.config.max_threads {
        return;
    }
    let new_id = ctx.worker_counter.fetch_add(1, Ordering::Relaxed);
    ctx.state.num_workers.fetch_add(1, Ordering::SeqCst);
    debug!("spawning helper worker {}", new_id);

    let channel = if ctx.config.clone_fd {
        ctx.master_channel
            .clone_fd()
            .unwrap_or_else(|_| ctx.master_channel.clone())
    } else {
        ctx.master_channel.clone()
    };

    let child_ctx = ctx.clone();
    let builder = thread::Builder::new().name(format!("fuse-worker-{}", new_id));
    match builder.spawn(move || worker_main(new_id, channel, child_ctx)) {
        Ok(t) => {
            let mut inner = ctx.state.inner.lock().unwrap();
            inner.workers.push(Worker::new(new_id, t));
        }
        Err(e) => {
            error!("Failed to spawn helper worker: {}", e);
            ctx.state.num_workers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn worker_main<FS: Filesystem + Send + Sync + 'static>(
    worker_id: usize,
    channel: crate::channel::Channel,
    ctx: WorkerCtx<FS>,
) {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut self_cleaned = false;

    loop {
        if ctx.state.exit.load(Ordering::Relaxed) {
            debug!("Worker {} exiting (session exit)", worker_id);
            break;
        }

        // About to block on a read: announce ourselves as idle.
        ctx.state.num_available.fetch_add(1, Ordering::Release);

        let buf = aligned_sub_buf(
            &mut buffer,
            std::mem::align_of::<crate::ll::fuse_abi::fuse_in_header>(),
        );
        let res = channel.receive(buf);

        let prev_idle = ctx.state.num_available.fetch_sub(1, Ordering::Acquire);

        let size = match res {
            Ok(s) => s,
            Err(e) => match e.raw_os_error() {
                Some(ENOENT) | Some(EINTR) | Some(EAGAIN) => continue,
                Some(ENODEV) => {
                    debug!("Worker {} exiting (ENODEV)", worker_id);
                    ctx.state.exit.store(true, Ordering::Release);
                    let _unused = ctx.state.inner.lock();
                    ctx.state.cvar.notify_all();
                    break;
                }
                _ => {
                    error!("Worker {} error receiving request: {}", worker_id, e);
                    let mut inner = ctx.state.inner.lock().unwrap();
                    inner.error = Some(e);
                    ctx.state.exit.store(true, Ordering::Release);
                    ctx.state.cvar.notify_all();
                    break;
                }
            },
        };

        // If we were the last idle worker, consider growing the pool before doing anything
        // else, so a burst of concurrent requests doesn't have to wait on this one.
        if prev_idle <= 1 {
            let is_forget = size >= std::mem::size_of::<crate::ll::fuse_abi::fuse_in_header>() && {
                let header =
                    unsafe { &*(buf.as_ptr() as *const crate::ll::fuse_abi::fuse_in_header) };
                header.opcode == FUSE_FORGET as u32 || header.opcode == FUSE_BATCH_FORGET as u32
            };
            let initialized = unsafe { &*ctx.session.get() }.initialized;
            if !is_forget && initialized {
                let current_workers = ctx.state.num_workers.load(Ordering::Relaxed);
                spawn_sibling(&ctx, current_workers);
            }
        }

        if let Some(req) = Request::new(channel.sender(), &buf[..size]) {
            // SAFETY: see `SyncUnsafeCell`'s doc comment.
            let se: &mut Session<FS> = unsafe { &mut *ctx.session.get() };
            req.dispatch(se);
        }

        if ctx.config.max_idle_threads != -1 {
            let current_idle = ctx.state.num_available.load(Ordering::Relaxed);
            if current_idle > ctx.config.max_idle_threads as usize {
                let mut inner = ctx.state.inner.lock().unwrap();
                let recheck_idle = ctx.state.num_available.load(Ordering::Relaxed);
                let recheck_workers = ctx.state.num_workers.load(Ordering::Relaxed);
                if recheck_idle > ctx.config.max_idle_threads as usize && recheck_workers > 1 {
                    if let Some(pos) = inner.workers.iter().position(|w| w.id == worker_id) {
                        inner.workers.remove(pos);
                    }
                    ctx.state.num_workers.fetch_sub(1, Ordering::SeqCst);
                    ctx.state.num_available.fetch_sub(1, Ordering::SeqCst);
                    self_cleaned = true;
                    debug!(
                        "Worker {} exiting (idle threads: {} > max: {})",
                        worker_id, recheck_idle, ctx.config.max_idle_threads
                    );
                    break;
                }
            }
        }
    }

    if !self_cleaned {
        let mut inner = ctx.state.inner.lock().unwrap();
        if let Some(pos) = inner.workers.iter().position(|w| w.id == worker_id) {
            inner.workers.remove(pos);
        }
        ctx.state.num_workers.fetch_sub(1, Ordering::SeqCst);
    }

    ctx.state.cvar.notify_all();
}

impl<FS: Filesystem> Drop for MtSession<FS> {
    fn drop(&mut self) {
        self.exit();
        let workers = {
            let mut inner = self.state.inner.lock().unwrap();
            std::mem::take(&mut inner.workers)
        };
        for worker in workers {
            if let Some(thread) = worker.thread {
                let _ = thread.join();
            }
        }
    }
}
