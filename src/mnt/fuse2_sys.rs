//! Native FFI bindings to libfuse2.
//!
//! This is a small set of bindings that are required to mount/unmount FUSE filesystems.
#![warn(missing_debug_implementations)]
#![allow(missing_docs)]
#![allow(non_camel_case_types)]

use libc::c_char;
use libc::c_int;

/// Mirrors `struct fuse_args` from `<fuse_opt.h>`: an argv-style argument list
/// passed to libfuse's mount helpers.
#[repr(C)]
pub(crate) struct fuse_args {
    pub(crate) argc: c_int,
    pub(crate) argv: *const *const c_char,
    pub(crate) allocated: c_int,
}

unsafe extern "C" {
    // Declared in <fuse_common_compat.h>; mounts via the setuid fusermount
    // helper and returns an open fd to /dev/fuse, or -1 on failure.
    pub(crate) fn fuse_mount_compat25(mountpoint: *const c_char, args: *const fuse_args) -> c_int;
}
