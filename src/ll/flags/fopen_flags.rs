//! Flags returned in open response.

pub use crate::ll::fuse_abi::FopenFlags;
