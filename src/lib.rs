//! A userspace passthrough filesystem: mounts a source directory through
//! FUSE, forwarding every operation back onto the source tree via
//! descriptor-relative syscalls.

pub mod cache;
pub mod config;
pub mod error;
pub mod inode;
pub mod owned;
pub mod passthrough_fs;
pub mod reply;
pub mod syscalls;

pub use config::Options;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use passthrough_fs::PassthroughFs;
