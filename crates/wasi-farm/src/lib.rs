//! Share one WASI file descriptor table across threads.
//!
//! One [`FarmPark`] owns the real descriptor table and executes every
//! operation; any number of [`FarmRef`] handles, each potentially living on
//! its own thread, issue syscall-shaped requests purely through atomic
//! reads and writes on shared buffers: a per-fd lock/doorbell table, a
//! per-fd fixed-layout call frame, and a bump-allocated payload arena.
//!
//! ```
//! use wasi_farm::{
//!     FarmConfig, FarmPark, FdEntry, FdFlags, Iovec, LookupFlags, OFlags, Rights, VirtDir,
//! };
//! use std::sync::Arc;
//!
//! let root = VirtDir::new();
//! root.put_file("hello.txt", b"Hello, world!").unwrap();
//! let park = FarmPark::spawn(
//!     vec![FdEntry::preopen(Arc::new(root), ".")],
//!     FarmConfig::default(),
//! )
//! .unwrap();
//!
//! let farm = park.handle();
//! let fd = farm
//!     .path_open(
//!         0,
//!         LookupFlags::empty(),
//!         "hello.txt",
//!         OFlags::empty(),
//!         Rights::FD_READ,
//!         Rights::empty(),
//!         FdFlags::empty(),
//!     )
//!     .unwrap();
//! let (nread, data) = farm.fd_read(fd, &[Iovec { buf: 0, buf_len: 13 }]).unwrap();
//! assert_eq!((nread, data.as_slice()), (13, &b"Hello, world!"[..]));
//! ```

#![deny(trivial_numeric_casts, unused_extern_crates, unstable_features)]
#![warn(unused_import_braces)]

mod alloc;
mod channel;
mod closes;
mod config;
mod error;
mod farm_ref;
mod fd;
mod park;
mod shm;
mod spawn;
mod table;
mod types;
pub mod virtfs;
mod wait;
pub mod wire;

pub use alloc::{Arena, Lease};
pub use config::FarmConfig;
pub use error::{Errno, Error, ErrorExt, Result};
pub use farm_ref::{FarmRef, RefId};
pub use fd::WasiFd;
pub use park::FarmPark;
pub use spawn::{WorkerBackground, WorkerBackgroundRef, WorkerId};
pub use table::{FdEntry, FdTable};
pub use types::{
    Advice, FdFlags, Fdstat, FileType, Filestat, FstFlags, Iovec, LookupFlags, OFlags, Prestat,
    ReaddirCursor, ReaddirEntity, Rights, Whence,
};
pub use virtfs::{VirtDir, VirtFile};
pub use wait::{WaitQueue, WaitResult};
