//! Abstracts the backends that provide the memory behind buffers.
//!
//! Hardware codecs can work with memory coming from several places: plain
//! process memory for software paths, or file descriptors exported by a
//! kernel allocator (ion, DRM, dma-heap, a V4L2 device) for everything the
//! hardware needs to access directly. The `BufferType` enum lists these
//! backends, and the `Allocator` trait is the table of operations a buffer
//! group calls into for the backend it has been created with:
//!
//! * `alloc`/`free` for memory the group allocates and owns itself
//!   (`BufferMode::Internal`),
//! * `import`/`release` for memory allocated elsewhere and committed to the
//!   group (`BufferMode::External`).
//!
//! Each allocation is represented by a `Memory` object, which reports its
//! size and file descriptor (if it has one) and allows CPU access for
//! debugging and software paths.
//!
//! Two reference allocators are provided: `HeapAllocator`, backed by process
//! memory, and `MemfdAllocator`, which hands out anonymous memory files that
//! behave like the file descriptors exported by kernel allocators.
mod heap;
mod memfd;

pub use heap::*;
pub use memfd::*;

use std::fmt::Debug;
use std::io;
use std::os::unix::io::{AsFd, RawFd};

use enumn::N;
use nix::errno::Errno;
use thiserror::Error;

/// All the supported memory backends.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
pub enum BufferType {
    /// Plain process memory.
    Normal = 0,
    Ion = 1,
    V4l2 = 2,
    Drm = 3,
}

impl BufferType {
    pub const ALL: [BufferType; 4] = [
        BufferType::Normal,
        BufferType::Ion,
        BufferType::V4l2,
        BufferType::Drm,
    ];
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("cannot allocate a zero-sized buffer")]
    ZeroSize,
    #[error("out of memory while allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("system error: {0}")]
    Sys(#[from] Errno),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single allocation obtained from an `Allocator`.
pub trait Memory: Debug + Send {
    /// Size of the allocation in bytes.
    fn len(&self) -> usize;

    /// Make Clippy happy.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File descriptor that can be passed to hardware, for backends that have
    /// one.
    fn as_raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Copy the content of the allocation starting at `offset` into `buf`.
    /// Returns the number of bytes copied.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<usize>;

    /// Copy `data` into the allocation starting at `offset`. Returns the
    /// number of bytes copied.
    fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<usize>;
}

/// Memory allocated outside of a buffer group that can be committed to it.
/// Any type that can provide a file descriptor is valid.
pub trait ImportSource: AsFd + Debug {
    /// Size of the memory behind the file descriptor.
    fn len(&self) -> u64;

    /// Make Clippy happy.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImportSource for std::fs::File {
    fn len(&self) -> u64 {
        match self.metadata() {
            Err(_) => {
                log::warn!("Failed to compute File size for import, using 0...");
                0
            }
            Ok(m) => m.len(),
        }
    }
}

/// Table of operations of a memory backend.
///
/// `free` and `release` are called before the `Memory` is dropped and give
/// the backend a chance to fail, in which case the buffer is kept alive and
/// the error reported to the caller.
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes owned by the calling group.
    fn alloc(&self, size: usize) -> Result<Box<dyn Memory>, AllocatorError>;

    /// Give back memory obtained through `alloc`.
    fn free(&self, memory: &mut dyn Memory) -> Result<(), AllocatorError>;

    /// Wrap externally allocated memory. The source remains owned by the
    /// caller; the returned `Memory` holds its own reference to it.
    fn import(&self, source: &dyn ImportSource) -> Result<Box<dyn Memory>, AllocatorError>;

    /// Give back memory obtained through `import`.
    fn release(&self, memory: &mut dyn Memory) -> Result<(), AllocatorError>;
}
