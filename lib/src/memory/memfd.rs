//! File-descriptor backed memory.
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};

use log::trace;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use super::*;

/// Memory accessible through a file descriptor, either created by
/// `MemfdAllocator` or duplicated from an imported source.
#[derive(Debug)]
pub struct FdMemory {
    file: File,
    len: usize,
}

impl FdMemory {
    /// Duplicate the file descriptor of `source` so the returned memory does
    /// not depend on the source's lifetime.
    pub fn import(source: &dyn ImportSource) -> Result<Self, AllocatorError> {
        let len = source.len() as usize;
        if len == 0 {
            return Err(AllocatorError::ZeroSize);
        }

        let fd = source.as_fd().try_clone_to_owned()?;

        Ok(FdMemory {
            file: File::from(fd),
            len,
        })
    }
}

impl AsFd for FdMemory {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl ImportSource for FdMemory {
    fn len(&self) -> u64 {
        self.len as u64
    }
}

impl Memory for FdMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn as_raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        let avail = self.len.saturating_sub(offset);
        let len = std::cmp::min(avail, buf.len());
        if len == 0 {
            return Ok(0);
        }

        self.file.read_exact_at(&mut buf[..len], offset as u64)?;
        Ok(len)
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<usize> {
        let avail = self.len.saturating_sub(offset);
        let len = std::cmp::min(avail, data.len());
        if len == 0 {
            return Ok(0);
        }

        self.file.write_all_at(&data[..len], offset as u64)?;
        Ok(len)
    }
}

/// Allocator handing out anonymous memory files. Used by default for every
/// backend that passes file descriptors to the hardware.
#[derive(Debug)]
pub struct MemfdAllocator {
    name: String,
}

impl MemfdAllocator {
    /// Create an allocator naming its files `name`, which shows up in
    /// `/proc/<pid>/fd` and helps tracking leaks.
    pub fn new(name: &str) -> Self {
        MemfdAllocator {
            name: name.to_string(),
        }
    }
}

impl Default for MemfdAllocator {
    fn default() -> Self {
        MemfdAllocator::new("codecbuf")
    }
}

impl Allocator for MemfdAllocator {
    fn alloc(&self, size: usize) -> Result<Box<dyn Memory>, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::ZeroSize);
        }

        let name = CString::new(self.name.as_str()).unwrap_or_default();
        let fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)?;
        let file = File::from(fd);
        file.set_len(size as u64)?;

        trace!("memfd {} allocated, {} bytes", file.as_raw_fd(), size);

        Ok(Box::new(FdMemory { file, len: size }))
    }

    fn free(&self, _memory: &mut dyn Memory) -> Result<(), AllocatorError> {
        Ok(())
    }

    fn import(&self, source: &dyn ImportSource) -> Result<Box<dyn Memory>, AllocatorError> {
        Ok(Box::new(FdMemory::import(source)?))
    }

    fn release(&self, _memory: &mut dyn Memory) -> Result<(), AllocatorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfd_alloc() {
        let allocator = MemfdAllocator::default();
        let mut memory = allocator.alloc(4096).unwrap();
        assert_eq!(memory.len(), 4096);
        assert!(memory.as_raw_fd().is_some());

        assert_eq!(memory.write_at(4094, b"abcd").unwrap(), 2);
        let mut buf = [0u8; 4];
        assert_eq!(memory.read_at(4092, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"\0\0ab");
    }

    #[test]
    fn test_memfd_import() {
        let allocator = MemfdAllocator::default();
        let mut exported = allocator.alloc(16).unwrap();
        exported.write_at(0, b"shared").unwrap();

        // Import through a duplicated descriptor; the two views share content.
        let fd = exported.as_raw_fd().unwrap();
        let source = FdMemory {
            file: File::from(
                unsafe { std::os::unix::io::BorrowedFd::borrow_raw(fd) }
                    .try_clone_to_owned()
                    .unwrap(),
            ),
            len: 16,
        };
        let imported = allocator.import(&source).unwrap();
        assert_eq!(imported.len(), 16);
        assert_ne!(imported.as_raw_fd(), Some(fd));

        drop(source);
        let mut buf = [0u8; 6];
        imported.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
    }
}
