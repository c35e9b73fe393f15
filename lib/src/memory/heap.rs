//! Process memory allocator.
use std::io;

use super::*;

/// Memory obtained from the process heap.
#[derive(Debug)]
pub struct HeapMemory(Box<[u8]>);

impl HeapMemory {
    pub fn new(size: usize) -> Result<Self, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::ZeroSize);
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| AllocatorError::OutOfMemory(size))?;
        data.resize(size, 0u8);

        Ok(HeapMemory(data.into_boxed_slice()))
    }
}

impl AsRef<[u8]> for HeapMemory {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for HeapMemory {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Memory for HeapMemory {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        let src = self.0.get(offset..).unwrap_or_default();
        let len = std::cmp::min(src.len(), buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        Ok(len)
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<usize> {
        let dst = self.0.get_mut(offset..).unwrap_or_default();
        let len = std::cmp::min(dst.len(), data.len());
        dst[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}

/// Allocator for `BufferType::Normal`. Allocations come from the heap, and
/// imported file descriptors are duplicated like `MemfdAllocator` does.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Result<Box<dyn Memory>, AllocatorError> {
        Ok(Box::new(HeapMemory::new(size)?))
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
