use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::memory::{Allocator, BufferType, HeapAllocator, MemfdAllocator};

/// Environment variable holding debug flags for the buffer service.
pub const BUFFER_DEBUG_ENV: &str = "CODECBUF_BUFFER_DEBUG";

/// Log every buffer operation at trace level.
pub const BUFFER_DEBUG_OPS: u32 = 1 << 0;
/// Forcibly reclaim buffers still in use when their group is destroyed.
pub const BUFFER_DEBUG_CLEAR_ON_EXIT: u32 = 1 << 1;

/// Configuration of a `BufferService`.
#[derive(Clone)]
pub struct ServiceConfig {
    pub(super) clear_on_exit: bool,
    pub(super) log_ops: bool,
    pub(super) history_size: usize,
    allocators: BTreeMap<BufferType, Arc<dyn Allocator>>,
}

impl ServiceConfig {
    /// Number of operations remembered by each group.
    pub const DEFAULT_HISTORY_SIZE: usize = 256;

    /// Default configuration: heap memory for `BufferType::Normal`, memory
    /// files for every other type.
    pub fn new() -> Self {
        let heap: Arc<dyn Allocator> = Arc::new(HeapAllocator);
        let memfd: Arc<dyn Allocator> = Arc::new(MemfdAllocator::default());
        let allocators = BufferType::ALL
            .iter()
            .map(|&t| match t {
                BufferType::Normal => (t, Arc::clone(&heap)),
                _ => (t, Arc::clone(&memfd)),
            })
            .collect();

        ServiceConfig {
            clear_on_exit: false,
            log_ops: false,
            history_size: Self::DEFAULT_HISTORY_SIZE,
            allocators,
        }
    }

    /// Default configuration, with debug flags read from the
    /// `CODECBUF_BUFFER_DEBUG` environment variable.
    pub fn from_env() -> Self {
        let flags = crate::env_flags(BUFFER_DEBUG_ENV);

        ServiceConfig::new()
            .log_ops(flags & BUFFER_DEBUG_OPS != 0)
            .clear_on_exit(flags & BUFFER_DEBUG_CLEAR_ON_EXIT != 0)
    }

    /// Whether destroying a group with buffers still in use frees them right
    /// away instead of keeping the group around as an orphan.
    pub fn clear_on_exit(self, clear_on_exit: bool) -> Self {
        ServiceConfig {
            clear_on_exit,
            ..self
        }
    }

    pub fn log_ops(self, log_ops: bool) -> Self {
        ServiceConfig { log_ops, ..self }
    }

    /// Number of operations each group remembers for diagnostics. Zero
    /// disables the history.
    pub fn history_size(self, history_size: usize) -> Self {
        ServiceConfig {
            history_size,
            ..self
        }
    }

    /// Use `allocator` for all groups of type `buffer_type` created from now
    /// on.
    pub fn with_allocator(mut self, buffer_type: BufferType, allocator: Arc<dyn Allocator>) -> Self {
        self.allocators.insert(buffer_type, allocator);
        self
    }

    pub(super) fn allocator(&self, buffer_type: BufferType) -> Arc<dyn Allocator> {
        match self.allocators.get(&buffer_type) {
            Some(allocator) => Arc::clone(allocator),
            // All types are populated by `new()`, and entries are never removed.
            None => Arc::new(HeapAllocator),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig::new()
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("clear_on_exit", &self.clear_on_exit)
            .field("log_ops", &self.log_ops)
            .field("history_size", &self.history_size)
            .field("allocators", &self.allocators.keys().collect::<Vec<_>>())
            .finish()
    }
}
