//! Bookkeeping of a single buffer group.
//!
//! A group owns its buffers and keeps each of them in exactly one of two
//! lists: `unused` (reference count of zero, ordered by the time they were
//! returned to the group) or `used`. All methods here assume the service
//! lock is held.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};
use std::panic::Location;
use std::sync::Arc;

use log::{error, trace};

use super::{BufferHandle, BufferMode, GroupId, GroupInfo, GroupLimits, ReleaseListener};
use crate::history::History;
use crate::memory::{Allocator, AllocatorError, BufferType, ImportSource, Memory};

/// Operations recorded into a group's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOp {
    Create,
    Commit,
    RefInc,
    RefDec,
    Discard,
    Destroy,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferRecord {
    pub buffer: u32,
    pub op: BufferOp,
    /// Reference count after the operation.
    pub ref_count: u32,
    pub caller: &'static Location<'static>,
}

impl fmt::Display for BufferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer {:<5} {:<8} ref {:<3} at {}",
            self.buffer,
            format!("{:?}", self.op),
            self.ref_count,
            self.caller
        )
    }
}

/// Where the memory of a new buffer comes from.
#[derive(Debug, Clone, Copy)]
pub enum BufferSource<'a> {
    /// Allocate that many bytes. Only valid for `BufferMode::Internal` groups.
    Alloc(usize),
    /// Import existing memory. Only valid for `BufferMode::External` groups.
    Import(&'a dyn ImportSource),
}

pub(super) struct Buffer {
    pub(super) handle: BufferHandle,
    pub(super) memory: Box<dyn Memory>,
    pub(super) size: usize,
    pub(super) index: i32,
    pub(super) ref_count: u32,
    pub(super) used: bool,
    pub(super) discard: bool,
    tag: String,
    caller: &'static Location<'static>,
    /// Key in the group's unused list while the buffer is there.
    unused_seq: Option<u64>,
}

/// What became of a buffer after one of its references was dropped.
pub(super) enum Released {
    StillReferenced,
    /// Back to the unused list. The listener to signal, if any, is returned
    /// so it can be called without the service lock held.
    Recycled(Option<Arc<dyn ReleaseListener>>),
    Destroyed,
}

/// Contract violations and backend errors detected at the group level.
pub(super) enum GroupError {
    UnknownBuffer(u32),
    NotReferenced(u32),
    Backend(AllocatorError),
}

impl From<AllocatorError> for GroupError {
    fn from(e: AllocatorError) -> Self {
        GroupError::Backend(e)
    }
}

pub(super) struct BufferGroup {
    pub(super) id: GroupId,
    pub(super) tag: String,
    pub(super) mode: BufferMode,
    pub(super) buffer_type: BufferType,
    allocator: Arc<dyn Allocator>,
    pub(super) limits: GroupLimits,
    usage: usize,
    buffers: BTreeMap<u32, Buffer>,
    unused: BTreeMap<u64, u32>,
    used: BTreeSet<u32>,
    next_seq: u64,
    pub(super) listener: Option<Arc<dyn ReleaseListener>>,
    pub(super) is_orphan: bool,
    pub(super) clear_on_exit: bool,
    log_ops: bool,
    history: History<BufferRecord>,
}

impl BufferGroup {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: GroupId,
        tag: &str,
        mode: BufferMode,
        buffer_type: BufferType,
        allocator: Arc<dyn Allocator>,
        clear_on_exit: bool,
        log_ops: bool,
        history_size: usize,
    ) -> Self {
        BufferGroup {
            id,
            tag: tag.to_string(),
            mode,
            buffer_type,
            allocator,
            limits: Default::default(),
            usage: 0,
            buffers: BTreeMap::new(),
            unused: BTreeMap::new(),
            used: BTreeSet::new(),
            next_seq: 0,
            listener: None,
            is_orphan: false,
            clear_on_exit,
            log_ops,
            history: History::new(history_size),
        }
    }

    pub(super) fn count(&self) -> usize {
        self.buffers.len()
    }

    pub(super) fn count_used(&self) -> usize {
        self.used.len()
    }

    pub(super) fn count_unused(&self) -> usize {
        self.unused.len()
    }

    pub(super) fn usage(&self) -> usize {
        self.usage
    }

    #[cfg(test)]
    pub(super) fn buffer_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.buffers.values().map(|b| b.size)
    }

    pub(super) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub(super) fn info(&self) -> GroupInfo {
        GroupInfo {
            id: self.id,
            tag: self.tag.clone(),
            mode: self.mode,
            buffer_type: self.buffer_type,
            limits: self.limits,
            count: self.count(),
            count_used: self.count_used(),
            count_unused: self.count_unused(),
            usage: self.usage,
            is_orphan: self.is_orphan,
        }
    }

    pub(super) fn get(&self, id: u32) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    pub(super) fn get_mut(&mut self, id: u32) -> Option<&mut Buffer> {
        self.buffers.get_mut(&id)
    }

    /// Returns whether one more buffer of `size` bytes fits within the
    /// group's limits.
    pub(super) fn fits(&self, size: usize) -> bool {
        let count_ok = self
            .limits
            .max_count
            .map_or(true, |max| self.count() < max);
        let size_ok = self
            .limits
            .max_size
            .map_or(true, |max| {
                self.usage
                    .checked_add(size)
                    .map_or(false, |total| total <= max)
            });

        count_ok && size_ok
    }

    fn record(
        &mut self,
        buffer: u32,
        op: BufferOp,
        ref_count: u32,
        caller: &'static Location<'static>,
    ) {
        if self.log_ops {
            trace!(
                "group {} buffer {} {:?} ref {} at {}",
                self.id,
                buffer,
                op,
                ref_count,
                caller
            );
        }

        self.history.push(BufferRecord {
            buffer,
            op,
            ref_count,
            caller,
        });
    }

    /// Create a new buffer from `source` and place it in the unused list.
    /// Nothing is changed if the backend fails.
    pub(super) fn create(
        &mut self,
        handle: BufferHandle,
        tag: &str,
        source: BufferSource,
        caller: &'static Location<'static>,
    ) -> Result<usize, AllocatorError> {
        let (memory, op) = match source {
            BufferSource::Alloc(size) => (self.allocator.alloc(size)?, BufferOp::Create),
            BufferSource::Import(source) => (self.allocator.import(source)?, BufferOp::Commit),
        };
        let size = memory.len();

        self.buffers.insert(
            handle.id(),
            Buffer {
                handle,
                memory,
                size,
                index: -1,
                ref_count: 0,
                used: false,
                discard: false,
                tag: tag.to_string(),
                caller,
                unused_seq: None,
            },
        );
        self.usage += size;
        self.push_unused(handle.id());
        self.record(handle.id(), op, 0, caller);

        Ok(size)
    }

    fn push_unused(&mut self, id: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.unused_seq = Some(seq);
            self.unused.insert(seq, id);
        }
    }

    fn unlink(&mut self, id: u32) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            if let Some(seq) = buffer.unused_seq.take() {
                self.unused.remove(&seq);
            }
        }
        self.used.remove(&id);
    }

    /// Return a buffer's memory to the backend and forget about it. If the
    /// backend fails, the buffer is left untouched.
    pub(super) fn destroy(
        &mut self,
        id: u32,
        caller: &'static Location<'static>,
    ) -> Result<(), GroupError> {
        let mode = self.mode;
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(GroupError::UnknownBuffer(id))?;

        match mode {
            BufferMode::Internal => self.allocator.free(buffer.memory.as_mut())?,
            BufferMode::External => self.allocator.release(buffer.memory.as_mut())?,
        }

        self.unlink(id);
        if let Some(buffer) = self.buffers.remove(&id) {
            self.usage -= buffer.size;
            self.record(id, BufferOp::Destroy, buffer.ref_count, caller);
        }

        Ok(())
    }

    pub(super) fn ref_inc(
        &mut self,
        id: u32,
        caller: &'static Location<'static>,
    ) -> Result<u32, GroupError> {
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(GroupError::UnknownBuffer(id))?;

        buffer.ref_count += 1;
        let ref_count = buffer.ref_count;
        if ref_count == 1 {
            buffer.used = true;
            self.unlink(id);
            self.used.insert(id);
        }
        self.record(id, BufferOp::RefInc, ref_count, caller);

        Ok(ref_count)
    }

    /// Drop one reference to buffer `id`. When the last reference goes, the
    /// buffer is destroyed if `destroy_on_release` is set, if it has been
    /// discarded or if the group is an orphan, and recycled otherwise.
    pub(super) fn ref_dec(
        &mut self,
        id: u32,
        destroy_on_release: bool,
        caller: &'static Location<'static>,
    ) -> Result<Released, GroupError> {
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(GroupError::UnknownBuffer(id))?;

        if buffer.ref_count == 0 {
            return Err(GroupError::NotReferenced(id));
        }

        buffer.ref_count -= 1;
        let ref_count = buffer.ref_count;
        let discard = buffer.discard;
        self.record(id, BufferOp::RefDec, ref_count, caller);

        if ref_count > 0 {
            return Ok(Released::StillReferenced);
        }

        if destroy_on_release || discard || self.is_orphan {
            if let Err(e) = self.destroy(id, caller) {
                // Keep the reference so the caller can retry.
                if let Some(buffer) = self.buffers.get_mut(&id) {
                    buffer.ref_count = 1;
                }
                return Err(e);
            }
            return Ok(Released::Destroyed);
        }

        self.unlink(id);
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.used = false;
        }
        self.push_unused(id);

        Ok(Released::Recycled(self.listener.clone()))
    }

    /// Take a reference on the first unused buffer of at least `min_size`
    /// bytes. Smaller buffers found before it are destroyed if the group owns
    /// its memory.
    pub(super) fn get_unused(
        &mut self,
        min_size: usize,
        caller: &'static Location<'static>,
    ) -> Result<Option<u32>, GroupError> {
        let candidates: Vec<u32> = self.unused.values().copied().collect();

        for id in candidates {
            let size = match self.buffers.get(&id) {
                Some(buffer) => buffer.size,
                None => continue,
            };

            if size >= min_size {
                self.ref_inc(id, caller)?;
                return Ok(Some(id));
            }

            if self.mode == BufferMode::Internal {
                trace!(
                    "group {} dropping buffer {} ({} < {} bytes)",
                    self.id,
                    id,
                    size,
                    min_size
                );
                self.destroy(id, caller)?;
            }
        }

        Ok(None)
    }

    /// Destroy all the buffers of the unused list.
    pub(super) fn free_unused(&mut self, caller: &'static Location<'static>) -> Result<(), GroupError> {
        let unused: Vec<u32> = self.unused.values().copied().collect();
        for id in unused {
            self.destroy(id, caller)?;
        }

        Ok(())
    }

    /// Mark all the buffers in use as discarded, so they get destroyed
    /// instead of recycled once released, and destroy the unused ones.
    pub(super) fn reset(&mut self, caller: &'static Location<'static>) -> Result<(), GroupError> {
        let used: Vec<u32> = self.used.iter().copied().collect();
        for id in used {
            if let Some(buffer) = self.buffers.get_mut(&id) {
                buffer.discard = true;
                let ref_count = buffer.ref_count;
                self.record(id, BufferOp::Discard, ref_count, caller);
            }
        }

        self.free_unused(caller)
    }

    /// Destroy every buffer, including those still referenced. Returns the
    /// first backend error met, after trying to destroy all buffers.
    pub(super) fn clear(&mut self, caller: &'static Location<'static>) -> Result<(), GroupError> {
        let mut res = Ok(());
        let ids: Vec<u32> = self.buffers.keys().copied().collect();

        for id in ids {
            if let Some(buffer) = self.buffers.get_mut(&id) {
                if buffer.ref_count > 0 {
                    error!(
                        "group {} buffer {} ({}, allocated at {}) still has {} references",
                        self.id, id, buffer.tag, buffer.caller, buffer.ref_count
                    );
                    buffer.ref_count = 0;
                }
            }

            if let Err(e) = self.destroy(id, caller) {
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }

        res
    }

    /// Human-readable state of the group and its history.
    pub(super) fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "group {} \"{}\" {:?}/{:?}{}: {} buffers ({} used, {} unused), {} bytes",
            self.id,
            self.tag,
            self.mode,
            self.buffer_type,
            if self.is_orphan { " orphan" } else { "" },
            self.count(),
            self.count_used(),
            self.count_unused(),
            self.usage
        );

        for buffer in self.buffers.values() {
            let _ = writeln!(
                out,
                "  buffer {:<5} \"{}\" size {:<9} ref {:<3}{}{} from {}",
                buffer.handle.id(),
                buffer.tag,
                buffer.size,
                buffer.ref_count,
                if buffer.used { " used" } else { "" },
                if buffer.discard { " discard" } else { "" },
                buffer.caller
            );
        }

        if !self.history.is_empty() {
            let _ = writeln!(out, "history:");
            self.history.dump(&mut out);
        }

        out
    }
}
