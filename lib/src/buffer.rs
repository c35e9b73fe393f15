//! Reference-counted buffers organized in groups.
//!
//! A `BufferService` keeps track of every `BufferGroup` of a pipeline. Each
//! group allocates its buffers from one memory backend (see `memory`) and
//! hands them out by `BufferHandle`. A buffer with a reference count of zero
//! sits in the unused list of its group, from which `buffer_get_unused` can
//! pick it again; once referenced it moves to the used list until its last
//! reference is dropped.
//!
//! Groups come in two modes. `BufferMode::Internal` groups allocate and own
//! their memory. `BufferMode::External` groups only keep track of memory that
//! has been allocated elsewhere and committed to them.
//!
//! ```
//! use codecbuf::buffer::*;
//! use codecbuf::memory::BufferType;
//!
//! let service = BufferService::new(ServiceConfig::new());
//! let group = service.group_create("decoder", BufferMode::Internal, BufferType::Normal);
//!
//! let buffer = service.buffer_get(group, "frame", 4096).unwrap();
//! assert_eq!(service.buffer_ref_count(buffer).unwrap(), 1);
//!
//! // Dropping the last reference returns the buffer to the group...
//! service.buffer_ref_dec(buffer).unwrap();
//! // ... from which it can be picked up again.
//! assert_eq!(service.buffer_get_unused(group, 1024).unwrap(), Some(buffer));
//! ```
mod config;
mod group;

pub use config::*;
pub use group::{BufferOp, BufferRecord, BufferSource};

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::Location;
use std::sync::{Arc, Mutex};

use enumn::N;
use log::{debug, error, warn};
use thiserror::Error;

use crate::history::InvariantViolation;
use crate::memory::{AllocatorError, BufferType, ImportSource};
use group::{BufferGroup, GroupError, Released};

/// Identifier of a buffer group. Never reused while a service lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a buffer of a given group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle {
    group: GroupId,
    id: u32,
}

impl BufferHandle {
    /// Rebuild a handle from its parts, e.g. after it went through a C API.
    /// Using a handle that does not designate an existing buffer is an error.
    pub fn from_parts(group: GroupId, id: u32) -> Self {
        BufferHandle { group, id }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.id)
    }
}

/// Who owns the memory of the buffers of a group.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum BufferMode {
    /// The group allocates its buffers and frees them.
    Internal = 0,
    /// Buffers are allocated by someone else and committed to the group.
    External = 1,
}

/// Snapshot of the properties of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: usize,
    pub fd: Option<RawFd>,
    /// Opaque index set by the user, -1 if unset.
    pub index: i32,
    pub buffer_type: BufferType,
    pub mode: BufferMode,
    pub ref_count: u32,
}

/// Size and count limits of a group. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupLimits {
    pub max_size: Option<usize>,
    pub max_count: Option<usize>,
}

/// Snapshot of the state of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: GroupId,
    pub tag: String,
    pub mode: BufferMode,
    pub buffer_type: BufferType,
    pub limits: GroupLimits,
    pub count: usize,
    pub count_used: usize,
    pub count_unused: usize,
    /// Sum of the sizes of all the buffers of the group.
    pub usage: usize,
    pub is_orphan: bool,
}

/// Gets signaled each time a buffer of a group goes back to its unused list.
///
/// The listener is called without the service lock held, and may thus call
/// back into the service.
pub trait ReleaseListener: Send + Sync {
    fn buffer_released(&self, group: GroupId);
}

impl<F> ReleaseListener for F
where
    F: Fn(GroupId) + Send + Sync,
{
    fn buffer_released(&self, group: GroupId) {
        self(group)
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("group {0} not found")]
    GroupNotFound(GroupId),
    #[error("group {group} is full ({count} buffers, {usage} bytes)")]
    CapacityExceeded {
        group: GroupId,
        count: usize,
        usage: usize,
    },
    #[error("no buffer available in group {0}")]
    NoneAvailable(GroupId),
    #[error("access outside of buffer {buffer} ({size} bytes)")]
    OutOfBounds { buffer: BufferHandle, size: usize },
    #[error("failed to allocate buffer: {0}")]
    AllocFailure(#[source] AllocatorError),
    #[error("memory backend error: {0}")]
    Backend(#[source] AllocatorError),
    #[error("{0}")]
    Fatal(Box<InvariantViolation>),
}

impl BufferError {
    /// Whether the error results from a misuse of the API, as opposed to a
    /// transient or resource condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BufferError::Fatal(_))
    }
}

fn fatal(group: &BufferGroup, reason: String) -> BufferError {
    BufferError::Fatal(Box::new(InvariantViolation::new(reason, group.dump())))
}

fn group_error(group: &BufferGroup, e: GroupError) -> BufferError {
    match e {
        GroupError::UnknownBuffer(id) => {
            fatal(group, format!("buffer {} not found in group {}", id, group.id))
        }
        GroupError::NotReferenced(id) => fatal(
            group,
            format!("buffer {}:{} is not referenced", group.id, id),
        ),
        GroupError::Backend(e) => BufferError::Backend(e),
    }
}

struct ServiceState {
    groups: BTreeMap<GroupId, BufferGroup>,
    orphans: BTreeMap<GroupId, BufferGroup>,
    legacy: Option<GroupId>,
    next_group_id: u32,
    next_buffer_id: u32,
    config: ServiceConfig,
}

impl ServiceState {
    fn group(&self, id: GroupId) -> Option<&BufferGroup> {
        self.groups.get(&id).or_else(|| self.orphans.get(&id))
    }

    fn group_mut(&mut self, id: GroupId) -> Option<&mut BufferGroup> {
        match self.groups.get_mut(&id) {
            Some(group) => Some(group),
            None => self.orphans.get_mut(&id),
        }
    }

    fn live_group_mut(&mut self, id: GroupId) -> Result<&mut BufferGroup, BufferError> {
        self.groups
            .get_mut(&id)
            .ok_or(BufferError::GroupNotFound(id))
    }

    /// Returns a fresh group id, skipping the ones still in use.
    fn mint_group_id(&mut self) -> GroupId {
        loop {
            let id = GroupId(self.next_group_id);
            self.next_group_id = self.next_group_id.wrapping_add(1);
            if !self.groups.contains_key(&id) && !self.orphans.contains_key(&id) {
                return id;
            }
        }
    }

    fn create_group(&mut self, tag: &str, mode: BufferMode, buffer_type: BufferType) -> GroupId {
        let id = self.mint_group_id();
        let group = BufferGroup::new(
            id,
            tag,
            mode,
            buffer_type,
            self.config.allocator(buffer_type),
            self.config.clear_on_exit,
            self.config.log_ops,
            self.config.history_size,
        );
        self.groups.insert(id, group);

        id
    }

    /// Forget the legacy group if it is empty and the last one standing.
    fn collect_legacy(&mut self) {
        let legacy = match self.legacy {
            Some(legacy) => legacy,
            None => return,
        };

        let alone = self.groups.len() == 1
            && self.groups.get(&legacy).map_or(false, |g| g.is_empty());
        if alone {
            debug!("Releasing legacy group {}", legacy);
            self.groups.remove(&legacy);
            self.legacy = None;
        }
    }

    /// Release everything, forcing still referenced buffers out. Returns the
    /// first error met.
    fn teardown(&mut self, caller: &'static Location<'static>) -> Result<(), BufferError> {
        let mut res = Ok(());
        let mut keep_first = |r: Result<(), BufferError>| {
            if res.is_ok() {
                res = r;
            }
        };

        let legacy = self.legacy.take().and_then(|id| self.groups.remove(&id));
        let groups = std::mem::take(&mut self.groups);
        let orphans = std::mem::take(&mut self.orphans);

        for mut group in legacy
            .into_iter()
            .chain(groups.into_values())
            .chain(orphans.into_values())
        {
            if group.count_used() > 0 {
                warn!(
                    "Group {} ({}) still has {} buffers in use at teardown",
                    group.id,
                    group.tag,
                    group.count_used()
                );
            }
            let r = group.clear(caller).map_err(|e| group_error(&group, e));
            keep_first(r);
        }

        res
    }
}

/// Directory of all the buffer groups of a pipeline.
///
/// All the methods can be called concurrently from several threads. The state
/// is protected by a single lock, which is never held while calling into a
/// `ReleaseListener`.
pub struct BufferService {
    state: Mutex<ServiceState>,
}

impl BufferService {
    pub fn new(config: ServiceConfig) -> Self {
        debug!("Creating buffer service with {:?}", config);

        BufferService {
            state: Mutex::new(ServiceState {
                groups: BTreeMap::new(),
                orphans: BTreeMap::new(),
                legacy: None,
                next_group_id: 0,
                next_buffer_id: 0,
                config,
            }),
        }
    }

    /// Create a new group allocating its buffers from the backend registered
    /// for `buffer_type`.
    pub fn group_create(&self, tag: &str, mode: BufferMode, buffer_type: BufferType) -> GroupId {
        let mut state = self.state.lock().unwrap();
        let id = state.create_group(tag, mode, buffer_type);
        debug!(
            "Created group {} ({}, {:?}, {:?})",
            id, tag, mode, buffer_type
        );

        id
    }

    /// Returns the default group, creating it if needed. Buffers of the
    /// legacy group are destroyed as soon as they are not referenced anymore.
    pub fn legacy_group(&self) -> GroupId {
        let mut state = self.state.lock().unwrap();
        match state.legacy {
            Some(id) => id,
            None => {
                let id = state.create_group("legacy", BufferMode::Internal, BufferType::Normal);
                debug!("Created legacy group {}", id);
                state.legacy = Some(id);
                id
            }
        }
    }

    /// Destroy group `id`. Its unused buffers are freed right away. If some
    /// of its buffers are still referenced, the group becomes an orphan that
    /// is released along with its last buffer, unless the service is
    /// configured to clear groups on exit.
    #[track_caller]
    pub fn group_destroy(&self, id: GroupId) -> Result<(), BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let mut group = state.groups.remove(&id).ok_or(BufferError::GroupNotFound(id))?;

        if let Err(e) = group.free_unused(caller) {
            let e = group_error(&group, e);
            state.groups.insert(id, group);
            return Err(e);
        }

        if state.legacy == Some(id) {
            state.legacy = None;
        }

        let res = if group.count_used() == 0 {
            debug!("Destroyed group {} ({})", id, group.tag);
            Ok(())
        } else if group.clear_on_exit {
            error!(
                "Group {} ({}) destroyed with {} buffers still in use:",
                id,
                group.tag,
                group.count_used()
            );
            for line in group.dump().lines() {
                error!("{}", line);
            }
            group.clear(caller).map_err(|e| group_error(&group, e))
        } else {
            warn!(
                "Group {} ({}) destroyed with {} buffers still in use, keeping it as orphan",
                id,
                group.tag,
                group.count_used()
            );
            group.is_orphan = true;
            group.listener = None;
            state.orphans.insert(id, group);
            Ok(())
        };

        state.collect_legacy();

        res
    }

    /// Discard the buffers of group `id`: unused ones are freed immediately,
    /// used ones are destroyed instead of being recycled once released.
    #[track_caller]
    pub fn group_reset(&self, id: GroupId) -> Result<(), BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let group = state.live_group_mut(id)?;

        debug!("Resetting group {} ({})", id, group.tag);
        group.reset(caller).map_err(|e| group_error(group, e))
    }

    /// Register the listener to signal when a buffer of group `id` is
    /// released, replacing the previous one. `None` removes the listener.
    pub fn group_set_listener(
        &self,
        id: GroupId,
        listener: Option<Arc<dyn ReleaseListener>>,
    ) -> Result<(), BufferError> {
        let mut state = self.state.lock().unwrap();
        state.live_group_mut(id)?.listener = listener;

        Ok(())
    }

    /// Limit the total size and number of the buffers of group `id`.
    pub fn group_limit_config(
        &self,
        id: GroupId,
        max_size: Option<usize>,
        max_count: Option<usize>,
    ) -> Result<(), BufferError> {
        let mut state = self.state.lock().unwrap();
        state.live_group_mut(id)?.limits = GroupLimits {
            max_size,
            max_count,
        };

        Ok(())
    }

    /// Returns the state of group `id`, including if it is an orphan.
    pub fn group_get_by_id(&self, id: GroupId) -> Option<GroupInfo> {
        let state = self.state.lock().unwrap();
        state.group(id).map(|g| g.info())
    }

    pub fn group_count(&self, id: GroupId) -> Result<usize, BufferError> {
        self.group_get_by_id(id)
            .map(|info| info.count)
            .ok_or(BufferError::GroupNotFound(id))
    }

    pub fn group_unused_count(&self, id: GroupId) -> Result<usize, BufferError> {
        self.group_get_by_id(id)
            .map(|info| info.count_unused)
            .ok_or(BufferError::GroupNotFound(id))
    }

    pub fn group_usage(&self, id: GroupId) -> Result<usize, BufferError> {
        self.group_get_by_id(id)
            .map(|info| info.usage)
            .ok_or(BufferError::GroupNotFound(id))
    }

    /// Human-readable state of group `id` and of its recent history.
    pub fn group_dump(&self, id: GroupId) -> Result<String, BufferError> {
        let state = self.state.lock().unwrap();
        state
            .group(id)
            .map(|g| g.dump())
            .ok_or(BufferError::GroupNotFound(id))
    }

    /// Add a new unreferenced buffer to group `id`.
    #[track_caller]
    pub fn buffer_create(
        &self,
        id: GroupId,
        tag: &str,
        source: BufferSource,
    ) -> Result<BufferHandle, BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        Self::create_locked(&mut state, id, tag, source, caller)
    }

    /// Commit externally allocated memory to group `id`.
    #[track_caller]
    pub fn buffer_commit(
        &self,
        id: GroupId,
        tag: &str,
        source: &dyn ImportSource,
    ) -> Result<BufferHandle, BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        Self::create_locked(&mut state, id, tag, BufferSource::Import(source), caller)
    }

    fn create_locked(
        state: &mut ServiceState,
        id: GroupId,
        tag: &str,
        source: BufferSource,
        caller: &'static Location<'static>,
    ) -> Result<BufferHandle, BufferError> {
        let handle = BufferHandle {
            group: id,
            id: state.next_buffer_id,
        };
        let group = state.live_group_mut(id)?;

        let size = match (group.mode, source) {
            (BufferMode::Internal, BufferSource::Alloc(size)) => size,
            (BufferMode::External, BufferSource::Import(source)) => source.len() as usize,
            (mode, source) => {
                return Err(fatal(
                    group,
                    format!("cannot create buffer from {:?} in {:?} group {}", source, mode, id),
                ))
            }
        };

        if !group.fits(size) {
            return Err(BufferError::CapacityExceeded {
                group: id,
                count: group.count(),
                usage: group.usage(),
            });
        }

        group
            .create(handle, tag, source, caller)
            .map_err(BufferError::AllocFailure)?;
        state.next_buffer_id = state.next_buffer_id.wrapping_add(1);

        Ok(handle)
    }

    /// Returns a referenced buffer of at least `size` bytes from group `id`,
    /// recycling an unused one if possible or allocating a new one otherwise.
    /// External groups cannot allocate, and return `NoneAvailable` if no
    /// committed buffer is free.
    #[track_caller]
    pub fn buffer_get(
        &self,
        id: GroupId,
        tag: &str,
        size: usize,
    ) -> Result<BufferHandle, BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let group = state.live_group_mut(id)?;

        if let Some(buffer) = group
            .get_unused(size, caller)
            .map_err(|e| group_error(group, e))?
        {
            return Ok(BufferHandle { group: id, id: buffer });
        }

        if group.mode == BufferMode::External {
            return Err(BufferError::NoneAvailable(id));
        }

        let handle = Self::create_locked(&mut state, id, tag, BufferSource::Alloc(size), caller)?;
        let group = state.live_group_mut(id)?;
        group
            .ref_inc(handle.id, caller)
            .map_err(|e| group_error(group, e))?;

        Ok(handle)
    }

    /// Take a reference on the first unused buffer of group `id` holding at
    /// least `min_size` bytes. Returns `None` if there is no such buffer.
    #[track_caller]
    pub fn buffer_get_unused(
        &self,
        id: GroupId,
        min_size: usize,
    ) -> Result<Option<BufferHandle>, BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let group = state.live_group_mut(id)?;

        Ok(group
            .get_unused(min_size, caller)
            .map_err(|e| group_error(group, e))?
            .map(|buffer| BufferHandle { group: id, id: buffer }))
    }

    /// Returns the new reference count of `buffer`.
    #[track_caller]
    pub fn buffer_ref_inc(&self, buffer: BufferHandle) -> Result<u32, BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let group = state
            .group_mut(buffer.group)
            .ok_or(BufferError::GroupNotFound(buffer.group))?;

        group
            .ref_inc(buffer.id, caller)
            .map_err(|e| group_error(group, e))
    }

    /// Drop a reference to `buffer`. The listener of its group, if any, is
    /// signaled if the buffer goes back to the unused list.
    #[track_caller]
    pub fn buffer_ref_dec(&self, buffer: BufferHandle) -> Result<(), BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let destroy_on_release = state.legacy == Some(buffer.group);
        let group = state
            .group_mut(buffer.group)
            .ok_or(BufferError::GroupNotFound(buffer.group))?;

        let released = group
            .ref_dec(buffer.id, destroy_on_release, caller)
            .map_err(|e| group_error(group, e))?;

        match released {
            Released::StillReferenced => Ok(()),
            Released::Destroyed => {
                let orphan_done = group.is_orphan && group.is_empty();
                if orphan_done {
                    debug!("Releasing orphan group {}", buffer.group);
                    state.orphans.remove(&buffer.group);
                }
                Ok(())
            }
            Released::Recycled(listener) => {
                drop(state);
                if let Some(listener) = listener {
                    listener.buffer_released(buffer.group);
                }
                Ok(())
            }
        }
    }

    /// Destroy an unreferenced buffer.
    #[track_caller]
    pub fn buffer_destroy(&self, buffer: BufferHandle) -> Result<(), BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let group = state
            .group_mut(buffer.group)
            .ok_or(BufferError::GroupNotFound(buffer.group))?;

        match group.get(buffer.id) {
            None => {
                return Err(fatal(
                    group,
                    format!("buffer {} not found", buffer),
                ))
            }
            Some(b) if b.ref_count > 0 => {
                let reason = format!(
                    "cannot destroy buffer {} with {} references",
                    buffer, b.ref_count
                );
                return Err(fatal(group, reason));
            }
            Some(_) => (),
        }

        group
            .destroy(buffer.id, caller)
            .map_err(|e| group_error(group, e))?;

        if group.is_orphan && group.is_empty() {
            state.orphans.remove(&buffer.group);
        }

        Ok(())
    }

    /// Run `f` on buffer `buffer`, turning a missing buffer into a fatal
    /// error.
    fn with_buffer<T, F>(&self, buffer: BufferHandle, f: F) -> Result<T, BufferError>
    where
        F: FnOnce(&mut group::Buffer, BufferType, BufferMode) -> Result<T, BufferError>,
    {
        let mut state = self.state.lock().unwrap();
        let group = state
            .group_mut(buffer.group)
            .ok_or(BufferError::GroupNotFound(buffer.group))?;
        let (buffer_type, mode) = (group.buffer_type, group.mode);

        match group.get_mut(buffer.id) {
            Some(b) => f(b, buffer_type, mode),
            None => Err(fatal(group, format!("buffer {} not found", buffer))),
        }
    }

    pub fn buffer_info(&self, buffer: BufferHandle) -> Result<BufferInfo, BufferError> {
        self.with_buffer(buffer, |b, buffer_type, mode| {
            Ok(BufferInfo {
                size: b.size,
                fd: b.memory.as_raw_fd(),
                index: b.index,
                buffer_type,
                mode,
                ref_count: b.ref_count,
            })
        })
    }

    pub fn buffer_ref_count(&self, buffer: BufferHandle) -> Result<u32, BufferError> {
        self.with_buffer(buffer, |b, _, _| Ok(b.ref_count))
    }

    /// Attach an opaque index to `buffer`, e.g. its position in a hardware
    /// queue.
    pub fn buffer_set_index(&self, buffer: BufferHandle, index: i32) -> Result<(), BufferError> {
        self.with_buffer(buffer, |b, _, _| {
            b.index = index;
            Ok(())
        })
    }

    /// Copy the content of `buffer` starting at `offset` into `data`.
    pub fn buffer_read(
        &self,
        buffer: BufferHandle,
        offset: usize,
        data: &mut [u8],
    ) -> Result<(), BufferError> {
        self.with_buffer(buffer, |b, _, _| {
            check_bounds(buffer, b.size, offset, data.len())?;
            b.memory
                .read_at(offset, data)
                .map(|_| ())
                .map_err(io_error)
        })
    }

    /// Copy `data` into `buffer` starting at `offset`.
    pub fn buffer_write(
        &self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BufferError> {
        self.with_buffer(buffer, |b, _, _| {
            check_bounds(buffer, b.size, offset, data.len())?;
            b.memory
                .write_at(offset, data)
                .map(|_| ())
                .map_err(io_error)
        })
    }

    /// Release all the groups and their buffers, reporting errors that
    /// dropping the service would only log.
    #[track_caller]
    pub fn shutdown(self) -> Result<(), BufferError> {
        let caller = Location::caller();
        let mut state = self.state.lock().unwrap();
        let res = state.teardown(caller);
        drop(state);

        res
    }
}

impl Drop for BufferService {
    fn drop(&mut self) {
        let caller = Location::caller();
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(e) = state.teardown(caller) {
            error!("Error while tearing down buffer service: {}", e);
        }
    }
}

fn check_bounds(
    buffer: BufferHandle,
    size: usize,
    offset: usize,
    len: usize,
) -> Result<(), BufferError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BufferError::OutOfBounds { buffer, size }),
    }
}

fn io_error(e: io::Error) -> BufferError {
    BufferError::Backend(AllocatorError::Io(e))
}
