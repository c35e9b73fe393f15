//! Buffer service, groups and buffers.
//!
//! A service is created with [`codecbuf_service_new`] and stays alive until
//! given to [`codecbuf_service_destroy`]. Groups and buffers are designated
//! by plain integer identifiers that are only meaningful for the service that
//! issued them.
#![allow(non_camel_case_types)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::io::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;

use codecbuf::buffer::{
    BufferHandle, BufferMode, BufferService, BufferSource, GroupId, ReleaseListener,
    ServiceConfig,
};
use codecbuf::memory::{BufferType, ImportSource};
use log::{error, info, warn};

use crate::*;

/// A buffer service instance.
pub struct codecbuf_service {
    pub(crate) service: Arc<BufferService>,
}

/// Designates a buffer of a group.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct codecbuf_buffer {
    pub group: u32,
    pub id: u32,
}

impl From<BufferHandle> for codecbuf_buffer {
    fn from(handle: BufferHandle) -> Self {
        codecbuf_buffer {
            group: handle.group().0,
            id: handle.id(),
        }
    }
}

impl From<codecbuf_buffer> for BufferHandle {
    fn from(buffer: codecbuf_buffer) -> Self {
        BufferHandle::from_parts(GroupId(buffer.group), buffer.id)
    }
}

/// State of a group, filled by [`codecbuf_group_info`].
#[repr(C)]
#[derive(Debug, Default)]
pub struct codecbuf_group_info {
    pub mode: u32,
    pub buffer_type: u32,
    pub count: usize,
    pub count_used: usize,
    pub count_unused: usize,
    pub usage: usize,
    pub is_orphan: bool,
}

/// Callback invoked every time a buffer goes back to the unused list of a
/// group. The first argument is the `cb_data` pointer given to
/// [`codecbuf_group_set_listener`], the second one the group.
pub type codecbuf_release_cb = extern "C" fn(*mut c_void, u32);

// A void pointer that can be sent across threads. This is usually not allowed
// by Rust, but is necessary for us to call back into the client.
struct SendablePtr<T>(*mut T);
impl<T> Clone for SendablePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SendablePtr<T> {}
unsafe impl<T> Send for SendablePtr<T> {}
unsafe impl<T> Sync for SendablePtr<T> {}

struct CallbackListener {
    cb: codecbuf_release_cb,
    cb_data: SendablePtr<c_void>,
}

impl ReleaseListener for CallbackListener {
    fn buffer_released(&self, group: GroupId) {
        (self.cb)(self.cb_data.0, group.0)
    }
}

/// The simplest type used to import a FD. It does not take ownership of the
/// FD at any time and does not close it; the group keeps its own duplicate.
#[derive(Debug)]
struct RawFdSource {
    fd: RawFd,
    len: u64,
}

impl AsFd for RawFdSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // Safe as long as the caller keeps `fd` open during the call that
        // created this source, which is what the C API requires.
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl ImportSource for RawFdSource {
    fn len(&self) -> u64 {
        self.len
    }
}

unsafe fn tag_from_ptr<'a>(tag: *const c_char) -> &'a str {
    if tag.is_null() {
        return "";
    }

    match CStr::from_ptr(tag).to_str() {
        Ok(tag) => tag,
        Err(_) => {
            warn!("Ignoring non-UTF8 tag");
            ""
        }
    }
}

fn status<T, F: FnOnce(T)>(res: Result<T, codecbuf::buffer::BufferError>, f: F) -> c_int {
    match res {
        Ok(v) => {
            f(v);
            CODECBUF_OK
        }
        Err(e) => {
            error!("{}", e);
            buffer_error_code(&e)
        }
    }
}

/// Create a new buffer service. Debug flags are read from the
/// `CODECBUF_BUFFER_DEBUG` environment variable.
#[no_mangle]
pub extern "C" fn codecbuf_service_new() -> *mut codecbuf_service {
    let service = Box::new(codecbuf_service {
        service: Arc::new(BufferService::new(ServiceConfig::from_env())),
    });
    info!("Buffer service {:p}: created", service.as_ref());

    Box::into_raw(service)
}

/// Destroy a buffer service and all its groups.
///
/// The service is only really destroyed once the slot sets created from it
/// are destroyed as well.
///
/// # Safety
///
/// `service` must be a valid pointer returned by [`codecbuf_service_new`],
/// and must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_service_destroy(service: *mut codecbuf_service) {
    info!("Buffer service {:p}: destroying", service);

    if service.is_null() {
        warn!("Trying to destroy a NULL service");
        return;
    }

    drop(Box::from_raw(service));
}

/// Create a group of buffers.
///
/// `mode` is 0 for groups allocating their buffers, 1 for groups of buffers
/// committed with [`codecbuf_buffer_commit`]. `buffer_type` selects the
/// memory backend: 0 for normal memory, 1 for ion, 2 for V4L2, 3 for DRM.
/// The identifier of the new group is written into `group`.
///
/// # Safety
///
/// `service` must be a valid service pointer, `tag` NULL or a zero-terminated
/// string, and `group` must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_create(
    service: *const codecbuf_service,
    tag: *const c_char,
    mode: u32,
    buffer_type: u32,
    group: *mut u32,
) -> c_int {
    assert!(!service.is_null());
    assert!(!group.is_null());
    let service = &*service;

    let (mode, buffer_type) = match (BufferMode::n(mode), BufferType::n(buffer_type)) {
        (Some(mode), Some(buffer_type)) => (mode, buffer_type),
        _ => {
            error!("Invalid group mode {} or type {}", mode, buffer_type);
            return CODECBUF_ERR_VALUE;
        }
    };

    let id = service
        .service
        .group_create(tag_from_ptr(tag), mode, buffer_type);
    *group = id.0;

    CODECBUF_OK
}

/// Returns the identifier of the default group, creating it if needed.
///
/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_legacy(service: *const codecbuf_service) -> u32 {
    assert!(!service.is_null());
    (*service).service.legacy_group().0
}

/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_destroy(
    service: *const codecbuf_service,
    group: u32,
) -> c_int {
    assert!(!service.is_null());
    status((*service).service.group_destroy(GroupId(group)), |_| ())
}

/// Free the unused buffers of `group`, and make sure the ones in use are not
/// recycled once released.
///
/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_reset(service: *const codecbuf_service, group: u32) -> c_int {
    assert!(!service.is_null());
    status((*service).service.group_reset(GroupId(group)), |_| ())
}

/// Limit the total size and number of buffers of `group`. Zero means no
/// limit.
///
/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_limit_config(
    service: *const codecbuf_service,
    group: u32,
    max_size: usize,
    max_count: usize,
) -> c_int {
    assert!(!service.is_null());
    let limit = |v: usize| if v == 0 { None } else { Some(v) };

    status(
        (*service)
            .service
            .group_limit_config(GroupId(group), limit(max_size), limit(max_count)),
        |_| (),
    )
}

/// Register `cb` to be called each time a buffer of `group` is released.
/// Passing a NULL `cb` removes the current listener.
///
/// `cb` is called from whichever thread releases the buffer, and may call
/// back into the library.
///
/// # Safety
///
/// `service` must be a valid service pointer. `cb_data` must remain valid
/// for as long as the listener is registered.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_set_listener(
    service: *const codecbuf_service,
    group: u32,
    cb: Option<codecbuf_release_cb>,
    cb_data: *mut c_void,
) -> c_int {
    assert!(!service.is_null());
    let listener = cb.map(|cb| {
        Arc::new(CallbackListener {
            cb,
            cb_data: SendablePtr(cb_data),
        }) as Arc<dyn ReleaseListener>
    });

    status(
        (*service)
            .service
            .group_set_listener(GroupId(group), listener),
        |_| (),
    )
}

/// Write the state of `group` into `info`.
///
/// # Safety
///
/// `service` must be a valid service pointer, and `info` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_info(
    service: *const codecbuf_service,
    group: u32,
    info: *mut codecbuf_group_info,
) -> c_int {
    assert!(!service.is_null());
    assert!(!info.is_null());

    match (*service).service.group_get_by_id(GroupId(group)) {
        Some(group) => {
            *info = codecbuf_group_info {
                mode: group.mode as u32,
                buffer_type: group.buffer_type as u32,
                count: group.count,
                count_used: group.count_used,
                count_unused: group.count_unused,
                usage: group.usage,
                is_orphan: group.is_orphan,
            };
            CODECBUF_OK
        }
        None => CODECBUF_ERR_NOT_FOUND,
    }
}

/// Log the state and recent history of `group`.
///
/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_group_dump(service: *const codecbuf_service, group: u32) -> c_int {
    assert!(!service.is_null());
    status((*service).service.group_dump(GroupId(group)), |dump| {
        for line in dump.lines() {
            info!("{}", line);
        }
    })
}

/// Allocate a new unreferenced buffer of `size` bytes into `group`.
///
/// # Safety
///
/// `service` must be a valid service pointer, `tag` NULL or a zero-terminated
/// string, and `buffer` must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_create(
    service: *const codecbuf_service,
    group: u32,
    tag: *const c_char,
    size: usize,
    buffer: *mut codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());
    assert!(!buffer.is_null());

    status(
        (*service).service.buffer_create(
            GroupId(group),
            tag_from_ptr(tag),
            BufferSource::Alloc(size),
        ),
        |handle| *buffer = handle.into(),
    )
}

/// Commit the memory behind `fd` to `group`. The group keeps its own
/// duplicate of `fd`, which the caller remains responsible for closing.
///
/// # Safety
///
/// `service` must be a valid service pointer, `fd` an open file descriptor
/// backed by at least `len` bytes, `tag` NULL or a zero-terminated string,
/// and `buffer` must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_commit(
    service: *const codecbuf_service,
    group: u32,
    tag: *const c_char,
    fd: c_int,
    len: usize,
    buffer: *mut codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());
    assert!(!buffer.is_null());
    if fd < 0 {
        return CODECBUF_ERR_VALUE;
    }

    let source = RawFdSource {
        fd,
        len: len as u64,
    };
    status(
        (*service)
            .service
            .buffer_commit(GroupId(group), tag_from_ptr(tag), &source),
        |handle| *buffer = handle.into(),
    )
}

/// Obtain a referenced buffer of at least `size` bytes from `group`,
/// allocating it if no unused buffer is large enough.
///
/// # Safety
///
/// `service` must be a valid service pointer, `tag` NULL or a zero-terminated
/// string, and `buffer` must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_get(
    service: *const codecbuf_service,
    group: u32,
    tag: *const c_char,
    size: usize,
    buffer: *mut codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());
    assert!(!buffer.is_null());

    status(
        (*service)
            .service
            .buffer_get(GroupId(group), tag_from_ptr(tag), size),
        |handle| *buffer = handle.into(),
    )
}

/// Take a reference on an unused buffer of at least `min_size` bytes from
/// `group`. Returns `CODECBUF_ERR_NOT_FOUND` if there is none.
///
/// # Safety
///
/// `service` must be a valid service pointer, and `buffer` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_get_unused(
    service: *const codecbuf_service,
    group: u32,
    min_size: usize,
    buffer: *mut codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());
    assert!(!buffer.is_null());

    match (*service).service.buffer_get_unused(GroupId(group), min_size) {
        Ok(Some(handle)) => {
            *buffer = handle.into();
            CODECBUF_OK
        }
        Ok(None) => CODECBUF_ERR_NOT_FOUND,
        Err(e) => {
            error!("{}", e);
            buffer_error_code(&e)
        }
    }
}

/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_ref_inc(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());
    status((*service).service.buffer_ref_inc(buffer.into()), |_| ())
}

/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_ref_dec(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());
    status((*service).service.buffer_ref_dec(buffer.into()), |_| ())
}

/// Destroy an unreferenced buffer.
///
/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_destroy(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());
    status((*service).service.buffer_destroy(buffer.into()), |_| ())
}

/// Returns the file descriptor of `buffer`, or a negative error code if it
/// does not have one. The descriptor remains owned by the buffer.
///
/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_get_fd(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());

    match (*service).service.buffer_info(buffer.into()) {
        Ok(info) => info.fd.unwrap_or(CODECBUF_ERR_NOT_FOUND),
        Err(e) => {
            error!("{}", e);
            buffer_error_code(&e)
        }
    }
}

/// # Safety
///
/// `service` must be a valid service pointer, and `size` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_get_size(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
    size: *mut usize,
) -> c_int {
    assert!(!service.is_null());
    assert!(!size.is_null());
    status((*service).service.buffer_info(buffer.into()), |info| {
        *size = info.size
    })
}

/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_set_index(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
    index: i32,
) -> c_int {
    assert!(!service.is_null());
    status(
        (*service).service.buffer_set_index(buffer.into(), index),
        |_| (),
    )
}

/// Returns the index set with [`codecbuf_buffer_set_index`], -1 if none was
/// set, or an error code.
///
/// # Safety
///
/// `service` must be a valid service pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_get_index(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
) -> c_int {
    assert!(!service.is_null());

    match (*service).service.buffer_info(buffer.into()) {
        Ok(info) => info.index,
        Err(e) => {
            error!("{}", e);
            buffer_error_code(&e)
        }
    }
}

/// Copy `len` bytes of `buffer` starting at `offset` into `data`.
///
/// # Safety
///
/// `service` must be a valid service pointer, and `data` must point to at
/// least `len` bytes of writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_read(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
    offset: usize,
    data: *mut u8,
    len: usize,
) -> c_int {
    assert!(!service.is_null());
    assert!(!data.is_null() || len == 0);
    let data = if len == 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(data, len)
    };

    status(
        (*service).service.buffer_read(buffer.into(), offset, data),
        |_| (),
    )
}

/// Copy `len` bytes from `data` into `buffer` starting at `offset`.
///
/// # Safety
///
/// `service` must be a valid service pointer, and `data` must point to at
/// least `len` bytes of readable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_buffer_write(
    service: *const codecbuf_service,
    buffer: codecbuf_buffer,
    offset: usize,
    data: *const u8,
    len: usize,
) -> c_int {
    assert!(!service.is_null());
    assert!(!data.is_null() || len == 0);
    let data = if len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data, len)
    };

    status(
        (*service).service.buffer_write(buffer.into(), offset, data),
        |_| (),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    extern "C" fn count_releases(cb_data: *mut c_void, _group: u32) {
        let count = unsafe { &*(cb_data as *const AtomicUsize) };
        count.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_buffer_lifecycle() {
        let service = codecbuf_service_new();
        let mut group = 0;
        let mut buffer = codecbuf_buffer::default();
        let releases = AtomicUsize::new(0);

        unsafe {
            assert_eq!(
                codecbuf_group_create(service, std::ptr::null(), 0, 0, &mut group),
                CODECBUF_OK
            );
            assert_eq!(
                codecbuf_group_create(service, std::ptr::null(), 7, 0, &mut group),
                CODECBUF_ERR_VALUE
            );
            assert_eq!(
                codecbuf_group_set_listener(
                    service,
                    group,
                    Some(count_releases),
                    &releases as *const _ as *mut c_void
                ),
                CODECBUF_OK
            );

            assert_eq!(
                codecbuf_buffer_get(service, group, std::ptr::null(), 64, &mut buffer),
                CODECBUF_OK
            );
            assert_eq!(
                codecbuf_buffer_write(service, buffer, 0, b"abc".as_ptr(), 3),
                CODECBUF_OK
            );
            let mut out = [0u8; 3];
            assert_eq!(
                codecbuf_buffer_read(service, buffer, 0, out.as_mut_ptr(), 3),
                CODECBUF_OK
            );
            assert_eq!(&out, b"abc");

            assert_eq!(codecbuf_buffer_ref_dec(service, buffer), CODECBUF_OK);
            assert_eq!(releases.load(Ordering::SeqCst), 1);
            assert_eq!(
                codecbuf_buffer_ref_dec(service, buffer),
                CODECBUF_ERR_FATAL
            );

            let mut info = codecbuf_group_info::default();
            assert_eq!(codecbuf_group_info(service, group, &mut info), CODECBUF_OK);
            assert_eq!((info.count, info.count_unused, info.usage), (1, 1, 64));

            assert_eq!(codecbuf_group_destroy(service, group), CODECBUF_OK);
            assert_eq!(
                codecbuf_group_info(service, group, &mut info),
                CODECBUF_ERR_NOT_FOUND
            );
            codecbuf_service_destroy(service);
        }
    }
}
