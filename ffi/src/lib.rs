//! C FFI of the codecbuf crate.
//!
//! This crate provides a C API over the buffer service and slot sets, for
//! codec and hardware drivers written in C. Objects are handed out as opaque
//! pointers that must be given back to their `_destroy` function, and every
//! fallible function returns one of the `CODECBUF_*` status codes below.
//!
//! Fatal errors, i.e. misuses of the API, are logged along with a dump of
//! the state of the offending object before `CODECBUF_ERR_FATAL` is returned.
//! The library never aborts by itself; whether to continue after such an
//! error is the caller's decision.

pub mod buffer;
pub mod slot;

use std::os::raw::c_int;

use codecbuf::buffer::BufferError;
use codecbuf::memory::AllocatorError;
use codecbuf::slot::SlotError;

/// Success.
pub const CODECBUF_OK: c_int = 0;
/// Generic failure, usually a backend error.
pub const CODECBUF_NOK: c_int = -1;
/// Memory could not be allocated, or a group limit has been reached.
pub const CODECBUF_ERR_NOMEM: c_int = -2;
/// The object looked up does not exist or is not available yet.
pub const CODECBUF_ERR_NOT_FOUND: c_int = -3;
/// Invalid argument.
pub const CODECBUF_ERR_VALUE: c_int = -6;
/// The caller broke an invariant of the API.
pub const CODECBUF_ERR_FATAL: c_int = -9;

static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize the codecbuf library. This only sets up the proper hooks for
/// logging, so although it is not a hard requirement to call this function,
/// failure to do so will result in no logs being printed.
#[no_mangle]
pub extern "C" fn codecbuf_init() {
    INIT.call_once(|| {
        #[cfg(feature = "env_logger")]
        env_logger::builder().format_timestamp(None).init();

        #[cfg(feature = "android")]
        android_logger::init_once(
            android_logger::Config::default().with_min_level(log::Level::Trace),
        );
    });
}

pub(crate) fn buffer_error_code(e: &BufferError) -> c_int {
    match e {
        BufferError::GroupNotFound(_) | BufferError::NoneAvailable(_) => CODECBUF_ERR_NOT_FOUND,
        BufferError::CapacityExceeded { .. } => CODECBUF_ERR_NOMEM,
        BufferError::AllocFailure(AllocatorError::OutOfMemory(_)) => CODECBUF_ERR_NOMEM,
        BufferError::AllocFailure(AllocatorError::ZeroSize) => CODECBUF_ERR_VALUE,
        BufferError::OutOfBounds { .. } => CODECBUF_ERR_VALUE,
        BufferError::AllocFailure(_) | BufferError::Backend(_) => CODECBUF_NOK,
        BufferError::Fatal(_) => CODECBUF_ERR_FATAL,
    }
}

pub(crate) fn slot_error_code(e: &SlotError) -> c_int {
    match e {
        SlotError::NoFreeSlot | SlotError::NotReady(_) | SlotError::QueueEmpty(_) => {
            CODECBUF_ERR_NOT_FOUND
        }
        SlotError::Buffer(e) => buffer_error_code(e),
        SlotError::Fatal(_) => CODECBUF_ERR_FATAL,
    }
}
