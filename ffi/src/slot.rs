//! Slot sets.
//!
//! A slot set is created on top of a buffer service with
//! [`codecbuf_slots_new`]. Functions taking a slot `index` accept the values
//! returned by [`codecbuf_slots_get_unused`] and [`codecbuf_slots_dequeue`].
#![allow(non_camel_case_types)]

use std::os::raw::c_int;
use std::sync::Arc;

use codecbuf::frame::{ColorInfo, Frame, FrameInfo};
use codecbuf::slot::{SlotError, SlotQueue, SlotSet, SlotUsage, SlotValue, SlotsConfig};
use codecbuf::{ChromaLocation, ColorMatrix, ColorPrimaries, ColorRange, ColorTransfer};
use log::{error, info, warn};

use crate::buffer::{codecbuf_buffer, codecbuf_service};
use crate::*;

/// A set of slots.
pub struct codecbuf_slots {
    slots: SlotSet,
}

/// Geometry of frames.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct codecbuf_frame_info {
    pub width: u32,
    pub height: u32,
    /// Fourcc of the pixel format.
    pub format: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub buf_size: usize,
}

impl From<FrameInfo> for codecbuf_frame_info {
    fn from(info: FrameInfo) -> Self {
        codecbuf_frame_info {
            width: info.width,
            height: info.height,
            format: info.format.into(),
            hor_stride: info.hor_stride,
            ver_stride: info.ver_stride,
            buf_size: info.buf_size,
        }
    }
}

/// A frame. Color fields use the code points of ISO/IEC 23091-4; unknown
/// values read as unspecified.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct codecbuf_frame {
    pub info: codecbuf_frame_info,
    pub pts: i64,
    pub eos: bool,
    pub color_range: u32,
    pub color_primaries: u32,
    pub color_transfer: u32,
    pub color_matrix: u32,
    pub chroma_location: u32,
    /// Whether `buffer` is valid.
    pub has_buffer: bool,
    pub buffer: codecbuf_buffer,
}

impl From<&codecbuf_frame> for Frame {
    fn from(frame: &codecbuf_frame) -> Self {
        let mut f = Frame::new(
            frame.info.format.into(),
            frame.info.width,
            frame.info.height,
        )
        .with_strides(frame.info.hor_stride, frame.info.ver_stride);
        f.buf_size = frame.info.buf_size;
        f.pts = frame.pts;
        f.eos = frame.eos;
        f.color = ColorInfo {
            range: ColorRange::n(frame.color_range).unwrap_or_default(),
            primaries: ColorPrimaries::n(frame.color_primaries).unwrap_or_default(),
            transfer: ColorTransfer::n(frame.color_transfer).unwrap_or_default(),
            matrix: ColorMatrix::n(frame.color_matrix).unwrap_or_default(),
            chroma_location: ChromaLocation::n(frame.chroma_location).unwrap_or_default(),
        };
        if frame.has_buffer {
            f.buffer = Some(frame.buffer.into());
        }

        f
    }
}

impl From<&Frame> for codecbuf_frame {
    fn from(frame: &Frame) -> Self {
        codecbuf_frame {
            info: frame.info().into(),
            pts: frame.pts,
            eos: frame.eos,
            color_range: frame.color.range as u32,
            color_primaries: frame.color.primaries as u32,
            color_transfer: frame.color.transfer as u32,
            color_matrix: frame.color.matrix as u32,
            chroma_location: frame.color.chroma_location as u32,
            has_buffer: frame.buffer.is_some(),
            buffer: frame.buffer.map(Into::into).unwrap_or_default(),
        }
    }
}

/// Status of a slot, filled by [`codecbuf_slots_status`].
#[repr(C)]
#[derive(Debug, Default)]
pub struct codecbuf_slot_status {
    /// `SlotFlags` bits.
    pub flags: u32,
    pub hal_use: u8,
    pub queue_use: u8,
}

fn status<T, F: FnOnce(T)>(res: Result<T, SlotError>, f: F) -> c_int {
    match res {
        Ok(v) => {
            f(v);
            CODECBUF_OK
        }
        Err(e) => {
            match e {
                SlotError::NoFreeSlot | SlotError::NotReady(_) | SlotError::QueueEmpty(_) => (),
                _ => error!("{}", e),
            }
            slot_error_code(&e)
        }
    }
}

fn usage(usage: u32) -> Option<SlotUsage> {
    let res = SlotUsage::n(usage);
    if res.is_none() {
        error!("Invalid slot usage {}", usage);
    }
    res
}

fn queue(queue: u32) -> Option<SlotQueue> {
    let res = SlotQueue::n(queue);
    if res.is_none() {
        error!("Invalid slot queue {}", queue);
    }
    res
}

/// Create a slot set whose frames are backed by buffers of `service`. Debug
/// flags are read from the `CODECBUF_SLOT_DEBUG` environment variable.
///
/// # Safety
///
/// `service` must be a valid pointer returned by `codecbuf_service_new`. The
/// slot set keeps the service alive, so `service` may be destroyed first.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_new(service: *const codecbuf_service) -> *mut codecbuf_slots {
    assert!(!service.is_null());

    let slots = Box::new(codecbuf_slots {
        slots: SlotSet::new(Arc::clone(&(*service).service), SlotsConfig::from_env()),
    });
    info!("Slot set {:p}: created", slots.as_ref());

    Box::into_raw(slots)
}

/// Destroy a slot set, releasing the buffers still attached to its slots.
///
/// # Safety
///
/// `slots` must be a valid pointer returned by [`codecbuf_slots_new`], and
/// must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_destroy(slots: *mut codecbuf_slots) {
    info!("Slot set {:p}: destroying", slots);

    if slots.is_null() {
        warn!("Trying to destroy a NULL slot set");
        return;
    }

    drop(Box::from_raw(slots));
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_setup(slots: *const codecbuf_slots, count: usize) -> c_int {
    assert!(!slots.is_null());
    status((*slots).slots.setup(count), |_| ())
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_is_changed(slots: *const codecbuf_slots) -> bool {
    assert!(!slots.is_null());
    (*slots).slots.is_changed()
}

/// Commit the staged geometry and slot count.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_ready(slots: *const codecbuf_slots) {
    assert!(!slots.is_null());
    (*slots).slots.ready()
}

/// Size of the buffers required by frames of the committed geometry.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_get_size(slots: *const codecbuf_slots) -> usize {
    assert!(!slots.is_null());
    (*slots).slots.get_size()
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_set_size(slots: *const codecbuf_slots, size: usize) {
    assert!(!slots.is_null());
    (*slots).slots.set_size(size)
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_count(slots: *const codecbuf_slots) -> usize {
    assert!(!slots.is_null());
    (*slots).slots.count()
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_used_count(slots: *const codecbuf_slots) -> usize {
    assert!(!slots.is_null());
    (*slots).slots.used_count()
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_unused_count(slots: *const codecbuf_slots) -> usize {
    assert!(!slots.is_null());
    (*slots).slots.unused_count()
}

/// Take a free slot and write its index into `index`. Returns
/// `CODECBUF_ERR_NOT_FOUND` if all slots are in use and the set is
/// configured to retry.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer, and `index` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_get_unused(
    slots: *const codecbuf_slots,
    index: *mut usize,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!index.is_null());
    status((*slots).slots.get_unused(), |i| *index = i)
}

/// Take the `usage` interest on slot `index`. `usage` is 0 for not ready,
/// 1 for codec use, 2 for hardware input, 3 for hardware output, 4 for queue
/// use.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_set_flag(
    slots: *const codecbuf_slots,
    index: usize,
    usage: u32,
) -> c_int {
    assert!(!slots.is_null());
    match self::usage(usage) {
        Some(usage) => status((*slots).slots.set_flag(index, usage), |_| ()),
        None => CODECBUF_ERR_VALUE,
    }
}

/// Release the `usage` interest on slot `index`. The slot returns to the free
/// pool if it was the last one.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_clr_flag(
    slots: *const codecbuf_slots,
    index: usize,
    usage: u32,
) -> c_int {
    assert!(!slots.is_null());
    match self::usage(usage) {
        Some(usage) => status((*slots).slots.clr_flag(index, usage), |_| ()),
        None => CODECBUF_ERR_VALUE,
    }
}

/// Append slot `index` to `queue`: 0 for output, 1 for display, 2 for
/// deinterlace, 3 for convert.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_enqueue(
    slots: *const codecbuf_slots,
    index: usize,
    queue: u32,
) -> c_int {
    assert!(!slots.is_null());
    match self::queue(queue) {
        Some(queue) => status((*slots).slots.enqueue(index, queue), |_| ()),
        None => CODECBUF_ERR_VALUE,
    }
}

/// Pop the head of `queue` into `index`. Returns `CODECBUF_ERR_NOT_FOUND` if
/// the queue is empty or its head is not ready yet.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer, and `index` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_dequeue(
    slots: *const codecbuf_slots,
    queue: u32,
    index: *mut usize,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!index.is_null());
    match self::queue(queue) {
        Some(queue) => status((*slots).slots.dequeue(queue), |i| *index = i),
        None => CODECBUF_ERR_VALUE,
    }
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_queue_len(slots: *const codecbuf_slots, queue: u32) -> usize {
    assert!(!slots.is_null());
    match self::queue(queue) {
        Some(queue) => (*slots).slots.queue_len(queue),
        None => 0,
    }
}

/// Attach a copy of `frame` to slot `index`, staging its geometry if it
/// differs from the committed one.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer, and `frame` must point to a
/// valid frame.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_set_frame(
    slots: *const codecbuf_slots,
    index: usize,
    frame: *const codecbuf_frame,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!frame.is_null());
    let frame = Frame::from(&*frame);
    status(
        (*slots).slots.set_prop(index, SlotValue::Frame(frame)),
        |_| (),
    )
}

/// Copy the frame attached to slot `index` into `frame`. Returns
/// `CODECBUF_ERR_NOT_FOUND` if the slot has no frame.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer, and `frame` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_get_frame(
    slots: *const codecbuf_slots,
    index: usize,
    frame: *mut codecbuf_frame,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!frame.is_null());
    match (*slots).slots.get_frame(index) {
        Ok(Some(f)) => {
            *frame = (&f).into();
            CODECBUF_OK
        }
        Ok(None) => CODECBUF_ERR_NOT_FOUND,
        Err(e) => status::<(), _>(Err(e), |_| ()),
    }
}

/// Attach `buffer` to slot `index`. The slot takes its own reference.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_set_buffer(
    slots: *const codecbuf_slots,
    index: usize,
    buffer: codecbuf_buffer,
) -> c_int {
    assert!(!slots.is_null());
    status(
        (*slots)
            .slots
            .set_prop(index, SlotValue::Buffer(buffer.into())),
        |_| (),
    )
}

/// Returns `CODECBUF_ERR_NOT_FOUND` if slot `index` has no buffer.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer, and `buffer` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_get_buffer(
    slots: *const codecbuf_slots,
    index: usize,
    buffer: *mut codecbuf_buffer,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!buffer.is_null());
    match (*slots).slots.get_buffer(index) {
        Ok(Some(b)) => {
            *buffer = b.into();
            CODECBUF_OK
        }
        Ok(None) => CODECBUF_ERR_NOT_FOUND,
        Err(e) => status::<(), _>(Err(e), |_| ()),
    }
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_set_eos(
    slots: *const codecbuf_slots,
    index: usize,
    eos: bool,
) -> c_int {
    assert!(!slots.is_null());
    status((*slots).slots.set_prop(index, SlotValue::Eos(eos)), |_| ())
}

/// # Safety
///
/// `slots` must be a valid slot set pointer, and `eos` must point to writable
/// memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_get_eos(
    slots: *const codecbuf_slots,
    index: usize,
    eos: *mut bool,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!eos.is_null());
    status((*slots).slots.get_eos(index), |e| *eos = e)
}

/// # Safety
///
/// `slots` must be a valid slot set pointer, and `slot_status` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_status(
    slots: *const codecbuf_slots,
    index: usize,
    slot_status: *mut codecbuf_slot_status,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!slot_status.is_null());
    status((*slots).slots.status(index), |s| {
        *slot_status = codecbuf_slot_status {
            flags: s.flags().bits(),
            hal_use: s.hal_use(),
            queue_use: s.queue_use(),
        }
    })
}

/// Forcibly free slot `index`.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_reset(slots: *const codecbuf_slots, index: usize) -> c_int {
    assert!(!slots.is_null());
    status((*slots).slots.reset(index), |_| ())
}

/// Attach a frame of the current geometry to slot `index` and copy it into
/// `frame` if not NULL.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer, and `frame` must be NULL or
/// point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_default_info(
    slots: *const codecbuf_slots,
    index: usize,
    frame: *mut codecbuf_frame,
) -> c_int {
    assert!(!slots.is_null());
    status((*slots).slots.default_info(index), |f| {
        if !frame.is_null() {
            *frame = (&f).into();
        }
    })
}

/// Commit the geometry of `frame` right away. Fails with a fatal error if
/// the geometry of `frame` cannot be represented.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer, and `frame` must point to a
/// valid frame.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_set_frame_info(
    slots: *const codecbuf_slots,
    frame: *const codecbuf_frame,
) -> c_int {
    assert!(!slots.is_null());
    assert!(!frame.is_null());
    status((*slots).slots.set_frame_info(&Frame::from(&*frame)), |_| ())
}

/// # Safety
///
/// `slots` must be a valid slot set pointer, and `info` must point to
/// writable memory.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_get_frame_info(
    slots: *const codecbuf_slots,
    info: *mut codecbuf_frame_info,
) {
    assert!(!slots.is_null());
    assert!(!info.is_null());
    *info = (*slots).slots.frame_info().into();
}

/// Scale buffer sizes by `numerator / denominator` of the plane size. Both
/// must be non-zero.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_set_scale(
    slots: *const codecbuf_slots,
    numerator: u32,
    denominator: u32,
) -> c_int {
    assert!(!slots.is_null());
    let slots = &(*slots).slots;
    status(
        slots
            .set_numerator(numerator)
            .and_then(|_| slots.set_denominator(denominator)),
        |_| (),
    )
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_decode_count(slots: *const codecbuf_slots) -> u64 {
    assert!(!slots.is_null());
    (*slots).slots.decode_count()
}

/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_display_count(slots: *const codecbuf_slots) -> u64 {
    assert!(!slots.is_null());
    (*slots).slots.display_count()
}

/// Log the state of all slots and the recent history of the set.
///
/// # Safety
///
/// `slots` must be a valid slot set pointer.
#[no_mangle]
pub unsafe extern "C" fn codecbuf_slots_dump(slots: *const codecbuf_slots) {
    assert!(!slots.is_null());
    for line in (*slots).slots.dump().lines() {
        info!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;
    use crate::buffer::*;

    const NV12: u32 = u32::from_le_bytes(*b"NV12");

    #[test]
    fn test_slot_flow() {
        let service = codecbuf_service_new();
        let mut group = 0;
        let mut buffer = codecbuf_buffer::default();
        let mut index = usize::MAX;

        unsafe {
            let slots = codecbuf_slots_new(service);
            // The slot set keeps the service alive.
            codecbuf_service_destroy(service);
            let service = &(*slots).slots.service().clone();
            let service = codecbuf_service {
                service: Arc::clone(service),
            };

            assert_eq!(codecbuf_slots_setup(slots, 2), CODECBUF_OK);
            assert_eq!(codecbuf_slots_get_unused(slots, &mut index), CODECBUF_OK);

            let mut frame = codecbuf_frame::default();
            frame.info.format = NV12;
            frame.info.width = 64;
            frame.info.height = 32;
            frame.pts = 42;
            assert_eq!(codecbuf_slots_set_frame(slots, index, &frame), CODECBUF_OK);
            assert!(codecbuf_slots_is_changed(slots));
            codecbuf_slots_ready(slots);
            assert!(!codecbuf_slots_is_changed(slots));

            let mut info = codecbuf_frame_info::default();
            codecbuf_slots_get_frame_info(slots, &mut info);
            assert_eq!((info.width, info.height, info.format), (64, 32, NV12));
            assert!(codecbuf_slots_get_size(slots) > 0);

            assert_eq!(
                codecbuf_group_create(&service, ptr::null(), 0, 0, &mut group),
                CODECBUF_OK
            );
            assert_eq!(
                codecbuf_buffer_get(
                    &service,
                    group,
                    ptr::null(),
                    codecbuf_slots_get_size(slots),
                    &mut buffer
                ),
                CODECBUF_OK
            );
            assert_eq!(codecbuf_slots_set_buffer(slots, index, buffer), CODECBUF_OK);
            assert_eq!(codecbuf_buffer_ref_dec(&service, buffer), CODECBUF_OK);

            assert_eq!(codecbuf_slots_set_flag(slots, index, 4), CODECBUF_OK);
            assert_eq!(codecbuf_slots_enqueue(slots, index, 1), CODECBUF_OK);
            let mut out = usize::MAX;
            assert_eq!(
                codecbuf_slots_dequeue(slots, 1, &mut out),
                CODECBUF_ERR_NOT_FOUND
            );
            assert_eq!(codecbuf_slots_clr_flag(slots, index, 0), CODECBUF_OK);
            assert_eq!(codecbuf_slots_dequeue(slots, 1, &mut out), CODECBUF_OK);
            assert_eq!(out, index);

            let mut got = codecbuf_frame::default();
            assert_eq!(codecbuf_slots_get_frame(slots, out, &mut got), CODECBUF_OK);
            assert_eq!(got.pts, 42);
            assert!(got.has_buffer);
            assert_eq!((got.buffer.group, got.buffer.id), (buffer.group, buffer.id));

            assert_eq!(codecbuf_slots_clr_flag(slots, out, 4), CODECBUF_OK);
            assert_eq!(codecbuf_slots_used_count(slots), 0);
            assert_eq!(
                codecbuf_slots_get_frame(slots, out, &mut got),
                CODECBUF_ERR_NOT_FOUND
            );

            assert_eq!(codecbuf_slots_set_flag(slots, 0, 9), CODECBUF_ERR_VALUE);
            assert_eq!(codecbuf_slots_set_scale(slots, 3, 0), CODECBUF_ERR_FATAL);

            frame.info.width = u32::MAX - 3;
            assert_eq!(
                codecbuf_slots_set_frame_info(slots, &frame),
                CODECBUF_ERR_FATAL
            );
            codecbuf_slots_get_frame_info(slots, &mut info);
            assert_eq!(info.width, 64);

            codecbuf_slots_destroy(slots);
        }
    }
}
