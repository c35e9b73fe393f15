//! Per-frame state machines shared between a codec, hardware and consumers.
//!
//! A `SlotSet` is a fixed-capacity array of slots. Each slot carries a frame
//! and the buffer holding it, and records who currently has an interest in
//! them:
//!
//! * the producer, until it marks the frame ready (`SlotUsage::CodecReady`),
//! * the codec, while it keeps the frame as a reference (`SlotUsage::CodecUse`),
//! * the hardware, while it writes (`SlotUsage::HalOutput`) or reads
//!   (`SlotUsage::HalInput`, counted) the frame,
//! * queue consumers, counted (`SlotUsage::QueueUse`). Enqueuing takes one
//!   such reference and dequeuing drops it.
//!
//! Once all of these interests are gone the slot goes back to the free pool
//! by itself, dropping its frame and its reference to the buffer. There is
//! no explicit way to free a slot besides `reset`, which is meant for
//! flushes.
//!
//! The set also negotiates the geometry of frames. Attaching a frame whose
//! layout differs from the committed one stages the new layout and raises
//! `is_changed()`. Nothing changes for consumers until they call `ready()`,
//! which also applies a slot count raised through `setup()` in the meantime.
//!
//! ```
//! use std::sync::Arc;
//!
//! use codecbuf::buffer::{BufferMode, BufferService, ServiceConfig};
//! use codecbuf::frame::Frame;
//! use codecbuf::memory::BufferType;
//! use codecbuf::slot::*;
//! use codecbuf::PixelFormat;
//!
//! let service = Arc::new(BufferService::new(ServiceConfig::new()));
//! let slots = SlotSet::new(Arc::clone(&service), SlotsConfig::new());
//! slots.setup(4).unwrap();
//!
//! // Producer side: the first frame always brings new geometry.
//! let index = slots.get_unused().unwrap();
//! let frame = Frame::new(PixelFormat::NV12, 640, 480);
//! slots.set_prop(index, SlotValue::Frame(frame)).unwrap();
//! assert!(slots.is_changed());
//! slots.ready();
//!
//! let group = service.group_create("frames", BufferMode::Internal, BufferType::Normal);
//! let buffer = service.buffer_get(group, "frame", slots.get_size()).unwrap();
//! slots.set_prop(index, SlotValue::Buffer(buffer)).unwrap();
//! service.buffer_ref_dec(buffer).unwrap();
//!
//! // Keep the slot after it leaves the queue, until display is done with it.
//! slots.set_flag(index, SlotUsage::QueueUse).unwrap();
//! slots.enqueue(index, SlotQueue::Display).unwrap();
//! slots.clr_flag(index, SlotUsage::CodecReady).unwrap();
//!
//! // Consumer side.
//! let index = slots.dequeue(SlotQueue::Display).unwrap();
//! let frame = slots.get_frame(index).unwrap().unwrap();
//! assert_eq!(frame.buffer, Some(buffer));
//! slots.clr_flag(index, SlotUsage::QueueUse).unwrap();
//!
//! assert_eq!(slots.used_count(), 0);
//! assert_eq!(service.buffer_ref_count(buffer).unwrap(), 0);
//! ```
mod config;
mod geometry;
mod queue;
mod status;

pub use config::*;
pub use geometry::{default_align_16, AlignFn, LenAlignFn};
pub use queue::SlotQueue;
pub use status::{SlotFlags, SlotOp, SlotRecord, SlotStatus};

use std::fmt::Write;
use std::sync::{Arc, Mutex};

use enumn::N;
use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::buffer::{BufferError, BufferHandle, BufferService};
use crate::frame::{Frame, FrameInfo};
use crate::history::{History, InvariantViolation};
use geometry::{derive_info, Alignment, Negotiation};
use queue::Queues;

/// Interests that can be taken and released on a slot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum SlotUsage {
    /// Setting marks the payload as not ready, clearing marks it ready.
    CodecReady = 0,
    CodecUse = 1,
    HalInput = 2,
    HalOutput = 3,
    QueueUse = 4,
}

/// Per-slot properties.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum SlotProp {
    Eos = 0,
    Frame = 1,
    Buffer = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Eos(bool),
    Frame(Frame),
    Buffer(BufferHandle),
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("no free slot")]
    NoFreeSlot,
    #[error("head of the {0:?} queue is not ready")]
    NotReady(SlotQueue),
    #[error("{0:?} queue is empty")]
    QueueEmpty(SlotQueue),
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("{0}")]
    Fatal(Box<InvariantViolation>),
}

impl SlotError {
    /// Whether the error results from a misuse of the API.
    pub fn is_fatal(&self) -> bool {
        match self {
            SlotError::Fatal(_) => true,
            SlotError::Buffer(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    status: SlotStatus,
    frame: Option<Frame>,
    buffer: Option<BufferHandle>,
}

struct SlotSetInner {
    config: SlotsConfig,
    slots: Vec<Slot>,
    /// Number of slots usable by `get_unused`.
    buf_count: usize,
    /// Number of slots after the next `ready()`.
    new_count: usize,
    used_count: usize,
    buf_size: usize,
    /// Committed geometry.
    info: FrameInfo,
    negotiation: Negotiation,
    align: Alignment,
    numerator: u32,
    denominator: u32,
    eos: bool,
    decode_count: u64,
    display_count: u64,
    queues: Queues,
    history: History<SlotRecord>,
}

impl SlotSetInner {
    fn new(config: SlotsConfig) -> Self {
        let history = History::new(config.history_size);

        SlotSetInner {
            config,
            slots: Vec::new(),
            buf_count: 0,
            new_count: 0,
            used_count: 0,
            buf_size: 0,
            info: Default::default(),
            negotiation: Negotiation::Stable,
            align: Default::default(),
            numerator: 9,
            denominator: 5,
            eos: false,
            decode_count: 0,
            display_count: 0,
            queues: Default::default(),
            history,
        }
    }

    fn fatal(&self, reason: String) -> SlotError {
        SlotError::Fatal(Box::new(InvariantViolation::new(reason, self.dump())))
    }

    fn check_index(&self, index: usize) -> Result<(), SlotError> {
        if index >= self.buf_count {
            return Err(self.fatal(format!(
                "slot index {} out of range [0, {})",
                index, self.buf_count
            )));
        }

        Ok(())
    }

    fn check_used(&self, index: usize, op: &str) -> Result<(), SlotError> {
        self.check_index(index)?;
        if !self.slots[index].status.is_used() {
            return Err(self.fatal(format!("{} on free slot {}", op, index)));
        }

        Ok(())
    }

    fn record(&mut self, index: usize, op: SlotOp, before: SlotStatus, after: SlotStatus) {
        if self.config.log_ops {
            trace!("slot {} {:?}: {} -> {}", index, op, before, after);
        }

        self.history.push(SlotRecord {
            index,
            op,
            before,
            after,
        });
    }

    fn update<F: FnOnce(&mut SlotStatus)>(&mut self, index: usize, op: SlotOp, f: F) {
        let before = self.slots[index].status;
        f(&mut self.slots[index].status);
        let after = self.slots[index].status;
        self.record(index, op, before, after);
    }

    /// Return slot `index` to the free pool if nobody has an interest in it
    /// anymore. Returns the buffer whose reference must then be dropped.
    fn reclaim(&mut self, index: usize) -> Option<BufferHandle> {
        let slot = &mut self.slots[index];
        if !slot.status.is_reclaimable() {
            return None;
        }

        let before = slot.status;
        slot.status = SlotStatus::default();
        slot.frame = None;
        let buffer = slot.buffer.take();
        self.queues.remove(index);
        self.used_count -= 1;
        self.record(index, SlotOp::Reclaim, before, SlotStatus::default());

        buffer
    }

    fn setup(&mut self, count: usize) -> Result<(), SlotError> {
        if count == 0 {
            return Err(self.fatal("cannot set up an empty slot set".into()));
        }

        if self.slots.is_empty() {
            debug!("Setting up {} slots", count);
            self.buf_count = count;
            self.new_count = count;
        } else {
            // A pending growth is never undone by a smaller request.
            let target = self.buf_count.max(self.new_count);
            if count > target {
                debug!(
                    "Growing slot set from {} to {} slots on next ready()",
                    self.buf_count, count
                );
                self.new_count = count;
            } else if count < target {
                debug!(
                    "Ignoring request to shrink slot set from {} to {}",
                    target, count
                );
            }
        }

        if count > self.slots.len() {
            self.slots.resize_with(count, Default::default);
            self.queues.resize(count);
        }

        Ok(())
    }

    fn ready(&mut self) {
        let resized = self.new_count != self.buf_count;
        if resized {
            debug!("Slot count {} -> {}", self.buf_count, self.new_count);
            self.buf_count = self.new_count;
        }

        match std::mem::take(&mut self.negotiation) {
            Negotiation::Staged(info) => {
                debug!("Committing frame info {}", info);
                self.info = info;
                self.buf_size = info.buf_size;
            }
            Negotiation::Stable if !resized => {
                warn!("ready() called without any pending change");
            }
            Negotiation::Stable => (),
        }

        self.history.clear();
    }

    fn get_unused(&mut self) -> Result<usize, SlotError> {
        let index = match (0..self.buf_count).find(|&i| !self.slots[i].status.is_used()) {
            Some(index) => index,
            None => {
                return match self.config.exhaustion {
                    ExhaustionPolicy::Fatal => Err(self.fatal(format!(
                        "all {} slots are in use",
                        self.buf_count
                    ))),
                    ExhaustionPolicy::Retry => Err(SlotError::NoFreeSlot),
                }
            }
        };

        self.update(index, SlotOp::GetUnused, |s| {
            s.insert(SlotFlags::ON_USED | SlotFlags::NOT_READY)
        });
        self.used_count += 1;

        Ok(index)
    }

    fn set_flag(&mut self, index: usize, usage: SlotUsage) -> Result<(), SlotError> {
        self.check_used(index, "set_flag")?;
        self.update(index, SlotOp::SetFlag(usage), |s| match usage {
            SlotUsage::CodecReady => s.insert(SlotFlags::NOT_READY),
            SlotUsage::CodecUse => s.insert(SlotFlags::CODEC_USE),
            SlotUsage::HalInput => s.inc_hal_use(),
            SlotUsage::HalOutput => s.insert(SlotFlags::HAL_OUTPUT | SlotFlags::NOT_READY),
            SlotUsage::QueueUse => s.inc_queue_use(),
        });

        Ok(())
    }

    fn clr_flag(&mut self, index: usize, usage: SlotUsage) -> Result<Option<BufferHandle>, SlotError> {
        self.check_used(index, "clr_flag")?;

        let before = self.slots[index].status;
        let mut after = before;
        let res = match usage {
            SlotUsage::CodecReady => {
                after.remove(SlotFlags::NOT_READY);
                Ok(())
            }
            SlotUsage::CodecUse => {
                after.remove(SlotFlags::CODEC_USE);
                Ok(())
            }
            SlotUsage::HalInput => after.dec_hal_use(),
            SlotUsage::HalOutput => {
                after.remove(SlotFlags::HAL_OUTPUT | SlotFlags::NOT_READY);
                Ok(())
            }
            SlotUsage::QueueUse => after.dec_queue_use(),
        };
        if res.is_err() {
            return Err(self.fatal(format!(
                "{:?} counter underflow on slot {}",
                usage, index
            )));
        }

        self.slots[index].status = after;
        self.record(index, SlotOp::ClrFlag(usage), before, after);
        if usage == SlotUsage::HalOutput {
            self.decode_count += 1;
        }

        Ok(self.reclaim(index))
    }

    fn enqueue(&mut self, index: usize, queue: SlotQueue) -> Result<(), SlotError> {
        self.check_used(index, "enqueue")?;
        self.queues.push(index, queue);
        self.update(index, SlotOp::Enqueue(queue), |s| s.inc_queue_use());

        Ok(())
    }

    fn dequeue(&mut self, queue: SlotQueue) -> Result<(usize, Option<BufferHandle>), SlotError> {
        let index = self
            .queues
            .front(queue)
            .ok_or(SlotError::QueueEmpty(queue))?;
        let before = self.slots[index].status;
        if !before.is_ready() {
            return Err(SlotError::NotReady(queue));
        }

        if self.slots[index].status.dec_queue_use().is_err() {
            return Err(self.fatal(format!(
                "slot {} on the {:?} queue has no queue reference",
                index, queue
            )));
        }
        self.queues.pop(queue);
        let after = self.slots[index].status;
        self.record(index, SlotOp::Dequeue(queue), before, after);
        self.display_count += 1;

        Ok((index, self.reclaim(index)))
    }

    fn attach_frame(&mut self, index: usize, mut frame: Frame) -> Result<(), SlotError> {
        self.check_index(index)?;
        if !self.slots[index].status.contains(SlotFlags::NOT_READY) {
            return Err(self.fatal(format!("frame set on ready slot {}", index)));
        }

        let derived = match derive_info(&frame, &self.align, self.numerator, self.denominator) {
            Some(info) => info,
            None => {
                return Err(self.fatal(format!(
                    "cannot derive geometry of {}x{} frame on slot {}",
                    frame.width, frame.height, index
                )))
            }
        };
        let staged = match self.negotiation {
            Negotiation::Stable => derived != self.info,
            Negotiation::Staged(info) => derived != info && derived != self.info,
        };
        if staged {
            debug!("Frame info change: {} -> {}", self.info, derived);
            self.negotiation = Negotiation::Staged(derived);
        }

        let slot = &mut self.slots[index];
        frame.buffer = slot.buffer.or(frame.buffer);
        frame.eos |= slot.status.contains(SlotFlags::EOS);
        let eos = frame.eos;
        slot.frame = Some(frame);

        self.update(index, SlotOp::SetFrame, |s| {
            s.insert(SlotFlags::HAS_FRAME);
            if eos {
                s.insert(SlotFlags::EOS);
            }
        });

        Ok(())
    }

    fn set_eos(&mut self, index: usize, eos: bool) -> Result<(), SlotError> {
        self.check_index(index)?;
        if let Some(frame) = self.slots[index].frame.as_mut() {
            frame.eos = eos;
        }
        self.update(index, SlotOp::SetEos, |s| s.set(SlotFlags::EOS, eos));

        Ok(())
    }

    /// Attach `buffer`, which the caller has already taken a reference on.
    /// Returns the buffer it replaces.
    fn attach_buffer(&mut self, index: usize, buffer: BufferHandle) -> Option<BufferHandle> {
        let slot = &mut self.slots[index];
        let old = slot.buffer.replace(buffer);
        if let Some(frame) = slot.frame.as_mut() {
            frame.buffer = Some(buffer);
        }
        self.update(index, SlotOp::SetBuffer, |s| s.insert(SlotFlags::HAS_BUFFER));

        old
    }

    fn reset(&mut self, index: usize) -> Result<Option<BufferHandle>, SlotError> {
        self.check_index(index)?;

        self.queues.remove(index);
        let slot = &mut self.slots[index];
        let before = slot.status;
        slot.status = SlotStatus::default();
        slot.frame = None;
        let buffer = slot.buffer.take();

        if before.is_used() {
            self.used_count -= 1;
        }
        self.record(index, SlotOp::Reset, before, SlotStatus::default());

        Ok(buffer)
    }

    fn default_info(&mut self, index: usize) -> Result<Frame, SlotError> {
        self.check_used(index, "default_info")?;
        let slot = &self.slots[index];
        if !slot.status.contains(SlotFlags::NOT_READY) || slot.frame.is_some() {
            return Err(self.fatal(format!(
                "default_info on slot {} which is ready or has a frame",
                index
            )));
        }

        let info = match self.negotiation {
            Negotiation::Staged(info) => info,
            Negotiation::Stable => self.info,
        };
        let mut frame = Frame::default();
        frame.apply_info(&info);
        frame.buffer = slot.buffer;
        frame.eos = slot.status.contains(SlotFlags::EOS);

        self.slots[index].frame = Some(frame.clone());
        self.update(index, SlotOp::DefaultInfo, |s| s.insert(SlotFlags::HAS_FRAME));

        Ok(frame)
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "slot set: {} slots ({} after ready), {} used, buffer size {}",
            self.buf_count, self.new_count, self.used_count, self.buf_size
        );
        let _ = writeln!(out, "info: {}", self.info);
        if let Negotiation::Staged(info) = self.negotiation {
            let _ = writeln!(out, "staged: {}", info);
        }
        let _ = writeln!(
            out,
            "decoded {}, displayed {}{}",
            self.decode_count,
            self.display_count,
            if self.eos { ", eos" } else { "" }
        );

        for (index, slot) in self.slots.iter().enumerate() {
            let _ = write!(out, "  slot {:<3} {}", index, slot.status);
            if let Some(buffer) = slot.buffer {
                let _ = write!(out, " buffer {}", buffer);
            }
            if let Some(queue) = self.queues.queue_of(index) {
                let _ = write!(out, " on {:?}", queue);
            }
            let _ = writeln!(out);
        }

        for queue in SlotQueue::ALL {
            if self.queues.len(queue) > 0 {
                let indices: Vec<_> = self.queues.iter(queue).collect();
                let _ = writeln!(out, "{:?} queue: {:?}", queue, indices);
            }
        }

        if !self.history.is_empty() {
            let _ = writeln!(out, "history:");
            self.history.dump(&mut out);
        }

        out
    }
}

/// A set of slots, usable from several threads.
///
/// Operations that may release a buffer drop the set's lock before calling
/// into the `BufferService`, so release listeners are free to use the set.
pub struct SlotSet {
    service: Arc<BufferService>,
    inner: Mutex<SlotSetInner>,
}

impl SlotSet {
    /// Create an empty slot set. `setup()` must be called before it can be
    /// used. Buffers attached to slots must come from `service`.
    pub fn new(service: Arc<BufferService>, config: SlotsConfig) -> Self {
        SlotSet {
            service,
            inner: Mutex::new(SlotSetInner::new(config)),
        }
    }

    pub fn service(&self) -> &Arc<BufferService> {
        &self.service
    }

    fn release(&self, buffer: Option<BufferHandle>) -> Result<(), SlotError> {
        if let Some(buffer) = buffer {
            self.service.buffer_ref_dec(buffer)?;
        }

        Ok(())
    }

    /// Size the set for `count` slots. The first call makes them available
    /// right away. Later calls can only grow the set, and the new slots only
    /// become usable after the next `ready()`.
    pub fn setup(&self, count: usize) -> Result<(), SlotError> {
        self.inner.lock().unwrap().setup(count)
    }

    /// Whether a geometry change is waiting for `ready()`.
    pub fn is_changed(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().negotiation,
            Negotiation::Staged(_)
        )
    }

    /// Acknowledge the pending changes: the staged geometry and slot count
    /// become the current ones.
    pub fn ready(&self) {
        self.inner.lock().unwrap().ready()
    }

    /// Buffer size required by the committed geometry.
    pub fn get_size(&self) -> usize {
        self.inner.lock().unwrap().buf_size
    }

    pub fn set_size(&self, size: usize) {
        self.inner.lock().unwrap().buf_size = size;
    }

    /// Number of usable slots.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().buf_count
    }

    /// Returns the index of a free slot, now marked as used and not ready.
    pub fn get_unused(&self) -> Result<usize, SlotError> {
        self.inner.lock().unwrap().get_unused()
    }

    pub fn set_flag(&self, index: usize, usage: SlotUsage) -> Result<(), SlotError> {
        self.inner.lock().unwrap().set_flag(index, usage)
    }

    /// Release interest `usage` on slot `index`, which goes back to the free
    /// pool if that was the last one.
    pub fn clr_flag(&self, index: usize, usage: SlotUsage) -> Result<(), SlotError> {
        let released = self.inner.lock().unwrap().clr_flag(index, usage)?;
        self.release(released)
    }

    /// Append slot `index` to `queue`, taking it off any other queue.
    pub fn enqueue(&self, index: usize, queue: SlotQueue) -> Result<(), SlotError> {
        self.inner.lock().unwrap().enqueue(index, queue)
    }

    /// Take the slot at the head of `queue`. Nothing happens if the head is
    /// not ready yet.
    pub fn dequeue(&self, queue: SlotQueue) -> Result<usize, SlotError> {
        let (index, released) = self.inner.lock().unwrap().dequeue(queue)?;
        self.release(released)?;

        Ok(index)
    }

    /// Whether `queue` holds no slot.
    pub fn is_empty(&self, queue: SlotQueue) -> bool {
        self.inner.lock().unwrap().queues.len(queue) == 0
    }

    pub fn queue_len(&self, queue: SlotQueue) -> usize {
        self.inner.lock().unwrap().queues.len(queue)
    }

    pub fn set_prop(&self, index: usize, value: SlotValue) -> Result<(), SlotError> {
        let released = {
            let mut inner = self.inner.lock().unwrap();
            match value {
                SlotValue::Eos(eos) => {
                    inner.set_eos(index, eos)?;
                    None
                }
                SlotValue::Frame(frame) => {
                    inner.attach_frame(index, frame)?;
                    None
                }
                SlotValue::Buffer(buffer) => {
                    inner.check_used(index, "set buffer")?;
                    self.service.buffer_ref_inc(buffer)?;
                    inner.attach_buffer(index, buffer)
                }
            }
        };

        self.release(released)
    }

    pub fn get_prop(&self, index: usize, prop: SlotProp) -> Result<Option<SlotValue>, SlotError> {
        let inner = self.inner.lock().unwrap();
        inner.check_index(index)?;
        let slot = &inner.slots[index];

        Ok(match prop {
            SlotProp::Eos => Some(SlotValue::Eos(slot.status.contains(SlotFlags::EOS))),
            SlotProp::Frame => slot.frame.clone().map(SlotValue::Frame),
            SlotProp::Buffer => slot.buffer.map(SlotValue::Buffer),
        })
    }

    /// Returns a copy of the frame attached to slot `index`.
    pub fn get_frame(&self, index: usize) -> Result<Option<Frame>, SlotError> {
        match self.get_prop(index, SlotProp::Frame)? {
            Some(SlotValue::Frame(frame)) => Ok(Some(frame)),
            _ => Ok(None),
        }
    }

    pub fn get_buffer(&self, index: usize) -> Result<Option<BufferHandle>, SlotError> {
        match self.get_prop(index, SlotProp::Buffer)? {
            Some(SlotValue::Buffer(buffer)) => Ok(Some(buffer)),
            _ => Ok(None),
        }
    }

    pub fn get_eos(&self, index: usize) -> Result<bool, SlotError> {
        Ok(matches!(
            self.get_prop(index, SlotProp::Eos)?,
            Some(SlotValue::Eos(true))
        ))
    }

    /// Run `f` on the frame attached to slot `index` in place. `f` is called
    /// with the set locked and must not use it.
    pub fn with_frame<T, F>(&self, index: usize, f: F) -> Result<Option<T>, SlotError>
    where
        F: FnOnce(&mut Frame) -> T,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.check_index(index)?;

        Ok(inner.slots[index].frame.as_mut().map(f))
    }

    /// Returns the status of slot `index`.
    pub fn status(&self, index: usize) -> Result<SlotStatus, SlotError> {
        let inner = self.inner.lock().unwrap();
        inner.check_index(index)?;

        Ok(inner.slots[index].status)
    }

    /// Forcibly free slot `index`, whatever interests remain on it.
    pub fn reset(&self, index: usize) -> Result<(), SlotError> {
        let released = self.inner.lock().unwrap().reset(index)?;
        self.release(released)
    }

    /// Attach a frame with the current (staged if any, committed otherwise)
    /// geometry to slot `index`, and return a copy of it. Lets a producer fill
    /// a slot before it has parsed any header.
    pub fn default_info(&self, index: usize) -> Result<Frame, SlotError> {
        self.inner.lock().unwrap().default_info(index)
    }

    pub fn used_count(&self) -> usize {
        self.inner.lock().unwrap().used_count
    }

    pub fn unused_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.buf_count - inner.used_count
    }

    pub fn numerator(&self) -> u32 {
        self.inner.lock().unwrap().numerator
    }

    /// Scale applied to `hor_stride * ver_stride` to obtain buffer sizes is
    /// `numerator / denominator`.
    pub fn set_numerator(&self, numerator: u32) -> Result<(), SlotError> {
        let mut inner = self.inner.lock().unwrap();
        if numerator == 0 {
            return Err(inner.fatal("numerator cannot be zero".into()));
        }
        inner.numerator = numerator;

        Ok(())
    }

    pub fn denominator(&self) -> u32 {
        self.inner.lock().unwrap().denominator
    }

    pub fn set_denominator(&self, denominator: u32) -> Result<(), SlotError> {
        let mut inner = self.inner.lock().unwrap();
        if denominator == 0 {
            return Err(inner.fatal("denominator cannot be zero".into()));
        }
        inner.denominator = denominator;

        Ok(())
    }

    pub fn set_hor_align(&self, align: AlignFn) {
        self.inner.lock().unwrap().align.hor = align;
    }

    pub fn set_ver_align(&self, align: AlignFn) {
        self.inner.lock().unwrap().align.ver = align;
    }

    /// Compute buffer sizes with `align` instead of the numerator and
    /// denominator. `None` restores the scaling.
    pub fn set_len_align(&self, align: Option<LenAlignFn>) {
        self.inner.lock().unwrap().align.len = align;
    }

    pub fn set_width_align(&self, align: Option<AlignFn>) {
        self.inner.lock().unwrap().align.width = align;
    }

    /// Commit the geometry derived from `frame` right away, dropping any
    /// staged change.
    pub fn set_frame_info(&self, frame: &Frame) -> Result<(), SlotError> {
        let mut inner = self.inner.lock().unwrap();
        let info = derive_info(frame, &inner.align, inner.numerator, inner.denominator)
            .ok_or_else(|| {
                inner.fatal(format!(
                    "cannot derive geometry of {}x{} frame",
                    frame.width, frame.height
                ))
            })?;
        debug!("Frame info set to {}", info);
        inner.info = info;
        inner.buf_size = info.buf_size;
        inner.negotiation = Negotiation::Stable;

        Ok(())
    }

    /// Committed geometry.
    pub fn frame_info(&self) -> FrameInfo {
        self.inner.lock().unwrap().info
    }

    pub fn set_eos(&self, eos: bool) {
        self.inner.lock().unwrap().eos = eos;
    }

    pub fn eos(&self) -> bool {
        self.inner.lock().unwrap().eos
    }

    /// Number of frames the hardware has finished writing.
    pub fn decode_count(&self) -> u64 {
        self.inner.lock().unwrap().decode_count
    }

    /// Number of slots taken from queues.
    pub fn display_count(&self) -> u64 {
        self.inner.lock().unwrap().display_count
    }

    /// Human-readable state of all the slots and of the recent history.
    pub fn dump(&self) -> String {
        self.inner.lock().unwrap().dump()
    }
}

impl Drop for SlotSet {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        if inner.used_count > 0 {
            debug!("Dropping slot set with {} slots in use", inner.used_count);
        }

        for slot in inner.slots.iter_mut() {
            if let Some(buffer) = slot.buffer.take() {
                if let Err(e) = self.service.buffer_ref_dec(buffer) {
                    error!("Failed to release buffer {}: {}", buffer, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::buffer::{BufferMode, GroupId, ServiceConfig};
    use crate::memory::BufferType;
    use crate::PixelFormat;

    fn slot_set(config: SlotsConfig) -> SlotSet {
        SlotSet::new(Arc::new(BufferService::new(ServiceConfig::new())), config)
    }

    #[test]
    fn test_four_slots() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(4).unwrap();

        for expected in 0..4 {
            assert_eq!(slots.get_unused().unwrap(), expected);
        }
        assert_eq!(slots.used_count(), 4);
        assert_eq!(slots.unused_count(), 0);

        let err = slots.get_unused().unwrap_err();
        assert!(err.is_fatal());
        if let SlotError::Fatal(violation) = err {
            assert!(violation.dump.contains("slot 3"));
        }

        // Nothing but readiness was pending on slot 0.
        slots.clr_flag(0, SlotUsage::CodecReady).unwrap();
        assert_eq!(slots.used_count(), 3);
        assert_eq!(slots.get_unused().unwrap(), 0);
    }

    #[test]
    fn test_exhaustion_retry() {
        let slots = slot_set(SlotsConfig::new().exhaustion(ExhaustionPolicy::Retry));
        slots.setup(1).unwrap();
        let index = slots.get_unused().unwrap();

        let err = slots.get_unused().unwrap_err();
        assert!(matches!(err, SlotError::NoFreeSlot));
        assert!(!err.is_fatal());

        slots.clr_flag(index, SlotUsage::CodecReady).unwrap();
        assert_eq!(slots.get_unused().unwrap(), index);
    }

    #[test]
    fn test_reclaim_when_all_interests_clear() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        let index = slots.get_unused().unwrap();

        slots.set_flag(index, SlotUsage::CodecUse).unwrap();
        slots.set_flag(index, SlotUsage::HalInput).unwrap();
        slots.set_flag(index, SlotUsage::HalInput).unwrap();
        slots.set_flag(index, SlotUsage::QueueUse).unwrap();
        assert_eq!(slots.status(index).unwrap().hal_use(), 2);

        let steps = [
            SlotUsage::CodecReady,
            SlotUsage::HalInput,
            SlotUsage::QueueUse,
            SlotUsage::HalInput,
        ];
        for usage in steps {
            slots.clr_flag(index, usage).unwrap();
            assert!(slots.status(index).unwrap().is_used(), "freed after {:?}", usage);
        }

        slots.clr_flag(index, SlotUsage::CodecUse).unwrap();
        assert!(!slots.status(index).unwrap().is_used());
        assert_eq!(slots.used_count(), 0);
    }

    #[test]
    fn test_hal_output() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(1).unwrap();
        let index = slots.get_unused().unwrap();

        slots.set_flag(index, SlotUsage::CodecUse).unwrap();
        slots.clr_flag(index, SlotUsage::CodecReady).unwrap();
        slots.set_flag(index, SlotUsage::HalOutput).unwrap();
        assert!(!slots.status(index).unwrap().is_ready());

        slots.clr_flag(index, SlotUsage::HalOutput).unwrap();
        let status = slots.status(index).unwrap();
        assert!(status.is_ready());
        assert!(!status.contains(SlotFlags::HAL_OUTPUT));
        assert_eq!(slots.decode_count(), 1);
    }

    #[test]
    fn test_counter_underflow() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        let index = slots.get_unused().unwrap();

        assert!(slots.clr_flag(index, SlotUsage::HalInput).unwrap_err().is_fatal());
        assert!(slots.clr_flag(index, SlotUsage::QueueUse).unwrap_err().is_fatal());
        // The failed calls changed nothing.
        assert_eq!(slots.status(index).unwrap().hal_use(), 0);
        assert!(slots.status(index).unwrap().is_used());
    }

    #[test]
    fn test_dequeue_without_queue_reference() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        let index = slots.get_unused().unwrap();
        slots.set_flag(index, SlotUsage::CodecUse).unwrap();
        slots.enqueue(index, SlotQueue::Display).unwrap();
        // Drops the reference the queue holds.
        slots.clr_flag(index, SlotUsage::QueueUse).unwrap();
        slots.clr_flag(index, SlotUsage::CodecReady).unwrap();

        let err = slots.dequeue(SlotQueue::Display).unwrap_err();
        assert!(err.is_fatal());
        // The slot is left on the queue untouched.
        assert_eq!(slots.queue_len(SlotQueue::Display), 1);
        assert_eq!(slots.status(index).unwrap().queue_use(), 0);
        assert_eq!(slots.display_count(), 0);
    }

    #[test]
    fn test_invalid_index() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();

        assert!(slots.set_flag(2, SlotUsage::CodecUse).unwrap_err().is_fatal());
        assert!(slots.enqueue(5, SlotQueue::Output).unwrap_err().is_fatal());
        // Slot 1 has not been handed out.
        assert!(slots.set_flag(1, SlotUsage::CodecUse).unwrap_err().is_fatal());
    }

    #[test]
    fn test_queue_fifo() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(4).unwrap();
        for _ in 0..3 {
            let index = slots.get_unused().unwrap();
            slots.set_flag(index, SlotUsage::QueueUse).unwrap();
            slots.clr_flag(index, SlotUsage::CodecReady).unwrap();
        }

        for index in [2, 0, 1] {
            slots.enqueue(index, SlotQueue::Display).unwrap();
        }
        assert_eq!(slots.queue_len(SlotQueue::Display), 3);
        assert!(slots.is_empty(SlotQueue::Output));

        let order: Vec<_> = (0..3)
            .map(|_| slots.dequeue(SlotQueue::Display).unwrap())
            .collect();
        assert_eq!(order, vec![2, 0, 1]);
        assert_eq!(slots.display_count(), 3);
        assert!(matches!(
            slots.dequeue(SlotQueue::Display),
            Err(SlotError::QueueEmpty(SlotQueue::Display))
        ));

        // Slots were kept by their extra queue reference.
        assert_eq!(slots.used_count(), 3);
        for index in order {
            slots.clr_flag(index, SlotUsage::QueueUse).unwrap();
        }
        assert_eq!(slots.used_count(), 0);
    }

    #[test]
    fn test_dequeue_not_ready_head() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        let first = slots.get_unused().unwrap();
        let second = slots.get_unused().unwrap();
        slots.set_flag(second, SlotUsage::CodecUse).unwrap();
        slots.clr_flag(second, SlotUsage::CodecReady).unwrap();

        slots.enqueue(first, SlotQueue::Output).unwrap();
        slots.enqueue(second, SlotQueue::Output).unwrap();
        let status = slots.status(first).unwrap();

        // The ready slot behind the head is not skipped.
        assert!(matches!(
            slots.dequeue(SlotQueue::Output),
            Err(SlotError::NotReady(SlotQueue::Output))
        ));
        assert_eq!(slots.status(first).unwrap(), status);
        assert_eq!(slots.queue_len(SlotQueue::Output), 2);
        assert_eq!(slots.display_count(), 0);

        slots.set_flag(first, SlotUsage::CodecUse).unwrap();
        slots.clr_flag(first, SlotUsage::CodecReady).unwrap();
        assert_eq!(slots.dequeue(SlotQueue::Output).unwrap(), first);
        assert_eq!(slots.dequeue(SlotQueue::Output).unwrap(), second);
    }

    #[test]
    fn test_enqueue_moves_between_queues() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(1).unwrap();
        let index = slots.get_unused().unwrap();

        slots.enqueue(index, SlotQueue::Deinterlace).unwrap();
        slots.enqueue(index, SlotQueue::Convert).unwrap();
        assert!(slots.is_empty(SlotQueue::Deinterlace));
        assert_eq!(slots.queue_len(SlotQueue::Convert), 1);
        assert_eq!(slots.status(index).unwrap().queue_use(), 2);
    }

    #[test]
    fn test_deferred_resize() {
        let slots = slot_set(SlotsConfig::new().exhaustion(ExhaustionPolicy::Retry));
        slots.setup(2).unwrap();
        let first = slots.get_unused().unwrap();
        slots.set_flag(first, SlotUsage::CodecUse).unwrap();
        slots.get_unused().unwrap();

        slots.setup(4).unwrap();
        assert_eq!(slots.count(), 2);
        assert!(matches!(slots.get_unused(), Err(SlotError::NoFreeSlot)));
        assert!(slots.status(2).unwrap_err().is_fatal());

        slots.ready();
        assert_eq!(slots.count(), 4);
        assert_eq!(slots.unused_count(), 2);
        let status = slots.status(first).unwrap();
        assert!(status.is_used());
        assert!(status.contains(SlotFlags::CODEC_USE));
        assert_eq!(slots.get_unused().unwrap(), 2);

        // Shrinking is not supported.
        slots.setup(1).unwrap();
        slots.ready();
        assert_eq!(slots.count(), 4);
    }

    #[test]
    fn test_smaller_setup_keeps_pending_growth() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        slots.setup(8).unwrap();
        slots.setup(4).unwrap();
        assert!(slots.is_changed());
        assert_eq!(slots.count(), 2);

        slots.ready();
        assert_eq!(slots.count(), 8);
        assert_eq!(slots.unused_count(), 8);
    }

    #[test]
    fn test_info_change() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(4).unwrap();
        let frame = Frame::new(PixelFormat::NV12, 1920, 1080);

        let index = slots.get_unused().unwrap();
        slots.set_prop(index, SlotValue::Frame(frame.clone())).unwrap();
        assert!(slots.is_changed());
        slots.ready();
        assert!(!slots.is_changed());
        assert_eq!(slots.get_size(), 1920 * 1088 * 9 / 5);
        assert_eq!(slots.frame_info().ver_stride, 1088);

        // Same geometry.
        let index = slots.get_unused().unwrap();
        slots.set_prop(index, SlotValue::Frame(frame.clone())).unwrap();
        assert!(!slots.is_changed());

        // New geometry stays pending until acknowledged, even if frames with
        // the old one show up in the meantime.
        let index = slots.get_unused().unwrap();
        let small = Frame::new(PixelFormat::NV12, 1280, 720);
        slots.set_prop(index, SlotValue::Frame(small.clone())).unwrap();
        assert!(slots.is_changed());
        let index = slots.get_unused().unwrap();
        slots.set_prop(index, SlotValue::Frame(frame)).unwrap();
        assert!(slots.is_changed());
        assert_eq!(slots.get_size(), 1920 * 1088 * 9 / 5);

        slots.ready();
        assert!(!slots.is_changed());
        assert_eq!(slots.frame_info().width, 1280);
        assert_eq!(slots.get_size(), 1280 * 720 * 9 / 5);
    }

    #[test]
    fn test_frame_requires_not_ready() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        let index = slots.get_unused().unwrap();
        slots.set_flag(index, SlotUsage::CodecUse).unwrap();
        slots.clr_flag(index, SlotUsage::CodecReady).unwrap();

        let frame = Frame::new(PixelFormat::NV12, 64, 64);
        let err = slots.set_prop(index, SlotValue::Frame(frame)).unwrap_err();
        assert!(err.is_fatal());
        assert!(slots.get_frame(index).unwrap().is_none());
    }

    #[test]
    fn test_buffer_released_with_slot() {
        let slots = slot_set(SlotsConfig::new());
        let service = Arc::clone(slots.service());
        let group = service.group_create("frames", BufferMode::Internal, BufferType::Normal);
        slots.setup(2).unwrap();

        let index = slots.get_unused().unwrap();
        let buffer = service.buffer_get(group, "frame", 4096).unwrap();
        slots.set_prop(index, SlotValue::Buffer(buffer)).unwrap();
        service.buffer_ref_dec(buffer).unwrap();
        assert_eq!(service.buffer_ref_count(buffer).unwrap(), 1);

        slots
            .set_prop(index, SlotValue::Frame(Frame::new(PixelFormat::NV12, 32, 32)))
            .unwrap();
        assert_eq!(slots.get_frame(index).unwrap().unwrap().buffer, Some(buffer));
        assert_eq!(slots.get_buffer(index).unwrap(), Some(buffer));

        slots.clr_flag(index, SlotUsage::CodecReady).unwrap();
        assert_eq!(service.buffer_ref_count(buffer).unwrap(), 0);
        assert_eq!(service.group_unused_count(group).unwrap(), 1);
        assert!(slots.get_frame(index).unwrap().is_none());
    }

    #[test]
    fn test_buffer_replaced() {
        let slots = slot_set(SlotsConfig::new());
        let service = Arc::clone(slots.service());
        let group = service.group_create("frames", BufferMode::Internal, BufferType::Normal);
        slots.setup(1).unwrap();
        let index = slots.get_unused().unwrap();

        let first = service.buffer_get(group, "first", 64).unwrap();
        let second = service.buffer_get(group, "second", 64).unwrap();
        slots.set_prop(index, SlotValue::Buffer(first)).unwrap();
        slots.set_prop(index, SlotValue::Buffer(second)).unwrap();
        assert_eq!(service.buffer_ref_count(first).unwrap(), 1);
        assert_eq!(service.buffer_ref_count(second).unwrap(), 2);

        // Setting the same buffer again keeps it alive.
        slots.set_prop(index, SlotValue::Buffer(second)).unwrap();
        assert_eq!(service.buffer_ref_count(second).unwrap(), 2);
    }

    #[test]
    fn test_listener_can_use_slots() {
        let slots = Arc::new(slot_set(SlotsConfig::new()));
        let service = Arc::clone(slots.service());
        let group = service.group_create("frames", BufferMode::Internal, BufferType::Normal);
        slots.setup(1).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        let listener_released = Arc::clone(&released);
        let listener_slots = Arc::downgrade(&slots);
        service
            .group_set_listener(
                group,
                Some(Arc::new(move |_: GroupId| {
                    if let Some(slots) = listener_slots.upgrade() {
                        // The slot has been freed before the buffer.
                        listener_released.store(slots.unused_count(), Ordering::SeqCst);
                    }
                })),
            )
            .unwrap();

        let index = slots.get_unused().unwrap();
        let buffer = service.buffer_get(group, "frame", 64).unwrap();
        slots.set_prop(index, SlotValue::Buffer(buffer)).unwrap();
        service.buffer_ref_dec(buffer).unwrap();
        slots.clr_flag(index, SlotUsage::CodecReady).unwrap();

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset() {
        let slots = slot_set(SlotsConfig::new());
        let service = Arc::clone(slots.service());
        let group = service.group_create("frames", BufferMode::Internal, BufferType::Normal);
        slots.setup(2).unwrap();

        let index = slots.get_unused().unwrap();
        let buffer = service.buffer_get(group, "frame", 64).unwrap();
        slots.set_prop(index, SlotValue::Buffer(buffer)).unwrap();
        service.buffer_ref_dec(buffer).unwrap();
        slots.set_flag(index, SlotUsage::CodecUse).unwrap();
        slots.set_flag(index, SlotUsage::HalInput).unwrap();
        slots.enqueue(index, SlotQueue::Output).unwrap();

        slots.reset(index).unwrap();
        assert!(slots.is_empty(SlotQueue::Output));
        assert_eq!(slots.used_count(), 0);
        assert_eq!(slots.status(index).unwrap(), SlotStatus::default());
        assert_eq!(service.buffer_ref_count(buffer).unwrap(), 0);

        // Resetting a free slot is harmless.
        slots.reset(1).unwrap();
        assert_eq!(slots.used_count(), 0);
    }

    #[test]
    fn test_default_info() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        slots
            .set_frame_info(&Frame::new(PixelFormat::NV12, 320, 240))
            .unwrap();
        assert_eq!(slots.get_size(), 320 * 240 * 9 / 5);

        let index = slots.get_unused().unwrap();
        let frame = slots.default_info(index).unwrap();
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!((frame.hor_stride, frame.ver_stride), (320, 240));
        assert!(slots.status(index).unwrap().contains(SlotFlags::HAS_FRAME));
        assert_eq!(slots.get_frame(index).unwrap(), Some(frame));

        // A frame is already attached.
        assert!(slots.default_info(index).unwrap_err().is_fatal());
    }

    #[test]
    fn test_eos() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(1).unwrap();
        let index = slots.get_unused().unwrap();

        slots.set_prop(index, SlotValue::Eos(true)).unwrap();
        assert!(slots.get_eos(index).unwrap());
        slots
            .set_prop(index, SlotValue::Frame(Frame::new(PixelFormat::NV12, 16, 16)))
            .unwrap();
        assert!(slots.get_frame(index).unwrap().unwrap().eos);

        slots.set_prop(index, SlotValue::Eos(false)).unwrap();
        assert_eq!(
            slots.with_frame(index, |frame| frame.eos).unwrap(),
            Some(false)
        );

        slots.set_eos(true);
        assert!(slots.eos());
    }

    #[test]
    fn test_scaling_and_alignment() {
        fn align_64(v: u32) -> u32 {
            (v + 63) & !63
        }

        let slots = slot_set(SlotsConfig::new());
        slots.setup(1).unwrap();
        assert!(slots.set_denominator(0).unwrap_err().is_fatal());
        slots.set_numerator(3).unwrap();
        slots.set_denominator(2).unwrap();
        slots.set_hor_align(align_64);

        slots
            .set_frame_info(&Frame::new(PixelFormat::NV12, 100, 100))
            .unwrap();
        let info = slots.frame_info();
        assert_eq!((info.hor_stride, info.ver_stride), (128, 112));
        assert_eq!(slots.get_size(), 128 * 112 * 3 / 2);
    }

    #[test]
    fn test_unrepresentable_frame() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        let index = slots.get_unused().unwrap();

        let huge = Frame::new(PixelFormat::NV12, u32::MAX - 3, 16);
        let err = slots.set_prop(index, SlotValue::Frame(huge.clone())).unwrap_err();
        assert!(err.is_fatal());
        assert!(slots.get_frame(index).unwrap().is_none());
        assert!(!slots.is_changed());
        assert!(slots.set_frame_info(&huge).unwrap_err().is_fatal());

        // The set is left as it was.
        assert_eq!(slots.frame_info(), FrameInfo::default());
        slots
            .set_prop(index, SlotValue::Frame(Frame::new(PixelFormat::NV12, 64, 64)))
            .unwrap();
        assert!(slots.is_changed());
        assert_eq!(slots.get_unused().unwrap(), 1 - index);
    }

    #[test]
    fn test_len_align_large_frame() {
        fn len_4k(v: usize) -> usize {
            v.checked_add(4095).map_or(0, |v| v & !4095)
        }

        let slots = slot_set(SlotsConfig::new());
        slots.setup(1).unwrap();
        slots.set_len_align(Some(len_4k));
        slots
            .set_frame_info(&Frame::new(PixelFormat::NV12, 65536, 65536))
            .unwrap();
        assert!(slots.get_size() >= 65536 * 65536);

        slots.set_len_align(None);
        slots
            .set_frame_info(&Frame::new(PixelFormat::NV12, 64, 64))
            .unwrap();
        assert_eq!(slots.get_size(), 64 * 64 * 9 / 5);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        const FRAMES: u64 = 500;

        let slots = Arc::new(slot_set(
            SlotsConfig::new().exhaustion(ExhaustionPolicy::Retry),
        ));
        let service = Arc::clone(slots.service());
        let group = service.group_create("frames", BufferMode::Internal, BufferType::Normal);
        slots.setup(4).unwrap();

        let producer = {
            let slots = Arc::clone(&slots);
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                for _ in 0..FRAMES {
                    let index = loop {
                        match slots.get_unused() {
                            Ok(index) => break index,
                            Err(SlotError::NoFreeSlot) => std::thread::yield_now(),
                            Err(e) => panic!("{}", e),
                        }
                    };
                    let buffer = service.buffer_get(group, "frame", 4096).unwrap();
                    slots.set_prop(index, SlotValue::Buffer(buffer)).unwrap();
                    service.buffer_ref_dec(buffer).unwrap();
                    slots
                        .set_prop(index, SlotValue::Frame(Frame::new(PixelFormat::NV12, 64, 64)))
                        .unwrap();
                    slots.enqueue(index, SlotQueue::Display).unwrap();
                    slots.clr_flag(index, SlotUsage::CodecReady).unwrap();
                }
            })
        };

        let consumer = {
            let slots = Arc::clone(&slots);
            std::thread::spawn(move || {
                let mut displayed = 0;
                while displayed < FRAMES {
                    match slots.dequeue(SlotQueue::Display) {
                        Ok(_) => displayed += 1,
                        Err(SlotError::QueueEmpty(_)) | Err(SlotError::NotReady(_)) => {
                            std::thread::yield_now()
                        }
                        Err(e) => panic!("{}", e),
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();

        assert_eq!(slots.used_count(), 0);
        assert_eq!(slots.display_count(), FRAMES);
        assert!(slots.is_empty(SlotQueue::Display));
        let info = service.group_get_by_id(group).unwrap();
        assert_eq!(info.count_used, 0);
        assert!(info.count <= 4);
    }

    #[test]
    fn test_dump_and_history() {
        let slots = slot_set(SlotsConfig::new());
        slots.setup(2).unwrap();
        let index = slots.get_unused().unwrap();
        slots.enqueue(index, SlotQueue::Output).unwrap();

        let dump = slots.dump();
        assert!(dump.contains("on Output"));
        assert!(dump.contains("Enqueue(Output)"));

        // Acknowledging a change starts a new history.
        slots.ready();
        assert!(!slots.dump().contains("history:"));
    }
}
