//! The frame value exchanged between codecs, hardware and consumers.
//!
//! A `Frame` is a plain value: copying it copies its geometry and metadata,
//! and the buffer it points to (if any) is only referenced through its
//! handle. Keeping that buffer alive is the job of whoever holds a reference
//! on it, typically the slot the frame is attached to.
use std::fmt;

use crate::buffer::BufferHandle;
use crate::{ChromaLocation, ColorMatrix, ColorPrimaries, ColorRange, ColorTransfer, PixelFormat};

/// Color description of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorInfo {
    pub range: ColorRange,
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub matrix: ColorMatrix,
    pub chroma_location: ChromaLocation,
}

/// A decoded (or to be encoded) picture.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per line. Zero lets the slot set derive it from `width`.
    pub hor_stride: u32,
    /// Lines per plane. Zero lets the slot set derive it from `height`.
    pub ver_stride: u32,
    /// Size of the memory required to hold the frame.
    pub buf_size: usize,
    /// Presentation timestamp, in stream time base units.
    pub pts: i64,
    /// Whether this frame is the last one of the stream.
    pub eos: bool,
    pub color: ColorInfo,
    /// Memory backing the frame, if any.
    pub buffer: Option<BufferHandle>,
}

impl Frame {
    /// Create a frame of the given format and visible size, with strides left
    /// for the slot set to derive.
    ///
    /// # Examples
    ///
    /// ```
    /// # use codecbuf::{frame::Frame, PixelFormat};
    /// let frame = Frame::new(PixelFormat::NV12, 1920, 1080);
    /// assert_eq!(frame.width, 1920);
    /// assert_eq!(frame.hor_stride, 0);
    /// assert!(frame.buffer.is_none());
    /// ```
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Frame {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    /// Set the strides the codec requires for this frame.
    pub fn with_strides(mut self, hor_stride: u32, ver_stride: u32) -> Self {
        self.hor_stride = hor_stride;
        self.ver_stride = ver_stride;
        self
    }

    /// Returns the geometry part of this frame.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            width: self.width,
            height: self.height,
            format: self.format,
            hor_stride: self.hor_stride,
            ver_stride: self.ver_stride,
            buf_size: self.buf_size,
        }
    }

    /// Overwrite the geometry of this frame with `info`, leaving metadata
    /// and buffer untouched.
    pub fn apply_info(&mut self, info: &FrameInfo) {
        self.width = info.width;
        self.height = info.height;
        self.format = info.format;
        self.hor_stride = info.hor_stride;
        self.ver_stride = info.ver_stride;
        self.buf_size = info.buf_size;
    }
}

/// Geometry of a frame as laid out in memory. This is what consumers need to
/// know to allocate buffers, and what a `SlotSet` negotiates on format
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub buf_size: usize,
}

impl From<&Frame> for FrameInfo {
    fn from(frame: &Frame) -> Self {
        frame.info()
    }
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (stride {}x{}), {} bytes",
            self.format, self.width, self.height, self.hor_stride, self.ver_stride, self.buf_size
        )
    }
}
