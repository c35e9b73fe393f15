//! Derivation of the memory layout hardware needs for a frame.
use crate::frame::{Frame, FrameInfo};

/// Rounds a dimension up to what the hardware requires.
pub type AlignFn = fn(u32) -> u32;

/// Rounds the size of a buffer up to what the hardware requires.
pub type LenAlignFn = fn(usize) -> usize;

/// Round `v` up to the next multiple of 16, or return 0 if the result does
/// not fit in a `u32`.
pub fn default_align_16(v: u32) -> u32 {
    v.checked_add(15).map_or(0, |v| v & !15)
}

/// Alignment functions applied when deriving a frame's geometry.
#[derive(Debug, Clone, Copy)]
pub(super) struct Alignment {
    pub(super) hor: AlignFn,
    pub(super) ver: AlignFn,
    /// Replaces the numerator/denominator scaling of the buffer size if set.
    pub(super) len: Option<LenAlignFn>,
    /// Applied to the width before computing a default stride.
    pub(super) width: Option<AlignFn>,
}

impl Default for Alignment {
    fn default() -> Self {
        Alignment {
            hor: default_align_16,
            ver: default_align_16,
            len: None,
            width: None,
        }
    }
}

/// Applies `f` to `v`, rejecting results that went down, which is how
/// alignment functions report overflow.
fn align_up<T: Copy + PartialOrd>(f: fn(T) -> T, v: T) -> Option<T> {
    let aligned = f(v);
    (aligned >= v).then_some(aligned)
}

/// Computes the geometry hardware needs to hold `frame`. Strides requested by
/// the codec are aligned further; missing ones are derived from the frame
/// size and bit depth.
///
/// Returns `None` if the geometry cannot be represented.
pub(super) fn derive_info(
    frame: &Frame,
    align: &Alignment,
    numerator: u32,
    denominator: u32,
) -> Option<FrameInfo> {
    let depth = frame.format.bit_depth();
    let coded_width = match align.width {
        Some(f) => align_up(f, frame.width)?,
        None => frame.width,
    };

    let hor_stride = if frame.hor_stride != 0 {
        align_up(align.hor, frame.hor_stride)?
    } else {
        let row = u64::from(coded_width) * u64::from(depth) / 8;
        align_up(align.hor, u32::try_from(row).ok()?)?
    };
    let ver_stride = if frame.ver_stride != 0 {
        align_up(align.ver, frame.ver_stride)?
    } else {
        align_up(align.ver, frame.height)?
    };

    let plane = (hor_stride as usize).checked_mul(ver_stride as usize)?;
    let buf_size = match align.len {
        Some(len_align) => align_up(len_align, plane)?,
        None => plane
            .checked_mul(numerator as usize)?
            .checked_div(denominator as usize)?,
    };

    Some(FrameInfo {
        width: frame.width,
        height: frame.height,
        format: frame.format,
        hor_stride,
        ver_stride,
        buf_size,
    })
}

/// State of the geometry negotiation between producers and consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum Negotiation {
    /// Frames match the committed geometry.
    #[default]
    Stable,
    /// A frame with a different geometry has been attached. It becomes the
    /// committed one when the consumer calls `ready()`.
    Staged(FrameInfo),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;

    #[test]
    fn test_default_align() {
        assert_eq!(default_align_16(0), 0);
        assert_eq!(default_align_16(1), 16);
        assert_eq!(default_align_16(1088), 1088);
        assert_eq!(default_align_16(1090), 1104);
        assert_eq!(default_align_16(u32::MAX - 15), u32::MAX - 15);
        assert_eq!(default_align_16(u32::MAX - 3), 0);
    }

    #[test]
    fn test_derive_from_size() {
        let frame = Frame::new(PixelFormat::NV12, 1920, 1080);
        let info = derive_info(&frame, &Alignment::default(), 3, 2).unwrap();
        assert_eq!((info.hor_stride, info.ver_stride), (1920, 1088));
        assert_eq!(info.buf_size, 1920 * 1088 * 3 / 2);
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn test_derive_high_bit_depth() {
        let frame = Frame::new(PixelFormat::NV15, 1280, 720);
        let info = derive_info(&frame, &Alignment::default(), 9, 5).unwrap();
        // 10 bits per sample.
        assert_eq!(info.hor_stride, 1600);
        assert_eq!(info.ver_stride, 720);
        assert_eq!(info.buf_size, 1600 * 720 * 9 / 5);
    }

    #[test]
    fn test_derive_codec_strides() {
        fn align_64(v: u32) -> u32 {
            (v + 63) & !63
        }
        fn len_4k(v: usize) -> usize {
            (v + 4095) & !4095
        }

        let frame = Frame::new(PixelFormat::NV12, 176, 144).with_strides(180, 150);
        let align = Alignment {
            hor: align_64,
            len: Some(len_4k),
            ..Default::default()
        };
        let info = derive_info(&frame, &align, 9, 5).unwrap();
        assert_eq!((info.hor_stride, info.ver_stride), (192, 160));
        assert_eq!(info.buf_size, 32768);

        let align = Alignment {
            width: Some(align_64),
            ..Default::default()
        };
        let info = derive_info(&Frame::new(PixelFormat::NV12, 176, 144), &align, 1, 1).unwrap();
        assert_eq!(info.hor_stride, 192);
    }

    #[test]
    fn test_derive_unrepresentable() {
        let align = Alignment::default();

        // Stride alignment wraps around.
        let frame = Frame::new(PixelFormat::NV12, u32::MAX - 3, 16);
        assert!(derive_info(&frame, &align, 1, 1).is_none());
        let frame = Frame::new(PixelFormat::NV12, 16, 16).with_strides(16, u32::MAX - 3);
        assert!(derive_info(&frame, &align, 1, 1).is_none());

        // 10-bit rows wider than a u32.
        let frame = Frame::new(PixelFormat::NV15, u32::MAX - 15, 16);
        assert!(derive_info(&frame, &align, 1, 1).is_none());

        // Scaling overflows.
        let frame = Frame::new(PixelFormat::NV12, 1 << 24, 1 << 24);
        assert!(derive_info(&frame, &align, 1 << 20, 1).is_none());
        assert!(derive_info(&frame, &align, 1, 0).is_none());
    }

    #[test]
    fn test_derive_len_align_large_plane() {
        fn len_4k(v: usize) -> usize {
            v.checked_add(4095).map_or(0, |v| v & !4095)
        }

        let frame = Frame::new(PixelFormat::NV12, 65536, 65536);
        let align = Alignment {
            len: Some(len_4k),
            ..Default::default()
        };
        let info = derive_info(&frame, &align, 1, 1).unwrap();
        assert_eq!(info.buf_size, 65536 * 65536);

        let frame = Frame::new(PixelFormat::NV12, 65536, 65536 + 1);
        let info = derive_info(&frame, &align, 1, 1).unwrap();
        assert_eq!(info.buf_size, 65536 * (65536 + 16));
    }
}
