//! This library tracks the memory that moves between a video codec pipeline
//! and fixed-function decode/encode hardware. It provides two layers that are
//! meant to be used together:
//!
//! * The `buffer` module provides reference-counted buffers, organized into
//!   groups that share an allocation backend and size/count limits. Buffers
//!   that are no longer referenced return to their group and can be picked up
//!   again for a new frame, so steady-state decoding does not allocate.
//!
//! * The `slot` module provides `SlotSet`, a fixed-capacity array of per-frame
//!   state machines. Each slot records who currently has an interest in a
//!   frame (the codec keeping it as a reference, the hardware reading or
//!   writing it, display or post-processing queues) and releases its frame and
//!   buffer once nobody does anymore. It also negotiates frame geometry
//!   changes so that consumers can reallocate before new-sized frames flow.
//!
//! Memory itself comes from an `Allocator` (see the `memory` module), selected
//! per group. Two reference allocators are provided: a heap one and a
//! memfd-backed one that hands out file descriptors the way dma-buf exporters
//! do.
//!
//! Misuse of either layer (decrementing a reference that is not held,
//! underflowing a usage counter, running out of slots...) is reported as a
//! `Fatal` error carrying a dump of the internal state, so the host can decide
//! whether to log and exit or try to recover.
pub mod buffer;
pub mod frame;
pub mod history;
pub mod memory;
pub mod slot;

use std::fmt;

use enumn::N;

/// A Fourcc pixel format. It can be converted back and forth from a 32-bit
/// integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 8-bit 4:2:0, Y plane followed by interleaved CbCr.
    pub const NV12: PixelFormat = PixelFormat::from_fourcc(b"NV12");
    /// 10-bit packed 4:2:0, NV12 layout.
    pub const NV15: PixelFormat = PixelFormat::from_fourcc(b"NV15");
    /// 8-bit 4:2:2, Y plane followed by interleaved CbCr.
    pub const NV16: PixelFormat = PixelFormat::from_fourcc(b"NV16");
    /// 10-bit packed 4:2:2, NV16 layout.
    pub const NV20: PixelFormat = PixelFormat::from_fourcc(b"NV20");
    /// 8-bit 4:4:4, Y plane followed by interleaved CbCr.
    pub const NV24: PixelFormat = PixelFormat::from_fourcc(b"NV24");
    /// 10-bit packed 4:4:4, NV24 layout.
    pub const NV30: PixelFormat = PixelFormat::from_fourcc(b"NV30");
    /// 10-bit 4:2:0 stored in the high bits of 16-bit words.
    pub const P010: PixelFormat = PixelFormat::from_fourcc(b"P010");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Returns the number of bits used per luma sample.
    ///
    /// # Examples
    ///
    /// ```
    /// # use codecbuf::PixelFormat;
    /// assert_eq!(PixelFormat::NV12.bit_depth(), 8);
    /// assert_eq!(PixelFormat::NV15.bit_depth(), 10);
    /// ```
    pub fn bit_depth(self) -> u32 {
        match &self.to_fourcc() {
            b"NV15" | b"NV20" | b"NV30" | b"P010" | b"P210" => 10,
            _ => 8,
        }
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use codecbuf::PixelFormat;
/// // Fourcc representation of NV12.
/// let nv12 = u32::from_le(0x3231564e);
/// let f = PixelFormat::from(nv12);
/// assert_eq!(u32::from(f), nv12);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

/// Converts a pixel format back to its 32-bit representation.
impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"NV12") into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use codecbuf::PixelFormat;
/// let nv12 = b"NV12";
/// let f = PixelFormat::from(nv12);
/// assert_eq!(&<[u8; 4]>::from(f), nv12);
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

/// Convert a pixel format back to its 4-character representation.
impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use codecbuf::PixelFormat;
/// // Fourcc representation of NV12.
/// let nv12 = u32::from_le(0x3231564e);
/// let f = PixelFormat::from(nv12);
/// assert_eq!(format!("{:?}", f), "0x3231564e (NV12)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// Produces a displayable form of this PixelFormat.
///
/// # Examples
///
/// ```
/// # use codecbuf::PixelFormat;
/// let f = PixelFormat::from(b"NV12");
/// assert_eq!(f.to_string(), "NV12");
/// ```
impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Reads debug flags from environment variable `var`, as a decimal or
/// `0x`-prefixed hexadecimal value. Unset or invalid values read as zero.
pub(crate) fn env_flags(var: &str) -> u32 {
    match std::env::var(var) {
        Ok(value) => match parse_flags(&value) {
            Some(flags) => flags,
            None => {
                log::warn!("Ignoring invalid {} value {:?}", var, value);
                0
            }
        },
        Err(_) => 0,
    }
}

fn parse_flags(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

// The color description enums below use the code points of ISO/IEC 23091-4,
// which is what bitstreams carry and what hardware expects.

/// Range of the sample values.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, N)]
pub enum ColorRange {
    #[default]
    Unspecified = 0,
    /// Limited ("MPEG", "TV") range.
    Limited = 1,
    /// Full ("JPEG", "PC") range.
    Full = 2,
}

/// Chromaticity coordinates of the source primaries.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, N)]
pub enum ColorPrimaries {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470M = 4,
    Bt470BG = 5,
    Smpte170M = 6,
    Smpte240M = 7,
    Film = 8,
    Bt2020 = 9,
    Smpte428 = 10,
    Smpte431 = 11,
    Smpte432 = 12,
    Ebu3213 = 22,
}

/// Transfer characteristics of the source.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, N)]
pub enum ColorTransfer {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Gamma22 = 4,
    Gamma28 = 5,
    Smpte170M = 6,
    Smpte240M = 7,
    Linear = 8,
    Log = 9,
    LogSqrt = 10,
    Iec61966_2_4 = 11,
    Bt1361 = 12,
    Iec61966_2_1 = 13,
    Bt2020_10 = 14,
    Bt2020_12 = 15,
    Smpte2084 = 16,
    Smpte428 = 17,
    AribStdB67 = 18,
}

/// Matrix coefficients used to derive luma and chroma from RGB.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, N)]
pub enum ColorMatrix {
    Rgb = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Fcc = 4,
    Bt470BG = 5,
    Smpte170M = 6,
    Smpte240M = 7,
    YCgCo = 8,
    Bt2020Ncl = 9,
    Bt2020Cl = 10,
    Smpte2085 = 11,
    ChromaDerivedNcl = 12,
    ChromaDerivedCl = 13,
    ICtCp = 14,
}

/// Location of chroma samples relative to luma samples.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, N)]
pub enum ChromaLocation {
    #[default]
    Unspecified = 0,
    Left = 1,
    Center = 2,
    TopLeft = 3,
    Top = 4,
    BottomLeft = 5,
    Bottom = 6,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_flags("3"), Some(3));
        assert_eq!(parse_flags(" 0x10 "), Some(16));
        assert_eq!(parse_flags("0X2"), Some(2));
        assert_eq!(parse_flags("debug"), None);
    }

    #[test]
    fn test_color_from_code_point() {
        assert_eq!(ColorPrimaries::n(9), Some(ColorPrimaries::Bt2020));
        assert_eq!(ColorTransfer::n(16), Some(ColorTransfer::Smpte2084));
        assert_eq!(ColorMatrix::n(3), None);
        assert_eq!(ColorRange::default(), ColorRange::Unspecified);
    }
}
