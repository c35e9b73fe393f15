use codecbuf::buffer::{BufferError, BufferHandle, BufferService};
use codecbuf::frame::FrameInfo;
use codecbuf::PixelFormat;
use log::trace;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewFrameGeneratorError {
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("stride {stride} is smaller than width {width}")]
    InvalidStride { width: u32, stride: u32 },
    #[error("vertical stride {ver_stride} is smaller than height {height}")]
    InvalidVerStride { height: u32, ver_stride: u32 },
}

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("provided buffer is too small")]
    BufferTooSmall,
    #[error("error while writing buffer: {0}")]
    Buffer(#[from] BufferError),
}

/// Generates a moving NV12 test pattern laid out as described by a
/// `FrameInfo`.
pub struct FrameGenerator {
    info: FrameInfo,
    step: u32,
}

impl FrameGenerator {
    pub fn new(info: FrameInfo) -> Result<Self, NewFrameGeneratorError> {
        if info.format != PixelFormat::NV12 {
            return Err(NewFrameGeneratorError::UnsupportedFormat(info.format));
        }
        if info.hor_stride < info.width {
            return Err(NewFrameGeneratorError::InvalidStride {
                width: info.width,
                stride: info.hor_stride,
            });
        }
        if info.ver_stride < info.height {
            return Err(NewFrameGeneratorError::InvalidVerStride {
                height: info.height,
                ver_stride: info.ver_stride,
            });
        }

        Ok(FrameGenerator { info, step: 0 })
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    /// Number of bytes written by `next_frame`: a luma plane followed by a
    /// half-height interleaved chroma plane.
    pub fn frame_size(&self) -> usize {
        let plane = self.info.hor_stride as usize * self.info.ver_stride as usize;
        plane + plane / 2
    }

    pub fn next_frame<S: AsMut<[u8]>>(&mut self, frame: &mut S) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall);
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    /// Generate the next frame straight into `buffer`.
    pub fn write_to(
        &mut self,
        service: &BufferService,
        buffer: BufferHandle,
    ) -> Result<(), GenerateFrameError> {
        if service.buffer_info(buffer)?.size < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall);
        }
        let mut frame = vec![0u8; self.frame_size()];
        self.next_frame(&mut frame)?;
        service.buffer_write(buffer, 0, &frame)?;
        trace!("Frame {} written to buffer {}", self.step, buffer);

        Ok(())
    }

    fn gen_pattern(&self, frame: &mut [u8]) {
        let stride = self.info.hor_stride as usize;
        let width = self.info.width as usize;
        let height = self.info.height as usize;
        let (luma, chroma) = frame.split_at_mut(stride * self.info.ver_stride as usize);

        luma.chunks_exact_mut(stride)
            .take(height)
            .map(|l| &mut l[0..width])
            .enumerate()
            .for_each(|(y, line)| {
                line.iter_mut().enumerate().for_each(|(x, pixel)| {
                    *pixel = self.step.wrapping_add((x ^ y) as u32) as u8;
                });
            });

        chroma
            .chunks_exact_mut(stride)
            .take((height + 1) / 2)
            .map(|l| &mut l[0..width & !1])
            .enumerate()
            .for_each(|(y, line)| {
                line.chunks_exact_mut(2).enumerate().for_each(|(x, cbcr)| {
                    cbcr[0] = (x as u32).wrapping_add(self.step) as u8;
                    cbcr[1] = (y as u32).wrapping_sub(self.step) as u8;
                });
            });
    }
}

#[cfg(test)]
mod tests {
    use codecbuf::buffer::{BufferMode, ServiceConfig};
    use codecbuf::memory::BufferType;

    use super::*;

    fn info(width: u32, height: u32, hor_stride: u32, ver_stride: u32) -> FrameInfo {
        FrameInfo {
            width,
            height,
            format: PixelFormat::NV12,
            hor_stride,
            ver_stride,
            buf_size: 0,
        }
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(matches!(
            FrameGenerator::new(info(64, 32, 48, 32)),
            Err(NewFrameGeneratorError::InvalidStride { .. })
        ));
        assert!(matches!(
            FrameGenerator::new(info(64, 32, 64, 16)),
            Err(NewFrameGeneratorError::InvalidVerStride { .. })
        ));
        assert!(matches!(
            FrameGenerator::new(FrameInfo {
                format: PixelFormat::P010,
                ..info(64, 32, 64, 32)
            }),
            Err(NewFrameGeneratorError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_pattern_moves() {
        let mut gen = FrameGenerator::new(info(16, 8, 32, 16)).unwrap();
        assert_eq!(gen.frame_size(), 32 * 16 * 3 / 2);

        let mut small = vec![0u8; gen.frame_size() - 1];
        assert!(matches!(
            gen.next_frame(&mut small),
            Err(GenerateFrameError::BufferTooSmall)
        ));

        let mut first = vec![0u8; gen.frame_size()];
        let mut second = first.clone();
        gen.next_frame(&mut first).unwrap();
        gen.next_frame(&mut second).unwrap();
        assert_ne!(first, second);
        // Padding is left alone.
        assert_eq!(first[16..32], [0u8; 16]);
    }

    #[test]
    fn test_write_to_buffer() {
        let service = BufferService::new(ServiceConfig::new());
        let group = service.group_create("gen", BufferMode::Internal, BufferType::Normal);
        let mut gen = FrameGenerator::new(info(16, 16, 16, 16)).unwrap();

        let small = service.buffer_get(group, "small", 64).unwrap();
        assert!(matches!(
            gen.write_to(&service, small),
            Err(GenerateFrameError::BufferTooSmall)
        ));

        let buffer = service.buffer_get(group, "frame", gen.frame_size()).unwrap();
        gen.write_to(&service, buffer).unwrap();
        let mut luma = [0u8; 2];
        service.buffer_read(buffer, 16, &mut luma).unwrap();
        // Start of the second line of the first frame.
        assert_eq!(luma, [1, 0]);
    }
}
