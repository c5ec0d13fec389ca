//! Frame types crossing the decode boundary.
//!
//! Raw frames (`RawVideoFrame`, `RawAudioFrame`) come out of a codec and still carry
//! stream-native timestamps and pixel/sample formats. Presentable frames (`VideoFrame`)
//! are what the decode stage pushes into the frame queue: independently owned, timestamped
//! in seconds and tagged with the layout the presentation backend must handle.

use std::fmt;

use crate::core::time::Seconds;
use crate::media::DecodeError;

/// Source pixel formats the pipeline knows how to handle natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit planar Y, U, V with 2x2 chroma subsampling
    Yuv420p,
    /// 8-bit Y plane followed by an interleaved UV plane (2x2 subsampled)
    Nv12,
    Rgb24,
    Rgba,
    Bgra,
    /// Backend-specific format id the generic converter cannot handle
    Other(i32),
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Yuv420p => write!(f, "yuv420p"),
            PixelFormat::Nv12 => write!(f, "nv12"),
            PixelFormat::Rgb24 => write!(f, "rgb24"),
            PixelFormat::Rgba => write!(f, "rgba"),
            PixelFormat::Bgra => write!(f, "bgra"),
            PixelFormat::Other(id) => write!(f, "pixfmt#{}", id),
        }
    }
}

/// One image plane: tightly owned bytes plus the row stride in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, stride: usize) -> Self {
        Self { data, stride }
    }

    /// Row `y` of the plane, `width` bytes long.
    #[inline]
    pub fn row(&self, y: usize, width: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + width]
    }
}

/// CPU-resident decoded image in its source pixel format.
#[derive(Debug, Clone)]
pub struct PlanarImage {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

impl PlanarImage {
    /// Check that the planes are large enough for the declared format and size.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let w = self.width as usize;
        let h = self.height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        let required: Vec<(usize, usize)> = match self.format {
            PixelFormat::Yuv420p => vec![(w, h), (cw, ch), (cw, ch)],
            PixelFormat::Nv12 => vec![(w, h), (cw * 2, ch)],
            PixelFormat::Rgb24 => vec![(w * 3, h)],
            PixelFormat::Rgba | PixelFormat::Bgra => vec![(w * 4, h)],
            PixelFormat::Other(_) => return Ok(()),
        };
        if self.planes.len() < required.len() {
            return Err(DecodeError::Codec(format!(
                "{} image has {} planes, expected {}",
                self.format,
                self.planes.len(),
                required.len()
            )));
        }
        for (i, (row_bytes, rows)) in required.into_iter().enumerate() {
            let plane = &self.planes[i];
            if rows > 0 && (plane.stride < row_bytes || plane.data.len() < plane.stride * (rows - 1) + row_bytes) {
                return Err(DecodeError::Codec(format!(
                    "{} plane {} too small for {}x{}",
                    self.format, i, self.width, self.height
                )));
            }
        }
        Ok(())
    }
}

/// Layout tag selecting the presentation path for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Separate luma and interleaved chroma planes, converted to RGB by the shader
    Biplanar,
    /// Packed 32-bit BGRA
    Packed,
}

/// Pixel storage of a presentable frame.
#[derive(Debug, Clone)]
pub enum FramePixels {
    Nv12 { luma: Plane, chroma: Plane },
    Bgra(Plane),
}

/// A decoded, independently owned, presentable video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation timestamp in seconds
    pub pts: Seconds,
    pub width: u32,
    pub height: u32,
    pub pixels: FramePixels,
}

impl VideoFrame {
    pub fn layout(&self) -> PixelLayout {
        match self.pixels {
            FramePixels::Nv12 { .. } => PixelLayout::Biplanar,
            FramePixels::Bgra(_) => PixelLayout::Packed,
        }
    }

    /// Total bytes held by the frame.
    pub fn byte_len(&self) -> usize {
        match &self.pixels {
            FramePixels::Nv12 { luma, chroma } => luma.data.len() + chroma.data.len(),
            FramePixels::Bgra(plane) => plane.data.len(),
        }
    }
}

/// A decoded image still referencing a hardware surface owned by the decoder's pool.
///
/// The surface is only valid until the next call into the decoder, so the decode stage
/// downloads it immediately, while holding the GPU lock.
pub trait HardwareSurface: Send {
    /// Copy the surface into CPU memory. Hardware decoders typically yield NV12.
    fn download(&self) -> Result<PlanarImage, DecodeError>;
}

/// Image payload of a raw decoded frame.
pub enum RawImage {
    Surface(Box<dyn HardwareSurface>),
    Software(PlanarImage),
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawImage::Surface(_) => f.write_str("RawImage::Surface(..)"),
            RawImage::Software(image) => f
                .debug_tuple("RawImage::Software")
                .field(&image.format)
                .finish(),
        }
    }
}

/// Frame as produced by a video codec.
#[derive(Debug)]
pub struct RawVideoFrame {
    /// Timestamp in stream time-base ticks
    pub pts: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub image: RawImage,
}

/// Sample encoding of raw decoded audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// Full description of a raw audio format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// One plane per channel when true, interleaved in plane 0 otherwise
    pub planar: bool,
}

/// Audio as produced by an audio codec.
#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    /// Timestamp in stream time-base ticks
    pub pts: Option<i64>,
    pub format: AudioFormat,
    /// Samples per channel
    pub samples: usize,
    pub planes: Vec<Vec<u8>>,
}
