//! Colorspace conversion of software-decoded frames to packed BGRA.
//!
//! The video decode stage keeps one converter alive and rebuilds it whenever the source
//! pixel format or frame size changes. YUV input uses BT.601 limited-range coefficients in
//! 8.8 fixed point.

use crate::media::frame::{PixelFormat, PlanarImage, Plane};
use crate::media::DecodeError;

/// Converts frames of one source format and size into packed BGRA.
pub trait PixelConverter: Send {
    fn source_format(&self) -> PixelFormat;

    fn size(&self) -> (u32, u32);

    /// Convert `image` into a tightly packed BGRA plane (`stride == width * 4`).
    fn convert(&mut self, image: &PlanarImage) -> Result<Plane, DecodeError>;

    /// Whether this converter was built for `format` at `width`x`height`.
    fn matches(&self, format: PixelFormat, width: u32, height: u32) -> bool {
        self.source_format() == format && self.size() == (width, height)
    }
}

/// Create the built-in converter for `format`.
pub fn software_converter(
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Box<dyn PixelConverter>, DecodeError> {
    match format {
        PixelFormat::Other(_) => Err(DecodeError::UnsupportedPixelFormat(format)),
        _ => Ok(Box::new(SoftwareConverter { format, width, height })),
    }
}

/// Pure-Rust converter covering the formats of [`PixelFormat`].
#[derive(Debug)]
pub struct SoftwareConverter {
    format: PixelFormat,
    width: u32,
    height: u32,
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited range YUV to (b, g, r)
#[inline]
pub fn yuv_to_bgr(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = clamp_u8((c + 409 * e + 128) >> 8);
    let g = clamp_u8((c - 100 * d - 208 * e + 128) >> 8);
    let b = clamp_u8((c + 516 * d + 128) >> 8);
    (b, g, r)
}

impl PixelConverter for SoftwareConverter {
    fn source_format(&self) -> PixelFormat {
        self.format
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn convert(&mut self, image: &PlanarImage) -> Result<Plane, DecodeError> {
        if !self.matches(image.format, image.width, image.height) {
            return Err(DecodeError::Codec(format!(
                "converter built for {} {}x{} got {} {}x{}",
                self.format, self.width, self.height, image.format, image.width, image.height
            )));
        }
        image.validate()?;

        let w = self.width as usize;
        let h = self.height as usize;
        let stride = w * 4;
        let mut out = vec![0u8; stride * h];

        match self.format {
            PixelFormat::Yuv420p => {
                let (yp, up, vp) = (&image.planes[0], &image.planes[1], &image.planes[2]);
                for row in 0..h {
                    let dst = &mut out[row * stride..(row + 1) * stride];
                    for col in 0..w {
                        let y = yp.data[row * yp.stride + col];
                        let u = up.data[(row / 2) * up.stride + col / 2];
                        let v = vp.data[(row / 2) * vp.stride + col / 2];
                        let (b, g, r) = yuv_to_bgr(y, u, v);
                        dst[col * 4..col * 4 + 4].copy_from_slice(&[b, g, r, 255]);
                    }
                }
            }
            PixelFormat::Nv12 => {
                let (yp, uv) = (&image.planes[0], &image.planes[1]);
                for row in 0..h {
                    let dst = &mut out[row * stride..(row + 1) * stride];
                    for col in 0..w {
                        let y = yp.data[row * yp.stride + col];
                        let base = (row / 2) * uv.stride + (col / 2) * 2;
                        let (b, g, r) = yuv_to_bgr(y, uv.data[base], uv.data[base + 1]);
                        dst[col * 4..col * 4 + 4].copy_from_slice(&[b, g, r, 255]);
                    }
                }
            }
            PixelFormat::Rgb24 => {
                let src = &image.planes[0];
                for row in 0..h {
                    let line = src.row(row, w * 3);
                    let dst = &mut out[row * stride..(row + 1) * stride];
                    for (px, rgb) in dst.chunks_exact_mut(4).zip(line.chunks_exact(3)) {
                        px.copy_from_slice(&[rgb[2], rgb[1], rgb[0], 255]);
                    }
                }
            }
            PixelFormat::Rgba => {
                let src = &image.planes[0];
                for row in 0..h {
                    let line = src.row(row, w * 4);
                    let dst = &mut out[row * stride..(row + 1) * stride];
                    for (px, rgba) in dst.chunks_exact_mut(4).zip(line.chunks_exact(4)) {
                        px.copy_from_slice(&[rgba[2], rgba[1], rgba[0], rgba[3]]);
                    }
                }
            }
            PixelFormat::Bgra => {
                let src = &image.planes[0];
                for row in 0..h {
                    out[row * stride..(row + 1) * stride].copy_from_slice(src.row(row, stride));
                }
            }
            PixelFormat::Other(_) => return Err(DecodeError::UnsupportedPixelFormat(self.format)),
        }

        Ok(Plane::new(out, stride))
    }
}
