//! Audio resampling to the fixed output format (stereo, S16LE, 44.1 kHz).
//!
//! The resampler is persistent across calls: the fractional read position and the last
//! input sample carry over, so consecutive frames join without gaps or duplicated samples.

use crate::media::frame::{AudioFormat, RawAudioFrame, SampleFormat};
use crate::media::DecodeError;

pub const OUTPUT_SAMPLE_RATE: u32 = 44_100;
pub const OUTPUT_CHANNELS: u16 = 2;
/// Bytes per output sample frame (two 16-bit channels)
pub const OUTPUT_FRAME_BYTES: usize = 4;
pub const OUTPUT_BYTES_PER_SECOND: usize = OUTPUT_SAMPLE_RATE as usize * OUTPUT_FRAME_BYTES;

/// Converts raw decoded audio into output-format PCM bytes.
pub trait Resampler: Send {
    fn input_format(&self) -> AudioFormat;

    /// Input samples (per channel) held back from previous calls.
    fn delay(&self) -> usize;

    /// Convert one frame, returning interleaved S16LE stereo bytes at 44.1 kHz.
    fn convert(&mut self, frame: &RawAudioFrame) -> Result<Vec<u8>, DecodeError>;

    /// Forget carried-over state, e.g. after a seek.
    fn reset(&mut self);
}

/// Output sample frames needed for `input_samples` new samples plus the carried delay,
/// rounded up so nothing is lost across calls.
pub fn output_capacity(delay: usize, input_samples: usize, input_rate: u32) -> usize {
    let total = (delay + input_samples) as u64 * OUTPUT_SAMPLE_RATE as u64;
    total.div_ceil(input_rate.max(1) as u64) as usize
}

/// Left/right gains per source channel for the default layout of `channels`.
///
/// Layouts follow the usual channel order: FL FR FC LFE, then back and side pairs. LFE is
/// not mixed. Gains are normalised so a full-scale signal on every channel cannot clip.
pub fn stereo_downmix(channels: u16) -> Vec<[f32; 2]> {
    const G: f32 = std::f32::consts::FRAC_1_SQRT_2;
    const FL: [f32; 2] = [1.0, 0.0];
    const FR: [f32; 2] = [0.0, 1.0];
    const C: [f32; 2] = [G, G];
    const LFE: [f32; 2] = [0.0, 0.0];
    const SL: [f32; 2] = [G, 0.0];
    const SR: [f32; 2] = [0.0, G];
    const BC: [f32; 2] = [0.5, 0.5];

    let mut gains = match channels {
        0 => return Vec::new(),
        1 => return vec![[1.0, 1.0]],
        2 => return vec![FL, FR],
        3 => vec![FL, FR, C],
        4 => vec![FL, FR, C, BC],
        5 => vec![FL, FR, C, SL, SR],
        6 => vec![FL, FR, C, LFE, SL, SR],
        7 => vec![FL, FR, C, LFE, BC, SL, SR],
        _ => vec![FL, FR, C, LFE, SL, SR, SL, SR],
    };
    gains.resize(channels as usize, LFE);
    let left: f32 = gains.iter().map(|g| g[0]).sum();
    for gain in &mut gains {
        gain[0] /= left;
        gain[1] /= left;
    }
    gains
}

/// Linear-interpolating resampler with a matrix down/up-mix to stereo.
#[derive(Debug)]
pub struct LinearResampler {
    input: AudioFormat,
    mix: Vec<[f32; 2]>,
    /// Input samples advanced per output sample
    step: f64,
    /// Next output position in input-sample units; -1 addresses `history`
    pos: f64,
    history: Option<[f32; 2]>,
    scratch: Vec<[f32; 2]>,
}

impl LinearResampler {
    pub fn new(input: AudioFormat) -> Result<Self, DecodeError> {
        if input.sample_rate == 0 || input.channels == 0 {
            return Err(DecodeError::UnsupportedAudioFormat(format!(
                "{} Hz, {} channels",
                input.sample_rate, input.channels
            )));
        }
        Ok(Self {
            input,
            mix: stereo_downmix(input.channels),
            step: input.sample_rate as f64 / OUTPUT_SAMPLE_RATE as f64,
            pos: 0.0,
            history: None,
            scratch: Vec::new(),
        })
    }

    fn read_sample(bytes: &[u8], format: SampleFormat) -> f32 {
        match format {
            SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
            SampleFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
            SampleFormat::S32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
            }
            SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            SampleFormat::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw) as f32
            }
        }
    }

    /// Decode `frame` into `scratch` as stereo f32.
    fn load(&mut self, frame: &RawAudioFrame) -> Result<(), DecodeError> {
        let format = frame.format;
        let channels = format.channels as usize;
        let bps = format.sample_format.bytes_per_sample();
        let n = frame.samples;

        let needed_planes = if format.planar { channels } else { 1 };
        let plane_len = if format.planar { n * bps } else { n * channels * bps };
        if frame.planes.len() < needed_planes
            || frame.planes[..needed_planes].iter().any(|p| p.len() < plane_len)
        {
            return Err(DecodeError::UnsupportedAudioFormat(format!(
                "frame of {} samples has short planes",
                n
            )));
        }

        let sample = |i: usize, c: usize| -> f32 {
            let (plane, offset) = if format.planar {
                (&frame.planes[c], i * bps)
            } else {
                (&frame.planes[0], (i * channels + c) * bps)
            };
            Self::read_sample(&plane[offset..offset + bps], format.sample_format)
        };

        self.scratch.clear();
        self.scratch.reserve(n);
        for i in 0..n {
            let mut pair = [0.0f32; 2];
            for (c, gain) in self.mix.iter().enumerate() {
                if gain[0] == 0.0 && gain[1] == 0.0 {
                    continue;
                }
                let s = sample(i, c);
                pair[0] += s * gain[0];
                pair[1] += s * gain[1];
            }
            self.scratch.push(pair);
        }
        Ok(())
    }

    #[inline]
    fn at(&self, index: isize) -> [f32; 2] {
        if index < 0 {
            self.history.unwrap_or(self.scratch[0])
        } else {
            self.scratch[index as usize]
        }
    }

    #[inline]
    fn to_s16(sample: f32) -> [u8; 2] {
        ((sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16).to_le_bytes()
    }
}

impl Resampler for LinearResampler {
    fn input_format(&self) -> AudioFormat {
        self.input
    }

    fn delay(&self) -> usize {
        usize::from(self.history.is_some())
    }

    fn convert(&mut self, frame: &RawAudioFrame) -> Result<Vec<u8>, DecodeError> {
        if frame.format != self.input {
            return Err(DecodeError::UnsupportedAudioFormat(format!(
                "resampler built for {:?}, got {:?}",
                self.input, frame.format
            )));
        }
        self.load(frame)?;
        let n = self.scratch.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let capacity = output_capacity(self.delay(), n, self.input.sample_rate);
        let mut out = Vec::with_capacity(capacity * OUTPUT_FRAME_BYTES);
        let last = n as isize - 1;
        let mut produced = 0;

        while produced < capacity {
            let i = self.pos.floor() as isize;
            let frac = (self.pos - i as f64) as f32;
            if i > last {
                break;
            }
            let [l, r] = if frac < 1e-6 {
                self.at(i)
            } else {
                if i + 1 > last {
                    break;
                }
                let a = self.at(i);
                let b = self.at(i + 1);
                [a[0] + (b[0] - a[0]) * frac, a[1] + (b[1] - a[1]) * frac]
            };
            out.extend_from_slice(&Self::to_s16(l));
            out.extend_from_slice(&Self::to_s16(r));
            produced += 1;
            self.pos += self.step;
        }

        self.history = Some(self.scratch[n - 1]);
        self.pos -= n as f64;
        Ok(out)
    }

    fn reset(&mut self) {
        self.pos = 0.0;
        self.history = None;
        self.scratch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_mono(rate: u32, samples: &[i16]) -> RawAudioFrame {
        RawAudioFrame {
            pts: None,
            format: AudioFormat {
                sample_rate: rate,
                channels: 1,
                sample_format: SampleFormat::S16,
                planar: false,
            },
            samples: samples.len(),
            planes: vec![samples.iter().flat_map(|s| s.to_le_bytes()).collect()],
        }
    }

    fn f32_planar(rate: u32, value: f32, samples: usize) -> RawAudioFrame {
        let plane: Vec<u8> = (0..samples).flat_map(|_| value.to_le_bytes()).collect();
        RawAudioFrame {
            pts: None,
            format: AudioFormat {
                sample_rate: rate,
                channels: 2,
                sample_format: SampleFormat::F32,
                planar: true,
            },
            samples,
            planes: vec![plane.clone(), plane],
        }
    }

    fn decode(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn f32_interleaved(rate: u32, channels: &[f32], samples: usize) -> RawAudioFrame {
        let plane: Vec<u8> = (0..samples)
            .flat_map(|_| channels.iter().flat_map(|v| v.to_le_bytes()))
            .collect();
        RawAudioFrame {
            pts: None,
            format: AudioFormat {
                sample_rate: rate,
                channels: channels.len() as u16,
                sample_format: SampleFormat::F32,
                planar: false,
            },
            samples,
            planes: vec![plane],
        }
    }

    #[test]
    fn test_surround_rear_channels_reach_output() {
        // 5.1: FL FR FC LFE BL BR, signal on the left rear only
        let frame = f32_interleaved(44_100, &[0.0, 0.0, 0.0, 0.0, 0.5, 0.0], 441);
        let mut rs = LinearResampler::new(frame.format).unwrap();
        let out = decode(&rs.convert(&frame).unwrap());
        let left = out.iter().step_by(2).map(|s| s.unsigned_abs()).max().unwrap();
        let right = out.iter().skip(1).step_by(2).map(|s| s.unsigned_abs()).max().unwrap();
        assert!(left > 3_000, "left peak {}", left);
        assert_eq!(right, 0);
    }

    #[test]
    fn test_surround_full_scale_does_not_clip() {
        // half scale on all eight channels of 7.1 stays at half scale
        let frame = f32_interleaved(44_100, &[0.5; 8], 64);
        let mut rs = LinearResampler::new(frame.format).unwrap();
        let out = decode(&rs.convert(&frame).unwrap());
        assert!(out.iter().all(|s| (16_000..=16_800).contains(s)), "{:?}", &out[..4]);
    }

    #[test]
    fn test_downmix_skips_lfe() {
        let gains = stereo_downmix(6);
        assert_eq!(gains[3], [0.0, 0.0]);
        let left: f32 = gains.iter().map(|g| g[0]).sum();
        let right: f32 = gains.iter().map(|g| g[1]).sum();
        assert!((left - 1.0).abs() < 1e-6 && (right - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_output_capacity_rounds_up() {
        assert_eq!(output_capacity(0, 1024, 44_100), 1024);
        assert_eq!(output_capacity(1, 1024, 48_000), 942);
        assert_eq!(output_capacity(0, 1, 96_000), 1);
    }

    #[test]
    fn test_passthrough_duplicates_mono() {
        let input = [0i16, 1000, -1000, 12000];
        let mut rs = LinearResampler::new(s16_mono(44_100, &input).format).unwrap();
        let out = decode(&rs.convert(&s16_mono(44_100, &input)).unwrap());
        assert_eq!(out.len(), 8);
        for (i, expected) in input.iter().enumerate() {
            assert!((out[i * 2] as i32 - *expected as i32).abs() <= 1);
            assert_eq!(out[i * 2], out[i * 2 + 1]);
        }
        assert_eq!(rs.delay(), 1);
    }

    #[test]
    fn test_downsample_keeps_rate_ratio_across_calls() {
        let frame = f32_planar(48_000, 0.25, 1024);
        let mut rs = LinearResampler::new(frame.format).unwrap();
        let mut total = 0usize;
        for _ in 0..100 {
            total += rs.convert(&frame).unwrap().len() / OUTPUT_FRAME_BYTES;
        }
        let expected = 102_400.0 * 44_100.0 / 48_000.0;
        assert!(
            (total as f64 - expected).abs() <= 2.0,
            "produced {} samples, expected ~{}",
            total,
            expected
        );
    }

    #[test]
    fn test_upsample_constant_signal_stays_constant() {
        let frame = f32_planar(22_050, 0.5, 512);
        let mut rs = LinearResampler::new(frame.format).unwrap();
        for _ in 0..4 {
            let out = decode(&rs.convert(&frame).unwrap());
            assert!(!out.is_empty());
            assert!(out.iter().all(|s| (*s as i32 - 16_384).abs() <= 1));
        }
    }

    #[test]
    fn test_reset_forgets_history() {
        let frame = f32_planar(48_000, 0.1, 100);
        let mut rs = LinearResampler::new(frame.format).unwrap();
        rs.convert(&frame).unwrap();
        assert_eq!(rs.delay(), 1);
        rs.reset();
        assert_eq!(rs.delay(), 0);
    }

    #[test]
    fn test_short_planes_rejected() {
        let mut frame = s16_mono(44_100, &[1, 2, 3]);
        frame.samples = 10;
        let mut rs = LinearResampler::new(frame.format).unwrap();
        assert!(rs.convert(&frame).is_err());
    }

    #[test]
    fn test_invalid_format_rejected() {
        let format = AudioFormat {
            sample_rate: 0,
            channels: 2,
            sample_format: SampleFormat::S16,
            planar: false,
        };
        assert!(LinearResampler::new(format).is_err());
    }
}
