//! FFmpeg media backend.
//!
//! Demuxing and decoding go through ffmpeg-next; pixel conversion through libswscale and
//! audio conversion through libswresample. Raw `ffi` is used only where the safe wrapper has
//! no equivalent: hardware device contexts, surface downloads and colorspace details. Each
//! handle is owned by exactly one worker thread.

use std::collections::HashMap;
use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::{self, sample::Type as SampleLayout, Pixel, Sample};
use ffmpeg::media::Type;
use ffmpeg::software::{resampling, scaling};
use ffmpeg::{codec, color, decoder, frame, ChannelLayout, Packet};

use crate::core::time::{Seconds, TimeBase};
use crate::media::frame::{
    AudioFormat, HardwareSurface, PixelFormat, PlanarImage, Plane, RawAudioFrame, RawImage,
    RawVideoFrame, SampleFormat,
};
use crate::media::resample::{output_capacity, OUTPUT_FRAME_BYTES, OUTPUT_SAMPLE_RATE};
use crate::media::{
    select_video_decoder, AudioDecoder, AudioStreamInfo, CompressedUnit, DecodeError, DecodeMode,
    Demux, MediaBackend, MediaInfo, OpenError, OpenedMedia, PixelConverter, ReadOutcome,
    Resampler, StreamKind, VideoDecoder, VideoStreamInfo,
};

#[cfg(target_os = "windows")]
const HW_DEVICE: ffi::AVHWDeviceType = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA;
#[cfg(target_os = "macos")]
const HW_DEVICE: ffi::AVHWDeviceType = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX;
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const HW_DEVICE: ffi::AVHWDeviceType = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI;

/// `AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX`
const HW_DEVICE_CTX_METHOD: i32 = 0x01;

/// `SWS_CS_*` coefficient table ids
const SWS_CS_ITU709: i32 = 1;
const SWS_CS_ITU601: i32 = 5;
const SWS_CS_BT2020: i32 = 9;

fn codec_error(err: ffmpeg::Error) -> DecodeError {
    DecodeError::Codec(err.to_string())
}

fn time_base(rational: ffmpeg::Rational) -> TimeBase {
    TimeBase::new(rational.numerator(), rational.denominator())
}

/// Opens files with libavformat/libavcodec.
#[derive(Debug, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self, OpenError> {
        ffmpeg::init().map_err(|e| OpenError::Container(format!("FFmpeg init failed: {}", e)))?;
        Ok(Self)
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(&self, path: &Path, mode: DecodeMode) -> Result<OpenedMedia, OpenError> {
        if !path.exists() {
            return Err(OpenError::NotFound(path.to_path_buf()));
        }
        let input = format::input(&path).map_err(|e| OpenError::Container(e.to_string()))?;

        let video_stream = input.streams().best(Type::Video).map(|s| s.index());
        let audio_stream = input.streams().best(Type::Audio).map(|s| s.index());
        if video_stream.is_none() && audio_stream.is_none() {
            return Err(OpenError::NoPlayableStream);
        }

        let mut video_info = None;
        let mut video: Option<Box<dyn VideoDecoder>> = None;
        if let Some(stream) = video_stream.and_then(|i| input.stream(i)) {
            let (decoder, hardware) = select_video_decoder(
                mode,
                || FfmpegVideoDecoder::open(&stream, true),
                || FfmpegVideoDecoder::open(&stream, false),
            )?;
            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() != 0 && rate.numerator() > 0 {
                f64::from(rate)
            } else {
                30.0
            };
            video_info = Some(VideoStreamInfo {
                index: stream.index(),
                codec_name: decoder.codec_name.clone(),
                width: decoder.decoder.width(),
                height: decoder.decoder.height(),
                fps,
                time_base: time_base(stream.time_base()),
                hardware,
                // FFmpeg creates D3D11VA devices multithread protected
                multithread_protected: hardware && cfg!(target_os = "windows"),
            });
            video = Some(Box::new(decoder));
        }

        let mut audio_info = None;
        let mut audio: Option<Box<dyn AudioDecoder>> = None;
        if let Some(stream) = audio_stream.and_then(|i| input.stream(i)) {
            match FfmpegAudioDecoder::open(&stream) {
                Ok(decoder) => {
                    audio_info = Some(AudioStreamInfo {
                        index: stream.index(),
                        codec_name: decoder.codec_name.clone(),
                        sample_rate: decoder.decoder.rate(),
                        channels: decoder.decoder.channels(),
                        time_base: time_base(stream.time_base()),
                    });
                    audio = Some(Box::new(decoder));
                }
                Err(err) if video.is_some() => {
                    tracing::warn!("audio stream unusable, playing video only: {}", err);
                }
                Err(err) => return Err(err),
            }
        }

        let duration = if input.duration() > 0 {
            TimeBase::MICROSECONDS.to_seconds(input.duration())
        } else {
            input
                .streams()
                .filter(|s| s.duration() > 0)
                .map(|s| time_base(s.time_base()).to_seconds(s.duration()))
                .fold(0.0, f64::max)
        };

        Ok(OpenedMedia {
            info: MediaInfo {
                path: path.to_path_buf(),
                duration,
                video: video_info,
                audio: audio_info,
            },
            demux: Box::new(FfmpegDemux { input }),
            video,
            audio,
        })
    }
}

/// Container reader owned by the demux thread.
pub struct FfmpegDemux {
    input: format::context::Input,
}

// SAFETY: the format context is only touched from the thread that owns this value.
unsafe impl Send for FfmpegDemux {}

impl Demux for FfmpegDemux {
    fn read(&mut self) -> Result<ReadOutcome, DecodeError> {
        let mut packet = Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(ReadOutcome::Unit(CompressedUnit {
                stream_index: packet.stream(),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                pts: packet.pts(),
                dts: packet.dts(),
                keyframe: packet.is_key(),
            })),
            Err(ffmpeg::Error::Eof) => Ok(ReadOutcome::EndOfStream),
            Err(err) => Err(DecodeError::Read(err.to_string())),
        }
    }

    fn seek(&mut self, seconds: Seconds) -> Result<(), DecodeError> {
        let ts = TimeBase::MICROSECONDS.from_seconds(seconds.max(0.0));
        self.input
            .seek(ts, ..=ts)
            .map_err(|e| DecodeError::Seek(e.to_string()))
    }
}

fn to_packet(unit: &CompressedUnit) -> Packet {
    let mut packet = Packet::copy(&unit.data);
    packet.set_pts(unit.pts);
    packet.set_dts(unit.dts);
    if unit.keyframe {
        packet.set_flags(codec::packet::Flags::KEY);
    }
    packet
}

/// Attach a hardware device context to `context` before it is opened.
fn attach_hw_device(context: &mut codec::Context, id: codec::Id) -> Result<(), OpenError> {
    let codec = decoder::find(id).ok_or_else(|| OpenError::DecoderNotFound {
        kind: StreamKind::Video,
        codec: format!("{:?}", id),
    })?;
    unsafe {
        let mut supported = false;
        let mut i = 0;
        loop {
            let config = ffi::avcodec_get_hw_config(codec.as_ptr(), i);
            if config.is_null() {
                break;
            }
            if (*config).device_type == HW_DEVICE
                && ((*config).methods as i32) & HW_DEVICE_CTX_METHOD != 0
            {
                supported = true;
                break;
            }
            i += 1;
        }
        if !supported {
            return Err(OpenError::HardwareUnavailable(format!(
                "{:?} has no {:?} config",
                id, HW_DEVICE
            )));
        }

        let mut device: *mut ffi::AVBufferRef = std::ptr::null_mut();
        let ret = ffi::av_hwdevice_ctx_create(
            &mut device,
            HW_DEVICE,
            std::ptr::null(),
            std::ptr::null_mut(),
            0,
        );
        if ret < 0 {
            return Err(OpenError::HardwareUnavailable(format!(
                "av_hwdevice_ctx_create returned {}",
                ret
            )));
        }
        (*context.as_mut_ptr()).hw_device_ctx = ffi::av_buffer_ref(device);
        ffi::av_buffer_unref(&mut device);
    }
    Ok(())
}

fn pixel_format(pixel: Pixel) -> PixelFormat {
    match pixel {
        Pixel::YUV420P => PixelFormat::Yuv420p,
        Pixel::NV12 => PixelFormat::Nv12,
        Pixel::RGB24 => PixelFormat::Rgb24,
        Pixel::RGBA => PixelFormat::Rgba,
        Pixel::BGRA => PixelFormat::Bgra,
        other => PixelFormat::Other(ffi::AVPixelFormat::from(other) as i32),
    }
}

fn planar_image(frame: &frame::Video, format: PixelFormat) -> PlanarImage {
    PlanarImage {
        format,
        width: frame.width(),
        height: frame.height(),
        planes: (0..frame.planes())
            .map(|i| Plane::new(frame.data(i).to_vec(), frame.stride(i)))
            .collect(),
    }
}

/// Hardware frame referenced until downloaded.
struct FfmpegSurface {
    frame: frame::Video,
}

// SAFETY: the frame holds its own reference to the surface pool.
unsafe impl Send for FfmpegSurface {}

impl HardwareSurface for FfmpegSurface {
    fn download(&self) -> Result<PlanarImage, DecodeError> {
        let mut sw = frame::Video::empty();
        let ret = unsafe { ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), self.frame.as_ptr(), 0) };
        if ret < 0 {
            return Err(DecodeError::Transfer(ffmpeg::Error::from(ret).to_string()));
        }
        Ok(planar_image(&sw, pixel_format(sw.format())))
    }
}

/// Colour properties of the most recent frame, used when building a converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceColour {
    space: color::Space,
    range: color::Range,
}

impl Default for SourceColour {
    fn default() -> Self {
        Self {
            space: color::Space::Unspecified,
            range: color::Range::Unspecified,
        }
    }
}

/// swscale coefficient table for a source matrix. Untagged HD content is BT.709.
fn colour_matrix(space: color::Space, height: u32) -> i32 {
    match space {
        color::Space::BT709 => SWS_CS_ITU709,
        color::Space::BT2020NCL | color::Space::BT2020CL => SWS_CS_BT2020,
        color::Space::BT470BG | color::Space::SMPTE170M | color::Space::FCC => SWS_CS_ITU601,
        _ if height >= 720 => SWS_CS_ITU709,
        _ => SWS_CS_ITU601,
    }
}

fn full_range(pixel: Pixel, range: color::Range) -> bool {
    range == color::Range::JPEG
        || matches!(
            pixel,
            Pixel::YUVJ420P | Pixel::YUVJ422P | Pixel::YUVJ444P | Pixel::YUVJ440P
        )
}

/// libswscale conversion of one source format and size to packed BGRA.
pub struct SwsConverter {
    format: PixelFormat,
    width: u32,
    height: u32,
    context: scaling::Context,
    source: frame::Video,
    output: frame::Video,
}

// SAFETY: the scaler and its frames are only touched from the thread that owns this value.
unsafe impl Send for SwsConverter {}

impl SwsConverter {
    fn new(pixel: Pixel, width: u32, height: u32, colour: SourceColour) -> Result<Self, DecodeError> {
        let mut context = scaling::Context::get(
            pixel,
            width,
            height,
            Pixel::BGRA,
            width,
            height,
            scaling::Flags::BILINEAR,
        )
        .map_err(codec_error)?;

        let matrix = colour_matrix(colour.space, height);
        let full = full_range(pixel, colour.range);
        let ret = unsafe {
            ffi::sws_setColorspaceDetails(
                context.as_mut_ptr(),
                ffi::sws_getCoefficients(matrix),
                i32::from(full),
                ffi::sws_getCoefficients(SWS_CS_ITU601),
                1,
                0,
                1 << 16,
                1 << 16,
            )
        };
        if ret < 0 {
            tracing::debug!("{:?} ignores colorspace details", pixel);
        }
        tracing::debug!(
            "swscale {:?} {}x{} -> bgra (matrix {}, full range {})",
            pixel,
            width,
            height,
            matrix,
            full
        );

        Ok(Self {
            format: pixel_format(pixel),
            width,
            height,
            context,
            source: frame::Video::new(pixel, width, height),
            output: frame::Video::empty(),
        })
    }
}

impl PixelConverter for SwsConverter {
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
        if image.planes.len() < self.source.planes() {
            return Err(DecodeError::Codec(format!(
                "{} image has {} planes, expected {}",
                image.format,
                image.planes.len(),
                self.source.planes()
            )));
        }

        for (i, plane) in image.planes.iter().enumerate().take(self.source.planes()) {
            let stride = self.source.stride(i);
            let row = stride.min(plane.stride);
            let dst = self.source.data_mut(i);
            for (d, s) in dst.chunks_mut(stride).zip(plane.data.chunks(plane.stride.max(1))) {
                let n = row.min(s.len()).min(d.len());
                d[..n].copy_from_slice(&s[..n]);
            }
        }
        self.context
            .run(&self.source, &mut self.output)
            .map_err(codec_error)?;

        let row = self.width as usize * 4;
        let stride = self.output.stride(0);
        let data = self.output.data(0);
        let mut packed = Vec::with_capacity(row * self.height as usize);
        for y in 0..self.height as usize {
            packed.extend_from_slice(&data[y * stride..y * stride + row]);
        }
        Ok(Plane::new(packed, row))
    }
}

/// libavcodec video decoder.
pub struct FfmpegVideoDecoder {
    decoder: decoder::Video,
    codec_name: String,
    hardware: bool,
    /// Native pixel format behind each format tag handed to the pipeline
    pixels: HashMap<PixelFormat, Pixel>,
    colour: SourceColour,
}

// SAFETY: the codec context is only touched from the thread that owns this value.
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn open(stream: &format::stream::Stream, hardware: bool) -> Result<Self, OpenError> {
        let parameters = stream.parameters();
        let id = parameters.id();
        let codec_name = format!("{:?}", id).to_lowercase();
        if decoder::find(id).is_none() {
            return Err(OpenError::DecoderNotFound {
                kind: StreamKind::Video,
                codec: codec_name,
            });
        }
        let mut context = codec::Context::from_parameters(parameters).map_err(|e| {
            OpenError::DecoderOpen {
                kind: StreamKind::Video,
                reason: e.to_string(),
            }
        })?;
        if hardware {
            attach_hw_device(&mut context, id)?;
        }
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| OpenError::DecoderOpen {
                kind: StreamKind::Video,
                reason: e.to_string(),
            })?;
        Ok(Self {
            decoder,
            codec_name,
            hardware,
            pixels: HashMap::new(),
            colour: SourceColour::default(),
        })
    }

    /// Remember `pixel` and the frame's colour so a converter can be built for it.
    fn track(&mut self, frame: &frame::Video, pixel: Pixel) -> PixelFormat {
        let format = pixel_format(pixel);
        self.pixels.insert(format, pixel);
        self.colour = SourceColour {
            space: frame.color_space(),
            range: frame.color_range(),
        };
        format
    }
}

impl VideoDecoder for FfmpegVideoDecoder {
    fn send(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError> {
        match self.decoder.send_packet(&to_packet(unit)) {
            Err(ffmpeg::Error::InvalidData) => {
                tracing::warn!("skipping corrupt video packet");
                Ok(())
            }
            other => other.map_err(codec_error),
        }
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.decoder.send_eof().map_err(codec_error)
    }

    fn receive(&mut self) -> Result<Option<RawVideoFrame>, DecodeError> {
        let mut decoded = frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                return Ok(None)
            }
            Err(err) => return Err(codec_error(err)),
        }

        let pts = decoded.timestamp().or(decoded.pts());
        let (width, height) = (decoded.width(), decoded.height());
        let on_device = self.hardware && unsafe { !(*decoded.as_ptr()).hw_frames_ctx.is_null() };
        let image = if on_device {
            // downloads land in the surface pool's software format
            let sw_pixel = unsafe {
                let frames = (*(*decoded.as_ptr()).hw_frames_ctx).data as *const ffi::AVHWFramesContext;
                Pixel::from((*frames).sw_format)
            };
            self.track(&decoded, sw_pixel);
            RawImage::Surface(Box::new(FfmpegSurface { frame: decoded }))
        } else {
            let format = self.track(&decoded, decoded.format());
            RawImage::Software(planar_image(&decoded, format))
        };
        Ok(Some(RawVideoFrame {
            pts,
            width,
            height,
            image,
        }))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn converter(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn PixelConverter>, DecodeError> {
        let pixel = *self
            .pixels
            .get(&format)
            .ok_or(DecodeError::UnsupportedPixelFormat(format))?;
        Ok(Box::new(SwsConverter::new(pixel, width, height, self.colour)?))
    }
}

fn sample_format(sample: Sample) -> Option<(SampleFormat, bool)> {
    let (format, layout) = match sample {
        Sample::U8(t) => (SampleFormat::U8, t),
        Sample::I16(t) => (SampleFormat::S16, t),
        Sample::I32(t) => (SampleFormat::S32, t),
        Sample::F32(t) => (SampleFormat::F32, t),
        Sample::F64(t) => (SampleFormat::F64, t),
        _ => return None,
    };
    Some((format, layout == SampleLayout::Planar))
}

fn ffmpeg_sample(format: &AudioFormat) -> Sample {
    let layout = if format.planar {
        SampleLayout::Planar
    } else {
        SampleLayout::Packed
    };
    match format.sample_format {
        SampleFormat::U8 => Sample::U8(layout),
        SampleFormat::S16 => Sample::I16(layout),
        SampleFormat::S32 => Sample::I32(layout),
        SampleFormat::F32 => Sample::F32(layout),
        SampleFormat::F64 => Sample::F64(layout),
    }
}

/// libswresample conversion to stereo S16 at 44.1 kHz.
pub struct SwrResampler {
    input: AudioFormat,
    layout: ChannelLayout,
    context: resampling::Context,
}

// SAFETY: the resampler is only touched from the thread that owns this value.
unsafe impl Send for SwrResampler {}

impl SwrResampler {
    pub fn new(input: AudioFormat, layout: ChannelLayout) -> Result<Self, DecodeError> {
        let layout = if layout.channels() == i32::from(input.channels) {
            layout
        } else {
            ChannelLayout::default(i32::from(input.channels))
        };
        let context = Self::context(&input, layout)?;
        Ok(Self {
            input,
            layout,
            context,
        })
    }

    fn context(input: &AudioFormat, layout: ChannelLayout) -> Result<resampling::Context, DecodeError> {
        resampling::Context::get(
            ffmpeg_sample(input),
            layout,
            input.sample_rate,
            Sample::I16(SampleLayout::Packed),
            ChannelLayout::STEREO,
            OUTPUT_SAMPLE_RATE,
        )
        .map_err(|e| DecodeError::UnsupportedAudioFormat(format!("{:?}: {}", input, e)))
    }

    /// Copy a raw frame into an ffmpeg frame the resampler can read.
    fn source_frame(&self, raw: &RawAudioFrame) -> frame::Audio {
        let mut source = frame::Audio::new(ffmpeg_sample(&self.input), raw.samples, self.layout);
        source.set_rate(self.input.sample_rate);
        for (i, plane) in raw.planes.iter().enumerate().take(source.planes()) {
            let dst = source.data_mut(i);
            let n = plane.len().min(dst.len());
            dst[..n].copy_from_slice(&plane[..n]);
        }
        source
    }
}

impl Resampler for SwrResampler {
    fn input_format(&self) -> AudioFormat {
        self.input
    }

    fn delay(&self) -> usize {
        self.context
            .delay()
            .map_or(0, |delay| delay.input.max(0) as usize)
    }

    fn convert(&mut self, raw: &RawAudioFrame) -> Result<Vec<u8>, DecodeError> {
        if raw.format != self.input {
            return Err(DecodeError::UnsupportedAudioFormat(format!(
                "resampler built for {:?}, got {:?}",
                self.input, raw.format
            )));
        }
        if raw.samples == 0 {
            return Ok(Vec::new());
        }
        let source = self.source_frame(raw);
        let capacity = output_capacity(self.delay(), raw.samples, self.input.sample_rate);
        let mut output = frame::Audio::new(
            Sample::I16(SampleLayout::Packed),
            capacity,
            ChannelLayout::STEREO,
        );
        self.context
            .run(&source, &mut output)
            .map_err(|e| DecodeError::Codec(format!("swr_convert: {}", e)))?;
        let bytes = output.samples() * OUTPUT_FRAME_BYTES;
        Ok(output.data(0)[..bytes].to_vec())
    }

    fn reset(&mut self) {
        // a fresh context drops the buffered tail
        match Self::context(&self.input, self.layout) {
            Ok(context) => self.context = context,
            Err(err) => tracing::warn!("keeping resampler state: {}", err),
        }
    }
}

/// libavcodec audio decoder.
pub struct FfmpegAudioDecoder {
    decoder: decoder::Audio,
    codec_name: String,
    /// Layout of the most recent frame
    layout: ChannelLayout,
}

// SAFETY: the codec context is only touched from the thread that owns this value.
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn open(stream: &format::stream::Stream) -> Result<Self, OpenError> {
        let parameters = stream.parameters();
        let id = parameters.id();
        let codec_name = format!("{:?}", id).to_lowercase();
        if decoder::find(id).is_none() {
            return Err(OpenError::DecoderNotFound {
                kind: StreamKind::Audio,
                codec: codec_name,
            });
        }
        let decoder = codec::Context::from_parameters(parameters)
            .and_then(|context| context.decoder().audio())
            .map_err(|e| OpenError::DecoderOpen {
                kind: StreamKind::Audio,
                reason: e.to_string(),
            })?;
        let layout = decoder.channel_layout();
        Ok(Self {
            decoder,
            codec_name,
            layout,
        })
    }
}

impl AudioDecoder for FfmpegAudioDecoder {
    fn send(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError> {
        match self.decoder.send_packet(&to_packet(unit)) {
            Err(ffmpeg::Error::InvalidData) => {
                tracing::warn!("skipping corrupt audio packet");
                Ok(())
            }
            other => other.map_err(codec_error),
        }
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.decoder.send_eof().map_err(codec_error)
    }

    fn receive(&mut self) -> Result<Option<RawAudioFrame>, DecodeError> {
        let mut decoded = frame::Audio::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                return Ok(None)
            }
            Err(err) => return Err(codec_error(err)),
        }

        let (sample_format, planar) = sample_format(decoded.format()).ok_or_else(|| {
            DecodeError::UnsupportedAudioFormat(format!("{:?}", decoded.format()))
        })?;
        let layout = decoded.channel_layout();
        if !layout.is_empty() {
            self.layout = layout;
        }
        let channels = decoded.channels();
        let samples = decoded.samples();
        let format = AudioFormat {
            sample_rate: decoded.rate(),
            channels,
            sample_format,
            planar,
        };
        let bytes = samples * sample_format.bytes_per_sample();
        let planes = if planar {
            (0..channels as usize)
                .map(|i| decoded.data(i)[..bytes].to_vec())
                .collect()
        } else {
            vec![decoded.data(0)[..bytes * channels as usize].to_vec()]
        };
        Ok(Some(RawAudioFrame {
            pts: decoded.timestamp().or(decoded.pts()),
            format,
            samples,
            planes,
        }))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn resampler(&mut self, input: AudioFormat) -> Result<Box<dyn Resampler>, DecodeError> {
        Ok(Box::new(SwrResampler::new(input, self.layout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuv420_image(format: PixelFormat, size: u32, y: u8, u: u8, v: u8) -> PlanarImage {
        let s = size as usize;
        let c = s / 2;
        PlanarImage {
            format,
            width: size,
            height: size,
            planes: vec![
                Plane::new(vec![y; s * s], s),
                Plane::new(vec![u; c * c], c),
                Plane::new(vec![v; c * c], c),
            ],
        }
    }

    fn centre_pixel(plane: &Plane, size: usize) -> [u8; 4] {
        let offset = (size / 2) * plane.stride + (size / 2) * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&plane.data[offset..offset + 4]);
        px
    }

    #[test]
    fn test_colour_matrix_selection() {
        assert_eq!(colour_matrix(color::Space::BT709, 480), SWS_CS_ITU709);
        assert_eq!(colour_matrix(color::Space::SMPTE170M, 1080), SWS_CS_ITU601);
        assert_eq!(colour_matrix(color::Space::BT2020NCL, 2160), SWS_CS_BT2020);
        // untagged: by resolution
        assert_eq!(colour_matrix(color::Space::Unspecified, 1080), SWS_CS_ITU709);
        assert_eq!(colour_matrix(color::Space::Unspecified, 480), SWS_CS_ITU601);
    }

    #[test]
    fn test_jpeg_formats_are_full_range() {
        assert!(full_range(Pixel::YUVJ420P, color::Range::Unspecified));
        assert!(full_range(Pixel::YUV420P, color::Range::JPEG));
        assert!(!full_range(Pixel::YUV420P, color::Range::MPEG));
        assert_ne!(pixel_format(Pixel::YUVJ420P), PixelFormat::Yuv420p);
    }

    #[test]
    fn test_full_range_black_keeps_level() {
        let format = pixel_format(Pixel::YUVJ420P);
        let mut conv =
            SwsConverter::new(Pixel::YUVJ420P, 16, 16, SourceColour::default()).unwrap();
        let out = conv.convert(&yuv420_image(format, 16, 16, 128, 128)).unwrap();
        let [b, g, r, _] = centre_pixel(&out, 16);
        for channel in [b, g, r] {
            assert!((14..=18).contains(&channel), "got ({}, {}, {})", b, g, r);
        }
    }

    #[test]
    fn test_limited_range_black_is_black() {
        let mut conv =
            SwsConverter::new(Pixel::YUV420P, 16, 16, SourceColour::default()).unwrap();
        let out = conv
            .convert(&yuv420_image(PixelFormat::Yuv420p, 16, 16, 16, 128, 128))
            .unwrap();
        assert_eq!(out.stride, 64);
        let [b, g, r, _] = centre_pixel(&out, 16);
        assert!(b <= 2 && g <= 2 && r <= 2, "got ({}, {}, {})", b, g, r);
    }

    fn surround_frame(rate: u32, values: [f32; 6], samples: usize) -> RawAudioFrame {
        RawAudioFrame {
            pts: None,
            format: AudioFormat {
                sample_rate: rate,
                channels: 6,
                sample_format: SampleFormat::F32,
                planar: false,
            },
            samples,
            planes: vec![(0..samples)
                .flat_map(|_| values.iter().flat_map(|v| v.to_le_bytes()))
                .collect()],
        }
    }

    #[test]
    fn test_swr_mixes_rear_channels_into_stereo() {
        // FL FR FC LFE BL BR with signal on the left rear only
        let frame = surround_frame(48_000, [0.0, 0.0, 0.0, 0.0, 0.5, 0.0], 1024);
        let mut rs = SwrResampler::new(frame.format, ChannelLayout::_5POINT1).unwrap();
        let mut out = Vec::new();
        for _ in 0..10 {
            out.extend(rs.convert(&frame).unwrap());
        }
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let left = samples.iter().step_by(2).map(|s| s.unsigned_abs()).max().unwrap();
        let right = samples.iter().skip(1).step_by(2).map(|s| s.unsigned_abs()).max().unwrap();
        assert!(left > 1_000, "left peak {}", left);
        assert!(right < 16, "right peak {}", right);

        let produced = samples.len() / 2;
        let expected = 10_240.0 * 44_100.0 / 48_000.0;
        assert!((produced as f64 - expected).abs() < 64.0, "produced {}", produced);
    }

    #[test]
    fn test_swr_reset_drops_buffered_input() {
        let frame = surround_frame(48_000, [0.25; 6], 1000);
        let mut rs = SwrResampler::new(frame.format, ChannelLayout::_5POINT1).unwrap();
        rs.convert(&frame).unwrap();
        rs.reset();
        assert_eq!(rs.delay(), 0);
    }
}
