//! [FrameCodec]s backed by libavcodec through `ac-ffmpeg`.

use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame, VideoFrameScaler};
use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::Bytes;

use super::{CodecFactory, CodecKind, CodecParams, FrameCodec, Picture, PixelFormat, Plane};
use crate::Error;

/// Frame timestamps are carried through the decoder in microseconds.
fn time_base() -> TimeBase {
	TimeBase::new(1, 1_000_000)
}

/// Decoder names to try, best first: hardware (NVDEC) then software.
fn decoder_chain(kind: CodecKind, hardware: bool) -> &'static [&'static str] {
	match (kind, hardware) {
		(CodecKind::H264, true) => &["h264_cuvid", "h264"],
		(CodecKind::H264, false) => &["h264"],
		(CodecKind::H265, true) => &["hevc_cuvid", "hevc"],
		(CodecKind::H265, false) => &["hevc"],
		(CodecKind::Vp8, true) => &["vp8_cuvid", "vp8"],
		(CodecKind::Vp8, false) => &["vp8"],
		(CodecKind::Vp9, true) => &["vp9_cuvid", "vp9"],
		(CodecKind::Vp9, false) => &["vp9"],
		(CodecKind::Av1, true) => &["av1_cuvid", "libdav1d", "av1"],
		(CodecKind::Av1, false) => &["libdav1d", "av1"],
	}
}

/// Opens libavcodec decoders, preferring hardware ones when `hardware` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegCodecs {
	pub hardware: bool,
}

impl FfmpegCodecs {
	pub fn new(hardware: bool) -> Self {
		Self { hardware }
	}
}

impl CodecFactory for FfmpegCodecs {
	fn open(&self, params: &CodecParams) -> Result<Box<dyn FrameCodec>, Error> {
		let mut last = None;

		for name in decoder_chain(params.kind, self.hardware) {
			match build(name, params) {
				Ok(decoder) => {
					tracing::debug!(decoder = name, codec = %params.kind, "decoder available");
					return Ok(Box::new(FfmpegCodec {
						name: *name,
						params: params.clone(),
						decoder,
						scaler: None,
					}));
				}
				Err(err) => {
					tracing::debug!(decoder = name, %err, "decoder not available, skipping");
					last = Some(err);
				}
			}
		}

		Err(Error::decoder_init(match last {
			Some(err) => anyhow::Error::new(err).context(format!("no {} decoder available", params.kind)),
			None => anyhow::anyhow!("no {} decoder available", params.kind),
		}))
	}
}

fn build(name: &str, params: &CodecParams) -> Result<VideoDecoder, ac_ffmpeg::Error> {
	let mut builder = VideoDecoder::builder(name)?.time_base(time_base());

	if let (Some(width), Some(height)) = (params.coded_width, params.coded_height) {
		builder = builder.set_option("video_size", format!("{width}x{height}"));
	}

	builder
		.extradata(params.extradata.as_ref().map(|extradata| extradata.to_vec()))
		.build()
}

// Rescales pictures in formats the converter does not handle.
struct Scaler {
	scaler: VideoFrameScaler,
	source: (&'static str, usize, usize),
}

pub struct FfmpegCodec {
	name: &'static str,
	params: CodecParams,
	decoder: VideoDecoder,
	scaler: Option<Scaler>,
}

// SAFETY: the decoder and scaler contexts are owned exclusively by this value and only
// ever touched through `&mut self`, so moving them to another thread is sound.
unsafe impl Send for FfmpegCodec {}

impl FfmpegCodec {
	fn normalize(&mut self, frame: VideoFrame) -> Result<VideoFrame, Error> {
		let format = frame.pixel_format().name();
		if !matches!(PixelFormat::from_name(format), PixelFormat::Other(_)) {
			return Ok(frame);
		}

		let source = (format, frame.width(), frame.height());
		if self.scaler.as_ref().map(|scaler| scaler.source) != Some(source) {
			tracing::debug!(format, width = source.1, height = source.2, "rescaling to yuv420p");

			let scaler = VideoFrameScaler::builder()
				.source_pixel_format(frame.pixel_format())
				.source_width(source.1)
				.source_height(source.2)
				.target_pixel_format(get_pixel_format("yuv420p"))
				.target_width(source.1)
				.target_height(source.2)
				.build()
				.map_err(Error::decode)?;

			self.scaler = Some(Scaler { scaler, source });
		}

		match self.scaler.as_mut() {
			Some(scaler) => scaler.scaler.scale(&frame).map_err(Error::decode),
			None => Ok(frame),
		}
	}
}

impl FrameCodec for FfmpegCodec {
	fn send(&mut self, payload: &[u8], timestamp_us: u64) -> Result<(), Error> {
		let pts = Timestamp::new(timestamp_us as i64, time_base());
		let packet = PacketMut::from(payload).with_pts(pts).freeze();

		match self.decoder.try_push(packet) {
			Ok(()) => Ok(()),
			Err(err) if err.is_again() => Err(Error::Again),
			Err(err) => Err(Error::decode(err)),
		}
	}

	fn receive(&mut self) -> Result<Option<Picture>, Error> {
		let Some(frame) = self.decoder.take().map_err(Error::decode)? else {
			return Ok(None);
		};

		let frame = self.normalize(frame)?;
		let format = PixelFormat::from_name(frame.pixel_format().name());

		let count = match format {
			PixelFormat::Yuv420p => 3,
			PixelFormat::Nv12 => 2,
			_ => 1,
		};

		let planes = frame.planes();
		let planes = (0..count.min(planes.len()))
			.map(|index| Plane {
				data: Bytes::copy_from_slice(planes[index].data()),
				stride: planes[index].line_size(),
			})
			.collect();

		Ok(Some(Picture {
			width: u32::try_from(frame.width()).unwrap_or(u32::MAX),
			height: u32::try_from(frame.height()).unwrap_or(u32::MAX),
			format,
			planes,
		}))
	}

	fn flush(&mut self) -> Result<(), Error> {
		// Rebuilt from the stored parameters.
		self.decoder = build(self.name, &self.params).map_err(Error::decoder_init)?;
		Ok(())
	}

	fn name(&self) -> &str {
		self.name
	}
}
