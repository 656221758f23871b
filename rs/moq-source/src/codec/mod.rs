//! Compressed video in, raw pictures out.
//!
//! [FrameCodec] is the seam to a concrete decoder. The pipeline never talks to a decoder
//! library directly; it opens one through a [CodecFactory] and feeds it start-code
//! delimited (or raw, for VPx/AV1) access units.

pub mod annexb;
pub mod convert;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::fmt;

use bytes::Bytes;

use crate::Error;

/// The codec families the pipeline knows how to feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
	H264,
	H265,
	Vp8,
	Vp9,
	Av1,
}

impl CodecKind {
	/// Map a catalog codec string (`avc1.64001f`, `hev1.1.6.L93.B0`, `vp09.00.10.08`, ...)
	/// to a family, matching case-insensitively on the prefix.
	pub fn from_codec_str(codec: &str) -> Result<Self, Error> {
		let lower = codec.trim().to_ascii_lowercase();

		const PREFIXES: &[(&str, CodecKind)] = &[
			("h264", CodecKind::H264),
			("avc", CodecKind::H264),
			("hevc", CodecKind::H265),
			("h265", CodecKind::H265),
			("hev1", CodecKind::H265),
			("hvc1", CodecKind::H265),
			("vp09", CodecKind::Vp9),
			("vp9", CodecKind::Vp9),
			("vp08", CodecKind::Vp8),
			("vp8", CodecKind::Vp8),
			("av01", CodecKind::Av1),
			("av1", CodecKind::Av1),
		];

		PREFIXES
			.iter()
			.find(|(prefix, _)| lower.starts_with(prefix))
			.map(|(_, kind)| *kind)
			.ok_or_else(|| Error::UnknownCodec(codec.to_string()))
	}

	/// H.264 and H.265 carry NAL units and may need their framing rewritten.
	pub fn is_nal(&self) -> bool {
		matches!(self, CodecKind::H264 | CodecKind::H265)
	}
}

impl fmt::Display for CodecKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			CodecKind::H264 => "h264",
			CodecKind::H265 => "h265",
			CodecKind::Vp8 => "vp8",
			CodecKind::Vp9 => "vp9",
			CodecKind::Av1 => "av1",
		};
		f.write_str(name)
	}
}

/// The video track description carried by one catalog update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoConfig {
	/// The codec string, ex. `avc1.64001f`.
	pub codec: String,

	pub coded_width: Option<u32>,
	pub coded_height: Option<u32>,

	/// The decoder configuration record (avcC / hvcC / ...), if the publisher sent one.
	pub description: Option<Bytes>,
}

/// One compressed access unit, copied out of a transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
	pub payload: Bytes,
	pub timestamp_us: u64,
	pub keyframe: bool,
}

/// Everything needed to open a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
	pub kind: CodecKind,
	pub coded_width: Option<u32>,
	pub coded_height: Option<u32>,

	/// Out-of-band parameter sets, already in the framing the decoder will be fed.
	pub extradata: Option<Bytes>,
}

/// A decoded picture's pixel layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PixelFormat {
	/// Planar 4:2:0, three planes.
	Yuv420p,
	/// Semi-planar 4:2:0, luma plus interleaved chroma.
	Nv12,
	Rgba,
	Bgra,
	/// The decoder did not report a format.
	None,
	/// Reported by the decoder but not convertible.
	Other(String),
}

impl PixelFormat {
	pub fn from_name(name: &str) -> Self {
		match name {
			"yuv420p" | "yuvj420p" | "i420" => PixelFormat::Yuv420p,
			"nv12" => PixelFormat::Nv12,
			"rgba" => PixelFormat::Rgba,
			"bgra" => PixelFormat::Bgra,
			"" | "none" => PixelFormat::None,
			other => PixelFormat::Other(other.to_string()),
		}
	}
}

impl fmt::Display for PixelFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PixelFormat::Yuv420p => f.write_str("yuv420p"),
			PixelFormat::Nv12 => f.write_str("nv12"),
			PixelFormat::Rgba => f.write_str("rgba"),
			PixelFormat::Bgra => f.write_str("bgra"),
			PixelFormat::None => f.write_str("none"),
			PixelFormat::Other(name) => f.write_str(name),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
	pub data: Bytes,
	/// Bytes per row, including any padding.
	pub stride: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
	pub width: u32,
	pub height: u32,
	pub format: PixelFormat,
	pub planes: Vec<Plane>,
}

/// A single open decoder instance.
///
/// Mirrors the send/receive model of libavcodec: [FrameCodec::send] queues one access
/// unit, [FrameCodec::receive] pulls at most one picture. `Ok(None)` from receive means
/// "no output yet" and is not a failure. [Error::Again] from send means the decoder is
/// full and the unit was not consumed.
pub trait FrameCodec: Send {
	fn send(&mut self, payload: &[u8], timestamp_us: u64) -> Result<(), Error>;
	fn receive(&mut self) -> Result<Option<Picture>, Error>;

	/// Drop all internal reference state, ready for a fresh keyframe.
	fn flush(&mut self) -> Result<(), Error>;

	/// The name of the concrete decoder, for logging.
	fn name(&self) -> &str;

	/// Dimensions the decoder learned at open time, if any.
	fn dimensions(&self) -> Option<(u32, u32)> {
		None
	}
}

/// Opens [FrameCodec]s.
pub trait CodecFactory: Send + Sync {
	fn open(&self, params: &CodecParams) -> Result<Box<dyn FrameCodec>, Error>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codec_families() {
		let cases = [
			("avc1.64001f", CodecKind::H264),
			("avc3.42e01e", CodecKind::H264),
			("H264", CodecKind::H264),
			("hev1.1.6.L93.B0", CodecKind::H265),
			("hvc1.1.6.L93.B0", CodecKind::H265),
			("HEVC", CodecKind::H265),
			("vp09.00.10.08", CodecKind::Vp9),
			("vp8", CodecKind::Vp8),
			("av01.0.08M.08", CodecKind::Av1),
		];

		for (codec, kind) in cases {
			assert_eq!(CodecKind::from_codec_str(codec).unwrap(), kind, "{codec}");
		}
	}

	#[test]
	fn unknown_codec() {
		let err = CodecKind::from_codec_str("mp4v.20.9").unwrap_err();
		assert!(matches!(err, Error::UnknownCodec(codec) if codec == "mp4v.20.9"));
		assert!(CodecKind::from_codec_str("").is_err());
	}

	#[test]
	fn pixel_format_names() {
		assert_eq!(PixelFormat::from_name("yuv420p"), PixelFormat::Yuv420p);
		assert_eq!(PixelFormat::from_name("none"), PixelFormat::None);
		assert_eq!(PixelFormat::from_name("p010le"), PixelFormat::Other("p010le".into()));
		assert_eq!(PixelFormat::Other("p010le".into()).to_string(), "p010le");
	}
}
