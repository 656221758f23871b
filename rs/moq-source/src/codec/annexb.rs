//! Length-prefixed (MP4 style) to start-code delimited (Annex B) NAL framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CodecKind, VideoConfig};
use crate::Error;

// Always the 4 byte form, so every unit costs exactly what its length prefix did.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// The framing of a track's payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
	/// Each NAL unit is prefixed by a 4 byte big-endian length; rewrite before decoding.
	LengthPrefixed,
	/// Already start-code delimited (H.26x with inline parameter sets) or not NAL based at all.
	Raw,
}

impl Container {
	/// H.264/H.265 with a decoder configuration record are length-prefixed.
	/// Without one the parameter sets travel inline and the stream is Annex B already.
	pub fn select(kind: CodecKind, config: &VideoConfig) -> Self {
		match kind.is_nal() && config.description.is_some() {
			true => Container::LengthPrefixed,
			false => Container::Raw,
		}
	}
}

/// Rewrite concatenated `[len:4][unit:len]` records into `00 00 00 01` + unit.
///
/// Fails without producing any output if a declared length runs past the end of the
/// buffer, or if fewer than 4 bytes remain where a length is expected.
pub fn length_prefixed_to_annexb(mut input: &[u8]) -> Result<Bytes, Error> {
	if input.is_empty() {
		return Err(Error::MalformedPayload("empty payload"));
	}

	let mut output = BytesMut::with_capacity(input.len());

	while input.has_remaining() {
		if input.remaining() < 4 {
			return Err(Error::MalformedPayload("truncated length prefix"));
		}

		let size = input.get_u32() as usize;
		if size > input.remaining() {
			return Err(Error::MalformedPayload("unit length exceeds payload"));
		}

		output.put_slice(&START_CODE);
		output.put_slice(&input[..size]);
		input.advance(size);
	}

	Ok(output.freeze())
}

/// Extract the parameter sets from an avcC or hvcC record as an Annex B stream.
///
/// The decoder is fed Annex B access units, so its extradata must be Annex B too.
/// Only 4 byte length prefixes are supported for the access units that follow.
pub fn parameter_sets(kind: CodecKind, record: &[u8]) -> Result<Bytes, Error> {
	let mut output = BytesMut::new();
	let mut buf = record;

	match kind {
		CodecKind::H264 => avcc(&mut buf, &mut output)?,
		CodecKind::H265 => hvcc(&mut buf, &mut output)?,
		_ => return Err(Error::decoder_init(anyhow::anyhow!("{kind} has no parameter set record"))),
	}

	if output.is_empty() {
		return Err(Error::decoder_init(anyhow::anyhow!("no parameter sets in {kind} record")));
	}

	Ok(output.freeze())
}

fn avcc(buf: &mut &[u8], output: &mut BytesMut) -> Result<(), Error> {
	ensure(buf, 6)?;

	let version = buf.get_u8();
	if version != 1 {
		return Err(Error::decoder_init(anyhow::anyhow!("unsupported avcC version: {version}")));
	}

	// profile, compatibility, level
	buf.advance(3);
	length_size(buf.get_u8() & 0b11)?;

	let sps = buf.get_u8() & 0b1_1111;
	copy_units(buf, output, sps as usize)?;

	ensure(buf, 1)?;
	let pps = buf.get_u8();
	copy_units(buf, output, pps as usize)?;

	// Anything after the PPS (high profile chroma info, SPS extensions) is not needed.
	Ok(())
}

fn hvcc(buf: &mut &[u8], output: &mut BytesMut) -> Result<(), Error> {
	ensure(buf, 23)?;

	let version = buf.get_u8();
	if version != 1 {
		return Err(Error::decoder_init(anyhow::anyhow!("unsupported hvcC version: {version}")));
	}

	// general profile/tier/level, segmentation, parallelism, chroma, bit depth, frame rate
	buf.advance(20);
	length_size(buf.get_u8() & 0b11)?;

	let arrays = buf.get_u8();
	for _ in 0..arrays {
		ensure(buf, 3)?;
		let _nal_type = buf.get_u8() & 0b11_1111;
		let count = buf.get_u16();
		copy_units(buf, output, count as usize)?;
	}

	Ok(())
}

fn length_size(minus_one: u8) -> Result<(), Error> {
	match minus_one + 1 {
		4 => Ok(()),
		size => Err(Error::decoder_init(anyhow::anyhow!("unsupported NAL length size: {size}"))),
	}
}

fn copy_units(buf: &mut &[u8], output: &mut BytesMut, count: usize) -> Result<(), Error> {
	for _ in 0..count {
		ensure(buf, 2)?;
		let size = buf.get_u16() as usize;
		ensure(buf, size)?;

		output.put_slice(&START_CODE);
		output.put_slice(&buf[..size]);
		buf.advance(size);
	}

	Ok(())
}

fn ensure(buf: &[u8], size: usize) -> Result<(), Error> {
	match buf.len() >= size {
		true => Ok(()),
		false => Err(Error::decoder_init(anyhow::anyhow!("truncated parameter set record"))),
	}
}
