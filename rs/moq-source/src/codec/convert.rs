//! Decoded picture to packed RGBA.

use super::{Picture, PixelFormat, Plane};
use crate::Error;

/// The output is always packed 4 bytes per pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Larger pictures are assumed to be a decoder bug.
pub const MAX_DIMENSION: u32 = 16384;

/// Converts pictures of one fixed size and format into RGBA.
///
/// Built from the first decoded picture and rebuilt whenever the decoder's output
/// changes shape, since the coded configuration does not reliably predict it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converter {
	width: u32,
	height: u32,
	format: PixelFormat,
}

impl Converter {
	pub fn new(width: u32, height: u32, format: &PixelFormat) -> Result<Self, Error> {
		if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
			return Err(Error::InvalidPicture { width, height });
		}

		match format {
			PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Rgba | PixelFormat::Bgra => {}
			PixelFormat::None => return Err(Error::UnsupportedPixelFormat(format.to_string())),
			PixelFormat::Other(name) => return Err(Error::UnsupportedPixelFormat(name.clone())),
		}

		Ok(Self {
			width,
			height,
			format: format.clone(),
		})
	}

	pub fn width(&self) -> u32 {
		self.width
	}

	pub fn height(&self) -> u32 {
		self.height
	}

	pub fn format(&self) -> &PixelFormat {
		&self.format
	}

	pub fn stride(&self) -> usize {
		self.width as usize * BYTES_PER_PIXEL
	}

	/// The size of the output buffer this converter writes.
	pub fn output_len(&self) -> usize {
		self.stride() * self.height as usize
	}

	pub fn matches(&self, picture: &Picture) -> bool {
		self.width == picture.width && self.height == picture.height && self.format == picture.format
	}

	pub fn convert(&self, picture: &Picture, dst: &mut [u8]) -> Result<(), Error> {
		if !self.matches(picture) {
			return Err(Error::InvalidPicture {
				width: picture.width,
				height: picture.height,
			});
		}

		if dst.len() < self.output_len() {
			return Err(Error::decode(anyhow::anyhow!(
				"output buffer too small: {} < {}",
				dst.len(),
				self.output_len()
			)));
		}

		let (w, h) = (self.width as usize, self.height as usize);
		let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

		match self.format {
			PixelFormat::Yuv420p => {
				let [y, u, v] = planes::<3>(picture)?;
				check(y, w, h)?;
				check(u, cw, ch)?;
				check(v, cw, ch)?;

				for row in 0..h {
					let y_row = &y.data[row * y.stride..];
					let u_row = &u.data[(row / 2) * u.stride..];
					let v_row = &v.data[(row / 2) * v.stride..];
					let out = &mut dst[row * w * BYTES_PER_PIXEL..(row + 1) * w * BYTES_PER_PIXEL];

					for (col, pixel) in out.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
						let rgb = yuv_to_rgb(y_row[col], u_row[col / 2], v_row[col / 2]);
						pixel.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
					}
				}
			}
			PixelFormat::Nv12 => {
				let [y, uv] = planes::<2>(picture)?;
				check(y, w, h)?;
				check(uv, cw * 2, ch)?;

				for row in 0..h {
					let y_row = &y.data[row * y.stride..];
					let uv_row = &uv.data[(row / 2) * uv.stride..];
					let out = &mut dst[row * w * BYTES_PER_PIXEL..(row + 1) * w * BYTES_PER_PIXEL];

					for (col, pixel) in out.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
						let chroma = (col / 2) * 2;
						let rgb = yuv_to_rgb(y_row[col], uv_row[chroma], uv_row[chroma + 1]);
						pixel.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
					}
				}
			}
			PixelFormat::Rgba | PixelFormat::Bgra => {
				let [packed] = planes::<1>(picture)?;
				let row_len = w * BYTES_PER_PIXEL;
				check(packed, row_len, h)?;

				for row in 0..h {
					let src = &packed.data[row * packed.stride..row * packed.stride + row_len];
					let out = &mut dst[row * row_len..(row + 1) * row_len];
					out.copy_from_slice(src);

					if self.format == PixelFormat::Bgra {
						for pixel in out.chunks_exact_mut(BYTES_PER_PIXEL) {
							pixel.swap(0, 2);
						}
					}
				}
			}
			PixelFormat::None | PixelFormat::Other(_) => {
				return Err(Error::UnsupportedPixelFormat(self.format.to_string()));
			}
		}

		Ok(())
	}
}

fn planes<const N: usize>(picture: &Picture) -> Result<[&Plane; N], Error> {
	let planes: Vec<&Plane> = picture.planes.iter().take(N).collect();
	planes
		.try_into()
		.map_err(|_| Error::decode(anyhow::anyhow!("{} picture needs {N} planes", picture.format)))
}

// Every row must be addressable through the stride, and the last row must be complete.
fn check(plane: &Plane, width: usize, height: usize) -> Result<(), Error> {
	let needed = plane.stride * (height - 1) + width;
	if plane.stride < width || plane.data.len() < needed {
		return Err(Error::decode(anyhow::anyhow!(
			"plane too small: stride={} len={} need={}",
			plane.stride,
			plane.data.len(),
			needed
		)));
	}
	Ok(())
}

/// BT.601 limited range, integer approximation.
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
	let c = 298 * (y as i32 - 16);
	let d = u as i32 - 128;
	let e = v as i32 - 128;

	let r = (c + 409 * e + 128) >> 8;
	let g = (c - 100 * d - 208 * e + 128) >> 8;
	let b = (c + 516 * d + 128) >> 8;

	[r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8]
}
