//! Input and output buffers exchanged with the decode worker.
//!
//! Buffers are allocated once by the pool and recycled; [Buffer::clear] resets them to an empty state
//! without giving up their allocations.

use std::{fmt, ops};

use bytes::{Bytes, BytesMut};

/// Per-buffer flags.
///
/// The values match the ones used by demuxers upstream, so they can be passed through unchanged.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
	pub const NONE: Self = Self(0);
	pub const KEY_FRAME: Self = Self(0x1);
	pub const END_OF_STREAM: Self = Self(0x4);
	pub const ENCRYPTED: Self = Self(0x4000_0000);
	pub const DECODE_ONLY: Self = Self(0x8000_0000);

	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	pub fn insert(&mut self, other: Self) {
		self.0 |= other.0;
	}

	pub fn remove(&mut self, other: Self) {
		self.0 &= !other.0;
	}
}

impl ops::BitOr for Flags {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

impl fmt::Debug for Flags {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let names = [
			(Self::KEY_FRAME, "KEY_FRAME"),
			(Self::END_OF_STREAM, "END_OF_STREAM"),
			(Self::ENCRYPTED, "ENCRYPTED"),
			(Self::DECODE_ONLY, "DECODE_ONLY"),
		];

		let mut set = f.debug_set();
		for (flag, name) in names {
			if self.contains(flag) {
				set.entry(&format_args!("{name}"));
			}
		}
		set.finish()
	}
}

/// A recyclable buffer, managed by a [crate::Pool].
pub trait Buffer: Send + Sync + 'static {
	/// Reset to the freshly allocated state, keeping any allocations.
	fn clear(&mut self);

	fn flags(&self) -> Flags;

	fn add_flag(&mut self, flag: Flags);

	fn is_end_of_stream(&self) -> bool {
		self.flags().contains(Flags::END_OF_STREAM)
	}

	fn is_decode_only(&self) -> bool {
		self.flags().contains(Flags::DECODE_ONLY)
	}

	/// Record how many decode-only buffers were dropped before this one.
	fn set_skipped(&mut self, _skipped: usize) {}
}

/// The pixel format family requested for decoded frames.
///
/// The numeric values are shared with the engine.
#[derive(
	Debug,
	Clone,
	Copy,
	Default,
	PartialEq,
	Eq,
	Hash,
	num_enum::TryFromPrimitive,
	num_enum::IntoPrimitive,
	clap::ValueEnum,
	serde::Serialize,
	serde::Deserialize,
)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
	None = -1,
	#[default]
	Yuv = 0,
	Rgb = 1,
}

/// The encryption scheme of an access unit.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(i32)]
pub enum CryptoMode {
	#[default]
	Unencrypted = 0,
	AesCtr = 1,
	AesCbc = 2,
}

/// One clear/encrypted pair of a subsample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subsample {
	pub clear: u32,
	pub encrypted: u32,
}

impl Subsample {
	pub fn new(clear: u32, encrypted: u32) -> Self {
		Self { clear, encrypted }
	}
}

/// Everything the engine needs to decrypt one access unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CryptoInfo {
	pub mode: CryptoMode,
	pub key: Vec<u8>,
	pub iv: Vec<u8>,
	pub subsamples: Vec<Subsample>,
}

impl CryptoInfo {
	/// The clear byte counts, one per subsample.
	pub fn clear_bytes(&self) -> Vec<u32> {
		self.subsamples.iter().map(|s| s.clear).collect()
	}

	/// The encrypted byte counts, one per subsample.
	pub fn encrypted_bytes(&self) -> Vec<u32> {
		self.subsamples.iter().map(|s| s.encrypted).collect()
	}

	/// The number of bytes covered by the subsample layout.
	pub fn total_bytes(&self) -> u64 {
		self.subsamples
			.iter()
			.map(|s| s.clear as u64 + s.encrypted as u64)
			.sum()
	}
}

/// Color metadata, passed from the input to the frame decoded from it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColorInfo {
	pub color_space: i32,
	pub color_range: i32,
	pub color_transfer: i32,
	pub hdr_static_info: Option<Bytes>,
}

/// An encoded access unit waiting to be decoded.
#[derive(Debug)]
pub struct InputBuffer {
	data: BytesMut,
	flags: Flags,

	/// Presentation timestamp in microseconds.
	pub timestamp: i64,

	/// Present when the access unit is encrypted.
	pub crypto: Option<CryptoInfo>,

	pub color: Option<ColorInfo>,
}

impl InputBuffer {
	pub(crate) fn new(initial_size: usize) -> Self {
		Self {
			data: BytesMut::with_capacity(initial_size),
			flags: Flags::NONE,
			timestamp: 0,
			crypto: None,
			color: None,
		}
	}

	pub fn data(&self) -> &[u8] {
		&self.data
	}

	pub fn data_mut(&mut self) -> &mut [u8] {
		&mut self.data
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.data.capacity()
	}

	/// Make room for `additional` more bytes, keeping the current contents.
	pub fn ensure_space(&mut self, additional: usize) {
		self.data.reserve(additional);
	}

	/// Append to the encoded data, growing the buffer if needed.
	pub fn write(&mut self, data: &[u8]) {
		self.ensure_space(data.len());
		self.data.extend_from_slice(data);
	}

	pub fn set_flags(&mut self, flags: Flags) {
		self.flags = flags;
	}

	pub fn is_encrypted(&self) -> bool {
		self.crypto.is_some()
	}
}

impl Buffer for InputBuffer {
	fn clear(&mut self) {
		self.data.clear();
		self.flags = Flags::NONE;
		self.timestamp = 0;
		self.crypto = None;
		self.color = None;
	}

	fn flags(&self) -> Flags {
		self.flags
	}

	fn add_flag(&mut self, flag: Flags) {
		self.flags.insert(flag);
	}
}

/// A single plane of pixel data.
#[derive(Debug, Clone, Default)]
pub struct Plane {
	pub data: Vec<u8>,

	/// Number of bytes between rows (may include padding).
	pub stride: usize,

	/// Number of rows.
	pub rows: usize,
}

impl Plane {
	fn reset(&mut self, stride: usize, rows: usize) {
		self.stride = stride;
		self.rows = rows;
		self.data.clear();
		self.data.resize(stride * rows, 0);
	}

	/// Iterate over each row, trimmed to `width` bytes.
	pub fn rows(&self, width: usize) -> impl Iterator<Item = &[u8]> {
		let width = width.min(self.stride);
		self.data.chunks(self.stride.max(1)).map(move |row| &row[..width.min(row.len())])
	}
}

/// A decoded frame, handed to the consumer.
#[derive(Debug, Default)]
pub struct OutputBuffer {
	flags: Flags,
	mode: Option<OutputMode>,
	width: u32,
	height: u32,
	planes: Vec<Plane>,

	/// Presentation timestamp in microseconds, as reported by the engine.
	pub timestamp: i64,

	pub color: Option<ColorInfo>,

	/// The number of decode-only outputs dropped since the previous delivered buffer.
	pub skipped: usize,
}

impl OutputBuffer {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	/// Prepare for a new frame; the engine fills in the rest.
	pub fn init(&mut self, timestamp: i64, mode: OutputMode) {
		self.timestamp = timestamp;
		self.mode = Some(mode);
		self.width = 0;
		self.height = 0;
		self.planes.clear();
	}

	/// Size the buffer for a planar YUV frame and return the planes to fill.
	pub fn init_yuv(&mut self, width: u32, height: u32, strides: [usize; 3], rows: [usize; 3]) -> &mut [Plane] {
		self.init_planes(width, height, &strides, &rows)
	}

	/// Size the buffer for a packed RGB frame and return the plane to fill.
	pub fn init_rgb(&mut self, width: u32, height: u32, stride: usize) -> &mut Plane {
		&mut self.init_planes(width, height, &[stride], &[height as usize])[0]
	}

	fn init_planes(&mut self, width: u32, height: u32, strides: &[usize], rows: &[usize]) -> &mut [Plane] {
		self.width = width;
		self.height = height;
		self.planes.resize_with(strides.len(), Plane::default);
		for (plane, (stride, rows)) in self.planes.iter_mut().zip(strides.iter().zip(rows)) {
			plane.reset(*stride, *rows);
		}
		&mut self.planes
	}

	/// The output mode the frame was produced with, or None for buffers without a frame.
	pub fn mode(&self) -> Option<OutputMode> {
		self.mode
	}

	pub fn width(&self) -> u32 {
		self.width
	}

	pub fn height(&self) -> u32 {
		self.height
	}

	pub fn planes(&self) -> &[Plane] {
		&self.planes
	}
}

impl Buffer for OutputBuffer {
	fn clear(&mut self) {
		self.flags = Flags::NONE;
		self.mode = None;
		self.width = 0;
		self.height = 0;
		self.timestamp = 0;
		self.color = None;
		self.skipped = 0;
		for plane in &mut self.planes {
			plane.data.clear();
		}
	}

	fn flags(&self) -> Flags {
		self.flags
	}

	fn add_flag(&mut self, flag: Flags) {
		self.flags.insert(flag);
	}

	fn set_skipped(&mut self, skipped: usize) {
		self.skipped = skipped;
	}
}
