//! Splits an Annex-B HEVC elementary stream into access units.

use anyhow::Context;
use bytes::{Buf, Bytes, BytesMut};

/// The start code written in front of every NAL unit we emit.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Iterates over the NAL units in an Annex-B buffer, without their start codes.
pub struct NalIterator {
	data: Bytes,
}

impl NalIterator {
	pub fn new(data: Bytes) -> Self {
		Self { data }
	}
}

impl Iterator for NalIterator {
	type Item = Bytes;

	fn next(&mut self) -> Option<Bytes> {
		loop {
			let start = find_start_code(&self.data)?;
			self.data.advance(start + 3);

			let end = find_start_code(&self.data).unwrap_or(self.data.len());
			let nal = self.data.split_to(end);

			// Trailing zeros belong to the next (4 byte) start code.
			let len = nal.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
			if len > 0 {
				return Some(nal.slice(..len));
			}
		}
	}
}

fn find_start_code(data: &[u8]) -> Option<usize> {
	data.windows(3).position(|w| w == [0, 0, 1])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum HevcNalType {
	TrailN = 0,
	TrailR = 1,
	TsaN = 2,
	TsaR = 3,
	StsaN = 4,
	StsaR = 5,
	RadlN = 6,
	RadlR = 7,
	RaslN = 8,
	RaslR = 9,
	// 10 -> 15 reserved
	BlaWLp = 16,
	BlaWRadl = 17,
	BlaNLp = 18,
	IdrWRadl = 19,
	IdrNLp = 20,
	Cra = 21,
	// 22 -> 31 reserved
	Vps = 32,
	Sps = 33,
	Pps = 34,
	Aud = 35,
	EndOfSequence = 36,
	EndOfBitstream = 37,
	Filler = 38,
	SeiPrefix = 39,
	SeiSuffix = 40,
} // ITU H.265 Table 7-1

impl HevcNalType {
	pub fn is_slice(self) -> bool {
		(self as u8) <= Self::Cra as u8
	}

	/// Random access points, decodable without earlier frames.
	pub fn is_keyframe(self) -> bool {
		(Self::BlaWLp as u8..=Self::Cra as u8).contains(&(self as u8))
	}

	pub fn is_parameter_set(self) -> bool {
		matches!(self, Self::Vps | Self::Sps | Self::Pps)
	}
}

/// Reads the type from the first byte of the two byte NAL header.
pub fn nal_type(nal: &[u8]) -> anyhow::Result<Option<HevcNalType>> {
	anyhow::ensure!(nal.len() >= 2, "NAL unit is too short");

	let header = nal[0];
	anyhow::ensure!(header & 0x80 == 0, "forbidden zero bit is not zero");

	Ok(HevcNalType::try_from((header >> 1) & 0b111111).ok())
}

/// One compressed frame, in Annex-B format with 4 byte start codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
	pub data: Bytes,
	pub keyframe: bool,
}

/// Groups NAL units into access units.
#[derive(Default)]
pub struct Splitter {
	current: BytesMut,
	contains_slice: bool,
	keyframe: bool,
}

impl Splitter {
	/// Add the next NAL unit, returning the previous access unit if this one starts a new frame.
	pub fn push(&mut self, nal: Bytes) -> anyhow::Result<Option<AccessUnit>> {
		let kind = nal_type(&nal)?;

		let mut finished = None;

		match kind {
			Some(HevcNalType::Vps | HevcNalType::Sps | HevcNalType::Pps | HevcNalType::Aud | HevcNalType::SeiPrefix) => {
				finished = self.finish();
			}
			Some(kind) if kind.is_slice() => {
				// first_slice_segment_in_pic_flag, the first bit after the header.
				if nal.get(2).context("NAL unit is too short")? & 0x80 != 0 {
					finished = self.finish();
				}

				self.contains_slice = true;
				self.keyframe |= kind.is_keyframe();
			}
			_ => {}
		}

		self.current.extend_from_slice(&START_CODE);
		self.current.extend_from_slice(&nal);

		Ok(finished)
	}

	/// Return the final access unit, if it contains a slice.
	pub fn finish(&mut self) -> Option<AccessUnit> {
		// Nothing to decode until we've seen a slice.
		if !self.contains_slice {
			return None;
		}

		let unit = AccessUnit {
			data: self.current.split().freeze(),
			keyframe: self.keyframe,
		};

		self.contains_slice = false;
		self.keyframe = false;

		Some(unit)
	}
}

/// The parameter sets before the first slice, each with a start code.
///
/// Used as the codec initialization data when none is given explicitly.
pub fn parameter_sets(data: Bytes) -> anyhow::Result<Vec<Bytes>> {
	let mut sets = Vec::new();

	for nal in NalIterator::new(data) {
		match nal_type(&nal)? {
			Some(kind) if kind.is_slice() => break,
			Some(kind) if kind.is_parameter_set() => {
				let mut set = BytesMut::with_capacity(START_CODE.len() + nal.len());
				set.extend_from_slice(&START_CODE);
				set.extend_from_slice(&nal);
				sets.push(set.freeze());
			}
			_ => {}
		}
	}

	Ok(sets)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn nal(kind: HevcNalType, body: &[u8]) -> Vec<u8> {
		let mut nal = vec![(kind as u8) << 1, 1];
		nal.extend_from_slice(body);
		nal
	}

	fn stream(nals: &[Vec<u8>]) -> Bytes {
		let mut out = Vec::new();
		for (i, nal) in nals.iter().enumerate() {
			// Mix 3 and 4 byte start codes.
			match i % 2 {
				0 => out.extend_from_slice(&[0, 0, 0, 1]),
				_ => out.extend_from_slice(&[0, 0, 1]),
			}
			out.extend_from_slice(nal);
		}
		out.into()
	}

	fn split(data: Bytes) -> Vec<AccessUnit> {
		let mut splitter = Splitter::default();
		let mut units = Vec::new();

		for nal in NalIterator::new(data) {
			units.extend(splitter.push(nal).unwrap());
		}
		units.extend(splitter.finish());

		units
	}

	#[test]
	fn test_nal_iterator() {
		let data = stream(&[vec![0x40, 0x01, 0xaa], vec![0x42, 0x01], vec![0x02, 0x01, 0x80]]);
		let nals: Vec<_> = NalIterator::new(data).collect();

		assert_eq!(nals.len(), 3);
		assert_eq!(&nals[0][..], &[0x40, 0x01, 0xaa]);
		assert_eq!(&nals[1][..], &[0x42, 0x01]);
		assert_eq!(&nals[2][..], &[0x02, 0x01, 0x80]);
	}

	#[test]
	fn test_not_annexb() {
		assert_eq!(NalIterator::new(Bytes::from_static(b"\x40\x01\x02")).count(), 0);
	}

	#[test]
	fn test_access_units() {
		let data = stream(&[
			nal(HevcNalType::Vps, &[0xa0]),
			nal(HevcNalType::Sps, &[0xa1]),
			nal(HevcNalType::Pps, &[0xa2]),
			nal(HevcNalType::IdrWRadl, &[0x80, 1]),
			// A second slice of the same picture.
			nal(HevcNalType::IdrWRadl, &[0x40, 2]),
			nal(HevcNalType::TrailR, &[0x80, 3]),
			nal(HevcNalType::Aud, &[0x50]),
			nal(HevcNalType::TrailR, &[0x80, 4]),
		]);

		let units = split(data);
		assert_eq!(units.len(), 3);

		assert!(units[0].keyframe);
		let nals: Vec<_> = NalIterator::new(units[0].data.clone()).collect();
		assert_eq!(nals.len(), 5);
		assert!(units[0].data.starts_with(&START_CODE));

		assert!(!units[1].keyframe);
		assert_eq!(NalIterator::new(units[1].data.clone()).count(), 1);

		// The AUD travels with the frame it starts.
		let nals: Vec<_> = NalIterator::new(units[2].data.clone()).collect();
		assert_eq!(nal_type(&nals[0]).unwrap(), Some(HevcNalType::Aud));
		assert_eq!(nals.len(), 2);
	}

	#[test]
	fn test_parameter_sets() {
		let data = stream(&[
			nal(HevcNalType::Vps, &[0xa0]),
			nal(HevcNalType::Sps, &[0xa1]),
			nal(HevcNalType::SeiPrefix, &[0xa2]),
			nal(HevcNalType::Pps, &[0xa3]),
			nal(HevcNalType::Cra, &[0x80]),
			nal(HevcNalType::Sps, &[0xa4]),
		]);

		let sets = parameter_sets(data).unwrap();
		assert_eq!(sets.len(), 3);
		assert_eq!(&sets[1][..], &[0, 0, 0, 1, (HevcNalType::Sps as u8) << 1, 1, 0xa1]);
	}

	#[test]
	fn test_forbidden_bit() {
		let mut splitter = Splitter::default();
		assert!(splitter.push(Bytes::from_static(&[0x80, 0x01, 0x00])).is_err());
		assert!(splitter.push(Bytes::from_static(&[0x02])).is_err());
	}
}
