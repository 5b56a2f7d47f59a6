//! Raw container decoding.
//!
//! This layer turns module bytes into strictly-typed structures without
//! resolving anything: every cross-reference stays an offset into the data
//! pool or a raw `(mod_byte, class_byte)` tuple. The loader gives these
//! meaning later.

pub mod code;
pub mod data;

pub use code::{RawCodeSection, RawExHandler, RawRoutine, RawStackMapEntry};
pub use data::{
	RawClassDef, RawClassRef, RawDataHeader, RawDataSection, RawEntryPoint, RawExport,
	RawFieldDef, RawFixup, RawIfaceMethodRef, RawMemberRef, RawStaticData, RawStaticFieldDef,
};

use crate::errors::ParseError;
use crate::reader::{Reader, Result};

pub const COD_MAGIC: u32 = 0xFFFF_C0DE;
pub const HEADER_SIZE: usize = 44;
pub const SUPPORTED_COD_VERSIONS: [u16; 2] = [78, 79];
pub const SUPPORTED_DATA_VERSIONS: [u8; 2] = [5, 6];

/// The fixed 44-byte file header.
#[derive(Debug, Copy, Clone)]
pub struct RawHeader {
	pub flash_id: u32,
	pub section_num: u32,
	pub vtable_ptr: u32,
	pub timestamp: u32,
	pub user_version: u32,
	pub fieldref_ptr: u32,
	pub max_typelist_size: u16,
	pub reserved: i16,
	pub data_section: i32,
	pub mod_info: i32,
	pub version: u16,
	pub code_size: u16,
	pub data_size: u16,
	pub flags: u16,
}

impl RawHeader {
	pub fn parse(reader: &mut Reader) -> Result<Self> {
		let header = Self {
			flash_id: reader.u32()?,
			section_num: reader.u32()?,
			vtable_ptr: reader.u32()?,
			timestamp: reader.u32()?,
			user_version: reader.u32()?,
			fieldref_ptr: reader.u32()?,
			max_typelist_size: reader.u16()?,
			reserved: reader.i16()?,
			data_section: reader.i32()?,
			mod_info: reader.i32()?,
			version: reader.u16()?,
			code_size: reader.u16()?,
			data_size: reader.u16()?,
			flags: reader.u16()?,
		};
		if header.flash_id != COD_MAGIC {
			return Err(ParseError::malformed(0, "not a valid module header"));
		}
		if !SUPPORTED_COD_VERSIONS.contains(&header.version) {
			return Err(ParseError::UnsupportedVersion { version: header.version });
		}
		Ok(header)
	}
}

/// A trailer record; observed in the wild only as signature blocks.
#[derive(Debug, Clone)]
pub struct RawTrailerItem {
	pub kind: u16,
	pub value: Vec<u8>,
}

impl RawTrailerItem {
	fn parse(reader: &mut Reader) -> Result<Self> {
		let kind = reader.u16()?;
		let length = reader.u16()?;
		let value = reader.bytes(length as usize)?.to_vec();
		Ok(Self { kind, value })
	}
}

/// A fully decoded module container.
#[derive(Debug)]
pub struct RawCod {
	pub header: RawHeader,
	pub data: RawDataSection,
	pub code: RawCodeSection,
	pub trailer: Vec<RawTrailerItem>,
}

impl RawCod {
	pub fn parse(bytes: &[u8]) -> Result<Self> {
		let mut reader = Reader::new(bytes);
		let header = RawHeader::parse(&mut reader)?;

		let code_start = HEADER_SIZE;
		let data_start = HEADER_SIZE + header.code_size as usize;

		reader.seek(data_start);
		let data = RawDataSection::parse(&mut reader, &header, data_start)?;

		reader.seek(code_start);
		let code = RawCodeSection::parse(&mut reader, &header, &data, code_start)?;

		reader.seek(data_start + header.data_size as usize);
		let trailer = reader.array_until_eof(RawTrailerItem::parse)?;

		Ok(Self { header, data, code, trailer })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bad_magic_is_rejected_at_offset_zero() {
		let mut bytes = vec![0u8; HEADER_SIZE];
		bytes[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
		let err = RawCod::parse(&bytes).unwrap_err();
		assert!(matches!(err, ParseError::MalformedModule { offset: 0, .. }));
	}

	#[test]
	fn unsupported_version_is_rejected() {
		let mut bytes = vec![0u8; HEADER_SIZE];
		bytes[0..4].copy_from_slice(&COD_MAGIC.to_le_bytes());
		bytes[36..38].copy_from_slice(&77u16.to_le_bytes());
		let err = RawCod::parse(&bytes).unwrap_err();
		assert!(matches!(err, ParseError::UnsupportedVersion { version: 77 }));
	}
}
