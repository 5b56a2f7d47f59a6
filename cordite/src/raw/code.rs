//! Code section decoding: routine records, stack maps, exception handlers.

use crate::errors::ParseError;
use crate::reader::{Reader, Result};
use crate::raw::data::RawDataSection;
use crate::raw::RawHeader;

pub const ATTR_THROWS: u16 = 0x40;
const HANDLER_SENTINEL: u16 = 0xFFFF;
const SHORT_HEADER_SIZE: usize = 9;
const LONG_HEADER_SIZE: usize = 14;

#[derive(Debug, Copy, Clone)]
pub struct RawStackMapEntry {
	pub label: u16,
	pub type_off: u16,
}

#[derive(Debug, Copy, Clone)]
pub struct RawExHandler {
	pub start: u16,
	pub end: u16,
	pub target: u16,
	pub class_id: (u8, u8),
	/// Offset of the handler's type field relative to the code section;
	/// handler-type fixups land on this offset.
	pub type_offset: u32,
}

/// One routine record. `offset` is the routine entry (the first code byte)
/// relative to the code section start; the header precedes it.
#[derive(Debug, Clone)]
pub struct RawRoutine {
	pub offset: u32,
	pub name: u16,
	pub param_types: u16,
	pub return_type: u16,
	pub attrs: u16,
	pub stack_size: u8,
	pub max_locals: u8,
	pub max_stack: u8,
	pub stack_map: Vec<RawStackMapEntry>,
	pub code: Vec<u8>,
	pub handlers: Vec<RawExHandler>,
}

impl RawRoutine {
	fn parse(reader: &mut Reader, entry: usize, section_start: usize) -> Result<Self> {
		// The byte five before the entry distinguishes the two header forms.
		reader.seek(entry);
		let marker = reader.skip(-5).u8()?;
		let short_header = marker > 1;
		let header_offset = entry - if short_header { SHORT_HEADER_SIZE } else { LONG_HEADER_SIZE };

		reader.seek(header_offset);
		let (name, param_types, return_type, code_size, attrs, stack_size, max_locals, max_stack);
		if short_header {
			return_type = reader.u16()?;
			param_types = reader.u16()?;
			let size_byte = reader.u8()?;
			if size_byte < 2 {
				return Err(ParseError::malformed(header_offset, "short routine header with bad code size"));
			}
			code_size = (size_byte - 2) as usize;
			attrs = reader.u8()? as u16;
			name = reader.u16()?;
			let packed = reader.u8()?;
			stack_size = (packed >> 6) & 3;
			max_locals = (packed >> 4) & 3;
			max_stack = packed & 3;
		} else {
			name = reader.u16()?;
			param_types = reader.u16()?;
			return_type = reader.u16()?;
			code_size = reader.u16()? as usize;
			attrs = reader.u16()?;
			stack_size = reader.u8()?;
			max_locals = reader.u8()?;
			let _unused = reader.u8()?;
			max_stack = reader.u8()?;
		}

		// Stack-map entries precede the header.
		let mut stack_map = Vec::new();
		if stack_size > 0 {
			reader.mark();
			reader.seek(header_offset - stack_size as usize * 4);
			stack_map = reader.array_fixed(stack_size as usize, |r| {
				Ok(RawStackMapEntry { label: r.u16()?, type_off: r.u16()? })
			})?;
			reader.revert();
		}

		let code = reader.bytes(code_size)?.to_vec();

		let mut handlers = Vec::new();
		if attrs & ATTR_THROWS != 0 {
			loop {
				let word = reader.u16()?;
				if word == HANDLER_SENTINEL {
					break;
				}
				reader.skip(-2);
				let start = reader.u16()?;
				let end = reader.u16()?;
				let target = reader.u16()?;
				let class_id = (reader.u8()?, reader.u8()?);
				let type_offset = (reader.tell() - 2 - section_start) as u32;
				handlers.push(RawExHandler { start, end, target, class_id, type_offset });
			}
		}

		Ok(Self {
			offset: (entry - section_start) as u32,
			name,
			param_types,
			return_type,
			attrs,
			stack_size,
			max_locals,
			max_stack,
			stack_map,
			code,
			handlers,
		})
	}
}

#[derive(Debug)]
pub struct RawCodeSection {
	pub start: usize,
	pub size: usize,
	pub routines: Vec<RawRoutine>,
}

impl RawCodeSection {
	/// Routines are found through the class definitions' member-offset
	/// arrays; the code section itself carries no directory.
	pub fn parse(
		reader: &mut Reader,
		header: &RawHeader,
		data: &RawDataSection,
		start: usize,
	) -> Result<Self> {
		let mut routines = Vec::new();
		for class_def in &data.class_defs {
			let offsets = class_def
				.virtual_routines
				.iter()
				.chain(&class_def.nonvirtual_routines)
				.chain(&class_def.static_routines);
			for roff in offsets {
				routines.push(RawRoutine::parse(reader, start + *roff as usize, start)?);
			}
		}
		reader.seek(start + header.code_size as usize);
		Ok(Self { start, size: header.code_size as usize, routines })
	}
}
