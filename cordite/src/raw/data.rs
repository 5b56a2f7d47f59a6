//! Data section decoding: header, name tables, exports, class definitions,
//! interface-method refs, class refs, and the six fixup families.

use crate::errors::ParseError;
use crate::ident::unescape;
use crate::reader::{Reader, Result};
use crate::raw::{RawHeader, SUPPORTED_DATA_VERSIONS};

#[derive(Debug, Copy, Clone, Default)]
pub struct RawEntryPoint {
	pub offset: u16,
	pub name: u16,
	pub param_types: u16,
}

impl RawEntryPoint {
	fn parse(reader: &mut Reader) -> Result<Self> {
		Ok(Self { offset: reader.u16()?, name: reader.u16()?, param_types: reader.u16()? })
	}
}

/// The data section's internal header, 52 bytes including both entry-point
/// descriptors. All `off_*` fields are relative to the data section start.
#[derive(Debug, Clone)]
pub struct RawDataHeader {
	pub flags: u8,
	pub version: u8,
	pub num_icalls: u16,
	pub num_mods: u8,
	pub num_classes: u8,
	pub off_exports: u16,
	pub off_data_pool: u16,
	pub off_static_data: u16,
	pub off_class_defs: u16,
	pub off_type_lists: u16,
	pub off_iface_method_refs: u16,
	pub off_class_refs: u16,
	pub off_routine_fxps: u16,
	pub off_static_routine_fxps: u16,
	pub off_virtual_routine_fxps: u16,
	pub off_class_ref_fxps: u16,
	pub off_aliases: u16,
	pub off_field_fxps: u16,
	pub off_local_field_fxps: u16,
	pub off_static_field_fxps: u16,
	pub off_mod_code_fxps: u16,
	pub static_size: u16,
	pub entry_points: [RawEntryPoint; 2],
}

impl RawDataHeader {
	fn parse(reader: &mut Reader) -> Result<Self> {
		let hdr = Self {
			flags: reader.u8()?,
			version: reader.u8()?,
			num_icalls: reader.u16()?,
			num_mods: reader.u8()?,
			num_classes: reader.u8()?,
			off_exports: reader.u16()?,
			off_data_pool: reader.u16()?,
			off_static_data: reader.u16()?,
			off_class_defs: reader.u16()?,
			off_type_lists: reader.u16()?,
			off_iface_method_refs: reader.u16()?,
			off_class_refs: reader.u16()?,
			off_routine_fxps: reader.u16()?,
			off_static_routine_fxps: reader.u16()?,
			off_virtual_routine_fxps: reader.u16()?,
			off_class_ref_fxps: reader.u16()?,
			off_aliases: reader.u16()?,
			off_field_fxps: reader.u16()?,
			off_local_field_fxps: reader.u16()?,
			off_static_field_fxps: reader.u16()?,
			off_mod_code_fxps: reader.u16()?,
			static_size: reader.u16()?,
			entry_points: [RawEntryPoint::parse(reader)?, RawEntryPoint::parse(reader)?],
		};
		if !SUPPORTED_DATA_VERSIONS.contains(&hdr.version) {
			return Err(ParseError::UnsupportedDataVersion { version: hdr.version as u16 });
		}
		Ok(hdr)
	}
}

#[derive(Debug, Copy, Clone)]
pub struct RawExport {
	pub name: u16,
	pub length: u16,
	pub data_offset: u16,
}

#[derive(Debug, Copy, Clone)]
pub struct RawStaticData {
	pub address: u16,
	pub value: i32,
}

#[derive(Debug, Copy, Clone)]
pub struct RawIfaceMethodRef {
	/// Offset of this record relative to the data section start.
	pub offset: u32,
	pub class_id: (u8, u8),
	pub name: u16,
	pub param_types: u16,
	pub return_type: u16,
}

#[derive(Debug, Copy, Clone)]
pub struct RawClassRef {
	/// Offset of this record relative to the data section start.
	pub offset: u32,
	pub mod_index: u16,
	pub pack_name: u16,
	pub class_name: u16,
	pub extra: (u8, u8),
}

#[derive(Debug, Copy, Clone)]
pub struct RawFieldDef {
	pub name: u16,
	pub type_off: u16,
}

#[derive(Debug, Copy, Clone)]
pub struct RawStaticFieldDef {
	pub name: u16,
	pub type_off: u16,
	pub address: u16,
}

/// A class definition record plus its member-offset arrays.
#[derive(Debug, Clone)]
pub struct RawClassDef {
	pub pack_name: u16,
	pub class_name: u16,
	pub superclass: (u8, u8),
	pub static_start: u16,
	pub clinit_offset: u16,
	pub init_offset: u16,
	pub create_size: u16,
	pub secure_index: u16,
	pub index: u16,
	pub code_start: u16,
	pub code_end: u16,
	pub flags: u16,
	pub virtual_routines: Vec<u16>,
	pub nonvirtual_routines: Vec<u16>,
	pub static_routines: Vec<u16>,
	pub fields: Vec<RawFieldDef>,
	pub static_fields: Vec<RawStaticFieldDef>,
	pub ifaces: Vec<(u8, u8)>,
	pub field_attrs: Vec<u8>,
	pub static_field_attrs: Vec<u8>,
}

impl RawClassDef {
	fn parse(reader: &mut Reader) -> Result<Self> {
		let start = reader.tell();
		let pack_name = reader.u16()?;
		let class_name = reader.u16()?;
		let superclass = (reader.u8()?, reader.u8()?);
		let static_start = reader.u16()?;
		let clinit_offset = reader.u16()?;
		let init_offset = reader.u16()?;
		let create_size = reader.u16()?;
		let secure_index = reader.u16()?;
		let index = reader.u16()?;
		let code_start = reader.u16()?;
		let code_end = reader.u16()?;
		let flags = reader.u16()?;
		let off_virtual_routines = reader.u16()? as usize;
		let off_nonvirtual_routines = reader.u16()? as usize;
		let off_static_routines = reader.u16()? as usize;
		let off_fields = reader.u16()? as usize;
		let off_static_fields = reader.u16()? as usize;
		let off_ifaces = reader.u16()? as usize;
		let off_field_attrs = reader.u16()? as usize;
		let _off_static_field_attrs = reader.u16()? as usize;

		// Member arrays hang off the record at offsets relative to its start.
		reader.seek(start + off_virtual_routines);
		let virtual_routines = reader.array_bounded(start + off_nonvirtual_routines, |r| r.u16())?;
		let nonvirtual_routines = reader.array_bounded(start + off_static_routines, |r| r.u16())?;
		let static_routines = reader.array_bounded(start + off_fields, |r| r.u16())?;

		let fields = reader.array_bounded(start + off_static_fields, |r| {
			Ok(RawFieldDef { name: r.u16()?, type_off: r.u16()? })
		})?;
		let static_fields = reader.array_bounded(start + off_ifaces, |r| {
			Ok(RawStaticFieldDef { name: r.u16()?, type_off: r.u16()?, address: r.u16()? })
		})?;

		let ifaces = reader.array_bounded(start + off_field_attrs, |r| Ok((r.u8()?, r.u8()?)))?;

		let field_attrs = reader.array_fixed(fields.len(), |r| r.u8())?;
		let static_field_attrs = reader.array_fixed(static_fields.len(), |r| r.u8())?;

		Ok(Self {
			pack_name,
			class_name,
			superclass,
			static_start,
			clinit_offset,
			init_offset,
			create_size,
			secure_index,
			index,
			code_start,
			code_end,
			flags,
			virtual_routines,
			nonvirtual_routines,
			static_routines,
			fields,
			static_fields,
			ifaces,
			field_attrs,
			static_field_attrs,
		})
	}
}

/// A fixup record's member reference, shape depending on the table family
/// and the data section version.
#[derive(Debug, Clone)]
pub enum RawMemberRef {
	Short { class_ref: u16, name: u16, ty: u16 },
	Long { class_ref: u16, name: u16, param_types: u16, return_type: u16 },
	LocalField { class_index: u8, field_index: u8 },
	ClassRefOffset(u16),
	ModByte(u8),
}

#[derive(Debug, Clone)]
pub struct RawFixup {
	pub member: RawMemberRef,
	pub offsets: Option<Vec<u16>>,
}

/// Packed fixup-offset vector: a packed-u16 byte size followed by
/// packed-u16 deltas, cumulative-summed into absolute code offsets.
fn parse_offset_vector(reader: &mut Reader) -> Result<Vec<u16>> {
	let size = reader.packed_u16()? as usize;
	let end = reader.tell() + size;
	if size == 0 {
		return Ok(Vec::new());
	}
	let deltas = reader.array_bounded(end, |r| r.packed_u16())?;
	let mut offsets = Vec::with_capacity(deltas.len());
	let mut acc = 0u16;
	for (i, delta) in deltas.into_iter().enumerate() {
		acc = if i == 0 { delta } else { acc.wrapping_add(delta) };
		offsets.push(acc);
	}
	Ok(offsets)
}

enum FixupCount {
	Signed(i16),
	Word(u16),
}

fn parse_fixup_list(
	reader: &mut Reader,
	signed_count: bool,
	align: usize,
	explicit: bool,
	mut member: impl FnMut(&mut Reader) -> Result<RawMemberRef>,
) -> Result<Vec<RawFixup>> {
	let count = match signed_count {
		true => FixupCount::Signed(reader.i16()?),
		false => FixupCount::Word(reader.u16()?),
	};
	let (total, has_offsets) = match count {
		FixupCount::Signed(n) => (n.unsigned_abs() as usize, explicit || n < 0),
		FixupCount::Word(n) => (n as usize, explicit),
	};

	let mut fixups = Vec::with_capacity(total.min(4096));
	for _ in 0..total {
		reader.align(align);
		let member = member(reader)?;
		let offsets = match has_offsets {
			true => Some(parse_offset_vector(reader)?),
			false => None,
		};
		fixups.push(RawFixup { member, offsets });
	}
	Ok(fixups)
}

fn short_member(reader: &mut Reader) -> Result<RawMemberRef> {
	Ok(RawMemberRef::Short { class_ref: reader.u16()?, name: reader.u16()?, ty: reader.u16()? })
}

fn long_member(reader: &mut Reader) -> Result<RawMemberRef> {
	Ok(RawMemberRef::Long {
		class_ref: reader.u16()?,
		name: reader.u16()?,
		param_types: reader.u16()?,
		return_type: reader.u16()?,
	})
}

#[derive(Debug)]
pub struct RawDataSection {
	/// Absolute file offset of the data section.
	pub start: usize,
	/// The complete data section bytes, kept for pool lookups.
	pub raw: Vec<u8>,
	pub hdr: RawDataHeader,
	pub class_offsets: Vec<u16>,
	/// Parallel `(name_offset, version_offset)` pairs; index 0 is self.
	pub modules: Vec<(u16, u16)>,
	pub siblings: Vec<u16>,
	pub aliases: Vec<u16>,
	pub exports: Vec<RawExport>,
	pub static_data: Vec<RawStaticData>,
	pub class_defs: Vec<RawClassDef>,
	pub iface_method_refs: Vec<RawIfaceMethodRef>,
	pub class_refs: Vec<RawClassRef>,
	pub routine_fixups: Vec<RawFixup>,
	pub static_routine_fixups: Vec<RawFixup>,
	pub virtual_routine_fixups: Vec<RawFixup>,
	pub class_ref_fixups: Vec<RawFixup>,
	pub field_fixups: Vec<RawFixup>,
	pub local_field_fixups: Vec<RawFixup>,
	pub static_field_fixups: Vec<RawFixup>,
	pub mod_code_fixups: Vec<RawFixup>,
	pub module_name: String,
	pub module_version: String,
}

impl RawDataSection {
	pub fn parse(reader: &mut Reader, header: &RawHeader, start: usize) -> Result<Self> {
		reader.mark();
		let raw = reader.bytes(header.data_size as usize)?.to_vec();
		reader.revert();

		let hdr = RawDataHeader::parse(reader)?;

		let class_offsets = reader.array_fixed(hdr.num_classes as usize, |r| r.u16())?;

		let names = reader.array_fixed(hdr.num_mods as usize, |r| r.u16())?;
		let versions = reader.array_fixed(hdr.num_mods as usize, |r| r.u16())?;
		let modules: Vec<(u16, u16)> = names.into_iter().zip(versions).collect();
		if modules.is_empty() {
			return Err(ParseError::malformed(start, "data section lists no modules"));
		}

		// Contiguous optional name-offset regions.
		let siblings = reader.array_bounded(start + hdr.off_aliases as usize, |r| r.u16())?;
		let aliases = reader.array_bounded(start + hdr.off_exports as usize, |r| r.u16())?;
		let exports = reader.array_bounded(start + hdr.off_data_pool as usize, |r| {
			Ok(RawExport { name: r.u16()?, length: r.u16()?, data_offset: r.u16()? })
		})?;

		// The data pool itself is only reachable through `raw`.
		reader.seek(start + hdr.off_static_data as usize);
		let static_data = reader.array_bounded(start + hdr.off_class_defs as usize, |r| {
			Ok(RawStaticData { address: r.u16()?, value: r.i32()? })
		})?;

		let mut class_defs = Vec::with_capacity(class_offsets.len());
		for coff in &class_offsets {
			reader.seek(start + *coff as usize);
			class_defs.push(RawClassDef::parse(reader)?);
		}

		reader.seek(start + hdr.off_iface_method_refs as usize);
		let iface_method_refs = reader.array_bounded(start + hdr.off_class_refs as usize, |r| {
			let offset = (r.tell() - start) as u32;
			Ok(RawIfaceMethodRef {
				offset,
				class_id: (r.u8()?, r.u8()?),
				name: r.u16()?,
				param_types: r.u16()?,
				return_type: r.u16()?,
			})
		})?;
		let class_refs = reader.array_bounded(start + hdr.off_routine_fxps as usize, |r| {
			let offset = (r.tell() - start) as u32;
			Ok(RawClassRef {
				offset,
				mod_index: r.u16()?,
				pack_name: r.u16()?,
				class_name: r.u16()?,
				extra: (r.u8()?, r.u8()?),
			})
		})?;

		// Version 5 leaves certain tables' offset vectors implicit; version 6
		// spells them out. Member refs grow a return type in version 6.
		let long_refs = hdr.version == 6;
		let implicit_routines = hdr.version == 5;
		let implicit_static_fields = hdr.version == 5;
		let implicit_class_refs = hdr.version == 5;
		let routine_member: fn(&mut Reader) -> Result<RawMemberRef> =
			if long_refs { long_member } else { short_member };

		let check = |r: &mut Reader, off: u16, what: &str| -> Result<()> {
			r.align(2);
			if r.tell() != start + off as usize {
				return Err(ParseError::malformed(r.tell(), format!("{what} misaligned")));
			}
			Ok(())
		};

		check(reader, hdr.off_routine_fxps, "routine fixups")?;
		let routine_fixups = parse_fixup_list(reader, true, 2, !implicit_routines, routine_member)?;
		check(reader, hdr.off_static_routine_fxps, "static routine fixups")?;
		let static_routine_fixups = parse_fixup_list(reader, true, 2, !implicit_routines, routine_member)?;
		check(reader, hdr.off_virtual_routine_fxps, "virtual routine fixups")?;
		let virtual_routine_fixups = parse_fixup_list(reader, true, 2, true, routine_member)?;

		check(reader, hdr.off_class_ref_fxps, "class ref fixups")?;
		let class_ref_fixups = parse_fixup_list(reader, false, 2, !implicit_class_refs, |r| {
			Ok(RawMemberRef::ClassRefOffset(r.u16()?))
		})?;

		check(reader, hdr.off_field_fxps, "field fixups")?;
		let field_fixups = parse_fixup_list(reader, true, 2, true, short_member)?;
		check(reader, hdr.off_local_field_fxps, "local field fixups")?;
		let local_field_fixups = parse_fixup_list(reader, false, 1, true, |r| {
			Ok(RawMemberRef::LocalField { class_index: r.u8()?, field_index: r.u8()? })
		})?;
		check(reader, hdr.off_static_field_fxps, "static field fixups")?;
		let static_field_fixups = parse_fixup_list(reader, true, 2, !implicit_static_fields, short_member)?;

		check(reader, hdr.off_mod_code_fxps, "module code fixups")?;
		let mod_code_fixups = parse_fixup_list(reader, false, 1, true, |r| {
			Ok(RawMemberRef::ModByte(r.u8()?))
		})?;

		reader.seek(start + header.data_size as usize);

		let mut pool = Reader::new(&raw);
		let module_name = unescape(&cstr_string(&mut pool, modules[0].0 as usize)?);
		let module_version = unescape(&cstr_string(&mut pool, modules[0].1 as usize)?);

		Ok(Self {
			start,
			raw,
			hdr,
			class_offsets,
			modules,
			siblings,
			aliases,
			exports,
			static_data,
			class_defs,
			iface_method_refs,
			class_refs,
			routine_fixups,
			static_routine_fixups,
			virtual_routine_fixups,
			class_ref_fixups,
			field_fixups,
			local_field_fixups,
			static_field_fixups,
			mod_code_fixups,
			module_name,
			module_version,
		})
	}
}

fn cstr_string(reader: &mut Reader, offset: usize) -> Result<String> {
	let bytes = reader.cstr_at(offset)?;
	Ok(bytes.iter().map(|b| *b as char).collect())
}
