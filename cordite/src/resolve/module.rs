//! Resolved module structures: the data pool, fixup entries, and the
//! `Module` node built from a raw container.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use bitflags::bitflags;
use derivative::Derivative;
use fxhash::FxHashMap;
use nohash_hasher::IntMap;

use crate::errors::{LoadError, ParseError};
use crate::ident::{read_escaped_literal, read_identifier, read_literal};
use crate::raw::{RawCod, RawFixup, RawMemberRef};
use crate::reader::{Endian, Reader};
use crate::resolve::class::ClassDef;
use crate::resolve::refs::{ClassRef, FieldRef, MethodRef, ModuleHandle, ModuleId};
use crate::resolve::routine::RoutineDef;
use crate::types::TypeList;

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct ModuleAttrs: u8 {
		const LIBRARY = 0x01;
		const MIDLET = 0x02;
		const PARSEABLE = 0x04;
		const BRITTLE = 0x10;
		const PLATFORM = 0x20;
	}
}

/// Cached access to the data section bytes: identifiers, literals, type
/// lists, and blobs, all keyed by data-section offsets.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DataPool {
	#[derivative(Debug(format_with = "fmt_len"))]
	raw: Vec<u8>,
	ids: RefCell<FxHashMap<u16, Rc<str>>>,
	lits: RefCell<FxHashMap<u16, Rc<str>>>,
	tlists: RefCell<FxHashMap<u16, TypeList>>,
}

fn fmt_len(data: &Vec<u8>, f: &mut Formatter) -> fmt::Result {
	write!(f, "[{} bytes]", data.len())
}

impl DataPool {
	pub fn new(raw: Vec<u8>) -> Self {
		Self {
			raw,
			ids: RefCell::new(FxHashMap::default()),
			lits: RefCell::new(FxHashMap::default()),
			tlists: RefCell::new(FxHashMap::default()),
		}
	}

	fn reader(&self, offset: u16) -> Reader {
		let mut reader = Reader::with_endian(&self.raw, Endian::Little);
		reader.seek(offset as usize);
		reader
	}

	/// Packed identifier at `offset`, dots canonicalized to slashes.
	pub fn get_id(&self, offset: u16) -> Result<Rc<str>, ParseError> {
		if let Some(hit) = self.ids.borrow().get(&offset) {
			return Ok(hit.clone());
		}
		let id: Rc<str> = read_identifier(&mut self.reader(offset))?.into();
		self.ids.borrow_mut().insert(offset, id.clone());
		Ok(id)
	}

	pub fn get_lit(&self, offset: u16, unicode: bool, needs_header: bool) -> Result<Rc<str>, ParseError> {
		if let Some(hit) = self.lits.borrow().get(&offset) {
			return Ok(hit.clone());
		}
		let lit: Rc<str> = read_literal(&mut self.reader(offset), unicode, needs_header, None)?.into();
		self.lits.borrow_mut().insert(offset, lit.clone());
		Ok(lit)
	}

	pub fn get_escaped_lit(&self, offset: u16) -> Result<Rc<str>, ParseError> {
		if let Some(hit) = self.lits.borrow().get(&offset) {
			return Ok(hit.clone());
		}
		let lit: Rc<str> = read_escaped_literal(&mut self.reader(offset))?.into();
		self.lits.borrow_mut().insert(offset, lit.clone());
		Ok(lit)
	}

	pub fn get_blob(&self, offset: u16, length: usize) -> Result<Vec<u8>, ParseError> {
		Ok(self.reader(offset).bytes(length)?.to_vec())
	}

	/// Type list at `offset`; the sentinel offset `0xFFFF` denotes the
	/// empty list.
	pub fn get_tlist(&self, offset: u16) -> Result<TypeList, ParseError> {
		if offset == 0xFFFF {
			return Ok(TypeList::empty());
		}
		if let Some(hit) = self.tlists.borrow().get(&offset) {
			return Ok(hit.clone());
		}
		let tlist = TypeList::parse(&mut self.reader(offset))?;
		self.tlists.borrow_mut().insert(offset, tlist.clone());
		Ok(tlist)
	}
}

#[derive(Debug, Clone)]
pub struct EntryPoint {
	pub name: Rc<str>,
	pub param_types: TypeList,
	pub offset: u16,
}

impl Display for EntryPoint {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}({})", self.name, self.param_types)
	}
}

#[derive(Debug, Clone)]
pub struct ExportedItem {
	pub name: Rc<str>,
	pub value: Vec<u8>,
}

impl Display for ExportedItem {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.value.len() {
			0 => write!(f, "{}=None", self.name),
			1 => write!(f, "{}={}", self.name, self.value[0]),
			_ => write!(f, "{}={:02x?}", self.name, self.value),
		}
	}
}

/// A trailer signature block: a four-byte tag and its payload.
#[derive(Debug, Clone)]
pub struct Signature {
	pub kind: u16,
	pub tag: String,
	pub data: Vec<u8>,
}

/// Interface-method reference from the data section.
#[derive(Debug, Clone)]
pub struct InterfaceMethodRef {
	/// Record offset relative to the data section start.
	pub offset: u32,
	pub class: ClassRef,
	pub name: Rc<str>,
	pub param_types: TypeList,
	pub return_type: TypeList,
}

impl Display for InterfaceMethodRef {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}({}){}", self.class, self.name, self.param_types, self.return_type)
	}
}

/// Class-reference table entry. `mod_index` does not reliably index the
/// import list, so resolution goes through the symbolic dependency search
/// with `mod_index` only as a preference hint.
#[derive(Debug, Clone)]
pub struct ClassRefEntry {
	pub offset: u32,
	pub mod_index: u16,
	pub package: Rc<str>,
	pub class_name: Rc<str>,
	pub extra: (u8, u8),
	pub resolved: RefCell<Option<ClassRef>>,
}

impl ClassRefEntry {
	pub fn full_name(&self) -> String {
		match self.package.is_empty() {
			true => self.class_name.to_string(),
			false => format!("{}/{}", self.package, self.class_name),
		}
	}
}

impl Display for ClassRefEntry {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.full_name())
	}
}

/// What a fixup entry referred to before resolution.
#[derive(Debug, Clone)]
pub enum FixupSource {
	LocalField { class: ClassRef, field_index: u8 },
	FieldMember { class_ref: usize, name: Rc<str>, ty: TypeList },
	Method { class_ref: usize, name: Rc<str>, param_types: TypeList, return_type: Option<TypeList> },
	ClassRefIdx { class_ref: usize },
	ModRef { mod_byte: u8 },
}

/// A resolved fixup target, substituted into instruction operands.
#[derive(Debug, Clone)]
pub enum FixupTarget {
	Field(FieldRef),
	Method(MethodRef),
	Class(ClassRef),
	ModByte(u8),
}

#[derive(Debug)]
pub struct FixupEntry {
	pub offsets: Option<Vec<u16>>,
	pub source: FixupSource,
	pub item: RefCell<Option<FixupTarget>>,
}

impl FixupEntry {
	pub fn item(&self) -> Option<FixupTarget> {
		self.item.borrow().clone()
	}
}

/// One loaded module. The loader owns the `Module` (behind `Rc`); the
/// module exclusively owns its classes, routines, raw code, and fixups.
/// Everything that mutates after registration sits behind a `Cell` or
/// `RefCell`, so registered modules are only ever borrowed shared.
#[derive(Debug)]
pub struct Module {
	pub id: ModuleId,
	pub name: String,
	pub version: String,
	pub timestamp: u32,
	pub attrs: ModuleAttrs,
	/// Set when the container was captured from disk rather than dumped
	/// from a live heap; heap images carry remapped class references.
	pub disk: bool,
	pub siblings: Vec<String>,
	pub aliases: Vec<String>,
	pub imports: Vec<ModuleHandle>,
	pub import_versions: Vec<String>,
	pub exports: Vec<ExportedItem>,
	pub statics: Vec<(u16, i32)>,
	pub entry_points: Vec<EntryPoint>,
	pub signatures: Vec<Signature>,
	pub classes: Vec<ClassDef>,
	pub routines: Vec<RoutineDef>,
	pub(crate) routine_by_offset: FxHashMap<u32, usize>,
	pub iface_mrefs: Vec<InterfaceMethodRef>,
	pub class_refs: Vec<ClassRefEntry>,
	pub(crate) iface_mref_map: IntMap<u32, usize>,
	/// Heap-mode alternate lookup: class-ref `extra` id to class-ref index.
	pub(crate) crem: FxHashMap<(u8, u8), usize>,
	pub(crate) mod_remap: RefCell<FxHashMap<u8, ModuleId>>,
	/// Instance and local field fixups share one table; relative field
	/// operands index into it.
	pub field_fixups: Vec<FixupEntry>,
	pub static_field_fixups: Vec<FixupEntry>,
	pub method_fixups: Vec<FixupEntry>,
	pub virtual_method_fixups: Vec<FixupEntry>,
	pub static_method_fixups: Vec<FixupEntry>,
	pub class_ref_fixups: Vec<FixupEntry>,
	pub mod_ref_fixups: Vec<FixupEntry>,
	pub(crate) fixup_map: RefCell<IntMap<u32, FixupTarget>>,
	pub pool: DataPool,
	pub(crate) resolved: Cell<bool>,
	pub(crate) actualized: Cell<bool>,
	pub(crate) disasmed: Cell<bool>,
}

impl Module {
	pub fn base_name(&self) -> &str {
		self.siblings.first().map(String::as_str).unwrap_or(&self.name)
	}

	pub fn is_resolved(&self) -> bool {
		self.resolved.get()
	}

	pub fn is_actualized(&self) -> bool {
		self.actualized.get()
	}

	pub fn is_disasmed(&self) -> bool {
		self.disasmed.get()
	}

	pub fn is_brittle(&self) -> bool {
		self.attrs.contains(ModuleAttrs::BRITTLE)
	}

	pub fn routine_index_at(&self, offset: u32) -> Option<usize> {
		self.routine_by_offset.get(&offset).copied()
	}

	pub fn iface_mref_at(&self, offset: u32) -> Option<&InterfaceMethodRef> {
		self.iface_mref_map.get(&offset).map(|i| &self.iface_mrefs[*i])
	}

	pub fn fixup_target(&self, offset: u32) -> Option<FixupTarget> {
		self.fixup_map.borrow().get(&offset).cloned()
	}

	pub(crate) fn mod_remap_get(&self, mod_byte: u8) -> Option<ModuleId> {
		self.mod_remap.borrow().get(&mod_byte).copied()
	}

	pub(crate) fn fixup_lists(&self) -> [&Vec<FixupEntry>; 7] {
		[
			&self.field_fixups,
			&self.static_field_fixups,
			&self.method_fixups,
			&self.virtual_method_fixups,
			&self.static_method_fixups,
			&self.class_ref_fixups,
			&self.mod_ref_fixups,
		]
	}

	/// Build a `Module` from a parsed container. Cross-references stay
	/// raw; `resolve` rewrites them once siblings and imports are loaded.
	pub fn from_raw(id: ModuleId, cod: &RawCod) -> Result<Self, LoadError> {
		let ds = &cod.data;
		let pool = DataPool::new(ds.raw.clone());
		let disk = cod.header.section_num == 0;

		let name = ds.module_name.clone();
		let version = ds.module_version.clone();

		let attrs = ModuleAttrs::from_bits_truncate(ds.hdr.flags);

		let entry_points = ds
			.hdr
			.entry_points
			.iter()
			.filter(|ep| ep.offset != 0)
			.map(|ep| {
				Ok(EntryPoint {
					name: pool.get_id(ep.name)?,
					param_types: pool.get_tlist(ep.param_types)?,
					offset: ep.offset,
				})
			})
			.collect::<Result<Vec<_>, ParseError>>()?;

		let lits = |offsets: &[u16]| -> Result<Vec<String>, ParseError> {
			offsets.iter().map(|off| Ok(pool.get_escaped_lit(*off)?.to_string())).collect()
		};
		let siblings = lits(&ds.siblings)?;
		let aliases = lits(&ds.aliases)?;
		let raw_imports: Vec<String> =
			ds.modules[1..].iter().map(|(n, _)| Ok(pool.get_escaped_lit(*n)?.to_string())).collect::<Result<_, ParseError>>()?;
		let import_versions: Vec<String> =
			ds.modules[1..].iter().map(|(_, v)| Ok(pool.get_escaped_lit(*v)?.to_string())).collect::<Result<_, ParseError>>()?;

		let exports = ds
			.exports
			.iter()
			.map(|x| {
				Ok(ExportedItem {
					name: pool.get_id(x.name)?,
					value: pool.get_blob(x.data_offset, x.length as usize)?,
				})
			})
			.collect::<Result<Vec<_>, ParseError>>()?;

		let statics = ds.static_data.iter().map(|sd| (sd.address, sd.value)).collect();

		// Routines come first so classes can claim them by offset.
		let mut routines = Vec::with_capacity(cod.code.routines.len());
		for (index, raw) in cod.code.routines.iter().enumerate() {
			routines.push(RoutineDef::from_raw(id, index, raw, &pool)?);
		}
		let routine_by_offset: FxHashMap<u32, usize> =
			routines.iter().enumerate().map(|(i, r)| (r.offset, i)).collect();

		let mut classes = Vec::with_capacity(ds.class_defs.len());
		for (index, raw) in ds.class_defs.iter().enumerate() {
			classes.push(ClassDef::from_raw(id, index, raw, &pool, &routine_by_offset, &mut routines)?);
		}

		let iface_mrefs = ds
			.iface_method_refs
			.iter()
			.map(|imr| {
				Ok(InterfaceMethodRef {
					offset: imr.offset,
					class: ClassRef::raw(imr.class_id.0, imr.class_id.1),
					name: pool.get_id(imr.name)?,
					param_types: pool.get_tlist(imr.param_types)?,
					return_type: pool.get_tlist(imr.return_type)?,
				})
			})
			.collect::<Result<Vec<_>, ParseError>>()?;

		let class_refs = ds
			.class_refs
			.iter()
			.map(|cr| {
				Ok(ClassRefEntry {
					offset: cr.offset,
					mod_index: cr.mod_index,
					package: pool.get_id(cr.pack_name)?,
					class_name: pool.get_id(cr.class_name)?,
					extra: cr.extra,
					resolved: RefCell::new(None),
				})
			})
			.collect::<Result<Vec<_>, ParseError>>()?;

		let iface_mref_map = iface_mrefs.iter().enumerate().map(|(i, imr)| (imr.offset, i)).collect();
		let class_ref_map: IntMap<u32, usize> =
			class_refs.iter().enumerate().map(|(i, cr)| (cr.offset, i)).collect();

		let crem = match disk {
			true => FxHashMap::default(),
			false => class_refs
				.iter()
				.enumerate()
				.filter(|(_, cr)| cr.extra != (0, 0))
				.map(|(i, cr)| (cr.extra, i))
				.collect(),
		};

		let member_fixup = |raw: &RawFixup| -> Result<FixupEntry, LoadError> {
			let source = match &raw.member {
				RawMemberRef::LocalField { class_index, field_index } => FixupSource::LocalField {
					class: ClassRef::raw(0, *class_index),
					field_index: *field_index,
				},
				RawMemberRef::Short { class_ref, name, ty } => FixupSource::FieldMember {
					class_ref: class_ref_index(&class_ref_map, *class_ref)?,
					name: pool.get_id(*name)?,
					ty: pool.get_tlist(*ty)?,
				},
				other => {
					return Err(LoadError::BadReference(format!("{other:?} in field fixup table")))
				}
			};
			Ok(FixupEntry { offsets: raw.offsets.clone(), source, item: RefCell::new(None) })
		};
		let method_fixup = |raw: &RawFixup| -> Result<FixupEntry, LoadError> {
			let source = match &raw.member {
				RawMemberRef::Short { class_ref, name, ty } => FixupSource::Method {
					class_ref: class_ref_index(&class_ref_map, *class_ref)?,
					name: pool.get_id(*name)?,
					param_types: pool.get_tlist(*ty)?,
					return_type: None,
				},
				RawMemberRef::Long { class_ref, name, param_types, return_type } => {
					FixupSource::Method {
						class_ref: class_ref_index(&class_ref_map, *class_ref)?,
						name: pool.get_id(*name)?,
						param_types: pool.get_tlist(*param_types)?,
						return_type: Some(pool.get_tlist(*return_type)?),
					}
				}
				other => {
					return Err(LoadError::BadReference(format!("{other:?} in method fixup table")))
				}
			};
			Ok(FixupEntry { offsets: raw.offsets.clone(), source, item: RefCell::new(None) })
		};

		let field_fixups = ds
			.field_fixups
			.iter()
			.chain(&ds.local_field_fixups)
			.map(|raw| member_fixup(raw))
			.collect::<Result<Vec<_>, _>>()?;
		let static_field_fixups =
			ds.static_field_fixups.iter().map(|raw| member_fixup(raw)).collect::<Result<Vec<_>, _>>()?;
		let method_fixups =
			ds.routine_fixups.iter().map(|raw| method_fixup(raw)).collect::<Result<Vec<_>, _>>()?;
		let virtual_method_fixups =
			ds.virtual_routine_fixups.iter().map(|raw| method_fixup(raw)).collect::<Result<Vec<_>, _>>()?;
		let static_method_fixups =
			ds.static_routine_fixups.iter().map(|raw| method_fixup(raw)).collect::<Result<Vec<_>, _>>()?;
		let class_ref_fixups = ds
			.class_ref_fixups
			.iter()
			.map(|raw| {
				let source = match &raw.member {
					RawMemberRef::ClassRefOffset(off) => {
						FixupSource::ClassRefIdx { class_ref: class_ref_index(&class_ref_map, *off)? }
					}
					other => {
						return Err(LoadError::BadReference(format!("{other:?} in class-ref fixup table")))
					}
				};
				Ok(FixupEntry { offsets: raw.offsets.clone(), source, item: RefCell::new(None) })
			})
			.collect::<Result<Vec<_>, LoadError>>()?;
		let mod_ref_fixups = ds
			.mod_code_fixups
			.iter()
			.map(|raw| {
				let source = match &raw.member {
					RawMemberRef::ModByte(byte) => FixupSource::ModRef { mod_byte: *byte },
					other => {
						return Err(LoadError::BadReference(format!("{other:?} in module-code fixup table")))
					}
				};
				Ok(FixupEntry { offsets: raw.offsets.clone(), source, item: RefCell::new(None) })
			})
			.collect::<Result<Vec<_>, LoadError>>()?;

		let signatures = cod
			.trailer
			.iter()
			.map(|item| Signature {
				kind: item.kind,
				tag: item.value.iter().take(4).map(|b| *b as char).collect(),
				data: item.value.get(4..).unwrap_or_default().to_vec(),
			})
			.collect();

		Ok(Self {
			id,
			name,
			version,
			timestamp: cod.header.timestamp,
			attrs,
			disk,
			siblings,
			aliases,
			imports: raw_imports.iter().map(|n| ModuleHandle::new(n.as_str())).collect(),
			import_versions,
			exports,
			statics,
			entry_points,
			signatures,
			classes,
			routines,
			routine_by_offset,
			iface_mrefs,
			class_refs,
			iface_mref_map,
			crem,
			mod_remap: RefCell::new(FxHashMap::default()),
			field_fixups,
			static_field_fixups,
			method_fixups,
			virtual_method_fixups,
			static_method_fixups,
			class_ref_fixups,
			mod_ref_fixups,
			fixup_map: RefCell::new(IntMap::default()),
			pool,
			resolved: Cell::new(false),
			actualized: Cell::new(false),
			disasmed: Cell::new(false),
		})
	}
}

fn class_ref_index(map: &IntMap<u32, usize>, offset: u16) -> Result<usize, LoadError> {
	map.get(&(offset as u32))
		.copied()
		.ok_or_else(|| LoadError::BadReference(format!("class-ref offset {offset:#06x}")))
}

impl Display for Module {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{} v. {}", self.name, self.version)
	}
}
