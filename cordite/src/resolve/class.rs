//! Class definitions, fields, and the derived lookup tables.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use bitflags::bitflags;
use fxhash::FxHashMap;

use crate::errors::{LoadError, ParseError};
use crate::raw::RawClassDef;
use crate::resolve::module::DataPool;
use crate::resolve::refs::{ClassId, ClassRef, FieldId, FieldRef, MethodRef, ModuleId};
use crate::resolve::routine::RoutineDef;
use crate::types::TypeList;

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct ClassAttrs: u16 {
		const PUBLIC = 0x001;
		const PRIVATE = 0x002;
		const PROTECTED = 0x004;
		const FINAL = 0x008;
		const ABSTRACT = 0x010;
		const INTERFACE = 0x020;
		const HAS_VERIFY_ERROR = 0x040;
		const PERSISTABLE = 0x080;
		const UNGROUPABLE = 0x100;
		const INNER = 0x200;
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct FieldAttrs: u8 {
		const PUBLIC = 0x01;
		const PRIVATE = 0x02;
		const PROTECTED = 0x04;
		const FINAL = 0x08;
	}
}

/// Instance or static field. `address` is present only for statics.
#[derive(Debug, Clone)]
pub struct FieldDef {
	pub name: Rc<str>,
	/// Field types arrive as single-token type lists.
	pub ty: TypeList,
	pub attrs: FieldAttrs,
	pub address: Option<u16>,
}

impl FieldDef {
	pub fn is_wide(&self) -> bool {
		self.ty.first().map(|t| t.slots() == 2).unwrap_or(false)
	}
}

/// A member found by name lookup.
#[derive(Debug, Copy, Clone)]
pub enum MemberId {
	Field(FieldId),
	Routine(crate::resolve::refs::RoutineId),
}

#[derive(Debug)]
pub struct ClassDef {
	pub id: ClassId,
	pub package: Rc<str>,
	/// `package/short_name` when the package is non-empty.
	pub name: Rc<str>,
	pub attrs: ClassAttrs,
	pub superclass: ClassRef,
	pub ifaces: Vec<ClassRef>,
	pub fields: Vec<FieldDef>,
	pub static_fields: Vec<FieldDef>,
	/// Member routines as indexes into the owning module's routine list.
	pub virtual_methods: Vec<usize>,
	pub nonvirtual_methods: Vec<usize>,
	pub static_methods: Vec<usize>,
	pub(crate) static_address_map: FxHashMap<u16, usize>,
	/// Virtual-function table, built at actualize time.
	pub vft: RefCell<Vec<MethodRef>>,
	/// Field-lookup table: instance fields in inheritance order, wide
	/// fields occupying two consecutive slots.
	pub fft: RefCell<Vec<FieldRef>>,
	pub(crate) field_members: RefCell<Option<FxHashMap<Rc<str>, Vec<FieldId>>>>,
	pub(crate) method_members: RefCell<Option<FxHashMap<Rc<str>, Vec<usize>>>>,
	pub(crate) resolved: Cell<bool>,
	pub(crate) actualized: Cell<bool>,
	pub(crate) actualizing: Cell<bool>,
}

impl ClassDef {
	pub(crate) fn from_raw(
		module: ModuleId,
		index: usize,
		raw: &RawClassDef,
		pool: &DataPool,
		routine_by_offset: &FxHashMap<u32, usize>,
		routines: &mut [RoutineDef],
	) -> Result<Self, LoadError> {
		let id = ClassId { module, index };
		let package = pool.get_id(raw.pack_name)?;
		let short_name = pool.get_id(raw.class_name)?;
		let name: Rc<str> = match package.is_empty() {
			true => short_name,
			false => format!("{package}/{short_name}").into(),
		};

		let mut make_fields = |defs: &[(u16, u16, Option<u16>)],
		                       attrs: &[u8],
		                       prefix: &str|
		 -> Result<Vec<FieldDef>, ParseError> {
			defs.iter()
				.enumerate()
				.map(|(i, (name_off, type_off, address))| {
					let mut name = pool.get_id(*name_off)?;
					if name.is_empty() {
						name = format!("{prefix}_{:03}", i + 1).into();
					}
					Ok(FieldDef {
						name,
						ty: pool.get_tlist(*type_off)?,
						attrs: FieldAttrs::from_bits_truncate(*attrs.get(i).unwrap_or(&0)),
						address: *address,
					})
				})
				.collect()
		};

		let field_defs: Vec<(u16, u16, Option<u16>)> =
			raw.fields.iter().map(|f| (f.name, f.type_off, None)).collect();
		let static_defs: Vec<(u16, u16, Option<u16>)> =
			raw.static_fields.iter().map(|f| (f.name, f.type_off, Some(f.address))).collect();
		let fields = make_fields(&field_defs, &raw.field_attrs, "f")?;
		let static_fields = make_fields(&static_defs, &raw.static_field_attrs, "sf")?;

		let static_address_map =
			static_fields.iter().enumerate().filter_map(|(i, f)| f.address.map(|a| (a, i))).collect();

		let claim = |offsets: &[u16], prefix: &str, routines: &mut [RoutineDef]| -> Result<Vec<usize>, LoadError> {
			offsets
				.iter()
				.enumerate()
				.map(|(i, off)| {
					let rindex = routine_by_offset.get(&(*off as u32)).copied().ok_or_else(|| {
						LoadError::BadReference(format!("routine offset {off:#06x} in class {name}"))
					})?;
					let routine = &mut routines[rindex];
					if routine.parent.is_some() {
						return Err(LoadError::BadReference(format!(
							"routine '{}' claimed by two classes",
							routine.name
						)));
					}
					routine.parent = Some(id);
					if routine.name.is_empty() {
						routine.name = format!("{prefix}_{:03}", i + 1).into();
					}
					Ok(rindex)
				})
				.collect()
		};

		let virtual_methods = claim(&raw.virtual_routines, "vm", routines)?;
		let nonvirtual_methods = claim(&raw.nonvirtual_routines, "m", routines)?;
		let static_methods = claim(&raw.static_routines, "sm", routines)?;

		Ok(Self {
			id,
			package,
			name,
			attrs: ClassAttrs::from_bits_truncate(raw.flags),
			superclass: ClassRef::raw(raw.superclass.0, raw.superclass.1),
			ifaces: raw.ifaces.iter().map(|(m, c)| ClassRef::raw(*m, *c)).collect(),
			fields,
			static_fields,
			virtual_methods,
			nonvirtual_methods,
			static_methods,
			static_address_map,
			vft: RefCell::new(Vec::new()),
			fft: RefCell::new(Vec::new()),
			field_members: RefCell::new(None),
			method_members: RefCell::new(None),
			resolved: Cell::new(false),
			actualized: Cell::new(false),
			actualizing: Cell::new(false),
		})
	}

	pub fn is_interface(&self) -> bool {
		self.attrs.contains(ClassAttrs::INTERFACE)
	}

	pub fn is_resolved(&self) -> bool {
		self.resolved.get()
	}

	pub fn is_actualized(&self) -> bool {
		self.actualized.get()
	}

	pub fn short_name(&self) -> &str {
		self.name.rsplit('/').next().unwrap_or(&self.name)
	}

	/// Member routine indexes in declaration order: virtuals, nonvirtuals,
	/// statics.
	pub fn routine_indexes(&self) -> impl Iterator<Item = usize> + '_ {
		self.virtual_methods
			.iter()
			.chain(&self.nonvirtual_methods)
			.chain(&self.static_methods)
			.copied()
	}

	pub fn static_field_by_address(&self, address: u16) -> Option<FieldId> {
		self.static_address_map.get(&address).map(|index| FieldId {
			class: self.id,
			is_static: true,
			index: *index,
		})
	}

	pub fn field(&self, id: FieldId) -> Option<&FieldDef> {
		debug_assert_eq!(id.class, self.id);
		match id.is_static {
			true => self.static_fields.get(id.index),
			false => self.fields.get(id.index),
		}
	}

	pub fn jts(&self) -> &str {
		&self.name
	}
}

impl Display for ClassDef {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.name)
	}
}
