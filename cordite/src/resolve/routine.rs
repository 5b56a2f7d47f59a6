//! Routine definitions, stack maps, and exception handlers.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use bitflags::bitflags;
use derivative::Derivative;

use crate::disasm::Instruction;
use crate::errors::ParseError;
use crate::raw::{RawExHandler, RawRoutine};
use crate::resolve::module::DataPool;
use crate::resolve::refs::{ClassId, ClassRef, ModuleId, RoutineId};
use crate::types::TypeList;

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct RoutineAttrs: u16 {
		const PUBLIC = 0x001;
		const PRIVATE = 0x002;
		const PROTECTED = 0x004;
		const FINAL = 0x008;
		const STATIC = 0x010;
		const ABSTRACT = 0x020;
		const THROWS = 0x040;
		const INIT = 0x080;
		const CLINIT = 0x100;
	}
}

#[derive(Debug, Clone)]
pub struct StackMapEntry {
	pub label: u16,
	pub types: TypeList,
}

impl Display for StackMapEntry {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{} @ {:05}", self.types, self.label)
	}
}

/// A resolved exception handler. A missing class reference marks a
/// catch-all (`finally`) handler.
#[derive(Debug, Clone)]
pub struct ExHandler {
	pub scope: (u32, u32),
	pub target: u32,
	pub class: ClassRef,
}

impl ExHandler {
	pub fn is_finally(&self) -> bool {
		self.class.is_missing()
	}

	pub fn covers(&self, offset: u32) -> bool {
		self.scope.0 <= offset && offset < self.scope.1
	}
}

impl Display for ExHandler {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}({}..{}) => {}", self.class, self.scope.0, self.scope.1, self.target)
	}
}

/// One routine: metadata, raw code, and (after disassembly) the labeled
/// instruction stream.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RoutineDef {
	pub id: RoutineId,
	pub parent: Option<ClassId>,
	/// Entry offset relative to the code section; doubles as the code
	/// start for branch-target arithmetic.
	pub offset: u32,
	pub name: Rc<str>,
	pub param_types: TypeList,
	pub return_type: TypeList,
	pub attrs: RoutineAttrs,
	pub max_stack: u16,
	pub max_locals: u16,
	pub stack_size: u16,
	pub stack_map: Vec<StackMapEntry>,
	#[derivative(Debug(format_with = "fmt_code"))]
	pub code: Vec<u8>,
	pub(crate) raw_handlers: RefCell<Vec<RawExHandler>>,
	pub handlers: RefCell<Vec<ExHandler>>,
	pub instructions: RefCell<Vec<Instruction>>,
	pub(crate) resolved: Cell<bool>,
	pub(crate) disasmed: Cell<bool>,
}

fn fmt_code(code: &Vec<u8>, f: &mut Formatter) -> fmt::Result {
	write!(f, "[{} bytes]", code.len())
}

impl RoutineDef {
	pub(crate) fn from_raw(
		module: ModuleId,
		index: usize,
		raw: &RawRoutine,
		pool: &DataPool,
	) -> Result<Self, ParseError> {
		let stack_map = raw
			.stack_map
			.iter()
			.map(|sme| Ok(StackMapEntry { label: sme.label, types: pool.get_tlist(sme.type_off)? }))
			.collect::<Result<Vec<_>, ParseError>>()?;

		Ok(Self {
			id: RoutineId { module, index },
			parent: None,
			offset: raw.offset,
			name: pool.get_id(raw.name)?,
			param_types: pool.get_tlist(raw.param_types)?,
			return_type: pool.get_tlist(raw.return_type)?,
			attrs: RoutineAttrs::from_bits_truncate(raw.attrs),
			max_stack: raw.max_stack as u16,
			max_locals: raw.max_locals as u16,
			stack_size: raw.stack_size as u16,
			stack_map,
			code: raw.code.clone(),
			raw_handlers: RefCell::new(raw.handlers.clone()),
			handlers: RefCell::new(Vec::new()),
			instructions: RefCell::new(Vec::new()),
			resolved: Cell::new(false),
			disasmed: Cell::new(false),
		})
	}

	pub fn is_static(&self) -> bool {
		self.attrs.contains(RoutineAttrs::STATIC)
	}

	pub fn is_disasmed(&self) -> bool {
		self.disasmed.get()
	}

	/// Descriptor of the return type; an empty list reads as void.
	pub fn return_jts(&self) -> String {
		match self.return_type.is_empty() {
			true => "V".to_string(),
			false => self.return_type.to_jts(),
		}
	}

	/// Full JTS signature given the owning class name, e.g.
	/// `pkg/Cls/run(I)V`. `skip_first` drops the receiver parameter.
	pub fn jts(&self, class_name: &str, skip_first: bool) -> String {
		let params = match skip_first {
			true => self.param_types.to_jts_skip_first(),
			false => self.param_types.to_jts(),
		};
		format!("{}/{}({}){}", class_name, self.name, params, self.return_jts())
	}
}
