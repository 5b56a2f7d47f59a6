//! Symbolic reference handles.
//!
//! The cross-module graph is highly cyclic, so nothing outside the loader
//! owns a node. Every cross-module reference is a handle carrying a
//! symbolic key (or a raw `(mod_byte, class_byte)` tuple straight from the
//! container) plus a memoized slot for the concrete id, materialized
//! through the loader on first observable use.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

pub type ModuleId = usize;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ClassId {
	pub module: ModuleId,
	pub index: usize,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct RoutineId {
	pub module: ModuleId,
	pub index: usize,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FieldId {
	pub class: ClassId,
	pub is_static: bool,
	pub index: usize,
}

/// Where a by-name reference is anchored for resolution.
#[derive(Clone, Debug)]
pub enum RefScope {
	/// Look up under a base module name (the canonical registry key).
	Base(Rc<str>),
	/// Look up from the context of a named module and its imports.
	Context(Rc<str>),
	/// Look up across every loaded base (core runtime classes).
	Global,
}

#[derive(Clone, Debug)]
pub enum ClassSlot {
	/// No class at all (the superclass of the root class).
	Missing,
	/// Raw `(mod_byte, class_byte)` tuple, not yet resolved.
	Raw(u8, u8),
	/// Sentinel for an out-of-range or unresolvable class id.
	Bad(u8, u8),
	/// Symbolic name, with the concrete id memoized once known.
	Named { scope: RefScope, name: Rc<str>, id: Option<ClassId> },
}

/// Shared, interior-mutable class reference. Resolution rewrites the slot
/// in place, so every clone of the handle observes the resolved target.
#[derive(Clone, Debug)]
pub struct ClassRef(Rc<RefCell<ClassSlot>>);

impl ClassRef {
	pub fn missing() -> Self {
		Self(Rc::new(RefCell::new(ClassSlot::Missing)))
	}

	pub fn raw(mod_byte: u8, class_byte: u8) -> Self {
		if (mod_byte, class_byte) == (255, 255) {
			return Self::missing();
		}
		Self(Rc::new(RefCell::new(ClassSlot::Raw(mod_byte, class_byte))))
	}

	pub fn bad(mod_byte: u8, class_byte: u8) -> Self {
		Self(Rc::new(RefCell::new(ClassSlot::Bad(mod_byte, class_byte))))
	}

	pub fn named(scope: RefScope, name: impl Into<Rc<str>>) -> Self {
		Self(Rc::new(RefCell::new(ClassSlot::Named { scope, name: name.into(), id: None })))
	}

	pub fn resolved(id: ClassId, name: impl Into<Rc<str>>) -> Self {
		Self(Rc::new(RefCell::new(ClassSlot::Named {
			scope: RefScope::Global,
			name: name.into(),
			id: Some(id),
		})))
	}

	pub fn slot(&self) -> ClassSlot {
		self.0.borrow().clone()
	}

	pub fn set(&self, slot: ClassSlot) {
		*self.0.borrow_mut() = slot;
	}

	/// Memoize the concrete id (and the authoritative name) on this handle.
	pub fn memoize(&self, id: ClassId, name: Rc<str>) {
		*self.0.borrow_mut() = ClassSlot::Named { scope: RefScope::Global, name, id: Some(id) };
	}

	pub fn is_missing(&self) -> bool {
		matches!(&*self.0.borrow(), ClassSlot::Missing)
	}

	pub fn is_bad(&self) -> bool {
		matches!(&*self.0.borrow(), ClassSlot::Bad(..))
	}

	pub fn id(&self) -> Option<ClassId> {
		match &*self.0.borrow() {
			ClassSlot::Named { id, .. } => *id,
			_ => None,
		}
	}

	/// The class name in slash form, if the reference carries one.
	pub fn name(&self) -> Option<Rc<str>> {
		match &*self.0.borrow() {
			ClassSlot::Named { name, .. } => Some(name.clone()),
			_ => None,
		}
	}

	/// JTS object descriptor (`Lpkg/Cls;`), if the name is known.
	pub fn jts(&self) -> Option<String> {
		self.name().map(|name| format!("L{name};"))
	}
}

impl Display for ClassRef {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match &*self.0.borrow() {
			ClassSlot::Missing => write!(f, "None"),
			ClassSlot::Raw(m, c) => write!(f, "class({m}:{c})"),
			ClassSlot::Bad(m, c) => write!(f, "ERROR(bad_class[{m}:{c}])"),
			ClassSlot::Named { name, .. } => write!(f, "{name}"),
		}
	}
}

impl PartialEq for ClassRef {
	fn eq(&self, other: &Self) -> bool {
		if Rc::ptr_eq(&self.0, &other.0) {
			return true;
		}
		self.to_string() == other.to_string()
	}
}

impl Eq for ClassRef {}

/// Lazy routine reference: full JTS signature plus a memoized id.
#[derive(Clone, Debug)]
pub struct MethodRef(Rc<MethodRefInner>);

#[derive(Debug)]
struct MethodRefInner {
	scope: RefCell<RefScope>,
	sig: RefCell<Rc<str>>,
	id: Cell<Option<RoutineId>>,
}

impl MethodRef {
	pub fn named(scope: RefScope, sig: impl Into<Rc<str>>) -> Self {
		Self(Rc::new(MethodRefInner {
			scope: RefCell::new(scope),
			sig: RefCell::new(sig.into()),
			id: Cell::new(None),
		}))
	}

	pub fn resolved(id: RoutineId, sig: impl Into<Rc<str>>) -> Self {
		let this = Self::named(RefScope::Global, sig);
		this.0.id.set(Some(id));
		this
	}

	pub fn scope(&self) -> RefScope {
		self.0.scope.borrow().clone()
	}

	pub fn sig(&self) -> Rc<str> {
		self.0.sig.borrow().clone()
	}

	pub fn id(&self) -> Option<RoutineId> {
		self.0.id.get()
	}

	pub fn memoize(&self, id: RoutineId) {
		self.0.id.set(Some(id));
	}
}

impl Display for MethodRef {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.sig.borrow())
	}
}

impl PartialEq for MethodRef {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.0, &other.0) || *self.0.sig.borrow() == *other.0.sig.borrow()
	}
}

impl Eq for MethodRef {}

/// Lazy field reference: `Cls/field` path plus a memoized id.
#[derive(Clone, Debug)]
pub struct FieldRef(Rc<FieldRefInner>);

#[derive(Debug)]
struct FieldRefInner {
	scope: RefCell<RefScope>,
	path: RefCell<Rc<str>>,
	id: Cell<Option<FieldId>>,
}

impl FieldRef {
	pub fn named(scope: RefScope, path: impl Into<Rc<str>>) -> Self {
		Self(Rc::new(FieldRefInner {
			scope: RefCell::new(scope),
			path: RefCell::new(path.into()),
			id: Cell::new(None),
		}))
	}

	pub fn resolved(id: FieldId, path: impl Into<Rc<str>>) -> Self {
		let this = Self::named(RefScope::Global, path);
		this.0.id.set(Some(id));
		this
	}

	pub fn scope(&self) -> RefScope {
		self.0.scope.borrow().clone()
	}

	pub fn path(&self) -> Rc<str> {
		self.0.path.borrow().clone()
	}

	pub fn id(&self) -> Option<FieldId> {
		self.0.id.get()
	}

	pub fn memoize(&self, id: FieldId) {
		self.0.id.set(Some(id));
	}
}

impl Display for FieldRef {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.path.borrow())
	}
}

impl PartialEq for FieldRef {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.0, &other.0) || *self.0.path.borrow() == *other.0.path.borrow()
	}
}

impl Eq for FieldRef {}

/// Import-table entry: module name plus a memoized id.
#[derive(Clone, Debug)]
pub struct ModuleHandle {
	pub name: Rc<str>,
	id: Cell<Option<ModuleId>>,
}

impl ModuleHandle {
	pub fn new(name: impl Into<Rc<str>>) -> Self {
		Self { name: name.into(), id: Cell::new(None) }
	}

	pub fn id(&self) -> Option<ModuleId> {
		self.id.get()
	}

	pub fn memoize(&self, id: ModuleId) {
		self.id.set(Some(id));
	}
}
