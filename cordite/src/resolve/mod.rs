//! The multi-module resolver and loader.
//!
//! Modules load into a process-wide `Loader` that owns every node and
//! keeps the registries symbolic references resolve through. Lifecycle is
//! `parsed -> resolved -> actualized -> disassembled`, monotonic and
//! idempotent per module.

pub mod cache;
pub mod class;
pub mod compare;
pub mod loader;
pub mod module;
pub mod namedb;
pub mod refs;
pub mod routine;

pub use class::{ClassAttrs, ClassDef, FieldAttrs, FieldDef, MemberId};
pub use compare::Incomparable;
pub use loader::{quick_module_names, Loader, LoaderOptions};
pub use module::{
	EntryPoint, ExportedItem, FixupTarget, InterfaceMethodRef, Module, ModuleAttrs, Signature,
};
pub use namedb::NameDb;
pub use refs::{ClassId, ClassRef, FieldId, FieldRef, MethodRef, ModuleId, RefScope, RoutineId};
pub use routine::{ExHandler, RoutineAttrs, RoutineDef, StackMapEntry};
