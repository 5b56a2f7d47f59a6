//! The on-disk module cache.
//!
//! A cache root is a directory or a read-only zip archive. Each module
//! gets one index blob (`<name>.cod.db`) naming its classes and routines
//! by JTS, and one blob per class (`<base>/<class_jts>.cache`) carrying
//! full member bodies with every cross-module reference flattened to a
//! `(base module name, jts)` pair. Deserialization rebuilds lazy handles
//! from those pairs; serialize-deserialize-serialize is a fix point.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use fxhash::FxHashMap;
use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zip::ZipArchive;

use crate::disasm::{Instruction, Opcode, Operand};
use crate::errors::LoadError;
use crate::resolve::class::{ClassAttrs, ClassDef, FieldAttrs, FieldDef};
use crate::resolve::loader::Loader;
use crate::resolve::module::{DataPool, Module, ModuleAttrs};
use crate::resolve::refs::{
	ClassId, ClassRef, FieldRef, MethodRef, ModuleHandle, ModuleId, RefScope, RoutineId,
};
use crate::resolve::routine::{ExHandler, RoutineAttrs, RoutineDef, StackMapEntry};
use crate::types::{TypeList, TypeToken};

pub enum CacheRoot {
	Dir(PathBuf),
	Zip(PathBuf, RefCell<ZipArchive<File>>),
}

impl std::fmt::Debug for CacheRoot {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Dir(path) => write!(f, "CacheRoot::Dir({})", path.display()),
			Self::Zip(path, _) => write!(f, "CacheRoot::Zip({})", path.display()),
		}
	}
}

fn cache_err(path: &Path, reason: impl ToString) -> LoadError {
	LoadError::Cache { path: path.display().to_string(), reason: reason.to_string() }
}

impl CacheRoot {
	/// Open a cache root. Existing files are sniffed as zip archives;
	/// anything else is a directory (created on first write).
	pub fn open(path: PathBuf) -> Result<Self, LoadError> {
		if path.is_file() {
			let file = File::open(&path).map_err(|e| cache_err(&path, e))?;
			let archive = ZipArchive::new(file).map_err(|e| cache_err(&path, e))?;
			return Ok(Self::Zip(path, RefCell::new(archive)));
		}
		Ok(Self::Dir(path))
	}

	pub fn is_writable(&self) -> bool {
		matches!(self, Self::Dir(_))
	}

	/// Names (without the `.cod.db` suffix) of every cached module index
	/// at the top level of the root.
	pub fn list_module_dbs(&self) -> Result<Vec<String>, LoadError> {
		match self {
			Self::Dir(root) => {
				let mut names = Vec::new();
				if !root.is_dir() {
					return Ok(names);
				}
				for entry in std::fs::read_dir(root)? {
					let entry = entry?;
					if !entry.path().is_file() {
						continue;
					}
					let name = entry.file_name().to_string_lossy().to_string();
					if let Some(stem) = name.strip_suffix(".cod.db") {
						names.push(stem.to_string());
					}
				}
				Ok(names)
			}
			Self::Zip(_, archive) => {
				let archive = archive.borrow();
				Ok(archive
					.file_names()
					.filter(|n| !n.contains('/'))
					.filter_map(|n| n.strip_suffix(".cod.db"))
					.map(str::to_string)
					.collect())
			}
		}
	}

	pub fn can_read(&self, rel_path: &str) -> bool {
		match self {
			Self::Dir(root) => root.join(rel_path).is_file(),
			Self::Zip(_, archive) => archive.borrow().file_names().any(|n| n == rel_path),
		}
	}

	pub fn read(&self, rel_path: &str) -> Result<Vec<u8>, LoadError> {
		match self {
			Self::Dir(root) => {
				let path = root.join(rel_path);
				Ok(std::fs::read(&path).map_err(|e| cache_err(&path, e))?)
			}
			Self::Zip(path, archive) => {
				let mut archive = archive.borrow_mut();
				let mut entry =
					archive.by_name(rel_path).map_err(|e| cache_err(path, e))?;
				let mut bytes = Vec::with_capacity(entry.size() as usize);
				entry.read_to_end(&mut bytes).map_err(|e| cache_err(path, e))?;
				Ok(bytes)
			}
		}
	}

	pub fn write(&self, rel_path: &str, bytes: &[u8]) -> Result<(), LoadError> {
		match self {
			Self::Dir(root) => {
				let path = root.join(rel_path);
				if let Some(parent) = path.parent() {
					std::fs::create_dir_all(parent).map_err(|e| cache_err(&path, e))?;
				}
				std::fs::write(&path, bytes).map_err(|e| cache_err(&path, e))?;
				Ok(())
			}
			Self::Zip(path, _) => Err(cache_err(path, "zip cache roots are read-only")),
		}
	}
}

// Serialized blob layouts. Cross-references are `(base module name, jts)`
// pairs throughout so deserialization can rebuild lazy handles.

#[derive(Serialize, Deserialize)]
struct ModuleBlob {
	name: String,
	version: String,
	timestamp: u32,
	attrs: u8,
	siblings: Vec<String>,
	aliases: Vec<String>,
	imports: Vec<String>,
	import_versions: Vec<String>,
	exports: Vec<(String, Vec<u8>)>,
	statics: Vec<(u16, i32)>,
	entry_points: Vec<(String, String, u16)>,
	signatures: Vec<(u16, String, Vec<u8>)>,
	classes: Vec<String>,
	routines: Vec<(u32, String)>,
}

#[derive(Serialize, Deserialize)]
struct FieldBlob {
	attrs: u8,
	ty: String,
	name: String,
	address: Option<u16>,
}

#[derive(Serialize, Deserialize)]
struct HandlerBlob {
	class: Option<(String, String)>,
	scope: (u32, u32),
	target: u32,
}

#[derive(Serialize, Deserialize)]
enum OpBlob {
	Int(i64),
	Lit(String),
	Class(Option<String>, String),
	Field(Option<String>, String),
	Method(Option<String>, String),
	FieldSlot(i64),
	VirtualSlot(i64),
	Call(u8, Option<u8>, u16),
	Type(String),
	Prim(u8),
	Branch(u32),
	Targets(Vec<i16>),
	Pairs(Vec<(i32, i16)>),
	Ints(Vec<i64>),
	Reals(Vec<f64>),
	Strs(Vec<String>),
	Bad(String),
}

#[derive(Serialize, Deserialize)]
struct InstrBlob {
	offset: u32,
	opcode: u16,
	ops: Vec<OpBlob>,
	totos: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct MethodBlob {
	name: String,
	offset: u32,
	attrs: u16,
	limits: (u16, u16, u16),
	param_types: String,
	return_type: String,
	stack_map: Vec<(u16, String)>,
	instructions: Vec<InstrBlob>,
	handlers: Vec<HandlerBlob>,
}

#[derive(Serialize, Deserialize)]
struct ClassBlob {
	module: String,
	name: String,
	attrs: u16,
	superclass: Option<(String, String)>,
	ifaces: Vec<(String, String)>,
	fields: Vec<FieldBlob>,
	static_fields: Vec<FieldBlob>,
	virtual_methods: Vec<MethodBlob>,
	nonvirtual_methods: Vec<MethodBlob>,
	static_methods: Vec<MethodBlob>,
	vft: Vec<(String, String)>,
	fft: Vec<(String, String)>,
}

/// Read just the name and aliases from a cached module index.
pub fn peek_module_names(cache: &CacheRoot, cached_name: &str) -> Result<Vec<String>, LoadError> {
	let bytes = cache.read(&format!("{cached_name}.cod.db"))?;
	let blob: ModuleBlob = serde_json::from_slice(&bytes)
		.map_err(|e| LoadError::Cache { path: cached_name.to_string(), reason: e.to_string() })?;
	let mut names = vec![blob.name];
	names.extend(blob.aliases);
	Ok(names)
}

fn scope_base(scope: &RefScope) -> String {
	match scope {
		RefScope::Base(base) => base.to_string(),
		_ => String::new(),
	}
}

fn class_pair(class: &ClassRef, loader: &Loader) -> Option<(String, String)> {
	let name = class.name()?;
	let base = match class.id() {
		Some(cid) => loader.module(cid.module).base_name().to_string(),
		None => match class.slot() {
			crate::resolve::refs::ClassSlot::Named { scope, .. } => scope_base(&scope),
			_ => String::new(),
		},
	};
	Some((base, name.to_string()))
}

fn method_pair(method: &MethodRef, loader: &Loader) -> (String, String) {
	let base = match method.id() {
		Some(rid) => loader.module(rid.module).base_name().to_string(),
		None => scope_base(&method.scope()),
	};
	(base, method.sig().to_string())
}

fn field_pair(field: &FieldRef, loader: &Loader) -> (String, String) {
	let base = match field.id() {
		Some(fid) => loader.module(fid.class.module).base_name().to_string(),
		None => scope_base(&field.scope()),
	};
	(base, field.path().to_string())
}

fn operand_blob(operand: &Operand, loader: &Loader) -> OpBlob {
	match operand {
		Operand::Int(v) => OpBlob::Int(*v),
		Operand::Lit(s) => OpBlob::Lit(s.to_string()),
		Operand::Class(c) => {
			let (base, name) = class_pair(c, loader).unwrap_or_default();
			OpBlob::Class(Some(base).filter(|b| !b.is_empty()), name)
		}
		Operand::Field(x) => {
			let (base, path) = field_pair(x, loader);
			OpBlob::Field(Some(base).filter(|b| !b.is_empty()), path)
		}
		Operand::Method(m) => {
			let (base, sig) = method_pair(m, loader);
			OpBlob::Method(Some(base).filter(|b| !b.is_empty()), sig)
		}
		Operand::FieldSlot(v) => OpBlob::FieldSlot(*v),
		Operand::VirtualSlot(v) => OpBlob::VirtualSlot(*v),
		Operand::CallRef { mod_byte, class_byte, word } => OpBlob::Call(*mod_byte, *class_byte, *word),
		Operand::Type(t) => OpBlob::Type(t.to_jts()),
		Operand::PrimType(p) => OpBlob::Prim(*p as u8),
		Operand::Branch(o) => OpBlob::Branch(*o),
		Operand::Targets(ts) => OpBlob::Targets(ts.to_vec()),
		Operand::Pairs(ps) => OpBlob::Pairs(ps.to_vec()),
		Operand::Ints(vs) => OpBlob::Ints(vs.to_vec()),
		Operand::Reals(vs) => OpBlob::Reals(vs.to_vec()),
		Operand::Strs(vs) => OpBlob::Strs(vs.iter().map(|s| s.to_string()).collect()),
		Operand::Bad(msg) => OpBlob::Bad(msg.to_string()),
	}
}

fn blob_operand(blob: &OpBlob, scope: &RefScope) -> Operand {
	let anchored = |base: &Option<String>| match base {
		Some(base) if !base.is_empty() => RefScope::Base(base.as_str().into()),
		_ => scope.clone(),
	};
	match blob {
		OpBlob::Int(v) => Operand::Int(*v),
		OpBlob::Lit(s) => Operand::Lit(s.as_str().into()),
		OpBlob::Class(base, name) => Operand::Class(ClassRef::named(anchored(base), name.as_str())),
		OpBlob::Field(base, path) => Operand::Field(FieldRef::named(anchored(base), path.as_str())),
		OpBlob::Method(base, sig) => Operand::Method(MethodRef::named(anchored(base), sig.as_str())),
		OpBlob::FieldSlot(v) => Operand::FieldSlot(*v),
		OpBlob::VirtualSlot(v) => Operand::VirtualSlot(*v),
		OpBlob::Call(mod_byte, class_byte, word) => {
			Operand::CallRef { mod_byte: *mod_byte, class_byte: *class_byte, word: *word }
		}
		OpBlob::Type(jts) => Operand::Type(
			TypeToken::from_jts(jts, scope).unwrap_or(TypeToken::Wildcard),
		),
		OpBlob::Prim(code) => crate::types::PrimKind::from_repr(*code)
			.map(Operand::PrimType)
			.unwrap_or(Operand::Bad("bad primitive code".into())),
		OpBlob::Branch(o) => Operand::Branch(*o),
		OpBlob::Targets(ts) => Operand::Targets(ts.clone().into()),
		OpBlob::Pairs(ps) => Operand::Pairs(ps.clone().into()),
		OpBlob::Ints(vs) => Operand::Ints(vs.clone().into()),
		OpBlob::Reals(vs) => Operand::Reals(vs.clone().into()),
		OpBlob::Strs(vs) => Operand::Strs(vs.iter().map(|s| s.as_str().into()).collect()),
		OpBlob::Bad(msg) => Operand::Bad(msg.as_str().into()),
	}
}

fn method_blob(loader: &Loader, routine: &RoutineDef) -> MethodBlob {
	MethodBlob {
		name: routine.name.to_string(),
		offset: routine.offset,
		attrs: routine.attrs.bits(),
		limits: (routine.max_stack, routine.max_locals, routine.stack_size),
		param_types: routine.param_types.to_jts(),
		return_type: routine.return_type.to_jts(),
		stack_map: routine.stack_map.iter().map(|e| (e.label, e.types.to_jts())).collect(),
		instructions: routine
			.instructions
			.borrow()
			.iter()
			.map(|instr| InstrBlob {
				offset: instr.offset,
				opcode: instr.opcode as u16,
				ops: instr.operands.iter().map(|op| operand_blob(op, loader)).collect(),
				totos: instr.totos.as_ref().map(TypeToken::to_jts),
			})
			.collect(),
		handlers: routine
			.handlers
			.borrow()
			.iter()
			.map(|h| HandlerBlob {
				class: match h.is_finally() {
					true => None,
					false => class_pair(&h.class, loader),
				},
				scope: h.scope,
				target: h.target,
			})
			.collect(),
	}
}

/// Serialize a resolved, actualized, disassembled module into the cache.
pub fn save_module(loader: &Loader, id: ModuleId) -> Result<(), LoadError> {
	let cache = loader
		.cache
		.as_ref()
		.ok_or_else(|| LoadError::Cache { path: String::new(), reason: "no cache root".into() })?;
	let module = loader.module(id);
	let base = module.base_name().to_string();

	let blob = ModuleBlob {
		name: module.name.clone(),
		version: module.version.clone(),
		timestamp: module.timestamp,
		attrs: module.attrs.bits(),
		siblings: module.siblings.clone(),
		aliases: module.aliases.clone(),
		imports: module.imports.iter().map(|i| i.name.to_string()).collect(),
		import_versions: module.import_versions.clone(),
		exports: module.exports.iter().map(|x| (x.name.to_string(), x.value.clone())).collect(),
		statics: module.statics.clone(),
		entry_points: module
			.entry_points
			.iter()
			.map(|ep| (ep.name.to_string(), ep.param_types.to_jts(), ep.offset))
			.collect(),
		signatures: module.signatures.iter().map(|s| (s.kind, s.tag.clone(), s.data.clone())).collect(),
		classes: module.classes.iter().map(|c| c.name.to_string()).collect(),
		routines: module
			.routines
			.iter()
			.map(|r| {
				let class_name = r
					.parent
					.map(|cid| loader.class_name(cid).to_string())
					.unwrap_or_default();
				(r.offset, r.jts(&class_name, false))
			})
			.collect(),
	};
	let bytes = serde_json::to_vec(&blob)
		.map_err(|e| LoadError::Cache { path: module.name.clone(), reason: e.to_string() })?;
	cache.write(&format!("{}.cod.db", module.name), &bytes)?;

	for class in &module.classes {
		let blob = ClassBlob {
			module: module.name.clone(),
			name: class.name.to_string(),
			attrs: class.attrs.bits(),
			superclass: class_pair(&class.superclass, loader),
			ifaces: class.ifaces.iter().filter_map(|i| class_pair(i, loader)).collect(),
			fields: class
				.fields
				.iter()
				.map(|f| FieldBlob {
					attrs: f.attrs.bits(),
					ty: f.ty.to_jts(),
					name: f.name.to_string(),
					address: f.address,
				})
				.collect(),
			static_fields: class
				.static_fields
				.iter()
				.map(|f| FieldBlob {
					attrs: f.attrs.bits(),
					ty: f.ty.to_jts(),
					name: f.name.to_string(),
					address: f.address,
				})
				.collect(),
			virtual_methods: class
				.virtual_methods
				.iter()
				.map(|r| method_blob(loader, &module.routines[*r]))
				.collect(),
			nonvirtual_methods: class
				.nonvirtual_methods
				.iter()
				.map(|r| method_blob(loader, &module.routines[*r]))
				.collect(),
			static_methods: class
				.static_methods
				.iter()
				.map(|r| method_blob(loader, &module.routines[*r]))
				.collect(),
			vft: class.vft.borrow().iter().map(|m| method_pair(m, loader)).collect(),
			fft: class.fft.borrow().iter().map(|f| field_pair(f, loader)).collect(),
		};
		let bytes = serde_json::to_vec(&blob)
			.map_err(|e| LoadError::Cache { path: class.name.to_string(), reason: e.to_string() })?;
		cache.write(&format!("{base}/{}.cache", class.name), &bytes)?;
	}
	Ok(())
}

/// Deserialize a cached module (index plus all of its class blobs) and
/// register it. Cross-module references come back as lazy handles.
pub fn load_module(loader: &mut Loader, cached_name: &str) -> Result<ModuleId, LoadError> {
	let cache = loader
		.cache
		.as_ref()
		.ok_or_else(|| LoadError::Cache { path: String::new(), reason: "no cache root".into() })?;
	let bytes = cache.read(&format!("{cached_name}.cod.db"))?;
	let blob: ModuleBlob = serde_json::from_slice(&bytes)
		.map_err(|e| LoadError::Cache { path: cached_name.to_string(), reason: e.to_string() })?;

	let base: String = blob.siblings.first().cloned().unwrap_or_else(|| blob.name.clone());
	let base_scope = RefScope::Base(base.as_str().into());
	let id = loader.next_module_id();

	let mut class_blobs = Vec::with_capacity(blob.classes.len());
	for class_name in &blob.classes {
		let bytes = cache.read(&format!("{base}/{class_name}.cache"))?;
		let class_blob: ClassBlob = serde_json::from_slice(&bytes)
			.map_err(|e| LoadError::Cache { path: class_name.clone(), reason: e.to_string() })?;
		class_blobs.push(class_blob);
	}

	let pair_ref = |pair: &Option<(String, String)>| match pair {
		None => ClassRef::missing(),
		Some((pair_base, jts)) => {
			let scope = match pair_base.is_empty() {
				true => base_scope.clone(),
				false => RefScope::Base(pair_base.as_str().into()),
			};
			ClassRef::named(scope, jts.as_str())
		}
	};
	let parse_tlist = |jts: &str| -> Result<TypeList, LoadError> {
		TypeList::from_jts(jts, &base_scope).map_err(LoadError::BadReference)
	};

	let mut routines: Vec<RoutineDef> = Vec::new();
	let mut classes: Vec<ClassDef> = Vec::new();
	for (class_index, class_blob) in class_blobs.iter().enumerate() {
		let class_id = ClassId { module: id, index: class_index };

		let make_fields = |blobs: &[FieldBlob]| -> Result<Vec<FieldDef>, LoadError> {
			blobs
				.iter()
				.map(|f| {
					Ok(FieldDef {
						name: f.name.as_str().into(),
						ty: parse_tlist(&f.ty)?,
						attrs: FieldAttrs::from_bits_truncate(f.attrs),
						address: f.address,
					})
				})
				.collect()
		};

		let mut claim = |blobs: &[MethodBlob]| -> Result<Vec<usize>, LoadError> {
			let mut indexes = Vec::with_capacity(blobs.len());
			for method in blobs {
				let index = routines.len();
				let instructions = method
					.instructions
					.iter()
					.map(|instr| {
						Ok(Instruction {
							offset: instr.offset,
							opcode: Opcode::from_repr(instr.opcode).ok_or_else(|| {
								LoadError::Cache {
									path: class_blob.name.clone(),
									reason: format!("bad opcode ordinal {}", instr.opcode),
								}
							})?,
							operands: instr.ops.iter().map(|op| blob_operand(op, &base_scope)).collect(),
							totos: instr
								.totos
								.as_ref()
								.map(|jts| TypeToken::from_jts(jts, &base_scope))
								.transpose()
								.map_err(LoadError::BadReference)?,
						})
					})
					.collect::<Result<Vec<_>, LoadError>>()?;
				let handlers = method
					.handlers
					.iter()
					.map(|h| ExHandler {
						scope: h.scope,
						target: h.target,
						class: pair_ref(&h.class),
					})
					.collect();
				let stack_map = method
					.stack_map
					.iter()
					.map(|(label, jts)| Ok(StackMapEntry { label: *label, types: parse_tlist(jts)? }))
					.collect::<Result<Vec<_>, LoadError>>()?;

				routines.push(RoutineDef {
					id: RoutineId { module: id, index },
					parent: Some(class_id),
					offset: method.offset,
					name: method.name.as_str().into(),
					param_types: parse_tlist(&method.param_types)?,
					return_type: parse_tlist(&method.return_type)?,
					attrs: RoutineAttrs::from_bits_truncate(method.attrs),
					max_stack: method.limits.0,
					max_locals: method.limits.1,
					stack_size: method.limits.2,
					stack_map,
					code: Vec::new(),
					raw_handlers: RefCell::new(Vec::new()),
					handlers: RefCell::new(handlers),
					instructions: RefCell::new(instructions),
					resolved: Cell::new(true),
					disasmed: Cell::new(true),
				});
				indexes.push(index);
			}
			Ok(indexes)
		};

		let virtual_methods = claim(&class_blob.virtual_methods)?;
		let nonvirtual_methods = claim(&class_blob.nonvirtual_methods)?;
		let static_methods = claim(&class_blob.static_methods)?;

		let static_fields = make_fields(&class_blob.static_fields)?;
		let static_address_map = static_fields
			.iter()
			.enumerate()
			.filter_map(|(i, f)| f.address.map(|a| (a, i)))
			.collect();

		let vft = class_blob
			.vft
			.iter()
			.map(|(b, sig)| {
				let scope = match b.is_empty() {
					true => base_scope.clone(),
					false => RefScope::Base(b.as_str().into()),
				};
				MethodRef::named(scope, sig.as_str())
			})
			.collect();
		let fft = class_blob
			.fft
			.iter()
			.map(|(b, path)| {
				let scope = match b.is_empty() {
					true => base_scope.clone(),
					false => RefScope::Base(b.as_str().into()),
				};
				FieldRef::named(scope, path.as_str())
			})
			.collect();

		let package = class_blob.name.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
		classes.push(ClassDef {
			id: class_id,
			package: package.into(),
			name: class_blob.name.as_str().into(),
			attrs: ClassAttrs::from_bits_truncate(class_blob.attrs),
			superclass: pair_ref(&class_blob.superclass),
			ifaces: class_blob.ifaces.iter().map(|p| pair_ref(&Some(p.clone()))).collect(),
			fields: make_fields(&class_blob.fields)?,
			static_fields,
			virtual_methods,
			nonvirtual_methods,
			static_methods,
			static_address_map,
			vft: RefCell::new(vft),
			fft: RefCell::new(fft),
			field_members: RefCell::new(None),
			method_members: RefCell::new(None),
			resolved: Cell::new(true),
			actualized: Cell::new(true),
			actualizing: Cell::new(false),
		});
	}

	let routine_by_offset: FxHashMap<u32, usize> =
		routines.iter().enumerate().map(|(i, r)| (r.offset, i)).collect();

	debug!("reconstructed module '{}' from cache ({} classes)", blob.name, classes.len());

	let module = Module {
		id,
		name: blob.name,
		version: blob.version,
		timestamp: blob.timestamp,
		attrs: ModuleAttrs::from_bits_truncate(blob.attrs),
		disk: true,
		siblings: blob.siblings,
		aliases: blob.aliases,
		imports: blob.imports.iter().map(|n| ModuleHandle::new(n.as_str())).collect(),
		import_versions: blob.import_versions,
		exports: blob
			.exports
			.into_iter()
			.map(|(name, value)| crate::resolve::module::ExportedItem { name: name.into(), value })
			.collect(),
		statics: blob.statics,
		entry_points: blob
			.entry_points
			.into_iter()
			.map(|(name, params, offset)| {
				Ok(crate::resolve::module::EntryPoint {
					name: name.into(),
					param_types: parse_tlist(&params)?,
					offset,
				})
			})
			.collect::<Result<Vec<_>, LoadError>>()?,
		signatures: blob
			.signatures
			.into_iter()
			.map(|(kind, tag, data)| crate::resolve::module::Signature { kind, tag, data })
			.collect(),
		classes,
		routines,
		routine_by_offset,
		iface_mrefs: Vec::new(),
		class_refs: Vec::new(),
		iface_mref_map: IntMap::default(),
		crem: FxHashMap::default(),
		mod_remap: RefCell::new(FxHashMap::default()),
		field_fixups: Vec::new(),
		static_field_fixups: Vec::new(),
		method_fixups: Vec::new(),
		virtual_method_fixups: Vec::new(),
		static_method_fixups: Vec::new(),
		class_ref_fixups: Vec::new(),
		mod_ref_fixups: Vec::new(),
		fixup_map: RefCell::new(IntMap::default()),
		pool: DataPool::new(Vec::new()),
		resolved: Cell::new(true),
		actualized: Cell::new(true),
		disasmed: Cell::new(true),
	};

	Ok(loader.register(module).id)
}
