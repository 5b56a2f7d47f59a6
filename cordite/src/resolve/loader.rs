//! The process-wide module loader and symbol resolver.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use fxhash::{FxHashMap, FxHashSet};
use rust_search::SearchBuilder;
use tracing::{info, warn};

use crate::errors::LoadError;
use crate::ident::unescape;
use crate::raw::RawCod;
use crate::reader::Reader;
use crate::resolve::cache::CacheRoot;
use crate::resolve::class::{ClassDef, MemberId};
use crate::resolve::module::{FixupEntry, FixupSource, FixupTarget, Module};
use crate::resolve::namedb::NameDb;
use crate::resolve::refs::{
	ClassId, ClassRef, ClassSlot, FieldId, FieldRef, MethodRef, ModuleId, RefScope, RoutineId,
};
use crate::types::{ArrayElem, TypeList, TypeToken};

#[derive(Debug, Clone)]
pub struct LoaderOptions {
	pub search_paths: Vec<PathBuf>,
	pub cache_root: Option<PathBuf>,
	pub name_db: Option<PathBuf>,
	pub auto_resolve: bool,
}

impl Default for LoaderOptions {
	fn default() -> Self {
		Self { search_paths: Vec::new(), cache_root: None, name_db: None, auto_resolve: true }
	}
}

/// Owns every loaded module and all the registries that make symbolic
/// references resolvable. Everything registered stays shared (`Rc`);
/// post-registration mutation happens through interior-mutable fields on
/// the nodes themselves.
pub struct Loader {
	pub auto_resolve: bool,
	search_paths: Vec<PathBuf>,
	pub(crate) cache: Option<CacheRoot>,
	pub(crate) name_db: Option<NameDb>,
	modules: Vec<Option<Rc<Module>>>,
	/// Module name (and every alias) to module id.
	names: FxHashMap<String, ModuleId>,
	/// Module name to its base module name (first sibling).
	base_names: FxHashMap<String, String>,
	/// `(base module name, class jts)` to the authoritative class.
	classes: FxHashMap<String, FxHashMap<String, ClassId>>,
	/// Embedded module name to the file that provides it.
	path_index: FxHashMap<String, PathBuf>,
	/// Embedded module name to the cache blob that provides it.
	cache_index: FxHashMap<String, String>,
}

/// Strip directories and a `.cod`/`.cod.db` suffix from a module path.
fn module_stem(name: &str) -> &str {
	let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
	name.strip_suffix(".cod.db").or_else(|| name.strip_suffix(".cod")).unwrap_or(name)
}

/// Pull the embedded module name and aliases out of a module file without
/// a full parse, for search-path indexing.
pub fn quick_module_names(bytes: &[u8]) -> Result<Vec<String>, LoadError> {
	let mut reader = Reader::new(bytes);
	let code_size = reader.seek(38).u16()? as usize;
	let ds = 44 + code_size;

	reader.seek(ds + 4);
	let _num_mods = reader.u8()?;
	let num_classes = reader.u8()? as usize;
	let off_exports = reader.seek(ds + 6).u16()? as usize;
	let off_aliases = reader.seek(ds + 28).u16()? as usize;
	let mod_offset = reader.seek(ds + 52 + 2 * num_classes).u16()? as usize;

	let num_aliases = off_exports.saturating_sub(off_aliases) / 2;
	reader.seek(ds + off_aliases);
	let alias_offsets = reader.array_fixed(num_aliases, |r| r.u16())?;

	let read_name = |offset: usize| -> Result<String, LoadError> {
		let raw = reader.cstr_at(ds + offset)?;
		Ok(unescape(&raw.iter().map(|b| *b as char).collect::<String>()))
	};
	let mut names = vec![read_name(mod_offset)?];
	for off in alias_offsets {
		names.push(read_name(off as usize)?);
	}
	Ok(names)
}

impl Loader {
	pub fn new(options: LoaderOptions) -> Result<Self, LoadError> {
		let mut search_paths = options.search_paths;
		if search_paths.is_empty() {
			search_paths.push(PathBuf::from("."));
		}

		let cache = options.cache_root.map(CacheRoot::open).transpose()?;
		let name_db = options.name_db.map(NameDb::open).transpose()?;

		let mut loader = Self {
			auto_resolve: options.auto_resolve,
			search_paths,
			cache,
			name_db,
			modules: Vec::new(),
			names: FxHashMap::default(),
			base_names: FxHashMap::default(),
			classes: FxHashMap::default(),
			path_index: FxHashMap::default(),
			cache_index: FxHashMap::default(),
		};
		loader.scan_search_paths();
		loader.scan_cache_root()?;
		Ok(loader)
	}

	pub fn add_search_path(&mut self, path: PathBuf) {
		self.search_paths.push(path);
		self.scan_search_paths();
	}

	/// Index every `.cod` under the search paths. Later paths lose to
	/// earlier ones; embedded names are authoritative over file stems.
	fn scan_search_paths(&mut self) {
		for search_path in self.search_paths.clone().iter().rev() {
			let found: Vec<String> = SearchBuilder::default()
				.location(search_path)
				.depth(usize::MAX)
				.ext("cod")
				.build()
				.collect();
			for entry in found {
				let path = PathBuf::from(&entry);
				if !path.is_file() {
					continue;
				}
				let stem = module_stem(&entry).to_string();
				self.path_index.entry(stem).or_insert_with(|| path.clone());
				match std::fs::read(&path).map_err(LoadError::from).and_then(|b| quick_module_names(&b)) {
					Ok(names) => {
						for name in names {
							self.path_index.insert(name, path.clone());
						}
					}
					Err(err) => warn!("skipping unreadable module file '{entry}': {err}"),
				}
			}
		}
	}

	/// Index every serialized module under the cache root by its recorded
	/// name and aliases.
	fn scan_cache_root(&mut self) -> Result<(), LoadError> {
		let mut discovered: Vec<(String, Vec<String>)> = Vec::new();
		{
			let Some(cache) = &self.cache else { return Ok(()) };
			for cached_name in cache.list_module_dbs()? {
				match crate::resolve::cache::peek_module_names(cache, &cached_name) {
					Ok(names) => discovered.push((cached_name, names)),
					Err(err) => warn!("unreadable cache index for '{cached_name}': {err}"),
				}
			}
		}
		for (cached_name, names) in discovered {
			for name in names {
				self.cache_index.insert(name, cached_name.clone());
			}
		}
		Ok(())
	}

	pub fn module(&self, id: ModuleId) -> Rc<Module> {
		self.modules[id].as_ref().expect("module was evicted").clone()
	}

	pub fn loaded_modules(&self) -> impl Iterator<Item = Rc<Module>> + '_ {
		self.modules.iter().flatten().cloned()
	}

	pub fn lookup_module(&self, name: &str) -> Option<ModuleId> {
		self.names.get(module_stem(name)).copied()
	}

	pub fn base_name_of(&self, name: &str) -> Option<&str> {
		self.base_names.get(name).map(String::as_str)
	}

	/// Whether a module is reachable by name, loaded or not.
	pub fn contains(&self, name: &str) -> bool {
		let stem = module_stem(name);
		self.names.contains_key(stem)
			|| self.path_index.contains_key(stem)
			|| self.cache_index.contains_key(stem)
	}

	pub fn lookup_class(&self, base: &str, jts: &str) -> Option<ClassId> {
		self.classes.get(base)?.get(jts).copied()
	}

	pub(crate) fn next_module_id(&self) -> ModuleId {
		self.modules.len()
	}

	/// Enter a module into every index: its own name, every alias, and the
	/// base-name mapping for itself and all siblings.
	pub(crate) fn register(&mut self, module: Module) -> Rc<Module> {
		let rc = Rc::new(module);
		debug_assert_eq!(rc.id, self.modules.len());
		self.modules.push(Some(rc.clone()));

		let base = rc.base_name().to_string();
		self.names.insert(rc.name.clone(), rc.id);
		self.base_names.insert(rc.name.clone(), base.clone());
		for alias in &rc.aliases {
			self.names.insert(alias.clone(), rc.id);
			self.base_names.insert(alias.clone(), base.clone());
		}
		for sibling in &rc.siblings {
			self.base_names.insert(sibling.clone(), base.clone());
		}

		for class in &rc.classes {
			self.add_class_def(&base, class);
		}
		rc
	}

	pub(crate) fn add_class_def(&mut self, base: &str, class: &ClassDef) {
		let by_name = self.classes.entry(base.to_string()).or_default();
		if let Some(previous) = by_name.get(class.name.as_ref()) {
			warn!(
				"redefinition of class '{}' (already defined in module {})",
				class.name, previous.module
			);
		}
		by_name.insert(class.name.to_string(), class.id);
	}

	/// Drop a module from every index it was registered under.
	pub fn unload_module(&mut self, name: &str) {
		let stem = module_stem(name);
		let Some(id) = self.names.get(stem).copied() else { return };
		let Some(module) = self.modules[id].take() else { return };
		let base = module.base_name().to_string();
		self.names.remove(&module.name);
		for alias in &module.aliases {
			self.names.remove(alias);
		}
		if let Some(by_name) = self.classes.get_mut(&base) {
			by_name.retain(|_, cid| cid.module != id);
		}
	}

	/// Load a module by name: memory first, then the serialized cache,
	/// then a raw file from the search paths.
	pub fn load_module(&mut self, name: &str) -> Result<ModuleId, LoadError> {
		let stem = module_stem(name).to_string();
		if let Some(id) = self.names.get(&stem) {
			return Ok(*id);
		}

		if self.cache.is_some() {
			if let Some(cached_name) = self.cache_index.get(&stem).cloned() {
				info!("Loading module '{stem}' from disk cache");
				match crate::resolve::cache::load_module(self, &cached_name) {
					Ok(id) => return Ok(id),
					Err(err) => warn!("unable to load module '{stem}' from cache: {err}"),
				}
			}
		}

		if let Some(path) = self.path_index.get(&stem).cloned() {
			info!("Loading module '{stem}' from {}", path.display());
			return self.load_file(&path);
		}

		Err(LoadError::NotFound(stem))
	}

	/// Load a module from an explicit file path.
	pub fn load_file(&mut self, path: &Path) -> Result<ModuleId, LoadError> {
		let bytes = read_module_bytes(path)?;
		let cod = RawCod::parse(&bytes)?;
		let module = Module::from_raw(self.next_module_id(), &cod)?;
		let rc = self.register(module);
		if self.auto_resolve {
			self.resolve_module(rc.id)?;
		}
		Ok(rc.id)
	}

	/// Resolve a module: load and resolve every sibling (classes migrate
	/// between siblings across minor versions), then every import, then
	/// rewrite raw class ids throughout the module.
	pub fn resolve_module(&mut self, id: ModuleId) -> Result<(), LoadError> {
		let module = self.module(id);
		if module.resolved.replace(true) {
			return Ok(());
		}
		info!("Resolving module '{}'", module.name);

		for sibling in &module.siblings {
			let sid = self.load_module(sibling)?;
			self.resolve_module(sid)?;
		}

		for import in &module.imports {
			let mid = self.load_module(&import.name)?;
			import.memoize(mid);
		}
		for import in &module.imports {
			if let Some(mid) = import.id() {
				self.resolve_module(mid)?;
			}
		}

		for routine in &module.routines {
			if routine.resolved.replace(true) {
				continue;
			}
			self.resolve_type_list(&module, &routine.param_types);
			self.resolve_type_list(&module, &routine.return_type);
			for entry in &routine.stack_map {
				self.resolve_type_list(&module, &entry.types);
			}
		}

		for imr in &module.iface_mrefs {
			self.resolve_class_slot(&module, &imr.class);
			self.resolve_type_list(&module, &imr.param_types);
			self.resolve_type_list(&module, &imr.return_type);
		}

		for class in &module.classes {
			if class.resolved.replace(true) {
				continue;
			}
			self.resolve_class_slot(&module, &class.superclass);
			for iface in &class.ifaces {
				self.resolve_class_slot(&module, iface);
			}
			for field in class.fields.iter().chain(&class.static_fields) {
				self.resolve_type_list(&module, &field.ty);
			}
		}

		for entry_point in &module.entry_points {
			self.resolve_type_list(&module, &entry_point.param_types);
		}

		// Heap images reach some foreign modules only through the
		// class-ref extra map; record which module each remapped byte
		// actually lands in.
		if !module.disk {
			let crem: Vec<((u8, u8), usize)> =
				module.crem.iter().map(|(k, v)| (*k, *v)).collect();
			for ((mod_byte, _), cr_index) in crem {
				if mod_byte == 0 || module.mod_remap.borrow().contains_key(&mod_byte) {
					continue;
				}
				match self.class_ref_target(&module, cr_index) {
					Ok(cid) => {
						module.mod_remap.borrow_mut().insert(mod_byte, cid.module);
					}
					Err(err) => warn!("module remap failed for byte {mod_byte}: {err}"),
				}
			}
		}

		Ok(())
	}

	/// Rewrite every raw class id inside a type list through `get_class`.
	pub(crate) fn resolve_type_list(&mut self, module: &Module, types: &TypeList) {
		for token in types.iter() {
			match token {
				TypeToken::Object(class) => self.resolve_class_slot(module, class),
				TypeToken::Array { elem: ArrayElem::Object(class), .. } => {
					self.resolve_class_slot(module, class)
				}
				_ => {}
			}
		}
	}

	pub(crate) fn resolve_class_slot(&mut self, module: &Module, class: &ClassRef) {
		if let ClassSlot::Raw(mod_byte, class_byte) = class.slot() {
			let resolved = self.get_class(module, mod_byte, class_byte);
			class.set(resolved.slot());
		}
	}

	/// Resolve and return a (possibly fresh) handle for an operand-held
	/// class reference.
	pub(crate) fn resolve_class_ref(&mut self, module: &Module, class: &ClassRef) -> ClassRef {
		self.resolve_class_slot(module, class);
		class.clone()
	}

	/// Map a raw `(mod_byte, class_byte)` tuple to a class.
	///
	/// Tie-breaking order: the heap-mode extra map, then a stride-256 scan
	/// of the class-ref table for non-sibling imports, then a direct index
	/// into the local or imported class list. `(255, 255)` is the missing
	/// class; out-of-range indexes produce `Bad` sentinels.
	pub fn get_class(&mut self, module: &Module, mod_byte: u8, class_byte: u8) -> ClassRef {
		if (mod_byte, class_byte) == (255, 255) {
			return ClassRef::missing();
		}

		if !module.disk {
			if let Some(cr_index) = module.crem.get(&(mod_byte, class_byte)).copied() {
				match self.class_ref_target(module, cr_index) {
					Ok(cid) => return self.class_handle(cid),
					Err(err) => {
						warn!("class-ref extra lookup failed for ({mod_byte}:{class_byte}): {err}");
						return ClassRef::bad(mod_byte, class_byte);
					}
				}
			}
		}

		let import_is_sibling = (mod_byte as usize)
			.checked_sub(1)
			.and_then(|i| module.imports.get(i))
			.map(|import| module.siblings.iter().any(|s| *s == *import.name))
			.unwrap_or(false);
		if mod_byte != 0 && mod_byte != 255 && !import_is_sibling {
			let mut index = class_byte as usize;
			while index < module.class_refs.len() {
				let entry = &module.class_refs[index];
				if entry.mod_index == mod_byte as u16 && entry.extra == (0, 0) {
					return match self.class_ref_target(module, index) {
						Ok(cid) => self.class_handle(cid),
						Err(err) => {
							warn!("class-ref lookup failed for ({mod_byte}:{class_byte}): {err}");
							ClassRef::bad(mod_byte, class_byte)
						}
					};
				}
				index += 256;
			}
		}

		if mod_byte == 0 {
			return match module.classes.get(class_byte as usize) {
				Some(class) => self.class_handle(class.id),
				None => {
					warn!(
						"local-module class index [{class_byte}] out of range ({mod_byte}:{class_byte})"
					);
					ClassRef::bad(0, class_byte)
				}
			};
		}
		if mod_byte != 255 {
			let Some(import) = module.imports.get(mod_byte as usize - 1) else {
				warn!("foreign-module index [{mod_byte}] out of range ({mod_byte}:{class_byte})");
				return ClassRef::bad(mod_byte, class_byte);
			};
			let Some(import_id) = import.id() else {
				warn!("foreign module '{}' not loaded ({mod_byte}:{class_byte})", import.name);
				return ClassRef::bad(mod_byte, class_byte);
			};
			let imported = self.module(import_id);
			return match imported.classes.get(class_byte as usize) {
				Some(class) => self.class_handle(class.id),
				None => {
					warn!(
						"foreign-module class index [{class_byte}] out of range ({mod_byte}:{class_byte})"
					);
					ClassRef::bad(mod_byte, class_byte)
				}
			};
		}

		warn!("unresolvable class identifier ({mod_byte}:{class_byte})");
		ClassRef::raw(mod_byte, class_byte)
	}

	/// Resolve a class-ref table entry, memoizing on the entry.
	pub(crate) fn class_ref_target(
		&mut self,
		module: &Module,
		cr_index: usize,
	) -> Result<ClassId, LoadError> {
		let entry = &module.class_refs[cr_index];
		if let Some(handle) = entry.resolved.borrow().clone() {
			if let Some(id) = handle.id() {
				return Ok(id);
			}
		}
		let full_name = entry.full_name();
		let cid = self.module_load_class(module, &full_name, entry.mod_index as usize)?;
		*entry.resolved.borrow_mut() = Some(self.class_handle(cid));
		Ok(cid)
	}

	pub(crate) fn class_handle(&self, id: ClassId) -> ClassRef {
		let module = self.module(id.module);
		ClassRef::resolved(id, module.classes[id.index].name.clone())
	}

	pub fn class_name(&self, id: ClassId) -> Rc<str> {
		self.module(id.module).classes[id.index].name.clone()
	}

	/// Build a resolved method handle with its full JTS signature.
	pub fn method_ref_for(&self, id: RoutineId) -> MethodRef {
		let module = self.module(id.module);
		let routine = &module.routines[id.index];
		let class_name = match routine.parent {
			Some(cid) => self.class_name(cid),
			None => "".into(),
		};
		MethodRef::resolved(id, routine.jts(&class_name, false))
	}

	pub fn field_ref_for(&self, id: FieldId) -> FieldRef {
		let module = self.module(id.class.module);
		let class = &module.classes[id.class.index];
		let name = class
			.field(id)
			.map(|f| f.name.clone())
			.unwrap_or_else(|| "?".into());
		FieldRef::resolved(id, format!("{}/{}", class.name, name))
	}

	/// Locate the base module that defines a class, searching a module's
	/// dependency list with `preferred_mod_index` tried first.
	pub fn find_class_in_dependencies(
		&mut self,
		module: &Module,
		classpath: &str,
		preferred_mod_index: usize,
	) -> Result<String, LoadError> {
		let mut deps: Vec<String> = Vec::with_capacity(module.imports.len() + 1);
		deps.push(module.name.clone());
		deps.extend(module.imports.iter().map(|i| i.name.to_string()));
		if preferred_mod_index > 0 && preferred_mod_index - 1 < deps.len() {
			let preferred = deps.remove(preferred_mod_index - 1);
			deps.insert(0, preferred);
		}

		let mut visited: FxHashSet<String> = FxHashSet::default();
		let found = |loader: &Self, base: &str| {
			loader.classes.get(base).map_or(false, |by_name| by_name.contains_key(classpath))
		};

		let base_of = |loader: &Self, name: &str| -> Result<String, LoadError> {
			loader
				.base_names
				.get(name)
				.cloned()
				.ok_or_else(|| LoadError::NotFound(name.to_string()))
		};

		for name in &deps {
			if !self.base_names.contains_key(name) {
				visited.insert(name.clone());
				self.load_module(name)?;
			}
			let base = base_of(self, name)?;
			if found(self, &base) {
				return Ok(base);
			}
			if let Some(cache) = &self.cache {
				if cache.can_read(&format!("{base}/{classpath}.cache")) {
					return Ok(base);
				}
			}
		}

		for name in &deps {
			if visited.insert(name.clone()) {
				self.load_module(name)?;
				let base = base_of(self, name)?;
				if found(self, &base) {
					return Ok(base);
				}
			}
		}

		// Desperation: siblings of dependencies.
		for name in &deps {
			let mid = self.load_module(name)?;
			let siblings = self.module(mid).siblings.clone();
			let base = base_of(self, name)?;
			for sibling in siblings {
				if visited.insert(sibling.clone()) {
					self.load_module(&sibling)?;
					if found(self, &base) {
						return Ok(base);
					}
				}
			}
		}

		Err(LoadError::ClassNotInDependencies {
			module: module.name.clone(),
			class: classpath.to_string(),
		})
	}

	/// Locate a class from the context of a module, honoring the
	/// class-ref's preferred module index.
	pub fn module_load_class(
		&mut self,
		module: &Module,
		classpath: &str,
		preferred_mod_index: usize,
	) -> Result<ClassId, LoadError> {
		let base = self.find_class_in_dependencies(module, classpath, preferred_mod_index)?;
		self.load_class(&base, classpath)
	}

	/// Load a class by `(base module name, jts)`, loading the base module
	/// and then its siblings until the class appears.
	pub fn load_class(&mut self, base: &str, full_name: &str) -> Result<ClassId, LoadError> {
		if full_name.is_empty() {
			return Err(LoadError::BadReference("empty class name".into()));
		}
		if let Some(id) = self.lookup_class(base, full_name) {
			return Ok(id);
		}

		let mid = self.load_module(base)?;
		if let Some(id) = self.lookup_class(base, full_name) {
			return Ok(id);
		}
		let siblings = self.module(mid).siblings.clone();
		for sibling in siblings.iter().skip(1) {
			if self.names.contains_key(sibling) {
				continue;
			}
			self.load_module(sibling)?;
			if let Some(id) = self.lookup_class(base, full_name) {
				return Ok(id);
			}
		}

		Err(LoadError::ClassNotFound { base: base.to_string(), class: full_name.to_string() })
	}

	/// Find a class by jts across every loaded base (core runtime types).
	pub fn find_class_any(&mut self, full_name: &str) -> Result<ClassId, LoadError> {
		for by_name in self.classes.values() {
			if let Some(id) = by_name.get(full_name) {
				return Ok(*id);
			}
		}
		Err(LoadError::ClassNotFound { base: "*".to_string(), class: full_name.to_string() })
	}

	pub(crate) fn class_by_scope(
		&mut self,
		scope: &RefScope,
		full_name: &str,
	) -> Result<ClassId, LoadError> {
		match scope {
			RefScope::Base(base) => self.load_class(base, full_name),
			RefScope::Context(module_name) => {
				let mid = self.load_module(module_name)?;
				let module = self.module(mid);
				self.module_load_class(&module, full_name, 0)
			}
			RefScope::Global => self.find_class_any(full_name),
		}
	}

	/// Materialize a lazy class handle; `Ok(None)` for the missing class
	/// and unresolvable sentinels.
	pub fn materialize_class(&mut self, class: &ClassRef) -> Result<Option<ClassId>, LoadError> {
		match class.slot() {
			ClassSlot::Missing | ClassSlot::Bad(..) | ClassSlot::Raw(..) => Ok(None),
			ClassSlot::Named { id: Some(id), .. } => Ok(Some(id)),
			ClassSlot::Named { scope, name, id: None } => {
				let cid = self.class_by_scope(&scope, &name)?;
				class.memoize(cid, self.class_name(cid));
				Ok(Some(cid))
			}
		}
	}

	/// Materialize a lazy method handle through its JTS signature.
	pub fn materialize_method(&mut self, method: &MethodRef) -> Result<RoutineId, LoadError> {
		if let Some(id) = method.id() {
			return Ok(id);
		}
		let scope = method.scope();
		let id = self.get_method_scoped(&scope, &method.sig())?;
		method.memoize(id);
		Ok(id)
	}

	pub fn materialize_field(&mut self, field: &FieldRef) -> Result<FieldId, LoadError> {
		if let Some(id) = field.id() {
			return Ok(id);
		}
		let scope = field.scope();
		let path = field.path();
		let (class_name, field_name) = path
			.rsplit_once('/')
			.ok_or_else(|| LoadError::BadReference(path.to_string()))?;
		let cid = self.class_by_scope(&scope, class_name)?;
		match self.get_member(cid, field_name, None, true)? {
			MemberId::Field(id) => {
				field.memoize(id);
				Ok(id)
			}
			MemberId::Routine(_) => Err(LoadError::BadReference(path.to_string())),
		}
	}

	/// Look up a routine by full JTS signature under a base module name.
	pub fn get_method(&mut self, base: &str, signature: &str) -> Result<RoutineId, LoadError> {
		self.get_method_scoped(&RefScope::Base(base.into()), signature)
	}

	fn get_method_scoped(&mut self, scope: &RefScope, signature: &str) -> Result<RoutineId, LoadError> {
		let (front, rest) = signature
			.split_once('(')
			.ok_or_else(|| LoadError::BadReference(signature.to_string()))?;
		let (class_name, method_name) = front
			.rsplit_once('/')
			.ok_or_else(|| LoadError::BadReference(signature.to_string()))?;
		let (params, _ret) = rest
			.split_once(')')
			.ok_or_else(|| LoadError::BadReference(signature.to_string()))?;

		let cid = self.class_by_scope(scope, class_name)?;
		let module_name: Rc<str> = self.module(cid.module).name.as_str().into();
		let param_types = TypeList::from_jts(params, &RefScope::Context(module_name))
			.map_err(LoadError::BadReference)?;
		match self.get_member(cid, method_name, Some(&param_types), false)? {
			MemberId::Routine(id) => Ok(id),
			MemberId::Field(_) => Err(LoadError::BadReference(signature.to_string())),
		}
	}

	/// Look up a field by `Cls/name` path under a base module name.
	pub fn get_field(&mut self, base: &str, path: &str) -> Result<FieldId, LoadError> {
		let (class_name, field_name) =
			path.rsplit_once('/').ok_or_else(|| LoadError::BadReference(path.to_string()))?;
		let cid = self.load_class(base, class_name)?;
		match self.get_member(cid, field_name, None, true)? {
			MemberId::Field(id) => Ok(id),
			MemberId::Routine(_) => Err(LoadError::BadReference(path.to_string())),
		}
	}

	/// By-name member lookup with overload selection, walking the
	/// superclass chain and interfaces for inherited members.
	pub fn get_member(
		&mut self,
		class_id: ClassId,
		name: &str,
		member_types: Option<&TypeList>,
		is_field: bool,
	) -> Result<MemberId, LoadError> {
		self.actualize_class(class_id)?;

		let module = self.module(class_id.module);
		let class = &module.classes[class_id.index];
		self.build_member_maps(class);

		if is_field {
			let candidates: Vec<FieldId> = class
				.field_members
				.borrow()
				.as_ref()
				.and_then(|m| m.get(name).cloned())
				.unwrap_or_default();
			if !candidates.is_empty() {
				if let Some(wanted) = member_types {
					let mut exact = Vec::new();
					for fid in &candidates {
						let field = class.field(*fid).expect("member map out of sync");
						if field.ty == *wanted {
							exact.push(*fid);
						}
					}
					if exact.len() != 1 {
						exact = candidates
							.iter()
							.filter(|fid| {
								let field = class.field(**fid).expect("member map out of sync");
								let ty = field.ty.clone();
								self.tlist_accepts(wanted, &ty)
							})
							.copied()
							.collect();
					}
					if exact.len() == 1 {
						return Ok(MemberId::Field(exact[0]));
					}
					if exact.len() > 1 {
						return Err(LoadError::UnresolvedMember {
							kind: "field",
							class: class.name.to_string(),
							name: name.to_string(),
						});
					}
				} else {
					if candidates.len() == 1 {
						return Ok(MemberId::Field(candidates[0]));
					}
					return Err(LoadError::UnresolvedMember {
						kind: "field",
						class: class.name.to_string(),
						name: name.to_string(),
					});
				}
			}
		} else {
			let candidates: Vec<usize> = class
				.method_members
				.borrow()
				.as_ref()
				.and_then(|m| m.get(name).cloned())
				.unwrap_or_default();
			if !candidates.is_empty() {
				match member_types {
					None => {
						if candidates.len() == 1 {
							return Ok(MemberId::Routine(module.routines[candidates[0]].id));
						}
						return Err(LoadError::UnresolvedMember {
							kind: "method",
							class: class.name.to_string(),
							name: name.to_string(),
						});
					}
					Some(wanted) => {
						for rindex in &candidates {
							let declared = module.routines[*rindex].param_types.clone();
							if self.tlist_accepts(wanted, &declared) {
								return Ok(MemberId::Routine(module.routines[*rindex].id));
							}
						}
					}
				}
			}
		}

		// Inherited member.
		let superclass = class.superclass.clone();
		if let Ok(Some(super_id)) = self.materialize_class(&superclass) {
			if let Ok(member) = self.get_member(super_id, name, member_types, is_field) {
				return Ok(member);
			}
		}
		for iface in class.ifaces.clone() {
			if let Ok(Some(iface_id)) = self.materialize_class(&iface) {
				if let Ok(member) = self.get_member(iface_id, name, member_types, is_field) {
					return Ok(member);
				}
			}
		}

		Err(LoadError::UnresolvedMember {
			kind: if is_field { "field" } else { "method" },
			class: class.name.to_string(),
			name: name.to_string(),
		})
	}

	fn build_member_maps(&self, class: &ClassDef) {
		if class.field_members.borrow().is_none() {
			let mut map: FxHashMap<Rc<str>, Vec<FieldId>> = FxHashMap::default();
			for (index, field) in class.fields.iter().enumerate() {
				map.entry(field.name.clone()).or_default().push(FieldId {
					class: class.id,
					is_static: false,
					index,
				});
			}
			for (index, field) in class.static_fields.iter().enumerate() {
				map.entry(field.name.clone()).or_default().push(FieldId {
					class: class.id,
					is_static: true,
					index,
				});
			}
			*class.field_members.borrow_mut() = Some(map);
		}
		if class.method_members.borrow().is_none() {
			let module = self.module(class.id.module);
			let mut map: FxHashMap<Rc<str>, Vec<usize>> = FxHashMap::default();
			for rindex in class.routine_indexes() {
				map.entry(module.routines[rindex].name.clone()).or_default().push(rindex);
			}
			*class.method_members.borrow_mut() = Some(map);
		}
	}

	/// Actualize every class in a module and rewrite its fixup tables into
	/// resolved targets, building the `code offset -> target` map the
	/// disassembler consumes.
	pub fn actualize_module(&mut self, id: ModuleId) -> Result<(), LoadError> {
		let module = self.module(id);
		if module.actualized.replace(true) {
			return Ok(());
		}
		info!("Actualizing {} classes from module '{}'", module.classes.len(), module.name);

		for sibling in &module.siblings {
			let sid = self.load_module(sibling)?;
			self.actualize_module(sid)?;
		}

		for list in module.fixup_lists() {
			for entry in list.iter() {
				let target = self.resolve_fixup(&module, entry);
				*entry.item.borrow_mut() = target.clone();
				if let (Some(target), Some(offsets)) = (target, &entry.offsets) {
					let mut map = module.fixup_map.borrow_mut();
					for offset in offsets {
						map.insert(*offset as u32, target.clone());
					}
				}
			}
		}

		for class in &module.classes {
			self.actualize_class(class.id)?;
		}
		Ok(())
	}

	fn resolve_fixup(&mut self, module: &Module, entry: &FixupEntry) -> Option<FixupTarget> {
		match &entry.source {
			FixupSource::LocalField { class, field_index } => {
				self.resolve_class_slot(module, class);
				let Some(cid) = class.id() else {
					warn!("failed to resolve class for local field fixup ({class})");
					return None;
				};
				let owner = self.module(cid.module);
				let index = *field_index as usize;
				if owner.classes[cid.index].fields.get(index).is_none() {
					warn!("failed to get field {index} for class {}", owner.classes[cid.index].name);
					return None;
				}
				Some(FixupTarget::Field(self.field_ref_for(FieldId {
					class: cid,
					is_static: false,
					index,
				})))
			}
			FixupSource::FieldMember { class_ref, name, ty } => {
				self.resolve_type_list(module, ty);
				let cid = match self.class_ref_target(module, *class_ref) {
					Ok(cid) => cid,
					Err(err) => {
						warn!("field fixup class lookup failed: {err}");
						return None;
					}
				};
				match self.get_member(cid, name, Some(ty), true) {
					Ok(MemberId::Field(fid)) => Some(FixupTarget::Field(self.field_ref_for(fid))),
					other => {
						warn!("field fixup member lookup failed for '{name}': {other:?}");
						None
					}
				}
			}
			FixupSource::Method { class_ref, name, param_types, return_type } => {
				self.resolve_type_list(module, param_types);
				if let Some(ret) = return_type {
					self.resolve_type_list(module, ret);
				}
				let cid = match self.class_ref_target(module, *class_ref) {
					Ok(cid) => cid,
					Err(err) => {
						warn!("method fixup class lookup failed: {err}");
						return None;
					}
				};
				match self.get_member(cid, name, Some(param_types), false) {
					Ok(MemberId::Routine(rid)) => {
						Some(FixupTarget::Method(self.method_ref_for(rid)))
					}
					other => {
						warn!("method fixup member lookup failed for '{name}': {other:?}");
						None
					}
				}
			}
			FixupSource::ClassRefIdx { class_ref } => match self.class_ref_target(module, *class_ref) {
				Ok(cid) => Some(FixupTarget::Class(self.class_handle(cid))),
				Err(err) => {
					warn!("class-ref fixup lookup failed: {err}");
					None
				}
			},
			FixupSource::ModRef { mod_byte } => Some(FixupTarget::ModByte(*mod_byte)),
		}
	}

	/// Compute a class's virtual-function table and field-lookup table.
	pub fn actualize_class(&mut self, id: ClassId) -> Result<(), LoadError> {
		let module = self.module(id.module);
		let class = &module.classes[id.index];
		if class.actualized.get() || class.actualizing.replace(true) {
			return Ok(());
		}

		// The superclass table, override-patched and extended.
		let super_vft: Vec<MethodRef> = match self.materialize_class(&class.superclass)? {
			Some(super_id) => {
				self.actualize_class(super_id)?;
				let owner = self.module(super_id.module);
				let vft = owner.classes[super_id.index].vft.borrow().clone();
				vft
			}
			None => Vec::new(),
		};

		let mut vft = super_vft.clone();
		for rindex in &class.virtual_methods {
			let routine = &module.routines[*rindex];
			let params = routine.param_types.to_jts_skip_first();
			let mut replaced = false;
			for i in (0..super_vft.len()).rev() {
				let Ok(svm_id) = self.materialize_method(&super_vft[i]) else { continue };
				let owner = self.module(svm_id.module);
				let super_routine = &owner.routines[svm_id.index];
				if super_routine.name == routine.name
					&& super_routine.param_types.to_jts_skip_first() == params
				{
					vft[i] = self.method_ref_for(routine.id);
					replaced = true;
					break;
				}
			}
			if !replaced {
				vft.push(self.method_ref_for(routine.id));
			}
		}
		*class.vft.borrow_mut() = vft;

		// Instance fields in inheritance order, root first; wide fields
		// take two consecutive slots.
		let mut chain = vec![id];
		let mut current = class.superclass.clone();
		while let Some(ancestor) = self.materialize_class(&current)? {
			chain.insert(0, ancestor);
			if chain.len() > 256 {
				warn!("superclass chain of {} too deep; truncating", class.name);
				break;
			}
			current = {
				let owner = self.module(ancestor.module);
				owner.classes[ancestor.index].superclass.clone()
			};
		}
		let mut fft = Vec::new();
		for ancestor in chain {
			let owner = self.module(ancestor.module);
			let ancestor_class = &owner.classes[ancestor.index];
			for (index, field) in ancestor_class.fields.iter().enumerate() {
				let field_ref = self.field_ref_for(FieldId {
					class: ancestor,
					is_static: false,
					index,
				});
				if field.is_wide() {
					fft.push(field_ref.clone());
				}
				fft.push(field_ref);
			}
		}
		*class.fft.borrow_mut() = fft;

		class.actualized.set(true);
		class.actualizing.set(false);
		Ok(())
	}

	/// Disassemble every routine in a module, consuming its fixup tables.
	pub fn disasm_module(&mut self, id: ModuleId) -> Result<(), LoadError> {
		let module = self.module(id);
		if module.disasmed.replace(true) {
			return Ok(());
		}
		info!("Disassembling {} routines from module '{}'", module.routines.len(), module.name);
		for index in 0..module.routines.len() {
			self.disasm_routine(&module, index)?;
		}
		Ok(())
	}

	pub(crate) fn disasm_routine(&mut self, module: &Rc<Module>, index: usize) -> Result<(), LoadError> {
		let routine = &module.routines[index];
		if routine.disasmed.replace(true) {
			return Ok(());
		}

		let raw_instructions = crate::disasm::disassemble(routine, module)?;
		let instructions: Vec<_> =
			raw_instructions.into_iter().map(|ri| ri.fixup(self, module)).collect();
		*routine.instructions.borrow_mut() = instructions;

		let raw_handlers = routine.raw_handlers.take();
		let mut handlers = Vec::with_capacity(raw_handlers.len());
		for raw in raw_handlers {
			let class = match module.fixup_target(raw.type_offset) {
				Some(FixupTarget::Class(class)) => class,
				Some(other) => {
					warn!(
						"detected non-class ({other:?}) as a type fixup @ {:#07x}",
						raw.type_offset
					);
					ClassRef::missing()
				}
				None => self.get_class(module, raw.class_id.0, raw.class_id.1),
			};
			handlers.push(crate::resolve::routine::ExHandler {
				scope: (raw.start as u32, raw.end as u32),
				target: raw.target as u32,
				class,
			});
		}
		*routine.handlers.borrow_mut() = handlers;
		Ok(())
	}

	/// Resolve an interface-method reference at a data-section offset.
	pub(crate) fn iface_method(
		&mut self,
		module: &Module,
		offset: u32,
	) -> Result<MethodRef, LoadError> {
		let imr = module
			.iface_mref_at(offset)
			.cloned()
			.ok_or_else(|| LoadError::BadReference(format!("iface method ref @ {offset:#06x}")))?;
		self.resolve_class_slot(module, &imr.class);
		let cid = self
			.materialize_class(&imr.class)?
			.ok_or_else(|| LoadError::BadReference(format!("iface method class '{}'", imr.class)))?;
		match self.get_member(cid, &imr.name, Some(&imr.param_types), false)? {
			MemberId::Routine(rid) => Ok(self.method_ref_for(rid)),
			MemberId::Field(_) => Err(LoadError::BadReference(imr.to_string())),
		}
	}

	/// User-facing routine name, mapped through the name database when one
	/// is attached. The JTS key keeps the original name.
	pub fn display_routine_name<'l>(&'l self, jts: &str, fallback: &'l str) -> &'l str {
		self.name_db
			.as_ref()
			.and_then(|db| db.routine_name(jts))
			.unwrap_or(fallback)
	}

	pub fn display_field_name<'l>(&'l self, path: &str, fallback: &'l str) -> &'l str {
		self.name_db
			.as_ref()
			.and_then(|db| db.field_name(path))
			.unwrap_or(fallback)
	}

	/// Record a replacement name for a routine; the member must exist.
	pub fn rename_routine(
		&mut self,
		base: &str,
		routine_jts: &str,
		new_name: &str,
	) -> Result<(), LoadError> {
		self.get_method(base, routine_jts).map_err(|_| {
			LoadError::NameDb(format!("could not locate routine {routine_jts} for renaming"))
		})?;
		let db = self.name_db.as_mut().ok_or_else(|| LoadError::NameDb("no database open".into()))?;
		let key = db.routine_key_for(routine_jts);
		db.insert_routine(key, new_name.to_string());
		db.save()
	}

	/// Record a replacement name for a field; the member must exist.
	pub fn rename_field(&mut self, base: &str, field_path: &str, new_name: &str) -> Result<(), LoadError> {
		self.get_field(base, field_path).map_err(|_| {
			LoadError::NameDb(format!("could not locate field {field_path} for renaming"))
		})?;
		let db = self.name_db.as_mut().ok_or_else(|| LoadError::NameDb("no database open".into()))?;
		let key = db.field_key_for(field_path);
		db.insert_field(key, new_name.to_string());
		db.save()
	}

	/// Serialize a module (resolved, actualized, disassembled) into the
	/// cache root.
	pub fn save_module_cache(&mut self, id: ModuleId) -> Result<(), LoadError> {
		crate::resolve::cache::save_module(self, id)
	}
}

fn read_module_bytes(path: &Path) -> Result<Vec<u8>, LoadError> {
	#[cfg(feature = "memmap2")]
	{
		let file = std::fs::File::open(path)?;
		// Only used to materialize the buffer; the module owns its bytes.
		let map = unsafe { memmap2::Mmap::map(&file)? };
		return Ok(map.to_vec());
	}
	#[cfg(not(feature = "memmap2"))]
	{
		Ok(std::fs::read(path)?)
	}
}
