//! Synthetic module-image builder for the integration suite.
//!
//! Emits bit-exact `.cod` images: 44-byte header, code section with
//! long-form routine headers, data section with name tables, class
//! definitions, and (empty) fixup tables, and an empty trailer.

use cordite::ident::encode_identifier;
use cordite::types::TypeList;

#[derive(Clone)]
pub struct RoutineSpec {
	pub name: &'static str,
	pub param_types: Option<TypeList>,
	pub return_type: Option<TypeList>,
	pub attrs: u16,
	pub max_stack: u8,
	pub max_locals: u8,
	pub code: Vec<u8>,
	/// `(start, end, target, class_id)` handler records.
	pub handlers: Vec<(u16, u16, u16, (u8, u8))>,
}

impl RoutineSpec {
	pub fn new(name: &'static str, code: Vec<u8>) -> Self {
		Self {
			name,
			param_types: None,
			return_type: None,
			attrs: 0x01,
			max_stack: 4,
			max_locals: 4,
			code,
			handlers: Vec::new(),
		}
	}

	pub fn is_static(mut self) -> Self {
		self.attrs |= 0x10;
		self
	}

	pub fn params(mut self, types: TypeList) -> Self {
		self.param_types = Some(types);
		self
	}

	pub fn returns(mut self, types: TypeList) -> Self {
		self.return_type = Some(types);
		self
	}

	pub fn handler(mut self, start: u16, end: u16, target: u16, class_id: (u8, u8)) -> Self {
		self.attrs |= 0x40;
		self.handlers.push((start, end, target, class_id));
		self
	}
}

#[derive(Clone)]
pub struct FieldSpec {
	pub name: &'static str,
	pub ty: TypeList,
	pub attrs: u8,
	pub address: Option<u16>,
}

impl FieldSpec {
	pub fn new(name: &'static str, ty: TypeList) -> Self {
		Self { name, ty, attrs: 0x01, address: None }
	}
}

#[derive(Clone)]
pub struct ClassSpec {
	pub package: &'static str,
	pub name: &'static str,
	pub flags: u16,
	pub superclass: (u8, u8),
	pub ifaces: Vec<(u8, u8)>,
	pub fields: Vec<FieldSpec>,
	pub static_fields: Vec<FieldSpec>,
	pub virtuals: Vec<RoutineSpec>,
	pub nonvirtuals: Vec<RoutineSpec>,
	pub statics: Vec<RoutineSpec>,
}

impl ClassSpec {
	pub fn new(name: &'static str) -> Self {
		Self {
			package: "",
			name,
			flags: 0x01,
			superclass: (255, 255),
			ifaces: Vec::new(),
			fields: Vec::new(),
			static_fields: Vec::new(),
			virtuals: Vec::new(),
			nonvirtuals: Vec::new(),
			statics: Vec::new(),
		}
	}

	pub fn extends(mut self, class_id: (u8, u8)) -> Self {
		self.superclass = class_id;
		self
	}
}

pub struct ModuleSpec {
	pub name: &'static str,
	pub version: &'static str,
	pub aliases: Vec<&'static str>,
	/// `(name, version)` imported modules.
	pub imports: Vec<(&'static str, &'static str)>,
	pub classes: Vec<ClassSpec>,
	pub timestamp: u32,
}

impl ModuleSpec {
	pub fn new(name: &'static str) -> Self {
		Self { name, version: "1.0", aliases: Vec::new(), imports: Vec::new(), classes: Vec::new(), timestamp: 0x1234 }
	}
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
	out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
	out.extend_from_slice(&value.to_le_bytes());
}

struct Pool {
	bytes: Vec<u8>,
	base: usize,
}

impl Pool {
	fn cstr(&mut self, text: &str) -> u16 {
		let offset = (self.base + self.bytes.len()) as u16;
		self.bytes.extend_from_slice(text.as_bytes());
		self.bytes.push(0);
		offset
	}

	fn ident(&mut self, text: &str) -> u16 {
		let offset = (self.base + self.bytes.len()) as u16;
		self.bytes.extend_from_slice(&encode_identifier(text));
		self.bytes.push(0);
		offset
	}

	fn tlist(&mut self, types: &TypeList) -> u16 {
		if types.is_empty() {
			return 0xFFFF;
		}
		let offset = (self.base + self.bytes.len()) as u16;
		types.encode_into(&mut self.bytes);
		offset
	}
}

/// Pre-intern everything the data section will reference so the pool can
/// sit in its proper region.
struct InternedRoutine {
	name: u16,
	params: u16,
	ret: u16,
}

pub struct BuiltModule {
	pub bytes: Vec<u8>,
	/// Code-section entry offset of every routine, keyed by name.
	pub routine_offsets: Vec<(&'static str, u16)>,
}

pub fn build_module(spec: &ModuleSpec) -> BuiltModule {
	// Code section: routines in class order (virtuals, nonvirtuals,
	// statics), each preceded by its long-form header.
	let mut code: Vec<u8> = Vec::new();
	let mut routine_offsets: Vec<(&'static str, u16)> = Vec::new();
	let mut class_routine_offsets: Vec<(Vec<u16>, Vec<u16>, Vec<u16>)> = Vec::new();

	// The pool region cannot be laid out until the code section exists,
	// so interning happens against a running pool and the data section is
	// assembled around it afterward.
	let empty = TypeList::empty();

	// First pass: emit the code section and remember entry offsets and
	// header positions (names and type offsets get patched in once the
	// pool is interned).
	fn emit_routine(
		code: &mut Vec<u8>,
		routine_offsets: &mut Vec<(&'static str, u16)>,
		routine: &RoutineSpec,
		bucket: &mut Vec<u16>,
	) -> usize {
		// Long-form header; detection wants the byte five before the
		// entry (the attrs high byte) to be <= 1.
		assert!(routine.attrs < 0x200, "attrs too large for the long header form");
		let header_at = code.len();
		code.resize(code.len() + 14, 0);
		let entry = code.len() as u16;
		bucket.push(entry);
		routine_offsets.push((routine.name, entry));
		code.extend_from_slice(&routine.code);
		if routine.attrs & 0x40 != 0 {
			for (start, end, target, class_id) in &routine.handlers {
				push_u16(code, *start);
				push_u16(code, *end);
				push_u16(code, *target);
				code.push(class_id.0);
				code.push(class_id.1);
			}
			push_u16(code, 0xFFFF);
		}
		header_at
	}

	let mut header_slots: Vec<(usize, RoutineSpec)> = Vec::new();
	for class in &spec.classes {
		let mut offsets = (Vec::new(), Vec::new(), Vec::new());
		for routine in &class.virtuals {
			let at = emit_routine(&mut code, &mut routine_offsets, routine, &mut offsets.0);
			header_slots.push((at, routine.clone()));
		}
		for routine in &class.nonvirtuals {
			let at = emit_routine(&mut code, &mut routine_offsets, routine, &mut offsets.1);
			header_slots.push((at, routine.clone()));
		}
		for routine in &class.statics {
			let at = emit_routine(&mut code, &mut routine_offsets, routine, &mut offsets.2);
			header_slots.push((at, routine.clone()));
		}
		class_routine_offsets.push(offsets);
	}

	// Data section assembly.
	let ds_guess_classes = spec.classes.len();
	let header_size = 52usize;
	let class_offsets_at = header_size;
	let after_class_offsets = class_offsets_at + 2 * ds_guess_classes;
	let num_mods = 1 + spec.imports.len();
	let names_at = after_class_offsets;
	let after_names = names_at + 4 * num_mods;

	// Region skeleton: siblings, aliases, exports (none), pool, statics
	// (none), class defs, iface refs (none), class refs (none), fixups.
	let siblings_at = after_names;
	let siblings_len = 2; // one sibling: the base (own) name
	let aliases_at = siblings_at + siblings_len;
	let aliases_len = 2 * spec.aliases.len();
	let exports_at = aliases_at + aliases_len;
	let pool_at = exports_at; // no exports

	let mut pool = Pool { bytes: Vec::new(), base: pool_at };
	let name_off = pool.cstr(spec.name);
	let version_off = pool.cstr(spec.version);
	let alias_offs: Vec<u16> = spec.aliases.iter().map(|a| pool.cstr(a)).collect();
	let import_offs: Vec<(u16, u16)> =
		spec.imports.iter().map(|(n, v)| (pool.cstr(n), pool.cstr(v))).collect();

	// Intern per-routine pool data and patch the code headers.
	let interned: Vec<InternedRoutine> = header_slots
		.iter()
		.map(|(_, routine)| InternedRoutine {
			name: pool.ident(routine.name),
			params: pool.tlist(routine.param_types.as_ref().unwrap_or(&empty)),
			ret: pool.tlist(routine.return_type.as_ref().unwrap_or(&empty)),
		})
		.collect();
	for ((header_at, routine), entry) in header_slots.iter().zip(&interned) {
		let h = &mut code[*header_at..*header_at + 14];
		h[0..2].copy_from_slice(&entry.name.to_le_bytes());
		h[2..4].copy_from_slice(&entry.params.to_le_bytes());
		h[4..6].copy_from_slice(&entry.ret.to_le_bytes());
		h[6..8].copy_from_slice(&(routine.code.len() as u16).to_le_bytes());
		h[8..10].copy_from_slice(&routine.attrs.to_le_bytes());
		h[10] = 0; // no stack-map entries
		h[11] = routine.max_locals;
		h[12] = 0;
		h[13] = routine.max_stack;
	}

	struct InternedClass {
		pack: u16,
		name: u16,
		fields: Vec<(u16, u16)>,
		static_fields: Vec<(u16, u16, u16)>,
	}
	let interned_classes: Vec<InternedClass> = spec
		.classes
		.iter()
		.map(|class| InternedClass {
			pack: pool.ident(class.package),
			name: pool.ident(class.name),
			fields: class.fields.iter().map(|f| (pool.ident(f.name), pool.tlist(&f.ty))).collect(),
			static_fields: class
				.static_fields
				.iter()
				.map(|f| (pool.ident(f.name), pool.tlist(&f.ty), f.address.unwrap_or(0)))
				.collect(),
		})
		.collect();

	let static_data_at = pool_at + pool.bytes.len();
	let class_defs_at = static_data_at; // no static data

	// Class definition records.
	let mut class_def_bytes: Vec<u8> = Vec::new();
	let mut class_offsets: Vec<u16> = Vec::new();
	for (ci, class) in spec.classes.iter().enumerate() {
		let start = class_defs_at + class_def_bytes.len();
		class_offsets.push(start as u16);
		let ic = &interned_classes[ci];
		let (virtuals, nonvirtuals, statics) = &class_routine_offsets[ci];

		let off_virtual = 40u16;
		let off_nonvirtual = off_virtual + 2 * virtuals.len() as u16;
		let off_static = off_nonvirtual + 2 * nonvirtuals.len() as u16;
		let off_fields = off_static + 2 * statics.len() as u16;
		let off_static_fields = off_fields + 4 * class.fields.len() as u16;
		let off_ifaces = off_static_fields + 6 * class.static_fields.len() as u16;
		let off_field_attrs = off_ifaces + 2 * class.ifaces.len() as u16;
		let off_static_field_attrs = off_field_attrs + class.fields.len() as u16;

		let d = &mut class_def_bytes;
		push_u16(d, ic.pack);
		push_u16(d, ic.name);
		d.push(class.superclass.0);
		d.push(class.superclass.1);
		for _ in 0..6 {
			push_u16(d, 0); // static_start .. index
		}
		push_u16(d, 0); // code_start
		push_u16(d, 0); // code_end
		push_u16(d, class.flags);
		push_u16(d, off_virtual);
		push_u16(d, off_nonvirtual);
		push_u16(d, off_static);
		push_u16(d, off_fields);
		push_u16(d, off_static_fields);
		push_u16(d, off_ifaces);
		push_u16(d, off_field_attrs);
		push_u16(d, off_static_field_attrs);
		for off in virtuals.iter().chain(nonvirtuals).chain(statics) {
			push_u16(d, *off);
		}
		for (name, ty) in &ic.fields {
			push_u16(d, *name);
			push_u16(d, *ty);
		}
		for (name, ty, address) in &ic.static_fields {
			push_u16(d, *name);
			push_u16(d, *ty);
			push_u16(d, *address);
		}
		for (m, c) in &class.ifaces {
			d.push(*m);
			d.push(*c);
		}
		for field in &class.fields {
			d.push(field.attrs);
		}
		for field in &class.static_fields {
			d.push(field.attrs);
		}
	}

	let iface_refs_at = class_defs_at + class_def_bytes.len();
	let class_refs_at = iface_refs_at; // none
	let mut tail: Vec<u8> = Vec::new();
	let tail_base = class_refs_at; // none

	// Eight empty fixup tables, two-byte aligned, in layout order:
	// routine, static routine, virtual routine, class-ref, field, local
	// field, static field, module code.
	let mut fixup_offsets: Vec<u16> = Vec::new();
	for _ in 0..8 {
		while (tail_base + tail.len()) % 2 != 0 {
			tail.push(0);
		}
		fixup_offsets.push((tail_base + tail.len()) as u16);
		push_u16(&mut tail, 0);
	}

	let data_size = tail_base + tail.len();

	// Now the data-section header.
	let mut data: Vec<u8> = Vec::with_capacity(data_size);
	data.push(0); // flags
	data.push(6); // data version (explicit fixup offsets)
	push_u16(&mut data, 0); // icalls
	data.push(num_mods as u8);
	data.push(spec.classes.len() as u8);
	push_u16(&mut data, exports_at as u16);
	push_u16(&mut data, pool_at as u16);
	push_u16(&mut data, static_data_at as u16);
	push_u16(&mut data, class_defs_at as u16);
	push_u16(&mut data, pool_at as u16); // type lists live in the pool
	push_u16(&mut data, iface_refs_at as u16);
	push_u16(&mut data, class_refs_at as u16);
	push_u16(&mut data, fixup_offsets[0]);
	push_u16(&mut data, fixup_offsets[1]);
	push_u16(&mut data, fixup_offsets[2]);
	push_u16(&mut data, fixup_offsets[3]);
	push_u16(&mut data, aliases_at as u16);
	push_u16(&mut data, fixup_offsets[4]);
	push_u16(&mut data, fixup_offsets[5]);
	push_u16(&mut data, fixup_offsets[6]);
	push_u16(&mut data, fixup_offsets[7]);
	push_u16(&mut data, 0); // static size
	for _ in 0..2 {
		push_u16(&mut data, 0); // entry point offset (empty)
		push_u16(&mut data, 0);
		push_u16(&mut data, 0);
	}
	assert_eq!(data.len(), header_size);

	for off in &class_offsets {
		push_u16(&mut data, *off);
	}
	push_u16(&mut data, name_off);
	for (n, _) in &import_offs {
		push_u16(&mut data, *n);
	}
	push_u16(&mut data, version_off);
	for (_, v) in &import_offs {
		push_u16(&mut data, *v);
	}
	// Siblings (just the base name), then aliases.
	push_u16(&mut data, name_off);
	for off in &alias_offs {
		push_u16(&mut data, *off);
	}
	assert_eq!(data.len(), pool_at, "pool region misplaced");
	data.extend_from_slice(&pool.bytes);
	assert_eq!(data.len(), class_defs_at);
	data.extend_from_slice(&class_def_bytes);
	assert_eq!(data.len(), tail_base);
	data.extend_from_slice(&tail);
	assert_eq!(data.len(), data_size);

	// File header.
	let mut bytes: Vec<u8> = Vec::with_capacity(44 + code.len() + data.len());
	push_u32(&mut bytes, 0xFFFF_C0DE);
	push_u32(&mut bytes, 0); // section_num: disk image
	push_u32(&mut bytes, 0); // vtable_ptr
	push_u32(&mut bytes, spec.timestamp);
	push_u32(&mut bytes, 0); // user_version
	push_u32(&mut bytes, 0); // fieldref_ptr
	push_u16(&mut bytes, 0); // max_typelist_size
	push_u16(&mut bytes, 0); // reserved
	push_u32(&mut bytes, 0); // data_section
	push_u32(&mut bytes, 0); // mod_info
	push_u16(&mut bytes, 78); // version
	push_u16(&mut bytes, code.len() as u16);
	push_u16(&mut bytes, data.len() as u16);
	push_u16(&mut bytes, 0); // flags
	assert_eq!(bytes.len(), 44);
	bytes.extend_from_slice(&code);
	bytes.extend_from_slice(&data);

	BuiltModule { bytes, routine_offsets }
}

impl BuiltModule {
	pub fn routine_offset(&self, name: &str) -> u16 {
		self.routine_offsets
			.iter()
			.find(|(n, _)| *n == name)
			.map(|(_, off)| *off)
			.unwrap_or_else(|| panic!("no routine named {name}"))
	}
}
