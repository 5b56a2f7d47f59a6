//! End-to-end scenarios over synthetic module images.

mod common;

use std::path::Path;

use common::{build_module, ClassSpec, FieldSpec, ModuleSpec, RoutineSpec};
use cordite::disasm::{Opcode, Operand};
use cordite::flow::Subroutine;
use cordite::resolve::{Loader, LoaderOptions, MemberId, ModuleId};
use cordite::scan::HeuristicScanner;
use cordite::types::{ArrayElem, PrimKind, TypeList, TypeToken};

// Opcode bytes used by the hand-assembled routines.
const OP_ICONST_0: u8 = 35;
const OP_BIPUSH: u8 = 36;
const OP_IRETURN: u8 = 24;
const OP_RETURN: u8 = 31;
const OP_ALOAD_0: u8 = 63;
const OP_GETFIELD: u8 = 99;
const OP_IFEQ: u8 = 147;
const OP_GOTO: u8 = 161;
const OP_INVOKESTATIC: u8 = 7;
const OP_INVOKESTATIC_LIB: u8 = 8;

fn prim(kind: PrimKind) -> TypeList {
	TypeList(vec![TypeToken::Prim(kind)])
}

fn raw_object(class_byte: u8) -> TypeList {
	TypeList(vec![TypeToken::Object(cordite::resolve::ClassRef::raw(0, class_byte))])
}

fn write_module(dir: &Path, file: &str, bytes: &[u8]) {
	std::fs::write(dir.join(file), bytes).unwrap();
}

fn loader_for(dir: &Path) -> Loader {
	Loader::new(LoaderOptions { search_paths: vec![dir.to_path_buf()], ..Default::default() })
		.unwrap()
}

/// A module with one class, a virtual routine, and a static routine.
fn simple_spec() -> ModuleSpec {
	let mut spec = ModuleSpec::new("alpha");
	spec.aliases.push("alpha_alias");
	let mut foo = ClassSpec::new("Foo");
	foo.fields.push(FieldSpec::new("counter", prim(PrimKind::Int)));
	foo.virtuals.push(
		RoutineSpec::new("run", vec![OP_RETURN]).params(raw_object(0)),
	);
	foo.statics.push(
		RoutineSpec::new("zero", vec![OP_ICONST_0, OP_IRETURN])
			.is_static()
			.returns(prim(PrimKind::Int)),
	);
	spec.classes.push(foo);
	spec
}

#[test]
fn parse_and_resolve_a_single_module() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "alpha.cod", &build_module(&simple_spec()).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("alpha").unwrap();
	let module = loader.module(id);

	assert_eq!(module.name, "alpha");
	assert_eq!(module.version, "1.0");
	assert_eq!(module.timestamp, 0x1234);
	assert_eq!(module.base_name(), "alpha");
	assert_eq!(module.aliases, vec!["alpha_alias".to_string()]);
	assert!(module.is_resolved());

	assert_eq!(module.classes.len(), 1);
	let foo = &module.classes[0];
	assert_eq!(&*foo.name, "Foo");
	assert_eq!(&*foo.fields[0].name, "counter");
	assert_eq!(foo.fields[0].ty.to_jts(), "I");

	let run = &module.routines[foo.virtual_methods[0]];
	assert_eq!(&*run.name, "run");
	// The receiver's raw class id resolved to the local class.
	assert_eq!(run.param_types.to_jts(), "LFoo;");
	let zero = &module.routines[foo.static_methods[0]];
	assert_eq!(zero.return_jts(), "I");
	assert_eq!(zero.jts("Foo", false), "Foo/zero()I");
}

#[test]
fn alias_symmetry() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "alpha.cod", &build_module(&simple_spec()).bytes);

	let mut loader = loader_for(dir.path());
	let by_alias = loader.load_module("alpha_alias").unwrap();
	let by_name = loader.load_module("alpha").unwrap();
	assert_eq!(by_alias, by_name);
	assert_eq!(loader.module(by_alias).name, "alpha");
}

#[test]
fn sibling_reachability() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "alpha.cod", &build_module(&simple_spec()).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("alpha").unwrap();
	let module = loader.module(id);
	for class in &module.classes {
		let found = loader.load_class(module.base_name(), &class.name).unwrap();
		assert_eq!(found, class.id);
	}
}

/// Two classes: `Sup` with virtuals m1, m2 and `Sub` overriding m1 and
/// adding m3. Inherited fields feed the field-lookup-table law.
fn hierarchy_spec() -> ModuleSpec {
	let mut spec = ModuleSpec::new("hier");
	let mut sup = ClassSpec::new("Sup");
	sup.fields.push(FieldSpec::new("a", prim(PrimKind::Int)));
	sup.fields.push(FieldSpec::new("b", prim(PrimKind::Long)));
	sup.virtuals.push(RoutineSpec::new("m1", vec![OP_RETURN]).params(raw_object(0)));
	sup.virtuals.push(RoutineSpec::new("m2", vec![OP_RETURN]).params(raw_object(0)));
	spec.classes.push(sup);

	let mut sub = ClassSpec::new("Sub").extends((0, 0));
	sub.fields.push(FieldSpec::new("c", prim(PrimKind::Short)));
	sub.virtuals.push(RoutineSpec::new("m1", vec![OP_RETURN]).params(raw_object(1)));
	sub.virtuals.push(RoutineSpec::new("m3", vec![OP_RETURN]).params(raw_object(1)));
	spec.classes.push(sub);
	spec
}

#[test]
fn vft_override_replaces_and_appends() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "hier.cod", &build_module(&hierarchy_spec()).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("hier").unwrap();
	loader.actualize_module(id).unwrap();
	let module = loader.module(id);

	let sup = &module.classes[0];
	let sub = &module.classes[1];
	let sup_vft = sup.vft.borrow().clone();
	let sub_vft = sub.vft.borrow().clone();
	assert_eq!(sup_vft.len(), 2);
	assert_eq!(sub_vft.len(), 3);

	// Slot 0 was replaced by the override; slot 1 kept; m3 appended.
	let names: Vec<String> = sub_vft.iter().map(|m| m.sig().to_string()).collect();
	assert!(names[0].starts_with("Sub/m1("), "vft[0] = {}", names[0]);
	assert!(names[1].starts_with("Sup/m2("), "vft[1] = {}", names[1]);
	assert!(names[2].starts_with("Sub/m3("), "vft[2] = {}", names[2]);

	// Slot-for-slot prefix law against the superclass table.
	for (i, sup_entry) in sup_vft.iter().enumerate() {
		let sup_id = loader.materialize_method(sup_entry).unwrap();
		let sub_id = loader.materialize_method(&sub_vft[i]).unwrap();
		let sup_name = loader.module(sup_id.module).routines[sup_id.index].name.clone();
		let sub_name = loader.module(sub_id.module).routines[sub_id.index].name.clone();
		assert_eq!(sup_name, sub_name);
	}
}

#[test]
fn fft_width_law() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "hier.cod", &build_module(&hierarchy_spec()).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("hier").unwrap();
	loader.actualize_module(id).unwrap();
	let module = loader.module(id);

	let sub = &module.classes[1];
	let fft = sub.fft.borrow().clone();
	// a (1 slot), b (2 slots), c (1 slot), inheritance order root first.
	assert_eq!(fft.len(), 4);
	let mut width = 0.0f64;
	let mut distinct: Vec<String> = Vec::new();
	for entry in &fft {
		let fid = loader.materialize_field(entry).unwrap();
		let owner = loader.module(fid.class.module);
		let field = owner.classes[fid.class.index].field(fid).unwrap().clone();
		width += match field.is_wide() {
			true => 0.5,
			false => 1.0,
		};
		let path = entry.path().to_string();
		if !distinct.contains(&path) {
			distinct.push(path);
		}
	}
	assert_eq!(width, distinct.len() as f64);
	assert_eq!(fft[0].path().as_ref(), "Sup/a");
	assert_eq!(fft[3].path().as_ref(), "Sub/c");
}

#[test]
fn cross_module_call_resolves_to_the_same_routine() {
	let dir = tempfile::tempdir().unwrap();

	let mut a = ModuleSpec::new("alpha");
	let mut foo = ClassSpec::new("Foo");
	foo.statics.push(RoutineSpec::new("bar", vec![OP_RETURN]).is_static());
	a.classes.push(foo);
	let built_a = build_module(&a);
	write_module(dir.path(), "alpha.cod", &built_a.bytes);

	let bar_offset = built_a.routine_offset("bar");
	let mut b = ModuleSpec::new("beta");
	b.imports.push(("alpha", "1.0"));
	let mut baz = ClassSpec::new("Baz");
	baz.statics.push(
		RoutineSpec::new(
			"call",
			vec![
				OP_INVOKESTATIC_LIB,
				1, // import #1
				0,
				(bar_offset & 0xff) as u8,
				(bar_offset >> 8) as u8,
				OP_RETURN,
			],
		)
		.is_static(),
	);
	b.classes.push(baz);
	write_module(dir.path(), "beta.cod", &build_module(&b).bytes);

	let mut loader = loader_for(dir.path());
	let beta = loader.load_module("beta").unwrap();
	loader.actualize_module(beta).unwrap();
	loader.disasm_module(beta).unwrap();

	let module = loader.module(beta);
	let call = &module.routines[0];
	let instructions = call.instructions.borrow();
	let Operand::Method(target) = &instructions[0].operands[0] else {
		panic!("call operand did not resolve: {}", instructions[0]);
	};

	let alpha_base = loader.base_name_of("alpha").unwrap().to_string();
	let direct = loader.get_method(&alpha_base, "Foo/bar()V").unwrap();
	assert_eq!(target.id(), Some(direct));
}

/// A routine whose join block sees `int` from one path and `short` from
/// the other; the merge must widen to `int`.
fn join_spec() -> ModuleSpec {
	let mut spec = ModuleSpec::new("joiner");
	let mut foo = ClassSpec::new("Foo");
	let shortval = RoutineSpec::new("shortval", vec![OP_BIPUSH, 1, OP_IRETURN])
		.is_static()
		.returns(prim(PrimKind::Short));
	foo.statics.push(shortval);
	spec.classes.push(foo);
	spec
}

fn join_test_code(shortval_offset: u16) -> Vec<u8> {
	vec![
		OP_ICONST_0, // 0: push int
		OP_IFEQ,     // 1: pops; taken -> offset 6
		4,
		OP_ICONST_0, // 3: push int
		OP_GOTO,     // 4: -> offset 10
		5,
		OP_INVOKESTATIC, // 6: push short
		0,
		(shortval_offset & 0xff) as u8,
		(shortval_offset >> 8) as u8,
		OP_IRETURN, // 10
	]
}

fn build_join_module() -> Vec<u8> {
	// Two-pass build: the test routine's call word needs shortval's
	// final entry offset, which shifts once `test` is added.
	let mut spec = join_spec();
	spec.classes[0].statics.insert(
		0,
		RoutineSpec::new("test", join_test_code(0)).is_static().returns(prim(PrimKind::Int)),
	);
	let probe = build_module(&spec);
	let shortval = probe.routine_offset("shortval");
	spec.classes[0].statics[0].code = join_test_code(shortval);
	build_module(&spec).bytes
}

#[test]
fn cfg_covers_every_instruction() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "joiner.cod", &build_join_module());

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("joiner").unwrap();
	loader.actualize_module(id).unwrap();
	loader.disasm_module(id).unwrap();
	let module = loader.module(id);

	let test = &module.routines[0];
	assert_eq!(&*test.name, "test");
	let sub = Subroutine::build(test).unwrap();

	let total: usize = sub.blocks.iter().map(|b| b.instructions.len()).sum();
	assert_eq!(total, test.instructions.borrow().len());

	let firsts: Vec<usize> = sub.blocks.iter().map(|b| b.first_instruction()).collect();
	for instr in test.instructions.borrow().iter() {
		for target in instr.branch_locations() {
			let index = test
				.instructions
				.borrow()
				.iter()
				.position(|i| i.offset == target)
				.expect("branch target is an instruction");
			assert!(firsts.contains(&index), "target {target} does not start a block");
		}
	}
}

#[test]
fn join_widens_short_to_int() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "joiner.cod", &build_join_module());

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("joiner").unwrap();
	loader.actualize_module(id).unwrap();
	loader.disasm_module(id).unwrap();
	let module = loader.module(id);

	let mut scanner = HeuristicScanner::new(&mut loader);
	assert!(scanner.scan_routine(&module, 0));
	assert!(scanner.scan_routine(&module, 1));

	let test = &module.routines[0];
	let instructions = test.instructions.borrow();
	let last = instructions.last().unwrap();
	assert_eq!(last.opcode, Opcode::ireturn);
	assert_eq!(last.totos.as_ref().map(|t| t.to_jts()), Some("I".to_string()));
}

#[test]
fn scanner_patches_field_slots_through_the_fft() {
	let dir = tempfile::tempdir().unwrap();
	let mut spec = ModuleSpec::new("fields");
	let mut foo = ClassSpec::new("Foo");
	foo.fields.push(FieldSpec::new("a", prim(PrimKind::Int)));
	foo.virtuals.push(
		RoutineSpec::new("geta", vec![OP_ALOAD_0, OP_GETFIELD, 0, OP_IRETURN])
			.params(raw_object(0))
			.returns(prim(PrimKind::Int)),
	);
	spec.classes.push(foo);
	write_module(dir.path(), "fields.cod", &build_module(&spec).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("fields").unwrap();
	loader.actualize_module(id).unwrap();
	loader.disasm_module(id).unwrap();
	let module = loader.module(id);

	{
		let geta = &module.routines[0];
		let instructions = geta.instructions.borrow();
		assert!(
			matches!(instructions[1].operands[0], Operand::FieldSlot(0)),
			"field slot should await the scanner: {}",
			instructions[1]
		);
	}

	let mut scanner = HeuristicScanner::new(&mut loader);
	assert!(scanner.scan_routine(&module, 0));
	assert_eq!(scanner.stats().fields_patched, 1);

	let geta = &module.routines[0];
	let instructions = geta.instructions.borrow();
	let Operand::Field(field) = &instructions[1].operands[0] else {
		panic!("field slot was not patched: {}", instructions[1]);
	};
	assert_eq!(field.path().as_ref(), "Foo/a");

	// Patch soundness: the declared receiver is the inferred receiver.
	let fid = field.id().expect("patched field is resolved");
	assert_eq!(fid.class, module.classes[0].id);
}

#[test]
fn member_lookup_walks_the_hierarchy() {
	let dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "hier.cod", &build_module(&hierarchy_spec()).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("hier").unwrap();
	let module = loader.module(id);
	let sub_id = module.classes[1].id;

	// m2 is only declared on Sup; the lookup must walk the superclass.
	match loader.get_member(sub_id, "m2", None, false).unwrap() {
		MemberId::Routine(rid) => {
			let owner = loader.module(rid.module);
			assert_eq!(&*owner.routines[rid.index].name, "m2");
		}
		other => panic!("unexpected member {other:?}"),
	}
	// Inherited instance field, likewise.
	match loader.get_member(sub_id, "a", None, true).unwrap() {
		MemberId::Field(fid) => assert_eq!(fid.class, module.classes[0].id),
		other => panic!("unexpected member {other:?}"),
	}
}

fn assert_same_structure(a: &Loader, a_id: ModuleId, b: &Loader, b_id: ModuleId) {
	let ma = a.module(a_id);
	let mb = b.module(b_id);
	assert_eq!(ma.name, mb.name);
	assert_eq!(ma.version, mb.version);
	assert_eq!(ma.timestamp, mb.timestamp);
	assert_eq!(ma.siblings, mb.siblings);
	assert_eq!(ma.aliases, mb.aliases);
	assert_eq!(ma.classes.len(), mb.classes.len());
	assert_eq!(ma.routines.len(), mb.routines.len());

	for (ca, cb) in ma.classes.iter().zip(&mb.classes) {
		assert_eq!(ca.name, cb.name);
		assert_eq!(ca.fields.len(), cb.fields.len());
		for (fa, fb) in ca.fields.iter().zip(&cb.fields) {
			assert_eq!(fa.name, fb.name);
			assert_eq!(fa.ty.to_jts(), fb.ty.to_jts());
		}
		let vfa = ca.vft.borrow();
		let vfb = cb.vft.borrow();
		assert_eq!(vfa.len(), vfb.len());
		for (x, y) in vfa.iter().zip(vfb.iter()) {
			assert_eq!(x.sig(), y.sig());
		}
		let ffa = ca.fft.borrow();
		let ffb = cb.fft.borrow();
		assert_eq!(ffa.len(), ffb.len());
		for (x, y) in ffa.iter().zip(ffb.iter()) {
			assert_eq!(x.path(), y.path());
		}
	}

	for (ra, rb) in ma.routines.iter().zip(&mb.routines) {
		assert_eq!(ra.name, rb.name);
		assert_eq!(ra.offset, rb.offset);
		assert_eq!(ra.param_types.to_jts(), rb.param_types.to_jts());
		assert_eq!(ra.return_type.to_jts(), rb.return_type.to_jts());
		let ia = ra.instructions.borrow();
		let ib = rb.instructions.borrow();
		assert_eq!(ia.len(), ib.len());
		for (x, y) in ia.iter().zip(ib.iter()) {
			assert_eq!(x.offset, y.offset);
			assert_eq!(x.opcode, y.opcode);
		}
		let ha = ra.handlers.borrow();
		let hb = rb.handlers.borrow();
		assert_eq!(ha.len(), hb.len());
		for (x, y) in ha.iter().zip(hb.iter()) {
			assert_eq!(x.scope, y.scope);
			assert_eq!(x.target, y.target);
		}
	}
}

#[test]
fn cache_round_trip_is_a_fix_point() {
	let dir = tempfile::tempdir().unwrap();
	let cache_dir = tempfile::tempdir().unwrap();
	write_module(dir.path(), "hier.cod", &build_module(&hierarchy_spec()).bytes);

	let mut loader = Loader::new(LoaderOptions {
		search_paths: vec![dir.path().to_path_buf()],
		cache_root: Some(cache_dir.path().to_path_buf()),
		..Default::default()
	})
	.unwrap();
	let id = loader.load_module("hier").unwrap();
	loader.actualize_module(id).unwrap();
	loader.disasm_module(id).unwrap();
	loader.save_module_cache(id).unwrap();

	let db_path = cache_dir.path().join("hier.cod.db");
	let first_db = std::fs::read(&db_path).unwrap();
	let first_class = std::fs::read(cache_dir.path().join("hier/Sub.cache")).unwrap();

	// A fresh loader with no search path must come up from the cache.
	let mut cached = Loader::new(LoaderOptions {
		search_paths: vec![cache_dir.path().to_path_buf()],
		cache_root: Some(cache_dir.path().to_path_buf()),
		..Default::default()
	})
	.unwrap();
	let cached_id = cached.load_module("hier").unwrap();
	assert!(cached.module(cached_id).is_disasmed());
	assert_same_structure(&loader, id, &cached, cached_id);

	// Serializing the deserialized module reproduces the blobs.
	cached.save_module_cache(cached_id).unwrap();
	assert_eq!(std::fs::read(&db_path).unwrap(), first_db);
	assert_eq!(std::fs::read(cache_dir.path().join("hier/Sub.cache")).unwrap(), first_class);
}

#[test]
fn exception_edges_inject_the_handler_class() {
	const OP_ATHROW: u8 = 188;
	let dir = tempfile::tempdir().unwrap();

	// Two-pass build: handler scopes are code-section-absolute.
	let make = |entry: u16| {
		let mut spec = ModuleSpec::new("thrower");
		let mut foo = ClassSpec::new("Foo");
		foo.virtuals.push(
			RoutineSpec::new("boom", vec![OP_ALOAD_0, OP_ATHROW, OP_ALOAD_0, OP_ATHROW])
				.params(raw_object(0))
				.handler(entry, entry + 2, entry + 2, (0, 0)),
		);
		spec.classes.push(foo);
		build_module(&spec)
	};
	let entry = make(0).routine_offset("boom");
	write_module(dir.path(), "thrower.cod", &make(entry).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("thrower").unwrap();
	loader.actualize_module(id).unwrap();
	loader.disasm_module(id).unwrap();
	let module = loader.module(id);

	let boom = &module.routines[0];
	{
		let handlers = boom.handlers.borrow();
		assert_eq!(handlers.len(), 1);
		assert_eq!(handlers[0].scope, (entry as u32, entry as u32 + 2));
		assert!(!handlers[0].is_finally());
	}

	let sub = Subroutine::build(boom).unwrap();
	assert_eq!(sub.blocks.len(), 2);
	let thrower = &sub.blocks[0];
	assert_eq!(thrower.exits.len(), 1);
	assert!(matches!(&thrower.exits[0].0, cordite::flow::EdgeLabel::Catch(name) if &**name == "Foo"));

	let mut scanner = HeuristicScanner::new(&mut loader);
	assert!(scanner.scan_routine(&module, 0));
	let instructions = boom.instructions.borrow();
	// The handler entry sees the thrown exception on the stack.
	assert_eq!(instructions[2].totos.as_ref().map(|t| t.to_jts()), Some("LFoo;".to_string()));
}

#[test]
fn type_checks_carry_array_tokens() {
	// A routine using a typecheck-array shape: instanceof_array carries a
	// `TypeToken` literal operand.
	let dir = tempfile::tempdir().unwrap();
	let mut spec = ModuleSpec::new("arrays");
	let mut foo = ClassSpec::new("Foo");
	// 189 = instanceof_array: dims byte, element code byte.
	foo.statics.push(
		RoutineSpec::new("probe", vec![OP_ICONST_0, 189, 2, 5, OP_IRETURN])
			.is_static()
			.returns(prim(PrimKind::Int)),
	);
	spec.classes.push(foo);
	write_module(dir.path(), "arrays.cod", &build_module(&spec).bytes);

	let mut loader = loader_for(dir.path());
	let id = loader.load_module("arrays").unwrap();
	loader.actualize_module(id).unwrap();
	loader.disasm_module(id).unwrap();
	let module = loader.module(id);
	let instructions = module.routines[0].instructions.borrow();
	let Operand::Type(token) = &instructions[1].operands[0] else {
		panic!("expected a type operand: {}", instructions[1]);
	};
	assert_eq!(
		token,
		&TypeToken::Array { dims: 2, elem: ArrayElem::Prim(PrimKind::Int) }
	);
}
