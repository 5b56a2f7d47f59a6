//! Labeled text dump of resolved modules.

use std::collections::BTreeSet;
use std::io::Write;

use cordite::errors::LoadError;
use cordite::resolve::{
	ClassAttrs, ClassDef, FieldAttrs, FieldDef, Loader, Module, ModuleId, RoutineAttrs, RoutineDef,
};

fn class_access(attrs: ClassAttrs) -> Vec<&'static str> {
	let mut parts = Vec::new();
	if attrs.contains(ClassAttrs::PUBLIC) {
		parts.push("public");
	}
	if attrs.contains(ClassAttrs::PRIVATE) {
		parts.push("private");
	}
	if attrs.contains(ClassAttrs::PROTECTED) {
		parts.push("protected");
	}
	if attrs.contains(ClassAttrs::FINAL) {
		parts.push("final");
	}
	if attrs.contains(ClassAttrs::ABSTRACT) {
		parts.push("abstract");
	}
	parts
}

fn routine_access(attrs: RoutineAttrs) -> Vec<&'static str> {
	let mut parts = Vec::new();
	if attrs.contains(RoutineAttrs::PUBLIC) {
		parts.push("public");
	}
	if attrs.contains(RoutineAttrs::PRIVATE) {
		parts.push("private");
	}
	if attrs.contains(RoutineAttrs::PROTECTED) {
		parts.push("protected");
	}
	if attrs.contains(RoutineAttrs::FINAL) {
		parts.push("final");
	}
	if attrs.contains(RoutineAttrs::STATIC) {
		parts.push("static");
	}
	if attrs.contains(RoutineAttrs::ABSTRACT) {
		parts.push("abstract");
	}
	parts
}

fn field_access(field: &FieldDef) -> Vec<&'static str> {
	let mut parts = Vec::new();
	if field.address.is_some() {
		parts.push("static");
	}
	if field.attrs.contains(FieldAttrs::PUBLIC) {
		parts.push("public");
	}
	if field.attrs.contains(FieldAttrs::PRIVATE) {
		parts.push("private");
	}
	if field.attrs.contains(FieldAttrs::PROTECTED) {
		parts.push("protected");
	}
	if field.attrs.contains(FieldAttrs::FINAL) {
		parts.push("final");
	}
	parts
}

fn class_header(class: &ClassDef) -> String {
	let mut parts: Vec<String> = class_access(class.attrs).into_iter().map(String::from).collect();
	if class.attrs.contains(ClassAttrs::INNER) {
		parts.push("[inner]".into());
	}
	parts.push(match class.is_interface() {
		true => "interface".into(),
		false => "class".into(),
	});
	parts.push(class.name.to_string());
	if !class.superclass.is_missing() {
		parts.push(format!("extends {}", class.superclass));
	}
	if !class.ifaces.is_empty() {
		let ifaces: Vec<String> = class.ifaces.iter().map(|i| i.to_string()).collect();
		parts.push(format!("implements {}", ifaces.join(", ")));
	}
	parts.join(" ")
}

/// A routine becomes synchronized when its body opens with a monitor
/// opcode; the flag is not in the attribute word.
fn is_synchronized(routine: &RoutineDef) -> bool {
	routine.instructions.borrow().iter().any(|i| {
		matches!(i.opcode, cordite::disasm::Opcode::synch | cordite::disasm::Opcode::synch_static)
	})
}

fn routine_header(loader: &Loader, class: &ClassDef, routine: &RoutineDef) -> String {
	let mut parts: Vec<String> = routine_access(routine.attrs).into_iter().map(String::from).collect();
	if is_synchronized(routine) {
		parts.push("synchronized".into());
	}
	parts.push(routine.return_jts());
	let jts = routine.jts(&class.name, false);
	let display = loader.display_routine_name(&jts, &routine.name).to_string();
	let params = match routine.is_static() {
		true => routine.param_types.to_jts(),
		false => routine.param_types.to_jts_skip_first(),
	};
	parts.push(format!("{display}({params})"));
	parts.join(" ")
}

pub fn dump_module(
	out: &mut impl Write,
	loader: &Loader,
	id: ModuleId,
	individual: bool,
) -> Result<(), LoadError> {
	let module = loader.module(id);
	write_module_header(out, &module, individual)?;

	for class in &module.classes {
		writeln!(out, "{} {{", class_header(class))?;
		for field in class.fields.iter().chain(&class.static_fields) {
			let path = format!("{}/{}", class.name, field.name);
			let display = loader.display_field_name(&path, &field.name);
			let access = field_access(field).join(" ");
			match access.is_empty() {
				true => writeln!(out, "    {} {display};", field.ty)?,
				false => writeln!(out, "    {access} {} {display};", field.ty)?,
			}
		}
		if !class.fields.is_empty() || !class.static_fields.is_empty() {
			writeln!(out)?;
		}

		for rindex in class.routine_indexes() {
			let routine = &module.routines[rindex];
			writeln!(out, "    {} {{", routine_header(loader, class, routine))?;
			write_instructions(out, routine)?;
			writeln!(out, "    }}")?;
		}
		writeln!(out, "}}")?;
		writeln!(out)?;
	}
	Ok(())
}

fn write_module_header(out: &mut impl Write, module: &Module, individual: bool) -> Result<(), LoadError> {
	if individual {
		writeln!(out, ";; {}", "=".repeat(60))?;
	}
	writeln!(out, ";; module {module} (timestamp {})", module.timestamp)?;
	if !module.siblings.is_empty() {
		writeln!(out, ";; siblings: {}", module.siblings.join(", "))?;
	}
	if !module.aliases.is_empty() {
		writeln!(out, ";; aliases: {}", module.aliases.join(", "))?;
	}
	if !module.imports.is_empty() {
		let imports: Vec<String> = module
			.imports
			.iter()
			.zip(&module.import_versions)
			.map(|(import, version)| format!("{} v. {version}", import.name))
			.collect();
		writeln!(out, ";; imports: {}", imports.join(", "))?;
	}
	for entry_point in &module.entry_points {
		writeln!(out, ";; entry point: {entry_point} @ {:#06x}", entry_point.offset)?;
	}
	for export in &module.exports {
		writeln!(out, ";; export: {export}")?;
	}
	writeln!(out)?;
	Ok(())
}

fn write_instructions(out: &mut impl Write, routine: &RoutineDef) -> Result<(), LoadError> {
	let instructions = routine.instructions.borrow();
	let handlers = routine.handlers.borrow();

	for handler in handlers.iter() {
		let name = match handler.is_finally() {
			true => "finally".to_string(),
			false => handler.class.to_string(),
		};
		writeln!(
			out,
			"        .catch {name} from loc_{} to loc_{} using loc_{}",
			handler.scope.0, handler.scope.1, handler.target
		)?;
	}

	let mut labels: BTreeSet<u32> = BTreeSet::new();
	for handler in handlers.iter() {
		labels.insert(handler.scope.0);
		labels.insert(handler.scope.1);
		labels.insert(handler.target);
	}
	for instr in instructions.iter() {
		labels.extend(instr.branch_locations());
	}

	for instr in instructions.iter() {
		if labels.contains(&instr.offset) {
			writeln!(out, "    loc_{}:", instr.offset)?;
		}
		writeln!(out, "        {:06}: {instr}", instr.offset)?;
	}
	Ok(())
}
