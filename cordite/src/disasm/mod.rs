//! Bytecode disassembly: the labeled instruction stream and operand fixup.

pub mod decode;
pub mod opcodes;

pub use decode::disassemble;
pub use opcodes::{Opcode, Shape, ESCAPE_BYTE};

use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use tracing::warn;

use crate::resolve::loader::Loader;
use crate::resolve::module::{FixupTarget, Module};
use crate::resolve::refs::{ClassRef, FieldRef, MethodRef};
use crate::types::{PrimKind, TypeToken};

/// A decoded operand. Reference operands start out raw (numeric slots or
/// `(mod_byte, class_byte)` tuples) and are narrowed by the fixup pass and
/// the heuristic scanner.
#[derive(Clone, Debug)]
pub enum Operand {
	Int(i64),
	Lit(Rc<str>),
	Class(ClassRef),
	Field(FieldRef),
	Method(MethodRef),
	/// Relative field slot left for runtime fixup; the scanner patches it
	/// through the receiver's field-lookup table.
	FieldSlot(i64),
	/// Virtual-table slot left for runtime fixup.
	VirtualSlot(i64),
	/// Unresolved call tuple `(mod_byte, class_byte?, word)`.
	CallRef { mod_byte: u8, class_byte: Option<u8>, word: u16 },
	Type(TypeToken),
	PrimType(PrimKind),
	/// Absolute branch target in code-section coordinates.
	Branch(u32),
	/// Relative switch targets, resolved through the stride formulas.
	Targets(Rc<[i16]>),
	/// `(key, relative target)` pairs of a lookup switch.
	Pairs(Rc<[(i32, i16)]>),
	Ints(Rc<[i64]>),
	Reals(Rc<[f64]>),
	Strs(Rc<[Rc<str>]>),
	Bad(Rc<str>),
}

impl Display for Operand {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Self::Int(v) | Self::FieldSlot(v) | Self::VirtualSlot(v) => write!(f, "{v}"),
			Self::Lit(s) => write!(f, "{s:?}"),
			Self::Class(c) => write!(f, "{c}"),
			Self::Field(x) => write!(f, "{x}"),
			Self::Method(m) => write!(f, "{m}"),
			Self::CallRef { mod_byte, class_byte: Some(c), word } => {
				write!(f, "({mod_byte}:{c}:{word})")
			}
			Self::CallRef { mod_byte, class_byte: None, word } => write!(f, "({mod_byte}:{word})"),
			Self::Type(t) => write!(f, "{t}"),
			Self::PrimType(p) => write!(f, "{p}"),
			Self::Branch(o) => write!(f, "{o}"),
			Self::Targets(ts) => write!(f, "{ts:?}"),
			Self::Pairs(ps) => write!(f, "{ps:?}"),
			Self::Ints(vs) => write!(f, "{vs:?}"),
			Self::Reals(vs) => write!(f, "{vs:?}"),
			Self::Strs(vs) => {
				write!(f, "[")?;
				for (i, s) in vs.iter().enumerate() {
					if i > 0 {
						write!(f, ", ")?;
					}
					write!(f, "{s:?}")?;
				}
				write!(f, "]")
			}
			Self::Bad(msg) => write!(f, "ERROR({msg})"),
		}
	}
}

/// A disassembled instruction. `totos` is the type observed on top of the
/// stack immediately before the instruction executes, filled in by the
/// heuristic scanner.
#[derive(Clone, Debug)]
pub struct Instruction {
	pub offset: u32,
	pub opcode: Opcode,
	pub operands: Vec<Operand>,
	pub totos: Option<TypeToken>,
}

impl Instruction {
	/// Absolute code-section offsets of every control-flow successor this
	/// instruction may branch to (not counting fall-through).
	pub fn branch_locations(&self) -> Vec<u32> {
		let op = self.opcode;
		let rel = |operand: &Operand| -> i64 {
			match operand {
				Operand::Int(v) => *v,
				_ => 0,
			}
		};

		if op.is_branch() {
			if let Some(Operand::Branch(target)) = self.operands.last() {
				return vec![*target];
			}
		} else if op.is_conditional_branch() {
			if op == Opcode::checkcastbranch {
				let target = self.offset as i64 + rel(self.operands.last().unwrap()) + 2;
				return vec![target as u32];
			}
			if matches!(op, Opcode::checkcastbranch_lib | Opcode::checkcastbranch_array) {
				let target = self.offset as i64 + rel(self.operands.last().unwrap()) + 3;
				return vec![target as u32];
			}
			if let Some(Operand::Branch(target)) = self.operands.last() {
				return vec![*target];
			}
		} else if op == Opcode::tableswitch {
			if let Some(Operand::Targets(targets)) = self.operands.last() {
				return targets
					.iter()
					.enumerate()
					.map(|(j, t)| (self.offset as i64 + 7 + 2 * j as i64 + *t as i64) as u32)
					.collect();
			}
		} else if matches!(op, Opcode::lookupswitch | Opcode::lookupswitch_short) {
			let (header, stride) = match op == Opcode::lookupswitch {
				true => (7i64, 6i64),
				false => (5i64, 4i64),
			};
			let count = match self.operands.first() {
				Some(Operand::Int(n)) => *n,
				_ => 0,
			};
			let (Some(Operand::Pairs(pairs)), Some(default)) =
				(self.operands.get(1), self.operands.last())
			else {
				return Vec::new();
			};
			let mut locations = Vec::with_capacity(pairs.len() + 1);
			locations.push((self.offset as i64 + 3 + stride * count + rel(default)) as u32);
			for (j, (_, target)) in pairs.iter().enumerate() {
				locations.push((self.offset as i64 + header + stride * j as i64 + *target as i64) as u32);
			}
			return locations;
		}
		Vec::new()
	}
}

impl Display for Instruction {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(self.opcode.mnemonic())?;
		for operand in &self.operands {
			write!(f, " {operand}")?;
		}
		if let Some(totos) = &self.totos {
			write!(f, " ; {}", totos.to_jts())?;
		}
		Ok(())
	}
}

/// An instruction fresh out of the decoder: raw operands plus the code
/// offset of each operand slot a fixup may land on.
#[derive(Clone, Debug)]
pub struct RawInstruction {
	pub offset: u32,
	pub opcode: Opcode,
	pub ops: Vec<Operand>,
	pub fixups: Vec<Option<u32>>,
}

fn target_operand(target: FixupTarget) -> Operand {
	match target {
		FixupTarget::Field(field) => Operand::Field(field),
		FixupTarget::Method(method) => Operand::Method(method),
		FixupTarget::Class(class) => Operand::Class(class),
		FixupTarget::ModByte(byte) => Operand::Int(byte as i64),
	}
}

impl RawInstruction {
	/// Substitute fixup targets for raw operands, falling back to the
	/// opcode-specific lookup paths when no recorded fixup covers a slot.
	pub fn fixup(self, loader: &mut Loader, module: &Module) -> Instruction {
		let RawInstruction { offset, opcode, mut ops, fixups } = self;

		let mut fixed = vec![false; ops.len()];
		let mut num_fixed = 0usize;
		for (i, slot) in fixups.iter().enumerate() {
			let Some(code_offset) = slot else { continue };
			if *code_offset == 0 {
				continue;
			}
			if let Some(target) = module.fixup_target(*code_offset) {
				ops[i] = target_operand(target);
				fixed[i] = true;
				num_fixed += 1;
			}
		}

		if num_fixed == ops.len() {
			return Instruction { offset, opcode, operands: ops, totos: None };
		}

		match opcode.shape() {
			Shape::ClassFieldRef { .. } if !fixed[0] => {
				let Operand::Int(address) = ops[1] else { unreachable!() };
				let raw = match &ops[0] {
					Operand::Class(class) => class.clone(),
					_ => ClassRef::bad(0, 0),
				};
				let patched = fix_class_fieldref(loader, module, &raw, address as u16);
				match patched {
					Ok(Some(operand)) => ops[0] = operand,
					Ok(None) => {}
					Err(reason) => {
						warn!("failed to fixup class-fieldref @ {offset}: {reason}");
						ops[0] = Operand::Bad(reason.into());
					}
				}
			}
			Shape::RelFieldRef { .. } if !fixed[0] => {
				let Operand::Int(slot) = ops[0] else { unreachable!() };
				if slot < -1 {
					let findex = (-(slot + 2)) as usize;
					ops[0] = match module.field_fixups.get(findex) {
						Some(entry) => match entry.item() {
							Some(target) => target_operand(target),
							None => Operand::Bad(format!("unresolved field fixup {findex}").into()),
						},
						// Not in the fixup list; leave for runtime fixup.
						None => Operand::FieldSlot(slot & 0xff),
					};
				} else {
					ops[0] = Operand::FieldSlot(slot);
				}
			}
			Shape::InvokeStatic { .. } | Shape::JumpSpecial { .. } | Shape::InvokeSpecial { .. }
				if !fixed[0] =>
			{
				let Operand::CallRef { mod_byte, class_byte, word } = ops[0] else { unreachable!() };
				match fix_call(loader, module, mod_byte, class_byte, word) {
					Ok(operand) => ops[0] = operand,
					Err(reason) => {
						warn!("{reason}");
						ops[0] = Operand::Bad(reason.into());
					}
				}
			}
			Shape::InvokeVirtual | Shape::InvokeVirtualShort if !fixed[0] => {
				let Operand::VirtualSlot(slot) = ops[0] else { unreachable!() };
				if slot < -1 {
					let mindex = (-(slot + 2)) as usize;
					match module.virtual_method_fixups.get(mindex).and_then(|e| e.item()) {
						Some(target) => ops[0] = target_operand(target),
						None => {
							warn!("bad_vmethod_fixup[{slot}:{mindex}]");
							ops[0] = Operand::VirtualSlot(slot);
						}
					}
				}
				// Non-negative slots wait for the heuristic scanner.
			}
			Shape::ClassRefOp { .. } | Shape::ClassRefCheck { .. } | Shape::CheckCastBranch { .. }
				if !fixed[0] =>
			{
				if let Operand::Class(class) = ops[0].clone() {
					ops[0] = Operand::Class(loader.resolve_class_ref(module, &class));
				}
			}
			Shape::InvokeInterface => {
				let Operand::Int(imref_offset) = ops[0] else { unreachable!() };
				match loader.iface_method(module, imref_offset as u32) {
					Ok(method) => ops[0] = Operand::Method(method),
					Err(err) => {
						warn!("bad_ifacemethod_fixup[{imref_offset}]");
						ops[0] = Operand::Bad(err.to_string().into());
					}
				}
			}
			Shape::MultiNewArrayObj { .. } if !fixed[0] => {
				if let Operand::Class(class) = ops[0].clone() {
					ops[0] = Operand::Class(loader.resolve_class_ref(module, &class));
				}
			}
			_ => {}
		}

		Instruction { offset, opcode, operands: ops, totos: None }
	}
}

fn fix_class_fieldref(
	loader: &mut Loader,
	module: &Module,
	class: &ClassRef,
	address: u16,
) -> Result<Option<Operand>, String> {
	use crate::resolve::refs::ClassSlot;

	let (mod_byte, _) = match class.slot() {
		ClassSlot::Raw(m, c) => (m, c),
		_ => return Ok(None),
	};
	if mod_byte == 255 {
		// Indexed lookup in the static-field fixup table.
		let entry = module
			.static_field_fixups
			.get(address as usize)
			.ok_or_else(|| format!("static field fixup index {address} out of range"))?;
		let target = entry.item().ok_or_else(|| format!("unresolved static field fixup {address}"))?;
		return Ok(Some(target_operand(target)));
	}

	// Address lookup on the referenced class.
	let resolved = loader.resolve_class_ref(module, class);
	let Some(class_id) = resolved.id() else {
		return Err(format!("unresolvable class for static field @ {address:#06x}"));
	};
	let owner = loader.module(class_id.module);
	let class_def = &owner.classes[class_id.index];
	match class_def.static_field_by_address(address) {
		Some(field_id) => Ok(Some(Operand::Field(loader.field_ref_for(field_id)))),
		// Leave the numeric address; the static field is unknown.
		None => Ok(None),
	}
}

fn fix_call(
	loader: &mut Loader,
	module: &Module,
	mod_byte: u8,
	class_byte: Option<u8>,
	word: u16,
) -> Result<Operand, String> {
	let bad = || {
		format!(
			"bad_call_ref[{mod_byte}:{}:{word}]",
			class_byte.map(|c| c.to_string()).unwrap_or_default()
		)
	};

	if mod_byte == 255 {
		// Indexed lookup in the method fixup table.
		let entry = module.method_fixups.get(word as usize).ok_or_else(bad)?;
		return entry.item().map(target_operand).ok_or_else(bad);
	}
	if mod_byte == 0 {
		let index = module.routine_index_at(word as u32).ok_or_else(bad)?;
		let id = module.routines[index].id;
		return Ok(Operand::Method(loader.method_ref_for(id)));
	}
	if (mod_byte as usize) <= module.imports.len() {
		let import = &module.imports[mod_byte as usize - 1];
		let import_id = match import.id() {
			Some(id) => id,
			None => loader.load_module(&import.name).map_err(|_| bad())?,
		};
		let imported = loader.module(import_id);
		let index = imported.routine_index_at(word as u32).ok_or_else(bad)?;
		let id = imported.routines[index].id;
		return Ok(Operand::Method(loader.method_ref_for(id)));
	}
	if !module.disk {
		// Heap-mode module remapping, keyed by the raw mod byte.
		let remapped = module.mod_remap_get(mod_byte).ok_or_else(bad)?;
		let imported = loader.module(remapped);
		let index = imported.routine_index_at(word as u32).ok_or_else(bad)?;
		let id = imported.routines[index].id;
		return Ok(Operand::Method(loader.method_ref_for(id)));
	}
	Err(bad())
}
