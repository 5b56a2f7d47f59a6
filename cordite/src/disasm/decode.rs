//! Shape-driven operand decoding.

use crate::errors::{DisasmError, ParseError};
use crate::reader::{Endian, Reader};
use crate::resolve::module::Module;
use crate::resolve::refs::ClassRef;
use crate::resolve::routine::RoutineDef;
use crate::types::{ArrayElem, PrimKind, TypeToken};

use super::opcodes::{Opcode, Shape, ESCAPE_BYTE};
use super::{Operand, RawInstruction};

fn array_elem_kind(code: u8, offset: u32) -> Result<PrimKind, DisasmError> {
	match PrimKind::from_repr(code) {
		Some(PrimKind::Void) | None => Err(DisasmError::Parse(ParseError::malformed(
			offset as usize,
			format!("bad array element type {code}"),
		))),
		Some(kind) => Ok(kind),
	}
}

fn unpack_array(blob: &[u8], kind: PrimKind, offset: u32) -> Result<Operand, DisasmError> {
	let size = match kind {
		PrimKind::Boolean | PrimKind::Byte | PrimKind::Char => 1,
		PrimKind::Short => 2,
		PrimKind::Int | PrimKind::Float => 4,
		PrimKind::Long | PrimKind::Double => 8,
		PrimKind::Void => unreachable!(),
	};
	if blob.len() % size != 0 {
		return Err(DisasmError::Parse(ParseError::malformed(
			offset as usize,
			"array initializer blob not a multiple of its element size",
		)));
	}
	let mut reader = Reader::with_endian(blob, Endian::Little);
	let count = blob.len() / size;
	Ok(match kind {
		PrimKind::Float => {
			let mut values = Vec::with_capacity(count);
			for _ in 0..count {
				values.push(f32::from_bits(reader.u32()?) as f64);
			}
			Operand::Reals(values.into())
		}
		PrimKind::Double => {
			let mut values = Vec::with_capacity(count);
			for _ in 0..count {
				values.push(f64::from_bits(reader.i64()? as u64));
			}
			Operand::Reals(values.into())
		}
		PrimKind::Short => {
			let mut values = Vec::with_capacity(count);
			for _ in 0..count {
				values.push(reader.i16()? as i64);
			}
			Operand::Ints(values.into())
		}
		PrimKind::Int => {
			let mut values = Vec::with_capacity(count);
			for _ in 0..count {
				values.push(reader.i32()? as i64);
			}
			Operand::Ints(values.into())
		}
		PrimKind::Long => {
			let mut values = Vec::with_capacity(count);
			for _ in 0..count {
				values.push(reader.i64()?);
			}
			Operand::Ints(values.into())
		}
		// Boolean, byte, and char initializers are all stored as bytes.
		_ => {
			let mut values = Vec::with_capacity(count);
			for _ in 0..count {
				values.push(reader.i8()? as i64);
			}
			Operand::Ints(values.into())
		}
	})
}

/// Decode a routine's raw code into instructions with unfixed operands.
pub fn disassemble(routine: &RoutineDef, module: &Module) -> Result<Vec<RawInstruction>, DisasmError> {
	let code_start = routine.offset;
	let is_brittle = module.is_brittle();
	let mut reader = Reader::with_endian(&routine.code, Endian::Little);
	let mut out = Vec::new();

	let mut escape = 0u16;
	let mut offset = 0u32;
	loop {
		if escape == 0 {
			offset = reader.tell() as u32;
		}
		let byte = match reader.u8() {
			Ok(byte) => byte,
			Err(ParseError::EndOfInput { .. }) => break,
			Err(err) => return Err(err.into()),
		};
		if byte == ESCAPE_BYTE && escape == 0 {
			escape = 256;
			continue;
		}
		let ordinal = byte as u16 + escape;
		escape = 0;

		let opcode = Opcode::from_repr(ordinal).ok_or(DisasmError::BadOpcode {
			opcode: ordinal,
			offset: code_start + offset,
		})?;

		let abs = |rel: i64| (code_start as i64 + offset as i64 + rel + 1) as u32;
		let here = |reader: &Reader| reader.tell() as u32 + code_start;

		let mut fixups: Vec<Option<u32>> = Vec::new();
		let ops: Vec<Operand> = match opcode.shape() {
			Shape::None => Vec::new(),
			Shape::Bad => {
				return Err(DisasmError::BadOpcode { opcode: ordinal, offset: code_start + offset })
			}
			Shape::BranchNear => {
				let rel = reader.i8()? as i64;
				vec![Operand::Branch(abs(rel))]
			}
			Shape::BranchFar => {
				let rel = reader.i16()? as i64;
				vec![Operand::Branch(abs(rel))]
			}
			Shape::BranchUp => {
				let rel = -(reader.u16()? as i64);
				vec![Operand::Branch(abs(rel))]
			}
			Shape::BranchDown => {
				let rel = reader.u16()? as i64;
				vec![Operand::Branch(abs(rel))]
			}
			Shape::UByte => vec![Operand::Int(reader.u8()? as i64)],
			Shape::SByte => vec![Operand::Int(reader.i8()? as i64)],
			Shape::SWord => vec![Operand::Int(reader.i16()? as i64)],
			Shape::UWord => vec![Operand::Int(reader.u16()? as i64)],
			Shape::SInt => vec![Operand::Int(reader.i32()? as i64)],
			Shape::SLong => vec![Operand::Int(reader.i64()?)],
			Shape::StringArrayInit => {
				let count = reader.u16()? as usize;
				let mut strings = Vec::with_capacity(count);
				for _ in 0..count {
					let lit_offset = reader.u16()?;
					strings.push(module.pool.get_lit(lit_offset, false, true)?);
				}
				vec![Operand::Strs(strings.into())]
			}
			Shape::ArrayInit => {
				let kind = array_elem_kind(reader.u8()?, code_start + offset)?;
				let length = reader.u16()? as usize;
				let blob = module.pool.get_blob(reader.u16()?, length)?;
				vec![Operand::PrimType(kind), unpack_array(&blob, kind, code_start + offset)?]
			}
			Shape::Constraints => {
				vec![
					Operand::Int(reader.u8()? as i64),
					Operand::Int(reader.u8()? as i64),
					Operand::Int(reader.u8()? as i64),
				]
			}
			Shape::TableSwitch => {
				let count = reader.u16()? as usize;
				let base = reader.i32()?;
				let targets = reader.array_fixed(count, |r| r.i16())?;
				vec![Operand::Int(count as i64), Operand::Int(base as i64), Operand::Targets(targets.into())]
			}
			Shape::LookupSwitch { short_keys } => {
				let count = reader.u16()? as usize;
				let mut pairs = Vec::with_capacity(count);
				for _ in 0..count {
					let key = match short_keys {
						true => reader.i16()? as i32,
						false => reader.i32()?,
					};
					pairs.push((key, reader.i16()?));
				}
				let default = reader.i16()?;
				vec![Operand::Int(count as i64), Operand::Pairs(pairs.into()), Operand::Int(default as i64)]
			}
			Shape::TwoByte => {
				vec![Operand::Int(reader.u8()? as i64), Operand::Int(reader.i8()? as i64)]
			}
			Shape::TwoWord => {
				vec![Operand::Int(reader.u16()? as i64), Operand::Int(reader.i16()? as i64)]
			}
			Shape::ClassFieldRef { extra } => {
				fixups = vec![Some(here(&reader)), None];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let class_byte = reader.u8()?;
				let address = reader.u16()?;
				vec![Operand::Class(ClassRef::raw(mod_byte, class_byte)), Operand::Int(address as i64)]
			}
			Shape::RelFieldRef { far } => {
				fixups = vec![Some(here(&reader))];
				let slot = match (is_brittle, far) {
					(true, _) => reader.u8()? as i64,
					(false, false) => reader.i8()? as i64,
					(false, true) => reader.i8()? as i64 + 256,
				};
				vec![Operand::Int(slot)]
			}
			Shape::InvokeStatic { extra } => {
				fixups = vec![Some(here(&reader))];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let class_byte = reader.u8()?;
				let word = reader.u16()?;
				vec![Operand::CallRef { mod_byte, class_byte: Some(class_byte), word }]
			}
			Shape::InvokeNative => {
				vec![Operand::Int(reader.u8()? as i64), Operand::Int(reader.u16()? as i64)]
			}
			Shape::JumpSpecial { extra } => {
				fixups = vec![Some(here(&reader))];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let word = reader.u16()?;
				vec![Operand::CallRef { mod_byte, class_byte: None, word }]
			}
			Shape::InvokeSpecial { extra } => {
				fixups = vec![Some(here(&reader)), None];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let word = reader.u16()?;
				let local_count = reader.u8()?;
				vec![
					Operand::CallRef { mod_byte, class_byte: None, word },
					Operand::Int(local_count as i64),
				]
			}
			Shape::InvokeVirtual => {
				fixups = vec![Some(here(&reader)), None];
				let slot = reader.i16()? as i64;
				let local_count = reader.u8()?;
				vec![Operand::VirtualSlot(slot), Operand::Int(local_count as i64)]
			}
			Shape::InvokeVirtualShort => {
				let bits = reader.u8()?;
				vec![Operand::VirtualSlot((bits >> 2) as i64), Operand::Int((bits & 3) as i64 + 1)]
			}
			Shape::InvokeInterface => {
				vec![
					Operand::Int(reader.u16()? as i64),
					Operand::Int(reader.u8()? as i64),
					Operand::Int(reader.u16()? as i64),
				]
			}
			Shape::Ldc { unicode } => {
				if unicode {
					let _encoding_hint = reader.u16()?;
				}
				let lit_offset = reader.u16()?;
				vec![Operand::Lit(module.pool.get_lit(lit_offset, unicode, true)?)]
			}
			Shape::ClassRefOp { extra } => {
				fixups = vec![Some(here(&reader))];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let class_byte = reader.u8()?;
				vec![Operand::Class(ClassRef::raw(mod_byte, class_byte))]
			}
			Shape::ClassRefCheck { extra } => {
				fixups = vec![Some(here(&reader)), None];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let class_byte = reader.u8()?;
				let dims = reader.u8()?;
				vec![Operand::Class(ClassRef::raw(mod_byte, class_byte)), Operand::Int(dims as i64)]
			}
			Shape::NewArray => {
				vec![Operand::PrimType(array_elem_kind(reader.u8()?, code_start + offset)?)]
			}
			Shape::MultiNewArray => {
				let given = reader.u8()?;
				let dims = reader.u8()?;
				let kind = array_elem_kind(reader.u8()?, code_start + offset)?;
				vec![Operand::Int(given as i64), Operand::Int(dims as i64), Operand::PrimType(kind)]
			}
			Shape::MultiNewArrayObj { extra } => {
				fixups = vec![Some(here(&reader)), None, None];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let class_byte = reader.u8()?;
				let given = reader.u8()?;
				let dims = reader.u8()?;
				vec![
					Operand::Class(ClassRef::raw(mod_byte, class_byte)),
					Operand::Int(given as i64),
					Operand::Int(dims as i64),
				]
			}
			Shape::CheckCastBranch { extra } => {
				fixups = vec![Some(here(&reader)), None];
				let mod_byte = if extra { reader.u8()? } else { 0 };
				let class_byte = reader.u8()?;
				let rel = reader.i16()?;
				vec![Operand::Class(ClassRef::raw(mod_byte, class_byte)), Operand::Int(rel as i64)]
			}
			Shape::TypeCheckArray { branch } => {
				let dims = reader.u8()?;
				let code = reader.u8()?;
				let token = TypeToken::Array {
					dims,
					elem: ArrayElem::Prim(array_elem_kind(code, code_start + offset)?),
				};
				match branch {
					true => vec![Operand::Type(token), Operand::Int(reader.i16()? as i64)],
					false => vec![Operand::Type(token)],
				}
			}
		};

		while fixups.len() < ops.len() {
			fixups.push(None);
		}
		out.push(RawInstruction { offset: offset + code_start, opcode, ops, fixups });
	}

	Ok(out)
}
