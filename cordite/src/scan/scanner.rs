//! Worklist scheduling, join computation, and the per-opcode transfer
//! functions.

use std::rc::Rc;

use fxhash::FxHashSet;
use tracing::{debug, warn};

use crate::disasm::{Instruction, Opcode, Operand};
use crate::errors::ScanError;
use crate::flow::{EdgeLabel, Subroutine};
use crate::resolve::loader::Loader;
use crate::resolve::module::Module;
use crate::resolve::refs::{ClassRef, FieldId, MethodRef, RefScope};
use crate::scan::{ScanStats, TypeStack, GLOBAL_MAX_RESCAN};
use crate::types::{ArrayElem, PrimKind, TypeList, TypeToken, STRING_CLASS};

const LOCAL_SLOTS: usize = 256;
const THROWABLE: &str = "java/lang/Throwable";

#[derive(Default)]
struct BlockState {
	exit_stack: Option<Vec<TypeToken>>,
	exit_locals: Option<Vec<TypeToken>>,
	start_stack: Option<Vec<TypeToken>>,
	start_locals: Option<Vec<TypeToken>>,
	scan_count: u32,
}

/// Scans routines against a loader, patching unresolved operands in place
/// and recording per-session counters.
pub struct HeuristicScanner<'l> {
	loader: &'l mut Loader,
	stats: ScanStats,
	reals: bool,
}

impl<'l> HeuristicScanner<'l> {
	pub fn new(loader: &'l mut Loader) -> Self {
		Self { loader, stats: ScanStats::default(), reals: false }
	}

	pub fn stats(&self) -> &ScanStats {
		&self.stats
	}

	pub fn into_stats(self) -> ScanStats {
		self.stats
	}

	/// Scan every routine in a module; returns the number that failed.
	pub fn scan_module(&mut self, module: &Rc<Module>) -> usize {
		let mut failed = 0;
		for index in 0..module.routines.len() {
			if !self.scan_routine(module, index) {
				failed += 1;
			}
		}
		failed
	}

	/// Scan one routine, retrying the whole walk up to three times before
	/// marking it unscannable. Returns whether the scan converged.
	pub fn scan_routine(&mut self, module: &Rc<Module>, routine_index: usize) -> bool {
		let routine = &module.routines[routine_index];
		let class_name = routine
			.parent
			.map(|cid| self.loader.class_name(cid).to_string())
			.unwrap_or_default();
		let name = routine.jts(&class_name, false);
		self.stats.subs += 1;

		let sub = match Subroutine::build(routine) {
			Ok(sub) => sub,
			Err(err) => {
				warn!("ERROR: {err} (aborting scan of '{name}' in {})", module.name);
				self.stats.failed_subs.push(name);
				return false;
			}
		};

		let mut tries_left = 3;
		loop {
			match self.scan_attempt(module, routine_index, &sub) {
				Ok(()) => return true,
				Err(err) if tries_left > 0 => {
					tries_left -= 1;
					warn!("attempting rescan ({tries_left} tries left): {err}");
				}
				Err(err) => {
					warn!("ERROR: {err} (aborting scan of '{name}' in {})", module.name);
					self.stats.failed_subs.push(name);
					return false;
				}
			}
		}
	}

	fn scan_attempt(
		&mut self,
		module: &Rc<Module>,
		routine_index: usize,
		sub: &Subroutine,
	) -> Result<(), ScanError> {
		let routine = &module.routines[routine_index];
		let entry = sub
			.entry_block()
			.ok_or_else(|| ScanError::Aborted("no initial basic block".into()))?;

		let mut states: Vec<BlockState> = (0..sub.blocks.len()).map(|_| BlockState::default()).collect();
		let mut visited: FxHashSet<usize> = FxHashSet::default();
		let mut failed: FxHashSet<usize> = FxHashSet::default();
		let mut candidates: Vec<usize> = vec![entry];
		self.reals = false;

		let mut last_error: Option<ScanError> = None;
		while !candidates.is_empty() {
			let Some(block) = self.next_block(sub, routine, &mut candidates, &visited, &failed, &states)
			else {
				break;
			};

			states[block].scan_count += 1;
			if states[block].scan_count > GLOBAL_MAX_RESCAN {
				return Err(ScanError::MaxRescanExceeded {
					block: sub.offsets[sub.blocks[block].first_instruction()],
				});
			}
			failed.remove(&block);

			let (mut stack, mut locals) = match sub.blocks[block].is_entry {
				true => {
					// Parameter types pre-populate the locals; the receiver
					// sits in slot 0 for non-static routines.
					let mut locals = vec![TypeToken::Wildcard; LOCAL_SLOTS];
					let mut index = 0;
					for ptype in routine.param_types.iter() {
						if index >= LOCAL_SLOTS {
							break;
						}
						locals[index] = ptype.clone();
						if ptype.slots() == 2 {
							if index + 1 < LOCAL_SLOTS {
								locals[index + 1] = ptype.clone();
							}
							index += 2;
						} else {
							index += 1;
						}
					}
					(TypeStack::new(), locals)
				}
				false => {
					let stack = self.starting_stack(sub, routine, block, &states);
					let locals = self.starting_locals(sub, block, &states);
					states[block].start_stack = Some(stack.0.clone());
					states[block].start_locals = Some(locals.clone());
					(stack, locals)
				}
			};

			debug!("walking block {} with {stack}", sub.offsets[sub.blocks[block].first_instruction()]);
			match self.walk_block(module, routine_index, sub, block, &mut stack, &mut locals) {
				Ok(()) => {
					states[block].exit_stack = Some(stack.0);
					states[block].exit_locals = Some(locals);
					visited.insert(block);

					let mut next: Vec<usize> =
						sub.blocks[block].exits.iter().map(|(_, b)| *b).collect();
					next.extend(candidates.iter().copied());
					next.extend(failed.iter().copied());
					next.sort_by_key(|b| sub.offsets[sub.blocks[*b].first_instruction()]);
					next.dedup();
					candidates = next;
				}
				Err(err) => {
					debug!("block failed: {err}");
					failed.insert(block);
					candidates.push(block);
					if candidates.iter().all(|c| failed.contains(c)) {
						return Err(err);
					}
					last_error = Some(err);
				}
			}
		}

		if !failed.is_empty() {
			return Err(last_error.unwrap_or_else(|| {
				ScanError::Aborted("exhausted candidates with failed basic blocks".into())
			}));
		}
		Ok(())
	}

	/// Pick the next block: first a scanned block whose parents now give a
	/// strictly more informative start state, then an unscanned block with
	/// every parent scanned, then the first unscanned block in order.
	fn next_block(
		&mut self,
		sub: &Subroutine,
		routine: &crate::resolve::RoutineDef,
		candidates: &mut Vec<usize>,
		visited: &FxHashSet<usize>,
		failed: &FxHashSet<usize>,
		states: &[BlockState],
	) -> Option<usize> {
		let mut rescan: Option<usize> = None;
		for pos in 0..candidates.len() {
			let c = candidates[pos];
			if visited.contains(&c) || failed.contains(&c) {
				let merged_stack = self.starting_stack(sub, routine, c, states);
				let merged_locals = self.starting_locals(sub, c, states);
				let stack_changed = states[c].start_stack.as_ref() != Some(&merged_stack.0);
				let locals_changed = states[c].start_locals.as_ref() != Some(&merged_locals);
				if stack_changed || locals_changed {
					debug!("rescanning block with better type info");
					rescan = Some(pos);
					break;
				}
			}
		}
		if let Some(pos) = rescan {
			return Some(candidates.remove(pos));
		}

		let mut keep = Vec::with_capacity(candidates.len());
		let mut selected = None;
		for c in candidates.iter().copied() {
			if selected.is_some() {
				keep.push(c);
				continue;
			}
			if visited.contains(&c) {
				continue;
			}
			if !failed.contains(&c) {
				let parents = &sub.blocks[c].entries;
				if parents.iter().all(|(_, p)| visited.contains(p)) {
					selected = Some(c);
					continue;
				}
			}
			keep.push(c);
		}
		*candidates = keep;
		if selected.is_some() {
			return selected;
		}

		while !candidates.is_empty() {
			let c = candidates.remove(0);
			if !visited.contains(&c) && !failed.contains(&c) {
				return Some(c);
			}
		}
		None
	}

	/// Candidate starting stacks from parent exits, transformed per edge:
	/// exception edges inject the exception class; the failed side of a
	/// checkcast branch pops the parent's top.
	fn parent_stacks(
		&mut self,
		sub: &Subroutine,
		routine: &crate::resolve::RoutineDef,
		block: usize,
		states: &[BlockState],
	) -> Vec<Vec<TypeToken>> {
		let mut stacks = Vec::new();
		for (label, parent) in &sub.blocks[block].entries {
			match label {
				EdgeLabel::Catch(name) => {
					stacks.push(vec![class_token(name)]);
				}
				EdgeLabel::Finally => {
					stacks.push(vec![class_token(THROWABLE)]);
				}
				_ => {
					let Some(exit) = &states[*parent].exit_stack else { continue };
					let pops_cast = *label == EdgeLabel::False && {
						let last = *sub.blocks[*parent].instructions.last().unwrap();
						routine.instructions.borrow()[last].opcode.is_checkcast_branch()
					};
					match pops_cast {
						true => stacks.push(exit[..exit.len().saturating_sub(1)].to_vec()),
						false => stacks.push(exit.clone()),
					}
				}
			}
		}
		stacks
	}

	fn starting_stack(
		&mut self,
		sub: &Subroutine,
		routine: &crate::resolve::RoutineDef,
		block: usize,
		states: &[BlockState],
	) -> TypeStack {
		let stacks = self.parent_stacks(sub, routine, block, states);
		TypeStack(self.merge_lists(&stacks))
	}

	fn starting_locals(&mut self, sub: &Subroutine, block: usize, states: &[BlockState]) -> Vec<TypeToken> {
		let locals: Vec<Vec<TypeToken>> = sub.blocks[block]
			.entries
			.iter()
			.filter_map(|(_, parent)| states[*parent].exit_locals.clone())
			.collect();
		self.merge_lists(&locals)
	}

	/// Element-wise join of stacks or locals arrays. Length mismatches and
	/// incompatible element types degrade to the most-specific/most-common
	/// candidate rather than aborting.
	fn merge_lists(&mut self, lists: &[Vec<TypeToken>]) -> Vec<TypeToken> {
		let lists: Vec<&Vec<TypeToken>> = lists.iter().filter(|l| !l.is_empty()).collect();
		if lists.is_empty() {
			return Vec::new();
		}
		let uniform = lists.iter().all(|l| l.len() == lists[0].len());
		if !uniform {
			warn!("merging type lists of unequal length; taking most common per slot");
		}
		let max_len = lists.iter().map(|l| l.len()).max().unwrap_or(0);
		let mut merged = Vec::with_capacity(max_len);
		for i in 0..max_len {
			let column: Vec<TypeToken> =
				lists.iter().filter_map(|l| l.get(i)).cloned().collect();
			let joined = match uniform {
				true => match self.loader.join_tokens(&column) {
					Ok(token) => Some(token),
					Err(_) => {
						warn!("incompatible types at merge slot {i}; taking most common");
						self.loader.join_tokens_no_fail(&column)
					}
				},
				false => self.loader.join_tokens_no_fail(&column),
			};
			merged.push(joined.unwrap_or(TypeToken::Wildcard));
		}
		merged
	}

	fn walk_block(
		&mut self,
		module: &Rc<Module>,
		routine_index: usize,
		sub: &Subroutine,
		block: usize,
		stack: &mut TypeStack,
		locals: &mut Vec<TypeToken>,
	) -> Result<(), ScanError> {
		let routine = &module.routines[routine_index];
		for i in sub.blocks[block].instructions.clone() {
			let instr = routine.instructions.borrow()[i].clone();

			// A prefix, not an instruction: the next integer push or
			// load reads as its IEEE-754 reinterpretation.
			if instr.opcode == Opcode::isreal {
				self.reals = true;
				continue;
			}

			routine.instructions.borrow_mut()[i].totos = stack.top().cloned();
			self.stats.codes += 1;

			let patch = self.transfer(&instr, stack, locals)?;
			if let Some(operand) = patch {
				routine.instructions.borrow_mut()[i].operands[0] = operand;
			}
			self.reals = false;
		}
		Ok(())
	}

	// Transfer helpers.

	fn int_or_real(&self) -> TypeToken {
		match self.reals {
			true => TypeToken::Prim(PrimKind::Float),
			false => TypeToken::Prim(PrimKind::Int),
		}
	}

	fn long_or_real(&self) -> TypeToken {
		match self.reals {
			true => TypeToken::Prim(PrimKind::Double),
			false => TypeToken::Prim(PrimKind::Long),
		}
	}

	fn local_index(operand: Option<&Operand>) -> Result<usize, ScanError> {
		match operand {
			Some(Operand::Int(v)) if *v >= 0 && (*v as usize) < LOCAL_SLOTS => Ok(*v as usize),
			other => Err(ScanError::Aborted(format!("bad local index operand {other:?}"))),
		}
	}

	/// Parameter slot count and return token of a method operand.
	fn method_sig_info(&mut self, method: &MethodRef) -> Result<(usize, Option<TypeToken>), ScanError> {
		if let Some(id) = method.id() {
			let owner = self.loader.module(id.module);
			let target = &owner.routines[id.index];
			return Ok((target.param_types.slots(), target.return_type.first().cloned()));
		}
		// Fall back to the signature string on an unmaterialized handle.
		let sig = method.sig();
		let (_, rest) = sig
			.split_once('(')
			.ok_or_else(|| ScanError::UnknownTotos(format!("bad method signature '{sig}'")))?;
		let (params, ret) = rest
			.split_once(')')
			.ok_or_else(|| ScanError::UnknownTotos(format!("bad method signature '{sig}'")))?;
		let params = TypeList::from_jts(params, &RefScope::Global)
			.map_err(ScanError::UnknownTotos)?;
		let ret_token = match ret {
			"" | "V" => None,
			jts => Some(TypeToken::from_jts(jts, &RefScope::Global).map_err(ScanError::UnknownTotos)?),
		};
		Ok((params.slots(), ret_token))
	}

	fn field_type(&mut self, field_id: FieldId) -> Result<TypeToken, ScanError> {
		let owner = self.loader.module(field_id.class.module);
		let class = &owner.classes[field_id.class.index];
		class
			.field(field_id)
			.and_then(|f| f.ty.first().cloned())
			.ok_or_else(|| ScanError::FieldPatchFailed("field with empty type".into()))
	}

	fn field_operand_type(&mut self, operand: &Operand) -> Result<Option<TypeToken>, ScanError> {
		match operand {
			Operand::Field(field) => {
				let id = self
					.loader
					.materialize_field(field)
					.map_err(|e| ScanError::FieldPatchFailed(e.to_string()))?;
				Ok(Some(self.field_type(id)?))
			}
			_ => Ok(None),
		}
	}

	/// Look up a field slot in the receiver's field-lookup table.
	fn fft_lookup(&mut self, receiver: &TypeToken, slot: i64) -> Result<FieldId, ScanError> {
		if slot < 0 {
			return Err(ScanError::FieldPatchFailed(format!("runtime field offset {slot} < 0")));
		}
		let class = receiver.class_ref().cloned().ok_or_else(|| {
			ScanError::FieldPatchFailed(format!("field lookup on unhelpful stack type ({receiver})"))
		})?;
		if receiver.is_array() {
			return Err(ScanError::FieldPatchFailed("field lookup on array type".into()));
		}
		let class_id = self
			.loader
			.materialize_class(&class)
			.ok()
			.flatten()
			.ok_or_else(|| {
				ScanError::FieldPatchFailed(format!("field lookup on unresolved type ({receiver})"))
			})?;
		self.loader
			.actualize_class(class_id)
			.map_err(|e| ScanError::FieldPatchFailed(e.to_string()))?;
		let owner = self.loader.module(class_id.module);
		let fft = owner.classes[class_id.index].fft.borrow().clone();
		let entry = fft.get(slot as usize).ok_or_else(|| {
			ScanError::FieldPatchFailed(format!(
				"error looking up field {slot} for type {}",
				owner.classes[class_id.index].name
			))
		})?;
		self.loader
			.materialize_field(entry)
			.map_err(|e| ScanError::FieldPatchFailed(e.to_string()))
	}

	fn do_getfield(
		&mut self,
		instr: &Instruction,
		stack: &mut TypeStack,
	) -> Result<Option<Operand>, ScanError> {
		if let Some(ty) = self.field_operand_type(&instr.operands[0])? {
			stack.pop_push(ty)?;
			return Ok(None);
		}
		let Some(Operand::FieldSlot(slot)) = instr.operands.first().cloned() else {
			return Err(ScanError::FieldPatchFailed(format!(
				"unusable field operand in {instr}"
			)));
		};
		let receiver = stack
			.top()
			.cloned()
			.ok_or_else(|| ScanError::FieldPatchFailed("field lookup on empty stack".into()))?;
		let field_id = self.fft_lookup(&receiver, slot)?;
		let ty = self.field_type(field_id)?;
		stack.pop_push(ty)?;
		self.stats.fields_patched += 1;
		Ok(Some(Operand::Field(self.loader.field_ref_for(field_id))))
	}

	fn do_putfield(
		&mut self,
		instr: &Instruction,
		stack: &mut TypeStack,
	) -> Result<Option<Operand>, ScanError> {
		let _value = stack.pop()?;
		let receiver = stack.pop()?;
		match instr.operands.first() {
			Some(Operand::FieldSlot(slot)) => {
				let field_id = self.fft_lookup(&receiver, *slot)?;
				self.stats.fields_patched += 1;
				Ok(Some(Operand::Field(self.loader.field_ref_for(field_id))))
			}
			_ => Ok(None),
		}
	}

	fn do_invoke_known(&mut self, instr: &Instruction, stack: &mut TypeStack) -> Result<(), ScanError> {
		let Some(Operand::Method(method)) = instr.operands.first() else {
			return Err(ScanError::UnknownTotos(format!(
				"unknown/corrupted callee for '{}'; type on top of stack undefined",
				instr.opcode.mnemonic()
			)));
		};
		let (param_slots, ret) = self.method_sig_info(&method.clone())?;
		stack.pop_n(param_slots)?;
		if let Some(token) = ret {
			stack.push(token)?;
		}
		Ok(())
	}

	fn do_invokevirtual(
		&mut self,
		instr: &Instruction,
		stack: &mut TypeStack,
	) -> Result<Option<Operand>, ScanError> {
		if let Some(Operand::Method(method)) = instr.operands.first() {
			let (param_slots, ret) = self.method_sig_info(&method.clone())?;
			stack.pop_n(param_slots)?;
			if let Some(token) = ret {
				stack.push(token)?;
			}
			return Ok(None);
		}

		let Some(Operand::VirtualSlot(slot)) = instr.operands.first().cloned() else {
			return Err(ScanError::VirtualPatchFailed(format!(
				"invalid virtual method operand in {instr}"
			)));
		};
		let argc = match instr.operands.get(1) {
			Some(Operand::Int(n)) if *n >= 0 => *n as usize,
			_ => 0,
		};
		let args = stack.pop_n(argc)?;
		let receiver = args.first().cloned().unwrap_or(TypeToken::Wildcard);

		// An array receiver dispatches through the root object class.
		let class = match receiver.is_array() {
			true => ClassRef::named(RefScope::Global, "java/lang/Object"),
			false => receiver.class_ref().cloned().ok_or_else(|| {
				ScanError::VirtualPatchFailed(format!(
					"virtual method call on unhelpful stack type ({receiver})"
				))
			})?,
		};
		if slot < 0 {
			return Err(ScanError::VirtualPatchFailed(format!("runtime slot {slot} < 0")));
		}
		let class_id = self
			.loader
			.materialize_class(&class)
			.ok()
			.flatten()
			.ok_or_else(|| {
				ScanError::VirtualPatchFailed(format!(
					"virtual method call on unresolved type ({receiver})"
				))
			})?;
		self.loader
			.actualize_class(class_id)
			.map_err(|e| ScanError::VirtualPatchFailed(e.to_string()))?;
		let owner = self.loader.module(class_id.module);
		let vft = owner.classes[class_id.index].vft.borrow().clone();
		let method = vft.get(slot as usize).cloned().ok_or_else(|| {
			ScanError::VirtualPatchFailed(format!(
				"error looking up virtual method {slot} for type {}",
				owner.classes[class_id.index].name
			))
		})?;
		let (_, ret) = self.method_sig_info(&method)?;
		if let Some(token) = ret {
			stack.push(token)?;
		}
		self.stats.virtuals_patched += 1;
		Ok(Some(Operand::Method(method)))
	}

	fn operand_class_token(&self, instr: &Instruction) -> Result<TypeToken, ScanError> {
		match instr.operands.first() {
			Some(Operand::Class(class)) => Ok(TypeToken::Object(class.clone())),
			other => Err(ScanError::UnknownTotos(format!("expected class operand, got {other:?}"))),
		}
	}

	/// Apply one instruction's effect to the abstract stack and locals.
	/// Returns a replacement for operand 0 when the instruction was
	/// patched.
	fn transfer(
		&mut self,
		instr: &Instruction,
		stack: &mut TypeStack,
		locals: &mut Vec<TypeToken>,
	) -> Result<Option<Operand>, ScanError> {
		use Opcode::*;
		let op = instr.opcode;

		match op {
			// No effect on the abstract state.
			enter | enter_narrow | enter_wide | xenter | xenter_wide | iinc | iinc_wide | ineg
			| goto | goto_w | jmpback | jmpforward | i2b | i2s | i2c | lneg | fneg | dneg
			| return_ | noenter_return | halt | clinit_wait | clinit_return | clinit
			| clinit_lib | synch | synch_static | ireturn_bipush | ireturn_sipush
			| ireturn_iipush | invokenative | iinvokenative | linvokenative | nop => {}

			// One slot popped.
			ifeq | ifne | iflt | ifge | ifgt | ifle | ifnull | ifnonnull | iand | ishl | iushr
			| isub | ixor | imul | iadd | ior | idiv | ishr | irem | pop | monitorenter
			| monitorexit | tableswitch | lookupswitch | lookupswitch_short | lshl | lshr
			| lushr | fadd | fsub | fmul | fdiv | frem => {
				stack.pop()?;
			}

			// Two slots popped.
			if_acmpeq | if_acmpne | if_icmpeq | if_icmpne | if_icmplt | if_icmpge | if_icmpgt
			| if_icmple | pop2 | ladd | lsub | lmul | ldiv | lor | lrem | lxor | land | dadd
			| dsub | dmul | ddiv | drem => {
				stack.pop_n(2)?;
			}

			// Three slots popped.
			bastore | iastore | castore | aastore | sastore => {
				stack.pop_n(3)?;
			}

			iconst_0 | iconst_1 | bipush | sipush | iipush => {
				stack.push(self.int_or_real())?;
			}
			iload | iload_wide | iload_0 | iload_1 | iload_2 | iload_3 | iload_4 | iload_5
			| iload_6 | iload_7 => {
				stack.push(self.int_or_real())?;
			}
			lload | lload_wide | lipush => {
				stack.push(self.long_or_real())?;
			}
			dconst_0 | dconst_1 => stack.push(TypeToken::Prim(PrimKind::Double))?,
			fconst_0 | fconst_1 | fconst_2 => stack.push(TypeToken::Prim(PrimKind::Float))?,

			swap => {
				let a = stack.pop()?;
				let b = stack.pop()?;
				if a.is_wide() || b.is_wide() {
					return Err(ScanError::Aborted("invalid use of swap".into()));
				}
				stack.push(a)?;
				stack.push(b)?;
			}

			aconst_null => stack.push(TypeToken::Null)?,
			ldc | ldc_unicode | ldc_nullstr => stack.push(TypeToken::string())?,

			aload | aload_wide => {
				let index = Self::local_index(instr.operands.first())?;
				stack.push(locals[index].clone())?;
			}
			aload_0 | aload_1 | aload_2 | aload_3 | aload_4 | aload_5 | aload_6 | aload_7 => {
				let index = (op as u16 - aload_0 as u16) as usize;
				stack.push(locals[index].clone())?;
			}

			istore | istore_wide => {
				let index = Self::local_index(instr.operands.first())?;
				stack.pop()?;
				locals[index] = self.int_or_real();
			}
			istore_0 | istore_1 | istore_2 | istore_3 | istore_4 | istore_5 | istore_6
			| istore_7 => {
				let index = (op as u16 - istore_0 as u16) as usize;
				stack.pop()?;
				locals[index] = self.int_or_real();
			}
			astore | astore_wide => {
				let index = Self::local_index(instr.operands.first())?;
				locals[index] = stack.pop()?;
			}
			astore_0 | astore_1 | astore_2 | astore_3 | astore_4 | astore_5 | astore_6
			| astore_7 => {
				let index = (op as u16 - astore_0 as u16) as usize;
				locals[index] = stack.pop()?;
			}
			lstore | lstore_wide => {
				let index = Self::local_index(instr.operands.first())?;
				stack.pop_n(2)?;
				let token = self.long_or_real();
				locals[index] = token.clone();
				if index + 1 < LOCAL_SLOTS {
					locals[index + 1] = token;
				}
			}

			getfield | lgetfield => return self.do_getfield(instr, stack),
			aload_0_getfield => {
				stack.push(locals[0].clone())?;
				return self.do_getfield(instr, stack);
			}

			ireturn => {
				match stack.top() {
					None => warn!("expected an int-kind return value, got an empty stack"),
					Some(totos) => {
						let jts = totos.to_jts();
						let ok = match self.reals {
							true => jts == "F",
							false => matches!(jts.as_str(), "I" | "S" | "C" | "B" | "Z"),
						};
						if !ok {
							warn!("expected an int-kind return value, instead got {jts}");
						}
					}
				}
				stack.pop()?;
			}
			lreturn => {
				match stack.top() {
					None => warn!("expected a wide return value, got an empty stack"),
					Some(totos) => {
						let jts = totos.to_jts();
						let ok = match self.reals {
							true => jts == "D",
							false => jts == "J",
						};
						if !ok {
							warn!("expected a wide return value, instead got {jts}");
						}
					}
				}
				stack.pop_n(2)?;
			}
			areturn => {
				match stack.top() {
					None => warn!("expected an object return value, got an empty stack"),
					Some(totos) if !totos.is_object() && !totos.is_array() => {
						warn!("expected an object return value, got {totos}")
					}
					_ => {}
				}
				stack.pop()?;
			}
			ireturn_field | ireturn_field_wide => {
				stack.push(locals[0].clone())?;
				let patch = self.do_getfield(instr, stack)?;
				stack.pop()?;
				return Ok(patch);
			}
			areturn_field | areturn_field_wide => {
				stack.push(locals[0].clone())?;
				let patch = self.do_getfield(instr, stack)?;
				stack.pop()?;
				return Ok(patch);
			}

			getstatic | getstatic_lib | lgetstatic | lgetstatic_lib => {
				match self.field_operand_type(&instr.operands[0])? {
					Some(ty) => stack.push(ty)?,
					None => {
						warn!("unknown static field '{}'; pushing wildcard", instr.operands[0]);
						stack.push(TypeToken::Wildcard)?;
					}
				}
			}
			putstatic | putstatic_lib => {
				if self.field_operand_type(&instr.operands[0])?.is_none() {
					warn!("unknown static field '{}' for put", instr.operands[0]);
				}
				stack.pop()?;
			}
			lputstatic | lputstatic_lib => {
				if self.field_operand_type(&instr.operands[0])?.is_none() {
					warn!("unknown static field '{}' for put", instr.operands[0]);
				}
				stack.pop_n(2)?;
			}

			arraylength | stringlength => stack.pop_push(TypeToken::Prim(PrimKind::Int))?,

			new | new_lib => {
				let token = self.operand_class_token(instr)?;
				stack.push(token)?;
			}

			baload | iaload | saload | caload => {
				stack.pop()?;
				stack.pop_push(self.int_or_real())?;
			}
			laload => {
				stack.pop_n(2)?;
				stack.push(self.long_or_real())?;
			}
			lastore => {
				stack.pop_n(4)?;
			}
			aaload => {
				stack.pop()?;
				let array = stack.pop()?;
				match &array {
					TypeToken::Array { dims, elem } => {
						let token = match dims {
							1 => match elem {
								ArrayElem::Prim(p) => TypeToken::Prim(*p),
								ArrayElem::Object(c) => TypeToken::Object(c.clone()),
							},
							_ => TypeToken::Array { dims: dims - 1, elem: elem.clone() },
						};
						stack.push(token)?;
					}
					TypeToken::Wildcard | TypeToken::Null => {
						return Err(ScanError::UnknownTotos(format!(
							"{} on indeterminate type; type on top of stack undefined",
							instr.opcode.mnemonic()
						)))
					}
					other => {
						return Err(ScanError::UnknownTotos(format!(
							"{} on non-array type '{other}'; type on top of stack undefined",
							instr.opcode.mnemonic()
						)))
					}
				}
			}

			newarray => match instr.operands.first() {
				Some(Operand::PrimType(kind)) => {
					stack.pop_push(TypeToken::Array { dims: 1, elem: ArrayElem::Prim(*kind) })?
				}
				other => return Err(ScanError::Aborted(format!("bad newarray operand {other:?}"))),
			},
			newarray_object | newarray_object_lib => {
				let token = self.operand_class_token(instr)?;
				let class = token.class_ref().cloned().unwrap();
				stack.pop_push(TypeToken::Array { dims: 1, elem: ArrayElem::Object(class) })?;
			}
			arrayinit => match instr.operands.first() {
				Some(Operand::PrimType(kind)) => {
					stack.push(TypeToken::Array { dims: 1, elem: ArrayElem::Prim(*kind) })?
				}
				other => return Err(ScanError::Aborted(format!("bad arrayinit operand {other:?}"))),
			},
			stringarrayinit => {
				stack.push(TypeToken::Array {
					dims: 1,
					elem: ArrayElem::Object(ClassRef::named(RefScope::Global, STRING_CLASS)),
				})?;
			}
			multianewarray => {
				let (given, dims, kind) = match (
					instr.operands.first(),
					instr.operands.get(1),
					instr.operands.get(2),
				) {
					(Some(Operand::Int(g)), Some(Operand::Int(d)), Some(Operand::PrimType(k))) => {
						(*g as usize, *d as u8, *k)
					}
					_ => return Err(ScanError::Aborted("bad multianewarray operands".into())),
				};
				for _ in 0..given {
					stack.pop()?;
				}
				stack.push(TypeToken::Array { dims, elem: ArrayElem::Prim(kind) })?;
			}
			multianewarray_object | multianewarray_object_lib => {
				let class = match instr.operands.first() {
					Some(Operand::Class(class)) => class.clone(),
					other => {
						return Err(ScanError::Aborted(format!(
							"bad multianewarray operand {other:?}"
						)))
					}
				};
				let (given, dims) = match (instr.operands.get(1), instr.operands.get(2)) {
					(Some(Operand::Int(g)), Some(Operand::Int(d))) => (*g as usize, *d as u8),
					_ => return Err(ScanError::Aborted("bad multianewarray operands".into())),
				};
				for _ in 0..given {
					stack.pop()?;
				}
				stack.push(TypeToken::Array { dims, elem: ArrayElem::Object(class) })?;
			}

			dup => {
				let top = stack.top().cloned().ok_or(ScanError::StackUnderflow)?;
				if top.is_wide() {
					return Err(ScanError::Aborted("invalid use of dup".into()));
				}
				stack.push_slot(top);
				if stack.len() > crate::scan::GLOBAL_MAX_STACK {
					return Err(ScanError::StackOverflow);
				}
			}
			dup2 => {
				let len = stack.len();
				let tail: Vec<TypeToken> = stack.0[len.saturating_sub(2)..].to_vec();
				for token in tail {
					stack.push_slot(token);
				}
				if stack.len() > crate::scan::GLOBAL_MAX_STACK {
					return Err(ScanError::StackOverflow);
				}
			}
			dup_x1 => {
				let len = stack.len();
				if len < 2 {
					return Err(ScanError::StackUnderflow);
				}
				let top = stack.0[len - 1].clone();
				stack.0.insert(len - 2, top);
			}
			dup_x2 => {
				let len = stack.len();
				if len < 3 {
					return Err(ScanError::StackUnderflow);
				}
				if stack.0[len - 1].is_wide() {
					return Err(ScanError::Aborted("invalid use of dup_x2".into()));
				}
				let top = stack.0[len - 1].clone();
				// Both forms insert the copy below the two slots beneath,
				// whether they hold one wide value or two narrow ones.
				stack.0.insert(len - 3, top);
			}
			dup2_x1 => {
				let len = stack.len();
				if len < 3 {
					return Err(ScanError::StackUnderflow);
				}
				if stack.0[len - 3].is_wide() {
					return Err(ScanError::Aborted("invalid use of dup2_x1".into()));
				}
				let pair = stack.0[len - 2..].to_vec();
				stack.0.splice(len - 3..len - 3, pair);
			}
			dup2_x2 => {
				let len = stack.len();
				if len < 4 {
					return Err(ScanError::StackUnderflow);
				}
				let pair = stack.0[len - 2..].to_vec();
				stack.0.splice(len - 4..len - 4, pair);
			}

			jumpspecial | jumpspecial_lib => {
				// Hands control to another routine with the current
				// parameters pushed, which sizes max-stack correctly for
				// downstream emission.
				let Some(Operand::Method(method)) = instr.operands.first() else {
					return Err(ScanError::UnknownTotos(format!(
						"unknown callee for {}",
						instr.opcode.mnemonic()
					)));
				};
				let sig = method.sig();
				let params = sig
					.split_once('(')
					.and_then(|(_, rest)| rest.split_once(')'))
					.map(|(params, _)| params.to_string())
					.ok_or_else(|| ScanError::UnknownTotos(format!("bad signature '{sig}'")))?;
				let count = crate::types::split_jts(&params)
					.map_err(ScanError::UnknownTotos)?
					.len();
				for i in 0..count.min(LOCAL_SLOTS) {
					stack.push(locals[i].clone())?;
				}
			}

			invokevirtual | invokevirtual_short => return self.do_invokevirtual(instr, stack),
			invokestatic | invokestatic_lib | invokestaticqc | invokestaticqc_lib
			| invokenonvirtual | invokenonvirtual_lib | invokespecial | invokespecial_lib => {
				self.do_invoke_known(instr, stack)?;
			}
			invokeinterface => {
				let argc = match instr.operands.get(1) {
					Some(Operand::Int(n)) if *n >= 0 => *n as usize,
					_ => 0,
				};
				stack.pop_n(argc)?;
				let Some(Operand::Method(method)) = instr.operands.first() else {
					return Err(ScanError::UnknownTotos(
						"unknown/corrupted interface callee; type on top of stack undefined".into(),
					));
				};
				let (_, ret) = self.method_sig_info(&method.clone())?;
				if let Some(token) = ret {
					stack.push(token)?;
				}
			}

			athrow => {
				let exref = stack.top().cloned().ok_or(ScanError::StackUnderflow)?;
				stack.clear();
				stack.push(exref)?;
			}

			i2l | f2l => {
				stack.pop()?;
				stack.push(TypeToken::Prim(PrimKind::Long))?;
			}
			l2i | d2i => {
				stack.pop()?;
				stack.pop_push(TypeToken::Prim(PrimKind::Int))?;
			}
			l2f | d2f => {
				stack.pop()?;
				stack.pop_push(TypeToken::Prim(PrimKind::Float))?;
			}
			l2d => {
				stack.pop_n(2)?;
				stack.push(TypeToken::Prim(PrimKind::Double))?;
			}
			d2l => {
				stack.pop_n(2)?;
				stack.push(TypeToken::Prim(PrimKind::Long))?;
			}
			i2f => stack.pop_push(TypeToken::Prim(PrimKind::Float))?,
			f2i => stack.pop_push(TypeToken::Prim(PrimKind::Int))?,
			i2d | f2d => {
				stack.pop()?;
				stack.push(TypeToken::Prim(PrimKind::Double))?;
			}

			lcmp => {
				stack.pop_n(4)?;
				stack.push(TypeToken::Prim(PrimKind::Int))?;
			}
			fcmpl | fcmpg => {
				stack.pop()?;
				stack.pop_push(TypeToken::Prim(PrimKind::Int))?;
			}
			dcmpl | dcmpg => {
				stack.pop_n(3)?;
				stack.pop_push(TypeToken::Prim(PrimKind::Int))?;
			}

			stringaload => {
				stack.pop()?;
				stack.pop_push(TypeToken::Prim(PrimKind::Char))?;
			}

			instanceof | instanceof_lib | instanceof_array | instanceof_arrayobject
			| instanceof_arrayobject_lib => {
				stack.pop_push(TypeToken::Prim(PrimKind::Int))?;
			}

			checkcast | checkcast_lib | checkcastbranch | checkcastbranch_lib => {
				let token = self.operand_class_token(instr)?;
				stack.pop_push(token)?;
			}
			checkcast_array | checkcastbranch_array => match instr.operands.first() {
				Some(Operand::Type(token)) => stack.pop_push(token.clone())?,
				other => {
					return Err(ScanError::Aborted(format!("bad checkcast operand {other:?}")))
				}
			},
			checkcast_arrayobject | checkcast_arrayobject_lib => {
				let class = match instr.operands.first() {
					Some(Operand::Class(class)) => class.clone(),
					other => {
						return Err(ScanError::Aborted(format!("bad checkcast operand {other:?}")))
					}
				};
				let dims = match instr.operands.get(1) {
					Some(Operand::Int(d)) => *d as u8,
					_ => 1,
				};
				stack.pop_push(TypeToken::Array { dims, elem: ArrayElem::Object(class) })?;
			}

			putfield | putfield_wide => return self.do_putfield(instr, stack),
			putfield_return | putfield_return_wide => {
				stack.push(locals[0].clone())?;
				stack.push(locals[1].clone())?;
				return self.do_putfield(instr, stack);
			}
			lputfield | lputfield_wide => {
				stack.pop()?;
				return self.do_putfield(instr, stack);
			}

			ldc_class | ldc_class_lib => {
				let token = self.operand_class_token(instr)?;
				stack.push(token)?;
			}

			_ => {
				warn!("unimplemented instruction type '{}'", op.mnemonic());
			}
		}
		Ok(None)
	}
}

fn class_token(name: &str) -> TypeToken {
	TypeToken::Object(ClassRef::named(RefScope::Global, name))
}
