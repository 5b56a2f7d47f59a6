//! Control-flow recovery: exit edges per instruction, basic-block
//! partitioning, and the block graph the heuristic scanner walks.

use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::disasm::{Instruction, Opcode, Operand};
use crate::errors::ScanError;
use crate::resolve::routine::{ExHandler, RoutineDef};

/// Why control reaches a successor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeLabel {
	/// Fall-through or unconditional transfer.
	Fall,
	True,
	False,
	Case(i64),
	Default,
	/// An exception edge into a typed handler.
	Catch(Rc<str>),
	/// An exception edge into a catch-all handler.
	Finally,
}

impl EdgeLabel {
	pub fn is_exception(&self) -> bool {
		matches!(self, Self::Catch(_) | Self::Finally)
	}
}

impl Display for EdgeLabel {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Self::Fall => Ok(()),
			Self::True => write!(f, "True"),
			Self::False => write!(f, "False"),
			Self::Case(key) => write!(f, "{key}"),
			Self::Default => write!(f, "default"),
			Self::Catch(name) => write!(f, "{name}"),
			Self::Finally => write!(f, "finally"),
		}
	}
}

#[derive(Debug)]
pub struct BasicBlock {
	/// Indexes into the routine's instruction list, in program order.
	pub instructions: Vec<usize>,
	pub is_entry: bool,
	/// `(label, successor block)` exit edges.
	pub exits: Vec<(EdgeLabel, usize)>,
	/// `(label, predecessor block)` entry edges.
	pub entries: Vec<(EdgeLabel, usize)>,
}

impl BasicBlock {
	pub fn first_instruction(&self) -> usize {
		self.instructions[0]
	}

	pub fn is_terminal(&self) -> bool {
		self.exits.is_empty()
	}

	pub fn is_abandoned(&self) -> bool {
		self.entries.is_empty() && !self.is_entry
	}
}

/// The per-routine control-flow graph.
#[derive(Debug)]
pub struct Subroutine {
	pub blocks: Vec<BasicBlock>,
	/// Offsets of the instructions, parallel to the routine's stream.
	pub offsets: Vec<u32>,
}

fn handler_label(handler: &ExHandler) -> EdgeLabel {
	match handler.is_finally() {
		true => EdgeLabel::Finally,
		false => EdgeLabel::Catch(handler.class.name().unwrap_or_else(|| handler.class.to_string().into())),
	}
}

/// Handler edges for an instruction, innermost first, deduplicated by
/// exception class. `allowed` restricts which declared types attract an
/// edge (catch-alls always do).
fn handler_edges(
	handlers: &[ExHandler],
	offset: u32,
	allowed: Option<&[&str]>,
	index_of: &FxHashMap<u32, usize>,
) -> Result<Vec<(EdgeLabel, usize)>, ScanError> {
	let mut edges: Vec<(EdgeLabel, usize)> = Vec::new();
	for handler in handlers {
		if !handler.covers(offset) {
			continue;
		}
		let label = handler_label(handler);
		if let Some(allowed) = allowed {
			let matches = match &label {
				EdgeLabel::Finally => true,
				EdgeLabel::Catch(name) => allowed.contains(&name.as_ref()),
				_ => false,
			};
			if !matches {
				continue;
			}
		}
		if edges.iter().any(|(existing, _)| *existing == label) {
			continue;
		}
		let target = *index_of.get(&handler.target).ok_or_else(|| {
			ScanError::Aborted(format!("handler target {} is not an instruction", handler.target))
		})?;
		edges.push((label, target));
	}
	Ok(edges)
}

impl Subroutine {
	/// Partition a disassembled routine into basic blocks and wire the
	/// edges. A block boundary falls at every branch target and after
	/// every terminal or multi-successor instruction.
	pub fn build(routine: &RoutineDef) -> Result<Self, ScanError> {
		let instructions = routine.instructions.borrow();
		let handlers = routine.handlers.borrow();
		Self::from_instructions(&instructions, &handlers)
	}

	fn from_instructions(
		instructions: &[Instruction],
		handlers: &[ExHandler],
	) -> Result<Self, ScanError> {
		let count = instructions.len();
		if count == 0 {
			return Err(ScanError::Aborted("routine has no instructions".into()));
		}

		let index_of: FxHashMap<u32, usize> =
			instructions.iter().enumerate().map(|(i, instr)| (instr.offset, i)).collect();
		let resolve = |offset: u32| -> Result<usize, ScanError> {
			index_of.get(&offset).copied().ok_or_else(|| {
				ScanError::Aborted(format!("no instruction at branch target {offset}"))
			})
		};

		// Exit edges per instruction; an empty set marks a terminal.
		let mut branches: Vec<Vec<(EdgeLabel, usize)>> = Vec::with_capacity(count);
		for (i, instr) in instructions.iter().enumerate() {
			let op = instr.opcode;
			let edges: Vec<(EdgeLabel, usize)> = if op.is_terminal() || count == 1 {
				// A single-instruction routine terminates regardless (a
				// lone native-call stub, for instance).
				Vec::new()
			} else if op.is_branch() {
				let target = resolve(instr.branch_locations()[0])?;
				vec![(EdgeLabel::Fall, target)]
			} else if op.is_conditional_branch() {
				let target = resolve(instr.branch_locations()[0])?;
				match op.is_checkcast_branch() {
					// The fall-through is the successful cast.
					true => vec![(EdgeLabel::True, i + 1), (EdgeLabel::False, target)],
					false => vec![(EdgeLabel::False, i + 1), (EdgeLabel::True, target)],
				}
			} else if op == Opcode::tableswitch {
				let base = match instr.operands.get(1) {
					Some(Operand::Int(base)) => *base,
					_ => 0,
				};
				let mut edges = Vec::new();
				for (j, location) in instr.branch_locations().into_iter().enumerate() {
					let label = match j {
						0 => EdgeLabel::Default,
						_ => EdgeLabel::Case(base + j as i64),
					};
					edges.push((label, resolve(location)?));
				}
				edges
			} else if matches!(op, Opcode::lookupswitch | Opcode::lookupswitch_short) {
				let keys: Vec<i64> = match instr.operands.get(1) {
					Some(Operand::Pairs(pairs)) => pairs.iter().map(|(k, _)| *k as i64).collect(),
					_ => Vec::new(),
				};
				let locations = instr.branch_locations();
				let mut edges = Vec::new();
				for (j, location) in locations.iter().enumerate().skip(1) {
					let key = keys.get(j - 1).copied().unwrap_or_default();
					edges.push((EdgeLabel::Case(key), resolve(*location)?));
				}
				edges.push((EdgeLabel::Default, resolve(locations[0])?));
				edges
			} else if op.is_thrower() {
				// May reach any covering handler; with none, it terminates.
				handler_edges(handlers, instr.offset, None, &index_of)?
			} else if op.is_potential_thrower() {
				let mut edges = handler_edges(handlers, instr.offset, None, &index_of)?;
				edges.push((EdgeLabel::Fall, i + 1));
				edges
			} else if let Some(allowed) = op.restricted_throwers() {
				let mut edges = handler_edges(handlers, instr.offset, Some(allowed), &index_of)?;
				edges.push((EdgeLabel::Fall, i + 1));
				edges
			} else {
				vec![(EdgeLabel::Fall, i + 1)]
			};

			for (_, target) in &edges {
				if *target >= count {
					return Err(ScanError::Aborted(format!(
						"instruction {i} falls through past the end of the routine"
					)));
				}
			}
			branches.push(edges);
		}

		// Reverse edges.
		let mut xrefs: Vec<Vec<(EdgeLabel, usize)>> = vec![Vec::new(); count];
		for (i, edges) in branches.iter().enumerate() {
			for (label, target) in edges {
				xrefs[*target].push((label.clone(), i));
			}
		}

		// Partition. A fresh block starts at every instruction that is
		// branched to; a block ends after every terminal or
		// multi-successor instruction.
		let falls_through_only =
			|i: usize| xrefs[i].len() == 1 && i > 0 && xrefs[i][0] == (EdgeLabel::Fall, i - 1);
		let mut partitions: Vec<Vec<usize>> = Vec::new();
		let mut current: Vec<usize> = Vec::new();
		for i in 0..count {
			let plain_fall = branches[i].len() == 1 && branches[i][0] == (EdgeLabel::Fall, i + 1);
			if branches[i].is_empty() {
				if xrefs[i].is_empty() {
					if !current.is_empty() {
						partitions.push(std::mem::take(&mut current));
					}
					partitions.push(vec![i]);
				} else if falls_through_only(i) {
					current.push(i);
					partitions.push(std::mem::take(&mut current));
				} else {
					if !current.is_empty() {
						partitions.push(std::mem::take(&mut current));
					}
					partitions.push(vec![i]);
				}
			} else if plain_fall {
				if xrefs[i].is_empty() || falls_through_only(i) {
					current.push(i);
				} else {
					if !current.is_empty() {
						partitions.push(std::mem::take(&mut current));
					}
					current = vec![i];
				}
			} else {
				if xrefs[i].is_empty() {
					if !current.is_empty() {
						partitions.push(std::mem::take(&mut current));
					}
					partitions.push(vec![i]);
				} else if falls_through_only(i) {
					current.push(i);
					partitions.push(std::mem::take(&mut current));
				} else {
					if !current.is_empty() {
						partitions.push(std::mem::take(&mut current));
					}
					partitions.push(vec![i]);
				}
			}
		}
		if !current.is_empty() {
			partitions.push(current);
		}

		let mut block_of = vec![usize::MAX; count];
		for (b, partition) in partitions.iter().enumerate() {
			for i in partition {
				block_of[*i] = b;
			}
		}

		let mut blocks: Vec<BasicBlock> = partitions
			.iter()
			.enumerate()
			.map(|(b, partition)| BasicBlock {
				instructions: partition.clone(),
				is_entry: b == 0,
				exits: Vec::new(),
				entries: Vec::new(),
			})
			.collect();

		for (b, partition) in partitions.iter().enumerate() {
			let last = *partition.last().expect("empty partition");
			for (label, target) in &branches[last] {
				let target_block = block_of[*target];
				blocks[b].exits.push((label.clone(), target_block));
				blocks[target_block].entries.push((label.clone(), b));
			}
		}

		Ok(Self { blocks, offsets: instructions.iter().map(|i| i.offset).collect() })
	}

	pub fn entry_block(&self) -> Option<usize> {
		self.blocks.iter().position(|b| b.is_entry)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::disasm::Opcode;

	fn instr(offset: u32, opcode: Opcode, operands: Vec<Operand>) -> Instruction {
		Instruction { offset, opcode, operands, totos: None }
	}

	#[test]
	fn straight_line_is_one_block() {
		let instructions = vec![
			instr(0, Opcode::iconst_0, vec![]),
			instr(1, Opcode::istore_0, vec![]),
			instr(2, Opcode::return_, vec![]),
		];
		let sub = Subroutine::from_instructions(&instructions, &[]).unwrap();
		assert_eq!(sub.blocks.len(), 1);
		assert!(sub.blocks[0].is_entry);
		assert!(sub.blocks[0].is_terminal());
		assert_eq!(sub.blocks[0].instructions, vec![0, 1, 2]);
	}

	#[test]
	fn conditional_branch_labels() {
		// 0: iconst_0; 1: ifeq -> 4; 3: iconst_1; 4: return
		let instructions = vec![
			instr(0, Opcode::iconst_0, vec![]),
			instr(1, Opcode::ifeq, vec![Operand::Branch(4)]),
			instr(3, Opcode::iconst_1, vec![]),
			instr(4, Opcode::return_, vec![]),
		];
		let sub = Subroutine::from_instructions(&instructions, &[]).unwrap();
		assert_eq!(sub.blocks.len(), 3);
		let cond = &sub.blocks[0];
		assert_eq!(cond.exits.len(), 2);
		assert!(cond.exits.contains(&(EdgeLabel::False, 1)));
		assert!(cond.exits.contains(&(EdgeLabel::True, 2)));
	}

	#[test]
	fn every_instruction_lands_in_exactly_one_block() {
		let instructions = vec![
			instr(0, Opcode::iconst_0, vec![]),
			instr(1, Opcode::ifeq, vec![Operand::Branch(5)]),
			instr(3, Opcode::iconst_1, vec![]),
			instr(4, Opcode::goto, vec![Operand::Branch(6)]),
			instr(5, Opcode::iconst_0, vec![]),
			instr(6, Opcode::return_, vec![]),
		];
		let sub = Subroutine::from_instructions(&instructions, &[]).unwrap();
		let mut seen = vec![0usize; instructions.len()];
		for block in &sub.blocks {
			for i in &block.instructions {
				seen[*i] += 1;
			}
		}
		assert!(seen.iter().all(|c| *c == 1), "blocks: {:?}", sub.blocks);
	}

	#[test]
	fn branch_into_missing_instruction_fails() {
		let instructions = vec![
			instr(0, Opcode::goto, vec![Operand::Branch(7)]),
			instr(3, Opcode::return_, vec![]),
		];
		assert!(Subroutine::from_instructions(&instructions, &[]).is_err());
	}
}
