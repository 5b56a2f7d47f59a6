//! The heuristic instruction scanner.
//!
//! An abstract interpretation over each routine's basic blocks that
//! recovers the type on the stack at every instruction and patches
//! field and virtual-method operands that were left as numeric slots
//! after disassembly.

pub mod scanner;

pub use scanner::HeuristicScanner;

use std::fmt::{self, Display, Formatter};

use tracing::info;

use crate::errors::ScanError;
use crate::types::TypeToken;

/// Stack slots past this limit abort the routine scan.
pub const GLOBAL_MAX_STACK: usize = 0x200;

/// Rescans of a single basic block past this limit abort the routine scan.
pub const GLOBAL_MAX_RESCAN: u32 = 50;

/// The abstract operand stack. Wide tokens occupy two slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeStack(pub Vec<TypeToken>);

impl TypeStack {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn push(&mut self, token: TypeToken) -> Result<(), ScanError> {
		let slots = match token.is_wide() {
			true => 2,
			false => 1,
		};
		for _ in 0..slots {
			self.0.push(token.clone());
		}
		if self.0.len() > GLOBAL_MAX_STACK {
			return Err(ScanError::StackOverflow);
		}
		Ok(())
	}

	/// Push a single slot without wide doubling (the dup family moves raw
	/// slots around).
	pub fn push_slot(&mut self, token: TypeToken) {
		self.0.push(token);
	}

	pub fn pop(&mut self) -> Result<TypeToken, ScanError> {
		self.0.pop().ok_or(ScanError::StackUnderflow)
	}

	/// Pop `count` raw slots, returned in stack order (deepest first).
	pub fn pop_n(&mut self, count: usize) -> Result<Vec<TypeToken>, ScanError> {
		if count == 0 {
			return Ok(Vec::new());
		}
		if self.0.is_empty() {
			return Err(ScanError::StackUnderflow);
		}
		let start = self.0.len().saturating_sub(count);
		Ok(self.0.split_off(start))
	}

	pub fn top(&self) -> Option<&TypeToken> {
		self.0.last()
	}

	pub fn slot(&self, depth: usize) -> Option<&TypeToken> {
		self.0.len().checked_sub(depth).and_then(|i| self.0.get(i))
	}

	pub fn pop_push(&mut self, token: TypeToken) -> Result<(), ScanError> {
		self.pop()?;
		self.push(token)
	}

	pub fn clear(&mut self) {
		self.0.clear();
	}
}

impl Display for TypeStack {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{{")?;
		for token in &self.0 {
			write!(f, "{token}")?;
		}
		write!(f, "}}")
	}
}

/// Counters for a scan session, summarized on teardown.
#[derive(Debug, Default)]
pub struct ScanStats {
	pub subs: usize,
	pub codes: usize,
	pub fields_patched: usize,
	pub virtuals_patched: usize,
	pub failed_subs: Vec<String>,
}

impl ScanStats {
	pub fn summarize(&self) {
		info!("*** scan stats summary ***");
		info!("subs scanned: {}", self.subs);
		let failed = self.failed_subs.len();
		let rate = match self.subs {
			0 => 0.0,
			subs => failed as f64 / subs as f64 * 100.0,
		};
		info!("subs failed: {failed} ({rate:.2}%)");
		info!("instructions scanned: {}", self.codes);
		info!("fields patched up: {}", self.fields_patched);
		info!("virtual methods patched up: {}", self.virtuals_patched);
		for sub in &self.failed_subs {
			info!("failed sub: {sub}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::PrimKind;

	#[test]
	fn wide_tokens_take_two_slots() {
		let mut stack = TypeStack::new();
		stack.push(TypeToken::Prim(PrimKind::Long)).unwrap();
		assert_eq!(stack.len(), 2);
		stack.push(TypeToken::Prim(PrimKind::Int)).unwrap();
		assert_eq!(stack.len(), 3);
	}

	#[test]
	fn overflow_is_detected() {
		let mut stack = TypeStack::new();
		for _ in 0..GLOBAL_MAX_STACK / 2 {
			stack.push(TypeToken::Prim(PrimKind::Long)).unwrap();
		}
		assert!(matches!(
			stack.push(TypeToken::Prim(PrimKind::Int)),
			Err(ScanError::StackOverflow)
		));
	}

	#[test]
	fn underflow_is_detected() {
		let mut stack = TypeStack::new();
		assert!(matches!(stack.pop(), Err(ScanError::StackUnderflow)));
		assert!(matches!(stack.pop_n(2), Err(ScanError::StackUnderflow)));
		assert!(stack.pop_n(0).unwrap().is_empty());
	}
}
