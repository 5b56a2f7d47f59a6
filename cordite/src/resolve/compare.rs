//! Type ordering used for joins and member lookup.
//!
//! The order is by coverage: a type compares greater than every type it
//! can stand in for. `int` sits above the narrow integer kinds, a
//! superclass above its subclasses, an interface above its implementers,
//! and the wildcard below everything. A join takes the greatest of the
//! comparable candidates; incomparable pairs are reported so callers can
//! fall back.

use std::cmp::Ordering;

use crate::resolve::loader::Loader;
use crate::resolve::refs::{ClassId, ClassRef};
use crate::types::{ArrayElem, PrimKind, TypeList, TypeToken};

/// Two types with no covering relation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Incomparable;

fn prim_cmp(a: PrimKind, b: PrimKind) -> Result<Ordering, Incomparable> {
	use PrimKind::*;
	if a == b {
		return Ok(Ordering::Equal);
	}
	let narrow = |k: PrimKind| matches!(k, Short | Char | Byte | Boolean);
	match (a, b) {
		(Int, other) if narrow(other) => Ok(Ordering::Greater),
		(other, Int) if narrow(other) => Ok(Ordering::Less),
		_ => Err(Incomparable),
	}
}

impl Loader {
	/// Whether `ancestor` appears in the superclass chain of `class`.
	pub fn class_is_super(&mut self, ancestor: ClassId, class: ClassId) -> bool {
		let mut current = {
			let module = self.module(class.module);
			module.classes[class.index].superclass.clone()
		};
		let mut hops = 0;
		while let Ok(Some(id)) = self.materialize_class(&current) {
			if id == ancestor {
				return true;
			}
			hops += 1;
			if hops > 256 {
				return false;
			}
			current = {
				let module = self.module(id.module);
				module.classes[id.index].superclass.clone()
			};
		}
		false
	}

	/// Whether `class` (or one of its interfaces, transitively) implements
	/// `iface`.
	pub fn class_implements(&mut self, iface: ClassId, class: ClassId) -> bool {
		let ifaces = {
			let module = self.module(class.module);
			module.classes[class.index].ifaces.clone()
		};
		for candidate in ifaces {
			let Ok(Some(id)) = self.materialize_class(&candidate) else { continue };
			if id == iface || self.class_is_super(iface, id) || self.class_implements(iface, id) {
				return true;
			}
		}
		false
	}

	fn class_cmp(&mut self, a: &ClassRef, b: &ClassRef) -> Result<Ordering, Incomparable> {
		if a.name().is_some() && a.name() == b.name() {
			return Ok(Ordering::Equal);
		}
		let (Ok(Some(a_id)), Ok(Some(b_id))) = (self.materialize_class(a), self.materialize_class(b))
		else {
			return Err(Incomparable);
		};
		if a_id == b_id {
			return Ok(Ordering::Equal);
		}
		if self.class_is_super(a_id, b_id) || self.class_implements(a_id, b_id) {
			return Ok(Ordering::Greater);
		}
		if self.class_is_super(b_id, a_id) || self.class_implements(b_id, a_id) {
			return Ok(Ordering::Less);
		}
		Err(Incomparable)
	}

	/// Coverage comparison of two type tokens.
	pub fn cmp_types(&mut self, a: &TypeToken, b: &TypeToken) -> Result<Ordering, Incomparable> {
		if a.to_jts() == b.to_jts() {
			return Ok(Ordering::Equal);
		}
		// The wildcard (and the null object wildcard) sits below everything.
		match (a, b) {
			(TypeToken::Wildcard | TypeToken::Null, _) => return Ok(Ordering::Less),
			(_, TypeToken::Wildcard | TypeToken::Null) => return Ok(Ordering::Greater),
			_ => {}
		}
		match (a, b) {
			(TypeToken::Prim(pa), TypeToken::Prim(pb)) => prim_cmp(*pa, *pb),
			(TypeToken::Object(ca), TypeToken::Object(cb)) => self.class_cmp(ca, cb),
			(
				TypeToken::Array { dims: da, elem: ea },
				TypeToken::Array { dims: db, elem: eb },
			) if da == db => match (ea, eb) {
				(ArrayElem::Prim(pa), ArrayElem::Prim(pb)) => prim_cmp(*pa, *pb),
				(ArrayElem::Object(ca), ArrayElem::Object(cb)) => self.class_cmp(ca, cb),
				_ => Err(Incomparable),
			},
			_ => Err(Incomparable),
		}
	}

	/// Whether every argument type is covered by (or equal to) the
	/// corresponding declared type. Used for overload selection.
	pub fn tlist_accepts(&mut self, args: &TypeList, declared: &TypeList) -> bool {
		if args.len() != declared.len() {
			return false;
		}
		for (arg, decl) in args.iter().zip(declared.iter()) {
			match self.cmp_types(arg, decl) {
				Ok(Ordering::Less) | Ok(Ordering::Equal) => {}
				_ => return false,
			}
		}
		true
	}

	/// Join a set of tokens: the greatest comparable candidate when one
	/// exists.
	pub fn join_tokens(&mut self, tokens: &[TypeToken]) -> Result<TypeToken, Incomparable> {
		let mut iter = tokens.iter();
		let mut best = iter.next().ok_or(Incomparable)?.clone();
		for token in iter {
			match self.cmp_types(token, &best)? {
				Ordering::Greater => best = token.clone(),
				_ => {}
			}
		}
		Ok(best)
	}

	/// Join with the degraded path: drop covered candidates, then pick the
	/// most common survivor, breaking ties by first appearance.
	pub fn join_tokens_no_fail(&mut self, tokens: &[TypeToken]) -> Option<TypeToken> {
		if tokens.is_empty() {
			return None;
		}
		if let Ok(joined) = self.join_tokens(tokens) {
			return Some(joined);
		}

		// Deduplicate, preserving first-appearance order.
		let mut reduced: Vec<TypeToken> = Vec::new();
		for token in tokens {
			if !reduced.contains(token) {
				reduced.push(token.clone());
			}
		}
		// Remove every candidate some other candidate covers.
		let mut kept: Vec<TypeToken> = Vec::new();
		'outer: for candidate in &reduced {
			for other in &reduced {
				if candidate == other {
					continue;
				}
				if let Ok(Ordering::Less) = self.cmp_types(candidate, other) {
					continue 'outer;
				}
			}
			kept.push(candidate.clone());
		}
		if kept.is_empty() {
			kept = reduced;
		}

		let mut best = kept[0].clone();
		let mut best_count = 0usize;
		for candidate in &kept {
			let count = tokens.iter().filter(|t| *t == candidate).count();
			if count > best_count {
				best = candidate.clone();
				best_count = count;
			}
		}
		Some(best)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn int_covers_narrow_kinds() {
		use PrimKind::*;
		assert_eq!(prim_cmp(Int, Short), Ok(Ordering::Greater));
		assert_eq!(prim_cmp(Byte, Int), Ok(Ordering::Less));
		assert_eq!(prim_cmp(Long, Int), Err(Incomparable));
		assert_eq!(prim_cmp(Char, Char), Ok(Ordering::Equal));
	}
}
