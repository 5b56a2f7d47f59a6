//! Type tokens, type lists, and the JTS descriptor notation.

use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use cordite_derive::FromRepr;

use crate::errors::ParseError;
use crate::reader::{Reader, Result};
use crate::resolve::refs::{ClassRef, RefScope};

pub const STRING_CLASS: &str = "java/lang/String";

/// Primitive kinds, with the container's type-code ordinals.
#[repr(u8)]
#[derive(FromRepr, Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PrimKind {
	Boolean = 1,
	Byte = 2,
	Char = 3,
	Short = 4,
	Int = 5,
	Long = 6,
	Void = 10,
	Float = 11,
	Double = 12,
}

impl PrimKind {
	pub fn jts_char(self) -> char {
		match self {
			Self::Boolean => 'Z',
			Self::Byte => 'B',
			Self::Char => 'C',
			Self::Short => 'S',
			Self::Int => 'I',
			Self::Long => 'J',
			Self::Void => 'V',
			Self::Float => 'F',
			Self::Double => 'D',
		}
	}

	pub fn from_jts_char(c: char) -> Option<Self> {
		Some(match c {
			'Z' => Self::Boolean,
			'B' => Self::Byte,
			'C' => Self::Char,
			'S' => Self::Short,
			'I' => Self::Int,
			'J' => Self::Long,
			'V' => Self::Void,
			'F' => Self::Float,
			'D' => Self::Double,
			_ => return None,
		})
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Boolean => "boolean",
			Self::Byte => "byte",
			Self::Char => "char",
			Self::Short => "short",
			Self::Int => "int",
			Self::Long => "long",
			Self::Void => "void",
			Self::Float => "float",
			Self::Double => "double",
		}
	}

	/// Wide primitives occupy two stack/local slots; `void` occupies none.
	pub fn slots(self) -> usize {
		match self {
			Self::Long | Self::Double => 2,
			Self::Void => 0,
			_ => 1,
		}
	}
}

impl Display for PrimKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArrayElem {
	Prim(PrimKind),
	Object(ClassRef),
}

/// A single type reference from the container (or synthesized by the
/// scanner). `Wildcard` and `Null` exist only during scanning and are
/// never persisted into a routine signature.
#[derive(Clone, Debug)]
pub enum TypeToken {
	/// Unknown stack slot.
	Wildcard,
	/// Unknown *object* stack slot (pushed by `aconst_null`).
	Null,
	Prim(PrimKind),
	Object(ClassRef),
	Array { dims: u8, elem: ArrayElem },
}

impl TypeToken {
	pub fn string() -> Self {
		Self::Object(ClassRef::named(RefScope::Global, STRING_CLASS))
	}

	pub fn object(class: ClassRef) -> Self {
		Self::Object(class)
	}

	/// Parse a token from its header byte onward.
	pub fn parse(reader: &mut Reader) -> Result<Self> {
		let offset = reader.tell();
		let code = reader.u8()? & 0x0f;
		Ok(match code {
			0 => Self::Wildcard,
			7 | 9 => {
				let (m, c) = (reader.u8()?, reader.u8()?);
				Self::Object(ClassRef::raw(m, c))
			}
			8 => {
				let dims = reader.u8()?;
				let elem_code = reader.u8()?;
				let elem = match elem_code {
					7 => {
						let (m, c) = (reader.u8()?, reader.u8()?);
						ArrayElem::Object(ClassRef::raw(m, c))
					}
					14 => ArrayElem::Object(ClassRef::named(RefScope::Global, STRING_CLASS)),
					_ => ArrayElem::Prim(PrimKind::from_repr(elem_code).ok_or_else(|| {
						ParseError::malformed(offset, format!("bad_array_type_code[{elem_code}]"))
					})?),
				};
				Self::Array { dims, elem }
			}
			14 => Self::string(),
			_ => Self::Prim(
				PrimKind::from_repr(code)
					.ok_or_else(|| ParseError::malformed(offset, format!("bad_type_code[{code}]")))?,
			),
		})
	}

	/// Binary encoding of tokens built from raw class ids and primitives;
	/// used by the corpus builders.
	pub fn encode_into(&self, out: &mut Vec<u8>) {
		match self {
			Self::Wildcard | Self::Null => out.push(0),
			Self::Prim(p) => out.push(*p as u8),
			Self::Object(class) => {
				out.push(7);
				push_raw_class(class, out);
			}
			Self::Array { dims, elem } => {
				out.push(8);
				out.push(*dims);
				match elem {
					ArrayElem::Prim(p) => out.push(*p as u8),
					ArrayElem::Object(class) => {
						out.push(7);
						push_raw_class(class, out);
					}
				}
			}
		}
	}

	pub fn is_object(&self) -> bool {
		matches!(self, Self::Object(_) | Self::Null)
	}

	pub fn is_array(&self) -> bool {
		matches!(self, Self::Array { .. })
	}

	pub fn is_wide(&self) -> bool {
		matches!(self, Self::Prim(PrimKind::Long | PrimKind::Double))
	}

	pub fn slots(&self) -> usize {
		match self {
			Self::Prim(p) => p.slots(),
			_ => 1,
		}
	}

	pub fn class_ref(&self) -> Option<&ClassRef> {
		match self {
			Self::Object(class) => Some(class),
			Self::Array { elem: ArrayElem::Object(class), .. } => Some(class),
			_ => None,
		}
	}

	pub fn to_jts(&self) -> String {
		let mut out = String::new();
		self.write_jts(&mut out);
		out
	}

	fn write_jts(&self, out: &mut String) {
		match self {
			Self::Wildcard | Self::Null => out.push('*'),
			Self::Prim(p) => out.push(p.jts_char()),
			Self::Object(class) => match class.name() {
				Some(name) => {
					out.push('L');
					out.push_str(&name);
					out.push(';');
				}
				None => {
					out.push('L');
					out.push_str(&class.to_string());
					out.push(';');
				}
			},
			Self::Array { dims, elem } => {
				for _ in 0..*dims {
					out.push('[');
				}
				match elem {
					ArrayElem::Prim(p) => out.push(p.jts_char()),
					ArrayElem::Object(class) => {
						out.push('L');
						out.push_str(&class.name().unwrap_or_else(|| class.to_string().into()));
						out.push(';');
					}
				}
			}
		}
	}

	/// Parse a single JTS descriptor; object names become lazy references
	/// anchored to `scope`.
	pub fn from_jts(jts: &str, scope: &RefScope) -> std::result::Result<Self, String> {
		let dims = jts.bytes().take_while(|b| *b == b'[').count();
		let rest = &jts[dims..];
		if dims > 0 {
			let elem = match rest.chars().next() {
				Some('L') => {
					let name = rest
						.strip_prefix('L')
						.and_then(|r| r.strip_suffix(';'))
						.ok_or_else(|| format!("JTS syntax error in '{jts}'"))?;
					ArrayElem::Object(ClassRef::named(scope.clone(), name))
				}
				Some(c) => ArrayElem::Prim(
					PrimKind::from_jts_char(c).ok_or_else(|| format!("JTS syntax error in '{jts}'"))?,
				),
				None => return Err(format!("JTS syntax error in '{jts}'")),
			};
			return Ok(Self::Array { dims: dims as u8, elem });
		}
		match rest.chars().next() {
			Some('L') => {
				let name = rest
					.strip_prefix('L')
					.and_then(|r| r.strip_suffix(';'))
					.ok_or_else(|| format!("JTS syntax error in '{jts}' (no trailing ';')"))?;
				Ok(Self::Object(ClassRef::named(scope.clone(), name)))
			}
			Some('*') => Ok(Self::Wildcard),
			Some(c) => Ok(Self::Prim(
				PrimKind::from_jts_char(c)
					.ok_or_else(|| format!("JTS syntax error (unknown type '{c}') in '{jts}'"))?,
			)),
			None => Err(format!("JTS syntax error: empty descriptor")),
		}
	}
}

impl Display for TypeToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_jts())
	}
}

impl PartialEq for TypeToken {
	fn eq(&self, other: &Self) -> bool {
		self.to_jts() == other.to_jts()
	}
}

impl Eq for TypeToken {}

fn push_raw_class(class: &ClassRef, out: &mut Vec<u8>) {
	match class.slot() {
		crate::resolve::refs::ClassSlot::Raw(m, c) => {
			out.push(m);
			out.push(c);
		}
		_ => {
			out.push(255);
			out.push(255);
		}
	}
}

/// An ordered sequence of type tokens (a signature fragment).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeList(pub Vec<TypeToken>);

impl TypeList {
	pub fn empty() -> Self {
		Self(Vec::new())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, TypeToken> {
		self.0.iter()
	}

	pub fn first(&self) -> Option<&TypeToken> {
		self.0.first()
	}

	pub fn slots(&self) -> usize {
		self.0.iter().map(TypeToken::slots).sum()
	}

	/// Parse a packed type list. The length header byte encodes the byte
	/// width of the token stream that follows; a single RLE byte precedes
	/// every token after the first, its upper nybble + 1 giving the run
	/// length applied to that token.
	pub fn parse(reader: &mut Reader) -> Result<Self> {
		let start = reader.tell();
		let hdr = reader.u8()?;
		let mut length: isize;
		if hdr & 0x80 != 0 {
			let mut l = (hdr & 0x7f) as isize;
			// The long form always carries a second header byte; its upper
			// nybble extends the length only when bit 0x40 is set.
			let ext = reader.u8()?;
			if l & 0x40 != 0 {
				l &= 0xbf;
				l <<= 4;
				l += ((ext & 0xf0) >> 4) as isize;
			}
			length = l - 1;
		} else {
			length = ((hdr & 0x70) >> 4) as isize;
		}

		let mut tokens = Vec::new();
		if length > 0 {
			length -= 1;
			let end = reader.tell() + length as usize;
			let fail = |err: ParseError| {
				ParseError::malformed(start, format!("bad_type_list[{start:#07x}..{end:#07x}; {err}]"))
			};
			if length > 0 {
				tokens.push(TypeToken::parse(reader).map_err(&fail)?);
				while reader.tell() < end {
					let rle = reader.u8().map_err(&fail)?;
					let item = TypeToken::parse(reader).map_err(&fail)?;
					for _ in 0..((rle >> 4) as usize + 1) {
						tokens.push(item.clone());
					}
				}
			}
		}
		Ok(Self(tokens))
	}

	/// Binary encoding matching `parse`; used by the corpus builders.
	pub fn encode_into(&self, out: &mut Vec<u8>) {
		let mut body = Vec::new();
		let mut iter = self.0.iter().peekable();
		if let Some(first) = iter.next() {
			first.encode_into(&mut body);
			while let Some(token) = iter.next() {
				let mut run = 1usize;
				while run < 16 {
					match iter.peek() {
						Some(next) if *next == token => {
							iter.next();
							run += 1;
						}
						_ => break,
					}
				}
				body.push(((run - 1) << 4) as u8);
				token.encode_into(&mut body);
			}
		}

		// Short headers decode the nybble minus one as the body width; long
		// headers decode their 7-bit (optionally extended) value minus two
		// and always carry a second header byte, meaningful only in the
		// extended form.
		let short = body.len() + 1;
		let long = body.len() + 2;
		if short <= 7 {
			out.push(((short << 4) & 0x70) as u8);
		} else if long <= 0x3f {
			out.push(0x80 | long as u8);
			out.push(0);
		} else {
			out.push(0x80 | 0x40 | ((long >> 4) as u8 & 0x3f));
			out.push(((long & 0x0f) << 4) as u8);
		}
		out.extend_from_slice(&body);
	}

	pub fn to_jts(&self) -> String {
		let mut out = String::new();
		for token in &self.0 {
			token.write_jts(&mut out);
		}
		out
	}

	/// JTS of the list with the receiver slot skipped (for non-static
	/// routine descriptors).
	pub fn to_jts_skip_first(&self) -> String {
		let mut out = String::new();
		for token in self.0.iter().skip(1) {
			token.write_jts(&mut out);
		}
		out
	}

	pub fn from_jts(jts: &str, scope: &RefScope) -> std::result::Result<Self, String> {
		let mut tokens = Vec::new();
		for part in split_jts(jts)? {
			tokens.push(TypeToken::from_jts(part, scope)?);
		}
		Ok(Self(tokens))
	}
}

impl Display for TypeList {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_jts())
	}
}

impl std::ops::Index<usize> for TypeList {
	type Output = TypeToken;
	fn index(&self, index: usize) -> &TypeToken {
		&self.0[index]
	}
}

/// Split a concatenation of JTS descriptors into individual descriptors.
pub fn split_jts(jts: &str) -> std::result::Result<Vec<&str>, String> {
	let bytes = jts.as_bytes();
	let mut parts = Vec::new();
	let mut mark = 0;
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'[' => i += 1,
			b'L' => {
				i += 1;
				loop {
					if i >= bytes.len() {
						return Err(format!("JTS syntax error in '{jts}'; no terminator for class name"));
					}
					let c = bytes[i];
					i += 1;
					if c == b';' {
						break;
					}
				}
				parts.push(&jts[mark..i]);
				mark = i;
			}
			b'*' => {
				i += 1;
				parts.push(&jts[mark..i]);
				mark = i;
			}
			c => {
				if PrimKind::from_jts_char(c as char).is_none() {
					return Err(format!("JTS syntax error in '{jts}'; unexpected character '{}'", c as char));
				}
				i += 1;
				parts.push(&jts[mark..i]);
				mark = i;
			}
		}
	}
	Ok(parts)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse_list(bytes: &[u8]) -> TypeList {
		let mut reader = Reader::new(bytes);
		TypeList::parse(&mut reader).unwrap()
	}

	#[test]
	fn empty_list_header() {
		// Length nybble 1, decremented to 0: an empty list.
		assert!(parse_list(&[0x10]).is_empty());
	}

	#[test]
	fn single_primitive() {
		let tl = parse_list(&[0x20, 0x05]);
		assert_eq!(tl.to_jts(), "I");
	}

	#[test]
	fn rle_run_applies_to_following_token() {
		// First token, then one run of 3 ints.
		let tl = parse_list(&[0x40, 0x02, 0x20, 0x05]);
		assert_eq!(tl.to_jts(), "BIII");
	}

	#[test]
	fn class_tokens_carry_raw_ids() {
		let tl = parse_list(&[0x40, 0x07, 0x00, 0x02]);
		assert_eq!(tl.len(), 1);
		assert!(matches!(
			tl[0].class_ref().unwrap().slot(),
			crate::resolve::refs::ClassSlot::Raw(0, 2)
		));
	}

	#[test]
	fn slots_count_wide_types() {
		let scope = RefScope::Global;
		let tl = TypeList::from_jts("IJD[JLjava/lang/String;", &scope).unwrap();
		assert_eq!(tl.slots(), 1 + 2 + 2 + 1 + 1);
	}

	#[test]
	fn jts_round_trip() {
		let scope = RefScope::Global;
		for jts in ["", "I", "V", "[[I", "Ljava/lang/String;", "[Ljava/lang/String;IJ"] {
			let tl = TypeList::from_jts(jts, &scope).unwrap();
			assert_eq!(tl.to_jts(), *jts);
		}
	}

	#[test]
	fn split_jts_rejects_garbage() {
		assert!(split_jts("Q").is_err());
		assert!(split_jts("Ljava/lang/String").is_err());
	}

	#[test]
	fn encode_parse_round_trip() {
		use PrimKind::*;
		let lists = [
			vec![],
			vec![TypeToken::Prim(Int)],
			vec![TypeToken::Prim(Long), TypeToken::Prim(Long)],
			vec![TypeToken::Object(ClassRef::raw(0, 1)), TypeToken::Prim(Byte)],
			vec![TypeToken::Array { dims: 2, elem: ArrayElem::Prim(Char) }],
			vec![TypeToken::Prim(Int); 40],
		];
		for tokens in lists {
			let tl = TypeList(tokens);
			let mut bytes = Vec::new();
			tl.encode_into(&mut bytes);
			let reparsed = parse_list(&bytes);
			assert_eq!(reparsed.to_jts(), tl.to_jts());
		}
	}

	mod generated {
		use super::*;
		use proptest::prelude::*;

		fn any_token() -> impl Strategy<Value = TypeToken> {
			prop_oneof![
				Just(TypeToken::Prim(PrimKind::Boolean)),
				Just(TypeToken::Prim(PrimKind::Byte)),
				Just(TypeToken::Prim(PrimKind::Char)),
				Just(TypeToken::Prim(PrimKind::Short)),
				Just(TypeToken::Prim(PrimKind::Int)),
				Just(TypeToken::Prim(PrimKind::Long)),
				Just(TypeToken::Prim(PrimKind::Float)),
				Just(TypeToken::Prim(PrimKind::Double)),
				(0u8..4, 0u8..4).prop_map(|(m, c)| TypeToken::Object(ClassRef::raw(m, c))),
				(1u8..4, 1u8..6).prop_map(|(dims, code)| TypeToken::Array {
					dims,
					elem: ArrayElem::Prim(PrimKind::from_repr(code).unwrap()),
				}),
			]
		}

		proptest! {
			#[test]
			fn rle_lists_round_trip(tokens in proptest::collection::vec(any_token(), 0..64)) {
				let tl = TypeList(tokens);
				let mut bytes = Vec::new();
				tl.encode_into(&mut bytes);
				let mut reader = Reader::new(&bytes);
				let reparsed = TypeList::parse(&mut reader).unwrap();
				prop_assert_eq!(reparsed.to_jts(), tl.to_jts());
				prop_assert_eq!(reader.tell(), bytes.len());
			}
		}
	}
}
