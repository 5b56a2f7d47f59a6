//! Packed-identifier and literal decoding.
//!
//! Identifiers are stored as byte sequences indexing a fixed 256-entry
//! fragment dictionary; byte `0xFF` escapes the next byte as a literal
//! ASCII character. Literals from the data pool use `$`-escaping
//! (`$$` for a dollar sign, `$xx` for a hex-coded byte).

use crate::reader::{Reader, Result};

/// The fixed fragment dictionary. Entry `0xFF` is never indexed directly;
/// that byte value escapes the following byte instead.
pub const DECODE_TABLE: [&str; 256] = [
	"", "in", "et", "it", "init", "init>", "de", "ce", "get", "cl", "<init>", "er", "re", "<cl",
	"<clinit>", "im", "on", "at", "vi", "en", "vice", "rim", "net", "device", "ap", "or", "api",
	"st", "ion", "pt", "set", "al", "ro", "an", "ec", "ed", "$", "ad", "St", "th", "In", "ss",
	"ert", "Pro", "am", "ry", ".", "ord", "0", "1", "2", "3", "4", "5", "6", "7", "8", "9",
	"ata", "em", "<", "rypt", ">", "ut", "ar", "A", "B", "C", "D", "E", "F", "G", "H", "I", "J",
	"K", "L", "M", "N", "O", "P", "Q", "R", "S", "T", "U", "V", "W", "X", "Y", "Z", "co", "pert",
	"ic", "crypt", "_", "us", "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m",
	"n", "o", "p", "q", "r", "s", "t", "u", "v", "w", "x", "y", "z", "Propert", "Property", "ey",
	"le", "Data", "va", "se", "ate", "ava", "ing", "Rec", "Val", "java", "ption", "oc", "ent",
	"el", "ang", "io", "id", "um", "rit", "crypto", "yst", "ystem", "Ex", "Record", "ch", "Exce",
	"Exception", "read", "is", "gth", "ort", "ength", "ist", "int", "Re", "Key", "un", "mp",
	"writ", "write", "Co", "la", "By", "Length", "ui", "gr", "ress", "ac", "ur", "gram", "to",
	"ig", "Fi", "add", "ex", "dex", "Datagram", "PropertyVal", "Ch", "iv", "Index", "ring",
	"ont", "od", "eld", "Field", "String", "ase", "ation", "ect", "ll", "Of", "ocus", "ag",
	"List", "end", "Ad", "cld", "cldc", "lic", "ra", "up", "comp", "rec", "ran", "record",
	"Focus", "ow", "rans", "ext", "te", "ew", "getP", "il", "ener", "umb", "op", "iz", "getM",
	"lang", "system", "System", "base", "age", "der", "ip", "No", "He", "key", "Listener", "ize",
	"ub", "thumb", "Up", "Stre", "Id", "pa", "Stream", "open", "ess", "Stat", "out", "ange",
	"send", "port", "idth", "essage", "ition", "ime", "\u{ff}",
];

const ESCAPE: u8 = 0xFF;

/// Decode a packed identifier byte sequence (without its NUL terminator).
pub fn decode_identifier(bytes: &[u8]) -> String {
	let mut out = String::with_capacity(bytes.len() * 2);
	let mut i = 0;
	while i < bytes.len() {
		let byte = bytes[i];
		if byte == ESCAPE {
			if i + 1 < bytes.len() {
				out.push(bytes[i + 1] as char);
			}
			i += 1;
		} else {
			out.push_str(DECODE_TABLE[byte as usize]);
		}
		i += 1;
	}
	out
}

/// Encode a string as a packed identifier using greedy longest-fragment
/// matching; characters with no fragment are `0xFF`-escaped. Used by the
/// test corpus builders; `decode_identifier(encode_identifier(s)) == s`.
pub fn encode_identifier(s: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity(s.len());
	let mut rest = s;
	while !rest.is_empty() {
		let mut best: Option<(usize, usize)> = None;
		for (idx, frag) in DECODE_TABLE.iter().enumerate() {
			if idx == ESCAPE as usize || frag.is_empty() {
				continue;
			}
			if rest.starts_with(frag) {
				match best {
					Some((_, len)) if len >= frag.len() => {}
					_ => best = Some((idx, frag.len())),
				}
			}
		}
		match best {
			Some((idx, len)) => {
				out.push(idx as u8);
				rest = &rest[len..];
			}
			None => {
				let ch = rest.chars().next().unwrap();
				out.push(ESCAPE);
				out.push(ch as u8);
				rest = &rest[ch.len_utf8()..];
			}
		}
	}
	out
}

/// Read a NUL-terminated packed identifier from the cursor, with source
/// dots canonicalized to slashes.
pub fn read_identifier(reader: &mut Reader) -> Result<String> {
	let bytes = reader.cstr()?;
	Ok(decode_identifier(bytes).replace('.', "/"))
}

/// Undo `$`-escaping: `$$` emits a dollar sign, `$xx` emits byte `0xXX`.
/// Malformed escapes are passed through unchanged.
pub fn unescape(s: &str) -> String {
	let bytes = s.as_bytes();
	let mut out = String::with_capacity(s.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'$' {
			if bytes.get(i + 1) == Some(&b'$') {
				out.push('$');
				i += 2;
				continue;
			}
			if let Some(hex) = s.get(i + 1..i + 3) {
				if let Ok(value) = u8::from_str_radix(hex, 16) {
					out.push(value as char);
					i += 3;
					continue;
				}
			}
		}
		out.push(bytes[i] as char);
		i += 1;
	}
	out
}

fn element_size(data_type: u32) -> u32 {
	match data_type {
		3 | 4 => 2,
		5 => 4,
		6 => 8,
		_ => 1,
	}
}

/// Split a 4-byte data-pool item header into `(type, byte_length)`.
pub fn parse_data_header(header: u32) -> (u32, u32) {
	let data_type = (header & 0x1E_0000) >> 17;
	let length = header & 0x1_FFFF;
	(data_type, length * element_size(data_type))
}

/// Read a data-pool string literal. When `needs_header` is set, the cursor
/// points just past a 4-byte item header that carries the element width and
/// length; otherwise the literal is NUL-terminated (or `explicit_length`
/// elements long).
pub fn read_literal(
	reader: &mut Reader,
	mut is_unicode: bool,
	needs_header: bool,
	explicit_length: Option<usize>,
) -> Result<String> {
	let mut length = explicit_length;
	if needs_header {
		reader.skip(-4);
		let (data_type, byte_length) = parse_data_header(reader.u32()?);
		let width = element_size(data_type);
		is_unicode = width == 2;
		length = Some((byte_length / width) as usize);
	}

	let mut out = String::new();
	if is_unicode {
		let units = match length {
			Some(n) => reader.array_fixed(n, |r| r.u16())?,
			None => reader.array_terminated(0u16, |r| r.u16())?,
		};
		for unit in units {
			out.push(char::from_u32(unit as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
		}
	} else {
		let bytes = match length {
			Some(n) => reader.bytes(n)?.to_vec(),
			None => reader.array_terminated(0u8, |r| r.u8())?,
		};
		for byte in bytes {
			out.push(byte as char);
		}
	}
	Ok(out)
}

/// Read a literal and undo `$`-escaping (module names and versions).
pub fn read_escaped_literal(reader: &mut Reader) -> Result<String> {
	Ok(unescape(&read_literal(reader, false, false, None)?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn escape_emits_literal_ascii() {
		// 0x0A = "<init>", 0xFF 0x41 = literal 'A'
		assert_eq!(decode_identifier(&[0x0A, 0xFF, 0x41]), "<init>A");
	}

	#[test]
	fn empty_identifier() {
		assert_eq!(decode_identifier(&[]), "");
	}

	#[test]
	fn dots_canonicalized() {
		let encoded = encode_identifier("java.lang.Object");
		let mut reader_bytes = encoded.clone();
		reader_bytes.push(0);
		let mut reader = Reader::new(&reader_bytes);
		assert_eq!(read_identifier(&mut reader).unwrap(), "java/lang/Object");
	}

	#[test]
	fn unescape_dollars() {
		assert_eq!(unescape("a$2dr"), "a-r");
		assert_eq!(unescape("x$$y"), "x$y");
		assert_eq!(unescape("plain"), "plain");
	}

	#[test]
	fn data_headers() {
		// type 5 (4-byte elements), 3 elements
		let header = (5 << 17) | 3;
		assert_eq!(parse_data_header(header), (5, 12));
		// type 3 (2-byte elements), 2 elements
		let header = (3 << 17) | 2;
		assert_eq!(parse_data_header(header), (3, 4));
	}

	#[test]
	fn dictionary_words_round_trip() {
		for (idx, word) in DECODE_TABLE.iter().enumerate() {
			if idx == 0xFF || word.is_empty() {
				continue;
			}
			let encoded = encode_identifier(word);
			assert_eq!(&decode_identifier(&encoded), word, "entry {idx}");
		}
	}

	#[test]
	fn dictionary_words_with_suffix_round_trip() {
		for suffix in 0u8..=255 {
			if suffix == 0 {
				continue;
			}
			let word = format!("device{}", suffix as char);
			let encoded = encode_identifier(&word);
			assert_eq!(decode_identifier(&encoded), word);
		}
	}

	proptest! {
		#[test]
		fn ascii_strings_round_trip(s in "[ -~]{0,40}") {
			let encoded = encode_identifier(&s);
			prop_assert_eq!(decode_identifier(&encoded), s);
		}
	}
}
