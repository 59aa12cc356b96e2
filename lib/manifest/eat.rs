//! Low-level token scanning for manifest lines.

use super::error::ParseError;
use super::expand::check_escapes;
use raw_string::RawStr;
use std::str::from_utf8_unchecked;

/// Skip over leading spaces, returning how many were skipped.
///
/// The count matters: indentation is how variable blocks under `build`
/// and `rule` statements are recognized.
pub fn eat_whitespace(src: &mut &RawStr) -> usize {
	let mut n = 0;
	while src.first() == Some(b' ') {
		*src = &src[1..];
		n += 1;
	}
	n
}

/// Characters allowed in declared names: statement keywords, rule, pool,
/// and variable definitions.
pub fn is_identifier_char(c: u8) -> bool {
	is_var_name_char(c) || c == b'.'
}

/// Characters allowed in a bare `$var` reference. Unlike declared names
/// this excludes `.`, so `$out.rsp` reads as `$out` followed by the
/// literal `.rsp`. A dotted name can still be referenced as `${a.b}`.
pub fn is_var_name_char(c: u8) -> bool {
	c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}

pub fn eat_identifier<'a>(src: &mut &'a RawStr) -> Option<&'a str> {
	eat_name(src, is_identifier_char)
}

pub fn eat_var_name<'a>(src: &mut &'a RawStr) -> Option<&'a str> {
	eat_name(src, is_var_name_char)
}

fn eat_name<'a>(src: &mut &'a RawStr, allowed: fn(u8) -> bool) -> Option<&'a str> {
	let ident_end = src
		.bytes()
		.position(|c| !allowed(c))
		.unwrap_or(src.len());
	let (ident, rest) = src.split_at(ident_end);
	*src = rest;
	if ident.is_empty() {
		None
	} else {
		// Name characters are all ASCII.
		Some(unsafe { from_utf8_unchecked(ident.as_bytes()) })
	}
}

/// Read one path token: everything up to the first unescaped ` `, `:`,
/// or `|`. The token keeps its `$`-escapes; expansion deals with those
/// later.
pub fn eat_path<'a>(src: &mut &'a RawStr) -> Result<&'a RawStr, ParseError> {
	let line = *src;
	let bytes = line.as_bytes();
	let mut end = 0;
	loop {
		let at = match memchr::memchr3(b' ', b':', b'|', &bytes[end..]) {
			Some(n) => end + n,
			// The whole rest of the line is one token.
			None => break finish_path(src, bytes.len()),
		};
		if at > 0 && bytes[at - 1] == b'$' {
			// "$ ", "$:", or "$|": an escaped separator is part of the
			// path.
			end = at + 1;
			continue;
		}
		if at > 0 && bytes[at] == b' ' && bytes[at - 1] == b'\n' {
			// Indentation right after a "$\n" line continuation; skip to
			// where the path resumes.
			end = at + 1;
			while bytes.get(end) == Some(&b' ') {
				end += 1;
			}
			continue;
		}
		break finish_path(src, at);
	}
}

fn finish_path<'a>(src: &mut &'a RawStr, end: usize) -> Result<&'a RawStr, ParseError> {
	let (path, rest) = src.split_at(end);
	*src = rest;
	if path.is_empty() {
		return Err(ParseError::ExpectedPath);
	}
	check_escapes(path)?;
	Ok(path)
}

/// Read space-separated paths until one of `terminators` (which is
/// consumed) or the end of the line. Returns the paths together with the
/// terminator that stopped the scan.
pub fn eat_paths<'a>(
	src: &mut &'a RawStr,
	terminators: &[u8],
) -> Result<(Vec<&'a RawStr>, Option<u8>), ParseError> {
	let mut paths = Vec::new();
	loop {
		match src.first() {
			None => return Ok((paths, None)),
			Some(c) if terminators.contains(&c) => {
				*src = &src[1..];
				return Ok((paths, Some(c)));
			}
			Some(_) => {}
		}
		paths.push(eat_path(src)?);
		eat_whitespace(src);
	}
}
