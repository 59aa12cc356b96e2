//! Parsing of Makefile-style dependency files.
//!
//! Compilers such as GCC and Clang write these to report which headers a
//! translation unit actually included. A depfile consists of one or more
//! rule lines of the form `out: in1 in2 ...`; every rule line must name
//! the same targets, and their inputs accumulate.

use crate::path::{canonicalize_path_in_place, PathError};
use raw_string::{RawStr, RawString};
use std::error::Error;
use std::fmt;
use std::mem::replace;

/// The parsed contents of a dependency file.
///
/// All paths are canonicalized, and carry their slash bits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Depfile {
	/// The targets of the rule lines.
	pub outputs: Vec<(RawString, u64)>,
	/// The dependencies, in the order they appeared.
	pub deps: Vec<(RawString, u64)>,
}

/// A problem with the contents of a dependency file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DepfileError {
	/// A rule line has no `:` separating outputs from inputs.
	ExpectedColon,
	/// A rule line names a different target set than the first rule line.
	MultipleRules(RawString),
	/// A path in the file could not be canonicalized.
	Path(PathError),
}

impl fmt::Display for DepfileError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			DepfileError::ExpectedColon => write!(f, "Missing `:' in dependency file"),
			DepfileError::MultipleRules(target) => write!(
				f,
				"Dependency file names a second target set (starting with {})",
				target
			),
			DepfileError::Path(e) => write!(f, "{}", e),
		}
	}
}

impl Error for DepfileError {}

impl From<PathError> for DepfileError {
	fn from(src: PathError) -> DepfileError {
		DepfileError::Path(src)
	}
}

#[derive(Default)]
struct Parser {
	/// The (incomplete) token we're currently reading.
	token: RawString,
	/// The targets of the current rule line, once the `:` was seen.
	line_outputs: Vec<(RawString, u64)>,
	/// Whether the `:` was seen on the current rule line.
	targets_done: bool,
	/// Whether the current rule line has any content at all.
	line_has_tokens: bool,
	/// The result being accumulated.
	depfile: Depfile,
}

impl Parser {
	fn add_part(&mut self, s: &RawStr) {
		self.token.push_str(s);
	}

	/// A token boundary: canonicalize and classify the token read so far.
	fn finish_token(&mut self) -> Result<(), DepfileError> {
		if self.token.is_empty() {
			return Ok(());
		}
		let mut token = replace(&mut self.token, RawString::new());
		self.line_has_tokens = true;

		if !self.targets_done {
			if token == ":" {
				self.targets_done = true;
				return Ok(());
			}
			if token.last() == Some(b':') && token.len() > 1 {
				token.pop();
				let bits = canonicalize_path_in_place(&mut token)?;
				self.line_outputs.push((token, bits));
				self.targets_done = true;
				return Ok(());
			}
			let bits = canonicalize_path_in_place(&mut token)?;
			self.line_outputs.push((token, bits));
			return Ok(());
		}

		let bits = canonicalize_path_in_place(&mut token)?;
		self.depfile.deps.push((token, bits));
		Ok(())
	}

	/// The end of a logical (continuation-joined) line.
	fn finish_line(&mut self) -> Result<(), DepfileError> {
		self.finish_token()?;
		if !self.line_has_tokens {
			return Ok(());
		}
		if !self.targets_done {
			return Err(DepfileError::ExpectedColon);
		}
		let line_outputs = replace(&mut self.line_outputs, Vec::new());
		if self.depfile.outputs.is_empty() {
			self.depfile.outputs = line_outputs;
		} else if !same_targets(&self.depfile.outputs, &line_outputs) {
			let target = line_outputs
				.into_iter()
				.map(|(path, _)| path)
				.next()
				.unwrap_or_else(RawString::new);
			return Err(DepfileError::MultipleRules(target));
		}
		self.targets_done = false;
		self.line_has_tokens = false;
		Ok(())
	}
}

fn same_targets(a: &[(RawString, u64)], b: &[(RawString, u64)]) -> bool {
	let mut a: Vec<&RawStr> = a.iter().map(|(p, _)| &p[..]).collect();
	let mut b: Vec<&RawStr> = b.iter().map(|(p, _)| &p[..]).collect();
	a.sort();
	b.sort();
	a == b
}

/// Parse a dependency file.
pub fn parse(content: &RawStr) -> Result<Depfile, DepfileError> {
	let mut parser = Parser::default();

	for mut line in lines(content) {
		if line.last() == Some(b'\r') {
			line = &line[..line.len() - 1];
		}

		let mut write_offset = 0;
		let mut read_offset = 0;
		let mut continued = false;

		loop {
			match memchr::memchr2(b' ', b'\\', line[read_offset..].as_bytes())
				.map(|i| i + read_offset)
			{
				Some(i) if line[i] == b'\\' && i + 1 == line.len() => {
					// Backslash at the end of the line: the logical line
					// continues on the next physical line.
					parser.add_part(&line[write_offset..i]);
					parser.finish_token()?;
					continued = true;
					break;
				}
				Some(i) if line[i] == b'\\' => {
					match line[i + 1] {
						b' ' | b'\\' | b'#' | b'*' | b'[' | b']' | b'|' => {
							// Escaped character. Drop the '\'.
							parser.add_part(&line[write_offset..i]);
							write_offset = i + 1;
						}
						// Any other backslash passes through, so Windows
						// paths like c:\foo survive.
						_ => (),
					}
					read_offset = i + 2;
				}
				Some(i) => {
					debug_assert_eq!(line[i], b' ');
					parser.add_part(&line[write_offset..i]);
					parser.finish_token()?;
					write_offset = i + 1;
					read_offset = i + 1;
				}
				None => {
					parser.add_part(&line[write_offset..]);
					break;
				}
			}
		}

		if !continued {
			parser.finish_line()?;
		}
	}

	parser.finish_line()?;
	Ok(parser.depfile)
}

fn lines(content: &RawStr) -> impl Iterator<Item = &RawStr> {
	let mut rest = content;
	std::iter::from_fn(move || {
		if rest.is_empty() {
			return None;
		}
		match memchr::memchr(b'\n', rest.as_bytes()) {
			Some(n) => {
				let line = &rest[..n];
				rest = &rest[n + 1..];
				Some(line)
			}
			None => {
				let line = rest;
				rest = RawStr::from_str("");
				Some(line)
			}
		}
	})
}
