//! Errors that can occur while reading or parsing `build.ninja` files.

use crate::error::ErrorWithLocation;
use crate::path::PathError;
use raw_string::RawString;
use std::error::Error;
use std::fmt;

/// A syntax error.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParseError {
	ExpectedStatement,
	ExpectedVarDef,
	UnexpectedIndent,
	ExpectedPath,
	ExpectedColon,
	ExpectedName,
	ExpectedRuleName,
	ExpectedEndOfLine,
	InvalidEscape,
}

impl ParseError {
	fn message(self) -> &'static str {
		match self {
			ParseError::ExpectedStatement => {
				"Expected a statement: `build', `rule', `pool', `default', \
				 `include', `subninja', or a variable definition"
			}
			ParseError::ExpectedVarDef => "Expected `name = value'",
			ParseError::UnexpectedIndent => "Unexpected indentation",
			ParseError::ExpectedPath => "Expected a path",
			ParseError::ExpectedColon => "Expected `:'",
			ParseError::ExpectedName => "Expected a name",
			ParseError::ExpectedRuleName => "Expected a rule name",
			ParseError::ExpectedEndOfLine => "Trailing garbage at the end of the line",
			ParseError::InvalidEscape => "Bad $-escape (a literal `$' is written `$$')",
		}
	}
}

impl fmt::Display for ParseError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.message())
	}
}

impl Error for ParseError {}

/// Variable definitions refer to each other in a loop, so expansion would
/// never finish.
#[derive(Debug)]
pub struct ExpansionError {
	/// The variables involved in the cycle, innermost first: for
	/// `a -> b -> c -> a` this holds `["c", "b", "a"]`.
	pub cycle: Vec<String>,
}

impl fmt::Display for ExpansionError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Recursive variable definitions: ")?;
		for name in self.cycle.iter().rev() {
			write!(f, "{} -> ", name)?;
		}
		match self.cycle.last() {
			Some(start) => write!(f, "{}", start),
			None => write!(f, "?"),
		}
	}
}

impl Error for ExpansionError {}

/// An error while loading a `build.ninja` file into a build graph.
#[derive(Debug)]
pub enum LoadError {
	/// Some syntax error.
	ParseError(ParseError),
	/// A `build` definition refers to a `rule` which doesn't exist.
	UndefinedRule(String),
	/// A `build` definition refers to a `pool` which doesn't exist.
	UndefinedPool(RawString),
	/// A rule with this name was already defined.
	DuplicateRule(String),
	/// A pool with this name was already defined.
	DuplicatePool(String),
	/// The depth value of a `pool` is not a valid value.
	InvalidPoolDepth,
	/// Missing the `depth =` variable in a pool definition.
	ExpectedPoolDepth,
	/// Got a definition of a variable which is not recognized in this
	/// (`pool` or `rule`) definition.
	UnknownVariable(String),
	/// Variable expansion encountered a cycle.
	ExpansionError(ExpansionError),
	/// Two `build` definitions both generate the same output.
	DuplicateOutput(RawString),
	/// A path couldn't be canonicalized.
	InvalidPath { path: RawString, error: PathError },
	/// An edge binds a `dyndep` file but does not list it as an input.
	DyndepNotInput(RawString),
	/// A `default` statement names a target no `build` definition makes.
	UnknownDefaultTarget(RawString),
	/// A problem while trying to open or read a file.
	IoError {
		file_name: std::path::PathBuf,
		error: std::io::Error,
	},
	/// Invalid UTF-8 encoding in a path.
	InvalidUtf8,
}

impl fmt::Display for LoadError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			LoadError::ParseError(e) => write!(f, "{}", e),
			LoadError::UndefinedRule(n) => write!(f, "Undefined rule name: {}", n),
			LoadError::UndefinedPool(n) => write!(f, "Undefined pool name: {}", n),
			LoadError::DuplicateRule(n) => write!(f, "Duplicate rule: {}", n),
			LoadError::DuplicatePool(n) => write!(f, "Duplicate pool: {}", n),
			LoadError::InvalidPoolDepth => write!(f, "Invalid pool depth"),
			LoadError::ExpectedPoolDepth => write!(f, "Missing `depth =' line"),
			LoadError::UnknownVariable(n) => write!(f, "Unexpected variable: {}", n),
			LoadError::ExpansionError(e) => write!(f, "{}", e),
			LoadError::DuplicateOutput(n) => write!(f, "Multiple rules generate {}", n),
			LoadError::InvalidPath { path, error } => {
				write!(f, "Invalid path {}: {}", path, error)
			}
			LoadError::DyndepNotInput(n) => {
				write!(f, "dyndep file {} is not an input of the edge that uses it", n)
			}
			LoadError::UnknownDefaultTarget(n) => {
				write!(f, "Unknown default target: {}", n)
			}
			LoadError::IoError { file_name, error } => {
				write!(f, "Unable to read {:?}: {}", file_name, error)
			}
			LoadError::InvalidUtf8 => write!(f, "Invalid UTF-8 encoding"),
		}
	}
}

impl Error for LoadError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			LoadError::IoError { error, .. } => Some(error),
			_ => None,
		}
	}
}

impl From<ParseError> for LoadError {
	fn from(src: ParseError) -> LoadError {
		LoadError::ParseError(src)
	}
}

impl From<ExpansionError> for LoadError {
	fn from(src: ExpansionError) -> LoadError {
		LoadError::ExpansionError(src)
	}
}

impl From<std::str::Utf8Error> for LoadError {
	fn from(_: std::str::Utf8Error) -> LoadError {
		LoadError::InvalidUtf8
	}
}

impl From<ErrorWithLocation<ParseError>> for ErrorWithLocation<LoadError> {
	fn from(src: ErrorWithLocation<ParseError>) -> Self {
		src.convert()
	}
}

impl From<ErrorWithLocation<ExpansionError>> for ErrorWithLocation<LoadError> {
	fn from(src: ErrorWithLocation<ExpansionError>) -> Self {
		src.convert()
	}
}

impl From<ErrorWithLocation<std::str::Utf8Error>> for ErrorWithLocation<LoadError> {
	fn from(src: ErrorWithLocation<std::str::Utf8Error>) -> Self {
		src.convert()
	}
}
