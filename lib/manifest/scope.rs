//! Variable and rule definition scoping and lookup.
//!
//! Lookup when an edge resolves `$v` goes: edge-local bindings first, then
//! the rule's (unexpanded) templates, then the enclosing file scope and
//! its `subninja` parents.

use raw_string::{RawStr, RawString};

use super::parse::Variable as Var;

/// A variable with a name and an (already expanded) definition.
#[derive(Debug)]
pub struct ExpandedVar<'a> {
	pub name: &'a str,
	pub value: RawString,
}

/// A rule definition with a name and a set of (unexpanded) binding
/// templates.
#[derive(Debug)]
pub struct Rule<'a> {
	pub name: &'a str,
	pub vars: Vec<Var<'a>>,
}

/// A file-level scope, containing variables and rules.
#[derive(Debug)]
pub struct FileScope<'a: 'p, 'p> {
	/// The scope of the file that subninja'd this file, if any.
	pub parent_scope: Option<&'p FileScope<'a, 'p>>,

	/// The variables defined in this file (and included files), in
	/// definition order. Duplicates are fine; the last one wins.
	pub vars: Vec<ExpandedVar<'a>>,

	/// The rules defined in this file (and included files).
	pub rules: Vec<Rule<'a>>,
}

/// The scope which includes the `build` variables, but not the `rule`
/// variables.
///
/// Input and output paths are expanded in this scope.
#[derive(Debug)]
pub struct BuildScope<'a> {
	pub file_scope: &'a FileScope<'a, 'a>,
	pub build_vars: &'a [ExpandedVar<'a>],
}

/// The scope in which the reserved bindings (`$command`, `$description`,
/// etc.) are resolved: `build` and `rule` variables, plus `$in`,
/// `$in_newline`, and `$out`.
#[derive(Debug)]
pub struct BuildRuleScope<'a> {
	pub build_scope: &'a BuildScope<'a>,
	pub rule_vars: &'a [Var<'a>],
	/// The explicit inputs, for `$in` and `$in_newline`.
	pub inputs: &'a [RawString],
	/// The explicit outputs, for `$out`.
	pub outputs: &'a [RawString],
}

/// How a path list is joined when `$in` or `$out` is expanded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PathsSeparator {
	Space,
	Newline,
}

/// The result of looking a variable up in a `VarScope`.
pub enum FoundVar<'a> {
	/// The definition was expanded when it was read.
	Expanded(&'a RawStr),

	/// The definition still contains variable references; `rule`
	/// templates are stored this way.
	Unexpanded(&'a RawStr),

	/// A built-in path list (`$in`, `$out`, `$in_newline`): the paths get
	/// shell-escaped and joined with the separator.
	Paths {
		paths: &'a [RawString],
		separator: PathsSeparator,
	},
}

/// A scope containing variable definitions.
pub trait VarScope {
	/// Look up a variable definition.
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar>;
}

impl<'a> VarScope for [Var<'a>] {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		// The last definition of a name wins.
		for var in self.iter().rev() {
			if var.name == var_name {
				return Some(FoundVar::Unexpanded(var.value));
			}
		}
		None
	}
}

impl<'a> VarScope for [ExpandedVar<'a>] {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		for var in self.iter().rev() {
			if var.name == var_name {
				return Some(FoundVar::Expanded(&var.value[..]));
			}
		}
		None
	}
}

impl<'a, 'p> VarScope for FileScope<'a, 'p> {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		// Walk outwards through the subninja chain.
		let mut scope = Some(self);
		while let Some(s) = scope {
			if let Some(found) = s.vars.lookup_var(var_name) {
				return Some(found);
			}
			scope = s.parent_scope;
		}
		None
	}
}

impl<'a> VarScope for BuildScope<'a> {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		if let Some(found) = self.build_vars.lookup_var(var_name) {
			return Some(found);
		}
		self.file_scope.lookup_var(var_name)
	}
}

impl<'a> VarScope for BuildRuleScope<'a> {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		match var_name {
			"in" => Some(FoundVar::Paths {
				paths: self.inputs,
				separator: PathsSeparator::Space,
			}),
			"in_newline" => Some(FoundVar::Paths {
				paths: self.inputs,
				separator: PathsSeparator::Newline,
			}),
			"out" => Some(FoundVar::Paths {
				paths: self.outputs,
				separator: PathsSeparator::Space,
			}),
			_ => {
				// Edge-local bindings shadow the rule's templates, which
				// in turn shadow the enclosing file scope.
				if let Some(found) = self.build_scope.build_vars.lookup_var(var_name) {
					return Some(found);
				}
				if let Some(found) = self.rule_vars.lookup_var(var_name) {
					return Some(found);
				}
				self.build_scope.file_scope.lookup_var(var_name)
			}
		}
	}
}

impl<'a, 'p> FileScope<'a, 'p> {
	/// Create an empty scope containing no definitions.
	pub fn new() -> Self {
		FileScope {
			parent_scope: None,
			vars: Vec::new(),
			rules: Vec::new(),
		}
	}

	/// Create an empty scope which inherits this scope's definitions.
	pub fn new_subscope(&'p self) -> FileScope<'a, 'p> {
		FileScope {
			parent_scope: Some(self),
			vars: Vec::new(),
			rules: Vec::new(),
		}
	}

	/// Look up a rule definition, here or in an enclosing scope.
	pub fn lookup_rule(&self, rule_name: &str) -> Option<&Rule<'a>> {
		let mut scope = Some(self);
		while let Some(s) = scope {
			if let Some(rule) = s.rules.iter().rfind(|Rule { name, .. }| *name == rule_name) {
				return Some(rule);
			}
			scope = s.parent_scope;
		}
		None
	}
}
