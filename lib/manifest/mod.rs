//! Loading `build.ninja` files into a build graph.
//!
//! > `build.ninja` file → [`load()`] → [`State`][crate::graph::State]
//!
//! The loader parses the manifest (following `include` and `subninja`
//! statements), resolves all rules and variables in the scope the edge was
//! declared in, canonicalizes every path, and wires the resulting nodes
//! and edges into a [`State`].

mod eat;

pub mod error;
pub mod expand;
pub mod parse;
pub mod scope;

use self::error::LoadError;
use self::expand::{expand_str, expand_strs, expand_strs_into, expand_var};
use self::parse::{BuildStatement, Parser, Statement, Variable};
use self::scope::{BuildRuleScope, BuildScope, ExpandedVar, FileScope, Rule};
use crate::error::{AddLocationToError, AddLocationToResult, ErrorWithLocation, Location};
use crate::graph::{CommandInfo, DepStyle, EdgeSpec, NodeId, State};
use crate::path::canonicalize_path_in_place;
use pile::Pile;
use raw_string::{RawStr, RawString};
use std::fs::File;
use std::io::{BufReader, Read};
use std::mem::replace;
use std::path::Path;

/// The default `msvc_deps_prefix`, matching what the compiler prints in
/// its default locale.
const DEFAULT_MSVC_DEPS_PREFIX: &str = "Note: including file: ";

fn read_bytes(file_name: &Path) -> Result<Vec<u8>, LoadError> {
	let mut bytes = Vec::new();
	File::open(file_name)
		.and_then(|f| BufReader::with_capacity(0x10000, f).read_to_end(&mut bytes))
		.map_err(|error| LoadError::IoError {
			file_name: file_name.to_owned(),
			error,
		})?;
	Ok(bytes)
}

/// Read, parse, and resolve a `build.ninja` file into a build graph.
///
/// Parses the file, including any included and subninja'd files, resolves
/// all rules and variables, and returns the resulting [`State`].
pub fn load(file_name: &Path) -> Result<State, ErrorWithLocation<LoadError>> {
	let source = read_bytes(file_name).err_at(Location::UNKNOWN)?;
	load_from(file_name, &source)
}

/// [`load()`], but with the source given directly instead of read from a
/// file.
///
/// Useful for testing and fuzzing.
///
/// `file_name` is used in errors, and to know where to look for `include`
/// and `subninja` files.
pub fn load_from(file_name: &Path, source: &[u8]) -> Result<State, ErrorWithLocation<LoadError>> {
	let pile = Pile::new();
	let mut state = State::new();
	let mut scope = FileScope::new();
	load_into(
		file_name,
		RawStr::from_bytes(source),
		&pile,
		&mut state,
		&mut scope,
	)?;
	if let Some(var) = scope
		.vars
		.iter_mut()
		.rfind(|var| var.name.as_bytes() == b"builddir")
	{
		state.build_dir = Some(replace(&mut var.value, RawString::new()));
	}
	Ok(state)
}

fn load_into<'a: 'p, 'p>(
	file_name: &Path,
	source: &'a RawStr,
	pile: &'a Pile<Vec<u8>>,
	state: &mut State,
	scope: &mut FileScope<'a, 'p>,
) -> Result<(), ErrorWithLocation<LoadError>> {
	let mut parser = Parser::new(file_name, source);

	while let Some(statement) = parser.next_statement()? {
		let loc = parser.location();
		match statement {
			Statement::Variable { name, value } => {
				let value = expand_str(value, scope).err_at(loc)?;
				scope.vars.push(ExpandedVar { name, value })
			}
			Statement::Rule { name } => {
				if scope.rules.iter().any(|rule| rule.name == name) {
					return Err(LoadError::DuplicateRule(name.to_string()).at(loc));
				}
				let mut vars = Vec::new();
				while let Some(var) = parser.next_variable()? {
					if !match var.name {
						"command" | "description" | "depfile" | "deps" | "dyndep" => true,
						"msvc_deps_prefix" | "rspfile" | "rspfile_content" => true,
						"generator" | "restat" | "pool" => true,
						_ => false,
					} {
						return Err(
							LoadError::UnknownVariable(var.name.to_string()).at(parser.location())
						);
					}
					vars.push(var);
				}
				scope.rules.push(Rule { name, vars })
			}
			Statement::Pool { name } => {
				if state.find_pool(name).is_some() {
					return Err(LoadError::DuplicatePool(name.to_string()).at(loc));
				}
				let mut depth = None;
				while let Some(Variable { name, value }) = parser.next_variable()? {
					let loc = parser.location();
					if name != "depth" {
						return Err(LoadError::UnknownVariable(name.to_string()).at(loc));
					}
					let value = expand_str(value, scope).err_at(loc)?;
					depth = Some(
						value
							.to_str()
							.ok()
							.and_then(|s| s.parse().ok())
							.ok_or_else(|| LoadError::InvalidPoolDepth.at(loc))?,
					);
				}
				match depth {
					Some(depth) => {
						state.add_pool(name, depth);
					}
					None => return Err(LoadError::ExpectedPoolDepth.at(parser.location())),
				}
			}
			Statement::Build(build) => {
				load_build(&mut parser, state, scope, build, loc)?;
			}
			Statement::Default { paths } => {
				for p in paths {
					let mut path = expand_str(p, scope).err_at(loc)?;
					canonicalize_path_in_place(&mut path).map_err(|error| {
						LoadError::InvalidPath {
							path: path.clone(),
							error,
						}
						.at(loc)
					})?;
					match state.node_id(&path) {
						Some(node) => state.defaults.push(node),
						None => return Err(LoadError::UnknownDefaultTarget(path).at(loc)),
					}
				}
			}
			Statement::Include { path } => {
				let path = expand_str(path, scope).err_at(loc)?;
				let path = path.to_path().err_at(loc)?;
				let path = file_name.with_file_name(path);
				let source = RawStr::from_bytes(pile.add(read_bytes(&path).err_at(loc)?));
				load_into(&path, source, pile, state, scope)?;
			}
			Statement::SubNinja { path } => {
				let path = expand_str(path, scope).err_at(loc)?;
				let path = path.to_path().err_at(loc)?;
				let path = file_name.with_file_name(path);
				let source = read_bytes(&path).err_at(loc)?;
				load_into(
					&path,
					RawStr::from_bytes(&source),
					&Pile::new(),
					state,
					&mut scope.new_subscope(),
				)?;
			}
		}
	}

	Ok(())
}

fn load_build<'a>(
	parser: &mut Parser<'a, '_>,
	state: &mut State,
	scope: &FileScope<'a, '_>,
	build: BuildStatement<'a>,
	loc: Location,
) -> Result<(), ErrorWithLocation<LoadError>> {
	let mut vars = Vec::new();
	while let Some(var) = parser.next_variable()? {
		vars.push(ExpandedVar {
			name: var.name,
			value: expand_str(var.value, scope).err_at(parser.location())?,
		});
	}

	// Bring the build variables into scope.
	let build_scope = BuildScope {
		file_scope: scope,
		build_vars: &vars,
	};

	// And expand the explicit input and output paths with it. These are
	// expanded first because `$in` and `$out` in the command refer to
	// them.
	let mut outputs =
		Vec::with_capacity(build.explicit_outputs.len() + build.implicit_outputs.len());
	let mut inputs = Vec::with_capacity(build.explicit_deps.len() + build.implicit_deps.len());
	expand_strs_into(&build.explicit_outputs, &build_scope, &mut outputs).err_at(loc)?;
	expand_strs_into(&build.explicit_deps, &build_scope, &mut inputs).err_at(loc)?;

	let (command, pool, dyndep) = if build.rule_name == "phony" {
		// Build variables are already expanded, so the dyndep binding of a
		// phony edge can be taken as-is.
		let dyndep = vars
			.iter()
			.rfind(|v| v.name == "dyndep")
			.map(|v| v.value.clone())
			.unwrap_or_else(RawString::new);
		(None, State::DEFAULT_POOL, dyndep)
	} else {
		// Look up the rule in the current scope.
		let rule = scope
			.lookup_rule(build.rule_name)
			.ok_or_else(|| LoadError::UndefinedRule(build.rule_name.to_string()).at(loc))?;

		// Bring $in, $out, and the rule variables into scope.
		let build_rule_scope = BuildRuleScope {
			build_scope: &build_scope,
			rule_vars: &rule.vars,
			inputs: &inputs,
			outputs: &outputs,
		};

		let expand = |name| expand_var(name, &build_rule_scope).err_at(loc);

		// Expand the pool binding first, and look the pool up:
		let pool_name = expand("pool")?;
		let pool = if pool_name.is_empty() {
			State::DEFAULT_POOL
		} else {
			let name = pool_name.to_str().map_err(|e| LoadError::from(e).at(loc))?;
			state
				.find_pool(name)
				.ok_or_else(|| LoadError::UndefinedPool(pool_name.clone()).at(loc))?
		};

		let dyndep = expand("dyndep")?;

		let msvc_deps_prefix = expand("msvc_deps_prefix")?;
		let command = CommandInfo {
			rule_name: build.rule_name.to_string(),
			command: expand("command")?,
			description: expand("description")?,
			depfile: expand("depfile")?,
			deps: match expand("deps")?.as_bytes() {
				b"gcc" => Some(DepStyle::Gcc),
				b"msvc" => Some(DepStyle::Msvc),
				_ => None,
			},
			msvc_deps_prefix: if msvc_deps_prefix.is_empty() {
				DEFAULT_MSVC_DEPS_PREFIX.into()
			} else {
				msvc_deps_prefix
			},
			generator: !expand("generator")?.is_empty(),
			restat: !expand("restat")?.is_empty(),
			rspfile: expand("rspfile")?,
			rspfile_content: expand("rspfile_content")?,
		};
		(Some(command), pool, dyndep)
	};

	// The remaining path lists don't take part in `$in`/`$out`.
	expand_strs_into(&build.implicit_outputs, &build_scope, &mut outputs).err_at(loc)?;
	expand_strs_into(&build.implicit_deps, &build_scope, &mut inputs).err_at(loc)?;
	let order_deps = expand_strs(&build.order_deps, &build_scope).err_at(loc)?;
	let validations = expand_strs(&build.validations, &build_scope).err_at(loc)?;

	let implicit_outs = build.implicit_outputs.len();
	let implicit_deps = build.implicit_deps.len();
	let order_only_deps = order_deps.len();

	let output_ids = intern_all(state, outputs, loc)?;
	let mut input_ids = intern_all(state, inputs, loc)?;
	input_ids.append(&mut intern_all(state, order_deps, loc)?);
	let validation_ids = intern_all(state, validations, loc)?;

	let dyndep = if dyndep.is_empty() {
		None
	} else {
		let id = intern_path(state, dyndep, loc)?;
		if !input_ids.contains(&id) {
			return Err(LoadError::DyndepNotInput(state.node_path(id).to_owned()).at(loc));
		}
		Some(id)
	};

	state
		.add_edge(EdgeSpec {
			command,
			pool,
			inputs: input_ids,
			implicit_deps,
			order_only_deps,
			outputs: output_ids,
			implicit_outs,
			validations: validation_ids,
			dyndep,
		})
		.map_err(|e| LoadError::DuplicateOutput(e.path).at(loc))?;

	Ok(())
}

fn intern_path(
	state: &mut State,
	mut path: RawString,
	loc: Location,
) -> Result<NodeId, ErrorWithLocation<LoadError>> {
	let bits = canonicalize_path_in_place(&mut path).map_err(|error| {
		LoadError::InvalidPath {
			path: path.clone(),
			error,
		}
		.at(loc)
	})?;
	Ok(state.intern(path, bits))
}

fn intern_all(
	state: &mut State,
	paths: Vec<RawString>,
	loc: Location,
) -> Result<Vec<NodeId>, ErrorWithLocation<LoadError>> {
	let mut ids = Vec::with_capacity(paths.len());
	for path in paths {
		ids.push(intern_path(state, path, loc)?);
	}
	Ok(ids)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::EdgeId;

	pub fn load_manifest(source: &str) -> State {
		load_from("build.ninja".as_ref(), source.as_bytes()).unwrap()
	}

	fn load_err(source: &str) -> LoadError {
		load_from("build.ninja".as_ref(), source.as_bytes())
			.err()
			.expect("expected load to fail")
			.error
	}

	fn node(state: &State, path: &str) -> NodeId {
		state
			.node_id(RawStr::from_str(path))
			.unwrap_or_else(|| panic!("no node {:?}", path))
	}

	#[test]
	fn basic_chain() {
		let state = load_manifest(
			"rule cat\n  command = cat $in > $out\nbuild mid: cat in\nbuild out: cat mid\n",
		);
		assert_eq!(state.edge_count(), 2);
		let mid = node(&state, "mid");
		let out = node(&state, "out");
		let first = state.node(mid).in_edge.unwrap();
		let second = state.node(out).in_edge.unwrap();
		assert_eq!(
			state.edge(first).command.as_ref().unwrap().command,
			"cat in > mid"
		);
		assert_eq!(
			state.edge(second).command.as_ref().unwrap().command,
			"cat mid > out"
		);
		assert!(state.node(mid).out_edges.contains(&second));
	}

	#[test]
	fn input_and_output_sections() {
		let state = load_manifest(
			"rule touch\n  command = touch $out\n\
			 build out | out.imp: touch in | dep.imp || order |@ check\n",
		);
		let edge = state.edge(EdgeId(0));
		assert_eq!(edge.outputs.len(), 2);
		assert_eq!(edge.implicit_outs, 1);
		assert_eq!(edge.explicit_outputs(), &[node(&state, "out")]);
		assert_eq!(edge.inputs.len(), 3);
		assert_eq!(edge.implicit_deps, 1);
		assert_eq!(edge.order_only_deps, 1);
		assert_eq!(edge.explicit_inputs(), &[node(&state, "in")]);
		assert_eq!(edge.order_only_inputs(), &[node(&state, "order")]);
		assert_eq!(edge.validations, vec![node(&state, "check")]);
		assert!(state
			.node(node(&state, "check"))
			.validation_out_edges
			.contains(&EdgeId(0)));
		// $out only contains the explicit outputs.
		assert_eq!(edge.command.as_ref().unwrap().command, "touch out");
	}

	#[test]
	fn variable_scoping() {
		let state = load_manifest(
			"flags = -O2\n\
			 rule cc\n  command = cc $flags $in -o $out\n\
			 build a.o: cc a.c\n\
			 build b.o: cc b.c\n  flags = -O0\n",
		);
		let a = state.node(node(&state, "a.o")).in_edge.unwrap();
		let b = state.node(node(&state, "b.o")).in_edge.unwrap();
		assert_eq!(
			state.edge(a).command.as_ref().unwrap().command,
			"cc -O2 a.c -o a.o"
		);
		assert_eq!(
			state.edge(b).command.as_ref().unwrap().command,
			"cc -O0 b.c -o b.o"
		);
	}

	#[test]
	fn rule_bindings() {
		let state = load_manifest(
			"rule cc\n  command = cc @$out.rsp\n  description = CC $out\n  restat = 1\n\
			 \x20 generator = 1\n  rspfile = $out.rsp\n  rspfile_content = $in\n\
			 \x20 depfile = $out.d\n  deps = gcc\n\
			 build foo.o: cc foo.c\n",
		);
		let edge = state.edge(EdgeId(0));
		let c = edge.command.as_ref().unwrap();
		assert_eq!(c.command, "cc @foo.o.rsp");
		assert_eq!(c.description, "CC foo.o");
		assert!(c.restat);
		assert!(c.generator);
		assert_eq!(c.rspfile, "foo.o.rsp");
		assert_eq!(c.rspfile_content, "foo.c");
		assert_eq!(c.depfile, "foo.o.d");
		assert_eq!(c.deps, Some(DepStyle::Gcc));
	}

	#[test]
	fn pools() {
		let state = load_manifest(
			"pool link\n  depth = 2\n\
			 rule ld\n  command = ld $in -o $out\n  pool = link\n\
			 rule ld_console\n  command = ld $in -o $out\n  pool = console\n\
			 build a: ld a.o\n\
			 build b: ld_console b.o\n",
		);
		let link = state.find_pool("link").unwrap();
		assert_eq!(state.pool(link).depth(), 2);
		assert_eq!(state.edge(EdgeId(0)).pool, link);
		assert_eq!(state.edge(EdgeId(1)).pool, State::CONSOLE_POOL);
	}

	#[test]
	fn undefined_pool() {
		match load_err("rule r\n  command = true\n  pool = nope\nbuild x: r\n") {
			LoadError::UndefinedPool(name) => assert_eq!(name, "nope"),
			e => panic!("unexpected error: {}", e),
		}
	}

	#[test]
	fn duplicate_pool() {
		match load_err("pool console\n  depth = 3\n") {
			LoadError::DuplicatePool(name) => assert_eq!(name, "console"),
			e => panic!("unexpected error: {}", e),
		}
	}

	#[test]
	fn duplicate_output() {
		match load_err("rule r\n  command = true\nbuild x: r\nbuild x: r\n") {
			LoadError::DuplicateOutput(path) => assert_eq!(path, "x"),
			e => panic!("unexpected error: {}", e),
		}
	}

	#[test]
	fn dyndep_binding() {
		let state = load_manifest(
			"rule r\n  command = true\nbuild out: r in || dd\n  dyndep = dd\n",
		);
		let edge = state.edge(EdgeId(0));
		let dd = node(&state, "dd");
		assert_eq!(edge.dyndep, Some(dd));
		assert!(state.node(dd).dyndep_pending);
	}

	#[test]
	fn dyndep_must_be_an_input() {
		match load_err("rule r\n  command = true\nbuild out: r in\n  dyndep = dd\n") {
			LoadError::DyndepNotInput(path) => assert_eq!(path, "dd"),
			e => panic!("unexpected error: {}", e),
		}
	}

	#[test]
	fn defaults() {
		let state = load_manifest(
			"rule r\n  command = true\nbuild a: r\nbuild b: r\ndefault a\n",
		);
		assert_eq!(state.defaults, vec![node(&state, "a")]);

		match load_err("default nothing\n") {
			LoadError::UnknownDefaultTarget(path) => assert_eq!(path, "nothing"),
			e => panic!("unexpected error: {}", e),
		}
	}

	#[test]
	fn paths_are_canonicalized() {
		let state = load_manifest(
			"rule r\n  command = true\nbuild obj/./out: r src/../src/in\n",
		);
		assert!(state.node_id(RawStr::from_str("obj/out")).is_some());
		assert!(state.node_id(RawStr::from_str("src/in")).is_some());
	}

	#[test]
	fn phony_edges() {
		let state = load_manifest("build all: phony a b\n");
		let edge = state.edge(EdgeId(0));
		assert!(edge.is_phony());
		assert_eq!(edge.inputs.len(), 2);
	}

	#[test]
	fn builddir() {
		let state = load_manifest("builddir = out\nrule r\n  command = true\nbuild x: r\n");
		assert_eq!(state.build_dir, Some("out".into()));
	}
}
