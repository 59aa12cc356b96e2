//! Loading dynamic dependency files.
//!
//! A dyndep file is a restricted mini-manifest, produced by an earlier
//! edge in the same build, that tells us about inputs and outputs of
//! edges that could not be known when the manifest was written (think
//! Fortran modules). Loading one mutates the build graph, so the dirty
//! state of the affected edges has to be recomputed afterwards.

use crate::disk::Disk;
use crate::error::{AddLocationToError, ErrorWithLocation, Location};
use crate::graph::{EdgeId, NodeId, State};
use crate::manifest::error::ParseError;
use crate::manifest::expand::expand_str;
use crate::manifest::parse::{Parser, Statement};
use crate::manifest::scope::{FoundVar, VarScope};
use crate::path::{canonicalize_path_in_place, PathError};
use raw_string::{RawStr, RawString};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::Path;

/// What a dyndep file adds to one edge.
#[derive(Debug, Default)]
pub struct DyndepEdge {
	pub implicit_inputs: Vec<NodeId>,
	pub implicit_outputs: Vec<NodeId>,
	pub restat: bool,
}

/// The parsed contents of a dyndep file: one update per edge.
pub type DyndepFile = BTreeMap<EdgeId, DyndepEdge>;

/// A problem with a dyndep file.
#[derive(Debug)]
pub enum DyndepError {
	Parse(ParseError),
	/// The first statement must be `ninja_dyndep_version = 1`.
	MissingVersion,
	UnsupportedVersion(RawString),
	/// Only the pseudo-rule `dyndep` is allowed in build statements.
	WrongRule(String),
	/// A build statement must have exactly one explicit output.
	ExpectedOneOutput,
	/// Explicit and order-only dependencies are not allowed.
	ExplicitDepsNotAllowed,
	/// The `|@` validation syntax is not allowed in dyndep files.
	ValidationsNotAllowed,
	/// Only `restat` may be bound under a build statement.
	UnknownVariable(String),
	/// A build statement names an output this dyndep file does not apply
	/// to.
	WrongOutput(RawString),
	/// Two build statements name outputs of the same edge.
	DuplicateEdge(RawString),
	/// A discovered implicit output is already generated by another edge.
	MultipleRulesGenerate(RawString),
	InvalidPath { path: RawString, error: PathError },
	Io(io::Error),
}

impl fmt::Display for DyndepError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			DyndepError::Parse(e) => write!(f, "{}", e),
			DyndepError::MissingVersion => {
				write!(f, "Expected `ninja_dyndep_version = ..' as the first statement")
			}
			DyndepError::UnsupportedVersion(v) => {
				write!(f, "Unsupported ninja_dyndep_version: {}", v)
			}
			DyndepError::WrongRule(r) => {
				write!(f, "Expected the `dyndep' rule, got: {}", r)
			}
			DyndepError::ExpectedOneOutput => {
				write!(f, "Expected exactly one explicit output")
			}
			DyndepError::ExplicitDepsNotAllowed => {
				write!(f, "Dependencies in a dyndep file must be implicit (`| ..')")
			}
			DyndepError::ValidationsNotAllowed => {
				write!(f, "Validations (`|@') are not allowed in dyndep files")
			}
			DyndepError::UnknownVariable(n) => write!(f, "Unexpected variable: {}", n),
			DyndepError::WrongOutput(path) => write!(
				f,
				"{} is not an output of an edge using this dyndep file",
				path
			),
			DyndepError::DuplicateEdge(path) => {
				write!(f, "A second build statement applies to the edge of {}", path)
			}
			DyndepError::MultipleRulesGenerate(path) => {
				write!(f, "Multiple rules generate {}", path)
			}
			DyndepError::InvalidPath { path, error } => {
				write!(f, "Invalid path {}: {}", path, error)
			}
			DyndepError::Io(e) => write!(f, "{}", e),
		}
	}
}

impl Error for DyndepError {}

impl From<ParseError> for DyndepError {
	fn from(src: ParseError) -> DyndepError {
		DyndepError::Parse(src)
	}
}

impl From<ErrorWithLocation<ParseError>> for ErrorWithLocation<DyndepError> {
	fn from(src: ErrorWithLocation<ParseError>) -> Self {
		src.convert()
	}
}

/// Dyndep files contain no variable definitions; `$`-escapes in paths are
/// still processed.
struct EmptyScope;

impl VarScope for EmptyScope {
	fn lookup_var(&self, _: &str) -> Option<FoundVar> {
		None
	}
}

/// Read a dyndep file from disk and splice its contents into the graph.
///
/// `node` is the graph node of the dyndep file itself; every `build`
/// statement in the file must name an output of an edge that binds this
/// node as its dyndep file.
///
/// On success the affected edges are returned so the caller can recompute
/// their dirty state.
pub fn load(
	state: &mut State,
	disk: &dyn Disk,
	node: NodeId,
) -> Result<DyndepFile, ErrorWithLocation<DyndepError>> {
	let path = state.node_path(node).to_owned();
	let content = disk
		.read_file(&path)
		.and_then(|c| {
			c.ok_or_else(|| {
				io::Error::new(io::ErrorKind::NotFound, format!("{}: No such file", path))
			})
		})
		.map_err(|e| DyndepError::Io(e).at(Location::UNKNOWN))?;

	let file = parse(state, node, &path, &content)?;
	apply(state, &file).map_err(|e| e.at(Location::UNKNOWN))?;
	state.node_mut(node).dyndep_pending = false;
	Ok(file)
}

/// Parse a dyndep file, resolving paths against the graph, without
/// mutating anything yet.
fn parse(
	state: &mut State,
	dyndep_node: NodeId,
	path: &RawStr,
	content: &RawStr,
) -> Result<DyndepFile, ErrorWithLocation<DyndepError>> {
	let file_name = path
		.to_str()
		.map(Path::new)
		.unwrap_or_else(|_| Path::new("dyndep file"))
		.to_owned();
	let mut parser = Parser::new(&file_name, content);
	let mut file = DyndepFile::new();
	let mut saw_version = false;

	while let Some(statement) = parser.next_statement()? {
		let loc = parser.location();
		match statement {
			Statement::Variable { name, value } if !saw_version => {
				if name != "ninja_dyndep_version" {
					return Err(DyndepError::MissingVersion.at(loc));
				}
				if value != "1" && value != "1.0" {
					return Err(DyndepError::UnsupportedVersion(value.to_owned()).at(loc));
				}
				saw_version = true;
			}
			_ if !saw_version => return Err(DyndepError::MissingVersion.at(loc)),
			Statement::Build(build) => {
				if build.rule_name != "dyndep" {
					return Err(DyndepError::WrongRule(build.rule_name.to_string()).at(loc));
				}
				if build.explicit_outputs.len() != 1 {
					return Err(DyndepError::ExpectedOneOutput.at(loc));
				}
				if !build.explicit_deps.is_empty() || !build.order_deps.is_empty() {
					return Err(DyndepError::ExplicitDepsNotAllowed.at(loc));
				}
				if !build.validations.is_empty() {
					return Err(DyndepError::ValidationsNotAllowed.at(loc));
				}

				let mut entry = DyndepEdge::default();
				while let Some(var) = parser.next_variable()? {
					if var.name != "restat" {
						return Err(
							DyndepError::UnknownVariable(var.name.to_string()).at(loc)
						);
					}
					entry.restat = !var.value.is_empty();
				}

				// The explicit output must resolve to an edge that uses
				// this dyndep file.
				let output = intern(state, build.explicit_outputs[0], loc)?;
				let output_path = state.node_path(output).to_owned();
				let edge = match state.node(output).in_edge {
					Some(edge) if state.edge(edge).dyndep == Some(dyndep_node) => edge,
					_ => return Err(DyndepError::WrongOutput(output_path).at(loc)),
				};

				for p in &build.implicit_outputs {
					entry.implicit_outputs.push(intern(state, p, loc)?);
				}
				for p in &build.implicit_deps {
					let input = intern(state, p, loc)?;
					// An input first seen here may legitimately not exist
					// yet; don't let the plan treat that as an error.
					if state.node(input).in_edge.is_none()
						&& state.node(input).out_edges.is_empty()
					{
						state.node_mut(input).generated_by_dep_loader = true;
					}
					entry.implicit_inputs.push(input);
				}

				match file.entry(edge) {
					Entry::Vacant(v) => {
						v.insert(entry);
					}
					Entry::Occupied(_) => {
						let path = state.node_path(output).to_owned();
						return Err(DyndepError::DuplicateEdge(path).at(loc));
					}
				}
			}
			_ => {
				return Err(DyndepError::Parse(ParseError::ExpectedStatement).at(loc));
			}
		}
	}

	Ok(file)
}

fn intern(
	state: &mut State,
	path: &RawStr,
	loc: Location,
) -> Result<NodeId, ErrorWithLocation<DyndepError>> {
	let mut path = expand_str(path, &EmptyScope).unwrap_or_else(|_| path.to_owned());
	let bits = canonicalize_path_in_place(&mut path).map_err(|error| {
		DyndepError::InvalidPath {
			path: path.clone(),
			error,
		}
		.at(loc)
	})?;
	Ok(state.intern(path, bits))
}

/// Splice the parsed updates into the graph.
fn apply(state: &mut State, file: &DyndepFile) -> Result<(), DyndepError> {
	for (&edge, update) in file {
		for &output in &update.implicit_outputs {
			state
				.add_implicit_output(edge, output)
				.map_err(|e| DyndepError::MultipleRulesGenerate(e.path))?;
		}
		state.add_discovered_deps(edge, &update.implicit_inputs);
		if update.restat {
			if let Some(command) = &mut state.edge_mut(edge).command {
				command.restat = true;
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::VirtualDisk;
	use crate::manifest::load_from;

	fn dyndep_state() -> (State, NodeId, EdgeId) {
		let state = load_from(
			"build.ninja".as_ref(),
			b"rule r\n  command = touch $out\nbuild out: r in || dd\n  dyndep = dd\n",
		)
		.unwrap();
		let dd = state.node_id(RawStr::from_str("dd")).unwrap();
		(state, dd, EdgeId(0))
	}

	fn load_str(
		state: &mut State,
		node: NodeId,
		content: &str,
	) -> Result<DyndepFile, ErrorWithLocation<DyndepError>> {
		let disk = VirtualDisk::new();
		disk.add_file(state.node_path(node).to_owned(), content);
		load(state, &disk, node)
	}

	#[test]
	fn adds_implicit_outputs_and_inputs() {
		let (mut state, dd, edge) = dyndep_state();
		let file = load_str(
			&mut state,
			dd,
			"ninja_dyndep_version = 1\nbuild out | out.imp: dyndep | in.imp\n",
		)
		.unwrap();

		assert_eq!(file.len(), 1);
		let out_imp = state.node_id(RawStr::from_str("out.imp")).unwrap();
		let in_imp = state.node_id(RawStr::from_str("in.imp")).unwrap();
		let e = state.edge(edge);
		assert!(e.outputs.contains(&out_imp));
		assert_eq!(e.implicit_outs, 1);
		assert!(e.inputs.contains(&in_imp));
		assert_eq!(state.node(out_imp).in_edge, Some(edge));
		assert!(!state.node(dd).dyndep_pending);
	}

	#[test]
	fn restat_flag() {
		let (mut state, dd, edge) = dyndep_state();
		load_str(
			&mut state,
			dd,
			"ninja_dyndep_version = 1\nbuild out: dyndep\n  restat = 1\n",
		)
		.unwrap();
		assert!(state.edge(edge).restat());
	}

	#[test]
	fn version_is_required_first() {
		let (mut state, dd, _) = dyndep_state();
		match load_str(&mut state, dd, "build out: dyndep\n") {
			Err(e) => match e.error {
				DyndepError::MissingVersion => {}
				other => panic!("unexpected error: {}", other),
			},
			Ok(_) => panic!("expected an error"),
		}
	}

	#[test]
	fn unsupported_version() {
		let (mut state, dd, _) = dyndep_state();
		match load_str(&mut state, dd, "ninja_dyndep_version = 2\n").unwrap_err().error {
			DyndepError::UnsupportedVersion(v) => assert_eq!(v, "2"),
			other => panic!("unexpected error: {}", other),
		}
	}

	#[test]
	fn validations_are_rejected() {
		let (mut state, dd, _) = dyndep_state();
		let err = load_str(
			&mut state,
			dd,
			"ninja_dyndep_version = 1\nbuild out: dyndep |@ check\n",
		)
		.unwrap_err();
		match err.error {
			DyndepError::ValidationsNotAllowed => {}
			other => panic!("unexpected error: {}", other),
		}
	}

	#[test]
	fn unrelated_output_is_rejected() {
		let (mut state, dd, _) = dyndep_state();
		let err = load_str(
			&mut state,
			dd,
			"ninja_dyndep_version = 1\nbuild elsewhere: dyndep\n",
		)
		.unwrap_err();
		match err.error {
			DyndepError::WrongOutput(path) => assert_eq!(path, "elsewhere"),
			other => panic!("unexpected error: {}", other),
		}
	}

	#[test]
	fn colliding_implicit_output_is_rejected() {
		let state = load_from(
			"build.ninja".as_ref(),
			b"rule r\n  command = touch $out\n\
			  build other: r\n\
			  build out: r in || dd\n  dyndep = dd\n",
		)
		.unwrap();
		let mut state = state;
		let dd = state.node_id(RawStr::from_str("dd")).unwrap();
		let err = load_str(
			&mut state,
			dd,
			"ninja_dyndep_version = 1\nbuild out | other: dyndep\n",
		)
		.unwrap_err();
		match err.error {
			DyndepError::MultipleRulesGenerate(path) => assert_eq!(path, "other"),
			other => panic!("unexpected error: {}", other),
		}
	}
}
