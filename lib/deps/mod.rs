//! Merging discovered dependencies into the build graph.
//!
//! Edges discover dependencies in two places: while *scanning*, previously
//! recorded information (from the deps log, or a depfile left on disk) is
//! spliced into the edge so the dirty computation sees it; and when a
//! command *finishes*, its depfile or its output stream is parsed so the
//! fresh information can be written to the deps log.

use crate::depfile::{self, DepfileError};
use crate::deplog::DepsLog;
use crate::disk::Disk;
use crate::graph::{EdgeId, NodeId, State};
use crate::mtime::FileState;
use crate::path::canonicalize_path;
use log::warn;
use raw_string::{RawStr, RawString};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::io;

/// A problem while extracting the dependencies of a finished command.
#[derive(Debug)]
pub enum DepsError {
	/// The rule declared a depfile, but the command did not write it.
	DepfileMissing(RawString),
	/// The depfile could not be parsed.
	Parse(DepfileError),
	Io(io::Error),
}

impl fmt::Display for DepsError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			DepsError::DepfileMissing(path) => {
				write!(f, "Depfile {} was not written by the command", path)
			}
			DepsError::Parse(e) => write!(f, "{}", e),
			DepsError::Io(e) => write!(f, "{}", e),
		}
	}
}

impl Error for DepsError {}

impl From<DepfileError> for DepsError {
	fn from(src: DepfileError) -> DepsError {
		DepsError::Parse(src)
	}
}

impl From<io::Error> for DepsError {
	fn from(src: io::Error) -> DepsError {
		DepsError::Io(src)
	}
}

/// Load an edge's previously recorded dependencies, making them implicit
/// inputs.
///
/// Returns `false` when the recorded information is missing or stale; the
/// scanner then considers the edge dirty.
pub fn load_deps(
	state: &mut State,
	edge_id: EdgeId,
	deps_log: &DepsLog,
	disk: &dyn Disk,
) -> Result<bool, io::Error> {
	let (style, depfile) = match &state.edge(edge_id).command {
		Some(c) => (c.deps, c.depfile.clone()),
		None => return Ok(true),
	};
	if style.is_some() {
		if load_deps_from_log(state, edge_id, deps_log, disk)? {
			return Ok(true);
		}
		// No usable log entry. A depfile still on disk (e.g. from a
		// build whose log was lost) is better than nothing.
		if !depfile.is_empty() {
			return load_deps_from_depfile(state, edge_id, &depfile, disk);
		}
		Ok(false)
	} else if !depfile.is_empty() {
		load_deps_from_depfile(state, edge_id, &depfile, disk)
	} else {
		Ok(true)
	}
}

fn load_deps_from_log(
	state: &mut State,
	edge_id: EdgeId,
	deps_log: &DepsLog,
	disk: &dyn Disk,
) -> Result<bool, io::Error> {
	let output = state.edge(edge_id).outputs[0];

	// The comparison below needs the output's mtime.
	if state.node(output).state == FileState::Unknown {
		let file_state = disk.stat(state.node_path(output))?;
		state.node_mut(output).state = file_state;
	}

	let (recorded_mtime, dep_paths) = match deps_log.get(state.node_path(output)) {
		Some(info) => (
			info.mtime(),
			info.deps().map(|d| d.to_owned()).collect::<Vec<RawString>>(),
		),
		None => return Ok(false),
	};

	// An output written after its deps record means the record no longer
	// describes the file on disk.
	match (state.node(output).state.mtime(), recorded_mtime) {
		(Some(out), Some(recorded)) if out > recorded => return Ok(false),
		(Some(_), None) => return Ok(false),
		_ => {}
	}

	// Deps log paths are already canonical. The slash bits are not
	// persisted; a node created here gets them from the manifest if it
	// also appears there.
	let nodes: Vec<NodeId> = dep_paths
		.into_iter()
		.map(|path| state.intern_discovered(path, 0))
		.collect();
	state.add_discovered_deps(edge_id, &nodes);
	Ok(true)
}

fn load_deps_from_depfile(
	state: &mut State,
	edge_id: EdgeId,
	depfile_path: &RawStr,
	disk: &dyn Disk,
) -> Result<bool, io::Error> {
	let content = match disk.read_file(depfile_path)? {
		Some(content) => content,
		None => return Ok(false),
	};
	let parsed = depfile::parse(&content)
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", depfile_path, e)))?;

	check_depfile_outputs(state, edge_id, &parsed.outputs, depfile_path);

	let nodes: Vec<NodeId> = parsed
		.deps
		.into_iter()
		.map(|(path, bits)| state.intern_discovered(path, bits))
		.collect();
	state.add_discovered_deps(edge_id, &nodes);
	Ok(true)
}

fn check_depfile_outputs(
	state: &State,
	edge_id: EdgeId,
	outputs: &[(RawString, u64)],
	depfile_path: &RawStr,
) {
	for (path, _) in outputs {
		let matches = state
			.edge(edge_id)
			.outputs
			.iter()
			.any(|&o| state.node_path(o) == &path[..]);
		if !matches {
			warn!(
				"{}: depfile mentions output {} which the edge does not declare",
				depfile_path, path
			);
		}
	}
}

/// Read and parse the depfile a finished command wrote, and delete it.
///
/// The deps log is the canonical record; the depfile is transient and is
/// removed as soon as its contents are extracted.
pub fn extract_deps_from_depfile(
	disk: &dyn Disk,
	depfile_path: &RawStr,
) -> Result<Vec<(RawString, u64)>, DepsError> {
	let content = disk
		.read_file(depfile_path)?
		.ok_or_else(|| DepsError::DepfileMissing(depfile_path.to_owned()))?;
	let parsed = depfile::parse(&content)?;
	disk.remove_file(depfile_path)?;
	Ok(dedup(parsed.deps))
}

/// Extract `/showIncludes`-style dependencies from a command's output.
///
/// Lines starting with `prefix` are dependency reports: the prefix is
/// stripped, the path canonicalized, and system headers are dropped. All
/// other lines pass through and are returned as the output to display.
pub fn extract_deps_from_output(
	output: &RawStr,
	prefix: &RawStr,
) -> Result<(Vec<(RawString, u64)>, RawString), DepsError> {
	let mut deps = Vec::new();
	let mut rest = RawString::with_capacity(output.len());

	let mut remaining = output;
	while !remaining.is_empty() {
		let line_end = memchr::memchr(b'\n', remaining.as_bytes());
		let (line, next) = match line_end {
			Some(n) => (&remaining[..n], &remaining[n + 1..]),
			None => (remaining, RawStr::from_str("")),
		};
		remaining = next;

		if line.starts_with(prefix) {
			let mut path = &line[prefix.len()..];
			if path.last() == Some(b'\r') {
				path = &path[..path.len() - 1];
			}
			// The compiler indents nested includes.
			while path.first() == Some(b' ') {
				path = &path[1..];
			}
			if path.is_empty() || is_system_include(path) {
				continue;
			}
			let (path, bits) = canonicalize_path(path)
				.map_err(|e| DepsError::Parse(DepfileError::Path(e)))?;
			deps.push((path, bits));
		} else {
			rest.push_str(line);
			rest.push(b'\n');
		}
	}

	Ok((dedup(deps), rest))
}

/// The heuristic for headers that should not become dependencies: paths
/// under the compiler's own installation.
fn is_system_include(path: &RawStr) -> bool {
	let lowered: Vec<u8> = path.bytes().map(|b| b.to_ascii_lowercase()).collect();
	contains(&lowered, b"program files") || contains(&lowered, b"microsoft visual studio")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
	haystack.windows(needle.len()).any(|w| w == needle)
}

fn dedup(deps: Vec<(RawString, u64)>) -> Vec<(RawString, u64)> {
	let mut seen = BTreeSet::new();
	deps.into_iter()
		.filter(|(path, _)| seen.insert(path.clone()))
		.collect()
}
