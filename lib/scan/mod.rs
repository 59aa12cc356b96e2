//! Computing which nodes and edges are dirty.
//!
//! The scanner walks the graph depth-first from each requested target,
//! stat-ing files, loading recorded dependencies and dyndep files along
//! the way, and deciding for every edge whether its command has to run.
//! Cycles are detected with the tri-state mark on each edge.

use crate::buildlog::{hash_command, BuildLog};
use crate::deplog::DepsLog;
use crate::deps;
use crate::disk::Disk;
use crate::dyndep::{self, DyndepError};
use crate::error::ErrorWithLocation;
use crate::graph::{EdgeId, Mark, NodeId, State};
use crate::mtime::{FileState, Timestamp};
use std::error::Error;
use std::fmt;
use std::io;

/// A fatal problem found while scanning.
#[derive(Debug)]
pub enum ScanError {
	/// The graph contains a dependency cycle. The message reads
	/// `dependency cycle: a -> b -> ... -> a`.
	Cycle(String),
	/// A dyndep file was needed but could not be loaded.
	Dyndep(ErrorWithLocation<DyndepError>),
	Io(io::Error),
}

impl fmt::Display for ScanError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ScanError::Cycle(msg) => write!(f, "{}", msg),
			ScanError::Dyndep(e) => write!(f, "{}", e),
			ScanError::Io(e) => write!(f, "{}", e),
		}
	}
}

impl Error for ScanError {}

impl From<io::Error> for ScanError {
	fn from(src: io::Error) -> ScanError {
		ScanError::Io(src)
	}
}

/// The read-only collaborators of a dirty scan.
///
/// The scanner itself holds no state; everything it computes lands in the
/// nodes and edges of the [`State`] it is given.
pub struct DependencyScan<'a> {
	pub disk: &'a dyn Disk,
	pub build_log: &'a BuildLog,
	pub deps_log: &'a DepsLog,
}

impl<'a> DependencyScan<'a> {
	pub fn new(
		disk: &'a dyn Disk,
		build_log: &'a BuildLog,
		deps_log: &'a DepsLog,
	) -> Self {
		DependencyScan {
			disk,
			build_log,
			deps_log,
		}
	}

	/// Update the dirty state of `node` and everything it transitively
	/// depends on.
	///
	/// Nodes referenced as validations by visited edges are appended to
	/// `validations`; they do not influence the dirtiness of the edges
	/// referencing them, but the caller should scan and schedule them as
	/// additional roots.
	pub fn recompute_dirty(
		&self,
		state: &mut State,
		node: NodeId,
		validations: &mut Vec<NodeId>,
	) -> Result<(), ScanError> {
		// Visiting an edge can surface validation nodes, which are scanned
		// as roots of their own; those scans can surface more validations.
		let mut queue = vec![node];
		while let Some(node) = queue.pop() {
			let mut stack = Vec::new();
			let mut new_validations = Vec::new();
			self.recompute_node_dirty(state, node, &mut stack, &mut new_validations)?;
			queue.extend(new_validations.iter().copied());
			validations.extend(new_validations);
		}
		Ok(())
	}

	fn recompute_node_dirty(
		&self,
		state: &mut State,
		node: NodeId,
		stack: &mut Vec<NodeId>,
		validations: &mut Vec<NodeId>,
	) -> Result<(), ScanError> {
		let edge_id = match state.node(node).in_edge {
			None => {
				// A source file: it is dirty iff it is missing. Whether
				// that is an error is decided where the node is needed.
				if state.node(node).state == FileState::Unknown {
					let file_state = self.disk.stat(state.node_path(node))?;
					let node = state.node_mut(node);
					node.state = file_state;
					node.dirty = !file_state.exists();
				}
				return Ok(());
			}
			Some(edge) => edge,
		};

		match state.edge(edge_id).mark {
			Mark::Done => return Ok(()),
			Mark::InStack => return Err(self.cycle_error(state, node, stack)),
			Mark::None => {}
		}
		state.edge_mut(edge_id).mark = Mark::InStack;
		stack.push(node);

		let mut dirty = false;
		state.edge_mut(edge_id).outputs_ready = true;

		// An unloaded dyndep file can change this edge's shape, so deal
		// with it before looking at anything else.
		if let Some(dd) = state.edge(edge_id).dyndep {
			if state.node(dd).dyndep_pending {
				self.recompute_node_dirty(state, dd, stack, validations)?;
				let ready = match state.node(dd).in_edge {
					None => true,
					Some(e) => state.edge(e).outputs_ready,
				};
				if ready {
					// Load it now; the inputs and outputs it adds take
					// part in the rest of this scan.
					dyndep::load(state, self.disk, dd).map_err(ScanError::Dyndep)?;
				}
				// Otherwise the file is built during the build, and the
				// plan reloads it when its edge finishes.
			}
		}

		if !state.edge(edge_id).deps_loaded {
			state.edge_mut(edge_id).deps_loaded = true;
			if !deps::load_deps(state, edge_id, self.deps_log, self.disk)? {
				// No usable record of discovered dependencies: assume the
				// worst.
				state.edge_mut(edge_id).deps_missing = true;
			}
		}
		if state.edge(edge_id).deps_missing {
			dirty = true;
		}

		let mut most_recent_input: Option<Timestamp> = None;
		for i in 0..state.edge(edge_id).inputs.len() {
			let input = state.edge(edge_id).inputs[i];
			self.recompute_node_dirty(state, input, stack, validations)?;

			// If an input is not ready, neither are our outputs.
			if let Some(in_edge) = state.node(input).in_edge {
				if !state.edge(in_edge).outputs_ready {
					state.edge_mut(edge_id).outputs_ready = false;
				}
			}

			if !state.edge(edge_id).is_order_only(i) {
				if state.node(input).dirty {
					dirty = true;
				} else if let Some(mtime) = state.node(input).state.mtime() {
					if most_recent_input.map_or(true, |m| mtime > m) {
						most_recent_input = Some(mtime);
					}
				}
			}
		}

		// Validations are scanned by the caller, as independent roots.
		validations.extend(state.edge(edge_id).validations.iter().copied());

		for i in 0..state.edge(edge_id).outputs.len() {
			let output = state.edge(edge_id).outputs[i];
			self.stat_if_necessary(state, output)?;
		}

		if !dirty {
			dirty = self.recompute_outputs_dirty(state, edge_id, most_recent_input)?;
		}

		for i in 0..state.edge(edge_id).outputs.len() {
			let output = state.edge(edge_id).outputs[i];
			state.node_mut(output).dirty = dirty;
		}

		// A dirty edge's outputs are not ready, with one exception: a
		// phony edge without inputs has nothing to run, so there is
		// nothing to wait for either.
		let edge = state.edge_mut(edge_id);
		if dirty && !(edge.is_phony() && edge.inputs.is_empty()) {
			edge.outputs_ready = false;
		}

		edge.mark = Mark::Done;
		stack.pop();
		Ok(())
	}

	/// Whether any output makes the edge dirty, given the mtime of its
	/// most recent input. The inputs themselves were already checked.
	pub fn recompute_outputs_dirty(
		&self,
		state: &mut State,
		edge_id: EdgeId,
		most_recent_input: Option<Timestamp>,
	) -> Result<bool, ScanError> {
		for i in 0..state.edge(edge_id).outputs.len() {
			let output = state.edge(edge_id).outputs[i];
			self.stat_if_necessary(state, output)?;
			if self.output_dirty(state, edge_id, output, most_recent_input) {
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn stat_if_necessary(&self, state: &mut State, node: NodeId) -> Result<(), ScanError> {
		if state.node(node).state == FileState::Unknown {
			let file_state = self.disk.stat(state.node_path(node))?;
			state.node_mut(node).state = file_state;
		}
		Ok(())
	}

	fn output_dirty(
		&self,
		state: &State,
		edge_id: EdgeId,
		output: NodeId,
		most_recent_input: Option<Timestamp>,
	) -> bool {
		let edge = state.edge(edge_id);

		if edge.is_phony() {
			// A phony edge with no inputs has no way of becoming clean:
			// it always runs (it just runs as a no-op).
			return edge.inputs.is_empty();
		}

		let out_state = state.node(output).state;
		let out_mtime = match out_state.mtime() {
			Some(mtime) => mtime,
			// The output is missing.
			None => return true,
		};

		let entry = self.build_log.get(state.node_path(output));

		if let Some(most_recent) = most_recent_input {
			if out_mtime < most_recent {
				// A restat rule may have found the output unchanged in an
				// earlier build and recorded the input mtime it was clean
				// against; compare with that instead.
				let effective = match entry {
					Some(entry) if edge.restat() => entry.restat_mtime.unwrap_or(out_mtime),
					_ => out_mtime,
				};
				if effective < most_recent {
					return true;
				}
			}
		}

		if !edge.generator() {
			let command = edge.command.as_ref().unwrap();
			match entry {
				// An entry recorded for a different command line means
				// the output was built in some other way.
				Some(entry) => {
					let hash = hash_command(&command.command, &command.rspfile_content);
					if entry.command_hash != hash {
						return true;
					}
				}
				// No record at all: don't silently adopt a file something
				// else created.
				None => return true,
			}
		}

		false
	}

	fn cycle_error(&self, state: &State, node: NodeId, stack: &[NodeId]) -> ScanError {
		let edge = state.node(node).in_edge;
		let start = stack
			.iter()
			.position(|&n| state.node(n).in_edge == edge)
			.unwrap_or(0);

		let mut names: Vec<String> = stack[start..]
			.iter()
			.map(|&n| state.node_path(n).to_string())
			.collect();
		if !names.is_empty() {
			// Report the cycle's start as the node at its end, rather than
			// some other output of the starting edge.
			names[0] = state.node_path(node).to_string();
		}

		let mut msg = String::from("dependency cycle: ");
		for name in &names {
			msg.push_str(name);
			msg.push_str(" -> ");
		}
		msg.push_str(&state.node_path(node).to_string());
		ScanError::Cycle(msg)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::buildlog::Entry;
	use crate::disk::VirtualDisk;
	use crate::manifest::load_from;
	use raw_string::RawStr;

	fn load(source: &str) -> State {
		load_from("build.ninja".as_ref(), source.as_bytes()).unwrap()
	}

	fn node(state: &State, path: &str) -> NodeId {
		state.node_id(RawStr::from_str(path)).unwrap()
	}

	fn scan(
		state: &mut State,
		disk: &VirtualDisk,
		build_log: &BuildLog,
		target: &str,
	) -> Result<Vec<NodeId>, ScanError> {
		let deps_log = DepsLog::new();
		let scanner = DependencyScan::new(disk, build_log, &deps_log);
		let target = node(state, target);
		let mut validations = Vec::new();
		scanner.recompute_dirty(state, target, &mut validations)?;
		Ok(validations)
	}

	fn log_entry(state: &State, edge: EdgeId) -> Entry {
		let command = state.edge(edge).command.as_ref().unwrap();
		Entry {
			start_time_ms: 0,
			end_time_ms: 1,
			restat_mtime: None,
			command_hash: hash_command(&command.command, &command.rspfile_content),
		}
	}

	const CHAIN: &str =
		"rule cat\n  command = cat $in > $out\nbuild mid: cat in\nbuild out: cat mid\n";

	#[test]
	fn missing_outputs_are_dirty() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");
		scan(&mut state, &disk, &BuildLog::new(), "out").unwrap();
		assert!(state.node(node(&state, "mid")).dirty);
		assert!(state.node(node(&state, "out")).dirty);
		assert!(!state.edge(EdgeId(0)).outputs_ready);
		assert!(!state.edge(EdgeId(1)).outputs_ready);
	}

	#[test]
	fn up_to_date_chain_is_clean() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");
		disk.tick();
		disk.add_file("mid", "");
		disk.tick();
		disk.add_file("out", "");

		let mut log = BuildLog::new();
		log.entries.insert("mid".into(), log_entry(&state, EdgeId(0)));
		log.entries.insert("out".into(), log_entry(&state, EdgeId(1)));

		scan(&mut state, &disk, &log, "out").unwrap();
		assert!(!state.node(node(&state, "mid")).dirty);
		assert!(!state.node(node(&state, "out")).dirty);
		assert!(state.edge(EdgeId(0)).outputs_ready);
		assert!(state.edge(EdgeId(1)).outputs_ready);
	}

	#[test]
	fn output_without_log_entry_is_dirty() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");
		disk.tick();
		disk.add_file("mid", "");
		disk.tick();
		disk.add_file("out", "");

		let mut log = BuildLog::new();
		log.entries.insert("out".into(), log_entry(&state, EdgeId(1)));
		// No entry for "mid": it may have been created by something else.

		scan(&mut state, &disk, &log, "out").unwrap();
		assert!(state.node(node(&state, "mid")).dirty);
	}

	#[test]
	fn changed_command_is_dirty() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");
		disk.tick();
		disk.add_file("mid", "");
		disk.tick();
		disk.add_file("out", "");

		let mut log = BuildLog::new();
		log.entries.insert("mid".into(), log_entry(&state, EdgeId(0)));
		log.entries.insert(
			"out".into(),
			Entry {
				command_hash: 0x1234,
				..log_entry(&state, EdgeId(1))
			},
		);

		scan(&mut state, &disk, &log, "out").unwrap();
		assert!(!state.node(node(&state, "mid")).dirty);
		assert!(state.node(node(&state, "out")).dirty);
	}

	#[test]
	fn touched_input_makes_consumers_dirty() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("mid", "");
		disk.tick();
		disk.add_file("out", "");
		disk.tick();
		disk.add_file("in", "");

		let mut log = BuildLog::new();
		log.entries.insert("mid".into(), log_entry(&state, EdgeId(0)));
		log.entries.insert("out".into(), log_entry(&state, EdgeId(1)));

		scan(&mut state, &disk, &log, "out").unwrap();
		assert!(state.node(node(&state, "mid")).dirty);
		assert!(state.node(node(&state, "out")).dirty);
	}

	#[test]
	fn touched_order_only_input_does_not_rebuild() {
		let mut state = load(
			"rule cat\n  command = cat $in > $out\nbuild out: cat in || order\n",
		);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");
		disk.tick();
		disk.add_file("out", "");
		disk.tick();
		disk.add_file("order", "");

		let mut log = BuildLog::new();
		log.entries.insert("out".into(), log_entry(&state, EdgeId(0)));

		scan(&mut state, &disk, &log, "out").unwrap();
		assert!(!state.node(node(&state, "out")).dirty);
	}

	#[test]
	fn restat_mtime_keeps_output_clean() {
		let mut state = load(
			"rule t\n  command = true\n  restat = 1\nbuild out: t in\n",
		);
		let disk = VirtualDisk::new();
		disk.add_file("out", "");
		disk.tick();
		disk.add_file("in", "");

		// The last build found the output unchanged while the input
		// already had its current mtime.
		let mut log = BuildLog::new();
		log.entries.insert(
			"out".into(),
			Entry {
				restat_mtime: disk.file_mtime(RawStr::from_str("in")),
				..log_entry(&state, EdgeId(0))
			},
		);

		scan(&mut state, &disk, &log, "out").unwrap();
		assert!(!state.node(node(&state, "out")).dirty);
	}

	#[test]
	fn zero_input_phony_is_always_dirty() {
		let mut state = load("build always: phony\n");
		let disk = VirtualDisk::new();
		disk.add_file("always", "");
		scan(&mut state, &disk, &BuildLog::new(), "always").unwrap();
		assert!(state.node(node(&state, "always")).dirty);
		// Nothing runs for it, so nothing needs to wait for it either.
		assert!(state.edge(EdgeId(0)).outputs_ready);
	}

	#[test]
	fn cycle_is_reported() {
		let mut state = load("rule r\n  command = true\nbuild a: r b\nbuild b: r a\n");
		let disk = VirtualDisk::new();
		match scan(&mut state, &disk, &BuildLog::new(), "a") {
			Err(ScanError::Cycle(msg)) => {
				assert_eq!(msg, "dependency cycle: a -> b -> a");
			}
			other => panic!("unexpected result: {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn validations_are_collected_but_do_not_dirty() {
		let mut state = load(
			"rule cat\n  command = cat $in > $out\n\
			 build out: cat in |@ check\nbuild check: cat other\n",
		);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");
		disk.tick();
		disk.add_file("out", "");

		let mut log = BuildLog::new();
		log.entries.insert("out".into(), log_entry(&state, EdgeId(0)));

		let validations = scan(&mut state, &disk, &log, "out").unwrap();
		assert_eq!(validations, vec![node(&state, "check")]);
		assert!(!state.node(node(&state, "out")).dirty);
	}
}
