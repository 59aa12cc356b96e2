//! The plan: which edges still have to run, and which can run right now.
//!
//! A plan *wants* every dirty edge in the dependency tree of the
//! requested targets. Edges move through three states: not wanted (clean,
//! only tracked so the plan knows when its outputs are usable), wanted
//! (waiting for inputs), and scheduled (handed to a pool, waiting in the
//! ready set or running). Completion propagates through the graph,
//! possibly un-wanting edges whose restat-checked inputs turned out
//! unchanged.

use crate::dyndep::DyndepFile;
use crate::graph::{EdgeId, Mark, NodeId, State};
use crate::mtime::Timestamp;
use crate::scan::{DependencyScan, ScanError};
use raw_string::RawString;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;

/// How much the plan wants an edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Want {
	/// The edge is clean; we only care about when its outputs are ready.
	Nothing,
	/// The edge must run, but is not ready yet.
	ToStart,
	/// The edge was handed to its pool (delayed, ready, or running).
	ToFinish,
}

/// How an edge's execution ended, as reported to
/// [`Plan::edge_finished`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EdgeResult {
	Failed,
	Succeeded,
	/// The command succeeded but did not change its outputs (restat):
	/// consumers whose remaining inputs are clean are dropped from the
	/// plan.
	SucceededButUnchanged,
}

/// A fatal problem while building up or updating a plan.
#[derive(Debug)]
pub enum PlanError {
	/// A dirty leaf node: the file is missing and no edge produces it.
	MissingInput {
		path: RawString,
		needed_by: Option<RawString>,
	},
	Scan(ScanError),
}

impl fmt::Display for PlanError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			PlanError::MissingInput { path, needed_by } => {
				write!(f, "{:?}", path)?;
				if let Some(needed_by) = needed_by {
					write!(f, ", needed by {:?},", needed_by)?;
				}
				write!(f, " missing and no known rule to make it")
			}
			PlanError::Scan(e) => write!(f, "{}", e),
		}
	}
}

impl Error for PlanError {}

impl From<ScanError> for PlanError {
	fn from(src: ScanError) -> PlanError {
		PlanError::Scan(src)
	}
}

/// The set of edges to run, with their readiness and pool state.
pub struct Plan {
	want: BTreeMap<EdgeId, Want>,
	ready: BTreeSet<EdgeId>,
	/// Number of edges that still want to run.
	wanted_edges: usize,
	/// Total number of wanted non-phony edges, for progress reporting.
	command_edges: usize,
}

impl Plan {
	pub fn new() -> Plan {
		Plan {
			want: BTreeMap::new(),
			ready: BTreeSet::new(),
			wanted_edges: 0,
			command_edges: 0,
		}
	}

	/// Add a target (after scanning it) and its dirty dependencies to the
	/// plan.
	///
	/// Returns `false` when the target is already up to date.
	pub fn add_target(&mut self, state: &mut State, node: NodeId) -> Result<bool, PlanError> {
		self.add_sub_target(state, node, None, None)
	}

	fn add_sub_target(
		&mut self,
		state: &mut State,
		node: NodeId,
		dependent: Option<NodeId>,
		mut dyndep_walk: Option<&mut BTreeSet<EdgeId>>,
	) -> Result<bool, PlanError> {
		let edge_id = match state.node(node).in_edge {
			None => {
				// A leaf. Dirty means missing; that is fatal for files the
				// manifest names, but not for stale discovered
				// dependencies.
				if state.node(node).dirty && !state.node(node).generated_by_dep_loader {
					return Err(PlanError::MissingInput {
						path: state.node_path(node).to_owned(),
						needed_by: dependent.map(|d| state.node_path(d).to_owned()),
					});
				}
				return Ok(false);
			}
			Some(edge) => edge,
		};

		if state.edge(edge_id).outputs_ready {
			return Ok(false);
		}

		let first_visit = !self.want.contains_key(&edge_id);
		if first_visit {
			self.want.insert(edge_id, Want::Nothing);
		}
		let want = *self.want.get(&edge_id).unwrap();

		if dyndep_walk.is_some() && want == Want::ToFinish {
			// Already scheduled; a dyndep walk has nothing to add here.
			return Ok(false);
		}

		if state.node(node).dirty && want == Want::Nothing {
			self.want.insert(edge_id, Want::ToStart);
			self.edge_wanted(state, edge_id);
			if dyndep_walk.is_none() && self.all_inputs_ready(state, edge_id) {
				self.schedule_work(state, edge_id);
			}
		}

		if let Some(walk) = dyndep_walk.as_mut() {
			walk.insert(edge_id);
		}

		if !first_visit {
			return Ok(true);
		}

		for i in 0..state.edge(edge_id).inputs.len() {
			let input = state.edge(edge_id).inputs[i];
			self.add_sub_target(
				state,
				input,
				Some(node),
				dyndep_walk.as_mut().map(|w| &mut **w),
			)?;
		}

		Ok(true)
	}

	fn edge_wanted(&mut self, state: &State, edge_id: EdgeId) {
		self.wanted_edges += 1;
		if !state.edge(edge_id).is_phony() {
			self.command_edges += 1;
		}
	}

	fn all_inputs_ready(&self, state: &State, edge_id: EdgeId) -> bool {
		state
			.edge(edge_id)
			.inputs
			.iter()
			.all(|&input| match state.node(input).in_edge {
				None => true,
				Some(in_edge) => state.edge(in_edge).outputs_ready,
			})
	}

	/// Hand an edge whose inputs are all ready to its pool: either into
	/// the ready set, or delayed until the pool has capacity.
	///
	/// An edge can be discovered ready more than once (e.g. through two
	/// different finished inputs); only the first discovery schedules it.
	fn schedule_work(&mut self, state: &mut State, edge_id: EdgeId) {
		let want = self.want.get_mut(&edge_id).unwrap();
		if *want == Want::ToFinish {
			return;
		}
		*want = Want::ToFinish;

		let pool_id = state.edge(edge_id).pool;
		let pool = state.pool_mut(pool_id);
		if pool.should_delay_edge() {
			pool.delay_edge(edge_id);
			pool.retrieve_ready_edges(&mut self.ready);
		} else {
			pool.edge_scheduled();
			self.ready.insert(edge_id);
		}
	}

	/// True while at least one wanted edge has not finished.
	///
	/// Phony edges count: a wanted phony edge still has to be walked over
	/// for its outputs to become ready, even though no command runs.
	pub fn more_to_do(&self) -> bool {
		self.wanted_edges > 0
	}

	/// Number of wanted non-phony edges, for progress reporting. Restat
	/// cancellation lowers this; ordinary completion does not.
	pub fn command_edge_count(&self) -> usize {
		self.command_edges
	}

	/// Take an edge that can run right now, if any.
	pub fn find_work(&mut self) -> Option<EdgeId> {
		let edge = *self.ready.iter().next()?;
		self.ready.remove(&edge);
		Some(edge)
	}

	/// Record the result of running an edge and propagate readiness to
	/// its consumers.
	pub fn edge_finished(
		&mut self,
		state: &mut State,
		scan: &DependencyScan,
		edge_id: EdgeId,
		result: EdgeResult,
	) -> Result<(), PlanError> {
		if result == EdgeResult::SucceededButUnchanged {
			for i in 0..state.edge(edge_id).outputs.len() {
				let output = state.edge(edge_id).outputs[i];
				self.clean_node(state, scan, output)?;
			}
		}

		let directly_wanted = match self.want.get(&edge_id) {
			Some(want) => *want != Want::Nothing,
			None => false,
		};

		// This edge leaving its pool may free up delayed work.
		let pool_id = state.edge(edge_id).pool;
		if directly_wanted {
			state.pool_mut(pool_id).edge_finished();
		}
		state
			.pool_mut(pool_id)
			.retrieve_ready_edges(&mut self.ready);

		if result == EdgeResult::Failed {
			// The edge stays wanted, so `more_to_do` keeps reporting
			// unfinished work; the builder decides when to give up.
			return Ok(());
		}

		if directly_wanted {
			self.wanted_edges -= 1;
		}
		self.want.remove(&edge_id);
		state.edge_mut(edge_id).outputs_ready = true;

		for i in 0..state.edge(edge_id).outputs.len() {
			let output = state.edge(edge_id).outputs[i];
			self.node_finished(state, scan, output)?;
		}
		Ok(())
	}

	fn node_finished(
		&mut self,
		state: &mut State,
		scan: &DependencyScan,
		node: NodeId,
	) -> Result<(), PlanError> {
		let out_edges = state.node(node).out_edges.clone();
		for edge in out_edges {
			if self.want.contains_key(&edge) {
				self.edge_maybe_ready(state, scan, edge)?;
			}
		}
		Ok(())
	}

	fn edge_maybe_ready(
		&mut self,
		state: &mut State,
		scan: &DependencyScan,
		edge_id: EdgeId,
	) -> Result<(), PlanError> {
		if !self.all_inputs_ready(state, edge_id) {
			return Ok(());
		}
		if *self.want.get(&edge_id).unwrap() == Want::Nothing {
			// A clean edge whose last input became ready: it finishes
			// without running.
			self.edge_finished(state, scan, edge_id, EdgeResult::Succeeded)
		} else {
			self.schedule_work(state, edge_id);
			Ok(())
		}
	}

	/// An output of a restat rule turned out unchanged: mark it clean and
	/// drop consumers from the plan if they have no other reason to run.
	pub fn clean_node(
		&mut self,
		state: &mut State,
		scan: &DependencyScan,
		node: NodeId,
	) -> Result<(), PlanError> {
		state.node_mut(node).dirty = false;

		let out_edges = state.node(node).out_edges.clone();
		for edge_id in out_edges {
			match self.want.get(&edge_id) {
				Some(Want::Nothing) | None => continue,
				Some(_) => {}
			}
			// An edge whose recorded deps are missing runs regardless.
			if state.edge(edge_id).deps_missing {
				continue;
			}

			let non_order_only = state.edge(edge_id).non_order_only_inputs().to_vec();
			if non_order_only.iter().any(|&i| state.node(i).dirty) {
				continue;
			}

			let most_recent_input: Option<Timestamp> = non_order_only
				.iter()
				.filter_map(|&i| state.node(i).state.mtime())
				.max();

			let outputs_dirty =
				scan.recompute_outputs_dirty(state, edge_id, most_recent_input)?;
			if outputs_dirty {
				continue;
			}

			for i in 0..state.edge(edge_id).outputs.len() {
				let output = state.edge(edge_id).outputs[i];
				self.clean_node(state, scan, output)?;
			}

			self.want.insert(edge_id, Want::Nothing);
			self.wanted_edges -= 1;
			if !state.edge(edge_id).is_phony() {
				self.command_edges -= 1;
			}
		}
		Ok(())
	}

	/// A dyndep file was loaded during the build: refresh the dirty state
	/// of everything downstream of it and fold newly discovered work into
	/// the plan.
	pub fn dyndeps_loaded(
		&mut self,
		state: &mut State,
		scan: &DependencyScan,
		node: NodeId,
		file: &DyndepFile,
	) -> Result<(), PlanError> {
		self.refresh_dyndep_dependents(state, scan, node)?;

		// The edges this file applies to are only interesting if the plan
		// already tracks them; nothing in the plan depends on the others
		// yet.
		let mut roots = Vec::new();
		for (&edge_id, _) in file {
			if state.edge(edge_id).outputs_ready {
				continue;
			}
			if self.want.contains_key(&edge_id) {
				roots.push(edge_id);
			}
		}

		// Walk the newly discovered part of the graph.
		let mut walk = BTreeSet::new();
		for edge_id in roots {
			let dependent = state.edge(edge_id).outputs[0];
			for i in 0..state.edge(edge_id).inputs.len() {
				let input = state.edge(edge_id).inputs[i];
				self.add_sub_target(state, input, Some(dependent), Some(&mut walk))?;
			}
		}

		// Some encountered edges may be ready now.
		for edge_id in walk {
			if self.want.contains_key(&edge_id) {
				self.edge_maybe_ready(state, scan, edge_id)?;
			}
		}
		Ok(())
	}

	fn refresh_dyndep_dependents(
		&mut self,
		state: &mut State,
		scan: &DependencyScan,
		node: NodeId,
	) -> Result<(), PlanError> {
		// Forget the scan marks of everything depending on the dyndep
		// file, then re-scan those nodes against the grown graph.
		let mut dependents = BTreeSet::new();
		self.unmark_dependents(state, node, &mut dependents);

		for &dependent in &dependents {
			let mut validations = Vec::new();
			scan.recompute_dirty(state, dependent, &mut validations)?;

			if !state.node(dependent).dirty {
				continue;
			}
			let edge_id = state.node(dependent).in_edge.unwrap();
			if let Some(want) = self.want.get(&edge_id) {
				if *want == Want::Nothing {
					self.want.insert(edge_id, Want::ToStart);
					self.edge_wanted(state, edge_id);
				}
			}
		}
		Ok(())
	}

	fn unmark_dependents(
		&self,
		state: &mut State,
		node: NodeId,
		dependents: &mut BTreeSet<NodeId>,
	) {
		let out_edges = state.node(node).out_edges.clone();
		for edge_id in out_edges {
			if !self.want.contains_key(&edge_id) {
				continue;
			}
			if state.edge(edge_id).mark == Mark::None {
				continue;
			}
			state.edge_mut(edge_id).mark = Mark::None;
			for i in 0..state.edge(edge_id).outputs.len() {
				let output = state.edge(edge_id).outputs[i];
				if dependents.insert(output) {
					self.unmark_dependents(state, output, dependents);
				}
			}
		}
	}

	/// Forget all plan state, keeping the graph itself untouched.
	pub fn reset(&mut self, state: &mut State) {
		self.want.clear();
		self.ready.clear();
		self.wanted_edges = 0;
		self.command_edges = 0;
		for i in 0..state.edge_count() as u32 {
			let pool = state.edge(EdgeId(i)).pool;
			state.pool_mut(pool).reset();
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::buildlog::BuildLog;
	use crate::deplog::DepsLog;
	use crate::disk::VirtualDisk;
	use crate::manifest::load_from;
	use raw_string::RawStr;

	fn load(source: &str) -> State {
		load_from("build.ninja".as_ref(), source.as_bytes()).unwrap()
	}

	fn node(state: &State, path: &str) -> NodeId {
		state.node_id(RawStr::from_str(path)).unwrap()
	}

	fn scan_and_plan(state: &mut State, disk: &VirtualDisk, target: &str) -> (Plan, bool) {
		let build_log = BuildLog::new();
		let deps_log = DepsLog::new();
		let scan = DependencyScan::new(disk, &build_log, &deps_log);
		let target = node(state, target);
		let mut validations = Vec::new();
		scan.recompute_dirty(state, target, &mut validations).unwrap();
		let mut plan = Plan::new();
		let work = plan.add_target(state, target).unwrap();
		(plan, work)
	}

	fn finish(state: &mut State, disk: &VirtualDisk, plan: &mut Plan, edge: EdgeId) {
		// Pretend the command ran and wrote its outputs.
		for i in 0..state.edge(edge).outputs.len() {
			let output = state.edge(edge).outputs[i];
			disk.touch(state.node_path(output));
			let mtime = disk.file_mtime(state.node_path(output));
			state.node_mut(output).state =
				crate::mtime::FileState::from_mtime(mtime);
		}
		let build_log = BuildLog::new();
		let deps_log = DepsLog::new();
		let scan = DependencyScan::new(disk, &build_log, &deps_log);
		plan.edge_finished(state, &scan, edge, EdgeResult::Succeeded)
			.unwrap();
	}

	const CHAIN: &str =
		"rule cat\n  command = cat $in > $out\nbuild mid: cat in\nbuild out: cat mid\n";

	#[test]
	fn chain_runs_in_dependency_order() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");

		let (mut plan, work) = scan_and_plan(&mut state, &disk, "out");
		assert!(work);
		assert!(plan.more_to_do());

		let first = plan.find_work().unwrap();
		assert_eq!(first, EdgeId(0));
		assert_eq!(plan.find_work(), None);

		finish(&mut state, &disk, &mut plan, first);
		let second = plan.find_work().unwrap();
		assert_eq!(second, EdgeId(1));
		finish(&mut state, &disk, &mut plan, second);

		assert!(!plan.more_to_do());
	}

	#[test]
	fn up_to_date_target_has_no_work() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");
		disk.tick();
		disk.add_file("mid", "");
		disk.tick();
		disk.add_file("out", "");

		// Build log entries so nothing is dirty.
		let mut build_log = BuildLog::new();
		for edge in 0..2 {
			let command = state.edge(EdgeId(edge)).command.as_ref().unwrap();
			build_log.entries.insert(
				state
					.node_path(state.edge(EdgeId(edge)).outputs[0])
					.to_owned(),
				crate::buildlog::Entry {
					start_time_ms: 0,
					end_time_ms: 1,
					restat_mtime: None,
					command_hash: crate::buildlog::hash_command(
						&command.command,
						&command.rspfile_content,
					),
				},
			);
		}

		let deps_log = DepsLog::new();
		let scan = DependencyScan::new(&disk, &build_log, &deps_log);
		let target = node(&state, "out");
		let mut validations = Vec::new();
		scan.recompute_dirty(&mut state, target, &mut validations).unwrap();

		let mut plan = Plan::new();
		assert!(!plan.add_target(&mut state, target).unwrap());
		assert!(!plan.more_to_do());
	}

	#[test]
	fn missing_input_is_an_error() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		// "in" does not exist and nothing builds it.

		let build_log = BuildLog::new();
		let deps_log = DepsLog::new();
		let scan = DependencyScan::new(&disk, &build_log, &deps_log);
		let target = node(&state, "out");
		let mut validations = Vec::new();
		scan.recompute_dirty(&mut state, target, &mut validations).unwrap();

		let mut plan = Plan::new();
		match plan.add_target(&mut state, target).unwrap_err() {
			PlanError::MissingInput { path, needed_by } => {
				assert_eq!(path, "in");
				assert_eq!(needed_by, Some("mid".into()));
			}
			e => panic!("unexpected error: {}", e),
		}
	}

	#[test]
	fn pool_admits_one_edge_at_a_time() {
		let mut state = load(
			"pool p\n  depth = 1\n\
			 rule r\n  command = touch $out\n  pool = p\n\
			 build a: r\nbuild b: r\nbuild both: phony a b\n",
		);
		let disk = VirtualDisk::new();

		let (mut plan, _) = scan_and_plan(&mut state, &disk, "both");

		let first = plan.find_work().unwrap();
		// The pool keeps the second edge delayed, even though its inputs
		// are ready.
		assert_eq!(plan.find_work(), None);

		finish(&mut state, &disk, &mut plan, first);
		let second = plan.find_work().unwrap();
		assert_ne!(first, second);
		finish(&mut state, &disk, &mut plan, second);

		// The phony edge groups the two.
		let phony = plan.find_work().unwrap();
		assert!(state.edge(phony).is_phony());
		finish(&mut state, &disk, &mut plan, phony);
		assert!(!plan.more_to_do());
	}

	#[test]
	fn diamond_does_not_double_schedule() {
		// "top" depends on the same node through two paths.
		let mut state = load(
			"rule cat\n  command = cat $in > $out\n\
			 build base: cat in\n\
			 build left: cat base\n\
			 build right: cat base\n\
			 build top: cat left right\n",
		);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");

		let (mut plan, _) = scan_and_plan(&mut state, &disk, "top");

		let base = plan.find_work().unwrap();
		assert_eq!(plan.find_work(), None);
		finish(&mut state, &disk, &mut plan, base);

		// Both intermediate edges become ready exactly once.
		let e1 = plan.find_work().unwrap();
		let e2 = plan.find_work().unwrap();
		assert_ne!(e1, e2);
		assert_eq!(plan.find_work(), None);
		finish(&mut state, &disk, &mut plan, e1);
		assert_eq!(plan.find_work(), None);
		finish(&mut state, &disk, &mut plan, e2);

		let top = plan.find_work().unwrap();
		finish(&mut state, &disk, &mut plan, top);
		assert!(!plan.more_to_do());
	}

	#[test]
	fn phony_chain_completes() {
		// A zero-input phony edge is always dirty but also always ready,
		// so its consumers must still be walked to completion even though
		// no command ever runs.
		let mut state = load("build a: phony\nbuild b: phony a\nbuild top: phony b\n");
		let disk = VirtualDisk::new();

		let (mut plan, work) = scan_and_plan(&mut state, &disk, "top");
		assert!(work);
		assert!(plan.more_to_do());

		let b = plan.find_work().unwrap();
		finish(&mut state, &disk, &mut plan, b);
		let top = plan.find_work().unwrap();
		assert_ne!(b, top);
		finish(&mut state, &disk, &mut plan, top);

		assert!(!plan.more_to_do());
		assert!(state.edge(b).outputs_ready);
		assert!(state.edge(top).outputs_ready);
	}

	#[test]
	fn reset_forgets_everything() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");

		let (mut plan, _) = scan_and_plan(&mut state, &disk, "out");
		assert!(plan.more_to_do());

		plan.reset(&mut state);
		assert!(!plan.more_to_do());
		assert_eq!(plan.find_work(), None);
	}

	#[test]
	fn failed_edge_keeps_the_plan_unfinished() {
		let mut state = load(CHAIN);
		let disk = VirtualDisk::new();
		disk.add_file("in", "");

		let (mut plan, _) = scan_and_plan(&mut state, &disk, "out");
		let first = plan.find_work().unwrap();

		let build_log = BuildLog::new();
		let deps_log = DepsLog::new();
		let scan = DependencyScan::new(&disk, &build_log, &deps_log);
		plan.edge_finished(&mut state, &scan, first, EdgeResult::Failed)
			.unwrap();

		assert!(plan.more_to_do());
		assert_eq!(plan.find_work(), None);
	}
}
