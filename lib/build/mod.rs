//! Driving a plan to completion.
//!
//! The [`Builder`] owns the plan and pumps it against a
//! [`CommandRunner`]: it pulls ready edges, prepares them (output
//! directories, response files), submits them, and folds every finished
//! command back into the graph, the logs, and the plan. The core stays
//! single-threaded; the runner is the only thing working concurrently,
//! and it talks back purely through [`CommandResult`] values.

use crate::buildlog::{hash_command, BuildLogMut, Entry};
use crate::deplog::DepsLogMut;
use crate::deps;
use crate::disk::Disk;
use crate::dyndep;
use crate::graph::{DepStyle, EdgeId, NodeId, State};
use crate::mtime::Timestamp;
use crate::plan::{EdgeResult, Plan, PlanError};
use crate::scan::{DependencyScan, ScanError};
use log::warn;
use raw_string::{RawStr, RawString};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::time::Instant;

/// How a command ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitStatus {
	Success,
	Failure,
	/// The command was killed by an interruption signal.
	Interrupted,
}

/// What the runner reports back for one finished command.
#[derive(Debug)]
pub struct CommandResult {
	pub edge: EdgeId,
	pub status: ExitStatus,
	/// The combined stdout and stderr of the command.
	pub output: RawString,
}

/// Executes the commands of edges, possibly several at once.
///
/// The builder is the only caller; it never submits more work when
/// [`can_run_more`][Self::can_run_more] says no, and it blocks in
/// [`wait_for_command`][Self::wait_for_command] whenever it has nothing
/// else to do.
pub trait CommandRunner {
	/// May the builder submit another edge right now?
	fn can_run_more(&self) -> bool;

	/// Submit an edge. Returning `false` refuses it, which the builder
	/// treats as the edge failing.
	fn start_command(&mut self, state: &State, edge: EdgeId) -> bool;

	/// Block until some submitted edge finishes. Returns `None` when
	/// nothing is running.
	fn wait_for_command(&mut self) -> Option<CommandResult>;

	/// The edges submitted but not yet reported finished.
	fn active_edges(&self) -> Vec<EdgeId>;

	/// Stop all running commands as soon as possible. Subsequent
	/// [`wait_for_command`][Self::wait_for_command] calls may still
	/// return partial results, then `None`.
	fn abort(&mut self);
}

/// Receives progress reports from the builder.
pub trait StatusListener {
	/// The plan is final; `total_commands` edges want to run.
	fn build_started(&mut self, _total_commands: usize) {}
	fn edge_started(&mut self, state: &State, edge: EdgeId);
	fn edge_finished(&mut self, state: &State, edge: EdgeId, success: bool, output: &RawStr);
}

/// A status listener that reports nowhere.
pub struct SilentStatus;

impl StatusListener for SilentStatus {
	fn edge_started(&mut self, _: &State, _: EdgeId) {}
	fn edge_finished(&mut self, _: &State, _: EdgeId, _: bool, _: &RawStr) {}
}

/// Knobs for a build.
#[derive(Clone, Copy, Debug)]
pub struct BuildConfig {
	/// How many failing commands to tolerate before giving up.
	pub failures_allowed: usize,
	/// Pretend to run commands: nothing is written, removed, or logged.
	pub dry_run: bool,
}

impl Default for BuildConfig {
	fn default() -> Self {
		BuildConfig {
			failures_allowed: 1,
			dry_run: false,
		}
	}
}

/// Why a build did not complete.
#[derive(Debug)]
pub enum BuildError {
	Plan(PlanError),
	Scan(ScanError),
	/// One or more commands failed.
	SubcommandsFailed { failures: usize },
	/// Unfinished work remains but nothing can run.
	CannotMakeProgress,
	/// An interruption signal arrived; started edges were cleaned up.
	Interrupted,
	Io(io::Error),
}

impl fmt::Display for BuildError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			BuildError::Plan(e) => write!(f, "{}", e),
			BuildError::Scan(e) => write!(f, "{}", e),
			BuildError::SubcommandsFailed { failures: 1 } => {
				write!(f, "subcommand failed")
			}
			BuildError::SubcommandsFailed { failures } => {
				write!(f, "{} subcommands failed", failures)
			}
			BuildError::CannotMakeProgress => write!(f, "cannot make progress"),
			BuildError::Interrupted => write!(f, "interrupted by user"),
			BuildError::Io(e) => write!(f, "{}", e),
		}
	}
}

impl Error for BuildError {}

impl From<PlanError> for BuildError {
	fn from(src: PlanError) -> BuildError {
		BuildError::Plan(src)
	}
}

impl From<ScanError> for BuildError {
	fn from(src: ScanError) -> BuildError {
		BuildError::Scan(src)
	}
}

impl From<io::Error> for BuildError {
	fn from(src: io::Error) -> BuildError {
		BuildError::Io(src)
	}
}

/// Runs a build: scans targets, plans, and executes.
pub struct Builder<'a> {
	state: &'a mut State,
	disk: &'a dyn Disk,
	build_log: &'a mut BuildLogMut,
	deps_log: &'a mut DepsLogMut,
	status: &'a mut dyn StatusListener,
	config: BuildConfig,
	plan: Plan,
	/// Commands submitted to the runner but not yet finished.
	running: usize,
	start_times: BTreeMap<EdgeId, u32>,
	start_time: Instant,
}

impl<'a> Builder<'a> {
	pub fn new(
		state: &'a mut State,
		disk: &'a dyn Disk,
		build_log: &'a mut BuildLogMut,
		deps_log: &'a mut DepsLogMut,
		status: &'a mut dyn StatusListener,
		config: BuildConfig,
	) -> Self {
		Builder {
			state,
			disk,
			build_log,
			deps_log,
			status,
			config,
			plan: Plan::new(),
			running: 0,
			start_times: BTreeMap::new(),
			start_time: Instant::now(),
		}
	}

	/// Scan a target and add it, along with any validation targets its
	/// edges reference, to the plan.
	///
	/// Returns `false` when there is nothing to do for it.
	pub fn add_target(&mut self, node: NodeId) -> Result<bool, BuildError> {
		let mut validations = Vec::new();
		{
			let scan = DependencyScan::new(self.disk, self.build_log, self.deps_log);
			scan.recompute_dirty(self.state, node, &mut validations)?;
		}

		let mut work = match self.state.node(node).in_edge {
			Some(edge) if self.state.edge(edge).outputs_ready => false,
			_ => self.plan.add_target(self.state, node)?,
		};

		for validation in validations {
			if let Some(edge) = self.state.node(validation).in_edge {
				if !self.state.edge(edge).outputs_ready {
					work |= self.plan.add_target(self.state, validation)?;
				}
			}
		}

		Ok(work)
	}

	/// Whether the plan has any work.
	pub fn has_work(&self) -> bool {
		self.plan.more_to_do()
	}

	/// The graph being built.
	pub fn state(&self) -> &State {
		self.state
	}

	/// Run the plan to completion against `runner`.
	pub fn build(&mut self, runner: &mut dyn CommandRunner) -> Result<(), BuildError> {
		let mut failures = 0;
		self.status.build_started(self.plan.command_edge_count());

		while self.plan.more_to_do() {
			// Start as many ready edges as the runner accepts.
			if failures < self.config.failures_allowed && runner.can_run_more() {
				if let Some(edge) = self.plan.find_work() {
					if self.state.edge(edge).is_phony() {
						self.plan_edge_finished(edge, EdgeResult::Succeeded)?;
						continue;
					}
					match self.start_edge(edge, runner) {
						Ok(()) => self.running += 1,
						Err(e) => {
							// A per-edge failure before the command even
							// ran (missing dirs, refused submission).
							self.status.edge_finished(
								self.state,
								edge,
								false,
								RawStr::from_str(&format!("{}", e)),
							);
							self.plan_edge_finished(edge, EdgeResult::Failed)?;
							failures += 1;
						}
					}
					continue;
				}
			}

			if self.running > 0 {
				let result = match runner.wait_for_command() {
					Some(result) => result,
					None => break,
				};
				self.running -= 1;

				if result.status == ExitStatus::Interrupted {
					self.cleanup(runner, Some(result.edge));
					return Err(BuildError::Interrupted);
				}

				if !self.finish_command(&result)? {
					failures += 1;
				}
				continue;
			}

			// Nothing is running and nothing can start.
			break;
		}

		if !self.plan.more_to_do() {
			return Ok(());
		}
		if failures > 0 {
			Err(BuildError::SubcommandsFailed { failures })
		} else {
			Err(BuildError::CannotMakeProgress)
		}
	}

	fn elapsed_ms(&self) -> u32 {
		let elapsed = self.start_time.elapsed();
		elapsed.as_secs() as u32 * 1000 + elapsed.subsec_millis()
	}

	fn plan_edge_finished(
		&mut self,
		edge: EdgeId,
		result: EdgeResult,
	) -> Result<(), BuildError> {
		let scan = DependencyScan::new(self.disk, self.build_log, self.deps_log);
		self.plan
			.edge_finished(self.state, &scan, edge, result)
			.map_err(BuildError::Plan)
	}

	/// Prepare an edge and hand it to the runner: create the output
	/// directories, write the response file, submit.
	fn start_edge(
		&mut self,
		edge: EdgeId,
		runner: &mut dyn CommandRunner,
	) -> Result<(), io::Error> {
		self.status.edge_started(self.state, edge);
		self.start_times.insert(edge, self.elapsed_ms());

		if !self.config.dry_run {
			for i in 0..self.state.edge(edge).outputs.len() {
				let output = self.state.edge(edge).outputs[i];
				self.disk.make_dirs_for(self.state.node_path(output))?;
			}

			let (rspfile, rspfile_content) = {
				let command = self.state.edge(edge).command.as_ref().unwrap();
				(command.rspfile.clone(), command.rspfile_content.clone())
			};
			if !rspfile.is_empty() {
				self.disk.write_file(&rspfile, &rspfile_content)?;
			}
		}

		if !runner.start_command(self.state, edge) {
			return Err(io::Error::new(
				io::ErrorKind::Other,
				"command runner refused the edge",
			));
		}
		Ok(())
	}

	/// Fold one finished command back into the graph, the logs, and the
	/// plan. Returns whether the command succeeded.
	fn finish_command(&mut self, result: &CommandResult) -> Result<bool, BuildError> {
		let edge = result.edge;
		let end_time_ms = self.elapsed_ms();
		let start_time_ms = self.start_times.remove(&edge).unwrap_or(end_time_ms);
		let mut output = result.output.clone();
		let mut success = result.status == ExitStatus::Success;

		// First, extract any dependencies the command discovered, before
		// anything deletes the evidence.
		let (deps_style, depfile, msvc_prefix) = {
			let command = self.state.edge(edge).command.as_ref().unwrap();
			(
				command.deps,
				command.depfile.clone(),
				command.msvc_deps_prefix.clone(),
			)
		};
		let mut discovered_deps = Vec::new();
		if success && !self.config.dry_run {
			match deps_style {
				Some(DepStyle::Gcc) => {
					match deps::extract_deps_from_depfile(self.disk, &depfile) {
						Ok(deps) => discovered_deps = deps,
						Err(e) => {
							output.push_str(e.to_string().as_str());
							output.push(b'\n');
							success = false;
						}
					}
				}
				Some(DepStyle::Msvc) => {
					match deps::extract_deps_from_output(&output, &msvc_prefix) {
						Ok((deps, rest)) => {
							discovered_deps = deps;
							output = rest;
						}
						Err(e) => {
							output.push_str(e.to_string().as_str());
							output.push(b'\n');
							success = false;
						}
					}
				}
				None => {}
			}
		}

		// Re-stat the outputs. For restat rules, outputs the command left
		// untouched can cancel downstream work.
		let mut edge_result = if success {
			EdgeResult::Succeeded
		} else {
			EdgeResult::Failed
		};
		let mut restat_mtime = None;
		if success {
			let restat = self.state.edge(edge).restat();
			let mut any_changed = false;
			for i in 0..self.state.edge(edge).outputs.len() {
				let node = self.state.edge(edge).outputs[i];
				let old = self.state.node(node).state;
				let fresh = self.disk.stat(self.state.node_path(node))?;
				if fresh != old {
					any_changed = true;
				}
				self.state.node_mut(node).state = fresh;
			}
			if restat && !any_changed {
				edge_result = EdgeResult::SucceededButUnchanged;
				// Record the mtime the outputs were found clean against,
				// so future scans compare inputs with it.
				restat_mtime = self.most_recent_input_mtime(edge);
			}
		}

		// The response file is evidence on failure, garbage on success.
		if success && !self.config.dry_run {
			let rspfile = self
				.state
				.edge(edge)
				.command
				.as_ref()
				.unwrap()
				.rspfile
				.clone();
			if !rspfile.is_empty() {
				self.disk.remove_file(&rspfile)?;
			}
		}

		// If this edge wrote a dyndep file someone is waiting for, load
		// it before completion propagates, so consumers are scheduled
		// against the updated graph.
		if success && !self.config.dry_run {
			for i in 0..self.state.edge(edge).outputs.len() {
				let node = self.state.edge(edge).outputs[i];
				if self.state.node(node).dyndep_pending {
					let file = dyndep::load(self.state, self.disk, node)
						.map_err(|e| BuildError::Scan(ScanError::Dyndep(e)))?;
					let scan =
						DependencyScan::new(self.disk, self.build_log, self.deps_log);
					self.plan
						.dyndeps_loaded(self.state, &scan, node, &file)?;
				}
			}
		}

		self.plan_edge_finished(edge, edge_result)?;

		if success && !self.config.dry_run {
			let (hash, outputs) = {
				let e = self.state.edge(edge);
				let command = e.command.as_ref().unwrap();
				(
					hash_command(&command.command, &command.rspfile_content),
					e.outputs.clone(),
				)
			};
			for &node in &outputs {
				self.build_log.record_command(
					self.state.node_path(node).to_owned(),
					Entry {
						start_time_ms,
						end_time_ms,
						restat_mtime,
						command_hash: hash,
					},
				)?;
			}
			if deps_style.is_some() {
				let primary = outputs[0];
				let mtime = self.state.node(primary).state.mtime();
				self.deps_log.record_deps(
					self.state.node_path(primary).to_owned(),
					mtime,
					discovered_deps.into_iter().map(|(path, _)| path).collect(),
				)?;
			}
		}

		self.status.edge_finished(self.state, edge, success, &output);
		Ok(success)
	}

	fn most_recent_input_mtime(&self, edge: EdgeId) -> Option<Timestamp> {
		self.state
			.edge(edge)
			.non_order_only_inputs()
			.iter()
			.filter_map(|&input| self.state.node(input).state.mtime())
			.max()
	}

	/// After an interruption: abort the runner and delete the outputs of
	/// started-but-unfinished edges that were already written to, so no
	/// half-finished file survives with a fresh mtime. Untouched outputs
	/// are kept.
	fn cleanup(&mut self, runner: &mut dyn CommandRunner, interrupted: Option<EdgeId>) {
		runner.abort();
		let mut edges = runner.active_edges();
		edges.extend(interrupted);
		for edge in edges {
			for i in 0..self.state.edge(edge).outputs.len() {
				let node = self.state.edge(edge).outputs[i];
				let path = self.state.node_path(node).to_owned();
				let before = self.state.node(node).state;
				match self.disk.stat(&path) {
					Ok(now) if now != before => {
						if let Err(e) = self.disk.remove_file(&path) {
							warn!("failed to clean up {}: {}", path, e);
						}
					}
					Ok(_) => {}
					Err(e) => warn!("failed to stat {} during cleanup: {}", path, e),
				}
			}
			// A depfile from a half-run command describes nothing usable.
			let depfile = self
				.state
				.edge(edge)
				.command
				.as_ref()
				.map(|c| c.depfile.clone())
				.unwrap_or_else(RawString::new);
			if !depfile.is_empty() {
				if let Err(e) = self.disk.remove_file(&depfile) {
					warn!("failed to clean up {}: {}", depfile, e);
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::VirtualDisk;
	use crate::manifest::load_from;
	use std::collections::{BTreeSet, VecDeque};
	use std::path::PathBuf;

	struct Running {
		edge: EdgeId,
		command: RawString,
		outputs: Vec<RawString>,
	}

	/// A scripted command runner: commands "run" against the virtual
	/// disk, synchronously, in submission order. Rules whose command
	/// starts with `true` touch nothing.
	struct VirtualRunner<'d> {
		disk: &'d VirtualDisk,
		capacity: usize,
		queue: VecDeque<Running>,
		/// Every evaluated command, in start order.
		commands: Vec<RawString>,
		/// The largest number of simultaneously submitted commands.
		max_active: usize,
		/// Commands that exit nonzero.
		fail: BTreeSet<RawString>,
		/// Commands that die from an interruption signal after touching
		/// their outputs.
		interrupt: BTreeSet<RawString>,
		/// Extra files a command writes, keyed by command line.
		extra_writes: BTreeMap<RawString, Vec<(RawString, RawString)>>,
		aborted: bool,
	}

	impl<'d> VirtualRunner<'d> {
		fn new(disk: &'d VirtualDisk, capacity: usize) -> Self {
			VirtualRunner {
				disk,
				capacity,
				queue: VecDeque::new(),
				commands: Vec::new(),
				max_active: 0,
				fail: BTreeSet::new(),
				interrupt: BTreeSet::new(),
				extra_writes: BTreeMap::new(),
				aborted: false,
			}
		}

		fn command_strings(&self) -> Vec<String> {
			self.commands.iter().map(|c| c.to_string()).collect()
		}
	}

	impl<'d> CommandRunner for VirtualRunner<'d> {
		fn can_run_more(&self) -> bool {
			self.queue.len() < self.capacity
		}

		fn start_command(&mut self, state: &State, edge: EdgeId) -> bool {
			let command = state.edge(edge).command.as_ref().unwrap().command.clone();
			let outputs = state
				.edge(edge)
				.outputs
				.iter()
				.map(|&o| state.node_path(o).to_owned())
				.collect();
			self.commands.push(command.clone());
			self.queue.push_back(Running {
				edge,
				command,
				outputs,
			});
			self.max_active = self.max_active.max(self.queue.len());
			true
		}

		fn wait_for_command(&mut self) -> Option<CommandResult> {
			let running = self.queue.pop_front()?;
			if self.aborted {
				return Some(CommandResult {
					edge: running.edge,
					status: ExitStatus::Interrupted,
					output: RawString::new(),
				});
			}
			if self.fail.contains(&running.command) {
				return Some(CommandResult {
					edge: running.edge,
					status: ExitStatus::Failure,
					output: "exit status 1\n".into(),
				});
			}
			let interrupted = self.interrupt.contains(&running.command);
			if !running.command.starts_with("true") {
				for output in &running.outputs {
					self.disk.touch(output);
				}
				if let Some(writes) = self.extra_writes.get(&running.command) {
					for (path, content) in writes {
						self.disk.write_file(path, content).unwrap();
					}
				}
			}
			Some(CommandResult {
				edge: running.edge,
				status: if interrupted {
					ExitStatus::Interrupted
				} else {
					ExitStatus::Success
				},
				output: RawString::new(),
			})
		}

		fn active_edges(&self) -> Vec<EdgeId> {
			self.queue.iter().map(|r| r.edge).collect()
		}

		fn abort(&mut self) {
			self.aborted = true;
		}
	}

	/// Everything a build needs except the disk, which lives outside so
	/// the runner can borrow it at the same time.
	struct BuildHarness {
		state: State,
		build_log: BuildLogMut,
		deps_log: DepsLogMut,
		log_dir: PathBuf,
	}

	fn temp_dir(name: &str) -> PathBuf {
		let mut dir = std::env::temp_dir();
		dir.push(format!("shuriken-build-test-{}-{}", std::process::id(), name));
		std::fs::remove_dir_all(&dir).ok();
		std::fs::create_dir_all(&dir).unwrap();
		dir
	}

	impl BuildHarness {
		fn new(test_name: &str, manifest: &str) -> Self {
			let state = load_from("build.ninja".as_ref(), manifest.as_bytes()).unwrap();
			let log_dir = temp_dir(test_name);
			let build_log = BuildLogMut::open(log_dir.join(".ninja_log")).unwrap();
			let deps_log = DepsLogMut::open(log_dir.join(".ninja_deps")).unwrap();
			BuildHarness {
				state,
				build_log,
				deps_log,
				log_dir,
			}
		}

		/// Pretend an earlier build produced `path` with the current
		/// command hash, so only real differences make edges dirty.
		fn log_entry(&mut self, path: &str) {
			let node = self.state.node_id(RawStr::from_str(path)).unwrap();
			let edge = self.state.node(node).in_edge.unwrap();
			let command = self.state.edge(edge).command.as_ref().unwrap();
			let entry = Entry {
				start_time_ms: 0,
				end_time_ms: 1,
				restat_mtime: None,
				command_hash: hash_command(&command.command, &command.rspfile_content),
			};
			self.build_log
				.record_command(RawString::from(path), entry)
				.unwrap();
		}

		fn build(
			&mut self,
			disk: &VirtualDisk,
			runner: &mut VirtualRunner,
			targets: &[&str],
		) -> Result<(), BuildError> {
			let nodes: Vec<NodeId> = targets
				.iter()
				.map(|target| {
					self.state
						.node_id(RawStr::from_str(target))
						.unwrap_or_else(|| panic!("unknown target {:?}", target))
				})
				.collect();
			let mut status = SilentStatus;
			let mut builder = Builder::new(
				&mut self.state,
				disk,
				&mut self.build_log,
				&mut self.deps_log,
				&mut status,
				BuildConfig::default(),
			);
			let mut any_work = false;
			for node in nodes {
				any_work |= builder.add_target(node)?;
			}
			if !any_work {
				return Ok(());
			}
			builder.build(runner)
		}
	}

	impl Drop for BuildHarness {
		fn drop(&mut self) {
			std::fs::remove_dir_all(&self.log_dir).ok();
		}
	}

	fn harness(test_name: &str, manifest: &str) -> (BuildHarness, VirtualDisk) {
		(BuildHarness::new(test_name, manifest), VirtualDisk::new())
	}

	const CHAIN: &str =
		"rule cat\n  command = cat $in > $out\nbuild mid: cat in\nbuild out: cat mid\n";

	#[test]
	fn basic_chain_runs_in_order() {
		let (mut h, disk) = harness("chain", CHAIN);
		disk.add_file("in", "");
		let mut runner = VirtualRunner::new(&disk, 4);

		h.build(&disk, &mut runner, &["out"]).unwrap();

		assert_eq!(
			runner.command_strings(),
			vec!["cat in > mid", "cat mid > out"]
		);
		assert!(disk.has_file(RawStr::from_str("mid")));
		assert!(disk.has_file(RawStr::from_str("out")));
		// Everything that was built got a build log entry.
		assert!(h.build_log.get(RawStr::from_str("mid")).is_some());
		assert!(h.build_log.get(RawStr::from_str("out")).is_some());
	}

	#[test]
	fn second_build_does_nothing() {
		let (mut h, disk) = harness("second-build", CHAIN);
		disk.add_file("in", "");
		let mut runner = VirtualRunner::new(&disk, 4);
		h.build(&disk, &mut runner, &["out"]).unwrap();

		// Rescan from scratch, as a fresh invocation would.
		h.state.reset();
		let mut runner = VirtualRunner::new(&disk, 4);
		h.build(&disk, &mut runner, &["out"]).unwrap();
		assert_eq!(runner.command_strings(), Vec::<String>::new());
	}

	#[test]
	fn pool_depth_one_serializes() {
		let (mut h, disk) = harness(
			"pool",
			"pool p\n  depth = 1\n\
			 rule slow\n  command = slow $out\n  pool = p\n\
			 build a: slow\nbuild b: slow\nbuild all: phony a b\n",
		);
		let mut runner = VirtualRunner::new(&disk, 4);

		h.build(&disk, &mut runner, &["all"]).unwrap();

		// Both ran, never side by side, despite runner capacity.
		assert_eq!(runner.commands.len(), 2);
		assert_eq!(runner.max_active, 1);
	}

	#[test]
	fn unconstrained_edges_run_in_parallel() {
		let (mut h, disk) = harness(
			"parallel",
			"rule t\n  command = touch $out\n\
			 build a: t\nbuild b: t\nbuild all: phony a b\n",
		);
		let mut runner = VirtualRunner::new(&disk, 4);
		h.build(&disk, &mut runner, &["all"]).unwrap();
		assert_eq!(runner.max_active, 2);
	}

	#[test]
	fn restat_cancels_downstream_work() {
		let manifest = "rule true\n  command = true\n  restat = 1\n\
			rule cat\n  command = cat $in > $out\n\
			build out1: true in\nbuild out2: cat out1\n";
		let (mut h, disk) = harness("restat", manifest);

		// A previous successful build: out1 and out2 exist with log
		// entries; then the input is touched.
		disk.add_file("out1", "");
		disk.tick();
		disk.add_file("out2", "");
		disk.tick();
		disk.add_file("in", "");
		h.log_entry("out1");
		h.log_entry("out2");

		let mut runner = VirtualRunner::new(&disk, 4);
		h.build(&disk, &mut runner, &["out2"]).unwrap();

		// Only the restat rule ran; it changed nothing, so the cat edge
		// was dropped from the plan.
		assert_eq!(runner.command_strings(), vec!["true"]);

		// The log remembers which input mtime the outputs were clean
		// against.
		let entry = h.build_log.get(RawStr::from_str("out1")).unwrap();
		assert_eq!(
			entry.restat_mtime,
			disk.file_mtime(RawStr::from_str("in"))
		);
	}

	#[test]
	fn depfile_discovers_headers() {
		let manifest = "rule cc\n  command = cc -c $in -o $out\n  deps = gcc\n\
			\x20 depfile = $out.d\nbuild foo.o: cc foo.c\n";
		let (mut h, disk) = harness("depfile", manifest);
		disk.add_file("foo.c", "");
		disk.add_file("blah.h", "");
		disk.add_file("bar.h", "");
		// A depfile from an earlier compile is already on disk.
		disk.add_file("foo.o.d", "foo.o: blah.h bar.h");

		{
			// After scanning, the discovered headers are implicit inputs,
			// in depfile order after the explicit input.
			let foo_o = h.state.node_id(RawStr::from_str("foo.o")).unwrap();
			let mut status = SilentStatus;
			let mut builder = Builder::new(
				&mut h.state,
				&disk,
				&mut h.build_log,
				&mut h.deps_log,
				&mut status,
				BuildConfig::default(),
			);
			assert!(builder.add_target(foo_o).unwrap());
			let inputs: Vec<String> = builder
				.state()
				.edge(EdgeId(0))
				.inputs
				.iter()
				.map(|&i| builder.state().node_path(i).to_string())
				.collect();
			assert_eq!(inputs, vec!["foo.c", "blah.h", "bar.h"]);
		}

		// Run the build; the compile rewrites its depfile, which gets
		// folded into the deps log and deleted.
		let mut runner = VirtualRunner::new(&disk, 4);
		runner.extra_writes.insert(
			"cc -c foo.c -o foo.o".into(),
			vec![("foo.o.d".into(), "foo.o: blah.h bar.h".into())],
		);
		h.state.reset();
		h.build(&disk, &mut runner, &["foo.o"]).unwrap();
		assert_eq!(runner.commands.len(), 1);

		assert!(!disk.has_file(RawStr::from_str("foo.o.d")));
		let info = h.deps_log.get(RawStr::from_str("foo.o")).unwrap();
		assert!(info.deps().eq(&["blah.h", "bar.h"]));
	}

	#[test]
	fn dyndep_discovers_implicit_output() {
		let manifest = "rule touch\n  command = touch $out\n\
			rule copy\n  command = copy $in $out\n\
			build dd: copy dd-src\n\
			build out: touch || dd\n  dyndep = dd\n";
		let (mut h, disk) = harness("dyndep", manifest);
		disk.add_file("dd-src", "");

		let mut runner = VirtualRunner::new(&disk, 4);
		runner.extra_writes.insert(
			"copy dd-src dd".into(),
			vec![(
				"dd".into(),
				"ninja_dyndep_version = 1\nbuild out | out.imp: dyndep\n".into(),
			)],
		);

		h.build(&disk, &mut runner, &["out"]).unwrap();

		// The dyndep file was built first, then loaded, and the touch
		// edge now owns both outputs.
		assert_eq!(
			runner.command_strings(),
			vec!["copy dd-src dd", "touch out"]
		);
		let out_imp = h.state.node_id(RawStr::from_str("out.imp")).unwrap();
		let out = h.state.node_id(RawStr::from_str("out")).unwrap();
		assert_eq!(
			h.state.node(out_imp).in_edge,
			h.state.node(out).in_edge
		);
	}

	#[test]
	fn failing_command_stops_the_build() {
		let (mut h, disk) = harness("failure", CHAIN);
		disk.add_file("in", "");
		let mut runner = VirtualRunner::new(&disk, 4);
		runner.fail.insert("cat in > mid".into());

		match h.build(&disk, &mut runner, &["out"]) {
			Err(BuildError::SubcommandsFailed { failures }) => assert_eq!(failures, 1),
			other => panic!("unexpected result: {:?}", other.map_err(|e| e.to_string())),
		}
		// The downstream command never ran.
		assert_eq!(runner.command_strings(), vec!["cat in > mid"]);
		// No build log entry for a failed command.
		assert!(h.build_log.get(RawStr::from_str("mid")).is_none());
	}

	#[test]
	fn interruption_cleans_touched_outputs() {
		let (mut h, disk) = harness("interrupt", CHAIN);
		disk.add_file("in", "");
		let mut runner = VirtualRunner::new(&disk, 4);
		runner.interrupt.insert("cat in > mid".into());

		match h.build(&disk, &mut runner, &["out"]) {
			Err(BuildError::Interrupted) => {}
			other => panic!("unexpected result: {:?}", other.map_err(|e| e.to_string())),
		}
		// The half-written output was deleted again.
		assert!(!disk.has_file(RawStr::from_str("mid")));
	}

	#[test]
	fn rspfile_lifecycle() {
		let manifest = "rule link\n  command = link @$out.rsp\n  rspfile = $out.rsp\n\
			\x20 rspfile_content = $in\nbuild prog: link a.o b.o\n";
		let (mut h, disk) = harness("rspfile", manifest);
		disk.add_file("a.o", "");
		disk.add_file("b.o", "");

		let mut runner = VirtualRunner::new(&disk, 4);
		h.build(&disk, &mut runner, &["prog"]).unwrap();
		// Written before the command, removed after success.
		assert!(disk.files_created().contains(RawStr::from_str("prog.rsp")));
		assert!(!disk.has_file(RawStr::from_str("prog.rsp")));

		// On failure it stays around for post-mortem.
		let (mut h, disk) = harness("rspfile-fail", manifest);
		disk.add_file("a.o", "");
		disk.add_file("b.o", "");
		let mut runner = VirtualRunner::new(&disk, 4);
		runner.fail.insert("link @prog.rsp".into());
		h.build(&disk, &mut runner, &["prog"]).unwrap_err();
		assert!(disk.has_file(RawStr::from_str("prog.rsp")));
		assert_eq!(
			disk
				.read_file(RawStr::from_str("prog.rsp"))
				.unwrap()
				.unwrap(),
			"a.o b.o"
		);
	}

	#[test]
	fn phony_chain_builds_without_commands() {
		let manifest = "build a: phony\nbuild b: phony a\nbuild top: phony b\n";
		let (mut h, disk) = harness("phony-chain", manifest);
		let mut runner = VirtualRunner::new(&disk, 4);

		h.build(&disk, &mut runner, &["top"]).unwrap();

		// Nothing to execute, but the whole chain is walked to done.
		assert_eq!(runner.command_strings(), Vec::<String>::new());
		let top = h.state.node_id(RawStr::from_str("top")).unwrap();
		let top_edge = h.state.node(top).in_edge.unwrap();
		assert!(h.state.edge(top_edge).outputs_ready);
	}

	#[test]
	fn validations_are_built_alongside() {
		let manifest = "rule t\n  command = touch $out\n\
			build out: t in |@ check\nbuild check: t other\n";
		let (mut h, disk) = harness("validations", manifest);
		disk.add_file("in", "");
		disk.add_file("other", "");

		let mut runner = VirtualRunner::new(&disk, 4);
		h.build(&disk, &mut runner, &["out"]).unwrap();

		let mut commands = runner.command_strings();
		commands.sort();
		assert_eq!(commands, vec!["touch check", "touch out"]);
	}
}
