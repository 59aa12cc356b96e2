//! The build graph: nodes, edges, pools, and the state that owns them.
//!
//! Nodes and edges reference each other in both directions, so they live in
//! arenas inside [`State`] and refer to each other through [`NodeId`] and
//! [`EdgeId`] indices. A `NodeId` is the index into an insertion-ordered
//! map keyed by canonical path, so interning a path and numbering the node
//! are the same operation.

use crate::mtime::FileState;
use indexmap::map::Entry as IndexMapEntry;
use indexmap::IndexMap;
use log::warn;
use raw_string::{RawStr, RawString};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;

/// Handle to a [`Node`] in a [`State`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u32);

/// Handle to an [`Edge`] in a [`State`].
///
/// Edges are numbered in insertion order, which makes the id double as the
/// deterministic tie-breaker for scheduling.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EdgeId(pub u32);

/// Handle to a [`Pool`] in a [`State`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PoolId(pub u32);

/// A path-addressed artifact: a file, a phony target, or a directory
/// stamp.
#[derive(Debug)]
pub struct Node {
	/// Which separators of the canonical path were originally backslashes.
	pub slash_bits: u64,
	/// What we know about the file on disk.
	pub state: FileState,
	/// Computed by the dirty scanner.
	pub dirty: bool,
	/// Set while an edge names this node as its dyndep file and the file
	/// has not been loaded yet.
	pub dyndep_pending: bool,
	/// Set when the node was first seen in a depfile, the deps log, or a
	/// dyndep file rather than in the manifest. Such a node being missing
	/// is not an error (a header may simply have been deleted).
	pub generated_by_dep_loader: bool,
	/// The edge that produces this node, if any.
	pub in_edge: Option<EdgeId>,
	/// The edges that consume this node as a real input.
	pub out_edges: Vec<EdgeId>,
	/// The edges that consume this node only as a validation.
	pub validation_out_edges: Vec<EdgeId>,
}

/// The tri-state mark used by the dirty scanner's DFS to detect cycles.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mark {
	None,
	InStack,
	Done,
}

/// The method of discovering extra dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepStyle {
	/// Through a Makefile-formatted file as specified by `depfile`.
	Gcc,
	/// Through specific messages detected on the standard output.
	Msvc,
}

/// The evaluated bindings of a non-phony edge.
///
/// All variable references were resolved when the manifest was loaded, in
/// the edge's scope (edge-local bindings shadow the rule's templates,
/// which shadow the enclosing file scope).
#[derive(Debug)]
pub struct CommandInfo {
	/// The name of the rule which was used for this edge.
	pub rule_name: String,
	/// The (shell-escaped) command to be executed.
	pub command: RawString,
	/// The description to be shown to the user.
	pub description: RawString,
	/// The file to read the extra dependencies from.
	pub depfile: RawString,
	/// The way extra dependencies are to be discovered.
	pub deps: Option<DepStyle>,
	/// The message to watch for on standard output for extra dependencies.
	pub msvc_deps_prefix: RawString,
	/// Rule is used to re-invoke the generator.
	pub generator: bool,
	/// Re-stat the outputs after running to see if they actually changed.
	pub restat: bool,
	/// A file to write before executing the command.
	pub rspfile: RawString,
	/// The contents of the file to write before executing the command.
	pub rspfile_content: RawString,
}

/// A single build step: one rule invocation producing one or more outputs
/// from inputs.
#[derive(Debug)]
pub struct Edge {
	/// The details of the command to run, or `None` for phony edges.
	pub command: Option<CommandInfo>,
	/// The pool in which the command runs.
	pub pool: PoolId,
	/// All inputs, laid out as `[explicit..][implicit..][order-only..]`.
	pub inputs: Vec<NodeId>,
	/// The number of implicit inputs at the end of the explicit section.
	pub implicit_deps: usize,
	/// The number of order-only inputs at the end of `inputs`.
	pub order_only_deps: usize,
	/// All outputs, laid out as `[explicit..][implicit..]`.
	pub outputs: Vec<NodeId>,
	/// The number of implicit outputs at the end of `outputs`.
	pub implicit_outs: usize,
	/// Nodes that must be built eventually, but do not influence the
	/// readiness of this edge's consumers.
	pub validations: Vec<NodeId>,
	/// The dyndep file which may add inputs and outputs to this edge.
	pub dyndep: Option<NodeId>,
	/// Dirty-scan DFS mark.
	pub mark: Mark,
	/// Set when the outputs are up to date, either because the command ran
	/// successfully or because no work was needed.
	pub outputs_ready: bool,
	/// Ensures discovered dependencies are merged at most once.
	pub deps_loaded: bool,
	/// Set when no usable record of discovered dependencies was found, so
	/// the edge was assumed dirty.
	pub deps_missing: bool,
}

impl Edge {
	/// Whether this edge uses the built-in no-op `phony` rule.
	pub fn is_phony(&self) -> bool {
		self.command.is_none()
	}

	/// The inputs that appear in `$in`.
	pub fn explicit_inputs(&self) -> &[NodeId] {
		&self.inputs[..self.inputs.len() - self.implicit_deps - self.order_only_deps]
	}

	/// The explicit and implicit inputs: everything that can make this
	/// edge dirty.
	pub fn non_order_only_inputs(&self) -> &[NodeId] {
		&self.inputs[..self.inputs.len() - self.order_only_deps]
	}

	/// The order-only inputs.
	pub fn order_only_inputs(&self) -> &[NodeId] {
		&self.inputs[self.inputs.len() - self.order_only_deps..]
	}

	/// Whether `inputs[index]` is an order-only input.
	pub fn is_order_only(&self, index: usize) -> bool {
		index >= self.inputs.len() - self.order_only_deps
	}

	/// The outputs that appear in `$out`.
	pub fn explicit_outputs(&self) -> &[NodeId] {
		&self.outputs[..self.outputs.len() - self.implicit_outs]
	}

	/// Whether the edge has a `restat` binding.
	pub fn restat(&self) -> bool {
		self.command.as_ref().map_or(false, |c| c.restat)
	}

	/// Whether the edge has a `generator` binding.
	pub fn generator(&self) -> bool {
		self.command.as_ref().map_or(false, |c| c.generator)
	}
}

/// A named concurrency quota for edges.
#[derive(Debug)]
pub struct Pool {
	name: String,
	depth: u16,
	current_use: u16,
	delayed: BTreeSet<EdgeId>,
}

impl Pool {
	fn new(name: &str, depth: u16) -> Self {
		Pool {
			name: name.to_string(),
			depth,
			current_use: 0,
			delayed: BTreeSet::new(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// The maximum number of concurrently scheduled edges. `0` means
	/// unlimited.
	pub fn depth(&self) -> u16 {
		self.depth
	}

	pub fn current_use(&self) -> u16 {
		self.current_use
	}

	/// Whether an edge about to be scheduled has to wait for the pool.
	pub fn should_delay_edge(&self) -> bool {
		self.depth != 0 && self.current_use >= self.depth
	}

	/// Account for an edge being scheduled.
	pub fn edge_scheduled(&mut self) {
		if self.depth != 0 {
			self.current_use += 1;
			debug_assert!(self.current_use <= self.depth);
		}
	}

	/// Account for a scheduled edge having finished.
	pub fn edge_finished(&mut self) {
		if self.depth != 0 {
			debug_assert!(self.current_use > 0);
			self.current_use -= 1;
		}
	}

	/// Defer an edge until the pool has capacity again.
	pub fn delay_edge(&mut self, edge: EdgeId) {
		self.delayed.insert(edge);
	}

	/// Forget all scheduling state.
	pub fn reset(&mut self) {
		self.current_use = 0;
		self.delayed.clear();
	}

	/// Move as many delayed edges as the pool now admits into `ready`.
	pub fn retrieve_ready_edges(&mut self, ready: &mut BTreeSet<EdgeId>) {
		while !self.should_delay_edge() {
			let edge = match self.delayed.iter().next() {
				Some(&edge) => edge,
				None => break,
			};
			self.delayed.remove(&edge);
			self.edge_scheduled();
			ready.insert(edge);
		}
	}
}

/// Two edges declared the same output.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DuplicateOutput {
	pub path: RawString,
}

impl fmt::Display for DuplicateOutput {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Multiple rules generate {}", self.path)
	}
}

impl Error for DuplicateOutput {}

/// Everything needed to add an edge to the graph in one go.
pub struct EdgeSpec {
	pub command: Option<CommandInfo>,
	pub pool: PoolId,
	pub inputs: Vec<NodeId>,
	pub implicit_deps: usize,
	pub order_only_deps: usize,
	pub outputs: Vec<NodeId>,
	pub implicit_outs: usize,
	pub validations: Vec<NodeId>,
	pub dyndep: Option<NodeId>,
}

/// The build graph: all nodes, edges, and pools.
pub struct State {
	/// Nodes, keyed by canonical path. The index in this map is the
	/// [`NodeId`].
	nodes: IndexMap<RawString, Node>,
	/// Edges, in declaration order. The index is the [`EdgeId`].
	edges: Vec<Edge>,
	/// Pools, keyed by name. The index is the [`PoolId`].
	pools: IndexMap<String, Pool>,
	/// The targets named by `default` statements.
	pub defaults: Vec<NodeId>,
	/// The directory named by `builddir =`, where the logs live.
	pub build_dir: Option<RawString>,
}

impl State {
	/// The pool edges run in when they name no pool: unlimited.
	pub const DEFAULT_POOL: PoolId = PoolId(0);
	/// The built-in `console` pool, with depth 1.
	pub const CONSOLE_POOL: PoolId = PoolId(1);

	/// Create an empty graph with the two built-in pools.
	///
	/// The built-in pools are per-`State` values, not globals, so separate
	/// `State`s never share scheduling state.
	pub fn new() -> State {
		let mut pools = IndexMap::new();
		pools.insert(String::new(), Pool::new("", 0));
		pools.insert("console".to_string(), Pool::new("console", 1));
		State {
			nodes: IndexMap::new(),
			edges: Vec::new(),
			pools,
			defaults: Vec::new(),
			build_dir: None,
		}
	}

	pub fn node_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn edge_count(&self) -> usize {
		self.edges.len()
	}

	pub fn node(&self, id: NodeId) -> &Node {
		self.nodes.get_index(id.0 as usize).unwrap().1
	}

	pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
		self.nodes.get_index_mut(id.0 as usize).unwrap().1
	}

	/// The canonical path of a node.
	pub fn node_path(&self, id: NodeId) -> &RawStr {
		&self.nodes.get_index(id.0 as usize).unwrap().0[..]
	}

	pub fn edge(&self, id: EdgeId) -> &Edge {
		&self.edges[id.0 as usize]
	}

	pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
		&mut self.edges[id.0 as usize]
	}

	pub fn pool(&self, id: PoolId) -> &Pool {
		self.pools.get_index(id.0 as usize).unwrap().1
	}

	pub fn pool_mut(&mut self, id: PoolId) -> &mut Pool {
		self.pools.get_index_mut(id.0 as usize).unwrap().1
	}

	/// Look up a pool by name.
	pub fn find_pool(&self, name: &str) -> Option<PoolId> {
		self.pools.get_full(name).map(|(i, _, _)| PoolId(i as u32))
	}

	/// Define a new pool. The caller checks for duplicates first.
	pub fn add_pool(&mut self, name: &str, depth: u16) -> PoolId {
		debug_assert!(self.find_pool(name).is_none());
		let (index, _) = self.pools.insert_full(name.to_string(), Pool::new(name, depth));
		PoolId(index as u32)
	}

	/// Look up a node by its canonical path.
	pub fn node_id(&self, path: &RawStr) -> Option<NodeId> {
		self.nodes.get_full(path).map(|(i, _, _)| NodeId(i as u32))
	}

	/// Get or create the node for a canonical path.
	pub fn intern(&mut self, path: RawString, slash_bits: u64) -> NodeId {
		let entry = self.nodes.entry(path);
		let id = NodeId(entry.index() as u32);
		if let IndexMapEntry::Vacant(entry) = entry {
			entry.insert(Node {
				slash_bits,
				state: FileState::Unknown,
				dirty: false,
				dyndep_pending: false,
				generated_by_dep_loader: false,
				in_edge: None,
				out_edges: Vec::new(),
				validation_out_edges: Vec::new(),
			});
		}
		id
	}

	/// Get or create the node for a canonical path discovered by the
	/// dependency or dyndep loaders rather than written in the manifest.
	pub fn intern_discovered(&mut self, path: RawString, slash_bits: u64) -> NodeId {
		let known = self.nodes.len();
		let id = self.intern(path, slash_bits);
		if id.0 as usize >= known {
			self.node_mut(id).generated_by_dep_loader = true;
		}
		id
	}

	/// Add an edge and wire up all node back-references.
	///
	/// A phony edge that names one of its own outputs as an input is
	/// accepted for compatibility; the self-reference is dropped with a
	/// warning.
	pub fn add_edge(&mut self, spec: EdgeSpec) -> Result<EdgeId, DuplicateOutput> {
		let EdgeSpec {
			command,
			pool,
			mut inputs,
			mut implicit_deps,
			mut order_only_deps,
			outputs,
			implicit_outs,
			validations,
			dyndep,
		} = spec;

		for &output in &outputs {
			if self.node(output).in_edge.is_some() {
				return Err(DuplicateOutput {
					path: self.node_path(output).to_owned(),
				});
			}
		}

		if command.is_none() {
			// Tolerate "build x: phony x" constructs.
			let explicit_end = inputs.len() - implicit_deps - order_only_deps;
			let order_only_start = inputs.len() - order_only_deps;
			let mut dropped_implicit = 0;
			let mut dropped_order_only = 0;
			let mut index = 0;
			let nodes = &self.nodes;
			inputs.retain(|input| {
				let keep = !outputs.contains(input);
				if !keep {
					warn!(
						"phony target {} names itself as an input; ignoring",
						nodes.get_index(input.0 as usize).unwrap().0
					);
					if index >= order_only_start {
						dropped_order_only += 1;
					} else if index >= explicit_end {
						dropped_implicit += 1;
					}
				}
				index += 1;
				keep
			});
			implicit_deps -= dropped_implicit;
			order_only_deps -= dropped_order_only;
		}

		let id = EdgeId(self.edges.len() as u32);
		for &input in &inputs {
			self.node_mut(input).out_edges.push(id);
		}
		for &output in &outputs {
			self.node_mut(output).in_edge = Some(id);
		}
		for &validation in &validations {
			self.node_mut(validation).validation_out_edges.push(id);
		}
		if let Some(dyndep) = dyndep {
			self.node_mut(dyndep).dyndep_pending = true;
		}

		self.edges.push(Edge {
			command,
			pool,
			inputs,
			implicit_deps,
			order_only_deps,
			outputs,
			implicit_outs,
			validations,
			dyndep,
			mark: Mark::None,
			outputs_ready: false,
			deps_loaded: false,
			deps_missing: false,
		});
		Ok(id)
	}

	/// Splice discovered dependencies into an edge as implicit inputs,
	/// just before the order-only section. Paths already among the edge's
	/// inputs are skipped. Returns the number of inputs added.
	pub fn add_discovered_deps(&mut self, edge_id: EdgeId, deps: &[NodeId]) -> usize {
		let insert_at = {
			let edge = self.edge(edge_id);
			edge.inputs.len() - edge.order_only_deps
		};
		let mut added = 0;
		for &dep in deps {
			if self.edge(edge_id).inputs.contains(&dep) {
				continue;
			}
			self.edge_mut(edge_id).inputs.insert(insert_at + added, dep);
			self.node_mut(dep).out_edges.push(edge_id);
			added += 1;
		}
		let edge = self.edge_mut(edge_id);
		edge.implicit_deps += added;
		added
	}

	/// Add an implicit output discovered through a dyndep file.
	pub fn add_implicit_output(
		&mut self,
		edge_id: EdgeId,
		output: NodeId,
	) -> Result<(), DuplicateOutput> {
		if let Some(other) = self.node(output).in_edge {
			if other != edge_id {
				return Err(DuplicateOutput {
					path: self.node_path(output).to_owned(),
				});
			}
			return Ok(());
		}
		self.node_mut(output).in_edge = Some(edge_id);
		let edge = self.edge_mut(edge_id);
		edge.outputs.push(output);
		edge.implicit_outs += 1;
		Ok(())
	}

	/// The nodes no edge consumes: the default build targets when the
	/// manifest declares none.
	pub fn root_nodes(&self) -> Vec<NodeId> {
		(0..self.nodes.len() as u32)
			.map(NodeId)
			.filter(|&id| {
				let node = self.node(id);
				node.in_edge.is_some() && node.out_edges.is_empty()
			})
			.collect()
	}

	/// Clear all dirty-scan and plan state, keeping the graph shape.
	pub fn reset(&mut self) {
		for (_, node) in self.nodes.iter_mut() {
			node.state = FileState::Unknown;
			node.dirty = false;
		}
		for edge in &mut self.edges {
			edge.mark = Mark::None;
			edge.outputs_ready = false;
			edge.deps_loaded = false;
			edge.deps_missing = false;
		}
	}
}
