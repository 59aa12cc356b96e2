//! Command runners: the things that actually execute edges.
//!
//! [`ParallelRunner`] spawns one thread per live job; each thread runs
//! the command through `sh -c`, captures its output, and sends a
//! [`CommandResult`] back over a channel. The core blocks on that channel
//! in `wait_for_command`, which keeps all graph and log mutation on one
//! thread.

mod subprocess;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use raw_string::RawString;
use shuriken::build::{CommandResult, CommandRunner, ExitStatus};
use shuriken::graph::{EdgeId, State};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::os::unix::process::ExitStatusExt;
use std::process;
use std::sync::{Arc, Mutex};
use std::thread;

/// Runs commands as subprocesses, several at a time.
pub struct ParallelRunner {
	capacity: usize,
	active: BTreeSet<EdgeId>,
	/// Pids of running children, so `abort` can signal them.
	pids: Arc<Mutex<BTreeMap<u32, i32>>>,
	sender: Sender<CommandResult>,
	receiver: Receiver<CommandResult>,
	aborted: bool,
}

impl ParallelRunner {
	pub fn new(capacity: usize) -> Self {
		let (sender, receiver) = unbounded();
		ParallelRunner {
			capacity: capacity.max(1),
			active: BTreeSet::new(),
			pids: Arc::new(Mutex::new(BTreeMap::new())),
			sender,
			receiver,
			aborted: false,
		}
	}
}

impl CommandRunner for ParallelRunner {
	fn can_run_more(&self) -> bool {
		!self.aborted && self.active.len() < self.capacity
	}

	fn start_command(&mut self, state: &State, edge: EdgeId) -> bool {
		let command = state.edge(edge).command.as_ref().unwrap().command.clone();
		let sender = self.sender.clone();
		let pids = self.pids.clone();

		self.active.insert(edge);
		thread::spawn(move || {
			sender.send(run_one(edge, command, &pids)).ok();
		});
		true
	}

	fn wait_for_command(&mut self) -> Option<CommandResult> {
		if self.active.is_empty() {
			return None;
		}
		let result = self.receiver.recv().ok()?;
		self.active.remove(&result.edge);
		Some(result)
	}

	fn active_edges(&self) -> Vec<EdgeId> {
		self.active.iter().copied().collect()
	}

	fn abort(&mut self) {
		self.aborted = true;
		for (_, &pid) in self.pids.lock().unwrap().iter() {
			kill(Pid::from_raw(pid), Signal::SIGINT).ok();
		}
	}
}

fn run_one(edge: EdgeId, command: RawString, pids: &Mutex<BTreeMap<u32, i32>>) -> CommandResult {
	debug!("running: {}", command);
	let child = match subprocess::spawn_shell(&command) {
		Ok(child) => child,
		Err(e) => {
			error!("unable to spawn sh: {}", e);
			return CommandResult {
				edge,
				status: ExitStatus::Failure,
				output: format!("unable to spawn sh: {}\n", e).into(),
			};
		}
	};

	pids.lock().unwrap().insert(edge.0, child.id() as i32);
	let finished = subprocess::finish_shell(child);
	pids.lock().unwrap().remove(&edge.0);

	match finished {
		Ok((status, output)) => CommandResult {
			edge,
			status: classify_exit(status),
			output,
		},
		Err(e) => CommandResult {
			edge,
			status: ExitStatus::Failure,
			output: format!("unable to read subprocess output: {}\n", e).into(),
		},
	}
}

fn classify_exit(status: process::ExitStatus) -> ExitStatus {
	match status.code() {
		Some(0) => ExitStatus::Success,
		Some(_) => ExitStatus::Failure,
		None => match status.signal() {
			Some(sig)
				if sig == Signal::SIGINT as i32
					|| sig == Signal::SIGTERM as i32
					|| sig == Signal::SIGHUP as i32 =>
			{
				ExitStatus::Interrupted
			}
			_ => ExitStatus::Failure,
		},
	}
}

/// A runner for dry runs: pretends every command succeeded instantly.
pub struct DryRunner {
	queue: VecDeque<EdgeId>,
}

impl DryRunner {
	pub fn new() -> Self {
		DryRunner {
			queue: VecDeque::new(),
		}
	}
}

impl CommandRunner for DryRunner {
	fn can_run_more(&self) -> bool {
		true
	}

	fn start_command(&mut self, _: &State, edge: EdgeId) -> bool {
		self.queue.push_back(edge);
		true
	}

	fn wait_for_command(&mut self) -> Option<CommandResult> {
		self.queue.pop_front().map(|edge| CommandResult {
			edge,
			status: ExitStatus::Success,
			output: RawString::new(),
		})
	}

	fn active_edges(&self) -> Vec<EdgeId> {
		self.queue.iter().copied().collect()
	}

	fn abort(&mut self) {
		self.queue.clear();
	}
}
