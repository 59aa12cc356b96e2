use raw_string::RawStr;
use shuriken::build::StatusListener;
use shuriken::graph::{EdgeId, State};
use std::io::{self, Write};

/// Prints one `[n/total] description` line per started command, and the
/// captured output of commands that said something or failed.
pub struct ConsoleStatus {
	verbose: bool,
	total: usize,
	started: usize,
}

impl ConsoleStatus {
	pub fn new(verbose: bool) -> Self {
		ConsoleStatus {
			verbose,
			total: 0,
			started: 0,
		}
	}

	fn print_line(&self, line: &str) {
		if self.verbose {
			println!("{}", line);
			return;
		}
		// Keep progress lines within the terminal width, so they don't
		// wrap and push earlier output away.
		match term_size::dimensions() {
			Some((width, _)) if line.chars().count() > width => {
				let truncated: String = line.chars().take(width).collect();
				println!("{}", truncated);
			}
			_ => println!("{}", line),
		}
	}
}

impl StatusListener for ConsoleStatus {
	fn build_started(&mut self, total_commands: usize) {
		self.total = total_commands;
	}

	fn edge_started(&mut self, state: &State, edge: EdgeId) {
		self.started += 1;
		let command = state.edge(edge).command.as_ref().unwrap();
		let what = if !self.verbose && !command.description.is_empty() {
			&command.description
		} else {
			&command.command
		};
		self.print_line(&format!("[{}/{}] {}", self.started, self.total, what));
	}

	fn edge_finished(&mut self, state: &State, edge: EdgeId, success: bool, output: &RawStr) {
		if !success {
			let command = state.edge(edge).command.as_ref().unwrap();
			println!("FAILED: {}", command.command);
		}
		if !output.is_empty() {
			io::stdout().write_all(output.as_bytes()).ok();
		}
	}
}
