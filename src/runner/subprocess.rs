//! Spawning `sh` and collecting what it printed.

use raw_string::unix::RawStrExt;
use raw_string::{RawStr, RawString};
use std::io::{Error, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

/// Start `sh -c <command>` with both output streams captured and stdin
/// closed.
pub fn spawn_shell(command: &RawStr) -> Result<Child, Error> {
	Command::new("sh")
		.arg("-c")
		.arg(command.as_osstr())
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.spawn()
}

/// Wait for a child started by [`spawn_shell`] to exit, and collect its
/// output.
///
/// Stderr is drained on a helper thread while stdout is read here, so a
/// command that fills both pipes cannot stall against us. The two streams
/// are returned concatenated, stdout first; a command that needs its
/// interleaving preserved on the terminal belongs in the console pool.
pub fn finish_shell(mut child: Child) -> Result<(ExitStatus, RawString), Error> {
	let stderr_reader = child.stderr.take().map(|mut stderr| {
		thread::spawn(move || {
			let mut buf = Vec::new();
			stderr.read_to_end(&mut buf).ok();
			buf
		})
	});

	let mut output = Vec::new();
	if let Some(stdout) = child.stdout.as_mut() {
		stdout.read_to_end(&mut output)?;
	}
	if let Some(reader) = stderr_reader {
		if let Ok(stderr) = reader.join() {
			output.extend_from_slice(&stderr);
		}
	}

	let status = child.wait()?;
	Ok((status, RawString::from_bytes(output)))
}
