mod logger;
mod runner;
mod status;

use log::error;
use raw_string::unix::RawStrExt;
use raw_string::RawStr;
use shuriken::build::{BuildConfig, Builder, CommandRunner};
use shuriken::buildlog::BuildLogMut;
use shuriken::deplog::DepsLogMut;
use shuriken::disk::RealDisk;
use shuriken::graph::{NodeId, State};
use shuriken::manifest;
use shuriken::path::canonicalize_path;
use std::path::PathBuf;
use std::process::exit;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(
	name = "shuriken",
	about = "A build executor compatible with the ninja build system."
)]
struct Options {
	/// The build specification to use.
	#[structopt(
		short = "f",
		long = "file",
		default_value = "build.ninja",
		parse(from_os_str)
	)]
	file: PathBuf,

	/// Change to this directory before doing anything else.
	#[structopt(short = "C", parse(from_os_str))]
	directory: Option<PathBuf>,

	/// Run this many jobs in parallel.
	#[structopt(short = "j")]
	jobs: Option<usize>,

	/// Keep going until this many jobs fail. 0 means keep going forever.
	#[structopt(short = "k", default_value = "1")]
	keep_going: usize,

	/// Dry run: don't run the commands, pretend they all succeed.
	#[structopt(short = "n")]
	dry_run: bool,

	/// Show all command lines while building, and enable debug messages.
	#[structopt(short = "v")]
	verbose: bool,

	/// The targets to build. Defaults to the manifest's default targets.
	targets: Vec<String>,
}

fn main() {
	let options = Options::from_args();
	logger::init(options.verbose);
	match run(&options) {
		Ok(()) => {}
		Err(e) => {
			error!("{}", e);
			exit(1);
		}
	}
}

fn run(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
	if let Some(directory) = &options.directory {
		std::env::set_current_dir(directory)
			.map_err(|e| format!("Unable to enter {:?}: {}", directory, e))?;
	}

	let mut state = manifest::load(&options.file)?;

	// The logs live in the build directory, when the manifest names one.
	let log_dir = match &state.build_dir {
		Some(dir) => {
			std::fs::create_dir_all(dir.as_path())?;
			PathBuf::from(dir.as_path())
		}
		None => PathBuf::new(),
	};
	let mut build_log = BuildLogMut::open(log_dir.join(".ninja_log"))?;
	let mut deps_log = DepsLogMut::open(log_dir.join(".ninja_deps"))?;

	let targets = resolve_targets(&state, &options.targets)?;

	let config = BuildConfig {
		failures_allowed: match options.keep_going {
			0 => usize::max_value(),
			n => n,
		},
		dry_run: options.dry_run,
	};

	let mut status = status::ConsoleStatus::new(options.verbose);
	let result = {
		let mut builder = Builder::new(
			&mut state,
			&RealDisk,
			&mut build_log,
			&mut deps_log,
			&mut status,
			config,
		);

		let mut any_work = false;
		for target in targets {
			any_work |= builder.add_target(target)?;
		}

		if !any_work || !builder.has_work() {
			println!("shuriken: no work to do.");
			Ok(())
		} else if options.dry_run {
			let mut runner = runner::DryRunner::new();
			builder.build(&mut runner)
		} else {
			let jobs = options.jobs.unwrap_or_else(default_parallelism);
			let mut runner = runner::ParallelRunner::new(jobs);
			let result = builder.build(&mut runner);
			if result.is_err() {
				// Kill whatever is still running before reporting.
				runner.abort();
				while runner.wait_for_command().is_some() {}
			}
			result
		}
	};

	// Log maintenance happens after the build, so a failed build still
	// keeps everything it learned.
	build_log.flush()?;
	deps_log.flush()?;
	if build_log.needs_recompact() {
		build_log.recompact()?;
	}
	if deps_log.needs_recompact() {
		deps_log.recompact()?;
	}

	result.map_err(|e| e.into())
}

/// Turn the command-line target names into graph nodes.
///
/// With no names given, the manifest's `default` targets are built; a
/// manifest without `default` statements builds all root nodes.
fn resolve_targets(
	state: &State,
	names: &[String],
) -> Result<Vec<NodeId>, Box<dyn std::error::Error>> {
	if names.is_empty() {
		let defaults = if state.defaults.is_empty() {
			state.root_nodes()
		} else {
			state.defaults.clone()
		};
		if defaults.is_empty() {
			return Err("no targets to build".into());
		}
		return Ok(defaults);
	}

	let mut targets = Vec::with_capacity(names.len());
	for name in names {
		let (path, _) = canonicalize_path(RawStr::from_str(name))
			.map_err(|e| format!("{:?}: {}", name, e))?;
		match state.node_id(&path) {
			Some(node) => targets.push(node),
			None => return Err(format!("unknown target {:?}", name).into()),
		}
	}
	Ok(targets)
}

fn default_parallelism() -> usize {
	std::thread::available_parallelism()
		.map(|n| n.get() + 2)
		.unwrap_or(3)
}
