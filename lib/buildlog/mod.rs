//! Reading and writing build logs (i.e. `.ninja_log` files).
//!
//! The build log remembers, for every output, the hash of the command that
//! produced it and when it ran. The dirty scanner uses it to catch changes
//! that file timestamps alone cannot reveal: an edited command line, or an
//! output that was written by something other than the recorded command.
//!
//! The format is line-oriented text. Lines that fail to parse are skipped
//! with a warning, so a partially written last line (say, after a crash)
//! never invalidates the rest of the log.

use crate::mtime::Timestamp;
use log::warn;
use raw_string::{RawStr, RawString};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Error, ErrorKind, Read, Seek, SeekFrom, Write};
use std::iter::FromIterator;
use std::path::{Path, PathBuf};

mod murmurhash;

pub use self::murmurhash::murmur_hash_64a;

const HEADER: &[u8] = b"# ninja log v5\n";

/// Entry counts that trigger recompaction: more than this many lines on
/// disk, and more than three times the number of live entries.
const RECOMPACT_MIN_LINES: u64 = 1000;
const RECOMPACT_FACTOR: u64 = 3;

/// The latest entries for all targets in the build log.
#[derive(Clone, Debug)]
pub struct BuildLog {
	pub entries: BTreeMap<RawString, Entry>,
	/// Number of entry lines in the on-disk file, dead ones included.
	lines: u64,
}

/// An entry in the build log for a specific target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Entry {
	/// When the command started, in milliseconds since the start of its
	/// build.
	pub start_time_ms: u32,
	/// When the command ended, in milliseconds since the start of its
	/// build.
	pub end_time_ms: u32,
	/// For restat rules: the mtime of the newest input at the time the
	/// outputs were found unchanged.
	pub restat_mtime: Option<Timestamp>,
	/// Hash of the evaluated command line.
	pub command_hash: u64,
}

/// Hash a command line the way the build log stores it.
///
/// For rules using a response file, the file's contents take part in the
/// hash, so editing only the rspfile content also triggers a rebuild.
pub fn hash_command(command: &RawStr, rspfile_content: &RawStr) -> u64 {
	if rspfile_content.is_empty() {
		murmur_hash_64a(command.as_bytes())
	} else {
		let mut buf = command.to_owned();
		buf.push_str(";rspfile=");
		buf.push_str(rspfile_content);
		murmur_hash_64a(buf.as_bytes())
	}
}

impl BuildLog {
	/// Create an empty build log.
	pub fn new() -> BuildLog {
		BuildLog {
			entries: BTreeMap::new(),
			lines: 0,
		}
	}

	/// Look up the entry for an output path.
	pub fn get(&self, output: &RawStr) -> Option<&Entry> {
		self.entries.get(output)
	}

	/// Whether the file carries enough dead lines to be worth rewriting.
	pub fn needs_recompact(&self) -> bool {
		self.lines > RECOMPACT_MIN_LINES
			&& self.lines > self.entries.len() as u64 * RECOMPACT_FACTOR
	}

	/// Read a build log from a file.
	pub fn load(file: impl AsRef<Path>) -> Result<BuildLog, Error> {
		let mut bytes = Vec::new();
		File::open(file.as_ref())
			.and_then(|mut f| f.read_to_end(&mut bytes))
			.map_err(|e| {
				Error::new(
					e.kind(),
					format!("Unable to read {:?}: {}", file.as_ref(), e),
				)
			})?;
		BuildLog::parse(&bytes).ok_or_else(|| {
			Error::new(ErrorKind::InvalidData, "Not a ninja build log file")
		})
	}

	/// Parse a build log. Returns `None` if the header is unusable.
	fn parse(bytes: &[u8]) -> Option<BuildLog> {
		let mut log = BuildLog::new();
		let mut lines = bytes.split(|&b| b == b'\n');

		let header = RawStr::from_bytes(lines.next()?);
		if !header.starts_with("# ninja log v") {
			return None;
		}
		let version: u32 = parse_field(&header[13..])?;
		if version != 4 && version != 5 {
			return None;
		}

		for line in lines {
			let mut line = RawStr::from_bytes(line);
			if line.last() == Some(b'\r') {
				line = &line[..line.len() - 1];
			}
			if line.is_empty() {
				continue;
			}
			log.lines += 1;
			match parse_entry(line, version) {
				Some((output, entry)) => {
					log.entries.insert(output, entry);
				}
				None => warn!("build log: skipping malformed line: {:?}", line),
			}
		}

		Some(log)
	}
}

fn parse_entry(line: &RawStr, version: u32) -> Option<(RawString, Entry)> {
	let mut tab_iter = memchr::memchr_iter(b'\t', line.as_bytes());

	let tab1 = tab_iter.next()?;
	let tab2 = tab_iter.next()?;
	let tab3 = tab_iter.next()?;
	let tab4 = tab_iter.next()?;

	let output = line[tab3 + 1..tab4].into();
	let entry = Entry {
		start_time_ms: parse_field(&line[0..tab1])?,
		end_time_ms: parse_field(&line[tab1 + 1..tab2])?,
		restat_mtime: Timestamp::from_nanos(parse_field(&line[tab2 + 1..tab3])?),
		command_hash: if version < 5 {
			murmur_hash_64a(line[tab4 + 1..].as_bytes())
		} else {
			parse_hex(&line[tab4 + 1..])?
		},
	};
	Some((output, entry))
}

fn parse_field<T: std::str::FromStr>(s: &RawStr) -> Option<T> {
	s.to_str().ok().and_then(|s| s.parse().ok())
}

fn parse_hex(s: &RawStr) -> Option<u64> {
	s.to_str()
		.ok()
		.and_then(|s| u64::from_str_radix(s, 16).ok())
}

fn write_entry(file: &mut impl Write, output: &RawStr, entry: &Entry) -> Result<(), Error> {
	writeln!(
		file,
		"{}\t{}\t{}\t{}\t{:x}",
		entry.start_time_ms,
		entry.end_time_ms,
		entry.restat_mtime.map_or(0, Timestamp::to_nanos),
		output,
		entry.command_hash
	)
}

/// A build log opened for appending.
#[derive(Debug)]
pub struct BuildLogMut {
	log: BuildLog,
	file: BufWriter<File>,
	path: PathBuf,
}

impl BuildLogMut {
	/// Open and read a build log, or start a new one.
	///
	/// A file that is not a build log at all is started over with a
	/// warning.
	pub fn open(path: impl AsRef<Path>) -> Result<BuildLogMut, Error> {
		let path = path.as_ref().to_path_buf();
		let mut file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(&path)?;

		let mut bytes = Vec::new();
		file.read_to_end(&mut bytes)?;

		if bytes.is_empty() {
			let mut file = BufWriter::new(file);
			file.write_all(HEADER)?;
			return Ok(BuildLogMut {
				log: BuildLog::new(),
				file,
				path,
			});
		}

		match BuildLog::parse(&bytes) {
			Some(log) => {
				file.seek(SeekFrom::End(0))?;
				Ok(BuildLogMut {
					log,
					file: BufWriter::new(file),
					path,
				})
			}
			None => {
				warn!("{:?} is not a build log; starting over", path);
				file.set_len(0)?;
				file.seek(SeekFrom::Start(0))?;
				let mut file = BufWriter::new(file);
				file.write_all(HEADER)?;
				Ok(BuildLogMut {
					log: BuildLog::new(),
					file,
					path,
				})
			}
		}
	}

	/// Record an entry for an output, appending it to the file.
	pub fn record_command(
		&mut self,
		output: RawString,
		entry: Entry,
	) -> Result<(), Error> {
		write_entry(&mut self.file, &output, &entry)?;
		self.log.lines += 1;
		self.log.entries.insert(output, entry);
		Ok(())
	}

	/// Rewrite the log keeping only the latest entry per output, through a
	/// temporary file that is atomically renamed over the old one.
	pub fn recompact(&mut self) -> Result<(), Error> {
		let tmp_path = {
			let mut p = self.path.clone().into_os_string();
			p.push(".tmp");
			PathBuf::from(p)
		};

		let mut file = BufWriter::new(File::create(&tmp_path)?);
		file.write_all(HEADER)?;

		// Write entries in order of finishing time, oldest last, matching
		// what a sequence of appends would have produced.
		let mut entries = Vec::from_iter(&self.log.entries);
		entries.sort_by_key(|(_, entry)| entry.end_time_ms);
		for (output, entry) in entries.iter().rev() {
			write_entry(&mut file, output, entry)?;
		}
		let file = file
			.into_inner()
			.map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))?;
		std::fs::rename(&tmp_path, &self.path)?;

		self.log.lines = self.log.entries.len() as u64;
		self.file = BufWriter::new(file);
		self.file.seek(SeekFrom::End(0))?;
		Ok(())
	}

	/// Flush buffered entries to disk.
	pub fn flush(&mut self) -> Result<(), Error> {
		self.file.flush()
	}
}

impl std::ops::Deref for BuildLogMut {
	type Target = BuildLog;
	fn deref(&self) -> &Self::Target {
		&self.log
	}
}
