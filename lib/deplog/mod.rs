//! Reading and writing dependency logs (i.e. `.ninja_deps` files).
//!
//! The dependency log is an append-only binary file holding, for every
//! output, the dependencies its command discovered the last time it ran.
//! Paths are interned: a *path record* assigns the next free id to a path,
//! and a *deps record* refers to paths by id. Rewriting a target's
//! dependencies appends a fresh deps record; the old one becomes dead
//! weight until [`DepsLogMut::recompact`] rewrites the file.
//!
//! A truncated or corrupt tail does not lose the log: loading stops at the
//! first bad record with a warning, and opening the log for writing cuts
//! the file back to the valid prefix.

use crate::mtime::Timestamp;
use byteorder::{ByteOrder, WriteBytesExt, LE};
use indexmap::map::Entry as IndexMapEntry;
use indexmap::map::IndexMap;
use log::warn;
use raw_string::{RawStr, RawString};
use std::fs::File;
use std::io::{BufWriter, Error, ErrorKind, Read, Seek, SeekFrom, Write};
use std::mem::replace;
use std::path::{Path, PathBuf};

const HEADER: &[u8] = b"# ninjadeps\n";
const VERSION: u32 = 4;

/// Records larger than this are treated as corruption.
pub const MAX_RECORD_SIZE: u32 = 1 << 19;

/// On-disk sizes that trigger recompaction: the file must exceed both this
/// many bytes and three times the live data.
const RECOMPACT_MIN_SIZE: u64 = 1 << 20;
const RECOMPACT_FACTOR: u64 = 3;

/// Represents the contents of a `.ninja_deps` file.
#[derive(Clone, Debug)]
pub struct DepsLog {
	records: IndexMap<RawString, Option<Record>>,
	/// Size of the valid on-disk data, in bytes.
	file_size: u64,
	/// Bytes of records that were superseded by later ones.
	dead_bytes: u64,
}

/// Represents a `.ninja_deps` file opened for appending.
#[derive(Debug)]
pub struct DepsLogMut {
	deps: DepsLog,
	file: BufWriter<File>,
	path: PathBuf,
}

/// The information stored in a [`DepsLog`] for a specific target.
#[derive(Clone, Copy, Debug)]
pub struct TargetInfo<'a> {
	record: &'a Record,
	log: &'a DepsLog,
}

#[derive(Clone, Debug)]
struct Record {
	deps: Vec<u32>,
	mtime: Option<Timestamp>,
	/// The size of this record on disk, for dead-data accounting.
	bytes: u64,
}

/// How loading a log ended.
enum Validity {
	Valid,
	/// The file is not a deps log at all (or has an unsupported version).
	BadHeader,
	/// Corruption was found; everything from this offset on is invalid.
	Truncated(u64),
}

impl DepsLog {
	/// Create a new empty log.
	pub fn new() -> Self {
		DepsLog {
			records: IndexMap::new(),
			file_size: (HEADER.len() + 4) as u64,
			dead_bytes: 0,
		}
	}

	fn path_by_id(&self, id: u32) -> Option<&RawStr> {
		self.records.get_index(id as usize).map(|(k, _)| &k[..])
	}

	/// Look up a target in the log.
	pub fn get(&self, path: &RawStr) -> Option<TargetInfo> {
		self.records.get(path).and_then(|v| {
			v.as_ref().map(|r| TargetInfo {
				record: r,
				log: self,
			})
		})
	}

	/// Iterate over all targets in the log.
	pub fn iter(&self) -> impl Iterator<Item = (&RawStr, TargetInfo)> {
		let log = self;
		self.records.iter().flat_map(move |(k, v)| {
			v.as_ref()
				.map(move |v| (&k[..], TargetInfo { record: v, log }))
		})
	}

	/// Build up a log in memory, without a backing file. Tests only.
	#[cfg(test)]
	pub(crate) fn insert_record(
		&mut self,
		target: RawString,
		mtime: Option<Timestamp>,
		deps: Vec<RawString>,
	) {
		let mut ids = Vec::with_capacity(deps.len());
		for dep in deps {
			let entry = self.records.entry(dep);
			ids.push(entry.index() as u32);
			entry.or_insert(None);
		}
		let entry = self.records.entry(target);
		let index = entry.index();
		entry.or_insert(None);
		*self.records.get_index_mut(index).unwrap().1 = Some(Record {
			deps: ids,
			mtime,
			bytes: 0,
		});
	}

	/// Whether the file carries enough dead data to be worth rewriting.
	pub fn needs_recompact(&self) -> bool {
		let live = self.file_size - self.dead_bytes;
		self.file_size > RECOMPACT_MIN_SIZE && self.file_size > live * RECOMPACT_FACTOR
	}

	/// Read a log from a file.
	///
	/// A corrupt tail is dropped with a warning; the on-disk file is not
	/// modified. Open the log with [`DepsLogMut::open`] to also repair the
	/// file.
	pub fn load(file: impl AsRef<Path>) -> Result<DepsLog, Error> {
		let mut bytes = Vec::new();
		File::open(file.as_ref())
			.and_then(|mut f| f.read_to_end(&mut bytes))
			.map_err(|e| {
				Error::new(
					e.kind(),
					format!("Unable to read {:?}: {}", file.as_ref(), e),
				)
			})?;
		let (log, validity) = DepsLog::parse(&bytes);
		match validity {
			Validity::BadHeader => Err(Error::new(
				ErrorKind::InvalidData,
				"Not a ninja deps log file",
			)),
			_ => Ok(log),
		}
	}

	/// Parse a log, stopping at the first corrupt record.
	fn parse(bytes: &[u8]) -> (DepsLog, Validity) {
		let mut log = DepsLog::new();

		if bytes.len() < HEADER.len() + 4 || &bytes[..HEADER.len()] != HEADER {
			return (log, Validity::BadHeader);
		}
		let version = LE::read_u32(&bytes[HEADER.len()..]);
		if version != 3 && version != 4 {
			return (log, Validity::BadHeader);
		}

		let mut pos = HEADER.len() + 4;
		let corrupt = loop {
			if pos == bytes.len() {
				break None;
			}
			if bytes.len() - pos < 4 {
				break Some("truncated record");
			}
			let record_start = pos;
			let head = LE::read_u32(&bytes[pos..]);
			pos += 4;

			if head & 0x8000_0000 == 0 {
				// Path record.
				let size = head;
				if size % 4 != 0 || size < 4 || size > MAX_RECORD_SIZE {
					break Some("invalid path record size");
				}
				if bytes.len() - pos < size as usize {
					break Some("truncated path record");
				}
				let mut name = &bytes[pos..pos + size as usize - 4];
				while name.last() == Some(&0u8) {
					// Remove padding.
					name = &name[..name.len() - 1];
				}
				pos += size as usize - 4;

				let id = log.records.len() as u32;
				let checksum = LE::read_u32(&bytes[pos..]);
				pos += 4;
				if checksum != !id {
					break Some("path record checksum mismatch");
				}
				if log
					.records
					.insert(RawString::from_bytes(name.to_vec()), None)
					.is_some()
				{
					break Some("duplicate path record");
				}
			} else {
				// Deps record.
				let size = head & 0x7FFF_FFFF;
				if size > MAX_RECORD_SIZE {
					break Some("oversized dependencies record");
				}
				let min = if version < 4 { 8 } else { 12 };
				if size % 4 != 0 || size < min {
					break Some("invalid dependencies record size");
				}
				if bytes.len() - pos < size as usize {
					break Some("truncated dependencies record");
				}
				let n_deps = (size / 4) as usize - if version < 4 { 2 } else { 3 };

				let id = LE::read_u32(&bytes[pos..]) as usize;
				pos += 4;
				let mtime = if version < 4 {
					let secs = u64::from(LE::read_u32(&bytes[pos..]));
					pos += 4;
					secs * 1_000_000_000 + 999_999_999
				} else {
					let ns = LE::read_u64(&bytes[pos..]);
					pos += 8;
					ns
				};

				let n_records = log.records.len();
				if id >= n_records {
					break Some("dependencies record for undefined path id");
				}

				let mut deps = Vec::with_capacity(n_deps);
				let mut bad_dep = false;
				for _ in 0..n_deps {
					let dep = LE::read_u32(&bytes[pos..]);
					pos += 4;
					if dep as usize >= n_records {
						bad_dep = true;
						break;
					}
					deps.push(dep);
				}
				if bad_dep {
					break Some("undefined path id in dependency");
				}

				let record = log.records.get_index_mut(id).unwrap().1;
				if let Some(old) = record.take() {
					log.dead_bytes += old.bytes;
				}
				*record = Some(Record {
					deps,
					mtime: Timestamp::from_nanos(mtime),
					bytes: 4 + u64::from(size),
				});
			}
			log.file_size = pos as u64;
			debug_assert_eq!(log.file_size, record_start as u64 + 4 + (head & 0x7FFF_FFFF) as u64);
		};

		match corrupt {
			None => (log, Validity::Valid),
			Some(reason) => {
				warn!(
					"deps log corrupt ({}); discarding {} trailing bytes",
					reason,
					bytes.len() as u64 - log.file_size
				);
				let at = log.file_size;
				(log, Validity::Truncated(at))
			}
		}
	}
}

impl<'a> TargetInfo<'a> {
	/// Get the `mtime` that was recorded in the log.
	pub fn mtime(&self) -> Option<Timestamp> {
		self.record.mtime
	}

	/// Get an iterator over the dependency paths.
	pub fn deps(&self) -> impl Iterator<Item = &'a RawStr> + ExactSizeIterator {
		let log = self.log;
		self.record
			.deps
			.iter()
			.map(move |&i| log.path_by_id(i).unwrap())
	}
}

impl DepsLogMut {
	/// Open and read a dependency log, or start a new one.
	///
	/// If the header is invalid the file is started over; if a corrupt
	/// tail is found the file is truncated back to its valid prefix. Both
	/// repairs are reported through a warning.
	pub fn open(path: impl AsRef<Path>) -> Result<DepsLogMut, Error> {
		let path = path.as_ref().to_path_buf();
		let mut file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(&path)?;

		let mut bytes = Vec::new();
		file.read_to_end(&mut bytes)?;

		if bytes.is_empty() {
			let mut log = DepsLogMut {
				deps: DepsLog::new(),
				file: BufWriter::new(file),
				path,
			};
			log.write_header()?;
			return Ok(log);
		}

		let (deps, validity) = DepsLog::parse(&bytes);
		match validity {
			Validity::BadHeader => {
				warn!("{:?} is not a deps log; starting over", path);
				file.set_len(0)?;
				file.seek(SeekFrom::Start(0))?;
				let mut log = DepsLogMut {
					deps: DepsLog::new(),
					file: BufWriter::new(file),
					path,
				};
				log.write_header()?;
				Ok(log)
			}
			Validity::Truncated(at) => {
				file.set_len(at)?;
				file.seek(SeekFrom::Start(at))?;
				Ok(DepsLogMut {
					deps,
					file: BufWriter::new(file),
					path,
				})
			}
			Validity::Valid => {
				file.seek(SeekFrom::End(0))?;
				Ok(DepsLogMut {
					deps,
					file: BufWriter::new(file),
					path,
				})
			}
		}
	}

	/// Create a fresh log file, truncating anything already there.
	fn create(path: impl AsRef<Path>) -> Result<DepsLogMut, Error> {
		let file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(path.as_ref())?;
		let mut log = DepsLogMut {
			deps: DepsLog::new(),
			file: BufWriter::new(file),
			path: path.as_ref().to_path_buf(),
		};
		log.write_header()?;
		Ok(log)
	}

	fn write_header(&mut self) -> Result<(), Error> {
		self.file.write_all(HEADER)?;
		self.file.write_u32::<LE>(VERSION)?;
		Ok(())
	}

	/// Writes a path to the file, if it wasn't already in there.
	///
	/// In both cases, it returns the id of the path.
	fn insert_path(&mut self, path: RawString) -> Result<u32, Error> {
		let entry = self.deps.records.entry(path);
		let id = entry.index() as u32;
		if let IndexMapEntry::Vacant(entry) = entry {
			let padding = (4 - entry.key().len() % 4) % 4;
			let size = entry.key().len() as u32 + padding as u32 + 4;
			self.file.write_u32::<LE>(size)?;
			self.file.write_all(entry.key().as_bytes())?;
			self.file.write_all(&b"\0\0\0"[..padding])?;
			self.file.write_u32::<LE>(!id)?;
			entry.insert(None);
			self.deps.file_size += 4 + u64::from(size);
		}
		Ok(id)
	}

	/// Record the dependencies of a target, if they differ from what the
	/// log already stores.
	pub fn record_deps(
		&mut self,
		target: RawString,
		mtime: Option<Timestamp>,
		deps: Vec<RawString>,
	) -> Result<(), Error> {
		let size = deps.len() as u32 * 4 + 12;
		if size > MAX_RECORD_SIZE {
			return Err(Error::new(
				ErrorKind::InvalidInput,
				format!("Too many dependencies for {}", target),
			));
		}

		let target = self.insert_path(target)?;

		let mut need_write = false;
		let mut dep_ids = {
			let record = self.deps.records.get_index_mut(target as usize).unwrap().1;
			if let Some(record) = record.as_mut() {
				if record.mtime != mtime {
					need_write = true;
				}
				replace(&mut record.deps, Vec::new())
			} else {
				need_write = true;
				Vec::new()
			}
		};

		if deps.len() != dep_ids.len() {
			need_write = true;
			dep_ids.resize(deps.len(), !0);
		}

		for (dep, dep_id) in deps.into_iter().zip(dep_ids.iter_mut()) {
			let new_id = self.insert_path(dep)?;
			if *dep_id != new_id {
				need_write = true;
				*dep_id = new_id;
			}
		}

		if need_write {
			self.file.write_u32::<LE>(0x8000_0000 | size)?;
			self.file.write_u32::<LE>(target)?;
			self.file.write_u64::<LE>(mtime.map_or(0, Timestamp::to_nanos))?;
			for &dep in &dep_ids {
				self.file.write_u32::<LE>(dep)?;
			}
		}

		let record = self.deps.records.get_index_mut(target as usize).unwrap().1;
		let old_bytes = record.as_ref().map_or(0, |r| r.bytes);
		let bytes = if need_write { 4 + u64::from(size) } else { old_bytes };
		*record = Some(Record {
			deps: dep_ids,
			mtime,
			bytes,
		});
		if need_write {
			self.deps.dead_bytes += old_bytes;
			self.deps.file_size += 4 + u64::from(size);
		}
		Ok(())
	}

	/// Rewrite the log with only the live records, through a temporary
	/// file that is atomically renamed over the old one.
	pub fn recompact(&mut self) -> Result<(), Error> {
		let tmp_path = {
			let mut p = self.path.clone().into_os_string();
			p.push(".tmp");
			PathBuf::from(p)
		};

		let mut new_log = DepsLogMut::create(&tmp_path)?;
		for (target, info) in self.deps.iter() {
			let deps = info.deps().map(|d| d.to_owned()).collect();
			new_log.record_deps(target.to_owned(), info.mtime(), deps)?;
		}
		new_log.file.flush()?;
		std::fs::rename(&tmp_path, &self.path)?;

		new_log.path = self.path.clone();
		*self = new_log;
		Ok(())
	}

	/// Flush buffered records to disk.
	pub fn flush(&mut self) -> Result<(), Error> {
		self.file.flush()
	}
}

impl std::ops::Deref for DepsLogMut {
	type Target = DepsLog;
	fn deref(&self) -> &Self::Target {
		&self.deps
	}
}
