//! Access to the file system.
//!
//! The core only touches disk through the [`Disk`] trait, so tests can run
//! against an in-memory [`VirtualDisk`] with a deterministic clock while
//! the real build uses [`RealDisk`].

use crate::mtime::{FileState, Timestamp};
use raw_string::unix::RawStrExt;
use raw_string::{RawStr, RawString};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Error, ErrorKind, Read};

/// The file system operations the build core needs.
///
/// All operations are synchronous. Methods take `&self`; implementations
/// that need state use interior mutability.
pub trait Disk {
	/// Stat a file. Returns [`FileState::Missing`] or
	/// [`FileState::Exists`], never [`FileState::Unknown`].
	fn stat(&self, path: &RawStr) -> Result<FileState, Error>;

	/// Read a file. Returns `None` if it does not exist.
	fn read_file(&self, path: &RawStr) -> Result<Option<RawString>, Error>;

	/// Create or overwrite a file.
	fn write_file(&self, path: &RawStr, contents: &RawStr) -> Result<(), Error>;

	/// Create the chain of parent directories of `path`, if absent.
	fn make_dirs_for(&self, path: &RawStr) -> Result<(), Error>;

	/// Remove a file. Returns `false` if it did not exist.
	fn remove_file(&self, path: &RawStr) -> Result<bool, Error>;
}

/// The actual file system.
pub struct RealDisk;

impl Disk for RealDisk {
	fn stat(&self, path: &RawStr) -> Result<FileState, Error> {
		match fs::metadata(path.as_path()).and_then(|m| m.modified()) {
			Ok(time) => Ok(FileState::Exists(Timestamp::from_system_time(time))),
			Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(FileState::Missing),
			Err(e) => Err(Error::new(
				e.kind(),
				format!("Unable to stat {:?}: {}", path, e),
			)),
		}
	}

	fn read_file(&self, path: &RawStr) -> Result<Option<RawString>, Error> {
		let mut file = match fs::File::open(path.as_path()) {
			Ok(file) => file,
			Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e),
		};
		let mut bytes = Vec::new();
		file.read_to_end(&mut bytes)?;
		Ok(Some(RawString::from_bytes(bytes)))
	}

	fn write_file(&self, path: &RawStr, contents: &RawStr) -> Result<(), Error> {
		fs::write(path.as_path(), contents.as_bytes())
	}

	fn make_dirs_for(&self, path: &RawStr) -> Result<(), Error> {
		if let Some(n) = path.bytes().rposition(|c| c == b'/') {
			if n > 0 {
				fs::create_dir_all(path[..n].as_path())?;
			}
		}
		Ok(())
	}

	fn remove_file(&self, path: &RawStr) -> Result<bool, Error> {
		match fs::remove_file(path.as_path()) {
			Ok(()) => Ok(true),
			Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e),
		}
	}
}

#[derive(Clone, Debug)]
struct VirtualEntry {
	mtime: Timestamp,
	contents: RawString,
}

/// An in-memory file system with a deterministic clock.
///
/// Every write advances the clock by one tick, so tests can reason about
/// relative mtimes. Created and removed paths are recorded for
/// inspection.
pub struct VirtualDisk {
	files: RefCell<BTreeMap<RawString, VirtualEntry>>,
	now: Cell<u64>,
	files_created: RefCell<BTreeSet<RawString>>,
	files_removed: RefCell<BTreeSet<RawString>>,
}

impl VirtualDisk {
	pub fn new() -> Self {
		VirtualDisk {
			files: RefCell::new(BTreeMap::new()),
			now: Cell::new(1),
			files_created: RefCell::new(BTreeSet::new()),
			files_removed: RefCell::new(BTreeSet::new()),
		}
	}

	/// Advance the clock by one tick and return the new time.
	pub fn tick(&self) -> Timestamp {
		self.now.set(self.now.get() + 1);
		self.now()
	}

	/// The current time.
	pub fn now(&self) -> Timestamp {
		Timestamp::from_nanos(self.now.get()).unwrap()
	}

	/// Create a file at the current time, without recording it in
	/// `files_created`. For setting up the initial disk state of a test.
	pub fn add_file(&self, path: impl Into<RawString>, contents: impl Into<RawString>) {
		self.files.borrow_mut().insert(
			path.into(),
			VirtualEntry {
				mtime: self.now(),
				contents: contents.into(),
			},
		);
	}

	/// Overwrite a file with a fresh mtime, like a command writing output.
	pub fn touch(&self, path: &RawStr) {
		let mtime = self.tick();
		let mut files = self.files.borrow_mut();
		match files.get_mut(path) {
			Some(entry) => entry.mtime = mtime,
			None => {
				files.insert(
					path.to_owned(),
					VirtualEntry {
						mtime,
						contents: RawString::new(),
					},
				);
			}
		}
	}

	pub fn has_file(&self, path: &RawStr) -> bool {
		self.files.borrow().contains_key(path)
	}

	pub fn file_mtime(&self, path: &RawStr) -> Option<Timestamp> {
		self.files.borrow().get(path).map(|e| e.mtime)
	}

	/// Paths created through [`Disk::write_file`].
	pub fn files_created(&self) -> BTreeSet<RawString> {
		self.files_created.borrow().clone()
	}

	/// Paths removed through [`Disk::remove_file`].
	pub fn files_removed(&self) -> BTreeSet<RawString> {
		self.files_removed.borrow().clone()
	}
}

impl Disk for VirtualDisk {
	fn stat(&self, path: &RawStr) -> Result<FileState, Error> {
		Ok(match self.files.borrow().get(path) {
			Some(entry) => FileState::Exists(entry.mtime),
			None => FileState::Missing,
		})
	}

	fn read_file(&self, path: &RawStr) -> Result<Option<RawString>, Error> {
		Ok(self.files.borrow().get(path).map(|e| e.contents.clone()))
	}

	fn write_file(&self, path: &RawStr, contents: &RawStr) -> Result<(), Error> {
		let mtime = self.tick();
		self.files.borrow_mut().insert(
			path.to_owned(),
			VirtualEntry {
				mtime,
				contents: contents.to_owned(),
			},
		);
		self.files_created.borrow_mut().insert(path.to_owned());
		Ok(())
	}

	fn make_dirs_for(&self, _path: &RawStr) -> Result<(), Error> {
		// Directories are not modeled.
		Ok(())
	}

	fn remove_file(&self, path: &RawStr) -> Result<bool, Error> {
		let existed = self.files.borrow_mut().remove(path).is_some();
		if existed {
			self.files_removed.borrow_mut().insert(path.to_owned());
		}
		Ok(existed)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn virtual_disk_clock() {
		let disk = VirtualDisk::new();
		disk.add_file("a", "contents");
		let a = disk.file_mtime(RawStr::from_str("a")).unwrap();
		disk.touch(RawStr::from_str("b"));
		let b = disk.file_mtime(RawStr::from_str("b")).unwrap();
		assert!(a < b);
		assert_eq!(
			disk.stat(RawStr::from_str("a")).unwrap(),
			FileState::Exists(a)
		);
		assert_eq!(disk.stat(RawStr::from_str("c")).unwrap(), FileState::Missing);
	}

	#[test]
	fn virtual_disk_tracks_writes_and_removes() {
		let disk = VirtualDisk::new();
		disk.write_file(RawStr::from_str("out"), RawStr::from_str("x")).unwrap();
		assert!(disk.files_created().contains(RawStr::from_str("out")));
		assert_eq!(
			disk.read_file(RawStr::from_str("out")).unwrap().unwrap(),
			RawStr::from_str("x")
		);
		assert!(disk.remove_file(RawStr::from_str("out")).unwrap());
		assert!(!disk.remove_file(RawStr::from_str("out")).unwrap());
		assert!(disk.files_removed().contains(RawStr::from_str("out")));
		assert_eq!(disk.read_file(RawStr::from_str("out")).unwrap(), None);
	}
}
