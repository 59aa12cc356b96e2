//! Timestamps and the on-disk state of files.

use std::cmp::max;
use std::num::NonZeroU64;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A modification time of a file.
///
/// `Option<Timestamp>` is the same size as `Timestamp`, as a timestamp is
/// never 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Timestamp(NonZeroU64);

impl Timestamp {
	/// Convert an `mtime` in nanoseconds (as used in the log files) to a
	/// [`Timestamp`].
	///
	/// A value of `0` is used for files that do not exist, and results in
	/// [`None`].
	pub fn from_nanos(mtime: u64) -> Option<Self> {
		NonZeroU64::new(mtime).map(Timestamp)
	}

	/// Convert a [`Timestamp`] to nanoseconds, as used in the log files.
	pub fn to_nanos(self) -> u64 {
		self.0.get()
	}

	/// Convert a [`SystemTime`] to a [`Timestamp`].
	pub fn from_system_time(time: SystemTime) -> Self {
		let ns = time.duration_since(UNIX_EPOCH).ok().map_or(1, |d| {
			max(
				1,
				d.as_secs()
					.saturating_mul(1_000_000_000)
					.saturating_add(d.subsec_nanos().into()),
			)
		});
		debug_assert!(ns > 0);
		Timestamp(unsafe { NonZeroU64::new_unchecked(ns) })
	}

	/// Convert a [`Timestamp`] to a [`SystemTime`].
	pub fn to_system_time(self) -> SystemTime {
		UNIX_EPOCH + Duration::from_nanos(self.to_nanos())
	}
}

/// What we know about a file on disk.
///
/// Nodes start out as `Unknown` and move to `Missing` or `Exists` the first
/// time they are stat-ed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileState {
	/// Not stat-ed yet.
	Unknown,
	/// Stat-ed, and the file does not exist.
	Missing,
	/// Stat-ed, and the file exists with this modification time.
	Exists(Timestamp),
}

impl FileState {
	/// Whether the file was stat-ed and found to exist.
	pub fn exists(&self) -> bool {
		match self {
			FileState::Exists(_) => true,
			_ => false,
		}
	}

	/// Whether the file was stat-ed at all.
	pub fn is_known(&self) -> bool {
		*self != FileState::Unknown
	}

	/// The modification time, if the file exists.
	pub fn mtime(&self) -> Option<Timestamp> {
		match self {
			FileState::Exists(t) => Some(*t),
			_ => None,
		}
	}

	/// Convert the result of a stat to a `FileState`.
	pub fn from_mtime(mtime: Option<Timestamp>) -> FileState {
		match mtime {
			Some(t) => FileState::Exists(t),
			None => FileState::Missing,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn timestamp_nanos() {
		assert_eq!(Timestamp::from_nanos(0), None);
		let t = Timestamp::from_nanos(123).unwrap();
		assert_eq!(t.to_nanos(), 123);
		assert!(Timestamp::from_nanos(1) < Timestamp::from_nanos(2));
	}

	#[test]
	fn file_state() {
		assert!(!FileState::Unknown.exists());
		assert!(!FileState::Missing.exists());
		assert!(FileState::Missing.is_known());
		let t = Timestamp::from_nanos(5).unwrap();
		assert_eq!(FileState::from_mtime(Some(t)), FileState::Exists(t));
		assert_eq!(FileState::Exists(t).mtime(), Some(t));
		assert_eq!(FileState::from_mtime(None), FileState::Missing);
	}
}
