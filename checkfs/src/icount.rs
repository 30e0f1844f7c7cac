//! Per-inode link-count accumulator (spec §3/§4.9: `icount`).
//!
//! Most inodes have a link count of 1, so the common case is tracked as a
//! single bitmap bit rather than a counter entry — the packed (inode, count)
//! array only holds inodes whose observed count is 0 or >= 2. Grounded on the
//! duplicate-block registry's arena-of-records shape described for `dup.rs`,
//! applied here to counting instead of block ownership.

use crate::bitmap::Bitmap;
use std::collections::HashMap;

/// Tracks, for every inode, how many directory entries pass 2 has seen
/// pointing at it so far.
pub struct ICount {
	/// Set for inodes whose count is exactly 1 and has never needed to move
	/// into `counts`.
	singles: Bitmap,
	/// Inodes whose count is 0 or >= 2.
	counts: HashMap<u32, u16>,
}

impl ICount {
	pub fn new(total_inodes: u64) -> Self {
		ICount {
			singles: Bitmap::new(total_inodes + 1),
			counts: HashMap::new(),
		}
	}

	/// The count recorded for `ino`, or 0 if never touched.
	pub fn get(&self, ino: u32) -> u16 {
		if let Some(&c) = self.counts.get(&ino) {
			return c;
		}
		if self.singles.get(ino as u64) {
			1
		} else {
			0
		}
	}

	/// Records one more reference to `ino`.
	pub fn increment(&mut self, ino: u32) {
		if let Some(c) = self.counts.get_mut(&ino) {
			*c += 1;
			return;
		}
		if self.singles.get(ino as u64) {
			self.singles.clear(ino as u64);
			self.counts.insert(ino, 2);
		} else {
			self.singles.set(ino as u64);
		}
	}

	/// Removes one reference to `ino` (used when a link recorded against one
	/// target turns out to belong to another, e.g. pass 3 retargeting a
	/// stale `..`). Floors at 0 rather than underflowing.
	pub fn decrement(&mut self, ino: u32) {
		if let Some(c) = self.counts.get_mut(&ino) {
			if *c > 0 {
				*c -= 1;
			}
			return;
		}
		if self.singles.get(ino as u64) {
			self.singles.clear(ino as u64);
		}
	}

	/// Explicitly sets `ino`'s count (used to seed pass 1's initial scan).
	pub fn set(&mut self, ino: u32, count: u16) {
		if count == 1 {
			self.counts.remove(&ino);
			self.singles.set(ino as u64);
		} else {
			if self.singles.get(ino as u64) {
				self.singles.clear(ino as u64);
			}
			self.counts.insert(ino, count);
		}
	}

	/// True if `ino` has ever been touched (count >= 1 recorded, or held in
	/// the overflow map even at 0).
	pub fn contains(&self, ino: u32) -> bool {
		self.singles.get(ino as u64) || self.counts.contains_key(&ino)
	}

	pub fn iter_overflow(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
		self.counts.iter().map(|(&k, &v)| (k, v))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn single_reference_stays_in_bitmap() {
		let mut ic = ICount::new(64);
		ic.increment(10);
		assert_eq!(ic.get(10), 1);
		assert!(ic.contains(10));
		assert!(!ic.counts.contains_key(&10));
	}

	#[test]
	fn second_reference_spills_to_map() {
		let mut ic = ICount::new(64);
		ic.increment(10);
		ic.increment(10);
		assert_eq!(ic.get(10), 2);
		ic.increment(10);
		assert_eq!(ic.get(10), 3);
	}

	#[test]
	fn set_zero_is_tracked() {
		let mut ic = ICount::new(64);
		ic.set(5, 0);
		assert!(ic.contains(5));
		assert_eq!(ic.get(5), 0);
	}

	#[test]
	fn untouched_inode_reads_zero() {
		let ic = ICount::new(64);
		assert_eq!(ic.get(3), 0);
		assert!(!ic.contains(3));
	}

	#[test]
	fn decrement_retargets_a_single_reference() {
		let mut ic = ICount::new(64);
		ic.increment(7);
		assert_eq!(ic.get(7), 1);
		ic.decrement(7);
		assert_eq!(ic.get(7), 0);
	}

	#[test]
	fn decrement_floors_at_zero() {
		let mut ic = ICount::new(64);
		ic.set(7, 0);
		ic.decrement(7);
		assert_eq!(ic.get(7), 0);
	}

	#[test]
	fn decrement_from_overflow_count() {
		let mut ic = ICount::new(64);
		ic.increment(10);
		ic.increment(10);
		ic.increment(10);
		assert_eq!(ic.get(10), 3);
		ic.decrement(10);
		assert_eq!(ic.get(10), 2);
	}
}
