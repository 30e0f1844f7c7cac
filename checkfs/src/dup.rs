//! The duplicate-block registry.
//!
//! Block ownership during pass 1 is multi-valued only for the rare blocks
//! claimed by more than one inode, so we don't give every block a list
//! pointer. Instead, every (block, inode, logical-offset) claim past the
//! first is pushed into a flat arena (`records`), and two side tables map
//! `block -> first record` / `inode -> first record` with each record
//! carrying `next_for_block`/`next_for_inode` indices into the same arena —
//! an arena-of-indices instead of intrusive linked-list pointers, per Design
//! Notes §9.

use std::collections::HashMap;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
pub struct DupRecord {
	pub block: u64,
	pub ino: u32,
	/// Logical block index within that inode's file (for reporting which
	/// part of the file the duplicate affects).
	pub logical_index: u64,
	next_for_block: u32,
	next_for_inode: u32,
}

#[derive(Default)]
pub struct DupRegistry {
	records: Vec<DupRecord>,
	first_for_block: HashMap<u64, u32>,
	first_for_inode: HashMap<u32, u32>,
}

impl DupRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers that `ino` claims `block` at `logical_index`. Returns
	/// `true` if this is the second or later claim on `block` (i.e. it is
	/// now known to be a duplicate).
	pub fn claim(&mut self, block: u64, ino: u32, logical_index: u64) -> bool {
		let is_dup = self.first_for_block.contains_key(&block);
		let idx = self.records.len() as u32;
		let prev_block_head = self.first_for_block.get(&block).copied().unwrap_or(NIL);
		let prev_inode_head = self.first_for_inode.get(&ino).copied().unwrap_or(NIL);
		self.records.push(DupRecord {
			block,
			ino,
			logical_index,
			next_for_block: prev_block_head,
			next_for_inode: prev_inode_head,
		});
		self.first_for_block.insert(block, idx);
		self.first_for_inode.insert(ino, idx);
		is_dup
	}

	pub fn first_record_for_block(&self, block: u64) -> Option<&DupRecord> {
		self.first_for_block.get(&block).map(|&i| &self.records[i as usize])
	}

	pub fn next_record_for_block<'a>(&'a self, rec: &DupRecord) -> Option<&'a DupRecord> {
		if rec.next_for_block == NIL {
			None
		} else {
			Some(&self.records[rec.next_for_block as usize])
		}
	}

	pub fn first_record_for_inode(&self, ino: u32) -> Option<&DupRecord> {
		self.first_for_inode.get(&ino).map(|&i| &self.records[i as usize])
	}

	pub fn next_record_for_inode<'a>(&'a self, rec: &DupRecord) -> Option<&'a DupRecord> {
		if rec.next_for_inode == NIL {
			None
		} else {
			Some(&self.records[rec.next_for_inode as usize])
		}
	}

	/// Every block claimed more than once, with each claiming inode.
	pub fn duplicated_blocks(&self) -> Vec<(u64, Vec<u32>)> {
		let mut out = Vec::new();
		for (&block, _) in self.first_for_block.iter() {
			let mut claimants = Vec::new();
			let mut cur = self.first_record_for_block(block);
			while let Some(rec) = cur {
				claimants.push(rec.ino);
				cur = self.next_record_for_block(rec);
			}
			if claimants.len() > 1 {
				claimants.sort_unstable();
				claimants.dedup();
				if claimants.len() > 1 {
					out.push((block, claimants));
				}
			}
		}
		out.sort_by_key(|&(b, _)| b);
		out
	}

	/// Removes every record belonging to `ino` (used when an inode is
	/// entirely cleared during duplicate resolution, per Design Notes §9's
	/// handling of the extended-attribute-block sentinel: rather than write
	/// an inode-0 sentinel record, the record is dropped from the arena).
	pub fn forget_inode(&mut self, ino: u32) {
		self.first_for_inode.remove(&ino);
		for (_, head) in self.first_for_block.iter_mut() {
			let mut idx = *head;
			let mut prev: Option<u32> = None;
			while idx != NIL {
				if self.records[idx as usize].ino == ino {
					let next = self.records[idx as usize].next_for_block;
					match prev {
						Some(p) => self.records[p as usize].next_for_block = next,
						None => *head = next,
					}
					idx = next;
				} else {
					prev = Some(idx);
					idx = self.records[idx as usize].next_for_block;
				}
			}
		}
		self.first_for_block.retain(|_, &mut head| head != NIL);
	}

	pub fn is_empty(&self) -> bool {
		self.first_for_block.is_empty()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn single_claim_is_not_duplicate() {
		let mut reg = DupRegistry::new();
		assert!(!reg.claim(100, 5, 0));
		assert!(reg.duplicated_blocks().is_empty());
	}

	#[test]
	fn second_claim_flags_duplicate() {
		let mut reg = DupRegistry::new();
		reg.claim(100, 5, 0);
		assert!(reg.claim(100, 6, 3));
		let dups = reg.duplicated_blocks();
		assert_eq!(dups.len(), 1);
		assert_eq!(dups[0].0, 100);
		assert_eq!(dups[0].1, vec![5, 6]);
	}

	#[test]
	fn walks_chain_for_inode() {
		let mut reg = DupRegistry::new();
		reg.claim(10, 7, 0);
		reg.claim(20, 7, 1);
		reg.claim(30, 7, 2);
		let mut seen = vec![];
		let mut cur = reg.first_record_for_inode(7);
		while let Some(rec) = cur {
			seen.push(rec.block);
			cur = reg.next_record_for_inode(rec);
		}
		seen.sort_unstable();
		assert_eq!(seen, vec![10, 20, 30]);
	}

	#[test]
	fn forget_inode_removes_its_claims() {
		let mut reg = DupRegistry::new();
		reg.claim(100, 5, 0);
		reg.claim(100, 6, 0);
		reg.forget_inode(5);
		let dups = reg.duplicated_blocks();
		assert!(dups.is_empty());
		assert!(reg.first_record_for_block(100).is_some());
	}
}
