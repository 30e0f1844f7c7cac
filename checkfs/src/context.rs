//! The engine's global mutable state, gathered into one struct per Design
//! Notes §9 rather than threaded through every pass function as a dozen
//! separate arguments.

use crate::bitmap::Bitmap;
use crate::dir_info::{DirInfoTable, DxDirInfoTable};
use crate::dup::DupRegistry;
use crate::group_desc::GroupDescriptor;
use crate::icount::ICount;
use crate::killsector::KillSectorList;
use crate::problem::{Policy, ProblemState};
use crate::superblock::Superblock;

/// Accumulated statistics for `-v` output and the final run report.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
	pub inodes_used: u64,
	pub directories: u64,
	pub regular_files: u64,
	pub links: u64,
	pub special_files: u64,
	pub blocks_used: u64,
	pub problems_seen: u64,
	pub problems_fixed: u64,
}

/// One engine run's worth of global state: the superblock and group
/// descriptors (mutated in place as passes reconcile them), the two
/// in-progress bitmaps pass 1 builds up, and the cross-pass bookkeeping
/// tables.
pub struct Context {
	pub sb: Superblock,
	pub groups: Vec<GroupDescriptor>,

	/// Blocks seen in use so far, rebuilt from scratch by pass 1 and
	/// compared against the on-disk bitmap in pass 5.
	pub block_found_map: Bitmap,
	pub inode_used_map: Bitmap,
	/// Inodes known to be directories (subset of `inode_used_map`).
	pub inode_dir_map: Bitmap,

	pub icount: ICount,
	pub dir_info: DirInfoTable,
	pub dx_dir_info: DxDirInfoTable,
	pub dup: DupRegistry,
	pub kill_sectors: KillSectorList,

    pub problems: ProblemState,
	pub stats: Stats,

	/// Set once any pass decides the run cannot safely continue (distinct
	/// from `problems.fs_valid`, which only means "not clean").
	pub aborted: bool,

	pub lost_and_found_ino: Option<u32>,
}

impl Context {
	pub fn new(sb: Superblock, groups: Vec<GroupDescriptor>, policy: Policy) -> Self {
		let total_blocks = sb.total_blocks as u64;
		let total_inodes = sb.total_inodes as u64;
		Context {
			sb,
			groups,
			block_found_map: Bitmap::new(total_blocks),
			inode_used_map: Bitmap::new(total_inodes + 1),
			inode_dir_map: Bitmap::new(total_inodes + 1),
			icount: ICount::new(total_inodes),
			dir_info: DirInfoTable::new(),
			dx_dir_info: DxDirInfoTable::new(),
			dup: DupRegistry::new(),
			kill_sectors: KillSectorList::new(),
			problems: ProblemState::new(policy),
			stats: Stats::default(),
			aborted: false,
			lost_and_found_ino: None,
		}
	}

	/// Records that `block` is in use by something; returns `true` if it was
	/// already marked (i.e. this is a duplicate claim pass 1 must register).
	pub fn claim_block(&mut self, block: u64) -> bool {
		if self.block_found_map.get(block) {
			true
		} else {
			self.block_found_map.set(block);
			false
		}
	}

	pub fn group_of_inode(&self, ino: u32) -> u32 {
		(ino - 1) / self.sb.inodes_per_group
	}

	/// Merges another worker's partial `dir_info`/`icount` into this
	/// context's. Shape-only per Design Notes §9 Open Question #4: pass 1
	/// always runs single-worker in this build, so `other` is always empty
	/// in practice, but the seam is real so a future parallel split only
	/// needs to fill in the worker side.
	pub fn merge_dir_info(&mut self, other: DirInfoTable) {
		self.dir_info.merge(other);
	}

	pub fn merge_icount(&mut self, other: &ICount) {
		for (ino, count) in other.iter_overflow() {
			self.icount.set(ino, count);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn fresh_sb() -> Superblock {
		let mut sb: Superblock = unsafe { std::mem::zeroed() };
		sb.signature = crate::superblock::EXT2_SIGNATURE;
		sb.total_blocks = 64;
		sb.total_inodes = 32;
		sb.blocks_per_group = 64;
		sb.inodes_per_group = 32;
		sb.block_size_log = 2;
		sb.major_version = 1;
		sb.inode_size = 128;
		sb
	}

	#[test]
	fn claim_block_detects_second_claim() {
		let mut ctx = Context::new(fresh_sb(), vec![], Policy::Interactive { assume: Some(true) });
		assert!(!ctx.claim_block(5));
		assert!(ctx.claim_block(5));
	}

	#[test]
	fn group_of_inode_computation() {
		let ctx = Context::new(fresh_sb(), vec![], Policy::Interactive { assume: Some(true) });
		assert_eq!(ctx.group_of_inode(1), 0);
		assert_eq!(ctx.group_of_inode(33), 1);
	}
}
