//! Pass 1 — inode and block scan (spec §4.2).

use log::{debug, info};

use crate::context::Context;
use crate::device::BlockDevice;
use crate::error::CheckError;
use crate::inode::{walk_blocks, Inode, WalkAction};
use crate::problem::{fix_problem, ProblemCode};

pub const ROOT_INODE: u32 = 2;
pub const BAD_BLOCKS_INODE: u32 = 1;
pub const FIRST_NON_RESERVED_INODE: u32 = 11;
const MAX_ILLEGAL_BLOCKS_PER_INODE: u32 = 20;

/// One entry of the global directory-block list pass 2 consumes, built up
/// during pass 1 in inode-ascending (and within an inode, block-ascending)
/// order.
#[derive(Debug, Clone, Copy)]
pub struct DirBlockEntry {
	pub ino: u32,
	pub block: u32,
	pub blockcnt: u64,
}

pub struct Pass1Result {
	pub dir_blocks: Vec<DirBlockEntry>,
	pub restart: bool,
}

/// Runs pass 1 to completion, or returns with `restart = true` if the caller
/// must re-enter from scratch (spec §4.2's restart condition).
pub fn run(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<Pass1Result, CheckError> {
	info!("pass1: scanning {} inodes", ctx.sb.total_inodes);
	let mut dir_blocks = Vec::new();
	let total_inodes = ctx.sb.total_inodes;

	for ino in 1..=total_inodes {
		let mut inode = Inode::read(dev, ino, &ctx.sb, &ctx.groups)?;

		if ino < FIRST_NON_RESERVED_INODE && ino != ROOT_INODE && ino != BAD_BLOCKS_INODE {
			if inode.mode != 0 {
				if fix_problem(&mut ctx.problems, ProblemCode::Pr1BadIMode)? {
					let mut cleared = inode;
					cleared.mode = 0;
					cleared.write(dev, ino, &ctx.sb, &ctx.groups)?;
					ctx.stats.problems_fixed += 1;
				}
			}
			continue;
		}

		if ino == BAD_BLOCKS_INODE {
			scan_bad_block_inode(ctx, dev, &inode)?;
			continue;
		}

		let deleted = inode.links_count == 0;
		if deleted {
			if inode.mode != 0 && inode.dtime == 0 {
				if fix_problem(&mut ctx.problems, ProblemCode::Pr1SetDtime)? {
					ctx.stats.problems_fixed += 1;
				}
			}
			continue;
		}

		if inode.dtime != 0 {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr1ZeroDtime)? {
				let mut fixed = inode;
				fixed.dtime = 0;
				fixed.write(dev, ino, &ctx.sb, &ctx.groups)?;
				ctx.stats.problems_fixed += 1;
			}
		}

		if ino == ROOT_INODE && !inode.is_dir() {
			// Root must be a directory; pass 3's ensure_root replaces it if
			// this inode is still not a directory by the time pass 3 runs.
			debug!("root inode is not a directory");
		}

		ctx.inode_used_map.set(ino as u64);
		ctx.icount.set(ino, 0);
		ctx.stats.inodes_used += 1;

		if inode.is_dir() {
			ctx.inode_dir_map.set(ino as u64);
			ctx.dir_info.add(ino);
			if inode.flags & crate::inode::INDEX_FL != 0 {
				ctx.dx_dir_info.add(ino, ctx.sb.def_hash_version);
			}
			ctx.stats.directories += 1;
		} else if inode.is_reg() {
			ctx.stats.regular_files += 1;
		} else {
			ctx.stats.special_files += 1;
		}

		let restart = scan_inode_blocks(ctx, dev, ino, &mut inode, &mut dir_blocks)?;
		if restart {
			return Ok(Pass1Result { dir_blocks: Vec::new(), restart: true });
		}
	}

	info!(
		"pass1: done — {} inodes used, {} directories, {} regular files",
		ctx.stats.inodes_used, ctx.stats.directories, ctx.stats.regular_files
	);
	Ok(Pass1Result { dir_blocks, restart: false })
}

fn scan_inode_blocks(
	ctx: &mut Context,
	dev: &mut dyn BlockDevice,
	ino: u32,
	inode: &mut Inode,
	dir_blocks: &mut Vec<DirBlockEntry>,
) -> Result<bool, CheckError> {
	let first_data_block = ctx.sb.first_data_block() as u64;
	let total_blocks = ctx.sb.total_blocks as u64;
	let block_size = ctx.sb.block_size() as u64;

	let mut num_blocks: u64 = 0;
	let mut last_block: i64 = -1;
	let mut illegal_count = 0u32;
	let mut restart = false;
	let mut any_cleared = false;
	let is_dir = inode.is_dir();

	// Directories get holes reported too (pass 2 fills a `blk == 0` entry
	// rather than silently skipping it); regular files don't need that.
	let dirty = walk_blocks(dev, inode, is_dir, |visit| {
		if visit.block == 0 {
			if is_dir && visit.depth == 0 {
				dir_blocks.push(DirBlockEntry { ino, block: 0, blockcnt: visit.logical_index });
			}
			return Ok(WalkAction::Continue);
		}
		let b = visit.block as u64;
		if b < first_data_block || b >= total_blocks {
			illegal_count += 1;
			if illegal_count > MAX_ILLEGAL_BLOCKS_PER_INODE {
				if fix_problem(&mut ctx.problems, ProblemCode::Pr1TooManyBadBlocks)? {
					restart = true;
				}
				return Ok(WalkAction::Abort);
			}
			if fix_problem(&mut ctx.problems, ProblemCode::Pr1IllegalBlockNum)? {
				any_cleared = true;
				return Ok(WalkAction::Replace(0));
			}
			return Ok(WalkAction::Continue);
		}

		let was_used = ctx.claim_block(b);
		ctx.dup.claim(b, ino, visit.logical_index);
		if !was_used {
			ctx.stats.blocks_used += 1;
		}

		if visit.depth == 0 {
			num_blocks += 1;
			last_block = last_block.max(visit.logical_index as i64);
			if is_dir {
				dir_blocks.push(DirBlockEntry { ino, block: visit.block, blockcnt: visit.logical_index });
			}
		} else {
			num_blocks += 1;
		}
		Ok(WalkAction::Continue)
	})?;

	if restart {
		return Ok(true);
	}

	if dirty {
		inode.write(dev, ino, &ctx.sb, &ctx.groups)?;
	}
	if any_cleared {
		ctx.stats.problems_fixed += 1;
	}

	let expected_size = if is_dir {
		((last_block + 1).max(0) as u64) * block_size
	} else {
		inode.size()
	};
	if is_dir && inode.size() != expected_size {
		if fix_problem(&mut ctx.problems, ProblemCode::Pr1FsizeBad)? {
			let mut fixed = *inode;
			fixed.size_low = expected_size as u32;
			fixed.write(dev, ino, &ctx.sb, &ctx.groups)?;
			ctx.stats.problems_fixed += 1;
		}
	}

	let expected_blocks_512 = num_blocks * block_size / 512;
	if inode.blocks_512 as u64 != expected_blocks_512 {
		if fix_problem(&mut ctx.problems, ProblemCode::Pr1BadIBlocks)? {
			let mut fixed = *inode;
			fixed.blocks_512 = expected_blocks_512 as u32;
			fixed.write(dev, ino, &ctx.sb, &ctx.groups)?;
			ctx.stats.problems_fixed += 1;
		}
	}

	Ok(false)
}

/// Checks every block the bad-blocks inode lists against known metadata
/// locations, per spec §4.2's separate bad-block-inode handler.
fn scan_bad_block_inode(ctx: &mut Context, dev: &mut dyn BlockDevice, inode: &Inode) -> Result<(), CheckError> {
	let mut collisions = 0;
	let mut scratch = *inode;
	walk_blocks(dev, &mut scratch, false, |visit| {
		if visit.block == 0 {
			return Ok(WalkAction::Continue);
		}
		let group = (visit.block as u64 / ctx.sb.blocks_per_group as u64) as usize;
		if let Some(gd) = ctx.groups.get(group) {
			if visit.block == gd.block_bitmap_block || visit.block == gd.inode_bitmap_block || visit.block == gd.inode_table_start_block {
				collisions += 1;
			}
		}
		ctx.claim_block(visit.block as u64);
		Ok(WalkAction::Continue)
	})?;
	if collisions > 0 {
		debug!("bad-blocks inode collides with {collisions} metadata block(s)");
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::MemDevice;
	use crate::group_desc::GroupDescriptor;
	use crate::problem::Policy;
	use crate::superblock::Superblock;

	fn fresh_sb() -> Superblock {
		let mut sb: Superblock = unsafe { std::mem::zeroed() };
		sb.signature = crate::superblock::EXT2_SIGNATURE;
		sb.total_blocks = 256;
		sb.total_inodes = 64;
		sb.blocks_per_group = 256;
		sb.inodes_per_group = 64;
		sb.block_size_log = 2; // 4096
		sb.major_version = 1;
		sb.inode_size = 128;
		sb
	}

	#[test]
	fn scans_a_single_regular_file() {
		let sb = fresh_sb();
		let groups = vec![GroupDescriptor { block_bitmap_block: 1, inode_bitmap_block: 2, inode_table_start_block: 3, free_blocks_count: 0, free_inodes_count: 0, used_dirs_count: 0, _padding: [0; 14] }];
		let mut dev = MemDevice::new(64, 4096);
		sb.write(&mut dev).unwrap();
		crate::group_desc::write_all(&mut dev, &sb, &groups).unwrap();

		let mut file_inode = Inode::default();
		file_inode.mode = 0x8000 | 0o644;
		file_inode.links_count = 1;
		file_inode.block[0] = 20;
		file_inode.size_low = 100;
		file_inode.blocks_512 = 8;
		file_inode.write(&mut dev, FIRST_NON_RESERVED_INODE, &sb, &groups).unwrap();

		let mut ctx = Context::new(sb, groups, Policy::Interactive { assume: Some(true) });
		let result = run(&mut ctx, &mut dev).unwrap();
		assert!(!result.restart);
		assert_eq!(ctx.stats.regular_files, 1);
		assert!(ctx.inode_used_map.get(FIRST_NON_RESERVED_INODE as u64));
	}

	#[test]
	fn reserved_inode_with_mode_offers_clear() {
		let sb = fresh_sb();
		let groups = vec![GroupDescriptor::default()];
		let mut dev = MemDevice::new(64, 4096);
		sb.write(&mut dev).unwrap();
		crate::group_desc::write_all(&mut dev, &sb, &groups).unwrap();

		let mut bad = Inode::default();
		bad.mode = 0x8000;
		bad.write(&mut dev, 5, &sb, &groups).unwrap();

		let mut ctx = Context::new(sb, groups.clone(), Policy::Interactive { assume: Some(true) });
		run(&mut ctx, &mut dev).unwrap();
		let after = Inode::read(&mut dev, 5, &ctx.sb, &groups).unwrap();
		assert_eq!(after.mode, 0);
	}
}
