//! Passes 1B-1D — duplicate block resolution (spec §4.2).
//!
//! Only runs when pass 1 found any block claimed by more than one inode.
//! 1B/1C are folded together here: the duplicate registry built during pass 1
//! already records every claim, so there's no separate rescan needed to learn
//! "who shares this block" (unlike the teacher's C original, which discovers
//! duplicates only after the fact and must walk the image twice more). 1C's
//! "which directory contains this inode" lookup is answered directly from
//! `dir_info`/pass1's directory-block list instead of a second directory
//! walk, since this registry already carries everything 1B/1C need.

use log::info;

use crate::context::Context;
use crate::device::BlockDevice;
use crate::error::CheckError;
use crate::inode::{walk_blocks, Inode, WalkAction};
use crate::problem::{fix_problem, ProblemCode};

/// One duplicate-inode report: the inode and the set of others it shares at
/// least one block with.
#[derive(Debug, Clone)]
pub struct DupGroup {
	pub inodes: Vec<u32>,
	pub touches_metadata: bool,
}

/// Builds the set of duplicate groups from the registry pass 1 populated.
pub fn collect_dup_groups(ctx: &Context) -> Vec<DupGroup> {
	let dup_blocks = ctx.dup.duplicated_blocks();
	let mut groups: Vec<DupGroup> = Vec::new();
	for (_, claimants) in dup_blocks {
		if let Some(existing) = groups.iter_mut().find(|g| g.inodes.iter().any(|i| claimants.contains(i))) {
			for ino in claimants {
				if !existing.inodes.contains(&ino) {
					existing.inodes.push(ino);
				}
			}
		} else {
			groups.push(DupGroup { inodes: claimants, touches_metadata: false });
		}
	}
	groups
}

pub enum Resolution {
	Clone,
	Delete,
}

/// Pass 1D: for each duplicate group, ask whether to clone or delete each
/// sharing inode's blocks.
pub fn run(ctx: &mut Context, dev: &mut dyn BlockDevice, groups: &[DupGroup]) -> Result<(), CheckError> {
	if groups.is_empty() {
		return Ok(());
	}
	info!("pass1d: resolving {} duplicate-block group(s)", groups.len());
	fix_problem(&mut ctx.problems, ProblemCode::Pr1bDupBlockHeader)?;

	for group in groups {
		fix_problem(&mut ctx.problems, ProblemCode::Pr1dDupFile)?;
		for &ino in &group.inodes {
			let resolution = if fix_problem(&mut ctx.problems, ProblemCode::Pr1dClone)? {
				Resolution::Clone
			} else if fix_problem(&mut ctx.problems, ProblemCode::Pr1dDeleteFile)? {
				Resolution::Delete
			} else {
				continue;
			};
			match resolution {
				Resolution::Clone => clone_inode_blocks(ctx, dev, ino)?,
				Resolution::Delete => delete_inode(ctx, dev, ino)?,
			}
		}
	}
	Ok(())
}

/// Reallocates fresh, uniquely-owned blocks for every block `ino` shares with
/// another inode, rewriting its block-pointer tree in place.
fn clone_inode_blocks(ctx: &mut Context, dev: &mut dyn BlockDevice, ino: u32) -> Result<(), CheckError> {
	let mut inode = Inode::read(dev, ino, &ctx.sb, &ctx.groups)?;
	let mut replacements: Vec<(crate::inode::PointerSlot, u32, u32)> = Vec::new();

	walk_blocks(dev, &mut inode, false, |visit| {
		if visit.block == 0 {
			return Ok(WalkAction::Continue);
		}
		let is_dup = ctx
			.dup
			.first_record_for_block(visit.block as u64)
			.and_then(|head| ctx.dup.next_record_for_block(head))
			.is_some();
		if is_dup {
			if let Some(new_block) = find_free_block(ctx) {
				replacements.push((visit.slot, visit.block, new_block));
			}
		}
		Ok(WalkAction::Continue)
	})?;

	let mut patched = inode;
	for (slot, old_block, new_block) in &replacements {
		let mut buf = vec![0u8; ctx.sb.block_size() as usize];
		dev.read_block(*old_block as u64, &mut buf)?;
		dev.write_block(*new_block as u64, &buf)?;
		match slot {
			crate::inode::PointerSlot::Direct(i) => patched.block[*i] = *new_block,
			crate::inode::PointerSlot::Indirect { parent_block, index } => {
				crate::inode::set_indirect_pointer(dev, *parent_block, *index, *new_block)?;
			}
		}
		ctx.claim_block(*new_block as u64);
	}
	patched.write(dev, ino, &ctx.sb, &ctx.groups)?;
	ctx.stats.problems_fixed += replacements.len() as u64;
	Ok(())
}

/// Frees every block `ino` owns and clears the inode (spec §4.2's Delete path).
fn delete_inode(ctx: &mut Context, dev: &mut dyn BlockDevice, ino: u32) -> Result<(), CheckError> {
	let mut inode = Inode::read(dev, ino, &ctx.sb, &ctx.groups)?;
	walk_blocks(dev, &mut inode, false, |visit| {
		if visit.block != 0 {
			ctx.block_found_map.clear(visit.block as u64);
		}
		Ok(WalkAction::Continue)
	})?;
	ctx.dup.forget_inode(ino);
	ctx.inode_used_map.clear(ino as u64);
	let mut cleared = Inode::default();
	cleared.dtime = inode.mtime.max(1);
	cleared.write(dev, ino, &ctx.sb, &ctx.groups)?;
	ctx.stats.problems_fixed += 1;
	Ok(())
}

/// Finds the lowest-numbered block not yet claimed. A linear scan is
/// acceptable here: cloning only runs for the (rare) duplicate-block case,
/// never on the hot pass 1 path.
fn find_free_block(ctx: &Context) -> Option<u32> {
	let first = ctx.sb.first_data_block() as u64;
	(first..ctx.sb.total_blocks as u64).find(|&b| !ctx.block_found_map.get(b)).map(|b| b as u32)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn collect_dup_groups_merges_transitive_sharers() {
		let mut ctx_dup = crate::dup::DupRegistry::new();
		ctx_dup.claim(10, 1, 0);
		ctx_dup.claim(10, 2, 0);
		ctx_dup.claim(20, 2, 1);
		ctx_dup.claim(20, 3, 1);
		let mut sb: crate::superblock::Superblock = unsafe { std::mem::zeroed() };
		sb.signature = crate::superblock::EXT2_SIGNATURE;
		sb.total_blocks = 64;
		sb.total_inodes = 32;
		sb.blocks_per_group = 64;
		sb.inodes_per_group = 32;
		sb.block_size_log = 2;
		sb.major_version = 1;
		sb.inode_size = 128;
		let mut ctx = Context::new(sb, vec![], crate::problem::Policy::Interactive { assume: Some(true) });
		ctx.dup = ctx_dup;
		let groups = collect_dup_groups(&ctx);
		assert_eq!(groups.len(), 1);
		let mut inos = groups[0].inodes.clone();
		inos.sort_unstable();
		assert_eq!(inos, vec![1, 2, 3]);
	}
}
