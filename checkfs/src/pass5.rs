//! Pass 5 — bitmap and summary reconciliation (spec §4.6).

use log::info;

use crate::context::Context;
use crate::device::BlockDevice;
use crate::error::CheckError;
use crate::group_desc;
use crate::problem::{fix_problem, ProblemCode};

pub fn run(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<(), CheckError> {
	info!("pass5: reconciling bitmaps and summary counts");

	reconcile_block_bitmap(ctx, dev)?;
	reconcile_inode_bitmap(ctx, dev)?;
	reconcile_group_and_super_counts(ctx)?;

	group_desc::write_all(dev, &ctx.sb, &ctx.groups)?;
	ctx.sb.write(dev)?;
	Ok(())
}

fn reconcile_block_bitmap(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<(), CheckError> {
	let mut mismatches = 0u64;
	let mut padding_only = true;
	for (gi, gd) in ctx.groups.clone().iter().enumerate() {
		let block_size = ctx.sb.block_size() as usize;
		let mut on_disk = vec![0u8; block_size];
		dev.read_block(gd.block_bitmap_block as u64, &mut on_disk)?;
		let first = ctx.sb.first_data_block() as u64 + gi as u64 * ctx.sb.blocks_per_group as u64;
		let last = (first + ctx.sb.blocks_per_group as u64).min(ctx.sb.total_blocks as u64);
		let mut computed = crate::bitmap::Bitmap::new(last - first);
		for b in first..last {
			if ctx.block_found_map.get(b) {
				computed.set(b - first);
			}
		}
		let computed_image = computed.to_disk_image(block_size);
		if computed_image != on_disk {
			mismatches += 1;
			if !computed.content_matches_disk_image(&on_disk) {
				padding_only = false;
			}
		}
	}
	if mismatches > 0 {
		let code = if padding_only { ProblemCode::Pr5BlockBitmapPadding } else { ProblemCode::Pr5BlockUsedCount };
		if fix_problem(&mut ctx.problems, code)? {
			for (gi, gd) in ctx.groups.clone().iter().enumerate() {
				let block_size = ctx.sb.block_size() as usize;
				let first = ctx.sb.first_data_block() as u64 + gi as u64 * ctx.sb.blocks_per_group as u64;
				let last = (first + ctx.sb.blocks_per_group as u64).min(ctx.sb.total_blocks as u64);
				let mut computed = crate::bitmap::Bitmap::new(last - first);
				for b in first..last {
					if ctx.block_found_map.get(b) {
						computed.set(b - first);
					}
				}
				dev.write_block(gd.block_bitmap_block as u64, &computed.to_disk_image(block_size))?;
			}
			ctx.stats.problems_fixed += 1;
		}
	}
	Ok(())
}

fn reconcile_inode_bitmap(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<(), CheckError> {
	let mut mismatches = 0u64;
	let mut padding_only = true;
	for (gi, gd) in ctx.groups.clone().iter().enumerate() {
		let block_size = ctx.sb.block_size() as usize;
		let mut on_disk = vec![0u8; block_size];
		dev.read_block(gd.inode_bitmap_block as u64, &mut on_disk)?;
		let first = gi as u64 * ctx.sb.inodes_per_group as u64 + 1;
		let last = (first + ctx.sb.inodes_per_group as u64).min(ctx.sb.total_inodes as u64 + 1);
		let mut computed = crate::bitmap::Bitmap::new(last - first);
		for i in first..last {
			if ctx.inode_used_map.get(i) {
				computed.set(i - first);
			}
		}
		if computed.to_disk_image(block_size) != on_disk {
			mismatches += 1;
			if !computed.content_matches_disk_image(&on_disk) {
				padding_only = false;
			}
		}
	}
	if mismatches > 0 {
		let code = if padding_only { ProblemCode::Pr5InodeBitmapPadding } else { ProblemCode::Pr5InodeUsedCount };
		if fix_problem(&mut ctx.problems, code)? {
			for (gi, gd) in ctx.groups.clone().iter().enumerate() {
				let block_size = ctx.sb.block_size() as usize;
				let first = gi as u64 * ctx.sb.inodes_per_group as u64 + 1;
				let last = (first + ctx.sb.inodes_per_group as u64).min(ctx.sb.total_inodes as u64 + 1);
				let mut computed = crate::bitmap::Bitmap::new(last - first);
				for i in first..last {
					if ctx.inode_used_map.get(i) {
						computed.set(i - first);
					}
				}
				dev.write_block(gd.inode_bitmap_block as u64, &computed.to_disk_image(block_size))?;
			}
			ctx.stats.problems_fixed += 1;
		}
	}
	Ok(())
}

fn reconcile_group_and_super_counts(ctx: &mut Context) -> Result<(), CheckError> {
	let blocks_per_group = ctx.sb.blocks_per_group as u64;
	let inodes_per_group = ctx.sb.inodes_per_group as u64;
	let first_data_block = ctx.sb.first_data_block() as u64;
	let total_blocks = ctx.sb.total_blocks as u64;
	let total_inodes = ctx.sb.total_inodes as u64;

	let mut total_free_blocks = 0u32;
	let mut total_free_inodes = 0u32;

	for (gi, gd) in ctx.groups.iter_mut().enumerate() {
		let bfirst = first_data_block + gi as u64 * blocks_per_group;
		let blast = (bfirst + blocks_per_group).min(total_blocks);
		let free_blocks = (bfirst..blast).filter(|&b| !ctx.block_found_map.get(b)).count() as u16;
		if gd.free_blocks_count != free_blocks {
			gd.free_blocks_count = free_blocks;
		}
		total_free_blocks += free_blocks as u32;

		let ifirst = gi as u64 * inodes_per_group + 1;
		let ilast = (ifirst + inodes_per_group).min(total_inodes + 1);
		let free_inodes = (ifirst..ilast).filter(|&i| !ctx.inode_used_map.get(i)).count() as u16;
		let used_dirs = (ifirst..ilast).filter(|&i| ctx.inode_dir_map.get(i)).count() as u16;
		if gd.free_inodes_count != free_inodes {
			gd.free_inodes_count = free_inodes;
		}
		gd.used_dirs_count = used_dirs;
		total_free_inodes += free_inodes as u32;
	}

	if ctx.sb.total_unallocated_blocks != total_free_blocks {
		if fix_problem(&mut ctx.problems, ProblemCode::Pr5FreeBlockCount)? {
			ctx.sb.total_unallocated_blocks = total_free_blocks;
			ctx.stats.problems_fixed += 1;
		}
	}
	if ctx.sb.total_unallocated_inodes != total_free_inodes {
		if fix_problem(&mut ctx.problems, ProblemCode::Pr5FreeInodeCount)? {
			ctx.sb.total_unallocated_inodes = total_free_inodes;
			ctx.stats.problems_fixed += 1;
		}
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

	fn fresh_ctx() -> (Context, MemDevice) {
		let mut sb: Superblock = unsafe { std::mem::zeroed() };
		sb.signature = crate::superblock::EXT2_SIGNATURE;
		sb.total_blocks = 64;
		sb.total_inodes = 32;
		sb.blocks_per_group = 64;
		sb.inodes_per_group = 32;
		sb.block_size_log = 2;
		sb.major_version = 1;
		sb.inode_size = 128;
		let groups = vec![GroupDescriptor { block_bitmap_block: 1, inode_bitmap_block: 2, inode_table_start_block: 3, free_blocks_count: 0, free_inodes_count: 0, used_dirs_count: 0, _padding: [0; 14] }];
		let mut dev = MemDevice::new(64, 4096);
		sb.write(&mut dev).unwrap();
		crate::group_desc::write_all(&mut dev, &sb, &groups).unwrap();
		(Context::new(sb, groups, Policy::Interactive { assume: Some(true) }), dev)
	}

	#[test]
	fn rewrites_stale_block_bitmap() {
		let (mut ctx, mut dev) = fresh_ctx();
		ctx.claim_block(10);
		ctx.claim_block(11);
		run(&mut ctx, &mut dev).unwrap();

		let mut bitmap = vec![0u8; 4096];
		dev.read_block(1, &mut bitmap).unwrap();
		assert!(bitmap[10 / 8] & (1 << (10 % 8)) != 0);
		assert!(bitmap[11 / 8] & (1 << (11 % 8)) != 0);
	}

	#[test]
	fn reconciles_group_free_counts() {
		let (mut ctx, mut dev) = fresh_ctx();
		ctx.claim_block(10);
		run(&mut ctx, &mut dev).unwrap();
		assert_eq!(ctx.groups[0].free_blocks_count, 63);
	}
}
