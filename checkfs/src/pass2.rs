//! Pass 2 — directory validation (spec §4.3).

use log::info;

use crate::context::Context;
use crate::device::BlockDevice;
use crate::dirent::{parse_block, write_block, DirEntry, DirentDefect, FileType};
use crate::error::CheckError;
use crate::inode::{Inode, ModeType};
use crate::pass1::{DirBlockEntry, ROOT_INODE};
use crate::problem::{fix_problem, ProblemCode};
use crate::superblock::Superblock;

/// Runs pass 2 over every directory block pass 1 recorded, in block-number
/// order within each directory (already guaranteed by pass 1's ascending
/// logical-index traversal).
pub fn run(ctx: &mut Context, dev: &mut dyn BlockDevice, dir_blocks: &[DirBlockEntry]) -> Result<(), CheckError> {
	info!("pass2: validating {} directory block(s)", dir_blocks.len());
	let use_file_type = ctx.sb.incompat_features().contains(crate::superblock::IncompatFeatures::FILETYPE);
	let block_size = ctx.sb.block_size() as usize;

	for entry in dir_blocks {
		let block_num = if entry.block == 0 {
			match fill_hole_block(ctx, dev, entry, block_size)? {
				Some(b) => b,
				None => continue,
			}
		} else {
			entry.block
		};

		let mut block = vec![0u8; block_size];
		dev.read_block(block_num as u64, &mut block)?;

		let (mut entries, defect) = parse_block(&block);
		if let Some((offset, kind)) = defect {
			if matches!(kind, DirentDefect::BadRecLen) {
				if fix_problem(&mut ctx.problems, ProblemCode::Pr2DirCorrupted)? {
					let remaining = (block_size - offset) as u16;
					entries.push(DirEntry::empty(remaining, offset));
					ctx.stats.problems_fixed += 1;
				}
				if ctx.dx_dir_info.get(entry.ino).is_some() {
					fix_problem(&mut ctx.problems, ProblemCode::Pr6HtreeDamaged)?;
					ctx.dx_dir_info.mark_needs_rebuild(entry.ino);
				}
			}
		}

		let mut changed = false;
		changed |= ensure_dot_entries(ctx, entry.ino, entry.blockcnt, &mut entries, use_file_type)?;

		if entry.blockcnt == 0 {
			validate_entries(ctx, dev, entry.ino, &mut entries[2.min(entries.len())..], use_file_type, &mut changed)?;
		} else {
			validate_entries(ctx, dev, entry.ino, &mut entries[..], use_file_type, &mut changed)?;
		}

		let total: usize = entries.iter().map(|e| e.rec_len as usize).sum();
		if total < block_size {
			if let Some(last) = entries.last_mut() {
				last.rec_len += (block_size - total) as u16;
			}
			changed = true;
		}

		if changed {
			write_block(&mut block, &entries, use_file_type)?;
			dev.write_block(block_num as u64, &block)?;
		}
	}
	Ok(())
}

/// Allocates a replacement for a directory's `blk == 0` hole (spec §4.3's
/// hole-filling step). Only handles direct-block holes; a hole deeper in the
/// indirect tree is logged and left unfilled (so rare in practice that
/// duplicating pass 3's allocation machinery for it here isn't worth it).
fn fill_hole_block(ctx: &mut Context, dev: &mut dyn BlockDevice, entry: &DirBlockEntry, block_size: usize) -> Result<Option<u32>, CheckError> {
	if entry.blockcnt as usize >= crate::inode::NDIR_BLOCKS {
		log::warn!("inode {}: hole at block index {} has no allocation path; leaving unfilled", entry.ino, entry.blockcnt);
		return Ok(None);
	}
	if !fix_problem(&mut ctx.problems, ProblemCode::Pr2AllocDirBlock)? {
		return Ok(None);
	}
	let new_block = allocate_block(ctx)?;
	let mut inode = Inode::read(dev, entry.ino, &ctx.sb, &ctx.groups)?;
	inode.block[entry.blockcnt as usize] = new_block;
	inode.write(dev, entry.ino, &ctx.sb, &ctx.groups)?;
	ctx.claim_block(new_block as u64);
	let zeroed = vec![0u8; block_size];
	dev.write_block(new_block as u64, &zeroed)?;
	ctx.stats.problems_fixed += 1;
	Ok(Some(new_block))
}

fn allocate_block(ctx: &Context) -> Result<u32, CheckError> {
	let first = ctx.sb.first_data_block() as u64;
	(first..ctx.sb.total_blocks as u64)
		.find(|&b| !ctx.block_found_map.get(b))
		.map(|b| b as u32)
		.ok_or(CheckError::NoSpace("block"))
}

/// Ensures the first (and, for the directory's first block, second) entries
/// are `.`/`..`, synthesizing them if missing. Returns whether anything changed.
fn ensure_dot_entries(
	ctx: &mut Context,
	ino: u32,
	blockcnt: u64,
	entries: &mut Vec<DirEntry>,
	use_file_type: bool,
) -> Result<bool, CheckError> {
	if blockcnt != 0 {
		return Ok(false);
	}
	let mut changed = false;

	let needs_dot = entries.first().map(|e| !e.is_dot() || e.inode != ino).unwrap_or(true);
	if needs_dot {
		if fix_problem(&mut ctx.problems, ProblemCode::Pr2MissingDot)? {
			let available = entries.first().map(|e| e.rec_len).unwrap_or(12);
			let dot_len = DirEntry::min_rec_len(1).min(available);
			let leftover = available - dot_len;
			if entries.is_empty() {
				entries.push(DirEntry { inode: ino, rec_len: dot_len, file_type: if use_file_type { FileType::DIR.bits() } else { 0 }, name: b".".to_vec(), offset: 0 });
			} else {
				let offset = entries[0].offset;
				entries[0] = DirEntry { inode: ino, rec_len: dot_len, file_type: if use_file_type { FileType::DIR.bits() } else { 0 }, name: b".".to_vec(), offset };
				if leftover > 0 {
					// `.` only needs 12 bytes; whatever the salvaged or
					// mis-sized original record left over becomes a fresh
					// slot so `..` (or whatever follows) still fits inside
					// the block's total record length.
					entries.insert(1, DirEntry::empty(leftover, offset + dot_len as usize));
				}
			}
			changed = true;
			ctx.stats.problems_fixed += 1;
		}
	}

	// `.` is a link from the directory to itself; count it once its slot is
	// settled, whether or not it needed synthesizing above.
	if entries.first().map(|e| e.is_dot() && e.inode == ino).unwrap_or(false) {
		ctx.icount.increment(ino);
	}

	let needs_dotdot = entries.get(1).map(|e| !e.is_dotdot()).unwrap_or(true);
	if needs_dotdot {
		if fix_problem(&mut ctx.problems, ProblemCode::Pr2MissingDotDot)? {
			if entries.len() < 2 {
				entries.push(DirEntry { inode: ROOT_INODE, rec_len: 12, file_type: if use_file_type { FileType::DIR.bits() } else { 0 }, name: b"..".to_vec(), offset: 0 });
			} else {
				entries[1] = DirEntry { inode: entries[1].inode.max(ROOT_INODE), rec_len: entries[1].rec_len, file_type: if use_file_type { FileType::DIR.bits() } else { 0 }, name: b"..".to_vec(), offset: 0 };
			}
			changed = true;
			ctx.stats.problems_fixed += 1;
		}
	}
	// `..` is a link from the directory to its parent, wherever that record
	// ended up; record it the same way regardless of whether it was already
	// correct or just got synthesized above.
	if let Some(dotdot) = entries.get(1).filter(|e| e.is_dotdot()) {
		ctx.dir_info.set_dotdot(ino, dotdot.inode);
		ctx.icount.increment(dotdot.inode);
	}

	Ok(changed)
}

fn validate_entries(
	ctx: &mut Context,
	dev: &mut dyn BlockDevice,
	containing_ino: u32,
	entries: &mut [DirEntry],
	use_file_type: bool,
	changed: &mut bool,
) -> Result<(), CheckError> {
	for e in entries.iter_mut() {
		if e.is_deleted() {
			continue;
		}

		if e.name.is_empty() {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr2NullName)? {
				*e = DirEntry::empty(e.rec_len, e.offset);
				*changed = true;
			}
			continue;
		}
		if e.name.contains(&b'/') || e.name.contains(&0) {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr2BadName)? {
				*e = DirEntry::empty(e.rec_len, e.offset);
				*changed = true;
			}
			continue;
		}
		if e.inode == 0 || e.inode as usize > ctx.sb.total_inodes as usize {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr2BadInode)? {
				*e = DirEntry::empty(e.rec_len, e.offset);
				*changed = true;
			}
			continue;
		}
		if !ctx.inode_used_map.get(e.inode as u64) {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr2BadInode)? {
				*e = DirEntry::empty(e.rec_len, e.offset);
				*changed = true;
			}
			continue;
		}
		if e.inode == ROOT_INODE {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr2LinkRoot)? {
				*e = DirEntry::empty(e.rec_len, e.offset);
				*changed = true;
			}
			continue;
		}

		let target = Inode::read(dev, e.inode, &ctx.sb, &ctx.groups)?;

		if inode_is_bad(&target, &ctx.sb) {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr2BadInode)? {
				*e = DirEntry::empty(e.rec_len, e.offset);
				*changed = true;
			}
			continue;
		}

		let expected_type = file_type_of(&target);
		if use_file_type && e.file_type != expected_type.bits() {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr2SetFileType)? {
				e.file_type = expected_type.bits();
				*changed = true;
			}
		}

		if target.is_dir() {
			if ctx.dir_info.get(e.inode).map(|d| d.parent != 0).unwrap_or(false) {
				if fix_problem(&mut ctx.problems, ProblemCode::Pr2LinkDir)? {
					*e = DirEntry::empty(e.rec_len, e.offset);
					*changed = true;
					continue;
				}
			} else {
				ctx.dir_info.set_parent(e.inode, containing_ino);
			}
		}

		ctx.icount.increment(e.inode);
	}
	Ok(())
}

/// Mirrors `process_bad_inode`'s field sanity checks (spec §4.3 step 8): a
/// directory entry can point at an inode that's internally nonsensical even
/// though it passed the earlier "is it used/in range" checks.
fn inode_is_bad(inode: &Inode, sb: &Superblock) -> bool {
	if inode.mode_type() == ModeType::empty() {
		return true;
	}
	if inode.fragment_addr != 0 {
		return true;
	}
	if inode.dir_acl != 0 && !inode.is_dir() {
		return true;
	}
	if inode.file_acl != 0 && inode.file_acl as u64 >= sb.total_blocks as u64 {
		return true;
	}
	false
}

fn file_type_of(inode: &Inode) -> FileType {
	match inode.mode_type() {
		t if t == crate::inode::ModeType::DIR => FileType::DIR,
		t if t == crate::inode::ModeType::REG => FileType::REG,
		t if t == crate::inode::ModeType::LNK => FileType::SYMLINK,
		t if t == crate::inode::ModeType::CHR => FileType::CHRDEV,
		t if t == crate::inode::ModeType::BLK => FileType::BLKDEV,
		t if t == crate::inode::ModeType::FIFO => FileType::FIFO,
		t if t == crate::inode::ModeType::SOCK => FileType::SOCK,
		_ => FileType::UNKNOWN,
	}
}
