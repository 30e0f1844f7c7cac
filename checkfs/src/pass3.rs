//! Pass 3 — connectivity (spec §4.4).

use log::info;

use crate::bitmap::Bitmap;
use crate::context::Context;
use crate::device::BlockDevice;
use crate::dirent::{new_dot_block, parse_block, write_block, DirEntry, FileType};
use crate::error::CheckError;
use crate::inode::Inode;
use crate::pass1::ROOT_INODE;
use crate::problem::{fix_problem, ProblemCode};

const LOOP_DEPTH_LIMIT: u32 = 2048;

/// Runs pass 3: traces every directory's parent chain to the root,
/// reconnecting anything that doesn't, then fixes up stale `..` entries.
pub fn run(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<(), CheckError> {
	ensure_root(ctx, dev)?;

	let total_inodes = ctx.sb.total_inodes as u64;
	let mut done = Bitmap::new(total_inodes + 1);
	done.set(ROOT_INODE as u64);

	let dirs: Vec<u32> = ctx.dir_info.iter().map(|d| d.ino).collect();
	info!("pass3: tracing {} director{} to root", dirs.len(), if dirs.len() == 1 { "y" } else { "ies" });

	for ino in dirs {
		if done.get(ino as u64) {
			continue;
		}
		trace_chain(ctx, dev, &mut done, ino)?;
	}

	fix_dotdot_entries(ctx, dev)?;
	Ok(())
}

fn trace_chain(ctx: &mut Context, dev: &mut dyn BlockDevice, done: &mut Bitmap, start: u32) -> Result<(), CheckError> {
	let mut chain = Vec::new();
	let mut cur = start;
	let mut depth = 0u32;
	let mut loop_guard: Option<Bitmap> = None;

	loop {
		if done.get(cur as u64) {
			break;
		}
		chain.push(cur);
		depth += 1;

		if depth > LOOP_DEPTH_LIMIT {
			let guard = loop_guard.get_or_insert_with(|| Bitmap::new(ctx.sb.total_inodes as u64 + 1));
			if guard.get(cur as u64) {
				reconnect(ctx, dev, cur)?;
				break;
			}
			guard.set(cur as u64);
		}

		let parent = ctx.dir_info.get(cur).map(|d| d.parent).unwrap_or(0);
		if parent == 0 {
			if fix_problem(&mut ctx.problems, ProblemCode::Pr3UnconnectedDir)? {
				reconnect(ctx, dev, cur)?;
			}
			break;
		}
		cur = parent;
	}

	for ino in chain {
		done.set(ino as u64);
	}
	Ok(())
}

/// Links `ino` into `/lost+found` under the name `#<ino>` (spec §4.4's
/// reconnect procedure — shared with pass 4's unattached-inode handling).
pub fn reconnect(ctx: &mut Context, dev: &mut dyn BlockDevice, ino: u32) -> Result<(), CheckError> {
	let lf_ino = ensure_lost_and_found(ctx, dev)?;
	let name = format!("#{ino}");

	let inode = Inode::read(dev, ino, &ctx.sb, &ctx.groups)?;
	let file_type = if inode.is_dir() { FileType::DIR } else { FileType::REG };
	let use_file_type = ctx.sb.incompat_features().contains(crate::superblock::IncompatFeatures::FILETYPE);

	insert_into_dir(ctx, dev, lf_ino, ino, name.as_bytes(), file_type, use_file_type)?;

	if inode.is_dir() {
		ctx.dir_info.set_parent(ino, lf_ino);
	}
	ctx.icount.increment(ino);
	Ok(())
}

/// Tries to carve a `needed`-byte record for `ino`/`name` out of `entries`,
/// either by reusing a deleted slot or by splitting a live entry's trailing
/// slack (e.g. a freshly created directory's `..`, which absorbs the rest of
/// its block). Returns whether a slot was found.
fn try_insert_entry(entries: &mut Vec<DirEntry>, ino: u32, name: &[u8], ft: FileType, use_file_type: bool) -> bool {
	let needed = DirEntry::min_rec_len(name.len());

	if let Some(slot) = entries.iter_mut().find(|e| e.is_deleted() && e.rec_len >= needed) {
		let leftover = slot.rec_len - needed;
		let offset = slot.offset;
		slot.inode = ino;
		slot.rec_len = needed;
		slot.file_type = if use_file_type { ft.bits() } else { 0 };
		slot.name = name.to_vec();
		if leftover > 0 {
			entries.push(DirEntry::empty(leftover, offset + needed as usize));
			entries.sort_by_key(|e| e.offset);
		}
		return true;
	}

	if let Some(idx) = entries.iter().position(|e| !e.is_deleted() && e.rec_len >= DirEntry::min_rec_len(e.name.len()) + needed) {
		let own_len = DirEntry::min_rec_len(entries[idx].name.len());
		let offset = entries[idx].offset;
		let new_offset = offset + own_len as usize;
		let slack = entries[idx].rec_len - own_len;
		entries[idx].rec_len = own_len;
		entries.insert(
			idx + 1,
			DirEntry {
				inode: ino,
				rec_len: needed,
				file_type: if use_file_type { ft.bits() } else { 0 },
				name: name.to_vec(),
				offset: new_offset,
			},
		);
		let remaining = slack - needed;
		if remaining > 0 {
			entries.insert(idx + 2, DirEntry::empty(remaining, new_offset + needed as usize));
		}
		return true;
	}

	false
}

/// Inserts `ino`/`name` into directory `dir_ino`, splitting a slot out of an
/// existing block if there's room, or growing the directory by one block
/// (spec §4.4's `/lost+found` expansion) if there isn't.
fn insert_into_dir(
	ctx: &mut Context,
	dev: &mut dyn BlockDevice,
	dir_ino: u32,
	ino: u32,
	name: &[u8],
	ft: FileType,
	use_file_type: bool,
) -> Result<(), CheckError> {
	let block_size = ctx.sb.block_size() as usize;
	let mut dir_inode = Inode::read(dev, dir_ino, &ctx.sb, &ctx.groups)?;

	for i in 0..crate::inode::NDIR_BLOCKS {
		let blk = dir_inode.block[i];
		if blk == 0 {
			continue;
		}
		let mut block = vec![0u8; block_size];
		dev.read_block(blk as u64, &mut block)?;
		let (mut entries, _) = parse_block(&block);
		if try_insert_entry(&mut entries, ino, name, ft, use_file_type) {
			write_block(&mut block, &entries, use_file_type)?;
			dev.write_block(blk as u64, &block)?;
			return Ok(());
		}
	}

	// Every existing block is full; grow the directory by one block.
	if !fix_problem(&mut ctx.problems, ProblemCode::Pr3ExpandLf)? {
		return Err(CheckError::NoSpace("directory entry"));
	}
	let slot = (0..crate::inode::NDIR_BLOCKS)
		.find(|&i| dir_inode.block[i] == 0)
		.ok_or(CheckError::NoSpace("directory block pointer"))?;
	let new_block = find_free_block(ctx)?;

	let mut entries = vec![DirEntry::empty(block_size as u16, 0)];
	if !try_insert_entry(&mut entries, ino, name, ft, use_file_type) {
		return Err(CheckError::NoSpace("directory entry"));
	}
	let mut block = vec![0u8; block_size];
	write_block(&mut block, &entries, use_file_type)?;
	dev.write_block(new_block as u64, &block)?;

	dir_inode.block[slot] = new_block;
	dir_inode.size_low += block_size as u32;
	dir_inode.blocks_512 += block_size as u32 / 512;
	dir_inode.write(dev, dir_ino, &ctx.sb, &ctx.groups)?;

	ctx.claim_block(new_block as u64);
	ctx.stats.problems_fixed += 1;
	Ok(())
}

/// Creates a fresh root directory if inode 2 is missing or not a directory
/// (spec §4.4's root-repair step).
fn ensure_root(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<(), CheckError> {
	let root = Inode::read(dev, ROOT_INODE, &ctx.sb, &ctx.groups)?;
	if root.is_dir() && ctx.inode_used_map.get(ROOT_INODE as u64) {
		return Ok(());
	}
	if !fix_problem(&mut ctx.problems, ProblemCode::Pr3NoRoot)? {
		return Err(CheckError::Fatal("root inode is not a valid directory and operator declined to create one".into()));
	}

	let block_size = ctx.sb.block_size() as usize;
	let new_block = find_free_block(ctx)?;
	let mut fresh = Inode::default();
	fresh.mode = 0x4000 | 0o755;
	fresh.links_count = 2;
	fresh.block[0] = new_block;
	fresh.size_low = block_size as u32;
	fresh.blocks_512 = block_size as u32 / 512;
	fresh.write(dev, ROOT_INODE, &ctx.sb, &ctx.groups)?;

	let use_file_type = ctx.sb.incompat_features().contains(crate::superblock::IncompatFeatures::FILETYPE);
	let dot_block = new_dot_block(block_size, ROOT_INODE, ROOT_INODE, use_file_type);
	dev.write_block(new_block as u64, &dot_block)?;

	ctx.claim_block(new_block as u64);
	ctx.inode_used_map.set(ROOT_INODE as u64);
	ctx.inode_dir_map.set(ROOT_INODE as u64);
	if ctx.dir_info.get(ROOT_INODE).is_none() {
		ctx.dir_info.add(ROOT_INODE);
	}
	ctx.dir_info.set_parent(ROOT_INODE, ROOT_INODE);
	ctx.dir_info.set_dotdot(ROOT_INODE, ROOT_INODE);

	// Root's own `.`/`..` both point at itself; pass 2 never got a chance to
	// credit either since it didn't exist yet.
	ctx.icount.increment(ROOT_INODE);
	ctx.icount.increment(ROOT_INODE);

	Ok(())
}

fn ensure_lost_and_found(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<u32, CheckError> {
	if let Some(ino) = ctx.lost_and_found_ino {
		return Ok(ino);
	}

	// Search root's directory block for an existing /lost+found entry.
	let root = Inode::read(dev, ROOT_INODE, &ctx.sb, &ctx.groups)?;
	let block_size = ctx.sb.block_size() as usize;
	if root.block[0] != 0 {
		let mut block = vec![0u8; block_size];
		dev.read_block(root.block[0] as u64, &mut block)?;
		let (entries, _) = parse_block(&block);
		if let Some(e) = entries.iter().find(|e| e.name == b"lost+found") {
			ctx.lost_and_found_ino = Some(e.inode);
			return Ok(e.inode);
		}
	}

	if !fix_problem(&mut ctx.problems, ProblemCode::Pr3NoLfDir)? {
		return Err(CheckError::Fatal("no /lost+found and operator declined to create one".into()));
	}

	let new_ino = find_free_inode(ctx)?;
	let new_block = find_free_block(ctx)?;
	let mut lf = Inode::default();
	lf.mode = 0x4000 | 0o700;
	lf.links_count = 2;
	lf.block[0] = new_block;
	lf.size_low = block_size as u32;
	lf.blocks_512 = block_size as u32 / 512;
	lf.write(dev, new_ino, &ctx.sb, &ctx.groups)?;

	let use_file_type = ctx.sb.incompat_features().contains(crate::superblock::IncompatFeatures::FILETYPE);
	let dot_block = new_dot_block(block_size, new_ino, ROOT_INODE, use_file_type);
	dev.write_block(new_block as u64, &dot_block)?;

	ctx.claim_block(new_block as u64);
	ctx.inode_used_map.set(new_ino as u64);
	ctx.inode_dir_map.set(new_ino as u64);
	ctx.dir_info.add(new_ino);
	ctx.dir_info.set_parent(new_ino, ROOT_INODE);
	ctx.dir_info.set_dotdot(new_ino, ROOT_INODE);
	ctx.lost_and_found_ino = Some(new_ino);

	// Pass 2 already ran, so this directory's own `.`/`..` never went
	// through its icount bookkeeping; account for both by hand.
	ctx.icount.increment(new_ino);
	ctx.icount.increment(ROOT_INODE);

	link_into_root(ctx, dev, new_ino, b"lost+found", FileType::DIR)?;
	ctx.icount.increment(new_ino);
	Ok(new_ino)
}

fn link_into_root(ctx: &mut Context, dev: &mut dyn BlockDevice, ino: u32, name: &[u8], ft: FileType) -> Result<(), CheckError> {
	let use_file_type = ctx.sb.incompat_features().contains(crate::superblock::IncompatFeatures::FILETYPE);
	insert_into_dir(ctx, dev, ROOT_INODE, ino, name, ft, use_file_type)
}

fn fix_dotdot_entries(ctx: &mut Context, dev: &mut dyn BlockDevice) -> Result<(), CheckError> {
	let rows: Vec<_> = ctx.dir_info.iter().map(|d| (d.ino, d.dotdot, d.parent)).collect();
	for (ino, dotdot, parent) in rows {
		if parent == 0 || dotdot == parent {
			continue;
		}
		if fix_problem(&mut ctx.problems, ProblemCode::Pr3BadDotDot)? {
			rewrite_dotdot(ctx, dev, ino, parent)?;
			// `..` already credited `dotdot`'s icount when pass 2 read it;
			// move that credit to the corrected parent instead of adding a
			// second one.
			ctx.icount.decrement(dotdot);
			ctx.icount.increment(parent);
			ctx.stats.problems_fixed += 1;
		}
	}
	Ok(())
}

fn rewrite_dotdot(ctx: &mut Context, dev: &mut dyn BlockDevice, ino: u32, new_parent: u32) -> Result<(), CheckError> {
	let inode = Inode::read(dev, ino, &ctx.sb, &ctx.groups)?;
	if inode.block[0] == 0 {
		return Ok(());
	}
	let block_size = ctx.sb.block_size() as usize;
	let mut block = vec![0u8; block_size];
	dev.read_block(inode.block[0] as u64, &mut block)?;
	let (mut entries, _) = parse_block(&block);
	let use_file_type = ctx.sb.incompat_features().contains(crate::superblock::IncompatFeatures::FILETYPE);
	if let Some(dotdot) = entries.iter_mut().find(|e| e.is_dotdot()) {
		dotdot.inode = new_parent;
		dotdot.file_type = if use_file_type { FileType::DIR.bits() } else { 0 };
	}
	write_block(&mut block, &entries, use_file_type)?;
	dev.write_block(inode.block[0] as u64, &block)?;
	ctx.dir_info.set_dotdot(ino, new_parent);
	Ok(())
}

fn find_free_inode(ctx: &Context) -> Result<u32, CheckError> {
	(crate::pass1::FIRST_NON_RESERVED_INODE..=ctx.sb.total_inodes)
		.find(|&i| !ctx.inode_used_map.get(i as u64))
		.ok_or(CheckError::NoSpace("inode"))
}

fn find_free_block(ctx: &Context) -> Result<u32, CheckError> {
	(ctx.sb.first_data_block() as u64..ctx.sb.total_blocks as u64)
		.find(|&b| !ctx.block_found_map.get(b))
		.map(|b| b as u32)
		.ok_or(CheckError::NoSpace("block"))
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
		let groups = vec![GroupDescriptor::default()];
		let mut dev = MemDevice::new(64, 4096);
		sb.write(&mut dev).unwrap();
		crate::group_desc::write_all(&mut dev, &sb, &groups).unwrap();
		(Context::new(sb, groups, Policy::Interactive { assume: Some(true) }), dev)
	}

	#[test]
	fn orphan_directory_reconnects_to_lost_and_found() {
		let (mut ctx, mut dev) = fresh_ctx();

		let mut root = Inode::default();
		root.mode = 0x4000 | 0o755;
		root.links_count = 2;
		root.block[0] = 10;
		root.write(&mut dev, ROOT_INODE, &ctx.sb, &ctx.groups).unwrap();
		let mut root_block = vec![0u8; 4096];
		root_block[4..6].copy_from_slice(&4096u16.to_le_bytes());
		dev.write_block(10, &root_block).unwrap();
		ctx.inode_used_map.set(ROOT_INODE as u64);
		ctx.claim_block(10);

		let mut orphan = Inode::default();
		orphan.mode = 0x4000 | 0o755;
		orphan.links_count = 2;
		orphan.block[0] = 20;
		orphan.write(&mut dev, 17, &ctx.sb, &ctx.groups).unwrap();
		ctx.inode_used_map.set(17);
		ctx.claim_block(20);
		ctx.dir_info.add(17);

		run(&mut ctx, &mut dev).unwrap();
		assert!(ctx.lost_and_found_ino.is_some());
		let lf = ctx.dir_info.get(ctx.lost_and_found_ino.unwrap()).unwrap();
		assert_eq!(lf.parent, ROOT_INODE);
	}
}
