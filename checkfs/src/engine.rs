//! Pass ordering and run-level control flow (spec §2's control-flow line,
//! §4's per-pass ordering guarantee).

use log::info;

use crate::context::Context;
use crate::device::BlockDevice;
use crate::dirent::parse_block;
use crate::error::CheckError;
use crate::group_desc::{self, GroupDescriptor};
use crate::inode::{walk_blocks, Inode, WalkAction};
use crate::problem::Policy;
use crate::rehash::HashFn;
use crate::superblock::Superblock;
use crate::{journal, pass1, pass1_dup, pass2, pass3, pass4, pass5};

bitflags::bitflags! {
	/// Exit-code bitmask, spec §6.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ExitCode: u8 {
		const CLEAN        = 0;
		const CORRECTED    = 1;
		const REBOOT       = 2;
		const UNCORRECTED  = 4;
		const OPERATIONAL  = 8;
		const USAGE        = 16;
		const LIBRARY      = 128;
	}
}

pub struct RunOptions {
	pub policy: Policy,
	pub verbose: bool,
	pub force: bool,
}

pub struct RunReport {
	pub stats: crate::context::Stats,
	pub exit_code: ExitCode,
}

const MAX_PASS1_RESTARTS: u32 = 8;

/// Runs the full check: journal replay, then passes 1 through 5.
///
/// `hasher` supplies the HTree hash function (spec §6 boundary: the actual
/// half-MD4/TEA hash algorithms are a codec-layer concern this crate doesn't
/// implement). Without one, directories flagged for a rehash are left as-is
/// and the damage is only reported, not repaired.
pub fn run(
	dev: &mut dyn BlockDevice,
	journal_dev: Option<&mut dyn BlockDevice>,
	opts: RunOptions,
) -> Result<RunReport, CheckError> {
	run_with_hasher(dev, journal_dev, opts, None)
}

pub fn run_with_hasher(
	dev: &mut dyn BlockDevice,
	journal_dev: Option<&mut dyn BlockDevice>,
	opts: RunOptions,
	hasher: Option<&dyn HashFn>,
) -> Result<RunReport, CheckError> {
	let sb = Superblock::read(dev)?;
	if !opts.force && sb.is_valid() && sb.mount_count_since_fsck < sb.mount_count_before_fsck.max(1) {
		info!("filesystem marked clean; nothing to do (use force to check anyway)");
		return Ok(RunReport { stats: Default::default(), exit_code: ExitCode::CLEAN });
	}

	if let Some(jdev) = journal_dev {
		if sb.needs_journal_replay(sb.journal_inode) {
			let replayed = journal::replay(jdev, dev)?;
			info!("replayed {replayed} journal transaction(s)");
		}
	}

	let sb = Superblock::read(dev)?;
	let groups = group_desc::read_all(dev, &sb)?;
	validate_group_locations(&groups, &sb)?;

	let mut ctx = Context::new(sb, groups, opts.policy);
	mark_metadata_blocks_used(&mut ctx);

	let mut restarts = 0;
	let dir_blocks = loop {
		let result = pass1::run(&mut ctx, dev)?;
		if !result.restart {
			break result.dir_blocks;
		}
		restarts += 1;
		if restarts > MAX_PASS1_RESTARTS {
			return Err(CheckError::Fatal("pass1 kept restarting; giving up".into()));
		}
		ctx.block_found_map = crate::bitmap::Bitmap::new(ctx.sb.total_blocks as u64);
		ctx.inode_used_map = crate::bitmap::Bitmap::new(ctx.sb.total_inodes as u64 + 1);
		ctx.inode_dir_map = crate::bitmap::Bitmap::new(ctx.sb.total_inodes as u64 + 1);
		ctx.dup = crate::dup::DupRegistry::new();
		ctx.dir_info = crate::dir_info::DirInfoTable::new();
		ctx.stats = crate::context::Stats::default();
		mark_metadata_blocks_used(&mut ctx);
	};

	if !ctx.dup.is_empty() {
		let groups = pass1_dup::collect_dup_groups(&ctx);
		pass1_dup::run(&mut ctx, dev, &groups)?;
	}

	pass2::run(&mut ctx, dev, &dir_blocks)?;
	if let Some(hasher) = hasher {
		rebuild_flagged_dirs(&mut ctx, dev, hasher)?;
	}
	pass3::run(&mut ctx, dev)?;
	pass4::run(&mut ctx, dev)?;
	pass5::run(&mut ctx, dev)?;

	// Zero out any sectors queued for destruction (spec §4.9: bad sectors are
	// committed by writing zeros over them once the rest of the check settles,
	// never mid-pass). A no-op when nothing queued a range.
	ctx.kill_sectors.flush(dev)?;

	let mut exit_code = ExitCode::CLEAN;
	if ctx.stats.problems_fixed > 0 {
		exit_code |= ExitCode::CORRECTED;
	}
	if !ctx.problems.fs_valid {
		exit_code |= ExitCode::UNCORRECTED;
	}
	if ctx.aborted {
		exit_code |= ExitCode::OPERATIONAL;
	}

	if opts.verbose {
		info!(
			"summary: {} inodes used ({} dirs, {} regular, {} special), {} blocks used, {} problems fixed",
			ctx.stats.inodes_used, ctx.stats.directories, ctx.stats.regular_files, ctx.stats.special_files, ctx.stats.blocks_used, ctx.stats.problems_fixed
		);
	}

	Ok(RunReport { stats: ctx.stats, exit_code })
}

/// Rebuilds the HTree index for every directory pass 2 flagged as damaged.
/// Only rewrites in place: if the rebuilt layout needs more blocks than the
/// directory already has, the rebuild is skipped and left for a future run
/// (expanding a directory's indirect-block tree here would duplicate pass 3's
/// allocation machinery for a case that's rare in practice).
fn rebuild_flagged_dirs(ctx: &mut Context, dev: &mut dyn BlockDevice, hasher: &dyn HashFn) -> Result<(), CheckError> {
	let flagged: Vec<u32> = ctx.dx_dir_info.iter().filter(|d| d.needs_rebuild).map(|d| d.ino).collect();
	if flagged.is_empty() {
		return Ok(());
	}
	let block_size = ctx.sb.block_size() as usize;
	let use_file_type = ctx.sb.incompat_features().contains(crate::superblock::IncompatFeatures::FILETYPE);
	let hash_version = ctx.sb.def_hash_version;

	for ino in flagged {
		let mut inode = Inode::read(dev, ino, &ctx.sb, &ctx.groups)?;
		let parent = ctx.dir_info.get(ino).map(|d| d.parent).unwrap_or(0);

		let mut existing_blocks = Vec::new();
		let mut entries = Vec::new();
		walk_blocks(dev, &mut inode, false, |visit| {
			if visit.depth == 0 && visit.block != 0 {
				existing_blocks.push(visit.block);
				let mut buf = vec![0u8; block_size];
				dev.read_block(visit.block as u64, &mut buf)?;
				let (block_entries, _) = parse_block(&buf);
				entries.extend(block_entries.into_iter().filter(|e| !e.is_deleted() && !e.is_dot() && !e.is_dotdot()));
			}
			Ok(WalkAction::Continue)
		})?;

		let rebuilt = crate::rehash::rebuild(ino, parent, entries, hasher, hash_version, block_size, use_file_type);
		let needed = 1 + rebuilt.leaf_blocks.len() + rebuilt.intermediate_blocks.len();
		if needed > existing_blocks.len() {
			log::warn!("inode {ino}: rebuilt HTree needs {needed} blocks but only {} are allocated; skipping", existing_blocks.len());
			continue;
		}

		let mut slots = existing_blocks.into_iter();
		let root_block = slots.next().unwrap();
		dev.write_block(root_block as u64, &rebuilt.root_block)?;
		for leaf in &rebuilt.leaf_blocks {
			dev.write_block(slots.next().unwrap() as u64, leaf)?;
		}
		for node in &rebuilt.intermediate_blocks {
			dev.write_block(slots.next().unwrap() as u64, node)?;
		}
		ctx.stats.problems_fixed += 1;
	}
	Ok(())
}

/// Marks the superblock, group descriptor table, and every group's bitmap and
/// inode-table blocks as in use, before pass 1 ever looks at an inode. Without
/// this, pass 1 only ever claims blocks it finds hanging off a file or
/// directory, so the metadata blocks themselves would look "free" to pass 3's
/// allocator and pass 5's bitmap reconciliation.
fn mark_metadata_blocks_used(ctx: &mut Context) {
	let bs = ctx.sb.block_size() as u64;

	let sb_block = crate::superblock::SUPERBLOCK_OFFSET / bs;
	claim_and_count(ctx, sb_block);

	let gdt_bytes = ctx.groups.len() * std::mem::size_of::<GroupDescriptor>();
	let gdt_blocks = crate::util::ceil_division(gdt_bytes as u32, bs as u32).max(1) as u64;
	let gdt_start = group_desc::bgdt_offset(&ctx.sb) / bs;
	for b in gdt_start..gdt_start + gdt_blocks {
		claim_and_count(ctx, b);
	}

	let inode_table_bytes = ctx.sb.inodes_per_group as u64 * ctx.sb.inode_size() as u64;
	let inode_table_blocks = (inode_table_bytes + bs - 1) / bs;

	for gd in ctx.groups.clone() {
		claim_and_count(ctx, gd.block_bitmap_block as u64);
		claim_and_count(ctx, gd.inode_bitmap_block as u64);
		for b in 0..inode_table_blocks {
			claim_and_count(ctx, gd.inode_table_start_block as u64 + b);
		}
	}
}

fn claim_and_count(ctx: &mut Context, block: u64) {
	if !ctx.claim_block(block) {
		ctx.stats.blocks_used += 1;
	}
}

fn validate_group_locations(groups: &[GroupDescriptor], sb: &Superblock) -> Result<(), CheckError> {
	for (i, gd) in groups.iter().enumerate() {
		if !group_desc::locations_in_range(gd, i as u32, sb) {
			return Err(CheckError::Corrupt(format!("group {i}'s bitmap/table location falls outside its own range")));
		}
	}
	Ok(())
}
