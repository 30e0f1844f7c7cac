//! The problem/prompt engine: a static catalog of known inconsistencies plus
//! the `fix_problem` contract that decides, for each one, whether to ask the
//! operator, apply a canned default, or abort.
//!
//! Grounded directly on `e2fsck/problem.c`'s `problem_table` / `fix_problem`:
//! a flat data table indexed by an enum instead of a linear array keyed by an
//! opaque integer code, per Design Notes §9.

use std::collections::HashMap;

use log::debug;

use crate::error::CheckError;

/// How the operator wants problems resolved (spec §6: `-p`/`-y`/`-n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
	/// `-p`: fix anything safe automatically, halt on anything that isn't.
	Preen,
	/// Interactive, or `-y`/`-n` forcing every answer one way.
	Interactive { assume: Option<bool> },
}

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ProblemFlags: u16 {
		/// Safe to fix without asking when preening.
		const PREEN_OK    = 0x0001;
		/// A "no" answer does not mark the filesystem invalid.
		const NO_OK       = 0x0002;
		/// Default answer is "no" instead of "yes".
		const NO_DEFAULT  = 0x0004;
		/// Informational only; no prompt is shown.
		const MSG_ONLY    = 0x0008;
		/// Refusing to fix this makes the run unsafe to continue.
		const FATAL       = 0x0080;
		/// After resolving this one, immediately ask a follow-up code.
		const AFTER_CODE  = 0x0100;
		/// Suppress the message text while preening (still apply the default).
		const PREEN_NOMSG = 0x0200;
		/// Don't fold this answer into its latch's cached answer.
		const NOCOLLATE   = 0x0400;
		/// Suppress the message in `-n` (read-only check) mode.
		const NO_NOMSG    = 0x0800;
		/// While preening, answer "no" instead of the catalog default.
		const PREEN_NO    = 0x1000;
	}
}

/// What question is asked for a given problem (spec §4.1's prompt catalog).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
	None,
	Fix,
	Clear,
	Relocate,
	Allocate,
	Expand,
	Connect,
	Create,
	Salvage,
	Truncate,
	ClearInode,
	Abort,
	Split,
	Continue,
	Clone,
	Delete,
	Suppress,
	Unlink,
}

impl Prompt {
	pub fn as_str(&self) -> &'static str {
		match self {
			Prompt::None => "(no prompt)",
			Prompt::Fix => "Fix",
			Prompt::Clear => "Clear",
			Prompt::Relocate => "Relocate",
			Prompt::Allocate => "Allocate",
			Prompt::Expand => "Expand",
			Prompt::Connect => "Connect to lost+found",
			Prompt::Create => "Create",
			Prompt::Salvage => "Salvage",
			Prompt::Truncate => "Truncate",
			Prompt::ClearInode => "Clear inode",
			Prompt::Abort => "Abort",
			Prompt::Split => "Split",
			Prompt::Continue => "Continue",
			Prompt::Clone => "Clone duplicate/bad blocks",
			Prompt::Delete => "Delete file",
			Prompt::Suppress => "Suppress messages",
			Prompt::Unlink => "Unlink",
		}
	}
}

/// A group of related problems that should only be asked about once per run
/// (spec §4.1: "Latches").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Latch {
	BlockBitmapReloc,
	InodeBitmapReloc,
	InodeTableReloc,
	IllegalBlock,
	BadBlockInode,
	OptimizeDir,
	CheckUnattached,
}

/// One catalog entry. `message` is a short static description (the templated
/// `%b`/`%i`-style substitution the teacher's locale layer does is this
/// repo's §6 boundary, not reimplemented here).
#[derive(Debug, Clone, Copy)]
pub struct ProblemInfo {
	pub code: ProblemCode,
	pub message: &'static str,
	pub prompt: Prompt,
	pub flags: ProblemFlags,
	pub latch: Option<Latch>,
	/// Problem to resolve immediately afterward when `ProblemFlags::AFTER_CODE`
	/// is set and the answer to this one was yes.
	pub after: Option<ProblemCode>,
}

macro_rules! problem_codes {
	($($variant:ident),+ $(,)?) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum ProblemCode { $($variant),+ }
	};
}

problem_codes! {
	// Pass 0 / pre-pass1: superblock & group descriptors
	Pr0SbCorrupt,
	Pr0FsSizeWrong,
	Pr0BlocksPerGroup,
	Pr0FirstDataBlock,
	Pr0AddUuid,
	Pr0BbNotGroup,
	Pr0IbNotGroup,
	Pr0ItableNotGroup,
	Pr0FreeBlockCount,
	Pr0FreeInodeCount,
	// Pass 1: inode/block scan
	Pr1ZeroLengthDir,
	Pr1BadIMode,
	Pr1SetDtime,
	Pr1ZeroDtime,
	Pr1BadIBlocks,
	Pr1IllegalBlockNum,
	Pr1TooManyBadBlocks,
	Pr1ResIBadMode,
	Pr1SetImagic,
	Pr1FileAclBad,
	Pr1DirAclBad,
	Pr1FragBlock,
	Pr1FsizeBad,
	// Pass 1B-1D: duplicate blocks
	Pr1bDupBlock,
	Pr1bDupBlockHeader,
	Pr1cPassHeader,
	Pr1dDupFile,
	Pr1dDupFileListing,
	Pr1dClone,
	Pr1dDeleteFile,
	// Pass 2: directories
	Pr2BadInode,
	Pr2BadName,
	Pr2MissingDot,
	Pr2MissingDotDot,
	Pr2LinkDir,
	Pr2LinkRoot,
	Pr2LinkDot,
	Pr2DupDot,
	Pr2DupDotDot,
	Pr2FileAcl,
	Pr2SetFileType,
	Pr2BadFileType,
	Pr2NullName,
	Pr2DirCorrupted,
	Pr2AllocDirBlock,
	// Pass 3: connectivity
	Pr3NoRoot,
	Pr3ExpandLf,
	Pr3UnconnectedDir,
	Pr3BadDotDot,
	Pr3MissingDotDot,
	Pr3NoLfDir,
	Pr3LoopNonExistent,
	// Pass 4: refcounts
	Pr4ZeroLinkCount,
	Pr4BadRefCount,
	Pr4UnattachedInode,
	Pr4BadInodeCount,
	Pr4InconsistentCount,
	// Pass 5: summary
	Pr5BlockUsedCount,
	Pr5FreeBlockCount,
	Pr5BlockBitmapPadding,
	Pr5InodeUsedCount,
	Pr5FreeInodeCount,
	Pr5InodeBitmapPadding,
	Pr5FreeBlockGroupCount,
	Pr5FreeInodeGroupCount,
	// Journal
	Pr6JournalRecover,
	Pr6JournalCorrupt,
	// HTree
	Pr6HtreeDamaged,
	Pr6HtreeRebuild,
}

use ProblemCode::*;

const TABLE: &[ProblemInfo] = &[
	ProblemInfo { code: Pr0SbCorrupt, message: "the superblock could not be read or does not describe a valid filesystem", prompt: Prompt::None, flags: ProblemFlags::FATAL, latch: None, after: None },
	ProblemInfo { code: Pr0FsSizeWrong, message: "the filesystem size (per the superblock) does not match the device size", prompt: Prompt::Abort, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr0BlocksPerGroup, message: "blocks_per_group in the superblock is wrong", prompt: Prompt::None, flags: ProblemFlags::FATAL, latch: None, after: None },
	ProblemInfo { code: Pr0FirstDataBlock, message: "first_data_block in the superblock is wrong", prompt: Prompt::None, flags: ProblemFlags::FATAL, latch: None, after: None },
	ProblemInfo { code: Pr0AddUuid, message: "the filesystem has no UUID; generating one", prompt: Prompt::None, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr0BbNotGroup, message: "a block bitmap location falls outside its own group", prompt: Prompt::Relocate, flags: ProblemFlags::empty(), latch: Some(Latch::BlockBitmapReloc), after: None },
	ProblemInfo { code: Pr0IbNotGroup, message: "an inode bitmap location falls outside its own group", prompt: Prompt::Relocate, flags: ProblemFlags::empty(), latch: Some(Latch::InodeBitmapReloc), after: None },
	ProblemInfo { code: Pr0ItableNotGroup, message: "an inode table location falls outside its own group", prompt: Prompt::Relocate, flags: ProblemFlags::empty(), latch: Some(Latch::InodeTableReloc), after: None },
	ProblemInfo { code: Pr0FreeBlockCount, message: "a group descriptor's free block count is wrong", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr0FreeInodeCount, message: "a group descriptor's free inode count is wrong", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },

	ProblemInfo { code: Pr1ZeroLengthDir, message: "a directory inode has zero length", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1BadIMode, message: "an inode has an invalid mode", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1SetDtime, message: "a deleted inode has dtime set to zero", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1ZeroDtime, message: "a live inode has a nonzero dtime", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1BadIBlocks, message: "an inode's block count is wrong", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1IllegalBlockNum, message: "an inode references a block number outside the filesystem", prompt: Prompt::Clear, flags: ProblemFlags::empty(), latch: Some(Latch::IllegalBlock), after: None },
	ProblemInfo { code: Pr1TooManyBadBlocks, message: "too many illegal blocks in an inode", prompt: Prompt::ClearInode, flags: ProblemFlags::AFTER_CODE, latch: Some(Latch::BadBlockInode), after: Some(Pr1SetDtime) },
	ProblemInfo { code: Pr1ResIBadMode, message: "a reserved inode has a bad mode", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1SetImagic, message: "imagic flag set on a non-imagic filesystem", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1FileAclBad, message: "an inode's extended attribute block is invalid", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1DirAclBad, message: "an inode's dir_acl field should be zero", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1FragBlock, message: "fragments are set but unsupported", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr1FsizeBad, message: "an inode's size does not match its block count", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },

	ProblemInfo { code: Pr1bDupBlockHeader, message: "duplicate or bad blocks are in use", prompt: Prompt::None, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr1bDupBlock, message: "a block is claimed by more than one inode", prompt: Prompt::None, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr1cPassHeader, message: "looking up the directory that owns each duplicated block", prompt: Prompt::None, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr1dDupFile, message: "an inode shares blocks with other inodes", prompt: Prompt::None, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr1dDupFileListing, message: "listing the files sharing these blocks", prompt: Prompt::None, flags: ProblemFlags::MSG_ONLY, latch: None, after: None },
	ProblemInfo { code: Pr1dClone, message: "clone this file's duplicated blocks", prompt: Prompt::Clone, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr1dDeleteFile, message: "delete this file sharing duplicated blocks", prompt: Prompt::Delete, flags: ProblemFlags::empty(), latch: None, after: None },

	ProblemInfo { code: Pr2BadInode, message: "a directory entry references a deleted or otherwise invalid inode", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2BadName, message: "a directory entry has an invalid character in its name", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2MissingDot, message: "a directory is missing its '.' entry", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2MissingDotDot, message: "a directory is missing its '..' entry", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2LinkDir, message: "a directory entry links to a directory that is linked from elsewhere", prompt: Prompt::Clear, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr2LinkRoot, message: "a directory entry links to the root inode", prompt: Prompt::Clear, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr2LinkDot, message: "a directory entry links to '.'", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2DupDot, message: "a directory has a duplicate '.' entry", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2DupDotDot, message: "a directory has a duplicate '..' entry", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2FileAcl, message: "an entry points to an inode with an invalid extended attribute block", prompt: Prompt::Clear, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr2SetFileType, message: "an entry's file type does not match its inode and should be set", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2BadFileType, message: "an entry has an invalid file type", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2NullName, message: "a directory entry has a zero-length name", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2DirCorrupted, message: "a directory block's entries are corrupted beyond the point of this record", prompt: Prompt::Salvage, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr2AllocDirBlock, message: "a directory has a hole where a data block should be; allocating a replacement", prompt: Prompt::Allocate, flags: ProblemFlags::PREEN_OK, latch: None, after: None },

	ProblemInfo { code: Pr3NoRoot, message: "the root inode is not a valid directory", prompt: Prompt::Create, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr3ExpandLf, message: "/lost+found is not big enough; expanding it", prompt: Prompt::Expand, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr3UnconnectedDir, message: "a directory is not connected to the filesystem tree", prompt: Prompt::Connect, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr3BadDotDot, message: "a directory's '..' entry does not point to its parent", prompt: Prompt::Fix, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr3MissingDotDot, message: "a directory's '..' entry is missing and could not be recovered", prompt: Prompt::Fix, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr3NoLfDir, message: "/lost+found does not exist and could not be created", prompt: Prompt::None, flags: ProblemFlags::FATAL, latch: None, after: None },
	ProblemInfo { code: Pr3LoopNonExistent, message: "a directory's ancestor chain does not terminate at the root", prompt: Prompt::Connect, flags: ProblemFlags::empty(), latch: None, after: None },

	ProblemInfo { code: Pr4ZeroLinkCount, message: "an inode has a zero link count but is referenced by a directory entry", prompt: Prompt::Clear, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr4BadRefCount, message: "an inode's recorded link count does not match the number of entries found", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr4UnattachedInode, message: "an inode is not referenced by any directory entry", prompt: Prompt::Connect, flags: ProblemFlags::empty(), latch: Some(Latch::CheckUnattached), after: None },
	ProblemInfo { code: Pr4BadInodeCount, message: "the inode link count overflowed during reconciliation", prompt: Prompt::Fix, flags: ProblemFlags::empty(), latch: None, after: None },
	ProblemInfo { code: Pr4InconsistentCount, message: "the accumulated link count is internally inconsistent", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK | ProblemFlags::NO_OK, latch: None, after: None },

	ProblemInfo { code: Pr5BlockUsedCount, message: "the block bitmap differs from the computed one", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr5FreeBlockCount, message: "the free block count is wrong", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr5BlockBitmapPadding, message: "the block bitmap's trailing padding bits are not set", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr5InodeUsedCount, message: "the inode bitmap differs from the computed one", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr5FreeInodeCount, message: "the free inode count is wrong", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr5InodeBitmapPadding, message: "the inode bitmap's trailing padding bits are not set", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr5FreeBlockGroupCount, message: "a group descriptor's free block count is wrong", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr5FreeInodeGroupCount, message: "a group descriptor's free inode count is wrong", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },

	ProblemInfo { code: Pr6JournalRecover, message: "recovering the journal", prompt: Prompt::None, flags: ProblemFlags::PREEN_OK | ProblemFlags::MSG_ONLY, latch: None, after: None },
	ProblemInfo { code: Pr6JournalCorrupt, message: "the journal appears corrupt; skipping replay", prompt: Prompt::None, flags: ProblemFlags::PREEN_OK, latch: None, after: None },

	ProblemInfo { code: Pr6HtreeDamaged, message: "an indexed directory's HTree index is damaged", prompt: Prompt::Clear, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
	ProblemInfo { code: Pr6HtreeRebuild, message: "rebuilding the HTree index for a directory", prompt: Prompt::Fix, flags: ProblemFlags::PREEN_OK, latch: None, after: None },
];

fn lookup(code: ProblemCode) -> &'static ProblemInfo {
	TABLE
		.iter()
		.find(|p| p.code == code)
		.unwrap_or_else(|| panic!("no catalog entry for {code:?}"))
}

/// Per-latch cached state: whether it has been answered, and what the
/// collated answer was.
#[derive(Default)]
pub struct LatchState {
	answered: HashMap<Latch, bool>,
}

impl LatchState {
	pub fn new() -> Self {
		Self::default()
	}
}

/// Mutable state `fix_problem` needs across calls: the latch cache and the
/// filesystem's overall "valid" flag (cleared the first time an unresolved
/// problem is left in place).
pub struct ProblemState {
	pub policy: Policy,
	pub latches: LatchState,
	pub fs_valid: bool,
}

impl ProblemState {
	pub fn new(policy: Policy) -> Self {
		ProblemState {
			policy,
			latches: LatchState::new(),
			fs_valid: true,
		}
	}
}

fn default_answer(info: &ProblemInfo) -> bool {
	!info.flags.contains(ProblemFlags::NO_DEFAULT)
}

/// Resolves one problem, per spec §4.1's ten-step contract. Returns the
/// answer (`true` = yes/fix, `false` = no/leave as-is).
pub fn fix_problem(state: &mut ProblemState, code: ProblemCode) -> Result<bool, CheckError> {
	let info = lookup(code);

	if info.flags.contains(ProblemFlags::FATAL) {
		return Err(CheckError::Fatal(info.message.to_string()));
	}

	if let Some(latch) = info.latch {
		if let Some(&answer) = state.latches.answered.get(&latch) {
			debug!("problem {code:?}: latched answer = {answer}");
			if !answer && !info.flags.contains(ProblemFlags::NO_OK) {
				state.fs_valid = false;
			}
			if answer && info.prompt == Prompt::Abort {
				return Err(CheckError::Aborted);
			}
			if answer && info.flags.contains(ProblemFlags::AFTER_CODE) {
				if let Some(after) = info.after {
					fix_problem(state, after)?;
				}
			}
			return Ok(answer);
		}
	}

	let answer = match state.policy {
		Policy::Preen => {
			if info.flags.contains(ProblemFlags::PREEN_NO) {
				false
			} else if info.flags.contains(ProblemFlags::PREEN_OK) {
				default_answer(info)
			} else {
				return Err(CheckError::Fatal(format!(
					"{} requires operator attention (UNEXPECTED INCONSISTENCY; RUN fsck MANUALLY)",
					info.message
				)));
			}
		}
		Policy::Interactive { assume: Some(forced) } => forced,
		Policy::Interactive { assume: None } => {
			if info.prompt == Prompt::None {
				default_answer(info)
			} else {
				let question = format!("{}? {}", info.message, info.prompt.as_str());
				match utils::prompt::prompt(Some(&question), false) {
					Some(resp) => resp.trim().eq_ignore_ascii_case("y") || resp.trim().is_empty() && default_answer(info),
					None => default_answer(info),
				}
			}
		}
	};

	debug!("problem {code:?}: resolved answer = {answer}");

	if let Some(latch) = info.latch {
		if !info.flags.contains(ProblemFlags::NOCOLLATE) {
			state.latches.answered.insert(latch, answer);
		}
	}

	if !answer && !info.flags.contains(ProblemFlags::NO_OK) {
		state.fs_valid = false;
	}

	if answer && info.prompt == Prompt::Abort {
		return Err(CheckError::Aborted);
	}

	if answer && info.flags.contains(ProblemFlags::AFTER_CODE) {
		if let Some(after) = info.after {
			fix_problem(state, after)?;
		}
	}

	Ok(answer)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn preen_applies_default_for_preen_ok() {
		let mut state = ProblemState::new(Policy::Preen);
		let answer = fix_problem(&mut state, Pr1BadIMode).unwrap();
		assert!(answer);
	}

	#[test]
	fn preen_rejects_non_preen_ok() {
		let mut state = ProblemState::new(Policy::Preen);
		let err = fix_problem(&mut state, Pr3UnconnectedDir);
		assert!(err.is_err());
	}

	#[test]
	fn fatal_always_aborts() {
		let mut state = ProblemState::new(Policy::Interactive { assume: Some(true) });
		let err = fix_problem(&mut state, Pr0SbCorrupt);
		assert!(matches!(err, Err(CheckError::Fatal(_))));
	}

	#[test]
	fn forced_yes_answers_everything_yes() {
		let mut state = ProblemState::new(Policy::Interactive { assume: Some(true) });
		assert!(fix_problem(&mut state, Pr2BadInode).unwrap());
		assert!(state.fs_valid);
	}

	#[test]
	fn forced_no_marks_invalid_unless_no_ok() {
		let mut state = ProblemState::new(Policy::Interactive { assume: Some(false) });
		assert!(!fix_problem(&mut state, Pr2BadInode).unwrap());
		assert!(!state.fs_valid);
	}

	#[test]
	fn no_ok_flag_keeps_valid_on_no() {
		let mut state = ProblemState::new(Policy::Interactive { assume: Some(false) });
		assert!(!fix_problem(&mut state, Pr4InconsistentCount).unwrap());
		assert!(state.fs_valid);
	}

	#[test]
	fn latch_caches_answer() {
		let mut state = ProblemState::new(Policy::Interactive { assume: Some(true) });
		fix_problem(&mut state, Pr1IllegalBlockNum).unwrap();
		assert_eq!(state.latches.answered.get(&Latch::IllegalBlock), Some(&true));
		state.policy = Policy::Interactive { assume: Some(false) };
		let second = fix_problem(&mut state, Pr1IllegalBlockNum).unwrap();
		assert!(second, "latched answer should override the new forced policy");
	}
}
