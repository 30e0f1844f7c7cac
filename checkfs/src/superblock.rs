//! The on-disk superblock: global filesystem parameters.
//!
//! Layout grounded on `mkfs/src/ext2.rs`'s `Superblock` struct, extended with
//! the feature-flag and state fields the checker needs to reason about
//! (spec §3) but that `mkfs` never had to read back.

use std::mem::size_of;

use crate::error::CheckError;
use crate::util::{reinterpret, reinterpret_mut};
use crate::device::BlockDevice;

/// Byte offset of the superblock from the start of the device, independent of block size.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// The filesystem's magic signature.
pub const EXT2_SIGNATURE: u16 = 0xef53;

/// Filesystem state: clean.
pub const FS_STATE_VALID: u16 = 1;
/// Filesystem state: has errors.
pub const FS_STATE_ERROR: u16 = 2;

bitflags::bitflags! {
	/// Optional (`s_feature_compat`) features: safe to ignore if unsupported.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct CompatFeatures: u32 {
		const DIR_PREALLOC  = 0x0001;
		const IMAGIC_INODES = 0x0002;
		const HAS_JOURNAL   = 0x0004;
		const EXT_ATTR      = 0x0008;
		const RESIZE_INODE  = 0x0010;
		const DIR_INDEX     = 0x0020;
	}

	/// Incompatible (`s_feature_incompat`) features: mount must refuse if unsupported.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct IncompatFeatures: u32 {
		const COMPRESSION = 0x0001;
		const FILETYPE    = 0x0002;
		const RECOVER     = 0x0004;
		const JOURNAL_DEV = 0x0008;
		const META_BG     = 0x0010;
		const EXTENTS     = 0x0040;
		const BIT64       = 0x0080;
	}

	/// Read-only-compatible (`s_feature_ro_compat`) features.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct RoCompatFeatures: u32 {
		const SPARSE_SUPER = 0x0001;
		const LARGE_FILE   = 0x0002;
		const BTREE_DIR    = 0x0004;
		const HUGE_FILE    = 0x0008;
		const GDT_CSUM     = 0x0010;
		const DIR_NLINK    = 0x0020;
		const EXTRA_ISIZE  = 0x0040;
	}
}

/// The ext2 on-disk superblock. `#[repr(C, packed)]` little-endian, matching
/// the teacher's raw-byte-slicing codec idiom rather than a serialization crate.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Superblock {
	pub total_inodes: u32,
	pub total_blocks: u32,
	pub superuser_blocks: u32,
	pub total_unallocated_blocks: u32,
	pub total_unallocated_inodes: u32,
	pub superblock_block_number: u32,
	pub block_size_log: u32,
	pub fragment_size_log: u32,
	pub blocks_per_group: u32,
	pub fragments_per_group: u32,
	pub inodes_per_group: u32,
	pub last_mount_timestamp: u32,
	pub last_write_timestamp: u32,
	pub mount_count_since_fsck: u16,
	pub mount_count_before_fsck: u16,
	pub signature: u16,
	pub fs_state: u16,
	pub error_action: u16,
	pub minor_version: u16,
	pub last_fsck_timestamp: u32,
	pub fsck_interval: u32,
	pub os_id: u32,
	pub major_version: u32,
	pub uid_reserved: u16,
	pub gid_reserved: u16,

	pub first_non_reserved_inode: u32,
	pub inode_size: u16,
	pub superblock_group: u16,
	pub feature_compat: u32,
	pub feature_incompat: u32,
	pub feature_ro_compat: u32,
	pub uuid: [u8; 16],
	pub volume_name: [u8; 16],
	pub last_mount_path: [u8; 64],
	pub compression_algorithms: u32,
	pub files_preallocate_count: u8,
	pub directories_preallocate_count: u8,
	pub _unused: u16,
	pub journal_uuid: [u8; 16],
	pub journal_inode: u32,
	pub journal_device: u32,
	pub orphan_inode_head: u32,
	pub hash_seed: [u32; 4],
	pub def_hash_version: u8,
	pub jnl_backup_type: u8,
	pub desc_size: u16,
	pub default_mount_opts: u32,

	pub _padding: [u8; 764],
}

impl Superblock {
	/// Reads the superblock from `dev` at `SUPERBLOCK_OFFSET`.
	pub fn read(dev: &mut dyn BlockDevice) -> Result<Self, CheckError> {
		let mut buf = vec![0u8; size_of::<Self>()];
		read_at(dev, SUPERBLOCK_OFFSET, &mut buf)?;
		let sb = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Self) };
		if sb.signature != EXT2_SIGNATURE {
			return Err(CheckError::Corrupt("bad superblock signature".into()));
		}
		Ok(sb)
	}

	/// Writes the superblock back to `dev`.
	pub fn write(&self, dev: &mut dyn BlockDevice) -> Result<(), CheckError> {
		write_at(dev, SUPERBLOCK_OFFSET, reinterpret(self))
	}

	/// The block size in bytes, derived from `block_size_log`.
	pub fn block_size(&self) -> u32 {
		1024u32 << self.block_size_log
	}

	/// The size of one on-disk inode record, in bytes.
	pub fn inode_size(&self) -> usize {
		if self.major_version >= 1 {
			self.inode_size as usize
		} else {
			128
		}
	}

	/// The number of block groups covering the filesystem.
	pub fn groups_count(&self) -> u32 {
		(self.total_blocks + self.blocks_per_group - 1) / self.blocks_per_group
	}

	pub fn compat_features(&self) -> CompatFeatures {
		CompatFeatures::from_bits_truncate(self.feature_compat)
	}

	pub fn incompat_features(&self) -> IncompatFeatures {
		IncompatFeatures::from_bits_truncate(self.feature_incompat)
	}

	pub fn ro_compat_features(&self) -> RoCompatFeatures {
		RoCompatFeatures::from_bits_truncate(self.feature_ro_compat)
	}

	/// True if a journal is declared and was not cleanly unmounted (§4.7).
	pub fn needs_journal_replay(&self, journal_start: u32) -> bool {
		self.compat_features().contains(CompatFeatures::HAS_JOURNAL) && journal_start != 0
	}

	pub fn is_valid(&self) -> bool {
		self.fs_state & FS_STATE_ERROR == 0
	}

	pub fn mark_invalid(&mut self) {
		self.fs_state = FS_STATE_ERROR;
	}
}

/// Reads `buf.len()` bytes starting at byte offset `off`, crossing block
/// boundaries as needed. Used for the superblock/group-descriptor table which
/// are not guaranteed to be block-aligned-sized structures.
pub fn read_at(dev: &mut dyn BlockDevice, off: u64, buf: &mut [u8]) -> Result<(), CheckError> {
	let bs = dev.block_size() as u64;
	let mut block_buf = vec![0u8; bs as usize];
	let mut pos = off;
	let mut written = 0usize;
	while written < buf.len() {
		let block = pos / bs;
		let block_off = (pos % bs) as usize;
		dev.read_block(block, &mut block_buf)?;
		let n = (bs as usize - block_off).min(buf.len() - written);
		buf[written..written + n].copy_from_slice(&block_buf[block_off..block_off + n]);
		written += n;
		pos += n as u64;
	}
	Ok(())
}

/// Writes `buf` starting at byte offset `off`, read-modify-write across block
/// boundaries.
pub fn write_at(dev: &mut dyn BlockDevice, off: u64, buf: &[u8]) -> Result<(), CheckError> {
	let bs = dev.block_size() as u64;
	let mut block_buf = vec![0u8; bs as usize];
	let mut pos = off;
	let mut read = 0usize;
	while read < buf.len() {
		let block = pos / bs;
		let block_off = (pos % bs) as usize;
		let n = (bs as usize - block_off).min(buf.len() - read);
		if block_off != 0 || n != bs as usize {
			dev.read_block(block, &mut block_buf)?;
		}
		block_buf[block_off..block_off + n].copy_from_slice(&buf[read..read + n]);
		dev.write_block(block, &block_buf)?;
		read += n;
		pos += n as u64;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::MemDevice;

	fn fresh_superblock() -> Superblock {
		let mut sb: Superblock = unsafe { std::mem::zeroed() };
		sb.signature = EXT2_SIGNATURE;
		sb.total_blocks = 1024;
		sb.total_inodes = 128;
		sb.blocks_per_group = 1024;
		sb.inodes_per_group = 128;
		sb.block_size_log = 2; // 4096
		sb.major_version = 1;
		sb.inode_size = 128;
		sb.fs_state = FS_STATE_VALID;
		sb
	}

	#[test]
	fn round_trip() {
		let mut dev = MemDevice::new(16, 4096);
		let sb = fresh_superblock();
		sb.write(&mut dev).unwrap();
		let read_back = Superblock::read(&mut dev).unwrap();
		assert_eq!({ read_back.total_blocks }, 1024);
		assert_eq!(read_back.block_size(), 4096);
		assert_eq!(read_back.groups_count(), 1);
	}

	#[test]
	fn rejects_bad_signature() {
		let mut dev = MemDevice::new(16, 4096);
		let mut sb = fresh_superblock();
		sb.signature = 0;
		sb.write(&mut dev).unwrap();
		assert!(Superblock::read(&mut dev).is_err());
	}

	#[test]
	fn invalid_state_roundtrips() {
		let mut sb = fresh_superblock();
		assert!(sb.is_valid());
		sb.mark_invalid();
		assert!(!sb.is_valid());
	}
}
