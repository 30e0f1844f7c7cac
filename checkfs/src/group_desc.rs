//! Block group descriptors (the BGDT).
//!
//! Layout grounded on `mkfs/src/ext2.rs`'s `BlockGroupDescriptor`.

use std::mem::size_of;

use crate::device::BlockDevice;
use crate::error::CheckError;
use crate::superblock::{read_at, write_at, Superblock, SUPERBLOCK_OFFSET};
use crate::util::reinterpret;

/// A single block group descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct GroupDescriptor {
	pub block_bitmap_block: u32,
	pub inode_bitmap_block: u32,
	pub inode_table_start_block: u32,
	pub free_blocks_count: u16,
	pub free_inodes_count: u16,
	pub used_dirs_count: u16,
	pub _padding: [u8; 14],
}

/// Returns the byte offset of the start of the group descriptor table: the
/// block immediately following the one containing the superblock.
pub fn bgdt_offset(sb: &Superblock) -> u64 {
	let bs = sb.block_size() as u64;
	let sb_block = SUPERBLOCK_OFFSET / bs;
	(sb_block + 1) * bs
}

/// Reads the full group descriptor table.
pub fn read_all(dev: &mut dyn BlockDevice, sb: &Superblock) -> Result<Vec<GroupDescriptor>, CheckError> {
	let count = sb.groups_count() as usize;
	let mut buf = vec![0u8; count * size_of::<GroupDescriptor>()];
	read_at(dev, bgdt_offset(sb), &mut buf)?;
	let mut out = Vec::with_capacity(count);
	for i in 0..count {
		let off = i * size_of::<GroupDescriptor>();
		let gd = unsafe { std::ptr::read_unaligned(buf[off..].as_ptr() as *const GroupDescriptor) };
		out.push(gd);
	}
	Ok(out)
}

/// Writes the full group descriptor table back.
pub fn write_all(dev: &mut dyn BlockDevice, sb: &Superblock, groups: &[GroupDescriptor]) -> Result<(), CheckError> {
	let mut buf = Vec::with_capacity(groups.len() * size_of::<GroupDescriptor>());
	for gd in groups {
		buf.extend_from_slice(reinterpret(gd));
	}
	write_at(dev, bgdt_offset(sb), &buf)
}

/// Validates that a group's bitmap/table block pointers lie within the
/// group's own block range (spec §3 invariant).
pub fn locations_in_range(gd: &GroupDescriptor, group_idx: u32, sb: &Superblock) -> bool {
	let first = sb.first_data_block() + group_idx * sb.blocks_per_group;
	let last = (first + sb.blocks_per_group).min(sb.total_blocks);
	let in_range = |b: u32| b >= first && b < last;
	in_range(gd.block_bitmap_block) && in_range(gd.inode_bitmap_block) && in_range(gd.inode_table_start_block)
}

impl Superblock {
	/// The first block usable for data/metadata (spec invariant:
	/// `first_data_block <= super_block_location < blocks_count`).
	pub fn first_data_block(&self) -> u32 {
		if self.block_size() == 1024 {
			1
		} else {
			0
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::MemDevice;

	fn fresh_superblock(groups: u32) -> Superblock {
		let mut sb: Superblock = unsafe { std::mem::zeroed() };
		sb.signature = crate::superblock::EXT2_SIGNATURE;
		sb.block_size_log = 2; // 4096
		sb.blocks_per_group = 256;
		sb.inodes_per_group = 64;
		sb.total_blocks = 256 * groups;
		sb.total_inodes = 64 * groups;
		sb.major_version = 1;
		sb.inode_size = 128;
		sb
	}

	#[test]
	fn round_trip() {
		let sb = fresh_superblock(3);
		let mut dev = MemDevice::new(64, 4096);
		let mut groups = vec![GroupDescriptor::default(); sb.groups_count() as usize];
		for (i, g) in groups.iter_mut().enumerate() {
			g.block_bitmap_block = 10 + i as u32 * 256;
			g.inode_bitmap_block = 11 + i as u32 * 256;
			g.inode_table_start_block = 12 + i as u32 * 256;
			g.free_blocks_count = 200;
			g.free_inodes_count = 60;
		}
		write_all(&mut dev, &sb, &groups).unwrap();
		let read_back = read_all(&mut dev, &sb).unwrap();
		assert_eq!(read_back.len(), 3);
		assert_eq!({ read_back[1].inode_table_start_block }, 12 + 256);
		assert!(locations_in_range(&read_back[1], 1, &sb));
	}

	#[test]
	fn detects_out_of_range_location() {
		let sb = fresh_superblock(2);
		let mut gd = GroupDescriptor::default();
		gd.block_bitmap_block = 5000; // far outside group 0's range
		assert!(!locations_in_range(&gd, 0, &sb));
	}
}
