//! Directory entries: the variable-length records packed into a directory's
//! data blocks.
//!
//! Grounded on `mkfs/src/ext2.rs`'s `DirectoryEntry` writer, extended with the
//! parsing/validation side `mkfs` never needed (spec §3, §4.3).

use crate::error::CheckError;

pub const DIRENT_HEADER_LEN: usize = 8;
pub const DIRENT_NAME_ALIGN: usize = 4;

bitflags::bitflags! {
	/// `file_type` byte values when `INCOMPAT_FILETYPE` is set.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct FileType: u8 {
		const UNKNOWN = 0;
		const REG     = 1;
		const DIR     = 2;
		const CHRDEV  = 3;
		const BLKDEV  = 4;
		const FIFO    = 5;
		const SOCK    = 6;
		const SYMLINK = 7;
	}
}

/// A single parsed directory entry, borrowing its name from the block buffer.
#[derive(Debug, Clone)]
pub struct DirEntry {
	pub inode: u32,
	pub rec_len: u16,
	pub file_type: u8,
	pub name: Vec<u8>,
	/// Byte offset of this record within its directory block.
	pub offset: usize,
}

impl DirEntry {
	/// Minimum `rec_len` for a name of `name_len` bytes, rounded up to a
	/// 4-byte boundary (spec §3's rec_len invariant).
	pub fn min_rec_len(name_len: usize) -> u16 {
		let raw = DIRENT_HEADER_LEN + name_len;
		(((raw + DIRENT_NAME_ALIGN - 1) / DIRENT_NAME_ALIGN) * DIRENT_NAME_ALIGN) as u16
	}

	/// A tombstone entry (inode 0) spanning exactly `rec_len` bytes, used to
	/// fill a deleted entry's slot or a hole before the final record.
	pub fn empty(rec_len: u16, offset: usize) -> Self {
		DirEntry {
			inode: 0,
			rec_len,
			file_type: 0,
			name: Vec::new(),
			offset,
		}
	}

	pub fn is_deleted(&self) -> bool {
		self.inode == 0
	}

	pub fn is_dot(&self) -> bool {
		self.name == b"."
	}

	pub fn is_dotdot(&self) -> bool {
		self.name == b".."
	}

	fn encode(&self, use_file_type: bool) -> Vec<u8> {
		let mut buf = vec![0u8; self.rec_len as usize];
		buf[0..4].copy_from_slice(&self.inode.to_le_bytes());
		buf[4..6].copy_from_slice(&self.rec_len.to_le_bytes());
		buf[6] = self.name.len() as u8;
		buf[7] = if use_file_type { self.file_type } else { 0 };
		buf[8..8 + self.name.len()].copy_from_slice(&self.name);
		buf
	}
}

/// One structural problem found while walking a directory block (spec §4.3:
/// the checker must distinguish "garbled, unrecoverable" from "garbled, but
/// recoverable by clearing the record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentDefect {
	/// `rec_len` is smaller than the 8-byte header, not a multiple of 4, or
	/// runs past the end of the block. Fatal for this block: salvage by
	/// collapsing the remainder into one empty record.
	BadRecLen,
	/// `rec_len` is internally consistent but smaller than `8 + name_len`
	/// rounded up.
	NameTooLong,
	/// `name_len == 0` on a used (non-zero inode) entry.
	EmptyName,
	/// The name contains `/` or a NUL before its declared length.
	BadNameChars,
}

/// Parses every record in one directory block, in order. Returns the
/// position of the first [`DirentDefect`] encountered (if any) alongside
/// whatever entries parsed cleanly before it, so the caller can decide how
/// much of the block survives.
pub fn parse_block(block: &[u8]) -> (Vec<DirEntry>, Option<(usize, DirentDefect)>) {
	let mut entries = Vec::new();
	let mut off = 0usize;
	while off + DIRENT_HEADER_LEN <= block.len() {
		let inode = u32::from_le_bytes(block[off..off + 4].try_into().unwrap());
		let rec_len = u16::from_le_bytes(block[off + 4..off + 6].try_into().unwrap());
		let name_len = block[off + 6] as usize;
		let file_type = block[off + 7];

		if rec_len < DIRENT_HEADER_LEN as u16
			|| rec_len % DIRENT_NAME_ALIGN as u16 != 0
			|| off + rec_len as usize > block.len()
		{
			return (entries, Some((off, DirentDefect::BadRecLen)));
		}
		if inode != 0 {
			if name_len == 0 {
				return (entries, Some((off, DirentDefect::EmptyName)));
			}
			if DirEntry::min_rec_len(name_len) > rec_len {
				return (entries, Some((off, DirentDefect::NameTooLong)));
			}
			let name = &block[off + 8..off + 8 + name_len];
			if name.contains(&b'/') || name.contains(&0) {
				return (entries, Some((off, DirentDefect::BadNameChars)));
			}
			entries.push(DirEntry {
				inode,
				rec_len,
				file_type,
				name: name.to_vec(),
				offset: off,
			});
		} else {
			entries.push(DirEntry {
				inode: 0,
				rec_len,
				file_type,
				name: Vec::new(),
				offset: off,
			});
		}
		off += rec_len as usize;
	}
	(entries, None)
}

/// Rewrites a directory block from a list of entries that must already span
/// it exactly (`sum(rec_len) == block.len()`).
pub fn write_block(block: &mut [u8], entries: &[DirEntry], use_file_type: bool) -> Result<(), CheckError> {
	let total: usize = entries.iter().map(|e| e.rec_len as usize).sum();
	if total != block.len() {
		return Err(CheckError::Corrupt(format!(
			"directory block entries total {total} bytes, expected {}",
			block.len()
		)));
	}
	let mut off = 0;
	for e in entries {
		let encoded = e.encode(use_file_type);
		block[off..off + encoded.len()].copy_from_slice(&encoded);
		off += encoded.len();
	}
	Ok(())
}

/// Builds a fresh directory block containing only `.` and `..`, with the
/// remainder of the block as one empty record — used when pass 2 or pass 3
/// must synthesize a directory block from scratch (spec §4.3/§4.4).
pub fn new_dot_block(block_size: usize, self_ino: u32, parent_ino: u32, use_file_type: bool) -> Vec<u8> {
	let dot_len = DirEntry::min_rec_len(1);
	let dotdot_len = (block_size as u16) - dot_len;
	let entries = [
		DirEntry { inode: self_ino, rec_len: dot_len, file_type: if use_file_type { FileType::DIR.bits() } else { 0 }, name: b".".to_vec(), offset: 0 },
		DirEntry { inode: parent_ino, rec_len: dotdot_len, file_type: if use_file_type { FileType::DIR.bits() } else { 0 }, name: b"..".to_vec(), offset: dot_len as usize },
	];
	let mut block = vec![0u8; block_size];
	write_block(&mut block, &entries, use_file_type).expect("dot block sized exactly");
	block
}

#[cfg(test)]
mod test {
	use super::*;

	fn block_with(entries: &[DirEntry]) -> Vec<u8> {
		let mut block = vec![0u8; 64];
		write_block(&mut block, entries, true).unwrap();
		block
	}

	#[test]
	fn parses_well_formed_block() {
		let entries = vec![
			DirEntry { inode: 2, rec_len: 12, file_type: FileType::DIR.bits(), name: b"..".to_vec(), offset: 0 },
			DirEntry { inode: 11, rec_len: 52, file_type: FileType::REG.bits(), name: b"hello.txt".to_vec(), offset: 12 },
		];
		let block = block_with(&entries);
		let (parsed, defect) = parse_block(&block);
		assert!(defect.is_none());
		assert_eq!(parsed.len(), 2);
		assert_eq!(parsed[1].name, b"hello.txt");
	}

	#[test]
	fn detects_bad_rec_len() {
		let mut block = vec![0u8; 32];
		block[4..6].copy_from_slice(&3u16.to_le_bytes()); // not a multiple of 4
		let (_, defect) = parse_block(&block);
		assert_eq!(defect.unwrap().1, DirentDefect::BadRecLen);
	}

	#[test]
	fn detects_name_too_long() {
		let mut block = vec![0u8; 32];
		block[0..4].copy_from_slice(&5u32.to_le_bytes());
		block[4..6].copy_from_slice(&8u16.to_le_bytes());
		block[6] = 20; // name_len claims 20 bytes but rec_len only allows 0
		let (_, defect) = parse_block(&block);
		assert_eq!(defect.unwrap().1, DirentDefect::NameTooLong);
	}

	#[test]
	fn dot_block_round_trips() {
		let block = new_dot_block(64, 11, 2, true);
		let (parsed, defect) = parse_block(&block);
		assert!(defect.is_none());
		assert!(parsed[0].is_dot());
		assert_eq!(parsed[0].inode, 11);
		assert!(parsed[1].is_dotdot());
		assert_eq!(parsed[1].inode, 2);
	}
}
