//! Journal replay: recovers a crash-interrupted transaction log before any
//! consistency pass runs (spec §4.7).
//!
//! The on-disk journal superblock/descriptor/commit/revoke formats are
//! big-endian, unlike the rest of this filesystem's little-endian
//! structures — grounded on the same raw-byte-slicing codec style as
//! `superblock.rs`, but reading fields by hand since a single `#[repr(C)]`
//! struct can't flip endianness per field.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::device::BlockDevice;
use crate::error::CheckError;

pub const JFS_MAGIC: u32 = 0xc03b3998;

const BLOCK_TYPE_DESCRIPTOR: u32 = 1;
const BLOCK_TYPE_COMMIT: u32 = 2;
const BLOCK_TYPE_SUPERBLOCK_V1: u32 = 3;
const BLOCK_TYPE_SUPERBLOCK_V2: u32 = 4;
const BLOCK_TYPE_REVOKE: u32 = 5;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TagFlags: u32 {
		const ESCAPE    = 0x1;
		const SAME_UUID = 0x2;
		const DELETED   = 0x4;
		const LAST_TAG  = 0x8;
	}
}

/// The journal's own superblock, read from its first log block.
#[derive(Debug, Clone)]
pub struct JournalSuperblock {
	pub block_size: u32,
	pub max_len: u32,
	pub first: u32,
	pub sequence: u32,
	pub start: u32,
	pub feature_compat: u32,
	pub feature_incompat: u32,
	pub feature_ro_compat: u32,
	pub uuid: [u8; 16],
}

fn read_header(block: &[u8]) -> Result<(u32, u32, u32), CheckError> {
	if block.len() < 12 {
		return Err(CheckError::Corrupt("journal block shorter than its header".into()));
	}
	let magic = u32::from_be_bytes(block[0..4].try_into().unwrap());
	let block_type = u32::from_be_bytes(block[4..8].try_into().unwrap());
	let sequence = u32::from_be_bytes(block[8..12].try_into().unwrap());
	if magic != JFS_MAGIC {
		return Err(CheckError::Corrupt("journal block has bad magic".into()));
	}
	Ok((magic, block_type, sequence))
}

impl JournalSuperblock {
	pub fn read(block: &[u8]) -> Result<Self, CheckError> {
		let (_, block_type, _) = read_header(block)?;
		if block_type != BLOCK_TYPE_SUPERBLOCK_V1 && block_type != BLOCK_TYPE_SUPERBLOCK_V2 {
			return Err(CheckError::Corrupt("first journal block is not a superblock".into()));
		}
		let u32_at = |off: usize| u32::from_be_bytes(block[off..off + 4].try_into().unwrap());
		let mut uuid = [0u8; 16];
		uuid.copy_from_slice(&block[24..40]);
		Ok(JournalSuperblock {
			block_size: u32_at(12),
			max_len: u32_at(16),
			first: u32_at(20),
			sequence: u32_at(40),
			start: u32_at(44),
			feature_compat: if block_type == BLOCK_TYPE_SUPERBLOCK_V2 { u32_at(48) } else { 0 },
			feature_incompat: if block_type == BLOCK_TYPE_SUPERBLOCK_V2 { u32_at(52) } else { 0 },
			feature_ro_compat: if block_type == BLOCK_TYPE_SUPERBLOCK_V2 { u32_at(56) } else { 0 },
			uuid,
		})
	}
}

struct DescriptorTag {
	block_nr: u32,
	flags: TagFlags,
}

fn parse_descriptor_tags(block: &[u8], has_64bit: bool) -> Vec<DescriptorTag> {
	let tag_size = if has_64bit { 12 } else { 8 };
	let mut tags = Vec::new();
	let mut off = 12usize;
	while off + tag_size <= block.len() {
		let block_nr = u32::from_be_bytes(block[off..off + 4].try_into().unwrap());
		let flags = TagFlags::from_bits_truncate(u32::from_be_bytes(block[off + 4..off + 8].try_into().unwrap()));
		off += tag_size;
		if !flags.contains(TagFlags::SAME_UUID) {
			off += 16;
		}
		let last = flags.contains(TagFlags::LAST_TAG);
		tags.push(DescriptorTag { block_nr, flags });
		if last {
			break;
		}
	}
	tags
}

fn parse_revoke_records(block: &[u8]) -> Vec<u32> {
	let count = u32::from_be_bytes(block[12..16].try_into().unwrap()) as usize;
	let mut out = Vec::new();
	let mut off = 16usize;
	while off + 4 <= block.len() && out.len() * 4 + 16 <= count {
		out.push(u32::from_be_bytes(block[off..off + 4].try_into().unwrap()));
		off += 4;
	}
	out
}

/// One complete transaction located during Phase 1: the ordered list of
/// (descriptor, data-block-log-offset) pairs to replay on commit, plus every
/// revoke record it carried.
struct Transaction {
	sequence: u32,
	tags: Vec<(DescriptorTag, u64)>,
	revokes: Vec<u32>,
}

fn wrap(log_block: u64, first: u32, max_len: u32) -> u64 {
	let span = (max_len - first) as u64;
	first as u64 + (log_block - first as u64) % span
}

/// Reads the whole journal from `journal_dev` (starting at its own
/// superblock) and replays any complete transactions onto `main_dev`.
/// Returns the number of transactions replayed.
pub fn replay(journal_dev: &mut dyn BlockDevice, main_dev: &mut dyn BlockDevice) -> Result<u32, CheckError> {
	let bs = journal_dev.block_size() as usize;
	let mut sb_block = vec![0u8; bs];
	journal_dev.read_block(0, &mut sb_block)?;
	let jsb = JournalSuperblock::read(&sb_block)?;

	if jsb.start == 0 {
		debug!("journal cleanly unmounted, nothing to replay");
		return Ok(0);
	}

	info!("journal replay: starting at block {}, sequence {}", jsb.start, jsb.sequence);

	let has_64bit = jsb.feature_incompat & 0x2 != 0; // JFS_FEATURE_INCOMPAT_64BIT
	let mut cursor = jsb.start as u64;
	let mut expected_seq = jsb.sequence;
	let mut transactions = Vec::new();

	// Phase 1: scan, building one Transaction per committed sequence.
	'scan: loop {
		let phys = wrap(cursor, jsb.first, jsb.max_len);
		let mut block = vec![0u8; bs];
		journal_dev.read_block(phys, &mut block)?;
		let header = read_header(&block);
		let (block_type, sequence) = match header {
			Ok((_, t, s)) => (t, s),
			Err(_) => break 'scan, // no more magic-tagged blocks: end of log
		};
		if sequence != expected_seq {
			break 'scan;
		}

		match block_type {
			BLOCK_TYPE_DESCRIPTOR => {
				let tags = parse_descriptor_tags(&block, has_64bit);
				let mut tx = Transaction { sequence, tags: Vec::new(), revokes: Vec::new() };
				let mut data_cursor = cursor + 1;
				for tag in tags {
					let data_phys = wrap(data_cursor, jsb.first, jsb.max_len);
					tx.tags.push((tag, data_phys));
					data_cursor += 1;
				}
				cursor = data_cursor;
				// Keep scanning until the matching commit block for this tx.
				loop {
					let phys = wrap(cursor, jsb.first, jsb.max_len);
					let mut b2 = vec![0u8; bs];
					journal_dev.read_block(phys, &mut b2)?;
					let Ok((_, t2, s2)) = read_header(&b2) else { break 'scan };
					if s2 != sequence {
						break 'scan;
					}
					cursor += 1;
					match t2 {
						BLOCK_TYPE_COMMIT => {
							transactions.push(tx);
							expected_seq += 1;
							break;
						}
						BLOCK_TYPE_REVOKE => {
							tx.revokes.extend(parse_revoke_records(&b2));
						}
						_ => break 'scan,
					}
				}
			}
			_ => break 'scan,
		}
	}

	info!("journal replay: found {} committed transaction(s)", transactions.len());

	// Phase 2: accumulate the revoke hash across all transactions.
	let mut revoke_hash: HashMap<u32, u32> = HashMap::new();
	for tx in &transactions {
		for &blocknr in &tx.revokes {
			let entry = revoke_hash.entry(blocknr).or_insert(tx.sequence);
			*entry = (*entry).max(tx.sequence);
		}
	}

	// Phase 3: replay, skipping anything the revoke hash shadows.
	let mut replayed = 0;
	for tx in &transactions {
		for (tag, data_phys) in &tx.tags {
			if let Some(&revoked_at) = revoke_hash.get(&tag.block_nr) {
				if revoked_at >= tx.sequence {
					continue;
				}
			}
			let mut data = vec![0u8; bs];
			journal_dev.read_block(*data_phys, &mut data)?;
			if tag.flags.contains(TagFlags::ESCAPE) {
				data[0..4].copy_from_slice(&JFS_MAGIC.to_be_bytes());
			}
			main_dev.write_block(tag.block_nr as u64, &data)?;
			replayed += 1;
		}
	}

	if replayed == 0 && transactions.is_empty() {
		warn!("journal claimed it needed recovery but no valid transactions were found");
	}

	main_dev.flush()?;
	Ok(transactions.len() as u32)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::MemDevice;

	fn write_header(block: &mut [u8], block_type: u32, sequence: u32) {
		block[0..4].copy_from_slice(&JFS_MAGIC.to_be_bytes());
		block[4..8].copy_from_slice(&block_type.to_be_bytes());
		block[8..12].copy_from_slice(&sequence.to_be_bytes());
	}

	fn build_superblock(block_size: u32, max_len: u32, first: u32, start: u32, sequence: u32) -> Vec<u8> {
		let mut b = vec![0u8; block_size as usize];
		write_header(&mut b, BLOCK_TYPE_SUPERBLOCK_V2, 0);
		b[12..16].copy_from_slice(&block_size.to_be_bytes());
		b[16..20].copy_from_slice(&max_len.to_be_bytes());
		b[20..24].copy_from_slice(&first.to_be_bytes());
		b[40..44].copy_from_slice(&sequence.to_be_bytes());
		b[44..48].copy_from_slice(&start.to_be_bytes());
		b
	}

	#[test]
	fn replays_single_transaction() {
		let bs = 1024u32;
		let mut journal = MemDevice::new(16, bs);
		let mut main = MemDevice::new(64, bs);

		// Superblock at log block 0: log starts at block 1, first=1.
		let sb = build_superblock(bs, 16, 1, 1, 5);
		journal.write_block(0, &sb).unwrap();

		// Block 1: descriptor tagging target block 50, one tag, LAST_TAG set, SAME_UUID set.
		let mut desc = vec![0u8; bs as usize];
		write_header(&mut desc, BLOCK_TYPE_DESCRIPTOR, 5);
		desc[12..16].copy_from_slice(&50u32.to_be_bytes());
		let flags = (TagFlags::SAME_UUID | TagFlags::LAST_TAG).bits();
		desc[16..20].copy_from_slice(&flags.to_be_bytes());
		journal.write_block(1, &desc).unwrap();

		// Block 2: the data to replay onto main device block 50.
		let data = vec![0xabu8; bs as usize];
		journal.write_block(2, &data).unwrap();

		// Block 3: commit.
		let mut commit = vec![0u8; bs as usize];
		write_header(&mut commit, BLOCK_TYPE_COMMIT, 5);
		journal.write_block(3, &commit).unwrap();

		let replayed = replay(&mut journal, &mut main).unwrap();
		assert_eq!(replayed, 1);

		let mut out = vec![0u8; bs as usize];
		main.read_block(50, &mut out).unwrap();
		assert_eq!(out, data);
	}

	#[test]
	fn clean_unmount_skips_replay() {
		let bs = 1024u32;
		let mut journal = MemDevice::new(4, bs);
		let mut main = MemDevice::new(4, bs);
		let sb = build_superblock(bs, 16, 1, 0, 5);
		journal.write_block(0, &sb).unwrap();
		let replayed = replay(&mut journal, &mut main).unwrap();
		assert_eq!(replayed, 0);
	}

	#[test]
	fn revoked_block_is_skipped() {
		let bs = 1024u32;
		let mut journal = MemDevice::new(16, bs);
		let mut main = MemDevice::new(64, bs);
		main.write_block(50, &[0x11u8; 1024]).unwrap();

		let sb = build_superblock(bs, 16, 1, 1, 5);
		journal.write_block(0, &sb).unwrap();

		let mut desc = vec![0u8; bs as usize];
		write_header(&mut desc, BLOCK_TYPE_DESCRIPTOR, 5);
		desc[12..16].copy_from_slice(&50u32.to_be_bytes());
		let flags = (TagFlags::SAME_UUID | TagFlags::LAST_TAG).bits();
		desc[16..20].copy_from_slice(&flags.to_be_bytes());
		journal.write_block(1, &desc).unwrap();
		journal.write_block(2, &[0xab; 1024]).unwrap();

		let mut revoke = vec![0u8; bs as usize];
		write_header(&mut revoke, BLOCK_TYPE_REVOKE, 5);
		revoke[12..16].copy_from_slice(&20u32.to_be_bytes()); // count: 16-byte header + one 4-byte entry
		revoke[16..20].copy_from_slice(&50u32.to_be_bytes());
		journal.write_block(3, &revoke).unwrap();

		let mut commit = vec![0u8; bs as usize];
		write_header(&mut commit, BLOCK_TYPE_COMMIT, 5);
		journal.write_block(4, &commit).unwrap();

		replay(&mut journal, &mut main).unwrap();
		let mut out = vec![0u8; bs as usize];
		main.read_block(50, &mut out).unwrap();
		assert_eq!(out, vec![0x11u8; 1024], "block revoked at its own transaction's sequence must not be replayed");
	}
}
