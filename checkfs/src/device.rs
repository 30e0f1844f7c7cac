//! Block-device I/O manager.
//!
//! The core consumes a small trait instead of talking to `std::fs::File`
//! directly so that the five passes can run identically against a real block
//! device and against an in-memory image built by tests.

use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;

use crate::CheckError;

/// A block-addressable device. Blocks are fixed-size; offset `block * block_size`.
pub trait BlockDevice {
	/// Reads block `block` into `buf`. `buf` must be exactly `block_size()` long.
	fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<(), CheckError>;

	/// Writes `buf` (exactly `block_size()` long) to block `block`.
	fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<(), CheckError>;

	/// Zeroes `count` blocks starting at `block`. Used to flush the kill-sector list.
	fn zero_blocks(&mut self, block: u64, count: u64) -> Result<(), CheckError> {
		let zeros = vec![0u8; self.block_size() as usize];
		for i in 0..count {
			self.write_block(block + i, &zeros)?;
		}
		Ok(())
	}

	/// The device's block size in bytes.
	fn block_size(&self) -> u32;

	/// The total number of blocks on the device.
	fn block_count(&self) -> u64;

	/// Flushes any buffered writes to the underlying storage.
	fn flush(&mut self) -> Result<(), CheckError>;
}

/// A `BlockDevice` backed by a real file or block-device node.
pub struct FileDevice {
	file: File,
	block_size: u32,
	block_count: u64,
}

impl FileDevice {
	/// Opens `path` for reading and writing, taking an advisory exclusive lock.
	///
	/// `block_size` must already be known (from a superblock probe or `-B`); this
	/// layer does not guess geometry, matching the spec's boundary (§6).
	pub fn open(path: &std::path::Path, block_size: u32) -> Result<Self, CheckError> {
		let file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.open(path)?;
		let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
		if ret < 0 {
			return Err(CheckError::Io(io::Error::last_os_error()));
		}
		let len = utils::disk::get_disk_size(&file)? * 512;
		let block_count = len / block_size as u64;
		Ok(Self {
			file,
			block_size,
			block_count,
		})
	}
}

impl BlockDevice for FileDevice {
	fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<(), CheckError> {
		self.file.seek(SeekFrom::Start(block * self.block_size as u64))?;
		self.file.read_exact(buf)?;
		Ok(())
	}

	fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<(), CheckError> {
		self.file.seek(SeekFrom::Start(block * self.block_size as u64))?;
		self.file.write_all(buf)?;
		Ok(())
	}

	fn block_size(&self) -> u32 {
		self.block_size
	}

	fn block_count(&self) -> u64 {
		self.block_count
	}

	fn flush(&mut self) -> Result<(), CheckError> {
		self.file.flush()?;
		self.file.sync_data()?;
		Ok(())
	}
}

/// An in-memory `BlockDevice`, used by the test suite to build seed-scenario
/// images without a real block device.
pub struct MemDevice {
	data: Vec<u8>,
	block_size: u32,
}

impl MemDevice {
	/// Creates a zeroed device of `block_count` blocks of `block_size` bytes.
	pub fn new(block_count: u64, block_size: u32) -> Self {
		Self {
			data: vec![0u8; block_count as usize * block_size as usize],
			block_size,
		}
	}

	/// Returns the whole backing buffer, for test assertions.
	pub fn as_slice(&self) -> &[u8] {
		&self.data
	}
}

impl BlockDevice for MemDevice {
	fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<(), CheckError> {
		let off = block as usize * self.block_size as usize;
		let end = off + buf.len();
		if end > self.data.len() {
			return Err(CheckError::Corrupt(format!("read past end of device at block {block}")));
		}
		buf.copy_from_slice(&self.data[off..end]);
		Ok(())
	}

	fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<(), CheckError> {
		let off = block as usize * self.block_size as usize;
		let end = off + buf.len();
		if end > self.data.len() {
			return Err(CheckError::Corrupt(format!("write past end of device at block {block}")));
		}
		self.data[off..end].copy_from_slice(buf);
		Ok(())
	}

	fn block_size(&self) -> u32 {
		self.block_size
	}

	fn block_count(&self) -> u64 {
		self.data.len() as u64 / self.block_size as u64
	}

	fn flush(&mut self) -> Result<(), CheckError> {
		Ok(())
	}
}
