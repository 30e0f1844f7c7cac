//! Cross-pass directory bookkeeping: `dir_info` (every directory inode seen
//! by pass 1, with its eventual parent) and `dx_dir_info` (HTree-indexed
//! directories awaiting a rehash). Both are sorted-by-inode tables with
//! binary-search lookup, per Design Notes §9.

/// One directory's bookkeeping row, built incrementally across passes 1
/// through 3: pass 1 records `ino`; pass 2 fills `dotdot` from the on-disk
/// `..` entry; pass 3 fills `parent` once the true parent is known (they can
/// differ when pass 3 reconnects a directory under lost+found).
#[derive(Debug, Clone, Copy)]
pub struct DirInfo {
	pub ino: u32,
	pub dotdot: u32,
	pub parent: u32,
}

/// Sorted-by-inode table of every directory inode pass 1 discovered.
#[derive(Default)]
pub struct DirInfoTable {
	rows: Vec<DirInfo>,
}

impl DirInfoTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a new directory, keeping `rows` sorted by inode number.
	pub fn add(&mut self, ino: u32) {
		if self.find_index(ino).is_ok() {
			return;
		}
		let pos = self.rows.partition_point(|r| r.ino < ino);
		self.rows.insert(pos, DirInfo { ino, dotdot: 0, parent: 0 });
	}

	fn find_index(&self, ino: u32) -> Result<usize, usize> {
		self.rows.binary_search_by_key(&ino, |r| r.ino)
	}

	pub fn get(&self, ino: u32) -> Option<&DirInfo> {
		self.find_index(ino).ok().map(|i| &self.rows[i])
	}

	pub fn get_mut(&mut self, ino: u32) -> Option<&mut DirInfo> {
		match self.find_index(ino) {
			Ok(i) => Some(&mut self.rows[i]),
			Err(_) => None,
		}
	}

	pub fn set_dotdot(&mut self, ino: u32, dotdot: u32) {
		if let Some(row) = self.get_mut(ino) {
			row.dotdot = dotdot;
		}
	}

	pub fn set_parent(&mut self, ino: u32, parent: u32) {
		if let Some(row) = self.get_mut(ino) {
			row.parent = parent;
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = &DirInfo> {
		self.rows.iter()
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	/// Merges another table's rows in (used by Design Notes §9's prospective
	/// parallel-pass1 `Context::merge_dir_info`; single-worker runs simply
	/// never call this with a non-empty `other`).
	pub fn merge(&mut self, other: DirInfoTable) {
		for row in other.rows {
			self.add(row.ino);
			if row.dotdot != 0 {
				self.set_dotdot(row.ino, row.dotdot);
			}
			if row.parent != 0 {
				self.set_parent(row.ino, row.parent);
			}
		}
	}
}

/// An HTree ("indexed") directory awaiting a rehash pass (spec §4.8).
#[derive(Debug, Clone, Copy)]
pub struct DxDirInfo {
	pub ino: u32,
	pub hash_version: u8,
	/// Number of internal dx_root/dx_node blocks currently believed valid.
	pub indexed_blocks: u32,
	pub needs_rebuild: bool,
}

#[derive(Default)]
pub struct DxDirInfoTable {
	rows: Vec<DxDirInfo>,
}

impl DxDirInfoTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, ino: u32, hash_version: u8) {
		if self.find_index(ino).is_ok() {
			return;
		}
		let pos = self.rows.partition_point(|r| r.ino < ino);
		self.rows.insert(
			pos,
			DxDirInfo { ino, hash_version, indexed_blocks: 0, needs_rebuild: false },
		);
	}

	fn find_index(&self, ino: u32) -> Result<usize, usize> {
		self.rows.binary_search_by_key(&ino, |r| r.ino)
	}

	pub fn get(&self, ino: u32) -> Option<&DxDirInfo> {
		self.find_index(ino).ok().map(|i| &self.rows[i])
	}

	pub fn mark_needs_rebuild(&mut self, ino: u32) {
		if let Ok(i) = self.find_index(ino) {
			self.rows[i].needs_rebuild = true;
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = &DxDirInfo> {
		self.rows.iter()
	}
}
