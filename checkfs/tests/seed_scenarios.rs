//! End-to-end runs of the full five-pass engine against small, hand-built
//! filesystem images, one per corruption seed scenario.

use checkfs::device::{BlockDevice, MemDevice};
use checkfs::dirent::{parse_block, write_block, DirEntry};
use checkfs::engine::{self, ExitCode, RunOptions};
use checkfs::group_desc::{self, GroupDescriptor};
use checkfs::inode::Inode;
use checkfs::pass1::ROOT_INODE;
use checkfs::problem::Policy;
use checkfs::superblock::Superblock;

const BLOCK_SIZE: u32 = 4096;
const TOTAL_BLOCKS: u64 = 64;
const TOTAL_INODES: u32 = 32;

const BLOCK_BITMAP_BLOCK: u32 = 2;
const INODE_BITMAP_BLOCK: u32 = 3;
const INODE_TABLE_BLOCK: u32 = 4;
const ROOT_BLOCK: u32 = 10;

/// Builds a one-group, 4096-byte-block filesystem image with a valid root
/// directory at block 10 containing only `.`/`..`, ready for a test to add
/// its own inodes and entries before running the engine.
fn fresh_fs() -> MemDevice {
    let mut sb: Superblock = unsafe { std::mem::zeroed() };
    sb.signature = checkfs::superblock::EXT2_SIGNATURE;
    sb.total_blocks = TOTAL_BLOCKS as u32;
    sb.total_inodes = TOTAL_INODES;
    sb.blocks_per_group = TOTAL_BLOCKS as u32;
    sb.inodes_per_group = TOTAL_INODES;
    sb.block_size_log = 2; // 4096
    sb.major_version = 1;
    sb.inode_size = 128;
    sb.mount_count_since_fsck = 1;
    sb.mount_count_before_fsck = 1;
    sb.fs_state = checkfs::superblock::FS_STATE_VALID;

    let groups = vec![GroupDescriptor {
        block_bitmap_block: BLOCK_BITMAP_BLOCK,
        inode_bitmap_block: INODE_BITMAP_BLOCK,
        inode_table_start_block: INODE_TABLE_BLOCK,
        free_blocks_count: 0,
        free_inodes_count: 0,
        used_dirs_count: 0,
        _padding: [0; 14],
    }];

    let mut dev = MemDevice::new(TOTAL_BLOCKS, BLOCK_SIZE);
    sb.write(&mut dev).unwrap();
    group_desc::write_all(&mut dev, &sb, &groups).unwrap();

    let mut root = Inode::default();
    root.mode = 0x4000 | 0o755;
    root.links_count = 2;
    root.block[0] = ROOT_BLOCK;
    root.size_low = BLOCK_SIZE;
    root.blocks_512 = BLOCK_SIZE / 512;
    root.write(&mut dev, ROOT_INODE, &sb, &groups).unwrap();

    let dot_block = checkfs::dirent::new_dot_block(BLOCK_SIZE as usize, ROOT_INODE, ROOT_INODE, false);
    dev.write_block(ROOT_BLOCK as u64, &dot_block).unwrap();

    dev
}

fn run_opts() -> RunOptions {
    RunOptions { policy: Policy::Interactive { assume: Some(true) }, verbose: false, force: true }
}

fn write_inode(dev: &mut MemDevice, ino: u32, inode: &Inode) {
    let sb = Superblock::read(dev).unwrap();
    let groups = group_desc::read_all(dev, &sb).unwrap();
    inode.write(dev, ino, &sb, &groups).unwrap();
}

fn read_inode(dev: &mut MemDevice, ino: u32) -> Inode {
    let sb = Superblock::read(dev).unwrap();
    let groups = group_desc::read_all(dev, &sb).unwrap();
    Inode::read(dev, ino, &sb, &groups).unwrap()
}

/// Appends one entry to the root directory block, consuming space from its
/// trailing empty record.
fn link_into_root(dev: &mut MemDevice, ino: u32, name: &str) {
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    dev.read_block(ROOT_BLOCK as u64, &mut block).unwrap();
    let (mut entries, _) = parse_block(&block);
    let needed = DirEntry::min_rec_len(name.len());
    let slot = entries.iter_mut().find(|e| e.is_deleted() && e.rec_len >= needed).expect("room in root block");
    let leftover = slot.rec_len - needed;
    let offset = slot.offset;
    slot.inode = ino;
    slot.rec_len = needed;
    slot.name = name.as_bytes().to_vec();
    if leftover > 0 {
        entries.push(DirEntry::empty(leftover, offset + needed as usize));
        entries.sort_by_key(|e| e.offset);
    }
    write_block(&mut block, &entries, false).unwrap();
    dev.write_block(ROOT_BLOCK as u64, &block).unwrap();
}

/// S1: two regular files claim the same data block. The engine must give the
/// duplicate a fresh block of its own so neither file's content is lost.
#[test]
fn s1_duplicate_block_is_cloned_apart() {
    let mut dev = fresh_fs();

    let shared_block = 20u32;
    let mut content = vec![0u8; BLOCK_SIZE as usize];
    content[0] = 0xab;
    dev.write_block(shared_block as u64, &content).unwrap();

    let mut a = Inode::default();
    a.mode = 0x8000 | 0o644;
    a.links_count = 1;
    a.block[0] = shared_block;
    a.size_low = BLOCK_SIZE;
    a.blocks_512 = BLOCK_SIZE / 512;
    write_inode(&mut dev, 11, &a);
    link_into_root(&mut dev, 11, "a");

    let mut b = Inode::default();
    b.mode = 0x8000 | 0o644;
    b.links_count = 1;
    b.block[0] = shared_block;
    b.size_low = BLOCK_SIZE;
    b.blocks_512 = BLOCK_SIZE / 512;
    write_inode(&mut dev, 12, &b);
    link_into_root(&mut dev, 12, "b");

    let report = engine::run(&mut dev, None, run_opts()).unwrap();
    assert!(report.exit_code.contains(ExitCode::CORRECTED));

    let a_after = read_inode(&mut dev, 11);
    let b_after = read_inode(&mut dev, 12);
    assert_ne!({ a_after.block[0] }, { b_after.block[0] }, "duplicate claimants must end up on distinct blocks");
}

/// S2: a directory with no path from the root gets linked into lost+found.
#[test]
fn s2_orphan_directory_reconnects() {
    let mut dev = fresh_fs();

    let orphan_block = 21u32;
    let mut orphan = Inode::default();
    orphan.mode = 0x4000 | 0o755;
    orphan.links_count = 2;
    orphan.block[0] = orphan_block;
    orphan.size_low = BLOCK_SIZE;
    orphan.blocks_512 = BLOCK_SIZE / 512;
    write_inode(&mut dev, 13, &orphan);

    let dot_block = checkfs::dirent::new_dot_block(BLOCK_SIZE as usize, 13, 13, false);
    dev.write_block(orphan_block as u64, &dot_block).unwrap();

    // Deliberately not linked from root: no entry anywhere references inode 13.

    let report = engine::run(&mut dev, None, run_opts()).unwrap();
    assert!(report.exit_code.contains(ExitCode::CORRECTED));

    let mut root_block = vec![0u8; BLOCK_SIZE as usize];
    dev.read_block(ROOT_BLOCK as u64, &mut root_block).unwrap();
    let (root_entries, _) = parse_block(&root_block);
    let lf = root_entries.iter().find(|e| e.name == b"lost+found").expect("lost+found created in root");

    let lf_inode = read_inode(&mut dev, lf.inode);
    let mut lf_block = vec![0u8; BLOCK_SIZE as usize];
    dev.read_block(lf_inode.block[0] as u64, &mut lf_block).unwrap();
    let (lf_entries, _) = parse_block(&lf_block);
    assert!(lf_entries.iter().any(|e| e.inode == 13 && e.name == b"#13"), "orphan must be relinked under lost+found");
}

/// S3: a directory block with a structurally corrupt record (bad `rec_len`)
/// gets salvaged rather than left unparseable.
#[test]
fn s3_corrupt_dirent_is_salvaged() {
    let mut dev = fresh_fs();

    let dir_block = 22u32;
    let mut dir = Inode::default();
    dir.mode = 0x4000 | 0o755;
    dir.links_count = 2;
    dir.block[0] = dir_block;
    dir.size_low = BLOCK_SIZE;
    dir.blocks_512 = BLOCK_SIZE / 512;
    write_inode(&mut dev, 14, &dir);
    link_into_root(&mut dev, 14, "subdir");

    // Write a block whose first record's rec_len is 3 (not a 4-byte multiple).
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    block[0..4].copy_from_slice(&14u32.to_le_bytes());
    block[4..6].copy_from_slice(&3u16.to_le_bytes());
    block[6] = 1;
    block[8] = b'.';
    dev.write_block(dir_block as u64, &block).unwrap();

    let report = engine::run(&mut dev, None, run_opts()).unwrap();
    assert!(report.exit_code.contains(ExitCode::CORRECTED));

    let mut fixed_block = vec![0u8; BLOCK_SIZE as usize];
    dev.read_block(dir_block as u64, &mut fixed_block).unwrap();
    let (entries, defect) = parse_block(&fixed_block);
    assert!(defect.is_none(), "salvaged block must parse cleanly");
    assert!(entries.iter().any(|e| e.is_dot() && e.inode == 14));
}

/// S4: an inode's on-disk link count disagrees with the number of directory
/// entries actually pointing at it.
#[test]
fn s4_link_count_is_corrected() {
    let mut dev = fresh_fs();

    let mut file = Inode::default();
    file.mode = 0x8000 | 0o644;
    file.links_count = 5; // only one entry will ever point at it
    file.block[0] = 23;
    file.size_low = BLOCK_SIZE;
    file.blocks_512 = BLOCK_SIZE / 512;
    write_inode(&mut dev, 15, &file);
    link_into_root(&mut dev, 15, "onelink");

    let report = engine::run(&mut dev, None, run_opts()).unwrap();
    assert!(report.exit_code.contains(ExitCode::CORRECTED));

    let after = read_inode(&mut dev, 15);
    assert_eq!(after.links_count, 1);
}

/// S5: the on-disk block bitmap has a stale bit set for a block nothing
/// actually uses; pass 5 must bring it back in line with what was observed.
#[test]
fn s5_stale_bitmap_bit_is_cleared() {
    let mut dev = fresh_fs();

    // Flip an arbitrary data-block bit on in the group's block bitmap even
    // though nothing claims that block.
    let mut bitmap = vec![0u8; BLOCK_SIZE as usize];
    dev.read_block(BLOCK_BITMAP_BLOCK as u64, &mut bitmap).unwrap();
    let stale_block = 40usize;
    bitmap[stale_block / 8] |= 1 << (stale_block % 8);
    dev.write_block(BLOCK_BITMAP_BLOCK as u64, &bitmap).unwrap();

    let report = engine::run(&mut dev, None, run_opts()).unwrap();
    assert!(report.exit_code.contains(ExitCode::CORRECTED));

    let mut after = vec![0u8; BLOCK_SIZE as usize];
    dev.read_block(BLOCK_BITMAP_BLOCK as u64, &mut after).unwrap();
    assert_eq!(after[stale_block / 8] & (1 << (stale_block % 8)), 0, "stale bit must be cleared to match actual usage");
}

/// A fully clean filesystem should report no corrections and a clean exit
/// code, exercising the no-op path through all five passes.
#[test]
fn clean_filesystem_reports_no_corrections() {
    let mut dev = fresh_fs();
    let report = engine::run(&mut dev, None, run_opts()).unwrap();
    assert!(!report.exit_code.contains(ExitCode::CORRECTED));
    assert!(!report.exit_code.contains(ExitCode::UNCORRECTED));
}
