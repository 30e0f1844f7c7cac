//! `checkfs`'s core: device I/O, on-disk codecs, and the five-pass check
//! engine. The binary in `src/main.rs` is a thin CLI wrapper around [`engine::run`].

pub mod bitmap;
pub mod context;
pub mod device;
pub mod dir_info;
pub mod dirent;
pub mod dup;
pub mod engine;
pub mod error;
pub mod group_desc;
pub mod icount;
pub mod inode;
pub mod journal;
pub mod killsector;
pub mod pass1;
pub mod pass1_dup;
pub mod pass2;
pub mod pass3;
pub mod pass4;
pub mod pass5;
pub mod problem;
pub mod rehash;
pub mod superblock;
pub mod util;

pub use error::CheckError;
